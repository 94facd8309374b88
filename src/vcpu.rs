//! Virtual-CPU state and the VMCS bind/unbind protocol.
//!
//! A vCPU slot is pre-allocated with its virtual machine and stays inert
//! until `create` attaches a hardware control block. Every operation that
//! touches the vCPU first *binds* it: take the per-vCPU lock, disable
//! preemption, migrate the VMCS to the current physical CPU if needed
//! (clearing it on the old one first), and activate it. The resulting
//! [`LoadedVcpu`] is the only handle through which guest state is read or
//! written, so the VMCS, the register file and the lock always travel
//! together.

use crate::{
    emulate::MmioState,
    irq::{IrqState, NR_IRQ_WORDS},
    machine::Machine,
    mmu::TranslationCtx,
    port::{FxImage, GuestRegs, HwPort},
    vm::Vm,
    vm_control::{
        adjust_controls, VmcsEntryCtl, VmcsExitCtl, VmcsPinBasedVmexecCtl, VmcsProcBasedVmexecCtl,
        IA32_VMX_ENTRY_CTLS, IA32_VMX_EXIT_CTLS, IA32_VMX_PINBASED_CTLS, IA32_VMX_PROC_BASED_CTLS,
    },
    vmcs::{ActiveVmcs, Field, SegReg, VmcsRegion},
    x86::{
        self, DescriptorTable, Gpa, Reg, Segment, BP_VECTOR, DB_VECTOR, GP_VECTOR, PAGE_SHIFT,
        PF_VECTOR,
    },
    Result, VmxError,
};
use alloc::{boxed::Box, vec::Vec};
use spin::MutexGuard;

/// Architectural rdx value after reset: family/model/stepping of the
/// emulated part.
const CPUID_RESET_RDX: u64 = 0x600;
/// Guest rip at the architectural reset vector.
const RESET_RIP: u64 = 0xfff0;

// Real-mode TSS layout, parked in the top frames of memory slot 0 for
// interrupt redirection bookkeeping while the guest runs in vm86.
const TSS_BASE_SIZE: u64 = 0x68;
const TSS_REDIRECTION_SIZE: u64 = 256 / 8;
const TSS_IOPB_SIZE: u64 = 65536 / 8;
pub(crate) const RMODE_TSS_SIZE: u64 =
    TSS_BASE_SIZE + TSS_REDIRECTION_SIZE + TSS_IOPB_SIZE + 1;
pub(crate) const RMODE_TSS_PAGES: u64 = 3;
const TSS_IOPB_BASE_OFFSET: u64 = 0x66;

/// MSRs saved/restored across guest entry. The last two are switched
/// manually around each entry instead of through the hardware save lists.
const VMX_MSR_INDEX: [u32; 6] = [
    x86::MSR_EFER,
    x86::MSR_STAR,
    x86::MSR_CSTAR,
    x86::MSR_KERNEL_GS_BASE,
    x86::MSR_SYSCALL_MASK,
    x86::MSR_LSTAR,
];
pub(crate) const NR_BAD_MSRS: usize = 2;

/// One entry of the hardware MSR save/load area.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MsrEntry {
    pub index: u32,
    reserved: u32,
    pub data: u64,
}

/// Segment state stashed while real mode borrows the descriptor fields.
#[derive(Clone, Copy, Default)]
pub(crate) struct SavedSeg {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub ar: u32,
}

#[derive(Default)]
pub(crate) struct RealModeState {
    pub active: bool,
    pub tr: SavedSeg,
    pub save_iopl: u64,
    /// es, ds, fs, gs in that order.
    pub segs: [SavedSeg; 4],
}

#[derive(Clone, Copy, Default)]
pub struct Breakpoint {
    pub address: u64,
    pub enabled: bool,
}

#[derive(Clone, Copy, Default)]
pub struct DebugConfig {
    pub enabled: bool,
    pub breakpoints: [Breakpoint; 4],
    pub singlestep: bool,
}

#[derive(Default)]
pub(crate) struct DebugState {
    pub enabled: bool,
    pub bp: [u64; 4],
    pub singlestep: bool,
}

/// General registers exchanged with the controlling process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Regs {
    pub gprs: [u64; x86::NR_VCPU_REGS],
    pub rip: u64,
    pub rflags: u64,
}

/// Extended state exchanged with the controlling process.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SpecialRegs {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub tr: Segment,
    pub ldt: Segment,
    pub gdt: DescriptorTable,
    pub idt: DescriptorTable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub apic_base: u64,
    pub interrupt_bitmap: [u64; NR_IRQ_WORDS],
}

/// One schedulable guest execution context. Only ever accessed through its
/// lock; register-file contents are authoritative only inside a bind
/// bracket.
pub struct Vcpu {
    /// Physical CPU this vCPU's VMCS last lived on.
    pub(crate) cpu: Option<usize>,
    pub(crate) vmcs: Option<Box<VmcsRegion>>,
    pub(crate) launched: bool,
    pub(crate) regs: GuestRegs,
    pub(crate) cr0: u64,
    pub(crate) cr3: u64,
    pub(crate) cr4: u64,
    pub(crate) cr8: u64,
    pub(crate) shadow_efer: u64,
    pub(crate) apic_base: u64,
    pub(crate) rmode: RealModeState,
    pub(crate) guest_fx: FxImage,
    pub(crate) host_fx: FxImage,
    pub(crate) guest_msrs: Vec<MsrEntry>,
    pub(crate) host_msrs: Vec<MsrEntry>,
    pub(crate) irq: IrqState,
    pub(crate) mmio: MmioState,
    pub(crate) debug: DebugState,
    /// Log-once latch for emulation failures.
    pub(crate) reported_emulation_failure: bool,
}

impl Vcpu {
    pub(crate) fn new() -> Self {
        Self {
            cpu: None,
            vmcs: None,
            launched: false,
            regs: GuestRegs::zeroed(),
            cr0: 0,
            cr3: 0,
            cr4: 0,
            cr8: 0,
            shadow_efer: 0,
            apic_base: 0,
            rmode: RealModeState::default(),
            guest_fx: FxImage::zeroed(),
            host_fx: FxImage::zeroed(),
            guest_msrs: Vec::new(),
            host_msrs: Vec::new(),
            irq: IrqState::new(),
            mmio: MmioState::default(),
            debug: DebugState::default(),
            reported_emulation_failure: false,
        }
    }

    pub(crate) fn find_msr(&mut self, index: u32) -> Option<&mut MsrEntry> {
        self.guest_msrs.iter_mut().find(|e| e.index == index)
    }
}

/// A vCPU bound to the current physical CPU: lock held, preemption off,
/// VMCS active. Dropping it re-enables preemption and releases the lock.
pub struct LoadedVcpu<'a, H: HwPort> {
    pub(crate) vm: &'a Vm<H>,
    pub(crate) vcpu: MutexGuard<'a, Vcpu>,
    pub(crate) vmcs: ActiveVmcs<'a, H>,
    pub(crate) id: usize,
}

impl<H: HwPort> Drop for LoadedVcpu<'_, H> {
    fn drop(&mut self) {
        self.vm.machine().hw().enable_preemption();
    }
}

/// Bind vCPU `id`, migrating its VMCS to the calling physical CPU when the
/// last run happened elsewhere. Blocks on the per-vCPU lock.
pub(crate) fn bind<'a, H: HwPort>(vm: &'a Vm<H>, id: usize) -> Result<LoadedVcpu<'a, H>> {
    let guard = vm.vcpu_slot(id)?.lock();
    if guard.vmcs.is_none() {
        return Err(VmxError::NotCreated);
    }
    let hw = vm.machine().hw();
    hw.disable_preemption();
    // From here on, Drop restores preemption on any early return.
    let mut loaded = LoadedVcpu {
        vm,
        vcpu: guard,
        vmcs: ActiveVmcs::new(hw),
        id,
    };
    loaded.activate()?;
    Ok(loaded)
}

/// Attach a hardware control block to vCPU `id` and run one-time setup.
pub(crate) fn create<H: HwPort>(vm: &Vm<H>, id: usize) -> Result<()> {
    {
        let mut guard = vm.vcpu_slot(id)?.lock();
        if guard.vmcs.is_some() {
            return Err(VmxError::AlreadyExists);
        }
        let region = VmcsRegion::try_boxed(vm.machine().revision_id())?;
        vm.machine()
            .hw()
            .vmclear(&region)
            .map_err(VmxError::VmxFailure)?;
        guard.vmcs = Some(region);
        guard.launched = false;
    }
    let mut loaded = bind(vm, id)?;
    if let Err(e) = loaded.setup() {
        // Leave no half-bound control block behind.
        loaded.discard();
        return Err(e);
    }
    Ok(())
}

impl<'a, H: HwPort> LoadedVcpu<'a, H> {
    pub(crate) fn machine(&self) -> &'a Machine<H> {
        self.vm.machine()
    }

    pub(crate) fn hw(&self) -> &'a H {
        self.vm.machine().hw()
    }

    /// Read a general register, with rsp routed to its VMCS field.
    pub(crate) fn reg(&self, r: Reg) -> Result<u64> {
        match r {
            Reg::Rsp => self.vmcs.read(Field::GuestRsp),
            _ => Ok(self.vcpu.regs.gprs[r as usize]),
        }
    }

    pub(crate) fn set_reg(&mut self, r: Reg, value: u64) -> Result<()> {
        match r {
            Reg::Rsp => self.vmcs.write(Field::GuestRsp, value),
            _ => {
                self.vcpu.regs.gprs[r as usize] = value;
                Ok(())
            }
        }
    }

    /// Make this vCPU's VMCS current on the executing physical CPU,
    /// migrating it when the last run happened elsewhere. Called with
    /// preemption disabled.
    pub(crate) fn activate(&mut self) -> Result<()> {
        let hw = self.hw();
        let cpu = hw.current_cpu();
        let migrated = self.vcpu.cpu != Some(cpu);
        if migrated {
            // A VMCS must be cleared on its old CPU before being loaded
            // here, and a cleared block needs a fresh vmlaunch.
            if let (Some(old), Some(region)) = (self.vcpu.cpu, self.vcpu.vmcs.as_deref()) {
                self.vm.machine().clear_vmcs_on(old, region)?;
            }
            self.vcpu.launched = false;
        }
        if let Some(region) = self.vcpu.vmcs.as_deref() {
            if self.vm.machine().current_vmcs(cpu) != region.address() {
                hw.vmptrld(region).map_err(VmxError::VmxFailure)?;
                self.vm.machine().set_current_vmcs(cpu, region.address());
            }
        }
        if migrated {
            self.refresh_host_context()?;
            self.vcpu.cpu = Some(cpu);
        }
        Ok(())
    }

    pub(crate) fn translation_ctx(&self) -> TranslationCtx<'a> {
        TranslationCtx {
            memory: self.vm.memory(),
            cr0: self.vcpu.cr0,
            cr3: self.vcpu.cr3,
            cr4: self.vcpu.cr4,
            efer: self.vcpu.shadow_efer,
        }
    }

    /// Drop cached translations for this vCPU.
    pub(crate) fn reset_translation(&self) {
        self.vm.translator().reset_context(&self.translation_ctx());
    }

    /// Tear down a partially created vCPU: clear the VMCS and detach it.
    fn discard(&mut self) {
        let hw = self.hw();
        if let Some(region) = self.vcpu.vmcs.as_deref() {
            let cpu = hw.current_cpu();
            if self.vm.machine().current_vmcs(cpu) == region.address() {
                self.vm.machine().set_current_vmcs(cpu, 0);
            }
            let _ = hw.vmclear(region);
        }
        self.vcpu.vmcs = None;
        self.vcpu.cpu = None;
        self.vcpu.launched = false;
    }

    /// Host context fields that differ between physical CPUs and are not
    /// captured by the hardware on exit.
    fn refresh_host_context(&mut self) -> Result<()> {
        let st = self.hw().host_state();
        self.vmcs.write(Field::HostTrBase, st.tr_base)?;
        self.vmcs.write(Field::HostGdtrBase, st.gdt_base)?;
        self.vmcs.write(Field::HostSysenterEsp, st.sysenter_esp)
    }

    /// One-time reset-state setup, run exactly once at creation.
    fn setup(&mut self) -> Result<()> {
        let hw = self.hw();

        self.vcpu.regs = GuestRegs::zeroed();
        self.vcpu.regs.gprs[Reg::Rdx as usize] = CPUID_RESET_RDX;
        self.vcpu.cr8 = 0;
        self.vcpu.apic_base = 0xfee0_0000 | (1 << 11) | (1 << 8);

        self.init_rmode_tss()?;
        self.setup_guest_state()?;
        self.setup_controls()?;
        self.setup_host_state()?;
        self.setup_msrs()?;
        self.fx_init();

        // Guest time-stamp counter starts at zero.
        let tsc = hw.read_tsc();
        self.vmcs.write(Field::TscOffset, (tsc as i64).wrapping_neg() as u64)?;

        self.vmcs
            .write(Field::Cr0GuestHostMask, crate::modes::CR0_GUEST_HOST_MASK)?;
        self.vmcs
            .write(Field::Cr4GuestHostMask, crate::modes::CR4_GUEST_HOST_MASK)?;

        // Reset enters real mode: CD and NW set, ET set, everything else
        // clear.
        self.vcpu.cr3 = 0;
        self.vmcs.write(Field::GuestCr3, 0)?;
        self.apply_cr0(0x6000_0010)?;
        self.apply_cr4(0)?;
        self.apply_efer(0)?;
        self.reset_translation();
        Ok(())
    }

    /// Install the real-mode TSS region into the top frames of slot 0:
    /// zero-filled, I/O-map base fixed, all-ones terminator byte.
    fn init_rmode_tss(&mut self) -> Result<()> {
        let (base_gfn, npages) = self
            .vm
            .memory()
            .slot0_range()
            .ok_or(VmxError::InvalidArgument)?;
        let span_pages = core::cmp::min(RMODE_TSS_PAGES, npages);
        let tss_gfn = base_gfn + npages - span_pages;
        let base = Gpa::new(tss_gfn << PAGE_SHIFT);
        let span = span_pages << PAGE_SHIFT;

        let zeros = [0u8; 512];
        let mut off = 0u64;
        while off < span {
            if self.vm.memory().write(base + off, &zeros) != zeros.len() {
                return Err(VmxError::OutOfMemory);
            }
            off += zeros.len() as u64;
        }
        let size = (RMODE_TSS_SIZE as u16).to_le_bytes();
        if self.vm.memory().write(base + TSS_IOPB_BASE_OFFSET, &size) != size.len() {
            return Err(VmxError::OutOfMemory);
        }
        let end = core::cmp::min(RMODE_TSS_SIZE, span);
        if self.vm.memory().write(base + (end - 1), &[0xff]) != 1 {
            return Err(VmxError::OutOfMemory);
        }
        Ok(())
    }

    fn setup_guest_state(&mut self) -> Result<()> {
        let flat = |selector: u16, type_: u8| Segment {
            base: 0,
            limit: 0xffff,
            selector,
            type_,
            present: true,
            s: true,
            ..Segment::default()
        };
        // The reset vector lives at the top of the first megabyte.
        let mut cs = flat(0xf000, 0xb);
        cs.base = 0xf0000;
        self.vmcs.set_segment(SegReg::Cs, &cs)?;
        for seg in [SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs, SegReg::Ss] {
            self.vmcs.set_segment(seg, &flat(0, 0x3))?;
        }
        let sys = |type_: u8| Segment {
            limit: 0xffff,
            type_,
            present: true,
            ..Segment::default()
        };
        self.vmcs.set_segment(SegReg::Tr, &sys(0xb))?;
        self.vmcs.set_segment(SegReg::Ldtr, &sys(0x2))?;

        self.vmcs.write(Field::GuestGdtrBase, 0)?;
        self.vmcs.write(Field::GuestGdtrLimit, 0xffff)?;
        self.vmcs.write(Field::GuestIdtrBase, 0)?;
        self.vmcs.write(Field::GuestIdtrLimit, 0xffff)?;

        self.vmcs.write(Field::GuestRflags, 0x02)?;
        self.vmcs.write(Field::GuestRip, RESET_RIP)?;
        self.vmcs.write(Field::GuestRsp, 0)?;
        self.vmcs.write(Field::GuestDr7, 0x400)?;
        self.vmcs.write(Field::GuestIa32Debugctl, 0)?;
        self.vmcs.write(Field::GuestSysenterCs, 0)?;
        self.vmcs.write(Field::GuestSysenterEsp, 0)?;
        self.vmcs.write(Field::GuestSysenterEip, 0)?;
        self.vmcs.write(Field::GuestActivityState, 0)?;
        self.vmcs.write(Field::GuestInterruptibilityState, 0)?;
        self.vmcs.write(Field::GuestPendingDebugExceptions, 0)?;
        self.vmcs.write(Field::VmcsLinkPointer, !0u64)
    }

    fn setup_controls(&mut self) -> Result<()> {
        let hw = self.hw();
        let pin = adjust_controls(
            (VmcsPinBasedVmexecCtl::EXTERNAL_INTERRUPT_EXITING | VmcsPinBasedVmexecCtl::NMI_EXITING)
                .bits(),
            hw.rdmsr(IA32_VMX_PINBASED_CTLS),
        );
        self.vmcs.write(Field::PinBasedVmexecControl, pin as u64)?;
        let proc = adjust_controls(
            (VmcsProcBasedVmexecCtl::HLT_EXITING
                | VmcsProcBasedVmexecCtl::USETSCOFF
                | VmcsProcBasedVmexecCtl::INVLPGEXIT
                | VmcsProcBasedVmexecCtl::MOVDREXIT
                | VmcsProcBasedVmexecCtl::CR8LOADEXIT
                | VmcsProcBasedVmexecCtl::CR8STOREEXIT
                | VmcsProcBasedVmexecCtl::UNCONDIOEXIT)
                .bits(),
            hw.rdmsr(IA32_VMX_PROC_BASED_CTLS),
        );
        self.vmcs.write(Field::ProcBasedVmexecControl, proc as u64)?;
        let exit = adjust_controls(
            (VmcsExitCtl::HOST_ADDRESS_SPACE_SIZE | VmcsExitCtl::ACK_INTR_ON_EXIT).bits(),
            hw.rdmsr(IA32_VMX_EXIT_CTLS),
        );
        self.vmcs.write(Field::VmexitControls, exit as u64)?;
        let entry = adjust_controls(
            VmcsEntryCtl::empty().bits(),
            hw.rdmsr(IA32_VMX_ENTRY_CTLS),
        );
        self.vmcs.write(Field::VmentryControls, entry as u64)?;

        self.update_exception_bitmap()?;
        self.vmcs.write(Field::PageFaultErrorCodeMask, 0)?;
        self.vmcs.write(Field::PageFaultErrorCodeMatch, 0)?;
        self.vmcs.write(Field::Cr3TargetCount, 0)
    }

    pub(crate) fn update_exception_bitmap(&mut self) -> Result<()> {
        let mut eb = (1u64 << PF_VECTOR) | (1 << GP_VECTOR);
        if self.vcpu.debug.enabled {
            eb |= (1 << DB_VECTOR) | (1 << BP_VECTOR);
        }
        self.vmcs.write(Field::ExceptionBitmap, eb)
    }

    fn setup_host_state(&mut self) -> Result<()> {
        let hw = self.hw();
        let st = hw.host_state();
        self.vmcs
            .write(Field::HostCsSelector, st.cs_selector as u64)?;
        self.vmcs
            .write(Field::HostDsSelector, st.ds_selector as u64)?;
        self.vmcs
            .write(Field::HostEsSelector, st.es_selector as u64)?;
        self.vmcs
            .write(Field::HostSsSelector, st.ss_selector as u64)?;
        self.vmcs
            .write(Field::HostTrSelector, st.tr_selector as u64)?;
        self.vmcs.write(Field::HostTrBase, st.tr_base)?;
        self.vmcs.write(Field::HostGdtrBase, st.gdt_base)?;
        self.vmcs.write(Field::HostIdtrBase, st.idt_base)?;
        self.vmcs.write(Field::HostCr0, st.cr0)?;
        self.vmcs.write(Field::HostCr3, st.cr3)?;
        self.vmcs.write(Field::HostCr4, st.cr4)?;
        self.vmcs.write(Field::HostSysenterCs, st.sysenter_cs)?;
        self.vmcs.write(Field::HostSysenterEsp, st.sysenter_esp)?;
        self.vmcs.write(Field::HostSysenterEip, st.sysenter_eip)?;
        self.vmcs.write(Field::HostRip, hw.host_entry_point())
    }

    /// Build the guest/host MSR save lists: every readable MSR's current
    /// host value becomes the guest's initial value.
    fn setup_msrs(&mut self) -> Result<()> {
        let hw = self.hw();
        let mut guest = Vec::new();
        let mut host = Vec::new();
        guest
            .try_reserve_exact(VMX_MSR_INDEX.len())
            .map_err(|_| VmxError::OutOfMemory)?;
        host.try_reserve_exact(VMX_MSR_INDEX.len())
            .map_err(|_| VmxError::OutOfMemory)?;
        for &index in VMX_MSR_INDEX.iter() {
            if let Some(data) = hw.rdmsr_safe(index) {
                guest.push(MsrEntry {
                    index,
                    reserved: 0,
                    data,
                });
                host.push(MsrEntry {
                    index,
                    reserved: 0,
                    data,
                });
            }
        }
        // The first NR_BAD_MSRS entries are switched by hand around each
        // entry; only the rest go through the hardware save/load areas.
        let off = core::cmp::min(NR_BAD_MSRS, guest.len());
        let auto = (guest.len() - off) as u64;
        self.vmcs
            .write(Field::VmexitMsrStoreAddr, guest[off..].as_ptr() as u64)?;
        self.vmcs.write(Field::VmexitMsrStoreCount, auto)?;
        self.vmcs
            .write(Field::VmexitMsrLoadAddr, host[off..].as_ptr() as u64)?;
        self.vmcs.write(Field::VmexitMsrLoadCount, auto)?;
        self.vmcs
            .write(Field::VmentryMsrLoadAddr, guest[off..].as_ptr() as u64)?;
        self.vmcs.write(Field::VmentryMsrLoadCount, auto)?;
        self.vcpu.guest_msrs = guest;
        self.vcpu.host_msrs = host;
        Ok(())
    }

    /// Capture host FPU state, snapshot a pristine guest image and patch
    /// its mxcsr to the architectural default.
    fn fx_init(&mut self) {
        let hw = self.hw();
        let mut host_fx = FxImage::zeroed();
        let mut guest_fx = FxImage::zeroed();
        hw.fpu_save(&mut host_fx);
        hw.fpu_reset();
        hw.fpu_save(&mut guest_fx);
        hw.fpu_restore(&host_fx);
        guest_fx.set_mxcsr(0x1f80);
        self.vcpu.host_fx = host_fx;
        self.vcpu.guest_fx = guest_fx;
    }

    pub fn get_regs(&self) -> Result<Regs> {
        let mut regs = Regs {
            gprs: self.vcpu.regs.gprs,
            rip: self.vmcs.read(Field::GuestRip)?,
            rflags: self.vmcs.read(Field::GuestRflags)?,
        };
        regs.gprs[Reg::Rsp as usize] = self.vmcs.read(Field::GuestRsp)?;
        // Hide the trap and resume flags forced by single-stepping.
        if self.vcpu.debug.singlestep {
            regs.rflags &= !(x86::Rflags::TF | x86::Rflags::RF).bits();
        }
        Ok(regs)
    }

    pub fn set_regs(&mut self, regs: &Regs) -> Result<()> {
        self.vcpu.regs.gprs = regs.gprs;
        self.vmcs
            .write(Field::GuestRsp, regs.gprs[Reg::Rsp as usize])?;
        self.vmcs.write(Field::GuestRip, regs.rip)?;
        self.vmcs.write(Field::GuestRflags, regs.rflags)
    }

    pub fn get_sregs(&self) -> Result<SpecialRegs> {
        Ok(SpecialRegs {
            cs: self.vmcs.segment(SegReg::Cs)?,
            ds: self.vmcs.segment(SegReg::Ds)?,
            es: self.vmcs.segment(SegReg::Es)?,
            fs: self.vmcs.segment(SegReg::Fs)?,
            gs: self.vmcs.segment(SegReg::Gs)?,
            ss: self.vmcs.segment(SegReg::Ss)?,
            tr: self.vmcs.segment(SegReg::Tr)?,
            ldt: self.vmcs.segment(SegReg::Ldtr)?,
            gdt: DescriptorTable {
                base: self.vmcs.read(Field::GuestGdtrBase)?,
                limit: self.vmcs.read(Field::GuestGdtrLimit)? as u16,
            },
            idt: DescriptorTable {
                base: self.vmcs.read(Field::GuestIdtrBase)?,
                limit: self.vmcs.read(Field::GuestIdtrLimit)? as u16,
            },
            cr0: self.vcpu.cr0,
            cr2: self.vcpu.regs.cr2,
            cr3: self.vcpu.cr3,
            cr4: self.vcpu.cr4,
            cr8: self.vcpu.cr8,
            efer: self.vcpu.shadow_efer,
            apic_base: self.vcpu.apic_base,
            interrupt_bitmap: self.vcpu.irq.pending,
        })
    }

    /// Install extended state supplied by the controlling process. Values
    /// are applied directly; validation and fault injection are for guest
    /// writes, not host ones.
    pub fn set_sregs(&mut self, sregs: &SpecialRegs) -> Result<()> {
        self.vmcs.set_segment(SegReg::Cs, &sregs.cs)?;
        self.vmcs.set_segment(SegReg::Ds, &sregs.ds)?;
        self.vmcs.set_segment(SegReg::Es, &sregs.es)?;
        self.vmcs.set_segment(SegReg::Fs, &sregs.fs)?;
        self.vmcs.set_segment(SegReg::Gs, &sregs.gs)?;
        self.vmcs.set_segment(SegReg::Ss, &sregs.ss)?;
        self.vmcs.set_segment(SegReg::Tr, &sregs.tr)?;
        self.vmcs.set_segment(SegReg::Ldtr, &sregs.ldt)?;
        self.vmcs.write(Field::GuestGdtrBase, sregs.gdt.base)?;
        self.vmcs
            .write(Field::GuestGdtrLimit, sregs.gdt.limit as u64)?;
        self.vmcs.write(Field::GuestIdtrBase, sregs.idt.base)?;
        self.vmcs
            .write(Field::GuestIdtrLimit, sregs.idt.limit as u64)?;
        self.vcpu.regs.cr2 = sregs.cr2;
        self.vcpu.cr8 = sregs.cr8;
        self.vcpu.apic_base = sregs.apic_base;
        self.apply_efer(sregs.efer)?;
        self.apply_cr0(sregs.cr0)?;
        self.vcpu.cr3 = sregs.cr3;
        self.vmcs.write(Field::GuestCr3, sregs.cr3)?;
        self.apply_cr4(sregs.cr4)?;
        self.vcpu.irq.load(&sregs.interrupt_bitmap);
        self.reset_translation();
        Ok(())
    }

    /// Configure guest debugging: up to four hardware breakpoints and
    /// single-step.
    pub fn set_debug(&mut self, cfg: &DebugConfig) -> Result<()> {
        let mut dr7 = 0x400u64;
        let mut state = DebugState::default();
        if cfg.enabled {
            state.enabled = true;
            for (i, bp) in cfg.breakpoints.iter().enumerate() {
                if bp.enabled {
                    state.bp[i] = bp.address;
                    // Global-enable bit for this slot; length/type 0 means
                    // one-byte execute.
                    dr7 |= 2 << (i * 2);
                }
            }
            state.singlestep = cfg.singlestep;
        }
        self.vcpu.debug = state;
        self.update_exception_bitmap()?;
        self.vmcs.write(Field::GuestDr7, dr7)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::new_test_vm;
    use crate::x86::Rflags;

    #[test]
    fn create_twice_is_an_error() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        assert_eq!(vm.create_vcpu(0), Err(VmxError::AlreadyExists));
    }

    #[test]
    fn create_out_of_range_index_is_rejected() {
        let vm = new_test_vm(0x4000);
        assert_eq!(vm.create_vcpu(usize::MAX), Err(VmxError::InvalidArgument));
    }

    #[test]
    fn create_without_slot0_fails_cleanly() {
        let vm = crate::testing::new_empty_test_vm();
        assert_eq!(vm.create_vcpu(0), Err(VmxError::InvalidArgument));
        // The failure rolled the control block back; a retry after mapping
        // memory succeeds.
        vm.set_memory_region(0, Gpa::new(0), 0x4000, crate::memory::SlotFlags::empty())
            .unwrap();
        vm.create_vcpu(0).unwrap();
    }

    #[test]
    fn reset_state_matches_architecture() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let regs = vm.get_regs(0).unwrap();
        assert_eq!(regs.rip, 0xfff0);
        assert_eq!(regs.rflags, 0x02);
        assert_eq!(regs.gprs[Reg::Rdx as usize], 0x600);
        let sregs = vm.get_sregs(0).unwrap();
        assert_eq!(sregs.cs.selector, 0xf000);
        assert_eq!(sregs.cs.base, 0xf0000);
        // Reset enters real mode through the full state machine.
        assert_eq!(sregs.cr0 & x86::Cr0::PE.bits(), 0);
        assert_eq!(sregs.efer, 0);
    }

    #[test]
    fn regs_round_trip_exactly() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut regs = vm.get_regs(0).unwrap();
        regs.gprs[Reg::Rax as usize] = 0xdead_beef;
        regs.gprs[Reg::Rsp as usize] = 0x8000;
        regs.rip = 0x1234;
        regs.rflags = 0x202;
        vm.set_regs(0, &regs).unwrap();
        assert_eq!(vm.get_regs(0).unwrap(), regs);
    }

    #[test]
    fn sregs_round_trip_exactly() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut sregs = vm.get_sregs(0).unwrap();
        sregs.cr8 = 0x3;
        sregs.apic_base = 0xfee0_0900;
        sregs.interrupt_bitmap[1] = 1 << 6;
        vm.set_sregs(0, &sregs).unwrap();
        assert_eq!(vm.get_sregs(0).unwrap(), sregs);
    }

    #[test]
    fn singlestep_masks_trap_flags_from_get_regs() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        vm.set_debug(
            0,
            &DebugConfig {
                enabled: true,
                singlestep: true,
                ..DebugConfig::default()
            },
        )
        .unwrap();
        let mut regs = vm.get_regs(0).unwrap();
        regs.rflags |= (Rflags::TF | Rflags::RF).bits();
        vm.set_regs(0, &regs).unwrap();
        let seen = vm.get_regs(0).unwrap();
        assert_eq!(seen.rflags & (Rflags::TF | Rflags::RF).bits(), 0);
    }
}
