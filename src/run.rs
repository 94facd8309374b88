//! The guest entry/exit cycle and the exit-reason dispatcher.
//!
//! One `run` call drives a virtual CPU until something needs the controlling
//! process: an I/O or MMIO access, a halt, a debug trap, an exception the
//! guest cannot take, or an exit reason the engine does not dispatch. Exits
//! the engine can service itself (page faults the translator fixes,
//! control-register writes, MSR accesses, interrupt windows) are handled in
//! place and the guest resumes; between handled exits the loop yields the
//! processor and honors an external interruption request.

use crate::{
    emulate::EmulationOutcome,
    mmu::Translation,
    port::HwPort,
    vcpu::{self, LoadedVcpu, NR_BAD_MSRS},
    vm::Vm,
    vm_control::VmcsProcBasedVmexecCtl,
    vmcs::{
        BasicExitReason, Field, INTR_INFO_DELIVER_CODE_MASK, INTR_INFO_TYPE_MASK,
        INTR_INFO_VALID_MASK, INTR_INFO_VECTOR_MASK, INTR_TYPE_EXT_INTR,
        INTR_TYPE_HARD_EXCEPTION, INTR_TYPE_NMI,
    },
    x86::{Gva, Reg, Rflags, DB_VECTOR, GP_VECTOR, PF_VECTOR},
    Result, VmxError,
};
use core::sync::atomic::Ordering;
use iced_x86::{Decoder, DecoderOptions, Register};

/// Direction of a guest port I/O access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    In,
    Out,
}

/// Completion state carried into a `run` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunParams {
    /// Retire the instruction that caused the previous exit before
    /// resuming (the controlling process serviced it).
    pub skip_instruction: bool,
    /// Data answering the MMIO read surfaced by the previous exit.
    pub mmio_read: Option<[u8; 8]>,
}

/// Why `run` returned to the controlling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// An exit reason with no handler; carries the raw hardware reason.
    Unknown { hardware_reason: u64 },
    /// The processor refused the VM entry.
    FailEntry {
        error: crate::vmcs::InstructionError,
    },
    /// An exception the engine could not resolve.
    Exception { vector: u8, error_code: u32 },
    /// A port I/O access. `value` holds rax for the register forms;
    /// `address` and `count` describe the string forms.
    Io {
        direction: IoDirection,
        size: u8,
        port: u16,
        string: bool,
        rep: bool,
        down: bool,
        value: u64,
        address: u64,
        count: u64,
    },
    /// A memory access outside guest RAM, staged by the emulator.
    Mmio {
        phys_addr: u64,
        data: [u8; 8],
        len: usize,
        is_write: bool,
    },
    /// The guest executed cpuid; the controlling process emulates it.
    Cpuid,
    /// A debug or breakpoint trap under guest debugging.
    Debug,
    /// The guest halted with no deliverable interrupt.
    Hlt,
}

fn is_page_fault(intr_info: u64) -> bool {
    intr_info & (INTR_INFO_TYPE_MASK | INTR_INFO_VECTOR_MASK | INTR_INFO_VALID_MASK)
        == INTR_TYPE_HARD_EXCEPTION | PF_VECTOR as u64 | INTR_INFO_VALID_MASK
}

fn is_external_interrupt(info: u64) -> bool {
    info & (INTR_INFO_TYPE_MASK | INTR_INFO_VALID_MASK)
        == INTR_TYPE_EXT_INTR | INTR_INFO_VALID_MASK
}

impl<H: HwPort> Vm<H> {
    /// Run vCPU `id` until it needs the controlling process.
    pub fn run(&self, id: usize, params: &RunParams) -> Result<RunExit> {
        let mut v = vcpu::bind(self, id)?;
        v.run_loop(params)
    }
}

impl<H: HwPort> LoadedVcpu<'_, H> {
    fn run_loop(&mut self, params: &RunParams) -> Result<RunExit> {
        if params.skip_instruction {
            self.vmcs.skip_instruction()?;
        }
        if let Some(data) = params.mmio_read {
            self.vcpu.mmio.data = data;
            self.vcpu.mmio.read_completed = true;
        }
        self.vcpu.mmio.needed = false;

        let hw = self.hw();
        loop {
            // Hardware refuses host fs/gs selectors with nonzero RPL or TI
            // bits; substitute null selectors and restore by hand after the
            // exit.
            let (fs, gs) = hw.read_fs_gs();
            let reload_needed = (fs & 7) != 0 || (gs & 7) != 0;
            if reload_needed {
                self.vmcs.write(Field::HostFsSelector, 0)?;
                self.vmcs.write(Field::HostGsSelector, 0)?;
            } else {
                self.vmcs.write(Field::HostFsSelector, fs as u64)?;
                self.vmcs.write(Field::HostGsSelector, gs as u64)?;
            }
            self.vmcs
                .write(Field::HostFsBase, hw.rdmsr(crate::x86::MSR_FS_BASE))?;
            self.vmcs
                .write(Field::HostGsBase, hw.rdmsr(crate::x86::MSR_GS_BASE))?;

            if self.vcpu.irq.any() && !self.event_staged()? {
                self.try_inject_irq()?;
            }
            if self.vcpu.debug.enabled {
                self.guest_debug_pre()?;
            }

            hw.fpu_save(&mut self.vcpu.host_fx);
            hw.fpu_restore(&self.vcpu.guest_fx);
            for e in self.vcpu.host_msrs.iter_mut() {
                e.data = hw.rdmsr(e.index);
            }
            for e in self.vcpu.guest_msrs.iter().take(NR_BAD_MSRS) {
                hw.wrmsr(e.index, e.data);
            }

            let launched = self.vcpu.launched;
            let entry = hw.guest_enter(launched, &mut self.vcpu.regs);
            self.vm.stats().exits.fetch_add(1, Ordering::Relaxed);

            for e in self.vcpu.guest_msrs.iter_mut().take(NR_BAD_MSRS) {
                e.data = hw.rdmsr(e.index);
            }
            for e in self.vcpu.host_msrs.iter().take(NR_BAD_MSRS) {
                hw.wrmsr(e.index, e.data);
            }
            hw.fpu_save(&mut self.vcpu.guest_fx);
            hw.fpu_restore(&self.vcpu.host_fx);

            if let Err(error) = entry {
                return Ok(RunExit::FailEntry { error });
            }
            if reload_needed {
                hw.load_fs_gs(fs, gs);
                hw.wrmsr(
                    crate::x86::MSR_GS_BASE,
                    self.vmcs.read(Field::HostGsBase)?,
                );
                // The guest run left the task descriptor marked busy.
                hw.reload_tss();
            }
            self.vcpu.launched = true;

            if let Some(exit) = self.dispatch()? {
                return Ok(exit);
            }
            self.reschedule_window()?;
        }
    }

    /// True when an event is already staged for injection on the next entry.
    fn event_staged(&self) -> Result<bool> {
        Ok(self.vmcs.read(Field::VmentryInterruptionInfo)? & INTR_INFO_VALID_MASK != 0)
    }

    fn guest_debug_pre(&mut self) -> Result<()> {
        self.hw().load_debug_regs(&self.vcpu.debug.bp);
        if self.vcpu.debug.singlestep {
            let flags = self.vmcs.read(Field::GuestRflags)?;
            self.vmcs
                .write(Field::GuestRflags, flags | (Rflags::TF | Rflags::RF).bits())?;
        }
        Ok(())
    }

    /// Give the host scheduler a chance between handled exits, then make
    /// the VMCS current again (the thread may have moved).
    fn reschedule_window(&mut self) -> Result<()> {
        let hw = self.hw();
        hw.enable_preemption();
        hw.yield_cpu();
        let interrupted = hw.interrupted();
        hw.disable_preemption();
        if interrupted {
            self.vm
                .stats()
                .interrupted_exits
                .fetch_add(1, Ordering::Relaxed);
            return Err(VmxError::Interrupted);
        }
        self.activate()
    }

    /// Classify the exit and run its handler. `Some` surfaces to the
    /// controlling process, `None` resumes the guest.
    fn dispatch(&mut self) -> Result<Option<RunExit>> {
        let raw = self.vmcs.read(Field::VmexitReason)?;
        let reason = BasicExitReason::try_from((raw & 0xffff) as u16);
        let vectoring = self.vmcs.read(Field::IdtVectoringInfo)?;
        if vectoring & INTR_INFO_VALID_MASK != 0
            && reason != Ok(BasicExitReason::ExceptionOrNmi)
        {
            log::warn!(
                "valid vectoring info with unexpected exit reason 0x{:x}",
                raw
            );
        }
        match reason {
            Ok(BasicExitReason::ExceptionOrNmi) => self.handle_exception(),
            Ok(BasicExitReason::ExternalInterrupt) => {
                self.vm.stats().irq_exits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(RunExit::Unknown {
                    hardware_reason: raw,
                }))
            }
            Ok(BasicExitReason::InterruptWindow) => {
                self.vm
                    .stats()
                    .irq_window_exits
                    .fetch_add(1, Ordering::Relaxed);
                let ctl = self.vmcs.read(Field::ProcBasedVmexecControl)?;
                self.vmcs.write(
                    Field::ProcBasedVmexecControl,
                    ctl & !(VmcsProcBasedVmexecCtl::INTRWINEXIT.bits() as u64),
                )?;
                Ok(None)
            }
            Ok(BasicExitReason::Cpuid) => Ok(Some(RunExit::Cpuid)),
            Ok(BasicExitReason::Hlt) => self.handle_halt(),
            Ok(BasicExitReason::Invlpg) => {
                self.vm.stats().invlpg_exits.fetch_add(1, Ordering::Relaxed);
                let addr = self.vmcs.read(Field::VmexitQualification)?;
                let ctx = self.translation_ctx();
                self.vm.translator().inval_page(&ctx, Gva::new(addr));
                self.vmcs.skip_instruction()?;
                Ok(None)
            }
            Ok(BasicExitReason::CrAccess) => self.handle_cr(),
            Ok(BasicExitReason::DrAccess) => self.handle_dr(),
            Ok(BasicExitReason::IoInstruction) => self.handle_io(),
            Ok(BasicExitReason::Rdmsr) => self.handle_rdmsr(),
            Ok(BasicExitReason::Wrmsr) => self.handle_wrmsr(),
            _ => Ok(Some(RunExit::Unknown {
                hardware_reason: raw,
            })),
        }
    }

    fn handle_exception(&mut self) -> Result<Option<RunExit>> {
        let vect_info = self.vmcs.read(Field::IdtVectoringInfo)?;
        let intr_info = self.vmcs.read(Field::VmexitInterruptionInfo)?;

        if vect_info & INTR_INFO_VALID_MASK != 0 && !is_page_fault(intr_info) {
            log::error!(
                "unexpected vectoring info 0x{:x} with intr info 0x{:x}",
                vect_info,
                intr_info
            );
        }
        if is_external_interrupt(vect_info) {
            // An interrupt was being delivered when the exception hit;
            // requeue it.
            self.vcpu.irq.set((vect_info & INTR_INFO_VECTOR_MASK) as u8);
        }
        if intr_info & INTR_INFO_TYPE_MASK == INTR_TYPE_NMI {
            self.hw().raise_nmi();
            return Ok(None);
        }
        let error_code = if intr_info & INTR_INFO_DELIVER_CODE_MASK != 0 {
            self.vmcs.read(Field::VmexitInterruptionErrorCode)? as u32
        } else {
            0
        };

        if is_page_fault(intr_info) {
            let cr2 = self.vmcs.read(Field::VmexitQualification)?;
            self.vcpu.regs.cr2 = cr2;
            let ctx = self.translation_ctx();
            if self
                .vm
                .translator()
                .page_fault(&ctx, Gva::new(cr2), error_code)
            {
                self.vm.stats().pf_fixed.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            self.vm.stats().pf_guest.fetch_add(1, Ordering::Relaxed);
            match self.emulate_instruction(cr2)? {
                EmulationOutcome::Handled => return Ok(None),
                EmulationOutcome::Mmio => {
                    self.vm.stats().mmio_exits.fetch_add(1, Ordering::Relaxed);
                    let mmio = &self.vcpu.mmio;
                    return Ok(Some(RunExit::Mmio {
                        phys_addr: mmio.phys_addr,
                        data: mmio.data,
                        len: mmio.len,
                        is_write: mmio.is_write,
                    }));
                }
                EmulationOutcome::Failed => {}
            }
        }

        let vector = (intr_info & INTR_INFO_VECTOR_MASK) as u8;
        if self.vcpu.rmode.active
            && vector == GP_VECTOR
            && error_code == 0
            && self.emulate_instruction(0)? == EmulationOutcome::Handled
        {
            return Ok(None);
        }
        if intr_info & (INTR_INFO_TYPE_MASK | INTR_INFO_VECTOR_MASK)
            == INTR_TYPE_HARD_EXCEPTION | DB_VECTOR as u64
        {
            return Ok(Some(RunExit::Debug));
        }
        Ok(Some(RunExit::Exception { vector, error_code }))
    }

    fn handle_halt(&mut self) -> Result<Option<RunExit>> {
        self.vmcs.skip_instruction()?;
        let flags = self.vmcs.read(Field::GuestRflags)?;
        if self.vcpu.irq.any() && flags & Rflags::IF.bits() != 0 {
            // The guest will take the interrupt right away; no reason to
            // surface the halt.
            return Ok(None);
        }
        self.vm.stats().halt_exits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(RunExit::Hlt))
    }

    fn handle_io(&mut self) -> Result<Option<RunExit>> {
        self.vm.stats().io_exits.fetch_add(1, Ordering::Relaxed);
        let qual = self.vmcs.read(Field::VmexitQualification)?;
        let direction = if qual & 8 != 0 {
            IoDirection::In
        } else {
            IoDirection::Out
        };
        let size = ((qual & 7) + 1) as u8;
        let string = qual & 16 != 0;
        let rep = qual & 32 != 0;
        let port = (qual >> 16) as u16;
        let down = self.vmcs.read(Field::GuestRflags)? & Rflags::DF.bits() != 0;
        let (value, address, count) = if string {
            let count = match self.string_io_count(rep)? {
                Some(count) => count,
                // Undecodable access: retry the instruction.
                None => return Ok(None),
            };
            (0, self.vmcs.read(Field::GuestLinearAddress)?, count)
        } else {
            (self.reg(Reg::Rax)?, 0, 1)
        };
        Ok(Some(RunExit::Io {
            direction,
            size,
            port,
            string,
            rep,
            down,
            value,
            address,
            count,
        }))
    }

    /// Operand count of a string I/O instruction: decode it from guest
    /// memory to learn the effective address size, then mask rcx with it.
    fn string_io_count(&mut self, rep: bool) -> Result<Option<u64>> {
        if !rep {
            return Ok(Some(1));
        }
        let bitness = if self.vmcs.read(Field::GuestRflags)? & Rflags::VM.bits() != 0 {
            16
        } else {
            self.code_bitness()?
        };
        let mut rip = self.vmcs.read(Field::GuestRip)?;
        if bitness != 64 {
            rip += self.vmcs.read(Field::GuestCsBase)?;
        }
        let mut bytes = [0u8; 15];
        if !self.read_guest_virt(Gva::new(rip), &mut bytes) {
            return Ok(None);
        }
        let mut decoder = Decoder::with_ip(bitness, &bytes, rip, DecoderOptions::NONE);
        let insn = decoder.decode();
        if insn.is_invalid() {
            return Ok(None);
        }
        let mask = match insn.memory_base() {
            Register::SI | Register::DI => 0xffffu64,
            Register::ESI | Register::EDI => 0xffff_ffff,
            _ => u64::MAX,
        };
        Ok(Some(self.reg(Reg::Rcx)? & mask))
    }

    /// Read guest-linear memory through the translator, frame by frame.
    pub(crate) fn read_guest_virt(&self, addr: Gva, buf: &mut [u8]) -> bool {
        let mut done = 0;
        while done < buf.len() {
            let cur = addr + done as u64;
            let chunk = core::cmp::min(
                buf.len() - done,
                (crate::x86::PAGE_SIZE - cur.page_offset()) as usize,
            );
            let ctx = self.translation_ctx();
            let tr: Option<Translation> = self.vm.translator().gva_to_gpa(&ctx, cur);
            let gpa = match tr {
                Some(t) => t.gpa,
                None => return false,
            };
            if self.vm.memory().read(gpa, &mut buf[done..done + chunk]) != chunk {
                return false;
            }
            done += chunk;
        }
        true
    }

    fn handle_cr(&mut self) -> Result<Option<RunExit>> {
        let qual = self.vmcs.read(Field::VmexitQualification)?;
        let cr = qual & 15;
        let reg = Reg::from_encoding(qual >> 8);
        match (qual >> 4) & 3 {
            0 => {
                // mov to cr
                let value = self.reg(reg)?;
                match cr {
                    0 => self.set_cr0(value)?,
                    3 => self.set_cr3(value)?,
                    4 => self.set_cr4(value)?,
                    8 => self.set_cr8(value)?,
                    _ => {
                        log::error!("unhandled control register write: cr{}", cr);
                        return Ok(Some(RunExit::Unknown {
                            hardware_reason: self.vmcs.read(Field::VmexitReason)?,
                        }));
                    }
                }
                self.vmcs.skip_instruction()?;
                Ok(None)
            }
            1 => {
                // mov from cr
                match cr {
                    3 => {
                        let cr3 = self.vcpu.cr3;
                        self.set_reg(reg, cr3)?;
                    }
                    8 => {
                        // Reads of cr8 should not exit (cpu erratum AA15).
                        log::debug!("handle_cr: read cr8");
                        let cr8 = self.vcpu.cr8;
                        self.set_reg(reg, cr8)?;
                    }
                    _ => {
                        log::error!("unhandled control register read: cr{}", cr);
                        return Ok(Some(RunExit::Unknown {
                            hardware_reason: self.vmcs.read(Field::VmexitReason)?,
                        }));
                    }
                }
                self.vmcs.skip_instruction()?;
                Ok(None)
            }
            2 => {
                self.clts()?;
                self.vmcs.skip_instruction()?;
                Ok(None)
            }
            _ => {
                self.lmsw((qual >> 16) & 0x0f)?;
                self.vmcs.skip_instruction()?;
                Ok(None)
            }
        }
    }

    fn handle_dr(&mut self) -> Result<Option<RunExit>> {
        let qual = self.vmcs.read(Field::VmexitQualification)?;
        let dr = qual & 7;
        let reg = Reg::from_encoding(qual >> 8);
        if qual & 16 != 0 {
            // mov from dr: architecturally fixed values while the host owns
            // the debug registers.
            let value = match dr {
                6 => 0xffff_0ff0,
                7 => 0x400,
                _ => 0,
            };
            self.set_reg(reg, value)?;
        }
        // mov to dr is accepted and dropped.
        self.vmcs.skip_instruction()?;
        Ok(None)
    }

    fn handle_rdmsr(&mut self) -> Result<Option<RunExit>> {
        use crate::x86::*;
        let ecx = self.reg(Reg::Rcx)? as u32;
        let data = match ecx {
            MSR_FS_BASE => self.vmcs.read(Field::GuestFsBase)?,
            MSR_GS_BASE => self.vmcs.read(Field::GuestGsBase)?,
            MSR_IA32_SYSENTER_CS => self.vmcs.read(Field::GuestSysenterCs)?,
            MSR_IA32_SYSENTER_EIP => self.vmcs.read(Field::GuestSysenterEip)?,
            MSR_IA32_SYSENTER_ESP => self.vmcs.read(Field::GuestSysenterEsp)?,
            MSR_IA32_APIC_BASE => self.vcpu.apic_base,
            MSR_IA32_MC0_CTL
            | MSR_IA32_MCG_STATUS
            | MSR_IA32_MCG_CAP
            | MSR_IA32_UCODE_REV
            | MSR_IA32_PLATFORM_ID
            | MSR_MTRR_FIRST..=MSR_MTRR_LAST => 0,
            m if (MSR_IA32_MC0_MISC..=MSR_IA32_MC0_MISC + 16).contains(&m) => 0,
            _ => match self.vcpu.find_msr(ecx) {
                Some(entry) => entry.data,
                None => {
                    log::error!("unhandled rdmsr: 0x{:x}", ecx);
                    self.inject_gp()?;
                    return Ok(None);
                }
            },
        };
        self.set_reg(Reg::Rax, data & 0xffff_ffff)?;
        self.set_reg(Reg::Rdx, data >> 32)?;
        self.vmcs.skip_instruction()?;
        Ok(None)
    }

    fn handle_wrmsr(&mut self) -> Result<Option<RunExit>> {
        use crate::x86::*;
        let ecx = self.reg(Reg::Rcx)? as u32;
        let data =
            (self.reg(Reg::Rax)? & 0xffff_ffff) | ((self.reg(Reg::Rdx)? & 0xffff_ffff) << 32);
        match ecx {
            MSR_FS_BASE => self.vmcs.write(Field::GuestFsBase, data)?,
            MSR_GS_BASE => self.vmcs.write(Field::GuestGsBase, data)?,
            MSR_IA32_SYSENTER_CS => self.vmcs.write(Field::GuestSysenterCs, data)?,
            MSR_IA32_SYSENTER_EIP => self.vmcs.write(Field::GuestSysenterEip, data)?,
            MSR_IA32_SYSENTER_ESP => self.vmcs.write(Field::GuestSysenterEsp, data)?,
            MSR_EFER => {
                self.set_efer(data)?;
                if self.event_staged()? {
                    // Rejected; deliver the fault without retiring the
                    // instruction.
                    return Ok(None);
                }
            }
            MSR_IA32_MC0_STATUS => {
                log::warn!("wrmsr MSR_IA32_MC0_STATUS 0x{:x}, nop", data);
            }
            MSR_IA32_TSC => {
                // The guest sets its TSC by adjusting the offset.
                let tsc = self.hw().read_tsc();
                self.vmcs
                    .write(Field::TscOffset, data.wrapping_sub(tsc))?;
            }
            MSR_IA32_UCODE_REV | MSR_IA32_UCODE_WRITE | MSR_MTRR_FIRST..=MSR_MTRR_LAST => {}
            MSR_IA32_APIC_BASE => self.vcpu.apic_base = data,
            _ => match self.vcpu.find_msr(ecx) {
                Some(entry) => entry.data = data,
                None => {
                    log::error!("unhandled wrmsr: 0x{:x}", ecx);
                    self.inject_gp()?;
                    return Ok(None);
                }
            },
        }
        self.vmcs.skip_instruction()?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{new_test_vm, MockExit};
    use crate::vmcs::InstructionError;
    use crate::x86::{Gpa, MSR_EFER, MSR_STAR};

    #[test]
    fn reset_vector_run_reaches_a_clean_exit() {
        // A fresh VM with a two-page slot at address zero runs straight from
        // the reset vector and must come back with a well-formed result, not
        // an entry failure.
        let vm = new_test_vm(0x2000);
        vm.create_vcpu(0).unwrap();
        let exit = vm.run(0, &RunParams::default()).unwrap();
        assert!(matches!(
            exit,
            RunExit::Hlt | RunExit::Unknown { .. }
        ));
    }

    #[test]
    fn halt_with_no_pending_interrupt_surfaces() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        // The scripted default exit is a hlt with instruction length 1.
        let rip = vm.get_regs(0).unwrap().rip;
        let exit = vm.run(0, &RunParams::default()).unwrap();
        assert_eq!(exit, RunExit::Hlt);
        // hlt was retired.
        assert_eq!(vm.get_regs(0).unwrap().rip, rip + 1);
    }

    #[test]
    fn external_interrupt_always_returns_to_caller() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        vm.machine().hw().push_exit(MockExit::exit(
            BasicExitReason::ExternalInterrupt as u64,
        ));
        let exit = vm.run(0, &RunParams::default()).unwrap();
        assert_eq!(exit, RunExit::Unknown { hardware_reason: 1 });
        assert_eq!(
            vm.stats().irq_exits.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn entry_failure_carries_the_instruction_error() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        vm.machine()
            .hw()
            .push_exit(MockExit::FailEntry(InstructionError::EntryInvalidControlFields));
        let exit = vm.run(0, &RunParams::default()).unwrap();
        assert_eq!(
            exit,
            RunExit::FailEntry {
                error: InstructionError::EntryInvalidControlFields
            }
        );
        // The vCPU stays valid; the next run proceeds normally.
        assert_eq!(vm.run(0, &RunParams::default()).unwrap(), RunExit::Hlt);
    }

    #[test]
    fn unknown_exit_reason_surfaces_raw() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        vm.machine().hw().push_exit(MockExit::exit(57));
        assert_eq!(
            vm.run(0, &RunParams::default()).unwrap(),
            RunExit::Unknown {
                hardware_reason: 57
            }
        );
    }

    #[test]
    fn interrupt_window_exit_is_self_handled() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        vm.machine().hw().push_exit(MockExit::exit(
            BasicExitReason::InterruptWindow as u64,
        ));
        // Window exit is absorbed; the scripted default hlt follows.
        assert_eq!(vm.run(0, &RunParams::default()).unwrap(), RunExit::Hlt);
        assert_eq!(
            vm.stats().irq_window_exits.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn io_exit_decodes_the_qualification() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut regs = vm.get_regs(0).unwrap();
        regs.gprs[Reg::Rax as usize] = 0x61;
        vm.set_regs(0, &regs).unwrap();
        // out 0x3f8, al: size 1, direction out, port in bits 16..32.
        let qual = (1 - 1) | (0x3f8u64 << 16);
        vm.machine().hw().push_exit(MockExit::exit_with(
            BasicExitReason::IoInstruction as u64,
            qual,
        ));
        let exit = vm.run(0, &RunParams::default()).unwrap();
        assert_eq!(
            exit,
            RunExit::Io {
                direction: IoDirection::Out,
                size: 1,
                port: 0x3f8,
                string: false,
                rep: false,
                down: false,
                value: 0x61,
                address: 0,
                count: 1,
            }
        );
    }

    #[test]
    fn rep_string_io_count_comes_from_rcx() {
        // Large enough that the reset code segment at 0xf0000 is mapped.
        let vm = new_test_vm(0x100000);
        vm.create_vcpu(0).unwrap();
        let mut regs = vm.get_regs(0).unwrap();
        regs.gprs[Reg::Rcx as usize] = 0x2_0005;
        regs.rip = 0x100;
        vm.set_regs(0, &regs).unwrap();
        // rep outsb at cs:0x100 (cs base 0xf0000 from reset).
        vm.memory().write(Gpa::new(0xf0100), &[0xf3, 0x6e]);
        // string (bit 4) | rep (bit 5) | out | port.
        let qual = 16 | 32 | (0x3f8u64 << 16);
        vm.machine().hw().push_exit(MockExit::exit_with(
            BasicExitReason::IoInstruction as u64,
            qual,
        ));
        let exit = vm.run(0, &RunParams::default()).unwrap();
        match exit {
            RunExit::Io { string, rep, count, .. } => {
                assert!(string && rep);
                // 16-bit address size truncates the count.
                assert_eq!(count, 0x0005);
            }
            other => panic!("unexpected exit {:?}", other),
        }
    }

    #[test]
    fn cr0_write_exit_runs_the_mode_machine() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut regs = vm.get_regs(0).unwrap();
        regs.gprs[Reg::Rbx as usize] = 0x11; // PE | ET
        vm.set_regs(0, &regs).unwrap();
        // mov to cr0 from rbx: access type 0, cr 0, reg 3.
        let qual = 0 | (3 << 8);
        vm.machine().hw().push_exit(MockExit::exit_with(
            BasicExitReason::CrAccess as u64,
            qual,
        ));
        vm.run(0, &RunParams::default()).unwrap();
        let sregs = vm.get_sregs(0).unwrap();
        assert_ne!(sregs.cr0 & 1, 0);
    }

    #[test]
    fn dr_reads_return_fixed_values() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        // mov from dr6 into rax: dr 6, direction bit 4, reg 0.
        let qual = 6 | 16;
        vm.machine().hw().push_exit(MockExit::exit_with(
            BasicExitReason::DrAccess as u64,
            qual,
        ));
        vm.run(0, &RunParams::default()).unwrap();
        assert_eq!(
            vm.get_regs(0).unwrap().gprs[Reg::Rax as usize],
            0xffff_0ff0
        );
    }

    #[test]
    fn rdmsr_of_saved_msr_returns_its_data() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut regs = vm.get_regs(0).unwrap();
        regs.gprs[Reg::Rcx as usize] = MSR_STAR as u64;
        vm.set_regs(0, &regs).unwrap();
        vm.machine()
            .hw()
            .push_exit(MockExit::exit(BasicExitReason::Rdmsr as u64));
        vm.run(0, &RunParams::default()).unwrap();
        let regs = vm.get_regs(0).unwrap();
        // The mock host exposes every saved MSR as zero.
        assert_eq!(regs.gprs[Reg::Rax as usize], 0);
        assert_eq!(regs.gprs[Reg::Rdx as usize], 0);
    }

    #[test]
    fn wrmsr_of_unknown_msr_injects_gp() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut regs = vm.get_regs(0).unwrap();
        regs.gprs[Reg::Rcx as usize] = 0x1234_5678;
        let rip = regs.rip;
        vm.set_regs(0, &regs).unwrap();
        vm.machine()
            .hw()
            .push_exit(MockExit::exit(BasicExitReason::Wrmsr as u64));
        vm.run(0, &RunParams::default()).unwrap();
        // The faulting wrmsr was not retired (the default hlt that follows
        // advances rip by exactly one).
        assert_eq!(vm.get_regs(0).unwrap().rip, rip + 1);
    }

    #[test]
    fn wrmsr_efer_reaches_the_mode_machine() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut regs = vm.get_regs(0).unwrap();
        regs.gprs[Reg::Rcx as usize] = MSR_EFER as u64;
        regs.gprs[Reg::Rax as usize] = crate::x86::Efer::SCE.bits();
        vm.set_regs(0, &regs).unwrap();
        vm.machine()
            .hw()
            .push_exit(MockExit::exit(BasicExitReason::Wrmsr as u64));
        vm.run(0, &RunParams::default()).unwrap();
        assert_eq!(
            vm.get_sregs(0).unwrap().efer,
            crate::x86::Efer::SCE.bits()
        );
    }

    #[test]
    fn nmi_exit_is_forwarded_to_the_host() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        {
            let v = vcpu::bind(&vm, 0).unwrap();
            v.vmcs
                .write(
                    Field::VmexitInterruptionInfo,
                    2 | INTR_TYPE_NMI | INTR_INFO_VALID_MASK,
                )
                .unwrap();
        }
        vm.machine().hw().push_exit(MockExit::exit(
            BasicExitReason::ExceptionOrNmi as u64,
        ));
        // The NMI is re-raised on the host and the guest resumes.
        assert_eq!(vm.run(0, &RunParams::default()).unwrap(), RunExit::Hlt);
        assert_eq!(vm.machine().hw().nmi_count(), 1);
    }

    #[test]
    fn unresolved_exception_surfaces_with_its_vector() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        {
            let v = vcpu::bind(&vm, 0).unwrap();
            // Invalid opcode, no error code.
            v.vmcs
                .write(
                    Field::VmexitInterruptionInfo,
                    6 | INTR_TYPE_HARD_EXCEPTION | INTR_INFO_VALID_MASK,
                )
                .unwrap();
        }
        vm.machine().hw().push_exit(MockExit::exit(
            BasicExitReason::ExceptionOrNmi as u64,
        ));
        assert_eq!(
            vm.run(0, &RunParams::default()).unwrap(),
            RunExit::Exception {
                vector: 6,
                error_code: 0
            }
        );
    }

    #[test]
    fn debug_trap_surfaces_as_debug_exit() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        {
            let v = vcpu::bind(&vm, 0).unwrap();
            v.vmcs
                .write(
                    Field::VmexitInterruptionInfo,
                    DB_VECTOR as u64 | INTR_TYPE_HARD_EXCEPTION | INTR_INFO_VALID_MASK,
                )
                .unwrap();
        }
        vm.machine().hw().push_exit(MockExit::exit(
            BasicExitReason::ExceptionOrNmi as u64,
        ));
        assert_eq!(
            vm.run(0, &RunParams::default()).unwrap(),
            RunExit::Debug
        );
    }

    #[test]
    fn run_aborts_when_interrupted_externally() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        // A self-handled exit forces one trip through the yield window.
        vm.machine().hw().push_exit(MockExit::exit(
            BasicExitReason::InterruptWindow as u64,
        ));
        vm.machine().hw().request_interrupt();
        assert_eq!(
            vm.run(0, &RunParams::default()),
            Err(VmxError::Interrupted)
        );
    }

    #[test]
    fn pending_interrupt_with_if_set_is_injected_before_entry() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        // Leave real mode so injection uses the hardware field.
        {
            let mut v = vcpu::bind(&vm, 0).unwrap();
            v.set_cr0(0x11).unwrap();
            let flags = v.vmcs.read(Field::GuestRflags).unwrap();
            v.vmcs
                .write(Field::GuestRflags, flags | Rflags::IF.bits())
                .unwrap();
        }
        vm.interrupt(0, 32).unwrap();
        vm.run(0, &RunParams::default()).unwrap();
        let hw = vm.machine().hw();
        let info = hw.last_injected_event();
        assert_eq!(
            info,
            32 | INTR_TYPE_EXT_INTR | INTR_INFO_VALID_MASK
        );
    }
}
