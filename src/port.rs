//! The privileged-instruction boundary.
//!
//! Every operation that touches processor state the engine cannot express in
//! safe code goes through [`HwPort`]: VMX root operations, MSR access,
//! host segment/descriptor manipulation, FPU image handling and the actual
//! guest entry. The production implementation lives in [`crate::hardware`];
//! tests substitute a deterministic in-memory port.

use crate::vmcs::{Field, InstructionError, VmcsRegion};

/// Guest general-purpose registers plus cr2, exchanged with the entry stub.
///
/// rsp, rip and rflags live in the VMCS and are not part of this block; the
/// rsp slot is kept only so the register file indexes match the hardware
/// encoding.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct GuestRegs {
    pub gprs: [u64; 16],
    pub cr2: u64,
}

impl GuestRegs {
    pub const fn zeroed() -> Self {
        Self {
            gprs: [0; 16],
            cr2: 0,
        }
    }
}

/// 512-byte fxsave/fxrstor image.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FxImage(pub [u8; 512]);

impl FxImage {
    pub const fn zeroed() -> Self {
        Self([0; 512])
    }

    /// mxcsr lives at byte offset 24 of the fxsave image.
    pub fn set_mxcsr(&mut self, value: u32) {
        self.0[24..28].copy_from_slice(&value.to_le_bytes());
    }

    pub fn mxcsr(&self) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.0[24..28]);
        u32::from_le_bytes(b)
    }
}

/// Host context captured for the VMCS host-state area. The selector and
/// descriptor-table values differ per physical CPU and must be refreshed
/// whenever a vCPU migrates.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostState {
    pub cs_selector: u16,
    pub ds_selector: u16,
    pub es_selector: u16,
    pub ss_selector: u16,
    pub tr_selector: u16,
    pub tr_base: u64,
    pub gdt_base: u64,
    pub idt_base: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
}

/// Privileged operations the engine needs from the platform.
///
/// Implementations must be callable from any controlling thread; the engine
/// brackets entry-critical sections with `disable_preemption` /
/// `enable_preemption` itself.
pub trait HwPort: Send + Sync {
    // Topology and scheduling.
    fn cpu_count(&self) -> usize;
    /// Identity of the executing physical CPU. Stable only while preemption
    /// is disabled.
    fn current_cpu(&self) -> usize;
    fn disable_preemption(&self);
    fn enable_preemption(&self);
    /// Cooperative yield between handled exits.
    fn yield_cpu(&self);
    /// True when the controlling process asked to interrupt the run loop.
    fn interrupted(&self) -> bool;
    /// Run `f` once per online physical CPU, on that CPU.
    fn on_each_cpu(&self, f: &mut dyn FnMut(usize));
    /// Run `f` on the named physical CPU.
    fn on_cpu(&self, cpu: usize, f: &mut dyn FnMut());

    // Capability probing.
    fn has_vmx(&self) -> bool;
    fn vmcs_revision_id(&self) -> u32;

    // MSR and timestamp access.
    fn rdmsr(&self, index: u32) -> u64;
    /// Read that tolerates unimplemented MSRs.
    fn rdmsr_safe(&self, index: u32) -> Option<u64>;
    fn wrmsr(&self, index: u32, value: u64);
    fn read_tsc(&self) -> u64;

    // VMX root operations on the current physical CPU.
    fn vmxon(&self, region: &VmcsRegion) -> Result<(), InstructionError>;
    fn vmxoff(&self);
    fn vmclear(&self, region: &VmcsRegion) -> Result<(), InstructionError>;
    fn vmptrld(&self, region: &VmcsRegion) -> Result<(), InstructionError>;
    fn vmread(&self, field: Field) -> Result<u64, InstructionError>;
    fn vmwrite(&self, field: Field, value: u64) -> Result<(), InstructionError>;

    /// Enter the guest on the current VMCS. `launched` selects vmresume over
    /// vmlaunch. On a successful exit the register block holds the guest's
    /// registers and cr2; an `Err` is an entry failure with the
    /// VM-instruction error.
    fn guest_enter(&self, launched: bool, regs: &mut GuestRegs) -> Result<(), InstructionError>;

    // Host segment and descriptor state.
    fn host_state(&self) -> HostState;
    fn read_fs_gs(&self) -> (u16, u16);
    fn load_fs_gs(&self, fs: u16, gs: u16);
    /// Reload the task register after a guest run clobbered its busy bit.
    fn reload_tss(&self);
    /// Address the hardware jumps to on exit (the HOST_RIP field).
    fn host_entry_point(&self) -> u64;

    // FPU images.
    fn fpu_save(&self, image: &mut FxImage);
    fn fpu_restore(&self, image: &FxImage);
    /// Reset the FPU to its architectural init state.
    fn fpu_reset(&self);

    /// Stage hardware breakpoint addresses into dr0..dr3 before entry.
    fn load_debug_regs(&self, dr: &[u64; 4]);

    /// Re-deliver an NMI that was intercepted while the guest ran.
    fn raise_nmi(&self);
}
