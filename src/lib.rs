//! Hardware-assisted virtual machine monitor core.
//!
//! This crate is the execution engine that sits between a privileged control
//! process and Intel VMX hardware. The control process creates a [`Vm`],
//! attaches guest physical memory slots, creates virtual CPUs and then loops
//! calling [`Vm::run`] until the guest needs help (I/O, MMIO, halt, debug).
//! Everything that must be mediated in software is intercepted; everything
//! else runs natively on the processor.
//!
//! ## Structure
//!
//! - [`machine`] — one-time VMX detection and per-physical-CPU enablement,
//!   including the table of per-CPU vmxon regions and active-VMCS pointers.
//! - [`memory`] — guest physical memory slots with dirty-page tracking.
//! - [`vcpu`] — per virtual CPU state, the VMCS bind/unbind protocol and
//!   one-time reset-state setup.
//! - [`modes`] — the control-register and addressing-mode state machine
//!   (real, protected and long mode on top of mode-agnostic VMCS fields).
//! - [`run`] — the guest entry/exit cycle and the exit-reason dispatcher.
//! - [`irq`] — pending-interrupt bookkeeping and injection, including the
//!   real-mode software-interrupt emulation path.
//! - [`emulate`] — the callback bridge handed to the external instruction
//!   emulator, surfacing unresolved accesses as MMIO requests.
//! - [`port`] / [`hardware`] — the privileged-instruction boundary. Only
//!   [`hardware`] contains architecture-specific unsafe code; every other
//!   module drives the hardware through the [`port::HwPort`] trait, which is
//!   also what makes the whole engine testable off the metal.
//!
//! ## Concurrency
//!
//! No internal threads. Each operation runs on the calling thread; one thread
//! per in-flight `run` call. The per-vCPU lock serializes access to a virtual
//! CPU, the VM-wide lock is a short, non-sleeping critical section around
//! slot metadata, and memory reconfiguration allocates outside the lock with
//! an optimistic version-counter retry.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod emulate;
#[cfg(all(target_arch = "x86_64", not(test)))]
pub mod hardware;
pub mod irq;
pub mod machine;
pub mod memory;
pub mod mmu;
pub mod modes;
pub mod port;
pub mod run;
#[cfg(test)]
pub(crate) mod testing;
pub mod vcpu;
pub mod vm;
pub mod vm_control;
pub mod vmcs;
pub mod x86;

pub use machine::Machine;
pub use run::{IoDirection, RunExit, RunParams};
pub use vm::Vm;
pub use vmcs::InstructionError;

/// Maximum number of memory slots per virtual machine.
pub const MAX_MEMORY_SLOTS: usize = 4;
/// Maximum number of virtual CPUs per virtual machine.
pub const MAX_VCPUS: usize = 1;

/// Errors surfaced to the controlling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxError {
    /// Caller passed an out-of-range index, a misaligned region or an
    /// otherwise malformed argument. No state was changed.
    InvalidArgument,
    /// The requested memory region intersects another slot.
    Overlap,
    /// A vCPU already owns a hardware control block for this index.
    AlreadyExists,
    /// The vCPU has not been created yet.
    NotCreated,
    /// Allocation failed; any partial allocation for the call was rolled
    /// back.
    OutOfMemory,
    /// A dirty-log read is in flight; retry the reconfiguration later.
    Busy,
    /// The slot has no dirty bitmap to read.
    NoDirtyLog,
    /// The run loop was interrupted by an external request. Retryable; no
    /// guest state was corrupted.
    Interrupted,
    /// VMX is absent or disabled by firmware.
    Unsupported,
    /// A VMX instruction failed in VMX root operation.
    VmxFailure(InstructionError),
}

impl core::fmt::Display for VmxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmxError::InvalidArgument => write!(f, "invalid argument"),
            VmxError::Overlap => write!(f, "memory region overlaps another slot"),
            VmxError::AlreadyExists => write!(f, "vcpu already created"),
            VmxError::NotCreated => write!(f, "vcpu not created"),
            VmxError::OutOfMemory => write!(f, "out of memory"),
            VmxError::Busy => write!(f, "resource busy"),
            VmxError::NoDirtyLog => write!(f, "slot has no dirty log"),
            VmxError::Interrupted => write!(f, "interrupted"),
            VmxError::Unsupported => write!(f, "vmx unsupported or disabled"),
            VmxError::VmxFailure(e) => write!(f, "vmx instruction failed: {:?}", e),
        }
    }
}

pub type Result<T> = core::result::Result<T, VmxError>;
