//! Flags and MSRs for VMX capabilities.

// VMX capability MSRs.
/// MSR - IA32_VMX_BASIC
pub const IA32_VMX_BASIC: u32 = 0x480;
/// MSR - IA32_VMX_PINBASED_CTLS.
pub const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
/// MSR - IA32_VMX_PROC_BASED_CTLS.
pub const IA32_VMX_PROC_BASED_CTLS: u32 = 0x482;
/// MSR - IA32_VMX_EXIT_CTLS.
pub const IA32_VMX_EXIT_CTLS: u32 = 0x483;
/// MSR - IA32_VMX_ENTRY_CTLS.
pub const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
/// MSR - IA32_VMX_CR0_FIXED0.
pub const IA32_VMX_CR0_FIXED0: u32 = 0x486;
/// MSR - IA32_VMX_CR0_FIXED1.
pub const IA32_VMX_CR0_FIXED1: u32 = 0x487;
/// MSR - IA32_VMX_CR4_FIXED0.
pub const IA32_VMX_CR4_FIXED0: u32 = 0x488;
/// MSR - IA32_VMX_CR4_FIXED1.
pub const IA32_VMX_CR4_FIXED1: u32 = 0x489;

bitflags::bitflags! {
    /// Pin-based VM-execution controls.
    pub struct VmcsPinBasedVmexecCtl: u32 {
        /// If this control is 1, external interrupts cause VM exits.
        /// Otherwise, they are delivered normally through the guest IDT.
        /// If this control is 1, the value of RFLAGS.IF does not affect
        /// interrupt blocking.
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        /// If this control is 1, non-maskable interrupts (NMIs) cause VM
        /// exits. Otherwise, they are delivered normally using descriptor 2
        /// of the IDT.
        const NMI_EXITING = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Primary processor-based VM-execution controls.
    pub struct VmcsProcBasedVmexecCtl: u32 {
        /// If this control is 1, a VM exit occurs at the beginning of any
        /// instruction if RFLAGS.IF = 1 and there is no other blocking of
        /// interrupts.
        const INTRWINEXIT = 1 << 2;
        /// This control determines whether reads of the time-stamp counter
        /// return a value modified by the TSC offset field.
        const USETSCOFF = 1 << 3;
        /// This control determines whether executions of HLT cause VM exits.
        const HLT_EXITING = 1 << 7;
        /// This determines whether executions of INVLPG cause VM exits.
        const INVLPGEXIT = 1 << 9;
        /// This control determines whether executions of MOV to CR8 cause VM
        /// exits.
        const CR8LOADEXIT = 1 << 19;
        /// This control determines whether executions of MOV from CR8 cause
        /// VM exits.
        const CR8STOREEXIT = 1 << 20;
        /// This control determines whether executions of MOV DR cause VM
        /// exits.
        const MOVDREXIT = 1 << 23;
        /// This control determines whether executions of I/O instructions
        /// (IN, INS, OUT, OUTS) cause VM exits.
        const UNCONDIOEXIT = 1 << 24;
    }
}

bitflags::bitflags! {
    /// VM-entry controls.
    pub struct VmcsEntryCtl: u32 {
        /// This control determines whether the logical processor is in
        /// IA-32e mode after VM entry. Its value is loaded into
        /// IA32_EFER.LMA as part of VM entry.
        const IA32E_MODE_GUEST = 1 << 9;
    }
}

bitflags::bitflags! {
    /// Primary VM-exit controls.
    pub struct VmcsExitCtl: u32 {
        /// This control determines whether a logical processor is in 64-bit
        /// mode after the next VM exit. Its value is loaded into CS.L,
        /// IA32_EFER.LME, and IA32_EFER.LMA on every VM exit.
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        /// If a VM exit due to an external interrupt occurs and this control
        /// is 1, the logical processor acknowledges the interrupt
        /// controller, acquiring the interrupt's vector. The vector is
        /// stored in the VM-exit interruption-information field.
        const ACK_INTR_ON_EXIT = 1 << 15;
    }
}

/// Fold a desired control value with the capability MSR's allowed-0/allowed-1
/// settings: required bits (low word) are forced on, unsupported bits (clear
/// in the high word) are masked off.
pub fn adjust_controls(desired: u32, capability: u64) -> u32 {
    let allowed0 = capability as u32;
    let allowed1 = (capability >> 32) as u32;
    (desired | allowed0) & allowed1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_controls_applies_allowed_masks() {
        // allowed-0 requires bit 1, allowed-1 permits bits 0..=7.
        let cap = 0x0000_00ff_0000_0002u64;
        assert_eq!(adjust_controls(0x101, cap), 0x03);
        // everything permitted, nothing required.
        let cap = 0xffff_ffff_0000_0000u64;
        assert_eq!(adjust_controls(0x8081, cap), 0x8081);
    }
}
