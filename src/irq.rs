//! Pending-interrupt bookkeeping and injection.
//!
//! Pending vectors live in a two-level bitmap: one bit per vector plus a
//! summary word with one bit per 64-vector group, so finding the lowest
//! pending vector is two trailing-zero scans. Injection happens just before
//! guest entry; if the guest cannot take interrupts the engine instead asks
//! the hardware for an interrupt-window exit and retries there.

use crate::{
    port::HwPort,
    vcpu::LoadedVcpu,
    vm_control::VmcsProcBasedVmexecCtl,
    vmcs::{Field, INTR_INFO_VALID_MASK, INTR_TYPE_EXT_INTR},
    x86::{Gpa, Rflags},
    Result,
};

pub const NR_IRQ_WORDS: usize = 4;

/// Two-level pending-vector bitmap.
pub(crate) struct IrqState {
    pub pending: [u64; NR_IRQ_WORDS],
    summary: u64,
}

impl IrqState {
    pub fn new() -> Self {
        Self {
            pending: [0; NR_IRQ_WORDS],
            summary: 0,
        }
    }

    pub fn set(&mut self, vector: u8) {
        let (word, bit) = (vector as usize / 64, vector as usize % 64);
        self.pending[word] |= 1 << bit;
        self.summary |= 1 << word;
    }

    pub fn any(&self) -> bool {
        self.summary != 0
    }

    /// Pop the lowest pending vector.
    pub fn take_lowest(&mut self) -> Option<u8> {
        if self.summary == 0 {
            return None;
        }
        let word = self.summary.trailing_zeros() as usize;
        let bit = self.pending[word].trailing_zeros() as usize;
        self.pending[word] &= !(1 << bit);
        if self.pending[word] == 0 {
            self.summary &= !(1 << word);
        }
        Some((word * 64 + bit) as u8)
    }

    /// Replace the whole bitmap, rebuilding the summary.
    pub fn load(&mut self, pending: &[u64; NR_IRQ_WORDS]) {
        self.pending = *pending;
        self.summary = 0;
        for (word, &bits) in pending.iter().enumerate() {
            if bits != 0 {
                self.summary |= 1 << word;
            }
        }
    }
}

impl<H: HwPort> LoadedVcpu<'_, H> {
    /// Inject the lowest pending vector if the guest can take it now;
    /// otherwise arm an interrupt-window exit and keep it pending.
    pub(crate) fn try_inject_irq(&mut self) -> Result<()> {
        let flags = self.vmcs.read(Field::GuestRflags)?;
        let blocked = self.vmcs.read(Field::GuestInterruptibilityState)? & 3 != 0;
        if flags & Rflags::IF.bits() != 0 && !blocked {
            if let Some(vector) = self.vcpu.irq.take_lowest() {
                if self.vcpu.rmode.active {
                    self.inject_rmode_irq(vector)?;
                } else {
                    self.vmcs.write(
                        Field::VmentryInterruptionInfo,
                        vector as u64 | INTR_TYPE_EXT_INTR | INTR_INFO_VALID_MASK,
                    )?;
                }
            }
            Ok(())
        } else {
            let ctl = self.vmcs.read(Field::ProcBasedVmexecControl)?;
            self.vmcs.write(
                Field::ProcBasedVmexecControl,
                ctl | VmcsProcBasedVmexecCtl::INTRWINEXIT.bits() as u64,
            )
        }
    }

    /// Deliver an interrupt the way a real-mode CPU would: push flags, cs
    /// and ip, clear IF/TF/AC and vector through the IVT. A stack without
    /// headroom or an unreadable IVT drops the interrupt with a log line.
    fn inject_rmode_irq(&mut self, vector: u8) -> Result<()> {
        let sp = self.vmcs.read(Field::GuestRsp)? as u16;
        let ss_limit = self.vmcs.read(Field::GuestSsLimit)?;
        if sp as u64 > ss_limit || sp < 6 {
            log::warn!("rmode irq {}: stack pointer beyond ss limit", vector);
            return Ok(());
        }
        let mut ent = [0u8; 4];
        if self
            .vm
            .memory()
            .read(Gpa::new(vector as u64 * 4), &mut ent)
            != ent.len()
        {
            log::warn!("rmode irq {}: interrupt vector table unreadable", vector);
            return Ok(());
        }
        let ip = u16::from_le_bytes([ent[0], ent[1]]);
        let cs = u16::from_le_bytes([ent[2], ent[3]]);

        let flags = self.vmcs.read(Field::GuestRflags)?;
        let old_cs = (self.vmcs.read(Field::GuestCsBase)? >> 4) as u16;
        let old_ip = self.vmcs.read(Field::GuestRip)? as u16;
        let ss_base = self.vmcs.read(Field::GuestSsBase)?;

        self.vmcs.write(
            Field::GuestRflags,
            flags & !(Rflags::IF | Rflags::TF | Rflags::AC).bits(),
        )?;
        let mem = self.vm.memory();
        mem.write(Gpa::new(ss_base + sp as u64 - 2), &(flags as u16).to_le_bytes());
        mem.write(Gpa::new(ss_base + sp as u64 - 4), &old_cs.to_le_bytes());
        mem.write(Gpa::new(ss_base + sp as u64 - 6), &old_ip.to_le_bytes());

        self.vmcs.write(Field::GuestRip, ip as u64)?;
        self.vmcs.write(Field::GuestCsBase, (cs as u64) << 4)?;
        self.vmcs.write(Field::GuestCsSelector, cs as u64)?;
        self.vmcs
            .write(Field::GuestRsp, (sp as u64 - 6) & 0xffff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::new_test_vm;
    use crate::vcpu;

    #[test]
    fn lowest_vector_is_taken_first() {
        let mut irq = IrqState::new();
        irq.set(70);
        irq.set(3);
        irq.set(5);
        assert_eq!(irq.take_lowest(), Some(3));
        assert_eq!(irq.take_lowest(), Some(5));
        assert_eq!(irq.take_lowest(), Some(70));
        assert_eq!(irq.take_lowest(), None);
        assert!(!irq.any());
    }

    #[test]
    fn load_rebuilds_summary() {
        let mut irq = IrqState::new();
        irq.load(&[0, 0, 1 << 5, 0]);
        assert!(irq.any());
        assert_eq!(irq.take_lowest(), Some(128 + 5));
        assert!(!irq.any());
    }

    #[test]
    fn blocked_guest_arms_interrupt_window() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        v.vcpu.irq.set(32);
        // IF clear at reset, so nothing can be delivered.
        v.try_inject_irq().unwrap();
        assert!(v.vcpu.irq.any());
        let ctl = v.vmcs.read(Field::ProcBasedVmexecControl).unwrap();
        assert_ne!(
            ctl & VmcsProcBasedVmexecCtl::INTRWINEXIT.bits() as u64,
            0
        );
    }

    #[test]
    fn rmode_injection_vectors_through_ivt() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        // IVT entry 8: handler at 0x1234:0x5678.
        vm.memory()
            .write(Gpa::new(8 * 4), &[0x78, 0x56, 0x34, 0x12]);
        v.vmcs.write(Field::GuestSsBase, 0).unwrap();
        v.vmcs.write(Field::GuestSsLimit, 0xffff).unwrap();
        v.vmcs.write(Field::GuestRsp, 0x1000).unwrap();
        v.vmcs.write(Field::GuestCsBase, 0xf0000).unwrap();
        v.vmcs.write(Field::GuestRip, 0x10).unwrap();
        let flags = v.vmcs.read(Field::GuestRflags).unwrap();
        v.vmcs
            .write(Field::GuestRflags, flags | Rflags::IF.bits())
            .unwrap();

        v.vcpu.irq.set(8);
        v.try_inject_irq().unwrap();

        assert!(!v.vcpu.irq.any());
        assert_eq!(v.vmcs.read(Field::GuestRip).unwrap(), 0x5678);
        assert_eq!(v.vmcs.read(Field::GuestCsSelector).unwrap(), 0x1234);
        assert_eq!(v.vmcs.read(Field::GuestCsBase).unwrap(), 0x12340);
        assert_eq!(v.vmcs.read(Field::GuestRsp).unwrap(), 0x1000 - 6);
        // Pushed frame: ip at sp-6, cs at sp-4, flags at sp-2.
        let mut frame = [0u8; 6];
        vm.memory().read(Gpa::new(0x1000 - 6), &mut frame);
        assert_eq!(u16::from_le_bytes([frame[0], frame[1]]), 0x10);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), 0xf000);
        let flags = v.vmcs.read(Field::GuestRflags).unwrap();
        assert_eq!(flags & Rflags::IF.bits(), 0);
    }

    #[test]
    fn rmode_injection_without_stack_headroom_is_dropped() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        v.vmcs.write(Field::GuestRsp, 2).unwrap();
        let flags = v.vmcs.read(Field::GuestRflags).unwrap();
        v.vmcs
            .write(Field::GuestRflags, flags | Rflags::IF.bits())
            .unwrap();
        let rip = v.vmcs.read(Field::GuestRip).unwrap();

        v.vcpu.irq.set(8);
        v.try_inject_irq().unwrap();

        // The vector was consumed but control flow is untouched.
        assert!(!v.vcpu.irq.any());
        assert_eq!(v.vmcs.read(Field::GuestRip).unwrap(), rip);
    }
}
