//! One-time VMX detection and per-physical-CPU enablement.
//!
//! The machine owns one vmxon region per online physical CPU plus the
//! per-CPU pointer to the VMCS currently active there. Everything is held in
//! an explicit table indexed by physical-CPU id; there is no ambient global
//! state.

use crate::{
    port::HwPort,
    vmcs::VmcsRegion,
    x86::{FEATURE_CONTROL_LOCKED, FEATURE_CONTROL_VMXON_ENABLED, MSR_IA32_FEATURE_CONTROL},
    Result, VmxError,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

struct PerCpu {
    vmxon_region: Box<VmcsRegion>,
    /// Address of the VMCS active on this CPU, 0 when none.
    current_vmcs: AtomicUsize,
}

/// Process-wide VMX state: enabled on every online physical CPU for the
/// machine's lifetime, torn down on drop.
pub struct Machine<H: HwPort> {
    hw: H,
    cpus: Vec<PerCpu>,
    revision_id: u32,
}

/// True when the processor supports VMX and firmware has not disabled it.
pub fn probe<H: HwPort>(hw: &H) -> bool {
    if !hw.has_vmx() {
        return false;
    }
    let fc = hw.rdmsr(MSR_IA32_FEATURE_CONTROL);
    // A locked feature-control MSR without the vmxon bit means the BIOS
    // turned VMX off for good.
    fc & FEATURE_CONTROL_LOCKED == 0 || fc & FEATURE_CONTROL_VMXON_ENABLED != 0
}

impl<H: HwPort> Machine<H> {
    /// Probe and enter VMX root operation on every online physical CPU.
    ///
    /// Failure here aborts initialization entirely; there is no partial
    /// enablement.
    pub fn enable(hw: H) -> Result<Arc<Self>> {
        if !probe(&hw) {
            return Err(VmxError::Unsupported);
        }
        let revision_id = hw.vmcs_revision_id();
        let ncpus = hw.cpu_count();
        let mut cpus = Vec::new();
        cpus.try_reserve_exact(ncpus)
            .map_err(|_| VmxError::OutOfMemory)?;
        for _ in 0..ncpus {
            cpus.push(PerCpu {
                vmxon_region: VmcsRegion::try_boxed(revision_id)?,
                current_vmcs: AtomicUsize::new(0),
            });
        }
        let machine = Self {
            hw,
            cpus,
            revision_id,
        };
        let mut failed = false;
        machine.hw.on_each_cpu(&mut |cpu| {
            if machine.hw.vmxon(&machine.cpus[cpu].vmxon_region).is_err() {
                failed = true;
            }
        });
        if failed {
            machine.hw.on_each_cpu(&mut |_| machine.hw.vmxoff());
            return Err(VmxError::Unsupported);
        }
        Ok(Arc::new(machine))
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn revision_id(&self) -> u32 {
        self.revision_id
    }

    /// The VMCS address currently loaded on `cpu`, 0 when none.
    pub(crate) fn current_vmcs(&self, cpu: usize) -> usize {
        self.cpus[cpu].current_vmcs.load(Ordering::Acquire)
    }

    pub(crate) fn set_current_vmcs(&self, cpu: usize, addr: usize) {
        self.cpus[cpu].current_vmcs.store(addr, Ordering::Release);
    }

    /// Flush `region` from whichever CPU holds it active. Runs vmclear on
    /// that CPU so a later vmptrld elsewhere starts from a clear block.
    pub(crate) fn clear_vmcs_on(&self, cpu: usize, region: &VmcsRegion) -> Result<()> {
        let mut result = Ok(());
        self.hw.on_cpu(cpu, &mut || {
            if self.cpus[cpu].current_vmcs.load(Ordering::Acquire) == region.address() {
                self.cpus[cpu].current_vmcs.store(0, Ordering::Release);
            }
            if let Err(e) = self.hw.vmclear(region) {
                result = Err(VmxError::VmxFailure(e));
            }
        });
        result
    }
}

impl<H: HwPort> Drop for Machine<H> {
    fn drop(&mut self) {
        self.hw.on_each_cpu(&mut |_| self.hw.vmxoff());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPort;

    #[test]
    fn enable_allocates_one_region_per_cpu() {
        let machine = Machine::enable(MockPort::new(2)).unwrap();
        assert_eq!(machine.cpus.len(), 2);
        assert_eq!(machine.current_vmcs(0), 0);
        assert_eq!(machine.current_vmcs(1), 0);
    }

    #[test]
    fn probe_respects_locked_feature_control() {
        let port = MockPort::new(1);
        port.set_msr(MSR_IA32_FEATURE_CONTROL, FEATURE_CONTROL_LOCKED);
        assert!(!probe(&port));
        port.set_msr(
            MSR_IA32_FEATURE_CONTROL,
            FEATURE_CONTROL_LOCKED | FEATURE_CONTROL_VMXON_ENABLED,
        );
        assert!(probe(&port));
    }
}
