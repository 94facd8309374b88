//! One virtual machine: guest memory, virtual CPUs and collaborators.
//!
//! A [`Vm`] is the unit a controlling process owns. It carries the guest
//! address space, a fixed array of vCPU slots, the address translator and
//! the optional instruction emulator. All operations on guest state go
//! through the vCPU bind protocol so they are serialized per vCPU and always
//! see an active VMCS.

use crate::{
    emulate::InstructionEmulator,
    machine::Machine,
    memory::{GuestMemory, SlotFlags},
    mmu::{AddressTranslator, IdentityTranslator, Translation},
    port::HwPort,
    vcpu::{self, DebugConfig, Regs, SpecialRegs, Vcpu},
    x86::{Gpa, Gva},
    Result, VmxError, MAX_VCPUS,
};
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// Per-VM event counters.
#[derive(Default)]
pub struct VmStats {
    pub exits: AtomicU64,
    pub io_exits: AtomicU64,
    pub mmio_exits: AtomicU64,
    pub irq_exits: AtomicU64,
    pub irq_window_exits: AtomicU64,
    pub halt_exits: AtomicU64,
    pub interrupted_exits: AtomicU64,
    pub invlpg_exits: AtomicU64,
    /// Page faults the translator resolved without leaving the engine.
    pub pf_fixed: AtomicU64,
    /// Page faults delivered back to the guest or its controlling process.
    pub pf_guest: AtomicU64,
}

/// One guest machine.
pub struct Vm<H: HwPort> {
    machine: Arc<Machine<H>>,
    memory: GuestMemory,
    vcpus: [Mutex<Vcpu>; MAX_VCPUS],
    translator: Arc<dyn AddressTranslator>,
    emulator: Option<Arc<dyn InstructionEmulator>>,
    stats: VmStats,
}

impl<H: HwPort> Vm<H> {
    /// New machine with the identity translator and no emulator: enough for
    /// unpaged guests whose every access lands in RAM.
    pub fn new(machine: Arc<Machine<H>>) -> Self {
        Self::with_collaborators(machine, Arc::new(IdentityTranslator), None)
    }

    /// New machine with an external shadow-paging translator and instruction
    /// emulator.
    pub fn with_collaborators(
        machine: Arc<Machine<H>>,
        translator: Arc<dyn AddressTranslator>,
        emulator: Option<Arc<dyn InstructionEmulator>>,
    ) -> Self {
        Self {
            machine,
            memory: GuestMemory::new(),
            vcpus: core::array::from_fn(|_| Mutex::new(Vcpu::new())),
            translator,
            emulator,
            stats: VmStats::default(),
        }
    }

    pub fn machine(&self) -> &Arc<Machine<H>> {
        &self.machine
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    pub(crate) fn translator(&self) -> &dyn AddressTranslator {
        &*self.translator
    }

    pub(crate) fn emulator(&self) -> Option<Arc<dyn InstructionEmulator>> {
        self.emulator.clone()
    }

    pub(crate) fn vcpu_slot(&self, id: usize) -> Result<&Mutex<Vcpu>> {
        self.vcpus.get(id).ok_or(VmxError::InvalidArgument)
    }

    /// Create vCPU `id` in architectural reset state. Requires memory slot 0
    /// to exist already; the real-mode task state lives in its top frames.
    pub fn create_vcpu(&self, id: usize) -> Result<()> {
        vcpu::create(self, id)
    }

    /// Create, replace or remove (bytes = 0) a guest memory slot, then drop
    /// every vCPU's cached translations.
    pub fn set_memory_region(
        &self,
        slot: usize,
        base: Gpa,
        bytes: u64,
        flags: SlotFlags,
    ) -> Result<()> {
        self.memory.reconfigure(slot, base, bytes, flags)?;
        self.reset_all_translations();
        Ok(())
    }

    /// Copy out and clear a slot's dirty bitmap. When any page was dirty the
    /// translators are flushed before the busy pin is released, so no stale
    /// writable mapping survives the harvest.
    pub fn get_dirty_log(&self, slot: usize) -> Result<Vec<u64>> {
        let log = self.memory.fetch_dirty_log(slot)?;
        if log.any_set() {
            self.reset_all_translations();
        }
        Ok(log.into_bitmap())
    }

    /// Queue external interrupt `vector` for injection on vCPU `id`.
    pub fn interrupt(&self, id: usize, vector: u32) -> Result<()> {
        if vector >= 256 {
            return Err(VmxError::InvalidArgument);
        }
        let mut v = vcpu::bind(self, id)?;
        v.vcpu.irq.set(vector as u8);
        Ok(())
    }

    /// Translate a guest linear address under vCPU `id`'s current paging
    /// mode.
    pub fn translate(&self, id: usize, gva: Gva) -> Result<Option<Translation>> {
        let v = vcpu::bind(self, id)?;
        let ctx = v.translation_ctx();
        Ok(self.translator.gva_to_gpa(&ctx, gva))
    }

    pub fn get_regs(&self, id: usize) -> Result<Regs> {
        vcpu::bind(self, id)?.get_regs()
    }

    pub fn set_regs(&self, id: usize, regs: &Regs) -> Result<()> {
        vcpu::bind(self, id)?.set_regs(regs)
    }

    pub fn get_sregs(&self, id: usize) -> Result<SpecialRegs> {
        vcpu::bind(self, id)?.get_sregs()
    }

    pub fn set_sregs(&self, id: usize, sregs: &SpecialRegs) -> Result<()> {
        vcpu::bind(self, id)?.set_sregs(sregs)
    }

    pub fn set_debug(&self, id: usize, cfg: &DebugConfig) -> Result<()> {
        vcpu::bind(self, id)?.set_debug(cfg)
    }

    fn reset_all_translations(&self) {
        for id in 0..MAX_VCPUS {
            if let Ok(v) = vcpu::bind(self, id) {
                v.reset_translation();
            }
        }
    }
}

impl<H: HwPort> Drop for Vm<H> {
    fn drop(&mut self) {
        // Flush every vCPU's VMCS from its last physical CPU before the
        // regions are freed.
        for slot in self.vcpus.iter() {
            let vcpu = slot.lock();
            if let (Some(cpu), Some(region)) = (vcpu.cpu, vcpu.vmcs.as_deref()) {
                let _ = self.machine.clear_vmcs_on(cpu, region);
            }
        }
        self.translator.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{new_test_vm, MockPort};
    use crate::x86::Gva;

    #[test]
    fn interrupt_vector_is_range_checked() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        assert_eq!(vm.interrupt(0, 256), Err(VmxError::InvalidArgument));
        vm.interrupt(0, 255).unwrap();
    }

    #[test]
    fn operations_before_create_report_not_created() {
        let vm = new_test_vm(0x4000);
        assert_eq!(vm.get_regs(0), Err(VmxError::NotCreated));
        assert_eq!(vm.interrupt(0, 3), Err(VmxError::NotCreated));
    }

    #[test]
    fn dirty_log_round_trip_through_the_vm() {
        let machine = Machine::enable(MockPort::new(1)).unwrap();
        let vm = Vm::new(machine);
        vm.set_memory_region(0, Gpa::new(0), 0x4000, SlotFlags::LOG_DIRTY_PAGES)
            .unwrap();
        vm.memory().write(Gpa::new(0x2008), &[1, 2, 3]);
        let log = vm.get_dirty_log(0).unwrap();
        assert_eq!(log[0], 1 << 2);
        // Harvest cleared the bitmap.
        assert_eq!(vm.get_dirty_log(0).unwrap()[0], 0);
    }

    #[test]
    fn dirty_log_without_tracking_is_an_error() {
        let vm = new_test_vm(0x4000);
        assert_eq!(vm.get_dirty_log(0), Err(VmxError::NoDirtyLog));
    }

    #[test]
    fn translate_uses_identity_mapping_while_unpaged() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let tr = vm.translate(0, Gva::new(0x1234)).unwrap().unwrap();
        assert_eq!(tr.gpa, Gpa::new(0x1234));
    }
}
