//! Deterministic in-memory hardware port for tests.
//!
//! The mock keeps one field map per VMCS region address, so vmread/vmwrite
//! behave like the real thing including migration between mock CPUs. Guest
//! entries consume a script of exits; with an empty script every entry
//! produces a hlt exit of instruction length 1.

use crate::{
    machine::Machine,
    memory::SlotFlags,
    port::{FxImage, GuestRegs, HostState, HwPort},
    vm::Vm,
    vmcs::{BasicExitReason, Field, InstructionError, VmcsRegion, INTR_INFO_VALID_MASK},
    vm_control::{
        IA32_VMX_BASIC, IA32_VMX_ENTRY_CTLS, IA32_VMX_EXIT_CTLS, IA32_VMX_PINBASED_CTLS,
        IA32_VMX_PROC_BASED_CTLS,
    },
    x86::Gpa,
};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

/// Control MSRs where every bit may be 0 and every bit may be 1.
const VMX_CTL_ALL_ALLOWED: u64 = 0xffff_ffff_0000_0000;
const MOCK_REVISION_ID: u32 = 1;

pub(crate) enum MockExit {
    /// A completed guest run with the given exit reason and qualification.
    Exit { reason: u64, qualification: u64 },
    /// The processor refused the entry.
    FailEntry(InstructionError),
}

impl MockExit {
    pub(crate) fn exit(reason: u64) -> Self {
        MockExit::Exit {
            reason,
            qualification: 0,
        }
    }

    pub(crate) fn exit_with(reason: u64, qualification: u64) -> Self {
        MockExit::Exit {
            reason,
            qualification,
        }
    }
}

pub(crate) struct MockPort {
    ncpus: usize,
    cur_cpu: AtomicUsize,
    msrs: Mutex<BTreeMap<u32, u64>>,
    /// Field storage keyed by region address, mirroring real VMCS memory.
    vmcs_store: Mutex<BTreeMap<usize, BTreeMap<u32, u64>>>,
    /// Region address loaded per mock CPU, 0 when none.
    loaded: Mutex<Vec<usize>>,
    script: Mutex<VecDeque<MockExit>>,
    interrupted: AtomicBool,
    last_injected: AtomicU64,
    debug_regs: Mutex<[u64; 4]>,
    nmis: AtomicU64,
    tsc: AtomicU64,
}

impl MockPort {
    pub(crate) fn new(ncpus: usize) -> Self {
        let mut loaded = Vec::new();
        loaded.resize(ncpus, 0);
        Self {
            ncpus,
            cur_cpu: AtomicUsize::new(0),
            msrs: Mutex::new(BTreeMap::new()),
            vmcs_store: Mutex::new(BTreeMap::new()),
            loaded: Mutex::new(loaded),
            script: Mutex::new(VecDeque::new()),
            interrupted: AtomicBool::new(false),
            last_injected: AtomicU64::new(0),
            debug_regs: Mutex::new([0; 4]),
            nmis: AtomicU64::new(0),
            tsc: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_msr(&self, index: u32, value: u64) {
        self.msrs.lock().insert(index, value);
    }

    pub(crate) fn push_exit(&self, exit: MockExit) {
        self.script.lock().push_back(exit);
    }

    /// Arm the run-loop interruption flag, as a signal would.
    pub(crate) fn request_interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Interruption info consumed by the most recent guest entry.
    pub(crate) fn last_injected_event(&self) -> u64 {
        self.last_injected.load(Ordering::SeqCst)
    }

    pub(crate) fn nmi_count(&self) -> u64 {
        self.nmis.load(Ordering::SeqCst)
    }

    fn current_region(&self) -> usize {
        self.loaded.lock()[self.cur_cpu.load(Ordering::SeqCst)]
    }

    fn with_fields<R>(&self, f: impl FnOnce(&mut BTreeMap<u32, u64>) -> R) -> R {
        let addr = self.current_region();
        let mut store = self.vmcs_store.lock();
        f(store.entry(addr).or_default())
    }
}

impl HwPort for MockPort {
    fn cpu_count(&self) -> usize {
        self.ncpus
    }

    fn current_cpu(&self) -> usize {
        self.cur_cpu.load(Ordering::SeqCst)
    }

    fn disable_preemption(&self) {}

    fn enable_preemption(&self) {}

    fn yield_cpu(&self) {}

    fn interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    fn on_each_cpu(&self, f: &mut dyn FnMut(usize)) {
        let prev = self.cur_cpu.load(Ordering::SeqCst);
        for cpu in 0..self.ncpus {
            self.cur_cpu.store(cpu, Ordering::SeqCst);
            f(cpu);
        }
        self.cur_cpu.store(prev, Ordering::SeqCst);
    }

    fn on_cpu(&self, cpu: usize, f: &mut dyn FnMut()) {
        let prev = self.cur_cpu.swap(cpu, Ordering::SeqCst);
        f();
        self.cur_cpu.store(prev, Ordering::SeqCst);
    }

    fn has_vmx(&self) -> bool {
        true
    }

    fn vmcs_revision_id(&self) -> u32 {
        MOCK_REVISION_ID
    }

    fn rdmsr(&self, index: u32) -> u64 {
        if let Some(&v) = self.msrs.lock().get(&index) {
            return v;
        }
        match index {
            IA32_VMX_BASIC => MOCK_REVISION_ID as u64,
            IA32_VMX_PINBASED_CTLS | IA32_VMX_PROC_BASED_CTLS | IA32_VMX_EXIT_CTLS
            | IA32_VMX_ENTRY_CTLS => VMX_CTL_ALL_ALLOWED,
            _ => 0,
        }
    }

    fn rdmsr_safe(&self, index: u32) -> Option<u64> {
        Some(self.rdmsr(index))
    }

    fn wrmsr(&self, index: u32, value: u64) {
        self.msrs.lock().insert(index, value);
    }

    fn read_tsc(&self) -> u64 {
        self.tsc.fetch_add(1, Ordering::SeqCst)
    }

    fn vmxon(&self, _region: &VmcsRegion) -> Result<(), InstructionError> {
        Ok(())
    }

    fn vmxoff(&self) {}

    fn vmclear(&self, _region: &VmcsRegion) -> Result<(), InstructionError> {
        // Field contents live in the region's map and survive a clear, as
        // on hardware where vmclear writes state back to memory.
        Ok(())
    }

    fn vmptrld(&self, region: &VmcsRegion) -> Result<(), InstructionError> {
        let cpu = self.cur_cpu.load(Ordering::SeqCst);
        self.loaded.lock()[cpu] = region.address();
        Ok(())
    }

    fn vmread(&self, field: Field) -> Result<u64, InstructionError> {
        Ok(self.with_fields(|f| f.get(&(field as u32)).copied().unwrap_or(0)))
    }

    fn vmwrite(&self, field: Field, value: u64) -> Result<(), InstructionError> {
        self.with_fields(|f| {
            f.insert(field as u32, value);
        });
        Ok(())
    }

    fn guest_enter(&self, _launched: bool, _regs: &mut GuestRegs) -> Result<(), InstructionError> {
        let scripted = self.script.lock().pop_front();
        let (reason, qualification) = match scripted {
            Some(MockExit::FailEntry(e)) => return Err(e),
            Some(MockExit::Exit {
                reason,
                qualification,
            }) => (reason, qualification),
            None => (BasicExitReason::Hlt as u64, 0),
        };
        self.with_fields(|f| {
            let info = f
                .get(&(Field::VmentryInterruptionInfo as u32))
                .copied()
                .unwrap_or(0);
            if info & INTR_INFO_VALID_MASK != 0 {
                self.last_injected.store(info, Ordering::SeqCst);
                f.insert(Field::VmentryInterruptionInfo as u32, 0);
            }
            f.insert(Field::VmexitReason as u32, reason);
            f.insert(Field::VmexitQualification as u32, qualification);
            f.insert(Field::VmexitInstructionLength as u32, 1);
            f.insert(Field::IdtVectoringInfo as u32, 0);
        });
        Ok(())
    }

    fn host_state(&self) -> HostState {
        HostState::default()
    }

    fn read_fs_gs(&self) -> (u16, u16) {
        (0, 0)
    }

    fn load_fs_gs(&self, _fs: u16, _gs: u16) {}

    fn reload_tss(&self) {}

    fn host_entry_point(&self) -> u64 {
        0xffff_8000_0010_0000
    }

    fn fpu_save(&self, _image: &mut FxImage) {}

    fn fpu_restore(&self, _image: &FxImage) {}

    fn fpu_reset(&self) {}

    fn load_debug_regs(&self, dr: &[u64; 4]) {
        *self.debug_regs.lock() = *dr;
    }

    fn raise_nmi(&self) {
        self.nmis.fetch_add(1, Ordering::SeqCst);
    }
}

/// A one-CPU machine with `bytes` of guest memory at address zero.
pub(crate) fn new_test_vm(bytes: u64) -> Vm<MockPort> {
    let machine = Machine::enable(MockPort::new(1)).unwrap();
    let vm = Vm::new(machine);
    vm.set_memory_region(0, Gpa::new(0), bytes, SlotFlags::empty())
        .unwrap();
    vm
}

/// A one-CPU machine with no memory slots at all.
pub(crate) fn new_empty_test_vm() -> Vm<MockPort> {
    Vm::new(Machine::enable(MockPort::new(1)).unwrap())
}
