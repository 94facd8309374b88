//! Production x86_64 implementation of the hardware port.
//!
//! This is the only module containing privileged instructions. The guest
//! entry/exit hand-off lives in a `global_asm!` stub: the host stack pointer
//! is written into the VMCS right before entry so the exit lands back on the
//! same frame, with the register-block pointer parked on the stack across
//! the guest run.

use crate::{
    port::{FxImage, GuestRegs, HostState, HwPort},
    vm_control::IA32_VMX_BASIC,
    vmcs::{Field, InstructionError, VmcsRegion},
    x86,
};
use core::arch::{asm, global_asm};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

global_asm!(
    r#"
.global __vmx_guest_run
// rdi: *mut GuestRegs, sil: launched. Returns 0 on exit, 1 on entry failure.
__vmx_guest_run:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    push rdi
    mov rax, 0x6c14
    vmwrite rax, rsp
    mov rax, 0x6c16
    lea rdx, [rip + __vmx_guest_exit]
    vmwrite rax, rdx
    test sil, sil
    mov rax, [rdi + 0x00]
    mov rcx, [rdi + 0x08]
    mov rdx, [rdi + 0x10]
    mov rbx, [rdi + 0x18]
    mov rbp, [rdi + 0x28]
    mov rsi, [rdi + 0x30]
    mov r8,  [rdi + 0x40]
    mov r9,  [rdi + 0x48]
    mov r10, [rdi + 0x50]
    mov r11, [rdi + 0x58]
    mov r12, [rdi + 0x60]
    mov r13, [rdi + 0x68]
    mov r14, [rdi + 0x70]
    mov r15, [rdi + 0x78]
    mov rdi, [rdi + 0x38]
    jnz 1f
    vmlaunch
    jmp 2f
1:
    vmresume
2:
    // Fell through: the entry itself failed, guest registers unchanged.
    pop rdi
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    mov eax, 1
    ret

.global __vmx_guest_exit
__vmx_guest_exit:
    xchg rdi, [rsp]
    mov [rdi + 0x00], rax
    mov [rdi + 0x08], rcx
    mov [rdi + 0x10], rdx
    mov [rdi + 0x18], rbx
    mov [rdi + 0x28], rbp
    mov [rdi + 0x30], rsi
    mov [rdi + 0x40], r8
    mov [rdi + 0x48], r9
    mov [rdi + 0x50], r10
    mov [rdi + 0x58], r11
    mov [rdi + 0x60], r12
    mov [rdi + 0x68], r13
    mov [rdi + 0x70], r14
    mov [rdi + 0x78], r15
    pop rax
    mov [rdi + 0x38], rax
    mov rax, cr2
    mov [rdi + 0x80], rax
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    xor eax, eax
    ret
"#
);

extern "C" {
    fn __vmx_guest_run(regs: *mut GuestRegs, launched: u8) -> i32;
    fn __vmx_guest_exit();
}

/// Single-CPU production port. An embedding kernel that schedules across
/// physical CPUs supplies its own [`HwPort`] with real cross-CPU calls; this
/// implementation pins everything to the calling processor.
pub struct VmxHardware {
    interrupted: AtomicBool,
    preempt_depth: AtomicUsize,
    saved_rflags: AtomicU64,
}

impl VmxHardware {
    pub const fn new() -> Self {
        Self {
            interrupted: AtomicBool::new(false),
            preempt_depth: AtomicUsize::new(0),
            saved_rflags: AtomicU64::new(0),
        }
    }

    /// Ask a running guest loop to abort at its next cancellation point.
    pub fn request_interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    pub fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::Release);
    }

    #[inline]
    unsafe fn read_cr4(&self) -> u64 {
        let v: u64;
        asm!("mov {}, cr4", out(reg) v, options(nomem, nostack));
        v
    }

    #[inline]
    unsafe fn write_cr4(&self, v: u64) {
        asm!("mov cr4, {}", in(reg) v, options(nomem, nostack));
    }

    fn instruction_error(&self) -> InstructionError {
        // vmread of the error field itself cannot meaningfully fail here.
        let raw = self.vmread(Field::VmInstructionError).unwrap_or(0);
        InstructionError::from(raw as u32)
    }
}

impl Default for VmxHardware {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! vm_pointer_op {
    ($name:ident, $insn:literal) => {
        fn $name(&self, region: &VmcsRegion) -> Result<(), InstructionError> {
            let pa = region.address() as u64;
            let err: u8;
            unsafe {
                asm!(
                    concat!($insn, " [{ptr}]"),
                    "setna {err}",
                    ptr = in(reg) &pa,
                    err = out(reg_byte) err,
                    options(nostack),
                );
            }
            if err == 0 {
                Ok(())
            } else {
                Err(self.instruction_error())
            }
        }
    };
}

impl HwPort for VmxHardware {
    fn cpu_count(&self) -> usize {
        1
    }

    fn current_cpu(&self) -> usize {
        0
    }

    fn disable_preemption(&self) {
        if self.preempt_depth.fetch_add(1, Ordering::AcqRel) == 0 {
            let rflags: u64;
            unsafe {
                asm!("pushfq", "pop {}", "cli", out(reg) rflags, options(nomem));
            }
            self.saved_rflags.store(rflags, Ordering::Release);
        }
    }

    fn enable_preemption(&self) {
        if self.preempt_depth.fetch_sub(1, Ordering::AcqRel) == 1
            && self.saved_rflags.load(Ordering::Acquire) & x86::Rflags::IF.bits() != 0
        {
            unsafe { asm!("sti", options(nomem, nostack)) };
        }
    }

    fn yield_cpu(&self) {
        core::hint::spin_loop();
    }

    fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    fn on_each_cpu(&self, f: &mut dyn FnMut(usize)) {
        f(0)
    }

    fn on_cpu(&self, cpu: usize, f: &mut dyn FnMut()) {
        debug_assert_eq!(cpu, 0);
        f()
    }

    fn has_vmx(&self) -> bool {
        // cpuid.1:ecx[5]
        let r = unsafe { core::arch::x86_64::__cpuid(1) };
        r.ecx & (1 << 5) != 0
    }

    fn vmcs_revision_id(&self) -> u32 {
        (self.rdmsr(IA32_VMX_BASIC) & 0x7fff_ffff) as u32
    }

    fn rdmsr(&self, index: u32) -> u64 {
        let hi: u32;
        let lo: u32;
        unsafe {
            asm!("rdmsr", out("edx") hi, out("eax") lo, in("ecx") index, options(nomem, nostack));
        }
        ((hi as u64) << 32) | lo as u64
    }

    fn rdmsr_safe(&self, index: u32) -> Option<u64> {
        // Every MSR the engine saves is architectural on VMX-capable parts;
        // an embedding kernel with #GP fixups can do better.
        Some(self.rdmsr(index))
    }

    fn wrmsr(&self, index: u32, value: u64) {
        unsafe {
            asm!(
                "wrmsr",
                in("edx") (value >> 32) as u32,
                in("eax") value as u32,
                in("ecx") index,
                options(nomem, nostack)
            );
        }
    }

    fn read_tsc(&self) -> u64 {
        let hi: u32;
        let lo: u32;
        unsafe {
            asm!("rdtsc", out("edx") hi, out("eax") lo, options(nomem, nostack));
        }
        ((hi as u64) << 32) | lo as u64
    }

    fn vmxon(&self, region: &VmcsRegion) -> Result<(), InstructionError> {
        unsafe {
            let cr4 = self.read_cr4();
            if cr4 & x86::Cr4::VMXE.bits() == 0 {
                self.write_cr4(cr4 | x86::Cr4::VMXE.bits());
            }
        }
        let pa = region.address() as u64;
        let err: u8;
        unsafe {
            asm!(
                "vmxon [{ptr}]",
                "setna {err}",
                ptr = in(reg) &pa,
                err = out(reg_byte) err,
                options(nostack),
            );
        }
        if err == 0 {
            Ok(())
        } else {
            Err(InstructionError::Unknown)
        }
    }

    fn vmxoff(&self) {
        unsafe {
            asm!("vmxoff", options(nomem, nostack));
            let cr4 = self.read_cr4();
            self.write_cr4(cr4 & !x86::Cr4::VMXE.bits());
        }
    }

    vm_pointer_op!(vmclear, "vmclear");
    vm_pointer_op!(vmptrld, "vmptrld");

    fn vmread(&self, field: Field) -> Result<u64, InstructionError> {
        let value: u64;
        let err: u8;
        unsafe {
            asm!(
                "vmread {val}, {field}",
                "setna {err}",
                field = in(reg) field as u64,
                val = out(reg) value,
                err = out(reg_byte) err,
                options(nomem, nostack),
            );
        }
        if err == 0 {
            Ok(value)
        } else {
            Err(self.instruction_error())
        }
    }

    fn vmwrite(&self, field: Field, value: u64) -> Result<(), InstructionError> {
        let err: u8;
        unsafe {
            asm!(
                "vmwrite {field}, {val}",
                "setna {err}",
                field = in(reg) field as u64,
                val = in(reg) value,
                err = out(reg_byte) err,
                options(nomem, nostack),
            );
        }
        if err == 0 {
            Ok(())
        } else {
            Err(self.instruction_error())
        }
    }

    fn guest_enter(&self, launched: bool, regs: &mut GuestRegs) -> Result<(), InstructionError> {
        unsafe {
            let cr2: u64;
            asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack));
            if cr2 != regs.cr2 {
                asm!("mov cr2, {}", in(reg) regs.cr2, options(nomem, nostack));
            }
            if __vmx_guest_run(regs, launched as u8) == 0 {
                Ok(())
            } else {
                Err(self.instruction_error())
            }
        }
    }

    fn host_state(&self) -> HostState {
        let mut st = HostState::default();
        let mut gdtr = [0u8; 10];
        let mut idtr = [0u8; 10];
        unsafe {
            asm!("mov {0:x}, cs", out(reg) st.cs_selector, options(nomem, nostack));
            asm!("mov {0:x}, ds", out(reg) st.ds_selector, options(nomem, nostack));
            asm!("mov {0:x}, es", out(reg) st.es_selector, options(nomem, nostack));
            asm!("mov {0:x}, ss", out(reg) st.ss_selector, options(nomem, nostack));
            asm!("str {0:x}", out(reg) st.tr_selector, options(nomem, nostack));
            asm!("sgdt [{}]", in(reg) gdtr.as_mut_ptr(), options(nostack));
            asm!("sidt [{}]", in(reg) idtr.as_mut_ptr(), options(nostack));
            asm!("mov {}, cr0", out(reg) st.cr0, options(nomem, nostack));
            asm!("mov {}, cr3", out(reg) st.cr3, options(nomem, nostack));
            st.cr4 = self.read_cr4();
        }
        st.gdt_base = u64::from_le_bytes(gdtr[2..10].try_into().unwrap_or([0; 8]));
        st.idt_base = u64::from_le_bytes(idtr[2..10].try_into().unwrap_or([0; 8]));
        st.tr_base = descriptor_base(st.gdt_base, st.tr_selector);
        st.fs_base = self.rdmsr(x86::MSR_FS_BASE);
        st.gs_base = self.rdmsr(x86::MSR_GS_BASE);
        st.sysenter_cs = self.rdmsr(x86::MSR_IA32_SYSENTER_CS);
        st.sysenter_esp = self.rdmsr(x86::MSR_IA32_SYSENTER_ESP);
        st.sysenter_eip = self.rdmsr(x86::MSR_IA32_SYSENTER_EIP);
        st
    }

    fn read_fs_gs(&self) -> (u16, u16) {
        let fs: u16;
        let gs: u16;
        unsafe {
            asm!("mov {0:x}, fs", out(reg) fs, options(nomem, nostack));
            asm!("mov {0:x}, gs", out(reg) gs, options(nomem, nostack));
        }
        (fs, gs)
    }

    fn load_fs_gs(&self, fs: u16, gs: u16) {
        unsafe {
            asm!("mov fs, {0:x}", in(reg) fs, options(nostack));
            asm!("mov gs, {0:x}", in(reg) gs, options(nostack));
        }
    }

    fn reload_tss(&self) {
        let st = self.host_state();
        if st.tr_selector == 0 {
            return;
        }
        // ltr refuses a busy TSS; clear the busy bit in the descriptor type.
        let desc = (st.gdt_base + (st.tr_selector & !7) as u64) as *mut u64;
        unsafe {
            let lo = desc.read_volatile();
            desc.write_volatile(lo & !(1u64 << 41));
            asm!("ltr {0:x}", in(reg) st.tr_selector, options(nostack));
        }
    }

    fn host_entry_point(&self) -> u64 {
        __vmx_guest_exit as usize as u64
    }

    fn fpu_save(&self, image: &mut FxImage) {
        unsafe {
            asm!("fxsave64 [{}]", in(reg) image.0.as_mut_ptr(), options(nostack));
        }
    }

    fn fpu_restore(&self, image: &FxImage) {
        unsafe {
            asm!("fxrstor64 [{}]", in(reg) image.0.as_ptr(), options(nostack));
        }
    }

    fn fpu_reset(&self) {
        let mxcsr: u32 = 0x1f80;
        unsafe {
            asm!("fninit", options(nomem, nostack));
            asm!("ldmxcsr [{}]", in(reg) &mxcsr, options(nostack));
        }
    }

    fn load_debug_regs(&self, dr: &[u64; 4]) {
        unsafe {
            asm!("mov dr0, {}", in(reg) dr[0], options(nomem, nostack));
            asm!("mov dr1, {}", in(reg) dr[1], options(nomem, nostack));
            asm!("mov dr2, {}", in(reg) dr[2], options(nomem, nostack));
            asm!("mov dr3, {}", in(reg) dr[3], options(nomem, nostack));
        }
    }

    fn raise_nmi(&self) {
        unsafe { asm!("int 2", options(nomem, nostack)) };
    }
}

/// Base address packed into a GDT system descriptor.
fn descriptor_base(gdt_base: u64, selector: u16) -> u64 {
    if selector == 0 {
        return 0;
    }
    let p = (gdt_base + (selector & !7) as u64) as *const u64;
    unsafe {
        let lo = p.read_volatile();
        let hi = p.add(1).read_volatile();
        let base = ((lo >> 16) & 0xff_ffff) | ((lo >> 32) & 0xff00_0000);
        base | (hi << 32)
    }
}
