//! Bridge to the external instruction emulator.
//!
//! The engine does not decode or execute guest instructions itself. When an
//! exit needs software execution (real-mode #GP, unresolved page faults),
//! it hands control to an externally supplied [`InstructionEmulator`]
//! together with an [`EmulatorOps`] callback surface. Memory accesses the
//! callbacks cannot satisfy from guest RAM are staged as an MMIO request
//! and surfaced to the controlling process, which completes them and
//! re-enters the run loop.

use crate::{
    mmu::Translation,
    port::HwPort,
    vcpu::LoadedVcpu,
    x86::{Gva, PAGE_SIZE},
    Result,
};
use alloc::string::String;
use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter};

/// Emulator-visible access failures, mirroring what a faulting instruction
/// would do on hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulateError {
    /// The access or instruction is outside what can be emulated.
    Unhandleable,
    /// The access faults under the guest's paging; the caller should let
    /// the fault reach the guest.
    PropagateFault,
}

/// Callback surface the engine hands to the instruction emulator.
pub trait EmulatorOps {
    /// Read through the guest's paging with no MMIO fallback; used for
    /// instruction fetch and descriptor access.
    fn read_std(&mut self, addr: Gva, buf: &mut [u8]) -> core::result::Result<(), EmulateError>;

    /// Write counterpart of `read_std`.
    fn write_std(&mut self, addr: Gva, buf: &[u8]) -> core::result::Result<(), EmulateError>;

    /// Data read for the emulated instruction: guest RAM if the address
    /// resolves, otherwise an MMIO read request is staged.
    fn read_emulated(&mut self, addr: Gva, buf: &mut [u8])
        -> core::result::Result<(), EmulateError>;

    /// Data write for the emulated instruction: guest RAM if the address
    /// resolves, otherwise the write is staged as an MMIO request.
    fn write_emulated(&mut self, addr: Gva, buf: &[u8]) -> core::result::Result<(), EmulateError>;

    /// Atomic compare-exchange for the emulated instruction.
    fn cmpxchg_emulated(
        &mut self,
        addr: Gva,
        old: &[u8],
        new: &[u8],
    ) -> core::result::Result<(), EmulateError>;
}

/// Externally supplied instruction emulator.
pub trait InstructionEmulator: Send + Sync {
    /// Decode and execute the instruction at `rip`. `cr2` carries the
    /// faulting linear address when invoked from a page fault, 0 otherwise.
    fn emulate(
        &self,
        ops: &mut dyn EmulatorOps,
        rip: Gva,
        cr2: u64,
        bitness: u32,
    ) -> core::result::Result<(), EmulateError>;
}

/// In-flight MMIO access staged by the emulator callbacks.
#[derive(Default)]
pub(crate) struct MmioState {
    pub needed: bool,
    pub is_write: bool,
    pub phys_addr: u64,
    pub data: [u8; 8],
    pub len: usize,
    /// Set when the controlling process delivered read data.
    pub read_completed: bool,
}

/// What the run loop should do after an emulation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EmulationOutcome {
    /// Instruction fully retired in software.
    Handled,
    /// An MMIO request is staged; surface it to the controlling process.
    Mmio,
    /// Unemulatable instruction.
    Failed,
}

struct Bridge<'v, 'a, H: HwPort> {
    vcpu: &'v mut LoadedVcpu<'a, H>,
}

impl<H: HwPort> Bridge<'_, '_, H> {
    fn translate(&self, addr: Gva) -> Option<Translation> {
        let ctx = self.vcpu.translation_ctx();
        self.vcpu.vm.translator().gva_to_gpa(&ctx, addr)
    }
}

impl<H: HwPort> EmulatorOps for Bridge<'_, '_, H> {
    fn read_std(&mut self, addr: Gva, buf: &mut [u8]) -> core::result::Result<(), EmulateError> {
        // Page by page; translations are only valid within one frame.
        let mut done = 0;
        while done < buf.len() {
            let cur = addr + done as u64;
            let chunk = core::cmp::min(
                buf.len() - done,
                (PAGE_SIZE - cur.page_offset()) as usize,
            );
            let tr = self.translate(cur).ok_or(EmulateError::Unhandleable)?;
            let dst = &mut buf[done..done + chunk];
            if self.vcpu.vm.memory().read(tr.gpa, dst) != chunk {
                return Err(EmulateError::Unhandleable);
            }
            done += chunk;
        }
        Ok(())
    }

    fn write_std(&mut self, addr: Gva, buf: &[u8]) -> core::result::Result<(), EmulateError> {
        log::warn!(
            "write_std not implemented: {:?}, {} bytes",
            addr,
            buf.len()
        );
        Err(EmulateError::Unhandleable)
    }

    fn read_emulated(
        &mut self,
        addr: Gva,
        buf: &mut [u8],
    ) -> core::result::Result<(), EmulateError> {
        let tr = self.translate(addr).ok_or(EmulateError::PropagateFault)?;
        let gpa = tr.gpa.into_u64();
        {
            let mmio = &mut self.vcpu.vcpu.mmio;
            if mmio.read_completed && mmio.phys_addr == gpa {
                let n = core::cmp::min(buf.len(), mmio.len);
                buf[..n].copy_from_slice(&mmio.data[..n]);
                mmio.read_completed = false;
                return Ok(());
            }
        }
        if self.read_std(addr, buf).is_ok() {
            return Ok(());
        }
        let mmio = &mut self.vcpu.vcpu.mmio;
        mmio.needed = true;
        mmio.is_write = false;
        mmio.phys_addr = gpa;
        mmio.len = core::cmp::min(buf.len(), mmio.data.len());
        Err(EmulateError::Unhandleable)
    }

    fn write_emulated(&mut self, addr: Gva, buf: &[u8]) -> core::result::Result<(), EmulateError> {
        let tr = self.translate(addr).ok_or(EmulateError::PropagateFault)?;
        if self.vcpu.vm.memory().write(tr.gpa, buf) == buf.len() {
            return Ok(());
        }
        let mmio = &mut self.vcpu.vcpu.mmio;
        mmio.needed = true;
        mmio.is_write = true;
        mmio.phys_addr = tr.gpa.into_u64();
        mmio.len = core::cmp::min(buf.len(), mmio.data.len());
        let n = mmio.len;
        mmio.data[..n].copy_from_slice(&buf[..n]);
        Ok(())
    }

    fn cmpxchg_emulated(
        &mut self,
        addr: Gva,
        _old: &[u8],
        new: &[u8],
    ) -> core::result::Result<(), EmulateError> {
        if !self.vcpu.vcpu.reported_emulation_failure {
            log::warn!("emulating exchange as write at {:?}", addr);
        }
        self.write_emulated(addr, new)
    }
}

impl<H: HwPort> LoadedVcpu<'_, H> {
    /// Instruction width implied by the current code segment.
    pub(crate) fn code_bitness(&self) -> Result<u32> {
        let cs = self.vmcs.segment(crate::vmcs::SegReg::Cs)?;
        Ok(if cs.l {
            64
        } else if cs.db {
            32
        } else {
            16
        })
    }

    /// Run the external emulator on the current instruction.
    pub(crate) fn emulate_instruction(&mut self, cr2: u64) -> Result<EmulationOutcome> {
        let rip = Gva::new(self.vmcs.read(crate::vmcs::Field::GuestRip)?);
        let bitness = self.code_bitness()?;
        let emulator = match self.vm.emulator() {
            Some(e) => e,
            None => {
                self.report_emulation_failure(rip, bitness);
                return Ok(EmulationOutcome::Failed);
            }
        };
        let outcome = emulator.emulate(&mut Bridge { vcpu: self }, rip, cr2, bitness);
        if self.vcpu.mmio.needed {
            return Ok(EmulationOutcome::Mmio);
        }
        match outcome {
            Ok(()) => Ok(EmulationOutcome::Handled),
            Err(_) => {
                self.report_emulation_failure(rip, bitness);
                Ok(EmulationOutcome::Failed)
            }
        }
    }

    /// Log the undecodable instruction once per vCPU lifetime.
    fn report_emulation_failure(&mut self, rip: Gva, bitness: u32) {
        if self.vcpu.reported_emulation_failure {
            return;
        }
        self.vcpu.reported_emulation_failure = true;
        let mut bytes = [0u8; 16];
        let n = {
            let mut bridge = Bridge { vcpu: self };
            match bridge.read_std(rip, &mut bytes) {
                Ok(()) => bytes.len(),
                Err(_) => 0,
            }
        };
        if n == 0 {
            log::error!("emulation failed at {:?}: instruction bytes unreadable", rip);
            return;
        }
        let mut decoder =
            Decoder::with_ip(bitness, &bytes[..n], rip.into_u64(), DecoderOptions::NONE);
        let insn = decoder.decode();
        let mut text = String::new();
        IntelFormatter::new().format(&insn, &mut text);
        log::error!("emulation failed at {:?}: {}", rip, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::new_test_vm;
    use crate::vcpu;
    use crate::x86::Gpa;

    #[test]
    fn read_std_crosses_page_boundaries() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        let data: [u8; 32] = core::array::from_fn(|i| i as u8);
        vm.memory().write(Gpa::new(0xff0), &data);
        let mut out = [0u8; 32];
        let mut bridge = Bridge { vcpu: &mut v };
        bridge.read_std(Gva::new(0xff0), &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn standard_writes_are_refused() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        let mut bridge = Bridge { vcpu: &mut v };
        assert_eq!(
            bridge.write_std(Gva::new(0x100), &[0u8; 4]),
            Err(EmulateError::Unhandleable)
        );
    }

    #[test]
    fn unmapped_write_stages_mmio_request() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        let mut bridge = Bridge { vcpu: &mut v };
        bridge
            .write_emulated(Gva::new(0xfee0_0000), &0xdead_beefu32.to_le_bytes())
            .unwrap();
        let mmio = &v.vcpu.mmio;
        assert!(mmio.needed && mmio.is_write);
        assert_eq!(mmio.phys_addr, 0xfee0_0000);
        assert_eq!(&mmio.data[..4], &0xdead_beefu32.to_le_bytes());
    }

    #[test]
    fn unmapped_read_stages_request_and_aborts() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        let mut buf = [0u8; 4];
        let mut bridge = Bridge { vcpu: &mut v };
        assert_eq!(
            bridge.read_emulated(Gva::new(0xfee0_0000), &mut buf),
            Err(EmulateError::Unhandleable)
        );
        let mmio = &v.vcpu.mmio;
        assert!(mmio.needed && !mmio.is_write);
        assert_eq!(mmio.phys_addr, 0xfee0_0000);
    }

    #[test]
    fn completed_mmio_read_is_consumed_once() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        v.vcpu.mmio.phys_addr = 0xfee0_0000;
        v.vcpu.mmio.len = 4;
        v.vcpu.mmio.data[..4].copy_from_slice(&[1, 2, 3, 4]);
        v.vcpu.mmio.read_completed = true;
        let mut buf = [0u8; 4];
        let mut bridge = Bridge { vcpu: &mut v };
        bridge.read_emulated(Gva::new(0xfee0_0000), &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert!(!v.vcpu.mmio.read_completed);
    }
}
