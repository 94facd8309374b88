//! Control-register writes and the addressing-mode state machine.
//!
//! The hardware has no real-mode guest support, so real mode is staged as
//! virtual-8086: segments become selector = base >> 4 with vm86-compatible
//! access rights, rflags grows VM and IOPL, and the task register points at
//! a synthetic TSS parked in guest memory. Protected and long mode undo the
//! staging. Guest-initiated writes are validated first and turn into an
//! injected #GP on failure; the guest-visible registers never change on a
//! rejected write.

use crate::{
    port::HwPort,
    vcpu::{LoadedVcpu, SavedSeg, RMODE_TSS_PAGES, RMODE_TSS_SIZE},
    vm_control::VmcsEntryCtl,
    vmcs::{
        Field, SegReg, INTR_INFO_DELIVER_CODE_MASK, INTR_INFO_VALID_MASK,
        INTR_TYPE_HARD_EXCEPTION,
    },
    x86::{
        Cr0, Cr4, Efer, Gpa, Rflags, SegmentAr, CR0_RESERVED_BITS, CR3_L_MODE_RESERVED_BITS,
        CR3_RESERVED_BITS, CR4_RESERVED_BITS, CR8_RESERVED_BITS, EFER_RESERVED_BITS, GP_VECTOR,
        MSR_EFER, PAGE_MASK, PAGE_SHIFT, PDPTE_RESERVED_BITS,
    },
    Result,
};

/// cr0 bits the hardware traps on; also forced on in the real cr0 while the
/// read shadow carries the guest's value.
pub(crate) const CR0_GUEST_HOST_MASK: u64 = Cr0::PG.bits()
    | Cr0::PE.bits()
    | Cr0::WP.bits()
    | Cr0::NE.bits()
    | Cr0::TS.bits()
    | Cr0::MP.bits();
const CR0_ALWAYS_ON: u64 = CR0_GUEST_HOST_MASK;

pub(crate) const CR4_GUEST_HOST_MASK: u64 = Cr4::VME.bits()
    | Cr4::PSE.bits()
    | Cr4::PAE.bits()
    | Cr4::PGE.bits()
    | Cr4::VMXE.bits();
const CR4_PMODE_ALWAYS_ON: u64 = Cr4::VMXE.bits();
const CR4_RMODE_ALWAYS_ON: u64 = Cr4::VME.bits() | Cr4::PAE.bits() | Cr4::VMXE.bits();

/// Segments re-staged on every real-mode transition, paired with their save
/// slots in the vCPU.
const RMODE_SEGS: [SegReg; 4] = [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs];

impl<H: HwPort> LoadedVcpu<'_, H> {
    fn is_paging(&self) -> bool {
        self.vcpu.cr0 & Cr0::PG.bits() != 0
    }

    fn is_pae(&self) -> bool {
        self.vcpu.cr4 & Cr4::PAE.bits() != 0
    }

    fn is_long_mode(&self) -> bool {
        self.vcpu.shadow_efer & Efer::LMA.bits() != 0
    }

    /// Stage a #GP for delivery on the next entry.
    pub(crate) fn inject_gp(&mut self) -> Result<()> {
        self.vmcs.write(Field::VmentryExceptionErrorCode, 0)?;
        self.vmcs.write(
            Field::VmentryInterruptionInfo,
            GP_VECTOR as u64
                | INTR_TYPE_HARD_EXCEPTION
                | INTR_INFO_DELIVER_CODE_MASK
                | INTR_INFO_VALID_MASK,
        )
    }

    /// True when a present PDPT entry under `cr3` has reserved bits set. An
    /// unmapped table reads as clean.
    fn pdptrs_reserved(&self, cr3: u64) -> bool {
        let base = Gpa::new((cr3 & !PAGE_MASK) + ((cr3 & PAGE_MASK) >> 5) * 8);
        let mut buf = [0u8; 32];
        if self.vm.memory().read(base, &mut buf) != buf.len() {
            return false;
        }
        buf.chunks_exact(8).any(|c| {
            let mut b = [0u8; 8];
            b.copy_from_slice(c);
            let pdpte = u64::from_le_bytes(b);
            pdpte & 1 != 0 && pdpte & PDPTE_RESERVED_BITS != 0
        })
    }

    /// Guest write to cr0: validate, then run the mode state machine.
    pub(crate) fn set_cr0(&mut self, cr0: u64) -> Result<()> {
        if cr0 & CR0_RESERVED_BITS != 0 {
            log::debug!("set_cr0: reserved bits in 0x{:x}", cr0);
            return self.inject_gp();
        }
        if cr0 & Cr0::NW.bits() != 0 && cr0 & Cr0::CD.bits() == 0 {
            return self.inject_gp();
        }
        if cr0 & Cr0::PG.bits() != 0 && cr0 & Cr0::PE.bits() == 0 {
            return self.inject_gp();
        }
        if !self.is_paging() && cr0 & Cr0::PG.bits() != 0 {
            if self.vcpu.shadow_efer & Efer::LME.bits() != 0 {
                if !self.is_pae() {
                    return self.inject_gp();
                }
                if self.vmcs.segment(SegReg::Cs)?.l {
                    // 64-bit code segment while enabling paging.
                    return self.inject_gp();
                }
            } else if self.is_pae() && self.pdptrs_reserved(self.vcpu.cr3) {
                return self.inject_gp();
            }
        }
        self.apply_cr0(cr0)?;
        self.reset_translation();
        Ok(())
    }

    /// Unvalidated cr0 apply used by reset and host-initiated state loads.
    pub(crate) fn apply_cr0(&mut self, cr0: u64) -> Result<()> {
        if self.vcpu.rmode.active && cr0 & Cr0::PE.bits() != 0 {
            self.enter_pmode()?;
        }
        if !self.vcpu.rmode.active && cr0 & Cr0::PE.bits() == 0 {
            self.enter_rmode()?;
        }
        if self.vcpu.shadow_efer & Efer::LME.bits() != 0 {
            if !self.is_paging() && cr0 & Cr0::PG.bits() != 0 {
                self.enter_lmode()?;
            }
            if self.is_paging() && cr0 & Cr0::PG.bits() == 0 {
                self.exit_lmode()?;
            }
        }
        self.vmcs.write(Field::Cr0ReadShadow, cr0)?;
        self.vmcs.write(Field::GuestCr0, cr0 | CR0_ALWAYS_ON)?;
        self.vcpu.cr0 = cr0;
        Ok(())
    }

    /// lmsw writes the low machine-status bits; PE can be set but never
    /// cleared this way.
    pub(crate) fn lmsw(&mut self, msw: u64) -> Result<()> {
        self.set_cr0((self.vcpu.cr0 & !0x0e) | (msw & 0x0f))
    }

    pub(crate) fn clts(&mut self) -> Result<()> {
        self.vcpu.cr0 &= !Cr0::TS.bits();
        let cr0 = self.vmcs.read(Field::GuestCr0)?;
        self.vmcs.write(Field::GuestCr0, cr0 & !Cr0::TS.bits())
    }

    pub(crate) fn set_cr3(&mut self, cr3: u64) -> Result<()> {
        if self.is_long_mode() {
            if cr3 & CR3_L_MODE_RESERVED_BITS != 0 {
                return self.inject_gp();
            }
        } else {
            if cr3 & CR3_RESERVED_BITS != 0 {
                return self.inject_gp();
            }
            if self.is_paging() && self.is_pae() && self.pdptrs_reserved(cr3) {
                return self.inject_gp();
            }
        }
        self.vcpu.cr3 = cr3;
        self.vmcs.write(Field::GuestCr3, cr3)?;
        self.vm.translator().new_cr3(&self.translation_ctx());
        Ok(())
    }

    pub(crate) fn set_cr4(&mut self, cr4: u64) -> Result<()> {
        if cr4 & CR4_RESERVED_BITS != 0 {
            return self.inject_gp();
        }
        if self.is_long_mode() {
            if cr4 & Cr4::PAE.bits() == 0 {
                return self.inject_gp();
            }
        } else if self.is_paging()
            && !self.is_pae()
            && cr4 & Cr4::PAE.bits() != 0
            && self.pdptrs_reserved(self.vcpu.cr3)
        {
            return self.inject_gp();
        }
        if cr4 & Cr4::VMXE.bits() != 0 {
            return self.inject_gp();
        }
        self.apply_cr4(cr4)?;
        self.reset_translation();
        Ok(())
    }

    /// Unvalidated cr4 apply used by reset and host-initiated state loads.
    pub(crate) fn apply_cr4(&mut self, cr4: u64) -> Result<()> {
        let always_on = if self.vcpu.rmode.active {
            CR4_RMODE_ALWAYS_ON
        } else {
            CR4_PMODE_ALWAYS_ON
        };
        self.vmcs.write(Field::Cr4ReadShadow, cr4)?;
        self.vmcs.write(Field::GuestCr4, cr4 | always_on)?;
        self.vcpu.cr4 = cr4;
        Ok(())
    }

    pub(crate) fn set_cr8(&mut self, cr8: u64) -> Result<()> {
        if cr8 & CR8_RESERVED_BITS != 0 {
            return self.inject_gp();
        }
        self.vcpu.cr8 = cr8;
        Ok(())
    }

    /// Guest wrmsr to EFER.
    pub(crate) fn set_efer(&mut self, efer: u64) -> Result<()> {
        if efer & EFER_RESERVED_BITS != 0 {
            log::debug!("set_efer: reserved bits in 0x{:x}", efer);
            return self.inject_gp();
        }
        if self.is_paging()
            && (self.vcpu.shadow_efer ^ efer) & Efer::LME.bits() != 0
        {
            // LME flips only while paging is off.
            return self.inject_gp();
        }
        let efer = (efer & !Efer::LMA.bits()) | (self.vcpu.shadow_efer & Efer::LMA.bits());
        self.vcpu.shadow_efer = efer;
        let mut data = efer;
        if efer & Efer::LMA.bits() == 0 {
            data &= !Efer::LME.bits();
        }
        if let Some(entry) = self.vcpu.find_msr(MSR_EFER) {
            entry.data = data;
        }
        Ok(())
    }

    /// Unvalidated EFER apply used by reset and host-initiated state loads.
    pub(crate) fn apply_efer(&mut self, efer: u64) -> Result<()> {
        self.vcpu.shadow_efer = efer;
        let ctl = self.vmcs.read(Field::VmentryControls)?;
        let ia32e = VmcsEntryCtl::IA32E_MODE_GUEST.bits() as u64;
        let (ctl, data) = if efer & Efer::LMA.bits() != 0 {
            (ctl | ia32e, efer)
        } else {
            (ctl & !ia32e, efer & !Efer::LME.bits())
        };
        self.vmcs.write(Field::VmentryControls, ctl)?;
        if let Some(entry) = self.vcpu.find_msr(MSR_EFER) {
            entry.data = data;
        }
        Ok(())
    }

    /// Base of the synthetic real-mode TSS: the top frames of slot 0,
    /// clamped to the slot size.
    fn rmode_tss_base(&self) -> u64 {
        match self.vm.memory().slot0_range() {
            Some((base_gfn, npages)) => {
                let span = core::cmp::min(RMODE_TSS_PAGES, npages);
                (base_gfn + npages - span) << PAGE_SHIFT
            }
            None => 0,
        }
    }

    fn enter_pmode(&mut self) -> Result<()> {
        self.vcpu.rmode.active = false;

        let tr = self.vcpu.rmode.tr;
        self.vmcs.write(Field::GuestTrBase, tr.base)?;
        self.vmcs.write(Field::GuestTrLimit, tr.limit as u64)?;
        self.vmcs.write(Field::GuestTrArBytes, tr.ar as u64)?;

        let flags = self.vmcs.read(Field::GuestRflags)?;
        let flags = (flags & !(Rflags::IOPL_MASK | Rflags::VM.bits()))
            | (self.vcpu.rmode.save_iopl << Rflags::IOPL_SHIFT);
        self.vmcs.write(Field::GuestRflags, flags)?;

        let cr4 = self.vmcs.read(Field::GuestCr4)?;
        let shadow = self.vmcs.read(Field::Cr4ReadShadow)?;
        self.vmcs.write(
            Field::GuestCr4,
            (cr4 & !Cr4::VME.bits()) | (shadow & Cr4::VME.bits()),
        )?;

        self.update_exception_bitmap()?;

        for (i, seg) in RMODE_SEGS.iter().enumerate() {
            self.fix_pmode_dataseg(i, *seg)?;
        }
        self.vmcs.write(Field::GuestSsSelector, 0)?;
        self.vmcs.write(Field::GuestSsArBytes, 0x93)?;
        let cs_sel = self.vmcs.read(Field::GuestCsSelector)?;
        self.vmcs.write(Field::GuestCsSelector, cs_sel & !3)?;
        self.vmcs.write(Field::GuestCsArBytes, 0x9b)
    }

    fn enter_rmode(&mut self) -> Result<()> {
        self.vcpu.rmode.active = true;

        self.vcpu.rmode.tr.base = self.vmcs.read(Field::GuestTrBase)?;
        self.vmcs.write(Field::GuestTrBase, self.rmode_tss_base())?;
        self.vcpu.rmode.tr.limit = self.vmcs.read(Field::GuestTrLimit)? as u32;
        self.vmcs.write(Field::GuestTrLimit, RMODE_TSS_SIZE - 1)?;
        self.vcpu.rmode.tr.ar = self.vmcs.read(Field::GuestTrArBytes)? as u32;
        self.vmcs.write(Field::GuestTrArBytes, 0x008b)?;

        let flags = self.vmcs.read(Field::GuestRflags)?;
        self.vcpu.rmode.save_iopl = (flags & Rflags::IOPL_MASK) >> Rflags::IOPL_SHIFT;
        self.vmcs
            .write(Field::GuestRflags, flags | Rflags::IOPL_MASK | Rflags::VM.bits())?;

        let cr4 = self.vmcs.read(Field::GuestCr4)?;
        self.vmcs.write(Field::GuestCr4, cr4 | Cr4::VME.bits())?;

        self.update_exception_bitmap()?;

        let ss_base = self.vmcs.read(Field::GuestSsBase)?;
        self.vmcs.write(Field::GuestSsSelector, ss_base >> 4)?;
        self.vmcs.write(Field::GuestSsLimit, 0xffff)?;
        self.vmcs.write(Field::GuestSsArBytes, 0xf3)?;

        for (i, seg) in RMODE_SEGS.iter().enumerate() {
            self.fix_rmode_seg(i, *seg)?;
        }
        Ok(())
    }

    /// Stash the protected-mode view of a segment and stage the vm86 one.
    fn fix_rmode_seg(&mut self, idx: usize, seg: SegReg) -> Result<()> {
        let f = seg.fields();
        let saved = SavedSeg {
            selector: self.vmcs.read(f.selector)? as u16,
            base: self.vmcs.read(f.base)?,
            limit: self.vmcs.read(f.limit)? as u32,
            ar: self.vmcs.read(f.ar)? as u32,
        };
        self.vmcs.write(f.selector, saved.base >> 4)?;
        self.vmcs.write(f.limit, 0xffff)?;
        self.vmcs.write(f.ar, 0xf3)?;
        self.vcpu.rmode.segs[idx] = saved;
        Ok(())
    }

    /// Restore a data segment on leaving real mode. If the guest moved the
    /// segment base while in vm86, the stash is stale; synthesize flat
    /// access rights from the current selector's RPL instead.
    fn fix_pmode_dataseg(&mut self, idx: usize, seg: SegReg) -> Result<()> {
        let f = seg.fields();
        let save = self.vcpu.rmode.segs[idx];
        if self.vmcs.read(f.base)? == save.base {
            self.vmcs.write(f.selector, save.selector as u64)?;
            self.vmcs.write(f.limit, save.limit as u64)?;
            self.vmcs.write(f.ar, save.ar as u64)
        } else {
            let dpl = (self.vmcs.read(f.selector)? & 3) << SegmentAr::DPL_SHIFT;
            self.vmcs.write(f.ar, 0x93 | dpl)
        }
    }

    fn enter_lmode(&mut self) -> Result<()> {
        let tr_ar = self.vmcs.read(Field::GuestTrArBytes)?;
        if tr_ar as u32 & SegmentAr::TYPE_MASK != SegmentAr::TYPE_BUSY_64_TSS {
            log::debug!("tss fixup for long-mode entry");
            self.vmcs.write(
                Field::GuestTrArBytes,
                (tr_ar & !(SegmentAr::TYPE_MASK as u64)) | SegmentAr::TYPE_BUSY_64_TSS as u64,
            )?;
        }
        self.vcpu.shadow_efer |= Efer::LMA.bits();
        if let Some(entry) = self.vcpu.find_msr(MSR_EFER) {
            entry.data |= Efer::LMA.bits() | Efer::LME.bits();
        }
        let ctl = self.vmcs.read(Field::VmentryControls)?;
        self.vmcs.write(
            Field::VmentryControls,
            ctl | VmcsEntryCtl::IA32E_MODE_GUEST.bits() as u64,
        )
    }

    fn exit_lmode(&mut self) -> Result<()> {
        self.vcpu.shadow_efer &= !Efer::LMA.bits();
        let ctl = self.vmcs.read(Field::VmentryControls)?;
        self.vmcs.write(
            Field::VmentryControls,
            ctl & !(VmcsEntryCtl::IA32E_MODE_GUEST.bits() as u64),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::new_test_vm;
    use crate::vcpu;

    fn pending_gp(v: &LoadedVcpu<'_, crate::testing::MockPort>) -> bool {
        let info = v.vmcs.read(Field::VmentryInterruptionInfo).unwrap();
        info & INTR_INFO_VALID_MASK != 0 && info & 0xff == GP_VECTOR as u64
    }

    #[test]
    fn reserved_cr0_bits_inject_gp_without_state_change() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        let before = v.vcpu.cr0;
        v.set_cr0(before | (1 << 6)).unwrap();
        assert_eq!(v.vcpu.cr0, before);
        assert!(pending_gp(&v));
    }

    #[test]
    fn nw_without_cd_is_rejected() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        v.set_cr0(Cr0::NW.bits() | Cr0::ET.bits()).unwrap();
        assert!(pending_gp(&v));
    }

    #[test]
    fn paging_without_protection_is_rejected() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        v.set_cr0(Cr0::PG.bits() | Cr0::ET.bits()).unwrap();
        assert!(pending_gp(&v));
    }

    #[test]
    fn protection_enable_leaves_and_reenters_real_mode() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        // Reset dropped the vCPU into vm86-staged real mode.
        assert!(v.vcpu.rmode.active);
        let flags = v.vmcs.read(Field::GuestRflags).unwrap();
        assert_ne!(flags & Rflags::VM.bits(), 0);

        v.set_cr0(Cr0::PE.bits() | Cr0::ET.bits()).unwrap();
        assert!(!v.vcpu.rmode.active);
        let flags = v.vmcs.read(Field::GuestRflags).unwrap();
        assert_eq!(flags & Rflags::VM.bits(), 0);

        v.set_cr0(Cr0::ET.bits()).unwrap();
        assert!(v.vcpu.rmode.active);
    }

    #[test]
    fn repeated_protection_enable_is_idempotent() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let pe = Cr0::PE.bits() | Cr0::ET.bits();
        {
            let mut v = vcpu::bind(&vm, 0).unwrap();
            v.set_cr0(pe).unwrap();
        }
        let once = vm.get_sregs(0).unwrap();
        {
            let mut v = vcpu::bind(&vm, 0).unwrap();
            v.set_cr0(pe).unwrap();
        }
        assert_eq!(vm.get_sregs(0).unwrap(), once);
    }

    #[test]
    fn real_mode_ss_follows_its_base() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        v.set_cr0(Cr0::PE.bits() | Cr0::ET.bits()).unwrap();
        v.vmcs.write(Field::GuestSsBase, 0x12340).unwrap();
        v.set_cr0(Cr0::ET.bits()).unwrap();
        assert_eq!(v.vmcs.read(Field::GuestSsSelector).unwrap(), 0x1234);
        assert_eq!(v.vmcs.read(Field::GuestSsArBytes).unwrap(), 0xf3);
    }

    #[test]
    fn lmsw_cannot_clear_protection() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        v.set_cr0(Cr0::PE.bits() | Cr0::ET.bits()).unwrap();
        v.lmsw(0).unwrap();
        assert_ne!(v.vcpu.cr0 & Cr0::PE.bits(), 0);
        assert!(!v.vcpu.rmode.active);
    }

    #[test]
    fn cr4_vmxe_write_injects_gp() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        v.set_cr4(Cr4::VMXE.bits()).unwrap();
        assert!(pending_gp(&v));
        assert_eq!(v.vcpu.cr4 & Cr4::VMXE.bits(), 0);
    }

    #[test]
    fn cr8_accepts_only_low_priority_bits() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        v.set_cr8(0xf).unwrap();
        assert_eq!(v.vcpu.cr8, 0xf);
        v.set_cr8(0x10).unwrap();
        assert!(pending_gp(&v));
        assert_eq!(v.vcpu.cr8, 0xf);
    }

    #[test]
    fn efer_lme_cannot_flip_while_paging() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        // Fake an already-paging guest.
        v.vcpu.cr0 |= Cr0::PG.bits() | Cr0::PE.bits();
        v.set_efer(Efer::LME.bits()).unwrap();
        assert!(pending_gp(&v));
        assert_eq!(v.vcpu.shadow_efer & Efer::LME.bits(), 0);
    }

    #[test]
    fn clts_clears_only_task_switched() {
        let vm = new_test_vm(0x4000);
        vm.create_vcpu(0).unwrap();
        let mut v = vcpu::bind(&vm, 0).unwrap();
        v.vcpu.cr0 |= Cr0::TS.bits();
        let before = v.vcpu.cr0;
        v.clts().unwrap();
        assert_eq!(v.vcpu.cr0, before & !Cr0::TS.bits());
    }
}
