//! Architectural definitions shared by the whole engine: guest address
//! newtypes, control-register and flags bit fields, MSR indices, exception
//! vectors and segment access-rights packing.

pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Guest virtual (linear) address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Gva(u64);

impl Gva {
    #[inline(always)]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }

    /// Offset within the containing page.
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }
}

/// Guest physical address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Gpa(u64);

impl Gpa {
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }

    /// Frame number of the containing page.
    #[inline]
    pub const fn gfn(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Offset within the containing page.
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<u64> for $t {
            type Output = Self;

            fn add(self, other: u64) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<u64> for $t {
            fn add_assign(&mut self, other: u64) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<u64> for $t {
            type Output = Self;

            fn sub(self, other: u64) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::BitAnd<u64> for $t {
            type Output = Self;

            fn bitand(self, other: u64) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Gva);
impl_arith!(Gpa);

impl core::fmt::Debug for Gva {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gva(0x{:x})", self.0)
    }
}
impl core::fmt::Debug for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}

bitflags::bitflags! {
    /// rflags.
    #[repr(transparent)]
    pub struct Rflags: u64 {
        /// Carry Flag
        const CF = 1 << 0;
        /// Must be 1.
        const _1 = 1 << 1;
        /// Parity Flag
        const PF = 1 << 2;
        /// Adjust Flag
        const AF = 1 << 4;
        /// Zero Flag
        const ZF = 1 << 6;
        /// Sign Flag
        const SF = 1 << 7;
        /// Trap Flag
        const TF = 1 << 8;
        /// Interrupt enable.
        const IF = 1 << 9;
        /// Direction Flag
        const DF = 1 << 10;
        /// Overflow Flag
        const OF = 1 << 11;
        /// I/O privilege level field - bit 0
        const IOPL0 = 1 << 12;
        /// I/O privilege level field - bit 1
        const IOPL1 = 1 << 13;
        /// Nested Task
        const NT = 1 << 14;
        /// Resume Flag
        const RF = 1 << 16;
        /// Virtual-8086 Mode
        const VM = 1 << 17;
        /// Alignment Check
        const AC = 1 << 18;
    }
}

impl Rflags {
    pub const IOPL_SHIFT: u64 = 12;
    pub const IOPL_MASK: u64 = 3 << Self::IOPL_SHIFT;
}

bitflags::bitflags! {
    /// cr0.
    #[repr(transparent)]
    pub struct Cr0: u64 {
        /// Protection Enable
        const PE = 1 << 0;
        /// Monitor Coprocessor
        const MP = 1 << 1;
        /// Emulation
        const EM = 1 << 2;
        /// Task Switched
        const TS = 1 << 3;
        /// Extension Type
        const ET = 1 << 4;
        /// Numeric Error
        const NE = 1 << 5;
        /// Write Protect
        const WP = 1 << 16;
        /// Alignment Mask
        const AM = 1 << 18;
        /// Not Write-through
        const NW = 1 << 29;
        /// Cache Disable
        const CD = 1 << 30;
        /// Paging
        const PG = 1 << 31;
    }
}

bitflags::bitflags! {
    /// cr4.
    #[repr(transparent)]
    pub struct Cr4: u64 {
        /// Virtual-8086 Mode Extensions
        const VME = 1 << 0;
        /// Protected-Mode Virtual Interrupts
        const PVI = 1 << 1;
        /// Time Stamp Disable
        const TSD = 1 << 2;
        /// Debugging Extensions
        const DE = 1 << 3;
        /// Page Size Extensions
        const PSE = 1 << 4;
        /// Physical Address Extension
        const PAE = 1 << 5;
        /// Machine-Check Enable
        const MCE = 1 << 6;
        /// Page Global Enable
        const PGE = 1 << 7;
        /// Performance-Monitoring Counter Enable
        const PCE = 1 << 8;
        /// OS FXSAVE/FXRSTOR Support
        const OSFXSR = 1 << 9;
        /// OS Unmasked SIMD Exception Support
        const OSXMMEXCPT = 1 << 10;
        /// VMX Enable
        const VMXE = 1 << 13;
    }
}

bitflags::bitflags! {
    /// Extended feature enable register.
    #[repr(transparent)]
    pub struct Efer: u64 {
        /// Syscall Enable
        const SCE = 1 << 0;
        /// Long Mode Enable
        const LME = 1 << 8;
        /// Long Mode Active
        const LMA = 1 << 10;
        /// No-Execute Enable
        const NXE = 1 << 11;
    }
}

// Reserved-bit masks checked before any control-register write is applied.
pub const CR0_RESERVED_BITS: u64 = 0xffff_ffff_1ffa_ffc0;
pub const CR3_RESERVED_BITS: u64 = 0x07;
pub const CR3_L_MODE_RESERVED_BITS: u64 = !((1u64 << 40) - 1) | 0x0fe7;
pub const CR4_RESERVED_BITS: u64 = !((1u64 << 14) - 1) | (1 << 12) | (1 << 11);
pub const CR8_RESERVED_BITS: u64 = !0x0f;
pub const EFER_RESERVED_BITS: u64 = 0xffff_ffff_ffff_f2fe;
/// Reserved bits of a present page-directory-pointer-table entry.
pub const PDPTE_RESERVED_BITS: u64 = 0xffff_fff0_0000_01e6;

// Exception vectors the engine cares about.
pub const DB_VECTOR: u8 = 1;
pub const NMI_VECTOR: u8 = 2;
pub const BP_VECTOR: u8 = 3;
pub const GP_VECTOR: u8 = 13;
pub const PF_VECTOR: u8 = 14;

// Model-specific registers.
pub const MSR_IA32_TSC: u32 = 0x10;
pub const MSR_IA32_APIC_BASE: u32 = 0x1b;
pub const MSR_IA32_FEATURE_CONTROL: u32 = 0x3a;
pub const MSR_IA32_PLATFORM_ID: u32 = 0xfe;
pub const MSR_IA32_UCODE_WRITE: u32 = 0x79;
pub const MSR_IA32_UCODE_REV: u32 = 0x8b;
pub const MSR_IA32_SYSENTER_CS: u32 = 0x174;
pub const MSR_IA32_MCG_CAP: u32 = 0x179;
pub const MSR_IA32_MCG_STATUS: u32 = 0x17a;
pub const MSR_MTRR_FIRST: u32 = 0x200;
pub const MSR_MTRR_LAST: u32 = 0x2ff;
pub const MSR_IA32_MC0_CTL: u32 = 0x400;
pub const MSR_IA32_MC0_STATUS: u32 = 0x401;
pub const MSR_IA32_MC0_MISC: u32 = 0x403;
pub const MSR_IA32_SYSENTER_ESP: u32 = 0x175;
pub const MSR_IA32_SYSENTER_EIP: u32 = 0x176;
pub const MSR_EFER: u32 = 0xc000_0080;
pub const MSR_STAR: u32 = 0xc000_0081;
pub const MSR_LSTAR: u32 = 0xc000_0082;
pub const MSR_CSTAR: u32 = 0xc000_0083;
pub const MSR_SYSCALL_MASK: u32 = 0xc000_0084;
pub const MSR_FS_BASE: u32 = 0xc000_0100;
pub const MSR_GS_BASE: u32 = 0xc000_0101;
pub const MSR_KERNEL_GS_BASE: u32 = 0xc000_0102;

pub const FEATURE_CONTROL_LOCKED: u64 = 1 << 0;
pub const FEATURE_CONTROL_VMXON_ENABLED: u64 = 1 << 2;

/// General-purpose register file indices, in hardware encoding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

pub const NR_VCPU_REGS: usize = 16;

impl Reg {
    /// Register from the 4-bit encoding found in exit qualifications.
    pub fn from_encoding(enc: u64) -> Self {
        match enc & 0xf {
            0 => Reg::Rax,
            1 => Reg::Rcx,
            2 => Reg::Rdx,
            3 => Reg::Rbx,
            4 => Reg::Rsp,
            5 => Reg::Rbp,
            6 => Reg::Rsi,
            7 => Reg::Rdi,
            8 => Reg::R8,
            9 => Reg::R9,
            10 => Reg::R10,
            11 => Reg::R11,
            12 => Reg::R12,
            13 => Reg::R13,
            14 => Reg::R14,
            _ => Reg::R15,
        }
    }
}

bitflags::bitflags! {
    /// Segment access-rights byte as stored in the VMCS, plus the hardware
    /// "unusable" marker bit.
    #[repr(transparent)]
    pub struct SegmentAr: u32 {
        const TYPE_ACCESSED = 1 << 0;
        const TYPE_WRITE = 1 << 1;
        const TYPE_EXPAND_DOWN = 1 << 2;
        const TYPE_CODE = 1 << 3;
        /// Descriptor type (0 = system, 1 = code/data).
        const S = 1 << 4;
        const DPL0 = 1 << 5;
        const DPL1 = 1 << 6;
        /// Present.
        const P = 1 << 7;
        /// Available for system software.
        const AVL = 1 << 12;
        /// 64-bit code segment.
        const L = 1 << 13;
        /// Default operation size.
        const DB = 1 << 14;
        /// Granularity.
        const G = 1 << 15;
        /// Segment unusable.
        const UNUSABLE = 1 << 16;
    }
}

impl SegmentAr {
    pub const TYPE_MASK: u32 = 0xf;
    pub const DPL_SHIFT: u32 = 5;
    /// System-descriptor type of a busy 64-bit TSS.
    pub const TYPE_BUSY_64_TSS: u32 = 11;
}

/// A segment register snapshot exchanged with the controlling process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: bool,
    pub dpl: u8,
    pub db: bool,
    pub s: bool,
    pub l: bool,
    pub g: bool,
    pub avl: bool,
    pub unusable: bool,
}

impl Segment {
    /// Pack into the VMCS access-rights format.
    pub fn access_rights(&self) -> u32 {
        if self.unusable {
            return SegmentAr::UNUSABLE.bits();
        }
        (self.type_ as u32 & SegmentAr::TYPE_MASK)
            | (self.s as u32) << 4
            | (self.dpl as u32 & 3) << SegmentAr::DPL_SHIFT
            | (self.present as u32) << 7
            | (self.avl as u32) << 12
            | (self.l as u32) << 13
            | (self.db as u32) << 14
            | (self.g as u32) << 15
    }

    /// Unpack from the VMCS access-rights format.
    pub fn set_access_rights(&mut self, ar: u32) {
        self.unusable = ar & SegmentAr::UNUSABLE.bits() != 0;
        self.type_ = (ar & SegmentAr::TYPE_MASK) as u8;
        self.s = ar & SegmentAr::S.bits() != 0;
        self.dpl = ((ar >> SegmentAr::DPL_SHIFT) & 3) as u8;
        self.present = ar & SegmentAr::P.bits() != 0;
        self.avl = ar & SegmentAr::AVL.bits() != 0;
        self.l = ar & SegmentAr::L.bits() != 0;
        self.db = ar & SegmentAr::DB.bits() != 0;
        self.g = ar & SegmentAr::G.bits() != 0;
    }
}

/// A descriptor-table register snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_rights_round_trip() {
        let seg = Segment {
            base: 0,
            limit: 0xffff,
            selector: 0x10,
            type_: 0xb,
            present: true,
            dpl: 0,
            db: true,
            s: true,
            l: false,
            g: true,
            avl: false,
            unusable: false,
        };
        let ar = seg.access_rights();
        let mut out = Segment::default();
        out.set_access_rights(ar);
        assert_eq!(out.type_, 0xb);
        assert!(out.present && out.s && out.db && out.g);
        assert!(!out.unusable);
    }

    #[test]
    fn unusable_segment_is_marked() {
        let seg = Segment {
            unusable: true,
            ..Segment::default()
        };
        assert_eq!(seg.access_rights(), 1 << 16);
        let mut out = Segment::default();
        out.set_access_rights(1 << 16);
        assert!(out.unusable);
    }

    #[test]
    fn gpa_frame_arithmetic() {
        let gpa = Gpa::new(0x1234);
        assert_eq!(gpa.gfn(), 1);
        assert_eq!(gpa.page_offset(), 0x234);
        assert_eq!((gpa + 0x1000).gfn(), 2);
    }
}
