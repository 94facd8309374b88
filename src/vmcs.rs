//! Virtual machine control structure (VMCS).
//!
//! The VMCS is the hardware control block that holds guest state, host state
//! and execution controls for one virtual CPU. It is only accessible through
//! the vmread/vmwrite family of instructions while active on the current
//! physical CPU; [`ActiveVmcs`] is the typed accessor handed out by the bind
//! protocol in [`crate::vcpu`].

use crate::{port::HwPort, x86::Segment, VmxError};
use alloc::{boxed::Box, vec::Vec};
use num_enum::{FromPrimitive, TryFromPrimitive};

/// The 4 KiB region backing one VMCS (or one vmxon region).
#[repr(C, align(4096))]
pub struct VmcsRegion {
    revision_id: u32,
    abort_indicator: u32,
    data: [u8; 4096 - 8],
}

impl VmcsRegion {
    /// Allocate a zeroed region stamped with the hardware revision
    /// identifier. Fails with [`VmxError::OutOfMemory`] instead of aborting.
    pub fn try_boxed(revision_id: u32) -> Result<Box<Self>, VmxError> {
        let mut v: Vec<VmcsRegion> = Vec::new();
        v.try_reserve_exact(1).map_err(|_| VmxError::OutOfMemory)?;
        v.push(VmcsRegion {
            revision_id,
            abort_indicator: 0,
            data: [0; 4096 - 8],
        });
        let boxed: Box<[VmcsRegion; 1]> = v
            .into_boxed_slice()
            .try_into()
            .map_err(|_| VmxError::OutOfMemory)?;
        // [T; 1] and T share a layout.
        Ok(unsafe { Box::from_raw(Box::into_raw(boxed).cast()) })
    }

    pub fn revision_id(&self) -> u32 {
        self.revision_id
    }

    /// Address handed to vmclear/vmptrld/vmxon.
    pub fn address(&self) -> usize {
        self as *const _ as usize
    }
}

/// VM-instruction error numbers, read from the VM-instruction-error field
/// after a VMX instruction fails with a valid current VMCS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum InstructionError {
    VmcallInVmxRoot = 1,
    VmclearInvalidAddress = 2,
    VmclearVmxonPointer = 3,
    VmlaunchNonClearVmcs = 4,
    VmresumeNonLaunchedVmcs = 5,
    VmresumeAfterVmxoff = 6,
    EntryInvalidControlFields = 7,
    EntryInvalidHostState = 8,
    VmptrldInvalidAddress = 9,
    VmptrldVmxonPointer = 10,
    VmptrldIncorrectRevision = 11,
    UnsupportedVmcsComponent = 12,
    VmwriteReadonlyComponent = 13,
    VmxonInVmxRoot = 15,
    EntryInvalidExecutiveVmcs = 16,
    EntryNonLaunchedExecutiveVmcs = 17,
    EntryExecutiveVmcsPointer = 18,
    VmcallNonClearVmcs = 19,
    VmcallInvalidExitControlFields = 20,
    VmcallIncorrectMseg = 22,
    VmxoffUnderDualMonitor = 23,
    VmcallInvalidSmmMonitor = 24,
    EntryInvalidExecutionControlFields = 25,
    EntryEventsBlockedByMovSs = 26,
    InvalidOperandToInveptInvvpid = 28,
    #[num_enum(default)]
    Unknown = 0,
}

/// VMCS field encodings used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Field {
    GuestEsSelector = 0x0800,
    GuestCsSelector = 0x0802,
    GuestSsSelector = 0x0804,
    GuestDsSelector = 0x0806,
    GuestFsSelector = 0x0808,
    GuestGsSelector = 0x080A,
    GuestLdtrSelector = 0x080C,
    GuestTrSelector = 0x080E,
    HostEsSelector = 0x0C00,
    HostCsSelector = 0x0C02,
    HostSsSelector = 0x0C04,
    HostDsSelector = 0x0C06,
    HostFsSelector = 0x0C08,
    HostGsSelector = 0x0C0A,
    HostTrSelector = 0x0C0C,
    VmexitMsrStoreAddr = 0x2006,
    VmexitMsrLoadAddr = 0x2008,
    VmentryMsrLoadAddr = 0x200A,
    TscOffset = 0x2010,
    VmcsLinkPointer = 0x2800,
    GuestIa32Debugctl = 0x2802,
    PinBasedVmexecControl = 0x4000,
    ProcBasedVmexecControl = 0x4002,
    ExceptionBitmap = 0x4004,
    PageFaultErrorCodeMask = 0x4006,
    PageFaultErrorCodeMatch = 0x4008,
    Cr3TargetCount = 0x400A,
    VmexitControls = 0x400C,
    VmexitMsrStoreCount = 0x400E,
    VmexitMsrLoadCount = 0x4010,
    VmentryControls = 0x4012,
    VmentryMsrLoadCount = 0x4014,
    VmentryInterruptionInfo = 0x4016,
    VmentryExceptionErrorCode = 0x4018,
    VmentryInstructionLength = 0x401A,
    VmInstructionError = 0x4400,
    VmexitReason = 0x4402,
    VmexitInterruptionInfo = 0x4404,
    VmexitInterruptionErrorCode = 0x4406,
    IdtVectoringInfo = 0x4408,
    IdtVectoringErrorCode = 0x440A,
    VmexitInstructionLength = 0x440C,
    GuestEsLimit = 0x4800,
    GuestCsLimit = 0x4802,
    GuestSsLimit = 0x4804,
    GuestDsLimit = 0x4806,
    GuestFsLimit = 0x4808,
    GuestGsLimit = 0x480A,
    GuestLdtrLimit = 0x480C,
    GuestTrLimit = 0x480E,
    GuestGdtrLimit = 0x4810,
    GuestIdtrLimit = 0x4812,
    GuestEsArBytes = 0x4814,
    GuestCsArBytes = 0x4816,
    GuestSsArBytes = 0x4818,
    GuestDsArBytes = 0x481A,
    GuestFsArBytes = 0x481C,
    GuestGsArBytes = 0x481E,
    GuestLdtrArBytes = 0x4820,
    GuestTrArBytes = 0x4822,
    GuestInterruptibilityState = 0x4824,
    GuestActivityState = 0x4826,
    GuestSysenterCs = 0x482A,
    HostSysenterCs = 0x4C00,
    Cr0GuestHostMask = 0x6000,
    Cr4GuestHostMask = 0x6002,
    Cr0ReadShadow = 0x6004,
    Cr4ReadShadow = 0x6006,
    VmexitQualification = 0x6400,
    GuestLinearAddress = 0x640A,
    GuestCr0 = 0x6800,
    GuestCr3 = 0x6802,
    GuestCr4 = 0x6804,
    GuestEsBase = 0x6806,
    GuestCsBase = 0x6808,
    GuestSsBase = 0x680A,
    GuestDsBase = 0x680C,
    GuestFsBase = 0x680E,
    GuestGsBase = 0x6810,
    GuestLdtrBase = 0x6812,
    GuestTrBase = 0x6814,
    GuestGdtrBase = 0x6816,
    GuestIdtrBase = 0x6818,
    GuestDr7 = 0x681A,
    GuestRsp = 0x681C,
    GuestRip = 0x681E,
    GuestRflags = 0x6820,
    GuestPendingDebugExceptions = 0x6822,
    GuestSysenterEsp = 0x6824,
    GuestSysenterEip = 0x6826,
    HostCr0 = 0x6C00,
    HostCr3 = 0x6C02,
    HostCr4 = 0x6C04,
    HostFsBase = 0x6C06,
    HostGsBase = 0x6C08,
    HostTrBase = 0x6C0A,
    HostGdtrBase = 0x6C0C,
    HostIdtrBase = 0x6C0E,
    HostSysenterEsp = 0x6C10,
    HostSysenterEip = 0x6C12,
    HostRsp = 0x6C14,
    HostRip = 0x6C16,
}

/// Basic exit reasons (low 16 bits of the exit-reason field) the engine
/// knows how to dispatch. Reasons outside this set surface to the
/// controlling process as an unknown exit rather than indexing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum BasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InterruptWindow = 7,
    Cpuid = 10,
    Hlt = 12,
    Invlpg = 14,
    CrAccess = 28,
    DrAccess = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    EntryFailureGuestState = 33,
    EntryFailureMsrLoad = 34,
}

// Interruption-information field layout (entry injection and exit reporting
// share it).
pub const INTR_INFO_VECTOR_MASK: u64 = 0xff;
pub const INTR_INFO_TYPE_MASK: u64 = 0x700;
pub const INTR_INFO_DELIVER_CODE_MASK: u64 = 1 << 11;
pub const INTR_INFO_VALID_MASK: u64 = 1 << 31;

pub const INTR_TYPE_EXT_INTR: u64 = 0 << 8;
pub const INTR_TYPE_NMI: u64 = 2 << 8;
pub const INTR_TYPE_HARD_EXCEPTION: u64 = 3 << 8;

/// Segment registers addressable in the VMCS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegReg {
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
    Tr,
    Ldtr,
}

pub(crate) struct SegFields {
    pub(crate) selector: Field,
    pub(crate) base: Field,
    pub(crate) limit: Field,
    pub(crate) ar: Field,
}

impl SegReg {
    pub(crate) fn fields(self) -> SegFields {
        use Field::*;
        match self {
            SegReg::Cs => SegFields {
                selector: GuestCsSelector,
                base: GuestCsBase,
                limit: GuestCsLimit,
                ar: GuestCsArBytes,
            },
            SegReg::Ds => SegFields {
                selector: GuestDsSelector,
                base: GuestDsBase,
                limit: GuestDsLimit,
                ar: GuestDsArBytes,
            },
            SegReg::Es => SegFields {
                selector: GuestEsSelector,
                base: GuestEsBase,
                limit: GuestEsLimit,
                ar: GuestEsArBytes,
            },
            SegReg::Fs => SegFields {
                selector: GuestFsSelector,
                base: GuestFsBase,
                limit: GuestFsLimit,
                ar: GuestFsArBytes,
            },
            SegReg::Gs => SegFields {
                selector: GuestGsSelector,
                base: GuestGsBase,
                limit: GuestGsLimit,
                ar: GuestGsArBytes,
            },
            SegReg::Ss => SegFields {
                selector: GuestSsSelector,
                base: GuestSsBase,
                limit: GuestSsLimit,
                ar: GuestSsArBytes,
            },
            SegReg::Tr => SegFields {
                selector: GuestTrSelector,
                base: GuestTrBase,
                limit: GuestTrLimit,
                ar: GuestTrArBytes,
            },
            SegReg::Ldtr => SegFields {
                selector: GuestLdtrSelector,
                base: GuestLdtrBase,
                limit: GuestLdtrLimit,
                ar: GuestLdtrArBytes,
            },
        }
    }
}

/// Accessor for the VMCS currently active on this physical CPU.
///
/// Only constructed while a vCPU is bound, so every read/write targets the
/// right control block by construction.
pub struct ActiveVmcs<'a, H: HwPort> {
    hw: &'a H,
}

impl<'a, H: HwPort> ActiveVmcs<'a, H> {
    pub(crate) fn new(hw: &'a H) -> Self {
        Self { hw }
    }

    pub fn read(&self, field: Field) -> Result<u64, VmxError> {
        self.hw.vmread(field).map_err(VmxError::VmxFailure)
    }

    pub fn write(&self, field: Field, value: u64) -> Result<(), VmxError> {
        self.hw.vmwrite(field, value).map_err(VmxError::VmxFailure)
    }

    /// Length of the instruction that caused the last exit.
    pub fn instruction_length(&self) -> Result<u64, VmxError> {
        self.read(Field::VmexitInstructionLength)
    }

    /// Retire the exiting instruction by advancing the guest rip past it.
    pub fn skip_instruction(&self) -> Result<(), VmxError> {
        let rip = self.read(Field::GuestRip)?;
        let len = self.instruction_length()?;
        self.write(Field::GuestRip, rip + len)
    }

    pub fn segment(&self, reg: SegReg) -> Result<Segment, VmxError> {
        let f = reg.fields();
        let mut seg = Segment {
            base: self.read(f.base)?,
            limit: self.read(f.limit)? as u32,
            selector: self.read(f.selector)? as u16,
            ..Segment::default()
        };
        seg.set_access_rights(self.read(f.ar)? as u32);
        Ok(seg)
    }

    pub fn set_segment(&self, reg: SegReg, seg: &Segment) -> Result<(), VmxError> {
        let f = reg.fields();
        self.write(f.base, seg.base)?;
        self.write(f.limit, seg.limit as u64)?;
        self.write(f.selector, seg.selector as u64)?;
        self.write(f.ar, seg.access_rights() as u64)
    }
}
