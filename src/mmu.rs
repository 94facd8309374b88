//! The address-translator capability.
//!
//! Shadow paging lives outside this crate; the engine only depends on this
//! interface. Every hook receives a [`TranslationCtx`] describing the vCPU's
//! current paging configuration plus access to guest memory, so a translator
//! can walk guest page tables without reaching into engine internals.

use crate::{
    memory::GuestMemory,
    x86::{Cr0, Gpa, Gva},
};

/// Paging configuration snapshot for one translation request.
pub struct TranslationCtx<'a> {
    pub memory: &'a GuestMemory,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}

impl TranslationCtx<'_> {
    pub fn paging_enabled(&self) -> bool {
        self.cr0 & Cr0::PG.bits() != 0
    }
}

/// Result of a successful guest-virtual translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub gpa: Gpa,
    pub writable: bool,
    pub usermode: bool,
}

/// External shadow-paging collaborator.
pub trait AddressTranslator: Send + Sync {
    /// Translate a guest linear address under the current paging mode.
    fn gva_to_gpa(&self, ctx: &TranslationCtx<'_>, gva: Gva) -> Option<Translation>;

    /// Try to resolve a guest page fault. Returns true when the fault was
    /// fixed and the instruction should simply be retried.
    fn page_fault(&self, ctx: &TranslationCtx<'_>, addr: Gva, error_code: u32) -> bool;

    /// The guest executed invlpg.
    fn inval_page(&self, ctx: &TranslationCtx<'_>, addr: Gva);

    /// The guest loaded a new cr3.
    fn new_cr3(&self, ctx: &TranslationCtx<'_>);

    /// Drop all cached translations; called after mode changes and memory
    /// reconfiguration.
    fn reset_context(&self, ctx: &TranslationCtx<'_>);

    /// Release all translator-owned state for this virtual machine.
    fn release(&self);
}

/// Translator for guests that run with paging disabled: linear addresses are
/// physical addresses. Serves as the default until an embedding supplies a
/// shadow-paging implementation.
pub struct IdentityTranslator;

impl AddressTranslator for IdentityTranslator {
    fn gva_to_gpa(&self, ctx: &TranslationCtx<'_>, gva: Gva) -> Option<Translation> {
        if ctx.paging_enabled() {
            return None;
        }
        Some(Translation {
            gpa: Gpa::new(gva.into_u64()),
            writable: true,
            usermode: false,
        })
    }

    fn page_fault(&self, _ctx: &TranslationCtx<'_>, _addr: Gva, _error_code: u32) -> bool {
        false
    }

    fn inval_page(&self, _ctx: &TranslationCtx<'_>, _addr: Gva) {}

    fn new_cr3(&self, _ctx: &TranslationCtx<'_>) {}

    fn reset_context(&self, _ctx: &TranslationCtx<'_>) {}

    fn release(&self) {}
}
