//! Permission model: combining two levels of flags into one capability.
//!
//! A mapped page is described by two sets of bits, one on the directory
//! entry gating its whole span and one on the leaf entry. The two combine
//! asymmetrically:
//!
//! - **present** and **user** hold only when both levels agree;
//! - **writable** and **copy-on-write** are the union of the levels. A
//!   caller's original allocation calls may have deposited the writable
//!   bit at either level, and a later leaf-level downgrade to
//!   copy-on-write must still classify the page as mutable. This union is
//!   a long-standing policy of the duplication path and must not be
//!   tightened to an intersection;
//! - **shared** is taken from whichever level carries it (in practice the
//!   leaf; directories never do).
//!
//! The union rule is a *classification*, consumed by the duplication sweep
//! and the fault handler. Access enforcement in the privileged layer stays
//! conjunctive, which is exactly why a copy-on-write leaf under a
//! still-writable directory entry traps on write instead of storing
//! through.

use teos::mm::page_table::{PdeFlags, PteFlags};

/// How the duplication sweep must treat a mapped page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageClass {
    /// Deliberately visible to several environments; re-mapped as-is, no
    /// copy-on-write bookkeeping. Concurrent mutation is the caller's
    /// bargain.
    Shared,
    /// Writable or already copy-on-write: both sides must end up with a
    /// copy-on-write mapping.
    PrivateMutable,
    /// Read-only data: the child maps the same frame with the same
    /// permissions, nothing to track.
    PrivateImmutable,
}

/// Computes the effective capability of a page from its two flag levels.
///
/// The result uses the leaf-flag vocabulary. A page that is not present at
/// both levels has no capability at all (empty flags).
pub fn effective(pde: PdeFlags, pte: PteFlags) -> PteFlags {
    let pde = PteFlags::from_bits_truncate(pde.bits());
    if !pde.contains(PteFlags::P) || !pte.contains(PteFlags::P) {
        return PteFlags::empty();
    }
    let mut eff = PteFlags::P;
    if pde.contains(PteFlags::US) && pte.contains(PteFlags::US) {
        eff |= PteFlags::US;
    }
    if (pde | pte).contains(PteFlags::RW) {
        eff |= PteFlags::RW;
    }
    if (pde | pte).contains(PteFlags::COW) {
        eff |= PteFlags::COW;
    }
    if (pde | pte).contains(PteFlags::SHARED) {
        eff |= PteFlags::SHARED;
    }
    eff
}

/// Classifies a mapped page for the duplication sweep.
///
/// # Returns
/// - `Some(PageClass)` for a page present at both levels.
/// - `None` for an unmapped page.
pub fn classify(pde: PdeFlags, pte: PteFlags) -> Option<PageClass> {
    let eff = effective(pde, pte);
    if !eff.contains(PteFlags::P) {
        None
    } else if eff.contains(PteFlags::SHARED) {
        Some(PageClass::Shared)
    } else if eff.intersects(PteFlags::RW | PteFlags::COW) {
        Some(PageClass::PrivateMutable)
    } else {
        Some(PageClass::PrivateImmutable)
    }
}
