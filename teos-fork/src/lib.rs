//! # User-space `fork` with copy-on-write.
//!
//! This crate is the user-level half of process duplication: a library an
//! environment links against to clone itself lazily. Instead of copying
//! the address space eagerly, [`fork`] re-establishes every mapping of the
//! caller in the child and downgrades the writable ones to copy-on-write
//! on *both* sides; the first write either side performs then traps into
//! the registered page-fault handler, which gives the writer a private
//! copy of just that page.
//!
//! The crate splits into three pieces, leaf first:
//!
//! - [`perm`] decides how the two levels of permission bits combine into
//!   an effective capability and classifies each mapped page as shared,
//!   private-mutable, or private-immutable.
//! - [`pgfault`] is the fault side: handler registration (which also
//!   provisions the caller's exception stack) and the copy-on-write
//!   resolution protocol built around the single staging address.
//! - [`fork`] is the duplication side: the page-by-page sweep and the
//!   lifecycle that takes a child from creation to runnable, including the
//!   two-sided return and the child's re-derivation of its own identity.
//!
//! Everything here runs against the system-call surface of [`teos`]; the
//! library holds no state of its own outside the user pages it manages.
//!
//! [`fork`]: fork::fork()

#![no_std]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fork;
pub mod perm;
pub mod pgfault;

pub use fork::{ForkReturn, fork, init_self_slot, self_id};
pub use perm::PageClass;
pub use pgfault::{handle_cow_fault, set_fault_handler};
