//! This crate discovers which executable and shared-object images are
//! mapped into an address space (a live process snapshot, a core dump,
//! or a standalone binary) and associates every mapped region with its
//! ELF image, materialized from disk or reconstructed from memory alone.
//!
//! All reads of the inspected address space go through the
//! [MemorySource](crate::mem::MemorySource) capability, so the same
//! introspection code serves process memory, core-dump segments and
//! plain files. The input is treated as untrusted: truncated, corrupted
//! or adversarial images demote the affected module, never the session.
//!
//! # Example
//!
//! ```no_run
//! use argus_modules::Session;
//!
//! let core = std::fs::read("core.1234").unwrap();
//!
//! let mut session = Session::new();
//! argus_modules::core::report(&mut session, &core, None).unwrap();
//!
//! for (_, module) in session.modules() {
//!     println!(
//!         "{:#x}..{:#x} {}",
//!         module.addr_range().start,
//!         module.addr_range().end,
//!         module.name(),
//!     );
//! }
//! ```

pub mod core;
mod error;
pub mod image;
pub mod linkmap;
pub mod mem;
mod module;
pub mod relocate;
pub mod segment;
mod session;

pub use self::error::{Error, Result};
pub use self::image::Image;
pub use self::module::{BuildId, Module, ModuleOrigin};
pub use self::session::{InsertOutcome, ModuleId, Session};
