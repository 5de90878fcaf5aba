//! This crate decodes call-frame information (CIE and FDE records out of
//! `.eh_frame`/`.debug_frame`-style sections) well enough to walk a call
//! stack: find the frame description covering an address, compute the
//! canonical frame address, and locate saved registers.
//!
//! Decoded records are interned in a per-session [CfiCache]: CIEs by
//! offset, FDEs by the address interval they cover. Lookups are answered
//! from the memo, from an `.eh_frame_hdr` search table, or by a resumable
//! linear scan, in that order; the cache only ever grows.
//!
//! # Example
//!
//! ```no_run
//! use argus_unwind::{CfiCache, EvalMode, SectionKind};
//!
//! let eh_frame: Vec<u8> = std::fs::read("eh_frame.bin").unwrap();
//!
//! let mut cache = CfiCache::new(SectionKind::EhFrame, eh_frame, 0x4000, 8, true);
//!
//! if let Some(state) = cache.frame_state(0x4321, EvalMode::Strict).unwrap() {
//!     println!("return address column: {}", state.return_address_register);
//! }
//! ```

pub mod cfi;
pub mod encoding;
mod error;
pub mod frame;

#[cfg(test)]
pub(crate) mod testutil;

pub use self::cfi::{Augmentation, CfiCache, CieRecord, FdeRecord, SectionKind};
pub use self::error::{Error, Result};
pub use self::frame::{CfaRule, EvalMode, ExprContext, FrameState, RegisterRule};
