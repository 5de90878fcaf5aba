//! Debug-info relocation.
//!
//! Two flavors, per image kind. A linked image (executable, shared
//! object) only needs zero-valued section addresses rewritten into
//! process terms, resolved lazily through a caller-supplied callback and
//! memoized. A relocatable object (`ET_REL`, e.g. a kernel module) needs
//! its `SHT_REL`/`SHT_RELA` records actually applied against the target
//! section bytes, resolving symbols locally first and against every other
//! known module second.

use std::rc::{Rc, Weak};

use goblin::container::Ctx;
use goblin::elf::SectionHeader;
use goblin::elf::header::{EM_386, EM_X86_64};
use goblin::elf::reloc::{self, RelocSection};
use goblin::elf::section_header::{SHT_REL, SHT_RELA};

use crate::image::Image;
use crate::mem::MemorySource;
use crate::session::Session;
use crate::{Error, Result};

/// Section index of absolute symbols.
const SHN_ABS: usize = 0xfff1;

/// How unsupported or unresolvable relocations are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocMode {
    /// Leave the affected bytes untouched and keep going.
    Advisory,

    /// Fail on the first relocation this crate cannot apply.
    Strict,
}

/// Counts of one relocation pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelocSummary {
    /// Entries applied.
    pub applied: usize,

    /// Entries left untouched (advisory mode only).
    pub skipped: usize,
}

/// Resolves a section to its runtime address.
pub trait SectionAddressResolver {
    /// Returns the runtime address of the given section, or `None` when
    /// the section is not loaded anywhere.
    fn address_of(&mut self, name: &str, index: usize, shdr: &SectionHeader) -> Option<u64>;
}

impl<F> SectionAddressResolver for F
where
    F: FnMut(&str, usize, &SectionHeader) -> Option<u64>,
{
    fn address_of(&mut self, name: &str, index: usize, shdr: &SectionHeader) -> Option<u64> {
        self(name, index, shdr)
    }
}

/// Resolves a symbol name to its runtime address.
pub trait SymbolResolver {
    /// Returns the runtime address of the given symbol.
    fn resolve(&mut self, name: &str) -> Option<u64>;
}

/// [SymbolResolver] over every module of a session.
pub struct SessionSymbols<'a> {
    /// Session whose modules are searched.
    pub session: &'a mut Session,

    /// Memory source backing image materialization, when available.
    pub mem: Option<&'a dyn MemorySource>,
}

impl SymbolResolver for SessionSymbols<'_> {
    fn resolve(&mut self, name: &str) -> Option<u64> {
        self.session.addr_of_symbol(name, self.mem)
    }
}

/// Memoized per-section runtime addresses of one image.
///
/// Sections whose header already carries a nonzero address keep it; the
/// rest are resolved through the callback once, on first reference.
pub struct SectionAddresses {
    image: Weak<Image>,
    slots: Vec<Slot>,
}

#[derive(Clone, Copy)]
enum Slot {
    Unasked,
    Unavailable,
    Addr(u64),
}

impl SectionAddresses {
    /// Creates the memo table for the given image.
    pub fn new(image: &Rc<Image>) -> Self {
        Self {
            image: Rc::downgrade(image),
            slots: vec![Slot::Unasked; image.section_headers().len()],
        }
    }

    /// Runtime address of the section with the given index.
    pub fn address_of(
        &mut self,
        index: usize,
        resolver: &mut dyn SectionAddressResolver,
    ) -> Option<u64> {
        match self.slots.get(index)? {
            Slot::Addr(addr) => return Some(*addr),
            Slot::Unavailable => return None,
            Slot::Unasked => (),
        }

        let image = self.image.upgrade()?;
        let shdr = image.section_headers().get(index)?;

        let resolved = if shdr.sh_addr != 0 {
            Some(shdr.sh_addr)
        } else {
            resolver.address_of(image.section_name(index).unwrap_or_default(), index, shdr)
        };

        self.slots[index] = match resolved {
            Some(addr) => Slot::Addr(addr),
            None => Slot::Unavailable,
        };

        resolved
    }
}

/// Applies every relocation section of a relocatable image against its
/// target section bytes.
///
/// Entries are applied in file order. In [RelocMode::Advisory], entries
/// with an unsupported kind or an unresolvable symbol are counted and
/// left untouched; in [RelocMode::Strict] they fail the pass.
pub fn relocate_object(
    image: &mut Image,
    sections: &mut dyn SectionAddressResolver,
    symbols: &mut dyn SymbolResolver,
    mode: RelocMode,
) -> Result<RelocSummary> {
    if !image.is_relocatable() {
        return Err(Error::BadImage("not a relocatable object"));
    }

    let ctx = image.ctx();
    let machine = image.header().e_machine;

    //
    // Assign runtime addresses to the sections up front; application
    // below needs exclusive access to the image bytes.
    //

    let section_addrs = image
        .section_headers()
        .iter()
        .enumerate()
        .map(|(index, shdr)| {
            if shdr.sh_addr != 0 {
                Some(shdr.sh_addr)
            } else {
                sections.address_of(
                    image.section_name(index).unwrap_or_default(),
                    index,
                    shdr,
                )
            }
        })
        .collect::<Vec<_>>();

    let reloc_sections = image
        .section_headers()
        .iter()
        .enumerate()
        .filter(|(_, shdr)| shdr.sh_type == SHT_REL || shdr.sh_type == SHT_RELA)
        .map(|(index, shdr)| {
            (
                index,
                shdr.sh_type == SHT_RELA,
                shdr.sh_offset as usize,
                shdr.sh_size as usize,
                shdr.sh_info as usize,
            )
        })
        .collect::<Vec<_>>();

    let syms = image.symbols().to_vec();

    let mut summary = RelocSummary::default();

    for (index, is_rela, offset, size, target) in reloc_sections {
        // Collected up front: applying entries needs the image bytes
        // mutably.
        let entries = {
            let section = RelocSection::parse(image.bytes(), offset, size, is_rela, ctx)?;
            section.iter().collect::<Vec<_>>()
        };

        let Some(target_addr) = section_addrs.get(target).copied().flatten() else {
            tracing::debug!(section = index, "relocation target has no address");
            continue;
        };

        for entry in entries {
            let resolved = resolve_entry(
                &entry,
                &syms,
                &section_addrs,
                symbols,
            );

            let sym_value = match resolved {
                Ok(value) => value,
                Err(SkipReason::WeakUndefined) => {
                    summary.skipped += 1;
                    continue;
                }
                Err(SkipReason::Undefined(name)) => match mode {
                    RelocMode::Advisory => {
                        tracing::warn!(symbol = %name, "unresolved symbol, entry skipped");
                        summary.skipped += 1;
                        continue;
                    }
                    RelocMode::Strict => return Err(Error::UndefinedSymbol(name)),
                },
            };

            match apply_entry(image, ctx, machine, target, target_addr, &entry, sym_value) {
                Ok(()) => summary.applied += 1,
                Err(e @ Error::UnsupportedReloc(_)) if mode == RelocMode::Advisory => {
                    tracing::debug!(error = %e, "entry left untouched");
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    tracing::debug!(
        applied = summary.applied,
        skipped = summary.skipped,
        "relocation pass finished"
    );

    Ok(summary)
}

enum SkipReason {
    WeakUndefined,
    Undefined(String),
}

/// Resolves the symbol a relocation entry refers to: locally when
/// defined, by name across the other modules otherwise.
fn resolve_entry(
    entry: &reloc::Reloc,
    syms: &[crate::image::SymbolEntry],
    section_addrs: &[Option<u64>],
    symbols: &mut dyn SymbolResolver,
) -> core::result::Result<u64, SkipReason> {
    if entry.r_sym == 0 {
        return Ok(0);
    }

    let Some(sym) = syms.get(entry.r_sym) else {
        return Err(SkipReason::Undefined(format!("#{}", entry.r_sym)));
    };

    match sym.section {
        0 => {
            // Undefined or common: search the other modules.
            match symbols.resolve(&sym.name) {
                Some(addr) => Ok(addr),
                None if sym.is_weak => Err(SkipReason::WeakUndefined),
                None => Err(SkipReason::Undefined(sym.name.clone())),
            }
        }
        SHN_ABS => Ok(sym.value),
        section => match section_addrs.get(section).copied().flatten() {
            Some(base) => Ok(base.wrapping_add(sym.value)),
            None => Err(SkipReason::Undefined(sym.name.clone())),
        },
    }
}

/// Computes and writes one relocation's value into the target section.
fn apply_entry(
    image: &mut Image,
    ctx: Ctx,
    machine: u16,
    target_section: usize,
    target_addr: u64,
    entry: &reloc::Reloc,
    sym_value: u64,
) -> Result<()> {
    let offset = entry.r_offset as usize;
    let place = target_addr.wrapping_add(entry.r_offset);

    let bytes = image
        .section_bytes_mut(target_section)
        .ok_or(Error::BadImage("relocation target has no bytes"))?;

    // REL entries take their addend from the bytes being patched.
    let addend = match entry.r_addend {
        Some(addend) => addend as u64,
        None => read_value(bytes, offset, 4, ctx).ok_or(Error::BadImage(
            "relocation offset out of section bounds",
        ))?,
    };

    let value = sym_value.wrapping_add(addend);

    let (value, len) = match (machine, entry.r_type) {
        (EM_X86_64, reloc::R_X86_64_64) => (value, 8),
        (EM_X86_64, reloc::R_X86_64_32 | reloc::R_X86_64_32S) => (value, 4),
        (EM_X86_64, reloc::R_X86_64_PC32) => (value.wrapping_sub(place), 4),
        (EM_X86_64, reloc::R_X86_64_PC64) => (value.wrapping_sub(place), 8),
        (EM_386, reloc::R_386_32) => (value, 4),
        (EM_386, reloc::R_386_PC32) => (value.wrapping_sub(place), 4),
        // Composite kinds (GOT, PLT, TLS) are out of this crate's scope.
        (_, r_type) => return Err(Error::UnsupportedReloc(r_type)),
    };

    write_value(bytes, offset, len, value, ctx).ok_or(Error::BadImage(
        "relocation offset out of section bounds",
    ))?;

    Ok(())
}

fn read_value(bytes: &[u8], offset: usize, len: usize, ctx: Ctx) -> Option<u64> {
    let slice = bytes.get(offset..offset + len)?;

    let mut value = 0u64;

    if matches!(ctx.le, goblin::container::Endian::Little) {
        for (i, b) in slice.iter().enumerate() {
            value |= u64::from(*b) << (8 * i);
        }
    } else {
        for b in slice {
            value = value << 8 | u64::from(*b);
        }
    }

    // Sign-extend the 32-bit addend.
    if len == 4 {
        value = value as u32 as i32 as i64 as u64;
    }

    Some(value)
}

fn write_value(bytes: &mut [u8], offset: usize, len: usize, value: u64, ctx: Ctx) -> Option<()> {
    let slice = bytes.get_mut(offset..offset + len)?;

    if matches!(ctx.le, goblin::container::Endian::Little) {
        for (i, b) in slice.iter_mut().enumerate() {
            *b = (value >> (8 * i)) as u8;
        }
    } else {
        for (i, b) in slice.iter_mut().enumerate() {
            *b = (value >> (8 * (len - 1 - i))) as u8;
        }
    }

    Some(())
}
