//! Segment scanning: sniffing a module out of one mapped memory segment.
//!
//! The scanner needs nothing but the segment's own bytes to derive a
//! module: address range, load bias, build-id, `SONAME`, executable-ness.
//! Any segment that does not hold a well-formed loadable ELF header is
//! reported as a non-match, never as an error, so a caller can probe every
//! mapping of an address space.

use std::rc::Rc;

use goblin::elf::dynamic::{DT_DEBUG, DT_NULL, DT_SONAME, DT_STRSZ, DT_STRTAB};
use goblin::elf::header::{ELFMAG, ET_DYN, ET_EXEC};
use goblin::elf::program_header::{PT_DYNAMIC, PT_LOAD, PT_NOTE};
use goblin::elf::{Dyn, Elf, ProgramHeader};
use scroll::Pread;

use crate::core::NoteFiles;
use crate::image::{self, Image};
use crate::mem::{self, MemorySource};
use crate::module::{Backing, BuildId, Module, ModuleOrigin};
use crate::session::{InsertOutcome, ModuleId, Session};
use crate::{Error, Result};

/// Bytes read up front from a candidate segment.
const INITIAL_CHUNK: usize = 4096;

/// Program-header count past which a header is declared malformed.
const MAX_PHNUM: usize = 2048;

/// Byte cap for one `PT_NOTE` or `PT_DYNAMIC` read-back.
const MAX_SCRATCH: usize = 1024 * 1024;

/// Remaining-cost threshold under which a memory-backed image is
/// materialized eagerly. Non-normative tuning value.
const EAGER_IMAGE_COST_LIMIT: usize = 64 * 1024;

/// Fallback page size when `PT_LOAD` alignment is unusable.
const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Result of scanning one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A module was registered under the given id.
    Added(ModuleId),

    /// The segment does not start a registrable module.
    NoMatch,
}

/// Scans the segment mapped at `base` and registers a module when the
/// segment starts a loadable ELF image.
///
/// `notes` is the core dump's `NT_FILE` table when one is available; a
/// matching on-disk file is preferred over reading memory back, unless its
/// build-id contradicts the one found in memory.
pub fn scan(
    session: &mut Session,
    base: u64,
    mem: &dyn MemorySource,
    notes: Option<&NoteFiles>,
) -> Result<ScanOutcome> {
    //
    // Read the candidate header.
    //

    let Ok(chunk) = mem.read(base, 64, INITIAL_CHUNK) else {
        return Ok(ScanOutcome::NoMatch);
    };

    if !chunk.starts_with(ELFMAG) {
        return Ok(ScanOutcome::NoMatch);
    }

    let Ok(header) = Elf::parse_header(&chunk) else {
        return Ok(ScanOutcome::NoMatch);
    };

    if header.e_type != ET_EXEC && header.e_type != ET_DYN {
        return Ok(ScanOutcome::NoMatch);
    }

    let Ok(container) = header.container() else {
        return Ok(ScanOutcome::NoMatch);
    };
    let Ok(endianness) = header.endianness() else {
        return Ok(ScanOutcome::NoMatch);
    };
    let ctx = goblin::container::Ctx::new(container, endianness);

    let phnum = header.e_phnum as usize;

    if header.e_phentsize as usize != ProgramHeader::size(ctx)
        || phnum == 0
        || phnum > MAX_PHNUM
    {
        return Ok(ScanOutcome::NoMatch);
    }

    //
    // Read the program-header table; it may spill into an adjoining
    // segment, in which case the memory source is asked again.
    //

    let phoff = header.e_phoff as usize;
    let table_size = phnum * ProgramHeader::size(ctx);

    let phdrs = if phoff.saturating_add(table_size) <= chunk.len() {
        ProgramHeader::parse(&chunk, phoff, phnum, ctx)?
    } else {
        let Ok(table) = mem.read(base + phoff as u64, table_size, table_size) else {
            return Ok(ScanOutcome::NoMatch);
        };

        ProgramHeader::parse(&table, 0, phnum, ctx)?
    };

    //
    // Derive bounds and bias from the loadable segments.
    //

    let page_size = phdrs
        .iter()
        .find(|phdr| phdr.p_type == PT_LOAD)
        .map(|phdr| phdr.p_align)
        .filter(|align| align.is_power_of_two())
        .unwrap_or(DEFAULT_PAGE_SIZE);
    let page_mask = !(page_size - 1);

    let mut vaddr_start = u64::MAX;
    let mut vaddr_end = 0u64;
    let mut bias = None;
    let mut contents_size = 0usize;
    let mut dynamic = None;
    let mut note_segments = Vec::new();

    for phdr in phdrs.iter() {
        match phdr.p_type {
            PT_LOAD => {
                vaddr_start = vaddr_start.min(phdr.p_vaddr & page_mask);

                let memsz_end = phdr.p_vaddr.saturating_add(phdr.p_memsz);
                vaddr_end = vaddr_end.max(memsz_end.saturating_add(page_size - 1) & page_mask);

                let filesz_end = phdr.p_offset.saturating_add(phdr.p_filesz);
                let file_end = filesz_end.saturating_add(page_size - 1) & page_mask;
                contents_size = contents_size.max(file_end as usize);

                let covers_phdrs = phdr.p_offset as usize <= phoff
                    && phoff.saturating_add(table_size) <= filesz_end as usize;

                if bias.is_none() && phdr.p_offset & page_mask == 0 && covers_phdrs {
                    bias = Some(base.wrapping_sub(phdr.p_vaddr & page_mask));
                }
            }
            PT_DYNAMIC => dynamic = Some((phdr.p_vaddr, phdr.p_filesz)),
            PT_NOTE => note_segments.push((phdr.p_vaddr, phdr.p_filesz)),
            _ => (),
        }
    }

    if vaddr_start >= vaddr_end {
        return Ok(ScanOutcome::NoMatch);
    }

    // The program-header table must itself be mapped by the segment the
    // bias was derived from; anything else is not a loaded module.
    let Some(bias) = bias else {
        tracing::debug!(
            base = format_args!("{base:#x}"),
            "segment rejected: headers not covered by a PT_LOAD at offset 0"
        );

        return Ok(ScanOutcome::NoMatch);
    };

    let addr_range = bias.wrapping_add(vaddr_start)..bias.wrapping_add(vaddr_end);

    //
    // Pick up a build-id from PT_NOTE, first match wins.
    //

    let mut build_id = None;

    'notes: for (vaddr, filesz) in note_segments {
        let len = (filesz as usize).min(MAX_SCRATCH);
        let note_addr = bias.wrapping_add(vaddr);

        let Ok(data) = mem.read(note_addr, len, len) else {
            continue;
        };

        if let Some((off, bytes)) = image::find_build_id_note(&data, ctx) {
            build_id = Some(BuildId {
                vaddr: note_addr.wrapping_add(off),
                bytes,
            });

            break 'notes;
        }
    }

    //
    // Prefer a core-note file over memory, unless its build-id disagrees.
    //

    let mut file_image = None;

    if let Some(path) = notes.and_then(|notes| notes.path_for(base)) {
        match Image::from_file(path) {
            Ok(image) => {
                let disk_id = image.build_id().map(|(_, bytes)| bytes);

                let mismatch = matches!(
                    (&build_id, &disk_id),
                    (Some(memory), Some(disk)) if memory.bytes != *disk
                );

                if mismatch {
                    tracing::warn!(
                        error = %Error::BuildIdMismatch(path.to_path_buf()),
                        "core-note file rejected, using memory"
                    );
                } else {
                    if build_id.is_none() {
                        build_id = image.build_id().map(|(vaddr, bytes)| BuildId {
                            vaddr: bias.wrapping_add(vaddr),
                            bytes,
                        });
                    }

                    file_image = Some((path.to_path_buf(), image));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "core-note file unreadable");
            }
        }
    }

    //
    // Walk PT_DYNAMIC for SONAME and DT_DEBUG.
    //

    let mut soname = None;
    let mut has_dt_debug = false;

    if let Some((dyn_vaddr, dyn_filesz)) = dynamic {
        let (strtab, strsz, soname_off, dt_debug) =
            scan_dynamic(mem, bias.wrapping_add(dyn_vaddr), dyn_filesz as usize, ctx)?;

        has_dt_debug = dt_debug;

        if let (Some(strtab), Some(off)) = (strtab, soname_off) {
            // A live dynamic section holds relocated string-table pointers;
            // a pristine one still holds the link-time vaddr.
            let strtab_addr = if strtab < bias {
                strtab.wrapping_add(bias)
            } else {
                strtab
            };

            let cap = strsz
                .map(|sz| sz.saturating_sub(off) as usize)
                .unwrap_or(512)
                .clamp(1, 4096);

            match mem::read_cstring(mem, strtab_addr.wrapping_add(off), cap) {
                Ok(name) if !name.is_empty() => {
                    soname = Some(String::from_utf8_lossy(&name).into_owned());
                }
                Ok(_) => (),
                Err(e) => tracing::debug!(error = %e, "SONAME string unreadable"),
            }
        }
    }

    //
    // Register the module: core-note path > SONAME > placeholder.
    //

    let name = match (&file_image, soname) {
        (Some((path, _)), _) => path.display().to_string(),
        (None, Some(soname)) => soname,
        (None, None) if header.e_type == ET_EXEC => "[exe]".to_owned(),
        (None, None) if has_dt_debug => "[pie]".to_owned(),
        (None, None) => "[dso]".to_owned(),
    };

    let backing = match file_image {
        // Already read from disk, nothing left to pay for.
        Some((_, image)) => Backing::Image(Rc::new(image)),
        None => {
            let cost = contents_size.saturating_sub(chunk.len());

            if cost < EAGER_IMAGE_COST_LIMIT || build_id.is_none() {
                materialize_eagerly(base, page_size, bias, mem).unwrap_or(Backing::Memory {
                    entry_vaddr: base,
                    page_size,
                })
            } else {
                Backing::Memory {
                    entry_vaddr: base,
                    page_size,
                }
            }
        }
    };

    let module = Module {
        name,
        addr_range,
        bias,
        build_id,
        dynamic_vaddr: dynamic.map(|(vaddr, _)| bias.wrapping_add(vaddr)),
        is_executable: has_dt_debug,
        origin: ModuleOrigin::SegmentScan,
        backing,
    };

    match session.insert(module)? {
        InsertOutcome::Added(id) | InsertOutcome::Replaced(id) => Ok(ScanOutcome::Added(id)),
        InsertOutcome::Rejected => Ok(ScanOutcome::NoMatch),
    }
}

/// Reads `DT_STRTAB`/`DT_STRSZ`/`DT_SONAME`/`DT_DEBUG` out of a mapped
/// dynamic segment.
fn scan_dynamic(
    mem: &dyn MemorySource,
    addr: u64,
    filesz: usize,
    ctx: goblin::container::Ctx,
) -> Result<(Option<u64>, Option<u64>, Option<u64>, bool)> {
    let len = filesz.min(MAX_SCRATCH);

    let Ok(data) = mem.read(addr, Dyn::size(ctx.container).min(len), len) else {
        return Ok((None, None, None, false));
    };

    let mut strtab = None;
    let mut strsz = None;
    let mut soname = None;
    let mut dt_debug = false;

    let mut offset = 0;

    while offset + Dyn::size(ctx.container) <= data.len() {
        let entry = data.gread_with::<Dyn>(&mut offset, ctx)?;

        match entry.d_tag {
            DT_NULL => break,
            DT_STRTAB => strtab = Some(entry.d_val),
            DT_STRSZ => strsz = Some(entry.d_val),
            DT_SONAME => soname = Some(entry.d_val),
            DT_DEBUG => dt_debug = true,
            _ => (),
        }
    }

    Ok((strtab, strsz, soname, dt_debug))
}

/// Reads the whole image back from memory now, while the segment is known
/// to be readable.
fn materialize_eagerly(
    base: u64,
    page_size: u64,
    bias: u64,
    mem: &dyn MemorySource,
) -> Option<Backing> {
    match image::reconstruct(base, page_size, Some(bias), mem)
        .and_then(|(bytes, _)| Image::parse(bytes))
    {
        Ok(image) => Some(Backing::Image(Rc::new(image))),
        Err(e) => {
            tracing::debug!(error = %e, "eager read-back failed, deferring");
            None
        }
    }
}
