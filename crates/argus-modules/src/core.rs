//! Core-file reporting: turning one core dump into a module list.
//!
//! The reporter merges three sources of truth. `NT_AUXV` bootstraps the
//! link-map walk (cheap and authoritative), the `NT_FILE` table names the
//! files the kernel had mapped, and a raw segment scan fills whatever the
//! first two leave uncovered.

use std::path::{Path, PathBuf};

use goblin::container::Ctx;
use goblin::elf::header::ET_CORE;
use goblin::elf::program_header::{PT_LOAD, PT_NOTE};
use goblin::elf::{Elf, ProgramHeader};
use scroll::Pread;

use crate::mem::CoreMemory;
use crate::segment::{self, ScanOutcome};
use crate::session::Session;
use crate::{Error, Result, linkmap};

/// `NT_AUXV`: raw auxiliary-vector dump.
const NT_AUXV: u32 = 6;

/// `NT_FILE`: table of file-backed mappings.
const NT_FILE: u32 = 0x46494c45;

/// One `NT_FILE` mapping entry.
#[derive(Debug, Clone)]
pub struct FileMapping {
    /// Mapped address range.
    pub start: u64,
    /// End of the mapped address range.
    pub end: u64,
    /// Byte offset of the mapping into the file.
    pub file_offset: u64,
    /// Path the kernel recorded for the mapping.
    pub path: PathBuf,
}

/// Decoded `NT_FILE` table of a core dump.
#[derive(Debug, Default)]
pub struct NoteFiles {
    mappings: Vec<FileMapping>,
}

impl NoteFiles {
    /// Decodes an `NT_FILE` descriptor: count and page size, `count`
    /// `(start, end, page offset)` triples, then a NUL-separated filename
    /// table.
    pub fn parse(desc: &[u8], ctx: Ctx) -> Result<Self> {
        let mut offset = 0;

        let count = read_word(desc, &mut offset, ctx)?;
        let page_size = read_word(desc, &mut offset, ctx)?;

        if count > (desc.len() / 2) as u64 {
            return Err(Error::BadImage("NT_FILE count exceeds note size"));
        }

        let mut triples = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let start = read_word(desc, &mut offset, ctx)?;
            let end = read_word(desc, &mut offset, ctx)?;
            let pages = read_word(desc, &mut offset, ctx)?;

            triples.push((start, end, pages));
        }

        let mut names = desc
            .get(offset..)
            .ok_or(Error::BadImage("NT_FILE name table missing"))?
            .split(|b| *b == 0);

        let mappings = triples
            .into_iter()
            .map_while(|(start, end, pages)| {
                let name = names.next()?;

                Some(FileMapping {
                    start,
                    end,
                    file_offset: pages.saturating_mul(page_size),
                    path: PathBuf::from(String::from_utf8_lossy(name).into_owned()),
                })
            })
            .collect();

        Ok(Self { mappings })
    }

    /// All recorded mappings.
    pub fn mappings(&self) -> &[FileMapping] {
        &self.mappings
    }

    /// Path of the file mapped at `addr`, preferring the mapping that
    /// holds the file's start (offset zero, where the ELF header lives).
    pub fn path_for(&self, addr: u64) -> Option<&Path> {
        self.mappings
            .iter()
            .filter(|m| m.start <= addr && addr < m.end)
            .min_by_key(|m| m.file_offset)
            .filter(|m| m.file_offset == 0)
            .map(|m| m.path.as_path())
    }
}

/// Notes a reporter extracted from a core's `PT_NOTE` segments.
#[derive(Default)]
struct CoreNotes {
    auxv: Option<Vec<u8>>,
    files: Option<NoteFiles>,
}

/// Reports every module of a core dump into the session.
///
/// Returns the number of modules registered. A core with loadable
/// segments that yields no module at all is an error naming the cause,
/// never a silent empty success.
pub fn report(
    session: &mut Session,
    core_bytes: &[u8],
    executable_hint: Option<&Path>,
) -> Result<usize> {
    let header = Elf::parse_header(core_bytes)?;

    if header.e_type != ET_CORE {
        return Err(Error::BadImage("not a core file"));
    }

    let ctx = Ctx::new(header.container()?, header.endianness()?);

    let phdrs = ProgramHeader::parse(
        core_bytes,
        header.e_phoff as usize,
        header.e_phnum as usize,
        ctx,
    )?;

    let notes = parse_notes(core_bytes, &phdrs, ctx);
    let mem = CoreMemory::new(core_bytes, &phdrs);

    let before = session.module_count();

    //
    // Link map first: authoritative names and load addresses.
    //

    let mut walked = false;

    match notes.auxv {
        Some(ref auxv) => {
            match linkmap::walk(session, auxv, &mem, executable_hint) {
                Ok(count) => {
                    walked = true;
                    tracing::debug!(count, "link map reported modules");
                }
                // The segment scan below still recovers modules.
                Err(e) => tracing::warn!(error = %e, "link map walk failed"),
            }
        }
        None => tracing::debug!("core has no NT_AUXV"),
    }

    //
    // Scan every loadable segment not already claimed.
    //

    let mut scanned = 0;

    for (index, phdr) in phdrs.iter().enumerate() {
        if phdr.p_type != PT_LOAD || phdr.p_filesz == 0 {
            continue;
        }

        if session.module_at(phdr.p_vaddr).is_some() {
            continue;
        }

        match segment::scan(session, phdr.p_vaddr, &mem, notes.files.as_ref()) {
            Ok(ScanOutcome::Added(_)) => scanned += 1,
            Ok(ScanOutcome::NoMatch) => (),
            // One bad segment never aborts the whole report.
            Err(e) => tracing::warn!(error = %e, index, "segment scan failed"),
        }
    }

    //
    // With no usable auxv, the scanned modules themselves may still lead
    // to the link map, whose claims then upgrade the scan results.
    //

    if !walked && session.module_count() > before {
        match linkmap::walk_without_auxv(session, &mem, executable_hint) {
            Ok(count) => tracing::debug!(count, "link map recovered without auxv"),
            Err(e) => tracing::debug!(error = %e, "no link map without auxv"),
        }
    }

    let added = session.module_count() - before;

    tracing::debug!(added, scanned, "core report finished");

    if added == 0 && phdrs.iter().any(|phdr| phdr.p_type == PT_LOAD) {
        return Err(Error::NoModules(
            "no loadable segment holds a recognizable image",
        ));
    }

    Ok(added)
}

/// Pulls `NT_AUXV` and `NT_FILE` out of the core's note segments.
fn parse_notes(core_bytes: &[u8], phdrs: &[ProgramHeader], ctx: Ctx) -> CoreNotes {
    let mut notes = CoreNotes::default();

    for phdr in phdrs.iter().filter(|phdr| phdr.p_type == PT_NOTE) {
        let Some(data) = core_bytes.get(phdr.file_range()) else {
            continue;
        };

        let iter = goblin::elf::note::NoteDataIterator {
            data,
            size: data.len(),
            offset: 0,
            ctx: (4, ctx),
        };

        for note in iter {
            let Ok(note) = note else { break };

            if note.name != "CORE" {
                continue;
            }

            match note.n_type {
                NT_AUXV if notes.auxv.is_none() => {
                    notes.auxv = Some(note.desc.to_vec());
                }
                NT_FILE if notes.files.is_none() => match NoteFiles::parse(note.desc, ctx) {
                    Ok(files) => notes.files = Some(files),
                    Err(e) => tracing::warn!(error = %e, "NT_FILE note unusable"),
                },
                _ => (),
            }
        }
    }

    notes
}

/// Reads one target word out of a note descriptor.
fn read_word(data: &[u8], offset: &mut usize, ctx: Ctx) -> Result<u64> {
    let res = if ctx.container.is_big() {
        data.gread_with::<u64>(offset, ctx.le)
    } else {
        data.gread_with::<u32>(offset, ctx.le).map(u64::from)
    };

    res.map_err(|_| Error::BadImage("truncated note descriptor"))
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    use goblin::container::{Container, Endian};

    fn le64_ctx() -> Ctx {
        Ctx::new(Container::Big, Endian::Little)
    }

    fn nt_file_desc(entries: &[(u64, u64, u64, &str)], page_size: u64) -> Vec<u8> {
        let mut desc = Vec::new();

        desc.extend_from_slice(&(entries.len() as u64).to_le_bytes());
        desc.extend_from_slice(&page_size.to_le_bytes());

        for (start, end, pages, _) in entries {
            desc.extend_from_slice(&start.to_le_bytes());
            desc.extend_from_slice(&end.to_le_bytes());
            desc.extend_from_slice(&pages.to_le_bytes());
        }

        for (_, _, _, path) in entries {
            desc.extend_from_slice(path.as_bytes());
            desc.push(0);
        }

        desc
    }

    #[test]
    fn nt_file_roundtrip() {
        let desc = nt_file_desc(
            &[
                (0x1000, 0x3000, 0, "/usr/lib/libfoo.so"),
                (0x3000, 0x4000, 2, "/usr/lib/libfoo.so"),
            ],
            4096,
        );

        let files = NoteFiles::parse(&desc, le64_ctx()).expect("parse");

        assert_eq!(files.mappings().len(), 2);
        assert_eq!(files.mappings()[1].file_offset, 8192);
        assert_eq!(
            files.path_for(0x1800),
            Some(Path::new("/usr/lib/libfoo.so"))
        );
        // The second mapping does not hold the file header.
        assert_eq!(files.path_for(0x3800), None);
        assert_eq!(files.path_for(0x4000), None);
    }

    #[test]
    fn nt_file_bad_count_rejected() {
        let mut desc = Vec::new();
        desc.extend_from_slice(&u64::MAX.to_le_bytes());
        desc.extend_from_slice(&4096u64.to_le_bytes());

        assert!(NoteFiles::parse(&desc, le64_ctx()).is_err());
    }

    #[test]
    fn non_core_input_rejected() {
        // A plausible but non-core header: type ET_EXEC.
        let mut bytes = vec![0u8; 64];
        bytes[..4].copy_from_slice(b"\x7fELF");
        bytes[4] = 2; // ELFCLASS64
        bytes[5] = 1; // ELFDATA2LSB
        bytes[16] = 2; // ET_EXEC
        bytes[18] = 0x3e; // EM_X86_64

        let mut session = Session::new();

        assert!(matches!(
            report(&mut session, &bytes, None),
            Err(Error::BadImage(_))
        ));
    }
}
