//! Memory sources backing every remote read of this crate.
//!
//! All components read an address space through the [MemorySource] trait:
//! a single blocking `read` that either yields at least the requested
//! minimum byte count or fails. Implementations serve bytes from a core
//! dump's mapped segments, from a memory-mapped file, or from a plain byte
//! slice (reconstructed images, tests).

use std::borrow::Cow;
use std::ops::Range;
use std::path::{Path, PathBuf};

use goblin::elf::ProgramHeader;
use goblin::elf::program_header::PT_LOAD;

use crate::{Error, Result};

/// Read access to an address space.
///
/// A read may return more than `min_len` bytes (up to `max_len`) when the
/// extra bytes are free to produce, e.g. the rest of an already-mapped
/// segment. It never silently spans a segment boundary: bytes past the end
/// of the segment containing `addr` are clamped off, and the clamp is only
/// an error when it undercuts `min_len`.
pub trait MemorySource {
    /// Reads at least `min_len` and at most `max_len` bytes at `addr`.
    fn read(&self, addr: u64, min_len: usize, max_len: usize) -> Result<Cow<'_, [u8]>>;
}

/// Reads exactly `len` bytes at `addr`.
pub fn read_exact(mem: &dyn MemorySource, addr: u64, len: usize) -> Result<Cow<'_, [u8]>> {
    mem.read(addr, len, len)
}

/// Reads a NUL-terminated string at `addr`, up to `max_len` bytes.
pub fn read_cstring(mem: &dyn MemorySource, mut addr: u64, max_len: usize) -> Result<Vec<u8>> {
    const CHUNK: usize = 256;

    let mut s = Vec::new();

    while s.len() < max_len {
        let chunk = mem.read(addr, 1, CHUNK)?;

        match chunk.iter().position(|c| *c == 0) {
            Some(nul) => {
                s.extend_from_slice(&chunk[..nul]);
                return Ok(s);
            }
            None => {
                s.extend_from_slice(&chunk);
                addr = addr.wrapping_add(chunk.len() as u64);
            }
        }
    }

    Err(Error::TruncatedRead {
        addr,
        need: max_len,
        got: s.len(),
    })
}

impl MemorySource for [u8] {
    /// Serves the slice as one segment based at address zero.
    fn read(&self, addr: u64, min_len: usize, max_len: usize) -> Result<Cow<'_, [u8]>> {
        let start = usize::try_from(addr).map_err(|_| Error::Unmapped(addr))?;

        if start >= self.len() {
            return Err(Error::Unmapped(addr));
        }

        let end = self.len().min(start.saturating_add(max_len));

        if end - start < min_len {
            return Err(Error::TruncatedRead {
                addr,
                need: min_len,
                got: end - start,
            });
        }

        Ok(Cow::Borrowed(&self[start..end]))
    }
}

/// Byte slice served at a chosen base address.
pub struct SliceMemory<'a> {
    base: u64,
    bytes: &'a [u8],
}

impl<'a> SliceMemory<'a> {
    /// Creates a memory source serving `bytes` at `base`.
    pub fn new(base: u64, bytes: &'a [u8]) -> Self {
        Self { base, bytes }
    }
}

impl MemorySource for SliceMemory<'_> {
    fn read(&self, addr: u64, min_len: usize, max_len: usize) -> Result<Cow<'_, [u8]>> {
        let rela = addr.checked_sub(self.base).ok_or(Error::Unmapped(addr))?;

        match self.bytes.read(rela, min_len, max_len) {
            Err(Error::Unmapped(_)) => Err(Error::Unmapped(addr)),
            Err(Error::TruncatedRead { need, got, .. }) => {
                Err(Error::TruncatedRead { addr, need, got })
            }
            res => res,
        }
    }
}

/// Memory-mapped file served at a chosen base address.
pub struct FileMemory {
    base: u64,
    map: memmap2::Mmap,
    path: PathBuf,
}

impl FileMemory {
    /// Maps `path` read-only and serves its bytes at `base`.
    pub fn open(path: impl AsRef<Path>, base: u64) -> Result<Self> {
        let path = path.as_ref();

        let file = std::fs::File::open(path)
            .map_err(|e| Error::File(path.to_path_buf(), e))?;

        // Safety: the file is a binary image opened read-only; a concurrent
        // writer would invalidate every other reader of that image as well.
        let map = unsafe { memmap2::Mmap::map(&file) }
            .map_err(|e| Error::File(path.to_path_buf(), e))?;

        Ok(Self {
            base,
            map,
            path: path.to_path_buf(),
        })
    }

    /// Path the mapping was created from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MemorySource for FileMemory {
    fn read(&self, addr: u64, min_len: usize, max_len: usize) -> Result<Cow<'_, [u8]>> {
        let rela = addr.checked_sub(self.base).ok_or(Error::Unmapped(addr))?;

        match self.map[..].read(rela, min_len, max_len) {
            Err(Error::Unmapped(_)) => Err(Error::Unmapped(addr)),
            Err(Error::TruncatedRead { need, got, .. }) => {
                Err(Error::TruncatedRead { addr, need, got })
            }
            res => res,
        }
    }
}

/// Memory source serving bytes out of a core dump's `PT_LOAD` ranges.
///
/// Only the file-backed extent of each segment is served; a segment's
/// `p_memsz` tail that was not dumped reads as unmapped.
pub struct CoreMemory<'a> {
    bytes: &'a [u8],
    segments: Vec<CoreSegment>,
}

struct CoreSegment {
    vaddr: Range<u64>,
    file: Range<usize>,
}

impl<'a> CoreMemory<'a> {
    /// Indexes the core image's loadable segments for address lookup.
    pub fn new(bytes: &'a [u8], phdrs: &[ProgramHeader]) -> Self {
        let mut segments = phdrs
            .iter()
            .filter(|phdr| phdr.p_type == PT_LOAD && phdr.p_filesz > 0)
            .map(|phdr| CoreSegment {
                vaddr: phdr.p_vaddr..phdr.p_vaddr.saturating_add(phdr.p_filesz),
                file: phdr.p_offset as usize
                    ..(phdr.p_offset.saturating_add(phdr.p_filesz) as usize).min(bytes.len()),
            })
            .collect::<Vec<_>>();

        segments.sort_by_key(|seg| seg.vaddr.start);

        Self { bytes, segments }
    }
}

impl MemorySource for CoreMemory<'_> {
    fn read(&self, addr: u64, min_len: usize, max_len: usize) -> Result<Cow<'_, [u8]>> {
        let idx = self
            .segments
            .partition_point(|seg| seg.vaddr.end <= addr);

        let seg = self
            .segments
            .get(idx)
            .filter(|seg| seg.vaddr.contains(&addr))
            .ok_or(Error::Unmapped(addr))?;

        let off = seg.file.start.saturating_add((addr - seg.vaddr.start) as usize);
        let end = seg.file.end.min(off.saturating_add(max_len));

        if end <= off || end - off < min_len {
            return Err(Error::TruncatedRead {
                addr,
                need: min_len,
                got: end.saturating_sub(off),
            });
        }

        Ok(Cow::Borrowed(&self.bytes[off..end]))
    }
}
