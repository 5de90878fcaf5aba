//! Materialized ELF images and in-memory image reconstruction.
//!
//! An [Image] owns the bytes of an ELF file already resident in memory,
//! wherever they came from (disk, a core dump, or [reconstruct]), and
//! exposes the typed accessors the rest of the crate consumes.

use std::cell::OnceCell;
use std::ops::Range;
use std::path::{Path, PathBuf};

use goblin::container::Ctx;
use goblin::elf::header::ET_REL;
use goblin::elf::note::NT_GNU_BUILD_ID;
use goblin::elf::program_header::{PT_DYNAMIC, PT_LOAD, PT_NOTE};
use goblin::elf::section_header::{SHN_UNDEF, SHN_XINDEX, SHT_DYNSYM, SHT_SYMTAB};
use goblin::elf::sym::{STB_WEAK, st_bind};
use goblin::elf::{Elf, Header, ProgramHeader, SectionHeader, Symtab};
use goblin::strtab::Strtab;

use crate::mem::MemorySource;
use crate::{Error, Result};

/// One entry of an image's symbol table, with its name resolved.
#[derive(Debug, Clone)]
pub struct SymbolEntry {
    /// Symbol name.
    pub name: String,

    /// Symbol value (an address, or a section offset for `ET_REL`).
    pub value: u64,

    /// Symbol size in bytes.
    pub size: u64,

    /// Section header index the symbol is defined against.
    pub section: usize,

    /// Whether the symbol has weak binding.
    pub is_weak: bool,
}

/// ELF image resident in memory.
pub struct Image {
    bytes: Vec<u8>,
    header: Header,
    ctx: Ctx,
    shdrs: Vec<SectionHeader>,
    shdr_names: Vec<String>,
    path: Option<PathBuf>,
    symbols: OnceCell<Vec<SymbolEntry>>,
}

impl Image {
    /// Parses the given bytes as an ELF image.
    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        let header = Elf::parse_header(&bytes)?;
        let ctx = Ctx::new(header.container()?, header.endianness()?);

        let (shdrs, shdr_names) = parse_sections(&bytes, &header, ctx)?;

        Ok(Self {
            bytes,
            header,
            ctx,
            shdrs,
            shdr_names,
            path: None,
            symbols: OnceCell::new(),
        })
    }

    /// Reads and parses an on-disk ELF file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let bytes =
            std::fs::read(path).map_err(|e| Error::File(path.to_path_buf(), e))?;

        let mut image = Self::parse(bytes)?;
        image.path = Some(path.to_path_buf());

        Ok(image)
    }

    /// ELF header of the image.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Binary context (word size, endianness) of the image.
    pub fn ctx(&self) -> Ctx {
        self.ctx
    }

    /// Raw bytes of the image.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Path the image was read from, if it came from disk.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether this is an unlinked relocatable object (`ET_REL`).
    pub fn is_relocatable(&self) -> bool {
        self.header.e_type == ET_REL
    }

    /// Program headers of the image.
    pub fn program_headers(&self) -> Result<Vec<ProgramHeader>> {
        if self.header.e_phoff == 0 || self.header.e_phnum == 0 {
            return Ok(Vec::new());
        }

        ProgramHeader::parse(
            &self.bytes,
            self.header.e_phoff as usize,
            self.header.e_phnum as usize,
            self.ctx,
        )
        .map_err(Into::into)
    }

    /// Section headers of the image (empty when the section table is
    /// missing, e.g. a reconstructed image).
    pub fn section_headers(&self) -> &[SectionHeader] {
        &self.shdrs
    }

    /// Name of the section with the given header index.
    pub fn section_name(&self, index: usize) -> Option<&str> {
        self.shdr_names.get(index).map(String::as_str)
    }

    /// Index of the first section with the given name.
    pub fn section_index(&self, name: &str) -> Option<usize> {
        self.shdr_names.iter().position(|n| n == name)
    }

    /// File-backed bytes of the section with the given header index.
    pub fn section_bytes(&self, index: usize) -> Option<&[u8]> {
        let range = self.shdrs.get(index)?.file_range()?;
        self.bytes.get(range)
    }

    /// Mutable file-backed bytes of the section with the given header index.
    pub(crate) fn section_bytes_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let range = self.shdrs.get(index)?.file_range()?;
        self.bytes.get_mut(range)
    }

    /// Link-time address range spanned by the image's `PT_LOAD` segments,
    /// page-aligned outward.
    pub fn load_range(&self, page_size: u64) -> Result<Range<u64>> {
        let mask = !(page_size - 1);

        let mut start = u64::MAX;
        let mut end = 0;

        for phdr in self.program_headers()? {
            if phdr.p_type != PT_LOAD {
                continue;
            }

            start = start.min(phdr.p_vaddr & mask);

            let memsz_end = phdr.p_vaddr.saturating_add(phdr.p_memsz);
            end = end.max(memsz_end.saturating_add(page_size - 1) & mask);
        }

        if start >= end {
            return Err(Error::MissingPtLoad);
        }

        Ok(start..end)
    }

    /// Virtual address and size of the image's dynamic segment.
    pub fn dynamic_segment(&self) -> Result<Option<(u64, u64)>> {
        Ok(self
            .program_headers()?
            .iter()
            .find(|phdr| phdr.p_type == PT_DYNAMIC)
            .map(|phdr| (phdr.p_vaddr, phdr.p_filesz)))
    }

    /// `NT_GNU_BUILD_ID` descriptor and its virtual address, if present.
    ///
    /// Looked up through `PT_NOTE` segments first, then through the
    /// `.note.gnu.build-id` section for images without program headers.
    pub fn build_id(&self) -> Option<(u64, Vec<u8>)> {
        for phdr in self.program_headers().ok()?.iter() {
            if phdr.p_type != PT_NOTE {
                continue;
            }

            let data = self.bytes.get(phdr.file_range())?;

            if let Some((off, desc)) = find_build_id_note(data, self.ctx) {
                return Some((phdr.p_vaddr.wrapping_add(off), desc));
            }
        }

        let index = self.section_index(".note.gnu.build-id")?;
        let shdr = self.shdrs.get(index)?;
        let data = self.section_bytes(index)?;

        find_build_id_note(data, self.ctx).map(|(off, desc)| (shdr.sh_addr.wrapping_add(off), desc))
    }

    /// Symbols of the image, from `.symtab` when present, `.dynsym`
    /// otherwise. Resolved once and memoized.
    pub fn symbols(&self) -> &[SymbolEntry] {
        self.symbols.get_or_init(|| {
            parse_symbols(&self.bytes, &self.shdrs, self.ctx).unwrap_or_default()
        })
    }
}

fn parse_sections(
    bytes: &[u8],
    header: &Header,
    ctx: Ctx,
) -> Result<(Vec<SectionHeader>, Vec<String>)> {
    if header.e_shoff == 0 || header.e_shnum == 0 {
        return Ok((Vec::new(), Vec::new()));
    }

    let shdrs = SectionHeader::parse(
        bytes,
        header.e_shoff as usize,
        header.e_shnum as usize,
        ctx,
    )?;

    let index = match header.e_shstrndx.into() {
        SHN_XINDEX => shdrs.first().map(|shdr| shdr.sh_link as usize),
        SHN_UNDEF => None,
        n => Some(n as usize),
    };

    let names = match index.and_then(|i| shdrs.get(i)) {
        Some(shdr) => {
            let strtab =
                Strtab::parse(bytes, shdr.sh_offset as usize, shdr.sh_size as usize, 0x0)?;

            shdrs
                .iter()
                .map(|shdr| {
                    strtab
                        .get_at(shdr.sh_name)
                        .unwrap_or_default()
                        .to_owned()
                })
                .collect()
        }
        None => vec![String::new(); shdrs.len()],
    };

    Ok((shdrs, names))
}

fn parse_symbols(
    bytes: &[u8],
    shdrs: &[SectionHeader],
    ctx: Ctx,
) -> Result<Vec<SymbolEntry>> {
    let shdr = shdrs
        .iter()
        .rfind(|shdr| shdr.sh_type == SHT_SYMTAB)
        .or_else(|| shdrs.iter().rfind(|shdr| shdr.sh_type == SHT_DYNSYM));

    let Some(shdr) = shdr else {
        return Ok(Vec::new());
    };

    let count = if shdr.sh_entsize == 0 {
        0
    } else {
        shdr.sh_size / shdr.sh_entsize
    };

    let syms = Symtab::parse(bytes, shdr.sh_offset as usize, count as usize, ctx)?;

    let Some(strtab_shdr) = shdrs.get(shdr.sh_link as usize) else {
        return Ok(Vec::new());
    };

    let strtab = Strtab::parse(
        bytes,
        strtab_shdr.sh_offset as usize,
        strtab_shdr.sh_size as usize,
        0x0,
    )?;

    Ok(syms
        .iter()
        .map(|sym| SymbolEntry {
            name: strtab.get_at(sym.st_name).unwrap_or_default().to_owned(),
            value: sym.st_value,
            size: sym.st_size,
            section: sym.st_shndx,
            is_weak: st_bind(sym.st_info) == STB_WEAK,
        })
        .collect())
}

/// Returns the descriptor offset and bytes of the first `NT_GNU_BUILD_ID`
/// note in `data`.
pub(crate) fn find_build_id_note(data: &[u8], ctx: Ctx) -> Option<(u64, Vec<u8>)> {
    let mut iter = goblin::elf::note::NoteDataIterator {
        data,
        size: data.len(),
        offset: 0,
        ctx: (4, ctx),
    };

    loop {
        let start = iter.offset;
        let note = iter.next()?.ok()?;

        if note.name == "GNU" && note.n_type == NT_GNU_BUILD_ID {
            // 12-byte note header, then the NUL-padded name, then the descriptor.
            let desc_off = start + 12 + (note.name.len() + 1).next_multiple_of(4);
            return Some((desc_off as u64, note.desc.to_vec()));
        }
    }
}

/// Reconstructs a byte-exact ELF file image purely from memory.
///
/// `entry_vaddr` is the address the ELF header is mapped at. The returned
/// load base is `entry_vaddr - p_vaddr` of the `PT_LOAD` segment covering
/// the file start. When the reconstructed bytes stop short of the section
/// header table, the synthesized header's section fields are zeroed: the
/// image intentionally has no sections.
pub fn reconstruct(
    entry_vaddr: u64,
    page_size: u64,
    loadbase_hint: Option<u64>,
    mem: &dyn MemorySource,
) -> Result<(Vec<u8>, u64)> {
    const INITIAL_CHUNK: usize = 4096;

    let page_mask = !(page_size - 1);

    //
    // Fetch and validate the ELF header.
    //

    let ehdr_size = Header::size(Ctx::new(
        goblin::container::Container::Big,
        goblin::container::Endian::Little,
    ));

    let prefix = mem.read(entry_vaddr, ehdr_size, INITIAL_CHUNK)?;
    let header = Elf::parse_header(&prefix)?;
    let ctx = Ctx::new(header.container()?, header.endianness()?);

    if header.e_phentsize as usize != ProgramHeader::size(ctx) {
        return Err(Error::BadImage("bad e_phentsize"));
    }

    //
    // Fetch the program-header table, re-reading if the prefix missed it.
    //

    let phoff = header.e_phoff as usize;
    let phnum = header.e_phnum as usize;
    let table_size = phnum * ProgramHeader::size(ctx);

    let phdrs = if phoff.saturating_add(table_size) <= prefix.len() {
        ProgramHeader::parse(&prefix, phoff, phnum, ctx)?
    } else {
        let table = mem.read(entry_vaddr.wrapping_add(phoff as u64), table_size, table_size)?;
        ProgramHeader::parse(&table, 0, phnum, ctx)?
    };

    //
    // Derive the load bias and the file-image footprint.
    //

    let mut loadbase = loadbase_hint;
    let mut contents_size = 0usize;

    for phdr in phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD) {
        let file_end = phdr.p_offset.saturating_add(phdr.p_filesz);
        let file_end = file_end.saturating_add(page_size - 1) & page_mask;
        contents_size = contents_size.max(file_end as usize);

        let covers_phdrs = phdr.p_offset as usize <= phoff
            && phoff.saturating_add(table_size)
                <= phdr.p_offset.saturating_add(phdr.p_filesz) as usize;

        if phdr.p_offset & page_mask == 0 && covers_phdrs {
            loadbase = Some(entry_vaddr.wrapping_sub(phdr.p_vaddr & page_mask));
        }
    }

    let loadbase = loadbase.ok_or(Error::BadImage("no PT_LOAD covers the headers"))?;

    tracing::debug!(
        base = format_args!("{loadbase:#x}"),
        size = contents_size,
        "reconstructing image"
    );

    //
    // Assemble the image from every loadable segment.
    //

    let mut image = Vec::new();
    image
        .try_reserve_exact(contents_size)
        .map_err(|_| Error::OutOfMemory(contents_size))?;
    image.resize(contents_size, 0);

    for phdr in phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD) {
        let vaddr = loadbase.wrapping_add(phdr.p_vaddr & page_mask);
        let file_start = (phdr.p_offset & page_mask) as usize;
        let file_end = phdr.p_offset.saturating_add(phdr.p_filesz) as usize;

        if file_end <= file_start {
            continue;
        }

        let need = file_end - file_start;
        let want = ((need as u64 + page_size - 1) & page_mask) as usize;

        let bytes = mem.read(vaddr, need, want)?;
        let copied = bytes.len().min(image.len() - file_start);

        image[file_start..file_start + copied].copy_from_slice(&bytes[..copied]);
    }

    //
    // Drop the section table from the synthesized header when the
    // reconstructed bytes do not reach it.
    //

    let shdr_table_end = header
        .e_shoff
        .saturating_add(u64::from(header.e_shnum) * u64::from(header.e_shentsize));

    if header.e_shoff != 0 && shdr_table_end > contents_size as u64 {
        zero_section_fields(&mut image, ctx);
    }

    Ok((image, loadbase))
}

/// Zeroes `e_shoff`, `e_shnum` and `e_shstrndx` in a serialized ELF header.
fn zero_section_fields(image: &mut [u8], ctx: Ctx) {
    // Field offsets in Elf32_Ehdr / Elf64_Ehdr.
    let (shoff, shoff_len, shnum, shstrndx) = if ctx.container.is_big() {
        (0x28, 8, 0x3c, 0x3e)
    } else {
        (0x20, 4, 0x30, 0x32)
    };

    for field in [shoff..shoff + shoff_len, shnum..shnum + 2, shstrndx..shstrndx + 2] {
        if let Some(bytes) = image.get_mut(field) {
            bytes.fill(0);
        }
    }
}
