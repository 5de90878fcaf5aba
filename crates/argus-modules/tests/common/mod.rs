//! Synthetic ELF images and address spaces for integration tests.

use std::borrow::Cow;

use argus_modules::mem::MemorySource;

pub const PAGE: u64 = 0x1000;

/// File size of every built image.
pub const IMAGE_SIZE: usize = 0x2000;

pub const PHDR_OFF: usize = 0x40;
pub const NOTE_OFF: usize = 0x200;
pub const DYN_OFF: usize = 0x300;
pub const DYNSTR_OFF: usize = 0x400;
pub const SYMTAB_OFF: usize = 0x500;
pub const STRTAB_OFF: usize = 0x580;
pub const SHSTRTAB_OFF: usize = 0x5c0;
pub const SHDR_OFF: usize = 0x600;

const PT_PHDR: u32 = 6;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_NOTE: u32 = 4;

const DT_STRTAB: u64 = 5;
const DT_STRSZ: u64 = 10;
const DT_SONAME: u64 = 14;
const DT_DEBUG: u64 = 21;

/// Builds a minimal but well-formed 64-bit little-endian ELF image: one
/// `PT_LOAD` at offset 0/vaddr 0 spanning the whole file, a dynamic
/// segment, a note segment, and optionally a symbol table.
pub struct ElfBuilder {
    executable: bool,
    soname: Option<String>,
    build_id: Option<Vec<u8>>,
    dt_debug: Option<u64>,
    symbols: Vec<(String, u64, u64)>,
}

impl ElfBuilder {
    pub fn new() -> Self {
        Self {
            executable: false,
            soname: None,
            build_id: None,
            dt_debug: None,
            symbols: Vec::new(),
        }
    }

    /// Marks the image `ET_EXEC` instead of `ET_DYN`.
    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }

    pub fn soname(mut self, soname: &str) -> Self {
        self.soname = Some(soname.to_owned());
        self
    }

    pub fn build_id(mut self, id: &[u8]) -> Self {
        self.build_id = Some(id.to_vec());
        self
    }

    /// Adds a `DT_DEBUG` entry holding the given (live) value.
    pub fn dt_debug(mut self, value: u64) -> Self {
        self.dt_debug = Some(value);
        self
    }

    pub fn symbol(mut self, name: &str, value: u64, size: u64) -> Self {
        self.symbols.push((name.to_owned(), value, size));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut image = vec![0u8; IMAGE_SIZE];

        //
        // Dynamic segment.
        //

        let mut dynstr = vec![0u8];
        let soname_off = self.soname.as_ref().map(|soname| {
            let off = dynstr.len() as u64;
            dynstr.extend_from_slice(soname.as_bytes());
            dynstr.push(0);
            off
        });

        let mut dynamic: Vec<(u64, u64)> = vec![
            (DT_STRTAB, DYNSTR_OFF as u64),
            (DT_STRSZ, dynstr.len() as u64),
        ];

        if let Some(off) = soname_off {
            dynamic.push((DT_SONAME, off));
        }

        if let Some(value) = self.dt_debug {
            dynamic.push((DT_DEBUG, value));
        }

        dynamic.push((0, 0));

        let dyn_size = dynamic.len() * 16;

        for (i, (tag, val)) in dynamic.iter().enumerate() {
            image[DYN_OFF + i * 16..DYN_OFF + i * 16 + 8].copy_from_slice(&tag.to_le_bytes());
            image[DYN_OFF + i * 16 + 8..DYN_OFF + i * 16 + 16]
                .copy_from_slice(&val.to_le_bytes());
        }

        image[DYNSTR_OFF..DYNSTR_OFF + dynstr.len()].copy_from_slice(&dynstr);

        //
        // Build-id note.
        //

        let note_size = match self.build_id {
            Some(ref id) => {
                let mut note = Vec::new();
                note.extend_from_slice(&4u32.to_le_bytes());
                note.extend_from_slice(&(id.len() as u32).to_le_bytes());
                note.extend_from_slice(&3u32.to_le_bytes()); // NT_GNU_BUILD_ID
                note.extend_from_slice(b"GNU\0");
                note.extend_from_slice(id);

                while note.len() % 4 != 0 {
                    note.push(0);
                }

                image[NOTE_OFF..NOTE_OFF + note.len()].copy_from_slice(&note);
                note.len()
            }
            None => 0,
        };

        //
        // Program headers: PT_PHDR, PT_LOAD, PT_DYNAMIC, PT_NOTE.
        //

        let phdrs: [(u32, u32, u64, u64, u64); 4] = [
            (PT_PHDR, 4, PHDR_OFF as u64, (4 * 56) as u64, 8),
            (PT_LOAD, 5, 0, IMAGE_SIZE as u64, PAGE),
            (PT_DYNAMIC, 6, DYN_OFF as u64, dyn_size as u64, 8),
            (PT_NOTE, 4, NOTE_OFF as u64, note_size as u64, 4),
        ];

        for (i, (p_type, p_flags, off, size, align)) in phdrs.iter().enumerate() {
            let base = PHDR_OFF + i * 56;
            image[base..base + 4].copy_from_slice(&p_type.to_le_bytes());
            image[base + 4..base + 8].copy_from_slice(&p_flags.to_le_bytes());
            image[base + 8..base + 16].copy_from_slice(&off.to_le_bytes()); // p_offset
            image[base + 16..base + 24].copy_from_slice(&off.to_le_bytes()); // p_vaddr
            image[base + 24..base + 32].copy_from_slice(&off.to_le_bytes()); // p_paddr
            image[base + 32..base + 40].copy_from_slice(&size.to_le_bytes()); // p_filesz
            image[base + 40..base + 48].copy_from_slice(&size.to_le_bytes()); // p_memsz
            image[base + 48..base + 56].copy_from_slice(&align.to_le_bytes());
        }

        //
        // Optional symbol table, carried by a section table.
        //

        let mut shoff = 0u64;
        let mut shnum = 0u16;

        if !self.symbols.is_empty() {
            let mut strtab = vec![0u8];
            let mut symtab = vec![0u8; 24]; // null symbol

            for (name, value, size) in &self.symbols {
                let name_off = strtab.len() as u32;
                strtab.extend_from_slice(name.as_bytes());
                strtab.push(0);

                let mut sym = Vec::new();
                sym.extend_from_slice(&name_off.to_le_bytes());
                sym.push(0x12); // STB_GLOBAL | STT_FUNC
                sym.push(0);
                sym.extend_from_slice(&1u16.to_le_bytes()); // defined against [1]
                sym.extend_from_slice(&value.to_le_bytes());
                sym.extend_from_slice(&size.to_le_bytes());

                symtab.extend_from_slice(&sym);
            }

            let shstrtab = b"\0.symtab\0.strtab\0.shstrtab\0".to_vec();

            image[SYMTAB_OFF..SYMTAB_OFF + symtab.len()].copy_from_slice(&symtab);
            image[STRTAB_OFF..STRTAB_OFF + strtab.len()].copy_from_slice(&strtab);
            image[SHSTRTAB_OFF..SHSTRTAB_OFF + shstrtab.len()].copy_from_slice(&shstrtab);

            let shdrs: [(u32, u32, u64, u64, u32, u32, u64); 4] = [
                (0, 0, 0, 0, 0, 0, 0),
                (1, 2, SYMTAB_OFF as u64, symtab.len() as u64, 2, 1, 24),
                (9, 3, STRTAB_OFF as u64, strtab.len() as u64, 0, 0, 0),
                (17, 3, SHSTRTAB_OFF as u64, shstrtab.len() as u64, 0, 0, 0),
            ];

            for (i, (name, sh_type, off, size, link, info, entsize)) in
                shdrs.iter().enumerate()
            {
                let base = SHDR_OFF + i * 64;
                image[base..base + 4].copy_from_slice(&name.to_le_bytes());
                image[base + 4..base + 8].copy_from_slice(&sh_type.to_le_bytes());
                // sh_flags, sh_addr zero
                image[base + 24..base + 32].copy_from_slice(&off.to_le_bytes());
                image[base + 32..base + 40].copy_from_slice(&size.to_le_bytes());
                image[base + 40..base + 44].copy_from_slice(&link.to_le_bytes());
                image[base + 44..base + 48].copy_from_slice(&info.to_le_bytes());
                image[base + 56..base + 64].copy_from_slice(&entsize.to_le_bytes());
            }

            shoff = SHDR_OFF as u64;
            shnum = 4;
        }

        //
        // ELF header.
        //

        image[0..4].copy_from_slice(b"\x7fELF");
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // ELFDATA2LSB
        image[6] = 1; // EV_CURRENT
        let e_type: u16 = if self.executable { 2 } else { 3 };
        image[16..18].copy_from_slice(&e_type.to_le_bytes());
        image[18..20].copy_from_slice(&0x3eu16.to_le_bytes()); // EM_X86_64
        image[20..24].copy_from_slice(&1u32.to_le_bytes());
        image[24..32].copy_from_slice(&0x1000u64.to_le_bytes()); // e_entry
        image[32..40].copy_from_slice(&(PHDR_OFF as u64).to_le_bytes());
        image[40..48].copy_from_slice(&shoff.to_le_bytes());
        image[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
        image[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        image[56..58].copy_from_slice(&4u16.to_le_bytes()); // e_phnum
        image[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
        image[60..62].copy_from_slice(&shnum.to_le_bytes());
        image[62..64].copy_from_slice(&(if shnum > 0 { 3u16 } else { 0 }).to_le_bytes());

        image
    }
}

/// Multi-segment memory source: a sparse address space assembled from
/// `(base, bytes)` pairs.
pub struct TestMemory {
    segments: Vec<(u64, Vec<u8>)>,
}

impl TestMemory {
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn map(mut self, base: u64, bytes: Vec<u8>) -> Self {
        self.segments.push((base, bytes));
        self.segments.sort_by_key(|(base, _)| *base);
        self
    }
}

impl MemorySource for TestMemory {
    fn read(
        &self,
        addr: u64,
        min_len: usize,
        max_len: usize,
    ) -> argus_modules::Result<Cow<'_, [u8]>> {
        for (base, bytes) in &self.segments {
            if addr >= *base && addr < base + bytes.len() as u64 {
                let start = (addr - base) as usize;
                let end = bytes.len().min(start + max_len);

                if end - start < min_len {
                    return Err(argus_modules::Error::TruncatedRead {
                        addr,
                        need: min_len,
                        got: end - start,
                    });
                }

                return Ok(Cow::Borrowed(&bytes[start..end]));
            }
        }

        Err(argus_modules::Error::Unmapped(addr))
    }
}

/// Little-endian word-pair auxv encoding.
pub fn auxv64(pairs: &[(u64, u64)]) -> Vec<u8> {
    let mut out = Vec::new();

    for (ty, val) in pairs {
        out.extend_from_slice(&ty.to_le_bytes());
        out.extend_from_slice(&val.to_le_bytes());
    }

    out
}

/// Builds a minimal 64-bit little-endian core file from note bytes and
/// `(vaddr, bytes)` load segments.
pub fn build_core(notes: &[(u32, &[u8])], loads: &[(u64, &[u8])]) -> Vec<u8> {
    let phnum = 1 + loads.len();
    let phdr_end = 0x40 + phnum * 56;

    //
    // Note segment content.
    //

    let mut note_data = Vec::new();

    for (n_type, desc) in notes {
        note_data.extend_from_slice(&5u32.to_le_bytes()); // "CORE\0"
        note_data.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        note_data.extend_from_slice(&n_type.to_le_bytes());
        note_data.extend_from_slice(b"CORE\0\0\0\0");
        note_data.extend_from_slice(desc);

        while note_data.len() % 4 != 0 {
            note_data.push(0);
        }
    }

    let note_off = phdr_end.next_multiple_of(8);
    let mut data_off = (note_off + note_data.len()).next_multiple_of(0x1000);

    let mut core = vec![0u8; note_off];

    //
    // Core ELF header.
    //

    core[0..4].copy_from_slice(b"\x7fELF");
    core[4] = 2;
    core[5] = 1;
    core[6] = 1;
    core[16..18].copy_from_slice(&4u16.to_le_bytes()); // ET_CORE
    core[18..20].copy_from_slice(&0x3eu16.to_le_bytes());
    core[20..24].copy_from_slice(&1u32.to_le_bytes());
    core[32..40].copy_from_slice(&0x40u64.to_le_bytes()); // e_phoff
    core[52..54].copy_from_slice(&64u16.to_le_bytes());
    core[54..56].copy_from_slice(&56u16.to_le_bytes());
    core[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

    //
    // Program headers.
    //

    let mut write_phdr = |index: usize,
                          core: &mut Vec<u8>,
                          p_type: u32,
                          off: u64,
                          vaddr: u64,
                          filesz: u64| {
        let base = 0x40 + index * 56;
        core[base..base + 4].copy_from_slice(&p_type.to_le_bytes());
        core[base + 4..base + 8].copy_from_slice(&6u32.to_le_bytes());
        core[base + 8..base + 16].copy_from_slice(&off.to_le_bytes());
        core[base + 16..base + 24].copy_from_slice(&vaddr.to_le_bytes());
        core[base + 32..base + 40].copy_from_slice(&filesz.to_le_bytes());
        core[base + 40..base + 48].copy_from_slice(&filesz.to_le_bytes());
        core[base + 48..base + 56].copy_from_slice(&0x1000u64.to_le_bytes());
    };

    write_phdr(0, &mut core, 4, note_off as u64, 0, note_data.len() as u64);

    for (i, (vaddr, bytes)) in loads.iter().enumerate() {
        write_phdr(1 + i, &mut core, 1, data_off as u64, *vaddr, bytes.len() as u64);
        data_off += bytes.len().next_multiple_of(0x1000);
    }

    //
    // Segment contents.
    //

    core.extend_from_slice(&note_data);

    let mut data_off = (note_off + note_data.len()).next_multiple_of(0x1000);

    for (_, bytes) in loads {
        core.resize(data_off, 0);
        core.extend_from_slice(bytes);
        data_off += bytes.len().next_multiple_of(0x1000);
    }

    core
}

/// `NT_FILE` descriptor for one file mapped as a single range.
pub fn nt_file_desc(start: u64, end: u64, path: &str) -> Vec<u8> {
    let mut desc = Vec::new();

    desc.extend_from_slice(&1u64.to_le_bytes());
    desc.extend_from_slice(&0x1000u64.to_le_bytes());
    desc.extend_from_slice(&start.to_le_bytes());
    desc.extend_from_slice(&end.to_le_bytes());
    desc.extend_from_slice(&0u64.to_le_bytes());
    desc.extend_from_slice(path.as_bytes());
    desc.push(0);

    desc
}

/// `NT_AUXV` note type.
pub const NT_AUXV: u32 = 6;

/// `NT_FILE` note type.
pub const NT_FILE: u32 = 0x46494c45;
