//! Link-map walking: the dynamic linker's own list of loaded objects.
//!
//! The walker bootstraps from the auxiliary vector (whose word size and
//! byte order are themselves unknown and probed first), follows
//! `AT_PHDR` to the executable's program headers, recovers the `r_debug`
//! struct through `DT_DEBUG`, and then follows the linked list of
//! loaded-object nodes entirely through [MemorySource] reads. Modules it
//! reports are authoritative and win over segment-scan results.

use std::collections::HashSet;
use std::path::Path;

use goblin::container::{Container, Ctx, Endian};
use goblin::elf::dynamic::{DT_DEBUG, DT_NULL};
use goblin::elf::program_header::{PT_DYNAMIC, PT_LOAD, PT_PHDR};
use goblin::elf::{Dyn, ProgramHeader};
use scroll::Pread;

use crate::image::Image;
use crate::mem::{self, MemorySource};
use crate::module::{Backing, Module, ModuleOrigin};
use crate::session::Session;
use crate::{Error, Result};

const AT_NULL: u64 = 0;
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_PAGESZ: u64 = 6;
const AT_ENTRY: u64 = 9;

/// Iteration cap for one link-map walk, guarding against a corrupted or
/// cyclic list.
const MAX_MODULES: usize = 1024;

/// Byte cap for one module name read.
const MAX_NAME: usize = 4096;

/// Dynamic-entry cap for one dynamic-segment walk.
const MAX_DYN_ENTRIES: usize = 4096;

/// Auxiliary-vector values the walker consumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuxvValues {
    /// `AT_ENTRY`: executable entry point.
    pub entry: Option<u64>,

    /// `AT_PHDR`: address of the executable's program headers.
    pub phdr: Option<u64>,

    /// `AT_PHNUM`: number of program headers.
    pub phnum: Option<u64>,

    /// `AT_PAGESZ`: page size of the address space.
    pub pagesz: u64,
}

/// Probes the auxiliary vector's word size and byte order, then extracts
/// the values the walker needs.
///
/// The probe searches for an (`AT_PHENT`, native program-header size)
/// pair under all four width/order combinations; exactly one combination
/// must match, otherwise the vector is rejected.
pub fn probe_auxv(auxv: &[u8]) -> Result<(Ctx, AuxvValues)> {
    let combinations = [
        Ctx::new(Container::Big, Endian::Little),
        Ctx::new(Container::Big, Endian::Big),
        Ctx::new(Container::Little, Endian::Little),
        Ctx::new(Container::Little, Endian::Big),
    ];

    let mut selected = None;

    for ctx in combinations {
        let phent = ProgramHeader::size(ctx) as u64;

        let matches = auxv_entries(auxv, ctx)
            .any(|(ty, val)| ty == AT_PHENT && val == phent);

        if matches && selected.replace(ctx).is_some() {
            // Ambiguous: refuse to guess.
            return Err(Error::AuxvFormat);
        }
    }

    let ctx = selected.ok_or(Error::AuxvFormat)?;

    tracing::debug!(
        class = if ctx.container.is_big() { 64 } else { 32 },
        big_endian = matches!(ctx.le, Endian::Big),
        "probed auxv format"
    );

    let mut values = AuxvValues {
        pagesz: 4096,
        ..Default::default()
    };

    for (ty, val) in auxv_entries(auxv, ctx) {
        match ty {
            AT_ENTRY => values.entry = Some(val),
            AT_PHDR => values.phdr = Some(val),
            AT_PHNUM => values.phnum = Some(val),
            AT_PAGESZ if val != 0 => values.pagesz = val,
            _ => (),
        }
    }

    Ok((ctx, values))
}

/// Iterates `(type, value)` pairs of an auxiliary vector under the given
/// word size and byte order, stopping at `AT_NULL` or at the buffer end.
fn auxv_entries(auxv: &[u8], ctx: Ctx) -> impl Iterator<Item = (u64, u64)> + '_ {
    let word = word_size(ctx);

    (0..auxv.len() / (word * 2))
        .map_while(move |i| {
            let mut offset = i * word * 2;

            let ty = read_word_buf(auxv, &mut offset, ctx)?;
            let val = read_word_buf(auxv, &mut offset, ctx)?;

            Some((ty, val))
        })
        .take_while(|(ty, _)| *ty != AT_NULL)
}

/// Walks the link map bootstrapped from the given auxiliary vector.
///
/// `exe_file` backs reads of the executable's program headers when they
/// are not readable through `mem` (e.g. not dumped into a core file).
/// Returns the number of modules registered.
pub fn walk(
    session: &mut Session,
    auxv: &[u8],
    mem: &dyn MemorySource,
    exe_file: Option<&Path>,
) -> Result<usize> {
    let (ctx, values) = probe_auxv(auxv)?;

    let r_debug = find_r_debug(ctx, &values, mem, exe_file)?;

    walk_r_debug(session, ctx, r_debug, mem, exe_file)
}

/// Recovers the `r_debug` address without an auxiliary vector, by probing
/// already-registered modules' dynamic segments for a readable `DT_DEBUG`
/// value.
pub fn walk_without_auxv(
    session: &mut Session,
    mem: &dyn MemorySource,
    exe_file: Option<&Path>,
) -> Result<usize> {
    let mut found = None;

    for (_, module) in session.modules() {
        let Some(dynamic_vaddr) = module.dynamic_vaddr() else {
            continue;
        };

        // The module's own header tells us the word size and byte order.
        let Ok(chunk) = mem.read(module.addr_range().start, 64, 64) else {
            continue;
        };

        let Ok(header) = goblin::elf::Elf::parse_header(&chunk) else {
            continue;
        };

        let Ok(container) = header.container() else { continue };
        let Ok(endianness) = header.endianness() else { continue };
        let ctx = Ctx::new(container, endianness);

        if let Ok(Some(r_debug)) = dt_debug_value(mem, dynamic_vaddr, ctx) {
            if r_debug != 0 {
                found = Some((ctx, r_debug));
                break;
            }
        }
    }

    let (ctx, r_debug) = found.ok_or(Error::MissingDtDebug)?;

    walk_r_debug(session, ctx, r_debug, mem, exe_file)
}

/// Follows `AT_PHDR` to the executable's `PT_DYNAMIC` and reads the live
/// `DT_DEBUG` value out of it.
fn find_r_debug(
    ctx: Ctx,
    values: &AuxvValues,
    mem: &dyn MemorySource,
    exe_file: Option<&Path>,
) -> Result<u64> {
    let phdr_addr = values.phdr.ok_or(Error::AuxvFormat)?;
    let phnum = values.phnum.ok_or(Error::AuxvFormat)? as usize;

    if phnum == 0 || phnum > u16::MAX as usize {
        return Err(Error::AuxvFormat);
    }

    //
    // Fetch the executable's program headers, preferring memory.
    //

    let table_size = phnum * ProgramHeader::size(ctx);

    let phdrs = match mem.read(phdr_addr, table_size, table_size) {
        Ok(table) => ProgramHeader::parse(&table, 0, phnum, ctx)?,
        Err(e) => {
            let path = exe_file.ok_or(e)?;

            tracing::debug!(path = %path.display(), "program headers read from file");

            let image = Image::from_file(path)?;
            image.program_headers()?
        }
    };

    //
    // PT_PHDR pins the executable's load bias.
    //

    let bias = phdrs
        .iter()
        .find(|phdr| phdr.p_type == PT_PHDR)
        .map(|phdr| phdr_addr.wrapping_sub(phdr.p_vaddr))
        .unwrap_or(0);

    let dyn_addr = phdrs
        .iter()
        .find(|phdr| phdr.p_type == PT_DYNAMIC)
        .map(|phdr| bias.wrapping_add(phdr.p_vaddr))
        .ok_or(Error::MissingPtDynamic)?;

    let r_debug = dt_debug_value(mem, dyn_addr, ctx)?.ok_or(Error::MissingDtDebug)?;

    if r_debug == 0 {
        return Err(Error::RDebugUnset);
    }

    tracing::debug!(addr = format_args!("{r_debug:#x}"), "found r_debug");

    Ok(r_debug)
}

/// Reads the live `DT_DEBUG` value out of a mapped dynamic segment.
fn dt_debug_value(mem: &dyn MemorySource, dyn_addr: u64, ctx: Ctx) -> Result<Option<u64>> {
    let entry_size = Dyn::size(ctx.container);

    for i in 0..MAX_DYN_ENTRIES {
        let addr = dyn_addr.wrapping_add((i * entry_size) as u64);

        let Ok(data) = mem.read(addr, entry_size, entry_size) else {
            return Ok(None);
        };

        let entry = data.gread_with::<Dyn>(&mut 0, ctx)?;

        match entry.d_tag {
            DT_NULL => return Ok(None),
            DT_DEBUG => return Ok(Some(entry.d_val)),
            _ => (),
        }
    }

    Ok(None)
}

/// Walks the node list anchored at the given `r_debug` address.
fn walk_r_debug(
    session: &mut Session,
    ctx: Ctx,
    r_debug: u64,
    mem: &dyn MemorySource,
    exe_file: Option<&Path>,
) -> Result<usize> {
    let word = word_size(ctx) as u64;

    // r_map sits one word past r_version (int, padded to word size).
    let mut node_addr = read_word(mem, r_debug.wrapping_add(word), ctx)?;

    let mut visited = HashSet::new();
    let mut added = 0;

    for index in 0.. {
        if node_addr == 0 {
            break;
        }

        if index == MAX_MODULES || !visited.insert(node_addr) {
            // A cyclic or runaway list truncates the walk, it does not
            // invalidate the modules already gathered.
            tracing::warn!(
                node = format_args!("{node_addr:#x}"),
                index,
                "link map truncated"
            );
            break;
        }

        let node = match read_node(mem, node_addr, ctx) {
            Ok(node) => node,
            Err(e) => {
                tracing::warn!(error = %e, "link map node unreadable");
                break;
            }
        };

        match report_node(session, ctx, &node, mem, exe_file, index == 0) {
            Ok(true) => added += 1,
            Ok(false) => (),
            Err(e) => tracing::warn!(error = %e, name = %node.name, "link map node skipped"),
        }

        node_addr = node.next;
    }

    Ok(added)
}

/// One decoded loaded-object node.
struct LinkMapNode {
    addr: u64,
    name: String,
    ld: u64,
    next: u64,
}

/// Reads the four words of a loaded-object node, then its name string.
fn read_node(mem: &dyn MemorySource, node_addr: u64, ctx: Ctx) -> Result<LinkMapNode> {
    let word = word_size(ctx);

    let data = mem::read_exact(mem, node_addr, word * 4)?;

    let mut offset = 0;
    let addr = read_word_buf(&data, &mut offset, ctx).ok_or(Error::TruncatedRead {
        addr: node_addr,
        need: word * 4,
        got: data.len(),
    })?;
    let name_ptr = read_word_buf(&data, &mut offset, ctx).unwrap_or(0);
    let ld = read_word_buf(&data, &mut offset, ctx).unwrap_or(0);
    let next = read_word_buf(&data, &mut offset, ctx).unwrap_or(0);

    let name = if name_ptr != 0 {
        let bytes = mem::read_cstring(mem, name_ptr, MAX_NAME).unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    } else {
        String::new()
    };

    Ok(LinkMapNode {
        addr,
        name,
        ld,
        next,
    })
}

/// Registers the module a node describes. Returns whether one was added.
///
/// The module is anchored at `l_ld` minus the image's own dynamic-section
/// vaddr, which holds even when `l_addr` lies (e.g. prelinked objects).
fn report_node(
    session: &mut Session,
    ctx: Ctx,
    node: &LinkMapNode,
    mem: &dyn MemorySource,
    exe_file: Option<&Path>,
    is_executable: bool,
) -> Result<bool> {
    let path = if node.name.is_empty() {
        exe_file.map(Path::to_path_buf)
    } else {
        Some(std::path::PathBuf::from(&node.name))
    };

    let file_image = path
        .as_deref()
        .filter(|path| path.exists())
        .and_then(|path| match Image::from_file(path) {
            Ok(image) => Some(image),
            Err(e) => {
                tracing::debug!(error = %e, path = %path.display(), "file unreadable");
                None
            }
        });

    if let Some(image) = file_image {
        let (dyn_vaddr, _) = image.dynamic_segment()?.ok_or(Error::MissingPtDynamic)?;

        let bias = node.ld.wrapping_sub(dyn_vaddr);
        let range = image.load_range(4096)?;

        //
        // Cross-check the file against memory before trusting it.
        //

        let file_id = image.build_id();

        let verified = match file_id {
            Some((vaddr, ref bytes)) => {
                match mem.read(bias.wrapping_add(vaddr), bytes.len(), bytes.len()) {
                    Ok(in_memory) => *in_memory == bytes[..],
                    // Unreadable note memory is not evidence of a mismatch.
                    Err(_) => true,
                }
            }
            None => true,
        };

        if verified {
            let name = if node.name.is_empty() {
                path.as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "[exe]".to_owned())
            } else {
                node.name.clone()
            };

            let module = Module {
                name,
                addr_range: bias.wrapping_add(range.start)..bias.wrapping_add(range.end),
                bias,
                build_id: file_id.map(|(vaddr, bytes)| crate::BuildId {
                    vaddr: bias.wrapping_add(vaddr),
                    bytes,
                }),
                dynamic_vaddr: Some(node.ld),
                is_executable,
                origin: ModuleOrigin::LinkMap,
                backing: Backing::Image(std::rc::Rc::new(image)),
            };

            return Ok(!matches!(
                session.insert(module)?,
                crate::session::InsertOutcome::Rejected
            ));
        }

        tracing::warn!(
            error = %Error::BuildIdMismatch(path.clone().unwrap_or_default()),
            "link map file rejected, using memory"
        );
    }

    //
    // No (trustworthy) file: derive the module from memory alone.
    //

    let base = if node.addr != 0 { node.addr } else { node.ld };

    let Some((range, bias, page_size)) = bounds_from_memory(mem, base, ctx) else {
        return Err(Error::BadImage("module has no readable headers"));
    };

    let name = if node.name.is_empty() {
        "[exe]".to_owned()
    } else {
        node.name.clone()
    };

    let module = Module {
        name,
        addr_range: range,
        bias,
        build_id: None,
        dynamic_vaddr: Some(node.ld),
        is_executable,
        origin: ModuleOrigin::LinkMap,
        backing: Backing::Memory {
            entry_vaddr: base,
            page_size,
        },
    };

    Ok(!matches!(
        session.insert(module)?,
        crate::session::InsertOutcome::Rejected
    ))
}

/// Derives a module's runtime address range from program headers read out
/// of memory at `base`.
fn bounds_from_memory(
    mem: &dyn MemorySource,
    base: u64,
    ctx: Ctx,
) -> Option<(std::ops::Range<u64>, u64, u64)> {
    let chunk = mem.read(base, 64, 4096).ok()?;
    let header = goblin::elf::Elf::parse_header(&chunk).ok()?;

    if header.e_phentsize as usize != ProgramHeader::size(ctx) {
        return None;
    }

    let phoff = header.e_phoff as usize;
    let phnum = header.e_phnum as usize;
    let table_size = phnum * ProgramHeader::size(ctx);

    let phdrs = if phoff + table_size <= chunk.len() {
        ProgramHeader::parse(&chunk, phoff, phnum, ctx).ok()?
    } else {
        let table = mem.read(base + phoff as u64, table_size, table_size).ok()?;
        ProgramHeader::parse(&table, 0, phnum, ctx).ok()?
    };

    let page_size = phdrs
        .iter()
        .find(|phdr| phdr.p_type == PT_LOAD)
        .map(|phdr| phdr.p_align)
        .filter(|align| align.is_power_of_two())
        .unwrap_or(4096);
    let mask = !(page_size - 1);

    let mut start = u64::MAX;
    let mut end = 0;

    for phdr in phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD) {
        start = start.min(phdr.p_vaddr & mask);

        let memsz_end = phdr.p_vaddr.saturating_add(phdr.p_memsz);
        end = end.max(memsz_end.saturating_add(page_size - 1) & mask);
    }

    if start >= end {
        return None;
    }

    let bias = base.wrapping_sub(start);

    Some((base..bias.wrapping_add(end), bias, page_size))
}

fn word_size(ctx: Ctx) -> usize {
    if ctx.container.is_big() { 8 } else { 4 }
}

/// Reads one target word out of a buffer, widening 32-bit words.
fn read_word_buf(data: &[u8], offset: &mut usize, ctx: Ctx) -> Option<u64> {
    if ctx.container.is_big() {
        data.gread_with::<u64>(offset, ctx.le).ok()
    } else {
        data.gread_with::<u32>(offset, ctx.le).ok().map(u64::from)
    }
}

/// Reads one target word at an address.
fn read_word(mem: &dyn MemorySource, addr: u64, ctx: Ctx) -> Result<u64> {
    let word = word_size(ctx);
    let data = mem::read_exact(mem, addr, word)?;

    read_word_buf(&data, &mut 0, ctx).ok_or(Error::TruncatedRead {
        addr,
        need: word,
        got: data.len(),
    })
}
