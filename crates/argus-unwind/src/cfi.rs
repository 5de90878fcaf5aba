//! Call-frame information records and their per-session cache.
//!
//! One [CfiCache] owns a `.eh_frame`- or `.debug_frame`-style section and
//! interns every CIE and FDE it decodes: CIEs by section offset, FDEs by
//! the address range they cover. [CfiCache::find_fde] answers "which
//! frame description covers address X" from the memo first, from an
//! `.eh_frame_hdr` binary-search table second, and by a resumable linear
//! scan of the section last. The cache grows monotonically and records
//! are never mutated after insertion.

use std::collections::BTreeMap;
use std::ops::Range;

use rangemap::RangeMap;

use crate::encoding::{
    Cursor, DW_EH_PE_ABSPTR, DW_EH_PE_DATAREL, DW_EH_PE_OMIT, DW_EH_PE_SDATA4, PointerBases,
};
use crate::frame::{self, EvalMode, FrameState};
use crate::{Error, Result};

/// Record length past which a CIE/FDE is declared malformed.
const MAX_RECORD_LEN: usize = 1024 * 1024;

/// Which flavor of call-frame section is being decoded.
///
/// The flavors differ in how a FDE points back at its CIE and in the CIE
/// sentinel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// `.eh_frame`: CIE pointer is a relative back-reference, sentinel 0.
    EhFrame,

    /// `.debug_frame`: CIE pointer is a section offset, sentinel ~0.
    DebugFrame,
}

/// One augmentation code of a CIE, in string order.
///
/// The order of codes matters: per-FDE augmentation data is laid out in
/// exactly this sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Augmentation {
    /// `z`: augmentation data is length-prefixed.
    SizedData,

    /// `L`: FDEs carry a language-specific data area pointer.
    Lsda,

    /// `P`: the CIE carries a personality routine pointer.
    Personality,

    /// `R`: the CIE chose an FDE pointer encoding.
    FdeEncoding,

    /// `S`: FDEs of this CIE describe signal frames.
    SignalFrame,
}

/// Common Information Entry: unwind parameters shared by a set of FDEs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CieRecord {
    /// Section offset of the record.
    pub offset: usize,

    /// CIE version (1, 3 or 4).
    pub version: u8,

    /// Augmentation codes, in string order.
    pub augmentation: Vec<Augmentation>,

    /// Code alignment factor for advance-location instructions.
    pub code_align: u64,

    /// Data alignment factor for offset instructions.
    pub data_align: i64,

    /// Column holding the return address.
    pub return_address_register: u16,

    /// Pointer encoding FDEs of this CIE use for their address range.
    pub fde_encoding: u8,

    /// Pointer encoding of the per-FDE LSDA field, when `L` is present.
    pub lsda_encoding: Option<u8>,

    /// Personality routine address, when `P` is present.
    pub personality: Option<u64>,

    /// Whether FDEs of this CIE describe signal frames.
    pub signal_frame: bool,

    /// Address size of the described program.
    pub address_size: u8,

    /// Section range of the initial instruction stream.
    pub initial_instructions: Range<usize>,
}

impl CieRecord {
    fn has_sized_augmentation(&self) -> bool {
        self.augmentation.first() == Some(&Augmentation::SizedData)
    }
}

/// Frame Description Entry: the unwind program of one address range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdeRecord {
    /// Section offset of the record.
    pub offset: usize,

    /// Section offset of the owning CIE.
    pub cie_offset: usize,

    /// First address the record covers.
    pub start: u64,

    /// One past the last address the record covers.
    pub end: u64,

    /// Language-specific data area address, when the CIE carries `L`.
    pub lsda: Option<u64>,

    /// Section range of the instruction stream.
    pub instructions: Range<usize>,
}

/// One call-frame section with its decoded-record cache.
pub struct CfiCache {
    kind: SectionKind,
    data: Vec<u8>,
    vaddr: u64,
    address_size: u8,
    little_endian: bool,

    cies: BTreeMap<usize, CieRecord>,
    fdes: BTreeMap<usize, FdeRecord>,
    index: RangeMap<u64, usize>,
    scan_pos: usize,
    table: Option<SearchTable>,
}

impl CfiCache {
    /// Creates a cache over the given section bytes.
    ///
    /// `vaddr` is the address the section is mapped at in the described
    /// address space, used to resolve self-relative pointers.
    pub fn new(
        kind: SectionKind,
        data: Vec<u8>,
        vaddr: u64,
        address_size: u8,
        little_endian: bool,
    ) -> Self {
        Self {
            kind,
            data,
            vaddr,
            address_size,
            little_endian,
            cies: BTreeMap::new(),
            fdes: BTreeMap::new(),
            index: RangeMap::new(),
            scan_pos: 0,
            table: None,
        }
    }

    /// Attaches an `.eh_frame_hdr` binary-search table to the cache.
    pub fn with_search_table(mut self, hdr: &[u8], hdr_vaddr: u64) -> Result<Self> {
        self.table = Some(SearchTable::parse(
            hdr,
            hdr_vaddr,
            self.address_size,
            self.little_endian,
        )?);

        Ok(self)
    }

    /// Section bytes the cache decodes from.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Address the section is mapped at.
    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }

    /// Decodes (or returns the interned) CIE at the given section offset.
    pub fn cie_at(&mut self, offset: usize) -> Result<&CieRecord> {
        self.ensure_cie(offset)?;

        self.cies.get(&offset).ok_or(Error::BadRecord {
            offset,
            reason: "not a CIE",
        })
    }

    /// Finds the frame description covering the given address.
    ///
    /// Returns interned copies: repeated queries yield the identical
    /// record (by offset) no matter what was looked up in between.
    pub fn find_fde(&mut self, addr: u64) -> Result<Option<(FdeRecord, CieRecord)>> {
        if let Some(offset) = self.index.get(&addr).copied() {
            return self.interned(offset).map(Some);
        }

        if let Some(offset) = self.search_table_lookup(addr)? {
            return Ok(Some(self.interned(offset)?));
        }

        self.linear_scan(addr)
    }

    /// Computes the frame state (CFA rule, register rules) in effect at
    /// the given address.
    pub fn frame_state(&mut self, addr: u64, mode: EvalMode) -> Result<Option<FrameState>> {
        let Some((fde, cie)) = self.find_fde(addr)? else {
            return Ok(None);
        };

        frame::evaluate(
            &self.data,
            self.vaddr,
            self.little_endian,
            &cie,
            &fde,
            addr,
            mode,
        )
        .map(Some)
    }

    /// Resolves a frame state's CFA rule to a value.
    pub fn cfa_value(
        &self,
        state: &FrameState,
        ctx: &mut dyn frame::ExprContext,
    ) -> Result<u64> {
        frame::cfa_value(&self.data, self.little_endian, self.address_size, state, ctx)
    }

    /// Resolves the unwound value of one register under a frame state.
    pub fn register_value(
        &self,
        state: &FrameState,
        register: u16,
        cfa: u64,
        ctx: &mut dyn frame::ExprContext,
    ) -> Result<Option<u64>> {
        frame::register_value(
            &self.data,
            self.little_endian,
            self.address_size,
            state,
            register,
            cfa,
            ctx,
        )
    }

    fn interned(&self, fde_offset: usize) -> Result<(FdeRecord, CieRecord)> {
        let fde = self.fdes.get(&fde_offset).ok_or(Error::BadRecord {
            offset: fde_offset,
            reason: "FDE not interned",
        })?;

        let cie = self.cies.get(&fde.cie_offset).ok_or(Error::BadRecord {
            offset: fde.cie_offset,
            reason: "CIE not interned",
        })?;

        Ok((fde.clone(), cie.clone()))
    }

    /// Consults the binary-search table, decoding the FDE it points at.
    fn search_table_lookup(&mut self, addr: u64) -> Result<Option<usize>> {
        let Some(ref table) = self.table else {
            return Ok(None);
        };

        let Some(fde_vaddr) = table.lookup(addr) else {
            return Ok(None);
        };

        let Some(offset) = fde_vaddr
            .checked_sub(self.vaddr)
            .map(|off| off as usize)
            .filter(|off| *off < self.data.len())
        else {
            return Ok(None);
        };

        match self.decode_at(offset)? {
            Some(Decoded::Fde { offset, .. }) => {
                let covers = self
                    .fdes
                    .get(&offset)
                    .is_some_and(|fde| fde.start <= addr && addr < fde.end);

                Ok(covers.then_some(offset))
            }
            _ => Ok(None),
        }
    }

    /// Scans forward from the last undecoded offset, interning every
    /// record seen, until a covering FDE shows up or the section ends.
    fn linear_scan(&mut self, addr: u64) -> Result<Option<(FdeRecord, CieRecord)>> {
        while self.scan_pos < self.data.len() {
            let decoded = match self.decode_at(self.scan_pos) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => {
                    self.scan_pos = self.data.len();
                    break;
                }
                Err(e) => {
                    // A malformed record stops the scan; everything
                    // interned so far stays valid.
                    tracing::warn!(
                        error = %e,
                        offset = format_args!("{:#x}", self.scan_pos),
                        "CFI scan stopped"
                    );

                    self.scan_pos = self.data.len();
                    break;
                }
            };

            self.scan_pos = decoded.next();

            if let Decoded::Fde { offset, .. } = decoded {
                let covers = self
                    .fdes
                    .get(&offset)
                    .is_some_and(|fde| fde.start <= addr && addr < fde.end);

                if covers {
                    return self.interned(offset).map(Some);
                }
            }
        }

        Ok(None)
    }

    /// Decodes and interns the record at `offset`. Returns `None` at a
    /// zero terminator or at the end of the section.
    fn decode_at(&mut self, offset: usize) -> Result<Option<Decoded>> {
        let Some(raw) = read_raw(&self.data, offset, self.kind, self.little_endian)? else {
            return Ok(None);
        };

        match raw.kind {
            RawKind::Cie => {
                if !self.cies.contains_key(&offset) {
                    let cie = parse_cie(
                        &self.data,
                        self.vaddr,
                        self.address_size,
                        self.little_endian,
                        &raw,
                    )?;

                    self.cies.insert(offset, cie);
                }

                Ok(Some(Decoded::Cie {
                    offset,
                    next: raw.next,
                }))
            }
            RawKind::Fde { cie_offset } => {
                if !self.fdes.contains_key(&offset) {
                    self.ensure_cie(cie_offset)?;

                    let cie = self.cies.get(&cie_offset).ok_or(Error::BadRecord {
                        offset,
                        reason: "FDE references a non-CIE record",
                    })?;

                    let fde = parse_fde(
                        &self.data,
                        self.vaddr,
                        self.little_endian,
                        &raw,
                        cie_offset,
                        cie,
                    )?;

                    if fde.start < fde.end {
                        self.index.insert(fde.start..fde.end, offset);
                    }

                    self.fdes.insert(offset, fde);
                }

                Ok(Some(Decoded::Fde {
                    offset,
                    next: raw.next,
                }))
            }
        }
    }

    fn ensure_cie(&mut self, offset: usize) -> Result<()> {
        if self.cies.contains_key(&offset) {
            return Ok(());
        }

        let raw = read_raw(&self.data, offset, self.kind, self.little_endian)?.ok_or(
            Error::BadRecord {
                offset,
                reason: "CIE offset out of range",
            },
        )?;

        if !matches!(raw.kind, RawKind::Cie) {
            return Err(Error::BadRecord {
                offset,
                reason: "not a CIE",
            });
        }

        let cie = parse_cie(
            &self.data,
            self.vaddr,
            self.address_size,
            self.little_endian,
            &raw,
        )?;

        self.cies.insert(offset, cie);

        Ok(())
    }
}

enum Decoded {
    Cie { offset: usize, next: usize },
    Fde { offset: usize, next: usize },
}

impl Decoded {
    fn next(&self) -> usize {
        match self {
            Self::Cie { next, .. } | Self::Fde { next, .. } => *next,
        }
    }
}

struct RawRecord {
    offset: usize,
    /// Record payload, starting after the CIE-pointer field.
    content: Range<usize>,
    next: usize,
    kind: RawKind,
}

enum RawKind {
    Cie,
    Fde { cie_offset: usize },
}

/// Reads a record's length and CIE-pointer field, discriminating CIE from
/// FDE by the section flavor's sentinel.
fn read_raw(
    data: &[u8],
    offset: usize,
    kind: SectionKind,
    little_endian: bool,
) -> Result<Option<RawRecord>> {
    if offset >= data.len() || data.len() - offset < 4 {
        return Ok(None);
    }

    let mut cursor = Cursor::new(data, little_endian);
    cursor.set_pos(offset);

    let len32 = cursor.u32()?;

    if len32 == 0 {
        return Ok(None);
    }

    let (length, dwarf64) = if len32 == u32::MAX {
        (cursor.u64()? as usize, true)
    } else {
        (len32 as usize, false)
    };

    if length > MAX_RECORD_LEN {
        return Err(Error::BadRecord {
            offset,
            reason: "record length exceeds the cap",
        });
    }

    let id_pos = cursor.pos();
    let next = id_pos.checked_add(length).ok_or(Error::BadRecord {
        offset,
        reason: "record length overflows",
    })?;

    if next > data.len() {
        return Err(Error::Truncated(offset));
    }

    let (id, id_size) = if dwarf64 {
        (cursor.u64()?, 8)
    } else {
        (u64::from(cursor.u32()?), 4)
    };

    let is_cie = match kind {
        SectionKind::EhFrame => id == 0,
        SectionKind::DebugFrame => {
            if dwarf64 {
                id == u64::MAX
            } else {
                id == u64::from(u32::MAX)
            }
        }
    };

    let kind = if is_cie {
        RawKind::Cie
    } else {
        let cie_offset = match kind {
            // Self-relative back-reference from the id field.
            SectionKind::EhFrame => (id_pos as u64).checked_sub(id),
            SectionKind::DebugFrame => Some(id),
        }
        .map(|off| off as usize)
        .filter(|off| *off < data.len())
        .ok_or(Error::BadRecord {
            offset,
            reason: "CIE pointer out of range",
        })?;

        RawKind::Fde { cie_offset }
    };

    Ok(Some(RawRecord {
        offset,
        content: id_pos + id_size..next,
        next,
        kind,
    }))
}

fn parse_cie(
    data: &[u8],
    vaddr: u64,
    section_address_size: u8,
    little_endian: bool,
    raw: &RawRecord,
) -> Result<CieRecord> {
    let mut cursor = Cursor::new(&data[..raw.content.end], little_endian);
    cursor.set_pos(raw.content.start);

    let version = cursor.u8()?;

    if !matches!(version, 1 | 3 | 4) {
        return Err(Error::BadRecord {
            offset: raw.offset,
            reason: "unknown CIE version",
        });
    }

    let augmentation_str = cursor.cstr()?.to_vec();

    let mut address_size = section_address_size;

    if version == 4 {
        address_size = cursor.u8()?;

        if cursor.u8()? != 0 {
            return Err(Error::BadRecord {
                offset: raw.offset,
                reason: "segmented CIEs are unsupported",
            });
        }
    }

    // The archaic "eh" augmentation carries one raw pointer before the
    // alignment factors.
    if augmentation_str == b"eh" {
        cursor.skip(address_size as usize)?;
    }

    let code_align = cursor.uleb128()?;
    let data_align = cursor.sleb128()?;

    let return_address_register = if version == 1 {
        u16::from(cursor.u8()?)
    } else {
        u16::try_from(cursor.uleb128()?).map_err(|_| Error::BadRecord {
            offset: raw.offset,
            reason: "return-address register out of range",
        })?
    };

    //
    // Consume the augmentation codes left-to-right; the order is part of
    // the format.
    //

    let mut augmentation = Vec::new();
    let mut fde_encoding = DW_EH_PE_ABSPTR;
    let mut lsda_encoding = None;
    let mut personality = None;
    let mut signal_frame = false;

    let has_z = augmentation_str.first() == Some(&b'z');

    let mut sized_end = None;

    if has_z {
        augmentation.push(Augmentation::SizedData);

        let size = cursor.uleb128()? as usize;

        sized_end = Some(cursor.pos().checked_add(size).ok_or(Error::BadRecord {
            offset: raw.offset,
            reason: "augmentation size overflows",
        })?);
    }

    let codes = if augmentation_str == b"eh" {
        &[][..]
    } else if has_z {
        &augmentation_str[1..]
    } else {
        &augmentation_str[..]
    };

    for code in codes {
        match code {
            b'L' => {
                lsda_encoding = Some(cursor.u8()?);
                augmentation.push(Augmentation::Lsda);
            }
            b'P' => {
                let encoding = cursor.u8()?;
                personality = Some(cursor.read_encoded(
                    encoding,
                    vaddr,
                    &PointerBases::default(),
                    address_size,
                )?);
                augmentation.push(Augmentation::Personality);
            }
            b'R' => {
                fde_encoding = cursor.u8()?;
                augmentation.push(Augmentation::FdeEncoding);
            }
            b'S' => {
                signal_frame = true;
                augmentation.push(Augmentation::SignalFrame);
            }
            _ => {
                // Unknown code: with a sized prefix the rest of the data
                // can be skipped; without one the record layout is
                // ambiguous past this point.
                let Some(end) = sized_end else {
                    return Err(Error::BadRecord {
                        offset: raw.offset,
                        reason: "unsized unknown augmentation",
                    });
                };

                cursor.set_pos(end);
                break;
            }
        }
    }

    if let Some(end) = sized_end {
        if cursor.pos() > end {
            return Err(Error::BadRecord {
                offset: raw.offset,
                reason: "augmentation data overran its size",
            });
        }

        cursor.set_pos(end);
    }

    Ok(CieRecord {
        offset: raw.offset,
        version,
        augmentation,
        code_align,
        data_align,
        return_address_register,
        fde_encoding,
        lsda_encoding,
        personality,
        signal_frame,
        address_size,
        initial_instructions: cursor.pos()..raw.content.end,
    })
}

fn parse_fde(
    data: &[u8],
    vaddr: u64,
    little_endian: bool,
    raw: &RawRecord,
    cie_offset: usize,
    cie: &CieRecord,
) -> Result<FdeRecord> {
    let mut cursor = Cursor::new(&data[..raw.content.end], little_endian);
    cursor.set_pos(raw.content.start);

    let bases = PointerBases::default();

    let start = cursor.read_encoded(cie.fde_encoding, vaddr, &bases, cie.address_size)?;

    // The range length shares the start's size format but is never
    // relative to anything.
    let range = cursor.read_encoded(
        cie.fde_encoding & 0x0f,
        vaddr,
        &bases,
        cie.address_size,
    )?;

    let mut lsda = None;

    if cie.has_sized_augmentation() {
        let size = cursor.uleb128()? as usize;

        let end = cursor.pos().checked_add(size).ok_or(Error::BadRecord {
            offset: raw.offset,
            reason: "FDE augmentation size overflows",
        })?;

        if let Some(encoding) = cie.lsda_encoding {
            if encoding != DW_EH_PE_OMIT && size > 0 {
                lsda = Some(cursor.read_encoded(encoding, vaddr, &bases, cie.address_size)?);
            }
        }

        if cursor.pos() > end {
            return Err(Error::BadRecord {
                offset: raw.offset,
                reason: "FDE augmentation data overran its size",
            });
        }

        cursor.set_pos(end);
    } else if let Some(encoding) = cie.lsda_encoding {
        if encoding != DW_EH_PE_OMIT {
            lsda = Some(cursor.read_encoded(encoding, vaddr, &bases, cie.address_size)?);
        }
    }

    Ok(FdeRecord {
        offset: raw.offset,
        cie_offset,
        start,
        end: start.wrapping_add(range),
        lsda,
        instructions: cursor.pos()..raw.content.end,
    })
}

/// Decoded `.eh_frame_hdr` binary-search table.
struct SearchTable {
    /// `(function start, FDE address)` pairs, sorted by start.
    entries: Vec<(u64, u64)>,
}

impl SearchTable {
    fn parse(hdr: &[u8], hdr_vaddr: u64, address_size: u8, little_endian: bool) -> Result<Self> {
        let mut cursor = Cursor::new(hdr, little_endian);

        if cursor.u8()? != 1 {
            return Err(Error::BadRecord {
                offset: 0,
                reason: "unknown eh_frame_hdr version",
            });
        }

        let eh_frame_ptr_enc = cursor.u8()?;
        let fde_count_enc = cursor.u8()?;
        let table_enc = cursor.u8()?;

        let bases = PointerBases {
            data: Some(hdr_vaddr),
            ..Default::default()
        };

        if eh_frame_ptr_enc != DW_EH_PE_OMIT {
            cursor.read_encoded(eh_frame_ptr_enc, hdr_vaddr, &bases, address_size)?;
        }

        if fde_count_enc == DW_EH_PE_OMIT || table_enc == DW_EH_PE_OMIT {
            return Ok(Self {
                entries: Vec::new(),
            });
        }

        let count = cursor.read_encoded(fde_count_enc, hdr_vaddr, &bases, address_size)?;

        // Each entry is two encoded values; 4 bytes is the smallest
        // non-LEB format, which bounds a sane count.
        if count as usize > cursor.remaining() {
            return Err(Error::BadRecord {
                offset: 0,
                reason: "eh_frame_hdr count exceeds table size",
            });
        }

        let mut entries = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let start = cursor.read_encoded(table_enc, hdr_vaddr, &bases, address_size)?;
            let fde = cursor.read_encoded(table_enc, hdr_vaddr, &bases, address_size)?;

            entries.push((start, fde));
        }

        entries.sort_unstable();

        Ok(Self { entries })
    }

    /// Start-address binary search. The hit still has to be validated
    /// against the FDE's real range.
    fn lookup(&self, addr: u64) -> Option<u64> {
        let idx = self
            .entries
            .partition_point(|(start, _)| *start <= addr)
            .checked_sub(1)?;

        self.entries.get(idx).map(|(_, fde)| *fde)
    }
}

/// The table encoding `.eh_frame_hdr` almost always uses.
pub const EH_FRAME_HDR_TABLE_ENC: u8 = DW_EH_PE_DATAREL | DW_EH_PE_SDATA4;

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::encoding::DW_EH_PE_PCREL;
    use crate::testutil::{CfiBuilder, cie_body, cie_body_zr, fde_body_abs};

    fn cache_over(section: Vec<u8>) -> CfiCache {
        CfiCache::new(SectionKind::EhFrame, section, 0x1000, 8, true)
    }

    #[test]
    fn cie_fields_decode() {
        let mut builder = CfiBuilder::new(SectionKind::EhFrame);
        builder.add_cie(&cie_body_zr(DW_EH_PE_PCREL | DW_EH_PE_SDATA4));

        let mut cache = cache_over(builder.finish());

        let cie = cache.cie_at(0).expect("cie").clone();

        assert_eq!(cie.version, 1);
        assert_eq!(cie.code_align, 1);
        assert_eq!(cie.data_align, -8);
        assert_eq!(cie.return_address_register, 16);
        assert_eq!(
            cie.augmentation,
            vec![Augmentation::SizedData, Augmentation::FdeEncoding]
        );
        assert_eq!(cie.fde_encoding, DW_EH_PE_PCREL | DW_EH_PE_SDATA4);
        assert!(!cie.signal_frame);
    }

    #[test]
    fn cie_decode_is_idempotent() {
        let mut builder = CfiBuilder::new(SectionKind::EhFrame);
        builder.add_cie(&cie_body_zr(DW_EH_PE_PCREL | DW_EH_PE_SDATA4));

        let mut cache = cache_over(builder.finish());

        let first = cache.cie_at(0).expect("cie").clone();
        let second = cache.cie_at(0).expect("cie").clone();

        assert_eq!(first, second);
    }

    #[test]
    fn unknown_augmentation_without_size_is_rejected() {
        // Augmentation "X" and no 'z' prefix: the record length past the
        // unknown code is ambiguous.
        let mut body = vec![1, b'X', 0];
        body.extend_from_slice(&[1, 0x78, 16]);

        let mut builder = CfiBuilder::new(SectionKind::EhFrame);
        builder.add_cie(&body);

        let mut cache = cache_over(builder.finish());

        assert!(matches!(cache.cie_at(0), Err(Error::BadRecord { .. })));
    }

    #[test]
    fn unknown_augmentation_with_size_is_skipped() {
        // Augmentation "zX": the sized prefix makes the unknown tail
        // skippable.
        let mut body = vec![1, b'z', b'X', 0];
        body.extend_from_slice(&[1, 0x78, 16]);
        body.push(2); // augmentation size
        body.extend_from_slice(&[0xde, 0xad]); // unknown data

        let mut builder = CfiBuilder::new(SectionKind::EhFrame);
        builder.add_cie(&body);

        let mut cache = cache_over(builder.finish());

        let cie = cache.cie_at(0).expect("cie");

        assert_eq!(cie.augmentation, vec![Augmentation::SizedData]);
        assert_eq!(cie.fde_encoding, DW_EH_PE_ABSPTR);
    }

    #[test]
    fn signal_frame_flag_decodes() {
        let mut body = vec![1, b'z', b'R', b'S', 0];
        body.extend_from_slice(&[1, 0x78, 16]);
        body.push(1);
        body.push(DW_EH_PE_ABSPTR);

        let mut builder = CfiBuilder::new(SectionKind::EhFrame);
        builder.add_cie(&body);

        let mut cache = cache_over(builder.finish());

        assert!(cache.cie_at(0).expect("cie").signal_frame);
    }

    #[test]
    fn find_fde_scans_and_memoizes() {
        let mut builder = CfiBuilder::new(SectionKind::EhFrame);

        let cie = builder.add_cie(&cie_body(&[]));
        let first = builder.add_fde(cie, &fde_body_abs(0x4000, 0x100, &[]));
        let second = builder.add_fde(cie, &fde_body_abs(0x5000, 0x80, &[]));
        builder.add_terminator();

        let mut cache = cache_over(builder.finish());

        let (fde, cie_rec) = cache.find_fde(0x5010).expect("lookup").expect("match");
        assert_eq!(fde.offset, second);
        assert_eq!(fde.start, 0x5000);
        assert_eq!(fde.end, 0x5080);
        assert_eq!(cie_rec.offset, cie);

        // Unrelated queries in between must not disturb the memo.
        assert!(cache.find_fde(0x9999).expect("lookup").is_none());

        let (again, _) = cache.find_fde(0x5010).expect("lookup").expect("match");
        assert_eq!(again.offset, second);

        let (other, _) = cache.find_fde(0x40ff).expect("lookup").expect("match");
        assert_eq!(other.offset, first);
    }

    #[test]
    fn no_match_is_not_an_error() {
        let mut builder = CfiBuilder::new(SectionKind::EhFrame);

        let cie = builder.add_cie(&cie_body(&[]));
        builder.add_fde(cie, &fde_body_abs(0x4000, 0x100, &[]));
        builder.add_terminator();

        let mut cache = cache_over(builder.finish());

        assert!(cache.find_fde(0x4100).expect("lookup").is_none());
        assert!(cache.find_fde(0x3fff).expect("lookup").is_none());
    }

    #[test]
    fn debug_frame_sentinel_discriminates() {
        let mut builder = CfiBuilder::new(SectionKind::DebugFrame);

        let cie = builder.add_cie(&cie_body(&[]));
        builder.add_fde(cie, &fde_body_abs(0x4000, 0x100, &[]));

        let mut cache = CfiCache::new(
            SectionKind::DebugFrame,
            builder.finish(),
            0x1000,
            8,
            true,
        );

        let (fde, cie_rec) = cache.find_fde(0x4000).expect("lookup").expect("match");
        assert_eq!(fde.cie_offset, cie_rec.offset);
        assert_eq!(fde.start, 0x4000);
    }

    #[test]
    fn pcrel_fde_addresses_resolve() {
        let vaddr = 0x1000u64;

        let mut builder = CfiBuilder::new(SectionKind::EhFrame);
        let cie = builder.add_cie(&cie_body_zr(DW_EH_PE_PCREL | DW_EH_PE_SDATA4));

        // The FDE lands after the CIE; its start field sits 8 bytes past
        // the record offset (4 length + 4 CIE pointer).
        let fde_offset = builder.next_offset();
        let field_vaddr = vaddr + fde_offset as u64 + 8;

        let target = 0x4000u64;
        let mut body = Vec::new();
        body.extend_from_slice(&((target.wrapping_sub(field_vaddr)) as u32).to_le_bytes());
        body.extend_from_slice(&0x100u32.to_le_bytes());
        body.push(0); // augmentation size

        builder.add_fde(cie, &body);

        let mut cache = CfiCache::new(SectionKind::EhFrame, builder.finish(), vaddr, 8, true);

        let (fde, _) = cache.find_fde(0x4080).expect("lookup").expect("match");
        assert_eq!(fde.start, 0x4000);
        assert_eq!(fde.end, 0x4100);
    }

    #[test]
    fn search_table_answers_without_scanning() {
        let vaddr = 0x1000u64;
        let hdr_vaddr = 0x800u64;

        let mut builder = CfiBuilder::new(SectionKind::EhFrame);
        let cie = builder.add_cie(&cie_body(&[]));
        let first = builder.add_fde(cie, &fde_body_abs(0x4000, 0x100, &[]));
        let second = builder.add_fde(cie, &fde_body_abs(0x5000, 0x80, &[]));
        builder.add_terminator();

        //
        // Hand-build an eh_frame_hdr with a sdata4/datarel table.
        //

        let mut hdr = vec![
            1,
            DW_EH_PE_OMIT,
            DW_EH_PE_ABSPTR | 0x03, // fde count: udata4
            EH_FRAME_HDR_TABLE_ENC,
        ];
        hdr.extend_from_slice(&2u32.to_le_bytes());

        for (start, offset) in [(0x4000u64, first), (0x5000, second)] {
            let fde_vaddr = vaddr + offset as u64;
            hdr.extend_from_slice(&((start.wrapping_sub(hdr_vaddr)) as u32).to_le_bytes());
            hdr.extend_from_slice(&((fde_vaddr.wrapping_sub(hdr_vaddr)) as u32).to_le_bytes());
        }

        let mut cache = CfiCache::new(SectionKind::EhFrame, builder.finish(), vaddr, 8, true)
            .with_search_table(&hdr, hdr_vaddr)
            .expect("table");

        let (fde, _) = cache.find_fde(0x5040).expect("lookup").expect("match");
        assert_eq!(fde.offset, second);

        // An address below every table entry finds nothing.
        assert!(cache.find_fde(0x100).expect("lookup").is_none());
    }

    #[test]
    fn oversized_record_stops_the_scan_cleanly() {
        let mut section = Vec::new();
        section.extend_from_slice(&0x7fffffffu32.to_le_bytes());
        section.extend_from_slice(&[0u8; 32]);

        let mut cache = cache_over(section);

        assert!(cache.find_fde(0x4000).expect("lookup").is_none());
    }
}
