//! Bounds-checked byte-stream cursor, LEB128 readers, and the
//! `DW_EH_PE_*` encoded-pointer scheme used throughout call-frame data.

use byteorder::{BE, ByteOrder, LE};

use crate::{Error, Result};

/// Absolute pointer, `address_size` bytes.
pub const DW_EH_PE_ABSPTR: u8 = 0x00;
/// Unsigned LEB128.
pub const DW_EH_PE_ULEB128: u8 = 0x01;
/// Unsigned 2-byte value.
pub const DW_EH_PE_UDATA2: u8 = 0x02;
/// Unsigned 4-byte value.
pub const DW_EH_PE_UDATA4: u8 = 0x03;
/// Unsigned 8-byte value.
pub const DW_EH_PE_UDATA8: u8 = 0x04;
/// Signed LEB128.
pub const DW_EH_PE_SLEB128: u8 = 0x09;
/// Signed 2-byte value.
pub const DW_EH_PE_SDATA2: u8 = 0x0a;
/// Signed 4-byte value.
pub const DW_EH_PE_SDATA4: u8 = 0x0b;
/// Signed 8-byte value.
pub const DW_EH_PE_SDATA8: u8 = 0x0c;
/// Relative to the address of the encoded value itself.
pub const DW_EH_PE_PCREL: u8 = 0x10;
/// Relative to the text section.
pub const DW_EH_PE_TEXTREL: u8 = 0x20;
/// Relative to the containing section's data base.
pub const DW_EH_PE_DATAREL: u8 = 0x30;
/// Relative to the FDE's function start.
pub const DW_EH_PE_FUNCREL: u8 = 0x40;
/// Aligned absolute pointer.
pub const DW_EH_PE_ALIGNED: u8 = 0x50;
/// The encoded value is the address of the real value.
pub const DW_EH_PE_INDIRECT: u8 = 0x80;
/// No value present.
pub const DW_EH_PE_OMIT: u8 = 0xff;

/// Base addresses an encoded pointer may be relative to.
#[derive(Debug, Clone, Copy, Default)]
pub struct PointerBases {
    /// `DW_EH_PE_DATAREL` base (e.g. the `.eh_frame_hdr` address).
    pub data: Option<u64>,

    /// `DW_EH_PE_TEXTREL` base.
    pub text: Option<u64>,

    /// `DW_EH_PE_FUNCREL` base.
    pub func: Option<u64>,
}

/// Bounds-checked cursor over one CFI section's bytes.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    little_endian: bool,
}

impl<'a> Cursor<'a> {
    /// Creates a cursor at the start of `data`.
    pub fn new(data: &'a [u8], little_endian: bool) -> Self {
        Self {
            data,
            pos: 0,
            little_endian,
        }
    }

    /// Current offset into the underlying data.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Moves the cursor to an absolute offset.
    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Bytes left before the end of the data.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let slice = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or(Error::Truncated(self.pos))?;

        self.pos += len;

        Ok(slice)
    }

    /// Skips `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    /// Reads one byte.
    pub fn u8(&mut self) -> Result<u8> {
        self.take(1).map(|s| s[0])
    }

    /// Reads a 2-byte value.
    pub fn u16(&mut self) -> Result<u16> {
        self.take(2).map(|s| {
            if self.little_endian {
                LE::read_u16(s)
            } else {
                BE::read_u16(s)
            }
        })
    }

    /// Reads a 4-byte value.
    pub fn u32(&mut self) -> Result<u32> {
        self.take(4).map(|s| {
            if self.little_endian {
                LE::read_u32(s)
            } else {
                BE::read_u32(s)
            }
        })
    }

    /// Reads an 8-byte value.
    pub fn u64(&mut self) -> Result<u64> {
        self.take(8).map(|s| {
            if self.little_endian {
                LE::read_u64(s)
            } else {
                BE::read_u64(s)
            }
        })
    }

    /// Reads an unsigned LEB128 value.
    pub fn uleb128(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;

        loop {
            let byte = self.u8()?;

            if shift >= 64 {
                return Err(Error::BadProgram("LEB128 value too large"));
            }

            value |= u64::from(byte & 0x7f) << shift;

            if byte & 0x80 == 0 {
                return Ok(value);
            }

            shift += 7;
        }
    }

    /// Reads a signed LEB128 value.
    pub fn sleb128(&mut self) -> Result<i64> {
        let mut value = 0i64;
        let mut shift = 0u32;

        loop {
            let byte = self.u8()?;

            if shift >= 64 {
                return Err(Error::BadProgram("LEB128 value too large"));
            }

            value |= i64::from(byte & 0x7f) << shift;
            shift += 7;

            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    value |= -1i64 << shift;
                }

                return Ok(value);
            }
        }
    }

    /// Reads a NUL-terminated byte string.
    pub fn cstr(&mut self) -> Result<&'a [u8]> {
        let rest = self
            .data
            .get(self.pos..)
            .ok_or(Error::Truncated(self.pos))?;

        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(Error::Truncated(self.pos))?;

        let s = &rest[..nul];
        self.pos += nul + 1;

        Ok(s)
    }

    /// Reads one pointer under the given `DW_EH_PE_*` encoding.
    ///
    /// `section_vaddr` locates the cursor's data in the address space and
    /// anchors `DW_EH_PE_PCREL` values. Indirect encodings would need a
    /// memory read and are reported as unsupported.
    pub fn read_encoded(
        &mut self,
        encoding: u8,
        section_vaddr: u64,
        bases: &PointerBases,
        address_size: u8,
    ) -> Result<u64> {
        if encoding == DW_EH_PE_OMIT {
            return Err(Error::UnsupportedEncoding(encoding));
        }

        if encoding & DW_EH_PE_INDIRECT != 0 {
            return Err(Error::UnsupportedEncoding(encoding));
        }

        let application = encoding & 0x70;

        if application == DW_EH_PE_ALIGNED {
            let align = address_size as usize;
            self.pos = self.pos.next_multiple_of(align);

            let value = self.read_sized(DW_EH_PE_ABSPTR, address_size)?;
            return Ok(value);
        }

        let value_vaddr = section_vaddr.wrapping_add(self.pos as u64);
        let value = self.read_sized(encoding & 0x0f, address_size)?;

        let base = match application {
            0 => 0,
            DW_EH_PE_PCREL => value_vaddr,
            DW_EH_PE_DATAREL => bases
                .data
                .ok_or(Error::UnsupportedEncoding(encoding))?,
            DW_EH_PE_TEXTREL => bases
                .text
                .ok_or(Error::UnsupportedEncoding(encoding))?,
            DW_EH_PE_FUNCREL => bases
                .func
                .ok_or(Error::UnsupportedEncoding(encoding))?,
            _ => return Err(Error::UnsupportedEncoding(encoding)),
        };

        Ok(base.wrapping_add(value))
    }

    /// Reads a value in one of the size formats, sign-extended to 64 bits
    /// for the signed formats.
    fn read_sized(&mut self, format: u8, address_size: u8) -> Result<u64> {
        match format {
            DW_EH_PE_ABSPTR => {
                if address_size == 8 {
                    self.u64()
                } else {
                    self.u32().map(u64::from)
                }
            }
            DW_EH_PE_ULEB128 => self.uleb128(),
            DW_EH_PE_UDATA2 => self.u16().map(u64::from),
            DW_EH_PE_UDATA4 => self.u32().map(u64::from),
            DW_EH_PE_UDATA8 => self.u64(),
            DW_EH_PE_SLEB128 => self.sleb128().map(|v| v as u64),
            DW_EH_PE_SDATA2 => self.u16().map(|v| v as i16 as i64 as u64),
            DW_EH_PE_SDATA4 => self.u32().map(|v| v as i32 as i64 as u64),
            DW_EH_PE_SDATA8 => self.u64(),
            format => Err(Error::UnsupportedEncoding(format)),
        }
    }
}
