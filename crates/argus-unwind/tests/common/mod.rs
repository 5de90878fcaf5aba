//! Call-frame sections assembled record by record, for walking synthetic
//! stacks.

use argus_unwind::SectionKind;

pub const DW_CFA_DEF_CFA: u8 = 0x0c;
pub const DW_CFA_DEF_CFA_REGISTER: u8 = 0x0d;
pub const DW_CFA_DEF_CFA_OFFSET: u8 = 0x0e;

/// Section under construction; records are appended in layout order.
pub struct SectionBuilder {
    kind: SectionKind,
    bytes: Vec<u8>,
}

impl SectionBuilder {
    pub fn new(kind: SectionKind) -> Self {
        Self {
            kind,
            bytes: Vec::new(),
        }
    }

    /// Appends a version-1 CIE (code align 1, data align -8, return
    /// address in column 16, absolute 8-byte FDE pointers) holding the
    /// given initial instructions. Returns the record offset.
    pub fn cie(&mut self, initial_instructions: &[u8]) -> usize {
        let offset = self.bytes.len();

        let id = match self.kind {
            SectionKind::EhFrame => 0u32,
            SectionKind::DebugFrame => u32::MAX,
        };

        let mut body = vec![1, 0, 1, 0x78, 16];
        body.extend_from_slice(initial_instructions);

        self.record(id, &body);

        offset
    }

    /// Appends an FDE covering `start..start + len` with the given
    /// instructions, owned by the CIE at `cie_offset`.
    pub fn fde(&mut self, cie_offset: usize, start: u64, len: u64, instructions: &[u8]) -> usize {
        let offset = self.bytes.len();

        let id = match self.kind {
            SectionKind::EhFrame => (offset + 4 - cie_offset) as u32,
            SectionKind::DebugFrame => cie_offset as u32,
        };

        let mut body = Vec::new();
        body.extend_from_slice(&start.to_le_bytes());
        body.extend_from_slice(&len.to_le_bytes());
        body.extend_from_slice(instructions);

        self.record(id, &body);

        offset
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.bytes.extend_from_slice(&0u32.to_le_bytes());
        self.bytes
    }

    fn record(&mut self, id: u32, body: &[u8]) {
        self.bytes
            .extend_from_slice(&(4 + body.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(&id.to_le_bytes());
        self.bytes.extend_from_slice(body);
    }
}
