//! Hand-assembled CFI sections for tests.

use crate::cfi::SectionKind;

/// Serializes CIE/FDE records the way a linker would lay them out.
pub struct CfiBuilder {
    kind: SectionKind,
    bytes: Vec<u8>,
}

impl CfiBuilder {
    pub fn new(kind: SectionKind) -> Self {
        Self {
            kind,
            bytes: Vec::new(),
        }
    }

    /// Offset the next record will land at.
    pub fn next_offset(&self) -> usize {
        self.bytes.len()
    }

    /// Appends a CIE with the given body; returns its record offset.
    pub fn add_cie(&mut self, body: &[u8]) -> usize {
        let offset = self.bytes.len();

        let id = match self.kind {
            SectionKind::EhFrame => 0u32,
            SectionKind::DebugFrame => u32::MAX,
        };

        self.bytes
            .extend_from_slice(&(4 + body.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(&id.to_le_bytes());
        self.bytes.extend_from_slice(body);

        offset
    }

    /// Appends an FDE owned by the CIE at `cie_offset`; returns its
    /// record offset.
    pub fn add_fde(&mut self, cie_offset: usize, body: &[u8]) -> usize {
        let offset = self.bytes.len();
        let id_pos = offset + 4;

        let id = match self.kind {
            SectionKind::EhFrame => (id_pos - cie_offset) as u32,
            SectionKind::DebugFrame => cie_offset as u32,
        };

        self.bytes
            .extend_from_slice(&(4 + body.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(&id.to_le_bytes());
        self.bytes.extend_from_slice(body);

        offset
    }

    /// Appends the zero terminator `.eh_frame` sections end with.
    pub fn add_terminator(&mut self) {
        self.bytes.extend_from_slice(&0u32.to_le_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// CIE body: version 1, empty augmentation, code align 1, data align -8,
/// return-address register 16, then the given initial instructions.
///
/// Without an `R` code the FDE address encoding defaults to an absolute
/// 8-byte pointer, which keeps fixture records position-independent.
pub fn cie_body(initial_instructions: &[u8]) -> Vec<u8> {
    let mut body = vec![1, 0, 1, 0x78, 16];
    body.extend_from_slice(initial_instructions);
    body
}

/// CIE body with a `zR` augmentation choosing the given FDE encoding.
pub fn cie_body_zr(fde_encoding: u8) -> Vec<u8> {
    vec![1, b'z', b'R', 0, 1, 0x78, 16, 1, fde_encoding]
}

/// FDE body under an absolute-pointer CIE: 8-byte start and range,
/// then the given instructions.
pub fn fde_body_abs(start: u64, range: u64, instructions: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&start.to_le_bytes());
    body.extend_from_slice(&range.to_le_bytes());
    body.extend_from_slice(instructions);
    body
}
