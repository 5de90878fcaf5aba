/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The section ended before a record or field was complete.
    #[error("truncated CFI data at offset {0:#x}")]
    Truncated(usize),

    /// A record violated the CIE/FDE format; the record is abandoned,
    /// sibling records are unaffected.
    #[error("malformed CFI record at {offset:#x}: {reason}")]
    BadRecord {
        /// Section offset of the offending record.
        offset: usize,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// A CFI instruction stream violated its own invariants.
    #[error("malformed CFI program: {0}")]
    BadProgram(&'static str),

    /// A call-frame instruction this crate does not implement.
    #[error("unsupported CFI opcode {0:#x}")]
    UnsupportedOpcode(u8),

    /// A pointer encoding this crate does not implement.
    #[error("unsupported pointer encoding {0:#x}")]
    UnsupportedEncoding(u8),

    /// A DWARF expression opcode outside the unwinding subset.
    #[error("unsupported DWARF expression opcode {0:#x}")]
    UnsupportedExpression(u8),

    /// An expression needed a register or memory value the evaluation
    /// context could not provide.
    #[error("expression operand unavailable")]
    ExpressionOperand,
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
