/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// File open/read error.
    #[error("{0}: {1}")]
    File(std::path::PathBuf, std::io::Error),

    #[error(transparent)]
    Elf(#[from] goblin::error::Error),

    /// A memory read returned fewer bytes than the minimum needed to proceed.
    #[error("read at {addr:#x} returned {got} bytes, needed {need}")]
    TruncatedRead {
        /// Address the read started at.
        addr: u64,
        /// Minimum byte count the caller required.
        need: usize,
        /// Byte count actually available.
        got: usize,
    },

    /// The address is not covered by any segment of the memory source.
    #[error("address {0:#x} is not mapped")]
    Unmapped(u64),

    /// Malformed ELF header, program header or note data.
    #[error("malformed image: {0}")]
    BadImage(&'static str),

    /// An on-disk file was rejected because its build-id differs from the
    /// one found in memory.
    #[error("build-id mismatch for {0}")]
    BuildIdMismatch(std::path::PathBuf),

    /// The auxiliary vector matched no (or more than one) word size/byte
    /// order combination.
    #[error("auxiliary vector not recognized under any word size/byte order")]
    AuxvFormat,

    #[error("missing PT_LOAD")]
    MissingPtLoad,

    #[error("missing PT_DYNAMIC")]
    MissingPtDynamic,

    #[error("missing DT_DEBUG")]
    MissingDtDebug,

    /// The dynamic linker has not filled in its debug state yet.
    #[error("r_debug is not initialized")]
    RDebugUnset,

    /// A relocation kind this crate does not apply.
    #[error("unsupported relocation type {0:#x}")]
    UnsupportedReloc(u32),

    /// A strict relocation pass could not resolve a symbol.
    #[error("undefined symbol {0}")]
    UndefinedSymbol(String),

    /// Introspection of a non-empty input produced no modules.
    #[error("no modules found: {0}")]
    NoModules(&'static str),

    /// Allocation failure while assembling an image.
    #[error("allocation of {0} bytes failed")]
    OutOfMemory(usize),
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
