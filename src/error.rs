use thiserror::Error;

/// Errors surfaced while analyzing one method's bytecode.
///
/// All variants are fatal for the method being analyzed: no partial
/// instruction sequence or flow graph is considered valid. Batch callers
/// should catch at per-method granularity and continue with the rest.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed operand, truncated instruction stream, or a constant-pool
    /// index resolving to an entry of the wrong kind for its usage.
    #[error("decode failed at offset {offset}: {message}")]
    Decode { offset: u32, message: String },

    /// A control-transfer or exception-table offset does not match any
    /// decoded instruction start; the class model and the bytecode disagree.
    #[error("no instruction boundary at offset {offset}")]
    Structural { offset: u32 },

    /// The offset→index translation was queried with an offset that is
    /// neither an instruction start nor one past a valid range boundary.
    /// This is a caller contract violation, not a data error.
    #[error("offset {offset} is not a registered instruction offset")]
    Lookup { offset: u32 },

    /// The surrounding class file could not be parsed into a class model.
    #[error("malformed class file: {message}")]
    ClassFormat { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn decode(offset: u32, message: impl Into<String>) -> Self {
        Error::Decode {
            offset,
            message: message.into(),
        }
    }
}
