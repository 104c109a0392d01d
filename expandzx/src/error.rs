use std::fmt;


/// Broad category of a decoding failure.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorClass {
    /// The data does not look like the format at all.
    StructuralMismatch,

    /// The data looks like the format but the packed stream is damaged.
    CorruptStream,
}


#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum DecompressionError {
    TooShort { needed: usize, available: usize },
    SignatureMismatch,
    InvalidHeader(&'static str),
    InvalidDataMovement,
    InvalidBackReference { offset: usize, available: usize },
    InvalidCommand(&'static str),
    UnexpectedEof,
    MissingEndMarker,
    SizeMismatch { expected: usize, obtained: usize },
    NoOutput,
}
impl DecompressionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TooShort { .. }
                | Self::SignatureMismatch
                | Self::InvalidHeader(_)
                | Self::InvalidDataMovement
                => ErrorClass::StructuralMismatch,
            Self::InvalidBackReference { .. }
                | Self::InvalidCommand(_)
                | Self::UnexpectedEof
                | Self::MissingEndMarker
                | Self::SizeMismatch { .. }
                | Self::NoOutput
                => ErrorClass::CorruptStream,
        }
    }
}
impl fmt::Display for DecompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { needed, available }
                => write!(f, "data too short: need {} bytes, have {}", needed, available),
            Self::SignatureMismatch
                => write!(f, "signature does not match"),
            Self::InvalidHeader(what)
                => write!(f, "invalid header: {}", what),
            Self::InvalidDataMovement
                => write!(f, "invalid data movement parameters in depacker"),
            Self::InvalidBackReference { offset, available }
                => write!(f, "back-reference to offset {} with only {} bytes decoded", offset, available),
            Self::InvalidCommand(what)
                => write!(f, "invalid command in packed stream: {}", what),
            Self::UnexpectedEof
                => write!(f, "unexpected end of packed stream"),
            Self::MissingEndMarker
                => write!(f, "packed stream ended without finish marker"),
            Self::SizeMismatch { expected, obtained }
                => write!(f, "decoded size mismatch: expected {}, obtained {}", expected, obtained),
            Self::NoOutput
                => write!(f, "nothing was decoded"),
        }
    }
}
impl std::error::Error for DecompressionError {
}


#[cfg(test)]
mod tests {
    use super::{DecompressionError, ErrorClass};

    #[test]
    fn test_classes() {
        assert_eq!(DecompressionError::SignatureMismatch.class(), ErrorClass::StructuralMismatch);
        assert_eq!(DecompressionError::InvalidDataMovement.class(), ErrorClass::StructuralMismatch);
        assert_eq!(
            DecompressionError::InvalidBackReference { offset: 3, available: 1 }.class(),
            ErrorClass::CorruptStream,
        );
        assert_eq!(DecompressionError::UnexpectedEof.class(), ErrorClass::CorruptStream);
    }

    #[test]
    fn test_display() {
        let e = DecompressionError::SizeMismatch { expected: 10, obtained: 7 };
        assert_eq!(e.to_string(), "decoded size mismatch: expected 10, obtained 7");
    }
}
