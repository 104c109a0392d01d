//! Depacker code signatures.
//!
//! A pattern is written as hex byte pairs with `?` standing for any single byte, e.g.
//! `"21?? 11?? 01?? edb0"` for `LD HL,nn; LD DE,nn; LD BC,nn; LDIR`. Whitespace is ignored.


use std::fmt;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PatternError {
    InvalidCharacter { position: usize, character: char },
    DanglingNibble { position: usize },
    Empty,
}
impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCharacter { position, character }
                => write!(f, "invalid character {:?} at position {}", character, position),
            Self::DanglingNibble { position }
                => write!(f, "hex digit at position {} is not part of a byte", position),
            Self::Empty
                => write!(f, "pattern is empty"),
        }
    }
}
impl std::error::Error for PatternError {
}


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DepackerPattern {
    bytes: Vec<Option<u8>>,
    min_size: usize,
}
impl DepackerPattern {
    /// Compiles `text`; data shorter than `min_size` never matches.
    pub fn compile(text: &str, min_size: usize) -> Result<Self, PatternError> {
        let mut bytes = Vec::new();
        let mut pending_nibble: Option<(usize, u8)> = None;
        for (position, character) in text.char_indices() {
            if character.is_ascii_whitespace() {
                continue;
            }
            if character == '?' {
                if let Some((nibble_pos, _)) = pending_nibble {
                    return Err(PatternError::DanglingNibble { position: nibble_pos });
                }
                bytes.push(None);
                continue;
            }
            let Some(value) = character.to_digit(16) else {
                return Err(PatternError::InvalidCharacter { position, character });
            };
            let value = value as u8;
            match pending_nibble.take() {
                Some((_, high)) => bytes.push(Some((high << 4) | value)),
                None => pending_nibble = Some((position, value)),
            }
        }
        if let Some((position, _)) = pending_nibble {
            return Err(PatternError::DanglingNibble { position });
        }
        if bytes.is_empty() {
            return Err(PatternError::Empty);
        }
        let min_size = min_size.max(bytes.len());
        Ok(Self {
            bytes,
            min_size,
        })
    }

    /// Number of bytes the pattern itself covers.
    pub fn len(&self) -> usize { self.bytes.len() }

    pub fn min_size(&self) -> usize { self.min_size }

    fn matches_bytes(&self, window: &[u8]) -> bool {
        self.bytes.iter()
            .zip(window)
            .all(|(expected, actual)| expected.map(|e| e == *actual).unwrap_or(true))
    }

    /// Whether `data` starts with the depacker and is long enough to hold its header.
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() >= self.min_size && self.matches_bytes(data)
    }

    /// Offset of the first position at which [`DepackerPattern::matches`] would succeed.
    pub fn find(&self, data: &[u8]) -> Option<usize> {
        if data.len() < self.min_size {
            return None;
        }
        (0..=data.len() - self.min_size)
            .find(|&offset| self.matches_bytes(&data[offset..]))
    }
}


#[cfg(test)]
impl DepackerPattern {
    /// Overwrites the fixed bytes of the pattern at the start of `data`.
    pub(crate) fn imprint(&self, data: &mut [u8]) {
        for (target, expected) in data.iter_mut().zip(&self.bytes) {
            if let Some(b) = expected {
                *target = *b;
            }
        }
    }
}


/// Builds a byte image matching `text`, with zeros in place of wildcards.
#[cfg(test)]
pub(crate) fn assemble(text: &str) -> Vec<u8> {
    DepackerPattern::compile(text, 0)
        .expect("failed to compile pattern")
        .bytes
        .iter()
        .map(|b| b.unwrap_or(0x00))
        .collect()
}
