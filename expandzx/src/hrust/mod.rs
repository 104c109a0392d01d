//! Decoders for the Hrust family of packers by Dmitry Pyankov.
//!
//! Hrust 1.x stores an `HR` header (optionally preceded by its own depacker), Hrust 2.1 stores an
//! `hr2` header. Both use negative 16-bit displacements for back-references. Hrust 2.x streams
//! also occur without the `hr2` header.


pub mod raw;
pub mod v1;
pub mod v2;


use crate::back_copy::Decoded;
use crate::error::DecompressionError;
use crate::io_util::{BitReader, negative_word_distance};


/// Sums 2-bit groups onto `start` while the group is `%11` and `limit` has not been reached.
pub(crate) fn read_length_prefix<const BACKWARD: bool>(
    stream: &mut BitReader<'_, BACKWARD>,
    start: u32,
    limit: u32,
) -> Result<u32, DecompressionError> {
    let mut len = start;
    loop {
        let bits = stream.get_bits(2)?;
        len += bits;
        if bits != 0b11 || len == limit {
            return Ok(len);
        }
    }
}


fn distance_of(word: u32) -> Result<usize, DecompressionError> {
    negative_word_distance(word)
        .ok_or(DecompressionError::InvalidCommand("non-negative displacement"))
}

/// Copies `length` bytes from the displacement stored as a negative word.
pub(crate) fn copy_from_word(decoded: &mut Decoded, word: u32, length: usize) -> Result<(), DecompressionError> {
    decoded.copy_from_back(distance_of(word)?, length)
}

/// One byte from the displacement, one literal, one byte from the same displacement.
pub(crate) fn copy_broken(decoded: &mut Decoded, word: u32, literal: u8) -> Result<(), DecompressionError> {
    let distance = distance_of(word)?;
    decoded.copy_from_back(distance, 1)?;
    decoded.add_byte(literal);
    decoded.copy_from_back(distance, 1)
}
