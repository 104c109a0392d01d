//! Output buffer primitives shared by all LZ-style decoders.
//!
//! Copies go one byte at a time so that a distance shorter than the length replicates the most
//! recent bytes, the way the Z80 `LDIR` instruction does.


use crate::error::DecompressionError;


/// Appends `length` bytes, each taken from `offset` bytes before the current end.
///
/// Returns `false` without touching the buffer if `offset` is zero or points before its start.
pub fn copy_from_back(offset: usize, buffer: &mut Vec<u8>, length: usize) -> bool {
    if offset == 0 || offset > buffer.len() {
        return false;
    }
    buffer.reserve(length);
    let start = buffer.len() - offset;
    for i in 0..length {
        let b = buffer[start + i];
        buffer.push(b);
    }
    true
}

pub fn fill(buffer: &mut Vec<u8>, length: usize, value: u8) {
    buffer.resize(buffer.len() + length, value);
}

pub fn generate<F: FnMut() -> Result<u8, DecompressionError>>(
    buffer: &mut Vec<u8>,
    length: usize,
    mut producer: F,
) -> Result<(), DecompressionError> {
    buffer.reserve(length);
    for _ in 0..length {
        buffer.push(producer()?);
    }
    Ok(())
}


/// Decoded data with a hard size ceiling.
///
/// Bytes beyond the ceiling are dropped; the decoder notices through [`Decoded::is_full`] and
/// stops.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct Decoded {
    data: Vec<u8>,
    limit: usize,
}
impl Decoded {
    pub fn new(limit: usize, expected_size: usize) -> Self {
        Self {
            data: Vec::with_capacity(expected_size.min(limit)),
            limit,
        }
    }

    pub fn len(&self) -> usize { self.data.len() }
    pub fn is_full(&self) -> bool { self.data.len() >= self.limit }
    pub fn as_slice(&self) -> &[u8] { &self.data }

    fn room(&self, wanted: usize) -> usize {
        wanted.min(self.limit.saturating_sub(self.data.len()))
    }

    pub fn add_byte(&mut self, b: u8) {
        if !self.is_full() {
            self.data.push(b);
        }
    }

    pub fn add_slice(&mut self, bytes: &[u8]) {
        let count = self.room(bytes.len());
        self.data.extend_from_slice(&bytes[..count]);
    }

    pub fn copy_from_back(&mut self, offset: usize, length: usize) -> Result<(), DecompressionError> {
        let length = self.room(length);
        if copy_from_back(offset, &mut self.data, length) {
            Ok(())
        } else {
            Err(DecompressionError::InvalidBackReference {
                offset,
                available: self.data.len(),
            })
        }
    }

    pub fn fill(&mut self, length: usize, value: u8) {
        let length = self.room(length);
        fill(&mut self.data, length, value);
    }

    /// Appends `length` bytes obtained from `producer`.
    ///
    /// The producer is always called `length` times, even if the ceiling is hit.
    pub fn generate<F: FnMut() -> Result<u8, DecompressionError>>(
        &mut self,
        length: usize,
        mut producer: F,
    ) -> Result<(), DecompressionError> {
        let kept = self.room(length);
        generate(&mut self.data, kept, &mut producer)?;
        for _ in kept..length {
            producer()?;
        }
        Ok(())
    }

    pub fn reverse(&mut self) {
        self.data.reverse();
    }

    pub fn into_vec(self) -> Vec<u8> { self.data }
}
