use display_bytes::DisplayBytes;

use crate::error::DecompressionError;


/// What a stream does when asked for a byte after its range is exhausted.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) enum EofPolicy {
    /// Returns zero and remembers that the range was overrun.
    Saturating,

    /// Fails with [`DecompressionError::UnexpectedEof`].
    Strict,
}


/// How a [`BitReader`] refills its shift register.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) enum BitFeed {
    /// One byte, fetched when a bit is requested and the register is empty.
    LazyByte,

    /// One little-endian word, fetched on construction and as soon as its last bit is taken.
    EagerWord,

    /// One little-endian word, fetched when a bit is requested and the register is empty.
    LazyWord,
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct ByteStream<'a, const BACKWARD: bool> {
    data: &'a [u8],
    processed: usize,
    policy: EofPolicy,
    overrun: bool,
}
impl<'a, const BACKWARD: bool> ByteStream<'a, BACKWARD> {
    pub fn new(data: &'a [u8], policy: EofPolicy) -> Self {
        Self {
            data,
            processed: 0,
            policy,
            overrun: false,
        }
    }

    pub fn get_byte(&mut self) -> Result<u8, DecompressionError> {
        if self.processed < self.data.len() {
            let index = if BACKWARD {
                self.data.len() - 1 - self.processed
            } else {
                self.processed
            };
            self.processed += 1;
            Ok(self.data[index])
        } else {
            match self.policy {
                EofPolicy::Saturating => {
                    self.overrun = true;
                    Ok(0)
                },
                EofPolicy::Strict => Err(DecompressionError::UnexpectedEof),
            }
        }
    }

    pub fn get_le_word(&mut self) -> Result<u16, DecompressionError> {
        let lo = self.get_byte()?;
        let hi = self.get_byte()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    /// All bytes of the range have been consumed.
    pub fn eof(&self) -> bool { self.processed >= self.data.len() }

    /// A read past the end of the range was attempted.
    pub fn overrun(&self) -> bool { self.overrun }

    pub fn processed(&self) -> usize { self.processed }

    /// The bytes that have not been consumed yet, in stream order.
    pub fn remaining(&self) -> impl Iterator<Item = u8> + '_ {
        let rest = self.data.len() - self.processed.min(self.data.len());
        (0..rest).map(move |i| {
            if BACKWARD {
                self.data[rest - 1 - i]
            } else {
                self.data[self.processed + i]
            }
        })
    }
}
impl<'a> ByteStream<'a, false> {
    pub fn new_forward(data: &'a [u8], policy: EofPolicy) -> Self {
        Self::new(data, policy)
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct BitReader<'a, const BACKWARD: bool> {
    stream: ByteStream<'a, BACKWARD>,
    feed: BitFeed,
    bits: u16,
    mask: u16,
}
impl<'a, const BACKWARD: bool> BitReader<'a, BACKWARD> {
    pub fn new(data: &'a [u8], policy: EofPolicy, feed: BitFeed) -> Result<Self, DecompressionError> {
        let mut stream = ByteStream::new(data, policy);
        let (bits, mask) = match feed {
            BitFeed::LazyByte | BitFeed::LazyWord => (0, 0),
            BitFeed::EagerWord => (stream.get_le_word()?, 0x8000),
        };
        Ok(Self {
            stream,
            feed,
            bits,
            mask,
        })
    }

    pub fn get_bit(&mut self) -> Result<u8, DecompressionError> {
        if self.mask == 0 {
            // only reachable with lazy feeding
            (self.bits, self.mask) = match self.feed {
                BitFeed::LazyWord => (self.stream.get_le_word()?, 0x8000),
                _ => (self.stream.get_byte()?.into(), 0x80),
            };
        }
        let bit = if self.bits & self.mask != 0 { 1 } else { 0 };
        self.mask >>= 1;
        if self.mask == 0 && self.feed == BitFeed::EagerWord {
            self.bits = self.stream.get_le_word()?;
            self.mask = 0x8000;
        }
        Ok(bit)
    }

    /// Reads `count` bits, most significant first.
    pub fn get_bits(&mut self, count: u32) -> Result<u32, DecompressionError> {
        let mut ret = 0;
        for _ in 0..count {
            ret = (ret << 1) | u32::from(self.get_bit()?);
        }
        Ok(ret)
    }

    /// Reads a whole byte from the underlying stream, bypassing the bit register.
    pub fn get_byte(&mut self) -> Result<u8, DecompressionError> {
        self.stream.get_byte()
    }

    pub fn get_le_word(&mut self) -> Result<u16, DecompressionError> {
        self.stream.get_le_word()
    }

    pub fn eof(&self) -> bool { self.stream.eof() }
    pub fn overrun(&self) -> bool { self.stream.overrun() }
    pub fn processed(&self) -> usize { self.stream.processed() }
}


pub(crate) trait ByteBufReadable {
    fn read(buf: &[u8], pos: &mut usize) -> Self;
}
impl ByteBufReadable for u8 {
    fn read(buf: &[u8], pos: &mut usize) -> Self {
        let ret = buf[*pos];
        *pos += 1;
        ret
    }
}
impl<const N: usize> ByteBufReadable for [u8; N] {
    fn read(buf: &[u8], pos: &mut usize) -> Self {
        let start = *pos;
        *pos += N;
        std::array::from_fn(|i| buf[start + i])
    }
}
impl<const N: usize> ByteBufReadable for DisplayBytes<N> {
    fn read(buf: &[u8], pos: &mut usize) -> Self {
        let ret: [u8; N] = ByteBufReadable::read(buf, pos);
        ret.into()
    }
}


pub(crate) trait ReadEndian {
    fn read_le(buf: &[u8], pos: &mut usize) -> Self;
}
impl ReadEndian for u16 {
    fn read_le(buf: &[u8], pos: &mut usize) -> Self {
        let val = u16::from_le_bytes([buf[*pos], buf[*pos + 1]]);
        *pos += 2;
        val
    }
}


/// Reads a little-endian word at a fixed offset of a depacker image.
pub(crate) fn word_at(buf: &[u8], offset: usize) -> u16 {
    let mut pos = offset;
    ReadEndian::read_le(buf, &mut pos)
}


/// Converts a negative 16-bit displacement, as stored by Z80 depackers, into a back-reference
/// distance.
///
/// Returns `None` for non-negative words; these never occur in valid streams.
pub(crate) fn negative_word_distance(word: u32) -> Option<usize> {
    let word = word & 0xFFFF;
    if word >= 0x8000 {
        Some(0x10000 - word as usize)
    } else {
        None
    }
}
