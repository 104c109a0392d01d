//! CompressorCode 4.
//!
//! The packed data is a fixed number of chunks, each of which starts with a command byte. The
//! command byte either holds a back-reference or a length and a 5-bit chunk type.


use std::sync::LazyLock;

use from_to_repr::from_to_other;
use tracing::{debug, trace};

use crate::DecodedResult;
use crate::back_copy::Decoded;
use crate::error::DecompressionError;
use crate::io_util::{ByteStream, EofPolicy, word_at};
use crate::pattern::DepackerPattern;


pub const DESCRIPTION: &str = "CompressorCode v4";

const MAX_DECODED_SIZE: usize = 0xC000;
const HEADER_SIZE: usize = 0x1C;
const DEPACKER_BASE_SIZE: usize = 0x14;
const RET_OPCODE: u8 = 0xC9;

static DEPACKER: LazyLock<DepackerPattern> = LazyLock::new(|| {
    DepackerPattern::compile(
        concat!(
            "cd5200",  // call 0x0052
            "3b",      // dec sp
            "3b",      // dec sp
            "e1",      // pop hl
            "011100",  // ld bc,0x0011
            "09",      // add hl,bc
            "11??",    // ld de,nn (depacker address)
            "01??",    // ld bc,nn (rest of depacker)
            "d5",      // push de
            "edb0",    // ldir
            "c9",      // ret
            "fde5",    // push iy
            "11??",    // ld de,nn (unpack target)
            "01??",    // ld bc,nn (chunk count)
            "c5",      // push bc
            "01??",    // ld bc,nn
            "c5",      // push bc
        ),
        HEADER_SIZE,
    ).expect("failed to compile CompressorCode 4 depacker pattern")
});


/// The low five bits of a command byte that is not a back-reference.
#[derive(Clone, Copy, Debug)]
#[from_to_other(base_type = u8, derive_compare = "as_int")]
pub enum ChunkType {
    ShortLiterals = 0x00,
    Literals = 0x01,
    ShortZeros = 0x02,
    Zeros = 0x03,
    ShortOnes = 0x04,
    Ones = 0x05,
    ShortFill = 0x06,
    Fill = 0x07,
    ShortProgression = 0x08,
    Progression = 0x09,
    ShortPairs = 0x0A,
    Pairs = 0x0B,
    ShortTriples = 0x0C,
    Triples = 0x0D,
    ShortBasePairs = 0x0E,
    BasePairs = 0x0F,
    ShortBaseTriples = 0x10,
    BaseTriples = 0x11,
    ShortNibbles = 0x12,
    Nibbles = 0x13,
    ShortNearCopy = 0x14,
    NearCopy = 0x15,
    ShortFarCopy = 0x16,
    FarCopy = 0x17,
    Other(u8),
}


#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct CompressorCode4Header {
    pub rest_depacker_size: u16,
    pub chunks_count: u16,
}
impl CompressorCode4Header {
    pub fn read(data: &[u8]) -> Result<Self, DecompressionError> {
        if data.len() < HEADER_SIZE {
            return Err(DecompressionError::TooShort { needed: HEADER_SIZE, available: data.len() });
        }
        if !DEPACKER.matches(data) {
            return Err(DecompressionError::SignatureMismatch);
        }
        Ok(Self {
            rest_depacker_size: word_at(data, 0x0E),
            chunks_count: word_at(data, 0x1A),
        })
    }

    /// Offset of the first chunk.
    pub fn depacker_size(&self) -> usize {
        DEPACKER_BASE_SIZE + usize::from(self.rest_depacker_size)
    }

    pub fn validate(&self, data: &[u8]) -> Result<(), DecompressionError> {
        let chunks_count = usize::from(self.chunks_count);
        if chunks_count > MAX_DECODED_SIZE {
            return Err(DecompressionError::InvalidHeader("too many chunks"));
        }
        // every chunk takes at least one byte
        let needed = self.depacker_size() + chunks_count;
        if needed > data.len() {
            return Err(DecompressionError::TooShort { needed, available: data.len() });
        }
        if data[self.depacker_size() - 1] != RET_OPCODE {
            return Err(DecompressionError::InvalidHeader("depacker does not end with ret"));
        }
        Ok(())
    }
}


pub fn check(data: &[u8]) -> bool {
    CompressorCode4Header::read(data)
        .and_then(|header| header.validate(data))
        .is_ok()
}


pub fn signature() -> &'static DepackerPattern { &DEPACKER }


pub fn decode(data: &[u8]) -> Option<DecodedResult> {
    crate::report(DESCRIPTION, try_decode(data))
}


pub fn try_decode(data: &[u8]) -> Result<DecodedResult, DecompressionError> {
    let header = CompressorCode4Header::read(data)?;
    header.validate(data)?;
    debug!(
        "CompressorCode 4: depacker size {:#X}, {} chunks",
        header.depacker_size(), header.chunks_count,
    );

    let depacker_size = header.depacker_size();
    let (bytes, processed) = decode_chunks(&data[depacker_size..], header.chunks_count)?;
    if bytes.is_empty() {
        return Err(DecompressionError::NoOutput);
    }
    Ok(DecodedResult {
        bytes,
        consumed: depacker_size + processed,
    })
}


fn decode_chunks(stream_data: &[u8], chunks_count: u16) -> Result<(Vec<u8>, usize), DecompressionError> {
    let mut stream = ByteStream::new_forward(stream_data, EofPolicy::Strict);
    let mut decoded = Decoded::new(MAX_DECODED_SIZE, 2 * usize::from(chunks_count));

    for _ in 0..chunks_count {
        if decoded.is_full() {
            break;
        }
        let command = stream.get_byte()?;
        let count = usize::from(command >> 5);
        if command & 0x18 == 0x18 {
            let offset = 256 * usize::from(command & 0x07) + usize::from(stream.get_byte()?);
            decoded.copy_from_back(offset, count + 3)?;
            continue;
        }

        let len = if command & 0x01 != 0 {
            256 * count + usize::from(stream.get_byte()?)
        } else {
            count + 3
        };
        let chunk_type = ChunkType::from_base_type(command & 0x1F);
        let len = match chunk_type {
            ChunkType::ShortLiterals => len - 2,
            ChunkType::ShortZeros | ChunkType::ShortOnes | ChunkType::ShortPairs | ChunkType::ShortTriples => len - 1,
            ChunkType::ShortProgression | ChunkType::ShortFarCopy => len + 1,
            _ => len,
        };
        if tracing::enabled!(tracing::Level::TRACE) {
            trace!("{:?} chunk, length {}", chunk_type, len);
        }
        match chunk_type {
            ChunkType::ShortLiterals | ChunkType::Literals => {
                decoded.generate(len, || stream.get_byte())?;
            },
            ChunkType::ShortZeros | ChunkType::Zeros => {
                decoded.fill(len, 0x00);
            },
            ChunkType::ShortOnes | ChunkType::Ones => {
                decoded.fill(len, 0xFF);
            },
            ChunkType::ShortFill | ChunkType::Fill => {
                let filler = stream.get_byte()?;
                decoded.fill(len, filler);
            },
            ChunkType::ShortProgression | ChunkType::Progression => {
                let mut value = stream.get_byte()?;
                let delta = stream.get_byte()?;
                decoded.generate(len, || {
                    let current = value;
                    value = value.wrapping_add(delta);
                    Ok(current)
                })?;
            },
            ChunkType::ShortPairs | ChunkType::Pairs => {
                let pair = [stream.get_byte()?, stream.get_byte()?];
                for _ in 0..len {
                    decoded.add_slice(&pair);
                }
            },
            ChunkType::ShortTriples | ChunkType::Triples => {
                let triple = [stream.get_byte()?, stream.get_byte()?, stream.get_byte()?];
                for _ in 0..len {
                    decoded.add_slice(&triple);
                }
            },
            ChunkType::ShortBasePairs | ChunkType::BasePairs => {
                let base = stream.get_byte()?;
                for _ in 0..len {
                    decoded.add_slice(&[base, stream.get_byte()?]);
                }
            },
            ChunkType::ShortBaseTriples | ChunkType::BaseTriples => {
                let base = stream.get_byte()?;
                for _ in 0..len {
                    decoded.add_slice(&[base, stream.get_byte()?, stream.get_byte()?]);
                }
            },
            ChunkType::ShortNibbles | ChunkType::Nibbles => {
                let base = stream.get_byte()?;
                for _ in 0..len {
                    let nibbles = stream.get_byte()?;
                    decoded.add_byte(base.wrapping_add(nibbles >> 4));
                    decoded.add_byte(base.wrapping_add(nibbles & 0x0F));
                }
            },
            ChunkType::ShortNearCopy | ChunkType::NearCopy => {
                let offset = usize::from(stream.get_byte()?);
                decoded.copy_from_back(offset, len)?;
            },
            ChunkType::ShortFarCopy | ChunkType::FarCopy => {
                let hi = usize::from(stream.get_byte()?);
                let lo = usize::from(stream.get_byte()?);
                decoded.copy_from_back(256 * hi + lo, len)?;
            },
            ChunkType::Other(_) => {
                // 0x18 and above are back-references
                return Err(DecompressionError::InvalidCommand("unknown chunk type"));
            },
        }
    }
    Ok((decoded.into_vec(), stream.processed()))
}


#[cfg(test)]
mod tests {
    use super::{ChunkType, CompressorCode4Header, check, decode, decode_chunks, try_decode};
    use crate::error::DecompressionError;
    use crate::pattern::assemble;
    use tracing_test::traced_test;

    const STREAM: [u8; 21] = [
        0x20, b'h', b'i',               // two literals
        0x06, b'-',                     // three times '-'
        0x08, b'1', 0x01,               // four bytes counting up from '1'
        0x18, 0x07,                     // three bytes from seven back
        0x12, 0x40, 0x12, 0x34, 0x56,   // six nibbles above 0x40
        0x0B, 0x02, b'x', b'y',         // the pair "xy" twice
        0x03, 0x02,                     // two zeros
    ];

    fn packed(stream: &[u8], chunks_count: u16) -> Vec<u8> {
        let mut data = assemble("cd5200 3b 3b e1 011100 09 11?? 01?? d5 edb0 c9 fde5 11?? 01?? c5 01?? c5");
        data.resize(0x44, 0x00);
        data[0x0E..0x10].copy_from_slice(&0x0030u16.to_le_bytes());
        data[0x1A..0x1C].copy_from_slice(&chunks_count.to_le_bytes());
        data[0x43] = 0xC9;
        data.extend_from_slice(stream);
        data
    }

    #[test]
    #[traced_test]
    fn test_decode() {
        let mut data = packed(&STREAM, 7);
        data.push(0xAA);
        assert!(check(&data));
        let result = decode(&data).unwrap();
        assert_eq!(result.bytes, b"hi---1234---ABCDEFxyxy\x00\x00");
        assert_eq!(result.consumed, 0x44 + STREAM.len());
    }

    #[test]
    fn test_chunk_types() {
        assert_eq!(ChunkType::from_base_type(0x0B), ChunkType::Pairs);
        assert_eq!(ChunkType::from_base_type(0x18), ChunkType::Other(0x18));

        // 0xFF twice, then a far copy of four bytes from one back
        let (bytes, processed) = decode_chunks(&[0x04, 0x16, 0x00, 0x01], 2).unwrap();
        assert_eq!(bytes, vec![0xFF; 6]);
        assert_eq!(processed, 4);

        // base triples and near copy
        let (bytes, _) = decode_chunks(&[0x11, 0x01, b'a', b'b', b'c', 0x15, 0x02, 0x03], 2).unwrap();
        assert_eq!(bytes, b"abcab");

        // an arithmetic progression wraps around
        let (bytes, _) = decode_chunks(&[0x09, 0x03, 0xFE, 0x01], 1).unwrap();
        assert_eq!(bytes, [0xFE, 0xFF, 0x00]);
    }

    #[test]
    fn test_stream_errors() {
        // the last chunk reads past the end
        let mut data = packed(&STREAM, 8);
        assert!(check(&data));
        assert_eq!(try_decode(&data), Err(DecompressionError::UnexpectedEof));
        data.push(0xAA);
        assert_eq!(try_decode(&data), Err(DecompressionError::UnexpectedEof));

        assert_eq!(
            decode_chunks(&[0x18, 0x01], 1),
            Err(DecompressionError::InvalidBackReference { offset: 1, available: 0 }),
        );
    }

    #[test]
    fn test_header_rejection() {
        let mut data = packed(&STREAM, 7);
        data[0x43] = 0x00;
        assert_eq!(try_decode(&data), Err(DecompressionError::InvalidHeader("depacker does not end with ret")));

        let data = packed(&STREAM, 0xC001);
        assert_eq!(try_decode(&data), Err(DecompressionError::InvalidHeader("too many chunks")));

        let data = packed(&STREAM, 22);
        assert_eq!(
            try_decode(&data),
            Err(DecompressionError::TooShort { needed: 0x44 + 22, available: 0x44 + 21 }),
        );

        let data = packed(&STREAM, 7);
        let header = CompressorCode4Header::read(&data).unwrap();
        assert_eq!(header.depacker_size(), 0x44);
    }

    #[test]
    fn test_output_ceiling() {
        // 30 fills of 2047 bytes; the 25th reaches the ceiling
        let mut stream = Vec::new();
        for _ in 0..30 {
            stream.extend_from_slice(&[0xE7, 0xFF, b'x']);
        }
        let data = packed(&stream, 30);
        let result = decode(&data).unwrap();
        assert_eq!(result.bytes.len(), 0xC000);
        assert!(result.bytes.iter().all(|b| *b == b'x'));
        assert_eq!(result.consumed, 0x44 + 25 * 3);
    }

    #[test]
    fn test_truncations() {
        let data = packed(&STREAM, 7);
        for end in 0..data.len() {
            assert!(decode(&data[..end]).is_none());
        }
    }
}
