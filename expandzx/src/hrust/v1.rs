//! Hrust 1.x.
//!
//! The packed block starts with a 12-byte header followed by an interleaved bit/byte stream. Bits
//! come from little-endian words, bytes are taken from between them in stream order.
//!
//! Self-extracting files carry one of two known depackers before the header.


use std::sync::LazyLock;

use display_bytes::DisplayBytes;
use tracing::{debug, trace};

use crate::DecodedResult;
use crate::back_copy::Decoded;
use crate::error::DecompressionError;
use crate::hrust::{copy_broken, copy_from_word, read_length_prefix};
use crate::io_util::{BitFeed, BitReader, ByteBufReadable, EofPolicy, ReadEndian};
use crate::pattern::DepackerPattern;


pub const DESCRIPTION: &str = "Hrust v1.x";

const MAX_DECODED_SIZE: usize = 0x10000;
const BITSTREAM_OFFSET: usize = 12;

// indexed by the current width of long displacements
const LONG_DISPLACEMENT_MASKS: [u32; 9] = [0, 0, 0xFC, 0xF8, 0xF0, 0xE0, 0xC0, 0x80, 0];
const INITIAL_REFERENCE_BITS: usize = 2;

static SIGNATURE: LazyLock<DepackerPattern> = LazyLock::new(|| {
    DepackerPattern::compile("4852", Hrust1Header::SIZE)
        .expect("failed to compile Hrust 1 signature")
});

static DEPACKERS: LazyLock<[(DepackerPattern, usize); 2]> = LazyLock::new(|| {
    let interrupt_safe = DepackerPattern::compile(
        "f3 ed73?? 11?? 21?? 01?? d5 edb0 13 13 d5 dde1 0e? 09 edb0 21?? 11?? 01?? c9",
        0x103 + Hrust1Header::SIZE,
    ).expect("failed to compile Hrust 1 depacker pattern");
    let stack_based = DepackerPattern::compile(
        concat!(
            "dd21?? dd39 d5 f9 c1 eb c1 0b 09 eb c1 0b 09 ed52 19 38? 54 5d edb8 eb",
            "dd560b dd5e0a f9 e1 e1 e1 06? 3b f1 dd7706 dd23 10?",
        ),
        0x100 + Hrust1Header::SIZE,
    ).expect("failed to compile Hrust 1 depacker pattern");
    [(interrupt_safe, 0x103), (stack_based, 0x100)]
});


#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Hrust1Header {
    pub data_size: u16,
    pub packed_size: u16,
    pub last_bytes: DisplayBytes<6>,
}
impl Hrust1Header {
    pub const SIZE: usize = 15;

    pub fn read(data: &[u8]) -> Result<Self, DecompressionError> {
        if data.len() < Self::SIZE {
            return Err(DecompressionError::TooShort { needed: Self::SIZE, available: data.len() });
        }
        if !SIGNATURE.matches(data) {
            return Err(DecompressionError::SignatureMismatch);
        }
        let mut pos = 2;
        let data_size = ReadEndian::read_le(data, &mut pos);
        let packed_size = ReadEndian::read_le(data, &mut pos);
        let last_bytes = ByteBufReadable::read(data, &mut pos);
        Ok(Self {
            data_size,
            packed_size,
            last_bytes,
        })
    }

    pub fn validate(&self, available: usize) -> Result<(), DecompressionError> {
        let packed_size = usize::from(self.packed_size);
        if packed_size < Self::SIZE {
            return Err(DecompressionError::InvalidHeader("packed size smaller than header"));
        }
        if self.packed_size > self.data_size {
            return Err(DecompressionError::InvalidHeader("packed size exceeds unpacked size"));
        }
        if packed_size > available {
            return Err(DecompressionError::TooShort { needed: packed_size, available });
        }
        Ok(())
    }
}


/// Locates the header, skipping a known depacker if present.
fn header_offset(data: &[u8]) -> Result<usize, DecompressionError> {
    if SIGNATURE.matches(data) {
        return Ok(0);
    }
    DEPACKERS.iter()
        .find(|(pattern, _)| pattern.matches(data))
        .map(|(_, offset)| *offset)
        .ok_or(DecompressionError::SignatureMismatch)
}


pub fn signature() -> &'static DepackerPattern { &SIGNATURE }


pub fn check(data: &[u8]) -> bool {
    let Ok(offset) = header_offset(data) else { return false };
    let block = &data[offset..];
    Hrust1Header::read(block)
        .and_then(|header| header.validate(block.len()))
        .is_ok()
}


pub fn decode(data: &[u8]) -> Option<DecodedResult> {
    crate::report(DESCRIPTION, try_decode(data))
}


pub fn try_decode(data: &[u8]) -> Result<DecodedResult, DecompressionError> {
    let offset = header_offset(data)?;
    let block = &data[offset..];
    let header = Hrust1Header::read(block)?;
    header.validate(block.len())?;
    debug!(
        "Hrust 1 header at {:#X}: data size {:#X}, packed size {:#X}, last bytes {}",
        offset, header.data_size, header.packed_size, header.last_bytes,
    );

    let packed_size = usize::from(header.packed_size);
    let bytes = decode_stream(&block[BITSTREAM_OFFSET..packed_size], &header)?;
    Ok(DecodedResult {
        bytes,
        consumed: offset + packed_size,
    })
}


fn decode_stream(stream_data: &[u8], header: &Hrust1Header) -> Result<Vec<u8>, DecompressionError> {
    let expected = usize::from(header.data_size);
    let mut stream: BitReader<false> = BitReader::new(stream_data, EofPolicy::Saturating, BitFeed::EagerWord)?;
    let mut decoded = Decoded::new(MAX_DECODED_SIZE, expected);

    decoded.add_byte(stream.get_byte()?);
    let mut reference_bits = INITIAL_REFERENCE_BITS;
    while !stream.eof() {
        while stream.get_bit()? == 1 {
            decoded.add_byte(stream.get_byte()?);
        }

        let mut len = read_length_prefix(&mut stream, 0, 0xF)?;
        match len {
            0 => {
                let word = 0xFFF8 + stream.get_bits(3)?;
                copy_from_word(&mut decoded, word, 1)?;
                continue;
            },
            1 => {
                let word = match stream.get_bits(2)? {
                    0b10 => {
                        let byte = u32::from(stream.get_byte()?);
                        if byte >= 0xE0 {
                            let code = (((byte << 1) + 1) ^ 2) & 0xFF;
                            if code == 0xFF {
                                reference_bits += 1;
                                if reference_bits >= LONG_DISPLACEMENT_MASKS.len() {
                                    return Err(DecompressionError::InvalidCommand("displacement wider than 16 bits"));
                                }
                                trace!("long displacements now use {} bits", reference_bits);
                            } else {
                                let literal = stream.get_byte()?;
                                copy_broken(&mut decoded, 0xFF00 + code - 0x0F, literal)?;
                            }
                            continue;
                        }
                        0xFF00 + byte
                    },
                    0b00 => 0xFD00 + u32::from(stream.get_byte()?),
                    0b01 => 0xFE00 + u32::from(stream.get_byte()?),
                    _ => 0xFFE0 + stream.get_bits(5)?,
                };
                copy_from_word(&mut decoded, word, 2)?;
                continue;
            },
            3 => {
                if stream.get_bit()? == 1 {
                    let word = 0xFFF0 + stream.get_bits(4)?;
                    let literal = stream.get_byte()?;
                    copy_broken(&mut decoded, word, literal)?;
                    continue;
                }
                if stream.get_bit()? == 1 {
                    let count = 2 * (6 + stream.get_bits(4)?);
                    trace!("{} literal bytes", count);
                    decoded.generate(count as usize, || stream.get_byte())?;
                    continue;
                }
                len = stream.get_bits(7)?;
                if len == 0x0F {
                    trace!("end marker");
                    break;
                }
                if len < 0x0F {
                    len = 256 * len + u32::from(stream.get_byte()?);
                }
            },
            _ => {},
        }
        if len == 2 {
            len = 3;
        }

        let word = match stream.get_bits(2)? {
            0b01 => {
                let byte = u32::from(stream.get_byte()?);
                if byte >= 0xE0 {
                    if len > 3 {
                        return Err(DecompressionError::InvalidCommand("broken copy with long length"));
                    }
                    let code = (((byte << 1) + 1) ^ 3) & 0xFF;
                    let literal = stream.get_byte()?;
                    copy_broken(&mut decoded, 0xFF00 + code - 0x0F, literal)?;
                    continue;
                }
                0xFF00 + byte
            },
            0b00 => 0xFE00 + u32::from(stream.get_byte()?),
            0b10 => 0xFFE0 + stream.get_bits(5)?,
            _ => {
                let high = LONG_DISPLACEMENT_MASKS[reference_bits] + stream.get_bits(reference_bits as u32)?;
                ((high << 8) | u32::from(stream.get_byte()?)) & 0xFFFF
            },
        };
        trace!("copy {} bytes from {:#06X}", len, word);
        copy_from_word(&mut decoded, word, len as usize)?;
    }

    decoded.add_slice(header.last_bytes.as_slice());
    if decoded.len() != expected {
        return Err(DecompressionError::SizeMismatch { expected, obtained: decoded.len() });
    }
    Ok(decoded.into_vec())
}


#[cfg(test)]
mod tests {
    use super::{Hrust1Header, check, decode, try_decode};
    use crate::error::DecompressionError;
    use crate::pattern::assemble;
    use tracing_test::traced_test;

    const STREAM: [u8; 8] = [0xFF, 0x8C, b'A', b'B', 0xB0, 0x2F, 0x00, 0x1E];
    const EXPECTED: &[u8] = b"ABAAAAAAAAAAAAAxyzuvw";

    fn packed() -> Vec<u8> {
        // literal, short copy, 12-byte run, end marker
        let mut data = b"HR\x15\x00\x14\x00xyzuvw".to_vec();
        data.extend_from_slice(&STREAM);
        data
    }

    #[test]
    #[traced_test]
    fn test_decode() {
        let mut data = packed();
        data.extend_from_slice(b"trailing");
        assert!(check(&data));
        let result = decode(&data).unwrap();
        assert_eq!(result.bytes, EXPECTED);
        assert_eq!(result.consumed, 20);
    }

    #[test]
    #[traced_test]
    fn test_decode_behind_depacker() {
        let mut data = assemble(concat!(
            "dd21?? dd39 d5 f9 c1 eb c1 0b 09 eb c1 0b 09 ed52 19 38? 54 5d edb8 eb",
            "dd560b dd5e0a f9 e1 e1 e1 06? 3b f1 dd7706 dd23 10?",
        ));
        data.resize(0x100, 0x00);
        data.extend_from_slice(&packed());
        let result = decode(&data).unwrap();
        assert_eq!(result.bytes, EXPECTED);
        assert_eq!(result.consumed, 0x100 + 20);
    }

    #[test]
    fn test_header_rejection() {
        let mut data = packed();
        // packed size above unpacked size
        data[2] = 0x13;
        assert!(!check(&data));
        assert_eq!(
            try_decode(&data),
            Err(DecompressionError::InvalidHeader("packed size exceeds unpacked size")),
        );

        let data = packed();
        assert_eq!(
            Hrust1Header::read(&data[..10]),
            Err(DecompressionError::TooShort { needed: 15, available: 10 }),
        );
        assert_eq!(try_decode(b"XR\x15\x00\x14\x00xyzuvw\x00\x00\x00"), Err(DecompressionError::SignatureMismatch));
    }

    #[test]
    fn test_size_mismatch() {
        let mut data = packed();
        data[2] = 0x16;
        assert_eq!(
            try_decode(&data),
            Err(DecompressionError::SizeMismatch { expected: 0x16, obtained: 21 }),
        );
    }

    #[test]
    fn test_truncations() {
        let data = packed();
        for end in 0..data.len() {
            assert!(decode(&data[..end]).is_none());
        }
    }
}
