//! Hrust 2.1.
//!
//! An `hr2` header is followed either by stored data or by a byte-fed bitstream. The six last
//! bytes of the unpacked data and its first byte are kept in the header.


use std::sync::LazyLock;

use bitflags::bitflags;
use display_bytes::DisplayBytes;
use tracing::{debug, trace};

use crate::DecodedResult;
use crate::back_copy::Decoded;
use crate::error::DecompressionError;
use crate::hrust::{copy_from_word, read_length_prefix};
use crate::io_util::{BitFeed, BitReader, ByteBufReadable, EofPolicy, ReadEndian};
use crate::pattern::DepackerPattern;


pub const DESCRIPTION: &str = "Hrust v2.1";

const MAX_DECODED_SIZE: usize = 0xC000;

// the packed size counts from here
const STREAM_HEADER_OFFSET: usize = 8;
const BITSTREAM_OFFSET: usize = 15;

static SIGNATURE: LazyLock<DepackerPattern> = LazyLock::new(|| {
    DepackerPattern::compile("687232", Hrust2Header::SIZE)
        .expect("failed to compile Hrust 2 signature")
});


bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct Hrust2Flags : u8 {
        const NO_COMPRESSION = 0x80;
    }
}


#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Hrust2Header {
    pub flags: Hrust2Flags,
    pub data_size: u16,
    pub packed_size: u16,
    pub last_bytes: DisplayBytes<6>,
    pub first_byte: u8,
}
impl Hrust2Header {
    pub const SIZE: usize = 16;

    pub fn read(data: &[u8]) -> Result<Self, DecompressionError> {
        if data.len() < Self::SIZE {
            return Err(DecompressionError::TooShort { needed: Self::SIZE, available: data.len() });
        }
        if !SIGNATURE.matches(data) {
            return Err(DecompressionError::SignatureMismatch);
        }
        let mut pos = 3;
        let flags = Hrust2Flags::from_bits_retain(ByteBufReadable::read(data, &mut pos));
        let data_size = ReadEndian::read_le(data, &mut pos);
        let packed_size = ReadEndian::read_le(data, &mut pos);
        let last_bytes = ByteBufReadable::read(data, &mut pos);
        let first_byte = ByteBufReadable::read(data, &mut pos);
        Ok(Self {
            flags,
            data_size,
            packed_size,
            last_bytes,
            first_byte,
        })
    }

    pub fn used_size(&self) -> usize {
        STREAM_HEADER_OFFSET + usize::from(self.packed_size)
    }

    pub fn validate(&self, available: usize) -> Result<(), DecompressionError> {
        if self.flags.contains(Hrust2Flags::NO_COMPRESSION) && self.packed_size != self.data_size {
            return Err(DecompressionError::InvalidHeader("stored block with differing sizes"));
        }
        let used_size = self.used_size();
        if used_size < Self::SIZE {
            return Err(DecompressionError::InvalidHeader("packed size smaller than header"));
        }
        if used_size > available {
            return Err(DecompressionError::TooShort { needed: used_size, available });
        }
        Ok(())
    }
}


pub fn signature() -> &'static DepackerPattern { &SIGNATURE }


pub fn check(data: &[u8]) -> bool {
    Hrust2Header::read(data)
        .and_then(|header| header.validate(data.len()))
        .is_ok()
}


pub fn decode(data: &[u8]) -> Option<DecodedResult> {
    crate::report(DESCRIPTION, try_decode(data))
}


pub fn try_decode(data: &[u8]) -> Result<DecodedResult, DecompressionError> {
    let header = Hrust2Header::read(data)?;
    header.validate(data.len())?;
    debug!(
        "Hrust 2 header: flags {:?}, data size {:#X}, packed size {:#X}",
        header.flags, header.data_size, header.packed_size,
    );

    let bytes = if header.flags.contains(Hrust2Flags::NO_COMPRESSION) {
        let start = STREAM_HEADER_OFFSET;
        data[start..start + usize::from(header.data_size)].to_vec()
    } else {
        // the stream is nominally as long as the packed size, which reaches past the used size
        let stream_end = (BITSTREAM_OFFSET + usize::from(header.packed_size)).min(data.len());
        decode_stream(&data[BITSTREAM_OFFSET..stream_end], header.first_byte, header.last_bytes.as_slice())?
    };
    if bytes.is_empty() {
        return Err(DecompressionError::NoOutput);
    }
    Ok(DecodedResult {
        bytes,
        consumed: header.used_size(),
    })
}


fn read_distance(stream: &mut BitReader<'_, false>) -> Result<u32, DecompressionError> {
    if stream.get_bit()? == 1 {
        return Ok(0xFF00 + u32::from(stream.get_byte()?));
    }
    let mut high: u32 = 0xFFFF;
    for _ in 0..(4 - stream.get_bits(2)?) {
        high = ((high << 1) + u32::from(stream.get_bit()?)).wrapping_sub(1);
    }
    high &= 0xFFFF;
    if high == 0xFFE1 {
        high = stream.get_byte()?.into();
    }
    Ok(((high << 8) + u32::from(stream.get_byte()?)) & 0xFFFF)
}


/// Unpacks a bitstream whose first unpacked byte and last unpacked bytes are stored separately.
pub(crate) fn decode_stream(stream_data: &[u8], first_byte: u8, last_bytes: &[u8]) -> Result<Vec<u8>, DecompressionError> {
    let mut stream: BitReader<false> = BitReader::new(stream_data, EofPolicy::Saturating, BitFeed::LazyByte)?;
    let mut decoded = Decoded::new(MAX_DECODED_SIZE, stream_data.len() * 2);

    decoded.add_byte(first_byte);
    while !stream.eof() && !decoded.is_full() {
        if stream.get_bit()? == 1 {
            decoded.add_byte(stream.get_byte()?);
            continue;
        }
        let mut len = read_length_prefix(&mut stream, 1, 0x10)?;
        if len == 4 {
            if stream.get_bit()? == 1 {
                let mut count = u32::from(stream.get_byte()?);
                if count == 0 {
                    trace!("end marker");
                    break;
                }
                if count < 16 {
                    count = (count << 8) | u32::from(stream.get_byte()?);
                }
                let word = read_distance(&mut stream)?;
                trace!("copy {} bytes from {:#06X}", count, word);
                copy_from_word(&mut decoded, word, count as usize)?;
            } else {
                let count = 2 * (stream.get_bits(4)? + 6);
                decoded.generate(count as usize, || stream.get_byte())?;
            }
            continue;
        }

        if len > 4 {
            len -= 1;
        }
        let word = match len {
            1 => 0xFFF8 + stream.get_bits(3)?,
            2 => 0xFF00 + u32::from(stream.get_byte()?),
            _ => read_distance(&mut stream)?,
        };
        copy_from_word(&mut decoded, word, len as usize)?;
    }
    decoded.add_slice(last_bytes);
    Ok(decoded.into_vec())
}
