//! DataSqueezer 4.x.
//!
//! The packed block is read from its last byte towards its first one and the data is unpacked
//! from its last byte towards its first one, so the decoded bytes are reversed at the end.
//!
//! Bitstream commands:
//! ```text
//! %0                  8-bit literal
//! %1 %1 b1            length 2 + b1
//! %1 %01 b2           length 4 + b2
//! %1 %001 b4          length 8 + b4; 0x17 means 14 + b5 8-bit literals instead
//! %1 %000 b8...       length 0x17 + sum of bytes, continued while the byte is 0xFF
//! then the distance:
//! %1 bN               0x221 + N long offset bits
//! %01 b5              1 + b5
//! %00 b9              0x21 + b9
//! ```


use std::sync::LazyLock;

use tracing::{debug, trace};

use crate::DecodedResult;
use crate::back_copy::Decoded;
use crate::data_movement::DataMovement;
use crate::error::DecompressionError;
use crate::io_util::{BitFeed, BitReader, EofPolicy, word_at};
use crate::pattern::DepackerPattern;


pub const DESCRIPTION: &str = "DataSqueezer v4.x";

const MAX_DECODED_SIZE: usize = 0xC000;
const HEADER_SIZE: usize = 0xB1;
const PACKED_DATA_OFFSET: usize = 0xB0;
const MAX_LONG_OFFSET_BITS: u8 = 0x10;

// a length code that announces a run of literals
const LITERAL_RUN_CODE: u32 = 0x17;

static DEPACKER: LazyLock<DepackerPattern> = LazyLock::new(|| {
    DepackerPattern::compile(
        concat!(
            "11??",    // ld de,nn (buffer)
            "21??",    // ld hl,nn
            "d5",      // push de
            "01??",    // ld bc,nn
            "edb0",    // ldir
            "11??",    // ld de,nn (packed target)
            "21??",    // ld hl,nn (packed source)
            "01??",    // ld bc,nn (packed size)
            "c9",      // ret
            "ed?",     // ldir/lddr
            "010801",  // ld bc,0x0108
            "21??",    // ld hl,nn (last packed byte)
            "d9",      // exx
            "e5",      // push hl
            "11??",    // ld de,nn (last depacked byte)
        ),
        HEADER_SIZE,
    ).expect("failed to compile DataSqueezer depacker pattern")
});


#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct DataSqueezerHeader {
    pub packed_target: u16,
    pub packed_source: u16,
    pub packed_size: u16,
    pub copy_opcode: u8,
    pub last_of_packed: u16,
    pub last_of_depacked: u16,
    pub long_offset_bits: u8,
    pub depacked_limit: u16,
}
impl DataSqueezerHeader {
    pub fn read(data: &[u8]) -> Result<Self, DecompressionError> {
        if data.len() < HEADER_SIZE {
            return Err(DecompressionError::TooShort { needed: HEADER_SIZE, available: data.len() });
        }
        if !DEPACKER.matches(data) {
            return Err(DecompressionError::SignatureMismatch);
        }
        Ok(Self {
            packed_target: word_at(data, 0x0D),
            packed_source: word_at(data, 0x10),
            packed_size: word_at(data, 0x13),
            copy_opcode: data[0x17],
            last_of_packed: word_at(data, 0x1C),
            last_of_depacked: word_at(data, 0x21),
            long_offset_bits: data[0x82],
            depacked_limit: word_at(data, 0x8E),
        })
    }

    pub fn used_size(&self) -> usize {
        PACKED_DATA_OFFSET + usize::from(self.packed_size)
    }

    pub fn unpacked_size(&self) -> usize {
        usize::from(self.last_of_depacked.saturating_sub(self.depacked_limit))
    }

    pub fn validate(&self, available: usize) -> Result<(), DecompressionError> {
        if self.long_offset_bits > MAX_LONG_OFFSET_BITS {
            return Err(DecompressionError::InvalidHeader("long offsets wider than 16 bits"));
        }
        if self.last_of_depacked < self.depacked_limit {
            return Err(DecompressionError::InvalidHeader("unpacked data ends below its start"));
        }
        if self.unpacked_size() > MAX_DECODED_SIZE {
            return Err(DecompressionError::InvalidHeader("unpacked size too large"));
        }
        let movement = DataMovement::new(self.packed_source, self.packed_target, self.packed_size, self.copy_opcode);
        if !movement.is_valid() {
            return Err(DecompressionError::InvalidDataMovement);
        }
        if movement.last_of_moved_data() != self.last_of_packed {
            return Err(DecompressionError::InvalidHeader("moved data does not end where unpacking starts"));
        }
        let used_size = self.used_size();
        if used_size > available {
            return Err(DecompressionError::TooShort { needed: used_size, available });
        }
        Ok(())
    }
}


pub fn check(data: &[u8]) -> bool {
    DataSqueezerHeader::read(data)
        .and_then(|header| header.validate(data.len()))
        .is_ok()
}


pub fn signature() -> &'static DepackerPattern { &DEPACKER }


pub fn decode(data: &[u8]) -> Option<DecodedResult> {
    crate::report(DESCRIPTION, try_decode(data))
}


pub fn try_decode(data: &[u8]) -> Result<DecodedResult, DecompressionError> {
    let header = DataSqueezerHeader::read(data)?;
    header.validate(data.len())?;
    debug!(
        "DataSqueezer: packed {:#06X} -> {:#06X}, size {:#X}, unpacked size {:#X}, long offset bits {}",
        header.packed_source, header.packed_target, header.packed_size, header.unpacked_size(),
        header.long_offset_bits,
    );

    let used_size = header.used_size();
    let bytes = decode_stream(&data[PACKED_DATA_OFFSET..used_size], &header)?;
    if bytes.is_empty() {
        return Err(DecompressionError::NoOutput);
    }
    Ok(DecodedResult {
        bytes,
        consumed: used_size,
    })
}


enum Length {
    Copy(u32),
    LiteralRun,
}

fn read_length(stream: &mut BitReader<'_, true>) -> Result<Length, DecompressionError> {
    if stream.get_bit()? == 1 {
        return Ok(Length::Copy(2 + stream.get_bits(1)?));
    }
    if stream.get_bit()? == 1 {
        return Ok(Length::Copy(4 + stream.get_bits(2)?));
    }
    if stream.get_bit()? == 1 {
        let len = 8 + stream.get_bits(4)?;
        return Ok(if len == LITERAL_RUN_CODE { Length::LiteralRun } else { Length::Copy(len) });
    }
    let mut len = 0x17;
    loop {
        let addendum = stream.get_bits(8)?;
        len += addendum;
        if addendum != 0xFF {
            return Ok(Length::Copy(len));
        }
    }
}

fn read_offset(stream: &mut BitReader<'_, true>, long_offset_bits: u8) -> Result<usize, DecompressionError> {
    let offset = if stream.get_bit()? == 1 {
        0x221 + stream.get_bits(long_offset_bits.into())?
    } else if stream.get_bit()? == 1 {
        1 + stream.get_bits(5)?
    } else {
        0x21 + stream.get_bits(9)?
    };
    Ok(offset as usize)
}


fn decode_stream(stream_data: &[u8], header: &DataSqueezerHeader) -> Result<Vec<u8>, DecompressionError> {
    let unpacked_size = header.unpacked_size();
    let mut stream: BitReader<true> = BitReader::new(stream_data, EofPolicy::Strict, BitFeed::LazyByte)?;
    let mut decoded = Decoded::new(MAX_DECODED_SIZE, unpacked_size);

    while decoded.len() < unpacked_size {
        if stream.get_bit()? == 0 {
            let literal = stream.get_bits(8)? as u8;
            decoded.add_byte(literal);
            continue;
        }
        match read_length(&mut stream)? {
            Length::LiteralRun => {
                let count = 14 + stream.get_bits(5)?;
                trace!("{} literal bytes", count);
                decoded.generate(count as usize, || Ok(stream.get_bits(8)? as u8))?;
            },
            Length::Copy(len) => {
                let offset = read_offset(&mut stream, header.long_offset_bits)?;
                trace!("copy {} bytes from {} back", len, offset);
                decoded.copy_from_back(offset, len as usize)?;
            },
        }
    }
    decoded.reverse();
    Ok(decoded.into_vec())
}


#[cfg(test)]
mod tests {
    use super::{DataSqueezerHeader, check, decode, try_decode};
    use crate::error::DecompressionError;
    use crate::pattern::assemble;
    use proptest::prelude::*;
    use tracing_test::traced_test;

    fn packed(stream: &[u8], unpacked_size: u16) -> Vec<u8> {
        let mut data = assemble("11?? 21?? d5 01?? edb0 11?? 21?? 01?? c9 ed? 010801 21?? d9 e5 11??");
        data.resize(0xB0, 0x00);
        let size = stream.len() as u16;
        // LDDR to the top of memory
        data[0x0D..0x0F].copy_from_slice(&0xFFFFu16.to_le_bytes());
        data[0x10..0x12].copy_from_slice(&0x6003u16.to_le_bytes());
        data[0x13..0x15].copy_from_slice(&size.to_le_bytes());
        data[0x17] = 0xB8;
        data[0x1C..0x1E].copy_from_slice(&0xFFFFu16.to_le_bytes());
        data[0x21..0x23].copy_from_slice(&(0x7FFF + unpacked_size).to_le_bytes());
        data[0x82] = 0x0C;
        data[0x8E..0x90].copy_from_slice(&0x7FFFu16.to_le_bytes());
        data.extend_from_slice(stream);
        data
    }

    #[test]
    #[traced_test]
    fn test_decode() {
        // read backwards: literal 'X', literal 'Y', copy 2 from 2 back
        let data = packed(&[0x10, 0x72, 0x16, 0x2C], 4);
        assert!(check(&data));
        let result = decode(&data).unwrap();
        assert_eq!(result.bytes, b"YXYX");
        assert_eq!(result.consumed, 0xB4);
    }

    #[test]
    fn test_strict_eof() {
        // the same stream cannot produce 5 bytes
        let data = packed(&[0x10, 0x72, 0x16, 0x2C], 5);
        assert_eq!(try_decode(&data), Err(DecompressionError::UnexpectedEof));
    }

    #[test]
    fn test_header_rejection() {
        let mut data = packed(&[0x10, 0x72, 0x16, 0x2C], 4);
        data[0x82] = 0x11;
        assert!(!check(&data));

        let mut data = packed(&[0x10, 0x72, 0x16, 0x2C], 4);
        data[0x8E] = 0x05;
        data[0x8F] = 0x80;
        assert_eq!(
            try_decode(&data),
            Err(DecompressionError::InvalidHeader("unpacked data ends below its start")),
        );

        let mut data = packed(&[0x10, 0x72, 0x16, 0x2C], 4);
        data[0x1C] = 0xFE;
        assert!(!check(&data));

        let data = packed(&[0x10, 0x72, 0x16, 0x2C], 4);
        let header = DataSqueezerHeader::read(&data).unwrap();
        assert_eq!(header.unpacked_size(), 4);
        assert!(header.validate(0xB3).is_err());
    }

    #[test]
    fn test_truncations() {
        let data = packed(&[0x10, 0x72, 0x16, 0x2C], 4);
        for end in 0..data.len() {
            assert!(decode(&data[..end]).is_none());
        }
    }

    proptest! {
        #[test]
        fn arbitrary_streams_do_not_panic(stream in proptest::collection::vec(any::<u8>(), 1..64), unpacked in 1u16..0x400) {
            let data = packed(&stream, unpacked);
            if let Some(result) = decode(&data) {
                prop_assert!(result.bytes.len() >= usize::from(unpacked));
                prop_assert!(result.consumed <= data.len());
            }
        }
    }
}
