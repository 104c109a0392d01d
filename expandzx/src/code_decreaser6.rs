//! Powerfull Code Decreaser 6.1 and 6.2.
//!
//! The depacker moves the packed data to the top of memory and unpacks a bitstream that is fed in
//! little-endian words, interleaved with whole bytes. The last few bytes of the output are stored
//! unpacked in the depacker.


use std::sync::LazyLock;

use display_bytes::DisplayBytesSlice;
use tracing::{debug, trace};

use crate::DecodedResult;
use crate::back_copy::Decoded;
use crate::error::DecompressionError;
use crate::hrust::read_length_prefix;
use crate::io_util::{BitFeed, BitReader, EofPolicy, word_at};
use crate::pattern::DepackerPattern;


const MAX_DECODED_SIZE: usize = 0xC000;

static DEPACKER_V61: LazyLock<DepackerPattern> = LazyLock::new(|| {
    DepackerPattern::compile(
        concat!(
            "?",       // di/nop
            "21??",    // ld hl,nn (depacker source)
            "11??",    // ld de,nn (depacker target)
            "01b500",  // ld bc,0x00b5
            "d5",      // push de
            "edb0",    // ldir
            "21??",    // ld hl,nn (last of packed source)
            "11??",    // ld de,nn (last of packed target)
            "01??",    // ld bc,nn (packed size)
            "c9",      // ret
            "ed?",     // lddr/ldir
            "21??",    // ld hl,nn (stored tail source)
            "11??",    // ld de,nn (stored tail target)
            "01??",    // ld bc,nn (stored tail size)
            "d5",      // push de
            "c5",      // push bc
            "edb0",    // ldir
            "ed73??",  // ld (nn),sp
            "f9",      // ld sp,hl
            "11??",    // ld de,nn (depack target)
            "60",      // ld h,b
            "d9",      // exx
            "011001",  // ld bc,0x0110
            "3ed9",    // ld a,0xd9
            "1002",    // djnz $+4
            "e1",      // pop hl
            "41",      // ld b,c
            "29",      // add hl,hl
            "3007",    // jr nc,$+9
            "3b",      // dec sp
            "f1",      // pop af
            "d9",      // exx
            "12",      // ld (de),a
            "13",      // inc de
            "18f1",    // jr ...
        ),
        Pcd6Version::V61.header_size(),
    ).expect("failed to compile PCD 6.1 depacker pattern")
});

static DEPACKER_V62: LazyLock<DepackerPattern> = LazyLock::new(|| {
    DepackerPattern::compile(
        concat!(
            "?",       // di/nop
            "21??",    // ld hl,nn (depacker source)
            "11??",    // ld de,nn (depacker target)
            "01a300",  // ld bc,0x00a3
            "edb0",    // ldir
            "011001",  // ld bc,0x0110
            "d9",      // exx
            "22??",    // ld (nn),hl
            "21??",    // ld hl,nn (last of packed source)
            "11??",    // ld de,nn (last of packed target)
            "01??",    // ld bc,nn (packed size)
            "ed73??",  // ld (nn),sp
            "31??",    // ld sp,nn
            "c3??",    // jp nn
            "ed?",     // lddr/ldir
            "11??",    // ld de,nn (depack target)
            "60",      // ld h,b
            "d9",      // exx
            "1002",    // djnz $+4
            "e1",      // pop hl
            "41",      // ld b,c
            "29",      // add hl,hl
            "3007",    // jr nc,$+9
            "3b",      // dec sp
            "f1",      // pop af
            "d9",      // exx
            "12",      // ld (de),a
            "13",      // inc de
            "18f1",    // jr ...
        ),
        Pcd6Version::V62.header_size(),
    ).expect("failed to compile PCD 6.2 depacker pattern")
});


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Pcd6Version {
    V61,
    V62,
}
impl Pcd6Version {
    pub fn description(&self) -> &'static str {
        match self {
            Self::V61 => "Powerfull Code Decreaser v6.1",
            Self::V62 => "Powerfull Code Decreaser v6.2",
        }
    }

    pub fn signature(&self) -> &'static DepackerPattern {
        match self {
            Self::V61 => &DEPACKER_V61,
            Self::V62 => &DEPACKER_V62,
        }
    }

    /// Offset of the source address of the packed data move; target and size follow it.
    fn movement_offset(&self) -> usize {
        match self {
            Self::V61 => 0x0E,
            Self::V62 => 0x14,
        }
    }

    fn last_bytes_offset(&self) -> usize {
        match self {
            Self::V61 => 0xC9,
            Self::V62 => 0xC4,
        }
    }

    fn last_bytes_count(&self) -> usize {
        match self {
            Self::V61 => 3,
            Self::V62 => 5,
        }
    }

    fn bitstream_offset(&self) -> usize {
        self.last_bytes_offset() + self.last_bytes_count()
    }

    /// The fixed part up to and including the first bitstream word.
    fn header_size(&self) -> usize {
        self.bitstream_offset() + 2
    }

    pub fn check(&self, data: &[u8]) -> bool {
        Pcd6Header::read(*self, data)
            .and_then(|header| header.validate(data.len()))
            .is_ok()
    }

    pub fn decode(&self, data: &[u8]) -> Option<DecodedResult> {
        crate::report(self.description(), self.try_decode(data))
    }

    pub fn try_decode(&self, data: &[u8]) -> Result<DecodedResult, DecompressionError> {
        let header = Pcd6Header::read(*self, data)?;
        header.validate(data.len())?;
        debug!(
            "{}: packed {:#06X} -> {:#06X}, size {:#X}, stored tail {}",
            self.description(), header.last_of_source, header.last_of_target, header.packed_size,
            DisplayBytesSlice::from(header.last_bytes.as_slice()),
        );

        let used_size = header.used_size();
        let bytes = decode_stream(&data[self.bitstream_offset()..used_size], &header.last_bytes)?;
        Ok(DecodedResult {
            bytes,
            consumed: used_size,
        })
    }
}


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Pcd6Header {
    pub version: Pcd6Version,
    pub last_of_source: u16,
    pub last_of_target: u16,

    /// Bitstream plus stored tail.
    pub packed_size: u16,

    pub last_bytes: Vec<u8>,
}
impl Pcd6Header {
    pub fn read(version: Pcd6Version, data: &[u8]) -> Result<Self, DecompressionError> {
        // the depacker needs at least one byte past its fixed part
        let needed = version.header_size() + 1;
        if data.len() < needed {
            return Err(DecompressionError::TooShort { needed, available: data.len() });
        }
        if !version.signature().matches(data) {
            return Err(DecompressionError::SignatureMismatch);
        }
        let movement = version.movement_offset();
        let last_bytes_offset = version.last_bytes_offset();
        Ok(Self {
            version,
            last_of_source: word_at(data, movement),
            last_of_target: word_at(data, movement + 3),
            packed_size: word_at(data, movement + 6),
            last_bytes: data[last_bytes_offset..last_bytes_offset + version.last_bytes_count()].to_vec(),
        })
    }

    pub fn used_size(&self) -> usize {
        self.version.bitstream_offset() + usize::from(self.packed_size) - self.last_bytes.len()
    }

    pub fn validate(&self, available: usize) -> Result<(), DecompressionError> {
        if usize::from(self.packed_size) <= self.last_bytes.len() {
            return Err(DecompressionError::InvalidHeader("packed size does not exceed stored tail"));
        }
        let used_size = self.used_size();
        if used_size > available {
            return Err(DecompressionError::TooShort { needed: used_size, available });
        }
        Ok(())
    }
}


fn long_length(stream: &mut BitReader<'_, false>, index: u32) -> Result<usize, DecompressionError> {
    match index {
        2 => Ok(3),
        3 => {
            let len = stream.get_byte()?;
            if len != 0 {
                Ok(usize::from(len) + 0xF)
            } else {
                Ok(usize::from(stream.get_le_word()?))
            }
        },
        other => Ok(other as usize),
    }
}


fn long_offset(stream: &mut BitReader<'_, false>) -> Result<usize, DecompressionError> {
    let low = usize::from(stream.get_byte()?);
    let mut high: usize = 0;
    if stream.get_bit()? == 1 {
        loop {
            high = high.saturating_mul(4).saturating_add(stream.get_bits(2)? as usize);
            if stream.get_bit()? == 0 {
                break;
            }
        }
        high = high.saturating_add(1);
    }
    Ok(high.saturating_mul(256).saturating_add(low))
}


fn decode_stream(stream_data: &[u8], last_bytes: &[u8]) -> Result<Vec<u8>, DecompressionError> {
    let mut stream = BitReader::new(stream_data, EofPolicy::Saturating, BitFeed::LazyWord)?;
    let mut decoded = Decoded::new(MAX_DECODED_SIZE, 2 * stream_data.len());

    loop {
        while stream.get_bit()? == 1 {
            decoded.add_byte(stream.get_byte()?);
        }
        if stream.eof() || decoded.is_full() {
            break;
        }

        let index = read_length_prefix(&mut stream, 0, 0xF)?;
        let (offset, len) = match index {
            0 => (stream.get_bits(4)? as usize + 1, 1),
            1 => {
                let offset = 1 + usize::from(stream.get_byte()?);
                if offset == 0x100 {
                    trace!("end marker");
                    break;
                }
                (offset, 2)
            },
            _ => {
                let len = long_length(&mut stream, index)?;
                (long_offset(&mut stream)?, len)
            },
        };
        decoded.copy_from_back(offset, len)?;
    }
    decoded.add_slice(last_bytes);
    Ok(decoded.into_vec())
}


#[cfg(test)]
mod tests {
    use super::{Pcd6Version, decode_stream};
    use crate::error::DecompressionError;
    use crate::pattern::assemble;
    use tracing_test::traced_test;

    const DEPACKER_V61_TEXT: &str = concat!(
        "f3 21?? 11?? 01b500 d5 edb0 21?? 11?? 01?? c9 ed? 21?? 11?? 01?? d5 c5 edb0 ed73?? f9",
        "11?? 60 d9 011001 3ed9 1002 e1 41 29 3007 3b f1 d9 12 13 18f1",
    );
    const DEPACKER_V62_TEXT: &str = concat!(
        "f3 21?? 11?? 01a300 edb0 011001 d9 22?? 21?? 11?? 01?? ed73?? 31?? c3?? ed? 11?? 60 d9",
        "1002 e1 41 29 3007 3b f1 d9 12 13 18f1",
    );

    fn packed(version: Pcd6Version, stream: &[u8]) -> Vec<u8> {
        let text = match version {
            Pcd6Version::V61 => DEPACKER_V61_TEXT,
            Pcd6Version::V62 => DEPACKER_V62_TEXT,
        };
        let mut data = assemble(text);
        data.resize(version.bitstream_offset(), 0x00);
        let movement = version.movement_offset();
        let tail = &b"XYZUV"[..version.last_bytes_count()];
        let size = (stream.len() + tail.len()) as u16;
        data[movement..movement + 2].copy_from_slice(&0xA000u16.to_le_bytes());
        data[movement + 3..movement + 5].copy_from_slice(&0xFFFFu16.to_le_bytes());
        data[movement + 6..movement + 8].copy_from_slice(&size.to_le_bytes());
        data[version.last_bytes_offset()..version.bitstream_offset()].copy_from_slice(tail);
        data.extend_from_slice(stream);
        data
    }

    // literals 'a' and 'b', two bytes from two back, end marker
    const STREAM: [u8; 6] = [0x00, 0xC9, b'a', b'b', 0x01, 0xFF];

    #[test]
    #[traced_test]
    fn test_decode_v61() {
        let mut data = packed(Pcd6Version::V61, &STREAM);
        data.push(0xC9);
        assert!(Pcd6Version::V61.check(&data));
        assert!(!Pcd6Version::V62.check(&data));
        let result = Pcd6Version::V61.decode(&data).unwrap();
        assert_eq!(result.bytes, b"ababXYZ");
        assert_eq!(result.consumed, 0xCC + STREAM.len());
    }

    #[test]
    #[traced_test]
    fn test_decode_v62() {
        let data = packed(Pcd6Version::V62, &STREAM);
        assert!(Pcd6Version::V62.check(&data));
        let result = Pcd6Version::V62.decode(&data).unwrap();
        assert_eq!(result.bytes, b"ababXYZUV");
        assert_eq!(result.consumed, data.len());
    }

    #[test]
    fn test_long_references() {
        // "abc", three bytes from three back with a one-byte offset, end marker
        let stream = [0x40, 0xE8, b'a', b'b', b'c', 0x03, 0xFF];
        assert_eq!(decode_stream(&stream, b"!").unwrap(), b"abcabc!");

        // high offset part %01 gives a distance of 0x210
        assert_eq!(
            decode_stream(&[0x00, 0xAA, b'a', 0x10], b"!"),
            Err(DecompressionError::InvalidBackReference { offset: 0x210, available: 1 }),
        );
    }

    #[test]
    fn test_short_reference() {
        // 'q', then index 0 with a four-bit offset of 0 copies one byte, end marker
        let bytes = decode_stream(&[0x20, 0x80, b'q', 0xFF], b"").unwrap();
        assert_eq!(bytes, b"qq");
    }

    #[test]
    fn test_output_ceiling() {
        // 'x', then 0xFFFF bytes copied from one back
        let stream = [0x00, 0xB0, b'x', 0x00, 0xFF, 0xFF, 0x01];
        let bytes = decode_stream(&stream, b"XYZ").unwrap();
        assert_eq!(bytes.len(), 0xC000);
        assert!(bytes.iter().all(|b| *b == b'x'));
    }

    #[test]
    fn test_header_rejection() {
        let mut data = packed(Pcd6Version::V61, &STREAM);
        data[0x14..0x16].copy_from_slice(&3u16.to_le_bytes());
        assert_eq!(
            Pcd6Version::V61.try_decode(&data),
            Err(DecompressionError::InvalidHeader("packed size does not exceed stored tail")),
        );

        let mut data = packed(Pcd6Version::V61, &STREAM);
        data[0x07] = 0xB4;
        assert_eq!(Pcd6Version::V61.try_decode(&data), Err(DecompressionError::SignatureMismatch));
    }

    #[test]
    fn test_truncations() {
        let data = packed(Pcd6Version::V62, &STREAM);
        for end in 0..data.len() {
            assert!(Pcd6Version::V62.decode(&data[..end]).is_none());
        }
    }
}
