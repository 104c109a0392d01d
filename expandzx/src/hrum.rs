//! Hrum 3.x, the self-extracting predecessor of Hrust.
//!
//! The depacker moves the packed block with `LDIR`/`LDDR` and then unpacks it with the same
//! bitstream layout as Hrust 1.x.


use std::sync::LazyLock;

use display_bytes::{DisplayBytes, HexBytesSlice};
use tracing::{debug, trace};

use crate::DecodedResult;
use crate::back_copy::Decoded;
use crate::data_movement::DataMovement;
use crate::error::DecompressionError;
use crate::hrust::{copy_from_word, read_length_prefix};
use crate::io_util::{BitFeed, BitReader, ByteBufReadable, EofPolicy, word_at};
use crate::pattern::DepackerPattern;


pub const DESCRIPTION: &str = "Hrum v3.x";

const MAX_DECODED_SIZE: usize = 0xC000;
const HEADER_SIZE: usize = 0x9B;
const PACKED_DATA_OFFSET: usize = 0x96;
const BITSTREAM_OFFSET: usize = 0x98;
const MIN_BANNER_MATCH: usize = 9;

static DEPACKER: LazyLock<DepackerPattern> = LazyLock::new(|| {
    DepackerPattern::compile(
        concat!(
            "?",       // di/nop
            "ed73??",  // ld (nn),sp
            "21??",    // ld hl,nn
            "11??",    // ld de,nn
            "017700",  // ld bc,0x0077
            "d5",      // push de
            "edb0",    // ldir
            "11??",    // ld de,nn (unpack target)
            "d9",      // exx
            "21??",    // ld hl,nn (packed source)
            "11??",    // ld de,nn (packed target)
            "01??",    // ld bc,nn (packed size)
            "c9",      // ret
            "ed?",     // lddr/ldir
            "16?",     // ld d,n
            "31??",    // ld sp,nn (first of moved data)
            "c1",      // pop bc
        ),
        HEADER_SIZE,
    ).expect("failed to compile Hrum depacker pattern")
});

/// Filler that the 3.5 version writes after the packed data up to the end of the sector.
static BANNER: LazyLock<[u8; 255]> = LazyLock::new(|| {
    let text: &[u8] = b"HRUM v3.5 by Dmitry Pyankov\x80Tel.(38822)-4421-1.Bye!!!\x80 Gorno-Altaysk, 09.01.97\x81";
    let mut banner = [0xCD; 255];
    banner[..text.len()].copy_from_slice(text);
    banner
});


#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct HrumHeader {
    pub packed_source: u16,
    pub packed_target: u16,
    pub packed_size: u16,
    pub copy_opcode: u8,
    pub first_of_packed: u16,
    pub last_bytes: DisplayBytes<5>,
}
impl HrumHeader {
    pub fn read(data: &[u8]) -> Result<Self, DecompressionError> {
        if data.len() < HEADER_SIZE {
            return Err(DecompressionError::TooShort { needed: HEADER_SIZE, available: data.len() });
        }
        if !DEPACKER.matches(data) {
            return Err(DecompressionError::SignatureMismatch);
        }
        let mut pos = 0x91;
        let last_bytes = ByteBufReadable::read(data, &mut pos);
        Ok(Self {
            packed_source: word_at(data, 0x16),
            packed_target: word_at(data, 0x19),
            packed_size: word_at(data, 0x1C),
            copy_opcode: data[0x20],
            first_of_packed: word_at(data, 0x24),
            last_bytes,
        })
    }

    pub fn used_size(&self) -> usize {
        PACKED_DATA_OFFSET + usize::from(self.packed_size)
    }

    pub fn validate(&self, available: usize) -> Result<(), DecompressionError> {
        if usize::from(self.packed_size) < BITSTREAM_OFFSET - PACKED_DATA_OFFSET {
            return Err(DecompressionError::InvalidHeader("packed size smaller than stream header"));
        }
        let movement = DataMovement::new(self.packed_source, self.packed_target, self.packed_size, self.copy_opcode);
        if !movement.is_valid() {
            return Err(DecompressionError::InvalidDataMovement);
        }
        if movement.first_of_moved_data() != self.first_of_packed {
            return Err(DecompressionError::InvalidHeader("moved data does not start where unpacking starts"));
        }
        let used_size = self.used_size();
        if used_size > available {
            return Err(DecompressionError::TooShort { needed: used_size, available });
        }
        Ok(())
    }
}


/// Extends the used size by the banner padding, if the file is padded to a full sector with it.
pub fn used_size_with_padding(data: &[u8], used_size: usize) -> usize {
    let on_disk = used_size.next_multiple_of(256).min(data.len());
    if on_disk < used_size + MIN_BANNER_MATCH {
        return used_size;
    }
    let matched = data[used_size..on_disk].iter()
        .zip(BANNER.iter())
        .take_while(|(actual, expected)| actual == expected)
        .count();
    if matched >= MIN_BANNER_MATCH {
        used_size + matched
    } else {
        used_size
    }
}


fn read_distance(stream: &mut BitReader<'_, false>) -> Result<u32, DecompressionError> {
    if stream.get_bit()? == 1 {
        let high = 0xF0 + stream.get_bits(4)?;
        Ok(256 * high + u32::from(stream.get_byte()?))
    } else {
        Ok(0xFF00 + u32::from(stream.get_byte()?))
    }
}


pub fn check(data: &[u8]) -> bool {
    HrumHeader::read(data)
        .and_then(|header| header.validate(data.len()))
        .is_ok()
}


pub fn signature() -> &'static DepackerPattern { &DEPACKER }


pub fn decode(data: &[u8]) -> Option<DecodedResult> {
    crate::report(DESCRIPTION, try_decode(data))
}


pub fn try_decode(data: &[u8]) -> Result<DecodedResult, DecompressionError> {
    let header = HrumHeader::read(data)?;
    header.validate(data.len())?;
    debug!(
        "Hrum: packed {:#06X} -> {:#06X}, size {:#X}, last bytes {}",
        header.packed_source, header.packed_target, header.packed_size,
        HexBytesSlice::from(header.last_bytes.as_slice()),
    );

    let used_size = header.used_size();
    let bytes = decode_stream(&data[BITSTREAM_OFFSET..used_size], &header)?;
    if bytes.is_empty() {
        return Err(DecompressionError::NoOutput);
    }
    Ok(DecodedResult {
        bytes,
        consumed: used_size_with_padding(data, used_size),
    })
}


fn decode_stream(stream_data: &[u8], header: &HrumHeader) -> Result<Vec<u8>, DecompressionError> {
    let mut stream: BitReader<false> = BitReader::new(stream_data, EofPolicy::Saturating, BitFeed::EagerWord)?;
    if stream.eof() {
        return Ok(Vec::new());
    }
    let mut decoded = Decoded::new(MAX_DECODED_SIZE, 2 * usize::from(header.packed_size));

    decoded.add_byte(stream.get_byte()?);
    while !stream.eof() && !decoded.is_full() {
        if stream.get_bit()? == 1 {
            decoded.add_byte(stream.get_byte()?);
            continue;
        }
        let mut len = 1 + read_length_prefix(&mut stream, 0, 0xF)?;
        let word = if len == 4 {
            len = stream.get_byte()?.into();
            if len == 0 {
                trace!("end marker");
                break;
            }
            read_distance(&mut stream)?
        } else {
            if len > 4 {
                len -= 1;
            }
            match len {
                1 => 0xFFF8 + stream.get_bits(3)?,
                2 => 0xFF00 + u32::from(stream.get_byte()?),
                _ => read_distance(&mut stream)?,
            }
        };
        copy_from_word(&mut decoded, word, len as usize)?;
    }
    decoded.add_slice(header.last_bytes.as_slice());
    Ok(decoded.into_vec())
}


#[cfg(test)]
mod tests {
    use super::{BANNER, HEADER_SIZE, check, decode, try_decode, used_size_with_padding};
    use crate::error::DecompressionError;
    use crate::pattern::assemble;
    use tracing_test::traced_test;

    fn packed_with(stream: &[u8]) -> Vec<u8> {
        let mut data = assemble(concat!(
            "f3 ed73?? 21?? 11?? 017700 d5 edb0 11?? d9 21?? 11?? 01?? c9 ed? 16? 31?? c1",
        ));
        data.resize(0x98, 0x00);
        // LDIR 0x8000 -> 0x6000
        let size = (stream.len() + 2) as u16;
        data[0x16..0x18].copy_from_slice(&[0x00, 0x80]);
        data[0x19..0x1B].copy_from_slice(&[0x00, 0x60]);
        data[0x1C..0x1E].copy_from_slice(&size.to_le_bytes());
        data[0x20] = 0xB0;
        data[0x24..0x26].copy_from_slice(&[0x00, 0x60]);
        data[0x91..0x96].copy_from_slice(b"VWXYZ");
        data.extend_from_slice(stream);
        data
    }

    fn packed() -> Vec<u8> {
        // literal 'B', one byte from two back, end marker
        packed_with(&[0xC0, 0x8C, b'A', b'B', 0x00])
    }

    #[test]
    #[traced_test]
    fn test_decode() {
        let data = packed();
        assert_eq!(data.len(), 0x9D);
        assert!(check(&data));
        let result = decode(&data).unwrap();
        assert_eq!(result.bytes, b"ABAVWXYZ");
        assert_eq!(result.consumed, 0x9D);
    }

    #[test]
    fn test_banner_padding() {
        let mut data = packed();
        data.extend_from_slice(&BANNER[..20]);
        data.resize(0x100, 0x00);
        assert_eq!(decode(&data).unwrap().consumed, 0x9D + 20);

        let mut data = packed();
        data.extend_from_slice(&BANNER[..8]);
        data.resize(0x100, 0x00);
        assert_eq!(used_size_with_padding(&data, 0x9D), 0x9D);

        // not enough room for the banner before the sector ends
        let data = vec![0xCD; 0x100];
        assert_eq!(used_size_with_padding(&data, 0xF8), 0xF8);
    }

    #[test]
    fn test_header_rejection() {
        let mut data = packed();
        data[0x24] = 0x01;
        assert!(!check(&data));
        assert!(matches!(try_decode(&data), Err(DecompressionError::InvalidHeader(_))));

        let mut data = packed();
        data[0x20] = 0xA0;
        assert_eq!(try_decode(&data), Err(DecompressionError::InvalidDataMovement));

        let mut data = packed();
        data[0x1E] = 0x00;
        assert_eq!(try_decode(&data), Err(DecompressionError::SignatureMismatch));

        let data = packed();
        assert_eq!(
            try_decode(&data[..0x9C]),
            Err(DecompressionError::TooShort { needed: 0x9D, available: 0x9C }),
        );
        assert_eq!(
            try_decode(&data[..HEADER_SIZE - 1]),
            Err(DecompressionError::TooShort { needed: HEADER_SIZE, available: HEADER_SIZE - 1 }),
        );
    }

    #[test]
    fn test_output_ceiling() {
        // every group holds eight copies of 255 bytes from one back, and three bit words
        let group = [
            0xFF, 0xFF, 0xFF, 0xFF, 0x61, 0x18, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
            0x18, 0x86, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x86, 0x61, 0xFF,
        ];
        let mut stream = vec![0x86, 0x61, b'A'];
        for _ in 0..26 {
            stream.extend_from_slice(&group);
        }
        let data = packed_with(&stream);
        let result = decode(&data).unwrap();
        assert_eq!(result.bytes.len(), 0xC000);
        assert!(result.bytes.iter().all(|b| *b == b'A'));
        assert_eq!(result.consumed, data.len());
    }

    #[test]
    fn test_truncations() {
        let data = packed();
        for end in 0..data.len() {
            assert!(decode(&data[..end]).is_none());
        }
    }
}
