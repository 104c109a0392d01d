//! Turbo-LZ 1.x, in its plain form and in the protected form that XORs literals with a key table
//! stored in the depacker body.


use std::sync::LazyLock;

use display_bytes::DisplayBytesSlice;
use tracing::{debug, trace};

use crate::DecodedResult;
use crate::back_copy::Decoded;
use crate::data_movement::DataMovement;
use crate::error::DecompressionError;
use crate::io_util::{ByteStream, EofPolicy, word_at};
use crate::pattern::DepackerPattern;


const MAX_DECODED_SIZE: usize = 0xC000;

const KEY_TABLE_SIZE: usize = 0x80;

// the slot of the key table that doubles as the running key index
const KEY_INDEX_SLOT: usize = 0x6E;

static DEPACKER_SIMPLE: LazyLock<DepackerPattern> = LazyLock::new(|| {
    DepackerPattern::compile(
        concat!(
            "21??",    // ld hl,nn (depacker body source)
            "11??",    // ld de,nn (depacker body target)
            "01??",    // ld bc,nn (depacker body size)
            "d5",      // push de
            "edb0",    // ldir
            "21??",    // ld hl,nn (packed source)
            "11??",    // ld de,nn (packed target)
            "01??",    // ld bc,nn (packed size)
            "c9",      // ret
            "ed?",     // ldir/lddr
            "11??",    // ld de,nn (depack target)
            "21??",    // ld hl,nn (depack source - 1)
            "23",      // inc hl
            "7e",      // ld a,(hl)
            "0f",      // rrca
            "30?",     // jr nc,...
            "77",      // ld (hl),a
            "e60f",    // and 0x0f
        ),
        TurboLzVersion::Simple.header_size(),
    ).expect("failed to compile Turbo-LZ depacker pattern")
});

static DEPACKER_PROTECTED: LazyLock<DepackerPattern> = LazyLock::new(|| {
    DepackerPattern::compile(
        concat!(
            "21??",    // ld hl,nn (depacker body source)
            "11??",    // ld de,nn (depacker body target)
            "01??",    // ld bc,nn (depacker body size)
            "d5",      // push de
            "edb0",    // ldir
            "21??",    // ld hl,nn (packed source)
            "11??",    // ld de,nn (packed target)
            "01??",    // ld bc,nn (packed size)
            "dde1",    // pop ix
            "dde9",    // jp (ix)
            "ed?",     // ldir/lddr
            "11??",    // ld de,nn (depack target)
            "21??",    // ld hl,nn (depack source - 1)
            "23",      // inc hl
            "7e",      // ld a,(hl)
            "0f",      // rrca
            "d2??",    // jp nc,...
            "77",      // ld (hl),a
            "e60f",    // and 0x0f
        ),
        TurboLzVersion::Protected.header_size(),
    ).expect("failed to compile protected Turbo-LZ depacker pattern")
});


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum TurboLzVersion {
    Simple,
    Protected,
}
impl TurboLzVersion {
    pub fn description(&self) -> &'static str {
        match self {
            Self::Simple => "Turbo-LZ v1.x",
            Self::Protected => "Turbo#LZ v1.x (internal)",
        }
    }

    pub fn signature(&self) -> &'static DepackerPattern {
        match self {
            Self::Simple => &DEPACKER_SIMPLE,
            Self::Protected => &DEPACKER_PROTECTED,
        }
    }

    fn header_size(&self) -> usize {
        match self {
            Self::Simple => 0x44,
            Self::Protected => 0x88,
        }
    }

    /// Offset of the depacker body; the header fields behind the copy opcode shift with it.
    fn fixed_part_size(&self) -> usize {
        match self {
            Self::Simple => 0x16,
            Self::Protected => 0x19,
        }
    }

    fn last_byte_offset(&self) -> usize {
        match self {
            Self::Simple => 0x43,
            Self::Protected => 0x4C,
        }
    }

    pub fn check(&self, data: &[u8]) -> bool {
        TurboLzHeader::read(*self, data)
            .and_then(|header| header.packed_range(data.len()))
            .is_ok()
    }

    pub fn decode(&self, data: &[u8]) -> Option<DecodedResult> {
        crate::report(self.description(), self.try_decode(data))
    }

    pub fn try_decode(&self, data: &[u8]) -> Result<DecodedResult, DecompressionError> {
        let header = TurboLzHeader::read(*self, data)?;
        let (offset, end) = header.packed_range(data.len())?;
        let key = LiteralKey::read(*self, data)?;
        debug!(
            "{}: packed {:#06X} -> {:#06X}, {} of {:#X} bytes present, unpacking to {:#06X}",
            self.description(), header.packed_source, header.packed_target, end - offset,
            header.packed_size, header.depack_target,
        );

        let (bytes, processed) = decode_stream(&data[offset..end], header.last_byte, key)?;
        if bytes.is_empty() {
            return Err(DecompressionError::NoOutput);
        }
        Ok(DecodedResult {
            bytes,
            consumed: offset + processed,
        })
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct TurboLzHeader {
    pub version: TurboLzVersion,
    pub depacker_body_size: u16,
    pub packed_source: u16,
    pub packed_target: u16,
    pub packed_size: u16,
    pub copy_opcode: u8,
    pub depack_target: u16,
    pub depack_pre_source: u16,
    pub last_byte: u8,
}
impl TurboLzHeader {
    pub fn read(version: TurboLzVersion, data: &[u8]) -> Result<Self, DecompressionError> {
        let header_size = version.header_size();
        if data.len() < header_size {
            return Err(DecompressionError::TooShort { needed: header_size, available: data.len() });
        }
        if !version.signature().matches(data) {
            return Err(DecompressionError::SignatureMismatch);
        }
        let fixed = version.fixed_part_size();
        Ok(Self {
            version,
            depacker_body_size: word_at(data, 0x07),
            packed_source: word_at(data, 0x0D),
            packed_target: word_at(data, 0x10),
            packed_size: word_at(data, 0x13),
            copy_opcode: data[fixed + 1],
            depack_target: word_at(data, fixed + 3),
            depack_pre_source: word_at(data, fixed + 6),
            last_byte: data[version.last_byte_offset()],
        })
    }

    pub fn packed_data_offset(&self) -> usize {
        self.version.fixed_part_size() + usize::from(self.depacker_body_size)
    }

    /// Validates the header and returns the range of the packed data within `available` bytes.
    ///
    /// The stored packed size overstates the data in some files, so the range ends at the end of
    /// the input at the latest.
    pub fn packed_range(&self, available: usize) -> Result<(usize, usize), DecompressionError> {
        let movement = DataMovement::new(self.packed_source, self.packed_target, self.packed_size, self.copy_opcode);
        if !movement.is_valid() {
            return Err(DecompressionError::InvalidDataMovement);
        }
        if u32::from(movement.first_of_moved_data()) != u32::from(self.depack_pre_source) + 1 {
            return Err(DecompressionError::InvalidHeader("moved data does not start where unpacking starts"));
        }
        let offset = self.packed_data_offset();
        if offset >= available {
            return Err(DecompressionError::TooShort { needed: offset + 1, available });
        }
        let end = (offset + usize::from(self.packed_size)).min(available);
        Ok((offset, end))
    }
}


/// The source of the bytes that literals are XORed with.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
enum LiteralKey {
    Plain,
    Table(Box<[u8; KEY_TABLE_SIZE]>),
}
impl LiteralKey {
    fn read(version: TurboLzVersion, data: &[u8]) -> Result<Self, DecompressionError> {
        match version {
            TurboLzVersion::Simple => Ok(Self::Plain),
            TurboLzVersion::Protected => {
                let start = version.fixed_part_size();
                let end = start + KEY_TABLE_SIZE;
                if data.len() < end {
                    return Err(DecompressionError::TooShort { needed: end, available: data.len() });
                }
                let mut table = Box::new([0u8; KEY_TABLE_SIZE]);
                table.copy_from_slice(&data[start..end]);
                Ok(Self::Table(table))
            },
        }
    }

    fn next(&mut self) -> u8 {
        match self {
            Self::Plain => 0x00,
            Self::Table(table) => {
                let index = (table[KEY_INDEX_SLOT].wrapping_add(1)) & 0x7F;
                table[KEY_INDEX_SLOT] = index;
                table[usize::from(index)]
            },
        }
    }
}


/// Appends up to `len` keyed literals; returns whether the stream held all of them.
fn copy_literals(
    stream: &mut ByteStream<'_, false>,
    decoded: &mut Decoded,
    len: usize,
    key: &mut LiteralKey,
) -> Result<bool, DecompressionError> {
    for _ in 0..len {
        if stream.eof() {
            return Ok(false);
        }
        let b = stream.get_byte()?;
        decoded.add_byte(b ^ key.next());
    }
    Ok(true)
}


fn decode_stream(stream_data: &[u8], last_byte: u8, mut key: LiteralKey) -> Result<(Vec<u8>, usize), DecompressionError> {
    let mut stream = ByteStream::new_forward(stream_data, EofPolicy::Saturating);
    let mut decoded = Decoded::new(MAX_DECODED_SIZE, 2 * stream_data.len());

    while !stream.eof() && !decoded.is_full() {
        let token = stream.get_byte()?;
        if token == 0x00 {
            // the rest of the block is stored as is
            let rest = &stream_data[stream.processed()..];
            trace!("end marker, {} stored bytes: {}", rest.len(), DisplayBytesSlice::from(rest));
            decoded.add_byte(last_byte);
            decoded.add_slice(rest);
            return Ok((decoded.into_vec(), stream_data.len()));
        }

        if token & 0x01 != 0 {
            let offset = 256 * usize::from((token & 0x1E) >> 1) + usize::from(stream.get_byte()?);
            let len = if token & 0xE0 == 0xE0 {
                usize::from(stream.get_byte()?)
            } else {
                3 + usize::from(token >> 5)
            };
            decoded.copy_from_back(offset + 1, len)?;
        } else if token & 0x03 == 0x02 {
            let filler = stream.get_byte()?;
            let mut len = usize::from(token >> 2) + 3;
            let mut continuation_marker = 63 + 3;
            while len != 0 {
                decoded.fill(len, filler);
                if len != continuation_marker {
                    break;
                }
                len = usize::from(stream.get_byte()?);
                continuation_marker = 0xFF;
            }
        } else {
            let mut len = usize::from(token >> 2);
            let mut continuation_marker = 63;
            while len != 0 {
                if !copy_literals(&mut stream, &mut decoded, len, &mut key)? {
                    // a cut literal run ends the data
                    trace!("literal run cut short");
                    return Ok((decoded.into_vec(), stream.processed()));
                }
                if len != continuation_marker {
                    break;
                }
                len = usize::from(stream.get_byte()?);
                continuation_marker = 0xFF;
            }
        }
    }
    Ok((decoded.into_vec(), stream.processed().min(stream_data.len())))
}


#[cfg(test)]
mod tests {
    use super::{KEY_INDEX_SLOT, LiteralKey, TurboLzVersion, decode_stream};
    use crate::error::DecompressionError;
    use crate::pattern::assemble;
    use tracing_test::traced_test;

    const DEPACKER_SIMPLE_TEXT: &str = "21?? 11?? 01?? d5 edb0 21?? 11?? 01?? c9 ed? 11?? 21?? 23 7e 0f 30? 77 e60f";
    const DEPACKER_PROTECTED_TEXT: &str =
        "21?? 11?? 01?? d5 edb0 21?? 11?? 01?? dde1 dde9 ed? 11?? 21?? 23 7e 0f d2?? 77 e60f";

    fn packed(version: TurboLzVersion, stream: &[u8]) -> Vec<u8> {
        let (text, body_size) = match version {
            TurboLzVersion::Simple => (DEPACKER_SIMPLE_TEXT, 0x2Eu16),
            TurboLzVersion::Protected => (DEPACKER_PROTECTED_TEXT, 0x80u16),
        };
        let mut data = assemble(text);
        let fixed = version.fixed_part_size();
        data.resize(fixed + usize::from(body_size), 0x00);
        // LDDR to the top of memory, unpacking starts at the first moved byte
        let size = stream.len() as u16;
        data[0x07..0x09].copy_from_slice(&body_size.to_le_bytes());
        data[0x0D..0x0F].copy_from_slice(&0x9FFFu16.to_le_bytes());
        data[0x10..0x12].copy_from_slice(&0xFFFFu16.to_le_bytes());
        data[0x13..0x15].copy_from_slice(&size.to_le_bytes());
        data[fixed + 1] = 0xB8;
        data[fixed + 3..fixed + 5].copy_from_slice(&0x6000u16.to_le_bytes());
        data[fixed + 6..fixed + 8].copy_from_slice(&(0xFFFF - size).to_le_bytes());
        data[version.last_byte_offset()] = b'!';
        data.extend_from_slice(stream);
        data
    }

    // "abc", three bytes from three back, four times 'z', end marker, stored tail
    const STREAM: [u8; 12] = [0x0C, b'a', b'b', b'c', 0x01, 0x02, 0x06, b'z', 0x00, b't', b'a', b'g'];

    #[test]
    #[traced_test]
    fn test_decode_simple() {
        let data = packed(TurboLzVersion::Simple, &STREAM);
        assert!(TurboLzVersion::Simple.check(&data));
        assert!(!TurboLzVersion::Protected.check(&data));
        let result = TurboLzVersion::Simple.decode(&data).unwrap();
        assert_eq!(result.bytes, b"abcabczzzz!tag");
        assert_eq!(result.consumed, data.len());
    }

    #[test]
    #[traced_test]
    fn test_decode_protected() {
        let mut data = packed(TurboLzVersion::Protected, &STREAM);
        // the key index starts at 0x3F; literals use table slots 0x40 to 0x42
        data[0x19 + KEY_INDEX_SLOT] = 0x3F;
        data[0x19 + 0x40] = 0x01;
        data[0x19 + 0x41] = 0x02;
        data[0x19 + 0x42] = 0x03;
        let offset = 0x99;
        data[offset + 1] ^= 0x01;
        data[offset + 2] ^= 0x02;
        data[offset + 3] ^= 0x03;

        assert!(TurboLzVersion::Protected.check(&data));
        assert!(!TurboLzVersion::Simple.check(&data));
        let result = TurboLzVersion::Protected.decode(&data).unwrap();
        // the stored tail is not keyed
        assert_eq!(result.bytes, b"abcabczzzz!tag");
        assert_eq!(result.consumed, data.len());
    }

    #[test]
    fn test_key_index_lives_in_table() {
        let mut table = Box::new([0u8; 0x80]);
        table[KEY_INDEX_SLOT] = 0x6D;
        table[0x6F] = 0x55;
        let mut key = LiteralKey::Table(table);
        // the next slot is the index itself
        assert_eq!(key.next(), 0x6E);
        assert_eq!(key.next(), 0x55);
        assert_eq!(LiteralKey::Plain.next(), 0x00);
    }

    #[test]
    fn test_long_runs() {
        // 66 'q' continued by 255 and then 2 more, 63 literals continued by none
        let mut stream = vec![0xFE, b'q', 0xFF, 0x02, 0xFC];
        stream.extend_from_slice(&[b'l'; 63]);
        stream.push(0x00);
        let (bytes, processed) = decode_stream(&stream, b'!', LiteralKey::Plain).unwrap();
        assert_eq!(bytes.len(), 66 + 255 + 2 + 63);
        assert!(bytes[..323].iter().all(|b| *b == b'q'));
        assert!(bytes[323..].iter().all(|b| *b == b'l'));
        assert_eq!(processed, stream.len());

        // long copy with an explicit length
        let (bytes, _) = decode_stream(&[0x04, b'x', 0xE1, 0x00, 0x10], b'!', LiteralKey::Plain).unwrap();
        assert_eq!(bytes, vec![b'x'; 17]);
    }

    #[test]
    fn test_cut_literal_run() {
        let (bytes, processed) = decode_stream(&[0x14, b'a', b'b'], b'!', LiteralKey::Plain).unwrap();
        assert_eq!(bytes, b"ab");
        assert_eq!(processed, 3);
        assert_eq!(
            decode_stream(&[0x0C, b'a', b'b', b'c', 0x01, 0x05], b'!', LiteralKey::Plain),
            Err(DecompressionError::InvalidBackReference { offset: 6, available: 3 }),
        );
    }

    #[test]
    fn test_output_ceiling() {
        // 'x' then copies of 255 bytes from one back, far more than the ceiling
        let mut stream = vec![0x04, b'x'];
        for _ in 0..250 {
            stream.extend_from_slice(&[0xE1, 0x00, 0xFF]);
        }
        let data = packed(TurboLzVersion::Simple, &stream);
        let result = TurboLzVersion::Simple.decode(&data).unwrap();
        assert_eq!(result.bytes.len(), 0xC000);
        assert!(result.consumed < data.len());
    }

    #[test]
    fn test_header_rejection() {
        let mut data = packed(TurboLzVersion::Simple, &STREAM);
        data[0x1C] ^= 0x01;
        assert_eq!(
            TurboLzVersion::Simple.try_decode(&data),
            Err(DecompressionError::InvalidHeader("moved data does not start where unpacking starts")),
        );

        let mut data = packed(TurboLzVersion::Simple, &STREAM);
        data[0x17] = 0xB1;
        assert_eq!(TurboLzVersion::Simple.try_decode(&data), Err(DecompressionError::InvalidDataMovement));

        let data = packed(TurboLzVersion::Protected, &STREAM);
        assert_eq!(
            TurboLzVersion::Protected.try_decode(&data[..0x90]),
            Err(DecompressionError::TooShort { needed: 0x9A, available: 0x90 }),
        );
    }

    #[test]
    fn test_truncations() {
        let data = packed(TurboLzVersion::Simple, &STREAM);
        let offset = 0x44;
        for end in 0..=offset {
            assert!(TurboLzVersion::Simple.decode(&data[..end]).is_none());
        }
        // the packed size is clipped to the input
        for end in offset + 1..data.len() {
            if let Some(result) = TurboLzVersion::Simple.decode(&data[..end]) {
                assert!(result.consumed <= end);
                assert!(!result.bytes.is_empty());
            }
        }
        let result = TurboLzVersion::Simple.decode(&data[..offset + 3]).unwrap();
        assert_eq!(result.bytes, b"ab");
        assert_eq!(result.consumed, offset + 3);
    }
}
