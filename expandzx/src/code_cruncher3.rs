//! CodeCruncher 3.x.
//!
//! A byte-oriented packer whose command byte carries both the operation and its short arguments;
//! the packed data runs up to a finish marker somewhere before the end of the input.


use std::sync::LazyLock;

use tracing::{debug, trace};

use crate::DecodedResult;
use crate::back_copy::Decoded;
use crate::data_movement::DataMovement;
use crate::error::DecompressionError;
use crate::io_util::{ByteStream, EofPolicy, word_at};
use crate::pattern::DepackerPattern;


pub const DESCRIPTION: &str = "CodeCruncher v3.x";

const MAX_DECODED_SIZE: usize = 0xC000;
const HEADER_SIZE: usize = 0x9A;
const PACKED_DATA_OFFSET: usize = 0x99;

static DEPACKER: LazyLock<DepackerPattern> = LazyLock::new(|| {
    DepackerPattern::compile(
        concat!(
            "?",       // di/nop
            "???",     // usually "KSA"
            "21??",    // ld hl,nn
            "11??",    // ld de,nn
            "017f00",  // ld bc,0x007f
            "d5",      // push de
            "edb0",    // ldir
            "21??",    // ld hl,nn (packed source)
            "11??",    // ld de,nn (packed target)
            "01??",    // ld bc,nn (packed size)
            "c9",      // ret
            "ed?",     // lddr/ldir
            "21??",    // ld hl,nn (first of moved data)
            "11??",    // ld de,nn (unpack target)
            "7e",      // ld a,(hl)
            "cb3f",    // srl a
            "382b",    // jr c,...
            "e607",    // and 7
            "47",      // ld b,a
            "ed6f",    // rld
            "23",      // inc hl
            "4e",      // ld c,(hl)
            "23",      // inc hl
            "e5",      // push hl
            "08",      // ex af,af'
            "7e",      // ld a,(hl)
            "08",      // ex af,af'
            "62",      // ld h,d
            "6b",      // ld l,e
            "ed42",    // sbc hl,bc
            "0600",    // ld b,0
            "3c",      // inc a
            "4f",      // ld c,a
            "03",      // inc bc
            "03",      // inc bc
            "edb0",    // ldir
            "fe10",    // cp 0x10
            "200b",    // jr nz,...
            "e3",      // ex (sp),hl
            "23",      // inc hl
            "7e",      // ld a,(hl)
            "e3",      // ex (sp),hl
            "08",      // ex af,af'
            "4f",      // ld c,a
            "b7",      // or a
            "2802",    // jr z,...
            "edb0",    // ldir
            "08",      // ex af,af'
            "e1",      // pop hl
            "18d1",    // jr ...
        ),
        HEADER_SIZE,
    ).expect("failed to compile CodeCruncher 3 depacker pattern")
});


#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct CodeCruncher3Header {
    pub packed_source: u16,
    pub packed_target: u16,
    pub packed_size: u16,
    pub copy_opcode: u8,
    pub first_of_packed: u16,
}
impl CodeCruncher3Header {
    pub fn read(data: &[u8]) -> Result<Self, DecompressionError> {
        if data.len() < HEADER_SIZE {
            return Err(DecompressionError::TooShort { needed: HEADER_SIZE, available: data.len() });
        }
        if !DEPACKER.matches(data) {
            return Err(DecompressionError::SignatureMismatch);
        }
        Ok(Self {
            packed_source: word_at(data, 0x11),
            packed_target: word_at(data, 0x14),
            packed_size: word_at(data, 0x17),
            copy_opcode: data[0x1B],
            first_of_packed: word_at(data, 0x1D),
        })
    }

    pub fn validate(&self) -> Result<(), DecompressionError> {
        let movement = DataMovement::new(self.packed_source, self.packed_target, self.packed_size, self.copy_opcode);
        if !movement.is_valid() {
            return Err(DecompressionError::InvalidDataMovement);
        }
        if movement.first_of_moved_data() != self.first_of_packed {
            return Err(DecompressionError::InvalidHeader("moved data does not start where unpacking starts"));
        }
        Ok(())
    }
}


fn is_finish_marker(command: u8) -> bool {
    command & 0x0F == 0x03
}


pub fn check(data: &[u8]) -> bool {
    CodeCruncher3Header::read(data)
        .and_then(|header| header.validate())
        .is_ok()
}


pub fn signature() -> &'static DepackerPattern { &DEPACKER }


pub fn decode(data: &[u8]) -> Option<DecodedResult> {
    crate::report(DESCRIPTION, try_decode(data))
}


pub fn try_decode(data: &[u8]) -> Result<DecodedResult, DecompressionError> {
    let header = CodeCruncher3Header::read(data)?;
    header.validate()?;
    debug!(
        "CodeCruncher 3: packed {:#06X} -> {:#06X}, size {:#X}",
        header.packed_source, header.packed_target, header.packed_size,
    );

    let (bytes, processed) = decode_stream(&data[PACKED_DATA_OFFSET..], usize::from(header.packed_size))?;
    if bytes.is_empty() {
        return Err(DecompressionError::NoOutput);
    }
    Ok(DecodedResult {
        bytes,
        consumed: PACKED_DATA_OFFSET + processed,
    })
}


/// Returns the unpacked data and the number of stream bytes up to and including the marker.
fn decode_stream(stream_data: &[u8], packed_size: usize) -> Result<(Vec<u8>, usize), DecompressionError> {
    let mut stream = ByteStream::new_forward(stream_data, EofPolicy::Saturating);
    let mut decoded = Decoded::new(MAX_DECODED_SIZE, 2 * packed_size);

    while !stream.eof() && !decoded.is_full() {
        let command = stream.get_byte()?;
        if is_finish_marker(command) {
            trace!("finish marker after {} bytes", stream.processed());
            return Ok((decoded.into_vec(), stream.processed()));
        }
        if stream.eof() {
            return Err(DecompressionError::UnexpectedEof);
        }

        let lo_nibble = usize::from(command & 0x0F);
        let hi_nibble = usize::from(command >> 4);
        if command & 0x01 == 0 {
            let offset = 128 * lo_nibble + usize::from(stream.get_byte()?);
            let mut len = hi_nibble + 3;
            if hi_nibble == 0x0F {
                len += usize::from(stream.get_byte()?);
            }
            trace!("copy {} bytes from {} back", len, offset);
            decoded.copy_from_back(offset, len)?;
            continue;
        }
        match lo_nibble {
            0x01 => {
                let len = 256 * hi_nibble + usize::from(stream.get_byte()?) + 3;
                let filler = stream.get_byte()?;
                decoded.fill(len, filler);
            },
            0x05 => {
                decoded.generate(hi_nibble + 1, || stream.get_byte())?;
            },
            0x09 => {
                let filler = stream.get_byte()?;
                decoded.fill(hi_nibble + 3, filler);
            },
            0x0B => {
                decoded.fill(2, (hi_nibble as u8).wrapping_sub(1));
            },
            0x0D => {
                let len = 256 * hi_nibble + usize::from(stream.get_byte()?) + 1;
                decoded.generate(len, || stream.get_byte())?;
            },
            _ => {
                // 0x07 and 0x0F
                let offset = usize::from((command & 0xF8) >> 3);
                decoded.copy_from_back(offset, 2)?;
            },
        }
    }
    Err(DecompressionError::MissingEndMarker)
}


#[cfg(test)]
mod tests {
    use super::{CodeCruncher3Header, check, decode, decode_stream, try_decode};
    use crate::error::DecompressionError;
    use crate::pattern::assemble;
    use tracing_test::traced_test;

    const DEPACKER_TEXT: &str = concat!(
        "f3 4b5341 21?? 11?? 017f00 d5 edb0 21?? 11?? 01?? c9 ed? 21?? 11?? 7e cb3f 382b e607 47 ed6f",
        "23 4e 23 e5 08 7e 08 62 6b ed42 0600 3c 4f 03 03 edb0 fe10 200b e3 23 7e e3 08 4f b7 2802",
        "edb0 08 e1 18d1",
    );

    fn packed(stream: &[u8]) -> Vec<u8> {
        let mut data = assemble(DEPACKER_TEXT);
        data.resize(0x99, 0x00);
        // LDDR 0xA15B -> 0xFFFF, 0x2B93 bytes
        data[0x11..0x13].copy_from_slice(&0xA15Bu16.to_le_bytes());
        data[0x14..0x16].copy_from_slice(&0xFFFFu16.to_le_bytes());
        data[0x17..0x19].copy_from_slice(&0x2B93u16.to_le_bytes());
        data[0x1B] = 0xB8;
        data[0x1D..0x1F].copy_from_slice(&0xD46Du16.to_le_bytes());
        data.extend_from_slice(stream);
        data
    }

    const STREAM: [u8; 10] = [
        0x15, b'a', b'b',  // two literals
        0x19, b'z',        // four times 'z'
        0x00, 0x06,        // three bytes from six back
        0x17,              // two bytes from two back
        0x2B,              // two bytes of 0x01
        0x03,              // finish
    ];

    #[test]
    #[traced_test]
    fn test_decode() {
        let mut data = packed(&STREAM);
        data.push(0xEE);
        assert!(check(&data));
        let result = decode(&data).unwrap();
        assert_eq!(result.bytes, b"abzzzzabzbz\x01\x01");
        assert_eq!(result.consumed, 0x99 + STREAM.len());
    }

    #[test]
    fn test_commands() {
        // long fill with an empty high part
        let (bytes, processed) = decode_stream(&[0x01, 0x00, b'q', 0x13], 4).unwrap();
        assert_eq!(bytes, vec![b'q'; 3]);
        assert_eq!(processed, 4);

        // long literal run, then two bytes of 0xFF
        let (bytes, _) = decode_stream(&[0x0D, 0x01, b'x', b'y', 0x0B, 0x03], 6).unwrap();
        assert_eq!(bytes, b"xy\xFF\xFF");

        // extended back-reference length
        let (bytes, _) = decode_stream(&[0x05, b'r', 0xF0, 0x01, 0x02, 0x03], 6).unwrap();
        assert_eq!(bytes, vec![b'r'; 1 + 0x12 + 2]);
    }

    #[test]
    fn test_stream_errors() {
        assert_eq!(decode_stream(&[0x05, b'a'], 2), Err(DecompressionError::MissingEndMarker));
        assert_eq!(decode_stream(&[0x15], 1), Err(DecompressionError::UnexpectedEof));
        assert_eq!(
            decode_stream(&[0x05, b'a', 0x00, 0x02, 0x03], 5),
            Err(DecompressionError::InvalidBackReference { offset: 2, available: 1 }),
        );
    }

    #[test]
    fn test_header_rejection() {
        let mut data = packed(&STREAM);
        data[0x1D] = 0x6E;
        assert!(!check(&data));
        assert!(matches!(try_decode(&data), Err(DecompressionError::InvalidHeader(_))));

        let mut data = packed(&STREAM);
        data[0x1B] = 0xB0;
        assert_eq!(try_decode(&data), Err(DecompressionError::InvalidDataMovement));

        let data = packed(&STREAM);
        let header = CodeCruncher3Header::read(&data).unwrap();
        assert_eq!(header.packed_size, 0x2B93);
        assert_eq!(
            try_decode(&data[..0x99]),
            Err(DecompressionError::TooShort { needed: 0x9A, available: 0x99 }),
        );
    }

    #[test]
    fn test_truncations() {
        let data = packed(&STREAM);
        for end in 0..data.len() {
            assert!(decode(&data[..end]).is_none());
        }
    }
}
