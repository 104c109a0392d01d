//! ASC LZS Pack.
//!
//! A plain byte-oriented scheme: every command byte selects a literal run, a fill, or a
//! back-reference with a 12-bit distance.


use std::sync::LazyLock;

use tracing::{debug, trace};

use crate::DecodedResult;
use crate::back_copy::Decoded;
use crate::data_movement::DataMovement;
use crate::error::DecompressionError;
use crate::io_util::{ByteStream, EofPolicy, word_at};
use crate::pattern::DepackerPattern;


pub const DESCRIPTION: &str = "ASC LZS Pack";

const MAX_DECODED_SIZE: usize = 0xC000;
const HEADER_SIZE: usize = 0x83;
const PACKED_DATA_OFFSET: usize = 0x82;

const END_MARKER: u8 = 0x80;
const RET_OPCODE: u8 = 0xC9;

static DEPACKER: LazyLock<DepackerPattern> = LazyLock::new(|| {
    DepackerPattern::compile(
        concat!(
            "cd??",    // call nn
            "?",       // di/nop
            "ed73??",  // ld (nn),sp
            "21??",    // ld hl,nn
            "11??",    // ld de,nn
            "01??",    // ld bc,nn
            "d5",      // push de
            "edb0",    // ldir
            "21??",    // ld hl,nn (packed source)
            "11??",    // ld de,nn (packed target)
            "01??",    // ld bc,nn (packed size)
            "c9",      // ret
            "ed?",     // lddr/ldir
            "21??",    // ld hl,nn (first of moved data)
            "11??",    // ld de,nn (unpack target)
            "06?",     // ld b,n
            "7e",      // ld a,(hl)
            "cb7f",    // bit 7,a
            "201d",    // jr nz,...
            "e6?",     // and n
            "47",      // ld b,a
            "ed6f",    // rld
            "c6?",     // add a,n
            "4f",      // ld c,a
            "23",      // inc hl
            "7b",      // ld a,e
            "96",      // sub (hl)
            "23",      // inc hl
            "f9",      // ld sp,hl
            "66",      // ld h,(hl)
            "6f",      // ld l,a
            "7a",      // ld a,d
            "98",      // sbc a,b
            "44",      // ld b,h
            "67",      // ld h,a
            "78",      // ld a,b
            "06?",     // ld b,n
            "edb0",    // ldir
            "60",      // ld h,b
            "69",      // ld l,c
            "39",      // add hl,sp
            "18df",    // jr ...
        ),
        HEADER_SIZE,
    ).expect("failed to compile LZS depacker pattern")
});


#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct LzsHeader {
    pub packed_source: u16,
    pub packed_target: u16,
    pub packed_size: u16,
    pub copy_opcode: u8,
    pub first_of_packed: u16,
}
impl LzsHeader {
    pub fn read(data: &[u8]) -> Result<Self, DecompressionError> {
        if data.len() < HEADER_SIZE {
            return Err(DecompressionError::TooShort { needed: HEADER_SIZE, available: data.len() });
        }
        if !DEPACKER.matches(data) {
            return Err(DecompressionError::SignatureMismatch);
        }
        Ok(Self {
            packed_source: word_at(data, 0x15),
            packed_target: word_at(data, 0x18),
            packed_size: word_at(data, 0x1B),
            copy_opcode: data[0x1F],
            first_of_packed: word_at(data, 0x21),
        })
    }

    fn packed_end(&self) -> usize {
        PACKED_DATA_OFFSET + usize::from(self.packed_size)
    }

    /// The packed data, plus the `ret` that some versions leave behind it.
    pub fn used_size(&self, data: &[u8]) -> usize {
        let packed_end = self.packed_end();
        if data.get(packed_end) == Some(&RET_OPCODE) {
            packed_end + 1
        } else {
            packed_end
        }
    }

    pub fn validate(&self, data: &[u8]) -> Result<(), DecompressionError> {
        let movement = DataMovement::new(self.packed_source, self.packed_target, self.packed_size, self.copy_opcode);
        if !movement.is_valid() {
            return Err(DecompressionError::InvalidDataMovement);
        }
        if movement.first_of_moved_data() != self.first_of_packed {
            return Err(DecompressionError::InvalidHeader("moved data does not start where unpacking starts"));
        }
        let used_size = self.used_size(data);
        if used_size > data.len() {
            return Err(DecompressionError::TooShort { needed: used_size, available: data.len() });
        }
        Ok(())
    }
}


pub fn check(data: &[u8]) -> bool {
    LzsHeader::read(data)
        .and_then(|header| header.validate(data))
        .is_ok()
}


pub fn signature() -> &'static DepackerPattern { &DEPACKER }


pub fn decode(data: &[u8]) -> Option<DecodedResult> {
    crate::report(DESCRIPTION, try_decode(data))
}


pub fn try_decode(data: &[u8]) -> Result<DecodedResult, DecompressionError> {
    let header = LzsHeader::read(data)?;
    header.validate(data)?;
    debug!(
        "LZS: packed {:#06X} -> {:#06X}, size {:#X}",
        header.packed_source, header.packed_target, header.packed_size,
    );

    let bytes = decode_stream(&data[PACKED_DATA_OFFSET..header.packed_end()])?;
    if bytes.is_empty() {
        return Err(DecompressionError::NoOutput);
    }
    Ok(DecodedResult {
        bytes,
        consumed: header.used_size(data),
    })
}


fn decode_stream(stream_data: &[u8]) -> Result<Vec<u8>, DecompressionError> {
    let mut stream = ByteStream::new_forward(stream_data, EofPolicy::Saturating);
    let mut decoded = Decoded::new(MAX_DECODED_SIZE, 2 * stream_data.len());

    while !stream.eof() && !decoded.is_full() {
        let command = stream.get_byte()?;
        if command == END_MARKER {
            trace!("end marker");
            break;
        }
        if stream.eof() {
            return Err(DecompressionError::UnexpectedEof);
        }
        match command & 0xC0 {
            0x80 => {
                let count = usize::from(command & 0x3F);
                let available = stream_data.len() - stream.processed();
                if count > available {
                    return Err(DecompressionError::UnexpectedEof);
                }
                decoded.generate(count, || stream.get_byte())?;
            },
            0xC0 => {
                let count = usize::from(command & 0x3F) + 3;
                let filler = stream.get_byte()?;
                decoded.fill(count, filler);
            },
            _ => {
                let count = usize::from(command >> 4) + 3;
                let offset = 256 * usize::from(command & 0x0F) + usize::from(stream.get_byte()?);
                trace!("copy {} bytes from {} back", count, offset);
                decoded.copy_from_back(offset, count)?;
            },
        }
    }

    // anything after the end marker is stored verbatim
    let rest: Vec<u8> = stream.remaining().collect();
    decoded.add_slice(&rest);
    Ok(decoded.into_vec())
}
