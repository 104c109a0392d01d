//! LZH Compressor 1.4 and 2.4.
//!
//! Both versions share the depacker layout and the byte-oriented command set; they differ in how
//! a back-reference command byte splits into a length and the high bits of the distance.


use std::sync::LazyLock;

use tracing::{debug, trace};

use crate::DecodedResult;
use crate::back_copy::Decoded;
use crate::data_movement::DataMovement;
use crate::error::DecompressionError;
use crate::io_util::{ByteStream, EofPolicy, word_at};
use crate::pattern::DepackerPattern;


const MAX_DECODED_SIZE: usize = 0xC000;

// the depacker body, and after it the packed data, starts here
const DEPACKER_BODY_OFFSET: usize = 0x17;

static DEPACKER_V1: LazyLock<DepackerPattern> = LazyLock::new(|| {
    DepackerPattern::compile(
        concat!(
            "?",       // di/ei
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
            "eb",      // ex de,hl
            "11??",    // ld de,nn (unpack target)
            "23",      // inc hl
            "7e",      // ld a,(hl)
            "cb7f",    // bit 7,a
            "28?",     // jr z,...
            "e60f",    // and 0x0f
            "c603",    // add a,3
            "4f",      // ld c,a
            "ed6f",    // rld
            "e607",    // and 7
            "47",      // ld b,a
            "23",      // inc hl
            "e5",      // push hl
            "7b",      // ld a,e
            "96",      // sub (hl)
            "6f",      // ld l,a
        ),
        LzhVersion::V1.header_size(),
    ).expect("failed to compile LZH 1 depacker pattern")
});

static DEPACKER_V2: LazyLock<DepackerPattern> = LazyLock::new(|| {
    DepackerPattern::compile(
        concat!(
            "?",       // di/ei
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
            "eb",      // ex de,hl
            "11??",    // ld de,nn (unpack target)
            "23",      // inc hl
            "7e",      // ld a,(hl)
            "cb7f",    // bit 7,a
            "28?",     // jr z,...
            "e60f",    // and 0x0f
            "47",      // ld b,a
            "ed6f",    // rld
            "d605",    // sub 5
            "4f",      // ld c,a
            "23",      // inc hl
            "e5",      // push hl
            "7b",      // ld a,e
            "96",      // sub (hl)
            "6f",      // ld l,a
        ),
        LzhVersion::V2.header_size(),
    ).expect("failed to compile LZH 2 depacker pattern")
});


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum LzhVersion {
    V1,
    V2,
}
impl LzhVersion {
    pub fn description(&self) -> &'static str {
        match self {
            Self::V1 => "LZH Compressor v1.4",
            Self::V2 => "LZH Compressor v2.4",
        }
    }

    pub fn signature(&self) -> &'static DepackerPattern {
        match self {
            Self::V1 => &DEPACKER_V1,
            Self::V2 => &DEPACKER_V2,
        }
    }

    fn header_size(&self) -> usize {
        match self {
            Self::V1 => 0x58,
            Self::V2 => 0x56,
        }
    }

    fn last_depacked_byte_offset(&self) -> usize {
        self.header_size() - 1
    }

    /// Splits a back-reference command into its length and the high part of its distance.
    fn split_reference(&self, command: u8) -> (usize, usize) {
        let command = usize::from(command);
        match self {
            Self::V1 => ((command & 0x0F) + 3, (command & 0x70) << 4),
            // the high nibble is at least 8 here
            Self::V2 => ((command >> 4) - 5, (command & 0x0F) << 8),
        }
    }

    pub fn check(&self, data: &[u8]) -> bool {
        LzhHeader::read(*self, data)
            .and_then(|header| header.validate(data.len()))
            .is_ok()
    }

    pub fn decode(&self, data: &[u8]) -> Option<DecodedResult> {
        crate::report(self.description(), self.try_decode(data))
    }

    pub fn try_decode(&self, data: &[u8]) -> Result<DecodedResult, DecompressionError> {
        let header = LzhHeader::read(*self, data)?;
        header.validate(data.len())?;
        debug!(
            "{}: packed {:#06X} -> {:#06X}, size {:#X}, depacker body {:#X} bytes",
            self.description(), header.packed_source, header.packed_target, header.packed_size,
            header.depacker_body_size,
        );

        let bytes = decode_stream(&data[header.packed_data_offset()..header.used_size()], &header)?;
        Ok(DecodedResult {
            bytes,
            consumed: header.used_size(),
        })
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct LzhHeader {
    pub version: LzhVersion,
    pub depacker_body_size: u16,
    pub packed_source: u16,
    pub packed_target: u16,
    pub packed_size: u16,
    pub copy_opcode: u8,
    pub last_depacked_byte: u8,
}
impl LzhHeader {
    pub fn read(version: LzhVersion, data: &[u8]) -> Result<Self, DecompressionError> {
        let header_size = version.header_size();
        if data.len() < header_size {
            return Err(DecompressionError::TooShort { needed: header_size, available: data.len() });
        }
        if !version.signature().matches(data) {
            return Err(DecompressionError::SignatureMismatch);
        }
        Ok(Self {
            version,
            depacker_body_size: word_at(data, 0x08),
            packed_source: word_at(data, 0x0E),
            packed_target: word_at(data, 0x11),
            packed_size: word_at(data, 0x14),
            copy_opcode: data[0x18],
            last_depacked_byte: data[version.last_depacked_byte_offset()],
        })
    }

    pub fn packed_data_offset(&self) -> usize {
        DEPACKER_BODY_OFFSET + usize::from(self.depacker_body_size)
    }

    pub fn used_size(&self) -> usize {
        self.packed_data_offset() + usize::from(self.packed_size)
    }

    pub fn validate(&self, available: usize) -> Result<(), DecompressionError> {
        let movement = DataMovement::new(self.packed_source, self.packed_target, self.packed_size, self.copy_opcode);
        if !movement.is_valid() {
            return Err(DecompressionError::InvalidDataMovement);
        }
        let used_size = self.used_size();
        if used_size > available {
            return Err(DecompressionError::TooShort { needed: used_size, available });
        }
        Ok(())
    }
}


fn decode_stream(stream_data: &[u8], header: &LzhHeader) -> Result<Vec<u8>, DecompressionError> {
    let mut stream = ByteStream::new_forward(stream_data, EofPolicy::Saturating);
    let mut decoded = Decoded::new(MAX_DECODED_SIZE, 2 * stream_data.len());

    while !stream.eof() && !decoded.is_full() {
        let command = stream.get_byte()?;
        if command == 0x00 {
            trace!("end marker");
            break;
        }
        if command & 0x80 != 0 {
            let (len, distance_high) = header.version.split_reference(command);
            let offset = distance_high + usize::from(stream.get_byte()?) + 2;
            trace!("copy {} bytes from {} back", len, offset);
            decoded.copy_from_back(offset, len)?;
        } else if command & 0x40 != 0 {
            let len = usize::from(command) - 0x3D;
            let filler = stream.get_byte()?;
            decoded.fill(len, filler);
        } else {
            let len = usize::from(command);
            if stream_data.len().saturating_sub(stream.processed()) < len {
                return Err(DecompressionError::UnexpectedEof);
            }
            decoded.generate(len, || stream.get_byte())?;
        }
    }
    decoded.add_byte(header.last_depacked_byte);
    Ok(decoded.into_vec())
}
