//! ESV Cruncher.
//!
//! A close relative of DataSqueezer: the packed block is consumed from its end, literals are
//! whole bytes taken between bit groups, and the window size lives in the depacker code.


use std::sync::LazyLock;

use tracing::{debug, trace};

use crate::DecodedResult;
use crate::back_copy::Decoded;
use crate::data_movement::DataMovement;
use crate::error::DecompressionError;
use crate::io_util::{BitFeed, BitReader, EofPolicy, word_at};
use crate::pattern::DepackerPattern;


pub const DESCRIPTION: &str = "ESV Cruncher";

const MAX_DECODED_SIZE: usize = 0xC000;
const HEADER_SIZE: usize = 0xBB;
const PACKED_DATA_OFFSET: usize = 0xBA;
const MIN_WINDOW_SIZE: u8 = 0x0B;
const MAX_WINDOW_SIZE: u8 = 0x0F;

static DEPACKER: LazyLock<DepackerPattern> = LazyLock::new(|| {
    DepackerPattern::compile(
        concat!(
            "?",       // di/nop
            "21??",    // ld hl,nn
            "11??",    // ld de,nn
            "01a300",  // ld bc,0x00a3
            "d5",      // push de
            "edb0",    // ldir
            "21??",    // ld hl,nn (packed source)
            "11??",    // ld de,nn (packed target)
            "01??",    // ld bc,nn (packed size)
            "c9",      // ret
            "ed?",     // lddr/ldir
            "21??",    // ld hl,nn (last packed byte)
            "010801",  // ld bc,0x0108
            "d9",      // exx
            "e5",      // push hl
            "11??",    // ld de,nn (last depacked byte)
            "210100",  // ld hl,0x0001
        ),
        HEADER_SIZE,
    ).expect("failed to compile ESV Cruncher depacker pattern")
});


#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct EsvHeader {
    pub packed_source: u16,
    pub packed_target: u16,
    pub packed_size: u16,
    pub copy_opcode: u8,
    pub last_of_packed: u16,
    pub last_of_depacked: u16,
    pub window_size: u8,
    pub depacked_limit: u16,
}
impl EsvHeader {
    pub fn read(data: &[u8]) -> Result<Self, DecompressionError> {
        if data.len() < HEADER_SIZE {
            return Err(DecompressionError::TooShort { needed: HEADER_SIZE, available: data.len() });
        }
        if !DEPACKER.matches(data) {
            return Err(DecompressionError::SignatureMismatch);
        }
        Ok(Self {
            packed_source: word_at(data, 0x0E),
            packed_target: word_at(data, 0x11),
            packed_size: word_at(data, 0x14),
            copy_opcode: data[0x18],
            last_of_packed: word_at(data, 0x1A),
            last_of_depacked: word_at(data, 0x22),
            window_size: data[0x8C],
            depacked_limit: word_at(data, 0x96),
        })
    }

    /// The limit is stored one below the first depacked byte.
    fn first_of_depacked(&self) -> u16 {
        self.depacked_limit.wrapping_add(1)
    }

    pub fn unpacked_size(&self) -> usize {
        1 + usize::from(self.last_of_depacked.saturating_sub(self.first_of_depacked()))
    }

    pub fn used_size(&self) -> usize {
        PACKED_DATA_OFFSET + usize::from(self.packed_size)
    }

    pub fn validate(&self, available: usize) -> Result<(), DecompressionError> {
        if !(MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&self.window_size) {
            return Err(DecompressionError::InvalidHeader("window size out of range"));
        }
        if self.last_of_depacked <= self.first_of_depacked() {
            return Err(DecompressionError::InvalidHeader("unpacked data ends below its start"));
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
    EsvHeader::read(data)
        .and_then(|header| header.validate(data.len()))
        .is_ok()
}


pub fn signature() -> &'static DepackerPattern { &DEPACKER }


pub fn decode(data: &[u8]) -> Option<DecodedResult> {
    crate::report(DESCRIPTION, try_decode(data))
}


pub fn try_decode(data: &[u8]) -> Result<DecodedResult, DecompressionError> {
    let header = EsvHeader::read(data)?;
    header.validate(data.len())?;
    debug!(
        "ESV Cruncher: packed {:#06X} -> {:#06X}, size {:#X}, unpacked size {:#X}, window {} bits",
        header.packed_source, header.packed_target, header.packed_size, header.unpacked_size(),
        header.window_size,
    );

    let used_size = header.used_size();
    // the depacker runs one byte past the start of the packed block, into the header
    let bytes = decode_stream(&data[PACKED_DATA_OFFSET - 1..used_size], &header)?;
    if bytes.is_empty() {
        return Err(DecompressionError::NoOutput);
    }
    Ok(DecodedResult {
        bytes,
        consumed: used_size,
    })
}


fn read_length(stream: &mut BitReader<'_, true>) -> Result<u32, DecompressionError> {
    if stream.get_bit()? == 1 {
        return Ok(2 + stream.get_bits(1)?);
    }
    if stream.get_bit()? == 1 {
        return Ok(4 + stream.get_bits(2)?);
    }
    if stream.get_bit()? == 1 {
        return Ok(8 + stream.get_bits(4)?);
    }
    let mut len = 0x18;
    loop {
        let addendum = stream.get_bits(8)?;
        len += addendum;
        if addendum != 0xFF {
            return Ok(len);
        }
    }
}


fn decode_stream(stream_data: &[u8], header: &EsvHeader) -> Result<Vec<u8>, DecompressionError> {
    let unpacked_size = header.unpacked_size();
    let mut stream: BitReader<true> = BitReader::new(stream_data, EofPolicy::Saturating, BitFeed::LazyByte)?;
    let mut decoded = Decoded::new(MAX_DECODED_SIZE, unpacked_size);

    while !stream.eof() && decoded.len() < unpacked_size && !decoded.is_full() {
        if stream.get_bit()? == 0 {
            decoded.add_byte(stream.get_byte()?);
            continue;
        }
        let len = read_length(&mut stream)?;
        let offset = if stream.get_bit()? == 1 {
            if len == 2 {
                // a short length with a long offset marks a literal run
                let count = 0x0A + stream.get_bits(5)?;
                trace!("{} literal bytes", count);
                decoded.generate(count as usize, || stream.get_byte())?;
                continue;
            }
            0x221 + stream.get_bits(header.window_size.into())?
        } else if stream.get_bit()? == 1 {
            1 + stream.get_bits(5)?
        } else {
            0x21 + stream.get_bits(9)?
        };
        trace!("copy {} bytes from {} back", len, offset);
        decoded.copy_from_back(offset as usize, len as usize)?;
    }
    if stream.overrun() {
        debug!("ESV Cruncher: stream exhausted after {} bytes", stream.processed());
    }
    decoded.reverse();
    Ok(decoded.into_vec())
}
