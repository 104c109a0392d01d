//! Bare Hrust 2.x streams, as embedded by archivers that keep the sizes elsewhere.
//!
//! There is no signature: the block is the seven stream header bytes of an `hr2` file followed
//! by its bitstream, and everything up to the end of the input belongs to it.


use std::sync::LazyLock;

use display_bytes::{DisplayBytes, DisplayBytesSlice};
use tracing::debug;

use crate::DecodedResult;
use crate::error::DecompressionError;
use crate::hrust::v2::decode_stream;
use crate::io_util::ByteBufReadable;
use crate::pattern::DepackerPattern;


pub const DESCRIPTION: &str = "Hrust v2.x";

const BITSTREAM_OFFSET: usize = 7;

static SIGNATURE: LazyLock<DepackerPattern> = LazyLock::new(|| {
    DepackerPattern::compile(
        concat!(
            "??????",  // last bytes
            "?",       // first byte
        ),
        Hrust2RawHeader::MIN_SIZE,
    ).expect("failed to compile Hrust 2 raw stream signature")
});


#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Hrust2RawHeader {
    pub last_bytes: DisplayBytes<6>,
    pub first_byte: u8,
}
impl Hrust2RawHeader {
    /// The stream header plus at least one bitstream byte.
    pub const MIN_SIZE: usize = BITSTREAM_OFFSET + 1;

    pub fn read(data: &[u8]) -> Result<Self, DecompressionError> {
        if data.len() < Self::MIN_SIZE {
            return Err(DecompressionError::TooShort { needed: Self::MIN_SIZE, available: data.len() });
        }
        let mut pos = 0;
        let last_bytes = ByteBufReadable::read(data, &mut pos);
        let first_byte = ByteBufReadable::read(data, &mut pos);
        Ok(Self {
            last_bytes,
            first_byte,
        })
    }
}


pub fn signature() -> &'static DepackerPattern { &SIGNATURE }


pub fn check(data: &[u8]) -> bool {
    Hrust2RawHeader::read(data).is_ok()
}


pub fn decode(data: &[u8]) -> Option<DecodedResult> {
    crate::report(DESCRIPTION, try_decode(data))
}


pub fn try_decode(data: &[u8]) -> Result<DecodedResult, DecompressionError> {
    let header = Hrust2RawHeader::read(data)?;
    let stream_data = &data[BITSTREAM_OFFSET..];
    debug!(
        "Hrust 2 raw stream: {} bytes, first byte {:#04X}, last bytes {}, stream starts with {}",
        stream_data.len(), header.first_byte, header.last_bytes,
        DisplayBytesSlice::from(&stream_data[..stream_data.len().min(4)]),
    );

    let bytes = decode_stream(stream_data, header.first_byte, header.last_bytes.as_slice())?;
    Ok(DecodedResult {
        bytes,
        consumed: data.len(),
    })
}
