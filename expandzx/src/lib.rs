pub mod back_copy;
pub mod code_cruncher3;
pub mod code_decreaser6;
pub mod compressor_code4;
pub mod data_movement;
pub mod data_squeezer;
mod error;
pub mod esv_cruncher;
pub mod hrum;
pub mod hrust;
mod io_util;
pub mod lzh;
pub mod lzs;
pub mod pattern;
pub mod turbo_lz;


use std::fmt;

use tracing::debug;

use crate::code_decreaser6::Pcd6Version;
use crate::lzh::LzhVersion;
use crate::pattern::DepackerPattern;
use crate::turbo_lz::TurboLzVersion;

pub use crate::error::{DecompressionError, ErrorClass};


/// The output of a successful decode.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct DecodedResult {
    pub bytes: Vec<u8>,

    /// The number of input bytes that belong to the packed file.
    pub consumed: usize,
}


pub(crate) fn report(description: &str, result: Result<DecodedResult, DecompressionError>) -> Option<DecodedResult> {
    match result {
        Ok(decoded) => {
            debug!(
                "{}: {} bytes unpacked from {} bytes",
                description, decoded.bytes.len(), decoded.consumed,
            );
            Some(decoded)
        },
        Err(e) => {
            debug!("{}: {} ({:?})", description, e, e.class());
            None
        },
    }
}


pub trait Decoder {
    fn description(&self) -> &'static str;

    /// The depacker code or header signature that identifies the format.
    fn signature(&self) -> &'static DepackerPattern;

    /// Whether `data` carries a consistent header of this format.
    fn check(&self, data: &[u8]) -> bool;

    /// Unpacks `data`; validates the header independently of [`Decoder::check`].
    fn decode(&self, data: &[u8]) -> Option<DecodedResult>;
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Format {
    Hrust1,
    Hrust2,
    Hrum,
    Lzs,
    DataSqueezer,
    EsvCruncher,
    CodeCruncher3,
    CompressorCode4,
    TurboLz,
    TurboLzProtected,
    CodeDecreaser61,
    CodeDecreaser62,
    Lzh1,
    Lzh2,

    /// Hrust 2.x stream without the `hr2` header.
    Hrust2Raw,
}
impl Format {
    pub const ALL: [Format; 15] = [
        Format::Hrust1,
        Format::Hrust2,
        Format::Hrum,
        Format::Lzs,
        Format::DataSqueezer,
        Format::EsvCruncher,
        Format::CodeCruncher3,
        Format::CompressorCode4,
        Format::TurboLz,
        Format::TurboLzProtected,
        Format::CodeDecreaser61,
        Format::CodeDecreaser62,
        Format::Lzh1,
        Format::Lzh2,
        Format::Hrust2Raw,
    ];

    /// Whether the format can be told apart from arbitrary data.
    ///
    /// Formats without a signature are only decoded on request, never by [`decode_any`].
    pub fn has_signature(&self) -> bool {
        !matches!(self, Self::Hrust2Raw)
    }

    pub fn try_decode(&self, data: &[u8]) -> Result<DecodedResult, DecompressionError> {
        match self {
            Self::Hrust1 => hrust::v1::try_decode(data),
            Self::Hrust2 => hrust::v2::try_decode(data),
            Self::Hrum => hrum::try_decode(data),
            Self::Lzs => lzs::try_decode(data),
            Self::DataSqueezer => data_squeezer::try_decode(data),
            Self::EsvCruncher => esv_cruncher::try_decode(data),
            Self::CodeCruncher3 => code_cruncher3::try_decode(data),
            Self::CompressorCode4 => compressor_code4::try_decode(data),
            Self::TurboLz => TurboLzVersion::Simple.try_decode(data),
            Self::TurboLzProtected => TurboLzVersion::Protected.try_decode(data),
            Self::CodeDecreaser61 => Pcd6Version::V61.try_decode(data),
            Self::CodeDecreaser62 => Pcd6Version::V62.try_decode(data),
            Self::Lzh1 => LzhVersion::V1.try_decode(data),
            Self::Lzh2 => LzhVersion::V2.try_decode(data),
            Self::Hrust2Raw => hrust::raw::try_decode(data),
        }
    }
}
impl Decoder for Format {
    fn description(&self) -> &'static str {
        match self {
            Self::Hrust1 => hrust::v1::DESCRIPTION,
            Self::Hrust2 => hrust::v2::DESCRIPTION,
            Self::Hrum => hrum::DESCRIPTION,
            Self::Lzs => lzs::DESCRIPTION,
            Self::DataSqueezer => data_squeezer::DESCRIPTION,
            Self::EsvCruncher => esv_cruncher::DESCRIPTION,
            Self::CodeCruncher3 => code_cruncher3::DESCRIPTION,
            Self::CompressorCode4 => compressor_code4::DESCRIPTION,
            Self::TurboLz => TurboLzVersion::Simple.description(),
            Self::TurboLzProtected => TurboLzVersion::Protected.description(),
            Self::CodeDecreaser61 => Pcd6Version::V61.description(),
            Self::CodeDecreaser62 => Pcd6Version::V62.description(),
            Self::Lzh1 => LzhVersion::V1.description(),
            Self::Lzh2 => LzhVersion::V2.description(),
            Self::Hrust2Raw => hrust::raw::DESCRIPTION,
        }
    }

    fn signature(&self) -> &'static DepackerPattern {
        match self {
            Self::Hrust1 => hrust::v1::signature(),
            Self::Hrust2 => hrust::v2::signature(),
            Self::Hrum => hrum::signature(),
            Self::Lzs => lzs::signature(),
            Self::DataSqueezer => data_squeezer::signature(),
            Self::EsvCruncher => esv_cruncher::signature(),
            Self::CodeCruncher3 => code_cruncher3::signature(),
            Self::CompressorCode4 => compressor_code4::signature(),
            Self::TurboLz => TurboLzVersion::Simple.signature(),
            Self::TurboLzProtected => TurboLzVersion::Protected.signature(),
            Self::CodeDecreaser61 => Pcd6Version::V61.signature(),
            Self::CodeDecreaser62 => Pcd6Version::V62.signature(),
            Self::Lzh1 => LzhVersion::V1.signature(),
            Self::Lzh2 => LzhVersion::V2.signature(),
            Self::Hrust2Raw => hrust::raw::signature(),
        }
    }

    fn check(&self, data: &[u8]) -> bool {
        match self {
            Self::Hrust1 => hrust::v1::check(data),
            Self::Hrust2 => hrust::v2::check(data),
            Self::Hrum => hrum::check(data),
            Self::Lzs => lzs::check(data),
            Self::DataSqueezer => data_squeezer::check(data),
            Self::EsvCruncher => esv_cruncher::check(data),
            Self::CodeCruncher3 => code_cruncher3::check(data),
            Self::CompressorCode4 => compressor_code4::check(data),
            Self::TurboLz => TurboLzVersion::Simple.check(data),
            Self::TurboLzProtected => TurboLzVersion::Protected.check(data),
            Self::CodeDecreaser61 => Pcd6Version::V61.check(data),
            Self::CodeDecreaser62 => Pcd6Version::V62.check(data),
            Self::Lzh1 => LzhVersion::V1.check(data),
            Self::Lzh2 => LzhVersion::V2.check(data),
            Self::Hrust2Raw => hrust::raw::check(data),
        }
    }

    fn decode(&self, data: &[u8]) -> Option<DecodedResult> {
        report(self.description(), self.try_decode(data))
    }
}
impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}


/// Tries every format with a signature in turn and returns the first one that decodes `data`.
pub fn decode_any(data: &[u8]) -> Option<(Format, DecodedResult)> {
    Format::ALL.iter()
        .filter(|format| format.has_signature())
        .find_map(|format| format.decode(data).map(|decoded| (*format, decoded)))
}


#[cfg(test)]
mod tests {
    use super::{Decoder, Format, decode_any};
    use proptest::prelude::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_decode_any() {
        let mut data = b"hr21\x09\x00\x0B\x00123456A".to_vec();
        data.extend_from_slice(&[0x8C, b'B', 0xC8, 0x00]);
        let (format, result) = decode_any(&data).unwrap();
        assert_eq!(format, Format::Hrust2);
        assert_eq!(result.bytes, b"ABA123456");
        assert!(Format::Hrust2.check(&data));
        assert!(!Format::Hrust1.check(&data));

        assert_eq!(decode_any(b"nothing to see here"), None);
    }

    #[test]
    fn test_headerless_stream_needs_request() {
        let data = b"123456A\x8CB\xC8\x00";
        assert_eq!(decode_any(data), None);
        let result = Format::Hrust2Raw.decode(data).unwrap();
        assert_eq!(result.bytes, b"ABA123456");
        let headerless: Vec<Format> = Format::ALL.into_iter()
            .filter(|format| !format.has_signature())
            .collect();
        assert_eq!(headerless, vec![Format::Hrust2Raw]);
    }

    #[test]
    fn test_descriptions() {
        assert_eq!(Format::Hrust1.to_string(), "Hrust v1.x");
        assert_eq!(Format::Lzs.description(), "ASC LZS Pack");
        assert_eq!(Format::CompressorCode4.description(), "CompressorCode v4");
        assert_eq!(Format::TurboLzProtected.to_string(), "Turbo#LZ v1.x (internal)");
        assert_eq!(Format::CodeDecreaser62.description(), "Powerfull Code Decreaser v6.2");
        assert_eq!(Format::Lzh1.description(), "LZH Compressor v1.4");
        for format in Format::ALL {
            assert!(format.signature().min_size() >= format.signature().len());
        }
    }

    proptest! {
        #[test]
        fn random_input_never_panics(data in proptest::collection::vec(any::<u8>(), 0..0x400)) {
            for format in Format::ALL {
                if let Some(result) = format.decode(&data) {
                    prop_assert!(result.consumed <= data.len());
                    prop_assert!(result.bytes.len() <= 0x10000);
                }
            }
        }

        #[test]
        fn signed_headers_never_panic(
            format_index in 0usize..Format::ALL.len(),
            data in proptest::collection::vec(any::<u8>(), 0..0x300),
        ) {
            // random data behind a matching signature reaches the stream decoders
            let mut data = data;
            let format = Format::ALL[format_index];
            let pattern = format.signature();
            if data.len() < pattern.len() {
                data.resize(pattern.len(), 0x00);
            }
            pattern.imprint(&mut data);
            if let Some(result) = format.decode(&data) {
                prop_assert!(result.consumed <= data.len());
            }
        }
    }
}
