use std::array::TryFromSliceError;
use std::fmt;
use std::ops::{Index, IndexMut};


fn write_escaped(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    write!(f, "b\"")?;
    for &b in bytes {
        match b {
            0x00 => write!(f, "\\0")?,
            0x09 => write!(f, "\\t")?,
            0x0A => write!(f, "\\n")?,
            0x0D => write!(f, "\\r")?,
            0x22 => write!(f, "\\\"")?,
            // no need to escape 0x27
            0x5C => write!(f, "\\\\")?,
            0x20..=0x7E => write!(f, "{}", char::from(b))?,
            other => write!(f, "\\x{:02X}", other)?,
        }
    }
    write!(f, "\"")
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    let mut first = true;
    for &b in bytes {
        if first {
            first = false;
        } else {
            write!(f, " ")?;
        }
        write!(f, "{:02X}", b)?;
    }
    Ok(())
}


/// Fixed-size byte string shown as an escaped Rust byte literal.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct DisplayBytes<const SIZE: usize>(
    #[cfg_attr(feature = "serde", serde(with = "serde_array"))]
    [u8; SIZE]
);
impl<const SIZE: usize> DisplayBytes<SIZE> {
    pub fn as_slice(&self) -> &[u8] { &self.0 }
}
impl<const SIZE: usize> Default for DisplayBytes<SIZE> {
    fn default() -> Self {
        Self([0u8; SIZE])
    }
}
impl<const SIZE: usize> fmt::Debug for DisplayBytes<SIZE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DisplayBytes({})", self)
    }
}
impl<const SIZE: usize> fmt::Display for DisplayBytes<SIZE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_escaped(f, &self.0)
    }
}
impl<const SIZE: usize> From<[u8; SIZE]> for DisplayBytes<SIZE> {
    fn from(value: [u8; SIZE]) -> Self {
        Self(value)
    }
}
impl<const SIZE: usize> From<DisplayBytes<SIZE>> for [u8; SIZE] {
    fn from(value: DisplayBytes<SIZE>) -> Self {
        value.0
    }
}
impl<const SIZE: usize> TryFrom<&[u8]> for DisplayBytes<SIZE> {
    type Error = TryFromSliceError;
    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let buf: [u8; SIZE] = value.try_into()?;
        Ok(Self(buf))
    }
}
impl<const SIZE: usize> AsRef<[u8]> for DisplayBytes<SIZE> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
impl<const SIZE: usize> Index<usize> for DisplayBytes<SIZE> {
    type Output = u8;
    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}
impl<const SIZE: usize> IndexMut<usize> for DisplayBytes<SIZE> {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.0[index]
    }
}


/// Borrowed byte string shown as an escaped Rust byte literal.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DisplayBytesSlice<'a>(&'a [u8]);
impl<'a> fmt::Debug for DisplayBytesSlice<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DisplayBytesSlice({})", self)
    }
}
impl<'a> fmt::Display for DisplayBytesSlice<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_escaped(f, self.0)
    }
}
impl<'a> From<&'a [u8]> for DisplayBytesSlice<'a> {
    fn from(value: &'a [u8]) -> Self {
        Self(value)
    }
}
impl<'a> AsRef<[u8]> for DisplayBytesSlice<'a> {
    fn as_ref(&self) -> &[u8] {
        self.0
    }
}


/// Borrowed byte string shown as space-separated hex pairs, e.g. `ED B0 C9`.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct HexBytesSlice<'a>(&'a [u8]);
impl<'a> fmt::Debug for HexBytesSlice<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HexBytesSlice({})", self)
    }
}
impl<'a> fmt::Display for HexBytesSlice<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, self.0)
    }
}
impl<'a> From<&'a [u8]> for HexBytesSlice<'a> {
    fn from(value: &'a [u8]) -> Self {
        Self(value)
    }
}
impl<'a> AsRef<[u8]> for HexBytesSlice<'a> {
    fn as_ref(&self) -> &[u8] {
        self.0
    }
}


#[cfg(feature = "serde")]
mod serde_array {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde::de::Error as _;

    pub fn serialize<S: Serializer, const SIZE: usize>(value: &[u8; SIZE], serializer: S) -> Result<S::Ok, S::Error> {
        value.as_slice().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const SIZE: usize>(deserializer: D) -> Result<[u8; SIZE], D::Error> {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        let count = bytes.len();
        bytes.try_into()
            .map_err(|_| D::Error::invalid_length(count, &"a byte array of matching size"))
    }
}
