//! optional body compression applied after marshaling and stripped before
//! unmarshaling.

use std::io::{Read, Write};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CompressError;

/// compression applied to a frame body. the header itself is never compressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl Compression {
    pub const fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
        }
    }
}

impl Serialize for Compression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.tag())
    }
}

impl<'de> Deserialize<'de> for Compression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            tag => Err(serde::de::Error::custom(format!(
                "unknown compression tag {tag}"
            ))),
        }
    }
}

pub fn compress(data: &[u8], compression: Compression) -> Result<Vec<u8>, CompressError> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).map_err(CompressError)?;
            encoder.finish().map_err(CompressError)
        }
    }
}

pub fn decompress(data: &[u8], compression: Compression) -> Result<Vec<u8>, CompressError> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(CompressError)?;
            Ok(out)
        }
    }
}
