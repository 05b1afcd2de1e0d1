//! body marshaling. the frame header is always JSON regardless of the codec
//! chosen for bodies so a decoder can read framing before learning the body
//! format.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::DeserializeOwned};

use crate::error::CodecError;

/// wire tag of a body codec. carried in every frame header.
///
/// tags are part of the protocol: 1 is JSON, 2 is the binary codec. an
/// unrecognized tag surfaces as [`CodecError::UnknownTag`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CodecType {
    #[default]
    Json,
    Bincode,
}

impl CodecType {
    pub const fn tag(self) -> u8 {
        match self {
            Self::Json => 1,
            Self::Bincode => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            1 => Ok(Self::Json),
            2 => Ok(Self::Bincode),
            _ => Err(CodecError::UnknownTag(tag)),
        }
    }
}

impl Serialize for CodecType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.tag())
    }
}

impl<'de> Deserialize<'de> for CodecType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = u8::deserialize(deserializer)?;
        // headers written by the peer may leave the field at its zero value.
        if tag == 0 {
            return Ok(Self::default());
        }
        Self::from_tag(tag).map_err(serde::de::Error::custom)
    }
}

pub fn marshal<T>(ty: CodecType, value: &T) -> Result<Vec<u8>, CodecError>
where
    T: Serialize + ?Sized,
{
    match ty {
        CodecType::Json => serde_json::to_vec(value).map_err(CodecError::Json),
        CodecType::Bincode => bincode::serialize(value).map_err(CodecError::Bincode),
    }
}

pub fn unmarshal<T>(ty: CodecType, data: &[u8]) -> Result<T, CodecError>
where
    T: DeserializeOwned,
{
    match ty {
        CodecType::Json => serde_json::from_slice(data).map_err(CodecError::Json),
        CodecType::Bincode => bincode::deserialize(data).map_err(CodecError::Bincode),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
    struct Pair {
        a: i64,
        b: String,
    }

    #[test]
    fn tags() {
        assert_eq!(CodecType::Json.tag(), 1);
        assert_eq!(CodecType::Bincode.tag(), 2);
        assert_eq!(CodecType::from_tag(2).unwrap(), CodecType::Bincode);
        assert!(CodecType::from_tag(9).is_err());
    }

    #[test]
    fn round_trip() {
        let value = Pair {
            a: -7,
            b: "hello".to_string(),
        };

        for ty in [CodecType::Json, CodecType::Bincode] {
            let bytes = marshal(ty, &value).unwrap();
            let back: Pair = unmarshal(ty, &bytes).unwrap();
            assert_eq!(back, value);
        }
    }

    #[test]
    fn json_rejects_bincode_bytes() {
        let bytes = marshal(CodecType::Bincode, &Pair { a: 1, b: "x".into() }).unwrap();
        assert!(unmarshal::<Pair>(CodecType::Json, &bytes).is_err());
    }
}
