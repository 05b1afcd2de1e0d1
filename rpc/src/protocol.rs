//! on-wire frame layout (big-endian):
//!
//! ```text
//! offset  size  field
//!   0      2    magic = 0x1234
//!   2      4    header_len (u32)
//!   6      4    body_len   (u32)
//!  10      H    header bytes (JSON encoded Header)
//! 10+H     B    body bytes  (codec marshaled, optionally compressed)
//! ```

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    codec::CodecType,
    compress::{self, Compression},
    error::{Error, ProtocolError},
};

pub const MAGIC: u16 = 0x1234;

/// fixed length of magic + header_len + body_len.
pub(crate) const PREFIX_LEN: usize = 10;

/// frame header. always marshaled as JSON with these literal field names so
/// the decoder can read it before learning the body codec. every field is
/// optional on the wire and defaults to its zero value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    #[serde(rename = "RequestID", default)]
    pub request_id: u64,
    #[serde(rename = "ServiceName", default)]
    pub service_name: String,
    #[serde(rename = "MethodName", default)]
    pub method_name: String,
    /// empty on success responses. a populated value is surfaced to the
    /// caller as a remote error.
    #[serde(rename = "Error", default)]
    pub error: String,
    #[serde(rename = "CodecType", default)]
    pub codec_type: CodecType,
    #[serde(rename = "Compression", default)]
    pub compression: Compression,
}

/// pairing of a header with an opaque body. the unit every transport api
/// speaks in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub header: Header,
    pub body: Vec<u8>,
}

/// encode a message into one whole frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>, Error> {
    let body = compress::compress(&msg.body, msg.header.compression)?;
    let header = serde_json::to_vec(&msg.header).map_err(ProtocolError::BadHeader)?;

    let mut buf = BytesMut::with_capacity(PREFIX_LEN + header.len() + body.len());
    buf.put_u16(MAGIC);
    buf.put_u32(header.len() as u32);
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&body);

    Ok(buf.to_vec())
}

/// decode one whole frame. `data` must hold the complete frame; stream
/// reassembly happens in the packet buffer before this is called.
pub fn decode(data: &[u8]) -> Result<Message, Error> {
    if data.len() < PREFIX_LEN {
        return Err(ProtocolError::Short.into());
    }

    if u16::from_be_bytes([data[0], data[1]]) != MAGIC {
        return Err(ProtocolError::BadMagic.into());
    }

    let header_len = u32::from_be_bytes([data[2], data[3], data[4], data[5]]) as usize;
    let body_len = u32::from_be_bytes([data[6], data[7], data[8], data[9]]) as usize;

    if data.len() < PREFIX_LEN + header_len + body_len {
        return Err(ProtocolError::Incomplete.into());
    }

    let header: Header =
        serde_json::from_slice(&data[PREFIX_LEN..PREFIX_LEN + header_len]).map_err(ProtocolError::BadHeader)?;

    let body = &data[PREFIX_LEN + header_len..PREFIX_LEN + header_len + body_len];
    let body = compress::decompress(body, header.compression)?;

    Ok(Message { header, body })
}

/// total length of the frame starting at `data`, or `None` when even the
/// fixed prefix has not arrived yet.
pub(crate) fn frame_len(data: &[u8]) -> Option<usize> {
    if data.len() < PREFIX_LEN {
        return None;
    }
    let header_len = u32::from_be_bytes([data[2], data[3], data[4], data[5]]) as usize;
    let body_len = u32::from_be_bytes([data[6], data[7], data[8], data[9]]) as usize;
    Some(PREFIX_LEN + header_len + body_len)
}

#[cfg(test)]
mod test {
    use super::*;

    fn message(compression: Compression) -> Message {
        Message {
            header: Header {
                request_id: 42,
                service_name: "Arith".to_string(),
                method_name: "Add".to_string(),
                error: String::new(),
                codec_type: CodecType::Json,
                compression,
            },
            body: br#"{"a":2,"b":3}"#.to_vec(),
        }
    }

    #[test]
    fn round_trip() {
        for compression in [Compression::None, Compression::Gzip] {
            let msg = message(compression);
            let frame = encode(&msg).unwrap();
            assert_eq!(decode(&frame).unwrap(), msg);
        }
    }

    #[test]
    fn frame_layout() {
        let msg = message(Compression::None);
        let frame = encode(&msg).unwrap();

        assert_eq!(u16::from_be_bytes([frame[0], frame[1]]), MAGIC);
        let header_len = u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]) as usize;
        let body_len = u32::from_be_bytes([frame[6], frame[7], frame[8], frame[9]]) as usize;
        assert_eq!(frame.len(), PREFIX_LEN + header_len + body_len);
        assert_eq!(&frame[PREFIX_LEN + header_len..], msg.body.as_slice());
    }

    #[test]
    fn short_input() {
        let err = decode(&[0x12, 0x34, 0, 0]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::Short)
        ));
    }

    #[test]
    fn bad_magic() {
        let mut frame = encode(&message(Compression::None)).unwrap();
        frame[0] = 0xff;
        let err = decode(&frame).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::BadMagic)
        ));
    }

    #[test]
    fn truncated_frame() {
        let frame = encode(&message(Compression::None)).unwrap();
        let err = decode(&frame[..frame.len() - 1]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::Incomplete)
        ));
    }

    #[test]
    fn header_tolerates_missing_fields() {
        let header: Header = serde_json::from_slice(br#"{"RequestID":7}"#).unwrap();
        assert_eq!(header.request_id, 7);
        assert!(header.service_name.is_empty());
        assert_eq!(header.codec_type, CodecType::Json);
        assert_eq!(header.compression, Compression::None);
    }
}
