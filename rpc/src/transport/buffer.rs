use std::sync::Mutex;

use bytes::BytesMut;

use crate::protocol;

/// stream reassembly buffer. raw socket reads are appended as they arrive and
/// whole frames are split off the front once their declared length is
/// buffered. bytes are never reordered or dropped; a partial frame stays
/// buffered until the rest of it arrives.
pub(crate) struct PacketBuffer {
    buf: Mutex<BytesMut>,
}

impl PacketBuffer {
    pub(crate) fn new() -> Self {
        Self {
            buf: Mutex::new(BytesMut::with_capacity(8192)),
        }
    }

    pub(crate) fn extend(&self, chunk: &[u8]) {
        self.buf.lock().unwrap().extend_from_slice(chunk);
    }

    /// split off the next complete frame, or `None` when fewer bytes than the
    /// frame's total length are buffered.
    pub(crate) fn next_frame(&self) -> Option<BytesMut> {
        let mut buf = self.buf.lock().unwrap();
        let total = protocol::frame_len(&buf)?;
        if buf.len() < total {
            return None;
        }
        Some(buf.split_to(total))
    }
}
