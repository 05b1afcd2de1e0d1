use std::{io, net::Shutdown, time::Duration};

use tokio::net::TcpStream;

use crate::{
    error::{unexpected_eof_err, Error},
    protocol::{self, Message},
};

use super::buffer::PacketBuffer;

const READ_CHUNK: usize = 4096;

/// framed duplex byte stream. reads reassemble whole frames through the
/// packet buffer; writes are serialized so frames never interleave on the
/// wire.
pub(crate) struct Connection {
    stream: TcpStream,
    buffer: PacketBuffer,
    write: tokio::sync::Mutex<()>,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: PacketBuffer::new(),
            write: tokio::sync::Mutex::new(()),
        }
    }

    /// read the next whole frame, issuing one socket read when the buffer
    /// comes up short. end of stream and io errors propagate.
    pub(crate) async fn read(&self) -> Result<Message, Error> {
        loop {
            if let Some(frame) = self.buffer.next_frame() {
                return protocol::decode(&frame);
            }

            self.stream.readable().await?;

            let mut chunk = [0u8; READ_CHUNK];
            match self.stream.try_read(&mut chunk) {
                Ok(0) => return Err(unexpected_eof_err().into()),
                Ok(n) => self.buffer.extend(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// encode and write one whole frame. the write lock keeps concurrent
    /// writers from interleaving frames; short writes are retried until the
    /// frame is fully on the wire.
    pub(crate) async fn write(&self, msg: &Message) -> Result<(), Error> {
        let frame = protocol::encode(msg)?;

        let _guard = self.write.lock().await;

        let mut written = 0;
        while written < frame.len() {
            self.stream.writable().await?;
            match self.stream.try_write(&frame[written..]) {
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// best effort immediate close. linger is zeroed so queued data is
    /// discarded instead of draining on shutdown.
    pub(crate) fn close(&self) {
        let sock = socket2::SockRef::from(&self.stream);
        let _ = sock.set_linger(Some(Duration::ZERO));
        let _ = sock.shutdown(Shutdown::Both);
    }
}
