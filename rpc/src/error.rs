//! library error types. typed error handling is done with runtime downcast
//! against the concrete types this module exports.

use core::{
    fmt,
    ops::{Deref, DerefMut},
};

use std::{error, io};

/// public facing error type. providing basic format and display based error handling.
///
/// for typed based error handling runtime type cast is needed with the help of other
/// public error types offered by this module.
///
/// # Example
/// ```rust
/// use mux_rpc::error::{BreakerOpen, Error};
///
/// fn is_breaker_open(e: &Error) -> bool {
///     // downcast error to BreakerOpen to check if the circuit breaker rejected the call.
///     e.downcast_ref::<BreakerOpen>().is_some()
/// }
/// ```
pub struct Error(Box<dyn error::Error + Send + Sync>);

impl Error {
    /// true when local or remote admission control refused the request.
    pub fn is_rate_limited(&self) -> bool {
        self.0.is::<RateLimited>()
    }

    /// true when the circuit breaker for the selected endpoint rejected the call.
    pub fn is_breaker_open(&self) -> bool {
        self.0.is::<BreakerOpen>()
    }

    /// true when the configured request timeout elapsed before a response arrived.
    pub fn is_timeout(&self) -> bool {
        self.0.is::<Timeout>()
    }
}

impl Deref for Error {
    type Target = dyn error::Error + Send + Sync;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl DerefMut for Error {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.0
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0.source()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self(Box::new(e))
    }
}

/// local token bucket (or the server's) ran out of tokens for the current second.
#[derive(Debug, Default)]
pub struct RateLimited;

impl fmt::Display for RateLimited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("rate limit exceeded")
    }
}

impl error::Error for RateLimited {}

impl From<RateLimited> for Error {
    fn from(e: RateLimited) -> Self {
        Self(Box::new(e))
    }
}

/// service discovery returned no live instance for the requested service.
#[derive(Debug, Default)]
pub struct NoInstance;

impl fmt::Display for NoInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no instance available")
    }
}

impl error::Error for NoInstance {}

impl From<NoInstance> for Error {
    fn from(e: NoInstance) -> Self {
        Self(Box::new(e))
    }
}

/// the circuit breaker guarding the selected (service, addr) pair is open.
///
/// retry after the breaker's open timeout has elapsed. the next admitted call
/// is the half-open probe.
#[derive(Debug, Default)]
pub struct BreakerOpen;

impl fmt::Display for BreakerOpen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("circuit breaker open")
    }
}

impl error::Error for BreakerOpen {}

impl From<BreakerOpen> for Error {
    fn from(e: BreakerOpen) -> Self {
        Self(Box::new(e))
    }
}

/// the connection pool has been shut down. not retryable.
#[derive(Debug, Default)]
pub struct PoolClosed;

impl fmt::Display for PoolClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection pool closed")
    }
}

impl error::Error for PoolClosed {}

impl From<PoolClosed> for Error {
    fn from(e: PoolClosed) -> Self {
        Self(Box::new(e))
    }
}

/// send attempted on a multiplexed client that already entered failed state.
///
/// the pool evicts the failed client on its next acquisition so the operation
/// is safe to retry.
#[derive(Debug, Default)]
pub struct ConnectionClosed;

impl fmt::Display for ConnectionClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection closed")
    }
}

impl error::Error for ConnectionClosed {}

impl From<ConnectionClosed> for Error {
    fn from(e: ConnectionClosed) -> Self {
        Self(Box::new(e))
    }
}

/// establishing the TCP connection to an endpoint failed or timed out.
#[derive(Debug)]
pub struct DialFailed(pub(crate) io::Error);

impl DialFailed {
    #[cold]
    #[inline(never)]
    pub(crate) fn timed_out() -> Self {
        Self(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
    }
}

impl fmt::Display for DialFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dial failed: {}", self.0)
    }
}

impl error::Error for DialFailed {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.0)
    }
}

impl From<DialFailed> for Error {
    fn from(e: DialFailed) -> Self {
        Self(Box::new(e))
    }
}

/// the configured request timeout elapsed before the response completed.
#[derive(Debug, Default)]
pub struct Timeout;

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("request timed out")
    }
}

impl error::Error for Timeout {}

impl From<Timeout> for Error {
    fn from(e: Timeout) -> Self {
        Self(Box::new(e))
    }
}

/// the server answered with a populated error header. the message is carried verbatim.
#[derive(Debug)]
pub struct RemoteError(pub String);

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl error::Error for RemoteError {}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        Self(Box::new(e))
    }
}

/// no registered service/method pair matched the routing key on the wire.
#[derive(Debug)]
pub struct MethodNotFound {
    pub service: String,
    pub method: String,
}

impl fmt::Display for MethodNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method not found: {}.{}", self.service, self.method)
    }
}

impl error::Error for MethodNotFound {}

impl From<MethodNotFound> for Error {
    fn from(e: MethodNotFound) -> Self {
        Self(Box::new(e))
    }
}

/// frame level decode failure. structural variants kill the connection they
/// arrived on.
#[derive(Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    /// fewer than the fixed prefix worth of bytes.
    Short,
    /// magic bytes did not match.
    BadMagic,
    /// declared lengths exceed the buffered bytes.
    Incomplete,
    /// header bytes failed to parse as JSON.
    BadHeader(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Short => f.write_str("frame too short"),
            Self::BadMagic => f.write_str("invalid magic number"),
            Self::Incomplete => f.write_str("incomplete frame"),
            Self::BadHeader(ref e) => write!(f, "bad frame header: {e}"),
        }
    }
}

impl error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::BadHeader(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self(Box::new(e))
    }
}

/// marshal/unmarshal failure. not retryable.
#[derive(Debug)]
#[non_exhaustive]
pub enum CodecError {
    /// the wire tag does not name a registered codec.
    UnknownTag(u8),
    Json(serde_json::Error),
    Bincode(bincode::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UnknownTag(tag) => write!(f, "codec type {tag} not registered"),
            Self::Json(ref e) => write!(f, "json codec: {e}"),
            Self::Bincode(ref e) => write!(f, "bincode codec: {e}"),
        }
    }
}

impl error::Error for CodecError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::UnknownTag(_) => None,
            Self::Json(ref e) => Some(e),
            Self::Bincode(ref e) => Some(e),
        }
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self(Box::new(e))
    }
}

/// compressed body could not be produced or consumed.
#[derive(Debug)]
pub struct CompressError(pub(crate) io::Error);

impl fmt::Display for CompressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bad compression: {}", self.0)
    }
}

impl error::Error for CompressError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.0)
    }
}

impl From<CompressError> for Error {
    fn from(e: CompressError) -> Self {
        Self(Box::new(e))
    }
}

#[cold]
#[inline(never)]
pub(crate) fn unexpected_eof_err() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "zero byte read. remote close connection unexpectedly",
    )
}
