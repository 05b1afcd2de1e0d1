#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod client;
mod limit;
mod server;
mod transport;

pub mod balance;
pub mod breaker;
pub mod codec;
pub mod compress;
pub mod error;
pub mod protocol;
pub mod registry;

pub use self::{
    client::{Client, ClientBuilder},
    codec::CodecType,
    compress::Compression,
    error::Error,
    protocol::{Header, Message, MAGIC},
    server::{Server, ServerBuilder, ServerHandle, Service},
    transport::Response,
};
