mod buffer;
mod connection;
mod mux;
mod pool;
mod response;

pub use self::response::Response;

pub(crate) use self::{connection::Connection, pool::ConnectionPool};
