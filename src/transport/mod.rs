//! Transport layer - byte buffering and the connection runner.

mod byte_queue;
mod connection;

pub use byte_queue::ByteQueue;
pub use connection::{Connection, ConnectionEvent, ConnectionOptions, Endpoint};
