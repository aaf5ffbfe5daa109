//! # secs-transport
//!
//! Transport layer for SEMI equipment communication: HSMS (SEMI E37) over
//! TCP and SECS-I (SEMI E4) over a serial line or a TCP stream.
//!
//! The crate moves SECS-II message bodies as opaque bytes. It handles
//! framing, the connection state machine, control messages, timers and
//! reply correlation; item encoding belongs to the layer above.
//!
//! ## Architecture
//!
//! - **Connection**: owns the socket or serial port, reconnects, emits events
//! - **Session**: [`HsmsProtocol`] or [`SecsIProtocol`] on top of a connection
//! - **ConnectionManager**: named peers, passive listeners shared by port
//!
//! ## Example
//!
//! ```ignore
//! use bytes::Bytes;
//! use secs_transport::{Settings, SessionBuilder};
//!
//! #[tokio::main]
//! async fn main() -> secs_transport::Result<()> {
//!     let session = SessionBuilder::new("tool-1", Settings::load("tool.toml".as_ref())?)
//!         .handle(1, 1, |_msg, ctx| async move { ctx.reply(Bytes::new()).await })?
//!         .build()?;
//!     session.enable();
//!
//!     let reply = session.send_and_wait(1, 13, Bytes::new()).await?;
//!     println!("{:?}", reply);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod container;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod writer;

pub use config::{ConnectMode, DeviceRole, Settings, Timeouts, TransportSettings};
pub use error::{Result, SecsError};
pub use handler::{HandlerRegistry, ReplyContext};
pub use manager::ConnectionManager;
pub use protocol::SecsMessage;
pub use session::{
    ConnectionState, HsmsProtocol, ProtocolEvent, SecsIProtocol, Session, SessionBuilder,
    Transition,
};
