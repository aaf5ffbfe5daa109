//! Handler module - primary message handling.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps (stream, function) to handlers
//! - [`ReplyContext`] - lets handlers reply to or abort the transaction
//!
//! # Example
//!
//! ```ignore
//! use secs_transport::handler::HandlerRegistry;
//!
//! let mut registry = HandlerRegistry::new();
//!
//! // S1F13 Establish Communications -> S1F14
//! registry.register(1, 13, |_msg, ctx| async move {
//!     ctx.reply(commack_accepted()).await
//! })?;
//! ```
//!
//! Messages without a handler are published as
//! [`ProtocolEvent::MessageReceived`](crate::session::ProtocolEvent::MessageReceived).

mod context;
mod registry;

pub use context::{ReplyContext, ReplySink};
pub use registry::{BoxFuture, FnHandler, Handler, HandlerRegistry, HandlerResult};
