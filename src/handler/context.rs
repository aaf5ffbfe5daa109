//! Reply context for handlers.
//!
//! Provides methods for answering a primary message:
//! - `reply` - send the secondary (function + 1)
//! - `reply_with` - send a reply with an explicit function
//! - `abort` - send the function 0 abort transaction
//!
//! # Example
//!
//! ```ignore
//! async fn are_you_there(msg: SecsMessage, ctx: ReplyContext) -> Result<()> {
//!     ctx.reply(online_data()).await
//! }
//! ```

use std::sync::Arc;

use bytes::Bytes;

use super::BoxFuture;
use crate::error::Result;
use crate::protocol::SecsMessage;

/// Something that can put a reply on the wire for a session.
pub trait ReplySink: Send + Sync + 'static {
    /// Send `S{stream}F{function}` with the given system id, without waiting.
    fn send_reply(
        self: Arc<Self>,
        stream: u8,
        function: u8,
        system: u32,
        data: Bytes,
    ) -> BoxFuture<'static, Result<()>>;
}

/// Context passed to message handlers.
///
/// Bound to the request it was created for: replies reuse its stream and
/// system id. `ReplyContext` is `Clone` and can be moved into spawned tasks.
#[derive(Clone)]
pub struct ReplyContext {
    stream: u8,
    function: u8,
    system: u32,
    require_response: bool,
    sink: Arc<dyn ReplySink>,
}

impl ReplyContext {
    /// Create a context that sends replies through `sink`.
    pub fn new(request: &SecsMessage, sink: Arc<dyn ReplySink>) -> Self {
        Self {
            stream: request.stream,
            function: request.function,
            system: request.system,
            require_response: request.require_response,
            sink,
        }
    }

    #[inline]
    pub fn stream(&self) -> u8 {
        self.stream
    }

    #[inline]
    pub fn function(&self) -> u8 {
        self.function
    }

    #[inline]
    pub fn system(&self) -> u32 {
        self.system
    }

    /// Whether the sender set the W-bit.
    #[inline]
    pub fn expects_reply(&self) -> bool {
        self.require_response
    }

    /// Send the secondary message (function + 1).
    pub async fn reply(&self, data: Bytes) -> Result<()> {
        self.reply_with(self.function.wrapping_add(1), data).await
    }

    /// Send a reply with an explicit function on the request's stream.
    pub async fn reply_with(&self, function: u8, data: Bytes) -> Result<()> {
        if !self.require_response {
            tracing::debug!(
                "S{}F{} did not request a reply, sending S{}F{} anyway",
                self.stream,
                self.function,
                self.stream,
                function
            );
        }

        self.sink
            .clone()
            .send_reply(self.stream, function, self.system, data)
            .await
    }

    /// Send the abort transaction (function 0).
    pub async fn abort(&self) -> Result<()> {
        self.reply_with(0, Bytes::new()).await
    }
}
