//! Handler registry for dispatching primary messages by stream/function.
//!
//! Handlers are registered before the session starts. Registration validates
//! the key: streams are 1..=127 (bit 7 of the stream byte is the W-bit),
//! functions must be odd (even functions are replies) and each
//! (stream, function) pair takes exactly one handler.
//!
//! # Example
//!
//! ```
//! use secs_transport::handler::HandlerRegistry;
//!
//! let mut registry = HandlerRegistry::new();
//!
//! // S1F1 Are You There -> S1F2 On Line Data
//! registry
//!     .register(1, 1, |_msg, ctx| async move { ctx.reply(bytes::Bytes::new()).await })
//!     .unwrap();
//!
//! assert!(registry.get(1, 1).is_some());
//! assert!(registry.register(1, 2, |_msg, _ctx| async { Ok(()) }).is_err());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use super::ReplyContext;
use crate::error::{Result, SecsError};
use crate::protocol::SecsMessage;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for message handlers.
pub trait Handler: Send + Sync + 'static {
    /// Handle a primary message.
    fn call(&self, message: SecsMessage, ctx: ReplyContext) -> BoxFuture<'static, HandlerResult>;
}

/// Adapts an async closure to [`Handler`].
pub struct FnHandler<F, Fut>
where
    F: Fn(SecsMessage, ReplyContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(SecsMessage, ReplyContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Handler for FnHandler<F, Fut>
where
    F: Fn(SecsMessage, ReplyContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, message: SecsMessage, ctx: ReplyContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(message, ctx))
    }
}

/// Registry mapping (stream, function) to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(u8, u8), Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure for `S{stream}F{function}`.
    pub fn register<F, Fut>(&mut self, stream: u8, function: u8, handler: F) -> Result<()>
    where
        F: Fn(SecsMessage, ReplyContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(stream, function, Arc::new(FnHandler::new(handler)))
    }

    /// Register a handler object for `S{stream}F{function}`.
    pub fn register_handler(
        &mut self,
        stream: u8,
        function: u8,
        handler: Arc<dyn Handler>,
    ) -> Result<()> {
        if stream == 0 || stream > 127 {
            return Err(SecsError::InvalidHandler(format!(
                "stream {} outside 1..=127",
                stream
            )));
        }
        if function % 2 == 0 {
            return Err(SecsError::InvalidHandler(format!(
                "S{}F{} is a reply function",
                stream, function
            )));
        }
        if self.handlers.contains_key(&(stream, function)) {
            return Err(SecsError::InvalidHandler(format!(
                "S{}F{} already has a handler",
                stream, function
            )));
        }

        self.handlers.insert((stream, function), handler);
        Ok(())
    }

    pub fn get(&self, stream: u8, function: u8) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&(stream, function)).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch a message to its handler.
    pub async fn dispatch(&self, message: SecsMessage, ctx: ReplyContext) -> Result<()> {
        let handler = self
            .get(message.stream, message.function)
            .ok_or(SecsError::HandlerNotFound(message.stream, message.function))?;

        handler.call(message, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ReplySink;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Discard;

    impl ReplySink for Discard {
        fn send_reply(
            self: Arc<Self>,
            _stream: u8,
            _function: u8,
            _system: u32,
            _data: Bytes,
        ) -> BoxFuture<'static, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn context(msg: &SecsMessage) -> ReplyContext {
        ReplyContext::new(msg, Arc::new(Discard))
    }

    fn message(stream: u8, function: u8) -> SecsMessage {
        SecsMessage {
            session_id: 1,
            stream,
            function,
            require_response: true,
            system: 9,
            data: Bytes::from_static(b"body"),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register(1, 13, |_m, _c| async { Ok(()) }).unwrap();

        assert!(registry.get(1, 13).is_some());
        assert!(registry.get(1, 1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_rejects_invalid_keys() {
        let mut registry = HandlerRegistry::new();

        let err = registry.register(0, 1, |_m, _c| async { Ok(()) }).unwrap_err();
        assert!(matches!(err, SecsError::InvalidHandler(_)));
        assert!(registry.register(128, 1, |_m, _c| async { Ok(()) }).is_err());
        assert!(registry.register(6, 12, |_m, _c| async { Ok(()) }).is_err());

        registry.register(6, 11, |_m, _c| async { Ok(()) }).unwrap();
        let err = registry.register(6, 11, |_m, _c| async { Ok(()) }).unwrap_err();
        assert!(err.to_string().contains("already"));
        assert!(!registry.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_calls_handler() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut registry = HandlerRegistry::new();
        registry
            .register(2, 41, move |msg, _ctx| {
                let counter = counter.clone();
                async move {
                    assert_eq!(&msg.data[..], b"body");
                    counter.fetch_add(msg.system, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        let msg = message(2, 41);
        let ctx = context(&msg);
        registry.dispatch(msg, ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn test_dispatch_unknown() {
        let registry = HandlerRegistry::new();
        let msg = message(5, 1);
        let ctx = context(&msg);

        let err = registry.dispatch(msg, ctx).await.unwrap_err();
        assert!(matches!(err, SecsError::HandlerNotFound(5, 1)));
    }
}
