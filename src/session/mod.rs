//! Session engines and the protocol-neutral [`Session`] facade.
//!
//! [`HsmsProtocol`] and [`SecsIProtocol`] share the state machine, the event
//! channel and reply correlation; they differ in framing and line discipline.
//! [`SessionBuilder`] turns [`Settings`] into either one.

mod hsms;
mod pending;
mod secsi;
mod shared;
mod state;

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;

pub use hsms::HsmsProtocol;
pub use pending::{PendingReplies, ReplySlot};
pub use secsi::{BlockSendInfo, SecsIProtocol};
pub use shared::ProtocolEvent;
pub use state::{ConnectionState, StateMachine, Transition};

use crate::config::{ConnectMode, Settings, TransportSettings};
use crate::error::{Result, SecsError};
use crate::handler::{BoxFuture, HandlerRegistry, HandlerResult, ReplyContext};
use crate::protocol::SecsMessage;
use crate::transport::Endpoint;

/// Operations common to HSMS and SECS-I sessions.
pub trait Session: Send + Sync {
    fn name(&self) -> &str;

    /// Start connecting (active) or listening (passive).
    fn enable(&self);

    /// Tear the session down; pending waits end with `None`.
    fn disable(&self) -> BoxFuture<'_, ()>;

    fn state(&self) -> ConnectionState;

    fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent>;

    /// Send a primary message and wait up to T3 for its reply.
    fn send_and_wait(
        &self,
        stream: u8,
        function: u8,
        data: Bytes,
    ) -> BoxFuture<'_, Result<Option<SecsMessage>>>;

    fn send_message(
        &self,
        stream: u8,
        function: u8,
        require_response: bool,
        data: Bytes,
    ) -> BoxFuture<'_, Result<u32>>;

    fn send_reply(
        &self,
        stream: u8,
        function: u8,
        system: u32,
        data: Bytes,
    ) -> BoxFuture<'_, Result<()>>;
}

macro_rules! impl_session {
    ($protocol:ty) => {
        impl Session for $protocol {
            fn name(&self) -> &str {
                <$protocol>::name(self)
            }

            fn enable(&self) {
                <$protocol>::enable(self)
            }

            fn disable(&self) -> BoxFuture<'_, ()> {
                Box::pin(<$protocol>::disable(self))
            }

            fn state(&self) -> ConnectionState {
                <$protocol>::state(self)
            }

            fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
                <$protocol>::subscribe(self)
            }

            fn send_and_wait(
                &self,
                stream: u8,
                function: u8,
                data: Bytes,
            ) -> BoxFuture<'_, Result<Option<SecsMessage>>> {
                Box::pin(<$protocol>::send_and_wait(self, stream, function, data))
            }

            fn send_message(
                &self,
                stream: u8,
                function: u8,
                require_response: bool,
                data: Bytes,
            ) -> BoxFuture<'_, Result<u32>> {
                Box::pin(<$protocol>::send_message(
                    self,
                    stream,
                    function,
                    require_response,
                    data,
                ))
            }

            fn send_reply(
                &self,
                stream: u8,
                function: u8,
                system: u32,
                data: Bytes,
            ) -> BoxFuture<'_, Result<()>> {
                Box::pin(<$protocol>::send_reply(self, stream, function, system, data))
            }
        }
    };
}

impl_session!(HsmsProtocol);
impl_session!(SecsIProtocol);

/// Builds a session from [`Settings`] plus the application's handlers.
///
/// ```ignore
/// let session = SessionBuilder::new("tool-1", Settings::load(path)?)
///     .handle(1, 1, |_msg, ctx| async move { ctx.reply(Bytes::new()).await })?
///     .build()?;
/// session.enable();
/// ```
pub struct SessionBuilder {
    name: String,
    settings: Settings,
    handlers: HandlerRegistry,
}

impl SessionBuilder {
    pub fn new(name: impl Into<String>, settings: Settings) -> Self {
        Self {
            name: name.into(),
            settings,
            handlers: HandlerRegistry::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Register the handler for primary message `S{stream}F{function}`.
    pub fn handle<F, Fut>(mut self, stream: u8, function: u8, handler: F) -> Result<Self>
    where
        F: Fn(SecsMessage, ReplyContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.register(stream, function, handler)?;
        Ok(self)
    }

    /// Build an HSMS session; fails for SECS-I transports.
    pub fn build_hsms(self) -> Result<HsmsProtocol> {
        if !self.settings.transport.is_hsms() {
            return Err(SecsError::Config(format!(
                "{}: transport is not HSMS",
                self.name
            )));
        }
        let endpoint = endpoint_for(&self.settings.transport)?;
        self.hsms_with_endpoint(endpoint)
    }

    /// Build a SECS-I session; fails for HSMS transports.
    pub fn build_secsi(self) -> Result<SecsIProtocol> {
        if self.settings.transport.is_hsms() {
            return Err(SecsError::Config(format!(
                "{}: transport is not SECS-I",
                self.name
            )));
        }
        let endpoint = endpoint_for(&self.settings.transport)?;
        self.secsi_with_endpoint(endpoint)
    }

    /// Build whichever engine the transport calls for.
    pub fn build(self) -> Result<Arc<dyn Session>> {
        let endpoint = endpoint_for(&self.settings.transport)?;
        self.build_with_endpoint(endpoint)
    }

    /// Build with a caller-supplied endpoint (shared listeners).
    pub(crate) fn build_with_endpoint(self, endpoint: Endpoint) -> Result<Arc<dyn Session>> {
        if self.settings.transport.is_hsms() {
            Ok(Arc::new(self.hsms_with_endpoint(endpoint)?))
        } else {
            Ok(Arc::new(self.secsi_with_endpoint(endpoint)?))
        }
    }

    fn hsms_with_endpoint(self, endpoint: Endpoint) -> Result<HsmsProtocol> {
        self.settings.validate()?;
        let s = self.settings;
        Ok(HsmsProtocol::new(
            self.name,
            s.session_id,
            s.timeouts,
            s.linktest_interval,
            endpoint,
            self.handlers,
        ))
    }

    fn secsi_with_endpoint(self, endpoint: Endpoint) -> Result<SecsIProtocol> {
        self.settings.validate()?;
        let s = self.settings;
        Ok(SecsIProtocol::new(
            self.name,
            s.session_id,
            s.role,
            s.timeouts,
            s.retry_limit,
            endpoint,
            self.handlers,
        ))
    }
}

fn endpoint_for(transport: &TransportSettings) -> Result<Endpoint> {
    if let Some((address, port, mode)) = transport.tcp() {
        let close_listener_after_accept = matches!(
            transport,
            TransportSettings::Hsms {
                close_listener_after_accept: true,
                ..
            } | TransportSettings::SecsiTcp {
                close_listener_after_accept: true,
                ..
            }
        );
        let target = format!("{}:{}", address, port);
        return Ok(match mode {
            ConnectMode::Active => Endpoint::active(target),
            ConnectMode::Passive => Endpoint::passive(target, close_listener_after_accept),
        });
    }
    serial_endpoint(transport)
}

#[cfg(feature = "serial")]
fn serial_endpoint(transport: &TransportSettings) -> Result<Endpoint> {
    match transport {
        TransportSettings::SecsiSerial { port, baud_rate } => Ok(Endpoint::Serial {
            port: port.clone(),
            baud_rate: *baud_rate,
        }),
        _ => Err(SecsError::Config("unsupported transport".to_string())),
    }
}

#[cfg(not(feature = "serial"))]
fn serial_endpoint(_transport: &TransportSettings) -> Result<Endpoint> {
    Err(SecsError::Config(
        "serial transport requires the `serial` feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceRole;

    fn settings(transport: TransportSettings) -> Settings {
        Settings {
            session_id: 7,
            transport,
            ..Settings::default()
        }
    }

    fn secsi_tcp() -> TransportSettings {
        TransportSettings::SecsiTcp {
            address: "127.0.0.1".to_string(),
            port: 5001,
            mode: ConnectMode::Passive,
            close_listener_after_accept: false,
        }
    }

    #[tokio::test]
    async fn test_build_picks_engine() {
        let hsms = SessionBuilder::new("a", settings(TransportSettings::default()))
            .build()
            .unwrap();
        assert_eq!(hsms.name(), "a");
        assert_eq!(hsms.state(), ConnectionState::NotConnected);

        assert!(SessionBuilder::new("b", settings(secsi_tcp())).build_secsi().is_ok());
        assert!(matches!(
            SessionBuilder::new("c", settings(secsi_tcp())).build_hsms(),
            Err(SecsError::Config(_))
        ));
    }

    #[test]
    fn test_handle_rejects_reply_function() {
        let result = SessionBuilder::new("a", Settings::default())
            .handle(1, 2, |_msg, _ctx| async { Ok(()) });
        assert!(matches!(result, Err(SecsError::InvalidHandler(_))));
    }

    #[test]
    fn test_build_validates_settings() {
        let mut s = settings(secsi_tcp());
        s.session_id = 0x8000;
        s.role = DeviceRole::Equipment;
        assert!(matches!(
            SessionBuilder::new("a", s).build(),
            Err(SecsError::Config(_))
        ));
    }

    #[test]
    fn test_passive_endpoint() {
        let endpoint = endpoint_for(&secsi_tcp()).unwrap();
        assert!(!endpoint.is_active());
        assert!(endpoint_for(&TransportSettings::default()).unwrap().is_active());
    }
}
