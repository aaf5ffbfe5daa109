//! HSMS session engine (SEMI E37).
//!
//! [`HsmsProtocol`] owns one [`Connection`] and runs the HSMS procedures on top
//! of it:
//!
//! - **Select**: the active side sends Select.req once connected and waits T6
//!   for Select.rsp; the passive side answers Select.req.
//! - **T7**: a connection still not selected after T7 is dropped.
//! - **Linktest**: Linktest.req every linktest interval; no Linktest.rsp within
//!   T6 drops the connection.
//! - **Reject**: unsupported s-types and p-types, and data while not selected,
//!   are answered with Reject.req.
//!
//! # Architecture
//!
//! ```text
//! Connection ─► event pump ─► ByteQueue ─► receive loop (FrameBuffer)
//!                                                │
//!                                                ▼
//!                  pending replies ◄─── dispatch loop ───► handlers / events
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::shared::{ProtocolEvent, SessionCore};
use super::pending::PendingReplies;
use super::state::{ConnectionState, Transition};
use crate::config::Timeouts;
use crate::container::BlockContainer;
use crate::dispatcher::{DispatchTarget, ProtocolDispatcher};
use crate::error::{Result, SecsError};
use crate::handler::{BoxFuture, HandlerRegistry, ReplySink};
use crate::protocol::{
    deselect_status, reject_reason, select_status, Block, FrameBuffer, HsmsBlock, HsmsHeader,
    SType, SecsMessage,
};
use crate::transport::{ByteQueue, Connection, ConnectionEvent, ConnectionOptions, Endpoint};

/// Per-session timers, aborted when the connection goes away.
#[derive(Default)]
struct Timers {
    linktest: Option<JoinHandle<()>>,
    t7: Option<JoinHandle<()>>,
    select: Option<JoinHandle<()>>,
}

impl Timers {
    fn abort_all(&mut self) {
        for task in [self.linktest.take(), self.t7.take(), self.select.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

struct Inner {
    session_id: u16,
    timeouts: Timeouts,
    linktest_interval: Duration,
    core: SessionCore,
    connection: Connection,
    connection_events: tokio::sync::Mutex<mpsc::UnboundedReceiver<ConnectionEvent>>,
    queue: ByteQueue,
    frames: Mutex<FrameBuffer>,
    container: Mutex<BlockContainer<HsmsBlock>>,
    pending: PendingReplies<HsmsBlock>,
    dispatcher: ProtocolDispatcher<HsmsBlock>,
    timers: Mutex<Timers>,
    pump: Mutex<Option<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
}

/// An HSMS session with one peer.
pub struct HsmsProtocol {
    inner: Arc<Inner>,
}

impl HsmsProtocol {
    pub fn new(
        name: impl Into<String>,
        session_id: u16,
        timeouts: Timeouts,
        linktest_interval: Duration,
        endpoint: Endpoint,
        handlers: HandlerRegistry,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = ConnectionOptions {
            connect_separation: timeouts.t5,
            write_timeout: timeouts.t8,
        };
        let (shutdown, _) = broadcast::channel(1);

        Self {
            inner: Arc::new(Inner {
                session_id,
                timeouts,
                linktest_interval,
                core: SessionCore::new(name.into(), handlers),
                connection: Connection::new(endpoint, options, tx),
                connection_events: tokio::sync::Mutex::new(rx),
                queue: ByteQueue::new(),
                frames: Mutex::new(FrameBuffer::new()),
                container: Mutex::new(BlockContainer::new()),
                pending: PendingReplies::new(),
                dispatcher: ProtocolDispatcher::new(),
                timers: Mutex::new(Timers::default()),
                pump: Mutex::new(None),
                shutdown,
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.inner.core.subscribe()
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Start the handler task, the dispatcher, the event pump and the
    /// connection.
    pub fn enable(&self) {
        let inner = &self.inner;
        inner.core.start_handlers();
        inner.dispatcher.start(inner);

        {
            let mut pump = lock(&inner.pump);
            if pump.as_ref().map_or(true, |p| p.is_finished()) {
                *pump = Some(tokio::spawn(event_pump(
                    inner.clone(),
                    inner.shutdown.subscribe(),
                )));
            }
        }

        inner.connection.enable();
        tracing::info!("[{}] HSMS session enabled", inner.core.name());
    }

    /// Separate (when selected), stop the connection and all loops.
    pub async fn disable(&self) {
        let inner = &self.inner;
        inner.connection.mark_disconnecting();
        inner.pending.clear();

        if inner.core.is_selected() {
            let header = HsmsHeader::separate_req(inner.core.next_system());
            if !inner.send_block(HsmsBlock::control(header)).await {
                tracing::debug!("[{}] Separate.req not sent", inner.core.name());
            }
        }

        inner.connection.disable().await;

        let _ = inner.shutdown.send(());
        let pump = lock(&inner.pump).take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        inner.dispatcher.stop().await;
        inner.core.stop_handlers().await;
        inner.reset_session();
        inner.core.try_fire(Transition::Disconnect);
        tracing::info!("[{}] HSMS session disabled", inner.core.name());
    }

    /// Send a primary message and wait up to T3 for its reply.
    ///
    /// `Ok(None)` when no reply arrived in time, the peer rejected the message
    /// or the connection went away meanwhile.
    pub async fn send_and_wait(
        &self,
        stream: u8,
        function: u8,
        data: Bytes,
    ) -> Result<Option<SecsMessage>> {
        let inner = &self.inner;
        if !inner.core.is_selected() {
            return Err(SecsError::NotSelected);
        }

        let system = inner.core.next_system();
        let header = HsmsHeader::data(inner.session_id, stream, function, true, system);
        let slot = inner.pending.register(system);
        if !inner.send_block(HsmsBlock::new(header, data)).await {
            return Err(SecsError::SendFailed);
        }

        let Some(reply) = slot.wait(inner.timeouts.t3).await else {
            tracing::warn!(
                "[{}] No reply to S{}F{} system={} within T3",
                inner.core.name(),
                stream,
                function,
                system
            );
            return Ok(None);
        };

        if reply.header.kind() == Some(SType::RejectReq) {
            tracing::warn!(
                "[{}] S{}F{} rejected, reason {}",
                inner.core.name(),
                stream,
                function,
                reply.header.reject_reason()
            );
            return Ok(None);
        }
        Ok(Some(to_secs_message(reply)))
    }

    /// Send a message without waiting for a reply; returns its system id.
    pub async fn send_message(
        &self,
        stream: u8,
        function: u8,
        require_response: bool,
        data: Bytes,
    ) -> Result<u32> {
        let inner = &self.inner;
        if !inner.core.is_selected() {
            return Err(SecsError::NotSelected);
        }

        let system = inner.core.next_system();
        let header = HsmsHeader::data(inner.session_id, stream, function, require_response, system);
        if !inner.send_block(HsmsBlock::new(header, data)).await {
            return Err(SecsError::SendFailed);
        }
        Ok(system)
    }

    /// Send a secondary message for the primary with system id `system`.
    pub async fn send_reply(&self, stream: u8, function: u8, system: u32, data: Bytes) -> Result<()> {
        self.inner.send_reply_block(stream, function, system, data).await
    }

    /// Send Select.req and wait T6; selects the session on status 0.
    pub async fn send_select_req(&self) -> Result<Option<HsmsBlock>> {
        self.inner.select().await
    }

    /// Send Deselect.req and wait T6; deselects the session on status 0.
    pub async fn send_deselect_req(&self) -> Result<Option<HsmsBlock>> {
        let inner = &self.inner;
        let reply = inner
            .control_transaction(HsmsHeader::deselect_req(inner.core.next_system()))
            .await?;
        if let Some(rsp) = &reply {
            if rsp.header.kind() == Some(SType::DeselectRsp)
                && rsp.header.status() == deselect_status::SUCCESS
            {
                inner.core.try_fire(Transition::Deselect);
            }
        }
        Ok(reply)
    }

    /// Send Linktest.req and wait T6.
    pub async fn send_linktest_req(&self) -> Result<Option<HsmsBlock>> {
        self.inner.linktest().await
    }

    /// Send Separate.req and drop the connection.
    ///
    /// Fails with [`SecsError::SendFailed`] when there is no connection.
    pub async fn send_separate_req(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.connection.is_connected() {
            return Err(SecsError::SendFailed);
        }
        let header = HsmsHeader::separate_req(inner.core.next_system());
        inner.connection.mark_disconnecting();
        let sent = inner.send_block(HsmsBlock::control(header)).await;
        inner.connection.disconnect();
        if sent {
            Ok(())
        } else {
            Err(SecsError::SendFailed)
        }
    }
}

impl Drop for HsmsProtocol {
    fn drop(&mut self) {
        // The pump and the timers hold the inner state alive.
        let _ = self.inner.shutdown.send(());
        lock(&self.inner.timers).abort_all();
        self.inner.core.abort_handlers();
    }
}

fn to_secs_message(block: HsmsBlock) -> SecsMessage {
    SecsMessage {
        session_id: block.header.session_id,
        stream: block.header.stream,
        function: block.header.function,
        require_response: block.header.require_response,
        system: block.header.system,
        data: block.data,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    async fn send_block(&self, block: HsmsBlock) -> bool {
        tracing::trace!("[{}] -> {:?}", self.core.name(), block.header);
        self.connection.send_data(block.encode()).await
    }

    async fn send_reply_block(&self, stream: u8, function: u8, system: u32, data: Bytes) -> Result<()> {
        let header = HsmsHeader::data(self.session_id, stream, function, false, system);
        if self.send_block(HsmsBlock::new(header, data)).await {
            Ok(())
        } else {
            Err(SecsError::SendFailed)
        }
    }

    /// Send a control request and wait T6 for whatever answers its system id.
    async fn control_transaction(&self, header: HsmsHeader) -> Result<Option<HsmsBlock>> {
        let slot = self.pending.register(header.system);
        if !self.send_block(HsmsBlock::control(header)).await {
            return Err(SecsError::SendFailed);
        }
        Ok(slot.wait(self.timeouts.t6).await)
    }

    async fn select(&self) -> Result<Option<HsmsBlock>> {
        let reply = self
            .control_transaction(HsmsHeader::select_req(self.core.next_system()))
            .await?;
        match &reply {
            Some(rsp) if rsp.header.kind() == Some(SType::SelectRsp) => {
                let status = rsp.header.status();
                if status == select_status::SUCCESS {
                    self.core.try_fire(Transition::Select);
                } else {
                    tracing::warn!("[{}] Select refused with status {}", self.core.name(), status);
                }
            }
            Some(rsp) => tracing::warn!(
                "[{}] Select.req answered with s-type {}",
                self.core.name(),
                rsp.header.s_type
            ),
            None => {}
        }
        Ok(reply)
    }

    async fn linktest(&self) -> Result<Option<HsmsBlock>> {
        self.control_transaction(HsmsHeader::linktest_req(self.core.next_system()))
            .await
    }

    async fn reject(&self, rejected: &HsmsHeader, reason: u8) {
        tracing::warn!(
            "[{}] Rejecting s-type {} p-type {} system={} (reason {})",
            self.core.name(),
            rejected.s_type,
            rejected.p_type,
            rejected.system,
            reason
        );
        self.send_block(HsmsBlock::control(HsmsHeader::reject_req(rejected, reason)))
            .await;
    }

    fn on_connected(self: &Arc<Self>) {
        self.reset_session();
        self.core.try_fire(Transition::Connect);
        self.core.publish(ProtocolEvent::Connected);

        let mut timers = lock(&self.timers);
        timers.abort_all();
        timers.linktest = Some(tokio::spawn(linktest_loop(self.clone())));
        timers.t7 = Some(tokio::spawn(t7_timer(self.clone())));
        if self.connection.is_active() {
            timers.select = Some(tokio::spawn(select_procedure(self.clone())));
        }
    }

    fn on_disconnected(&self) {
        lock(&self.timers).abort_all();
        self.reset_session();
        self.core.try_fire(Transition::Disconnect);
        self.core.publish(ProtocolEvent::Disconnected);
    }

    /// Drop all per-connection receive and correlation state.
    fn reset_session(&self) {
        self.pending.clear();
        self.queue.clear();
        self.dispatcher.discard_queued();
        lock(&self.frames).reset();
        lock(&self.container).clear();
    }

    async fn handle_control(self: &Arc<Self>, block: HsmsBlock) {
        let header = block.header;
        let Some(kind) = header.kind() else {
            self.reject(&header, reject_reason::STYPE_NOT_SUPPORTED).await;
            return;
        };

        let is_request = matches!(
            kind,
            SType::SelectReq | SType::DeselectReq | SType::LinktestReq
        );
        if is_request && self.connection.is_disconnecting() {
            self.reject(&header, reject_reason::ENTITY_NOT_SELECTED).await;
            return;
        }

        match kind {
            SType::SelectReq => {
                let status = match self.core.state() {
                    ConnectionState::Selected => select_status::ALREADY_ACTIVE,
                    ConnectionState::Connected | ConnectionState::NotSelected => {
                        self.core.try_fire(Transition::Select);
                        select_status::SUCCESS
                    }
                    ConnectionState::NotConnected => select_status::NOT_READY,
                };
                self.send_block(HsmsBlock::control(HsmsHeader::select_rsp(header.system, status)))
                    .await;
            }
            SType::DeselectReq => {
                let status = if self.core.try_fire(Transition::Deselect) {
                    deselect_status::SUCCESS
                } else {
                    deselect_status::NOT_ESTABLISHED
                };
                self.send_block(HsmsBlock::control(HsmsHeader::deselect_rsp(header.system, status)))
                    .await;
            }
            SType::LinktestReq => {
                self.send_block(HsmsBlock::control(HsmsHeader::linktest_rsp(header.system)))
                    .await;
            }
            SType::SeparateReq => {
                tracing::info!("[{}] Separate.req received", self.core.name());
                self.connection.mark_disconnecting();
                self.connection.disconnect();
            }
            kind if kind.is_response() => {
                if self.pending.resolve(header.system, block).is_some() {
                    tracing::debug!(
                        "[{}] Unexpected {:?} for system {}",
                        self.core.name(),
                        kind,
                        header.system
                    );
                    if kind != SType::RejectReq {
                        self.reject(&header, reject_reason::TRANSACTION_NOT_OPEN).await;
                    }
                }
            }
            _ => {
                self.reject(&header, reject_reason::STYPE_NOT_SUPPORTED).await;
            }
        }
    }

    async fn handle_data(self: &Arc<Self>, block: HsmsBlock) {
        if !self.core.is_selected() {
            self.reject(&block.header, reject_reason::ENTITY_NOT_SELECTED).await;
            return;
        }

        let Some(message) = lock(&self.container).add(block) else {
            return;
        };
        let Some(first) = message.blocks().first().cloned() else {
            return;
        };

        let secs = to_secs_message(first.clone());
        tracing::debug!("[{}] <- {}", self.core.name(), secs);

        if secs.is_primary() {
            let sink: Arc<dyn ReplySink> = self.clone();
            self.core.deliver(secs, sink);
        } else if self.pending.resolve(secs.system, first).is_some() {
            tracing::debug!("[{}] Unsolicited reply {}", self.core.name(), secs);
            self.core.publish(ProtocolEvent::MessageReceived(secs));
        }
    }
}

impl DispatchTarget<HsmsBlock> for Inner {
    fn drain(self: Arc<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            loop {
                let extracted = lock(&self.frames).extract(&self.queue);
                match extracted {
                    Ok(Some(block)) => self.dispatcher.enqueue(self.core.name(), block),
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        tracing::error!("[{}] {}, disconnecting", self.core.name(), e);
                        self.connection.disconnect();
                        return Err(e);
                    }
                }
            }
        })
    }

    fn handle_block(self: Arc<Self>, _source: String, block: HsmsBlock) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let header = block.header;
            tracing::trace!("[{}] <- {:?}", self.core.name(), header);

            if header.p_type != 0 {
                self.reject(&header, reject_reason::PTYPE_NOT_SUPPORTED).await;
            } else if header.is_control() {
                self.handle_control(block).await;
            } else {
                self.handle_data(block).await;
            }
            Ok(())
        })
    }
}

impl ReplySink for Inner {
    fn send_reply(
        self: Arc<Self>,
        stream: u8,
        function: u8,
        system: u32,
        data: Bytes,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move { self.send_reply_block(stream, function, system, data).await })
    }
}

/// Feed connection events into the session until shut down.
async fn event_pump(inner: Arc<Inner>, mut shutdown: broadcast::Receiver<()>) {
    let mut events = inner.connection_events.lock().await;
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => event,
            _ = shutdown.recv() => break,
        };
        let Some(event) = event else { break };

        match event {
            ConnectionEvent::Connected => inner.on_connected(),
            ConnectionEvent::Data(bytes) => {
                inner.queue.push(&bytes);
                inner.dispatcher.trigger_receive();
            }
            ConnectionEvent::Disconnecting => inner.pending.clear(),
            ConnectionEvent::Disconnected => inner.on_disconnected(),
        }
    }
}

async fn select_procedure(inner: Arc<Inner>) {
    match inner.select().await {
        Ok(Some(_)) => {}
        Ok(None) => {
            tracing::warn!("[{}] No Select.rsp within T6, disconnecting", inner.core.name());
            inner.connection.disconnect();
        }
        Err(e) => {
            tracing::warn!("[{}] Select.req failed: {}", inner.core.name(), e);
            inner.connection.disconnect();
        }
    }
}

async fn t7_timer(inner: Arc<Inner>) {
    tokio::time::sleep(inner.timeouts.t7).await;
    if matches!(
        inner.core.state(),
        ConnectionState::Connected | ConnectionState::NotSelected
    ) {
        tracing::warn!("[{}] Not selected within T7, disconnecting", inner.core.name());
        inner.core.try_fire(Transition::TimeoutT7);
        inner.connection.disconnect();
    }
}

async fn linktest_loop(inner: Arc<Inner>) {
    let period = inner.linktest_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match inner.linktest().await {
            Ok(Some(_)) => tracing::trace!("[{}] Linktest ok", inner.core.name()),
            Ok(None) => {
                tracing::warn!("[{}] No Linktest.rsp within T6, disconnecting", inner.core.name());
                inner.connection.disconnect();
                return;
            }
            Err(e) => {
                tracing::warn!("[{}] Linktest failed: {}", inner.core.name(), e);
                inner.connection.disconnect();
                return;
            }
        }
    }
}
