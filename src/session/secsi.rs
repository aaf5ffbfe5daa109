//! SECS-I session engine (SEMI E4).
//!
//! The line is half-duplex. A single line task owns it and alternates between
//! receiving (the peer sent ENQ) and sending (a block was handed over through
//! a [`BlockSendInfo`]):
//!
//! ```text
//! send:    ENQ ─► wait EOT (T2) ─► block ─► wait ACK (T2)    NAK/timeout: retry up to RTY
//! receive: ENQ ◄─ EOT ─► length (T2) ─► header+data+checksum (T1 per char) ─► ACK | NAK
//! ```
//!
//! When both sides send ENQ at once the equipment yields and receives first;
//! the host keeps waiting for EOT. SECS-I has no select procedure, so a
//! connected link is a selected session.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::shared::{ProtocolEvent, SessionCore};
use super::pending::PendingReplies;
use super::state::{ConnectionState, Transition};
use crate::config::{DeviceRole, Timeouts};
use crate::container::BlockContainer;
use crate::dispatcher::{DispatchTarget, ProtocolDispatcher};
use crate::error::{Result, SecsError};
use crate::handler::{BoxFuture, HandlerRegistry, ReplySink};
use crate::protocol::{
    control, Block, SecsIBlock, SecsIHeader, SecsMessage, MAX_BLOCK_LENGTH, MIN_BLOCK_LENGTH,
};
use crate::transport::{ByteQueue, Connection, ConnectionEvent, ConnectionOptions, Endpoint};

/// Blocks waiting for the line task.
const SEND_QUEUE_CAPACITY: usize = 64;

/// One encoded block handed to the line task.
#[derive(Debug)]
pub struct BlockSendInfo {
    pub data: Bytes,
    /// `true` once the peer acknowledged the block.
    pub result: oneshot::Sender<bool>,
}

/// Outcome of waiting for EOT after our ENQ.
enum Handshake {
    Ready,
    Contention,
    Timeout,
}

struct Inner {
    device_id: u16,
    from_equipment: bool,
    timeouts: Timeouts,
    retry_limit: u8,
    core: SessionCore,
    connection: Connection,
    connection_events: tokio::sync::Mutex<mpsc::UnboundedReceiver<ConnectionEvent>>,
    queue: ByteQueue,
    container: Mutex<BlockContainer<SecsIBlock>>,
    pending: PendingReplies<SecsMessage>,
    dispatcher: ProtocolDispatcher<SecsIBlock>,
    send_tx: mpsc::Sender<BlockSendInfo>,
    send_rx: tokio::sync::Mutex<mpsc::Receiver<BlockSendInfo>>,
    /// Header of the last accepted block, for duplicate detection.
    last_received: Mutex<Option<SecsIHeader>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
}

/// A SECS-I session with one peer.
pub struct SecsIProtocol {
    inner: Arc<Inner>,
}

impl SecsIProtocol {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        device_id: u16,
        role: DeviceRole,
        timeouts: Timeouts,
        retry_limit: u8,
        endpoint: Endpoint,
        handlers: HandlerRegistry,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = ConnectionOptions {
            connect_separation: timeouts.t5,
            write_timeout: timeouts.t8,
        };
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (shutdown, _) = broadcast::channel(1);

        Self {
            inner: Arc::new(Inner {
                device_id,
                from_equipment: role == DeviceRole::Equipment,
                timeouts,
                retry_limit,
                core: SessionCore::new(name.into(), handlers),
                connection: Connection::new(endpoint, options, tx),
                connection_events: tokio::sync::Mutex::new(rx),
                queue: ByteQueue::new(),
                container: Mutex::new(BlockContainer::new()),
                pending: PendingReplies::new(),
                dispatcher: ProtocolDispatcher::new(),
                send_tx,
                send_rx: tokio::sync::Mutex::new(send_rx),
                last_received: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
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

    /// Start the handler task, the dispatcher, the line task and the
    /// connection.
    pub fn enable(&self) {
        let inner = &self.inner;
        inner.core.start_handlers();
        inner.dispatcher.start(inner);

        {
            let mut tasks = lock(&inner.tasks);
            if tasks.iter().all(|t| t.is_finished()) {
                tasks.clear();
                tasks.push(tokio::spawn(event_pump(
                    inner.clone(),
                    inner.shutdown.subscribe(),
                )));
                tasks.push(tokio::spawn(line_loop(
                    inner.clone(),
                    inner.shutdown.subscribe(),
                )));
            }
        }

        inner.connection.enable();
        tracing::info!("[{}] SECS-I session enabled", inner.core.name());
    }

    /// Stop the connection, the line task and the dispatcher.
    pub async fn disable(&self) {
        let inner = &self.inner;
        inner.connection.mark_disconnecting();
        inner.pending.clear();
        inner.connection.disable().await;

        let _ = inner.shutdown.send(());
        let tasks: Vec<_> = lock(&inner.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        // Fail whatever was still queued for the line.
        {
            let mut outgoing = inner.send_rx.lock().await;
            while let Ok(info) = outgoing.try_recv() {
                let _ = info.result.send(false);
            }
        }

        inner.dispatcher.stop().await;
        inner.core.stop_handlers().await;
        inner.reset_session();
        inner.core.try_fire(Transition::Disconnect);
        tracing::info!("[{}] SECS-I session disabled", inner.core.name());
    }

    /// Send a primary message and wait up to T3 for its reply.
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
        let header = inner.header(stream, function, true, system);
        let slot = inner.pending.register(system);
        inner.send_blocks(header, &data).await?;

        let reply = slot.wait(inner.timeouts.t3).await;
        if reply.is_none() {
            tracing::warn!(
                "[{}] No reply to S{}F{} system={} within T3",
                inner.core.name(),
                stream,
                function,
                system
            );
        }
        Ok(reply)
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
        inner
            .send_blocks(inner.header(stream, function, require_response, system), &data)
            .await?;
        Ok(system)
    }

    /// Send a secondary message for the primary with system id `system`.
    pub async fn send_reply(&self, stream: u8, function: u8, system: u32, data: Bytes) -> Result<()> {
        let inner = &self.inner;
        inner
            .send_blocks(inner.header(stream, function, false, system), &data)
            .await
    }
}

impl Drop for SecsIProtocol {
    fn drop(&mut self) {
        let _ = self.inner.shutdown.send(());
        self.inner.core.abort_handlers();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    fn header(&self, stream: u8, function: u8, require_response: bool, system: u32) -> SecsIHeader {
        SecsIHeader::new(
            self.device_id,
            self.from_equipment,
            stream,
            function,
            require_response,
            system,
        )
    }

    /// Split `data` into blocks and hand them to the line task one by one.
    async fn send_blocks(&self, header: SecsIHeader, data: &Bytes) -> Result<()> {
        for block in SecsIBlock::split(header, data) {
            let (result, done) = oneshot::channel();
            self.send_tx
                .send(BlockSendInfo {
                    data: block.encode(),
                    result,
                })
                .await
                .map_err(|_| SecsError::ConnectionClosed)?;

            if !done.await.unwrap_or(false) {
                return Err(SecsError::SendFailed);
            }
        }
        Ok(())
    }

    async fn send_control(&self, byte: u8) -> bool {
        self.connection.send_data(Bytes::copy_from_slice(&[byte])).await
    }

    /// Line protocol for one outbound block.
    async fn send_block(&self, encoded: &Bytes) -> bool {
        let mut attempts: u8 = 0;
        loop {
            if attempts > self.retry_limit {
                tracing::warn!("[{}] Block not delivered after {} retries", self.core.name(), self.retry_limit);
                return false;
            }
            if !self.send_control(control::ENQ).await {
                return false;
            }

            match self.wait_for_eot().await {
                Handshake::Ready => {}
                Handshake::Contention => {
                    tracing::debug!("[{}] Line contention, receiving first", self.core.name());
                    self.receive_block().await;
                    continue;
                }
                Handshake::Timeout => {
                    attempts += 1;
                    tracing::debug!("[{}] No EOT within T2 (attempt {})", self.core.name(), attempts);
                    continue;
                }
            }

            if !self.connection.send_data(encoded.clone()).await {
                return false;
            }

            if self.queue.wait_for(1, self.timeouts.t2).await {
                match self.queue.pop_byte() {
                    Some(control::ACK) => return true,
                    Some(byte) => {
                        tracing::debug!("[{}] Block not acknowledged (0x{:02X})", self.core.name(), byte)
                    }
                    None => {}
                }
            } else {
                tracing::debug!("[{}] No ACK within T2", self.core.name());
            }
            attempts += 1;
        }
    }

    async fn wait_for_eot(&self) -> Handshake {
        let deadline = Instant::now() + self.timeouts.t2;
        loop {
            if !self.queue.wait_until_deadline(1, deadline).await {
                return Handshake::Timeout;
            }
            match self.queue.pop_byte() {
                Some(control::EOT) => return Handshake::Ready,
                Some(control::ENQ) if self.from_equipment => return Handshake::Contention,
                Some(control::ENQ) => {}
                Some(byte) => {
                    tracing::debug!("[{}] Ignoring 0x{:02X} while waiting for EOT", self.core.name(), byte)
                }
                None => {}
            }
        }
    }

    /// Line protocol for one inbound block; the peer's ENQ is already consumed.
    async fn receive_block(&self) {
        if !self.send_control(control::EOT).await {
            return;
        }

        if !self.queue.wait_for(1, self.timeouts.t2).await {
            tracing::warn!("[{}] No block within T2 after EOT", self.core.name());
            self.send_control(control::NAK).await;
            return;
        }
        let Some(length) = self.queue.pop_byte() else {
            return;
        };
        if !(MIN_BLOCK_LENGTH..=MAX_BLOCK_LENGTH).contains(&length) {
            tracing::warn!("[{}] Invalid block length {}", self.core.name(), length);
            self.discard_until_quiet().await;
            self.send_control(control::NAK).await;
            return;
        }

        // Length byte, header + data, checksum.
        let total = 1 + length as usize + 2;
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(length);
        while buf.len() < total {
            if !self.queue.wait_for(1, self.timeouts.t1).await {
                tracing::warn!(
                    "[{}] T1 expired after {} of {} bytes",
                    self.core.name(),
                    buf.len(),
                    total
                );
                self.send_control(control::NAK).await;
                return;
            }
            let wanted = self.queue.len().min(total - buf.len());
            if let Some(chunk) = self.queue.pop(wanted) {
                buf.extend_from_slice(&chunk);
            }
        }

        let Some(block) = SecsIBlock::decode(&buf) else {
            tracing::warn!("[{}] Checksum mismatch, sending NAK", self.core.name());
            self.discard_until_quiet().await;
            self.send_control(control::NAK).await;
            return;
        };
        self.send_control(control::ACK).await;

        {
            let mut last = lock(&self.last_received);
            if *last == Some(block.header) {
                tracing::debug!("[{}] Duplicate block ignored: {:?}", self.core.name(), block.header);
                return;
            }
            *last = Some(block.header);
        }

        if block.header.device_id != self.device_id {
            tracing::warn!(
                "[{}] Block for device {} ignored (expected {})",
                self.core.name(),
                block.header.device_id,
                self.device_id
            );
            return;
        }

        self.dispatcher.enqueue(self.core.name(), block);
    }

    /// Read until the line stays quiet for T1.
    async fn discard_until_quiet(&self) {
        while self.queue.wait_for(1, self.timeouts.t1).await {
            self.queue.clear();
        }
    }

    fn on_connected(&self) {
        self.reset_session();
        self.core.try_fire(Transition::Connect);
        self.core.try_fire(Transition::Select);
        self.core.publish(ProtocolEvent::Connected);
    }

    fn on_disconnected(&self) {
        self.reset_session();
        self.core.try_fire(Transition::Disconnect);
        self.core.publish(ProtocolEvent::Disconnected);
    }

    fn reset_session(&self) {
        self.pending.clear();
        self.queue.clear();
        self.dispatcher.discard_queued();
        lock(&self.container).clear();
        *lock(&self.last_received) = None;
    }
}

impl DispatchTarget<SecsIBlock> for Inner {
    fn handle_block(self: Arc<Self>, _source: String, block: SecsIBlock) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let (evicted, completed) = {
                let mut container = lock(&self.container);
                let evicted = container.evict_idle(self.timeouts.t4);
                (evicted, container.add(block))
            };
            for system in evicted {
                tracing::warn!(
                    "[{}] Discarded partial message system={} after T4",
                    self.core.name(),
                    system
                );
            }

            let Some(secs) = completed.and_then(|m| m.to_secs_message()) else {
                return Ok(());
            };
            tracing::debug!("[{}] <- {}", self.core.name(), secs);

            if !self.core.is_selected() {
                tracing::debug!("[{}] Not connected, dropping {}", self.core.name(), secs);
                return Ok(());
            }

            if secs.is_primary() {
                let sink: Arc<dyn ReplySink> = self.clone();
                self.core.deliver(secs, sink);
            } else if let Some(secs) = self.pending.resolve(secs.system, secs) {
                tracing::debug!("[{}] Unsolicited reply {}", self.core.name(), secs);
                self.core.publish(ProtocolEvent::MessageReceived(secs));
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
        Box::pin(async move {
            let header = self.header(stream, function, false, system);
            self.send_blocks(header, &data).await
        })
    }
}

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
            ConnectionEvent::Data(bytes) => inner.queue.push(&bytes),
            ConnectionEvent::Disconnecting => inner.pending.clear(),
            ConnectionEvent::Disconnected => inner.on_disconnected(),
        }
    }
}

/// Owns the line: answers the peer's ENQ and sends queued blocks.
async fn line_loop(inner: Arc<Inner>, mut shutdown: broadcast::Receiver<()>) {
    let mut outgoing = inner.send_rx.lock().await;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            _ = inner.queue.readable(1) => match inner.queue.pop_byte() {
                Some(control::ENQ) => inner.receive_block().await,
                Some(byte) => tracing::debug!("[{}] Ignoring 0x{:02X} on idle line", inner.core.name(), byte),
                None => {}
            },
            info = outgoing.recv() => {
                let Some(info) = info else { break };
                let sent = inner.send_block(&info.data).await;
                let _ = info.result.send(sent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const SETTLE: Duration = Duration::from_millis(20);

    fn timeouts() -> Timeouts {
        Timeouts {
            t1: Duration::from_millis(200),
            t2: Duration::from_millis(300),
            t3: Duration::from_secs(2),
            t5: Duration::from_millis(50),
            ..Timeouts::default()
        }
    }

    /// A host session connected to a raw socket playing the equipment.
    async fn host_with_raw_peer(handlers: HandlerRegistry) -> (SecsIProtocol, TcpStream) {
        with_raw_peer(DeviceRole::Host, handlers).await
    }

    /// A session in `role` connected to a raw socket playing the other side.
    async fn with_raw_peer(role: DeviceRole, handlers: HandlerRegistry) -> (SecsIProtocol, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let host = SecsIProtocol::new(
            "session",
            1,
            role,
            timeouts(),
            2,
            Endpoint::active(address),
            handlers,
        );
        let mut events = host.subscribe();
        host.enable();

        let (peer, _) = listener.accept().await.unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if event == ProtocolEvent::Connected {
                break;
            }
        }
        assert_eq!(host.state(), ConnectionState::Selected);
        (host, peer)
    }

    async fn read_byte(peer: &mut TcpStream) -> u8 {
        tokio::time::timeout(Duration::from_secs(2), peer.read_u8())
            .await
            .unwrap()
            .unwrap()
    }

    async fn read_block(peer: &mut TcpStream) -> SecsIBlock {
        let length = read_byte(peer).await;
        let mut rest = vec![0u8; length as usize + 2];
        peer.read_exact(&mut rest).await.unwrap();
        let mut buf = vec![length];
        buf.extend_from_slice(&rest);
        SecsIBlock::decode(&buf).unwrap()
    }

    #[tokio::test]
    async fn test_send_block_handshake() {
        let (host, mut peer) = host_with_raw_peer(HandlerRegistry::new()).await;

        let sender = tokio::spawn(async move {
            let system = host
                .send_message(1, 1, false, Bytes::from_static(b"abc"))
                .await
                .unwrap();
            (host, system)
        });

        assert_eq!(read_byte(&mut peer).await, control::ENQ);
        peer.write_all(&[control::EOT]).await.unwrap();
        let block = read_block(&mut peer).await;
        peer.write_all(&[control::ACK]).await.unwrap();

        let (host, system) = sender.await.unwrap();
        assert_eq!(block.header.system, system);
        assert!(!block.header.from_equipment);
        assert_eq!(&block.data[..], b"abc");
        host.disable().await;
    }

    #[tokio::test]
    async fn test_nak_is_retried() {
        let (host, mut peer) = host_with_raw_peer(HandlerRegistry::new()).await;

        let sender = tokio::spawn(async move {
            let result = host.send_message(2, 17, false, Bytes::new()).await;
            (host, result)
        });

        for _ in 0..2 {
            assert_eq!(read_byte(&mut peer).await, control::ENQ);
            peer.write_all(&[control::EOT]).await.unwrap();
            read_block(&mut peer).await;
            peer.write_all(&[control::NAK]).await.unwrap();
        }
        assert_eq!(read_byte(&mut peer).await, control::ENQ);
        peer.write_all(&[control::EOT]).await.unwrap();
        read_block(&mut peer).await;
        peer.write_all(&[control::ACK]).await.unwrap();

        let (host, result) = sender.await.unwrap();
        assert!(result.is_ok());
        host.disable().await;
    }

    #[tokio::test]
    async fn test_retry_limit_fails_send() {
        let (host, mut peer) = host_with_raw_peer(HandlerRegistry::new()).await;

        // Never answer ENQ: 1 attempt + 2 retries, each waiting T2.
        let result = host.send_message(1, 1, false, Bytes::new()).await;
        assert!(matches!(result, Err(SecsError::SendFailed)));

        let mut enqs = 0;
        while let Ok(Ok(byte)) = tokio::time::timeout(SETTLE, peer.read_u8()).await {
            assert_eq!(byte, control::ENQ);
            enqs += 1;
        }
        assert_eq!(enqs, 3);
        host.disable().await;
    }

    #[tokio::test]
    async fn test_receive_block_and_reply() {
        let mut handlers = HandlerRegistry::new();
        handlers
            .register(1, 1, |msg, ctx| async move {
                assert_eq!(&msg.data[..], b"ping");
                ctx.reply(Bytes::from_static(b"pong")).await
            })
            .unwrap();
        let (host, mut peer) = host_with_raw_peer(handlers).await;

        let header = SecsIHeader::new(1, true, 1, 1, true, 0xABCD);
        let block = SecsIBlock::new(header, Bytes::from_static(b"ping"));

        peer.write_all(&[control::ENQ]).await.unwrap();
        assert_eq!(read_byte(&mut peer).await, control::EOT);
        peer.write_all(&block.encode()).await.unwrap();
        assert_eq!(read_byte(&mut peer).await, control::ACK);

        // The handler's reply comes back through the line protocol.
        assert_eq!(read_byte(&mut peer).await, control::ENQ);
        peer.write_all(&[control::EOT]).await.unwrap();
        let reply = read_block(&mut peer).await;
        peer.write_all(&[control::ACK]).await.unwrap();

        assert_eq!(reply.header.function, 2);
        assert_eq!(reply.header.system, 0xABCD);
        assert!(!reply.header.require_response);
        assert_eq!(&reply.data[..], b"pong");
        host.disable().await;
    }

    #[tokio::test]
    async fn test_bad_checksum_gets_nak() {
        let (host, mut peer) = host_with_raw_peer(HandlerRegistry::new()).await;
        let mut events = host.subscribe();

        let header = SecsIHeader::new(1, true, 5, 1, false, 3);
        let mut bytes = SecsIBlock::new(header, Bytes::from_static(b"alarm")).encode().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        peer.write_all(&[control::ENQ]).await.unwrap();
        assert_eq!(read_byte(&mut peer).await, control::EOT);
        peer.write_all(&bytes).await.unwrap();

        // Trailing noise is swallowed, not taken for a new ENQ.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let noise_sent = std::time::Instant::now();
        peer.write_all(&[control::ENQ, 0x00]).await.unwrap();

        assert_eq!(read_byte(&mut peer).await, control::NAK);
        assert!(noise_sent.elapsed() >= timeouts().t1 - SETTLE);
        assert!(tokio::time::timeout(SETTLE * 5, peer.read_u8()).await.is_err());
        assert!(events.try_recv().is_err());
        host.disable().await;
    }

    #[tokio::test]
    async fn test_equipment_yields_on_contention() {
        let (equipment, mut peer) = with_raw_peer(DeviceRole::Equipment, HandlerRegistry::new()).await;
        let mut events = equipment.subscribe();

        let sender = tokio::spawn(async move {
            let result = equipment
                .send_message(5, 1, false, Bytes::from_static(b"alarm"))
                .await;
            (equipment, result)
        });

        // Both sides bid for the line.
        assert_eq!(read_byte(&mut peer).await, control::ENQ);
        peer.write_all(&[control::ENQ]).await.unwrap();

        // The equipment receives the host's block first.
        assert_eq!(read_byte(&mut peer).await, control::EOT);
        let header = SecsIHeader::new(1, false, 6, 12, false, 33);
        peer.write_all(&SecsIBlock::new(header, Bytes::new()).encode())
            .await
            .unwrap();
        assert_eq!(read_byte(&mut peer).await, control::ACK);

        // Then retries its own.
        assert_eq!(read_byte(&mut peer).await, control::ENQ);
        peer.write_all(&[control::EOT]).await.unwrap();
        let block = read_block(&mut peer).await;
        peer.write_all(&[control::ACK]).await.unwrap();

        let (equipment, result) = sender.await.unwrap();
        assert!(result.is_ok());
        assert!(block.header.from_equipment);
        assert_eq!(&block.data[..], b"alarm");

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ProtocolEvent::MessageReceived(msg) => assert_eq!(msg.system, 33),
            other => panic!("unexpected event {:?}", other),
        }
        equipment.disable().await;
    }

    #[tokio::test]
    async fn test_host_keeps_line_on_contention() {
        let (host, mut peer) = host_with_raw_peer(HandlerRegistry::new()).await;

        let sender = tokio::spawn(async move {
            let result = host.send_message(1, 1, false, Bytes::new()).await;
            (host, result)
        });

        assert_eq!(read_byte(&mut peer).await, control::ENQ);
        peer.write_all(&[control::ENQ]).await.unwrap();
        // The host does not answer the peer's ENQ.
        assert!(tokio::time::timeout(Duration::from_millis(100), peer.read_u8())
            .await
            .is_err());

        peer.write_all(&[control::EOT]).await.unwrap();
        read_block(&mut peer).await;
        peer.write_all(&[control::ACK]).await.unwrap();

        let (host, result) = sender.await.unwrap();
        assert!(result.is_ok());
        host.disable().await;
    }

    #[tokio::test]
    async fn test_duplicate_block_is_acknowledged_once_delivered() {
        let (host, mut peer) = host_with_raw_peer(HandlerRegistry::new()).await;
        let mut events = host.subscribe();

        let header = SecsIHeader::new(1, true, 6, 11, false, 21);
        let encoded = SecsIBlock::new(header, Bytes::from_static(b"event")).encode();

        for _ in 0..2 {
            peer.write_all(&[control::ENQ]).await.unwrap();
            assert_eq!(read_byte(&mut peer).await, control::EOT);
            peer.write_all(&encoded).await.unwrap();
            assert_eq!(read_byte(&mut peer).await, control::ACK);
        }

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ProtocolEvent::MessageReceived(msg) => assert_eq!(msg.system, 21),
            other => panic!("unexpected event {:?}", other),
        }
        tokio::time::sleep(SETTLE * 5).await;
        assert!(events.try_recv().is_err());
        host.disable().await;
    }

    #[tokio::test]
    async fn test_send_and_wait_not_selected() {
        let host = SecsIProtocol::new(
            "host",
            1,
            DeviceRole::Host,
            timeouts(),
            3,
            Endpoint::active("127.0.0.1:1"),
            HandlerRegistry::new(),
        );
        let err = host.send_and_wait(1, 1, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, SecsError::NotSelected));
    }
}
