//! Byte-level connection with a background runner.
//!
//! A [`Connection`] owns the link to one peer. While enabled, a runner task
//! establishes the link (connect, accept, take a routed socket or open a serial
//! port), pumps received bytes out as [`ConnectionEvent::Data`] and hands the
//! write half to a [`writer`](crate::writer) task. When a session ends the runner
//! emits `Disconnecting` then `Disconnected` and, depending on the endpoint,
//! establishes the next one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle, DEFAULT_CHANNEL_CAPACITY};

/// Read buffer size for one socket read.
const READ_BUFFER_SIZE: usize = 8192;

/// Lifecycle and data notifications, in the order they happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Data(Bytes),
    /// The session is ending; no further sends will succeed.
    Disconnecting,
    Disconnected,
}

/// How the link is established.
#[derive(Debug)]
pub enum Endpoint {
    /// Connect to `address` ("host:port"), retrying after T5.
    Active { address: String },
    /// Listen on `bind` ("addr:port") and serve one peer at a time.
    Passive {
        bind: String,
        /// Close the listener while a peer is connected, re-bind afterwards.
        close_listener_after_accept: bool,
    },
    /// Sockets accepted by a shared listener and routed to this connection.
    Routed {
        incoming: tokio::sync::Mutex<mpsc::Receiver<TcpStream>>,
    },
    /// Serial line.
    #[cfg(feature = "serial")]
    Serial { port: String, baud_rate: u32 },
}

impl Endpoint {
    pub fn active(address: impl Into<String>) -> Self {
        Endpoint::Active {
            address: address.into(),
        }
    }

    pub fn passive(bind: impl Into<String>, close_listener_after_accept: bool) -> Self {
        Endpoint::Passive {
            bind: bind.into(),
            close_listener_after_accept,
        }
    }

    pub fn routed(incoming: mpsc::Receiver<TcpStream>) -> Self {
        Endpoint::Routed {
            incoming: tokio::sync::Mutex::new(incoming),
        }
    }

    /// Whether this side opens the connection.
    pub fn is_active(&self) -> bool {
        matches!(self, Endpoint::Active { .. })
    }
}

/// Connection timing.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Delay between connection attempts (T5).
    pub connect_separation: Duration,
    /// Bound on one send (T8).
    pub write_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_separation: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
        }
    }
}

struct Shared {
    endpoint: Endpoint,
    options: ConnectionOptions,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    enabled: watch::Sender<bool>,
    connected: AtomicBool,
    disconnecting: AtomicBool,
    writer: Mutex<Option<WriterHandle>>,
    /// Stop signal of the current session.
    session_stop: Mutex<Option<Arc<Notify>>>,
}

/// A connection to one peer.
pub struct Connection {
    shared: Arc<Shared>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(
        endpoint: Endpoint,
        options: ConnectionOptions,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (enabled, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                endpoint,
                options,
                events,
                enabled,
                connected: AtomicBool::new(false),
                disconnecting: AtomicBool::new(false),
                writer: Mutex::new(None),
                session_stop: Mutex::new(None),
            }),
            runner: Mutex::new(None),
        }
    }

    /// Start the runner. No-op while it is already running.
    pub fn enable(&self) {
        let mut runner = lock(&self.runner);
        if runner.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.shared.enabled.send_replace(true);
        *runner = Some(tokio::spawn(run(self.shared.clone())));
    }

    /// Stop the runner and wait for it to finish. No-op when not running.
    pub async fn disable(&self) {
        self.shared.enabled.send_replace(false);
        let runner = lock(&self.runner).take();
        if let Some(runner) = runner {
            if let Err(e) = runner.await {
                if e.is_panic() {
                    tracing::error!("Connection runner panicked: {}", e);
                }
            }
        }
        self.shared.disconnecting.store(false, Ordering::Release);
    }

    /// End the current session. Active and passive endpoints establish a new one.
    pub fn disconnect(&self) {
        if let Some(stop) = lock(&self.shared.session_stop).as_ref() {
            stop.notify_one();
        }
    }

    /// Flag the session as ending before the socket actually closes.
    pub(crate) fn mark_disconnecting(&self) {
        self.shared.disconnecting.store(true, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        *self.shared.enabled.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn is_disconnecting(&self) -> bool {
        self.shared.disconnecting.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.shared.endpoint.is_active()
    }

    /// Send bytes to the peer.
    ///
    /// Returns `false` when not connected, on I/O error, or when the bytes were
    /// not written within the write timeout (T8).
    pub async fn send_data(&self, data: Bytes) -> bool {
        let Some(writer) = lock(&self.shared.writer).clone() else {
            tracing::debug!("Dropping {} bytes: not connected", data.len());
            return false;
        };

        match tokio::time::timeout(self.shared.options.write_timeout, writer.send(data)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!("Send failed: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!("Send not completed within T8");
                false
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.enabled.send_replace(false);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Resolves once the connection is disabled.
async fn disabled(enabled: &mut watch::Receiver<bool>) {
    let _ = enabled.wait_for(|on| !*on).await;
}

/// Sleep for `delay`; returns `false` if disabled meanwhile.
async fn pause(delay: Duration, enabled: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *enabled.borrow(),
        _ = disabled(enabled) => false,
    }
}

async fn run(shared: Arc<Shared>) {
    let mut enabled = shared.enabled.subscribe();
    let separation = shared.options.connect_separation;

    match &shared.endpoint {
        Endpoint::Active { address } => {
            let mut first = true;
            loop {
                if !first && !pause(separation, &mut enabled).await {
                    return;
                }
                first = false;
                if !*enabled.borrow() {
                    return;
                }

                let connected = tokio::select! {
                    result = TcpStream::connect(address.as_str()) => result,
                    _ = disabled(&mut enabled) => return,
                };
                match connected {
                    Ok(stream) => {
                        tracing::info!("Connected to {}", address);
                        let _ = stream.set_nodelay(true);
                        run_session(&shared, stream, &mut enabled).await;
                    }
                    Err(e) => tracing::debug!("Connect to {} failed: {}", address, e),
                }
            }
        }

        Endpoint::Passive {
            bind,
            close_listener_after_accept,
        } => loop {
            let listener = match TcpListener::bind(bind.as_str()).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!("Failed to listen on {}: {}", bind, e);
                    if !pause(separation, &mut enabled).await {
                        return;
                    }
                    continue;
                }
            };
            tracing::info!("Listening on {}", bind);

            loop {
                let accepted = tokio::select! {
                    result = listener.accept() => result,
                    _ = disabled(&mut enabled) => return,
                };
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept on {} failed: {}", bind, e);
                        continue;
                    }
                };
                tracing::info!("Accepted {} on {}", peer, bind);
                let _ = stream.set_nodelay(true);

                if *close_listener_after_accept {
                    drop(listener);
                    run_session(&shared, stream, &mut enabled).await;
                    break;
                }
                run_session(&shared, stream, &mut enabled).await;
                if !*enabled.borrow() {
                    return;
                }
            }

            if !*enabled.borrow() {
                return;
            }
        },

        Endpoint::Routed { incoming } => {
            let mut incoming = incoming.lock().await;
            loop {
                let stream = tokio::select! {
                    stream = incoming.recv() => stream,
                    _ = disabled(&mut enabled) => return,
                };
                let Some(stream) = stream else {
                    tracing::debug!("Shared listener closed");
                    return;
                };
                let _ = stream.set_nodelay(true);
                run_session(&shared, stream, &mut enabled).await;
                if !*enabled.borrow() {
                    return;
                }
            }
        }

        #[cfg(feature = "serial")]
        Endpoint::Serial { port, baud_rate } => {
            use tokio_serial::SerialPortBuilderExt;

            loop {
                match tokio_serial::new(port.as_str(), *baud_rate).open_native_async() {
                    Ok(stream) => {
                        tracing::info!("Opened serial port {} at {} baud", port, baud_rate);
                        run_session(&shared, stream, &mut enabled).await;
                    }
                    Err(e) => tracing::warn!("Failed to open serial port {}: {}", port, e),
                }
                if !pause(separation, &mut enabled).await {
                    return;
                }
            }
        }
    }
}

/// Serve one established stream until it closes, fails or is stopped.
async fn run_session<S>(shared: &Shared, stream: S, enabled: &mut watch::Receiver<bool>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, write_half) = tokio::io::split(stream);
    let (writer, writer_task) = spawn_writer_task(
        write_half,
        WriterConfig {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            write_timeout: shared.options.write_timeout,
        },
    );
    let stop = Arc::new(Notify::new());

    *lock(&shared.session_stop) = Some(stop.clone());
    *lock(&shared.writer) = Some(writer.clone());
    shared.disconnecting.store(false, Ordering::Release);
    shared.connected.store(true, Ordering::Release);
    let _ = shared.events.send(ConnectionEvent::Connected);

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::info!("Peer closed the connection");
                    break;
                }
                Ok(n) => {
                    let _ = shared.events.send(ConnectionEvent::Data(Bytes::copy_from_slice(&buf[..n])));
                }
                Err(e) => {
                    tracing::warn!("Read error: {}", e);
                    break;
                }
            },
            _ = writer.closed() => {
                tracing::warn!("Writer task ended, closing connection");
                break;
            }
            _ = stop.notified() => {
                tracing::debug!("Disconnect requested");
                break;
            }
            _ = disabled(enabled) => break,
        }
    }

    shared.disconnecting.store(true, Ordering::Release);
    let _ = shared.events.send(ConnectionEvent::Disconnecting);

    lock(&shared.session_stop).take();
    lock(&shared.writer).take();
    drop(writer);
    writer_task.abort();

    shared.connected.store(false, Ordering::Release);
    let _ = shared.events.send(ConnectionEvent::Disconnected);
    shared.disconnecting.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            connect_separation: Duration::from_millis(50),
            write_timeout: Duration::from_secs(1),
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_active_connect_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = Connection::new(Endpoint::active(address), options(), tx);
        connection.enable();

        let (mut peer, _) = listener.accept().await.unwrap();
        assert_eq!(next(&mut rx).await, ConnectionEvent::Connected);
        assert!(connection.is_connected());

        assert!(connection.send_data(Bytes::from_static(b"ping")).await);
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            ConnectionEvent::Data(Bytes::from_static(b"pong"))
        );

        drop(peer);
        assert_eq!(next(&mut rx).await, ConnectionEvent::Disconnecting);
        assert_eq!(next(&mut rx).await, ConnectionEvent::Disconnected);
        assert!(!connection.is_connected());

        // Reconnects after the separation delay.
        let (_peer, _) = listener.accept().await.unwrap();
        assert_eq!(next(&mut rx).await, ConnectionEvent::Connected);

        connection.disable().await;
        assert_eq!(next(&mut rx).await, ConnectionEvent::Disconnecting);
        assert_eq!(next(&mut rx).await, ConnectionEvent::Disconnected);
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = Connection::new(Endpoint::active("127.0.0.1:1"), options(), tx);
        assert!(!connection.send_data(Bytes::from_static(b"x")).await);
    }

    #[tokio::test]
    async fn test_disconnect_ends_session_only() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = Connection::new(Endpoint::active(address), options(), tx);
        connection.enable();
        let (_peer, _) = listener.accept().await.unwrap();
        assert_eq!(next(&mut rx).await, ConnectionEvent::Connected);

        connection.disconnect();
        assert_eq!(next(&mut rx).await, ConnectionEvent::Disconnecting);
        assert_eq!(next(&mut rx).await, ConnectionEvent::Disconnected);
        assert!(connection.is_enabled());

        connection.disable().await;
        assert!(!connection.is_enabled());
    }

    #[tokio::test]
    async fn test_routed_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let (route_tx, route_rx) = mpsc::channel(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = Connection::new(Endpoint::routed(route_rx), options(), tx);
        connection.enable();

        let client = tokio::spawn(async move { TcpStream::connect(address).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        route_tx.send(accepted).await.unwrap();
        let mut client = client.await.unwrap();

        assert_eq!(next(&mut rx).await, ConnectionEvent::Connected);
        client.write_all(b"hi").await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            ConnectionEvent::Data(Bytes::from_static(b"hi"))
        );

        connection.disable().await;
    }

    #[tokio::test]
    async fn test_enable_disable_idempotent() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = Connection::new(Endpoint::active("127.0.0.1:1"), options(), tx);
        connection.enable();
        connection.enable();
        connection.disable().await;
        connection.disable().await;
        assert!(!connection.is_connected());
    }
}
