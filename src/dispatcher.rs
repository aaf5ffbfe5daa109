//! Receive/dispatch worker loops.
//!
//! A [`ProtocolDispatcher`] decouples I/O from message handling with two tasks:
//!
//! ```text
//! bytes arrive ─► trigger_receive() ─► receive loop ─► target.drain()
//!                                                          │
//!                          enqueue(source, block) ◄────────┘
//!                                  │
//!                                  ▼
//!                           dispatch loop ─► target.handle_block()
//! ```
//!
//! Every callback runs in its own task and is awaited before the next one
//! starts, so callbacks never overlap and a panicking callback is logged
//! without ending the loop. The dispatcher holds only a [`Weak`] reference to
//! its target.
//!
//! Queued blocks carry the generation they were queued in;
//! [`ProtocolDispatcher::discard_queued`] starts a new generation so blocks
//! from a dropped link are skipped instead of handled on the next one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::handler::BoxFuture;

/// Callbacks driven by a [`ProtocolDispatcher`].
pub trait DispatchTarget<B>: Send + Sync + 'static {
    /// Consume whatever the receive side has buffered.
    fn drain(self: Arc<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Handle one block taken from the dispatch queue.
    fn handle_block(self: Arc<Self>, source: String, block: B) -> BoxFuture<'static, Result<()>>;
}

type Queued<B> = (u64, String, B);

struct Running<B> {
    trigger: Arc<Notify>,
    queue: mpsc::UnboundedSender<Queued<B>>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

/// Receive-trigger and dispatch-queue loops for one protocol instance.
pub struct ProtocolDispatcher<B> {
    running: Mutex<Option<Running<B>>>,
    generation: Arc<AtomicU64>,
}

impl<B: Send + 'static> ProtocolDispatcher<B> {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn both loops. No-op while running.
    pub fn start<T: DispatchTarget<B>>(&self, target: &Arc<T>) {
        let mut running = self.lock();
        if running.is_some() {
            return;
        }

        let trigger = Arc::new(Notify::new());
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);

        let tasks = vec![
            tokio::spawn(receive_loop::<B, T>(
                Arc::downgrade(target),
                trigger.clone(),
                shutdown.subscribe(),
            )),
            tokio::spawn(dispatch_loop::<B, T>(
                Arc::downgrade(target),
                queue_rx,
                self.generation.clone(),
                shutdown.subscribe(),
            )),
        ];

        *running = Some(Running {
            trigger,
            queue,
            shutdown,
            tasks,
        });
    }

    /// Stop both loops and wait for them. Blocks still queued are dropped.
    pub async fn stop(&self) {
        let Some(running) = self.lock().take() else {
            return;
        };
        let _ = running.shutdown.send(());
        for task in running.tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!("Dispatcher loop panicked: {}", e);
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// Wake the receive loop.
    pub fn trigger_receive(&self) {
        if let Some(running) = self.lock().as_ref() {
            running.trigger.notify_one();
        }
    }

    /// Queue a block for the dispatch loop.
    pub fn enqueue(&self, source: impl Into<String>, block: B) {
        match self.lock().as_ref() {
            Some(running) => {
                let generation = self.generation.load(Ordering::Acquire);
                let _ = running.queue.send((generation, source.into(), block));
            }
            None => tracing::debug!("Dispatcher stopped, dropping block"),
        }
    }

    /// Skip every block queued so far. The block being handled finishes.
    pub fn discard_queued(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running<B>>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<B: Send + 'static> Default for ProtocolDispatcher<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> Drop for ProtocolDispatcher<B> {
    fn drop(&mut self) {
        let running = self.running.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(running) = running.take() {
            let _ = running.shutdown.send(());
        }
    }
}

async fn receive_loop<B, T>(
    target: Weak<T>,
    trigger: Arc<Notify>,
    mut shutdown: broadcast::Receiver<()>,
) where
    T: DispatchTarget<B>,
{
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            _ = trigger.notified() => {
                let Some(target) = target.upgrade() else { break };
                run_callback("receive", target.drain()).await;
            }
        }
    }
    tracing::debug!("Receive loop stopped");
}

async fn dispatch_loop<B, T>(
    target: Weak<T>,
    mut queue: mpsc::UnboundedReceiver<Queued<B>>,
    generation: Arc<AtomicU64>,
    mut shutdown: broadcast::Receiver<()>,
) where
    B: Send + 'static,
    T: DispatchTarget<B>,
{
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            item = queue.recv() => {
                let Some((queued_in, source, block)) = item else { break };
                if queued_in != generation.load(Ordering::Acquire) {
                    tracing::debug!("Skipping block queued before the last reset");
                    continue;
                }
                let Some(target) = target.upgrade() else { break };
                run_callback("dispatch", target.handle_block(source, block)).await;
            }
        }
    }
    tracing::debug!("Dispatch loop stopped");
}

/// Run one callback in its own task, logging errors and panics.
async fn run_callback(kind: &str, callback: BoxFuture<'static, Result<()>>) {
    match tokio::spawn(callback).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("{} callback failed: {}", kind, e),
        Err(e) if e.is_panic() => tracing::error!("{} callback panicked: {}", kind, e),
        Err(_) => {}
    }
}
