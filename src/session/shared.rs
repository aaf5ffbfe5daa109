//! State, events, system ids and handler delivery shared by both engines.
//!
//! Primary messages go through one handler task per session: a handler runs
//! only after the previous one returned, in arrival order.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::state::{ConnectionState, StateMachine, Transition};
use crate::error::{Result, SecsError};
use crate::handler::{HandlerRegistry, ReplyContext, ReplySink};
use crate::protocol::SecsMessage;

/// Capacity of the per-session event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications published by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    StateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    Connected,
    Disconnected,
    /// A data message nobody handled or waited for.
    MessageReceived(SecsMessage),
}

type Delivery = (SecsMessage, Arc<dyn ReplySink>);

struct HandlerQueue {
    tx: mpsc::UnboundedSender<Delivery>,
    task: JoinHandle<()>,
}

pub(crate) struct SessionCore {
    name: String,
    state: Mutex<StateMachine>,
    events: broadcast::Sender<ProtocolEvent>,
    system: AtomicU32,
    handlers: Arc<HandlerRegistry>,
    queue: Mutex<Option<HandlerQueue>>,
}

impl SessionCore {
    pub(crate) fn new(name: String, handlers: HandlerRegistry) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            name,
            state: Mutex::new(StateMachine::new()),
            events,
            system: AtomicU32::new(0),
            handlers: Arc::new(handlers),
            queue: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state()
    }

    pub(crate) fn is_selected(&self) -> bool {
        self.state() == ConnectionState::Selected
    }

    /// Fire a transition and publish the change.
    pub(crate) fn fire(&self, transition: Transition) -> Result<ConnectionState> {
        let (previous, current) = {
            let mut machine = self.lock();
            let previous = machine.state();
            (previous, machine.fire(transition)?)
        };

        if previous != current {
            tracing::info!("[{}] {} -> {} ({})", self.name, previous, current, transition);
            self.publish(ProtocolEvent::StateChanged { previous, current });
        }
        Ok(current)
    }

    /// Fire a transition driven by the wire, where an invalid source state
    /// only warrants a log line.
    pub(crate) fn try_fire(&self, transition: Transition) -> bool {
        match self.fire(transition) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("[{}] {}", self.name, e);
                false
            }
        }
    }

    /// Next system id; wraps and never yields 0.
    pub(crate) fn next_system(&self) -> u32 {
        loop {
            let system = self.system.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if system != 0 {
                return system;
            }
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: ProtocolEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Start the handler task unless it is already running.
    pub(crate) fn start_handlers(&self) {
        let mut queue = lock(&self.queue);
        if queue.as_ref().is_some_and(|q| !q.task.is_finished()) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(handler_loop(
            self.name.clone(),
            self.handlers.clone(),
            self.events.clone(),
            rx,
        ));
        *queue = Some(HandlerQueue { tx, task });
    }

    /// Stop the handler task; queued messages are dropped.
    pub(crate) async fn stop_handlers(&self) {
        let Some(queue) = lock(&self.queue).take() else {
            return;
        };
        drop(queue.tx);
        queue.task.abort();
        let _ = queue.task.await;
    }

    pub(crate) fn abort_handlers(&self) {
        if let Some(queue) = lock(&self.queue).take() {
            queue.task.abort();
        }
    }

    /// Queue a primary message for its handler.
    ///
    /// Messages without a handler are published as
    /// [`ProtocolEvent::MessageReceived`] in the same order.
    pub(crate) fn deliver(&self, message: SecsMessage, sink: Arc<dyn ReplySink>) {
        let rejected = match lock(&self.queue).as_ref() {
            Some(queue) => match queue.tx.send((message, sink)) {
                Ok(()) => return,
                Err(mpsc::error::SendError((message, _))) => message,
            },
            None => message,
        };
        tracing::debug!("[{}] Handler task not running, publishing {}", self.name, rejected);
        self.publish(ProtocolEvent::MessageReceived(rejected));
    }

    fn lock(&self) -> MutexGuard<'_, StateMachine> {
        lock(&self.state)
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        self.abort_handlers();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run one handler at a time. Handlers run in a child task so a panic is
/// logged instead of ending the loop.
async fn handler_loop(
    name: String,
    handlers: Arc<HandlerRegistry>,
    events: broadcast::Sender<ProtocolEvent>,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
) {
    while let Some((message, sink)) = rx.recv().await {
        let ctx = ReplyContext::new(&message, sink);
        let label = format!("S{}F{}", message.stream, message.function);
        let unhandled = message.clone();
        let registry = handlers.clone();
        let outcome = tokio::spawn(async move { registry.dispatch(message, ctx).await }).await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(SecsError::HandlerNotFound(..))) => {
                tracing::debug!("[{}] No handler for {}", name, unhandled);
                let _ = events.send(ProtocolEvent::MessageReceived(unhandled));
            }
            Ok(Err(e)) => tracing::error!("[{}] Handler for {} failed: {}", name, label, e),
            Err(e) if e.is_panic() => {
                tracing::error!("[{}] Handler for {} panicked: {}", name, label, e)
            }
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::BoxFuture;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_system_ids_increase_and_skip_zero() {
        let core = SessionCore::new("peer".to_string(), HandlerRegistry::new());
        assert_eq!(core.next_system(), 1);
        assert_eq!(core.next_system(), 2);

        core.system.store(u32::MAX - 1, Ordering::Relaxed);
        assert_eq!(core.next_system(), u32::MAX);
        assert_eq!(core.next_system(), 1);
    }

    #[test]
    fn test_fire_publishes_state_change() {
        let core = SessionCore::new("peer".to_string(), HandlerRegistry::new());
        let mut events = core.subscribe();

        core.fire(Transition::Connect).unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            ProtocolEvent::StateChanged {
                previous: ConnectionState::NotConnected,
                current: ConnectionState::NotSelected,
            }
        );

        // Disconnect from NotConnected is allowed but not a change.
        core.fire(Transition::Disconnect).unwrap();
        events.try_recv().unwrap();
        core.fire(Transition::Disconnect).unwrap();
        assert!(events.try_recv().is_err());
    }

    #[derive(Default)]
    struct Sink;

    impl ReplySink for Sink {
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

    fn message(function: u8, system: u32) -> SecsMessage {
        SecsMessage {
            session_id: 0,
            stream: 1,
            function,
            require_response: true,
            system,
            data: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn test_handlers_run_one_at_a_time_in_order() {
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handlers = HandlerRegistry::new();
        {
            let (active, overlap, order) = (active.clone(), overlap.clone(), order.clone());
            handlers
                .register(1, 1, move |msg, _ctx| {
                    let (active, overlap, order) = (active.clone(), overlap.clone(), order.clone());
                    async move {
                        if active.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlap.fetch_add(1, Ordering::SeqCst);
                        }
                        // Later messages finish faster if they ever overlap.
                        let delay = 60 - 10 * u64::from(msg.system);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        order.lock().unwrap().push(msg.system);
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .unwrap();
        }

        let core = SessionCore::new("peer".to_string(), handlers);
        core.start_handlers();
        let sink: Arc<dyn ReplySink> = Arc::new(Sink);
        for system in 1..=4 {
            core.deliver(message(1, system), sink.clone());
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
        core.stop_handlers().await;
    }

    #[tokio::test]
    async fn test_unhandled_and_failing_handlers() {
        let mut handlers = HandlerRegistry::new();
        handlers
            .register(1, 3, |msg, _ctx| async move {
                if msg.system > 0 {
                    panic!("handler bug");
                }
                Ok(())
            })
            .unwrap();
        handlers
            .register(1, 5, |_msg, _ctx| async { Err(SecsError::SendFailed) })
            .unwrap();

        let core = SessionCore::new("peer".to_string(), handlers);
        let mut events = core.subscribe();
        core.start_handlers();
        let sink: Arc<dyn ReplySink> = Arc::new(Sink);
        core.deliver(message(1, 3), sink.clone());
        core.deliver(message(1, 5), sink.clone());
        core.deliver(message(1, 7), sink.clone());

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ProtocolEvent::MessageReceived(message(1, 7)));
        core.stop_handlers().await;
    }

    #[tokio::test]
    async fn test_deliver_without_handler_task_publishes() {
        let core = SessionCore::new("peer".to_string(), HandlerRegistry::new());
        let mut events = core.subscribe();
        core.deliver(message(1, 1), Arc::new(Sink));
        assert_eq!(
            events.try_recv().unwrap(),
            ProtocolEvent::MessageReceived(message(1, 1))
        );
    }

    #[test]
    fn test_try_fire_invalid() {
        let core = SessionCore::new("peer".to_string(), HandlerRegistry::new());
        assert!(!core.try_fire(Transition::Deselect));
        assert_eq!(core.state(), ConnectionState::NotConnected);
    }
}
