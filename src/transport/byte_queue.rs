//! Thread-safe FIFO byte buffer.
//!
//! The connection's receive side pushes bytes in; protocol code waits until a
//! number of bytes is available and pops them off. Waiting never polls: pushes
//! wake every waiter through a [`Notify`].

use std::sync::Mutex;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;
use tokio::time::Instant;

/// FIFO byte queue with "wait for N bytes" semantics.
#[derive(Debug, Default)]
pub struct ByteQueue {
    buffer: Mutex<BytesMut>,
    notify: Notify,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and wake all waiters.
    pub fn push(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.lock().extend_from_slice(data);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the first `n` bytes, without consuming them.
    pub fn peek(&self, n: usize) -> Option<Bytes> {
        let buffer = self.lock();
        if buffer.len() < n {
            return None;
        }
        Some(Bytes::copy_from_slice(&buffer[..n]))
    }

    /// Remove and return the first `n` bytes, `None` if fewer are buffered.
    pub fn pop(&self, n: usize) -> Option<Bytes> {
        let mut buffer = self.lock();
        if buffer.len() < n {
            return None;
        }
        Some(buffer.split_to(n).freeze())
    }

    pub fn pop_byte(&self) -> Option<u8> {
        self.pop(1).map(|b| b[0])
    }

    /// Drop every buffered byte.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Wait until at least `n` bytes are buffered or `timeout` elapses.
    ///
    /// Returns whether `n` bytes are available.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        self.wait_until_deadline(n, Instant::now() + timeout).await
    }

    /// Same as [`wait_for`](Self::wait_for) with an absolute deadline.
    pub async fn wait_until_deadline(&self, n: usize, deadline: Instant) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.len() >= n {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.len() >= n;
            }
        }
    }

    /// Wait without a deadline until at least `n` bytes are buffered.
    ///
    /// Cancellation safe: nothing is consumed.
    pub async fn readable(&self, n: usize) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.len() >= n {
                return;
            }
            notified.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BytesMut> {
        // A poisoned buffer still holds valid bytes.
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }
}
