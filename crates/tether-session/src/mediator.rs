//! Double-buffered hand-off queue between an I/O task and a logic task.
//!
//! Each connection owns two mediators:
//!
//! ```text
//! read loop ──inbound──▶ player logic ──outbound──▶ write loop
//! ```
//!
//! Producers push into the *add* queue; the single consumer pops from its
//! private *take* queue and only touches the add queue to swap the two when
//! its own runs dry. Both locks are held for a push, a pop or a swap, never
//! across an await.
//!
//! Besides messages, a mediator carries the lifecycle latches the two sides
//! use to coordinate a close or a rebind hand-off.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tether_protocol::Message;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Mediator {
    add: Mutex<VecDeque<Message>>,
    take: Mutex<VecDeque<Message>>,
    /// Holds at most one stored permit, so a burst of pushes wakes the
    /// consumer once.
    added: Notify,

    close: AtomicBool,
    bind_success: AtomicBool,
    read_closed: AtomicBool,
    write_closed: AtomicBool,
}

impl Mediator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a message for the consumer.
    ///
    /// Refused once the write side has closed, since nothing will ever
    /// take it; the message is handed back so its lease can be released.
    pub fn add_message(&self, msg: Message) -> Result<(), Message> {
        {
            let mut add = self.add.lock();
            // Checked under the lock: `drain` takes the same lock after the
            // latch is set, so nothing slips in behind it.
            if self.write_closed.load(Ordering::Acquire) {
                return Err(msg);
            }
            add.push_back(msg);
        }
        self.added.notify_one();
        Ok(())
    }

    /// Pops the next message, waiting up to `wait` for one to arrive.
    pub async fn take_message(&self, wait: Duration) -> Option<Message> {
        if let Some(msg) = self.pop_or_swap() {
            return Some(msg);
        }
        if wait.is_zero() {
            return None;
        }
        let _ = tokio::time::timeout(wait, self.added.notified()).await;
        self.pop_or_swap()
    }

    /// Pops without waiting.
    pub fn try_take_message(&self) -> Option<Message> {
        self.pop_or_swap()
    }

    fn pop_or_swap(&self) -> Option<Message> {
        let mut take = self.take.lock();
        if take.is_empty() {
            let mut add = self.add.lock();
            std::mem::swap(&mut *take, &mut *add);
        }
        take.pop_front()
    }

    /// Removes everything still queued on both sides.
    pub fn drain(&self) -> Vec<Message> {
        let mut take = self.take.lock();
        let mut add = self.add.lock();
        take.drain(..).chain(add.drain(..)).collect()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        let take = self.take.lock();
        let add = self.add.lock();
        take.len() + add.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -----------------------------------------------------------------------
    // Latches
    // -----------------------------------------------------------------------

    /// Asks the consumer to stop. Sticky.
    pub fn notify_close(&self) {
        self.close.store(true, Ordering::Release);
        self.added.notify_one();
    }

    pub fn should_close(&self) -> bool {
        self.close.load(Ordering::Acquire)
    }

    pub fn notify_bind_success(&self) {
        self.bind_success.store(true, Ordering::Release);
        self.added.notify_one();
    }

    pub fn is_bind_success(&self) -> bool {
        self.bind_success.load(Ordering::Acquire)
    }

    pub fn notify_client_read_closed(&self) {
        self.read_closed.store(true, Ordering::Release);
    }

    pub fn is_client_read_closed(&self) -> bool {
        self.read_closed.load(Ordering::Acquire)
    }

    /// Latches the write side closed. Later `add_message` calls are refused.
    pub fn notify_client_write_closed(&self) {
        let _add = self.add.lock();
        self.write_closed.store(true, Ordering::Release);
    }

    pub fn is_client_write_closed(&self) -> bool {
        self.write_closed.load(Ordering::Acquire)
    }
}
