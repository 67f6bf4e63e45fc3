//! Per-service mailboxes and the global ready-queue.
//!
//! Every service owns one [`Mailbox`], a ring buffer of pending messages
//! behind a spinlock. A mailbox that goes from empty to non-empty must be
//! linked onto the [`GlobalQueue`]; workers pop ready mailboxes from there,
//! drain a batch of messages and either requeue the mailbox (still
//! non-empty) or let it fall idle.
//!
//! The `in_global` flag is the single-ownership token: it is set whenever
//! the mailbox is linked in the global queue *or* a worker is currently
//! draining it, so a mailbox can never be held by two workers at once.
//! State transitions happen under the mailbox lock and report whether the
//! caller won the duty to link; the link itself happens outside the lock,
//! and only ever by the single caller that won.

use crate::handle::Handle;
use crate::message::Message;
use std::collections::VecDeque;
use std::sync::Arc;

const DEFAULT_CAPACITY: usize = 64;
const OVERLOAD_THRESHOLD: usize = 1024;

struct Inner {
    queue: VecDeque<Message>,
    /// Set while the mailbox is linked in the global queue or held by a
    /// worker.
    in_global: bool,
    /// Set once the owning context is gone; the next worker to dequeue this
    /// mailbox drains and drops it.
    release: bool,
    /// Last queue length observed above the overload threshold, cleared on
    /// read.
    overload: usize,
    overload_threshold: usize,
}

/// A service's private message queue.
pub(crate) struct Mailbox {
    handle: Handle,
    inner: spin::Mutex<Inner>,
}

impl Mailbox {
    /// A new mailbox starts with `in_global` set so that concurrent senders
    /// do not enqueue it while the owning service is still being set up; the
    /// creator links it onto the global queue once registration completes.
    pub(crate) fn new(handle: Handle) -> Self {
        Self {
            handle,
            inner: spin::Mutex::new(Inner {
                queue: VecDeque::with_capacity(DEFAULT_CAPACITY),
                in_global: true,
                release: false,
                overload: 0,
                overload_threshold: OVERLOAD_THRESHOLD,
            }),
        }
    }

    pub(crate) fn handle(&self) -> Handle {
        self.handle
    }

    /// Append a message. Returns `true` when the mailbox was idle and the
    /// caller must now link it onto the global queue.
    #[must_use]
    pub(crate) fn push(&self, message: Message) -> bool {
        let mut inner = self.inner.lock();

        debug_assert!(!inner.release);

        inner.queue.push_back(message);

        if !inner.in_global {
            inner.in_global = true;

            return true;
        }

        false
    }

    /// Dequeue one message.
    ///
    /// Returns `None` when empty, which also marks the mailbox idle
    /// (`in_global` cleared) and resets the overload threshold. On a
    /// successful pop the residual length is checked against the adaptive
    /// overload threshold, doubling it on each breach.
    pub(crate) fn pop(&self) -> Option<Message> {
        let mut inner = self.inner.lock();

        match inner.queue.pop_front() {
            Some(message) => {
                let length = inner.queue.len();

                while length > inner.overload_threshold {
                    inner.overload = length;
                    inner.overload_threshold *= 2;
                }

                Some(message)
            }
            None => {
                inner.overload_threshold = OVERLOAD_THRESHOLD;
                inner.in_global = false;

                None
            }
        }
    }

    /// Current queue length.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Read and clear the recorded overload length.
    pub(crate) fn take_overload(&self) -> usize {
        let mut inner = self.inner.lock();

        core::mem::take(&mut inner.overload)
    }

    /// Flag the mailbox for release. Returns `true` when the caller must
    /// link it onto the global queue one last time so a worker drains and
    /// drops it.
    #[must_use]
    pub(crate) fn mark_release(&self) -> bool {
        let mut inner = self.inner.lock();

        debug_assert!(!inner.release);
        inner.release = true;

        if !inner.in_global {
            inner.in_global = true;

            return true;
        }

        false
    }

    /// Called by a worker that dequeued a mailbox whose context is gone.
    ///
    /// When the release flag is set the remaining messages are drained
    /// through `drop_message` and the queue dies with its last reference.
    /// Otherwise the context teardown has not marked it yet; the caller
    /// must push the mailbox back for a later worker (`true` return).
    #[must_use]
    pub(crate) fn release_or_requeue<F>(&self, mut drop_message: F) -> bool
    where
        F: FnMut(Message),
    {
        let inner = self.inner.lock();

        if inner.release {
            drop(inner);

            while let Some(message) = self.pop() {
                drop_message(message);
            }

            false
        } else {
            true
        }
    }

    #[cfg(test)]
    pub(crate) fn overload_threshold(&self) -> usize {
        self.inner.lock().overload_threshold
    }

    #[cfg(test)]
    pub(crate) fn in_global(&self) -> bool {
        self.inner.lock().in_global
    }
}

/// The queue of ready mailboxes shared by all workers.
///
/// A mailbox appears at most once; the `in_global` flag guards insertion.
pub(crate) struct GlobalQueue {
    queue: spin::Mutex<VecDeque<Arc<Mailbox>>>,
}

impl GlobalQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: spin::Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, mailbox: Arc<Mailbox>) {
        self.queue.lock().push_back(mailbox);
    }

    /// Remove and return the head mailbox. The caller is its sole owner
    /// until it requeues it or the mailbox falls idle in `pop`.
    pub(crate) fn pop(&self) -> Option<Arc<Mailbox>> {
        self.queue.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageKind, Payload};

    fn message(n: i32) -> Message {
        Message {
            source: Handle::INVALID,
            session: n,
            kind: MessageKind::Text,
            payload: Payload::Empty,
        }
    }

    #[test]
    fn push_pop_fifo() {
        let mq = Mailbox::new(Handle::from_raw(1));

        for n in 0..10 {
            let _ = mq.push(message(n));
        }

        for n in 0..10 {
            assert_eq!(mq.pop().unwrap().session, n);
        }

        assert!(mq.pop().is_none());
    }

    #[test]
    fn idle_mailbox_links_once() {
        let mq = Mailbox::new(Handle::from_raw(1));

        // A fresh mailbox claims in_global until its creator links it.
        assert!(mq.in_global());
        assert!(!mq.push(message(0)));
        assert!(!mq.push(message(1)));

        // Drain to idle, then the first push wins the link duty, exactly
        // once.
        while mq.pop().is_some() {}
        assert!(!mq.in_global());

        assert!(mq.push(message(2)));
        assert!(!mq.push(message(3)));
        assert!(mq.in_global());
    }

    #[test]
    fn overload_records_and_threshold_resets() {
        let mq = Mailbox::new(Handle::from_raw(1));

        for n in 0..4096 {
            let _ = mq.push(message(n));
        }

        let _ = mq.pop().unwrap();

        let overload = mq.take_overload();
        assert!(overload > OVERLOAD_THRESHOLD);
        // Read once, then cleared.
        assert_eq!(mq.take_overload(), 0);
        // 4095 pending doubles 1024 -> 2048 -> 4096.
        assert_eq!(mq.overload_threshold(), 4096);

        while mq.pop().is_some() {}

        assert_eq!(mq.overload_threshold(), OVERLOAD_THRESHOLD);
    }

    #[test]
    fn release_drains_remaining_messages() {
        let mq = Mailbox::new(Handle::from_raw(1));

        let _ = mq.push(message(7));
        let _ = mq.push(message(8));
        // Already linked, so no extra requeue is requested.
        assert!(!mq.mark_release());

        let mut dropped = Vec::new();
        assert!(!mq.release_or_requeue(|m| dropped.push(m.session)));

        assert_eq!(dropped, vec![7, 8]);
    }

    #[test]
    fn unreleased_mailbox_is_requeued() {
        let mq = Mailbox::new(Handle::from_raw(1));

        let _ = mq.push(message(1));
        let _ = mq.pop();

        assert!(mq.release_or_requeue(|_| panic!("nothing to drop")));
    }

    #[test]
    fn release_of_idle_mailbox_requests_requeue() {
        let mq = Mailbox::new(Handle::from_raw(1));

        let _ = mq.push(message(1));
        while mq.pop().is_some() {}
        assert!(!mq.in_global());

        // Idle at release time: the caller must schedule the final drain.
        assert!(mq.mark_release());
        assert!(mq.in_global());
    }
}
