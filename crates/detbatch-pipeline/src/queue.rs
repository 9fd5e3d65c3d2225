use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

/// One-way "this stage has finished" signal.
///
/// Set once by the upstream stage and never cleared. Always set through
/// [`WorkQueue::finish`] so that the store happens under the lock of the
/// queue the downstream stage waits on.
#[derive(Debug)]
pub struct CompletionFlag {
    name: &'static str,
    set: AtomicBool,
}

impl CompletionFlag {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            set: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Returns `true` on the first call only.
    fn set(&self) -> bool {
        !self.set.swap(true, Ordering::AcqRel)
    }
}

/// Unbounded FIFO connecting two pipeline stages.
///
/// The consumer blocks on a condition variable instead of polling. Pushes wake
/// one waiter; [`finish`](Self::finish) wakes all of them.
pub struct WorkQueue<T> {
    name: &'static str,
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            items: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append `item` and wake one consumer. Returns the queue length after the push.
    pub fn push(&self, item: T) -> usize {
        let len = {
            let mut items = self.items.lock();
            items.push_back(item);
            items.len()
        };
        self.ready.notify_one();
        len
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Take the oldest item, blocking while the queue is empty and
    /// `upstream_done` is false.
    ///
    /// `None` means the queue is empty and upstream has finished: the caller
    /// should terminate. `upstream_done` is evaluated with the queue locked.
    pub fn pop_or_finish(&self, upstream_done: impl Fn() -> bool) -> Option<T> {
        let mut items = self.items.lock();
        self.ready
            .wait_while(&mut items, |items| items.is_empty() && !upstream_done());
        items.pop_front()
    }

    /// Like [`pop_or_finish`](Self::pop_or_finish) but takes everything queued
    /// at once, oldest first.
    pub fn drain_or_finish(&self, upstream_done: impl Fn() -> bool) -> Option<Vec<T>> {
        let mut items = self.items.lock();
        self.ready
            .wait_while(&mut items, |items| items.is_empty() && !upstream_done());
        if items.is_empty() {
            None
        } else {
            Some(items.drain(..).collect())
        }
    }

    /// Set `flag` while holding this queue's lock, then wake every waiter.
    ///
    /// A consumer checks the flag inside the same lock before sleeping, so it
    /// either sees the flag or is already waiting when the wake-up arrives.
    pub fn finish(&self, flag: &CompletionFlag) {
        {
            let _items = self.items.lock();
            if !flag.set() {
                return;
            }
        }
        self.ready.notify_all();
        tracing::debug!(queue = self.name, flag = flag.name(), "stage finished");
    }

    /// Guard that calls [`finish`](Self::finish) when dropped, including
    /// during a panic.
    pub fn finish_on_drop<'a>(&'a self, flag: &'a CompletionFlag) -> FinishGuard<'a, T> {
        FinishGuard { queue: self, flag }
    }
}

impl<T> std::fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

/// Returned by [`WorkQueue::finish_on_drop`].
#[must_use = "the flag is set when the guard is dropped"]
pub struct FinishGuard<'a, T> {
    queue: &'a WorkQueue<T>,
    flag: &'a CompletionFlag,
}

impl<T> Drop for FinishGuard<'_, T> {
    fn drop(&mut self) {
        self.queue.finish(self.flag);
    }
}
