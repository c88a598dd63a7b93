//! Iteration over native result batches.
//!
//! A [`BatchIterator`] holds at most one batch. Before it pulls the next one,
//! when it is dropped, and when its task completes, the held batch's native
//! block is released first and the batch itself is dropped second, so pool
//! reservations are already back to zero by the time the batch is gone.

use crate::error::{Error, Result};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// A batch whose columns live in natively allocated memory.
pub trait NativeBatch: Send + 'static {
    /// Releases the native memory behind the batch. Called at most once,
    /// right before the batch is dropped.
    fn release_native(&mut self);
}

type CompletionListener = Box<dyn FnOnce() + Send>;

/// Completion hook of the task consuming a batch stream.
#[derive(Default)]
pub struct TaskContext {
    listeners: Mutex<Vec<CompletionListener>>,
    completed: AtomicBool,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("listeners", &self.listeners.lock().len())
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .finish()
    }
}

impl TaskContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `listener`. If the task has already completed it runs
    /// immediately.
    pub fn add_completion_listener<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut listeners = self.listeners.lock();
            if !self.completed.load(Ordering::Acquire) {
                listeners.push(Box::new(listener));
                return;
            }
        }
        listener();
    }

    /// Runs every listener exactly once, most recently registered first.
    pub fn mark_completed(&self) {
        let listeners = {
            let mut listeners = self.listeners.lock();
            if self.completed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *listeners)
        };

        debug!(listeners = listeners.len(), "task completed");
        for listener in listeners.into_iter().rev() {
            listener();
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

struct Shared<B> {
    // the one batch the iterator holds, staged by has_next and exposed by next
    slot: Mutex<Option<B>>,
    closed: AtomicBool,
}

impl<B: NativeBatch> Shared<B> {
    fn release(batch: Option<B>) {
        if let Some(mut batch) = batch {
            batch.release_native();
            drop(batch);
            trace!("released batch");
        }
    }

    fn close_current(&self) {
        let batch = self.slot.lock().take();
        Self::release(batch);
    }

    /// Runs on task completion. Never waits on the slot: if the consumer is
    /// holding the batch, the consumer releases it once it lets go.
    fn close_from_listener(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let batch = self.slot.try_lock().and_then(|mut slot| slot.take());
        Self::release(batch);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// The batch most recently returned by [`BatchIterator::next`].
///
/// Task completion while this is alive does not block; the batch is released
/// when this is dropped instead.
pub struct CurrentBatch<'a, B: NativeBatch> {
    guard: ManuallyDrop<MappedMutexGuard<'a, B>>,
    shared: &'a Shared<B>,
}

impl<B: NativeBatch> Deref for CurrentBatch<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.guard
    }
}

impl<B: NativeBatch> DerefMut for CurrentBatch<'_, B> {
    fn deref_mut(&mut self) -> &mut B {
        &mut self.guard
    }
}

impl<B: NativeBatch> Drop for CurrentBatch<'_, B> {
    fn drop(&mut self) {
        // SAFETY: the guard is dropped exactly once, here, and never used again.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        if self.shared.is_closed() {
            self.shared.close_current();
        }
    }
}

pub struct BatchIterator<I>
where
    I: Iterator,
    I::Item: NativeBatch,
{
    inner: I,
    checked: bool,
    shared: Arc<Shared<I::Item>>,
}

impl<I> BatchIterator<I>
where
    I: Iterator,
    I::Item: NativeBatch,
{
    /// Wraps `inner` and registers a listener on `task` that releases the
    /// held batch when the task completes, even if iteration was abandoned.
    pub fn new(inner: I, task: &TaskContext) -> Self {
        let shared = Arc::new(Shared {
            slot: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let listener_state = shared.clone();
        task.add_completion_listener(move || listener_state.close_from_listener());

        Self {
            inner,
            checked: false,
            shared,
        }
    }

    /// Releases the previous batch, then stages the next one. At most one
    /// batch is ever held.
    pub fn has_next(&mut self) -> bool {
        if self.shared.is_closed() {
            self.shared.close_current();
            return false;
        }
        if !self.checked {
            self.shared.close_current();
            let next = self.inner.next();
            *self.shared.slot.lock() = next;
            self.checked = true;
        }

        let available = self.shared.slot.lock().is_some();
        if self.shared.is_closed() {
            // completed while the slot was being filled
            self.shared.close_current();
            return false;
        }
        available
    }

    /// Returns the batch staged by the preceding `has_next`, which must have
    /// returned true.
    pub fn next(&mut self) -> Result<CurrentBatch<'_, I::Item>> {
        if !self.checked {
            return Err(Error::IteratorProtocol(
                "next() called without a preceding has_next()".to_string(),
            ));
        }
        self.checked = false;
        if self.shared.is_closed() {
            return Err(Error::IteratorProtocol("next() called after task completion".to_string()));
        }

        let shared: &Shared<I::Item> = &self.shared;
        let guard = MutexGuard::try_map(shared.slot.lock(), |slot| slot.as_mut()).map_err(|_| {
            Error::IteratorProtocol("next() called after has_next() returned false".to_string())
        })?;
        Ok(CurrentBatch {
            guard: ManuallyDrop::new(guard),
            shared,
        })
    }

    /// Releases the held batch without waiting for the task to finish.
    pub fn close(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.close_current();
    }
}

impl<I> Drop for BatchIterator<I>
where
    I: Iterator,
    I::Item: NativeBatch,
{
    fn drop(&mut self) {
        self.close();
    }
}
