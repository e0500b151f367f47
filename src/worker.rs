//! The worker slot run-loop and the messages it understands.

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Weak,
    time::Instant,
};

use crossbeam_channel::{Receiver, Sender};

use crate::pool::Shared;

/// A unit of work accepted by the pool.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// A message handed to a worker through its slot's inbox.
pub(crate) enum Message {
    /// Execute a task. The slot handle rides along so the worker can return
    /// itself to the pool's idle list once the task finishes.
    Run(Task, Box<Slot>),

    /// Exit the run-loop. Sent by the expiration sweep, which has already
    /// removed the slot from the idle list and adjusted the running count.
    Shutdown,
}

/// The pool-side handle to a worker slot.
///
/// A slot is owned by exactly one of the idle list, an in-flight `Run`
/// message, or the spare cache at any instant, so none of its fields need
/// their own synchronization.
pub(crate) struct Slot {
    pub(crate) id: usize,

    /// Single-item hand-off to the worker thread.
    pub(crate) sender: Sender<Message>,

    /// Stamped every time the slot returns to the idle list. Read only by
    /// the expiration sweep.
    pub(crate) last_active: Instant,
}

/// The thread-side half of a slot: the inbox plus a non-owning reference
/// back to the pool for bookkeeping calls.
pub(crate) struct Worker {
    receiver: Receiver<Message>,
    pool: Weak<Shared>,
}

impl Worker {
    pub(crate) fn new(receiver: Receiver<Message>, pool: Weak<Shared>) -> Self {
        Self { receiver, pool }
    }

    /// Receive and execute tasks until told to shut down.
    ///
    /// The loop also exits when the inbox disconnects (the pool was released
    /// or dropped while this slot was idle) or when re-registration after a
    /// task is refused because the pool closed in the meantime.
    pub(crate) fn run(self) {
        while let Ok(message) = self.receiver.recv() {
            let (task, slot) = match message {
                Message::Run(task, slot) => (task, slot),
                Message::Shutdown => {
                    log::trace!("worker received shutdown, exiting");
                    break;
                }
            };

            // A panicking task must not take the worker down with it.
            let result = catch_unwind(AssertUnwindSafe(task));

            let shared = match self.pool.upgrade() {
                Some(shared) => shared,
                None => {
                    if let Err(payload) = result {
                        log::error!(
                            "task panicked after pool was dropped: {}",
                            panic_message(payload.as_ref())
                        );
                    }
                    break;
                }
            };

            match result {
                Ok(()) => shared.task_completed(),
                Err(payload) => shared.task_panicked(payload),
            }

            if !shared.return_slot(slot) {
                // Pool closed while we were busy; we are no longer counted.
                break;
            }
        }
    }
}

/// Best-effort extraction of a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<opaque panic payload>")
}
