//! Implementation of the slot pool itself.

use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Condvar,
        Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;

use crate::{
    error::Error,
    worker::{panic_message, Message, Slot, Task, Worker},
};

#[cfg(target_has_atomic = "64")]
type AtomicCounter = std::sync::atomic::AtomicU64;

#[cfg(not(target_has_atomic = "64"))]
type AtomicCounter = std::sync::atomic::AtomicU32;

/// How long an idle slot is kept alive if no timeout is configured.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3);

static CORE_COUNT: Lazy<usize> = Lazy::new(|| num_cpus::get().max(1));

type PanicHandler = Box<dyn Fn(Box<dyn Any + Send>) + Send + Sync + 'static>;

/// A builder for constructing a customized [`Pool`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// let custom_pool = slotpool::builder()
///     .name("my-pool")
///     .capacity(2)
///     .idle_timeout(Duration::from_secs(30))
///     .build()
///     .unwrap();
/// ```
pub struct Builder {
    name: Option<String>,
    capacity: Option<usize>,
    stack_size: Option<usize>,
    idle_timeout: Duration,
    panic_handler: Option<PanicHandler>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            name: None,
            capacity: None,
            stack_size: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            panic_handler: None,
        }
    }
}

impl Builder {
    /// Set a custom thread name for threads spawned by this pool.
    ///
    /// The slot id is appended to the name, so a pool named `my-pool` spawns
    /// threads named `my-pool-0`, `my-pool-1` and so on.
    ///
    /// # Panics
    ///
    /// Panics if the name contains null bytes (`\0`).
    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        let name = name.into();

        if name.as_bytes().contains(&0) {
            panic!("pool name must not contain null bytes");
        }

        self.name = Some(name);
        self
    }

    /// Set the maximum number of slots allowed to be alive simultaneously.
    ///
    /// Once this many slots exist, further submissions block the calling
    /// thread until a slot finishes its current task.
    ///
    /// If not set, the number of available CPU cores is used.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the size of the stack (in bytes) for threads in this pool.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// enforces a larger minimum stack size.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Set a duration for how long to keep idle slots alive.
    ///
    /// Slots idle for longer than this duration are retired by a background
    /// sweep, which also runs on this period. The default is 3 seconds.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set a handler invoked whenever a submitted task panics.
    ///
    /// The handler receives the panic payload. If no handler is set, panics
    /// are reported through the [`log`] facade instead. Either way the panic
    /// is fully contained: it never propagates to the submitter and the slot
    /// that ran the task returns to service.
    ///
    /// # Examples
    ///
    /// ```
    /// let pool = slotpool::builder()
    ///     .panic_handler(|payload| {
    ///         eprintln!("a task panicked");
    ///         # let _ = payload;
    ///     })
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn panic_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        self.panic_handler = Some(Box::new(handler));
        self
    }

    /// Create a pool according to the configuration set with this builder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapacity`] if the configured capacity is zero,
    /// or [`Error::InvalidIdleTimeout`] if the configured idle timeout is a
    /// zero duration.
    pub fn build(self) -> Result<Pool, Error> {
        let capacity = self.capacity.unwrap_or(*CORE_COUNT);

        if capacity == 0 {
            return Err(Error::InvalidCapacity);
        }

        if self.idle_timeout.is_zero() {
            return Err(Error::InvalidIdleTimeout);
        }

        let shared = Arc::new(Shared {
            capacity,
            idle_timeout: self.idle_timeout,
            running: AtomicUsize::new(0),
            state: Mutex::new(State {
                idle: Vec::new(),
                spare: Vec::new(),
                closed: false,
                sweeper_stop: None,
                next_slot_id: 0,
            }),
            slot_returned: Condvar::new(),
            panic_handler: self.panic_handler,
            completed_tasks: Default::default(),
            panicked_tasks: Default::default(),
        });

        let pool = Pool {
            thread_name: self.name,
            stack_size: self.stack_size,
            shared,
        };

        let mut state = pool.shared.state.lock().unwrap();
        pool.spawn_sweeper(&mut state);
        drop(state);

        Ok(pool)
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("stack_size", &self.stack_size)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

/// A bounded pool of reusable worker slots for fire-and-forget task
/// execution.
///
/// Each slot runs on its own thread and processes one task at a time. Slots
/// are created lazily as submissions arrive, reused last-in-first-out so a
/// small set stays hot, and retired by a background sweep once idle past the
/// configured timeout. At most [`capacity`](Pool::capacity) slots are alive
/// at once; a submission beyond that blocks the calling thread until a slot
/// frees up.
///
/// Submission is fire-and-forget: [`submit`](Pool::submit) returns once the
/// task has been handed to a slot, not when it completes, and no handle to
/// the result is returned. Callers that need to observe completion should
/// bring their own synchronization, such as a channel.
///
/// # Panic isolation
///
/// A panicking task never takes its slot down with it. The panic is caught
/// inside the slot, routed to the handler configured with
/// [`Builder::panic_handler`] (or logged), and the slot returns to the idle
/// list ready for the next task.
///
/// # Monitoring
///
/// The pool exposes counters such as [`running`](Pool::running) and
/// [`completed_tasks`](Pool::completed_tasks) for observability. They are
/// not used internally for admission decisions and may become immediately
/// outdated after invocation due to the live nature of the pool.
pub struct Pool {
    thread_name: Option<String>,
    stack_size: Option<usize>,
    shared: Arc<Shared>,
}

impl Pool {
    /// Create a new pool with the given capacity and the default idle
    /// timeout.
    ///
    /// If you'd like to customize the pool's behavior then use
    /// [`Pool::builder`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapacity`] if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self, Error> {
        Self::builder().capacity(capacity).build()
    }

    /// Get a builder for creating a customized pool.
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Submit a task to be executed by the pool.
    ///
    /// The task runs on an idle slot if one exists, on a newly created slot
    /// if the pool is under capacity, and otherwise this call blocks until
    /// some in-flight task completes and frees its slot.
    ///
    /// This method returns as soon as the task has been accepted. There is
    /// no way to correlate a submission with its result through the pool;
    /// use your own synchronization to observe completion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the pool has been released.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::mpsc;
    ///
    /// let pool = slotpool::Pool::new(2).unwrap();
    /// let (tx, rx) = mpsc::channel();
    ///
    /// pool.submit(move || {
    ///     tx.send(2 + 2).unwrap();
    /// }).unwrap();
    ///
    /// assert_eq!(rx.recv().unwrap(), 4);
    /// ```
    pub fn submit<F>(&self, task: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = self.acquire_slot()?;
        let sender = slot.sender.clone();

        // Cannot fail: the slot was idle or freshly spawned, so its
        // single-item inbox is empty and its worker holds the receiving end
        // open until it is sent a shutdown message.
        let task: Task = Box::new(task);
        sender.send(Message::Run(task, slot)).unwrap();

        Ok(())
    }

    /// Get the number of slots currently alive, busy and idle alike.
    ///
    /// Note that the number returned may become immediately outdated after
    /// invocation.
    #[inline]
    pub fn running(&self) -> usize {
        self.shared.running.load(Ordering::Relaxed)
    }

    /// Get the number of additional slots the pool could still create.
    ///
    /// Equivalent to `capacity() - running()`.
    #[inline]
    pub fn free(&self) -> usize {
        self.shared.capacity.saturating_sub(self.running())
    }

    /// Get the maximum number of slots this pool is allowed to keep alive.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Check whether the pool has been released.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }

    /// Get the number of tasks completed (successfully or otherwise) by this
    /// pool since it was created.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::mpsc;
    ///
    /// let pool = slotpool::Pool::new(1).unwrap();
    /// assert_eq!(pool.completed_tasks(), 0);
    ///
    /// let (tx, rx) = mpsc::channel();
    /// pool.submit(move || tx.send(()).unwrap()).unwrap();
    /// rx.recv().unwrap();
    ///
    /// assert_eq!(pool.completed_tasks(), 1);
    /// ```
    #[inline]
    #[allow(clippy::useless_conversion)]
    pub fn completed_tasks(&self) -> u64 {
        self.shared.completed_tasks.load(Ordering::Relaxed).into()
    }

    /// Get the number of tasks that have panicked since the pool was
    /// created.
    #[inline]
    #[allow(clippy::useless_conversion)]
    pub fn panicked_tasks(&self) -> u64 {
        self.shared.panicked_tasks.load(Ordering::Relaxed).into()
    }

    /// Release the pool, rejecting any further submissions.
    ///
    /// Idle slots are disconnected and their threads exit; a slot that is
    /// mid-execution is not interrupted, but once its current task finishes
    /// it finds the pool closed and exits instead of returning to the idle
    /// list. The expiration sweep stops. Submitters blocked waiting for a
    /// slot are woken and receive [`Error::Closed`].
    ///
    /// Releasing an already-released pool is a no-op.
    ///
    /// # Examples
    ///
    /// ```
    /// let pool = slotpool::Pool::new(2).unwrap();
    ///
    /// pool.release();
    ///
    /// assert!(pool.is_closed());
    /// assert!(pool.submit(|| {}).is_err());
    /// ```
    pub fn release(&self) {
        let mut state = self.shared.state.lock().unwrap();

        if state.closed {
            return;
        }

        state.closed = true;

        // Dropping the stop sender disconnects the sweeper's channel, which
        // is the one-shot released notification it waits on.
        state.sweeper_stop = None;

        // Dropping an idle slot drops the only sender for its inbox; the
        // worker's recv fails and its run-loop exits.
        for slot in state.idle.drain(..) {
            self.shared.running.fetch_sub(1, Ordering::Relaxed);
            drop(slot);
        }

        state.spare.clear();
        drop(state);

        // Wake every blocked submitter so it can observe the closed flag.
        self.shared.slot_returned.notify_all();

        log::debug!("pool released");
    }

    /// Bring a released pool back into service.
    ///
    /// Reinitializes the idle list and relaunches the expiration sweep; the
    /// pool keeps its identity, capacity and configuration. Calling this on
    /// a pool that was never released is a no-op.
    ///
    /// # Examples
    ///
    /// ```
    /// let pool = slotpool::Pool::new(2).unwrap();
    ///
    /// pool.release();
    /// assert!(pool.submit(|| {}).is_err());
    ///
    /// pool.restart();
    /// assert!(pool.submit(|| {}).is_ok());
    /// ```
    pub fn restart(&self) {
        let mut state = self.shared.state.lock().unwrap();

        if !state.closed {
            return;
        }

        state.closed = false;
        state.idle = Vec::new();
        self.spawn_sweeper(&mut state);

        log::debug!("pool restarted");
    }

    /// Obtain a slot for a new task, in strict priority order: reuse the
    /// most recently idled slot, else create a new slot if under capacity,
    /// else block until some other task completes and frees its slot.
    fn acquire_slot(&self) -> Result<Box<Slot>, Error> {
        let shared = &self.shared;
        let mut state = shared.state.lock().unwrap();

        loop {
            if state.closed {
                return Err(Error::Closed);
            }

            // Reusing the newest idle slot first keeps a small set hot.
            if let Some(slot) = state.idle.pop() {
                return Ok(slot);
            }

            if shared.running.load(Ordering::Relaxed) < shared.capacity {
                shared.running.fetch_add(1, Ordering::Relaxed);
                return Ok(self.spawn_slot(&mut state));
            }

            // At capacity with nothing idle: wait for a slot to be returned
            // and retry. Spurious wakes loop back into the re-check, and no
            // fairness is guaranteed between multiple waiters.
            state = shared.slot_returned.wait(state).unwrap();
        }
    }

    /// Construct a slot and start its worker thread. Must be called with the
    /// state lock held and the running count already incremented.
    fn spawn_slot(&self, state: &mut State) -> Box<Slot> {
        let (sender, receiver) = bounded(1);
        let id = state.next_slot_id;
        state.next_slot_id += 1;

        // Recycle a retired slot structure when the cache has one; it comes
        // back as a fresh slot with a new id and inbox.
        let slot = match state.spare.pop() {
            Some(mut slot) => {
                slot.id = id;
                slot.sender = sender;
                slot.last_active = Instant::now();
                slot
            }
            None => Box::new(Slot {
                id,
                sender,
                last_active: Instant::now(),
            }),
        };

        let worker = Worker::new(receiver, Arc::downgrade(&self.shared));

        let mut builder = thread::Builder::new();

        if let Some(name) = self.thread_name.as_ref() {
            builder = builder.name(format!("{name}-{id}"));
        }

        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        log::trace!("spawning worker slot {id}");

        builder.spawn(move || worker.run()).unwrap();

        slot
    }

    /// Start the expiration sweep thread. Must be called with the state lock
    /// held.
    ///
    /// The sweeper holds only a weak reference to the pool's shared state so
    /// that it never extends the pool's lifetime; it exits when signaled,
    /// when its stop channel disconnects, or when the pool has been dropped.
    fn spawn_sweeper(&self, state: &mut State) {
        let (stop, stop_rx) = bounded::<()>(1);
        state.sweeper_stop = Some(stop);

        let shared = Arc::downgrade(&self.shared);
        let period = self.shared.idle_timeout;

        let name = match self.thread_name.as_ref() {
            Some(name) => format!("{name}-sweeper"),
            None => String::from("slotpool-sweeper"),
        };

        thread::Builder::new()
            .name(name)
            .spawn(move || loop {
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => match shared.upgrade() {
                        Some(shared) => shared.sweep(),
                        None => break,
                    },
                    _ => break,
                }
            })
            .unwrap();
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.capacity())
            .field("running", &self.running())
            .field("completed_tasks", &self.completed_tasks())
            .field("panicked_tasks", &self.panicked_tasks())
            .finish()
    }
}

/// Pool state shared by the owner, the worker slots and the sweeper.
pub(crate) struct Shared {
    capacity: usize,
    idle_timeout: Duration,

    /// Number of slots currently alive, busy and idle alike. Mutated only
    /// while holding the state lock, but readable without it.
    running: AtomicUsize,

    state: Mutex<State>,

    /// Signaled on every return to the idle list; waited on by submitters
    /// blocked at capacity.
    slot_returned: Condvar,

    panic_handler: Option<PanicHandler>,
    completed_tasks: AtomicCounter,
    panicked_tasks: AtomicCounter,
}

struct State {
    /// Idle slots, ordered by return time: the head is always the least
    /// recently used slot. Reuse pops at the tail, the sweep scans from the
    /// head.
    idle: Vec<Box<Slot>>,

    /// Retired slot structures kept around for reuse, capped at the pool's
    /// capacity. Never holds a live slot.
    spare: Vec<Box<Slot>>,

    closed: bool,
    sweeper_stop: Option<Sender<()>>,
    next_slot_id: usize,
}

impl Shared {
    /// Return a slot to the idle list after it finished a task.
    ///
    /// Returns `false` if the pool closed while the slot was busy, in which
    /// case the slot handle is dropped instead of re-listed and the caller's
    /// run-loop should exit.
    pub(crate) fn return_slot(&self, mut slot: Box<Slot>) -> bool {
        let mut state = self.state.lock().unwrap();

        if state.closed {
            self.running.fetch_sub(1, Ordering::Relaxed);
            return false;
        }

        slot.last_active = Instant::now();
        state.idle.push(slot);
        drop(state);

        self.slot_returned.notify_one();
        true
    }

    /// Retire every slot that has been idle strictly longer than the idle
    /// timeout, scanning oldest-first and stopping at the first slot still
    /// within the timeout.
    fn sweep(&self) {
        let mut state = self.state.lock().unwrap();

        if state.closed || state.idle.is_empty() {
            return;
        }

        let now = Instant::now();

        // Returns are time-ordered at the tail, so everything past the first
        // still-valid slot is newer and also still valid.
        let expired = state
            .idle
            .iter()
            .position(|slot| now.duration_since(slot.last_active) <= self.idle_timeout)
            .unwrap_or(state.idle.len());

        if expired == 0 {
            return;
        }

        let retired: Vec<Box<Slot>> = state.idle.drain(..expired).collect();

        for slot in retired {
            // The slot is idle, so its single-item inbox is empty and the
            // send cannot block. A failed send means the worker is already
            // gone, which retires the slot all the same.
            let _ = slot.sender.send(Message::Shutdown);
            self.running.fetch_sub(1, Ordering::Relaxed);

            log::trace!("retired idle worker slot {}", slot.id);

            if state.spare.len() < self.capacity {
                state.spare.push(slot);
            }
        }
    }

    pub(crate) fn task_completed(&self) {
        self.completed_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_panicked(&self, payload: Box<dyn Any + Send>) {
        self.completed_tasks.fetch_add(1, Ordering::Relaxed);
        self.panicked_tasks.fetch_add(1, Ordering::Relaxed);

        match &self.panic_handler {
            Some(handler) => handler(payload),
            None => log::error!("task panicked: {}", panic_message(payload.as_ref())),
        }
    }
}
