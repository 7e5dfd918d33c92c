// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::handler::MessageHandler;
use crate::message::Priority;
use crate::tagmap::TagMap;

const MAX_NAME_LEN: usize = 32;
const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_millis(500);

/// State machine of a [`Task`].
///
/// ```text
///  Ready ─start→ Started ─(body returns)→ Done ─(on_done delivered)→ Terminated
///    │              │
///    │cancel        │cancel
///    ▼              ▼
///  Cancelling ─(body observes / thread exits)→
///    Cancelled ─(on_cancelled delivered)→ TerminatedCancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Constructed, not yet started.
    Ready,
    /// Body is running on its own thread.
    Started,
    /// Cancellation requested; body has not yet reached a terminal state.
    Cancelling,
    /// Body stopped (or was never started) in response to cancellation;
    /// `on_cancelled` not yet delivered.
    Cancelled,
    /// Body returned normally; `on_done` not yet delivered.
    Done,
    /// Final: completed normally and `on_done` was delivered.
    Terminated,
    /// Final: cancelled and `on_cancelled` was delivered.
    TerminatedCancelled,
}

impl TaskState {
    /// Whether this is one of the two final states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::TerminatedCancelled)
    }
}

/// Cancellation mode chosen at [`Task::spawn`] time.
///
/// `OsEnforced` does **not** perform true OS-level thread termination - see
/// `DESIGN.md` for why that would be unsound to expose safely in Rust. It is
/// honored as "the cleanup guard runs the terminal-state transition even if
/// the body panics", which is the same guarantee `Cooperative` gets; the
/// variant is kept so a caller's cancellation intent stays distinguishable
/// and visible in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// The body is expected to poll [`Task::is_cancel_requested`] and return.
    Cooperative,
    /// See type-level docs: not a real preemptive cancel in this crate.
    OsEnforced,
}

/// Observer of a [`Task`]'s lifecycle. All methods default to doing nothing,
/// so a listener only needs to implement the events it cares about.
///
/// Every callback is posted to the handler the listener was registered
/// with - never invoked inline from inside a task-internal lock.
pub trait Listener: Send + Sync {
    /// The task has begun running its body.
    fn on_started(&self, _task: &Arc<Task>) {}
    /// `publish_progress_init` was called.
    fn on_progress_init(&self, _task: &Arc<Task>, _max: u32) {}
    /// A throttled progress update was accepted.
    fn on_progress(&self, _task: &Arc<Task>, _value: u32) {}
    /// Cancellation was requested. `started` tells whether the body had
    /// already begun running at the time of the request.
    fn on_cancelling(&self, _task: &Arc<Task>, _started: bool) {}
    /// The task reached `Cancelled`. Check [`Task::errcode`] for detail.
    fn on_cancelled(&self, _task: &Arc<Task>) {}
    /// The task reached `Done`. Check [`Task::errcode`]/[`Task::result`].
    fn on_done(&self, _task: &Arc<Task>) {}
}

/// The body a [`Task`] runs. Receives the task itself so it can poll for
/// cancellation and publish progress, and returns its result payload plus
/// an `errcode` (`0` for success, the same convention `errcode()` and
/// `ErrorCode` use elsewhere in this crate rather than a `Result`).
pub type TaskBody = Box<dyn FnOnce(&Task) -> (Box<dyn Any + Send>, i32) + Send>;

struct Outcome {
    result: Option<Box<dyn Any + Send>>,
    errcode: i32,
}

struct Progress {
    max: u32,
    last_value: Option<u32>,
    last_publish: Option<Instant>,
    interval: Duration,
    initialized: bool,
}

struct ListenerEntry {
    handler: MessageHandler,
    listener: Arc<dyn Listener>,
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// A cancellable, observable unit of work.
///
/// Always held as `Arc<Task>` - [`Task::spawn`] returns one directly, and
/// reference counting is `Arc`'s own rather than a hand-rolled atomic
/// counter.
pub struct Task {
    id: u64,
    name: String,
    priority: Priority,
    owner: MessageHandler,
    arg: Box<dyn Any + Send + Sync>,
    self_weak: Weak<Task>,

    body: Mutex<Option<TaskBody>>,
    state: Mutex<TaskState>,
    state_cv: Condvar,
    outcome: Mutex<Outcome>,
    progress: Mutex<Progress>,
    listeners: Mutex<Vec<ListenerEntry>>,
    tagmap: TagMap,

    cancel_requested: AtomicBool,
    cancel_mode: Mutex<Option<CancelMode>>,
    body_running: Mutex<bool>,
    body_running_cv: Condvar,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.get_state())
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Creates a new task in state `Ready`, bound to `owner` for lifecycle
    /// notifications. `intrinsic_listener`, if given, is registered against
    /// `owner` before any other listener, so it is always notified first.
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty.
    #[must_use]
    pub fn spawn(
        name: impl Into<String>,
        priority: Priority,
        owner: MessageHandler,
        arg: Box<dyn Any + Send + Sync>,
        body: TaskBody,
        intrinsic_listener: Option<Arc<dyn Listener>>,
    ) -> Arc<Self> {
        let mut name = name.into();
        assert!(!name.is_empty(), "task name must not be empty");
        if name.len() > MAX_NAME_LEN {
            warn!(original = %name, "task name exceeds {MAX_NAME_LEN} chars, truncating");
            name.truncate(MAX_NAME_LEN);
        }

        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);

        Arc::new_cyclic(|self_weak| {
            let mut listeners = Vec::new();
            if let Some(listener) = intrinsic_listener {
                listeners.push(ListenerEntry {
                    handler: owner.clone(),
                    listener,
                });
            }

            Self {
                id,
                name,
                priority,
                owner,
                arg,
                self_weak: self_weak.clone(),
                body: Mutex::new(Some(body)),
                state: Mutex::new(TaskState::Ready),
                state_cv: Condvar::new(),
                outcome: Mutex::new(Outcome {
                    result: None,
                    errcode: 0,
                }),
                progress: Mutex::new(Progress {
                    max: 0,
                    last_value: None,
                    last_publish: None,
                    interval: DEFAULT_PUBLISH_INTERVAL,
                    initialized: false,
                }),
                listeners: Mutex::new(listeners),
                tagmap: TagMap::new(),
                cancel_requested: AtomicBool::new(false),
                cancel_mode: Mutex::new(None),
                body_running: Mutex::new(false),
                body_running_cv: Condvar::new(),
            }
        })
    }

    fn self_arc(&self) -> Arc<Self> {
        self.self_weak
            .upgrade()
            .expect("Task outlives its own Arc - this method only runs while an Arc<Task> is alive")
    }

    /// Monotonically increasing id, unique for the process lifetime.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Name given at construction (possibly truncated to 32 bytes).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scheduling priority given at construction.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// The handler lifecycle callbacks are posted to by default.
    #[must_use]
    pub const fn owner(&self) -> &MessageHandler {
        &self.owner
    }

    /// The argument given at construction.
    #[must_use]
    pub fn arg(&self) -> &(dyn Any + Send + Sync) {
        self.arg.as_ref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn get_state(&self) -> TaskState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The body's reported error code, `0` until a terminal state is
    /// reached, and stable once it is.
    #[must_use]
    pub fn errcode(&self) -> i32 {
        self.outcome.lock().unwrap_or_else(|e| e.into_inner()).errcode
    }

    /// Whether a cancellation request is pending - for cooperative bodies to
    /// poll from inside their `run` closure.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// This task's tag map, for caller bookkeeping.
    #[must_use]
    pub const fn tags(&self) -> &TagMap {
        &self.tagmap
    }

    /// Adds an extrinsic listener, notified on `handler` (its own, possibly
    /// different from the owner). If progress has already been initialized,
    /// the listener is immediately told the *current* value only, not the
    /// full history - replaying every past update would mean buffering it
    /// forever on the chance a late subscriber shows up.
    pub fn subscribe(&self, handler: MessageHandler, listener: Arc<dyn Listener>) {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner()).push(ListenerEntry {
            handler: handler.clone(),
            listener: Arc::clone(&listener),
        });

        let current = {
            let progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
            progress.initialized.then_some(progress.last_value)
        };
        if let Some(value) = current {
            let task = self.self_arc();
            let _ = handler.post_exec((), move |()| {
                if let Some(value) = value {
                    listener.on_progress(&task, value);
                }
            });
        }
    }

    /// Starts the task: transitions `Ready` -> `Started`, spawns its worker
    /// thread, and posts `on_started` to every listener. Fails if the task
    /// is not in `Ready`.
    pub fn start(&self) -> Result<()> {
        self.start_with_mode(CancelMode::Cooperative)
    }

    /// As [`Self::start`], recording `mode` for a later [`Self::cancel`].
    ///
    /// `on_started` is posted while the `Ready` -> `Started` transition still
    /// holds the state lock, so a `cancel()` racing with this call can never
    /// observe `Started` and post `on_cancelling` ahead of `on_started` - the
    /// two calls must still not be issued concurrently by unsynchronized
    /// callers for any other ordering guarantee to hold.
    pub fn start_with_mode(&self, mode: CancelMode) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != TaskState::Ready {
                return Err(Error::Programming(format!(
                    "task {} cannot start from state {:?}",
                    self.id, *state
                )));
            }
            *state = TaskState::Started;
            self.notify_started();
            self.state_cv.notify_all();
        }
        *self.cancel_mode.lock().unwrap_or_else(|e| e.into_inner()) = Some(mode);

        let body = self
            .body
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .expect("body already taken - Ready -> Started transition runs exactly once");

        let task = self.self_arc();
        thread::Builder::new()
            .name(format!("task-{}", self.name))
            .spawn(move || run_body(task, body))
            .expect("failed to spawn task worker thread");

        Ok(())
    }

    /// Starts the task and blocks the caller until the body has actually
    /// begun running (distinct from [`Self::join`], which waits for
    /// completion).
    pub fn start_sync(&self) -> Result<()> {
        self.start()?;
        let guard = self.body_running.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = self
            .body_running_cv
            .wait_while(guard, |running| !*running)
            .unwrap_or_else(|e| e.into_inner());
        Ok(())
    }

    /// Requests cancellation. Legal only from `Ready` or `Started`; posts
    /// `on_cancelling` to listeners and, if the task had not started,
    /// transitions all the way to terminal immediately.
    pub fn cancel(&self, mode: CancelMode) -> Result<()> {
        let was_started = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                TaskState::Ready => {
                    *state = TaskState::Cancelling;
                    false
                }
                TaskState::Started => {
                    *state = TaskState::Cancelling;
                    true
                }
                other => {
                    return Err(Error::Programming(format!(
                        "task {} cannot be cancelled from state {other:?}"
                    )));
                }
            }
        };
        self.state_cv.notify_all();
        self.cancel_requested.store(true, Ordering::SeqCst);
        *self.cancel_mode.lock().unwrap_or_else(|e| e.into_inner()) = Some(mode);

        if mode == CancelMode::OsEnforced && was_started {
            debug!(
                task_id = self.id,
                "OsEnforced cancel requested; honored cooperatively, see DESIGN.md"
            );
        }

        self.notify_cancelling(was_started);

        if !was_started {
            // Cancelled before the worker thread ever ran - no cleanup guard
            // will run for us, so finish the transition here.
            self.finish_cancelled();
        }

        Ok(())
    }

    /// Blocks until the task reaches a terminal state, then returns its
    /// result (or the error it finished with).
    ///
    /// # Panics
    ///
    /// Panics if a poisoned internal lock indicates a prior panic.
    pub fn join(&self) -> Result<Box<dyn Any + Send>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let _state = self
            .state_cv
            .wait_while(state, |s| !s.is_terminal())
            .unwrap_or_else(|e| e.into_inner());

        let mut outcome = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        if *_state == TaskState::TerminatedCancelled {
            return Err(Error::Programming(format!("task {} was cancelled", self.id)));
        }
        if outcome.errcode != 0 {
            return Err(Error::TaskBody(code_to_errcode(outcome.errcode)));
        }
        outcome
            .result
            .take()
            .ok_or_else(|| Error::NotFound {
                what: "task result (already joined)",
                id: self.id,
            })
    }

    /// Must precede any [`Self::publish_progress`] call; may be called once.
    pub fn publish_progress_init(&self, max: u32) -> Result<()> {
        if max == 0 {
            return Err(ErrorCode::Inval.into());
        }
        {
            let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
            if progress.initialized {
                return Err(Error::Programming(format!(
                    "task {} progress already initialized",
                    self.id
                )));
            }
            progress.max = max;
            progress.initialized = true;
        }
        self.notify_progress_init(max);
        Ok(())
    }

    /// Publishes a throttled progress update.
    /// Returns an error (never panics) if the update is dropped because the
    /// value is unchanged, came too soon after the last accepted publish,
    /// or progress was never initialized.
    pub fn publish_progress(&self, value: u32) -> Result<()> {
        let accepted = {
            let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
            if !progress.initialized {
                return Err(Error::Programming(format!(
                    "task {} progress not initialized",
                    self.id
                )));
            }
            let clamped = value.min(progress.max);
            let now = Instant::now();
            let unchanged = progress.last_value == Some(clamped);
            let too_soon = progress
                .last_publish
                .is_some_and(|t| now.duration_since(t) < progress.interval);
            if unchanged || too_soon {
                None
            } else {
                progress.last_value = Some(clamped);
                progress.last_publish = Some(now);
                Some(clamped)
            }
        };

        match accepted {
            Some(value) => {
                self.notify_progress(value);
                Ok(())
            }
            None => Err(Error::Programming(format!(
                "task {} progress publish dropped (unchanged or throttled)",
                self.id
            ))),
        }
    }

    fn notify_started(&self) {
        self.notify(|listener, task| listener.on_started(task));
    }

    fn notify_progress_init(&self, max: u32) {
        self.notify(move |listener, task| listener.on_progress_init(task, max));
    }

    fn notify_progress(&self, value: u32) {
        self.notify(move |listener, task| listener.on_progress(task, value));
    }

    fn notify_cancelling(&self, started: bool) {
        self.notify(move |listener, task| listener.on_cancelling(task, started));
    }

    fn notify_cancelled(&self) {
        self.notify(|listener, task| listener.on_cancelled(task));
    }

    fn notify_done(&self) {
        self.notify(|listener, task| listener.on_done(task));
    }

    /// Posts `f` to every registered listener's handler, in registration
    /// order, each carrying a fresh `Arc<Task>` clone that keeps the task
    /// alive for exactly the duration of that one posted call - this avoids
    /// a listener/task reference cycle.
    fn notify<F>(&self, f: F)
    where
        F: Fn(&Arc<dyn Listener>, &Arc<Task>) + Send + Sync + 'static,
    {
        let entries: Vec<(MessageHandler, Arc<dyn Listener>)> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| (e.handler.clone(), Arc::clone(&e.listener)))
            .collect();

        let f = Arc::new(f);
        for (handler, listener) in entries {
            let task = self.self_arc();
            let f = Arc::clone(&f);
            if handler.post_exec((), move |()| f(&listener, &task)).is_err() {
                warn!(
                    task_id = self.id,
                    "failed to post lifecycle notification: owner loop is stopping"
                );
            }
        }
    }

    /// Runs on the owner's loop once `on_cancelled` has been posted for
    /// every listener's turn to be scheduled; flips the bookkeeping state
    /// to the final `TerminatedCancelled` straight away, since delivery
    /// order (not completion) is what callers can rely on.
    fn finish_cancelled(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            *state = TaskState::Cancelled;
            self.state_cv.notify_all();
        }
        self.notify_cancelled();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = TaskState::TerminatedCancelled;
        self.state_cv.notify_all();
    }

    fn finish_done(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            *state = TaskState::Done;
            self.state_cv.notify_all();
        }
        self.notify_done();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = TaskState::Terminated;
        self.state_cv.notify_all();
    }
}

fn code_to_errcode(code: i32) -> ErrorCode {
    match code {
        c if c == ErrorCode::NoMem as i32 => ErrorCode::NoMem,
        c if c == ErrorCode::Inval as i32 => ErrorCode::Inval,
        c if c == ErrorCode::Perm as i32 => ErrorCode::Perm,
        c if c == ErrorCode::NoEnt as i32 => ErrorCode::NoEnt,
        _ => ErrorCode::Again,
    }
}

/// Entered on the task's dedicated worker thread. A `scopeguard` cleanup
/// guarantees the terminal-state transition happens even if `body` panics.
fn run_body(task: Arc<Task>, body: TaskBody) {
    {
        let mut running = task.body_running.lock().unwrap_or_else(|e| e.into_inner());
        *running = true;
        task.body_running_cv.notify_all();
    }

    let cleanup_task = Arc::clone(&task);
    let outcome_cell: Arc<Mutex<Option<(Box<dyn Any + Send>, i32)>>> = Arc::new(Mutex::new(None));
    let cleanup_outcome = Arc::clone(&outcome_cell);

    let guard = scopeguard::guard((), move |()| {
        let was_cancelling = cleanup_task.get_state() == TaskState::Cancelling;
        if let Some((result, errcode)) = cleanup_outcome.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let mut outcome = cleanup_task.outcome.lock().unwrap_or_else(|e| e.into_inner());
            outcome.result = Some(result);
            outcome.errcode = errcode;
            drop(outcome);
        }

        if was_cancelling {
            cleanup_task.finish_cancelled();
        } else {
            cleanup_task.finish_done();
        }
    });

    let (result, errcode) = body(&task);
    *outcome_cell.lock().unwrap_or_else(|e| e.into_inner()) = Some((result, errcode));

    drop(guard);
}
