// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::handler::MessageHandler;
use crate::message::Priority;
use crate::tagmap::TagMap;
use crate::task::{CancelMode, Listener, Task, TaskState};

/// Where a task managed by a [`TaskManager`] currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLocation {
    /// Admitted, waiting for a free slot.
    Ready,
    /// Occupying a slot, running (or about to run).
    Run,
}

/// A queue-transition event emitted by a [`TaskManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// `add_task` admitted the task into a ready queue.
    AddedToReady,
    /// The task was removed from a ready queue before it ran -
    /// `cancel_task`/`cancel_all` on a not-yet-started task.
    RemovedFromReady,
    /// `balance` promoted the task from ready to run and started it.
    MovedToRun,
    /// The task reached a terminal state and was removed from the run set.
    RemovedFromRun,
}

/// Observer of a [`TaskManager`]'s queue-transition events, registered via
/// [`TaskManager::subscribe`]. Distinct from [`crate::task::Listener`],
/// which observes one task's own lifecycle.
pub trait ManagerListener: Send + Sync {
    /// `ready_size`/`run_size` are the sizes *after* this event was applied.
    fn on_event(
        &self,
        manager: &Arc<TaskManager>,
        event: QueueEvent,
        ready_size: usize,
        run_size: usize,
        task: &Arc<Task>,
    );
}

struct ManagerListenerEntry {
    handler: MessageHandler,
    listener: Arc<dyn ManagerListener>,
}

struct Queues {
    ready: [VecDeque<Arc<Task>>; 5],
    run: Vec<Arc<Task>>,
    locations: HashMap<u64, QueueLocation>,
}

impl Queues {
    fn new() -> Self {
        Self {
            ready: Default::default(),
            run: Vec::new(),
            locations: HashMap::new(),
        }
    }

    fn ready_size(&self) -> usize {
        self.ready.iter().map(VecDeque::len).sum()
    }
}

/// Slot-limited scheduler over a 5-level priority ready queue.
///
/// Owns `ready_queues[5]` and `run_queue` behind a **single** mutex
/// (`Queues`) - this is load-bearing, not an accident: splitting the
/// ready/run locks would let two threads interleave a `balance` and an
/// `add_task` such that `ADDED_TO_READY`/`MOVED_TO_RUN`/`REMOVED_FROM_RUN`
/// notifications could be observed out of the order their state changes
/// actually happened in.
pub struct TaskManager {
    owner: MessageHandler,
    slots: usize,
    queues: Mutex<Queues>,
    listeners: Mutex<Vec<ManagerListenerEntry>>,
    tagmap: TagMap,
    self_weak: Weak<TaskManager>,
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("TaskManager")
            .field("slots", &self.slots)
            .field("ready_size", &q.ready_size())
            .field("run_size", &q.run.len())
            .finish_non_exhaustive()
    }
}

impl TaskManager {
    /// Creates an empty manager bound to `owner`, admitting at most `slots`
    /// concurrently running tasks. Pass `usize::MAX` for "effectively
    /// unlimited" rather than a signed sentinel value.
    ///
    /// # Panics
    ///
    /// Panics if `slots` is `0`; a manager that can never run anything is
    /// almost certainly a caller bug, not a valid (if useless) manager.
    #[must_use]
    pub fn new(owner: MessageHandler, slots: usize) -> Arc<Self> {
        assert!(slots > 0, "a task manager needs at least one slot");
        Arc::new_cyclic(|self_weak| Self {
            owner,
            slots,
            queues: Mutex::new(Queues::new()),
            listeners: Mutex::new(Vec::new()),
            tagmap: TagMap::new(),
            self_weak: self_weak.clone(),
        })
    }

    fn self_arc(&self) -> Arc<Self> {
        self.self_weak
            .upgrade()
            .expect("TaskManager outlives its own Arc - called while an Arc<TaskManager> is alive")
    }

    /// The handler manager events and balanced tasks' notifications are
    /// posted to.
    #[must_use]
    pub const fn owner(&self) -> &MessageHandler {
        &self.owner
    }

    /// The concurrency limit given at construction.
    #[must_use]
    pub const fn slots(&self) -> usize {
        self.slots
    }

    /// This manager's tag map.
    #[must_use]
    pub const fn tags(&self) -> &TagMap {
        &self.tagmap
    }

    /// Total number of tasks currently admitted (ready + running).
    #[must_use]
    pub fn size(&self) -> usize {
        self.queues.lock().unwrap_or_else(|e| e.into_inner()).locations.len()
    }

    /// Where `task` currently sits, if it is managed by this manager.
    #[must_use]
    pub fn contains(&self, task: &Task) -> Option<QueueLocation> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .locations
            .get(&task.id())
            .copied()
    }

    /// Starts a [`TaskManagerBuilder`] bound to `owner`, defaulting to a
    /// single slot. Equivalent to [`Self::new`] for the common case, but
    /// gives callers a place to hang future configuration knobs without
    /// another positional-argument constructor.
    #[must_use]
    pub fn builder(owner: MessageHandler) -> TaskManagerBuilder {
        TaskManagerBuilder::new(owner)
    }

    /// Registers a queue-event listener, notified on `handler`.
    pub fn subscribe(&self, handler: MessageHandler, listener: Arc<dyn ManagerListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ManagerListenerEntry { handler, listener });
    }

    /// Returns the first managed task for which `predicate` returns `true`,
    /// scanning ready queues highest-priority-first, then the run set.
    #[must_use]
    pub fn find_task<F>(&self, mut predicate: F) -> Option<Arc<Task>>
    where
        F: FnMut(&Task) -> bool,
    {
        let q = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        for priority in Priority::ALL {
            if let Some(task) = q.ready[priority.index()].iter().find(|t| predicate(t)) {
                return Some(Arc::clone(task));
            }
        }
        q.run.iter().find(|t| predicate(t)).map(Arc::clone)
    }

    /// Admits `task`, requiring it to be in [`TaskState::Ready`] and not
    /// already managed by this (or any) manager.
    pub fn add_task(&self, task: Arc<Task>) -> Result<()> {
        if task.get_state() != TaskState::Ready {
            return Err(Error::Programming(format!(
                "task {} cannot be added to a task manager from state {:?}",
                task.id(),
                task.get_state()
            )));
        }

        let mut q = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if q.locations.contains_key(&task.id()) {
            return Err(Error::Programming(format!(
                "task {} is already managed",
                task.id()
            )));
        }

        q.ready[task.priority().index()].push_back(Arc::clone(&task));
        q.locations.insert(task.id(), QueueLocation::Ready);
        self.emit_event(&q, QueueEvent::AddedToReady, &task);

        self.balance(&mut q);
        Ok(())
    }

    /// Cancels `task`. If it is still in a ready queue it is removed
    /// immediately (emitting `RemovedFromReady`); otherwise it must be
    /// running, and its own terminal event will perform the removal.
    pub fn cancel_task(&self, task: &Task) -> Result<()> {
        let location = {
            let mut q = self.queues.lock().unwrap_or_else(|e| e.into_inner());
            match q.locations.get(&task.id()).copied() {
                Some(QueueLocation::Ready) => {
                    let idx = task.priority().index();
                    if let Some(pos) = q.ready[idx].iter().position(|t| t.id() == task.id()) {
                        let removed = q.ready[idx].remove(pos).expect("position just found");
                        q.locations.remove(&task.id());
                        self.emit_event(&q, QueueEvent::RemovedFromReady, &removed);
                    }
                    QueueLocation::Ready
                }
                Some(QueueLocation::Run) => QueueLocation::Run,
                None => {
                    return Err(Error::NotFound {
                        what: "task in task manager",
                        id: task.id(),
                    });
                }
            }
        };
        debug!(task_id = task.id(), ?location, "cancelling managed task");
        task.cancel(CancelMode::Cooperative)
    }

    /// Cancels every task currently managed, ready or running.
    pub fn cancel_all(&self) -> Result<()> {
        let tasks: Vec<Arc<Task>> = {
            let q = self.queues.lock().unwrap_or_else(|e| e.into_inner());
            q.ready
                .iter()
                .flatten()
                .cloned()
                .chain(q.run.iter().cloned())
                .collect()
        };
        for task in tasks {
            // A task that raced to completion between the snapshot above and
            // this call is simply no longer managed; that is not an error.
            if let Err(err) = self.cancel_task(&task) {
                warn!(task_id = task.id(), error = %err, "cancel_all: task already left the manager");
            }
        }
        Ok(())
    }

    /// Fails with [`Error::Programming`] if any task is still managed -
    /// callers must `cancel_all` and poll [`Self::size`] down to zero first.
    pub fn destroy(&self) -> Result<()> {
        let q = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if q.locations.is_empty() {
            Ok(())
        } else {
            Err(Error::Programming(format!(
                "task manager still has {} managed task(s)",
                q.locations.len()
            )))
        }
    }

    /// Promotes ready tasks into the run set while a slot is free,
    /// subscribing the internal per-task listener and starting each one.
    /// Runs entirely under `q`'s lock - re-entrancy-safe by construction,
    /// since nothing else can observe a half-applied move.
    fn balance(&self, q: &mut Queues) {
        loop {
            if q.run.len() >= self.slots {
                break;
            }
            let Some(priority) = Priority::ALL.into_iter().find(|p| !q.ready[p.index()].is_empty())
            else {
                break;
            };
            let task = q.ready[priority.index()]
                .pop_front()
                .expect("priority just checked non-empty");

            q.locations.insert(task.id(), QueueLocation::Run);
            q.run.push(Arc::clone(&task));

            let listener: Arc<dyn Listener> = Arc::new(RunCompletionListener {
                manager: self.self_weak.clone(),
            });
            task.subscribe(self.owner.clone(), listener);

            self.emit_event(q, QueueEvent::MovedToRun, &task);

            if let Err(err) = task.start() {
                warn!(task_id = task.id(), error = %err, "task manager failed to start a balanced task");
            }
        }
    }

    /// Invoked (via [`RunCompletionListener`]) when a managed, running task
    /// reaches a terminal state: removes it from the run set, emits
    /// `RemovedFromRun`, then re-balances to fill the freed slot.
    fn on_task_terminal(&self, task: &Task) {
        let mut q = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if q.locations.remove(&task.id()).is_some() {
            let Some(pos) = q.run.iter().position(|t| t.id() == task.id()) else {
                return;
            };
            let removed = q.run.remove(pos);
            self.emit_event(&q, QueueEvent::RemovedFromRun, &removed);
            self.balance(&mut q);
        }
    }

    /// Snapshots the listener list and posts (not invokes) each one's
    /// `on_event` to its handler, while `q`'s lock is still held - this is
    /// what gives queue-event notifications the same ordering as the state
    /// changes they describe.
    fn emit_event(&self, q: &Queues, event: QueueEvent, task: &Arc<Task>) {
        let ready_size = q.ready_size();
        let run_size = q.run.len();
        let entries: Vec<(MessageHandler, Arc<dyn ManagerListener>)> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| (e.handler.clone(), Arc::clone(&e.listener)))
            .collect();

        let manager = self.self_arc();
        for (handler, listener) in entries {
            let manager = Arc::clone(&manager);
            let task = Arc::clone(task);
            let posted = handler.post_exec((), move |()| {
                listener.on_event(&manager, event, ready_size, run_size, &task);
            });
            if posted.is_err() {
                warn!(?event, "failed to post task manager event: owner loop is stopping");
            }
        }
    }
}

/// Builder for a [`TaskManager`]. Mirrors the explicit-construction style
/// the rest of the crate uses for configuration: there is no global
/// registry, just a value the caller assembles and finishes with
/// [`Self::build`].
#[derive(Debug, Clone)]
pub struct TaskManagerBuilder {
    owner: MessageHandler,
    slots: usize,
}

impl TaskManagerBuilder {
    /// Starts a builder bound to `owner`, defaulting to a single slot.
    #[must_use]
    pub const fn new(owner: MessageHandler) -> Self {
        Self { owner, slots: 1 }
    }

    /// Sets the concurrency limit.
    #[must_use]
    pub const fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }

    /// Builds the manager.
    ///
    /// # Panics
    ///
    /// Panics if no slots were configured (see [`TaskManager::new`]).
    #[must_use]
    pub fn build(self) -> Arc<TaskManager> {
        TaskManager::new(self.owner, self.slots)
    }
}

/// Internal [`Listener`] the manager subscribes to every task it balances
/// into the run set, holding only a [`Weak`] back-reference - avoids a
/// `Task` <-> `TaskManager` reference cycle.
struct RunCompletionListener {
    manager: Weak<TaskManager>,
}

impl Listener for RunCompletionListener {
    fn on_done(&self, task: &Arc<Task>) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_task_terminal(task);
        }
    }

    fn on_cancelled(&self, task: &Arc<Task>) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_task_terminal(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::thread;
    use std::time::Duration;

    use taskloom_testing::execute_or_abandon;

    use super::*;
    use crate::mloop::MessageLoop;

    struct RecordingManagerListener {
        events: Arc<StdMutex<Vec<(QueueEvent, String)>>>,
    }

    impl ManagerListener for RecordingManagerListener {
        fn on_event(
            &self,
            _manager: &Arc<TaskManager>,
            event: QueueEvent,
            _ready_size: usize,
            _run_size: usize,
            task: &Arc<Task>,
        ) {
            self.events.lock().unwrap().push((event, task.name().to_string()));
        }
    }

    fn sleepy_task(name: &str, owner: MessageHandler, millis: u64) -> Arc<Task> {
        Task::spawn(
            name,
            Priority::Normal,
            owner,
            Box::new(()),
            Box::new(move |_task| {
                thread::sleep(Duration::from_millis(millis));
                (Box::new(42i32) as Box<dyn Any + Send>, 0)
            }),
            None,
        )
    }

    #[test]
    fn single_task_runs_to_completion() {
        execute_or_abandon(|| {
            let (ml, handle) = MessageLoop::spawn("mgr-s1");
            let owner = MessageHandler::new(handle, None);
            let manager = TaskManager::new(owner.clone(), 1);

            let events = Arc::new(StdMutex::new(Vec::new()));
            manager.subscribe(
                owner.clone(),
                Arc::new(RecordingManagerListener {
                    events: Arc::clone(&events),
                }),
            );

            let task = sleepy_task("t1", owner, 10);
            manager.add_task(Arc::clone(&task)).unwrap();
            task.join().unwrap();

            // Give the terminal notification a moment to land and re-balance.
            while manager.size() != 0 {
                thread::yield_now();
            }

            ml.stop();
            ml.join();

            let events = events.lock().unwrap();
            let kinds: Vec<QueueEvent> = events.iter().map(|(e, _)| *e).collect();
            assert_eq!(
                kinds,
                vec![QueueEvent::AddedToReady, QueueEvent::MovedToRun, QueueEvent::RemovedFromRun]
            );
        })
        .unwrap();
    }

    #[test]
    fn cancel_while_still_ready_removes_from_ready_queue() {
        execute_or_abandon(|| {
            let (ml, handle) = MessageLoop::spawn("mgr-s2");
            let owner = MessageHandler::new(handle, None);
            // Zero free slots: the long-runner occupies the only one, so T2
            // stays in the ready queue until cancelled.
            let manager = TaskManager::new(owner.clone(), 1);

            let blocker = sleepy_task("blocker", owner.clone(), 200);
            manager.add_task(Arc::clone(&blocker)).unwrap();

            let events = Arc::new(StdMutex::new(Vec::new()));
            manager.subscribe(
                owner.clone(),
                Arc::new(RecordingManagerListener {
                    events: Arc::clone(&events),
                }),
            );

            let t2 = sleepy_task("t2", owner, 10);
            manager.add_task(Arc::clone(&t2)).unwrap();
            assert_eq!(manager.contains(&t2), Some(QueueLocation::Ready));

            manager.cancel_task(&t2).unwrap();

            blocker.join().unwrap();
            while manager.size() != 0 {
                thread::yield_now();
            }

            ml.stop();
            ml.join();

            let events = events.lock().unwrap();
            let t2_events: Vec<QueueEvent> = events
                .iter()
                .filter(|(_, name)| name == "t2")
                .map(|(e, _)| *e)
                .collect();
            assert_eq!(
                t2_events,
                vec![QueueEvent::AddedToReady, QueueEvent::RemovedFromReady]
            );
            assert_eq!(t2.get_state(), TaskState::TerminatedCancelled);
        })
        .unwrap();
    }

    #[test]
    fn priority_ordering_on_next_admission() {
        execute_or_abandon(|| {
            let (ml, handle) = MessageLoop::spawn("mgr-s3");
            let owner = MessageHandler::new(handle, None);
            let manager = TaskManager::new(owner.clone(), 1);

            let running = sleepy_task("running", owner.clone(), 80);
            manager.add_task(Arc::clone(&running)).unwrap();

            let order = Arc::new(StdMutex::new(Vec::new()));
            let make_task = |name: &'static str, priority: Priority| {
                let order = Arc::clone(&order);
                Task::spawn(
                    name,
                    priority,
                    owner.clone(),
                    Box::new(()),
                    Box::new(move |_task| {
                        order.lock().unwrap().push(name);
                        (Box::new(()) as Box<dyn Any + Send>, 0)
                    }),
                    None,
                )
            };

            let low = make_task("low", Priority::Low);
            let normal = make_task("normal", Priority::Normal);
            let high = make_task("high", Priority::High);

            manager.add_task(Arc::clone(&low)).unwrap();
            manager.add_task(Arc::clone(&normal)).unwrap();
            manager.add_task(Arc::clone(&high)).unwrap();

            running.join().unwrap();
            high.join().unwrap();
            normal.join().unwrap();
            low.join().unwrap();

            while manager.size() != 0 {
                thread::yield_now();
            }

            ml.stop();
            ml.join();

            assert_eq!(*order.lock().unwrap(), vec!["high", "normal", "low"]);
        })
        .unwrap();
    }

    #[test]
    fn run_queue_never_exceeds_slots() {
        execute_or_abandon(|| {
            let (ml, handle) = MessageLoop::spawn("mgr-slots");
            let owner = MessageHandler::new(handle, None);
            let manager = TaskManager::new(owner.clone(), 2);

            let max_run_size = Arc::new(AtomicUsize::new(0));
            struct MaxRunSizeListener {
                max_run_size: Arc<AtomicUsize>,
            }
            impl ManagerListener for MaxRunSizeListener {
                fn on_event(
                    &self,
                    _manager: &Arc<TaskManager>,
                    _event: QueueEvent,
                    _ready_size: usize,
                    run_size: usize,
                    _task: &Arc<Task>,
                ) {
                    self.max_run_size.fetch_max(run_size, Ordering::SeqCst);
                }
            }
            manager.subscribe(
                owner.clone(),
                Arc::new(MaxRunSizeListener {
                    max_run_size: Arc::clone(&max_run_size),
                }),
            );

            let mut tasks = Vec::new();
            for i in 0..6 {
                let task = Task::spawn(
                    format!("t{i}"),
                    Priority::Normal,
                    owner.clone(),
                    Box::new(()),
                    Box::new(move |_task| {
                        thread::sleep(Duration::from_millis(15));
                        (Box::new(()) as Box<dyn Any + Send>, 0)
                    }),
                    None,
                );
                tasks.push(task);
            }
            for task in &tasks {
                manager.add_task(Arc::clone(task)).unwrap();
            }
            for task in &tasks {
                task.join().unwrap();
            }
            while manager.size() != 0 {
                thread::yield_now();
            }

            ml.stop();
            ml.join();

            assert!(max_run_size.load(Ordering::SeqCst) <= 2);
        })
        .unwrap();
    }

    #[test]
    fn destroy_fails_while_tasks_remain() {
        execute_or_abandon(|| {
            let (ml, handle) = MessageLoop::spawn("mgr-destroy");
            let owner = MessageHandler::new(handle, None);
            let manager = TaskManager::new(owner.clone(), 1);

            let task = sleepy_task("lingering", owner, 20);
            manager.add_task(Arc::clone(&task)).unwrap();
            assert!(manager.destroy().is_err());

            task.join().unwrap();
            while manager.size() != 0 {
                thread::yield_now();
            }
            assert!(manager.destroy().is_ok());

            ml.stop();
            ml.join();
        })
        .unwrap();
    }

    #[test]
    fn builder_defaults_to_one_slot() {
        execute_or_abandon(|| {
            let (ml, handle) = MessageLoop::spawn("mgr-builder");
            let owner = MessageHandler::new(handle, None);
            let manager = TaskManager::builder(owner).with_slots(3).build();
            assert_eq!(manager.slots(), 3);

            ml.stop();
            ml.join();
        })
        .unwrap();
    }
}
