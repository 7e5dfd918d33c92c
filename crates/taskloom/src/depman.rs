// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::handler::MessageHandler;
use crate::manager::TaskManager;
use crate::task::{Listener, Task};

/// Lifecycle of a [`TaskDepManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepState {
    /// Structural mutations (`add_task`/`add_dependency`/...) are allowed.
    Ready,
    /// `start` has run; tasks are executing in dependency order.
    Started,
    /// `cancel` was called while started; waiting for in-flight tasks.
    Cancelling,
    /// Every task reached a terminal state after cancellation.
    Cancelled,
    /// Every task completed without cancellation.
    Done,
}

/// Result of [`TaskDepManager::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyResult {
    /// Exactly one root, every vertex reachable from it - `start` may run.
    Ok,
    /// No tasks have been added.
    Empty,
    /// The dependency graph contains a cycle.
    CircularDep,
    /// More than one vertex has no outgoing (successor) edges.
    MultiRoot,
    /// Some vertex is unreachable from the unique root via reverse edges.
    IsolatedTask,
}

struct Vertex {
    task: Arc<Task>,
    /// Tasks that depend on this one (edges this task is the *prereq* of).
    successors: Vec<u64>,
    /// Tasks this one depends on (edges this task is the *target* of).
    predecessors: Vec<u64>,
    /// Count of `predecessors` not yet terminal; reaching zero admits the
    /// task into the underlying [`TaskManager`].
    prereq_remaining: usize,
}

#[derive(Default)]
struct Graph {
    vertices: HashMap<u64, Vertex>,
}

impl Graph {
    fn root(&self) -> Option<u64> {
        let mut roots = self.vertices.values().filter(|v| v.successors.is_empty());
        let first = roots.next()?;
        if roots.next().is_some() {
            None
        } else {
            Some(first.task.id())
        }
    }

    fn roots_count(&self) -> usize {
        self.vertices.values().filter(|v| v.successors.is_empty()).count()
    }

    /// Iterative DFS over successor edges, detecting a back-edge to a
    /// vertex still on the active path. Iterative so a deep chain of
    /// dependencies cannot overflow the stack.
    fn has_cycle(&self) -> bool {
        let mut visited: HashSet<u64> = HashSet::new();

        for &start in self.vertices.keys() {
            if visited.contains(&start) {
                continue;
            }

            let mut on_path: HashSet<u64> = HashSet::new();
            let mut stack: Vec<(u64, usize)> = vec![(start, 0)];
            on_path.insert(start);

            while let Some(&mut (v, ref mut next_idx)) = stack.last_mut() {
                let successors = &self.vertices[&v].successors;
                if *next_idx < successors.len() {
                    let successor = successors[*next_idx];
                    *next_idx += 1;
                    if on_path.contains(&successor) {
                        return true;
                    }
                    if !visited.contains(&successor) {
                        on_path.insert(successor);
                        stack.push((successor, 0));
                    }
                } else {
                    on_path.remove(&v);
                    visited.insert(v);
                    stack.pop();
                }
            }
        }

        false
    }

    /// Reverse-reachability from `root` following predecessor edges, used
    /// to detect isolated tasks.
    fn reachable_from_root(&self, root: u64) -> HashSet<u64> {
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        seen.insert(root);
        while let Some(v) = stack.pop() {
            for &prereq in &self.vertices[&v].predecessors {
                if seen.insert(prereq) {
                    stack.push(prereq);
                }
            }
        }
        seen
    }

    fn verify(&self) -> VerifyResult {
        if self.vertices.is_empty() {
            return VerifyResult::Empty;
        }
        if self.has_cycle() {
            return VerifyResult::CircularDep;
        }
        if self.roots_count() != 1 {
            return VerifyResult::MultiRoot;
        }
        let root = self.root().expect("roots_count just confirmed exactly one");
        let reachable = self.reachable_from_root(root);
        if reachable.len() != self.vertices.len() {
            return VerifyResult::IsolatedTask;
        }
        VerifyResult::Ok
    }

    fn leaves(&self) -> Vec<u64> {
        self.vertices
            .values()
            .filter(|v| v.predecessors.is_empty())
            .map(|v| v.task.id())
            .collect()
    }
}

/// Callback invoked exactly once when a [`TaskDepManager`] finishes, whether
/// by natural completion, cancellation, or the first task error.
///
/// `result_task` is the root task on success, the first failing task on
/// error (a failing task is one whose `errcode != 0`), or `None` on
/// cancellation.
pub trait DepManagerListener: Send + Sync {
    /// Called once, after every task has reached a terminal state.
    fn on_done(&self, manager: &Arc<TaskDepManager>, result_task: Option<Arc<Task>>);
}

/// DAG executor atop a [`TaskManager`].
///
/// Structural mutation (`add_task`/`remove_task`/`add_dependency`/
/// `remove_dependency`) is only legal in [`DepState::Ready`]. `start`
/// injects every leaf (zero incoming prerequisite edges); as each task
/// completes, its successors' remaining-prerequisite counts are
/// decremented, and any reaching zero are injected in turn.
pub struct TaskDepManager {
    manager: Arc<TaskManager>,
    owner: MessageHandler,
    graph: Mutex<Graph>,
    state: Mutex<DepState>,
    listener: Mutex<Option<Arc<dyn DepManagerListener>>>,
    unhandled: AtomicUsize,
    first_error_task: Mutex<Option<u64>>,
    errcode: AtomicI32,
    self_weak: Weak<TaskDepManager>,
}

impl fmt::Debug for TaskDepManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDepManager")
            .field("state", &self.get_state())
            .finish_non_exhaustive()
    }
}

impl TaskDepManager {
    /// Creates an empty manager, wrapping a fresh [`TaskManager`] with
    /// `slots` concurrency, bound to `owner`.
    #[must_use]
    pub fn new(owner: MessageHandler, slots: usize) -> Arc<Self> {
        let manager = TaskManager::new(owner.clone(), slots);
        Arc::new_cyclic(|self_weak| Self {
            manager,
            owner,
            graph: Mutex::new(Graph::default()),
            state: Mutex::new(DepState::Ready),
            listener: Mutex::new(None),
            unhandled: AtomicUsize::new(0),
            first_error_task: Mutex::new(None),
            errcode: AtomicI32::new(0),
            self_weak: self_weak.clone(),
        })
    }

    fn self_arc(&self) -> Arc<Self> {
        self.self_weak
            .upgrade()
            .expect("TaskDepManager outlives its own Arc - called while an Arc<TaskDepManager> is alive")
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn get_state(&self) -> DepState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `0` unless every task completed and the first-failing one had a
    /// non-zero `errcode`.
    #[must_use]
    pub fn errcode(&self) -> i32 {
        self.errcode.load(Ordering::SeqCst)
    }

    /// The underlying scheduler, exposed read-only for introspection
    /// (e.g. `contains`/`find_task`).
    #[must_use]
    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    /// Registers the callback delivered when every task reaches a terminal
    /// state. Replaces any previously registered callback.
    pub fn on_done(&self, listener: Arc<dyn DepManagerListener>) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    fn require_ready(&self) -> Result<()> {
        if self.get_state() == DepState::Ready {
            Ok(())
        } else {
            Err(Error::Programming(
                "task dep manager structure can only change in Ready".to_string(),
            ))
        }
    }

    /// Adds `task` as a vertex with no edges yet. Only legal in `Ready`.
    pub fn add_task(&self, task: Arc<Task>) -> Result<()> {
        self.require_ready()?;
        let mut graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
        if graph.vertices.contains_key(&task.id()) {
            return Err(Error::Programming(format!(
                "task {} already in this dep manager",
                task.id()
            )));
        }
        graph.vertices.insert(
            task.id(),
            Vertex {
                task,
                successors: Vec::new(),
                predecessors: Vec::new(),
                prereq_remaining: 0,
            },
        );
        Ok(())
    }

    /// Removes `task` and every edge touching it. Only legal in `Ready`.
    pub fn remove_task(&self, task: &Task) -> Result<()> {
        self.require_ready()?;
        let mut graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
        let Some(removed) = graph.vertices.remove(&task.id()) else {
            return Err(Error::NotFound {
                what: "task in task dep manager",
                id: task.id(),
            });
        };
        for &successor in &removed.successors {
            if let Some(v) = graph.vertices.get_mut(&successor) {
                v.predecessors.retain(|&id| id != task.id());
            }
        }
        for &predecessor in &removed.predecessors {
            if let Some(v) = graph.vertices.get_mut(&predecessor) {
                v.successors.retain(|&id| id != task.id());
            }
        }
        Ok(())
    }

    /// Adds an edge meaning `target` awaits `prereq`: increments `target`'s
    /// remaining-prerequisite count. Rejected (with the edge rolled back)
    /// if it would create a cycle.
    pub fn add_dependency(&self, target: &Task, prereq: &Task) -> Result<()> {
        self.require_ready()?;
        let mut graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
        if !graph.vertices.contains_key(&target.id()) {
            return Err(Error::NotFound {
                what: "dependency target task",
                id: target.id(),
            });
        }
        if !graph.vertices.contains_key(&prereq.id()) {
            return Err(Error::NotFound {
                what: "dependency prereq task",
                id: prereq.id(),
            });
        }

        graph
            .vertices
            .get_mut(&prereq.id())
            .expect("checked above")
            .successors
            .push(target.id());
        graph
            .vertices
            .get_mut(&target.id())
            .expect("checked above")
            .predecessors
            .push(prereq.id());
        graph.vertices.get_mut(&target.id()).expect("checked above").prereq_remaining += 1;

        if graph.has_cycle() {
            // Roll back: this dependency alone created the cycle.
            let prereq_v = graph.vertices.get_mut(&prereq.id()).expect("inserted above");
            prereq_v.successors.retain(|&id| id != target.id());
            let target_v = graph.vertices.get_mut(&target.id()).expect("inserted above");
            target_v.predecessors.retain(|&id| id != prereq.id());
            target_v.prereq_remaining -= 1;
            return Err(Error::Programming(format!(
                "dependency {} -> {} would create a cycle",
                prereq.id(),
                target.id()
            )));
        }

        Ok(())
    }

    /// Removes a previously added `target`-awaits-`prereq` edge.
    pub fn remove_dependency(&self, target: &Task, prereq: &Task) -> Result<()> {
        self.require_ready()?;
        let mut graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
        let Some(prereq_v) = graph.vertices.get_mut(&prereq.id()) else {
            return Err(Error::NotFound {
                what: "dependency prereq task",
                id: prereq.id(),
            });
        };
        let had_edge = {
            let before = prereq_v.successors.len();
            prereq_v.successors.retain(|&id| id != target.id());
            before != prereq_v.successors.len()
        };
        if !had_edge {
            return Ok(());
        }
        if let Some(target_v) = graph.vertices.get_mut(&target.id()) {
            target_v.predecessors.retain(|&id| id != prereq.id());
            target_v.prereq_remaining = target_v.prereq_remaining.saturating_sub(1);
        }
        Ok(())
    }

    /// Classifies the current graph.
    #[must_use]
    pub fn verify(&self) -> VerifyResult {
        self.graph.lock().unwrap_or_else(|e| e.into_inner()).verify()
    }

    /// The unique root task, if [`Self::verify`] would return
    /// [`VerifyResult::Ok`].
    #[must_use]
    pub fn root_task(&self) -> Option<Arc<Task>> {
        let graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
        let id = graph.root()?;
        graph.vertices.get(&id).map(|v| Arc::clone(&v.task))
    }

    /// Transitions `Ready -> Started` and injects every leaf task into the
    /// underlying [`TaskManager`]. Fails if [`Self::verify`] is not `Ok`.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != DepState::Ready {
                return Err(Error::Programming("task dep manager already started".to_string()));
            }

            let graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
            if graph.verify() != VerifyResult::Ok {
                return Err(Error::Programming(
                    "task dep manager graph is not valid: run verify() for the reason".to_string(),
                ));
            }

            *state = DepState::Started;
        }

        let (leaves, total) = {
            let graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
            (graph.leaves(), graph.vertices.len())
        };
        self.unhandled.store(total, Ordering::SeqCst);

        debug!(leaves = leaves.len(), total, "starting task dep manager");
        for id in leaves {
            self.admit(id);
        }
        Ok(())
    }

    /// Admits the task with `id` into the underlying [`TaskManager`],
    /// subscribing the internal completion listener first.
    fn admit(&self, id: u64) {
        let task = {
            let graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(&graph.vertices[&id].task)
        };
        let listener: Arc<dyn Listener> = Arc::new(DepCompletionListener {
            dep_manager: self.self_weak.clone(),
        });
        task.subscribe(self.owner.clone(), listener);

        if self.get_state() == DepState::Cancelling {
            // A successor became admissible after `cancel` already swept
            // the manager's then-current tasks - it never got a chance to
            // run, so finish its cancellation directly instead of letting
            // it start.
            if let Err(err) = task.cancel(crate::task::CancelMode::Cooperative) {
                warn!(task_id = id, error = %err, "task dep manager failed to cancel a late successor");
            }
            return;
        }

        if let Err(err) = self.manager.add_task(Arc::clone(&task)) {
            warn!(task_id = id, error = %err, "task dep manager failed to admit a task");
        }
    }

    /// Cancels the whole DAG. If no task has been admitted yet (`Ready`),
    /// transitions straight to `Cancelled` and delivers `on_done(None)`.
    /// Otherwise transitions to `Cancelling`, cancels every task, and the
    /// transition to `Cancelled` happens once the last one reports
    /// terminal.
    pub fn cancel(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            DepState::Ready => {
                *state = DepState::Cancelled;
                drop(state);
                self.deliver_done(None);
                Ok(())
            }
            DepState::Started => {
                *state = DepState::Cancelling;
                drop(state);
                if let Err(err) = self.manager.cancel_all() {
                    warn!(error = %err, "task dep manager failed to cancel all tasks");
                }
                Ok(())
            }
            DepState::Cancelling | DepState::Cancelled | DepState::Done => Err(Error::Programming(
                "task dep manager is already finishing or finished".to_string(),
            )),
        }
    }

    /// Fails if the manager is mid-execution (`Started`/`Cancelling`).
    pub fn destroy(&self) -> Result<()> {
        match self.get_state() {
            DepState::Started | DepState::Cancelling => Err(Error::Programming(
                "task dep manager is still running".to_string(),
            )),
            DepState::Ready | DepState::Cancelled | DepState::Done => Ok(()),
        }
    }

    /// Invoked via [`DepCompletionListener`] whenever one of our tasks
    /// reaches a terminal state.
    fn on_task_terminal(&self, task: &Arc<Task>) {
        if task.errcode() != 0 {
            let mut first_error = self.first_error_task.lock().unwrap_or_else(|e| e.into_inner());
            if first_error.is_none() {
                *first_error = Some(task.id());
                self.errcode.store(task.errcode(), Ordering::SeqCst);
            }
        }

        let to_admit = {
            let graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
            let Some(vertex) = graph.vertices.get(&task.id()) else {
                return;
            };
            vertex.successors.clone()
        };

        let mut newly_ready = Vec::new();
        {
            let mut graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
            for successor_id in to_admit {
                if let Some(v) = graph.vertices.get_mut(&successor_id) {
                    v.prereq_remaining = v.prereq_remaining.saturating_sub(1);
                    if v.prereq_remaining == 0 {
                        newly_ready.push(successor_id);
                    }
                }
            }
        }
        for id in newly_ready {
            self.admit(id);
        }

        if self.unhandled.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let result = match *state {
            DepState::Cancelling => {
                *state = DepState::Cancelled;
                None
            }
            DepState::Started => {
                *state = DepState::Done;
                let first_error = *self.first_error_task.lock().unwrap_or_else(|e| e.into_inner());
                let graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
                match first_error {
                    Some(id) => graph.vertices.get(&id).map(|v| Arc::clone(&v.task)),
                    None => graph.root().and_then(|id| graph.vertices.get(&id)).map(|v| Arc::clone(&v.task)),
                }
            }
            other => {
                warn!(?other, "task dep manager finished from an unexpected state");
                None
            }
        };
        drop(state);
        self.deliver_done(result);
    }

    fn deliver_done(&self, result_task: Option<Arc<Task>>) {
        let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(listener) = listener {
            let manager = self.self_arc();
            let posted = self.owner.post_exec((), move |()| {
                listener.on_done(&manager, result_task);
            });
            if posted.is_err() {
                warn!("failed to post task dep manager completion: owner loop is stopping");
            }
        }
    }
}

/// Internal [`Listener`], holding only a [`Weak`] back-reference, that
/// routes every admitted task's terminal event to
/// [`TaskDepManager::on_task_terminal`].
struct DepCompletionListener {
    dep_manager: Weak<TaskDepManager>,
}

impl Listener for DepCompletionListener {
    fn on_done(&self, task: &Arc<Task>) {
        if let Some(manager) = self.dep_manager.upgrade() {
            manager.on_task_terminal(task);
        }
    }

    fn on_cancelled(&self, task: &Arc<Task>) {
        if let Some(manager) = self.dep_manager.upgrade() {
            manager.on_task_terminal(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::Mutex as StdMutex;
    use std::thread;
    use std::time::Duration;

    use taskloom_testing::execute_or_abandon;

    use super::*;
    use crate::message::Priority;
    use crate::mloop::MessageLoop;
    use crate::task::TaskState;

    fn quick_task(name: &str, owner: MessageHandler, errcode: i32) -> Arc<Task> {
        Task::spawn(
            name,
            Priority::Normal,
            owner,
            Box::new(()),
            Box::new(move |_task| (Box::new(()) as Box<dyn Any + Send>, errcode)),
            None,
        )
    }

    struct Recorder {
        result: Arc<StdMutex<Option<Option<String>>>>,
    }

    impl DepManagerListener for Recorder {
        fn on_done(&self, _manager: &Arc<TaskDepManager>, result_task: Option<Arc<Task>>) {
            *self.result.lock().unwrap() = Some(result_task.map(|t| t.name().to_string()));
        }
    }

    #[test]
    fn diamond_dag_runs_in_dependency_order() {
        execute_or_abandon(|| {
            let (ml, handle) = MessageLoop::spawn("dep-s5");
            let owner = MessageHandler::new(handle, None);
            let dep = TaskDepManager::new(owner.clone(), 2);

            let a = quick_task("A", owner.clone(), 0);
            let b = quick_task("B", owner.clone(), 0);
            let c = quick_task("C", owner.clone(), 0);
            let d = quick_task("D", owner.clone(), 0);

            for t in [&a, &b, &c, &d] {
                dep.add_task(Arc::clone(t)).unwrap();
            }
            dep.add_dependency(&c, &a).unwrap();
            dep.add_dependency(&c, &b).unwrap();
            dep.add_dependency(&d, &c).unwrap();

            assert_eq!(dep.verify(), VerifyResult::Ok);
            assert_eq!(dep.root_task().unwrap().name(), "D");

            let result = Arc::new(StdMutex::new(None));
            dep.on_done(Arc::new(Recorder {
                result: Arc::clone(&result),
            }));

            dep.start().unwrap();

            while result.lock().unwrap().is_none() {
                thread::yield_now();
            }

            ml.stop();
            ml.join();

            assert_eq!(result.lock().unwrap().clone().unwrap(), Some("D".to_string()));
            assert_eq!(d.get_state(), TaskState::Terminated);
        })
        .unwrap();
    }

    #[test]
    fn closing_edge_into_a_cycle_is_rejected() {
        execute_or_abandon(|| {
            let (ml, handle) = MessageLoop::spawn("dep-s6");
            let owner = MessageHandler::new(handle, None);
            let dep = TaskDepManager::new(owner.clone(), 2);

            let a = quick_task("A", owner.clone(), 0);
            let b = quick_task("B", owner.clone(), 0);
            let c = quick_task("C", owner.clone(), 0);

            for t in [&a, &b, &c] {
                dep.add_task(Arc::clone(t)).unwrap();
            }
            dep.add_dependency(&b, &a).unwrap();
            dep.add_dependency(&c, &b).unwrap();

            // Closing the cycle must be rejected and leave the graph as-is.
            assert!(dep.add_dependency(&a, &c).is_err());
            assert_eq!(dep.verify(), VerifyResult::Ok);
            assert!(dep.start().is_ok());

            ml.stop();
            ml.join();
        })
        .unwrap();
    }

    #[test]
    fn multi_root_is_detected() {
        execute_or_abandon(|| {
            let (ml, handle) = MessageLoop::spawn("dep-multiroot");
            let owner = MessageHandler::new(handle, None);
            let dep = TaskDepManager::new(owner.clone(), 1);

            let a = quick_task("A", owner.clone(), 0);
            let b = quick_task("B", owner, 0);
            dep.add_task(Arc::clone(&a)).unwrap();
            dep.add_task(Arc::clone(&b)).unwrap();
            // No edges: both A and B have empty successors, i.e. two roots.
            assert_eq!(dep.verify(), VerifyResult::MultiRoot);

            ml.stop();
            ml.join();
        })
        .unwrap();
    }

    #[test]
    fn empty_graph_reports_empty() {
        execute_or_abandon(|| {
            let (ml, handle) = MessageLoop::spawn("dep-empty");
            let owner = MessageHandler::new(handle, None);
            let dep = TaskDepManager::new(owner, 1);
            assert_eq!(dep.verify(), VerifyResult::Empty);
            assert!(dep.start().is_err());

            ml.stop();
            ml.join();
        })
        .unwrap();
    }

    #[test]
    fn add_task_then_remove_task_restores_empty_structure() {
        execute_or_abandon(|| {
            let (ml, handle) = MessageLoop::spawn("dep-roundtrip");
            let owner = MessageHandler::new(handle, None);
            let dep = TaskDepManager::new(owner.clone(), 1);

            let a = quick_task("A", owner, 0);
            dep.add_task(Arc::clone(&a)).unwrap();
            assert_eq!(dep.verify(), VerifyResult::Ok);

            dep.remove_task(&a).unwrap();
            assert_eq!(dep.verify(), VerifyResult::Empty);

            ml.stop();
            ml.join();
        })
        .unwrap();
    }
}
