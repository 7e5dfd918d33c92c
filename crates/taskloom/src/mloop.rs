// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::handler::Dispatch;
use crate::message::{Message, Priority};

/// Lifecycle of a [`MessageLoop`]'s dispatch thread.
///
/// `Ready` is the brief window between [`MessageLoop::spawn`] returning and
/// the spawned thread taking the queue lock for the first time. Everything
/// else behaves as if the loop were already `Looping`: posts are accepted
/// and queued either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// The dispatch thread has not yet entered its loop.
    Ready,
    /// Draining the queue and dispatching messages as they arrive.
    Looping,
    /// [`MessageLoop::stop`] was called; the thread will drain whatever is
    /// already queued, then terminate. No further posts are accepted.
    Stopping,
    /// The dispatch thread has exited.
    Terminated,
}

enum Entry {
    Data {
        code: i32,
        payload: Box<dyn Any + Send>,
        dispatch: Option<Arc<dyn Dispatch>>,
    },
    Exec {
        payload: Box<dyn Any + Send>,
        run: Box<dyn FnOnce(Box<dyn Any + Send>) + Send>,
    },
}

struct Queues {
    buckets: [VecDeque<Entry>; 5],
    state: LoopState,
}

impl Queues {
    fn new() -> Self {
        Self {
            buckets: Default::default(),
            state: LoopState::Ready,
        }
    }

    fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    /// Pops the front of the highest-priority non-empty bucket, scanning
    /// `Priority::ALL` highest-to-lowest.
    fn pop_highest(&mut self) -> Option<Entry> {
        for priority in Priority::ALL {
            if let Some(entry) = self.buckets[priority.index()].pop_front() {
                return Some(entry);
            }
        }
        None
    }
}

struct Shared {
    name: String,
    queues: Mutex<Queues>,
    condvar: Condvar,
    thread_id: Mutex<Option<ThreadId>>,
}

impl Shared {
    fn state(&self) -> LoopState {
        self.queues.lock().unwrap_or_else(|e| e.into_inner()).state
    }
}

/// Owns a loop's dispatch thread. Dropping this without calling
/// [`Self::stop`]/[`Self::join`] leaves the thread running in the
/// background - a looper outlives whoever created it unless told otherwise,
/// and it is only reclaimed by the process exiting.
pub struct MessageLoop {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

/// A cheap, cloneable reference to a [`MessageLoop`], used to post messages
/// to it without owning its thread. This is the capability handed to
/// [`crate::handler::MessageHandler`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("name", &self.shared.name)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl MessageLoop {
    /// Spawns a new named dispatch thread and returns the owning
    /// [`MessageLoop`] alongside a [`LoopHandle`] for posting to it.
    #[must_use]
    pub fn spawn(name: impl Into<String>) -> (Self, LoopHandle) {
        let name = name.into();
        let shared = Arc::new(Shared {
            name: name.clone(),
            queues: Mutex::new(Queues::new()),
            condvar: Condvar::new(),
            thread_id: Mutex::new(None),
        });

        let worker_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || run(&worker_shared))
            .expect("failed to spawn message loop thread");

        let ml = Self {
            shared: Arc::clone(&shared),
            thread: Some(thread),
        };
        let handle = LoopHandle { shared };
        (ml, handle)
    }

    /// A handle to this loop. Cheap to clone further.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Requests that the dispatch thread drain its queue and then exit.
    /// Idempotent. After this, further [`LoopHandle::post`] calls fail with
    /// [`Error::Programming`].
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Blocks until the dispatch thread has exited. Call [`Self::stop`]
    /// first unless something else will.
    ///
    /// # Panics
    ///
    /// Panics if the dispatch thread itself panicked.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            thread.join().expect("message loop thread panicked");
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    /// The OS thread id of the dispatch thread, once it has started.
    #[must_use]
    pub fn thread_id(&self) -> Option<ThreadId> {
        *self.shared.thread_id.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Shared {
    fn stop(&self) {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if queues.state == LoopState::Ready || queues.state == LoopState::Looping {
            queues.state = LoopState::Stopping;
            self.condvar.notify_all();
        }
    }

    fn post(&self, msg: Message, dispatch: Option<Arc<dyn Dispatch>>) -> Result<()> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        match queues.state {
            LoopState::Stopping | LoopState::Terminated => {
                return Err(Error::Programming(format!(
                    "cannot post to loop '{}': it is stopping or terminated",
                    self.name
                )));
            }
            LoopState::Ready | LoopState::Looping => {}
        }

        let priority = msg.priority();
        let entry = match msg {
            Message::Data { code, payload, .. } => Entry::Data {
                code,
                payload,
                dispatch,
            },
            Message::Exec { payload, run, .. } => Entry::Exec { payload, run },
        };
        queues.buckets[priority.index()].push_back(entry);
        self.condvar.notify_one();
        Ok(())
    }
}

impl LoopHandle {
    pub(crate) fn post(&self, msg: Message, dispatch: Option<Arc<dyn Dispatch>>) -> Result<()> {
        self.shared.post(msg, dispatch)
    }

    /// Whether the calling thread is this loop's own dispatch thread.
    #[must_use]
    pub fn is_current_thread(&self) -> bool {
        let current = thread::current().id();
        *self.shared.thread_id.lock().unwrap_or_else(|e| e.into_inner()) == Some(current)
    }

    /// Requests that the dispatch thread drain its queue and then exit.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.shared.state()
    }
}

fn run(shared: &Arc<Shared>) {
    *shared.thread_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(thread::current().id());
    {
        let mut queues = shared.queues.lock().unwrap_or_else(|e| e.into_inner());
        if queues.state == LoopState::Ready {
            queues.state = LoopState::Looping;
        }
    }
    debug!(loop_name = %shared.name, "message loop started");

    loop {
        let entry = {
            let mut queues = shared.queues.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if let Some(entry) = queues.pop_highest() {
                    break Some(entry);
                }
                if queues.state == LoopState::Stopping {
                    break None;
                }
                queues = shared
                    .condvar
                    .wait(queues)
                    .unwrap_or_else(|e| e.into_inner());
            }
        };

        let Some(entry) = entry else { break };
        dispatch_one(shared, entry);
    }

    let mut queues = shared.queues.lock().unwrap_or_else(|e| e.into_inner());
    queues.state = LoopState::Terminated;
    debug!(loop_name = %shared.name, "message loop terminated");
}

fn dispatch_one(shared: &Arc<Shared>, entry: Entry) {
    match entry {
        Entry::Data {
            code,
            payload,
            dispatch,
        } => {
            if let Some(dispatch) = dispatch {
                dispatch.handle(code, &*payload);
            } else {
                trace!(loop_name = %shared.name, code, "dropping Data message with no dispatch");
            }
        }
        Entry::Exec { payload, run } => {
            run(payload);
        }
    }
}

impl Drop for MessageLoop {
    fn drop(&mut self) {
        if self.thread.is_some() && self.shared.state() != LoopState::Terminated {
            warn!(
                loop_name = %self.shared.name,
                "MessageLoop dropped without join(); its thread keeps running"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use taskloom_testing::execute_or_abandon;

    use super::*;

    #[test]
    fn spawn_then_stop_join_terminates() {
        execute_or_abandon(|| {
            let (ml, _handle) = MessageLoop::spawn("t1");
            ml.stop();
            ml.join();
        })
        .unwrap();
    }

    #[test]
    fn higher_priority_dispatches_before_lower() {
        execute_or_abandon(|| {
            let (ml, handle) = MessageLoop::spawn("t2");
            let order = Arc::new(Mutex::new(Vec::new()));

            // Post lower-priority first; higher-priority should still win.
            for (priority, label) in [(Priority::Lower, "lower"), (Priority::Higher, "higher")] {
                let order = Arc::clone(&order);
                let msg = Message::Exec {
                    priority,
                    options: 0,
                    payload: Box::new(()),
                    run: Box::new(move |_| {
                        order.lock().unwrap().push(label);
                    }),
                };
                handle.post(msg, None).unwrap();
            }

            ml.stop();
            ml.join();

            assert_eq!(*order.lock().unwrap(), vec!["higher", "lower"]);
        })
        .unwrap();
    }

    #[test]
    fn post_after_stop_is_rejected() {
        execute_or_abandon(|| {
            let (ml, handle) = MessageLoop::spawn("t3");
            ml.stop();
            ml.join();

            let msg = Message::Exec {
                priority: Priority::Normal,
                options: 0,
                payload: Box::new(()),
                run: Box::new(|_| {}),
            };
            assert!(handle.post(msg, None).is_err());
        })
        .unwrap();
    }

    #[test]
    fn is_current_thread_true_only_on_loop_thread() {
        execute_or_abandon(|| {
            let (ml, handle) = MessageLoop::spawn("t4");
            assert!(!handle.is_current_thread());

            let seen = Arc::new(AtomicUsize::new(0));
            let seen_clone = Arc::clone(&seen);
            let handle_clone = handle.clone();
            let msg = Message::Exec {
                priority: Priority::Normal,
                options: 0,
                payload: Box::new(()),
                run: Box::new(move |_| {
                    seen_clone.store(usize::from(handle_clone.is_current_thread()), Ordering::SeqCst);
                }),
            };
            handle.post(msg, None).unwrap();

            ml.stop();
            ml.join();

            assert_eq!(seen.load(Ordering::SeqCst), 1);
        })
        .unwrap();
    }
}
