// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! taskloom is the concurrent task execution core of a general-purpose
//! systems library.
//!
//! Four layers, bottom-up: a [`MessageLoop`] drains a priority-ordered
//! queue on a dedicated worker thread; a [`MessageHandler`] is a named
//! endpoint bound to one; a [`Task`] is a cancellable, observable unit of
//! work whose lifecycle events are posted back to its owner handler; a
//! [`TaskManager`] admits tasks against a slot-limited, 5-level priority
//! run queue; and a [`TaskDepManager`] executes a DAG of tasks atop a
//! `TaskManager`, honoring prerequisite order.

mod depman;
mod error;
mod handler;
mod manager;
mod message;
mod mloop;
mod tagmap;
mod task;

pub use depman::{DepManagerListener, DepState, TaskDepManager, VerifyResult};
pub use error::{Error, ErrorCode, Result};
pub use handler::{Dispatch, MessageHandler};
pub use manager::{ManagerListener, QueueEvent, QueueLocation, TaskManager, TaskManagerBuilder};
pub use message::{Message, MessageOptions, Priority};
pub use mloop::{LoopHandle, LoopState, MessageLoop};
pub use tagmap::TagMap;
pub use task::{CancelMode, Listener, Task, TaskBody, TaskState};
