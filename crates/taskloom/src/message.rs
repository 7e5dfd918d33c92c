// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::fmt;

/// Scheduling priority for a [`Message`]. Declaration order is significant:
/// derived `Ord` makes `Higher < Lower`, so a `BinaryHeap`-free "lowest
/// variant first" bucket scan (see [`crate::mloop`]) walks the five levels
/// highest-to-lowest simply by iterating `Priority::ALL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Highest priority.
    Higher,
    /// High.
    High,
    /// Normal priority - the default for handler posts.
    Normal,
    /// Low.
    Low,
    /// Lowest priority.
    Lower,
}

impl Priority {
    /// All five levels, highest first - the order the loop scans buckets in.
    pub const ALL: [Self; 5] = [
        Self::Higher,
        Self::High,
        Self::Normal,
        Self::Low,
        Self::Lower,
    ];

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Higher => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
            Self::Lower => 4,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Reserved for future use. Carried verbatim on every [`Message`], but
/// nothing in this crate inspects it yet.
pub type MessageOptions = u32;

/// A unit of work posted to a [`crate::mloop::MessageLoop`] through a
/// [`crate::handler::MessageHandler`].
///
/// The payload is a boxed capability that drops itself when the message is
/// released, whether dispatched or discarded on loop teardown, so there is
/// no separate release function to forget to call.
pub enum Message {
    /// Carries an application-defined `code` plus an opaque payload. The
    /// handler's dispatch function is responsible for interpreting `code`.
    Data {
        /// Scheduling priority.
        priority: Priority,
        /// Reserved for future use.
        options: MessageOptions,
        /// Application-defined discriminant, analogous to a `switch` tag.
        code: i32,
        /// Opaque payload, downcast by the receiving dispatch function.
        payload: Box<dyn Any + Send>,
    },
    /// Carries a closure to run on the loop thread, plus the payload to run
    /// it with.
    Exec {
        /// Scheduling priority.
        priority: Priority,
        /// Reserved for future use.
        options: MessageOptions,
        /// Opaque payload, handed to `run` when this message is dispatched.
        payload: Box<dyn Any + Send>,
        /// The function to execute on the loop thread, called as
        /// `run(payload)`.
        run: Box<dyn FnOnce(Box<dyn Any + Send>) + Send>,
    },
}

impl Message {
    /// Priority used when a handler post does not specify one.
    pub const DEFAULT_PRIORITY: Priority = Priority::Normal;

    /// Options used when a handler post does not specify any.
    pub const DEFAULT_OPTIONS: MessageOptions = 0;

    pub(crate) const fn priority(&self) -> Priority {
        match self {
            Self::Data { priority, .. } | Self::Exec { priority, .. } => *priority,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data {
                priority, code, ..
            } => f
                .debug_struct("Message::Data")
                .field("priority", priority)
                .field("code", code)
                .finish_non_exhaustive(),
            Self::Exec { priority, .. } => f
                .debug_struct("Message::Exec")
                .field("priority", priority)
                .finish_non_exhaustive(),
        }
    }
}
