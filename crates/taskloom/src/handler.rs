// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::error::Result;
use crate::message::{Message, MessageOptions, Priority};
use crate::mloop::LoopHandle;

/// A `Data` message's application-defined handling logic, invoked on the
/// owning loop's thread with the message that triggered it.
pub trait Dispatch: Send + Sync {
    /// Handle one `Data` message. `code`/`payload` are the values the poster
    /// gave to [`MessageHandler::post_data`]. Must not panic in a way that
    /// would be surprising to the caller - a panic here unwinds the loop
    /// thread, matching what a crashing callback would do in any other
    /// design.
    fn handle(&self, code: i32, payload: &(dyn Any + Send));
}

impl<F> Dispatch for F
where
    F: Fn(i32, &(dyn Any + Send)) + Send + Sync,
{
    fn handle(&self, code: i32, payload: &(dyn Any + Send)) {
        self(code, payload);
    }
}

/// Immutable pairing of a loop and an optional dispatch function, plus an
/// opaque caller tag. A handler never owns the loop - it is just a named
/// endpoint into one, and multiple handlers can share the same loop thread.
///
/// Destroying (dropping) a handler does not stop its loop.
#[derive(Clone)]
pub struct MessageHandler {
    loop_handle: LoopHandle,
    dispatch: Option<Arc<dyn Dispatch>>,
    tag: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandler")
            .field("loop_handle", &self.loop_handle)
            .field("has_dispatch", &self.dispatch.is_some())
            .finish_non_exhaustive()
    }
}

impl MessageHandler {
    /// Creates a handler bound to `loop_handle`. `dispatch` receives every
    /// `Data` message posted through this handler; pass `None` to use the
    /// default handler, under which `Data` messages posted through this
    /// handler are dropped (and logged at `trace`) since there is nowhere
    /// for them to go.
    #[must_use]
    pub fn new(loop_handle: LoopHandle, dispatch: Option<Arc<dyn Dispatch>>) -> Self {
        Self::with_tag(loop_handle, dispatch, Arc::new(()))
    }

    /// As [`Self::new`], but also attaches an opaque `tag` retrievable with
    /// [`Self::tag`]. The tag is released (dropped) when the last clone of
    /// this handler is dropped.
    #[must_use]
    pub fn with_tag(
        loop_handle: LoopHandle,
        dispatch: Option<Arc<dyn Dispatch>>,
        tag: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            loop_handle,
            dispatch,
            tag,
        }
    }

    /// The loop this handler posts to.
    #[must_use]
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    /// The tag given at construction.
    #[must_use]
    pub fn tag(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.tag
    }

    /// Posts a `Data` message at the default priority/options.
    pub fn post_data<T>(&self, code: i32, payload: T) -> Result<()>
    where
        T: Any + Send,
    {
        self.post_data2(code, payload, Message::DEFAULT_PRIORITY, Message::DEFAULT_OPTIONS)
    }

    /// Posts a `Data` message with an explicit priority and options.
    pub fn post_data2<T>(
        &self,
        code: i32,
        payload: T,
        priority: Priority,
        options: MessageOptions,
    ) -> Result<()>
    where
        T: Any + Send,
    {
        let dispatch = self.dispatch.clone();
        let msg = Message::Data {
            priority,
            options,
            code,
            payload: Box::new(payload),
        };
        self.loop_handle.post(msg, dispatch)
    }

    /// Posts an `Exec` message at the default priority/options. `run` is
    /// invoked on the loop thread with ownership of `payload`.
    pub fn post_exec<T, F>(&self, payload: T, run: F) -> Result<()>
    where
        T: Any + Send,
        F: FnOnce(T) + Send + 'static,
    {
        self.post_exec2(
            payload,
            run,
            Message::DEFAULT_PRIORITY,
            Message::DEFAULT_OPTIONS,
        )
    }

    /// Posts an `Exec` message with an explicit priority and options.
    pub fn post_exec2<T, F>(
        &self,
        payload: T,
        run: F,
        priority: Priority,
        options: MessageOptions,
    ) -> Result<()>
    where
        T: Any + Send,
        F: FnOnce(T) + Send + 'static,
    {
        let msg = Message::Exec {
            priority,
            options,
            payload: Box::new(payload),
            run: Box::new(move |payload: Box<dyn Any + Send>| {
                let payload = *payload
                    .downcast::<T>()
                    .unwrap_or_else(|_| unreachable!("post_exec2 boxed exactly T above"));
                run(payload);
            }),
        };
        self.loop_handle.post(msg, None)
    }

    /// If the current thread is the loop's own thread, invokes `run(payload)`
    /// synchronously; otherwise behaves exactly like [`Self::post_exec`].
    pub fn exec_on<T, F>(&self, payload: T, run: F) -> Result<()>
    where
        T: Any + Send,
        F: FnOnce(T) + Send + 'static,
    {
        if self.loop_handle.is_current_thread() {
            trace!("exec_on: running inline on loop thread");
            run(payload);
            Ok(())
        } else {
            self.post_exec(payload, run)
        }
    }
}
