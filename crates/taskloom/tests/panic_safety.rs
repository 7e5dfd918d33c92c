// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A task body that panics must still settle into a terminal state and be
//! removed from whatever `TaskManager` admitted it - the cleanup guard in
//! `task::run_body` is not optional scaffolding, it is what keeps a single
//! misbehaving body from wedging the manager it ran under.

use std::any::Any;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use taskloom::{MessageHandler, MessageLoop, Priority, Task, TaskManager, TaskState};
use taskloom_testing::execute_or_abandon;

#[test]
fn panicking_body_still_reaches_terminal_state() {
    execute_or_abandon(|| {
        let (ml, handle) = MessageLoop::spawn("panic-safety");
        let owner = MessageHandler::new(handle, None);

        let task = Task::spawn(
            "panics",
            Priority::Normal,
            owner,
            Box::new(()),
            Box::new(|_task| panic!("deliberate body panic")),
            None,
        );

        task.start().unwrap();

        // join() must return an error (the result was never set), not hang
        // forever waiting on a state transition that never happens.
        assert!(task.join().is_err());
        assert_eq!(task.get_state(), TaskState::Terminated);

        ml.stop();
        ml.join();
    })
    .unwrap();
}

#[test]
fn manager_frees_its_slot_after_a_panicking_task() {
    execute_or_abandon(|| {
        let (ml, handle) = MessageLoop::spawn("panic-safety-manager");
        let owner = MessageHandler::new(handle, None);
        let manager = TaskManager::new(owner.clone(), 1);

        let doomed = Task::spawn(
            "doomed",
            Priority::Normal,
            owner.clone(),
            Box::new(()),
            Box::new(|_task| panic!("deliberate body panic")),
            None,
        );
        manager.add_task(Arc::clone(&doomed)).unwrap();

        // Give the panicking worker thread's cleanup guard a chance to run
        // and the manager's internal listener to re-balance.
        while manager.size() != 0 {
            thread::sleep(Duration::from_millis(5));
        }

        // The slot the panicking task occupied must be usable again.
        let survivor = Task::spawn(
            "survivor",
            Priority::Normal,
            owner,
            Box::new(()),
            Box::new(|_task| (Box::new(7i32) as Box<dyn Any + Send>, 0)),
            None,
        );
        manager.add_task(Arc::clone(&survivor)).unwrap();
        assert_eq!(*survivor.join().unwrap().downcast::<i32>().unwrap(), 7);

        while manager.size() != 0 {
            thread::sleep(Duration::from_millis(5));
        }
        manager.destroy().unwrap();

        ml.stop();
        ml.join();
    })
    .unwrap();
}
