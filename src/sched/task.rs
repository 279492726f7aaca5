//! Tick-driven tasks.
//!
//! A task is polled once per scheduler tick until it reports completion.
//! Callers without a scheduler can use [`Task::run`], which spins up a
//! private one and blocks until the task is done.

use std::task::Poll;

use crate::sched::worker::{lock, Disposition, HoldupKind, Worker, WorkerKind};
use crate::sched::{Scheduler, SchedulerHandle};

pub trait Task: Send + Sized + 'static {
    type Output: Send + 'static;

    /// Advance the task. Returning `Poll::Ready` marks it done.
    fn on_tick(&mut self, scheduler: &SchedulerHandle) -> Poll<Self::Output>;

    fn disposition(&self) -> Disposition {
        Disposition::Neutral
    }

    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    /// Drive the task to completion on a private scheduler.
    ///
    /// Returns `None` if the task was abandoned without producing output.
    fn run(self) -> Option<Self::Output> {
        let mut scheduler = Scheduler::new();
        scheduler.set_catch_panics(false);
        let handle = scheduler.add_task(self);
        scheduler.run();
        let output = lock(&handle).take_output();
        output
    }
}

/// Adapts a [`Task`] to the [`Worker`] interface. Its holdup is `Idle`
/// until the task completes.
pub struct TaskWorker<T: Task> {
    task: T,
    output: Option<T::Output>,
    done: bool,
    scheduler: Option<SchedulerHandle>,
}

impl<T: Task> TaskWorker<T> {
    pub fn new(task: T) -> Self {
        Self {
            task,
            output: None,
            done: false,
            scheduler: None,
        }
    }

    pub fn is_work_done(&self) -> bool {
        self.done
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    pub fn task_mut(&mut self) -> &mut T {
        &mut self.task
    }

    pub fn take_output(&mut self) -> Option<T::Output> {
        self.output.take()
    }
}

impl<T: Task> Worker for TaskWorker<T> {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Task
    }

    fn holdup_kind(&self) -> HoldupKind {
        if self.done {
            HoldupKind::None
        } else {
            HoldupKind::Idle
        }
    }

    fn fire_holdup(&mut self) {
        if self.done {
            return;
        }
        if let Some(scheduler) = &self.scheduler {
            if let Poll::Ready(output) = self.task.on_tick(scheduler) {
                self.output = Some(output);
                self.done = true;
            }
        }
    }

    fn clear_holdup(&mut self) {
        self.done = true;
    }

    fn attach(&mut self, scheduler: &SchedulerHandle) {
        self.scheduler = Some(scheduler.clone());
    }

    fn disposition(&self) -> Disposition {
        self.task.disposition()
    }

    fn describe(&self) -> String {
        self.task.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Countdown(u32);

    impl Task for Countdown {
        type Output = &'static str;

        fn on_tick(&mut self, _: &SchedulerHandle) -> Poll<Self::Output> {
            if self.0 == 0 {
                return Poll::Ready("liftoff");
            }
            self.0 -= 1;
            Poll::Pending
        }
    }

    #[test]
    fn run_blocks_until_ready() {
        assert_eq!(Countdown(5).run(), Some("liftoff"));
    }

    #[test]
    fn unattached_worker_does_not_tick() {
        let mut worker = TaskWorker::new(Countdown(0));
        worker.fire_holdup();
        assert!(!worker.is_work_done());
        assert_eq!(worker.holdup_kind(), HoldupKind::Idle);
    }

    #[test]
    fn clearing_marks_done() {
        let mut worker = TaskWorker::new(Countdown(3));
        worker.clear_holdup();
        assert_eq!(worker.holdup_kind(), HoldupKind::None);
        assert!(worker.take_output().is_none());
    }
}
