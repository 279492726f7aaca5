//! Scheduler running on a dedicated background thread.
//!
//! Workers can be added from any thread. The reactor thread is started on
//! demand, exits once it has nothing left to do, and is started again by
//! the next add.

use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::config::NetConfig;
use crate::net::Socket;
use crate::sched::task::{Task, TaskWorker};
use crate::sched::worker::{lock, SharedWorker};
use crate::sched::{Scheduler, SchedulerHandle};

#[derive(Default)]
struct ReactorThread {
    running: bool,
    join: Option<JoinHandle<()>>,
}

pub struct DetachedScheduler {
    handle: SchedulerHandle,
    thread: Arc<Mutex<ReactorThread>>,
}

impl DetachedScheduler {
    pub fn new(config: NetConfig) -> Self {
        Self {
            handle: SchedulerHandle::new(config),
            thread: Arc::new(Mutex::new(ReactorThread::default())),
        }
    }

    pub fn handle(&self) -> &SchedulerHandle {
        &self.handle
    }

    pub fn add_worker(&self, worker: SharedWorker) -> io::Result<()> {
        // Holding the thread lock while enqueueing pairs with the exit check
        // in the reactor loop, so a worker is never stranded.
        let mut thread = lock(&self.thread);
        self.handle.add_worker(worker);
        if !thread.running {
            self.spawn_reactor(&mut thread)?;
        }
        Ok(())
    }

    pub fn add_socket(&self, socket: Socket) -> io::Result<Arc<Mutex<Socket>>> {
        let socket = Arc::new(Mutex::new(socket));
        self.add_worker(socket.clone())?;
        Ok(socket)
    }

    pub fn add_task<T: Task>(&self, task: T) -> io::Result<Arc<Mutex<TaskWorker<T>>>> {
        let worker = Arc::new(Mutex::new(TaskWorker::new(task)));
        self.add_worker(worker.clone())?;
        Ok(worker)
    }

    pub fn is_active(&self) -> bool {
        lock(&self.thread).running
    }

    /// Block until the reactor thread has run out of work.
    pub fn await_completion(&self) {
        let join = lock(&self.thread).join.take();
        if let Some(join) = join {
            if join.join().is_err() {
                tracing::error!("Detached scheduler thread panicked");
            }
        }
    }

    pub fn update_config(&self, config: NetConfig) {
        self.handle.update_config(config);
    }

    pub fn close_reusable_sockets(&self) {
        self.handle.request_close_reusable_sockets();
    }

    fn spawn_reactor(&self, thread: &mut ReactorThread) -> io::Result<()> {
        let handle = self.handle.clone();
        let shared = Arc::clone(&self.thread);
        let join = thread::Builder::new()
            .name("detached-scheduler".to_string())
            .spawn(move || {
                let mut scheduler = Scheduler::with_handle(handle.clone());
                scheduler.set_catch_panics(true);
                loop {
                    scheduler.run();
                    let mut thread = lock(&shared);
                    if !handle.has_pending() {
                        thread.running = false;
                        break;
                    }
                }
                tracing::debug!("Detached scheduler out of work");
            })?;
        thread.running = true;
        thread.join = Some(join);
        Ok(())
    }
}

impl Default for DetachedScheduler {
    fn default() -> Self {
        Self::new(NetConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Poll;

    struct Echo(u32, u32);

    impl Task for Echo {
        type Output = u32;

        fn on_tick(&mut self, _: &SchedulerHandle) -> Poll<u32> {
            self.1 += 1;
            if self.1 >= 3 {
                Poll::Ready(self.0)
            } else {
                Poll::Pending
            }
        }
    }

    #[test]
    fn runs_tasks_on_background_thread() {
        let detached = DetachedScheduler::default();
        let a = detached.add_task(Echo(7, 0)).unwrap();
        let b = detached.add_task(Echo(9, 0)).unwrap();
        detached.await_completion();

        assert!(!detached.is_active());
        assert_eq!(lock(&a).take_output(), Some(7));
        assert_eq!(lock(&b).take_output(), Some(9));
    }

    #[test]
    fn restarts_after_going_idle() {
        let detached = DetachedScheduler::default();
        let first = detached.add_task(Echo(1, 0)).unwrap();
        detached.await_completion();
        assert_eq!(lock(&first).take_output(), Some(1));

        let second = detached.add_task(Echo(2, 0)).unwrap();
        detached.await_completion();
        assert_eq!(lock(&second).take_output(), Some(2));
    }
}
