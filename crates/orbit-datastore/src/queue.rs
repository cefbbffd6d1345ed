//! Worker-thread task queue
//!
//! A fixed set of named OS threads pull boxed jobs off one shared channel.
//! With a single worker, jobs run strictly in submission order.
//!
//! Work submitted from one of the queue's own workers runs in place instead
//! of being enqueued, so a task may call back into the queue without waiting
//! on itself.

use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, error, warn};

use crate::error::{DatastoreError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct TaskQueue {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: HashSet<ThreadId>,
}

impl TaskQueue {
    /// Spawn `worker_count` workers; anything below one spawns one.
    pub fn new(name: impl Into<String>, worker_count: usize) -> Result<Self> {
        let name = name.into();
        let worker_count = worker_count.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let receiver = Arc::clone(&receiver);
            let thread_name = format!("{name}-worker-{index}");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || run_worker(&receiver))
                .map_err(|error| DatastoreError::WorkerSpawn {
                    name: thread_name,
                    reason: error.to_string(),
                })?;
            workers.push(handle);
        }

        let worker_ids = workers.iter().map(|handle| handle.thread().id()).collect();
        debug!(queue = %name, workers = worker_count, "Task queue started");

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            worker_ids,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.worker_ids.len()
    }

    pub fn is_worker_thread(&self) -> bool {
        self.worker_ids.contains(&thread::current().id())
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Run `task` on a worker and forget about it.
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_worker_thread() {
            task();
            return Ok(());
        }

        self.enqueue(Box::new(task))
    }

    /// Run `task` on a worker, then hand its outcome to `callback`.
    ///
    /// The callback always runs on a worker thread, right after the task. A
    /// panicking task reaches the callback as
    /// [`DatastoreError::TaskPanicked`]; a panicking callback is logged and
    /// the worker carries on.
    pub fn submit<T, F, C>(&self, task: F, callback: C) -> Result<()>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
        C: FnOnce(Result<T>) + Send + 'static,
    {
        let job = move || {
            let outcome = run_catching(task);
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || callback(outcome)))
            {
                error!(
                    panic = %panic_message(payload.as_ref()),
                    "Task completion callback panicked"
                );
            }
        };

        self.execute(job)
    }

    /// Run `task` on a worker and block until its result is available.
    pub fn call<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if self.is_worker_thread() {
            return run_catching(task);
        }

        let (result_tx, result_rx) = mpsc::sync_channel(1);
        self.enqueue(Box::new(move || {
            let _ = result_tx.send(run_catching(task));
        }))?;

        result_rx.recv().map_err(|_| DatastoreError::QueueClosed)?
    }

    /// Stop accepting work, let queued jobs drain and join the workers.
    pub fn shutdown(&self) {
        let Some(sender) = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        drop(sender);

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let current = thread::current().id();

        for worker in workers {
            // a worker dropping the last handle can't join itself
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!(queue = %self.name, "Worker thread exited with a panic");
            }
        }

        debug!(queue = %self.name, "Task queue shut down");
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Err(DatastoreError::QueueClosed);
        };

        sender.send(job).map_err(|_| DatastoreError::QueueClosed)
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.name)
            .field("workers", &self.worker_ids.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn run_worker(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = {
            let guard = receiver.lock();
            match guard {
                Ok(guard) => guard.recv(),
                Err(_) => return,
            }
        };

        match job {
            Ok(job) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    error!(panic = %panic_message(payload.as_ref()), "Queued task panicked");
                }
            }
            Err(_) => break,
        }
    }
}

fn run_catching<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    panic::catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|payload| {
        Err(DatastoreError::TaskPanicked(panic_message(payload.as_ref())))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::time::Duration;

    use super::*;

    fn on_named_worker(prefix: &str) -> bool {
        thread::current()
            .name()
            .is_some_and(|name| name.starts_with(prefix))
    }

    #[test]
    fn test_single_worker_runs_in_submission_order() {
        let queue = TaskQueue::new("fifo", 1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for index in 0..100 {
            let order = Arc::clone(&order);
            queue
                .execute(move || order.lock().unwrap().push(index))
                .unwrap();
        }
        queue.call(|| Ok(())).unwrap();

        assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_workers_means_one() {
        let queue = TaskQueue::new("zero", 0).unwrap();
        assert_eq!(queue.worker_count(), 1);
    }

    #[test]
    fn test_callback_runs_on_worker_thread() {
        let queue = TaskQueue::new("callback", 1).unwrap();
        let (done_tx, done_rx) = mpsc::channel();

        queue
            .submit(
                || Ok(21 * 2),
                move |result| {
                    let _ = done_tx.send((result.ok(), on_named_worker("callback-worker-")));
                },
            )
            .unwrap();

        let (value, on_worker) = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(value, Some(42));
        assert!(on_worker);
        assert!(!queue.is_worker_thread());
    }

    #[test]
    fn test_reentrant_submission_runs_in_place() {
        let queue = Arc::new(TaskQueue::new("reentrant", 1).unwrap());
        let inner_queue = Arc::clone(&queue);

        let (outer_thread, inner_thread) = queue
            .call(move || {
                let outer = thread::current().id();
                let inner = inner_queue.call(|| Ok(thread::current().id()))?;
                Ok((outer, inner))
            })
            .unwrap();

        assert_eq!(outer_thread, inner_thread);
    }

    #[test]
    fn test_reentrant_submit_invokes_callback_before_returning() {
        let queue = Arc::new(TaskQueue::new("nested", 1).unwrap());
        let inner_queue = Arc::clone(&queue);

        let seen = queue
            .call(move || {
                let seen = Arc::new(Mutex::new(None));
                let slot = Arc::clone(&seen);
                inner_queue.submit(|| Ok("inner"), move |result| {
                    *slot.lock().unwrap() = result.ok();
                })?;
                let value = *seen.lock().unwrap();
                Ok(value)
            })
            .unwrap();

        assert_eq!(seen, Some("inner"));
    }

    #[test]
    fn test_panicking_task_reports_error_and_worker_survives() {
        let queue = TaskQueue::new("panics", 1).unwrap();
        let (done_tx, done_rx) = mpsc::channel();

        queue
            .submit(
                || -> Result<()> { panic!("boom") },
                move |result| {
                    let _ = done_tx.send(result);
                },
            )
            .unwrap();

        let result = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(DatastoreError::TaskPanicked(message)) if message == "boom"));

        queue.execute(|| panic!("fire and forget")).unwrap();
        queue
            .submit(|| Ok(()), |_| panic!("callback failure"))
            .unwrap();

        assert_eq!(queue.call(|| Ok(7)).unwrap(), 7);
    }

    #[test]
    fn test_call_reports_panic_as_error() {
        let queue = TaskQueue::new("call-panic", 1).unwrap();
        let result: Result<()> = queue.call(|| panic!("{}", String::from("owned message")));
        assert!(
            matches!(result, Err(DatastoreError::TaskPanicked(message)) if message == "owned message")
        );
    }

    #[test]
    fn test_pool_runs_tasks_concurrently() {
        let workers = 4;
        let queue = TaskQueue::new("pool", workers).unwrap();
        let barrier = Arc::new(Barrier::new(workers));
        let (done_tx, done_rx) = mpsc::channel();

        for _ in 0..workers {
            let barrier = Arc::clone(&barrier);
            let done_tx = done_tx.clone();
            queue
                .execute(move || {
                    barrier.wait();
                    let _ = done_tx.send(());
                })
                .unwrap();
        }

        for _ in 0..workers {
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }

    #[test]
    fn test_shutdown_drains_queue_and_rejects_new_work() {
        let queue = TaskQueue::new("drain", 1).unwrap();
        let counter = Arc::new(Mutex::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            queue
                .execute(move || {
                    thread::sleep(Duration::from_millis(1));
                    *counter.lock().unwrap() += 1;
                })
                .unwrap();
        }

        queue.shutdown();
        assert_eq!(*counter.lock().unwrap(), 10);
        assert!(queue.is_shut_down());
        assert!(matches!(queue.execute(|| {}), Err(DatastoreError::QueueClosed)));
        assert!(matches!(queue.call(|| Ok(())), Err(DatastoreError::QueueClosed)));

        queue.shutdown();
    }
}
