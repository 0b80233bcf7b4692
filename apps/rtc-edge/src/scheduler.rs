//! Single-consumer cooperative task queue.
//!
//! Every piece of session and engine state is mutated from tasks executed by
//! one [`Worker`]. Other threads (tokio I/O tasks, peer-connection callbacks)
//! only ever [`Scheduler::post`] closures; the worker runs them one at a time
//! in FIFO order against the context it was started with.
//!
//! Liveness is reference counted: while at least one unit of work is
//! registered the worker waits for more tasks, once the count drops to zero
//! and the queue is empty [`Worker::run`] returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};

pub type Task<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

enum Event<C> {
    Run(Task<C>),
    Wake,
}

struct Shared<C> {
    tx: UnboundedSender<Event<C>>,
    work: AtomicUsize,
    pending: AtomicUsize,
}

/// Cloneable handle used to enqueue tasks and register work.
pub struct Scheduler<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for Scheduler<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C> std::fmt::Debug for Scheduler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("work", &self.work_count())
            .field("pending", &self.pending())
            .finish()
    }
}

/// The single consumer. Owned by whoever drives the context.
pub struct Worker<C> {
    rx: UnboundedReceiver<Event<C>>,
    shared: Arc<Shared<C>>,
}

impl<C> Scheduler<C> {
    pub fn new() -> (Scheduler<C>, Worker<C>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            tx,
            work: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
        });
        (
            Scheduler {
                shared: Arc::clone(&shared),
            },
            Worker { rx, shared },
        )
    }

    /// Enqueue `task`. Safe to call from any thread.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if self.shared.tx.send(Event::Run(Box::new(task))).is_err() {
            // Worker is gone; nothing will ever run this.
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::trace!("task posted after worker shut down");
        }
    }

    pub fn add_work(&self) {
        self.shared.work.fetch_add(1, Ordering::SeqCst);
    }

    pub fn remove_work(&self) {
        let previous = self.shared.work.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "remove_work without matching add_work");
        // Wake a worker parked on an empty queue so it can re-check the count.
        let _ = self.shared.tx.send(Event::Wake);
    }

    /// Register one unit of work, released when the guard drops.
    pub fn work(&self) -> WorkGuard<C> {
        self.add_work();
        WorkGuard {
            scheduler: self.clone(),
        }
    }

    pub fn work_count(&self) -> usize {
        self.shared.work.load(Ordering::SeqCst)
    }

    /// Number of posted tasks that have not run yet.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }
}

impl<C> Worker<C> {
    /// Drain tasks against `ctx` until no work is registered and the queue is
    /// empty.
    pub async fn run(&mut self, ctx: &mut C) {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    self.dispatch(event, ctx);
                    continue;
                }
                Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => {}
            }
            if self.shared.work.load(Ordering::SeqCst) == 0 {
                return;
            }
            match self.rx.recv().await {
                Some(event) => self.dispatch(event, ctx),
                None => return,
            }
        }
    }

    pub fn scheduler(&self) -> Scheduler<C> {
        Scheduler {
            shared: Arc::clone(&self.shared),
        }
    }

    fn dispatch(&self, event: Event<C>, ctx: &mut C) {
        if let Event::Run(task) = event {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            task(ctx);
        }
    }
}

/// Keep-alive registration; see [`Scheduler::work`].
pub struct WorkGuard<C> {
    scheduler: Scheduler<C>,
}

impl<C> Drop for WorkGuard<C> {
    fn drop(&mut self) {
        self.scheduler.remove_work();
    }
}

impl<C> std::fmt::Debug for WorkGuard<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WorkGuard")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn run_returns_immediately_without_work() {
        let (scheduler, mut worker) = Scheduler::<Vec<u32>>::new();
        scheduler.post(|log| log.push(1));
        let mut log = Vec::new();
        worker.run(&mut log).await;
        assert_eq!(log, vec![1]);
    }

    #[tokio::test]
    async fn tasks_run_in_fifo_order() {
        let (scheduler, mut worker) = Scheduler::<Vec<u32>>::new();
        for i in 0..5 {
            scheduler.post(move |log| log.push(i));
        }
        let mut log = Vec::new();
        worker.run(&mut log).await;
        assert_eq!(log, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn worker_waits_while_work_is_registered() {
        let (scheduler, mut worker) = Scheduler::<Vec<u32>>::new();
        let guard = scheduler.work();
        let remote = scheduler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            remote.post(|log| log.push(7));
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        let mut log = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), worker.run(&mut log))
            .await
            .expect("worker should stop once work is released");
        assert_eq!(log, vec![7]);
        assert_eq!(scheduler.work_count(), 0);
    }

    #[tokio::test]
    async fn tasks_can_post_follow_up_tasks() {
        let (scheduler, mut worker) = Scheduler::<Vec<u32>>::new();
        let again = scheduler.clone();
        scheduler.post(move |log| {
            log.push(1);
            again.post(|log| log.push(2));
        });
        let mut log = Vec::new();
        worker.run(&mut log).await;
        assert_eq!(log, vec![1, 2]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn posts_from_other_threads_are_delivered() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (scheduler, mut worker) = Scheduler::<Vec<u32>>::new();
        let guard = scheduler.work();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let scheduler = scheduler.clone();
                std::thread::spawn(move || scheduler.post(move |log| log.push(i)))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        drop(guard);
        let mut log = Vec::new();
        runtime.block_on(worker.run(&mut log));
        log.sort_unstable();
        assert_eq!(log, vec![0, 1, 2, 3]);
    }
}
