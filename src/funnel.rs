//! Capacity-bounded execution of asynchronous work.
//!
//! [`Funnel`] admits a task once enough free capacity exists, or immediately
//! when nothing else is running (a single task heavier than the whole
//! capacity may run alone). [`FunnelQueue`] additionally tracks submitted
//! tasks so they can be drained in submission order.

use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

#[derive(Debug)]
struct FunnelState {
    free_capacity: i64,
    running: usize,
}

#[derive(Debug)]
pub struct Funnel {
    capacity: usize,
    state: Mutex<FunnelState>,
    settled: Notify,
}

impl Funnel {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(FunnelState {
                free_capacity: capacity as i64,
                running: 0,
            }),
            settled: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Negative while an oversized task runs alone.
    pub fn free_capacity(&self) -> i64 {
        self.state().free_capacity
    }

    pub fn running(&self) -> usize {
        self.state().running
    }

    fn state(&self) -> MutexGuard<'_, FunnelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `task` once `load` units of capacity are free. `load` is clamped
    /// to at least one. Capacity is returned when the task settles, whether
    /// it succeeded, failed, panicked or was dropped.
    pub async fn run<F, T>(&self, load: usize, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _admission = self.admit(load.max(1)).await;
        task.await
    }

    async fn admit(&self, load: usize) -> Admission<'_> {
        let load = load as i64;
        loop {
            let mut settled = pin!(self.settled.notified());
            settled.as_mut().enable();
            {
                let mut state = self.state();
                if state.free_capacity >= load || state.running == 0 {
                    state.free_capacity -= load;
                    state.running += 1;
                    return Admission { funnel: self, load };
                }
            }
            settled.await;
        }
    }
}

struct Admission<'a> {
    funnel: &'a Funnel,
    load: i64,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.funnel.state();
            state.free_capacity += self.load;
            state.running -= 1;
        }
        self.funnel.settled.notify_waiters();
    }
}

struct Pending<T> {
    handle: JoinHandle<anyhow::Result<T>>,
    // Closed once the task settles; never sent on.
    settled: watch::Receiver<()>,
}

/// A [`Funnel`] that remembers what was submitted.
///
/// Tasks start as soon as they are enqueued (subject to capacity) on the
/// ambient tokio runtime; [`FunnelQueue::dequeue_all`] collects them.
pub struct FunnelQueue<T> {
    funnel: Arc<Funnel>,
    pending: Mutex<Vec<Pending<T>>>,
}

impl<T> FunnelQueue<T>
where
    T: Send + 'static,
{
    pub fn new(capacity: usize) -> Self {
        Self::with_funnel(Arc::new(Funnel::new(capacity)))
    }

    /// Share one funnel between several queues.
    pub fn with_funnel(funnel: Arc<Funnel>) -> Self {
        Self {
            funnel,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn funnel(&self) -> &Arc<Funnel> {
        &self.funnel
    }

    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    fn pending(&self) -> MutexGuard<'_, Vec<Pending<T>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue<F>(&self, load: usize, task: F)
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let mut pending = self.pending();
        let entry = self.spawn(load, Vec::new(), task);
        pending.push(entry);
    }

    /// Enqueue a task that starts only after every task enqueued before it
    /// has settled, successfully or not.
    pub fn enqueue_milestone<F>(&self, load: usize, task: F)
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let mut pending = self.pending();
        let barriers = pending.iter().map(|entry| entry.settled.clone()).collect();
        let entry = self.spawn(load, barriers, task);
        pending.push(entry);
    }

    fn spawn<F>(&self, load: usize, barriers: Vec<watch::Receiver<()>>, task: F) -> Pending<T>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (settled_tx, settled_rx) = watch::channel(());
        let funnel = Arc::clone(&self.funnel);
        let handle = tokio::spawn(async move {
            let _settled = settled_tx;
            for mut barrier in barriers {
                // Resolves with an error once the sender side is dropped.
                let _ = barrier.changed().await;
            }
            funnel.run(load, task).await
        });
        Pending {
            handle,
            settled: settled_rx,
        }
    }

    /// Wait for every pending task and return the results in submission
    /// order. All tasks run to completion; if any failed, the first failure
    /// in submission order is returned instead.
    pub async fn dequeue_all(&self) -> anyhow::Result<Vec<T>> {
        let pending = std::mem::take(&mut *self.pending());
        let mut results = Vec::with_capacity(pending.len());
        let mut first_error = None;
        for entry in pending {
            match entry.handle.await {
                Ok(Ok(value)) => results.push(value),
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(join_error) => {
                    first_error.get_or_insert(anyhow!("funnel task aborted: {join_error}"));
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }
}

/// Process `items` with at most `limit` workers in flight and return the
/// results in item order.
pub async fn limiter<I, W, Fut, R>(limit: usize, items: I, worker: W) -> anyhow::Result<Vec<R>>
where
    I: IntoIterator,
    W: Fn(I::Item) -> Fut,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: Send + 'static,
{
    let queue = FunnelQueue::new(limit);
    for item in items {
        queue.enqueue(1, worker(item));
    }
    queue.dequeue_all().await
}
