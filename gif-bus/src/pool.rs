use std::{
    collections::VecDeque,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::{
    error::PipelineError,
    worker::{Processor, WorkerHandle},
};

/// A fixed set of worker handles shared by any number of callers.
///
/// Requests wait for a free handle in FIFO order (the permit semaphore is
/// fair). Handles are fungible and always go back to the free list when a
/// request finishes, whatever its outcome.
pub struct WorkerPool<P: Processor> {
    size: usize,
    handles: Mutex<Option<Vec<WorkerHandle<P>>>>,
    free: Mutex<VecDeque<usize>>,
    permits: Semaphore,
    closed: AtomicBool,
}

impl<P: Processor> WorkerPool<P> {
    /// Spawns `size` workers, each with its own processor from `factory`.
    pub fn new<F>(size: usize, mut factory: F) -> anyhow::Result<Self>
    where
        F: FnMut(usize) -> P,
    {
        if size == 0 {
            anyhow::bail!("worker pool size must be at least 1");
        }
        let handles = (0..size)
            .map(|id| WorkerHandle::spawn(id, factory(id)))
            .collect::<anyhow::Result<Vec<_>>>()?;
        log::info!("worker pool started with {} workers", size);

        Ok(Self {
            size,
            handles: Mutex::new(Some(handles)),
            free: Mutex::new((0..size).collect()),
            permits: Semaphore::new(size),
            closed: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of handles currently checked out.
    pub fn in_flight(&self) -> usize {
        self.size - lock(&self.free).len()
    }

    /// Runs `input` on the next free worker and returns its response.
    ///
    /// Suspends while every handle is busy. A failure is reported only to
    /// this caller; the handle is released either way.
    pub async fn submit(&self, input: P::Input) -> Result<P::Output, PipelineError> {
        if self.is_closed() {
            return Err(PipelineError::PoolClosed);
        }
        let checkout = self.checkout().await?;
        let dispatched = {
            let handles = lock(&self.handles);
            match handles.as_ref() {
                Some(handles) => handles[checkout.index].dispatch(input),
                None => Err(PipelineError::PoolClosed),
            }
        }?;
        log::trace!("dispatched request to worker {}", checkout.index);
        dispatched.response().await
    }

    async fn checkout(&self) -> Result<Checkout<'_>, PipelineError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PipelineError::PoolClosed)?;
        // Permits and free entries move together, so a permit always finds
        // an index.
        let index = lock(&self.free)
            .pop_front()
            .ok_or(PipelineError::PoolClosed)?;
        Ok(Checkout {
            index,
            free: &self.free,
            _permit: permit,
        })
    }

    /// Stops accepting requests, waits for in-flight and queued requests to
    /// drain, then terminates every worker once. Later calls are no-ops.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            log::warn!("worker pool already shut down");
            return Ok(());
        }

        // Queues behind every waiter already admitted, so this resolves only
        // once the pool is idle.
        if let Ok(permits) = self.permits.acquire_many(self.size as u32).await {
            permits.forget();
        }
        self.permits.close();

        let Some(handles) = lock(&self.handles).take() else {
            return Ok(());
        };
        let results = tokio::task::spawn_blocking(move || {
            handles
                .into_iter()
                .map(|handle| handle.terminate())
                .collect::<Vec<_>>()
        })
        .await?;

        let terminated = results.len();
        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                log::error!("worker termination error: {:#}", e);
                first_error.get_or_insert(e);
            }
        }
        log::info!("worker pool shut down, {} workers terminated", terminated);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<P: Processor> Drop for WorkerPool<P> {
    fn drop(&mut self) {
        if lock(&self.handles).take().is_some() {
            // Dropping the handles closes the mailboxes; the threads exit on
            // their own once their current request is done.
            log::warn!("worker pool dropped without shutdown");
        }
    }
}

/// A handle checked out of the pool. Returns the handle to the free list on
/// drop, before the permit is released.
struct Checkout<'a> {
    index: usize,
    free: &'a Mutex<VecDeque<usize>>,
    _permit: SemaphorePermit<'a>,
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        lock(self.free).push_back(self.index);
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;
