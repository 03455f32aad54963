//! Bounded-concurrency, order-preserving pipeline stage.
//!
//! ```text
//!  submit ──► [permit] ──► seq n ──► spawn ──► WorkerPool ─┐
//!                                                         │ (any order)
//!                                                         ▼
//!          on_result ◄── cursor ◄── ReorderBuffer ◄── completions
//!              │
//!              └─► permit released
//! ```
//!
//! A permit is taken per item on submit and released only after the item has
//! been emitted (or discarded), so `max_concurrency` bounds everything that is
//! submitted but not yet emitted.

use std::sync::{
    Arc, Mutex, OnceLock,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use futures::future::BoxFuture;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, mpsc},
    task::JoinHandle,
};

use crate::{
    error::PipelineError,
    pool::{WorkerPool, lock},
    reorder::ReorderBuffer,
    worker::Processor,
};

pub type EmitFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Result callback, called once per sequence number, in sequence order, by a
/// single emission task. An `Err` returned from the callback becomes the
/// stage's sticky error.
pub type OnResult<O> = Box<dyn FnMut(u64, Result<O, PipelineError>) -> EmitFuture + Send>;

struct Completion<O> {
    seq: u64,
    result: Result<O, PipelineError>,
    permit: OwnedSemaphorePermit,
}

pub struct PipelineStage<P: Processor> {
    name: String,
    pool: Arc<WorkerPool<P>>,
    max_concurrency: usize,
    permits: Arc<Semaphore>,
    next_seq: AtomicU64,
    completions: Mutex<Option<mpsc::UnboundedSender<Completion<P::Output>>>>,
    emitter: Mutex<Option<JoinHandle<()>>>,
    sticky: Arc<OnceLock<PipelineError>>,
    closed: AtomicBool,
}

impl<P: Processor> PipelineStage<P> {
    /// Creates the stage and starts its emission task. Must be called from
    /// within a tokio runtime.
    pub fn new(
        name: &str,
        pool: Arc<WorkerPool<P>>,
        max_concurrency: usize,
        on_result: OnResult<P::Output>,
    ) -> anyhow::Result<Self> {
        if max_concurrency == 0 {
            anyhow::bail!("stage {}: max concurrency must be at least 1", name);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let sticky = Arc::new(OnceLock::new());
        let emitter = tokio::spawn(Self::emit_loop(
            name.to_string(),
            rx,
            on_result,
            Arc::clone(&sticky),
        ));

        Ok(Self {
            name: name.to_string(),
            pool,
            max_concurrency,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            next_seq: AtomicU64::new(0),
            completions: Mutex::new(Some(tx)),
            emitter: Mutex::new(Some(emitter)),
            sticky,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Items submitted and not yet emitted.
    pub fn outstanding(&self) -> usize {
        if self.closed.load(Ordering::Acquire) && self.permits.is_closed() {
            return 0;
        }
        self.max_concurrency - self.permits.available_permits()
    }

    /// Number of sequence numbers handed out so far.
    pub fn submitted(&self) -> u64 {
        self.next_seq.load(Ordering::Acquire)
    }

    /// The sticky error, once any item or emission has failed.
    pub fn error(&self) -> Option<PipelineError> {
        self.sticky.get().cloned()
    }

    /// Admits `input`, suspending while `max_concurrency` items are
    /// outstanding, and dispatches it to the pool. Returns the sequence
    /// number assigned to it.
    pub async fn submit(&self, input: P::Input) -> Result<u64, PipelineError> {
        self.check_open()?;
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::StageClosed(self.name.clone()))?;
        self.check_open()?;

        // Take the channel before the sequence number so a number is never
        // handed out without a completion to follow it.
        let completions = lock(&self.completions)
            .clone()
            .ok_or_else(|| PipelineError::StageClosed(self.name.clone()))?;
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        log::trace!("stage {}: admitted sequence {}", self.name, seq);

        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            let result = pool.submit(input).await;
            let _ = completions.send(Completion {
                seq,
                result,
                permit,
            });
        });
        Ok(seq)
    }

    fn check_open(&self) -> Result<(), PipelineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::StageClosed(self.name.clone()));
        }
        if let Some(err) = self.sticky.get() {
            return Err(err.clone());
        }
        Ok(())
    }

    /// Stops admitting items, waits until every outstanding item has been
    /// emitted, and stops the emission task. Returns the sticky error if
    /// there is one. Calling it again only reports the same outcome.
    pub async fn close(&self) -> Result<(), PipelineError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("stage {} already closed", self.name);
            return self.outcome();
        }

        if let Ok(permits) = self
            .permits
            .acquire_many(self.max_concurrency as u32)
            .await
        {
            permits.forget();
        }
        self.permits.close();

        lock(&self.completions).take();
        let emitter = lock(&self.emitter).take();
        if let Some(emitter) = emitter {
            if let Err(e) = emitter.await {
                log::error!("stage {}: emission task failed: {}", self.name, e);
                let _ = self.sticky.set(PipelineError::Emit {
                    stage: self.name.clone(),
                    seq: self.submitted(),
                    message: e.to_string(),
                });
            }
        }

        log::info!(
            "stage {} closed after {} items",
            self.name,
            self.submitted()
        );
        self.outcome()
    }

    fn outcome(&self) -> Result<(), PipelineError> {
        match self.sticky.get() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn emit_loop(
        name: String,
        mut rx: mpsc::UnboundedReceiver<Completion<P::Output>>,
        mut on_result: OnResult<P::Output>,
        sticky: Arc<OnceLock<PipelineError>>,
    ) {
        let mut buffer = ReorderBuffer::new();
        while let Some(completion) = rx.recv().await {
            let Completion {
                seq,
                result,
                permit,
            } = completion;
            if let Err(e) = buffer.insert(seq, (result, permit)) {
                log::error!("stage {}: {}", name, e);
                let _ = sticky.set(e);
                continue;
            }
            while let Some((seq, (result, permit))) = buffer.pop_ready() {
                Self::emit(&name, &sticky, &mut on_result, seq, result).await;
                drop(permit);
            }
        }
        if !buffer.is_empty() {
            log::warn!(
                "stage {}: {} results stranded behind sequence {}",
                name,
                buffer.len(),
                buffer.next_seq()
            );
        }
        log::debug!("stage {}: emission task finished", name);
    }

    async fn emit(
        name: &str,
        sticky: &OnceLock<PipelineError>,
        on_result: &mut OnResult<P::Output>,
        seq: u64,
        result: Result<P::Output, PipelineError>,
    ) {
        if let Some(err) = sticky.get() {
            log::warn!(
                "stage {}: discarding sequence {} after earlier failure: {}",
                name,
                seq,
                err
            );
            return;
        }

        match result {
            Ok(output) => {
                log::trace!("stage {}: emitting sequence {}", name, seq);
                if let Err(e) = on_result(seq, Ok(output)).await {
                    let err = PipelineError::Emit {
                        stage: name.to_string(),
                        seq,
                        message: format!("{:#}", e),
                    };
                    log::error!("{}", err);
                    let _ = sticky.set(err);
                }
            }
            Err(err) => {
                log::error!("stage {}: sequence {} failed: {}", name, seq, err);
                let _ = sticky.set(err.clone());
                if let Err(e) = on_result(seq, Err(err)).await {
                    log::warn!(
                        "stage {}: result callback for failed sequence {} errored: {:#}",
                        name,
                        seq,
                        e
                    );
                }
            }
        }
    }
}

impl<P: Processor> Drop for PipelineStage<P> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            log::warn!("stage {} dropped without close", self.name);
        }
    }
}

#[cfg(test)]
#[path = "stage_test.rs"]
mod stage_test;
