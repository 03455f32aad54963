use std::{
    any::Any,
    fmt::Display,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::mpsc,
    thread::JoinHandle,
};

use tokio::sync::oneshot;

use crate::error::PipelineError;

/// A CPU-bound transform run inside a worker execution context.
///
/// Every worker owns its own processor instance; nothing is shared with the
/// orchestrator or with other workers. Inputs and outputs are moved across
/// the mailbox, never borrowed.
pub trait Processor: Send + 'static {
    /// Request type. `Display` is used to tag failures with the request that
    /// caused them, so keep it short (no payload dumps).
    type Input: Display + Send + 'static;
    type Output: Send + 'static;

    fn process(&mut self, input: Self::Input) -> anyhow::Result<Self::Output>;
}

type Reply<P> = Result<<P as Processor>::Output, String>;

struct Envelope<P: Processor> {
    input: P::Input,
    reply: oneshot::Sender<Reply<P>>,
}

/// A request that has been posted to a worker mailbox and is waiting for its
/// reply.
pub struct Dispatched<P: Processor> {
    worker: usize,
    request: String,
    reply: oneshot::Receiver<Reply<P>>,
}

impl<P: Processor> Dispatched<P> {
    pub async fn response(self) -> Result<P::Output, PipelineError> {
        match self.reply.await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(message)) => Err(PipelineError::Computation {
                worker: self.worker,
                request: self.request,
                message,
            }),
            Err(_) => Err(PipelineError::Transport {
                worker: self.worker,
                request: self.request,
                reason: "worker exited before replying".to_string(),
            }),
        }
    }
}

/// One isolated execution context: a dedicated OS thread draining its own
/// mailbox, one request at a time.
pub struct WorkerHandle<P: Processor> {
    id: usize,
    mailbox: mpsc::Sender<Envelope<P>>,
    thread: JoinHandle<()>,
}

impl<P: Processor> WorkerHandle<P> {
    pub fn spawn(id: usize, processor: P) -> anyhow::Result<Self> {
        let (mailbox, rx) = mpsc::channel::<Envelope<P>>();
        let thread = std::thread::Builder::new()
            .name(format!("gif-worker-{}", id))
            .spawn(move || Self::worker_loop(id, processor, rx))?;
        Ok(Self {
            id,
            mailbox,
            thread,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Posts `input` to the mailbox. Never blocks; the returned handle
    /// resolves once the worker replies.
    pub fn dispatch(&self, input: P::Input) -> Result<Dispatched<P>, PipelineError> {
        let request = input.to_string();
        let (reply, rx) = oneshot::channel();
        if self.mailbox.send(Envelope { input, reply }).is_err() {
            return Err(PipelineError::Transport {
                worker: self.id,
                request,
                reason: "worker mailbox is closed".to_string(),
            });
        }
        Ok(Dispatched {
            worker: self.id,
            request,
            reply: rx,
        })
    }

    /// Closes the mailbox and joins the thread. Consumes the handle, so a
    /// worker can only be terminated once.
    pub fn terminate(self) -> anyhow::Result<()> {
        let id = self.id;
        drop(self.mailbox);
        self.thread
            .join()
            .map_err(|panic| anyhow::anyhow!("worker {} panicked: {}", id, panic_message(panic.as_ref())))
    }

    fn worker_loop(id: usize, mut processor: P, rx: mpsc::Receiver<Envelope<P>>) {
        log::debug!("worker {} started", id);
        while let Ok(Envelope { input, reply }) = rx.recv() {
            let result = match catch_unwind(AssertUnwindSafe(|| processor.process(input))) {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
            };
            if reply.send(result).is_err() {
                log::warn!("worker {}: requester went away before the reply", id);
            }
        }
        log::debug!("worker {} mailbox closed, exiting", id);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
