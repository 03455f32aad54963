use std::{
    fmt::{Display, Formatter},
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use rand::Rng;

use super::{OnResult, PipelineStage};
use crate::{error::PipelineError, pool::WorkerPool, worker::Processor};

#[derive(Debug)]
struct Task {
    id: u64,
    delay: Duration,
    fail: bool,
}

impl Task {
    fn ok(id: u64, delay_ms: u64) -> Self {
        Self {
            id,
            delay: Duration::from_millis(delay_ms),
            fail: false,
        }
    }

    fn failing(id: u64, delay_ms: u64) -> Self {
        Self {
            fail: true,
            ..Self::ok(id, delay_ms)
        }
    }
}

impl Display for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "task #{}", self.id)
    }
}

struct SleepProcessor {
    completed: Arc<Mutex<Vec<u64>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl Processor for SleepProcessor {
    type Input = Task;
    type Output = u64;

    fn process(&mut self, task: Task) -> anyhow::Result<u64> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        std::thread::sleep(task.delay);
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.completed.lock().unwrap().push(task.id);
        if task.fail {
            anyhow::bail!("task {} failed", task.id);
        }
        Ok(task.id)
    }
}

/// Finishes tasks in a fixed order, whatever order they start in.
struct GatedProcessor {
    order: Arc<Vec<u64>>,
    turn: Arc<(Mutex<usize>, Condvar)>,
    completed: Arc<Mutex<Vec<u64>>>,
}

impl Processor for GatedProcessor {
    type Input = Task;
    type Output = u64;

    fn process(&mut self, task: Task) -> anyhow::Result<u64> {
        let order = &self.order;
        let (lock, cvar) = &*self.turn;
        let mut turn = cvar
            .wait_while(lock.lock().unwrap(), |turn| order.get(*turn) != Some(&task.id))
            .unwrap();
        self.completed.lock().unwrap().push(task.id);
        *turn += 1;
        cvar.notify_all();
        Ok(task.id)
    }
}

#[derive(Clone, Default)]
struct Harness {
    completed: Arc<Mutex<Vec<u64>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    emitted: Arc<Mutex<Vec<(u64, Result<u64, PipelineError>)>>>,
}

impl Harness {
    fn pool(&self, size: usize) -> Arc<WorkerPool<SleepProcessor>> {
        Arc::new(
            WorkerPool::new(size, |_| SleepProcessor {
                completed: self.completed.clone(),
                active: self.active.clone(),
                max_active: self.max_active.clone(),
            })
            .unwrap(),
        )
    }

    fn recorder(&self) -> OnResult<u64> {
        let emitted = self.emitted.clone();
        Box::new(move |seq, result| {
            let emitted = emitted.clone();
            Box::pin(async move {
                emitted.lock().unwrap().push((seq, result));
                Ok(())
            })
        })
    }

    fn emitted_ok(&self) -> Vec<u64> {
        self.emitted
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok().copied())
            .collect()
    }

    fn emitted_seqs(&self) -> Vec<u64> {
        self.emitted.lock().unwrap().iter().map(|(s, _)| *s).collect()
    }
}

#[tokio::test]
async fn test_zero_concurrency_is_rejected() {
    let harness = Harness::default();
    let pool = harness.pool(1);
    assert!(PipelineStage::new("quantize", pool.clone(), 0, harness.recorder()).is_err());
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_out_of_order_completion_emits_in_submission_order() -> anyhow::Result<()> {
    let harness = Harness::default();
    let pool = harness.pool(2);
    let stage = PipelineStage::new("quantize", pool.clone(), 5, harness.recorder())?;

    // Two workers: item 2 and 3 finish while item 1 is still running.
    for (id, delay) in [(1, 120), (2, 10), (3, 10), (4, 40), (5, 5)] {
        stage.submit(Task::ok(id, delay)).await?;
    }
    stage.close().await?;
    pool.shutdown().await?;

    let completed = harness.completed.lock().unwrap().clone();
    assert_eq!(completed[0], 2);
    assert_ne!(completed, vec![1, 2, 3, 4, 5]);
    assert_eq!(harness.emitted_ok(), vec![1, 2, 3, 4, 5]);
    assert_eq!(harness.emitted_seqs(), vec![0, 1, 2, 3, 4]);
    Ok(())
}

#[tokio::test]
async fn test_completion_order_3_1_5_2_4_is_emitted_as_1_to_5() -> anyhow::Result<()> {
    let harness = Harness::default();
    let turn = Arc::new((Mutex::new(0), Condvar::new()));
    let order = Arc::new(vec![3, 1, 5, 2, 4]);
    // One worker per task, so every task is running before any finishes.
    let pool = Arc::new(WorkerPool::new(5, |_| GatedProcessor {
        order: order.clone(),
        turn: turn.clone(),
        completed: harness.completed.clone(),
    })?);
    let stage = PipelineStage::new("quantize", pool.clone(), 5, harness.recorder())?;

    for id in 1..=5 {
        stage.submit(Task::ok(id, 0)).await?;
    }
    stage.close().await?;
    pool.shutdown().await?;

    assert_eq!(*harness.completed.lock().unwrap(), vec![3, 1, 5, 2, 4]);
    assert_eq!(harness.emitted_ok(), vec![1, 2, 3, 4, 5]);
    assert_eq!(harness.emitted_seqs(), vec![0, 1, 2, 3, 4]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_randomized_latency_preserves_order() -> anyhow::Result<()> {
    let harness = Harness::default();
    let pool = harness.pool(4);
    let stage = PipelineStage::new("encode", pool.clone(), 8, harness.recorder())?;

    let delays: Vec<u64> = {
        let mut rng = rand::thread_rng();
        (0..40).map(|_| rng.gen_range(0..15)).collect()
    };
    for (id, delay) in delays.into_iter().enumerate() {
        stage.submit(Task::ok(id as u64, delay)).await?;
    }
    stage.close().await?;
    pool.shutdown().await?;

    let expected: Vec<u64> = (0..40).collect();
    assert_eq!(harness.emitted_ok(), expected);
    assert_eq!(harness.emitted_seqs(), expected);
    Ok(())
}

#[tokio::test]
async fn test_outstanding_items_never_exceed_max_concurrency() -> anyhow::Result<()> {
    let harness = Harness::default();
    let pool = harness.pool(4);
    let stage = PipelineStage::new("quantize", pool.clone(), 3, harness.recorder())?;

    let mut max_outstanding = 0;
    for id in 0..20 {
        stage.submit(Task::ok(id, 5)).await?;
        let emitted = harness.emitted.lock().unwrap().len() as u64;
        let outstanding = stage.submitted() - emitted;
        max_outstanding = max_outstanding.max(outstanding);
        assert!(stage.outstanding() <= 3);
    }
    stage.close().await?;
    pool.shutdown().await?;

    assert!(max_outstanding <= 3, "saw {} outstanding", max_outstanding);
    assert!(harness.max_active.load(Ordering::SeqCst) <= 3);
    assert_eq!(harness.emitted_ok().len(), 20);
    Ok(())
}

#[tokio::test]
async fn test_submit_suspends_until_emission_frees_capacity() -> anyhow::Result<()> {
    let harness = Harness::default();
    let pool = harness.pool(2);
    let stage = PipelineStage::new("quantize", pool.clone(), 1, harness.recorder())?;

    stage.submit(Task::ok(0, 80)).await?;
    let blocked = tokio::time::timeout(Duration::from_millis(20), stage.submit(Task::ok(1, 0))).await;
    assert!(blocked.is_err(), "second submit should wait for capacity");

    stage.submit(Task::ok(2, 0)).await?;
    stage.close().await?;
    pool.shutdown().await?;

    // The timed-out submit never got a sequence number.
    assert_eq!(harness.emitted_ok(), vec![0, 2]);
    assert_eq!(harness.emitted_seqs(), vec![0, 1]);
    Ok(())
}

#[tokio::test]
async fn test_failure_discards_later_results_and_is_sticky() -> anyhow::Result<()> {
    let harness = Harness::default();
    let pool = harness.pool(3);
    let stage = PipelineStage::new("encode", pool.clone(), 8, harness.recorder())?;

    for id in 0..6 {
        let task = if id == 3 {
            Task::failing(id, 60)
        } else {
            Task::ok(id, 1)
        };
        stage.submit(task).await?;
    }

    let err = stage.close().await.unwrap_err();
    pool.shutdown().await?;

    match &err {
        PipelineError::Computation { request, .. } => assert_eq!(request, "task #3"),
        other => panic!("expected computation failure, got {:?}", other),
    }
    // Later items finished on the workers but were never delivered.
    assert_eq!(harness.completed.lock().unwrap().len(), 6);
    assert_eq!(harness.emitted_seqs(), vec![0, 1, 2, 3]);
    assert_eq!(harness.emitted_ok(), vec![0, 1, 2]);
    assert!(harness.emitted.lock().unwrap()[3].1.is_err());
    assert_eq!(stage.error(), Some(err));
    Ok(())
}

#[tokio::test]
async fn test_submit_after_failure_returns_sticky_error() -> anyhow::Result<()> {
    let harness = Harness::default();
    let pool = harness.pool(1);
    let stage = PipelineStage::new("quantize", pool.clone(), 2, harness.recorder())?;

    stage.submit(Task::failing(0, 0)).await?;
    while stage.error().is_none() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let err = stage.submit(Task::ok(1, 0)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Computation { .. }));

    assert!(stage.close().await.is_err());
    pool.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_callback_error_becomes_sticky() -> anyhow::Result<()> {
    let harness = Harness::default();
    let pool = harness.pool(2);
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let on_result: OnResult<u64> = {
        let delivered = delivered.clone();
        Box::new(move |seq, _result| {
            let delivered = delivered.clone();
            Box::pin(async move {
                delivered.lock().unwrap().push(seq);
                if seq == 1 {
                    anyhow::bail!("sink is full");
                }
                Ok(())
            })
        })
    };
    let stage = PipelineStage::new("encode", pool.clone(), 4, on_result)?;
    for id in 0..4 {
        stage.submit(Task::ok(id, 2)).await?;
    }

    let err = stage.close().await.unwrap_err();
    pool.shutdown().await?;

    assert_eq!(*delivered.lock().unwrap(), vec![0, 1]);
    match err {
        PipelineError::Emit { stage, seq, message } => {
            assert_eq!(stage, "encode");
            assert_eq!(seq, 1);
            assert!(message.contains("sink is full"));
        }
        other => panic!("expected emit failure, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_close_drains_everything_and_is_idempotent() -> anyhow::Result<()> {
    let harness = Harness::default();
    let pool = harness.pool(2);
    let stage = PipelineStage::new("quantize", pool.clone(), 4, harness.recorder())?;

    for id in 0..4 {
        stage.submit(Task::ok(id, 20)).await?;
    }
    stage.close().await?;
    assert_eq!(harness.emitted_ok(), vec![0, 1, 2, 3]);
    assert_eq!(stage.outstanding(), 0);

    stage.close().await?;
    assert_eq!(harness.emitted_ok().len(), 4);

    let err = stage.submit(Task::ok(9, 0)).await.unwrap_err();
    assert_eq!(err, PipelineError::StageClosed("quantize".to_string()));
    pool.shutdown().await?;
    Ok(())
}
