use std::{
    future::Future,
    sync::{Arc, PoisonError},
    time::Duration,
};

use gif_bus::{
    GifProcessor, OnResult, PipelineError, PipelineStage, WorkerPool,
    message::{ProcessorInput, ProcessorOutput, QuantizeRequest, QuantizedImage},
    processor::{self, TRAILER},
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

use crate::{
    config::EncoderConfig,
    error::EncoderError,
    media::{
        optimize::{Canvas, OptimizeOptions, quantized_frames_match},
        similarity::{Similarity, is_transparent},
        types::{EncoderState, Frame, FrameWritten, centiseconds, from_centiseconds},
    },
};

type Stage = PipelineStage<GifProcessor>;

pub type ProgressCallback = Arc<dyn Fn(FrameWritten) + Send + Sync>;

/// Running (frames written, duration written) pair shared by the caller side
/// and the encode stage emission.
struct Progress {
    written: std::sync::Mutex<FrameWritten>,
    callback: ProgressCallback,
}

impl Progress {
    fn record(&self, duration: Duration) {
        let written = {
            let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
            written.frames_written += 1;
            written.written_duration += duration;
            *written
        };
        // Called unlocked: the callback may read `FrameEncoder::progress`.
        (self.callback)(written);
    }

    fn snapshot(&self) -> FrameWritten {
        *self.written.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A frame held back until the frame after it is known.
struct Buffered {
    index: u64,
    pixels: Vec<u8>,
    duration: Duration,
}

struct Inner {
    state: EncoderState,
    canvas: Option<Canvas>,
    /// Frame whose successor has been accepted; forwarded once that
    /// successor is final.
    settled: Option<Buffered>,
    /// Latest frame, still open to merges.
    buffered: Option<Buffered>,
    next_index: u64,
    /// Failures raised on the caller side (backpressure timeouts).
    sticky: Option<PipelineError>,
    outcome: Option<Result<(), EncoderError>>,
}

/// Animated GIF encoder running quantization and block encoding on a worker
/// pool.
///
/// ```text
/// write_frame ─► merge check ─► Canvas::plan ─► quantize stage ─┐
///                                                               │ in order
///                                 sink ◄─ encode stage ◄── quantized merge
/// ```
///
/// Frames are planned one frame late so the disposal of each frame can take
/// the following frame into account.
pub struct FrameEncoder<W: AsyncWrite + Unpin + Send + 'static> {
    config: EncoderConfig,
    similarity: Similarity,
    pool: Arc<WorkerPool<GifProcessor>>,
    quantize: Stage,
    encode: Arc<Stage>,
    pending: Arc<Mutex<Option<QuantizedImage>>>,
    sink: Arc<Mutex<W>>,
    progress: Arc<Progress>,
    inner: Mutex<Inner>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> FrameEncoder<W> {
    /// Starts the worker pool and both stages. Must be called from within a
    /// tokio runtime.
    pub fn new<F>(sink: W, config: EncoderConfig, on_progress: F) -> Result<Self, EncoderError>
    where
        F: Fn(FrameWritten) + Send + Sync + 'static,
    {
        config.validate()?;
        let setup = |e: anyhow::Error| EncoderError::Setup(format!("{:#}", e));

        let pool = Arc::new(WorkerPool::new(config.pool_size, GifProcessor::new).map_err(setup)?);
        let sink = Arc::new(Mutex::new(sink));
        let progress = Arc::new(Progress {
            written: std::sync::Mutex::new(FrameWritten::default()),
            callback: Arc::new(on_progress),
        });
        let pending = Arc::new(Mutex::new(None));

        let encode = Arc::new(
            Stage::new(
                "encode",
                Arc::clone(&pool),
                config.max_concurrency,
                write_to_sink(Arc::clone(&sink), Arc::clone(&progress)),
            )
            .map_err(setup)?,
        );
        let merge = config
            .quantized_transparency_tolerance
            .map(|tolerance| Similarity::new(config.color_distance, tolerance));
        let quantize = Stage::new(
            "quantize",
            Arc::clone(&pool),
            config.max_concurrency,
            forward_quantized(
                Arc::clone(&encode),
                Arc::clone(&pending),
                merge,
                Arc::clone(&progress),
                config.backpressure_timeout(),
            ),
        )
        .map_err(setup)?;

        log::info!(
            "frame encoder created: {} workers, {} frames in flight per stage, {} colors",
            config.pool_size,
            config.max_concurrency,
            config.max_colors
        );
        Ok(Self {
            similarity: Similarity::new(config.color_distance, config.transparency_tolerance),
            config,
            pool,
            quantize,
            encode,
            pending,
            sink,
            progress,
            inner: Mutex::new(Inner {
                state: EncoderState::Idle,
                canvas: None,
                settled: None,
                buffered: None,
                next_index: 0,
                sticky: None,
                outcome: None,
            }),
        })
    }

    pub async fn state(&self) -> EncoderState {
        self.inner.lock().await.state
    }

    pub fn progress(&self) -> FrameWritten {
        self.progress.snapshot()
    }

    /// Adds a frame. The first frame fixes the canvas size and writes the
    /// stream header. May suspend while the pipeline is at capacity.
    pub async fn write_frame(&self, frame: Frame) -> Result<(), EncoderError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            EncoderState::Closing | EncoderState::Closed => return Err(EncoderError::Closed),
            EncoderState::Idle | EncoderState::Open => {}
        }
        if let Some(err) = self.sticky_error(&inner) {
            return Err(EncoderError::Frame(err));
        }

        if frame.width == 0 || frame.height == 0 {
            return Err(EncoderError::InvalidFrame(format!(
                "empty frame {}x{}",
                frame.width, frame.height
            )));
        }
        if frame.pixels.len() != frame.expected_len() {
            return Err(EncoderError::InvalidFrame(format!(
                "{} bytes of pixels for a {}x{} frame, expected {}",
                frame.pixels.len(),
                frame.width,
                frame.height,
                frame.expected_len()
            )));
        }
        let canvas = inner.canvas.as_ref().map(|c| (c.width(), c.height()));
        match canvas {
            Some((width, height)) if (width, height) != (frame.width, frame.height) => {
                return Err(EncoderError::InvalidFrame(format!(
                    "frame is {}x{} but the canvas is {}x{}",
                    frame.width, frame.height, width, height
                )));
            }
            Some(_) => {}
            None => self.open(&mut inner, frame.width, frame.height).await?,
        }

        let mut pixels = frame.pixels;
        if let Some(fill) = self.config.alpha_fill {
            fill_transparent(&mut pixels, fill);
        }
        let index = inner.next_index;
        inner.next_index += 1;
        self.accept(
            &mut inner,
            Buffered {
                index,
                pixels,
                duration: frame.duration,
            },
        )
        .await
    }

    async fn open(&self, inner: &mut Inner, width: u16, height: u16) -> Result<(), EncoderError> {
        let header = processor::stream_header(
            width,
            height,
            self.config.loop_count,
            self.config.comment.as_deref(),
        )
        .map_err(|e| EncoderError::Setup(format!("{:#}", e)))?;
        self.sink.lock().await.write_all(&header).await?;

        inner.canvas = Some(Canvas::new(
            width,
            height,
            OptimizeOptions {
                similarity: self.similarity,
                optimize_transparency: self.config.optimize_transparency,
                crop_transparent: self.config.crop_transparent,
            },
        ));
        inner.state = EncoderState::Open;
        log::info!("frame encoder opened with a {}x{} canvas", width, height);
        Ok(())
    }

    async fn accept(&self, inner: &mut Inner, frame: Buffered) -> Result<(), EncoderError> {
        let Some(mut last) = inner.buffered.take() else {
            inner.buffered = Some(frame);
            return Ok(());
        };

        if self.similarity.frames_match(&last.pixels, &frame.pixels) {
            log::debug!("frame {} merged into frame {}", frame.index, last.index);
            last.duration += frame.duration;
            inner.buffered = Some(last);
            self.progress.record(Duration::ZERO);
            return Ok(());
        }

        if last.duration < self.config.minimum_frame_duration() {
            log::debug!(
                "frame {} shorter than {:?}, replaced by frame {}",
                last.index,
                self.config.minimum_frame_duration(),
                frame.index
            );
            inner.buffered = Some(Buffered {
                duration: last.duration + frame.duration,
                ..frame
            });
            self.progress.record(Duration::ZERO);
            return Ok(());
        }

        // `last` can no longer change, so the frame before it now knows what
        // follows it.
        let settled = inner.settled.replace(last);
        inner.buffered = Some(frame);
        if let Some(previous) = settled {
            let next = inner.settled.as_ref().map(|f| f.pixels.as_slice());
            let request = self.plan(inner.canvas.as_mut(), &previous, next)?;
            self.submit(inner, request).await?;
        }
        Ok(())
    }

    fn plan(
        &self,
        canvas: Option<&mut Canvas>,
        frame: &Buffered,
        next: Option<&[u8]>,
    ) -> Result<QuantizeRequest, EncoderError> {
        let canvas = canvas.ok_or(EncoderError::Closed)?;
        let planned = canvas.plan(&frame.pixels, next);
        log::debug!(
            "frame {}: {} with {:?} disposal",
            frame.index,
            planned.rect,
            planned.disposal
        );
        Ok(QuantizeRequest {
            rect: planned.rect,
            rgba: planned.rgba,
            max_colors: self.config.max_colors,
            quality: self.config.quantizer_quality,
            delay: centiseconds(frame.duration),
            disposal: planned.disposal,
        })
    }

    async fn submit(&self, inner: &mut Inner, request: QuantizeRequest) -> Result<(), EncoderError> {
        let result = with_timeout(
            self.config.backpressure_timeout(),
            self.quantize.submit(ProcessorInput::Quantize(request)),
        )
        .await;
        result.map(|_| ()).map_err(|err| Self::timed_out(inner, err))
    }

    /// Backpressure timeouts raised on the caller side become the encoder's
    /// sticky error.
    fn timed_out(inner: &mut Inner, err: PipelineError) -> EncoderError {
        if matches!(err, PipelineError::BackpressureTimeout(_)) {
            log::error!("{}", err);
            inner.sticky.get_or_insert_with(|| err.clone());
        }
        EncoderError::Frame(err)
    }

    fn sticky_error(&self, inner: &Inner) -> Option<PipelineError> {
        // An encode failure also fails the quantize emission that fed it, so
        // the encode stage holds the root cause.
        inner
            .sticky
            .clone()
            .or_else(|| self.encode.error())
            .or_else(|| self.quantize.error())
    }

    /// Flushes the held frames, drains the quantize stage and then the encode
    /// stage, terminates the stream and stops the workers. A second call
    /// returns the outcome of the first without doing anything.
    pub async fn close(&self) -> Result<(), EncoderError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            EncoderState::Closed => {
                log::debug!("frame encoder already closed");
                return inner.outcome.clone().unwrap_or(Ok(()));
            }
            EncoderState::Idle => {
                inner.state = EncoderState::Closed;
                let outcome = self.shutdown().await;
                log::info!("frame encoder closed before any frame was written");
                inner.outcome = Some(outcome.clone());
                return outcome;
            }
            EncoderState::Open | EncoderState::Closing => {}
        }

        inner.state = EncoderState::Closing;
        let flushed = self.flush(&mut inner).await;
        let shutdown = self.shutdown().await;

        let outcome = match (flushed.and(shutdown), self.sticky_error(&inner)) {
            (Ok(()), None) => Ok(()),
            (Ok(()), Some(sticky)) => Err(EncoderError::Frame(sticky)),
            (Err(EncoderError::Frame(err)), Some(sticky)) if err == sticky => {
                Err(EncoderError::Frame(sticky))
            }
            (Err(primary), None) => Err(primary),
            (Err(primary), Some(sticky)) => Err(EncoderError::Close {
                primary: Box::new(primary),
                suppressed: sticky,
            }),
        };

        let progress = self.progress.snapshot();
        match &outcome {
            Ok(()) => log::info!(
                "frame encoder closed: {} frames, {:?}",
                progress.frames_written,
                progress.written_duration
            ),
            Err(e) => log::error!("frame encoder closed with error: {}", e),
        }
        inner.state = EncoderState::Closed;
        inner.outcome = Some(outcome.clone());
        outcome
    }

    /// Drains both stages, then terminates the stream. The trailer is only
    /// written when every frame reached the sink; the sink is flushed either
    /// way.
    async fn flush(&self, inner: &mut Inner) -> Result<(), EncoderError> {
        let drained = self.drain(inner).await;
        let complete = drained.is_ok() && self.sticky_error(inner).is_none();

        let mut sink = self.sink.lock().await;
        if complete {
            sink.write_all(&[TRAILER]).await?;
        } else {
            log::warn!("frame failure, stream left without a trailer");
        }
        sink.flush().await?;
        drained
    }

    async fn drain(&self, inner: &mut Inner) -> Result<(), EncoderError> {
        let submitted = match self.sticky_error(inner) {
            None => self.submit_held(inner).await,
            Some(_) => Ok(()),
        };

        // Everything the quantize stage emits is in the encode stage (or
        // pending) once it is closed.
        let quantized = self.quantize.close().await;
        let pending = self.pending.lock().await.take();
        let forwarded = match (&submitted, &quantized, pending) {
            (Ok(()), Ok(()), Some(image)) => {
                send_to_encoder(&self.encode, image, self.config.backpressure_timeout())
                    .await
                    .map_err(|err| Self::timed_out(inner, err))
            }
            _ => Ok(()),
        };
        let encoded = self.encode.close().await;

        if let Some(err) = self.sticky_error(inner) {
            return Err(EncoderError::Frame(err));
        }
        submitted?;
        forwarded?;
        encoded?;
        quantized?;
        Ok(())
    }

    async fn submit_held(&self, inner: &mut Inner) -> Result<(), EncoderError> {
        let settled = inner.settled.take();
        let buffered = inner.buffered.take();
        if let Some(frame) = settled {
            let next = buffered.as_ref().map(|f| f.pixels.as_slice());
            let request = self.plan(inner.canvas.as_mut(), &frame, next)?;
            self.submit(inner, request).await?;
        }
        if let Some(frame) = buffered {
            let request = self.plan(inner.canvas.as_mut(), &frame, None)?;
            self.submit(inner, request).await?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), EncoderError> {
        // Idle encoders still own running stages.
        let _ = self.quantize.close().await;
        let _ = self.encode.close().await;
        self.pool
            .shutdown()
            .await
            .map_err(|e| EncoderError::Setup(format!("worker shutdown failed: {:#}", e)))
    }

    /// Returns the sink once the encoder is closed.
    pub fn into_inner(self) -> Option<W> {
        let sink = Arc::try_unwrap(self.sink).ok()?;
        Some(sink.into_inner())
    }
}

fn fill_transparent(pixels: &mut [u8], rgb: u32) {
    let [_, r, g, b] = rgb.to_be_bytes();
    for px in pixels.chunks_exact_mut(4) {
        if is_transparent(px) {
            px.copy_from_slice(&[r, g, b, 255]);
        }
    }
}

async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(PipelineError::BackpressureTimeout(limit))),
        None => fut.await,
    }
}

async fn send_to_encoder(
    encode: &Stage,
    image: QuantizedImage,
    timeout: Option<Duration>,
) -> Result<(), PipelineError> {
    with_timeout(timeout, encode.submit(ProcessorInput::Encode(image)))
        .await
        .map(|_| ())
}

/// Quantize emission: optionally merges each quantized frame into the one
/// before it, and passes the rest on to the encode stage.
fn forward_quantized(
    encode: Arc<Stage>,
    pending: Arc<Mutex<Option<QuantizedImage>>>,
    merge: Option<Similarity>,
    progress: Arc<Progress>,
    timeout: Option<Duration>,
) -> OnResult<ProcessorOutput> {
    Box::new(move |seq, result| {
        let encode = Arc::clone(&encode);
        let pending = Arc::clone(&pending);
        let progress = Arc::clone(&progress);
        Box::pin(async move {
            let Ok(output) = result else {
                return Ok(());
            };
            let image = output.into_quantized()?;
            let Some(similarity) = merge else {
                send_to_encoder(&encode, image, timeout).await?;
                return Ok(());
            };

            let mut pending = pending.lock().await;
            if let Some(held) = pending.as_mut() {
                if quantized_frames_match(&similarity, held, &image) {
                    log::debug!("quantized frame {} merged into the previous frame", seq);
                    held.delay = held.delay.saturating_add(image.delay);
                    progress.record(Duration::ZERO);
                    return Ok(());
                }
            }
            if let Some(previous) = pending.replace(image) {
                send_to_encoder(&encode, previous, timeout).await?;
            }
            Ok(())
        })
    })
}

/// Encode emission: appends each block to the sink in frame order.
fn write_to_sink<W: AsyncWrite + Unpin + Send + 'static>(
    sink: Arc<Mutex<W>>,
    progress: Arc<Progress>,
) -> OnResult<ProcessorOutput> {
    Box::new(move |seq, result| {
        let sink = Arc::clone(&sink);
        let progress = Arc::clone(&progress);
        Box::pin(async move {
            let Ok(output) = result else {
                return Ok(());
            };
            let encoded = output.into_encoded()?;
            sink.lock().await.write_all(&encoded.bytes).await?;
            log::trace!("block {} written ({} bytes)", seq, encoded.bytes.len());
            progress.record(from_centiseconds(encoded.delay));
            Ok(())
        })
    })
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;
