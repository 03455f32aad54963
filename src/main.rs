use std::time::Duration;

use tokio::io::{AsyncWrite, BufWriter};
use tokio_util::sync::CancellationToken;

use crate::{
    config::EncoderConfig,
    error::EncoderError,
    media::{
        encoder::FrameEncoder,
        types::{Frame, FrameWritten},
    },
};

mod config;
mod error;
mod media;

const WIDTH: u16 = 96;
const HEIGHT: u16 = 64;
const FRAMES: usize = 60;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("gif_bus", log::LevelFilter::Info)
        .filter_module("gifmill", log::LevelFilter::Debug)
        .init();
}

/// Synthetic animation: a ball crossing a static backdrop. It rests for a few
/// frames at each end so merges happen, and the first frames are short.
fn render_frame(index: usize) -> Frame {
    let travel = usize::from(WIDTH) - 16;
    let phase = index % 30;
    let offset = match phase {
        0..5 => 0,
        5..25 => (phase - 5) * travel / 20,
        _ => travel,
    };
    let offset = if (index / 30) % 2 == 0 {
        offset
    } else {
        travel - offset
    };
    let (cx, cy) = (offset + 8, usize::from(HEIGHT) / 2);

    let mut pixels = Vec::with_capacity(usize::from(WIDTH) * usize::from(HEIGHT) * 4);
    for y in 0..usize::from(HEIGHT) {
        for x in 0..usize::from(WIDTH) {
            let (dx, dy) = (x.abs_diff(cx), y.abs_diff(cy));
            let px = if dx * dx + dy * dy <= 49 {
                [240, 180, 30, 255]
            } else if y > usize::from(HEIGHT) * 3 / 4 {
                [40, 110, 40, 255]
            } else {
                let shade = (y * 255 / usize::from(HEIGHT)) as u8;
                [shade / 3, shade / 2, 200, 255]
            };
            pixels.extend_from_slice(&px);
        }
    }

    let duration = if index < 3 {
        Duration::from_millis(10)
    } else {
        Duration::from_millis(40)
    };
    Frame::new(pixels, WIDTH, HEIGHT, duration)
}

/// Writes the animation and closes the encoder on every path, returning the
/// first error.
async fn write_animation<W>(
    encoder: &FrameEncoder<W>,
    cancel: &CancellationToken,
) -> Result<(), EncoderError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut rendered = Ok(());
    for index in 0..FRAMES {
        // Checked between frames only; write_frame runs to completion.
        if cancel.is_cancelled() {
            log::warn!("interrupted after {} frames, finishing the file", index);
            break;
        }
        if let Err(e) = encoder.write_frame(render_frame(index)).await {
            log::error!("frame {} failed: {}", index, e);
            rendered = Err(e);
            break;
        }
    }

    let closed = encoder.close().await;
    rendered.and(closed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let mut config = EncoderConfig::default();
    let mut output = "gifmill.gif".to_string();
    for arg in std::env::args().skip(1) {
        if arg.ends_with(".json") {
            config = EncoderConfig::from_json_file(&arg)?;
            log::info!("loaded configuration from {}", arg);
        } else {
            output = arg;
        }
    }
    if config.comment.is_none() {
        config.comment = Some("gifmill".to_string());
    }

    let file = tokio::fs::File::create(&output).await?;
    let encoder = FrameEncoder::new(BufWriter::new(file), config, |written: FrameWritten| {
        log::debug!(
            "{} frames written, {:?}",
            written.frames_written,
            written.written_duration
        );
    })?;

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    write_animation(&encoder, &cancel).await?;
    let written = encoder.progress();
    log::info!(
        "wrote {} ({}, {} frames, {:?})",
        output,
        encoder.state().await,
        written.frames_written,
        written.written_duration
    );
    Ok(())
}
