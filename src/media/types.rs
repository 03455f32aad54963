use std::{
    fmt::{Display, Formatter},
    time::Duration,
};

/// A raw RGBA frame handed to the encoder.
#[derive(Clone, Debug)]
pub struct Frame {
    /// RGBA, `width * height * 4` bytes.
    pub pixels: Vec<u8>,
    pub width: u16,
    pub height: u16,
    pub duration: Duration,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u16, height: u16, duration: Duration) -> Self {
        Self {
            pixels,
            width,
            height,
            duration,
        }
    }

    pub fn expected_len(&self) -> usize {
        usize::from(self.width) * usize::from(self.height) * 4
    }
}

/// Progress report, fired once per frame that reached the sink or was
/// merged into an earlier one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameWritten {
    pub frames_written: u64,
    pub written_duration: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncoderState {
    /// Constructed, no frame written yet.
    Idle,
    /// Header written, accepting frames.
    Open,
    /// Final flush in progress.
    Closing,
    /// Terminal.
    Closed,
}

impl Display for EncoderState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EncoderState::Idle => "idle",
            EncoderState::Open => "open",
            EncoderState::Closing => "closing",
            EncoderState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// GIF delays are in centiseconds.
pub fn centiseconds(duration: Duration) -> u16 {
    (duration.as_millis() / 10).min(u128::from(u16::MAX)) as u16
}

pub fn from_centiseconds(delay: u16) -> Duration {
    Duration::from_millis(u64::from(delay) * 10)
}
