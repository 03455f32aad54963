use std::fmt::{Display, Formatter};

use bytes::Bytes;

/// How the decoder treats a frame's area before drawing the next one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DisposalMethod {
    /// No disposal specified.
    #[default]
    Any,
    /// Leave the frame in place; the next frame draws on top.
    Keep,
    /// Clear the frame's area to the background (transparent).
    Background,
    /// Restore what was there before the frame was drawn.
    Previous,
}

impl From<DisposalMethod> for gif::DisposalMethod {
    fn from(method: DisposalMethod) -> Self {
        match method {
            DisposalMethod::Any => gif::DisposalMethod::Any,
            DisposalMethod::Keep => gif::DisposalMethod::Keep,
            DisposalMethod::Background => gif::DisposalMethod::Background,
            DisposalMethod::Previous => gif::DisposalMethod::Previous,
        }
    }
}

/// Position and size of an image on the canvas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: u16,
    pub top: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub fn new(left: u16, top: u16, width: u16, height: u16) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn full(width: u16, height: u16) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn area(&self) -> usize {
        usize::from(self.width) * usize::from(self.height)
    }

    pub fn right(&self) -> u16 {
        self.left.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u16 {
        self.top.saturating_add(self.height)
    }

    pub fn contains(&self, x: u16, y: u16) -> bool {
        x >= self.left && x < self.right() && y >= self.top && y < self.bottom()
    }
}

impl Display for Rect {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}+{}+{}",
            self.width, self.height, self.left, self.top
        )
    }
}

/// Quantize request: RGBA pixels of the (cropped) frame area.
#[derive(Debug)]
pub struct QuantizeRequest {
    pub rect: Rect,
    /// RGBA, `rect.area() * 4` bytes.
    pub rgba: Vec<u8>,
    pub max_colors: u16,
    /// NeuQuant sampling factor, 1 (best) to 30 (fastest).
    pub quality: i32,
    /// Frame delay in centiseconds.
    pub delay: u16,
    pub disposal: DisposalMethod,
}

/// Palette plus index buffer, the output of quantization and the input of
/// block encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuantizedImage {
    pub rect: Rect,
    /// RGB triplets.
    pub palette: Vec<u8>,
    /// One palette index per pixel of `rect`.
    pub indices: Vec<u8>,
    pub transparent: Option<u8>,
    pub delay: u16,
    pub disposal: DisposalMethod,
}

impl QuantizedImage {
    pub fn color_count(&self) -> usize {
        self.palette.len() / 3
    }

    /// Colour of the pixel at canvas position (`x`, `y`), `None` when the
    /// position is outside the image or the pixel is transparent.
    pub fn color_at(&self, x: u16, y: u16) -> Option<[u8; 3]> {
        if !self.rect.contains(x, y) {
            return None;
        }
        let offset = usize::from(y - self.rect.top) * usize::from(self.rect.width)
            + usize::from(x - self.rect.left);
        let index = *self.indices.get(offset)?;
        if Some(index) == self.transparent {
            return None;
        }
        let base = usize::from(index) * 3;
        let rgb = self.palette.get(base..base + 3)?;
        Some([rgb[0], rgb[1], rgb[2]])
    }
}

/// One encoded image block (graphic control extension, image descriptor,
/// local colour table and LZW data), ready to be appended to the stream.
#[derive(Clone, Debug)]
pub struct EncodedImage {
    pub bytes: Bytes,
    pub delay: u16,
}

/// Message posted to a GIF worker.
#[derive(Debug)]
pub enum ProcessorInput {
    Quantize(QuantizeRequest),
    Encode(QuantizedImage),
}

impl Display for ProcessorInput {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessorInput::Quantize(request) => write!(
                f,
                "quantize {} (max {} colors, {} bytes)",
                request.rect,
                request.max_colors,
                request.rgba.len()
            ),
            ProcessorInput::Encode(image) => write!(
                f,
                "encode {} ({} colors, delay {}cs)",
                image.rect,
                image.color_count(),
                image.delay
            ),
        }
    }
}

/// Reply from a GIF worker.
#[derive(Debug)]
pub enum ProcessorOutput {
    Quantized(QuantizedImage),
    Encoded(EncodedImage),
}

impl ProcessorOutput {
    pub fn into_quantized(self) -> anyhow::Result<QuantizedImage> {
        match self {
            ProcessorOutput::Quantized(image) => Ok(image),
            other => anyhow::bail!("wrong output type received: {}", other.kind()),
        }
    }

    pub fn into_encoded(self) -> anyhow::Result<EncodedImage> {
        match self {
            ProcessorOutput::Encoded(image) => Ok(image),
            other => anyhow::bail!("wrong output type received: {}", other.kind()),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ProcessorOutput::Quantized(_) => "quantized",
            ProcessorOutput::Encoded(_) => "encoded",
        }
    }
}
