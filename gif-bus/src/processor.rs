//! The GIF codec black boxes run inside the workers: palette quantization
//! and single image block encoding.

use std::{borrow::Cow, collections::HashMap};

use bytes::Bytes;
use color_quant::NeuQuant;
use gif::{Encoder, Repeat};

use crate::{
    message::{EncodedImage, ProcessorInput, ProcessorOutput, QuantizeRequest, QuantizedImage},
    worker::Processor,
};

/// GIF stream terminator.
pub const TRAILER: u8 = 0x3B;

/// Pixels with alpha below this are treated as fully transparent.
pub const ALPHA_THRESHOLD: u8 = 128;

const EXTENSION_INTRODUCER: u8 = 0x21;
const COMMENT_LABEL: u8 = 0xFE;
const SCREEN_DESCRIPTOR_END: usize = 13;

/// Worker-side processor. Holds no state between requests, so any worker
/// produces the same output for the same input.
pub struct GifProcessor {
    worker: usize,
}

impl GifProcessor {
    pub fn new(worker: usize) -> Self {
        Self { worker }
    }
}

impl Processor for GifProcessor {
    type Input = ProcessorInput;
    type Output = ProcessorOutput;

    fn process(&mut self, input: ProcessorInput) -> anyhow::Result<ProcessorOutput> {
        match input {
            ProcessorInput::Quantize(request) => {
                let image = quantize(&request)?;
                log::trace!(
                    "worker {}: quantized {} to {} colors",
                    self.worker,
                    image.rect,
                    image.color_count()
                );
                Ok(ProcessorOutput::Quantized(image))
            }
            ProcessorInput::Encode(image) => Ok(ProcessorOutput::Encoded(encode(image)?)),
        }
    }
}

/// Reduces an RGBA image to at most `max_colors` palette entries.
///
/// Images that already fit use their exact colours in first-seen order;
/// larger ones go through NeuQuant. One slot is reserved for the transparent
/// index when any pixel is transparent.
pub fn quantize(request: &QuantizeRequest) -> anyhow::Result<QuantizedImage> {
    let expected = request.rect.area() * 4;
    if request.rgba.len() != expected {
        anyhow::bail!(
            "pixel buffer of {} bytes does not match {} ({} bytes expected)",
            request.rgba.len(),
            request.rect,
            expected
        );
    }
    if request.rect.area() == 0 {
        anyhow::bail!("cannot quantize an empty image {}", request.rect);
    }

    let max_colors = usize::from(request.max_colors.clamp(2, 256));
    let opaque: Vec<u8> = request
        .rgba
        .chunks_exact(4)
        .filter(|px| px[3] >= ALPHA_THRESHOLD)
        .flat_map(|px| [px[0], px[1], px[2], 255])
        .collect();
    let has_transparent = opaque.len() < request.rgba.len();

    if opaque.is_empty() {
        return Ok(QuantizedImage {
            rect: request.rect,
            palette: vec![0, 0, 0],
            indices: vec![0; request.rect.area()],
            transparent: Some(0),
            delay: request.delay,
            disposal: request.disposal,
        });
    }

    let budget = max_colors - usize::from(has_transparent);
    let (mut palette, mut indices) = match exact_palette(&request.rgba, budget) {
        Some(exact) => exact,
        None => neuquant_palette(&request.rgba, &opaque, budget, request.quality),
    };

    let transparent = if has_transparent {
        let index = u8::try_from(palette.len() / 3)?;
        palette.extend_from_slice(&[0, 0, 0]);
        for (slot, px) in indices.iter_mut().zip(request.rgba.chunks_exact(4)) {
            if px[3] < ALPHA_THRESHOLD {
                *slot = index;
            }
        }
        Some(index)
    } else {
        None
    };

    Ok(QuantizedImage {
        rect: request.rect,
        palette,
        indices,
        transparent,
        delay: request.delay,
        disposal: request.disposal,
    })
}

/// Palette of the distinct opaque colours, or `None` if there are more than
/// `budget` of them. Transparent pixels get index 0 as a placeholder.
fn exact_palette(rgba: &[u8], budget: usize) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut lookup: HashMap<[u8; 3], u8> = HashMap::new();
    let mut palette = Vec::new();
    let mut indices = Vec::with_capacity(rgba.len() / 4);
    for px in rgba.chunks_exact(4) {
        if px[3] < ALPHA_THRESHOLD {
            indices.push(0);
            continue;
        }
        let rgb = [px[0], px[1], px[2]];
        let index = match lookup.get(&rgb) {
            Some(index) => *index,
            None => {
                if lookup.len() == budget {
                    return None;
                }
                let index = lookup.len() as u8;
                lookup.insert(rgb, index);
                palette.extend_from_slice(&rgb);
                index
            }
        };
        indices.push(index);
    }
    Some((palette, indices))
}

fn neuquant_palette(rgba: &[u8], opaque: &[u8], colors: usize, quality: i32) -> (Vec<u8>, Vec<u8>) {
    let quant = NeuQuant::new(quality.clamp(1, 30), colors, opaque);
    let palette = quant.color_map_rgb();
    let indices = rgba
        .chunks_exact(4)
        .map(|px| {
            if px[3] < ALPHA_THRESHOLD {
                0
            } else {
                quant.index_of(&[px[0], px[1], px[2], 255]) as u8
            }
        })
        .collect();
    (palette, indices)
}

/// LZW-encodes one quantized image into a standalone image block: graphic
/// control extension, image descriptor, local colour table and image data.
pub fn encode(image: QuantizedImage) -> anyhow::Result<EncodedImage> {
    if image.indices.len() != image.rect.area() {
        anyhow::bail!(
            "index buffer of {} entries does not match {}",
            image.indices.len(),
            image.rect
        );
    }
    let rect = image.rect;
    let delay = image.delay;
    let frame = gif::Frame {
        left: rect.left,
        top: rect.top,
        width: rect.width,
        height: rect.height,
        delay,
        dispose: image.disposal.into(),
        transparent: image.transparent,
        palette: Some(image.palette),
        buffer: Cow::Owned(image.indices),
        ..gif::Frame::default()
    };

    let mut encoder = Encoder::new(Vec::new(), rect.right(), rect.bottom(), &[])?;
    encoder.write_frame(&frame)?;
    let scratch = encoder.into_inner()?;
    Ok(EncodedImage {
        bytes: image_block(scratch)?,
        delay,
    })
}

/// Cuts the image block out of a single-frame GIF written by the encoder.
fn image_block(stream: Vec<u8>) -> anyhow::Result<Bytes> {
    if stream.len() <= SCREEN_DESCRIPTOR_END || !stream.starts_with(b"GIF") {
        anyhow::bail!("scratch stream is not a GIF ({} bytes)", stream.len());
    }
    let flags = stream[10];
    let mut start = SCREEN_DESCRIPTOR_END;
    if flags & 0x80 != 0 {
        start += 3 * (1usize << ((flags & 0x07) + 1));
    }
    let end = stream.len() - 1;
    if start >= end || stream[end] != TRAILER {
        anyhow::bail!("scratch stream has no image block");
    }
    Ok(Bytes::from(stream).slice(start..end))
}

/// Stream header: signature, logical screen descriptor, looping extension
/// and the optional comment extension. `loop_count` 0 loops forever.
pub fn stream_header(
    width: u16,
    height: u16,
    loop_count: u16,
    comment: Option<&str>,
) -> anyhow::Result<Vec<u8>> {
    let mut encoder = Encoder::new(Vec::new(), width, height, &[])?;
    encoder.set_repeat(match loop_count {
        0 => Repeat::Infinite,
        n => Repeat::Finite(n),
    })?;
    let mut header = encoder.into_inner()?;
    if header.pop() != Some(TRAILER) {
        anyhow::bail!("unexpected end of GIF header");
    }

    if let Some(comment) = comment.filter(|c| !c.is_empty()) {
        header.extend_from_slice(&[EXTENSION_INTRODUCER, COMMENT_LABEL]);
        for chunk in comment.as_bytes().chunks(255) {
            header.push(chunk.len() as u8);
            header.extend_from_slice(chunk);
        }
        header.push(0);
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DisposalMethod, Rect};

    fn request(width: u16, height: u16, rgba: Vec<u8>, max_colors: u16) -> QuantizeRequest {
        QuantizeRequest {
            rect: Rect::full(width, height),
            rgba,
            max_colors,
            quality: 10,
            delay: 5,
            disposal: DisposalMethod::Keep,
        }
    }

    fn decode(stream: &[u8]) -> Vec<gif::Frame<'static>> {
        let mut options = gif::DecodeOptions::new();
        options.set_color_output(gif::ColorOutput::Indexed);
        let mut decoder = options.read_info(stream).unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = decoder.read_next_frame().unwrap() {
            frames.push(frame.clone());
        }
        frames
    }

    #[test]
    fn test_exact_palette_keeps_colors_in_first_seen_order() {
        let rgba = vec![
            255, 0, 0, 255, //
            0, 0, 255, 255, //
            255, 0, 0, 255, //
            0, 255, 0, 255,
        ];
        let image = quantize(&request(2, 2, rgba, 256)).unwrap();
        assert_eq!(image.palette, vec![255, 0, 0, 0, 0, 255, 0, 255, 0]);
        assert_eq!(image.indices, vec![0, 1, 0, 2]);
        assert_eq!(image.transparent, None);
        assert_eq!(image.color_at(1, 1), Some([0, 255, 0]));
    }

    #[test]
    fn test_transparent_pixels_get_reserved_index() {
        let rgba = vec![
            10, 20, 30, 255, //
            0, 0, 0, 0, //
            10, 20, 30, 200, //
            99, 99, 99, 100,
        ];
        let image = quantize(&request(2, 2, rgba, 4)).unwrap();
        assert_eq!(image.transparent, Some(1));
        assert_eq!(image.indices, vec![0, 1, 0, 1]);
        assert_eq!(image.color_count(), 2);
        assert_eq!(image.color_at(1, 0), None);
    }

    #[test]
    fn test_fully_transparent_image() {
        let image = quantize(&request(3, 1, vec![0; 12], 256)).unwrap();
        assert_eq!(image.palette, vec![0, 0, 0]);
        assert_eq!(image.indices, vec![0, 0, 0]);
        assert_eq!(image.transparent, Some(0));
    }

    #[test]
    fn test_many_colors_are_reduced_to_limit() {
        let mut rgba = Vec::new();
        for i in 0..64u32 {
            rgba.extend_from_slice(&[(i * 4) as u8, (255 - i * 4) as u8, (i * 2) as u8, 255]);
        }
        rgba[3] = 0;
        let image = quantize(&request(8, 8, rgba.clone(), 16)).unwrap();
        assert!(image.color_count() <= 16);
        assert_eq!(image.indices.len(), 64);
        assert_eq!(image.transparent, Some((image.color_count() - 1) as u8));
        assert_eq!(image.indices[0], image.transparent.unwrap());

        // Same input, same output.
        assert_eq!(quantize(&request(8, 8, rgba, 16)).unwrap(), image);
    }

    #[test]
    fn test_pixel_buffer_size_is_checked() {
        let err = quantize(&request(2, 2, vec![0; 12], 256)).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_encoded_block_decodes_inside_a_stream() {
        let image = QuantizedImage {
            rect: Rect::new(1, 2, 2, 1),
            palette: vec![255, 255, 255, 0, 0, 0],
            indices: vec![1, 0],
            transparent: Some(0),
            delay: 7,
            disposal: DisposalMethod::Background,
        };
        let encoded = encode(image).unwrap();
        assert_eq!(encoded.delay, 7);
        assert_ne!(encoded.bytes[encoded.bytes.len() - 1], TRAILER);

        let mut stream = stream_header(4, 4, 0, None).unwrap();
        stream.extend_from_slice(&encoded.bytes);
        stream.push(TRAILER);

        let frames = decode(&stream);
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!((frame.left, frame.top, frame.width, frame.height), (1, 2, 2, 1));
        assert_eq!(frame.delay, 7);
        assert_eq!(frame.transparent, Some(0));
        assert_eq!(frame.dispose, gif::DisposalMethod::Background);
        assert_eq!(&frame.buffer[..], &[1, 0]);
    }

    #[test]
    fn test_stream_header_carries_loop_and_comment() {
        let header = stream_header(10, 20, 3, Some("made by gifmill")).unwrap();
        assert!(header.starts_with(b"GIF89a"));
        assert_eq!(u16::from_le_bytes([header[6], header[7]]), 10);
        assert_eq!(u16::from_le_bytes([header[8], header[9]]), 20);
        assert!(header.windows(11).any(|w| w == b"NETSCAPE2.0"));
        assert!(header.windows(15).any(|w| w == b"made by gifmill"));
        assert_eq!(header[header.len() - 1], 0);
        assert_ne!(header[header.len() - 1], TRAILER);
    }

    #[test]
    fn test_long_comment_is_split_into_sub_blocks() {
        let comment = "x".repeat(300);
        let header = stream_header(1, 1, 0, Some(&comment)).unwrap();
        let start = header
            .windows(2)
            .position(|w| w == &[EXTENSION_INTRODUCER, COMMENT_LABEL])
            .unwrap();
        assert_eq!(header[start + 2], 255);
        assert_eq!(header[start + 3 + 255], 45);
        assert_eq!(header.len(), start + 2 + 1 + 255 + 1 + 45 + 1);
    }

    #[test]
    fn test_processor_rejects_garbage_block() {
        assert!(image_block(vec![1, 2, 3]).is_err());
        let mut processor = GifProcessor::new(0);
        let out = processor
            .process(ProcessorInput::Quantize(request(1, 1, vec![1, 2, 3, 255], 256)))
            .unwrap();
        assert!(out.into_encoded().is_err());
    }
}
