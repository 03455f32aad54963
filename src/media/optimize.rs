use gif_bus::message::{DisposalMethod, QuantizedImage, Rect};

use crate::media::similarity::{Similarity, is_transparent};

#[derive(Clone, Copy, Debug)]
pub struct OptimizeOptions {
    pub similarity: Similarity,
    /// Replace pixels that did not change with transparency.
    pub optimize_transparency: bool,
    /// Crop frames drawn on an empty canvas to their opaque area.
    pub crop_transparent: bool,
}

/// A frame ready to be quantized: the cropped area, its pixels and how the
/// decoder should dispose of it.
#[derive(Debug, PartialEq)]
pub struct PlannedImage {
    pub rect: Rect,
    pub rgba: Vec<u8>,
    pub disposal: DisposalMethod,
}

/// What the decoder displays after every forwarded frame, used to crop each
/// frame to the area that actually changes.
pub struct Canvas {
    width: u16,
    height: u16,
    displayed: Vec<u8>,
    blank: bool,
    options: OptimizeOptions,
}

impl Canvas {
    pub fn new(width: u16, height: u16, options: OptimizeOptions) -> Self {
        Self {
            width,
            height,
            displayed: vec![0; usize::from(width) * usize::from(height) * 4],
            blank: true,
            options,
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Plans how to draw `image` over the current canvas, given the frame
    /// that will follow it (`None` for the last frame), and updates the
    /// canvas to what the decoder shows afterwards.
    pub fn plan(&mut self, image: &[u8], next: Option<&[u8]>) -> PlannedImage {
        let full = Rect::full(self.width, self.height);
        // The next frame cannot be drawn on top if it is transparent where
        // this one is opaque.
        let clear = next.is_some_and(|next| reveals_transparency(image, next));
        let rect = if clear || (self.blank && !self.options.crop_transparent) {
            full
        } else {
            self.options
                .similarity
                .changed_bounds(&self.displayed, image, self.width)
                .unwrap_or(Rect::new(0, 0, 1, 1))
        };

        let mut rgba = Vec::with_capacity(rect.area() * 4);
        let mut drawn = false;
        for y in rect.top..rect.bottom() {
            for x in rect.left..rect.right() {
                let i = self.offset(x, y);
                let px = &image[i..i + 4];
                let unchanged = self
                    .options
                    .similarity
                    .pixels_match(&self.displayed[i..i + 4], px);
                if self.options.optimize_transparency && unchanged {
                    rgba.extend_from_slice(&[0, 0, 0, 0]);
                    continue;
                }
                rgba.extend_from_slice(px);
                if !is_transparent(px) {
                    self.displayed[i..i + 4].copy_from_slice(px);
                    drawn = true;
                }
            }
        }

        let disposal = if clear {
            self.displayed.fill(0);
            self.blank = true;
            DisposalMethod::Background
        } else {
            self.blank &= !drawn;
            DisposalMethod::Keep
        };

        PlannedImage {
            rect,
            rgba,
            disposal,
        }
    }

    fn offset(&self, x: u16, y: u16) -> usize {
        (usize::from(y) * usize::from(self.width) + usize::from(x)) * 4
    }
}

fn reveals_transparency(image: &[u8], next: &[u8]) -> bool {
    image
        .chunks_exact(4)
        .zip(next.chunks_exact(4))
        .any(|(current, next)| !is_transparent(current) && is_transparent(next))
}

/// Whether `image` can be shown by extending `pending` instead: both are
/// drawn on top of the canvas, and every opaque pixel of `image` is already
/// displayed by `pending` within tolerance.
pub fn quantized_frames_match(
    similarity: &Similarity,
    pending: &QuantizedImage,
    image: &QuantizedImage,
) -> bool {
    if pending.disposal != DisposalMethod::Keep || image.disposal != DisposalMethod::Keep {
        return false;
    }
    let rect = image.rect;
    (rect.top..rect.bottom()).all(|y| {
        (rect.left..rect.right()).all(|x| match image.color_at(x, y) {
            None => true,
            Some(color) => pending
                .color_at(x, y)
                .is_some_and(|shown| similarity.colors_match(shown, color)),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::similarity::ColorDistance;

    const RED: [u8; 4] = [255, 0, 0, 255];
    const BLUE: [u8; 4] = [0, 0, 255, 255];
    const CLEAR: [u8; 4] = [0, 0, 0, 0];

    fn options(optimize_transparency: bool, crop_transparent: bool) -> OptimizeOptions {
        OptimizeOptions {
            similarity: Similarity::new(ColorDistance::default(), 0.0),
            optimize_transparency,
            crop_transparent,
        }
    }

    fn image(width: usize, height: usize, fill: [u8; 4], dots: &[(usize, usize, [u8; 4])]) -> Vec<u8> {
        let mut pixels: Vec<u8> = std::iter::repeat_n(fill, width * height).flatten().collect();
        for (x, y, px) in dots {
            let i = (y * width + x) * 4;
            pixels[i..i + 4].copy_from_slice(px);
        }
        pixels
    }

    #[test]
    fn test_first_frame_is_full_without_crop() {
        let mut canvas = Canvas::new(4, 4, options(true, false));
        let frame = image(4, 4, CLEAR, &[(1, 1, RED)]);
        let planned = canvas.plan(&frame, None);
        assert_eq!(planned.rect, Rect::full(4, 4));
        assert_eq!(planned.disposal, DisposalMethod::Keep);
        assert_eq!(planned.rgba.len(), 4 * 4 * 4);
    }

    #[test]
    fn test_first_frame_is_cropped_to_opaque_area() {
        let mut canvas = Canvas::new(4, 4, options(true, true));
        let frame = image(4, 4, CLEAR, &[(1, 1, RED), (2, 1, BLUE)]);
        let planned = canvas.plan(&frame, None);
        assert_eq!(planned.rect, Rect::new(1, 1, 2, 1));
        assert_eq!(planned.rgba, [RED, BLUE].concat());
    }

    #[test]
    fn test_delta_is_cropped_and_unchanged_pixels_cleared() {
        let mut canvas = Canvas::new(4, 4, options(true, false));
        let first = image(4, 4, RED, &[]);
        let second = image(4, 4, RED, &[(2, 2, BLUE), (3, 3, BLUE)]);
        canvas.plan(&first, Some(&second));

        let planned = canvas.plan(&second, None);
        assert_eq!(planned.rect, Rect::new(2, 2, 2, 2));
        assert_eq!(planned.rgba, [BLUE, CLEAR, CLEAR, BLUE].concat());
        assert_eq!(planned.disposal, DisposalMethod::Keep);
    }

    #[test]
    fn test_unchanged_pixels_kept_without_transparency_optimisation() {
        let mut canvas = Canvas::new(2, 2, options(false, false));
        let first = image(2, 2, RED, &[]);
        let second = image(2, 2, RED, &[(0, 0, BLUE), (1, 1, BLUE)]);
        canvas.plan(&first, Some(&second));

        let planned = canvas.plan(&second, None);
        assert_eq!(planned.rect, Rect::full(2, 2));
        assert_eq!(planned.rgba, second);
    }

    #[test]
    fn test_revealed_transparency_clears_canvas() {
        let mut canvas = Canvas::new(3, 1, options(true, true));
        let first = image(3, 1, RED, &[]);
        let second = image(3, 1, RED, &[(1, 0, CLEAR)]);

        let planned = canvas.plan(&first, Some(&second));
        assert_eq!(planned.disposal, DisposalMethod::Background);
        assert_eq!(planned.rect, Rect::full(3, 1));

        // Drawn on a cleared canvas, the next frame keeps its own opaque
        // area only.
        let planned = canvas.plan(&second, None);
        assert_eq!(planned.disposal, DisposalMethod::Keep);
        assert_eq!(planned.rect, Rect::full(3, 1));
        assert_eq!(planned.rgba, [RED, CLEAR, RED].concat());
    }

    #[test]
    fn test_identical_frame_becomes_single_transparent_pixel() {
        let mut canvas = Canvas::new(2, 2, options(true, false));
        let frame = image(2, 2, BLUE, &[]);
        canvas.plan(&frame, Some(&frame));

        let planned = canvas.plan(&frame, None);
        assert_eq!(planned.rect, Rect::new(0, 0, 1, 1));
        assert_eq!(planned.rgba, CLEAR.to_vec());
    }

    fn quantized(rect: Rect, color: [u8; 3], disposal: DisposalMethod) -> QuantizedImage {
        QuantizedImage {
            rect,
            palette: color.to_vec(),
            indices: vec![0; rect.area()],
            transparent: None,
            delay: 4,
            disposal,
        }
    }

    #[test]
    fn test_quantized_match_requires_covered_pixels_within_tolerance() {
        let loose = Similarity::new(ColorDistance::default(), 0.05);
        let pending = quantized(Rect::full(4, 4), [100, 100, 100], DisposalMethod::Keep);

        let close = quantized(Rect::new(1, 1, 2, 2), [102, 100, 100], DisposalMethod::Keep);
        assert!(quantized_frames_match(&loose, &pending, &close));

        let far = quantized(Rect::new(1, 1, 2, 2), [200, 0, 0], DisposalMethod::Keep);
        assert!(!quantized_frames_match(&loose, &pending, &far));

        let cleared = quantized(Rect::new(1, 1, 2, 2), [100, 100, 100], DisposalMethod::Background);
        assert!(!quantized_frames_match(&loose, &pending, &cleared));

        let small = quantized(Rect::new(0, 0, 1, 1), [100, 100, 100], DisposalMethod::Keep);
        let outside = quantized(Rect::new(2, 2, 2, 2), [100, 100, 100], DisposalMethod::Keep);
        assert!(!quantized_frames_match(&loose, &small, &outside));
    }

    #[test]
    fn test_transparent_quantized_pixels_always_match() {
        let exact = Similarity::new(ColorDistance::default(), 0.0);
        let pending = quantized(Rect::new(0, 0, 1, 1), [0, 0, 0], DisposalMethod::Keep);
        let image = QuantizedImage {
            rect: Rect::new(0, 0, 2, 1),
            palette: vec![0, 0, 0, 9, 9, 9],
            indices: vec![0, 1],
            transparent: Some(1),
            delay: 4,
            disposal: DisposalMethod::Keep,
        };
        assert!(quantized_frames_match(&exact, &pending, &image));
    }
}
