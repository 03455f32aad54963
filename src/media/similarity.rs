use gif_bus::{message::Rect, processor::ALPHA_THRESHOLD};
use serde::{Deserialize, Serialize};

/// How the distance between two colours is measured. Every variant is
/// normalised to `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColorDistance {
    /// Weighted RGB distance.
    Euclidean { red: f64, green: f64, blue: f64 },
    /// CIE76 delta E over CIELAB, where a delta of 100 maps to 1.
    CieLab,
}

impl Default for ColorDistance {
    fn default() -> Self {
        ColorDistance::Euclidean {
            red: 2.0,
            green: 4.0,
            blue: 3.0,
        }
    }
}

impl ColorDistance {
    pub fn distance(&self, a: [u8; 3], b: [u8; 3]) -> f64 {
        if a == b {
            return 0.0;
        }
        match *self {
            ColorDistance::Euclidean { red, green, blue } => {
                let d = |i: usize| (f64::from(a[i]) - f64::from(b[i])) / 255.0;
                let total = red + green + blue;
                if total <= 0.0 {
                    return 1.0;
                }
                let sum = red * d(0).powi(2) + green * d(1).powi(2) + blue * d(2).powi(2);
                (sum / total).sqrt().min(1.0)
            }
            ColorDistance::CieLab => {
                let (a, b) = (to_lab(a), to_lab(b));
                let sum: f64 = (0..3).map(|i| (a[i] - b[i]).powi(2)).sum();
                (sum.sqrt() / 100.0).min(1.0)
            }
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if let ColorDistance::Euclidean { red, green, blue } = *self {
            if red < 0.0 || green < 0.0 || blue < 0.0 || red + green + blue <= 0.0 {
                return Err(format!(
                    "euclidean weights must be non-negative with a positive sum, got {}/{}/{}",
                    red, green, blue
                ));
            }
        }
        Ok(())
    }
}

/// sRGB (D65) to CIELAB.
fn to_lab(rgb: [u8; 3]) -> [f64; 3] {
    let linear = |c: u8| {
        let c = f64::from(c) / 255.0;
        if c <= 0.04045 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    };
    let (r, g, b) = (linear(rgb[0]), linear(rgb[1]), linear(rgb[2]));
    let x = (0.4124 * r + 0.3576 * g + 0.1805 * b) / 0.95047;
    let y = 0.2126 * r + 0.7152 * g + 0.0722 * b;
    let z = (0.0193 * r + 0.1192 * g + 0.9505 * b) / 1.08883;
    let f = |t: f64| {
        if t > 0.008856 {
            t.cbrt()
        } else {
            7.787 * t + 16.0 / 116.0
        }
    };
    let (fx, fy, fz) = (f(x), f(y), f(z));
    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

pub fn is_transparent(px: &[u8]) -> bool {
    px[3] < ALPHA_THRESHOLD
}

/// Pixel comparison with a colour tolerance. Transparent pixels match each
/// other whatever their colour, and never match an opaque one.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Similarity {
    pub distance: ColorDistance,
    pub tolerance: f64,
}

impl Similarity {
    pub fn new(distance: ColorDistance, tolerance: f64) -> Self {
        Self {
            distance,
            tolerance,
        }
    }

    pub fn colors_match(&self, a: [u8; 3], b: [u8; 3]) -> bool {
        a == b || self.distance.distance(a, b) <= self.tolerance
    }

    /// `a` and `b` are RGBA pixels.
    pub fn pixels_match(&self, a: &[u8], b: &[u8]) -> bool {
        match (is_transparent(a), is_transparent(b)) {
            (true, true) => true,
            (false, false) => self.colors_match([a[0], a[1], a[2]], [b[0], b[1], b[2]]),
            _ => false,
        }
    }

    pub fn frames_match(&self, a: &[u8], b: &[u8]) -> bool {
        a.len() == b.len()
            && a
                .chunks_exact(4)
                .zip(b.chunks_exact(4))
                .all(|(a, b)| self.pixels_match(a, b))
    }

    /// Bounding box of the pixels of `after` that do not match `before`.
    pub fn changed_bounds(&self, before: &[u8], after: &[u8], width: u16) -> Option<Rect> {
        let width = usize::from(width);
        let mut bounds: Option<(usize, usize, usize, usize)> = None;
        for (i, (a, b)) in before.chunks_exact(4).zip(after.chunks_exact(4)).enumerate() {
            if self.pixels_match(a, b) {
                continue;
            }
            let (x, y) = (i % width, i / width);
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
        bounds.map(|(x0, y0, x1, y1)| {
            Rect::new(
                x0 as u16,
                y0 as u16,
                (x1 - x0 + 1) as u16,
                (y1 - y0 + 1) as u16,
            )
        })
    }
}
