//! Pixel-level comparison of a reference and a test image.
//!
//! Images are compared over the union of their extents. A pixel counts as a
//! mismatch when any RGBA channel differs by more than the tolerance, or when
//! it lies outside one of the two images. The diff image paints mismatches in
//! the error color and fades everything else toward white.

use image::{DynamicImage, GenericImageView, Rgb, RgbImage, Rgba};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::compare::types::{DiffStats, DimensionDifference};

/// Default per-channel tolerance
pub const DEFAULT_TOLERANCE: u8 = 16;

/// Default opacity of unchanged pixels in the diff image
pub const DEFAULT_TRANSPARENCY: f32 = 0.3;

/// Errors from loading or diffing images
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("failed to open image {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("invalid output options: {0}")]
    Options(#[from] serde_json::Error),
}

/// Color used for mismatched pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ErrorColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Default for ErrorColor {
    fn default() -> Self {
        Self {
            red: 255,
            green: 0,
            blue: 255,
        }
    }
}

/// Output options understood by the diff; unknown keys are ignored
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiffOptions {
    pub error_color: ErrorColor,
    /// Opacity (0..1) of unchanged pixels in the diff image
    pub transparency: f32,
    /// Largest per-channel difference still treated as equal
    pub tolerance: u8,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            error_color: ErrorColor::default(),
            transparency: DEFAULT_TRANSPARENCY,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl DiffOptions {
    /// Read options from the opaque settings object; `null` means defaults
    pub fn from_value(value: &serde_json::Value) -> Result<Self, DiffError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(Self::deserialize(value)?)
    }
}

/// Statistics plus the rendered diff image
#[derive(Debug, Clone)]
pub struct DiffResult {
    pub stats: DiffStats,
    pub image: RgbImage,
}

/// Open both files and diff them
pub fn diff_files(
    reference: &Path,
    test: &Path,
    options: &DiffOptions,
) -> Result<DiffResult, DiffError> {
    let reference_img = open(reference)?;
    let test_img = open(test)?;
    Ok(diff_images(&reference_img, &test_img, options))
}

fn open(path: &Path) -> Result<DynamicImage, DiffError> {
    image::open(path).map_err(|source| DiffError::Open {
        path: path.to_path_buf(),
        source,
    })
}

/// Diff two decoded images
pub fn diff_images(reference: &DynamicImage, test: &DynamicImage, options: &DiffOptions) -> DiffResult {
    let started = Instant::now();

    let (ref_w, ref_h) = reference.dimensions();
    let (test_w, test_h) = test.dimensions();
    let width = ref_w.max(test_w);
    let height = ref_h.max(test_h);

    let reference = reference.to_rgba8();
    let test = test.to_rgba8();

    let error_color = Rgb([
        options.error_color.red,
        options.error_color.green,
        options.error_color.blue,
    ]);
    let opacity = options.transparency.clamp(0.0, 1.0);

    let mut image = RgbImage::new(width, height);
    let mut mismatched: u64 = 0;

    for y in 0..height {
        for x in 0..width {
            let ref_px = (x < ref_w && y < ref_h).then(|| *reference.get_pixel(x, y));
            let test_px = (x < test_w && y < test_h).then(|| *test.get_pixel(x, y));

            let out = match (ref_px, test_px) {
                (Some(a), Some(b)) if within_tolerance(a, b, options.tolerance) => fade(a, opacity),
                _ => {
                    mismatched += 1;
                    error_color
                }
            };
            image.put_pixel(x, y, out);
        }
    }

    let total = u64::from(width) * u64::from(height);
    let raw = if total == 0 {
        0.0
    } else {
        mismatched as f64 / total as f64 * 100.0
    };

    let stats = DiffStats {
        mis_match_percentage: (raw * 100.0).round() / 100.0,
        raw_mis_match_percentage: raw,
        require_same_dimensions: true,
        is_same_dimensions: ref_w == test_w && ref_h == test_h,
        dimension_difference: DimensionDifference {
            width: i64::from(test_w) - i64::from(ref_w),
            height: i64::from(test_h) - i64::from(ref_h),
        },
        analysis_time: started.elapsed().as_millis() as u64,
    };

    DiffResult { stats, image }
}

fn within_tolerance(a: Rgba<u8>, b: Rgba<u8>, tolerance: u8) -> bool {
    a.0.iter().zip(b.0.iter()).all(|(x, y)| x.abs_diff(*y) <= tolerance)
}

/// Blend a pixel toward white; `opacity` 1.0 keeps it unchanged
fn fade(px: Rgba<u8>, opacity: f32) -> Rgb<u8> {
    let alpha = f32::from(px.0[3]) / 255.0 * opacity;
    let blend = |c: u8| (f32::from(c) * alpha + 255.0 * (1.0 - alpha)).round() as u8;
    Rgb([blend(px.0[0]), blend(px.0[1]), blend(px.0[2])])
}
