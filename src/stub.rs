//! Placeholder diff artifacts for pairs whose reference image is missing.
//!
//! Downstream reports expect a diff image next to every failed test image.
//! When there is no reference to diff against, a placeholder is written to
//! the same location a real diff would have used.

use std::path::{Path, PathBuf};

use crate::canvas::Canvas;

/// Prefix for diff artifacts written beside the test image
pub const FAILED_DIFF_PREFIX: &str = "failed_diff_";

const STUB_WIDTH: u32 = 400;
const STUB_HEIGHT: u32 = 120;
const STUB_BACKGROUND: [u8; 3] = [40, 40, 40];
const STUB_BANNER: [u8; 3] = [200, 30, 60];
const STUB_TEXT: &str = "REFERENCE MISSING";

/// Errors from writing a placeholder artifact
#[derive(Debug, thiserror::Error)]
pub enum StubError {
    #[error("test path has no file name: {0}")]
    NoFileName(PathBuf),

    #[error("failed to write stub {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Where the diff artifact for a test image goes.
///
/// `bitmaps_test/run/home.jpg` becomes `bitmaps_test/run/failed_diff_home.jpg`,
/// or `failed_diff_home.png` when PNG output is forced.
pub fn failed_diff_path(test_path: &Path, force_diff_png: bool) -> Option<PathBuf> {
    let file_name = test_path.file_name()?;
    let mut name = std::ffi::OsString::from(FAILED_DIFF_PREFIX);
    name.push(file_name);
    let path = test_path.with_file_name(name);
    Some(if force_diff_png {
        path.with_extension("png")
    } else {
        path
    })
}

/// Persists a placeholder diff for a pair that cannot be compared
pub trait FailureStubWriter: Send + Sync {
    /// Write the placeholder for `test_path` and return where it went
    fn store_failed_stub(&self, test_path: &Path, force_diff_png: bool) -> Result<PathBuf, StubError>;
}

/// Renders a banner image, sized like the test image when it can be read
#[derive(Debug, Clone, Default)]
pub struct PlaceholderStubWriter;

impl PlaceholderStubWriter {
    pub fn new() -> Self {
        Self
    }

    fn render(width: u32, height: u32) -> Canvas {
        let mut canvas = Canvas::with_color(width, height, STUB_BACKGROUND);

        // Largest glyph scale that fits the banner text
        let scale = (width * 8 / 10 / Canvas::text_width(STUB_TEXT, 1)).clamp(1, 4);
        let text_w = Canvas::text_width(STUB_TEXT, scale);
        let text_h = 8 * scale;
        let banner_h = (text_h + 16).min(height);
        let banner_y = height.saturating_sub(banner_h) / 2;

        canvas.draw_rect(0, banner_y, width, banner_h, STUB_BANNER);
        canvas.draw_text(
            width.saturating_sub(text_w) / 2,
            banner_y + banner_h.saturating_sub(text_h) / 2,
            STUB_TEXT,
            scale,
            [255, 255, 255],
        );
        canvas
    }
}

impl FailureStubWriter for PlaceholderStubWriter {
    fn store_failed_stub(&self, test_path: &Path, force_diff_png: bool) -> Result<PathBuf, StubError> {
        let path = failed_diff_path(test_path, force_diff_png)
            .ok_or_else(|| StubError::NoFileName(test_path.to_path_buf()))?;

        let (width, height) = image::image_dimensions(test_path)
            .ok()
            .filter(|&(w, h)| w > 0 && h > 0)
            .unwrap_or((STUB_WIDTH, STUB_HEIGHT));

        Self::render(width, height)
            .save(&path)
            .map_err(|source| StubError::Write {
                path: path.clone(),
                source,
            })?;

        log::debug!("stored failed diff stub {}", path.display());
        Ok(path)
    }
}
