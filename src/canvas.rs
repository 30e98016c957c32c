//! RGB drawing surface used for placeholder artifacts and test fixtures.
//!
//! - `fill()` / `draw_rect()` - solid color areas
//! - `draw_text()` - font8x8 glyphs, optionally scaled
//! - `save()` - encode to whatever format the path extension names

use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{ImageBuffer, ImageResult, RgbImage};
use std::path::Path;

/// A fixed-size RGB pixel buffer
#[derive(Debug, Clone)]
pub struct Canvas {
    width: u32,
    height: u32,
    /// Row-major, 3 bytes per pixel
    buffer: Vec<u8>,
}

impl Canvas {
    /// Create a black canvas
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            buffer: vec![0u8; (width as usize) * (height as usize) * 3],
        }
    }

    /// Create a canvas filled with one color
    pub fn with_color(width: u32, height: u32, color: [u8; 3]) -> Self {
        let mut canvas = Self::new(width, height);
        canvas.fill(color);
        canvas
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn fill(&mut self, color: [u8; 3]) {
        for chunk in self.buffer.chunks_exact_mut(3) {
            chunk.copy_from_slice(&color);
        }
    }

    /// Draw a filled rectangle, clipped to the canvas
    pub fn draw_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
        for py in y..y.saturating_add(h).min(self.height) {
            for px in x..x.saturating_add(w).min(self.width) {
                self.set_pixel(px, py, color);
            }
        }
    }

    /// Draw text with 8x8 glyphs magnified by `scale`. Text does not wrap.
    pub fn draw_text(&mut self, x: u32, y: u32, text: &str, scale: u32, color: [u8; 3]) {
        let scale = scale.max(1);
        let advance = 8 * scale;
        let mut cursor_x = x;
        for ch in text.chars() {
            if cursor_x >= self.width {
                break;
            }
            self.draw_char(cursor_x, y, ch, scale, color);
            cursor_x += advance;
        }
    }

    /// Width in pixels that `text` occupies at `scale`
    pub fn text_width(text: &str, scale: u32) -> u32 {
        text.chars().count() as u32 * 8 * scale.max(1)
    }

    fn draw_char(&mut self, x: u32, y: u32, ch: char, scale: u32, color: [u8; 3]) {
        let glyph = BASIC_FONTS.get(ch).unwrap_or([0u8; 8]);
        for (row_idx, row) in glyph.iter().enumerate() {
            for bit in 0..8 {
                // font8x8 stores LSB as leftmost pixel
                if (row >> bit) & 1 == 1 {
                    self.draw_rect(
                        x + bit * scale,
                        y + row_idx as u32 * scale,
                        scale,
                        scale,
                        color,
                    );
                }
            }
        }
    }

    /// Color at (x, y); black outside the canvas
    pub fn get_pixel(&self, x: u32, y: u32) -> [u8; 3] {
        if x >= self.width || y >= self.height {
            return [0, 0, 0];
        }
        let idx = ((y * self.width + x) * 3) as usize;
        [self.buffer[idx], self.buffer[idx + 1], self.buffer[idx + 2]]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = ((y * self.width + x) * 3) as usize;
        self.buffer[idx..idx + 3].copy_from_slice(&color);
    }

    pub fn into_image(self) -> RgbImage {
        // The buffer length is fixed at width * height * 3 by every constructor.
        ImageBuffer::from_raw(self.width, self.height, self.buffer)
            .unwrap_or_else(|| RgbImage::new(0, 0))
    }

    /// Encode and write the canvas; the format follows the file extension
    pub fn save(&self, path: impl AsRef<Path>) -> ImageResult<()> {
        self.clone().into_image().save(path)
    }
}
