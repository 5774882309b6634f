//! Burn bounding boxes and `<zone> <duration>s` labels into an outbound frame.

use crate::detect::{BoundingBox, MovementEvent};
use crate::frame::{Frame, PixelFormat};

const BOX_THICKNESS: u32 = 2;
const GLYPH_SCALE: u32 = 2;
const GLYPH_W: u32 = 3;
const GLYPH_H: u32 = 5;
const GLYPH_ADVANCE: u32 = (GLYPH_W + 1) * GLYPH_SCALE;

/// Rows of a 3x5 glyph, high bit on the left.
fn glyph(c: char) -> [u8; 5] {
    match c {
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b111, 0b001, 0b111, 0b100, 0b111],
        '3' => [0b111, 0b001, 0b111, 0b001, 0b111],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b111, 0b001, 0b111],
        '6' => [0b111, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b001, 0b001, 0b001],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b111],
        '.' => [0b000, 0b000, 0b000, 0b000, 0b010],
        '_' => [0b000, 0b000, 0b000, 0b000, 0b111],
        'a' => [0b010, 0b101, 0b111, 0b101, 0b101],
        'd' => [0b110, 0b101, 0b101, 0b101, 0b110],
        'e' => [0b111, 0b100, 0b110, 0b100, 0b111],
        'f' => [0b111, 0b100, 0b110, 0b100, 0b100],
        'g' => [0b111, 0b100, 0b101, 0b101, 0b111],
        'h' => [0b101, 0b101, 0b111, 0b101, 0b101],
        'i' => [0b111, 0b010, 0b010, 0b010, 0b111],
        'l' => [0b100, 0b100, 0b100, 0b100, 0b111],
        'm' => [0b101, 0b111, 0b111, 0b101, 0b101],
        'r' => [0b110, 0b101, 0b110, 0b101, 0b101],
        's' => [0b111, 0b100, 0b111, 0b001, 0b111],
        't' => [0b111, 0b010, 0b010, 0b010, 0b010],
        _ => [0; 5],
    }
}

struct Canvas {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl Canvas {
    fn put(&mut self, x: u32, y: u32) {
        if x >= self.width || y >= self.height {
            return;
        }
        let bpp = self.format.bytes_per_pixel();
        let at = (y as usize * self.width as usize + x as usize) * bpp;
        let color: &[u8] = match self.format {
            PixelFormat::Gray8 => &[255],
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => &[0, 255, 0],
        };
        self.pixels[at..at + bpp].copy_from_slice(color);
    }

    fn fill(&mut self, x0: u32, y0: u32, w: u32, h: u32) {
        for y in y0..y0.saturating_add(h).min(self.height) {
            for x in x0..x0.saturating_add(w).min(self.width) {
                self.put(x, y);
            }
        }
    }

    fn rect(&mut self, bbox: &BoundingBox) {
        let t = BOX_THICKNESS;
        let right = (bbox.x + bbox.width).saturating_sub(t);
        let bottom = (bbox.y + bbox.height).saturating_sub(t);
        self.fill(bbox.x, bbox.y, bbox.width, t);
        self.fill(bbox.x, bottom, bbox.width, t);
        self.fill(bbox.x, bbox.y, t, bbox.height);
        self.fill(right, bbox.y, t, bbox.height);
    }

    fn text(&mut self, x0: u32, y0: u32, text: &str) {
        let mut x = x0;
        for c in text.chars() {
            for (row, bits) in glyph(c).iter().enumerate() {
                for col in 0..GLYPH_W {
                    if bits & (1 << (GLYPH_W - 1 - col)) != 0 {
                        self.fill(
                            x + col * GLYPH_SCALE,
                            y0 + row as u32 * GLYPH_SCALE,
                            GLYPH_SCALE,
                            GLYPH_SCALE,
                        );
                    }
                }
            }
            x += GLYPH_ADVANCE;
            if x >= self.width {
                break;
            }
        }
    }
}

pub fn label(event: &MovementEvent) -> String {
    format!("{} {:.1}s", event.zone, event.duration_s)
}

/// Copy of `frame`'s pixels with one box and label per event.
pub fn render(frame: &Frame, events: &[MovementEvent]) -> Vec<u8> {
    let geometry = frame.geometry();
    let mut canvas = Canvas {
        pixels: frame.copy_pixels(),
        width: geometry.width,
        height: geometry.height,
        format: geometry.format,
    };
    let label_h = GLYPH_H * GLYPH_SCALE;
    for event in events {
        canvas.rect(&event.bbox);
        let y = if event.bbox.y >= label_h + 2 {
            event.bbox.y - label_h - 2
        } else {
            event.bbox.y + event.bbox.height + 2
        };
        canvas.text(event.bbox.x, y, &label(event));
    }
    canvas.pixels
}
