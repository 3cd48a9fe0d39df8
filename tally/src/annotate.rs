//! Frame annotation: tracked-person boxes, identity labels, and the global
//! count / FPS overlay, stamped onto the RGB frame before JPEG encoding.

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use rusttype::{point, Font, Scale};

use tally_types::BoundingBox;

const LABEL_SCALE: f32 = 18.0;
const OVERLAY_SCALE: f32 = 24.0;

/// One labelled box to draw.
pub struct Annotation {
    pub bbox: BoundingBox,
    pub label: String,
    pub color: Rgb<u8>,
}

pub struct Renderer {
    font: Font<'static>,
}

impl Renderer {
    pub fn new() -> Self {
        let font_data = ttf_firacode::REGULAR;
        // This only succeeds if collection consists of one font
        let font = Font::try_from_bytes(font_data as &[u8]).expect("Error constructing Font");
        Self { font }
    }

    /// Draw all annotations plus the overlay line (count and FPS) in place.
    pub fn annotate(&self, image: &mut RgbImage, annotations: &[Annotation], overlay: &str) {
        let (w, h) = image.dimensions();
        for ann in annotations {
            let b = ann.bbox.clamp_to(w, h);
            let bw = b.width() as u32;
            let bh = b.height() as u32;
            if bw < 2 || bh < 2 {
                continue;
            }
            let rect = Rect::at(b.x1 as i32, b.y1 as i32).of_size(bw, bh);
            draw_hollow_rect_mut(image, rect, ann.color);
            // second rectangle for a 2 px stroke
            if bw > 4 && bh > 4 {
                let inner = Rect::at(b.x1 as i32 + 1, b.y1 as i32 + 1).of_size(bw - 2, bh - 2);
                draw_hollow_rect_mut(image, inner, ann.color);
            }

            let label_y = (b.y1 - LABEL_SCALE - 2.0).max(0.0);
            self.draw_text(image, b.x1, label_y, LABEL_SCALE, ann.color, &ann.label);
        }

        self.draw_text(
            image,
            8.0,
            8.0,
            OVERLAY_SCALE,
            Rgb([255, 255, 255]),
            overlay,
        );
    }

    /// Rasterize `text` with alpha blending against the existing pixels.
    fn draw_text(
        &self,
        image: &mut RgbImage,
        x0: f32,
        y0: f32,
        size: f32,
        color: Rgb<u8>,
        text: &str,
    ) {
        let scale = Scale::uniform(size);
        let v_metrics = self.font.v_metrics(scale);
        let glyphs: Vec<_> = self
            .font
            .layout(text, scale, point(x0, y0 + v_metrics.ascent))
            .collect();

        let (w, h) = image.dimensions();
        for glyph in glyphs {
            if let Some(bb) = glyph.pixel_bounding_box() {
                glyph.draw(|gx, gy, coverage| {
                    let x = gx as i32 + bb.min.x;
                    let y = gy as i32 + bb.min.y;
                    if x < 0 || y < 0 || x >= w as i32 || y >= h as i32 {
                        return;
                    }
                    let pixel = image.get_pixel_mut(x as u32, y as u32);
                    let p = 1.0 - coverage;
                    for c in 0..3 {
                        pixel[c] =
                            (pixel[c] as f32 * p + color[c] as f32 * coverage).round() as u8;
                    }
                });
            }
        }
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable per-identity color from the golden-angle hue sequence, so the same
/// global id renders the same color on every camera and every frame.
pub fn id_color(id: u64) -> Rgb<u8> {
    let hue = (id as f32 * 137.508) % 360.0;
    hsv_to_rgb(hue, 0.8, 0.95)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
    let c = v * s;
    let hp = h / 60.0;
    let x = c * (1.0 - (hp % 2.0 - 1.0).abs());
    let (r, g, b) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = v - c;
    Rgb([
        ((r + m) * 255.0).round() as u8,
        ((g + m) * 255.0).round() as u8,
        ((b + m) * 255.0).round() as u8,
    ])
}
