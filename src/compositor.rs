//! Fill-crop compositing and slot layout.
//!
//! `fill_crop` scales a frame so it covers the target rectangle (never
//! letterboxes), then cuts the centred target-sized window out of the scaled
//! image. When the centred window would overflow an edge it is shifted back
//! inside, never shrunk. All functions here are pure.

use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::frame::Frame;

/// Axis-aligned rectangle in display pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Size of the covering intermediate image, or `None` when either side is zero.
///
/// The scale is `max(tw / w, th / h)`. Each side is floored and then raised to
/// at least the target side, so float rounding never leaves the scaled image a
/// pixel short of the crop.
pub fn scaled_size(src: (u32, u32), target: (u32, u32)) -> Option<(u32, u32)> {
    let (w, h) = src;
    let (tw, th) = target;
    if w == 0 || h == 0 || tw == 0 || th == 0 {
        return None;
    }
    let scale = (tw as f64 / w as f64).max(th as f64 / h as f64);
    let nw = ((w as f64 * scale).floor() as u32).max(tw);
    let nh = ((h as f64 * scale).floor() as u32).max(th);
    Some((nw, nh))
}

/// Top-left corner of the centred `target` window inside `scaled`, clamped
/// so the window stays within bounds.
pub fn crop_origin(scaled: (u32, u32), target: (u32, u32)) -> (u32, u32) {
    let axis = |outer: u32, inner: u32| -> u32 {
        let centred = (outer / 2).saturating_sub(inner / 2);
        centred.min(outer.saturating_sub(inner))
    };
    (axis(scaled.0, target.0), axis(scaled.1, target.1))
}

/// Scale-to-cover then centre-crop `image` to exactly `width x height`.
///
/// Returns `None` ("not ready") for a zero target or an empty image.
pub fn fill_crop_image(image: &RgbImage, width: u32, height: u32) -> Option<RgbImage> {
    let src = image.dimensions();
    let (nw, nh) = scaled_size(src, (width, height))?;

    let scaled = if (nw, nh) == src {
        image.clone()
    } else if nw <= src.0 && nh <= src.1 {
        // Area-averaging downscale.
        imageops::thumbnail(image, nw, nh)
    } else {
        imageops::resize(image, nw, nh, FilterType::Triangle)
    };

    let (x, y) = crop_origin((nw, nh), (width, height));
    Some(imageops::crop_imm(&scaled, x, y, width, height).to_image())
}

/// `fill_crop_image` for a captured frame. `None` frame means not ready.
pub fn fill_crop(frame: Option<&Frame>, width: u32, height: u32) -> Option<RgbImage> {
    let frame = frame?;
    if frame.is_empty() {
        return None;
    }
    fill_crop_image(&frame.image, width, height)
}

/// Slot rectangles for a display of `width x height` holding `slots` slots.
///
/// One slot fills the display. More slots form a grid with `ceil(sqrt(n))`
/// columns and as many rows as needed, each cell inset by `padding` on every
/// side. Integer division leaves any remainder pixels unused on the right and
/// bottom edges.
pub fn slot_rects(slots: usize, width: u32, height: u32, padding: u32) -> Vec<Rect> {
    if slots == 0 {
        return Vec::new();
    }
    if slots == 1 {
        return vec![inset(Rect::new(0, 0, width, height), padding)];
    }

    let cols = (slots as f64).sqrt().ceil() as u32;
    let rows = (slots as u32).div_ceil(cols);
    let cell_w = width / cols;
    let cell_h = height / rows;

    (0..slots as u32)
        .map(|index| {
            let cell = Rect::new(
                (index % cols) * cell_w,
                (index / cols) * cell_h,
                cell_w,
                cell_h,
            );
            inset(cell, padding)
        })
        .collect()
}

fn inset(rect: Rect, padding: u32) -> Rect {
    let pad_x = padding.min(rect.width / 2);
    let pad_y = padding.min(rect.height / 2);
    Rect::new(
        rect.x + pad_x,
        rect.y + pad_y,
        rect.width - 2 * pad_x,
        rect.height - 2 * pad_y,
    )
}
