//! Pixel transform pipeline.
//!
//! All transforms take and return premultiplied BGRA8 [`Bitmap`] values and
//! never modify the input, an identity transform returns a cheap clone that
//! shares the pixel buffer.

use std::sync::Arc;

use image::imageops::FilterType;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use pictor_image_api::Bitmap;
use rustc_hash::FxHashMap;

bitflags::bitflags! {
    /// Requested variant transforms.
    ///
    /// Corner flags only apply together with one of the `ROUNDED_*` flags,
    /// no corner flag selects all four corners.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PixOptions: u32 {
        /// Resample with a smooth filter instead of nearest-neighbor.
        const SMOOTH = 1 << 0;
        /// Blur before scaling.
        const BLURRED = 1 << 1;
        /// Mask to an ellipse covering the full output.
        const CIRCLED = 1 << 2;
        /// Round the selected corners with the large radius.
        const ROUNDED_LARGE = 1 << 3;
        /// Round the selected corners with the small radius.
        const ROUNDED_SMALL = 1 << 4;
        /// Round the top-left corner.
        const ROUND_TOP_LEFT = 1 << 5;
        /// Round the top-right corner.
        const ROUND_TOP_RIGHT = 1 << 6;
        /// Round the bottom-left corner.
        const ROUND_BOTTOM_LEFT = 1 << 7;
        /// Round the bottom-right corner.
        const ROUND_BOTTOM_RIGHT = 1 << 8;
        /// Tint using the alpha channel, see [`colorize`].
        const COLORED = 1 << 9;
        /// Letterbox fill is transparent instead of the opaque background.
        const TRANSPARENT_BACKGROUND = 1 << 10;
        /// Composite onto the opaque background as the last step.
        const OPAQUE = 1 << 11;
    }
}
impl PixOptions {
    /// All four `ROUND_*` corner flags.
    pub const fn round_all() -> PixOptions {
        PixOptions::ROUND_TOP_LEFT
            .union(PixOptions::ROUND_TOP_RIGHT)
            .union(PixOptions::ROUND_BOTTOM_LEFT)
            .union(PixOptions::ROUND_BOTTOM_RIGHT)
    }

    fn corners(self) -> PixOptions {
        let c = self.intersection(Self::round_all());
        if c.is_empty() { Self::round_all() } else { c }
    }
}

/// Corner radius selected by [`PixOptions::ROUNDED_SMALL`].
pub const RADIUS_SMALL: u32 = 4;
/// Corner radius selected by [`PixOptions::ROUNDED_LARGE`].
pub const RADIUS_LARGE: u32 = 8;

const BLUR_RADIUS: usize = 3;

/// Letterbox and `OPAQUE` background, premultiplied BGRA.
pub const OPAQUE_BG: [u8; 4] = [255, 255, 255, 255];

/// Run the full variant pipeline.
///
/// Order is blur, scale to `w`/`h`, letterbox into `outer`, circle or corner
/// mask, tint, opaque composite. `w == 0` skips scaling, `h == 0` scales to
/// `w` preserving the aspect ratio. Steps that end up as identities are
/// skipped, requesting no transform at all returns a clone of `src`.
pub fn prepare(src: &Bitmap, w: u32, h: u32, outer: Option<(u32, u32)>, options: PixOptions, tint: Option<[u8; 4]>) -> Bitmap {
    let mut img = src.clone();
    if options.contains(PixOptions::BLURRED) {
        img = blur(&img);
    }
    let smooth = options.intersects(PixOptions::SMOOTH | PixOptions::BLURRED);
    img = scale(&img, w, h, smooth);
    if let Some((ow, oh)) = outer {
        if ow > 0 && oh > 0 && (ow != img.width() || oh != img.height()) {
            let bg = if options.contains(PixOptions::TRANSPARENT_BACKGROUND) {
                [0, 0, 0, 0]
            } else {
                OPAQUE_BG
            };
            img = fit_into_canvas(&img, ow, oh, bg);
        }
    }
    if options.contains(PixOptions::CIRCLED) {
        img = circle(&img);
    } else if options.contains(PixOptions::ROUNDED_LARGE) {
        img = round_corners(&img, RADIUS_LARGE, options.corners());
    } else if options.contains(PixOptions::ROUNDED_SMALL) {
        img = round_corners(&img, RADIUS_SMALL, options.corners());
    }
    if let Some(t) = tint {
        img = colorize(&img, t);
    }
    if options.contains(PixOptions::OPAQUE) {
        img = prepare_opaque(&img, OPAQUE_BG);
    }
    img
}

/// Scale to `w`×`h`.
///
/// `w == 0` is an identity, `h == 0` preserves the aspect ratio.
pub fn scale(src: &Bitmap, w: u32, h: u32, smooth: bool) -> Bitmap {
    if src.is_empty() || w == 0 || (w == src.width() && (h == 0 || h == src.height())) {
        return src.clone();
    }
    let h = if h == 0 {
        let sh = (src.height() as u64 * w as u64) / src.width() as u64;
        sh.max(1) as u32
    } else {
        h
    };
    resize(src, w, h, smooth)
}

fn resize(src: &Bitmap, w: u32, h: u32, smooth: bool) -> Bitmap {
    // channel order does not matter for resampling, reuse the RGBA buffer.
    let Some(buf) = image::RgbaImage::from_raw(src.width(), src.height(), src.pixels().to_vec()) else {
        return src.clone();
    };
    let filter = if smooth { FilterType::Triangle } else { FilterType::Nearest };
    let out = image::imageops::resize(&buf, w, h, filter);
    Bitmap::from_bgra8(w, h, out.into_raw())
}

/// Box the input would be scaled to by [`scale`] with `h == 0`.
pub fn scaled_to_width(src: &Bitmap, w: u32) -> (u32, u32) {
    if src.is_empty() || w == 0 {
        return (src.width(), src.height());
    }
    let sh = (src.height() as u64 * w as u64) / src.width() as u64;
    (w, sh.max(1) as u32)
}

/// Fast triangular blur, radius 3.
///
/// Images with either dimension at or below `7` pass through unchanged.
/// Translucent images are first drawn scaled down into a transparent canvas
/// inset by the radius on every side, so the blur can bleed the edges out.
pub fn blur(src: &Bitmap) -> Bitmap {
    let (w, h) = (src.width() as usize, src.height() as usize);
    let div = BLUR_RADIUS * 2 + 1;
    if div >= w || div >= h {
        return src.clone();
    }

    let mut pix;
    if src.is_opaque() {
        pix = src.pixels().to_vec();
    } else {
        let r = BLUR_RADIUS as u32;
        let inner = resize(src, src.width() - 2 * r, src.height() - 2 * r, true);
        pix = vec![0u8; w * h * 4];
        let iw = inner.width() as usize;
        for y in 0..inner.height() as usize {
            let src_row = &inner.pixels()[y * iw * 4..(y + 1) * iw * 4];
            let o = ((y + BLUR_RADIUS) * w + BLUR_RADIUS) * 4;
            pix[o..o + iw * 4].copy_from_slice(src_row);
        }
    }

    fast_blur(&mut pix, w, h);
    Bitmap::from_bgra8(w as u32, h as u32, pix)
}

// Two-pass sliding triangular filter, kernel [1,2,3,4,3,2,1] / 16, the four
// channels packed 16 bits apart in a u64. Each pass reads only the previous
// pass's buffer, the window updates must never observe their own output. The
// running sums wrap, the field mask keeps the per-channel values in range.
fn fast_blur(pix: &mut [u8], w: usize, h: usize) {
    const R: usize = BLUR_RADIUS;
    const R1: usize = R + 1;
    const MASK: u64 = 0x00FF_00FF_00FF_00FF;

    let mut src = vec![0u64; w * h];
    for (packed, px) in src.iter_mut().zip(pix.chunks_exact(4)) {
        *packed = px[0] as u64 | (px[1] as u64) << 16 | (px[2] as u64) << 32 | (px[3] as u64) << 48;
    }
    let mut rgb = vec![0u64; w * h];

    for y in 0..h {
        let yw = y * w;
        let cur = src[yw];
        let mut sum = cur.wrapping_mul(((R1 * (R1 + 1)) >> 1) as u64);
        let mut allsum = (R as u64).wrapping_neg().wrapping_mul(cur);
        for i in 1..=R {
            let cur = src[yw + i];
            sum = sum.wrapping_add(cur.wrapping_mul((R1 - i) as u64));
            allsum = allsum.wrapping_add(cur);
        }
        let mut step = |x: usize, start: usize, middle: usize, end: usize| {
            rgb[yw + x] = (sum >> 4) & MASK;
            allsum = allsum
                .wrapping_add(src[yw + start])
                .wrapping_sub(src[yw + middle].wrapping_mul(2))
                .wrapping_add(src[yw + end]);
            sum = sum.wrapping_add(allsum);
        };
        let mut x = 0;
        while x < R1 {
            step(x, 0, x, x + R1);
            x += 1;
        }
        while x < w - R1 {
            step(x, x - R1, x, x + R1);
            x += 1;
        }
        while x < w {
            step(x, x - R1, x, w - 1);
            x += 1;
        }
    }

    for x in 0..w {
        let cur = rgb[x];
        let mut sum = cur.wrapping_mul(((R1 * (R1 + 1)) >> 1) as u64);
        let mut allsum = (R as u64).wrapping_neg().wrapping_mul(cur);
        for i in 1..=R {
            let cur = rgb[x + i * w];
            sum = sum.wrapping_add(cur.wrapping_mul((R1 - i) as u64));
            allsum = allsum.wrapping_add(cur);
        }
        let mut step = |y: usize, start: usize, middle: usize, end: usize| {
            let res = sum >> 4;
            let o = (y * w + x) * 4;
            pix[o] = res as u8;
            pix[o + 1] = (res >> 16) as u8;
            pix[o + 2] = (res >> 32) as u8;
            pix[o + 3] = (res >> 48) as u8;
            allsum = allsum
                .wrapping_add(rgb[x + start * w])
                .wrapping_sub(rgb[x + middle * w].wrapping_mul(2))
                .wrapping_add(rgb[x + end * w]);
            sum = sum.wrapping_add(allsum);
        };
        let mut y = 0;
        while y < R1 {
            step(y, 0, y, y + R1);
            y += 1;
        }
        while y < h - R1 {
            step(y, y - R1, y, y + R1);
            y += 1;
        }
        while y < h {
            step(y, y - R1, y, h - 1);
            y += 1;
        }
    }
}

static CIRCLE_MASKS: Lazy<Mutex<FxHashMap<(u32, u32), Arc<[u8]>>>> = Lazy::new(|| Mutex::new(FxHashMap::default()));
static CORNER_MASKS: Lazy<Mutex<FxHashMap<u32, Arc<[u8]>>>> = Lazy::new(|| Mutex::new(FxHashMap::default()));

// 4x4 supersampled coverage, 0..=255.
fn coverage(px: u32, py: u32, inside: impl Fn(f64, f64) -> bool) -> u8 {
    let mut hits = 0u32;
    for sy in 0..4 {
        for sx in 0..4 {
            let x = px as f64 + (sx as f64 + 0.5) / 4.0;
            let y = py as f64 + (sy as f64 + 0.5) / 4.0;
            if inside(x, y) {
                hits += 1;
            }
        }
    }
    (hits * 255 / 16) as u8
}

fn circle_mask(w: u32, h: u32) -> Arc<[u8]> {
    let mut masks = CIRCLE_MASKS.lock();
    if let Some(m) = masks.get(&(w, h)) {
        return m.clone();
    }
    let (cx, cy) = (w as f64 / 2.0, h as f64 / 2.0);
    let mut mask = Vec::with_capacity(w as usize * h as usize);
    for y in 0..h {
        for x in 0..w {
            mask.push(coverage(x, y, |x, y| {
                let dx = (x - cx) / cx;
                let dy = (y - cy) / cy;
                dx * dx + dy * dy <= 1.0
            }));
        }
    }
    let mask: Arc<[u8]> = mask.into();
    masks.insert((w, h), mask.clone());
    mask
}

// Top-left quadrant, radius x radius, circle centered at (radius, radius).
fn corner_mask(radius: u32) -> Arc<[u8]> {
    let mut masks = CORNER_MASKS.lock();
    if let Some(m) = masks.get(&radius) {
        return m.clone();
    }
    let r = radius as f64;
    let mut mask = Vec::with_capacity(radius as usize * radius as usize);
    for y in 0..radius {
        for x in 0..radius {
            mask.push(coverage(x, y, |x, y| {
                let dx = x - r;
                let dy = y - r;
                dx * dx + dy * dy <= r * r
            }));
        }
    }
    let mask: Arc<[u8]> = mask.into();
    masks.insert(radius, mask.clone());
    mask
}

fn apply_mask_px(px: &mut [u8], mask: u8) {
    let m = mask as u32 + 1;
    px[0] = ((px[0] as u32 * m) >> 8) as u8;
    px[1] = ((px[1] as u32 * m) >> 8) as u8;
    px[2] = ((px[2] as u32 * m) >> 8) as u8;
    px[3] = ((px[3] as u32 * m) >> 8) as u8;
}

/// Mask to an ellipse covering the full image.
pub fn circle(src: &Bitmap) -> Bitmap {
    let (w, h) = (src.width(), src.height());
    if src.is_empty() {
        return src.clone();
    }
    let mask = circle_mask(w, h);
    let mut pix = src.pixels().to_vec();
    for (px, m) in pix.chunks_exact_mut(4).zip(mask.iter()) {
        apply_mask_px(px, *m);
    }
    Bitmap::from_bgra8(w, h, pix)
}

/// Round the corners selected by the `ROUND_*` flags in `corners`.
///
/// Images smaller than `2 * radius` in either dimension pass through
/// unchanged.
pub fn round_corners(src: &Bitmap, radius: u32, corners: PixOptions) -> Bitmap {
    let (w, h) = (src.width(), src.height());
    if radius == 0 || w < 2 * radius || h < 2 * radius {
        return src.clone();
    }
    let mask = corner_mask(radius);
    let r = radius as usize;
    let (w, h) = (w as usize, h as usize);
    let mut pix = src.pixels().to_vec();
    let corners = corners.corners();
    for my in 0..r {
        for mx in 0..r {
            let m = mask[my * r + mx];
            if m == 255 {
                continue;
            }
            if corners.contains(PixOptions::ROUND_TOP_LEFT) {
                apply_mask_px(&mut pix[(my * w + mx) * 4..][..4], m);
            }
            if corners.contains(PixOptions::ROUND_TOP_RIGHT) {
                apply_mask_px(&mut pix[(my * w + (w - 1 - mx)) * 4..][..4], m);
            }
            if corners.contains(PixOptions::ROUND_BOTTOM_LEFT) {
                apply_mask_px(&mut pix[((h - 1 - my) * w + mx) * 4..][..4], m);
            }
            if corners.contains(PixOptions::ROUND_BOTTOM_RIGHT) {
                apply_mask_px(&mut pix[((h - 1 - my) * w + (w - 1 - mx)) * 4..][..4], m);
            }
        }
    }
    Bitmap::from_bgra8(w as u32, h as u32, pix)
}

/// Tint using the pixel alpha as the mix factor.
///
/// `tint` is premultiplied BGRA like the pixels. Fully transparent pixels
/// pass through, fully opaque pixels mix toward the tint scaled by the tint
/// alpha.
pub fn colorize(src: &Bitmap, tint: [u8; 4]) -> Bitmap {
    let mut pix = src.pixels().to_vec();
    let ta = tint[3] as i32;
    for px in pix.chunks_exact_mut(4) {
        let a = px[3] as i32;
        let aca = a * ta;
        for c in 0..3 {
            let v = px[c] as i32;
            px[c] = (v + ((aca * (tint[c] as i32 - v)) >> 16)).clamp(0, 255) as u8;
        }
        px[3] = (a + ((aca * (255 - a)) >> 16)).clamp(0, 255) as u8;
    }
    Bitmap::from_bgra8(src.width(), src.height(), pix)
}

/// Composite onto an opaque background, output alpha is `255` everywhere.
pub fn prepare_opaque(src: &Bitmap, bg: [u8; 4]) -> Bitmap {
    if src.is_opaque() {
        return src.clone();
    }
    let mut pix = src.pixels().to_vec();
    for px in pix.chunks_exact_mut(4) {
        let a = px[3] as u32;
        for c in 0..3 {
            px[c] = ((px[c] as u32 * 256 + bg[c] as u32 * (256 - a)) >> 8).min(255) as u8;
        }
        px[3] = 255;
    }
    Bitmap::from_bgra8(src.width(), src.height(), pix)
}

/// Center into a `w`×`h` canvas filled with `bg`, clipping if smaller.
///
/// `bg` is premultiplied BGRA, the input composites over it.
pub fn fit_into_canvas(src: &Bitmap, w: u32, h: u32, bg: [u8; 4]) -> Bitmap {
    if w == src.width() && h == src.height() {
        return src.clone();
    }
    let mut pix = Vec::with_capacity(w as usize * h as usize * 4);
    for _ in 0..w as usize * h as usize {
        pix.extend_from_slice(&bg);
    }

    let dx = (w as i64 - src.width() as i64) / 2;
    let dy = (h as i64 - src.height() as i64) / 2;
    let sp = src.pixels();
    let sw = src.width() as i64;
    for sy in 0..src.height() as i64 {
        let cy = sy + dy;
        if cy < 0 || cy >= h as i64 {
            continue;
        }
        for sx in 0..sw {
            let cx = sx + dx;
            if cx < 0 || cx >= w as i64 {
                continue;
            }
            let s = &sp[((sy * sw + sx) * 4) as usize..][..4];
            let d = &mut pix[((cy * w as i64 + cx) * 4) as usize..][..4];
            let ia = 255 - s[3] as u32;
            for c in 0..4 {
                d[c] = (s[c] as u32 + d[c] as u32 * ia / 255).min(255) as u8;
            }
        }
    }
    Bitmap::from_bgra8(w, h, pix)
}
