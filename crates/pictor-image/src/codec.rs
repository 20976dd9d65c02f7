//! Encoded payload glue, decode to premultiplied BGRA8 and encode back.

use std::fmt;
use std::io::Cursor;

use image::{DynamicImage, ImageFormat};
use pictor_image_api::{Bitmap, FormatTag};

/// Decode failed.
#[derive(Debug)]
#[non_exhaustive]
pub enum DecodeError {
    /// Payload does not start with any known format signature and no usable
    /// format tag was provided.
    UnknownFormat,
    /// Decoded pixel buffer would exceed the configured limit.
    DecodedTooLarge {
        /// Pixel buffer length the payload declares.
        len: u64,
        /// Configured maximum.
        max: u64,
    },
    /// Decoder error.
    Decode(String),
}
impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::UnknownFormat => write!(f, "unknown image format"),
            DecodeError::DecodedTooLarge { len, max } => write!(f, "decoded size {len} exceeds limit {max}"),
            DecodeError::Decode(e) => write!(f, "decode error, {e}"),
        }
    }
}
impl std::error::Error for DecodeError {}
impl From<image::ImageError> for DecodeError {
    fn from(e: image::ImageError) -> Self {
        DecodeError::Decode(e.to_string())
    }
}

/// Encode failed.
#[derive(Debug)]
#[non_exhaustive]
pub enum EncodeError {
    /// No encoder for the format.
    UnsupportedFormat(FormatTag),
    /// Encoder error.
    Encode(String),
}
impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EncodeError::UnsupportedFormat(t) => write!(f, "no encoder for {t:?}"),
            EncodeError::Encode(e) => write!(f, "encode error, {e}"),
        }
    }
}
impl std::error::Error for EncodeError {}
impl From<image::ImageError> for EncodeError {
    fn from(e: image::ImageError) -> Self {
        EncodeError::Encode(e.to_string())
    }
}

fn image_format(tag: FormatTag) -> Option<ImageFormat> {
    match tag {
        FormatTag::Png => Some(ImageFormat::Png),
        FormatTag::Jpeg => Some(ImageFormat::Jpeg),
        FormatTag::Gif => Some(ImageFormat::Gif),
        FormatTag::Webp => Some(ImageFormat::WebP),
        FormatTag::Bmp => Some(ImageFormat::Bmp),
        _ => None,
    }
}

fn format_tag(format: ImageFormat) -> FormatTag {
    match format {
        ImageFormat::Png => FormatTag::Png,
        ImageFormat::Jpeg => FormatTag::Jpeg,
        ImageFormat::Gif => FormatTag::Gif,
        ImageFormat::WebP => FormatTag::Webp,
        ImageFormat::Bmp => FormatTag::Bmp,
        _ => FormatTag::Unknown,
    }
}

/// Pixel dimensions the payload declares, without decoding pixels.
pub fn dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let reader = image::ImageReader::new(Cursor::new(bytes)).with_guessed_format().ok()?;
    reader.into_dimensions().ok()
}

/// Decode `bytes` into a premultiplied BGRA8 bitmap.
///
/// The format is sniffed from the payload signature, `hint` is only used
/// when sniffing fails. Returns the actual format alongside the pixels.
///
/// `max_decoded_len` bounds the decoded buffer byte length, checked against
/// the declared header dimensions before any pixel is decoded.
pub fn decode(bytes: &[u8], hint: FormatTag, max_decoded_len: u64) -> Result<(Bitmap, FormatTag), DecodeError> {
    let format = match image::guess_format(bytes) {
        Ok(f) => f,
        Err(_) => image_format(hint).ok_or(DecodeError::UnknownFormat)?,
    };

    if let Some((w, h)) = dimensions(bytes) {
        let len = w as u64 * h as u64 * 4;
        if len > max_decoded_len {
            return Err(DecodeError::DecodedTooLarge { len, max: max_decoded_len });
        }
    }

    let img = image::load_from_memory_with_format(bytes, format)?;
    Ok((dynamic_to_bitmap(img), format_tag(format)))
}

fn dynamic_to_bitmap(img: DynamicImage) -> Bitmap {
    let (w, h) = (img.width(), img.height());
    let mut pixels = img.into_rgba8().into_raw();
    rgba_to_pre_mul_bgra(&mut pixels);
    Bitmap::from_bgra8(w, h, pixels)
}

/// Encode a bitmap.
///
/// Pixels are unmultiplied before encoding; JPEG and opaque payloads encode
/// without the alpha channel.
pub fn encode(bmp: &Bitmap, tag: FormatTag) -> Result<Vec<u8>, EncodeError> {
    let format = image_format(tag).ok_or(EncodeError::UnsupportedFormat(tag))?;

    let mut rgba = bmp.pixels().to_vec();
    pre_mul_bgra_to_rgba(&mut rgba);

    let mut out = Cursor::new(vec![]);
    if tag == FormatTag::Jpeg || bmp.is_opaque() {
        let rgb: Vec<u8> = rgba.chunks_exact(4).flat_map(|p| [p[0], p[1], p[2]]).collect();
        image::write_buffer_with_format(&mut out, &rgb, bmp.width(), bmp.height(), image::ExtendedColorType::Rgb8, format)?;
    } else {
        image::write_buffer_with_format(&mut out, &rgba, bmp.width(), bmp.height(), image::ExtendedColorType::Rgba8, format)?;
    }
    Ok(out.into_inner())
}

/// In-place RGBA8 to premultiplied BGRA8.
pub fn rgba_to_pre_mul_bgra(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(4) {
        let a = px[3] as u32;
        let b = (px[2] as u32 * a).div_ceil(255).min(255) as u8;
        let g = (px[1] as u32 * a).div_ceil(255).min(255) as u8;
        let r = (px[0] as u32 * a).div_ceil(255).min(255) as u8;
        px[0] = b;
        px[1] = g;
        px[2] = r;
    }
}

/// In-place premultiplied BGRA8 to straight RGBA8.
pub fn pre_mul_bgra_to_rgba(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(4) {
        let a = px[3] as u32;
        let (b, g, r) = if a == 0 {
            (0, 0, 0)
        } else {
            (
                (px[0] as u32 * 255 / a).min(255) as u8,
                (px[1] as u32 * 255 / a).min(255) as u8,
                (px[2] as u32 * 255 / a).min(255) as u8,
            )
        };
        px[0] = r;
        px[1] = g;
        px[2] = b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_png() -> Vec<u8> {
        let mut buf = Cursor::new(vec![]);
        let px = image::RgbaImage::from_pixel(4, 3, image::Rgba([10, 20, 30, 255]));
        px.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn decode_sniffs_format() {
        let bytes = sample_png();
        let (bmp, tag) = decode(&bytes, FormatTag::Unknown, u64::MAX).unwrap();
        assert_eq!(tag, FormatTag::Png);
        assert_eq!((bmp.width(), bmp.height()), (4, 3));
        assert!(bmp.is_opaque());
        // BGRA order.
        assert_eq!(&bmp.pixels()[..4], &[30, 20, 10, 255]);
    }

    #[test]
    fn decode_respects_decoded_limit() {
        let bytes = sample_png();
        let r = decode(&bytes, FormatTag::Unknown, 7);
        assert!(matches!(r, Err(DecodeError::DecodedTooLarge { len: 48, max: 7 })));
    }

    #[test]
    fn garbage_is_unknown_format() {
        let r = decode(&[0, 1, 2, 3], FormatTag::Unknown, u64::MAX);
        assert!(matches!(r, Err(DecodeError::UnknownFormat)));
    }

    #[test]
    fn encode_round_trip() {
        let bmp = Bitmap::solid(5, 5, [40, 80, 120, 255]);
        let bytes = encode(&bmp, FormatTag::Png).unwrap();
        let (back, tag) = decode(&bytes, FormatTag::Unknown, u64::MAX).unwrap();
        assert_eq!(tag, FormatTag::Png);
        assert_eq!(back.pixels(), bmp.pixels());
    }

    #[test]
    fn encode_unknown_is_error() {
        let bmp = Bitmap::solid(1, 1, [0, 0, 0, 255]);
        assert!(matches!(encode(&bmp, FormatTag::Unknown), Err(EncodeError::UnsupportedFormat(_))));
    }

    #[test]
    fn pre_mul_round_trip_opaque() {
        let mut px = vec![10, 20, 30, 255];
        rgba_to_pre_mul_bgra(&mut px);
        assert_eq!(px, [30, 20, 10, 255]);
        pre_mul_bgra_to_rgba(&mut px);
        assert_eq!(px, [10, 20, 30, 255]);
    }
}
