use std::{fmt, sync::Arc};

/// A decoded image buffer, premultiplied BGRA8.
///
/// The pixel data is shared, cloning a `Bitmap` is cheap and clones observe
/// the same buffer. Cache entries and callers hold clones of the same bitmap.
#[derive(Clone)]
pub struct Bitmap(Arc<BitmapData>);

struct BitmapData {
    width: u32,
    height: u32,
    bgra: Box<[u8]>,
    is_opaque: bool,
}

impl Bitmap {
    /// New bitmap from premultiplied BGRA8 pixels.
    ///
    /// # Panics
    ///
    /// Panics if `bgra.len() != width * height * 4`.
    pub fn from_bgra8(width: u32, height: u32, bgra: Vec<u8>) -> Self {
        assert_eq!(
            bgra.len(),
            width as usize * height as usize * 4,
            "pixels.len() is not width * height * 4"
        );
        let is_opaque = bgra.chunks_exact(4).all(|c| c[3] == 255);
        Bitmap(Arc::new(BitmapData {
            width,
            height,
            bgra: bgra.into_boxed_slice(),
            is_opaque,
        }))
    }

    /// New bitmap fully filled with the `bgra` color.
    pub fn solid(width: u32, height: u32, bgra: [u8; 4]) -> Self {
        let mut data = vec![0u8; width as usize * height as usize * 4];
        for c in data.chunks_exact_mut(4) {
            c.copy_from_slice(&bgra);
        }
        Self::from_bgra8(width, height, data)
    }

    /// New zero-sized bitmap.
    pub fn empty() -> Self {
        Self::from_bgra8(0, 0, vec![])
    }

    /// Pixel width.
    pub fn width(&self) -> u32 {
        self.0.width
    }

    /// Pixel height.
    pub fn height(&self) -> u32 {
        self.0.height
    }

    /// Reference the premultiplied BGRA8 pixel bytes, `width * height * 4` long.
    pub fn pixels(&self) -> &[u8] {
        &self.0.bgra
    }

    /// If every pixel has full alpha.
    ///
    /// Computed once at construction.
    pub fn is_opaque(&self) -> bool {
        self.0.is_opaque
    }

    /// If the bitmap has zero area.
    pub fn is_empty(&self) -> bool {
        self.0.width == 0 || self.0.height == 0
    }

    /// Resident byte cost of the decoded pixels.
    pub fn byte_cost(&self) -> usize {
        self.0.bgra.len()
    }

    /// If both handles observe the same pixel buffer.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.0.width)
            .field("height", &self.0.height)
            .field("is_opaque", &self.0.is_opaque)
            .field("pixels", &format_args!("<{} bytes>", self.0.bgra.len()))
            .finish()
    }
}
impl PartialEq for Bitmap {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}
impl Eq for Bitmap {}

/// Encoded image format tag.
///
/// Identifies the format of an asset's encoded bytes, set from the loader's
/// declared format or sniffed at decode. Assets re-encoded during `forget`
/// update their tag if a fallback format was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum FormatTag {
    /// PNG, the lossless fallback used by `forget` re-encoding.
    Png,
    /// JPEG, no alpha channel.
    Jpeg,
    /// GIF.
    Gif,
    /// WebP.
    Webp,
    /// BMP.
    Bmp,
    /// Format not known, decoders must sniff the bytes.
    #[default]
    Unknown,
}
impl FormatTag {
    /// Tag from a file extension, case insensitive.
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Self::Png,
            "jpg" | "jpeg" => Self::Jpeg,
            "gif" => Self::Gif,
            "webp" => Self::Webp,
            "bmp" | "dib" => Self::Bmp,
            _ => Self::Unknown,
        }
    }

    /// Canonical file extension, empty for [`Unknown`].
    ///
    /// [`Unknown`]: Self::Unknown
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::Bmp => "bmp",
            Self::Unknown => "",
        }
    }
}
