use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use pictor_image_api::{AssetKey, AssetLoader, Bitmap, FormatTag, LoadFrom, LoaderHandle, LoaderRequest, RemoteLocation};
use rustc_hash::FxHashMap;

use crate::transform::{self, PixOptions};
use crate::{codec, AssetLimits, MemoryBudget};

pub(crate) type LoaderFactory = Arc<Mutex<Box<dyn AssetLoader>>>;

/// Where an asset's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AssetSource {
    /// Bytes provided by the caller, never fetched.
    Local,
    /// Asset in the remote store.
    Remote,
    /// Asset fetched over HTTP.
    Web,
    /// Remote asset whose storage location is not known yet.
    ///
    /// Load requests queue as flags and replay when
    /// [`set_remote_location`] provides the location.
    ///
    /// [`set_remote_location`]: ImageAsset::set_remote_location
    DeferredRemote,
}

enum LoaderState {
    Idle,
    Loading(Box<dyn LoaderHandle>),
    Done,
    /// A fetch failed or was cancelled, the asset never loads again until
    /// explicitly reset.
    Cancelled,
}
impl LoaderState {
    fn name(&self) -> &'static str {
        match self {
            LoaderState::Idle => "Idle",
            LoaderState::Loading(_) => "Loading",
            LoaderState::Done => "Done",
            LoaderState::Cancelled => "Cancelled",
        }
    }
}

/// Asset failed operation error.
#[derive(Debug)]
#[non_exhaustive]
pub enum AssetError {
    /// Encoded payload exceeds [`AssetLimits::max_encoded_len`].
    EncodedTooLarge {
        /// Payload length.
        len: u64,
        /// Configured maximum.
        max: u64,
    },
    /// Payload did not decode.
    Decode(codec::DecodeError),
}
impl fmt::Display for AssetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AssetError::EncodedTooLarge { len, max } => write!(f, "encoded size {len} exceeds limit {max}"),
            AssetError::Decode(e) => write!(f, "{e}"),
        }
    }
}
impl std::error::Error for AssetError {}
impl From<codec::DecodeError> for AssetError {
    fn from(e: codec::DecodeError) -> Self {
        AssetError::Decode(e)
    }
}

/// Key of a cached sized variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct VariantKey {
    w: u32,
    h: u32,
    options: PixOptions,
    tint: Option<[u8; 4]>,
}

/// Key of the single letterboxed slot, the outer box is not part of the key,
/// a request with a different box replaces the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SingleKey {
    options: PixOptions,
    tint: Option<[u8; 4]>,
}

/// Cached transform outputs of one asset.
#[derive(Default)]
pub struct VariantCache {
    map: FxHashMap<VariantKey, Bitmap>,
    single: Option<(SingleKey, Bitmap)>,
}
impl VariantCache {
    /// Count of cached variants, including the single slot.
    pub fn len(&self) -> usize {
        self.map.len() + self.single.is_some() as usize
    }

    /// If no variant is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn total_cost(&self) -> usize {
        let single = self.single.as_ref().map(|(_, b)| b.byte_cost()).unwrap_or(0);
        self.map.values().map(Bitmap::byte_cost).sum::<usize>() + single
    }

    /// Drop every variant, returns the freed pixel bytes.
    fn clear(&mut self) -> usize {
        let freed = self.total_cost();
        self.map.clear();
        self.single = None;
        freed
    }
}

/// A cached image asset.
///
/// Holds the canonical decoded pixels, the encoded payload when known, the
/// cached sized variants and the fetch state. Assets self-account their
/// resident pixel bytes in the shared [`MemoryBudget`].
pub struct ImageAsset {
    key: Option<AssetKey>,
    source: AssetSource,
    secret: Option<u64>,
    declared: (u32, u32),

    encoded: Vec<u8>,
    format: FormatTag,
    canonical: Option<Bitmap>,
    variants: VariantCache,

    loader: LoaderState,
    loader_factory: Option<LoaderFactory>,

    // deferred load flags, replayed by `set_remote_location`.
    load_requested: bool,
    load_cancelled: bool,
    load_from_cloud: bool,

    forgotten: bool,
    broken: bool,

    limits: AssetLimits,
    budget: MemoryBudget,
}
impl fmt::Debug for ImageAsset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ImageAsset")
            .field("key", &self.key)
            .field("source", &self.source)
            .field("size", &self.size())
            .field("resident", &self.canonical.is_some())
            .field("variants", &self.variants.len())
            .field("loader", &self.loader.name())
            .finish_non_exhaustive()
    }
}
impl ImageAsset {
    pub(crate) fn new(
        key: Option<AssetKey>,
        source: AssetSource,
        secret: Option<u64>,
        declared: (u32, u32),
        loader_factory: Option<LoaderFactory>,
        limits: AssetLimits,
        budget: MemoryBudget,
    ) -> Self {
        Self {
            key,
            source,
            secret,
            declared,
            encoded: vec![],
            format: FormatTag::Unknown,
            canonical: None,
            variants: VariantCache::default(),
            loader: LoaderState::Idle,
            loader_factory,
            load_requested: false,
            load_cancelled: false,
            load_from_cloud: false,
            forgotten: false,
            broken: false,
            limits,
            budget,
        }
    }

    /// Cache identity, `None` for deferred assets without a location yet.
    pub fn key(&self) -> Option<&AssetKey> {
        self.key.as_ref()
    }

    /// Where the bytes come from.
    pub fn source(&self) -> AssetSource {
        self.source
    }

    /// Pixel size, the decoded size when resident, the declared size otherwise.
    ///
    /// `(0, 0)` when unknown.
    pub fn size(&self) -> (u32, u32) {
        match &self.canonical {
            Some(c) => (c.width(), c.height()),
            None => self.declared,
        }
    }

    /// Width of [`size`](ImageAsset::size).
    pub fn width(&self) -> u32 {
        self.size().0
    }

    /// Height of [`size`](ImageAsset::size).
    pub fn height(&self) -> u32 {
        self.size().1
    }

    /// If no pixels and no payload are available and nothing is in flight.
    pub fn is_null(&self) -> bool {
        self.canonical.is_none() && self.encoded.is_empty() && !self.loading()
    }

    /// Encoded payload, empty when unknown.
    pub fn bytes(&self) -> &[u8] {
        &self.encoded
    }

    /// Format of [`bytes`](ImageAsset::bytes).
    pub fn format(&self) -> FormatTag {
        self.format
    }

    /// If the canonical pixels are resident.
    pub fn resident(&self) -> bool {
        self.canonical.is_some()
    }

    /// Cached variants of the asset.
    pub fn variants(&self) -> &VariantCache {
        &self.variants
    }

    /// Resident pixel bytes currently accounted in the budget.
    pub fn resident_cost(&self) -> usize {
        self.canonical.as_ref().map(Bitmap::byte_cost).unwrap_or(0) + self.variants.total_cost()
    }

    /// Poll a finished fetch, then if the canonical pixels are available.
    pub fn loaded(&mut self) -> bool {
        self.check_loaded();
        self.canonical.is_some()
    }

    /// Poll the in-flight fetch, adopting the payload if it finished.
    ///
    /// Returns `true` if the asset became resident from this call. A
    /// finished fetch without pixels, or with a payload over the configured
    /// limits, marks the asset cancelled.
    pub fn check_loaded(&mut self) -> bool {
        let done = matches!(&self.loader, LoaderState::Loading(h) if h.done());
        if !done {
            return false;
        }
        let mut handle = match std::mem::replace(&mut self.loader, LoaderState::Idle) {
            LoaderState::Loading(h) => h,
            other => {
                self.loader = other;
                return false;
            }
        };
        let decoded = handle.decoded(self.size_hint());
        let bytes = handle.bytes().to_vec();
        let format = handle.format();
        handle.stop();
        drop(handle);

        match decoded {
            Some(bmp) if !bmp.is_empty() => {
                if bytes.len() as u64 > self.limits.max_encoded_len
                    || bmp.byte_cost() as u64 > self.limits.max_decoded_len
                {
                    tracing::debug!(key = ?self.key, len = bytes.len(), "fetched payload over limits, cancelled");
                    self.loader = LoaderState::Cancelled;
                    return false;
                }
                self.encoded = bytes;
                self.format = format;
                self.declared = (bmp.width(), bmp.height());
                self.replace_canonical(Some(bmp));
                self.forgotten = false;
                self.broken = false;
                self.loader = LoaderState::Done;
                true
            }
            _ => {
                tracing::debug!(key = ?self.key, "fetch finished without pixels, cancelled");
                self.loader = LoaderState::Cancelled;
                false
            }
        }
    }

    fn size_hint(&self) -> Option<(u32, u32)> {
        match &self.key {
            Some(AssetKey::WebUrl { fit, .. }) => *fit,
            _ => None,
        }
    }

    fn replace_canonical(&mut self, new: Option<Bitmap>) {
        if let Some(old) = self.canonical.take() {
            self.budget.sub(old.byte_cost());
        }
        let freed = self.variants.clear();
        self.budget.sub(freed);
        if let Some(b) = new {
            self.budget.add(b.byte_cost());
            self.canonical = Some(b);
        }
    }

    /// Provide the payload directly.
    ///
    /// Decodes immediately, replaces the canonical pixels and drops every
    /// cached variant. An in-flight fetch is cancelled.
    pub fn set_bytes(&mut self, bytes: Vec<u8>, format: FormatTag) -> Result<(), AssetError> {
        if bytes.len() as u64 > self.limits.max_encoded_len {
            return Err(AssetError::EncodedTooLarge {
                len: bytes.len() as u64,
                max: self.limits.max_encoded_len,
            });
        }
        let (bmp, actual) = codec::decode(&bytes, format, self.limits.max_decoded_len)?;
        if let LoaderState::Loading(h) = &mut self.loader {
            h.cancel();
            h.stop();
        }
        self.loader = LoaderState::Done;
        self.encoded = bytes;
        self.format = actual;
        self.declared = (bmp.width(), bmp.height());
        self.replace_canonical(Some(bmp));
        self.forgotten = false;
        self.broken = false;
        Ok(())
    }

    /// Update the access secret of a remote asset.
    ///
    /// A changed secret re-authorizes the same bytes, the identity, pixels
    /// and cached variants all stay.
    pub fn refresh_secret(&mut self, secret: u64) {
        if self.secret != Some(secret) {
            tracing::debug!(key = ?self.key, "remote access secret changed");
            self.secret = Some(secret);
        }
    }

    pub(crate) fn update_declared(&mut self, w: u32, h: u32) {
        if self.canonical.is_none() && w > 0 && h > 0 {
            self.declared = (w, h);
        }
    }

    /// Provide the storage location of a deferred asset.
    ///
    /// Queued load flags replay, a queued cloud load starts a full fetch, a
    /// queued plain load checks the local cache only. A queued cancel
    /// suppresses the replay.
    pub fn set_remote_location(&mut self, location: RemoteLocation) {
        self.secret = Some(location.secret);
        if location.width > 0 && location.height > 0 && self.canonical.is_none() {
            self.declared = (location.width, location.height);
        }
        self.key = Some(AssetKey::Remote(location));
        self.source = AssetSource::Remote;

        if std::mem::take(&mut self.load_requested) && !self.load_cancelled {
            if self.load_from_cloud {
                self.load(false, false);
            } else {
                self.load_local();
            }
        }
    }

    /// Start or re-prioritize an explicit fetch.
    ///
    /// No-op when resident, done or cancelled. Deferred assets queue the
    /// request instead.
    pub fn load(&mut self, load_first: bool, priority: bool) {
        match &mut self.loader {
            LoaderState::Loading(h) => h.start(load_first, priority),
            LoaderState::Done | LoaderState::Cancelled => {}
            LoaderState::Idle => {
                if self.canonical.is_some() || !self.encoded.is_empty() {
                    return;
                }
                if self.source == AssetSource::DeferredRemote {
                    self.load_requested = true;
                    self.load_from_cloud = true;
                } else {
                    self.create_loader(LoadFrom::CloudOrLocal, false, load_first, priority);
                }
            }
        }
    }

    /// [`load`](ImageAsset::load), resetting a cancelled asset first.
    pub fn load_even_cancelled(&mut self, load_first: bool, priority: bool) {
        if matches!(self.loader, LoaderState::Cancelled) {
            self.loader = LoaderState::Idle;
        }
        self.load_cancelled = false;
        self.load(load_first, priority);
    }

    /// Check the local disk cache for the payload, never touches the network.
    pub fn load_local(&mut self) {
        if matches!(self.loader, LoaderState::Idle) && self.canonical.is_none() && self.encoded.is_empty() {
            if self.source == AssetSource::DeferredRemote {
                self.load_requested = true;
            } else {
                self.create_loader(LoadFrom::LocalOnly, true, false, false);
            }
        }
    }

    /// Automatic load triggered by display, `permit_cloud` per the current
    /// download settings.
    ///
    /// An in-flight local-only fetch upgrades to the cloud when permitted.
    /// Deferred assets queue the request.
    pub fn automatic_load(&mut self, permit_cloud: bool) {
        if self.source == AssetSource::DeferredRemote {
            self.load_requested = true;
            if permit_cloud {
                self.load_from_cloud = true;
            }
            return;
        }
        match &mut self.loader {
            LoaderState::Loading(h) => {
                if permit_cloud {
                    h.permit_cloud();
                }
            }
            LoaderState::Idle => {
                if self.canonical.is_none() && self.encoded.is_empty() {
                    let from = if permit_cloud { LoadFrom::CloudOrLocal } else { LoadFrom::LocalOnly };
                    self.create_loader(from, true, false, false);
                }
            }
            LoaderState::Done | LoaderState::Cancelled => {}
        }
    }

    /// The automatic download settings changed, undo a previous cancel so
    /// the next automatic load re-evaluates.
    pub fn automatic_load_settings_changed(&mut self) {
        if matches!(self.loader, LoaderState::Cancelled) {
            self.loader = LoaderState::Idle;
        }
        self.load_cancelled = false;
    }

    fn create_loader(&mut self, from: LoadFrom, auto_loading: bool, load_first: bool, priority: bool) {
        let Some(key) = self.key.clone() else { return };
        let Some(factory) = &self.loader_factory else { return };
        let request = LoaderRequest::new(key, self.secret, self.size_hint(), from, auto_loading);
        if let Some(mut h) = factory.lock().create(request) {
            h.start(load_first, priority);
            self.loader = LoaderState::Loading(h);
        }
    }

    /// Abort the fetch, the asset stays cancelled until explicitly reset.
    pub fn cancel(&mut self) {
        if self.load_requested {
            self.load_requested = false;
            self.load_cancelled = true;
        }
        match std::mem::replace(&mut self.loader, LoaderState::Idle) {
            LoaderState::Loading(mut h) => {
                h.cancel();
                h.stop();
                self.loader = LoaderState::Cancelled;
            }
            other => self.loader = other,
        }
    }

    /// If a fetch is in flight.
    pub fn loading(&self) -> bool {
        matches!(self.loader, LoaderState::Loading(_))
    }

    /// If the asset was cancelled and will not load again until reset.
    pub fn cancelled(&self) -> bool {
        matches!(self.loader, LoaderState::Cancelled)
    }

    /// If the UI should show a loading indicator.
    ///
    /// Automatic local-only checks stay silent.
    pub fn display_loading(&self) -> bool {
        match &self.loader {
            LoaderState::Loading(h) => !h.is_local_only() || !h.auto_loading(),
            _ => false,
        }
    }

    /// Fetch progress in the `0.0..=1.0` range.
    pub fn progress(&self) -> f64 {
        match &self.loader {
            LoaderState::Loading(h) => h.progress(),
            LoaderState::Done => 1.0,
            _ => {
                if self.canonical.is_some() || !self.encoded.is_empty() {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Bytes fetched so far.
    pub fn load_offset(&self) -> u64 {
        match &self.loader {
            LoaderState::Loading(h) => h.offset(),
            _ => 0,
        }
    }

    /// Drop the decoded pixels and every variant, keeping the payload.
    ///
    /// Re-encodes first when the payload is unknown, with the recorded
    /// format then PNG; if both encoders fail the pixels stay. The asset
    /// restores transparently on the next `pix_*` call.
    pub fn forget(&mut self) {
        let Some(canonical) = &self.canonical else { return };
        if self.encoded.is_empty() {
            let mut fmt = if self.format == FormatTag::Unknown { FormatTag::Png } else { self.format };
            let bytes = match codec::encode(canonical, fmt) {
                Ok(b) => b,
                Err(first) if fmt != FormatTag::Png => match codec::encode(canonical, FormatTag::Png) {
                    Ok(b) => {
                        tracing::warn!(%first, "re-encode fell back to png");
                        fmt = FormatTag::Png;
                        b
                    }
                    Err(e) => {
                        tracing::error!(%first, %e, "cannot re-encode, forget aborted");
                        return;
                    }
                },
                Err(e) => {
                    tracing::error!(%e, "cannot re-encode, forget aborted");
                    return;
                }
            };
            self.encoded = bytes;
            self.format = fmt;
        }
        self.replace_canonical(None);
        self.forgotten = true;
    }

    /// Decode the payload back after a [`forget`](ImageAsset::forget).
    pub fn restore(&mut self) {
        if !self.forgotten || self.broken {
            return;
        }
        if self.encoded.is_empty() {
            tracing::error!(key = ?self.key, "restore without payload");
            self.forgotten = false;
            return;
        }
        match codec::decode(&self.encoded, self.format, self.limits.max_decoded_len) {
            Ok((bmp, fmt)) => {
                self.format = fmt;
                self.declared = (bmp.width(), bmp.height());
                self.budget.add(bmp.byte_cost());
                self.canonical = Some(bmp);
                self.forgotten = false;
            }
            Err(e) => {
                tracing::debug!(key = ?self.key, %e, "restore decode failed");
                self.broken = true;
            }
        }
    }

    /// The canonical pixels scaled to `w`×`h` with a smooth filter.
    ///
    /// Like all `pix_*`, polls the fetch, restores forgotten pixels, caches
    /// the output and returns the shared placeholder while no pixels are
    /// available. `w == 0` selects the canonical size, `h == 0` preserves
    /// the aspect ratio.
    pub fn pix(&mut self, w: u32, h: u32) -> Bitmap {
        self.pix_opts(w, h, PixOptions::SMOOTH, None)
    }

    /// [`pix`](ImageAsset::pix) with all corners rounded at the large radius.
    pub fn pix_rounded(&mut self, w: u32, h: u32) -> Bitmap {
        self.pix_opts(w, h, PixOptions::SMOOTH | PixOptions::ROUNDED_LARGE, None)
    }

    /// [`pix`](ImageAsset::pix) with all corners rounded at the small radius.
    pub fn pix_rounded_small(&mut self, w: u32, h: u32) -> Bitmap {
        self.pix_opts(w, h, PixOptions::SMOOTH | PixOptions::ROUNDED_SMALL, None)
    }

    /// [`pix`](ImageAsset::pix) masked to an ellipse.
    pub fn pix_circled(&mut self, w: u32, h: u32) -> Bitmap {
        self.pix_opts(w, h, PixOptions::SMOOTH | PixOptions::CIRCLED, None)
    }

    /// [`pix`](ImageAsset::pix) blurred before scaling.
    pub fn pix_blurred(&mut self, w: u32, h: u32) -> Bitmap {
        self.pix_opts(w, h, PixOptions::SMOOTH | PixOptions::BLURRED, None)
    }

    /// Blurred and masked to an ellipse.
    pub fn pix_blurred_circled(&mut self, w: u32, h: u32) -> Bitmap {
        self.pix_opts(w, h, PixOptions::SMOOTH | PixOptions::BLURRED | PixOptions::CIRCLED, None)
    }

    /// [`pix`](ImageAsset::pix) tinted by `tint`.
    pub fn pix_colored(&mut self, tint: [u8; 4], w: u32, h: u32) -> Bitmap {
        self.pix_opts(w, h, PixOptions::SMOOTH, Some(tint))
    }

    /// Blurred and tinted.
    pub fn pix_blurred_colored(&mut self, tint: [u8; 4], w: u32, h: u32) -> Bitmap {
        self.pix_opts(w, h, PixOptions::SMOOTH | PixOptions::BLURRED, Some(tint))
    }

    /// Fully parameterized variant request.
    ///
    /// Outputs cache by `(w, h, options, tint)`. An output that ends up
    /// sharing the canonical pixels is returned without caching.
    pub fn pix_opts(&mut self, w: u32, h: u32, mut options: PixOptions, tint: Option<[u8; 4]>) -> Bitmap {
        self.check_loaded();
        self.restore();
        let Some(canonical) = self.canonical.clone() else {
            return crate::blank();
        };

        let (w, h) = if w == 0 { (canonical.width(), canonical.height()) } else { (w, h) };
        if tint.is_some() {
            options |= PixOptions::COLORED;
        }
        let key = VariantKey { w, h, options, tint };
        if let Some(b) = self.variants.map.get(&key) {
            return b.clone();
        }
        let out = transform::prepare(&canonical, w, h, None, options, tint);
        if out.ptr_eq(&canonical) {
            return out;
        }
        self.budget.add(out.byte_cost());
        self.variants.map.insert(key, out.clone());
        out
    }

    /// Scale to `w`×`h` and letterbox centered into an `outer_w`×`outer_h`
    /// canvas, caching the result in the single slot.
    ///
    /// The slot keys on options and tint only, a request with a different
    /// outer box replaces it.
    pub fn pix_single(&mut self, w: u32, h: u32, outer_w: u32, outer_h: u32, options: PixOptions, tint: Option<[u8; 4]>) -> Bitmap {
        self.pix_single_impl(w, h, outer_w, outer_h, options | PixOptions::SMOOTH, tint)
    }

    /// [`pix_single`](ImageAsset::pix_single) blurred before scaling.
    pub fn pix_blurred_single(&mut self, w: u32, h: u32, outer_w: u32, outer_h: u32, options: PixOptions, tint: Option<[u8; 4]>) -> Bitmap {
        self.pix_single_impl(w, h, outer_w, outer_h, options | PixOptions::SMOOTH | PixOptions::BLURRED, tint)
    }

    fn pix_single_impl(&mut self, w: u32, h: u32, outer_w: u32, outer_h: u32, mut options: PixOptions, tint: Option<[u8; 4]>) -> Bitmap {
        self.check_loaded();
        self.restore();
        let Some(canonical) = self.canonical.clone() else {
            return crate::blank();
        };

        if tint.is_some() {
            options |= PixOptions::COLORED;
        }
        let key = SingleKey { options, tint };
        if let Some((k, b)) = &self.variants.single {
            if *k == key && b.width() == outer_w && b.height() == outer_h {
                return b.clone();
            }
        }
        let out = transform::prepare(&canonical, w, h, Some((outer_w, outer_h)), options, tint);
        if let Some((_, old)) = self.variants.single.take() {
            self.budget.sub(old.byte_cost());
        }
        if !out.ptr_eq(&canonical) {
            self.budget.add(out.byte_cost());
            self.variants.single = Some((key, out.clone()));
        }
        out
    }
}
impl Drop for ImageAsset {
    fn drop(&mut self) {
        if let LoaderState::Loading(h) = &mut self.loader {
            h.cancel();
            h.stop();
        }
        let cost = self.resident_cost();
        self.budget.sub(cost);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    pub fn sample_png(w: u32, h: u32) -> Vec<u8> {
        let mut buf = Cursor::new(vec![]);
        let px = image::RgbaImage::from_pixel(w, h, image::Rgba([10, 120, 200, 255]));
        px.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[derive(Default)]
    pub struct Script {
        pub done: bool,
        pub bytes: Vec<u8>,
        pub bitmap: Option<Bitmap>,
        pub format: FormatTag,
        pub progress: f64,
        pub offset: u64,

        pub started: u32,
        pub cancelled: bool,
        pub stopped: bool,
        pub cloud_permitted: bool,

        pub local_only: bool,
        pub auto: bool,
    }

    pub struct ScriptedHandle {
        script: Arc<Mutex<Script>>,
        // `bytes` hands out a borrow, so the payload is snapshot here on
        // first read. Reads only happen after the fetch is done.
        payload: std::cell::OnceCell<Vec<u8>>,
    }
    impl ScriptedHandle {
        pub fn new(script: Arc<Mutex<Script>>) -> Self {
            Self {
                script,
                payload: std::cell::OnceCell::new(),
            }
        }
    }
    impl LoaderHandle for ScriptedHandle {
        fn start(&mut self, _load_first: bool, _priority: bool) {
            self.script.lock().started += 1;
        }
        fn done(&self) -> bool {
            self.script.lock().done
        }
        fn bytes(&self) -> &[u8] {
            self.payload.get_or_init(|| self.script.lock().bytes.clone())
        }
        fn decoded(&self, _fit: Option<(u32, u32)>) -> Option<Bitmap> {
            self.script.lock().bitmap.clone()
        }
        fn format(&self) -> FormatTag {
            self.script.lock().format
        }
        fn progress(&self) -> f64 {
            self.script.lock().progress
        }
        fn offset(&self) -> u64 {
            self.script.lock().offset
        }
        fn is_local_only(&self) -> bool {
            self.script.lock().local_only
        }
        fn auto_loading(&self) -> bool {
            self.script.lock().auto
        }
        fn permit_cloud(&mut self) {
            let mut s = self.script.lock();
            s.cloud_permitted = true;
            s.local_only = false;
        }
        fn cancel(&mut self) {
            self.script.lock().cancelled = true;
        }
        fn stop(&mut self) {
            self.script.lock().stopped = true;
        }
    }

    /// Records requests, hands out handles over the shared script.
    pub struct ScriptedLoader {
        pub script: Arc<Mutex<Script>>,
        pub requests: Arc<Mutex<Vec<LoaderRequest>>>,
    }
    impl ScriptedLoader {
        pub fn new() -> (LoaderFactory, Arc<Mutex<Script>>, Arc<Mutex<Vec<LoaderRequest>>>) {
            let script = Arc::new(Mutex::new(Script::default()));
            let requests = Arc::new(Mutex::new(vec![]));
            let f: LoaderFactory = Arc::new(Mutex::new(Box::new(ScriptedLoader {
                script: script.clone(),
                requests: requests.clone(),
            })));
            (f, script, requests)
        }
    }
    impl AssetLoader for ScriptedLoader {
        fn create(&mut self, request: LoaderRequest) -> Option<Box<dyn LoaderHandle>> {
            {
                let mut s = self.script.lock();
                s.local_only = request.from == LoadFrom::LocalOnly;
                s.auto = request.auto_loading;
            }
            self.requests.lock().push(request);
            Some(Box::new(ScriptedHandle::new(self.script.clone())))
        }
    }

    fn local_asset(bytes: Vec<u8>) -> (ImageAsset, MemoryBudget) {
        let budget = MemoryBudget::default();
        let mut a = ImageAsset::new(
            Some(AssetKey::inline_bytes(&bytes)),
            AssetSource::Local,
            None,
            (0, 0),
            None,
            AssetLimits::default(),
            budget.clone(),
        );
        a.set_bytes(bytes, FormatTag::Unknown).unwrap();
        (a, budget)
    }

    fn remote_asset(factory: LoaderFactory, budget: MemoryBudget) -> ImageAsset {
        let loc = RemoteLocation::new(2, 55, 9, 0, 0, 0xFEED);
        ImageAsset::new(
            Some(AssetKey::Remote(loc.clone())),
            AssetSource::Remote,
            Some(loc.secret),
            (0, 0),
            Some(factory),
            AssetLimits::default(),
            budget,
        )
    }

    #[test]
    fn variant_reuse_shares_pixels() {
        let (mut a, budget) = local_asset(sample_png(32, 32));
        let v1 = a.pix(16, 16);
        let v2 = a.pix(16, 16);
        assert!(v1.ptr_eq(&v2));
        assert_eq!(a.variants().len(), 1);
        assert_eq!(budget.total(), 32 * 32 * 4 + 16 * 16 * 4);
    }

    #[test]
    fn identity_pix_is_canonical_and_uncached() {
        let (mut a, budget) = local_asset(sample_png(10, 10));
        let v = a.pix(0, 0);
        assert_eq!((v.width(), v.height()), (10, 10));
        assert_eq!(a.variants().len(), 0);
        assert_eq!(budget.total(), 10 * 10 * 4);
    }

    #[test]
    fn forget_restore_round_trip() {
        let (mut a, budget) = local_asset(sample_png(8, 8));
        let before = a.pix(0, 0);
        a.forget();
        assert!(!a.resident());
        assert_eq!(budget.total(), 0);
        assert!(!a.bytes().is_empty());

        let after = a.pix(0, 0);
        assert!(a.resident());
        assert_eq!(after.pixels(), before.pixels());
        assert_eq!(budget.total(), 8 * 8 * 4);
    }

    #[test]
    fn forget_reencodes_when_payload_unknown() {
        let (f, script, _req) = ScriptedLoader::new();
        let budget = MemoryBudget::default();
        let mut a = remote_asset(f, budget.clone());
        a.load(false, false);
        {
            let mut s = script.lock();
            s.done = true;
            s.bitmap = Some(Bitmap::solid(6, 6, [5, 6, 7, 255]));
            s.bytes = vec![];
            s.format = FormatTag::Unknown;
        }
        assert!(a.loaded());
        assert!(a.bytes().is_empty());

        a.forget();
        assert!(!a.resident());
        assert_eq!(a.format(), FormatTag::Png);
        assert!(!a.bytes().is_empty());

        let back = a.pix(0, 0);
        assert_eq!(back.pixels(), Bitmap::solid(6, 6, [5, 6, 7, 255]).pixels());
    }

    #[test]
    fn remote_poll_lifecycle() {
        let (f, script, requests) = ScriptedLoader::new();
        let budget = MemoryBudget::default();
        let mut a = remote_asset(f, budget.clone());

        assert!(!a.loaded());
        a.load(true, false);
        assert!(a.loading());
        assert!(a.display_loading());
        assert_eq!(requests.lock().len(), 1);
        assert_eq!(requests.lock()[0].secret, Some(0xFEED));

        // not done yet, pix serves the placeholder.
        let p = a.pix(40, 40);
        assert!(p.ptr_eq(&crate::blank()));
        assert_eq!(budget.total(), 0);

        {
            let mut s = script.lock();
            s.done = true;
            s.bytes = sample_png(24, 24);
            s.bitmap = Some(Bitmap::solid(24, 24, [1, 2, 3, 255]));
            s.format = FormatTag::Png;
        }
        assert!(a.loaded());
        assert!(script.lock().stopped);
        assert_eq!(a.size(), (24, 24));
        assert_eq!(a.progress(), 1.0);
        assert_eq!(budget.total(), 24 * 24 * 4);

        // loaded, further loads are no-ops.
        a.load(false, false);
        assert_eq!(requests.lock().len(), 1);
    }

    #[test]
    fn fetch_without_pixels_is_permanent_cancel() {
        let (f, script, requests) = ScriptedLoader::new();
        let mut a = remote_asset(f, MemoryBudget::default());
        a.load(false, false);
        script.lock().done = true;
        assert!(!a.loaded());
        assert!(a.cancelled());

        a.load(false, false);
        assert_eq!(requests.lock().len(), 1);

        script.lock().done = false;
        a.load_even_cancelled(false, false);
        assert!(a.loading());
        assert_eq!(requests.lock().len(), 2);
    }

    #[test]
    fn oversized_fetch_is_load_failure() {
        let (f, script, _requests) = ScriptedLoader::new();
        let budget = MemoryBudget::default();
        let loc = RemoteLocation::new(2, 55, 9, 0, 0, 0xFEED);
        let mut a = ImageAsset::new(
            Some(AssetKey::Remote(loc.clone())),
            AssetSource::Remote,
            Some(loc.secret),
            (0, 0),
            Some(f),
            AssetLimits {
                max_encoded_len: 16,
                ..AssetLimits::default()
            },
            budget.clone(),
        );
        a.load(false, false);
        {
            let mut s = script.lock();
            s.done = true;
            s.bytes = sample_png(24, 24);
            s.bitmap = Some(Bitmap::solid(24, 24, [1, 2, 3, 255]));
            s.format = FormatTag::Png;
        }
        // payload over the encoded limit, the fetch fails instead of
        // adopting the pixels.
        assert!(!a.loaded());
        assert!(a.cancelled());
        assert!(!a.resident());
        assert_eq!(budget.total(), 0);
    }

    #[test]
    fn explicit_cancel_is_sticky_until_settings_change() {
        let (f, script, requests) = ScriptedLoader::new();
        let mut a = remote_asset(f, MemoryBudget::default());
        a.load(false, false);
        a.cancel();
        assert!(script.lock().cancelled);
        assert!(a.cancelled());

        a.automatic_load(true);
        assert_eq!(requests.lock().len(), 1);

        a.automatic_load_settings_changed();
        a.automatic_load(true);
        assert_eq!(requests.lock().len(), 2);
    }

    #[test]
    fn automatic_local_fetch_upgrades_to_cloud() {
        let (f, script, requests) = ScriptedLoader::new();
        let mut a = remote_asset(f, MemoryBudget::default());
        a.automatic_load(false);
        assert_eq!(requests.lock()[0].from, LoadFrom::LocalOnly);
        assert!(a.loading());
        // local-only automatic check is silent.
        assert!(!a.display_loading());

        a.automatic_load(true);
        assert!(script.lock().cloud_permitted);
        assert!(a.display_loading());
    }

    #[test]
    fn deferred_flags_replay_on_location() {
        let (f, _script, requests) = ScriptedLoader::new();
        let mut a = ImageAsset::new(None, AssetSource::DeferredRemote, None, (80, 60), Some(f), AssetLimits::default(), MemoryBudget::default());
        assert_eq!(a.size(), (80, 60));

        a.automatic_load(true);
        assert!(!a.loading());
        assert!(requests.lock().is_empty());

        a.set_remote_location(RemoteLocation::new(4, 1, 2, 0, 0, 77));
        assert!(a.loading());
        let req = requests.lock();
        assert_eq!(req.len(), 1);
        assert_eq!(req[0].from, LoadFrom::CloudOrLocal);
        assert_eq!(req[0].secret, Some(77));
    }

    #[test]
    fn deferred_cancel_suppresses_replay() {
        let (f, _script, requests) = ScriptedLoader::new();
        let mut a = ImageAsset::new(None, AssetSource::DeferredRemote, None, (0, 0), Some(f), AssetLimits::default(), MemoryBudget::default());
        a.load(false, false);
        a.cancel();
        a.set_remote_location(RemoteLocation::new(4, 1, 3, 0, 0, 0));
        assert!(!a.loading());
        assert!(requests.lock().is_empty());
    }

    #[test]
    fn set_bytes_invalidates_variants() {
        let (mut a, budget) = local_asset(sample_png(32, 32));
        let v = a.pix(16, 16);
        assert_eq!(a.variants().len(), 1);

        a.set_bytes(sample_png(20, 20), FormatTag::Unknown).unwrap();
        assert_eq!(a.variants().len(), 0);
        assert_eq!(a.size(), (20, 20));
        assert_eq!(budget.total(), 20 * 20 * 4);
        let v2 = a.pix(16, 16);
        assert!(!v.ptr_eq(&v2));
    }

    #[test]
    fn secret_refresh_keeps_variants() {
        let (f, _s, _r) = ScriptedLoader::new();
        let mut a = remote_asset(f, MemoryBudget::default());
        a.set_bytes(sample_png(16, 16), FormatTag::Unknown).unwrap();
        let v = a.pix(8, 8);
        a.refresh_secret(0xABCD);
        let v2 = a.pix(8, 8);
        assert!(v.ptr_eq(&v2));
    }

    #[test]
    fn encoded_limit_rejects() {
        let budget = MemoryBudget::default();
        let mut a = ImageAsset::new(
            None,
            AssetSource::Local,
            None,
            (0, 0),
            None,
            AssetLimits {
                max_encoded_len: 16,
                ..AssetLimits::default()
            },
            budget.clone(),
        );
        let r = a.set_bytes(sample_png(8, 8), FormatTag::Unknown);
        assert!(matches!(r, Err(AssetError::EncodedTooLarge { .. })));
        assert!(a.is_null());
        assert_eq!(budget.total(), 0);
    }

    #[test]
    fn decoded_limit_rejects() {
        let mut a = ImageAsset::new(
            None,
            AssetSource::Local,
            None,
            (0, 0),
            None,
            AssetLimits {
                max_decoded_len: 8 * 8 * 4 - 1,
                ..AssetLimits::default()
            },
            MemoryBudget::default(),
        );
        let r = a.set_bytes(sample_png(8, 8), FormatTag::Unknown);
        assert!(matches!(r, Err(AssetError::Decode(_))));
    }

    #[test]
    fn single_slot_replaced_on_outer_change() {
        let (mut a, budget) = local_asset(sample_png(32, 32));
        let v1 = a.pix_single(20, 20, 40, 40, PixOptions::ROUNDED_LARGE, None);
        assert_eq!((v1.width(), v1.height()), (40, 40));
        let v2 = a.pix_single(20, 20, 40, 40, PixOptions::ROUNDED_LARGE, None);
        assert!(v1.ptr_eq(&v2));
        assert_eq!(a.variants().len(), 1);
        assert_eq!(budget.total(), 32 * 32 * 4 + 40 * 40 * 4);

        let v3 = a.pix_single(30, 30, 60, 60, PixOptions::ROUNDED_LARGE, None);
        assert_eq!((v3.width(), v3.height()), (60, 60));
        assert_eq!(a.variants().len(), 1);
        assert_eq!(budget.total(), 32 * 32 * 4 + 60 * 60 * 4);
    }

    #[test]
    fn drop_releases_budget() {
        let (f, script, _r) = ScriptedLoader::new();
        let budget = MemoryBudget::default();
        let mut a = remote_asset(f, budget.clone());
        a.set_bytes(sample_png(16, 16), FormatTag::Unknown).unwrap();
        a.pix(8, 8);
        assert!(budget.total() > 0);
        drop(a);
        assert_eq!(budget.total(), 0);
        assert!(!script.lock().cancelled);
    }
}
