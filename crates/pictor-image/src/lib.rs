//! Image asset cache with a pixel transform pipeline and cooperative remote
//! loading.
//!
//! The [`Images`] registry owns every [`ImageAsset`], deduplicated by
//! [`AssetKey`]. Assets decode to premultiplied BGRA8, serve cached sized
//! variants through their `pix_*` methods and fetch remote payloads through
//! the [`AssetLoader`] the application plugs in. Resident pixel bytes are
//! tracked in an advisory [`MemoryBudget`], the cache never evicts on its
//! own, the application calls [`ImageAsset::forget`] or the registry `clear`
//! operations when it wants memory back.
//!
//! [`AssetLoader`]: pictor_image_api::AssetLoader
//!
//! # Crate
//!
#![doc = include_str!(concat!("../", std::env!("CARGO_PKG_README")))]
#![warn(unused_extern_crates)]
#![warn(missing_docs)]

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use pictor_image_api::{AssetKey, AssetLoader, Bitmap, FormatTag, LoaderHandle, LoaderRequest, RemoteLocation};
use rustc_hash::FxHashMap;

mod codec;
pub mod transform;
mod types;

pub use codec::{DecodeError, EncodeError};
pub use transform::PixOptions;
pub use types::{AssetError, AssetSource, ImageAsset, VariantCache};

use types::LoaderFactory;

/// Unique id of an asset in an [`Images`] registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct AssetId(u32);
impl AssetId {
    fn first() -> Self {
        AssetId(1)
    }

    fn next(&mut self) -> Self {
        let r = *self;
        self.0 = self.0.wrapping_add(1);
        r
    }

    /// Id as a raw number.
    pub fn get(self) -> u32 {
        self.0
    }

    /// Id from a raw number, must come from [`get`](AssetId::get).
    pub fn from_raw(raw: u32) -> Self {
        AssetId(raw)
    }
}

/// Payload size limits enforced by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AssetLimits {
    /// Maximum encoded payload byte length.
    pub max_encoded_len: u64,
    /// Maximum decoded pixel buffer byte length, checked against the
    /// declared header dimensions before decoding.
    pub max_decoded_len: u64,
}
impl Default for AssetLimits {
    /// 100 MiB encoded, 4 GiB decoded.
    fn default() -> Self {
        AssetLimits {
            max_encoded_len: 100 * 1024 * 1024,
            max_decoded_len: 4 * 1024 * 1024 * 1024,
        }
    }
}

/// Shared tally of resident decoded pixel bytes.
///
/// Advisory only, nothing evicts when it grows, the application watches it
/// and decides what to [`forget`](ImageAsset::forget). Clones share the
/// tally, every asset carries one and self-accounts, including on drop.
#[derive(Debug, Clone, Default)]
pub struct MemoryBudget(Arc<AtomicI64>);
impl MemoryBudget {
    /// Currently accounted bytes.
    pub fn total(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0) as usize
    }

    pub(crate) fn add(&self, n: usize) {
        self.0.fetch_add(n as i64, Ordering::Relaxed);
    }

    pub(crate) fn sub(&self, n: usize) {
        self.0.fetch_sub(n as i64, Ordering::Relaxed);
    }
}

static BLANK: Lazy<Bitmap> = Lazy::new(|| Bitmap::solid(1, 1, [0, 0, 0, 0]));

/// Shared 1×1 transparent bitmap, served by `pix_*` while no pixels are
/// available.
pub fn blank() -> Bitmap {
    BLANK.clone()
}

struct NullLoader;
impl AssetLoader for NullLoader {
    fn create(&mut self, _: LoaderRequest) -> Option<Box<dyn LoaderHandle>> {
        None
    }
}

/// The asset registry.
///
/// Owns every asset and deduplicates them by [`AssetKey`]. Deferred assets
/// have no key yet and never join the key index. Single-threaded by design,
/// loaders complete by being polled from the owner thread.
pub struct Images {
    assets: FxHashMap<AssetId, ImageAsset>,
    by_key: FxHashMap<AssetKey, AssetId>,
    id_gen: AssetId,
    loader: LoaderFactory,
    limits: AssetLimits,
    budget: MemoryBudget,
}
impl Default for Images {
    fn default() -> Self {
        Self::new()
    }
}
impl Images {
    /// New empty registry with default limits and no loader.
    ///
    /// Without a loader remote assets never leave the idle state, see
    /// [`set_loader`](Images::set_loader).
    pub fn new() -> Self {
        Images {
            assets: FxHashMap::default(),
            by_key: FxHashMap::default(),
            id_gen: AssetId::first(),
            loader: Arc::new(Mutex::new(Box::new(NullLoader))),
            limits: AssetLimits::default(),
            budget: MemoryBudget::default(),
        }
    }

    /// Plug in the fetch implementation.
    ///
    /// Assets created before this call pick the new loader up too.
    pub fn set_loader(&mut self, loader: Box<dyn AssetLoader>) {
        *self.loader.lock() = loader;
    }

    /// Current limits.
    pub fn limits(&self) -> AssetLimits {
        self.limits
    }

    /// Replace the limits, applies to assets created after this call.
    pub fn set_limits(&mut self, limits: AssetLimits) {
        self.limits = limits;
    }

    /// The shared budget tally.
    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    /// Resident decoded pixel bytes across every asset.
    pub fn cache_size_bytes(&self) -> usize {
        self.budget.total()
    }

    /// Count of registered assets.
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    /// If no asset is registered.
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Get the asset for `key`, creating it if needed.
    ///
    /// A remote key hit refreshes the stored access secret and declared
    /// size, neither is part of the identity.
    pub fn get_or_create(&mut self, key: AssetKey) -> AssetId {
        if let Some(&id) = self.by_key.get(&key) {
            if let AssetKey::Remote(loc) = &key {
                if let Some(a) = self.assets.get_mut(&id) {
                    a.refresh_secret(loc.secret);
                    a.update_declared(loc.width, loc.height);
                }
            }
            return id;
        }

        let (source, secret, declared) = match &key {
            AssetKey::Remote(l) => (AssetSource::Remote, Some(l.secret), (l.width, l.height)),
            AssetKey::WebUrl { fit, .. } => (AssetSource::Web, None, fit.unwrap_or((0, 0))),
            _ => (AssetSource::Local, None, (0, 0)),
        };
        let asset = ImageAsset::new(
            Some(key.clone()),
            source,
            secret,
            declared,
            Some(self.loader.clone()),
            self.limits,
            self.budget.clone(),
        );
        let id = self.id_gen.next();
        self.by_key.insert(key, id);
        self.assets.insert(id, asset);
        id
    }

    /// Register caller provided bytes, deduplicated by content hash.
    ///
    /// Decodes immediately, the limits apply.
    pub fn insert_local_bytes(&mut self, bytes: Vec<u8>, format: FormatTag) -> Result<AssetId, AssetError> {
        let key = AssetKey::inline_bytes(&bytes);
        if let Some(&id) = self.by_key.get(&key) {
            return Ok(id);
        }
        let mut asset = ImageAsset::new(
            Some(key.clone()),
            AssetSource::Local,
            None,
            (0, 0),
            Some(self.loader.clone()),
            self.limits,
            self.budget.clone(),
        );
        asset.set_bytes(bytes, format)?;
        let id = self.id_gen.next();
        self.by_key.insert(key, id);
        self.assets.insert(id, asset);
        Ok(id)
    }

    /// New deferred remote asset with an optional declared size.
    ///
    /// The asset queues load requests until
    /// [`set_remote_location`](Images::set_remote_location) provides its
    /// storage coordinates. Deferred assets are never in the key index.
    pub fn deferred(&mut self, width: u32, height: u32) -> AssetId {
        let asset = ImageAsset::new(
            None,
            AssetSource::DeferredRemote,
            None,
            (width, height),
            Some(self.loader.clone()),
            self.limits,
            self.budget.clone(),
        );
        let id = self.id_gen.next();
        self.assets.insert(id, asset);
        id
    }

    /// Provide the storage location of a deferred asset, replaying its
    /// queued load flags.
    pub fn set_remote_location(&mut self, id: AssetId, location: RemoteLocation) {
        if let Some(a) = self.assets.get_mut(&id) {
            a.set_remote_location(location);
        }
    }

    /// Provide the payload of an asset directly.
    pub fn set_bytes(&mut self, id: AssetId, bytes: Vec<u8>, format: FormatTag) -> Result<(), AssetError> {
        match self.assets.get_mut(&id) {
            Some(a) => a.set_bytes(bytes, format),
            None => Ok(()),
        }
    }

    /// Reference the asset.
    pub fn asset(&self, id: AssetId) -> Option<&ImageAsset> {
        self.assets.get(&id)
    }

    /// Exclusive reference the asset.
    pub fn asset_mut(&mut self, id: AssetId) -> Option<&mut ImageAsset> {
        self.assets.get_mut(&id)
    }

    /// Id of the asset for `key`, if it was created.
    pub fn lookup(&self, key: &AssetKey) -> Option<AssetId> {
        self.by_key.get(key).copied()
    }

    /// Iterate over all assets.
    pub fn iter(&self) -> impl Iterator<Item = (AssetId, &ImageAsset)> {
        self.assets.iter().map(|(id, a)| (*id, a))
    }

    /// Forget the decoded pixels of every asset that can re-encode, keeping
    /// identities and payloads.
    pub fn forget_all(&mut self) {
        for a in self.assets.values_mut() {
            a.forget();
        }
    }

    /// Drop every remote, web and deferred asset, keeping local ones.
    pub fn clear_remote(&mut self) {
        self.assets.retain(|_, a| matches!(a.source(), AssetSource::Local));
        let assets = &self.assets;
        self.by_key.retain(|_, id| assets.contains_key(id));
    }

    /// Drop every asset.
    pub fn clear_all(&mut self) {
        self.assets.clear();
        self.by_key.clear();
    }
}
