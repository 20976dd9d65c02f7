use crate::{AssetKey, Bitmap, FormatTag};

/// Where a loader may acquire the bytes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LoadFrom {
    /// Local disk cache first, remote store if not cached.
    CloudOrLocal,
    /// Local disk cache only, never touches the network.
    LocalOnly,
}

/// Parameters for [`AssetLoader::create`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct LoaderRequest {
    /// Identity of the asset to fetch.
    pub key: AssetKey,
    /// Current access secret for remote-storage keys.
    ///
    /// The secret re-authorizes access to the same bytes, it is not part of
    /// the asset identity.
    pub secret: Option<u64>,
    /// Box the decoded bitmap should fit into, when the caller requested one.
    pub size_hint: Option<(u32, u32)>,
    /// Acquisition policy.
    pub from: LoadFrom,
    /// If the load was triggered automatically rather than by an explicit
    /// user request.
    pub auto_loading: bool,
}
impl LoaderRequest {
    /// New request.
    pub fn new(key: AssetKey, secret: Option<u64>, size_hint: Option<(u32, u32)>, from: LoadFrom, auto_loading: bool) -> Self {
        Self {
            key,
            secret,
            size_hint,
            from,
            auto_loading,
        }
    }
}

/// Factory for fetch operations, implemented by the surrounding application.
///
/// The cache core drives loaders but never implements the fetch itself. One
/// loader handle serves one fetch of one asset; a new fetch for the same
/// asset goes through `create` again.
pub trait AssetLoader: Send {
    /// Create a fetch operation for the request.
    ///
    /// Returns `None` if the request cannot be fulfilled at all, for example
    /// a remote key with no known location. The core treats `None` as
    /// "stay idle", it does not retry.
    fn create(&mut self, request: LoaderRequest) -> Option<Box<dyn LoaderHandle>>;
}

/// One in-flight (or finished) fetch operation.
///
/// The core only ever *polls* a handle from the owner thread, completion is
/// observed by calling [`done`], never pushed by the loader. After the core
/// observes `done() == true` and copies the payload out it calls [`stop`]
/// and drops the handle; the handle is never polled again.
///
/// [`done`]: LoaderHandle::done
/// [`stop`]: LoaderHandle::stop
pub trait LoaderHandle {
    /// Start or re-prioritize the fetch.
    ///
    /// Idempotent while the fetch is running; `load_first` and `priority`
    /// may move the fetch ahead of the loader's queue.
    fn start(&mut self, load_first: bool, priority: bool);

    /// If the fetch finished, successfully or not.
    fn done(&self) -> bool;

    /// The fetched encoded bytes.
    ///
    /// Only valid after [`done`] returns `true`; empty on failure.
    ///
    /// [`done`]: LoaderHandle::done
    fn bytes(&self) -> &[u8];

    /// The fetched payload decoded, optionally scaled down to fit `fit`.
    ///
    /// Only valid after [`done`] returns `true`. `None` or an empty bitmap
    /// signals a failed fetch or undecodable payload, the core treats that
    /// as a permanent failure for this handle.
    ///
    /// [`done`]: LoaderHandle::done
    fn decoded(&self, fit: Option<(u32, u32)>) -> Option<Bitmap>;

    /// Declared format of [`bytes`].
    ///
    /// [`bytes`]: LoaderHandle::bytes
    fn format(&self) -> FormatTag;

    /// Fetch progress in the `0.0..=1.0` range.
    fn progress(&self) -> f64;

    /// Bytes fetched so far.
    fn offset(&self) -> u64;

    /// If this fetch only checks the local disk cache.
    fn is_local_only(&self) -> bool;

    /// If this fetch was created by an automatic load.
    fn auto_loading(&self) -> bool;

    /// Upgrade a [`LoadFrom::LocalOnly`] fetch to also use the remote store.
    fn permit_cloud(&mut self);

    /// Abort the fetch.
    ///
    /// The core marks the asset cancelled immediately; the loader may tear
    /// the underlying operation down asynchronously.
    fn cancel(&mut self);

    /// Release fetch resources, called before the handle is dropped.
    fn stop(&mut self);
}
