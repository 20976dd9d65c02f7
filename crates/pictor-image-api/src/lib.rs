//! Image cache and remote-loader API types.
//!
//! Shared between the cache core and the application side that fetches
//! remote assets.
//!
//! # Crate
//!
#![doc = include_str!(concat!("../", std::env!("CARGO_PKG_README")))]
#![warn(unused_extern_crates)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use std::{fmt, io};

mod bitmap;
mod hash;
mod loader;

pub use bitmap::*;
pub use hash::*;
pub use loader::*;

/// Cache identity of an asset.
///
/// Two requests with equal keys observe the same cached entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum AssetKey {
    /// A file on the local filesystem.
    ///
    /// Size and modify time are part of the identity, so an edited file
    /// reads as a different asset.
    LocalFile {
        /// Absolute path.
        path: PathBuf,
        /// File length in bytes.
        size: u64,
        /// Last modify time.
        mtime: SystemTime,
    },
    /// Bytes provided directly by the caller, identified by content hash.
    InlineBytes {
        /// Hash of the encoded bytes.
        hash: ByteHash,
    },
    /// An asset in the remote store.
    Remote(RemoteLocation),
    /// An asset fetched over HTTP.
    WebUrl {
        /// Source URL.
        url: String,
        /// Box the remote server was asked to fit the image into.
        ///
        /// Part of the identity, the same URL at a different box is a
        /// different asset.
        fit: Option<(u32, u32)>,
    },
}
impl AssetKey {
    /// New [`LocalFile`] key, reading size and modify time from the filesystem.
    ///
    /// [`LocalFile`]: AssetKey::LocalFile
    pub fn local_file(path: impl AsRef<Path>) -> io::Result<AssetKey> {
        let path = path.as_ref().to_owned();
        let meta = std::fs::metadata(&path)?;
        Ok(AssetKey::LocalFile {
            size: meta.len(),
            mtime: meta.modified()?,
            path,
        })
    }

    /// New [`InlineBytes`] key hashing the `bytes`.
    ///
    /// [`InlineBytes`]: AssetKey::InlineBytes
    pub fn inline_bytes(bytes: &[u8]) -> AssetKey {
        AssetKey::InlineBytes {
            hash: ByteHash::compute(bytes),
        }
    }
}

/// Coordinates of an asset in the remote store.
///
/// Identity is the storage coordinates only, `dc`, `volume` and `local_id`.
/// The declared size is advisory and the access `secret` re-authorizes the
/// same bytes, neither participates in equality or hashing.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemoteLocation {
    /// Datacenter that stores the asset.
    pub dc: i32,
    /// Storage volume inside the datacenter.
    pub volume: u64,
    /// Asset id inside the volume.
    pub local_id: i32,
    /// Declared pixel width, `0` if unknown.
    pub width: u32,
    /// Declared pixel height, `0` if unknown.
    pub height: u32,
    /// Current access secret.
    pub secret: u64,
}
impl RemoteLocation {
    /// New location.
    pub fn new(dc: i32, volume: u64, local_id: i32, width: u32, height: u32, secret: u64) -> Self {
        Self {
            dc,
            volume,
            local_id,
            width,
            height,
            secret,
        }
    }
}
impl PartialEq for RemoteLocation {
    fn eq(&self, other: &Self) -> bool {
        self.dc == other.dc && self.volume == other.volume && self.local_id == other.local_id
    }
}
impl Eq for RemoteLocation {}
impl std::hash::Hash for RemoteLocation {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.dc.hash(state);
        self.volume.hash(state);
        self.local_id.hash(state);
    }
}
impl fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.dc, self.volume, self.local_id)
    }
}
