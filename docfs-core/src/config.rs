//! Overlay configuration.

use crate::backend::BackendKind;
use crate::error::{Error, Result};
use crate::identity::StaticDirectory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for one mounted overlay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Real directory holding the file contents
    pub mount_point: PathBuf,

    /// Directory of the metadata document store
    pub store_dir: PathBuf,

    /// Real filesystem implementation (default local)
    #[serde(default)]
    pub backend: BackendKind,

    /// Lifetime of cached lookups in seconds (default 60)
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Whether lookups go through the metadata cache (default true)
    #[serde(default = "default_true")]
    pub caching: bool,

    /// Skip the real filesystem side of metadata updates (default false)
    #[serde(default)]
    pub metadata_only: bool,

    /// Keep extended attributes and ACLs in the documents only (default true)
    #[serde(default = "default_true")]
    pub xattrs_in_store_only: bool,

    /// Domain appended to logins in NFSv4 ACLs
    #[serde(default = "default_nfs4_domain")]
    pub nfs4_domain: String,

    /// Login that stands for everybody; grants to it are never deferred
    #[serde(default = "default_public_login")]
    pub public_login: String,

    /// Known users, login to uid
    #[serde(default)]
    pub users: BTreeMap<String, u32>,
}

fn default_cache_ttl() -> u64 { 60 }
fn default_true() -> bool { true }
fn default_nfs4_domain() -> String { "localdomain".to_string() }
fn default_public_login() -> String { "public".to_string() }

impl OverlayConfig {
    pub fn new(mount_point: impl Into<PathBuf>, store_dir: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
            store_dir: store_dir.into(),
            backend: BackendKind::default(),
            cache_ttl_secs: default_cache_ttl(),
            caching: true,
            metadata_only: false,
            xattrs_in_store_only: true,
            nfs4_domain: default_nfs4_domain(),
            public_login: default_public_login(),
            users: BTreeMap::new(),
        }
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| Error::io("read config", path, e))?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn directory(&self) -> StaticDirectory {
        let mut directory = StaticDirectory::new();
        for (login, uid) in &self.users {
            directory.insert(login.clone(), *uid);
        }
        directory
    }
}
