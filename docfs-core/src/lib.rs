pub mod acl;
pub mod backend;
pub mod cache;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod filesystem;
pub mod identity;
pub mod path;
pub mod sharing;
pub mod storage;
pub mod views;

pub use config::OverlayConfig;
pub use document::SyncDocument;
pub use error::{Error, Result};
pub use filesystem::{Overlay, OverlayFile};
pub use identity::{Identity, StaticDirectory, UserDirectory};
