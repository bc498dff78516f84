//! Object metadata: record layout, WAL, ordered index, ARC cache and the
//! store that ties them together

pub mod cache;
pub mod index;
pub mod obj_meta;
pub mod store;
pub mod wal;

pub use cache::{ArcCache, CacheStats};
pub use obj_meta::{ObjMetaData, ObjPhyLoc, VolAssoc};
pub use store::{MetaStoreConfig, ObjectMetadataStore};
pub use wal::WalConfig;
