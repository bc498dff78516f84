//! Version-gated holder for cluster map snapshots

use fds_common::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

/// A cluster map carrying a monotonically increasing version
pub trait Versioned {
    fn version(&self) -> u64;
}

/// Holds the current snapshot of a versioned cluster map
///
/// Snapshots are immutable; `update` swaps in a strictly newer one and
/// hands back the one it replaced so callers can diff them.
pub struct TableHolder<T> {
    current: RwLock<Option<Arc<T>>>,
    kind: &'static str,
}

impl<T: Versioned> TableHolder<T> {
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            current: RwLock::new(None),
            kind,
        }
    }

    /// Current snapshot, if one has been installed
    #[must_use]
    pub fn current(&self) -> Option<Arc<T>> {
        self.current.read().clone()
    }

    /// Version of the current snapshot, 0 if none
    #[must_use]
    pub fn version(&self) -> u64 {
        self.current.read().as_ref().map_or(0, |t| t.version())
    }

    /// Whether `version` is still the current one
    #[must_use]
    pub fn is_current(&self, version: u64) -> bool {
        self.version() == version
    }

    /// Install a newer snapshot, returning the previous one
    pub fn update(&self, table: T) -> Result<(Option<Arc<T>>, Arc<T>)> {
        let mut current = self.current.write();
        let old_version = current.as_ref().map_or(0, |t| t.version());
        if table.version() <= old_version {
            warn!(
                "Rejecting {} version {}, current is {}",
                self.kind,
                table.version(),
                old_version
            );
            return Err(Error::VersionMismatch {
                expected: old_version + 1,
                actual: table.version(),
            });
        }
        let table = Arc::new(table);
        let old = current.replace(Arc::clone(&table));
        info!("Installed {} version {} (was {})", self.kind, table.version(), old_version);
        Ok((old, table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct V(u64);

    impl Versioned for V {
        fn version(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn test_rejects_non_increasing() {
        let holder = TableHolder::new("test");
        assert_eq!(holder.version(), 0);
        let (old, _) = holder.update(V(3)).unwrap();
        assert!(old.is_none());
        assert!(matches!(
            holder.update(V(3)),
            Err(Error::VersionMismatch { expected: 4, actual: 3 })
        ));
        assert!(holder.update(V(2)).is_err());
        let (old, new) = holder.update(V(5)).unwrap();
        assert_eq!(old.unwrap().version(), 3);
        assert_eq!(new.version(), 5);
        assert!(holder.is_current(5));
    }
}
