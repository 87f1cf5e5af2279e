//! Leased temporary files and directories
//!
//! The engine owns every lease; `dispose` reclaims whatever is still
//! outstanding, so temp resources never outlive the engine.

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::{NamedTempFile, TempDir};
use tracing::debug;

use crate::command::AdapterKind;
use crate::error::Result;
use crate::events::{EventBus, EventPayload, TempKind};

enum Lease {
    File(NamedTempFile),
    Dir(TempDir),
}

impl Lease {
    fn path(&self) -> PathBuf {
        match self {
            Lease::File(file) => file.path().to_path_buf(),
            Lease::Dir(dir) => dir.path().to_path_buf(),
        }
    }

    fn kind(&self) -> TempKind {
        match self {
            Lease::File(_) => TempKind::File,
            Lease::Dir(_) => TempKind::Dir,
        }
    }
}

/// Registry of leased temp resources.
pub struct TempRegistry {
    leases: parking_lot::Mutex<Vec<Lease>>,
    bus: Arc<EventBus>,
}

impl TempRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            leases: parking_lot::Mutex::new(Vec::new()),
            bus,
        }
    }

    /// Lease a temp file; lives until `cleanup`.
    pub fn temp_file(&self) -> Result<PathBuf> {
        let file = NamedTempFile::new()?;
        let path = file.path().to_path_buf();
        self.bus.emit(
            AdapterKind::Local,
            EventPayload::TempCreate {
                path: path.display().to_string(),
                kind: TempKind::File,
            },
        );
        self.leases.lock().push(Lease::File(file));
        Ok(path)
    }

    /// Lease a temp directory; lives until `cleanup`.
    pub fn temp_dir(&self) -> Result<PathBuf> {
        let dir = TempDir::new()?;
        let path = dir.path().to_path_buf();
        self.bus.emit(
            AdapterKind::Local,
            EventPayload::TempCreate {
                path: path.display().to_string(),
                kind: TempKind::Dir,
            },
        );
        self.leases.lock().push(Lease::Dir(dir));
        Ok(path)
    }

    /// Number of outstanding leases.
    pub fn outstanding(&self) -> usize {
        self.leases.lock().len()
    }

    /// Reclaim every lease. Idempotent.
    pub fn cleanup(&self) {
        let leases: Vec<Lease> = self.leases.lock().drain(..).collect();
        for lease in leases {
            let path = lease.path();
            let kind = lease.kind();
            debug!(path = %path.display(), "reclaiming temp lease");
            // Dropping the lease deletes it.
            drop(lease);
            self.bus.emit(
                AdapterKind::Local,
                EventPayload::TempCleanup {
                    path: path.display().to_string(),
                    kind,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_and_cleanup() {
        let bus = Arc::new(EventBus::new());
        let registry = TempRegistry::new(bus);

        let file = registry.temp_file().unwrap();
        let dir = registry.temp_dir().unwrap();
        assert!(file.exists());
        assert!(dir.exists());
        assert_eq!(registry.outstanding(), 2);

        registry.cleanup();
        assert!(!file.exists());
        assert!(!dir.exists());
        assert_eq!(registry.outstanding(), 0);

        // Idempotent
        registry.cleanup();
    }

    #[test]
    fn test_temp_events() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let bus = Arc::new(EventBus::new());
        let created = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));

        let created2 = created.clone();
        bus.subscribe("temp:create", move |_| {
            created2.fetch_add(1, Ordering::SeqCst);
        });
        let cleaned2 = cleaned.clone();
        bus.subscribe("temp:cleanup", move |_| {
            cleaned2.fetch_add(1, Ordering::SeqCst);
        });

        let registry = TempRegistry::new(bus);
        registry.temp_file().unwrap();
        registry.cleanup();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }
}
