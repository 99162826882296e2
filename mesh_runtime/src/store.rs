//! `ServiceStore` over the local filesystem: the received service binary is
//! persisted at a single configured path.

use mesh_core::mediator::ServiceStore;
use std::path::PathBuf;
use std::sync::Mutex;

/// Persists the service executable's bytes at a fixed path, serializing
/// concurrent writers (a receive and a reset cannot race on the same file).
#[derive(Debug)]
pub struct FileServiceStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileServiceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileServiceStore { path: path.into(), lock: Mutex::new(()) }
    }
}

impl ServiceStore for FileServiceStore {
    fn read_bytes(&self) -> std::io::Result<Vec<u8>> {
        let _guard = self.lock.lock().unwrap();
        std::fs::read(&self.path)
    }

    fn write_bytes(&self, bytes: &[u8]) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap();
        std::fs::write(&self.path, bytes)
    }

    fn remove(&self) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_bytes_through_the_file() {
        let dir = std::env::temp_dir().join(format!("mesh_runtime_store_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = FileServiceStore::new(dir.join("service.bin"));

        store.write_bytes(b"hello").unwrap();
        assert_eq!(store.read_bytes().unwrap(), b"hello");

        store.remove().unwrap();
        assert!(store.read_bytes().is_err());

        // removing an already-absent file is not an error
        store.remove().unwrap();

        std::fs::remove_dir_all(&dir).ok();
    }
}
