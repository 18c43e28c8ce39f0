//! Shared key-value store, its lock, and the Gateway address registry.
//!
//! Gateways publish their lan address under [`GATEWAY_ADDRESS_KEY`] so that
//! BusinessWorkers can find them. Workers record which Gateway and socket a
//! uid is connected through, keyed by the uid's decimal value.
//!
//! Two implementations are provided:
//!
//! * [`MemoryStore`] + [`LocalLock`] - a single process (tests, embedded use)
//! * [`FileStore`] + [`LockFile`] - several processes sharing a directory

use crate::error::StoreError;
use gateway_protocol::Uid;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Key of the JSON array holding every registered Gateway lan address.
pub const GATEWAY_ADDRESS_KEY: &str = "GLOBAL_GATEWAY_ADDRESS";

static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Opaque key-value storage shared between Gateways and workers.
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Returns whether the key existed.
    fn delete(&self, key: &str) -> StoreResult<bool>;
}

/// Mutual exclusion around read-modify-write sequences on the store.
pub trait RegistryLock: Send + Sync {
    fn acquire(&self) -> StoreResult<()>;

    fn release(&self) -> StoreResult<()>;
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }
}

/// One file per key inside a directory.
///
/// Writes go to a temporary file that is renamed over the target, so readers
/// never observe a partial value.
#[derive(Debug, Clone)]
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    /// Opens (and creates if needed) the store directory.
    pub fn open(directory: impl Into<PathBuf>) -> StoreResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|source| StoreError::Io {
            key: directory.display().to_string(),
            source,
        })?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.directory.join(format!("{name}.value"))
    }
}

impl Store for FileStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let target = self.path_for(key);
        let sequence = TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let temp = target.with_extension(format!("tmp-{}-{sequence}", std::process::id()));
        let io_error = |source| StoreError::Io {
            key: key.to_string(),
            source,
        };
        fs::write(&temp, value).map_err(io_error)?;
        fs::rename(&temp, &target).map_err(io_error)
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// In-process lock that can be held across method calls.
#[derive(Debug)]
pub struct LocalLock {
    held: Mutex<bool>,
    released: Condvar,
    timeout: Duration,
}

impl LocalLock {
    pub fn new(timeout: Duration) -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
            timeout,
        }
    }
}

impl Default for LocalLock {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl RegistryLock for LocalLock {
    fn acquire(&self) -> StoreResult<()> {
        let deadline = Instant::now() + self.timeout;
        let mut held = self.held.lock();
        while *held {
            if self.released.wait_until(&mut held, deadline).timed_out() && *held {
                return Err(StoreError::LockTimeout(self.timeout));
            }
        }
        *held = true;
        Ok(())
    }

    fn release(&self) -> StoreResult<()> {
        *self.held.lock() = false;
        self.released.notify_one();
        Ok(())
    }
}

/// Cross-process lock: an exclusive `flock(2)` on a file in the registry
/// directory.
///
/// The kernel releases the lock when the holder's descriptor closes, so a
/// crashed process never leaves the registry locked. The file itself stays in
/// place and records the pid of the last holder for diagnostics.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    timeout: Duration,
    held: Mutex<Option<File>>,
}

impl LockFile {
    const RETRY: Duration = Duration::from_millis(5);

    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            held: Mutex::new(None),
        }
    }

    fn lock_error(&self, e: io::Error) -> StoreError {
        StoreError::Lock(format!("{}: {e}", self.path.display()))
    }
}

/// Tries to take an exclusive lock on `file` without blocking.
fn try_flock(file: &File) -> io::Result<bool> {
    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(false),
        _ => Err(err),
    }
}

impl RegistryLock for LockFile {
    fn acquire(&self) -> StoreResult<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.lock_error(e))?;
        let deadline = Instant::now() + self.timeout;
        while !try_flock(&file).map_err(|e| self.lock_error(e))? {
            if Instant::now() >= deadline {
                return Err(StoreError::LockTimeout(self.timeout));
            }
            std::thread::sleep(Self::RETRY);
        }

        let mut holder = &file;
        if let Err(e) = file.set_len(0).and_then(|_| writeln!(holder, "{}", std::process::id())) {
            debug!(path = %self.path.display(), "Could not record lock holder: {}", e);
        }
        *self.held.lock() = Some(file);
        Ok(())
    }

    fn release(&self) -> StoreResult<()> {
        let Some(file) = self.held.lock().take() else {
            return Err(StoreError::Lock(format!("{}: not held", self.path.display())));
        };
        // SAFETY: the descriptor belongs to `file`, which outlives the call.
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if ret != 0 {
            return Err(self.lock_error(io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// Where a uid is connected: the Gateway lan address and the socket id there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidLocation {
    pub gateway: String,
    pub socket_id: u32,
}

/// Gateway address list and uid locations on top of a [`Store`].
#[derive(Clone)]
pub struct AddressRegistry {
    store: Arc<dyn Store>,
    lock: Arc<dyn RegistryLock>,
}

impl AddressRegistry {
    pub fn new(store: Arc<dyn Store>, lock: Arc<dyn RegistryLock>) -> Self {
        Self { store, lock }
    }

    /// Registry on a fresh [`MemoryStore`] with a [`LocalLock`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(LocalLock::default()))
    }

    /// Registry on a [`FileStore`] in `directory`, locked by a lock file there.
    pub fn in_directory(directory: impl Into<PathBuf>, lock_timeout: Duration) -> StoreResult<Self> {
        let store = FileStore::open(directory)?;
        let lock = LockFile::new(store.directory().join("registry.lock"), lock_timeout);
        Ok(Self::new(Arc::new(store), Arc::new(lock)))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn locked<T>(&self, f: impl FnOnce(&dyn Store) -> StoreResult<T>) -> StoreResult<T> {
        self.lock.acquire()?;
        let result = f(self.store.as_ref());
        let released = self.lock.release();
        let value = result?;
        released?;
        Ok(value)
    }

    fn read_addresses(store: &dyn Store) -> StoreResult<BTreeSet<String>> {
        match store.get(GATEWAY_ADDRESS_KEY)? {
            None => Ok(BTreeSet::new()),
            Some(raw) if raw.is_empty() => Ok(BTreeSet::new()),
            Some(raw) => serde_json::from_slice(&raw).map_err(|e| StoreError::Corrupt {
                key: GATEWAY_ADDRESS_KEY.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn write_addresses(store: &dyn Store, addresses: &BTreeSet<String>) -> StoreResult<()> {
        let raw = serde_json::to_vec(addresses).map_err(|e| StoreError::Corrupt {
            key: GATEWAY_ADDRESS_KEY.to_string(),
            reason: e.to_string(),
        })?;
        store.set(GATEWAY_ADDRESS_KEY, &raw)
    }

    /// Adds a Gateway lan address ("ip:port").
    pub fn register(&self, address: &str) -> StoreResult<()> {
        self.locked(|store| {
            let mut addresses = Self::read_addresses(store)?;
            addresses.insert(address.to_string());
            Self::write_addresses(store, &addresses)
        })?;
        debug!(address, "📇 Gateway address registered");
        Ok(())
    }

    pub fn unregister(&self, address: &str) -> StoreResult<()> {
        self.locked(|store| {
            let mut addresses = Self::read_addresses(store)?;
            addresses.remove(address);
            Self::write_addresses(store, &addresses)
        })?;
        debug!(address, "📇 Gateway address unregistered");
        Ok(())
    }

    /// Snapshot of registered Gateway addresses. Reads do not take the lock.
    pub fn addresses(&self) -> StoreResult<BTreeSet<String>> {
        Self::read_addresses(self.store.as_ref())
    }

    pub fn set_uid_location(&self, uid: Uid, location: &UidLocation) -> StoreResult<()> {
        let raw = serde_json::to_vec(location).map_err(|e| StoreError::Corrupt {
            key: uid.to_string(),
            reason: e.to_string(),
        })?;
        self.store.set(&uid.to_string(), &raw)
    }

    pub fn uid_location(&self, uid: Uid) -> StoreResult<Option<UidLocation>> {
        let Some(raw) = self.store.get(&uid.to_string())? else {
            return Ok(None);
        };
        match serde_json::from_slice(&raw) {
            Ok(location) => Ok(Some(location)),
            Err(e) => {
                warn!(%uid, error = %e, "Ignoring unreadable uid location");
                Ok(None)
            }
        }
    }

    pub fn delete_uid_location(&self, uid: Uid) -> StoreResult<bool> {
        self.store.delete(&uid.to_string())
    }
}

impl std::fmt::Debug for AddressRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_register_and_unregister() {
        let registry = AddressRegistry::in_memory();
        registry.register("127.0.0.1:4000").unwrap();
        registry.register("127.0.0.1:4001").unwrap();
        registry.register("127.0.0.1:4000").unwrap();
        assert_eq!(registry.addresses().unwrap().len(), 2);

        registry.unregister("127.0.0.1:4000").unwrap();
        let addresses = registry.addresses().unwrap();
        assert!(addresses.contains("127.0.0.1:4001"));
        assert!(!addresses.contains("127.0.0.1:4000"));
    }

    #[test]
    fn test_value_is_json_array() {
        let registry = AddressRegistry::in_memory();
        registry.register("10.0.0.1:7000").unwrap();
        let raw = registry.store().get(GATEWAY_ADDRESS_KEY).unwrap().unwrap();
        let parsed: Vec<String> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(parsed, vec!["10.0.0.1:7000".to_string()]);
    }

    #[test]
    fn test_corrupt_value_is_reported() {
        let registry = AddressRegistry::in_memory();
        registry.store().set(GATEWAY_ADDRESS_KEY, b"{oops").unwrap();
        assert!(matches!(registry.addresses(), Err(StoreError::Corrupt { .. })));
        assert!(registry.register("127.0.0.1:1").is_err());
    }

    #[test]
    fn test_lock_is_released_after_failure() {
        let registry = AddressRegistry::in_memory();
        registry.store().set(GATEWAY_ADDRESS_KEY, b"{oops").unwrap();
        assert!(registry.register("127.0.0.1:1").is_err());
        registry.store().delete(GATEWAY_ADDRESS_KEY).unwrap();
        registry.register("127.0.0.1:1").unwrap();
    }

    #[test]
    fn test_uid_locations() {
        let registry = AddressRegistry::in_memory();
        let location = UidLocation {
            gateway: "127.0.0.1:4000".to_string(),
            socket_id: 12,
        };
        registry.set_uid_location(Uid::new(7), &location).unwrap();
        assert_eq!(registry.uid_location(Uid::new(7)).unwrap(), Some(location));
        assert!(registry.delete_uid_location(Uid::new(7)).unwrap());
        assert_eq!(registry.uid_location(Uid::new(7)).unwrap(), None);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("nested")).unwrap();
        assert_eq!(store.get("missing").unwrap(), None);
        store.set("a/b", b"value").unwrap();
        assert_eq!(store.get("a/b").unwrap(), Some(b"value".to_vec()));
        assert!(store.delete("a/b").unwrap());
        assert!(!store.delete("a/b").unwrap());
    }

    #[test]
    fn test_lock_file_excludes_second_holder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.lock");
        let first = LockFile::new(&path, Duration::from_millis(50));
        let second = LockFile::new(&path, Duration::from_millis(50));

        first.acquire().unwrap();
        assert!(matches!(second.acquire(), Err(StoreError::LockTimeout(_))));
        first.release().unwrap();
        second.acquire().unwrap();
        second.release().unwrap();
    }

    #[test]
    fn test_lock_left_by_a_dead_holder_does_not_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.lock");
        // Left behind by a holder that never released.
        fs::write(&path, "4194303\n").unwrap();
        let crashed = LockFile::new(&path, Duration::from_millis(50));
        crashed.acquire().unwrap();
        drop(crashed);

        let next = LockFile::new(&path, Duration::from_millis(50));
        next.acquire().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), format!("{}\n", std::process::id()));
        next.release().unwrap();
        assert!(next.release().is_err());
    }

    #[test]
    fn test_local_lock_times_out() {
        let lock = LocalLock::new(Duration::from_millis(20));
        lock.acquire().unwrap();
        assert!(lock.acquire().is_err());
        lock.release().unwrap();
        lock.acquire().unwrap();
    }

    #[test]
    fn test_concurrent_registration_through_files() {
        let dir = TempDir::new().unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    let registry = AddressRegistry::in_directory(path, Duration::from_secs(5)).unwrap();
                    registry.register(&format!("127.0.0.1:{}", 5000 + i)).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let registry = AddressRegistry::in_directory(dir.path(), Duration::from_secs(5)).unwrap();
        assert_eq!(registry.addresses().unwrap().len(), 8);
    }
}
