use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Condvar, Mutex, PoisonError};
use tracing::{debug, info};

/// Bounded pool of externally owned handles with scoped acquire/release.
///
/// `acquire` blocks until a handle is free and returns an RAII guard that
/// puts it back on drop. Worker threads may block here; the dispatcher
/// thread never calls in after startup.
pub struct ResourcePool<T> {
    handles: Mutex<Vec<T>>,
    available: Condvar,
}

impl<T> ResourcePool<T> {
    pub fn new(handles: Vec<T>) -> ResourcePool<T> {
        ResourcePool {
            handles: Mutex::new(handles),
            available: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> PoolGuard<'_, T> {
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(handle) = handles.pop() {
                return PoolGuard {
                    pool: self,
                    handle: Some(handle),
                };
            }
            handles = self
                .available
                .wait(handles)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn idle(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn release(&self, handle: T) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        self.available.notify_one();
    }
}

pub struct PoolGuard<'a, T> {
    pool: &'a ResourcePool<T>,
    handle: Option<T>,
}

impl<T> Deref for PoolGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.handle.as_ref().unwrap()
    }
}

impl<T> DerefMut for PoolGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.handle.as_mut().unwrap()
    }
}

impl<T> Drop for PoolGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    users: HashMap<String, String>,
}

/// Handle onto the on-disk user table. One lives in each pool slot; every
/// operation opens the file fresh, so handles carry no state of their own.
pub struct UserStore {
    path: PathBuf,
}

impl UserStore {
    pub fn new(path: PathBuf) -> UserStore {
        UserStore { path }
    }

    /// Reads the whole table. A missing file is an empty table, not an
    /// error: first boot has no users yet.
    pub fn load(&self) -> io::Result<HashMap<String, String>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(HashMap::new())
            }
            Err(e) => return Err(e),
        };
        let file: CredentialFile = serde_json::from_str(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(file.users)
    }

    pub fn append(&self, user: &str, password: &str) -> io::Result<()> {
        let mut users = self.load()?;
        users.insert(user.to_string(), password.to_string());
        let file = CredentialFile { users };
        let raw = serde_json::to_string_pretty(&file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, raw)
    }
}

/// Shared server context: document root, credential cache and the store
/// pool behind it. Built once in main and passed to the dispatcher and the
/// workers.
pub struct Context {
    pub doc_root: PathBuf,
    credentials: Mutex<HashMap<String, String>>,
    store: ResourcePool<UserStore>,
}

impl Context {
    pub fn new(doc_root: PathBuf, store_path: PathBuf, pool_size: usize) -> Context {
        let handles: Vec<UserStore> = (0..pool_size.max(1))
            .map(|_| UserStore::new(store_path.clone()))
            .collect();
        Context {
            doc_root,
            credentials: Mutex::new(HashMap::new()),
            store: ResourcePool::new(handles),
        }
    }

    /// Loads the user table into the in-memory cache, once, at startup.
    /// The cache is never refreshed afterwards: requests pay zero store
    /// round-trips, and rows changed behind the server's back stay
    /// invisible until restart.
    pub fn preload(&self) -> io::Result<usize> {
        let handle = self.store.acquire();
        let table = handle.load()?;
        let count = table.len();
        *self
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = table;
        info!("credential cache primed with {count} users");
        Ok(count)
    }

    pub fn verify(&self, user: &str, password: &str) -> bool {
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user)
            .map(|stored| stored == password)
            .unwrap_or(false)
    }

    /// Registers a new user: persists through a pooled handle, then mirrors
    /// into the cache. `Ok(false)` means the name is taken.
    pub fn register(&self, user: &str, password: &str) -> io::Result<bool> {
        {
            let cache = self
                .credentials
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if cache.contains_key(user) {
                debug!("register rejected, user {user} exists");
                return Ok(false);
            }
        }
        let handle = self.store.acquire();
        handle.append(user, password)?;
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user.to_string(), password.to_string());
        Ok(true)
    }
}
