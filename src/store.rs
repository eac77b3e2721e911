//! Process-wide credential storage.
//!
//! The [`CredentialStore`] keeps the current access and refresh token in
//! memory and writes every change through to a durable [`Backend`]. Two
//! string values are persisted under fixed keys; a missing key means there is
//! no token of that kind.
//!
//! Observers [`subscribe`](CredentialStore::subscribe) to be told about every
//! mutation, for instance to recompute the [`Session`](crate::session::Session).
//!
//! # Example
//!
//! ```rust
//! use tourdesk::store::{CredentialStore, FileBackend};
//!
//! let store = CredentialStore::open(FileBackend::new("credentials.toml"))?;
//! let subscription = store.subscribe(|change| info!("credentials {change}"));
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
    time::SystemTime,
};

use veil::Redact;

use crate::{
    error::{Error, Result},
    session::Session,
    token::{self, TokenPair},
};

/// Key under which the access token is persisted.
pub const ACCESS_TOKEN_KEY: &str = "access_token";

/// Key under which the refresh token is persisted.
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Durable key-value storage for credentials.
pub trait Backend: Send + Sync {
    /// Retrieve a value, or `None` if the key is absent.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Store several values at once.
    ///
    /// Durable backends override this to persist all values in one write.
    fn set_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        entries
            .iter()
            .try_for_each(|(key, value)| self.set(key, value))
    }

    /// Delete several values at once.
    fn delete_many(&self, keys: &[&str]) -> Result<()> {
        keys.iter().try_for_each(|key| self.delete(key))
    }
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        (**self).set_many(entries)
    }

    fn delete_many(&self, keys: &[&str]) -> Result<()> {
        (**self).delete_many(keys)
    }
}

/// Non-durable backend, for tests and one-off sessions.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}

/// Backend persisting credentials in a TOML file.
///
/// Every change writes a sibling temporary file and renames it over the
/// credentials file, so a crash mid-write leaves the previous contents
/// intact. On Unix the file is readable and writable by the owner only, as
/// it grants access to the account.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,

    /// Serializes read-modify-write cycles on the file.
    lock: Mutex<()>,
}

impl FileBackend {
    /// Credential files hold two tokens; anything larger is not ours.
    const MAX_FILE_SIZE: u64 = 16 * 1024;

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<BTreeMap<String, String>> {
        // Prevent out-of-memory condition: credential file should be small.
        let file_size = match fs::metadata(&self.path) {
            Ok(attributes) => attributes.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::storage(format!(
                "{} is too large ({file_size} bytes)",
                self.path.display()
            )));
        }

        let contents = fs::read_to_string(&self.path)?;
        toml::from_str(&contents).map_err(|e| {
            Error::storage(format!("{} format is invalid: {e}", self.path.display()))
        })
    }

    fn write(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let contents = toml::to_string(values)?;

        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| {
                Error::storage(format!("{} is not a file path", self.path.display()))
            })?
            .to_string_lossy();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let tmp_path = self
            .path
            .with_file_name(format!(".{file_name}.{}.{nanos}.tmp", std::process::id()));

        let replaced = Self::replace(&tmp_path, &self.path, contents.as_bytes());
        if replaced.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        replaced.map_err(Into::into)
    }

    /// Writes `contents` to `tmp_path` and renames it over `path`.
    fn replace(tmp_path: &Path, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(tmp_path)?;
        io::Write::write_all(&mut file, contents)?;
        file.sync_all()?;
        drop(file);

        fs::rename(tmp_path, path)?;

        // Persist the rename itself. Not supported on every platform.
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            if let Ok(dir) = fs::File::open(dir) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

impl Backend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_many(&[(key, value)])
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.delete_many(&[key])
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = self.read()?;
        for (key, value) in entries {
            values.insert((*key).to_owned(), (*value).to_owned());
        }
        self.write(&values)
    }

    fn delete_many(&self, keys: &[&str]) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = self.read()?;
        let count = values.len();
        values.retain(|key, _| !keys.contains(&key.as_str()));
        if values.len() != count {
            self.write(&values)?;
        }
        Ok(())
    }
}

/// Mutation reported to subscribers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Change {
    /// Both tokens were set by a login.
    Stored,
    /// The access token, and possibly the refresh token, were replaced.
    Refreshed,
    /// All tokens were removed.
    Cleared,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stored => write!(f, "stored"),
            Self::Refreshed => write!(f, "refreshed"),
            Self::Cleared => write!(f, "cleared"),
        }
    }
}

/// Handle returned by [`CredentialStore::subscribe`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subscription(u64);

type Listener = Arc<dyn Fn(Change) + Send + Sync>;

#[derive(Clone, Default, Redact)]
struct Tokens {
    #[redact]
    access: Option<String>,
    #[redact]
    refresh: Option<String>,
}

/// Holds the current access and refresh token.
///
/// Mutations are serialized: each one updates memory, persists, and notifies
/// before the next one starts, so the backend and the listeners observe
/// changes in the order they were applied.
pub struct CredentialStore {
    backend: Box<dyn Backend>,
    tokens: RwLock<Tokens>,

    /// Held from the memory update until listeners have been notified.
    mutation: Mutex<()>,

    listeners: Mutex<Vec<(Subscription, Listener)>>,
    next_subscription: AtomicU64,
}

impl CredentialStore {
    /// Opens the store, loading any persisted tokens from `backend`.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the backend cannot be read.
    pub fn open<B>(backend: B) -> Result<Self>
    where
        B: Backend + 'static,
    {
        let access = backend
            .get(ACCESS_TOKEN_KEY)?
            .map(|token| token::normalize(&token).to_owned())
            .filter(|token| !token.is_empty());
        let refresh = backend
            .get(REFRESH_TOKEN_KEY)?
            .filter(|token| !token.trim().is_empty());
        debug!(
            "loaded credentials: access token {}, refresh token {}",
            if access.is_some() { "present" } else { "absent" },
            if refresh.is_some() { "present" } else { "absent" },
        );

        Ok(Self {
            backend: Box::new(backend),
            tokens: RwLock::new(Tokens { access, refresh }),
            mutation: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        })
    }

    /// Opens a store that forgets everything when dropped.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryBackend::new()),
            tokens: RwLock::default(),
            mutation: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        }
    }

    /// The current access token, normalized.
    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.read().access.clone()
    }

    /// The current refresh token.
    #[must_use]
    pub fn refresh_token(&self) -> Option<String> {
        self.read().refresh.clone()
    }

    /// Session state derived from the access token at the current time.
    #[must_use]
    pub fn session(&self) -> Session {
        self.session_at(SystemTime::now())
    }

    #[must_use]
    pub fn session_at(&self, now: SystemTime) -> Session {
        Session::from_access_token(self.read().access.as_deref(), now)
    }

    /// Sets both tokens after a login.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the tokens could not be persisted. The tokens are
    /// kept in memory regardless.
    pub fn store(&self, pair: &TokenPair) -> Result<()> {
        let access = token::normalize(&pair.access_token).to_owned();
        let refresh = pair.refresh_token.trim().to_owned();

        let _mutation = self.mutate();
        *self.write() = Tokens {
            access: Some(access.clone()),
            refresh: Some(refresh.clone()),
        };

        let persisted = self.backend.set_many(&[
            (ACCESS_TOKEN_KEY, access.as_str()),
            (REFRESH_TOKEN_KEY, refresh.as_str()),
        ]);
        self.notify(Change::Stored);
        persisted
    }

    /// Replaces the access token, and the refresh token if a new one was
    /// issued.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the tokens could not be persisted. The tokens are
    /// kept in memory regardless.
    pub fn refreshed(&self, access_token: &str, refresh_token: Option<&str>) -> Result<()> {
        let access = token::normalize(access_token).to_owned();
        let refresh = refresh_token
            .map(str::trim)
            .filter(|token| !token.is_empty());

        let _mutation = self.mutate();
        {
            let mut tokens = self.write();
            tokens.access = Some(access.clone());
            if let Some(refresh) = refresh {
                tokens.refresh = Some(refresh.to_owned());
            }
        }

        let persisted = match refresh {
            Some(refresh) => self.backend.set_many(&[
                (ACCESS_TOKEN_KEY, access.as_str()),
                (REFRESH_TOKEN_KEY, refresh),
            ]),
            None => self.backend.set(ACCESS_TOKEN_KEY, &access),
        };
        self.notify(Change::Refreshed);
        persisted
    }

    /// Removes all tokens.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the tokens could not be removed from the backend.
    /// They are removed from memory regardless.
    pub fn clear(&self) -> Result<()> {
        let _mutation = self.mutate();
        *self.write() = Tokens::default();

        let persisted = self
            .backend
            .delete_many(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY]);
        self.notify(Change::Cleared);
        persisted
    }

    /// Registers `listener` to be called after every mutation.
    ///
    /// Listeners are called in subscription order, without holding the token
    /// lock, so they may read from the store. They must not mutate it: the
    /// next mutation waits until all listeners have returned.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Change) + Send + Sync + 'static,
    {
        let subscription = Subscription(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((subscription, Arc::new(listener)));
        subscription
    }

    /// Removes a listener. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = listeners.len();
        listeners.retain(|(id, _)| *id != subscription);
        listeners.len() != count
    }

    fn notify(&self, change: Change) {
        trace!("credentials {change}");

        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(change);
        }
    }

    fn mutate(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tokens> {
        self.tokens.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tokens> {
        self.tokens.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("tokens", &*self.read())
            .finish_non_exhaustive()
    }
}
