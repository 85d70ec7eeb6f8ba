//! Public-key resolution against the profile directory.
//!
//! Results, including "no key published", are cached for the lifetime of the
//! session and dropped on a `profile_detected` notification. The cache is a
//! plain FIFO cap: once full, the oldest inserted entry goes first.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sigil_shared::constants::DIRECTORY_TIMEOUT;
use sigil_shared::crypto::decode_public_key;
use sigil_shared::Address;
use tracing::{debug, warn};
use x25519_dalek::PublicKey;

use crate::error::{EngineError, Result};

/// Directory record for one address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub exists: bool,
    /// Base64 X25519 public key.
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub show_avatar: bool,
}

/// Profile lookup. `Ok(None)` is a valid negative answer, not an error.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn profile(&self, address: &Address) -> Result<Option<Profile>>;
}

/// Directory backed by the relay's HTTP API: `GET {base}/profile/{address}`.
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn profile(&self, address: &Address) -> Result<Option<Profile>> {
        let url = format!("{}/profile/{}", self.base_url, address);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(EngineError::Directory(format!("{url}: {status}")));
        }
        Ok(Some(resp.json().await?))
    }
}

/// A usable key plus the display name published with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub public_key: PublicKey,
    pub username: Option<String>,
}

#[derive(Debug, Clone)]
enum Entry {
    Found(ResolvedKey),
    Missing,
}

struct FifoCache {
    entries: HashMap<Address, Entry>,
    order: VecDeque<Address>,
    capacity: usize,
    /// Bumped by every invalidation. A lookup that started under an older
    /// generation must not be cached.
    generations: HashMap<Address, u64>,
}

impl FifoCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            generations: HashMap::new(),
        }
    }

    fn get(&self, address: &Address) -> Option<&Entry> {
        self.entries.get(address)
    }

    fn generation(&self, address: &Address) -> u64 {
        self.generations.get(address).copied().unwrap_or(0)
    }

    fn bump(&mut self, address: &Address) {
        *self.generations.entry(address.clone()).or_insert(0) += 1;
    }

    fn insert(&mut self, address: Address, entry: Entry) {
        if self.entries.insert(address.clone(), entry).is_some() {
            return;
        }
        self.order.push_back(address);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, address: &Address) -> bool {
        if self.entries.remove(address).is_none() {
            return false;
        }
        self.order.retain(|a| a != address);
        true
    }
}

/// Session-scoped key cache in front of a [`Directory`].
///
/// All mutation happens under one lock that is never held across an await.
pub struct KeyResolver {
    directory: Arc<dyn Directory>,
    cache: Mutex<FifoCache>,
    lookup_timeout: Duration,
}

impl KeyResolver {
    pub fn new(directory: Arc<dyn Directory>, capacity: usize) -> Self {
        Self {
            directory,
            cache: Mutex::new(FifoCache::new(capacity)),
            lookup_timeout: DIRECTORY_TIMEOUT,
        }
    }

    /// Give up on a directory lookup after `timeout`; the miss is not cached.
    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    fn cache(&self) -> MutexGuard<'_, FifoCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve `address` to its published key. Placeholder addresses never
    /// reach the directory. Transport failures are not cached.
    pub async fn resolve(&self, address: &Address) -> Option<ResolvedKey> {
        if address.is_unknown() {
            return None;
        }
        let generation = {
            let cache = self.cache();
            if let Some(entry) = cache.get(address) {
                return match entry {
                    Entry::Found(key) => Some(key.clone()),
                    Entry::Missing => None,
                };
            }
            cache.generation(address)
        };

        let lookup = tokio::time::timeout(self.lookup_timeout, self.directory.profile(address));
        let entry = match lookup.await {
            Ok(Ok(Some(profile))) => entry_from_profile(address, profile),
            Ok(Ok(None)) => Entry::Missing,
            Ok(Err(e)) => {
                warn!(address = %address, error = %e, "directory lookup failed");
                return None;
            }
            Err(_) => {
                warn!(address = %address, timeout = ?self.lookup_timeout, "directory lookup timed out");
                return None;
            }
        };

        let resolved = match &entry {
            Entry::Found(key) => Some(key.clone()),
            Entry::Missing => None,
        };
        let mut cache = self.cache();
        if cache.generation(address) == generation {
            debug!(address = %address, found = resolved.is_some(), "key cached");
            cache.insert(address.clone(), entry);
        } else {
            debug!(address = %address, "key invalidated during lookup, not cached");
        }
        resolved
    }

    /// Forget whatever is cached for `address`, positive or negative, and
    /// keep any lookup already in flight from caching its answer.
    pub fn invalidate(&self, address: &Address) {
        let mut cache = self.cache();
        cache.bump(address);
        if cache.remove(address) {
            debug!(address = %address, "key cache entry invalidated");
        }
    }

    /// Seed a key that is already known, such as the session's own.
    pub fn insert_known(&self, address: Address, public_key: PublicKey) {
        self.cache().insert(
            address,
            Entry::Found(ResolvedKey {
                public_key,
                username: None,
            }),
        );
    }

    /// Cached display name, without touching the directory.
    pub fn cached_username(&self, address: &Address) -> Option<String> {
        match self.cache().get(address) {
            Some(Entry::Found(key)) => key.username.clone(),
            _ => None,
        }
    }
}

fn entry_from_profile(address: &Address, profile: Profile) -> Entry {
    if !profile.exists {
        return Entry::Missing;
    }
    let Some(encoded) = profile.public_key.as_deref() else {
        return Entry::Missing;
    };
    match decode_public_key(encoded) {
        Ok(public_key) => Entry::Found(ResolvedKey {
            public_key,
            username: profile.username.filter(|name| !name.is_empty()),
        }),
        Err(e) => {
            warn!(address = %address, error = %e, "directory returned an unusable key");
            Entry::Missing
        }
    }
}

/// In-memory directory for tests and offline runs.
#[derive(Default)]
pub struct StaticDirectory {
    profiles: Mutex<HashMap<Address, Profile>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, address: &Address, public_key: &PublicKey, username: Option<&str>) {
        let profile = Profile {
            exists: true,
            public_key: Some(sigil_shared::crypto::encode_public_key(public_key)),
            username: username.map(str::to_string),
            show_avatar: false,
        };
        self.profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.clone(), profile);
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn profile(&self, address: &Address) -> Result<Option<Profile>> {
        Ok(self
            .profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned())
    }
}
