//! Session registry: maps channel identifiers to live cipher states.
//!
//! The registry is an owned object; servers share it behind an `Arc`.
//! Lookups take the map's read lock only, and each channel guards its two
//! directions with separate mutexes, so traffic on different channels (or
//! in opposite directions on one channel) never serializes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use latch_crypto::{CipherState, CipherStatePair};
use tracing::{debug, info, warn};

use crate::channel_id::{ChannelId, IdScheme};
use crate::config::ChannelConfig;
use crate::error::{Error, Result};

/// Random draws before giving up on finding a free id.
pub const MAX_ALLOCATION_ATTEMPTS: usize = 128;

/// Registry limits, usually taken from [`ChannelConfig`].
#[derive(Debug, Clone, Copy)]
pub struct RegistryLimits {
    pub max_sessions: usize,
    pub idle_timeout: Option<Duration>,
    /// 0 disables invalidation.
    pub max_auth_failures: u32,
}

impl From<&ChannelConfig> for RegistryLimits {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            max_sessions: config.max_sessions,
            idle_timeout: config.idle_timeout(),
            max_auth_failures: config.max_auth_failures,
        }
    }
}

impl Default for RegistryLimits {
    fn default() -> Self {
        (&ChannelConfig::default()).into()
    }
}

/// One established channel, server side.
pub struct Channel {
    id: ChannelId,
    encrypter: Mutex<CipherState>,
    decrypter: Mutex<CipherState>,
    last_used: Mutex<Instant>,
    auth_failures: AtomicU32,
}

impl Channel {
    fn new(id: ChannelId, pair: CipherStatePair) -> Self {
        Self {
            id,
            encrypter: Mutex::new(pair.encrypter),
            decrypter: Mutex::new(pair.decrypter),
            last_used: Mutex::new(Instant::now()),
            auth_failures: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Encrypt an outbound message.
    pub fn seal(&self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = lock(&self.encrypter)?.encrypt(ad, plaintext)?;
        self.touch();
        Ok(ciphertext)
    }

    /// Decrypt an inbound message. Nothing is returned unless the tag verifies.
    pub fn open(&self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let plaintext = lock(&self.decrypter)?.decrypt(ad, ciphertext)?;
        self.auth_failures.store(0, Ordering::Relaxed);
        self.touch();
        Ok(plaintext)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub fn auth_failures(&self) -> u32 {
        self.auth_failures.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.lock() {
            *last_used = Instant::now();
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("auth_failures", &self.auth_failures())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::internal("cipher state lock poisoned"))
}

enum Slot {
    /// Id handed out to a handshake that has not finished yet.
    Reserved,
    Live(Arc<Channel>),
}

/// Registry of live channels.
pub struct SessionRegistry {
    channels: RwLock<HashMap<ChannelId, Slot>>,
    limits: RegistryLimits,
}

impl SessionRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            limits,
        }
    }

    pub fn limits(&self) -> &RegistryLimits {
        &self.limits
    }

    /// Reserve a random unused id for an assigning scheme.
    ///
    /// The id stays reserved until the returned [`Reservation`] is committed
    /// or dropped, so two concurrent handshakes never get the same id.
    pub fn allocate(&self, scheme: IdScheme) -> Result<Reservation<'_>> {
        let mut rng = rand::thread_rng();
        let mut channels = self.write()?;
        self.check_capacity(&channels)?;

        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let id = ChannelId::random(scheme, &mut rng)?;
            if !channels.contains_key(&id) {
                channels.insert(id.clone(), Slot::Reserved);
                return Ok(Reservation::new(self, id));
            }
        }

        warn!(
            "no free {:?} id after {} attempts ({} slots in use)",
            scheme,
            MAX_ALLOCATION_ATTEMPTS,
            channels.len()
        );
        Err(Error::AllocationExhausted(MAX_ALLOCATION_ATTEMPTS))
    }

    /// Reserve a specific id, failing if it is already taken.
    pub fn reserve(&self, id: ChannelId) -> Result<Reservation<'_>> {
        let mut channels = self.write()?;
        if channels.contains_key(&id) {
            return Err(Error::ChannelCollision(id));
        }
        self.check_capacity(&channels)?;
        channels.insert(id.clone(), Slot::Reserved);
        Ok(Reservation::new(self, id))
    }

    /// Insert a channel under an id that must not be in use.
    pub fn register(&self, id: ChannelId, pair: CipherStatePair) -> Result<Arc<Channel>> {
        self.reserve(id)?.commit(pair)
    }

    /// Insert a channel, replacing any earlier channel with the same id.
    ///
    /// Only for transport-native ids, where a peer re-keys by handshaking again.
    pub fn rekey(&self, id: ChannelId, pair: CipherStatePair) -> Result<Arc<Channel>> {
        let mut channels = self.write()?;
        if !channels.contains_key(&id) {
            self.check_capacity(&channels)?;
        }

        let channel = Arc::new(Channel::new(id.clone(), pair));
        if channels
            .insert(id.clone(), Slot::Live(channel.clone()))
            .is_some()
        {
            debug!("channel {} re-keyed", id);
        }
        Ok(channel)
    }

    pub fn lookup(&self, id: &ChannelId) -> Result<Arc<Channel>> {
        match self.read()?.get(id) {
            Some(Slot::Live(channel)) => {
                channel.touch();
                Ok(channel.clone())
            }
            _ => Err(Error::UnknownChannel(id.clone())),
        }
    }

    /// Tear down a channel. Later lookups fail with `UnknownChannel`.
    pub fn remove(&self, id: &ChannelId) -> Result<Arc<Channel>> {
        let mut channels = self.write()?;
        match channels.get(id) {
            Some(Slot::Live(_)) => {}
            _ => return Err(Error::UnknownChannel(id.clone())),
        }
        match channels.remove(id) {
            Some(Slot::Live(channel)) => Ok(channel),
            _ => Err(Error::UnknownChannel(id.clone())),
        }
    }

    /// Remove `channel` only if it is still the one registered under its id.
    ///
    /// A re-keyed peer may already own the id with a fresh channel; that
    /// successor is left alone and false is returned.
    pub fn remove_channel(&self, channel: &Arc<Channel>) -> Result<bool> {
        let mut channels = self.write()?;
        let current = matches!(
            channels.get(channel.id()),
            Some(Slot::Live(live)) if Arc::ptr_eq(live, channel)
        );
        if current {
            channels.remove(channel.id());
        }
        Ok(current)
    }

    /// Drop channels idle longer than the configured timeout.
    pub fn expire_idle(&self) -> Result<usize> {
        let Some(timeout) = self.limits.idle_timeout else {
            return Ok(0);
        };

        let mut channels = self.write()?;
        let before = channels.len();
        channels.retain(|id, slot| match slot {
            Slot::Live(channel) if channel.idle_for() > timeout => {
                debug!("channel {} expired after {:?} idle", id, channel.idle_for());
                false
            }
            _ => true,
        });

        let removed = before - channels.len();
        if removed > 0 {
            info!("expired {} idle channels", removed);
        }
        Ok(removed)
    }

    /// Count a failed decrypt on `channel`.
    ///
    /// Returns true if the failure pushed the channel over the limit and it
    /// was removed.
    pub fn record_auth_failure(&self, channel: &Arc<Channel>) -> Result<bool> {
        let failures = channel.auth_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let max = self.limits.max_auth_failures;
        if max == 0 || failures < max {
            return Ok(false);
        }

        let current = self.remove_channel(channel)?;
        if current {
            warn!(
                "channel {} invalidated after {} authentication failures",
                channel.id(),
                failures
            );
        }
        Ok(current)
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.read()
            .map(|channels| {
                channels
                    .values()
                    .filter(|slot| matches!(slot, Slot::Live(_)))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_capacity(&self, channels: &HashMap<ChannelId, Slot>) -> Result<()> {
        if channels.len() >= self.limits.max_sessions {
            warn!("session registry full ({} channels)", channels.len());
            return Err(Error::RegistryFull(self.limits.max_sessions));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<ChannelId, Slot>>> {
        self.channels
            .read()
            .map_err(|_| Error::internal("session registry lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<ChannelId, Slot>>> {
        self.channels
            .write()
            .map_err(|_| Error::internal("session registry lock poisoned"))
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistryLimits::default())
    }
}

/// An id held for an in-flight handshake.
///
/// Dropping it without calling [`Reservation::commit`] frees the id again,
/// so a failed handshake leaves the registry as it was.
pub struct Reservation<'a> {
    registry: &'a SessionRegistry,
    id: ChannelId,
    committed: bool,
}

impl<'a> Reservation<'a> {
    fn new(registry: &'a SessionRegistry, id: ChannelId) -> Self {
        Self {
            registry,
            id,
            committed: false,
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Make the channel live under the reserved id.
    pub fn commit(mut self, pair: CipherStatePair) -> Result<Arc<Channel>> {
        let channel = Arc::new(Channel::new(self.id.clone(), pair));
        self.registry
            .write()?
            .insert(self.id.clone(), Slot::Live(channel.clone()));
        self.committed = true;
        Ok(channel)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Ok(mut channels) = self.registry.channels.write() {
            if matches!(channels.get(&self.id), Some(Slot::Reserved)) {
                channels.remove(&self.id);
            }
        }
    }
}
