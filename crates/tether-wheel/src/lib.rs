//! Bucketed timeout wheel for Tether.
//!
//! Every timeout in the server (auth wait, bind wait, idle wait, heartbeat
//! kick, offline unload, token lifetime) is one [`TimeoutWheel`] with its own
//! duration, bucket count and release action. The wheel itself is passive:
//! a single driver task calls [`TimeoutWheel::advance`] once per tick.
//!
//! # Guarantees
//!
//! - An item fires no earlier than `timeout` after it was inserted (or last
//!   re-armed) and at most one tick later.
//! - Each item is released at most once.
//! - [`TimeoutWheel::remove`] returning `true` means the item was cancelled
//!   before the wheel claimed it; it will never be released.
//!
//! # Integration
//!
//! ```ignore
//! let wheel = Arc::new(TimeoutWheel::new(WheelConfig::new("idle", idle, 300))?);
//! tokio::spawn(Arc::clone(&wheel).run(shutdown_rx));
//! let key = wheel.insert(Arc::new(IdleExpiry { conn: Arc::downgrade(&conn) }));
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace};

static NEXT_TIMER_KEY: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Errors raised when a wheel is built from an unusable configuration.
#[derive(Debug, thiserror::Error)]
pub enum WheelError {
    /// A wheel needs at least one bucket.
    #[error("wheel {0} must have at least one bucket")]
    NoBuckets(&'static str),

    /// More buckets than a tick computation can divide by.
    #[error("wheel {name}: {buckets} buckets exceeds the maximum of {max}", max = u32::MAX)]
    TooManyBuckets { name: &'static str, buckets: usize },

    /// The timeout is too short to be split into the requested buckets.
    #[error("wheel {name}: timeout {timeout:?} is shorter than {buckets} buckets of 1ms")]
    TimeoutTooShort {
        name: &'static str,
        timeout: Duration,
        buckets: usize,
    },
}

/// Shape of a single wheel.
#[derive(Debug, Clone)]
pub struct WheelConfig {
    /// Name used in log fields (`wheel = "idle"`).
    pub name: &'static str,
    /// How long an item lives before it is released.
    pub timeout: Duration,
    /// Number of buckets the timeout is divided into. More buckets means
    /// a finer tick and less overshoot.
    pub buckets: usize,
}

impl WheelConfig {
    pub fn new(name: &'static str, timeout: Duration, buckets: usize) -> Self {
        Self {
            name,
            timeout,
            buckets,
        }
    }

    /// Duration between two calls to [`TimeoutWheel::advance`].
    ///
    /// Bucket counts beyond `u32::MAX` divide as `u32::MAX`; such a config
    /// never validates.
    pub fn tick(&self) -> Duration {
        let buckets = u32::try_from(self.buckets.max(1)).unwrap_or(u32::MAX);
        self.timeout / buckets
    }

    fn validated(self) -> Result<Self, WheelError> {
        if self.buckets == 0 {
            return Err(WheelError::NoBuckets(self.name));
        }
        if u32::try_from(self.buckets).is_err() {
            return Err(WheelError::TooManyBuckets {
                name: self.name,
                buckets: self.buckets,
            });
        }
        if self.tick() < Duration::from_millis(1) {
            return Err(WheelError::TimeoutTooShort {
                name: self.name,
                timeout: self.timeout,
                buckets: self.buckets,
            });
        }
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// Handle returned by [`TimeoutWheel::insert`].
///
/// Keys come from one process-wide counter, so a key from one wheel never
/// equals a key from another. Owners that move between wheels can compare
/// a fired key against their current one without knowing its wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

impl TimerKey {
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmr-{}", self.0)
    }
}

/// Something that can expire.
///
/// `should_release` is evaluated while the wheel lock is held, so it must be
/// cheap and must not call back into the same wheel. Returning `false` keeps
/// the item for another full round with the same key.
///
/// `release` runs after the lock is dropped and receives the key the item
/// was registered under, so the owner can tell a current timer from a stale
/// one.
pub trait Expiry: Send + Sync + 'static {
    fn should_release(&self) -> bool {
        true
    }

    fn release(&self, key: TimerKey);
}

impl<F> Expiry for F
where
    F: Fn(TimerKey) + Send + Sync + 'static,
{
    fn release(&self, key: TimerKey) {
        self(key)
    }
}

/// Counters since the wheel was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WheelStats {
    /// Items whose release action ran.
    pub fired: u64,
    /// Items removed before they were claimed.
    pub cancelled: u64,
    /// Times an expiring item asked to stay for another round.
    pub deferred: u64,
}

// ---------------------------------------------------------------------------
// Wheel
// ---------------------------------------------------------------------------

struct Slot {
    bucket: usize,
    item: Arc<dyn Expiry>,
}

struct Ring {
    /// `buckets + 1` physical buckets. The cursor points at the bucket that
    /// was drained last; new items go there, so they are visited again only
    /// after a full revolution.
    buckets: Vec<HashSet<TimerKey>>,
    cursor: usize,
    slots: HashMap<TimerKey, Slot>,
}

/// A delay queue that releases each item once, unless it is removed first.
pub struct TimeoutWheel {
    config: WheelConfig,
    ring: Mutex<Ring>,
    fired: AtomicU64,
    cancelled: AtomicU64,
    deferred: AtomicU64,
}

impl TimeoutWheel {
    pub fn new(config: WheelConfig) -> Result<Self, WheelError> {
        let config = config.validated()?;
        let ring = Ring {
            buckets: (0..=config.buckets).map(|_| HashSet::new()).collect(),
            cursor: 0,
            slots: HashMap::new(),
        };

        debug!(
            wheel = config.name,
            timeout_ms = config.timeout.as_millis() as u64,
            buckets = config.buckets,
            "timeout wheel created"
        );

        Ok(Self {
            config,
            ring: Mutex::new(ring),
            fired: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &'static str {
        self.config.name
    }

    pub fn config(&self) -> &WheelConfig {
        &self.config
    }

    /// Registers an item and starts its countdown.
    pub fn insert(&self, item: Arc<dyn Expiry>) -> TimerKey {
        let key = TimerKey(NEXT_TIMER_KEY.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.ring.lock();
        let ring = &mut *guard;
        let bucket = ring.cursor;
        ring.buckets[bucket].insert(key);
        ring.slots.insert(key, Slot { bucket, item });
        key
    }

    /// Restarts the countdown of a registered item.
    ///
    /// Returns `false` if the key is no longer registered (already claimed
    /// or removed); the caller decides whether to insert a fresh item.
    pub fn rearm(&self, key: TimerKey) -> bool {
        let mut guard = self.ring.lock();
        let ring = &mut *guard;
        let cursor = ring.cursor;
        let Some(slot) = ring.slots.get_mut(&key) else {
            return false;
        };
        let old = std::mem::replace(&mut slot.bucket, cursor);
        if old != cursor {
            ring.buckets[old].remove(&key);
            ring.buckets[cursor].insert(key);
        }
        true
    }

    /// Cancels an item. `true` means it will never be released.
    pub fn remove(&self, key: TimerKey) -> bool {
        let mut guard = self.ring.lock();
        let ring = &mut *guard;
        match ring.slots.remove(&key) {
            Some(slot) => {
                ring.buckets[slot.bucket].remove(&key);
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: TimerKey) -> bool {
        self.ring.lock().slots.contains_key(&key)
    }

    /// Number of registered (not yet claimed) items.
    pub fn len(&self) -> usize {
        self.ring.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> WheelStats {
        WheelStats {
            fired: self.fired.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
        }
    }

    /// Moves the wheel forward one tick and releases everything that
    /// expired. Returns how many items were released.
    pub fn advance(&self) -> usize {
        let claimed: Vec<(TimerKey, Arc<dyn Expiry>)> = {
            let mut guard = self.ring.lock();
            let ring = &mut *guard;
            ring.cursor = (ring.cursor + 1) % ring.buckets.len();
            let cursor = ring.cursor;
            let expiring = std::mem::take(&mut ring.buckets[cursor]);

            let mut claimed = Vec::with_capacity(expiring.len());
            for key in expiring {
                let release = match ring.slots.get(&key) {
                    Some(slot) => slot.item.should_release(),
                    None => continue,
                };
                if release {
                    if let Some(slot) = ring.slots.remove(&key) {
                        claimed.push((key, slot.item));
                    }
                } else {
                    // Stays registered under the same key for another round.
                    if let Some(slot) = ring.slots.get_mut(&key) {
                        slot.bucket = cursor;
                    }
                    ring.buckets[cursor].insert(key);
                    self.deferred.fetch_add(1, Ordering::Relaxed);
                }
            }
            claimed
        };

        let released = claimed.len();
        for (key, item) in claimed {
            item.release(key);
        }
        if released > 0 {
            self.fired.fetch_add(released as u64, Ordering::Relaxed);
            trace!(wheel = self.config.name, released, "wheel released items");
        }
        released
    }

    /// Drives the wheel until `shutdown` flips to `true` or its sender is
    /// dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.config.tick());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        interval.tick().await;

        debug!(wheel = self.config.name, "wheel driver started");
        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    self.advance();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(wheel = self.config.name, pending = self.len(), "wheel driver stopped");
    }
}

impl fmt::Debug for TimeoutWheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutWheel")
            .field("config", &self.config)
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}
