use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use http::HeaderMap;
use http::header::CACHE_CONTROL;
use serde_json::Value;
use tracing::debug;

use crate::util::lock_unpoisoned;

const DEFAULT_FRESH_FOR: Duration = Duration::from_secs(5 * 60);
const DEFAULT_RETAIN_FOR: Duration = Duration::from_secs(10 * 60);

/// Freshness and retention windows derived from `Cache-Control`.
///
/// `retain_for` is never shorter than `fresh_for`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheHint {
    fresh_for: Duration,
    retain_for: Duration,
}

impl CacheHint {
    pub const DEFAULT: Self = Self {
        fresh_for: DEFAULT_FRESH_FOR,
        retain_for: DEFAULT_RETAIN_FOR,
    };

    pub fn new(fresh_for: Duration, retain_for: Duration) -> Self {
        Self {
            fresh_for,
            retain_for: retain_for.max(fresh_for),
        }
    }

    pub const fn fresh_for(&self) -> Duration {
        self.fresh_for
    }

    pub const fn retain_for(&self) -> Duration {
        self.retain_for
    }

    /// Parses a directive list such as `max-age=60, stale-while-revalidate=30`.
    ///
    /// Returns `None` when neither `max-age` nor `s-maxage` carries a usable
    /// value.
    pub fn parse(value: &str) -> Option<Self> {
        let mut max_age = None;
        let mut shared_max_age = None;
        let mut stale_while_revalidate = None;

        for directive in value.split(',') {
            let Some((name, argument)) = directive.split_once('=') else {
                continue;
            };
            let slot = match name.trim().to_ascii_lowercase().as_str() {
                "max-age" => &mut max_age,
                "s-maxage" => &mut shared_max_age,
                "stale-while-revalidate" => &mut stale_while_revalidate,
                _ => continue,
            };
            if slot.is_none() {
                *slot = parse_seconds(argument);
            }
        }

        let fresh_for = max_age.or(shared_max_age)?;
        let retain_for = match stale_while_revalidate {
            Some(stale) => fresh_for.saturating_add(stale),
            None => fresh_for,
        };
        Some(Self::new(fresh_for, retain_for))
    }

    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let mut directives = String::new();
        for value in headers.get_all(CACHE_CONTROL) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            if !directives.is_empty() {
                directives.push(',');
            }
            directives.push_str(value);
        }
        if directives.is_empty() {
            return None;
        }
        Self::parse(&directives)
    }
}

impl Default for CacheHint {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn parse_seconds(argument: &str) -> Option<Duration> {
    let seconds = argument.trim().trim_matches('"').parse::<f64>().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(seconds).ok()
}

/// The client-side result cache whose default lifetimes follow the hints
/// seen on responses.
pub trait ResultCache: Send + Sync {
    fn set_default_lifetimes(&self, hint: CacheHint);
}

/// Currently applied result-cache defaults.
///
/// Reconciliation compares and overwrites under one lock, so concurrent
/// callers never observe a half-applied hint. The last distinct hint wins.
pub struct CacheDefaults {
    applied: Mutex<CacheHint>,
    cache: Arc<dyn ResultCache>,
}

impl std::fmt::Debug for CacheDefaults {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CacheDefaults")
            .field("applied", &self.current())
            .finish_non_exhaustive()
    }
}

impl CacheDefaults {
    /// `initial` is assumed to already be configured on `cache`.
    pub fn new(initial: CacheHint, cache: Arc<dyn ResultCache>) -> Self {
        Self {
            applied: Mutex::new(initial),
            cache,
        }
    }

    pub fn current(&self) -> CacheHint {
        *lock_unpoisoned(&self.applied)
    }

    /// Pushes `hint` to the result cache unless it is already applied.
    /// Returns whether the cache was reconfigured.
    pub fn reconcile(&self, hint: CacheHint) -> bool {
        let mut applied = lock_unpoisoned(&self.applied);
        if *applied == hint {
            return false;
        }
        self.cache.set_default_lifetimes(hint);
        debug!(
            fresh_ms = u64::try_from(hint.fresh_for().as_millis()).unwrap_or(u64::MAX),
            retain_ms = u64::try_from(hint.retain_for().as_millis()).unwrap_or(u64::MAX),
            "result cache defaults reconfigured"
        );
        *applied = hint;
        true
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CacheLookup {
    Fresh(Value),
    Stale(Value),
}

impl CacheLookup {
    pub fn into_value(self) -> Value {
        match self {
            Self::Fresh(value) | Self::Stale(value) => value,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }
}

#[derive(Debug)]
struct CachedEntry {
    value: Value,
    stored_at: Instant,
}

/// In-memory result cache keyed by query identity.
///
/// Entries are fresh for the applied `fresh_for` window, served as stale until
/// `retain_for`, then evicted on lookup.
#[derive(Debug)]
pub struct MemoryResultCache {
    defaults: RwLock<CacheHint>,
    entries: Mutex<HashMap<String, CachedEntry>>,
    reconfigurations: AtomicU64,
}

impl MemoryResultCache {
    pub fn new(defaults: CacheHint) -> Self {
        Self {
            defaults: RwLock::new(defaults),
            entries: Mutex::new(HashMap::new()),
            reconfigurations: AtomicU64::new(0),
        }
    }

    pub fn defaults(&self) -> CacheHint {
        match self.defaults.read() {
            Ok(defaults) => *defaults,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Number of times the default lifetimes were changed.
    pub fn reconfigurations(&self) -> u64 {
        self.reconfigurations.load(Ordering::Relaxed)
    }

    /// Stores `value` and drops every entry already past the retention window.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        let retain_for = self.defaults().retain_for();
        let mut entries = lock_unpoisoned(&self.entries);
        entries.retain(|_, entry| entry.stored_at.elapsed() < retain_for);
        entries.insert(
            key.into(),
            CachedEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<CacheLookup> {
        let defaults = self.defaults();
        let mut entries = lock_unpoisoned(&self.entries);
        let age = entries.get(key)?.stored_at.elapsed();
        if age >= defaults.retain_for() {
            entries.remove(key);
            return None;
        }
        let value = entries.get(key)?.value.clone();
        if age < defaults.fresh_for() {
            Some(CacheLookup::Fresh(value))
        } else {
            Some(CacheLookup::Stale(value))
        }
    }

    pub fn invalidate(&self, key: &str) -> bool {
        lock_unpoisoned(&self.entries).remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryResultCache {
    fn default() -> Self {
        Self::new(CacheHint::DEFAULT)
    }
}

impl ResultCache for MemoryResultCache {
    fn set_default_lifetimes(&self, hint: CacheHint) {
        match self.defaults.write() {
            Ok(mut defaults) => *defaults = hint,
            Err(poisoned) => *poisoned.into_inner() = hint,
        }
        self.reconfigurations.fetch_add(1, Ordering::Relaxed);
    }
}
