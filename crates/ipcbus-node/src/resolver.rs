//! Name-to-address resolution with a callback-backed cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

/// Pluggable resolution source consulted on cache misses.
pub type ResolveFn = Arc<dyn Fn(&str) -> Option<u32> + Send + Sync>;

#[derive(Default)]
pub struct Resolver {
    cache: Mutex<HashMap<String, u32>>,
    callback: Mutex<Option<ResolveFn>>,
}

impl Resolver {
    pub fn new() -> Self {
        Resolver::default()
    }

    /// Record a known name. Address 0 means unassigned and is ignored.
    pub fn seed(&self, name: &str, addr: u32) {
        if addr == 0 {
            debug!(name, "ignoring unassigned address");
            return;
        }
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), addr);
    }

    /// Resolve `name` to an address.
    ///
    /// A cache miss consults the callback, whose non-zero answers are
    /// cached. The callback runs outside the cache lock so it is free to
    /// call back into the resolver.
    pub fn lookup(&self, name: &str) -> Option<u32> {
        if let Some(addr) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
        {
            return Some(addr);
        }

        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        let addr = callback(name).filter(|addr| *addr != 0)?;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), addr);
        Some(addr)
    }

    /// Empty the cache. Known names resolve through the callback again.
    pub fn clear(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn set_callback(&self, callback: ResolveFn) {
        *self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }
}
