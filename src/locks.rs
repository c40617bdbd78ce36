//! Per-slug operation locks.
//!
//! One lifecycle operation per instance at a time; operations on different
//! instances may proceed concurrently. A busy slug is a `Conflict`, so a
//! competing caller fails fast with a clear "operation in progress" error
//! instead of interleaving. Guards release on drop, covering error paths.

use crate::error::{FleetError, FleetResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
pub struct SlugLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SlugLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a slug, failing immediately when another
    /// operation against the same instance is in flight.
    pub fn acquire(&self, slug: &str) -> FleetResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().expect("slug lock registry poisoned");
            locks
                .entry(slug.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.try_lock_owned().map_err(|_| {
            FleetError::Conflict(format!(
                "an operation against instance '{}' is already in progress",
                slug
            ))
        })
    }
}
