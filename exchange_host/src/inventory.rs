pub mod store;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use exchange_core::Breakdown;
use thiserror::Error;
use tracing::{debug, info, warn};

use store::JsonStore;

/// Which side of the float an inventory tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryKind {
    Bills,
    Coins,
}

impl InventoryKind {
    #[must_use]
    pub fn denominations(self) -> &'static [u32] {
        match self {
            InventoryKind::Bills => &[20, 50, 100, 200, 500, 1000],
            InventoryKind::Coins => &[1, 5, 10, 20],
        }
    }

    #[must_use]
    pub fn default_count(self) -> u32 {
        match self {
            InventoryKind::Bills => 20,
            InventoryKind::Coins => 30,
        }
    }

    #[must_use]
    pub fn supports(self, denom: u32) -> bool {
        self.denominations().contains(&denom)
    }
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("unsupported denomination: {0}")]
    UnsupportedDenomination(u32),
    #[error("failed to persist inventory: {0}")]
    Persist(#[from] io::Error),
}

pub type InventoryResult<T> = Result<T, InventoryError>;

#[derive(Debug)]
struct Inner {
    counts: BTreeMap<u32, u32>,
    store: JsonStore,
}

impl Inner {
    /// Persists `next` and only then makes it the in-memory truth, so a
    /// failed write never leaves memory and disk disagreeing.
    fn commit(&mut self, next: BTreeMap<u32, u32>) -> InventoryResult<()> {
        self.store.persist(&next)?;
        self.counts = next;
        Ok(())
    }
}

/// Thread-safe, persisted denomination counts.
///
/// Counts never go negative and every mutation reaches the snapshot file
/// before the call returns. Bulk reservations are all-or-nothing.
/// Insufficient stock is an ordinary `false`, not an error.
#[derive(Debug, Clone)]
pub struct Inventory {
    kind: InventoryKind,
    inner: Arc<Mutex<Inner>>,
}

impl Inventory {
    /// Opens the inventory at `path`, seeding the default float on first
    /// run (20 per bill denomination, 30 per coin denomination).
    pub fn open(path: impl Into<PathBuf>, kind: InventoryKind) -> InventoryResult<Self> {
        let store = JsonStore::new(path);
        let counts = match store.load()? {
            Some(mut counts) => {
                for &denom in kind.denominations() {
                    counts.entry(denom).or_insert(0);
                }
                counts
            }
            None => {
                let counts: BTreeMap<u32, u32> = kind
                    .denominations()
                    .iter()
                    .map(|&denom| (denom, kind.default_count()))
                    .collect();
                store.persist(&counts)?;
                info!(
                    path = %store.path().display(),
                    ?kind,
                    "no snapshot found, seeded default float"
                );
                counts
            }
        };

        Ok(Inventory {
            kind,
            inner: Arc::new(Mutex::new(Inner { counts, store })),
        })
    }

    #[must_use]
    pub fn kind(&self) -> InventoryKind {
        self.kind
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<u32, u32> {
        self.inner
            .lock()
            .expect("should not be poisoned")
            .counts
            .clone()
    }

    #[must_use]
    pub fn count(&self, denom: u32) -> u32 {
        self.inner
            .lock()
            .expect("should not be poisoned")
            .counts
            .get(&denom)
            .copied()
            .unwrap_or(0)
    }

    fn check(&self, denom: u32) -> InventoryResult<()> {
        if self.kind.supports(denom) {
            Ok(())
        } else {
            Err(InventoryError::UnsupportedDenomination(denom))
        }
    }

    /// Adds `count` units and returns the new count for the denomination.
    pub fn add(&self, denom: u32, count: u32) -> InventoryResult<u32> {
        self.check(denom)?;
        let mut inner = self.inner.lock().expect("should not be poisoned");
        let mut next = inner.counts.clone();
        let entry = next.entry(denom).or_insert(0);
        *entry += count;
        let updated = *entry;
        inner.commit(next)?;
        debug!(denom, count, updated, "inventory add");
        Ok(updated)
    }

    /// Deducts `count` units. Returns `false` (and changes nothing) when
    /// the denomination does not have enough stock.
    pub fn deduct(&self, denom: u32, count: u32) -> InventoryResult<bool> {
        self.check(denom)?;
        let mut inner = self.inner.lock().expect("should not be poisoned");
        let available = inner.counts.get(&denom).copied().unwrap_or(0);
        if available < count {
            warn!(denom, count, available, "deduct refused, insufficient stock");
            return Ok(false);
        }
        let mut next = inner.counts.clone();
        next.insert(denom, available - count);
        inner.commit(next)?;
        debug!(denom, count, remaining = available - count, "inventory deduct");
        Ok(true)
    }

    /// Deducts every entry of `breakdown` atomically, or nothing at all.
    pub fn reserve(&self, breakdown: &Breakdown) -> InventoryResult<bool> {
        for (denom, _) in breakdown.iter_desc() {
            self.check(denom)?;
        }
        let mut inner = self.inner.lock().expect("should not be poisoned");
        for (denom, count) in breakdown.iter_desc() {
            if inner.counts.get(&denom).copied().unwrap_or(0) < count {
                warn!(denom, count, "reserve refused, insufficient stock");
                return Ok(false);
            }
        }
        let mut next = inner.counts.clone();
        for (denom, count) in breakdown.iter_desc() {
            *next.entry(denom).or_insert(0) -= count;
        }
        inner.commit(next)?;
        debug!(%breakdown, "inventory reserved");
        Ok(true)
    }

    /// Refills every bin back to the default float (operator restock).
    pub fn reset(&self) -> InventoryResult<()> {
        let mut inner = self.inner.lock().expect("should not be poisoned");
        let next: BTreeMap<u32, u32> = self
            .kind
            .denominations()
            .iter()
            .map(|&denom| (denom, self.kind.default_count()))
            .collect();
        inner.commit(next)?;
        info!(kind = ?self.kind, "inventory reset to default float");
        Ok(())
    }

    /// Returns a previous reservation to stock.
    pub fn rollback(&self, breakdown: &Breakdown) -> InventoryResult<()> {
        for (denom, _) in breakdown.iter_desc() {
            self.check(denom)?;
        }
        let mut inner = self.inner.lock().expect("should not be poisoned");
        let mut next = inner.counts.clone();
        for (denom, count) in breakdown.iter_desc() {
            *next.entry(denom).or_insert(0) += count;
        }
        inner.commit(next)?;
        debug!(%breakdown, "reservation rolled back");
        Ok(())
    }
}
