use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An ordered mapping from denomination to a positive count.
///
/// Breakdowns describe one side of a payout plan (bills or coins, never
/// mixed). Iteration is largest-denomination-first, the order in which the
/// machine dispenses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakdown(BTreeMap<u32, u32>);

impl Breakdown {
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds `count` units of `denom`. Zero counts are dropped so an empty
    /// breakdown always means "nothing to dispense".
    pub fn add(&mut self, denom: u32, count: u32) {
        if count > 0 {
            *self.0.entry(denom).or_insert(0) += count;
        }
    }

    #[must_use]
    pub fn count(&self, denom: u32) -> u32 {
        self.0.get(&denom).copied().unwrap_or(0)
    }

    /// Implicit total: Σ denom · count.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.0.iter().map(|(denom, count)| denom * count).sum()
    }

    /// Number of physical items in the plan.
    #[must_use]
    pub fn item_count(&self) -> u32 {
        self.0.values().sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries in dispensing order (largest denomination first).
    pub fn iter_desc(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.0.iter().rev().map(|(&denom, &count)| (denom, count))
    }

    pub fn merge(&mut self, other: &Self) {
        for (denom, count) in other.iter_desc() {
            self.add(denom, count);
        }
    }
}

impl FromIterator<(u32, u32)> for Breakdown {
    fn from_iter<I: IntoIterator<Item = (u32, u32)>>(iter: I) -> Self {
        let mut breakdown = Self::new();
        for (denom, count) in iter {
            breakdown.add(denom, count);
        }
        breakdown
    }
}

impl core::fmt::Display for Breakdown {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut first = true;
        for (denom, count) in self.iter_desc() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{denom}x{count}")?;
            first = false;
        }
        if first {
            write!(f, "empty")?;
        }
        Ok(())
    }
}
