use std::collections::BTreeMap;

/// A service fee lookup for one transaction flow.
///
/// The three flows intentionally disagree on overlapping amounts (breaking
/// a 20 costs 3 via coins but 2 via bills); each schedule is its own
/// explicit table and they are never merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeSchedule {
    table: BTreeMap<u32, u32>,
}

impl FeeSchedule {
    #[must_use]
    pub fn from_table(entries: &[(u32, u32)]) -> Self {
        Self {
            table: entries.iter().copied().collect(),
        }
    }

    /// Coin-to-bill: the fee is bundled into the coin total the user must
    /// insert.
    #[must_use]
    pub fn coin_to_bill() -> Self {
        Self::from_table(&[
            (20, 3),
            (40, 3),
            (50, 5),
            (60, 5),
            (70, 5),
            (80, 8),
            (90, 8),
            (100, 8),
            (110, 10),
            (120, 10),
            (150, 10),
            (160, 15),
            (170, 15),
            (200, 15),
        ])
    }

    /// Bill-to-coin: the fee is paid in coins or deducted from the bill.
    #[must_use]
    pub fn bill_to_coin() -> Self {
        Self::from_table(&[(20, 2), (50, 3), (100, 5), (200, 7)])
    }

    /// Bill-to-bill: same collection rules as bill-to-coin.
    #[must_use]
    pub fn bill_to_bill() -> Self {
        Self::from_table(&[(50, 2), (100, 3), (200, 5), (500, 7), (1000, 10)])
    }

    #[must_use]
    pub fn fee_for(&self, amount: u32) -> Option<u32> {
        self.table.get(&amount).copied()
    }

    #[must_use]
    pub fn supports(&self, amount: u32) -> bool {
        self.table.contains_key(&amount)
    }

    /// Selectable amounts, ascending.
    pub fn amounts(&self) -> impl Iterator<Item = u32> + '_ {
        self.table.keys().copied()
    }
}
