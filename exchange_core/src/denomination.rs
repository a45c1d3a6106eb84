use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DenomError {
    #[error("unsupported bill denomination: {0}")]
    UnsupportedBill(u32),
    #[error("unsupported coin denomination: {0}")]
    UnsupportedCoin(u32),
}

/// A bank note value in whole pesos.
///
/// The value 20 exists both as a bill and as a coin; the two newtypes keep
/// the kinds apart everywhere past the wire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub struct BillDenom(u32);

impl BillDenom {
    /// All bill denominations the machine handles, descending.
    pub const ALL: [Self; 6] = [
        Self(1000),
        Self(500),
        Self(200),
        Self(100),
        Self(50),
        Self(20),
    ];

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn is_supported(value: u32) -> bool {
        Self::ALL.iter().any(|d| d.0 == value)
    }
}

impl TryFrom<u32> for BillDenom {
    type Error = DenomError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if Self::is_supported(value) {
            Ok(Self(value))
        } else {
            Err(DenomError::UnsupportedBill(value))
        }
    }
}

impl From<BillDenom> for u32 {
    fn from(denom: BillDenom) -> Self {
        denom.0
    }
}

impl core::fmt::Display for BillDenom {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A coin value in whole pesos.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub struct CoinDenom(u32);

impl CoinDenom {
    /// All coin denominations the machine handles, descending.
    pub const ALL: [Self; 4] = [Self(20), Self(10), Self(5), Self(1)];

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn is_supported(value: u32) -> bool {
        Self::ALL.iter().any(|d| d.0 == value)
    }
}

impl TryFrom<u32> for CoinDenom {
    type Error = DenomError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if Self::is_supported(value) {
            Ok(Self(value))
        } else {
            Err(DenomError::UnsupportedCoin(value))
        }
    }
}

impl From<CoinDenom> for u32 {
    fn from(denom: CoinDenom) -> Self {
        denom.0
    }
}

impl core::fmt::Display for CoinDenom {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}
