//! The `Slot` and `Epoch` types are defined as new types over u64 to enforce type-safety between
//! the two. Math operations are saturating, they never wrap.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

pub type Hash256 = ethereum_types::H256;

/// Proposer index recorded when the chain is in a regime where proposer duties cannot be derived
/// ahead of time. Consumers must filter this value when rendering assignments.
pub const UNKNOWN_PROPOSER: u64 = i64::MAX as u64;

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slot(#[serde(with = "eth2_serde_utils::quoted_u64")] u64);

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(#[serde(with = "eth2_serde_utils::quoted_u64")] u64);

impl Slot {
    pub const fn new(slot: u64) -> Slot {
        Slot(slot)
    }

    pub fn epoch(self, slots_per_epoch: u64) -> Epoch {
        Epoch::new(self.0 / slots_per_epoch)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub fn saturating_sub(self, other: u64) -> Slot {
        Slot(self.0.saturating_sub(other))
    }

    pub fn max_value() -> Slot {
        Slot(u64::MAX)
    }
}

impl Epoch {
    pub const fn new(epoch: u64) -> Epoch {
        Epoch(epoch)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The first slot of `self`.
    pub fn start_slot(self, slots_per_epoch: u64) -> Slot {
        Slot(self.0.saturating_mul(slots_per_epoch))
    }

    /// The last slot of `self`.
    pub fn end_slot(self, slots_per_epoch: u64) -> Slot {
        Slot(
            self.0
                .saturating_add(1)
                .saturating_mul(slots_per_epoch)
                .saturating_sub(1),
        )
    }

    pub fn saturating_sub(self, other: u64) -> Epoch {
        Epoch(self.0.saturating_sub(other))
    }
}

macro_rules! impl_math {
    ($type: ident) => {
        impl Add<u64> for $type {
            type Output = $type;

            fn add(self, other: u64) -> $type {
                $type(self.0.saturating_add(other))
            }
        }

        impl AddAssign<u64> for $type {
            fn add_assign(&mut self, other: u64) {
                self.0 = self.0.saturating_add(other);
            }
        }

        impl Sub<u64> for $type {
            type Output = $type;

            fn sub(self, other: u64) -> $type {
                $type(self.0.saturating_sub(other))
            }
        }

        impl From<u64> for $type {
            fn from(value: u64) -> $type {
                $type(value)
            }
        }

        impl From<$type> for u64 {
            fn from(value: $type) -> u64 {
                value.0
            }
        }

        impl fmt::Display for $type {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $type {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}({})", stringify!($type), self.0)
            }
        }

        impl FromStr for $type {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<$type, Self::Err> {
                u64::from_str(s).map($type)
            }
        }
    };
}

impl_math!(Slot);
impl_math!(Epoch);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_epoch_conversion() {
        assert_eq!(Slot::new(0).epoch(32), Epoch::new(0));
        assert_eq!(Slot::new(31).epoch(32), Epoch::new(0));
        assert_eq!(Slot::new(32).epoch(32), Epoch::new(1));
        assert_eq!(Epoch::new(1).start_slot(32), Slot::new(32));
        assert_eq!(Epoch::new(1).end_slot(32), Slot::new(63));
    }

    #[test]
    fn saturating_math() {
        assert_eq!(Slot::new(0) - 1, Slot::new(0));
        assert_eq!(Epoch::new(0).saturating_sub(3), Epoch::new(0));
    }

    #[test]
    fn quoted_serde() {
        let slot: Slot = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(slot, Slot::new(42));
        assert_eq!(serde_json::to_string(&slot).unwrap(), "\"42\"");
    }
}
