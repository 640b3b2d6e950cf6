use crate::core::Bond;
use crate::wallet::PublicKey;
use std::collections::BTreeMap;

/// Deterministic round-robin over the bond set.
///
/// Bonds are ordered by minter public key bytes, so every node holding the same bond set
/// agrees on whose turn it is for a given height and missed-block count.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    bonds: BTreeMap<PublicKey, Bond>,
}

impl Scheduler {
    pub fn new(bonds: impl IntoIterator<Item = Bond>) -> Scheduler {
        Scheduler {
            bonds: bonds.into_iter().map(|b| (b.minter, b)).collect(),
        }
    }

    /// Registers or replaces the bond of `bond.minter`
    pub fn insert_bond(&mut self, bond: Bond) {
        self.bonds.insert(bond.minter, bond);
    }

    pub fn get_bond(&self, minter: &PublicKey) -> Option<&Bond> {
        self.bonds.get(minter)
    }

    pub fn is_bonded(&self, minter: &PublicKey) -> bool {
        self.bonds.contains_key(minter)
    }

    pub fn bonds(&self) -> impl Iterator<Item = &Bond> {
        self.bonds.values()
    }

    pub fn len(&self) -> usize {
        self.bonds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bonds.is_empty()
    }

    /// Bond scheduled to mint on top of `head_height` after `skip` missed turns
    pub fn next_minter(&self, head_height: u64, skip: u64) -> Option<&Bond> {
        if self.bonds.is_empty() {
            return None;
        }
        let count = self.bonds.len() as u64;
        let index = head_height.wrapping_add(skip) % count;
        self.bonds.values().nth(index as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Asset, AssetSymbol};

    fn bond(minter: u8) -> Bond {
        Bond::new(
            PublicKey::from_bytes([minter; 32]),
            PublicKey::from_bytes([minter.wrapping_add(100); 32]),
            Asset::new(1, 0, AssetSymbol::Gold),
        )
    }

    #[test]
    fn test_order_is_by_minter_key_not_insertion() {
        let a = Scheduler::new(vec![bond(3), bond(1), bond(2)]);
        let b = Scheduler::new(vec![bond(2), bond(3), bond(1)]);
        for height in 0..10 {
            for skip in 0..4 {
                assert_eq!(a.next_minter(height, skip), b.next_minter(height, skip));
            }
        }
        assert_eq!(a.next_minter(0, 0).unwrap().minter, bond(1).minter);
        assert_eq!(a.next_minter(1, 0).unwrap().minter, bond(2).minter);
        assert_eq!(a.next_minter(1, 1).unwrap().minter, bond(3).minter);
        assert_eq!(a.next_minter(2, 2).unwrap().minter, bond(2).minter);
    }

    #[test]
    fn test_next_minter_is_pure() {
        let scheduler = Scheduler::new(vec![bond(5), bond(9)]);
        let first = scheduler.next_minter(41, 3).cloned();
        let _ = scheduler.next_minter(0, 0);
        let _ = scheduler.next_minter(7, 1);
        assert_eq!(scheduler.next_minter(41, 3).cloned(), first);
    }

    #[test]
    fn test_empty_and_replace() {
        let mut scheduler = Scheduler::default();
        assert!(scheduler.next_minter(0, 0).is_none());

        scheduler.insert_bond(bond(4));
        let mut replacement = bond(4);
        replacement.stake_amt = Asset::new(7, 0, AssetSymbol::Gold);
        scheduler.insert_bond(replacement.clone());
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.get_bond(&replacement.minter), Some(&replacement));
    }
}
