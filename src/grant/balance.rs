//! Per-grant remaining balances.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ids::GrantId;
use super::model::Grant;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BalanceMap(BTreeMap<GrantId, Decimal>);

impl BalanceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &GrantId) -> Option<Decimal> {
        self.0.get(id).copied()
    }

    pub fn set(&mut self, id: GrantId, balance: Decimal) {
        self.0.insert(id, balance);
    }

    pub fn remove(&mut self, id: &GrantId) -> Option<Decimal> {
        self.0.remove(id)
    }

    pub fn contains(&self, id: &GrantId) -> bool {
        self.0.contains_key(id)
    }

    /// Subtracts `amount`; the result may transiently go negative.
    pub fn burn(&mut self, id: &GrantId, amount: Decimal) {
        let entry = self.0.entry(id.clone()).or_insert(Decimal::ZERO);
        *entry -= amount;
    }

    /// Sum of all balances.
    pub fn balance(&self) -> Decimal {
        self.0.values().copied().sum()
    }

    /// Whether the map has one entry for each grant and nothing else.
    pub fn exactly_for_grants(&self, grants: &[Grant]) -> bool {
        if self.0.len() != grants.len() {
            return false;
        }
        grants.iter().all(|g| self.0.contains_key(&g.id))
    }

    pub fn retain(&mut self, mut f: impl FnMut(&GrantId, &Decimal) -> bool) {
        self.0.retain(|k, v| f(k, v));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GrantId, &Decimal)> {
        self.0.iter()
    }
}

impl FromIterator<(GrantId, Decimal)> for BalanceMap {
    fn from_iter<I: IntoIterator<Item = (GrantId, Decimal)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a BalanceMap {
    type Item = (&'a GrantId, &'a Decimal);
    type IntoIter = std::collections::btree_map::Iter<'a, GrantId, Decimal>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
