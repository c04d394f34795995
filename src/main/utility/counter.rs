/*!
Counts how often each of a set of keys occurs. The counter starts with no keys; incrementing an
unknown key adds it with a count of 1. Formatting the counter lists every key with the heaviest
hitters first.
*/

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Counter<K: Ord = &'static str> {
    items: BTreeMap<K, u64>,
}

impl<K: Ord> Counter<K> {
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }

    /// Increment the count for `key`, returning the count after the increment.
    pub fn add_one(&mut self, key: K) -> u64 {
        let count = self.items.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    /// The count for `key`, or 0 if it has never been incremented.
    pub fn get_value(&self, key: &K) -> u64 {
        self.items.get(key).copied().unwrap_or(0)
    }

    /// The sum of all counts.
    pub fn total(&self) -> u64 {
        self.items.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<K: Ord> Default for Counter<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + fmt::Display> fmt::Display for Counter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut items: Vec<_> = self.items.iter().collect();
        // heaviest hitters first; the sort is stable so ties keep key order
        items.sort_by(|(_, a), (_, b)| b.cmp(a));

        write!(f, "Counts:")?;
        for (key, count) in items {
            write!(f, " {key}={count}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_one() {
        let mut counter = Counter::new();
        assert_eq!(counter.add_one("not-up"), 1);
        assert_eq!(counter.add_one("not-up"), 2);
        assert_eq!(counter.add_one("link-removed"), 1);
        assert_eq!(counter.get_value(&"not-up"), 2);
        assert_eq!(counter.get_value(&"unknown"), 0);
        assert_eq!(counter.total(), 3);
    }

    #[test]
    fn test_display() {
        let mut counter = Counter::new();
        counter.add_one("b");
        counter.add_one("c");
        counter.add_one("c");
        counter.add_one("a");
        assert_eq!(counter.to_string(), "Counts: c=2 a=1 b=1");
        assert_eq!(Counter::<&str>::new().to_string(), "Counts:");
    }
}
