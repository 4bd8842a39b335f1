//! Pattern ↔ channel bookkeeping.
//!
//! [`SubscriptionRegistry`] is plain data: it maps each pattern to the set of
//! channels holding it and each channel to its single pattern. It performs no
//! I/O; callers act on the [`Release`] values it returns (undeclaring a
//! pattern that lost its last holder).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use keyrelay_core::{ChannelId, KeyExpr};

/// A pattern a channel stopped holding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Release {
    /// The released pattern.
    pub pattern: KeyExpr,
    /// Whether no channel holds the pattern any more.
    pub now_unused: bool,
}

/// Which channels hold which pattern.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    holders: BTreeMap<KeyExpr, BTreeSet<ChannelId>>,
    held: HashMap<ChannelId, KeyExpr>,
}

impl SubscriptionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `channel` hold `pattern`.
    ///
    /// A different pattern already held is released in the same step; its
    /// [`Release`] is returned. Re-acquiring the held pattern changes nothing.
    pub fn acquire(&mut self, channel: &ChannelId, pattern: &KeyExpr) -> Option<Release> {
        if self.held.get(channel) == Some(pattern) {
            return None;
        }
        let released = self.release_channel(channel);
        let _ = self
            .holders
            .entry(pattern.clone())
            .or_default()
            .insert(channel.clone());
        let _ = self.held.insert(channel.clone(), pattern.clone());
        released
    }

    /// Stop `channel` holding `pattern`. `None` if it did not hold it.
    pub fn release(&mut self, channel: &ChannelId, pattern: &KeyExpr) -> Option<Release> {
        if self.held.get(channel) != Some(pattern) {
            return None;
        }
        self.release_channel(channel)
    }

    /// Release whatever `channel` holds.
    pub fn release_channel(&mut self, channel: &ChannelId) -> Option<Release> {
        let pattern = self.held.remove(channel)?;
        let now_unused = match self.holders.get_mut(&pattern) {
            Some(set) => {
                let _ = set.remove(channel);
                set.is_empty()
            }
            None => true,
        };
        if now_unused {
            let _ = self.holders.remove(&pattern);
        }
        Some(Release {
            pattern,
            now_unused,
        })
    }

    /// Every channel whose pattern accepts the concrete `key`, each once.
    pub fn channels_for(&self, key: &KeyExpr) -> BTreeSet<ChannelId> {
        self.holders
            .iter()
            .filter(|(pattern, _)| pattern.matches(key))
            .flat_map(|(_, channels)| channels.iter().cloned())
            .collect()
    }

    /// The pattern `channel` holds.
    pub fn pattern_of(&self, channel: &ChannelId) -> Option<&KeyExpr> {
        self.held.get(channel)
    }

    /// Number of channels holding `pattern`.
    pub fn refcount(&self, pattern: &KeyExpr) -> usize {
        self.holders.get(pattern).map_or(0, BTreeSet::len)
    }

    /// Patterns with at least one holder, sorted, with their holder counts.
    pub fn patterns(&self) -> impl Iterator<Item = (&KeyExpr, usize)> {
        self.holders.iter().map(|(pattern, set)| (pattern, set.len()))
    }

    /// Number of distinct patterns held.
    pub fn pattern_count(&self) -> usize {
        self.holders.len()
    }

    /// Number of channels holding a pattern.
    pub fn channel_count(&self) -> usize {
        self.held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ke(s: &str) -> KeyExpr {
        KeyExpr::new(s).unwrap()
    }

    fn ch(s: &str) -> ChannelId {
        ChannelId::from(s)
    }

    #[test]
    fn first_acquire_releases_nothing() {
        let mut reg = SubscriptionRegistry::new();
        assert_eq!(reg.acquire(&ch("c1"), &ke("temp/**")), None);
        assert_eq!(reg.refcount(&ke("temp/**")), 1);
        assert_eq!(reg.pattern_of(&ch("c1")), Some(&ke("temp/**")));
    }

    #[test]
    fn shared_pattern_counts_holders() {
        let mut reg = SubscriptionRegistry::new();
        let _ = reg.acquire(&ch("c1"), &ke("temp/**"));
        let _ = reg.acquire(&ch("c2"), &ke("temp/**"));
        assert_eq!(reg.refcount(&ke("temp/**")), 2);
        assert_eq!(reg.pattern_count(), 1);

        let released = reg.release(&ch("c1"), &ke("temp/**")).unwrap();
        assert!(!released.now_unused);
        let released = reg.release(&ch("c2"), &ke("temp/**")).unwrap();
        assert!(released.now_unused);
        assert_eq!(reg.pattern_count(), 0);
    }

    #[test]
    fn switching_releases_old_pattern() {
        let mut reg = SubscriptionRegistry::new();
        let _ = reg.acquire(&ch("c1"), &ke("a/*"));
        let released = reg.acquire(&ch("c1"), &ke("b/*"));
        assert_eq!(
            released,
            Some(Release {
                pattern: ke("a/*"),
                now_unused: true
            })
        );
        assert_eq!(reg.refcount(&ke("a/*")), 0);
        assert_eq!(reg.refcount(&ke("b/*")), 1);
        assert_eq!(reg.channel_count(), 1);
    }

    #[test]
    fn reacquire_same_pattern_is_noop() {
        let mut reg = SubscriptionRegistry::new();
        let _ = reg.acquire(&ch("c1"), &ke("a"));
        assert_eq!(reg.acquire(&ch("c1"), &ke("a")), None);
        assert_eq!(reg.refcount(&ke("a")), 1);
    }

    #[test]
    fn release_of_unheld_pattern_is_none() {
        let mut reg = SubscriptionRegistry::new();
        let _ = reg.acquire(&ch("c1"), &ke("a"));
        assert_eq!(reg.release(&ch("c1"), &ke("b")), None);
        assert_eq!(reg.release(&ch("c2"), &ke("a")), None);
        assert_eq!(reg.release_channel(&ch("c2")), None);
        assert_eq!(reg.refcount(&ke("a")), 1);
    }

    #[test]
    fn channels_for_unions_and_dedups() {
        let mut reg = SubscriptionRegistry::new();
        let _ = reg.acquire(&ch("c1"), &ke("temp/**"));
        let _ = reg.acquire(&ch("c2"), &ke("temp/*"));
        let _ = reg.acquire(&ch("c3"), &ke("humidity/*"));
        let _ = reg.acquire(&ch("c4"), &ke("temp/**"));

        let got: Vec<_> = reg.channels_for(&ke("temp/room1")).into_iter().collect();
        assert_eq!(got, vec![ch("c1"), ch("c2"), ch("c4")]);
        assert!(reg.channels_for(&ke("pressure/x")).is_empty());
    }

    #[test]
    fn patterns_lists_holder_counts() {
        let mut reg = SubscriptionRegistry::new();
        let _ = reg.acquire(&ch("c1"), &ke("b"));
        let _ = reg.acquire(&ch("c2"), &ke("a"));
        let _ = reg.acquire(&ch("c3"), &ke("a"));
        let listed: Vec<_> = reg.patterns().map(|(p, n)| (p.to_string(), n)).collect();
        assert_eq!(listed, vec![("a".to_string(), 2), ("b".to_string(), 1)]);
    }
}
