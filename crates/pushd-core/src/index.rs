//! Channel index: channel name -> ids of connections subscribed to it.
//!
//! The index is a cache derived from ledger entries and is never persisted.
//! After every mutation, for each connection `c` and channel `ch`,
//! `ch ∈ ledger(c) ⇔ c ∈ index[ch]`.

use crate::ledger::LedgerEntry;
use crate::ConnectionId;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelIndex {
    channels: HashMap<String, HashSet<ConnectionId>>,
}

impl ChannelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds every ledger entry into a fresh index. Enumeration order does not
    /// matter since inserts commute.
    pub fn rebuild<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a ConnectionId, &'a LedgerEntry)>,
    {
        let mut index = Self::new();
        for (conn_id, entry) in entries {
            for channel in entry.channels() {
                index.insert(channel, conn_id);
            }
        }
        index
    }

    pub fn insert(&mut self, channel: &str, conn_id: &ConnectionId) -> bool {
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(conn_id.clone())
    }

    /// Empty channel sets are dropped so a rebuilt index compares equal to an
    /// incrementally maintained one.
    pub fn remove(&mut self, channel: &str, conn_id: &ConnectionId) -> bool {
        let Some(members) = self.channels.get_mut(channel) else {
            return false;
        };
        let removed = members.remove(conn_id);
        if members.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }

    pub fn remove_connection<'a, I>(&mut self, conn_id: &ConnectionId, channels: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        channels
            .into_iter()
            .filter(|channel| self.remove(channel, conn_id))
            .count()
    }

    /// Subscribers of `channel`, sorted. Unknown channels have none.
    pub fn subscribers(&self, channel: &str) -> Vec<ConnectionId> {
        let mut ids = self
            .channels
            .get(channel)
            .map(|members| members.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn contains(&self, channel: &str, conn_id: &ConnectionId) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|members| members.contains(conn_id))
    }

    pub fn channels_of(&self, conn_id: &ConnectionId) -> BTreeSet<String> {
        self.channels
            .iter()
            .filter(|(_, members)| members.contains(conn_id))
            .map(|(channel, _)| channel.clone())
            .collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.channels.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, BTreeSet<ConnectionId>> {
        self.channels
            .iter()
            .map(|(channel, members)| (channel.clone(), members.iter().cloned().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(channels: &[&str]) -> LedgerEntry {
        let mut entry = LedgerEntry::new();
        for channel in channels {
            entry.subscribe(channel);
        }
        entry
    }

    fn assert_consistent(index: &ChannelIndex, ledgers: &[(ConnectionId, LedgerEntry)]) {
        for (conn_id, ledger) in ledgers {
            assert_eq!(
                index.channels_of(conn_id),
                ledger.subscriptions,
                "index and ledger disagree for {conn_id}"
            );
        }
    }

    #[test]
    fn rebuild_is_independent_of_enumeration_order() {
        let ledgers = vec![
            (ConnectionId::from("a"), entry(&["room1", "room2"])),
            (ConnectionId::from("b"), entry(&["room2"])),
            (ConnectionId::from("c"), entry(&["room3", "room1", "room2"])),
        ];

        let forward = ChannelIndex::rebuild(ledgers.iter().map(|(id, e)| (id, e)));
        let backward = ChannelIndex::rebuild(ledgers.iter().rev().map(|(id, e)| (id, e)));
        assert_eq!(forward, backward);
        assert_eq!(forward.snapshot(), backward.snapshot());
        assert_eq!(forward.subscription_count(), 6);
        assert_eq!(
            forward.subscribers("room2"),
            vec![
                ConnectionId::from("a"),
                ConnectionId::from("b"),
                ConnectionId::from("c")
            ]
        );
        assert_consistent(&forward, &ledgers);
    }

    #[test]
    fn rebuild_skips_empty_ledgers() {
        let ledgers = vec![
            (ConnectionId::from("a"), LedgerEntry::new()),
            (ConnectionId::from("b"), entry(&["room1"])),
        ];
        let index = ChannelIndex::rebuild(ledgers.iter().map(|(id, e)| (id, e)));
        assert_eq!(index.channel_count(), 1);
        assert!(index.channels_of(&ConnectionId::from("a")).is_empty());
    }

    #[test]
    fn incremental_matches_rebuild_after_mixed_operations() {
        let ids = ["a", "b", "c", "d"].map(ConnectionId::from);
        let channels = ["room1", "room2", "room3"];
        let mut ledgers: Vec<(ConnectionId, LedgerEntry)> =
            ids.iter().map(|id| (id.clone(), LedgerEntry::new())).collect();
        let mut index = ChannelIndex::new();

        // Deterministic walk over subscribe/unsubscribe pairs.
        for step in 0..64usize {
            let slot = (step * 7 + 3) % ids.len();
            let channel = channels[(step * 5 + 1) % channels.len()];
            let (conn_id, ledger) = &mut ledgers[slot];
            if step % 3 == 0 {
                ledger.unsubscribe(channel);
                index.remove(channel, conn_id);
            } else {
                ledger.subscribe(channel);
                index.insert(channel, conn_id);
            }
            assert_consistent(&index, &ledgers);
        }

        let rebuilt = ChannelIndex::rebuild(ledgers.iter().map(|(id, e)| (id, e)));
        assert_eq!(rebuilt, index);
    }

    #[test]
    fn remove_connection_leaves_no_dangling_ids() {
        let a = ConnectionId::from("a");
        let b = ConnectionId::from("b");
        let ledger_a = entry(&["room1", "room2"]);
        let mut index = ChannelIndex::new();
        for channel in ledger_a.channels() {
            index.insert(channel, &a);
        }
        index.insert("room1", &b);

        let removed = index.remove_connection(&a, ledger_a.channels());
        assert_eq!(removed, 2);
        assert!(index.channels_of(&a).is_empty());
        assert_eq!(index.subscribers("room1"), vec![b]);
        assert!(index.subscribers("room2").is_empty());
        assert_eq!(index.channel_count(), 1);
    }

    #[test]
    fn unknown_channel_has_no_subscribers() {
        let index = ChannelIndex::new();
        assert!(index.subscribers("nowhere").is_empty());
        assert!(!index.contains("nowhere", &ConnectionId::from("a")));
        assert!(index.is_empty());
    }
}
