use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::rule::{CanonicalRule, ObservedRule};
use crate::subject::Subject;

/* ============================= AGGREGATOR ============================= */

/// Deduplicating rule store for one pipeline.
///
/// Writes are serialized under the RW lock; snapshot reads are consistent
/// but not atomic with respect to the ingestor position. Callers are
/// contracted to deliver events in chronological order — `last_seen` is
/// the timestamp of the most recent `add`, not a running maximum.
#[derive(Default)]
pub struct RuleAggregator {
    events_seen: AtomicU64,
    inner: RwLock<HashMap<Subject, HashMap<CanonicalRule, ObservedRule>>>,
}

impl RuleAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation of `rule` by `subject` at `timestamp`.
    pub fn add(&self, subject: Subject, rule: CanonicalRule, timestamp: DateTime<Utc>) {
        self.events_seen.fetch_add(1, Ordering::Relaxed);

        let mut map = self.inner.write().expect("aggregator lock poisoned");
        let rules = map.entry(subject).or_default();
        match rules.get_mut(&rule) {
            Some(observed) => observed.merge(timestamp),
            None => {
                let observed = ObservedRule::first(&rule, timestamp);
                rules.insert(rule, observed);
            }
        }
    }

    /// Total events recorded since construction, for throughput metrics.
    pub fn events_seen(&self) -> u64 {
        self.events_seen.load(Ordering::Relaxed)
    }

    pub fn subject_count(&self) -> usize {
        self.inner.read().expect("aggregator lock poisoned").len()
    }

    /// Deep-copied snapshot, deterministically ordered.
    ///
    /// Subjects come out in their natural order; each subject's rules are
    /// sorted by `(namespace, first API group, first resource, first verb)`
    /// with a full-key tiebreak. This ordering is a contract.
    pub fn snapshot(&self) -> BTreeMap<Subject, Vec<ObservedRule>> {
        let map = self.inner.read().expect("aggregator lock poisoned");
        let mut out = BTreeMap::new();
        for (subject, rules) in map.iter() {
            let mut rules: Vec<ObservedRule> = rules.values().cloned().collect();
            rules.sort_by(|a, b| {
                a.sort_key()
                    .cmp(&b.sort_key())
                    .then_with(|| a.verbs.cmp(&b.verbs))
                    .then_with(|| a.non_resource_urls.cmp(&b.non_resource_urls))
            });
            out.insert(subject.clone(), rules);
        }
        out
    }

    /// Drop rules whose `last_seen` is older than `cutoff`; subjects left
    /// without rules are removed entirely. Returns the number of rules
    /// pruned.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut map = self.inner.write().expect("aggregator lock poisoned");
        let mut pruned = 0;
        map.retain(|_, rules| {
            let before = rules.len();
            rules.retain(|_, observed| observed.last_seen >= cutoff);
            pruned += before - rules.len();
            !rules.is_empty()
        });
        pruned
    }
}

/* ============================= TESTS ============================= */
