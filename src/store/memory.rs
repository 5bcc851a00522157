//! In-process counting store.
//!
//! Keys live in a sharded [`DashMap`]. Every atomic primitive runs while
//! holding the shard lock for its key through the map's entry API, which gives
//! the same single-key indivisibility a Redis script provides. Expiry is
//! enforced lazily against the injected [`Clock`].

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{duration_millis, CountingStore, KeyTtl, SlidingWindowReply, SlidingWindowScript};
use crate::clock::{Clock, SystemClock};
use crate::error::{GatekeeperError, Result};

/// A sorted-set score with a total order.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    ordered: BTreeSet<(Score, String)>,
}

impl SortedSet {
    /// Insert or re-score a member. Returns `true` if the member is new.
    fn insert(&mut self, member: String, score: f64) -> bool {
        match self.scores.insert(member.clone(), score) {
            Some(previous) => {
                self.ordered.remove(&(Score(previous), member.clone()));
                self.ordered.insert((Score(score), member));
                false
            }
            None => {
                self.ordered.insert((Score(score), member));
                true
            }
        }
    }

    fn remove_matching<F>(&mut self, predicate: F) -> u64
    where
        F: Fn(f64) -> bool,
    {
        let doomed: Vec<(Score, String)> = self
            .ordered
            .iter()
            .filter(|(score, _)| predicate(score.0))
            .cloned()
            .collect();

        for entry in &doomed {
            self.ordered.remove(entry);
            self.scores.remove(&entry.1);
        }
        doomed.len() as u64
    }

    fn remove_below(&mut self, cutoff: f64) -> u64 {
        self.remove_matching(|score| score < cutoff)
    }

    fn len(&self) -> u64 {
        self.scores.len() as u64
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    fn oldest_ms(&self) -> Option<u64> {
        self.ordered.iter().next().map(|(score, _)| score.0 as u64)
    }

    fn range(&self, start: isize, stop: isize) -> Vec<(String, f64)> {
        let len = self.ordered.len() as isize;
        let start = if start < 0 { (start + len).max(0) } else { start };
        let stop = if stop < 0 { stop + len } else { stop.min(len - 1) };
        if len == 0 || start > stop || start >= len {
            return Vec::new();
        }

        self.ordered
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .map(|(score, member)| (member.clone(), score.0))
            .collect()
    }
}

#[derive(Debug)]
enum Value {
    Scalar(String),
    Sorted(SortedSet),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    /// Absolute expiry in epoch milliseconds
    expires_at: Option<u64>,
    /// Creation order, used as the scan cursor
    seq: u64,
}

impl Slot {
    fn sorted(seq: u64) -> Self {
        Self {
            value: Value::Sorted(SortedSet::default()),
            expires_at: None,
            seq,
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn is_empty_set(&self) -> bool {
        matches!(&self.value, Value::Sorted(set) if set.is_empty())
    }

    fn sorted_ref(&self) -> Result<&SortedSet> {
        match &self.value {
            Value::Sorted(set) => Ok(set),
            Value::Scalar(_) => Err(wrong_type()),
        }
    }

    fn sorted_mut(&mut self) -> Result<&mut SortedSet> {
        match &mut self.value {
            Value::Sorted(set) => Ok(set),
            Value::Scalar(_) => Err(wrong_type()),
        }
    }

    fn apply_window(&mut self, script: &SlidingWindowScript, now: u64) -> Result<SlidingWindowReply> {
        let set = self.sorted_mut()?;
        set.remove_below(script.cutoff() as f64);
        let count = set.len();

        if count + script.cost() > u64::from(script.limit) {
            return Ok(SlidingWindowReply {
                allowed: false,
                count,
                oldest_ms: set.oldest_ms(),
            });
        }

        for member in &script.members {
            set.insert(member.clone(), script.now_ms as f64);
        }
        let reply = SlidingWindowReply {
            allowed: true,
            count: set.len(),
            oldest_ms: set.oldest_ms(),
        };
        self.expires_at = Some(now.saturating_add(script.window_ms));
        Ok(reply)
    }

    fn add_if_card(
        &mut self,
        expected: u64,
        entries: &[(String, f64)],
        expires_at: u64,
    ) -> Result<bool> {
        let set = self.sorted_mut()?;
        if set.len() != expected {
            return Ok(false);
        }
        for (member, score) in entries {
            set.insert(member.clone(), *score);
        }
        self.expires_at = Some(expires_at);
        Ok(true)
    }
}

fn wrong_type() -> GatekeeperError {
    GatekeeperError::Backend(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

/// Match a key against a Redis-style glob (`*`, `?`, `\` escapes).
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '\\' if pi + 1 < p.len() => {
                    if p[pi + 1] == t[ti] {
                        pi += 2;
                        ti += 1;
                        continue;
                    }
                }
                c => {
                    if c == t[ti] {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
            }
        }

        // Backtrack: let the last star swallow one more character
        match star {
            Some((star_pi, star_ti)) => {
                pi = star_pi + 1;
                ti = star_ti + 1;
                star = Some((star_pi, star_ti + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// A counting store that lives inside the current process.
///
/// Suitable for single-node deployments and tests. Several limiters sharing
/// one `Arc<MemoryStore>` observe the same counters.
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    next_seq: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that evaluates expiry against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
            clock,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge_if_expired(&self, key: &str, now: u64) {
        self.entries.remove_if(key, |_, slot| slot.is_expired(now));
    }

    /// Drop every expired slot. Runs at the start of each full scan, so keys
    /// that are never read again still get reclaimed.
    fn purge_expired(&self, now: u64) {
        self.entries.retain(|_, slot| !slot.is_expired(now));
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, AtomicOrdering::Relaxed) + 1
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.entries.len())
            .finish()
    }
}

#[async_trait]
impl CountingStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.purge_if_expired(key, self.clock.now_millis());
        match self.entries.get(key) {
            Some(slot) => match &slot.value {
                Value::Scalar(value) => Ok(Some(value.clone())),
                Value::Sorted(_) => Err(wrong_type()),
            },
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = self.clock.now_millis();
        self.entries.insert(
            key.to_string(),
            Slot {
                value: Value::Scalar(value.to_string()),
                expires_at: Some(now.saturating_add(duration_millis(ttl))),
                seq: self.next_seq(),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        let now = self.clock.now_millis();
        let mut removed = 0;
        for key in keys {
            self.purge_if_expired(key, now);
            if self.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn zadd(&self, key: &str, entries: &[(String, f64)]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }
        self.purge_if_expired(key, self.clock.now_millis());

        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Slot::sorted(self.next_seq()));
        let set = slot.sorted_mut()?;
        let added = entries
            .iter()
            .filter(|(member, score)| set.insert(member.clone(), *score))
            .count();
        Ok(added as u64)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        self.purge_if_expired(key, self.clock.now_millis());

        let removed = match self.entries.get_mut(key) {
            Some(mut slot) => slot
                .sorted_mut()?
                .remove_matching(|score| score >= min && score <= max),
            None => 0,
        };
        self.entries.remove_if(key, |_, slot| slot.is_empty_set());
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.purge_if_expired(key, self.clock.now_millis());
        match self.entries.get(key) {
            Some(slot) => Ok(slot.sorted_ref()?.len()),
            None => Ok(0),
        }
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        self.purge_if_expired(key, self.clock.now_millis());
        match self.entries.get(key) {
            Some(slot) => Ok(slot.sorted_ref()?.range(start, stop)),
            None => Ok(Vec::new()),
        }
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let now = self.clock.now_millis();
        if cursor == 0 {
            self.purge_expired(now);
        }

        // The cursor is the creation seq of the last key returned, so keys
        // deleted between pages never shift the ones still to come.
        let mut candidates: Vec<(u64, String)> = self
            .entries
            .iter()
            .filter(|entry| entry.value().seq > cursor && !entry.value().is_expired(now))
            .filter(|entry| glob_match(pattern, entry.key()))
            .map(|entry| (entry.value().seq, entry.key().clone()))
            .collect();

        let count = count.max(1);
        let more = candidates.len() > count;
        if more {
            candidates.select_nth_unstable(count);
            candidates.truncate(count);
        }
        candidates.sort_unstable();

        let next_cursor = match candidates.last() {
            Some((seq, _)) if more => *seq,
            _ => 0,
        };
        Ok((next_cursor, candidates.into_iter().map(|(_, key)| key).collect()))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let now = self.clock.now_millis();
        self.purge_if_expired(key, now);
        Ok(match self.entries.get(key) {
            Some(slot) => match slot.expires_at {
                Some(at) => KeyTtl::Expires(Duration::from_millis(at.saturating_sub(now))),
                None => KeyTtl::Persistent,
            },
            None => KeyTtl::Missing,
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now_millis();
        self.purge_if_expired(key, now);
        match self.entries.get_mut(key) {
            Some(mut slot) => {
                slot.expires_at = Some(now.saturating_add(duration_millis(ttl)));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exec_sliding_window(&self, script: &SlidingWindowScript) -> Result<SlidingWindowReply> {
        let now = self.clock.now_millis();

        match self.entries.entry(script.key.clone()) {
            Entry::Vacant(vacant) => {
                let mut slot = Slot::sorted(self.next_seq());
                let reply = slot.apply_window(script, now)?;
                if !slot.is_empty_set() {
                    vacant.insert(slot);
                }
                Ok(reply)
            }
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    *occupied.get_mut() = Slot::sorted(self.next_seq());
                }
                let reply = occupied.get_mut().apply_window(script, now)?;
                if occupied.get().is_empty_set() {
                    occupied.remove();
                }
                Ok(reply)
            }
        }
    }

    async fn zadd_if_card(
        &self,
        key: &str,
        expected: u64,
        entries: &[(String, f64)],
        ttl: Duration,
    ) -> Result<bool> {
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(duration_millis(ttl));

        match self.entries.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                let mut slot = Slot::sorted(self.next_seq());
                let written = slot.add_if_card(expected, entries, expires_at)?;
                if written && !slot.is_empty_set() {
                    vacant.insert(slot);
                }
                Ok(written)
            }
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    *occupied.get_mut() = Slot::sorted(self.next_seq());
                }
                let written = occupied.get_mut().add_if_card(expected, entries, expires_at)?;
                if occupied.get().is_empty_set() {
                    occupied.remove();
                }
                Ok(written)
            }
        }
    }
}
