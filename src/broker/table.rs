//! Broker-side view of live subscriptions
//!
//! Changes are applied per subscription key, last-writer-wins on version.
//! Removed keys leave a tombstone so a late or duplicated addition cannot
//! resurrect them; tombstones are pruned oldest-first past a retention bound.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::bus::{Match, MatchBatch, MatchEvent, SubscriptionAction, SubscriptionChange};
use crate::errors::{LiveError, LiveResult};
use crate::object::Identity;
use crate::query::{Evaluator, QueryResult};
use crate::registry::SubscriptionKey;
use crate::rewrite::{ContextRewriter, Predicate, RewrittenQuery};
use crate::store::{ChangeKind, ChangeRecord};

/// Number of removal tombstones kept for convergence
pub const TOMBSTONE_RETENTION: usize = 65_536;

/// A subscription as the broker sees it
#[derive(Debug, Clone)]
pub struct TableEntry {
    pub key: SubscriptionKey,
    pub caller: Identity,
    pub rewritten: RewrittenQuery,
}

#[derive(Debug)]
struct Slot {
    version: u64,
    live: Option<Arc<TableEntry>>,
}

#[derive(Debug, Default)]
struct TableState {
    slots: BTreeMap<SubscriptionKey, Slot>,
    tombstones: VecDeque<(SubscriptionKey, u64)>,
}

impl TableState {
    fn bury(&mut self, key: SubscriptionKey, version: u64, retention: usize) {
        self.tombstones.push_back((key, version));
        while self.tombstones.len() > retention {
            let Some((old, old_version)) = self.tombstones.pop_front() else {
                break;
            };
            let stale = self
                .slots
                .get(&old)
                .map_or(false, |slot| slot.live.is_none() && slot.version == old_version);
            if stale {
                self.slots.remove(&old);
            }
        }
    }
}

/// Live subscriptions evaluated by the broker under one critical section
#[derive(Debug)]
pub struct MatchTable {
    state: Mutex<TableState>,
    rewriter: ContextRewriter,
    retention: usize,
}

impl Default for MatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::with_retention(TOMBSTONE_RETENTION)
    }

    /// Create a table keeping at most `retention` tombstones
    pub fn with_retention(retention: usize) -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            rewriter: ContextRewriter::new(),
            retention: retention.max(1),
        }
    }

    fn lock(&self) -> LiveResult<MutexGuard<'_, TableState>> {
        self.state
            .lock()
            .map_err(|_| LiveError::Internal("Lock poisoned".into()))
    }

    /// Apply a subscription change. Returns false when it was stale.
    pub fn apply(&self, change: &SubscriptionChange) -> LiveResult<bool> {
        let live = match &change.action {
            SubscriptionAction::Added { caller, query, .. } => {
                let rewritten = self.rewriter.rewrite(query, caller)?;
                Some(Arc::new(TableEntry {
                    key: change.key.clone(),
                    caller: caller.clone(),
                    rewritten,
                }))
            }
            SubscriptionAction::Removed => None,
        };

        let mut state = self.lock()?;
        if let Some(slot) = state.slots.get(&change.key) {
            if slot.version >= change.version {
                debug!(key = %change.key, version = change.version, "Ignoring stale subscription change");
                return Ok(false);
            }
        }

        let removed = live.is_none();
        state.slots.insert(
            change.key.clone(),
            Slot {
                version: change.version,
                live,
            },
        );
        if removed {
            state.bury(change.key.clone(), change.version, self.retention);
        }
        Ok(true)
    }

    /// Drop a subscription without advancing its version
    pub fn evict(&self, key: &SubscriptionKey) -> LiveResult<bool> {
        let mut state = self.lock()?;
        Ok(evict_locked(&mut state, key, self.retention))
    }

    /// Whether a key is currently live
    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.lock()
            .map(|state| state.slots.get(key).map_or(false, |slot| slot.live.is_some()))
            .unwrap_or(false)
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        self.lock()
            .map(|state| state.slots.values().filter(|s| s.live.is_some()).count())
            .unwrap_or(0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate every live subscription against one change.
    ///
    /// Runs entirely under the table lock, so the subscription set cannot
    /// change mid-pass. Subscriptions that fail to evaluate are evicted and
    /// reported as `MatchEvent::Error`.
    pub fn match_change(&self, record: &ChangeRecord) -> LiveResult<MatchBatch> {
        let mut state = self.lock()?;
        let mut matches = Vec::new();
        let mut failed = Vec::new();

        for (key, slot) in state.slots.iter() {
            let Some(entry) = &slot.live else {
                continue;
            };
            match classify(&entry.rewritten.predicate, &record.kind) {
                Ok(Some(event)) => matches.push(Match {
                    key: key.clone(),
                    event,
                }),
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, marker = record.marker.0, error = %e, "Evicting subscription");
                    matches.push(Match {
                        key: key.clone(),
                        event: MatchEvent::Error {
                            reason: e.to_string(),
                        },
                    });
                    failed.push(key.clone());
                }
            }
        }

        for key in &failed {
            evict_locked(&mut state, key, self.retention);
        }

        Ok(MatchBatch {
            marker: record.marker,
            matches,
        })
    }
}

fn evict_locked(state: &mut TableState, key: &SubscriptionKey, retention: usize) -> bool {
    let version = match state.slots.get_mut(key) {
        Some(slot) if slot.live.is_some() => {
            slot.live = None;
            slot.version
        }
        _ => return false,
    };
    state.bury(key.clone(), version, retention);
    true
}

/// What a subscription with `predicate` learns from a change, if anything
fn classify(predicate: &Predicate, kind: &ChangeKind) -> QueryResult<Option<MatchEvent>> {
    let mut eval = Evaluator::default();
    let event = match kind {
        ChangeKind::Insert { doc } => predicate
            .evaluate(&doc.object, &mut eval)?
            .then(|| MatchEvent::Update {
                object: doc.object.clone(),
            }),
        ChangeKind::Delete { doc } => predicate
            .evaluate(&doc.object, &mut eval)?
            .then(|| MatchEvent::Delete {
                id: doc.object.id.clone(),
            }),
        ChangeKind::Replace { retired, inserted } => {
            let was = predicate.evaluate(&retired.object, &mut eval)?;
            let is = predicate.evaluate(&inserted.object, &mut eval)?;
            match (was, is) {
                (true, true) => Some(MatchEvent::Replace {
                    retired: retired.object.id.clone(),
                    object: inserted.object.clone(),
                }),
                (true, false) => Some(MatchEvent::Delete {
                    id: retired.object.id.clone(),
                }),
                (false, true) => Some(MatchEvent::Update {
                    object: inserted.object.clone(),
                }),
                (false, false) => None,
            }
        }
    };
    Ok(event)
}
