//! CRDT engine collaborator.
//!
//! The repo treats document state as opaque: it hands the engine an ordered
//! change sequence and receives patches back. This engine implements a
//! last-writer-wins register map, ordered by `(seq, actor)`, which converges
//! regardless of delivery order and is idempotent per `(actor, seq)`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ActorId, Clock};

/// One operation inside a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Set `key` to `value`.
    Set { key: String, value: String },
    /// Delete `key`.
    Del { key: String },
}

/// A change request handed in by the frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub ops: Vec<Op>,
}

/// A single CRDT change, with a monotone `seq` per actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub actor: ActorId,
    pub seq: u64,
    pub deps: Clock,
    pub ops: Vec<Op>,
}

/// One key difference emitted towards the frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub key: String,
    /// `None` means the key was deleted.
    pub value: Option<String>,
}

/// Incremental description of a state change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub diffs: Vec<Diff>,
}

#[derive(Debug, thiserror::Error)]
pub enum CrdtError {
    #[error("document has no local actor")]
    NoLocalActor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Register {
    value: Option<String>,
    seq: u64,
    actor: ActorId,
}

/// Opaque document state.
#[derive(Debug, Default, Clone)]
pub struct DocState {
    actor: Option<ActorId>,
    /// Highest applied sequence per actor.
    applied: BTreeMap<ActorId, u64>,
    registers: BTreeMap<String, Register>,
    /// Applied changes in local application order.
    history: Vec<Change>,
}

impl DocState {
    /// Load a state from an ordered change sequence.
    ///
    /// The returned patch is a full snapshot of the materialized state. When
    /// `actor` is given, the document accepts local changes.
    pub fn load(changes: Vec<Change>, actor: Option<ActorId>) -> (Self, Patch) {
        let mut state = DocState {
            actor,
            ..Default::default()
        };
        state.apply_changes(changes);
        let patch = state.snapshot_patch();
        (state, patch)
    }

    /// Assign the locally writable actor after the fact.
    pub fn set_actor(&mut self, actor: ActorId) {
        self.actor = Some(actor);
    }

    pub fn actor(&self) -> Option<ActorId> {
        self.actor
    }

    /// Turn a request into a signed-off change and the resulting patch.
    pub fn apply_local(&mut self, request: ChangeRequest) -> Result<(Change, Patch), CrdtError> {
        let actor = self.actor.ok_or(CrdtError::NoLocalActor)?;
        let seq = self.applied.get(&actor).copied().unwrap_or(0) + 1;
        let change = Change {
            actor,
            seq,
            deps: self.clock(),
            ops: request.ops,
        };
        let patch = self.apply_changes(vec![change.clone()]);
        Ok((change, patch))
    }

    /// Merge changes into the state.
    ///
    /// A change whose `(actor, seq)` was already applied is skipped, so
    /// re-delivery is a no-op.
    pub fn apply_changes(&mut self, changes: Vec<Change>) -> Patch {
        let mut diffs: BTreeMap<String, Option<String>> = BTreeMap::new();
        for change in changes {
            let seen = self.applied.get(&change.actor).copied().unwrap_or(0);
            if change.seq <= seen {
                continue;
            }
            self.applied.insert(change.actor, change.seq);
            for op in &change.ops {
                let (key, value) = match op {
                    Op::Set { key, value } => (key.clone(), Some(value.clone())),
                    Op::Del { key } => (key.clone(), None),
                };
                let incoming = Register {
                    value: value.clone(),
                    seq: change.seq,
                    actor: change.actor,
                };
                let register = self.registers.entry(key.clone()).or_insert_with(|| Register {
                    value: None,
                    seq: 0,
                    actor: ActorId::default(),
                });
                // Last writer wins, ties broken by actor id.
                if (incoming.seq, incoming.actor) > (register.seq, register.actor) {
                    *register = incoming;
                    diffs.insert(key, value);
                }
            }
            self.history.push(change);
        }
        Patch {
            diffs: diffs
                .into_iter()
                .map(|(key, value)| Diff { key, value })
                .collect(),
        }
    }

    /// Number of changes applied so far.
    pub fn history(&self) -> u64 {
        self.history.len() as u64
    }

    /// The first `n` changes in local application order.
    pub fn history_prefix(&self, n: u64) -> Vec<Change> {
        self.history
            .iter()
            .take(n as usize)
            .cloned()
            .collect()
    }

    /// Highest applied sequence per actor.
    pub fn clock(&self) -> Clock {
        self.applied.iter().map(|(a, s)| (*a, *s)).collect()
    }

    /// The current key-value view.
    pub fn materialize(&self) -> BTreeMap<String, String> {
        self.registers
            .iter()
            .filter_map(|(k, r)| r.value.clone().map(|v| (k.clone(), v)))
            .collect()
    }

    fn snapshot_patch(&self) -> Patch {
        Patch {
            diffs: self
                .materialize()
                .into_iter()
                .map(|(key, value)| Diff {
                    key,
                    value: Some(value),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Keypair;

    fn actor() -> ActorId {
        Keypair::generate(&mut rand::thread_rng()).public()
    }

    fn set(key: &str, value: &str) -> Op {
        Op::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    #[test]
    fn local_changes_count_up() {
        let a = actor();
        let (mut state, _) = DocState::load(vec![], Some(a));
        let (one, _) = state
            .apply_local(ChangeRequest {
                ops: vec![set("k", "1")],
            })
            .unwrap();
        let (two, _) = state
            .apply_local(ChangeRequest {
                ops: vec![set("k", "2")],
            })
            .unwrap();
        assert_eq!((one.seq, two.seq), (1, 2));
        assert_eq!(state.history(), 2);
        assert_eq!(state.materialize().get("k").unwrap(), "2");
    }

    #[test]
    fn apply_is_order_independent() {
        let (a, b) = (actor(), actor());
        let (mut left_writer, _) = DocState::load(vec![], Some(a));
        let (mut right_writer, _) = DocState::load(vec![], Some(b));
        let (ca, _) = left_writer
            .apply_local(ChangeRequest {
                ops: vec![set("x", "from-a"), set("y", "only-a")],
            })
            .unwrap();
        let (cb, _) = right_writer
            .apply_local(ChangeRequest {
                ops: vec![set("x", "from-b")],
            })
            .unwrap();

        let (one, _) = DocState::load(vec![ca.clone(), cb.clone()], None);
        let (two, _) = DocState::load(vec![cb, ca], None);
        assert_eq!(one.materialize(), two.materialize());
    }

    #[test]
    fn redelivery_is_a_noop() {
        let a = actor();
        let (mut state, _) = DocState::load(vec![], Some(a));
        let (change, _) = state
            .apply_local(ChangeRequest {
                ops: vec![set("k", "v")],
            })
            .unwrap();
        let patch = state.apply_changes(vec![change]);
        assert!(patch.diffs.is_empty());
        assert_eq!(state.history(), 1);
    }

    #[test]
    fn history_prefix_replays_a_prefix() {
        let a = actor();
        let (mut state, _) = DocState::load(vec![], Some(a));
        for i in 0..3 {
            state
                .apply_local(ChangeRequest {
                    ops: vec![set("k", &i.to_string())],
                })
                .unwrap();
        }
        let (prefix, _) = DocState::load(state.history_prefix(2), None);
        assert_eq!(prefix.materialize().get("k").unwrap(), "1");
    }

    #[test]
    fn no_local_actor_is_an_error() {
        let (mut state, _) = DocState::load(vec![], None);
        assert!(matches!(
            state.apply_local(ChangeRequest { ops: vec![] }),
            Err(CrdtError::NoLocalActor)
        ));
    }
}
