//! Per-document backend: CRDT state plus the bookkeeping that connects it to
//! actor feeds.

use std::collections::BTreeMap;

use tracing::warn;

use crate::{
    crdt::{Change, ChangeRequest, DocState, Patch},
    util::LatchQueue,
    ActorId, Clock, DocId,
};

/// Notifications from a document to the coordinator.
#[derive(Debug, strum::Display)]
pub enum DocEvent {
    /// Initial materialization completed.
    Ready {
        id: DocId,
        actor_id: Option<ActorId>,
        history: u64,
        patch: Patch,
    },
    /// A writable local actor was assigned.
    ActorId { id: DocId, actor_id: ActorId },
    /// Remote changes were applied.
    RemotePatch { id: DocId, history: u64, patch: Patch },
    /// A local change was generated; it must be written to the feed.
    LocalPatch {
        id: DocId,
        actor_id: ActorId,
        change: Change,
        history: u64,
        patch: Patch,
    },
}

/// Work deferred until the initial load completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocTask {
    /// Pull newly arrived changes of this actor into the document.
    Sync(ActorId),
    /// Assign (or report) the writable actor.
    NeedsActorId,
    /// Apply a local change request.
    LocalChange(ChangeRequest),
}

#[derive(Debug)]
pub struct DocBackend {
    pub id: DocId,
    state: Option<DocState>,
    /// How many changes from each actor were already applied.
    changes: BTreeMap<ActorId, u64>,
    /// Deferred until `init` has run.
    ready: LatchQueue<DocTask>,
}

impl DocBackend {
    pub fn new(id: DocId) -> Self {
        DocBackend {
            id,
            state: None,
            changes: BTreeMap::new(),
            ready: LatchQueue::default(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_open()
    }

    pub fn actor_id(&self) -> Option<ActorId> {
        self.state.as_ref().and_then(|s| s.actor())
    }

    /// Load the CRDT from the concatenated change list and open the ready
    /// latch.
    ///
    /// `counters` records how far into each actor's feed the list reaches.
    /// With an `actor` the document becomes writable.
    pub fn init(
        &mut self,
        changes: Vec<Change>,
        counters: BTreeMap<ActorId, u64>,
        actor: Option<ActorId>,
    ) -> (Vec<DocEvent>, Vec<DocTask>) {
        let (state, patch) = DocState::load(changes, actor);
        let history = state.history();
        self.state = Some(state);
        self.changes = counters;
        let tasks = self.ready.open();
        let events = vec![DocEvent::Ready {
            id: self.id,
            actor_id: actor,
            history,
            patch,
        }];
        (events, tasks)
    }

    /// Assign a writable actor after the fact, or report the existing one.
    pub fn init_actor(&mut self, actor: ActorId) -> Vec<DocEvent> {
        let Some(state) = self.state.as_mut() else {
            warn!(doc = %self.id.fmt_short(), "init_actor before init");
            return vec![];
        };
        let actor_id = match state.actor() {
            Some(existing) => existing,
            None => {
                state.set_actor(actor);
                actor
            }
        };
        vec![DocEvent::ActorId {
            id: self.id,
            actor_id,
        }]
    }

    /// Apply a local change request.
    pub fn apply_local_change(&mut self, request: ChangeRequest) -> Vec<DocEvent> {
        let Some(state) = self.state.as_mut() else {
            warn!(doc = %self.id.fmt_short(), "local change before init");
            return vec![];
        };
        match state.apply_local(request) {
            Ok((change, patch)) => {
                let actor_id = change.actor;
                self.changes.insert(actor_id, change.seq);
                let history = state.history();
                vec![DocEvent::LocalPatch {
                    id: self.id,
                    actor_id,
                    change,
                    history,
                    patch,
                }]
            }
            Err(err) => {
                warn!(doc = %self.id.fmt_short(), %err, "local change rejected");
                vec![]
            }
        }
    }

    /// Merge remote changes.
    pub fn apply_remote_changes(&mut self, changes: Vec<Change>) -> Vec<DocEvent> {
        let Some(state) = self.state.as_mut() else {
            warn!(doc = %self.id.fmt_short(), "remote changes before init");
            return vec![];
        };
        let patch = state.apply_changes(changes);
        vec![DocEvent::RemotePatch {
            id: self.id,
            history: state.history(),
            patch,
        }]
    }

    /// How many changes of `actor` were applied.
    pub fn applied(&self, actor: &ActorId) -> u64 {
        self.changes.get(actor).copied().unwrap_or(0)
    }

    /// Advance the applied counter. Monotone.
    pub fn set_applied(&mut self, actor: ActorId, upto: u64) {
        let entry = self.changes.entry(actor).or_insert(0);
        debug_assert!(upto >= *entry, "applied counter moved backwards");
        *entry = (*entry).max(upto);
    }

    /// The document's current vector clock, derived from the applied
    /// counters.
    pub fn clock(&self) -> Clock {
        self.changes.iter().map(|(a, s)| (*a, *s)).collect()
    }

    /// Defer `task` until the initial load completes; hands it back when the
    /// document is already ready.
    pub fn when_ready(&mut self, task: DocTask) -> Option<DocTask> {
        self.ready.push(task)
    }

    pub fn history(&self) -> u64 {
        self.state.as_ref().map(|s| s.history()).unwrap_or(0)
    }

    pub fn history_prefix(&self, n: u64) -> Vec<Change> {
        self.state
            .as_ref()
            .map(|s| s.history_prefix(n))
            .unwrap_or_default()
    }

    pub fn materialize(&self) -> BTreeMap<String, String> {
        self.state
            .as_ref()
            .map(|s| s.materialize())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::Op;
    use crate::Keypair;

    fn actor() -> ActorId {
        Keypair::generate(&mut rand::thread_rng()).public()
    }

    fn request(key: &str, value: &str) -> ChangeRequest {
        ChangeRequest {
            ops: vec![Op::Set {
                key: key.into(),
                value: value.into(),
            }],
        }
    }

    #[test]
    fn init_opens_the_ready_latch() {
        let a = actor();
        let mut doc = DocBackend::new(DocId::from(a));
        assert_eq!(doc.when_ready(DocTask::Sync(a)), None);
        let (events, tasks) = doc.init(vec![], BTreeMap::new(), Some(a));
        assert!(matches!(events[0], DocEvent::Ready { actor_id: Some(got), .. } if got == a));
        assert_eq!(tasks, vec![DocTask::Sync(a)]);
        assert_eq!(
            doc.when_ready(DocTask::NeedsActorId),
            Some(DocTask::NeedsActorId)
        );
    }

    #[test]
    fn local_changes_update_clock_and_counters() {
        let a = actor();
        let mut doc = DocBackend::new(DocId::from(a));
        doc.init(vec![], BTreeMap::new(), Some(a));
        let events = doc.apply_local_change(request("k", "v"));
        let DocEvent::LocalPatch { change, .. } = &events[0] else {
            panic!("expected local patch");
        };
        assert_eq!(change.seq, 1);
        assert_eq!(doc.applied(&a), 1);
        assert_eq!(doc.clock().get(&a), 1);
    }

    #[test]
    fn init_actor_reports_the_existing_actor() {
        let (a, b) = (actor(), actor());
        let mut doc = DocBackend::new(DocId::from(a));
        doc.init(vec![], BTreeMap::new(), Some(a));
        let events = doc.init_actor(b);
        assert!(matches!(events[0], DocEvent::ActorId { actor_id, .. } if actor_id == a));
    }

    #[test]
    fn changes_before_init_are_rejected() {
        let a = actor();
        let mut doc = DocBackend::new(DocId::from(a));
        assert!(doc.apply_local_change(request("k", "v")).is_empty());
        assert!(doc.apply_remote_changes(vec![]).is_empty());
    }
}
