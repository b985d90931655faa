//! API-chaining engine (`spec.md` §4.4): DAG of parent/child endpoint
//! relations, value extraction hand-off into each child's `Chaining`
//! offset state, per-child bounded queues, and chain-metadata
//! emission. Value *extraction* (JSON pointer into the parent's
//! response) is the caller's job via `connect_core::pointer`; this
//! crate only knows the graph shape and the enqueue/back-pressure
//! rules.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use connect_core::config::{ChainRelation, ChainingConfig};
use connect_core::model::{ChainMetadata, ChainStatus, EndpointId};
use connect_core::offset_state::OffsetState;

/// Parent→children / child→parent lookup, built once at `start()` from
/// the validated relation list (`connect_core::config::assert_acyclic`
/// already rejects cycles and multi-parent children before this is
/// constructed).
#[derive(Debug, Clone, Default)]
pub struct ChainGraph {
    children_of: BTreeMap<EndpointId, Vec<EndpointId>>,
    parent_of: BTreeMap<EndpointId, EndpointId>,
}

impl ChainGraph {
    pub fn from_config(config: &ChainingConfig) -> Self {
        Self::from_relations(&config.relations)
    }

    pub fn from_relations(relations: &[ChainRelation]) -> Self {
        let mut children_of: BTreeMap<EndpointId, Vec<EndpointId>> = BTreeMap::new();
        let mut parent_of = BTreeMap::new();
        for rel in relations {
            children_of.entry(rel.parent.clone()).or_default().push(rel.child.clone());
            parent_of.insert(rel.child.clone(), rel.parent.clone());
        }
        Self { children_of, parent_of }
    }

    pub fn children_of(&self, parent: &str) -> &[EndpointId] {
        self.children_of.get(parent).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn parent_of(&self, child: &str) -> Option<&EndpointId> {
        self.parent_of.get(child)
    }

    pub fn is_child(&self, id: &str) -> bool {
        self.parent_of.contains_key(id)
    }

    pub fn is_root(&self, id: &str) -> bool {
        !self.is_child(id)
    }
}

/// Outcome of expanding one parent response's extracted values across
/// its declared children.
#[derive(Debug, Default)]
pub struct ExpansionResult {
    /// Updated offset state per child that received at least one new
    /// value this round.
    pub updated_child_state: BTreeMap<EndpointId, OffsetState>,
    pub metadata: Vec<ChainMetadata>,
    /// Children whose queue hit `max_queue_len` this round — the
    /// scheduler should back-pressure the parent (skip its slot) until
    /// these drain.
    pub overflowed_children: Vec<EndpointId>,
}

/// Expand `parent_values` (already extracted at `chaining_value_pointer`)
/// into enqueued `(child, value)` pairs for every declared child of
/// `parent_id`. `queue_len` reports a child's *current* depth (queries
/// the engine's live offset store); `child_state` supplies the child's
/// current `Chaining` state to fold new values into.
pub fn expand<QL, CS>(
    graph: &ChainGraph,
    parent_id: &str,
    parent_values: &[String],
    max_queue_len: usize,
    queue_len: QL,
    child_state: CS,
    now: DateTime<Utc>,
) -> ExpansionResult
where
    QL: Fn(&str) -> usize,
    CS: Fn(&str) -> OffsetState,
{
    let mut result = ExpansionResult::default();
    for child in graph.children_of(parent_id) {
        let mut depth = queue_len(child);
        let mut state = result.updated_child_state.get(child).cloned().unwrap_or_else(|| child_state(child));
        let mut overflowed = false;

        for value in parent_values {
            if depth >= max_queue_len {
                overflowed = true;
                break;
            }
            state = connect_offsets::enqueue_chain_value(&state, value.clone());
            depth += 1;
            result.metadata.push(ChainMetadata {
                parent_id: parent_id.to_string(),
                child_id: child.clone(),
                parent_value: value.clone(),
                emitted_at: now,
                status: ChainStatus::Enqueued,
            });
        }

        if overflowed {
            result.overflowed_children.push(child.clone());
        }
        result.updated_child_state.insert(child.clone(), state);
    }
    result
}

/// A chain metadata event recording a child fetch that exhausted its
/// retry budget (`spec.md` §4.4 failure policy).
pub fn child_failure_metadata(
    parent_id: &str,
    child_id: &str,
    parent_value: &str,
    now: DateTime<Utc>,
) -> ChainMetadata {
    ChainMetadata {
        parent_id: parent_id.to_string(),
        child_id: child_id.to_string(),
        parent_value: parent_value.to_string(),
        emitted_at: now,
        status: ChainStatus::Failed,
    }
}

/// Whether the parent's own progress should pause given
/// `continue_on_parent_error` and the count of failed items currently
/// sitting in its children's queues. `spec.md` §4.4: "parent
/// advancement pauses while any child queue contains failed items
/// above a configured threshold" — only meaningful when
/// `continue_on_parent_error=false`.
pub fn parent_should_pause(continue_on_parent_error: bool, failed_items_in_child_queues: usize, threshold: usize) -> bool {
    !continue_on_parent_error && failed_items_in_child_queues > threshold
}
