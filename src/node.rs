//! Nodes and the context handed to their callbacks

use crate::error::{FlowError, Result};
use crate::models::{NodeOutcome, NodeState};
use crate::store::DataStore;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Stable handle of a node inside its flow's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Boxed node callback. A returned error is a business failure of the node.
pub type NodeFn = Arc<dyn Fn(NodeContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Immutable part of a node, fixed at registration
pub(crate) struct NodeDef {
    pub(crate) key: Arc<str>,
    pub(crate) deps: Vec<String>,
    pub(crate) callback: NodeFn,
}

impl std::fmt::Debug for NodeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDef")
            .field("key", &self.key)
            .field("deps", &self.deps)
            .finish_non_exhaustive()
    }
}

/// Mutable part of a node, guarded by the flow lock
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NodeRuntime {
    pub(crate) state: NodeState,
    pub(crate) outputs: BTreeMap<String, Value>,
    pub(crate) error: Option<String>,
}

impl Default for NodeRuntime {
    fn default() -> Self {
        Self {
            state: NodeState::Pending,
            outputs: BTreeMap::new(),
            error: None,
        }
    }
}

impl NodeRuntime {
    pub(crate) fn completed(&self) -> bool {
        self.state == NodeState::Completed
    }

    pub(crate) fn success(&self) -> bool {
        self.completed() && self.error.is_none()
    }

    pub(crate) fn outcome(&self) -> Option<NodeOutcome> {
        if !self.completed() {
            return None;
        }
        Some(match &self.error {
            None => NodeOutcome::Success,
            Some(message) => NodeOutcome::Failed(message.clone()),
        })
    }
}

/// State shared between the scheduler and running callbacks
#[derive(Debug, Default)]
pub(crate) struct FlowState {
    pub(crate) store: DataStore,
    pub(crate) nodes: Vec<NodeRuntime>,
}

pub(crate) type SharedState = Arc<Mutex<FlowState>>;

/// Handle a running callback uses to reach the flow.
///
/// The lock behind it is taken only for the duration of each call, so
/// concurrently running nodes never block each other for long.
#[derive(Clone)]
pub struct NodeContext {
    id: NodeId,
    key: Arc<str>,
    shared: SharedState,
    cancel: CancellationToken,
}

impl NodeContext {
    pub(crate) fn new(id: NodeId, key: Arc<str>, shared: SharedState, cancel: CancellationToken) -> Self {
        Self {
            id,
            key,
            shared,
            cancel,
        }
    }

    /// Key of the node this context belongs to
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read and decode a value from the flow's data store.
    ///
    /// Only merged outputs are visible, never a sibling's staged buffer.
    pub fn input<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let state = self.shared.lock()?;
        state.store.get(key)
    }

    /// Stage a value in this node's output buffer.
    ///
    /// Staged values reach the data store when the node completes. Writing
    /// through a context whose node has already completed is an error.
    pub fn output<T: Serialize + ?Sized>(&self, key: impl Into<String>, value: &T) -> Result<()> {
        let encoded = serde_json::to_value(value)?;
        let mut state = self.shared.lock()?;
        let node = &mut state.nodes[self.id.0];
        if node.completed() {
            return Err(FlowError::NodeAlreadyCompleted(self.key.to_string()));
        }
        node.outputs.insert(key.into(), encoded);
        Ok(())
    }

    /// Advisory cancellation for the current round
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
