//! Round-based dependency scheduler
//!
//! A [`Flow`] owns a fixed set of nodes and a [`DataStore`]. Execution is
//! level-synchronous: [`Flow::advance`] computes every pending node whose
//! dependencies all completed successfully, runs that whole set concurrently
//! and returns only once every node of the round has completed and merged its
//! outputs.
//!
//! # Example
//!
//! ```
//! use relayflow::flow::{Flow, SeedArgs};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> relayflow::error::Result<()> {
//! let mut flow = Flow::new("deploy");
//! flow.node("find-artifact", &[], |ctx| async move {
//!     ctx.output("artifact-id", "build-233")?;
//!     Ok(())
//! })?;
//! flow.node("dispatch-artifact", &["find-artifact"], |ctx| async move {
//!     let id: String = ctx.input("artifact-id")?;
//!     ctx.output("artifact-host", &format!("{}:host1", id))?;
//!     Ok(())
//! })?;
//!
//! let cancel = CancellationToken::new();
//! flow.seed(SeedArgs::new(), &cancel).await?;
//! while !flow.is_done()? {
//!     flow.advance(&cancel).await?;
//! }
//!
//! let host: String = flow.read("artifact-host")?;
//! assert_eq!(host, "build-233:host1");
//! # Ok(())
//! # }
//! ```

use crate::dag::DependencyGraph;
use crate::error::{FlowError, Result};
use crate::models::{FlowStatus, NodeOutcome, NodeState};
use crate::node::{FlowState, NodeContext, NodeDef, NodeFn, NodeId, NodeRuntime, SharedState};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Initial arguments written into the data store by [`Flow::seed`]
pub type SeedArgs = BTreeMap<String, Value>;

/// Snapshot of one node, for reporting
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSummary {
    pub key: String,
    pub dependencies: Vec<String>,
    pub state: NodeState,
    pub outcome: Option<NodeOutcome>,
}

/// A dependency graph of nodes plus the data they exchange
pub struct Flow {
    name: String,
    pub(crate) defs: Vec<NodeDef>,
    pub(crate) index: HashMap<String, NodeId>,
    /// Dependency handles per node, `None` for keys that name no node
    resolved: Vec<Vec<Option<NodeId>>>,
    sealed: bool,
    pub(crate) shared: SharedState,
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            defs: Vec::new(),
            index: HashMap::new(),
            resolved: Vec::new(),
            sealed: false,
            shared: Arc::new(Mutex::new(FlowState::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a node.
    ///
    /// Registering an existing key replaces its definition. Registration is
    /// closed once the flow has been seeded, advanced or decoded.
    pub fn node<F, Fut>(&mut self, key: impl Into<String>, deps: &[&str], callback: F) -> Result<()>
    where
        F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: NodeFn = Arc::new(move |ctx| callback(ctx).boxed());
        self.register(key.into(), deps, callback)
    }

    fn register(&mut self, key: String, deps: &[&str], callback: NodeFn) -> Result<()> {
        if self.sealed {
            return Err(FlowError::Config(format!(
                "cannot register node '{}': flow '{}' has already started",
                key, self.name
            )));
        }

        let mut unique_deps: Vec<String> = Vec::with_capacity(deps.len());
        for dep in deps {
            if !unique_deps.iter().any(|d| d == dep) {
                unique_deps.push(dep.to_string());
            }
        }

        let def = NodeDef {
            key: Arc::from(key.as_str()),
            deps: unique_deps,
            callback,
        };

        match self.index.get(&key) {
            Some(&id) => {
                debug!("Replacing definition of node '{}'", key);
                self.defs[id.0] = def;
            }
            None => {
                let id = NodeId(self.defs.len());
                self.defs.push(def);
                self.index.insert(key, id);
                self.shared.lock()?.nodes.push(NodeRuntime::default());
            }
        }

        self.resolve_edges();
        Ok(())
    }

    fn resolve_edges(&mut self) {
        self.resolved = self
            .defs
            .iter()
            .map(|def| def.deps.iter().map(|d| self.index.get(d).copied()).collect())
            .collect();
    }

    /// Close registration and validate the graph. Idempotent.
    pub(crate) fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        DependencyGraph::build(self.defs.iter().map(|d| (&*d.key, d.deps.as_slice())))?;
        self.sealed = true;
        debug!("Flow '{}' sealed with {} nodes", self.name, self.defs.len());
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Write the initial arguments and run every pending node that has no
    /// dependencies at all. Returns the keys that ran.
    pub async fn seed(&mut self, args: SeedArgs, cancel: &CancellationToken) -> Result<Vec<String>> {
        self.seal()?;

        let ids: Vec<NodeId> = {
            let mut state = self.shared.lock()?;
            for (key, value) in args {
                state.store.put_value(key, value);
            }
            self.defs
                .iter()
                .enumerate()
                .filter(|(i, def)| def.deps.is_empty() && state.nodes[*i].state == NodeState::Pending)
                .map(|(i, _)| NodeId(i))
                .collect()
        };

        info!(
            "Seeding flow '{}' with {} root nodes",
            self.name,
            ids.len()
        );
        self.run_round(ids, cancel).await
    }

    /// Run one round: every ready node, concurrently. Returns the keys that
    /// ran, empty when nothing was ready.
    ///
    /// Node failures are recorded on the node and never returned here.
    pub async fn advance(&mut self, cancel: &CancellationToken) -> Result<Vec<String>> {
        self.seal()?;

        let ids = {
            let state = self.shared.lock()?;
            self.ready_set(&state)
        };

        if ids.is_empty() {
            debug!("Flow '{}' has no ready nodes", self.name);
            return Ok(Vec::new());
        }

        info!("Advancing flow '{}': {} ready nodes", self.name, ids.len());
        self.run_round(ids, cancel).await
    }

    /// True when no node is ready, whether the flow succeeded or stalled
    pub fn is_done(&self) -> Result<bool> {
        let state = self.shared.lock()?;
        Ok(self.ready_set(&state).is_empty())
    }

    /// Done-ness plus whether every node succeeded
    pub fn status(&self) -> Result<FlowStatus> {
        let state = self.shared.lock()?;
        if !self.ready_set(&state).is_empty() {
            return Ok(FlowStatus::Running);
        }
        if state.nodes.iter().all(NodeRuntime::success) {
            Ok(FlowStatus::Succeeded)
        } else {
            Ok(FlowStatus::Stalled)
        }
    }

    /// Decode the data store entry under `key`
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let state = self.shared.lock()?;
        state.store.get(key)
    }

    pub fn node_state(&self, key: &str) -> Result<NodeState> {
        let id = self.node_id(key)?;
        Ok(self.shared.lock()?.nodes[id.0].state)
    }

    /// Outcome of a node, `None` until it completes
    pub fn node_outcome(&self, key: &str) -> Result<Option<NodeOutcome>> {
        let id = self.node_id(key)?;
        Ok(self.shared.lock()?.nodes[id.0].outcome())
    }

    /// Decode one value of a node's own output buffer
    pub fn node_output<T: DeserializeOwned>(&self, key: &str, output_key: &str) -> Result<T> {
        let id = self.node_id(key)?;
        let state = self.shared.lock()?;
        let value = state.nodes[id.0]
            .outputs
            .get(output_key)
            .ok_or_else(|| FlowError::DataNotFound(format!("{}/{}", key, output_key)))?;
        T::deserialize(value).map_err(FlowError::Serialization)
    }

    /// All nodes in registration order
    pub fn summaries(&self) -> Result<Vec<NodeSummary>> {
        let state = self.shared.lock()?;
        Ok(self
            .defs
            .iter()
            .zip(state.nodes.iter())
            .map(|(def, runtime)| NodeSummary {
                key: def.key.to_string(),
                dependencies: def.deps.clone(),
                state: runtime.state,
                outcome: runtime.outcome(),
            })
            .collect())
    }

    /// Rounds the flow would take if every node succeeded
    pub fn plan(&self) -> Result<Vec<Vec<String>>> {
        let graph = DependencyGraph::build(self.defs.iter().map(|d| (&*d.key, d.deps.as_slice())))?;
        Ok(graph.parallel_levels())
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    fn node_id(&self, key: &str) -> Result<NodeId> {
        self.index
            .get(key)
            .copied()
            .ok_or_else(|| FlowError::NodeNotFound(key.to_string()))
    }

    /// Pending nodes whose dependencies all completed successfully, in
    /// registration order. Recomputed from scratch on every call.
    fn ready_set(&self, state: &FlowState) -> Vec<NodeId> {
        self.resolved
            .iter()
            .enumerate()
            .filter(|(i, deps)| {
                state.nodes[*i].state == NodeState::Pending
                    && deps
                        .iter()
                        .all(|dep| dep.is_some_and(|d| state.nodes[d.0].success()))
            })
            .map(|(i, _)| NodeId(i))
            .collect()
    }

    async fn run_round(&mut self, ids: Vec<NodeId>, cancel: &CancellationToken) -> Result<Vec<String>> {
        {
            let mut state = self.shared.lock()?;
            for id in &ids {
                let node = &mut state.nodes[id.0];
                node.state = NodeState::Running;
                node.outputs.clear();
            }
        }

        let mut tasks = JoinSet::new();
        for &id in &ids {
            let def = &self.defs[id.0];
            debug!("Node '{}' running", def.key);

            let ctx = NodeContext::new(id, def.key.clone(), self.shared.clone(), cancel.clone());
            let callback = def.callback.clone();
            let shared = self.shared.clone();
            let key = def.key.clone();

            tasks.spawn(async move {
                let result = AssertUnwindSafe(async move { callback(ctx).await })
                    .catch_unwind()
                    .await;
                let error = match result {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(failure_message(&err)),
                    Err(panic) => Some(format!("node panicked: {}", panic_message(&*panic))),
                };
                complete_node(&shared, id, &key, error)
            });
        }

        // Drain the whole round before reporting anything
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| FlowError::TaskJoin(e.to_string()))
                .and_then(|r| r);
            if let Err(err) = outcome {
                first_error.get_or_insert(err);
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        Ok(ids
            .into_iter()
            .map(|id| self.defs[id.0].key.to_string())
            .collect())
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("nodes", &self.defs)
            .field("sealed", &self.sealed)
            .finish_non_exhaustive()
    }
}

/// Transition a node to completed and publish its buffer
fn complete_node(shared: &SharedState, id: NodeId, key: &str, error: Option<String>) -> Result<()> {
    let mut state = shared.lock()?;
    let FlowState { store, nodes } = &mut *state;
    let node = &mut nodes[id.0];

    node.state = NodeState::Completed;
    store.merge(node.outputs.clone());

    match &error {
        None => debug!("Node '{}' completed", key),
        Some(message) => warn!("Node '{}' failed: {}", key, message),
    }
    node.error = error;
    Ok(())
}

/// A failure must never persist as an empty string, which reads back as success
fn failure_message(err: &anyhow::Error) -> String {
    let message = format!("{:#}", err);
    if message.is_empty() {
        "node failed".to_string()
    } else {
        message
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
