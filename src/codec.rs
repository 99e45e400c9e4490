//! Persistence of a flow's mutable state
//!
//! The payload holds the data store plus, per node, its state, output buffer
//! and failure message. Callbacks are behaviour, not data: a payload is always
//! decoded into a freshly built flow that registered the same nodes.

use crate::error::{FlowError, Result};
use crate::flow::Flow;
use crate::models::NodeState;
use crate::node::NodeRuntime;
use crate::store::DataStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use tracing::{debug, warn};

/// Payload format version written by [`Flow::encode`]
pub const PAYLOAD_VERSION: u32 = 1;

/// Failure recorded for a node found mid-execution in a payload
pub const INTERRUPTED_MESSAGE: &str = "interrupted before completion";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedFlow {
    pub version: u32,
    pub data: BTreeMap<String, Value>,
    pub nodes: BTreeMap<String, PersistedNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedNode {
    pub state: NodeState,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Empty string means no failure
    #[serde(default)]
    pub error: String,
}

impl PersistedFlow {
    /// Parse a payload, rejecting unknown versions
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice::<PersistedFlow>(payload)
            .map_err(malformed)?
            .validate()
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        serde_json::from_reader::<_, PersistedFlow>(reader)
            .map_err(malformed)?
            .validate()
    }

    fn validate(self) -> Result<Self> {
        if self.version != PAYLOAD_VERSION {
            return Err(FlowError::UnsupportedVersion(self.version));
        }
        Ok(self)
    }
}

fn malformed(err: serde_json::Error) -> FlowError {
    FlowError::CorruptedPayload(format!("malformed payload: {}", err))
}

impl Flow {
    /// Snapshot the data store and every node's mutable state
    pub fn snapshot(&self) -> Result<PersistedFlow> {
        let state = self.shared.lock()?;
        let nodes = self
            .defs
            .iter()
            .zip(state.nodes.iter())
            .map(|(def, runtime)| {
                (
                    def.key.to_string(),
                    PersistedNode {
                        state: runtime.state,
                        outputs: runtime.outputs.clone(),
                        error: runtime.error.clone().unwrap_or_default(),
                    },
                )
            })
            .collect();

        Ok(PersistedFlow {
            version: PAYLOAD_VERSION,
            data: state.store.entries().clone(),
            nodes,
        })
    }

    /// Serialize the flow's mutable state to a JSON payload
    pub fn encode(&self) -> Result<Vec<u8>> {
        let snapshot = self.snapshot()?;
        Ok(serde_json::to_vec(&snapshot)?)
    }

    pub fn encode_to<W: Write>(&self, writer: W) -> Result<()> {
        let snapshot = self.snapshot()?;
        serde_json::to_writer(writer, &snapshot)?;
        Ok(())
    }

    /// Restore state from a payload into this flow.
    ///
    /// Every node named in the payload must be registered here. Nothing is
    /// modified unless the whole payload is accepted. Registered nodes the
    /// payload does not mention stay pending.
    pub fn decode(&mut self, payload: &[u8]) -> Result<()> {
        let persisted = PersistedFlow::from_slice(payload)?;
        self.restore(persisted)
    }

    pub fn decode_from<R: Read>(&mut self, reader: R) -> Result<()> {
        let persisted = PersistedFlow::from_reader(reader)?;
        self.restore(persisted)
    }

    pub fn restore(&mut self, persisted: PersistedFlow) -> Result<()> {
        let mut runtimes = vec![NodeRuntime::default(); self.defs.len()];

        for (key, node) in persisted.nodes {
            let id = self.index.get(&key).copied().ok_or_else(|| {
                FlowError::CorruptedPayload(format!("persisted node '{}' is not registered", key))
            })?;
            runtimes[id.index()] = restore_node(&key, node)?;
        }

        self.seal()?;

        let mut state = self.shared.lock()?;
        state.store = DataStore::from(persisted.data);
        state.nodes = runtimes;
        debug!(
            "Restored flow '{}': {} data keys",
            self.name(),
            state.store.len()
        );
        Ok(())
    }
}

fn restore_node(key: &str, node: PersistedNode) -> Result<NodeRuntime> {
    let error = (!node.error.is_empty()).then_some(node.error);

    match node.state {
        NodeState::Completed => Ok(NodeRuntime {
            state: NodeState::Completed,
            outputs: node.outputs,
            error,
        }),
        // A checkpoint taken mid-round: the callback may have had side
        // effects, so it is never run again
        NodeState::Running => {
            warn!("Node '{}' was interrupted mid-round, marking it failed", key);
            Ok(NodeRuntime {
                state: NodeState::Completed,
                outputs: BTreeMap::new(),
                error: Some(INTERRUPTED_MESSAGE.to_string()),
            })
        }
        NodeState::Pending => {
            if error.is_some() {
                return Err(FlowError::CorruptedPayload(format!(
                    "pending node '{}' carries a failure",
                    key
                )));
            }
            Ok(NodeRuntime {
                state: NodeState::Pending,
                outputs: node.outputs,
                error: None,
            })
        }
    }
}
