//! Agent Registry
//!
//! Discovers analysis agents from an explicit registration list and resolves
//! them by category. The active table lives behind an `Arc` snapshot that is
//! swapped wholesale on reload, so in-flight resolutions never observe a
//! half-updated table.

use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::classify::FileCategory;
use crate::error::LlmError;
use crate::llm::LlmService;
use crate::orchestrator::FileTask;

/// A pluggable analysis unit.
///
/// Implementations consume a classified file and produce a domain result,
/// usually via the LLM service. The internal prompt/parse logic is the
/// agent's own business; only this contract is shared.
#[async_trait]
pub trait AnalysisAgent: Send + Sync {
    fn name(&self) -> &str;

    /// Categories this agent claims. Empty sets are rejected at discovery;
    /// a fallback agent is assigned explicitly, not resolved.
    fn categories(&self) -> &[FileCategory];

    /// Higher wins when several agents claim the same category
    fn priority(&self) -> u8 {
        50
    }

    async fn analyze(
        &self,
        task: &FileTask,
        llm: &LlmService,
    ) -> Result<serde_json::Value, LlmError>;
}

/// Published description of one registered agent
#[derive(Clone)]
pub struct AgentDescriptor {
    pub name: String,
    pub categories: Vec<FileCategory>,
    pub priority: u8,
    pub handler: Arc<dyn AnalysisAgent>,
}

impl fmt::Debug for AgentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentDescriptor")
            .field("name", &self.name)
            .field("categories", &self.categories)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Immutable snapshot of all registered agents, in registration order
struct RegistryTable {
    descriptors: Vec<AgentDescriptor>,
}

/// Read-mostly registry with copy-on-reload snapshots
pub struct AgentRegistry {
    table: RwLock<Arc<RegistryTable>>,
}

impl AgentRegistry {
    /// Build a registry from a registration list, validating each candidate.
    /// A malformed candidate is skipped and logged; it never aborts
    /// discovery of the rest.
    pub fn discover(candidates: Vec<Arc<dyn AnalysisAgent>>) -> Self {
        Self {
            table: RwLock::new(Arc::new(Self::build_table(candidates))),
        }
    }

    fn build_table(candidates: Vec<Arc<dyn AnalysisAgent>>) -> RegistryTable {
        let mut descriptors = Vec::with_capacity(candidates.len());
        for agent in candidates {
            let name = agent.name().to_string();
            if name.is_empty() {
                tracing::warn!("skipping agent with empty name");
                continue;
            }
            if agent.categories().is_empty() {
                tracing::warn!(agent = %name, "skipping agent with empty category set");
                continue;
            }
            descriptors.push(AgentDescriptor {
                categories: agent.categories().to_vec(),
                priority: agent.priority(),
                handler: agent,
                name,
            });
        }
        tracing::info!(agents = descriptors.len(), "agent registry built");
        RegistryTable { descriptors }
    }

    /// All agents claiming `category`, ordered by priority (higher first)
    /// with registration order as the stable tie-break. An empty result is
    /// not an error; callers degrade to the fallback agent.
    pub fn resolve(&self, category: FileCategory) -> Vec<AgentDescriptor> {
        let snapshot = Arc::clone(&self.table.read().expect("registry lock poisoned"));

        let mut matches: Vec<AgentDescriptor> = snapshot
            .descriptors
            .iter()
            .filter(|d| d.categories.contains(&category))
            .cloned()
            .collect();
        // Stable sort keeps registration order among equal priorities
        matches.sort_by(|a, b| b.priority.cmp(&a.priority));
        matches
    }

    /// Re-run discovery and atomically swap the active table. Resolutions
    /// already holding the previous snapshot complete against it.
    pub fn reload(&self, candidates: Vec<Arc<dyn AnalysisAgent>>) {
        let table = Arc::new(Self::build_table(candidates));
        *self.table.write().expect("registry lock poisoned") = table;
    }

    pub fn len(&self) -> usize {
        self.table
            .read()
            .expect("registry lock poisoned")
            .descriptors
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
