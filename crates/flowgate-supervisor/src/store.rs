//! Where pipeline graphs come from.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use flowgate_types::{FlowgateError, PipelineGraph, PipelineId, Result};

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// `Ok(None)` when no pipeline has this id.
    async fn fetch_graph(&self, id: PipelineId) -> Result<Option<PipelineGraph>>;
}

/// In-process store, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    graphs: Mutex<HashMap<PipelineId, PipelineGraph>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, graph: PipelineGraph) {
        self.graphs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(graph.pipeline_id, graph);
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn fetch_graph(&self, id: PipelineId) -> Result<Option<PipelineGraph>> {
        Ok(self
            .graphs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }
}

/// One `<id>.json` file per pipeline in a directory.
#[derive(Debug, Clone)]
pub struct JsonDirGraphStore {
    dir: PathBuf,
}

impl JsonDirGraphStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: PipelineId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn save(&self, graph: &PipelineGraph) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(graph)?;
        tokio::fs::write(self.path_for(graph.pipeline_id), body).await?;
        Ok(())
    }
}

#[async_trait]
impl GraphStore for JsonDirGraphStore {
    async fn fetch_graph(&self, id: PipelineId) -> Result<Option<PipelineGraph>> {
        let path = self.path_for(id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut graph: PipelineGraph = serde_json::from_slice(&raw)
            .map_err(|e| FlowgateError::Store(format!("{}: {e}", path.display())))?;
        if graph.pipeline_id != id {
            tracing::warn!(
                path = %path.display(),
                stored = graph.pipeline_id,
                "Stored pipeline id differs from file name, using file name"
            );
            graph.pipeline_id = id;
        }
        Ok(Some(graph))
    }
}
