use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use notify::{
    Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind},
};
use tokio::{sync::mpsc::unbounded_channel, task::JoinHandle};
use tracing::{error, info, warn};

use crate::graph::InMemoryGraph;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Something that follows a file on disk.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Loads a workflow JSON file into the graph whenever it changes.
pub struct WorkflowFile {
    graph: Arc<InMemoryGraph>,
}

impl WorkflowFile {
    pub fn new(graph: Arc<InMemoryGraph>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl WatchedType for WorkflowFile {
    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        if raw.trim().is_empty() {
            // editors often truncate before writing
            return Ok(());
        }
        let workflow = serde_json::from_str(&raw)
            .with_context(|| format!("{} is not valid JSON", path.display()))?;
        self.graph.load(workflow)?;
        info!("loaded workflow from {}", path.display());
        Ok(())
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        warn!("workflow file {} was removed, keeping current graph", path.display());
        Ok(())
    }
}

/// Polls one file and forwards its changes to a [`WatchedType`].
pub struct FileWatcher {
    // dropping the watcher stops polling
    _watcher: PollWatcher,
    dispatch: JoinHandle<()>,
}

impl FileWatcher {
    /// Starts watching `file`. With `initial_load` the file is loaded once
    /// before this returns.
    pub async fn new(
        file: PathBuf,
        watched: Arc<dyn WatchedType>,
        initial_load: bool,
        poll_interval: Duration,
    ) -> Result<FileWatcher> {
        if !file.is_file() {
            let msg = format!("Workflow file {} does not exist", file.display());
            warn!(%msg);
            bail!(msg);
        }
        let file = file
            .canonicalize()
            .with_context(|| format!("failed to resolve {}", file.display()))?;
        let dir = file
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("{} has no parent directory", file.display()))?;

        if initial_load {
            try_reload(&watched, &file).await;
        }

        let (tx, mut rx) = unbounded_channel::<notify::Result<Event>>();
        let mut watcher = PollWatcher::new(
            move |res| {
                // the receiver is gone once the dispatch task stops
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(poll_interval),
        )
        .context("failed to create file watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;

        let dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(Event { kind, paths, .. }) => {
                        for path in paths.iter().filter(|p| is_same_file(p, &file)) {
                            let result = match kind {
                                EventKind::Create(CreateKind::Any)
                                | EventKind::Create(CreateKind::File)
                                | EventKind::Modify(ModifyKind::Data(_))
                                | EventKind::Modify(ModifyKind::Metadata(_))
                                | EventKind::Modify(ModifyKind::Any) => {
                                    watched.on_create_or_modify(path).await
                                }
                                EventKind::Remove(_) => watched.on_remove(path).await,
                                _ => Ok(()),
                            };
                            if let Err(e) = result {
                                warn!(?path, ?e, "Failed to handle workflow change");
                            }
                        }
                    }
                    Err(e) => warn!(?e, "Watcher error"),
                }
            }
        });

        Ok(FileWatcher {
            _watcher: watcher,
            dispatch,
        })
    }

    pub fn shutdown(self) {
        self.dispatch.abort();
    }
}

// only the file's own directory is watched, non-recursively
fn is_same_file(candidate: &Path, file: &Path) -> bool {
    candidate.file_name() == file.file_name()
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path) {
    if let Err(e) = watched.reload(path).await {
        error!("Failed to load {:?}: {e:?}", path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_bridge::GraphHost;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn workflow_file_loads_into_graph() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workflow.json");
        std::fs::write(&path, r#"{"nodes": [{"id": 5}], "links": []}"#).unwrap();

        let graph = Arc::new(InMemoryGraph::new());
        let file = WorkflowFile::new(graph.clone());
        file.on_create_or_modify(&path).await.unwrap();
        assert_eq!(graph.serialize().await.unwrap()["nodes"][0]["id"], json!(5));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(file.on_create_or_modify(&path).await.is_err());
        assert_eq!(graph.serialize().await.unwrap()["nodes"][0]["id"], json!(5));
    }

    #[tokio::test]
    async fn missing_file_is_rejected() {
        let graph = Arc::new(InMemoryGraph::new());
        let result = FileWatcher::new(
            PathBuf::from("/definitely/not/here.json"),
            Arc::new(WorkflowFile::new(graph)),
            true,
            DEFAULT_POLL_INTERVAL,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watcher_follows_file_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workflow.json");
        std::fs::write(&path, r#"{"nodes": []}"#).unwrap();

        let graph = Arc::new(InMemoryGraph::new());
        let watcher = FileWatcher::new(
            path.clone(),
            Arc::new(WorkflowFile::new(graph.clone())),
            true,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert_eq!(graph.serialize().await.unwrap(), json!({"nodes": []}));

        // mtime granularity can hide a same-second rewrite
        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(&path, r#"{"nodes": [{"id": 1}, {"id": 2}]}"#).unwrap();

        let mut loaded = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if graph.serialize().await.unwrap()["nodes"].as_array().map(Vec::len) == Some(2) {
                loaded = true;
                break;
            }
        }
        watcher.shutdown();
        assert!(loaded, "watcher never picked up the change");
    }
}
