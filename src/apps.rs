use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use pilot_bridge::{BridgeRouter, ChangeNotifier, ExecutionService};
use pilot_ws::WsServer;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    comfy::ComfyClient,
    config::BridgeSettings,
    graph::InMemoryGraph,
    watcher::{DEFAULT_POLL_INTERVAL, FileWatcher, WatchedType, WorkflowFile},
};

/// Time given to `cancelled` replies to reach their controllers before the
/// connections are closed.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct AppOptions {
    pub settings: BridgeSettings,
    /// Workflow file to seed the graph from.
    pub workflow: Option<PathBuf>,
    /// Keep following `workflow` for changes.
    pub watch: bool,
    pub poll_interval: Duration,
}

impl AppOptions {
    pub fn new(settings: BridgeSettings) -> Self {
        Self {
            settings,
            workflow: None,
            watch: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

pub struct App {
    cancel: CancellationToken,
    graph: Arc<InMemoryGraph>,
    router: Option<Arc<BridgeRouter>>,
    server: Option<WsServer>,
    comfy: Option<Arc<ComfyClient>>,
    watcher: Option<FileWatcher>,
    router_task: Option<JoinHandle<()>>,
    notifier_task: Option<JoinHandle<()>>,
}

impl App {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            graph: Arc::new(InMemoryGraph::new()),
            router: None,
            server: None,
            comfy: None,
            watcher: None,
            router_task: None,
            notifier_task: None,
        }
    }

    /// Bootstraps the bridge against the ComfyUI server from `options`.
    pub async fn bootstrap(&mut self, options: AppOptions) -> Result<()> {
        let comfy = Arc::new(
            ComfyClient::new(options.settings.comfy_url.clone())
                .context("could not build the execution service client")?,
        );
        comfy.start_events(self.cancel.child_token());
        info!(
            "execution service at {} (client {})",
            comfy.base_url(),
            comfy.client_id()
        );
        self.comfy = Some(comfy.clone());
        self.bootstrap_with(options, comfy).await
    }

    /// Bootstraps the bridge with any execution service:
    ///   - seeds the graph from the workflow file and optionally watches it
    ///   - binds the websocket endpoint
    ///   - starts the router and the change notifier
    pub async fn bootstrap_with(
        &mut self,
        options: AppOptions,
        service: Arc<dyn ExecutionService>,
    ) -> Result<()> {
        let AppOptions {
            settings,
            workflow,
            watch,
            poll_interval,
        } = options;

        if let Some(path) = workflow {
            let watched: Arc<dyn WatchedType> = Arc::new(WorkflowFile::new(self.graph.clone()));
            if watch {
                let watcher = FileWatcher::new(path, watched, true, poll_interval).await?;
                self.watcher = Some(watcher);
            } else {
                watched
                    .reload(&path)
                    .await
                    .with_context(|| format!("could not load workflow {}", path.display()))?;
            }
        }

        if settings.bridge.accepts_any_origin() {
            warn!("accepting messages from any origin; set COMFY_PILOT_ALLOWED_ORIGINS to restrict");
        }

        let router = Arc::new(BridgeRouter::new(
            settings.bridge.clone(),
            self.graph.clone(),
            service,
            self.cancel.child_token(),
        ));
        let (tx, rx) = mpsc::channel(128);
        let server = WsServer::bind(&settings.listen, tx, self.cancel.clone())
            .await
            .with_context(|| format!("could not listen on {}", settings.listen))?;

        self.router_task = Some(tokio::spawn(router.clone().run(rx, self.cancel.clone())));

        let notifier = ChangeNotifier::new(
            self.graph.clone(),
            server.broadcast_target(),
            router.correlator().clone(),
        );
        self.notifier_task = Some(tokio::spawn(notifier.run(self.cancel.child_token())));

        info!("bridge ready at {}", server.url());
        self.router = Some(router);
        self.server = Some(server);
        Ok(())
    }

    pub fn url(&self) -> Option<String> {
        self.server.as_ref().map(WsServer::url)
    }

    pub fn graph(&self) -> Arc<InMemoryGraph> {
        self.graph.clone()
    }

    pub fn router(&self) -> Option<Arc<BridgeRouter>> {
        self.router.clone()
    }

    /// Answers pending executions with `cancelled`, then stops every task.
    pub async fn shutdown(&mut self) {
        if let Some(router) = self.router.take() {
            let pending = router.monitor().in_flight();
            router.monitor().cancel_all();
            if pending > 0 {
                info!("cancelled {} pending executions", pending);
                tokio::time::sleep(SHUTDOWN_GRACE).await;
            }
        }

        self.cancel.cancel();
        if let Some(server) = self.server.take() {
            server.shutdown().await;
        }
        for task in [self.router_task.take(), self.notifier_task.take()]
            .into_iter()
            .flatten()
        {
            let _ = task.await;
        }
        if let Some(comfy) = self.comfy.take() {
            comfy.stop_events();
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.shutdown();
        }
        info!("bridge stopped");
    }
}

impl Default for App {
    fn default() -> Self {
        App::new()
    }
}
