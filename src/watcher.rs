use anyhow::{Result, bail};
use async_trait::async_trait;
use notify::{
    Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher,
    event::{CreateKind, MetadataKind, ModifyKind},
};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Weak},
};
use tokio::{
    sync::mpsc::{UnboundedReceiver, unbounded_channel},
    task::JoinHandle,
    time::{Duration, timeout},
};
use tracing::{debug, info, warn};

use crate::orchestrator::Orchestrator;

/// Reacts to file changes inside a watched directory.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;
    async fn on_remove(&self, path: &Path) -> Result<()>;
}

/// Polls one directory and feeds relevant changes to a [`WatchedType`].
///
/// Changes arriving within `settle` of each other are coalesced into one
/// callback, so saving several catalog files triggers a single reload.
pub struct DirectoryWatcher {
    handles: Vec<JoinHandle<()>>,
}

impl DirectoryWatcher {
    pub async fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        poll_interval: Duration,
        settle: Duration,
    ) -> Result<DirectoryWatcher> {
        if !dir.exists() {
            let msg = format!("Directory {} does not exist", dir.to_string_lossy());
            warn!(%msg);
            bail!(msg);
        }

        let (tx, rx) = unbounded_channel::<notify::Result<Event>>();
        let mut watcher = PollWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(poll_interval),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        // the watcher lives as long as this task
        let keep_alive = tokio::spawn(async move {
            let _watcher = watcher;
            std::future::pending::<()>().await;
        });
        let dispatch = tokio::spawn(dispatch_loop(rx, watched, settle));

        info!("Watching {} for changes", dir.display());
        Ok(DirectoryWatcher {
            handles: vec![keep_alive, dispatch],
        })
    }

    /// Stop polling. No callback runs after this returns.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

enum Change {
    Written(PathBuf),
    Removed(PathBuf),
}

fn relevant_change(watched: &Arc<dyn WatchedType>, res: notify::Result<Event>) -> Option<Change> {
    match res {
        Ok(Event {
            kind:
                EventKind::Create(CreateKind::Any | CreateKind::File)
                | EventKind::Modify(
                    ModifyKind::Data(_)
                    | ModifyKind::Metadata(MetadataKind::WriteTime)
                    | ModifyKind::Any,
                ),
            paths,
            ..
        }) => paths
            .into_iter()
            .rfind(|p| watched.is_relevant(p))
            .map(Change::Written),
        Ok(Event {
            kind: EventKind::Remove(_),
            paths,
            ..
        }) => paths
            .into_iter()
            .rfind(|p| watched.is_relevant(p))
            .map(Change::Removed),
        Ok(_) => None,
        Err(e) => {
            warn!(?e, "Watcher error");
            None
        }
    }
}

async fn dispatch_loop(
    mut rx: UnboundedReceiver<notify::Result<Event>>,
    watched: Arc<dyn WatchedType>,
    settle: Duration,
) {
    while let Some(res) = rx.recv().await {
        let Some(mut last) = relevant_change(&watched, res) else {
            continue;
        };
        // swallow the burst
        while let Ok(Some(res)) = timeout(settle, rx.recv()).await {
            if let Some(change) = relevant_change(&watched, res) {
                last = change;
            }
        }
        let outcome = match &last {
            Change::Written(path) => watched.on_create_or_modify(path).await,
            Change::Removed(path) => watched.on_remove(path).await,
        };
        if let Err(e) = outcome {
            warn!(?e, "Failed to handle catalog change");
        }
    }
    debug!("watcher channel closed");
}

/// Turns edits of the catalog directory into configuration reloads.
pub struct CatalogWatch {
    orchestrator: Weak<Orchestrator>,
}

impl CatalogWatch {
    pub fn new(orchestrator: &Arc<Orchestrator>) -> Self {
        Self {
            orchestrator: Arc::downgrade(orchestrator),
        }
    }

    async fn reload(&self, path: &Path) -> Result<()> {
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return Ok(());
        };
        info!("Catalog file {} changed, reloading", path.display());
        orchestrator.set_config_changed(true).await?;
        Ok(())
    }
}

#[async_trait]
impl WatchedType for CatalogWatch {
    fn is_relevant(&self, path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        )
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        self.reload(path).await
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        self.reload(path).await
    }
}
