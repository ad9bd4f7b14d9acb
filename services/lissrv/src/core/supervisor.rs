//! Link supervision
//!
//! One link per active instrument configuration. The supervisor starts
//! and stops links; it does not retry beyond a link's own reconnect
//! budget; a link that exhausts it surfaces a terminal status event and
//! stays stopped until externally restarted.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AppConfig, InstrumentConfig};
use crate::core::link::{InstrumentLink, LinkState};
use crate::error::{LisSrvError, Result};
use crate::events::EventSink;

struct LinkEntry {
    config: Arc<InstrumentConfig>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    state: Arc<RwLock<LinkState>>,
}

pub struct LinkSupervisor {
    config: AppConfig,
    events: Arc<dyn EventSink>,
    links: DashMap<String, LinkEntry>,
    cancel: CancellationToken,
}

impl LinkSupervisor {
    pub fn new(config: AppConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            events,
            links: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Start one link for every active instrument. Returns how many were
    /// started.
    pub fn start_all(&self) -> usize {
        let instruments: Vec<InstrumentConfig> =
            self.config.active_instruments().cloned().collect();
        let mut started = 0;
        for instrument in instruments {
            let id = instrument.id.clone();
            match self.start(instrument) {
                Ok(()) => started += 1,
                Err(e) => warn!(instrument = %id, "failed to start link: {}", e),
            }
        }
        started
    }

    pub fn start(&self, instrument: InstrumentConfig) -> Result<()> {
        let id = instrument.id.clone();
        if self.links.contains_key(&id) {
            return Err(LisSrvError::config(format!("link already running: {}", id)));
        }

        let config = Arc::new(instrument);
        let cancel = self.cancel.child_token();
        let link = Arc::new(InstrumentLink::new(
            Arc::clone(&config),
            self.config.limits.clone(),
            self.config.reconnect.clone(),
            Arc::clone(&self.events),
            cancel.clone(),
        ));
        let state = link.state_handle();
        let task = tokio::spawn(link.run());

        info!(instrument = %id, "link started");
        self.links.insert(
            id,
            LinkEntry {
                config,
                cancel,
                task,
                state,
            },
        );
        Ok(())
    }

    /// Stop one link and wait for its cleanup to finish.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let (_, entry) = self
            .links
            .remove(id)
            .ok_or_else(|| LisSrvError::LinkNotFound(id.to_string()))?;
        entry.cancel.cancel();
        if let Err(e) = entry.task.await {
            warn!(instrument = %id, "link task ended abnormally: {}", e);
        }
        info!(instrument = %id, "link stopped");
        Ok(())
    }

    /// Stop every link concurrently and wait for each to finish cleanup.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.links.iter().map(|e| e.key().clone()).collect();
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, entry)) = self.links.remove(&id) {
                entry.cancel.cancel();
                entries.push((id, entry));
            }
        }

        join_all(entries.into_iter().map(|(id, entry)| async move {
            if let Err(e) = entry.task.await {
                warn!(instrument = %id, "link task ended abnormally: {}", e);
            }
        }))
        .await;
        info!("all links stopped");
    }

    pub fn running(&self) -> Vec<String> {
        self.links.iter().map(|e| e.key().clone()).collect()
    }

    /// Status snapshot for every running link.
    pub async fn diagnostics(&self) -> serde_json::Value {
        let handles: Vec<(String, String, Arc<RwLock<LinkState>>)> = self
            .links
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().config.display_name().to_string(),
                    Arc::clone(&e.value().state),
                )
            })
            .collect();

        let mut map = serde_json::Map::new();
        for (id, name, state) in handles {
            let state = state.read().await.clone();
            map.insert(
                id,
                serde_json::json!({
                    "name": name,
                    "connected": state.connected,
                    "active_connections": state.active_connections,
                    "messages": state.messages,
                    "reconnects": state.reconnects,
                    "last_error": state.last_error,
                }),
            );
        }
        serde_json::Value::Object(map)
    }
}
