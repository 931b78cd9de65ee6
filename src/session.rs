//! Long-running scans that outlive the request that started them.
//!
//! Each session owns a cancellation token and a snapshot of its state. The registry is an
//! owned value injected where it is needed, so several registries can coexist in tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::CommandRunner;
use crate::error::{Result, ScanError};
use crate::netdetect::{network_hosts, range_hosts};
use crate::orchestrator::ScanOrchestrator;
use crate::transport::Transport;
use crate::types::{now_rfc3339, ScanRequest, ScanResult, ScanTarget};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Done,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_finished(self) -> bool {
        self != SessionState::Running
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ScanSession {
    pub id: Uuid,
    pub state: SessionState,
    pub request: ScanRequest,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ScanResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct SessionEntry {
    session: ScanSession,
    cancel: CancellationToken,
    finished: Option<Instant>,
}

pub struct SessionRegistry<T, R> {
    orchestrator: Arc<ScanOrchestrator<T, R>>,
    sessions: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
}

impl<T, R> Clone for SessionRegistry<T, R> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            sessions: self.sessions.clone(),
        }
    }
}

impl<T: Transport, R: CommandRunner> SessionRegistry<T, R> {
    pub fn new(orchestrator: Arc<ScanOrchestrator<T, R>>) -> Self {
        Self {
            orchestrator,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Validate `request` and start it in the background. Invalid or oversized requests are
    /// rejected here rather than producing a failed session. Expired sessions are dropped first.
    pub async fn start(&self, request: ScanRequest) -> Result<Uuid> {
        check_target_size(&request.validate()?.target)?;
        self.prune(self.orchestrator.config().session_ttl()).await;
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(
                id,
                SessionEntry {
                    session: ScanSession {
                        id,
                        state: SessionState::Running,
                        request: request.clone(),
                        started_at: now_rfc3339(),
                        finished_at: None,
                        result: None,
                        error: None,
                    },
                    cancel: cancel.clone(),
                    finished: None,
                },
            );
        }
        tracing::info!(session = %id, "scan session started");

        let orchestrator = self.orchestrator.clone();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let outcome = orchestrator.execute_with_cancel(&request, cancel).await;
            let mut sessions = sessions.write().await;
            let Some(entry) = sessions.get_mut(&id) else {
                return;
            };
            let s = &mut entry.session;
            match outcome {
                Ok(result) => {
                    tracing::info!(session = %id, found = result.printers.len(), "scan session done");
                    s.state = SessionState::Done;
                    s.result = Some(result);
                }
                Err(ScanError::Cancelled) => {
                    tracing::info!(session = %id, "scan session cancelled");
                    s.state = SessionState::Cancelled;
                }
                Err(e) => {
                    tracing::warn!(session = %id, error = %e, "scan session failed");
                    s.state = SessionState::Failed;
                    s.error = Some(e.to_string());
                }
            }
            s.finished_at = Some(now_rfc3339());
            entry.finished = Some(Instant::now());
        });
        Ok(id)
    }

    pub async fn get(&self, id: &Uuid) -> Option<ScanSession> {
        let sessions = self.sessions.read().await;
        sessions.get(id).map(|e| e.session.clone())
    }

    pub async fn list(&self) -> Vec<ScanSession> {
        let sessions = self.sessions.read().await;
        sessions.values().map(|e| e.session.clone()).collect()
    }

    /// Request cancellation. Returns `false` for unknown ids; finished sessions are left as is.
    pub async fn cancel(&self, id: &Uuid) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            Some(entry) => {
                if !entry.session.state.is_finished() {
                    entry.cancel.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Drop sessions that finished more than `max_age` ago. Returns how many were removed.
    pub async fn prune(&self, max_age: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, e| e.finished.map_or(true, |at| at.elapsed() < max_age));
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(removed, "expired scan sessions dropped");
        }
        removed
    }

    /// Prune expired sessions on a fixed period until the returned handle is aborted.
    pub fn spawn_pruner(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let period = self.orchestrator.config().session_prune_interval();
        let ttl = self.orchestrator.config().session_ttl();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.prune(ttl).await;
            }
        })
    }
}

fn check_target_size(target: &ScanTarget) -> Result<()> {
    match *target {
        ScanTarget::Network(net) => network_hosts(net).map(drop),
        ScanTarget::Range { start, end } => range_hosts(start, end).map(drop),
        ScanTarget::LocalNetwork => Ok(()),
    }
}
