//! Blocking human-in-the-loop approval queue.
//!
//! `submit` persists the approval row first, then parks the caller on a
//! oneshot rendezvous until a resolver, the timeout sweeper, or caller
//! cancellation settles it. The in-memory pending map is authoritative for
//! blocked callers: a store-write failure during resolution is logged, not
//! surfaced, so the human's decision always reaches the waiting action.
//! Nothing survives a restart on purpose (fail-closed).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use agent_warden_core::traits::Store;
use agent_warden_core::types::{
    Alert, AlertSeverity, Approval, ApprovalRequest, ApprovalStatus, TimeoutEffect,
};
use agent_warden_core::{Error, Result};

use crate::alerts::AlertManager;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Approved,
    Denied,
    TimedOut,
}

struct PendingEntry {
    tx: oneshot::Sender<Outcome>,
    deadline: Instant,
}

/// The approval queue; one per process.
pub struct ApprovalQueue {
    store: Arc<dyn Store>,
    alerts: Arc<AlertManager>,
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl ApprovalQueue {
    pub fn new(store: Arc<dyn Store>, alerts: Arc<AlertManager>) -> Self {
        Self {
            store,
            alerts,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Submit a request and block until it is resolved, times out, or the
    /// caller's context is cancelled. Returns whether the action may proceed.
    pub async fn submit(
        &self,
        request: ApprovalRequest,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let id = uuid::Uuid::new_v4().to_string();
        let approval = Approval {
            id: id.clone(),
            session_id: request.session_id.clone(),
            trace_id: request.trace_id.clone(),
            policy_name: request.policy_name.clone(),
            action_summary: request.action_summary.clone(),
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            timeout_at: Utc::now()
                + chrono::Duration::from_std(request.timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            resolved_at: None,
            resolved_by: String::new(),
        };

        // Persist before queueing: an approval that did not land in the store
        // must never block a caller.
        self.store.insert_approval(&approval).await?;

        let rx = {
            let (tx, rx) = oneshot::channel();
            let mut pending = self.pending.lock().unwrap();
            pending.insert(
                id.clone(),
                PendingEntry {
                    tx,
                    deadline: Instant::now() + request.timeout,
                },
            );
            rx
        };

        self.alerts.send(
            Alert::new(
                "approval_required",
                AlertSeverity::Warning,
                format!(
                    "policy '{}' requires approval: {}",
                    request.policy_name, request.action_summary
                ),
            )
            .with_agent(request.agent_id.clone())
            .with_session(request.session_id.clone()),
        );

        tracing::info!(
            approval_id = %id,
            policy = %request.policy_name,
            timeout = ?request.timeout,
            "waiting for human approval"
        );

        tokio::select! {
            outcome = rx => match outcome {
                Ok(Outcome::Approved) => Ok(true),
                Ok(Outcome::Denied) => Ok(false),
                Ok(Outcome::TimedOut) => {
                    tracing::warn!(approval_id = %id, "approval timed out");
                    Ok(request.timeout_effect == TimeoutEffect::Allow)
                }
                // Sender dropped without a decision; treat as a timeout.
                Err(_) => Ok(request.timeout_effect == TimeoutEffect::Allow),
            },
            _ = cancel.cancelled() => {
                self.pending.lock().unwrap().remove(&id);
                if let Err(e) = self
                    .store
                    .resolve_approval(&id, ApprovalStatus::TimedOut, "context_cancelled")
                    .await
                {
                    tracing::warn!(approval_id = %id, error = %e, "failed to persist cancellation");
                }
                Err(Error::CancelRequested(format!("approval {id} abandoned")))
            }
        }
    }

    /// Resolve a pending approval. Unknown ids and double resolution collapse
    /// into the same error.
    pub async fn resolve(&self, id: &str, approved: bool, resolved_by: &str) -> Result<()> {
        let entry = self
            .pending
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| Error::ApprovalUnknown(id.to_string()))?;

        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        // The blocked caller trusts the in-memory decision; a store failure
        // here is an observability gap, not a correctness one.
        if let Err(e) = self.store.resolve_approval(id, status, resolved_by).await {
            tracing::warn!(approval_id = %id, error = %e, "failed to persist resolution");
        }

        tracing::info!(approval_id = %id, approved, resolved_by, "approval resolved");
        let _ = entry.tx.send(if approved {
            Outcome::Approved
        } else {
            Outcome::Denied
        });
        Ok(())
    }

    /// Ids currently blocking a caller.
    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.lock().unwrap().keys().cloned().collect()
    }

    /// One sweep pass: settle every entry whose deadline has passed.
    pub async fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<(String, PendingEntry)> = {
            let mut pending = self.pending.lock().unwrap();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| now > entry.deadline)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (id, entry) in expired {
            if let Err(e) = self
                .store
                .resolve_approval(&id, ApprovalStatus::TimedOut, "system")
                .await
            {
                tracing::warn!(approval_id = %id, error = %e, "failed to persist timeout");
            }
            let _ = entry.tx.send(Outcome::TimedOut);
        }
    }

    /// Background sweeper; runs until the token is cancelled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sweep_expired().await,
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_warden_store::MemoryStore;

    fn request(timeout: Duration, timeout_effect: TimeoutEffect) -> ApprovalRequest {
        ApprovalRequest {
            session_id: "s-1".into(),
            trace_id: "t-1".into(),
            agent_id: "agent-1".into(),
            policy_name: "hitl-transfers".into(),
            action_summary: "transfer $500 to vendor".into(),
            approvers: vec![],
            timeout,
            timeout_effect,
        }
    }

    fn queue() -> (Arc<ApprovalQueue>, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let alerts = Arc::new(AlertManager::new(vec![]));
        (Arc::new(ApprovalQueue::new(store.clone(), alerts)), store)
    }

    #[tokio::test]
    async fn submit_and_resolve_round_trip() {
        let (queue, store) = queue();

        let submitter = queue.clone();
        let handle = tokio::spawn(async move {
            submitter
                .submit(
                    request(Duration::from_secs(10), TimeoutEffect::Deny),
                    &CancellationToken::new(),
                )
                .await
        });

        // Wait for the request to register, then approve it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let ids = queue.pending_ids();
        assert_eq!(ids.len(), 1);
        queue.resolve(&ids[0], true, "alice").await.unwrap();

        assert!(handle.await.unwrap().unwrap());
        assert!(queue.pending_ids().is_empty());

        let stored = store.get_approval(&ids[0]).await.unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::Approved);
        assert_eq!(stored.resolved_by, "alice");
    }

    #[tokio::test]
    async fn denial_reaches_the_blocked_caller() {
        let (queue, _store) = queue();
        let submitter = queue.clone();
        let handle = tokio::spawn(async move {
            submitter
                .submit(
                    request(Duration::from_secs(10), TimeoutEffect::Deny),
                    &CancellationToken::new(),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let ids = queue.pending_ids();
        queue.resolve(&ids[0], false, "bob").await.unwrap();
        assert!(!handle.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn unknown_and_double_resolution_collapse_to_one_error() {
        let (queue, _store) = queue();
        let err = queue.resolve("ap-404", true, "alice").await.unwrap_err();
        assert!(err.to_string().contains("not found or already resolved"));

        let submitter = queue.clone();
        let handle = tokio::spawn(async move {
            submitter
                .submit(
                    request(Duration::from_secs(10), TimeoutEffect::Deny),
                    &CancellationToken::new(),
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let ids = queue.pending_ids();
        queue.resolve(&ids[0], true, "alice").await.unwrap();
        let err = queue.resolve(&ids[0], true, "alice").await.unwrap_err();
        assert!(err.to_string().contains("not found or already resolved"));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn timeout_applies_the_configured_effect() {
        let (queue, store) = queue();

        let deny = queue.clone();
        let denied = tokio::spawn(async move {
            deny.submit(
                request(Duration::from_millis(50), TimeoutEffect::Deny),
                &CancellationToken::new(),
            )
            .await
        });
        let allow = queue.clone();
        let allowed = tokio::spawn(async move {
            allow
                .submit(
                    request(Duration::from_millis(50), TimeoutEffect::Allow),
                    &CancellationToken::new(),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.sweep_expired().await;

        assert!(!denied.await.unwrap().unwrap());
        assert!(allowed.await.unwrap().unwrap());

        for approval in store.list_pending_approvals().await.unwrap() {
            panic!("approval still pending: {}", approval.id);
        }
    }

    #[tokio::test]
    async fn concurrent_submits_resolve_independently() {
        let (queue, store) = queue();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let submitter = queue.clone();
            handles.push(tokio::spawn(async move {
                submitter
                    .submit(
                        request(Duration::from_secs(10), TimeoutEffect::Deny),
                        &CancellationToken::new(),
                    )
                    .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let pending = store.list_pending_approvals().await.unwrap();
        assert_eq!(pending.len(), 5);

        // Approve the even ones, deny the odd ones.
        for (i, approval) in pending.iter().enumerate() {
            queue
                .resolve(&approval.id, i % 2 == 0, "reviewer")
                .await
                .unwrap();
        }

        let mut approvals = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                approvals += 1;
            }
        }
        assert_eq!(approvals, 3);
    }

    #[tokio::test]
    async fn cancellation_marks_the_approval_timed_out() {
        let (queue, store) = queue();
        let cancel = CancellationToken::new();

        let submitter = queue.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            submitter
                .submit(request(Duration::from_secs(10), TimeoutEffect::Deny), &token)
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let ids = queue.pending_ids();
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::CancelRequested(_))));

        let stored = store.get_approval(&ids[0]).await.unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::TimedOut);
        assert_eq!(stored.resolved_by, "context_cancelled");
        assert!(queue.pending_ids().is_empty());
    }
}
