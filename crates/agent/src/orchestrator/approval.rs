//! Approval broker - cooperative suspension for risky steps.
//!
//! A task that needs a human opens a request and waits on a oneshot
//! channel; only that task is suspended. A resolution from the UI completes
//! the channel. Requests that outlive the workspace's approval timeout are
//! expired by the waiting task itself.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot, watch};
use tracing::{info, warn};
use waymark_core::error::ApprovalError;
use waymark_core::event::{DomainEvent, EventBus};
use waymark_core::plan::{ApprovalRequest, Resolution};
use waymark_core::workspace::WorkspaceId;

/// How many settled request ids are remembered for `AlreadyResolved`.
const RESOLVED_MEMORY: usize = 1024;

/// What the waiting task learns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Rejected,
    TimedOut,
    /// The task was cancelled while waiting.
    Cancelled,
}

struct Pending {
    request: ApprovalRequest,
    responder: oneshot::Sender<bool>,
}

#[derive(Default)]
struct Ledger {
    pending: HashMap<String, Pending>,
    resolved: HashMap<String, Resolution>,
    resolved_order: Vec<String>,
}

impl Ledger {
    fn settle(&mut self, id: &str, resolution: Resolution) {
        self.resolved.insert(id.to_string(), resolution);
        self.resolved_order.push(id.to_string());
        if self.resolved_order.len() > RESOLVED_MEMORY {
            let oldest = self.resolved_order.remove(0);
            self.resolved.remove(&oldest);
        }
    }
}

#[derive(Default)]
pub struct ApprovalBroker {
    ledger: Mutex<Ledger>,
    events: Option<Arc<EventBus>>,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Open `request` and wait for a decision, the timeout, or cancellation.
    pub async fn request(
        &self,
        request: ApprovalRequest,
        timeout: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Decision {
        let id = request.id.clone();
        let step_id = request.step_id.clone();
        let receiver = self.open(request).await;

        tokio::select! {
            result = tokio::time::timeout(timeout, receiver) => match result {
                Ok(Ok(true)) => Decision::Approved,
                Ok(Ok(false)) => Decision::Rejected,
                // Responder dropped without an answer.
                Ok(Err(_)) => Decision::Cancelled,
                Err(_) => {
                    self.close(&id, Resolution::TimedOut).await;
                    warn!(
                        approval_id = %id,
                        step_id = %step_id,
                        timeout_secs = timeout.as_secs(),
                        "Approval timed out"
                    );
                    Decision::TimedOut
                }
            },
            _ = super::cancelled(cancel) => {
                self.close(&id, Resolution::Rejected).await;
                Decision::Cancelled
            }
        }
    }

    async fn open(&self, request: ApprovalRequest) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        info!(
            approval_id = %request.id,
            task_id = %request.task_id,
            workspace_id = %request.workspace_id,
            required_level = %request.required_level,
            "Approval requested"
        );
        self.publish(DomainEvent::ApprovalRequested {
            approval_id: request.id.clone(),
            task_id: request.task_id.clone(),
            workspace_id: request.workspace_id.to_string(),
            step_description: request.step_description.clone(),
            required_level: request.required_level,
            timestamp: Utc::now(),
        });
        self.ledger.lock().await.pending.insert(
            request.id.clone(),
            Pending {
                request,
                responder: tx,
            },
        );
        rx
    }

    /// Remove a pending request without notifying the waiter.
    async fn close(&self, id: &str, resolution: Resolution) {
        let mut ledger = self.ledger.lock().await;
        if ledger.pending.remove(id).is_some() {
            ledger.settle(id, resolution);
            drop(ledger);
            self.publish(DomainEvent::ApprovalResolved {
                approval_id: id.to_string(),
                resolution,
                timestamp: Utc::now(),
            });
        }
    }

    /// Approve or reject a pending request.
    pub async fn resolve(&self, id: &str, approved: bool) -> Result<ApprovalRequest, ApprovalError> {
        let mut ledger = self.ledger.lock().await;
        let Some(pending) = ledger.pending.remove(id) else {
            return Err(if ledger.resolved.contains_key(id) {
                ApprovalError::AlreadyResolved(id.to_string())
            } else {
                ApprovalError::NotFound(id.to_string())
            });
        };
        let resolution = if approved {
            Resolution::Approved
        } else {
            Resolution::Rejected
        };
        ledger.settle(id, resolution);
        drop(ledger);

        // The waiter may have given up a moment ago; the decision is moot then.
        if pending.responder.send(approved).is_err() {
            warn!(approval_id = id, "Approval resolved after its task stopped waiting");
        }

        let mut request = pending.request;
        request.resolution = resolution;
        info!(approval_id = id, task_id = %request.task_id, ?resolution, "Approval resolved");
        self.publish(DomainEvent::ApprovalResolved {
            approval_id: id.to_string(),
            resolution,
            timestamp: Utc::now(),
        });
        Ok(request)
    }

    /// Pending requests, oldest first, optionally for one workspace.
    pub async fn pending(&self, workspace_id: Option<&WorkspaceId>) -> Vec<ApprovalRequest> {
        let ledger = self.ledger.lock().await;
        let mut requests: Vec<ApprovalRequest> = ledger
            .pending
            .values()
            .filter(|p| workspace_id.is_none_or(|ws| &p.request.workspace_id == ws))
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        requests
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waymark_core::plan::{ActionKind, BrowserAction, RiskLevel};

    fn request(id: &str, ws: &str) -> ApprovalRequest {
        ApprovalRequest {
            id: id.into(),
            task_id: "task".into(),
            workspace_id: WorkspaceId::from(ws),
            step_id: "step".into(),
            step_description: "Place the order".into(),
            action: BrowserAction::new(ActionKind::Purchase),
            required_level: RiskLevel(5),
            resolution: Resolution::Pending,
            created_at: Utc::now(),
        }
    }

    async fn wait_for_pending(broker: &ApprovalBroker) {
        while broker.pending(None).await.is_empty() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn approve_wakes_the_waiter() {
        let broker = Arc::new(ApprovalBroker::new());
        let (_tx, mut rx) = watch::channel(false);
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .request(request("a1", "ws"), Duration::from_secs(30), &mut rx)
                    .await
            })
        };
        wait_for_pending(&broker).await;

        let resolved = broker.resolve("a1", true).await.unwrap();
        assert_eq!(resolved.resolution, Resolution::Approved);
        assert_eq!(waiter.await.unwrap(), Decision::Approved);
        assert!(matches!(
            broker.resolve("a1", true).await,
            Err(ApprovalError::AlreadyResolved(_))
        ));
    }

    #[tokio::test]
    async fn reject_is_reported() {
        let broker = Arc::new(ApprovalBroker::new());
        let (_tx, mut rx) = watch::channel(false);
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .request(request("r1", "ws"), Duration::from_secs(30), &mut rx)
                    .await
            })
        };
        wait_for_pending(&broker).await;
        broker.resolve("r1", false).await.unwrap();
        assert_eq!(waiter.await.unwrap(), Decision::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_request_times_out() {
        let broker = ApprovalBroker::new();
        let (_tx, mut rx) = watch::channel(false);
        let decision = broker
            .request(request("t1", "ws"), Duration::from_secs(30), &mut rx)
            .await;
        assert_eq!(decision, Decision::TimedOut);
        assert!(broker.pending(None).await.is_empty());
        assert!(matches!(
            broker.resolve("t1", true).await,
            Err(ApprovalError::AlreadyResolved(_))
        ));
    }

    #[tokio::test]
    async fn cancellation_withdraws_request() {
        let broker = Arc::new(ApprovalBroker::new());
        let (tx, mut rx) = watch::channel(false);
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .request(request("c1", "ws"), Duration::from_secs(30), &mut rx)
                    .await
            })
        };
        wait_for_pending(&broker).await;
        tx.send(true).unwrap();
        assert_eq!(waiter.await.unwrap(), Decision::Cancelled);
        assert!(broker.pending(None).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_id_not_found() {
        let broker = ApprovalBroker::new();
        assert!(matches!(
            broker.resolve("nope", true).await,
            Err(ApprovalError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn pending_filters_by_workspace() {
        let broker = Arc::new(ApprovalBroker::new());
        let mut waiters = Vec::new();
        for (id, ws) in [("p1", "a"), ("p2", "b")] {
            let broker = broker.clone();
            let (tx, mut rx) = watch::channel(false);
            waiters.push((
                tx,
                tokio::spawn(async move {
                    broker
                        .request(request(id, ws), Duration::from_secs(30), &mut rx)
                        .await
                }),
            ));
        }
        while broker.pending(None).await.len() < 2 {
            tokio::task::yield_now().await;
        }
        let only_a = broker.pending(Some(&WorkspaceId::from("a"))).await;
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].id, "p1");

        for (tx, waiter) in waiters {
            tx.send(true).unwrap();
            waiter.await.unwrap();
        }
    }
}
