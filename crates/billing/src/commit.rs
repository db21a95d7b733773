//! Checkout commit
//!
//! The terminal transition of a checkout session. A first-time purchase turns
//! the session into an order; a subscription change replays a fresh preview on
//! the gateway. Both paths close the session, and every precondition is checked
//! before anything is written. A change commit claims the session before it
//! calls the gateway and hands the claim back if the gateway call fails.

use std::sync::Arc;

use cartwright_shared::{CheckoutSession, CheckoutSessionView, JsonMap, Order};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChangeCommitter, CommitResult, GatewayRegistry};
use crate::invariants::CHANGE_COMMIT_KEY;
use crate::preview::{ChangePreview, ChangePreviewEngine, PreviewResult};
use crate::signal::Signal;
use crate::store::CheckoutStore;

pub const CHANGE_SIGNAL_KEY: &str = "change_signal";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommitOutcome {
    Order {
        session: CheckoutSession,
        order: Order,
    },
    SubscriptionChange {
        session: CheckoutSession,
        signal: Signal,
        result: CommitResult,
    },
}

impl CommitOutcome {
    pub fn session(&self) -> &CheckoutSession {
        match self {
            CommitOutcome::Order { session, .. }
            | CommitOutcome::SubscriptionChange { session, .. } => session,
        }
    }
}

#[derive(Clone)]
pub struct CheckoutCommitOrchestrator {
    store: Arc<dyn CheckoutStore>,
    gateways: GatewayRegistry,
    previews: ChangePreviewEngine,
}

impl CheckoutCommitOrchestrator {
    pub fn new(
        store: Arc<dyn CheckoutStore>,
        gateways: GatewayRegistry,
        previews: ChangePreviewEngine,
    ) -> Self {
        Self {
            store,
            gateways,
            previews,
        }
    }

    pub async fn commit(&self, org_id: Uuid, session_id: Uuid) -> BillingResult<CommitOutcome> {
        let view = self
            .store
            .load_session(org_id, session_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Checkout session {}", session_id)))?;

        // Checked first so duplicate submissions short-circuit
        if self
            .store
            .find_order_for_session(org_id, session_id)
            .await?
            .is_some()
        {
            return Err(BillingError::AlreadyHasOrder(session_id));
        }
        if view.session.is_closed() {
            return Err(BillingError::SessionClosed(session_id));
        }

        if view.session.is_subscription_change() {
            self.commit_change(org_id, view).await
        } else {
            self.commit_order(org_id, view).await
        }
    }

    async fn commit_order(
        &self,
        org_id: Uuid,
        view: CheckoutSessionView,
    ) -> BillingResult<CommitOutcome> {
        let session_id = view.session.id;
        if !view.session.has_prepared_intent() {
            return Err(BillingError::MissingPaymentIntent(session_id));
        }
        if view.session.customer_id.is_none() {
            return Err(BillingError::MissingCustomer(session_id));
        }

        let order = self
            .store
            .create_order_from_session(org_id, session_id)
            .await?;

        tracing::info!(
            org_id = %org_id,
            session_id = %session_id,
            order_id = %order.id,
            total_amount = order.total_amount,
            "Committed checkout as order"
        );

        let session = self.reload(org_id, session_id).await?;
        Ok(CommitOutcome::Order { session, order })
    }

    async fn commit_change(
        &self,
        org_id: Uuid,
        view: CheckoutSessionView,
    ) -> BillingResult<CommitOutcome> {
        let session_id = view.session.id;
        let integration = view.session.integration;
        let gateway = self.gateways.get(integration)?;

        let committer = gateway
            .change_committer()
            .ok_or(BillingError::CapabilityUnsupported {
                integration,
                capability: "subscription change commits",
            })?;
        if view.session.subscription_id.is_some() && gateway.change_previewer().is_none() {
            return Err(BillingError::CapabilityUnsupported {
                integration,
                capability: "subscription change previews",
            });
        }

        // Only the caller holding the claim reaches the gateway
        self.store.begin_change_commit(org_id, session_id).await?;

        let committed = self.preview_and_commit(org_id, session_id, committer).await;
        let (preview, result) = match committed {
            Ok(committed) => committed,
            Err(e) => {
                if let Err(release_err) = self.store.release_change_commit(org_id, session_id).await {
                    tracing::warn!(
                        org_id = %org_id,
                        session_id = %session_id,
                        error = %release_err,
                        "Failed to release change commit claim"
                    );
                }
                return Err(e);
            }
        };

        let mut patch = JsonMap::new();
        patch.insert(CHANGE_COMMIT_KEY.to_string(), result.to_json());
        patch.insert(
            CHANGE_SIGNAL_KEY.to_string(),
            serde_json::Value::String(preview.signal.as_str().to_string()),
        );
        let session = self.store.close_session(org_id, session_id, patch).await?;

        tracing::info!(
            org_id = %org_id,
            session_id = %session_id,
            subscription_id = %result.id,
            signal = %preview.signal,
            "Committed subscription change"
        );

        Ok(CommitOutcome::SubscriptionChange {
            session,
            signal: preview.signal,
            result,
        })
    }

    async fn preview_and_commit(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        committer: &dyn ChangeCommitter,
    ) -> BillingResult<(ChangePreview, CommitResult)> {
        // Cart as of the claim; no edits can land after this point
        let view = self
            .store
            .load_session(org_id, session_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Checkout session {}", session_id)))?;

        // Never commit a stale quote
        let preview = match self.previews.preview(&view, None).await {
            PreviewResult::Enabled(preview) => preview,
            PreviewResult::Disabled { reason } => {
                tracing::warn!(
                    org_id = %org_id,
                    session_id = %session_id,
                    reason = %reason,
                    "Refusing to commit subscription change without a preview"
                );
                return Err(BillingError::PreviewUnavailable(reason));
            }
        };

        let result = committer.commit_change(&view, &preview).await?;
        Ok((preview, result))
    }

    async fn reload(&self, org_id: Uuid, session_id: Uuid) -> BillingResult<CheckoutSession> {
        self.store
            .load_session(org_id, session_id)
            .await?
            .map(|view| view.session)
            .ok_or_else(|| BillingError::NotFound(format!("Checkout session {}", session_id)))
    }
}
