//! Checkout routes
//!
//! `POST /checkout/{session_id}` dispatches on the body's `action` field:
//! `setFields`, `setProperties`, `setItem`, `addDiscount`, `removeDiscount`,
//! `commit` and `prepare_payment`. Anything else is a 400.

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use cartwright_billing::{PrepareRequest, PreviewResult, SetItemRequest};
use cartwright_shared::JsonMap;
use serde::Deserialize;
use serde_json::Value;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    routes::OrganizationId,
    state::AppState,
};

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct SetFieldsBody {
    email: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetPropertiesBody {
    properties: JsonMap,
}

#[derive(Debug, Deserialize)]
struct SetItemBody {
    offer_item_id: Option<Uuid>,
    price_id: Option<Uuid>,
    quantity: u32,
}

#[derive(Debug, Deserialize)]
struct DiscountBody {
    code: String,
}

#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    /// RFC 3339 timestamp overriding when the change takes effect
    pub effective_at: Option<String>,
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn checkout_action(
    State(state): State<AppState>,
    OrganizationId(org_id): OrganizationId,
    Path(session_id): Path<Uuid>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let action = body
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::Validation("Request body must include an action".to_string()))?
        .to_string();

    tracing::debug!(
        org_id = %org_id,
        session_id = %session_id,
        action = %action,
        "Checkout action"
    );

    let billing = &state.billing;
    let response = match action.as_str() {
        "setFields" => {
            let body: SetFieldsBody = serde_json::from_value(body)?;
            let view = billing
                .sessions
                .set_fields(org_id, session_id, body.email, body.name)
                .await?;
            Json(view).into_response()
        }
        "setProperties" => {
            let body: SetPropertiesBody = serde_json::from_value(body)?;
            let view = billing
                .sessions
                .set_properties(org_id, session_id, body.properties)
                .await?;
            Json(view).into_response()
        }
        "setItem" => {
            let body: SetItemBody = serde_json::from_value(body)?;
            let request = SetItemRequest {
                offer_item_id: body.offer_item_id,
                price_id: body.price_id,
                quantity: body.quantity,
            };
            let view = billing.sessions.set_item(org_id, session_id, request).await?;
            Json(view).into_response()
        }
        "addDiscount" => {
            let body: DiscountBody = serde_json::from_value(body)?;
            let view = billing
                .sessions
                .add_discount(org_id, session_id, &body.code)
                .await?;
            Json(view).into_response()
        }
        "removeDiscount" => {
            let body: DiscountBody = serde_json::from_value(body)?;
            let view = billing
                .sessions
                .remove_discount(org_id, session_id, &body.code)
                .await?;
            Json(view).into_response()
        }
        "commit" => Json(billing.commits.commit(org_id, session_id).await?).into_response(),
        "prepare_payment" => {
            let request: PrepareRequest = serde_json::from_value(body)?;
            Json(billing.payments.prepare(org_id, session_id, request).await?).into_response()
        }
        other => return Err(ApiError::UnknownAction(other.to_string())),
    };

    Ok(response)
}

pub async fn preview(
    State(state): State<AppState>,
    OrganizationId(org_id): OrganizationId,
    Path(session_id): Path<Uuid>,
    Query(query): Query<PreviewQuery>,
) -> ApiResult<Json<PreviewResult>> {
    let effective_at = query
        .effective_at
        .as_deref()
        .map(|raw| {
            OffsetDateTime::parse(raw, &Rfc3339)
                .map_err(|e| ApiError::Validation(format!("Invalid effective_at '{}': {}", raw, e)))
        })
        .transpose()?;

    let view = state.billing.sessions.get(org_id, session_id).await?;
    let result = state.billing.previews.preview(&view, effective_at).await;

    if let Some(reason) = result.disabled_reason() {
        tracing::debug!(
            org_id = %org_id,
            session_id = %session_id,
            reason = %reason,
            "Change preview disabled"
        );
    }

    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{create_router, ORGANIZATION_HEADER};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        Router,
    };
    use cartwright_billing::gateway::test::MockGateway;
    use cartwright_billing::store::test::{fixtures, InMemoryCheckoutStore};
    use cartwright_billing::{BillingService, CheckoutConfig, GatewayRegistry};
    use cartwright_shared::{CheckoutSessionView, Discount, IntegrationType};
    use serde_json::json;
    use std::sync::Arc;
    use tower::ServiceExt;

    const ADMIN_TOKEN: &str = "admin-secret";

    fn admin_get(token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/admin/invariants");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    struct TestApp {
        router: Router,
        store: InMemoryCheckoutStore,
        gateway: Arc<MockGateway>,
    }

    fn test_app() -> TestApp {
        let store = InMemoryCheckoutStore::new();
        let gateway = Arc::new(MockGateway::new());
        let billing = BillingService::new(
            Arc::new(store.clone()),
            GatewayRegistry::new().with_gateway(gateway.clone()),
            CheckoutConfig::default(),
        );
        TestApp {
            router: create_router(
                AppState::new(billing).with_admin_token(Some(ADMIN_TOKEN.to_string())),
            ),
            store,
            gateway,
        }
    }

    fn seeded(app: &TestApp, amount: i64) -> CheckoutSessionView {
        let org = fixtures::organization();
        let session = fixtures::session(org, IntegrationType::Stripe);
        let item = fixtures::one_time_price_view(org, "Workshop", amount);
        let view = fixtures::view(session.clone(), vec![fixtures::line(&session, &item, None, 1)]);
        app.store.insert_view(&view);
        view
    }

    fn action(view: &CheckoutSessionView, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/checkout/{}", view.session.id))
            .header("content-type", "application/json")
            .header(ORGANIZATION_HEADER, view.session.organization_id.to_string())
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: String, org_id: Uuid) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(ORGANIZATION_HEADER, org_id.to_string())
            .body(Body::empty())
            .unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_unknown_action_is_bad_request() {
        let app = test_app();
        let view = seeded(&app, 1000);

        let (status, body) = send(&app.router, action(&view, json!({"action": "explode"}))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "unknown_action");
        assert!(body["message"].as_str().unwrap().contains("explode"));
    }

    #[tokio::test]
    async fn test_missing_organization_header() {
        let app = test_app();
        let view = seeded(&app, 1000);
        let request = Request::builder()
            .method("POST")
            .uri(format!("/checkout/{}", view.session.id))
            .header("content-type", "application/json")
            .body(Body::from(json!({"action": "commit"}).to_string()))
            .unwrap();

        let (status, body) = send(&app.router, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "missing_organization");
    }

    #[tokio::test]
    async fn test_session_of_other_organization_not_visible() {
        let app = test_app();
        let view = seeded(&app, 1000);

        let (status, body) = send(
            &app.router,
            get(
                format!("/checkout/{}/preview", view.session.id),
                fixtures::organization(),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "not_found");
    }

    #[tokio::test]
    async fn test_set_item_updates_total() {
        let app = test_app();
        let view = seeded(&app, 1000);
        let extra = fixtures::one_time_price_view(view.session.organization_id, "Recording", 250);
        app.store.insert_price(extra.clone());

        let (status, body) = send(
            &app.router,
            action(
                &view,
                json!({"action": "setItem", "price_id": extra.price.id, "quantity": 4}),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session"]["total"], 2000);
    }

    #[tokio::test]
    async fn test_add_discount_applies_code() {
        let app = test_app();
        let view = seeded(&app, 1000);
        app.gateway.insert_discount(Discount {
            code: "SAVE10".to_string(),
            gateway_ref: Some("promo_1".to_string()),
            amount_off: None,
            percent_off: Some(10.0),
            currency: None,
        });

        let (status, body) = send(
            &app.router,
            action(&view, json!({"action": "addDiscount", "code": "SAVE10"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session"]["total"], 900);

        let (status, body) = send(
            &app.router,
            action(&view, json!({"action": "removeDiscount", "code": "SAVE10"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session"]["total"], 1000);
    }

    #[tokio::test]
    async fn test_commit_without_intent_is_bad_request() {
        let app = test_app();
        let view = seeded(&app, 1000);

        let (status, body) = send(&app.router, action(&view, json!({"action": "commit"}))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "missing_payment_intent");
        assert!(app.store.orders().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_then_commit_creates_order() {
        let app = test_app();
        let view = seeded(&app, 1000);

        let (status, body) = send(
            &app.router,
            action(
                &view,
                json!({
                    "action": "prepare_payment",
                    "email": "buyer@example.com",
                    "payment_type": "card",
                    "current_url": "https://shop.example.com/pricing",
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["intent_type"], "payment");
        assert_eq!(body["is_redirect_method"], false);
        assert_eq!(body["return_url"], "https://shop.example.com/pricing");

        let (status, body) = send(&app.router, action(&view, json!({"action": "commit"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "order");
        assert_eq!(body["order"]["total_amount"], 1000);

        // Duplicate submit
        let (status, body) = send(&app.router, action(&view, json!({"action": "commit"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "already_has_order");
        assert_eq!(app.store.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_preview_disabled_without_recurring_line() {
        let app = test_app();
        let view = seeded(&app, 1000);

        let (status, body) = send(
            &app.router,
            get(
                format!("/checkout/{}/preview", view.session.id),
                view.session.organization_id,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], false);
        assert!(body["disabled_reason"].is_string());
    }

    #[tokio::test]
    async fn test_preview_rejects_bad_effective_at() {
        let app = test_app();
        let view = seeded(&app, 1000);

        let (status, body) = send(
            &app.router,
            get(
                format!("/checkout/{}/preview?effective_at=tomorrow", view.session.id),
                view.session.organization_id,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "validation_error");
    }

    #[tokio::test]
    async fn test_unconfigured_gateway_is_internal_error() {
        let store = InMemoryCheckoutStore::new();
        let billing = BillingService::new(
            Arc::new(store.clone()),
            GatewayRegistry::new(),
            CheckoutConfig::default(),
        );
        let router = create_router(AppState::new(billing));
        let org = fixtures::organization();
        let view = fixtures::view(fixtures::session(org, IntegrationType::Stripe), vec![]);
        store.insert_view(&view);

        let (status, body) = send(
            &router,
            action(&view, json!({"action": "addDiscount", "code": "SAVE10"})),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].is_string());
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_invariants_and_health() {
        let app = test_app();
        seeded(&app, 1000);

        let (status, body) = send(&app.router, admin_get(Some(ADMIN_TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);

        let (status, body) = send(
            &app.router,
            get("/health".to_string(), fixtures::organization()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_invariants_require_admin_token() {
        let app = test_app();
        seeded(&app, 1000);

        for token in [None, Some("wrong"), Some("admin-secre"), Some("")] {
            let (status, body) = send(&app.router, admin_get(token)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "token {:?}", token);
            assert_eq!(body["type"], "unauthorized");
            assert!(body.get("violations").is_none());
        }

        // An organization header is not an admin credential
        let (status, _) = send(
            &app.router,
            get("/admin/invariants".to_string(), fixtures::organization()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_invariants_closed_without_configured_token() {
        let billing = BillingService::new(
            Arc::new(InMemoryCheckoutStore::new()),
            GatewayRegistry::new().with_gateway(Arc::new(MockGateway::new())),
            CheckoutConfig::default(),
        );
        let router = create_router(AppState::new(billing));

        let (status, _) = send(&router, admin_get(Some(ADMIN_TOKEN))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
