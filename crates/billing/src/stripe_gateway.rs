//! Stripe implementation of the gateway capabilities
//!
//! Subscriptions, previews, intents, and commits go through raw REST calls so
//! newer API shapes (item-level billing periods, `parent` proration details)
//! are read without waiting on typed bindings. Customers use the typed client.

use std::collections::HashMap;

use async_trait::async_trait;
use cartwright_shared::{CheckoutSessionView, CurrencyCode, Discount, IntegrationType, IntentMode};
use serde_json::Value;
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    ChangeCommitter, ChangeContext, ChangeIntent, ChangePreviewer, CommitResult,
    CreateIntentRequest, DiscountProvider, GatewayCustomer, GatewayIntent, GatewayPrice,
    GatewaySubscription, GatewaySubscriptionItem, PaymentGateway,
};
use crate::preview::{
    ChangePreview, CommitDescriptor, EffectiveTiming, PreviewLine, PreviewOperation,
    PreviewTotals, PriceQuantity,
};
use crate::signal::{Signal, SubscriptionStatus};

type Form = Vec<(String, String)>;

fn push(form: &mut Form, key: impl Into<String>, value: impl ToString) {
    form.push((key.into(), value.to_string()));
}

#[derive(Clone)]
pub struct StripeGateway {
    client: StripeClient,
}

impl StripeGateway {
    pub fn new(client: StripeClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &StripeClient {
        &self.client
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn integration(&self) -> IntegrationType {
        IntegrationType::Stripe
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<GatewaySubscription> {
        let query = vec![(
            "expand[]".to_string(),
            "items.data.price.product".to_string(),
        )];
        let raw = self
            .client
            .get(&format!("/v1/subscriptions/{}", subscription_id), &query)
            .await?;

        parse_subscription(&raw)
    }

    async fn create_intent(&self, request: CreateIntentRequest) -> BillingResult<GatewayIntent> {
        let mut form = Form::new();
        push(&mut form, "customer", &request.customer_id);
        for (i, method) in request.payment_methods.iter().enumerate() {
            push(&mut form, format!("payment_method_types[{}]", i), method);
        }
        for (key, value) in &request.metadata {
            push(&mut form, format!("metadata[{}]", key), value);
        }

        let path = match request.mode {
            IntentMode::Setup => {
                push(&mut form, "usage", "off_session");
                "/v1/setup_intents"
            }
            IntentMode::Payment => {
                push(&mut form, "amount", request.amount);
                push(&mut form, "currency", request.currency.as_str());
                "/v1/payment_intents"
            }
        };

        let raw = self.client.post_form(path, &form).await?;
        let intent = GatewayIntent {
            id: required_str(&raw, "id")?,
            mode: request.mode,
            client_secret: required_str(&raw, "client_secret")?,
            status: raw["status"].as_str().unwrap_or("unknown").to_string(),
        };

        tracing::info!(
            intent_id = %intent.id,
            mode = %intent.mode,
            customer = %request.customer_id,
            "Created Stripe intent"
        );

        Ok(intent)
    }

    async fn create_customer(
        &self,
        email: &str,
        metadata: HashMap<String, String>,
    ) -> BillingResult<GatewayCustomer> {
        let mut params = stripe::CreateCustomer::new();
        params.email = Some(email);
        params.metadata = Some(metadata);

        let customer = self
            .client
            .typed(
                "create_customer",
                stripe::Customer::create(self.client.inner(), params),
            )
            .await?;

        tracing::info!(customer_id = %customer.id, "Created Stripe customer");

        Ok(GatewayCustomer {
            id: customer.id.to_string(),
        })
    }

    fn change_previewer(&self) -> Option<&dyn ChangePreviewer> {
        Some(self)
    }

    fn change_committer(&self) -> Option<&dyn ChangeCommitter> {
        Some(self)
    }

    fn discount_provider(&self) -> Option<&dyn DiscountProvider> {
        Some(self)
    }
}

#[async_trait]
impl ChangePreviewer for StripeGateway {
    async fn preview_change(
        &self,
        ctx: &ChangeContext<'_>,
        intent: &ChangeIntent,
    ) -> BillingResult<ChangePreview> {
        let price = ctx.base_line.gateway_price_ref.clone().ok_or_else(|| {
            BillingError::InvalidInput(format!(
                "Price {} is not synced to Stripe",
                ctx.base_line.local_price_id
            ))
        })?;
        let customer_id = ctx
            .subscription
            .customer_id
            .clone()
            .or_else(|| ctx.session.session.customer_id.clone())
            .ok_or(BillingError::MissingCustomer(ctx.session.session.id))?;

        let mut form = Form::new();
        push(&mut form, "customer", &customer_id);
        push(&mut form, "subscription_details[items][0][price]", &price);
        push(
            &mut form,
            "subscription_details[items][0][quantity]",
            ctx.desired_quantity,
        );

        let commit = if intent.signal == Signal::Resume {
            // Dead subscriptions cannot be updated, the customer starts over
            CommitDescriptor::Create {
                customer_id: Some(customer_id.clone()),
                price: Some(price.clone()),
                local_price_id: intent.target_price_id,
                quantity: ctx.desired_quantity,
                trial_days: None,
                trial_end: None,
            }
        } else {
            let (proration_behavior, proration_date) = match intent.effective_at.timing {
                EffectiveTiming::AtDate => (
                    "create_prorations",
                    Some(intent.effective_at.at.unix_timestamp()),
                ),
                EffectiveTiming::AtPeriodEnd | EffectiveTiming::AtTrialEnd => ("none", None),
            };

            push(&mut form, "subscription", &ctx.subscription.id);
            push(
                &mut form,
                "subscription_details[items][0][id]",
                &ctx.existing_item.id,
            );
            push(
                &mut form,
                "subscription_details[proration_behavior]",
                proration_behavior,
            );
            if let Some(date) = proration_date {
                push(&mut form, "subscription_details[proration_date]", date);
            }

            CommitDescriptor::Update {
                subscription_id: ctx.subscription.id.clone(),
                item_id: ctx.existing_item.id.clone(),
                price: Some(price.clone()),
                local_price_id: intent.target_price_id,
                quantity: ctx.desired_quantity,
                proration_behavior: proration_behavior.to_string(),
                proration_date,
            }
        };

        tracing::info!(
            customer = %customer_id,
            subscription = %ctx.subscription.id,
            item_id = %ctx.existing_item.id,
            new_price_id = %price,
            signal = %intent.signal,
            "Calling Stripe invoices/create_preview API"
        );

        let invoice = self
            .client
            .post_form("/v1/invoices/create_preview", &form)
            .await?;

        let currency = invoice["currency"]
            .as_str()
            .and_then(|c| CurrencyCode::parse(c).ok())
            .unwrap_or_else(|| ctx.base_line.currency.clone());
        let lines = parse_invoice_lines(&invoice, &currency);

        // Deferred changes land on the next regular invoice
        let due_now = match (&commit, intent.effective_at.timing) {
            (CommitDescriptor::Create { .. }, _) | (_, EffectiveTiming::AtDate) => {
                invoice["amount_due"].as_i64().unwrap_or(0)
            }
            _ => 0,
        };

        Ok(ChangePreview {
            signal: intent.signal,
            effective: intent.effective_at.clone(),
            totals: PreviewTotals { due_now, currency },
            lines,
            operations: vec![PreviewOperation {
                current: Some(PriceQuantity {
                    price: Some(ctx.existing_item.price.id.clone()),
                    unit_amount: ctx.existing_item.price.unit_amount,
                    quantity: ctx.existing_item.quantity,
                }),
                future: PriceQuantity {
                    price: Some(price),
                    unit_amount: ctx.base_line.unit_amount,
                    quantity: ctx.desired_quantity,
                },
                quantity_delta: intent.quantity_delta,
            }],
            commit,
        })
    }
}

#[async_trait]
impl ChangeCommitter for StripeGateway {
    async fn commit_change(
        &self,
        session: &CheckoutSessionView,
        preview: &ChangePreview,
    ) -> BillingResult<CommitResult> {
        let session_id = session.session.id;
        let mut form = Form::new();
        push(&mut form, "metadata[checkout_session_id]", session_id);
        push(&mut form, "metadata[change_signal]", preview.signal);

        let path = match &preview.commit {
            CommitDescriptor::Update {
                subscription_id,
                item_id,
                price,
                quantity,
                proration_behavior,
                proration_date,
                ..
            } => {
                let price = price.as_deref().ok_or_else(|| {
                    BillingError::InvalidInput("Commit descriptor has no price".to_string())
                })?;
                push(&mut form, "items[0][id]", item_id);
                push(&mut form, "items[0][price]", price);
                push(&mut form, "items[0][quantity]", quantity);
                push(&mut form, "proration_behavior", proration_behavior);
                if let Some(date) = proration_date {
                    push(&mut form, "proration_date", date);
                }
                format!("/v1/subscriptions/{}", subscription_id)
            }
            CommitDescriptor::Create {
                customer_id,
                price,
                quantity,
                trial_days,
                trial_end,
                ..
            } => {
                let price = price.as_deref().ok_or_else(|| {
                    BillingError::InvalidInput("Commit descriptor has no price".to_string())
                })?;
                let customer = customer_id
                    .as_deref()
                    .or(session.session.customer_id.as_deref())
                    .ok_or(BillingError::MissingCustomer(session_id))?;

                push(&mut form, "customer", customer);
                push(&mut form, "items[0][price]", price);
                push(&mut form, "items[0][quantity]", quantity);
                match (trial_end, trial_days) {
                    (Some(end), _) => push(&mut form, "trial_end", end),
                    (None, Some(days)) => push(&mut form, "trial_period_days", days),
                    (None, None) => {}
                }
                push(
                    &mut form,
                    "payment_settings[save_default_payment_method]",
                    "on_subscription",
                );
                "/v1/subscriptions".to_string()
            }
        };

        let key = commit_idempotency_key(session);
        let raw = self
            .client
            .post_form_idempotent(&path, &form, &key)
            .await?;
        let result = CommitResult {
            id: required_str(&raw, "id")?,
            status: raw["status"].as_str().unwrap_or("unknown").to_string(),
            payload: raw,
        };

        tracing::info!(
            session_id = %session_id,
            subscription_id = %result.id,
            status = %result.status,
            signal = %preview.signal,
            "Committed subscription change on Stripe"
        );

        Ok(result)
    }
}

#[async_trait]
impl DiscountProvider for StripeGateway {
    async fn resolve_discount(
        &self,
        _session: &CheckoutSessionView,
        code: &str,
    ) -> BillingResult<Option<Discount>> {
        let query = vec![
            ("code".to_string(), code.to_string()),
            ("active".to_string(), "true".to_string()),
            ("limit".to_string(), "1".to_string()),
        ];
        let raw = self.client.get("/v1/promotion_codes", &query).await?;

        Ok(raw["data"]
            .as_array()
            .and_then(|codes| codes.first())
            .map(|promotion| parse_promotion_code(code, promotion)))
    }
}

/// One key per commit claim; a retry after a released claim gets a fresh key
fn commit_idempotency_key(session: &CheckoutSessionView) -> String {
    format!(
        "checkout-commit-{}-{}",
        session.session.id,
        session.session.updated_at.unix_timestamp_nanos()
    )
}

fn required_str(value: &Value, field: &str) -> BillingResult<String> {
    value[field].as_str().map(str::to_string).ok_or_else(|| {
        BillingError::StripeApi(format!("Stripe response is missing '{}'", field))
    })
}

fn timestamp(value: &Value) -> Option<OffsetDateTime> {
    value
        .as_i64()
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}

/// Ids may arrive bare or as expanded objects
fn id_of(value: &Value) -> Option<String> {
    value
        .as_str()
        .or_else(|| value["id"].as_str())
        .map(str::to_string)
}

fn parse_subscription(raw: &Value) -> BillingResult<GatewaySubscription> {
    let items = raw["items"]["data"]
        .as_array()
        .map(|items| items.iter().map(parse_item).collect::<BillingResult<Vec<_>>>())
        .transpose()?
        .unwrap_or_default();

    // Newer API versions moved billing periods onto the items
    let current_period_end = timestamp(&raw["current_period_end"]).or_else(|| {
        raw["items"]["data"]
            .as_array()
            .and_then(|items| items.iter().find_map(|i| timestamp(&i["current_period_end"])))
    });

    Ok(GatewaySubscription {
        id: required_str(raw, "id")?,
        customer_id: id_of(&raw["customer"]),
        status: SubscriptionStatus::parse(raw["status"].as_str().unwrap_or_default()),
        items,
        trial_end: timestamp(&raw["trial_end"]),
        current_period_end,
    })
}

fn parse_item(raw: &Value) -> BillingResult<GatewaySubscriptionItem> {
    let price = &raw["price"];
    let currency = CurrencyCode::parse(price["currency"].as_str().unwrap_or_default())?;
    let recurring_interval = price["recurring"]["interval"]
        .as_str()
        .and_then(|i| i.parse().ok());

    Ok(GatewaySubscriptionItem {
        id: required_str(raw, "id")?,
        price: GatewayPrice {
            id: required_str(price, "id")?,
            unit_amount: price["unit_amount"].as_i64().unwrap_or(0),
            currency,
            recurring_interval,
            product_id: id_of(&price["product"]),
            product_name: price["product"]["name"].as_str().map(str::to_string),
        },
        quantity: raw["quantity"]
            .as_u64()
            .and_then(|q| u32::try_from(q).ok())
            .unwrap_or(1),
    })
}

fn parse_invoice_lines(invoice: &Value, currency: &CurrencyCode) -> Vec<PreviewLine> {
    invoice["lines"]["data"]
        .as_array()
        .map(|lines| {
            lines
                .iter()
                .map(|line| PreviewLine {
                    description: line["description"].as_str().unwrap_or_default().to_string(),
                    amount: line["amount"].as_i64().unwrap_or(0),
                    currency: line["currency"]
                        .as_str()
                        .and_then(|c| CurrencyCode::parse(c).ok())
                        .unwrap_or_else(|| currency.clone()),
                    is_proration: line["proration"].as_bool().unwrap_or_else(|| {
                        line["parent"]["subscription_item_details"]["proration"]
                            .as_bool()
                            .unwrap_or(false)
                    }),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_promotion_code(code: &str, promotion: &Value) -> Discount {
    // Older API versions nest the coupon at the top level
    let coupon = if promotion["coupon"].is_object() {
        &promotion["coupon"]
    } else {
        &promotion["promotion"]["coupon"]
    };

    Discount {
        code: code.to_string(),
        gateway_ref: id_of(promotion),
        amount_off: coupon["amount_off"].as_i64(),
        percent_off: coupon["percent_off"].as_f64(),
        currency: coupon["currency"]
            .as_str()
            .and_then(|c| CurrencyCode::parse(c).ok()),
    }
}
