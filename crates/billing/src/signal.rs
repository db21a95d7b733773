//! Subscription change signals
//!
//! A signal is the business meaning of a change to a subscription. The
//! classifier is a pure, total function: every combination of inputs maps to
//! exactly one signal, and the order of the checks below is the precedence.

use serde::{Deserialize, Serialize};

/// Closed set of change signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// New customer, no live subscription
    Acquisition,
    Upgrade,
    Downgrade,
    /// Same price, more seats
    Expansion,
    /// Same price, fewer seats
    Contraction,
    /// Trial converting to paid with nothing else changing
    Convert,
    /// Coming back from a canceled/unpaid/expired subscription
    Resume,
    /// No change detected
    Renewal,
    /// Price change during a trial
    Switch,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Acquisition => "acquisition",
            Signal::Upgrade => "upgrade",
            Signal::Downgrade => "downgrade",
            Signal::Expansion => "expansion",
            Signal::Contraction => "contraction",
            Signal::Convert => "convert",
            Signal::Resume => "resume",
            Signal::Renewal => "renewal",
            Signal::Switch => "switch",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway subscription status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
    Other(String),
}

impl SubscriptionStatus {
    /// Parsing never fails; unknown statuses are kept verbatim
    pub fn parse(raw: &str) -> Self {
        match raw {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" | "cancelled" => SubscriptionStatus::Canceled,
            "unpaid" => SubscriptionStatus::Unpaid,
            "incomplete" => SubscriptionStatus::Incomplete,
            "incomplete_expired" => SubscriptionStatus::IncompleteExpired,
            "paused" => SubscriptionStatus::Paused,
            other => SubscriptionStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Other(raw) => raw,
        }
    }

    /// Statuses a customer can only leave by starting over
    pub fn is_dead(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled
                | SubscriptionStatus::Unpaid
                | SubscriptionStatus::IncompleteExpired
        )
    }

    pub fn is_trialing(&self) -> bool {
        *self == SubscriptionStatus::Trialing
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a change from the current subscription state to the requested one
pub fn classify(
    current_status: &SubscriptionStatus,
    current_unit_amount: i64,
    future_unit_amount: i64,
    current_quantity: u32,
    future_quantity: u32,
) -> Signal {
    if current_status.is_dead() {
        return Signal::Resume;
    }

    if current_status.is_trialing() {
        return if future_unit_amount != current_unit_amount {
            Signal::Switch
        } else if future_quantity > current_quantity {
            Signal::Expansion
        } else if future_quantity < current_quantity {
            Signal::Contraction
        } else {
            Signal::Convert
        };
    }

    if future_unit_amount > current_unit_amount {
        Signal::Upgrade
    } else if future_unit_amount < current_unit_amount {
        Signal::Downgrade
    } else if future_quantity > current_quantity {
        Signal::Expansion
    } else if future_quantity < current_quantity {
        Signal::Contraction
    } else {
        Signal::Renewal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(s: &str) -> SubscriptionStatus {
        SubscriptionStatus::parse(s)
    }

    #[test]
    fn test_classifier_table() {
        let cases = [
            ("active", 1000, 2000, 1, 1, Signal::Upgrade),
            ("active", 2000, 1000, 1, 1, Signal::Downgrade),
            ("active", 1000, 1000, 1, 2, Signal::Expansion),
            ("active", 1000, 1000, 2, 1, Signal::Contraction),
            ("active", 1000, 1000, 1, 1, Signal::Renewal),
            ("trialing", 1000, 1500, 1, 1, Signal::Switch),
            ("trialing", 1000, 1000, 1, 1, Signal::Convert),
            ("canceled", 1000, 1500, 1, 1, Signal::Resume),
        ];

        for (s, cur_amt, fut_amt, cur_qty, fut_qty, expected) in cases {
            assert_eq!(
                classify(&status(s), cur_amt, fut_amt, cur_qty, fut_qty),
                expected,
                "({}, {}, {}, {}, {})",
                s,
                cur_amt,
                fut_amt,
                cur_qty,
                fut_qty
            );
        }
    }

    #[test]
    fn test_dead_statuses_always_resume() {
        for s in ["canceled", "unpaid", "incomplete_expired"] {
            for (cur_amt, fut_amt) in [(1000, 500), (1000, 1000), (1000, 5000)] {
                for (cur_qty, fut_qty) in [(1, 1), (3, 1), (1, 3)] {
                    assert_eq!(
                        classify(&status(s), cur_amt, fut_amt, cur_qty, fut_qty),
                        Signal::Resume
                    );
                }
            }
        }
    }

    #[test]
    fn test_price_change_outranks_quantity_change() {
        // Upgrade wins over expansion when both change
        assert_eq!(
            classify(&status("active"), 1000, 2000, 1, 5),
            Signal::Upgrade
        );
        assert_eq!(
            classify(&status("active"), 2000, 1000, 1, 5),
            Signal::Downgrade
        );
        // During a trial any price change is a switch, even a cheaper one
        assert_eq!(
            classify(&status("trialing"), 2000, 1000, 5, 1),
            Signal::Switch
        );
    }

    #[test]
    fn test_trial_quantity_changes() {
        assert_eq!(
            classify(&status("trialing"), 1000, 1000, 1, 4),
            Signal::Expansion
        );
        assert_eq!(
            classify(&status("trialing"), 1000, 1000, 4, 1),
            Signal::Contraction
        );
    }

    #[test]
    fn test_other_statuses_use_active_rules() {
        for s in ["past_due", "incomplete", "paused", "something_new"] {
            assert_eq!(classify(&status(s), 1000, 2000, 1, 1), Signal::Upgrade);
            assert_eq!(classify(&status(s), 1000, 1000, 1, 1), Signal::Renewal);
        }
    }

    #[test]
    fn test_status_parse_is_total() {
        assert_eq!(status("cancelled"), SubscriptionStatus::Canceled);
        assert_eq!(
            status("brand_new_status"),
            SubscriptionStatus::Other("brand_new_status".to_string())
        );
        assert_eq!(status("past_due").as_str(), "past_due");
    }

    #[test]
    fn test_signal_wire_names() {
        assert_eq!(serde_json::to_string(&Signal::Acquisition).unwrap(), "\"acquisition\"");
        assert_eq!(Signal::Renewal.to_string(), "renewal");
    }
}
