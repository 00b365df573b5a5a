use std::fmt;

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topic carrying one event per accepted order.
pub const ORDER_CREATED: &str = "order.created";
/// Topic carrying one settlement result per order.
pub const PAYMENT_PROCESSED: &str = "payment.processed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Finished,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Finished => "FINISHED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published by the order service once the order row has committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
}

/// Published by the payment service after the debit decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentProcessed {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub user_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn statuses_use_their_wire_names() {
        assert_eq!(
            serde_json::to_value(OrderStatus::Finished).unwrap(),
            serde_json::json!("FINISHED")
        );
        assert_eq!(OrderStatus::Cancelled.to_string(), "CANCELLED");
        assert_eq!(OrderStatus::New.as_str(), "NEW");
    }

    #[test]
    fn payment_processed_wire_shape() {
        let order_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let event = PaymentProcessed {
            order_id,
            status: OrderStatus::Cancelled,
            user_id,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["order_id"], serde_json::json!(order_id));
        assert_eq!(value["status"], serde_json::json!("CANCELLED"));
        assert_eq!(value["user_id"], serde_json::json!(user_id));
    }

    #[test]
    fn order_created_accepts_numeric_amounts() {
        let event: OrderCreated = serde_json::from_value(serde_json::json!({
            "order_id": Uuid::new_v4(),
            "user_id": Uuid::new_v4(),
            "amount": 100.5,
        }))
        .unwrap();

        assert_eq!(event.amount, BigDecimal::from_str("100.5").unwrap());
    }
}
