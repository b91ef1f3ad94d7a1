use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Cancelled,
}

impl FromStr for OrderStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(AppError::BadRequest(format!("无效的订单状态: {s}"))),
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: i64,
    pub customer_id: String,
    pub total_amount: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub customer_id: String,
    pub total_amount: f64,
    #[serde(default)]
    pub status: OrderStatus,
}

/// 订单只允许修改状态
#[derive(Debug, Deserialize)]
pub struct UpdateOrderRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct OrderFilter {
    pub status: Option<String>,
}

impl CreateOrderRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        let len = self.customer_id.chars().count();
        if len == 0 || len > 255 {
            return Err(AppError::Validation("客户ID长度需在1到255之间".to_string()));
        }
        if !(self.total_amount.is_finite() && self.total_amount > 0.0) {
            return Err(AppError::Validation("订单金额必须大于0".to_string()));
        }
        Ok(())
    }

    pub fn into_order(self, id: i64, now: DateTime<Utc>) -> Order {
        Order {
            id,
            customer_id: self.customer_id,
            total_amount: self.total_amount,
            status: self.status,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing_and_default() {
        assert_eq!("completed".parse::<OrderStatus>().unwrap(), OrderStatus::Completed);
        assert!("shipped".parse::<OrderStatus>().is_err());

        let req: CreateOrderRequest =
            serde_json::from_str(r#"{"customer_id":"c-1","total_amount":12.5}"#).unwrap();
        assert_eq!(req.status, OrderStatus::Pending);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn rejects_bad_amount_and_customer() {
        let req = CreateOrderRequest {
            customer_id: String::new(),
            total_amount: 1.0,
            status: OrderStatus::Pending,
        };
        assert!(req.validate().is_err());
        let req = CreateOrderRequest {
            customer_id: "c".into(),
            total_amount: -3.0,
            status: OrderStatus::Pending,
        };
        assert!(req.validate().is_err());
    }
}
