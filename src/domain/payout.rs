use super::account::Amount;
use super::ids::UserId;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Created,
    Pending,
    Paid,
    Failed,
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Mentor-initiated withdrawal of matured earnings.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct PayoutRequest {
    pub id: Uuid,
    pub mentor_id: UserId,
    pub amount: i64,
    pub currency: String,
    pub status: PayoutStatus,
    pub gateway_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl PayoutRequest {
    pub fn new(mentor_id: UserId, amount: Amount, currency: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            mentor_id,
            amount: amount.value(),
            currency: currency.to_string(),
            status: PayoutStatus::Created,
            gateway_reference: None,
            failure_reason: None,
            created_at: now,
            version: 0,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, to: PayoutStatus) -> Result<()> {
        use PayoutStatus::*;
        let allowed = matches!(
            (self.status, to),
            (Created, Pending) | (Pending, Paid) | (Created | Pending, Failed)
        );
        if !allowed {
            return Err(PaymentError::InvalidTransition {
                subject: format!("payout {}", self.id),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}
