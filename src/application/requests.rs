//! Inputs accepted by [`super::engine::SettlementEngine`].
//!
//! All amounts are minor currency units.

use crate::domain::ids::{SessionId, UserId};

/// Wallet credit confirmed by the payment gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct TopupRequest {
    pub user_id: UserId,
    pub amount: i64,
    pub gateway_reference: Option<String>,
    /// Usually derived from the gateway event id. Without it a retried
    /// webhook is applied again.
    pub idempotency_key: Option<String>,
}

/// Capture of a previously reserved wallet payment.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub session_id: SessionId,
    pub student_id: UserId,
    pub mentor_id: UserId,
    pub total: i64,
    pub mentor_share: i64,
    pub platform_share: i64,
}

/// Capture of a payment charged directly by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectCaptureRequest {
    pub session_id: SessionId,
    pub student_id: UserId,
    pub mentor_id: UserId,
    pub total: i64,
    pub mentor_share: i64,
    pub platform_share: i64,
    pub gateway: String,
    pub gateway_reference: String,
}

/// Post-capture refund. The caller computes the split, proportional to the
/// original capture.
#[derive(Debug, Clone, PartialEq)]
pub struct RefundRequest {
    pub session_id: SessionId,
    pub student_id: UserId,
    pub mentor_id: UserId,
    pub refund_total: i64,
    pub refund_mentor_share: i64,
    pub refund_platform_share: i64,
    pub idempotency_key: Option<String>,
}
