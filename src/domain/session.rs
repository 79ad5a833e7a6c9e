use super::account::Amount;
use super::ids::{SessionId, UserId};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Reserved,
    Captured,
    /// Reserved funds handed back to the student before the session started.
    ReservationReleased,
    /// Mentor share matured from locked to available.
    EarningsReleased,
    Refunded,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Reserved => "reserved",
            Self::Captured => "captured",
            Self::ReservationReleased => "reservation_released",
            Self::EarningsReleased => "earnings_released",
            Self::Refunded => "refunded",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMode {
    /// Paid from the student's prepaid wallet (reserve, then capture).
    #[default]
    Wallet,
    /// Charged by the gateway at capture time, no reservation.
    Direct,
}

/// A validated `total = mentor + platform` split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    pub total: Amount,
    pub mentor: i64,
    pub platform: i64,
}

impl Split {
    pub fn new(total: i64, mentor: i64, platform: i64) -> Result<Self> {
        let total = Amount::new(total)?;
        if mentor < 0 || platform < 0 {
            return Err(PaymentError::ValidationError(format!(
                "Split shares must not be negative (mentor {}, platform {})",
                mentor, platform
            )));
        }
        if mentor.checked_add(platform) != Some(total.value()) {
            return Err(PaymentError::InvalidSplit {
                total: total.value(),
                mentor,
                platform,
            });
        }
        Ok(Self {
            total,
            mentor,
            platform,
        })
    }

    pub fn mentor_amount(&self) -> Option<Amount> {
        Amount::new(self.mentor).ok()
    }

    pub fn platform_amount(&self) -> Option<Amount> {
        Amount::new(self.platform).ok()
    }
}

/// What the booking feature agreed on when the session was created.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTerms {
    pub session_id: SessionId,
    pub student_id: UserId,
    pub mentor_id: UserId,
    pub total: i64,
    pub mentor_share: i64,
    pub platform_share: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct SessionPayment {
    pub session_id: SessionId,
    pub student_id: UserId,
    pub mentor_id: UserId,
    pub amount_total: i64,
    pub amount_mentor: i64,
    pub amount_platform: i64,
    pub amount_refunded: i64,
    pub mentor_refunded: i64,
    pub platform_refunded: i64,
    pub currency: String,
    pub mode: PaymentMode,
    pub status: SessionStatus,
    pub gateway_reference: Option<String>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub captured_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl SessionPayment {
    pub fn open(
        session_id: SessionId,
        student_id: UserId,
        mentor_id: UserId,
        split: Split,
        mode: PaymentMode,
        currency: &str,
    ) -> Self {
        Self {
            session_id,
            student_id,
            mentor_id,
            amount_total: split.total.value(),
            amount_mentor: split.mentor,
            amount_platform: split.platform,
            amount_refunded: 0,
            mentor_refunded: 0,
            platform_refunded: 0,
            currency: currency.to_string(),
            mode,
            status: SessionStatus::Created,
            gateway_reference: None,
            reserved_at: None,
            captured_at: None,
            released_at: None,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    fn can_transition(&self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self.status, to) {
            (Created, Reserved) => self.mode == PaymentMode::Wallet,
            (Created, Captured) => self.mode == PaymentMode::Direct,
            (Reserved, Captured) | (Reserved, ReservationReleased) => true,
            (Captured, EarningsReleased) => true,
            (Captured | EarningsReleased | Refunded, Refunded) => true,
            _ => false,
        }
    }

    pub fn transition(&mut self, to: SessionStatus) -> Result<()> {
        if !self.can_transition(to) {
            return Err(PaymentError::session_transition(
                self.session_id.as_str(),
                self.status,
                to,
            ));
        }
        self.status = to;
        Ok(())
    }

    /// Fails with `NotFound` when the session does not belong to the given parties.
    pub fn expect_parties(&self, student: &UserId, mentor: Option<&UserId>) -> Result<()> {
        if &self.student_id != student {
            return Err(PaymentError::NotFound(format!(
                "session {} for student {}",
                self.session_id, student
            )));
        }
        if let Some(mentor) = mentor
            && &self.mentor_id != mentor
        {
            return Err(PaymentError::NotFound(format!(
                "session {} for mentor {}",
                self.session_id, mentor
            )));
        }
        Ok(())
    }

    pub fn expect_total(&self, amount: i64) -> Result<()> {
        if self.amount_total != amount {
            return Err(PaymentError::AmountMismatch {
                session: self.session_id.to_string(),
                expected: self.amount_total,
                actual: amount,
            });
        }
        Ok(())
    }

    pub fn apply_split(&mut self, split: &Split) {
        self.amount_total = split.total.value();
        self.amount_mentor = split.mentor;
        self.amount_platform = split.platform;
    }

    /// Books a refund against the session, refusing anything beyond what was captured.
    pub fn record_refund(&mut self, refund: &Split) -> Result<()> {
        if !self.can_transition(SessionStatus::Refunded) {
            return Err(PaymentError::session_transition(
                self.session_id.as_str(),
                self.status,
                SessionStatus::Refunded,
            ));
        }
        let buckets = [
            ("total", self.amount_total, self.amount_refunded, refund.total.value()),
            ("mentor", self.amount_mentor, self.mentor_refunded, refund.mentor),
            ("platform", self.amount_platform, self.platform_refunded, refund.platform),
        ];
        for (bucket, captured, refunded, requested) in buckets {
            if refunded + requested > captured {
                return Err(PaymentError::RefundExceedsCapture {
                    session: self.session_id.to_string(),
                    bucket,
                    captured,
                    refunded,
                    requested,
                });
            }
        }
        self.amount_refunded += refund.total.value();
        self.mentor_refunded += refund.mentor;
        self.platform_refunded += refund.platform;
        self.status = SessionStatus::Refunded;
        Ok(())
    }

    /// Mentor share that has been neither refunded nor matured yet.
    pub fn unreleased_mentor_share(&self) -> i64 {
        if self.released_at.is_some() {
            return 0;
        }
        (self.amount_mentor - self.mentor_refunded).max(0)
    }

    pub fn is_due_for_release(&self, cutoff: DateTime<Utc>) -> bool {
        let captured_before_cutoff = self.captured_at.is_some_and(|at| at <= cutoff);
        let releasable = match self.status {
            SessionStatus::Captured => true,
            SessionStatus::Refunded => self.unreleased_mentor_share() > 0,
            _ => false,
        };
        captured_before_cutoff && self.released_at.is_none() && releasable
    }
}
