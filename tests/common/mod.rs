#![allow(dead_code)]

use std::sync::Arc;
use tutor_escrow::application::engine::SettlementEngine;
use tutor_escrow::application::requests::{CaptureRequest, RefundRequest, TopupRequest};
use tutor_escrow::config::Config;
use tutor_escrow::domain::ids::{SessionId, UserId};
use tutor_escrow::domain::session::SessionTerms;
use tutor_escrow::infrastructure::in_memory::InMemoryLedgerStore;

pub const HEADER: &str =
    "op,session,student,mentor,amount,mentor_share,platform_share,reference,key,at";

pub fn engine() -> Arc<SettlementEngine> {
    Arc::new(SettlementEngine::new(
        Arc::new(InMemoryLedgerStore::new()),
        &Config::default(),
    ))
}

pub fn topup(user: &str, amount: i64) -> TopupRequest {
    TopupRequest {
        user_id: UserId::new(user),
        amount,
        gateway_reference: None,
        idempotency_key: None,
    }
}

/// Session terms with an 80/20 mentor/platform split.
pub fn terms(session: &str, student: &str, mentor: &str, total: i64) -> SessionTerms {
    let mentor_share = total * 4 / 5;
    SessionTerms {
        session_id: SessionId::new(session),
        student_id: UserId::new(student),
        mentor_id: UserId::new(mentor),
        total,
        mentor_share,
        platform_share: total - mentor_share,
    }
}

pub fn capture(terms: &SessionTerms) -> CaptureRequest {
    CaptureRequest {
        session_id: terms.session_id.clone(),
        student_id: terms.student_id.clone(),
        mentor_id: terms.mentor_id.clone(),
        total: terms.total,
        mentor_share: terms.mentor_share,
        platform_share: terms.platform_share,
    }
}

pub fn refund(terms: &SessionTerms, total: i64) -> RefundRequest {
    let mentor_share = total * 4 / 5;
    RefundRequest {
        session_id: terms.session_id.clone(),
        student_id: terms.student_id.clone(),
        mentor_id: terms.mentor_id.clone(),
        refund_total: total,
        refund_mentor_share: mentor_share,
        refund_platform_share: total - mentor_share,
        idempotency_key: None,
    }
}

/// Writes `rows` under the batch header into a temporary file.
pub fn batch_file(rows: &[&str]) -> tempfile::NamedTempFile {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{}", HEADER).unwrap();
    for row in rows {
        writeln!(file, "{}", row).unwrap();
    }
    file
}
