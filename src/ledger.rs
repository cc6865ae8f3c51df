use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::model::{Ms, UserId};

/// One purchase of a session package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPurchase {
    pub sessions_purchased: u32,
    pub active: bool,
    pub expires_at: Option<Ms>,
}

impl SessionPurchase {
    pub fn counts_at(&self, now: Ms) -> bool {
        self.active && self.expires_at.is_none_or(|t| t > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub purchased_sessions: u64,
    pub completed_appointments: u64,
    pub remaining_sessions: u64,
    pub due_for_payment: bool,
}

/// Purchased sessions for a trainer-client pair. Owned by billing.
#[async_trait]
pub trait PurchaseLedger: Send + Sync {
    async fn purchases(
        &self,
        trainer_id: UserId,
        client_id: UserId,
    ) -> Result<Vec<SessionPurchase>, EngineError>;
}

#[derive(Debug, Default)]
pub struct InMemoryLedger {
    purchases: DashMap<(UserId, UserId), Vec<SessionPurchase>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, trainer_id: UserId, client_id: UserId, purchase: SessionPurchase) {
        self.purchases
            .entry((trainer_id, client_id))
            .or_default()
            .push(purchase);
    }
}

#[async_trait]
impl PurchaseLedger for InMemoryLedger {
    async fn purchases(
        &self,
        trainer_id: UserId,
        client_id: UserId,
    ) -> Result<Vec<SessionPurchase>, EngineError> {
        Ok(self
            .purchases
            .get(&(trainer_id, client_id))
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }
}

/// Balance of purchased versus completed sessions.
pub fn summarize(purchases: &[SessionPurchase], completed_appointments: u64, now: Ms) -> SessionSummary {
    let purchased_sessions: u64 = purchases
        .iter()
        .filter(|p| p.counts_at(now))
        .map(|p| u64::from(p.sessions_purchased))
        .sum();
    let remaining_sessions = purchased_sessions.saturating_sub(completed_appointments);
    SessionSummary {
        purchased_sessions,
        completed_appointments,
        remaining_sessions,
        due_for_payment: purchased_sessions == 0 || remaining_sessions == 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn purchase(n: u32, active: bool, expires_at: Option<Ms>) -> SessionPurchase {
        SessionPurchase { sessions_purchased: n, active, expires_at }
    }

    #[test]
    fn ten_purchased_three_completed() {
        let s = summarize(&[purchase(10, true, None)], 3, 0);
        assert_eq!(s.purchased_sessions, 10);
        assert_eq!(s.remaining_sessions, 7);
        assert!(!s.due_for_payment);
    }

    #[test]
    fn nothing_purchased_is_due() {
        let s = summarize(&[], 0, 0);
        assert_eq!(s.remaining_sessions, 0);
        assert!(s.due_for_payment);
    }

    #[test]
    fn overused_clamps_to_zero() {
        let s = summarize(&[purchase(2, true, None)], 5, 0);
        assert_eq!(s.remaining_sessions, 0);
        assert!(s.due_for_payment);
    }

    #[test]
    fn inactive_and_expired_ignored() {
        let now = 1_000;
        let s = summarize(
            &[
                purchase(5, false, None),
                purchase(5, true, Some(now)),
                purchase(4, true, Some(now + 1)),
            ],
            1,
            now,
        );
        assert_eq!(s.purchased_sessions, 4);
        assert_eq!(s.remaining_sessions, 3);
    }

    #[tokio::test]
    async fn ledger_is_per_pair() {
        let ledger = InMemoryLedger::new();
        let (t, c) = (Ulid::new(), Ulid::new());
        ledger.record(t, c, purchase(10, true, None));
        assert_eq!(ledger.purchases(t, c).await.unwrap().len(), 1);
        assert!(ledger.purchases(t, Ulid::new()).await.unwrap().is_empty());
    }
}
