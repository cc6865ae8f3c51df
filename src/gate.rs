use async_trait::async_trait;
use dashmap::DashSet;

use crate::engine::EngineError;
use crate::model::UserId;

/// Answers whether a trainer and a client have an accepted relationship.
/// Owned by the account system; this crate only consults it.
#[async_trait]
pub trait RelationshipGate: Send + Sync {
    async fn is_accepted(&self, trainer_id: UserId, client_id: UserId) -> Result<bool, EngineError>;
}

/// Process-local relationship table, seeded at boot or by tests.
#[derive(Debug, Default)]
pub struct InMemoryRelationships {
    accepted: DashSet<(UserId, UserId)>,
}

impl InMemoryRelationships {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self, trainer_id: UserId, client_id: UserId) {
        self.accepted.insert((trainer_id, client_id));
    }

    pub fn revoke(&self, trainer_id: UserId, client_id: UserId) {
        self.accepted.remove(&(trainer_id, client_id));
    }
}

#[async_trait]
impl RelationshipGate for InMemoryRelationships {
    async fn is_accepted(&self, trainer_id: UserId, client_id: UserId) -> Result<bool, EngineError> {
        Ok(self.accepted.contains(&(trainer_id, client_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[tokio::test]
    async fn accept_and_revoke() {
        let gate = InMemoryRelationships::new();
        let (t, c) = (Ulid::new(), Ulid::new());
        assert!(!gate.is_accepted(t, c).await.unwrap());
        gate.accept(t, c);
        assert!(gate.is_accepted(t, c).await.unwrap());
        // direction matters
        assert!(!gate.is_accepted(c, t).await.unwrap());
        gate.revoke(t, c);
        assert!(!gate.is_accepted(t, c).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_accepts_all_land() {
        let gate = std::sync::Arc::new(InMemoryRelationships::new());
        let trainer = Ulid::new();
        let clients: Vec<Ulid> = (0..32).map(|_| Ulid::new()).collect();

        let tasks: Vec<_> = clients
            .iter()
            .map(|&c| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.accept(trainer, c) })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }

        for c in clients {
            assert!(gate.is_accepted(trainer, c).await.unwrap());
        }
    }
}
