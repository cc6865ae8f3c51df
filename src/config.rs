use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::gate::InMemoryRelationships;
use crate::ledger::{InMemoryLedger, SessionPurchase};
use crate::model::{Ms, UserId};

/// Server settings, read once from `FITSLOT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub seed_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            bind: lookup("FITSLOT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: lookup("FITSLOT_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),
            data_dir: PathBuf::from(lookup("FITSLOT_DATA_DIR").unwrap_or_else(|| "./data".into())),
            compact_threshold: lookup("FITSLOT_COMPACT_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
            metrics_port: lookup("FITSLOT_METRICS_PORT").and_then(|s| s.parse().ok()),
            seed_file: lookup("FITSLOT_SEED_FILE").map(PathBuf::from),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("schedule.wal")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedRelationship {
    pub trainer_id: UserId,
    pub client_id: UserId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedPurchase {
    pub trainer_id: UserId,
    pub client_id: UserId,
    pub sessions_purchased: u32,
    #[serde(default = "default_active")]
    pub active: bool,
    pub expires_at: Option<Ms>,
}

fn default_active() -> bool {
    true
}

/// Relationships and purchases loaded into the in-memory collaborators at boot.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seed {
    #[serde(default)]
    pub relationships: Vec<SeedRelationship>,
    #[serde(default)]
    pub purchases: Vec<SeedPurchase>,
}

impl Seed {
    pub fn load(path: &Path) -> io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn apply(&self, gate: &InMemoryRelationships, ledger: &InMemoryLedger) {
        for r in &self.relationships {
            gate.accept(r.trainer_id, r.client_id);
        }
        for p in &self.purchases {
            ledger.record(
                p.trainer_id,
                p.client_id,
                SessionPurchase {
                    sessions_purchased: p.sessions_purchased,
                    active: p.active,
                    expires_at: p.expires_at,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::gate::RelationshipGate;
    use crate::ledger::PurchaseLedger;
    use ulid::Ulid;

    #[test]
    fn defaults() {
        let cfg = Config::from_lookup(|_| None);
        assert_eq!(cfg.addr(), "0.0.0.0:8080");
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/schedule.wal"));
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.seed_file, None);
    }

    #[test]
    fn overrides_and_bad_numbers() {
        let vars: HashMap<&str, &str> = [
            ("FITSLOT_BIND", "127.0.0.1"),
            ("FITSLOT_PORT", "9000"),
            ("FITSLOT_COMPACT_THRESHOLD", "lots"),
            ("FITSLOT_METRICS_PORT", "9100"),
        ]
        .into_iter()
        .collect();
        let cfg = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.addr(), "127.0.0.1:9000");
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.metrics_port, Some(9100));
    }

    #[tokio::test]
    async fn seed_populates_collaborators() {
        let (t, c) = (Ulid::new(), Ulid::new());
        let raw = format!(
            r#"{{"relationships":[{{"trainerId":"{t}","clientId":"{c}"}}],
                "purchases":[{{"trainerId":"{t}","clientId":"{c}","sessionsPurchased":10}}]}}"#
        );
        let seed: Seed = serde_json::from_str(&raw).unwrap();
        let gate = InMemoryRelationships::new();
        let ledger = InMemoryLedger::new();
        seed.apply(&gate, &ledger);

        assert!(gate.is_accepted(t, c).await.unwrap());
        let purchases = ledger.purchases(t, c).await.unwrap();
        assert_eq!(purchases.len(), 1);
        assert!(purchases[0].active);
    }
}
