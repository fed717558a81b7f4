use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════
//  EntityKey
// ═══════════════════════════════════════════════════════════════

/// Identity of one monitored endpoint: `(ip, port, service)`.
///
/// Fields are private so a key cannot change after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    ip: String,
    port: u32,
    service: String,
}

impl EntityKey {
    pub fn new(ip: impl Into<String>, port: u32, service: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port,
            service: service.into(),
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.port, self.service)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Observation / ObservationRecord
// ═══════════════════════════════════════════════════════════════

/// A decoded write, not yet resolved against stored state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub key: EntityKey,
    /// Producer-supplied event time. The only field used for conflict resolution.
    pub event_timestamp: i64,
    pub payload: String,
}

impl Observation {
    pub fn new(key: EntityKey, event_timestamp: i64, payload: impl Into<String>) -> Self {
        Self {
            key,
            event_timestamp,
            payload: payload.into(),
        }
    }

    /// Materialize the record a store persists for this observation.
    pub fn into_record(self, ingested_at: DateTime<Utc>) -> ObservationRecord {
        ObservationRecord {
            key: self.key,
            event_timestamp: self.event_timestamp,
            payload: self.payload,
            ingested_at,
        }
    }
}

/// Latest accepted observation for one key, as held by a store.
///
/// Stores hand out owned copies; mutating a returned record never
/// affects stored state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationRecord {
    #[serde(flatten)]
    pub key: EntityKey,
    pub event_timestamp: i64,
    pub payload: String,
    /// Wall-clock write time, assigned by the store. Bookkeeping only.
    pub ingested_at: DateTime<Utc>,
}
