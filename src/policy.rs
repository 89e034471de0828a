//! Hot-reloadable gate policy.
//!
//! The policy document is a small JSON file:
//!
//! ```json
//! { "eligibilityGateEnabled": true, "perIdentityLimit": 3 }
//! ```
//!
//! `perIdentityLimit: null` means unlimited. Fields missing from the document,
//! or the whole document when it is absent or unreadable, fall back to the
//! defaults the store was built with. Reads are pull-based: the file is
//! re-read on access once the cached copy is older than the TTL.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub eligibility_gate_enabled: bool,
    /// `None` is unlimited.
    pub per_identity_limit: Option<u64>,
}

impl Policy {
    /// Gate off, no limit.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// Apply `X402_ELIGIBILITY_GATE_ENABLED` and `X402_PER_IDENTITY_LIMIT`.
    pub fn with_environment(mut self, environment: &HashMap<String, String>) -> Self {
        if let Some(flag) = environment
            .get("X402_ELIGIBILITY_GATE_ENABLED")
            .and_then(|v| parse_flag(v))
        {
            self.eligibility_gate_enabled = flag;
        }
        if let Some(raw) = environment.get("X402_PER_IDENTITY_LIMIT") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "" | "none" | "null" | "unlimited" => self.per_identity_limit = None,
                other => match other.parse::<u64>() {
                    Ok(limit) => self.per_identity_limit = Some(limit),
                    Err(_) => warn!("ignoring X402_PER_IDENTITY_LIMIT={:?}", raw),
                },
            }
        }
        self
    }

    /// True once `completed` paid actions exhaust the per-identity limit.
    pub fn limit_reached(&self, completed: u64) -> bool {
        matches!(self.per_identity_limit, Some(limit) if completed >= limit)
    }

    fn overlay(mut self, document: &Value) -> Self {
        if let Some(enabled) = field(document, &["eligibilityGateEnabled", "allowlistEnabled"]) {
            match enabled.as_bool() {
                Some(flag) => self.eligibility_gate_enabled = flag,
                None => warn!("policy: eligibilityGateEnabled is not a boolean, keeping default"),
            }
        }
        if let Some(limit) = field(document, &["perIdentityLimit", "perWalletLimit"]) {
            match limit {
                Value::Null => self.per_identity_limit = None,
                other => match other.as_u64() {
                    Some(limit) => self.per_identity_limit = Some(limit),
                    None => warn!("policy: perIdentityLimit is not a non-negative integer, keeping default"),
                },
            }
        }
        self
    }
}

fn field<'a>(document: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| document.get(*name))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read-only snapshot provider handed to the orchestrator.
pub trait PolicySource: Send + Sync {
    fn current_policy(&self) -> Policy;
}

/// A fixed policy.
impl PolicySource for Policy {
    fn current_policy(&self) -> Policy {
        *self
    }
}

struct CachedPolicy {
    policy: Policy,
    loaded_at: Instant,
}

/// File-backed policy with a TTL cache.
pub struct PolicyStore {
    path: PathBuf,
    ttl: Duration,
    defaults: Policy,
    cached: Mutex<Option<CachedPolicy>>,
}

impl PolicyStore {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration, defaults: Policy) -> Self {
        Self {
            path: path.into(),
            ttl,
            defaults,
            cached: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Force the next read to go to disk.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }

    fn load(&self) -> Policy {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                debug!("policy file {:?} unavailable ({}), using defaults", self.path, e);
                return self.defaults;
            }
        };
        match serde_json::from_str::<Value>(&content) {
            Ok(document) if document.is_object() => self.defaults.overlay(&document),
            Ok(_) => {
                warn!("policy file {:?} is not a JSON object, using defaults", self.path);
                self.defaults
            }
            Err(e) => {
                warn!("policy file {:?} unreadable ({}), using defaults", self.path, e);
                self.defaults
            }
        }
    }
}

impl PolicySource for PolicyStore {
    fn current_policy(&self) -> Policy {
        if let Some(entry) = self.cached.lock().as_ref() {
            if entry.loaded_at.elapsed() < self.ttl {
                return entry.policy;
            }
        }
        // the file is read with the lock released
        let policy = self.load();
        *self.cached.lock() = Some(CachedPolicy {
            policy,
            loaded_at: Instant::now(),
        });
        policy
    }
}
