/// Eligibility gate: allow-list membership and per-identity quota.
use crate::ledger::QuotaLedger;
use crate::policy::Policy;
use crate::types::address_hex;
use ethers::types::Address;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub trait EligibilitySource: Send + Sync {
    /// Case-insensitive membership test.
    fn is_eligible(&self, address: &str) -> bool;
}

enum Backing {
    Static(HashSet<String>),
    File {
        path: PathBuf,
        ttl: Duration,
        cached: Mutex<Option<(HashSet<String>, Instant)>>,
    },
}

/// Newline-delimited address list. Blank lines and `#` comments are skipped.
pub struct AllowList {
    backing: Backing,
}

impl AllowList {
    pub fn from_file(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            backing: Backing::File {
                path: path.into(),
                ttl,
                cached: Mutex::new(None),
            },
        }
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .map(|entry| entry.as_ref().trim().to_lowercase())
            .filter(|entry| !entry.is_empty())
            .collect();
        Self {
            backing: Backing::Static(entries),
        }
    }

    pub fn parse(content: &str) -> HashSet<String> {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_lowercase)
            .collect()
    }

    fn load(path: &Path) -> HashSet<String> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let entries = Self::parse(&content);
                debug!("loaded {} allow-list entries from {:?}", entries.len(), path);
                entries
            }
            Err(e) => {
                // an unreadable list admits nobody while the gate is on
                warn!("allow-list {:?} unreadable: {}", path, e);
                HashSet::new()
            }
        }
    }
}

impl EligibilitySource for AllowList {
    fn is_eligible(&self, address: &str) -> bool {
        let needle = address.trim().to_lowercase();
        match &self.backing {
            Backing::Static(entries) => entries.contains(&needle),
            Backing::File { path, ttl, cached } => {
                if let Some((entries, loaded_at)) = cached.lock().as_ref() {
                    if loaded_at.elapsed() < *ttl {
                        return entries.contains(&needle);
                    }
                }
                // read with the lock released; racing refreshes each store a full list
                let entries = Self::load(path);
                let eligible = entries.contains(&needle);
                *cached.lock() = Some((entries, Instant::now()));
                eligible
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    NotEligible,
    QuotaExceeded { completed: u64, limit: u64 },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Admits recovered payers under the current [`Policy`].
#[derive(Clone)]
pub struct EligibilityGate {
    allowlist: Arc<dyn EligibilitySource>,
    quota: Arc<QuotaLedger>,
}

impl EligibilityGate {
    pub fn new(allowlist: Arc<dyn EligibilitySource>, quota: Arc<QuotaLedger>) -> Self {
        Self { allowlist, quota }
    }

    pub fn quota(&self) -> &QuotaLedger {
        &self.quota
    }

    /// Allow-list half of admission. Only consulted when the gate is enabled.
    pub fn check_eligibility(&self, payer: &Address, policy: &Policy) -> Admission {
        if policy.eligibility_gate_enabled && !self.allowlist.is_eligible(&address_hex(payer)) {
            return Admission::NotEligible;
        }
        Admission::Admitted
    }

    /// Quota half of admission: completed paid actions against the limit.
    pub async fn check_quota(&self, payer: &Address, policy: &Policy) -> Admission {
        let Some(limit) = policy.per_identity_limit else {
            return Admission::Admitted;
        };
        let completed = self.quota.count(payer).await;
        if policy.limit_reached(completed) {
            Admission::QuotaExceeded { completed, limit }
        } else {
            Admission::Admitted
        }
    }
}
