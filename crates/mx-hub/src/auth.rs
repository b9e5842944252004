//! PIN gating and token issuance.
//!
//! `/register` is the only PIN enforcement point. Tokens are deterministic
//! hashes of `matrix_id + hub_secret + issued_at`, held in hub memory only —
//! losing the hub's memory just forces clients to re-register. A reconnect
//! grace window keeps the previous token valid for 30 s after reissue; only
//! tokens older than the window are purged.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use mx_core::config::PinSetting;

/// Reconnect grace window during which a superseded token stays valid.
pub const TOKEN_GRACE: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// PIN
// ---------------------------------------------------------------------------

/// Resolved PIN policy.
#[derive(Debug, Clone)]
pub enum PinMode {
    Required(String),
    Disabled,
}

impl PinMode {
    /// Resolve the configured setting; a random PIN is minted (and must be
    /// logged by the caller) when none is configured.
    pub fn resolve(setting: &PinSetting) -> Self {
        match setting {
            PinSetting::Disabled => PinMode::Disabled,
            PinSetting::Configured(pin) => PinMode::Required(pin.clone()),
            PinSetting::Random => {
                let pin: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(6)
                    .map(char::from)
                    .collect();
                PinMode::Required(pin)
            }
        }
    }

    /// Constant-time PIN check.
    pub fn verify(&self, provided: Option<&str>) -> bool {
        match self {
            PinMode::Disabled => true,
            PinMode::Required(expected) => match provided {
                Some(p) => bool::from(p.as_bytes().ct_eq(expected.as_bytes())),
                None => false,
            },
        }
    }

    /// The PIN to log at startup, if one is enforced.
    pub fn display(&self) -> Option<&str> {
        match self {
            PinMode::Required(pin) => Some(pin),
            PinMode::Disabled => None,
        }
    }
}

// ---------------------------------------------------------------------------
// TokenBook
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TokenEntry {
    matrix_id: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// In-memory token registry.
pub struct TokenBook {
    secret: String,
    expiry: chrono::Duration,
    tokens: DashMap<String, TokenEntry>,
}

impl TokenBook {
    pub fn new(secret: impl Into<String>, expiry_hours: u64) -> Self {
        Self {
            secret: secret.into(),
            expiry: chrono::Duration::hours(expiry_hours as i64),
            tokens: DashMap::new(),
        }
    }

    /// Issue a token for a matrix. Older tokens for the same matrix are
    /// purged only once they fall out of the grace window, so a racing
    /// reconnect with the previous token still authenticates.
    pub fn issue(&self, matrix_id: &str) -> String {
        let now = Utc::now();
        let token = self.derive(matrix_id, now);

        let grace = chrono::Duration::from_std(TOKEN_GRACE).expect("grace fits");
        self.tokens.retain(|_, entry| {
            entry.matrix_id != matrix_id || now - entry.issued_at <= grace
        });

        self.tokens.insert(
            token.clone(),
            TokenEntry {
                matrix_id: matrix_id.to_string(),
                issued_at: now,
                expires_at: now + self.expiry,
            },
        );
        token
    }

    /// Validate a token; returns the matrix id while unexpired.
    pub fn validate(&self, token: &str) -> Option<String> {
        let entry = self.tokens.get(token)?;
        if Utc::now() > entry.expires_at {
            drop(entry);
            self.tokens.remove(token);
            return None;
        }
        Some(entry.matrix_id.clone())
    }

    /// Drop expired tokens (called from the heartbeat tick).
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        self.tokens.retain(|_, entry| now <= entry.expires_at);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn derive(&self, matrix_id: &str, issued_at: DateTime<Utc>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(matrix_id.as_bytes());
        hasher.update(self.secret.as_bytes());
        hasher.update(issued_at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}
