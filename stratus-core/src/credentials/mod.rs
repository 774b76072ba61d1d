//! Credential resolution: sessions, caching, and single-flight exchange.
//!
//! The resolver owns the only mutable credential state in the process. A
//! session cache keyed by (account, region) is guarded per key, so two
//! concurrent invocations asking for the same credentials trigger exactly one
//! exchange — the second waits on the first and reuses its result.

mod exchange;

pub use exchange::{AwsExchange, CredentialExchange};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::{AccountConfig, Secret};
use crate::types::InvocationContext;

/// Safety margin subtracted from session expiry so a token never expires
/// mid-call.
pub const EXPIRY_SKEW_SECONDS: i64 = 60;

/// Errors from credential resolution.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The account requires MFA and no code was supplied.
    #[error("account '{0}' requires an MFA code")]
    MfaRequired(String),

    /// The identity provider rejected the MFA code.
    #[error("MFA code rejected: {0}")]
    MfaRejected(String),

    /// The credential exchange itself failed.
    #[error("credential exchange failed: {0}")]
    Exchange(String),

    /// The invocation was cancelled while waiting on resolution.
    #[error("credential resolution cancelled")]
    Cancelled,
}

/// Resolved, time-bounded credential material for one account/region.
///
/// Never handed out once `now >= expires_at - skew`; `Debug` redacts the
/// secret material.
#[derive(Clone)]
pub struct Session {
    /// Access key id (not secret; appears in signatures).
    pub access_key_id: String,

    secret_access_key: Secret,
    session_token: Option<Secret>,

    /// Region this session is valid for.
    pub region: String,

    /// Expiry timestamp; `None` for static credentials that never expire.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a session.
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: Secret,
        session_token: Option<Secret>,
        region: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key,
            session_token,
            region: region.into(),
            expires_at,
        }
    }

    /// The secret access key.
    pub fn secret_access_key(&self) -> &str {
        self.secret_access_key.expose()
    }

    /// The session token, for temporary credentials.
    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_ref().map(Secret::expose)
    }

    /// Whether the session is still usable given the expiry skew.
    pub fn is_fresh(&self, skew: ChronoDuration) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => Utc::now() + skew < expires_at,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key)
            .field("session_token", &self.session_token)
            .field("region", &self.region)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    account: String,
    region: String,
}

type Slot = Arc<tokio::sync::Mutex<Option<Session>>>;

/// Resolves account references into live sessions.
///
/// The exchange itself happens behind the [`CredentialExchange`] seam so the
/// resolver can be exercised without an identity provider.
pub struct CredentialResolver {
    exchange: Arc<dyn CredentialExchange>,
    slots: parking_lot::Mutex<HashMap<SessionKey, Slot>>,
    skew: ChronoDuration,
}

impl CredentialResolver {
    /// Create a resolver over the given exchange implementation.
    pub fn new(exchange: Arc<dyn CredentialExchange>) -> Self {
        Self {
            exchange,
            slots: parking_lot::Mutex::new(HashMap::new()),
            skew: ChronoDuration::seconds(EXPIRY_SKEW_SECONDS),
        }
    }

    /// Override the expiry skew (mainly for tests).
    pub fn with_skew(mut self, skew: ChronoDuration) -> Self {
        self.skew = skew;
        self
    }

    /// Resolve a session for `account` in `region`.
    ///
    /// MFA-gated accounts fail with [`CredentialError::MfaRequired`] before
    /// any exchange is attempted when the context carries no code. A fresh
    /// cache entry is reused; otherwise one exchange runs per key at a time
    /// and concurrent callers wait on its result.
    pub async fn resolve(
        &self,
        account: &AccountConfig,
        region: &str,
        ctx: &InvocationContext,
    ) -> Result<Session, CredentialError> {
        if account.source.requires_mfa() && ctx.mfa_code.is_none() {
            return Err(CredentialError::MfaRequired(account.name.clone()));
        }

        let slot = self.slot(&SessionKey {
            account: account.name.clone(),
            region: region.to_string(),
        });

        // Per-key lock: holders of the same key serialize, unrelated keys
        // proceed independently. Waiters observe the holder's fresh entry.
        let mut guard = tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => return Err(CredentialError::Cancelled),
            guard = slot.lock() => guard,
        };

        if let Some(session) = guard.as_ref() {
            if session.is_fresh(self.skew) {
                return Ok(session.clone());
            }
        }

        let session = self
            .exchange
            .exchange(account, region, ctx.mfa_code.as_deref())
            .await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Drop any cached session for (account, region).
    ///
    /// The next resolution performs a fresh exchange.
    pub fn invalidate(&self, account: &str, region: &str) {
        self.slots.lock().remove(&SessionKey {
            account: account.to_string(),
            region: region.to_string(),
        });
    }

    fn slot(&self, key: &SessionKey) -> Slot {
        let mut slots = self.slots.lock();
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }
}
