//! The credential exchange boundary: trading an account reference for
//! time-bounded token material.

use std::error::Error as StdError;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::provider::ProvideCredentials;
use chrono::{DateTime, Utc};

use super::{CredentialError, Session};
use crate::config::{AccountConfig, CredentialSource, Secret};

/// Default lifetime requested for assumed-role sessions.
const ASSUME_ROLE_DURATION_SECONDS: i32 = 3600;

/// Exchanges an account reference for a live [`Session`].
///
/// Implementations talk to the identity provider (role-assumption service,
/// SSO token endpoint, MFA challenge endpoint) and treat its responses as
/// opaque token material with an expiry.
#[async_trait]
pub trait CredentialExchange: Send + Sync {
    /// Perform one exchange for `account` in `region`.
    ///
    /// `mfa_code` is present when the resolver verified the account requires
    /// one; implementations forward it to the challenge endpoint.
    async fn exchange(
        &self,
        account: &AccountConfig,
        region: &str,
        mfa_code: Option<&str>,
    ) -> Result<Session, CredentialError>;
}

/// Production exchange backed by the AWS SDK.
///
/// Resolution order follows the account's credential source: static access
/// keys need no network call, role assumption goes through STS, SSO profiles
/// and the ambient chain go through the shared config loader.
#[derive(Default)]
pub struct AwsExchange;

impl AwsExchange {
    /// Create the production exchange.
    pub fn new() -> Self {
        Self
    }

    async fn assume_role(
        &self,
        account: &AccountConfig,
        region: &str,
        role_arn: &str,
        session_name: &str,
        external_id: Option<&str>,
        mfa_serial: Option<&str>,
        mfa_code: Option<&str>,
    ) -> Result<Session, CredentialError> {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        let sts = aws_sdk_sts::Client::new(&config);

        let mut request = sts
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(session_name)
            .duration_seconds(ASSUME_ROLE_DURATION_SECONDS);
        if let Some(external_id) = external_id {
            request = request.external_id(external_id);
        }
        if let Some(serial) = mfa_serial {
            let code = mfa_code.ok_or_else(|| CredentialError::MfaRequired(account.name.clone()))?;
            request = request.serial_number(serial).token_code(code);
        }

        let output = request.send().await.map_err(|err| {
            let message = describe_sdk_error(&err);
            if mfa_serial.is_some() && looks_like_mfa_rejection(&message) {
                CredentialError::MfaRejected(message)
            } else {
                CredentialError::Exchange(message)
            }
        })?;

        let credentials = output.credentials().ok_or_else(|| {
            CredentialError::Exchange("assume-role response carried no credentials".to_string())
        })?;

        let expiration = credentials.expiration();
        let expires_at = DateTime::<Utc>::from_timestamp(
            expiration.secs(),
            expiration.subsec_nanos(),
        )
        .ok_or_else(|| {
            CredentialError::Exchange("assume-role expiry outside representable range".to_string())
        })?;

        Ok(Session::new(
            credentials.access_key_id(),
            Secret::new(credentials.secret_access_key()),
            Some(Secret::new(credentials.session_token())),
            region,
            Some(expires_at),
        ))
    }

    async fn from_chain(
        &self,
        region: &str,
        profile: Option<&str>,
    ) -> Result<Session, CredentialError> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }
        let config = loader.load().await;

        let provider = config.credentials_provider().ok_or_else(|| {
            CredentialError::Exchange("no credentials available in the default chain".to_string())
        })?;
        let credentials = provider
            .provide_credentials()
            .await
            .map_err(|err| CredentialError::Exchange(err.to_string()))?;

        let expires_at = credentials.expiry().map(DateTime::<Utc>::from);
        Ok(Session::new(
            credentials.access_key_id(),
            Secret::new(credentials.secret_access_key()),
            credentials.session_token().map(Secret::new),
            region,
            expires_at,
        ))
    }
}

#[async_trait]
impl CredentialExchange for AwsExchange {
    async fn exchange(
        &self,
        account: &AccountConfig,
        region: &str,
        mfa_code: Option<&str>,
    ) -> Result<Session, CredentialError> {
        match &account.source {
            CredentialSource::AccessKey {
                access_key_id,
                secret_access_key,
                session_token,
            } => Ok(Session::new(
                access_key_id.clone(),
                secret_access_key.clone(),
                session_token.clone(),
                region,
                None,
            )),
            CredentialSource::AssumeRole {
                role_arn,
                session_name,
                external_id,
                mfa_serial,
            } => {
                self.assume_role(
                    account,
                    region,
                    role_arn,
                    session_name,
                    external_id.as_deref(),
                    mfa_serial.as_deref(),
                    mfa_code,
                )
                .await
            }
            CredentialSource::Sso { profile } => self.from_chain(region, Some(profile)).await,
            CredentialSource::Ambient => self.from_chain(region, None).await,
        }
    }
}

/// Walk an SDK error chain into one readable message, skipping generic
/// wrapper layers.
fn describe_sdk_error(err: &dyn StdError) -> String {
    let mut messages = Vec::new();
    let mut current: Option<&dyn StdError> = Some(err);
    while let Some(err) = current {
        let msg = err.to_string();
        if !msg.is_empty()
            && !msg.starts_with("dispatch failure")
            && !msg.starts_with("connector error")
            && !msg.starts_with("unhandled error")
            && !messages.contains(&msg)
        {
            messages.push(msg);
        }
        current = err.source();
    }
    if messages.is_empty() {
        "unknown credential exchange error".to_string()
    } else {
        messages.join(": ")
    }
}

/// Heuristic for MFA rejection in STS error text.
fn looks_like_mfa_rejection(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("multifactorauthentication")
        || lower.contains("mfa")
        || lower.contains("tokencode")
        || lower.contains("token code")
}
