//! Startup configuration: accounts, regions, cost policy, limiter ceilings.
//!
//! Everything in this module is built once at startup and frozen. The
//! dispatcher and its components only ever read it, so no locking is needed
//! on the hot path.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while assembling the startup configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A region identifier does not look like a real region id.
    #[error("invalid region identifier: {0}")]
    InvalidRegion(String),

    /// The default region is not a member of the enabled set.
    #[error("default region '{0}' is not in the enabled region set")]
    DefaultRegionNotEnabled(String),

    /// The default account name does not match any configured account.
    #[error("default account '{0}' is not configured")]
    UnknownDefaultAccount(String),

    /// Two accounts were registered under the same name.
    #[error("account '{0}' is configured twice")]
    DuplicateAccount(String),

    /// A limiter setting is out of range.
    #[error("invalid limiter settings: {0}")]
    InvalidLimiterSettings(String),
}

/// Secret string wrapper that never prints its contents.
///
/// Key material flows through configuration and sessions; wrapping it keeps
/// `Debug` output and logs free of credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the underlying value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Where an account's credentials come from.
///
/// Exactly one source kind per account; the enum carries the invariant.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// Static access key pair, optionally with a pre-issued session token.
    AccessKey {
        access_key_id: String,
        secret_access_key: Secret,
        session_token: Option<Secret>,
    },

    /// Assume an IAM role via STS.
    AssumeRole {
        role_arn: String,
        session_name: String,
        external_id: Option<String>,
        /// MFA device serial; when set, resolution requires a one-time code.
        mfa_serial: Option<String>,
    },

    /// SSO-configured profile from the shared AWS config.
    Sso { profile: String },

    /// Ambient default credential chain (environment, instance metadata, ...).
    Ambient,
}

impl CredentialSource {
    /// Whether resolving this source requires an MFA code in the call context.
    pub fn requires_mfa(&self) -> bool {
        matches!(
            self,
            CredentialSource::AssumeRole {
                mfa_serial: Some(_),
                ..
            }
        )
    }
}

/// Cost policy for an account: the advisory gate, not billing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostPolicy {
    /// Estimated-cost threshold (USD) above which an approval token is
    /// required. `None` disables the gate.
    pub approval_threshold_usd: Option<f64>,

    /// Cost-allocation tag keys attached to invocation payloads downstream.
    pub allocation_tags: Vec<String>,
}

impl CostPolicy {
    /// Policy requiring approval above the given USD threshold.
    pub fn with_threshold(threshold_usd: f64) -> Self {
        Self {
            approval_threshold_usd: Some(threshold_usd),
            allocation_tags: Vec::new(),
        }
    }
}

/// Rate/concurrency ceilings for limiter buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Sustained requests per second per bucket.
    pub requests_per_second: f64,

    /// Hard ceiling on concurrently outstanding calls per bucket.
    pub max_concurrent: usize,

    /// How long an `acquire` may queue before failing with `RateLimited`.
    pub acquire_timeout_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            max_concurrent: 8,
            acquire_timeout_ms: 10_000,
        }
    }
}

impl RateLimitSettings {
    /// The acquire timeout as a `Duration`.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.requests_per_second <= 0.0 || !self.requests_per_second.is_finite() {
            return Err(ConfigError::InvalidLimiterSettings(format!(
                "requests_per_second must be positive, got {}",
                self.requests_per_second
            )));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::InvalidLimiterSettings(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One logical account the dispatcher can act as.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Logical name ("dev", "prod-readonly", ...). Unique in the directory.
    pub name: String,

    /// Credential source for this account.
    pub source: CredentialSource,

    /// Region used when an invocation carries no override.
    pub default_region: Option<String>,

    /// Account-level cost policy; falls back to the directory default.
    pub cost_policy: Option<CostPolicy>,

    /// Account-level limiter ceilings; falls back to the directory default.
    pub rate_limits: Option<RateLimitSettings>,
}

impl AccountConfig {
    /// Create an account with the given credential source.
    pub fn new(name: impl Into<String>, source: CredentialSource) -> Self {
        Self {
            name: name.into(),
            source,
            default_region: None,
            cost_policy: None,
            rate_limits: None,
        }
    }

    /// Set the region used when invocations carry no override.
    pub fn with_default_region(mut self, region: impl Into<String>) -> Self {
        self.default_region = Some(region.into());
        self
    }

    /// Override the directory-wide cost policy for this account.
    pub fn with_cost_policy(mut self, policy: CostPolicy) -> Self {
        self.cost_policy = Some(policy);
        self
    }

    /// Override the directory-wide limiter ceilings for this account.
    pub fn with_rate_limits(mut self, settings: RateLimitSettings) -> Self {
        self.rate_limits = Some(settings);
        self
    }
}

/// Process-wide set of enabled regions, immutable after startup.
#[derive(Debug, Clone)]
pub struct RegionSet {
    regions: BTreeSet<String>,
    default_region: String,
}

impl RegionSet {
    /// Build a region set, validating identifier shape.
    ///
    /// The default region must be a member of the enabled set.
    pub fn new<I, S>(regions: I, default_region: impl Into<String>) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let default_region = default_region.into();
        let mut set = BTreeSet::new();
        for region in regions {
            let region = region.into();
            if !looks_like_region(&region) {
                return Err(ConfigError::InvalidRegion(region));
            }
            set.insert(region);
        }
        if !set.contains(&default_region) {
            return Err(ConfigError::DefaultRegionNotEnabled(default_region));
        }
        Ok(Self {
            regions: set,
            default_region,
        })
    }

    /// Whether the region is enabled.
    pub fn contains(&self, region: &str) -> bool {
        self.regions.contains(region)
    }

    /// The region used when nothing else specifies one.
    pub fn default_region(&self) -> &str {
        &self.default_region
    }

    /// Iterate enabled regions in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.regions.iter().map(String::as_str)
    }

    /// Number of enabled regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Shape check for region identifiers like `us-east-1` or `ap-southeast-2`.
fn looks_like_region(region: &str) -> bool {
    let segments: Vec<&str> = region.split('-').collect();
    if segments.len() < 3 {
        return false;
    }
    let last_is_number = segments
        .last()
        .map(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false);
    let rest_alpha = segments[..segments.len() - 1]
        .iter()
        .all(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_lowercase()));
    last_is_number && rest_alpha
}

/// Directory of known accounts and enabled regions.
///
/// Read-only after [`DirectoryBuilder::build`]; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Directory {
    accounts: HashMap<String, AccountConfig>,
    regions: RegionSet,
    default_account: String,
    cost_policy: CostPolicy,
    rate_limits: RateLimitSettings,
}

impl Directory {
    /// Start building a directory over the given region set.
    pub fn builder(regions: RegionSet) -> DirectoryBuilder {
        DirectoryBuilder {
            accounts: Vec::new(),
            regions,
            default_account: None,
            cost_policy: CostPolicy::default(),
            rate_limits: RateLimitSettings::default(),
        }
    }

    /// Look up an account by name.
    pub fn account(&self, name: &str) -> Option<&AccountConfig> {
        self.accounts.get(name)
    }

    /// The account used when an invocation carries no override.
    pub fn default_account(&self) -> &str {
        &self.default_account
    }

    /// The enabled region set.
    pub fn regions(&self) -> &RegionSet {
        &self.regions
    }

    /// Effective cost policy for an account (account override or default).
    pub fn cost_policy_for<'a>(&'a self, account: &'a AccountConfig) -> &'a CostPolicy {
        account.cost_policy.as_ref().unwrap_or(&self.cost_policy)
    }

    /// Effective limiter settings for an account name.
    pub fn rate_limits_for(&self, account_name: &str) -> &RateLimitSettings {
        self.accounts
            .get(account_name)
            .and_then(|a| a.rate_limits.as_ref())
            .unwrap_or(&self.rate_limits)
    }

    /// Resolve the effective region for an invocation-level override.
    ///
    /// Precedence: explicit override, account default, directory default.
    pub fn effective_region<'a>(
        &'a self,
        account: &'a AccountConfig,
        requested: Option<&'a str>,
    ) -> &'a str {
        requested
            .or(account.default_region.as_deref())
            .unwrap_or_else(|| self.regions.default_region())
    }

    /// Iterate configured accounts.
    pub fn accounts(&self) -> impl Iterator<Item = &AccountConfig> {
        self.accounts.values()
    }
}

/// Builder for [`Directory`].
pub struct DirectoryBuilder {
    accounts: Vec<AccountConfig>,
    regions: RegionSet,
    default_account: Option<String>,
    cost_policy: CostPolicy,
    rate_limits: RateLimitSettings,
}

impl DirectoryBuilder {
    /// Register an account.
    pub fn account(mut self, account: AccountConfig) -> Self {
        self.accounts.push(account);
        self
    }

    /// Name the account used when invocations carry no override.
    ///
    /// Defaults to the first registered account.
    pub fn default_account(mut self, name: impl Into<String>) -> Self {
        self.default_account = Some(name.into());
        self
    }

    /// Directory-wide cost policy (overridable per account).
    pub fn cost_policy(mut self, policy: CostPolicy) -> Self {
        self.cost_policy = policy;
        self
    }

    /// Directory-wide limiter ceilings (overridable per account).
    pub fn rate_limits(mut self, settings: RateLimitSettings) -> Self {
        self.rate_limits = settings;
        self
    }

    /// Freeze the directory.
    pub fn build(self) -> Result<Directory, ConfigError> {
        self.rate_limits.validate()?;

        let mut accounts = HashMap::new();
        let mut first_name = None;
        for account in self.accounts {
            if let Some(settings) = &account.rate_limits {
                settings.validate()?;
            }
            if first_name.is_none() {
                first_name = Some(account.name.clone());
            }
            let name = account.name.clone();
            if accounts.insert(name.clone(), account).is_some() {
                return Err(ConfigError::DuplicateAccount(name));
            }
        }

        let default_account = self
            .default_account
            .or(first_name)
            .unwrap_or_else(|| "default".to_string());
        if !accounts.contains_key(&default_account) {
            return Err(ConfigError::UnknownDefaultAccount(default_account));
        }

        Ok(Directory {
            accounts,
            regions: self.regions,
            default_account,
            cost_policy: self.cost_policy,
            rate_limits: self.rate_limits,
        })
    }
}
