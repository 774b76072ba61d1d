//! Cost and targeting policy: a pure classification step ahead of execution.
//!
//! The gate has no side effects and performs no provider calls; it only
//! classifies an invocation as allowed, approval-required, or denied. The
//! dispatcher enforces the classification.

use crate::config::Directory;
use crate::types::Invocation;

/// Why an invocation was denied outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDenial {
    /// The invocation referenced an account the directory does not know.
    UnknownAccount(String),

    /// The target region is outside the enabled region set.
    RegionDisabled(String),
}

/// Outcome of policy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    /// Execution may proceed.
    Allow,

    /// Estimated cost exceeds the account threshold and no approval token
    /// covering this invocation is present.
    RequireApproval {
        /// Estimated cost in USD.
        estimated: f64,
        /// The account's configured threshold in USD.
        threshold: f64,
    },

    /// The invocation must not execute.
    Deny(PolicyDenial),
}

impl PolicyDecision {
    /// Whether execution may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }

    /// Whether an approval token is required.
    pub fn requires_approval(&self) -> bool {
        matches!(self, PolicyDecision::RequireApproval { .. })
    }

    /// Whether the invocation was denied.
    pub fn is_denied(&self) -> bool {
        matches!(self, PolicyDecision::Deny(_))
    }
}

/// Stateless policy gate.
#[derive(Debug, Default, Clone, Copy)]
pub struct PolicyGate;

impl PolicyGate {
    /// Create the gate.
    pub fn new() -> Self {
        Self
    }

    /// Classify one invocation.
    ///
    /// Denials cover unknown accounts and disabled regions; the cost rule
    /// fires only when the handler supplied an estimate and the effective
    /// policy carries a threshold. An approval token authorizes exactly the
    /// invocation whose canonical hash it matches.
    pub fn evaluate(
        &self,
        directory: &Directory,
        invocation: &Invocation,
        estimated_cost: Option<f64>,
    ) -> PolicyDecision {
        let account_name = invocation
            .account
            .as_deref()
            .unwrap_or_else(|| directory.default_account());
        let Some(account) = directory.account(account_name) else {
            return PolicyDecision::Deny(PolicyDenial::UnknownAccount(account_name.to_string()));
        };

        let region = directory.effective_region(account, invocation.region.as_deref());
        if !directory.regions().contains(region) {
            return PolicyDecision::Deny(PolicyDenial::RegionDisabled(region.to_string()));
        }

        let threshold = directory
            .cost_policy_for(account)
            .approval_threshold_usd;
        if let (Some(estimated), Some(threshold)) = (estimated_cost, threshold) {
            if estimated > threshold {
                let approved = invocation
                    .context
                    .approval_token
                    .as_deref()
                    .map(|token| token == invocation.expected_approval_token())
                    .unwrap_or(false);
                if !approved {
                    return PolicyDecision::RequireApproval {
                        estimated,
                        threshold,
                    };
                }
            }
        }

        PolicyDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountConfig, CostPolicy, CredentialSource, Directory, RegionSet};
    use serde_json::json;

    fn directory() -> Directory {
        let regions = RegionSet::new(["us-east-1"], "us-east-1").unwrap();
        Directory::builder(regions)
            .account(
                AccountConfig::new("dev", CredentialSource::Ambient)
                    .with_cost_policy(CostPolicy::with_threshold(100.0)),
            )
            .build()
            .unwrap()
    }

    fn create_instance_invocation() -> Invocation {
        Invocation::new(
            "ec2_run_instances",
            json!({"ami_id": "ami-123", "instance_type": "m5.4xlarge"}),
        )
        .with_account("dev")
    }

    // ===== Deny Tests =====

    #[test]
    fn test_unknown_account_denied() {
        let gate = PolicyGate::new();
        let invocation =
            Invocation::new("tool", json!({})).with_account("nope");
        let decision = gate.evaluate(&directory(), &invocation, None);
        assert_eq!(
            decision,
            PolicyDecision::Deny(PolicyDenial::UnknownAccount("nope".to_string()))
        );
    }

    #[test]
    fn test_disabled_region_denied() {
        let gate = PolicyGate::new();
        let invocation = Invocation::new("tool", json!({}))
            .with_account("dev")
            .with_region("eu-west-1");
        let decision = gate.evaluate(&directory(), &invocation, None);
        assert_eq!(
            decision,
            PolicyDecision::Deny(PolicyDenial::RegionDisabled("eu-west-1".to_string()))
        );
    }

    #[test]
    fn test_default_account_used_when_no_override() {
        let gate = PolicyGate::new();
        let invocation = Invocation::new("tool", json!({}));
        assert!(gate.evaluate(&directory(), &invocation, None).is_allowed());
    }

    // ===== Cost Threshold Tests =====

    #[test]
    fn test_cost_over_threshold_requires_approval() {
        let gate = PolicyGate::new();
        let invocation = create_instance_invocation();
        let decision = gate.evaluate(&directory(), &invocation, Some(150.0));
        assert_eq!(
            decision,
            PolicyDecision::RequireApproval {
                estimated: 150.0,
                threshold: 100.0
            }
        );
    }

    #[test]
    fn test_cost_under_threshold_allowed() {
        let gate = PolicyGate::new();
        let invocation = create_instance_invocation();
        assert!(gate
            .evaluate(&directory(), &invocation, Some(50.0))
            .is_allowed());
    }

    #[test]
    fn test_cost_at_threshold_allowed() {
        let gate = PolicyGate::new();
        let invocation = create_instance_invocation();
        assert!(gate
            .evaluate(&directory(), &invocation, Some(100.0))
            .is_allowed());
    }

    #[test]
    fn test_matching_approval_token_allows() {
        let gate = PolicyGate::new();
        let mut invocation = create_instance_invocation();
        let token = invocation.expected_approval_token();
        invocation.context.approval_token = Some(token);

        assert!(gate
            .evaluate(&directory(), &invocation, Some(150.0))
            .is_allowed());
    }

    #[test]
    fn test_mismatched_approval_token_still_requires_approval() {
        let gate = PolicyGate::new();
        let mut invocation = create_instance_invocation();
        // A token minted for different arguments does not transfer.
        invocation.context.approval_token = Some(crate::types::approval_token_for(
            "ec2_run_instances",
            &json!({"ami_id": "ami-123", "instance_type": "t3.micro"}),
        ));

        let decision = gate.evaluate(&directory(), &invocation, Some(150.0));
        assert!(decision.requires_approval());
    }

    #[test]
    fn test_no_estimate_never_requires_approval() {
        let gate = PolicyGate::new();
        let invocation = create_instance_invocation();
        assert!(gate.evaluate(&directory(), &invocation, None).is_allowed());
    }

    #[test]
    fn test_no_threshold_never_requires_approval() {
        let regions = RegionSet::new(["us-east-1"], "us-east-1").unwrap();
        let directory = Directory::builder(regions)
            .account(AccountConfig::new("dev", CredentialSource::Ambient))
            .build()
            .unwrap();
        let gate = PolicyGate::new();
        let invocation = create_instance_invocation();
        assert!(gate
            .evaluate(&directory, &invocation, Some(10_000.0))
            .is_allowed());
    }

    // ===== Purity Tests =====

    #[test]
    fn test_evaluate_is_repeatable() {
        let gate = PolicyGate::new();
        let invocation = create_instance_invocation();
        let directory = directory();
        let first = gate.evaluate(&directory, &invocation, Some(150.0));
        let second = gate.evaluate(&directory, &invocation, Some(150.0));
        assert_eq!(first, second);
    }
}
