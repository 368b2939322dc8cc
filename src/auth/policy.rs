//! Mirror policy evaluation.
//!
//! Policies are evaluated in `priority DESC, created_at ASC` order; the
//! first one whose patterns match `(upstream_registry, namespace, provider)`
//! decides. A null pattern matches anything; otherwise `*` is a wildcard
//! and everything else matches exactly. No match means denied.

use crate::db::mirrors::MirrorPolicy;

#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub requires_approval: bool,
    pub matched_policy: Option<MirrorPolicy>,
    pub reason: String,
}

/// Glob-like match: `None` matches anything, `*` is a wildcard, the rest is
/// literal. Anchored at both ends.
pub fn pattern_matches(pattern: Option<&str>, value: &str) -> bool {
    let Some(pattern) = pattern else {
        return true;
    };
    if pattern.is_empty() {
        // Missing and null patterns are equivalent.
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut rest = value;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            let Some(after) = rest.strip_prefix(segment) else {
                return false;
            };
            rest = after;
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            let Some(pos) = rest.find(segment) else {
                return false;
            };
            rest = &rest[pos + segment.len()..];
        }
    }
    // Pattern ended with `*` (or was all wildcards).
    segments.last().is_some_and(|s| s.is_empty()) || rest.is_empty()
}

/// First-match-wins evaluation over pre-sorted policies.
pub fn evaluate(
    policies: &[MirrorPolicy],
    upstream_registry: &str,
    namespace: &str,
    provider: &str,
) -> PolicyDecision {
    for policy in policies {
        if !policy.is_active {
            continue;
        }
        if pattern_matches(policy.upstream_registry.as_deref(), upstream_registry)
            && pattern_matches(policy.namespace_pattern.as_deref(), namespace)
            && pattern_matches(policy.provider_pattern.as_deref(), provider)
        {
            let allowed = policy.policy_type == "allow";
            return PolicyDecision {
                allowed,
                requires_approval: policy.requires_approval,
                reason: if allowed {
                    format!("allowed by policy {:?}", policy.name)
                } else {
                    format!("denied by policy {:?}", policy.name)
                },
                matched_policy: Some(policy.clone()),
            };
        }
    }
    PolicyDecision {
        allowed: false,
        requires_approval: false,
        matched_policy: None,
        reason: "No matching policy found".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn policy(
        name: &str,
        policy_type: &str,
        namespace_pattern: Option<&str>,
        provider_pattern: Option<&str>,
        priority: i64,
    ) -> MirrorPolicy {
        MirrorPolicy {
            id: Uuid::new_v4(),
            organization_id: None,
            name: name.to_string(),
            description: String::new(),
            policy_type: policy_type.to_string(),
            upstream_registry: None,
            namespace_pattern: namespace_pattern.map(str::to_string),
            provider_pattern: provider_pattern.map(str::to_string),
            priority,
            is_active: true,
            requires_approval: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches(None, "anything"));
        assert!(pattern_matches(Some(""), "anything"));
        assert!(pattern_matches(Some("hashicorp"), "hashicorp"));
        assert!(!pattern_matches(Some("hashicorp"), "hashicorp2"));
        assert!(pattern_matches(Some("*"), "anything"));
        assert!(pattern_matches(Some("hashi*"), "hashicorp"));
        assert!(pattern_matches(Some("*corp"), "hashicorp"));
        assert!(pattern_matches(Some("ha*rp"), "hashicorp"));
        assert!(!pattern_matches(Some("hashi*"), "terraform"));
        assert!(!pattern_matches(Some("ha*xx"), "hashicorp"));
    }

    #[test]
    fn test_first_match_wins_by_priority() {
        let policies = vec![
            policy("deny-all-aws", "deny", None, Some("aws"), 100),
            policy("allow-hashicorp", "allow", Some("hashicorp"), None, 50),
        ];
        let denied = evaluate(&policies, "registry.terraform.io", "hashicorp", "aws");
        assert!(!denied.allowed);
        assert_eq!(denied.matched_policy.as_ref().unwrap().name, "deny-all-aws");

        let allowed = evaluate(&policies, "registry.terraform.io", "hashicorp", "google");
        assert!(allowed.allowed);
        assert_eq!(
            allowed.matched_policy.as_ref().unwrap().name,
            "allow-hashicorp"
        );
    }

    #[test]
    fn test_no_match_is_denied() {
        let policies = vec![policy("allow-hashicorp", "allow", Some("hashicorp"), None, 0)];
        let decision = evaluate(&policies, "registry.terraform.io", "contrib", "aws");
        assert!(!decision.allowed);
        assert!(decision.matched_policy.is_none());
        assert_eq!(decision.reason, "No matching policy found");
    }

    #[test]
    fn test_requires_approval_propagates() {
        let mut p = policy("gated", "allow", None, None, 0);
        p.requires_approval = true;
        let decision = evaluate(&[p], "any", "ns", "prov");
        assert!(decision.allowed);
        assert!(decision.requires_approval);
    }

    #[test]
    fn test_inactive_policies_skipped() {
        let mut p = policy("disabled-deny", "deny", None, None, 100);
        p.is_active = false;
        let fallback = policy("allow", "allow", None, None, 0);
        let decision = evaluate(&[p, fallback], "any", "ns", "prov");
        assert!(decision.allowed);
    }
}
