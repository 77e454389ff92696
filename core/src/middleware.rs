//! # Claims & Groups Middleware Pipeline (C5)
//!
//! Reshapes the [`Identity`] a connector resolves before it reaches the
//! authorization state machine: renaming or discarding claims, and
//! filtering/renaming group memberships, each via a small ordered list of
//! regex-driven rules (spec §4.5).
//!
//! Rules execute in configured order against a working copy of the
//! identity; a `Discard` rule short-circuits the remaining chain for that
//! field the moment it matches, matching the source's "first matching
//! discard wins" semantics.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use crate::errors::MiddlewareError;
use crate::storage::entities::Identity;

/// One rule in a [`MiddlewareChain`]. Rules are evaluated in list order.
#[derive(Debug, Clone)]
pub enum ClaimRule {
    /// Drops the claim entirely if its value matches `pattern`.
    Discard { claim: String, pattern: Regex },
    /// Renames `claim` to `to` if its value matches `pattern`, leaving the
    /// value unchanged.
    Rename {
        claim: String,
        pattern: Regex,
        to: String,
    },
    /// Replaces `claim`'s value in-place by substituting `pattern` with
    /// `replacement` (regex capture groups honored).
    Substitute {
        claim: String,
        pattern: Regex,
        replacement: String,
    },
    /// Overwrites (or inserts) `claim` unconditionally with a literal value.
    Inject { claim: String, value: Value },
}

/// One rule governing group membership.
#[derive(Debug, Clone)]
pub enum GroupRule {
    /// Removes groups matching `pattern`.
    Discard { pattern: Regex },
    /// Strips `prefix` from any group that starts with it.
    StripPrefix { prefix: String },
    /// Adds `prefix` to every remaining group.
    AddPrefix { prefix: String },
    /// Replaces `pattern` with `replacement` in each group name (regex
    /// capture groups honored), mirroring the claims rename-via-substitution
    /// action (spec §4.5, scenario 6: `replace=(cats|dogs|rabbits)→birds`).
    Substitute { pattern: Regex, replacement: String },
}

/// Parsed, ready-to-run middleware configuration for one connector.
#[derive(Debug, Clone, Default)]
pub struct MiddlewareChain {
    claim_rules: Vec<ClaimRule>,
    group_rules: Vec<GroupRule>,
    sort_groups: bool,
    dedupe_groups: bool,
}

impl MiddlewareChain {
    pub fn new(claim_rules: Vec<ClaimRule>, group_rules: Vec<GroupRule>) -> Self {
        Self {
            claim_rules,
            group_rules,
            sort_groups: false,
            dedupe_groups: false,
        }
    }

    pub fn with_sorted_groups(mut self, sorted: bool) -> Self {
        self.sort_groups = sorted;
        self
    }

    pub fn with_unique_groups(mut self, unique: bool) -> Self {
        self.dedupe_groups = unique;
        self
    }

    /// Runs every rule against `identity`, returning the reshaped identity.
    pub fn process(&self, mut identity: Identity) -> Result<Identity, MiddlewareError> {
        identity.custom_claims = self.apply_claim_rules(identity.custom_claims)?;
        identity.groups = self.apply_group_rules(identity.groups)?;
        Ok(identity)
    }

    fn apply_claim_rules(
        &self,
        mut claims: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>, MiddlewareError> {
        for rule in &self.claim_rules {
            match rule {
                ClaimRule::Discard { claim, pattern } => {
                    if let Some(value) = claims.get(claim) {
                        if pattern.is_match(&value_as_str(value)) {
                            claims.remove(claim);
                        }
                    }
                }
                ClaimRule::Rename { claim, pattern, to } => {
                    if let Some(value) = claims.get(claim) {
                        if pattern.is_match(&value_as_str(value)) {
                            if let Some(v) = claims.remove(claim) {
                                claims.insert(to.clone(), v);
                            }
                        }
                    }
                }
                ClaimRule::Substitute {
                    claim,
                    pattern,
                    replacement,
                } => {
                    if let Some(Value::String(s)) = claims.get(claim) {
                        let replaced = pattern.replace_all(s, replacement.as_str()).to_string();
                        claims.insert(claim.clone(), Value::String(replaced));
                    }
                }
                ClaimRule::Inject { claim, value } => {
                    claims.insert(claim.clone(), value.clone());
                }
            }
        }
        Ok(claims)
    }

    fn apply_group_rules(&self, groups: Vec<String>) -> Result<Vec<String>, MiddlewareError> {
        let mut result = groups;
        for rule in &self.group_rules {
            result = match rule {
                GroupRule::Discard { pattern } => result
                    .into_iter()
                    .filter(|g| !pattern.is_match(g))
                    .collect(),
                GroupRule::StripPrefix { prefix } => result
                    .into_iter()
                    .map(|g| g.strip_prefix(prefix.as_str()).map(str::to_string).unwrap_or(g))
                    .collect(),
                GroupRule::AddPrefix { prefix } => {
                    result.into_iter().map(|g| format!("{prefix}{g}")).collect()
                }
                GroupRule::Substitute { pattern, replacement } => result
                    .into_iter()
                    .map(|g| pattern.replace_all(&g, replacement.as_str()).to_string())
                    .collect(),
            };
        }
        if self.dedupe_groups {
            let mut seen = std::collections::HashSet::new();
            result.retain(|g| seen.insert(g.clone()));
        }
        if self.sort_groups {
            result.sort();
        }
        Ok(result)
    }
}

fn value_as_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Minimum gRPC middleware API version this service accepts from an
/// external admin-middleware plugin (spec §4.5 "gRPC middleware variant").
pub const MINIMUM_GRPC_MIDDLEWARE_VERSION: u32 = 1;

/// Checks a remote middleware plugin's advertised version against the
/// pinned minimum, failing closed when the negotiation is incompatible.
pub fn check_grpc_middleware_version(remote_version: u32) -> Result<(), MiddlewareError> {
    if remote_version < MINIMUM_GRPC_MIDDLEWARE_VERSION {
        return Err(MiddlewareError::IncompatibleVersion {
            remote: remote_version,
            minimum: MINIMUM_GRPC_MIDDLEWARE_VERSION,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_identity() -> Identity {
        let mut custom_claims = HashMap::new();
        custom_claims.insert("department".to_string(), Value::String("eng-internal".into()));
        Identity {
            user_id: "user-1".into(),
            username: "user1".into(),
            preferred_username: "user1".into(),
            email: "user1@example.com".into(),
            email_verified: true,
            groups: vec![
                "corp/engineers".to_string(),
                "corp/admins".to_string(),
                "corp/engineers".to_string(),
            ],
            custom_claims,
            connector_data: vec![],
        }
    }

    #[test]
    fn discard_rule_removes_matching_claim() {
        let chain = MiddlewareChain::new(
            vec![ClaimRule::Discard {
                claim: "department".into(),
                pattern: Regex::new("internal").unwrap(),
            }],
            vec![],
        );
        let identity = chain.process(sample_identity()).unwrap();
        assert!(!identity.custom_claims.contains_key("department"));
    }

    #[test]
    fn strip_prefix_then_dedupe_and_sort_groups() {
        let chain = MiddlewareChain::new(
            vec![],
            vec![GroupRule::StripPrefix {
                prefix: "corp/".into(),
            }],
        )
        .with_unique_groups(true)
        .with_sorted_groups(true);

        let identity = chain.process(sample_identity()).unwrap();
        assert_eq!(identity.groups, vec!["admins", "engineers"]);
    }

    #[test]
    fn discard_group_rule_filters_matching_groups() {
        let chain = MiddlewareChain::new(
            vec![],
            vec![GroupRule::Discard {
                pattern: Regex::new("admins$").unwrap(),
            }],
        );
        let identity = chain.process(sample_identity()).unwrap();
        assert!(!identity.groups.iter().any(|g| g.ends_with("admins")));
    }

    #[test]
    fn inject_rule_overwrites_claim_unconditionally() {
        let chain = MiddlewareChain::new(
            vec![ClaimRule::Inject {
                claim: "tenant".into(),
                value: Value::String("acme".into()),
            }],
            vec![],
        );
        let identity = chain.process(sample_identity()).unwrap();
        assert_eq!(
            identity.custom_claims.get("tenant"),
            Some(&Value::String("acme".into()))
        );
    }

    #[test]
    fn groups_pipeline_matches_spec_scenario_six() {
        let chain = MiddlewareChain::new(
            vec![],
            vec![
                GroupRule::Discard {
                    pattern: Regex::new("^admin$").unwrap(),
                },
                GroupRule::StripPrefix {
                    prefix: "foobar/".into(),
                },
                GroupRule::Substitute {
                    pattern: Regex::new("(cats|dogs|rabbits)").unwrap(),
                    replacement: "birds".into(),
                },
                GroupRule::AddPrefix { prefix: "foo/".into() },
            ],
        )
        .with_sorted_groups(true)
        .with_unique_groups(true);

        let mut identity = sample_identity();
        identity.groups = vec![
            "admin".into(),
            "foobar/frobble".into(),
            "cats".into(),
            "foobar/dogs".into(),
        ];

        let identity = chain.process(identity).unwrap();
        assert_eq!(identity.groups, vec!["foo/birds", "foo/frobble"]);
    }

    #[test]
    fn grpc_middleware_version_check_fails_closed() {
        assert!(check_grpc_middleware_version(1).is_ok());
        assert!(matches!(
            check_grpc_middleware_version(0),
            Err(MiddlewareError::IncompatibleVersion { .. })
        ));
    }
}
