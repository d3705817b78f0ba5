//! Scope resolver (C2). A pure function from (actor, requested scope) to a
//! verdict; deterministic for a given actor principal so reconnects with the
//! same credentials always see the same effective scope.

use dgsync_types::{
    ActorId,
    ScopeMap,
    ScopeVerdict,
};

/// Implementations must be deterministic: the same `(actor_id, requested)`
/// pair must always produce the same verdict, and must not perform any I/O
/// whose result could change between a push and the pull that immediately
/// follows it.
pub trait ScopeResolver: Send + Sync {
    fn resolve(&self, actor_id: &ActorId, requested: &ScopeMap) -> ScopeVerdict;
}

/// A resolver grounded on a single invariant rule that covers the vast
/// majority of row-level multi-tenant sync deployments: every row is scoped
/// by an actor-owned column (commonly `user_id`) plus zero or more
/// actor-chosen dimensions (commonly `project_id`, `workspace_id`). The
/// actor-owned column is always pinned to the actor's own id, regardless of
/// what was requested; other columns are honored as requested.
pub struct OwnerScopedResolver {
    owner_column: String,
}

impl OwnerScopedResolver {
    pub fn new(owner_column: impl Into<String>) -> Self {
        Self {
            owner_column: owner_column.into(),
        }
    }
}

impl ScopeResolver for OwnerScopedResolver {
    fn resolve(&self, actor_id: &ActorId, requested: &ScopeMap) -> ScopeVerdict {
        let requested_owner = requested.get(&self.owner_column);
        let owner_value = serde_json::Value::String(actor_id.clone());

        match requested_owner {
            // No claim at all about ownership: nothing in this scope
            // belongs to this actor.
            None if requested.is_empty() => ScopeVerdict::Revoked,
            None => {
                let mut effective = requested.clone();
                effective.insert(self.owner_column.clone(), owner_value);
                ScopeVerdict::Narrowed { effective }
            },
            Some(v) if *v == owner_value => ScopeVerdict::Active {
                effective: requested.clone(),
            },
            // Requested a different owner than the connected actor: no
            // overlap is possible, this subscription must be dropped.
            Some(_) => ScopeVerdict::Revoked,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn scope(pairs: &[(&str, &str)]) -> ScopeMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn honors_request_when_owner_matches_actor() {
        let resolver = OwnerScopedResolver::new("user_id");
        let requested = scope(&[("user_id", "u1"), ("project_id", "p1")]);
        let verdict = resolver.resolve(&"u1".to_string(), &requested);
        assert_eq!(
            verdict,
            ScopeVerdict::Active {
                effective: requested
            }
        );
    }

    #[test]
    fn revokes_when_owner_mismatches_actor() {
        let resolver = OwnerScopedResolver::new("user_id");
        let requested = scope(&[("user_id", "u2")]);
        let verdict = resolver.resolve(&"u1".to_string(), &requested);
        assert_eq!(verdict, ScopeVerdict::Revoked);
    }

    #[test]
    fn narrows_by_pinning_owner_when_unspecified() {
        let resolver = OwnerScopedResolver::new("user_id");
        let requested = scope(&[("project_id", "p1")]);
        let verdict = resolver.resolve(&"u1".to_string(), &requested);
        let effective = verdict.effective().unwrap();
        assert_eq!(effective.get("user_id"), Some(&json!("u1")));
        assert_eq!(effective.get("project_id"), Some(&json!("p1")));
    }

    #[test]
    fn deterministic_across_repeated_calls() {
        let resolver = OwnerScopedResolver::new("user_id");
        let requested = scope(&[("user_id", "u1"), ("project_id", "p1")]);
        let v1 = resolver.resolve(&"u1".to_string(), &requested);
        let v2 = resolver.resolve(&"u1".to_string(), &requested);
        assert_eq!(v1, v2);
    }
}
