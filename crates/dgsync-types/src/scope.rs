use std::collections::BTreeMap;

use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

/// A predicate over row columns: column name -> the single value an actor is
/// permitted to see for that column. A row matches a scope iff every column
/// named in the scope equals the row's value for that column.
pub type ScopeMap = BTreeMap<String, JsonValue>;

/// Outcome of resolving an actor's requested scopes against what they're
/// actually permitted to see (§4.2). `Narrowed` and `Revoked` both still
/// carry (or omit) the effective scope rather than just a boolean, so
/// callers never have to re-derive it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ScopeVerdict {
    /// The full requested scope is honored.
    Active { effective: ScopeMap },
    /// A strict, non-empty subset of the requested scope is honored.
    Narrowed { effective: ScopeMap },
    /// No overlap; the subscription must be cleared locally.
    Revoked,
}

impl ScopeVerdict {
    pub fn effective(&self) -> Option<&ScopeMap> {
        match self {
            ScopeVerdict::Active { effective } | ScopeVerdict::Narrowed { effective } => {
                Some(effective)
            },
            ScopeVerdict::Revoked => None,
        }
    }

    pub fn is_revoked(&self) -> bool {
        matches!(self, ScopeVerdict::Revoked)
    }

    /// Does `row` (a flat column -> value map) match this verdict's
    /// effective scope? A revoked verdict matches nothing.
    pub fn matches(&self, row: &ScopeMap) -> bool {
        match self.effective() {
            None => false,
            Some(effective) => effective
                .iter()
                .all(|(col, want)| row.get(col) == Some(want)),
        }
    }

    /// Same as [`Self::matches`] but against a row payload as it's actually
    /// stored on the wire: a JSON object. Columns named in the scope that
    /// are absent from the object never match.
    pub fn matches_json(&self, row_json: &JsonValue) -> bool {
        let Some(effective) = self.effective() else {
            return false;
        };
        let Some(obj) = row_json.as_object() else {
            return false;
        };
        effective
            .iter()
            .all(|(col, want)| obj.get(col) == Some(want))
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
    fn active_matches_exact_row() {
        let verdict = ScopeVerdict::Active {
            effective: scope(&[("user_id", "u1"), ("project_id", "p1")]),
        };
        let row = scope(&[("user_id", "u1"), ("project_id", "p1")]);
        assert!(verdict.matches(&row));
    }

    #[test]
    fn narrowed_rejects_rows_outside_effective_scope() {
        let verdict = ScopeVerdict::Narrowed {
            effective: scope(&[("project_id", "p1")]),
        };
        let outside = scope(&[("project_id", "p2")]);
        assert!(!verdict.matches(&outside));
    }

    #[test]
    fn revoked_matches_nothing() {
        let row = scope(&[("user_id", "u1")]);
        assert!(!ScopeVerdict::Revoked.matches(&row));
    }
}
