//! Owner/visibility access control for sessions and learnings.
//!
//! The model is deliberately small: the orchestrator (no agent id) sees
//! everything, owners see their own rows, orchestrator-owned rows are public
//! by default, and anything else is gated on `shared`/`public` visibility.

use crate::types::Visibility;

/// Decide whether `caller` may read an entity owned by `owner` with the given
/// visibility. `None` is the orchestrator on either side.
pub fn can_access(caller: Option<i64>, owner: Option<i64>, visibility: Visibility) -> bool {
    match (caller, owner) {
        // Orchestrator sees all.
        (None, _) => true,
        // Owner sees own.
        (Some(c), Some(o)) if c == o => true,
        // Orchestrator-owned entities are public by default.
        (Some(_), None) => true,
        // Cross-agent access requires shared or public visibility.
        _ => matches!(visibility, Visibility::Shared | Visibility::Public),
    }
}

/// Project-path scoping. Applies to listing/search paths only; exact-id
/// fetches bypass it so cross-project references keep working.
///
/// A row without a project path is visible under any filter; a caller without
/// a filter sees every project.
pub fn project_scope_matches(filter: Option<&str>, row_project: Option<&str>) -> bool {
    match (filter, row_project) {
        (None, _) => true,
        (_, None) => true,
        (Some(f), Some(p)) => f == p,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_sees_all() {
        assert!(can_access(None, Some(3), Visibility::Private));
        assert!(can_access(None, None, Visibility::Private));
    }

    #[test]
    fn owner_sees_own_private() {
        assert!(can_access(Some(7), Some(7), Visibility::Private));
    }

    #[test]
    fn orchestrator_owned_is_public() {
        assert!(can_access(Some(7), None, Visibility::Private));
    }

    #[test]
    fn cross_agent_needs_shared_or_public() {
        assert!(!can_access(Some(7), Some(8), Visibility::Private));
        assert!(can_access(Some(7), Some(8), Visibility::Shared));
        assert!(can_access(Some(7), Some(8), Visibility::Public));
    }

    #[test]
    fn project_scope() {
        assert!(project_scope_matches(None, Some("/a")));
        assert!(project_scope_matches(Some("/a"), None));
        assert!(project_scope_matches(Some("/a"), Some("/a")));
        assert!(!project_scope_matches(Some("/a"), Some("/b")));
    }
}
