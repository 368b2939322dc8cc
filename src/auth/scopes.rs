//! Flat scope strings and their implication rules.
//!
//! `X:write` implies `X:read`; `admin` implies everything.

/// Does a single held scope satisfy the required one?
pub fn implies(held: &str, required: &str) -> bool {
    if held == required || held == "admin" {
        return true;
    }
    match (held.strip_suffix(":write"), required.strip_suffix(":read")) {
        (Some(held_base), Some(required_base)) => held_base == required_base,
        _ => false,
    }
}

/// Does the effective scope set satisfy the required scope?
pub fn has_scope(scopes: &[String], required: &str) -> bool {
    scopes.iter().any(|held| implies(held, required))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scopes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exact_match() {
        assert!(has_scope(&scopes(&["modules:read"]), "modules:read"));
        assert!(!has_scope(&scopes(&["modules:read"]), "providers:read"));
    }

    #[test]
    fn test_write_implies_read() {
        assert!(has_scope(&scopes(&["modules:write"]), "modules:read"));
        assert!(!has_scope(&scopes(&["modules:read"]), "modules:write"));
        assert!(!has_scope(&scopes(&["modules:write"]), "providers:read"));
    }

    #[test]
    fn test_admin_implies_all() {
        assert!(has_scope(&scopes(&["admin"]), "modules:write"));
        assert!(has_scope(&scopes(&["admin"]), "mirrors:manage"));
        assert!(has_scope(&scopes(&["admin"]), "admin"));
    }

    #[test]
    fn test_manage_does_not_imply_write() {
        assert!(!has_scope(&scopes(&["mirrors:manage"]), "mirrors:write"));
        assert!(!has_scope(&scopes(&["mirrors:manage"]), "mirrors:read"));
    }
}
