use crate::error::{Result, RustAclError};
use crate::types::{Scope, ScopeLevel, SCOPE_SEPARATOR};

/// Resolves scope identifiers into scopes carrying their parent chain
pub trait ScopeService: Send + Sync {
    fn build_scope(&self, identifier: &str) -> Result<Scope>;
}

/// Parses `account/organization/project` identifiers
#[derive(Debug, Default, Clone)]
pub struct HierarchicalScopeService;

impl HierarchicalScopeService {
    pub fn new() -> Self {
        Self
    }
}

impl ScopeService for HierarchicalScopeService {
    fn build_scope(&self, identifier: &str) -> Result<Scope> {
        let segments: Vec<&str> = identifier.split(SCOPE_SEPARATOR).collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(RustAclError::Lookup(format!(
                "malformed scope identifier '{}'",
                identifier
            )));
        }

        let mut scope: Option<Scope> = None;
        for depth in 0..segments.len() {
            let level = ScopeLevel::from_depth(depth).ok_or_else(|| {
                RustAclError::Lookup(format!(
                    "scope identifier '{}' is nested deeper than a project",
                    identifier
                ))
            })?;
            let path = segments[..=depth].join("/");
            scope = Some(Scope::new(path, level, scope));
        }

        scope.ok_or_else(|| RustAclError::Lookup("empty scope identifier".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_project_scope() {
        let scope = HierarchicalScopeService::new()
            .build_scope("acct1/org1/proj1")
            .unwrap();

        assert_eq!(scope.level(), ScopeLevel::Project);
        let parent = scope.parent().unwrap();
        assert_eq!(parent.identifier(), "acct1/org1");
        assert_eq!(parent.level(), ScopeLevel::Organization);
        assert_eq!(parent.parent().unwrap().level(), ScopeLevel::Account);
        assert!(parent.parent().unwrap().parent().is_none());
    }

    #[test]
    fn test_rejects_malformed_identifiers() {
        let service = HierarchicalScopeService::new();
        assert!(service.build_scope("").is_err());
        assert!(service.build_scope("acct1//proj").is_err());
        assert!(service.build_scope("a/b/c/d").is_err());
    }
}
