use crate::types::Permission;

use std::collections::HashMap;

/// Maps a permission to the resource type it applies to
pub trait PermissionMetadata: Send + Sync {
    fn resource_type_of(&self, permission: &Permission) -> Option<String>;

    /// A selector type is compatible when it matches the permission's
    /// resource type, when either side is unknown, or when the selector
    /// targets every type.
    fn is_applicable(&self, permission: &Permission, selector_resource_type: &str) -> bool {
        if selector_resource_type == crate::types::ANY_RESOURCE_TYPE {
            return true;
        }
        match self.resource_type_of(permission) {
            Some(resource_type) => resource_type.eq_ignore_ascii_case(selector_resource_type),
            None => true,
        }
    }
}

/// Explicit overrides on top of the `<module>_<resource>_<action>` naming
/// convention (`core_pipeline_view` applies to `PIPELINE`).
#[derive(Debug, Default, Clone)]
pub struct StaticPermissionMetadata {
    overrides: HashMap<Permission, String>,
    use_naming_convention: bool,
}

impl StaticPermissionMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_naming_convention() -> Self {
        Self {
            overrides: HashMap::new(),
            use_naming_convention: true,
        }
    }

    pub fn with(mut self, permission: impl Into<Permission>, resource_type: impl Into<String>) -> Self {
        self.overrides.insert(permission.into(), resource_type.into());
        self
    }

    fn by_convention(permission: &Permission) -> Option<String> {
        let mut parts = permission.as_str().split('_');
        let _module = parts.next()?;
        let resource = parts.next()?;
        let _action = parts.next()?;
        if parts.next().is_some() || resource.is_empty() {
            return None;
        }
        Some(resource.to_ascii_uppercase())
    }
}

impl PermissionMetadata for StaticPermissionMetadata {
    fn resource_type_of(&self, permission: &Permission) -> Option<String> {
        if let Some(resource_type) = self.overrides.get(permission) {
            return Some(resource_type.clone());
        }
        if self.use_naming_convention {
            return Self::by_convention(permission);
        }
        None
    }
}
