use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use crate::types::{Permission, ScopeLevel};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub generator: GeneratorConfig,
    pub fanout: FanoutConfig,
    pub user_group: UserGroupConfig,
    pub dispatcher: DispatcherConfig,
    pub routing: RoutingConfig,
    pub implicit: ImplicitPermissionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Assignments whose principal x permission x selector product exceeds
    /// this produce no rows at all
    pub max_acls_per_assignment: u64,
    /// Maximum rows handed to the store in one insert call
    pub write_batch_size: usize,
    /// Mark rows whose selector type cannot apply to the permission as disabled
    pub redundant_acl_elimination: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            max_acls_per_assignment: 2_000_000,
            write_batch_size: 50_000,
            redundant_acl_elimination: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Concurrent per-assignment tasks per consumer; 0 means twice the core count
    pub worker_threads: usize,
}

impl FanoutConfig {
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            2 * num_cpus::get().max(1)
        } else {
            self.worker_threads
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserGroupConfig {
    pub principal_delete_chunk_size: usize,
}

impl Default for UserGroupConfig {
    fn default() -> Self {
        Self {
            principal_delete_chunk_size: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub multiplier: u32,
    /// Total handling attempts per event, the first one included
    pub max_attempts: u32,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2,
            max_attempts: 10,
            max_delay_ms: 300_000, // 5 minutes
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub role_assignment_collection: String,
    pub role_collection: String,
    pub resource_group_collection: String,
    pub user_group_collection: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            role_assignment_collection: "roleassignments".to_string(),
            role_collection: "roles".to_string(),
            resource_group_collection: "resourcegroups".to_string(),
            user_group_collection: "usergroups".to_string(),
        }
    }
}

/// One row of the (scope level, include children) -> permissions table used
/// for implicit grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplicitPermissionRule {
    pub scope_level: ScopeLevel,
    pub include_child_scopes: bool,
    pub permissions: BTreeSet<Permission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImplicitPermissionConfig {
    pub rules: Vec<ImplicitPermissionRule>,
}

impl Default for ImplicitPermissionConfig {
    fn default() -> Self {
        let rule = |scope_level, include_child_scopes, permissions: &[&str]| ImplicitPermissionRule {
            scope_level,
            include_child_scopes,
            permissions: permissions.iter().map(|p| Permission::from(*p)).collect(),
        };

        Self {
            rules: vec![
                rule(ScopeLevel::Account, false, &["core_account_view"]),
                rule(
                    ScopeLevel::Account,
                    true,
                    &["core_account_view", "core_organization_view", "core_project_view"],
                ),
                rule(ScopeLevel::Organization, false, &["core_organization_view"]),
                rule(
                    ScopeLevel::Organization,
                    true,
                    &["core_organization_view", "core_project_view"],
                ),
                rule(ScopeLevel::Project, false, &["core_project_view"]),
                rule(ScopeLevel::Project, true, &["core_project_view"]),
            ],
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::error::RustAclError::Config(e.to_string()))?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.generator.validate()?;

        if self.user_group.principal_delete_chunk_size == 0 {
            return Err(crate::error::RustAclError::InvalidConfig(
                "user_group.principal_delete_chunk_size must be greater than 0".to_string(),
            ));
        }

        self.dispatcher.retry.validate()?;
        self.routing.validate()?;
        self.implicit.validate()?;

        Ok(())
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_acls_per_assignment == 0 {
            return Err(crate::error::RustAclError::InvalidConfig(
                "generator.max_acls_per_assignment must be greater than 0".to_string(),
            ));
        }

        if self.write_batch_size == 0 {
            return Err(crate::error::RustAclError::InvalidConfig(
                "generator.write_batch_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl RetryConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_attempts == 0 {
            return Err(crate::error::RustAclError::InvalidConfig(
                "dispatcher.retry.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.multiplier == 0 {
            return Err(crate::error::RustAclError::InvalidConfig(
                "dispatcher.retry.multiplier must be greater than 0".to_string(),
            ));
        }

        if self.max_delay_ms < self.initial_delay_ms {
            return Err(crate::error::RustAclError::InvalidConfig(
                "dispatcher.retry.max_delay_ms must be >= initial_delay_ms".to_string(),
            ));
        }

        Ok(())
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> crate::Result<()> {
        let names = [
            ("role_assignment_collection", &self.role_assignment_collection),
            ("role_collection", &self.role_collection),
            ("resource_group_collection", &self.resource_group_collection),
            ("user_group_collection", &self.user_group_collection),
        ];

        let mut seen = HashSet::new();
        for (field, name) in names {
            if name.trim().is_empty() {
                return Err(crate::error::RustAclError::InvalidConfig(format!(
                    "routing.{} cannot be empty",
                    field
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(crate::error::RustAclError::InvalidConfig(format!(
                    "routing.{} duplicates collection '{}'",
                    field, name
                )));
            }
        }

        Ok(())
    }
}

impl ImplicitPermissionConfig {
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if !seen.insert((rule.scope_level, rule.include_child_scopes)) {
                return Err(crate::error::RustAclError::InvalidConfig(format!(
                    "implicit.rules has more than one entry for ({}, include_child_scopes={})",
                    rule.scope_level, rule.include_child_scopes
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.generator.max_acls_per_assignment, 2_000_000);
        assert_eq!(config.generator.write_batch_size, 50_000);
        assert_eq!(config.user_group.principal_delete_chunk_size, 1_000);
        assert_eq!(config.dispatcher.retry.max_attempts, 10);
        assert_eq!(config.dispatcher.retry.initial_delay_ms, 1_000);
    }

    #[test]
    fn test_worker_threads_defaults_to_twice_cores() {
        let fanout = FanoutConfig::default();
        assert_eq!(fanout.effective_worker_threads(), 2 * num_cpus::get().max(1));

        let fixed = FanoutConfig { worker_threads: 3 };
        assert_eq!(fixed.effective_worker_threads(), 3);
    }

    #[test]
    fn test_generator_validation() {
        let mut config = Config::default();
        config.generator.write_batch_size = 0;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("write_batch_size must be greater than 0"));
    }

    #[test]
    fn test_retry_validation() {
        let mut config = Config::default();
        config.dispatcher.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        config.dispatcher.retry.max_attempts = 3;
        config.dispatcher.retry.max_delay_ms = 10;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("max_delay_ms must be >= initial_delay_ms"));
    }

    #[test]
    fn test_routing_rejects_duplicate_collections() {
        let mut config = Config::default();
        config.routing.role_collection = "roleassignments".to_string();
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("duplicates collection"));

        config.routing.role_collection = " ".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("cannot be empty"));
    }

    #[test]
    fn test_implicit_rules_must_be_unique() {
        let mut config = Config::default();
        let duplicate = config.implicit.rules[0].clone();
        config.implicit.rules.push(duplicate);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_with_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[generator]
max_acls_per_assignment = 10
redundant_acl_elimination = true

[fanout]
worker_threads = 4

[[implicit.rules]]
scope_level = "ACCOUNT"
include_child_scopes = true
permissions = ["core_account_view"]
"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.generator.max_acls_per_assignment, 10);
        assert_eq!(config.generator.write_batch_size, 50_000);
        assert!(config.generator.redundant_acl_elimination);
        assert_eq!(config.fanout.worker_threads, 4);
        assert_eq!(config.implicit.rules.len(), 1);
        assert_eq!(config.routing.user_group_collection, "usergroups");
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let config = Config::default();
        let toml_string = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert!(deserialized.validate().is_ok());
        assert_eq!(deserialized.implicit.rules, config.implicit.rules);
    }
}
