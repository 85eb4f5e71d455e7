use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub type RoleAssignmentId = String;
pub type ScopeIdentifier = String;
pub type AccountIdentifier = String;

/// Separator between the levels of a scope identifier (`acct/org/project`).
pub const SCOPE_SEPARATOR: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopeLevel {
    Account,
    Organization,
    Project,
}

impl ScopeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeLevel::Account => "ACCOUNT",
            ScopeLevel::Organization => "ORGANIZATION",
            ScopeLevel::Project => "PROJECT",
        }
    }

    /// Level of the scope found `depth` segments below the account root.
    pub fn from_depth(depth: usize) -> Option<Self> {
        match depth {
            0 => Some(ScopeLevel::Account),
            1 => Some(ScopeLevel::Organization),
            2 => Some(ScopeLevel::Project),
            _ => None,
        }
    }
}

impl fmt::Display for ScopeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved tenancy scope with its full parent chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    identifier: ScopeIdentifier,
    level: ScopeLevel,
    parent: Option<Box<Scope>>,
}

impl Scope {
    pub fn new(identifier: impl Into<String>, level: ScopeLevel, parent: Option<Scope>) -> Self {
        Self {
            identifier: identifier.into(),
            level,
            parent: parent.map(Box::new),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn level(&self) -> ScopeLevel {
        self.level
    }

    pub fn parent(&self) -> Option<&Scope> {
        self.parent.as_deref()
    }

    /// Strict ancestors, nearest first.
    pub fn ancestors(&self) -> impl Iterator<Item = &Scope> {
        std::iter::successors(self.parent(), |scope| scope.parent())
    }

    pub fn account_identifier(&self) -> &str {
        account_of(&self.identifier)
    }

    /// Selector expression addressing this scope alone.
    pub fn path_expression(&self) -> String {
        format!("{}{}", SCOPE_SEPARATOR, self.identifier)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.level, self.identifier)
    }
}

/// Account segment of a scope identifier.
pub fn account_of(scope_identifier: &str) -> &str {
    scope_identifier
        .split(SCOPE_SEPARATOR)
        .next()
        .unwrap_or(scope_identifier)
}

/// Whether `candidate` is `ancestor` itself or lies below it.
pub fn scope_is_within(candidate: &str, ancestor: &str) -> bool {
    candidate == ancestor
        || (candidate.starts_with(ancestor)
            && candidate[ancestor.len()..].starts_with(SCOPE_SEPARATOR))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrincipalKind {
    User,
    UserGroup,
    ServiceAccount,
}

impl PrincipalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalKind::User => "USER",
            PrincipalKind::UserGroup => "USER_GROUP",
            PrincipalKind::ServiceAccount => "SERVICE_ACCOUNT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub kind: PrincipalKind,
    pub identifier: String,
}

impl Principal {
    pub fn new(kind: PrincipalKind, identifier: impl Into<String>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
        }
    }

    pub fn user(identifier: impl Into<String>) -> Self {
        Self::new(PrincipalKind::User, identifier)
    }

    pub fn user_group(identifier: impl Into<String>) -> Self {
        Self::new(PrincipalKind::UserGroup, identifier)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.identifier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(String);

impl Permission {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Permission {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource type matching any resource in a selector.
pub const ANY_RESOURCE_TYPE: &str = "*";

/// `(resource type, selector expression)`, written as `type:expression`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceSelector {
    pub resource_type: String,
    pub expression: String,
}

impl ResourceSelector {
    pub fn new(resource_type: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            expression: expression.into(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (resource_type, expression) = raw.split_once(':')?;
        if resource_type.is_empty() || expression.is_empty() {
            return None;
        }
        Some(Self::new(resource_type, expression))
    }

    /// Grant on `scope` and everything beneath it.
    pub fn scope_and_descendants(scope: &Scope) -> Self {
        Self::new(
            scope.level().as_str(),
            format!("{}{}**", scope.path_expression(), SCOPE_SEPARATOR),
        )
    }

    /// Grant on `scope` alone.
    pub fn scope_only(scope: &Scope) -> Self {
        Self::new(scope.level().as_str(), scope.path_expression())
    }
}

impl fmt::Display for ResourceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.expression)
    }
}

impl TryFrom<String> for ResourceSelector {
    type Error = String;

    fn try_from(raw: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&raw).ok_or_else(|| format!("malformed resource selector '{}'", raw))
    }
}

impl From<ResourceSelector> for String {
    fn from(selector: ResourceSelector) -> Self {
        selector.to_string()
    }
}

/// Structured selector bound to the owning resource group's scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelectorV2 {
    pub resource_type: String,
    /// `None` selects every resource of the type.
    #[serde(default)]
    pub identifiers: Option<BTreeSet<String>>,
}

impl ResourceSelectorV2 {
    pub fn expand(&self, scope_identifier: &str) -> Vec<ResourceSelector> {
        let prefix = format!(
            "{}{}{}{}",
            SCOPE_SEPARATOR, scope_identifier, SCOPE_SEPARATOR, self.resource_type
        );
        match &self.identifiers {
            None => vec![ResourceSelector::new(
                self.resource_type.clone(),
                format!("{}{}*", prefix, SCOPE_SEPARATOR),
            )],
            Some(ids) => ids
                .iter()
                .map(|id| {
                    ResourceSelector::new(
                        self.resource_type.clone(),
                        format!("{}{}{}", prefix, SCOPE_SEPARATOR, id),
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeSelector {
    pub scope_identifier: ScopeIdentifier,
    #[serde(default)]
    pub include_child_scopes: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub identifier: String,
    /// `None` for managed roles usable from every scope.
    #[serde(default)]
    pub scope: Option<ScopeIdentifier>,
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroup {
    pub identifier: String,
    #[serde(default)]
    pub scope: Option<ScopeIdentifier>,
    #[serde(default)]
    pub resource_selectors: BTreeSet<ResourceSelector>,
    #[serde(default)]
    pub resource_selectors_v2: BTreeSet<ResourceSelectorV2>,
    #[serde(default)]
    pub scope_selectors: BTreeSet<ScopeSelector>,
}

impl ResourceGroup {
    /// Union of legacy and v2 selectors. Managed groups bind their v2
    /// selectors to the scope of the assignment using them.
    pub fn effective_selectors(&self, assignment_scope: &str) -> BTreeSet<ResourceSelector> {
        let bound_scope = self.scope.as_deref().unwrap_or(assignment_scope);
        let mut selectors = self.resource_selectors.clone();
        for selector in &self.resource_selectors_v2 {
            selectors.extend(selector.expand(bound_scope));
        }
        selectors
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGroup {
    pub identifier: String,
    pub scope: ScopeIdentifier,
    #[serde(default)]
    pub users: BTreeSet<String>,
}

impl UserGroup {
    pub fn member_principals(&self) -> BTreeSet<Principal> {
        self.users.iter().map(Principal::user).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssignment {
    /// Stable store id; owns every ACL row derived from this assignment.
    pub id: RoleAssignmentId,
    pub identifier: String,
    pub scope: ScopeIdentifier,
    pub principal: Principal,
    /// Scope a USER_GROUP principal lives at when it differs from `scope`.
    #[serde(default)]
    pub principal_scope: Option<ScopeIdentifier>,
    pub role_identifier: String,
    pub resource_group_identifier: String,
    #[serde(default)]
    pub disabled: bool,
}

/// Uniqueness key of a materialized row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AclKey {
    pub principal: Principal,
    pub permission: Permission,
    pub resource_selector: ResourceSelector,
    pub role_assignment_id: RoleAssignmentId,
}

/// One materialized grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acl {
    pub permission: Permission,
    pub principal: Principal,
    pub resource_selector: ResourceSelector,
    pub role_assignment_id: RoleAssignmentId,
    pub role_assignment_scope: ScopeIdentifier,
    pub role_assignment_identifier: String,
    pub implicit: bool,
    pub enabled: bool,
}

impl Acl {
    pub fn key(&self) -> AclKey {
        AclKey {
            principal: self.principal.clone(),
            permission: self.permission.clone(),
            resource_selector: self.resource_selector.clone(),
            role_assignment_id: self.role_assignment_id.clone(),
        }
    }
}
