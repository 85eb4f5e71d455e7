//! Inbound change events and the entities they carry.

use crate::error::{Result, RustAclError};
use crate::types::{account_of, ResourceGroup, Role, RoleAssignment, UserGroup};

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

pub const OP_TYPE_HEADER: &str = "opType";
pub const UPDATED_FIELDS_HEADER: &str = "updatedFields";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityType {
    RoleAssignment,
    Role,
    ResourceGroup,
    UserGroup,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::RoleAssignment,
        EntityType::Role,
        EntityType::ResourceGroup,
        EntityType::UserGroup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::RoleAssignment => "role_assignment",
            EntityType::Role => "role",
            EntityType::ResourceGroup => "resource_group",
            EntityType::UserGroup => "user_group",
        }
    }

    /// Deserialize a JSON payload into the entity of this type
    pub fn decode(&self, payload: &[u8]) -> Result<ChangeEntity> {
        Ok(match self {
            EntityType::RoleAssignment => ChangeEntity::RoleAssignment(serde_json::from_slice(payload)?),
            EntityType::Role => ChangeEntity::Role(serde_json::from_slice(payload)?),
            EntityType::ResourceGroup => ChangeEntity::ResourceGroup(serde_json::from_slice(payload)?),
            EntityType::UserGroup => ChangeEntity::UserGroup(serde_json::from_slice(payload)?),
        })
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEntity {
    RoleAssignment(RoleAssignment),
    Role(Role),
    ResourceGroup(ResourceGroup),
    UserGroup(UserGroup),
}

impl ChangeEntity {
    pub fn entity_type(&self) -> EntityType {
        match self {
            ChangeEntity::RoleAssignment(_) => EntityType::RoleAssignment,
            ChangeEntity::Role(_) => EntityType::Role,
            ChangeEntity::ResourceGroup(_) => EntityType::ResourceGroup,
            ChangeEntity::UserGroup(_) => EntityType::UserGroup,
        }
    }

    /// Owning account; managed entities have none
    pub fn account_identifier(&self) -> Option<&str> {
        let scope = match self {
            ChangeEntity::RoleAssignment(assignment) => Some(assignment.scope.as_str()),
            ChangeEntity::Role(role) => role.scope.as_deref(),
            ChangeEntity::ResourceGroup(group) => group.scope.as_deref(),
            ChangeEntity::UserGroup(group) => Some(group.scope.as_str()),
        };
        scope.map(account_of)
    }
}

/// Fields an update touched, when the source reports them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatedFields {
    Unknown,
    Known(BTreeSet<String>),
}

impl UpdatedFields {
    /// Whether any of `fields`, or a nested path below one, was updated.
    /// Unknown updates touch everything.
    pub fn touches_any(&self, fields: &[&str]) -> bool {
        match self {
            UpdatedFields::Unknown => true,
            UpdatedFields::Known(updated) => updated.iter().any(|path| {
                fields.iter().any(|field| {
                    path == field
                        || (path.starts_with(field) && path[field.len()..].starts_with('.'))
                })
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    Create,
    Update(UpdatedFields),
    Delete,
}

impl ChangeOp {
    pub fn name(&self) -> &'static str {
        match self {
            ChangeOp::Create => "create",
            ChangeOp::Update(_) => "update",
            ChangeOp::Delete => "delete",
        }
    }
}

/// One record of the change stream
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub source_topic: String,
    pub partition: u32,
    pub offset: u64,
    pub timestamp: DateTime<Utc>,
    pub headers: HashMap<String, String>,
}

impl ChangeEvent {
    /// Collection the topic was captured from: its last `.` segment
    pub fn collection(&self) -> &str {
        self.source_topic
            .rsplit('.')
            .next()
            .unwrap_or(&self.source_topic)
    }

    /// Entity id from the key: `{"id": ..}` / `{"_id": ..}`, a JSON string,
    /// or raw UTF-8.
    pub fn decode_id(&self) -> Result<String> {
        let key = self
            .key
            .as_deref()
            .ok_or_else(|| RustAclError::InvalidEvent(format!("{} has no key", self)))?;

        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(key) {
            let id = match &value {
                serde_json::Value::String(id) => Some(id.clone()),
                serde_json::Value::Object(fields) => fields
                    .get("id")
                    .or_else(|| fields.get("_id"))
                    .and_then(|id| match id {
                        serde_json::Value::String(id) => Some(id.clone()),
                        serde_json::Value::Object(inner) => inner
                            .get("$oid")
                            .and_then(|oid| oid.as_str())
                            .map(str::to_string),
                        serde_json::Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    }),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            };
            return id.filter(|id| !id.is_empty()).ok_or_else(|| {
                RustAclError::InvalidEvent(format!("{} key carries no id", self))
            });
        }

        let raw = std::str::from_utf8(key)
            .map_err(|e| RustAclError::InvalidEvent(format!("{} key is not UTF-8: {}", self, e)))?;
        if raw.is_empty() {
            return Err(RustAclError::InvalidEvent(format!("{} key is empty", self)));
        }
        Ok(raw.to_string())
    }

    pub fn decode_op(&self) -> Result<ChangeOp> {
        let op = self.headers.get(OP_TYPE_HEADER).ok_or_else(|| {
            RustAclError::InvalidEvent(format!("{} is missing the {} header", self, OP_TYPE_HEADER))
        })?;

        match op.trim().to_ascii_lowercase().as_str() {
            "c" | "create" | "insert" => Ok(ChangeOp::Create),
            "u" | "update" | "replace" => {
                let fields = match self.headers.get(UPDATED_FIELDS_HEADER) {
                    Some(raw) => UpdatedFields::Known(
                        raw.split(',')
                            .map(str::trim)
                            .filter(|field| !field.is_empty())
                            .map(str::to_string)
                            .collect(),
                    ),
                    None => UpdatedFields::Unknown,
                };
                Ok(ChangeOp::Update(fields))
            }
            "d" | "delete" => Ok(ChangeOp::Delete),
            other => Err(RustAclError::InvalidEvent(format!(
                "{} has unsupported operation '{}'",
                self, other
            ))),
        }
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.source_topic, self.partition, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(key: &[u8], headers: &[(&str, &str)]) -> ChangeEvent {
        ChangeEvent {
            key: Some(key.to_vec()),
            value: None,
            source_topic: "cdc.accesscontrol.roles".to_string(),
            partition: 0,
            offset: 7,
            timestamp: Utc::now(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_collection_from_topic() {
        assert_eq!(event(b"x", &[]).collection(), "roles");
    }

    #[test]
    fn test_decode_id_shapes() {
        assert_eq!(event(br#"{"id":"r1"}"#, &[]).decode_id().unwrap(), "r1");
        assert_eq!(event(br#"{"_id":{"$oid":"abc"}}"#, &[]).decode_id().unwrap(), "abc");
        assert_eq!(event(br#""r2""#, &[]).decode_id().unwrap(), "r2");
        assert_eq!(event(b"plain-id", &[]).decode_id().unwrap(), "plain-id");
        assert!(event(br#"{"other":1}"#, &[]).decode_id().is_err());
        assert!(event(b"", &[]).decode_id().is_err());
    }

    #[test]
    fn test_decode_op() {
        assert_eq!(event(b"k", &[("opType", "c")]).decode_op().unwrap(), ChangeOp::Create);
        assert_eq!(event(b"k", &[("opType", "DELETE")]).decode_op().unwrap(), ChangeOp::Delete);
        assert_eq!(
            event(b"k", &[("opType", "u")]).decode_op().unwrap(),
            ChangeOp::Update(UpdatedFields::Unknown)
        );

        let op = event(b"k", &[("opType", "update"), ("updatedFields", "permissions, lastModifiedAt")])
            .decode_op()
            .unwrap();
        match op {
            ChangeOp::Update(fields) => {
                assert!(fields.touches_any(&["permissions"]));
                assert!(!fields.touches_any(&["name"]));
            }
            other => panic!("unexpected op {:?}", other),
        }

        assert!(event(b"k", &[]).decode_op().is_err());
        assert!(event(b"k", &[("opType", "truncate")]).decode_op().is_err());
    }

    #[test]
    fn test_nested_field_paths_count_as_touched() {
        let fields = UpdatedFields::Known(["principal.identifier".to_string()].into());
        assert!(fields.touches_any(&["principal"]));
        assert!(!fields.touches_any(&["principalScope"]));
    }

    #[test]
    fn test_entity_account() {
        let entity = EntityType::Role
            .decode(br#"{"identifier":"r","scope":"acct9/org1","permissions":["view"]}"#)
            .unwrap();
        assert_eq!(entity.entity_type(), EntityType::Role);
        assert_eq!(entity.account_identifier(), Some("acct9"));

        let managed = EntityType::Role.decode(br#"{"identifier":"r"}"#).unwrap();
        assert_eq!(managed.account_identifier(), None);
    }
}
