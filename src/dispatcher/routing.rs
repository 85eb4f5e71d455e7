use crate::config::RoutingConfig;
use crate::error::{Result, RustAclError};
use crate::event::EntityType;

use std::collections::HashMap;

/// Maps captured collection names onto entity types
#[derive(Debug, Clone)]
pub struct TopicRouter {
    routes: HashMap<String, EntityType>,
}

impl TopicRouter {
    pub fn from_config(config: &RoutingConfig) -> Self {
        let routes = [
            (&config.role_assignment_collection, EntityType::RoleAssignment),
            (&config.role_collection, EntityType::Role),
            (&config.resource_group_collection, EntityType::ResourceGroup),
            (&config.user_group_collection, EntityType::UserGroup),
        ]
        .into_iter()
        .map(|(collection, entity_type)| (collection.clone(), entity_type))
        .collect();
        Self { routes }
    }

    pub fn route(&self, collection: &str) -> Result<EntityType> {
        self.routes
            .get(collection)
            .copied()
            .ok_or_else(|| RustAclError::UnknownCollection(collection.to_string()))
    }
}
