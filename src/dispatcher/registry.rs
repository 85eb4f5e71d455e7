use crate::config::Config;
use crate::consumer::{
    ChangeConsumer, ResourceGroupChangeConsumer, RoleAssignmentChangeConsumer, RoleChangeConsumer,
    UserGroupChangeConsumer,
};
use crate::error::{Result, RustAclError};
use crate::event::EntityType;
use crate::generator::AclGenerator;
use crate::store::AclStore;

use std::collections::HashMap;
use std::sync::Arc;

/// One consumer per entity type, complete by construction
#[derive(Clone)]
pub struct ConsumerRegistry {
    consumers: HashMap<EntityType, Arc<dyn ChangeConsumer>>,
}

impl ConsumerRegistry {
    pub fn builder() -> ConsumerRegistryBuilder {
        ConsumerRegistryBuilder::default()
    }

    /// Registry wired with the four standard consumers
    pub fn standard(
        generator: Arc<AclGenerator>,
        store: Arc<dyn AclStore>,
        config: &Config,
    ) -> Result<Self> {
        Self::builder()
            .register(Arc::new(RoleAssignmentChangeConsumer::new(
                generator.clone(),
                store.clone(),
            )))
            .register(Arc::new(RoleChangeConsumer::new(
                generator.clone(),
                store.clone(),
                config,
            )))
            .register(Arc::new(ResourceGroupChangeConsumer::new(
                generator.clone(),
                store.clone(),
                config,
            )))
            .register(Arc::new(UserGroupChangeConsumer::new(generator, store, config)))
            .build()
    }

    pub fn consumer(&self, entity_type: EntityType) -> Result<&Arc<dyn ChangeConsumer>> {
        self.consumers
            .get(&entity_type)
            .ok_or_else(|| RustAclError::UnregisteredEntityType(entity_type.to_string()))
    }
}

#[derive(Default)]
pub struct ConsumerRegistryBuilder {
    consumers: HashMap<EntityType, Arc<dyn ChangeConsumer>>,
}

impl ConsumerRegistryBuilder {
    /// Register a consumer under the entity type it declares. A later
    /// registration for the same type replaces the earlier one.
    pub fn register(mut self, consumer: Arc<dyn ChangeConsumer>) -> Self {
        self.consumers.insert(consumer.entity_type(), consumer);
        self
    }

    /// Fails unless every entity type has a consumer
    pub fn build(self) -> Result<ConsumerRegistry> {
        if let Some(missing) = EntityType::ALL
            .iter()
            .find(|entity_type| !self.consumers.contains_key(entity_type))
        {
            return Err(RustAclError::UnregisteredEntityType(missing.to_string()));
        }
        Ok(ConsumerRegistry {
            consumers: self.consumers,
        })
    }
}
