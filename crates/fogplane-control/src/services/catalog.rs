//! Registries and catalog items.

use serde_json::json;

use crate::db::{CatalogItem, NewCatalogItem, NewRegistry, Registry};
use crate::error::{ControlError, ControlResult};

use super::change_tracking::ChangeEvent;
use super::{Caller, Deferred, Services};

#[derive(Clone)]
pub struct CatalogService {
    ctx: Services,
}

impl CatalogService {
    pub fn new(ctx: Services) -> Self {
        Self { ctx }
    }

    /// Add a registry. Every agent re-fetches its registry list.
    pub async fn add_registry(&self, registry: NewRegistry) -> ControlResult<Registry> {
        let result = async {
            if registry.url.trim().is_empty() {
                return Err(ControlError::validation("registry url is required"));
            }
            let mut tx = self.ctx.store().begin().await?;
            let created = tx.insert_registry(&registry).await?;
            let tracker = self.ctx.tracker();
            for fog in tx.list_fogs().await? {
                tracker
                    .update(&mut *tx, Some(fog.uuid), ChangeEvent::Registries)
                    .await?;
            }
            tx.commit().await?;

            let mut deferred = Deferred::default();
            deferred.audit("created", "registry", created.id, json!({"url": created.url}));
            self.ctx.finish(deferred).await;
            Ok(created)
        }
        .await;
        self.ctx.observe("add_registry", &result);
        result
    }

    pub async fn add_catalog_item(&self, item: NewCatalogItem) -> ControlResult<CatalogItem> {
        let result = async {
            if item.name.trim().is_empty() {
                return Err(ControlError::validation("catalog item name is required"));
            }
            if item.images.is_empty() {
                return Err(ControlError::validation(format!(
                    "catalog item {} requires at least one image",
                    item.name
                )));
            }
            let registry_id = item
                .registry_id
                .unwrap_or(self.ctx.config().default_registry_id);

            let mut tx = self.ctx.store().begin().await?;
            if tx.find_registry(registry_id).await?.is_none() {
                return Err(ControlError::not_found(format!(
                    "registry {registry_id} not found"
                )));
            }
            let created = tx.insert_catalog_item(&item, registry_id).await?;
            tx.commit().await?;

            let mut deferred = Deferred::default();
            deferred.audit(
                "created",
                "catalog_item",
                created.id,
                json!({"name": created.name, "category": created.category}),
            );
            self.ctx.finish(deferred).await;
            Ok(created)
        }
        .await;
        self.ctx.observe("add_catalog_item", &result);
        result
    }

    /// System items are hidden from API callers.
    pub async fn get_catalog_item(&self, id: i64, caller: Caller) -> ControlResult<CatalogItem> {
        let mut tx = self.ctx.store().begin().await?;
        match tx.find_catalog_item(id).await? {
            Some(item) if caller.is_privileged() || !item.is_system() => Ok(item),
            _ => Err(ControlError::not_found(format!(
                "catalog item {id} not found"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ChangeFlag, SYSTEM_CATEGORY};
    use crate::services::testing::*;

    fn item(name: &str, category: &str) -> NewCatalogItem {
        NewCatalogItem {
            name: name.to_string(),
            category: category.to_string(),
            registry_id: None,
            images: images(),
        }
    }

    #[tokio::test]
    async fn items_default_to_the_configured_registry() {
        let services = services();
        let created = services
            .catalog()
            .add_catalog_item(item("web", "USER"))
            .await
            .unwrap();
        assert_eq!(created.registry_id, services.config().default_registry_id);

        let err = services
            .catalog()
            .add_catalog_item(item("web", "USER"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::DuplicateProperty(_)));
    }

    #[tokio::test]
    async fn unknown_registry_is_not_found() {
        let services = services();
        let mut missing = item("web", "USER");
        missing.registry_id = Some(999);
        let err = services.catalog().add_catalog_item(missing).await.unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));
    }

    #[tokio::test]
    async fn system_items_are_hidden_from_api_callers() {
        let services = services();
        let created = services
            .catalog()
            .add_catalog_item(item("router", SYSTEM_CATEGORY))
            .await
            .unwrap();
        assert!(services
            .catalog()
            .get_catalog_item(created.id, Caller::Api)
            .await
            .is_err());
        assert!(services
            .catalog()
            .get_catalog_item(created.id, Caller::Cli)
            .await
            .unwrap()
            .is_system());
    }

    #[tokio::test]
    async fn new_registry_advances_every_agent() {
        let services = services();
        let f = create_agent(&services, "agent-f", "10.0.0.1").await;
        let g = create_agent(&services, "agent-g", "10.0.0.2").await;
        services
            .catalog()
            .add_registry(NewRegistry {
                url: "registry.example.com".into(),
                is_public: false,
            })
            .await
            .unwrap();
        for fog in [f.uuid, g.uuid] {
            assert_eq!(changes(&services, fog).await.revision(ChangeFlag::Registries), 1);
        }
    }
}
