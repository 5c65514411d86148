//! Fixtures shared by the service tests.

use std::sync::Arc;

use fogplane_telemetry::MetricsRegistry;
use uuid::Uuid;

use super::*;
use crate::db::{ChangeRecord, Fog, MemoryStore, MicroserviceImage, NewFog};

/// Services over a fresh in-memory store.
pub(crate) fn services() -> Services {
    Services::new(
        Arc::new(MemoryStore::new()),
        ControlConfig::default(),
        Arc::new(MetricsRegistry::new()),
    )
}

pub(crate) async fn create_agent(services: &Services, name: &str, host: &str) -> Fog {
    services
        .agents()
        .register(NewFog {
            name: name.to_string(),
            host: host.to_string(),
            fog_type_id: 1,
        })
        .await
        .unwrap()
}

pub(crate) async fn create_app(services: &Services, name: &str) -> Application {
    services
        .applications()
        .create(ApplicationManifest::named(name), Caller::Cli)
        .await
        .unwrap()
        .application
}

pub(crate) fn images() -> Vec<MicroserviceImage> {
    vec![MicroserviceImage {
        fog_type_id: 1,
        container_image: "nginx:1.27".to_string(),
    }]
}

/// A minimal valid microservice request.
pub(crate) fn ms_request(app: &str, name: &str, fog: Option<Uuid>) -> MicroserviceRequest {
    MicroserviceRequest {
        name: Some(name.to_string()),
        application: Some(app.into()),
        iofog_uuid: fog,
        images: Some(images()),
        ..Default::default()
    }
}

pub(crate) async fn create_ms(
    services: &Services,
    app: &str,
    name: &str,
    fog: Option<Uuid>,
) -> CreatedMicroservice {
    services
        .microservices()
        .create(ms_request(app, name, fog), Caller::Cli)
        .await
        .unwrap()
}

pub(crate) async fn changes(services: &Services, fog: Uuid) -> ChangeRecord {
    services.tracker().record(fog).await.unwrap()
}
