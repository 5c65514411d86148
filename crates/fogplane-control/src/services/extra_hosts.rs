//! Extra-host template resolution.
//!
//! An extra host maps a name inside a container to an address. The address is
//! either a literal or a template resolved against live topology:
//!
//! - `${Apps.<application>.<microservice>.public}`: host of the agent the
//!   target's first public port is published on
//! - `${Apps.<application>.<microservice>.local}`: host of the target's agent
//! - `${Agents.<agent>}`: host of the named agent
//!
//! Bindings are stored with their resolved value and the agent/microservice
//! they point at, so they can be re-resolved when that target moves.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use fogplane_telemetry::{events, MetricsRegistry};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{
    ExtraHost, ExtraHostUpdate, MicroservicePatch, NewExtraHost, PublicMode, StoreTx,
    TemplateType,
};
use crate::error::{ControlError, ControlResult};

use super::change_tracking::{ChangeEvent, ChangeTracker};
use super::{find_application, is_system_microservice, ApplicationRef, Caller};

/// A requested extra host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraHostRequest {
    pub name: String,
    pub address: String,
}

impl ExtraHostRequest {
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
        }
    }
}

/// Which address of a target microservice an `Apps` template selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressScope {
    Public,
    Local,
}

impl AddressScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Local => "local",
        }
    }
}

/// A parsed extra-host address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostTemplate {
    Literal(String),
    Apps {
        application: String,
        microservice: String,
        scope: AddressScope,
    },
    Agents {
        agent: String,
    },
}

impl HostTemplate {
    pub fn parse(address: &str) -> ControlResult<Self> {
        let invalid = || ControlError::validation(format!("invalid extra host template {address}"));

        if !address.contains("${") {
            return Ok(Self::Literal(address.to_string()));
        }
        let inner = address
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(invalid)?;
        let segments: Vec<&str> = inner.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid());
        }

        match segments.as_slice() {
            ["Apps", application, microservice, scope] => {
                let scope = match *scope {
                    "public" => AddressScope::Public,
                    "local" => AddressScope::Local,
                    _ => return Err(invalid()),
                };
                Ok(Self::Apps {
                    application: application.to_string(),
                    microservice: microservice.to_string(),
                    scope,
                })
            }
            ["Agents", agent] => Ok(Self::Agents {
                agent: agent.to_string(),
            }),
            _ => Err(invalid()),
        }
    }

    pub fn template_type(&self) -> TemplateType {
        match self {
            Self::Literal(_) => TemplateType::Literal,
            Self::Apps { .. } => TemplateType::Apps,
            Self::Agents { .. } => TemplateType::Agents,
        }
    }
}

impl fmt::Display for HostTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.write_str(value),
            Self::Apps {
                application,
                microservice,
                scope,
            } => write!(f, "${{Apps.{}.{}.{}}}", application, microservice, scope.as_str()),
            Self::Agents { agent } => write!(f, "${{Agents.{}}}", agent),
        }
    }
}

/// A template resolved against current topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub template_type: TemplateType,
    pub value: String,
    pub target_fog_uuid: Option<Uuid>,
    pub target_microservice_uuid: Option<Uuid>,
    pub public_port: Option<i32>,
}

impl Resolution {
    fn as_update(&self) -> ExtraHostUpdate {
        ExtraHostUpdate {
            value: self.value.clone(),
            target_fog_uuid: self.target_fog_uuid,
            target_microservice_uuid: self.target_microservice_uuid,
            public_port: self.public_port,
        }
    }
}

/// Resolves extra hosts and keeps stored bindings current.
#[derive(Clone)]
pub struct ExtraHostResolver {
    tracker: ChangeTracker,
    metrics: Arc<MetricsRegistry>,
}

impl ExtraHostResolver {
    pub fn new(tracker: ChangeTracker, metrics: Arc<MetricsRegistry>) -> Self {
        Self { tracker, metrics }
    }

    /// Resolve one address. Targets `caller` may not see do not resolve.
    pub async fn resolve(
        &self,
        tx: &mut dyn StoreTx,
        address: &str,
        caller: Caller,
    ) -> ControlResult<Resolution> {
        let template = HostTemplate::parse(address)?;
        let unresolved =
            || ControlError::validation(format!("cannot resolve extra host template {address}"));

        match &template {
            HostTemplate::Literal(value) => Ok(Resolution {
                template_type: TemplateType::Literal,
                value: value.clone(),
                target_fog_uuid: None,
                target_microservice_uuid: None,
                public_port: None,
            }),
            HostTemplate::Agents { agent } => {
                let fog = tx.find_fog_by_name(agent).await?.ok_or_else(unresolved)?;
                Ok(Resolution {
                    template_type: TemplateType::Agents,
                    value: fog.host,
                    target_fog_uuid: Some(fog.uuid),
                    target_microservice_uuid: None,
                    public_port: None,
                })
            }
            HostTemplate::Apps {
                application,
                microservice,
                scope,
            } => {
                let reference = ApplicationRef::Name(application.clone());
                let app = match find_application(tx, &reference, caller).await {
                    Ok(app) => app,
                    Err(ControlError::NotFound(_)) => return Err(unresolved()),
                    Err(e) => return Err(e),
                };
                let target = tx
                    .find_microservice_by_name(app.id, microservice)
                    .await?
                    .ok_or_else(unresolved)?;
                if !caller.is_privileged() && is_system_microservice(tx, &target).await? {
                    return Err(unresolved());
                }

                let (fog_uuid, public_port) = match scope {
                    AddressScope::Local => (target.iofog_uuid.ok_or_else(unresolved)?, None),
                    AddressScope::Public => {
                        let mapping = tx
                            .list_port_mappings(target.uuid)
                            .await?
                            .into_iter()
                            .find(|p| p.public_mode == PublicMode::Public && p.public_port.is_some())
                            .ok_or_else(unresolved)?;
                        (
                            mapping.public_fog_uuid.ok_or_else(unresolved)?,
                            mapping.public_port,
                        )
                    }
                };
                let fog = tx.find_fog(fog_uuid).await?.ok_or_else(unresolved)?;
                Ok(Resolution {
                    template_type: TemplateType::Apps,
                    value: fog.host,
                    target_fog_uuid: Some(fog.uuid),
                    target_microservice_uuid: Some(target.uuid),
                    public_port,
                })
            }
        }
    }

    /// Resolve every request. The first unresolvable one fails the batch.
    pub async fn resolve_all(
        &self,
        tx: &mut dyn StoreTx,
        requests: &[ExtraHostRequest],
        caller: Caller,
    ) -> ControlResult<Vec<(ExtraHostRequest, Resolution)>> {
        let mut resolved = Vec::with_capacity(requests.len());
        for request in requests {
            if request.name.trim().is_empty() {
                return Err(ControlError::validation("extra host name is required"));
            }
            let resolution = self.resolve(tx, &request.address, caller).await?;
            resolved.push((request.clone(), resolution));
        }
        Ok(resolved)
    }

    /// Replace the bindings of `owner`. Returns whether any resolved
    /// `(name, value)` pair differs from before.
    pub async fn replace(
        &self,
        tx: &mut dyn StoreTx,
        owner: Uuid,
        resolved: &[(ExtraHostRequest, Resolution)],
    ) -> ControlResult<bool> {
        let previous: Vec<(String, String)> = tx
            .list_extra_hosts(owner)
            .await?
            .into_iter()
            .map(|h| (h.name, h.value))
            .collect();
        tx.delete_extra_hosts(owner).await?;
        self.store(tx, owner, resolved).await?;

        let current: Vec<(String, String)> = resolved
            .iter()
            .map(|(req, res)| (req.name.clone(), res.value.clone()))
            .collect();
        Ok(previous != current)
    }

    /// Insert freshly resolved bindings for `owner`.
    pub async fn store(
        &self,
        tx: &mut dyn StoreTx,
        owner: Uuid,
        resolved: &[(ExtraHostRequest, Resolution)],
    ) -> ControlResult<Vec<ExtraHost>> {
        let mut stored = Vec::with_capacity(resolved.len());
        for (request, resolution) in resolved {
            let row = NewExtraHost {
                microservice_uuid: owner,
                name: request.name.clone(),
                template: request.address.clone(),
                template_type: resolution.template_type,
                value: resolution.value.clone(),
                target_fog_uuid: resolution.target_fog_uuid,
                target_microservice_uuid: resolution.target_microservice_uuid,
                public_port: resolution.public_port,
            };
            stored.push(tx.insert_extra_host(&row).await?);
        }
        Ok(stored)
    }

    /// Re-resolve bindings pointing at microservice `target`.
    pub async fn refresh_targeting_microservice(
        &self,
        tx: &mut dyn StoreTx,
        target: Uuid,
    ) -> ControlResult<Vec<Uuid>> {
        let bindings = tx.list_extra_hosts_targeting_microservice(target).await?;
        self.refresh(tx, bindings).await
    }

    /// Rewrite `Apps` templates naming `target` by `old_name` to use
    /// `new_name`, then re-resolve every binding pointing at it.
    pub async fn rename_target(
        &self,
        tx: &mut dyn StoreTx,
        target: Uuid,
        old_name: &str,
        new_name: &str,
    ) -> ControlResult<Vec<Uuid>> {
        for binding in tx.list_extra_hosts_targeting_microservice(target).await? {
            let Ok(HostTemplate::Apps {
                application,
                microservice,
                scope,
            }) = HostTemplate::parse(&binding.template)
            else {
                continue;
            };
            if microservice != old_name {
                continue;
            }
            let renamed = HostTemplate::Apps {
                application,
                microservice: new_name.to_string(),
                scope,
            };
            tx.set_extra_host_template(binding.id, &renamed.to_string())
                .await?;
        }
        self.refresh_targeting_microservice(tx, target).await
    }

    /// Re-resolve bindings pointing at agent `fog`.
    pub async fn refresh_targeting_fog(
        &self,
        tx: &mut dyn StoreTx,
        fog: Uuid,
    ) -> ControlResult<Vec<Uuid>> {
        let bindings = tx.list_extra_hosts_targeting_fog(fog).await?;
        self.refresh(tx, bindings).await
    }

    /// Re-resolve `bindings`; owners whose value changed are flagged for
    /// rebuild and their agents advanced. Returns those owners.
    async fn refresh(
        &self,
        tx: &mut dyn StoreTx,
        bindings: Vec<ExtraHost>,
    ) -> ControlResult<Vec<Uuid>> {
        let mut changed_owners = BTreeSet::new();
        for binding in bindings {
            let resolution = match self.resolve(tx, &binding.template, Caller::Cli).await {
                Ok(resolution) => resolution,
                Err(ControlError::Store(e)) => return Err(ControlError::Store(e)),
                Err(e) => {
                    tracing::warn!(
                        event = events::BINDING_REFRESH_FAILED,
                        microservice_uuid = %binding.microservice_uuid,
                        template = %binding.template,
                        error = %e,
                        "extra host binding no longer resolves"
                    );
                    self.metrics.record_binding_refresh_failure();
                    continue;
                }
            };
            let update = resolution.as_update();
            let current = ExtraHostUpdate {
                value: binding.value.clone(),
                target_fog_uuid: binding.target_fog_uuid,
                target_microservice_uuid: binding.target_microservice_uuid,
                public_port: binding.public_port,
            };
            if update != current {
                tx.update_extra_host(binding.id, &update).await?;
                if update.value != current.value {
                    changed_owners.insert(binding.microservice_uuid);
                }
            }
        }

        let mut owners = Vec::with_capacity(changed_owners.len());
        for owner in changed_owners {
            let Some(m) = tx.find_microservice(owner).await? else {
                continue;
            };
            if m.delete {
                continue;
            }
            let patch = MicroservicePatch {
                rebuild: Some(true),
                ..Default::default()
            };
            tx.update_microservice(owner, &patch).await?;
            self.tracker
                .update(tx, m.iofog_uuid, ChangeEvent::MicroserviceCommon)
                .await?;
            owners.push(owner);
        }
        Ok(owners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ChangeFlag;
    use crate::services::testing::*;
    use crate::services::{Caller, PortRequest};

    #[test]
    fn parses_each_template_shape() {
        assert_eq!(
            HostTemplate::parse("10.0.0.5").unwrap(),
            HostTemplate::Literal("10.0.0.5".into())
        );
        assert_eq!(
            HostTemplate::parse("${Agents.agent1}").unwrap(),
            HostTemplate::Agents {
                agent: "agent1".into()
            }
        );
        assert_eq!(
            HostTemplate::parse("${Apps.app1.ms1.public}").unwrap(),
            HostTemplate::Apps {
                application: "app1".into(),
                microservice: "ms1".into(),
                scope: AddressScope::Public,
            }
        );
        for address in ["10.0.0.5", "${Agents.agent1}", "${Apps.app1.ms1.local}"] {
            assert_eq!(HostTemplate::parse(address).unwrap().to_string(), address);
        }
    }

    #[test]
    fn rejects_malformed_templates_echoing_input() {
        for bad in [
            "${Agents}",
            "${Agents.a.b}",
            "${Apps.app1.ms1}",
            "${Apps.app1.ms1.remote}",
            "${Apps.app1..local}",
            "${Things.x}",
            "${Agents.agent1",
        ] {
            match HostTemplate::parse(bad) {
                Err(ControlError::Validation(msg)) => assert!(msg.contains(bad), "{msg}"),
                other => panic!("{bad} parsed as {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn agent_template_follows_host_changes() {
        let services = services();
        let agent1 = create_agent(&services, "agent1", "10.0.0.1").await;
        let placement = create_agent(&services, "edge", "10.0.0.9").await;
        create_app(&services, "app1").await;

        let mut request = ms_request("app1", "client", Some(placement.uuid));
        request.extra_hosts = Some(vec![ExtraHostRequest::new("upstream", "${Agents.agent1}")]);
        let created = services
            .microservices()
            .create(request, Caller::Cli)
            .await
            .unwrap();

        let view = services
            .microservices()
            .get(created.uuid, Caller::Cli)
            .await
            .unwrap();
        assert_eq!(view.extra_hosts[0].value, "10.0.0.1");
        let before = changes(&services, placement.uuid).await;

        services
            .agents()
            .update_host(agent1.uuid, "10.0.0.42")
            .await
            .unwrap();

        let view = services
            .microservices()
            .get(created.uuid, Caller::Cli)
            .await
            .unwrap();
        assert_eq!(view.extra_hosts[0].value, "10.0.0.42");
        assert!(view.microservice.rebuild);
        let after = changes(&services, placement.uuid).await;
        assert!(
            after.revision(ChangeFlag::MicroserviceConfig)
                > before.revision(ChangeFlag::MicroserviceConfig)
        );
    }

    #[tokio::test]
    async fn unknown_agent_fails_creation() {
        let services = services();
        create_app(&services, "app1").await;
        let mut request = ms_request("app1", "client", None);
        request.extra_hosts = Some(vec![ExtraHostRequest::new("upstream", "${Agents.ghost}")]);
        let err = services
            .microservices()
            .create(request, Caller::Cli)
            .await
            .unwrap_err();
        match err {
            ControlError::Validation(msg) => assert!(msg.contains("${Agents.ghost}")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn public_scope_resolves_public_port_agent() {
        let services = services();
        let f = create_agent(&services, "agent-f", "10.0.0.1").await;
        create_app(&services, "app1").await;

        let mut server = ms_request("app1", "server", Some(f.uuid));
        server.ports = Some(vec![PortRequest::new(80, 8080).public()]);
        services
            .microservices()
            .create(server, Caller::Cli)
            .await
            .unwrap();

        let mut tx = services.store().begin().await.unwrap();
        let resolution = services
            .extra_hosts()
            .resolve(&mut *tx, "${Apps.app1.server.public}", Caller::Cli)
            .await
            .unwrap();
        assert_eq!(resolution.value, "10.0.0.1");
        assert_eq!(resolution.public_port, Some(6000));

        let local = services
            .extra_hosts()
            .resolve(&mut *tx, "${Apps.app1.server.local}", Caller::Cli)
            .await
            .unwrap();
        assert_eq!(local.public_port, None);
        assert_eq!(local.target_fog_uuid, Some(f.uuid));
    }

    #[tokio::test]
    async fn app_template_follows_target_moves() {
        let services = services();
        let f = create_agent(&services, "agent-f", "10.0.0.1").await;
        let g = create_agent(&services, "agent-g", "10.0.0.2").await;
        create_app(&services, "app1").await;

        let server = create_ms(&services, "app1", "server", Some(f.uuid)).await;
        let mut client = ms_request("app1", "client", Some(f.uuid));
        client.extra_hosts = Some(vec![ExtraHostRequest::new("srv", "${Apps.app1.server.local}")]);
        let client = services
            .microservices()
            .create(client, Caller::Cli)
            .await
            .unwrap();

        let moved = crate::services::MicroserviceRequest {
            iofog_uuid: Some(g.uuid),
            ..Default::default()
        };
        services
            .microservices()
            .update(server.uuid, moved, Caller::Cli)
            .await
            .unwrap();

        let view = services
            .microservices()
            .get(client.uuid, Caller::Cli)
            .await
            .unwrap();
        assert_eq!(view.extra_hosts[0].value, "10.0.0.2");
        assert_eq!(view.extra_hosts[0].target_fog_uuid, Some(g.uuid));
    }

    #[tokio::test]
    async fn renamed_target_keeps_bindings_resolvable() {
        let services = services();
        let f = create_agent(&services, "agent-f", "10.0.0.1").await;
        let g = create_agent(&services, "agent-g", "10.0.0.2").await;
        create_app(&services, "app1").await;

        let server = create_ms(&services, "app1", "server", Some(f.uuid)).await;
        let mut client = ms_request("app1", "client", Some(f.uuid));
        client.extra_hosts = Some(vec![ExtraHostRequest::new("srv", "${Apps.app1.server.local}")]);
        let client = services
            .microservices()
            .create(client, Caller::Cli)
            .await
            .unwrap();

        let renamed = crate::services::MicroserviceRequest {
            name: Some("backend".into()),
            ..Default::default()
        };
        services
            .microservices()
            .update(server.uuid, renamed, Caller::Cli)
            .await
            .unwrap();

        let view = services
            .microservices()
            .get(client.uuid, Caller::Cli)
            .await
            .unwrap();
        assert_eq!(view.extra_hosts[0].template, "${Apps.app1.backend.local}");
        assert_eq!(view.extra_hosts[0].value, "10.0.0.1");

        let moved = crate::services::MicroserviceRequest {
            iofog_uuid: Some(g.uuid),
            ..Default::default()
        };
        services
            .microservices()
            .update(server.uuid, moved, Caller::Cli)
            .await
            .unwrap();

        let view = services
            .microservices()
            .get(client.uuid, Caller::Cli)
            .await
            .unwrap();
        assert_eq!(view.extra_hosts[0].value, "10.0.0.2");
        assert_eq!(services.metrics().binding_refresh_failures_total.get(), 0);
    }

    #[tokio::test]
    async fn system_targets_do_not_resolve_for_api_callers() {
        let services = services();
        let f = create_agent(&services, "agent-f", "10.0.0.1").await;
        services
            .applications()
            .create(
                crate::services::ApplicationManifest::named("system-app").system(),
                Caller::Cli,
            )
            .await
            .unwrap();
        create_ms(&services, "system-app", "router", Some(f.uuid)).await;
        create_app(&services, "app1").await;

        let mut request = ms_request("app1", "client", Some(f.uuid));
        request.extra_hosts = Some(vec![ExtraHostRequest::new(
            "router",
            "${Apps.system-app.router.local}",
        )]);
        let err = services
            .microservices()
            .create(request, Caller::Api)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));

        let mut tx = services.store().begin().await.unwrap();
        let resolution = services
            .extra_hosts()
            .resolve(&mut *tx, "${Apps.system-app.router.local}", Caller::Cli)
            .await
            .unwrap();
        assert_eq!(resolution.value, "10.0.0.1");
    }

    #[tokio::test]
    async fn literal_needs_no_topology() {
        let services = services();
        let mut tx = services.store().begin().await.unwrap();
        let resolution = services
            .extra_hosts()
            .resolve(&mut *tx, "db.internal", Caller::Cli)
            .await
            .unwrap();
        assert_eq!(resolution.template_type, TemplateType::Literal);
        assert_eq!(resolution.value, "db.internal");
    }
}
