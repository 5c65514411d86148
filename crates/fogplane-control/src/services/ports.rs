//! Port mapping reservation and validation.
//!
//! An external port is claimed per agent and per protocol. Public ports are
//! allocated from the configured range and claimed on the agent they are
//! published on; proxy mappings claim a unique host name instead.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ControlConfig;
use crate::db::{Fog, NewPortMapping, PortMapping, PublicMode, StoreTx};
use crate::error::{ControlError, ControlResult};

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn from_udp(is_udp: bool) -> Self {
        if is_udp {
            Self::Udp
        } else {
            Self::Tcp
        }
    }

    pub fn is_udp(self) -> bool {
        self == Self::Udp
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// A requested port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRequest {
    pub internal: i32,
    pub external: i32,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub public_mode: PublicMode,
    /// Requested public port; allocated from the range when absent.
    pub public_port: Option<i32>,
    /// Proxy host name, required when `public_mode` is `proxy`.
    pub host: Option<String>,
}

impl PortRequest {
    pub fn new(internal: i32, external: i32) -> Self {
        Self {
            internal,
            external,
            protocol: Protocol::Tcp,
            public_mode: PublicMode::None,
            public_port: None,
            host: None,
        }
    }

    pub fn udp(mut self) -> Self {
        self.protocol = Protocol::Udp;
        self
    }

    pub fn public(mut self) -> Self {
        self.public_mode = PublicMode::Public;
        self
    }

    pub fn proxy(mut self, host: &str) -> Self {
        self.public_mode = PublicMode::Proxy;
        self.host = Some(host.to_string());
        self
    }
}

/// A publicly reachable address of a port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicLink {
    pub internal: i32,
    pub external: i32,
    pub link: String,
}

/// A stored port mapping with its public link, if any.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMappingView {
    #[serde(flatten)]
    pub mapping: PortMapping,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_link: Option<String>,
}

/// Reserves, validates and releases port mappings.
#[derive(Clone)]
pub struct PortMappingService {
    config: Arc<ControlConfig>,
}

impl PortMappingService {
    pub fn new(config: Arc<ControlConfig>) -> Self {
        Self { config }
    }

    /// Check a request list on its own, before any agent is consulted.
    pub fn validate_request(&self, ports: &[PortRequest]) -> ControlResult<()> {
        let mut seen = HashSet::new();
        let mut hosts = HashSet::new();
        for port in ports {
            for value in [port.internal, port.external] {
                if !(1..=65535).contains(&value) {
                    return Err(ControlError::invalid_argument(format!(
                        "port {value} is outside 1-65535"
                    )));
                }
            }
            if !seen.insert((port.external, port.protocol)) {
                return Err(ControlError::validation(format!(
                    "port {}/{} is mapped more than once",
                    port.external,
                    port.protocol.as_str()
                )));
            }
            match port.public_mode {
                PublicMode::None => {}
                PublicMode::Public => {
                    if let Some(public) = port.public_port {
                        if !self.config.public_port_range.contains(&public) {
                            return Err(ControlError::validation(format!(
                                "public port {public} is outside {}-{}",
                                self.config.public_port_range.start(),
                                self.config.public_port_range.end()
                            )));
                        }
                    }
                }
                PublicMode::Proxy => {
                    let host = port.host.as_deref().unwrap_or("").trim();
                    if host.is_empty() {
                        return Err(ControlError::validation(format!(
                            "proxy mapping of port {} requires a host",
                            port.internal
                        )));
                    }
                    if !hosts.insert(host.to_string()) {
                        return Err(ControlError::validation(format!(
                            "proxy host {host} is used more than once"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Fail if any `(port, protocol)` pair is already claimed on `fog` by a
    /// microservice other than `owner`, as an external or a public port.
    pub async fn validate_on_fog(
        &self,
        tx: &mut dyn StoreTx,
        fog: Uuid,
        ports: &[(i32, Protocol)],
        owner: Option<Uuid>,
    ) -> ControlResult<()> {
        let claimed = claims_on_fog(tx, fog, owner).await?;
        ensure_free(&claimed, fog, ports)
    }

    /// Validate and store the mappings of `microservice` placed on `fog`.
    pub async fn reserve(
        &self,
        tx: &mut dyn StoreTx,
        microservice: Uuid,
        fog: Option<&Fog>,
        ports: &[PortRequest],
    ) -> ControlResult<Vec<PortMapping>> {
        self.validate_request(ports)?;
        if ports.is_empty() {
            return Ok(vec![]);
        }
        let mut claimed = match fog {
            Some(fog) => {
                let claimed = claims_on_fog(tx, fog.uuid, Some(microservice)).await?;
                let pairs: Vec<_> = ports.iter().map(|p| (p.external, p.protocol)).collect();
                ensure_free(&claimed, fog.uuid, &pairs)?;
                claimed
            }
            None => HashSet::new(),
        };
        // a public port must not collide with the request's own external ports
        claimed.extend(ports.iter().map(|p| (p.external, p.protocol.is_udp())));

        let exposed = tx.list_exposed_port_mappings().await?;
        let used_hosts: HashSet<&str> = exposed
            .iter()
            .filter(|p| p.microservice_uuid != microservice)
            .filter_map(|p| p.proxy_host.as_deref())
            .collect();

        let mut stored = Vec::with_capacity(ports.len());
        for port in ports {
            let mut row = NewPortMapping {
                microservice_uuid: microservice,
                port_internal: port.internal,
                port_external: port.external,
                is_udp: port.protocol.is_udp(),
                public_mode: port.public_mode,
                public_port: None,
                public_fog_uuid: None,
                proxy_host: None,
            };
            match port.public_mode {
                PublicMode::None => {}
                PublicMode::Public => {
                    let Some(fog) = fog else {
                        return Err(ControlError::validation(format!(
                            "public port for {} requires a placed microservice",
                            port.internal
                        )));
                    };
                    let public = self.allocate_public_port(fog.uuid, port, &claimed)?;
                    claimed.insert((public, port.protocol.is_udp()));
                    row.public_port = Some(public);
                    row.public_fog_uuid = Some(fog.uuid);
                }
                PublicMode::Proxy => {
                    let host = port.host.as_deref().unwrap_or("").trim().to_string();
                    if used_hosts.contains(host.as_str()) {
                        return Err(ControlError::validation(format!(
                            "proxy host {host} is already in use"
                        )));
                    }
                    row.proxy_host = Some(host);
                    row.public_fog_uuid = fog.map(|f| f.uuid);
                }
            }
            stored.push(tx.insert_port_mapping(&row).await?);
        }
        Ok(stored)
    }

    fn allocate_public_port(
        &self,
        fog: Uuid,
        port: &PortRequest,
        claimed: &HashSet<(i32, bool)>,
    ) -> ControlResult<i32> {
        let udp = port.protocol.is_udp();
        let free = |candidate: i32| !claimed.contains(&(candidate, udp));
        if let Some(requested) = port.public_port {
            return if free(requested) {
                Ok(requested)
            } else {
                Err(ControlError::validation(format!(
                    "public port {requested} is already in use on agent {fog}"
                )))
            };
        }
        self.config
            .public_port_range
            .clone()
            .find(|candidate| free(*candidate))
            .ok_or_else(|| {
                ControlError::validation(format!("no free public port left on agent {fog}"))
            })
    }

    /// Re-validate every mapping of `microservice` on the agent it moves to.
    pub async fn ensure_available_on(
        &self,
        tx: &mut dyn StoreTx,
        microservice: Uuid,
        dest: Uuid,
    ) -> ControlResult<()> {
        let mut pairs = Vec::new();
        for mapping in tx.list_port_mappings(microservice).await? {
            let protocol = Protocol::from_udp(mapping.is_udp);
            pairs.push((mapping.port_external, protocol));
            if mapping.public_mode == PublicMode::Public {
                pairs.extend(mapping.public_port.map(|public| (public, protocol)));
            }
        }
        self.validate_on_fog(tx, dest, &pairs, Some(microservice))
            .await
    }

    /// Re-home exposed mappings under `dest`, keeping their public ports.
    pub async fn move_public_ports_to_new_fog(
        &self,
        tx: &mut dyn StoreTx,
        microservice: Uuid,
        dest: Uuid,
    ) -> ControlResult<u64> {
        let mut moved = 0;
        for mapping in tx.list_port_mappings(microservice).await? {
            if mapping.public_mode != PublicMode::None {
                tx.set_public_fog(mapping.id, dest).await?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Drop every mapping of `microservice`.
    pub async fn release(&self, tx: &mut dyn StoreTx, microservice: Uuid) -> ControlResult<u64> {
        Ok(tx.delete_port_mappings(microservice).await?)
    }

    /// Mappings of `microservice` with their public links resolved.
    pub async fn list_views(
        &self,
        tx: &mut dyn StoreTx,
        microservice: Uuid,
    ) -> ControlResult<Vec<PortMappingView>> {
        let mut views = Vec::new();
        for mapping in tx.list_port_mappings(microservice).await? {
            let host = match mapping.public_fog_uuid {
                Some(fog) => tx.find_fog(fog).await?.map(|f| f.host),
                None => None,
            };
            let public_link = public_link(&mapping, host.as_deref());
            views.push(PortMappingView {
                mapping,
                public_link,
            });
        }
        Ok(views)
    }
}

/// Every `(port, is_udp)` bound on `fog` by a microservice other than
/// `owner`, whether as its external port or as its public port.
async fn claims_on_fog(
    tx: &mut dyn StoreTx,
    fog: Uuid,
    owner: Option<Uuid>,
) -> ControlResult<HashSet<(i32, bool)>> {
    let mut claimed: HashSet<(i32, bool)> = tx
        .list_port_mappings_on_fog(fog)
        .await?
        .iter()
        .filter(|p| Some(p.microservice_uuid) != owner)
        .map(|p| (p.port_external, p.is_udp))
        .collect();
    claimed.extend(
        tx.list_exposed_port_mappings()
            .await?
            .iter()
            .filter(|p| Some(p.microservice_uuid) != owner && p.public_fog_uuid == Some(fog))
            .filter_map(|p| Some((p.public_port?, p.is_udp))),
    );
    Ok(claimed)
}

fn ensure_free(
    claimed: &HashSet<(i32, bool)>,
    fog: Uuid,
    ports: &[(i32, Protocol)],
) -> ControlResult<()> {
    for (port, protocol) in ports {
        if claimed.contains(&(*port, protocol.is_udp())) {
            return Err(ControlError::validation(format!(
                "port {port}/{} is already in use on agent {fog}",
                protocol.as_str()
            )));
        }
    }
    Ok(())
}

/// Public address of a mapping published on an agent reachable at `host`.
pub fn public_link(mapping: &PortMapping, host: Option<&str>) -> Option<String> {
    match mapping.public_mode {
        PublicMode::None => None,
        PublicMode::Public => {
            let scheme = if mapping.is_udp { "udp" } else { "http" };
            Some(format!("{scheme}://{}:{}", host?, mapping.public_port?))
        }
        PublicMode::Proxy => Some(format!("http://{}", mapping.proxy_host.as_deref()?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControlError;
    use crate::services::testing::*;
    use crate::services::{Caller, MicroserviceRequest};

    #[test]
    fn request_rejects_out_of_range_ports() {
        let service = services().ports();
        let err = service
            .validate_request(&[PortRequest::new(0, 80)])
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidArgument(_)));
    }

    #[test]
    fn request_rejects_duplicate_external_per_protocol() {
        let service = services().ports();
        assert!(service
            .validate_request(&[PortRequest::new(80, 8080), PortRequest::new(81, 8080)])
            .is_err());
        // same external port on another protocol is fine
        service
            .validate_request(&[PortRequest::new(80, 8080), PortRequest::new(80, 8080).udp()])
            .unwrap();
    }

    #[test]
    fn proxy_requires_host() {
        let service = services().ports();
        let mut port = PortRequest::new(80, 8080);
        port.public_mode = PublicMode::Proxy;
        assert!(matches!(
            service.validate_request(&[port]),
            Err(ControlError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn external_port_conflicts_only_on_same_agent_and_protocol() {
        let services = services();
        let f = create_agent(&services, "agent-f", "10.0.0.1").await;
        let g = create_agent(&services, "agent-g", "10.0.0.2").await;
        create_app(&services, "app1").await;

        let mut first = ms_request("app1", "first", Some(f.uuid));
        first.ports = Some(vec![PortRequest::new(80, 8080)]);
        services
            .microservices()
            .create(first, Caller::Cli)
            .await
            .unwrap();

        let mut clash = ms_request("app1", "clash", Some(f.uuid));
        clash.ports = Some(vec![PortRequest::new(80, 8080)]);
        let err = services
            .microservices()
            .create(clash, Caller::Cli)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));

        let mut other_agent = ms_request("app1", "elsewhere", Some(g.uuid));
        other_agent.ports = Some(vec![PortRequest::new(80, 8080)]);
        services
            .microservices()
            .create(other_agent, Caller::Cli)
            .await
            .unwrap();

        let mut other_protocol = ms_request("app1", "udp", Some(f.uuid));
        other_protocol.ports = Some(vec![PortRequest::new(80, 8080).udp()]);
        services
            .microservices()
            .create(other_protocol, Caller::Cli)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn public_ports_are_allocated_from_range() {
        let services = services();
        let f = create_agent(&services, "agent-f", "10.0.0.1").await;
        create_app(&services, "app1").await;

        let mut a = ms_request("app1", "a", Some(f.uuid));
        a.ports = Some(vec![PortRequest::new(80, 8080).public()]);
        let created_a = services.microservices().create(a, Caller::Cli).await.unwrap();
        assert_eq!(created_a.public_ports[0].link, "http://10.0.0.1:6000");

        let mut b = ms_request("app1", "b", Some(f.uuid));
        b.ports = Some(vec![PortRequest::new(80, 8081).public()]);
        let created_b = services.microservices().create(b, Caller::Cli).await.unwrap();
        assert_eq!(created_b.public_ports[0].link, "http://10.0.0.1:6001");
    }

    #[tokio::test]
    async fn public_ports_skip_external_ports_of_the_agent() {
        let services = services();
        let f = create_agent(&services, "agent-f", "10.0.0.1").await;
        create_app(&services, "app1").await;
        let ms = services.microservices();

        let mut x = ms_request("app1", "x", Some(f.uuid));
        x.ports = Some(vec![PortRequest::new(80, 6000)]);
        ms.create(x, Caller::Cli).await.unwrap();

        let mut y = ms_request("app1", "y", Some(f.uuid));
        y.ports = Some(vec![PortRequest::new(80, 8080).public()]);
        let created = ms.create(y, Caller::Cli).await.unwrap();
        assert_eq!(created.public_ports[0].link, "http://10.0.0.1:6001");

        // an explicitly requested public port is checked the same way
        let mut requested = ms_request("app1", "requested", Some(f.uuid));
        let mut port = PortRequest::new(80, 8081).public();
        port.public_port = Some(6000);
        requested.ports = Some(vec![port]);
        let err = ms.create(requested, Caller::Cli).await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
    }

    #[tokio::test]
    async fn external_ports_skip_public_ports_of_the_agent() {
        let services = services();
        let f = create_agent(&services, "agent-f", "10.0.0.1").await;
        let g = create_agent(&services, "agent-g", "10.0.0.2").await;
        create_app(&services, "app1").await;
        let ms = services.microservices();

        let mut w = ms_request("app1", "w", Some(f.uuid));
        w.ports = Some(vec![PortRequest::new(80, 8080).public()]);
        let created = ms.create(w, Caller::Cli).await.unwrap();
        assert_eq!(created.public_ports[0].link, "http://10.0.0.1:6000");

        let mut z = ms_request("app1", "z", Some(f.uuid));
        z.ports = Some(vec![PortRequest::new(80, 6000)]);
        let err = ms.create(z, Caller::Cli).await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));

        // the same claim is free on another agent, but moving there is not
        let mut v = ms_request("app1", "v", Some(g.uuid));
        v.ports = Some(vec![PortRequest::new(80, 6000)]);
        let v = ms.create(v, Caller::Cli).await.unwrap();
        let to_f = MicroserviceRequest {
            iofog_uuid: Some(f.uuid),
            ..Default::default()
        };
        let err = ms.update(v.uuid, to_f, Caller::Cli).await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
    }

    #[tokio::test]
    async fn proxy_hosts_are_unique() {
        let services = services();
        let f = create_agent(&services, "agent-f", "10.0.0.1").await;
        create_app(&services, "app1").await;

        let mut a = ms_request("app1", "a", Some(f.uuid));
        a.ports = Some(vec![PortRequest::new(80, 8080).proxy("api.example.com")]);
        let created = services.microservices().create(a, Caller::Cli).await.unwrap();
        assert_eq!(created.proxies[0].link, "http://api.example.com");

        let mut b = ms_request("app1", "b", Some(f.uuid));
        b.ports = Some(vec![PortRequest::new(80, 8081).proxy("api.example.com")]);
        assert!(services.microservices().create(b, Caller::Cli).await.is_err());
    }

    #[test]
    fn udp_public_links_use_udp_scheme() {
        let mapping = PortMapping {
            id: 1,
            microservice_uuid: Uuid::new_v4(),
            port_internal: 53,
            port_external: 5353,
            is_udp: true,
            public_mode: PublicMode::Public,
            public_port: Some(6005),
            public_fog_uuid: Some(Uuid::new_v4()),
            proxy_host: None,
            created_at: chrono::Utc::now(),
        };
        assert_eq!(
            public_link(&mapping, Some("edge.local")).as_deref(),
            Some("udp://edge.local:6005")
        );
        assert_eq!(public_link(&mapping, None), None);
    }
}
