//! Explicit routes between microservices of one application.

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::db::{Microservice, MicroservicePatch, NewRoute, Route, RoutePatch, StoreTx};
use crate::error::{ControlError, ControlResult};

use super::change_tracking::ChangeEvent;
use super::{
    find_application, is_system_microservice, visible_microservice, ApplicationRef, Caller,
    Deferred, Services,
};

/// A route to create.
///
/// Endpoints are given either by uuid, or by application name plus the
/// names of the source (`from`) and destination (`to`) microservices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    pub name: String,
    pub application: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub source_microservice_uuid: Option<Uuid>,
    pub dest_microservice_uuid: Option<Uuid>,
}

impl RouteRequest {
    pub fn by_name(name: &str, application: &str, from: &str, to: &str) -> Self {
        Self {
            name: name.to_string(),
            application: Some(application.to_string()),
            from: Some(from.to_string()),
            to: Some(to.to_string()),
            ..Default::default()
        }
    }

    pub fn by_uuid(name: &str, source: Uuid, dest: Uuid) -> Self {
        Self {
            name: name.to_string(),
            source_microservice_uuid: Some(source),
            dest_microservice_uuid: Some(dest),
            ..Default::default()
        }
    }
}

/// Changes to an existing route. Endpoints are microservice names within the
/// route's application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteUpdate {
    pub name: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// Creates, updates and deletes routes, keeping endpoint agents informed.
#[derive(Clone)]
pub struct RoutingService {
    ctx: Services,
}

impl RoutingService {
    pub fn new(ctx: Services) -> Self {
        Self { ctx }
    }

    pub async fn create(&self, request: RouteRequest, caller: Caller) -> ControlResult<Route> {
        let result = async {
            let mut tx = self.ctx.store().begin().await?;
            let mut deferred = Deferred::default();
            let route = self
                .create_in(&mut *tx, &request, caller, &mut deferred)
                .await?;
            tx.commit().await?;
            self.ctx.finish(deferred).await;
            Ok(route)
        }
        .await;
        self.ctx.observe("create_route", &result);
        result
    }

    pub(crate) async fn create_in(
        &self,
        tx: &mut dyn StoreTx,
        request: &RouteRequest,
        caller: Caller,
        deferred: &mut Deferred,
    ) -> ControlResult<Route> {
        if request.name.trim().is_empty() {
            return Err(ControlError::validation("route name is required"));
        }
        let (source, dest) = match (
            request.source_microservice_uuid,
            request.dest_microservice_uuid,
        ) {
            (Some(source), Some(dest)) => (
                visible_microservice(tx, source, caller).await?,
                visible_microservice(tx, dest, caller).await?,
            ),
            _ => {
                let (Some(application), Some(from), Some(to)) =
                    (&request.application, &request.from, &request.to)
                else {
                    return Err(ControlError::validation(
                        "route requires source and destination uuids or application, from and to",
                    ));
                };
                let app = find_application(tx, &ApplicationRef::Name(application.clone()), caller)
                    .await?;
                (
                    microservice_by_name(tx, app.id, from, caller).await?,
                    microservice_by_name(tx, app.id, to, caller).await?,
                )
            }
        };
        check_endpoints(&source, &dest)?;

        if tx
            .find_route_between(source.uuid, dest.uuid)
            .await?
            .is_some()
        {
            return Err(ControlError::duplicate(format!(
                "route from {} to {} already exists",
                source.name, dest.name
            )));
        }
        if tx
            .find_route_by_name(source.application_id, &request.name)
            .await?
            .is_some()
        {
            return Err(ControlError::duplicate(format!(
                "route {} already exists",
                request.name
            )));
        }

        let route = tx
            .insert_route(&NewRoute {
                name: request.name.clone(),
                application_id: source.application_id,
                source_microservice_uuid: source.uuid,
                dest_microservice_uuid: dest.uuid,
            })
            .await?;

        let tracker = self.ctx.tracker();
        for endpoint in [&source, &dest] {
            mark_rebuild(tx, endpoint.uuid).await?;
            tracker
                .update(tx, endpoint.iofog_uuid, ChangeEvent::MicroserviceFull)
                .await?;
        }
        deferred.audit(
            "created",
            "route",
            route.id,
            json!({"name": route.name, "source": source.uuid, "dest": dest.uuid}),
        );
        Ok(route)
    }

    pub async fn update(
        &self,
        application: &str,
        name: &str,
        update: RouteUpdate,
        caller: Caller,
    ) -> ControlResult<Route> {
        let result = async {
            let mut tx = self.ctx.store().begin().await?;
            let mut deferred = Deferred::default();
            let route = self
                .update_in(&mut *tx, application, name, &update, caller, &mut deferred)
                .await?;
            tx.commit().await?;
            self.ctx.finish(deferred).await;
            Ok(route)
        }
        .await;
        self.ctx.observe("update_route", &result);
        result
    }

    pub(crate) async fn update_in(
        &self,
        tx: &mut dyn StoreTx,
        application: &str,
        name: &str,
        update: &RouteUpdate,
        caller: Caller,
        deferred: &mut Deferred,
    ) -> ControlResult<Route> {
        let app = find_application(tx, &application.into(), caller).await?;
        let route = route_by_name(tx, app.id, name).await?;

        let old_source = visible_microservice(tx, route.source_microservice_uuid, caller).await?;
        let old_dest = visible_microservice(tx, route.dest_microservice_uuid, caller).await?;
        let source = match &update.from {
            Some(from) => microservice_by_name(tx, app.id, from, caller).await?,
            None => old_source.clone(),
        };
        let dest = match &update.to {
            Some(to) => microservice_by_name(tx, app.id, to, caller).await?,
            None => old_dest.clone(),
        };
        let source_changed = source.uuid != old_source.uuid;
        let dest_changed = dest.uuid != old_dest.uuid;

        if source_changed || dest_changed {
            check_endpoints(&source, &dest)?;
            if tx
                .find_route_between(source.uuid, dest.uuid)
                .await?
                .is_some_and(|r| r.id != route.id)
            {
                return Err(ControlError::duplicate(format!(
                    "route from {} to {} already exists",
                    source.name, dest.name
                )));
            }
        }
        if let Some(new_name) = &update.name {
            if new_name.trim().is_empty() {
                return Err(ControlError::validation("route name is required"));
            }
            if tx
                .find_route_by_name(app.id, new_name)
                .await?
                .is_some_and(|r| r.id != route.id)
            {
                return Err(ControlError::duplicate(format!(
                    "route {new_name} already exists"
                )));
            }
        }

        let patch = RoutePatch {
            name: update.name.clone(),
            source_microservice_uuid: source_changed.then_some(source.uuid),
            dest_microservice_uuid: dest_changed.then_some(dest.uuid),
        };
        let updated = tx
            .update_route(route.id, &patch)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("route {name} not found")))?;

        let tracker = self.ctx.tracker();
        let changed_pairs = [
            (source_changed, &old_source, &source),
            (dest_changed, &old_dest, &dest),
        ];
        for (changed, old, new) in changed_pairs {
            if !changed {
                continue;
            }
            mark_rebuild(tx, new.uuid).await?;
            tracker
                .update(tx, old.iofog_uuid, ChangeEvent::MicroserviceFull)
                .await?;
            tracker
                .update(tx, new.iofog_uuid, ChangeEvent::MicroserviceFull)
                .await?;
        }
        deferred.audit("updated", "route", updated.id, json!({"name": updated.name}));
        Ok(updated)
    }

    pub async fn delete(&self, application: &str, name: &str, caller: Caller) -> ControlResult<()> {
        let result = async {
            let mut tx = self.ctx.store().begin().await?;
            let mut deferred = Deferred::default();
            self.delete_in(&mut *tx, application, name, caller, &mut deferred)
                .await?;
            tx.commit().await?;
            self.ctx.finish(deferred).await;
            Ok(())
        }
        .await;
        self.ctx.observe("delete_route", &result);
        result
    }

    pub(crate) async fn delete_in(
        &self,
        tx: &mut dyn StoreTx,
        application: &str,
        name: &str,
        caller: Caller,
        deferred: &mut Deferred,
    ) -> ControlResult<()> {
        let app = find_application(tx, &application.into(), caller).await?;
        let route = route_by_name(tx, app.id, name).await?;
        self.remove(tx, &route).await?;
        deferred.audit("deleted", "route", route.id, json!({"name": route.name}));
        Ok(())
    }

    /// Delete every route with `microservice` at either end.
    pub(crate) async fn delete_touching(
        &self,
        tx: &mut dyn StoreTx,
        microservice: Uuid,
    ) -> ControlResult<usize> {
        let routes = tx.list_routes_touching(microservice).await?;
        for route in &routes {
            self.remove(tx, route).await?;
        }
        Ok(routes.len())
    }

    async fn remove(&self, tx: &mut dyn StoreTx, route: &Route) -> ControlResult<()> {
        tx.delete_route(route.id).await?;
        let tracker = self.ctx.tracker();
        for endpoint in [route.source_microservice_uuid, route.dest_microservice_uuid] {
            let fog = tx.find_microservice(endpoint).await?.and_then(|m| m.iofog_uuid);
            tracker
                .update(tx, fog, ChangeEvent::MicroserviceRouting)
                .await?;
        }
        Ok(())
    }

    pub async fn get(&self, application: &str, name: &str, caller: Caller) -> ControlResult<Route> {
        let mut tx = self.ctx.store().begin().await?;
        let app = find_application(&mut *tx, &application.into(), caller).await?;
        route_by_name(&mut *tx, app.id, name).await
    }

    pub async fn list(&self, application: Option<&str>, caller: Caller) -> ControlResult<Vec<Route>> {
        let mut tx = self.ctx.store().begin().await?;
        match application {
            Some(application) => {
                let app = find_application(&mut *tx, &application.into(), caller).await?;
                Ok(tx.list_routes(Some(app.id)).await?)
            }
            None => {
                let visible: Vec<i64> = tx
                    .list_applications()
                    .await?
                    .into_iter()
                    .filter(|a| caller.is_privileged() || !a.is_system)
                    .map(|a| a.id)
                    .collect();
                Ok(tx
                    .list_routes(None)
                    .await?
                    .into_iter()
                    .filter(|r| visible.contains(&r.application_id))
                    .collect())
            }
        }
    }
}

async fn microservice_by_name(
    tx: &mut dyn StoreTx,
    application_id: i64,
    name: &str,
    caller: Caller,
) -> ControlResult<Microservice> {
    let not_found = || ControlError::not_found(format!("microservice {name} not found"));
    let microservice = tx
        .find_microservice_by_name(application_id, name)
        .await?
        .ok_or_else(not_found)?;
    if !caller.is_privileged() && is_system_microservice(tx, &microservice).await? {
        return Err(not_found());
    }
    Ok(microservice)
}

async fn route_by_name(tx: &mut dyn StoreTx, application_id: i64, name: &str) -> ControlResult<Route> {
    tx.find_route_by_name(application_id, name)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("route {name} not found")))
}

fn check_endpoints(source: &Microservice, dest: &Microservice) -> ControlResult<()> {
    if source.uuid == dest.uuid {
        return Err(ControlError::validation(format!(
            "microservice {} cannot route to itself",
            source.name
        )));
    }
    if source.application_id != dest.application_id {
        return Err(ControlError::validation(format!(
            "microservices {} and {} belong to different applications",
            source.name, dest.name
        )));
    }
    for endpoint in [source, dest] {
        if endpoint.iofog_uuid.is_none() {
            return Err(ControlError::validation(format!(
                "microservice {} is not placed on an agent",
                endpoint.name
            )));
        }
    }
    Ok(())
}

async fn mark_rebuild(tx: &mut dyn StoreTx, microservice: Uuid) -> ControlResult<()> {
    let patch = MicroservicePatch {
        rebuild: Some(true),
        ..Default::default()
    };
    tx.update_microservice(microservice, &patch).await?;
    Ok(())
}
