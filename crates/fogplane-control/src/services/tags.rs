//! Tag-based pub/sub connectivity.
//!
//! A microservice publishing tag set `P` implicitly sends to every other live
//! microservice subscribing to any tag in `P`. Subscribing to a tag therefore
//! changes the publishers' routing, and their agents must be told.

use std::collections::BTreeSet;
use std::sync::Arc;

use fogplane_telemetry::{events, MetricsRegistry};
use serde::Serialize;
use uuid::Uuid;

use crate::db::{Store, StoreTx, Tag};
use crate::error::ControlResult;

use super::change_tracking::{ChangeEvent, ChangeTracker};

/// A publisher whose agent could not be advanced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanOutFailure {
    pub publisher: Uuid,
    pub error: String,
}

/// Outcome of one fan-out pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FanOutReport {
    pub targets: u64,
    pub failures: Vec<FanOutFailure>,
}

/// Maintains tag membership and propagates subscriptions to publishers.
#[derive(Clone)]
pub struct TagFanOut {
    store: Arc<dyn Store>,
    tracker: ChangeTracker,
    metrics: Arc<MetricsRegistry>,
}

impl TagFanOut {
    pub fn new(store: Arc<dyn Store>, tracker: ChangeTracker, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            store,
            tracker,
            metrics,
        }
    }

    /// Find or create a tag per distinct value.
    pub async fn upsert_tags(&self, tx: &mut dyn StoreTx, values: &[String]) -> ControlResult<Vec<Tag>> {
        let distinct: BTreeSet<&str> = values.iter().map(String::as_str).collect();
        let mut tags = Vec::with_capacity(distinct.len());
        for value in distinct {
            tags.push(tx.upsert_tag(value).await?);
        }
        Ok(tags)
    }

    /// Replace the published tags of `microservice`.
    pub async fn set_pub_tags(
        &self,
        tx: &mut dyn StoreTx,
        microservice: Uuid,
        values: &[String],
    ) -> ControlResult<()> {
        let ids: Vec<i64> = self
            .upsert_tags(tx, values)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        tx.set_pub_tags(microservice, &ids).await?;
        Ok(())
    }

    /// Replace the subscribed tags of `microservice`. Returns the ids of tags
    /// that were not subscribed before.
    pub async fn set_sub_tags(
        &self,
        tx: &mut dyn StoreTx,
        microservice: Uuid,
        values: &[String],
    ) -> ControlResult<Vec<i64>> {
        let before: BTreeSet<i64> = tx
            .list_sub_tags(microservice)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        let ids: Vec<i64> = self
            .upsert_tags(tx, values)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        tx.set_sub_tags(microservice, &ids).await?;
        Ok(ids.into_iter().filter(|id| !before.contains(id)).collect())
    }

    /// Live microservices receiving what `microservice` publishes.
    pub async fn receivers(&self, tx: &mut dyn StoreTx, microservice: Uuid) -> ControlResult<Vec<Uuid>> {
        let published: Vec<i64> = tx
            .list_pub_tags(microservice)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        if published.is_empty() {
            return Ok(vec![]);
        }
        let mut receivers = Vec::new();
        for candidate in tx.list_subscribers(&published).await? {
            if candidate == microservice {
                continue;
            }
            if let Some(m) = tx.find_microservice(candidate).await? {
                if !m.delete {
                    receivers.push(candidate);
                }
            }
        }
        Ok(receivers)
    }

    /// Advance the agents of every publisher of `tags`, newly subscribed by
    /// `subscriber`. Each publisher is updated in its own transaction;
    /// failures are collected, never returned.
    pub async fn propagate(&self, subscriber: Uuid, tags: &[i64]) -> FanOutReport {
        let mut report = FanOutReport::default();
        let publishers = match self.publishers(subscriber, tags).await {
            Ok(publishers) => publishers,
            Err(e) => {
                tracing::warn!(
                    event = events::FAN_OUT_FAILED,
                    microservice_uuid = %subscriber,
                    error = %e,
                    "could not look up tag publishers"
                );
                self.metrics.record_fan_out(0, 1);
                report.failures.push(FanOutFailure {
                    publisher: subscriber,
                    error: e.to_string(),
                });
                return report;
            }
        };

        for publisher in publishers {
            report.targets += 1;
            if let Err(e) = self.advance_publisher(publisher).await {
                tracing::warn!(
                    event = events::FAN_OUT_FAILED,
                    microservice_uuid = %publisher,
                    subscriber_uuid = %subscriber,
                    error = %e,
                    "could not advance tag publisher"
                );
                report.failures.push(FanOutFailure {
                    publisher,
                    error: e.to_string(),
                });
            }
        }
        self.metrics
            .record_fan_out(report.targets, report.failures.len() as u64);
        report
    }

    async fn publishers(&self, subscriber: Uuid, tags: &[i64]) -> ControlResult<Vec<Uuid>> {
        let mut tx = self.store.begin().await?;
        let publishers = tx.list_publishers(tags).await?;
        Ok(publishers.into_iter().filter(|p| *p != subscriber).collect())
    }

    async fn advance_publisher(&self, publisher: Uuid) -> ControlResult<()> {
        let mut tx = self.store.begin().await?;
        let Some(m) = tx.find_microservice(publisher).await? else {
            return Ok(());
        };
        if m.delete {
            return Ok(());
        }
        self.tracker
            .update(&mut *tx, m.iofog_uuid, ChangeEvent::MicroserviceFull)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ChangeFlag;
    use crate::services::testing::*;
    use crate::services::Caller;

    #[tokio::test]
    async fn subscribing_advances_publisher_agents() {
        let services = services();
        let pub_fog = create_agent(&services, "publisher-agent", "10.0.0.1").await;
        let sub_fog = create_agent(&services, "subscriber-agent", "10.0.0.2").await;
        create_app(&services, "app1").await;

        let mut publisher = ms_request("app1", "sensor", Some(pub_fog.uuid));
        publisher.pub_tags = Some(vec!["temperature".into()]);
        let publisher = services
            .microservices()
            .create(publisher, Caller::Cli)
            .await
            .unwrap();
        let before = changes(&services, pub_fog.uuid).await;

        let mut subscriber = ms_request("app1", "dashboard", Some(sub_fog.uuid));
        subscriber.sub_tags = Some(vec!["temperature".into()]);
        let subscriber = services
            .microservices()
            .create(subscriber, Caller::Cli)
            .await
            .unwrap();

        let after = changes(&services, pub_fog.uuid).await;
        assert!(after.revision(ChangeFlag::Routing) > before.revision(ChangeFlag::Routing));

        let receivers = services
            .microservices()
            .receivers(publisher.uuid, Caller::Cli)
            .await
            .unwrap();
        assert_eq!(receivers, vec![subscriber.uuid]);

        // Symmetric view: the publisher's routes include the subscriber
        let view = services
            .microservices()
            .get(publisher.uuid, Caller::Cli)
            .await
            .unwrap();
        assert!(view.routes.contains(&subscriber.uuid));
    }

    #[tokio::test]
    async fn subscribing_on_update_advances_publisher_agents() {
        let services = services();
        let pub_fog = create_agent(&services, "publisher-agent", "10.0.0.1").await;
        let sub_fog = create_agent(&services, "subscriber-agent", "10.0.0.2").await;
        create_app(&services, "app1").await;

        let mut publisher = ms_request("app1", "sensor", Some(pub_fog.uuid));
        publisher.pub_tags = Some(vec!["t1".into()]);
        let publisher = services
            .microservices()
            .create(publisher, Caller::Cli)
            .await
            .unwrap();
        let subscriber = create_ms(&services, "app1", "dashboard", Some(sub_fog.uuid)).await;
        let before = changes(&services, pub_fog.uuid).await;
        assert_eq!(before.revision(ChangeFlag::Routing), 0);

        services
            .microservices()
            .update(
                subscriber.uuid,
                crate::services::MicroserviceRequest {
                    sub_tags: Some(vec!["t1".into()]),
                    ..Default::default()
                },
                Caller::Cli,
            )
            .await
            .unwrap();

        let after = changes(&services, pub_fog.uuid).await;
        assert_eq!(after.revision(ChangeFlag::Routing), 1);
        let receivers = services
            .microservices()
            .receivers(publisher.uuid, Caller::Cli)
            .await
            .unwrap();
        assert_eq!(receivers, vec![subscriber.uuid]);
    }

    #[tokio::test]
    async fn microservice_is_never_its_own_receiver() {
        let services = services();
        create_app(&services, "app1").await;
        let mut both = ms_request("app1", "loop", None);
        both.pub_tags = Some(vec!["t".into()]);
        both.sub_tags = Some(vec!["t".into()]);
        let created = services
            .microservices()
            .create(both, Caller::Cli)
            .await
            .unwrap();
        let receivers = services
            .microservices()
            .receivers(created.uuid, Caller::Cli)
            .await
            .unwrap();
        assert!(receivers.is_empty());
    }

    #[tokio::test]
    async fn resubscribing_reports_only_new_tags() {
        let services = services();
        create_app(&services, "app1").await;
        let created = create_ms(&services, "app1", "m", None).await;
        let tags = services.tags();

        let mut tx = services.store().begin().await.unwrap();
        let first = tags
            .set_sub_tags(&mut *tx, created.uuid, &["a".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        let second = tags
            .set_sub_tags(&mut *tx, created.uuid, &["b".into(), "c".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(tx.list_sub_tags(created.uuid).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn propagate_counts_targets() {
        let services = services();
        let fog = create_agent(&services, "agent1", "10.0.0.1").await;
        create_app(&services, "app1").await;
        let mut publisher = ms_request("app1", "p", Some(fog.uuid));
        publisher.pub_tags = Some(vec!["x".into()]);
        services
            .microservices()
            .create(publisher, Caller::Cli)
            .await
            .unwrap();

        let mut tx = services.store().begin().await.unwrap();
        let tag = tx.upsert_tag("x").await.unwrap();
        drop(tx);

        let report = services.tags().propagate(Uuid::new_v4(), &[tag.id]).await;
        assert_eq!(report.targets, 1);
        assert!(report.failures.is_empty());
        assert_eq!(services.metrics().fan_out_targets_total.get(), 1);
    }
}
