//! # Hippocampus: the Audit Trail
//!
//! Every user and system action is written here, with `avant`/`apres` details
//! for updates. Recording never fails from the caller's point of view: an
//! audit problem is logged and the business operation carries on.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::core::signal::{ActionCategory, ActionRecord, Actor, Metric};
use crate::error::Result;
use crate::store::{HistoryFilter, HistoryStats, Store, StoredAction};

/// Default page size of the history listing.
pub const DEFAULT_PAGE_SIZE: usize = 50;
/// Largest page size accepted by the history listing.
pub const MAX_PAGE_SIZE: usize = 200;
/// Default retention of the audit trail, in days.
pub const DEFAULT_RETENTION_DAYS: i64 = 365;

/// A history request: filters plus pagination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(flatten)]
    pub filter: HistoryFilter,
    /// 1-based.
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

/// One page of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub actions: Vec<StoredAction>,
    pub total: u64,
    pub page: usize,
    pub total_pages: u64,
}

#[derive(Clone)]
pub struct Hippocampus {
    store: Arc<dyn Store>,
}

impl Hippocampus {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Records an action. Returns `None` when the store refused it.
    pub async fn record(&self, action: ActionRecord) -> Option<Uuid> {
        match self.store.insert_action(&action).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!("[Hippocampe] Failed to record {}: {}", action.action, e);
                None
            }
        }
    }

    /// Records a business action performed by `actor`.
    pub async fn record_business(
        &self,
        action: &str,
        entite_type: &str,
        entite_id: &str,
        actor: &Actor,
        details: Value,
        metadata: Value,
    ) -> Option<Uuid> {
        let mut record = ActionRecord::new(action, ActionCategory::Metier, entite_type).with_actor(actor);
        record.entite_id = Some(entite_id.to_string());
        record.details = details;
        record.metadata = metadata;
        self.record(record).await
    }

    /// Filtered, paginated history, newest first.
    pub async fn list(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        let page = query.page.unwrap_or(1).max(1);
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = (page - 1) * limit;

        let (actions, total) = self.store.list_actions(&query.filter, limit, offset).await?;
        Ok(HistoryPage {
            actions,
            total,
            page,
            total_pages: total.div_ceil(limit as u64),
        })
    }

    /// Every action on one entity, newest first.
    pub async fn entity_timeline(&self, entite_type: &str, entite_id: &str, limit: usize) -> Result<Vec<StoredAction>> {
        self.store.entity_timeline(entite_type, entite_id, limit).await
    }

    /// Writes the activity metrics of the last hour. Errors are logged.
    pub async fn compute_metrics(&self) {
        if let Err(e) = self.try_compute_metrics().await {
            error!("[Hippocampe] Metrics computation failed: {}", e);
        }
    }

    async fn try_compute_metrics(&self) -> Result<()> {
        let snapshot = self.store.activity_since(Utc::now() - Duration::hours(1)).await?;

        let mut metrics: Vec<Metric> = snapshot
            .per_category
            .iter()
            .map(|kc| {
                Metric::count("hippocampe.actions_par_categorie", kc.count, "heure")
                    .with_dimensions(json!({ "categorie": kc.key }))
            })
            .collect();
        metrics.push(Metric::count("hippocampe.actions_totales", snapshot.total, "heure"));
        metrics.push(Metric::count("hippocampe.utilisateurs_actifs", snapshot.distinct_users, "heure"));

        self.store.insert_metrics(&metrics).await
    }

    /// Deletes actions older than the retention.
    pub async fn purge(&self, retention_days: i64) -> Result<u64> {
        let purged = self
            .store
            .purge_actions(Utc::now() - Duration::days(retention_days))
            .await?;
        if purged > 0 {
            info!("[Hippocampe] Purged {} actions", purged);
        }
        Ok(purged)
    }

    pub async fn stats(&self) -> Result<HistoryStats> {
        self.store.action_stats(Utc::now() - Duration::hours(24)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MetricQuery};

    fn actor() -> Actor {
        Actor {
            user_id: "u1".into(),
            email: "u1@sgg.ga".into(),
            role: "admin_sgg".into(),
        }
    }

    #[tokio::test]
    async fn record_business_carries_actor_and_details() {
        let store = MemoryStore::new();
        let hippo = Hippocampus::new(Arc::new(store));
        let id = hippo
            .record_business("MODIFIER", "nomination", "n1", &actor(), json!({"avant": {"s": 1}, "apres": {"s": 2}}), json!({}))
            .await;
        assert!(id.is_some());

        let timeline = hippo.entity_timeline("nomination", "n1", 50).await.unwrap();
        assert_eq!(timeline.len(), 1);
        let rec = &timeline[0].record;
        assert_eq!(rec.categorie, ActionCategory::Metier);
        assert_eq!(rec.user_email.as_deref(), Some("u1@sgg.ga"));
        assert_eq!(rec.details["apres"]["s"], 2);
    }

    #[tokio::test]
    async fn list_normalises_pagination() {
        let hippo = Hippocampus::new(Arc::new(MemoryStore::new()));
        for _ in 0..5 {
            hippo.record(ActionRecord::new("CREER", ActionCategory::Metier, "gar")).await;
        }

        let page = hippo
            .list(&HistoryQuery { page: Some(0), limit: Some(2), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.page, 1);
        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.actions.len(), 2);

        let last = hippo
            .list(&HistoryQuery { page: Some(3), limit: Some(2), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(last.actions.len(), 1);

        let capped = hippo
            .list(&HistoryQuery { limit: Some(10_000), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(capped.total_pages, 1);
    }

    #[tokio::test]
    async fn metrics_cover_categories_totals_and_users() {
        let store = MemoryStore::new();
        let hippo = Hippocampus::new(Arc::new(store.clone()));
        hippo.record(ActionRecord::new("CREER", ActionCategory::Metier, "gar").with_actor(&actor())).await;
        hippo.record(ActionRecord::new("CONFIG", ActionCategory::Systeme, "config")).await;

        hippo.compute_metrics().await;

        let metrics = store
            .list_metrics(&MetricQuery { nom: None, periode: Some("heure".into()), limit: 100 })
            .await
            .unwrap();
        let find = |nom: &str| metrics.iter().filter(|m| m.metric.nom == nom).count();
        assert_eq!(find("hippocampe.actions_par_categorie"), 2);
        let total = metrics.iter().find(|m| m.metric.nom == "hippocampe.actions_totales").unwrap();
        assert_eq!(total.metric.valeur, 2.0);
        let users = metrics.iter().find(|m| m.metric.nom == "hippocampe.utilisateurs_actifs").unwrap();
        assert_eq!(users.metric.valeur, 1.0);
    }

    #[tokio::test]
    async fn stats_rank_users_with_unknown_email_fallback() {
        let hippo = Hippocampus::new(Arc::new(MemoryStore::new()));
        let mut anon = ActionRecord::new("CREER", ActionCategory::Metier, "gar");
        anon.user_id = Some("u9".into());
        hippo.record(anon.clone()).await;
        hippo.record(anon).await;
        hippo.record(ActionRecord::new("CREER", ActionCategory::Metier, "gar").with_actor(&actor())).await;

        let stats = hippo.stats().await.unwrap();
        assert_eq!(stats.total_actions, 3);
        assert_eq!(stats.top_utilisateurs[0].user_id, "u9");
        assert_eq!(stats.top_utilisateurs[0].email, "unknown");
        assert_eq!(stats.top_actions[0].count, 3);
    }

    #[tokio::test]
    async fn purge_keeps_recent_actions() {
        let hippo = Hippocampus::new(Arc::new(MemoryStore::new()));
        hippo.record(ActionRecord::new("CREER", ActionCategory::Metier, "gar")).await;
        assert_eq!(hippo.purge(DEFAULT_RETENTION_DAYS).await.unwrap(), 0);
        assert_eq!(hippo.purge(-1).await.unwrap(), 1);
    }
}
