//! # Persistence Port
//!
//! Every cortex module persists through the [`Store`] trait so the same logic
//! runs against PostgreSQL in production and against [`MemoryStore`] in tests
//! and single-node deployments.
//!
//! Time windows are passed in explicitly (`since`, `now`) instead of being read
//! from the clock inside the backend; this keeps both backends in agreement
//! and makes retention rules testable.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::signal::{
    ActionCategory, ActionRecord, Metric, Notification, NotificationChannel, NotificationKind,
    Priority, Signal, StoredSignal, TaskRequest, TaskStatus,
};
use crate::error::Result;

/// In-memory backend.
pub mod memory;

pub use memory::MemoryStore;

// ============================================================================
// Signals
// ============================================================================

/// A `(key, count)` pair used by the statistics queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCount {
    pub key: String,
    pub count: u64,
}

/// Number of signals of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCount {
    #[serde(rename = "type")]
    pub kind: String,
    pub count: u64,
}

impl From<KeyCount> for TypeCount {
    fn from(kc: KeyCount) -> Self {
        Self { kind: kc.key, count: kc.count }
    }
}

/// Aggregates over the signal table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalStats {
    pub total: u64,
    pub non_traites: u64,
    /// Per priority over the window, keyed by wire name (`{"HIGH": 3}`).
    pub par_priorite: BTreeMap<String, u64>,
    /// Top ten types over the window.
    pub par_type: Vec<TypeCount>,
    pub derniere24h: u64,
}

// ============================================================================
// Audit trail
// ============================================================================

/// Filters for the audit trail listing. `limit` and `offset` are already normalised.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryFilter {
    pub entite_type: Option<String>,
    pub entite_id: Option<String>,
    pub user_id: Option<String>,
    pub categorie: Option<ActionCategory>,
    pub action: Option<String>,
    pub date_debut: Option<DateTime<Utc>>,
    pub date_fin: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    /// Whether a stored action passes every set filter.
    pub fn matches(&self, entry: &StoredAction) -> bool {
        let r = &entry.record;
        self.entite_type.as_ref().is_none_or(|v| &r.entite_type == v)
            && self.entite_id.as_ref().is_none_or(|v| r.entite_id.as_ref() == Some(v))
            && self.user_id.as_ref().is_none_or(|v| r.user_id.as_ref() == Some(v))
            && self.categorie.is_none_or(|v| r.categorie == v)
            && self.action.as_ref().is_none_or(|v| &r.action == v)
            && self.date_debut.is_none_or(|d| entry.created_at >= d)
            && self.date_fin.is_none_or(|d| entry.created_at <= d)
    }
}

/// An audited action as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAction {
    pub id: Uuid,
    #[serde(flatten)]
    pub record: ActionRecord,
    pub created_at: DateTime<Utc>,
}

/// Activity aggregates used by the hourly metrics job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub per_category: Vec<KeyCount>,
    pub total: u64,
    pub distinct_users: u64,
}

/// A user ranked by activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserActivity {
    pub user_id: String,
    pub email: String,
    pub count: u64,
}

/// Aggregates over the audit trail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total_actions: u64,
    pub derniere24h: u64,
    pub par_categorie: Vec<KeyCount>,
    pub top_actions: Vec<KeyCount>,
    pub top_utilisateurs: Vec<UserActivity>,
}

// ============================================================================
// Configuration & weights
// ============================================================================

/// A dynamic configuration entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEntry {
    pub cle: String,
    pub valeur: Value,
    pub description: Option<String>,
    pub categorie: Option<String>,
    pub version: i32,
    pub modifie_par: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// An adaptive weight for a `(signal type, rule)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveWeight {
    pub regle: String,
    pub poids: f64,
    pub reussites: i64,
    pub echecs: i64,
}

// ============================================================================
// Notifications
// ============================================================================

/// Listing options for one user's notifications. `limit` is already capped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationQuery {
    pub unread_only: bool,
    pub kind: Option<NotificationKind>,
    pub limit: usize,
    pub offset: usize,
}

/// A notification as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredNotification {
    pub id: Uuid,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub canal: NotificationChannel,
    pub titre: String,
    pub message: String,
    pub lien: Option<String>,
    pub entite_type: Option<String>,
    pub entite_id: Option<String>,
    pub signal_id: Option<Uuid>,
    pub expire_at: Option<DateTime<Utc>>,
    pub lu: bool,
    pub lu_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl StoredNotification {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_none_or(|e| e > now)
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// A task claimed for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub kind: String,
    pub payload: Value,
    pub tentatives: i32,
    pub max_tentatives: i32,
}

/// How a failed attempt leaves the task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub erreur: String,
    /// `true` once the attempts are exhausted.
    pub definitive: bool,
    pub next_run: DateTime<Utc>,
}

/// Count of tasks per `(type, status)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTypeCount {
    #[serde(rename = "type")]
    pub kind: String,
    pub statut: TaskStatus,
    pub count: u64,
}

/// Aggregates over the task queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub en_attente: u64,
    pub en_cours: u64,
    pub terminees24h: u64,
    pub echouees24h: u64,
    pub par_type: Vec<TaskTypeCount>,
}

// ============================================================================
// Metrics
// ============================================================================

/// Metric listing filters. `limit` is already capped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub nom: Option<String>,
    pub periode: Option<String>,
    pub limit: usize,
}

/// A metric as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMetric {
    #[serde(flatten)]
    pub metric: Metric,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// The port
// ============================================================================

/// Persistence operations of the nervous system.
#[async_trait]
pub trait Store: Send + Sync {
    /// Health check of the backend.
    async fn ping(&self) -> Result<()>;

    // --- signals ---
    async fn insert_signal(&self, signal: &Signal) -> Result<Uuid>;
    async fn mark_signal_processed(&self, id: Uuid) -> Result<()>;
    async fn mark_signal_error(&self, id: Uuid, error: &str) -> Result<()>;
    /// Unprocessed signals, most urgent first, then oldest first.
    async fn pending_signals(&self, limit: usize) -> Result<Vec<StoredSignal>>;
    async fn count_pending_signals(&self) -> Result<u64>;
    /// Removes processed signals past their TTL or older than `retention_cutoff`.
    async fn purge_signals(&self, now: DateTime<Utc>, retention_cutoff: DateTime<Utc>) -> Result<u64>;
    async fn signal_stats(&self, since: DateTime<Utc>) -> Result<SignalStats>;

    // --- audit trail ---
    async fn insert_action(&self, record: &ActionRecord) -> Result<Uuid>;
    /// Newest first, with the total matching count.
    async fn list_actions(&self, filter: &HistoryFilter, limit: usize, offset: usize) -> Result<(Vec<StoredAction>, u64)>;
    async fn entity_timeline(&self, entite_type: &str, entite_id: &str, limit: usize) -> Result<Vec<StoredAction>>;
    async fn activity_since(&self, since: DateTime<Utc>) -> Result<ActivitySnapshot>;
    async fn purge_actions(&self, before: DateTime<Utc>) -> Result<u64>;
    async fn action_stats(&self, since: DateTime<Utc>) -> Result<HistoryStats>;

    // --- configuration ---
    async fn get_config(&self, key: &str) -> Result<Option<ConfigEntry>>;
    async fn upsert_config(&self, key: &str, value: &Value, description: Option<&str>, modified_by: Option<&str>) -> Result<ConfigEntry>;
    /// One category ordered by key, or everything ordered by category then key.
    async fn list_configs(&self, category: Option<&str>) -> Result<Vec<ConfigEntry>>;

    // --- adaptive weights ---
    /// Heaviest first.
    async fn list_weights(&self, signal_type: &str) -> Result<Vec<AdaptiveWeight>>;
    /// Adds `delta` clamped into `[0, 1]`; `None` when the pair does not exist.
    async fn adjust_weight(&self, signal_type: &str, rule: &str, delta: f64, success: bool) -> Result<Option<f64>>;
    /// Creates the pair with one recorded outcome; does nothing if it already exists.
    async fn insert_weight(&self, signal_type: &str, rule: &str, weight: f64, success: bool) -> Result<()>;

    // --- notifications ---
    async fn insert_notification(&self, notification: &Notification) -> Result<Uuid>;
    async fn mark_notification_read(&self, id: Uuid, user_id: &str, now: DateTime<Utc>) -> Result<bool>;
    async fn mark_all_notifications_read(&self, user_id: &str, now: DateTime<Utc>) -> Result<u64>;
    /// Live notifications of a user, newest first.
    async fn list_notifications(&self, user_id: &str, query: &NotificationQuery, now: DateTime<Utc>) -> Result<Vec<StoredNotification>>;
    async fn count_unread_notifications(&self, user_id: &str, now: DateTime<Utc>) -> Result<u64>;
    /// Removes expired notifications and read ones older than `read_cutoff`.
    async fn purge_notifications(&self, now: DateTime<Utc>, read_cutoff: DateTime<Utc>) -> Result<u64>;
    /// Ids of the active users holding `role`.
    async fn active_users_with_role(&self, role: &str) -> Result<Vec<String>>;

    // --- tasks ---
    async fn insert_task(&self, task: &TaskRequest) -> Result<Uuid>;
    /// Claims runnable tasks, moving them to `en_cours` and counting the attempt.
    async fn claim_tasks(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<ClaimedTask>>;
    async fn complete_task(&self, id: Uuid, result: &Value, now: DateTime<Utc>) -> Result<()>;
    async fn fail_task(&self, id: Uuid, failure: &TaskFailure, now: DateTime<Utc>) -> Result<()>;
    /// Marks a task failed without scheduling a retry time (no handler).
    async fn reject_task(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()>;
    async fn cancel_task(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;
    async fn task_stats(&self, since: DateTime<Utc>) -> Result<TaskStats>;
    async fn purge_tasks(&self, before: DateTime<Utc>) -> Result<u64>;

    // --- metrics ---
    async fn insert_metrics(&self, metrics: &[Metric]) -> Result<()>;
    async fn list_metrics(&self, query: &MetricQuery) -> Result<Vec<StoredMetric>>;
}

/// Sort key shared by the backends for the signal backlog.
pub fn backlog_order(priority: Priority, created_at: DateTime<Utc>) -> (u8, DateTime<Utc>) {
    (priority.rank(), created_at)
}

/// Keeps the `n` largest counts, ties broken by key.
pub(crate) fn top_counts(mut counts: Vec<KeyCount>, n: usize) -> Vec<KeyCount> {
    counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    counts.truncate(n);
    counts
}

/// Category of a configuration key: the segment before the first dot.
pub fn config_category(key: &str) -> Option<String> {
    key.split_once('.').map(|(head, _)| head.to_string())
}
