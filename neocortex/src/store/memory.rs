//! # In-Memory Store
//!
//! A [`Store`] kept behind a single `std::sync::Mutex`. The lock is never held
//! across an `.await`, so the async methods only wrap synchronous sections.
//!
//! Used by the tests and by single-node deployments started without
//! `DATABASE_URL`; nothing survives a restart.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{
    backlog_order, config_category, top_counts, ActivitySnapshot, AdaptiveWeight, ClaimedTask,
    ConfigEntry, HistoryFilter, HistoryStats, KeyCount, MetricQuery, NotificationQuery, SignalStats, TypeCount,
    Store, StoredAction, StoredMetric, StoredNotification, TaskFailure, TaskStats, TaskTypeCount,
    UserActivity,
};
use crate::core::signal::{
    ActionRecord, Metric, Notification, Signal, StoredSignal, TaskRequest, TaskStatus,
};
use crate::error::Result;

#[derive(Debug, Clone)]
struct TaskRow {
    id: Uuid,
    kind: String,
    payload: Value,
    priorite: i32,
    statut: TaskStatus,
    tentatives: i32,
    max_tentatives: i32,
    prochaine_exec: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    resultat: Option<Value>,
    erreur: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct WeightRow {
    signal_type: String,
    weight: AdaptiveWeight,
}

#[derive(Debug, Clone)]
struct UserRow {
    role: String,
    active: bool,
}

#[derive(Default)]
struct Inner {
    signals: Vec<StoredSignal>,
    actions: Vec<StoredAction>,
    configs: BTreeMap<String, ConfigEntry>,
    weights: Vec<WeightRow>,
    notifications: Vec<StoredNotification>,
    tasks: Vec<TaskRow>,
    metrics: Vec<StoredMetric>,
    users: HashMap<String, UserRow>,
}

/// Process-local store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user for role based notification fan-out.
    pub fn add_user(&self, user_id: &str, role: &str, active: bool) {
        self.lock().users.insert(
            user_id.to_string(),
            UserRow { role: role.to_string(), active },
        );
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn count_by<I: Iterator<Item = String>>(keys: I) -> Vec<KeyCount> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for key in keys {
        *counts.entry(key).or_default() += 1;
    }
    counts.into_iter().map(|(key, count)| KeyCount { key, count }).collect()
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------------

    async fn insert_signal(&self, signal: &Signal) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.lock().signals.push(StoredSignal {
            id,
            signal: signal.clone(),
            traite: false,
            erreur: None,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn mark_signal_processed(&self, id: Uuid) -> Result<()> {
        if let Some(s) = self.lock().signals.iter_mut().find(|s| s.id == id) {
            s.traite = true;
        }
        Ok(())
    }

    async fn mark_signal_error(&self, id: Uuid, error: &str) -> Result<()> {
        if let Some(s) = self.lock().signals.iter_mut().find(|s| s.id == id) {
            s.erreur = Some(error.to_string());
        }
        Ok(())
    }

    async fn pending_signals(&self, limit: usize) -> Result<Vec<StoredSignal>> {
        let inner = self.lock();
        let mut pending: Vec<StoredSignal> =
            inner.signals.iter().filter(|s| !s.traite).cloned().collect();
        pending.sort_by_key(|s| backlog_order(s.signal.priorite, s.created_at));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn count_pending_signals(&self) -> Result<u64> {
        Ok(self.lock().signals.iter().filter(|s| !s.traite).count() as u64)
    }

    async fn purge_signals(&self, now: DateTime<Utc>, retention_cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.signals.len();
        inner.signals.retain(|s| {
            if !s.traite {
                return true;
            }
            let expired = s
                .signal
                .ttl_seconds
                .is_some_and(|ttl| s.created_at + Duration::seconds(ttl) < now);
            !(expired || s.created_at < retention_cutoff)
        });
        Ok((before - inner.signals.len()) as u64)
    }

    async fn signal_stats(&self, since: DateTime<Utc>) -> Result<SignalStats> {
        let inner = self.lock();
        let recent: Vec<&StoredSignal> =
            inner.signals.iter().filter(|s| s.created_at > since).collect();
        let par_priorite = count_by(recent.iter().map(|s| s.signal.priorite.to_string()))
            .into_iter()
            .map(|kc| (kc.key, kc.count))
            .collect();
        let par_type = top_counts(count_by(recent.iter().map(|s| s.signal.kind.to_string())), 10);
        Ok(SignalStats {
            total: inner.signals.len() as u64,
            non_traites: inner.signals.iter().filter(|s| !s.traite).count() as u64,
            par_priorite,
            par_type: par_type.into_iter().map(TypeCount::from).collect(),
            derniere24h: recent.len() as u64,
        })
    }

    // ------------------------------------------------------------------------
    // Audit trail
    // ------------------------------------------------------------------------

    async fn insert_action(&self, record: &ActionRecord) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.lock().actions.push(StoredAction {
            id,
            record: record.clone(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn list_actions(&self, filter: &HistoryFilter, limit: usize, offset: usize) -> Result<(Vec<StoredAction>, u64)> {
        let inner = self.lock();
        // Newest first; insertion order breaks timestamp ties.
        let matching: Vec<&StoredAction> =
            inner.actions.iter().rev().filter(|a| filter.matches(a)).collect();
        let total = matching.len() as u64;
        let mut items: Vec<StoredAction> = matching.into_iter().cloned().collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let items = items.into_iter().skip(offset).take(limit).collect();
        Ok((items, total))
    }

    async fn entity_timeline(&self, entite_type: &str, entite_id: &str, limit: usize) -> Result<Vec<StoredAction>> {
        let filter = HistoryFilter {
            entite_type: Some(entite_type.to_string()),
            entite_id: Some(entite_id.to_string()),
            ..Default::default()
        };
        Ok(self.list_actions(&filter, limit, 0).await?.0)
    }

    async fn activity_since(&self, since: DateTime<Utc>) -> Result<ActivitySnapshot> {
        let inner = self.lock();
        let recent: Vec<&StoredAction> =
            inner.actions.iter().filter(|a| a.created_at > since).collect();
        let users: HashSet<&String> =
            recent.iter().filter_map(|a| a.record.user_id.as_ref()).collect();
        let mut per_category = count_by(recent.iter().map(|a| a.record.categorie.to_string()));
        per_category.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(ActivitySnapshot {
            per_category,
            total: recent.len() as u64,
            distinct_users: users.len() as u64,
        })
    }

    async fn purge_actions(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let count = inner.actions.len();
        inner.actions.retain(|a| a.created_at >= before);
        Ok((count - inner.actions.len()) as u64)
    }

    async fn action_stats(&self, since: DateTime<Utc>) -> Result<HistoryStats> {
        let inner = self.lock();
        let recent: Vec<&StoredAction> =
            inner.actions.iter().filter(|a| a.created_at > since).collect();

        let mut per_user: HashMap<&str, (String, u64)> = HashMap::new();
        for a in &recent {
            if let Some(uid) = a.record.user_id.as_deref() {
                let entry = per_user.entry(uid).or_insert_with(|| {
                    (a.record.user_email.clone().unwrap_or_else(|| "unknown".into()), 0)
                });
                entry.1 += 1;
            }
        }
        let mut top_utilisateurs: Vec<UserActivity> = per_user
            .into_iter()
            .map(|(uid, (email, count))| UserActivity { user_id: uid.to_string(), email, count })
            .collect();
        top_utilisateurs.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.user_id.cmp(&b.user_id)));
        top_utilisateurs.truncate(10);

        let mut par_categorie = count_by(recent.iter().map(|a| a.record.categorie.to_string()));
        par_categorie.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));

        Ok(HistoryStats {
            total_actions: inner.actions.len() as u64,
            derniere24h: recent.len() as u64,
            par_categorie,
            top_actions: top_counts(count_by(recent.iter().map(|a| a.record.action.clone())), 10),
            top_utilisateurs,
        })
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    async fn get_config(&self, key: &str) -> Result<Option<ConfigEntry>> {
        Ok(self.lock().configs.get(key).cloned())
    }

    async fn upsert_config(&self, key: &str, value: &Value, description: Option<&str>, modified_by: Option<&str>) -> Result<ConfigEntry> {
        let mut inner = self.lock();
        let now = Utc::now();
        let entry = inner
            .configs
            .entry(key.to_string())
            .and_modify(|e| {
                e.valeur = value.clone();
                e.modifie_par = modified_by.map(str::to_string);
                e.updated_at = now;
                e.version += 1;
            })
            .or_insert_with(|| ConfigEntry {
                cle: key.to_string(),
                valeur: value.clone(),
                description: description.map(str::to_string),
                categorie: config_category(key),
                version: 1,
                modifie_par: modified_by.map(str::to_string),
                updated_at: now,
            });
        Ok(entry.clone())
    }

    async fn list_configs(&self, category: Option<&str>) -> Result<Vec<ConfigEntry>> {
        let inner = self.lock();
        let mut entries: Vec<ConfigEntry> = match category {
            Some(cat) => inner
                .configs
                .values()
                .filter(|e| e.categorie.as_deref() == Some(cat))
                .cloned()
                .collect(),
            None => inner.configs.values().cloned().collect(),
        };
        // Uncategorised entries sort last, as NULLs do in PostgreSQL.
        entries.sort_by(|a, b| {
            (a.categorie.is_none(), &a.categorie, &a.cle).cmp(&(b.categorie.is_none(), &b.categorie, &b.cle))
        });
        Ok(entries)
    }

    // ------------------------------------------------------------------------
    // Adaptive weights
    // ------------------------------------------------------------------------

    async fn list_weights(&self, signal_type: &str) -> Result<Vec<AdaptiveWeight>> {
        let inner = self.lock();
        let mut weights: Vec<AdaptiveWeight> = inner
            .weights
            .iter()
            .filter(|w| w.signal_type == signal_type)
            .map(|w| w.weight.clone())
            .collect();
        weights.sort_by(|a, b| b.poids.total_cmp(&a.poids));
        Ok(weights)
    }

    async fn adjust_weight(&self, signal_type: &str, rule: &str, delta: f64, success: bool) -> Result<Option<f64>> {
        let mut inner = self.lock();
        let Some(row) = inner
            .weights
            .iter_mut()
            .find(|w| w.signal_type == signal_type && w.weight.regle == rule)
        else {
            return Ok(None);
        };
        row.weight.poids = (row.weight.poids + delta).clamp(0.0, 1.0);
        if success {
            row.weight.reussites += 1;
        } else {
            row.weight.echecs += 1;
        }
        Ok(Some(row.weight.poids))
    }

    async fn insert_weight(&self, signal_type: &str, rule: &str, weight: f64, success: bool) -> Result<()> {
        let mut inner = self.lock();
        let exists = inner
            .weights
            .iter()
            .any(|w| w.signal_type == signal_type && w.weight.regle == rule);
        if !exists {
            inner.weights.push(WeightRow {
                signal_type: signal_type.to_string(),
                weight: AdaptiveWeight {
                    regle: rule.to_string(),
                    poids: weight,
                    reussites: i64::from(success),
                    echecs: i64::from(!success),
                },
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------------

    async fn insert_notification(&self, n: &Notification) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.lock().notifications.push(StoredNotification {
            id,
            user_id: n.user_id.clone(),
            kind: n.kind,
            canal: n.canal,
            titre: n.titre.clone(),
            message: n.message.clone(),
            lien: n.lien.clone(),
            entite_type: n.entite_type.clone(),
            entite_id: n.entite_id.clone(),
            signal_id: n.signal_id,
            expire_at: n.expire_at,
            lu: false,
            lu_at: None,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn mark_notification_read(&self, id: Uuid, user_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock();
        match inner.notifications.iter_mut().find(|n| n.id == id && n.user_id == user_id) {
            Some(n) => {
                n.lu = true;
                n.lu_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_all_notifications_read(&self, user_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let mut count = 0;
        for n in inner.notifications.iter_mut().filter(|n| n.user_id == user_id && !n.lu) {
            n.lu = true;
            n.lu_at = Some(now);
            count += 1;
        }
        Ok(count)
    }

    async fn list_notifications(&self, user_id: &str, query: &NotificationQuery, now: DateTime<Utc>) -> Result<Vec<StoredNotification>> {
        let inner = self.lock();
        let mut items: Vec<StoredNotification> = inner
            .notifications
            .iter()
            .rev()
            .filter(|n| n.user_id == user_id && n.is_live(now))
            .filter(|n| !query.unread_only || !n.lu)
            .filter(|n| query.kind.is_none_or(|k| n.kind == k))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items.into_iter().skip(query.offset).take(query.limit).collect())
    }

    async fn count_unread_notifications(&self, user_id: &str, now: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .lock()
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id && !n.lu && n.is_live(now))
            .count() as u64)
    }

    async fn purge_notifications(&self, now: DateTime<Utc>, read_cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.notifications.len();
        inner
            .notifications
            .retain(|n| n.is_live(now) && !(n.lu && n.created_at < read_cutoff));
        Ok((before - inner.notifications.len()) as u64)
    }

    async fn active_users_with_role(&self, role: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .lock()
            .users
            .iter()
            .filter(|(_, u)| u.active && u.role == role)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    // ------------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------------

    async fn insert_task(&self, task: &TaskRequest) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.lock().tasks.push(TaskRow {
            id,
            kind: task.kind.clone(),
            payload: task.payload.clone(),
            priorite: task.priorite.unwrap_or(5),
            statut: TaskStatus::Pending,
            tentatives: 0,
            max_tentatives: task.max_tentatives.unwrap_or(3),
            prochaine_exec: now,
            completed_at: None,
            resultat: None,
            erreur: None,
            created_at: now,
        });
        Ok(id)
    }

    async fn claim_tasks(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<ClaimedTask>> {
        let mut inner = self.lock();
        let mut runnable: Vec<&mut TaskRow> = inner
            .tasks
            .iter_mut()
            .filter(|t| matches!(t.statut, TaskStatus::Pending | TaskStatus::Failed))
            .filter(|t| t.tentatives < t.max_tentatives && t.prochaine_exec <= now)
            .collect();
        runnable.sort_by_key(|t| (t.priorite, t.created_at));

        let claimed = runnable
            .into_iter()
            .take(limit)
            .map(|t| {
                t.statut = TaskStatus::Running;
                t.tentatives += 1;
                ClaimedTask {
                    id: t.id,
                    kind: t.kind.clone(),
                    payload: t.payload.clone(),
                    tentatives: t.tentatives,
                    max_tentatives: t.max_tentatives,
                }
            })
            .collect();
        Ok(claimed)
    }

    async fn complete_task(&self, id: Uuid, result: &Value, now: DateTime<Utc>) -> Result<()> {
        if let Some(t) = self.lock().tasks.iter_mut().find(|t| t.id == id) {
            t.statut = TaskStatus::Done;
            t.resultat = Some(result.clone());
            t.completed_at = Some(now);
        }
        Ok(())
    }

    async fn fail_task(&self, id: Uuid, failure: &TaskFailure, now: DateTime<Utc>) -> Result<()> {
        if let Some(t) = self.lock().tasks.iter_mut().find(|t| t.id == id) {
            t.erreur = Some(failure.erreur.clone());
            t.prochaine_exec = failure.next_run;
            if failure.definitive {
                t.statut = TaskStatus::Failed;
                t.completed_at = Some(now);
            } else {
                t.statut = TaskStatus::Pending;
                t.completed_at = None;
            }
        }
        Ok(())
    }

    async fn reject_task(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(t) = self.lock().tasks.iter_mut().find(|t| t.id == id) {
            t.statut = TaskStatus::Failed;
            t.erreur = Some(error.to_string());
            t.completed_at = Some(now);
        }
        Ok(())
    }

    async fn cancel_task(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock();
        match inner.tasks.iter_mut().find(|t| {
            t.id == id && matches!(t.statut, TaskStatus::Pending | TaskStatus::Failed)
        }) {
            Some(t) => {
                t.statut = TaskStatus::Cancelled;
                t.completed_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn task_stats(&self, since: DateTime<Utc>) -> Result<TaskStats> {
        let inner = self.lock();
        let finished_since = |status: TaskStatus| {
            inner
                .tasks
                .iter()
                .filter(|t| t.statut == status && t.completed_at.is_some_and(|c| c > since))
                .count() as u64
        };

        let mut per_type: HashMap<(String, TaskStatus), u64> = HashMap::new();
        for t in inner.tasks.iter().filter(|t| t.created_at > since) {
            *per_type.entry((t.kind.clone(), t.statut)).or_default() += 1;
        }
        let mut par_type: Vec<TaskTypeCount> = per_type
            .into_iter()
            .map(|((kind, statut), count)| TaskTypeCount { kind, statut, count })
            .collect();
        par_type.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.kind.cmp(&b.kind)));
        par_type.truncate(20);

        Ok(TaskStats {
            en_attente: inner.tasks.iter().filter(|t| t.statut == TaskStatus::Pending).count() as u64,
            en_cours: inner.tasks.iter().filter(|t| t.statut == TaskStatus::Running).count() as u64,
            terminees24h: finished_since(TaskStatus::Done),
            echouees24h: finished_since(TaskStatus::Failed),
            par_type,
        })
    }

    async fn purge_tasks(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let count = inner.tasks.len();
        inner.tasks.retain(|t| {
            let finished = matches!(t.statut, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled);
            !(finished && t.completed_at.is_some_and(|c| c < before))
        });
        Ok((count - inner.tasks.len()) as u64)
    }

    // ------------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------------

    async fn insert_metrics(&self, metrics: &[Metric]) -> Result<()> {
        let now = Utc::now();
        self.lock().metrics.extend(metrics.iter().map(|m| StoredMetric {
            metric: m.clone(),
            created_at: now,
        }));
        Ok(())
    }

    async fn list_metrics(&self, query: &MetricQuery) -> Result<Vec<StoredMetric>> {
        let inner = self.lock();
        let mut items: Vec<StoredMetric> = inner
            .metrics
            .iter()
            .rev()
            .filter(|m| query.nom.as_ref().is_none_or(|n| &m.metric.nom == n))
            .filter(|m| query.periode.as_ref().is_none_or(|p| &m.metric.periode == p))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(query.limit);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signal::{ActionCategory, CortexModule, Endpoint, Priority, SignalType};
    use serde_json::json;

    fn signal(kind: SignalType, priorite: Priority) -> Signal {
        Signal {
            kind,
            source: Endpoint::Cortex(CortexModule::Limbique),
            destination: None,
            entite_type: None,
            entite_id: None,
            payload: json!({}),
            confiance: 1.0,
            priorite,
            correlation_id: Uuid::new_v4(),
            parent_signal_id: None,
            ttl_seconds: None,
        }
    }

    #[tokio::test]
    async fn store_keeps_working_after_a_panic_under_the_lock() {
        let store = MemoryStore::new();
        let holder = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.lock();
            panic!("handler panicked");
        })
        .join();
        assert!(store.inner.is_poisoned());

        store.insert_signal(&signal(SignalType::JoPublication, Priority::Normal)).await.unwrap();
        assert_eq!(store.count_pending_signals().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn backlog_is_ordered_by_rank_then_age() {
        let store = MemoryStore::new();
        store.insert_signal(&signal(SignalType::UtilisateurCree, Priority::Low)).await.unwrap();
        store.insert_signal(&signal(SignalType::NominationCreee, Priority::Normal)).await.unwrap();
        store.insert_signal(&signal(SignalType::SecuriteBruteForce, Priority::Critical)).await.unwrap();
        store.insert_signal(&signal(SignalType::JoPublication, Priority::Normal)).await.unwrap();

        let pending = store.pending_signals(10).await.unwrap();
        let kinds: Vec<SignalType> = pending.iter().map(|s| s.signal.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SignalType::SecuriteBruteForce,
                SignalType::NominationCreee,
                SignalType::JoPublication,
                SignalType::UtilisateurCree,
            ]
        );
    }

    #[tokio::test]
    async fn purge_only_touches_processed_signals() {
        let store = MemoryStore::new();
        let done = store.insert_signal(&signal(SignalType::JoPublication, Priority::Normal)).await.unwrap();
        store.insert_signal(&signal(SignalType::JoPublication, Priority::Normal)).await.unwrap();
        store.mark_signal_processed(done).await.unwrap();

        let future = Utc::now() + Duration::days(1);
        assert_eq!(store.purge_signals(future, future).await.unwrap(), 1);
        assert_eq!(store.count_pending_signals().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn purge_honours_signal_ttl() {
        let store = MemoryStore::new();
        let mut short = signal(SignalType::CacheInvalide, Priority::Normal);
        short.ttl_seconds = Some(60);
        let id = store.insert_signal(&short).await.unwrap();
        store.mark_signal_processed(id).await.unwrap();

        let now = Utc::now();
        let old_cutoff = now - Duration::days(30);
        assert_eq!(store.purge_signals(now, old_cutoff).await.unwrap(), 0);
        assert_eq!(store.purge_signals(now + Duration::minutes(2), old_cutoff).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn config_upsert_bumps_version_and_keeps_description() {
        let store = MemoryStore::new();
        let first = store.upsert_config("signal.batch_size", &json!(100), Some("batch"), None).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.categorie.as_deref(), Some("signal"));

        let second = store.upsert_config("signal.batch_size", &json!(50), None, Some("u1")).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.valeur, json!(50));
        assert_eq!(second.description.as_deref(), Some("batch"));
        assert_eq!(second.modifie_par.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn configs_list_by_category_then_key() {
        let store = MemoryStore::new();
        store.upsert_config("signal.b", &json!(1), None, None).await.unwrap();
        store.upsert_config("moteur.a", &json!(1), None, None).await.unwrap();
        store.upsert_config("signal.a", &json!(1), None, None).await.unwrap();

        let all: Vec<String> = store.list_configs(None).await.unwrap().into_iter().map(|e| e.cle).collect();
        assert_eq!(all, vec!["moteur.a", "signal.a", "signal.b"]);
        let signal_only = store.list_configs(Some("signal")).await.unwrap();
        assert_eq!(signal_only.len(), 2);
    }

    #[tokio::test]
    async fn claim_respects_priority_attempts_and_schedule() {
        let store = MemoryStore::new();
        let mut low = TaskRequest::new("A", json!({}));
        low.priorite = Some(9);
        let mut high = TaskRequest::new("B", json!({}));
        high.priorite = Some(1);
        let low_id = store.insert_task(&low).await.unwrap();
        store.insert_task(&high).await.unwrap();

        let now = Utc::now();
        let claimed = store.claim_tasks(1, now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].kind, "B");
        assert_eq!(claimed[0].tentatives, 1);

        let failure = TaskFailure {
            erreur: "boom".into(),
            definitive: false,
            next_run: now + Duration::minutes(2),
        };
        let claimed = store.claim_tasks(5, now).await.unwrap();
        assert_eq!(claimed[0].id, low_id);
        store.fail_task(low_id, &failure, now).await.unwrap();
        assert!(store.claim_tasks(5, now).await.unwrap().is_empty());
        assert_eq!(store.claim_tasks(5, now + Duration::minutes(3)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_only_waiting_tasks() {
        let store = MemoryStore::new();
        let id = store.insert_task(&TaskRequest::new("A", json!({}))).await.unwrap();
        let now = Utc::now();
        store.claim_tasks(1, now).await.unwrap();
        assert!(!store.cancel_task(id, now).await.unwrap());

        let other = store.insert_task(&TaskRequest::new("A", json!({}))).await.unwrap();
        assert!(store.cancel_task(other, now).await.unwrap());
    }

    #[tokio::test]
    async fn history_filter_and_pagination() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let mut r = ActionRecord::new("CREER", ActionCategory::Metier, "nomination");
            r.entite_id = Some(format!("n{}", i % 2));
            store.insert_action(&r).await.unwrap();
        }
        store
            .insert_action(&ActionRecord::new("CONFIG", ActionCategory::Systeme, "config"))
            .await
            .unwrap();

        let filter = HistoryFilter {
            entite_type: Some("nomination".into()),
            ..Default::default()
        };
        let (items, total) = store.list_actions(&filter, 2, 0).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(items.len(), 2);

        let timeline = store.entity_timeline("nomination", "n0", 50).await.unwrap();
        assert_eq!(timeline.len(), 3);
    }

    #[tokio::test]
    async fn roles_only_list_active_users() {
        let store = MemoryStore::new();
        store.add_user("u1", "admin_sgg", true);
        store.add_user("u2", "admin_sgg", false);
        store.add_user("u3", "sg_ministere", true);
        assert_eq!(store.active_users_with_role("admin_sgg").await.unwrap(), vec!["u1"]);
    }
}
