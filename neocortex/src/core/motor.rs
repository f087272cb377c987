//! # Motor Cortex: Asynchronous Tasks
//!
//! A persistent task queue with retries and exponential backoff. Handlers are
//! registered per task type; a task whose type has no handler fails at once.
//!
//! Retry schedule: after attempt `n` the task becomes runnable again in `2^n`
//! minutes, at most one day later. When the attempts are exhausted the task stays `echoue` and a
//! `TACHE_ECHOUEE` signal is emitted.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::limbic::{EmitOptions, SignalBus};
use crate::core::mailer::{EmailPayload, Mailer, Recipient, TemplateId};
use crate::core::signal::{SignalType, TaskRequest};
use crate::error::{NeocortexError, Result};
use crate::store::{ClaimedTask, Store, TaskFailure, TaskStats};

/// Default number of tasks claimed per run.
pub const DEFAULT_BATCH_SIZE: usize = 10;
/// Default retention of finished tasks, in days.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;
/// Longest wait between two attempts: one day.
pub const MAX_BACKOFF_MINUTES: i64 = 24 * 60;

/// Task type sending a templated e-mail.
pub const TASK_SEND_EMAIL: &str = "ENVOYER_EMAIL";
/// Task type generating a PDF export.
pub const TASK_GENERATE_PDF: &str = "GENERER_PDF";

/// An async task handler: payload in, JSON result out.
pub type TaskHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Counters of one [`Motor::process_pending`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub traitees: usize,
    pub reussies: usize,
    pub echouees: usize,
}

#[derive(Clone)]
pub struct Motor {
    store: Arc<dyn Store>,
    bus: SignalBus,
    handlers: Arc<RwLock<HashMap<String, TaskHandler>>>,
}

impl Motor {
    /// A queue with no handler registered.
    pub fn new(store: Arc<dyn Store>, bus: SignalBus) -> Self {
        Self {
            store,
            bus,
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A queue with the `ENVOYER_EMAIL` and `GENERER_PDF` handlers registered.
    pub fn with_builtin_handlers(store: Arc<dyn Store>, bus: SignalBus, mailer: Mailer) -> Self {
        let motor = Self::new(store, bus);
        motor.register_handler(TASK_SEND_EMAIL, move |payload| {
            let mailer = mailer.clone();
            async move { send_email_task(&mailer, payload).await }
        });
        motor.register_handler(TASK_GENERATE_PDF, |payload| async move {
            Ok(json!({
                "generated": false,
                "message": "PDF generation not yet connected",
                "payload": payload,
            }))
        });
        motor
    }

    /// Registers (or replaces) the handler of a task type.
    pub fn register_handler<F, Fut>(&self, kind: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |payload| Box::pin(handler(payload)));
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(kind.to_string(), handler);
    }

    fn handler(&self, kind: &str) -> Option<TaskHandler> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(kind)
            .cloned()
    }

    /// Queues a task. Priority defaults to 5 and attempts to 3.
    pub async fn create_task(&self, mut task: TaskRequest) -> Result<Uuid> {
        task.priorite.get_or_insert(5);
        task.max_tentatives.get_or_insert(3);
        self.store.insert_task(&task).await
    }

    /// Claims and runs up to `batch` runnable tasks.
    pub async fn process_pending(&self, batch: usize) -> Result<ProcessReport> {
        self.process_due(batch, Utc::now()).await
    }

    /// Claims and runs up to `batch` tasks runnable at `now`.
    ///
    /// A claimed task is always settled: when the store cannot record its
    /// outcome, the task is marked failed and the rest of the batch still runs.
    pub async fn process_due(&self, batch: usize, now: DateTime<Utc>) -> Result<ProcessReport> {
        let tasks = self.store.claim_tasks(batch, now).await?;
        let mut report = ProcessReport { traitees: tasks.len(), ..Default::default() };

        for task in tasks {
            match self.run(&task, now).await {
                Ok(true) => report.reussies += 1,
                Ok(false) => report.echouees += 1,
                Err(e) => {
                    error!("[Moteur] Task {} ({}) outcome not recorded: {}", task.id, task.kind, e);
                    if let Err(e) = self.fail(&task, &e.to_string(), now).await {
                        error!("[Moteur] Task {} could not be marked failed: {}", task.id, e);
                    }
                    report.echouees += 1;
                }
            }
        }
        Ok(report)
    }

    /// Runs one claimed task and records its outcome. `Ok(true)` on success.
    async fn run(&self, task: &ClaimedTask, now: DateTime<Utc>) -> Result<bool> {
        let Some(handler) = self.handler(&task.kind) else {
            let msg = format!("no handler registered for task type: {}", task.kind);
            warn!("[Moteur] {}", msg);
            self.store.reject_task(task.id, &msg, now).await?;
            return Ok(false);
        };

        match handler(task.payload.clone()).await {
            Ok(result) => {
                self.store.complete_task(task.id, &result, now).await?;
                self.emit_outcome(
                    SignalType::TacheTerminee,
                    task,
                    json!({ "type": task.kind, "resultat": result }),
                )
                .await;
                Ok(true)
            }
            Err(e) => {
                self.fail(task, &e.to_string(), now).await?;
                Ok(false)
            }
        }
    }

    async fn fail(&self, task: &ClaimedTask, message: &str, now: DateTime<Utc>) -> Result<()> {
        let definitive = task.tentatives >= task.max_tentatives;
        let failure = TaskFailure {
            erreur: message.to_string(),
            definitive,
            next_run: now + Duration::minutes(backoff_minutes(task.tentatives)),
        };
        self.store.fail_task(task.id, &failure, now).await?;

        if definitive {
            error!("[Moteur] Task {} ({}) failed for good: {}", task.id, task.kind, message);
            self.emit_outcome(
                SignalType::TacheEchouee,
                task,
                json!({ "type": task.kind, "erreur": message, "tentatives": task.tentatives }),
            )
            .await;
        } else {
            warn!(
                "[Moteur] Task {} ({}) attempt {}/{} failed: {}",
                task.id, task.kind, task.tentatives, task.max_tentatives, message
            );
        }
        Ok(())
    }

    async fn emit_outcome(&self, kind: SignalType, task: &ClaimedTask, payload: Value) {
        let id = task.id.to_string();
        if let Err(e) = self
            .bus
            .emit_business(kind, "tache_async", &id, payload, EmitOptions::default())
            .await
        {
            error!("[Moteur] Could not emit {} for {}: {}", kind, id, e);
        }
    }

    /// Cancels a task that is waiting or failed.
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        self.store.cancel_task(id, Utc::now()).await
    }

    pub async fn stats(&self) -> Result<TaskStats> {
        self.store.task_stats(Utc::now() - Duration::hours(24)).await
    }

    /// Deletes finished tasks older than the retention.
    pub async fn purge(&self, retention_days: i64) -> Result<u64> {
        let purged = self
            .store
            .purge_tasks(Utc::now() - Duration::days(retention_days))
            .await?;
        if purged > 0 {
            info!("[Moteur] Purged {} tasks", purged);
        }
        Ok(purged)
    }
}

/// Minutes before the next attempt once `attempts` have failed: `2^attempts`,
/// capped at [`MAX_BACKOFF_MINUTES`].
pub fn backoff_minutes(attempts: i32) -> i64 {
    u32::try_from(attempts.max(0))
        .ok()
        .and_then(|n| 2i64.checked_pow(n))
        .map_or(MAX_BACKOFF_MINUTES, |m| m.min(MAX_BACKOFF_MINUTES))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(Recipient),
    Many(Vec<Recipient>),
}

#[derive(Deserialize)]
struct EmailTask {
    to: OneOrMany,
    template: TemplateId,
    #[serde(default)]
    variables: serde_json::Map<String, Value>,
}

async fn send_email_task(mailer: &Mailer, payload: Value) -> Result<Value> {
    let task: EmailTask = serde_json::from_value(payload)
        .map_err(|e| NeocortexError::InvalidInput(format!("email task payload: {}", e)))?;
    let to = match task.to {
        OneOrMany::One(r) => vec![r],
        OneOrMany::Many(rs) => rs,
    };
    let high_priority = task.template == TemplateId::RapportRejete;
    let result = mailer
        .send(&EmailPayload {
            to,
            template: task.template,
            variables: task.variables,
            cc: Vec::new(),
            high_priority,
        })
        .await;
    Ok(json!({
        "sent": result.success,
        "messageId": result.message_id,
        "dryRun": result.dry_run,
    }))
}
