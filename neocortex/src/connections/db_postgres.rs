//! # PostgreSQL Store
//!
//! [`Store`] over a `deadpool-postgres` pool. Tables live in the `neocortex`
//! schema created by `migrations/neocortex.sql` (see [`PgStore::migrate`]).
//!
//! Task claiming uses `FOR UPDATE SKIP LOCKED`, so several workers can drain
//! the same queue without taking a task twice.

use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config as DeadpoolConfig, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime};
use serde_json::Value;
use tokio_postgres::types::FromSql;
use tokio_postgres::{NoTls, Row};
use tracing::info;
use uuid::Uuid;

use crate::core::signal::{
    ActionRecord, Endpoint, Metric, Notification, Priority, Signal, StoredSignal, TaskRequest,
    TaskStatus,
};
use crate::error::{NeocortexError, Result};
use crate::store::{
    config_category, ActivitySnapshot, AdaptiveWeight, ClaimedTask, ConfigEntry, HistoryFilter,
    HistoryStats, KeyCount, MetricQuery, NotificationQuery, SignalStats, Store, StoredAction, TypeCount,
    StoredMetric, StoredNotification, TaskFailure, TaskStats, TaskTypeCount, UserActivity,
};

/// Schema applied by [`PgStore::migrate`].
pub const MIGRATION: &str = include_str!("../../migrations/neocortex.sql");

const SIGNAL_COLUMNS: &str = "id, type, source, destination, entite_type, entite_id, payload, \
     confiance, priorite, correlation_id, parent_signal_id, ttl_seconds, traite, erreur, created_at";

const ACTION_COLUMNS: &str = "id, action, categorie, entite_type, entite_id, user_id, user_email, \
     user_role, details, metadata, correlation_id, duration_ms, created_at";

const CONFIG_COLUMNS: &str = "cle, valeur, description, categorie, version, modifie_par, updated_at";

const NOTIFICATION_COLUMNS: &str = "id, user_id, type, canal, titre, message, lien, entite_type, \
     entite_id, signal_id, expire_at, lu, lu_at, created_at";

/// Matches every optional filter of the audit trail listing; `$1..$7`.
const HISTORY_WHERE: &str = "($1::text IS NULL OR entite_type = $1) \
     AND ($2::text IS NULL OR entite_id = $2) \
     AND ($3::text IS NULL OR user_id = $3) \
     AND ($4::text IS NULL OR categorie = $4) \
     AND ($5::text IS NULL OR action = $5) \
     AND ($6::timestamptz IS NULL OR created_at >= $6) \
     AND ($7::timestamptz IS NULL OR created_at <= $7)";

fn db_error<E: Display>(e: E) -> NeocortexError {
    NeocortexError::Store(e.to_string())
}

fn col<'a, T: FromSql<'a>>(row: &'a Row, name: &str) -> Result<T> {
    row.try_get(name).map_err(db_error)
}

/// `CASE` expression ranking the `priorite` column like [`Priority::rank`].
pub fn priority_rank_sql() -> String {
    let arms: String = Priority::ALL
        .iter()
        .map(|p| format!(" WHEN '{}' THEN {}", p.as_str(), p.rank()))
        .collect();
    format!("CASE priorite{} ELSE 99 END", arms)
}

fn key_counts(rows: &[Row]) -> Result<Vec<KeyCount>> {
    rows.iter()
        .map(|r| {
            Ok(KeyCount {
                key: r.try_get(0).map_err(db_error)?,
                count: r.try_get::<_, i64>(1).map_err(db_error)? as u64,
            })
        })
        .collect()
}

fn signal_from_row(row: &Row) -> Result<StoredSignal> {
    let kind: String = col(row, "type")?;
    let source: String = col(row, "source")?;
    let destination: Option<String> = col(row, "destination")?;
    let priorite: String = col(row, "priorite")?;
    Ok(StoredSignal {
        id: col(row, "id")?,
        signal: Signal {
            kind: kind.parse()?,
            source: Endpoint::parse(&source),
            destination: destination.as_deref().map(Endpoint::parse),
            entite_type: col(row, "entite_type")?,
            entite_id: col(row, "entite_id")?,
            payload: col(row, "payload")?,
            confiance: col(row, "confiance")?,
            priorite: priorite.parse()?,
            correlation_id: col(row, "correlation_id")?,
            parent_signal_id: col(row, "parent_signal_id")?,
            ttl_seconds: col(row, "ttl_seconds")?,
        },
        traite: col(row, "traite")?,
        erreur: col(row, "erreur")?,
        created_at: col(row, "created_at")?,
    })
}

fn action_from_row(row: &Row) -> Result<StoredAction> {
    let categorie: String = col(row, "categorie")?;
    Ok(StoredAction {
        id: col(row, "id")?,
        record: ActionRecord {
            action: col(row, "action")?,
            categorie: categorie.parse()?,
            entite_type: col(row, "entite_type")?,
            entite_id: col(row, "entite_id")?,
            user_id: col(row, "user_id")?,
            user_email: col(row, "user_email")?,
            user_role: col(row, "user_role")?,
            details: col(row, "details")?,
            metadata: col(row, "metadata")?,
            correlation_id: col(row, "correlation_id")?,
            duration_ms: col(row, "duration_ms")?,
        },
        created_at: col(row, "created_at")?,
    })
}

fn config_from_row(row: &Row) -> Result<ConfigEntry> {
    Ok(ConfigEntry {
        cle: col(row, "cle")?,
        valeur: col(row, "valeur")?,
        description: col(row, "description")?,
        categorie: col(row, "categorie")?,
        version: col(row, "version")?,
        modifie_par: col(row, "modifie_par")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn notification_from_row(row: &Row) -> Result<StoredNotification> {
    let kind: String = col(row, "type")?;
    let canal: String = col(row, "canal")?;
    Ok(StoredNotification {
        id: col(row, "id")?,
        user_id: col(row, "user_id")?,
        kind: kind.parse()?,
        canal: canal.parse()?,
        titre: col(row, "titre")?,
        message: col(row, "message")?,
        lien: col(row, "lien")?,
        entite_type: col(row, "entite_type")?,
        entite_id: col(row, "entite_id")?,
        signal_id: col(row, "signal_id")?,
        expire_at: col(row, "expire_at")?,
        lu: col(row, "lu")?,
        lu_at: col(row, "lu_at")?,
        created_at: col(row, "created_at")?,
    })
}

/// A PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Creates a pool of at most `max_size` connections for `database_url`.
    ///
    /// No connection is opened until the first query; call [`Store::ping`] to
    /// check the database is reachable.
    pub fn connect(database_url: &str, max_size: usize) -> Result<Self> {
        let mut cfg = DeadpoolConfig::new();
        cfg.url = Some(database_url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(max_size.max(1)));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| NeocortexError::Store(format!("Failed to create database pool: {}", e)))?;
        info!("Database connection pool created (max {} connections)", max_size.max(1));
        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    /// Applies the schema. Every statement is idempotent.
    pub async fn migrate(&self) -> Result<()> {
        self.client().await?.batch_execute(MIGRATION).await.map_err(db_error)?;
        info!("NEOCORTEX schema is up to date");
        Ok(())
    }

    async fn client(&self) -> Result<Object> {
        self.pool.get().await.map_err(db_error)
    }

    async fn count(&self, sql: &str, params: &[&(dyn tokio_postgres::types::ToSql + Sync)]) -> Result<u64> {
        let row = self.client().await?.query_one(sql, params).await.map_err(db_error)?;
        Ok(row.try_get::<_, i64>(0).map_err(db_error)? as u64)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<()> {
        self.client().await?.simple_query("SELECT 1").await.map_err(db_error)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------------

    async fn insert_signal(&self, signal: &Signal) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let kind = signal.kind.as_str();
        let source = signal.source.as_str();
        let destination = signal.destination.as_ref().map(|d| d.as_str());
        let priorite = signal.priorite.as_str();
        self.client()
            .await?
            .execute(
                "INSERT INTO neocortex.signaux
                   (id, type, source, destination, entite_type, entite_id, payload,
                    confiance, priorite, correlation_id, parent_signal_id, ttl_seconds)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                &[
                    &id,
                    &kind,
                    &source,
                    &destination,
                    &signal.entite_type,
                    &signal.entite_id,
                    &signal.payload,
                    &signal.confiance,
                    &priorite,
                    &signal.correlation_id,
                    &signal.parent_signal_id,
                    &signal.ttl_seconds,
                ],
            )
            .await
            .map_err(db_error)?;
        Ok(id)
    }

    async fn mark_signal_processed(&self, id: Uuid) -> Result<()> {
        self.client()
            .await?
            .execute("UPDATE neocortex.signaux SET traite = TRUE WHERE id = $1", &[&id])
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn mark_signal_error(&self, id: Uuid, error: &str) -> Result<()> {
        self.client()
            .await?
            .execute("UPDATE neocortex.signaux SET erreur = $2 WHERE id = $1", &[&id, &error])
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn pending_signals(&self, limit: usize) -> Result<Vec<StoredSignal>> {
        let sql = format!(
            "SELECT {} FROM neocortex.signaux WHERE traite = FALSE
             ORDER BY {}, created_at ASC LIMIT $1",
            SIGNAL_COLUMNS,
            priority_rank_sql()
        );
        let rows = self
            .client()
            .await?
            .query(&sql, &[&(limit as i64)])
            .await
            .map_err(db_error)?;
        rows.iter().map(signal_from_row).collect()
    }

    async fn count_pending_signals(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM neocortex.signaux WHERE traite = FALSE", &[])
            .await
    }

    async fn purge_signals(&self, now: DateTime<Utc>, retention_cutoff: DateTime<Utc>) -> Result<u64> {
        self.client()
            .await?
            .execute(
                "DELETE FROM neocortex.signaux
                 WHERE traite = TRUE
                   AND ((ttl_seconds IS NOT NULL
                         AND created_at + ttl_seconds * INTERVAL '1 second' < $1)
                        OR created_at < $2)",
                &[&now, &retention_cutoff],
            )
            .await
            .map_err(db_error)
    }

    async fn signal_stats(&self, since: DateTime<Utc>) -> Result<SignalStats> {
        let client = self.client().await?;
        let par_priorite = client
            .query(
                "SELECT priorite, COUNT(*) FROM neocortex.signaux WHERE created_at > $1
                 GROUP BY priorite",
                &[&since],
            )
            .await
            .map_err(db_error)?;
        let par_type = client
            .query(
                "SELECT type, COUNT(*) AS c FROM neocortex.signaux WHERE created_at > $1
                 GROUP BY type ORDER BY c DESC, type ASC LIMIT 10",
                &[&since],
            )
            .await
            .map_err(db_error)?;
        drop(client);

        Ok(SignalStats {
            total: self.count("SELECT COUNT(*) FROM neocortex.signaux", &[]).await?,
            non_traites: self.count_pending_signals().await?,
            par_priorite: key_counts(&par_priorite)?
                .into_iter()
                .map(|kc| (kc.key, kc.count))
                .collect(),
            par_type: key_counts(&par_type)?.into_iter().map(TypeCount::from).collect(),
            derniere24h: self
                .count("SELECT COUNT(*) FROM neocortex.signaux WHERE created_at > $1", &[&since])
                .await?,
        })
    }

    // ------------------------------------------------------------------------
    // Audit trail
    // ------------------------------------------------------------------------

    async fn insert_action(&self, r: &ActionRecord) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let categorie = r.categorie.as_str();
        self.client()
            .await?
            .execute(
                "INSERT INTO neocortex.historique_actions
                   (id, action, categorie, entite_type, entite_id, user_id, user_email,
                    user_role, details, metadata, correlation_id, duration_ms)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                &[
                    &id,
                    &r.action,
                    &categorie,
                    &r.entite_type,
                    &r.entite_id,
                    &r.user_id,
                    &r.user_email,
                    &r.user_role,
                    &r.details,
                    &r.metadata,
                    &r.correlation_id,
                    &r.duration_ms,
                ],
            )
            .await
            .map_err(db_error)?;
        Ok(id)
    }

    async fn list_actions(&self, filter: &HistoryFilter, limit: usize, offset: usize) -> Result<(Vec<StoredAction>, u64)> {
        let categorie = filter.categorie.map(|c| c.as_str());
        let client = self.client().await?;

        let total_row = client
            .query_one(
                &format!("SELECT COUNT(*) FROM neocortex.historique_actions WHERE {}", HISTORY_WHERE),
                &[
                    &filter.entite_type,
                    &filter.entite_id,
                    &filter.user_id,
                    &categorie,
                    &filter.action,
                    &filter.date_debut,
                    &filter.date_fin,
                ],
            )
            .await
            .map_err(db_error)?;
        let total = total_row.try_get::<_, i64>(0).map_err(db_error)? as u64;

        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM neocortex.historique_actions WHERE {}
                     ORDER BY created_at DESC LIMIT $8 OFFSET $9",
                    ACTION_COLUMNS, HISTORY_WHERE
                ),
                &[
                    &filter.entite_type,
                    &filter.entite_id,
                    &filter.user_id,
                    &categorie,
                    &filter.action,
                    &filter.date_debut,
                    &filter.date_fin,
                    &(limit as i64),
                    &(offset as i64),
                ],
            )
            .await
            .map_err(db_error)?;
        let items = rows.iter().map(action_from_row).collect::<Result<Vec<_>>>()?;
        Ok((items, total))
    }

    async fn entity_timeline(&self, entite_type: &str, entite_id: &str, limit: usize) -> Result<Vec<StoredAction>> {
        let rows = self
            .client()
            .await?
            .query(
                &format!(
                    "SELECT {} FROM neocortex.historique_actions
                     WHERE entite_type = $1 AND entite_id = $2
                     ORDER BY created_at DESC LIMIT $3",
                    ACTION_COLUMNS
                ),
                &[&entite_type, &entite_id, &(limit as i64)],
            )
            .await
            .map_err(db_error)?;
        rows.iter().map(action_from_row).collect()
    }

    async fn activity_since(&self, since: DateTime<Utc>) -> Result<ActivitySnapshot> {
        let client = self.client().await?;
        let per_category = client
            .query(
                "SELECT categorie, COUNT(*) FROM neocortex.historique_actions
                 WHERE created_at > $1 GROUP BY categorie ORDER BY categorie",
                &[&since],
            )
            .await
            .map_err(db_error)?;
        let totals = client
            .query_one(
                "SELECT COUNT(*), COUNT(DISTINCT user_id) FROM neocortex.historique_actions
                 WHERE created_at > $1",
                &[&since],
            )
            .await
            .map_err(db_error)?;
        Ok(ActivitySnapshot {
            per_category: key_counts(&per_category)?,
            total: totals.try_get::<_, i64>(0).map_err(db_error)? as u64,
            distinct_users: totals.try_get::<_, i64>(1).map_err(db_error)? as u64,
        })
    }

    async fn purge_actions(&self, before: DateTime<Utc>) -> Result<u64> {
        self.client()
            .await?
            .execute("DELETE FROM neocortex.historique_actions WHERE created_at < $1", &[&before])
            .await
            .map_err(db_error)
    }

    async fn action_stats(&self, since: DateTime<Utc>) -> Result<HistoryStats> {
        let client = self.client().await?;
        let par_categorie = client
            .query(
                "SELECT categorie, COUNT(*) AS c FROM neocortex.historique_actions
                 WHERE created_at > $1 GROUP BY categorie ORDER BY c DESC, categorie ASC",
                &[&since],
            )
            .await
            .map_err(db_error)?;
        let top_actions = client
            .query(
                "SELECT action, COUNT(*) AS c FROM neocortex.historique_actions
                 WHERE created_at > $1 GROUP BY action ORDER BY c DESC, action ASC LIMIT 10",
                &[&since],
            )
            .await
            .map_err(db_error)?;
        let top_users = client
            .query(
                "SELECT user_id, COALESCE(MAX(user_email), 'unknown'), COUNT(*) AS c
                 FROM neocortex.historique_actions
                 WHERE created_at > $1 AND user_id IS NOT NULL
                 GROUP BY user_id ORDER BY c DESC, user_id ASC LIMIT 10",
                &[&since],
            )
            .await
            .map_err(db_error)?;
        drop(client);

        let top_utilisateurs = top_users
            .iter()
            .map(|r| {
                Ok(UserActivity {
                    user_id: r.try_get(0).map_err(db_error)?,
                    email: r.try_get(1).map_err(db_error)?,
                    count: r.try_get::<_, i64>(2).map_err(db_error)? as u64,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(HistoryStats {
            total_actions: self.count("SELECT COUNT(*) FROM neocortex.historique_actions", &[]).await?,
            derniere24h: self
                .count(
                    "SELECT COUNT(*) FROM neocortex.historique_actions WHERE created_at > $1",
                    &[&since],
                )
                .await?,
            par_categorie: key_counts(&par_categorie)?,
            top_actions: key_counts(&top_actions)?,
            top_utilisateurs,
        })
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    async fn get_config(&self, key: &str) -> Result<Option<ConfigEntry>> {
        let row = self
            .client()
            .await?
            .query_opt(
                &format!("SELECT {} FROM neocortex.config_systeme WHERE cle = $1", CONFIG_COLUMNS),
                &[&key],
            )
            .await
            .map_err(db_error)?;
        row.as_ref().map(config_from_row).transpose()
    }

    async fn upsert_config(&self, key: &str, value: &Value, description: Option<&str>, modified_by: Option<&str>) -> Result<ConfigEntry> {
        let categorie = config_category(key);
        let row = self
            .client()
            .await?
            .query_one(
                &format!(
                    "INSERT INTO neocortex.config_systeme
                       (cle, valeur, description, categorie, version, modifie_par, updated_at)
                     VALUES ($1, $2, $3, $4, 1, $5, NOW())
                     ON CONFLICT (cle) DO UPDATE SET
                       valeur = EXCLUDED.valeur,
                       modifie_par = EXCLUDED.modifie_par,
                       updated_at = NOW(),
                       version = neocortex.config_systeme.version + 1
                     RETURNING {}",
                    CONFIG_COLUMNS
                ),
                &[&key, value, &description, &categorie, &modified_by],
            )
            .await
            .map_err(db_error)?;
        config_from_row(&row)
    }

    async fn list_configs(&self, category: Option<&str>) -> Result<Vec<ConfigEntry>> {
        let client = self.client().await?;
        let rows = match category {
            Some(cat) => client
                .query(
                    &format!(
                        "SELECT {} FROM neocortex.config_systeme WHERE categorie = $1 ORDER BY cle",
                        CONFIG_COLUMNS
                    ),
                    &[&cat],
                )
                .await,
            None => client
                .query(
                    &format!(
                        "SELECT {} FROM neocortex.config_systeme ORDER BY categorie ASC NULLS LAST, cle",
                        CONFIG_COLUMNS
                    ),
                    &[],
                )
                .await,
        }
        .map_err(db_error)?;
        rows.iter().map(config_from_row).collect()
    }

    // ------------------------------------------------------------------------
    // Adaptive weights
    // ------------------------------------------------------------------------

    async fn list_weights(&self, signal_type: &str) -> Result<Vec<AdaptiveWeight>> {
        let rows = self
            .client()
            .await?
            .query(
                "SELECT regle, poids, nb_succes, nb_echecs FROM neocortex.poids_adaptatifs
                 WHERE signal_type = $1 ORDER BY poids DESC",
                &[&signal_type],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(|r| {
                Ok(AdaptiveWeight {
                    regle: col(r, "regle")?,
                    poids: col(r, "poids")?,
                    reussites: col(r, "nb_succes")?,
                    echecs: col(r, "nb_echecs")?,
                })
            })
            .collect()
    }

    async fn adjust_weight(&self, signal_type: &str, rule: &str, delta: f64, success: bool) -> Result<Option<f64>> {
        let row = self
            .client()
            .await?
            .query_opt(
                "UPDATE neocortex.poids_adaptatifs SET
                   poids = LEAST(1.0, GREATEST(0.0, poids + $3::float8)),
                   nb_succes = nb_succes + CASE WHEN $4::boolean THEN 1 ELSE 0 END,
                   nb_echecs = nb_echecs + CASE WHEN $4::boolean THEN 0 ELSE 1 END,
                   dernier_ajustement = NOW()
                 WHERE signal_type = $1 AND regle = $2
                 RETURNING poids",
                &[&signal_type, &rule, &delta, &success],
            )
            .await
            .map_err(db_error)?;
        row.map(|r| r.try_get::<_, f64>(0).map_err(db_error)).transpose()
    }

    async fn insert_weight(&self, signal_type: &str, rule: &str, weight: f64, success: bool) -> Result<()> {
        let succes = i64::from(success);
        let echecs = i64::from(!success);
        self.client()
            .await?
            .execute(
                "INSERT INTO neocortex.poids_adaptatifs (signal_type, regle, poids, nb_succes, nb_echecs)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (signal_type, regle) DO NOTHING",
                &[&signal_type, &rule, &weight, &succes, &echecs],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------------

    async fn insert_notification(&self, n: &Notification) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let kind = n.kind.as_str();
        let canal = n.canal.as_str();
        self.client()
            .await?
            .execute(
                "INSERT INTO neocortex.notifications
                   (id, user_id, type, canal, titre, message, lien, entite_type, entite_id,
                    signal_id, expire_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                &[
                    &id,
                    &n.user_id,
                    &kind,
                    &canal,
                    &n.titre,
                    &n.message,
                    &n.lien,
                    &n.entite_type,
                    &n.entite_id,
                    &n.signal_id,
                    &n.expire_at,
                ],
            )
            .await
            .map_err(db_error)?;
        Ok(id)
    }

    async fn mark_notification_read(&self, id: Uuid, user_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let n = self
            .client()
            .await?
            .execute(
                "UPDATE neocortex.notifications SET lu = TRUE, lu_at = $3
                 WHERE id = $1 AND user_id = $2",
                &[&id, &user_id, &now],
            )
            .await
            .map_err(db_error)?;
        Ok(n > 0)
    }

    async fn mark_all_notifications_read(&self, user_id: &str, now: DateTime<Utc>) -> Result<u64> {
        self.client()
            .await?
            .execute(
                "UPDATE neocortex.notifications SET lu = TRUE, lu_at = $2
                 WHERE user_id = $1 AND lu = FALSE",
                &[&user_id, &now],
            )
            .await
            .map_err(db_error)
    }

    async fn list_notifications(&self, user_id: &str, query: &NotificationQuery, now: DateTime<Utc>) -> Result<Vec<StoredNotification>> {
        let kind = query.kind.map(|k| k.as_str());
        let rows = self
            .client()
            .await?
            .query(
                &format!(
                    "SELECT {} FROM neocortex.notifications
                     WHERE user_id = $1
                       AND (expire_at IS NULL OR expire_at > $2)
                       AND ($3::boolean = FALSE OR lu = FALSE)
                       AND ($4::text IS NULL OR type = $4)
                     ORDER BY created_at DESC LIMIT $5 OFFSET $6",
                    NOTIFICATION_COLUMNS
                ),
                &[
                    &user_id,
                    &now,
                    &query.unread_only,
                    &kind,
                    &(query.limit as i64),
                    &(query.offset as i64),
                ],
            )
            .await
            .map_err(db_error)?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn count_unread_notifications(&self, user_id: &str, now: DateTime<Utc>) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM neocortex.notifications
             WHERE user_id = $1 AND lu = FALSE AND (expire_at IS NULL OR expire_at > $2)",
            &[&user_id, &now],
        )
        .await
    }

    async fn purge_notifications(&self, now: DateTime<Utc>, read_cutoff: DateTime<Utc>) -> Result<u64> {
        self.client()
            .await?
            .execute(
                "DELETE FROM neocortex.notifications
                 WHERE (expire_at IS NOT NULL AND expire_at <= $1)
                    OR (lu = TRUE AND created_at < $2)",
                &[&now, &read_cutoff],
            )
            .await
            .map_err(db_error)
    }

    async fn active_users_with_role(&self, role: &str) -> Result<Vec<String>> {
        let rows = self
            .client()
            .await?
            .query(
                "SELECT id::text FROM auth.users WHERE role = $1 AND is_active = TRUE ORDER BY 1",
                &[&role],
            )
            .await
            .map_err(db_error)?;
        rows.iter().map(|r| r.try_get(0).map_err(db_error)).collect()
    }

    // ------------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------------

    async fn insert_task(&self, task: &TaskRequest) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let priorite = task.priorite.unwrap_or(5);
        let max_tentatives = task.max_tentatives.unwrap_or(3);
        self.client()
            .await?
            .execute(
                "INSERT INTO neocortex.taches_async
                   (id, type, payload, priorite, max_tentatives, signal_id, created_by)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &id,
                    &task.kind,
                    &task.payload,
                    &priorite,
                    &max_tentatives,
                    &task.signal_id,
                    &task.created_by,
                ],
            )
            .await
            .map_err(db_error)?;
        Ok(id)
    }

    async fn claim_tasks(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<ClaimedTask>> {
        let rows = self
            .client()
            .await?
            .query(
                "WITH picked AS (
                   SELECT id FROM neocortex.taches_async
                   WHERE statut IN ('en_attente', 'echoue')
                     AND tentatives < max_tentatives
                     AND prochaine_exec <= $2
                   ORDER BY priorite ASC, created_at ASC
                   LIMIT $1
                   FOR UPDATE SKIP LOCKED
                 )
                 UPDATE neocortex.taches_async t
                 SET statut = 'en_cours', started_at = $2, tentatives = t.tentatives + 1
                 FROM picked WHERE t.id = picked.id
                 RETURNING t.id, t.type, t.payload, t.tentatives, t.max_tentatives,
                           t.priorite, t.created_at",
                &[&(limit as i64), &now],
            )
            .await
            .map_err(db_error)?;

        let mut claimed = Vec::with_capacity(rows.len());
        for r in &rows {
            let priorite: i32 = col(r, "priorite")?;
            let created_at: DateTime<Utc> = col(r, "created_at")?;
            let task = ClaimedTask {
                id: col(r, "id")?,
                kind: col(r, "type")?,
                payload: col(r, "payload")?,
                tentatives: col(r, "tentatives")?,
                max_tentatives: col(r, "max_tentatives")?,
            };
            claimed.push(((priorite, created_at), task));
        }
        // RETURNING does not keep the ORDER BY of the CTE.
        claimed.sort_by_key(|(order, _)| *order);
        Ok(claimed.into_iter().map(|(_, t)| t).collect())
    }

    async fn complete_task(&self, id: Uuid, result: &Value, now: DateTime<Utc>) -> Result<()> {
        self.client()
            .await?
            .execute(
                "UPDATE neocortex.taches_async
                 SET statut = 'termine', resultat = $2, completed_at = $3
                 WHERE id = $1",
                &[&id, result, &now],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn fail_task(&self, id: Uuid, failure: &TaskFailure, now: DateTime<Utc>) -> Result<()> {
        let (statut, completed_at) = if failure.definitive {
            (TaskStatus::Failed, Some(now))
        } else {
            (TaskStatus::Pending, None)
        };
        let statut = statut.as_str();
        self.client()
            .await?
            .execute(
                "UPDATE neocortex.taches_async
                 SET statut = $2, erreur = $3, prochaine_exec = $4, completed_at = $5
                 WHERE id = $1",
                &[&id, &statut, &failure.erreur, &failure.next_run, &completed_at],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn reject_task(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()> {
        self.client()
            .await?
            .execute(
                "UPDATE neocortex.taches_async
                 SET statut = 'echoue', erreur = $2, completed_at = $3
                 WHERE id = $1",
                &[&id, &error, &now],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn cancel_task(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let n = self
            .client()
            .await?
            .execute(
                "UPDATE neocortex.taches_async SET statut = 'annule', completed_at = $2
                 WHERE id = $1 AND statut IN ('en_attente', 'echoue')",
                &[&id, &now],
            )
            .await
            .map_err(db_error)?;
        Ok(n > 0)
    }

    async fn task_stats(&self, since: DateTime<Utc>) -> Result<TaskStats> {
        let rows = self
            .client()
            .await?
            .query(
                "SELECT type, statut, COUNT(*) AS c FROM neocortex.taches_async
                 WHERE created_at > $1
                 GROUP BY type, statut ORDER BY c DESC, type ASC LIMIT 20",
                &[&since],
            )
            .await
            .map_err(db_error)?;
        let par_type = rows
            .iter()
            .map(|r| {
                let statut: String = r.try_get(1).map_err(db_error)?;
                Ok(TaskTypeCount {
                    kind: r.try_get(0).map_err(db_error)?,
                    statut: statut.parse()?,
                    count: r.try_get::<_, i64>(2).map_err(db_error)? as u64,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let finished = "SELECT COUNT(*) FROM neocortex.taches_async
                        WHERE statut = $1 AND completed_at > $2";
        let done = TaskStatus::Done.as_str();
        let failed = TaskStatus::Failed.as_str();
        Ok(TaskStats {
            en_attente: self
                .count("SELECT COUNT(*) FROM neocortex.taches_async WHERE statut = 'en_attente'", &[])
                .await?,
            en_cours: self
                .count("SELECT COUNT(*) FROM neocortex.taches_async WHERE statut = 'en_cours'", &[])
                .await?,
            terminees24h: self.count(finished, &[&done, &since]).await?,
            echouees24h: self.count(finished, &[&failed, &since]).await?,
            par_type,
        })
    }

    async fn purge_tasks(&self, before: DateTime<Utc>) -> Result<u64> {
        self.client()
            .await?
            .execute(
                "DELETE FROM neocortex.taches_async
                 WHERE statut IN ('termine', 'echoue', 'annule') AND completed_at < $1",
                &[&before],
            )
            .await
            .map_err(db_error)
    }

    // ------------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------------

    async fn insert_metrics(&self, metrics: &[Metric]) -> Result<()> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(db_error)?;
        for m in metrics {
            tx.execute(
                "INSERT INTO neocortex.metriques (nom, valeur, unite, periode, dimensions)
                 VALUES ($1, $2, $3, $4, $5)",
                &[&m.nom, &m.valeur, &m.unite, &m.periode, &m.dimensions],
            )
            .await
            .map_err(db_error)?;
        }
        tx.commit().await.map_err(db_error)
    }

    async fn list_metrics(&self, query: &MetricQuery) -> Result<Vec<StoredMetric>> {
        let rows = self
            .client()
            .await?
            .query(
                "SELECT nom, valeur, unite, periode, dimensions, created_at FROM neocortex.metriques
                 WHERE ($1::text IS NULL OR nom = $1) AND ($2::text IS NULL OR periode = $2)
                 ORDER BY created_at DESC LIMIT $3",
                &[&query.nom, &query.periode, &(query.limit as i64)],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(|r| {
                Ok(StoredMetric {
                    metric: Metric {
                        nom: col(r, "nom")?,
                        valeur: col(r, "valeur")?,
                        unite: col(r, "unite")?,
                        periode: col(r, "periode")?,
                        dimensions: col(r, "dimensions")?,
                    },
                    created_at: col(r, "created_at")?,
                })
            })
            .collect()
    }
}
