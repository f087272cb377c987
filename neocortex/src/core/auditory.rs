//! # Auditory Cortex: Notifications
//!
//! In-app notifications for single users, groups and roles. Creation is
//! best effort: a failed insert is logged and simply not counted.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::core::signal::{Notification, NotificationChannel, NotificationKind};
use crate::error::Result;
use crate::store::{NotificationQuery, Store, StoredNotification};

/// Default page size of a notification listing.
pub const DEFAULT_PAGE_SIZE: usize = 50;
/// Largest page size accepted by a notification listing.
pub const MAX_PAGE_SIZE: usize = 200;
/// Default retention of read notifications, in days.
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

/// Optional fields shared by group and role notifications.
#[derive(Debug, Clone, Default)]
pub struct NotifyOptions {
    /// Defaults to in-app.
    pub canal: Option<NotificationChannel>,
    pub lien: Option<String>,
    pub entite_type: Option<String>,
    pub entite_id: Option<String>,
    pub signal_id: Option<Uuid>,
}

/// Listing options of [`Auditory::list`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    pub non_lues_seulement: bool,
    #[serde(rename = "type")]
    pub kind: Option<NotificationKind>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// A page of notifications plus the user's unread total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPage {
    pub notifications: Vec<StoredNotification>,
    pub total_non_lues: u64,
}

#[derive(Clone)]
pub struct Auditory {
    store: Arc<dyn Store>,
}

impl Auditory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Creates one notification. Returns `None` when the store refused it.
    pub async fn create(&self, notification: &Notification) -> Option<Uuid> {
        match self.store.insert_notification(notification).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!("[Auditif] Failed to notify {}: {}", notification.user_id, e);
                None
            }
        }
    }

    /// Notifies every user in `users`. Returns how many were created.
    pub async fn notify_group(
        &self,
        users: &[String],
        kind: NotificationKind,
        titre: &str,
        message: &str,
        options: &NotifyOptions,
    ) -> usize {
        let mut count = 0;
        for user_id in users {
            let notification = Notification {
                user_id: user_id.clone(),
                kind,
                canal: options.canal.unwrap_or(NotificationChannel::InApp),
                titre: titre.to_string(),
                message: message.to_string(),
                lien: options.lien.clone(),
                entite_type: options.entite_type.clone(),
                entite_id: options.entite_id.clone(),
                signal_id: options.signal_id,
                expire_at: None,
            };
            if self.create(&notification).await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Notifies every active user holding `role`.
    pub async fn notify_role(
        &self,
        role: &str,
        kind: NotificationKind,
        titre: &str,
        message: &str,
        options: &NotifyOptions,
    ) -> Result<usize> {
        let users = self.store.active_users_with_role(role).await?;
        Ok(self.notify_group(&users, kind, titre, message, options).await)
    }

    /// Marks one of the user's notifications read.
    pub async fn mark_read(&self, id: Uuid, user_id: &str) -> Result<bool> {
        self.store.mark_notification_read(id, user_id, Utc::now()).await
    }

    /// Marks every unread notification of the user read. Returns the count.
    pub async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        self.store.mark_all_notifications_read(user_id, Utc::now()).await
    }

    /// Live notifications of the user, newest first.
    pub async fn list(&self, user_id: &str, options: &ListOptions) -> Result<NotificationPage> {
        let now = Utc::now();
        let query = NotificationQuery {
            unread_only: options.non_lues_seulement,
            kind: options.kind,
            limit: options.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE),
            offset: options.offset.unwrap_or(0),
        };
        let notifications = self.store.list_notifications(user_id, &query, now).await?;
        let total_non_lues = self.store.count_unread_notifications(user_id, now).await?;
        Ok(NotificationPage { notifications, total_non_lues })
    }

    pub async fn count_unread(&self, user_id: &str) -> Result<u64> {
        self.store.count_unread_notifications(user_id, Utc::now()).await
    }

    /// Deletes expired notifications and read ones older than the retention.
    pub async fn purge(&self, retention_days: i64) -> Result<u64> {
        let now = Utc::now();
        let purged = self
            .store
            .purge_notifications(now, now - Duration::days(retention_days))
            .await?;
        if purged > 0 {
            info!("[Auditif] Purged {} notifications", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn notification(user: &str, kind: NotificationKind) -> Notification {
        Notification {
            user_id: user.into(),
            kind,
            canal: NotificationChannel::InApp,
            titre: "Titre".into(),
            message: "Message".into(),
            lien: None,
            entite_type: None,
            entite_id: None,
            signal_id: None,
            expire_at: None,
        }
    }

    #[tokio::test]
    async fn group_and_role_fan_out() {
        let store = MemoryStore::new();
        store.add_user("a", "admin_sgg", true);
        store.add_user("b", "admin_sgg", true);
        store.add_user("c", "admin_sgg", false);
        let auditory = Auditory::new(Arc::new(store));

        let users = vec!["x".to_string(), "y".to_string()];
        let n = auditory
            .notify_group(&users, NotificationKind::Info, "t", "m", &NotifyOptions::default())
            .await;
        assert_eq!(n, 2);

        let n = auditory
            .notify_role("admin_sgg", NotificationKind::Alerte, "t", "m", &NotifyOptions::default())
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(auditory.count_unread("c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_notifications_are_hidden_and_purged() {
        let auditory = Auditory::new(Arc::new(MemoryStore::new()));
        let mut stale = notification("u1", NotificationKind::Info);
        stale.expire_at = Some(Utc::now() - Duration::minutes(1));
        auditory.create(&stale).await.unwrap();
        auditory.create(&notification("u1", NotificationKind::Info)).await.unwrap();

        let page = auditory.list("u1", &ListOptions::default()).await.unwrap();
        assert_eq!(page.notifications.len(), 1);
        assert_eq!(page.total_non_lues, 1);

        assert_eq!(auditory.purge(DEFAULT_RETENTION_DAYS).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn read_flags_and_filters() {
        let auditory = Auditory::new(Arc::new(MemoryStore::new()));
        let first = auditory.create(&notification("u1", NotificationKind::Info)).await.unwrap();
        auditory.create(&notification("u1", NotificationKind::Action)).await.unwrap();
        auditory.create(&notification("u1", NotificationKind::Action)).await.unwrap();

        assert!(!auditory.mark_read(first, "someone-else").await.unwrap());
        assert!(auditory.mark_read(first, "u1").await.unwrap());
        assert_eq!(auditory.count_unread("u1").await.unwrap(), 2);

        let unread = auditory
            .list("u1", &ListOptions { non_lues_seulement: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(unread.notifications.len(), 2);

        let actions = auditory
            .list("u1", &ListOptions { kind: Some(NotificationKind::Action), limit: Some(1), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(actions.notifications.len(), 1);
        assert_eq!(actions.total_non_lues, 2);

        assert_eq!(auditory.mark_all_read("u1").await.unwrap(), 2);
        assert_eq!(auditory.count_unread("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_notifications_past_retention_are_purged() {
        let auditory = Auditory::new(Arc::new(MemoryStore::new()));
        let id = auditory.create(&notification("u1", NotificationKind::Info)).await.unwrap();
        auditory.create(&notification("u1", NotificationKind::Info)).await.unwrap();
        auditory.mark_read(id, "u1").await.unwrap();

        assert_eq!(auditory.purge(DEFAULT_RETENTION_DAYS).await.unwrap(), 0);
        assert_eq!(auditory.purge(-1).await.unwrap(), 1);
    }
}
