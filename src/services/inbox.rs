use std::sync::Arc;
use uuid::Uuid;

use crate::error::{BookingError, Result};
use crate::models::identity::{authorize, Action};
use crate::models::{Caller, Notification};
use crate::store::NotificationStore;

/// Per-user view over the notification sink.
pub struct Inbox {
    store: Arc<dyn NotificationStore>,
}

impl Inbox {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }

    /// Newest first.
    pub async fn list(&self, caller: Option<&Caller>) -> Result<Vec<Notification>> {
        let caller = authorize(caller, Action::ReadNotifications)?;
        self.store.for_recipient(caller.user_id).await
    }

    pub async fn unread_count(&self, caller: Option<&Caller>) -> Result<usize> {
        Ok(self.list(caller).await?.iter().filter(|n| !n.read).count())
    }

    /// Only the recipient can mark a notification as read; anything else looks
    /// like a missing notification.
    #[tracing::instrument(skip(self, caller), fields(%notification_id))]
    pub async fn mark_read(&self, caller: Option<&Caller>, notification_id: Uuid) -> Result<()> {
        let caller = authorize(caller, Action::ReadNotifications)?;

        if self.store.mark_read(notification_id, caller.user_id).await? {
            Ok(())
        } else {
            tracing::debug!(user_id = %caller.user_id, "Notification not found for recipient");
            Err(BookingError::InvalidInput(format!(
                "notification {} not found",
                notification_id
            )))
        }
    }
}
