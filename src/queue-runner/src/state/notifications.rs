use db::models::BuildID;

// Best-effort delivery: items enqueued after the database commit and lost if
// the process dies before the sender drains them.

#[derive(Debug)]
struct Item {
    build_id: BuildID,
    dependent_ids: Vec<BuildID>,
}

/// Queue of finished-build notifications, drained by a dedicated sender task
/// so builder workers never block on the notification channel.
pub struct NotificationSender {
    tx: tokio::sync::mpsc::UnboundedSender<Item>,
    rx: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<Item>>,
}

impl Default for NotificationSender {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSender {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Item>();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn enqueue(&self, build_id: BuildID, dependent_ids: Vec<BuildID>) {
        if self
            .tx
            .send(Item {
                build_id,
                dependent_ids,
            })
            .is_err()
        {
            tracing::error!("notification channel closed, dropping item for build {build_id}");
        }
    }

    /// Deliver one queued notification; awaits until an item is available.
    pub async fn send_once(&self, database: &db::Database) -> anyhow::Result<()> {
        let item = {
            let mut rx = self.rx.lock().await;
            rx.recv()
                .await
                .ok_or_else(|| anyhow::anyhow!("notification channel closed"))?
        };

        let mut conn = database.get().await?;
        let mut tx = conn.begin_transaction().await?;
        tx.notify_build_finished(item.build_id, &item.dependent_ids)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
