use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::telemetry::LogContext;
use crate::{AlertId, PatientId, PipelineError, SeverityTier, UserId};

/// Payload pushed to staff channels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    /// Absent when the alert row could not be persisted.
    pub alert_id: Option<AlertId>,
    pub patient_id: PatientId,
    pub severity: SeverityTier,
    pub message: String,
    pub timestamp: u64,
}

/// A live notification endpoint for one staff member.
pub trait NotificationChannel: Send + Sync {
    fn push(&self, notification: &AlertNotification) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: usize,
    pub failed: usize,
}

type ChannelList = Vec<(ChannelId, Arc<dyn NotificationChannel>)>;

/// Live channels per staff member.
///
/// Pushes run outside the lock; a channel that fails once is removed.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<UserId, ChannelList>>,
    next_id: AtomicU64,
    log: LogContext,
}

impl ChannelRegistry {
    pub fn new(log: LogContext) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            log,
        }
    }

    pub fn register(
        &self,
        user_id: UserId,
        channel: Arc<dyn NotificationChannel>,
    ) -> Result<ChannelId> {
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.channels
            .write()
            .map_err(|_| anyhow!("channel registry lock poisoned"))?
            .entry(user_id)
            .or_default()
            .push((id, channel));
        self.log
            .debug(format_args!("channel {:?} registered for user {}", id, user_id));
        Ok(id)
    }

    /// Returns false when the channel was already gone.
    pub fn remove(&self, user_id: UserId, channel_id: ChannelId) -> Result<bool> {
        let mut channels = self
            .channels
            .write()
            .map_err(|_| anyhow!("channel registry lock poisoned"))?;
        let Some(list) = channels.get_mut(&user_id) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|(id, _)| *id != channel_id);
        let removed = list.len() != before;
        if list.is_empty() {
            channels.remove(&user_id);
        }
        Ok(removed)
    }

    pub fn channel_count(&self, user_id: UserId) -> Result<usize> {
        Ok(self
            .channels
            .read()
            .map_err(|_| anyhow!("channel registry lock poisoned"))?
            .get(&user_id)
            .map_or(0, |list| list.len()))
    }

    /// Push to every channel of `user_id`. Failures are isolated per channel.
    pub fn deliver(&self, user_id: UserId, notification: &AlertNotification) -> DeliveryStats {
        let snapshot: ChannelList = match self.channels.read() {
            Ok(channels) => channels.get(&user_id).cloned().unwrap_or_default(),
            Err(_) => {
                self.log
                    .error(format_args!("channel registry lock poisoned, skipping delivery"));
                return DeliveryStats::default();
            }
        };

        let mut stats = DeliveryStats::default();
        for (id, channel) in snapshot {
            match channel.push(notification) {
                Ok(()) => stats.delivered += 1,
                Err(err) => {
                    stats.failed += 1;
                    let failure = PipelineError::NotificationDelivery(format!(
                        "user {} channel {:?}: {}",
                        user_id, id, err
                    ));
                    self.log.warn(format_args!("{}; channel removed", failure));
                    if let Err(err) = self.remove(user_id, id) {
                        self.log.error(format_args!("{}", err));
                    }
                }
            }
        }
        stats
    }
}
