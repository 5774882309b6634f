//! Staff endpoint: token handshake, alert pushes, acknowledgement and pending
//! listing.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{spawn_server, ServerHandle};
use crate::alerts::{AlertDispatcher, AlertNotification, NotificationChannel};
use crate::auth::AuthResolver;
use crate::telemetry::LogContext;
use crate::transport::wire::{
    read_message, write_message, Message, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION,
};
use crate::{Actor, AlertId, AlertRecord, PatientId, SeverityTier, UserId};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct Subscribe {
    token: String,
}

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum StaffCommand {
    Acknowledge { alert_id: AlertId },
    Pending,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StaffReply<'a> {
    Subscribed {
        user_id: UserId,
    },
    Alert {
        alert_id: Option<AlertId>,
        patient_id: PatientId,
        severity: SeverityTier,
        message: &'a str,
        timestamp: u64,
    },
    AckResult {
        alert_id: AlertId,
        outcome: &'static str,
    },
    Pending {
        alerts: &'a [AlertRecord],
    },
    Error {
        reason: String,
    },
}

/// A subscribed staff connection. Pushes and command replies share the
/// writer so messages never interleave.
pub struct StaffChannel {
    writer: Mutex<TcpStream>,
}

impl StaffChannel {
    fn new(stream: TcpStream) -> Result<Self> {
        stream.set_write_timeout(Some(PUSH_TIMEOUT))?;
        Ok(Self {
            writer: Mutex::new(stream),
        })
    }

    fn send(&self, message: &Message) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("staff channel lock poisoned"))?;
        write_message(&mut *writer, message)
    }

    fn reply(&self, reply: &StaffReply<'_>) -> Result<()> {
        self.send(&Message::json(reply)?)
    }
}

impl NotificationChannel for StaffChannel {
    fn push(&self, notification: &AlertNotification) -> Result<()> {
        self.reply(&StaffReply::Alert {
            alert_id: notification.alert_id,
            patient_id: notification.patient_id,
            severity: notification.severity,
            message: &notification.message,
            timestamp: notification.timestamp,
        })
    }
}

pub struct AlertServer {
    dispatcher: Arc<AlertDispatcher>,
    auth: Arc<dyn AuthResolver>,
    log: LogContext,
}

impl AlertServer {
    pub fn new(dispatcher: Arc<AlertDispatcher>, auth: Arc<dyn AuthResolver>, log: LogContext) -> Self {
        Self {
            dispatcher,
            auth,
            log: log.with_target("ward_motion::alerts"),
        }
    }

    pub fn spawn(self, addr: &str) -> Result<ServerHandle> {
        let log = self.log.clone();
        let server = Arc::new(self);
        spawn_server(
            "alerts",
            addr,
            log,
            Arc::new(move |id, stream| server.serve(id, stream)),
        )
    }

    fn serve(&self, id: u64, stream: TcpStream) -> Result<()> {
        let log = self.log.scoped("conn", id);
        let mut reader = stream.try_clone()?;
        reader.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

        let actor = match self.authenticate(&mut reader) {
            Ok(Some(actor)) => actor,
            Ok(None) => {
                log.warn(format_args!("subscription rejected"));
                let mut writer = stream;
                return write_message(
                    &mut writer,
                    &Message::close(CLOSE_POLICY_VIOLATION, "Unauthorized"),
                );
            }
            Err(err) => {
                let mut writer = stream;
                let _ = write_message(
                    &mut writer,
                    &Message::close(CLOSE_POLICY_VIOLATION, "Unauthorized"),
                );
                return Err(err);
            }
        };
        reader.set_read_timeout(None)?;

        let log = log.scoped("user", actor.user_id);
        let channel = Arc::new(StaffChannel::new(stream)?);
        let channels = self.dispatcher.channels().clone();
        let channel_id = channels.register(actor.user_id, channel.clone())?;
        log.info(format_args!("subscribed as {}", actor.role.as_str()));

        let result = channel
            .reply(&StaffReply::Subscribed {
                user_id: actor.user_id,
            })
            .and_then(|()| self.command_loop(&mut reader, &channel, &actor, &log));

        channels.remove(actor.user_id, channel_id)?;
        log.info(format_args!("unsubscribed"));
        result
    }

    /// `Ok(None)` when the token is missing or unknown.
    fn authenticate(&self, reader: &mut TcpStream) -> Result<Option<Actor>> {
        let Some(Message::Text(text)) = read_message(reader)? else {
            return Ok(None);
        };
        let Ok(subscribe) = serde_json::from_str::<Subscribe>(&text) else {
            return Ok(None);
        };
        self.auth.resolve(&subscribe.token)
    }

    fn command_loop(
        &self,
        reader: &mut TcpStream,
        channel: &StaffChannel,
        actor: &Actor,
        log: &LogContext,
    ) -> Result<()> {
        loop {
            let text = match read_message(reader)? {
                Some(Message::Text(text)) => text,
                Some(Message::Binary(_)) => {
                    channel.reply(&StaffReply::Error {
                        reason: "binary messages are not accepted".to_string(),
                    })?;
                    continue;
                }
                Some(Message::Close { .. }) => {
                    let _ = channel.send(&Message::close(CLOSE_NORMAL, ""));
                    return Ok(());
                }
                None => return Ok(()),
            };

            let command = match serde_json::from_str::<StaffCommand>(&text) {
                Ok(command) => command,
                Err(err) => {
                    channel.reply(&StaffReply::Error {
                        reason: format!("invalid command: {}", err),
                    })?;
                    continue;
                }
            };

            match command {
                StaffCommand::Acknowledge { alert_id } => {
                    let outcome = self.dispatcher.acknowledge(alert_id, actor)?;
                    log.debug(format_args!("ack {} -> {}", alert_id, outcome.as_str()));
                    channel.reply(&StaffReply::AckResult {
                        alert_id,
                        outcome: outcome.as_str(),
                    })?;
                }
                StaffCommand::Pending => {
                    let alerts = self.dispatcher.pending_for(actor.user_id)?;
                    channel.reply(&StaffReply::Pending { alerts: &alerts })?;
                }
            }
        }
    }
}
