use anyhow::{anyhow, Context, Result};
use regex::Regex;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use serde::Serialize;
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::alerts::AlarmEscalator;
use crate::telemetry::LogContext;
use crate::{now_s, PatientId};

pub const DEFAULT_TOPIC_PREFIX: &str = "ward";
pub const DEFAULT_CLIENT_ID: &str = "ward-monitord";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse `host:port`, `[v6]:port` or `mqtt(s)://host:port`.
pub fn parse_mqtt_endpoint(addr: &str, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok((host.to_string(), port))
}

/// Topic prefix: slash-separated segments, no wildcards.
pub fn validate_topic_prefix(prefix: &str) -> Result<()> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+(/[A-Za-z0-9_-]+)*$"))
        .as_ref()
        .map_err(|e| anyhow!("topic regex: {}", e))?;
    if !re.is_match(prefix) {
        return Err(anyhow!("invalid MQTT topic prefix '{}'", prefix));
    }
    Ok(())
}

/// Lowercased room name usable as one topic segment.
pub fn room_segment(room: Option<&str>) -> String {
    let segment: String = room
        .unwrap_or("")
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    if segment.is_empty() {
        "unassigned".to_string()
    } else {
        segment
    }
}

pub fn alarm_topic(prefix: &str, room: Option<&str>) -> String {
    format!("{}/alarm/{}", prefix, room_segment(room))
}

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub broker: String,
    pub client_id: String,
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
}

#[derive(Debug, Serialize)]
struct AlarmPayload<'a> {
    patient_id: PatientId,
    room: Option<&'a str>,
    message: &'a str,
    timestamp: u64,
}

/// Publishes escalations at QoS 1 to `<prefix>/alarm/<room>`.
pub struct MqttAlarm {
    client: Client,
    topic_prefix: String,
    connection: Mutex<Option<JoinHandle<()>>>,
    log: LogContext,
}

impl MqttAlarm {
    pub fn connect(settings: &MqttSettings, log: LogContext) -> Result<Self> {
        validate_topic_prefix(&settings.topic_prefix)?;
        let endpoint = parse_mqtt_endpoint(&settings.broker, settings.use_tls)?;

        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }
        options.set_transport(if endpoint.use_tls {
            Transport::tls_with_default_config()
        } else {
            Transport::tcp()
        });

        let (client, connection) = Client::new(options, 10);
        let handle = spawn_connection(connection, log.clone())?;
        log.info(format_args!(
            "mqtt escalation to {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some()
        ));
        Ok(Self {
            client,
            topic_prefix: settings.topic_prefix.clone(),
            connection: Mutex::new(Some(handle)),
            log,
        })
    }

    pub fn disconnect(&self) -> Result<()> {
        self.client.disconnect()?;
        let handle = self
            .connection
            .lock()
            .map_err(|_| anyhow!("mqtt connection lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn spawn_connection(mut connection: Connection, log: LogContext) -> Result<JoinHandle<()>> {
    Ok(std::thread::Builder::new()
        .name("mqtt-connection".to_string())
        .spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        log.warn(format_args!("mqtt connection error: {}", e));
                        break;
                    }
                }
            }
        })?)
}

impl AlarmEscalator for MqttAlarm {
    fn escalate(&self, patient_id: PatientId, room: Option<&str>, message: &str) -> Result<()> {
        let topic = alarm_topic(&self.topic_prefix, room);
        let payload = serde_json::to_vec(&AlarmPayload {
            patient_id,
            room,
            message,
            timestamp: now_s()?,
        })?;
        self.client
            .publish(topic.as_str(), QoS::AtLeastOnce, false, payload)?;
        self.log
            .info(format_args!("alarm published to {} for patient {}", topic, patient_id));
        Ok(())
    }
}
