use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::detect::{SegmentationParams, TrackerParams};
use crate::transport::mqtt::{
    validate_topic_prefix, MqttSettings, DEFAULT_CLIENT_ID, DEFAULT_TOPIC_PREFIX,
};

const DEFAULT_DB_PATH: &str = "ward_motion.db";
const DEFAULT_STREAM_ADDR: &str = "127.0.0.1:8765";
const DEFAULT_ALERTS_ADDR: &str = "127.0.0.1:8766";
const DEFAULT_TOKENS_PATH: &str = "staff_tokens.json";

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    db_path: Option<String>,
    stream: Option<StreamConfigFile>,
    alerts: Option<AlertsConfigFile>,
    segmentation: Option<SegmentationConfigFile>,
    tracker: Option<TrackerConfigFile>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsConfigFile {
    addr: Option<String>,
    tokens_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct SegmentationConfigFile {
    learning_rate: Option<f64>,
    variance_threshold: Option<f64>,
    initial_variance: Option<f64>,
    min_variance: Option<f64>,
    max_variance: Option<f64>,
    dilation_iterations: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    min_area: Option<u32>,
    grace_s: Option<f64>,
    position_quantum: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    client_id: Option<String>,
    topic_prefix: Option<String>,
    username: Option<String>,
    password: Option<String>,
    use_tls: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub db_path: String,
    pub stream_addr: String,
    pub alerts_addr: String,
    pub tokens_path: PathBuf,
    pub segmentation: SegmentationParams,
    pub tracker: TrackerParams,
    /// `None` unless a broker is configured; escalations are then only logged.
    pub mqtt: Option<MqttSettings>,
}

impl MonitorConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("WARD_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Self {
        let seg_defaults = SegmentationParams::default();
        let seg = file.segmentation.unwrap_or_default();
        let segmentation = SegmentationParams {
            learning_rate: seg.learning_rate.unwrap_or(seg_defaults.learning_rate),
            variance_threshold: seg
                .variance_threshold
                .unwrap_or(seg_defaults.variance_threshold),
            initial_variance: seg
                .initial_variance
                .unwrap_or(seg_defaults.initial_variance),
            min_variance: seg.min_variance.unwrap_or(seg_defaults.min_variance),
            max_variance: seg.max_variance.unwrap_or(seg_defaults.max_variance),
            dilation_iterations: seg
                .dilation_iterations
                .unwrap_or(seg_defaults.dilation_iterations),
        };

        let tracker_defaults = TrackerParams::default();
        let trk = file.tracker.unwrap_or_default();
        let tracker = TrackerParams {
            min_area: trk.min_area.unwrap_or(tracker_defaults.min_area),
            grace_s: trk.grace_s.unwrap_or(tracker_defaults.grace_s),
            position_quantum: trk
                .position_quantum
                .unwrap_or(tracker_defaults.position_quantum),
        };

        let mqtt = file.mqtt.and_then(|mqtt| {
            let broker = mqtt.broker.filter(|b| !b.trim().is_empty())?;
            Some(MqttSettings {
                broker,
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
                topic_prefix: mqtt
                    .topic_prefix
                    .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
                username: mqtt.username,
                password: mqtt.password,
                use_tls: mqtt.use_tls.unwrap_or(false),
            })
        });

        Self {
            db_path: file
                .db_path
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            stream_addr: file
                .stream
                .and_then(|stream| stream.addr)
                .unwrap_or_else(|| DEFAULT_STREAM_ADDR.to_string()),
            alerts_addr: file
                .alerts
                .as_ref()
                .and_then(|alerts| alerts.addr.clone())
                .unwrap_or_else(|| DEFAULT_ALERTS_ADDR.to_string()),
            tokens_path: file
                .alerts
                .and_then(|alerts| alerts.tokens_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKENS_PATH)),
            segmentation,
            tracker,
            mqtt,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = non_empty_env("WARD_DB_PATH") {
            self.db_path = path;
        }
        if let Some(addr) = non_empty_env("WARD_STREAM_ADDR") {
            self.stream_addr = addr;
        }
        if let Some(addr) = non_empty_env("WARD_ALERTS_ADDR") {
            self.alerts_addr = addr;
        }
        if let Some(path) = non_empty_env("WARD_TOKENS_PATH") {
            self.tokens_path = PathBuf::from(path);
        }
        if let Some(min_area) = non_empty_env("WARD_MIN_AREA") {
            self.tracker.min_area = min_area
                .trim()
                .parse()
                .map_err(|_| anyhow!("WARD_MIN_AREA must be a positive integer"))?;
        }
        if let Some(broker) = non_empty_env("WARD_MQTT_BROKER") {
            match self.mqtt.as_mut() {
                Some(mqtt) => mqtt.broker = broker,
                None => {
                    self.mqtt = Some(MqttSettings {
                        broker,
                        client_id: DEFAULT_CLIENT_ID.to_string(),
                        topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
                        username: None,
                        password: None,
                        use_tls: false,
                    })
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        for (name, addr) in [("stream", &self.stream_addr), ("alerts", &self.alerts_addr)] {
            addr.parse::<std::net::SocketAddr>()
                .map_err(|e| anyhow!("invalid {} addr '{}': {}", name, addr, e))?;
        }
        self.segmentation.validate()?;
        self.tracker.validate()?;
        if let Some(mqtt) = &self.mqtt {
            validate_topic_prefix(&mqtt.topic_prefix)?;
            if mqtt.client_id.trim().is_empty() {
                return Err(anyhow!("mqtt client_id must not be empty"));
            }
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
    }
}
