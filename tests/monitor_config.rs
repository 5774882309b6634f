use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use ward_motion::config::MonitorConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "WARD_CONFIG",
        "WARD_DB_PATH",
        "WARD_STREAM_ADDR",
        "WARD_ALERTS_ADDR",
        "WARD_TOKENS_PATH",
        "WARD_MIN_AREA",
        "WARD_MQTT_BROKER",
    ] {
        std::env::remove_var(key);
    }
}

fn config_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = MonitorConfig::load().expect("load defaults");
    assert_eq!(cfg.db_path, "ward_motion.db");
    assert_eq!(cfg.stream_addr, "127.0.0.1:8765");
    assert_eq!(cfg.alerts_addr, "127.0.0.1:8766");
    assert_eq!(cfg.tracker.min_area, 500);
    assert_eq!(cfg.tracker.grace_s, 2.0);
    assert_eq!(cfg.segmentation.dilation_iterations, 2);
    assert!(cfg.mqtt.is_none());

    clear_env();
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".json",
        r#"{
            "db_path": "ward_east.db",
            "stream": { "addr": "0.0.0.0:9100" },
            "alerts": { "addr": "0.0.0.0:9101", "tokens_path": "/etc/ward/tokens.json" },
            "segmentation": { "learning_rate": 0.02, "variance_threshold": 9.0 },
            "tracker": { "min_area": 300, "position_quantum": 16 },
            "mqtt": { "broker": "mqtts://broker.local:8883", "topic_prefix": "ward/east" }
        }"#,
    );

    std::env::set_var("WARD_CONFIG", file.path());
    std::env::set_var("WARD_ALERTS_ADDR", "127.0.0.1:9200");
    std::env::set_var("WARD_MIN_AREA", "750");

    let cfg = MonitorConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "ward_east.db");
    assert_eq!(cfg.stream_addr, "0.0.0.0:9100");
    assert_eq!(cfg.alerts_addr, "127.0.0.1:9200");
    assert_eq!(cfg.tokens_path, PathBuf::from("/etc/ward/tokens.json"));
    assert_eq!(cfg.segmentation.learning_rate, 0.02);
    assert_eq!(cfg.segmentation.variance_threshold, 9.0);
    assert_eq!(cfg.segmentation.max_variance, 75.0);
    assert_eq!(cfg.tracker.min_area, 750);
    assert_eq!(cfg.tracker.position_quantum, 16);

    let mqtt = cfg.mqtt.expect("mqtt settings");
    assert_eq!(mqtt.broker, "mqtts://broker.local:8883");
    assert_eq!(mqtt.topic_prefix, "ward/east");
    assert_eq!(mqtt.client_id, "ward-monitord");

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".toml",
        r#"
db_path = "ward.db"

[tracker]
grace_s = 3.5

[segmentation]
min_variance = 2.0
"#,
    );
    std::env::set_var("WARD_CONFIG", file.path());
    std::env::set_var("WARD_MQTT_BROKER", "127.0.0.1:1883");

    let cfg = MonitorConfig::load().expect("load toml config");
    assert_eq!(cfg.db_path, "ward.db");
    assert_eq!(cfg.tracker.grace_s, 3.5);
    assert_eq!(cfg.segmentation.min_variance, 2.0);
    assert_eq!(cfg.mqtt.expect("broker from env").broker, "127.0.0.1:1883");

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(".json", r#"{ "segmentation": { "learning_rate": 1.5 } }"#);
    std::env::set_var("WARD_CONFIG", file.path());
    assert!(MonitorConfig::load().is_err());

    let file = config_file(
        ".json",
        r#"{ "segmentation": { "min_variance": 50.0, "initial_variance": 15.0 } }"#,
    );
    std::env::set_var("WARD_CONFIG", file.path());
    assert!(MonitorConfig::load().is_err());

    std::env::remove_var("WARD_CONFIG");
    std::env::set_var("WARD_MIN_AREA", "0");
    assert!(MonitorConfig::load().is_err());
    std::env::set_var("WARD_MIN_AREA", "lots");
    assert!(MonitorConfig::load().is_err());
    std::env::remove_var("WARD_MIN_AREA");

    std::env::set_var("WARD_STREAM_ADDR", "not-an-address");
    assert!(MonitorConfig::load().is_err());
    std::env::remove_var("WARD_STREAM_ADDR");

    let file = config_file(".json", r#"{ "mqtt": { "broker": "x:1", "topic_prefix": "ward/#" } }"#);
    std::env::set_var("WARD_CONFIG", file.path());
    assert!(MonitorConfig::load().is_err());

    clear_env();
}
