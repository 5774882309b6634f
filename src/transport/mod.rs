//! Wire framing for staff and camera connections, and MQTT escalation.

pub mod mqtt;
pub mod wire;

pub use mqtt::{parse_mqtt_endpoint, MqttAlarm, MqttEndpoint, MqttSettings};
pub use wire::{read_message, write_message, Message};
