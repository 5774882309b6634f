use anyhow::Result;

use crate::telemetry::LogContext;
use crate::PatientId;

/// Physical/alarm path for critical events.
pub trait AlarmEscalator: Send + Sync {
    fn escalate(&self, patient_id: PatientId, room: Option<&str>, message: &str) -> Result<()>;
}

/// Escalation that only writes an error-level log line naming the room.
pub struct LogAlarm {
    log: LogContext,
}

impl LogAlarm {
    pub fn new(log: LogContext) -> Self {
        Self { log }
    }
}

impl AlarmEscalator for LogAlarm {
    fn escalate(&self, patient_id: PatientId, room: Option<&str>, message: &str) -> Result<()> {
        self.log.error(format_args!(
            "ALARM patient={} room={}: {}",
            patient_id,
            room.unwrap_or("unassigned"),
            message
        ));
        Ok(())
    }
}
