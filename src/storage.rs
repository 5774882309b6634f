use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::{
    Acuity, AlertId, AlertRecord, MovementId, NewAlert, NewMovement, PatientContext, PatientId,
    PipelineError, SeverityCounts, SeverityTier, StaffMember, StaffRole, UserId,
    DEFAULT_SENSITIVITY,
};

/// Persistence collaborator consumed by sessions and the alert dispatcher.
///
/// Every call may fail; callers treat failures as recoverable.
pub trait PatientStore: Send + Sync {
    fn fetch_patient(&self, patient_id: PatientId) -> Result<Option<PatientContext>>;

    fn create_movement(&self, movement: &NewMovement) -> Result<MovementId>;

    fn create_alert(&self, alert: &NewAlert) -> Result<AlertId>;

    fn users_with_role(&self, role: StaffRole) -> Result<Vec<StaffMember>>;

    fn fetch_alert(&self, alert_id: AlertId) -> Result<Option<AlertRecord>>;

    /// Mark a pending alert acknowledged at `at`. Returns false when the alert
    /// is missing or was already acknowledged; the stored timestamp is never
    /// overwritten.
    fn acknowledge_alert(&self, alert_id: AlertId, at: u64) -> Result<bool>;

    fn alerts_for_recipient(&self, recipient: UserId, pending_only: bool)
        -> Result<Vec<AlertRecord>>;

    fn movement_counts(&self, patient_id: PatientId) -> Result<SeverityCounts>;
}

/// Patient row used to seed a store.
#[derive(Clone, Debug)]
pub struct NewPatient {
    pub full_name: String,
    pub acuity: Acuity,
    pub sensitivity: f64,
    pub room: Option<String>,
    pub assigned_clinician: Option<UserId>,
}

impl NewPatient {
    pub fn new(full_name: &str, acuity: Acuity) -> Self {
        Self {
            full_name: full_name.to_string(),
            acuity,
            sensitivity: DEFAULT_SENSITIVITY,
            room: None,
            assigned_clinician: None,
        }
    }

    pub fn room(mut self, room: &str) -> Self {
        self.room = Some(room.to_string());
        self
    }

    pub fn clinician(mut self, clinician: UserId) -> Self {
        self.assigned_clinician = Some(clinician);
        self
    }

    pub fn sensitivity(mut self, sensitivity: f64) -> Self {
        self.sensitivity = sensitivity;
        self
    }
}

fn persistence(err: impl std::fmt::Display) -> anyhow::Error {
    PipelineError::Persistence(err.to_string()).into()
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("{} exceeds i64 range", what))
}

// -------------------- SQLite --------------------

pub struct SqlitePatientStore {
    conn: Mutex<Connection>,
}

impl SqlitePatientStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("patient store lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS users (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              full_name TEXT NOT NULL,
              role TEXT NOT NULL,
              is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS patients (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              full_name TEXT NOT NULL,
              status TEXT NOT NULL,
              room_number TEXT,
              sensitivity_level REAL NOT NULL DEFAULT 1.0,
              doctor_id INTEGER REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS movements (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              patient_id INTEGER NOT NULL REFERENCES patients(id),
              timestamp INTEGER NOT NULL,
              movement_type TEXT NOT NULL,
              body_part TEXT NOT NULL,
              duration_seconds REAL NOT NULL,
              intensity REAL NOT NULL,
              severity TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alerts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              patient_id INTEGER NOT NULL REFERENCES patients(id),
              recipient_id INTEGER NOT NULL REFERENCES users(id),
              movement_id INTEGER REFERENCES movements(id),
              timestamp INTEGER NOT NULL,
              message TEXT NOT NULL,
              severity TEXT NOT NULL,
              acknowledged INTEGER NOT NULL DEFAULT 0,
              acknowledged_timestamp INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_movements_patient ON movements(patient_id);
            CREATE INDEX IF NOT EXISTS idx_alerts_recipient ON alerts(recipient_id, acknowledged);
            "#,
        )?;
        Ok(())
    }

    pub fn insert_user(&self, full_name: &str, role: StaffRole) -> Result<UserId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users(full_name, role) VALUES (?1, ?2)",
            params![full_name, role.as_str()],
        )?;
        Ok(UserId(conn.last_insert_rowid()))
    }

    pub fn insert_patient(&self, patient: &NewPatient) -> Result<PatientId> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO patients(full_name, status, room_number, sensitivity_level, doctor_id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                patient.full_name,
                patient.acuity.as_str(),
                patient.room,
                patient.sensitivity,
                patient.assigned_clinician.map(|id| id.0)
            ],
        )?;
        Ok(PatientId(conn.last_insert_rowid()))
    }
}

const ALERT_COLUMNS: &str = "id, patient_id, recipient_id, movement_id, message, severity, \
                             timestamp, acknowledged, acknowledged_timestamp";

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<(AlertRecord, String)> {
    let severity: String = row.get(5)?;
    let created_at: i64 = row.get(6)?;
    let acknowledged_at: Option<i64> = row.get(8)?;
    Ok((
        AlertRecord {
            id: AlertId(row.get(0)?),
            patient_id: PatientId(row.get(1)?),
            recipient: UserId(row.get(2)?),
            movement_id: row.get::<_, Option<i64>>(3)?.map(MovementId),
            message: row.get(4)?,
            severity: SeverityTier::Normal,
            created_at: created_at.max(0) as u64,
            acknowledged: row.get::<_, i64>(7)? != 0,
            acknowledged_at: acknowledged_at.map(|at| at.max(0) as u64),
        },
        severity,
    ))
}

fn finish_alert((mut record, severity): (AlertRecord, String)) -> Result<AlertRecord> {
    record.severity = severity.parse()?;
    Ok(record)
}

impl PatientStore for SqlitePatientStore {
    fn fetch_patient(&self, patient_id: PatientId) -> Result<Option<PatientContext>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT status, sensitivity_level, room_number, doctor_id FROM patients WHERE id = ?1",
                params![patient_id.0],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(persistence)?;
        let Some((status, sensitivity, room, doctor)) = row else {
            return Ok(None);
        };
        Ok(Some(PatientContext {
            patient_id,
            acuity: status.parse()?,
            sensitivity,
            room,
            assigned_clinician: doctor.map(UserId),
        }))
    }

    fn create_movement(&self, movement: &NewMovement) -> Result<MovementId> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO movements(patient_id, timestamp, movement_type, body_part,
                                  duration_seconds, intensity, severity)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                movement.patient_id.0,
                to_i64(movement.recorded_at, "movement timestamp")?,
                movement.movement_type,
                movement.zone,
                movement.duration_s,
                movement.intensity,
                movement.severity.as_str()
            ],
        )
        .map_err(persistence)?;
        Ok(MovementId(conn.last_insert_rowid()))
    }

    fn create_alert(&self, alert: &NewAlert) -> Result<AlertId> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO alerts(patient_id, recipient_id, movement_id, timestamp, message, severity)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                alert.patient_id.0,
                alert.recipient.0,
                alert.movement_id.map(|id| id.0),
                to_i64(alert.created_at, "alert timestamp")?,
                alert.message,
                alert.severity.as_str()
            ],
        )
        .map_err(persistence)?;
        Ok(AlertId(conn.last_insert_rowid()))
    }

    fn users_with_role(&self, role: StaffRole) -> Result<Vec<StaffMember>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, full_name FROM users WHERE role = ?1 AND is_active = 1 ORDER BY id")
            .map_err(persistence)?;
        let mut rows = stmt.query(params![role.as_str()]).map_err(persistence)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(persistence)? {
            out.push(StaffMember {
                user_id: UserId(row.get(0)?),
                full_name: row.get(1)?,
                role,
            });
        }
        Ok(out)
    }

    fn fetch_alert(&self, alert_id: AlertId) -> Result<Option<AlertRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM alerts WHERE id = ?1", ALERT_COLUMNS),
                params![alert_id.0],
                alert_from_row,
            )
            .optional()
            .map_err(persistence)?;
        row.map(finish_alert).transpose()
    }

    fn acknowledge_alert(&self, alert_id: AlertId, at: u64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                r#"
                UPDATE alerts SET acknowledged = 1, acknowledged_timestamp = ?2
                WHERE id = ?1 AND acknowledged = 0
                "#,
                params![alert_id.0, to_i64(at, "acknowledgement timestamp")?],
            )
            .map_err(persistence)?;
        Ok(changed == 1)
    }

    fn alerts_for_recipient(
        &self,
        recipient: UserId,
        pending_only: bool,
    ) -> Result<Vec<AlertRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM alerts WHERE recipient_id = ?1 {} ORDER BY id DESC",
            ALERT_COLUMNS,
            if pending_only { "AND acknowledged = 0" } else { "" }
        );
        let mut stmt = conn.prepare(&sql).map_err(persistence)?;
        let rows = stmt
            .query_map(params![recipient.0], alert_from_row)
            .map_err(persistence)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_alert(row.map_err(persistence)?)?);
        }
        Ok(out)
    }

    fn movement_counts(&self, patient_id: PatientId) -> Result<SeverityCounts> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT severity, COUNT(*) FROM movements WHERE patient_id = ?1 GROUP BY severity")
            .map_err(persistence)?;
        let mut rows = stmt.query(params![patient_id.0]).map_err(persistence)?;
        let mut counts = SeverityCounts::default();
        while let Some(row) = rows.next().map_err(persistence)? {
            let severity: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let count = count.max(0) as u64;
            match severity.parse::<SeverityTier>()? {
                SeverityTier::Normal => counts.normal += count,
                SeverityTier::Attention => counts.attention += count,
                SeverityTier::Critical => counts.critical += count,
            }
        }
        Ok(counts)
    }
}

// -------------------- In-memory --------------------

#[derive(Default)]
struct InMemoryState {
    users: Vec<StaffMember>,
    patients: HashMap<PatientId, PatientContext>,
    movements: Vec<(MovementId, NewMovement)>,
    alerts: Vec<AlertRecord>,
    next_id: i64,
}

impl InMemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Store for tests and the demo. Thread-safe, nothing persisted.
#[derive(Default)]
pub struct InMemoryPatientStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryPatientStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, InMemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    pub fn insert_user(&self, full_name: &str, role: StaffRole) -> Result<UserId> {
        let mut state = self.state()?;
        let user_id = UserId(state.next_id());
        state.users.push(StaffMember {
            user_id,
            full_name: full_name.to_string(),
            role,
        });
        Ok(user_id)
    }

    pub fn insert_patient(&self, patient: &NewPatient) -> Result<PatientId> {
        let mut state = self.state()?;
        let patient_id = PatientId(state.next_id());
        state.patients.insert(
            patient_id,
            PatientContext {
                patient_id,
                acuity: patient.acuity,
                sensitivity: patient.sensitivity,
                room: patient.room.clone(),
                assigned_clinician: patient.assigned_clinician,
            },
        );
        Ok(patient_id)
    }

    pub fn movement_total(&self) -> Result<usize> {
        Ok(self.state()?.movements.len())
    }

    pub fn alert_total(&self) -> Result<usize> {
        Ok(self.state()?.alerts.len())
    }

    pub fn movements_for(&self, patient_id: PatientId) -> Result<Vec<NewMovement>> {
        Ok(self
            .state()?
            .movements
            .iter()
            .filter(|(_, m)| m.patient_id == patient_id)
            .map(|(_, m)| m.clone())
            .collect())
    }

    pub fn alerts_for_patient(&self, patient_id: PatientId) -> Result<Vec<AlertRecord>> {
        Ok(self
            .state()?
            .alerts
            .iter()
            .filter(|a| a.patient_id == patient_id)
            .cloned()
            .collect())
    }
}

impl PatientStore for InMemoryPatientStore {
    fn fetch_patient(&self, patient_id: PatientId) -> Result<Option<PatientContext>> {
        Ok(self.state()?.patients.get(&patient_id).cloned())
    }

    fn create_movement(&self, movement: &NewMovement) -> Result<MovementId> {
        let mut state = self.state()?;
        if !state.patients.contains_key(&movement.patient_id) {
            return Err(persistence(format!(
                "movement references unknown patient {}",
                movement.patient_id
            )));
        }
        let id = MovementId(state.next_id());
        state.movements.push((id, movement.clone()));
        Ok(id)
    }

    fn create_alert(&self, alert: &NewAlert) -> Result<AlertId> {
        let mut state = self.state()?;
        let id = AlertId(state.next_id());
        state.alerts.push(AlertRecord {
            id,
            patient_id: alert.patient_id,
            recipient: alert.recipient,
            movement_id: alert.movement_id,
            message: alert.message.clone(),
            severity: alert.severity,
            created_at: alert.created_at,
            acknowledged: false,
            acknowledged_at: None,
        });
        Ok(id)
    }

    fn users_with_role(&self, role: StaffRole) -> Result<Vec<StaffMember>> {
        Ok(self
            .state()?
            .users
            .iter()
            .filter(|u| u.role == role)
            .cloned()
            .collect())
    }

    fn fetch_alert(&self, alert_id: AlertId) -> Result<Option<AlertRecord>> {
        Ok(self
            .state()?
            .alerts
            .iter()
            .find(|a| a.id == alert_id)
            .cloned())
    }

    fn acknowledge_alert(&self, alert_id: AlertId, at: u64) -> Result<bool> {
        let mut state = self.state()?;
        match state.alerts.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) if !alert.acknowledged => {
                alert.acknowledged = true;
                alert.acknowledged_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn alerts_for_recipient(
        &self,
        recipient: UserId,
        pending_only: bool,
    ) -> Result<Vec<AlertRecord>> {
        let mut out: Vec<AlertRecord> = self
            .state()?
            .alerts
            .iter()
            .filter(|a| a.recipient == recipient && !(pending_only && a.acknowledged))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(out)
    }

    fn movement_counts(&self, patient_id: PatientId) -> Result<SeverityCounts> {
        let mut counts = SeverityCounts::default();
        for (_, movement) in self
            .state()?
            .movements
            .iter()
            .filter(|(_, m)| m.patient_id == patient_id)
        {
            counts.record(movement.severity);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn movement(patient_id: PatientId, severity: SeverityTier) -> NewMovement {
        NewMovement {
            patient_id,
            movement_type: "arm_movement".to_string(),
            zone: "left_arm".to_string(),
            duration_s: 1.5,
            intensity: 0.4,
            severity,
            recorded_at: 1_700_000_000,
        }
    }

    fn alert(patient_id: PatientId, recipient: UserId) -> NewAlert {
        NewAlert {
            patient_id,
            recipient,
            movement_id: None,
            message: "Attention movement detected".to_string(),
            severity: SeverityTier::Attention,
            created_at: 1_700_000_000,
        }
    }

    fn exercise(store: &dyn PatientStore, doctor: UserId, patient: PatientId) {
        let ctx = store.fetch_patient(patient).unwrap().expect("patient");
        assert_eq!(ctx.acuity, Acuity::Critical);
        assert_eq!(ctx.room.as_deref(), Some("12B"));
        assert_eq!(ctx.assigned_clinician, Some(doctor));
        assert!(store.fetch_patient(PatientId(999)).unwrap().is_none());

        store.create_movement(&movement(patient, SeverityTier::Normal)).unwrap();
        store.create_movement(&movement(patient, SeverityTier::Critical)).unwrap();
        store.create_movement(&movement(patient, SeverityTier::Critical)).unwrap();
        let counts = store.movement_counts(patient).unwrap();
        assert_eq!((counts.normal, counts.attention, counts.critical), (1, 0, 2));

        let id = store.create_alert(&alert(patient, doctor)).unwrap();
        assert_eq!(store.alerts_for_recipient(doctor, true).unwrap().len(), 1);
        assert!(store.acknowledge_alert(id, 100).unwrap());
        assert!(!store.acknowledge_alert(id, 200).unwrap());
        let stored = store.fetch_alert(id).unwrap().expect("alert");
        assert!(stored.acknowledged);
        assert_eq!(stored.acknowledged_at, Some(100));
        assert_eq!(stored.severity, SeverityTier::Attention);
        assert!(store.alerts_for_recipient(doctor, true).unwrap().is_empty());
        assert_eq!(store.alerts_for_recipient(doctor, false).unwrap().len(), 1);
        assert!(!store.acknowledge_alert(AlertId(4242), 1).unwrap());
    }

    #[test]
    fn in_memory_store_contract() {
        let store = InMemoryPatientStore::new();
        let doctor = store.insert_user("Dr. Okafor", StaffRole::Doctor).unwrap();
        store.insert_user("N. Silva", StaffRole::Nurse).unwrap();
        let patient = store
            .insert_patient(&NewPatient::new("P", Acuity::Critical).room("12B").clinician(doctor))
            .unwrap();
        assert_eq!(store.users_with_role(StaffRole::Nurse).unwrap().len(), 1);
        exercise(&store, doctor, patient);
    }

    #[test]
    fn sqlite_store_contract() {
        let store = SqlitePatientStore::open_in_memory().unwrap();
        let doctor = store.insert_user("Dr. Okafor", StaffRole::Doctor).unwrap();
        store.insert_user("N. Silva", StaffRole::Nurse).unwrap();
        store.insert_user("N. Haddad", StaffRole::Nurse).unwrap();
        let patient = store
            .insert_patient(&NewPatient::new("P", Acuity::Critical).room("12B").clinician(doctor))
            .unwrap();
        assert_eq!(store.users_with_role(StaffRole::Nurse).unwrap().len(), 2);
        exercise(&store, doctor, patient);
    }

    #[test]
    fn in_memory_rejects_movement_for_unknown_patient() {
        let store = InMemoryPatientStore::new();
        let err = store
            .create_movement(&movement(PatientId(5), SeverityTier::Normal))
            .unwrap_err();
        assert_eq!(
            PipelineError::classify(&err).map(|e| e.code()),
            Some("PERSISTENCE_FAILURE")
        );
    }
}
