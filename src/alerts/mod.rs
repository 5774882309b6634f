//! Alert fan-out, acknowledgement, and escalation.
//!
//! A qualifying movement produces one alert row per recipient (assigned
//! clinician plus every nurse) and a best-effort push to each recipient's live
//! channels. Critical movements are also escalated to the alarm path.
//!
//! Frame processing hands requests to an `AlertSink`. `AlertQueue` runs
//! dispatch on a worker thread so a slow channel never stalls video.

mod channels;
mod escalation;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

pub use channels::{
    AlertNotification, ChannelId, ChannelRegistry, DeliveryStats, NotificationChannel,
};
pub use escalation::{AlarmEscalator, LogAlarm};

use crate::detect::Zone;
use crate::storage::PatientStore;
use crate::telemetry::LogContext;
use crate::{
    now_s, Actor, AlertId, AlertRecord, MovementId, NewAlert, PatientContext, PipelineError,
    SeverityTier, StaffRole, UserId,
};

/// `"<Tier> movement detected: <zone> moved for <d> seconds with intensity <i>%"`.
pub fn movement_message(tier: SeverityTier, zone: Zone, duration_s: f64, intensity: f64) -> String {
    format!(
        "{} movement detected: {} moved for {:.1} seconds with intensity {:.1}%",
        tier.title(),
        zone,
        duration_s,
        intensity
    )
}

/// One qualifying movement, ready for fan-out.
#[derive(Clone, Debug)]
pub struct AlertRequest {
    pub patient: PatientContext,
    pub movement_id: Option<MovementId>,
    pub severity: SeverityTier,
    pub message: String,
    pub created_at: u64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DispatchReport {
    pub recipients: Vec<UserId>,
    pub alerts_created: Vec<AlertId>,
    pub persistence_failures: usize,
    pub deliveries: usize,
    pub failed_channels: usize,
    pub escalated: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotRecipient,
    AlreadyAcknowledged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged { at: u64 },
    Denied(DenyReason),
    NotFound,
}

impl AckOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckOutcome::Acknowledged { .. } => "acknowledged",
            AckOutcome::Denied(_) => "denied",
            AckOutcome::NotFound => "not_found",
        }
    }
}

/// Receives alert requests from frame processing.
pub trait AlertSink: Send + Sync {
    fn submit(&self, request: AlertRequest) -> Result<()>;
}

// -------------------- Dispatcher --------------------

pub struct AlertDispatcher {
    store: Arc<dyn PatientStore>,
    channels: Arc<ChannelRegistry>,
    escalator: Arc<dyn AlarmEscalator>,
    log: LogContext,
}

impl AlertDispatcher {
    pub fn new(
        store: Arc<dyn PatientStore>,
        channels: Arc<ChannelRegistry>,
        escalator: Arc<dyn AlarmEscalator>,
        log: LogContext,
    ) -> Self {
        Self {
            store,
            channels,
            escalator,
            log,
        }
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    /// Assigned clinician first, then nurses, without duplicates.
    fn recipients(&self, patient: &PatientContext) -> Vec<UserId> {
        let mut recipients = Vec::new();
        if let Some(clinician) = patient.assigned_clinician {
            recipients.push(clinician);
        }
        match self.store.users_with_role(StaffRole::Nurse) {
            Ok(nurses) => {
                for nurse in nurses {
                    if !recipients.contains(&nurse.user_id) {
                        recipients.push(nurse.user_id);
                    }
                }
            }
            Err(err) => {
                let failure = PipelineError::Persistence(format!("nurse roster: {}", err));
                self.log.error(format_args!("{}", failure));
            }
        }
        recipients
    }

    pub fn dispatch(&self, request: &AlertRequest) -> DispatchReport {
        let log = self.log.scoped("patient", request.patient.patient_id);
        let mut report = DispatchReport::default();
        if !request.severity.warrants_alert() {
            return report;
        }

        report.recipients = self.recipients(&request.patient);
        if report.recipients.is_empty() {
            log.warn(format_args!("no recipients for {} alert", request.severity.as_str()));
        }

        for recipient in &report.recipients {
            let alert = NewAlert {
                patient_id: request.patient.patient_id,
                recipient: *recipient,
                movement_id: request.movement_id,
                message: request.message.clone(),
                severity: request.severity,
                created_at: request.created_at,
            };
            let alert_id = match self.store.create_alert(&alert) {
                Ok(id) => {
                    report.alerts_created.push(id);
                    Some(id)
                }
                Err(err) => {
                    report.persistence_failures += 1;
                    log.error(format_args!("alert for user {} not stored: {}", recipient, err));
                    None
                }
            };
            let notification = AlertNotification {
                alert_id,
                patient_id: request.patient.patient_id,
                severity: request.severity,
                message: request.message.clone(),
                timestamp: request.created_at,
            };
            let stats = self.channels.deliver(*recipient, &notification);
            report.deliveries += stats.delivered;
            report.failed_channels += stats.failed;
        }

        if request.severity == SeverityTier::Critical {
            match self.escalator.escalate(
                request.patient.patient_id,
                request.patient.room.as_deref(),
                &request.message,
            ) {
                Ok(()) => report.escalated = true,
                Err(err) => log.error(format_args!("escalation failed: {}", err)),
            }
        }

        log.info(format_args!(
            "{} alert: recipients={} stored={} pushed={} escalated={}",
            request.severity.as_str(),
            report.recipients.len(),
            report.alerts_created.len(),
            report.deliveries,
            report.escalated
        ));
        report
    }

    pub fn acknowledge(&self, alert_id: AlertId, actor: &Actor) -> Result<AckOutcome> {
        self.acknowledge_at(alert_id, actor, now_s()?)
    }

    /// Acknowledge as `actor` at time `at`. Allowed for the alert's recipient or
    /// a supervisory role, and only once.
    pub fn acknowledge_at(&self, alert_id: AlertId, actor: &Actor, at: u64) -> Result<AckOutcome> {
        let Some(alert) = self.store.fetch_alert(alert_id)? else {
            return Ok(AckOutcome::NotFound);
        };
        if alert.recipient != actor.user_id && !actor.role.is_supervisory() {
            let denied = PipelineError::UnauthorizedAcknowledgement {
                alert_id,
                actor: actor.user_id,
            };
            self.log.warn(format_args!("{}", denied));
            return Ok(AckOutcome::Denied(DenyReason::NotRecipient));
        }
        if alert.acknowledged {
            return Ok(AckOutcome::Denied(DenyReason::AlreadyAcknowledged));
        }
        if self.store.acknowledge_alert(alert_id, at)? {
            self.log.info(format_args!(
                "alert {} acknowledged by user {} ({})",
                alert_id,
                actor.user_id,
                actor.role.as_str()
            ));
            Ok(AckOutcome::Acknowledged { at })
        } else {
            Ok(AckOutcome::Denied(DenyReason::AlreadyAcknowledged))
        }
    }

    pub fn pending_for(&self, user_id: UserId) -> Result<Vec<AlertRecord>> {
        self.store.alerts_for_recipient(user_id, true)
    }
}

impl AlertSink for AlertDispatcher {
    fn submit(&self, request: AlertRequest) -> Result<()> {
        self.dispatch(&request);
        Ok(())
    }
}

// -------------------- Queue --------------------

/// Requests waiting for the dispatch worker before new ones are refused.
pub const ALERT_QUEUE_CAPACITY: usize = 4096;

/// Dispatches alerts on a dedicated worker thread.
///
/// The queue is bounded. When it is full, `submit` refuses the request and
/// counts it in `rejected()`; frame processing never waits on it.
pub struct AlertQueue {
    tx: Mutex<Option<mpsc::SyncSender<AlertRequest>>>,
    join: Mutex<Option<JoinHandle<()>>>,
    rejected: AtomicU64,
}

impl AlertQueue {
    pub fn start(dispatcher: Arc<AlertDispatcher>) -> Result<Self> {
        Self::with_capacity(dispatcher, ALERT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(dispatcher: Arc<AlertDispatcher>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("alert queue capacity must be >= 1"));
        }
        let (tx, rx) = mpsc::sync_channel::<AlertRequest>(capacity);
        let join = std::thread::Builder::new()
            .name("alert-dispatch".to_string())
            .spawn(move || {
                for request in rx {
                    dispatcher.dispatch(&request);
                }
            })?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            join: Mutex::new(Some(join)),
            rejected: AtomicU64::new(0),
        })
    }

    /// Requests refused because the queue was full.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Stop accepting requests, drain what is queued, and join the worker.
    pub fn shutdown(&self) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| anyhow!("alert queue lock poisoned"))?
            .take();
        drop(tx);
        let join = self
            .join
            .lock()
            .map_err(|_| anyhow!("alert queue lock poisoned"))?
            .take();
        if let Some(join) = join {
            join.join()
                .map_err(|_| anyhow!("alert dispatch thread panicked"))?;
        }
        Ok(())
    }
}

impl AlertSink for AlertQueue {
    fn submit(&self, request: AlertRequest) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| anyhow!("alert queue lock poisoned"))?;
        let Some(tx) = tx.as_ref() else {
            return Err(anyhow!("alert queue is shut down"));
        };
        match tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(mpsc::TrySendError::Full(request)) => {
                let rejected = self.rejected.fetch_add(1, Ordering::Relaxed) + 1;
                Err(anyhow!(
                    "alert queue full, {} alert for patient {} refused ({} refused so far)",
                    request.severity.as_str(),
                    request.patient.patient_id,
                    rejected
                ))
            }
            Err(mpsc::TrySendError::Disconnected(_)) => {
                Err(anyhow!("alert dispatch thread stopped"))
            }
        }
    }
}

impl Drop for AlertQueue {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryPatientStore, NewPatient};
    use crate::{Acuity, AlertRecord, MovementId, NewAlert, PatientId, SeverityCounts, StaffMember};
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    /// Store whose alert writes or roster lookups can be switched off.
    struct FaultyStore {
        inner: Arc<InMemoryPatientStore>,
        fail_alerts: AtomicBool,
        fail_roster: AtomicBool,
    }

    impl FaultyStore {
        fn wrap(inner: Arc<InMemoryPatientStore>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                fail_alerts: AtomicBool::new(false),
                fail_roster: AtomicBool::new(false),
            })
        }
    }

    impl PatientStore for FaultyStore {
        fn fetch_patient(&self, patient_id: PatientId) -> Result<Option<PatientContext>> {
            self.inner.fetch_patient(patient_id)
        }

        fn create_movement(&self, movement: &crate::NewMovement) -> Result<MovementId> {
            self.inner.create_movement(movement)
        }

        fn create_alert(&self, alert: &NewAlert) -> Result<AlertId> {
            if self.fail_alerts.load(Ordering::SeqCst) {
                return Err(PipelineError::Persistence("alerts table locked".into()).into());
            }
            self.inner.create_alert(alert)
        }

        fn users_with_role(&self, role: StaffRole) -> Result<Vec<StaffMember>> {
            if self.fail_roster.load(Ordering::SeqCst) {
                return Err(PipelineError::Persistence("users table locked".into()).into());
            }
            self.inner.users_with_role(role)
        }

        fn fetch_alert(&self, alert_id: AlertId) -> Result<Option<AlertRecord>> {
            self.inner.fetch_alert(alert_id)
        }

        fn acknowledge_alert(&self, alert_id: AlertId, at: u64) -> Result<bool> {
            self.inner.acknowledge_alert(alert_id, at)
        }

        fn alerts_for_recipient(&self, recipient: UserId, pending_only: bool) -> Result<Vec<AlertRecord>> {
            self.inner.alerts_for_recipient(recipient, pending_only)
        }

        fn movement_counts(&self, patient_id: PatientId) -> Result<SeverityCounts> {
            self.inner.movement_counts(patient_id)
        }
    }

    struct BrokenAlarm;

    impl AlarmEscalator for BrokenAlarm {
        fn escalate(&self, _patient_id: PatientId, _room: Option<&str>, _message: &str) -> Result<()> {
            Err(anyhow!("alarm relay unreachable"))
        }
    }

    #[derive(Default)]
    struct Inbox {
        received: Mutex<Vec<AlertNotification>>,
    }

    impl NotificationChannel for Inbox {
        fn push(&self, notification: &AlertNotification) -> Result<()> {
            self.received.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    /// Blocks every push until the test sends a release token.
    struct GatedChannel {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl NotificationChannel for GatedChannel {
        fn push(&self, _notification: &AlertNotification) -> Result<()> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            Ok(())
        }
    }

    struct RecordingAlarm {
        calls: Mutex<Vec<(PatientId, Option<String>)>>,
    }

    impl AlarmEscalator for RecordingAlarm {
        fn escalate(&self, patient_id: PatientId, room: Option<&str>, _message: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((patient_id, room.map(str::to_string)));
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<InMemoryPatientStore>,
        alarm: Arc<RecordingAlarm>,
        dispatcher: AlertDispatcher,
        doctor: UserId,
        nurses: Vec<UserId>,
        patient: PatientContext,
    }

    fn fixture(acuity: Acuity) -> Fixture {
        let store = Arc::new(InMemoryPatientStore::new());
        let doctor = store.insert_user("Dr. Osei", StaffRole::Doctor).unwrap();
        let nurses = vec![
            store.insert_user("N. Park", StaffRole::Nurse).unwrap(),
            store.insert_user("N. Lima", StaffRole::Nurse).unwrap(),
        ];
        let patient_id = store
            .insert_patient(&NewPatient::new("P", acuity).room("4A").clinician(doctor))
            .unwrap();
        let patient = store.fetch_patient(patient_id).unwrap().unwrap();
        let alarm = Arc::new(RecordingAlarm {
            calls: Mutex::new(Vec::new()),
        });
        let dispatcher = AlertDispatcher::new(
            store.clone(),
            Arc::new(ChannelRegistry::new(LogContext::new("test"))),
            alarm.clone(),
            LogContext::new("test"),
        );
        Fixture {
            store,
            alarm,
            dispatcher,
            doctor,
            nurses,
            patient,
        }
    }

    fn request(patient: &PatientContext, severity: SeverityTier) -> AlertRequest {
        AlertRequest {
            patient: patient.clone(),
            movement_id: None,
            severity,
            message: movement_message(severity, Zone::Head, 6.0, 0.4),
            created_at: 1_000,
        }
    }

    #[test]
    fn message_format() {
        assert_eq!(
            movement_message(SeverityTier::Attention, Zone::LeftArm, 5.5, 0.42),
            "Attention movement detected: left_arm moved for 5.5 seconds with intensity 0.4%"
        );
    }

    #[test]
    fn attention_alerts_clinician_and_every_nurse() {
        let f = fixture(Acuity::Stable);
        let report = f
            .dispatcher
            .dispatch(&request(&f.patient, SeverityTier::Attention));
        let mut expected = vec![f.doctor];
        expected.extend(&f.nurses);
        assert_eq!(report.recipients, expected);
        assert_eq!(report.alerts_created.len(), 3);
        assert!(!report.escalated);
        assert!(f.alarm.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn critical_escalates_with_room() {
        let f = fixture(Acuity::Critical);
        let report = f
            .dispatcher
            .dispatch(&request(&f.patient, SeverityTier::Critical));
        assert!(report.escalated);
        assert_eq!(
            f.alarm.calls.lock().unwrap().as_slice(),
            &[(f.patient.patient_id, Some("4A".to_string()))]
        );
    }

    #[test]
    fn normal_tier_is_ignored() {
        let f = fixture(Acuity::Stable);
        let report = f.dispatcher.dispatch(&request(&f.patient, SeverityTier::Normal));
        assert_eq!(report, DispatchReport::default());
        assert_eq!(f.store.alert_total().unwrap(), 0);
    }

    #[test]
    fn clinician_who_is_also_a_nurse_gets_one_alert() {
        let f = fixture(Acuity::Stable);
        let mut patient = f.patient.clone();
        patient.assigned_clinician = Some(f.nurses[0]);
        let report = f.dispatcher.dispatch(&request(&patient, SeverityTier::Attention));
        assert_eq!(report.recipients, f.nurses);
    }

    #[test]
    fn acknowledgement_rules() {
        let f = fixture(Acuity::Stable);
        let report = f
            .dispatcher
            .dispatch(&request(&f.patient, SeverityTier::Attention));
        let doctors_alert = report.alerts_created[0];

        let nurse = Actor {
            user_id: f.nurses[0],
            role: StaffRole::Nurse,
        };
        assert_eq!(
            f.dispatcher.acknowledge_at(doctors_alert, &nurse, 10).unwrap(),
            AckOutcome::Denied(DenyReason::NotRecipient)
        );

        let doctor = Actor {
            user_id: f.doctor,
            role: StaffRole::Doctor,
        };
        assert_eq!(
            f.dispatcher.acknowledge_at(doctors_alert, &doctor, 20).unwrap(),
            AckOutcome::Acknowledged { at: 20 }
        );
        assert_eq!(
            f.dispatcher.acknowledge_at(doctors_alert, &doctor, 30).unwrap(),
            AckOutcome::Denied(DenyReason::AlreadyAcknowledged)
        );
        let stored = f.store.fetch_alert(doctors_alert).unwrap().unwrap();
        assert_eq!(stored.acknowledged_at, Some(20));

        let supervisor = Actor {
            user_id: UserId(999),
            role: StaffRole::Supervisor,
        };
        let nurses_alert = report.alerts_created[1];
        assert_eq!(
            f.dispatcher.acknowledge_at(nurses_alert, &supervisor, 40).unwrap(),
            AckOutcome::Acknowledged { at: 40 }
        );
        assert_eq!(
            f.dispatcher.acknowledge_at(AlertId(12345), &supervisor, 50).unwrap(),
            AckOutcome::NotFound
        );
    }

    #[test]
    fn queue_drains_on_shutdown() {
        let f = fixture(Acuity::Stable);
        let store = f.store.clone();
        let queue = AlertQueue::start(Arc::new(f.dispatcher)).unwrap();
        for _ in 0..3 {
            queue
                .submit(request(&f.patient, SeverityTier::Attention))
                .unwrap();
        }
        queue.shutdown().unwrap();
        assert_eq!(store.alert_total().unwrap(), 9);
        assert!(queue
            .submit(request(&f.patient, SeverityTier::Attention))
            .is_err());
    }

    #[test]
    fn alert_write_failure_still_pushes_without_id() {
        let f = fixture(Acuity::Stable);
        let store = FaultyStore::wrap(f.store.clone());
        store.fail_alerts.store(true, Ordering::SeqCst);
        let channels = Arc::new(ChannelRegistry::new(LogContext::new("test")));
        let inbox = Arc::new(Inbox::default());
        channels.register(f.doctor, inbox.clone()).unwrap();
        let dispatcher = AlertDispatcher::new(
            store,
            channels,
            f.alarm.clone(),
            LogContext::new("test"),
        );

        let report = dispatcher.dispatch(&request(&f.patient, SeverityTier::Attention));
        assert_eq!(report.recipients.len(), 3);
        assert!(report.alerts_created.is_empty());
        assert_eq!(report.persistence_failures, 3);
        assert_eq!(report.deliveries, 1);

        let received = inbox.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].alert_id, None);
        assert_eq!(received[0].patient_id, f.patient.patient_id);
        assert_eq!(f.store.alert_total().unwrap(), 0);
    }

    #[test]
    fn roster_failure_still_alerts_clinician() {
        let f = fixture(Acuity::Stable);
        let store = FaultyStore::wrap(f.store.clone());
        store.fail_roster.store(true, Ordering::SeqCst);
        let dispatcher = AlertDispatcher::new(
            store,
            Arc::new(ChannelRegistry::new(LogContext::new("test"))),
            f.alarm.clone(),
            LogContext::new("test"),
        );

        let report = dispatcher.dispatch(&request(&f.patient, SeverityTier::Attention));
        assert_eq!(report.recipients, vec![f.doctor]);
        assert_eq!(report.alerts_created.len(), 1);
        assert_eq!(report.persistence_failures, 0);
    }

    #[test]
    fn escalation_failure_does_not_stop_fan_out() {
        let f = fixture(Acuity::Critical);
        let channels = Arc::new(ChannelRegistry::new(LogContext::new("test")));
        let inbox = Arc::new(Inbox::default());
        channels.register(f.nurses[1], inbox.clone()).unwrap();
        let dispatcher = AlertDispatcher::new(
            f.store.clone(),
            channels,
            Arc::new(BrokenAlarm),
            LogContext::new("test"),
        );

        let report = dispatcher.dispatch(&request(&f.patient, SeverityTier::Critical));
        assert!(!report.escalated);
        assert_eq!(report.alerts_created.len(), 3);
        assert_eq!(report.deliveries, 1);
        assert_eq!(inbox.received.lock().unwrap().len(), 1);
    }

    #[test]
    fn queue_shutdown_delivers_pushes_before_returning() {
        let f = fixture(Acuity::Stable);
        let inbox = Arc::new(Inbox::default());
        f.dispatcher.channels().register(f.doctor, inbox.clone()).unwrap();
        let queue = AlertQueue::start(Arc::new(f.dispatcher)).unwrap();
        for _ in 0..4 {
            queue
                .submit(request(&f.patient, SeverityTier::Attention))
                .unwrap();
        }
        queue.shutdown().unwrap();
        assert_eq!(inbox.received.lock().unwrap().len(), 4);
    }

    #[test]
    fn full_queue_refuses_without_blocking() {
        let f = fixture(Acuity::Stable);
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        f.dispatcher
            .channels()
            .register(
                f.doctor,
                Arc::new(GatedChannel {
                    entered: Mutex::new(entered_tx),
                    release: Mutex::new(release_rx),
                }),
            )
            .unwrap();
        let store = f.store.clone();
        let queue = AlertQueue::with_capacity(Arc::new(f.dispatcher), 1).unwrap();

        // First request is taken by the worker, which then blocks in push.
        queue
            .submit(request(&f.patient, SeverityTier::Attention))
            .unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        queue
            .submit(request(&f.patient, SeverityTier::Attention))
            .unwrap();
        assert!(queue
            .submit(request(&f.patient, SeverityTier::Attention))
            .is_err());
        assert_eq!(queue.rejected(), 1);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        queue.shutdown().unwrap();
        assert_eq!(store.alert_total().unwrap(), 6);
        assert!(AlertQueue::with_capacity(Arc::new(fixture(Acuity::Stable).dispatcher), 0).is_err());
    }
}
