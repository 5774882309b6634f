//! monitord - bedside motion monitoring daemon
//!
//! This daemon:
//! 1. Opens the patient database
//! 2. Accepts camera streams and runs per-patient motion detection
//! 3. Fans out alerts to subscribed staff and escalates critical movements
//!
//! Subcommands seed staff, patients, and staff tokens.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use ward_motion::auth::{mint_into_file, TokenDirectory};
use ward_motion::config::MonitorConfig;
use ward_motion::storage::NewPatient;
use ward_motion::transport::MqttAlarm;
use ward_motion::{
    api::{AlertServer, StreamServer},
    Actor, Acuity, AlarmEscalator, AlertDispatcher, AlertQueue, ChannelRegistry, DetectorRegistry,
    LogAlarm, LogContext, SessionDeps, SqlitePatientStore, StaffRole, UserId,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Bedside motion monitoring daemon")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the stream and alert endpoints (default).
    Serve,
    /// Add a staff member and print their user id.
    AddStaff {
        #[arg(long)]
        name: String,
        /// doctor, nurse, admin or supervisor.
        #[arg(long)]
        role: String,
    },
    /// Add a patient and print their patient id.
    AddPatient {
        #[arg(long)]
        name: String,
        /// critical, stable or recovering.
        #[arg(long, default_value = "stable")]
        acuity: String,
        #[arg(long)]
        room: Option<String>,
        #[arg(long)]
        clinician: Option<i64>,
        #[arg(long)]
        sensitivity: Option<f64>,
    },
    /// Mint a bearer token for a staff member and append it to the token file.
    MintToken {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        role: String,
        /// Defaults to the configured tokens path.
        #[arg(long, env = "WARD_TOKENS_PATH")]
        out: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = MonitorConfig::load()?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config),
        Command::AddStaff { name, role } => {
            let store = SqlitePatientStore::open(&config.db_path)?;
            let user_id = store.insert_user(&name, role.parse::<StaffRole>()?)?;
            println!("{}", user_id);
            Ok(())
        }
        Command::AddPatient {
            name,
            acuity,
            room,
            clinician,
            sensitivity,
        } => {
            let store = SqlitePatientStore::open(&config.db_path)?;
            let mut patient = NewPatient::new(&name, acuity.parse::<Acuity>()?);
            if let Some(room) = room.as_deref() {
                patient = patient.room(room);
            }
            if let Some(clinician) = clinician {
                patient = patient.clinician(UserId(clinician));
            }
            if let Some(sensitivity) = sensitivity {
                patient = patient.sensitivity(sensitivity);
            }
            let patient_id = store.insert_patient(&patient)?;
            println!("{}", patient_id);
            Ok(())
        }
        Command::MintToken { user_id, role, out } => {
            let path = out.unwrap_or_else(|| config.tokens_path.clone());
            let actor = Actor {
                user_id: UserId(user_id),
                role: role.parse::<StaffRole>()?,
            };
            let token = mint_into_file(&path, actor)?;
            log::info!("token for user {} appended to {}", user_id, path.display());
            println!("{}", token);
            Ok(())
        }
    }
}

fn serve(config: &MonitorConfig) -> Result<()> {
    let log = LogContext::new("ward_motion::monitord");
    let store = Arc::new(SqlitePatientStore::open(&config.db_path)?);

    let auth = if config.tokens_path.exists() {
        TokenDirectory::load(&config.tokens_path)?
    } else {
        log.warn(format_args!(
            "token file {} not found; every staff subscription will be rejected",
            config.tokens_path.display()
        ));
        TokenDirectory::new()
    };
    log.info(format_args!("{} staff tokens loaded", auth.len()));

    let mqtt = match &config.mqtt {
        Some(settings) => Some(Arc::new(MqttAlarm::connect(
            settings,
            log.with_target("ward_motion::mqtt"),
        )?)),
        None => None,
    };
    let escalator: Arc<dyn AlarmEscalator> = match &mqtt {
        Some(alarm) => alarm.clone(),
        None => Arc::new(LogAlarm::new(log.with_target("ward_motion::alarm"))),
    };

    let channels = Arc::new(ChannelRegistry::new(log.with_target("ward_motion::alerts")));
    let dispatcher = Arc::new(AlertDispatcher::new(
        store.clone(),
        channels,
        escalator,
        log.with_target("ward_motion::alerts"),
    ));
    let queue = Arc::new(AlertQueue::start(dispatcher.clone())?);

    let registry = DetectorRegistry::new(
        config.segmentation.clone(),
        config.tracker.clone(),
        log.with_target("ward_motion::detect"),
    );
    let deps = SessionDeps {
        store,
        registry,
        alerts: queue.clone(),
        log: log.with_target("ward_motion::session"),
    };

    let stream_handle = StreamServer::new(deps).spawn(&config.stream_addr)?;
    log.info(format_args!("stream endpoint listening on {}", stream_handle.addr));
    let alerts_handle =
        AlertServer::new(dispatcher, Arc::new(auth), log.clone()).spawn(&config.alerts_addr)?;
    log.info(format_args!("alerts endpoint listening on {}", alerts_handle.addr));

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log.info(format_args!("monitord running, serving {}", config.db_path));
    let _ = rx.recv();
    log.info(format_args!("shutdown signal received, stopping endpoints..."));

    // Streams first so no new alerts arrive, then drain queued pushes while
    // staff channels are still open.
    stream_handle.stop()?;
    queue.shutdown()?;
    if queue.rejected() > 0 {
        log.warn(format_args!("{} alerts refused while the queue was full", queue.rejected()));
    }
    alerts_handle.stop()?;
    if let Some(alarm) = mqtt {
        alarm.disconnect()?;
    }
    log.info(format_args!("monitord stopped"));
    Ok(())
}
