//! demo - in-process synthetic run of the motion pipeline
//!
//! Seeds an in-memory ward, streams synthetic grayscale frames for a stable and
//! a critical patient, and prints movements, alert pushes and a per-patient
//! severity report.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use ward_motion::storage::{InMemoryPatientStore, NewPatient, PatientStore};
use ward_motion::{
    Acuity, AlertDispatcher, AlertNotification, ChannelRegistry, DetectorRegistry, FrameEncoding,
    FrameGeometry, LogAlarm, LogContext, NotificationChannel, PatientId, PixelFormat,
    SegmentationParams, Session, SessionDeps, StaffRole, TrackerParams, UserId,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Seconds of synthetic video per patient.
    #[arg(long, default_value_t = 8)]
    seconds: u64,
    /// Frames per second.
    #[arg(long, default_value_t = 10)]
    fps: u32,
    #[arg(long, default_value_t = 320)]
    width: u32,
    #[arg(long, default_value_t = 240)]
    height: u32,
    /// Write the last annotated frame of each patient as a PGM image here.
    #[arg(long)]
    out: Option<PathBuf>,
}

struct ConsoleChannel {
    name: &'static str,
}

impl NotificationChannel for ConsoleChannel {
    fn push(&self, notification: &AlertNotification) -> Result<()> {
        println!(
            "  -> {} [{}] patient {}: {}",
            self.name,
            notification.severity.as_str(),
            notification.patient_id,
            notification.message
        );
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }
    let geometry = FrameGeometry::new(args.width, args.height, PixelFormat::Gray8)?;
    if let Some(out) = &args.out {
        std::fs::create_dir_all(out)?;
    }

    let log = LogContext::new("ward_motion::demo");
    let store = Arc::new(InMemoryPatientStore::new());
    let doctor = store.insert_user("Dr. Amara Osei", StaffRole::Doctor)?;
    let nurse = store.insert_user("Kim Park", StaffRole::Nurse)?;
    let stable = store.insert_patient(
        &NewPatient::new("Stable patient", Acuity::Stable)
            .room("4A")
            .clinician(doctor),
    )?;
    let critical = store.insert_patient(
        &NewPatient::new("Critical patient", Acuity::Critical)
            .room("ICU-2")
            .clinician(doctor),
    )?;

    let channels = Arc::new(ChannelRegistry::new(log.clone()));
    channels.register(doctor, Arc::new(ConsoleChannel { name: "doctor" }))?;
    channels.register(nurse, Arc::new(ConsoleChannel { name: "nurse" }))?;
    let dispatcher = Arc::new(AlertDispatcher::new(
        store.clone(),
        channels,
        Arc::new(LogAlarm::new(log.clone())),
        log.clone(),
    ));

    let deps = SessionDeps {
        store: store.clone(),
        registry: DetectorRegistry::new(
            SegmentationParams::default(),
            TrackerParams::default(),
            log.clone(),
        ),
        alerts: dispatcher.clone(),
        log: log.clone(),
    };

    for (session_id, patient_id) in [(1, stable), (2, critical)] {
        run_patient(&args, session_id, patient_id, geometry, deps.clone())?;
    }

    println!();
    println!("report");
    for patient_id in [stable, critical] {
        let counts = store.movement_counts(patient_id)?;
        println!(
            "  patient {}: {} movements (normal {}, attention {}, critical {})",
            patient_id,
            counts.total(),
            counts.normal,
            counts.attention,
            counts.critical
        );
    }
    for (name, user_id) in [("doctor", doctor), ("nurse", nurse)] {
        print_pending(&dispatcher, name, user_id)?;
    }
    Ok(())
}

fn run_patient(
    args: &Args,
    session_id: u64,
    patient_id: PatientId,
    geometry: FrameGeometry,
    deps: SessionDeps,
) -> Result<()> {
    let mut session = Session::open(session_id, patient_id, geometry, FrameEncoding::Raw, deps)?;
    println!(
        "patient {} ({}, room {})",
        patient_id,
        session.patient().acuity.as_str(),
        session.patient().room.as_deref().unwrap_or("-")
    );

    let frames = args.seconds * u64::from(args.fps);
    let mut last_annotated = Vec::new();
    for index in 0..=frames {
        let t = index as f64 / f64::from(args.fps);
        let payload = synthetic_frame(geometry, index);
        let outcome = session.handle_frame(&payload, t)?;
        for movement in &outcome.summary.movements {
            if movement.severity.warrants_alert() || index % u64::from(args.fps) == 0 {
                println!(
                    "  t={:>5.1}s {:<10} {:>4.1}s {:>5.2}% {}",
                    t,
                    movement.zone.as_str(),
                    movement.duration,
                    movement.intensity,
                    movement.severity.as_str()
                );
            }
        }
        last_annotated = outcome.annotated;
    }
    session.disconnect();

    if let Some(out) = &args.out {
        let path = out.join(format!("patient_{}.pgm", patient_id));
        write_pgm(&path, geometry, &last_annotated)?;
        println!("  annotated frame written to {}", path.display());
    }
    Ok(())
}

/// Flat background with a bright square near the top center (head zone) from
/// the second frame on. The square jitters by a pixel to stay in the same
/// tracker cell.
fn synthetic_frame(geometry: FrameGeometry, index: u64) -> Vec<u8> {
    let (w, h) = (geometry.width as usize, geometry.height as usize);
    let mut data = vec![24u8; w * h];
    if index == 0 {
        return data;
    }
    let side = (w.min(h) / 6).max(24);
    let x0 = (w / 2).saturating_sub(side / 2) + (index % 2) as usize;
    let y0 = h / 12;
    for y in y0..(y0 + side).min(h) {
        for x in x0..(x0 + side).min(w) {
            data[y * w + x] = 220;
        }
    }
    data
}

fn write_pgm(path: &std::path::Path, geometry: FrameGeometry, pixels: &[u8]) -> Result<()> {
    let mut file = std::fs::File::create(path)?;
    write!(file, "P5\n{} {}\n255\n", geometry.width, geometry.height)?;
    file.write_all(pixels)?;
    Ok(())
}

fn print_pending(dispatcher: &AlertDispatcher, name: &str, user_id: UserId) -> Result<()> {
    let pending = dispatcher.pending_for(user_id)?;
    println!("  {} has {} pending alerts", name, pending.len());
    Ok(())
}
