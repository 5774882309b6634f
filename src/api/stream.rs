//! Camera endpoint: handshake, then binary frames in and annotated frames plus
//! movement summaries out.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroize;

use super::mailbox::{FrameMailbox, MailboxItem, ReaderEnd};
use super::{spawn_server, ServerHandle};
use crate::frame::{FrameEncoding, FrameGeometry, PixelFormat};
use crate::session::{MovementSummary, Session, SessionDeps, SessionState};
use crate::telemetry::LogContext;
use crate::transport::wire::{
    read_message, write_message, Message, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL,
};
use crate::{PatientId, PipelineError};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// First message on a stream connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub patient_id: PatientId,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub format: PixelFormat,
    #[serde(default)]
    pub encoding: FrameEncoding,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamReply<'a> {
    Ready {
        session_id: u64,
    },
    Movements {
        motion_detected: bool,
        movements: &'a [MovementSummary],
    },
    FrameError {
        reason: String,
    },
}

enum StreamEnd {
    ClientClosed,
    ReaderFailed,
    Fault,
}

pub struct StreamServer {
    deps: SessionDeps,
}

impl StreamServer {
    pub fn new(deps: SessionDeps) -> Self {
        Self { deps }
    }

    pub fn spawn(self, addr: &str) -> Result<ServerHandle> {
        let log = self.deps.log.with_target("ward_motion::stream");
        let server = Arc::new(self);
        spawn_server(
            "stream",
            addr,
            log,
            Arc::new(move |id, stream| server.serve(id, stream)),
        )
    }

    fn serve(&self, id: u64, stream: TcpStream) -> Result<()> {
        let log = self
            .deps
            .log
            .with_target("ward_motion::stream")
            .scoped("session", id);
        let mut reader = stream.try_clone()?;
        let mut writer = stream;

        reader.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        let handshake = match read_handshake(&mut reader) {
            Ok(handshake) => handshake,
            Err(err) => {
                log.warn(format_args!("handshake rejected: {}", err));
                return write_message(&mut writer, &Message::close(CLOSE_NORMAL, &err.to_string()));
            }
        };
        reader.set_read_timeout(None)?;

        let mut session = match open_session(id, &handshake, &self.deps) {
            Ok(session) => session,
            Err(err) => {
                let (code, reason) = rejection(&err);
                log.warn(format_args!("session rejected: {}", err));
                return write_message(&mut writer, &Message::close(code, &reason));
            }
        };
        write_message(
            &mut writer,
            &Message::json(&StreamReply::Ready { session_id: id })?,
        )?;

        let mailbox = Arc::new(FrameMailbox::new());
        let reader_mailbox = mailbox.clone();
        let reader_log = log.clone();
        let reader_thread = std::thread::Builder::new()
            .name(format!("stream-reader-{}", id))
            .spawn(move || read_frames(reader, &reader_mailbox, &reader_log))?;

        let end = process_frames(&mut session, &mailbox, &mut writer, &log);
        mailbox.close(ReaderEnd::Failed("processor stopped".to_string()));
        if !matches!(end, Ok(StreamEnd::ClientClosed)) {
            let _ = writer.shutdown(Shutdown::Both);
        }
        reader_thread
            .join()
            .map_err(|_| anyhow!("stream reader thread panicked"))?;
        if mailbox.dropped() > 0 {
            log.debug(format_args!("{} stale frames skipped", mailbox.dropped()));
        }
        end.map(|_| ())
    }
}

fn read_handshake(reader: &mut TcpStream) -> Result<Handshake> {
    match read_message(reader)? {
        Some(Message::Text(text)) => {
            serde_json::from_str(&text).map_err(|e| anyhow!("Invalid handshake: {}", e))
        }
        Some(_) => Err(anyhow!("Expected handshake")),
        None => Err(anyhow!("Connection closed before handshake")),
    }
}

fn open_session(id: u64, handshake: &Handshake, deps: &SessionDeps) -> Result<Session> {
    let geometry = FrameGeometry::new(handshake.width, handshake.height, handshake.format)?;
    Session::open(
        id,
        handshake.patient_id,
        geometry,
        handshake.encoding,
        deps.clone(),
    )
}

/// Close code and reason sent when a session cannot be established.
fn rejection(err: &anyhow::Error) -> (u16, String) {
    match PipelineError::classify(err) {
        Some(PipelineError::UnknownPatient(_)) => (CLOSE_NORMAL, "Patient not found".to_string()),
        Some(PipelineError::InvalidGeometry(reason)) => (CLOSE_NORMAL, reason.clone()),
        _ => (CLOSE_INTERNAL_ERROR, "Internal error".to_string()),
    }
}

fn read_frames(mut reader: TcpStream, mailbox: &FrameMailbox, log: &LogContext) {
    loop {
        match read_message(&mut reader) {
            Ok(Some(Message::Binary(payload))) => {
                if mailbox.put(payload).is_err() {
                    break;
                }
            }
            Ok(Some(Message::Text(_))) => {
                log.debug(format_args!("ignoring text message mid-stream"));
            }
            Ok(Some(Message::Close { .. })) | Ok(None) => {
                mailbox.close(ReaderEnd::ClientClosed);
                break;
            }
            Err(err) => {
                mailbox.close(ReaderEnd::Failed(err.to_string()));
                break;
            }
        }
    }
}

fn process_frames(
    session: &mut Session,
    mailbox: &FrameMailbox,
    writer: &mut TcpStream,
    log: &LogContext,
) -> Result<StreamEnd> {
    loop {
        match mailbox.take()? {
            MailboxItem::Frame(mut payload) => {
                let result = session.handle_frame_now(&payload);
                payload.zeroize();
                match result {
                    Ok(outcome) => {
                        let reply = Message::json(&StreamReply::Movements {
                            motion_detected: outcome.summary.motion_detected,
                            movements: &outcome.summary.movements,
                        })?;
                        write_message(writer, &Message::Binary(outcome.annotated))?;
                        write_message(writer, &reply)?;
                    }
                    Err(err) => {
                        if let Some(PipelineError::FrameDecode(reason)) =
                            PipelineError::classify(&err)
                        {
                            write_message(
                                writer,
                                &Message::json(&StreamReply::FrameError {
                                    reason: reason.clone(),
                                })?,
                            )?;
                            continue;
                        }
                        if session.state() != SessionState::Closed {
                            session.fail(&err);
                        }
                        write_message(writer, &Message::close(CLOSE_INTERNAL_ERROR, "Internal error"))?;
                        return Ok(StreamEnd::Fault);
                    }
                }
            }
            MailboxItem::Closed(ReaderEnd::ClientClosed) => {
                let _ = write_message(writer, &Message::close(CLOSE_NORMAL, ""));
                session.disconnect();
                return Ok(StreamEnd::ClientClosed);
            }
            MailboxItem::Closed(ReaderEnd::Failed(reason)) => {
                log.warn(format_args!("stream read failed: {}", reason));
                session.disconnect();
                return Ok(StreamEnd::ReaderFailed);
            }
        }
    }
}
