use anyhow::{anyhow, Result};
use std::sync::{Condvar, Mutex};
use zeroize::Zeroize;

/// Why the reading half of a connection stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReaderEnd {
    ClientClosed,
    Failed(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum MailboxItem {
    Frame(Vec<u8>),
    Closed(ReaderEnd),
}

#[derive(Default)]
struct MailboxState {
    latest: Option<Vec<u8>>,
    closed: Option<ReaderEnd>,
    dropped: u64,
}

/// Single-slot, latest-wins hand-off between a connection's reader and its
/// processor. A frame that arrives before the previous one was taken replaces
/// it. Closing cancels any frame still waiting.
#[derive(Default)]
pub struct FrameMailbox {
    state: Mutex<MailboxState>,
    ready: Condvar,
}

impl FrameMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, payload: Vec<u8>) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("frame mailbox lock poisoned"))?;
        if state.closed.is_some() {
            return Err(anyhow!("frame mailbox closed"));
        }
        if let Some(mut stale) = state.latest.replace(payload) {
            stale.zeroize();
            state.dropped += 1;
        }
        self.ready.notify_one();
        Ok(())
    }

    pub fn close(&self, reason: ReaderEnd) {
        if let Ok(mut state) = self.state.lock() {
            if state.closed.is_none() {
                state.closed = Some(reason);
            }
            if let Some(mut stale) = state.latest.take() {
                stale.zeroize();
            }
            self.ready.notify_all();
        }
    }

    /// Block until a frame or a close is available.
    pub fn take(&self) -> Result<MailboxItem> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("frame mailbox lock poisoned"))?;
        loop {
            if let Some(reason) = state.closed.clone() {
                return Ok(MailboxItem::Closed(reason));
            }
            if let Some(frame) = state.latest.take() {
                return Ok(MailboxItem::Frame(frame));
            }
            state = self
                .ready
                .wait(state)
                .map_err(|_| anyhow!("frame mailbox lock poisoned"))?;
        }
    }

    /// Frames replaced before the processor got to them.
    pub fn dropped(&self) -> u64 {
        self.state.lock().map(|s| s.dropped).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn only_the_latest_frame_is_kept() {
        let mailbox = FrameMailbox::new();
        for i in 0..5u8 {
            mailbox.put(vec![i]).unwrap();
        }
        assert_eq!(mailbox.take().unwrap(), MailboxItem::Frame(vec![4]));
        assert_eq!(mailbox.dropped(), 4);
    }

    #[test]
    fn close_cancels_pending_frame() {
        let mailbox = FrameMailbox::new();
        mailbox.put(vec![1]).unwrap();
        mailbox.close(ReaderEnd::ClientClosed);
        assert_eq!(
            mailbox.take().unwrap(),
            MailboxItem::Closed(ReaderEnd::ClientClosed)
        );
        assert!(mailbox.put(vec![2]).is_err());
    }

    #[test]
    fn take_blocks_until_a_frame_arrives() {
        let mailbox = Arc::new(FrameMailbox::new());
        let producer = mailbox.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            producer.put(vec![7]).unwrap();
        });
        assert_eq!(mailbox.take().unwrap(), MailboxItem::Frame(vec![7]));
        handle.join().unwrap();
    }
}
