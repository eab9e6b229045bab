use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::message::{Command, Reply};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("No acknowledgement for {command} within {timeout:?}")]
    Timeout {
        command: &'static str,
        timeout: Duration,
    },

    #[error("Control channel disconnected")]
    Disconnected,
}

/// A command tagged with the sequence number its reply must echo.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub seq: u64,
    pub command: Command,
}

#[derive(Debug, Clone, Copy)]
struct SequencedReply {
    seq: u64,
    reply: Reply,
}

/// Create a connected coordinator/device pair.
pub fn pair() -> (ControlLink, ControlEndpoint) {
    let (cmd_tx, cmd_rx) = bounded(1);
    let (reply_tx, reply_rx) = bounded(4);
    (
        ControlLink {
            commands: cmd_tx,
            replies: reply_rx,
            next_seq: 0,
        },
        ControlEndpoint {
            commands: cmd_rx,
            replies: ReplyHandle { replies: reply_tx },
        },
    )
}

/// Coordinator side of a device's control channel.
///
/// Every call to [`ControlLink::request`] is one outstanding command; the
/// caller blocks until the matching reply arrives or the timeout elapses.
/// Replies that arrive after their request timed out are discarded by
/// sequence number, so a slow device can never answer the wrong command.
#[derive(Debug)]
pub struct ControlLink {
    commands: Sender<Envelope>,
    replies: Receiver<SequencedReply>,
    next_seq: u64,
}

impl ControlLink {
    pub fn request(&mut self, command: Command, timeout: Duration) -> Result<Reply, ChannelError> {
        let name = command.name();
        let seq = self.next_seq;
        self.next_seq += 1;

        // Anything still queued belongs to a request that already timed out
        for stale in self.replies.try_iter() {
            log::debug!("Dropping stale reply {:?} (seq {})", stale.reply, stale.seq);
        }

        let deadline = Instant::now() + timeout;
        self.commands
            .send_deadline(Envelope { seq, command }, deadline)
            .map_err(|e| match e {
                crossbeam_channel::SendTimeoutError::Timeout(_) => ChannelError::Timeout {
                    command: name,
                    timeout,
                },
                crossbeam_channel::SendTimeoutError::Disconnected(_) => ChannelError::Disconnected,
            })?;

        loop {
            match self.replies.recv_deadline(deadline) {
                Ok(r) if r.seq == seq => return Ok(r.reply),
                Ok(r) => log::debug!("Ignoring reply for seq {} while waiting on {}", r.seq, seq),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(ChannelError::Timeout {
                        command: name,
                        timeout,
                    })
                }
                Err(RecvTimeoutError::Disconnected) => return Err(ChannelError::Disconnected),
            }
        }
    }
}

/// Device side of a control channel.
#[derive(Debug)]
pub struct ControlEndpoint {
    commands: Receiver<Envelope>,
    replies: ReplyHandle,
}

impl ControlEndpoint {
    /// Bounded receive: `Ok(None)` when nothing arrived within `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>, ChannelError> {
        match self.commands.recv_timeout(timeout) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ChannelError::Disconnected),
        }
    }

    pub fn reply_handle(&self) -> ReplyHandle {
        self.replies.clone()
    }
}

/// Cloneable sender for acknowledgements, so the acquisition thread can ack
/// commands the listener forwarded to it.
#[derive(Debug, Clone)]
pub struct ReplyHandle {
    replies: Sender<SequencedReply>,
}

impl ReplyHandle {
    pub fn send(&self, seq: u64, reply: Reply) {
        if self.replies.try_send(SequencedReply { seq, reply }).is_err() {
            log::warn!("Could not deliver reply {:?} for seq {}", reply, seq);
        }
    }
}
