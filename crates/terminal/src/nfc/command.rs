// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tag work queued onto the NFC worker.
//!
//! A command is stamped with the tag generation observed when it was
//! queued; the worker executes it at most once, and only against that tag
//! instance. Departure (or any generation mismatch) aborts the command with
//! [`CommandError::NoTag`] through its reply channel.

use tokio::sync::oneshot;

/// Why a queued command did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The tag left the field (or was never the one the caller saw).
    NoTag,
    /// The tag imposed an authentication delay; queue the command again.
    AuthenticationDelay,
    /// Tag protocol failure.
    Protocol(String),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoTag => f.write_str("tag departed"),
            Self::AuthenticationDelay => f.write_str("authentication delay"),
            Self::Protocol(msg) => write!(f, "tag protocol: {msg}"),
        }
    }
}

/// Operations the orchestrator queues against the in-field tag.
#[derive(Debug)]
pub enum TagCommand {
    /// First leg of the cloud mutual authentication: returns the tag's
    /// 16-byte encrypted challenge.
    CloudAuthBegin { slot: u8, reply: oneshot::Sender<Result<[u8; 16], CommandError>> },
    /// Second leg: forward the cloud's 32-byte challenge, return the tag's
    /// 32-byte answer.
    CloudAuthFinish {
        challenge: Box<[u8; 32]>,
        reply: oneshot::Sender<Result<[u8; 32], CommandError>>,
    },
}

impl TagCommand {
    /// Deliver an abort to whoever queued this command.
    pub fn abort(self, err: CommandError) {
        match self {
            Self::CloudAuthBegin { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Self::CloudAuthFinish { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// A command plus the tag generation it is bound to.
#[derive(Debug)]
pub struct QueuedCommand {
    pub generation: u64,
    pub command: TagCommand,
}

/// Why a command could not even be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// No authenticated tag of the expected generation is in the field.
    TagNotAuthenticated,
    /// The worker is gone.
    WorkerGone,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TagNotAuthenticated => f.write_str("tag not authenticated"),
            Self::WorkerGone => f.write_str("nfc worker gone"),
        }
    }
}
