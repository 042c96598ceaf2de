//! Administrative command codec for the control socket.
//!
//! One command travels per SEQPACKET datagram, JSON-encoded. The framing
//! is the transport's; this module only defines the payload. Malformed
//! payloads decode to an error the server logs and ignores.

use serde::{Deserialize, Serialize};

/// Decoding failure for a control payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The datagram carried no payload.
    #[error("empty control message")]
    Empty,
    /// The payload was not a valid command.
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Administrative command accepted on the control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "arg", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Update the log threshold (syslog priority); workers are killed so
    /// replacements re-inherit it.
    SetLogLevel(i32),
    /// Pause dispatch; the queue still accepts inserts.
    StopExecQueue,
    /// Resume dispatch.
    StartExecQueue,
    /// Drop the compiled rule set and kill workers; rules are re-read on
    /// the next dispatch.
    Reload,
    /// Upsert (`KEY=value`) or unset (`KEY=`) a global property; workers
    /// are killed to propagate.
    SetEnv(String),
    /// Update the worker cap. Pre-existing workers are not culled.
    SetMaxChildren(u32),
    /// Liveness probe; answered only after pending uevents are queued.
    Ping,
    /// Begin shutdown; the caller's connection is retained until the
    /// drain completes.
    Exit,
}

impl ControlCommand {
    /// Encode for the wire.
    ///
    /// # Panics
    ///
    /// Never panics; the command type always serializes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("control command serializes")
    }

    /// Decode a received datagram payload.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] for empty or malformed payloads.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_commands() {
        let commands = [
            ControlCommand::SetLogLevel(7),
            ControlCommand::StopExecQueue,
            ControlCommand::StartExecQueue,
            ControlCommand::Reload,
            ControlCommand::SetEnv("COLOR=blue".to_string()),
            ControlCommand::SetMaxChildren(16),
            ControlCommand::Ping,
            ControlCommand::Exit,
        ];

        for cmd in commands {
            let bytes = cmd.encode();
            let back = ControlCommand::decode(&bytes).unwrap();
            assert_eq!(back, cmd);
        }
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(
            ControlCommand::decode(b""),
            Err(DecodeError::Empty)
        ));
    }

    #[test]
    fn test_garbage_payload_rejected() {
        assert!(matches!(
            ControlCommand::decode(b"\x00\x01\x02"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            ControlCommand::decode(b"{\"cmd\":\"reboot\"}"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let mut bytes = ControlCommand::SetEnv("KEY=value".to_string()).encode();
        bytes.truncate(bytes.len() / 2);
        assert!(ControlCommand::decode(&bytes).is_err());
    }
}
