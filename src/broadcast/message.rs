use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::audio_toolkit::LoudnessSample;

/// Finality of a transcript or log record.
///
/// Serializes to `false` (interim, superseded by the next record), `true`
/// (immutable, persisted) or the string `"reload"` (a history payload sent
/// once to a late-joining listener).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finality {
    Interim,
    Final,
    Reload,
}

impl Serialize for Finality {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Finality::Interim => serializer.serialize_bool(false),
            Finality::Final => serializer.serialize_bool(true),
            Finality::Reload => serializer.serialize_str("reload"),
        }
    }
}

/// One record on a listener connection. Serialized as a line-delimited JSON
/// object tagged by `event`.
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastMessage {
    /// Acknowledgment sent first to every new listener.
    Open { session_id: String },
    Transcript {
        finality: Finality,
        record: String,
        /// Unix timestamp (seconds) the engine produced the record.
        time: f64,
    },
    /// Engine availability change; the last event of every terminated
    /// session is an offline status.
    Status { record: String },
    LogRecord { finality: Finality, record: String },
    MeterRecord { record: LoudnessSample },
    /// Idle keep-alive; not user-visible content.
    Ping,
    /// Terminal sentinel pushed at listener teardown.
    Close,
}

impl Serialize for BroadcastMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BroadcastMessage::Open { session_id } => {
                let mut s = serializer.serialize_struct("BroadcastMessage", 2)?;
                s.serialize_field("event", "open")?;
                s.serialize_field("sessionID", session_id)?;
                s.end()
            }
            BroadcastMessage::Transcript {
                finality,
                record,
                time,
            } => {
                let mut s = serializer.serialize_struct("BroadcastMessage", 4)?;
                s.serialize_field("event", "transcript")?;
                s.serialize_field("final", finality)?;
                s.serialize_field("record", record)?;
                s.serialize_field("time", time)?;
                s.end()
            }
            BroadcastMessage::Status { record } => {
                let mut s = serializer.serialize_struct("BroadcastMessage", 2)?;
                s.serialize_field("event", "status")?;
                s.serialize_field("record", record)?;
                s.end()
            }
            BroadcastMessage::LogRecord { finality, record } => {
                let mut s = serializer.serialize_struct("BroadcastMessage", 3)?;
                s.serialize_field("event", "logrecord")?;
                s.serialize_field("final", finality)?;
                s.serialize_field("record", record)?;
                s.end()
            }
            BroadcastMessage::MeterRecord { record } => {
                let mut s = serializer.serialize_struct("BroadcastMessage", 2)?;
                s.serialize_field("event", "meterrecord")?;
                s.serialize_field("record", record)?;
                s.end()
            }
            BroadcastMessage::Ping => {
                let mut s = serializer.serialize_struct("BroadcastMessage", 1)?;
                s.serialize_field("event", "ping")?;
                s.end()
            }
            BroadcastMessage::Close => {
                let mut s = serializer.serialize_struct("BroadcastMessage", 1)?;
                s.serialize_field("event", "close")?;
                s.end()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finality_wire_shapes() {
        assert_eq!(serde_json::to_string(&Finality::Interim).unwrap(), "false");
        assert_eq!(serde_json::to_string(&Finality::Final).unwrap(), "true");
        assert_eq!(
            serde_json::to_string(&Finality::Reload).unwrap(),
            "\"reload\""
        );
    }

    #[test]
    fn test_message_tagging() {
        let open = BroadcastMessage::Open {
            session_id: "abc".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&open).unwrap(),
            "{\"event\":\"open\",\"sessionID\":\"abc\"}"
        );

        let ping = serde_json::to_string(&BroadcastMessage::Ping).unwrap();
        assert_eq!(ping, "{\"event\":\"ping\"}");

        let transcript = BroadcastMessage::Transcript {
            finality: Finality::Final,
            record: "hello".to_string(),
            time: 12.0,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&transcript).unwrap()).unwrap();
        assert_eq!(json["event"], "transcript");
        assert_eq!(json["final"], true);
        assert_eq!(json["record"], "hello");
    }
}
