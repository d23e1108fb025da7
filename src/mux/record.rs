//! Record encoding/decoding for the multiplexed channel
//!
//! Record format (one text message each):
//! ```text
//! <id>|<COMMAND>|<payload>
//! ```
//!
//! DATA payloads are base64 (standard alphabet) so arbitrary bytes survive
//! the text channel; an empty DATA payload marks end-of-stream. The other
//! payloads are plain UTF-8.

use super::MuxError;
use crate::proxy::Address;
use crate::session::SessionId;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

/// Record commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxCommand {
    /// Open a session; payload is `host:port`
    Connect,
    /// Target reached; payload is the bound `addr:port`
    ConnectOk,
    /// Target unreachable; payload is the reason
    ConnectErr,
    /// Session bytes
    Data,
}

impl MuxCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            MuxCommand::Connect => "CONNECT",
            MuxCommand::ConnectOk => "CONNECT_OK",
            MuxCommand::ConnectErr => "CONNECT_ERR",
            MuxCommand::Data => "DATA",
        }
    }
}

impl FromStr for MuxCommand {
    type Err = MuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT" => Ok(MuxCommand::Connect),
            "CONNECT_OK" => Ok(MuxCommand::ConnectOk),
            "CONNECT_ERR" => Ok(MuxCommand::ConnectErr),
            "DATA" => Ok(MuxCommand::Data),
            other => Err(MuxError::Protocol(format!("unknown command: {:?}", other))),
        }
    }
}

impl fmt::Display for MuxCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record on the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: SessionId,
    pub command: MuxCommand,
    pub payload: Bytes,
}

impl Record {
    pub fn new(id: SessionId, command: MuxCommand, payload: Bytes) -> Self {
        Self { id, command, payload }
    }

    pub fn connect(id: SessionId, target: &Address) -> Self {
        Self::new(id, MuxCommand::Connect, Bytes::from(target.to_string()))
    }

    pub fn connect_ok(id: SessionId, bound: &Address) -> Self {
        Self::new(id, MuxCommand::ConnectOk, Bytes::from(bound.to_string()))
    }

    pub fn connect_err(id: SessionId, reason: impl Into<String>) -> Self {
        let reason: String = reason.into();
        // The reason must not break the record onto a second line
        Self::new(id, MuxCommand::ConnectErr, Bytes::from(reason.replace('\n', " ")))
    }

    pub fn data(id: SessionId, payload: Bytes) -> Self {
        Self::new(id, MuxCommand::Data, payload)
    }

    /// End-of-stream for one direction
    pub fn eof(id: SessionId) -> Self {
        Self::new(id, MuxCommand::Data, Bytes::new())
    }

    pub fn is_eof(&self) -> bool {
        self.command == MuxCommand::Data && self.payload.is_empty()
    }

    /// Payload of a non-DATA record as text
    pub fn text(&self) -> Result<&str, MuxError> {
        std::str::from_utf8(&self.payload)
            .map_err(|_| MuxError::Protocol(format!("{} payload is not UTF-8", self.command)))
    }

    /// Encode into a channel message
    pub fn encode(&self) -> String {
        let payload = match self.command {
            MuxCommand::Data => STANDARD.encode(&self.payload),
            _ => String::from_utf8_lossy(&self.payload).into_owned(),
        };
        format!("{}|{}|{}", self.id, self.command, payload)
    }

    /// Decode a channel message
    pub fn decode(message: &str) -> Result<Self, MuxError> {
        let message = message.strip_suffix('\n').unwrap_or(message);
        let mut parts = message.splitn(3, '|');

        let (id, command, payload) = match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(command), Some(payload)) => (id, command, payload),
            _ => return Err(MuxError::Protocol("expected id|COMMAND|payload".into())),
        };

        let id = SessionId::parse(id)
            .ok_or_else(|| MuxError::Protocol(format!("invalid session id: {:?}", id)))?;
        let command: MuxCommand = command.parse()?;

        let payload = match command {
            MuxCommand::Data => STANDARD
                .decode(payload)
                .map(Bytes::from)
                .map_err(|e| MuxError::Protocol(format!("invalid DATA payload: {}", e)))?,
            _ => Bytes::copy_from_slice(payload.as_bytes()),
        };

        Ok(Self { id, command, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> SessionId {
        SessionId::parse("c0ffee").unwrap()
    }

    #[test]
    fn test_connect_record() {
        let record = Record::connect(id(), &Address::Domain("example.org".into(), 80));
        assert_eq!(record.encode(), "c0ffee|CONNECT|example.org:80");

        let decoded = Record::decode("c0ffee|CONNECT|example.org:80\n").unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.text().unwrap(), "example.org:80");
    }

    #[test]
    fn test_data_is_base64() {
        let record = Record::data(id(), Bytes::from_static(&[0x00, 0xff, b'|', b'\n']));
        let encoded = record.encode();
        assert_eq!(encoded, "c0ffee|DATA|AP98Cg==");

        let decoded = Record::decode(&encoded).unwrap();
        assert_eq!(&decoded.payload[..], &[0x00, 0xff, b'|', b'\n']);
    }

    #[test]
    fn test_empty_data_is_eof() {
        let decoded = Record::decode("c0ffee|DATA|").unwrap();
        assert!(decoded.is_eof());
        assert_eq!(Record::eof(id()).encode(), "c0ffee|DATA|");
    }

    #[test]
    fn test_connect_err_reason_with_separator() {
        let decoded = Record::decode("c0ffee|CONNECT_ERR|refused|again").unwrap();
        assert_eq!(decoded.command, MuxCommand::ConnectErr);
        assert_eq!(decoded.text().unwrap(), "refused|again");

        let record = Record::connect_err(id(), "line one\nline two");
        assert_eq!(record.encode(), "c0ffee|CONNECT_ERR|line one line two");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(
            Record::decode("c0ffee|PING|x"),
            Err(MuxError::Protocol(_))
        ));
        assert!(Record::decode("c0ffee|DATA").is_err());
        assert!(Record::decode("|DATA|").is_err());
        assert!(Record::decode("c0ffee|DATA|not base64!").is_err());
        assert!(Record::decode("").is_err());
    }
}
