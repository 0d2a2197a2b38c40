//! Control channel protocol
//!
//! Newline-delimited JSON over a Unix stream socket:
//!
//! - Each message is one line
//! - UTF-8 encoded
//! - Client → daemon messages are objects tagged by a `"cmd"` field
//! - Daemon → client messages are bare status tokens
//!
//! ```text
//! → {"cmd":"addCmd","encodedCommand":382227882,"txCount":14,"modFreq":33000,"pwmPin":18}
//! → {"cmd":"removeCmd","encodedCommand":382227882}
//! → {"cmd":"clearCmdQueue"}
//! → {"cmd":"dumpCmdQueue"}
//! ← __connected
//! ← __disconnect
//! ```

use crate::error::ProtocolError;
use crate::packet::Packet;
use serde::{Deserialize, Deserializer, Serialize};
use std::io::{self, BufRead, Read};

/// Sent by the daemon once a client is accepted
pub const CONNECTED: &str = "__connected";

/// Sent by the daemon when it is shutting down
pub const DISCONNECT: &str = "__disconnect";

/// Longest line either side will accept
pub const MAX_LINE_LEN: usize = 64 * 1024;

const KNOWN_COMMANDS: [&str; 4] = ["addCmd", "removeCmd", "clearCmdQueue", "dumpCmdQueue"];

/// Client → daemon messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum ControlRequest {
    /// Queue a packet for repeated transmission
    #[serde(rename = "addCmd", rename_all = "camelCase")]
    AddCmd {
        #[serde(deserialize_with = "packet_from_wire")]
        encoded_command: Packet,
        /// Repeat count; daemon default when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tx_count: Option<u32>,
        /// Carrier frequency in Hz; daemon default when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mod_freq: Option<u32>,
        /// BCM pin; daemon default when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pwm_pin: Option<u8>,
    },
    /// Drop the first queued entry carrying this packet
    #[serde(rename = "removeCmd", rename_all = "camelCase")]
    RemoveCmd {
        #[serde(deserialize_with = "packet_from_wire")]
        encoded_command: Packet,
    },
    /// Empty the queue
    #[serde(rename = "clearCmdQueue")]
    ClearCmdQueue,
    /// Log the queue contents on the daemon
    #[serde(rename = "dumpCmdQueue")]
    DumpCmdQueue,
}

impl ControlRequest {
    /// The `cmd` discriminator
    pub fn name(&self) -> &'static str {
        match self {
            ControlRequest::AddCmd { .. } => "addCmd",
            ControlRequest::RemoveCmd { .. } => "removeCmd",
            ControlRequest::ClearCmdQueue => "clearCmdQueue",
            ControlRequest::DumpCmdQueue => "dumpCmdQueue",
        }
    }
}

/// Packets are unsigned on our side, but older clients built them with
/// 32-bit signed shifts and may send negative numbers; keep the low 32 bits.
fn packet_from_wire<'de, D>(deserializer: D) -> Result<Packet, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = i64::deserialize(deserializer)?;
    if raw < i64::from(i32::MIN) || raw > i64::from(u32::MAX) {
        return Err(serde::de::Error::custom(format!(
            "encodedCommand {} does not fit in 32 bits",
            raw
        )));
    }
    Ok(Packet::from_raw(raw as u32))
}

/// Daemon → client status tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerNotice {
    Connected,
    Disconnect,
    /// Anything else; clients log and ignore it
    Unknown(String),
}

impl ServerNotice {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            CONNECTED => ServerNotice::Connected,
            DISCONNECT => ServerNotice::Disconnect,
            other => ServerNotice::Unknown(other.to_string()),
        }
    }

    /// Wire form, newline included
    pub fn to_line(&self) -> String {
        match self {
            ServerNotice::Connected => format!("{}\n", CONNECTED),
            ServerNotice::Disconnect => format!("{}\n", DISCONNECT),
            ServerNotice::Unknown(s) => format!("{}\n", s),
        }
    }
}

/// Parse one control line, separating unknown commands from garbage
pub fn parse_request(line: &str) -> Result<ControlRequest, ProtocolError> {
    if line.len() > MAX_LINE_LEN {
        return Err(ProtocolError::Malformed(format!(
            "line of {} bytes exceeds {} byte limit",
            line.len(),
            MAX_LINE_LEN
        )));
    }

    let value: serde_json::Value = serde_json::from_str(line.trim())
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let cmd = value
        .get("cmd")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing 'cmd' field".to_string()))?;

    if !KNOWN_COMMANDS.contains(&cmd) {
        return Err(ProtocolError::UnknownCommand(cmd.to_string()));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Encode a message to JSONL format (single line with newline)
pub fn encode_jsonl<T: Serialize>(message: &T) -> io::Result<String> {
    let json = serde_json::to_string(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(format!("{}\n", json))
}

/// Result of [`read_line_bounded`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRead {
    /// One line is in the buffer, newline stripped
    Line,
    /// Line ran past [`MAX_LINE_LEN`]; holds the number of bytes dropped
    TooLong(usize),
    Eof,
}

/// Read one newline-terminated line into `buf`, never buffering more than
/// `MAX_LINE_LEN + 1` bytes of it
///
/// An oversized line is discarded through its newline so the next read
/// starts on a fresh message.
pub fn read_line_bounded<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<LineRead> {
    buf.clear();
    let limit = MAX_LINE_LEN + 1;
    let read = reader.by_ref().take(limit as u64).read_until(b'\n', buf)?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        return Ok(LineRead::Line);
    }
    if read < limit {
        // Final line without a newline
        return Ok(LineRead::Line);
    }

    buf.clear();
    let mut dropped = read;
    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if available.is_empty() {
            break;
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(end) => {
                dropped += end;
                reader.consume(end + 1);
                break;
            }
            None => {
                let len = available.len();
                dropped += len;
                reader.consume(len);
            }
        }
    }
    Ok(LineRead::TooLong(dropped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_cmd_wire_format() {
        let message = ControlRequest::AddCmd {
            encoded_command: Packet::from_raw(382_227_882),
            tx_count: Some(14),
            mod_freq: Some(33_000),
            pwm_pin: Some(18),
        };

        let encoded = encode_jsonl(&message).unwrap();

        // Should be single line ending with newline
        assert!(encoded.ends_with('\n'));
        assert_eq!(encoded.matches('\n').count(), 1);

        assert!(encoded.contains(r#""cmd":"addCmd""#));
        assert!(encoded.contains(r#""encodedCommand":382227882"#));
        assert!(encoded.contains(r#""txCount":14"#));
        assert!(encoded.contains(r#""modFreq":33000"#));
        assert!(encoded.contains(r#""pwmPin":18"#));

        assert_eq!(parse_request(&encoded).unwrap(), message);
    }

    #[test]
    fn test_add_cmd_optional_fields() {
        let request = parse_request(r#"{"cmd":"addCmd","encodedCommand":42}"#).unwrap();
        assert_eq!(
            request,
            ControlRequest::AddCmd {
                encoded_command: Packet::from_raw(42),
                tx_count: None,
                mod_freq: None,
                pwm_pin: None,
            }
        );

        // Absent optionals are not serialized
        let encoded = encode_jsonl(&request).unwrap();
        assert!(!encoded.contains("txCount"));
    }

    #[test]
    fn test_add_cmd_requires_encoded_command() {
        let err = parse_request(r#"{"cmd":"addCmd","txCount":3}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_negative_packet_wraps() {
        let request = parse_request(r#"{"cmd":"removeCmd","encodedCommand":-1}"#).unwrap();
        assert_eq!(
            request,
            ControlRequest::RemoveCmd {
                encoded_command: Packet::from_raw(u32::MAX)
            }
        );
        assert!(parse_request(r#"{"cmd":"removeCmd","encodedCommand":8589934592}"#).is_err());
    }

    #[test]
    fn test_unit_commands() {
        assert_eq!(
            parse_request(r#"{"cmd":"clearCmdQueue"}"#).unwrap(),
            ControlRequest::ClearCmdQueue
        );
        assert_eq!(
            parse_request(r#"{"cmd":"dumpCmdQueue"}"#).unwrap(),
            ControlRequest::DumpCmdQueue
        );
        assert_eq!(
            encode_jsonl(&ControlRequest::ClearCmdQueue).unwrap(),
            "{\"cmd\":\"clearCmdQueue\"}\n"
        );
    }

    #[test]
    fn test_unknown_command() {
        let err = parse_request(r#"{"cmd":"selfDestruct"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownCommand("selfDestruct".to_string()));
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(parse_request("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(parse_request(r#"{"x":1}"#), Err(ProtocolError::Malformed(_))));
        assert!(matches!(parse_request(r#"{"cmd":5}"#), Err(ProtocolError::Malformed(_))));

        let huge = format!(r#"{{"cmd":"dumpCmdQueue","pad":"{}"}}"#, "x".repeat(MAX_LINE_LEN));
        assert!(matches!(parse_request(&huge), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_server_notices() {
        assert_eq!(ServerNotice::parse("__connected\n"), ServerNotice::Connected);
        assert_eq!(ServerNotice::parse("__disconnect"), ServerNotice::Disconnect);
        assert_eq!(
            ServerNotice::parse("hello"),
            ServerNotice::Unknown("hello".to_string())
        );
        assert_eq!(ServerNotice::Connected.to_line(), "__connected\n");
    }

    #[test]
    fn test_read_line_bounded() {
        let mut input = io::Cursor::new(b"{\"cmd\":\"clearCmdQueue\"}\n\nlast".to_vec());
        let mut buf = Vec::new();

        assert_eq!(read_line_bounded(&mut input, &mut buf).unwrap(), LineRead::Line);
        assert_eq!(buf, b"{\"cmd\":\"clearCmdQueue\"}");
        assert_eq!(read_line_bounded(&mut input, &mut buf).unwrap(), LineRead::Line);
        assert!(buf.is_empty());
        assert_eq!(read_line_bounded(&mut input, &mut buf).unwrap(), LineRead::Line);
        assert_eq!(buf, b"last");
        assert_eq!(read_line_bounded(&mut input, &mut buf).unwrap(), LineRead::Eof);
    }

    #[test]
    fn test_read_line_bounded_drops_oversized_line() {
        let mut data = vec![b'x'; MAX_LINE_LEN * 3];
        data.extend_from_slice(b"\n{\"cmd\":\"dumpCmdQueue\"}\n");
        // Small buffer so the discard spans many refills
        let mut input = io::BufReader::with_capacity(1024, io::Cursor::new(data));
        let mut buf = Vec::new();

        assert_eq!(
            read_line_bounded(&mut input, &mut buf).unwrap(),
            LineRead::TooLong(MAX_LINE_LEN * 3)
        );
        assert!(buf.is_empty());

        assert_eq!(read_line_bounded(&mut input, &mut buf).unwrap(), LineRead::Line);
        let line = std::str::from_utf8(&buf).unwrap();
        assert_eq!(parse_request(line).unwrap(), ControlRequest::DumpCmdQueue);
    }

    #[test]
    fn test_read_line_bounded_accepts_line_at_limit() {
        let mut data = vec![b' '; MAX_LINE_LEN];
        data.push(b'\n');
        let mut input = io::Cursor::new(data);
        let mut buf = Vec::new();

        assert_eq!(read_line_bounded(&mut input, &mut buf).unwrap(), LineRead::Line);
        assert_eq!(buf.len(), MAX_LINE_LEN);
    }
}
