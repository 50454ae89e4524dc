//! GUI binary framing (spec.md §4.6): a fixed header followed by a
//! `bincode`-encoded payload. The header layout and field widths are part of
//! the wire contract and are fixed-endian regardless of host architecture.
//!
//! ```text
//! uint16 payload_size   (big-endian; covers everything after this field)
//! uint32 magic_cookie
//! uint32 protocol_version = 1
//! uint8  datagram_type
//! [payload]
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::{Result, TraceHubError};
use crate::model::{ProcessShutdownEvent, TraceEntry};

pub const MAGIC_COOKIE: u32 = 0x5452_4143; // "TRAC"
pub const PROTOCOL_VERSION: u32 = 1;

const TYPE_TRACE_ENTRY: u8 = 0;
const TYPE_PROCESS_SHUTDOWN_EVENT: u8 = 1;
const TYPE_TRACE_FILE_NAME: u8 = 2;
const TYPE_DATABASE_NUKE_FINISHED: u8 = 3;
const TYPE_DATABASE_NUKE: u8 = 4;

/// A datagram sent from the server to a GUI subscriber.
#[derive(Debug, Clone)]
pub enum ServerDatagram {
    TraceEntry(TraceEntry),
    ProcessShutdownEvent(ProcessShutdownEvent),
    /// The live store's canonical path, sent once on GUI connect.
    TraceFileName(String),
    DatabaseNukeFinished,
}

/// A datagram sent from a GUI to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientDatagram {
    DatabaseNuke,
}

fn bincode_err(e: bincode::Error) -> TraceHubError {
    TraceHubError::Protocol(format!("payload encoding error: {e}"))
}

/// Encode a full frame, header and payload together, ready to write to a
/// GUI socket.
pub fn encode(datagram: &ServerDatagram) -> Result<Vec<u8>> {
    let (datagram_type, payload) = match datagram {
        ServerDatagram::TraceEntry(e) => {
            (TYPE_TRACE_ENTRY, bincode::serialize(e).map_err(bincode_err)?)
        }
        ServerDatagram::ProcessShutdownEvent(ev) => (
            TYPE_PROCESS_SHUTDOWN_EVENT,
            bincode::serialize(ev).map_err(bincode_err)?,
        ),
        ServerDatagram::TraceFileName(path) => (
            TYPE_TRACE_FILE_NAME,
            bincode::serialize(path).map_err(bincode_err)?,
        ),
        ServerDatagram::DatabaseNukeFinished => (TYPE_DATABASE_NUKE_FINISHED, Vec::new()),
    };

    // magic_cookie + protocol_version + datagram_type + payload
    let payload_size = 4 + 4 + 1 + payload.len();
    let payload_size: u16 = payload_size
        .try_into()
        .map_err(|_| TraceHubError::Protocol("datagram payload too large to frame".into()))?;

    let mut buf = Vec::with_capacity(2 + payload_size as usize);
    buf.write_u16::<BigEndian>(payload_size)?;
    buf.write_u32::<BigEndian>(MAGIC_COOKIE)?;
    buf.write_u32::<BigEndian>(PROTOCOL_VERSION)?;
    buf.write_u8(datagram_type)?;
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode the `payload_size` header field alone, so the caller knows how
/// many more bytes to read off the socket before calling [`decode_body`].
pub fn decode_payload_size(header: &[u8; 2]) -> u16 {
    u16::from_be_bytes(*header)
}

/// Decode a client-originated datagram given its header-stripped body
/// (everything the `payload_size` field counted: magic cookie, version,
/// type, and payload).
pub fn decode_client_body(body: &[u8]) -> Result<ClientDatagram> {
    let mut cursor = Cursor::new(body);
    let magic = cursor.read_u32::<BigEndian>()?;
    if magic != MAGIC_COOKIE {
        return Err(TraceHubError::Protocol("bad magic cookie".into()));
    }
    let version = cursor.read_u32::<BigEndian>()?;
    if version != PROTOCOL_VERSION {
        return Err(TraceHubError::Protocol(format!(
            "unsupported protocol version {version}"
        )));
    }
    let datagram_type = cursor.read_u8()?;
    match datagram_type {
        TYPE_DATABASE_NUKE => Ok(ClientDatagram::DatabaseNuke),
        other => Err(TraceHubError::Protocol(format!(
            "unknown client datagram type {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntryType;

    fn sample_entry() -> TraceEntry {
        TraceEntry {
            pid: 1,
            process_start_time: 0,
            tid: 1,
            timestamp: 0,
            entry_type: EntryType::Log,
            path: "a".into(),
            line: 1,
            function: "f".into(),
            process_name: "p".into(),
            group: None,
            message: "m".into(),
            stack_position: 0,
            variables: vec![],
            backtrace: vec![],
            trace_keys: vec![],
        }
    }

    #[test]
    fn header_round_trips_payload_size() {
        let frame = encode(&ServerDatagram::TraceEntry(sample_entry())).unwrap();
        let header: [u8; 2] = frame[0..2].try_into().unwrap();
        let size = decode_payload_size(&header);
        assert_eq!(frame.len(), 2 + size as usize);
    }

    #[test]
    fn empty_payload_datagram_still_carries_header() {
        let frame = encode(&ServerDatagram::DatabaseNukeFinished).unwrap();
        assert_eq!(frame.len(), 2 + 4 + 4 + 1);
    }

    #[test]
    fn client_nuke_datagram_decodes() {
        let mut body = Vec::new();
        body.write_u32::<BigEndian>(MAGIC_COOKIE).unwrap();
        body.write_u32::<BigEndian>(PROTOCOL_VERSION).unwrap();
        body.write_u8(TYPE_DATABASE_NUKE).unwrap();
        assert_eq!(decode_client_body(&body).unwrap(), ClientDatagram::DatabaseNuke);
    }

    #[test]
    fn bad_magic_cookie_is_a_protocol_error() {
        let mut body = Vec::new();
        body.write_u32::<BigEndian>(0xdead_beef).unwrap();
        body.write_u32::<BigEndian>(PROTOCOL_VERSION).unwrap();
        body.write_u8(TYPE_DATABASE_NUKE).unwrap();
        assert!(decode_client_body(&body).is_err());
    }

    #[test]
    fn bad_protocol_version_is_a_protocol_error() {
        let mut body = Vec::new();
        body.write_u32::<BigEndian>(MAGIC_COOKIE).unwrap();
        body.write_u32::<BigEndian>(99).unwrap();
        body.write_u8(TYPE_DATABASE_NUKE).unwrap();
        assert!(decode_client_body(&body).is_err());
    }
}
