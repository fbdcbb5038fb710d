//! Wire codec for lock protocol messages.
//!
//! Every message is a single [`Request`] encoded as:
//!
//! ```text
//! [tag u8][type u8][name len u16 BE][name bytes]
//! [addr present u8][addr u64 BE][thread id u64 BE]
//! [timeout ms u64 BE][is_trylock u8][generation u64 BE]
//! ```
//!
//! The leading tag byte marks the payload as belonging to the locking
//! layer; untagged payloads are not ours and are passed through unchanged.
//! The tag is assigned per protocol instance through
//! [`LockingConfig::protocol_id`](crate::LockingConfig), defaulting to
//! [`DEFAULT_HEADER_TAG`]. A tagged payload that fails to decode is a
//! protocol error: it is logged, counted and dropped, and the sender is
//! not notified.
//!
//! The generation is a client-assigned tag naming one acquisition
//! attempt. Servers echo it in grant and deny responses and match it when
//! releasing, so a response that outlives its attempt can never be
//! mistaken for an answer to a later attempt by the same owner.

use crate::error::{MeshLockError, Result};
use crate::types::{MemberAddr, Owner};
use std::fmt;

/// Default marker byte for this layer's messages.
pub const DEFAULT_HEADER_TAG: u8 = 0x4c;

/// Check whether a payload carries the given header tag.
pub fn is_tagged(payload: &[u8], tag: u8) -> bool {
    payload.first() == Some(&tag)
}

/// The six message kinds exchanged between clients and servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestType {
    /// Request to acquire a lock.
    GrantLock = 0,
    /// Response to the sender of a `GrantLock` on successful acquisition.
    LockGranted = 1,
    /// Response to the sender of a `GrantLock` on a rejected non-blocking try.
    LockDenied = 2,
    /// Request to release a lock, or to withdraw a queued request.
    ReleaseLock = 3,
    /// Install server lock state on a replica.
    CreateLock = 4,
    /// Remove server lock state from a replica.
    DeleteLock = 5,
}

impl RequestType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(RequestType::GrantLock),
            1 => Ok(RequestType::LockGranted),
            2 => Ok(RequestType::LockDenied),
            3 => Ok(RequestType::ReleaseLock),
            4 => Ok(RequestType::CreateLock),
            5 => Ok(RequestType::DeleteLock),
            other => Err(MeshLockError::UnknownRequestType(other)),
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestType::GrantLock => "GRANT_LOCK",
            RequestType::LockGranted => "LOCK_GRANTED",
            RequestType::LockDenied => "LOCK_DENIED",
            RequestType::ReleaseLock => "RELEASE_LOCK",
            RequestType::CreateLock => "CREATE_LOCK",
            RequestType::DeleteLock => "DELETE_LOCK",
        };
        f.write_str(name)
    }
}

/// A single lock protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Message kind.
    pub rtype: RequestType,
    /// Name of the lock this message is about.
    pub lock_name: String,
    /// Requester for requests; destination owner for responses.
    pub owner: Owner,
    /// Timeout in milliseconds. `0` means no timeout, except that a
    /// `GrantLock` with `is_trylock` set and a zero timeout is a
    /// non-blocking try.
    pub timeout_ms: u64,
    /// Whether this grant request came from a try-lock call.
    pub is_trylock: bool,
    /// Acquisition attempt this message belongs to; echoed by servers in
    /// responses and matched on release. `0` for replication messages.
    pub generation: u64,
}

impl Request {
    pub fn new(
        rtype: RequestType,
        lock_name: impl Into<String>,
        owner: Owner,
        timeout_ms: u64,
    ) -> Self {
        Self {
            rtype,
            lock_name: lock_name.into(),
            owner,
            timeout_ms,
            is_trylock: false,
            generation: 0,
        }
    }

    /// Mark this request as originating from a try-lock call.
    pub fn trylock(mut self, is_trylock: bool) -> Self {
        self.is_trylock = is_trylock;
        self
    }

    /// Tag this message with an acquisition attempt.
    pub fn generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Encode this request, prefixed with `tag`.
    pub fn encode(&self, tag: u8) -> Result<Vec<u8>> {
        let name = self.lock_name.as_bytes();
        if name.is_empty() {
            return Err(MeshLockError::InvalidLockName("empty".into()));
        }
        if name.len() > u16::MAX as usize {
            return Err(MeshLockError::InvalidLockName(format!(
                "{} bytes exceeds the {} byte limit",
                name.len(),
                u16::MAX
            )));
        }

        let mut buf = Vec::with_capacity(1 + 1 + 2 + name.len() + 1 + 8 + 8 + 8 + 1 + 8);
        buf.push(tag);
        buf.push(self.rtype.as_u8());
        buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
        buf.extend_from_slice(name);
        buf.push(1); // owner address present
        buf.extend_from_slice(&self.owner.addr.raw().to_be_bytes());
        buf.extend_from_slice(&self.owner.thread_id.to_be_bytes());
        buf.extend_from_slice(&self.timeout_ms.to_be_bytes());
        buf.push(self.is_trylock as u8);
        buf.extend_from_slice(&self.generation.to_be_bytes());
        Ok(buf)
    }

    /// Decode a payload carrying `tag` back into a request.
    pub fn decode(payload: &[u8], tag: u8) -> Result<Self> {
        let mut cursor = Cursor::new(payload);

        let found = cursor.read_u8("header tag")?;
        if found != tag {
            return Err(MeshLockError::ProtocolDecode(format!(
                "bad header tag 0x{:02x}",
                found
            )));
        }

        let rtype = RequestType::from_u8(cursor.read_u8("request type")?)?;

        let name_len = cursor.read_u16("name length")? as usize;
        let name_bytes = cursor.read_bytes(name_len, "lock name")?;
        let lock_name = std::str::from_utf8(name_bytes)
            .map_err(|e| MeshLockError::ProtocolDecode(format!("lock name not UTF-8: {}", e)))?
            .to_string();
        if lock_name.is_empty() {
            return Err(MeshLockError::ProtocolDecode("empty lock name".into()));
        }

        let addr_present = cursor.read_u8("owner address marker")?;
        if addr_present != 1 {
            return Err(MeshLockError::ProtocolDecode(format!(
                "unsupported owner address marker {}",
                addr_present
            )));
        }
        let addr = MemberAddr::new(cursor.read_u64("owner address")?);
        let thread_id = cursor.read_u64("owner thread id")?;

        let timeout_ms = cursor.read_u64("timeout")?;

        let is_trylock = match cursor.read_u8("trylock flag")? {
            0 => false,
            1 => true,
            other => {
                return Err(MeshLockError::ProtocolDecode(format!(
                    "invalid trylock flag {}",
                    other
                )))
            }
        };

        let generation = cursor.read_u64("generation")?;

        Ok(Self {
            rtype,
            lock_name,
            owner: Owner::new(addr, thread_id),
            timeout_ms,
            is_trylock,
            generation,
        })
    }

    /// Compact rendering used by the management dump.
    pub(crate) fn short_form(&self) -> String {
        let kind = match self.rtype {
            RequestType::ReleaseLock => "U",
            RequestType::GrantLock if self.is_trylock => "TL",
            RequestType::GrantLock => "L",
            _ => "N/A",
        };
        if self.timeout_ms > 0 {
            format!("{}({},{},{})", kind, self.lock_name, self.owner, self.timeout_ms)
        } else {
            format!("{}({},{})", kind, self.lock_name, self.owner)
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}, owner={}", self.rtype, self.lock_name, self.owner)?;
        if self.is_trylock {
            write!(f, ", trylock")?;
        }
        if self.timeout_ms > 0 {
            write!(f, ", timeout={}", self.timeout_ms)?;
        }
        if self.generation > 0 {
            write!(f, ", gen={}", self.generation)?;
        }
        write!(f, "]")
    }
}

/// Bounds-checked reader over a payload slice.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize, field: &str) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|&e| e <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(MeshLockError::ProtocolDecode(format!(
                "truncated at {}: need {} bytes, have {}",
                field,
                len,
                self.buf.len() - self.pos
            ))),
        }
    }

    fn read_u8(&mut self, field: &str) -> Result<u8> {
        Ok(self.read_bytes(1, field)?[0])
    }

    fn read_u16(&mut self, field: &str) -> Result<u16> {
        let b = self.read_bytes(2, field)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u64(&mut self, field: &str) -> Result<u64> {
        let b = self.read_bytes(8, field)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}
