//! Fixed-width command representation and its binary encoding.
//!
//! A command occupies exactly `COMMAND_SIZE` bytes on the wire: client ID
//! (u32 LE), operation ID (i32 LE), op code (u8), key (`KEY_SIZE` bytes) and
//! value (`VALUE_SIZE` bytes), with no padding between fields.

use std::fmt;

use crate::utils::CopilotError;

use bytes::{Buf, BufMut};

/// Width of a key on the wire.
pub const KEY_SIZE: usize = 23;

/// Width of a value on the wire.
pub const VALUE_SIZE: usize = 500;

/// Total width of an encoded command.
pub const COMMAND_SIZE: usize = 4 + 4 + 1 + KEY_SIZE + VALUE_SIZE;

/// Client ID type as registered with replicas.
pub type ClientId = u32;

/// Per-client operation sequence number.
pub type OpId = i32;

/// Operation code of a command.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u8)]
pub enum Operation {
    None = 0,
    Put = 1,
    Get = 2,
    Delete = 3,
    RLock = 4,
    WLock = 5,
}

impl Operation {
    /// Parses an op code byte.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Put),
            2 => Some(Self::Get),
            3 => Some(Self::Delete),
            4 => Some(Self::RLock),
            5 => Some(Self::WLock),
            _ => None,
        }
    }
}

/// Fixed-width key. Shorter input is zero-padded, longer input truncated.
#[derive(PartialEq, Eq, Clone, Copy, Hash)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    /// Builds a key from arbitrary bytes, padding or truncating to
    /// `KEY_SIZE`.
    pub fn from_slice(src: &[u8]) -> Self {
        let mut buf = [0; KEY_SIZE];
        let len = src.len().min(KEY_SIZE);
        buf[..len].copy_from_slice(&src[..len]);
        Key(buf)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Key({:?})", String::from_utf8_lossy(trim_zeros(&self.0)))
    }
}

/// Fixed-width value. Shorter input is zero-padded, longer input truncated.
#[derive(PartialEq, Eq, Clone)]
pub struct Value(Box<[u8; VALUE_SIZE]>);

impl Value {
    /// Builds a value from arbitrary bytes, padding or truncating to
    /// `VALUE_SIZE`.
    pub fn from_slice(src: &[u8]) -> Self {
        let mut buf = Box::new([0; VALUE_SIZE]);
        let len = src.len().min(VALUE_SIZE);
        buf[..len].copy_from_slice(&src[..len]);
        Value(buf)
    }

    /// The default filler value carried by reads, all `b'a'`.
    pub fn filler() -> Self {
        Value(Box::new([b'a'; VALUE_SIZE]))
    }

    pub fn as_bytes(&self) -> &[u8; VALUE_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Default for Value {
    fn default() -> Self {
        Value(Box::new([0; VALUE_SIZE]))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let shown = trim_zeros(&self.0[..]);
        let shown = &shown[..shown.len().min(16)];
        write!(f, "Value({:?}..)", String::from_utf8_lossy(shown))
    }
}

fn trim_zeros(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    &bytes[..end]
}

/// A single client command.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Command {
    pub client_id: ClientId,
    pub op_id: OpId,
    pub op: Operation,
    pub key: Key,
    pub value: Value,
}

impl Command {
    /// Appends the fixed-width encoding of this command to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.client_id);
        buf.put_i32_le(self.op_id);
        buf.put_u8(self.op as u8);
        buf.put_slice(self.key.as_bytes());
        buf.put_slice(self.value.as_bytes());
    }

    /// Decodes a command from the front of `buf`, consuming exactly
    /// `COMMAND_SIZE` bytes. Fails without consuming anything if fewer bytes
    /// are available.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, CopilotError> {
        if buf.remaining() < COMMAND_SIZE {
            return Err(CopilotError::msg(format!(
                "short read: command needs {} bytes, got {}",
                COMMAND_SIZE,
                buf.remaining()
            )));
        }

        let client_id = buf.get_u32_le();
        let op_id = buf.get_i32_le();
        let code = buf.get_u8();
        let op = Operation::from_u8(code).ok_or_else(|| {
            CopilotError::msg(format!("unknown op code {}", code))
        })?;
        let mut key = [0; KEY_SIZE];
        buf.copy_to_slice(&mut key);
        let mut value = Box::new([0; VALUE_SIZE]);
        buf.copy_to_slice(&mut value[..]);

        Ok(Command {
            client_id,
            op_id,
            op,
            key: Key(key),
            value: Value(value),
        })
    }
}
