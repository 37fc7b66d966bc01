//! Tagged wire messages exchanged between the client and replicas.
//!
//! Every message is a single tag byte followed by a fixed-width payload. All
//! multi-byte integers are little-endian; there is no length framing.

use crate::client::command::{
    ClientId, Command, OpId, Value, COMMAND_SIZE, VALUE_SIZE,
};
use crate::utils::CopilotError;

use bytes::{Buf, BufMut, BytesMut};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Replica index into the connection set.
pub type ReplicaId = i32;

/// Pilot role index, either 0 or 1.
pub type PilotId = i32;

/// Per-pilot view number.
pub type ViewId = i32;

// Tag bytes of the generic SMR protocol; only a subset is spoken here.
pub const PROPOSE: u8 = 0;
pub const PROPOSE_REPLY: u8 = 1;
pub const READ: u8 = 2;
pub const READ_REPLY: u8 = 3;
pub const PROPOSE_AND_READ: u8 = 4;
pub const PROPOSE_AND_READ_REPLY: u8 = 5;
pub const GENERIC_SMR_BEACON: u8 = 6;
pub const GENERIC_SMR_BEACON_REPLY: u8 = 7;
pub const REGISTER_CLIENT_ID: u8 = 8;
pub const REGISTER_CLIENT_ID_REPLY: u8 = 9;
pub const GET_VIEW: u8 = 10;
pub const GET_VIEW_REPLY: u8 = 11;

const PROPOSE_SIZE: usize = 4 + COMMAND_SIZE + 8;
const PROPOSE_REPLY_SIZE: usize = 1 + 4 + VALUE_SIZE + 8;
const GET_VIEW_REPLY_SIZE: usize = 1 + 4 + 4 + 4;

/// Messages sent from client to replica.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ClientMsg {
    /// One-time registration of the client ID on a connection.
    RegisterClientId { client_id: ClientId },

    /// Command proposal. `command_id` always equals `command.op_id`;
    /// `timestamp` is the send time in unix nanosecs.
    Propose {
        command_id: OpId,
        command: Command,
        timestamp: i64,
    },

    /// Query for the current view of given pilot.
    GetView { pilot_id: PilotId },
}

impl ClientMsg {
    /// Appends the tagged encoding of this message to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            ClientMsg::RegisterClientId { client_id } => {
                buf.put_u8(REGISTER_CLIENT_ID);
                buf.put_u32_le(*client_id);
            }
            ClientMsg::Propose {
                command_id,
                command,
                timestamp,
            } => {
                buf.put_u8(PROPOSE);
                buf.put_i32_le(*command_id);
                command.encode(buf);
                buf.put_i64_le(*timestamp);
            }
            ClientMsg::GetView { pilot_id } => {
                buf.put_u8(GET_VIEW);
                buf.put_i32_le(*pilot_id);
            }
        }
    }

    /// Reads one message from a replica-side stream. Used by replica-side
    /// peers (e.g. test replicas) speaking the same protocol.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, CopilotError>
    where
        R: AsyncRead + Unpin,
    {
        let tag = reader.read_u8().await?;
        match tag {
            REGISTER_CLIENT_ID => Ok(ClientMsg::RegisterClientId {
                client_id: reader.read_u32_le().await?,
            }),
            PROPOSE => {
                let mut payload = [0; PROPOSE_SIZE];
                reader.read_exact(&mut payload).await?;
                let mut buf = &payload[..];
                let command_id = buf.get_i32_le();
                let command = Command::decode(&mut buf)?;
                let timestamp = buf.get_i64_le();
                Ok(ClientMsg::Propose {
                    command_id,
                    command,
                    timestamp,
                })
            }
            GET_VIEW => Ok(ClientMsg::GetView {
                pilot_id: reader.read_i32_le().await?,
            }),
            _ => Err(CopilotError::msg(format!(
                "unexpected client message tag {}",
                tag
            ))),
        }
    }
}

/// Messages sent from replica to client.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ServerMsg {
    ProposeReply {
        ok: bool,
        command_id: OpId,
        timestamp: i64,
        value: Value,
    },

    GetViewReply {
        ok: bool,
        view_id: ViewId,
        pilot_id: PilotId,
        replica_id: ReplicaId,
    },

    /// Any other tag; only the tag byte itself is consumed.
    Other(u8),
}

impl ServerMsg {
    /// Appends the tagged encoding of this message to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            ServerMsg::ProposeReply {
                ok,
                command_id,
                timestamp,
                value,
            } => {
                buf.put_u8(PROPOSE_REPLY);
                buf.put_u8(u8::from(*ok));
                buf.put_i32_le(*command_id);
                buf.put_i64_le(*timestamp);
                buf.put_slice(value.as_bytes());
            }
            ServerMsg::GetViewReply {
                ok,
                view_id,
                pilot_id,
                replica_id,
            } => {
                buf.put_u8(GET_VIEW_REPLY);
                buf.put_u8(u8::from(*ok));
                buf.put_i32_le(*view_id);
                buf.put_i32_le(*pilot_id);
                buf.put_i32_le(*replica_id);
            }
            ServerMsg::Other(tag) => buf.put_u8(*tag),
        }
    }

    /// Reads one message from a client-side stream. Fails on EOF or on a
    /// stream that ends mid-frame.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, CopilotError>
    where
        R: AsyncRead + Unpin,
    {
        let tag = reader.read_u8().await?;
        match tag {
            PROPOSE_REPLY => {
                let mut payload = [0; PROPOSE_REPLY_SIZE];
                reader.read_exact(&mut payload).await?;
                let mut buf = &payload[..];
                let ok = buf.get_u8() != 0;
                let command_id = buf.get_i32_le();
                let timestamp = buf.get_i64_le();
                let value = Value::from_slice(&buf[..VALUE_SIZE]);
                Ok(ServerMsg::ProposeReply {
                    ok,
                    command_id,
                    timestamp,
                    value,
                })
            }
            GET_VIEW_REPLY => {
                let mut payload = [0; GET_VIEW_REPLY_SIZE];
                reader.read_exact(&mut payload).await?;
                let mut buf = &payload[..];
                Ok(ServerMsg::GetViewReply {
                    ok: buf.get_u8() != 0,
                    view_id: buf.get_i32_le(),
                    pilot_id: buf.get_i32_le(),
                    replica_id: buf.get_i32_le(),
                })
            }
            _ => Ok(ServerMsg::Other(tag)),
        }
    }
}

/// Common interface of both message directions for writing onto a stream.
pub trait WireMsg {
    fn encode_to(&self, buf: &mut BytesMut);
}

impl WireMsg for ClientMsg {
    fn encode_to(&self, buf: &mut BytesMut) {
        self.encode(buf)
    }
}

impl WireMsg for ServerMsg {
    fn encode_to(&self, buf: &mut BytesMut) {
        self.encode(buf)
    }
}

/// Encodes `msg` and writes it out, flushing the writer. A failure here
/// means the connection is no longer usable.
pub async fn write_msg<W, M>(writer: &mut W, msg: &M) -> Result<(), CopilotError>
where
    W: AsyncWrite + Unpin,
    M: WireMsg,
{
    let mut buf = BytesMut::with_capacity(1 + PROPOSE_SIZE);
    msg.encode_to(&mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod messages_tests {
    use super::*;
    use crate::client::command::{Key, Operation};

    fn sample_command() -> Command {
        Command {
            client_id: 3,
            op_id: 17,
            op: Operation::Put,
            key: Key::from_slice(b"key1"),
            value: Value::from_slice(b"value1"),
        }
    }

    #[test]
    fn register_layout() {
        let mut buf = BytesMut::new();
        ClientMsg::RegisterClientId { client_id: 7 }.encode(&mut buf);
        assert_eq!(&buf[..], &[REGISTER_CLIENT_ID, 7, 0, 0, 0]);
    }

    #[test]
    fn get_view_layout() {
        let mut buf = BytesMut::new();
        ClientMsg::GetView { pilot_id: 1 }.encode(&mut buf);
        assert_eq!(&buf[..], &[GET_VIEW, 1, 0, 0, 0]);
    }

    #[test]
    fn propose_layout() {
        let mut buf = BytesMut::new();
        ClientMsg::Propose {
            command_id: 17,
            command: sample_command(),
            timestamp: 99,
        }
        .encode(&mut buf);
        assert_eq!(buf.len(), 1 + PROPOSE_SIZE);
        assert_eq!(buf[0], PROPOSE);
        assert_eq!(&buf[1..5], &17i32.to_le_bytes());
        assert_eq!(&buf[5..9], &3u32.to_le_bytes());
        assert_eq!(&buf[buf.len() - 8..], &99i64.to_le_bytes());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn client_msgs_read_back() -> Result<(), CopilotError> {
        let msgs = vec![
            ClientMsg::RegisterClientId { client_id: 5 },
            ClientMsg::Propose {
                command_id: 17,
                command: sample_command(),
                timestamp: -1,
            },
            ClientMsg::GetView { pilot_id: 0 },
        ];
        let mut buf = BytesMut::new();
        for msg in &msgs {
            msg.encode(&mut buf);
        }
        let mut reader = &buf[..];
        for msg in &msgs {
            assert_eq!(&ClientMsg::read_from(&mut reader).await?, msg);
        }
        assert!(ClientMsg::read_from(&mut reader).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn server_msgs_read_back() -> Result<(), CopilotError> {
        let reply = ServerMsg::ProposeReply {
            ok: true,
            command_id: 17,
            value: Value::from_slice(b"value1"),
            timestamp: 1234,
        };
        let view = ServerMsg::GetViewReply {
            ok: true,
            view_id: 4,
            pilot_id: 1,
            replica_id: 2,
        };
        let mut buf = BytesMut::new();
        reply.encode(&mut buf);
        assert_eq!(buf.len(), 1 + PROPOSE_REPLY_SIZE);
        // tag, ok, command id, timestamp, then the value
        assert_eq!(buf[0], PROPOSE_REPLY);
        assert_eq!(buf[1], 1);
        assert_eq!(buf[2..6], 17i32.to_le_bytes());
        assert_eq!(buf[6..14], 1234i64.to_le_bytes());
        assert_eq!(&buf[14..20], b"value1");
        assert!(buf[20..14 + VALUE_SIZE].iter().all(|&b| b == 0));
        buf.put_u8(GENERIC_SMR_BEACON);
        view.encode(&mut buf);
        assert_eq!(buf.len(), 1 + PROPOSE_REPLY_SIZE + 1 + 1 + 13);

        let mut reader = &buf[..];
        assert_eq!(ServerMsg::read_from(&mut reader).await?, reply);
        assert_eq!(
            ServerMsg::read_from(&mut reader).await?,
            ServerMsg::Other(GENERIC_SMR_BEACON)
        );
        assert_eq!(ServerMsg::read_from(&mut reader).await?, view);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn server_msg_cut_mid_frame() {
        let mut buf = BytesMut::new();
        ServerMsg::GetViewReply {
            ok: true,
            view_id: 1,
            pilot_id: 0,
            replica_id: 3,
        }
        .encode(&mut buf);
        let mut reader = &buf[..buf.len() - 2];
        assert!(ServerMsg::read_from(&mut reader).await.is_err());
    }
}
