//! Per-connection reply listener task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::client::command::{OpId, Value};
use crate::client::messages::ServerMsg;
use crate::client::views::View;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A successful command reply as delivered to the dispatcher.
#[derive(Debug, Clone)]
pub struct Response {
    /// Operation ID the reply is for.
    pub op_id: OpId,

    /// Index of the replica the reply came from.
    pub replica: usize,

    /// When the listener received it.
    pub recv_ts: Instant,

    /// Server-side timestamp carried in the reply.
    pub timestamp: i64,

    /// Value carried in the reply; only meaningful for reads.
    pub value: Value,
}

/// Reply listener task function. Reads tagged messages off `conn_read` until
/// any read or decode error (including EOF), routing successful propose
/// replies to `tx_reply` and successful view replies to `tx_view`. Sends
/// block when the channels are full. Never reconnects.
pub(crate) async fn reply_listener_task<R>(
    replica: usize,
    mut conn_read: R,
    tx_reply: mpsc::Sender<Response>,
    tx_view: mpsc::Sender<View>,
    successful: Arc<AtomicU64>,
) where
    R: AsyncRead + Unpin,
{
    pf_debug!("reply_listener task for {} spawned", replica);

    loop {
        let msg = match ServerMsg::read_from(&mut conn_read).await {
            Ok(msg) => msg,
            Err(e) => {
                pf_debug!("connection to {} dead: {}", replica, e);
                break;
            }
        };

        match msg {
            ServerMsg::ProposeReply {
                ok: true,
                command_id,
                value,
                timestamp,
            } => {
                successful.fetch_add(1, Ordering::Relaxed);
                pf_trace!("recv reply to op {} from {}", command_id, replica);
                let resp = Response {
                    op_id: command_id,
                    replica,
                    recv_ts: Instant::now(),
                    timestamp,
                    value,
                };
                if tx_reply.send(resp).await.is_err() {
                    break; // session gone
                }
            }

            ServerMsg::GetViewReply {
                ok: true,
                view_id,
                pilot_id,
                replica_id,
            } => {
                pf_trace!(
                    "recv view {} of pilot {} (replica {}) from {}",
                    view_id,
                    pilot_id,
                    replica_id,
                    replica
                );
                let view = View {
                    view_id,
                    pilot_id,
                    replica_id,
                    active: true,
                };
                if tx_view.send(view).await.is_err() {
                    break;
                }
            }

            ServerMsg::Other(tag) => {
                pf_trace!("ignoring tag {} from {}", tag, replica);
            }

            _ => {} // not OK
        }
    }

    pf_debug!("reply_listener task for {} exitted", replica);
}
