//! Connection set: one TCP connection per replica, each with a buffered
//! writer owned here and a buffered reader owned by its reply listener task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::client::command::ClientId;
use crate::client::listener::{reply_listener_task, Response};
use crate::client::messages::{write_msg, ClientMsg};
use crate::client::views::View;
use crate::utils::{tcp_connect_with_retry, CopilotError};

use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// State of the connection to one replica.
struct Connection {
    /// Replica address.
    addr: SocketAddr,

    /// Buffered write half; `None` if never established or broken.
    conn_write: Option<BufWriter<OwnedWriteHalf>>,

    /// Join handle of the reply listener task reading this connection.
    listener: Option<JoinHandle<()>>,

    /// Number of successful propose replies received on this connection.
    successful: Arc<AtomicU64>,

    /// Last time the reconnection policy tried this connection.
    last_reconnect: Option<Instant>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        self.conn_write.is_some()
            && self.listener.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// The set of connections to all replicas, indexed by replica ID.
pub(crate) struct ConnectionSet {
    /// My client ID, re-sent on every (re)connection.
    client_id: ClientId,

    /// Per-replica connection states.
    conns: Vec<Connection>,

    /// Sender side of the shared reply channel, cloned into listeners.
    tx_reply: mpsc::Sender<Response>,

    /// Sender side of the shared view-change channel, cloned into listeners.
    tx_view: mpsc::Sender<View>,

    /// Bound on each TCP connect attempt.
    connect_timeout: Duration,
}

impl ConnectionSet {
    /// Connects to every replica in order, registers my client ID on each,
    /// and spawns a reply listener per connection. Replicas that cannot be
    /// opened are logged and left dead. Fails only if none could be opened;
    /// a replica dying right after a successful open does not count.
    pub(crate) async fn new_and_setup(
        client_id: ClientId,
        servers: &[SocketAddr],
        tx_reply: mpsc::Sender<Response>,
        tx_view: mpsc::Sender<View>,
        connect_retries: u8,
        connect_timeout: Duration,
    ) -> Result<Self, CopilotError> {
        if servers.is_empty() {
            return logged_err!("empty replica list");
        }

        let mut conn_set = ConnectionSet {
            client_id,
            conns: servers
                .iter()
                .map(|&addr| Connection {
                    addr,
                    conn_write: None,
                    listener: None,
                    successful: Arc::new(AtomicU64::new(0)),
                    last_reconnect: None,
                })
                .collect(),
            tx_reply,
            tx_view,
            connect_timeout,
        };

        let mut opened = 0;
        for replica in 0..conn_set.conns.len() {
            match conn_set.establish(replica, connect_retries).await {
                Ok(()) => opened += 1,
                Err(e) => pf_error!(
                    "error connecting to replica {} '{}': {}",
                    replica,
                    conn_set.conns[replica].addr,
                    e
                ),
            }
        }

        if opened == 0 {
            return logged_err!("no replica reachable");
        }
        Ok(conn_set)
    }

    /// Opens the connection to a replica, registers my client ID on it, and
    /// spawns its reply listener.
    async fn establish(
        &mut self,
        replica: usize,
        retries: u8,
    ) -> Result<(), CopilotError> {
        let conn = &mut self.conns[replica];
        pf_debug!("connecting to replica {} '{}'...", replica, conn.addr);
        let stream =
            tcp_connect_with_retry(conn.addr, retries, self.connect_timeout)
                .await?;
        let (read_half, write_half) = stream.into_split();

        let mut conn_write = BufWriter::new(write_half);
        write_msg(
            &mut conn_write,
            &ClientMsg::RegisterClientId {
                client_id: self.client_id,
            },
        )
        .await?;

        if let Some(old) = conn.listener.take() {
            old.abort();
        }
        conn.listener = Some(tokio::spawn(reply_listener_task(
            replica,
            BufReader::new(read_half),
            self.tx_reply.clone(),
            self.tx_view.clone(),
            conn.successful.clone(),
        )));
        conn.conn_write = Some(conn_write);
        Ok(())
    }

    /// Number of replicas.
    #[inline]
    pub(crate) fn population(&self) -> usize {
        self.conns.len()
    }

    /// Whether the connection to a replica is usable.
    pub(crate) fn is_alive(&self, replica: usize) -> bool {
        self.conns.get(replica).is_some_and(|c| c.is_alive())
    }

    /// Number of successful propose replies received from a replica.
    pub(crate) fn successful_replies(&self, replica: usize) -> u64 {
        self.conns
            .get(replica)
            .map_or(0, |c| c.successful.load(Ordering::Relaxed))
    }

    /// Writes a message to a replica. Fails fast if the connection is dead;
    /// a failed write leaves the connection dead.
    pub(crate) async fn send(
        &mut self,
        replica: usize,
        msg: &ClientMsg,
    ) -> Result<(), CopilotError> {
        let conn = match self.conns.get_mut(replica) {
            Some(conn) => conn,
            None => {
                return Err(CopilotError::msg(format!(
                    "replica {} out of range",
                    replica
                )))
            }
        };
        let alive = conn.is_alive();
        let result = match conn.conn_write.as_mut() {
            Some(conn_write) if alive => write_msg(conn_write, msg).await,
            _ => {
                return Err(CopilotError::msg(format!(
                    "connection to replica {} is dead",
                    replica
                )))
            }
        };
        if result.is_err() {
            conn.conn_write = None;
        }
        result
    }

    /// Reconnection policy: tries to re-establish every dead connection not
    /// attempted within the last `interval`. Returns the replicas that got
    /// reconnected.
    pub(crate) async fn reconnect_dead(&mut self, interval: Duration) -> Vec<usize> {
        let now = Instant::now();
        let mut reconnected = vec![];
        for replica in 0..self.conns.len() {
            let conn = &mut self.conns[replica];
            if conn.is_alive()
                || conn
                    .last_reconnect
                    .is_some_and(|t| now.duration_since(t) < interval)
            {
                continue;
            }
            conn.last_reconnect = Some(now);
            conn.conn_write = None;

            match self.establish(replica, 0).await {
                Ok(()) => {
                    pf_info!("reconnected to replica {}", replica);
                    reconnected.push(replica);
                }
                Err(e) => {
                    pf_debug!("reconnecting to replica {} failed: {}", replica, e)
                }
            }
        }
        reconnected
    }
}

impl Drop for ConnectionSet {
    fn drop(&mut self) {
        for conn in &mut self.conns {
            if let Some(listener) = conn.listener.take() {
                listener.abort();
            }
        }
    }
}
