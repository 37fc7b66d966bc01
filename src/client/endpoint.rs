//! CoPilot client session: setup, the dual-pilot request dispatcher, and the
//! key-value entry points used by benchmarking harnesses.
//!
//! Every command is proposed to the believed leaders of both pilots; the
//! first reply carrying the command's operation ID wins. A pilot whose leader
//! cannot be written to goes inactive until a GET_VIEW probe answered by some
//! other replica names a newer view for it. A round that sees no matching
//! reply within the request timeout is retried with the same operation ID.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::client::command::{
    ClientId, Command, Key, OpId, Operation, Value, KEY_SIZE, VALUE_SIZE,
};
use crate::client::connection::ConnectionSet;
use crate::client::directory::Directory;
use crate::client::listener::Response;
use crate::client::messages::ClientMsg;
use crate::client::views::{View, ViewTracker, NUM_PILOTS};
use crate::utils::{CopilotError, Timer, ME};

use rand::Rng;

use serde::Deserialize;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration, Instant};

/// Client IDs are drawn uniformly from `0..CLIENT_ID_RANGE` unless pinned.
pub const CLIENT_ID_RANGE: ClientId = 16;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfigCopilot {
    /// Pinned client ID; drawn at random if not given.
    pub client_id: Option<ClientId>,

    /// Per-round reply timeout in millisecs.
    pub request_timeout_ms: u64,

    /// Minimum gap between GET_VIEW probes for the same pilot in millisecs.
    pub probe_cooldown_ms: u64,

    /// Delay after registration before issuing traffic in millisecs.
    pub settle_ms: u64,

    /// Capacity of the shared reply channel.
    pub chan_reply_cap: usize,

    /// Capacity of the shared view-change channel.
    pub chan_view_cap: usize,

    /// Number of retries per replica when connecting at setup.
    pub connect_retries: u8,

    /// Bound on each TCP connect attempt in millisecs.
    pub connect_timeout_ms: u64,

    /// Interval between reconnection attempts to a dead replica connection
    /// in millisecs; 0 disables reconnection.
    pub reconnect_interval_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ClientConfigCopilot {
    fn default() -> Self {
        ClientConfigCopilot {
            client_id: None,
            request_timeout_ms: 60000,
            probe_cooldown_ms: 60000,
            settle_ms: 5000,
            chan_reply_cap: 1,
            chan_view_cap: 100,
            connect_retries: 0,
            connect_timeout_ms: 5000,
            reconnect_interval_ms: 0,
        }
    }
}

/// CoPilot client session. Not shared between callers: each caller owns its
/// own session, hence its own connections and views.
pub struct CopilotClient {
    /// Client ID registered with every replica.
    id: ClientId,

    /// Configuration parameters struct.
    config: ClientConfigCopilot,

    /// Connections to all replicas.
    conns: ConnectionSet,

    /// Views of the two pilots.
    views: ViewTracker,

    /// Receiver side of the shared reply channel.
    rx_reply: mpsc::Receiver<Response>,

    /// Receiver side of the shared view-change channel.
    rx_view: mpsc::Receiver<View>,

    /// Next operation ID to assign.
    next_op: OpId,

    /// Per-round request timer.
    timer: Timer,

    /// Termination signal; `true` aborts any in-progress request.
    rx_term: watch::Receiver<bool>,
}

impl CopilotClient {
    /// Creates a new session: looks up membership in the directory, connects
    /// to and registers with every replica, then waits out the settle delay.
    pub async fn new_and_setup(
        directory: &mut dyn Directory,
        config_str: Option<&str>,
        rx_term: watch::Receiver<bool>,
    ) -> Result<Self, CopilotError> {
        // parse protocol-specific configs
        let config = parsed_config!(config_str => ClientConfigCopilot;
                                    client_id, request_timeout_ms,
                                    probe_cooldown_ms, settle_ms,
                                    chan_reply_cap, chan_view_cap,
                                    connect_retries, connect_timeout_ms,
                                    reconnect_interval_ms)?;
        if config.request_timeout_ms == 0 {
            return logged_err!(
                "invalid config.request_timeout_ms '{}'",
                config.request_timeout_ms
            );
        }
        if config.probe_cooldown_ms == 0 {
            return logged_err!(
                "invalid config.probe_cooldown_ms '{}'",
                config.probe_cooldown_ms
            );
        }
        if config.connect_timeout_ms == 0 {
            return logged_err!(
                "invalid config.connect_timeout_ms '{}'",
                config.connect_timeout_ms
            );
        }
        if config.chan_reply_cap == 0 || config.chan_view_cap == 0 {
            return logged_err!(
                "invalid channel capacities {} / {}",
                config.chan_reply_cap,
                config.chan_view_cap
            );
        }

        let id = config
            .client_id
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..CLIENT_ID_RANGE));
        let _ = ME.set(format!("c{}", id));

        let servers = directory.replica_list().await?;
        let leaders = directory.two_leaders().await?;
        for (pilot, &leader) in leaders.iter().enumerate() {
            if leader < 0 || leader as usize >= servers.len() {
                return logged_err!(
                    "invalid leader {} for pilot {} among {} replicas",
                    leader,
                    pilot,
                    servers.len()
                );
            }
        }

        let (tx_reply, rx_reply) = mpsc::channel(config.chan_reply_cap);
        let (tx_view, rx_view) = mpsc::channel(config.chan_view_cap);
        pf_info!("registering client id {} with {} replicas", id, servers.len());
        let conns = ConnectionSet::new_and_setup(
            id,
            &servers,
            tx_reply,
            tx_view,
            config.connect_retries,
            Duration::from_millis(config.connect_timeout_ms),
        )
        .await?;

        if config.settle_ms > 0 {
            time::sleep(Duration::from_millis(config.settle_ms)).await;
        }

        pf_info!(
            "pilot 0 leader is replica {} ({}), pilot 1 leader is replica {} ({})",
            leaders[0],
            servers[leaders[0] as usize],
            leaders[1],
            servers[leaders[1] as usize]
        );
        let views = ViewTracker::new(
            leaders,
            Duration::from_millis(config.probe_cooldown_ms),
        );

        Ok(CopilotClient {
            id,
            config,
            conns,
            views,
            rx_reply,
            rx_view,
            next_op: 0,
            timer: Timer::new(),
            rx_term,
        })
    }

    /// Gets my client ID.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Gets the number of replicas.
    pub fn population(&self) -> usize {
        self.conns.population()
    }

    /// Gets the current view record of a pilot.
    pub fn view(&self, pilot: usize) -> &View {
        self.views.view(pilot)
    }

    /// Gets the number of successful replies received from a replica.
    pub fn successful_replies(&self, replica: usize) -> u64 {
        self.conns.successful_replies(replica)
    }

    /// Runs one command to completion through the dual-pilot protocol.
    /// Retries until a matching reply arrives; returns an error only if the
    /// termination signal fires first.
    pub async fn do_request(
        &mut self,
        op: Operation,
        key: Key,
        value: Value,
    ) -> Result<Response, CopilotError> {
        let op_id = self.next_op;
        self.next_op = self.next_op.wrapping_add(1);
        let command = Command {
            client_id: self.id,
            op_id,
            op,
            key,
            value,
        };

        let request_timeout = Duration::from_millis(self.config.request_timeout_ms);
        let reconnect_interval =
            Duration::from_millis(self.config.reconnect_interval_ms);

        loop {
            if *self.rx_term.borrow() {
                return logged_err!("request {} cancelled", op_id);
            }
            if !reconnect_interval.is_zero() {
                self.conns.reconnect_dead(reconnect_interval).await;
            }

            // adopt any newer views learned so far
            while let Ok(view) = self.rx_view.try_recv() {
                self.views.apply(&view);
            }

            let proposed = self.propose_to_pilots(&command).await;
            self.probe_inactive_pilots().await;

            if !proposed {
                // no pilot reachable; wait for a view change or the next
                // probe opportunity before trying again
                self.wait_for_views(reconnect_interval).await?;
                continue;
            }

            self.timer.kickoff(request_timeout)?;
            if let Some(resp) = self.wait_for_reply(op_id).await? {
                pf_trace!("op {} done by replica {}", op_id, resp.replica);
                return Ok(resp);
            }
            pf_debug!("timed-out waiting for reply to op {}", op_id);
        }
    }

    /// Sends the command to the leader of every active pilot, deactivating
    /// pilots whose leader cannot be written to. Returns whether at least
    /// one send succeeded.
    async fn propose_to_pilots(&mut self, command: &Command) -> bool {
        let msg = ClientMsg::Propose {
            command_id: command.op_id,
            command: command.clone(),
            timestamp: unix_nanos(),
        };

        let mut proposed = false;
        for pilot in 0..NUM_PILOTS {
            let leader = match self.views.active_leader(pilot) {
                Some(leader) => leader,
                None => continue,
            };
            let result = match usize::try_from(leader) {
                Ok(replica) => self.conns.send(replica, &msg).await,
                Err(_) => Err(CopilotError::msg(format!(
                    "invalid leader {}",
                    leader
                ))),
            };
            match result {
                Ok(()) => proposed = true,
                Err(e) => {
                    pf_debug!("error proposing to pilot {}: {}", pilot, e);
                    self.views.deactivate(pilot);
                }
            }
        }
        proposed
    }

    /// Sends a GET_VIEW probe for every inactive pilot whose cooldown has
    /// passed. The target is picked uniformly at random among replicas other
    /// than the one indexed by the pilot ID; on write failure the remaining
    /// candidates are tried in random order.
    async fn probe_inactive_pilots(&mut self) {
        let now = Instant::now();
        for pilot in 0..NUM_PILOTS {
            if self.views.view(pilot).active || !self.views.probe_due(pilot, now) {
                continue;
            }

            let mut candidates = ViewTracker::probe_candidates(
                pilot,
                self.conns.population(),
                &mut rand::thread_rng(),
            );
            candidates.retain(|&r| self.conns.is_alive(r));
            if candidates.is_empty() {
                pf_trace!("no live replica to probe for pilot {}", pilot);
                continue;
            }
            let msg = ClientMsg::GetView {
                pilot_id: pilot as i32,
            };
            for replica in candidates {
                match self.conns.send(replica, &msg).await {
                    Ok(()) => {
                        pf_debug!("probed replica {} for pilot {}", replica, pilot);
                        self.views.probe_sent(pilot, now);
                        break;
                    }
                    Err(e) => {
                        pf_trace!("error probing replica {}: {}", replica, e)
                    }
                }
            }
        }
    }

    /// Blocks until a view change is applied, the next probe becomes due, the
    /// next reconnection attempt is due, or termination is signalled. Stale
    /// replies arriving meanwhile are discarded.
    async fn wait_for_views(
        &mut self,
        reconnect_interval: Duration,
    ) -> Result<(), CopilotError> {
        let now = Instant::now();
        let cooldown = Duration::from_millis(self.config.probe_cooldown_ms);
        let mut deadline = self.views.next_probe_due().unwrap_or(now + cooldown);
        if deadline <= now {
            // a probe was due but none could go out
            deadline = now + cooldown;
        }
        if !reconnect_interval.is_zero() {
            deadline = deadline.min(now + reconnect_interval);
        }

        loop {
            tokio::select! {
                view = self.rx_view.recv() => {
                    return match view {
                        Some(view) => {
                            self.views.apply(&view);
                            Ok(())
                        }
                        None => logged_err!("view-change channel closed"),
                    };
                }

                // late replies from earlier rounds would otherwise fill up
                // the reply channel and stall the listeners
                reply = self.rx_reply.recv() => match reply {
                    Some(resp) => {
                        pf_trace!(
                            "discarding reply to op {} from replica {}",
                            resp.op_id,
                            resp.replica
                        );
                    }
                    None => return logged_err!("reply channel closed"),
                },

                () = time::sleep_until(deadline) => return Ok(()),

                () = terminated(&mut self.rx_term) => {
                    return logged_err!(
                        "request {} cancelled",
                        self.next_op.wrapping_sub(1)
                    );
                }
            }
        }
    }

    /// Waits for the reply matching `op_id` until the request timer fires.
    /// Replies to other operations are discarded; view changes arriving in
    /// the meantime are applied. Returns `Ok(None)` on timeout.
    async fn wait_for_reply(
        &mut self,
        op_id: OpId,
    ) -> Result<Option<Response>, CopilotError> {
        loop {
            tokio::select! {
                () = self.timer.timeout() => return Ok(None),

                reply = self.rx_reply.recv() => match reply {
                    Some(resp) if resp.op_id == op_id => {
                        self.timer.cancel();
                        return Ok(Some(resp));
                    }
                    Some(resp) => {
                        pf_trace!(
                            "discarding reply to op {} from replica {}",
                            resp.op_id,
                            resp.replica
                        );
                    }
                    None => return logged_err!("reply channel closed"),
                },

                view = self.rx_view.recv() => {
                    if let Some(view) = view {
                        self.views.apply(&view);
                    }
                }

                () = terminated(&mut self.rx_term) => {
                    self.timer.cancel();
                    return logged_err!("request {} cancelled", op_id);
                }
            }
        }
    }

    /// Gets the value of a key.
    pub async fn get(&mut self, key: &[u8]) -> Result<Value, CopilotError> {
        let resp = self
            .do_request(Operation::Get, Key::from_slice(key), Value::filler())
            .await?;
        Ok(resp.value)
    }

    /// Sets the value of a key; returns once acknowledged.
    pub async fn put(
        &mut self,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), CopilotError> {
        self.do_request(Operation::Put, Key::from_slice(key), Value::from_slice(value))
            .await?;
        Ok(())
    }

    /// Harness Read: a GET returning the raw fixed-width value.
    pub async fn read(&mut self, key: &str) -> Result<Vec<u8>, CopilotError> {
        check_key_size(key);
        Ok(self.get(key.as_bytes()).await?.to_vec())
    }

    /// Harness Insert: a PUT of the concatenated field values.
    pub async fn insert(
        &mut self,
        key: &str,
        values: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), CopilotError> {
        check_key_size(key);
        self.put(key.as_bytes(), &concat_fields(values)).await
    }

    /// Harness Update: same as Insert.
    pub async fn update(
        &mut self,
        key: &str,
        values: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), CopilotError> {
        self.insert(key, values).await
    }

    /// Harness Delete: not supported.
    pub async fn delete(&mut self, _key: &str) -> Result<(), CopilotError> {
        Err(CopilotError::msg("delete is not supported"))
    }

    /// Harness Scan: not supported.
    pub async fn scan(
        &mut self,
        _start_key: &str,
        _count: usize,
    ) -> Result<Vec<Vec<u8>>, CopilotError> {
        Err(CopilotError::msg("scan is not supported"))
    }
}

/// Resolves once the termination flag is set; pends forever if the sender is
/// gone without ever setting it.
async fn terminated(rx_term: &mut watch::Receiver<bool>) {
    loop {
        if *rx_term.borrow_and_update() {
            return;
        }
        if rx_term.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as i64)
}

fn check_key_size(key: &str) {
    if key.len() != KEY_SIZE {
        pf_debug!("key size {}", key.len());
    }
}

/// Concatenates field values in field-name order.
fn concat_fields(values: &BTreeMap<String, Vec<u8>>) -> Vec<u8> {
    let bytes: Vec<u8> = values.values().flatten().copied().collect();
    if bytes.len() != VALUE_SIZE {
        pf_debug!("val size {}", bytes.len());
    }
    bytes
}
