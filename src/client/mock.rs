//! In-process mock replicas speaking the replica side of the wire protocol,
//! for exercising client sessions over real loopback TCP connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::client::command::{ClientId, Command, Key, Operation, Value};
use crate::client::messages::{write_msg, ClientMsg, ServerMsg, ViewId};
use crate::client::views::NUM_PILOTS;
use crate::utils::CopilotError;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// How a mock replica treats proposals. View queries are answered the same
/// way by every behavior, from the cluster-wide view answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockBehavior {
    /// Applies PUTs to a local map and answers every proposal.
    Reply,

    /// Answers every proposal with a value naming the replica and the op.
    ReplyTagged,

    /// Never answers proposals.
    Silent,

    /// Closes the connection upon reading a proposal.
    CrashOnPropose,

    /// Closes the first connection upon reading a proposal, then behaves as
    /// `Reply` on later connections.
    CrashOnceThenReply,
}

/// State shared by all mock replicas of a cluster.
#[derive(Default)]
struct SharedState {
    /// Answer to GET_VIEW for each pilot as (view ID, replica ID).
    view_answers: Mutex<[Option<(ViewId, i32)>; NUM_PILOTS]>,

    /// Number of GET_VIEW probes received for each pilot.
    probes: [AtomicUsize; NUM_PILOTS],
}

/// State of one mock replica.
struct ReplicaState {
    index: usize,
    behavior: MockBehavior,
    crashed: AtomicBool,
    proposals: AtomicUsize,
    store: Mutex<HashMap<Key, Value>>,
    tx_reg: mpsc::UnboundedSender<ClientId>,
    tx_prop: mpsc::UnboundedSender<Command>,
}

/// A cluster of mock replicas listening on loopback ports.
pub(crate) struct MockCluster {
    addrs: Vec<SocketAddr>,
    replicas: Vec<Arc<ReplicaState>>,
    shared: Arc<SharedState>,
    rx_regs: Vec<mpsc::UnboundedReceiver<ClientId>>,
    rx_props: Vec<mpsc::UnboundedReceiver<Command>>,
    acceptors: Vec<JoinHandle<()>>,
}

impl MockCluster {
    /// Binds one listener per behavior and starts accepting connections.
    pub(crate) async fn launch(
        behaviors: Vec<MockBehavior>,
    ) -> Result<Self, CopilotError> {
        let shared = Arc::new(SharedState::default());
        let mut cluster = MockCluster {
            addrs: vec![],
            replicas: vec![],
            shared: shared.clone(),
            rx_regs: vec![],
            rx_props: vec![],
            acceptors: vec![],
        };

        for (index, behavior) in behaviors.into_iter().enumerate() {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            cluster.addrs.push(listener.local_addr()?);

            let (tx_reg, rx_reg) = mpsc::unbounded_channel();
            let (tx_prop, rx_prop) = mpsc::unbounded_channel();
            let replica = Arc::new(ReplicaState {
                index,
                behavior,
                crashed: AtomicBool::new(false),
                proposals: AtomicUsize::new(0),
                store: Mutex::new(HashMap::new()),
                tx_reg,
                tx_prop,
            });
            cluster.replicas.push(replica.clone());
            cluster.rx_regs.push(rx_reg);
            cluster.rx_props.push(rx_prop);

            let shared = shared.clone();
            cluster.acceptors.push(tokio::spawn(async move {
                while let Ok((conn, _)) = listener.accept().await {
                    tokio::spawn(serve_conn(conn, replica.clone(), shared.clone()));
                }
            }));
        }

        Ok(cluster)
    }

    /// Replica addresses in replica ID order.
    pub(crate) fn addrs(&self) -> Vec<SocketAddr> {
        self.addrs.clone()
    }

    /// Sets the view every replica reports for `pilot`.
    pub(crate) fn set_view_answer(
        &self,
        pilot: usize,
        view_id: ViewId,
        replica_id: i32,
    ) {
        if let Ok(mut answers) = self.shared.view_answers.lock() {
            answers[pilot] = Some((view_id, replica_id));
        }
    }

    /// Number of GET_VIEW probes received for `pilot` across the cluster.
    pub(crate) fn probes_for_pilot(&self, pilot: usize) -> usize {
        self.shared.probes[pilot].load(Ordering::SeqCst)
    }

    /// Number of proposals received by a replica.
    pub(crate) fn proposals_seen(&self, replica: usize) -> usize {
        self.replicas[replica].proposals.load(Ordering::SeqCst)
    }

    /// Waits for the next client ID registration at a replica.
    pub(crate) async fn next_registration(
        &mut self,
        replica: usize,
    ) -> Result<ClientId, CopilotError> {
        time::timeout(Duration::from_secs(5), self.rx_regs[replica].recv())
            .await
            .map_err(CopilotError::msg)?
            .ok_or(CopilotError::msg("registration channel closed"))
    }

    /// Waits for the next proposal received by a replica.
    pub(crate) async fn next_proposal(
        &mut self,
        replica: usize,
    ) -> Result<Command, CopilotError> {
        time::timeout(Duration::from_secs(5), self.rx_props[replica].recv())
            .await
            .map_err(CopilotError::msg)?
            .ok_or(CopilotError::msg("proposal channel closed"))
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        for acceptor in &self.acceptors {
            acceptor.abort();
        }
    }
}

/// Serves one client connection until it closes or the behavior crashes it.
async fn serve_conn(
    mut conn: TcpStream,
    replica: Arc<ReplicaState>,
    shared: Arc<SharedState>,
) -> Result<(), CopilotError> {
    loop {
        match ClientMsg::read_from(&mut conn).await? {
            ClientMsg::RegisterClientId { client_id } => {
                let _ = replica.tx_reg.send(client_id);
            }

            ClientMsg::Propose { command, .. } => {
                replica.proposals.fetch_add(1, Ordering::SeqCst);
                let _ = replica.tx_prop.send(command.clone());

                let value = match replica.behavior {
                    MockBehavior::Silent => continue,
                    MockBehavior::CrashOnPropose => return Ok(()),
                    MockBehavior::CrashOnceThenReply
                        if !replica.crashed.swap(true, Ordering::SeqCst) =>
                    {
                        return Ok(())
                    }
                    MockBehavior::ReplyTagged => Value::from_slice(
                        format!("r{}-op{}", replica.index, command.op_id)
                            .as_bytes(),
                    ),
                    _ => apply(&replica, &command),
                };
                write_msg(
                    &mut conn,
                    &ServerMsg::ProposeReply {
                        ok: true,
                        command_id: command.op_id,
                        value,
                        timestamp: 0,
                    },
                )
                .await?;
            }

            ClientMsg::GetView { pilot_id } => {
                let pilot = match usize::try_from(pilot_id) {
                    Ok(p) if p < NUM_PILOTS => p,
                    _ => continue,
                };
                shared.probes[pilot].fetch_add(1, Ordering::SeqCst);
                let answer = shared
                    .view_answers
                    .lock()
                    .map_err(CopilotError::msg)?[pilot];
                if let Some((view_id, replica_id)) = answer {
                    write_msg(
                        &mut conn,
                        &ServerMsg::GetViewReply {
                            ok: true,
                            view_id,
                            pilot_id,
                            replica_id,
                        },
                    )
                    .await?;
                }
            }
        }
    }
}

/// Applies a command to the replica's local map, returning the reply value.
fn apply(replica: &ReplicaState, command: &Command) -> Value {
    let mut store = match replica.store.lock() {
        Ok(store) => store,
        Err(poisoned) => poisoned.into_inner(),
    };
    match command.op {
        Operation::Put => {
            store.insert(command.key, command.value.clone());
            command.value.clone()
        }
        Operation::Get => store.get(&command.key).cloned().unwrap_or_default(),
        _ => Value::default(),
    }
}
