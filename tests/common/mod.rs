#![allow(dead_code)]

use std::sync::Arc;

use quorum_dkg::bls::SecretKey;
use quorum_dkg::provider::{
    AllConnected, FaultInjector, LocalOperatorKey, MemoryContributionStore, NoFaults, OperatorKey,
    PeerConnectivity, RosterEntry, StaticRoster,
};
use quorum_dkg::transport::InMemoryRelay;
use quorum_dkg::{
    BlsWorker, DkgMessage, DkgSession, Error, FinalCommitment, Hash256, QuorumParams,
    SessionConfig, SessionContext, SessionHandler, WorkerConfig,
};
use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;

pub const QUORUM_HASH: Hash256 = [0x42; 32];

pub struct Node {
    pub session: DkgSession,
    pub handler: SessionHandler,
    pub relay: Arc<InMemoryRelay>,
    pub store: Arc<MemoryContributionStore>,
    pub operator: Arc<LocalOperatorKey>,
}

/// Per-node behaviour of a test network member.
#[derive(Clone)]
pub struct NodeSetup {
    pub faults: Arc<dyn FaultInjector>,
    pub connectivity: Arc<dyn PeerConnectivity>,
    pub config: SessionConfig,
}

impl Default for NodeSetup {
    fn default() -> Self {
        Self {
            faults: Arc::new(NoFaults),
            connectivity: Arc::new(AllConnected),
            config: SessionConfig::default(),
        }
    }
}

/// Roster index of a test member. Test member ids carry it in their last byte.
pub fn roster_index(member_id: &[u8; 32]) -> usize {
    member_id[31] as usize
}

/// Fully connected in-memory network of quorum members.
pub struct TestNetwork {
    pub params: QuorumParams,
    pub roster: Vec<RosterEntry>,
    pub nodes: Vec<Node>,
    pub worker: Arc<BlsWorker>,
}

impl TestNetwork {
    pub fn new(params: QuorumParams, seed: u64) -> Self {
        let n = params.size;
        Self::with_faults(params, seed, (0..n).map(|_| Arc::new(NoFaults) as _).collect())
    }

    pub fn with_faults(
        params: QuorumParams,
        seed: u64,
        faults: Vec<Arc<dyn FaultInjector>>,
    ) -> Self {
        let setups = faults
            .into_iter()
            .map(|faults| NodeSetup {
                faults,
                ..NodeSetup::default()
            })
            .collect();
        Self::with_setups(params, seed, setups)
    }

    pub fn with_setups(params: QuorumParams, seed: u64, setups: Vec<NodeSetup>) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let operators: Vec<Arc<LocalOperatorKey>> = (0..setups.len())
            .map(|_| Arc::new(LocalOperatorKey::new(SecretKey::random(&mut rng))))
            .collect();
        let roster: Vec<RosterEntry> = operators
            .iter()
            .enumerate()
            .map(|(i, op)| {
                let mut member_id = [0u8; 32];
                member_id[..8].copy_from_slice(&(seed ^ (i as u64 + 1)).to_be_bytes());
                member_id[31] = i as u8;
                RosterEntry {
                    member_id,
                    operator_key: op.public_key(),
                }
            })
            .collect();
        let worker = Arc::new(BlsWorker::new(&WorkerConfig::with_workers(4)).expect("worker"));
        let roster_provider = Arc::new(StaticRoster {
            entries: roster.clone(),
        });
        let nodes = setups
            .into_iter()
            .zip(operators)
            .zip(roster.iter())
            .map(|((setup, operator), entry)| {
                let relay = Arc::new(InMemoryRelay::new());
                let store = Arc::new(MemoryContributionStore::new());
                let ctx = SessionContext {
                    worker: worker.clone(),
                    roster: roster_provider.clone(),
                    store: store.clone(),
                    relay: relay.clone(),
                    operator: Some(operator.clone() as Arc<dyn OperatorKey>),
                    faults: setup.faults,
                    connectivity: setup.connectivity,
                };
                let session = DkgSession::init(
                    params.clone(),
                    QUORUM_HASH,
                    0,
                    Some(entry.member_id),
                    ctx,
                    setup.config.clone(),
                )
                .expect("session");
                let handler = SessionHandler::new(worker.clone(), relay.clone(), &setup.config);
                Node {
                    session,
                    handler,
                    relay,
                    store,
                    operator,
                }
            })
            .collect();

        Self {
            params,
            roster,
            nodes,
            worker,
        }
    }

    /// Moves every queued outbound message into every node's pending queue.
    /// The sender sees its own messages as local ones.
    pub fn deliver(&mut self) {
        let mut outgoing = Vec::new();
        for (from, node) in self.nodes.iter().enumerate() {
            for (_, msg) in node.relay.take_outbox() {
                outgoing.push((from, msg));
            }
        }
        for (from, msg) in outgoing {
            for (to, node) in self.nodes.iter_mut().enumerate() {
                let peer = (to != from).then_some(from as u64);
                node.handler.push_pending(peer, msg.clone());
            }
        }
    }

    pub fn process(&mut self) {
        for node in self.nodes.iter_mut() {
            node.handler.process_pending(&mut node.session);
        }
    }

    pub fn deliver_and_process(&mut self) {
        self.deliver();
        self.process();
    }

    pub fn each_session(&mut self, mut step: impl FnMut(&mut DkgSession) -> Result<(), Error>) {
        for node in self.nodes.iter_mut() {
            step(&mut node.session).expect("phase action");
        }
        self.deliver_and_process();
    }

    pub fn contribute(&mut self) {
        self.each_session(DkgSession::contribute);
    }

    pub fn complain(&mut self) {
        self.each_session(DkgSession::verify_and_complain);
    }

    pub fn justify(&mut self) {
        self.each_session(DkgSession::verify_and_justify);
    }

    pub fn commit(&mut self) {
        self.each_session(DkgSession::verify_and_commit);
    }

    pub fn finalize(&mut self) -> Vec<Vec<FinalCommitment>> {
        self.nodes
            .iter_mut()
            .map(|node| node.session.finalize_commitments().expect("finalize"))
            .collect()
    }

    /// Runs every phase after Init.
    pub fn run(&mut self) -> Vec<Vec<FinalCommitment>> {
        self.contribute();
        self.complain();
        self.justify();
        self.commit();
        self.finalize()
    }

    pub fn sign_as(&self, idx: usize, msg: DkgMessage) -> DkgMessage {
        let operator = self.nodes[idx].operator.clone();
        msg.signed_with(|h| operator.sign(h))
    }
}

pub fn honest_commitment(finals: &[Vec<FinalCommitment>], honest: &[usize]) -> FinalCommitment {
    let first = finals[honest[0]]
        .first()
        .cloned()
        .expect("final commitment");
    for idx in honest {
        assert_eq!(finals[*idx].len(), 1, "node {idx} final commitments");
        assert_eq!(finals[*idx][0], first, "node {idx} disagrees");
    }
    first
}
