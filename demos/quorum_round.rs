//! One DKG round over an in-memory network.
//!
//! Usage: `cargo run --example quorum_round [config.json]`
//!
//! Without a config file the `llmq_devnet` parameters are used. Fault rates
//! from the config apply to the last member only, so the effect of a
//! misbehaving node can be watched in the logs (`RUST_LOG=debug`).

use std::sync::Arc;

use quorum_dkg::bls::SecretKey;
use quorum_dkg::logging::init_tracing;
use quorum_dkg::provider::{
    AllConnected, FaultInjector, LocalOperatorKey, MemoryContributionStore, NoFaults, OperatorKey,
    RosterEntry, StaticRoster,
};
use quorum_dkg::transport::InMemoryRelay;
use quorum_dkg::{
    BlsWorker, DkgSession, Error, NodeConfig, QuorumParams, SessionContext, SessionHandler,
};
use rand_core::OsRng;
use tracing::info;

struct Node {
    session: DkgSession,
    handler: SessionHandler,
    relay: Arc<InMemoryRelay>,
}

fn deliver(nodes: &mut [Node]) {
    let mut outgoing = Vec::new();
    for (from, node) in nodes.iter().enumerate() {
        for (_, msg) in node.relay.take_outbox() {
            outgoing.push((from, msg));
        }
    }
    for (from, msg) in outgoing {
        for (to, node) in nodes.iter_mut().enumerate() {
            let peer = (to != from).then_some(from as u64);
            node.handler.push_pending(peer, msg.clone());
        }
    }
    for node in nodes.iter_mut() {
        node.handler.process_pending(&mut node.session);
    }
}

fn main() -> Result<(), Error> {
    init_tracing(None);
    let config = match std::env::args().nth(1) {
        Some(path) => NodeConfig::from_json_file(path)?,
        None => NodeConfig::new(QuorumParams::llmq_devnet()),
    };
    let params = config.quorum.clone();
    let worker = Arc::new(BlsWorker::new(&config.worker)?);

    let keys: Vec<SecretKey> = (0..params.size).map(|_| SecretKey::random(&mut OsRng)).collect();
    let entries: Vec<RosterEntry> = keys
        .iter()
        .enumerate()
        .map(|(i, sk)| {
            let mut member_id = [0u8; 32];
            member_id[..8].copy_from_slice(&(i as u64 + 1).to_be_bytes());
            RosterEntry {
                member_id,
                operator_key: sk.public_key(),
            }
        })
        .collect();
    let roster = Arc::new(StaticRoster {
        entries: entries.clone(),
    });
    let quorum_hash = *blake3::hash(b"quorum-round demo").as_bytes();

    let last = params.size - 1;
    let mut nodes = Vec::with_capacity(params.size);
    for (i, (sk, entry)) in keys.into_iter().zip(entries).enumerate() {
        let relay = Arc::new(InMemoryRelay::new());
        let faults: Arc<dyn FaultInjector> = if i == last {
            config.faults.injector()
        } else {
            Arc::new(NoFaults)
        };
        let ctx = SessionContext {
            worker: worker.clone(),
            roster: roster.clone(),
            store: Arc::new(MemoryContributionStore::new()),
            relay: relay.clone(),
            operator: Some(Arc::new(LocalOperatorKey::new(sk)) as Arc<dyn OperatorKey>),
            faults,
            connectivity: Arc::new(AllConnected),
        };
        let session = DkgSession::init(
            params.clone(),
            quorum_hash,
            0,
            Some(entry.member_id),
            ctx,
            config.session.clone(),
        )?;
        let handler = SessionHandler::new(worker.clone(), relay.clone(), &config.session);
        nodes.push(Node {
            session,
            handler,
            relay,
        });
    }

    for step in [
        DkgSession::contribute,
        DkgSession::verify_and_complain,
        DkgSession::verify_and_justify,
        DkgSession::verify_and_commit,
    ] {
        for node in nodes.iter_mut() {
            step(&mut node.session)?;
        }
        deliver(&mut nodes);
    }

    let mut finals = Vec::with_capacity(nodes.len());
    for node in nodes.iter_mut() {
        finals.push(node.session.finalize_commitments()?);
    }
    for (i, commitments) in finals.iter().enumerate() {
        for fqc in commitments {
            info!(
                node = i,
                valid_members = fqc.count_valid_members(),
                signers = fqc.count_signers(),
                quorum_pk = %hex::encode(fqc.quorum_public_key.to_bytes()),
                "final commitment"
            );
        }
    }

    println!("{}", nodes[0].session.status_json()?);
    Ok(())
}
