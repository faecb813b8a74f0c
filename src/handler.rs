//! Inbound message pipeline of a DKG session.
//!
//! Messages are queued per kind as they arrive. While the session is in the
//! phase that consumes a kind, [`SessionHandler::process_pending`] drains that
//! queue in batches: cheap pre-verification first, then operator signatures
//! through the BLS worker's batcher, and only then the session itself.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::bls_worker::BlsWorker;
use crate::config::SessionConfig;
use crate::dkg::{DkgSession, PreVerifyOutcome};
use crate::messages::{DkgMessage, MessageKind};
use crate::sig_batcher::SIG_VERIFY_BATCH_SIZE;
use crate::transport::{MessageRelay, BAN_SCORE};
use crate::types::{short_hex, Hash256, PeerId, QuorumPhase, Wire};

/// Message kind a phase consumes.
pub fn phase_message_kind(phase: QuorumPhase) -> Option<MessageKind> {
    match phase {
        QuorumPhase::Contribute => Some(MessageKind::Contribution),
        QuorumPhase::Complain => Some(MessageKind::Complaint),
        QuorumPhase::Justify => Some(MessageKind::Justification),
        QuorumPhase::Commit => Some(MessageKind::PrematureCommitment),
        _ => None,
    }
}

/// Queue of not yet processed messages of one kind. `None` as peer marks
/// messages produced locally, which are not subject to the per-peer cap.
pub struct PendingMessages {
    kind: MessageKind,
    max_messages_per_node: usize,
    messages_per_node: HashMap<PeerId, usize>,
    queue: VecDeque<(Option<PeerId>, DkgMessage)>,
    seen: HashSet<Hash256>,
}

impl PendingMessages {
    pub fn new(kind: MessageKind, max_messages_per_node: usize) -> Self {
        Self {
            kind,
            max_messages_per_node,
            messages_per_node: HashMap::new(),
            queue: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    pub fn push(&mut self, peer: Option<PeerId>, msg: DkgMessage) -> bool {
        if msg.kind() != self.kind {
            return false;
        }
        if let Some(peer) = peer {
            let count = self.messages_per_node.entry(peer).or_insert(0);
            if *count >= self.max_messages_per_node {
                debug!(peer, kind = ?self.kind, "too many messages from peer");
                return false;
            }
            *count += 1;
        }
        if !self.seen.insert(msg.hash()) {
            return false;
        }
        self.queue.push_back((peer, msg));
        true
    }

    pub fn pop(&mut self, max: usize) -> Vec<(Option<PeerId>, DkgMessage)> {
        let n = max.min(self.queue.len());
        self.queue.drain(..n).collect()
    }

    pub fn has_seen(&self, hash: &Hash256) -> bool {
        self.seen.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

pub struct SessionHandler {
    worker: Arc<BlsWorker>,
    relay: Arc<dyn MessageRelay>,
    contributions: PendingMessages,
    complaints: PendingMessages,
    justifications: PendingMessages,
    premature_commitments: PendingMessages,
}

impl SessionHandler {
    pub fn new(worker: Arc<BlsWorker>, relay: Arc<dyn MessageRelay>, config: &SessionConfig) -> Self {
        let cap = config.max_messages_per_node;
        Self {
            worker,
            relay,
            contributions: PendingMessages::new(MessageKind::Contribution, cap),
            complaints: PendingMessages::new(MessageKind::Complaint, cap),
            justifications: PendingMessages::new(MessageKind::Justification, cap),
            premature_commitments: PendingMessages::new(MessageKind::PrematureCommitment, cap),
        }
    }

    fn queue_mut(&mut self, kind: MessageKind) -> &mut PendingMessages {
        match kind {
            MessageKind::Contribution => &mut self.contributions,
            MessageKind::Complaint => &mut self.complaints,
            MessageKind::Justification => &mut self.justifications,
            MessageKind::PrematureCommitment => &mut self.premature_commitments,
        }
    }

    pub fn pending(&self, kind: MessageKind) -> &PendingMessages {
        match kind {
            MessageKind::Contribution => &self.contributions,
            MessageKind::Complaint => &self.complaints,
            MessageKind::Justification => &self.justifications,
            MessageKind::PrematureCommitment => &self.premature_commitments,
        }
    }

    pub fn push_pending(&mut self, peer: Option<PeerId>, msg: DkgMessage) -> bool {
        self.queue_mut(msg.kind()).push(peer, msg)
    }

    /// Decodes a message off the wire; undecodable input bans the peer.
    pub fn push_pending_bytes(&mut self, peer: PeerId, bytes: &[u8]) -> bool {
        match DkgMessage::decode(bytes) {
            Ok(msg) => self.push_pending(Some(peer), msg),
            Err(err) => {
                warn!(peer, %err, "undecodable dkg message");
                self.relay.misbehaving(peer, BAN_SCORE);
                false
            }
        }
    }

    /// Processes every queued message of the kind the session's phase
    /// consumes. Returns how many messages the session accepted.
    pub fn process_pending(&mut self, session: &mut DkgSession) -> usize {
        let Some(kind) = phase_message_kind(session.phase()) else {
            return 0;
        };
        let mut accepted = 0;
        loop {
            let batch = self.queue_mut(kind).pop(SIG_VERIFY_BATCH_SIZE);
            if batch.is_empty() {
                return accepted;
            }
            accepted += self.process_batch(session, batch);
        }
    }

    fn process_batch(
        &self,
        session: &mut DkgSession,
        batch: Vec<(Option<PeerId>, DkgMessage)>,
    ) -> usize {
        let mut preverified = Vec::with_capacity(batch.len());
        for (peer, msg) in batch {
            match session.pre_verify(&msg) {
                PreVerifyOutcome::Accept => preverified.push((peer, msg)),
                PreVerifyOutcome::Reject { ban } => {
                    debug!(peer = ?peer, kind = ?msg.kind(), ban, "pre-verification rejected message");
                    if let (true, Some(peer)) = (ban, peer) {
                        self.relay.misbehaving(peer, BAN_SCORE);
                    }
                }
            }
        }
        if preverified.is_empty() {
            return 0;
        }

        let handles: Vec<_> = preverified
            .iter()
            .map(|(_, msg)| {
                session.operator_key_of(msg.sender()).map(|pk| {
                    self.worker
                        .verify_sig_handle(*msg.sig(), pk, msg.sign_hash(), None)
                })
            })
            .collect();

        let mut bad_peers = HashSet::new();
        let mut verified = Vec::with_capacity(preverified.len());
        for ((peer, msg), handle) in preverified.into_iter().zip(handles) {
            let ok = handle.is_some_and(|h| h.wait().unwrap_or(false));
            if ok {
                verified.push((peer, msg));
                continue;
            }
            warn!(
                peer = ?peer,
                kind = ?msg.kind(),
                sender = %short_hex(msg.sender()),
                "invalid message signature"
            );
            if let Some(peer) = peer {
                if bad_peers.insert(peer) {
                    self.relay.misbehaving(peer, BAN_SCORE);
                }
            }
        }

        let mut accepted = 0;
        for (peer, msg) in verified {
            if peer.is_some_and(|p| bad_peers.contains(&p)) {
                continue;
            }
            accepted += 1;
            if let Some(inv) = session.receive_message(msg) {
                self.relay.relay_inventory(inv);
            }
        }
        accepted
    }
}
