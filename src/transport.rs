//! Message relay interface between a DKG session and the peer network.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::messages::{DkgMessage, Inventory};
use crate::types::PeerId;

/// Score that gets a peer disconnected.
pub const BAN_SCORE: u32 = 100;

/// Abstraction for message delivery.
pub trait MessageRelay: Send + Sync {
    /// Send a message to one peer, or to every participant when `target` is `None`.
    fn push_message(&self, target: Option<PeerId>, msg: DkgMessage);

    /// Announce a received message to the other participants.
    fn relay_inventory(&self, inv: Inventory);

    /// Report a misbehaving peer.
    fn misbehaving(&self, peer: PeerId, score: u32);
}

/// In-memory relay for tests/demos. Outbound messages are queued until the
/// owner drains them.
#[derive(Default)]
pub struct InMemoryRelay {
    outbox: Mutex<Vec<(Option<PeerId>, DkgMessage)>>,
    inventories: Mutex<Vec<Inventory>>,
    scores: Mutex<HashMap<PeerId, u32>>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain all queued outbound messages.
    pub fn take_outbox(&self) -> Vec<(Option<PeerId>, DkgMessage)> {
        std::mem::take(&mut *self.outbox.lock())
    }

    pub fn inventories(&self) -> Vec<Inventory> {
        self.inventories.lock().clone()
    }

    pub fn misbehavior_score(&self, peer: PeerId) -> u32 {
        self.scores.lock().get(&peer).copied().unwrap_or(0)
    }

    pub fn is_banned(&self, peer: PeerId) -> bool {
        self.misbehavior_score(peer) >= BAN_SCORE
    }
}

impl MessageRelay for InMemoryRelay {
    fn push_message(&self, target: Option<PeerId>, msg: DkgMessage) {
        self.outbox.lock().push((target, msg));
    }

    fn relay_inventory(&self, inv: Inventory) {
        self.inventories.lock().push(inv);
    }

    fn misbehaving(&self, peer: PeerId, score: u32) {
        let mut scores = self.scores.lock();
        let entry = scores.entry(peer).or_insert(0);
        *entry = entry.saturating_add(score);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageKind;

    #[test]
    fn scores_accumulate_until_ban() {
        let relay = InMemoryRelay::new();
        relay.misbehaving(7, 40);
        assert!(!relay.is_banned(7));
        relay.misbehaving(7, 60);
        assert!(relay.is_banned(7));
        assert_eq!(relay.misbehavior_score(8), 0);

        relay.relay_inventory(Inventory {
            kind: MessageKind::Complaint,
            hash: [1; 32],
        });
        assert_eq!(relay.inventories().len(), 1);
        assert!(relay.take_outbox().is_empty());
    }
}
