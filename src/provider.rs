//! Collaborator contracts consumed by the DKG session, with in-memory
//! implementations for tests and local networks.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::bls::{PublicKey, SecretKey, Signature};
use crate::contribution::VerificationVector;
use crate::ies::EncryptedContributions;
use crate::types::{Hash256, MemberId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RosterEntry {
    pub member_id: MemberId,
    pub operator_key: PublicKey,
}

pub trait RosterProvider: Send + Sync {
    /// Ordered roster for the epoch. Every honest node must see the same list.
    fn roster_for_epoch(&self, llmq_type: u8, base_block_hash: &Hash256) -> Vec<RosterEntry>;
}

/// Fixed roster, independent of the epoch.
#[derive(Clone, Debug, Default)]
pub struct StaticRoster {
    pub entries: Vec<RosterEntry>,
}

impl RosterProvider for StaticRoster {
    fn roster_for_epoch(&self, _llmq_type: u8, _base_block_hash: &Hash256) -> Vec<RosterEntry> {
        self.entries.clone()
    }
}

/// This node's long-term operator credential.
pub trait OperatorKey: Send + Sync {
    fn public_key(&self) -> PublicKey;
    fn sign(&self, hash: &Hash256) -> Signature;
    fn decrypt(&self, payload: &EncryptedContributions, my_index: usize) -> Option<SecretKey>;
}

pub struct LocalOperatorKey {
    sk: SecretKey,
}

impl LocalOperatorKey {
    pub fn new(sk: SecretKey) -> Self {
        Self { sk }
    }
}

impl fmt::Debug for LocalOperatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalOperatorKey")
            .field("public_key", &self.sk.public_key())
            .finish()
    }
}

impl OperatorKey for LocalOperatorKey {
    fn public_key(&self) -> PublicKey {
        self.sk.public_key()
    }

    fn sign(&self, hash: &Hash256) -> Signature {
        self.sk.sign(hash)
    }

    fn decrypt(&self, payload: &EncryptedContributions, my_index: usize) -> Option<SecretKey> {
        payload.decrypt(my_index, &self.sk).ok()
    }
}

/// Contributions a commitment can be rebuilt from.
#[derive(Clone, Debug)]
pub struct VerifiedContributions {
    pub member_indexes: Vec<usize>,
    pub vvecs: Vec<VerificationVector>,
    pub sk_contributions: Vec<SecretKey>,
}

pub trait ContributionStore: Send + Sync {
    fn write_verified_vvec_contribution(
        &self,
        quorum_hash: &Hash256,
        member: &MemberId,
        vvec: &VerificationVector,
    );
    fn write_encrypted_contributions(
        &self,
        quorum_hash: &Hash256,
        member: &MemberId,
        contributions: &EncryptedContributions,
    );
    fn write_verified_sk_contribution(&self, quorum_hash: &Hash256, member: &MemberId, sk: &SecretKey);
    /// `None` unless every valid member has both a vvec and a verified share.
    fn get_verified_contributions(
        &self,
        quorum_hash: &Hash256,
        valid_members: &[bool],
        roster: &[RosterEntry],
    ) -> Option<VerifiedContributions>;
}

#[derive(Default)]
struct StoredContribution {
    vvec: Option<VerificationVector>,
    encrypted: Option<EncryptedContributions>,
    sk: Option<SecretKey>,
}

#[derive(Default)]
pub struct MemoryContributionStore {
    entries: Mutex<HashMap<(Hash256, MemberId), StoredContribution>>,
}

impl MemoryContributionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_encrypted(&self, quorum_hash: &Hash256, member: &MemberId) -> bool {
        self.entries
            .lock()
            .get(&(*quorum_hash, *member))
            .is_some_and(|e| e.encrypted.is_some())
    }
}

impl ContributionStore for MemoryContributionStore {
    fn write_verified_vvec_contribution(
        &self,
        quorum_hash: &Hash256,
        member: &MemberId,
        vvec: &VerificationVector,
    ) {
        self.entries
            .lock()
            .entry((*quorum_hash, *member))
            .or_default()
            .vvec = Some(vvec.clone());
    }

    fn write_encrypted_contributions(
        &self,
        quorum_hash: &Hash256,
        member: &MemberId,
        contributions: &EncryptedContributions,
    ) {
        self.entries
            .lock()
            .entry((*quorum_hash, *member))
            .or_default()
            .encrypted = Some(contributions.clone());
    }

    fn write_verified_sk_contribution(&self, quorum_hash: &Hash256, member: &MemberId, sk: &SecretKey) {
        self.entries
            .lock()
            .entry((*quorum_hash, *member))
            .or_default()
            .sk = Some(*sk);
    }

    fn get_verified_contributions(
        &self,
        quorum_hash: &Hash256,
        valid_members: &[bool],
        roster: &[RosterEntry],
    ) -> Option<VerifiedContributions> {
        let entries = self.entries.lock();
        let mut out = VerifiedContributions {
            member_indexes: Vec::new(),
            vvecs: Vec::new(),
            sk_contributions: Vec::new(),
        };
        for (idx, valid) in valid_members.iter().enumerate() {
            if !*valid {
                continue;
            }
            let entry = entries.get(&(*quorum_hash, roster.get(idx)?.member_id))?;
            out.member_indexes.push(idx);
            out.vvecs.push(entry.vvec.clone()?);
            out.sk_contributions.push(entry.sk?);
        }
        Some(out)
    }
}

/// Faults a test network can inject into its own protocol behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    ContributionOmit,
    ContributionLie,
    ComplainLie,
    JustifyOmit,
    JustifyLie,
    CommitOmit,
    CommitLie,
}

pub trait FaultInjector: Send + Sync {
    fn should_inject(&self, kind: FaultKind) -> bool;

    /// Picks one of `n` variants of a lie.
    fn pick(&self, _n: usize) -> usize {
        0
    }
}

/// Production behaviour: never misbehave.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn should_inject(&self, _kind: FaultKind) -> bool {
        false
    }
}

/// Fires each kind with its configured probability.
pub struct RateFaults {
    rates: BTreeMap<FaultKind, f64>,
    rng: Mutex<ChaCha20Rng>,
}

impl RateFaults {
    pub fn new(rates: BTreeMap<FaultKind, f64>, seed: u64) -> Self {
        Self {
            rates,
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
        }
    }

    /// Fires `kind` every time.
    pub fn always(kind: FaultKind) -> Self {
        Self::new(BTreeMap::from([(kind, 1.0)]), 0)
    }
}

impl FaultInjector for RateFaults {
    fn should_inject(&self, kind: FaultKind) -> bool {
        match self.rates.get(&kind) {
            Some(rate) if *rate > 0.0 => self.rng.lock().gen_bool(rate.min(1.0)),
            _ => false,
        }
    }

    fn pick(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        self.rng.lock().gen_range(0..n)
    }
}

pub trait PeerConnectivity: Send + Sync {
    fn is_connected(&self, member: &MemberId) -> bool;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AllConnected;

impl PeerConnectivity for AllConnected {
    fn is_connected(&self, _member: &MemberId) -> bool {
        true
    }
}
