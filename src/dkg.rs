//! One DKG run over a fixed roster.
//!
//! The session is driven by its owner through the phase actions
//! ([`DkgSession::contribute`] through [`DkgSession::finalize_commitments`])
//! and fed with messages by the session handler. Every mutation takes
//! `&mut self`; work sent to the BLS worker returns its verdicts through
//! handles that are applied on the calling thread.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use rand_core::OsRng;
use tracing::{debug, info, warn};

use crate::bls::{vvec_hash, BlsId, PublicKey, SecretKey, Signature};
use crate::bls_worker::BlsWorker;
use crate::cache::BlsWorkerCache;
use crate::config::SessionConfig;
use crate::contribution::VerificationVector;
use crate::ies::EncryptedContributions;
use crate::messages::{
    build_commitment_hash, Complaint, Contribution, DkgMessage, FinalCommitment, Inventory,
    Justification, PrematureCommitment,
};
use crate::provider::{
    ContributionStore, FaultInjector, FaultKind, OperatorKey, PeerConnectivity, RosterEntry,
    RosterProvider,
};
use crate::transport::MessageRelay;
use crate::types::{short_hex, validate_params, Error, Hash256, MemberId, QuorumParams, QuorumPhase};

/// Result of the cheap checks run before a message's signature is verified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreVerifyOutcome {
    Accept,
    Reject { ban: bool },
}

impl PreVerifyOutcome {
    const IGNORE: Self = PreVerifyOutcome::Reject { ban: false };
    const BAN: Self = PreVerifyOutcome::Reject { ban: true };

    pub fn is_accept(self) -> bool {
        self == PreVerifyOutcome::Accept
    }
}

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionContext {
    pub worker: Arc<BlsWorker>,
    pub roster: Arc<dyn RosterProvider>,
    pub store: Arc<dyn ContributionStore>,
    pub relay: Arc<dyn MessageRelay>,
    /// Required when the local node is on the roster.
    pub operator: Option<Arc<dyn OperatorKey>>,
    pub faults: Arc<dyn FaultInjector>,
    pub connectivity: Arc<dyn PeerConnectivity>,
}

pub(crate) struct Member {
    pub(crate) idx: usize,
    pub(crate) entry: RosterEntry,
    pub(crate) id: BlsId,

    pub(crate) contributions: BTreeSet<Hash256>,
    pub(crate) complaints: BTreeSet<Hash256>,
    pub(crate) justifications: BTreeSet<Hash256>,
    pub(crate) premature_commitments: BTreeSet<Hash256>,

    pub(crate) bad_member_votes: BTreeSet<usize>,
    pub(crate) complaints_from_others: BTreeSet<usize>,

    pub(crate) bad: bool,
    pub(crate) bad_connection: bool,
    pub(crate) we_complain: bool,
    pub(crate) someone_complain: bool,
}

impl Member {
    fn new(idx: usize, entry: RosterEntry) -> Self {
        Self {
            idx,
            id: BlsId::from_member_id(&entry.member_id),
            entry,
            contributions: BTreeSet::new(),
            complaints: BTreeSet::new(),
            justifications: BTreeSet::new(),
            premature_commitments: BTreeSet::new(),
            bad_member_votes: BTreeSet::new(),
            complaints_from_others: BTreeSet::new(),
            bad: false,
            bad_connection: false,
            we_complain: false,
            someone_complain: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SentFlags {
    pub(crate) contribution: bool,
    pub(crate) complaint: bool,
    pub(crate) justification: bool,
    pub(crate) premature_commitment: bool,
}

pub struct DkgSession {
    pub(crate) params: QuorumParams,
    pub(crate) quorum_hash: Hash256,
    pub(crate) quorum_index: u32,
    pub(crate) phase: QuorumPhase,
    config: SessionConfig,

    worker: Arc<BlsWorker>,
    cache: BlsWorkerCache,
    store: Arc<dyn ContributionStore>,
    relay: Arc<dyn MessageRelay>,
    operator: Option<Arc<dyn OperatorKey>>,
    faults: Arc<dyn FaultInjector>,
    connectivity: Arc<dyn PeerConnectivity>,

    pub(crate) members: Vec<Member>,
    members_map: HashMap<MemberId, usize>,
    member_ids: Vec<BlsId>,
    pub(crate) my_idx: Option<usize>,

    vvec_contribution: Option<VerificationVector>,
    sk_contributions: Vec<SecretKey>,

    received_vvecs: Vec<Option<VerificationVector>>,
    received_sk_contributions: Vec<Option<SecretKey>>,
    encrypted_contributions: Vec<Option<Arc<EncryptedContributions>>>,
    pending_contribution_verifications: Vec<usize>,

    contributions: HashMap<Hash256, Contribution>,
    complaints: HashMap<Hash256, Complaint>,
    justifications: HashMap<Hash256, Justification>,
    premature_commitments: HashMap<Hash256, PrematureCommitment>,
    valid_commitments: BTreeSet<Hash256>,

    pub(crate) sent: SentFlags,
}

impl DkgSession {
    /// Init phase: fetches the roster and locates the local member.
    pub fn init(
        params: QuorumParams,
        quorum_hash: Hash256,
        quorum_index: u32,
        my_member_id: Option<MemberId>,
        ctx: SessionContext,
        config: SessionConfig,
    ) -> Result<Self, Error> {
        validate_params(&params)?;
        let roster = ctx.roster.roster_for_epoch(params.llmq_type, &quorum_hash);
        if roster.len() < params.min_size {
            return Err(Error::NotEnoughMembers {
                have: roster.len(),
                need: params.min_size,
            });
        }
        if roster.len() > params.size {
            return Err(Error::InvalidParams(format!(
                "roster of {} exceeds quorum size {}",
                roster.len(),
                params.size
            )));
        }

        let members: Vec<Member> = roster
            .into_iter()
            .enumerate()
            .map(|(idx, entry)| Member::new(idx, entry))
            .collect();
        let members_map: HashMap<MemberId, usize> = members
            .iter()
            .map(|m| (m.entry.member_id, m.idx))
            .collect();
        if members_map.len() != members.len() {
            return Err(Error::InvalidParams("duplicate member in roster".into()));
        }
        let member_ids = members.iter().map(|m| m.id).collect();
        let my_idx = my_member_id.and_then(|id| members_map.get(&id).copied());
        if my_idx.is_some() && ctx.operator.is_none() {
            return Err(Error::Config("a member session needs an operator key".into()));
        }

        let n = members.len();
        info!(
            quorum = %short_hex(&quorum_hash),
            llmq = %params.name,
            members = n,
            my_idx = ?my_idx,
            "dkg session initialized"
        );
        Ok(Self {
            params,
            quorum_hash,
            quorum_index,
            phase: QuorumPhase::Initialized,
            config,
            cache: BlsWorkerCache::new(ctx.worker.clone()),
            worker: ctx.worker,
            store: ctx.store,
            relay: ctx.relay,
            operator: ctx.operator,
            faults: ctx.faults,
            connectivity: ctx.connectivity,
            members,
            members_map,
            member_ids,
            my_idx,
            vvec_contribution: None,
            sk_contributions: Vec::new(),
            received_vvecs: vec![None; n],
            received_sk_contributions: vec![None; n],
            encrypted_contributions: vec![None; n],
            pending_contribution_verifications: Vec::new(),
            contributions: HashMap::new(),
            complaints: HashMap::new(),
            justifications: HashMap::new(),
            premature_commitments: HashMap::new(),
            valid_commitments: BTreeSet::new(),
            sent: SentFlags::default(),
        })
    }

    pub fn params(&self) -> &QuorumParams {
        &self.params
    }

    pub fn quorum_hash(&self) -> &Hash256 {
        &self.quorum_hash
    }

    pub fn phase(&self) -> QuorumPhase {
        self.phase
    }

    pub fn my_index(&self) -> Option<usize> {
        self.my_idx
    }

    pub fn are_we_member(&self) -> bool {
        self.my_idx.is_some()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.members.iter().map(|m| m.entry).collect()
    }

    pub fn member_index(&self, member: &MemberId) -> Option<usize> {
        self.members_map.get(member).copied()
    }

    pub fn operator_key_of(&self, member: &MemberId) -> Option<PublicKey> {
        self.member_index(member)
            .map(|idx| self.members[idx].entry.operator_key)
    }

    pub fn is_bad(&self, idx: usize) -> bool {
        self.members.get(idx).is_some_and(|m| m.bad)
    }

    pub fn we_complain(&self, idx: usize) -> bool {
        self.members.get(idx).is_some_and(|m| m.we_complain)
    }

    /// `!bad` per roster slot, padded to the quorum size.
    pub fn valid_member_bits(&self) -> Vec<bool> {
        let mut bits = vec![false; self.params.size];
        for m in &self.members {
            bits[m.idx] = !m.bad;
        }
        bits
    }

    /// Share this node verified (or adopted from a justification) for member `idx`.
    pub fn received_share(&self, idx: usize) -> Option<SecretKey> {
        self.received_sk_contributions.get(idx).copied().flatten()
    }

    /// Verification vector of the polynomial we contributed.
    pub fn own_verification_vector(&self) -> Option<&VerificationVector> {
        self.vvec_contribution.as_ref()
    }

    fn enter_phase(&mut self, requested: QuorumPhase) -> Result<(), Error> {
        if self.phase.next() != Some(requested) {
            return Err(Error::PhaseOrder {
                current: self.phase,
                requested,
            });
        }
        self.phase = requested;
        info!(quorum = %short_hex(&self.quorum_hash), phase = ?requested, "entering phase");
        Ok(())
    }

    fn mark_bad_member(&mut self, idx: usize) {
        let member = &mut self.members[idx];
        if member.bad {
            return;
        }
        member.bad = true;
        debug!(
            quorum = %short_hex(&self.quorum_hash),
            member = %short_hex(&member.entry.member_id),
            "marked member bad"
        );
    }

    fn operator(&self) -> Result<&Arc<dyn OperatorKey>, Error> {
        self.operator.as_ref().ok_or(Error::NotAMember)
    }

    fn broadcast(&self, msg: DkgMessage) {
        self.relay.push_message(None, msg);
    }

    /// Contribute phase: generate, encrypt and broadcast our contribution.
    pub fn contribute(&mut self) -> Result<(), Error> {
        self.enter_phase(QuorumPhase::Contribute)?;
        let Some(my_idx) = self.my_idx else {
            return Ok(());
        };

        let (vvec, mut shares) = self
            .worker
            .generate_contributions(self.params.threshold, &self.member_ids)?;
        self.vvec_contribution = Some(vvec.clone());
        self.sk_contributions = shares.clone();

        if self.faults.should_inject(FaultKind::ContributionOmit) {
            info!(quorum = %short_hex(&self.quorum_hash), "omitting contribution");
            return Ok(());
        }
        let n = self.members.len();
        if n > 1 && self.faults.should_inject(FaultKind::ContributionLie) {
            let mut target = self.faults.pick(n - 1);
            if target >= my_idx {
                target += 1;
            }
            info!(
                quorum = %short_hex(&self.quorum_hash),
                target,
                "lying in contribution"
            );
            shares[target] = SecretKey::random(&mut OsRng);
        }

        let recipients: Vec<PublicKey> = self.members.iter().map(|m| m.entry.operator_key).collect();
        let encrypted = EncryptedContributions::encrypt(&recipients, &shares, &mut OsRng)?;
        let operator = self.operator()?.clone();
        let msg = DkgMessage::Contribution(Contribution {
            llmq_type: self.params.llmq_type,
            quorum_hash: self.quorum_hash,
            pro_tx_hash: self.members[my_idx].entry.member_id,
            vvec,
            contributions: Arc::new(encrypted),
            sig: Signature::default(),
        })
        .signed_with(|h| operator.sign(h));
        self.sent.contribution = true;
        self.broadcast(msg);
        Ok(())
    }

    /// Cheap structural checks; signatures are verified by the caller.
    pub fn pre_verify(&self, msg: &DkgMessage) -> PreVerifyOutcome {
        if msg.llmq_type() != self.params.llmq_type || msg.quorum_hash() != &self.quorum_hash {
            debug!(kind = ?msg.kind(), "message for another quorum");
            return PreVerifyOutcome::IGNORE;
        }
        let Some(idx) = self.member_index(msg.sender()) else {
            debug!(kind = ?msg.kind(), sender = %short_hex(msg.sender()), "sender not a member");
            return PreVerifyOutcome::BAN;
        };
        let member = &self.members[idx];
        match msg {
            DkgMessage::Contribution(qc) => self.pre_verify_contribution(member, qc),
            DkgMessage::Complaint(qc) => self.pre_verify_complaint(member, qc),
            DkgMessage::Justification(qj) => self.pre_verify_justification(member, qj),
            DkgMessage::PrematureCommitment(qc) => self.pre_verify_premature_commitment(member, qc),
        }
    }

    fn pre_verify_contribution(&self, member: &Member, qc: &Contribution) -> PreVerifyOutcome {
        if qc.contributions.len() != self.members.len() {
            return PreVerifyOutcome::BAN;
        }
        if qc.vvec.len() != self.params.threshold {
            return PreVerifyOutcome::BAN;
        }
        if !self.worker.verify_verification_vector(&qc.vvec) {
            return PreVerifyOutcome::BAN;
        }
        if member.contributions.len() >= 2 {
            debug!(member = %short_hex(&member.entry.member_id), "dropping contribution, already got 2");
            return PreVerifyOutcome::IGNORE;
        }
        PreVerifyOutcome::Accept
    }

    fn pre_verify_complaint(&self, member: &Member, qc: &Complaint) -> PreVerifyOutcome {
        if qc.bad_members.len() != self.params.size
            || qc.complain_for_members.len() != self.params.size
        {
            return PreVerifyOutcome::BAN;
        }
        if member.complaints.len() >= 2 {
            debug!(member = %short_hex(&member.entry.member_id), "dropping complaint, already got 2");
            return PreVerifyOutcome::IGNORE;
        }
        PreVerifyOutcome::Accept
    }

    fn pre_verify_justification(&self, member: &Member, qj: &Justification) -> PreVerifyOutcome {
        if qj.contributions.is_empty() {
            return PreVerifyOutcome::BAN;
        }
        let mut seen = BTreeSet::new();
        for (index, sk) in &qj.contributions {
            if *index as usize >= self.members.len() || !seen.insert(*index) || !sk.is_valid() {
                return PreVerifyOutcome::BAN;
            }
        }
        if member.justifications.len() >= 2 {
            debug!(member = %short_hex(&member.entry.member_id), "dropping justification, already got 2");
            return PreVerifyOutcome::IGNORE;
        }
        PreVerifyOutcome::Accept
    }

    fn pre_verify_premature_commitment(
        &self,
        member: &Member,
        qc: &PrematureCommitment,
    ) -> PreVerifyOutcome {
        if qc.valid_members.len() != self.params.size {
            return PreVerifyOutcome::BAN;
        }
        if qc.count_valid_members() < self.params.min_size {
            return PreVerifyOutcome::BAN;
        }
        if !qc.sig.is_valid() || !qc.quorum_sig.is_valid() {
            return PreVerifyOutcome::BAN;
        }
        if qc.valid_members[self.members.len()..].iter().any(|b| *b) {
            return PreVerifyOutcome::BAN;
        }
        if member.premature_commitments.len() >= 2 {
            debug!(member = %short_hex(&member.entry.member_id), "dropping commitment, already got 2");
            return PreVerifyOutcome::IGNORE;
        }
        PreVerifyOutcome::Accept
    }

    /// Applies a message whose signature has been checked. Returns the
    /// inventory to relay, if any.
    pub fn receive_message(&mut self, msg: DkgMessage) -> Option<Inventory> {
        if !self.pre_verify(&msg).is_accept() {
            return None;
        }
        let inv = msg.inventory();
        let idx = self.member_index(msg.sender())?;
        let relay = match msg {
            DkgMessage::Contribution(qc) => self.receive_contribution(idx, inv.hash, qc),
            DkgMessage::Complaint(qc) => self.receive_complaint(idx, inv.hash, qc),
            DkgMessage::Justification(qj) => self.receive_justification(idx, inv.hash, qj),
            DkgMessage::PrematureCommitment(qc) => {
                self.receive_premature_commitment(idx, inv.hash, qc)
            }
        };
        relay.then_some(inv)
    }

    fn receive_contribution(&mut self, idx: usize, hash: Hash256, qc: Contribution) -> bool {
        if self.members[idx].contributions.len() >= 2 {
            return false;
        }
        self.members[idx].contributions.insert(hash);
        let vvec = qc.vvec.clone();
        let encrypted = qc.contributions.clone();
        self.contributions.insert(hash, qc);

        if self.members[idx].contributions.len() > 1 {
            // Relayed so the whole quorum sees the second contribution.
            self.mark_bad_member(idx);
            warn!(
                quorum = %short_hex(&self.quorum_hash),
                member = %short_hex(&self.members[idx].entry.member_id),
                "member sent multiple contributions"
            );
            return true;
        }

        self.received_vvecs[idx] = Some(vvec.clone());
        let Some(my_idx) = self.my_idx else {
            return true;
        };
        let member_id = self.members[idx].entry.member_id;
        self.store
            .write_verified_vvec_contribution(&self.quorum_hash, &member_id, &vvec);

        let share = self
            .operator
            .as_ref()
            .and_then(|op| op.decrypt(&encrypted, my_idx));
        let complain = match share {
            None => {
                debug!(member = %short_hex(&member_id), "contribution could not be decrypted");
                true
            }
            Some(sk) if !sk.is_valid() => {
                debug!(member = %short_hex(&member_id), "contribution holds a zero share");
                true
            }
            Some(_) if idx != my_idx && self.faults.should_inject(FaultKind::ComplainLie) => {
                info!(member = %short_hex(&member_id), "lying about contribution");
                true
            }
            Some(_) => false,
        };
        if complain {
            self.members[idx].we_complain = true;
            return true;
        }

        self.received_sk_contributions[idx] = share;
        self.encrypted_contributions[idx] = Some(encrypted);
        self.pending_contribution_verifications.push(idx);
        if self.pending_contribution_verifications.len() >= self.config.pending_verify_flush {
            self.verify_pending_contributions();
        }
        true
    }

    /// Batch-verifies every decrypted share still waiting for verification.
    pub fn verify_pending_contributions(&mut self) {
        let Some(my_idx) = self.my_idx else {
            return;
        };
        let pending = std::mem::take(&mut self.pending_contribution_verifications);
        let mut indexes = Vec::with_capacity(pending.len());
        let mut vvecs = Vec::with_capacity(pending.len());
        let mut shares = Vec::with_capacity(pending.len());
        for idx in pending {
            let m = &self.members[idx];
            if m.bad || m.we_complain {
                continue;
            }
            let (Some(vvec), Some(sk)) = (&self.received_vvecs[idx], self.received_sk_contributions[idx])
            else {
                continue;
            };
            if let Some(encrypted) = &self.encrypted_contributions[idx] {
                self.store
                    .write_encrypted_contributions(&self.quorum_hash, &m.entry.member_id, encrypted);
            }
            indexes.push(idx);
            vvecs.push(vvec.clone());
            shares.push(sk);
        }
        if indexes.is_empty() {
            return;
        }

        let results = self.worker.verify_contribution_shares(
            self.members[my_idx].id,
            vvecs,
            shares.clone(),
            self.config.parallel_verification,
            true,
        );
        for ((idx, ok), sk) in indexes.iter().zip(results).zip(shares.iter()) {
            let member_id = self.members[*idx].entry.member_id;
            if ok {
                self.store
                    .write_verified_sk_contribution(&self.quorum_hash, &member_id, sk);
            } else {
                debug!(member = %short_hex(&member_id), "invalid contribution, will complain");
                self.members[*idx].we_complain = true;
                self.received_sk_contributions[*idx] = None;
            }
        }
        debug!(
            quorum = %short_hex(&self.quorum_hash),
            verified = indexes.len(),
            "verified pending contributions"
        );
    }

    /// Complain phase: flag silent members and broadcast our complaint.
    pub fn verify_and_complain(&mut self) -> Result<(), Error> {
        self.enter_phase(QuorumPhase::Complain)?;
        let Some(my_idx) = self.my_idx else {
            return Ok(());
        };
        self.verify_pending_contributions();

        for idx in 0..self.members.len() {
            if !self.members[idx].bad && self.members[idx].contributions.is_empty() {
                debug!(
                    member = %short_hex(&self.members[idx].entry.member_id),
                    "member sent no contribution"
                );
                self.mark_bad_member(idx);
            }
        }

        if self.config.check_connections {
            for m in self.members.iter_mut().filter(|m| m.idx != my_idx) {
                m.bad_connection = !self.connectivity.is_connected(&m.entry.member_id);
            }
        }

        self.send_complaint(my_idx)
    }

    fn send_complaint(&mut self, my_idx: usize) -> Result<(), Error> {
        let mut bad_members = vec![false; self.params.size];
        let mut complain_for_members = vec![false; self.params.size];
        for m in &self.members {
            if m.bad || m.bad_connection {
                bad_members[m.idx] = true;
            } else if m.we_complain {
                complain_for_members[m.idx] = true;
            }
        }
        let bad_count = bad_members.iter().filter(|b| **b).count();
        let complaint_count = complain_for_members.iter().filter(|b| **b).count();
        if bad_count == 0 && complaint_count == 0 {
            return Ok(());
        }
        info!(
            quorum = %short_hex(&self.quorum_hash),
            bad_count,
            complaint_count,
            "sending complaint"
        );
        let operator = self.operator()?.clone();
        let msg = DkgMessage::Complaint(Complaint {
            llmq_type: self.params.llmq_type,
            quorum_hash: self.quorum_hash,
            pro_tx_hash: self.members[my_idx].entry.member_id,
            bad_members,
            complain_for_members,
            sig: Signature::default(),
        })
        .signed_with(|h| operator.sign(h));
        self.sent.complaint = true;
        self.broadcast(msg);
        Ok(())
    }

    fn receive_complaint(&mut self, idx: usize, hash: Hash256, qc: Complaint) -> bool {
        if self.members[idx].complaints.len() >= 2 {
            return false;
        }
        self.members[idx].complaints.insert(hash);
        if self.members[idx].complaints.len() > 1 {
            self.complaints.insert(hash, qc);
            self.mark_bad_member(idx);
            warn!(
                quorum = %short_hex(&self.quorum_hash),
                member = %short_hex(&self.members[idx].entry.member_id),
                "member sent multiple complaints"
            );
            return true;
        }

        for i in 0..self.members.len() {
            if qc.bad_members[i] {
                self.members[i].bad_member_votes.insert(idx);
            }
            if qc.complain_for_members[i] {
                let target = &mut self.members[i];
                target.complaints_from_others.insert(idx);
                target.someone_complain = true;
                if Some(i) == self.my_idx {
                    debug!(member = %short_hex(&self.members[idx].entry.member_id), "complained about us");
                }
            }
        }
        self.complaints.insert(hash, qc);
        true
    }

    /// Justify phase: apply bad votes and reveal shares we were complained about.
    pub fn verify_and_justify(&mut self) -> Result<(), Error> {
        self.enter_phase(QuorumPhase::Justify)?;
        let Some(my_idx) = self.my_idx else {
            return Ok(());
        };

        let mut justify_for = BTreeSet::new();
        for idx in 0..self.members.len() {
            let m = &self.members[idx];
            if m.bad {
                continue;
            }
            if m.bad_member_votes.len() >= self.params.bad_votes_threshold {
                debug!(
                    member = %short_hex(&m.entry.member_id),
                    votes = m.bad_member_votes.len(),
                    "member voted bad"
                );
                self.mark_bad_member(idx);
                continue;
            }
            let Some(first) = m.complaints.first() else {
                continue;
            };
            if m.complaints.len() != 1 {
                self.mark_bad_member(idx);
                continue;
            }
            if self
                .complaints
                .get(first)
                .is_some_and(|qc| qc.complain_for_members[my_idx])
            {
                justify_for.insert(idx);
            }
        }

        if justify_for.is_empty() {
            return Ok(());
        }
        self.send_justification(my_idx, &justify_for)
    }

    fn send_justification(&mut self, my_idx: usize, justify_for: &BTreeSet<usize>) -> Result<(), Error> {
        let mut contributions = Vec::with_capacity(justify_for.len());
        for &idx in justify_for {
            let Some(mut sk) = self.sk_contributions.get(idx).copied() else {
                continue;
            };
            if idx != my_idx && self.faults.should_inject(FaultKind::JustifyLie) {
                info!(member = %short_hex(&self.members[idx].entry.member_id), "lying in justification");
                sk = SecretKey::random(&mut OsRng);
            }
            contributions.push((idx as u32, sk));
        }
        if self.faults.should_inject(FaultKind::JustifyOmit) {
            info!(quorum = %short_hex(&self.quorum_hash), "omitting justification");
            return Ok(());
        }
        if contributions.is_empty() {
            return Ok(());
        }
        info!(
            quorum = %short_hex(&self.quorum_hash),
            count = contributions.len(),
            "sending justification"
        );
        let operator = self.operator()?.clone();
        let msg = DkgMessage::Justification(Justification {
            llmq_type: self.params.llmq_type,
            quorum_hash: self.quorum_hash,
            pro_tx_hash: self.members[my_idx].entry.member_id,
            contributions,
            sig: Signature::default(),
        })
        .signed_with(|h| operator.sign(h));
        self.sent.justification = true;
        self.broadcast(msg);
        Ok(())
    }

    fn receive_justification(&mut self, idx: usize, hash: Hash256, qj: Justification) -> bool {
        if self.members[idx].justifications.len() >= 2 {
            return false;
        }
        self.members[idx].justifications.insert(hash);
        let revealed = qj.contributions.clone();
        self.justifications.insert(hash, qj);

        if self.members[idx].justifications.len() > 1 {
            warn!(
                quorum = %short_hex(&self.quorum_hash),
                member = %short_hex(&self.members[idx].entry.member_id),
                "member sent multiple justifications"
            );
            self.mark_bad_member(idx);
            return true;
        }
        if self.members[idx].bad {
            return true;
        }

        for (index, _) in &revealed {
            if !self.members[idx].complaints_from_others.contains(&(*index as usize)) {
                debug!(
                    member = %short_hex(&self.members[idx].entry.member_id),
                    for_member = index,
                    "justification without a complaint"
                );
                self.mark_bad_member(idx);
            }
        }
        if self.members[idx].bad {
            return true;
        }
        let Some(vvec) = self.received_vvecs[idx].clone() else {
            self.mark_bad_member(idx);
            return true;
        };

        let handles: Vec<_> = revealed
            .iter()
            .map(|(index, sk)| {
                self.worker.async_verify_contribution_share(
                    self.members[*index as usize].id,
                    vvec.clone(),
                    *sk,
                )
            })
            .collect();
        // Every handle is awaited before the verdicts are applied.
        let results: Vec<bool> = handles
            .into_iter()
            .map(|h| h.wait().unwrap_or(false))
            .collect();

        for ((index, sk), ok) in revealed.iter().zip(results) {
            let target = *index as usize;
            if !ok {
                debug!(
                    member = %short_hex(&self.members[idx].entry.member_id),
                    for_member = target,
                    "invalid justification"
                );
                self.mark_bad_member(idx);
                continue;
            }
            if Some(target) == self.my_idx {
                self.received_sk_contributions[idx] = Some(*sk);
                self.members[idx].we_complain = false;
                let member_id = self.members[idx].entry.member_id;
                self.store
                    .write_verified_sk_contribution(&self.quorum_hash, &member_id, sk);
            }
            self.members[idx].complaints_from_others.remove(&target);
        }
        true
    }

    /// Commit phase: settle open complaints and broadcast our premature commitment.
    pub fn verify_and_commit(&mut self) -> Result<(), Error> {
        self.enter_phase(QuorumPhase::Commit)?;
        let Some(my_idx) = self.my_idx else {
            return Ok(());
        };
        for idx in 0..self.members.len() {
            if !self.members[idx].bad && !self.members[idx].complaints_from_others.is_empty() {
                debug!(
                    member = %short_hex(&self.members[idx].entry.member_id),
                    "open complaints, marking bad"
                );
                self.mark_bad_member(idx);
            }
        }
        self.send_commitment(my_idx)
    }

    fn send_commitment(&mut self, my_idx: usize) -> Result<(), Error> {
        let valid_members = self.valid_member_bits();
        let valid_count = valid_members.iter().filter(|b| **b).count();
        if valid_count < self.params.min_size {
            warn!(
                quorum = %short_hex(&self.quorum_hash),
                valid_count,
                "not enough valid members, not sending commitment"
            );
            return Ok(());
        }
        if self.faults.should_inject(FaultKind::CommitOmit) {
            info!(quorum = %short_hex(&self.quorum_hash), "omitting commitment");
            return Ok(());
        }

        let roster = self.roster();
        let Some(verified) =
            self.store
                .get_verified_contributions(&self.quorum_hash, &valid_members, &roster)
        else {
            warn!(quorum = %short_hex(&self.quorum_hash), "missing verified contributions");
            return Ok(());
        };
        let key = BlsWorkerCache::cache_key(&verified.member_indexes);
        let parallel = self.config.parallel_verification;
        let Some(vvec) = self
            .cache
            .build_quorum_verification_vector(key, &verified.vvecs, parallel)
        else {
            warn!(quorum = %short_hex(&self.quorum_hash), "failed to build quorum vvec");
            return Ok(());
        };
        let Some(sk_share) = self
            .cache
            .aggregate_secret_keys(key, verified.sk_contributions, parallel)
            .filter(SecretKey::is_valid)
        else {
            warn!(quorum = %short_hex(&self.quorum_hash), "failed to build own secret share");
            return Ok(());
        };

        let mut quorum_public_key = vvec[0];
        let mut quorum_vvec_hash = vvec_hash(&vvec);
        let lie = self
            .faults
            .should_inject(FaultKind::CommitLie)
            .then(|| self.faults.pick(5));
        if let Some(lie) = lie {
            info!(quorum = %short_hex(&self.quorum_hash), lie, "lying in commitment");
        }
        match lie {
            Some(0) => quorum_public_key = SecretKey::random(&mut OsRng).public_key(),
            Some(1) => quorum_vvec_hash[0] = quorum_vvec_hash[0].wrapping_add(1),
            _ => {}
        }

        let mut commitment_hash = build_commitment_hash(
            self.params.llmq_type,
            &self.quorum_hash,
            &valid_members,
            &quorum_public_key,
            &quorum_vvec_hash,
        );
        if lie == Some(2) {
            commitment_hash[0] = commitment_hash[0].wrapping_add(1);
        }
        let mut tweaked = commitment_hash;
        tweaked[5] = tweaked[5].wrapping_add(1);

        let operator = self.operator()?.clone();
        let sig = if lie == Some(3) {
            operator.sign(&tweaked)
        } else {
            operator.sign(&commitment_hash)
        };
        let quorum_sig = if lie == Some(4) {
            sk_share.sign(&tweaked)
        } else {
            sk_share.sign(&commitment_hash)
        };

        let msg = DkgMessage::PrematureCommitment(PrematureCommitment {
            llmq_type: self.params.llmq_type,
            quorum_hash: self.quorum_hash,
            pro_tx_hash: self.members[my_idx].entry.member_id,
            valid_members,
            quorum_public_key,
            quorum_vvec_hash,
            quorum_sig,
            sig,
        });
        info!(
            quorum = %short_hex(&self.quorum_hash),
            valid_count,
            quorum_pk = %short_hex(&quorum_public_key.to_bytes()),
            "sending premature commitment"
        );
        self.sent.premature_commitment = true;
        self.broadcast(msg);
        Ok(())
    }

    fn receive_premature_commitment(
        &mut self,
        idx: usize,
        hash: Hash256,
        qc: PrematureCommitment,
    ) -> bool {
        self.members[idx].premature_commitments.insert(hash);
        let roster = self.roster();
        let quorum_vvec = self
            .store
            .get_verified_contributions(&self.quorum_hash, &qc.valid_members, &roster)
            .and_then(|verified| {
                let key = BlsWorkerCache::cache_key(&verified.member_indexes);
                self.cache
                    .build_quorum_verification_vector(
                        key,
                        &verified.vvecs,
                        self.config.parallel_verification,
                    )
                    .map(|vvec| (key, vvec))
            });

        let fully_verified = match &quorum_vvec {
            // Without every contribution we cannot judge, but others might.
            None => {
                debug!(
                    member = %short_hex(&self.members[idx].entry.member_id),
                    "cannot build quorum vvec, skipping full verification"
                );
                true
            }
            Some((key, vvec)) => self.verify_commitment_against(idx, &qc, *key, vvec),
        };
        self.premature_commitments.insert(hash, qc);
        if !fully_verified {
            return false;
        }
        self.valid_commitments.insert(hash);
        true
    }

    fn verify_commitment_against(
        &self,
        idx: usize,
        qc: &PrematureCommitment,
        key: Hash256,
        vvec: &[PublicKey],
    ) -> bool {
        let member_id = short_hex(&self.members[idx].entry.member_id);
        if vvec.first() != Some(&qc.quorum_public_key) {
            debug!(member = %member_id, "quorum public key mismatch");
            return false;
        }
        if vvec_hash(vvec) != qc.quorum_vvec_hash {
            debug!(member = %member_id, "quorum vvec hash mismatch");
            return false;
        }
        let Some(pk_share) = self
            .cache
            .build_pub_key_share(key, vvec, &self.members[idx].id)
            .filter(PublicKey::is_valid)
        else {
            debug!(member = %member_id, "failed to compute public key share");
            return false;
        };
        if !qc.quorum_sig.verify(&pk_share, &qc.commitment_hash()) {
            debug!(member = %member_id, "quorum signature share does not verify");
            return false;
        }
        true
    }

    /// Finalize phase: turn agreeing premature commitments into final ones.
    pub fn finalize_commitments(&mut self) -> Result<Vec<FinalCommitment>, Error> {
        self.enter_phase(QuorumPhase::Finalize)?;
        let finals = if self.are_we_member() {
            self.build_final_commitments()
        } else {
            Vec::new()
        };
        self.phase = QuorumPhase::Idle;
        info!(
            quorum = %short_hex(&self.quorum_hash),
            commitments = finals.len(),
            "dkg session finished"
        );
        Ok(finals)
    }

    fn build_final_commitments(&self) -> Vec<FinalCommitment> {
        let mut groups: BTreeMap<&[bool], Vec<(usize, &PrematureCommitment)>> = BTreeMap::new();
        for hash in &self.valid_commitments {
            let Some(qc) = self.premature_commitments.get(hash) else {
                continue;
            };
            let Some(signer) = self.member_index(&qc.pro_tx_hash) else {
                continue;
            };
            groups
                .entry(qc.valid_members.as_slice())
                .or_default()
                .push((signer, qc));
        }

        let roster = self.roster();
        let mut finals = Vec::new();
        for (valid_members, mut commitments) in groups {
            if commitments.len() < self.params.min_size {
                debug!(signers = commitments.len(), "commitment signed by a minority");
                continue;
            }
            commitments.sort_by_key(|(signer, _)| *signer);
            let first = commitments[0].1;

            let mut fqc = FinalCommitment {
                llmq_type: self.params.llmq_type,
                quorum_hash: self.quorum_hash,
                signers: vec![false; self.params.size],
                valid_members: valid_members.to_vec(),
                quorum_public_key: first.quorum_public_key,
                quorum_vvec_hash: first.quorum_vvec_hash,
                quorum_sig: Signature::default(),
                members_sig: Signature::default(),
            };

            let mut member_sigs = Vec::with_capacity(commitments.len());
            let mut member_pks = Vec::with_capacity(commitments.len());
            let mut share_sigs = Vec::with_capacity(commitments.len());
            let mut share_ids = Vec::with_capacity(commitments.len());
            for (signer, qc) in commitments {
                if qc.quorum_public_key != first.quorum_public_key
                    || qc.quorum_vvec_hash != first.quorum_vvec_hash
                {
                    debug!(signer, "commitment disagrees with group, skipping");
                    continue;
                }
                if fqc.signers[signer] {
                    continue;
                }
                fqc.signers[signer] = true;
                member_sigs.push(qc.sig);
                member_pks.push(self.members[signer].entry.operator_key);
                share_sigs.push(qc.quorum_sig);
                share_ids.push(self.members[signer].id);
            }

            let Some(members_sig) = Signature::aggregate_secure(&member_sigs, &member_pks) else {
                continue;
            };
            fqc.members_sig = members_sig;
            match Signature::recover(&share_sigs, &share_ids) {
                Ok(sig) => fqc.quorum_sig = sig,
                Err(err) => {
                    warn!(%err, "failed to recover quorum signature");
                    continue;
                }
            }
            if !fqc.verify(&self.params, &roster, true) {
                warn!(
                    quorum = %short_hex(&self.quorum_hash),
                    "failed to verify final commitment"
                );
                continue;
            }
            info!(
                quorum = %short_hex(&self.quorum_hash),
                valid_members = fqc.count_valid_members(),
                signers = fqc.count_signers(),
                quorum_pk = %short_hex(&fqc.quorum_public_key.to_bytes()),
                "final commitment"
            );
            finals.push(fqc);
        }
        finals
    }

    pub(crate) fn stored_message_count(&self) -> usize {
        self.contributions.len()
            + self.complaints.len()
            + self.justifications.len()
            + self.premature_commitments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::provider::{AllConnected, LocalOperatorKey, MemoryContributionStore, NoFaults, StaticRoster};
    use crate::transport::InMemoryRelay;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    fn session(params: QuorumParams, roster_len: usize) -> Result<DkgSession, Error> {
        session_as(params, roster_len, Some([1; 32]))
    }

    fn session_as(
        params: QuorumParams,
        roster_len: usize,
        me: Option<MemberId>,
    ) -> Result<DkgSession, Error> {
        let mut rng = ChaCha20Rng::seed_from_u64(77);
        let keys: Vec<SecretKey> = (0..roster_len).map(|_| SecretKey::random(&mut rng)).collect();
        let entries = keys
            .iter()
            .enumerate()
            .map(|(i, sk)| RosterEntry {
                member_id: [i as u8 + 1; 32],
                operator_key: sk.public_key(),
            })
            .collect();
        let ctx = SessionContext {
            worker: Arc::new(BlsWorker::new(&WorkerConfig::with_workers(1))?),
            roster: Arc::new(StaticRoster { entries }),
            store: Arc::new(MemoryContributionStore::new()),
            relay: Arc::new(InMemoryRelay::new()),
            operator: keys
                .first()
                .filter(|_| me.is_some())
                .map(|sk| Arc::new(LocalOperatorKey::new(*sk)) as Arc<dyn OperatorKey>),
            faults: Arc::new(NoFaults),
            connectivity: Arc::new(AllConnected),
        };
        DkgSession::init(params, [9; 32], 0, me, ctx, SessionConfig::default())
    }

    #[test]
    fn small_roster_aborts_init() {
        let err = session(QuorumParams::custom(5, 3, 2), 2).err();
        assert!(matches!(err, Some(Error::NotEnoughMembers { have: 2, need: 3 })));
    }

    #[test]
    fn phases_cannot_be_skipped() {
        let mut s = session(QuorumParams::custom(3, 2, 2), 3).expect("session");
        assert_eq!(s.my_index(), Some(0));
        let err = s.verify_and_complain().err();
        assert!(matches!(
            err,
            Some(Error::PhaseOrder {
                current: QuorumPhase::Initialized,
                requested: QuorumPhase::Complain
            })
        ));
        s.contribute().expect("contribute");
        assert!(s.contribute().is_err());
        assert_eq!(s.phase(), QuorumPhase::Contribute);
    }

    #[test]
    fn observer_walks_phases_without_sending() {
        let mut s = session_as(QuorumParams::custom(3, 2, 2), 3, None).expect("session");
        assert!(!s.are_we_member());
        s.contribute().expect("contribute");
        s.verify_and_complain().expect("complain");
        s.verify_and_justify().expect("justify");
        s.verify_and_commit().expect("commit");
        assert!(s.finalize_commitments().expect("finalize").is_empty());
        assert_eq!(s.phase(), QuorumPhase::Idle);
        assert!(!s.status().sent_contribution);
    }

    #[test]
    fn roster_beyond_quorum_size_is_rejected() {
        let err = session(QuorumParams::custom(3, 2, 2), 4).err();
        assert!(matches!(err, Some(Error::InvalidParams(_))));
    }
}
