//! DKG protocol messages, their canonical encodings and the commitment hash.
//!
//! Every message is signed with the sender's operator key over its sign
//! hash, the domain-tagged hash of the encoding without the signature.
//! Premature commitments sign the commitment hash instead, so that the
//! operator signatures of all members agreeing on a commitment can be
//! securely aggregated into the final commitment.

use std::sync::Arc;

use blstrs::G2Projective;
use group::Group;
use serde::{Deserialize, Serialize};

use crate::bls::{vvec_hash, PublicKey, SecretKey, Signature};
use crate::contribution::VerificationVector;
use crate::encoding::{Reader, Writer};
use crate::ies::EncryptedContributions;
use crate::provider::RosterEntry;
use crate::types::{Error, Hash256, MemberId, QuorumParams, Wire};

const PK_LEN: usize = 96;
const SIG_LEN: usize = 48;
const SK_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Contribution,
    Complaint,
    Justification,
    PrematureCommitment,
}

impl MessageKind {
    fn tag(self) -> u8 {
        match self {
            MessageKind::Contribution => 0,
            MessageKind::Complaint => 1,
            MessageKind::Justification => 2,
            MessageKind::PrematureCommitment => 3,
        }
    }

    fn domain(self) -> &'static [u8] {
        match self {
            MessageKind::Contribution => b"quorum-dkg/contribution",
            MessageKind::Complaint => b"quorum-dkg/complaint",
            MessageKind::Justification => b"quorum-dkg/justification",
            MessageKind::PrematureCommitment => b"quorum-dkg/premature-commitment",
        }
    }
}

/// Announcement that a message with `hash` is available for relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Inventory {
    pub kind: MessageKind,
    pub hash: Hash256,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contribution {
    pub llmq_type: u8,
    pub quorum_hash: Hash256,
    pub pro_tx_hash: MemberId,
    pub vvec: VerificationVector,
    pub contributions: Arc<EncryptedContributions>,
    pub sig: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Complaint {
    pub llmq_type: u8,
    pub quorum_hash: Hash256,
    pub pro_tx_hash: MemberId,
    pub bad_members: Vec<bool>,
    pub complain_for_members: Vec<bool>,
    pub sig: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Justification {
    pub llmq_type: u8,
    pub quorum_hash: Hash256,
    pub pro_tx_hash: MemberId,
    /// Revealed shares, keyed by the roster index of the complaining member.
    pub contributions: Vec<(u32, SecretKey)>,
    pub sig: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrematureCommitment {
    pub llmq_type: u8,
    pub quorum_hash: Hash256,
    pub pro_tx_hash: MemberId,
    pub valid_members: Vec<bool>,
    pub quorum_public_key: PublicKey,
    pub quorum_vvec_hash: Hash256,
    /// Threshold share signature over the commitment hash.
    pub quorum_sig: Signature,
    /// Operator signature over the commitment hash.
    pub sig: Signature,
}

impl PrematureCommitment {
    pub fn count_valid_members(&self) -> usize {
        count_bits(&self.valid_members)
    }

    pub fn commitment_hash(&self) -> Hash256 {
        build_commitment_hash(
            self.llmq_type,
            &self.quorum_hash,
            &self.valid_members,
            &self.quorum_public_key,
            &self.quorum_vvec_hash,
        )
    }
}

/// Outcome of a DKG round, as it would be mined.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalCommitment {
    pub llmq_type: u8,
    pub quorum_hash: Hash256,
    pub signers: Vec<bool>,
    pub valid_members: Vec<bool>,
    pub quorum_public_key: PublicKey,
    pub quorum_vvec_hash: Hash256,
    pub quorum_sig: Signature,
    pub members_sig: Signature,
}

impl FinalCommitment {
    /// Commitment stating that no quorum formed.
    pub fn null(params: &QuorumParams, quorum_hash: Hash256) -> Self {
        Self {
            llmq_type: params.llmq_type,
            quorum_hash,
            signers: vec![false; params.size],
            valid_members: vec![false; params.size],
            quorum_public_key: PublicKey::from_point(G2Projective::identity()),
            quorum_vvec_hash: [0u8; 32],
            quorum_sig: Signature::default(),
            members_sig: Signature::default(),
        }
    }

    pub fn count_signers(&self) -> usize {
        count_bits(&self.signers)
    }

    pub fn count_valid_members(&self) -> usize {
        count_bits(&self.valid_members)
    }

    pub fn commitment_hash(&self) -> Hash256 {
        build_commitment_hash(
            self.llmq_type,
            &self.quorum_hash,
            &self.valid_members,
            &self.quorum_public_key,
            &self.quorum_vvec_hash,
        )
    }

    pub fn is_null(&self) -> bool {
        !self.signers.iter().any(|b| *b)
            && !self.valid_members.iter().any(|b| *b)
            && !self.quorum_public_key.is_valid()
            && self.quorum_vvec_hash == [0u8; 32]
            && !self.quorum_sig.is_valid()
            && !self.members_sig.is_valid()
    }

    pub fn verify_null(&self, params: &QuorumParams) -> bool {
        self.llmq_type == params.llmq_type && self.verify_sizes(params) && self.is_null()
    }

    pub fn verify_sizes(&self, params: &QuorumParams) -> bool {
        self.signers.len() == params.size && self.valid_members.len() == params.size
    }

    /// Structural checks and, with `check_sigs`, both signatures.
    pub fn verify(&self, params: &QuorumParams, roster: &[RosterEntry], check_sigs: bool) -> bool {
        if self.llmq_type != params.llmq_type || !self.verify_sizes(params) {
            return false;
        }
        if self.count_valid_members() < params.min_size || self.count_signers() < params.min_size {
            return false;
        }
        if !self.quorum_public_key.is_valid() || self.quorum_vvec_hash == [0u8; 32] {
            return false;
        }
        if roster.len() > params.size {
            return false;
        }
        let beyond_roster = roster.len()..params.size;
        if self.signers[beyond_roster.clone()].iter().any(|b| *b)
            || self.valid_members[beyond_roster].iter().any(|b| *b)
        {
            return false;
        }
        if !check_sigs {
            return true;
        }

        let hash = self.commitment_hash();
        let signer_keys: Vec<PublicKey> = roster
            .iter()
            .zip(self.signers.iter())
            .filter(|(_, signed)| **signed)
            .map(|(entry, _)| entry.operator_key)
            .collect();
        self.members_sig.verify_secure_aggregated(&signer_keys, &hash)
            && self.quorum_sig.verify(&self.quorum_public_key, &hash)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DkgMessage {
    Contribution(Contribution),
    Complaint(Complaint),
    Justification(Justification),
    PrematureCommitment(PrematureCommitment),
}

impl DkgMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            DkgMessage::Contribution(_) => MessageKind::Contribution,
            DkgMessage::Complaint(_) => MessageKind::Complaint,
            DkgMessage::Justification(_) => MessageKind::Justification,
            DkgMessage::PrematureCommitment(_) => MessageKind::PrematureCommitment,
        }
    }

    pub fn llmq_type(&self) -> u8 {
        match self {
            DkgMessage::Contribution(m) => m.llmq_type,
            DkgMessage::Complaint(m) => m.llmq_type,
            DkgMessage::Justification(m) => m.llmq_type,
            DkgMessage::PrematureCommitment(m) => m.llmq_type,
        }
    }

    pub fn quorum_hash(&self) -> &Hash256 {
        match self {
            DkgMessage::Contribution(m) => &m.quorum_hash,
            DkgMessage::Complaint(m) => &m.quorum_hash,
            DkgMessage::Justification(m) => &m.quorum_hash,
            DkgMessage::PrematureCommitment(m) => &m.quorum_hash,
        }
    }

    pub fn sender(&self) -> &MemberId {
        match self {
            DkgMessage::Contribution(m) => &m.pro_tx_hash,
            DkgMessage::Complaint(m) => &m.pro_tx_hash,
            DkgMessage::Justification(m) => &m.pro_tx_hash,
            DkgMessage::PrematureCommitment(m) => &m.pro_tx_hash,
        }
    }

    pub fn sig(&self) -> &Signature {
        match self {
            DkgMessage::Contribution(m) => &m.sig,
            DkgMessage::Complaint(m) => &m.sig,
            DkgMessage::Justification(m) => &m.sig,
            DkgMessage::PrematureCommitment(m) => &m.sig,
        }
    }

    fn sig_mut(&mut self) -> &mut Signature {
        match self {
            DkgMessage::Contribution(m) => &mut m.sig,
            DkgMessage::Complaint(m) => &mut m.sig,
            DkgMessage::Justification(m) => &mut m.sig,
            DkgMessage::PrematureCommitment(m) => &mut m.sig,
        }
    }

    /// Hash the sender's operator key signs.
    pub fn sign_hash(&self) -> Hash256 {
        if let DkgMessage::PrematureCommitment(m) = self {
            return m.commitment_hash();
        }
        let mut w = Writer::new();
        self.write_body(&mut w);
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.kind().domain());
        hasher.update(&w.finish());
        *hasher.finalize().as_bytes()
    }

    /// Signs in place with the operator's `sign` function.
    pub fn signed_with(mut self, sign: impl FnOnce(&Hash256) -> Signature) -> Self {
        let hash = self.sign_hash();
        *self.sig_mut() = sign(&hash);
        self
    }

    /// Identity of the message for relay and deduplication.
    pub fn hash(&self) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"quorum-dkg/message");
        hasher.update(&self.encode());
        *hasher.finalize().as_bytes()
    }

    pub fn inventory(&self) -> Inventory {
        Inventory {
            kind: self.kind(),
            hash: self.hash(),
        }
    }

    fn write_body(&self, w: &mut Writer) {
        w.u8(self.llmq_type()).raw(self.quorum_hash()).raw(self.sender());
        match self {
            DkgMessage::Contribution(m) => {
                write_vvec(w, &m.vvec);
                w.bytes(&m.contributions.encode());
            }
            DkgMessage::Complaint(m) => {
                w.bits(&m.bad_members).bits(&m.complain_for_members);
            }
            DkgMessage::Justification(m) => {
                w.len(m.contributions.len());
                for (idx, sk) in &m.contributions {
                    w.u32(*idx).raw(&sk.to_bytes());
                }
            }
            DkgMessage::PrematureCommitment(m) => {
                w.bits(&m.valid_members)
                    .raw(&m.quorum_public_key.to_bytes())
                    .raw(&m.quorum_vvec_hash)
                    .raw(&m.quorum_sig.to_bytes());
            }
        }
    }
}

/// Hash all members sign when agreeing on a quorum.
pub fn build_commitment_hash(
    llmq_type: u8,
    quorum_hash: &Hash256,
    valid_members: &[bool],
    quorum_public_key: &PublicKey,
    quorum_vvec_hash: &Hash256,
) -> Hash256 {
    let encoded = Writer::new()
        .u8(llmq_type)
        .raw(quorum_hash)
        .bits(valid_members)
        .raw(&quorum_public_key.to_bytes())
        .raw(quorum_vvec_hash)
        .finish();
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"quorum-dkg/commitment");
    hasher.update(&encoded);
    *hasher.finalize().as_bytes()
}

/// Commitment hash a member signs for a given quorum vvec.
pub fn commitment_hash_for_vvec(
    llmq_type: u8,
    quorum_hash: &Hash256,
    valid_members: &[bool],
    vvec: &[PublicKey],
) -> Option<Hash256> {
    let quorum_public_key = vvec.first()?;
    Some(build_commitment_hash(
        llmq_type,
        quorum_hash,
        valid_members,
        quorum_public_key,
        &vvec_hash(vvec),
    ))
}

fn count_bits(bits: &[bool]) -> usize {
    bits.iter().filter(|b| **b).count()
}

fn write_vvec(w: &mut Writer, vvec: &[PublicKey]) {
    w.len(vvec.len());
    for pk in vvec {
        w.raw(&pk.to_bytes());
    }
}

fn read_vvec(r: &mut Reader<'_>) -> Result<VerificationVector, Error> {
    let n = r.len(PK_LEN)?;
    let vvec = (0..n)
        .map(|_| PublicKey::from_bytes(r.take(PK_LEN)?))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Arc::new(vvec))
}

fn read_sig(r: &mut Reader<'_>) -> Result<Signature, Error> {
    Signature::from_bytes(r.take(SIG_LEN)?)
}

impl Wire for DkgMessage {
    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(self.kind().tag());
        self.write_body(&mut w);
        w.raw(&self.sig().to_bytes());
        w.finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(bytes);
        let tag = r.u8()?;
        let llmq_type = r.u8()?;
        let quorum_hash = r.array::<32>()?;
        let pro_tx_hash = r.array::<32>()?;
        let msg = match tag {
            0 => {
                let vvec = read_vvec(&mut r)?;
                let contributions = Arc::new(EncryptedContributions::decode(&r.bytes()?)?);
                DkgMessage::Contribution(Contribution {
                    llmq_type,
                    quorum_hash,
                    pro_tx_hash,
                    vvec,
                    contributions,
                    sig: read_sig(&mut r)?,
                })
            }
            1 => DkgMessage::Complaint(Complaint {
                llmq_type,
                quorum_hash,
                pro_tx_hash,
                bad_members: r.bits()?,
                complain_for_members: r.bits()?,
                sig: read_sig(&mut r)?,
            }),
            2 => {
                let n = r.len(4 + SK_LEN)?;
                let contributions = (0..n)
                    .map(|_| -> Result<(u32, SecretKey), Error> {
                        Ok((r.u32()?, SecretKey::from_bytes(r.take(SK_LEN)?)?))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                DkgMessage::Justification(Justification {
                    llmq_type,
                    quorum_hash,
                    pro_tx_hash,
                    contributions,
                    sig: read_sig(&mut r)?,
                })
            }
            3 => DkgMessage::PrematureCommitment(PrematureCommitment {
                llmq_type,
                quorum_hash,
                pro_tx_hash,
                valid_members: r.bits()?,
                quorum_public_key: PublicKey::from_bytes(r.take(PK_LEN)?)?,
                quorum_vvec_hash: r.array::<32>()?,
                quorum_sig: read_sig(&mut r)?,
                sig: read_sig(&mut r)?,
            }),
            _ => return Err(Error::InvalidEncoding),
        };
        r.finish()?;
        Ok(msg)
    }
}

impl Wire for FinalCommitment {
    fn encode(&self) -> Vec<u8> {
        Writer::new()
            .u8(self.llmq_type)
            .raw(&self.quorum_hash)
            .bits(&self.signers)
            .bits(&self.valid_members)
            .raw(&self.quorum_public_key.to_bytes())
            .raw(&self.quorum_vvec_hash)
            .raw(&self.quorum_sig.to_bytes())
            .raw(&self.members_sig.to_bytes())
            .finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(bytes);
        let commitment = FinalCommitment {
            llmq_type: r.u8()?,
            quorum_hash: r.array::<32>()?,
            signers: r.bits()?,
            valid_members: r.bits()?,
            quorum_public_key: PublicKey::from_bytes(r.take(PK_LEN)?)?,
            quorum_vvec_hash: r.array::<32>()?,
            quorum_sig: read_sig(&mut r)?,
            members_sig: read_sig(&mut r)?,
        };
        r.finish()?;
        Ok(commitment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    #[test]
    fn complaint_survives_wire_and_keeps_signature() {
        let mut rng = ChaCha20Rng::seed_from_u64(21);
        let sk = SecretKey::random(&mut rng);
        let msg = DkgMessage::Complaint(Complaint {
            llmq_type: 100,
            quorum_hash: [3; 32],
            pro_tx_hash: [4; 32],
            bad_members: vec![false, true, false],
            complain_for_members: vec![true, false, false],
            sig: Signature::default(),
        })
        .signed_with(|h| sk.sign(h));
        let decoded = DkgMessage::decode(&msg.encode()).expect("decode");
        assert_eq!(decoded, msg);
        assert!(decoded.sig().verify(&sk.public_key(), &decoded.sign_hash()));
        assert_eq!(decoded.hash(), msg.hash());
    }

    #[test]
    fn sign_hash_ignores_signature_but_message_hash_does_not() {
        let mut rng = ChaCha20Rng::seed_from_u64(22);
        let sk = SecretKey::random(&mut rng);
        let unsigned = DkgMessage::Justification(Justification {
            llmq_type: 100,
            quorum_hash: [1; 32],
            pro_tx_hash: [2; 32],
            contributions: vec![(1, sk)],
            sig: Signature::default(),
        });
        let signed = unsigned.clone().signed_with(|h| sk.sign(h));
        assert_eq!(unsigned.sign_hash(), signed.sign_hash());
        assert_ne!(unsigned.hash(), signed.hash());
    }

    #[test]
    fn unknown_tag_and_trailing_bytes_rejected() {
        let msg = DkgMessage::Complaint(Complaint {
            llmq_type: 1,
            quorum_hash: [0; 32],
            pro_tx_hash: [0; 32],
            bad_members: vec![false; 4],
            complain_for_members: vec![false; 4],
            sig: Signature::default(),
        });
        let mut bytes = msg.encode();
        bytes.push(0);
        assert!(DkgMessage::decode(&bytes).is_err());
        bytes.pop();
        bytes[0] = 9;
        assert!(DkgMessage::decode(&bytes).is_err());
    }

    #[test]
    fn null_commitment_verifies_as_null_only() {
        let params = QuorumParams::llmq_test();
        let null = FinalCommitment::null(&params, [5; 32]);
        assert!(null.verify_null(&params));
        assert!(!null.verify(&params, &[], false));
        let decoded = FinalCommitment::decode(&null.encode()).expect("decode");
        assert_eq!(decoded, null);
    }
}
