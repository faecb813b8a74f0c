//! BLS12-381 primitives: keys on G2, signatures on G1.
//!
//! Thin newtypes over `blstrs` with the algebra the quorum code needs:
//! insecure (plain sum) and secure (coefficient-weighted) aggregation,
//! polynomial share evaluation and Lagrange recovery.

use std::fmt;

use blstrs::{G1Affine, G1Projective, G2Affine, G2Projective, Gt, Scalar};
use ff::Field;
use group::{Curve, Group};
use rand_core::RngCore;

use crate::lagrange::combine_at_zero;
use crate::types::{Error, Hash256, MemberId};

const DST_SIG: &[u8] = b"QUORUM-DKG-V1_BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_";
const DST_SCALAR: &[u8] = b"QUORUM-DKG-V1-HASH-TO-SCALAR";

pub fn hash_to_g1(msg: &[u8]) -> G1Projective {
    G1Projective::hash_to_curve(msg, DST_SIG, &[])
}

pub fn pairing(g1: &G1Projective, g2: &G2Projective) -> Gt {
    blstrs::pairing(&g1.to_affine(), &g2.to_affine())
}

/// Maps arbitrary bytes to a non-zero scalar.
pub fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut counter = 0u32;
    loop {
        let mut hasher = blake3::Hasher::new();
        hasher.update(DST_SCALAR);
        hasher.update(&counter.to_be_bytes());
        for part in parts {
            hasher.update(part);
        }
        let mut raw = *hasher.finalize().as_bytes();
        // Clearing the top two bits keeps the value below the field modulus.
        raw[0] &= 0x3f;
        if let Some(s) = Option::<Scalar>::from(Scalar::from_bytes_be(&raw)) {
            if !bool::from(s.is_zero()) {
                return s;
            }
        }
        counter += 1;
    }
}

/// Types combined by the batch aggregator.
pub trait Aggregatable: Clone + Send + Sync + 'static {
    /// Associative, commutative combine.
    fn aggregate(&mut self, other: &Self);
    fn is_valid(&self) -> bool;
    fn content_hash(&self) -> Hash256;
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SecretKey(Scalar);

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

impl SecretKey {
    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        loop {
            let s = Scalar::random(&mut *rng);
            if !bool::from(s.is_zero()) {
                return SecretKey(s);
            }
        }
    }

    pub fn from_scalar(s: Scalar) -> Self {
        SecretKey(s)
    }

    pub fn scalar(&self) -> &Scalar {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        !bool::from(self.0.is_zero())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(G2Projective::generator() * self.0)
    }

    pub fn sign(&self, hash: &Hash256) -> Signature {
        Signature(hash_to_g1(hash) * self.0)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes_be()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let raw: [u8; 32] = bytes.try_into().map_err(|_| Error::InvalidEncoding)?;
        Option::<Scalar>::from(Scalar::from_bytes_be(&raw))
            .map(SecretKey)
            .ok_or(Error::InvalidEncoding)
    }
}

impl Aggregatable for SecretKey {
    fn aggregate(&mut self, other: &Self) {
        self.0 += other.0;
    }

    fn is_valid(&self) -> bool {
        SecretKey::is_valid(self)
    }

    fn content_hash(&self) -> Hash256 {
        *blake3::hash(&self.to_bytes()).as_bytes()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(G2Projective);

impl PublicKey {
    pub fn from_point(p: G2Projective) -> Self {
        PublicKey(p)
    }

    pub fn point(&self) -> &G2Projective {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        !bool::from(self.0.is_identity())
    }

    pub fn to_bytes(&self) -> [u8; 96] {
        self.0.to_affine().to_compressed()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let raw: [u8; 96] = bytes.try_into().map_err(|_| Error::InvalidEncoding)?;
        let affine =
            Option::<G2Affine>::from(G2Affine::from_compressed(&raw)).ok_or(Error::InvalidEncoding)?;
        Ok(PublicKey(affine.into()))
    }

    pub fn content_hash(&self) -> Hash256 {
        *blake3::hash(&self.to_bytes()).as_bytes()
    }

    /// Lagrange-recovers the key at x = 0 from shares taken at `ids`.
    pub fn recover(shares: &[PublicKey], ids: &[BlsId]) -> Result<PublicKey, Error> {
        let xs: Vec<Scalar> = ids.iter().map(|id| id.0).collect();
        let values: Vec<G2Projective> = shares.iter().map(|pk| pk.0).collect();
        combine_at_zero(&xs, &values).map(PublicKey)
    }
}

impl Aggregatable for PublicKey {
    fn aggregate(&mut self, other: &Self) {
        self.0 += other.0;
    }

    fn is_valid(&self) -> bool {
        PublicKey::is_valid(self)
    }

    fn content_hash(&self) -> Hash256 {
        PublicKey::content_hash(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature(G1Projective);

impl Default for Signature {
    fn default() -> Self {
        Signature(G1Projective::identity())
    }
}

impl Signature {
    pub fn from_point(p: G1Projective) -> Self {
        Signature(p)
    }

    pub fn point(&self) -> &G1Projective {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        !bool::from(self.0.is_identity())
    }

    pub fn to_bytes(&self) -> [u8; 48] {
        self.0.to_affine().to_compressed()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let raw: [u8; 48] = bytes.try_into().map_err(|_| Error::InvalidEncoding)?;
        let affine =
            Option::<G1Affine>::from(G1Affine::from_compressed(&raw)).ok_or(Error::InvalidEncoding)?;
        Ok(Signature(affine.into()))
    }

    pub fn verify(&self, pk: &PublicKey, hash: &Hash256) -> bool {
        if !self.is_valid() || !pk.is_valid() {
            return false;
        }
        pairing(&self.0, &G2Projective::generator()) == pairing(&hash_to_g1(hash), &pk.0)
    }

    /// Plain point sum. Only safe to verify over distinct message hashes.
    pub fn aggregate_insecure(sigs: &[Signature]) -> Signature {
        Signature(sigs.iter().fold(G1Projective::identity(), |acc, s| acc + s.0))
    }

    /// Checks an insecure aggregate over distinct message hashes.
    pub fn verify_aggregated(&self, pks: &[PublicKey], hashes: &[Hash256]) -> bool {
        if pks.is_empty() || pks.len() != hashes.len() || !self.is_valid() {
            return false;
        }
        let mut seen = std::collections::HashSet::with_capacity(hashes.len());
        if !hashes.iter().all(|h| seen.insert(*h)) {
            return false;
        }
        if !pks.iter().all(PublicKey::is_valid) {
            return false;
        }
        let lhs = pairing(&self.0, &G2Projective::generator());
        let rhs = pks
            .iter()
            .zip(hashes.iter())
            .fold(Gt::identity(), |acc, (pk, h)| acc + pairing(&hash_to_g1(h), &pk.0));
        lhs == rhs
    }

    /// Rogue-key resistant aggregation of signatures over one hash.
    pub fn aggregate_secure(sigs: &[Signature], pks: &[PublicKey]) -> Option<Signature> {
        if sigs.is_empty() || sigs.len() != pks.len() {
            return None;
        }
        let coeffs = secure_coefficients(pks);
        let agg = sigs
            .iter()
            .zip(coeffs.iter())
            .fold(G1Projective::identity(), |acc, (sig, c)| acc + sig.0 * c);
        Some(Signature(agg))
    }

    pub fn verify_secure_aggregated(&self, pks: &[PublicKey], hash: &Hash256) -> bool {
        if pks.is_empty() || !self.is_valid() || !pks.iter().all(PublicKey::is_valid) {
            return false;
        }
        let coeffs = secure_coefficients(pks);
        let agg_pk = pks
            .iter()
            .zip(coeffs.iter())
            .fold(G2Projective::identity(), |acc, (pk, c)| acc + pk.0 * c);
        self.verify(&PublicKey(agg_pk), hash)
    }

    /// Lagrange-recovers the threshold signature from partial signatures at `ids`.
    pub fn recover(sigs: &[Signature], ids: &[BlsId]) -> Result<Signature, Error> {
        let xs: Vec<Scalar> = ids.iter().map(|id| id.0).collect();
        let values: Vec<G1Projective> = sigs.iter().map(|s| s.0).collect();
        combine_at_zero(&xs, &values).map(Signature)
    }
}

impl Aggregatable for Signature {
    fn aggregate(&mut self, other: &Self) {
        self.0 += other.0;
    }

    fn is_valid(&self) -> bool {
        Signature::is_valid(self)
    }

    fn content_hash(&self) -> Hash256 {
        *blake3::hash(&self.to_bytes()).as_bytes()
    }
}

// c_i = H(pk_i || H(sorted pks))
fn secure_coefficients(pks: &[PublicKey]) -> Vec<Scalar> {
    let mut sorted: Vec<[u8; 96]> = pks.iter().map(PublicKey::to_bytes).collect();
    sorted.sort_unstable();
    let mut hasher = blake3::Hasher::new();
    for pk in sorted.iter() {
        hasher.update(pk);
    }
    let set_hash = hasher.finalize();
    pks.iter()
        .map(|pk| hash_to_scalar(&[&pk.to_bytes(), set_hash.as_bytes()]))
        .collect()
}

/// Evaluation point of a member in the quorum polynomial.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlsId(Scalar);

impl BlsId {
    pub fn from_member_id(member_id: &MemberId) -> Self {
        BlsId(hash_to_scalar(&[b"member", member_id]))
    }

    pub fn scalar(&self) -> &Scalar {
        &self.0
    }
}

/// Evaluates the committed polynomial at `id`.
pub fn public_key_share(vvec: &[PublicKey], id: &BlsId) -> Option<PublicKey> {
    if vvec.is_empty() {
        return None;
    }
    let mut acc = G2Projective::identity();
    for coeff in vvec.iter().rev() {
        acc = acc * id.0 + coeff.0;
    }
    Some(PublicKey(acc))
}

/// Evaluates the secret polynomial at `id`.
pub fn secret_key_share(coeffs: &[SecretKey], id: &BlsId) -> Option<SecretKey> {
    if coeffs.is_empty() {
        return None;
    }
    let mut acc = Scalar::ZERO;
    for coeff in coeffs.iter().rev() {
        acc *= id.0;
        acc += coeff.0;
    }
    Some(SecretKey(acc))
}

/// Hash of a verification vector, committed to in premature commitments.
pub fn vvec_hash(vvec: &[PublicKey]) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(vvec.len() as u32).to_be_bytes());
    for pk in vvec {
        hasher.update(&pk.to_bytes());
    }
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    #[test]
    fn secret_share_matches_public_share() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let coeffs: Vec<SecretKey> = (0..4).map(|_| SecretKey::random(&mut rng)).collect();
        let vvec: Vec<PublicKey> = coeffs.iter().map(SecretKey::public_key).collect();
        let id = BlsId::from_member_id(&[9u8; 32]);
        let sk = secret_key_share(&coeffs, &id).expect("sk share");
        assert_eq!(public_key_share(&vvec, &id), Some(sk.public_key()));
    }

    #[test]
    fn recover_threshold_signature() {
        let mut rng = ChaCha20Rng::seed_from_u64(8);
        let coeffs: Vec<SecretKey> = (0..3).map(|_| SecretKey::random(&mut rng)).collect();
        let hash = [5u8; 32];
        let ids: Vec<BlsId> = (0u8..5).map(|i| BlsId::from_member_id(&[i; 32])).collect();
        let partials: Vec<Signature> = ids
            .iter()
            .map(|id| secret_key_share(&coeffs, id).expect("share").sign(&hash))
            .collect();
        let sig = Signature::recover(&partials[1..4], &ids[1..4]).expect("recover");
        assert!(sig.verify(&coeffs[0].public_key(), &hash));
        let short = Signature::recover(&partials[..2], &ids[..2]).expect("recover");
        assert!(!short.verify(&coeffs[0].public_key(), &hash));
    }

    #[test]
    fn secure_aggregate_rejects_missing_signer() {
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        let sks: Vec<SecretKey> = (0..3).map(|_| SecretKey::random(&mut rng)).collect();
        let pks: Vec<PublicKey> = sks.iter().map(SecretKey::public_key).collect();
        let hash = [1u8; 32];
        let sigs: Vec<Signature> = sks.iter().map(|sk| sk.sign(&hash)).collect();
        let agg = Signature::aggregate_secure(&sigs, &pks).expect("agg");
        assert!(agg.verify_secure_aggregated(&pks, &hash));
        assert!(!agg.verify_secure_aggregated(&pks[..2], &hash));
    }

    #[test]
    fn aggregated_verify_rejects_duplicate_hashes() {
        let mut rng = ChaCha20Rng::seed_from_u64(10);
        let sks: Vec<SecretKey> = (0..2).map(|_| SecretKey::random(&mut rng)).collect();
        let hash = [3u8; 32];
        let mut agg = sks[0].sign(&hash);
        agg.aggregate(&sks[1].sign(&hash));
        let pks: Vec<PublicKey> = sks.iter().map(SecretKey::public_key).collect();
        assert!(!agg.verify_aggregated(&pks, &[hash, hash]));
    }

    #[test]
    fn identity_points_are_invalid() {
        assert!(!Signature::default().is_valid());
        assert!(!PublicKey::from_point(G2Projective::identity()).is_valid());
        assert!(!SecretKey::from_scalar(Scalar::ZERO).is_valid());
    }
}
