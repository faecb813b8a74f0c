mod common;

use common::{honest_commitment, TestNetwork, QUORUM_HASH};
use quorum_dkg::bls::SecretKey;
use quorum_dkg::messages::{build_commitment_hash, commitment_hash_for_vvec};
use quorum_dkg::{FinalCommitment, NodeConfig, QuorumParams, Wire};
use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;

fn finished_commitment(seed: u64) -> (TestNetwork, FinalCommitment) {
    let mut net = TestNetwork::new(QuorumParams::custom(4, 3, 2), seed);
    let finals = net.run();
    let fqc = honest_commitment(&finals, &[0, 1, 2, 3]);
    (net, fqc)
}

#[test]
fn commitment_hash_is_deterministic_and_binds_every_field() {
    let mut rng = ChaCha20Rng::seed_from_u64(1);
    let pk = SecretKey::random(&mut rng).public_key();
    let other_pk = SecretKey::random(&mut rng).public_key();
    let bits = vec![true, false, true, true];
    let base = build_commitment_hash(100, &QUORUM_HASH, &bits, &pk, &[3; 32]);

    assert_eq!(base, build_commitment_hash(100, &QUORUM_HASH, &bits, &pk, &[3; 32]));
    assert_ne!(base, build_commitment_hash(101, &QUORUM_HASH, &bits, &pk, &[3; 32]));
    assert_ne!(base, build_commitment_hash(100, &[0; 32], &bits, &pk, &[3; 32]));
    assert_ne!(
        base,
        build_commitment_hash(100, &QUORUM_HASH, &[true, true, true, true], &pk, &[3; 32])
    );
    assert_ne!(base, build_commitment_hash(100, &QUORUM_HASH, &bits, &other_pk, &[3; 32]));
    assert_ne!(base, build_commitment_hash(100, &QUORUM_HASH, &bits, &pk, &[4; 32]));
    assert_eq!(commitment_hash_for_vvec(100, &QUORUM_HASH, &bits, &[]), None);
}

#[test]
fn final_commitment_hash_and_encoding_are_stable() {
    let (net, fqc) = finished_commitment(2);
    let hash = fqc.commitment_hash();
    assert_eq!(
        hash,
        build_commitment_hash(
            fqc.llmq_type,
            &fqc.quorum_hash,
            &fqc.valid_members,
            &fqc.quorum_public_key,
            &fqc.quorum_vvec_hash,
        )
    );
    assert!(fqc.verify(&net.params, &net.roster, true));
    let decoded = FinalCommitment::decode(&fqc.encode()).expect("decode");
    assert_eq!(decoded, fqc);
}

#[test]
fn tampered_final_commitment_fails_verification() {
    let (net, fqc) = finished_commitment(3);
    let params = &net.params;
    let roster = &net.roster;

    let mut dropped_signer = fqc.clone();
    let signer = dropped_signer
        .signers
        .iter()
        .position(|b| *b)
        .expect("a signer");
    dropped_signer.signers[signer] = false;
    assert!(!dropped_signer.verify(params, roster, true));

    let mut other_key = fqc.clone();
    let mut rng = ChaCha20Rng::seed_from_u64(4);
    other_key.quorum_public_key = SecretKey::random(&mut rng).public_key();
    assert!(!other_key.verify(params, roster, true));
    // Structure alone is still fine.
    assert!(other_key.verify(params, roster, false));

    let mut forged_sig = fqc.clone();
    forged_sig.quorum_sig = SecretKey::random(&mut rng).sign(&fqc.commitment_hash());
    assert!(!forged_sig.verify(params, roster, true));

    let mut swapped_sigs = fqc.clone();
    std::mem::swap(&mut swapped_sigs.quorum_sig, &mut swapped_sigs.members_sig);
    assert!(!swapped_sigs.verify(params, roster, true));

    let mut shrunk = fqc.clone();
    shrunk.valid_members.pop();
    assert!(!shrunk.verify(params, roster, false));

    let mut zero_vvec = fqc.clone();
    zero_vvec.quorum_vvec_hash = [0; 32];
    assert!(!zero_vvec.verify(params, roster, false));

    let mut foreign_type = fqc;
    foreign_type.llmq_type = params.llmq_type.wrapping_add(1);
    assert!(!foreign_type.verify(params, roster, false));
}

#[test]
fn bits_beyond_a_short_roster_are_rejected() {
    let (net, fqc) = finished_commitment(5);
    let mut padded_params = net.params.clone();
    padded_params.size = 5;
    let mut padded = fqc;
    padded.signers.push(false);
    padded.valid_members.push(false);
    assert!(padded.verify(&padded_params, &net.roster, false));

    padded.valid_members[4] = true;
    assert!(!padded.verify(&padded_params, &net.roster, false));
}

#[test]
fn null_commitment_round_trips() {
    let params = QuorumParams::llmq_test();
    let null = FinalCommitment::null(&params, QUORUM_HASH);
    assert!(null.is_null());
    assert!(null.verify_null(&params));
    assert!(!null.verify(&params, &[], false));

    let decoded = FinalCommitment::decode(&null.encode()).expect("decode");
    assert!(decoded.verify_null(&params));
    assert!(!decoded.verify_null(&QuorumParams::llmq_devnet()));
}

#[test]
fn minimum_quorum_completes() {
    let mut net = TestNetwork::new(QuorumParams::custom(3, 3, 1), 6);
    let finals = net.run();
    let fqc = honest_commitment(&finals, &[0, 1, 2]);
    assert_eq!(fqc.count_valid_members(), 3);
    assert!(fqc.verify(&net.params, &net.roster, true));
}

#[test]
fn config_rejects_inconsistent_quorum() {
    let json = r#"{
        "quorum": {
            "llmq_type": 250, "name": "broken", "size": 3,
            "min_size": 4, "threshold": 2, "bad_votes_threshold": 2
        }
    }"#;
    assert!(NodeConfig::from_json_str(json).is_err());
    assert!(NodeConfig::from_json_str("{ not json").is_err());
}
