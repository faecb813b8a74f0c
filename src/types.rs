//! Common types, quorum parameters and error handling.

use serde::{Deserialize, Serialize};

/// 32-byte digest used for quorum hashes, message hashes and commitment hashes.
pub type Hash256 = [u8; 32];

/// Stable identity of a roster member (the hash of its registration record).
pub type MemberId = [u8; 32];

/// Peer handle used by the message handler and the relay.
pub type PeerId = u64;

pub trait Wire: Sized {
    // Canonical byte encoding for network transport and hashing.
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Result<Self, Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("invalid encoding")]
    InvalidEncoding,
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
    #[error("invalid secret key share")]
    InvalidShare,
    #[error("cryptographic operation failed")]
    CryptoError,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("not enough members: have {have}, need {need}")]
    NotEnoughMembers { have: usize, need: usize },
    #[error("local node is not a member of this quorum")]
    NotAMember,
    #[error("phase order violated: at {current:?}, requested {requested:?}")]
    PhaseOrder {
        current: QuorumPhase,
        requested: QuorumPhase,
    },
    #[error("worker pool stopped before the job completed")]
    WorkerStopped,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<hkdf::InvalidLength> for Error {
    fn from(_: hkdf::InvalidLength) -> Self {
        Error::CryptoError
    }
}

impl From<chacha20poly1305::aead::Error> for Error {
    fn from(_: chacha20poly1305::aead::Error) -> Self {
        Error::DecryptionFailed
    }
}

/// DKG phases. Ordering follows protocol progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QuorumPhase {
    Initialized,
    Contribute,
    Complain,
    Justify,
    Commit,
    Finalize,
    Idle,
}

impl QuorumPhase {
    pub fn next(self) -> Option<QuorumPhase> {
        use QuorumPhase::*;
        match self {
            Initialized => Some(Contribute),
            Contribute => Some(Complain),
            Complain => Some(Justify),
            Justify => Some(Commit),
            Commit => Some(Finalize),
            Finalize => Some(Idle),
            Idle => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumParams {
    pub llmq_type: u8,
    pub name: String,
    pub size: usize,
    pub min_size: usize,
    pub threshold: usize,
    pub bad_votes_threshold: usize,
}

impl QuorumParams {
    fn preset(
        llmq_type: u8,
        name: &str,
        size: usize,
        min_size: usize,
        threshold: usize,
        bad_votes_threshold: usize,
    ) -> Self {
        Self {
            llmq_type,
            name: name.to_string(),
            size,
            min_size,
            threshold,
            bad_votes_threshold,
        }
    }

    pub fn llmq_50_60() -> Self {
        Self::preset(1, "llmq_50_60", 50, 40, 30, 40)
    }

    pub fn llmq_400_60() -> Self {
        Self::preset(2, "llmq_400_60", 400, 300, 240, 300)
    }

    pub fn llmq_test() -> Self {
        Self::preset(100, "llmq_test", 3, 2, 2, 2)
    }

    pub fn llmq_devnet() -> Self {
        Self::preset(101, "llmq_devnet", 12, 7, 6, 7)
    }

    pub fn llmq_test_v17() -> Self {
        Self::preset(102, "llmq_test_v17", 3, 2, 2, 2)
    }

    /// Ad-hoc parameters, mostly for tests and local networks.
    pub fn custom(size: usize, min_size: usize, threshold: usize) -> Self {
        Self::preset(250, "llmq_custom", size, min_size, threshold, min_size)
    }
}

pub fn validate_params(params: &QuorumParams) -> Result<(), Error> {
    if params.size == 0 || params.min_size == 0 || params.min_size > params.size {
        return Err(Error::InvalidParams(format!(
            "min_size {} must be in 1..={}",
            params.min_size, params.size
        )));
    }
    if params.threshold == 0 || params.threshold > params.min_size {
        return Err(Error::InvalidParams(format!(
            "threshold {} must be in 1..={}",
            params.threshold, params.min_size
        )));
    }
    if params.bad_votes_threshold > params.size {
        return Err(Error::InvalidParams(format!(
            "bad_votes_threshold {} exceeds size {}",
            params.bad_votes_threshold, params.size
        )));
    }
    Ok(())
}

/// Short hex prefix for log fields.
pub fn short_hex(hash: &[u8]) -> String {
    hex::encode(&hash[..hash.len().min(6)])
}
