#![forbid(unsafe_code)]

pub mod aggregator;
pub mod bls;
pub mod bls_worker;
pub mod cache;
pub mod config;
pub mod contribution;
pub mod dkg;
pub mod encoding;
pub mod handler;
pub mod ies;
pub mod lagrange;
pub mod logging;
pub mod messages;
pub mod provider;
pub mod sig_batcher;
pub mod status;
pub mod transport;
pub mod types;
pub mod worker;
mod wire_impls;

pub use crate::bls_worker::BlsWorker;
pub use crate::config::{NodeConfig, SessionConfig, WorkerConfig};
pub use crate::dkg::{DkgSession, PreVerifyOutcome, SessionContext};
pub use crate::handler::SessionHandler;
pub use crate::messages::{DkgMessage, FinalCommitment, Inventory, MessageKind};
pub use crate::types::{Error, Hash256, MemberId, PeerId, QuorumParams, QuorumPhase, Wire};
