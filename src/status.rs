//! Debug snapshot of a DKG session.

use serde::Serialize;

use crate::dkg::DkgSession;
use crate::types::{Error, QuorumPhase};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MemberStatus {
    pub idx: usize,
    pub member_id: String,
    pub bad: bool,
    pub bad_connection: bool,
    pub we_complain: bool,
    pub someone_complain: bool,
    pub received_contribution: bool,
    pub received_complaint: bool,
    pub received_justification: bool,
    pub received_premature_commitment: bool,
    /// Roster indexes of members that complained about this one.
    pub complaints_from_members: Vec<usize>,
    pub bad_member_votes: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub llmq_type: u8,
    pub quorum_hash: String,
    pub quorum_index: u32,
    pub phase: QuorumPhase,
    pub my_idx: Option<usize>,
    pub sent_contribution: bool,
    pub sent_complaint: bool,
    pub sent_justification: bool,
    pub sent_premature_commitment: bool,
    pub stored_messages: usize,
    pub members: Vec<MemberStatus>,
}

impl DkgSession {
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            llmq_type: self.params.llmq_type,
            quorum_hash: hex::encode(self.quorum_hash),
            quorum_index: self.quorum_index,
            phase: self.phase,
            my_idx: self.my_idx,
            sent_contribution: self.sent.contribution,
            sent_complaint: self.sent.complaint,
            sent_justification: self.sent.justification,
            sent_premature_commitment: self.sent.premature_commitment,
            stored_messages: self.stored_message_count(),
            members: self
                .members
                .iter()
                .map(|m| MemberStatus {
                    idx: m.idx,
                    member_id: hex::encode(m.entry.member_id),
                    bad: m.bad,
                    bad_connection: m.bad_connection,
                    we_complain: m.we_complain,
                    someone_complain: m.someone_complain,
                    received_contribution: !m.contributions.is_empty(),
                    received_complaint: !m.complaints.is_empty(),
                    received_justification: !m.justifications.is_empty(),
                    received_premature_commitment: !m.premature_commitments.is_empty(),
                    complaints_from_members: m.complaints_from_others.iter().copied().collect(),
                    bad_member_votes: m.bad_member_votes.len(),
                })
                .collect(),
        }
    }

    pub fn status_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(&self.status())?)
    }
}
