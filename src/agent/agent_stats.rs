use serde::Serialize;

use super::Agent;
use crate::candidate::{Candidate, CandidatePair, CandidatePairState, CandidateType, TransportAddress};
use crate::check_list::{CheckList, CheckListState};
use crate::control::Role;

/// Snapshot of one candidate, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateStats {
    pub candidate_type: CandidateType,
    pub component_id: u16,
    pub addr: TransportAddress,
    pub priority: u32,
    pub foundation: String,
    pub is_default: bool,
}

impl CandidateStats {
    fn from_candidate(c: &Candidate) -> Self {
        Self {
            candidate_type: c.kind,
            component_id: c.component_id,
            addr: c.addr.clone(),
            priority: c.priority,
            foundation: c.foundation.clone(),
            is_default: c.is_default,
        }
    }
}

/// Snapshot of one candidate pair, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CandidatePairStats {
    pub local: CandidateStats,
    pub remote: CandidateStats,
    pub state: CandidatePairState,
    pub priority: u64,
    pub nominated: bool,
    pub is_default: bool,
    pub role: Role,
    pub retransmissions: u32,
}

/// Snapshot of a whole check list, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CheckListStats {
    pub state: CheckListState,
    pub local_candidates: Vec<CandidateStats>,
    pub remote_candidates: Vec<CandidateStats>,
    pub pairs: Vec<CandidatePairStats>,
    pub valid_pairs: Vec<CandidatePairStats>,
}

fn pair_stats(cl: &CheckList, pair: &CandidatePair) -> CandidatePairStats {
    CandidatePairStats {
        local: CandidateStats::from_candidate(&cl.local_candidates[pair.local]),
        remote: CandidateStats::from_candidate(&cl.remote_candidates[pair.remote]),
        state: pair.state,
        priority: pair.priority,
        nominated: pair.is_nominated,
        is_default: pair.is_default,
        role: pair.role,
        retransmissions: pair.retransmissions,
    }
}

impl Agent {
    /// Returns a list of local candidates stats of a check list.
    pub fn get_local_candidates_stats(&self, check_list: usize) -> Vec<CandidateStats> {
        self.streams.get(check_list).map_or_else(Vec::new, |cl| {
            cl.local_candidates
                .values()
                .map(CandidateStats::from_candidate)
                .collect()
        })
    }

    /// Returns a list of remote candidates stats of a check list.
    pub fn get_remote_candidates_stats(&self, check_list: usize) -> Vec<CandidateStats> {
        self.streams.get(check_list).map_or_else(Vec::new, |cl| {
            cl.remote_candidates
                .values()
                .map(CandidateStats::from_candidate)
                .collect()
        })
    }

    /// Returns a list of candidate pair stats, in check-list order.
    pub fn get_candidate_pairs_stats(&self, check_list: usize) -> Vec<CandidatePairStats> {
        self.streams.get(check_list).map_or_else(Vec::new, |cl| {
            cl.check_list
                .iter()
                .map(|&id| pair_stats(cl, &cl.pairs[id]))
                .collect()
        })
    }

    /// Returns a full snapshot of a check list.
    pub fn get_check_list_stats(&self, check_list: usize) -> Option<CheckListStats> {
        let cl = self.streams.get(check_list)?;
        Some(CheckListStats {
            state: cl.state(),
            local_candidates: self.get_local_candidates_stats(check_list),
            remote_candidates: self.get_remote_candidates_stats(check_list),
            pairs: self.get_candidate_pairs_stats(check_list),
            valid_pairs: cl
                .valid_list
                .iter()
                .map(|vp| pair_stats(cl, &cl.pairs[vp.valid]))
                .collect(),
        })
    }
}
