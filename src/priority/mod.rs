
use stun::attributes::ATTR_PRIORITY;
use stun::checks::*;
use stun::message::*;

use crate::candidate::CandidateType;
use crate::control::Role;

/// Represents PRIORITY attribute.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct PriorityAttr(pub u32);

const PRIORITY_SIZE: usize = 4; // 32 bit

impl Setter for PriorityAttr {
    /// Adds PRIORITY attribute to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_PRIORITY, &self.0.to_be_bytes());
        Ok(())
    }
}

impl Getter for PriorityAttr {
    /// Decodes PRIORITY attribute from message.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_PRIORITY)?;
        check_size(ATTR_PRIORITY, v.len(), PRIORITY_SIZE)?;
        self.0 = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
        Ok(())
    }
}

/// Computes the priority of a candidate.
///
/// 4.1.2.1.  Recommended Formula
/// priority = (2^24)*(type preference) +
///            (2^8)*(local preference) +
///            (2^0)*(256 - component ID)
pub fn candidate_priority(kind: CandidateType, local_preference: u16, component_id: u16) -> u32 {
    (u32::from(kind.preference()) << 24)
        | (u32::from(local_preference) << 8)
        | (256 - u32::from(component_id))
}

/// The value a connectivity check carries in its PRIORITY attribute: the
/// priority the sending candidate would have if it were promoted to
/// peer reflexive (7.1.2.1).
pub fn prflx_priority(local_preference: u16, component_id: u16) -> u32 {
    candidate_priority(CandidateType::PeerReflexive, local_preference, component_id)
}

/// Computes the priority of a candidate pair.
///
/// RFC 5245 - 5.7.2.  Computing Pair Priority and Ordering Pairs
/// Let G be the priority for the candidate provided by the controlling
/// agent.  Let D be the priority for the candidate provided by the
/// controlled agent.
/// pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
pub fn pair_priority(local_priority: u32, remote_priority: u32, role: Role) -> u64 {
    let (g, d) = match role {
        Role::Controlling => (u64::from(local_priority), u64::from(remote_priority)),
        Role::Controlled => (u64::from(remote_priority), u64::from(local_priority)),
    };

    (g.min(d) << 32) | (g.max(d) << 1) | u64::from(g > d)
}
