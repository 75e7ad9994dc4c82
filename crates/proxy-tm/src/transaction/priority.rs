//! Branch reply priority and winner selection.
//!
//! Lower values win. Within the 4xx class a few codes that carry actionable
//! information for the caller (401, 407, 415, 420, 484) are preferred over
//! the rest of the class.

use super::branch::{flags, Branch, BranchSlot};

const PRIVILEGED_4XX: [u16; 5] = [1, 7, 15, 20, 84];

/// Priority of a final status code. `faked_penalty` is added to replies
/// generated locally.
pub fn reply_priority(code: u16, faked: bool, faked_penalty: u32) -> u32 {
    let xx = u32::from(code % 100);
    let base = match code / 100 {
        2 => 0,
        6 => 1000 + xx,
        3 => 3000 + xx,
        4 => {
            if PRIVILEGED_4XX.contains(&(code % 100)) {
                4000 + xx
            } else {
                4000 + 100 + xx
            }
        }
        5 => 5000 + xx,
        _ => 10000 + u32::from(code),
    };
    if faked { base + faked_penalty } else { base }
}

/// Outcome of [`pick_branch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    /// Some branch is still waiting for its final reply.
    Pending,
    /// Branch with the best stored reply.
    Branch { index: usize, code: u16 },
    /// Every branch is final but none holds a reply to relay.
    NoCandidate,
}

/// Chooses the branch whose stored reply should be relayed.
///
/// Blind branches never block. Branches whose reply was dropped or never
/// existed (send failure) are skipped. Ties go to the lowest branch index.
pub fn pick_branch(slots: &[BranchSlot], branches: &[Branch], faked_penalty: u32) -> Pick {
    let mut best: Option<(u32, usize, u16)> = None;
    for branch in branches {
        let slot = &slots[branch.index];
        if slot.has_flag(flags::BLIND) {
            continue;
        }
        let code = slot.last_received();
        if code < 200 {
            return Pick::Pending;
        }
        let Some(reply) = &branch.reply else {
            continue;
        };
        let prio = reply_priority(code, reply.is_faked(), faked_penalty);
        if best.map_or(true, |(p, _, _)| prio < p) {
            best = Some((prio, branch.index, code));
        }
    }
    match best {
        Some((_, index, code)) => Pick::Branch { index, code },
        None => Pick::NoCandidate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::branch::StoredReply;

    fn setup(codes: &[(u16, bool)]) -> (Vec<BranchSlot>, Vec<Branch>) {
        let slots: Vec<BranchSlot> = codes.iter().map(|_| BranchSlot::new()).collect();
        let branches = codes
            .iter()
            .enumerate()
            .map(|(i, (code, stored))| {
                slots[i].set_last_received(*code);
                let mut b = Branch::new(i, 0, None);
                b.reply = stored.then_some(StoredReply::Faked);
                b
            })
            .collect();
        (slots, branches)
    }

    #[test]
    fn test_priority_classes() {
        assert_eq!(reply_priority(200, false, 0), 0);
        assert_eq!(reply_priority(603, false, 0), 1003);
        assert_eq!(reply_priority(302, false, 0), 3002);
        assert_eq!(reply_priority(401, false, 0), 4001);
        assert_eq!(reply_priority(484, false, 0), 4084);
        assert_eq!(reply_priority(404, false, 0), 4104);
        assert_eq!(reply_priority(503, false, 0), 5003);
        assert_eq!(reply_priority(99, false, 0), 10099);
        assert_eq!(reply_priority(408, true, 50), 4158);
    }

    #[test]
    fn test_pending_blocks_selection() {
        let (slots, branches) = setup(&[(404, true), (180, false)]);
        assert_eq!(pick_branch(&slots, &branches, 0), Pick::Pending);
    }

    #[test]
    fn test_lowest_priority_wins_ties_to_lowest_index() {
        let (slots, branches) = setup(&[(486, true), (404, true), (486, true)]);
        assert_eq!(pick_branch(&slots, &branches, 0), Pick::Branch { index: 1, code: 404 });
        let (slots, branches) = setup(&[(480, true), (480, true)]);
        assert_eq!(pick_branch(&slots, &branches, 0), Pick::Branch { index: 0, code: 480 });
    }

    #[test]
    fn test_blind_and_replyless_branches_are_skipped() {
        let (slots, branches) = setup(&[(0, false), (408, false), (486, true)]);
        slots[0].set_flag(flags::BLIND);
        assert_eq!(pick_branch(&slots, &branches, 0), Pick::Branch { index: 2, code: 486 });
        let (slots, branches) = setup(&[(408, false)]);
        assert_eq!(pick_branch(&slots, &branches, 0), Pick::NoCandidate);
    }
}
