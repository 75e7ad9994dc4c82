//! Values exchanged between the reply state machine and the cancel coordinator.

use std::fmt;

/// Per-branch cancel ownership. Moved forward with compare-and-swap only.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    NotNeeded = 0,
    InProgress = 1,
    Done = 2,
    /// Owned, but the CANCEL waits for the branch's first provisional.
    Deferred = 3,
}

impl CancelState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => CancelState::InProgress,
            2 => CancelState::Done,
            3 => CancelState::Deferred,
            _ => CancelState::NotNeeded,
        }
    }
}

/// Set of branch indices, bit `i` standing for branch `i`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchBitmap(pub u32);

impl BranchBitmap {
    pub fn empty() -> Self {
        Self(0)
    }

    /// Bitmap holding just `branch`; empty when the index does not fit.
    pub fn only(branch: usize) -> Self {
        let mut bm = Self::empty();
        bm.insert(branch);
        bm
    }

    pub fn contains(&self, branch: usize) -> bool {
        branch < 32 && self.0 & (1 << branch) != 0
    }

    pub fn insert(&mut self, branch: usize) {
        if branch < 32 {
            self.0 |= 1 << branch;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..32).filter(move |i| self.contains(*i))
    }
}

/// Content of the Reason header put on a hop-by-hop CANCEL (RFC 3326).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// Generated here, e.g. `SIP;cause=200;text="Call completed elsewhere"`.
    Local { cause: u16, text: String },
    /// Copied from the CANCEL received from upstream.
    Upstream(String),
}

impl CancelReason {
    pub fn completed_elsewhere() -> Self {
        CancelReason::Local { cause: 200, text: "Call completed elsewhere".to_string() }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Local { cause, text } => write!(f, "SIP;cause={};text=\"{}\"", cause, text),
            CancelReason::Upstream(raw) => f.write_str(raw),
        }
    }
}

/// Branches to cancel, computed right before a cancel pass and then dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelInfo {
    pub branches: BranchBitmap,
    pub reason: Option<CancelReason>,
}

impl CancelInfo {
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}

/// Branch selection for a script-triggered cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelWhich {
    All,
    Others(usize),
    This(usize),
}

/// How a branch without a provisional reply is handled by `cancel_branch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CancelFlags {
    /// Fake a 487 on the branch.
    pub fake_reply: bool,
    /// Send a CANCEL even though nothing was received.
    pub force_send: bool,
}
