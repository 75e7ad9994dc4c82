use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::message::{Method, SipRequest};

/// RFC 3261 magic cookie prefixing compliant branch parameters.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// Identifies the server side of a proxied transaction.
///
/// For RFC 3261 requests (branch starting with the magic cookie) the key is
/// the top Via `branch` + `sent-by` + method (section 17.2.3). Older clients
/// are matched on Call-ID, CSeq number, From-tag and method instead.
///
/// ACK is folded into INVITE so that an ACK for a negative final reply finds
/// the INVITE transaction. CANCEL keeps its own method; use
/// [`TransactionKey::with_method`] to look up the INVITE it cancels.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum TransactionKey {
    Rfc3261 {
        branch: String,
        sent_by: String,
        method: Method,
    },
    Legacy {
        call_id: String,
        cseq: u32,
        from_tag: String,
        method: Method,
    },
}

impl TransactionKey {
    pub fn from_request(request: &SipRequest) -> Self {
        let method = match request.method {
            Method::Ack => Method::Invite,
            ref m => m.clone(),
        };
        match &request.top_via.branch {
            Some(branch) if branch.starts_with(MAGIC_COOKIE) && branch.len() > MAGIC_COOKIE.len() => {
                TransactionKey::Rfc3261 {
                    branch: branch.clone(),
                    sent_by: request.top_via.sent_by.to_ascii_lowercase(),
                    method,
                }
            }
            _ => TransactionKey::Legacy {
                call_id: request.call_id.clone(),
                cseq: request.cseq,
                from_tag: request.from_tag.clone().unwrap_or_default(),
                method,
            },
        }
    }

    pub fn method(&self) -> &Method {
        match self {
            TransactionKey::Rfc3261 { method, .. } | TransactionKey::Legacy { method, .. } => method,
        }
    }

    /// The same key with another method.
    pub fn with_method(&self, method: Method) -> Self {
        let mut key = self.clone();
        match &mut key {
            TransactionKey::Rfc3261 { method: m, .. } | TransactionKey::Legacy { method: m, .. } => *m = method,
        }
        key
    }
}

impl fmt::Debug for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKey::Rfc3261 { branch, sent_by, method } => write!(f, "{}:{}:{}", branch, sent_by, method),
            TransactionKey::Legacy { call_id, cseq, from_tag, method } => {
                write!(f, "{}:{}:{}:{}", call_id, cseq, from_tag, method)
            }
        }
    }
}

/// Hash of the dialog-identifying fields of a request, embedded in every
/// branch id this proxy generates for it.
pub fn dialog_hash(request: &SipRequest) -> u32 {
    let mut hasher = DefaultHasher::new();
    request.call_id.hash(&mut hasher);
    request.cseq.hash(&mut hasher);
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

/// Decoded form of the Via branch id this proxy puts on outgoing requests:
/// `z9hG4bK<hash>.<label>.<branch>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchLabel {
    pub hash: u32,
    pub label: u64,
    pub branch: usize,
}

impl BranchLabel {
    pub fn new(hash: u32, label: u64, branch: usize) -> Self {
        Self { hash, label, branch }
    }

    pub fn encode(&self) -> String {
        format!("{}{:x}.{:x}.{}", MAGIC_COOKIE, self.hash, self.label, self.branch)
    }

    /// Parses a branch id. Ids not generated by [`BranchLabel::encode`] give `None`.
    pub fn parse(branch_id: &str) -> Option<Self> {
        let rest = branch_id.strip_prefix(MAGIC_COOKIE)?;
        let mut parts = rest.split('.');
        let hash = u32::from_str_radix(parts.next()?, 16).ok()?;
        let label = u64::from_str_radix(parts.next()?, 16).ok()?;
        let branch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { hash, label, branch })
    }
}

impl fmt::Display for BranchLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
