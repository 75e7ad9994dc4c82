use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;

use crate::error::ResolveError;
use crate::message::{Destination, Protocol};

/// Options passed to [`Resolver::resolve`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveFlags {
    /// Only the first candidate is wanted; the cursor is returned exhausted after it.
    pub no_failover: bool,
    /// Prefer IPv6 addresses when both families are available.
    pub prefer_ipv6: bool,
}

/// Iteration state over the candidate addresses of one name.
///
/// A branch keeps its cursor so that failover can continue where the previous
/// attempt left off.
#[derive(Debug, Clone, Default)]
pub struct ResolverCursor {
    name: String,
    candidates: VecDeque<Destination>,
    handed_out: usize,
}

impl ResolverCursor {
    pub fn new(name: impl Into<String>, candidates: impl IntoIterator<Item = Destination>) -> Self {
        Self {
            name: name.into(),
            candidates: candidates.into_iter().collect(),
            handed_out: 0,
        }
    }

    /// A cursor over one fixed destination, used when no lookup was needed.
    pub fn single(destination: Destination) -> Self {
        Self::new(destination.to_string(), [destination])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn next_candidate(&mut self) -> Option<Destination> {
        let next = self.candidates.pop_front()?;
        self.handed_out += 1;
        Some(next)
    }

    pub fn has_more(&self) -> bool {
        !self.candidates.is_empty()
    }

    /// Number of candidates already returned.
    pub fn handed_out(&self) -> usize {
        self.handed_out
    }
}

/// Name resolution (NAPTR/SRV/A/AAAA), including its cache.
#[async_trait]
pub trait Resolver: Send + Sync + fmt::Debug {
    /// Looks up `name` and returns a cursor over its candidates, best first.
    async fn resolve(
        &self,
        name: &str,
        protocol: Option<Protocol>,
        flags: ResolveFlags,
    ) -> Result<ResolverCursor, ResolveError>;

    /// Next candidate of `cursor`. Called with the reply lock held, so it must not block.
    fn next(&self, cursor: &mut ResolverCursor) -> Option<Destination> {
        cursor.next_candidate()
    }
}
