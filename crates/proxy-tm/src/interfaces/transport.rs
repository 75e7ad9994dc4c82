use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

use crate::error::TransportError;
use crate::message::{Destination, LocalSocket};

/// Raw send side of the SIP transport layer.
///
/// `send` is awaited with no transaction lock held.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Sends an already serialized message.
    async fn send(&self, destination: &Destination, data: Bytes) -> Result<(), TransportError>;

    /// Local socket to use towards `destination`, `None` if no listener matches
    /// its address family and protocol.
    fn local_socket_for(&self, destination: &Destination) -> Option<LocalSocket>;
}
