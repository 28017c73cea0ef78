use bytes::{BufMut, Bytes, BytesMut};
use strata_wire::{Identifier, TargetAddr};

use crate::TunnelError;

/// What a transport sends to open a tunnel to `target`.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub payload: Bytes,
    /// Whether `payload` already carries the caller's initial data.
    pub early_data_sent: bool,
}

/// The application protocol spoken over a freshly dialled carrier.
///
/// Transports only move bytes; the handshake decides what the first message
/// looks like and, when the protocol has one, how to check the reply.
pub trait Handshake: Send + Sync {
    fn request(&self, target: &TargetAddr, initial_data: &[u8]) -> Result<ConnectRequest, TunnelError>;

    /// Whether the server answers the request before data flows.
    fn expects_response(&self) -> bool {
        false
    }

    fn verify_response(&self, _response: &[u8]) -> Result<(), TunnelError> {
        Ok(())
    }

    fn name(&self) -> &str;
}

/// `identifier(16) ‖ target address ‖ early data`, with no reply.
#[derive(Debug, Clone)]
pub struct PreambleHandshake {
    id: Identifier,
    max_early_data: usize,
}

impl PreambleHandshake {
    pub const DEFAULT_MAX_EARLY_DATA: usize = 16 * 1024;

    pub fn new(id: Identifier) -> Self {
        Self {
            id,
            max_early_data: Self::DEFAULT_MAX_EARLY_DATA,
        }
    }

    /// Initial data longer than `limit` is sent as a separate first message.
    pub fn with_early_data_limit(mut self, limit: usize) -> Self {
        self.max_early_data = limit;
        self
    }

    pub fn id(&self) -> Identifier {
        self.id
    }
}

impl Handshake for PreambleHandshake {
    fn request(&self, target: &TargetAddr, initial_data: &[u8]) -> Result<ConnectRequest, TunnelError> {
        let early = !initial_data.is_empty() && initial_data.len() <= self.max_early_data;
        let mut buf = BytesMut::with_capacity(16 + target.encoded_len() + if early { initial_data.len() } else { 0 });
        buf.put_slice(self.id.as_bytes());
        target.encode_into(&mut buf);
        if early {
            buf.put_slice(initial_data);
        }
        Ok(ConnectRequest {
            payload: buf.freeze(),
            early_data_sent: early,
        })
    }

    fn name(&self) -> &str {
        "preamble"
    }
}
