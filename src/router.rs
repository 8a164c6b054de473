use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::dns_message::with_transaction_id;
use crate::error::ForwarderError;

/// The requester of a query that is being answered.
///
/// Answering consumes the value, so every query is responded to at most once.
#[derive(Debug)]
pub struct PendingClient {
    addr: SocketAddr,
    transaction_id: u16,
}

impl PendingClient {
    pub fn new(addr: SocketAddr, transaction_id: u16) -> Self {
        Self {
            addr,
            transaction_id,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    /// Send `payload` back to the requester over the listening socket.
    /// A payload produced for another query (a cache hit, a shared relay)
    /// is re-stamped with this requester's transaction ID.
    pub async fn respond(self, socket: &UdpSocket, payload: &Bytes) -> Result<(), ForwarderError> {
        let response = with_transaction_id(payload, self.transaction_id);

        socket
            .send_to(&response, self.addr)
            .await
            .map_err(|source| ForwarderError::Respond {
                client: self.addr,
                source,
            })?;

        debug!(client = %self.addr, bytes = response.len(), "Response sent");
        Ok(())
    }
}
