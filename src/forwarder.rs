use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::dns_header::DnsHeader;
use crate::dns_message::transaction_id;
use crate::error::{ForwarderError, ParseError};

/// TC bit within the third header byte.
const TC_FLAG: u8 = 0x02;

/// Relays raw queries to the single upstream resolver.
#[derive(Debug, Clone)]
pub struct UpstreamForwarder {
    upstream: SocketAddr,
    timeout: Duration,
    buffer_size: usize,
}

impl UpstreamForwarder {
    pub fn new(upstream: SocketAddr, timeout: Duration, buffer_size: usize) -> Self {
        Self {
            upstream,
            timeout,
            buffer_size,
        }
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    /// Send `query` unmodified to the upstream and wait for its answer.
    ///
    /// Every query gets its own ephemeral socket. Only a response datagram from
    /// the upstream's exact address that echoes the query's transaction ID is
    /// accepted; anything else arriving on the socket is ignored. The whole
    /// exchange is bounded by the configured timeout.
    pub async fn forward(&self, query: &[u8]) -> Result<Bytes, ForwarderError> {
        let expected_id =
            transaction_id(query).ok_or(ParseError::TooShortForHeader(query.len()))?;

        let bind_addr: SocketAddr = if self.upstream.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| self.forward_error(source))?;

        let exchange = async {
            let bytes_sent = socket
                .send_to(query, self.upstream)
                .await
                .map_err(|source| self.forward_error(source))?;

            debug!(upstream = %self.upstream, bytes_sent, id = expected_id, "Forwarded query");

            self.await_reply(&socket, expected_id).await
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ForwarderError::UpstreamTimeout {
                upstream: self.upstream,
                timeout: self.timeout,
            }),
        }
    }

    async fn await_reply(&self, socket: &UdpSocket, expected_id: u16) -> Result<Bytes, ForwarderError> {
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            let (len, from) = socket
                .recv_from(&mut buf)
                .await
                .map_err(|source| self.forward_error(source))?;

            if from != self.upstream {
                warn!(
                    expected = %self.upstream,
                    received_from = %from,
                    "Ignoring datagram from unexpected source"
                );
                continue;
            }

            let reply = &buf[..len];
            match DnsHeader::from_bytes(reply) {
                Ok(header) if header.is_response() && header.id == expected_id => {
                    let flags = header.flags();
                    if flags.tc {
                        debug!(upstream = %self.upstream, "Upstream reply is truncated");
                    }
                    debug!(
                        upstream = %self.upstream,
                        bytes_received = len,
                        rcode = flags.rcode,
                        "Upstream replied"
                    );
                    if len == self.buffer_size {
                        warn!(
                            upstream = %self.upstream,
                            buffer_size = self.buffer_size,
                            "Upstream reply filled the receive buffer and may be truncated"
                        );
                        return Ok(mark_truncated(reply));
                    }
                    return Ok(Bytes::copy_from_slice(reply));
                }
                Ok(header) => {
                    warn!(
                        expected_id,
                        received_id = header.id,
                        is_response = header.is_response(),
                        "Ignoring upstream datagram that does not answer this query"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed upstream datagram");
                }
            }
        }
    }

    fn forward_error(&self, source: std::io::Error) -> ForwarderError {
        ForwarderError::Forward {
            upstream: self.upstream,
            source,
        }
    }
}

/// Copy of `reply` with the TC flag raised, so the client retries over TCP.
fn mark_truncated(reply: &[u8]) -> Bytes {
    let mut marked = BytesMut::from(reply);
    marked[2] |= TC_FLAG;
    marked.freeze()
}
