//! Synthetic messages and an in-process upstream resolver for the crate's tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::oneshot;

use crate::dns_header::DnsHeader;
use crate::dns_question_and_answer::encode_domain_name;

pub fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let header = DnsHeader {
        id,
        flags: 0x0100,
        question_count: 1,
        answer_count: 0,
        authority_count: 0,
        additional_count: 0,
    };

    let mut query = header.to_bytes().to_vec();
    query.extend(encode_domain_name(name));
    query.extend_from_slice(&qtype.to_be_bytes());
    query.extend_from_slice(&1u16.to_be_bytes());
    query
}

/// Answer `query` with one A record per TTL, each pointing back at the question name.
pub fn build_response(query: &[u8], ttls: &[u32]) -> Vec<u8> {
    let mut response = Vec::with_capacity(query.len() + ttls.len() * 16);

    response.extend_from_slice(&query[0..2]);
    response.extend_from_slice(&[0x81, 0x80]);
    response.extend_from_slice(&query[4..6]);
    response.extend_from_slice(&(ttls.len() as u16).to_be_bytes());
    response.extend_from_slice(&[0, 0, 0, 0]);
    response.extend_from_slice(&query[12..]);

    for ttl in ttls {
        response.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01]);
        response.extend_from_slice(&ttl.to_be_bytes());
        response.extend_from_slice(&[0x00, 0x04, 93, 184, 216, 34]);
    }

    response
}

#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Reply with one A record per TTL.
    Answer(Vec<u32>),
    /// Read queries and never reply.
    Silent,
    /// Send a reply from a foreign port and one with the wrong ID before the real answer.
    SpoofThenAnswer(Vec<u32>),
}

/// TTL carried by every spoofed reply, distinct from anything the tests expect.
pub const SPOOFED_TTL: u32 = 1;

pub struct MockUpstream {
    addr: SocketAddr,
    queries: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockUpstream {
    pub async fn start(behavior: MockBehavior) -> Self {
        Self::start_with_delay(behavior, Duration::ZERO).await
    }

    pub async fn start_with_delay(behavior: MockBehavior, delay: Duration) -> Self {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let queries = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let counter = Arc::clone(&queries);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = socket.recv_from(&mut buf) => {
                        let Ok((len, peer)) = result else { continue };
                        counter.fetch_add(1, Ordering::SeqCst);

                        let query = buf[..len].to_vec();
                        let socket = Arc::clone(&socket);
                        let behavior = behavior.clone();
                        tokio::spawn(async move {
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            Self::reply(&socket, &query, peer, &behavior).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            queries,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    async fn reply(socket: &UdpSocket, query: &[u8], peer: SocketAddr, behavior: &MockBehavior) {
        match behavior {
            MockBehavior::Silent => {}
            MockBehavior::Answer(ttls) => {
                let _ = socket.send_to(&build_response(query, ttls), peer).await;
            }
            MockBehavior::SpoofThenAnswer(ttls) => {
                let spoofed = build_response(query, &[SPOOFED_TTL]);

                let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
                let _ = stranger.send_to(&spoofed, peer).await;

                let mut wrong_id = spoofed;
                wrong_id[0] ^= 0xFF;
                let _ = socket.send_to(&wrong_id, peer).await;

                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = socket.send_to(&build_response(query, ttls), peer).await;
            }
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
