//! A caching DNS forwarder.
//!
//! Queries arriving on a UDP socket are answered from an in-memory cache keyed
//! by query name, or relayed byte-for-byte to a single upstream resolver whose
//! reply is cached and returned to the requester.

pub mod cache;
pub mod config;
pub mod dns_header;
pub mod dns_message;
pub mod dns_question_and_answer;
pub mod error;
pub mod forwarder;
pub mod router;
pub mod server;

#[cfg(test)]
mod testing;

pub use cache::{CacheEntry, DnsCache};
pub use config::ServerConfig;
pub use error::{ForwarderError, ParseError};
pub use forwarder::UpstreamForwarder;
pub use server::DnsServer;
