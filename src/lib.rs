//! RPC Gate
//!
//! An API-key gated relay for Ethereum JSON-RPC nodes. A single endpoint path
//! accepts both plain HTTP calls, which are reverse-proxied to the node's HTTP
//! RPC, and WebSocket upgrades, which are relayed message-for-message to the
//! node's WebSocket RPC. Every request must carry a key from the key file in
//! its `auth` query parameter.

pub mod auth;
pub mod config;
pub mod dialer;
pub mod error;
pub mod http_relay;
pub mod keys;
pub mod response;
pub mod router;
pub mod security;
pub mod server;
pub mod session;

// Re-export commonly used types and functions
pub use auth::authorize;
pub use config::{
    Config, DEFAULT_CONFIG_FILE, KeysConfig, ListenConfig, UpstreamConfig, load_config,
    load_config_from,
};
pub use error::GateError;
pub use keys::{KeyStore, KeyStoreError, list_keys};
pub use router::{GateState, handle_request};
pub use security::{Admission, parse_original_client_ip};
pub use server::{handle_connection, serve};
pub use session::{Session, Teardown, is_websocket_upgrade};
