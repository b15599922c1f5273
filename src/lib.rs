//! # tlite - a mutual-TLS key-value store
//!
//! Clients connect over TLS with a client certificate and send
//! newline-delimited JSON commands against named key/value tables. All
//! traffic is served from an in-memory SQLite working copy; durability comes
//! from periodic and on-demand snapshots of that working copy.
//!
//! ## Architecture Overview
//!
//! ```text
//!  TLS session ──► protocol (decode) ──► Scheduler ──► Engine ──► RecordStore (SQLite :memory:)
//!       ▲                                   │            │
//!       └──────── protocol (encode) ◄───────┘            ├──► CursorManager (per connection)
//!                                                        └──► Persistence ──► snapshot file
//! ```
//!
//! - **Server** (`server` module): TLS listener, per-connection line framing
//! - **Protocol** (`protocol` module): request decoding, command vocabulary, responses
//! - **Engine** (`engine` module): scheduler, record store, cursors, snapshots
//!
//! ## Concurrency
//!
//! A single [`engine::Scheduler`] dispatches commands from every connection in
//! arrival order. Write commands run alone; reads run alone too by default,
//! or share the gate under [`config::AdmissionPolicy::ConcurrentReads`].
//!
//! ## Privileged passthrough
//!
//! The `sql` command executes its statement verbatim against the whole
//! working copy. Any client holding a certificate signed by the configured
//! CA therefore has full administrative access to every table. A statement
//! that drops the active table moves the active pointer back to `store`.
//!
//! ## Usage Example
//!
//! ```bash
//! # Start the server with a 5 minute snapshot interval
//! cargo run -- --ca ca.crt -c server.crt -k server.key --interval 5m --dump-file ./data.sqlite
//!
//! # Talk to it with any TLS client holding a client certificate
//! openssl s_client -quiet -connect 127.0.0.1:9999 -cert client.crt -key client.key -CAfile ca.crt
//! {"cmd":"set","args":{"k":"greeting","v":"hello"}}
//! {"cmd":"get","args":{"k":"greeting"}}
//! ```

/// Runtime configuration and interval parsing
pub mod config;

/// Command scheduler, record store, cursors and snapshot persistence
pub mod engine;

/// Error taxonomy shared by every command
pub mod error;

/// Wire format: requests, commands and responses
pub mod protocol;

/// TLS listener and client session handling
pub mod server;
