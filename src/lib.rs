//! A user-space Network Block Device (NBD) server.
//!
//! The protocol layer (handshake negotiation, request dispatch, wire
//! encoding) is decoupled from storage: anything implementing
//! [`backend::Backend`] can be exported, from a plain file
//! ([`backend::FileBlocks`]) to an in-memory buffer
//! ([`backend::MemBlocks`]) to a kernel-attached device
//! ([`kernel`]/[`backend::Device`]).
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>
//! for the wire protocol this crate implements.

pub mod backend;
pub mod client;
pub mod concurrency;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod exports;
pub mod extents;
pub mod handshake;
pub mod kernel;
pub mod proto;
pub mod server;
pub mod threadlocal;
pub mod tls;

pub use client::Client;
pub use server::Server;
