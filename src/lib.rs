//! treesync library
//!
//! Keeps one directory tree mirrored across a server and any number of
//! clients over a framed TCP protocol. Whole files move, verified by BLAKE3
//! hash and written atomically.

pub mod cache;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod logger;
pub mod protocol;
pub mod protocol_core;
pub mod registry;
pub mod server;
pub mod transfer;
pub mod watch;

pub use client::{Client, ClientState};
pub use codec::Message;
pub use registry::{diff, scan, Diff, FileRecord, ModTime, Registry};
pub use server::{serve, Server};
