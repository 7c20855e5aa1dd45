//! Async Rust client for FastDFS tracker and storage servers.
//!
//! Resolves a file ID to a storage node, queries file metadata, and streams
//! downloads, amortizing connection setup through per-endpoint connection
//! pools.
//!
//! # Features
//!
//! - File metadata resolution, decoded locally from the remote name when
//!   possible, queried from the server otherwise
//! - Storage-location resolution through the tracker
//! - Streaming downloads, pull-mode ([`Download`]) or push-mode into any
//!   `AsyncWrite` sink
//! - Bounded connection pools with idle eviction, liveness probing, and a
//!   dial circuit breaker
//! - Async/await support with Tokio
//!
//! # Example
//!
//! ```no_run
//! use fdfs::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(ClientConfig::new("192.168.1.100:22122"))?;
//!
//!     let file_id = "group1/M00/02/44/wKgBaF8Q2xSAF6nWAAAYvPXVYTk902.jpg";
//!     let info = client.get_file_info(file_id).await?;
//!     println!("{} bytes, crc32 {:08x}", info.file_size, info.crc32);
//!
//!     let mut out = Vec::new();
//!     client.download_to(file_id, 0, 0, &mut out).await?;
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod base64;
pub mod client;
pub mod connection;
pub mod errors;
pub mod protocol;
pub mod reader;
pub mod storage;
pub mod types;

// Re-export public API
pub use client::Client;
pub use connection::{default_dialer, Conn, ConnPool, DialFuture, Dialer, PoolOptions, Stats};
pub use errors::{FdfsError, Result};
pub use storage::Download;
pub use types::{ClientConfig, FileInfo, StorageCommand, StorageServer, TrackerCommand};
