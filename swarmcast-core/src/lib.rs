//! Swarmcast engine: serverless LAN discovery, content-addressed catalogs,
//! and adaptive multi-source chunk streaming between peers.
//!
//! Everything is explicitly constructed and passed; there are no process
//! globals, so tests run independent instances side by side.

pub mod catalog;
pub mod discovery;
pub mod download;
pub mod registry;
pub mod search;
pub mod transfer;
pub mod wire;

pub use catalog::{FileCatalog, FileRecord, CHUNK_SIZE};
pub use discovery::{DiscoveryService, DISCOVERY_PORT};
pub use download::{
    run_download, DownloadError, DownloadObserver, DownloadPhase, Player, ProgressEvent,
};
pub use registry::{generate_peer_id, PeerRecord, PeerRegistry};
pub use transfer::{bind_in_range, TransferClient, TransferService, COMMAND_PORT_RANGE};
pub use wire::DiscoveryPacket;
