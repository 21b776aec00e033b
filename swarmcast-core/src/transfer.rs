//! Transfer service: TCP catalog/chunk server, relay bridging, and the
//! client-side request calls used by downloads and search.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::catalog::{FileCatalog, FileRecord, CHUNK_SIZE};
use crate::registry::{PeerRecord, PeerRegistry};
use crate::wire::{
    read_utf, write_utf, CMD_GET_CHUNK, CMD_GET_FILE_LIST, CMD_RELAY_REQUEST, STATUS_FAIL,
    STATUS_OK,
};

/// Connect and relay-handshake timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a remote catalog listing; larger counts are treated as
/// a malformed response.
const MAX_CATALOG_ENTRIES: u32 = 65_536;

/// Command ports are advertised via discovery, chosen from this range at
/// startup.
pub const COMMAND_PORT_RANGE: RangeInclusive<u16> = 6000..=6999;

/// Bind a TCP listener on some free port in `range`, trying random ports
/// first and then a sequential sweep.
pub async fn bind_in_range(range: RangeInclusive<u16>) -> io::Result<(TcpListener, u16)> {
    // Draw the candidates up front; ThreadRng must not live across awaits.
    let candidates: Vec<u16> = {
        let mut rng = rand::thread_rng();
        (0..16).map(|_| rng.gen_range(range.clone())).collect()
    };
    for port in candidates {
        if let Ok(listener) = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            return Ok((listener, port));
        }
    }
    for port in range {
        if let Ok(listener) = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            return Ok((listener, port));
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "no free command port in range",
    ))
}

/// TCP server answering catalog, chunk, and relay requests. One worker task
/// per accepted connection; each connection carries exactly one command.
pub struct TransferService {
    catalog: Arc<FileCatalog>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransferService {
    pub fn new(catalog: Arc<FileCatalog>) -> Self {
        Self {
            catalog,
            task: Mutex::new(None),
        }
    }

    /// Start accepting on `listener`. A second call while listening is a
    /// no-op.
    pub async fn start(&self, listener: TcpListener) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "transfer server listening");
        }
        let catalog = self.catalog.clone();
        *task = Some(tokio::spawn(accept_loop(listener, catalog)));
    }

    /// Stop accepting and drop the listener. Connections already being
    /// served run to completion.
    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, catalog: Arc<FileCatalog>) {
    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                let catalog = catalog.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_conn(stream, &catalog).await {
                        debug!(from = %from, error = %e, "connection ended");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        }
    }
}

async fn handle_conn(mut stream: TcpStream, catalog: &FileCatalog) -> io::Result<()> {
    let command = stream.read_u8().await?;
    match command {
        CMD_GET_FILE_LIST => send_file_list(&mut stream, catalog).await,
        CMD_GET_CHUNK => send_chunk(&mut stream, catalog).await,
        CMD_RELAY_REQUEST => run_relay(stream).await,
        // Unknown command: close without responding.
        _ => Ok(()),
    }
}

async fn send_file_list(stream: &mut TcpStream, catalog: &FileCatalog) -> io::Result<()> {
    let files = catalog.list();
    stream.write_u32(files.len() as u32).await?;
    for file in &files {
        write_utf(stream, &file.name).await?;
        stream.write_u64(file.size).await?;
        write_utf(stream, &file.hash).await?;
    }
    stream.flush().await
}

async fn send_chunk(stream: &mut TcpStream, catalog: &FileCatalog) -> io::Result<()> {
    let hash = read_utf(stream).await?;
    let index = stream.read_u32().await?;
    // Unknown hash and out-of-range index both answer with length zero.
    let data = catalog.read_chunk(&hash, index).unwrap_or_default();
    stream.write_u32(data.len() as u32).await?;
    if !data.is_empty() {
        stream.write_all(&data).await?;
    }
    stream.flush().await
}

/// Answer a relay request: connect to the requested target, report the
/// outcome with a status byte, then pipe bytes both ways until either side
/// closes. The client then speaks the ordinary protocol through the bridge.
async fn run_relay(mut client: TcpStream) -> io::Result<()> {
    let mut ip = [0u8; 4];
    client.read_exact(&mut ip).await?;
    let port = client.read_u32().await?;
    let target_addr = match u16::try_from(port) {
        Ok(p) => SocketAddr::from((Ipv4Addr::from(ip), p)),
        Err(_) => {
            client.write_u8(STATUS_FAIL).await?;
            return Ok(());
        }
    };
    let mut target = match timeout(CONNECT_TIMEOUT, TcpStream::connect(target_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(target = %target_addr, error = %e, "relay target unreachable");
            client.write_u8(STATUS_FAIL).await?;
            return Ok(());
        }
        Err(_) => {
            debug!(target = %target_addr, "relay connect timed out");
            client.write_u8(STATUS_FAIL).await?;
            return Ok(());
        }
    };
    client.write_u8(STATUS_OK).await?;
    client.flush().await?;
    let _ = tokio::io::copy_bidirectional(&mut client, &mut target).await;
    Ok(())
}

/// Client side of the transfer protocol. One fresh connection per logical
/// call; transient failures are absorbed into empty results and logged,
/// never surfaced as errors.
#[derive(Clone)]
pub struct TransferClient {
    registry: Arc<PeerRegistry>,
}

impl TransferClient {
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self { registry }
    }

    /// Fetch a peer's catalog. Any I/O failure yields an empty list.
    pub async fn request_file_list(&self, peer: &PeerRecord) -> Vec<FileRecord> {
        match self.try_request_file_list(peer).await {
            Ok(files) => files,
            Err(e) => {
                warn!(peer = %peer, error = %e, "file list request failed");
                Vec::new()
            }
        }
    }

    /// Fetch one chunk. A failed or zero-length response is `None`.
    pub async fn request_chunk(&self, peer: &PeerRecord, hash: &str, index: u32) -> Option<Vec<u8>> {
        match self.try_request_chunk(peer, hash, index).await {
            Ok(data) if !data.is_empty() => Some(data),
            Ok(_) => None,
            Err(e) => {
                debug!(peer = %peer, index, error = %e, "chunk request failed");
                None
            }
        }
    }

    async fn try_request_file_list(&self, peer: &PeerRecord) -> io::Result<Vec<FileRecord>> {
        let mut stream = self.open_stream(peer).await?;
        stream.write_u8(CMD_GET_FILE_LIST).await?;
        stream.flush().await?;
        let count = stream.read_u32().await?;
        if count > MAX_CATALOG_ENTRIES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "catalog listing too large",
            ));
        }
        let mut files = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = read_utf(&mut stream).await?;
            let size = stream.read_u64().await?;
            let hash = read_utf(&mut stream).await?;
            files.push(FileRecord { name, size, hash });
        }
        Ok(files)
    }

    async fn try_request_chunk(
        &self,
        peer: &PeerRecord,
        hash: &str,
        index: u32,
    ) -> io::Result<Vec<u8>> {
        let mut stream = self.open_stream(peer).await?;
        stream.write_u8(CMD_GET_CHUNK).await?;
        write_utf(&mut stream, hash).await?;
        stream.write_u32(index).await?;
        stream.flush().await?;
        let len = stream.read_u32().await? as usize;
        if len > CHUNK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk exceeds chunk size",
            ));
        }
        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await?;
        Ok(data)
    }

    /// Open a connection to `peer`: direct when possible, otherwise via the
    /// relay handshake through the intermediary recorded by discovery.
    async fn open_stream(&self, peer: &PeerRecord) -> io::Result<TcpStream> {
        let Some(relay_ip) = peer.relay else {
            return connect(peer.command_addr()).await;
        };
        let relay = self.registry.get_by_address(relay_ip).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("relay {relay_ip} not in registry"),
            )
        })?;
        let mut stream = connect(relay.command_addr()).await?;
        stream.write_u8(CMD_RELAY_REQUEST).await?;
        stream.write_all(&peer.address.octets()).await?;
        stream.write_u32(peer.command_port as u32).await?;
        stream.flush().await?;
        let status = timeout(CONNECT_TIMEOUT, stream.read_u8())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "relay handshake timed out"))??;
        if status != STATUS_OK {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("relay {} cannot reach {}", relay, peer.command_addr()),
            ));
        }
        Ok(stream)
    }
}

async fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
}
