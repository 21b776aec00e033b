//! Adaptive multi-source download: round-robin source selection, EMA
//! latency tracking, dynamic buffer sizing, playback trigger.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::catalog::{self, FileRecord, CHUNK_SIZE};
use crate::registry::{PeerRecord, PeerRegistry};
use crate::transfer::TransferClient;

/// Chunks to pre-buffer before playback starts, before any adaptation.
pub const INITIAL_BUFFER_CHUNKS: u32 = 4;

/// Weight of the newest latency sample in the moving average.
const EMA_ALPHA: f64 = 0.2;

/// Average latency above this raises the buffer threshold.
const SLOW_LATENCY_MS: f64 = 500.0;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("no sources found for {0}")]
    NoSources(String),
}

/// Phase of a download as reported to the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    Starting,
    Downloading,
    Playing,
    Completed,
}

/// One progress report: file, current source label, free-text detail.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub file_name: String,
    pub source: String,
    pub detail: String,
    pub phase: DownloadPhase,
}

/// Receives progress events and log lines. Fire-and-forget; implementations
/// must not block.
pub trait DownloadObserver: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
    fn on_log(&self, line: &str) {
        let _ = line;
    }
}

/// Playback collaborator. Fire-and-forget; no return value is consumed.
pub trait Player: Send + Sync {
    fn play(&self, path: &Path);
    fn pause(&self);
    fn stop(&self);
}

/// Per-download adaptive state. Owned exclusively by the download task;
/// the source list is captured once at start and never re-queried.
pub struct DownloadSession {
    file: FileRecord,
    sources: Vec<PeerRecord>,
    total_chunks: u32,
    buffer_threshold: u32,
    ema_latency_ms: f64,
    loss_count: u32,
    sampled: bool,
}

impl DownloadSession {
    pub fn new(file: FileRecord, sources: Vec<PeerRecord>) -> Result<Self, DownloadError> {
        if sources.is_empty() {
            return Err(DownloadError::NoSources(file.name));
        }
        let total_chunks = file.total_chunks(CHUNK_SIZE);
        Ok(Self {
            file,
            sources,
            total_chunks,
            buffer_threshold: INITIAL_BUFFER_CHUNKS,
            ema_latency_ms: 0.0,
            loss_count: 0,
            sampled: false,
        })
    }

    pub fn file(&self) -> &FileRecord {
        &self.file
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn buffer_threshold(&self) -> u32 {
        self.buffer_threshold
    }

    pub fn ema_latency_ms(&self) -> f64 {
        self.ema_latency_ms
    }

    pub fn loss_count(&self) -> u32 {
        self.loss_count
    }

    /// Round-robin source for a chunk index.
    pub fn source_for(&self, index: u32) -> &PeerRecord {
        &self.sources[index as usize % self.sources.len()]
    }

    /// Fold a successful fetch into the latency average. The first sample
    /// seeds the average without blending. Sustained slowness (average
    /// above 500 ms) raises the buffer threshold by one, capped at the
    /// total chunk count.
    pub fn record_success(&mut self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        if self.sampled {
            self.ema_latency_ms = EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * self.ema_latency_ms;
        } else {
            self.ema_latency_ms = sample;
            self.sampled = true;
        }
        if self.ema_latency_ms > SLOW_LATENCY_MS {
            self.buffer_threshold = (self.buffer_threshold + 1).min(self.total_chunks);
        }
    }

    /// Count a lost chunk and raise the buffer threshold by two, capped at
    /// the total chunk count. Neither value ever decreases.
    pub fn record_loss(&mut self) {
        self.loss_count += 1;
        self.buffer_threshold = (self.buffer_threshold + 2).min(self.total_chunks);
    }

    /// Playback fires only when a successful chunk's index equals the
    /// buffer threshold exactly. A threshold the adaptive logic has raised
    /// past the current index means playback starts later, or not at all
    /// for this download.
    pub fn should_start_playback(&self, index: u32) -> bool {
        index == self.buffer_threshold
    }
}

/// Query every registered peer's catalog and keep the ones offering `hash`.
pub async fn find_sources(
    registry: &PeerRegistry,
    client: &TransferClient,
    hash: &str,
) -> Vec<PeerRecord> {
    let mut sources = Vec::new();
    for peer in registry.all() {
        let files = client.request_file_list(&peer).await;
        if files.iter().any(|f| f.hash == hash) {
            sources.push(peer);
        }
    }
    sources
}

/// Run one download to completion: fetch every chunk in strict index order,
/// spreading requests round-robin over `sources`, writing retrieved chunks
/// at their offsets in `dest`. Single-chunk failures are counted as loss
/// and skipped, never retried; only an empty source list aborts.
pub async fn run_download(
    client: TransferClient,
    file: FileRecord,
    sources: Vec<PeerRecord>,
    dest: PathBuf,
    observer: Arc<dyn DownloadObserver>,
    player: Option<Arc<dyn Player>>,
) -> Result<DownloadSession, DownloadError> {
    let mut session = DownloadSession::new(file, sources)?;
    let file_name = session.file().name.clone();
    let hash = session.file().hash.clone();
    let total = session.total_chunks();
    observer.on_log(&format!("Starting download: {file_name}"));
    observer.on_progress(ProgressEvent {
        file_name: file_name.clone(),
        source: "Finding Sources...".into(),
        detail: "0%".into(),
        phase: DownloadPhase::Starting,
    });

    for index in 0..total {
        let source = session.source_for(index).clone();
        let started = Instant::now();
        let data = client.request_chunk(&source, &hash, index).await;
        let elapsed = started.elapsed();

        match &data {
            Some(_) => {
                session.record_success(elapsed);
                if session.ema_latency_ms() > SLOW_LATENCY_MS {
                    info!(
                        latency_ms = session.ema_latency_ms() as u64,
                        buffer = session.buffer_threshold(),
                        "network slow, buffer raised"
                    );
                }
            }
            None => {
                session.record_loss();
                warn!(
                    index,
                    buffer = session.buffer_threshold(),
                    "chunk lost, buffer raised"
                );
            }
        }

        if let Some(data) = data {
            if let Err(e) = catalog::write_chunk(&dest, index, &data) {
                warn!(index, error = %e, "failed to write chunk");
                continue;
            }
            let percent = (index as u64 + 1) * 100 / total as u64;
            observer.on_progress(ProgressEvent {
                file_name: file_name.clone(),
                source: source.id.clone(),
                detail: format!("{percent}% (Chunk {index})"),
                phase: DownloadPhase::Downloading,
            });
            if let Some(player) = &player {
                if session.should_start_playback(index) {
                    player.play(&dest);
                    observer.on_log(&format!(">>> Starting Playback: {file_name}"));
                    observer.on_progress(ProgressEvent {
                        file_name: file_name.clone(),
                        source: "Local Player".into(),
                        detail: "Buffer Ready".into(),
                        phase: DownloadPhase::Playing,
                    });
                }
            }
        }
    }

    observer.on_log(&format!("Download Complete: {file_name}"));
    observer.on_progress(ProgressEvent {
        file_name,
        source: "All Sources".into(),
        detail: "100%".into(),
        phase: DownloadPhase::Completed,
    });
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn record(size: u64) -> FileRecord {
        FileRecord {
            name: "clip.mp4".into(),
            size,
            hash: "h".repeat(64),
        }
    }

    fn peers(ids: &[&str]) -> Vec<PeerRecord> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| PeerRecord::direct(*id, Ipv4Addr::new(10, 0, 0, i as u8 + 1), 6100))
            .collect()
    }

    fn session(chunks: u64, ids: &[&str]) -> DownloadSession {
        DownloadSession::new(record(chunks * CHUNK_SIZE as u64), peers(ids)).unwrap()
    }

    #[test]
    fn no_sources_aborts() {
        assert!(matches!(
            DownloadSession::new(record(1024), Vec::new()),
            Err(DownloadError::NoSources(_))
        ));
    }

    #[test]
    fn round_robin_over_three_sources() {
        let session = session(7, &["A", "B", "C"]);
        let visited: Vec<&str> = (0..7).map(|i| session.source_for(i).id.as_str()).collect();
        assert_eq!(visited, ["A", "B", "C", "A", "B", "C", "A"]);
    }

    #[test]
    fn ema_constant_sequence_stays_put() {
        let mut session = session(100, &["A"]);
        for _ in 0..3 {
            session.record_success(Duration::from_millis(100));
            assert!((session.ema_latency_ms() - 100.0).abs() < 1e-9);
        }
        assert_eq!(session.buffer_threshold(), INITIAL_BUFFER_CHUNKS);
    }

    #[test]
    fn ema_seeds_then_blends() {
        let mut session = session(100, &["A"]);
        session.record_success(Duration::from_millis(1000));
        assert!((session.ema_latency_ms() - 1000.0).abs() < 1e-9);
        // 1000 ms is slow: threshold moved up by one.
        assert_eq!(session.buffer_threshold(), INITIAL_BUFFER_CHUNKS + 1);

        session.record_success(Duration::from_millis(100));
        assert!((session.ema_latency_ms() - 280.0).abs() < 1e-9);
        // 280 ms is fine again: threshold unchanged.
        assert_eq!(session.buffer_threshold(), INITIAL_BUFFER_CHUNKS + 1);
    }

    #[test]
    fn loss_raises_threshold_by_two() {
        let mut session = session(100, &["A"]);
        session.record_loss();
        assert_eq!(session.loss_count(), 1);
        assert_eq!(session.buffer_threshold(), INITIAL_BUFFER_CHUNKS + 2);
        session.record_loss();
        assert_eq!(session.loss_count(), 2);
        assert_eq!(session.buffer_threshold(), INITIAL_BUFFER_CHUNKS + 4);
    }

    #[test]
    fn threshold_capped_at_total_chunks() {
        let mut session = session(5, &["A"]);
        for _ in 0..10 {
            session.record_loss();
        }
        assert_eq!(session.buffer_threshold(), 5);
        assert_eq!(session.loss_count(), 10);
    }

    #[test]
    fn playback_trigger_exact_equality() {
        let session = session(100, &["A"]);
        assert!(!session.should_start_playback(3));
        assert!(session.should_start_playback(INITIAL_BUFFER_CHUNKS));
        assert!(!session.should_start_playback(INITIAL_BUFFER_CHUNKS + 1));
    }

    #[test]
    fn playback_skipped_when_threshold_raised_past_index() {
        let mut session = session(100, &["A"]);
        // Threshold jumps from 4 to 6 while chunk 4 was in flight; the
        // exact-equality check at 5 no longer matches.
        session.record_loss();
        assert!(!session.should_start_playback(5));
        assert!(session.should_start_playback(6));
    }

    #[test]
    fn total_chunks_from_file_size() {
        let session = DownloadSession::new(record(600 * 1024), peers(&["A"])).unwrap();
        assert_eq!(session.total_chunks(), 3);
    }
}
