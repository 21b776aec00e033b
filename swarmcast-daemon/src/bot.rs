//! Autonomous bot: sleep, search a random keyword, download a random hit.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use swarmcast_core::catalog::FileCatalog;
use swarmcast_core::download::{find_sources, run_download, DownloadObserver};
use swarmcast_core::registry::PeerRegistry;
use swarmcast_core::search::search_files;
use swarmcast_core::transfer::TransferClient;
use tracing::{info, warn};

const KEYWORDS: &[&str] = &["aaaaaa", "Lights Off", "Rick-Roll", "Sax Gandalf"];

pub async fn run_bot(
    catalog: Arc<FileCatalog>,
    registry: Arc<PeerRegistry>,
    client: TransferClient,
    buffer_dir: std::path::PathBuf,
    observer: Arc<dyn DownloadObserver>,
) {
    info!("bot mode activated, searching and downloading autonomously");
    loop {
        let (sleep_secs, query) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(10..30u64),
                KEYWORDS[rng.gen_range(0..KEYWORDS.len())],
            )
        };
        info!(seconds = sleep_secs, "bot sleeping");
        tokio::time::sleep(Duration::from_secs(sleep_secs)).await;

        info!(query, "bot searching");
        let results = search_files(&catalog, &registry, &client, query, "").await;
        if results.is_empty() {
            info!("bot found no results");
            continue;
        }
        info!(count = results.len(), "bot found files");
        let target = {
            let mut rng = rand::thread_rng();
            results[rng.gen_range(0..results.len())].clone()
        };

        info!(file = %target.name, "bot downloading");
        let sources = find_sources(&registry, &client, &target.hash).await;
        let dest = buffer_dir.join(&target.name);
        match run_download(client.clone(), target, sources, dest, observer.clone(), None).await {
            Ok(session) => info!(loss = session.loss_count(), "bot download finished"),
            Err(e) => warn!(error = %e, "bot download failed"),
        }
    }
}
