//! Catalog search across the local index and every known peer, with
//! hash-level deduplication and a glob exclusion filter.

use std::collections::HashSet;

use crate::catalog::{FileCatalog, FileRecord};
use crate::registry::PeerRegistry;
use crate::transfer::TransferClient;

/// Search local and remote catalogs for file names containing `query`
/// (case-insensitive). Results are deduplicated by content hash keeping the
/// first occurrence, so a locally held copy takes precedence over remote
/// copies of the same bytes. `exclusion` is a semicolon-separated list of
/// glob patterns (`*`, `?`) whose matches are filtered out; empty means no
/// filter.
pub async fn search_files(
    catalog: &FileCatalog,
    registry: &PeerRegistry,
    client: &TransferClient,
    query: &str,
    exclusion: &str,
) -> Vec<FileRecord> {
    let query = query.to_lowercase();
    let mut seen: HashSet<String> = HashSet::new();
    let mut results = Vec::new();

    let mut consider = |file: FileRecord, seen: &mut HashSet<String>, out: &mut Vec<FileRecord>| {
        if !file.name.to_lowercase().contains(&query) {
            return;
        }
        if matches_exclusion(&file.name, exclusion) {
            return;
        }
        if seen.insert(file.hash.clone()) {
            out.push(file);
        }
    };

    for file in catalog.list() {
        consider(file, &mut seen, &mut results);
    }
    for peer in registry.all() {
        for file in client.request_file_list(&peer).await {
            consider(file, &mut seen, &mut results);
        }
    }
    results
}

/// True when the name matches any pattern in the semicolon-separated list.
fn matches_exclusion(name: &str, patterns: &str) -> bool {
    patterns
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .any(|p| glob_match(p, name))
}

/// Case-insensitive glob match supporting `*` (any run) and `?` (any one
/// character).
fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.to_lowercase().chars().collect();
    let n: Vec<char> = name.to_lowercase().chars().collect();
    // Iterative matcher with single-star backtracking.
    let (mut pi, mut ni) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
