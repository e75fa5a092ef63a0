use anyhow::Context;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::{Channel, Graph};

pub const GRAPH_FILE: &str = "graph.json";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

/// Keeps temp names distinct between saves of one process.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl GraphSnapshot {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse {}", path.display()))
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

impl Graph {
    pub fn snapshot(&self) -> GraphSnapshot {
        let state = self.read_state();
        let aliases = self.read_aliases();
        GraphSnapshot {
            channels: state.channels.values().cloned().collect(),
            aliases: aliases.clone(),
        }
    }

    /// Write the graph to `path` via a temp file; the previous file is kept as `.old`.
    /// Every writer uses its own temp file, so the daemon and a one-shot
    /// command may save concurrently.
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let start = Instant::now();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let snapshot = self.snapshot();
        let tmp = sibling(
            path,
            &format!(
                ".{}.{}.tmp",
                std::process::id(),
                TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
            ),
        );
        {
            let file = File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, &snapshot)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        // another writer may have rotated it already
        match fs::rename(path, sibling(path, ".old")) {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                let _ = fs::remove_file(&tmp);
                return Err(e).with_context(|| format!("Failed to rotate {}", path.display()));
            }
            _ => {}
        }
        fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;

        info!(
            "Graph: saved {} channels to {} in {:?}",
            snapshot.channels.len(),
            path.display(),
            start.elapsed()
        );
        Ok(())
    }

    fn read_snapshot(path: &Path) -> anyhow::Result<Graph> {
        let snapshot = GraphSnapshot::load(path)?;
        Ok(Graph::from_parts(snapshot.channels, snapshot.aliases))
    }

    /// Load `path`, falling back to `path.old`, then to an empty graph.
    pub fn load_from_file(path: &Path) -> Graph {
        let start = Instant::now();
        let old = sibling(path, ".old");
        for candidate in [path, old.as_path()] {
            match Self::read_snapshot(candidate) {
                Ok(graph) => {
                    info!(
                        "Graph: loaded {} channels from {} in {:?}",
                        graph.channel_count(),
                        candidate.display(),
                        start.elapsed()
                    );
                    return graph;
                }
                Err(e) => warn!("Graph: unable to load {}: {}", candidate.display(), e),
            }
        }
        info!("Graph: starting with an empty graph");
        Graph::new()
    }
}
