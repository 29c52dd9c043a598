//! Recorded-session replay
//!
//! `ReplaySession` is an in-process `ArSession` that hands out sequential
//! anchor ids and records lifecycle calls; `load_trace` reads recorded
//! frames (one JSON `ArFrame` per line) and `load_catalog` reads the poster
//! catalog used by the replay harness.

use crate::error::{Error, Result};
use crate::model::{Dialogue, PosterId, ReferencePoster};
use crate::tracking::session::{AnchorId, ArFrame, ArSession, Pose};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Default)]
struct ReplayState {
    registered: Vec<PosterId>,
    next_anchor: u64,
    created: u64,
    live: HashSet<AnchorId>,
    paused: bool,
    torn_down: bool,
}

/// In-process AR session; clones share state
#[derive(Debug, Clone, Default)]
pub struct ReplaySession {
    state: Arc<Mutex<ReplayState>>,
}

impl ReplaySession {
    fn with_state<T>(&self, f: impl FnOnce(&mut ReplayState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Total anchors ever created
    pub fn anchors_created(&self) -> u64 {
        self.with_state(|s| s.created)
    }

    /// Anchors created and not yet released
    pub fn live_anchors(&self) -> usize {
        self.with_state(|s| s.live.len())
    }

    pub fn registered(&self) -> Vec<PosterId> {
        self.with_state(|s| s.registered.clone())
    }

    pub fn is_paused(&self) -> bool {
        self.with_state(|s| s.paused)
    }

    pub fn is_torn_down(&self) -> bool {
        self.with_state(|s| s.torn_down)
    }
}

impl ArSession for ReplaySession {
    fn register_reference_images(&mut self, posters: &[ReferencePoster]) -> Result<()> {
        self.with_state(|s| {
            if s.torn_down {
                return Err(Error::InvalidState("session torn down".to_string()));
            }
            s.registered = posters.iter().map(|p| p.id.clone()).collect();
            Ok(())
        })
    }

    fn create_anchor(&mut self, poster_id: &PosterId, _pose: &Pose) -> Result<AnchorId> {
        self.with_state(|s| {
            if s.torn_down || s.paused {
                return Err(Error::InvalidState(
                    "session not running".to_string(),
                ));
            }
            s.next_anchor += 1;
            s.created += 1;
            let id = AnchorId(s.next_anchor);
            s.live.insert(id);
            debug!(anchor = %id, poster_id = %poster_id, "Replay anchor created");
            Ok(id)
        })
    }

    fn release_anchor(&mut self, anchor: AnchorId) {
        self.with_state(|s| {
            s.live.remove(&anchor);
        });
    }

    fn pause(&mut self) {
        self.with_state(|s| s.paused = true);
    }

    fn resume(&mut self) -> Result<()> {
        self.with_state(|s| {
            if s.torn_down {
                return Err(Error::InvalidState("session torn down".to_string()));
            }
            s.paused = false;
            Ok(())
        })
    }

    fn teardown(&mut self) {
        self.with_state(|s| {
            s.live.clear();
            s.torn_down = true;
        });
    }
}

/// Read a recorded trace: one JSON `ArFrame` per line, blank lines ignored
pub fn load_trace(path: &Path) -> Result<Vec<ArFrame>> {
    let text = std::fs::read_to_string(path)?;
    parse_trace(&text)
}

/// Parse trace text (JSON lines)
pub fn parse_trace(text: &str) -> Result<Vec<ArFrame>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<ArFrame>(line)
                .map_err(|e| Error::Config(format!("trace line {}: {}", idx + 1, e)))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    posters: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    id: String,
    image: PathBuf,
    physical_width_m: f32,
    has_human_face: bool,
    text: Option<String>,
    voice_id: Option<String>,
}

/// Loaded replay catalog: reference posters plus their dialogue
#[derive(Debug, Clone)]
pub struct ReplayCatalog {
    pub posters: Vec<ReferencePoster>,
    pub dialogue: HashMap<PosterId, Dialogue>,
}

/// Read a JSON catalog; image paths are relative to the catalog file
pub fn load_catalog(path: &Path) -> Result<ReplayCatalog> {
    let text = std::fs::read_to_string(path)?;
    let file: CatalogFile = serde_json::from_str(&text)
        .map_err(|e| Error::Config(format!("catalog {}: {}", path.display(), e)))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let mut posters = Vec::with_capacity(file.posters.len());
    let mut dialogue = HashMap::new();
    for entry in file.posters {
        let image = std::fs::read(base.join(&entry.image))?;
        let id = PosterId::new(entry.id);
        if let (Some(text), Some(voice_id)) = (entry.text, entry.voice_id) {
            dialogue.insert(id.clone(), Dialogue { text, voice_id });
        }
        posters.push(ReferencePoster {
            id,
            image: Arc::new(image),
            physical_width_m: entry.physical_width_m,
            has_human_face: entry.has_human_face,
        });
    }

    Ok(ReplayCatalog { posters, dialogue })
}
