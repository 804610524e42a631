//! ============================================================================
//! Client Mirror - Display-only shadow of today's meter count
//! ============================================================================
//! Lets a client render "N free articles remaining" before the server
//! answers. The mirror never decides access and never counts on its own:
//! every server answer replaces it wholesale.
//! ============================================================================

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorState {
    pub day: NaiveDate,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMirror {
    state: Option<MirrorState>,
}

impl ClientMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a persisted mirror. A missing or unreadable file yields an empty
    /// mirror; the server will overwrite it anyway.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::new(),
            Err(e) => {
                warn!("Failed to read mirror {}: {} - starting empty", path.display(), e);
                return Self::new();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("Discarding corrupt mirror {}: {}", path.display(), e);
            Self::new()
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow!("Failed to create {}: {}", parent.display(), e))?;
        }
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)
            .map_err(|e| anyhow!("Failed to write mirror {}: {}", path.display(), e))
    }

    /// Seed from a non-mutating server read on page load
    pub fn seed(&mut self, day: NaiveDate, count: u32) {
        debug!("Mirror seeded: {} on {}", count, day);
        self.state = Some(MirrorState { day, count });
    }

    /// Adopt the authoritative count returned by a gated request.
    /// Overwrites; never merges with the local value.
    pub fn reconcile(&mut self, day: NaiveDate, count_after: u32) {
        if let Some(prev) = self.state {
            if prev.day == day && prev.count != count_after {
                debug!(
                    "Mirror drift corrected on {}: local {} -> server {}",
                    day, prev.count, count_after
                );
            }
        }
        self.state = Some(MirrorState {
            day,
            count: count_after,
        });
    }

    pub fn state(&self) -> Option<MirrorState> {
        self.state
    }

    /// Last known count for `day`; a mirror from another day counts as 0
    pub fn count_on(&self, day: NaiveDate) -> u32 {
        match self.state {
            Some(state) if state.day == day => state.count,
            _ => 0,
        }
    }

    /// Free reads left on `day`, for display
    pub fn remaining_on(&self, day: NaiveDate, cap: u32) -> u32 {
        cap.saturating_sub(self.count_on(day))
    }

    pub fn clear(&mut self) {
        self.state = None;
    }
}
