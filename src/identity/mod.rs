/// Identity mapping between external ids and panel-native keys
///
/// Hiddify keys accounts by the external UUID itself. Marzban keys them by
/// username, so a JSON document `{ "<uuid>": "<username>" }` bridges the two.
/// Lookups read an immutable snapshot; `reload()` publishes a new one.

use crate::{
    error::{BotError, BotResult},
    metrics,
    panel::Panel,
};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One immutable generation of the mapping
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IdentitySnapshot {
    /// external id (lowercase) -> Marzban username
    forward: HashMap<String, String>,
    /// Marzban username -> external id
    reverse: HashMap<String, String>,
}

impl IdentitySnapshot {
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut snapshot = Self::default();
        for (external_id, username) in entries {
            let external_id = external_id.into().trim().to_lowercase();
            let username = username.into().trim().to_string();
            if external_id.is_empty() || username.is_empty() {
                continue;
            }
            if let Some(previous) = snapshot.reverse.get(&username) {
                // Keep the first owner so a username never resolves to two ids
                tracing::warn!(
                    "Marzban user {} mapped from both {} and {}; keeping {}",
                    username,
                    previous,
                    external_id,
                    previous
                );
                continue;
            }
            snapshot.reverse.insert(username.clone(), external_id.clone());
            snapshot.forward.insert(external_id, username);
        }
        snapshot
    }

    fn parse(raw: &str) -> BotResult<Self> {
        let entries: HashMap<String, String> = serde_json::from_str(raw)
            .map_err(|e| BotError::IdentityMap(format!("malformed mapping document: {}", e)))?;
        Ok(Self::from_entries(entries))
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

/// Reloadable identity map
pub struct IdentityMap {
    path: Option<PathBuf>,
    inner: ArcSwap<IdentitySnapshot>,
}

impl IdentityMap {
    /// Load from a JSON file. A missing file yields an empty map; a malformed one is an error.
    pub fn load(path: impl AsRef<Path>) -> BotResult<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = read_snapshot(&path)?;
        tracing::info!(
            "Loaded identity map from {} ({} entries)",
            path.display(),
            snapshot.len()
        );
        metrics::set_identity_map_entries(snapshot.len());

        Ok(Self {
            path: Some(path),
            inner: ArcSwap::from_pointee(snapshot),
        })
    }

    /// In-memory map without a backing file
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            path: None,
            inner: ArcSwap::from_pointee(IdentitySnapshot::from_entries(entries)),
        }
    }

    pub fn empty() -> Self {
        Self::from_entries(Vec::<(String, String)>::new())
    }

    /// Re-read the backing file and publish it. On failure the previous snapshot stays live.
    pub fn reload(&self) -> BotResult<usize> {
        let Some(path) = self.path.as_ref() else {
            return Ok(self.len());
        };

        let snapshot = read_snapshot(path)?;
        let entries = snapshot.len();
        self.inner.store(Arc::new(snapshot));
        metrics::set_identity_map_entries(entries);
        tracing::info!("Reloaded identity map ({} entries)", entries);
        Ok(entries)
    }

    /// Native key of `external_id` on `panel`
    pub fn to_panel_key(&self, external_id: &str, panel: Panel) -> Option<String> {
        let external_id = external_id.trim().to_lowercase();
        match panel {
            Panel::Hiddify => Some(external_id),
            Panel::Marzban => self.inner.load().forward.get(&external_id).cloned(),
        }
    }

    /// External id behind a panel-native key
    pub fn to_external_id_on(&self, panel_key: &str, panel: Panel) -> Option<String> {
        match panel {
            Panel::Hiddify => Some(panel_key.trim().to_lowercase()),
            Panel::Marzban => self.inner.load().reverse.get(panel_key.trim()).cloned(),
        }
    }

    /// External id behind a Marzban username
    pub fn to_external_id(&self, username: &str) -> Option<String> {
        self.to_external_id_on(username, Panel::Marzban)
    }

    pub fn snapshot(&self) -> Arc<IdentitySnapshot> {
        self.inner.load_full()
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }
}

fn read_snapshot(path: &Path) -> BotResult<IdentitySnapshot> {
    match std::fs::read_to_string(path) {
        Ok(raw) => IdentitySnapshot::parse(&raw),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(
                "Identity map {} not found; Marzban lookups by external id are disabled",
                path.display()
            );
            Ok(IdentitySnapshot::default())
        }
        Err(e) => Err(BotError::IdentityMap(format!(
            "cannot read {}: {}",
            path.display(),
            e
        ))),
    }
}
