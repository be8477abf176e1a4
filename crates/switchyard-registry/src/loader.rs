use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use switchyard_core::{AgentDefinition, CapabilityDescriptor, SwitchyardError, SwitchyardResult};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Notification raised when an agent package becomes available or goes away.
#[derive(Debug, Clone)]
pub enum LoaderEvent {
    /// A validated agent with the capabilities it offers.
    Loaded {
        /// The agent definition.
        definition: AgentDefinition,
        /// Capabilities to register for it.
        capabilities: Vec<CapabilityDescriptor>,
    },
    /// The agent should no longer be offered.
    Unloaded {
        /// Agent id.
        agent_id: String,
    },
}

/// An agent manifest file.
///
/// ```toml
/// [agent]
/// id = "summarizer"
/// name = "Summarizer"
/// agent_type = "analysis"
/// capabilities = ["text.summarize"]
///
/// [[capabilities]]
/// id = "text.summarize"
/// name = "Summarize"
/// category = "analysis"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentManifest {
    /// The agent definition.
    pub agent: AgentDefinition,
    /// Capability descriptors offered by the agent.
    #[serde(default)]
    pub capabilities: Vec<CapabilityDescriptor>,
}

impl AgentManifest {
    /// Parse and validate manifest text.
    pub fn from_toml(raw: &str) -> SwitchyardResult<Self> {
        let manifest: AgentManifest = toml::from_str(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse and validate a manifest file.
    pub fn from_file(path: &Path) -> SwitchyardResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SwitchyardError::Config(format!("failed to read manifest {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
            .map_err(|e| SwitchyardError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Every capability must be valid, unique, and declared by the agent.
    pub fn validate(&self) -> SwitchyardResult<()> {
        self.agent.validate()?;
        let declared: HashSet<&str> = self.agent.capabilities.iter().map(String::as_str).collect();
        let mut seen = HashSet::new();
        for capability in &self.capabilities {
            capability.validate()?;
            if !declared.contains(capability.id.as_str()) {
                return Err(SwitchyardError::Validation(format!(
                    "agent '{}' does not declare capability '{}'",
                    self.agent.id, capability.id
                )));
            }
            if !seen.insert(capability.id.as_str()) {
                return Err(SwitchyardError::Validation(format!(
                    "agent '{}' lists capability '{}' twice",
                    self.agent.id, capability.id
                )));
            }
        }
        Ok(())
    }

    fn loaded_event(&self) -> LoaderEvent {
        LoaderEvent::Loaded {
            definition: self.agent.clone(),
            capabilities: self.capabilities.clone(),
        }
    }
}

/// Outcome of validating one manifest file.
#[derive(Debug)]
pub struct ManifestCheck {
    /// The file checked.
    pub path: PathBuf,
    /// Agent id on success, the reason on failure.
    pub result: Result<String, SwitchyardError>,
}

/// Reads `*.toml` agent manifests from a directory and announces them.
pub struct ManifestLoader {
    dir: PathBuf,
    cache: Arc<RwLock<HashMap<PathBuf, Arc<AgentManifest>>>>,
    events: broadcast::Sender<LoaderEvent>,
}

impl ManifestLoader {
    /// Create a loader over `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            dir: dir.into(),
            cache: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// The manifest directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Subscribe to load/unload notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<LoaderEvent> {
        self.events.subscribe()
    }

    /// Load every valid manifest in the directory, in file-name order.
    ///
    /// Invalid files are logged and skipped. A missing directory loads nothing.
    pub async fn load_all(&self) -> SwitchyardResult<Vec<Arc<AgentManifest>>> {
        let mut loaded = Vec::new();
        if !self.dir.exists() {
            info!(dir = %self.dir.display(), "manifest directory not found, skipping");
            return Ok(loaded);
        }

        let mut cache = self.cache.write().await;
        for path in manifest_files(&self.dir)? {
            match AgentManifest::from_file(&path) {
                Ok(manifest) => {
                    let manifest = Arc::new(manifest);
                    info!(agent_id = %manifest.agent.id, path = %path.display(), "loaded agent manifest");
                    cache.insert(path, manifest.clone());
                    self.announce(manifest.loaded_event());
                    loaded.push(manifest);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid agent manifest, skipping");
                }
            }
        }
        info!(count = loaded.len(), "agent manifests loaded");
        Ok(loaded)
    }

    /// Reload one file; a deleted file unloads the agent it described.
    pub async fn reload_file(&self, path: &Path) -> SwitchyardResult<Option<Arc<AgentManifest>>> {
        if !path.exists() {
            let removed = self.cache.write().await.remove(path);
            if let Some(manifest) = removed {
                info!(agent_id = %manifest.agent.id, path = %path.display(), "manifest removed");
                self.announce(LoaderEvent::Unloaded {
                    agent_id: manifest.agent.id.clone(),
                });
            }
            return Ok(None);
        }

        let manifest = Arc::new(AgentManifest::from_file(path)?);
        let renamed_from = {
            let mut cache = self.cache.write().await;
            let previous = cache.insert(path.to_path_buf(), manifest.clone());
            previous
                .map(|p| p.agent.id.clone())
                .filter(|old| *old != manifest.agent.id)
                .filter(|old| !cache.values().any(|m| m.agent.id == *old))
        };
        if let Some(old) = renamed_from {
            info!(agent_id = %old, renamed_to = %manifest.agent.id, path = %path.display(), "manifest changed agent id");
            self.announce(LoaderEvent::Unloaded { agent_id: old });
        }
        info!(agent_id = %manifest.agent.id, path = %path.display(), "manifest reloaded");
        self.announce(manifest.loaded_event());
        Ok(Some(manifest))
    }

    /// Forget an agent and announce its removal. Returns whether it was loaded.
    pub async fn unload(&self, agent_id: &str) -> bool {
        let removed = {
            let mut cache = self.cache.write().await;
            let before = cache.len();
            cache.retain(|_, m| m.agent.id != agent_id);
            before != cache.len()
        };
        if removed {
            info!(agent_id = %agent_id, "agent unloaded");
            self.announce(LoaderEvent::Unloaded {
                agent_id: agent_id.to_string(),
            });
        }
        removed
    }

    /// Currently loaded manifests.
    pub async fn loaded(&self) -> Vec<Arc<AgentManifest>> {
        let mut manifests: Vec<_> = self.cache.read().await.values().cloned().collect();
        manifests.sort_by(|a, b| a.agent.id.cmp(&b.agent.id));
        manifests
    }

    /// Validate every manifest in `dir` without loading anything.
    pub fn validate_dir(dir: &Path) -> SwitchyardResult<Vec<ManifestCheck>> {
        Ok(manifest_files(dir)?
            .into_iter()
            .map(|path| {
                let result = AgentManifest::from_file(&path).map(|m| m.agent.id);
                ManifestCheck { path, result }
            })
            .collect())
    }

    fn announce(&self, event: LoaderEvent) {
        if self.events.send(event).is_err() {
            debug!("no loader subscribers");
        }
    }
}

fn manifest_files(dir: &Path) -> SwitchyardResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        SwitchyardError::Config(format!("failed to read manifest dir {}: {}", dir.display(), e))
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(e) => Some(e.path()),
            Err(e) => {
                warn!(error = %e, "failed to read directory entry");
                None
            }
        })
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("toml"))
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SUMMARIZER: &str = r#"
[agent]
id = "summarizer"
name = "Summarizer"
agent_type = "analysis"
capabilities = ["text.summarize"]

[[capabilities]]
id = "text.summarize"
name = "Summarize"
category = "analysis"
"#;

    #[test]
    fn test_manifest_parses() {
        let manifest = AgentManifest::from_toml(SUMMARIZER).unwrap();
        assert_eq!(manifest.agent.id, "summarizer");
        assert_eq!(manifest.agent.resources.timeout_secs, 300);
        assert_eq!(manifest.capabilities.len(), 1);
    }

    #[test]
    fn test_undeclared_capability_rejected() {
        let raw = SUMMARIZER.replace(r#"capabilities = ["text.summarize"]"#, "");
        let err = AgentManifest::from_toml(&raw).unwrap_err();
        assert!(err.to_string().contains("does not declare"));
    }

    #[test]
    fn test_duplicate_capability_rejected() {
        let raw = format!(
            "{SUMMARIZER}\n[[capabilities]]\nid = \"text.summarize\"\nname = \"Again\"\ncategory = \"analysis\"\n"
        );
        let err = AgentManifest::from_toml(&raw).unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let raw = format!("{SUMMARIZER}\n[agent.resources]\ntimeout_secs = 0\n");
        assert!(AgentManifest::from_toml(&raw).is_err());
    }

    #[tokio::test]
    async fn test_load_all_skips_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.toml"), SUMMARIZER).unwrap();
        std::fs::write(dir.path().join("b.toml"), "not = [valid").unwrap();
        std::fs::write(dir.path().join("notes.md"), "ignored").unwrap();

        let loader = ManifestLoader::new(dir.path());
        let mut rx = loader.subscribe();
        let loaded = loader.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(matches!(rx.try_recv().unwrap(), LoaderEvent::Loaded { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_dir_loads_nothing() {
        let loader = ManifestLoader::new("/nonexistent/switchyard/manifests");
        assert!(loader.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unload_and_deleted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.toml");
        std::fs::write(&path, SUMMARIZER).unwrap();
        let loader = ManifestLoader::new(dir.path());
        loader.load_all().await.unwrap();
        let mut rx = loader.subscribe();

        std::fs::remove_file(&path).unwrap();
        assert!(loader.reload_file(&path).await.unwrap().is_none());
        match rx.try_recv().unwrap() {
            LoaderEvent::Unloaded { agent_id } => assert_eq!(agent_id, "summarizer"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!loader.unload("summarizer").await);
    }

    #[tokio::test]
    async fn test_reload_with_new_id_unloads_old_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.toml");
        std::fs::write(&path, SUMMARIZER).unwrap();
        let loader = ManifestLoader::new(dir.path());
        loader.load_all().await.unwrap();
        let mut rx = loader.subscribe();

        std::fs::write(
            &path,
            SUMMARIZER.replace(r#"id = "summarizer""#, r#"id = "digest""#),
        )
        .unwrap();
        let reloaded = loader.reload_file(&path).await.unwrap().unwrap();
        assert_eq!(reloaded.agent.id, "digest");

        match rx.try_recv().unwrap() {
            LoaderEvent::Unloaded { agent_id } => assert_eq!(agent_id, "summarizer"),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.try_recv().unwrap() {
            LoaderEvent::Loaded { definition, .. } => assert_eq!(definition.id, "digest"),
            other => panic!("unexpected event {other:?}"),
        }
        let ids: Vec<_> = loader.loaded().await.iter().map(|m| m.agent.id.clone()).collect();
        assert_eq!(ids, ["digest"]);

        // Same id again: a plain reload, no unload.
        loader.reload_file(&path).await.unwrap();
        assert!(matches!(rx.try_recv().unwrap(), LoaderEvent::Loaded { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_validate_dir_reports_each_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.toml"), SUMMARIZER).unwrap();
        std::fs::write(dir.path().join("b.toml"), "[agent]\nid = \"x\"\n").unwrap();
        let checks = ManifestLoader::validate_dir(dir.path()).unwrap();
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].result.as_ref().unwrap(), "summarizer");
        assert!(checks[1].result.is_err());
    }
}
