//! Subagent catalog persistence (`spec.md` §4.6, §6, C6).
//!
//! Whole-file JSON via `serde_json`, written atomically as a temp file in
//! the catalog's own directory followed by a rename, using `tempfile` —
//! the host project's own dev-dependency for exactly this pattern,
//! promoted here to a normal dependency since catalog persistence is in
//! scope rather than only used in tests.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{CrateError, Result};
use crate::model::{ServerDescriptor, SubagentDefinition};

fn write_atomically<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value).map_err(|source| CrateError::CatalogParse {
        path: path.to_path_buf(),
        source,
    })?;

    tmp.persist(path).map_err(|e| CrateError::PersistFailed {
        path: path.to_path_buf(),
        source: e.error,
    })?;

    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| CrateError::CatalogParse {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Persistent catalog of [`SubagentDefinition`]s (`spec.md` §4.6, §6,
/// "Subagent catalog"). Pure data operations: load/save/list/duplicate.
pub struct SubagentCatalog {
    path: PathBuf,
    definitions: Vec<SubagentDefinition>,
}

impl SubagentCatalog {
    /// Loads the catalog file at `path`, or starts empty if it doesn't
    /// exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let definitions: Vec<SubagentDefinition> = read_json(&path)?;
        Ok(SubagentCatalog { path, definitions })
    }

    /// Writes the full catalog back to disk atomically.
    pub fn save(&self) -> Result<()> {
        write_atomically(&self.path, &self.definitions)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&SubagentDefinition> {
        self.definitions.iter().find(|d| d.id == id)
    }

    #[must_use]
    pub fn list(&self) -> &[SubagentDefinition] {
        &self.definitions
    }

    /// Replaces the entry with a matching id, or appends if none exists
    /// (`spec.md` §3: "modifying an existing id replaces in place").
    /// Persists the change.
    pub fn upsert(&mut self, definition: SubagentDefinition) -> Result<()> {
        match self.definitions.iter_mut().find(|d| d.id == definition.id) {
            Some(slot) => *slot = definition,
            None => self.definitions.push(definition),
        }
        self.save()
    }

    /// Removes the entry with `id`, if present. Persists the change.
    pub fn remove(&mut self, id: &str) -> Result<bool> {
        let before = self.definitions.len();
        self.definitions.retain(|d| d.id != id);
        let removed = self.definitions.len() != before;
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Deep-copies the entry at `id` under a fresh id and name, then
    /// persists and returns it (`spec.md` §4.6, `duplicate`).
    pub fn duplicate(&mut self, id: &str, new_id: impl Into<String>, new_name: impl Into<String>) -> Result<SubagentDefinition> {
        let source = self.get(id).ok_or_else(|| CrateError::UnknownSubagent { id: id.to_string() })?;
        let copy = source.duplicated_as(new_id, new_name);
        self.upsert(copy.clone())?;
        Ok(copy)
    }
}

/// One entry in the persisted model catalog (`spec.md` §6, "Model
/// catalog"). `is_main_agent`/`is_subagent_only` gate the subagent reaper
/// logic described by the external collaborator that owns it; this crate
/// only round-trips the flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalogEntry {
    pub id: String,
    pub display_name: String,
    /// Local model path, or the hosted provider's model identifier.
    pub model_ref: String,
    #[serde(default)]
    pub server: Option<ServerDescriptor>,
    #[serde(default)]
    pub resource_hints: crate::model::ResourceHints,
    #[serde(default)]
    pub is_main_agent: bool,
    #[serde(default)]
    pub is_subagent_only: bool,
}

/// Whether a catalog contains any entry whose server descriptor implies a
/// remote architecture, used by [`crate::memory::detect_architecture`]
/// (`spec.md` §4.3: "the persisted model catalog contains at least one
/// entry whose server descriptor is remote or docker-remote").
#[must_use]
pub fn catalog_requires_remote(entries: &[ModelCatalogEntry]) -> bool {
    entries.iter().any(|entry| match &entry.server {
        Some(ServerDescriptor::Remote { .. }) => true,
        Some(ServerDescriptor::Docker(docker)) => docker.host.is_some(),
        _ => false,
    })
}

/// Persisted model catalog (`spec.md` §6). Loaded/saved the same way as
/// the subagent catalog.
pub struct ModelCatalog {
    path: PathBuf,
    entries: Vec<ModelCatalogEntry>,
}

impl ModelCatalog {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries: Vec<ModelCatalogEntry> = read_json(&path)?;
        Ok(ModelCatalog { path, entries })
    }

    pub fn save(&self) -> Result<()> {
        write_atomically(&self.path, &self.entries)
    }

    #[must_use]
    pub fn list(&self) -> &[ModelCatalogEntry] {
        &self.entries
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ModelCatalogEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn upsert(&mut self, entry: ModelCatalogEntry) -> Result<()> {
        match self.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(slot) => *slot = entry,
            None => self.entries.push(entry),
        }
        self.save()
    }

    #[must_use]
    pub fn requires_remote_architecture(&self) -> bool {
        catalog_requires_remote(&self.entries)
    }
}

/// One subagent-label-to-model binding (`spec.md` §6, "Subagent-to-model
/// binding").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBindingEntry {
    pub model_id: String,
    #[serde(default)]
    pub auto_load: bool,
    #[serde(default)]
    pub auto_unload: bool,
    #[serde(default)]
    pub unload_delay_ms: u64,
    #[serde(default)]
    pub server: Option<ServerDescriptor>,
}

/// Persisted subagent-label -> binding map (`spec.md` §6), whole-file JSON
/// keyed by subagent label.
pub struct ModelBindings {
    path: PathBuf,
    bindings: std::collections::HashMap<String, ModelBindingEntry>,
}

impl ModelBindings {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bindings: std::collections::HashMap<String, ModelBindingEntry> = read_json(&path)?;
        Ok(ModelBindings { path, bindings })
    }

    pub fn save(&self) -> Result<()> {
        write_atomically(&self.path, &self.bindings)
    }

    #[must_use]
    pub fn get(&self, label: &str) -> Option<&ModelBindingEntry> {
        self.bindings.get(label)
    }

    pub fn set(&mut self, label: impl Into<String>, binding: ModelBindingEntry) -> Result<()> {
        self.bindings.insert(label.into(), binding);
        self.save()
    }
}

/// A single definition wrapped with a version tag and timestamp for
/// cross-installation transfer (`spec.md` §4.6, "Export/import helpers").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentExport {
    pub version: u32,
    pub exported_at: String,
    pub definition: SubagentDefinition,
}

#[must_use]
pub fn export(definition: &SubagentDefinition, exported_at: impl Into<String>) -> SubagentExport {
    SubagentExport {
        version: 1,
        exported_at: exported_at.into(),
        definition: definition.clone(),
    }
}

#[must_use]
pub fn import(export: SubagentExport) -> SubagentDefinition {
    export.definition
}

/// Workspace onboarding state (`spec.md` §6, "Workspace onboarding
/// state"). This crate round-trips the struct only — the onboarding flow
/// itself is an external collaborator's responsibility, per `spec.md`
/// §1's explicit non-goal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnboardingState {
    pub version: u32,
    #[serde(default)]
    pub bootstrap_seeded_at: Option<String>,
    #[serde(default)]
    pub onboarding_completed_at: Option<String>,
}

impl OnboardingState {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        read_json(path.as_ref())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_atomically(path.as_ref(), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Behavior, Endpoint, ModelBinding, Provider, ResourceHints};
    use url::Url;

    fn definition(id: &str) -> SubagentDefinition {
        SubagentDefinition {
            id: id.to_string(),
            name: "Coder".to_string(),
            description: String::new(),
            metadata: crate::model::Metadata::default(),
            personality: None,
            model: ModelBinding {
                endpoint: Endpoint {
                    provider: Provider::Vllm,
                    base_url: Url::parse("http://127.0.0.1:8001/v1").unwrap(),
                    model: "qwen2.5-7b".to_string(),
                    api_key: None,
                    server: None,
                    resource_hints: ResourceHints::default(),
                },
                fallback_endpoints: vec![],
                max_retries: 2,
            },
            behavior: Behavior::default(),
        }
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subagents.json");
        let mut catalog = SubagentCatalog::load(&path).unwrap();

        catalog.upsert(definition("coder")).unwrap();
        assert_eq!(catalog.get("coder").unwrap().id, "coder");

        let reloaded = SubagentCatalog::load(&path).unwrap();
        assert_eq!(reloaded.get("coder").unwrap().id, "coder");
    }

    #[test]
    fn upsert_replaces_existing_id_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subagents.json");
        let mut catalog = SubagentCatalog::load(&path).unwrap();

        catalog.upsert(definition("coder")).unwrap();
        let mut updated = definition("coder");
        updated.name = "Renamed Coder".to_string();
        catalog.upsert(updated).unwrap();

        assert_eq!(catalog.list().len(), 1);
        assert_eq!(catalog.get("coder").unwrap().name, "Renamed Coder");
    }

    #[test]
    fn duplicate_produces_a_deep_copy_under_a_new_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subagents.json");
        let mut catalog = SubagentCatalog::load(&path).unwrap();
        catalog.upsert(definition("coder")).unwrap();

        let copy = catalog.duplicate("coder", "coder-2", "Coder Copy").unwrap();
        assert_eq!(copy.id, "coder-2");
        assert_eq!(copy.model.endpoint.model, "qwen2.5-7b");
        assert_eq!(catalog.list().len(), 2);

        // Confirm it's a deep copy: mutating the original entry in the
        // catalog must not affect the duplicate already returned.
        let mut mutated_original = catalog.get("coder").unwrap().clone();
        mutated_original.name = "Mutated".to_string();
        catalog.upsert(mutated_original).unwrap();
        assert_eq!(catalog.get("coder-2").unwrap().name, "Coder Copy");
    }

    #[test]
    fn remove_deletes_the_matching_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subagents.json");
        let mut catalog = SubagentCatalog::load(&path).unwrap();
        catalog.upsert(definition("coder")).unwrap();

        assert!(catalog.remove("coder").unwrap());
        assert!(catalog.get("coder").is_none());
        assert!(!catalog.remove("coder").unwrap());
    }

    #[test]
    fn export_then_import_round_trips_the_definition() {
        let def = definition("coder");
        let exported = export(&def, "2026-07-28T00:00:00Z");
        assert_eq!(exported.version, 1);
        let imported = import(exported);
        assert_eq!(imported.id, "coder");
    }

    #[test]
    fn catalog_requires_remote_detects_remote_docker_host() {
        let entries = vec![ModelCatalogEntry {
            id: "m1".to_string(),
            display_name: "Model".to_string(),
            model_ref: "qwen2.5-7b".to_string(),
            server: Some(ServerDescriptor::Docker(crate::model::DockerDescriptor {
                image: "vllm/vllm-openai:latest".to_string(),
                host: Some(crate::model::SshDescriptor {
                    host: "10.0.0.5".to_string(),
                    port: 22,
                    user: "root".to_string(),
                    auth: crate::model::SshAuth::KeyPath { path: "/root/.ssh/id_ed25519".into() },
                    workdir: None,
                }),
                env: vec![],
                volumes: vec![],
                gpus: None,
                container_port: 8000,
            })),
            resource_hints: ResourceHints::default(),
            is_main_agent: false,
            is_subagent_only: false,
        }];
        assert!(catalog_requires_remote(&entries));
    }

    #[test]
    fn onboarding_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".modelpool-state.json");
        let state = OnboardingState {
            version: 1,
            bootstrap_seeded_at: Some("2026-07-28T00:00:00Z".to_string()),
            onboarding_completed_at: None,
        };
        state.save(&path).unwrap();

        let loaded = OnboardingState::load(&path).unwrap();
        assert_eq!(loaded.bootstrap_seeded_at.as_deref(), Some("2026-07-28T00:00:00Z"));
    }
}
