use std::path::PathBuf;

pub(super) fn default_project_name() -> String {
    // Infer from the current directory
    std::env::current_dir()
        .expect("Failed to get current directory")
        .file_name()
        .expect("Failed to get current directory name")
        .to_string_lossy()
        .to_string()
}

pub(super) fn default_cache_dir() -> PathBuf {
    let mut path = dirs::cache_dir().expect("Failed to get cache directory");
    path.push("modelpool");
    path
}

pub(super) fn default_log_dir() -> PathBuf {
    let mut path = dirs::cache_dir().expect("Failed to get cache directory");
    path.push("modelpool");
    path.push("logs");

    path
}

pub(super) fn default_subagent_catalog_path() -> PathBuf {
    let mut path = default_cache_dir();
    path.push("subagents.json");
    path
}

pub(super) fn default_model_catalog_path() -> PathBuf {
    let mut path = default_cache_dir();
    path.push("models.json");
    path
}

pub(super) fn default_start_lock_backoff_ms() -> u64 {
    500
}

pub(super) fn default_health_check_timeout_secs() -> u64 {
    30
}

pub(super) fn default_health_check_max_backoff_ms() -> u64 {
    2_000
}
