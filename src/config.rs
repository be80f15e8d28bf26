//! Configuration loading and validation: a TOML file deserializes into
//! an all-optional raw tree, then gets merged with defaults and checked
//! by `validate_config` before anything touches the filesystem or S3.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config path must be absolute: {0}")]
    PathNotAbsolute(PathBuf),
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalConfig {
    pub log_level: String,
    pub state_path: PathBuf,
    pub lock_path: PathBuf,
    pub spool_dir: PathBuf,
    pub spool_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    pub full_every_days: u32,
    pub incremental_every_days: u32,
    pub run_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotsConfig {
    pub base_dir: PathBuf,
    pub retain: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubvolumesConfig {
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub prefix: String,
    pub chunk_size_bytes: u64,
    pub storage_class_chunks: String,
    pub storage_class_manifest: String,
    pub concurrency: usize,
    pub sse: String,
    pub part_size_bytes: u64,
    pub multipart_threshold_bytes: u64,
    pub spool_enabled: bool,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreConfig {
    pub target_base_dir: PathBuf,
    pub verify_mode: String,
    pub sample_max_files: usize,
    pub wait_for_restore: bool,
    pub restore_timeout_seconds: u64,
    pub restore_tier: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub global: GlobalConfig,
    pub schedule: ScheduleConfig,
    pub snapshots: SnapshotsConfig,
    pub subvolumes: SubvolumesConfig,
    pub s3: S3Config,
    pub restore: RestoreConfig,
}

// Raw TOML shape. Every field is optional so missing sections/keys fall
// back to the defaults applied in `from_raw`.
#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    global: RawGlobal,
    #[serde(default)]
    schedule: RawSchedule,
    #[serde(default)]
    snapshots: RawSnapshots,
    #[serde(default)]
    subvolumes: RawSubvolumes,
    #[serde(default)]
    s3: RawS3,
    #[serde(default)]
    restore: RawRestore,
}

#[derive(Debug, Deserialize, Default)]
struct RawGlobal {
    log_level: Option<String>,
    state_path: Option<String>,
    lock_path: Option<String>,
    spool_dir: Option<String>,
    spool_size_bytes: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RawSchedule {
    full_every_days: Option<u32>,
    incremental_every_days: Option<u32>,
    run_at: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawSnapshots {
    base_dir: Option<String>,
    retain: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RawSubvolumes {
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawRetry {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RawS3 {
    bucket: Option<String>,
    region: Option<String>,
    prefix: Option<String>,
    chunk_size_bytes: Option<u64>,
    storage_class_chunks: Option<String>,
    storage_class_manifest: Option<String>,
    concurrency: Option<usize>,
    sse: Option<String>,
    part_size_bytes: Option<u64>,
    multipart_threshold_bytes: Option<u64>,
    spool_enabled: Option<bool>,
    #[serde(default)]
    retry: RawRetry,
}

#[derive(Debug, Deserialize, Default)]
struct RawRestore {
    target_base_dir: Option<String>,
    verify_mode: Option<String>,
    sample_max_files: Option<usize>,
    wait_for_restore: Option<bool>,
    restore_timeout_seconds: Option<u64>,
    restore_tier: Option<String>,
}

/// Loads and validates configuration from an absolute TOML path.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.is_absolute() {
        return Err(ConfigError::PathNotAbsolute(path.to_path_buf()));
    }
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let raw_text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: RawConfig = toml::from_str(&raw_text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let config = from_raw(raw);
    validate_config(&config)?;
    Ok(config)
}

fn from_raw(raw: RawConfig) -> Config {
    let global = GlobalConfig {
        log_level: normalize_log_level(&raw.global.log_level.unwrap_or_else(|| "info".to_string())),
        state_path: expand_path(
            raw.global
                .state_path
                .as_deref()
                .unwrap_or("~/.local/state/snapvault/state.json"),
        ),
        lock_path: expand_path(
            raw.global
                .lock_path
                .as_deref()
                .unwrap_or("/var/lock/snapvault.lock"),
        ),
        spool_dir: expand_path(
            raw.global
                .spool_dir
                .as_deref()
                .unwrap_or("/mnt/ssd/snapvault_spool"),
        ),
        spool_size_bytes: raw.global.spool_size_bytes.unwrap_or(200 * GIB),
    };
    let schedule = ScheduleConfig {
        full_every_days: raw.schedule.full_every_days.unwrap_or(180),
        incremental_every_days: raw.schedule.incremental_every_days.unwrap_or(7),
        run_at: raw.schedule.run_at.unwrap_or_else(|| "02:00".to_string()),
    };
    let snapshots = SnapshotsConfig {
        base_dir: expand_path(raw.snapshots.base_dir.as_deref().unwrap_or("/srv/snapshots")),
        retain: raw.snapshots.retain.unwrap_or(2),
    };
    let subvolumes = SubvolumesConfig {
        paths: raw
            .subvolumes
            .paths
            .iter()
            .map(|p| expand_path(p))
            .collect(),
    };
    let s3 = S3Config {
        bucket: raw.s3.bucket.unwrap_or_default(),
        region: raw.s3.region.unwrap_or_default(),
        prefix: raw.s3.prefix.unwrap_or_default(),
        chunk_size_bytes: raw.s3.chunk_size_bytes.unwrap_or(200 * GIB),
        storage_class_chunks: raw
            .s3
            .storage_class_chunks
            .unwrap_or_else(|| "DEEP_ARCHIVE".to_string()),
        storage_class_manifest: raw
            .s3
            .storage_class_manifest
            .unwrap_or_else(|| "STANDARD".to_string()),
        concurrency: raw.s3.concurrency.unwrap_or(4),
        sse: raw.s3.sse.unwrap_or_else(|| "AES256".to_string()),
        part_size_bytes: clamp_part_size(raw.s3.part_size_bytes.unwrap_or(128 * 1024 * 1024)),
        multipart_threshold_bytes: raw
            .s3
            .multipart_threshold_bytes
            .unwrap_or(5 * 1024 * 1024),
        spool_enabled: raw.s3.spool_enabled.unwrap_or(false),
        retry: RetryConfig {
            max_attempts: raw.s3.retry.max_attempts.unwrap_or(5),
            base_delay_ms: raw.s3.retry.base_delay_ms.unwrap_or(1000),
            max_delay_ms: raw.s3.retry.max_delay_ms.unwrap_or(30_000),
        },
    };
    let restore = RestoreConfig {
        target_base_dir: expand_path(
            raw.restore
                .target_base_dir
                .as_deref()
                .unwrap_or("/srv/restore"),
        ),
        verify_mode: raw.restore.verify_mode.unwrap_or_else(|| "full".to_string()),
        sample_max_files: raw.restore.sample_max_files.unwrap_or(1000),
        wait_for_restore: raw.restore.wait_for_restore.unwrap_or(true),
        restore_timeout_seconds: raw
            .restore
            .restore_timeout_seconds
            .unwrap_or(72 * 60 * 60),
        restore_tier: raw
            .restore
            .restore_tier
            .unwrap_or_else(|| "Standard".to_string()),
    };
    Config {
        global,
        schedule,
        snapshots,
        subvolumes,
        s3,
        restore,
    }
}

/// `part_size` is clamped into `[5 MiB, 5 GiB]` rather than rejected,
/// matching S3 multipart's own part-size bounds.
fn clamp_part_size(value: u64) -> u64 {
    value.clamp(5 * 1024 * 1024, 5 * GIB)
}

fn expand_path(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(raw)
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    validate_log_level(&config.global.log_level)?;
    validate_absolute(&config.global.state_path, "global.state_path")?;
    validate_absolute(&config.global.lock_path, "global.lock_path")?;
    validate_absolute(&config.global.spool_dir, "global.spool_dir")?;
    validate_positive_u64(config.global.spool_size_bytes, "global.spool_size_bytes")?;
    if config.s3.spool_enabled && config.global.spool_size_bytes < 5 * 1024 * 1024 {
        return Err(ConfigError::Invalid(
            "global.spool_size_bytes must be >= 5 MiB when spooling is enabled".to_string(),
        ));
    }

    validate_positive_u32(config.schedule.full_every_days, "schedule.full_every_days")?;
    validate_positive_u32(
        config.schedule.incremental_every_days,
        "schedule.incremental_every_days",
    )?;
    validate_run_at(&config.schedule.run_at)?;

    validate_absolute(&config.snapshots.base_dir, "snapshots.base_dir")?;
    if config.snapshots.retain < 1 {
        return Err(ConfigError::Invalid(
            "snapshots.retain must be >= 1".to_string(),
        ));
    }

    if config.subvolumes.paths.is_empty() {
        return Err(ConfigError::Invalid(
            "subvolumes.paths must include at least one path".to_string(),
        ));
    }
    for path in &config.subvolumes.paths {
        validate_absolute(path, "subvolumes.paths")?;
    }

    if config.s3.bucket.is_empty() {
        return Err(ConfigError::Invalid("s3.bucket is required".to_string()));
    }
    if config.s3.region.is_empty() {
        return Err(ConfigError::Invalid("s3.region is required".to_string()));
    }
    if config.s3.prefix.is_empty() {
        return Err(ConfigError::Invalid("s3.prefix is required".to_string()));
    }
    validate_positive_u64(config.s3.chunk_size_bytes, "s3.chunk_size_bytes")?;
    if config.s3.concurrency < 1 {
        return Err(ConfigError::Invalid(
            "s3.concurrency must be >= 1".to_string(),
        ));
    }
    if config.s3.storage_class_chunks.is_empty() {
        return Err(ConfigError::Invalid(
            "s3.storage_class_chunks is required".to_string(),
        ));
    }
    if config.s3.storage_class_manifest.is_empty() {
        return Err(ConfigError::Invalid(
            "s3.storage_class_manifest is required".to_string(),
        ));
    }
    if config.s3.sse.is_empty() {
        return Err(ConfigError::Invalid("s3.sse is required".to_string()));
    }
    if config.s3.multipart_threshold_bytes == 0 {
        return Err(ConfigError::Invalid(
            "s3.multipart_threshold_bytes must be > 0".to_string(),
        ));
    }

    validate_absolute(&config.restore.target_base_dir, "restore.target_base_dir")?;
    if !matches!(config.restore.verify_mode.as_str(), "full" | "sample" | "none") {
        return Err(ConfigError::Invalid(
            "restore.verify_mode must be full, sample, or none".to_string(),
        ));
    }
    if config.restore.sample_max_files == 0 {
        return Err(ConfigError::Invalid(
            "restore.sample_max_files must be > 0".to_string(),
        ));
    }
    validate_positive_u64(
        config.restore.restore_timeout_seconds,
        "restore.restore_timeout_seconds",
    )?;
    if config.restore.restore_tier.is_empty() {
        return Err(ConfigError::Invalid(
            "restore.restore_tier is required".to_string(),
        ));
    }
    Ok(())
}

fn validate_absolute(path: &Path, field: &str) -> Result<(), ConfigError> {
    if !path.is_absolute() {
        return Err(ConfigError::Invalid(format!(
            "{field} must be an absolute path: {}",
            path.display()
        )));
    }
    Ok(())
}

fn validate_positive_u64(value: u64, field: &str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{field} must be > 0")));
    }
    Ok(())
}

fn validate_positive_u32(value: u32, field: &str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{field} must be > 0")));
    }
    Ok(())
}

/// Maps the accepted config vocabulary onto the tokens
/// `tracing_subscriber::EnvFilter` understands, so `warning`/`critical`
/// don't silently fall back to the default filter at `main.rs` startup.
pub fn normalize_log_level(value: &str) -> String {
    match value.to_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" => "error".to_string(),
        other => other.to_string(),
    }
}

fn validate_log_level(value: &str) -> Result<(), ConfigError> {
    let valid = ["debug", "info", "warn", "error"];
    if !valid.contains(&value.to_lowercase().as_str()) {
        return Err(ConfigError::Invalid(format!(
            "global.log_level must be one of {valid:?}; got {value}"
        )));
    }
    Ok(())
}

fn validate_run_at(value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = value.split(':').collect();
    let invalid = || ConfigError::Invalid("schedule.run_at must be HH:MM".to_string());
    if parts.len() != 2 {
        return Err(invalid());
    }
    let hour: u32 = parts[0].parse().map_err(|_| invalid())?;
    let minute: u32 = parts[1].parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        (dir, path)
    }

    fn minimal_toml() -> &'static str {
        r#"
[subvolumes]
paths = ["/srv/home"]

[s3]
bucket = "my-bucket"
region = "us-east-1"
prefix = "backups"
"#
    }

    #[test]
    fn minimal_config_applies_defaults() {
        let (_dir, path) = write_config(minimal_toml());
        let config = load_config(&path).unwrap();
        assert_eq!(config.global.log_level, "info");
        assert_eq!(config.schedule.full_every_days, 180);
        assert_eq!(config.snapshots.retain, 2);
        assert_eq!(config.s3.concurrency, 4);
        assert_eq!(config.s3.sse, "AES256");
        assert_eq!(config.restore.verify_mode, "full");
    }

    #[test]
    fn log_level_warning_and_critical_normalize_to_tracing_tokens() {
        let body = format!("{}\n[global]\nlog_level = \"warning\"\n", minimal_toml());
        let (_dir, path) = write_config(&body);
        let config = load_config(&path).unwrap();
        assert_eq!(config.global.log_level, "warn");

        let body = format!("{}\n[global]\nlog_level = \"critical\"\n", minimal_toml());
        let (_dir, path) = write_config(&body);
        let config = load_config(&path).unwrap();
        assert_eq!(config.global.log_level, "error");
    }

    #[test]
    fn relative_config_path_rejected() {
        let err = load_config(Path::new("config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::PathNotAbsolute(_)));
    }

    #[test]
    fn missing_bucket_fails_validation() {
        let (_dir, path) = write_config(
            r#"
[subvolumes]
paths = ["/srv/home"]
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn part_size_is_clamped_not_rejected() {
        let (_dir, path) = write_config(&format!(
            "{}\n[s3]\nbucket=\"b\"\nregion=\"r\"\nprefix=\"p\"\npart_size_bytes={}\n",
            "[subvolumes]\npaths = [\"/srv/home\"]",
            10u64 * GIB
        ));
        let config = load_config(&path).unwrap();
        assert_eq!(config.s3.part_size_bytes, 5 * GIB);
    }

    #[test]
    fn spool_enabled_requires_min_spool_size() {
        let (_dir, path) = write_config(
            r#"
[subvolumes]
paths = ["/srv/home"]

[global]
spool_size_bytes = 1024

[s3]
bucket = "b"
region = "r"
prefix = "p"
spool_enabled = true
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn invalid_run_at_rejected() {
        let (_dir, path) = write_config(&format!(
            "{}\n[s3]\nbucket=\"b\"\nregion=\"r\"\nprefix=\"p\"\n[schedule]\nrun_at=\"25:99\"\n",
            "[subvolumes]\npaths = [\"/srv/home\"]"
        ));
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
