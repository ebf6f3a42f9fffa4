//! Configuration loading and types for Hatrac (§6 "Configuration").
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct. The functional subsections (`storage`, `firewall_acls`,
//! `max_request_payload_size`, `read_only`, `service_prefix`) restrict
//! themselves to the closed option set spec.md §6 names; `server`,
//! `logging`, `observability`, and `directory` are the ambient sections
//! every deployment of this project carries alongside it.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Metadata directory settings (C3).
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Object storage backend settings (C6). §6 closed set:
    /// `storage_backend ∈ {filesystem, s3, overlay}`.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Per-operation firewall ACLs (§6 `firewall_acls`): role sets applied
    /// in addition to a resource's own ACL for `create`/`delete`/
    /// `manage_acl`/`manage_metadata`.
    #[serde(default)]
    pub firewall_acls: FirewallAcls,

    /// Maximum accepted request body size in bytes (§6
    /// `max_request_payload_size`); requests over this limit are rejected
    /// with `PayloadTooLarge`.
    #[serde(default = "default_max_request_payload_size")]
    pub max_request_payload_size: u64,

    /// When true, every mutating operation is rejected regardless of ACLs
    /// (§6 `read_only`).
    #[serde(default)]
    pub read_only: bool,

    /// URL prefix this service uses when generating self-referential URLs
    /// (`Location` headers, etc.) (§6 `service_prefix`).
    #[serde(default = "default_service_prefix")]
    pub service_prefix: String,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probes).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
///
/// Controls Prometheus metrics collection and Kubernetes-style health
/// probes. Both are enabled by default.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable `/healthz` and `/readyz` probes.
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

/// Metadata directory (C3) configuration: always SQLite-backed in this
/// implementation (spec.md's "pooled SQL connection" is realized as a
/// single mutex-guarded `rusqlite::Connection`, see
/// [`crate::directory::sqlite`]).
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_directory_path")]
    pub path: String,

    /// Roles granted `owner` on the root namespace (`/`) at startup, the
    /// Rust-native analogue of the original's `deploy_db(root_roles)`
    /// bootstrap: without at least one owner on root, `create_name`
    /// can never succeed for a top-level namespace or object, since
    /// root has no ancestors to roll an `ancestor_owner`/`ancestor_create`
    /// grant down from. Granting is additive and re-applied on every
    /// startup (idempotent), never revoked. Defaults to `["*"]`,
    /// matching the original's own "backwards compatible" wide-open
    /// default for a freshly deployed, unconfigured instance.
    #[serde(default = "default_root_roles")]
    pub root_roles: Vec<String>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            path: default_directory_path(),
            root_roles: default_root_roles(),
        }
    }
}

/// Object storage backend configuration (§6 `storage_backend` and
/// friends).
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend selector: `filesystem`, `s3`, or `overlay`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Filesystem backend root directory (§6 `storage_path`).
    #[serde(default = "default_storage_path")]
    pub storage_path: String,

    /// S3 gateway configuration (§6 `s3_config`), present when `backend`
    /// is `s3` or when `overlay` lists an `s3` member.
    #[serde(default)]
    pub s3_config: S3Config,

    /// Ordered list of sub-backend selectors used when `backend =
    /// overlay` (§4.6 "An overlay backend exposes a prioritised list of
    /// sub-backends"). Each entry is `filesystem` or `s3`; the first is
    /// authoritative for writes.
    #[serde(default)]
    pub overlay: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            storage_path: default_storage_path(),
            s3_config: S3Config::default(),
            overlay: Vec::new(),
        }
    }
}

/// S3 gateway configuration: a map of path-prefix to bucket settings (§6
/// `s3_config.buckets`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3Config {
    #[serde(default)]
    pub buckets: BTreeMap<String, S3BucketConfig>,
}

/// One `s3_config.buckets` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct S3BucketConfig {
    /// Backing bucket name. Must have versioning enabled (§4.6); Hatrac
    /// treats an unversioned bucket as `Conflict` at first write.
    pub bucket_name: String,

    /// Path prefix inside the bucket that object keys are rooted under.
    #[serde(default)]
    pub bucket_path_prefix: String,

    /// Minimum content size, in bytes, above which a whole-entity read
    /// (no `Range`) is served as a 303 redirect to a presigned URL
    /// instead of proxied through this service (§4.6 "Presigned
    /// redirects"). `0` disables presigning.
    #[serde(default)]
    pub presigned_url_threshold: u64,

    /// Expiration, in seconds, applied to generated presigned URLs.
    #[serde(default = "default_presigned_expiration")]
    pub presigned_url_expiration_secs: u64,

    /// AWS region for the session/client used against this bucket.
    #[serde(default = "default_region")]
    pub region: String,

    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: String,
}

/// Per-operation firewall role sets (§6 `firewall_acls`): evaluated
/// alongside (not instead of) a resource's own ACL before `create`,
/// `delete`, `manage_acl`, and `manage_metadata` operations
/// (`crate::acl::enforce_firewall`). Defaults to `["*"]` for every
/// operation -- the "backwards compatible default firewall behavior"
/// the original config carries built in -- so an unconfigured instance
/// is gated only by each resource's own ACL, not an additional
/// firewall restriction.
#[derive(Debug, Clone, Deserialize)]
pub struct FirewallAcls {
    #[serde(default = "default_firewall_roles")]
    pub create: Vec<String>,
    #[serde(default = "default_firewall_roles")]
    pub delete: Vec<String>,
    #[serde(default = "default_firewall_roles")]
    pub manage_acl: Vec<String>,
    #[serde(default = "default_firewall_roles")]
    pub manage_metadata: Vec<String>,
}

impl Default for FirewallAcls {
    fn default() -> Self {
        Self {
            create: default_firewall_roles(),
            delete: default_firewall_roles(),
            manage_acl: default_firewall_roles(),
            manage_metadata: default_firewall_roles(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_directory_path() -> String {
    "./data/hatrac.db".to_string()
}

fn default_root_roles() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_firewall_roles() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_storage_backend() -> String {
    "filesystem".to_string()
}

fn default_storage_path() -> String {
    "./data/objects".to_string()
}

fn default_presigned_expiration() -> u64 {
    3600
}

fn default_max_request_payload_size() -> u64 {
    5_368_709_120 // 5 GiB
}

fn default_service_prefix() -> String {
    "/hatrac".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_closed_option_set() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.storage.backend, "filesystem");
        assert!(!config.read_only);
        assert_eq!(config.service_prefix, "/hatrac");
        assert_eq!(config.firewall_acls.create, vec!["*".to_string()]);
        assert_eq!(config.directory.root_roles, vec!["*".to_string()]);
    }

    #[test]
    fn root_roles_can_be_locked_down() {
        let yaml = "
directory:
  root_roles: [\"admin\"]
firewall_acls:
  create: [\"admin\"]
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.directory.root_roles, vec!["admin".to_string()]);
        assert_eq!(config.firewall_acls.create, vec!["admin".to_string()]);
        // other operations keep the wide-open default independently
        assert_eq!(config.firewall_acls.delete, vec!["*".to_string()]);
    }

    #[test]
    fn s3_buckets_map_parses_by_path_prefix() {
        let yaml = "
storage:
  backend: s3
  s3_config:
    buckets:
      /:
        bucket_name: my-bucket
        presigned_url_threshold: 1048576
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let bucket = config.storage.s3_config.buckets.get("/").unwrap();
        assert_eq!(bucket.bucket_name, "my-bucket");
        assert_eq!(bucket.presigned_url_threshold, 1_048_576);
    }
}
