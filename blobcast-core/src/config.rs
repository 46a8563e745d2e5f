use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::error::{ConfigError, Result};

/// Hard per-file limit of the remote platform. The configured segment cap
/// is clamped to this value.
pub const PLATFORM_FILE_LIMIT: u64 = 20 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct BlobcastConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub segments: SegmentsSection,
    #[serde(default)]
    pub planner: PlannerSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub upload: UploadSection,
    #[serde(default)]
    pub media: MediaSection,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: IpAddr,
    pub port: u16,
    pub public_domain: Option<String>,
    pub force_https: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            public_domain: None,
            force_https: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub data_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub database_path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            scratch_dir: PathBuf::from("data/scratch"),
            cache_dir: PathBuf::from("data/cache"),
            database_path: PathBuf::from("data/catalog.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmentsSection {
    pub max_segment_bytes: u64,
    /// Lower bound of the planner's duration search, seconds.
    pub min_duration: u32,
    /// Upper bound of the planner's duration search, seconds.
    pub max_duration: u32,
}

impl Default for SegmentsSection {
    fn default() -> Self {
        Self {
            max_segment_bytes: 15 * 1024 * 1024,
            min_duration: 2,
            max_duration: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    /// Wall-clock budget for the duration search, seconds.
    pub time_budget_s: u64,
    /// Fraction of the byte cap targeted when re-encoding overflow segments.
    pub safety: f64,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            time_budget_s: 600,
            safety: 0.9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    Memory,
    Disk,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub kind: CacheKind,
    pub size_bytes: u64,
    pub ttl_s: u64,
    /// Segments scheduled ahead of the playhead on a miss.
    pub preload_segments: usize,
    pub max_concurrent_preloads: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            kind: CacheKind::Memory,
            size_bytes: 256 * 1024 * 1024,
            ttl_s: 300,
            preload_segments: 6,
            max_concurrent_preloads: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadSection {
    pub concurrency: usize,
    pub retries: u32,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaSection {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// `auto`, `none`, or an explicit encoder family (`nvenc`, `vaapi`,
    /// `videotoolbox`).
    pub hardware_accel: String,
}

impl Default for MediaSection {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            hardware_accel: "auto".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Stable identifier persisted next to every segment row.
    pub id: Option<String>,
    pub token: String,
    pub chat_id: String,
}

impl BlobcastConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.storage.data_dir.join(path)
        }
    }

    /// Effective account id for the account at `index` (0-based).
    pub fn account_id(&self, index: usize) -> String {
        self.accounts[index]
            .id
            .clone()
            .unwrap_or_else(|| format!("account{}", index + 1))
    }

    pub fn account_ids(&self) -> Vec<String> {
        (0..self.accounts.len())
            .map(|index| self.account_id(index))
            .collect()
    }

    /// Base URL used for absolute playlist URIs: the public domain when one
    /// is configured, otherwise the local bind address.
    pub fn base_url(&self) -> String {
        match &self.server.public_domain {
            Some(domain) => {
                let scheme = if self.server.force_https {
                    "https"
                } else {
                    "http"
                };
                format!("{scheme}://{domain}")
            }
            None => format!("http://{}:{}", self.server.host, self.server.port),
        }
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.accounts.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[accounts]] entry is required".to_string(),
            ));
        }
        for (index, account) in self.accounts.iter().enumerate() {
            if account.token.trim().is_empty() || account.chat_id.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "account #{} is missing a token or chat_id",
                    index + 1
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for id in self.account_ids() {
            if !seen.insert(id.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate account id {id}")));
            }
        }
        if self.segments.max_segment_bytes > PLATFORM_FILE_LIMIT {
            warn!(
                target: "config",
                configured = self.segments.max_segment_bytes,
                limit = PLATFORM_FILE_LIMIT,
                "max_segment_bytes exceeds the platform per-file limit, clamping"
            );
            self.segments.max_segment_bytes = PLATFORM_FILE_LIMIT;
        }
        if self.segments.max_segment_bytes < 1024 * 1024 {
            return Err(ConfigError::Invalid(
                "max_segment_bytes must be at least 1 MiB".to_string(),
            ));
        }
        if self.segments.min_duration == 0 || self.segments.min_duration > self.segments.max_duration
        {
            return Err(ConfigError::Invalid(
                "segment duration range is empty".to_string(),
            ));
        }
        if self.cache.size_bytes < 1024 * 1024 {
            return Err(ConfigError::Invalid(
                "cache.size_bytes must be at least 1 MiB".to_string(),
            ));
        }
        if self.upload.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "upload.concurrency must be at least 1".to_string(),
            ));
        }
        if !(0.1..=1.0).contains(&self.planner.safety) {
            return Err(ConfigError::Invalid(
                "planner.safety must be within (0.1, 1.0]".to_string(),
            ));
        }
        Ok(())
    }
}

const KNOWN_SECTIONS: &[&str] = &[
    "server", "storage", "segments", "planner", "cache", "upload", "media", "accounts",
];

/// Load and validate a config file. Unknown top-level sections are warned
/// about and ignored; invalid values are fatal.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<BlobcastConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    let value: toml::Value = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })?;
    if let Some(table) = value.as_table() {
        for key in table.keys() {
            if !KNOWN_SECTIONS.contains(&key.as_str()) {
                warn!(target: "config", section = %key, "ignoring unknown config section");
            }
        }
    }
    let mut config: BlobcastConfig =
        value
            .try_into()
            .map_err(|source: toml::de::Error| ConfigError::Parse {
                source,
                path: path.to_path_buf(),
            })?;
    config.validate()?;
    Ok(config)
}
