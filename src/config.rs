//! Application-level configuration loading, including the scoring table.

use std::{
    collections::{BTreeMap, HashMap},
    env, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "ALN_ORCHESTRATOR_CONFIG_PATH";
/// Default location of the token-value table.
const DEFAULT_TOKENS_PATH: &str = "config/tokens.json";
const DEFAULT_MAX_BATCH_ENTRIES: usize = 500;
const DEFAULT_SYNC_RECENT_TRANSACTIONS: usize = 50;
/// Memory type assumed when a token does not declare one.
const DEFAULT_MEMORY_TYPE: &str = "personal";

/// Converts a token's value rating and memory type into base points.
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    value_points: BTreeMap<u8, i64>,
    /// Keys are stored lowercase.
    type_multipliers: HashMap<String, i64>,
}

impl ScoringConfig {
    /// Base points of a token before any team multiplier.
    ///
    /// Unknown or missing ratings count as rating 1; a missing memory type counts
    /// as `Personal` and an unknown one uses a multiplier of 1.
    pub fn base_points(&self, value_rating: Option<u8>, memory_type: Option<&str>) -> i64 {
        let rating = value_rating
            .filter(|rating| self.value_points.contains_key(rating))
            .unwrap_or(1);
        let base = self.value_points.get(&rating).copied().unwrap_or(0);

        let kind = memory_type
            .map(str::trim)
            .filter(|kind| !kind.is_empty())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| DEFAULT_MEMORY_TYPE.to_string());
        let multiplier = self.type_multipliers.get(&kind).copied().unwrap_or(1);

        base * multiplier
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            value_points: BTreeMap::from([(1, 100), (2, 500), (3, 1_000), (4, 5_000), (5, 10_000)]),
            type_multipliers: HashMap::from([
                ("personal".to_string(), 1),
                ("business".to_string(), 3),
                ("technical".to_string(), 5),
            ]),
        }
    }
}

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    scoring: ScoringConfig,
    tokens_path: PathBuf,
    admin_token: Option<String>,
    gm_token: Option<String>,
    snapshot_path: Option<PathBuf>,
    max_batch_entries: usize,
    sync_recent_transactions: usize,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json_str(&contents) {
                Ok(app_config) => {
                    info!(
                        path = %path.display(),
                        tokens = %app_config.tokens_path.display(),
                        "loaded configuration"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse a configuration document; absent keys keep their defaults.
    pub fn from_json_str(contents: &str) -> serde_json::Result<Self> {
        serde_json::from_str::<RawConfig>(contents).map(Into::into)
    }

    /// Scoring table used by the transaction processor.
    pub fn scoring(&self) -> &ScoringConfig {
        &self.scoring
    }

    /// Path of the token-value table.
    pub fn tokens_path(&self) -> &Path {
        &self.tokens_path
    }

    /// Token expected in the `X-Admin-Token` header, if admin routes are protected.
    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }

    /// Token GM devices must present when identifying, if configured.
    pub fn gm_token(&self) -> Option<&str> {
        self.gm_token.as_deref()
    }

    /// Location of the session snapshot file, when persistence is enabled.
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Largest number of entries accepted in one offline batch.
    pub fn max_batch_entries(&self) -> usize {
        self.max_batch_entries
    }

    /// Number of most recent transactions included in `sync:full`.
    pub fn sync_recent_transactions(&self) -> usize {
        self.sync_recent_transactions
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        RawConfig::default().into()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    scoring: Option<RawScoring>,
    tokens_path: Option<PathBuf>,
    admin_token: Option<String>,
    gm_token: Option<String>,
    snapshot_path: Option<PathBuf>,
    max_batch_entries: Option<usize>,
    sync_recent_transactions: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
/// JSON representation of the scoring table; keys are value ratings.
struct RawScoring {
    value_points: BTreeMap<u8, i64>,
    type_multipliers: HashMap<String, i64>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let mut scoring = ScoringConfig::default();
        if let Some(raw) = value.scoring {
            if !raw.value_points.is_empty() {
                scoring.value_points = raw.value_points;
            }
            if !raw.type_multipliers.is_empty() {
                scoring.type_multipliers = raw
                    .type_multipliers
                    .into_iter()
                    .map(|(kind, multiplier)| (kind.trim().to_ascii_lowercase(), multiplier))
                    .collect();
            }
        }

        Self {
            scoring,
            tokens_path: value
                .tokens_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKENS_PATH)),
            admin_token: value.admin_token.filter(|token| !token.is_empty()),
            gm_token: value.gm_token.filter(|token| !token.is_empty()),
            snapshot_path: value.snapshot_path,
            max_batch_entries: value
                .max_batch_entries
                .unwrap_or(DEFAULT_MAX_BATCH_ENTRIES),
            sync_recent_transactions: value
                .sync_recent_transactions
                .unwrap_or(DEFAULT_SYNC_RECENT_TRANSACTIONS),
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
