//! Token-value table loaded from `tokens.json`.

use std::{collections::HashMap, fs, io::ErrorKind, path::Path};

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::ScoringConfig;

/// Named set of tokens that awards a bonus once a team scans all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGroup {
    pub name: String,
    /// Parsed from a trailing `(xN)` suffix; defaults to 1.
    pub multiplier: u32,
}

impl TokenGroup {
    /// Parse a label such as `"Marcus Sucks (x2)"`.
    pub fn parse(label: &str) -> Option<Self> {
        let label = label.trim();
        if label.is_empty() {
            return None;
        }

        if let Some(open) = label.rfind('(') {
            let suffix = label[open + 1..].trim_end();
            if let Some(inner) = suffix.strip_suffix(')') {
                let digits = inner.trim().trim_start_matches(['x', 'X']);
                if let Ok(multiplier) = digits.trim().parse::<u32>() {
                    let name = label[..open].trim();
                    if !name.is_empty() {
                        return Some(Self {
                            name: name.to_string(),
                            multiplier: multiplier.max(1),
                        });
                    }
                }
            }
        }

        Some(Self {
            name: label.to_string(),
            multiplier: 1,
        })
    }
}

/// Scoring-relevant metadata of a single token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDefinition {
    pub token_id: String,
    pub value_rating: Option<u8>,
    pub memory_type: Option<String>,
    pub group: Option<TokenGroup>,
    /// Video asset played when the token is scanned at a player station.
    pub video: Option<String>,
}

impl TokenDefinition {
    /// Base points of this token under `scoring`.
    pub fn base_points(&self, scoring: &ScoringConfig) -> i64 {
        scoring.base_points(self.value_rating, self.memory_type.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct RawToken {
    #[serde(rename = "SF_RFID", default)]
    rfid: Option<String>,
    #[serde(rename = "SF_ValueRating", default)]
    value_rating: Option<u8>,
    #[serde(rename = "SF_MemoryType", default)]
    memory_type: Option<String>,
    #[serde(rename = "SF_Group", default)]
    group: Option<String>,
    #[serde(default)]
    video: Option<String>,
}

/// Read-only lookup table from token id to definition.
#[derive(Debug, Clone, Default)]
pub struct TokenCatalog {
    tokens: HashMap<String, TokenDefinition>,
}

impl TokenCatalog {
    /// Load the catalog from `path`; a missing or malformed file yields an empty catalog.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match Self::from_json_str(&contents) {
                Ok(catalog) => {
                    info!(path = %path.display(), tokens = catalog.len(), "loaded token catalog");
                    catalog
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse token catalog; every GM scan will be rejected"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "token catalog not found; starting empty");
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read token catalog; starting empty"
                );
                Self::default()
            }
        }
    }

    /// Parse a `{ "<rfid>": { "SF_ValueRating": .., .. } }` document.
    pub fn from_json_str(contents: &str) -> serde_json::Result<Self> {
        let raw: HashMap<String, RawToken> = serde_json::from_str(contents)?;
        let tokens = raw
            .into_iter()
            .map(|(key, token)| {
                let token_id = normalize_token_id(token.rfid.as_deref().unwrap_or(&key));
                let definition = TokenDefinition {
                    token_id: token_id.clone(),
                    value_rating: token.value_rating,
                    memory_type: token.memory_type.filter(|kind| !kind.trim().is_empty()),
                    group: token.group.as_deref().and_then(TokenGroup::parse),
                    video: token.video.filter(|video| !video.trim().is_empty()),
                };
                (token_id, definition)
            })
            .collect();
        Ok(Self { tokens })
    }

    /// Build a catalog directly from definitions.
    pub fn from_definitions(definitions: impl IntoIterator<Item = TokenDefinition>) -> Self {
        Self {
            tokens: definitions
                .into_iter()
                .map(|mut definition| {
                    definition.token_id = normalize_token_id(&definition.token_id);
                    (definition.token_id.clone(), definition)
                })
                .collect(),
        }
    }

    /// Look up a token by id (case-insensitive).
    pub fn get(&self, token_id: &str) -> Option<&TokenDefinition> {
        self.tokens.get(&normalize_token_id(token_id))
    }

    /// Every token belonging to the group called `name`.
    pub fn group_members(&self, name: &str) -> Vec<&TokenDefinition> {
        self.tokens
            .values()
            .filter(|token| token.group.as_ref().is_some_and(|group| group.name == name))
            .collect()
    }

    /// Number of known tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// True when no token is known.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Canonical form of a token id: trimmed and lowercase.
pub fn normalize_token_id(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
