//! Per-conversation and per-community settings
//!
//! Every read resolves conversation override → community override → built-in
//! default. The table of known keys and their bounds is a [`SettingsSpec`]
//! built once at startup and shared read-only.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::params;

use super::DbPool;
use crate::{Error, Result};

/// How far back (days) the compaction window reaches
pub const COMPACT_DAYS: &str = "compact_days";
/// Messages newer than this many hours stay raw
pub const RAW_HOURS: &str = "raw_hours";
/// Target summary size, and the history size below which compaction is skipped
pub const COMPACT_MAX_TOKENS: &str = "compact_max_tokens";
/// Aged-out raw tokens that force a recompaction
pub const RECOMPACT_RAW_TOKENS: &str = "recompact_raw_tokens";
/// Budget for the uncompacted tail
pub const RAW_MAX_TOKENS: &str = "raw_max_tokens";
/// Model used for compaction
pub const COMPACT_MODEL: &str = "compact_model";

/// Type, default and bounds of a setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    /// Integer within `[min, max]` inclusive
    Integer { default: i64, min: i64, max: i64 },
    /// Free text, stored verbatim
    Text { default: &'static str },
}

/// A known setting
#[derive(Debug, Clone, Copy)]
pub struct SettingDef {
    pub key: &'static str,
    pub description: &'static str,
    pub kind: SettingKind,
}

impl SettingDef {
    /// Built-in default value
    #[must_use]
    pub fn default_value(&self) -> SettingValue {
        match self.kind {
            SettingKind::Integer { default, .. } => SettingValue::Integer(default),
            SettingKind::Text { default } => SettingValue::Text(default.to_string()),
        }
    }

    /// Validate a raw operator-supplied value
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if an integer setting does not parse or is out of range
    pub fn parse(&self, raw: &str) -> Result<SettingValue> {
        match self.kind {
            SettingKind::Integer { min, max, .. } => {
                let value: i64 = raw.trim().parse().map_err(|_| {
                    Error::Validation(format!(
                        "{} must be a whole number between {min} and {max} (got `{raw}`)",
                        self.key
                    ))
                })?;
                if !(min..=max).contains(&value) {
                    return Err(Error::Validation(format!(
                        "{} must be between {min} and {max} (got {value})",
                        self.key
                    )));
                }
                Ok(SettingValue::Integer(value))
            }
            SettingKind::Text { .. } => Ok(SettingValue::Text(raw.to_string())),
        }
    }

    /// Human-readable bounds, e.g. `integer 1..=30`
    #[must_use]
    pub fn bounds(&self) -> String {
        match self.kind {
            SettingKind::Integer { min, max, .. } => format!("integer {min}..={max}"),
            SettingKind::Text { .. } => "text".to_string(),
        }
    }
}

/// The table of known settings
#[derive(Debug, Clone)]
pub struct SettingsSpec {
    defs: Vec<SettingDef>,
}

impl Default for SettingsSpec {
    fn default() -> Self {
        Self::new(vec![
            SettingDef {
                key: COMPACT_DAYS,
                description: "How many days of history the compaction window covers",
                kind: SettingKind::Integer { default: 7, min: 1, max: 30 },
            },
            SettingDef {
                key: RAW_HOURS,
                description: "Messages from the last N hours are kept verbatim",
                kind: SettingKind::Integer { default: 6, min: 1, max: 72 },
            },
            SettingDef {
                key: COMPACT_MAX_TOKENS,
                description: "Target summary size; smaller histories are not compacted",
                kind: SettingKind::Integer { default: 2000, min: 256, max: 8000 },
            },
            SettingDef {
                key: RECOMPACT_RAW_TOKENS,
                description: "Uncompacted tokens older than the raw window that force a recompaction",
                kind: SettingKind::Integer { default: 1500, min: 100, max: 16000 },
            },
            SettingDef {
                key: RAW_MAX_TOKENS,
                description: "Token budget for the verbatim message tail",
                kind: SettingKind::Integer { default: 3000, min: 256, max: 16000 },
            },
            SettingDef {
                key: COMPACT_MODEL,
                description: "Model that writes compaction summaries",
                kind: SettingKind::Text { default: "gpt-4o-mini" },
            },
        ])
    }
}

impl SettingsSpec {
    /// Build a settings table from explicit definitions
    #[must_use]
    pub const fn new(defs: Vec<SettingDef>) -> Self {
        Self { defs }
    }

    /// Look up a setting definition
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SettingDef> {
        self.defs.iter().find(|def| def.key == key)
    }

    /// All definitions in display order
    #[must_use]
    pub fn defs(&self) -> &[SettingDef] {
        &self.defs
    }

    /// Look up a setting, failing with the list of valid keys
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownSetting` if the key is not defined
    pub fn require(&self, key: &str) -> Result<&SettingDef> {
        self.get(key).ok_or_else(|| Error::UnknownSetting {
            key: key.to_string(),
            valid: self
                .defs
                .iter()
                .map(|def| format!("{} ({})", def.key, def.bounds()))
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}

/// A typed setting value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    Integer(i64),
    Text(String),
}

impl SettingValue {
    #[must_use]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            Self::Integer(_) => None,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

/// Which level a resolved value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingSource {
    Conversation,
    Community,
    Default,
}

impl SettingSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Community => "community",
            Self::Default => "default",
        }
    }
}

/// A resolved setting with its origin
#[derive(Debug, Clone)]
pub struct ResolvedSetting {
    pub key: &'static str,
    pub value: SettingValue,
    pub source: SettingSource,
}

/// Fully resolved settings map (always contains every known key)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedSettings {
    values: BTreeMap<&'static str, SettingValue>,
}

impl ResolvedSettings {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.values.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &SettingValue)> {
        self.values.iter().map(|(key, value)| (*key, value))
    }

    fn integer(&self, key: &str) -> Result<i64> {
        self.get(key)
            .and_then(SettingValue::as_integer)
            .ok_or_else(|| Error::Validation(format!("setting {key} is missing or not an integer")))
    }

    fn count(&self, key: &str) -> Result<usize> {
        usize::try_from(self.integer(key)?)
            .map_err(|_| Error::Validation(format!("setting {key} must not be negative")))
    }

    fn text(&self, key: &str) -> Result<&str> {
        self.get(key)
            .and_then(SettingValue::as_text)
            .ok_or_else(|| Error::Validation(format!("setting {key} is missing or not text")))
    }
}

impl FromIterator<ResolvedSetting> for ResolvedSettings {
    fn from_iter<I: IntoIterator<Item = ResolvedSetting>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|s| (s.key, s.value)).collect(),
        }
    }
}

/// Typed inputs for the context builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSettings {
    pub compact_days: i64,
    pub raw_hours: i64,
    pub compact_max_tokens: usize,
    pub recompact_raw_tokens: usize,
    pub raw_max_tokens: usize,
    pub compact_model: String,
}

impl ContextSettings {
    /// Extract builder inputs from a resolved map
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if a required key is missing or mistyped
    pub fn from_resolved(resolved: &ResolvedSettings) -> Result<Self> {
        Ok(Self {
            compact_days: resolved.integer(COMPACT_DAYS)?,
            raw_hours: resolved.integer(RAW_HOURS)?,
            compact_max_tokens: resolved.count(COMPACT_MAX_TOKENS)?,
            recompact_raw_tokens: resolved.count(RECOMPACT_RAW_TOKENS)?,
            raw_max_tokens: resolved.count(RAW_MAX_TOKENS)?,
            compact_model: resolved.text(COMPACT_MODEL)?.to_string(),
        })
    }
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            compact_days: 7,
            raw_hours: 6,
            compact_max_tokens: 2000,
            recompact_raw_tokens: 1500,
            raw_max_tokens: 3000,
            compact_model: "gpt-4o-mini".to_string(),
        }
    }
}

/// Stored override row
struct OverrideRow {
    conversation_id: String,
    key: String,
    value: String,
}

/// Settings repository
#[derive(Clone)]
pub struct SettingsRepo {
    pool: DbPool,
    spec: Arc<SettingsSpec>,
}

impl SettingsRepo {
    /// Create a new settings repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool, spec: Arc<SettingsSpec>) -> Self {
        Self { pool, spec }
    }

    /// The settings table this repository validates against
    #[must_use]
    pub fn spec(&self) -> &SettingsSpec {
        &self.spec
    }

    /// Resolve a single setting
    ///
    /// # Errors
    ///
    /// Returns error if the key is unknown or database operation fails
    pub fn get(
        &self,
        community_id: &str,
        conversation_id: Option<&str>,
        key: &str,
    ) -> Result<SettingValue> {
        let def = self.spec.require(key)?;
        let rows = self.overrides(community_id, conversation_id, Some(key))?;
        Ok(resolve(def, &rows, conversation_id).value)
    }

    /// Validate and store a setting override
    ///
    /// `conversation_id = None` sets the community-wide value. Nothing is written
    /// when validation fails.
    ///
    /// # Errors
    ///
    /// Returns error if the key is unknown, the value or conversation id is invalid,
    /// or database operation fails
    pub fn set(
        &self,
        community_id: &str,
        conversation_id: Option<&str>,
        key: &str,
        raw_value: &str,
    ) -> Result<SettingValue> {
        let def = self.spec.require(key)?;
        let value = def.parse(raw_value)?;
        let conversation = write_scope(conversation_id)?;

        let conn = super::conn(&self.pool)?;
        conn.execute(
            "INSERT INTO settings (community_id, conversation_id, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(community_id, conversation_id, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![
                community_id,
                conversation,
                def.key,
                value.to_string(),
                super::format_datetime(Utc::now()),
            ],
        )?;

        tracing::info!(
            community = community_id,
            conversation = ?conversation_id,
            key = def.key,
            %value,
            "setting updated"
        );

        Ok(value)
    }

    /// Remove an override so the next fallback level applies
    ///
    /// Returns whether an override existed.
    ///
    /// # Errors
    ///
    /// Returns error if the key is unknown, the conversation id is empty, or
    /// database operation fails
    pub fn unset(
        &self,
        community_id: &str,
        conversation_id: Option<&str>,
        key: &str,
    ) -> Result<bool> {
        let def = self.spec.require(key)?;
        let conversation = write_scope(conversation_id)?;
        let conn = super::conn(&self.pool)?;

        let removed = conn.execute(
            "DELETE FROM settings WHERE community_id = ?1 AND conversation_id = ?2 AND key = ?3",
            params![community_id, conversation, def.key],
        )?;

        if removed > 0 {
            tracing::info!(
                community = community_id,
                conversation = ?conversation_id,
                key = def.key,
                "setting reset"
            );
        }

        Ok(removed > 0)
    }

    /// Every known setting with its resolved value and origin
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn describe(
        &self,
        community_id: &str,
        conversation_id: Option<&str>,
    ) -> Result<Vec<ResolvedSetting>> {
        let rows = self.overrides(community_id, conversation_id, None)?;
        Ok(self
            .spec
            .defs()
            .iter()
            .map(|def| resolve(def, &rows, conversation_id))
            .collect())
    }

    /// Fully resolved map over every known key
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_all(
        &self,
        community_id: &str,
        conversation_id: Option<&str>,
    ) -> Result<ResolvedSettings> {
        Ok(self
            .describe(community_id, conversation_id)?
            .into_iter()
            .collect())
    }

    fn overrides(
        &self,
        community_id: &str,
        conversation_id: Option<&str>,
        key: Option<&str>,
    ) -> Result<Vec<OverrideRow>> {
        let conn = super::conn(&self.pool)?;

        let mut stmt = conn.prepare(
            "SELECT conversation_id, key, value FROM settings
             WHERE community_id = ?1
               AND conversation_id IN ('', ?2)
               AND (?3 IS NULL OR key = ?3)",
        )?;

        let rows = stmt
            .query_map(params![community_id, scope(conversation_id), key], |row| {
                Ok(OverrideRow {
                    conversation_id: row.get(0)?,
                    key: row.get(1)?,
                    value: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }
}

fn scope(conversation_id: Option<&str>) -> &str {
    conversation_id.unwrap_or_default()
}

/// Row key for a write; an empty conversation id would land on the community row
fn write_scope(conversation_id: Option<&str>) -> Result<&str> {
    match conversation_id {
        Some(id) if id.trim().is_empty() => Err(Error::Validation(
            "conversation id must not be empty; omit it for the community-wide value".to_string(),
        )),
        other => Ok(scope(other)),
    }
}

/// Walk conversation → community → default for one setting
fn resolve(
    def: &SettingDef,
    rows: &[OverrideRow],
    conversation_id: Option<&str>,
) -> ResolvedSetting {
    let conversation = scope(conversation_id);
    let levels = [
        (conversation, SettingSource::Conversation),
        ("", SettingSource::Community),
    ];

    for (level, source) in levels {
        if source == SettingSource::Conversation && conversation.is_empty() {
            continue;
        }

        let Some(row) = rows
            .iter()
            .find(|row| row.key == def.key && row.conversation_id == level)
        else {
            continue;
        };

        match def.parse(&row.value) {
            Ok(value) => {
                return ResolvedSetting {
                    key: def.key,
                    value,
                    source,
                };
            }
            Err(e) => {
                tracing::warn!(
                    key = def.key,
                    level = source.as_str(),
                    error = %e,
                    "ignoring stored setting"
                );
            }
        }
    }

    ResolvedSetting {
        key: def.key,
        value: def.default_value(),
        source: SettingSource::Default,
    }
}
