//! Startup configuration: the endpoint-category table, scheduler tier intervals, and the
//! small set of environment switches read by the commands.

pub mod categories;
pub mod tiers;

use std::env;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use categories::{CategoryTable, EndpointCategory};
pub use tiers::TierIntervals;

pub const CATEGORIES_ENV: &str = "RIDER_SYNC_CATEGORIES";
pub const API_TOKEN_ENV: &str = "RIDER_SYNC_API_TOKEN";
pub const SCHEDULER_ENABLED_ENV: &str = "SCHEDULER_ENABLED";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read category table {path}: {source}")]
    ReadCategories {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid category table JSON: {0}")]
    CategoriesJson(#[from] serde_json::Error),

    #[error("endpoint category `{key}` is invalid: {reason}")]
    InvalidCategory { key: String, reason: String },

    #[error("endpoint category `{0}` is defined more than once")]
    DuplicateCategory(String),

    #[error("required endpoint category `{0}` is not configured")]
    MissingCategory(String),
}

/// Loads the category table from `path`, then `RIDER_SYNC_CATEGORIES`, then the built-in table.
pub fn load_category_table(path: Option<&Path>) -> Result<CategoryTable, ConfigError> {
    let resolved = path
        .map(Path::to_path_buf)
        .or_else(|| env::var_os(CATEGORIES_ENV).map(PathBuf::from));

    match resolved {
        Some(path) => {
            tracing::info!(
                event = "category_table_loading",
                path = %path.display(),
                "loading endpoint category table"
            );
            CategoryTable::from_file(&path)
        }
        None => Ok(CategoryTable::builtin()),
    }
}

/// `SCHEDULER_ENABLED` defaults to on; `0`, `false`, `no` and `off` disable it.
pub fn scheduler_enabled_from_env() -> bool {
    parse_flag(env::var(SCHEDULER_ENABLED_ENV).ok().as_deref(), true)
}

pub fn api_token_from_env() -> Option<String> {
    env::var(API_TOKEN_ENV)
        .ok()
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn parse_flag(raw: Option<&str>, default: bool) -> bool {
    match raw.map(|value| value.trim().to_ascii_lowercase()) {
        Some(value) if matches!(value.as_str(), "0" | "false" | "no" | "off") => false,
        Some(value) if matches!(value.as_str(), "1" | "true" | "yes" | "on") => true,
        _ => default,
    }
}
