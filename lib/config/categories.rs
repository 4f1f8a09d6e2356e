use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

pub const CLUB_ROSTER: &str = "club-roster";
pub const RIDER_INDIVIDUAL: &str = "rider-individual";
pub const RIDER_BULK: &str = "rider-bulk";
pub const EVENT_DETAILS: &str = "event-details";
pub const EVENT_SIGNUPS: &str = "event-signups";
pub const EVENT_RESULTS: &str = "event-results";
pub const EVENTS_UPCOMING: &str = "events-upcoming";

/// One rate-limited class of upstream calls.
///
/// `url_template` and the participant fields are only read by the HTTP fetcher; the governor
/// needs nothing beyond the ceiling, window and penalty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCategory {
    pub key: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
    pub max_calls: u32,
    pub window_secs: u64,
    #[serde(default)]
    pub penalty_secs: u64,
    #[serde(default)]
    pub url_template: Option<String>,
    /// JSON pointer to the array of participants in a fetched item.
    #[serde(default)]
    pub participants_pointer: Option<String>,
    /// Field holding the entity id inside each participant object.
    #[serde(default)]
    pub participant_field: Option<String>,
}

impl EndpointCategory {
    pub fn new(key: &str, max_calls: u32, window: Duration, penalty: Duration) -> Self {
        Self {
            key: key.to_string(),
            friendly_name: None,
            max_calls,
            window_secs: window.as_secs(),
            penalty_secs: penalty.as_secs(),
            url_template: None,
            participants_pointer: None,
            participant_field: None,
        }
    }

    fn named(mut self, friendly_name: &str) -> Self {
        self.friendly_name = Some(friendly_name.to_string());
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn penalty(&self) -> Duration {
        Duration::from_secs(self.penalty_secs)
    }

    pub fn display_name(&self) -> &str {
        self.friendly_name.as_deref().unwrap_or(&self.key)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidCategory {
            key: self.key.clone(),
            reason: reason.to_string(),
        };
        if self.key.trim().is_empty() {
            return Err(invalid("key must not be empty"));
        }
        if self.max_calls == 0 {
            return Err(invalid("max_calls must be > 0"));
        }
        if self.window_secs == 0 {
            return Err(invalid("window_secs must be > 0"));
        }
        if let Some(template) = &self.url_template {
            if !template.contains("{key}") {
                return Err(invalid("url_template must contain a {key} placeholder"));
            }
        }
        Ok(())
    }
}

/// Immutable set of endpoint categories loaded at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CategoryTable {
    categories: Vec<EndpointCategory>,
}

impl CategoryTable {
    pub fn new(categories: Vec<EndpointCategory>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for category in &categories {
            category.validate()?;
            if !seen.insert(category.key.as_str()) {
                return Err(ConfigError::DuplicateCategory(category.key.clone()));
            }
        }
        Ok(Self { categories })
    }

    /// Documented limits of the upstream racing API.
    pub fn builtin() -> Self {
        let minutes = |m: u64| Duration::from_secs(m * 60);
        let seconds = Duration::from_secs;
        Self {
            categories: vec![
                EndpointCategory::new(CLUB_ROSTER, 1, minutes(60), minutes(5))
                    .named("Club Members"),
                EndpointCategory::new(RIDER_INDIVIDUAL, 5, minutes(1), seconds(30))
                    .named("Individual Rider"),
                EndpointCategory::new(RIDER_BULK, 1, minutes(15), minutes(2))
                    .named("Bulk Riders"),
                EndpointCategory::new(EVENT_DETAILS, 1, minutes(1), seconds(30))
                    .named("Event Details"),
                EndpointCategory::new(EVENT_SIGNUPS, 1, minutes(1), seconds(30))
                    .named("Event Signups"),
                EndpointCategory::new(EVENT_RESULTS, 1, minutes(1), seconds(30))
                    .named("Event Results"),
                EndpointCategory::new(EVENTS_UPCOMING, 1, minutes(1), seconds(30))
                    .named("Upcoming Events"),
            ],
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let categories: Vec<EndpointCategory> = serde_json::from_str(raw)?;
        Self::new(categories)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadCategories {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn get(&self, key: &str) -> Option<&EndpointCategory> {
        self.categories.iter().find(|category| category.key == key)
    }

    pub fn require(&self, key: &str) -> Result<&EndpointCategory, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingCategory(key.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointCategory> {
        self.categories.iter()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_matches_documented_limits() {
        let table = CategoryTable::builtin();
        assert_eq!(table.len(), 7);

        let club = table.require(CLUB_ROSTER).expect("club roster present");
        assert_eq!(club.max_calls, 1);
        assert_eq!(club.window(), Duration::from_secs(3600));
        assert_eq!(club.penalty(), Duration::from_secs(300));

        let rider = table.require(RIDER_INDIVIDUAL).expect("rider present");
        assert_eq!(rider.max_calls, 5);
        assert_eq!(rider.window(), Duration::from_secs(60));
        assert_eq!(rider.display_name(), "Individual Rider");
    }

    #[test]
    fn parses_json_table_with_optional_http_fields() {
        let table = CategoryTable::from_json_str(
            r#"[
                {"key": "event-results", "max_calls": 2, "window_secs": 60, "penalty_secs": 10,
                 "url_template": "https://api.example/results/{key}",
                 "participants_pointer": "/results", "participant_field": "riderId"},
                {"key": "rider-individual", "max_calls": 5, "window_secs": 60}
            ]"#,
        )
        .expect("table parses");

        let results = table.get("event-results").expect("results category");
        assert_eq!(results.participants_pointer.as_deref(), Some("/results"));
        assert_eq!(table.get("rider-individual").map(|c| c.penalty_secs), Some(0));
        assert!(table.get("club-roster").is_none());
    }

    #[test]
    fn rejects_zero_ceiling_and_duplicates() {
        let zero = CategoryTable::from_json_str(
            r#"[{"key": "event-results", "max_calls": 0, "window_secs": 60}]"#,
        );
        assert!(matches!(zero, Err(ConfigError::InvalidCategory { .. })));

        let duplicate = CategoryTable::new(vec![
            EndpointCategory::new("a", 1, Duration::from_secs(1), Duration::ZERO),
            EndpointCategory::new("a", 2, Duration::from_secs(1), Duration::ZERO),
        ]);
        assert!(matches!(duplicate, Err(ConfigError::DuplicateCategory(key)) if key == "a"));
    }

    #[test]
    fn require_reports_missing_category() {
        let table = CategoryTable::builtin();
        let err = table.require("podcasts").expect_err("unknown category");
        assert_eq!(
            err.to_string(),
            "required endpoint category `podcasts` is not configured"
        );
    }
}
