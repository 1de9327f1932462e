use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::filter::Expression;
use crate::project::{Feature, Notification, ProjectDefinition, ReopenPolicy};

/// Sighting timeouts shorter than this make the sweep evict aircraft
/// between two ordinary position reports
pub const MIN_SIGHTING_TIMEOUT_SECS: u64 = 10;

/// Runtime settings of the tracking engine
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub workers: usize,
    pub sighting_timeout: chrono::Duration,
    pub sweep_interval: std::time::Duration,
    /// Consecutive reports a new on-ground value must exceed before it is committed
    pub on_ground_confirmations: u32,
    /// Endpoints above this altitude are not reverse geocoded
    pub geocode_max_altitude_ft: i32,
    pub path_batch_size: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            sighting_timeout: chrono::Duration::seconds(default_sighting_timeout() as i64),
            sweep_interval: std::time::Duration::from_secs(default_sweep_interval()),
            on_ground_confirmations: default_on_ground_confirmations(),
            geocode_max_altitude_ft: default_geocode_max_altitude(),
            path_batch_size: default_path_batch_size(),
        }
    }
}

/// Whole seconds from the config file as a signed duration
fn duration_secs(field: &str, secs: u64) -> Result<chrono::Duration> {
    match i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds) {
        Some(duration) => Ok(duration),
        None => bail!("{} is out of range, got {}", field, secs),
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("tracker.workers must be at least 1");
        }
        if self.sighting_timeout < chrono::Duration::seconds(MIN_SIGHTING_TIMEOUT_SECS as i64) {
            bail!(
                "tracker.sighting_timeout_secs must be at least {} seconds, got {}",
                MIN_SIGHTING_TIMEOUT_SECS,
                self.sighting_timeout.num_seconds()
            );
        }
        if self.on_ground_confirmations == 0 {
            bail!("tracker.on_ground_confirmations must be positive");
        }
        if self.sweep_interval.is_zero() {
            bail!("tracker.sweep_interval_secs must be positive");
        }
        if self.path_batch_size == 0 {
            bail!("tracker.path_batch_size must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_sighting_timeout")]
    pub sighting_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_on_ground_confirmations")]
    pub on_ground_confirmations: u32,
    #[serde(default = "default_geocode_max_altitude")]
    pub geocode_max_altitude_ft: i32,
    #[serde(default = "default_path_batch_size")]
    pub path_batch_size: usize,
}

fn default_workers() -> usize {
    64
}

fn default_sighting_timeout() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_on_ground_confirmations() -> u32 {
    3
}

fn default_geocode_max_altitude() -> i32 {
    5000
}

fn default_path_batch_size() -> usize {
    500
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            sighting_timeout_secs: default_sighting_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            on_ground_confirmations: default_on_ground_confirmations(),
            geocode_max_altitude_ft: default_geocode_max_altitude(),
            path_batch_size: default_path_batch_size(),
        }
    }
}

impl TryFrom<TrackerSection> for TrackerConfig {
    type Error = anyhow::Error;

    fn try_from(s: TrackerSection) -> Result<Self> {
        Ok(Self {
            workers: s.workers,
            sighting_timeout: duration_secs(
                "tracker.sighting_timeout_secs",
                s.sighting_timeout_secs,
            )?,
            sweep_interval: std::time::Duration::from_secs(s.sweep_interval_secs),
            on_ground_confirmations: s.on_ground_confirmations,
            geocode_max_altitude_ft: s.geocode_max_altitude_ft,
            path_batch_size: s.path_batch_size,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeocoderSection {
    #[serde(default = "default_nominatim_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_nominatim_url() -> String {
    "https://nominatim.openstreetmap.org".to_string()
}

fn default_user_agent() -> String {
    format!("skywatch/{}", env!("CARGO_PKG_VERSION"))
}

/// SMTP credentials come from the environment, see [`crate::email::EmailService::new`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmailSection {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReopenSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub interval_secs: u64,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectSection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub notifications: Vec<Notification>,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reopen: Option<ReopenSection>,
}

impl ProjectSection {
    pub fn definition(&self) -> Result<ProjectDefinition> {
        let filter = match self.filter.as_deref().map(str::trim) {
            Some(source) if !source.is_empty() => {
                let expression = Expression::parse(source).with_context(|| {
                    format!("Invalid filter for project '{}': {}", self.name, source)
                })?;
                Some(Arc::new(expression) as Arc<dyn crate::filter::Predicate>)
            }
            _ => None,
        };

        let reopen = match &self.reopen {
            Some(r) if r.enabled => {
                if r.interval_secs == 0 {
                    bail!(
                        "Project '{}' enables reopen with a zero interval",
                        self.name
                    );
                }
                let interval = duration_secs("reopen.interval_secs", r.interval_secs)
                    .with_context(|| format!("Invalid reopen for project '{}'", self.name))?;
                ReopenPolicy::within(interval)
            }
            _ => ReopenPolicy::disabled(),
        };

        Ok(ProjectDefinition {
            name: self.name.clone(),
            filter,
            features: self.features.iter().copied().collect(),
            notifications: self.notifications.iter().copied().collect(),
            recipients: self.recipients.clone(),
            reopen,
        })
    }
}

/// Top-level configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerFileConfig {
    #[serde(default)]
    pub tracker: TrackerSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geocoder: Option<GeocoderSection>,
    #[serde(default)]
    pub email: EmailSection,
    #[serde(default)]
    pub projects: Vec<ProjectSection>,
}

impl TrackerFileConfig {
    /// Load and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        Self::parse(&contents).with_context(|| format!("Invalid config {:?}", path))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: TrackerFileConfig =
            toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.tracker_config()?.validate()?;

        if self.projects.is_empty() {
            bail!("at least one [[projects]] entry is required");
        }

        let mut names = HashSet::new();
        for project in &self.projects {
            if project.name.trim().is_empty() {
                bail!("project names must not be empty");
            }
            if !names.insert(project.name.as_str()) {
                bail!("duplicate project name '{}'", project.name);
            }
            project.definition()?;
        }
        Ok(())
    }

    pub fn tracker_config(&self) -> Result<TrackerConfig> {
        self.tracker.clone().try_into()
    }

    /// Project definitions in declaration order
    pub fn project_definitions(&self) -> Result<Vec<ProjectDefinition>> {
        self.projects.iter().map(ProjectSection::definition).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[tracker]
workers = 8
sighting_timeout_secs = 30
on_ground_confirmations = 2

[geocoder]
base_url = "http://localhost:8080"

[[projects]]
name = "heathrow"
filter = "state.altitude < 10000"
features = ["track-callsigns", "track-flight-path", "geocode-endpoints"]
notifications = ["map-produced"]
recipients = ["ops@example.com"]

[projects.reopen]
interval_secs = 300

[[projects]]
name = "everything"
"#;

    #[test]
    fn test_parse_sample() {
        let config = TrackerFileConfig::parse(SAMPLE).unwrap();
        let tracker = config.tracker_config().unwrap();
        assert_eq!(tracker.workers, 8);
        assert_eq!(tracker.sighting_timeout, chrono::Duration::seconds(30));
        assert_eq!(tracker.sweep_interval, std::time::Duration::from_secs(5));
        assert_eq!(tracker.on_ground_confirmations, 2);

        let projects = config.project_definitions().unwrap();
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].name, "heathrow");
        assert!(projects[0].filter.is_some());
        assert!(projects[0].features.contains(&Feature::TrackFlightPath));
        assert!(projects[0].reopen.enabled);
        assert_eq!(projects[0].reopen.interval, chrono::Duration::seconds(300));
        assert!(projects[1].filter.is_none());
        assert!(!projects[1].reopen.enabled);
    }

    #[test]
    fn test_defaults() {
        let config = TrackerConfig::default();
        assert_eq!(config.workers, 64);
        assert_eq!(config.sweep_interval, std::time::Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_short_timeout() {
        let err = TrackerFileConfig::parse(
            "[tracker]\nsighting_timeout_secs = 5\n[[projects]]\nname = \"a\"\n",
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("sighting_timeout_secs"));
    }

    #[test]
    fn test_rejects_zero_threshold() {
        assert!(
            TrackerFileConfig::parse(
                "[tracker]\non_ground_confirmations = 0\n[[projects]]\nname = \"a\"\n"
            )
            .is_err()
        );
    }

    #[test]
    fn test_rejects_duplicate_project_names() {
        let err = TrackerFileConfig::parse("[[projects]]\nname = \"a\"\n[[projects]]\nname = \"a\"\n")
            .unwrap_err();
        assert!(format!("{:#}", err).contains("duplicate"));
    }

    #[test]
    fn test_rejects_unknown_feature() {
        assert!(
            TrackerFileConfig::parse("[[projects]]\nname = \"a\"\nfeatures = [\"teleport\"]\n")
                .is_err()
        );
    }

    #[test]
    fn test_rejects_bad_filter() {
        let err = TrackerFileConfig::parse(
            "[[projects]]\nname = \"a\"\nfilter = \"state.nonsense > 1\"\n",
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid filter"));
    }

    #[test]
    fn test_rejects_zero_reopen_interval() {
        assert!(
            TrackerFileConfig::parse(
                "[[projects]]\nname = \"a\"\n[projects.reopen]\ninterval_secs = 0\n"
            )
            .is_err()
        );
    }

    #[test]
    fn test_rejects_out_of_range_timeout() {
        let err = TrackerFileConfig::parse(
            "[tracker]\nsighting_timeout_secs = 100000000000000000\n[[projects]]\nname = \"a\"\n",
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("out of range"));

        let section = TrackerSection {
            sighting_timeout_secs: u64::MAX,
            ..TrackerSection::default()
        };
        assert!(TrackerConfig::try_from(section).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_reopen_interval() {
        let err = TrackerFileConfig::parse(
            "[[projects]]\nname = \"a\"\n[projects.reopen]\ninterval_secs = 100000000000000000\n",
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("reopen.interval_secs"));
    }

    #[test]
    fn test_default_matches_empty_section() {
        let from_section = TrackerConfig::try_from(TrackerSection::default()).unwrap();
        assert_eq!(from_section, TrackerConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skywatch.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = TrackerFileConfig::load(&path).unwrap();
        assert_eq!(config.projects.len(), 2);

        assert!(TrackerFileConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
