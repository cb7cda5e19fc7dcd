use std::path::PathBuf;

use chrono::{FixedOffset, Local, Offset};

use crate::layout::LayoutConfig;
use crate::selection::SelectionPolicy;
use crate::store::FileStore;

const BACKEND_URL_DEFAULT: &str = "http://127.0.0.1:8000";
const HISTORY_LIMIT_DEFAULT: usize = 50;
const HISTORY_LIMIT_MIN: usize = 2;
const SCHEDULE_NAME_DEFAULT: &str = "Classes";

#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Base URL of the service that turns `.ics` files into JSON.
    pub backend_url: String,
    pub data_dir: PathBuf,
    pub history_limit: usize,
    pub selection_policy: SelectionPolicy,
    /// Offset used wherever "local time" matters.
    pub zone: FixedOffset,
    /// Label of the root node in grouped builds.
    pub schedule_name: String,
    pub layout: LayoutConfig,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

impl WorkspaceConfig {
    /// Builds a config from an arbitrary variable source. Unset or unparsable
    /// values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let backend_url = lookup("ICSFLOW_BACKEND_URL")
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| BACKEND_URL_DEFAULT.to_string());

        let data_dir = lookup("ICSFLOW_DATA_DIR")
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(FileStore::default_dir);

        let history_limit = lookup("ICSFLOW_HISTORY_LIMIT")
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .unwrap_or(HISTORY_LIMIT_DEFAULT)
            .max(HISTORY_LIMIT_MIN);

        let selection_policy = lookup("ICSFLOW_SELECTION_POLICY")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default();

        let zone = lookup("ICSFLOW_UTC_OFFSET_MINUTES")
            .and_then(|raw| raw.trim().parse::<i32>().ok())
            .and_then(|minutes| minutes.checked_mul(60))
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Local::now().offset().fix());

        let schedule_name = lookup("ICSFLOW_SCHEDULE_NAME")
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| SCHEDULE_NAME_DEFAULT.to_string());

        Self {
            backend_url,
            data_dir,
            history_limit,
            selection_policy,
            zone,
            schedule_name,
            layout: LayoutConfig::default(),
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_zone(mut self, zone: FixedOffset) -> Self {
        self.zone = zone;
        self
    }
}
