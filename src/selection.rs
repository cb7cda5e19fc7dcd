use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{Datelike, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::calendar::EventInstant;
use crate::graph::{GraphNode, NodeKind};

/// Highlight colors indexed by weekday, Sunday first.
pub const HIGHLIGHT_PALETTE: [&str; 7] = [
    "#e53e3e", "#dd6b20", "#d69e2e", "#38a169", "#3182ce", "#805ad5", "#d53f8c",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionPolicy {
    /// Same weekday as the reference date.
    #[default]
    Weekday,
    /// Same calendar date as the reference date.
    Date,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::Weekday => "weekday",
            SelectionPolicy::Date => "date",
        }
    }

    fn matches(&self, node_date: NaiveDate, reference: NaiveDate) -> bool {
        match self {
            SelectionPolicy::Weekday => day_of_week(node_date) == day_of_week(reference),
            SelectionPolicy::Date => node_date == reference,
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "weekday" | "day-of-week" => Ok(SelectionPolicy::Weekday),
            "date" | "exact" => Ok(SelectionPolicy::Date),
            other => bail!("unknown selection policy '{other}'; expected 'weekday' or 'date'"),
        }
    }
}

/// 0 (Sunday) through 6 (Saturday).
pub fn day_of_week(date: NaiveDate) -> u32 {
    date.weekday().num_days_from_sunday()
}

/// Calendar day of `instant` in `zone`; `None` for an invalid instant.
pub fn calendar_date(instant: &EventInstant, zone: FixedOffset) -> Option<NaiveDate> {
    instant.local_date(zone)
}

pub fn highlight_for(weekday: u32) -> Option<&'static str> {
    HIGHLIGHT_PALETTE.get(weekday as usize).copied()
}

/// Recomputes `selected` and `highlight` for every node and touches nothing
/// else. Root nodes and events without a valid start are never selected.
pub fn apply_selection(
    nodes: &mut [GraphNode],
    reference: Option<NaiveDate>,
    policy: SelectionPolicy,
    zone: FixedOffset,
) {
    for node in nodes.iter_mut() {
        let node_date = match node.kind {
            NodeKind::Root => None,
            NodeKind::Event => calendar_date(&node.start, zone),
        };

        node.highlight = node_date
            .and_then(|date| highlight_for(day_of_week(date)))
            .map(str::to_string);
        node.selected = match (node_date, reference) {
            (Some(date), Some(reference)) => policy.matches(date, reference),
            _ => false,
        };
    }
}
