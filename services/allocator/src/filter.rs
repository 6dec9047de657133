//! Label predicates used to select devices.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A `(label group, label)` pair a device must carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFilter {
    pub group: String,
    pub label: String,
}

impl DeviceFilter {
    pub fn new(group: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            label: label.into(),
        }
    }

    /// Apply `f` to both the group and the label.
    pub fn map(&self, f: impl Fn(&str) -> String) -> Self {
        Self {
            group: f(&self.group),
            label: f(&self.label),
        }
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.group, self.label)
    }
}

/// Parses `GROUP=LABEL`. The label may itself contain `=`.
impl FromStr for DeviceFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group, label) = s
            .split_once('=')
            .ok_or_else(|| format!("expected GROUP=LABEL, got `{}`", s))?;

        let group = group.trim();
        let label = label.trim();
        if group.is_empty() || label.is_empty() {
            return Err(format!("filter `{}` has an empty group or label", s));
        }

        Ok(Self::new(group, label))
    }
}
