//! Small injected capabilities: secrets, quiet hours, permissions.

use chrono::Timelike;
use std::collections::{HashMap, HashSet};

use crate::identity::QuietHoursConfig;

/// Secret lookup scoped by identity.
pub trait SecretsProvider: Send + Sync {
    fn get(&self, identity: &str, key: &str) -> Option<String>;
}

/// Reads `PERSONA_SECRET_<IDENTITY>_<KEY>`, falling back to `<KEY>`.
///
/// Names are upper-cased and non-alphanumerics become `_`.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretsProvider;

impl EnvSecretsProvider {
    pub fn var_names(identity: &str, key: &str) -> [String; 2] {
        [
            format!("PERSONA_SECRET_{}_{}", env_segment(identity), env_segment(key)),
            env_segment(key),
        ]
    }
}

fn env_segment(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl SecretsProvider for EnvSecretsProvider {
    fn get(&self, identity: &str, key: &str) -> Option<String> {
        Self::var_names(identity, key)
            .into_iter()
            .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
    }
}

/// Fixed in-memory secrets keyed by `(identity, key)`.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretsProvider {
    secrets: HashMap<(String, String), String>,
}

impl StaticSecretsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, identity: &str, key: &str, value: impl Into<String>) -> Self {
        self.secrets
            .insert((identity.to_string(), key.to_string()), value.into());
        self
    }
}

impl SecretsProvider for StaticSecretsProvider {
    fn get(&self, identity: &str, key: &str) -> Option<String> {
        self.secrets
            .get(&(identity.to_string(), key.to_string()))
            .cloned()
    }
}

pub trait QuietHours: Send + Sync {
    fn is_quiet_hours(&self) -> bool;
}

/// `[start_hour, end_hour)` in local time, wrapping past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHoursWindow {
    start_hour: u32,
    end_hour: u32,
}

impl QuietHoursWindow {
    pub fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour,
            end_hour,
        }
    }

    /// A window that is never quiet.
    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    pub fn contains_hour(&self, hour: u32) -> bool {
        match self.start_hour.cmp(&self.end_hour) {
            std::cmp::Ordering::Equal => false,
            std::cmp::Ordering::Less => hour >= self.start_hour && hour < self.end_hour,
            std::cmp::Ordering::Greater => hour >= self.start_hour || hour < self.end_hour,
        }
    }
}

impl From<Option<QuietHoursConfig>> for QuietHoursWindow {
    fn from(config: Option<QuietHoursConfig>) -> Self {
        config.map_or_else(Self::disabled, |q| Self::new(q.start_hour, q.end_hour))
    }
}

impl QuietHours for QuietHoursWindow {
    fn is_quiet_hours(&self) -> bool {
        self.contains_hour(chrono::Local::now().hour())
    }
}

pub trait PermissionChecker: Send + Sync {
    fn is_admin(&self, user_id: &str) -> bool;
}

/// Admin allow-list from the identity file.
#[derive(Debug, Clone, Default)]
pub struct AdminPermissions {
    admins: HashSet<String>,
}

impl AdminPermissions {
    pub fn new(admins: impl IntoIterator<Item = String>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
        }
    }
}

impl PermissionChecker for AdminPermissions {
    fn is_admin(&self, user_id: &str) -> bool {
        self.admins.contains(user_id)
    }
}
