/*
 * SPDX-FileCopyrightText: 2026 Unifeed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::account::Account;
use std::time::Duration;

/// Service configuration, decoded from the JSON config file. Unset values
/// fall back to the defaults documented on the accessors; intervals given in
/// minutes are clamped to the configured range.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub data_dir: Option<String>,
    /// Accounts known at startup. The account provider may add and remove
    /// more over the control surface while the service runs.
    #[serde(default)]
    pub accounts: Vec<Account>,

    #[serde(default)]
    pub refresh_interval_mins: Option<u64>,
    #[serde(default)]
    pub refresh_clamp_min_mins: Option<u64>,
    #[serde(default)]
    pub refresh_clamp_max_mins: Option<u64>,
    #[serde(default)]
    pub contacts_interval_secs: Option<u64>,
    #[serde(default)]
    pub avatar_expiry_interval_secs: Option<u64>,
    #[serde(default)]
    pub avatar_max_age_secs: Option<u64>,
    #[serde(default)]
    pub persist_interval_secs: Option<u64>,
    #[serde(default)]
    pub startup_delay_secs: Option<u64>,
    #[serde(default)]
    pub op_timeout_secs: Option<u64>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_rows: Option<usize>,

    #[serde(default)]
    pub shorten_urls: Option<bool>,
    #[serde(default)]
    pub urlshorter: Option<String>,
    /// Notification verbosity: "all", "none", or anything else for the
    /// default (mentions + private messages only).
    #[serde(default)]
    pub notifications: Option<String>,

    /// Register the built-in mock protocol (test mode / demos).
    #[serde(default)]
    pub mock_protocol: Option<bool>,
}

fn default_bind() -> String {
    "127.0.0.1:8960".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            data_dir: None,
            accounts: Vec::new(),
            refresh_interval_mins: None,
            refresh_clamp_min_mins: None,
            refresh_clamp_max_mins: None,
            contacts_interval_secs: None,
            avatar_expiry_interval_secs: None,
            avatar_max_age_secs: None,
            persist_interval_secs: None,
            startup_delay_secs: None,
            op_timeout_secs: None,
            http_timeout_secs: None,
            max_rows: None,
            shorten_urls: None,
            urlshorter: None,
            notifications: None,
            mock_protocol: None,
        }
    }
}

impl ServiceConfig {
    /// Refresh cadence. A user-set interval in minutes is clamped to the
    /// configured range (default [5, 30]); with nothing set the service
    /// refreshes hourly, relying on the immediate first run at startup.
    pub fn refresh_interval(&self) -> Duration {
        match self.refresh_interval_mins {
            Some(mins) => {
                let lo = self.refresh_clamp_min_mins.unwrap_or(5).max(1);
                let hi = self.refresh_clamp_max_mins.unwrap_or(30).max(lo);
                Duration::from_secs(mins.clamp(lo, hi) * 60)
            }
            None => Duration::from_secs(3600),
        }
    }

    pub fn contacts_interval(&self) -> Duration {
        Duration::from_secs(self.contacts_interval_secs.unwrap_or(24 * 3600).max(60))
    }

    pub fn avatar_expiry_interval(&self) -> Duration {
        Duration::from_secs(
            self.avatar_expiry_interval_secs
                .unwrap_or(7 * 24 * 3600)
                .max(60),
        )
    }

    pub fn avatar_max_age(&self) -> Duration {
        Duration::from_secs(
            self.avatar_max_age_secs
                .unwrap_or(crate::avatar::DEFAULT_FRESHNESS.as_secs())
                .max(60),
        )
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs.unwrap_or(300).max(30))
    }

    /// Delay before the first cycle of each kind after process start.
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs.unwrap_or(10))
    }

    /// Hard per-call bound on a single protocol operation.
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs.unwrap_or(120).clamp(5, 600))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.unwrap_or(30).clamp(5, 120))
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows.unwrap_or(2000).max(100)
    }

    pub fn shorten_urls(&self) -> bool {
        self.shorten_urls.unwrap_or(false)
    }

    pub fn urlshorter(&self) -> &str {
        self.urlshorter.as_deref().unwrap_or("")
    }

    pub fn notify_mode(&self) -> NotifyMode {
        match self.notifications.as_deref() {
            Some("all") => NotifyMode::All,
            Some("none") => NotifyMode::None,
            _ => NotifyMode::Relevant,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMode {
    All,
    None,
    /// Mentions and private messages only.
    Relevant,
}

impl NotifyMode {
    pub fn wants(&self, stream: &str) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::Relevant => matches!(stream, "mentions" | "private"),
        }
    }
}
