/*
 * SPDX-FileCopyrightText: 2026 Unifeed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::Serialize;

fn now_ms_u64() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Telemetry event published to downstream desktop consumers.
///
/// `auth_expired` is the only kind consumers are expected to surface
/// prominently; the rest is informational.
#[derive(Clone, Debug, Serialize)]
pub struct ServiceEvent {
    pub kind: String,
    pub ts_ms: u64,
    pub account_id: Option<String>,
    pub detail: Option<String>,
}

impl ServiceEvent {
    pub fn new(kind: &str, account_id: Option<String>, detail: Option<String>) -> Self {
        Self {
            kind: kind.to_string(),
            ts_ms: now_ms_u64(),
            account_id,
            detail,
        }
    }
}
