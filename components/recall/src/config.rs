/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Client configuration. Precedence is flag > environment > built-in
//! default: callers (the CLI, an MCP adapter) set fields explicitly for
//! anything passed as a flag, and `from_env` fills the rest from the
//! environment. Unset Engram settings mean offline; local operations never
//! need the network.

use std::path::PathBuf;

use crate::registry::StoreRegistry;

pub const ENV_DB_PATH: &str = "RECALL_DB_PATH";
pub const ENV_ENGRAM_URL: &str = "ENGRAM_URL";
pub const ENV_API_KEY: &str = "ENGRAM_API_KEY";
pub const ENV_SOURCE_ID: &str = "RECALL_SOURCE_ID";
pub const ENV_STORE_ID: &str = "ENGRAM_STORE";

#[derive(Debug, Clone, Default)]
pub struct RecallConfig {
    /// Explicit database file, bypassing store resolution entirely.
    pub lore_path: Option<PathBuf>,
    /// Engram base URL; `None` is offline mode.
    pub engram_url: Option<String>,
    pub api_key: Option<String>,
    /// Force the persisted client identity (rarely useful outside tests
    /// and managed fleets).
    pub source_id: Option<String>,
    /// Store id; resolved against the registry when no explicit path is
    /// given.
    pub store_id: Option<String>,
    /// Root for the multi-store layout; defaults to `$HOME/.recall`.
    pub stores_root: Option<PathBuf>,
    /// Emit structured JSON instead of human-readable output. Consumed by
    /// the CLI layer; carried here so one struct describes a session.
    pub json_output: bool,
}

impl RecallConfig {
    /// A config populated from the environment alone. Callers layer flag
    /// values on top of the returned struct.
    pub fn from_env() -> Self {
        Self {
            lore_path: env_nonempty(ENV_DB_PATH).map(PathBuf::from),
            engram_url: env_nonempty(ENV_ENGRAM_URL),
            api_key: env_nonempty(ENV_API_KEY),
            source_id: env_nonempty(ENV_SOURCE_ID),
            store_id: env_nonempty(ENV_STORE_ID),
            stores_root: None,
            json_output: false,
        }
    }

    pub fn registry(&self) -> StoreRegistry {
        StoreRegistry::new(
            self.stores_root
                .clone()
                .unwrap_or_else(StoreRegistry::default_root),
        )
    }

    pub fn is_offline(&self) -> bool {
        self.engram_url.is_none()
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}
