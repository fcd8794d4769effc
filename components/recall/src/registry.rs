/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Multi-store layout and lifecycle. Every store lives at
//! `<root>/stores/<encoded-id>/lore.db`; ids are lowercase slash-separated
//! segments and `/` is encoded as `__` on disk. The id `default` is
//! protected: it always resolves, is never created by user command, and
//! can never be deleted.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use interrupt_support::NeverInterrupts;

use crate::config;
use crate::db::LoreDb;
use crate::error::*;
use crate::store::LoreStore;
use crate::sync::EngramClient;
use crate::util;
use sql_support::ConnExt;

pub const DEFAULT_STORE_ID: &str = "default";

pub(crate) const STORES_DIR: &str = "stores";
pub(crate) const DB_FILE_NAME: &str = "lore.db";

const MAX_SEGMENTS: usize = 4;
const MAX_SEGMENT_LEN: usize = 64;

/// What `list` reports for each store it can open. Unreadable entries are
/// skipped entirely.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreListing {
    pub id: String,
    pub lore_count: u64,
    pub description: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

pub struct StoreRegistry {
    root: PathBuf,
}

impl StoreRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The default root: `$HOME/.recall`, or `./.recall` when `HOME` is
    /// unset (minimal containers).
    pub fn default_root() -> PathBuf {
        match std::env::var_os("HOME") {
            Some(home) if !home.is_empty() => PathBuf::from(home).join(".recall"),
            _ => PathBuf::from(".recall"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolution precedence: explicit value (a `--store` flag) beats the
    /// `ENGRAM_STORE` environment variable beats `default`. The winner is
    /// validated either way.
    pub fn resolve(&self, explicit: Option<&str>) -> Result<String> {
        let id = match explicit {
            Some(id) => id.to_string(),
            None => match std::env::var(config::ENV_STORE_ID) {
                Ok(id) if !id.is_empty() => id,
                _ => DEFAULT_STORE_ID.to_string(),
            },
        };
        validate_store_id(&id)?;
        Ok(id)
    }

    pub fn store_path(&self, id: &str) -> PathBuf {
        self.root
            .join(STORES_DIR)
            .join(encode_store_id(id))
            .join(DB_FILE_NAME)
    }

    /// Open (creating if needed) the store `id`.
    pub fn open(&self, id: &str, source_id: Option<&str>) -> Result<LoreStore> {
        validate_store_id(id)?;
        LoreStore::open_with_source_id(self.store_path(id), source_id)
    }

    /// Create a new named store. The reserved id cannot be created by user
    /// command, and an existing directory is a conflict.
    pub fn create(&self, id: &str, description: Option<&str>) -> Result<PathBuf> {
        validate_store_id(id)?;
        if id == DEFAULT_STORE_ID {
            return Err(Error::InvalidStoreId {
                id: id.to_string(),
                reason: "this id is reserved",
            });
        }
        let path = self.store_path(id);
        if path.parent().map(Path::exists).unwrap_or(false) {
            return Err(Error::StoreExists(id.to_string()));
        }
        let store = LoreStore::open(&path)?;
        if description.is_some() {
            store.set_description(description)?;
        }
        store.close();
        log::info!("created store {id:?}");
        Ok(path)
    }

    /// Scan the root for openable stores. Anything that fails to open or
    /// read is skipped without failing the listing.
    pub fn list(&self) -> Result<Vec<StoreListing>> {
        let stores_dir = self.root.join(STORES_DIR);
        let mut listings = Vec::new();
        let dir_entries = match std::fs::read_dir(&stores_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(listings),
        };
        for dir_entry in dir_entries.flatten() {
            let encoded = dir_entry.file_name().to_string_lossy().into_owned();
            let id = decode_store_id(&encoded);
            let db_path = dir_entry.path().join(DB_FILE_NAME);
            match read_listing(&db_path, &id) {
                Ok(listing) => listings.push(listing),
                Err(e) => {
                    log::debug!("skipping unreadable store {id:?}: {e}");
                }
            }
        }
        listings.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(listings)
    }

    /// Delete a local store (and best-effort its remote counterpart when
    /// Engram is configured). Refuses the reserved id, and refuses to do
    /// anything without explicit confirmation. Remote failures are logged
    /// but never block the local deletion.
    pub fn delete(
        &self,
        id: &str,
        confirmed: bool,
        engram: Option<&EngramClient>,
    ) -> Result<()> {
        validate_store_id(id)?;
        if id == DEFAULT_STORE_ID {
            return Err(Error::InvalidStoreId {
                id: id.to_string(),
                reason: "the default store cannot be deleted",
            });
        }
        if !confirmed {
            return Err(Error::DeleteNotConfirmed(id.to_string()));
        }
        let dir = self.store_path(id);
        let dir = dir.parent().expect("store path always has a parent");
        if !dir.exists() {
            return Err(Error::StoreNotFound(id.to_string()));
        }

        if let Some(client) = engram {
            if let Err(e) = client.delete_store(id, &NeverInterrupts) {
                log::warn!("remote delete of {id:?} failed (continuing locally): {e}");
            }
        }

        std::fs::remove_dir_all(dir)?;
        log::info!("deleted store {id:?}");
        Ok(())
    }
}

fn read_listing(db_path: &Path, id: &str) -> Result<StoreListing> {
    if !db_path.exists() {
        return Err(Error::StoreNotFound(id.to_string()));
    }
    let db = LoreDb::open(db_path)?;
    let lore_count = db.stats()?.lore_count;
    let description = db.description()?;
    let updated_at: Option<String> = db.conn_ext_query_one(
        "SELECT MAX(updated_at) FROM lore_entries WHERE deleted_at IS NULL",
    )?;
    Ok(StoreListing {
        id: id.to_string(),
        lore_count,
        description,
        updated_at: updated_at.as_deref().and_then(util::parse_timestamp),
    })
}

/// `/` nests stores logically but not on disk.
pub fn encode_store_id(id: &str) -> String {
    id.replace('/', "__")
}

pub fn decode_store_id(encoded: &str) -> String {
    encoded.replace("__", "/")
}

/// Validate a store id: 1-4 slash-separated segments, each 1-64 chars of
/// `[a-z0-9-]`, starting and ending alphanumeric, with no consecutive
/// hyphens.
pub fn validate_store_id(id: &str) -> Result<()> {
    let fail = |reason: &'static str| {
        Err(Error::InvalidStoreId {
            id: id.to_string(),
            reason,
        })
    };
    if id.is_empty() {
        return fail("id is empty");
    }
    let segments: Vec<&str> = id.split('/').collect();
    if segments.len() > MAX_SEGMENTS {
        return fail("too many segments (max 4)");
    }
    for segment in segments {
        if segment.is_empty() {
            return fail("empty segment");
        }
        if segment.len() > MAX_SEGMENT_LEN {
            return fail("segment longer than 64 chars");
        }
        if !segment
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return fail("segments may only contain a-z, 0-9 and hyphens");
        }
        if segment.starts_with('-') || segment.ends_with('-') {
            return fail("segments must start and end alphanumeric");
        }
        if segment.contains("--") {
            return fail("segments may not contain consecutive hyphens");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_store_id() {
        for good in [
            "default",
            "my-project",
            "team/billing",
            "a/b/c/d",
            "x",
            "v2-api",
        ] {
            validate_store_id(good).unwrap_or_else(|e| panic!("{good:?} should be valid: {e}"));
        }
        for bad in [
            "",
            "UPPER",
            "spaces in id",
            "-leading",
            "trailing-",
            "double--hyphen",
            "a/b/c/d/e",
            "with/empty//segment",
            "emoji-😍",
        ] {
            assert!(
                matches!(validate_store_id(bad), Err(Error::InvalidStoreId { .. })),
                "{bad:?} should be invalid"
            );
        }
        let long = "a".repeat(65);
        assert!(validate_store_id(&long).is_err());
    }

    #[test]
    fn test_encode_decode() {
        assert_eq!(encode_store_id("team/billing"), "team__billing");
        assert_eq!(decode_store_id("team__billing"), "team/billing");
        assert_eq!(encode_store_id("plain"), "plain");
    }

    #[test]
    fn test_store_path_layout() {
        let registry = StoreRegistry::new("/tmp/recall-root");
        assert_eq!(
            registry.store_path("team/billing"),
            PathBuf::from("/tmp/recall-root/stores/team__billing/lore.db")
        );
    }

    #[test]
    fn test_create_list_delete_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = StoreRegistry::new(tmp.path());

        registry.create("alpha", Some("first store")).unwrap();
        registry.create("beta", None).unwrap();

        // creating again conflicts
        assert!(matches!(
            registry.create("alpha", None),
            Err(Error::StoreExists(_))
        ));
        // reserved id refuses creation
        assert!(matches!(
            registry.create(DEFAULT_STORE_ID, None),
            Err(Error::InvalidStoreId { .. })
        ));

        let listings = registry.list().unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].id, "alpha");
        assert_eq!(listings[0].description.as_deref(), Some("first store"));
        assert_eq!(listings[0].lore_count, 0);

        // deletion needs confirmation
        assert!(matches!(
            registry.delete("alpha", false, None),
            Err(Error::DeleteNotConfirmed(_))
        ));
        registry.delete("alpha", true, None).unwrap();
        assert_eq!(registry.list().unwrap().len(), 1);

        // the default store can never be deleted
        assert!(matches!(
            registry.delete(DEFAULT_STORE_ID, true, None),
            Err(Error::InvalidStoreId { .. })
        ));
        // deleting something absent reports not-found
        assert!(matches!(
            registry.delete("alpha", true, None),
            Err(Error::StoreNotFound(_))
        ));
    }

    #[test]
    fn test_list_skips_unreadable_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = StoreRegistry::new(tmp.path());
        registry.create("good", None).unwrap();

        // a directory without a database inside
        std::fs::create_dir_all(tmp.path().join(STORES_DIR).join("junk")).unwrap();
        // a directory whose "database" is garbage
        let bad_dir = tmp.path().join(STORES_DIR).join("bad");
        std::fs::create_dir_all(&bad_dir).unwrap();
        std::fs::write(bad_dir.join(DB_FILE_NAME), b"not sqlite").unwrap();

        let listings = registry.list().unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].id, "good");
    }

    #[test]
    fn test_resolve_precedence() {
        let registry = StoreRegistry::new("/tmp/recall-root");
        // explicit beats everything
        assert_eq!(registry.resolve(Some("my-store")).unwrap(), "my-store");
        // nothing set: the default id
        // (ENGRAM_STORE is env-dependent, so only assert the explicit-and-
        // default legs here; the env leg is covered in the config tests)
        if std::env::var(config::ENV_STORE_ID).is_err() {
            assert_eq!(registry.resolve(None).unwrap(), DEFAULT_STORE_ID);
        }
        // validation still applies to explicit ids
        assert!(registry.resolve(Some("NOT VALID")).is_err());
    }
}
