/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The sync protocols. All four leave durable progress behind on failure or
//! cancellation: push keeps `last_push_seq` at the last acknowledged batch,
//! pull keeps `last_pull_seq` at the last fully-applied record, and
//! bootstrap either swaps everything or nothing.

use interrupt_support::Interruptee;

use crate::changelog::ChangeOperation;
use crate::error::*;
use crate::store::LoreStore;
use crate::sync::{BootstrapOutcome, EngramClient, PullOutcome, PushOutcome};
use crate::util;

pub const PUSH_BATCH_SIZE: usize = 200;

/// Ship local-origin changes to Engram in sequence order, batch by batch,
/// resuming after `last_push_seq`.
pub fn push(
    store: &LoreStore,
    client: &EngramClient,
    scope: &dyn Interruptee,
) -> Result<PushOutcome> {
    let source_id = store.source_id()?;
    let mut pushed = 0u64;
    loop {
        scope.err_if_interrupted()?;
        let after = store.last_push_seq()?;
        let batch = store.unpushed_changes(&source_id, after, PUSH_BATCH_SIZE)?;
        if batch.is_empty() {
            break;
        }
        log::debug!("push: {} changes after sequence {}", batch.len(), after);
        let resp = client.push_changes(&source_id, &batch, scope)?;
        // Never move the cursor backwards, whatever the server claims.
        let accepted = resp.accepted_sequence.max(after);
        store.set_last_push_seq(accepted)?;

        let acked_ids: Vec<String> = batch
            .iter()
            .filter(|change| change.sequence <= accepted)
            .map(|change| change.entity_id.clone())
            .collect();
        pushed += acked_ids.len() as u64;
        store.mark_synced(&acked_ids, util::now())?;

        if accepted <= after {
            // The server accepted nothing from this batch; bail rather
            // than resend the same rows forever.
            return Err(Error::Remote {
                endpoint: "/api/v1/sync/push".to_string(),
                status: 200,
                message: format!("push not acknowledged past sequence {after}"),
            });
        }
    }
    store.set_last_sync(util::now())?;
    let last_push_seq = store.last_push_seq()?;
    log::info!("push complete: {pushed} changes, cursor at {last_push_seq}");
    Ok(PushOutcome {
        pushed,
        last_push_seq,
    })
}

/// Apply remote changes since `last_pull_seq`, in server sequence order.
/// Our own changes come back in the feed and are skipped by origin;
/// everything else lands via the non-logging apply path.
pub fn pull(
    store: &LoreStore,
    client: &EngramClient,
    scope: &dyn Interruptee,
) -> Result<PullOutcome> {
    let source_id = store.source_id()?;
    let mut applied = 0u64;
    let mut skipped = 0u64;
    loop {
        scope.err_if_interrupted()?;
        let after = store.last_pull_seq()?;
        let delta = client.pull_delta(after, &source_id, scope)?;
        log::debug!(
            "pull: {} records after sequence {} (eof: {})",
            delta.changes.len(),
            after,
            delta.eof
        );
        for record in &delta.changes {
            scope.err_if_interrupted()?;
            if record.origin() == source_id {
                skipped += 1;
            } else {
                match record.operation {
                    ChangeOperation::Upsert => match &record.payload {
                        Some(entry) => {
                            store.upsert_lore(entry)?;
                            applied += 1;
                        }
                        None => {
                            log::warn!(
                                "pull: upsert for {} arrived without a payload; skipping",
                                record.entity_id
                            );
                            skipped += 1;
                        }
                    },
                    ChangeOperation::Delete => {
                        store.apply_remote_delete(&record.entity_id)?;
                        applied += 1;
                    }
                }
            }
            // Cursor tracks the last fully-applied record, so a
            // cancellation between records loses nothing.
            store.set_last_pull_seq(record.sequence)?;
        }
        let cursor = store.last_pull_seq()?;
        store.set_last_pull_seq(delta.next_sequence.max(cursor))?;
        if delta.eof {
            break;
        }
        if delta.changes.is_empty() && delta.next_sequence <= after {
            // A non-eof page that advances nothing would loop forever.
            return Err(Error::Remote {
                endpoint: "/api/v1/sync/delta".to_string(),
                status: 200,
                message: format!("delta cursor stuck at sequence {after}"),
            });
        }
    }
    store.set_last_sync(util::now())?;
    let last_pull_seq = store.last_pull_seq()?;
    log::info!("pull complete: {applied} applied, {skipped} skipped, cursor at {last_pull_seq}");
    Ok(PullOutcome {
        applied,
        skipped,
        last_pull_seq,
    })
}

/// Replace the local store with a server snapshot. Destroys local-only
/// unsynced work by design; callers confirm before invoking. On any
/// failure the local store is untouched.
pub fn bootstrap(
    store: &LoreStore,
    client: &EngramClient,
    store_id: &str,
    scope: &dyn Interruptee,
) -> Result<BootstrapOutcome> {
    scope.err_if_interrupted()?;
    let (snapshot_sequence, mut body) = client.fetch_snapshot(store_id, scope)?;
    let imported = store.replace_from_snapshot(&mut body, snapshot_sequence, scope)?;
    store.set_last_sync(util::now())?;
    log::info!("bootstrap complete: {imported} entries at snapshot sequence {snapshot_sequence}");
    Ok(BootstrapOutcome {
        imported,
        snapshot_sequence,
    })
}

/// Bootstrap onto an emptied store: content, change log and both cursors
/// are reset first. The recovery path for a corrupted or mis-seeded store.
pub fn reinitialize(
    store: &LoreStore,
    client: &EngramClient,
    store_id: &str,
    scope: &dyn Interruptee,
) -> Result<BootstrapOutcome> {
    scope.err_if_interrupted()?;
    store.wipe_for_reinit()?;
    bootstrap(store, client, store_id, scope)
}
