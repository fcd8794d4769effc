/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The HTTP peer client for Engram. JSON bodies, lower_snake_case fields,
//! bearer auth when a key is configured. 5xx/429 and transport failures are
//! `Transient` and retried here with jittered exponential backoff; other
//! statuses map onto the shared error taxonomy. Every error message built
//! from a response or transport error is passed through the API-key
//! scrubber first.

use std::time::Duration;

use interrupt_support::Interruptee;
use rand::Rng;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::changelog::ChangeRecord;
use crate::error::*;

pub(crate) const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(600);
pub(crate) const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

pub(crate) const SNAPSHOT_SEQUENCE_HEADER: &str = "X-Snapshot-Sequence";

#[derive(Serialize)]
struct PushRequest<'a> {
    source_id: &'a str,
    changes: &'a [ChangeRecord],
}

#[derive(Debug, Deserialize)]
pub struct PushResponse {
    pub accepted_sequence: i64,
}

#[derive(Debug, Deserialize)]
pub struct DeltaResponse {
    pub changes: Vec<ChangeRecord>,
    pub next_sequence: i64,
    pub eof: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteStoreInfo {
    pub id: String,
    #[serde(default)]
    pub record_count: u64,
    #[serde(default)]
    pub last_accessed: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RemoteStoreList {
    pub stores: Vec<RemoteStoreInfo>,
    #[serde(default)]
    pub total: u64,
}

#[derive(Serialize)]
struct CreateStoreRequest<'a> {
    store_id: &'a str,
    description: Option<&'a str>,
}

pub struct EngramClient {
    base_url: Url,
    api_key: Option<String>,
    http: reqwest::blocking::Client,
}

impl EngramClient {
    pub fn new(engram_url: &str, api_key: Option<String>) -> Result<Self> {
        let base_url = Url::parse(engram_url)?;
        let http = reqwest::blocking::Client::builder()
            .timeout(DEFAULT_RPC_TIMEOUT)
            .build()
            .map_err(|e| Error::Transient(e.to_string()))?;
        Ok(Self {
            base_url,
            api_key,
            http,
        })
    }

    /// Ship a batch of local changes. Returns the highest sequence Engram
    /// accepted.
    pub fn push_changes(
        &self,
        source_id: &str,
        changes: &[ChangeRecord],
        scope: &dyn Interruptee,
    ) -> Result<PushResponse> {
        let url = self.endpoint("api/v1/sync/push")?;
        let body = PushRequest { source_id, changes };
        self.with_retries(scope, || {
            let resp = self
                .authorize(self.http.post(url.clone()))
                .json(&body)
                .send()
                .map_err(|e| self.transport_error(e))?;
            let resp = self.check_response("/api/v1/sync/push", resp)?;
            resp.json().map_err(|e| self.transport_error(e))
        })
    }

    /// Fetch one page of remote changes after `after`.
    pub fn pull_delta(
        &self,
        after: i64,
        source_id: &str,
        scope: &dyn Interruptee,
    ) -> Result<DeltaResponse> {
        let mut url = self.endpoint("api/v1/sync/delta")?;
        url.query_pairs_mut()
            .append_pair("after", &after.to_string())
            .append_pair("source_id", source_id);
        self.with_retries(scope, || {
            let resp = self
                .authorize(self.http.get(url.clone()))
                .send()
                .map_err(|e| self.transport_error(e))?;
            let resp = self.check_response("/api/v1/sync/delta", resp)?;
            resp.json().map_err(|e| self.transport_error(e))
        })
    }

    /// Open the snapshot stream for `store_id`. Returns the server-declared
    /// snapshot sequence and the response body, which reads as the raw
    /// SQLite file. The long read deadline only applies to this endpoint.
    pub fn fetch_snapshot(
        &self,
        store_id: &str,
        scope: &dyn Interruptee,
    ) -> Result<(i64, reqwest::blocking::Response)> {
        let mut url = self.endpoint("api/v1/sync/snapshot")?;
        url.query_pairs_mut().append_pair("store", store_id);
        self.with_retries(scope, || {
            let resp = self
                .authorize(self.http.get(url.clone()).timeout(SNAPSHOT_TIMEOUT))
                .send()
                .map_err(|e| self.transport_error(e))?;
            let resp = self.check_response("/api/v1/sync/snapshot", resp)?;
            let sequence = resp
                .headers()
                .get(SNAPSHOT_SEQUENCE_HEADER)
                .and_then(|value| value.to_str().ok())
                .and_then(|text| text.parse::<i64>().ok())
                .ok_or_else(|| {
                    Error::Corrupt(format!(
                        "snapshot response is missing the {SNAPSHOT_SEQUENCE_HEADER} header"
                    ))
                })?;
            Ok((sequence, resp))
        })
    }

    pub fn list_stores(&self, scope: &dyn Interruptee) -> Result<RemoteStoreList> {
        let url = self.endpoint("api/v1/stores")?;
        self.with_retries(scope, || {
            let resp = self
                .authorize(self.http.get(url.clone()))
                .send()
                .map_err(|e| self.transport_error(e))?;
            let resp = self.check_response("/api/v1/stores", resp)?;
            resp.json().map_err(|e| self.transport_error(e))
        })
    }

    pub fn create_store(
        &self,
        store_id: &str,
        description: Option<&str>,
        scope: &dyn Interruptee,
    ) -> Result<()> {
        let url = self.endpoint("api/v1/stores")?;
        let body = CreateStoreRequest {
            store_id,
            description,
        };
        self.with_retries(scope, || {
            let resp = self
                .authorize(self.http.post(url.clone()))
                .json(&body)
                .send()
                .map_err(|e| self.transport_error(e))?;
            if resp.status().as_u16() == 409 {
                return Err(Error::StoreExists(store_id.to_string()));
            }
            self.check_response("/api/v1/stores", resp)?;
            Ok(())
        })
    }

    /// Delete a remote store. A 404 means it was already gone, which is
    /// success for our purposes.
    pub fn delete_store(&self, store_id: &str, scope: &dyn Interruptee) -> Result<()> {
        let url = self.endpoint(&format!("api/v1/stores/{store_id}"))?;
        let endpoint = format!("/api/v1/stores/{store_id}");
        self.with_retries(scope, || {
            let resp = self
                .authorize(self.http.delete(url.clone()))
                .send()
                .map_err(|e| self.transport_error(e))?;
            if resp.status().as_u16() == 404 {
                return Ok(());
            }
            self.check_response(&endpoint, resp)?;
            Ok(())
        })
    }

    /// Quick reachability probe with a short deadline; no retries.
    pub fn health(&self) -> Result<()> {
        let url = self.endpoint("health")?;
        let resp = self
            .authorize(self.http.get(url).timeout(HEALTH_TIMEOUT))
            .send()
            .map_err(|e| self.transport_error(e))?;
        self.check_response("/health", resp)?;
        Ok(())
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn authorize(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    fn redact(&self, text: &str) -> String {
        redact_api_key(text, self.api_key.as_deref())
    }

    fn transport_error(&self, e: reqwest::Error) -> Error {
        Error::Transient(self.redact(&e.to_string()))
    }

    /// Map a non-2xx response onto the error taxonomy, scrubbing the body.
    fn check_response(
        &self,
        endpoint: &str,
        resp: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let code = status.as_u16();
        let message = self.redact(&resp.text().unwrap_or_default());
        match code {
            401 | 403 => Err(Error::Unauthorized {
                endpoint: endpoint.to_string(),
            }),
            429 => Err(Error::Transient(format!(
                "{endpoint}: rate limited: {message}"
            ))),
            400..=499 => Err(Error::Remote {
                endpoint: endpoint.to_string(),
                status: code,
                message,
            }),
            _ => Err(Error::Transient(format!(
                "{endpoint}: status {code}: {message}"
            ))),
        }
    }

    /// Run `attempt` until it succeeds, fails non-transiently, or the
    /// attempt budget runs out. Full jitter: each sleep is uniform over
    /// (0, current_delay], and the delay doubles up to the cap.
    fn with_retries<T>(
        &self,
        scope: &dyn Interruptee,
        mut attempt: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut delay = BACKOFF_INITIAL;
        for tries_left in (0..MAX_ATTEMPTS).rev() {
            scope.err_if_interrupted()?;
            match attempt() {
                Err(e) if e.is_transient() && tries_left > 0 => {
                    let jittered = rand::thread_rng().gen_range(1..=delay.as_millis() as u64);
                    log::warn!(
                        "transient Engram error ({}); retrying in {}ms ({} tries left)",
                        e,
                        jittered,
                        tries_left
                    );
                    std::thread::sleep(Duration::from_millis(jittered));
                    delay = (delay * 2).min(BACKOFF_CAP);
                }
                other => return other,
            }
        }
        unreachable!("retry loop always returns on the final attempt")
    }
}
