// Copyright 2026-Present the P2A project authors
// SPDX-License-Identifier: Apache-2.0

//! One HTTP POST per staged report.
//!
//! The payload is already encrypted and fixed-size when it reaches this
//! module; the uploader only base64-encodes it and ships it. No cookies
//! or credentials are attached, caching is bypassed, and a fixed header
//! marks the submission as anonymous so the collection service can route
//! it without inspecting the body.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{header, Client, StatusCode, Url};
use tracing::{debug, warn};

/// Header identifying an anonymous submission.
pub const ANONYMITY_HEADER: &str = "x-p2a";

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of one upload attempt, handed back to the scheduler.
#[derive(Debug)]
pub struct UploadOutcome {
    pub status: Option<StatusCode>,
    pub network_error: Option<String>,
    pub used_https: bool,
}

impl UploadOutcome {
    /// HTTP 200 is the sole success condition; `ignore_server_errors`
    /// additionally accepts any completed exchange (test override).
    pub fn is_success(&self, ignore_server_errors: bool) -> bool {
        match self.status {
            Some(StatusCode::OK) => true,
            Some(_) => ignore_server_errors,
            None => false,
        }
    }
}

pub struct Uploader {
    client: Client,
    upload_url: Url,
}

impl Uploader {
    pub fn new(upload_url: Url) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(UPLOAD_TIMEOUT).build()?;
        Ok(Self { client, upload_url })
    }

    /// POSTs one already-encrypted payload.
    ///
    /// Never returns an error: transport failures are folded into the
    /// outcome so the scheduler can apply backoff.
    pub async fn upload_log(&self, payload: &[u8]) -> UploadOutcome {
        let body = STANDARD.encode(payload);
        let used_https = self.upload_url.scheme() == "https";

        let result = self
            .client
            .post(self.upload_url.clone())
            .header(header::CONTENT_TYPE, "application/base64")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(ANONYMITY_HEADER, "?1")
            .body(body)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                debug!("Report upload completed with status {status}");
                UploadOutcome {
                    status: Some(status),
                    network_error: None,
                    used_https,
                }
            }
            Err(e) => {
                warn!("Report upload failed: {e}");
                UploadOutcome {
                    status: e.status(),
                    network_error: Some(e.to_string()),
                    used_https,
                }
            }
        }
    }
}
