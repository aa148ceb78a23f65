// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Signed direct-access links for backends without native presigning.
//!
//! A link has the form `{base}/blobs/{storage_path}?expires={unix_ms}&signature={mac}`
//! where `mac` is HMAC-SHA256 over `"{storage_path}\n{unix_ms}"`, encoded as
//! unpadded URL-safe base64. A link is honored strictly before `expires`.

use std::sync::Arc;
use std::time::Duration;

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, TimeDelta, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::Url;

use super::content::{ContentReader, ContentStore, ContentStoreError};
use super::paths::split_storage_path;
use crate::models::PresignedUrl;

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted signing secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Route prefix under which signed links are served.
pub const BLOB_ROUTE: &str = "blobs";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("link has expired")]
    Expired,

    #[error("link signature is invalid")]
    BadSignature,

    #[error("link is malformed: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("signing secret must be at least {MIN_SECRET_LEN} bytes")]
pub struct WeakSecret;

/// Issues and checks signed links.
#[derive(Clone)]
pub struct UrlSigner {
    mac: HmacSha256,
    base_url: Url,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(secret: &[u8], base_url: Url) -> Result<Self, WeakSecret> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(WeakSecret);
        }
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| WeakSecret)?;
        Ok(Self { mac, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn mac_for(&self, storage_path: &str, expires_ms: i64) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(storage_path.as_bytes());
        mac.update(b"\n");
        mac.update(expires_ms.to_string().as_bytes());
        mac
    }

    /// Sign a link for `storage_path` valid for `ttl` from `now`.
    ///
    /// Expiry is truncated to whole milliseconds.
    pub fn sign(
        &self,
        storage_path: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<PresignedUrl, ContentStoreError> {
        split_storage_path(storage_path)?;

        let delta = TimeDelta::from_std(ttl).map_err(|_| ContentStoreError::InvalidTtl(ttl))?;
        if delta <= TimeDelta::zero() {
            return Err(ContentStoreError::InvalidTtl(ttl));
        }
        let expires_ms = now
            .checked_add_signed(delta)
            .ok_or(ContentStoreError::InvalidTtl(ttl))?
            .timestamp_millis();
        let expires_at =
            DateTime::from_timestamp_millis(expires_ms).ok_or(ContentStoreError::InvalidTtl(ttl))?;

        let signature =
            Base64UrlUnpadded::encode_string(&self.mac_for(storage_path, expires_ms).finalize().into_bytes());

        let mut url = self.base_url.clone();
        let prefix = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{prefix}/{BLOB_ROUTE}/{storage_path}"));
        url.query_pairs_mut()
            .clear()
            .append_pair("expires", &expires_ms.to_string())
            .append_pair("signature", &signature);

        Ok(PresignedUrl { url, expires_at })
    }

    /// Check a link's parts. Signature is compared in constant time.
    pub fn verify(
        &self,
        storage_path: &str,
        expires_ms: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<(), LinkError> {
        split_storage_path(storage_path).map_err(|_| LinkError::Malformed("storage path"))?;

        let provided = Base64UrlUnpadded::decode_vec(signature)
            .map_err(|_| LinkError::Malformed("signature encoding"))?;
        self.mac_for(storage_path, expires_ms)
            .verify_slice(&provided)
            .map_err(|_| LinkError::BadSignature)?;

        if now.timestamp_millis() >= expires_ms {
            return Err(LinkError::Expired);
        }
        Ok(())
    }

    /// Check a full link and return the storage path it grants access to.
    pub fn verify_url(&self, url: &Url, now: DateTime<Utc>) -> Result<String, LinkError> {
        if url.origin() != self.base_url.origin() {
            return Err(LinkError::Malformed("foreign origin"));
        }
        let prefix = format!(
            "{}/{BLOB_ROUTE}/",
            self.base_url.path().trim_end_matches('/')
        );
        let storage_path = url
            .path()
            .strip_prefix(&prefix)
            .ok_or(LinkError::Malformed("path"))?
            .to_string();

        let mut expires = None;
        let mut signature = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "expires" => expires = Some(value.into_owned()),
                "signature" => signature = Some(value.into_owned()),
                _ => {}
            }
        }
        let expires_ms = expires
            .ok_or(LinkError::Malformed("missing expires"))?
            .parse::<i64>()
            .map_err(|_| LinkError::Malformed("expires"))?;
        let signature = signature.ok_or(LinkError::Malformed("missing signature"))?;

        self.verify(&storage_path, expires_ms, &signature, now)?;
        Ok(storage_path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectAccessError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Content(#[from] ContentStoreError),
}

/// Resolves signed links issued by a [`UrlSigner`] into blob streams.
#[derive(Clone)]
pub struct DirectAccess {
    signer: UrlSigner,
    content: Arc<dyn ContentStore>,
}

impl DirectAccess {
    pub fn new(signer: UrlSigner, content: Arc<dyn ContentStore>) -> Self {
        Self { signer, content }
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    pub async fn open(
        &self,
        storage_path: &str,
        expires_ms: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<ContentReader, DirectAccessError> {
        self.signer.verify(storage_path, expires_ms, signature, now)?;
        Ok(self.content.download_file(storage_path).await?)
    }

    /// Dereference a complete link.
    pub async fn open_url(
        &self,
        url: &Url,
        now: DateTime<Utc>,
    ) -> Result<ContentReader, DirectAccessError> {
        let storage_path = self.signer.verify_url(url, now)?;
        Ok(self.content.download_file(&storage_path).await?)
    }
}
