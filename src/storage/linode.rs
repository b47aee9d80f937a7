//! Linode Object Storage API binding.
//!
//! See <https://www.linode.com/docs/api/object-storage/>.

use std::time::Duration;

use log::debug;
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use zeroize::Zeroizing;

use crate::http::response_detail;

use super::{Bucket, BucketRef, ObjectAcl, ObjectMethod, ObjectStorage, StorageError};

pub const LINODE_API: &str = "https://api.linode.com/";

const MAX_BUCKET_PAGES: u32 = 100;

#[derive(Deserialize)]
struct BucketPage {
    data: Vec<Bucket>,
    #[serde(default = "first_page")]
    page: u32,
    #[serde(default = "first_page")]
    pages: u32,
}

fn first_page() -> u32 {
    1
}

#[derive(Deserialize)]
struct ObjectUrlResponse {
    url: String,
}

#[derive(Serialize)]
struct SslUpload<'a> {
    certificate: &'a str,
    private_key: &'a str,
}

#[derive(Deserialize)]
struct SslResponse {
    #[serde(default)]
    ssl: bool,
}

#[derive(Deserialize)]
struct ApiErrors {
    #[serde(default)]
    errors: Vec<ApiErrorReason>,
}

#[derive(Deserialize)]
struct ApiErrorReason {
    reason: String,
}

/// Extracts `errors[].reason` from a Linode error body, falling back to the raw text.
fn error_detail(body: String) -> String {
    match serde_json::from_str::<ApiErrors>(&body) {
        Ok(parsed) if !parsed.errors.is_empty() => parsed
            .errors
            .into_iter()
            .map(|e| e.reason)
            .collect::<Vec<_>>()
            .join("; "),
        _ => body,
    }
}

pub struct LinodeObjectStorage {
    http: Client,
    api: Url,
    token: Zeroizing<String>,
}

impl LinodeObjectStorage {
    pub fn new(http: Client, api_base: &str, token: Zeroizing<String>) -> Result<Self, StorageError> {
        let api = Url::parse(api_base).map_err(|e| StorageError::Malformed {
            operation: "configure",
            detail: format!("invalid API base url {api_base}: {e}"),
        })?;
        if api.cannot_be_a_base() {
            return Err(StorageError::Malformed {
                operation: "configure",
                detail: format!("API base url {api_base} cannot carry a path"),
            });
        }
        Ok(Self { http, api, token })
    }

    /// `v4/object-storage/buckets[/<cluster>/<bucket>/<leaf>]` with each segment escaped.
    fn endpoint(&self, bucket: Option<(&BucketRef, &str)>) -> Url {
        let mut url = self.api.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v4", "object-storage", "buckets"]);
            if let Some((bucket, leaf)) = bucket {
                segments.extend([bucket.cluster.as_str(), bucket.label.as_str(), leaf]);
            }
        }
        url
    }

    fn send(&self, operation: &'static str, request: RequestBuilder) -> Result<Response, StorageError> {
        let response = request
            .bearer_auth(self.token.as_str())
            .send()
            .map_err(|e| StorageError::Transport {
                operation,
                detail: e.to_string(),
            })?;
        if response.status().is_success() {
            return Ok(response);
        }
        let (status, body) = response_detail(response);
        Err(StorageError::from_status(operation, status, error_detail(body)))
    }

    fn send_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<T, StorageError> {
        self.send(operation, request)?
            .json()
            .map_err(|e| StorageError::Malformed {
                operation,
                detail: e.to_string(),
            })
    }
}

impl ObjectStorage for LinodeObjectStorage {
    fn buckets(&self) -> Result<Vec<Bucket>, StorageError> {
        let mut buckets = Vec::new();
        for requested in 1..=MAX_BUCKET_PAGES {
            let mut url = self.endpoint(None);
            url.query_pairs_mut()
                .append_pair("page", &requested.to_string());
            let body: BucketPage = self.send_json("list-buckets", self.http.get(url))?;
            debug!(
                "[linode] bucket page {} of {} ({} buckets)",
                body.page,
                body.pages,
                body.data.len()
            );
            if body.page != requested {
                return Err(StorageError::Malformed {
                    operation: "list-buckets",
                    detail: format!("requested page {requested}, received page {}", body.page),
                });
            }
            buckets.extend(body.data);
            if body.page >= body.pages {
                return Ok(buckets);
            }
        }
        Err(StorageError::Malformed {
            operation: "list-buckets",
            detail: format!("bucket listing exceeds {MAX_BUCKET_PAGES} pages"),
        })
    }

    fn object_url(
        &self,
        bucket: &BucketRef,
        name: &str,
        method: ObjectMethod,
        content_type: Option<&str>,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        let mut payload = json!({
            "name": name,
            "method": method.as_str(),
            "expires_in": expires_in.as_secs(),
        });
        if let Some(content_type) = content_type {
            payload["content_type"] = json!(content_type);
        }
        let url = self.endpoint(Some((bucket, "object-url")));
        let body: ObjectUrlResponse =
            self.send_json("object-url", self.http.post(url).json(&payload))?;
        Ok(body.url)
    }

    fn set_object_acl(
        &self,
        bucket: &BucketRef,
        name: &str,
        acl: ObjectAcl,
    ) -> Result<(), StorageError> {
        let url = self.endpoint(Some((bucket, "object-acl")));
        let payload = json!({ "name": name, "acl": acl.as_str() });
        self.send("object-acl", self.http.put(url).json(&payload))?;
        Ok(())
    }

    fn certificate_installed(&self, bucket: &BucketRef) -> Result<bool, StorageError> {
        let url = self.endpoint(Some((bucket, "ssl")));
        let body: SslResponse = self.send_json("get-ssl", self.http.get(url))?;
        Ok(body.ssl)
    }

    fn upload_certificate(
        &self,
        bucket: &BucketRef,
        certificate: &str,
        private_key: &str,
    ) -> Result<(), StorageError> {
        let url = self.endpoint(Some((bucket, "ssl")));
        let upload = SslUpload {
            certificate,
            private_key,
        };
        self.send("upload-ssl", self.http.post(url).json(&upload))?;
        Ok(())
    }

    fn delete_certificate(&self, bucket: &BucketRef) -> Result<(), StorageError> {
        let url = self.endpoint(Some((bucket, "ssl")));
        self.send("delete-ssl", self.http.delete(url))?;
        Ok(())
    }
}
