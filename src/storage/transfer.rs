use std::time::Duration;

use log::debug;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::CONTENT_TYPE;

use crate::http::response_detail;

use super::{ProbeError, PublicProbe, SignedTransfer, StorageError};

/// Uploads and deletions through pre-signed URLs. The URL itself carries the
/// authorization, so no bearer token is attached.
pub struct PresignedTransfer {
    http: Client,
}

impl PresignedTransfer {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    fn send(&self, operation: &'static str, request: RequestBuilder) -> Result<(), StorageError> {
        let response = request.send().map_err(|e| StorageError::Transport {
            operation,
            detail: e.without_url().to_string(),
        })?;
        if response.status().is_success() {
            return Ok(());
        }
        let (status, body) = response_detail(response);
        Err(StorageError::from_status(operation, status, body))
    }
}

impl SignedTransfer for PresignedTransfer {
    fn put(&self, url: &str, body: &[u8], content_type: &str) -> Result<(), StorageError> {
        debug!("[transfer] PUT {} bytes via pre-signed url", body.len());
        self.send(
            "signed-put",
            self.http
                .put(url)
                .header(CONTENT_TYPE, content_type)
                .body(body.to_vec()),
        )
    }

    fn delete(&self, url: &str) -> Result<(), StorageError> {
        debug!("[transfer] DELETE via pre-signed url");
        self.send("signed-delete", self.http.delete(url))
    }
}

/// Plain HTTP reachability check, unauthenticated and independent of the
/// provider session.
pub struct HttpProbe {
    agent: ureq::Agent,
}

impl HttpProbe {
    pub fn new(user_agent: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(user_agent)
            .build();
        Self { agent }
    }
}

impl PublicProbe for HttpProbe {
    fn head(&self, url: &str) -> Result<(), ProbeError> {
        match self.agent.head(url).call() {
            Ok(response) => {
                debug!("[probe] {url} answered {}", response.status());
                Ok(())
            }
            Err(ureq::Error::Status(code, response)) => Err(ProbeError {
                url: url.to_string(),
                status: Some(code),
                detail: response.status_text().to_string(),
            }),
            Err(ureq::Error::Transport(transport)) => Err(ProbeError {
                url: url.to_string(),
                status: None,
                detail: transport.to_string(),
            }),
        }
    }
}
