use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;

/// Builds a blocking HTTP session owned by a single provisioning run.
///
/// Every request made through the session inherits `timeout`, so a hung
/// remote party cannot stall the run indefinitely.
pub fn session(user_agent: &str, timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .build()
}

/// Classification of a non-success HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Unauthorized,
    RateLimited,
    Other,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return StatusClass::Unauthorized;
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return StatusClass::RateLimited;
    }
    StatusClass::Other
}

/// Reads the status and body of a response, trimming the body to something
/// that is safe to attach to an error message.
pub fn response_detail(response: reqwest::blocking::Response) -> (StatusCode, String) {
    const MAX_BODY_CHARS: usize = 2048;
    let status = response.status();
    let body = response.text().unwrap_or_default();
    let body = body.trim();
    let detail = if body.chars().count() > MAX_BODY_CHARS {
        let truncated: String = body.chars().take(MAX_BODY_CHARS).collect();
        format!("{truncated}...")
    } else {
        body.to_string()
    };
    (status, detail)
}
