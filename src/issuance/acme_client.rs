//! Blocking RFC 8555 client implementing [`AcmeProtocol`].

use log::debug;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::http::{StatusClass, classify_status, response_detail};

use super::jose::{AccountKey, b64url};
use super::keys::SigningRequest;
use super::protocol::{
    Account, AcmeProtocol, Authorization, Challenge, Order, Problem, ProtocolError, Status,
};

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

const REPLAY_NONCE: &str = "Replay-Nonce";
const JOSE_JSON: &str = "application/jose+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Directory {
    new_nonce: String,
    new_account: String,
    new_order: String,
}

#[derive(Deserialize)]
struct AccountBody {
    status: Option<Status>,
}

#[derive(Deserialize)]
struct Identifier {
    value: String,
}

#[derive(Deserialize)]
struct OrderBody {
    status: Status,
    #[serde(default)]
    identifiers: Vec<Identifier>,
    #[serde(default)]
    authorizations: Vec<String>,
    finalize: String,
    certificate: Option<String>,
}

#[derive(Deserialize)]
struct AuthorizationBody {
    identifier: Identifier,
    status: Status,
    #[serde(default)]
    challenges: Vec<ChallengeBody>,
}

#[derive(Deserialize)]
struct ChallengeBody {
    #[serde(rename = "type")]
    kind: String,
    url: String,
    #[serde(default)]
    token: String,
    status: Status,
}

impl From<ChallengeBody> for Challenge {
    fn from(body: ChallengeBody) -> Self {
        Challenge {
            url: body.url,
            kind: body.kind,
            token: body.token,
            status: body.status,
        }
    }
}

fn order_from(url: String, body: OrderBody) -> Order {
    Order {
        url,
        status: body.status,
        identifiers: body.identifiers.into_iter().map(|i| i.value).collect(),
        authorizations: body.authorizations,
        finalize: body.finalize,
        certificate: body.certificate,
    }
}

fn authorization_from(url: &str, body: AuthorizationBody) -> Authorization {
    Authorization {
        url: url.to_string(),
        domain: body.identifier.value,
        status: body.status,
        challenges: body.challenges.into_iter().map(Challenge::from).collect(),
    }
}

/// Stateful ACME session: caches the directory, the replay nonce and the
/// account URL used as `kid` once registered.
pub struct AcmeClient {
    http: Client,
    directory_url: String,
    directory: Option<Directory>,
    key: AccountKey,
    nonce: Option<String>,
    kid: Option<String>,
}

impl AcmeClient {
    pub fn new(http: Client, directory_url: impl Into<String>, key: AccountKey) -> Self {
        Self {
            http,
            directory_url: directory_url.into(),
            directory: None,
            key,
            nonce: None,
            kid: None,
        }
    }

    fn directory(&mut self) -> Result<Directory, ProtocolError> {
        if let Some(directory) = &self.directory {
            return Ok(directory.clone());
        }
        let response = self
            .http
            .get(&self.directory_url)
            .send()
            .map_err(|e| transport("directory", e))?;
        let response = check_status("directory", response)?;
        let directory: Directory = read_json("directory", response)?;
        self.directory = Some(directory.clone());
        Ok(directory)
    }

    fn fresh_nonce(&mut self) -> Result<String, ProtocolError> {
        let url = self.directory()?.new_nonce;
        let response = self
            .http
            .head(&url)
            .send()
            .map_err(|e| transport("new-nonce", e))?;
        let response = check_status("new-nonce", response)?;
        header(&response, REPLAY_NONCE).ok_or_else(|| ProtocolError::Malformed {
            operation: "new-nonce",
            detail: "missing Replay-Nonce header".into(),
        })
    }

    fn kid(&self) -> Result<String, ProtocolError> {
        self.kid.clone().ok_or(ProtocolError::Malformed {
            operation: "signed request",
            detail: "no registered account; register first".into(),
        })
    }

    /// Signed POST, retried once with a fresh nonce on `badNonce`.
    fn post(
        &mut self,
        operation: &'static str,
        url: &str,
        kid: Option<&str>,
        payload: Option<&Value>,
        accept: &str,
    ) -> Result<Response, ProtocolError> {
        let mut retried = false;
        loop {
            let nonce = match self.nonce.take() {
                Some(nonce) => nonce,
                None => self.fresh_nonce()?,
            };
            let body = self.key.signed_body(url, &nonce, kid, payload)?;
            let response = self
                .http
                .post(url)
                .header(CONTENT_TYPE, JOSE_JSON)
                .header(ACCEPT, accept)
                .body(body.to_string())
                .send()
                .map_err(|e| transport(operation, e))?;
            self.nonce = header(&response, REPLAY_NONCE);

            if response.status().is_success() {
                return Ok(response);
            }
            let (status, detail) = response_detail(response);
            let problem = serde_json::from_str::<Problem>(&detail).unwrap_or(Problem {
                kind: String::new(),
                detail,
            });
            if problem.is_bad_nonce() && !retried {
                debug!("[acme] {operation}: nonce rejected, retrying once");
                retried = true;
                continue;
            }
            return Err(match classify_status(status) {
                StatusClass::RateLimited => ProtocolError::RateLimited { operation, problem },
                _ => ProtocolError::Rejected {
                    operation,
                    status: status.as_u16(),
                    problem,
                },
            });
        }
    }

    fn post_json<T: DeserializeOwned>(
        &mut self,
        operation: &'static str,
        url: &str,
        payload: Option<&Value>,
    ) -> Result<T, ProtocolError> {
        let kid = self.kid()?;
        let response = self.post(operation, url, Some(&kid), payload, "application/json")?;
        read_json(operation, response)
    }
}

impl AcmeProtocol for AcmeClient {
    fn register(
        &mut self,
        terms_agreed: bool,
        contacts: &[String],
    ) -> Result<Account, ProtocolError> {
        let url = self.directory()?.new_account;
        let mut payload = json!({ "termsOfServiceAgreed": terms_agreed });
        if !contacts.is_empty() {
            payload["contact"] = json!(contacts);
        }
        let response = self.post("new-account", &url, None, Some(&payload), "application/json")?;
        let location = header(&response, LOCATION.as_str()).ok_or(ProtocolError::Malformed {
            operation: "new-account",
            detail: "missing account Location header".into(),
        })?;
        let body: AccountBody = read_json("new-account", response)?;
        if let Some(status) = body.status.filter(|s| *s != Status::Valid) {
            return Err(ProtocolError::Malformed {
                operation: "new-account",
                detail: format!("account status is {status}"),
            });
        }
        debug!("[acme] account ready at {location}");
        self.kid = Some(location.clone());
        Ok(Account {
            url: location,
            key_thumbprint: self.key.thumbprint()?,
        })
    }

    fn new_order(&mut self, domains: &[String]) -> Result<Order, ProtocolError> {
        let url = self.directory()?.new_order;
        let kid = self.kid()?;
        let identifiers: Vec<Value> = domains
            .iter()
            .map(|d| json!({ "type": "dns", "value": d }))
            .collect();
        let payload = json!({ "identifiers": identifiers });
        let response = self.post("new-order", &url, Some(&kid), Some(&payload), "application/json")?;
        let location = header(&response, LOCATION.as_str()).ok_or(ProtocolError::Malformed {
            operation: "new-order",
            detail: "missing order Location header".into(),
        })?;
        let body: OrderBody = read_json("new-order", response)?;
        Ok(order_from(location, body))
    }

    fn authorization(&mut self, url: &str) -> Result<Authorization, ProtocolError> {
        let body: AuthorizationBody = self.post_json("authorization", url, None)?;
        Ok(authorization_from(url, body))
    }

    fn respond(&mut self, challenge: &Challenge) -> Result<Challenge, ProtocolError> {
        let body: ChallengeBody = self.post_json("challenge", &challenge.url, Some(&json!({})))?;
        Ok(body.into())
    }

    fn refresh_challenge(&mut self, challenge: &Challenge) -> Result<Challenge, ProtocolError> {
        let body: ChallengeBody = self.post_json("challenge-status", &challenge.url, None)?;
        Ok(body.into())
    }

    fn finalize(&mut self, order: &Order, csr: &SigningRequest) -> Result<Order, ProtocolError> {
        let payload = json!({ "csr": b64url(csr.der()) });
        let body: OrderBody = self.post_json("finalize", &order.finalize, Some(&payload))?;
        Ok(order_from(order.url.clone(), body))
    }

    fn refresh_order(&mut self, order: &Order) -> Result<Order, ProtocolError> {
        let body: OrderBody = self.post_json("order-status", &order.url, None)?;
        Ok(order_from(order.url.clone(), body))
    }

    fn certificate(&mut self, order: &Order) -> Result<String, ProtocolError> {
        let url = order.certificate.clone().ok_or(ProtocolError::Malformed {
            operation: "certificate",
            detail: format!("order is {} without a certificate url", order.status),
        })?;
        let kid = self.kid()?;
        let response = self.post("certificate", &url, Some(&kid), None, PEM_CHAIN)?;
        response.text().map_err(|e| transport("certificate", e))
    }
}

fn header(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn check_status(operation: &'static str, response: Response) -> Result<Response, ProtocolError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let (status, detail) = response_detail(response);
    Err(ProtocolError::Rejected {
        operation,
        status: status.as_u16(),
        problem: Problem {
            kind: String::new(),
            detail,
        },
    })
}

fn read_json<T: DeserializeOwned>(
    operation: &'static str,
    response: Response,
) -> Result<T, ProtocolError> {
    response.json().map_err(|e| ProtocolError::Malformed {
        operation,
        detail: e.to_string(),
    })
}

fn transport(operation: &'static str, err: reqwest::Error) -> ProtocolError {
    ProtocolError::Transport {
        operation,
        detail: err.to_string(),
    }
}
