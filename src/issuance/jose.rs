//! Account key handling for signed ACME requests (RFC 7515, RFC 7638).

use std::collections::BTreeMap;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use openssl::{
    bn::{BigNum, BigNumContext},
    ecdsa::EcdsaSig,
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{Id, PKey, Private},
    sign::Signer,
};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use super::protocol::ProtocolError;

const P256_COORDINATE_LEN: i32 = 32;

pub fn b64url(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Private key identifying the ACME account. RSA keys sign with RS256,
/// P-256 keys with ES256.
pub struct AccountKey {
    pkey: PKey<Private>,
}

impl std::fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKey")
            .field("alg", &self.alg())
            .finish_non_exhaustive()
    }
}

impl AccountKey {
    pub fn from_pem(pem: &[u8]) -> Result<Self, ProtocolError> {
        let pkey = PKey::private_key_from_pem(pem).map_err(key_error)?;
        Self::from_pkey(pkey)
    }

    pub fn from_pkey(pkey: PKey<Private>) -> Result<Self, ProtocolError> {
        match pkey.id() {
            Id::RSA => Ok(Self { pkey }),
            Id::EC => {
                let curve = pkey
                    .ec_key()
                    .map_err(key_error)?
                    .group()
                    .curve_name();
                if curve != Some(Nid::X9_62_PRIME256V1) {
                    return Err(ProtocolError::Key(
                        "only P-256 EC account keys are supported".into(),
                    ));
                }
                Ok(Self { pkey })
            }
            other => Err(ProtocolError::Key(format!(
                "unsupported account key type {other:?}"
            ))),
        }
    }

    pub fn alg(&self) -> &'static str {
        if self.pkey.id() == Id::RSA { "RS256" } else { "ES256" }
    }

    /// Public JWK with only the required members, in lexicographic order.
    pub fn jwk(&self) -> Result<BTreeMap<&'static str, String>, ProtocolError> {
        let mut jwk = BTreeMap::new();
        if self.pkey.id() == Id::RSA {
            let rsa = self.pkey.rsa().map_err(key_error)?;
            jwk.insert("kty", "RSA".to_string());
            jwk.insert("n", b64url(&rsa.n().to_vec()));
            jwk.insert("e", b64url(&rsa.e().to_vec()));
        } else {
            let ec = self.pkey.ec_key().map_err(key_error)?;
            let mut ctx = BigNumContext::new().map_err(key_error)?;
            let mut x = BigNum::new().map_err(key_error)?;
            let mut y = BigNum::new().map_err(key_error)?;
            ec.public_key()
                .affine_coordinates_gfp(ec.group(), &mut x, &mut y, &mut ctx)
                .map_err(key_error)?;
            jwk.insert("kty", "EC".to_string());
            jwk.insert("crv", "P-256".to_string());
            jwk.insert(
                "x",
                b64url(&x.to_vec_padded(P256_COORDINATE_LEN).map_err(key_error)?),
            );
            jwk.insert(
                "y",
                b64url(&y.to_vec_padded(P256_COORDINATE_LEN).map_err(key_error)?),
            );
        }
        Ok(jwk)
    }

    /// RFC 7638 thumbprint of the public JWK.
    pub fn thumbprint(&self) -> Result<String, ProtocolError> {
        let canonical = serde_json::to_string(&self.jwk()?)
            .map_err(|e| ProtocolError::Key(e.to_string()))?;
        Ok(b64url(&Sha256::digest(canonical.as_bytes())))
    }

    /// Raw JWS signature over `data`.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if self.pkey.id() == Id::RSA {
            let mut signer = Signer::new(MessageDigest::sha256(), &self.pkey).map_err(key_error)?;
            signer.update(data).map_err(key_error)?;
            return signer.sign_to_vec().map_err(key_error);
        }
        let digest = Sha256::digest(data);
        let ec = self.pkey.ec_key().map_err(key_error)?;
        let sig = EcdsaSig::sign(&digest, &ec).map_err(key_error)?;
        let mut raw = sig.r().to_vec_padded(P256_COORDINATE_LEN).map_err(key_error)?;
        raw.extend(sig.s().to_vec_padded(P256_COORDINATE_LEN).map_err(key_error)?);
        Ok(raw)
    }

    /// Flattened JWS body. `kid` selects the account URL form; without it the
    /// public JWK is embedded. `payload` of `None` produces a POST-as-GET.
    pub fn signed_body(
        &self,
        url: &str,
        nonce: &str,
        kid: Option<&str>,
        payload: Option<&Value>,
    ) -> Result<Value, ProtocolError> {
        let mut protected = json!({
            "alg": self.alg(),
            "nonce": nonce,
            "url": url,
        });
        match kid {
            Some(kid) => protected["kid"] = json!(kid),
            None => protected["jwk"] = json!(self.jwk()?),
        }
        let protected = b64url(protected.to_string().as_bytes());
        let payload = match payload {
            Some(payload) => b64url(payload.to_string().as_bytes()),
            None => String::new(),
        };
        let signature = self.sign(format!("{protected}.{payload}").as_bytes())?;
        Ok(json!({
            "protected": protected,
            "payload": payload,
            "signature": b64url(&signature),
        }))
    }
}

fn key_error(err: ErrorStack) -> ProtocolError {
    ProtocolError::Key(err.to_string())
}
