//! Issues an ACME HTTP-01 certificate for a domain served from an object
//! storage bucket and installs it on the bucket.

pub mod account_key;
pub mod certificate;
pub mod config;
pub mod domain;
pub mod http;
pub mod issuance;
pub mod logging;
pub mod poll;
pub mod storage;
