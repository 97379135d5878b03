//! Relying-party client for the BankID v5 API.
//!
//! [`HttpTransport`] talks mutual TLS to the RP API, [`BankIdClient`] wraps the
//! `auth`, `sign`, `collect` and `cancel` methods, [`launch_urls`] builds the
//! links that start the BankID app and [`Flow`] polls an order until it
//! completes or fails.
#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
use strum::EnumString;

/// The BankID environment to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Environment {
    /// The public test environment, used with test certificates and test BankIDs.
    Test,
    /// The production environment.
    Production,
}

mod client;
pub use client::*;

pub mod config;
pub use config::{Config, PollConfig, TlsConfig};

mod error;
pub use error::*;

mod flow;
pub use flow::*;

mod launch;
pub use launch::*;

mod transport;
pub use transport::*;

pub mod types;

// private modules
mod http_request;
