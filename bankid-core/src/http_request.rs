use std::time::Duration;

use pkcs8::{EncryptedPrivateKeyInfo, LineEnding, SecretDocument};
use reqwest::{Certificate, Identity, Method, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::{
    config::{Config, TlsConfig},
    error::BankIdError,
};

const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";

/// A simple wrapper on an HTTP client for making requests. Sets sensible defaults such as timeouts,
/// user-agent & ensuring HTTPS. Requests are never retried here; callers own the retry policy.
pub struct Request {
    client: reqwest::Client,
    timeout: Duration,
}

impl Request {
    /// Initializes a new `Request` presenting the configured client certificate and
    /// trusting only the configured CA bundle.
    pub(crate) fn new(config: &Config) -> Result<Self, BankIdError> {
        // reqwest picks its own provider, but the process default must exist for rustls 0.23
        let _ = rustls::crypto::ring::default_provider().install_default();

        let identity = client_identity(&config.tls)?;
        let ca = Certificate::from_pem(config.tls.ca_pem.as_bytes()).map_err(|err| {
            BankIdError::Certificate {
                reason: format!("invalid CA certificate: {err}"),
            }
        })?;

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca)
            .identity(identity)
            .build()
            .map_err(|err| BankIdError::Certificate {
                reason: format!("failed to build TLS client: {err}"),
            })?;

        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    /// A plain client without client certificate, for talking to a local mock server.
    #[cfg(test)]
    pub(crate) fn insecure() -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Creates a request builder with defaults applied.
    pub(crate) fn req(&self, method: Method, url: &str) -> RequestBuilder {
        #[cfg(not(test))]
        assert!(url.starts_with("https"));

        self.client
            .request(method, url)
            .timeout(self.timeout)
            .header(
                "User-Agent",
                format!("bankid-core/{}", env!("CARGO_PKG_VERSION")),
            )
    }

    /// Creates a POST request builder with defaults applied.
    pub(crate) fn post(&self, url: &str) -> RequestBuilder {
        self.req(Method::POST, url)
    }

    /// Sends a request built by `req`/`post`. Failures before a response is
    /// received become a [`BankIdError::NetworkError`] without status.
    pub(crate) async fn handle(
        &self,
        request_builder: RequestBuilder,
    ) -> Result<Response, BankIdError> {
        let (client, request) = request_builder.build_split();
        let request = request.map_err(|err| BankIdError::NetworkError {
            url: err
                .url()
                .map_or_else(|| "<unknown>".to_string(), ToString::to_string),
            status: None,
            error: format!("request build failed: {err}"),
        })?;
        let url = request.url().to_string();

        client
            .execute(request)
            .await
            .map_err(|err| BankIdError::NetworkError {
                url,
                status: None,
                error: if err.is_timeout() || err.is_connect() {
                    format!("request timeout/connect error: {err}")
                } else {
                    format!("request failed: {err}")
                },
            })
    }
}

/// Builds the client identity from the PEM certificate chain and private key.
fn client_identity(tls: &TlsConfig) -> Result<Identity, BankIdError> {
    let key_pem = match &tls.passphrase {
        Some(passphrase) => decrypt_private_key(&tls.client_key_pem, passphrase)?,
        None => Zeroizing::new(tls.client_key_pem.clone()),
    };

    let mut pem = Zeroizing::new(Vec::with_capacity(
        tls.client_cert_pem.len() + key_pem.len() + 1,
    ));
    pem.extend_from_slice(tls.client_cert_pem.as_bytes());
    pem.push(b'\n');
    pem.extend_from_slice(key_pem.as_bytes());

    Identity::from_pem(&pem).map_err(|err| BankIdError::Certificate {
        reason: format!("invalid client certificate or key: {err}"),
    })
}

/// Decrypts an encrypted PKCS#8 key and re-encodes it as an unencrypted PEM key.
fn decrypt_private_key(
    key_pem: &str,
    passphrase: &SecretString,
) -> Result<Zeroizing<String>, BankIdError> {
    let (label, document) =
        SecretDocument::from_pem(key_pem).map_err(|err| BankIdError::Certificate {
            reason: format!("failed to parse private key: {err}"),
        })?;
    if label != ENCRYPTED_KEY_LABEL {
        return Err(BankIdError::Certificate {
            reason: format!(
                "a passphrase was given but the private key is `{label}`, expected `{ENCRYPTED_KEY_LABEL}`"
            ),
        });
    }

    let encrypted = EncryptedPrivateKeyInfo::try_from(document.as_bytes()).map_err(
        |err| BankIdError::Certificate {
            reason: format!("failed to parse encrypted private key: {err}"),
        },
    )?;
    let decrypted = encrypted.decrypt(passphrase.expose_secret()).map_err(|err| {
        BankIdError::Certificate {
            reason: format!("failed to decrypt private key: {err}"),
        }
    })?;

    decrypted
        .to_pem("PRIVATE KEY", LineEnding::LF)
        .map_err(|err| BankIdError::Certificate {
            reason: format!("failed to encode private key: {err}"),
        })
}
