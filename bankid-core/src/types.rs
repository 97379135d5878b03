//! Request and response bodies of the BankID RP API (v5).
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// The endpoints of the RP API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Method {
    /// Start an authentication order.
    Auth,
    /// Start a signing order.
    Sign,
    /// Poll the status of an order.
    Collect,
    /// Cancel an order.
    Cancel,
}

/// Restrictions on how the order may be completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    /// Users may confirm with fingerprint instead of their security code.
    pub allow_fingerprint: bool,
    /// Certificate policies the order is restricted to, e.g. mobile BankID only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_policies: Option<Vec<String>>,
}

impl Requirement {
    /// Builds the requirement for an order. When the order is completed on another
    /// device it is restricted to `mobile_policy`.
    #[must_use]
    pub fn new(other_device: bool, mobile_policy: &str) -> Self {
        Self {
            allow_fingerprint: true,
            certificate_policies: other_device.then(|| vec![mobile_policy.to_string()]),
        }
    }
}

/// Body of an `auth` call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    /// IP address of the user agent as seen by the RP.
    pub end_user_ip: String,
    /// Swedish personal number (12 digits) of the user.
    pub personal_number: String,
    /// Completion requirements.
    pub requirement: Requirement,
}

/// Body of a `sign` call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    /// IP address of the user agent as seen by the RP.
    pub end_user_ip: String,
    /// Swedish personal number (12 digits) of the user.
    pub personal_number: String,
    /// Base64 encoded text shown to the user in the app.
    pub user_visible_data: String,
    /// Completion requirements.
    pub requirement: Requirement,
}

impl SignRequest {
    /// Encodes `text` the way the `userVisibleData` field expects it.
    #[must_use]
    pub fn encode_visible_data(text: &str) -> String {
        STANDARD.encode(text.as_bytes())
    }
}

/// Body of `collect` and `cancel` calls.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    /// The order to act on.
    pub order_ref: String,
}

/// Response of `auth` and `sign`.
///
/// Both fields are optional on the wire so that an incomplete response can be
/// reported as a failed request instead of a deserialization error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    /// Token used to launch the BankID app on the same device.
    pub auto_start_token: Option<String>,
    /// Reference used for subsequent `collect` and `cancel` calls.
    pub order_ref: Option<String>,
}

/// Status of an order as reported by `collect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectStatus {
    /// The order is being processed.
    Pending,
    /// Something went wrong. `hintCode` describes what.
    Failed,
    /// The order completed and `completionData` is present.
    Complete,
    /// A status unknown to this crate. Handled like `Pending`.
    #[serde(other)]
    Unknown,
}

/// Response of `collect`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectResponse {
    /// The order this status belongs to.
    pub order_ref: String,
    /// Current status of the order.
    pub status: CollectStatus,
    /// Present when the order is pending or failed.
    pub hint_code: Option<String>,
    /// Present only when the order is complete.
    pub completion_data: Option<CompletionData>,
}

/// Result of a completed order. Everything here must be stored by the RP for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionData {
    /// The user that completed the order.
    pub user: User,
    /// The device the order was completed on.
    pub device: Device,
    /// Validity of the user's BankID certificate.
    pub cert: Cert,
    /// Base64 encoded XML signature.
    pub signature: String,
    /// Base64 encoded OCSP response proving the certificate was valid.
    pub ocsp_response: String,
}

/// Identity of the user in [`CompletionData`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Swedish personal number.
    pub personal_number: String,
    /// Full name.
    pub name: String,
    /// Given name.
    pub given_name: String,
    /// Surname.
    pub surname: String,
}

/// Device information in [`CompletionData`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// IP address of the device as seen by BankID.
    pub ip_address: String,
}

/// Certificate validity in [`CompletionData`], as unix milliseconds in strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cert {
    /// Start of validity.
    pub not_before: String,
    /// End of validity.
    pub not_after: String,
}
