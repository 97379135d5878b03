//! The four RP API methods on top of a [`Transport`].
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::BankIdError,
    transport::Transport,
    types::{
        AuthRequest, CollectResponse, Method, OrderRequest, OrderResponse, Requirement,
        SignRequest,
    },
};

/// Typed client for the RP API. Each method builds a fixed request shape, makes
/// exactly one call and hands errors back unchanged.
pub struct BankIdClient<T> {
    transport: T,
    mobile_policy: String,
}

impl<T: Transport> BankIdClient<T> {
    /// Creates a client sending requests through `transport`. `mobile_policy` is
    /// the certificate policy used for orders completed on another device.
    pub fn new(transport: T, mobile_policy: impl Into<String>) -> Self {
        Self {
            transport,
            mobile_policy: mobile_policy.into(),
        }
    }

    /// Starts an authentication order.
    ///
    /// With `other_device` the order is restricted to mobile BankID, otherwise
    /// any BankID may be used, including fingerprint confirmation.
    ///
    /// # Errors
    /// Returns the transport or API error of the call.
    pub async fn auth(
        &self,
        personal_number: &str,
        end_user_ip: &str,
        other_device: bool,
    ) -> Result<OrderResponse, BankIdError> {
        let body = AuthRequest {
            end_user_ip: end_user_ip.to_string(),
            personal_number: personal_number.to_string(),
            requirement: Requirement::new(other_device, &self.mobile_policy),
        };
        self.call(Method::Auth, &body).await
    }

    /// Starts a signing order for `text`, which is shown to the user in the app.
    ///
    /// # Errors
    /// Returns the transport or API error of the call.
    pub async fn sign(
        &self,
        personal_number: &str,
        text: &str,
        end_user_ip: &str,
        other_device: bool,
    ) -> Result<OrderResponse, BankIdError> {
        let body = SignRequest {
            end_user_ip: end_user_ip.to_string(),
            personal_number: personal_number.to_string(),
            user_visible_data: SignRequest::encode_visible_data(text),
            requirement: Requirement::new(other_device, &self.mobile_policy),
        };
        self.call(Method::Sign, &body).await
    }

    /// Fetches the current status of `order_ref`.
    ///
    /// # Errors
    /// Returns the transport or API error of the call.
    pub async fn collect(&self, order_ref: &str) -> Result<CollectResponse, BankIdError> {
        let body = OrderRequest {
            order_ref: order_ref.to_string(),
        };
        self.call(Method::Collect, &body).await
    }

    /// Cancels `order_ref` at the remote service.
    ///
    /// # Errors
    /// Returns the transport or API error of the call.
    pub async fn cancel(&self, order_ref: &str) -> Result<(), BankIdError> {
        let body = OrderRequest {
            order_ref: order_ref.to_string(),
        };
        let body = serde_json::to_value(&body).map_err(|e| {
            BankIdError::SerializationError {
                error: format!("Failed to serialize cancel request: {e}"),
            }
        })?;
        self.transport.call(Method::Cancel, body).await?;
        Ok(())
    }

    /// The transport requests are sent through.
    #[cfg(test)]
    pub(crate) const fn transport(&self) -> &T {
        &self.transport
    }

    async fn call<B, R>(&self, method: Method, body: &B) -> Result<R, BankIdError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let params =
            serde_json::to_value(body).map_err(|e| BankIdError::SerializationError {
                error: format!("Failed to serialize {method} request: {e}"),
            })?;
        let mut response = self.transport.call(method, params).await?;
        // an empty body carries no fields, not an invalid document
        if response.is_null() {
            response = Value::Object(Map::new());
        }
        serde_json::from_value(response).map_err(|e| BankIdError::SerializationError {
            error: format!("Failed to parse {method} response: {e}"),
        })
    }
}
