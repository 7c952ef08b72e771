//! Client for the device registry.
//!
//! Devices must exist in the registry before they can open a session with
//! the hub. For provisioning flows a device id that is already taken is not
//! fatal; [`RegistryClient::create_or_fetch`] folds that case into fetching
//! the existing identity.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, field, warn};

use crate::types::{ConnectionString, DeviceId, SharedAccessKey};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Device already exists")]
    AlreadyExists,

    #[error("Device not found")]
    NotFound,

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Registry returned error: ({0}) {1}")]
    Status(StatusCode, String),
}

/// A device entry in the registry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    pub primary_key: SharedAccessKey,
}

impl DeviceIdentity {
    /// Credentials for connecting this identity to the hub at `host_name`.
    pub fn connection_string(&self, host_name: impl Into<String>) -> ConnectionString {
        ConnectionString::new(host_name, self.device_id.clone(), self.primary_key.clone())
    }
}

#[derive(Debug, Serialize)]
struct CreateDeviceRequest {
    device_id: DeviceId,
}

pub struct RegistryClient {
    client: Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl RegistryClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Registers a new device identity. A device id that is already taken
    /// returns [`RegistryError::AlreadyExists`].
    pub async fn create_device(
        &self,
        device_id: impl Into<DeviceId>,
    ) -> Result<DeviceIdentity, RegistryError> {
        let device_id = device_id.into();

        debug!(device_id = %device_id, "registering device");
        let response = self
            .client
            .put(format!("{}/devices/{}", self.endpoint, device_id))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&CreateDeviceRequest {
                device_id: device_id.clone(),
            })
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            StatusCode::CONFLICT => Err(RegistryError::AlreadyExists),
            status => {
                warn!(response = field::display(status), "received error response");
                let err_msg = response.text().await.unwrap_or_default();
                Err(RegistryError::Status(status, err_msg))
            }
        }
    }

    /// Fetches an existing device identity.
    pub async fn get_device(&self, device_id: &DeviceId) -> Result<DeviceIdentity, RegistryError> {
        let response = self
            .client
            .get(format!("{}/devices/{}", self.endpoint, device_id))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound),
            status => {
                warn!(response = field::display(status), "received error response");
                let err_msg = response.text().await.unwrap_or_default();
                Err(RegistryError::Status(status, err_msg))
            }
        }
    }

    /// Registers the device or, if it already exists, fetches its identity.
    pub async fn create_or_fetch(
        &self,
        device_id: impl Into<DeviceId>,
    ) -> Result<DeviceIdentity, RegistryError> {
        let device_id = device_id.into();
        match self.create_device(device_id.clone()).await {
            Ok(identity) => Ok(identity),
            Err(RegistryError::AlreadyExists) => {
                debug!(device_id = %device_id, "device exists, fetching identity");
                self.get_device(&device_id).await
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_create_device() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/devices/device-1")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"device_id": "device-1", "primary_key": "secret"}"#)
            .create_async()
            .await;

        let client =
            RegistryClient::new(server.url(), "test-key").with_timeout(Duration::from_secs(5));
        let identity = client.create_device("device-1").await.unwrap();
        assert_eq!(identity.device_id, "device-1".into());
        assert_eq!(*identity.primary_key, "secret");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_device_conflict() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/devices/device-1")
            .with_status(409)
            .create_async()
            .await;

        let client = RegistryClient::new(server.url(), "test-key");
        let err = client.create_device("device-1").await.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_or_fetch_recovers_existing_device() {
        let mut server = Server::new_async().await;
        let create = server
            .mock("PUT", "/devices/device-1")
            .with_status(409)
            .create_async()
            .await;
        let get = server
            .mock("GET", "/devices/device-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"device_id": "device-1", "primary_key": "secret"}"#)
            .create_async()
            .await;

        let client = RegistryClient::new(server.url(), "test-key");
        let identity = client.create_or_fetch("device-1").await.unwrap();
        assert_eq!(*identity.primary_key, "secret");

        create.assert_async().await;
        get.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_device_not_found() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/devices/missing")
            .with_status(404)
            .create_async()
            .await;

        let client = RegistryClient::new(server.url(), "test-key");
        let err = client.get_device(&"missing".into()).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_carries_status_and_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/devices/device-1")
            .with_status(500)
            .with_body("internal error")
            .create_async()
            .await;

        let client = RegistryClient::new(server.url(), "test-key");
        match client.create_device("device-1").await.unwrap_err() {
            RegistryError::Status(status, body) => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "internal error");
            }
            err => panic!("unexpected error: {err}"),
        }

        mock.assert_async().await;
    }

    #[test]
    fn test_connection_string_from_identity() {
        let identity = DeviceIdentity {
            device_id: "device-1".into(),
            primary_key: "secret".to_string().into(),
        };
        assert_eq!(
            identity.connection_string("hub.example.com").to_string(),
            "HostName=hub.example.com;DeviceId=device-1;SharedAccessKey=secret"
        );
    }
}
