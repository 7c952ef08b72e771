use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;
use std::str::FromStr;
use thiserror::Error;

const ALPHA_NUM: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn pseudorandom_string(charset: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| charset[rand::random_range(0..charset.len())] as char)
        .collect()
}

/// Identifier of a device, as known to the registry and carried on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl Deref for DeviceId {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<DeviceId> for String {
    fn from(value: DeviceId) -> Self {
        value.0
    }
}

/// Key a device presents to authenticate with the hub.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct SharedAccessKey(String);

impl Deref for SharedAccessKey {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Default for SharedAccessKey {
    fn default() -> Self {
        Self(pseudorandom_string(ALPHA_NUM, 32))
    }
}

impl Display for SharedAccessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SharedAccessKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<SharedAccessKey> for String {
    fn from(value: SharedAccessKey) -> Self {
        value.0
    }
}

#[derive(Debug, Error)]
pub enum ParseConnectionStringError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Malformed pair, expected key=value: {0}")]
    MalformedPair(String),
}

/// Device credentials in `HostName=<host>;DeviceId=<id>;SharedAccessKey=<key>`
/// form. Pairs may appear in any order; unrecognized pairs are ignored for
/// forward compatibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub device_id: DeviceId,
    pub shared_access_key: SharedAccessKey,
}

impl ConnectionString {
    pub fn new(
        host_name: impl Into<String>,
        device_id: impl Into<DeviceId>,
        shared_access_key: impl Into<SharedAccessKey>,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            device_id: device_id.into(),
            shared_access_key: shared_access_key.into(),
        }
    }
}

impl FromStr for ConnectionString {
    type Err = ParseConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut device_id = None;
        let mut shared_access_key = None;

        for pair in s.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ParseConnectionStringError::MalformedPair(pair.to_string()))?;
            match key {
                "HostName" => host_name = Some(value.to_string()),
                "DeviceId" => device_id = Some(DeviceId::from(value)),
                "SharedAccessKey" => {
                    shared_access_key = Some(SharedAccessKey::from(value.to_string()))
                }
                _ => {}
            }
        }

        Ok(Self {
            host_name: host_name.ok_or(ParseConnectionStringError::MissingField("HostName"))?,
            device_id: device_id.ok_or(ParseConnectionStringError::MissingField("DeviceId"))?,
            shared_access_key: shared_access_key
                .ok_or(ParseConnectionStringError::MissingField("SharedAccessKey"))?,
        })
    }
}

impl Display for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HostName={};DeviceId={};SharedAccessKey={}",
            self.host_name, self.device_id, self.shared_access_key
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_connection_string() {
        let parsed: ConnectionString =
            "HostName=hub.example.com;DeviceId=device-1;SharedAccessKey=c2VjcmV0a2V5PT0="
                .parse()
                .unwrap();

        assert_eq!(parsed.host_name, "hub.example.com");
        assert_eq!(parsed.device_id, DeviceId::from("device-1"));
        // Base64 padding after the first '=' belongs to the value
        assert_eq!(*parsed.shared_access_key, "c2VjcmV0a2V5PT0=");
    }

    #[test]
    fn test_parse_is_order_insensitive() {
        let parsed: ConnectionString =
            "SharedAccessKey=key;HostName=hub.example.com;DeviceId=device-1"
                .parse()
                .unwrap();
        assert_eq!(parsed.host_name, "hub.example.com");
    }

    #[test]
    fn test_parse_ignores_unknown_pairs() {
        let parsed: ConnectionString =
            "HostName=hub;DeviceId=d;SharedAccessKey=k;GatewayHostName=edge.local"
                .parse()
                .unwrap();
        assert_eq!(parsed.device_id, DeviceId::from("d"));
    }

    #[test]
    fn test_parse_missing_field() {
        let result: Result<ConnectionString, _> = "HostName=hub;DeviceId=d".parse();
        assert!(matches!(
            result,
            Err(ParseConnectionStringError::MissingField("SharedAccessKey"))
        ));
    }

    #[test]
    fn test_parse_malformed_pair() {
        let result: Result<ConnectionString, _> = "HostName=hub;device".parse();
        assert!(matches!(
            result,
            Err(ParseConnectionStringError::MalformedPair(_))
        ));
    }

    #[test]
    fn test_display_round_trip() {
        let original = ConnectionString::new("hub.example.com", "device-1", "key".to_string());
        let parsed: ConnectionString = original.to_string().parse().unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_default_shared_access_key_is_random() {
        let a = SharedAccessKey::default();
        let b = SharedAccessKey::default();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
