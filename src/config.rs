// ルートB接続設定 / Route-B connection settings
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2026 The denkimeter authors
//
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// ルートB認証ID
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RouteBId(String);

impl RouteBId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for RouteBId {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 32 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(s.to_owned()))
        } else {
            Err("the Route-B ID must be 32 ASCII hex characters".to_owned())
        }
    }
}

impl TryFrom<String> for RouteBId {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RouteBId> for String {
    fn from(id: RouteBId) -> Self {
        id.0
    }
}

impl fmt::Display for RouteBId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for RouteBId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RouteBId({})", self.0)
    }
}

/// ルートBパスワード
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RouteBPassword(String);

impl RouteBPassword {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for RouteBPassword {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if (1..=32).contains(&s.len()) && s.is_ascii() {
            Ok(Self(s.to_owned()))
        } else {
            Err("the Route-B password must be 1 to 32 ASCII characters".to_owned())
        }
    }
}

impl TryFrom<String> for RouteBPassword {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RouteBPassword> for String {
    fn from(pwd: RouteBPassword) -> Self {
        pwd.0
    }
}

// the password never goes to logs
impl fmt::Debug for RouteBPassword {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RouteBPassword(***)")
    }
}

/// スマートメータ接続設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    pub route_b_id: RouteBId,
    pub route_b_password: RouteBPassword,
    pub device: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default = "default_reset_device")]
    pub reset_device: bool,
    #[serde(default = "default_xmit_retries")]
    pub xmit_retries: u32,
    #[serde(default = "default_recv_timeout", with = "duration_secs")]
    pub recv_timeout: Duration,
    #[serde(default = "default_xmit_interval", with = "duration_secs")]
    pub internal_xmit_interval: Duration,
}

impl MeterConfig {
    pub fn new(route_b_id: RouteBId, route_b_password: RouteBPassword, device: String) -> Self {
        Self {
            route_b_id,
            route_b_password,
            device,
            baudrate: default_baudrate(),
            reset_device: default_reset_device(),
            xmit_retries: default_xmit_retries(),
            recv_timeout: default_recv_timeout(),
            internal_xmit_interval: default_xmit_interval(),
        }
    }
}

fn default_baudrate() -> u32 {
    115200
}

fn default_reset_device() -> bool {
    true
}

fn default_xmit_retries() -> u32 {
    12
}

fn default_recv_timeout() -> Duration {
    Duration::from_secs(12)
}

fn default_xmit_interval() -> Duration {
    Duration::from_secs(5)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if secs.is_finite() && secs >= 0.0 {
            Ok(Duration::from_secs_f64(secs))
        } else {
            Err(serde::de::Error::custom("negative or non-finite duration"))
        }
    }
}

#[test]
fn test1() {
    let id: RouteBId = "00112233445566778899AABBCCDDEEFF".parse().unwrap();
    assert_eq!(id.as_str(), "00112233445566778899AABBCCDDEEFF");
    assert!("too short".parse::<RouteBId>().is_err());
    assert!(
        "G0112233445566778899AABBCCDDEEFF".parse::<RouteBId>().is_err(),
        "non-hex characters are rejected"
    );

    let pwd: RouteBPassword = "0123456789AB".parse().unwrap();
    assert_eq!(pwd.as_str(), "0123456789AB");
    assert!("".parse::<RouteBPassword>().is_err());
    assert_eq!(format!("{:?}", pwd), "RouteBPassword(***)");
}

#[test]
fn test2() {
    let toml_text = r#"
route_b_id = "00112233445566778899AABBCCDDEEFF"
route_b_password = "0123456789AB"
device = "/dev/ttyUSB0"
recv_timeout = 6.5
"#;
    let config: MeterConfig = toml::from_str(toml_text).unwrap();
    assert_eq!(config.baudrate, 115200);
    assert!(config.reset_device);
    assert_eq!(config.xmit_retries, 12);
    assert_eq!(config.recv_timeout, Duration::from_millis(6500));
    assert_eq!(config.internal_xmit_interval, Duration::from_secs(5));
}
