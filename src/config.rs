use serde::Deserialize;
use std::env;
use std::net::IpAddr;

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub purifier: PurifierConfig,
    pub bark: BarkConfig,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    /// Also the account segment of every topic.
    pub username: String,
    pub password: String,
    pub device_mac: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct PurifierConfig {
    pub ip: IpAddr,
    pub token: [u8; 16],
    /// Most severe first; the first matching range wins.
    pub air_quality_ranges: Vec<AirQualityRange>,
    pub modes: ModeCodes,
}

#[derive(Debug, Clone)]
pub struct BarkConfig {
    /// URL with a single `%s` placeholder for the message. Empty disables notifications.
    pub api_url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AirQualityRange {
    pub co2_threshold: i64,
    pub pm25_threshold: i64,
    pub action: Action,
    #[serde(default)]
    pub speed: Option<i64>,
}

impl AirQualityRange {
    pub fn matches(&self, co2: i64, pm25: i64) -> bool {
        co2 >= self.co2_threshold || pm25 >= self.pm25_threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Off,
    Sleep,
    Favorite,
    Manual,
}

/// Protocol-level values of the purifier's mode property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ModeCodes {
    pub sleep: i64,
    pub favorite: i64,
    /// Manual fan-level mode.
    pub none: i64,
}

// Serde structs mirroring the config file layout
#[derive(Deserialize)]
struct RawConfig {
    mqtt: RawMqtt,
    purifier: RawPurifier,
    #[serde(default)]
    bark: Option<RawBark>,
}

#[derive(Deserialize)]
struct RawMqtt {
    broker: String,
    #[serde(default)]
    port: Option<u16>,
    username: String,
    password: String,
    device_mac: String,
    #[serde(default)]
    client_id: Option<String>,
}

#[derive(Deserialize)]
struct RawPurifier {
    ip: String,
    token: String,
    air_quality_ranges: Vec<AirQualityRange>,
    modes: ModeCodes,
}

#[derive(Deserialize)]
struct RawBark {
    #[serde(default)]
    api_url: Option<String>,
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load the file named by `CONFIG_FILE` (default `config.json`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = env_or_default("CONFIG_FILE", "config.json".to_string());
        Self::load(&path)
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_string(),
                source,
            },
            other => other,
        })
    }

    /// Parse a JSON document that may contain `//` line comments.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_str(&strip_line_comments(content)).map_err(|source| {
                ConfigError::Parse {
                    path: "<inline>".to_string(),
                    source,
                }
            })?;

        let ip: IpAddr = raw
            .purifier
            .ip
            .trim()
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("purifier.ip: {e}")))?;
        let token = parse_token(&raw.purifier.token)?;

        let config = Self {
            mqtt: MqttConfig {
                broker: raw.mqtt.broker,
                port: raw.mqtt.port.unwrap_or(1883),
                username: raw.mqtt.username,
                password: raw.mqtt.password,
                device_mac: raw.mqtt.device_mac,
                client_id: raw
                    .mqtt
                    .client_id
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| "purifier-control".to_string()),
            },
            purifier: PurifierConfig {
                ip,
                token,
                air_quality_ranges: raw.purifier.air_quality_ranges,
                modes: raw.purifier.modes,
            },
            bark: BarkConfig {
                api_url: raw.bark.and_then(|b| b.api_url).unwrap_or_default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.mqtt.broker.is_empty() {
            return invalid("mqtt.broker must not be empty");
        }
        if self.mqtt.username.is_empty() {
            return invalid("mqtt.username must not be empty");
        }
        if self.mqtt.device_mac.is_empty() {
            return invalid("mqtt.device_mac must not be empty");
        }
        if self.purifier.air_quality_ranges.is_empty() {
            return invalid("purifier.air_quality_ranges must not be empty");
        }
        if !self.bark.api_url.is_empty() && !self.bark.api_url.contains("%s") {
            return invalid("bark.api_url needs a %s placeholder for the message");
        }
        for (i, range) in self.purifier.air_quality_ranges.iter().enumerate() {
            if range.action == Action::Manual && range.speed.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "purifier.air_quality_ranges[{i}]: manual action requires a speed"
                )));
            }
        }
        Ok(())
    }

    /// Topic the sensor publishes readings on.
    pub fn event_topic(&self) -> String {
        format!(
            "{}/airnow/{}/event/post",
            self.mqtt.username, self.mqtt.device_mac
        )
    }

    /// Topic that asks the sensor for a fresh reading.
    pub fn command_topic(&self) -> String {
        format!(
            "{}/airnow/{}/event/set",
            self.mqtt.username, self.mqtt.device_mac
        )
    }
}

/// Decode the 32 hex character device token.
fn parse_token(hex: &str) -> Result<[u8; 16], ConfigError> {
    let hex = hex.trim();
    if hex.len() != 32 || !hex.is_ascii() {
        return Err(ConfigError::Invalid(
            "purifier.token must be 32 hex characters".into(),
        ));
    }
    let mut token = [0u8; 16];
    for (i, byte) in token.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|e| ConfigError::Invalid(format!("purifier.token: {e}")))?;
    }
    Ok(token)
}

/// Drop `//` comments that sit outside string literals.
/// `"https://api.day.app/key/%s"` is left alone.
fn strip_line_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                // skip to end of line, keep the newline
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}
