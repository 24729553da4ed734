//! Process-wide controller settings.
//!
//! Settings are read once at startup: an optional JSON file named by
//! `NL_CONTROLLER_SETTINGS`, then one `NL_CONTROLLER_<KEY>` environment
//! variable per recognised key. [`ServerSettings::validate`] runs last and any
//! violation stops the process before it binds a socket.

use std::{env, fs, path::Path, path::PathBuf, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    error::{ControllerError, Result},
    placement::PlacementStrategy,
};

pub const SETTINGS_PATH_ENV: &str = "NL_CONTROLLER_SETTINGS";
const ENV_PREFIX: &str = "NL_CONTROLLER_";
const MIN_VNC_PORT: u16 = 5900;

const RECOGNIZED_KEYS: [&str; 20] = [
    "host",
    "port",
    "protocol",
    "certfile",
    "certkey",
    "enable_ssl",
    "projects_path",
    "additional_images_paths",
    "allowed_interfaces",
    "console_start_port_range",
    "console_end_port_range",
    "vnc_console_start_port_range",
    "vnc_console_end_port_range",
    "udp_start_port_range",
    "udp_end_port_range",
    "compute_username",
    "compute_password",
    "compute_rpc_timeout_ms",
    "placement",
    "local",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerProtocol {
    #[default]
    Http,
    Https,
}

impl ServerProtocol {
    pub fn scheme(self) -> &'static str {
        match self {
            ServerProtocol::Http => "http",
            ServerProtocol::Https => "https",
        }
    }
}

impl FromStr for ServerProtocol {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(ServerProtocol::Http),
            "https" => Ok(ServerProtocol::Https),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub protocol: ServerProtocol,
    pub certfile: Option<PathBuf>,
    pub certkey: Option<PathBuf>,
    pub enable_ssl: bool,
    pub projects_path: PathBuf,
    #[serde(deserialize_with = "deserialize_semicolon_list")]
    pub additional_images_paths: Vec<String>,
    #[serde(deserialize_with = "deserialize_comma_list")]
    pub allowed_interfaces: Vec<String>,
    pub console_start_port_range: u16,
    pub console_end_port_range: u16,
    pub vnc_console_start_port_range: u16,
    pub vnc_console_end_port_range: u16,
    pub udp_start_port_range: u16,
    pub udp_end_port_range: u16,
    pub compute_username: String,
    #[serde(skip_serializing)]
    pub compute_password: String,
    pub compute_rpc_timeout_ms: u64,
    pub placement: PlacementStrategy,
    /// Clients may choose project directories. Only for a controller sharing
    /// its filesystem with its users.
    pub local: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3080,
            protocol: ServerProtocol::Http,
            certfile: None,
            certkey: None,
            enable_ssl: false,
            projects_path: PathBuf::from(".nl-controller/projects"),
            additional_images_paths: Vec::new(),
            allowed_interfaces: Vec::new(),
            console_start_port_range: 5000,
            console_end_port_range: 10000,
            vnc_console_start_port_range: 5900,
            vnc_console_end_port_range: 10000,
            udp_start_port_range: 10000,
            udp_end_port_range: 30000,
            compute_username: "admin".to_string(),
            compute_password: String::new(),
            compute_rpc_timeout_ms: 10_000,
            placement: PlacementStrategy::FirstCapable,
            local: false,
        }
    }
}

impl ServerSettings {
    pub fn load() -> Result<Self> {
        let mut settings = match env::var(SETTINGS_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        settings.apply_overrides(|key| env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|err| {
            ControllerError::InvalidConfiguration(format!(
                "failed to read settings file {}: {err}",
                path.display()
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|err| {
            ControllerError::InvalidConfiguration(format!(
                "failed to parse settings file {}: {err}",
                path.display()
            ))
        })
    }

    /// Overrides each recognised key whose `NL_CONTROLLER_<KEY>` variable is
    /// returned by `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        for key in RECOGNIZED_KEYS {
            let env_key = format!("{ENV_PREFIX}{}", key.to_ascii_uppercase());
            if let Some(raw) = lookup(&env_key) {
                self.set(key, raw.trim())?;
            }
        }
        Ok(())
    }

    fn set(&mut self, key: &str, raw: &str) -> Result<()> {
        match key {
            "host" => self.host = raw.to_string(),
            "port" => self.port = parse_setting(key, raw)?,
            "protocol" => self.protocol = parse_setting(key, raw)?,
            "certfile" => self.certfile = optional_path(raw),
            "certkey" => self.certkey = optional_path(raw),
            "enable_ssl" => self.enable_ssl = parse_bool(key, raw)?,
            "projects_path" => self.projects_path = PathBuf::from(raw),
            "additional_images_paths" => self.additional_images_paths = split_setting_list(raw, ';'),
            "allowed_interfaces" => self.allowed_interfaces = split_setting_list(raw, ','),
            "console_start_port_range" => self.console_start_port_range = parse_setting(key, raw)?,
            "console_end_port_range" => self.console_end_port_range = parse_setting(key, raw)?,
            "vnc_console_start_port_range" => {
                self.vnc_console_start_port_range = parse_setting(key, raw)?;
            }
            "vnc_console_end_port_range" => {
                self.vnc_console_end_port_range = parse_setting(key, raw)?;
            }
            "udp_start_port_range" => self.udp_start_port_range = parse_setting(key, raw)?,
            "udp_end_port_range" => self.udp_end_port_range = parse_setting(key, raw)?,
            "compute_username" => self.compute_username = raw.to_string(),
            "compute_password" => self.compute_password = raw.to_string(),
            "compute_rpc_timeout_ms" => self.compute_rpc_timeout_ms = parse_setting(key, raw)?,
            "placement" => self.placement = parse_setting(key, raw)?,
            "local" => self.local = parse_bool(key, raw)?,
            _ => {
                return Err(ControllerError::InvalidConfiguration(format!(
                    "unrecognised setting {key}"
                )));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(invalid("port must be greater than 0"));
        }
        if self.console_start_port_range == 0 {
            return Err(invalid("console_start_port_range must be greater than 0"));
        }
        if self.udp_start_port_range == 0 {
            return Err(invalid("udp_start_port_range must be greater than 0"));
        }
        if self.vnc_console_start_port_range < MIN_VNC_PORT {
            return Err(invalid(&format!(
                "vnc_console_start_port_range must be >= {MIN_VNC_PORT}"
            )));
        }
        check_range(
            "console",
            self.console_start_port_range,
            self.console_end_port_range,
        )?;
        check_range(
            "vnc_console",
            self.vnc_console_start_port_range,
            self.vnc_console_end_port_range,
        )?;
        check_range("udp", self.udp_start_port_range, self.udp_end_port_range)?;

        if self.enable_ssl {
            if self.certfile.is_none() {
                return Err(invalid("SSL is enabled but certfile is not configured"));
            }
            if self.certkey.is_none() {
                return Err(invalid("SSL is enabled but certkey is not configured"));
            }
        }
        if self.compute_rpc_timeout_ms == 0 {
            return Err(invalid("compute_rpc_timeout_ms must be greater than 0"));
        }
        Ok(())
    }

    pub fn compute_credentials(&self) -> Option<(String, String)> {
        if self.compute_password.is_empty() {
            None
        } else {
            Some((self.compute_username.clone(), self.compute_password.clone()))
        }
    }
}

fn check_range(prefix: &str, start: u16, end: u16) -> Result<()> {
    if end <= start {
        return Err(invalid(&format!(
            "{prefix}_end_port_range must be > {prefix}_start_port_range"
        )));
    }
    Ok(())
}

fn invalid(message: &str) -> ControllerError {
    ControllerError::InvalidConfiguration(message.to_string())
}

fn parse_setting<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|err| {
        ControllerError::InvalidConfiguration(format!("invalid value for {key}: {raw:?} ({err})"))
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ControllerError::InvalidConfiguration(format!(
            "invalid value for {key}: {raw:?} (expected a boolean)"
        ))),
    }
}

fn optional_path(raw: &str) -> Option<PathBuf> {
    if raw.is_empty() {
        None
    } else {
        Some(PathBuf::from(raw))
    }
}

pub fn split_setting_list(raw: &str, delimiter: char) -> Vec<String> {
    raw.split(delimiter)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListSetting {
    Joined(String),
    Items(Vec<String>),
}

fn deserialize_list<'de, D>(deserializer: D, delimiter: char) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<ListSetting>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(ListSetting::Joined(raw)) => split_setting_list(&raw, delimiter),
        Some(ListSetting::Items(items)) => items
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
    })
}

fn deserialize_semicolon_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_list(deserializer, ';')
}

fn deserialize_comma_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_list(deserializer, ',')
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        ServerSettings::default()
            .validate()
            .expect("defaults should validate");
    }

    #[test]
    fn every_port_range_pair_rejects_end_not_above_start() {
        let pairs = [
            ("NL_CONTROLLER_CONSOLE_START_PORT_RANGE", "NL_CONTROLLER_CONSOLE_END_PORT_RANGE"),
            (
                "NL_CONTROLLER_VNC_CONSOLE_START_PORT_RANGE",
                "NL_CONTROLLER_VNC_CONSOLE_END_PORT_RANGE",
            ),
            ("NL_CONTROLLER_UDP_START_PORT_RANGE", "NL_CONTROLLER_UDP_END_PORT_RANGE"),
        ];
        for (start_key, end_key) in pairs {
            for end in ["6000", "5999"] {
                let mut settings = ServerSettings::default();
                settings
                    .apply_overrides(overrides(&[(start_key, "6000"), (end_key, end)]))
                    .expect("overrides should parse");
                let err = settings
                    .validate()
                    .expect_err("end <= start must be rejected");
                assert!(matches!(err, ControllerError::InvalidConfiguration(_)));
            }
        }
    }

    #[test]
    fn vnc_range_must_start_at_or_above_5900() {
        let settings = ServerSettings {
            vnc_console_start_port_range: 5800,
            ..ServerSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn ssl_requires_certificate_and_key() {
        let mut settings = ServerSettings {
            enable_ssl: true,
            ..ServerSettings::default()
        };
        let err = settings.validate().expect_err("missing certfile");
        assert!(err.to_string().contains("certfile"));

        settings.certfile = Some(PathBuf::from("/etc/nl/cert.pem"));
        let err = settings.validate().expect_err("missing certkey");
        assert!(err.to_string().contains("certkey"));

        settings.certkey = Some(PathBuf::from("/etc/nl/key.pem"));
        settings.validate().expect("cert and key set");
    }

    #[test]
    fn path_lists_split_on_their_delimiters() {
        let mut settings = ServerSettings::default();
        settings
            .apply_overrides(overrides(&[
                ("NL_CONTROLLER_ADDITIONAL_IMAGES_PATHS", "/a;/b; ;/c"),
                ("NL_CONTROLLER_ALLOWED_INTERFACES", "eth0, eth1"),
            ]))
            .expect("overrides should parse");
        assert_eq!(settings.additional_images_paths, vec!["/a", "/b", "/c"]);
        assert_eq!(settings.allowed_interfaces, vec!["eth0", "eth1"]);
    }

    #[test]
    fn settings_file_accepts_joined_or_listed_paths() {
        let parsed: ServerSettings = serde_json::from_value(serde_json::json!({
            "additional_images_paths": "/x;/y",
            "allowed_interfaces": ["eth0", "eth1"],
            "placement": "least_loaded"
        }))
        .expect("settings should decode");
        assert_eq!(parsed.additional_images_paths, vec!["/x", "/y"]);
        assert_eq!(parsed.allowed_interfaces, vec!["eth0", "eth1"]);
        assert_eq!(parsed.placement, PlacementStrategy::LeastLoaded);
        assert_eq!(parsed.console_start_port_range, 5000);
    }

    #[test]
    fn unparsable_override_is_invalid_configuration() {
        let mut settings = ServerSettings::default();
        let err = settings
            .apply_overrides(overrides(&[("NL_CONTROLLER_PORT", "eighty")]))
            .expect_err("port must be numeric");
        assert!(matches!(err, ControllerError::InvalidConfiguration(_)));

        let err = settings
            .apply_overrides(overrides(&[("NL_CONTROLLER_ENABLE_SSL", "maybe")]))
            .expect_err("enable_ssl must be boolean");
        assert!(matches!(err, ControllerError::InvalidConfiguration(_)));
    }

    #[test]
    fn credentials_only_when_password_is_set() {
        let mut settings = ServerSettings::default();
        assert!(settings.compute_credentials().is_none());
        settings.compute_password = "secret".to_string();
        assert_eq!(
            settings.compute_credentials(),
            Some(("admin".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn local_mode_is_off_unless_enabled() {
        let mut settings = ServerSettings::default();
        assert!(!settings.local);
        settings
            .apply_overrides(overrides(&[("NL_CONTROLLER_LOCAL", "yes")]))
            .expect("overrides should parse");
        assert!(settings.local);
    }
}
