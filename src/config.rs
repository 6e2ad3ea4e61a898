use crate::device::UsbId;
use crate::error::{BridgeError, ConfigError};
use crate::sensors::LogicalSensorId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use strum::{Display, EnumString};

/// Load environment variables from .env file with robust parsing.
/// Handles values with spaces without requiring quotes.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    if !env_path.exists() {
        return;
    }

    let content = match fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let mut value = value.trim();

            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }

            // Env vars take precedence over the file
            if std::env::var(key).is_err() {
                // SAFETY: called from main before the runtime starts any threads
                unsafe { std::env::set_var(key, value) };
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub acquisition: AcquisitionConfig,
    pub sensors: Vec<SensorConfig>,
    pub validation: ValidationConfig,
    pub supervisor: SupervisorConfig,
    pub publish: PublishConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Root of the state topics (`<prefix>/<sensor>/temperature`).
    pub topic_prefix: String,
    /// Home Assistant discovery prefix.
    pub discovery_prefix: String,
    /// Node id used in discovery topics and unique ids.
    pub node_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        let host = gethostname::gethostname().to_string_lossy().into_owned();
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: format!("hid-climate-bridge-{}", host),
            username: None,
            password: None,
            topic_prefix: "sensors".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            node_id: "hid_climate_bridge".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionMode {
    /// Poll each HID device with a query frame.
    Query,
    /// Read the text the devices type into a shared channel.
    Capture,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub mode: AcquisitionMode,
    pub poll_interval_ms: u64,
    pub exchange_timeout_ms: u64,
    /// Extra vendor/product pairs sharing the TEMPerHUM frame layout.
    pub extra_devices: Vec<UsbId>,
    pub sysfs_root: PathBuf,
    /// `stdin`, a file/FIFO path, or `evdev:<path>`.
    pub capture_source: String,
    /// Take exclusive access to the evdev device so keystrokes stay off the console.
    pub capture_grab: bool,
    pub capture_stale_secs: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            mode: AcquisitionMode::Capture,
            poll_interval_ms: 2000,
            exchange_timeout_ms: 500,
            extra_devices: Vec::new(),
            sysfs_root: PathBuf::from("/sys/class/hidraw"),
            capture_source: "stdin".to_string(),
            capture_grab: true,
            capture_stale_secs: 10,
        }
    }
}

impl AcquisitionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.capture_stale_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub id: LogicalSensorId,
    /// Display name used in discovery metadata.
    pub name: String,
    /// Reporting interval marker typed after each reading (capture mode).
    #[serde(default)]
    pub interval_secs: Option<u32>,
}

impl SensorConfig {
    pub fn new(id: &str, name: &str, interval_secs: Option<u32>) -> Self {
        Self {
            id: LogicalSensorId::from(id),
            name: name.to_string(),
            interval_secs,
        }
    }
}

/// Reference deployment: two sensors typing at 1 s and 2 s intervals.
pub fn default_sensors() -> Vec<SensorConfig> {
    vec![
        SensorConfig::new("sensor_1", "Sensor 1", Some(1)),
        SensorConfig::new("sensor_2", "Sensor 2", Some(2)),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub temperature_min: f64,
    pub temperature_max: f64,
    pub humidity_min: f64,
    pub humidity_max: f64,
    pub clock_skew_tolerance_ms: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            temperature_min: -40.0,
            temperature_max: 80.0,
            humidity_min: 0.0,
            humidity_max: 100.0,
            clock_skew_tolerance_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Consecutive failures before a sensor is reported offline.
    pub offline_threshold: u32,
    /// Cycles between diagnostic summaries in the log.
    pub summary_every: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            offline_threshold: 5,
            summary_every: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_max_ms: u64,
    /// Bound on the final flush at shutdown.
    pub shutdown_flush_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_ms: 250,
            backoff_max_ms: 8000,
            shutdown_flush_ms: 2000,
        }
    }
}

impl Config {
    /// Build the configuration from `CONFIG_FILE` (optional) and the environment.
    pub fn from_env() -> Result<Self, BridgeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Same as [`Config::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, BridgeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("CONFIG_FILE") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        // MQTT configuration
        if let Some(host) = lookup("MQTT_BROKER_HOST") {
            config.mqtt.broker_host = host;
        }
        if let Some(p) = parse_var(&lookup, "MQTT_BROKER_PORT")? {
            config.mqtt.broker_port = p;
        }
        if let Some(client_id) = lookup("MQTT_CLIENT_ID") {
            config.mqtt.client_id = client_id;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            config.mqtt.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            config.mqtt.password = Some(password);
        }
        if let Some(prefix) = lookup("MQTT_TOPIC_PREFIX") {
            config.mqtt.topic_prefix = prefix.trim_end_matches('/').to_string();
        }
        if let Some(prefix) = lookup("MQTT_DISCOVERY_PREFIX") {
            config.mqtt.discovery_prefix = prefix.trim_end_matches('/').to_string();
        }
        if let Some(node_id) = lookup("MQTT_NODE_ID") {
            config.mqtt.node_id = node_id;
        }

        // Acquisition
        if let Some(mode) = parse_var(&lookup, "ACQUISITION_MODE")? {
            config.acquisition.mode = mode;
        }
        if let Some(ms) = parse_var(&lookup, "POLL_INTERVAL_MS")? {
            config.acquisition.poll_interval_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, "EXCHANGE_TIMEOUT_MS")? {
            config.acquisition.exchange_timeout_ms = ms;
        }
        if let Some(ids) = lookup("HID_DEVICES") {
            config.acquisition.extra_devices = parse_usb_ids(&ids)?;
        }
        if let Some(root) = lookup("HIDRAW_SYSFS_ROOT") {
            config.acquisition.sysfs_root = PathBuf::from(root);
        }
        if let Some(source) = lookup("CAPTURE_SOURCE") {
            config.acquisition.capture_source = source;
        }
        if let Some(grab) = parse_var(&lookup, "CAPTURE_GRAB")? {
            config.acquisition.capture_grab = grab;
        }
        if let Some(secs) = parse_var(&lookup, "CAPTURE_STALE_SECS")? {
            config.acquisition.capture_stale_secs = secs;
        }

        // Sensors
        if let Some(spec) = lookup("SENSORS") {
            config.sensors = parse_sensors(&spec)?;
        } else if config.sensors.is_empty() {
            config.sensors = default_sensors();
        }

        // Validation
        if let Some(v) = parse_var(&lookup, "TEMP_MIN")? {
            config.validation.temperature_min = v;
        }
        if let Some(v) = parse_var(&lookup, "TEMP_MAX")? {
            config.validation.temperature_max = v;
        }
        if let Some(v) = parse_var(&lookup, "HUMIDITY_MIN")? {
            config.validation.humidity_min = v;
        }
        if let Some(v) = parse_var(&lookup, "HUMIDITY_MAX")? {
            config.validation.humidity_max = v;
        }
        if let Some(v) = parse_var(&lookup, "CLOCK_SKEW_TOLERANCE_MS")? {
            config.validation.clock_skew_tolerance_ms = v;
        }

        // Supervision and publishing
        if let Some(v) = parse_var(&lookup, "OFFLINE_THRESHOLD")? {
            config.supervisor.offline_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "PUBLISH_MAX_RETRIES")? {
            config.publish.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "PUBLISH_BACKOFF_MS")? {
            config.publish.backoff_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "PUBLISH_BACKOFF_MAX_MS")? {
            config.publish.backoff_max_ms = v;
        }

        Ok(config)
    }

    /// Reject configurations the process cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sensors.is_empty() {
            return Err(ConfigError::NoSensors);
        }

        let mut ids = HashSet::new();
        let mut intervals = HashSet::new();
        for sensor in &self.sensors {
            if !ids.insert(&sensor.id) {
                return Err(ConfigError::DuplicateSensor(sensor.id.to_string()));
            }
            match sensor.interval_secs {
                Some(secs) => {
                    if !intervals.insert(secs) {
                        return Err(ConfigError::DuplicateInterval(secs));
                    }
                }
                None if self.acquisition.mode == AcquisitionMode::Capture => {
                    return Err(ConfigError::MissingInterval(sensor.id.to_string()));
                }
                None => {}
            }
        }

        let v = &self.validation;
        if !(v.temperature_min < v.temperature_max) {
            return Err(ConfigError::InvalidBounds(format!(
                "temperature [{}, {}]",
                v.temperature_min, v.temperature_max
            )));
        }
        if !(v.humidity_min < v.humidity_max) {
            return Err(ConfigError::InvalidBounds(format!(
                "humidity [{}, {}]",
                v.humidity_min, v.humidity_max
            )));
        }

        if self.supervisor.offline_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                key: "OFFLINE_THRESHOLD",
                value: "0".to_string(),
            });
        }
        if self.acquisition.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "POLL_INTERVAL_MS",
                value: "0".to_string(),
            });
        }
        if self.acquisition.mode == AcquisitionMode::Capture
            && self.acquisition.capture_stale_secs == 0
        {
            return Err(ConfigError::InvalidValue {
                key: "CAPTURE_STALE_SECS",
                value: "0".to_string(),
            });
        }
        if self.acquisition.exchange_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "EXCHANGE_TIMEOUT_MS",
                value: "0".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

/// Parse `id:interval:name` entries separated by commas.
///
/// Interval and name are optional (`sensor_3::Garage`, `sensor_1:1`).
pub fn parse_sensors(spec: &str) -> Result<Vec<SensorConfig>, ConfigError> {
    let mut sensors = Vec::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.splitn(3, ':');
        let id = parts.next().unwrap_or_default().trim();
        if id.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "SENSORS",
                value: entry.to_string(),
            });
        }

        let interval_secs = match parts.next().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SENSORS",
                value: entry.to_string(),
            })?),
        };

        let name = match parts.next().map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => id,
        };

        sensors.push(SensorConfig::new(id, name, interval_secs));
    }
    Ok(sensors)
}

/// Parse `vvvv:pppp` hex pairs separated by commas.
pub fn parse_usb_ids(spec: &str) -> Result<Vec<UsbId>, ConfigError> {
    spec.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|entry| {
            entry.parse().map_err(|_| ConfigError::InvalidValue {
                key: "HID_DEVICES",
                value: entry.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.acquisition.mode, AcquisitionMode::Capture);
        assert_eq!(config.sensors, default_sensors());
        assert_eq!(config.supervisor.offline_threshold, 5);
        assert_eq!(config.mqtt.topic_prefix, "sensors");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("ACQUISITION_MODE", "Query"),
            ("MQTT_BROKER_PORT", "8883"),
            ("MQTT_TOPIC_PREFIX", "home/climate/"),
            ("POLL_INTERVAL_MS", "1000"),
            ("OFFLINE_THRESHOLD", "3"),
            ("HID_DEVICES", "1a86:e025"),
        ]))
        .unwrap();
        assert_eq!(config.acquisition.mode, AcquisitionMode::Query);
        assert_eq!(config.mqtt.broker_port, 8883);
        assert_eq!(config.mqtt.topic_prefix, "home/climate");
        assert_eq!(config.acquisition.poll_interval_ms, 1000);
        assert_eq!(config.supervisor.offline_threshold, 3);
        assert_eq!(
            config.acquisition.extra_devices,
            vec![UsbId {
                vendor: 0x1a86,
                product: 0xe025
            }]
        );
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let err = Config::from_lookup(lookup(&[("MQTT_BROKER_PORT", "many")])).unwrap_err();
        assert!(err.to_string().contains("MQTT_BROKER_PORT"));
    }

    #[test]
    fn test_parse_sensors() {
        let sensors = parse_sensors("sensor_1:1:Living Room, sensor_2:2 ,garage::Garage").unwrap();
        assert_eq!(
            sensors,
            vec![
                SensorConfig::new("sensor_1", "Living Room", Some(1)),
                SensorConfig::new("sensor_2", "sensor_2", Some(2)),
                SensorConfig::new("garage", "Garage", None),
            ]
        );
        assert!(parse_sensors("sensor_1:x").is_err());
        assert!(parse_sensors(":1").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_sensors() {
        let config = Config::from_lookup(lookup(&[("SENSORS", "")])).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::NoSensors)));
    }

    #[test]
    fn test_validate_rejects_duplicate_interval() {
        let config = Config::from_lookup(lookup(&[("SENSORS", "a:1,b:1")])).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateInterval(1))
        ));
    }

    #[test]
    fn test_capture_mode_requires_intervals() {
        let config = Config::from_lookup(lookup(&[("SENSORS", "a:1,b")])).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingInterval(_))
        ));

        let config = Config::from_lookup(lookup(&[
            ("SENSORS", "a,b"),
            ("ACQUISITION_MODE", "query"),
        ]))
        .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let config =
            Config::from_lookup(lookup(&[("TEMP_MIN", "50"), ("TEMP_MAX", "10")])).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBounds(_))
        ));
    }

    #[test]
    fn test_json_round_trip_uses_defaults_for_missing_sections() {
        let config: Config =
            serde_json::from_str(r#"{"sensors":[{"id":"attic","name":"Attic","interval_secs":3}]}"#)
                .unwrap();
        assert_eq!(config.sensors, vec![SensorConfig::new("attic", "Attic", Some(3))]);
        assert_eq!(config.publish.max_retries, 5);
        assert_eq!(config.validation, ValidationConfig::default());
    }
}
