use log::{debug, info};
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::models::{DeviceProfile, PacketFormat};

const DEFAULT_SCAN_DURATION_SECS: u64 = 5;

/// Immutable, ordered table of recognized devices.
///
/// Iteration order is the order devices were configured in and drives the
/// export column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    profiles: Vec<DeviceProfile>,
}

impl Registry {
    pub fn new(profiles: Vec<DeviceProfile>) -> Result<Self, ConfigError> {
        if profiles.is_empty() {
            return Err(ConfigError::EmptyRegistry);
        }
        let mut names = HashSet::new();
        let mut characteristics = HashSet::new();
        for profile in &profiles {
            if !names.insert(profile.name.as_str()) {
                return Err(ConfigError::DuplicateName(profile.name.clone()));
            }
            if !characteristics.insert(profile.characteristic) {
                return Err(ConfigError::DuplicateCharacteristic(profile.characteristic));
            }
        }
        Ok(Self { profiles })
    }

    pub fn get(&self, name: &str) -> Option<&DeviceProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Position of a device in registry order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.profiles.iter().position(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceProfile> {
        self.profiles.iter()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Parse one `name=uuid:format` entry.
fn parse_entry(entry: &str) -> Result<DeviceProfile, ConfigError> {
    let (name, rest) = entry
        .split_once('=')
        .ok_or_else(|| ConfigError::MalformedEntry(entry.to_string()))?;
    let (characteristic, format) = rest
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::MalformedEntry(entry.to_string()))?;
    build_profile(name, characteristic, format)
}

fn build_profile(name: &str, characteristic: &str, format: &str) -> Result<DeviceProfile, ConfigError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ConfigError::MalformedEntry(name.to_string()));
    }
    let characteristic = characteristic.trim();
    let uuid = Uuid::parse_str(characteristic).map_err(|source| ConfigError::InvalidCharacteristic {
        value: characteristic.to_string(),
        source,
    })?;
    Ok(DeviceProfile {
        name: name.to_string(),
        characteristic: uuid,
        format: format.parse()?,
    })
}

/// Parse the comma-separated `IMU_DEVICES` value into a registry.
pub fn parse_device_list(value: &str) -> Result<Registry, ConfigError> {
    let profiles = value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(parse_entry)
        .collect::<Result<Vec<_>, _>>()?;
    Registry::new(profiles)
}

/// Build a registry from `IMU_DEVICE_<N>_*` triples, ordered by `N`.
fn parse_indexed_devices<I>(vars: I) -> Result<Registry, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let vars: Vec<(String, String)> = vars.into_iter().collect();
    let lookup = |key: &str| {
        vars.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };

    let mut indices: Vec<u32> = vars
        .iter()
        .filter_map(|(key, _)| {
            key.strip_prefix("IMU_DEVICE_")
                .and_then(|s| s.strip_suffix("_NAME"))
                .and_then(|s| s.parse().ok())
        })
        .collect();
    indices.sort_unstable();

    let mut profiles = Vec::new();
    for index in indices {
        let name = lookup(&format!("IMU_DEVICE_{}_NAME", index)).unwrap_or_default();
        let characteristic = lookup(&format!("IMU_DEVICE_{}_CHARACTERISTIC", index))
            .ok_or_else(|| ConfigError::MalformedEntry(name.clone()))?;
        let format = lookup(&format!("IMU_DEVICE_{}_FORMAT", index))
            .ok_or_else(|| ConfigError::MalformedEntry(name.clone()))?;
        profiles.push(build_profile(&name, &characteristic, &format)?);
    }
    Registry::new(profiles)
}

fn parse_optional<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub registry: Registry,
    pub scan_duration: Duration,
    pub export_dir: PathBuf,
    /// Readiness latch threshold. `None` means every active device.
    pub sync_min_devices: Option<usize>,
    pub reference_timestamps: Option<PathBuf>,
    pub stream_duration: Option<Duration>,
}

impl SessionConfig {
    pub fn new(registry: Registry) -> Self {
        SessionConfig {
            registry,
            scan_duration: Duration::from_secs(DEFAULT_SCAN_DURATION_SECS),
            export_dir: PathBuf::from("."),
            sync_min_devices: None,
            reference_timestamps: None,
            stream_duration: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();

        let registry = match env::var("IMU_DEVICES") {
            Ok(devices) => {
                debug!("Found IMU_DEVICES: '{}'", devices);
                parse_device_list(&devices)?
            }
            Err(_) => {
                debug!("IMU_DEVICES not set, trying indexed IMU_DEVICE_<N>_* variables");
                parse_indexed_devices(env::vars())?
            }
        };

        info!("Registry holds {} device(s)", registry.len());
        for profile in registry.iter() {
            info!(
                "Device: {} -> {} ({:?})",
                profile.name, profile.characteristic, profile.format
            );
        }

        let mut config = SessionConfig::new(registry);
        if let Some(secs) = parse_optional::<u64>("SCAN_DURATION_SECS")? {
            config.scan_duration = Duration::from_secs(secs);
        }
        if let Ok(dir) = env::var("EXPORT_DIR") {
            config.export_dir = PathBuf::from(dir);
        }
        config.sync_min_devices = parse_optional("SYNC_MIN_DEVICES")?;
        config.reference_timestamps = env::var("REFERENCE_TIMESTAMPS").ok().map(PathBuf::from);
        config.stream_duration = parse_optional::<u64>("STREAM_DURATION_SECS")?.map(Duration::from_secs);

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAD: &str = "02340015-cbed-76db-9423-74ce6ab55dee";
    const WRIST: &str = "02340016-cbed-76db-9423-74ce6ab55dee";

    #[test]
    fn device_list_keeps_configured_order() {
        let registry =
            parse_device_list(&format!("Wrist={}:six_axis, Head={}:angle", WRIST, HEAD)).unwrap();
        let names: Vec<_> = registry.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["Wrist", "Head"]);
        assert_eq!(registry.get("Head").unwrap().format, PacketFormat::Angle);
        assert_eq!(registry.position("Head"), Some(1));
        assert!(!registry.contains("Ankle"));
    }

    #[test]
    fn duplicate_characteristic_is_rejected() {
        let err = parse_device_list(&format!("A={}:angle,B={}:angle", HEAD, HEAD)).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateCharacteristic(_)));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let err = parse_device_list(&format!("A={}:angle,A={}:angle", HEAD, WRIST)).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName(_)));
    }

    #[test]
    fn malformed_entries_are_reported() {
        assert!(matches!(
            parse_device_list("Head").unwrap_err(),
            ConfigError::MalformedEntry(_)
        ));
        assert!(matches!(
            parse_device_list("Head=not-a-uuid:angle").unwrap_err(),
            ConfigError::InvalidCharacteristic { .. }
        ));
        assert!(matches!(parse_device_list(" , ").unwrap_err(), ConfigError::EmptyRegistry));
    }

    #[test]
    fn indexed_variables_are_ordered_by_index() {
        let vars = vec![
            ("IMU_DEVICE_2_NAME".to_string(), "Wrist".to_string()),
            ("IMU_DEVICE_2_CHARACTERISTIC".to_string(), WRIST.to_string()),
            ("IMU_DEVICE_2_FORMAT".to_string(), "nine_axis".to_string()),
            ("IMU_DEVICE_1_NAME".to_string(), "Head".to_string()),
            ("IMU_DEVICE_1_CHARACTERISTIC".to_string(), HEAD.to_string()),
            ("IMU_DEVICE_1_FORMAT".to_string(), "angle".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        let registry = parse_indexed_devices(vars).unwrap();
        let names: Vec<_> = registry.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["Head", "Wrist"]);
    }
}
