use std::{
    collections::HashSet,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to open Json configuration file \"{path}\"")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse Json configuration file \"{path}\"")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// Where temperatures are read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorBackend {
    Sysfs,
    Ipmi,
}

// Remote BMC, when unset ipmitool talks to the local /dev/ipmi0
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpmiConfig {
    pub host: String,
    #[serde(default = "default_ipmi_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,

    // sysfs file holding the millidegree reading
    #[serde(default)]
    pub path: Option<PathBuf>,
    // BMC sensor number used by the ipmi backend
    #[serde(default)]
    pub ipmi_sensor: Option<u8>,
}

// Fan tray sysfs layout. In every path template `{}` is replaced
// with the unit label, or the 1 based unit number without labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanConfig {
    pub count: usize,
    pub labels: Option<Vec<String>>,

    pub presence: String,
    pub rpm: String,
    pub direction: String,
    pub pwm: String,

    pub pwm_max: u32,
    pub presence_active_low: bool,
    // Raw direction value meaning intake, anything else is exhaust
    pub intake_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PsuConfig {
    pub count: usize,
    pub labels: Option<Vec<String>>,

    pub presence: String,
    pub status: String,

    pub presence_active_low: bool,
    pub status_active_low: bool,
}

// A single value written to a sysfs attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrWrite {
    pub path: PathBuf,
    pub value: String,
}

// Threshold pair in millidegrees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandConfig {
    pub low: i32,
    pub high: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupSource {
    // A single sensor
    Sensor { sensor: String },
    // Sensor picked by the fan airflow direction
    ByDirection { intake: String, exhaust: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,

    #[serde(flatten)]
    pub source: GroupSource,

    pub rising: BandConfig,
    pub falling: BandConfig,
}

// Description of one device model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,

    pub interval_secs: u64,
    pub read_timeout_ms: u64,
    // A present fan at or below this speed is stalled
    pub stall_rpm: u32,

    pub sensor_backend: SensorBackend,
    pub ipmi: Option<IpmiConfig>,

    pub sensors: Vec<SensorConfig>,
    pub fans: FanConfig,
    pub psus: PsuConfig,
    pub groups: Vec<GroupConfig>,

    // Hands fan control from the board watchdog to the daemon
    // before the first cycle, and back to it on exit
    pub takeover: Option<AttrWrite>,
    pub release: Option<AttrWrite>,
}

impl DeviceConfig {
    // Load and validate the device description, without a path
    // the built-in reference device is used
    pub fn load(path: Option<&Path>) -> Result<DeviceConfig, ConfigError> {
        let config = match path {
            Some(path) => Self::parse_config_file(path)?,
            None => {
                debug!("No configuration file given, using built-in profile");
                DeviceConfig::default()
            }
        };

        config.validate()?;

        trace!("Current device config: {:?}", config);

        Ok(config)
    }

    fn parse_config_file(path: &Path) -> Result<DeviceConfig, ConfigError> {
        debug!("Parsing config file at: {:?}", path);

        let file = File::open(path).map_err(|source| ConfigError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let buf = BufReader::new(file);

        let mut config: DeviceConfig =
            serde_json::from_reader(buf).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.dedup_sensors();

        Ok(config)
    }

    // Keep the first definition of every sensor name
    fn dedup_sensors(&mut self) {
        let mut seen = HashSet::new();

        self.sensors.retain(|sensor| {
            let first = seen.insert(sensor.name.clone());

            if !first {
                warn!("Redefinition of sensor: \"{}\", ignoring it", sensor.name);
            }

            first
        });
    }

    // Reject descriptions the controller could not run safely
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.interval_secs == 0 {
            return invalid("interval_secs must be greater than zero".into());
        }
        if self.read_timeout_ms == 0 {
            return invalid("read_timeout_ms must be greater than zero".into());
        }
        if self.fans.count == 0 {
            return invalid("at least one fan is required".into());
        }
        if self.fans.pwm_max == 0 {
            return invalid("fans.pwm_max must be greater than zero".into());
        }
        if self.groups.is_empty() {
            return invalid("at least one sensor group is required".into());
        }

        if self.takeover.is_some() && self.release.is_none() {
            return invalid("takeover requires a release write".into());
        }

        check_labels("fans", self.fans.count, &self.fans.labels)?;
        check_labels("psus", self.psus.count, &self.psus.labels)?;

        for sensor in &self.sensors {
            match self.sensor_backend {
                SensorBackend::Sysfs if sensor.path.is_none() => {
                    return invalid(format!("sensor \"{}\" has no sysfs path", sensor.name));
                }
                SensorBackend::Ipmi if sensor.ipmi_sensor.is_none() => {
                    return invalid(format!("sensor \"{}\" has no ipmi sensor number", sensor.name));
                }
                _ => {}
            }
        }

        let known: HashSet<&str> = self.sensors.iter().map(|s| s.name.as_str()).collect();

        for group in &self.groups {
            let names: Vec<&str> = match &group.source {
                GroupSource::Sensor { sensor } => vec![sensor.as_str()],
                GroupSource::ByDirection { intake, exhaust } => {
                    vec![intake.as_str(), exhaust.as_str()]
                }
            };

            if let Some(unknown) = names.iter().find(|n| !known.contains(*n)) {
                return invalid(format!(
                    "group \"{}\" uses unknown sensor \"{}\"",
                    group.name, unknown
                ));
            }

            for (trend, band) in [("rising", group.rising), ("falling", group.falling)] {
                if band.low >= band.high {
                    return invalid(format!(
                        "group \"{}\": {} band low threshold must be below the high one",
                        group.name, trend
                    ));
                }
            }

            if group.falling.low > group.rising.low || group.falling.high > group.rising.high {
                return invalid(format!(
                    "group \"{}\": falling thresholds must not exceed rising thresholds",
                    group.name
                ));
            }
        }

        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

fn check_labels(
    what: &str,
    count: usize,
    labels: &Option<Vec<String>>,
) -> Result<(), ConfigError> {
    match labels {
        Some(labels) if labels.len() != count => Err(ConfigError::Invalid(format!(
            "{what}: {} labels given for {count} units",
            labels.len()
        ))),
        _ => Ok(()),
    }
}

// Substitute the unit label (or 1 based number) into a path template
pub fn unit_path(template: &str, labels: &Option<Vec<String>>, index: usize) -> PathBuf {
    let label = labels
        .as_ref()
        .and_then(|labels| labels.get(index).cloned())
        .unwrap_or_else(|| (index + 1).to_string());

    PathBuf::from(template.replace("{}", &label))
}

fn default_ipmi_port() -> u16 {
    623
}

const FAN_SYSFS: &str = "/sys/bus/i2c/drivers/pddf.fan/2-0032";
const CPLD_SYSFS: &str = "/sys/devices/platform/pddf.cpld";

// The reference device: 3 fan trays, 2 PSUs and 4 temperature sensors
impl Default for DeviceConfig {
    fn default() -> Self {
        let sensor = |name: &str, path: &str, ipmi: u8| SensorConfig {
            name: name.to_string(),
            path: Some(PathBuf::from(path)),
            ipmi_sensor: Some(ipmi),
        };

        let band = |low, high| BandConfig { low, high };

        Self {
            name: "reference".to_string(),

            interval_secs: 10,
            read_timeout_ms: 2000,
            stall_rpm: 1000,

            sensor_backend: SensorBackend::Sysfs,
            ipmi: None,

            sensors: vec![
                sensor("U4", "/sys/bus/i2c/devices/2-0048/hwmon/hwmon2/temp1_input", 0x01),
                sensor("U7", "/sys/bus/i2c/devices/2-0049/hwmon/hwmon3/temp1_input", 0x02),
                sensor("CPU", "/sys/devices/platform/coretemp.0/hwmon/hwmon1/temp1_input", 0x05),
                sensor("U60", "/sys/bus/i2c/devices/2-004a/hwmon/hwmon4/temp1_input", 0x06),
            ],
            fans: FanConfig::default(),
            psus: PsuConfig::default(),
            groups: vec![
                GroupConfig {
                    name: "airflow".to_string(),
                    source: GroupSource::ByDirection {
                        intake: "U7".to_string(),
                        exhaust: "U4".to_string(),
                    },
                    rising: band(35_000, 48_000),
                    falling: band(32_000, 45_000),
                },
                GroupConfig {
                    name: "cpu".to_string(),
                    source: GroupSource::Sensor {
                        sensor: "CPU".to_string(),
                    },
                    rising: band(70_000, 85_000),
                    falling: band(67_000, 82_000),
                },
                GroupConfig {
                    name: "asic".to_string(),
                    source: GroupSource::Sensor {
                        sensor: "U60".to_string(),
                    },
                    rising: band(55_000, 70_000),
                    falling: band(52_000, 67_000),
                },
            ],

            takeover: None,
            release: None,
        }
    }
}

impl Default for FanConfig {
    fn default() -> Self {
        Self {
            count: 3,
            labels: None,

            presence: format!("{FAN_SYSFS}/fan{{}}_present"),
            rpm: format!("{FAN_SYSFS}/fan{{}}_input"),
            direction: format!("{FAN_SYSFS}/fan{{}}_direction"),
            pwm: format!("{FAN_SYSFS}/pwm{{}}"),

            pwm_max: 255,
            presence_active_low: true,
            intake_value: "1".to_string(),
        }
    }
}

impl Default for PsuConfig {
    fn default() -> Self {
        Self {
            count: 2,
            labels: Some(vec!["R".to_string(), "L".to_string()]),

            presence: format!("{CPLD_SYSFS}/psu{{}}_prs"),
            status: format!("{CPLD_SYSFS}/psu{{}}_status"),

            presence_active_low: true,
            status_active_low: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn builtin_profile_is_valid() {
        let config = DeviceConfig::load(None).unwrap();

        assert_eq!(config.interval(), Duration::from_secs(10));
        assert_eq!(config.read_timeout(), Duration::from_millis(2000));
        assert_eq!(config.fans.count, 3);
        assert_eq!(config.psus.count, 2);
        assert_eq!(config.groups.len(), 3);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let file = write_config(
            r#"{
                "name": "tiny",
                "interval_secs": 5,
                "sensors": [ { "name": "T1", "path": "/tmp/t1" } ],
                "fans": { "count": 2 },
                "groups": [
                    {
                        "name": "board",
                        "sensor": "T1",
                        "rising": { "low": 40000, "high": 50000 },
                        "falling": { "low": 38000, "high": 48000 }
                    }
                ]
            }"#,
        );

        let config = DeviceConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.name, "tiny");
        assert_eq!(config.interval_secs, 5);
        assert_eq!(config.stall_rpm, 1000);
        assert_eq!(config.fans.count, 2);
        assert_eq!(config.fans.pwm_max, 255);
        assert_eq!(
            config.groups[0].source,
            GroupSource::Sensor {
                sensor: "T1".to_string()
            }
        );
    }

    #[test]
    fn direction_group_is_parsed() {
        let file = write_config(
            r#"{
                "sensors": [
                    { "name": "IN", "path": "/tmp/in" },
                    { "name": "OUT", "path": "/tmp/out" }
                ],
                "groups": [
                    {
                        "name": "airflow",
                        "intake": "IN",
                        "exhaust": "OUT",
                        "rising": { "low": 35000, "high": 48000 },
                        "falling": { "low": 32000, "high": 45000 }
                    }
                ]
            }"#,
        );

        let config = DeviceConfig::load(Some(file.path())).unwrap();

        assert_eq!(
            config.groups[0].source,
            GroupSource::ByDirection {
                intake: "IN".to_string(),
                exhaust: "OUT".to_string()
            }
        );
    }

    #[test]
    fn duplicate_sensors_keep_first() {
        let file = write_config(
            r#"{
                "sensors": [
                    { "name": "T1", "path": "/tmp/first" },
                    { "name": "T1", "path": "/tmp/second" }
                ],
                "groups": [
                    {
                        "name": "board",
                        "sensor": "T1",
                        "rising": { "low": 40000, "high": 50000 },
                        "falling": { "low": 38000, "high": 48000 }
                    }
                ]
            }"#,
        );

        let config = DeviceConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.sensors.len(), 1);
        assert_eq!(config.sensors[0].path, Some(PathBuf::from("/tmp/first")));
    }

    #[test]
    fn falling_band_above_rising_is_rejected() {
        let mut config = DeviceConfig::default();
        config.groups[1].falling = BandConfig {
            low: 72_000,
            high: 82_000,
        };

        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn inverted_band_is_rejected() {
        let mut config = DeviceConfig::default();
        config.groups[0].rising = BandConfig {
            low: 48_000,
            high: 35_000,
        };

        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_group_sensor_is_rejected() {
        let mut config = DeviceConfig::default();
        config.groups[2].source = GroupSource::Sensor {
            sensor: "nope".to_string(),
        };

        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn no_fans_is_rejected() {
        let mut config = DeviceConfig::default();
        config.fans.count = 0;

        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ipmi_backend_needs_sensor_numbers() {
        let mut config = DeviceConfig::default();
        config.sensor_backend = SensorBackend::Ipmi;
        assert!(config.validate().is_ok());

        config.sensors[0].ipmi_sensor = None;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn handoff_writes_are_parsed() {
        let file = write_config(
            r#"{
                "takeover": { "path": "/sys/fan_cpld/heartbeat", "value": "1" },
                "release": { "path": "/sys/fan_cpld/heartbeat", "value": "0" }
            }"#,
        );

        let config = DeviceConfig::load(Some(file.path())).unwrap();

        assert_eq!(
            config.takeover,
            Some(AttrWrite {
                path: PathBuf::from("/sys/fan_cpld/heartbeat"),
                value: "1".to_string()
            })
        );
        assert_eq!(config.release.unwrap().value, "0");
    }

    #[test]
    fn takeover_without_release_is_rejected() {
        let mut config = DeviceConfig::default();
        config.takeover = Some(AttrWrite {
            path: PathBuf::from("/sys/fan_cpld/heartbeat"),
            value: "1".to_string(),
        });

        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_reports_open_error() {
        let err = DeviceConfig::load(Some(Path::new("/nonexistent/platfand.json"))).unwrap_err();

        assert!(matches!(err, ConfigError::Open { .. }));
    }

    #[test]
    fn malformed_file_reports_parse_error() {
        let file = write_config("{ not json");

        let err = DeviceConfig::load(Some(file.path())).unwrap_err();

        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn unit_path_uses_labels_or_numbers() {
        let labels = Some(vec!["R".to_string(), "L".to_string()]);

        assert_eq!(
            unit_path("/cpld/psu{}_prs", &labels, 1),
            PathBuf::from("/cpld/psuL_prs")
        );
        assert_eq!(
            unit_path("/fan/fan{}_input", &None, 2),
            PathBuf::from("/fan/fan3_input")
        );
    }
}
