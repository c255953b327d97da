use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::{
    config_manager::{DeviceConfig, SensorBackend},
    platform::{
        ipmi::IpmiSensorSource,
        notify::LogSink,
        sysfs::{SysfsFans, SysfsPsus, SysfsSensors},
    },
};

pub mod ipmi;
pub mod notify;
pub mod sysfs;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Failed to access \"{path}\"")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unexpected value \"{value}\" read from {origin}")]
    Parse { origin: String, value: String },
    #[error("Unknown sensor \"{0}\"")]
    UnknownSensor(String),
    #[error("No unit with index {0}")]
    NoSuchUnit(usize),
    #[error("Command \"{command}\" failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("Hardware access timed out after {0:?}")]
    Timeout(Duration),
}

// Airflow direction reported by a fan tray
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanDirection {
    Intake,
    Exhaust,
}

// Temperature sensors, values in millidegrees Celsius
#[async_trait]
pub trait SensorSource: Send + Sync {
    async fn read_temperature(&self, sensor: &str) -> Result<i32, PlatformError>;
}

// Fan trays, addressed by zero based index
#[async_trait]
pub trait FanSource: Send + Sync {
    fn fan_count(&self) -> usize;

    async fn read_presence(&self, fan: usize) -> Result<bool, PlatformError>;
    async fn read_rpm(&self, fan: usize) -> Result<u32, PlatformError>;
    async fn read_direction(&self, fan: usize) -> Result<FanDirection, PlatformError>;

    // Command the fan to the given duty percentage
    async fn apply_duty(&self, fan: usize, percent: u8) -> Result<(), PlatformError>;
}

// Power supplies, addressed by zero based index
#[async_trait]
pub trait PsuSource: Send + Sync {
    fn psu_count(&self) -> usize;

    async fn read_presence(&self, psu: usize) -> Result<bool, PlatformError>;
    // True when the PSU reports power good
    async fn read_status(&self, psu: usize) -> Result<bool, PlatformError>;
}

// Receives alarms the controller cannot resolve by itself
pub trait NotificationSink: Send + Sync {
    fn critical(&self, message: &str);
}

// The set of adapters driving one device
pub struct Platform {
    pub sensors: Box<dyn SensorSource>,
    pub fans: Box<dyn FanSource>,
    pub psus: Box<dyn PsuSource>,
    pub notifier: Box<dyn NotificationSink>,
}

impl Platform {
    // Select and build the adapters described by the device configuration
    pub fn from_config(config: &DeviceConfig) -> Platform {
        let sensors: Box<dyn SensorSource> = match config.sensor_backend {
            SensorBackend::Sysfs => {
                info!("Reading temperatures from sysfs");
                Box::new(SysfsSensors::new(&config.sensors))
            }
            SensorBackend::Ipmi => {
                info!("Reading temperatures through ipmitool");
                Box::new(IpmiSensorSource::new(&config.sensors, config.ipmi.clone()))
            }
        };

        Platform {
            sensors,
            fans: Box::new(Self::fans_from_config(config)),
            psus: Box::new(SysfsPsus::new(&config.psus)),
            notifier: Box::new(LogSink),
        }
    }

    // Build only the fan adapter, used to force the fans to full
    // speed when the controller itself is gone
    pub fn fans_from_config(config: &DeviceConfig) -> SysfsFans {
        SysfsFans::new(&config.fans)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    use super::*;

    // In-memory hardware shared between a test and the adapters
    #[derive(Debug, Default)]
    pub struct FakeHardware {
        pub temps: HashMap<String, Result<i32, ()>>,

        pub fan_present: Vec<bool>,
        pub fan_rpm: Vec<u32>,
        pub fan_direction: Vec<FanDirection>,
        pub fan_presence_fails: Vec<usize>,
        pub fan_direction_fails: Vec<usize>,
        pub fan_apply_fails: Vec<usize>,
        pub fan_hangs: bool,

        pub psu_present: Vec<bool>,
        pub psu_ok: Vec<bool>,

        pub applied: Vec<(usize, u8)>,
        pub alarms: Vec<String>,
    }

    pub type SharedHardware = Arc<Mutex<FakeHardware>>;

    impl FakeHardware {
        // A healthy 3 fan, 2 PSU, 4 sensor box at a cool temperature
        pub fn nominal() -> SharedHardware {
            let temps = [("U4", 30_000), ("U7", 30_000), ("CPU", 50_000), ("U60", 40_000)]
                .into_iter()
                .map(|(name, temp)| (name.to_string(), Ok(temp)))
                .collect();

            Arc::new(Mutex::new(FakeHardware {
                temps,
                fan_present: vec![true; 3],
                fan_rpm: vec![9_000; 3],
                fan_direction: vec![FanDirection::Exhaust; 3],
                psu_present: vec![true; 2],
                psu_ok: vec![true; 2],
                ..Default::default()
            }))
        }
    }

    pub struct FakeSensors(pub SharedHardware);
    pub struct FakeFans(pub SharedHardware);
    pub struct FakePsus(pub SharedHardware);
    pub struct FakeSink(pub SharedHardware);

    pub fn fake_platform(hw: &SharedHardware) -> Platform {
        Platform {
            sensors: Box::new(FakeSensors(hw.clone())),
            fans: Box::new(FakeFans(hw.clone())),
            psus: Box::new(FakePsus(hw.clone())),
            notifier: Box::new(FakeSink(hw.clone())),
        }
    }

    fn unit<T: Copy>(values: &[T], index: usize) -> Result<T, PlatformError> {
        values.get(index).copied().ok_or(PlatformError::NoSuchUnit(index))
    }

    #[async_trait]
    impl SensorSource for FakeSensors {
        async fn read_temperature(&self, sensor: &str) -> Result<i32, PlatformError> {
            let hw = self.0.lock().unwrap();

            match hw.temps.get(sensor) {
                Some(Ok(temp)) => Ok(*temp),
                Some(Err(())) => Err(PlatformError::Parse {
                    origin: sensor.to_string(),
                    value: String::new(),
                }),
                None => Err(PlatformError::UnknownSensor(sensor.to_string())),
            }
        }
    }

    #[async_trait]
    impl FanSource for FakeFans {
        fn fan_count(&self) -> usize {
            self.0.lock().unwrap().fan_present.len()
        }

        async fn read_presence(&self, fan: usize) -> Result<bool, PlatformError> {
            let hangs = self.0.lock().unwrap().fan_hangs;
            if hangs {
                std::future::pending::<()>().await;
            }

            let hw = self.0.lock().unwrap();
            if hw.fan_presence_fails.contains(&fan) {
                return Err(PlatformError::NoSuchUnit(fan));
            }

            unit(&hw.fan_present, fan)
        }

        async fn read_rpm(&self, fan: usize) -> Result<u32, PlatformError> {
            unit(&self.0.lock().unwrap().fan_rpm, fan)
        }

        async fn read_direction(&self, fan: usize) -> Result<FanDirection, PlatformError> {
            let hw = self.0.lock().unwrap();
            if hw.fan_direction_fails.contains(&fan) {
                return Err(PlatformError::Parse {
                    origin: format!("fan {fan} direction"),
                    value: String::new(),
                });
            }

            unit(&hw.fan_direction, fan)
        }

        async fn apply_duty(&self, fan: usize, percent: u8) -> Result<(), PlatformError> {
            let mut hw = self.0.lock().unwrap();
            if hw.fan_apply_fails.contains(&fan) {
                return Err(PlatformError::NoSuchUnit(fan));
            }

            hw.applied.push((fan, percent));

            Ok(())
        }
    }

    #[async_trait]
    impl PsuSource for FakePsus {
        fn psu_count(&self) -> usize {
            self.0.lock().unwrap().psu_present.len()
        }

        async fn read_presence(&self, psu: usize) -> Result<bool, PlatformError> {
            unit(&self.0.lock().unwrap().psu_present, psu)
        }

        async fn read_status(&self, psu: usize) -> Result<bool, PlatformError> {
            unit(&self.0.lock().unwrap().psu_ok, psu)
        }
    }

    impl NotificationSink for FakeSink {
        fn critical(&self, message: &str) {
            self.0.lock().unwrap().alarms.push(message.to_string());
        }
    }
}
