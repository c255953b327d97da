use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    str::FromStr,
};

use async_trait::async_trait;
use tracing::trace;

use crate::{
    config_manager::{FanConfig, PsuConfig, SensorConfig, unit_path},
    platform::{FanDirection, FanSource, PlatformError, PsuSource, SensorSource},
};

// Read a sysfs attribute, without the trailing newline
pub async fn read_attr(path: &Path) -> Result<String, PlatformError> {
    tokio::fs::read_to_string(path)
        .await
        .map(|s| s.trim().to_string())
        .map_err(|source| PlatformError::Io {
            path: path.to_path_buf(),
            source,
        })
}

pub async fn write_attr(path: &Path, value: &str) -> Result<(), PlatformError> {
    trace!("Writing \"{}\" to {:?}", value, path);

    tokio::fs::write(path, value)
        .await
        .map_err(|source| PlatformError::Io {
            path: path.to_path_buf(),
            source,
        })
}

async fn read_parsed<T: FromStr>(path: &Path) -> Result<T, PlatformError> {
    let value = read_attr(path).await?;

    value.parse().map_err(|_| PlatformError::Parse {
        origin: path.display().to_string(),
        value,
    })
}

// Read a 0/1 flag, honoring active low wiring
async fn read_flag(path: &Path, active_low: bool) -> Result<bool, PlatformError> {
    let raw: u8 = read_parsed(path).await?;

    match raw {
        0 | 1 => Ok((raw == 1) != active_low),
        _ => Err(PlatformError::Parse {
            origin: path.display().to_string(),
            value: raw.to_string(),
        }),
    }
}

// Convert a duty percentage to a raw PWM register value
pub fn duty_to_pwm(percent: u8, pwm_max: u32) -> u32 {
    u32::from(percent.min(100)) * pwm_max / 100
}

// hwmon style temperature inputs
pub struct SysfsSensors {
    paths: HashMap<String, PathBuf>,
}

impl SysfsSensors {
    pub fn new(sensors: &[SensorConfig]) -> Self {
        let paths = sensors
            .iter()
            .filter_map(|s| s.path.clone().map(|path| (s.name.clone(), path)))
            .collect();

        Self { paths }
    }
}

#[async_trait]
impl SensorSource for SysfsSensors {
    async fn read_temperature(&self, sensor: &str) -> Result<i32, PlatformError> {
        let path = self
            .paths
            .get(sensor)
            .ok_or_else(|| PlatformError::UnknownSensor(sensor.to_string()))?;

        read_parsed(path).await
    }
}

pub struct SysfsFans {
    config: FanConfig,
}

impl SysfsFans {
    pub fn new(config: &FanConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn path(&self, template: &str, fan: usize) -> Result<PathBuf, PlatformError> {
        if fan >= self.config.count {
            return Err(PlatformError::NoSuchUnit(fan));
        }

        Ok(unit_path(template, &self.config.labels, fan))
    }
}

#[async_trait]
impl FanSource for SysfsFans {
    fn fan_count(&self) -> usize {
        self.config.count
    }

    async fn read_presence(&self, fan: usize) -> Result<bool, PlatformError> {
        let path = self.path(&self.config.presence, fan)?;

        read_flag(&path, self.config.presence_active_low).await
    }

    async fn read_rpm(&self, fan: usize) -> Result<u32, PlatformError> {
        let path = self.path(&self.config.rpm, fan)?;

        read_parsed(&path).await
    }

    async fn read_direction(&self, fan: usize) -> Result<FanDirection, PlatformError> {
        let path = self.path(&self.config.direction, fan)?;

        let raw = read_attr(&path).await?;

        if raw == self.config.intake_value {
            Ok(FanDirection::Intake)
        } else {
            Ok(FanDirection::Exhaust)
        }
    }

    async fn apply_duty(&self, fan: usize, percent: u8) -> Result<(), PlatformError> {
        let path = self.path(&self.config.pwm, fan)?;
        let pwm = duty_to_pwm(percent, self.config.pwm_max);

        write_attr(&path, &pwm.to_string()).await
    }
}

pub struct SysfsPsus {
    config: PsuConfig,
}

impl SysfsPsus {
    pub fn new(config: &PsuConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn path(&self, template: &str, psu: usize) -> Result<PathBuf, PlatformError> {
        if psu >= self.config.count {
            return Err(PlatformError::NoSuchUnit(psu));
        }

        Ok(unit_path(template, &self.config.labels, psu))
    }
}

#[async_trait]
impl PsuSource for SysfsPsus {
    fn psu_count(&self) -> usize {
        self.config.count
    }

    async fn read_presence(&self, psu: usize) -> Result<bool, PlatformError> {
        let path = self.path(&self.config.presence, psu)?;

        read_flag(&path, self.config.presence_active_low).await
    }

    async fn read_status(&self, psu: usize) -> Result<bool, PlatformError> {
        let path = self.path(&self.config.status, psu)?;

        read_flag(&path, self.config.status_active_low).await
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn fan_tree(dir: &TempDir) -> FanConfig {
        let root = dir.path().display();

        for fan in 1..=2 {
            fs::write(dir.path().join(format!("fan{fan}_input")), "9600\n").unwrap();
            fs::write(dir.path().join(format!("pwm{fan}")), "128\n").unwrap();
        }
        fs::write(dir.path().join("fan1_present"), "0\n").unwrap();
        fs::write(dir.path().join("fan2_present"), "1\n").unwrap();
        fs::write(dir.path().join("fan1_direction"), "1\n").unwrap();
        fs::write(dir.path().join("fan2_direction"), "0\n").unwrap();

        FanConfig {
            count: 2,
            labels: None,
            presence: format!("{root}/fan{{}}_present"),
            rpm: format!("{root}/fan{{}}_input"),
            direction: format!("{root}/fan{{}}_direction"),
            pwm: format!("{root}/pwm{{}}"),
            pwm_max: 255,
            presence_active_low: true,
            intake_value: "1".to_string(),
        }
    }

    #[tokio::test]
    async fn reads_fan_attributes() {
        let dir = TempDir::new().unwrap();
        let fans = SysfsFans::new(&fan_tree(&dir));

        assert_eq!(fans.fan_count(), 2);
        assert!(fans.read_presence(0).await.unwrap());
        assert!(!fans.read_presence(1).await.unwrap());
        assert_eq!(fans.read_rpm(0).await.unwrap(), 9600);
        assert_eq!(fans.read_direction(0).await.unwrap(), FanDirection::Intake);
        assert_eq!(fans.read_direction(1).await.unwrap(), FanDirection::Exhaust);
    }

    #[tokio::test]
    async fn writes_duty_as_pwm() {
        let dir = TempDir::new().unwrap();
        let fans = SysfsFans::new(&fan_tree(&dir));

        fans.apply_duty(1, 100).await.unwrap();
        fans.apply_duty(0, 40).await.unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("pwm2")).unwrap(), "255");
        assert_eq!(fs::read_to_string(dir.path().join("pwm1")).unwrap(), "102");
    }

    #[tokio::test]
    async fn out_of_range_fan_is_rejected() {
        let dir = TempDir::new().unwrap();
        let fans = SysfsFans::new(&fan_tree(&dir));

        assert!(matches!(
            fans.read_rpm(2).await,
            Err(PlatformError::NoSuchUnit(2))
        ));
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let mut config = fan_tree(&dir);
        config.rpm = format!("{}/missing{{}}", dir.path().display());

        let fans = SysfsFans::new(&config);

        assert!(matches!(
            fans.read_rpm(0).await,
            Err(PlatformError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn garbage_flag_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let config = fan_tree(&dir);
        fs::write(dir.path().join("fan1_present"), "N/A\n").unwrap();

        let fans = SysfsFans::new(&config);

        assert!(matches!(
            fans.read_presence(0).await,
            Err(PlatformError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn reads_labelled_psus() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().display();

        fs::write(dir.path().join("psuR_prs"), "0").unwrap();
        fs::write(dir.path().join("psuL_prs"), "1").unwrap();
        fs::write(dir.path().join("psuR_status"), "1").unwrap();
        fs::write(dir.path().join("psuL_status"), "0").unwrap();

        let psus = SysfsPsus::new(&PsuConfig {
            count: 2,
            labels: Some(vec!["R".to_string(), "L".to_string()]),
            presence: format!("{root}/psu{{}}_prs"),
            status: format!("{root}/psu{{}}_status"),
            presence_active_low: true,
            status_active_low: false,
        });

        assert_eq!(psus.psu_count(), 2);
        assert!(psus.read_presence(0).await.unwrap());
        assert!(psus.read_status(0).await.unwrap());
        assert!(!psus.read_presence(1).await.unwrap());
        assert!(!psus.read_status(1).await.unwrap());
    }

    #[tokio::test]
    async fn reads_millidegree_temperature() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temp1_input");
        fs::write(&path, "41250\n").unwrap();

        let sensors = SysfsSensors::new(&[SensorConfig {
            name: "U4".to_string(),
            path: Some(path),
            ipmi_sensor: None,
        }]);

        assert_eq!(sensors.read_temperature("U4").await.unwrap(), 41_250);
        assert!(matches!(
            sensors.read_temperature("U7").await,
            Err(PlatformError::UnknownSensor(_))
        ));
    }

    #[test]
    fn duty_scales_to_pwm_range() {
        assert_eq!(duty_to_pwm(0, 255), 0);
        assert_eq!(duty_to_pwm(40, 255), 102);
        assert_eq!(duty_to_pwm(100, 255), 255);
        assert_eq!(duty_to_pwm(150, 255), 255);
        assert_eq!(duty_to_pwm(55, 100), 55);
    }
}
