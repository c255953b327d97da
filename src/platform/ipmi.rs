// Temperatures read from the BMC through `ipmitool raw`

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::{
    config_manager::{IpmiConfig, SensorConfig},
    platform::{PlatformError, SensorSource},
};

// Sensor/Event netfn, Get Sensor Reading command
const IPMI_SENSOR_NETFN: &str = "0x04";
const IPMI_GET_SENSOR_READING: &str = "0x2d";

pub struct IpmiSensorSource {
    // Sensor name to BMC sensor number
    sensors: HashMap<String, u8>,
    bmc: Option<IpmiConfig>,
}

impl IpmiSensorSource {
    pub fn new(sensors: &[SensorConfig], bmc: Option<IpmiConfig>) -> Self {
        let sensors = sensors
            .iter()
            .filter_map(|s| s.ipmi_sensor.map(|number| (s.name.clone(), number)))
            .collect();

        Self { sensors, bmc }
    }

    // Build an ipmitool command with the interface flags.
    // A configured BMC host is reached over LAN, otherwise
    // the local /dev/ipmi0 interface is used.
    fn ipmitool(&self) -> Command {
        let mut cmd = Command::new("ipmitool");

        match &self.bmc {
            Some(bmc) => {
                debug!("IPMI routing to BMC: {}:{}", bmc.host, bmc.port);
                cmd.args(["-I", "lanplus", "-H", &bmc.host])
                    .args(["-p", &bmc.port.to_string()])
                    .args(["-U", &bmc.user, "-P", &bmc.password]);
            }
            None => {
                cmd.args(["-I", "open"]);
            }
        }

        // A timed out read drops the future, take the child with it
        cmd.kill_on_drop(true);

        cmd
    }

    async fn run_raw(&self, bytes: &[String]) -> Result<String, PlatformError> {
        let mut cmd = self.ipmitool();
        cmd.arg("raw").args(bytes);

        let command = format!("ipmitool raw {}", bytes.join(" "));
        trace!("Executing: {}", command);

        let output = cmd.output().await.map_err(|err| PlatformError::Command {
            command: command.clone(),
            stderr: err.to_string(),
        })?;

        if !output.status.success() {
            return Err(PlatformError::Command {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl SensorSource for IpmiSensorSource {
    async fn read_temperature(&self, sensor: &str) -> Result<i32, PlatformError> {
        let number = self
            .sensors
            .get(sensor)
            .ok_or_else(|| PlatformError::UnknownSensor(sensor.to_string()))?;

        let bytes = [
            IPMI_SENSOR_NETFN.to_string(),
            IPMI_GET_SENSOR_READING.to_string(),
            format!("0x{number:02x}"),
        ];

        let output = self.run_raw(&bytes).await?;

        parse_sensor_reading(sensor, &output)
    }
}

// The first byte of a Get Sensor Reading answer is the
// value in whole degrees, e.g. " 2a c0 c0\n" is 42 C
pub fn parse_sensor_reading(sensor: &str, output: &str) -> Result<i32, PlatformError> {
    let parse_err = || PlatformError::Parse {
        origin: format!("ipmi sensor \"{sensor}\""),
        value: output.trim().to_string(),
    };

    let first = output.split_whitespace().next().ok_or_else(parse_err)?;
    let degrees = u8::from_str_radix(first, 16).map_err(|_| parse_err())?;

    Ok(i32::from(degrees) * 1000)
}
