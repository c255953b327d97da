use std::time::{Duration, SystemTime};

use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio::{select, sync::mpsc::Sender, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, trace, trace_span, warn};

use crate::{
    config_manager::{AttrWrite, DeviceConfig},
    errors::PlatfandError,
    fan_curve::{DUTY_MAX, clamp_duty},
    platform::{FanDirection, FanSource, Platform, PlatformError, sysfs::write_attr},
    scheduler::Ticker,
    thermal_policy::{SensorReading, SensorSnapshot, ThermalDemand, ThermalPolicy},
};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Failed to read {unit}")]
    ReadFailure {
        unit: String,
        #[source]
        source: PlatformError,
    },
    #[error(
        "No fans inserted! Severe overheating hazard. \
         Please insert fans immediately or power off the device"
    )]
    AllFansAbsent,
    #[error("Failed to apply {duty}% duty to fan {fan}")]
    ApplyFailure {
        fan: usize,
        duty: u8,
        #[source]
        source: PlatformError,
    },
    #[error("Failed to {action} fan control")]
    Handoff {
        action: &'static str,
        #[source]
        source: PlatformError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerMode {
    #[default]
    Normal,
    // Every fan is gone, nothing to drive
    Alarm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FanUnit {
    pub index: usize,
    pub present: bool,
    pub direction: Option<FanDirection>,
    // Last duty successfully applied
    pub duty: Option<u8>,
    pub rpm: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PsuUnit {
    pub index: usize,
    pub present: bool,
    pub healthy: bool,
}

// Carried from one cycle to the next, owned by whoever drives the cycles
#[derive(Debug, Clone, Default)]
pub struct ControllerState {
    pub previous: Option<SensorSnapshot>,
    pub last_duty: Option<u8>,
    pub mode: ControllerMode,
}

// Why the thermal demand was replaced with full speed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Override {
    PsuFault { psu: usize },
    PartialFans { present: usize, total: usize },
    FanStalled { fan: usize, rpm: u32 },
}

#[derive(Debug, Serialize)]
pub struct CycleReport {
    pub mode: ControllerMode,
    pub thermal: Option<ThermalDemand>,
    pub overrides: Vec<Override>,
    pub applied_duty: Option<u8>,
    pub fans: Vec<FanUnit>,
    pub psus: Vec<PsuUnit>,
    #[serde(serialize_with = "errors_as_strings")]
    pub errors: Vec<ControlError>,
}

// Run a hardware access with an upper bound on its duration
pub async fn bounded<T>(
    limit: Duration,
    access: impl Future<Output = Result<T, PlatformError>>,
) -> Result<T, PlatformError> {
    timeout(limit, access)
        .await
        .unwrap_or(Err(PlatformError::Timeout(limit)))
}

// Drive every fan to full speed, used on the way out
pub async fn force_full_speed(fans: &dyn FanSource, limit: Duration) -> Vec<ControlError> {
    let mut errors = Vec::new();

    for fan in 0..fans.fan_count() {
        match bounded(limit, fans.apply_duty(fan, DUTY_MAX)).await {
            Ok(()) => trace!("Fan {} set to full speed", fan),
            Err(source) => errors.push(ControlError::ApplyFailure {
                fan,
                duty: DUTY_MAX,
                source,
            }),
        }
    }

    errors
}

pub struct FanManager {
    platform: Platform,
    policy: ThermalPolicy,
    sensor_names: Vec<String>,

    // A present fan at or below this speed is stalled
    stall_rpm: u32,
    // Upper bound for every single hardware access
    read_timeout: Duration,

    fans: Vec<FanUnit>,
    psus: Vec<PsuUnit>,

    takeover: Option<AttrWrite>,
    release: Option<AttrWrite>,
}

impl FanManager {
    pub fn new(
        platform: Platform,
        policy: ThermalPolicy,
        stall_rpm: u32,
        read_timeout: Duration,
    ) -> Self {
        let fans = (0..platform.fans.fan_count())
            .map(|index| FanUnit {
                index,
                present: false,
                direction: None,
                duty: None,
                rpm: 0,
            })
            .collect();

        let psus = (0..platform.psus.psu_count())
            .map(|index| PsuUnit {
                index,
                present: false,
                healthy: false,
            })
            .collect();

        Self {
            sensor_names: policy.sensor_names(),
            platform,
            policy,
            stall_rpm,
            read_timeout,
            fans,
            psus,
            takeover: None,
            release: None,
        }
    }

    // Writes handing fan control over to the daemon and back
    pub fn with_handoff(mut self, takeover: Option<AttrWrite>, release: Option<AttrWrite>) -> Self {
        self.takeover = takeover;
        self.release = release;
        self
    }

    pub fn from_config(platform: Platform, config: &DeviceConfig) -> Self {
        Self::new(
            platform,
            ThermalPolicy::from_config(&config.groups),
            config.stall_rpm,
            config.read_timeout(),
        )
        .with_handoff(config.takeover.clone(), config.release.clone())
    }

    pub fn fans(&self) -> &[FanUnit] {
        &self.fans
    }

    pub fn psus(&self) -> &[PsuUnit] {
        &self.psus
    }

    // Run the fan manager until the token is cancelled,
    // then leave the fans at full speed
    pub async fn run(
        &mut self,
        run_token: CancellationToken,
        mut ticker: impl Ticker,
        tx_err: Sender<anyhow::Error>,
    ) {
        info!("Fan manager: Running");

        if let Err(err) = self.take_control().await {
            tx_err.send(PlatfandError::from(err).into()).await.unwrap_or_else(|err| {
                error!("Fan manager: Couldn't send error to channel: {err}")
            });
        }

        let mut state = ControllerState::default();

        loop {
            select! {
                _ = run_token.cancelled() => {
                    info!("Fan manager: Quiting");

                    break;
                },
                _ = ticker.tick() => {
                    let (next, report) = self
                        .cycle(state)
                        .instrument(trace_span!("cycle"))
                        .await;
                    state = next;

                    // If any error occur send it to the error channel
                    for err in report.errors {
                        tx_err.send(PlatfandError::from(err).into()).await.unwrap_or_else(|err| {
                            error!("Fan manager: Couldn't send error to channel: {err}")
                        });
                    }
                }
            }
        }

        for err in self.shutdown().await {
            tx_err.send(PlatfandError::from(err).into()).await.unwrap_or_else(|err| {
                error!("Failed to send error over channel: {err}");
            });
        }
    }

    // Set every fan to full speed before the daemon goes away,
    // then give fan control back to the board
    pub async fn shutdown(&mut self) -> Vec<ControlError> {
        info!("Setting all fans to {}% before exit", DUTY_MAX);

        let mut errors = force_full_speed(self.platform.fans.as_ref(), self.read_timeout).await;

        for fan in self.fans.iter_mut() {
            let failed = errors
                .iter()
                .any(|e| matches!(e, ControlError::ApplyFailure { fan: f, .. } if *f == fan.index));

            if !failed {
                fan.duty = Some(DUTY_MAX);
            }
        }

        if let Err(err) = self.release_control().await {
            errors.push(err);
        }

        errors
    }

    // Stop the board watchdog from driving the fans
    pub async fn take_control(&self) -> Result<(), ControlError> {
        self.handoff("take", self.takeover.as_ref()).await
    }

    // Let the board watchdog drive the fans again
    pub async fn release_control(&self) -> Result<(), ControlError> {
        self.handoff("release", self.release.as_ref()).await
    }

    async fn handoff(&self, action: &'static str, write: Option<&AttrWrite>) -> Result<(), ControlError> {
        let Some(write) = write else {
            return Ok(());
        };

        info!("Fan control {action}: writing \"{}\" to {:?}", write.value, write.path);

        bounded(self.read_timeout, write_attr(&write.path, &write.value))
            .await
            .map_err(|source| ControlError::Handoff { action, source })
    }

    // One read-compute-apply pass. Read failures never abort
    // the cycle, they push the result toward full speed.
    pub async fn cycle(&mut self, state: ControllerState) -> (ControllerState, CycleReport) {
        let mut errors = Vec::new();

        self.refresh_psus(&mut errors).await;
        self.refresh_fans(&mut errors).await;

        let total = self.fans.len();
        let present = self.fans.iter().filter(|f| f.present).count();

        if present == 0 {
            if state.mode == ControllerMode::Normal {
                self.platform
                    .notifier
                    .critical(&ControlError::AllFansAbsent.to_string());
            }

            let report = CycleReport {
                mode: ControllerMode::Alarm,
                thermal: None,
                overrides: Vec::new(),
                applied_duty: None,
                fans: self.fans.clone(),
                psus: self.psus.clone(),
                errors,
            };

            let state = ControllerState {
                mode: ControllerMode::Alarm,
                ..state
            };

            return (state, report);
        }

        if state.mode == ControllerMode::Alarm {
            info!("{} of {} fans present again, leaving alarm", present, total);
        }

        let snapshot = self.sample_sensors(&mut errors).await;
        // Airflow of the first present fan, unknown if its read failed
        let direction = self
            .fans
            .iter()
            .find(|f| f.present)
            .and_then(|f| f.direction);

        let thermal = self
            .policy
            .demand(&snapshot, state.previous.as_ref(), direction);

        let overrides = self.overrides(present, total);

        let target = if overrides.is_empty() {
            thermal.duty
        } else {
            warn!("Running fans at full speed: {:?}", overrides);
            DUTY_MAX
        };
        let duty = clamp_duty(target);

        debug!(
            "Thermal demand {}% ({:?} airflow), applying {}%",
            thermal.duty, direction, duty
        );

        self.apply(duty, &mut errors).await;

        let report = CycleReport {
            mode: ControllerMode::Normal,
            thermal: Some(thermal),
            overrides,
            applied_duty: Some(duty),
            fans: self.fans.clone(),
            psus: self.psus.clone(),
            errors,
        };

        let state = ControllerState {
            previous: Some(snapshot),
            last_duty: Some(duty),
            mode: ControllerMode::Normal,
        };

        (state, report)
    }

    async fn refresh_psus(&mut self, errors: &mut Vec<ControlError>) {
        let psus = self.platform.psus.as_ref();
        let limit = self.read_timeout;

        for psu in self.psus.iter_mut() {
            let unit = format!("PSU {} presence", psu.index);
            psu.present = bounded(limit, psus.read_presence(psu.index))
                .await
                .unwrap_or_else(|source| {
                    errors.push(ControlError::ReadFailure { unit, source });
                    false
                });

            psu.healthy = if psu.present {
                let unit = format!("PSU {} status", psu.index);
                bounded(limit, psus.read_status(psu.index))
                    .await
                    .unwrap_or_else(|source| {
                        errors.push(ControlError::ReadFailure { unit, source });
                        false
                    })
            } else {
                false
            };

            trace!("PSU {}: {:?}", psu.index, psu);
        }
    }

    async fn refresh_fans(&mut self, errors: &mut Vec<ControlError>) {
        let fans = self.platform.fans.as_ref();
        let limit = self.read_timeout;

        for fan in self.fans.iter_mut() {
            let unit = format!("fan {} presence", fan.index);
            fan.present = bounded(limit, fans.read_presence(fan.index))
                .await
                .unwrap_or_else(|source| {
                    errors.push(ControlError::ReadFailure { unit, source });
                    false
                });

            if !fan.present {
                fan.rpm = 0;
                fan.direction = None;
                continue;
            }

            let unit = format!("fan {} speed", fan.index);
            fan.rpm = bounded(limit, fans.read_rpm(fan.index))
                .await
                .unwrap_or_else(|source| {
                    errors.push(ControlError::ReadFailure { unit, source });
                    0
                });

            let unit = format!("fan {} direction", fan.index);
            fan.direction = bounded(limit, fans.read_direction(fan.index))
                .await
                .map_err(|source| errors.push(ControlError::ReadFailure { unit, source }))
                .ok();

            trace!("Fan {}: {:?}", fan.index, fan);
        }
    }

    async fn sample_sensors(&self, errors: &mut Vec<ControlError>) -> SensorSnapshot {
        let mut snapshot = SensorSnapshot::new();

        for sensor in &self.sensor_names {
            let read = self.platform.sensors.read_temperature(sensor);

            match bounded(self.read_timeout, read).await {
                Ok(value) => {
                    trace!("Sensor \"{}\": {} mC", sensor, value);

                    snapshot.insert(SensorReading {
                        sensor: sensor.clone(),
                        value,
                        taken_at: SystemTime::now(),
                    });
                }
                Err(source) => errors.push(ControlError::ReadFailure {
                    unit: format!("sensor \"{sensor}\""),
                    source,
                }),
            }
        }

        snapshot
    }

    fn overrides(&self, present: usize, total: usize) -> Vec<Override> {
        let mut overrides: Vec<Override> = self
            .psus
            .iter()
            .filter(|psu| !psu.healthy)
            .map(|psu| Override::PsuFault { psu: psu.index })
            .collect();

        if present < total {
            overrides.push(Override::PartialFans { present, total });
        }

        overrides.extend(
            self.fans
                .iter()
                .filter(|fan| fan.present && fan.rpm <= self.stall_rpm)
                .map(|fan| Override::FanStalled {
                    fan: fan.index,
                    rpm: fan.rpm,
                }),
        );

        overrides
    }

    // Apply the same duty to every fan. A rejected command is
    // reported and picked up again on the next cycle.
    async fn apply(&mut self, duty: u8, errors: &mut Vec<ControlError>) {
        let fans = self.platform.fans.as_ref();

        for fan in self.fans.iter_mut() {
            match bounded(self.read_timeout, fans.apply_duty(fan.index, duty)).await {
                Ok(()) => fan.duty = Some(duty),
                Err(source) => errors.push(ControlError::ApplyFailure {
                    fan: fan.index,
                    duty,
                    source,
                }),
            }
        }
    }
}

fn errors_as_strings<S: Serializer>(errors: &[ControlError], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(errors.iter().map(|e| e.to_string()))
}
