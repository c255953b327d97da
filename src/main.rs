use anyhow::{Context, Result};
use platfand::{
    arg_parser::ArgsOptions,
    config_manager::DeviceConfig,
    errors::PlatfandError,
    fan_manager::{ControllerState, FanManager, force_full_speed},
    logger,
    platform::{Platform, sysfs::write_attr},
    scheduler::IntervalTicker,
};
use tokio::{
    select,
    signal::{
        ctrl_c,
        unix::{SignalKind, signal},
    },
    sync::mpsc,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    logger::init_logging();

    // Parse the command line arguments
    let args_options = ArgsOptions::parse();

    let mut config = DeviceConfig::load(args_options.config_file_path.as_deref())
        .with_context(|| "Failed to load the device profile")?;

    if let Some(secs) = args_options.interval_secs {
        config.interval_secs = secs;
        config.validate()?;
    }

    if args_options.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let platform = Platform::from_config(&config);
    let mut fan_manager = FanManager::from_config(platform, &config);

    // A single cycle takes fan control and hands it back right after
    if args_options.once {
        if let Err(err) = fan_manager.take_control().await {
            log_error(&PlatfandError::from(err).into());
        }

        let (_, report) = fan_manager.cycle(ControllerState::default()).await;

        if let Err(err) = fan_manager.release_control().await {
            log_error(&PlatfandError::from(err).into());
        }

        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    info!(
        "Controlling \"{}\": {} fans, {} PSUs, cycle every {:?}",
        config.name,
        config.fans.count,
        config.psus.count,
        config.interval()
    );

    let mut sigterm = signal(SignalKind::terminate())
        .with_context(|| "Failed to install the SIGTERM handler")?;

    // This token and tracker will be used to handle graceful shutdown
    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    // Errors of the control loop are logged here
    let (tx_err, mut rx_err) = mpsc::channel(16);

    let mut fan_task = {
        let token = token.clone();
        let ticker = IntervalTicker::new(config.interval());

        tracker.spawn(async move {
            fan_manager.run(token, ticker, tx_err).await;
        })
    };

    loop {
        select! {
            _ = ctrl_c() => { break; },
            _ = sigterm.recv() => { break; },
            err_msg = rx_err.recv() => {
                match err_msg {
                    Some(err) => log_error(&err),
                    // The control loop is gone
                    None => break,
                }
            }
        }
    }

    // Cancel the token to communicate the program
    // termination to the running tasks
    token.cancel();
    tracker.close();

    // Keep draining errors while the fans are being set to full speed
    let result = loop {
        select! {
            result = &mut fan_task => break result,
            Some(err) = rx_err.recv() => log_error(&err),
        }
    };

    while let Ok(err) = rx_err.try_recv() {
        log_error(&err);
    }

    if let Err(err) = result {
        error!("Fan manager ended abnormally: {err}");

        let fans = Platform::fans_from_config(&config);
        for err in force_full_speed(&fans, config.read_timeout()).await {
            log_error(&PlatfandError::from(err).into());
        }

        if let Some(release) = &config.release {
            if let Err(err) = write_attr(&release.path, &release.value).await {
                log_error(&PlatfandError::from(err).into());
            }
        }
    }

    // Wait for the tasks to finish
    tracker.wait().await;

    Ok(())
}

// Log the full error chain, cycle level failures as warnings
fn log_error(err: &anyhow::Error) {
    let recoverable = err
        .downcast_ref::<PlatfandError>()
        .is_some_and(PlatfandError::is_recoverable);

    for e in err.chain() {
        if recoverable {
            warn!("{e}");
        } else {
            error!("{e}");
        }
    }
}
