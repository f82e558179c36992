use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use algtest_supervisor::config::{get_global_settings_path, SettingsManager, TestProfile};
use algtest_supervisor::log_collector::{ensure_logs_dir_exists, get_global_logs_path};
use algtest_supervisor::{AlgtestController, Connectivity, LifecycleState, LogCollector, SystemImpl};
use anyhow::{anyhow, Context};
use structopt::StructOpt;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

const ONLINE_HINT: &str = "You seem to be connected to the internet. Please upload the data to the \
research database now. Alternatively, reboot and upload the archive from the USB later.";
const OFFLINE_HINT: &str = "You seem to be offline. Please configure the network and upload the data \
to the research database now. Alternatively, reboot and upload the archive from the USB later.";

#[derive(StructOpt, Debug)]
#[structopt(name = "algtest-supervisor")]
struct Opt {
    /// Settings file (JSON). Defaults to the per-user settings path
    #[structopt(long, short = "c", parse(from_os_str))]
    config: Option<PathBuf>,

    /// Test profile: basic or extensive
    #[structopt(long, short = "p")]
    profile: Option<TestProfile>,

    /// Operator contact sent along with the upload
    #[structopt(long)]
    contact: Option<String>,

    /// Upload the results after the run
    #[structopt(long)]
    upload: bool,

    /// Store, upload and power off after a successful run
    #[structopt(long)]
    shutdown_on_success: bool,

    /// Directory for persistent logs (default ./logs)
    #[structopt(long, parse(from_os_str))]
    log_dir: Option<PathBuf>,

    /// Sets a logging level
    #[structopt(long, short = "L", default_value = "info", env = "LOG_LEVEL")]
    logging: log::LevelFilter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    // =========================================================================
    // LOGGING INITIALIZATION - MUST BE FIRST
    // =========================================================================
    let log_dir = match opt.log_dir.clone() {
        Some(dir) => dir,
        None => get_global_logs_path().map_err(|e| anyhow!(e))?,
    };
    ensure_logs_dir_exists(&log_dir).map_err(|e| anyhow!(e))?;
    let log_collector = Arc::new(LogCollector::new(log_dir).map_err(|e| anyhow!(e))?);
    if let Err(e) = log_collector.clone().init_global_logger(opt.logging) {
        eprintln!("[Main] WARNING: {}", e);
    }
    log::info!("algtest-supervisor {} starting", algtest_supervisor::VERSION);

    // =========================================================================
    // CONFIGURATION
    // =========================================================================
    let mut config = match opt.config {
        Some(ref path) => SettingsManager::load_required(path)
            .with_context(|| format!("Cannot load settings from {}", path.display()))?,
        None => match get_global_settings_path() {
            Ok(path) => SettingsManager::load(&path)?,
            Err(_) => Default::default(),
        },
    };
    if let Some(profile) = opt.profile {
        config.profile = profile;
    }
    config.validate()?;

    let stages = config.profile.default_stages();
    let display_lines = config.display_log_lines;
    let mut controller = AlgtestController::new(config, Arc::new(SystemImpl::new()))
        .with_log_sink((*log_collector).clone());

    // =========================================================================
    // RUN AND OBSERVE
    // =========================================================================
    let run_dir = controller.start(stages, opt.contact.clone())?;
    println!("Results directory: {}", run_dir.display());

    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let mut printed_lines = 0usize;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if controller.has_changed() {
                    printed_lines = print_progress(&controller, display_lines, printed_lines);
                }
                if controller.is_finished() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Interrupted, stopping the test...");
                controller.stop();
            }
        }
    }
    print_progress(&controller, display_lines, printed_lines);

    let outcome = controller.get_state();
    let connectivity = controller.get_connectivity();
    println!("Run finished: {} - {}", outcome, controller.get_status());

    // =========================================================================
    // DELIVERY
    // =========================================================================
    let (controller, stored) = tokio::task::spawn_blocking(move || {
        let stored = controller.store_to_volume();
        (controller, stored)
    })
    .await?;
    match stored {
        Ok(path) => println!("Stored on the result volume: {}", path.display()),
        Err(e) => println!("{}", e.user_message()),
    }

    let shutdown = opt.shutdown_on_success && outcome == LifecycleState::Success;
    let mut uploaded = false;
    let controller = if opt.upload || shutdown {
        let (controller, result) = tokio::task::spawn_blocking(move || {
            let result = controller.upload();
            (controller, result)
        })
        .await?;
        match result {
            Ok(()) => {
                uploaded = true;
                println!("Results uploaded successfully.");
            }
            Err(e) => println!("{}", e.user_message()),
        }
        controller
    } else {
        controller
    };

    if !uploaded && outcome == LifecycleState::Success {
        match connectivity {
            Connectivity::Online => println!("{}", ONLINE_HINT),
            Connectivity::Offline => println!("{}", OFFLINE_HINT),
            Connectivity::Unknown => {}
        }
    }

    let _ = log_collector.wait_for_empty();
    if shutdown {
        if let Err(e) = controller.power_off() {
            log::error!("[Main] Power off failed: {}", e);
            eprintln!("Power off failed: {}", e);
        }
    }
    Ok(())
}

/// Print percentage, status and the log lines not shown yet. Returns the new line count.
fn print_progress(controller: &AlgtestController, display_lines: usize, printed: usize) -> usize {
    let (lines, seen) = controller.state().get_log_since(printed);
    let start = lines.len().saturating_sub(display_lines);
    for line in &lines[start..] {
        println!("{}", line);
    }
    println!(
        "[{:>3}%] {} - {}",
        controller.get_percentage(),
        controller.get_state(),
        controller.get_status()
    );
    seen
}
