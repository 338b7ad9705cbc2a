use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use autotier_control::ControlServer;
use autotier_core::{Config, PopularityConstants};
use autotier_fsd::FsFacade;
use autotier_storage::{AdHocWork, MetaStore, OpenFileSet, TieringEngine};
use clap::Parser;
use fuser::MountOption;
use nix::sys::signal::{self, SigHandler, Signal};

#[derive(Debug, Parser)]
#[command(name = "autotierfs", about = "Tiered filesystem mount daemon", version)]
struct Cli {
    /// Directory to mount the tiered filesystem at.
    mountpoint: PathBuf,

    /// Path to the autotier config file.
    #[arg(short = 'c', long, default_value = "/etc/autotier.conf")]
    config: PathBuf,

    /// Extra driver options, passed through to the FUSE mount (-o opt,opt=val).
    #[arg(short = 'o', value_delimiter = ',')]
    options: Vec<String>,

    /// Suppress informational output.
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Verbose output.
    #[arg(short = 'v', long)]
    verbose: bool,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

extern "C" fn wake_blocking_read(_signum: i32) {}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if cli.quiet {
        config.global.log_level = 0;
    } else if cli.verbose {
        config.global.log_level = 2;
    }
    autotier_fsd::logging::init_stdout(config.global.log_level as i64);

    let run_path = config.run_path();
    std::fs::create_dir_all(&run_path)?;

    let tiers = autotier_storage::tiers_from_config(&config);
    let metastore = Arc::new(MetaStore::open(&run_path.join("db"))?);
    let openfiles = Arc::new(OpenFileSet::new());
    let constants = PopularityConstants::default();

    let engine = Arc::new(TieringEngine::new(
        tiers.clone(),
        metastore.clone(),
        openfiles.clone(),
        constants,
        run_path.clone(),
        config.global.copy_buffer_size as usize,
        config.global.tier_period_secs,
        config.global.strict_period,
    ));

    let tiering_engine = engine.clone();
    let tiering_thread = std::thread::Builder::new()
        .name("autotier-pass".into())
        .spawn(move || tiering_engine.run_loop())?;

    let control_engine = engine.clone();
    let control = Arc::new(ControlServer::new(
        run_path.clone(),
        tiers.clone(),
        metastore.clone(),
        config.dump(),
        move |work: AdHocWork| control_engine.enqueue_adhoc(work),
    )?);

    let (pthread_tx, pthread_rx) = std::sync::mpsc::channel();
    let control_for_thread = control.clone();
    let control_thread = std::thread::Builder::new()
        .name("autotier-control".into())
        .spawn(move || {
            let _ = pthread_tx.send(nix::sys::pthread::pthread_self());
            control_for_thread.serve()
        })?;
    let control_pthread = pthread_rx.recv_timeout(Duration::from_secs(5)).ok();

    unsafe {
        signal::signal(Signal::SIGINT, SigHandler::Handler(request_shutdown))?;
        signal::signal(Signal::SIGTERM, SigHandler::Handler(request_shutdown))?;
        signal::signal(Signal::SIGUSR1, SigHandler::Handler(wake_blocking_read))?;
    }

    let facade_engine = engine.clone();
    let blocking_pass_engine = engine.clone();
    let facade = FsFacade::new(
        tiers.clone(),
        metastore.clone(),
        openfiles.clone(),
        config.global.copy_buffer_size as usize,
        config.global.strict_period,
        move || facade_engine.enqueue_adhoc(AdHocWork::Oneshot),
        move || {
            if let Err(e) = blocking_pass_engine.run_pass() {
                tracing::warn!(error = %e, "tiering pass requested by a write retry failed");
            }
        },
    );

    let mut mount_options = vec![MountOption::FSName("autotier".to_string())];
    mount_options.extend(cli.options.iter().filter_map(|opt| parse_mount_option(opt)));

    tracing::info!(mountpoint = %cli.mountpoint.display(), "mounting");
    let session = fuser::spawn_mount2(facade, &cli.mountpoint, &mount_options)?;

    // Once the kernel mount is live the daemon detaches from the controlling
    // terminal's log stream and moves diagnostics to syslog (§7).
    if let Err(e) = autotier_fsd::logging::switch_to_syslog(config.global.log_level as i64) {
        tracing::warn!(error = %e, "failed to switch to syslog, staying on stdout");
    }

    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    tracing::info!("shutdown requested, stopping");
    engine.stop();
    control.stop();

    if let Some(pthread) = control_pthread {
        let _ = nix::sys::pthread::pthread_kill(pthread, Signal::SIGUSR1);
    }

    drop(session);
    let _ = tiering_thread.join();
    let _ = control_thread.join();

    Ok(())
}

/// Recognizes the handful of driver options autotier cares about (`ro`,
/// `allow_other`); anything else is passed through as a free-form option so
/// platform-specific flags still reach the kernel driver.
fn parse_mount_option(raw: &str) -> Option<MountOption> {
    match raw {
        "ro" => Some(MountOption::RO),
        "rw" => Some(MountOption::RW),
        "allow_other" => Some(MountOption::AllowOther),
        "allow_root" => Some(MountOption::AllowRoot),
        "auto_unmount" => Some(MountOption::AutoUnmount),
        "" => None,
        other => Some(MountOption::CUSTOM(other.to_string())),
    }
}
