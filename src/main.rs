use anyhow::{bail, Result};
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use simplelog::*;
use std::fs;
use std::path::PathBuf;
use std::thread;

use keygated::{InputDaemon, ValidatedArgs};

#[derive(Parser, Debug)]
#[command(author, version, verbatim_doc_comment)]
/// keygated: privileged input daemon of the keygate keyboard scripting
/// system.
///
/// keygated grabs the given keyboards exclusively, forwards their events
/// through a virtual keyboard, and hands the key codes listed in
/// <data-dir>/passthrough_keys/*.csv to the macro daemon connected on the
/// UNIX socket. Run it as a dedicated user that owns the data directory and
/// is in the `input` and `uinput` groups.
struct Args {
    /// Keyboard event devices to grab, e.g. /dev/input/event3.
    #[arg(required = true)]
    devices: Vec<PathBuf>,

    /// Data root holding the passthrough_keys directory.
    #[arg(long, default_value = "/var/lib/keygated")]
    data_dir: PathBuf,

    /// Socket path the macro daemon connects to. Defaults to kbd.sock
    /// inside the data root.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,

    /// Enable trace logging; implies --debug as well.
    #[arg(short, long)]
    trace: bool,
}

/// Parse CLI arguments and initialize logging.
fn cli_init() -> Result<ValidatedArgs> {
    let args = Args::parse();

    let log_lvl = match (args.debug, args.trace) {
        (_, true) => LevelFilter::Trace,
        (true, false) => LevelFilter::Debug,
        (false, false) => LevelFilter::Info,
    };
    let mut log_cfg = ConfigBuilder::new();
    if let Err(e) = log_cfg.set_time_offset_to_local() {
        eprintln!("WARNING: could not set log TZ to local: {e:?}");
    };
    log_cfg.set_time_format_rfc3339();
    CombinedLogger::init(vec![TermLogger::new(
        log_lvl,
        log_cfg.build(),
        TerminalMode::Mixed,
        ColorChoice::AlwaysAnsi,
    )])
    .expect("logger can init");
    log::info!("keygated v{} starting", env!("CARGO_PKG_VERSION"));

    for dev in &args.devices {
        if !dev.exists() {
            bail!("keyboard device does not exist: {}", dev.display());
        }
    }

    let socket_path = args
        .socket
        .unwrap_or_else(|| args.data_dir.join("kbd.sock"));
    Ok(ValidatedArgs {
        devices: args.devices,
        data_dir: args.data_dir,
        socket_path,
    })
}

/// Remove the socket file and die with the default signal behaviour when
/// asked to terminate.
fn cleanup_on_signal(socket_path: PathBuf) {
    thread::spawn(move || {
        let mut signals = Signals::new([SIGINT, SIGTERM]).expect("signal handler installs");
        if let Some(signal) = signals.forever().next() {
            log::info!("caught signal {signal}, shutting down");
            let _ = fs::remove_file(&socket_path);
            signal_hook::low_level::emulate_default_handler(signal)
                .expect("default signal handler");
        }
    });
}

fn main_impl() -> Result<()> {
    let args = cli_init()?;
    cleanup_on_signal(args.socket_path.clone());
    let daemon = InputDaemon::new(&args)?;
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;
    daemon.run()
}

fn main() {
    if let Err(e) = main_impl() {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}
