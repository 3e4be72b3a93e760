use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use udpflow::config;
use udpflow::telemetry::init_logging;
use udpflow::{PcapReplayer, Reactor, ReplayMode, UdpReceiver};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

#[derive(Parser)]
#[command(name = "udpflow")]
#[command(about = "Batched UDP ingestion and capture replay")]
struct Cli {
    /// Path to an optional config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Receive live UDP traffic on the given ports
    Listen {
        /// Ports to subscribe to (also read from config [listen.ports])
        #[arg(value_delimiter = ',')]
        ports: Vec<u16>,
    },
    /// Replay a pcap/pcapng capture
    Replay {
        /// Capture file
        file: Option<PathBuf>,

        /// Destination ports to deliver
        #[arg(short, long, value_delimiter = ',')]
        ports: Vec<u16>,

        /// timed, flood, or step
        #[arg(short, long)]
        mode: Option<String>,

        /// Speed multiplier for timed replay (2.0 = twice as fast)
        #[arg(short, long)]
        speed: Option<f64>,
    },
}

fn main() {
    let cli = Cli::parse();

    let file_config = match &cli.config {
        Some(path) => match config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("[ERROR] failed to load {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => config::Config::default(),
    };

    init_logging(Some(&file_config.log_config()));

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
    }

    let result = match cli.command {
        Commands::Listen { ports } => cmd_listen(&file_config, ports),
        Commands::Replay {
            file,
            ports,
            mode,
            speed,
        } => cmd_replay(&file_config, file, ports, mode, speed),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn cmd_listen(file_config: &config::Config, cli_ports: Vec<u16>) -> udpflow::Result<()> {
    let ports = if cli_ports.is_empty() {
        file_config.listen.ports.clone()
    } else {
        cli_ports
    };
    if ports.is_empty() {
        return Err(udpflow::Error::InvalidArg("no ports to listen on"));
    }

    let reactor = Reactor::new()?;
    let receiver = UdpReceiver::new(&reactor, file_config.receiver_config())?;

    for &port in &ports {
        let bound = receiver.subscribe(
            port,
            Box::new(move |payload, status, ts| {
                info!(
                    port,
                    len = payload.len(),
                    truncated = status.is_truncated(),
                    ts_sec = ts.sec,
                    ts_nsec = ts.nsec,
                    "datagram"
                );
            }),
        )?;
        info!(requested = port, bound, "subscribed");
    }

    // Periodic throughput report; doubles as a liveness signal.
    let stats_receiver = Rc::new(receiver);
    {
        let stats_receiver = stats_receiver.clone();
        reactor.run_every(std::time::Duration::from_secs(10), move || {
            let stats = stats_receiver.stats();
            info!(
                packets = stats.rx_packets.get(),
                bytes = stats.rx_bytes.get(),
                truncated = stats.rx_truncated.get(),
                "receive totals"
            );
        })?;
    }

    info!("listening; ctrl-c to stop");
    while RUNNING.load(Ordering::Relaxed) {
        reactor.run_once(100)?;
    }
    info!("shutting down");
    Ok(())
}

fn cmd_replay(
    file_config: &config::Config,
    cli_file: Option<PathBuf>,
    cli_ports: Vec<u16>,
    cli_mode: Option<String>,
    cli_speed: Option<f64>,
) -> udpflow::Result<()> {
    let file = cli_file
        .or_else(|| file_config.replay.file.clone())
        .ok_or(udpflow::Error::InvalidArg("no capture file given"))?;
    let ports = if cli_ports.is_empty() {
        file_config.replay.ports.clone()
    } else {
        cli_ports
    };
    if ports.is_empty() {
        return Err(udpflow::Error::InvalidArg("no ports to deliver"));
    }

    let mut pcap_config = file_config.pcap_config()?;
    if let Some(mode) = cli_mode {
        pcap_config.mode = config::parse_mode(&mode)?;
    }
    if let Some(speed) = cli_speed {
        pcap_config.speed_multiplier = speed;
    }

    let reactor = Reactor::new()?;
    let replayer = PcapReplayer::new(&reactor, pcap_config)?;
    replayer.open(&file)?;

    for &port in &ports {
        replayer.subscribe(
            port,
            Box::new(move |payload, _status, ts| {
                info!(
                    port,
                    len = payload.len(),
                    ts_sec = ts.sec,
                    ts_nsec = ts.nsec,
                    "replayed datagram"
                );
            }),
        )?;
    }

    replayer.start();
    if pcap_config.mode == ReplayMode::Step {
        warn!("step mode: delivering one packet per loop turn");
    }

    while RUNNING.load(Ordering::Relaxed) && !replayer.is_finished() {
        if pcap_config.mode == ReplayMode::Step && !replayer.step() && replayer.is_finished() {
            break;
        }
        reactor.run_once(100)?;
    }

    let stats = replayer.stats();
    info!(
        delivered = stats.packets_delivered.get(),
        dropped = stats.packets_dropped.get(),
        bytes = stats.bytes_delivered.get(),
        "replay done"
    );
    Ok(())
}
