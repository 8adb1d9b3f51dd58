use std::env;
use std::os::unix::process::CommandExt;
use std::process::{self, Command};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use loragw_pktfwd::hal::mcu::command::ECmdSpiTarget;
use loragw_pktfwd::hal::mcu::Mcu;
use loragw_pktfwd::hal::{ChipRegistry, RadioDriver, LGW_MAX_PAYLOAD};
use loragw_pktfwd::pktfwd::config::{PlatformConfig, ServerConf};
use loragw_pktfwd::pktfwd::downlink::{process_downlink_queue, DownlinkPolicy};
use loragw_pktfwd::pktfwd::protocol::GatewayEui;
use loragw_pktfwd::pktfwd::queue::PacketQueues;
use loragw_pktfwd::pktfwd::radio::{
    instantiate_radio, receive_uplink, recover_receive_mode, restart_with_retries, RecvStatus, STARTUP_RESTART_ATTEMPTS,
};
use loragw_pktfwd::pktfwd::stats::TrafficStats;
use loragw_pktfwd::pktfwd::udp::{
    publish_stat, publish_uplink, read_interface_mac, request_pull, run_downlink_puller, run_uplink_sender,
};

const DEFAULT_INTERFACE: &str = "eth0";
const DEFAULT_CONFIG_PATH: &str = "./config.json";
const NO_DATA_DELAY: Duration = Duration::from_millis(20);
const WATCHDOG_PERIOD: Duration = Duration::from_secs(1);

/// State shared between the control loop and the worker threads.
struct Runtime {
    queues: PacketQueues,
    stats: TrafficStats,
    keep_running: AtomicBool,
    heartbeat: AtomicU64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run() {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let iface = args.get(1).map(String::as_str).unwrap_or(DEFAULT_INTERFACE);
    let config_path = args.get(2).map(String::as_str).unwrap_or(DEFAULT_CONFIG_PATH);

    let eui = GatewayEui::from_mac(read_interface_mac(iface)?);
    let config = PlatformConfig::load(config_path)?;
    config.log_summary(&eui.to_string());

    let spi_target = ECmdSpiTarget::from_channel(config.chip.spi_channel)
        .ok_or_else(|| anyhow!("unsupported SPI channel {}", config.chip.spi_channel))?;
    let mut mcu = Mcu::new(spi_target, u8::try_from(config.chip.pin_rst).ok());
    mcu.open(&config.com_path)
        .with_context(|| format!("cannot open radio bridge on {}", config.com_path))?;

    let registry = ChipRegistry::with_supported_chips();
    let mut radio = instantiate_radio(&registry, mcu, &config.chip)?;
    if !restart_with_retries(&mut radio, &config.chip, STARTUP_RESTART_ATTEMPTS) {
        return Err(anyhow!("LoRa chip setup failed"));
    }
    info!("LoRa chip setup success!");

    let runtime = Runtime {
        queues: PacketQueues::new(),
        stats: TrafficStats::new(),
        keep_running: AtomicBool::new(true),
        heartbeat: AtomicU64::new(0),
    };
    let servers = config.shared_servers();

    thread::scope(|s| {
        let uplink = s.spawn(|| {
            let result = run_uplink_sender(&runtime.queues, &runtime.stats, &runtime.keep_running, config.max_send_attempts);
            runtime.keep_running.store(false, Ordering::Relaxed);
            result
        });
        let downlink = s.spawn(|| {
            let result = run_downlink_puller(
                &runtime.queues,
                &runtime.stats,
                &runtime.keep_running,
                &eui,
                config.max_send_attempts,
            );
            runtime.keep_running.store(false, Ordering::Relaxed);
            result
        });
        s.spawn(|| watchdog(&runtime, Duration::from_secs(config.heartbeat_tolerance_s)));

        control_loop(&mut radio, &config, &eui, &servers, &runtime);

        for (name, handle) in [("uplink", uplink), ("downlink", downlink)] {
            match handle.join() {
                Ok(result) => result.with_context(|| format!("{} worker failed", name))?,
                Err(_) => return Err(anyhow!("{} worker panicked", name)),
            }
        }
        Ok(())
    })
}

fn control_loop<R: RadioDriver>(
    radio: &mut R,
    config: &PlatformConfig,
    eui: &GatewayEui,
    servers: &[Arc<ServerConf>],
    runtime: &Runtime,
) {
    let stat_interval = Duration::from_secs(config.stat_interval_s);
    let pull_interval = Duration::from_millis(config.pull_interval_ms);
    let policy: DownlinkPolicy = config.downlink_policy();
    let mut last_stat: Option<Instant> = None;
    let mut last_pull: Option<Instant> = None;
    let mut buf = [0u8; LGW_MAX_PAYLOAD];

    while runtime.keep_running.load(Ordering::Relaxed) {
        runtime.heartbeat.fetch_add(1, Ordering::Relaxed);

        if last_stat.map_or(true, |t| t.elapsed() >= stat_interval) {
            info!("Sending stat update to server(s)...");
            publish_stat(&runtime.queues, servers, eui, config, &runtime.stats);
            last_stat = Some(Instant::now());
        }
        if last_pull.map_or(true, |t| t.elapsed() >= pull_interval) {
            request_pull(&runtime.queues, servers, eui);
            last_pull = Some(Instant::now());
        }

        match receive_uplink(radio, &config.chip, &runtime.stats, &mut buf) {
            RecvStatus::Data(frame) => {
                publish_uplink(&runtime.queues, servers, eui, &frame, config.chip.coding_rate, &runtime.stats);
            }
            RecvStatus::ReceiveFailed => {}
            RecvStatus::NoData => thread::sleep(NO_DATA_DELAY),
        }

        let pass = process_downlink_queue(&runtime.queues, radio, &config.chip, &policy, &runtime.stats);
        if !pass.rx_restored {
            warn!("Radio lost receive mode, running the restart sequence");
            recover_receive_mode(
                radio,
                &config.chip,
                STARTUP_RESTART_ATTEMPTS,
                &runtime.keep_running,
                &runtime.heartbeat,
            );
        }
    }
    warn!("Control loop stopped");
}

/// Re-executes the process when the control loop stops beating for `tolerance`.
fn watchdog(runtime: &Runtime, tolerance: Duration) {
    let mut last_beat = runtime.heartbeat.load(Ordering::Relaxed);
    let mut last_change = Instant::now();

    while runtime.keep_running.load(Ordering::Relaxed) {
        thread::sleep(WATCHDOG_PERIOD);
        let beat = runtime.heartbeat.load(Ordering::Relaxed);
        if beat != last_beat {
            last_beat = beat;
            last_change = Instant::now();
            continue;
        }
        if last_change.elapsed() < tolerance {
            continue;
        }

        error!("Control loop stalled for {:?}, restarting", last_change.elapsed());
        let exe = match env::current_exe() {
            Ok(exe) => exe,
            Err(e) => {
                error!("Cannot locate own executable: {}", e);
                process::exit(1);
            }
        };
        let err = Command::new(exe).args(env::args().skip(1)).exec();
        error!("Re-exec failed: {}", err);
        process::exit(1);
    }
}
