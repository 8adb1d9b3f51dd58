use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, error, info, trace, warn};

use super::config::{PlatformConfig, ServerConf};
use super::protocol::{
    build_pull_data, build_stat_packet, build_tx_ack, build_uplink_packet, is_uplink_report, parse_pull_resp,
    validate_ack, GatewayEui, PacketHeader, PacketType, TxAckError,
};
use super::queue::{PacketQueues, QueueKind, QueuedPacket};
use super::radio::RadioFrame;
use super::stats::TrafficStats;
use super::time_utils::curr_timestamp_us;

const RECV_ATTEMPTS: usize = 2;
const IDLE_SLEEP: Duration = Duration::from_millis(10);
const MAX_DATAGRAM: usize = 2048;

/// "b8:27:eb:12:34:56" to bytes.
pub fn parse_mac(text: &str) -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.trim().split(':');
    for byte in mac.iter_mut() {
        let part = parts.next().ok_or_else(|| anyhow!("MAC address too short: {}", text))?;
        *byte = u8::from_str_radix(part, 16).with_context(|| format!("bad MAC address byte {:?}", part))?;
    }
    if parts.next().is_some() {
        return Err(anyhow!("MAC address too long: {}", text));
    }
    Ok(mac)
}

/// Hardware address of a network interface, as published by sysfs.
pub fn read_interface_mac(iface: &str) -> Result<[u8; 6]> {
    let path = format!("/sys/class/net/{}/address", iface);
    let text = fs::read_to_string(&path).with_context(|| format!("cannot read {}", path))?;
    parse_mac(&text)
}

fn resolve(server: &ServerConf) -> Result<SocketAddr> {
    (server.address.as_str(), server.port)
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve {}", server))?
        .next()
        .ok_or_else(|| anyhow!("no address for {}", server))
}

fn receive_timeout(server: &ServerConf) -> Duration {
    Duration::from_millis(server.receive_timeout_ms.max(1) as u64)
}

/**
@brief Sends one datagram and waits for an answer `accept` recognizes
@param socket unconnected socket used for the exchange
@param server destination, its `receive_timeout_ms` bounds each wait
@param datagram bytes to send
@param accept filter for the expected answer
@return the accepted answer, `None` when none arrived within the attempts
*/
pub fn exchange<F>(socket: &UdpSocket, server: &ServerConf, datagram: &[u8], accept: F) -> Result<Option<Vec<u8>>>
where
    F: Fn(&[u8]) -> bool,
{
    let addr = resolve(server)?;
    socket.set_read_timeout(Some(receive_timeout(server)))?;
    socket.send_to(datagram, addr).with_context(|| format!("send to {} failed", server))?;
    trace!("Sent {} bytes to {}", datagram.len(), server);

    let mut buf = [0u8; MAX_DATAGRAM];
    for _ in 0..RECV_ATTEMPTS {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                if from == addr && accept(&buf[..len]) {
                    return Ok(Some(buf[..len].to_vec()));
                }
                trace!("Ignoring {} bytes from {}", len, from);
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

fn send_uplink(socket: &UdpSocket, queues: &PacketQueues, stats: &TrafficStats, packet: QueuedPacket, max_attempts: u32) {
    let acked = match exchange(socket, &packet.destination, &packet.data, |resp| validate_ack(&packet.data, resp)) {
        Ok(answer) => answer.is_some(),
        Err(e) => {
            debug!("Uplink exchange with {} failed: {:#}", packet.destination, e);
            false
        }
    };

    if acked {
        if is_uplink_report(&packet.data) {
            stats.inc_forwarded_acked();
        }
        debug!("PUSH_ACK from {} after {} retries", packet.destination, packet.attempt);
        return;
    }

    retry_or_drop(queues, QueueKind::UplinkSend, packet, max_attempts, "No PUSH_ACK");
}

/// Requeues a packet whose exchange failed; the first failure and the final drop are logged.
fn retry_or_drop(queues: &PacketQueues, kind: QueueKind, mut packet: QueuedPacket, max_attempts: u32, failure: &str) -> bool {
    if !packet.logged {
        warn!("{} ({}), will retry", failure, packet.destination);
        packet.logged = true;
    }
    let destination = packet.destination.clone();
    let attempts = packet.attempt + 1;
    if queues.requeue(kind, packet, max_attempts) {
        return true;
    }
    warn!("Giving up on a {} packet for {} after {} attempt(s)", kind, destination, attempts);
    false
}

/// Uplink worker: drains `UplinkSend` until `keep_running` is cleared.
pub fn run_uplink_sender(queues: &PacketQueues, stats: &TrafficStats, keep_running: &AtomicBool, max_attempts: u32) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("cannot bind uplink socket")?;
    info!("Uplink sender started on {}", socket.local_addr()?);

    while keep_running.load(Ordering::Relaxed) {
        match queues.dequeue(QueueKind::UplinkSend) {
            Some(packet) => send_uplink(&socket, queues, stats, packet, max_attempts),
            None => thread::sleep(IDLE_SLEEP),
        }
    }
    info!("Uplink sender stopped");
    Ok(())
}

/// One socket per server, kept so PULL_RESP can reach us between pulls.
struct PullSession {
    server: Arc<ServerConf>,
    socket: UdpSocket,
    addr: SocketAddr,
    last_pull: Vec<u8>,
}

impl PullSession {
    fn open(server: Arc<ServerConf>) -> Result<Self> {
        let addr = resolve(&server)?;
        let socket = UdpSocket::bind("0.0.0.0:0").context("cannot bind downlink socket")?;
        socket.set_read_timeout(Some(receive_timeout(&server)))?;
        Ok(Self {
            server,
            socket,
            addr,
            last_pull: Vec::new(),
        })
    }

    fn handle_datagram(&self, data: &[u8], eui: &GatewayEui, queues: &PacketQueues, stats: &TrafficStats) {
        let header = match PacketHeader::parse(data) {
            Ok(h) => h,
            Err(e) => {
                debug!("Ignoring datagram from {}: {}", self.server, e);
                return;
            }
        };

        match header.packet_type {
            PacketType::PullAck => {
                if validate_ack(&self.last_pull, data) {
                    debug!("PULL_ACK from {}", self.server);
                } else {
                    debug!("Stale PULL_ACK from {}", self.server);
                }
            }
            PacketType::PullResp => {
                let error = match parse_pull_resp(data) {
                    Ok(_) => {
                        stats.inc_downlink_received();
                        if !queues.enqueue(QueueKind::DownlinkReceived, data.to_vec(), self.server.clone()) {
                            warn!("Downlink from {} lost, queue unavailable", self.server);
                        }
                        None
                    }
                    Err(e) => {
                        warn!("Rejecting downlink from {}: {}", self.server, e);
                        Some(TxAckError::Rejected)
                    }
                };
                let ack = build_tx_ack(header.token, eui, error);
                if let Err(e) = self.socket.send_to(&ack, self.addr) {
                    warn!("Cannot send TX_ACK to {}: {}", self.server, e);
                }
            }
            other => debug!("Unexpected {:?} from {}", other, self.server),
        }
    }

    /// Reads until the socket times out once.
    fn poll(&self, eui: &GatewayEui, queues: &PacketQueues, stats: &TrafficStats) -> Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) if from == self.addr => self.handle_datagram(&buf[..len], eui, queues, stats),
                Ok((len, from)) => trace!("Ignoring {} bytes from {}", len, from),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Sends one PULL_DATA on its server's session, opening the session on first use.
fn send_pull_request(
    sessions: &mut HashMap<String, PullSession>,
    queues: &PacketQueues,
    packet: QueuedPacket,
    max_attempts: u32,
) -> bool {
    let key = packet.destination.to_string();
    if !sessions.contains_key(&key) {
        match PullSession::open(packet.destination.clone()) {
            Ok(session) => {
                sessions.insert(key.clone(), session);
            }
            Err(e) => {
                debug!("Cannot open downlink session with {}: {:#}", packet.destination, e);
                retry_or_drop(queues, QueueKind::DownlinkPullRequest, packet, max_attempts, "No downlink session");
                return false;
            }
        }
    }
    let session = match sessions.get_mut(&key) {
        Some(session) => session,
        None => return false,
    };
    match session.socket.send_to(&packet.data, session.addr) {
        Ok(_) => {
            trace!("PULL_DATA sent to {}", session.server);
            session.last_pull = packet.data;
            true
        }
        Err(e) => {
            debug!("Cannot send PULL_DATA to {}: {}", session.server, e);
            retry_or_drop(queues, QueueKind::DownlinkPullRequest, packet, max_attempts, "PULL_DATA send failed");
            false
        }
    }
}

/**
@brief Downlink worker: sends queued PULL_DATA and services PULL_ACK / PULL_RESP
@param queues `DownlinkPullRequest` is drained, `DownlinkReceived` filled
@param stats dwnb counter
@param keep_running cleared to stop
@param eui gateway identifier for TX_ACK
@param max_attempts send attempts per PULL_DATA
*/
pub fn run_downlink_puller(
    queues: &PacketQueues,
    stats: &TrafficStats,
    keep_running: &AtomicBool,
    eui: &GatewayEui,
    max_attempts: u32,
) -> Result<()> {
    let mut sessions: HashMap<String, PullSession> = HashMap::new();
    info!("Downlink puller started");

    while keep_running.load(Ordering::Relaxed) {
        if let Some(packet) = queues.dequeue(QueueKind::DownlinkPullRequest) {
            if !send_pull_request(&mut sessions, queues, packet, max_attempts) {
                thread::sleep(IDLE_SLEEP);
            }
        }

        if sessions.is_empty() {
            thread::sleep(IDLE_SLEEP);
            continue;
        }
        for session in sessions.values() {
            if let Err(e) = session.poll(eui, queues, stats) {
                warn!("Downlink socket for {} failed: {}", session.server, e);
            }
        }
    }
    info!("Downlink puller stopped");
    Ok(())
}

/// Queues the periodic `stat` report for every server.
pub fn publish_stat(queues: &PacketQueues, servers: &[Arc<ServerConf>], eui: &GatewayEui, config: &PlatformConfig, stats: &TrafficStats) {
    let packet = match build_stat_packet(eui, config, &stats.snapshot(), (curr_timestamp_us() / 1_000_000) as i64) {
        Ok(packet) => packet,
        Err(e) => {
            error!("Cannot build stat report, skipped: {}", e);
            return;
        }
    };
    for server in servers {
        queues.enqueue(QueueKind::UplinkSend, packet.clone(), server.clone());
    }
    debug!("Stat report queued for {} server(s)", servers.len());
}

/// Queues one received frame for every server; each queued report counts as forwarded.
pub fn publish_uplink(
    queues: &PacketQueues,
    servers: &[Arc<ServerConf>],
    eui: &GatewayEui,
    frame: &RadioFrame,
    coding_rate: u8,
    stats: &TrafficStats,
) {
    let packet = match build_uplink_packet(eui, frame, coding_rate, curr_timestamp_us()) {
        Ok(packet) => packet,
        Err(e) => {
            error!("Cannot build uplink report, frame dropped: {}", e);
            return;
        }
    };
    for server in servers {
        if queues.enqueue(QueueKind::UplinkSend, packet.clone(), server.clone()) {
            stats.inc_forwarded();
        }
    }
}

/// Queues a PULL_DATA keep-alive for every server.
pub fn request_pull(queues: &PacketQueues, servers: &[Arc<ServerConf>], eui: &GatewayEui) {
    for server in servers {
        queues.enqueue(QueueKind::DownlinkPullRequest, build_pull_data(eui), server.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parsing() {
        assert_eq!(parse_mac("b8:27:eb:12:34:56\n").unwrap(), [0xB8, 0x27, 0xEB, 0x12, 0x34, 0x56]);
        assert!(parse_mac("b8:27:eb:12:34").is_err());
        assert!(parse_mac("b8:27:eb:12:34:56:78").is_err());
        assert!(parse_mac("b8:27:eb:12:34:zz").is_err());
    }

    #[test]
    fn unanswered_exchange_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut server = ServerConf::new("127.0.0.1", silent.local_addr().unwrap().port());
        server.receive_timeout_ms = 20;

        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let answer = exchange(&socket, &server, &[2, 0, 1, 0], |_| true).unwrap();
        assert!(answer.is_none());
    }

    #[test]
    fn publishing_queues_one_copy_per_server() {
        let queues = PacketQueues::new();
        let stats = TrafficStats::new();
        let servers = vec![
            Arc::new(ServerConf::new("127.0.0.1", 1700)),
            Arc::new(ServerConf::new("127.0.0.1", 1701)),
        ];
        let eui = GatewayEui::from_mac([1, 2, 3, 4, 5, 6]);
        let frame = RadioFrame {
            payload: vec![0x40],
            rssi: -90.0,
            snr: 5.0,
            freq_error: 0.0,
            spreading_factor: 7,
            bandwidth_khz: 125.0,
            frequency_mhz: 868.1,
            timestamp_us: 0,
        };

        publish_uplink(&queues, &servers, &eui, &frame, 5, &stats);
        request_pull(&queues, &servers, &eui);

        assert_eq!(queues.len(QueueKind::UplinkSend), 2);
        assert_eq!(queues.len(QueueKind::DownlinkPullRequest), 2);
        assert_eq!(stats.snapshot().forw_packets, 2);

        let first = queues.dequeue(QueueKind::UplinkSend).unwrap();
        let second = queues.dequeue(QueueKind::UplinkSend).unwrap();
        assert_eq!(first.data, second.data);
        assert_eq!(first.destination.port, 1700);
        assert_eq!(second.destination.port, 1701);
    }

    #[test]
    fn unacked_uplink_is_retried_then_dropped() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut server = ServerConf::new("127.0.0.1", silent.local_addr().unwrap().port());
        server.receive_timeout_ms = 5;

        let queues = PacketQueues::new();
        let stats = TrafficStats::new();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        queues.enqueue(QueueKind::UplinkSend, build_pull_data(&GatewayEui::default()), Arc::new(server));

        for attempt in 0..3u32 {
            let packet = queues.dequeue(QueueKind::UplinkSend).unwrap();
            assert_eq!(packet.attempt, attempt);
            assert_eq!(packet.logged, attempt > 0);
            send_uplink(&socket, &queues, &stats, packet, 2);
        }
        assert!(queues.is_empty(QueueKind::UplinkSend));
        assert_eq!(stats.snapshot().forw_packets_acked, 0);
    }

    #[test]
    fn failing_pull_request_is_retried_then_dropped() {
        /* the kernel refuses to send to port 0 */
        let server = Arc::new(ServerConf::new("127.0.0.1", 0));
        let queues = PacketQueues::new();
        let mut sessions = HashMap::new();
        queues.enqueue(QueueKind::DownlinkPullRequest, build_pull_data(&GatewayEui::default()), server);

        for attempt in 0..3u32 {
            let packet = queues.dequeue(QueueKind::DownlinkPullRequest).unwrap();
            assert_eq!(packet.attempt, attempt);
            assert_eq!(packet.logged, attempt > 0);
            assert!(!send_pull_request(&mut sessions, &queues, packet, 2));
        }
        assert!(queues.is_empty(QueueKind::DownlinkPullRequest));
        assert_eq!(sessions.len(), 1);
    }
}
