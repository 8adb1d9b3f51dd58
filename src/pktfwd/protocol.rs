use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hal::SpreadingFactor;

use super::config::PlatformConfig;
use super::downlink::DownlinkModulation;
use super::gps_time::unix_us_to_gps_ms;
use super::radio::RadioFrame;
use super::stats::StatsSnapshot;
use super::time_utils::{iso8601_utc_extended, stat_time};

pub const PROTOCOL_VERSION: u8 = 2;
pub const HEADER_SIZE: usize = 12; /* version, token, type, gateway EUI */
pub const ACK_HEADER_SIZE: usize = 4;
pub const MAX_DOWNLINK_PAYLOAD: usize = 255;

const DEFAULT_TX_POWER_DBM: i8 = 14;
const DEFAULT_LORA_PREAMBLE: u16 = 8;
const DEFAULT_FSK_PREAMBLE: u16 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    PushData = 0,
    PushAck = 1,
    PullData = 2,
    PullResp = 3,
    PullAck = 4,
    TxAck = 5,
}

impl PacketType {
    /// The acknowledgement a server sends back for this packet, if any.
    pub fn ack(self) -> Option<PacketType> {
        match self {
            PacketType::PushData => Some(PacketType::PushAck),
            PacketType::PullData => Some(PacketType::PullAck),
            _ => None,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::PushData),
            1 => Ok(PacketType::PushAck),
            2 => Ok(PacketType::PullData),
            3 => Ok(PacketType::PullResp),
            4 => Ok(PacketType::PullAck),
            5 => Ok(PacketType::TxAck),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("datagram too short ({0} bytes)")]
    TooShort(usize),

    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    #[error("unknown packet type {0}")]
    UnknownType(u8),

    #[error("unexpected packet type {0:?}")]
    UnexpectedType(PacketType),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing txpk object")]
    MissingTxpk,

    #[error("missing mandatory field {0}")]
    MissingField(&'static str),

    #[error("invalid field {0}")]
    InvalidField(&'static str),

    #[error("payload of {0} bytes exceeds the radio limit")]
    PayloadTooLong(usize),

    #[error("size field {declared} does not match payload length {actual}")]
    SizeMismatch { declared: usize, actual: usize },
}

/// Gateway identifier: the interface MAC with `FF FF` spliced in the middle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GatewayEui(pub [u8; 8]);

impl GatewayEui {
    pub fn from_mac(mac: [u8; 6]) -> Self {
        GatewayEui([mac[0], mac[1], mac[2], 0xFF, 0xFF, mac[3], mac[4], mac[5]])
    }
}

impl std::fmt::Display for GatewayEui {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{:02x}", b)).collect();
        write!(f, "{}", parts.join(":"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub token: u16,
    pub packet_type: PacketType,
}

impl PacketHeader {
    /// Parses the 4 leading bytes common to every packet.
    pub fn parse(datagram: &[u8]) -> Result<Self, ProtocolError> {
        if datagram.len() < ACK_HEADER_SIZE {
            return Err(ProtocolError::TooShort(datagram.len()));
        }
        if datagram[0] != PROTOCOL_VERSION {
            return Err(ProtocolError::BadVersion(datagram[0]));
        }
        Ok(PacketHeader {
            version: datagram[0],
            token: u16::from_be_bytes([datagram[1], datagram[2]]),
            packet_type: PacketType::try_from(datagram[3])?,
        })
    }
}

fn random_token() -> u16 {
    rand::rng().random::<u16>()
}

fn header(token: u16, packet_type: PacketType, eui: &GatewayEui) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + 256);
    buf.push(PROTOCOL_VERSION);
    buf.extend_from_slice(&token.to_be_bytes());
    buf.push(packet_type as u8);
    buf.extend_from_slice(&eui.0);
    buf
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

#[derive(Debug, Serialize)]
struct StatBody<'a> {
    time: String,
    lati: f64,
    long: f64,
    alti: i32,
    rxnb: u32,
    rxok: u32,
    rxfw: u32,
    ackr: f64,
    dwnb: u32,
    txnb: u32,
    pfrm: &'a str,
    mail: &'a str,
    desc: &'a str,
}

#[derive(Debug, Serialize)]
struct StatReport<'a> {
    stat: StatBody<'a>,
}

/// PUSH_DATA carrying the periodic `stat` object.
pub fn build_stat_packet(
    eui: &GatewayEui,
    config: &PlatformConfig,
    stats: &StatsSnapshot,
    now_unix_s: i64,
) -> Result<Vec<u8>, ProtocolError> {
    let report = StatReport {
        stat: StatBody {
            time: stat_time(now_unix_s),
            lati: round_to(config.latitude as f64, 5),
            long: round_to(config.longitude as f64, 5),
            alti: config.altitude_meters,
            rxnb: stats.recv_packets,
            rxok: stats.recv_packets_crc_good,
            rxfw: stats.forw_packets,
            ackr: round_to(stats.ack_ratio(), 1),
            dwnb: stats.downlink_received,
            txnb: stats.downlink_transmitted,
            pfrm: &config.platform_definition,
            mail: &config.platform_email,
            desc: &config.platform_description,
        },
    };

    let mut buf = header(random_token(), PacketType::PushData, eui);
    buf.extend_from_slice(&serde_json::to_vec(&report)?);
    Ok(buf)
}

#[derive(Debug, Serialize)]
struct Rxpk {
    time: String,
    tmms: u64,
    tmst: u32,
    freq: f64,
    chan: u8,
    rfch: u8,
    stat: i8,
    modu: &'static str,
    datr: String,
    codr: String,
    rssi: i32,
    lsnr: f64,
    size: usize,
    data: String,
}

#[derive(Debug, Serialize)]
struct UplinkReport {
    rxpk: Vec<Rxpk>,
}

/// PUSH_DATA carrying one received frame as `rxpk`.
pub fn build_uplink_packet(
    eui: &GatewayEui,
    frame: &RadioFrame,
    coding_rate: u8,
    now_unix_us: u64,
) -> Result<Vec<u8>, ProtocolError> {
    let rxpk = Rxpk {
        time: iso8601_utc_extended(now_unix_us),
        tmms: unix_us_to_gps_ms(now_unix_us),
        tmst: frame.timestamp_us as u32,
        /* 100 Hz resolution hides the f32 representation error */
        freq: round_to(frame.frequency_mhz as f64, 4),
        chan: 0,
        rfch: 0,
        stat: 1,
        modu: "LORA",
        datr: format!("SF{}BW{}", frame.spreading_factor, frame.bandwidth_khz),
        codr: format!("4/{}", coding_rate),
        rssi: frame.rssi as i32,
        lsnr: round_to(frame.snr as f64, 1),
        size: frame.payload.len(),
        data: BASE64.encode(&frame.payload),
    };

    let mut buf = header(random_token(), PacketType::PushData, eui);
    buf.extend_from_slice(&serde_json::to_vec(&UplinkReport { rxpk: vec![rxpk] })?);
    Ok(buf)
}

/// PULL_DATA keep-alive, header only.
pub fn build_pull_data(eui: &GatewayEui) -> Vec<u8> {
    header(random_token(), PacketType::PullData, eui)
}

/// Reason reported in `txpk_ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAckError {
    Rejected,
}

impl TxAckError {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxAckError::Rejected => "REJECTED",
        }
    }
}

/// TX_ACK answering a PULL_RESP, echoing its token.
pub fn build_tx_ack(token: u16, eui: &GatewayEui, error: Option<TxAckError>) -> Vec<u8> {
    let mut buf = header(token, PacketType::TxAck, eui);
    if let Some(error) = error {
        let body = serde_json::json!({ "txpk_ack": { "error": error.as_str() } });
        buf.extend_from_slice(body.to_string().as_bytes());
    }
    buf
}

/// True when `response` acknowledges `sent`: same version and token, matching ack type.
pub fn validate_ack(sent: &[u8], response: &[u8]) -> bool {
    if sent.len() < ACK_HEADER_SIZE || response.len() < ACK_HEADER_SIZE {
        return false;
    }
    if sent[..3] != response[..3] {
        return false;
    }
    let expected = match PacketType::try_from(sent[3]).ok().and_then(PacketType::ack) {
        Some(ack) => ack,
        None => return false,
    };
    response[3] == expected as u8
}

/// True for PUSH_DATA datagrams whose JSON body carries `rxpk`.
pub fn is_uplink_report(datagram: &[u8]) -> bool {
    if datagram.len() <= HEADER_SIZE || datagram[3] != PacketType::PushData as u8 {
        return false;
    }
    match serde_json::from_slice::<Value>(&datagram[HEADER_SIZE..]) {
        Ok(body) => body.get("rxpk").is_some(),
        Err(_) => false,
    }
}

/// How a downlink is scheduled; exactly one source wins, `imme` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxSchedule {
    Immediate,
    Tmst(u32),
    Tmms(u64),
}

/// A validated `txpk` object.
#[derive(Debug, Clone, PartialEq)]
pub struct Txpk {
    pub schedule: TxSchedule,
    pub frequency_mhz: f64,
    pub rf_chain: u8,
    pub power_dbm: i8,
    pub modulation: DownlinkModulation,
    pub invert_iq: bool,
    pub preamble: u16,
    pub no_crc: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct TxpkFields {
    imme: Option<bool>,
    tmst: Option<u32>,
    tmms: Option<u64>,
    freq: Option<f64>,
    rfch: Option<u8>,
    powe: Option<i8>,
    modu: Option<String>,
    datr: Option<Value>,
    codr: Option<String>,
    fdev: Option<u32>,
    ipol: Option<bool>,
    prea: Option<u16>,
    size: Option<usize>,
    data: Option<String>,
    ncrc: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct PullRespBody {
    txpk: Option<TxpkFields>,
}

/// "SF7BW125" to (7, 125.0).
fn parse_lora_datr(datr: &str) -> Option<(u8, f32)> {
    let rest = datr.strip_prefix("SF")?;
    let (sf, bw) = rest.split_once("BW")?;
    let sf = sf.parse::<u8>().ok()?;
    let bw = bw.parse::<f32>().ok()?;
    if !(SpreadingFactor::SCAN_MIN..=SpreadingFactor::SCAN_MAX).contains(&sf) || bw <= 0.0 {
        return None;
    }
    Some((sf, bw))
}

/// "4/5" to 5.
fn parse_codr(codr: &str) -> Option<u8> {
    let cr = codr.strip_prefix("4/")?.parse::<u8>().ok()?;
    (5..=8).contains(&cr).then_some(cr)
}

fn parse_txpk(fields: TxpkFields) -> Result<Txpk, ProtocolError> {
    let schedule = if fields.imme.unwrap_or(false) {
        TxSchedule::Immediate
    } else if let Some(tmst) = fields.tmst {
        TxSchedule::Tmst(tmst)
    } else if let Some(tmms) = fields.tmms {
        TxSchedule::Tmms(tmms)
    } else {
        return Err(ProtocolError::MissingField("imme/tmst/tmms"));
    };

    let frequency_mhz = fields.freq.ok_or(ProtocolError::MissingField("freq"))?;
    if frequency_mhz <= 0.0 {
        return Err(ProtocolError::InvalidField("freq"));
    }

    let modu = fields.modu.ok_or(ProtocolError::MissingField("modu"))?;
    let datr = fields.datr.ok_or(ProtocolError::MissingField("datr"))?;
    let (modulation, default_preamble) = match modu.as_str() {
        "LORA" => {
            let (sf, bw_khz) = datr
                .as_str()
                .and_then(parse_lora_datr)
                .ok_or(ProtocolError::InvalidField("datr"))?;
            let codr = fields.codr.ok_or(ProtocolError::MissingField("codr"))?;
            let cr = parse_codr(&codr).ok_or(ProtocolError::InvalidField("codr"))?;
            (DownlinkModulation::Lora { sf, bw_khz, cr }, DEFAULT_LORA_PREAMBLE)
        }
        "FSK" => {
            let datarate = datr
                .as_u64()
                .filter(|dr| *dr > 0 && *dr <= u32::MAX as u64)
                .ok_or(ProtocolError::InvalidField("datr"))? as u32;
            let freq_dev_hz = fields.fdev.ok_or(ProtocolError::MissingField("fdev"))?;
            (DownlinkModulation::Fsk { datarate, freq_dev_hz }, DEFAULT_FSK_PREAMBLE)
        }
        _ => return Err(ProtocolError::InvalidField("modu")),
    };

    let data = fields.data.ok_or(ProtocolError::MissingField("data"))?;
    let payload = BASE64.decode(data.trim()).map_err(|_| ProtocolError::InvalidField("data"))?;
    if payload.len() > MAX_DOWNLINK_PAYLOAD {
        return Err(ProtocolError::PayloadTooLong(payload.len()));
    }
    if let Some(declared) = fields.size {
        if declared != payload.len() {
            return Err(ProtocolError::SizeMismatch {
                declared,
                actual: payload.len(),
            });
        }
    }

    Ok(Txpk {
        schedule,
        frequency_mhz,
        rf_chain: fields.rfch.unwrap_or(0),
        power_dbm: fields.powe.unwrap_or(DEFAULT_TX_POWER_DBM),
        modulation,
        invert_iq: fields.ipol.unwrap_or(false),
        preamble: fields.prea.unwrap_or(default_preamble),
        no_crc: fields.ncrc.unwrap_or(false),
        payload,
    })
}

/// Parses a full PULL_RESP datagram (4-byte header + JSON).
pub fn parse_pull_resp(datagram: &[u8]) -> Result<(PacketHeader, Txpk), ProtocolError> {
    let header = PacketHeader::parse(datagram)?;
    if header.packet_type != PacketType::PullResp {
        return Err(ProtocolError::UnexpectedType(header.packet_type));
    }
    let body: PullRespBody = serde_json::from_slice(&datagram[ACK_HEADER_SIZE..])?;
    let txpk = parse_txpk(body.txpk.ok_or(ProtocolError::MissingTxpk)?)?;
    Ok((header, txpk))
}
