pub mod config;
pub mod downlink;
pub mod gps_time;
pub mod protocol;
pub mod queue;
pub mod radio;
pub mod stats;
pub mod time_utils;
pub mod udp;
