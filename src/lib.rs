pub mod hal;
pub mod pktfwd;
