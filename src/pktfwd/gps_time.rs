use libm::{ceil, floor, fmod};

pub const GPS_UNIX_OFFSET_S: u64 = 315_964_800; /* 1980-01-06T00:00:00Z */

/* GPS seconds at which a leap second was inserted */
const GPS_LEAPS: [u64; 18] = [
    46828800, 78364801, 109900802, 173059203, 252028804, 315187205, 346723206, 393984007,
    425520008, 457056009, 504489610, 551750411, 599184012, 820108813, 914803214, 1025136015,
    1119744016, 1167264017,
];

/// Tests whether a GPS second is itself a leap second.
pub fn is_leap(gps_time: u64) -> bool {
    GPS_LEAPS.contains(&gps_time)
}

/// Number of leap seconds elapsed at `gps_time`.
///
/// With `accum_leaps` the table entries are compared against a timestamp that
/// does not yet include the leaps, which is what the Unix to GPS direction needs.
pub fn count_leaps(gps_time: u64, accum_leaps: bool) -> u64 {
    GPS_LEAPS
        .iter()
        .enumerate()
        .filter(|(i, leap)| {
            if accum_leaps {
                gps_time + *i as u64 >= **leap
            } else {
                gps_time >= **leap
            }
        })
        .count() as u64
}

pub fn is_unix_time_leap(unix_time: u64) -> bool {
    if unix_time < GPS_UNIX_OFFSET_S {
        return false;
    }
    let mut gps_time = unix_time - GPS_UNIX_OFFSET_S;
    gps_time = (gps_time + count_leaps(gps_time, true)).saturating_sub(1);
    is_leap(gps_time)
}

/// Unix seconds to GPS seconds.
///
/// The fractional part is stretched over the leap second when the next whole
/// Unix second is a leap.
pub fn unix2gps(unix_time: f64, handle_leap_seconds: bool) -> f64 {
    let ipart = floor(unix_time);
    let mut fpart = fmod(unix_time, 1.0);
    let gps_time = ipart - GPS_UNIX_OFFSET_S as f64;

    if handle_leap_seconds && is_unix_time_leap(ceil(unix_time) as u64) {
        fpart *= 2.0;
    }

    let leaps = if handle_leap_seconds && gps_time >= 0.0 {
        count_leaps(gps_time as u64, true) as f64
    } else {
        0.0
    };

    gps_time + fpart + leaps
}

/// GPS seconds to Unix seconds, inverse of [`unix2gps`].
pub fn gps2unix(gps_time: f64, handle_leap_seconds: bool) -> f64 {
    let fpart = fmod(gps_time, 1.0);
    let ipart = floor(gps_time);
    let ipart_real = if ipart > 0.0 { ipart as u64 } else { 0 };

    let leaps = if handle_leap_seconds {
        count_leaps(ipart_real, false) as f64
    } else {
        0.0
    };
    let unix_time = ipart + GPS_UNIX_OFFSET_S as f64 - leaps;

    if handle_leap_seconds && is_leap(ipart_real + 1) {
        unix_time + fpart / 2.0
    } else if handle_leap_seconds && is_leap(ipart_real) {
        unix_time + (fpart + 1.0) / 2.0
    } else {
        unix_time + fpart
    }
}

/// Unix microseconds to the GPS milliseconds carried in `tmms`.
pub fn unix_us_to_gps_ms(unix_us: u64) -> u64 {
    let secs = (unix_us / 1_000_000) as f64;
    let gps = unix2gps(secs, true);
    (gps * 1000.0) as u64 + (unix_us % 1_000_000) / 1000
}

/// GPS milliseconds from a downlink `tmms` field to Unix microseconds.
pub fn gps_ms_to_unix_us(gps_ms: u64) -> u64 {
    let gps = (gps_ms / 1000) as f64 + (gps_ms % 1000) as f64 / 1000.0;
    let unix = gps2unix(gps, true);
    if unix <= 0.0 {
        return 0;
    }
    (floor(unix) as u64) * 1_000_000 + libm::round(fmod(unix, 1.0) * 1_000_000.0) as u64
}
