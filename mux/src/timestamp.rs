//! Frame timestamps: the ETI TIST field and the EDI seconds/ticks pair.
//!
//! Sub-second time is counted in ticks of 1/16384000 s. EDI seconds are
//! counted from 2000-01-01T00:00:00 UTC with the UTC-to-TAI offset added
//! (ETSI TS 102 693 section 5.1.2.3).

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

/// Ticks per second of the TIST/TSTA clock.
pub const TICKS_PER_SECOND: u64 = 16_384_000;

/// Ticks in one 24 ms frame.
pub const TICKS_PER_FRAME: u64 = TICKS_PER_SECOND * 24 / 1000;

/// Unix timestamp of the EDI epoch (2000-01-01T00:00:00Z).
pub const EDI_EPOCH_UNIX: i64 = 946_684_800;

/// UTC to TAI offset in seconds (leap seconds; 37 since 2017-01-01).
pub const UTCO: u32 = 37;

/// A frame timestamp: integral seconds since the EDI epoch plus a
/// sub-second tick count. Advanced by exactly one frame per tick so TIST
/// is monotonic regardless of scheduling jitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameTimestamp {
    /// Seconds since 2000-01-01T00:00:00Z (UTC, without leap seconds).
    pub seconds: u64,
    /// Sub-second ticks, 0 .. TICKS_PER_SECOND.
    pub ticks: u64,
}

impl FrameTimestamp {
    pub fn now() -> Self {
        Self::from_utc(Utc::now())
    }

    pub fn from_utc(t: DateTime<Utc>) -> Self {
        let unix = t.timestamp();
        let seconds = (unix - EDI_EPOCH_UNIX).max(0) as u64;
        let ticks = u64::from(t.timestamp_subsec_nanos()) * TICKS_PER_SECOND / 1_000_000_000;
        FrameTimestamp { seconds, ticks }
    }

    /// Advances by one 24 ms frame.
    pub fn advance_frame(&mut self) {
        self.ticks += TICKS_PER_FRAME;
        while self.ticks >= TICKS_PER_SECOND {
            self.ticks -= TICKS_PER_SECOND;
            self.seconds += 1;
        }
    }

    /// 24-bit TIST sub-second field.
    pub fn tist_ticks(&self) -> u32 {
        (self.ticks & 0xFF_FFFF) as u32
    }

    /// Seconds field of the EDI `tist` TAG: epoch seconds after adding the
    /// UTC-to-TAI offset.
    pub fn edi_seconds(&self) -> u32 {
        (self.seconds + u64::from(UTCO)) as u32
    }
}

/// Modified Julian Date of a calendar day, as carried in FIG 0/10.
pub fn mjd(date: &DateTime<Utc>) -> u32 {
    // MJD epoch is 1858-11-17, which is 678576 days after chrono's
    // common-era reference (num_days_from_ce(1970-01-01) = 719163,
    // MJD(1970-01-01) = 40587).
    (date.num_days_from_ce() - 678_576) as u32
}

/// (MJD, hours, minutes, seconds) of a UTC instant, for FIG 0/10.
pub fn utc_fields(t: &DateTime<Utc>) -> (u32, u8, u8, u8) {
    (mjd(t), t.hour() as u8, t.minute() as u8, t.second() as u8)
}

/// The local time offset in half-hours derived from the system timezone,
/// for the automatic LTO mode.
pub fn local_time_offset_half_hours() -> i8 {
    let local = chrono::Local::now();
    let offset_secs = local.offset().local_minus_utc();
    (offset_secs / 1800) as i8
}
