//! Fast Information Group encoders.
//!
//! Each FIG is a variant of the [Fig] sum type; the FIC scheduler holds a
//! slice of [ScheduledFig] and calls `fill` with whatever space remains in
//! the current FIB. A FIG never spans FIBs: a multi-entry FIG that cannot
//! place all its entries emits a fresh header with the remaining entries
//! on the next call, and reports its cycle complete only once every entry
//! has been transmitted.

mod fig0;
mod fig1;

pub use fig0::*;
pub use fig1::*;

use chrono::{DateTime, Utc};

use crate::ensemble::DabEnsemble;

/// Repetition rates per ETSI TR 101 496-2 table 3.6.1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)] // Fig0_0 mirrors the FIG numbering.
pub enum FigRate {
    /// FIG 0/0 cadence (96 ms).
    Fig0_0,
    /// At least ten times per second.
    A,
    /// Between ten times and once per second.
    AB,
    /// Once per second.
    B,
    /// Once every ten seconds.
    C,
    /// Less than once every ten seconds.
    D,
    /// Complete carousel within two minutes.
    E,
}

impl FigRate {
    pub fn interval_ms(self) -> u64 {
        match self {
            FigRate::Fig0_0 => 96,
            FigRate::A => 100,
            FigRate::AB => 500,
            FigRate::B => 1_000,
            FigRate::C => 10_000,
            FigRate::D => 30_000,
            FigRate::E => 120_000,
        }
    }
}

/// Scheduling precedence; lower value wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FigPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

/// Result of one fill attempt.
#[derive(Clone, Copy, Debug, Default)]
pub struct FillStatus {
    pub written: usize,
    /// True when the FIG finished a full cycle over its entries.
    pub complete: bool,
}

/// Read-only state the encoders draw from; assembled once per frame.
pub struct FigCtx<'a> {
    pub ensemble: &'a DabEnsemble,
    /// CIF counter (one CIF per 24 ms frame).
    pub cif_count: u32,
    pub now: DateTime<Utc>,
}

/// All FIGs the multiplexer transmits, as a tagged variant.
pub enum Fig {
    EnsembleInfo(Fig0_0),
    SubchannelOrg(Fig0_1),
    ServiceOrg(Fig0_2),
    PacketComponent(Fig0_3),
    GlobalDefinition(Fig0_8),
    CountryLto(Fig0_9),
    DateTime(Fig0_10),
    UserApplications(Fig0_13),
    ProgrammeType(Fig0_17),
    AnnouncementSupport(Fig0_18),
    AnnouncementSwitching(Fig0_19),
    EnsembleLabel(Fig1_0),
    ServiceLabel(Fig1_1),
    ComponentLabel(Fig1_4),
    DataServiceLabel(Fig1_5),
}

impl Fig {
    pub fn fill(&mut self, ctx: &FigCtx<'_>, buf: &mut [u8]) -> FillStatus {
        match self {
            Fig::EnsembleInfo(f) => f.fill(ctx, buf),
            Fig::SubchannelOrg(f) => f.fill(ctx, buf),
            Fig::ServiceOrg(f) => f.fill(ctx, buf),
            Fig::PacketComponent(f) => f.fill(ctx, buf),
            Fig::GlobalDefinition(f) => f.fill(ctx, buf),
            Fig::CountryLto(f) => f.fill(ctx, buf),
            Fig::DateTime(f) => f.fill(ctx, buf),
            Fig::UserApplications(f) => f.fill(ctx, buf),
            Fig::ProgrammeType(f) => f.fill(ctx, buf),
            Fig::AnnouncementSupport(f) => f.fill(ctx, buf),
            Fig::AnnouncementSwitching(f) => f.fill(ctx, buf),
            Fig::EnsembleLabel(f) => f.fill(ctx, buf),
            Fig::ServiceLabel(f) => f.fill(ctx, buf),
            Fig::ComponentLabel(f) => f.fill(ctx, buf),
            Fig::DataServiceLabel(f) => f.fill(ctx, buf),
        }
    }

    pub fn fig_type(&self) -> u8 {
        match self {
            Fig::EnsembleLabel(_)
            | Fig::ServiceLabel(_)
            | Fig::ComponentLabel(_)
            | Fig::DataServiceLabel(_) => 1,
            _ => 0,
        }
    }

    pub fn fig_extension(&self) -> u8 {
        match self {
            Fig::EnsembleInfo(_) => 0,
            Fig::SubchannelOrg(_) => 1,
            Fig::ServiceOrg(_) => 2,
            Fig::PacketComponent(_) => 3,
            Fig::GlobalDefinition(_) => 8,
            Fig::CountryLto(_) => 9,
            Fig::DateTime(_) => 10,
            Fig::UserApplications(_) => 13,
            Fig::ProgrammeType(_) => 17,
            Fig::AnnouncementSupport(_) => 18,
            Fig::AnnouncementSwitching(_) => 19,
            Fig::EnsembleLabel(_) => 0,
            Fig::ServiceLabel(_) => 1,
            Fig::ComponentLabel(_) => 4,
            Fig::DataServiceLabel(_) => 5,
        }
    }

    pub fn rate(&self) -> FigRate {
        match self {
            Fig::EnsembleInfo(_) => FigRate::Fig0_0,
            Fig::SubchannelOrg(_) | Fig::ServiceOrg(_) | Fig::AnnouncementSwitching(_) => {
                FigRate::A
            }
            Fig::ProgrammeType(_) => FigRate::AB,
            Fig::UserApplications(_) => FigRate::B,
            Fig::ComponentLabel(_) | Fig::DataServiceLabel(_) => FigRate::B,
            _ => FigRate::B,
        }
    }

    pub fn priority(&self) -> FigPriority {
        match self {
            Fig::EnsembleInfo(_) => FigPriority::Critical,
            Fig::SubchannelOrg(_)
            | Fig::ServiceOrg(_)
            | Fig::EnsembleLabel(_)
            | Fig::AnnouncementSwitching(_) => FigPriority::High,
            Fig::UserApplications(_) | Fig::ComponentLabel(_) | Fig::DataServiceLabel(_) => {
                FigPriority::Low
            }
            _ => FigPriority::Normal,
        }
    }

    pub fn name(&self) -> String {
        format!("{}/{}", self.fig_type(), self.fig_extension())
    }
}

/// A FIG plus its transmission bookkeeping.
pub struct ScheduledFig {
    pub fig: Fig,
    last_complete_ms: Option<u64>,
    in_progress: bool,
    completed_one_cycle: bool,
}

impl ScheduledFig {
    pub fn new(fig: Fig) -> Self {
        ScheduledFig {
            fig,
            last_complete_ms: None,
            in_progress: false,
            completed_one_cycle: false,
        }
    }

    pub fn should_transmit(&self, now_ms: u64) -> bool {
        if self.in_progress {
            return true;
        }
        if !self.completed_one_cycle {
            return true;
        }
        match self.last_complete_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.fig.rate().interval_ms(),
        }
    }

    /// How far past its interval this FIG is; used as the scheduling
    /// tiebreak within one priority class.
    pub fn urgency(&self, now_ms: u64) -> i64 {
        match self.last_complete_ms {
            None => i64::max_value(),
            Some(last) => {
                now_ms as i64 - last as i64 - self.fig.rate().interval_ms() as i64
            }
        }
    }

    pub fn mark_transmitted(&mut self, now_ms: u64, complete: bool) {
        if complete {
            self.last_complete_ms = Some(now_ms);
            self.in_progress = false;
            self.completed_one_cycle = true;
        } else {
            self.in_progress = true;
        }
    }

    pub fn last_complete_ms(&self) -> Option<u64> {
        self.last_complete_ms
    }
}

/// The full FIG set for an ensemble. Order only matters for equal
/// priority and urgency.
pub fn standard_fig_set() -> Vec<ScheduledFig> {
    vec![
        ScheduledFig::new(Fig::EnsembleInfo(Fig0_0::default())),
        ScheduledFig::new(Fig::SubchannelOrg(Fig0_1::default())),
        ScheduledFig::new(Fig::ServiceOrg(Fig0_2::default())),
        ScheduledFig::new(Fig::PacketComponent(Fig0_3::default())),
        ScheduledFig::new(Fig::GlobalDefinition(Fig0_8::default())),
        ScheduledFig::new(Fig::CountryLto(Fig0_9::default())),
        ScheduledFig::new(Fig::DateTime(Fig0_10::default())),
        ScheduledFig::new(Fig::UserApplications(Fig0_13::default())),
        ScheduledFig::new(Fig::ProgrammeType(Fig0_17::default())),
        ScheduledFig::new(Fig::AnnouncementSupport(Fig0_18::default())),
        ScheduledFig::new(Fig::AnnouncementSwitching(Fig0_19::default())),
        ScheduledFig::new(Fig::EnsembleLabel(Fig1_0::default())),
        ScheduledFig::new(Fig::ServiceLabel(Fig1_1::default())),
        ScheduledFig::new(Fig::ComponentLabel(Fig1_4::default())),
        ScheduledFig::new(Fig::DataServiceLabel(Fig1_5::default())),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_intervals() {
        assert_eq!(FigRate::Fig0_0.interval_ms(), 96);
        assert_eq!(FigRate::A.interval_ms(), 100);
        assert_eq!(FigRate::AB.interval_ms(), 500);
        assert_eq!(FigRate::B.interval_ms(), 1000);
        assert_eq!(FigRate::C.interval_ms(), 10_000);
        assert_eq!(FigRate::D.interval_ms(), 30_000);
        assert_eq!(FigRate::E.interval_ms(), 120_000);
    }

    #[test]
    fn priority_ordering() {
        assert!(FigPriority::Critical < FigPriority::High);
        assert!(FigPriority::High < FigPriority::Normal);
        assert!(FigPriority::Normal < FigPriority::Low);
    }

    #[test]
    fn schedule_state_machine() {
        let mut sf = ScheduledFig::new(Fig::EnsembleLabel(Fig1_0::default()));
        // Never transmitted: always due.
        assert!(sf.should_transmit(0));
        sf.mark_transmitted(0, false);
        // Partial transmissions stay due.
        assert!(sf.should_transmit(1));
        sf.mark_transmitted(24, true);
        // Complete: not due again until the interval has passed.
        assert!(!sf.should_transmit(48));
        assert!(sf.should_transmit(24 + FigRate::B.interval_ms()));
    }
}
