//! Input health monitoring: per-input counters, buffer history and the
//! NO_DATA / UNSTABLE / SILENCE / STREAMING state machine exposed through
//! `get_input_status`.

use std::collections::VecDeque;
use std::time::Instant;

use serde::Serialize;

/// Underruns/overruns within the rolling window before an input is
/// flagged UNSTABLE.
const GLITCH_THRESHOLD: u32 = 5;
/// Consecutive low-peak frames before SILENCE.
const SILENCE_THRESHOLD: u32 = 10;
/// Peak level below which a frame counts as silent.
const SILENCE_LEVEL: i32 = 100;
/// Buffer-fill history retention.
const BUFFER_HISTORY_SECS: u64 = 60;
/// An empty buffer for this long means NO_DATA.
const NO_DATA_SECS: u64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputState {
    NoData,
    Unstable,
    Silence,
    Streaming,
}

/// Statistics collector for one input.
#[derive(Debug)]
pub struct InputStatistics {
    name: String,
    buffer_history: VecDeque<(Instant, usize)>,
    last_nonempty: Option<Instant>,
    underruns: u64,
    overruns: u64,
    glitch_counter: u32,
    silence_counter: u32,
    peak_left: i32,
    peak_right: i32,
}

impl InputStatistics {
    pub fn new(name: &str) -> Self {
        InputStatistics {
            name: name.to_owned(),
            buffer_history: VecDeque::new(),
            last_nonempty: None,
            underruns: 0,
            overruns: 0,
            glitch_counter: 0,
            silence_counter: 0,
            peak_left: 0,
            peak_right: 0,
        }
    }

    pub fn notify_buffer(&mut self, bufsize: usize) {
        let now = Instant::now();
        if bufsize > 0 {
            self.last_nonempty = Some(now);
        }
        self.buffer_history.push_back((now, bufsize));
        while let Some(&(t, _)) = self.buffer_history.front() {
            if now.duration_since(t).as_secs() > BUFFER_HISTORY_SECS {
                self.buffer_history.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn notify_underrun(&mut self) {
        self.underruns += 1;
        self.glitch_counter = (self.glitch_counter + 1).min(GLITCH_THRESHOLD + 1);
    }

    pub fn notify_overrun(&mut self) {
        self.overruns += 1;
        self.glitch_counter = (self.glitch_counter + 1).min(GLITCH_THRESHOLD + 1);
    }

    pub fn notify_peak_levels(&mut self, left: i32, right: i32) {
        self.peak_left = left;
        self.peak_right = right;
        if left < SILENCE_LEVEL && right < SILENCE_LEVEL {
            self.silence_counter = (self.silence_counter + 1).min(SILENCE_THRESHOLD + 1);
        } else {
            self.silence_counter = self.silence_counter.saturating_sub(1);
        }
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    pub fn determine_state(&mut self) -> InputState {
        let empty_for = self
            .last_nonempty
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(u64::max_value());
        if self.buffer_history.is_empty() || empty_for >= NO_DATA_SECS {
            return InputState::NoData;
        }
        if self.glitch_counter >= GLITCH_THRESHOLD {
            return InputState::Unstable;
        }
        if self.silence_counter >= SILENCE_THRESHOLD {
            return InputState::Silence;
        }
        // Healthy; let the glitch counter decay.
        self.glitch_counter = self.glitch_counter.saturating_sub(1);
        InputState::Streaming
    }

    pub fn report(&mut self) -> InputStatusReport {
        let state = self.determine_state();
        let current = self.buffer_history.back().map(|&(_, s)| s).unwrap_or(0);
        let (min, max, sum) = self.buffer_history.iter().fold(
            (usize::max_value(), 0usize, 0usize),
            |(min, max, sum), &(_, s)| (min.min(s), max.max(s), sum + s),
        );
        let samples = self.buffer_history.len();
        InputStatusReport {
            name: self.name.clone(),
            state,
            buffer_current: current,
            buffer_min: if samples == 0 { 0 } else { min },
            buffer_max: max,
            buffer_avg: if samples == 0 { 0.0 } else { sum as f64 / samples as f64 },
            underruns: self.underruns,
            overruns: self.overruns,
            peak_left: self.peak_left,
            peak_right: self.peak_right,
        }
    }
}

/// JSON-serializable snapshot for the control surface.
#[derive(Clone, Debug, Serialize)]
pub struct InputStatusReport {
    pub name: String,
    pub state: InputState,
    pub buffer_current: usize,
    pub buffer_min: usize,
    pub buffer_max: usize,
    pub buffer_avg: f64,
    pub underruns: u64,
    pub overruns: u64,
    pub peak_left: i32,
    pub peak_right: i32,
}
