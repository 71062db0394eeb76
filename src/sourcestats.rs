//! Per-source sample statistics.
//!
//! Each remote source owns one of these: a bounded ring of measurements
//! plus the regression state derived from them. The newest `n_samples`
//! entries form the regression window; older entries are kept only to
//! extend the residual-runs test, up to `REGRESS_RUNS_RATIO` times the
//! window size in total.
//!
//! Two offset series are kept per sample: `offset` is retroactively
//! adjusted whenever the local clock is slewed or stepped, so regression
//! always sees data in the current timescale; `orig_offset` is the
//! measurement as it was taken and is what reporting and sample dumps
//! expose.

use crate::clock::{ns_to_s, s_to_ns, Ns};
use crate::regress::{find_best_regression, t_quantile, MIN_SAMPLES_FOR_REGRESS};
use anyhow::{anyhow, Result};
use log::warn;
use std::collections::VecDeque;
use std::io::{BufRead, Write};

pub const MAX_SAMPLES: usize = 64;
pub const REGRESS_RUNS_RATIO: usize = 2;

/// Relative-distance weighting strength in the regression weights.
const SD_TO_DIST_RATIO: f64 = 1.0;
/// Frequency confidence bound when no regression is available (s/s).
const WORST_CASE_SKEW: f64 = 2000e-6;
const MIN_SKEW: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct Sample {
    /// Local (cooked) time of the measurement.
    pub time: Ns,
    /// Measured offset, positive = local clock ahead; slewed retroactively.
    pub offset: f64,
    /// The measurement as taken; never slewed.
    pub orig_offset: f64,
    pub peer_delay: f64,
    pub peer_dispersion: f64,
    /// Total delay back to the source's own reference, peer leg included.
    pub root_delay: f64,
    /// Total dispersion back to the source's own reference, peer leg
    /// included.
    pub root_dispersion: f64,
    pub stratum: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkewDirection {
    Increase,
    Decrease,
    NoChange,
}

/// What the reference selector needs from one source.
#[derive(Debug, Clone, Copy)]
pub struct SelectionData {
    pub offset: f64,
    pub root_distance: f64,
    pub root_delay: f64,
    pub root_dispersion: f64,
    pub stratum: u8,
    pub peer_delay: f64,
}

pub struct SourceStats {
    /// Oldest first; the newest `n_samples` are the regression window.
    ring: VecDeque<Sample>,
    n_samples: usize,
    max_samples: usize,
    min_samples: usize,

    /// Window-relative index of the minimum-delay sample.
    min_delay_sample: usize,
    /// Window-relative index of the best single sample (set by
    /// `selection_data`).
    best_single_sample: usize,

    regression_ok: bool,
    estimated_frequency: f64,
    skew: f64,
    estimated_offset: f64,
    estimated_offset_sd: f64,
    /// Epoch of `estimated_offset` (the newest sample at fit time).
    offset_time: Ns,
    variance: f64,
    n_runs: usize,
    last_best_start: usize,
    skew_dirn: SkewDirection,
    /// |frequency change| / skew at the last update.
    stress: f64,
}

impl SourceStats {
    pub fn new(max_samples: usize, min_samples: usize) -> Self {
        let max_samples = max_samples.clamp(MIN_SAMPLES_FOR_REGRESS, MAX_SAMPLES);
        SourceStats {
            ring: VecDeque::with_capacity(max_samples * REGRESS_RUNS_RATIO),
            n_samples: 0,
            max_samples,
            min_samples: min_samples.max(MIN_SAMPLES_FOR_REGRESS),
            min_delay_sample: 0,
            best_single_sample: 0,
            regression_ok: false,
            estimated_frequency: 0.0,
            skew: WORST_CASE_SKEW,
            estimated_offset: 0.0,
            estimated_offset_sd: 0.0,
            offset_time: 0,
            variance: 0.0,
            n_runs: 0,
            last_best_start: 0,
            skew_dirn: SkewDirection::NoChange,
            stress: 0.0,
        }
    }

    fn window_start(&self) -> usize {
        self.ring.len() - self.n_samples
    }

    fn window(&self, i: usize) -> &Sample {
        &self.ring[self.window_start() + i]
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn regression_ok(&self) -> bool {
        self.regression_ok
    }

    pub fn frequency(&self) -> f64 {
        self.estimated_frequency
    }

    pub fn skew(&self) -> f64 {
        self.skew
    }

    pub fn skew_direction(&self) -> SkewDirection {
        self.skew_dirn
    }

    pub fn offset_sd(&self) -> f64 {
        self.estimated_offset_sd
    }

    pub fn estimated_offset(&self) -> f64 {
        self.estimated_offset
    }

    pub fn offset_time(&self) -> Ns {
        self.offset_time
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }

    pub fn n_runs(&self) -> usize {
        self.n_runs
    }

    pub fn last_best_start(&self) -> usize {
        self.last_best_start
    }

    pub fn stress(&self) -> f64 {
        self.stress
    }

    pub fn min_delay(&self) -> f64 {
        if self.n_samples == 0 {
            0.0
        } else {
            self.window(self.min_delay_sample).peer_delay
        }
    }

    /// Window index chosen by the last `selection_data` call.
    pub fn best_sample_index(&self) -> usize {
        self.best_single_sample
    }

    /// Newest sample as (time, original offset, peer delay), for the
    /// measurement log.
    pub fn newest_sample(&self) -> Option<(Ns, f64, f64)> {
        self.ring
            .back()
            .map(|s| (s.time, s.orig_offset, s.peer_delay))
    }

    /// Oldest and newest window sample ages relative to `now`, seconds.
    pub fn sample_ages(&self, now: Ns) -> Option<(f64, f64)> {
        if self.n_samples == 0 {
            return None;
        }
        let first = self.window(0).time;
        let last = self.window(self.n_samples - 1).time;
        Some((ns_to_s(now - first), ns_to_s(now - last)))
    }

    pub fn reset(&mut self) {
        let max = self.max_samples;
        let min = self.min_samples;
        *self = SourceStats::new(max, min);
    }

    fn recompute_min_delay(&mut self) {
        let mut best = 0;
        for i in 1..self.n_samples {
            if self.window(i).peer_delay < self.window(best).peer_delay {
                best = i;
            }
        }
        self.min_delay_sample = best;
    }

    // ------------------------------------------------------------------
    // Accumulation
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn accumulate_sample(
        &mut self,
        time: Ns,
        offset: f64,
        peer_delay: f64,
        peer_dispersion: f64,
        root_delay: f64,
        root_dispersion: f64,
        stratum: u8,
    ) {
        if let Some(newest) = self.ring.back() {
            if time <= newest.time {
                // Out-of-order samples mean the local timescale was
                // disrupted under us; nothing held is trustworthy.
                warn!(
                    "out-of-order sample ({} <= {}), discarding history",
                    time, newest.time
                );
                self.reset();
                return;
            }
        }

        self.ring.push_back(Sample {
            time,
            offset,
            orig_offset: offset,
            peer_delay,
            peer_dispersion,
            root_delay,
            root_dispersion,
            stratum,
        });
        if self.n_samples < self.max_samples {
            self.n_samples += 1;
        }
        while self.ring.len() > self.max_samples * REGRESS_RUNS_RATIO {
            self.ring.pop_front();
        }
        self.recompute_min_delay();
    }

    // ------------------------------------------------------------------
    // Regression
    // ------------------------------------------------------------------

    /// Rerun the weighted regression over the current window. Returns
    /// true when a usable fit was produced.
    pub fn run_regression(&mut self) -> bool {
        let n = self.n_samples;
        if n < self.min_samples {
            self.regression_ok = false;
            self.estimated_frequency = 0.0;
            self.skew = WORST_CASE_SKEW;
            return false;
        }

        let newest_time = self.window(n - 1).time;
        let mut x = Vec::with_capacity(n);
        let mut y = Vec::with_capacity(n);
        let mut d = Vec::with_capacity(n);
        for i in 0..n {
            let s = self.window(i);
            x.push(ns_to_s(s.time - newest_time));
            y.push(s.offset);
            d.push(s.peer_dispersion + s.peer_delay / 2.0);
        }

        let min_d = d.iter().cloned().fold(f64::INFINITY, f64::min);
        let mean_d = d.iter().sum::<f64>() / n as f64;
        let mut sd = mean_d - min_d;
        if sd > min_d || sd <= 0.0 {
            sd = min_d;
        }
        if sd <= 0.0 {
            sd = f64::MIN_POSITIVE;
        }
        let w: Vec<f64> = d
            .iter()
            .map(|&di| {
                let rel = 1.0 + SD_TO_DIST_RATIO * (di - min_d) / sd;
                rel * rel
            })
            .collect();

        let ws = self.window_start();
        let mut ex = Vec::with_capacity(ws);
        let mut ey = Vec::with_capacity(ws);
        for s in self.ring.iter().take(ws) {
            ex.push(ns_to_s(s.time - newest_time));
            ey.push(s.offset);
        }

        match find_best_regression(&x, &y, &w, &ex, &ey, self.min_samples) {
            Some(r) => {
                let new_skew = (r.slope_sd * t_quantile(r.dof)).max(MIN_SKEW);
                self.skew_dirn = if !self.regression_ok || new_skew == self.skew {
                    SkewDirection::NoChange
                } else if new_skew > self.skew {
                    SkewDirection::Increase
                } else {
                    SkewDirection::Decrease
                };
                self.stress = if self.regression_ok {
                    (r.slope - self.estimated_frequency).abs() / new_skew
                } else {
                    0.0
                };
                self.estimated_frequency = r.slope;
                self.skew = new_skew;
                self.estimated_offset = r.intercept;
                self.estimated_offset_sd = r.intercept_sd;
                self.offset_time = newest_time;
                self.variance = r.s2;
                self.n_runs = r.n_runs;
                self.last_best_start = r.best_start;
                // Pruned window samples stay behind as runs extension.
                self.n_samples -= r.best_start;
                while self.ring.len() - self.n_samples
                    > (REGRESS_RUNS_RATIO - 1) * self.max_samples
                {
                    self.ring.pop_front();
                }
                self.recompute_min_delay();
                self.regression_ok = true;
                true
            }
            None => {
                self.regression_ok = false;
                self.estimated_frequency = 0.0;
                self.skew = WORST_CASE_SKEW;
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Offset the source is predicted to show at `t`.
    pub fn predict_offset(&self, t: Ns) -> f64 {
        if self.n_samples < MIN_SAMPLES_FOR_REGRESS || !self.regression_ok {
            match self.ring.back() {
                Some(s) => s.offset,
                None => 0.0,
            }
        } else {
            self.estimated_offset + ns_to_s(t - self.offset_time) * self.estimated_frequency
        }
    }

    /// Outlier filter for a proposed new measurement: a sample whose
    /// delay has grown past what prediction error can explain is accepted
    /// only if its offset still agrees with the prediction within the
    /// delay increase.
    pub fn is_good_sample(
        &self,
        offset: f64,
        delay: f64,
        max_delay_dev_ratio: f64,
        clock_error: f64,
        t: Ns,
    ) -> bool {
        if self.n_samples < MIN_SAMPLES_FOR_REGRESS {
            return true;
        }
        let elapsed = ns_to_s(t - self.offset_time).max(0.0);
        let allowed =
            self.variance.sqrt() * max_delay_dev_ratio + elapsed * (self.skew + clock_error);
        let delay_increase = (delay - self.min_delay()) / 2.0;
        if delay_increase < allowed {
            return true;
        }
        let deviation = (offset - self.predict_offset(t)).abs();
        deviation - delay_increase <= allowed
    }

    /// Pick the sample minimising current root distance and return the
    /// selector's view of this source.
    pub fn selection_data(&mut self, now: Ns) -> Option<SelectionData> {
        if self.n_samples < MIN_SAMPLES_FOR_REGRESS {
            return None;
        }
        let mut best = 0;
        let mut best_dist = f64::INFINITY;
        for i in 0..self.n_samples {
            let s = self.window(i);
            let elapsed = ns_to_s(now - s.time).max(0.0);
            let dist = s.root_dispersion + elapsed * self.skew + 0.5 * s.root_delay;
            if dist < best_dist {
                best_dist = dist;
                best = i;
            }
        }
        self.best_single_sample = best;
        let s = *self.window(best);
        let elapsed = ns_to_s(now - s.time).max(0.0);
        let offset = if self.regression_ok {
            s.offset + elapsed * self.estimated_frequency
        } else {
            s.offset
        };
        let root_dispersion = s.root_dispersion + elapsed * self.skew;
        Some(SelectionData {
            offset,
            root_distance: root_dispersion + 0.5 * s.root_delay,
            root_delay: s.root_delay,
            root_dispersion,
            stratum: s.stratum,
            peer_delay: s.peer_delay,
        })
    }

    // ------------------------------------------------------------------
    // Local clock change hooks
    // ------------------------------------------------------------------

    /// The local clock was slewed or stepped: re-express every stored
    /// sample in the new timescale so it still describes the same
    /// physical event. `when` is the cooked time of the change; a sample
    /// `elapsed` seconds before it moves by `elapsed*dfreq - doffset`,
    /// which keeps the whole history consistent with what measurements
    /// taken under the new frequency would have shown.
    pub fn slew_samples(&mut self, when: Ns, dfreq: f64, doffset: f64) {
        for s in self.ring.iter_mut() {
            let elapsed = ns_to_s(when - s.time);
            let delta = elapsed * dfreq - doffset;
            s.time += s_to_ns(delta);
            s.offset += delta;
        }
        if self.regression_ok || self.offset_time != 0 {
            let elapsed = ns_to_s(when - self.offset_time);
            let delta = elapsed * dfreq - doffset;
            self.offset_time += s_to_ns(delta);
            self.estimated_offset += delta;
        }
        self.estimated_frequency -= dfreq;
    }

    /// The clock driver introduced error; every held sample inherits it.
    pub fn add_dispersion(&mut self, disp: f64) {
        for s in self.ring.iter_mut() {
            s.peer_dispersion += disp;
            s.root_dispersion += disp;
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Write the regression window in the dump format: a count line, then
    /// one line per sample.
    pub fn write_dump(&self, out: &mut impl Write) -> Result<()> {
        writeln!(out, "{}", self.n_samples)?;
        for i in 0..self.n_samples {
            let s = self.window(i);
            let sec = s.time / crate::clock::NS_PER_SEC;
            let usec = (s.time % crate::clock::NS_PER_SEC) / 1_000;
            writeln!(
                out,
                "{:x} {:x} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.1} {}",
                sec,
                usec,
                s.offset,
                s.orig_offset,
                s.peer_delay,
                s.peer_dispersion,
                s.root_delay,
                s.root_dispersion,
                0.0,
                s.stratum
            )?;
        }
        Ok(())
    }

    /// Rebuild the history from a dump. On any parse problem the load is
    /// abandoned and the instance left empty.
    pub fn load_dump(&mut self, input: &mut impl BufRead) -> Result<()> {
        self.reset();
        let result = self.load_dump_inner(input);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn load_dump_inner(&mut self, input: &mut impl BufRead) -> Result<()> {
        let mut lines = input.lines();
        let count: usize = lines
            .next()
            .ok_or_else(|| anyhow!("empty dump"))??
            .trim()
            .parse()?;
        if count > self.max_samples {
            return Err(anyhow!("dump claims {} samples", count));
        }
        let mut prev_time = Ns::MIN;
        for _ in 0..count {
            let line = lines.next().ok_or_else(|| anyhow!("truncated dump"))??;
            let f: Vec<&str> = line.split_whitespace().collect();
            if f.len() != 10 {
                return Err(anyhow!("malformed dump line: {}", line));
            }
            let sec = Ns::from_str_radix(f[0], 16)?;
            let usec = Ns::from_str_radix(f[1], 16)?;
            let time = sec * crate::clock::NS_PER_SEC + usec * 1_000;
            if time <= prev_time {
                return Err(anyhow!("dump samples not in time order"));
            }
            prev_time = time;
            let offset: f64 = f[2].parse()?;
            let orig_offset: f64 = f[3].parse()?;
            self.ring.push_back(Sample {
                time,
                offset,
                orig_offset,
                peer_delay: f[4].parse()?,
                peer_dispersion: f[5].parse()?,
                root_delay: f[6].parse()?,
                root_dispersion: f[7].parse()?,
                stratum: f[9].parse()?,
            });
            self.n_samples += 1;
        }
        self.recompute_min_delay();
        self.run_regression();
        Ok(())
    }

    #[cfg(test)]
    pub fn orig_offsets(&self) -> Vec<f64> {
        (0..self.n_samples)
            .map(|i| self.window(i).orig_offset)
            .collect()
    }

    #[cfg(test)]
    pub fn min_delay_index(&self) -> usize {
        self.min_delay_sample
    }
}
