//! adjtime(2)-based back-end.
//!
//! For kernels without a tick or frequency knob the driver synthesises a
//! frequency correction by restarting a bounded slew from a periodic
//! drift-removal timer. The timer runs even when the daemon is otherwise
//! idle; without it the clock would stop being corrected the moment the
//! last slew completed.

use crate::clock::{ns_to_s, ChangeHub, ClockOps, Ns, RawClock};
use crate::scheduler::{Scheduler, TimerId};
use anyhow::Result;
use log::warn;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Rate at which adjtime slews the clock (s/s).
const SLEW_RATE: f64 = 5e-3;
/// Bounds for the drift-removal interval.
const MIN_INTERVAL: f64 = 0.5;
const MAX_INTERVAL: f64 = 4.0;
/// Largest synthesised frequency correction.
const MAX_FREQ_PPM: f64 = 500.0;

pub trait AdjtimeKernel {
    /// Replace the slew in progress with one of `seconds` (positive =
    /// advance the clock); returns the unapplied remainder of the
    /// previous slew.
    fn adjtime(&mut self, seconds: f64) -> Result<f64>;
    /// Step the clock by `seconds` (positive = advance).
    fn step(&mut self, seconds: f64) -> Result<()>;
}

pub struct AdjtimeDriver<K: AdjtimeKernel> {
    raw: Rc<dyn RawClock>,
    sched: Scheduler,
    #[allow(dead_code)]
    hub: Rc<RefCell<ChangeHub>>,
    kernel: K,
    self_ref: Weak<RefCell<AdjtimeDriver<K>>>,

    freq_ppm: f64,
    /// Seconds the clock is fast, assuming everything handed to the
    /// kernel so far completes.
    offset_register: f64,
    /// Offset part of the last request, for mid-period corrections.
    handed: f64,
    last_tick_raw: Ns,
    interval: f64,
    timer: Option<TimerId>,
}

impl<K: AdjtimeKernel + 'static> AdjtimeDriver<K> {
    pub fn new(
        raw: Rc<dyn RawClock>,
        sched: Scheduler,
        hub: Rc<RefCell<ChangeHub>>,
        kernel: K,
    ) -> Rc<RefCell<Self>> {
        let driver = Rc::new(RefCell::new(AdjtimeDriver {
            raw: raw.clone(),
            sched,
            hub,
            kernel,
            self_ref: Weak::new(),
            freq_ppm: 0.0,
            offset_register: 0.0,
            handed: 0.0,
            last_tick_raw: raw.raw_time(),
            interval: MAX_INTERVAL,
            timer: None,
        }));
        {
            let mut d = driver.borrow_mut();
            d.self_ref = Rc::downgrade(&driver);
            d.schedule_tick();
        }
        driver
    }

    pub fn finalise(&mut self) {
        if let Some(id) = self.timer.take() {
            self.sched.remove_timeout(id);
        }
        // Cancel whatever slew is still running and fold it back.
        match self.kernel.adjtime(0.0) {
            Ok(leftover) => self.offset_register -= leftover,
            Err(e) => warn!("failed to cancel adjtime slew at shutdown: {}", e),
        }
        self.handed = 0.0;
    }

    fn schedule_tick(&mut self) {
        let me = self.self_ref.clone();
        self.timer = Some(self.sched.add_timeout_rel(
            self.interval,
            Box::new(move || {
                if let Some(driver) = me.upgrade() {
                    let mut d = driver.borrow_mut();
                    d.timer = None;
                    if let Err(e) = d.drift_removal_tick() {
                        warn!("drift removal failed: {}", e);
                    }
                    d.schedule_tick();
                }
            }),
        ));
    }

    /// The periodic heart of this back-end: reclaim the unfinished part
    /// of the previous slew, then start one covering the frequency gain
    /// for the next period plus as much of the offset register as the
    /// slew rate allows.
    fn drift_removal_tick(&mut self) -> Result<()> {
        let now = self.raw.raw_time();
        let freq_gain = self.freq_ppm * 1e-6 * self.interval;
        let max_slew = SLEW_RATE * self.interval;
        let offset_part = (-self.offset_register).clamp(-max_slew, max_slew);

        let leftover = self.kernel.adjtime(freq_gain + offset_part)?;
        self.offset_register = self.offset_register - leftover + offset_part;
        self.handed = offset_part;
        self.last_tick_raw = now;
        Ok(())
    }

    fn pick_interval(&mut self) {
        // Keep the per-period frequency gain around a millisecond so a
        // large correction does not ride on a long slew.
        let ppm = self.freq_ppm.abs().max(1.0);
        self.interval = (1e3 / ppm).clamp(MIN_INTERVAL, MAX_INTERVAL);
    }

    /// Advance-still-pending estimate for the offset part of the last
    /// request.
    fn handed_remaining(&self, raw: Ns) -> f64 {
        let elapsed = ns_to_s(raw - self.last_tick_raw).max(0.0);
        let applied = (SLEW_RATE * elapsed).min(self.handed.abs());
        self.handed - self.handed.signum() * applied
    }
}

impl<K: AdjtimeKernel + 'static> ClockOps for AdjtimeDriver<K> {
    fn read_frequency(&mut self) -> f64 {
        self.freq_ppm
    }

    fn set_frequency(&mut self, ppm: f64) -> Result<f64> {
        let applied = ppm.clamp(-MAX_FREQ_PPM, MAX_FREQ_PPM);
        self.freq_ppm = applied;
        self.pick_interval();
        Ok(applied)
    }

    fn accrue_offset(&mut self, offset: f64, _corr_rate: f64) -> Result<()> {
        // Picked up by the next drift-removal tick.
        self.offset_register += offset;
        Ok(())
    }

    fn apply_step_offset(&mut self, offset: f64) -> Result<()> {
        self.kernel.step(-offset)
    }

    fn offset_correction(&mut self, raw: Ns) -> (f64, f64) {
        let remaining = self.handed_remaining(raw);
        let corr = -self.offset_register + remaining;
        (corr, remaining.abs() + SLEW_RATE * self.interval)
    }
}

/// Real adjtime(2) binding for the BSD family.
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub struct BsdAdjtime;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
impl AdjtimeKernel for BsdAdjtime {
    fn adjtime(&mut self, seconds: f64) -> Result<f64> {
        let usec = (seconds * 1e6).round() as libc::suseconds_t;
        let delta = libc::timeval {
            tv_sec: (usec / 1_000_000) as libc::time_t,
            tv_usec: usec % 1_000_000,
        };
        let mut old = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let ret = unsafe { libc::adjtime(&delta, &mut old) };
        if ret < 0 {
            return Err(anyhow::anyhow!(
                "adjtime failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(old.tv_sec as f64 + old.tv_usec as f64 * 1e-6)
    }

    fn step(&mut self, seconds: f64) -> Result<()> {
        let mut tv: libc::timeval = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(anyhow::anyhow!("gettimeofday failed"));
        }
        let delta_usec = (seconds * 1e6).round() as i64;
        tv.tv_sec += (delta_usec / 1_000_000) as libc::time_t;
        tv.tv_usec += (delta_usec % 1_000_000) as libc::suseconds_t;
        while tv.tv_usec >= 1_000_000 {
            tv.tv_sec += 1;
            tv.tv_usec -= 1_000_000;
        }
        while tv.tv_usec < 0 {
            tv.tv_sec -= 1;
            tv.tv_usec += 1_000_000;
        }
        let ret = unsafe { libc::settimeofday(&tv, std::ptr::null()) };
        if ret < 0 {
            return Err(anyhow::anyhow!(
                "settimeofday failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }
}
