//! Tick/freq clock back-end.
//!
//! Drives kernels with the classic pair of knobs: a `tick` value (microseconds
//! added to the clock per timer interrupt, adjustable within 10 % of nominal)
//! and a fine-grained frequency register. Large pending offsets are slewed by
//! biasing `tick` for a computed interval ("fast slew"), small ones through a
//! one-shot adjustment primitive, and sub-10 µs ones through the nanosecond
//! PLL where the kernel has one.

use crate::clock::{ns_to_s, ChangeHub, ClockOps, Ns, RawClock};
use crate::scheduler::{Scheduler, TimerId};
use anyhow::Result;
use log::{debug, warn};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Offsets below this go through the one-shot adjustment primitive.
const SMALL_SLEW_LIMIT: f64 = 0.2;
/// Offsets below this go through the nanosecond PLL when available.
const NANO_SLEW_LIMIT: f64 = 10e-6;
/// Kernel frequency register limit.
const MAX_KERNEL_FREQ_PPM: f64 = 500.0;
/// Fast slew biases tick by nominal/SLEW_DIVISOR.
const SLEW_DIVISOR: i64 = 12;
/// |tick - nominal| must stay within nominal/TICK_BIAS_DIVISOR.
const TICK_BIAS_DIVISOR: i64 = 10;

/// Raw kernel knobs, separated out so the slew logic is testable against
/// a modelled kernel.
pub trait TimexKernel {
    /// Current (tick, frequency ppm).
    fn read_tick_freq(&mut self) -> Result<(i64, f64)>;
    fn set_tick(&mut self, tick: i64) -> Result<()>;
    /// Program the frequency register; returns the applied value after
    /// the kernel's own clamping.
    fn set_freq(&mut self, ppm: f64) -> Result<f64>;
    /// One-shot slew of `seconds` (positive = advance the clock).
    fn offset_singleshot(&mut self, seconds: f64) -> Result<()>;
    /// Nanosecond-PLL slew of `seconds` (positive = advance the clock).
    fn pll_offset(&mut self, seconds: f64) -> Result<()>;
    fn has_pll(&self) -> bool;
    /// Step the clock by `seconds` (positive = advance). Note this is the
    /// raw kernel sign, not the driver's jump-backwards convention.
    fn step(&mut self, seconds: f64) -> Result<()>;
    fn set_leap(&mut self, _sign: i8) -> Result<()> {
        Ok(())
    }
    fn set_sync_status(&mut self, _synchronised: bool, _est_error: f64, _max_error: f64) {}
}

pub struct TimexDriver<K: TimexKernel> {
    raw: Rc<dyn RawClock>,
    sched: Scheduler,
    hub: Rc<RefCell<ChangeHub>>,
    kernel: K,
    self_ref: Weak<RefCell<TimexDriver<K>>>,

    hz: i64,
    nominal_tick: i64,
    /// ppm represented by one unit of tick.
    dhz: f64,
    slew_delta_tick: i64,
    max_tick_bias: i64,

    /// Tick value expressing the frequency correction, without slew bias.
    base_tick: i64,
    kernel_freq_ppm: f64,

    /// Seconds still owed to the clock; positive = the clock is fast.
    offset_register: f64,

    slewing: bool,
    /// Clock rate delta while fast-slewing (s/s, negative when slowing).
    slew_rate: f64,
    slew_start_raw: Ns,
    slew_timer: Option<TimerId>,

    max_error: f64,
}

impl<K: TimexKernel + 'static> TimexDriver<K> {
    pub fn new(
        raw: Rc<dyn RawClock>,
        sched: Scheduler,
        hub: Rc<RefCell<ChangeHub>>,
        mut kernel: K,
        hz: i64,
    ) -> Result<Rc<RefCell<Self>>> {
        let nominal_tick = 1_000_000 / hz;
        let (tick, freq) = kernel.read_tick_freq()?;
        if tick != nominal_tick {
            kernel.set_tick(nominal_tick)?;
        }
        let driver = Rc::new(RefCell::new(TimexDriver {
            raw,
            sched,
            hub,
            kernel,
            self_ref: Weak::new(),
            hz,
            nominal_tick,
            dhz: hz as f64,
            slew_delta_tick: nominal_tick / SLEW_DIVISOR,
            max_tick_bias: nominal_tick / TICK_BIAS_DIVISOR,
            base_tick: nominal_tick,
            kernel_freq_ppm: freq,
            offset_register: 0.0,
            slewing: false,
            slew_rate: 0.0,
            slew_start_raw: 0,
            slew_timer: None,
            max_error: 0.0,
        }));
        driver.borrow_mut().self_ref = Rc::downgrade(&driver);
        Ok(driver)
    }

    /// Abort any in-flight fast slew and restore the nominal tick.
    /// Called once at daemon shutdown; the clock must not be left with a
    /// biased tick.
    pub fn finalise(&mut self) {
        if self.slewing {
            if let Err(e) = self.abort_fast_slew() {
                warn!("failed to abort fast slew at shutdown: {}", e);
            }
        }
        if self.base_tick != self.nominal_tick {
            if let Err(e) = self.kernel.set_tick(self.nominal_tick) {
                warn!("failed to restore nominal tick at shutdown: {}", e);
            }
        }
    }

    fn report_tick_window(&mut self, before: Ns, after: Ns, delta_tick: i64) {
        // The kernel may have applied the new tick anywhere within the
        // read-change window; that uncertainty times the rate delta is
        // error we introduced.
        let rate = delta_tick.abs() as f64 / self.nominal_tick as f64;
        let disp = ns_to_s(after - before) * rate;
        if disp > 0.0 {
            self.max_error += disp;
            self.hub.borrow_mut().notify_dispersion(disp);
        }
    }

    fn initiate_slew(&mut self) -> Result<()> {
        let reg = self.offset_register;
        if reg.abs() < 1e-9 {
            self.offset_register = 0.0;
            return Ok(());
        }

        if self.kernel.has_pll() && reg.abs() < NANO_SLEW_LIMIT {
            self.kernel.pll_offset(-reg)?;
            self.max_error += reg.abs();
            self.offset_register = 0.0;
            return Ok(());
        }

        if reg.abs() < SMALL_SLEW_LIMIT {
            self.kernel.offset_singleshot(-reg)?;
            self.offset_register = 0.0;
            return Ok(());
        }

        // Fast slew: bias tick against the sign of the register.
        let wanted_bias = if reg > 0.0 {
            -self.slew_delta_tick
        } else {
            self.slew_delta_tick
        };
        let lo = self.nominal_tick - self.max_tick_bias;
        let hi = self.nominal_tick + self.max_tick_bias;
        let slew_tick = (self.base_tick + wanted_bias).clamp(lo, hi);
        let bias = slew_tick - self.base_tick;
        if bias == 0 {
            // Tick already pinned at the bias limit in this direction;
            // fall back to repeated one-shot slews.
            self.kernel.offset_singleshot(-reg)?;
            self.offset_register = 0.0;
            return Ok(());
        }

        let before = self.raw.raw_time();
        self.kernel.set_tick(slew_tick)?;
        let after = self.raw.raw_time();
        self.report_tick_window(before, after, bias);

        self.slew_rate = bias as f64 / self.nominal_tick as f64;
        self.slew_start_raw = after;
        self.slewing = true;

        let duration = -reg / self.slew_rate;
        debug!(
            "fast slew started: offset={:.6} s, tick {} -> {}, duration {:.3} s",
            reg, self.base_tick, slew_tick, duration
        );

        let me = self.self_ref.clone();
        self.slew_timer = Some(self.sched.add_timeout_rel(
            duration,
            Box::new(move || {
                if let Some(driver) = me.upgrade() {
                    let mut d = driver.borrow_mut();
                    d.slew_timer = None;
                    if let Err(e) = d.fast_slew_expired() {
                        warn!("fast slew completion failed: {}", e);
                    }
                }
            }),
        ));
        Ok(())
    }

    /// Restore tick and fold the achieved part of the slew back into the
    /// register.
    fn stop_fast_slew(&mut self) -> Result<()> {
        let before = self.raw.raw_time();
        self.kernel.set_tick(self.base_tick)?;
        let after = self.raw.raw_time();

        let elapsed = ns_to_s(after - self.slew_start_raw);
        let achieved = self.slew_rate * elapsed;
        self.offset_register += achieved;
        // Do not let rounding push the register past zero.
        if self.offset_register.abs() < 1e-9 {
            self.offset_register = 0.0;
        }
        self.report_tick_window(before, after, -(self.slew_rate * self.nominal_tick as f64) as i64);
        self.slewing = false;
        self.slew_rate = 0.0;
        Ok(())
    }

    fn fast_slew_expired(&mut self) -> Result<()> {
        self.stop_fast_slew()?;
        self.initiate_slew()
    }

    fn abort_fast_slew(&mut self) -> Result<()> {
        if let Some(id) = self.slew_timer.take() {
            self.sched.remove_timeout(id);
        }
        self.stop_fast_slew()
    }
}

impl<K: TimexKernel + 'static> ClockOps for TimexDriver<K> {
    fn read_frequency(&mut self) -> f64 {
        (self.base_tick - self.nominal_tick) as f64 * self.dhz + self.kernel_freq_ppm
    }

    fn set_frequency(&mut self, ppm: f64) -> Result<f64> {
        if self.slewing {
            self.abort_fast_slew()?;
        }

        // Split the correction between the coarse tick and the fine
        // frequency register, which the kernel limits to +/-500 ppm.
        let tick_adj = ((ppm / self.dhz).round() as i64).clamp(-self.max_tick_bias, self.max_tick_bias);
        let residual = (ppm - tick_adj as f64 * self.dhz)
            .clamp(-MAX_KERNEL_FREQ_PPM, MAX_KERNEL_FREQ_PPM);

        let new_tick = self.nominal_tick + tick_adj;
        if new_tick != self.base_tick {
            let before = self.raw.raw_time();
            self.kernel.set_tick(new_tick)?;
            let after = self.raw.raw_time();
            self.report_tick_window(before, after, new_tick - self.base_tick);
            self.base_tick = new_tick;
        }
        let applied = self.kernel.set_freq(residual)?;
        self.kernel_freq_ppm = applied;
        self.max_error = 0.0;

        // Restart any slew aborted above with the new base tick.
        if !self.slewing {
            self.initiate_slew()?;
        }
        Ok(tick_adj as f64 * self.dhz + applied)
    }

    fn accrue_offset(&mut self, offset: f64, _corr_rate: f64) -> Result<()> {
        if self.slewing {
            self.abort_fast_slew()?;
        }
        self.offset_register += offset;
        self.initiate_slew()
    }

    fn apply_step_offset(&mut self, offset: f64) -> Result<()> {
        if self.slewing {
            self.abort_fast_slew()?;
        }
        self.kernel.step(-offset)?;
        if self.offset_register.abs() >= 1e-9 {
            self.initiate_slew()?;
        }
        Ok(())
    }

    fn offset_correction(&mut self, raw: Ns) -> (f64, f64) {
        let remaining = if self.slewing {
            let done = self.slew_rate * ns_to_s(raw - self.slew_start_raw);
            let rem = self.offset_register + done;
            if self.offset_register > 0.0 {
                rem.max(0.0)
            } else {
                rem.min(0.0)
            }
        } else {
            self.offset_register
        };
        (-remaining, self.max_error)
    }

    fn set_leap(&mut self, sign: i8) -> Result<()> {
        self.kernel.set_leap(sign)
    }

    fn set_sync_status(&mut self, synchronised: bool, est_error: f64, max_error: f64) {
        self.kernel.set_sync_status(synchronised, est_error, max_error);
    }

    fn has_sync_status(&self) -> bool {
        true
    }
}

// ----------------------------------------------------------------------
// Real kernel binding
// ----------------------------------------------------------------------

/// adjtimex(2)-backed knobs.
#[cfg(target_os = "linux")]
pub struct LinuxTimex {
    /// Kernel frequency register units per ppm (1 << 16 on Linux).
    freq_scale: f64,
    pll_available: bool,
}

#[cfg(target_os = "linux")]
impl LinuxTimex {
    pub fn new(freq_scale: f64) -> Result<Self> {
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = 0;
        let ret = unsafe { libc::adjtimex(&mut tx) };
        if ret < 0 {
            return Err(anyhow::anyhow!(
                "adjtimex query failed (are you root?): {}",
                std::io::Error::last_os_error()
            ));
        }
        let pll_available = tx.status & libc::STA_NANO != 0;
        Ok(LinuxTimex {
            freq_scale,
            pll_available,
        })
    }

    fn call(tx: &mut libc::timex) -> Result<()> {
        let ret = unsafe { libc::adjtimex(tx) };
        if ret < 0 {
            return Err(anyhow::anyhow!(
                "adjtimex failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl TimexKernel for LinuxTimex {
    fn read_tick_freq(&mut self) -> Result<(i64, f64)> {
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = 0;
        Self::call(&mut tx)?;
        Ok((tx.tick, tx.freq as f64 / self.freq_scale))
    }

    fn set_tick(&mut self, tick: i64) -> Result<()> {
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = libc::ADJ_TICK;
        tx.tick = tick;
        Self::call(&mut tx)
    }

    fn set_freq(&mut self, ppm: f64) -> Result<f64> {
        let clamped = ppm.clamp(-MAX_KERNEL_FREQ_PPM, MAX_KERNEL_FREQ_PPM);
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = libc::ADJ_FREQUENCY;
        tx.freq = (clamped * self.freq_scale) as i64;
        Self::call(&mut tx)?;
        Ok(clamped)
    }

    fn offset_singleshot(&mut self, seconds: f64) -> Result<()> {
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = libc::ADJ_OFFSET_SINGLESHOT;
        tx.offset = (seconds * 1e6) as i64;
        Self::call(&mut tx)
    }

    fn pll_offset(&mut self, seconds: f64) -> Result<()> {
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = libc::ADJ_OFFSET | libc::ADJ_NANO | libc::ADJ_STATUS;
        tx.status = libc::STA_PLL;
        tx.offset = (seconds * 1e9) as i64;
        Self::call(&mut tx)
    }

    fn has_pll(&self) -> bool {
        self.pll_available
    }

    fn step(&mut self, seconds: f64) -> Result<()> {
        let mut tv: libc::timeval = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(anyhow::anyhow!("gettimeofday failed"));
        }
        let delta_usec = (seconds * 1e6).round() as i64;
        tv.tv_sec += delta_usec / 1_000_000;
        tv.tv_usec += delta_usec % 1_000_000;
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

    fn set_leap(&mut self, sign: i8) -> Result<()> {
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = libc::ADJ_STATUS;
        tx.status = match sign {
            1 => libc::STA_INS,
            -1 => libc::STA_DEL,
            _ => 0,
        };
        Self::call(&mut tx)
    }

    fn set_sync_status(&mut self, synchronised: bool, est_error: f64, max_error: f64) {
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = libc::ADJ_ESTERROR | libc::ADJ_MAXERROR;
        tx.esterror = (est_error * 1e6) as i64;
        tx.maxerror = if synchronised {
            (max_error * 1e6) as i64
        } else {
            16_000_000
        };
        let _ = unsafe { libc::adjtimex(&mut tx) };
    }
}
