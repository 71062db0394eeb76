//! Local clock driver.
//!
//! This is the only writer of the system clock. It keeps two registers:
//! `offset_register` (seconds still owed to the clock, positive = the
//! clock is fast) lives in the platform back-end, and `current_freq`
//! (absolute gain rate of the uncorrected clock, s/s) lives here.
//!
//! Raw time is the operating-system clock as read; cooked time is raw
//! plus the back-end's pending correction. Everything outside the driver
//! should use cooked time.
//!
//! Every slew and step is fanned out as a `ParameterChange` so that
//! sample histories and the timer queue can re-express stored times, and
//! every error the driver introduces (tick-change windows) is fanned out
//! as a dispersion increment.

pub mod adjtime;
pub mod timex;

use anyhow::Result;
use log::error;
use std::cell::RefCell;
use std::rc::Rc;

pub type Ns = i64;
pub const NS_PER_SEC: Ns = 1_000_000_000;

pub fn s_to_ns(s: f64) -> Ns {
    (s * 1e9).round() as Ns
}

pub fn ns_to_s(ns: Ns) -> f64 {
    ns as f64 / 1e9
}

/// log2 of the assumed reading precision of the local clock.
pub const PRECISION_LOG2: i8 = -20;

pub fn precision() -> f64 {
    (PRECISION_LOG2 as f64).exp2()
}

/// Reader of the undisciplined operating-system clock.
pub trait RawClock {
    fn raw_time(&self) -> Ns;
}

pub struct SystemRawClock;

impl RawClock for SystemRawClock {
    fn raw_time(&self) -> Ns {
        match nix::time::clock_gettime(nix::time::ClockId::CLOCK_REALTIME) {
            Ok(ts) => ts.tv_sec() as Ns * NS_PER_SEC + ts.tv_nsec() as Ns,
            Err(e) => {
                // A clock that cannot be read cannot be disciplined.
                error!("clock_gettime failed: {}", e);
                panic!("cannot read system clock");
            }
        }
    }
}

/// A slew, step or frequency change applied to the local clock.
#[derive(Debug, Clone, Copy)]
pub struct ParameterChange {
    pub when_raw: Ns,
    pub when_cooked: Ns,
    /// Change of the estimated gain rate of the uncorrected clock (s/s).
    pub dfreq: f64,
    /// Seconds newly owed to the clock; positive = the clock is fast.
    pub doffset: f64,
    pub is_step: bool,
}

type ParamHandler = Box<dyn FnMut(&ParameterChange)>;
type DispersionHandler = Box<dyn FnMut(f64)>;

/// Observer lists for parameter changes and introduced dispersion.
///
/// Shared between the driver front-end and its back-ends; subscribers
/// must not re-enter the driver from a notification.
#[derive(Default)]
pub struct ChangeHub {
    param: Vec<ParamHandler>,
    dispersion: Vec<DispersionHandler>,
}

impl ChangeHub {
    pub fn register_param_handler(&mut self, h: ParamHandler) {
        self.param.push(h);
    }

    pub fn register_dispersion_handler(&mut self, h: DispersionHandler) {
        self.dispersion.push(h);
    }

    pub fn notify_param(&mut self, change: &ParameterChange) {
        for h in self.param.iter_mut() {
            h(change);
        }
    }

    pub fn notify_dispersion(&mut self, disp: f64) {
        for h in self.dispersion.iter_mut() {
            h(disp);
        }
    }
}

/// Capability set a platform back-end registers at init.
pub trait ClockOps {
    /// Currently programmed frequency correction in ppm (positive = the
    /// kernel runs the clock faster than nominal).
    fn read_frequency(&mut self) -> f64;

    /// Program the kernel to run `ppm` faster than nominal; returns what
    /// was actually applied after clamping.
    fn set_frequency(&mut self, ppm: f64) -> Result<f64>;

    /// Add `offset` seconds to the pending slew. Positive = the clock is
    /// fast and must be slewed backwards. `corr_rate` is a hint for how
    /// quickly to remove it.
    fn accrue_offset(&mut self, offset: f64, corr_rate: f64) -> Result<()>;

    /// Step the clock; positive = jump backwards.
    fn apply_step_offset(&mut self, offset: f64) -> Result<()>;

    /// Correction to add to `raw` to get cooked time, plus a bound on its
    /// error.
    fn offset_correction(&mut self, raw: Ns) -> (f64, f64);

    fn set_leap(&mut self, _sign: i8) -> Result<()> {
        Ok(())
    }

    fn set_sync_status(&mut self, _synchronised: bool, _est_error: f64, _max_error: f64) {}

    fn has_sync_status(&self) -> bool {
        false
    }
}

pub struct LocalClock {
    raw: Rc<dyn RawClock>,
    ops: Rc<RefCell<dyn ClockOps>>,
    hub: Rc<RefCell<ChangeHub>>,
    /// Estimated gain rate of the uncorrected clock (s/s); the kernel is
    /// kept programmed at the negation of this.
    current_freq: f64,
}

impl LocalClock {
    pub fn new(
        raw: Rc<dyn RawClock>,
        ops: Rc<RefCell<dyn ClockOps>>,
        hub: Rc<RefCell<ChangeHub>>,
    ) -> Self {
        LocalClock {
            raw,
            ops,
            hub,
            current_freq: 0.0,
        }
    }

    pub fn raw_now(&self) -> Ns {
        self.raw.raw_time()
    }

    pub fn cooked_from_raw(&self, raw: Ns) -> (Ns, f64) {
        let (corr, err) = self.ops.borrow_mut().offset_correction(raw);
        (raw + s_to_ns(corr), err)
    }

    pub fn cooked_now(&self) -> (Ns, f64) {
        self.cooked_from_raw(self.raw.raw_time())
    }

    /// Gain rate of the uncorrected clock in ppm, as currently believed.
    pub fn frequency_ppm(&self) -> f64 {
        self.current_freq * 1e6
    }

    /// Seed the frequency from persisted state before any measurements
    /// exist. Does not notify: nothing holds samples yet.
    pub fn seed_frequency_ppm(&mut self, ppm: f64) -> Result<()> {
        let applied = self.ops.borrow_mut().set_frequency(-ppm)?;
        self.current_freq = -applied / 1e6;
        Ok(())
    }

    /// Fold a new offset into the pending slew.
    pub fn accumulate_offset(&mut self, offset: f64, corr_rate: f64) -> Result<()> {
        let (when_raw, when_cooked) = self.stamp();
        self.ops.borrow_mut().accrue_offset(offset, corr_rate)?;
        self.notify(ParameterChange {
            when_raw,
            when_cooked,
            dfreq: 0.0,
            doffset: offset,
            is_step: false,
        });
        Ok(())
    }

    /// Apply a new absolute frequency estimate and an offset in one
    /// update (the reference selector's correction path).
    pub fn accumulate_frequency_and_offset(
        &mut self,
        freq: f64,
        doffset: f64,
        corr_rate: f64,
    ) -> Result<()> {
        let (when_raw, when_cooked) = self.stamp();
        let dfreq = freq - self.current_freq;
        let applied = self.ops.borrow_mut().set_frequency(-freq * 1e6)?;
        self.current_freq = -applied / 1e6;
        self.ops.borrow_mut().accrue_offset(doffset, corr_rate)?;
        self.notify(ParameterChange {
            when_raw,
            when_cooked,
            dfreq,
            doffset,
            is_step: false,
        });
        Ok(())
    }

    /// Step the clock; positive = jump backwards.
    pub fn step_system_clock(&mut self, offset: f64) -> Result<()> {
        let (when_raw, when_cooked) = self.stamp();
        self.ops.borrow_mut().apply_step_offset(offset)?;
        self.notify(ParameterChange {
            when_raw,
            when_cooked,
            dfreq: 0.0,
            doffset: offset,
            is_step: true,
        });
        Ok(())
    }

    pub fn set_leap(&mut self, sign: i8) -> Result<()> {
        self.ops.borrow_mut().set_leap(sign)
    }

    pub fn set_sync_status(&mut self, synchronised: bool, est_error: f64, max_error: f64) {
        self.ops
            .borrow_mut()
            .set_sync_status(synchronised, est_error, max_error);
    }

    pub fn hub(&self) -> Rc<RefCell<ChangeHub>> {
        self.hub.clone()
    }

    fn stamp(&self) -> (Ns, Ns) {
        let raw = self.raw.raw_time();
        let (cooked, _) = self.cooked_from_raw(raw);
        (raw, cooked)
    }

    fn notify(&self, change: ParameterChange) {
        self.hub.borrow_mut().notify_param(&change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    pub struct FakeRaw {
        pub now: Cell<Ns>,
    }
    impl RawClock for FakeRaw {
        fn raw_time(&self) -> Ns {
            self.now.get()
        }
    }

    /// Ledger back-end: records calls, models a perfect kernel.
    #[derive(Default)]
    struct LedgerOps {
        freq_ppm: f64,
        offset_register: f64,
        steps: Vec<f64>,
    }

    impl ClockOps for LedgerOps {
        fn read_frequency(&mut self) -> f64 {
            self.freq_ppm
        }
        fn set_frequency(&mut self, ppm: f64) -> Result<f64> {
            self.freq_ppm = ppm;
            Ok(ppm)
        }
        fn accrue_offset(&mut self, offset: f64, _corr_rate: f64) -> Result<()> {
            self.offset_register += offset;
            Ok(())
        }
        fn apply_step_offset(&mut self, offset: f64) -> Result<()> {
            self.steps.push(offset);
            Ok(())
        }
        fn offset_correction(&mut self, _raw: Ns) -> (f64, f64) {
            (-self.offset_register, 0.0)
        }
    }

    fn fixture() -> (LocalClock, Rc<FakeRaw>, Rc<RefCell<ChangeHub>>) {
        let raw = Rc::new(FakeRaw { now: Cell::new(0) });
        let hub = Rc::new(RefCell::new(ChangeHub::default()));
        let ops = Rc::new(RefCell::new(LedgerOps::default()));
        let clock = LocalClock::new(raw.clone(), ops, hub.clone());
        (clock, raw, hub)
    }

    #[test]
    fn test_cooked_subtracts_pending_offset() {
        let (mut clock, raw, _hub) = fixture();
        raw.now.set(s_to_ns(100.0));
        clock.accumulate_offset(0.25, 1.0).unwrap();
        let (cooked, _) = clock.cooked_now();
        // Clock is 0.25 s fast, so cooked time is behind raw.
        assert_eq!(cooked, s_to_ns(99.75));
    }

    #[test]
    fn test_param_change_fans_out_in_order() {
        let (mut clock, raw, hub) = fixture();
        raw.now.set(s_to_ns(5.0));
        let seen = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = seen.clone();
            hub.borrow_mut().register_param_handler(Box::new(move |c| {
                seen.borrow_mut().push((tag, c.doffset, c.is_step));
            }));
        }
        clock.accumulate_offset(0.5, 1.0).unwrap();
        clock.step_system_clock(-1.0).unwrap();
        let seen = seen.borrow();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], ("first", 0.5, false));
        assert_eq!(seen[1], ("second", 0.5, false));
        assert_eq!(seen[2], ("first", -1.0, true));
        assert_eq!(seen[3], ("second", -1.0, true));
    }

    #[test]
    fn test_frequency_update_reports_delta() {
        let (mut clock, _raw, hub) = fixture();
        let dfreqs = Rc::new(RefCell::new(Vec::new()));
        let dfreqs2 = dfreqs.clone();
        hub.borrow_mut()
            .register_param_handler(Box::new(move |c| dfreqs2.borrow_mut().push(c.dfreq)));

        clock
            .accumulate_frequency_and_offset(10e-6, 0.0, 1.0)
            .unwrap();
        clock
            .accumulate_frequency_and_offset(4e-6, 0.0, 1.0)
            .unwrap();
        let dfreqs = dfreqs.borrow();
        assert!((dfreqs[0] - 10e-6).abs() < 1e-12);
        assert!((dfreqs[1] + 6e-6).abs() < 1e-12);
        assert!((clock.frequency_ppm() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_dispersion_fans_out() {
        let (_clock, _raw, hub) = fixture();
        let total = Rc::new(Cell::new(0.0));
        let t2 = total.clone();
        hub.borrow_mut()
            .register_dispersion_handler(Box::new(move |d| t2.set(t2.get() + d)));
        hub.borrow_mut().notify_dispersion(1e-4);
        hub.borrow_mut().notify_dispersion(2e-4);
        assert!((total.get() - 3e-4).abs() < 1e-12);
    }

    #[test]
    fn test_unit_conversions() {
        assert_eq!(s_to_ns(1.5), 1_500_000_000);
        assert_eq!(s_to_ns(-0.25), -250_000_000);
        assert_eq!(ns_to_s(3_000_000_000), 3.0);
    }
}
