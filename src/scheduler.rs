//! Cooperative single-threaded event loop.
//!
//! The whole daemon runs off this loop: file-descriptor readiness drives
//! packet reception, and a sorted timer queue drives source polling, the
//! reference update round and the clock driver's slew bookkeeping.
//!
//! Timers are kept in raw time so they are immune to slews; a step of the
//! local clock is compensated by shifting every queued expiry (see
//! `handle_step`), which preserves the wall-clock intent of events that
//! were already scheduled.

use crate::clock::{s_to_ns, Ns, RawClock};
use anyhow::{anyhow, Result};
use log::{debug, error};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::os::fd::RawFd;
use std::rc::Rc;

pub type TimerId = u64;

/// Timer class tags. Entries of the same class are kept apart by the
/// separation given to `add_timeout_in_class`, so that e.g. polls of
/// different NTP sources do not leave the machine in one burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerClass {
    Default,
    NtpSampling,
    NtpBurst,
}

type TimerHandler = Box<dyn FnOnce()>;
type FdHandler = Box<dyn FnMut(RawFd)>;
type CookedTimeFn = Box<dyn Fn(Ns) -> (Ns, f64)>;

struct TimerEntry {
    id: TimerId,
    expiry: Ns,
    class: TimerClass,
    handler: TimerHandler,
}

struct Inner {
    raw: Rc<dyn RawClock>,
    cooked: Option<CookedTimeFn>,
    /// Sorted ascending by expiry.
    timers: Vec<TimerEntry>,
    next_id: TimerId,
    fds: HashMap<RawFd, FdHandler>,
    /// Descriptors unregistered while their handler was running.
    removed_in_dispatch: HashSet<RawFd>,
    in_fd_dispatch: bool,
    last_ready: Option<(Ns, f64)>,
    quit: bool,
}

/// Cheap cloneable handle; all components hold one of these.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<RefCell<Inner>>,
}

impl Scheduler {
    pub fn new(raw: Rc<dyn RawClock>) -> Self {
        Scheduler {
            inner: Rc::new(RefCell::new(Inner {
                raw,
                cooked: None,
                timers: Vec::new(),
                next_id: 1,
                fds: HashMap::new(),
                removed_in_dispatch: HashSet::new(),
                in_fd_dispatch: false,
                last_ready: None,
                quit: false,
            })),
        }
    }

    /// Install the raw-to-cooked time mapping. Until this is called the
    /// last-ready timestamps are reported uncorrected.
    pub fn set_time_mapper(&self, f: CookedTimeFn) {
        self.inner.borrow_mut().cooked = Some(f);
    }

    pub fn raw_now(&self) -> Ns {
        let b = self.inner.borrow();
        b.raw.raw_time()
    }

    // ------------------------------------------------------------------
    // Descriptor registration
    // ------------------------------------------------------------------

    pub fn add_fd_handler(&self, fd: RawFd, handler: FdHandler) -> Result<()> {
        let mut b = self.inner.borrow_mut();
        if b.fds.contains_key(&fd) {
            return Err(anyhow!("descriptor {} already registered", fd));
        }
        b.removed_in_dispatch.remove(&fd);
        b.fds.insert(fd, handler);
        Ok(())
    }

    pub fn remove_fd_handler(&self, fd: RawFd) -> Result<()> {
        let mut b = self.inner.borrow_mut();
        if b.fds.remove(&fd).is_some() {
            return Ok(());
        }
        // The handler may be temporarily out of the table because it is
        // the one currently running.
        if b.in_fd_dispatch && b.removed_in_dispatch.insert(fd) {
            return Ok(());
        }
        Err(anyhow!("descriptor {} not registered", fd))
    }

    /// Cooked time (and error bound) recorded when the descriptor set
    /// last became ready. Used to timestamp received packets when the
    /// kernel did not stamp them itself.
    pub fn last_ready_time(&self) -> Option<(Ns, f64)> {
        self.inner.borrow().last_ready
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    pub fn add_timeout_at(&self, expiry: Ns, handler: TimerHandler) -> TimerId {
        self.insert_timer(expiry, TimerClass::Default, handler)
    }

    pub fn add_timeout_rel(&self, delay: f64, handler: TimerHandler) -> TimerId {
        let now = self.raw_now();
        self.insert_timer(now + s_to_ns(delay), TimerClass::Default, handler)
    }

    /// Schedule at the earliest time >= `min_delay` from now that keeps at
    /// least `separation` away from every queued entry of the same class,
    /// both before and after. `randomness` extends `min_delay` by a random
    /// fraction of itself to smear periodic events.
    pub fn add_timeout_in_class(
        &self,
        min_delay: f64,
        separation: f64,
        randomness: f64,
        class: TimerClass,
        handler: TimerHandler,
    ) -> TimerId {
        let mut delay = min_delay;
        if randomness > 0.0 {
            delay *= 1.0 + randomness * rand::random::<f64>();
        }
        let sep_ns = s_to_ns(separation);
        let now = self.raw_now();
        let mut expiry = now + s_to_ns(delay);
        {
            let b = self.inner.borrow();
            // Push the candidate past any same-class neighbour until a gap
            // is found; restart the scan after each move.
            'again: loop {
                for e in b.timers.iter().filter(|e| e.class == class) {
                    if (e.expiry - expiry).abs() < sep_ns {
                        expiry = e.expiry + sep_ns;
                        continue 'again;
                    }
                }
                break;
            }
        }
        self.insert_timer(expiry, class, handler)
    }

    fn insert_timer(&self, expiry: Ns, class: TimerClass, handler: TimerHandler) -> TimerId {
        let mut b = self.inner.borrow_mut();
        let id = b.next_id;
        b.next_id += 1;
        let pos = b.timers.partition_point(|e| e.expiry <= expiry);
        b.timers.insert(
            pos,
            TimerEntry {
                id,
                expiry,
                class,
                handler,
            },
        );
        id
    }

    /// Cancel a queued timeout. Cancelling an id that is not queued is a
    /// bug in the caller and aborts the daemon.
    pub fn remove_timeout(&self, id: TimerId) {
        let mut b = self.inner.borrow_mut();
        match b.timers.iter().position(|e| e.id == id) {
            Some(pos) => {
                b.timers.remove(pos);
            }
            None => {
                error!("attempt to cancel unknown timer id {}", id);
                panic!("scheduler: unknown timer id {}", id);
            }
        }
    }

    #[cfg(test)]
    pub fn timer_expiry(&self, id: TimerId) -> Option<Ns> {
        self.inner
            .borrow()
            .timers
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.expiry)
    }

    /// A step of `doffset` seconds was applied to the local clock
    /// (positive = the clock jumped backwards). Shift every queued expiry
    /// so already-scheduled events keep their wall-clock intent.
    pub fn handle_step(&self, doffset: f64) {
        let shift = s_to_ns(doffset);
        let mut b = self.inner.borrow_mut();
        for e in b.timers.iter_mut() {
            e.expiry -= shift;
        }
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    /// Drain all timers whose expiry has passed, oldest first. The queue
    /// head is re-read after every dispatch: handlers are free to add and
    /// cancel timers, including the one that would fire next.
    pub fn dispatch_pending_timers(&self) {
        loop {
            let entry = {
                let mut b = self.inner.borrow_mut();
                let now = b.raw.raw_time();
                if b.timers.first().map_or(false, |e| e.expiry <= now) {
                    Some(b.timers.remove(0))
                } else {
                    None
                }
            };
            match entry {
                Some(e) => (e.handler)(),
                None => break,
            }
        }
    }

    fn poll_timeout_ms(&self) -> i32 {
        let b = self.inner.borrow();
        match b.timers.first() {
            Some(e) => {
                let remaining = e.expiry - b.raw.raw_time();
                if remaining <= 0 {
                    0
                } else {
                    // Round up so we do not wake before the expiry.
                    ((remaining + 999_999) / 1_000_000).min(i32::MAX as Ns) as i32
                }
            }
            None => -1,
        }
    }

    fn record_ready_time(&self) {
        let mut b = self.inner.borrow_mut();
        let raw = b.raw.raw_time();
        let stamped = match &b.cooked {
            Some(f) => f(raw),
            None => (raw, 0.0),
        };
        b.last_ready = Some(stamped);
    }

    fn dispatch_ready_fd(&self, fd: RawFd) {
        let handler = {
            let mut b = self.inner.borrow_mut();
            b.in_fd_dispatch = true;
            b.fds.remove(&fd)
        };
        if let Some(mut h) = handler {
            h(fd);
            let mut b = self.inner.borrow_mut();
            let removed = b.removed_in_dispatch.remove(&fd);
            if !removed && !b.fds.contains_key(&fd) {
                b.fds.insert(fd, h);
            }
        }
        self.inner.borrow_mut().in_fd_dispatch = false;
    }

    pub fn quit(&self) {
        self.inner.borrow_mut().quit = true;
    }

    pub fn run(&self) -> Result<()> {
        loop {
            if self.inner.borrow().quit {
                return Ok(());
            }
            self.dispatch_pending_timers();
            if self.inner.borrow().quit {
                return Ok(());
            }

            let timeout = self.poll_timeout_ms();
            let fds: Vec<RawFd> = self.inner.borrow().fds.keys().copied().collect();
            if fds.is_empty() && timeout < 0 {
                return Err(anyhow!("nothing to wait for: no descriptors, no timers"));
            }

            let mut pfds: Vec<libc::pollfd> = fds
                .iter()
                .map(|&fd| libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect();

            let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(anyhow!("poll failed: {}", err));
            }
            if rc == 0 {
                continue;
            }

            self.record_ready_time();
            let ready: Vec<RawFd> = pfds
                .iter()
                .filter(|p| p.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0)
                .map(|p| p.fd)
                .collect();
            debug!("{} descriptor(s) ready", ready.len());
            for fd in ready {
                if self.inner.borrow().quit {
                    return Ok(());
                }
                self.dispatch_ready_fd(fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ns_to_s;
    use std::cell::Cell;

    struct FakeRaw {
        now: Cell<Ns>,
    }
    impl RawClock for FakeRaw {
        fn raw_time(&self) -> Ns {
            self.now.get()
        }
    }

    fn fixture() -> (Scheduler, Rc<FakeRaw>) {
        let raw = Rc::new(FakeRaw { now: Cell::new(0) });
        let sched = Scheduler::new(raw.clone());
        (sched, raw)
    }

    #[test]
    fn test_timers_fire_in_expiry_order() {
        let (sched, raw) = fixture();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (label, at) in [("b", 200), ("a", 100), ("c", 300)] {
            let order = order.clone();
            sched.add_timeout_at(at, Box::new(move || order.borrow_mut().push(label)));
        }
        raw.now.set(250);
        sched.dispatch_pending_timers();
        assert_eq!(*order.borrow(), vec!["a", "b"]);
        raw.now.set(300);
        sched.dispatch_pending_timers();
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_handler_may_cancel_next_timer() {
        let (sched, raw) = fixture();
        let fired = Rc::new(Cell::new(false));

        // First handler cancels the second before it can run.
        let sched2 = sched.clone();
        let victim = {
            let fired = fired.clone();
            sched.add_timeout_at(200, Box::new(move || fired.set(true)))
        };
        sched.add_timeout_at(100, Box::new(move || sched2.remove_timeout(victim)));

        raw.now.set(300);
        sched.dispatch_pending_timers();
        assert!(!fired.get());
    }

    #[test]
    fn test_handler_may_schedule_immediate_timer() {
        let (sched, raw) = fixture();
        let count = Rc::new(Cell::new(0));
        let sched2 = sched.clone();
        let count2 = count.clone();
        sched.add_timeout_at(
            100,
            Box::new(move || {
                count2.set(count2.get() + 1);
                let count3 = count2.clone();
                // Already expired; must run in the same drain.
                sched2.add_timeout_at(150, Box::new(move || count3.set(count3.get() + 1)));
            }),
        );
        raw.now.set(200);
        sched.dispatch_pending_timers();
        assert_eq!(count.get(), 2);
    }

    #[test]
    #[should_panic(expected = "unknown timer id")]
    fn test_cancel_unknown_timer_is_fatal() {
        let (sched, _raw) = fixture();
        sched.remove_timeout(42);
    }

    #[test]
    fn test_class_separation_keeps_entries_apart() {
        let (sched, _raw) = fixture();
        let sep = 0.2;
        let ids: Vec<TimerId> = (0..5)
            .map(|_| {
                sched.add_timeout_in_class(1.0, sep, 0.0, TimerClass::NtpSampling, Box::new(|| {}))
            })
            .collect();
        let mut expiries: Vec<Ns> = ids
            .iter()
            .map(|&id| sched.timer_expiry(id).unwrap())
            .collect();
        expiries.sort_unstable();
        for w in expiries.windows(2) {
            assert!(
                w[1] - w[0] >= s_to_ns(sep),
                "entries {} and {} closer than separation",
                w[0],
                w[1]
            );
        }
    }

    #[test]
    fn test_class_separation_ignores_other_classes() {
        let (sched, _raw) = fixture();
        let a = sched.add_timeout_in_class(1.0, 0.5, 0.0, TimerClass::NtpSampling, Box::new(|| {}));
        let b = sched.add_timeout_in_class(1.0, 0.5, 0.0, TimerClass::NtpBurst, Box::new(|| {}));
        // Different classes may share the same slot.
        assert_eq!(sched.timer_expiry(a), sched.timer_expiry(b));
    }

    #[test]
    fn test_randomness_extends_min_delay() {
        let (sched, _raw) = fixture();
        for _ in 0..32 {
            let id =
                sched.add_timeout_in_class(1.0, 0.0, 0.5, TimerClass::NtpSampling, Box::new(|| {}));
            let expiry = sched.timer_expiry(id).unwrap();
            assert!(expiry >= s_to_ns(1.0));
            assert!(expiry <= s_to_ns(1.5) + 1);
        }
    }

    #[test]
    fn test_step_shifts_queued_expiries() {
        let (sched, _raw) = fixture();
        let id = sched.add_timeout_at(s_to_ns(10.0), Box::new(|| {}));
        // Clock stepped 2 s forward (doffset = -2).
        sched.handle_step(-2.0);
        assert_eq!(sched.timer_expiry(id), Some(s_to_ns(12.0)));
        // And 1 s backwards (doffset = +1).
        sched.handle_step(1.0);
        assert_eq!(sched.timer_expiry(id), Some(s_to_ns(11.0)));
    }

    #[test]
    fn test_duplicate_fd_registration_fails() {
        let (sched, _raw) = fixture();
        sched.add_fd_handler(5, Box::new(|_| {})).unwrap();
        assert!(sched.add_fd_handler(5, Box::new(|_| {})).is_err());
        sched.remove_fd_handler(5).unwrap();
        assert!(sched.remove_fd_handler(5).is_err());
        sched.add_fd_handler(5, Box::new(|_| {})).unwrap();
    }

    #[test]
    fn test_relative_timeout_uses_raw_now() {
        let (sched, raw) = fixture();
        raw.now.set(s_to_ns(100.0));
        let id = sched.add_timeout_rel(2.5, Box::new(|| {}));
        assert_eq!(sched.timer_expiry(id), Some(s_to_ns(102.5)));
        assert_eq!(ns_to_s(sched.timer_expiry(id).unwrap() - raw.now.get()), 2.5);
    }
}
