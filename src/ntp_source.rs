//! Per-source NTP state machine.
//!
//! One instance per configured remote source. A single scheduler timer
//! per source drives everything: when it fires, an unanswered request is
//! counted as a miss, a new request goes out, and the timer is
//! rescheduled at the current polling interval, which doubles as the
//! reply timeout. Polls are scheduled in the sampling class so that
//! requests to different sources stay at least 200 ms apart on the wire.

use crate::clock::{ns_to_s, precision, LocalClock, Ns};
use crate::config::{SelectOption, SourceOptions, SourceType};
use crate::packet::{self, NtpPacket, NtpTimestamp};
use crate::scheduler::{Scheduler, TimerClass, TimerId};
use crate::sourcestats::SourceStats;
use anyhow::Result;
use log::{debug, warn};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

/// Minimum spacing between polls of different sources.
const SAMPLING_SEPARATION: f64 = 0.2;
/// Random extension of poll delays.
const SAMPLING_RANDOMNESS: f64 = 0.1;
/// Poll cadence while bursting.
const BURST_INTERVAL: f64 = 2.0;
/// Delay before the first transmission of a burst.
const BURST_START_DELAY: f64 = 0.1;
/// iburst behaves as `burst 4/8`.
const IBURST_GOOD: u32 = 4;
const IBURST_TOTAL: u32 = 8;
/// Assumed error rate of the local clock for the sample filter.
const CLOCK_ERROR_RATE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Offline,
    OnlineIdle,
    /// Request outstanding, awaiting the matching reply.
    Transmitted,
    /// Bursting; returns to OnlineIdle when done.
    BurstGood,
    /// Bursting; returns to Offline when done.
    BurstOffline,
}

/// Where source packets leave the daemon; the packet I/O layer
/// implements this.
pub trait PacketSender {
    fn send(&mut self, to: SocketAddr, data: &[u8]) -> Result<()>;
}

pub struct NtpSource {
    remote: SocketAddr,
    source_type: SourceType,
    opts: SourceOptions,
    /// Key id and material when authentication is configured.
    key: Option<(u32, Vec<u8>)>,

    state: State,
    local_poll: i8,
    poll_score: f64,
    /// Shift register of recent poll outcomes; bit 0 = latest.
    reach: u8,
    tx_count: u32,
    auth_failures: u64,

    last_tx_ts: Option<NtpTimestamp>,
    presend_origin: Option<NtpTimestamp>,

    burst_good_left: u32,
    burst_total_left: u32,

    remote_stratum: u8,
    remote_leap: u8,

    poll_timer: Option<TimerId>,

    stats: Rc<RefCell<SourceStats>>,
    sched: Scheduler,
    clock: Rc<RefCell<LocalClock>>,
    sender: Rc<RefCell<dyn PacketSender>>,
    self_ref: Weak<RefCell<NtpSource>>,
}

impl NtpSource {
    pub fn new(
        remote: SocketAddr,
        source_type: SourceType,
        opts: SourceOptions,
        key: Option<(u32, Vec<u8>)>,
        stats: Rc<RefCell<SourceStats>>,
        sched: Scheduler,
        clock: Rc<RefCell<LocalClock>>,
        sender: Rc<RefCell<dyn PacketSender>>,
    ) -> Rc<RefCell<NtpSource>> {
        let local_poll = opts.minpoll;
        let source = Rc::new(RefCell::new(NtpSource {
            remote,
            source_type,
            opts,
            key,
            state: State::Offline,
            local_poll,
            poll_score: 0.0,
            reach: 0,
            tx_count: 0,
            auth_failures: 0,
            last_tx_ts: None,
            presend_origin: None,
            burst_good_left: 0,
            burst_total_left: 0,
            remote_stratum: 0,
            remote_leap: packet::LEAP_UNSYNC,
            poll_timer: None,
            stats,
            sched,
            clock,
            sender,
            self_ref: Weak::new(),
        }));
        source.borrow_mut().self_ref = Rc::downgrade(&source);
        source
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn replace_address(&mut self, addr: SocketAddr) {
        self.remote = addr;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn is_online(&self) -> bool {
        self.state != State::Offline
    }

    pub fn is_bursting(&self) -> bool {
        matches!(self.state, State::BurstGood | State::BurstOffline)
    }

    pub fn reach(&self) -> u8 {
        self.reach
    }

    pub fn local_poll(&self) -> i8 {
        self.local_poll
    }

    pub fn stratum(&self) -> u8 {
        self.remote_stratum
    }

    pub fn leap(&self) -> u8 {
        self.remote_leap
    }

    pub fn select_option(&self) -> SelectOption {
        self.opts.select_option()
    }

    pub fn stats(&self) -> Rc<RefCell<SourceStats>> {
        self.stats.clone()
    }

    /// A source takes part in selection once it has been heard from
    /// recently.
    pub fn is_selectable(&self) -> bool {
        self.state != State::Offline && self.reach != 0
    }

    // ------------------------------------------------------------------
    // Runtime tuning
    // ------------------------------------------------------------------

    pub fn set_minpoll(&mut self, v: i8) {
        self.opts.minpoll = v;
        self.clamp_poll();
    }

    pub fn set_maxpoll(&mut self, v: i8) {
        self.opts.maxpoll = v;
        self.clamp_poll();
    }

    pub fn set_presend(&mut self, v: Option<i8>) {
        self.opts.presend = v;
    }

    pub fn set_maxdelay(&mut self, v: f64) {
        self.opts.maxdelay = v;
    }

    pub fn set_maxdelayratio(&mut self, v: f64) {
        self.opts.maxdelayratio = v;
    }

    pub fn set_maxdelaydevratio(&mut self, v: f64) {
        self.opts.maxdelaydevratio = v;
    }

    pub fn set_minstratum(&mut self, v: u8) {
        self.opts.minstratum = v;
    }

    pub fn set_polltarget(&mut self, v: u32) {
        self.opts.polltarget = v.max(1);
    }

    fn clamp_poll(&mut self) {
        // max then min, so a minpoll above maxpoll cannot panic.
        self.local_poll = self.local_poll.max(self.opts.minpoll).min(self.opts.maxpoll);
    }

    // ------------------------------------------------------------------
    // Mode transitions
    // ------------------------------------------------------------------

    pub fn take_online(&mut self) {
        if self.state != State::Offline {
            return;
        }
        self.state = State::OnlineIdle;
        if self.opts.iburst {
            self.enter_burst(IBURST_GOOD, IBURST_TOTAL);
            return;
        }
        // First poll at a random delay bounded by 2^minpoll.
        let bound = (self.opts.minpoll as f64).exp2();
        let delay = (rand::random::<f64>() * bound).max(BURST_START_DELAY);
        self.schedule_poll(delay, 0.0, TimerClass::NtpSampling);
    }

    pub fn take_offline(&mut self) {
        if self.state == State::Offline {
            return;
        }
        if let Some(id) = self.poll_timer.take() {
            self.sched.remove_timeout(id);
        }
        self.state = State::Offline;
        self.last_tx_ts = None;
        self.presend_origin = None;
        self.burst_good_left = 0;
        self.burst_total_left = 0;
    }

    /// `burst N/M`: collect `good` good samples within at most `total`
    /// requests at the burst cadence, then return to the previous mode.
    pub fn start_burst(&mut self, good: u32, total: u32) {
        self.enter_burst(good, total);
    }

    fn enter_burst(&mut self, good: u32, total: u32) {
        self.burst_good_left = good.max(1);
        self.burst_total_left = total.max(good);
        self.state = match self.state {
            State::Offline | State::BurstOffline => State::BurstOffline,
            _ => State::BurstGood,
        };
        if let Some(id) = self.poll_timer.take() {
            self.sched.remove_timeout(id);
        }
        self.schedule_poll(BURST_START_DELAY, 0.0, TimerClass::NtpBurst);
    }

    fn end_burst(&mut self) {
        let next = match self.state {
            State::BurstOffline => State::Offline,
            _ => State::OnlineIdle,
        };
        self.burst_good_left = 0;
        self.burst_total_left = 0;
        self.state = next;
        if next == State::Offline {
            if let Some(id) = self.poll_timer.take() {
                self.sched.remove_timeout(id);
            }
            self.last_tx_ts = None;
        }
    }

    // ------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------

    fn schedule_poll(&mut self, delay: f64, randomness: f64, class: TimerClass) {
        let me = self.self_ref.clone();
        self.poll_timer = Some(self.sched.add_timeout_in_class(
            delay,
            SAMPLING_SEPARATION,
            randomness,
            class,
            Box::new(move || {
                if let Some(source) = me.upgrade() {
                    let mut s = source.borrow_mut();
                    s.poll_timer = None;
                    s.transmit_timeout();
                }
            }),
        ));
    }

    fn schedule_next_poll(&mut self) {
        let (delay, randomness, class) = if self.is_bursting() {
            (BURST_INTERVAL, 0.0, TimerClass::NtpBurst)
        } else {
            (
                (self.local_poll as f64).exp2(),
                SAMPLING_RANDOMNESS,
                TimerClass::NtpSampling,
            )
        };
        self.schedule_poll(delay, randomness, class);
    }

    /// The poll timer fired: account a miss if a request was outstanding,
    /// transmit the next request and re-arm.
    fn transmit_timeout(&mut self) {
        match self.state {
            State::Offline => return,
            State::Transmitted => {
                // No reply within the poll interval.
                debug!(
                    "{}: no reply to previous request ({} unanswered)",
                    self.remote, self.tx_count
                );
                self.reach <<= 1;
                self.state = State::OnlineIdle;
            }
            _ => {
                if self.last_tx_ts.is_some() {
                    self.reach <<= 1;
                }
            }
        }

        if self.is_bursting() && self.burst_total_left == 0 {
            self.end_burst();
            if self.state == State::Offline {
                return;
            }
        }

        // Warm up the path before long-interval polls.
        if let Some(presend) = self.opts.presend {
            if !self.is_bursting() && self.local_poll >= presend && self.presend_origin.is_none() {
                if let Some(ts) = self.send_request() {
                    self.presend_origin = Some(ts);
                }
                // The real request follows on the next timeout.
                self.schedule_poll(BURST_INTERVAL, 0.0, TimerClass::NtpSampling);
                return;
            }
        }

        match self.send_request() {
            Some(ts) => {
                self.last_tx_ts = Some(ts);
                self.tx_count += 1;
                if self.is_bursting() {
                    self.burst_total_left = self.burst_total_left.saturating_sub(1);
                } else {
                    self.state = State::Transmitted;
                }
                self.schedule_next_poll();
            }
            None => {
                if self.opts.auto_offline {
                    warn!("{}: send failed, taking source offline", self.remote);
                    self.take_offline();
                } else {
                    self.schedule_next_poll();
                }
            }
        }
    }

    fn send_request(&mut self) -> Option<NtpTimestamp> {
        let (cooked, _err) = self.clock.borrow().cooked_now();
        let tx_ts = NtpTimestamp::from_unix_ns(cooked);
        let mode = match self.source_type {
            SourceType::Server => packet::MODE_CLIENT,
            SourceType::Peer => packet::MODE_SYMMETRIC_ACTIVE,
        };
        let pkt = NtpPacket {
            leap: packet::LEAP_NORMAL,
            version: packet::VERSION,
            mode,
            stratum: 0,
            poll: self.local_poll,
            precision: crate::clock::PRECISION_LOG2,
            transmit_ts: tx_ts,
            ..NtpPacket::default()
        };
        let wire = match &self.key {
            Some((id, material)) => pkt.encode_with_mac(*id, material),
            None => pkt.encode(),
        };
        match self.sender.borrow_mut().send(self.remote, &wire) {
            Ok(()) => Some(tx_ts),
            Err(e) => {
                warn!("{}: transmit failed: {}", self.remote, e);
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Process a packet from this source's address. Returns true when a
    /// sample was accumulated (the caller then runs a selection round).
    pub fn process_reply(&mut self, pkt: &NtpPacket, raw: &[u8], rx_cooked: Ns, rx_err: f64) -> bool {
        if self.state == State::Offline {
            return false;
        }

        let expected_mode = match self.source_type {
            SourceType::Server => pkt.mode == packet::MODE_SERVER,
            SourceType::Peer => {
                pkt.mode == packet::MODE_SYMMETRIC_ACTIVE
                    || pkt.mode == packet::MODE_SYMMETRIC_PASSIVE
            }
        };
        if !expected_mode {
            debug!("{}: unexpected mode {}", self.remote, pkt.mode);
            return false;
        }

        // The reply to a presend warm-up is discarded.
        if self.presend_origin == Some(pkt.origin_ts) {
            self.presend_origin = None;
            return false;
        }

        match self.last_tx_ts {
            Some(tx) if pkt.origin_ts == tx => {}
            _ => {
                debug!("{}: origin timestamp mismatch", self.remote);
                return false;
            }
        }

        if let Some((_, material)) = &self.key {
            if !packet::verify_mac(raw, material) {
                self.auth_failures += 1;
                warn!(
                    "{}: authentication failed ({} so far)",
                    self.remote, self.auth_failures
                );
                return false;
            }
        }

        // Kiss-o'-death and unsynchronised servers carry no usable time.
        if pkt.stratum == 0 || pkt.leap == packet::LEAP_UNSYNC {
            debug!("{}: reply unusable (stratum 0 or unsynchronised)", self.remote);
            return false;
        }
        if pkt.receive_ts.is_zero() || pkt.transmit_ts.is_zero() {
            return false;
        }

        // Request answered; the association is no longer outstanding.
        self.last_tx_ts = None;
        self.presend_origin = None;
        self.tx_count = 0;
        self.reach = (self.reach << 1) | 1;
        if self.state == State::Transmitted {
            self.state = State::OnlineIdle;
        }

        let t1 = pkt.origin_ts.to_unix_ns();
        let t2 = pkt.receive_ts.to_unix_ns();
        let t3 = pkt.transmit_ts.to_unix_ns();
        let t4 = rx_cooked;

        // Positive = local clock ahead of the source.
        let offset = (ns_to_s(t1 - t2) + ns_to_s(t4 - t3)) / 2.0;
        let rtt = ns_to_s((t4 - t1) - (t3 - t2)).max(precision());
        let remote_precision = (pkt.precision as f64).exp2();
        let dispersion =
            precision() + remote_precision + rx_err + CLOCK_ERROR_RATE * ns_to_s(t4 - t1);
        let stratum = pkt.stratum.max(self.opts.minstratum);

        self.remote_stratum = stratum;
        self.remote_leap = pkt.leap;

        let accepted = self.test_delays(offset, rtt, t4);
        if !accepted {
            debug!(
                "{}: sample rejected (offset {:.9}, delay {:.9})",
                self.remote, offset, rtt
            );
        } else {
            let mut stats = self.stats.borrow_mut();
            stats.accumulate_sample(
                t4,
                offset,
                rtt,
                dispersion,
                pkt.root_delay + rtt,
                pkt.root_dispersion + dispersion,
                stratum,
            );
            let regression_ok = stats.run_regression();
            let kept = stats.n_samples();
            drop(stats);
            if regression_ok {
                let target = self.opts.polltarget as f64;
                self.adjust_poll((kept as f64 - target) / (2.0 * target));
            }
            if self.is_bursting() {
                self.burst_good_left = self.burst_good_left.saturating_sub(1);
                if self.burst_good_left == 0 {
                    self.end_burst();
                }
            }
        }
        accepted
    }

    fn test_delays(&self, offset: f64, delay: f64, t4: Ns) -> bool {
        if self.opts.maxdelay > 0.0 && delay > self.opts.maxdelay {
            return false;
        }
        let stats = self.stats.borrow();
        if self.opts.maxdelayratio > 0.0
            && stats.n_samples() > 0
            && delay > stats.min_delay() * self.opts.maxdelayratio
        {
            return false;
        }
        stats.is_good_sample(
            offset,
            delay,
            self.opts.maxdelaydevratio,
            CLOCK_ERROR_RATE,
            t4,
        )
    }

    /// Nudge the polling interval so the regression keeps roughly
    /// `polltarget` samples.
    fn adjust_poll(&mut self, adj: f64) {
        self.poll_score += adj;
        if self.poll_score >= 1.0 {
            if self.local_poll < self.opts.maxpoll {
                self.local_poll += 1;
            }
            self.poll_score = 0.0;
        } else if self.poll_score < 0.0 {
            if self.local_poll > self.opts.minpoll {
                self.local_poll -= 1;
            }
            self.poll_score = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{s_to_ns, ChangeHub, ClockOps, RawClock};
    use std::cell::Cell;
    use std::net::{IpAddr, Ipv4Addr};

    struct FakeRaw {
        now: Cell<Ns>,
    }
    impl RawClock for FakeRaw {
        fn raw_time(&self) -> Ns {
            self.now.get()
        }
    }

    struct NullOps;
    impl ClockOps for NullOps {
        fn read_frequency(&mut self) -> f64 {
            0.0
        }
        fn set_frequency(&mut self, ppm: f64) -> Result<f64> {
            Ok(ppm)
        }
        fn accrue_offset(&mut self, _o: f64, _r: f64) -> Result<()> {
            Ok(())
        }
        fn apply_step_offset(&mut self, _o: f64) -> Result<()> {
            Ok(())
        }
        fn offset_correction(&mut self, _raw: Ns) -> (f64, f64) {
            (0.0, 0.0)
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Vec<(SocketAddr, Vec<u8>)>,
        fail: bool,
    }
    impl PacketSender for RecordingSender {
        fn send(&mut self, to: SocketAddr, data: &[u8]) -> Result<()> {
            if self.fail {
                return Err(anyhow::anyhow!("network unreachable"));
            }
            self.sent.push((to, data.to_vec()));
            Ok(())
        }
    }

    struct Fixture {
        raw: Rc<FakeRaw>,
        sched: Scheduler,
        sender: Rc<RefCell<RecordingSender>>,
        source: Rc<RefCell<NtpSource>>,
    }

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)), 123)
    }

    fn fixture_with(opts: SourceOptions, key: Option<(u32, Vec<u8>)>) -> Fixture {
        let raw = Rc::new(FakeRaw {
            now: Cell::new(s_to_ns(1000.0)),
        });
        let sched = Scheduler::new(raw.clone());
        let hub = Rc::new(RefCell::new(ChangeHub::default()));
        let clock = Rc::new(RefCell::new(LocalClock::new(
            raw.clone(),
            Rc::new(RefCell::new(NullOps)),
            hub,
        )));
        let sender = Rc::new(RefCell::new(RecordingSender::default()));
        let stats = Rc::new(RefCell::new(SourceStats::new(64, 3)));
        let source = NtpSource::new(
            addr(),
            SourceType::Server,
            opts,
            key,
            stats,
            sched.clone(),
            clock,
            sender.clone(),
        );
        Fixture {
            raw,
            sched,
            sender,
            source,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SourceOptions::default(), None)
    }

    fn advance_and_fire(f: &Fixture, seconds: f64) {
        f.raw.now.set(f.raw.now.get() + s_to_ns(seconds));
        f.sched.dispatch_pending_timers();
    }

    /// Build a well-formed server reply to the last transmitted request.
    fn reply_to(f: &Fixture, offset: f64, delay: f64) -> (NtpPacket, Vec<u8>, Ns) {
        let (_, wire) = f.sender.borrow().sent.last().cloned().unwrap();
        let req = NtpPacket::parse(&wire).unwrap();
        let t1 = req.transmit_ts.to_unix_ns();
        // Symmetric path: each leg is delay/2; server behind us by
        // `offset` in its own timestamps.
        let t2 = t1 + s_to_ns(delay / 2.0 - offset);
        let t3 = t2 + s_to_ns(0.0005);
        let t4 = t1 + s_to_ns(delay + 0.0005);
        let pkt = NtpPacket {
            leap: packet::LEAP_NORMAL,
            version: packet::VERSION,
            mode: packet::MODE_SERVER,
            stratum: 2,
            poll: req.poll,
            precision: -20,
            root_delay: 0.01,
            root_dispersion: 0.002,
            reference_id: 0x7f000001,
            reference_ts: NtpTimestamp::from_unix_ns(t2 - s_to_ns(10.0)),
            origin_ts: req.transmit_ts,
            receive_ts: NtpTimestamp::from_unix_ns(t2),
            transmit_ts: NtpTimestamp::from_unix_ns(t3),
            mac_key_id: None,
        };
        (pkt, pkt.encode(), t4)
    }

    #[test]
    fn test_take_online_schedules_poll_within_minpoll() {
        let f = fixture();
        f.source.borrow_mut().take_online();
        let s = f.source.borrow();
        assert_eq!(s.state(), State::OnlineIdle);
        let id = s.poll_timer.unwrap();
        let expiry = f.sched.timer_expiry(id).unwrap();
        let bound = (s.opts.minpoll as f64).exp2();
        assert!(ns_to_s(expiry - f.raw.now.get()) <= bound + 1e-9);
    }

    #[test]
    fn test_transmit_builds_client_request() {
        let f = fixture();
        f.source.borrow_mut().take_online();
        advance_and_fire(&f, 70.0);
        let sent = &f.sender.borrow().sent;
        assert_eq!(sent.len(), 1);
        let pkt = NtpPacket::parse(&sent[0].1).unwrap();
        assert_eq!(pkt.mode, packet::MODE_CLIENT);
        assert_eq!(pkt.version, packet::VERSION);
        assert!(!pkt.transmit_ts.is_zero());
        assert_eq!(f.source.borrow().state(), State::Transmitted);
        // The reply timeout is queued.
        assert!(f.source.borrow().poll_timer.is_some());
    }

    #[test]
    fn test_reply_accumulates_sample_with_offset_sign() {
        let f = fixture();
        f.source.borrow_mut().take_online();
        advance_and_fire(&f, 70.0);

        // Local clock 0.5 s ahead of the server.
        let (pkt, raw, t4) = reply_to(&f, 0.5, 0.02);
        let accepted = f.source.borrow_mut().process_reply(&pkt, &raw, t4, 0.0);
        assert!(accepted);

        let s = f.source.borrow();
        assert_eq!(s.state(), State::OnlineIdle);
        assert_eq!(s.reach() & 1, 1);
        assert_eq!(s.stratum(), 2);
        let stats = s.stats();
        let stats = stats.borrow();
        assert_eq!(stats.n_samples(), 1);
        assert!((stats.predict_offset(t4) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_reply_with_wrong_origin_is_discarded() {
        let f = fixture();
        f.source.borrow_mut().take_online();
        advance_and_fire(&f, 70.0);
        let (mut pkt, _raw, t4) = reply_to(&f, 0.0, 0.02);
        pkt.origin_ts = NtpTimestamp(pkt.origin_ts.0 ^ 1);
        let raw = pkt.encode();
        assert!(!f.source.borrow_mut().process_reply(&pkt, &raw, t4, 0.0));
        assert_eq!(f.source.borrow().stats().borrow().n_samples(), 0);
        // Still waiting for the real reply.
        assert_eq!(f.source.borrow().state(), State::Transmitted);
    }

    #[test]
    fn test_unsynchronised_reply_is_discarded() {
        let f = fixture();
        f.source.borrow_mut().take_online();
        advance_and_fire(&f, 70.0);
        let (mut pkt, _, t4) = reply_to(&f, 0.0, 0.02);
        pkt.leap = packet::LEAP_UNSYNC;
        let raw = pkt.encode();
        assert!(!f.source.borrow_mut().process_reply(&pkt, &raw, t4, 0.0));
        let (mut pkt, _, t4) = reply_to(&f, 0.0, 0.02);
        pkt.stratum = 0;
        let raw = pkt.encode();
        assert!(!f.source.borrow_mut().process_reply(&pkt, &raw, t4, 0.0));
    }

    #[test]
    fn test_authentication_rejects_bad_mac() {
        let key = (5u32, b"key material".to_vec());
        let opts = SourceOptions {
            key: Some(5),
            ..SourceOptions::default()
        };
        let f = fixture_with(opts, Some(key));
        f.source.borrow_mut().take_online();
        advance_and_fire(&f, 70.0);

        // The request itself carries a MAC.
        let sent = f.sender.borrow().sent.last().cloned().unwrap().1;
        assert_eq!(sent.len(), packet::HEADER_LEN + packet::MAC_LEN);

        // A reply without a valid MAC is dropped.
        let (pkt, raw, t4) = reply_to(&f, 0.0, 0.02);
        assert!(!f.source.borrow_mut().process_reply(&pkt, &raw, t4, 0.0));
        assert_eq!(f.source.borrow().auth_failures, 1);

        // The same reply signed with the right key passes.
        let signed = pkt.encode_with_mac(5, b"key material");
        assert!(f.source.borrow_mut().process_reply(&pkt, &signed, t4, 0.0));
    }

    #[test]
    fn test_missed_replies_shift_reach() {
        let f = fixture();
        f.source.borrow_mut().take_online();
        advance_and_fire(&f, 70.0);
        let (pkt, raw, t4) = reply_to(&f, 0.0, 0.02);
        assert!(f.source.borrow_mut().process_reply(&pkt, &raw, t4, 0.0));
        assert_eq!(f.source.borrow().reach(), 1);

        // First timeout transmits; the next two find the request
        // unanswered and shift the register.
        advance_and_fire(&f, 80.0);
        advance_and_fire(&f, 80.0);
        advance_and_fire(&f, 80.0);
        assert_eq!(f.source.borrow().reach(), 0b100);
        assert_eq!(f.source.borrow().state(), State::Transmitted);
    }

    #[test]
    fn test_take_offline_cancels_poll() {
        let f = fixture();
        f.source.borrow_mut().take_online();
        f.source.borrow_mut().take_offline();
        assert_eq!(f.source.borrow().state(), State::Offline);
        assert!(f.source.borrow().poll_timer.is_none());
        // No transmission happens later.
        advance_and_fire(&f, 1000.0);
        assert!(f.sender.borrow().sent.is_empty());
    }

    #[test]
    fn test_iburst_runs_burst_then_settles() {
        let opts = SourceOptions {
            iburst: true,
            ..SourceOptions::default()
        };
        let f = fixture_with(opts, None);
        f.source.borrow_mut().take_online();
        assert_eq!(f.source.borrow().state(), State::BurstGood);

        // Answer four bursts; the source must return to OnlineIdle.
        for _ in 0..4 {
            advance_and_fire(&f, 2.5);
            let (pkt, raw, t4) = reply_to(&f, 0.001, 0.02);
            f.source.borrow_mut().process_reply(&pkt, &raw, t4, 0.0);
        }
        assert_eq!(f.source.borrow().state(), State::OnlineIdle);
        assert_eq!(f.sender.borrow().sent.len(), 4);
    }

    #[test]
    fn test_burst_from_offline_returns_offline() {
        let opts = SourceOptions {
            offline: true,
            ..SourceOptions::default()
        };
        let f = fixture_with(opts, None);
        f.source.borrow_mut().start_burst(1, 2);
        assert_eq!(f.source.borrow().state(), State::BurstOffline);
        advance_and_fire(&f, 2.5);
        let (pkt, raw, t4) = reply_to(&f, 0.001, 0.02);
        assert!(f.source.borrow_mut().process_reply(&pkt, &raw, t4, 0.0));
        assert_eq!(f.source.borrow().state(), State::Offline);
    }

    #[test]
    fn test_maxdelay_rejects_slow_sample() {
        let opts = SourceOptions {
            maxdelay: 0.01,
            ..SourceOptions::default()
        };
        let f = fixture_with(opts, None);
        f.source.borrow_mut().take_online();
        advance_and_fire(&f, 70.0);
        let (pkt, raw, t4) = reply_to(&f, 0.0, 0.05);
        assert!(!f.source.borrow_mut().process_reply(&pkt, &raw, t4, 0.0));
        assert_eq!(f.source.borrow().stats().borrow().n_samples(), 0);
        // The reply still counts for reachability.
        assert_eq!(f.source.borrow().reach() & 1, 1);
    }

    #[test]
    fn test_minstratum_floor_applied() {
        let opts = SourceOptions {
            minstratum: 5,
            ..SourceOptions::default()
        };
        let f = fixture_with(opts, None);
        f.source.borrow_mut().take_online();
        advance_and_fire(&f, 70.0);
        let (pkt, raw, t4) = reply_to(&f, 0.0, 0.02);
        assert!(f.source.borrow_mut().process_reply(&pkt, &raw, t4, 0.0));
        assert_eq!(f.source.borrow().stratum(), 5);
    }

    #[test]
    fn test_send_failure_with_auto_offline() {
        let opts = SourceOptions {
            auto_offline: true,
            ..SourceOptions::default()
        };
        let f = fixture_with(opts, None);
        f.source.borrow_mut().take_online();
        f.sender.borrow_mut().fail = true;
        advance_and_fire(&f, 70.0);
        assert_eq!(f.source.borrow().state(), State::Offline);
    }
}
