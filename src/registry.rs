//! Source registry.
//!
//! Fixed-size open-addressed table mapping remote addresses to their
//! state machines, hashed by an 8-bit xor-fold of the IP so behaviour is
//! identical across platforms. Removal re-inserts every surviving record
//! from a copy of the table, which keeps probe chains intact without
//! tombstones. One record per IP.
//!
//! Names that fail to resolve wait in a queue that is retried with
//! exponential backoff; a successful resolution turns into a normal
//! add-source, or updates the address of an existing source in place.

use crate::clock::LocalClock;
use crate::config::{SourceOptions, SourceType};
use crate::ntp_source::{NtpSource, PacketSender, State};
use crate::packet::NtpPacket;
use crate::scheduler::{Scheduler, TimerId};
use crate::sourcestats::SourceStats;
use log::{debug, info, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::rc::{Rc, Weak};
use thiserror::Error;

pub const TABLE_SIZE: usize = 256;
pub const MAX_SOURCES: usize = 64;

/// Base unit of the resolver backoff.
const RESOLVE_INTERVAL_UNIT: f64 = 7.0;
const MIN_RESOLVE_INTERVAL: u32 = 2;
const MAX_RESOLVE_INTERVAL: u32 = 9;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("source already in use")]
    AlreadyInUse,
    #[error("too many sources")]
    TooManySources,
    #[error("invalid address family")]
    InvalidAddressFamily,
    #[error("no such source")]
    NoSuchSource,
}

/// Slot lookup result: empty slot, IP matched with a different port, or
/// a full match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMatch {
    Empty,
    IpOnly,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveResult {
    Resolved(Vec<IpAddr>),
    TemporaryFailure,
    PermanentFailure,
}

#[cfg_attr(test, mockall::automock)]
pub trait NameResolver {
    fn resolve(&mut self, name: &str, port: u16) -> ResolveResult;
}

/// Blocking resolver over the system library. The standard library does
/// not expose the NXDOMAIN distinction, so every failure is treated as
/// temporary and retried with backoff.
pub struct StdResolver;

impl NameResolver for StdResolver {
    fn resolve(&mut self, name: &str, port: u16) -> ResolveResult {
        use std::net::ToSocketAddrs;
        match (name, port).to_socket_addrs() {
            Ok(addrs) => {
                let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                if ips.is_empty() {
                    ResolveResult::TemporaryFailure
                } else {
                    ResolveResult::Resolved(ips)
                }
            }
            Err(e) => {
                debug!("resolving {} failed: {}", name, e);
                ResolveResult::TemporaryFailure
            }
        }
    }
}

pub struct Unresolved {
    pub name: String,
    pub port: u16,
    pub source_type: SourceType,
    pub options: SourceOptions,
}

struct Record {
    source: Rc<RefCell<NtpSource>>,
}

pub struct SourceRegistry {
    slots: Vec<Option<Record>>,
    n_sources: usize,

    unresolved: Vec<Unresolved>,
    resolver: Box<dyn NameResolver>,
    resolve_interval: u32,
    resolve_timer: Option<TimerId>,

    sched: Scheduler,
    clock: Rc<RefCell<LocalClock>>,
    sender: Rc<RefCell<dyn PacketSender>>,
    keys: HashMap<u32, Vec<u8>>,
    max_samples: usize,
    min_samples: usize,
    ipv4_ok: bool,
    ipv6_ok: bool,

    self_ref: Weak<RefCell<SourceRegistry>>,
}

/// 8-bit xor-fold of an address; IPv6 is first folded into a 32-bit word.
fn hash_addr(ip: &IpAddr) -> usize {
    let b = match ip {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => {
            let o = a.octets();
            let mut word = [0u8; 4];
            for (i, byte) in o.iter().enumerate() {
                word[i % 4] ^= byte;
            }
            word.to_vec()
        }
    };
    b.iter().fold(0u8, |acc, &x| acc ^ x) as usize
}

impl SourceRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sched: Scheduler,
        clock: Rc<RefCell<LocalClock>>,
        sender: Rc<RefCell<dyn PacketSender>>,
        resolver: Box<dyn NameResolver>,
        keys: HashMap<u32, Vec<u8>>,
        max_samples: usize,
        min_samples: usize,
        ipv4_ok: bool,
        ipv6_ok: bool,
    ) -> Rc<RefCell<SourceRegistry>> {
        let registry = Rc::new(RefCell::new(SourceRegistry {
            slots: (0..TABLE_SIZE).map(|_| None).collect(),
            n_sources: 0,
            unresolved: Vec::new(),
            resolver,
            resolve_interval: MIN_RESOLVE_INTERVAL,
            resolve_timer: None,
            sched,
            clock,
            sender,
            keys,
            max_samples,
            min_samples,
            ipv4_ok,
            ipv6_ok,
            self_ref: Weak::new(),
        }));
        registry.borrow_mut().self_ref = Rc::downgrade(&registry);
        registry
    }

    pub fn n_sources(&self) -> usize {
        self.n_sources
    }

    fn family_ok(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(_) => self.ipv4_ok,
            IpAddr::V6(_) => self.ipv6_ok,
        }
    }

    /// Probe from the hash slot until the IP is found or an empty slot
    /// ends the chain.
    pub fn find_slot(&self, addr: &SocketAddr) -> (usize, SlotMatch) {
        let h = hash_addr(&addr.ip());
        for i in 0..TABLE_SIZE {
            let slot = (h + i) % TABLE_SIZE;
            match &self.slots[slot] {
                None => return (slot, SlotMatch::Empty),
                Some(rec) => {
                    let bound = rec.source.borrow().remote_addr();
                    if bound.ip() == addr.ip() {
                        if bound.port() == addr.port() {
                            return (slot, SlotMatch::Full);
                        }
                        return (slot, SlotMatch::IpOnly);
                    }
                }
            }
        }
        // Cannot happen while n_sources is capped well below TABLE_SIZE.
        panic!("source table full");
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn add_source(
        &mut self,
        addr: SocketAddr,
        source_type: SourceType,
        options: SourceOptions,
    ) -> Result<Rc<RefCell<NtpSource>>, SourceError> {
        if !self.family_ok(&addr.ip()) {
            return Err(SourceError::InvalidAddressFamily);
        }
        if self.n_sources >= MAX_SOURCES {
            return Err(SourceError::TooManySources);
        }
        let (slot, matched) = self.find_slot(&addr);
        if matched != SlotMatch::Empty {
            return Err(SourceError::AlreadyInUse);
        }

        let key = options.key.and_then(|id| match self.keys.get(&id) {
            Some(material) => Some((id, material.clone())),
            None => {
                warn!("{}: key {} not found, running unauthenticated", addr, id);
                None
            }
        });
        let online = !options.offline;
        let stats = Rc::new(RefCell::new(SourceStats::new(
            self.max_samples,
            self.min_samples,
        )));
        let source = NtpSource::new(
            addr,
            source_type,
            options,
            key,
            stats,
            self.sched.clone(),
            self.clock.clone(),
            self.sender.clone(),
        );
        self.slots[slot] = Some(Record {
            source: source.clone(),
        });
        self.n_sources += 1;
        if online {
            source.borrow_mut().take_online();
        }
        info!("added source {}", addr);
        Ok(source)
    }

    pub fn remove_source(&mut self, addr: SocketAddr) -> Result<(), SourceError> {
        let (slot, matched) = self.find_slot(&addr);
        if matched != SlotMatch::Full {
            return Err(SourceError::NoSuchSource);
        }
        if let Some(rec) = self.slots[slot].take() {
            rec.source.borrow_mut().take_offline();
            self.n_sources -= 1;
        }
        self.rehash();
        info!("removed source {}", addr);
        Ok(())
    }

    /// A re-resolution gave an existing source a new address: rebind the
    /// record without tearing down the state machine.
    pub fn replace_source_address(
        &mut self,
        old: SocketAddr,
        new: SocketAddr,
    ) -> Result<(), SourceError> {
        if !self.family_ok(&new.ip()) {
            return Err(SourceError::InvalidAddressFamily);
        }
        let (slot, matched) = self.find_slot(&old);
        if matched != SlotMatch::Full {
            return Err(SourceError::NoSuchSource);
        }
        let rec = match self.slots[slot].take() {
            Some(r) => r,
            None => return Err(SourceError::NoSuchSource),
        };
        self.rehash();
        let (new_slot, new_matched) = self.find_slot(&new);
        if new_matched != SlotMatch::Empty {
            // Put it back where it was.
            let (old_slot, _) = self.find_slot(&old);
            self.slots[old_slot] = Some(rec);
            return Err(SourceError::AlreadyInUse);
        }
        rec.source.borrow_mut().replace_address(new);
        self.slots[new_slot] = Some(rec);
        Ok(())
    }

    fn rehash(&mut self) {
        let old: Vec<Record> = self
            .slots
            .iter_mut()
            .filter_map(|s| s.take())
            .collect();
        for rec in old {
            let addr = rec.source.borrow().remote_addr();
            let (slot, matched) = self.find_slot(&addr);
            debug_assert_eq!(matched, SlotMatch::Empty);
            self.slots[slot] = Some(rec);
        }
    }

    pub fn lookup(&self, addr: &SocketAddr) -> Option<Rc<RefCell<NtpSource>>> {
        let (slot, matched) = self.find_slot(addr);
        if matched == SlotMatch::Full {
            self.slots[slot].as_ref().map(|r| r.source.clone())
        } else {
            None
        }
    }

    pub fn sources(&self) -> Vec<Rc<RefCell<NtpSource>>> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref().map(|r| r.source.clone()))
            .collect()
    }

    /// Route an incoming packet to the state machine bound to its source
    /// address. None = the sender is not a registered source; Some(true)
    /// = a sample was accumulated.
    pub fn dispatch(
        &mut self,
        from: SocketAddr,
        pkt: &NtpPacket,
        raw: &[u8],
        rx_cooked: crate::clock::Ns,
        rx_err: f64,
    ) -> Option<bool> {
        self.lookup(&from)
            .map(|source| source.borrow_mut().process_reply(pkt, raw, rx_cooked, rx_err))
    }

    // ------------------------------------------------------------------
    // Bulk mode changes
    // ------------------------------------------------------------------

    pub fn matches_mask(addr: &SocketAddr, mask: Option<(IpAddr, u8)>) -> bool {
        let (net, bits) = match mask {
            None => return true,
            Some(m) => m,
        };
        match (addr.ip(), net) {
            (IpAddr::V4(a), IpAddr::V4(n)) => {
                let bits = bits.min(32);
                let shift = 32 - bits as u32;
                let m = if bits == 0 { 0 } else { u32::MAX << shift };
                u32::from(a) & m == u32::from(n) & m
            }
            (IpAddr::V6(a), IpAddr::V6(n)) => {
                let bits = bits.min(128);
                let shift = 128 - bits as u32;
                let m = if bits == 0 { 0 } else { u128::MAX << shift };
                u128::from(a) & m == u128::from(n) & m
            }
            _ => false,
        }
    }

    pub fn set_online(&mut self, mask: Option<(IpAddr, u8)>) -> usize {
        let mut count = 0;
        for source in self.sources() {
            let addr = source.borrow().remote_addr();
            if Self::matches_mask(&addr, mask) {
                source.borrow_mut().take_online();
                count += 1;
            }
        }
        if mask.is_none() {
            for u in self.unresolved.iter_mut() {
                u.options.offline = false;
            }
        }
        count
    }

    /// Take matching sources offline. The current sync peer, if given,
    /// goes last so the reference does not flip needlessly mid-walk.
    pub fn set_offline(&mut self, mask: Option<(IpAddr, u8)>, sync_peer: Option<SocketAddr>) -> usize {
        let mut count = 0;
        let mut deferred = None;
        for source in self.sources() {
            let addr = source.borrow().remote_addr();
            if !Self::matches_mask(&addr, mask) {
                continue;
            }
            if Some(addr) == sync_peer {
                deferred = Some(source);
            } else {
                source.borrow_mut().take_offline();
            }
            count += 1;
        }
        if let Some(source) = deferred {
            source.borrow_mut().take_offline();
        }
        if mask.is_none() {
            for u in self.unresolved.iter_mut() {
                u.options.offline = true;
            }
        }
        count
    }

    /// Counts for the `activity` report: (online, offline, bursting back
    /// to online, bursting back to offline, unresolved).
    pub fn activity_counts(&self) -> (usize, usize, usize, usize, usize) {
        let mut online = 0;
        let mut offline = 0;
        let mut burst_on = 0;
        let mut burst_off = 0;
        for source in self.sources() {
            match source.borrow().state() {
                State::Offline => offline += 1,
                State::OnlineIdle | State::Transmitted => online += 1,
                State::BurstGood => burst_on += 1,
                State::BurstOffline => burst_off += 1,
            }
        }
        (online, offline, burst_on, burst_off, self.unresolved.len())
    }

    // ------------------------------------------------------------------
    // Unresolved sources
    // ------------------------------------------------------------------

    pub fn add_unresolved(
        &mut self,
        name: String,
        port: u16,
        source_type: SourceType,
        options: SourceOptions,
    ) {
        info!("queueing {} for resolution", name);
        self.unresolved.push(Unresolved {
            name,
            port,
            source_type,
            options,
        });
        self.resolve_interval = MIN_RESOLVE_INTERVAL;
        if self.resolve_timer.is_none() {
            self.schedule_resolve(0.1);
        }
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved.len()
    }

    fn schedule_resolve(&mut self, delay: f64) {
        let me = self.self_ref.clone();
        self.resolve_timer = Some(self.sched.add_timeout_rel(
            delay,
            Box::new(move || {
                if let Some(registry) = me.upgrade() {
                    let mut r = registry.borrow_mut();
                    r.resolve_timer = None;
                    r.do_resolve_pass();
                }
            }),
        ));
    }

    /// One pass over the queue; a single attempt per name. Names still
    /// unresolved afterwards get a backoff timer.
    fn do_resolve_pass(&mut self) {
        let queue = std::mem::take(&mut self.unresolved);
        for u in queue {
            match self.resolver.resolve(&u.name, u.port) {
                ResolveResult::Resolved(ips) => {
                    let usable = ips.into_iter().find(|ip| self.family_ok(ip));
                    match usable {
                        Some(ip) => {
                            let addr = SocketAddr::new(ip, u.port);
                            info!("resolved {} to {}", u.name, addr);
                            if let Err(e) = self.add_source(addr, u.source_type, u.options) {
                                warn!("dropping resolved source {}: {}", u.name, e);
                            }
                        }
                        None => {
                            warn!("{}: no address of a usable family, dropping", u.name);
                        }
                    }
                }
                ResolveResult::TemporaryFailure => {
                    debug!("resolution of {} failed, will retry", u.name);
                    self.unresolved.push(u);
                }
                ResolveResult::PermanentFailure => {
                    warn!("{} does not exist, dropping", u.name);
                }
            }
        }

        if !self.unresolved.is_empty() {
            let delay = RESOLVE_INTERVAL_UNIT * (self.resolve_interval as f64).exp2();
            self.resolve_interval = (self.resolve_interval + 1).min(MAX_RESOLVE_INTERVAL);
            self.schedule_resolve(delay);
        } else {
            self.resolve_interval = MIN_RESOLVE_INTERVAL;
        }
    }

    #[cfg(test)]
    pub fn next_resolve_delay(&self) -> Option<f64> {
        self.resolve_timer.map(|id| {
            crate::clock::ns_to_s(self.sched.timer_expiry(id).unwrap() - self.sched.raw_now())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{s_to_ns, ChangeHub, ClockOps, Ns, RawClock};
    use anyhow::Result;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cell::Cell;
    use std::net::Ipv4Addr;

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

    struct NullSender;
    impl PacketSender for NullSender {
        fn send(&mut self, _to: SocketAddr, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        raw: Rc<FakeRaw>,
        sched: Scheduler,
        registry: Rc<RefCell<SourceRegistry>>,
    }

    fn fixture_with_resolver(resolver: Box<dyn NameResolver>) -> Fixture {
        let raw = Rc::new(FakeRaw { now: Cell::new(0) });
        let sched = Scheduler::new(raw.clone());
        let hub = Rc::new(RefCell::new(ChangeHub::default()));
        let clock = Rc::new(RefCell::new(LocalClock::new(
            raw.clone(),
            Rc::new(RefCell::new(NullOps)),
            hub,
        )));
        let registry = SourceRegistry::new(
            sched.clone(),
            clock,
            Rc::new(RefCell::new(NullSender)),
            resolver,
            HashMap::new(),
            64,
            3,
            true,
            false,
        );
        Fixture {
            raw,
            sched,
            registry,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_resolver(Box::new(StdResolver))
    }

    fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port)
    }

    fn offline_opts() -> SourceOptions {
        SourceOptions {
            offline: true,
            ..SourceOptions::default()
        }
    }

    #[test]
    fn test_add_is_idempotent_and_removable() {
        let f = fixture();
        let addr = v4(10, 1, 2, 3, 123);
        let mut reg = f.registry.borrow_mut();
        reg.add_source(addr, SourceType::Server, offline_opts())
            .unwrap();
        assert!(matches!(
            reg.add_source(addr, SourceType::Server, offline_opts()),
            Err(SourceError::AlreadyInUse)
        ));
        // Same IP, different port: one record per IP.
        assert!(matches!(
            reg.add_source(v4(10, 1, 2, 3, 1123), SourceType::Server, offline_opts()),
            Err(SourceError::AlreadyInUse)
        ));

        reg.remove_source(addr).unwrap();
        assert!(matches!(
            reg.remove_source(addr),
            Err(SourceError::NoSuchSource)
        ));
        // Slot is reusable.
        reg.add_source(addr, SourceType::Server, offline_opts())
            .unwrap();
        assert_eq!(reg.n_sources(), 1);
    }

    #[test]
    fn test_family_check() {
        let f = fixture();
        let v6: SocketAddr = "[2001:db8::1]:123".parse().unwrap();
        assert!(matches!(
            f.registry
                .borrow_mut()
                .add_source(v6, SourceType::Server, offline_opts()),
            Err(SourceError::InvalidAddressFamily)
        ));
    }

    #[test]
    fn test_too_many_sources() {
        let f = fixture();
        let mut reg = f.registry.borrow_mut();
        for i in 0..MAX_SOURCES {
            let addr = v4(10, 2, (i / 256) as u8, (i % 256) as u8, 123);
            reg.add_source(addr, SourceType::Server, offline_opts())
                .unwrap();
        }
        assert!(matches!(
            reg.add_source(v4(10, 3, 0, 1, 123), SourceType::Server, offline_opts()),
            Err(SourceError::TooManySources)
        ));
    }

    #[test]
    fn test_colliding_addresses_probe_linearly() {
        let f = fixture();
        let mut reg = f.registry.borrow_mut();
        // 1^2^3^0 == 3^2^1^0: same hash slot.
        let a = v4(1, 2, 3, 0, 123);
        let b = v4(3, 2, 1, 0, 123);
        reg.add_source(a, SourceType::Server, offline_opts()).unwrap();
        reg.add_source(b, SourceType::Server, offline_opts()).unwrap();
        assert!(reg.lookup(&a).is_some());
        assert!(reg.lookup(&b).is_some());
        let (_, m) = reg.find_slot(&a);
        assert_eq!(m, SlotMatch::Full);
    }

    #[test]
    fn test_rehash_keeps_everything_findable() {
        let f = fixture();
        let mut reg = f.registry.borrow_mut();
        let mut rng = StdRng::seed_from_u64(42);
        let mut live: Vec<SocketAddr> = Vec::new();
        for _ in 0..400 {
            if live.len() < 48 && rng.gen_bool(0.6) {
                let addr = v4(10, 9, rng.gen(), rng.gen(), 123);
                if reg
                    .add_source(addr, SourceType::Server, offline_opts())
                    .is_ok()
                {
                    live.push(addr);
                }
            } else if let Some(i) = (!live.is_empty()).then(|| rng.gen_range(0..live.len())) {
                let addr = live.swap_remove(i);
                reg.remove_source(addr).unwrap();
            }
            for addr in &live {
                let (_, m) = reg.find_slot(addr);
                assert_eq!(m, SlotMatch::Full, "{} lost after rehash", addr);
            }
        }
    }

    #[test]
    fn test_ipv6_hash_and_lookup() {
        let f = fixture_with_resolver(Box::new(StdResolver));
        f.registry.borrow_mut().ipv6_ok = true;
        let addr: SocketAddr = "[2001:db8::42]:123".parse().unwrap();
        f.registry
            .borrow_mut()
            .add_source(addr, SourceType::Server, offline_opts())
            .unwrap();
        assert!(f.registry.borrow().lookup(&addr).is_some());
    }

    #[test]
    fn test_replace_address_keeps_state_machine() {
        let f = fixture();
        let old = v4(10, 4, 0, 1, 123);
        let new = v4(10, 4, 0, 2, 123);
        let source = f
            .registry
            .borrow_mut()
            .add_source(old, SourceType::Server, SourceOptions::default())
            .unwrap();
        assert!(source.borrow().is_online());

        f.registry
            .borrow_mut()
            .replace_source_address(old, new)
            .unwrap();
        let reg = f.registry.borrow();
        assert!(reg.lookup(&old).is_none());
        let rebound = reg.lookup(&new).unwrap();
        assert!(Rc::ptr_eq(&source, &rebound));
        // Still online: the state machine survived the rebind.
        assert!(rebound.borrow().is_online());
    }

    #[test]
    fn test_resolver_backoff_sequence() {
        let mut mock = MockNameResolver::new();
        mock.expect_resolve()
            .returning(|_, _| ResolveResult::TemporaryFailure);
        let f = fixture_with_resolver(Box::new(mock));

        f.registry.borrow_mut().add_unresolved(
            "ntp.example".into(),
            123,
            SourceType::Server,
            SourceOptions::default(),
        );

        // First attempt runs quickly, then 7*2^k for k = 2..9, capped.
        let mut delays = Vec::new();
        for _ in 0..10 {
            f.raw.now.set(f.raw.now.get() + s_to_ns(10_000.0));
            f.sched.dispatch_pending_timers();
            delays.push(f.registry.borrow().next_resolve_delay().unwrap());
        }
        let expected = [28.0, 56.0, 112.0, 224.0, 448.0, 896.0, 1792.0, 3584.0, 3584.0, 3584.0];
        for (d, e) in delays.iter().zip(expected.iter()) {
            assert!((d - e).abs() < 1e-6, "delays {:?}", delays);
        }
    }

    #[test]
    fn test_resolution_success_creates_online_source() {
        let mut mock = MockNameResolver::new();
        mock.expect_resolve().returning(|name, _| {
            assert_eq!(name, "ntp.example");
            ResolveResult::Resolved(vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5))])
        });
        let f = fixture_with_resolver(Box::new(mock));

        f.registry.borrow_mut().add_unresolved(
            "ntp.example".into(),
            123,
            SourceType::Server,
            SourceOptions::default(),
        );
        f.raw.now.set(s_to_ns(1.0));
        f.sched.dispatch_pending_timers();

        let reg = f.registry.borrow();
        assert_eq!(reg.unresolved_count(), 0);
        let addr = v4(203, 0, 113, 5, 123);
        let source = reg.lookup(&addr).unwrap();
        assert_eq!(source.borrow().state(), State::OnlineIdle);
        // Poll timer due within 2^minpoll seconds.
        let minpoll_bound = (SourceOptions::default().minpoll as f64).exp2();
        drop(reg);
        let fired = {
            // The first poll must come no later than the bound.
            f.raw.now.set(s_to_ns(1.0) + s_to_ns(minpoll_bound + 0.5));
            f.sched.dispatch_pending_timers();
            source.borrow().state() == State::Transmitted
        };
        assert!(fired);
    }

    #[test]
    fn test_nxdomain_drops_entry() {
        let mut mock = MockNameResolver::new();
        mock.expect_resolve()
            .returning(|_, _| ResolveResult::PermanentFailure);
        let f = fixture_with_resolver(Box::new(mock));
        f.registry.borrow_mut().add_unresolved(
            "no.such.host".into(),
            123,
            SourceType::Server,
            SourceOptions::default(),
        );
        f.raw.now.set(s_to_ns(1.0));
        f.sched.dispatch_pending_timers();
        assert_eq!(f.registry.borrow().unresolved_count(), 0);
        assert_eq!(f.registry.borrow().n_sources(), 0);
    }

    #[test]
    fn test_offline_flag_set_before_resolution_is_inherited() {
        let mut mock = MockNameResolver::new();
        mock.expect_resolve()
            .returning(|_, _| ResolveResult::Resolved(vec![IpAddr::V4(Ipv4Addr::new(10, 5, 0, 1))]));
        let f = fixture_with_resolver(Box::new(mock));
        f.registry.borrow_mut().add_unresolved(
            "ntp.example".into(),
            123,
            SourceType::Server,
            SourceOptions::default(),
        );
        // Toggled offline while still unresolved.
        f.registry.borrow_mut().set_offline(None, None);
        f.raw.now.set(s_to_ns(1.0));
        f.sched.dispatch_pending_timers();
        let source = f.registry.borrow().lookup(&v4(10, 5, 0, 1, 123)).unwrap();
        assert_eq!(source.borrow().state(), State::Offline);
    }

    #[test]
    fn test_bulk_offline_and_mask() {
        let f = fixture();
        let a = v4(10, 6, 0, 1, 123);
        let b = v4(192, 168, 1, 1, 123);
        {
            let mut reg = f.registry.borrow_mut();
            reg.add_source(a, SourceType::Server, SourceOptions::default())
                .unwrap();
            reg.add_source(b, SourceType::Server, SourceOptions::default())
                .unwrap();
        }
        // Mask hits only 10/8.
        let mask = Some(("10.0.0.0".parse().unwrap(), 8));
        f.registry.borrow_mut().set_offline(mask, None);
        let reg = f.registry.borrow();
        assert!(!reg.lookup(&a).unwrap().borrow().is_online());
        assert!(reg.lookup(&b).unwrap().borrow().is_online());
        drop(reg);
        f.registry.borrow_mut().set_online(None);
        assert!(f.registry.borrow().lookup(&a).unwrap().borrow().is_online());
    }
}
