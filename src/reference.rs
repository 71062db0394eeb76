//! Reference selection.
//!
//! After each accumulated sample the candidates are combined into a
//! single reference: every selectable source contributes the interval
//! [offset - root_distance, offset + root_distance], the classical
//! intersection algorithm finds the largest majority of overlapping
//! intervals (the truechimers), and the representative with the smallest
//! root distance drives the clock through the local-clock driver.

use crate::clock::{ns_to_s, LocalClock, Ns};
use crate::config::SelectOption;
use crate::packet;
use crate::registry::SourceRegistry;
use crate::scheduler::Scheduler;
use crate::sourcestats::SelectionData;
use log::{debug, info, warn};
use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr};
use std::rc::{Rc, Weak};

/// Reference id served while running on the local reference.
const LOCAL_REF_ID: u32 = 0x4C4F434C; // "LOCL"
/// Root distances closer than this are considered tied.
const DISTANCE_TIE: f64 = 1e-9;
/// Cadence of the staleness check.
const SYNC_CHECK_INTERVAL: f64 = 16.0;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub addr: SocketAddr,
    pub sel: SelectionData,
    pub select_option: SelectOption,
    /// Residual gain rate of the corrected clock against this source
    /// (s/s).
    pub frequency: f64,
    pub skew: f64,
    pub offset_sd: f64,
    pub leap: u8,
}

/// Published reference state, also the `tracking` report.
#[derive(Debug, Clone, Copy)]
pub struct TrackingData {
    pub synchronised: bool,
    pub stratum: u8,
    pub leap: u8,
    pub reference_id: u32,
    pub reference_time: Ns,
    pub root_delay: f64,
    pub root_dispersion: f64,
    pub last_offset: f64,
    pub frequency_ppm: f64,
    pub skew_ppm: f64,
}

impl Default for TrackingData {
    fn default() -> Self {
        TrackingData {
            synchronised: false,
            stratum: 0,
            leap: packet::LEAP_UNSYNC,
            reference_id: 0,
            reference_time: 0,
            root_delay: 0.0,
            root_dispersion: 1.0,
            last_offset: 0.0,
            frequency_ppm: 0.0,
            skew_ppm: 0.0,
        }
    }
}

/// What the server side puts into replies.
#[derive(Debug, Clone, Copy)]
pub struct ServerView {
    pub leap: u8,
    pub stratum: u8,
    pub reference_id: u32,
    pub reference_time: Ns,
    pub root_delay: f64,
    pub root_dispersion: f64,
}

pub struct Reference {
    clock: Rc<RefCell<LocalClock>>,
    sched: Scheduler,
    /// Updates above this skew (s/s) are discarded.
    max_update_skew: f64,
    local_stratum: Option<u8>,
    sync_grace: f64,

    state: TrackingData,
    sync_peer: Option<SocketAddr>,
    last_update_raw: Option<Ns>,
    /// Called with the published state after each applied update.
    update_hook: Option<Box<dyn FnMut(&TrackingData)>>,

    self_ref: Weak<RefCell<Reference>>,
}

fn reference_id_for(addr: &SocketAddr) -> u32 {
    match addr.ip() {
        IpAddr::V4(a) => u32::from(a),
        IpAddr::V6(a) => {
            let o = a.octets();
            u32::from_be_bytes([o[0], o[1], o[2], o[3]])
        }
    }
}

/// The classical interval-intersection: find the largest subset whose
/// intervals share a point with at most `n - k` falsetickers.
fn intersect<'a>(cands: &[&'a Candidate]) -> Vec<&'a Candidate> {
    let n = cands.len();
    if n == 0 {
        return Vec::new();
    }
    // Endpoint list: +1 opens an interval, -1 closes it. Lower endpoints
    // sort before equal upper endpoints so touching intervals intersect.
    let mut endpoints: Vec<(f64, i32)> = Vec::with_capacity(2 * n);
    for c in cands {
        endpoints.push((c.sel.offset - c.sel.root_distance, 1));
        endpoints.push((c.sel.offset + c.sel.root_distance, -1));
    }
    endpoints.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap().then(b.1.cmp(&a.1)));

    let mut falsetickers = 0;
    while falsetickers < (n + 1) / 2 {
        let wanted = (n - falsetickers) as i32;

        let mut count = 0;
        let mut low = None;
        for &(v, t) in endpoints.iter() {
            count += t;
            if count >= wanted {
                low = Some(v);
                break;
            }
        }
        let mut count = 0;
        let mut high = None;
        for &(v, t) in endpoints.iter().rev() {
            count -= t;
            if count >= wanted {
                high = Some(v);
                break;
            }
        }

        if let (Some(lo), Some(hi)) = (low, high) {
            if lo <= hi {
                return cands
                    .iter()
                    .filter(|c| {
                        c.sel.offset - c.sel.root_distance <= hi
                            && c.sel.offset + c.sel.root_distance >= lo
                    })
                    .copied()
                    .collect();
            }
        }
        falsetickers += 1;
    }
    Vec::new()
}

impl Reference {
    pub fn new(
        clock: Rc<RefCell<LocalClock>>,
        sched: Scheduler,
        max_update_skew_ppm: f64,
        local_stratum: Option<u8>,
        sync_grace: f64,
    ) -> Rc<RefCell<Reference>> {
        let reference = Rc::new(RefCell::new(Reference {
            clock,
            sched,
            max_update_skew: max_update_skew_ppm * 1e-6,
            local_stratum,
            sync_grace,
            state: TrackingData::default(),
            sync_peer: None,
            last_update_raw: None,
            update_hook: None,
            self_ref: Weak::new(),
        }));
        {
            let mut r = reference.borrow_mut();
            r.self_ref = Rc::downgrade(&reference);
            r.schedule_sync_check();
        }
        reference
    }

    pub fn set_update_hook(&mut self, hook: Box<dyn FnMut(&TrackingData)>) {
        self.update_hook = Some(hook);
    }

    pub fn tracking(&self) -> TrackingData {
        self.state
    }

    pub fn sync_peer(&self) -> Option<SocketAddr> {
        self.sync_peer
    }

    pub fn is_synchronised(&self) -> bool {
        self.state.synchronised
    }

    /// Reference data for server replies. Falls back to the local
    /// reference when one is configured.
    pub fn server_view(&self) -> ServerView {
        if self.state.synchronised {
            ServerView {
                leap: self.state.leap,
                stratum: self.state.stratum,
                reference_id: self.state.reference_id,
                reference_time: self.state.reference_time,
                root_delay: self.state.root_delay,
                root_dispersion: self.state.root_dispersion,
            }
        } else if let Some(stratum) = self.local_stratum {
            let (cooked, _) = self.clock.borrow().cooked_now();
            ServerView {
                leap: packet::LEAP_NORMAL,
                stratum,
                reference_id: LOCAL_REF_ID,
                reference_time: cooked,
                root_delay: 0.0,
                root_dispersion: 0.0,
            }
        } else {
            ServerView {
                leap: packet::LEAP_UNSYNC,
                stratum: 16,
                reference_id: 0,
                reference_time: 0,
                root_delay: 0.0,
                root_dispersion: 1.0,
            }
        }
    }

    /// Gather candidates from every selectable source and run one
    /// selection round.
    pub fn update_from_registry(&mut self, registry: &SourceRegistry) {
        let (now_cooked, _) = self.clock.borrow().cooked_now();
        let mut candidates = Vec::new();
        for source in registry.sources() {
            let s = source.borrow();
            if !s.is_selectable() {
                continue;
            }
            let stats = s.stats();
            let mut stats = stats.borrow_mut();
            if let Some(sel) = stats.selection_data(now_cooked) {
                candidates.push(Candidate {
                    addr: s.remote_addr(),
                    sel,
                    select_option: s.select_option(),
                    frequency: stats.frequency(),
                    skew: stats.skew(),
                    offset_sd: stats.offset_sd(),
                    leap: s.leap(),
                });
            }
        }
        self.update(&candidates);
    }

    /// One selection round over prepared candidates.
    pub fn update(&mut self, candidates: &[Candidate]) {
        let eligible: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.select_option != SelectOption::Noselect)
            .collect();

        let truechimers = intersect(&eligible);
        if truechimers.is_empty() {
            debug!("selection failed: no truechimers among {}", eligible.len());
            self.consider_unsynchronised();
            return;
        }

        let best = truechimers
            .iter()
            .copied()
            .min_by(|a, b| Self::representative_order(a, b))
            .map(|c| c.clone());
        let best = match best {
            Some(b) => b,
            None => return,
        };

        if best.skew > self.max_update_skew {
            warn!(
                "{}: update skew {:.3} ppm above limit, discarding",
                best.addr,
                best.skew * 1e6
            );
            self.consider_unsynchronised();
            return;
        }

        // The source statistics track the residual gain of the already
        // corrected clock; fold it into the current absolute estimate.
        let freq_abs = self.clock.borrow().frequency_ppm() * 1e-6 + best.frequency;
        let correction_rate = best.offset_sd;
        {
            let mut clock = self.clock.borrow_mut();
            if let Err(e) =
                clock.accumulate_frequency_and_offset(freq_abs, best.sel.offset, correction_rate)
            {
                // The daemon cannot continue with an uncontrollable clock.
                log::error!("clock update failed: {}", e);
                panic!("local clock driver failure");
            }
        }

        let was_synchronised = self.state.synchronised;
        let (now_cooked, _) = self.clock.borrow().cooked_now();
        let now_raw = self.clock.borrow().raw_now();
        self.state = TrackingData {
            synchronised: true,
            stratum: best.sel.stratum.saturating_add(1),
            leap: best.leap,
            reference_id: reference_id_for(&best.addr),
            reference_time: now_cooked,
            root_delay: best.sel.root_delay,
            root_dispersion: best.sel.root_dispersion + best.sel.offset.abs(),
            last_offset: best.sel.offset,
            frequency_ppm: self.clock.borrow().frequency_ppm(),
            skew_ppm: best.skew * 1e6,
        };
        self.sync_peer = Some(best.addr);
        self.last_update_raw = Some(now_raw);

        {
            let mut clock = self.clock.borrow_mut();
            clock.set_sync_status(
                true,
                best.offset_sd,
                best.sel.root_distance + best.sel.offset.abs(),
            );
            let leap_sign = match best.leap {
                packet::LEAP_INSERT => 1,
                packet::LEAP_DELETE => -1,
                _ => 0,
            };
            if let Err(e) = clock.set_leap(leap_sign) {
                warn!("failed to arm leap status: {}", e);
            }
        }

        if !was_synchronised {
            info!(
                "selected {} as reference (stratum {})",
                best.addr, self.state.stratum
            );
        }
        if let Some(hook) = self.update_hook.as_mut() {
            hook(&self.state);
        }
    }

    /// Smaller is better: root distance, then Prefer, stratum, delay.
    fn representative_order(a: &Candidate, b: &Candidate) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        let da = a.sel.root_distance;
        let db = b.sel.root_distance;
        if (da - db).abs() > DISTANCE_TIE {
            return da.partial_cmp(&db).unwrap_or(Ordering::Equal);
        }
        let pa = a.select_option == SelectOption::Prefer;
        let pb = b.select_option == SelectOption::Prefer;
        pb.cmp(&pa)
            .then(a.sel.stratum.cmp(&b.sel.stratum))
            .then(
                a.sel
                    .peer_delay
                    .partial_cmp(&b.sel.peer_delay)
                    .unwrap_or(Ordering::Equal),
            )
    }

    fn consider_unsynchronised(&mut self) {
        if !self.state.synchronised {
            return;
        }
        let now_raw = self.clock.borrow().raw_now();
        let stale = match self.last_update_raw {
            Some(last) => ns_to_s(now_raw - last) > self.sync_grace,
            None => true,
        };
        if stale {
            warn!("reference lost, daemon now unsynchronised");
            self.state.synchronised = false;
            self.state.leap = packet::LEAP_UNSYNC;
            self.sync_peer = None;
            self.clock.borrow_mut().set_sync_status(false, 0.0, 0.0);
        }
    }

    fn schedule_sync_check(&mut self) {
        let me = self.self_ref.clone();
        self.sched.add_timeout_rel(
            SYNC_CHECK_INTERVAL,
            Box::new(move || {
                if let Some(reference) = me.upgrade() {
                    let mut r = reference.borrow_mut();
                    r.consider_unsynchronised();
                    r.schedule_sync_check();
                }
            }),
        );
    }
}
