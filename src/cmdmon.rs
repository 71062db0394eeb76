//! Local command channel.
//!
//! Verbs arrive as text lines (the wire framing belongs to the control
//! client); each produces a reply with a status mirroring the client's
//! exit codes: 0 success, 1 fatal, 2 non-fatal error. Mutating verbs are
//! privileged and require the `password` verb first when a password is
//! configured.

use crate::clock::{ns_to_s, LocalClock};
use crate::config::{SourceOptions, SourceType};
use crate::ntp_source::State;
use crate::persist::Logs;
use crate::reference::Reference;
use crate::registry::{SourceError, SourceRegistry};
use log::info;
use std::cell::RefCell;
use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdStatus {
    Success = 0,
    Fatal = 1,
    NonFatal = 2,
}

#[derive(Debug)]
pub struct Reply {
    pub status: CmdStatus,
    pub text: String,
}

impl Reply {
    fn ok(text: impl Into<String>) -> Reply {
        Reply {
            status: CmdStatus::Success,
            text: text.into(),
        }
    }

    fn non_fatal(text: impl Into<String>) -> Reply {
        Reply {
            status: CmdStatus::NonFatal,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    AddSource {
        source_type: SourceType,
        name: String,
        port: u16,
        options: SourceOptions,
    },
    Delete {
        addr: SocketAddr,
    },
    Online {
        mask: Option<(IpAddr, u8)>,
    },
    Offline {
        mask: Option<(IpAddr, u8)>,
    },
    Burst {
        good: u32,
        total: u32,
        mask: Option<(IpAddr, u8)>,
    },
    MinPoll {
        addr: SocketAddr,
        value: i8,
    },
    MaxPoll {
        addr: SocketAddr,
        value: i8,
    },
    MaxDelay {
        addr: SocketAddr,
        value: f64,
    },
    MaxDelayRatio {
        addr: SocketAddr,
        value: f64,
    },
    MaxDelayDevRatio {
        addr: SocketAddr,
        value: f64,
    },
    MinStratum {
        addr: SocketAddr,
        value: u8,
    },
    PollTarget {
        addr: SocketAddr,
        value: u32,
    },
    CycleLogs,
    Activity,
    Sources,
    SourceStats,
    Tracking,
    Password {
        password: String,
    },
}

fn parse_addr(tok: &str) -> Result<SocketAddr, String> {
    if let Ok(sa) = tok.parse::<SocketAddr>() {
        return Ok(sa);
    }
    tok.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 123))
        .map_err(|_| format!("bad address: {}", tok))
}

fn parse_mask(tok: &str) -> Result<(IpAddr, u8), String> {
    match tok.split_once('/') {
        Some((ip, bits)) => {
            let ip: IpAddr = ip.parse().map_err(|_| format!("bad address: {}", ip))?;
            let bits: u8 = bits.parse().map_err(|_| format!("bad prefix: {}", bits))?;
            Ok((ip, bits))
        }
        None => {
            let ip: IpAddr = tok.parse().map_err(|_| format!("bad address: {}", tok))?;
            let bits = if ip.is_ipv4() { 32 } else { 128 };
            Ok((ip, bits))
        }
    }
}

fn parse_source_options(tokens: &[&str]) -> Result<(u16, SourceOptions), String> {
    let mut port = 123;
    let mut opts = SourceOptions::default();
    let mut it = tokens.iter();
    while let Some(&word) = it.next() {
        let mut value = |what: &str| {
            it.next()
                .copied()
                .ok_or_else(|| format!("{} needs a value", what))
        };
        match word {
            "port" => port = value("port")?.parse().map_err(|_| "bad port".to_string())?,
            "minpoll" => {
                opts.minpoll = value("minpoll")?
                    .parse()
                    .map_err(|_| "bad minpoll".to_string())?
            }
            "maxpoll" => {
                opts.maxpoll = value("maxpoll")?
                    .parse()
                    .map_err(|_| "bad maxpoll".to_string())?
            }
            "presend" => {
                opts.presend = Some(
                    value("presend")?
                        .parse()
                        .map_err(|_| "bad presend".to_string())?,
                )
            }
            "maxdelay" => {
                opts.maxdelay = value("maxdelay")?
                    .parse()
                    .map_err(|_| "bad maxdelay".to_string())?
            }
            "maxdelayratio" => {
                opts.maxdelayratio = value("maxdelayratio")?
                    .parse()
                    .map_err(|_| "bad maxdelayratio".to_string())?
            }
            "maxdelaydevratio" => {
                opts.maxdelaydevratio = value("maxdelaydevratio")?
                    .parse()
                    .map_err(|_| "bad maxdelaydevratio".to_string())?
            }
            "key" => {
                opts.key = Some(value("key")?.parse().map_err(|_| "bad key id".to_string())?)
            }
            "minstratum" => {
                opts.minstratum = value("minstratum")?
                    .parse()
                    .map_err(|_| "bad minstratum".to_string())?
            }
            "polltarget" => {
                opts.polltarget = value("polltarget")?
                    .parse()
                    .map_err(|_| "bad polltarget".to_string())?
            }
            "offline" => opts.offline = true,
            "auto_offline" => opts.auto_offline = true,
            "iburst" => opts.iburst = true,
            "noselect" => opts.noselect = true,
            "prefer" => opts.prefer = true,
            other => return Err(format!("unknown option: {}", other)),
        }
    }
    Ok((port, opts))
}

pub fn parse_line(line: &str) -> Result<Command, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let (&verb, rest) = tokens
        .split_first()
        .ok_or_else(|| "empty command".to_string())?;

    let one = |rest: &[&str]| -> Result<String, String> {
        match rest {
            [x] => Ok((*x).to_string()),
            _ => Err(format!("{} takes one argument", verb)),
        }
    };
    let addr_value = |rest: &[&str]| -> Result<(SocketAddr, String), String> {
        match rest {
            [a, v] => Ok((parse_addr(a)?, (*v).to_string())),
            _ => Err(format!("{} takes <address> <value>", verb)),
        }
    };

    match verb {
        "add" => {
            let (&kind, rest) = rest
                .split_first()
                .ok_or_else(|| "add server|peer <name> [options]".to_string())?;
            let source_type = match kind {
                "server" => SourceType::Server,
                "peer" => SourceType::Peer,
                _ => return Err("add server|peer <name> [options]".to_string()),
            };
            let (&name, rest) = rest
                .split_first()
                .ok_or_else(|| "missing source name".to_string())?;
            let (port, options) = parse_source_options(rest)?;
            Ok(Command::AddSource {
                source_type,
                name: name.to_string(),
                port,
                options,
            })
        }
        "delete" => Ok(Command::Delete {
            addr: parse_addr(&one(rest)?)?,
        }),
        "online" | "offline" => {
            let mask = match rest {
                [] => None,
                [m] => Some(parse_mask(m)?),
                _ => return Err(format!("{} [addr/mask]", verb)),
            };
            if verb == "online" {
                Ok(Command::Online { mask })
            } else {
                Ok(Command::Offline { mask })
            }
        }
        "burst" => {
            let (&spec, rest) = rest
                .split_first()
                .ok_or_else(|| "burst N/M [addr/mask]".to_string())?;
            let (good, total) = spec
                .split_once('/')
                .ok_or_else(|| "burst N/M [addr/mask]".to_string())?;
            let good: u32 = good.parse().map_err(|_| "bad burst count".to_string())?;
            let total: u32 = total.parse().map_err(|_| "bad burst count".to_string())?;
            let mask = match rest {
                [] => None,
                [m] => Some(parse_mask(m)?),
                _ => return Err("burst N/M [addr/mask]".to_string()),
            };
            Ok(Command::Burst { good, total, mask })
        }
        "minpoll" => {
            let (addr, v) = addr_value(rest)?;
            Ok(Command::MinPoll {
                addr,
                value: v.parse().map_err(|_| "bad minpoll".to_string())?,
            })
        }
        "maxpoll" => {
            let (addr, v) = addr_value(rest)?;
            Ok(Command::MaxPoll {
                addr,
                value: v.parse().map_err(|_| "bad maxpoll".to_string())?,
            })
        }
        "maxdelay" => {
            let (addr, v) = addr_value(rest)?;
            Ok(Command::MaxDelay {
                addr,
                value: v.parse().map_err(|_| "bad maxdelay".to_string())?,
            })
        }
        "maxdelayratio" => {
            let (addr, v) = addr_value(rest)?;
            Ok(Command::MaxDelayRatio {
                addr,
                value: v.parse().map_err(|_| "bad ratio".to_string())?,
            })
        }
        "maxdelaydevratio" => {
            let (addr, v) = addr_value(rest)?;
            Ok(Command::MaxDelayDevRatio {
                addr,
                value: v.parse().map_err(|_| "bad ratio".to_string())?,
            })
        }
        "minstratum" => {
            let (addr, v) = addr_value(rest)?;
            Ok(Command::MinStratum {
                addr,
                value: v.parse().map_err(|_| "bad stratum".to_string())?,
            })
        }
        "polltarget" => {
            let (addr, v) = addr_value(rest)?;
            Ok(Command::PollTarget {
                addr,
                value: v.parse().map_err(|_| "bad polltarget".to_string())?,
            })
        }
        "cyclelogs" => Ok(Command::CycleLogs),
        "activity" => Ok(Command::Activity),
        "sources" => Ok(Command::Sources),
        "sourcestats" => Ok(Command::SourceStats),
        "tracking" => Ok(Command::Tracking),
        "password" => Ok(Command::Password {
            password: one(rest)?,
        }),
        other => Err(format!("unknown command: {}", other)),
    }
}

pub struct CmdDispatcher {
    registry: Rc<RefCell<SourceRegistry>>,
    reference: Rc<RefCell<Reference>>,
    clock: Rc<RefCell<LocalClock>>,
    logs: Option<Rc<RefCell<Logs>>>,
    password: Option<String>,
    authorized: bool,
}

impl CmdDispatcher {
    pub fn new(
        registry: Rc<RefCell<SourceRegistry>>,
        reference: Rc<RefCell<Reference>>,
        clock: Rc<RefCell<LocalClock>>,
        logs: Option<Rc<RefCell<Logs>>>,
        password: Option<String>,
    ) -> CmdDispatcher {
        let authorized = password.is_none();
        CmdDispatcher {
            registry,
            reference,
            clock,
            logs,
            password,
            authorized,
        }
    }

    pub fn execute_line(&mut self, line: &str) -> Reply {
        match parse_line(line) {
            Ok(cmd) => self.execute(cmd),
            Err(e) => Reply::non_fatal(e),
        }
    }

    pub fn execute(&mut self, cmd: Command) -> Reply {
        if Self::is_privileged(&cmd) && !self.authorized {
            return Reply::non_fatal("authorization required");
        }
        match cmd {
            Command::Password { password } => {
                if self.password.as_deref() == Some(password.as_str()) {
                    self.authorized = true;
                    Reply::ok("authorized")
                } else {
                    Reply::non_fatal("wrong password")
                }
            }
            Command::AddSource {
                source_type,
                name,
                port,
                options,
            } => match name.parse::<IpAddr>() {
                Ok(ip) => {
                    let addr = SocketAddr::new(ip, port);
                    match self
                        .registry
                        .borrow_mut()
                        .add_source(addr, source_type, options)
                    {
                        Ok(_) => Reply::ok(format!("added {}", addr)),
                        Err(e) => self.source_error(e),
                    }
                }
                Err(_) => {
                    self.registry
                        .borrow_mut()
                        .add_unresolved(name.clone(), port, source_type, options);
                    Reply::ok(format!("resolving {}", name))
                }
            },
            Command::Delete { addr } => match self.registry.borrow_mut().remove_source(addr) {
                Ok(()) => Reply::ok(format!("deleted {}", addr)),
                Err(e) => self.source_error(e),
            },
            Command::Online { mask } => {
                let n = self.registry.borrow_mut().set_online(mask);
                Reply::ok(format!("{} sources online", n))
            }
            Command::Offline { mask } => {
                let sync_peer = self.reference.borrow().sync_peer();
                let n = self.registry.borrow_mut().set_offline(mask, sync_peer);
                Reply::ok(format!("{} sources offline", n))
            }
            Command::Burst { good, total, mask } => {
                let mut n = 0;
                for source in self.registry.borrow().sources() {
                    let addr = source.borrow().remote_addr();
                    if SourceRegistry::matches_mask(&addr, mask) {
                        source.borrow_mut().start_burst(good, total);
                        n += 1;
                    }
                }
                Reply::ok(format!("bursting {} sources", n))
            }
            Command::MinPoll { addr, value } => {
                self.with_source(addr, |s| s.set_minpoll(value))
            }
            Command::MaxPoll { addr, value } => {
                self.with_source(addr, |s| s.set_maxpoll(value))
            }
            Command::MaxDelay { addr, value } => {
                self.with_source(addr, |s| s.set_maxdelay(value))
            }
            Command::MaxDelayRatio { addr, value } => {
                self.with_source(addr, |s| s.set_maxdelayratio(value))
            }
            Command::MaxDelayDevRatio { addr, value } => {
                self.with_source(addr, |s| s.set_maxdelaydevratio(value))
            }
            Command::MinStratum { addr, value } => {
                self.with_source(addr, |s| s.set_minstratum(value))
            }
            Command::PollTarget { addr, value } => {
                self.with_source(addr, |s| s.set_polltarget(value))
            }
            Command::CycleLogs => {
                if let Some(logs) = &self.logs {
                    logs.borrow_mut().cycle();
                }
                info!("logs cycled");
                Reply::ok("logs cycled")
            }
            Command::Activity => {
                let (online, offline, burst_on, burst_off, unresolved) =
                    self.registry.borrow().activity_counts();
                Reply::ok(format!(
                    "{} sources online\n{} sources offline\n{} sources doing burst (return to online)\n{} sources doing burst (return to offline)\n{} sources with unknown address",
                    online, offline, burst_on, burst_off, unresolved
                ))
            }
            Command::Sources => Reply::ok(self.sources_report()),
            Command::SourceStats => Reply::ok(self.sourcestats_report()),
            Command::Tracking => Reply::ok(self.tracking_report()),
        }
    }

    fn is_privileged(cmd: &Command) -> bool {
        !matches!(
            cmd,
            Command::Activity
                | Command::Sources
                | Command::SourceStats
                | Command::Tracking
                | Command::Password { .. }
        )
    }

    fn source_error(&self, e: SourceError) -> Reply {
        Reply::non_fatal(e.to_string())
    }

    fn with_source(&mut self, addr: SocketAddr, f: impl FnOnce(&mut crate::ntp_source::NtpSource)) -> Reply {
        match self.registry.borrow().lookup(&addr) {
            Some(source) => {
                f(&mut source.borrow_mut());
                Reply::ok("OK")
            }
            None => self.source_error(SourceError::NoSuchSource),
        }
    }

    fn sources_report(&self) -> String {
        let sync_peer = self.reference.borrow().sync_peer();
        let mut out = String::from("MS Name/IP address     Stratum Poll Reach\n");
        for source in self.registry.borrow().sources() {
            let s = source.borrow();
            let mode = match s.source_type() {
                SourceType::Server => '^',
                SourceType::Peer => '=',
            };
            let state = if Some(s.remote_addr()) == sync_peer {
                '*'
            } else {
                match s.state() {
                    State::Offline => '?',
                    _ => '+',
                }
            };
            let _ = writeln!(
                out,
                "{}{} {:20} {:7} {:4} {:03o}",
                mode,
                state,
                s.remote_addr().ip(),
                s.stratum(),
                s.local_poll(),
                s.reach()
            );
        }
        out
    }

    fn sourcestats_report(&self) -> String {
        let (now, _) = self.clock.borrow().cooked_now();
        let mut out =
            String::from("Name/IP address      NP NR Span Frequency FreqSkew Offset StdDev\n");
        for source in self.registry.borrow().sources() {
            let s = source.borrow();
            let stats = s.stats();
            let stats = stats.borrow();
            let span = stats
                .sample_ages(now)
                .map(|(first, last)| first - last)
                .unwrap_or(0.0);
            let _ = writeln!(
                out,
                "{:20} {:2} {:2} {:5.0} {:9.3} {:8.3} {:9.6} {:8.6}",
                s.remote_addr().ip(),
                stats.n_samples(),
                stats.n_runs(),
                span,
                stats.frequency() * 1e6,
                stats.skew() * 1e6,
                stats.estimated_offset(),
                stats.std_dev()
            );
        }
        out
    }

    fn tracking_report(&self) -> String {
        let t = self.reference.borrow().tracking();
        let mut out = String::new();
        let _ = writeln!(out, "Reference ID    : {:08X}", t.reference_id);
        let _ = writeln!(out, "Stratum         : {}", t.stratum);
        let _ = writeln!(
            out,
            "Ref time (unix) : {:.6}",
            ns_to_s(t.reference_time)
        );
        let _ = writeln!(out, "Last offset     : {:+.9}", t.last_offset);
        let _ = writeln!(out, "Frequency       : {:.3} ppm", t.frequency_ppm);
        let _ = writeln!(out, "Skew            : {:.3} ppm", t.skew_ppm);
        let _ = writeln!(out, "Root delay      : {:.9}", t.root_delay);
        let _ = writeln!(out, "Root dispersion : {:.9}", t.root_dispersion);
        let _ = writeln!(
            out,
            "Leap status     : {}",
            match (t.synchronised, t.leap) {
                (false, _) => "Not synchronised",
                (_, crate::packet::LEAP_INSERT) => "Insert second",
                (_, crate::packet::LEAP_DELETE) => "Delete second",
                _ => "Normal",
            }
        );
        out
    }
}
