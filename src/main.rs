use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::path::PathBuf;
use std::rc::Rc;

use ntpsync::clock::{ChangeHub, ClockOps, LocalClock, RawClock, SystemRawClock};
use ntpsync::cmdmon::CmdDispatcher;
use ntpsync::config::Config;
use ntpsync::ntp_io::NtpIo;
use ntpsync::ntp_source::PacketSender;
use ntpsync::persist::{self, Logs};
use ntpsync::reference::Reference;
use ntpsync::registry::{SourceRegistry, StdResolver};
use ntpsync::scheduler::Scheduler;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file.
    #[arg(short, long, default_value = "/etc/ntpsync/config.json")]
    config: PathBuf,

    /// Log filter (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[cfg(target_os = "linux")]
fn build_clock_backend(
    raw: Rc<dyn RawClock>,
    sched: Scheduler,
    hub: Rc<RefCell<ChangeHub>>,
    hz: i64,
    freq_scale: f64,
) -> Result<(Rc<RefCell<dyn ClockOps>>, Box<dyn FnOnce()>)> {
    use ntpsync::clock::timex::{LinuxTimex, TimexDriver};
    let kernel = LinuxTimex::new(freq_scale)?;
    let driver = TimexDriver::new(raw, sched, hub, kernel, hz)?;
    let ops: Rc<RefCell<dyn ClockOps>> = driver.clone();
    let finaliser = {
        let driver = driver.clone();
        Box::new(move || driver.borrow_mut().finalise()) as Box<dyn FnOnce()>
    };
    Ok((ops, finaliser))
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
fn build_clock_backend(
    raw: Rc<dyn RawClock>,
    sched: Scheduler,
    hub: Rc<RefCell<ChangeHub>>,
    _hz: i64,
    _freq_scale: f64,
) -> Result<(Rc<RefCell<dyn ClockOps>>, Box<dyn FnOnce()>)> {
    use ntpsync::clock::adjtime::{AdjtimeDriver, BsdAdjtime};
    let driver = AdjtimeDriver::new(raw, sched, hub, BsdAdjtime);
    let ops: Rc<RefCell<dyn ClockOps>> = driver.clone();
    let finaliser = {
        let driver = driver.clone();
        Box::new(move || driver.borrow_mut().finalise()) as Box<dyn FnOnce()>
    };
    Ok((ops, finaliser))
}

fn load_config(path: &PathBuf) -> Config {
    match Config::load(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(
                "cannot read config {} ({}), using defaults",
                path.display(),
                e
            );
            Config::default()
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = load_config(&args.config);

    // Core plumbing: raw clock, scheduler, driver, cooked mapping.
    let raw: Rc<dyn RawClock> = Rc::new(SystemRawClock);
    let sched = Scheduler::new(raw.clone());
    let hub = Rc::new(RefCell::new(ChangeHub::default()));
    let hz = config.linux_hz.unwrap_or(100);
    let freq_scale = config.linux_freq_scale.unwrap_or(65536.0);
    let (ops, finalise_driver) =
        build_clock_backend(raw.clone(), sched.clone(), hub.clone(), hz, freq_scale)?;
    let clock = Rc::new(RefCell::new(LocalClock::new(raw.clone(), ops, hub.clone())));
    {
        let clock = clock.clone();
        sched.set_time_mapper(Box::new(move |raw_ns| clock.borrow().cooked_from_raw(raw_ns)));
    }

    if let Some(path) = &config.drift_file {
        match persist::load_drift(path) {
            Ok((freq_ppm, skew_ppm)) => {
                info!("drift file: {:.3} ppm (skew {:.3} ppm)", freq_ppm, skew_ppm);
                clock.borrow_mut().seed_frequency_ppm(freq_ppm)?;
            }
            Err(e) => warn!("no usable drift file: {}", e),
        }
    }

    // Packet I/O.
    if config.bind_address6.is_some() {
        warn!("bind_address6 configured but this build serves IPv4 only");
    }
    let bind = IpAddr::V4(config.bind_address4);
    let io = NtpIo::new(sched.clone(), clock.clone(), bind, config.ntp_port)?;

    // Registry, reference, logs.
    let mut keys: HashMap<u32, Vec<u8>> = HashMap::new();
    for id in config.keys.keys() {
        match config.key_material(*id) {
            Some(material) => {
                keys.insert(*id, material);
            }
            None => warn!("key {} is not valid hex, ignored", id),
        }
    }
    let sender: Rc<RefCell<dyn PacketSender>> = io.clone();
    let registry = SourceRegistry::new(
        sched.clone(),
        clock.clone(),
        sender,
        Box::new(StdResolver),
        keys,
        config.max_samples,
        config.min_samples,
        true,
        false,
    );
    let reference = Reference::new(
        clock.clone(),
        sched.clone(),
        config.max_update_skew_ppm,
        config.local_stratum,
        config.sync_grace,
    );
    let logs = if config.log_dir.is_some()
        && (config.log_statistics || config.log_measurements || config.log_tracking)
    {
        Some(Rc::new(RefCell::new(Logs::new(
            config.log_dir.as_deref(),
            config.log_statistics,
            config.log_measurements,
            config.log_tracking,
        ))))
    } else {
        None
    };
    io.borrow_mut()
        .connect(registry.clone(), reference.clone(), logs.clone());
    io.borrow_mut().start()?;

    // Clock-change fan-out: sample histories follow every slew and step,
    // the timer queue follows steps, dispersion spreads to all samples.
    {
        let reg = Rc::downgrade(&registry);
        let sched2 = sched.clone();
        hub.borrow_mut().register_param_handler(Box::new(move |change| {
            if let Some(reg) = reg.upgrade() {
                for source in reg.borrow().sources() {
                    let stats = source.borrow().stats();
                    stats
                        .borrow_mut()
                        .slew_samples(change.when_cooked, change.dfreq, change.doffset);
                }
            }
            if change.is_step {
                sched2.handle_step(change.doffset);
            }
        }));
        let reg = Rc::downgrade(&registry);
        hub.borrow_mut().register_dispersion_handler(Box::new(move |disp| {
            if let Some(reg) = reg.upgrade() {
                for source in reg.borrow().sources() {
                    source.borrow().stats().borrow_mut().add_dispersion(disp);
                }
            }
        }));
    }

    // Every applied reference update refreshes the drift file and the
    // tracking log.
    {
        let drift_path = config.drift_file.clone();
        let logs = logs.clone();
        let clock2 = clock.clone();
        reference.borrow_mut().set_update_hook(Box::new(move |tracking| {
            if let Some(path) = &drift_path {
                if let Err(e) =
                    persist::save_drift(path, tracking.frequency_ppm, tracking.skew_ppm)
                {
                    warn!("cannot write drift file: {}", e);
                }
            }
            if let Some(logs) = &logs {
                let (now, _) = clock2.borrow().cooked_now();
                logs.borrow_mut().log_tracking(now, tracking);
            }
        }));
    }

    // Configured sources: literal addresses go straight in, names wait
    // for the resolver.
    for spec in &config.sources {
        match spec.name.parse::<IpAddr>() {
            Ok(ip) => {
                let addr = SocketAddr::new(ip, spec.port);
                if let Err(e) =
                    registry
                        .borrow_mut()
                        .add_source(addr, spec.source_type, spec.options.clone())
                {
                    warn!("cannot add source {}: {}", addr, e);
                }
            }
            Err(_) => registry.borrow_mut().add_unresolved(
                spec.name.clone(),
                spec.port,
                spec.source_type,
                spec.options.clone(),
            ),
        }
    }

    // Reload sample histories from a previous run.
    if let Some(dir) = &config.dump_dir {
        for source in registry.borrow().sources() {
            let addr = source.borrow().remote_addr();
            let stats = source.borrow().stats();
            if let Err(e) = persist::load_dump(dir, &addr, &mut stats.borrow_mut()) {
                warn!("dump load for {} failed: {}", addr, e);
            };
        }
    }

    // Command socket.
    if let Some(path) = &config.command_socket {
        let dispatcher = Rc::new(RefCell::new(CmdDispatcher::new(
            registry.clone(),
            reference.clone(),
            clock.clone(),
            logs.clone(),
            config.command_password.clone(),
        )));
        let _ = std::fs::remove_file(path);
        let socket =
            UnixDatagram::bind(path).with_context(|| format!("binding {}", path.display()))?;
        socket.set_nonblocking(true)?;
        info!("command socket at {}", path.display());
        let fd = socket.as_raw_fd();
        let dispatcher = dispatcher.clone();
        sched.add_fd_handler(
            fd,
            Box::new(move |_| {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.recv_from(&mut buf) {
                        Ok((len, peer)) => {
                            let line = String::from_utf8_lossy(&buf[..len]);
                            let reply = dispatcher.borrow_mut().execute_line(line.trim());
                            let text = format!("{}\n{}", reply.status as i32, reply.text);
                            if let Some(peer_path) = peer.as_pathname() {
                                let _ = socket.send_to(text.as_bytes(), peer_path);
                            }
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!("command socket error: {}", e);
                            break;
                        }
                    }
                }
            }),
        )?;
    }

    // SIGINT/SIGTERM reach the loop through a self-pipe so the blocking
    // poll wakes up promptly.
    let (sig_rx, sig_tx) = UnixStream::pair()?;
    sig_rx.set_nonblocking(true)?;
    ctrlc::set_handler(move || {
        let _ = (&sig_tx).write(&[b'q']);
    })
    .context("installing signal handler")?;
    {
        let sched2 = sched.clone();
        let fd = sig_rx.as_raw_fd();
        sched.add_fd_handler(
            fd,
            Box::new(move |_| {
                let mut buf = [0u8; 8];
                use std::io::Read as _;
                let _ = (&sig_rx).read(&mut buf);
                info!("shutdown requested");
                sched2.quit();
            }),
        )?;
    }

    info!("ntpsyncd running");
    sched.run()?;

    // Orderly shutdown: persist what the next run wants back, then undo
    // any in-flight slew.
    if let Some(path) = &config.drift_file {
        let tracking = reference.borrow().tracking();
        let freq = clock.borrow().frequency_ppm();
        if let Err(e) = persist::save_drift(path, freq, tracking.skew_ppm) {
            warn!("cannot write drift file: {}", e);
        }
    }
    if let Some(dir) = &config.dump_dir {
        for source in registry.borrow().sources() {
            let addr = source.borrow().remote_addr();
            let stats = source.borrow().stats();
            if let Err(e) = persist::save_dump(dir, &addr, &stats.borrow()) {
                warn!("dump save for {} failed: {}", addr, e);
            };
        }
    }
    if let Some(path) = &config.command_socket {
        let _ = std::fs::remove_file(path);
    }
    finalise_driver();
    info!("ntpsyncd stopped");
    Ok(())
}
