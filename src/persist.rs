//! Persisted state: drift file, per-source sample dumps and the
//! measurement/statistics/tracking logs.

use crate::clock::Ns;
use crate::reference::TrackingData;
use crate::sourcestats::SourceStats;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use log::{info, warn};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

// ----------------------------------------------------------------------
// Drift file
// ----------------------------------------------------------------------

/// One line: `<frequency_ppm> <skew_ppm>`.
pub fn save_drift(path: &Path, freq_ppm: f64, skew_ppm: f64) -> Result<()> {
    let mut f = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    writeln!(f, "{:.6} {:.6}", freq_ppm, skew_ppm)?;
    Ok(())
}

pub fn load_drift(path: &Path) -> Result<(f64, f64)> {
    let content = std::fs::read_to_string(path)?;
    let mut fields = content.split_whitespace();
    let freq: f64 = fields
        .next()
        .ok_or_else(|| anyhow!("empty drift file"))?
        .parse()?;
    let skew: f64 = fields
        .next()
        .ok_or_else(|| anyhow!("drift file missing skew"))?
        .parse()?;
    Ok((freq, skew))
}

// ----------------------------------------------------------------------
// Sample dumps
// ----------------------------------------------------------------------

fn dump_file_name(addr: &SocketAddr) -> String {
    // IPv6 colons do not belong in file names.
    format!("{}.dat", addr.ip().to_string().replace(':', "-"))
}

pub fn save_dump(dir: &Path, addr: &SocketAddr, stats: &SourceStats) -> Result<PathBuf> {
    let path = dir.join(dump_file_name(addr));
    let mut file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    stats.write_dump(&mut file)?;
    Ok(path)
}

/// Load a dump if one exists. Returns false when there is none; a
/// corrupt dump is abandoned with a warning and the history left empty.
pub fn load_dump(dir: &Path, addr: &SocketAddr, stats: &mut SourceStats) -> Result<bool> {
    let path = dir.join(dump_file_name(addr));
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    match stats.load_dump(&mut BufReader::new(file)) {
        Ok(()) => {
            info!("loaded sample dump for {}", addr);
            Ok(true)
        }
        Err(e) => {
            warn!("abandoning sample dump {}: {}", path.display(), e);
            Ok(false)
        }
    }
}

// ----------------------------------------------------------------------
// Log files
// ----------------------------------------------------------------------

/// Append-only log that reopens lazily, so cycling is just dropping the
/// handle.
struct LogFile {
    path: PathBuf,
    file: Option<File>,
}

impl LogFile {
    fn new(path: PathBuf) -> Self {
        LogFile { path, file: None }
    }

    fn write_line(&mut self, line: &str) {
        if self.file.is_none() {
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(f) => self.file = Some(f),
                Err(e) => {
                    warn!("cannot open log {}: {}", self.path.display(), e);
                    return;
                }
            }
        }
        if let Some(f) = self.file.as_mut() {
            if let Err(e) = writeln!(f, "{}", line) {
                warn!("write to {} failed: {}", self.path.display(), e);
                self.file = None;
            }
        }
    }

    fn cycle(&mut self) {
        self.file = None;
    }
}

pub struct Logs {
    statistics: Option<LogFile>,
    measurements: Option<LogFile>,
    tracking: Option<LogFile>,
}

impl Logs {
    pub fn new(
        dir: Option<&Path>,
        statistics: bool,
        measurements: bool,
        tracking: bool,
    ) -> Logs {
        let make = |name: &str, on: bool| match (dir, on) {
            (Some(d), true) => Some(LogFile::new(d.join(name))),
            _ => None,
        };
        Logs {
            statistics: make("statistics.log", statistics),
            measurements: make("measurements.log", measurements),
            tracking: make("tracking.log", tracking),
        }
    }

    pub fn log_statistics(&mut self, now: Ns, addr: &SocketAddr, stats: &SourceStats) {
        if let Some(log) = self.statistics.as_mut() {
            log.write_line(&format_statistics_line(ns_to_utc(now), addr, stats));
        }
    }

    pub fn log_measurement(&mut self, now: Ns, addr: &SocketAddr, offset: f64, delay: f64) {
        if let Some(log) = self.measurements.as_mut() {
            log.write_line(&format!(
                "{} {:15} {:.9} {:.9}",
                ns_to_utc(now).format("%Y-%m-%d %H:%M:%S"),
                addr.ip(),
                offset,
                delay
            ));
        }
    }

    pub fn log_tracking(&mut self, now: Ns, tracking: &TrackingData) {
        if let Some(log) = self.tracking.as_mut() {
            log.write_line(&format!(
                "{} {:08X} {:2} {:.6} {:.6} {:.9} {:.9}",
                ns_to_utc(now).format("%Y-%m-%d %H:%M:%S"),
                tracking.reference_id,
                tracking.stratum,
                tracking.frequency_ppm,
                tracking.skew_ppm,
                tracking.last_offset,
                tracking.root_dispersion
            ));
        }
    }

    /// `cyclelogs`: close everything; files reopen on next use.
    pub fn cycle(&mut self) {
        for log in [
            self.statistics.as_mut(),
            self.measurements.as_mut(),
            self.tracking.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            log.cycle();
        }
    }
}

fn ns_to_utc(ns: Ns) -> DateTime<Utc> {
    let secs = ns.div_euclid(crate::clock::NS_PER_SEC);
    let nanos = ns.rem_euclid(crate::clock::NS_PER_SEC) as u32;
    match Utc.timestamp_opt(secs, nanos) {
        chrono::LocalResult::Single(t) => t,
        _ => Utc.timestamp_opt(0, 0).unwrap(),
    }
}

/// Statistics log field order: date-time, address, std-dev, est-offset,
/// offset-sd, frequency, skew, stress, n_samples, best_start, n_runs.
pub fn format_statistics_line(
    time: DateTime<Utc>,
    addr: &SocketAddr,
    stats: &SourceStats,
) -> String {
    format!(
        "{} {:15} {:10.3e} {:10.3e} {:10.3e} {:10.3e} {:10.3e} {:10.3e} {:3} {:3} {:3}",
        time.format("%Y-%m-%d %H:%M:%S"),
        addr.ip(),
        stats.std_dev(),
        stats.estimated_offset(),
        stats.offset_sd(),
        stats.frequency() * 1e6,
        stats.skew() * 1e6,
        stats.stress(),
        stats.n_samples(),
        stats.last_best_start(),
        stats.n_runs()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::s_to_ns;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 123)
    }

    fn stats_with_samples() -> SourceStats {
        let mut stats = SourceStats::new(64, 3);
        for i in 0..8 {
            let t = i as f64 * 16.0;
            stats.accumulate_sample(s_to_ns(t), 1e-3 + 2e-6 * t, 0.01, 1e-4, 0.02, 2e-4, 2);
        }
        stats.run_regression();
        stats
    }

    #[test]
    fn test_drift_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drift");
        save_drift(&path, -12.345678, 0.25).unwrap();
        let (freq, skew) = load_drift(&path).unwrap();
        assert!((freq + 12.345678).abs() < 1e-9);
        assert!((skew - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_drift_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drift");
        std::fs::write(&path, "not a number\n").unwrap();
        assert!(load_drift(&path).is_err());
        assert!(load_drift(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_dump_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let stats = stats_with_samples();
        let n = stats.n_samples();
        save_dump(dir.path(), &addr(), &stats).unwrap();

        let mut restored = SourceStats::new(64, 3);
        assert!(load_dump(dir.path(), &addr(), &mut restored).unwrap());
        assert_eq!(restored.n_samples(), n);
        assert!((restored.frequency() - stats.frequency()).abs() < 1e-9);
    }

    #[test]
    fn test_dump_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut stats = SourceStats::new(64, 3);
        assert!(!load_dump(dir.path(), &addr(), &mut stats).unwrap());
    }

    #[test]
    fn test_corrupt_dump_abandoned_with_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(dump_file_name(&addr()));
        std::fs::write(&path, "2\nbroken\n").unwrap();
        let mut stats = stats_with_samples();
        assert!(!load_dump(dir.path(), &addr(), &mut stats).unwrap());
        assert_eq!(stats.n_samples(), 0);
    }

    #[test]
    fn test_statistics_line_field_order() {
        let stats = stats_with_samples();
        let time = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let line = format_statistics_line(time, &addr(), &stats);
        let fields: Vec<&str> = line.split_whitespace().collect();
        // date + time + 9 numeric fields.
        assert_eq!(fields.len(), 12);
        assert_eq!(fields[2], "10.0.0.1");
        let n_samples: usize = fields[9].parse().unwrap();
        assert_eq!(n_samples, stats.n_samples());
        let n_runs: usize = fields[11].parse().unwrap();
        assert_eq!(n_runs, stats.n_runs());
    }

    #[test]
    fn test_logs_write_and_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut logs = Logs::new(Some(dir.path()), true, true, false);
        let stats = stats_with_samples();
        logs.log_statistics(s_to_ns(1_700_000_000.0), &addr(), &stats);
        logs.log_measurement(s_to_ns(1_700_000_000.0), &addr(), 1e-3, 0.01);
        logs.cycle();
        logs.log_statistics(s_to_ns(1_700_000_010.0), &addr(), &stats);

        let content = std::fs::read_to_string(dir.path().join("statistics.log")).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(dir.path().join("measurements.log").exists());
        assert!(!dir.path().join("tracking.log").exists());
    }
}
