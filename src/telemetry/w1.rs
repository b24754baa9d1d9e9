//! DS18B20 probes exposed by the Linux `w1_therm` driver
//!
//! Each probe appears as `<root>/28-<serial>/w1_slave`:
//!
//! ```text
//! 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
//! 72 01 4b 46 7f ff 0e 10 57 t=23125
//! ```
//!
//! The kernel performs the conversion on read, which takes up to 750 ms per
//! probe at 12-bit resolution.

use super::{SensorSource, TelemetrySample};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Family code of DS18B20 devices
const DS18B20_FAMILY: &str = "28-";

/// Power-on register value, reported when a conversion did not run
const POWER_ON_RESET_MILLIDEGREES: i64 = 85_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum W1Error {
    #[error("CRC check failed")]
    CrcMismatch,
    #[error("Malformed w1_slave output")]
    Malformed,
    #[error("Probe returned its power-on value")]
    PowerOnReset,
}

/// Parse `w1_slave` contents into degrees Celsius
pub fn parse_w1_slave(contents: &str) -> Result<f64, W1Error> {
    let mut lines = contents.lines();
    let crc_line = lines.next().ok_or(W1Error::Malformed)?;
    if !crc_line.trim_end().ends_with("YES") {
        return Err(W1Error::CrcMismatch);
    }

    let data_line = lines.next().ok_or(W1Error::Malformed)?;
    let (_, raw) = data_line.rsplit_once("t=").ok_or(W1Error::Malformed)?;
    let millidegrees: i64 = raw.trim().parse().map_err(|_| W1Error::Malformed)?;
    if millidegrees == POWER_ON_RESET_MILLIDEGREES {
        return Err(W1Error::PowerOnReset);
    }

    Ok(millidegrees as f64 / 1000.0)
}

/// Reads every DS18B20 under a sysfs devices directory
#[derive(Debug, Clone)]
pub struct W1ThermSource {
    root: PathBuf,
}

impl W1ThermSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn probes(&self) -> Vec<(String, PathBuf)> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.root.display(), error = %e, "Cannot list 1-Wire devices");
                return Vec::new();
            }
        };

        let mut probes: Vec<(String, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.starts_with(DS18B20_FAMILY)
                    .then(|| (name, entry.path().join("w1_slave")))
            })
            .collect();
        probes.sort();
        probes
    }

    fn read_probe(path: &Path) -> Option<f64> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read 1-Wire probe");
                return None;
            }
        };
        match parse_w1_slave(&contents) {
            Ok(celsius) => Some(celsius),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding 1-Wire reading");
                None
            }
        }
    }
}

impl SensorSource for W1ThermSource {
    fn read(&mut self, now: DateTime<Utc>) -> Vec<TelemetrySample> {
        let samples: Vec<TelemetrySample> = self
            .probes()
            .into_iter()
            .filter_map(|(device_id, path)| {
                Self::read_probe(&path).map(|celsius| TelemetrySample::new(device_id, celsius, now))
            })
            .collect();
        debug!(count = samples.len(), "Read 1-Wire probes");
        samples
    }
}
