use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{MemorySource, MemoryUsage, SystemMemoryInfo};
use crate::errors::{MemtuneError, Result};

/// Memory readings for the current process taken from procfs.
///
/// `current`/`peak` are the resident set (`VmRSS`/`VmHWM`), `real` is the
/// anonymous resident memory (`RssAnon`) which tracks heap growth more closely.
pub struct ProcessMemorySource {
    proc_root: PathBuf,
    ceiling: Option<u64>,
    status_field: Regex,
}

impl ProcessMemorySource {
    /// Reads `/proc/self`; fails on hosts without procfs
    pub fn new(ceiling: Option<u64>) -> Result<Self> {
        Self::with_root("/proc", ceiling)
    }

    pub fn with_root(proc_root: impl AsRef<Path>, ceiling: Option<u64>) -> Result<Self> {
        let status_field = Regex::new(r"(?m)^(\w+):\s+(\d+)\s*kB")
            .map_err(|e| MemtuneError::configuration(format!("procfs pattern: {}", e)))?;
        let source = Self {
            proc_root: proc_root.as_ref().to_path_buf(),
            ceiling,
            status_field,
        };

        // Probe once so a missing procfs is a construction error, not a silent zero
        source.usage()?;
        Ok(source)
    }

    fn read(&self, relative: &str) -> Result<String> {
        let path = self.proc_root.join(relative);
        fs::read_to_string(&path).map_err(|e| {
            MemtuneError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })
    }

    /// Extract `Name: <n> kB` fields, converted to bytes
    fn fields(&self, content: &str, wanted: &[&str]) -> Vec<Option<u64>> {
        let mut found = vec![None; wanted.len()];
        for caps in self.status_field.captures_iter(content) {
            if let Some(pos) = wanted.iter().position(|w| *w == &caps[1]) {
                found[pos] = caps[2].parse::<u64>().ok().map(|kb| kb * 1024);
            }
        }
        found
    }
}

impl MemorySource for ProcessMemorySource {
    fn usage(&self) -> Result<MemoryUsage> {
        let status = self.read("self/status")?;
        let values = self.fields(&status, &["VmRSS", "VmHWM", "RssAnon"]);

        let current = values[0].ok_or_else(|| {
            MemtuneError::configuration("VmRSS missing from self/status")
        })?;
        let peak = values[1].unwrap_or(current).max(current);
        let real = values[2].unwrap_or(current);

        Ok(MemoryUsage {
            current,
            peak,
            real,
            real_peak: peak.max(real),
        })
    }

    fn ceiling(&self) -> Option<u64> {
        self.ceiling
    }

    fn system_info(&self) -> Option<SystemMemoryInfo> {
        let meminfo = match self.read("meminfo") {
            Ok(content) => content,
            Err(e) => {
                debug!("System memory info unavailable: {}", e);
                return None;
            }
        };
        let status = self.read("self/status").ok()?;

        let system = self.fields(&meminfo, &["MemTotal", "MemAvailable"]);
        let process = self.fields(&status, &["VmRSS", "VmPeak"]);

        Some(SystemMemoryInfo {
            total: system[0].unwrap_or(0),
            available: system[1].unwrap_or(0),
            rss: process[0].unwrap_or(0),
            peak: process[1].unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_proc() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("self")).unwrap();
        fs::write(
            dir.path().join("self/status"),
            "Name:\tmemtune\nVmPeak:\t  204800 kB\nVmHWM:\t   40960 kB\nVmRSS:\t   30720 kB\nRssAnon:\t   20480 kB\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("meminfo"),
            "MemTotal:       16384000 kB\nMemFree:         1000000 kB\nMemAvailable:    8192000 kB\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_reads_process_status() {
        let dir = fake_proc();
        let source = ProcessMemorySource::with_root(dir.path(), Some(100 * 1024 * 1024)).unwrap();

        let usage = source.usage().unwrap();
        assert_eq!(usage.current, 30720 * 1024);
        assert_eq!(usage.peak, 40960 * 1024);
        assert_eq!(usage.real, 20480 * 1024);
        assert!((source.memory_ratio() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_reads_system_info() {
        let dir = fake_proc();
        let source = ProcessMemorySource::with_root(dir.path(), None).unwrap();

        let info = source.system_info().unwrap();
        assert_eq!(info.total, 16384000 * 1024);
        assert_eq!(info.available, 8192000 * 1024);
        assert_eq!(info.peak, 204800 * 1024);
        assert_eq!(source.memory_ratio(), 0.0);
    }

    #[test]
    fn test_missing_procfs_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessMemorySource::with_root(dir.path(), None).err().unwrap();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Configuration);
    }
}
