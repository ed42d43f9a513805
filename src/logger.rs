//! CSV event logger
//!
//! Drivers emit one row per allocator operation into an append-only,
//! comma-separated UTF-8 file. The header row is written only when the file
//! is created empty; reopening an existing log appends below the rows
//! already present. Writes are serialized by a logger-side mutex.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use core::fmt;

use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

const CSV_HEADER: &str =
    "Timestamp,Operation,BlockSize,Time,Fragmentation,Source,CallStack,MemoryAddress,ThreadID,AllocationID";

/// Failure to open or prepare the log file.
#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("failed to open log file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Row kind, first data column of every row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Allocation,
    Deallocation,
    Summary,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Allocation => write!(f, "Allocation"),
            Operation::Deallocation => write!(f, "Deallocation"),
            Operation::Summary => write!(f, "Summary"),
        }
    }
}

/// Thread-safe sink for allocator event rows.
pub struct DataLogger {
    file: Mutex<File>,
}

impl DataLogger {
    /// Open `path` in append mode, writing the CSV header when the file is
    /// empty.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, LoggerError> {
        let path = path.as_ref();
        let open = |p: &Path| -> io::Result<File> {
            let mut file = OpenOptions::new().create(true).append(true).open(p)?;
            if file.metadata()?.len() == 0 {
                writeln!(file, "{CSV_HEADER}")?;
            }
            Ok(file)
        };

        let file = open(path).map_err(|source| LoggerError::Open {
            path: path.display().to_string(),
            source,
        })?;
        debug!("logging allocator events to {}", path.display());

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one Allocation/Deallocation row.
    ///
    /// `time` is the per-operation elapsed seconds and `fragmentation` the
    /// pool's free fraction at emission.
    #[allow(clippy::too_many_arguments)]
    pub fn log(
        &self,
        timestamp: &str,
        operation: Operation,
        block_size: usize,
        time: f64,
        fragmentation: f64,
        source: &str,
        call_stack: &str,
        memory_address: &str,
        thread_id: &str,
        allocation_id: &str,
    ) -> io::Result<()> {
        let mut file = self.file.lock();
        writeln!(
            file,
            "{timestamp},{operation},{block_size},{time},{fragmentation},{source},{call_stack},{memory_address},{thread_id},{allocation_id}"
        )
    }

    /// Append a Summary row.
    ///
    /// Summary rows reuse the event columns: Time carries the allocation
    /// throughput (ops/s), Fragmentation the deallocation throughput, Source
    /// the driver label and CallStack the final fragmentation percentage.
    pub fn log_summary(
        &self,
        label: &str,
        alloc_throughput: f64,
        dealloc_throughput: f64,
        fragmentation_pct: f64,
    ) -> io::Result<()> {
        let timestamp = local_timestamp();
        let mut file = self.file.lock();
        writeln!(
            file,
            "{timestamp},{},0,{alloc_throughput},{dealloc_throughput},{label},{fragmentation_pct:.4},,,",
            Operation::Summary
        )
    }
}

/// Local wall-clock time as `YYYY-MM-DD HH:MM:SS`.
pub fn local_timestamp() -> String {
    let tm = local_tm();
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
}

/// Local wall-clock time in a form usable inside file names,
/// `YYYY-MM-DD_HH-MM-SS`.
pub fn file_timestamp() -> String {
    let tm = local_tm();
    format!(
        "{:04}-{:02}-{:02}_{:02}-{:02}-{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
}

fn local_tm() -> libc::tm {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs() as libc::time_t;
    let mut tm: libc::tm = unsafe { core::mem::zeroed() };
    unsafe {
        libc::localtime_r(&secs, &mut tm);
    }
    tm
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_header_written_once_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.csv");

        {
            let logger = DataLogger::create(&path).unwrap();
            logger
                .log(
                    "2026-01-01 00:00:00",
                    Operation::Allocation,
                    64,
                    0.000001,
                    0.5,
                    "test",
                    "test",
                    "0x1000",
                    "ThreadId(1)",
                    "Alloc0",
                )
                .unwrap();
        }

        // Reopen in append mode: no second header.
        {
            let logger = DataLogger::create(&path).unwrap();
            logger
                .log(
                    "2026-01-01 00:00:01",
                    Operation::Deallocation,
                    64,
                    0.000001,
                    1.0,
                    "test",
                    "test",
                    "0x1000",
                    "ThreadId(1)",
                    "Alloc0",
                )
                .unwrap();
        }

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].starts_with("2026-01-01 00:00:00,Allocation,64,"));
        assert!(lines[2].contains(",Deallocation,"));
    }

    #[test]
    fn test_rows_have_ten_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.csv");

        let logger = DataLogger::create(&path).unwrap();
        logger
            .log(
                &local_timestamp(),
                Operation::Allocation,
                128,
                0.0,
                1.0,
                "source",
                "stack",
                "0xdead",
                "ThreadId(7)",
                "Alloc3",
            )
            .unwrap();
        logger
            .log_summary("Throughput Benchmark Summary", 1000.0, 990.0, 100.0)
            .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        for line in content.lines() {
            assert_eq!(line.split(',').count(), 10, "line: {line}");
        }

        let summary = content.lines().last().unwrap();
        let fields: Vec<_> = summary.split(',').collect();
        assert_eq!(fields[1], "Summary");
        assert_eq!(fields[2], "0");
        assert_eq!(fields[5], "Throughput Benchmark Summary");
        assert_eq!(fields[6], "100.0000");
    }

    #[test]
    fn test_timestamp_shapes() {
        let ts = local_timestamp();
        assert_eq!(ts.len(), 19);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], " ");

        let fts = file_timestamp();
        assert_eq!(fts.len(), 19);
        assert!(!fts.contains(' '));
        assert!(!fts.contains(':'));
    }
}
