//! Per-file and per-iosystem I/O statistics.
//!
//! Every file carries two timers and two byte counters. At close they are
//! reduced (min/max/sum) across the iosystem and cached; iosystem
//! finalization renders per-file and per-component summaries in text and
//! JSON through the DOM-tree serializer. Emission is switched by the
//! `PIO_IO_SUMMARY` environment variable; the in-memory summaries are
//! always kept.

use std::cell::Cell;
use std::time::Instant;

use crate::comm::{Comm, ReduceOp};
use crate::error::Result;
use crate::iosystem::IoSystem;
use crate::serializer::{JsonSerializer, Serializer, TextSerializer};

thread_local! {
    static EPOCH: Cell<Option<Instant>> = const { Cell::new(None) };
}

/// Seconds since this rank's first call; monotonic.
pub fn now_secs() -> f64 {
    EPOCH.with(|cell| {
        let epoch = match cell.get() {
            Some(e) => e,
            None => {
                let e = Instant::now();
                cell.set(Some(e));
                e
            }
        };
        epoch.elapsed().as_secs_f64()
    })
}

/// Live counters attached to one open file on one rank.
#[derive(Debug, Default, Clone)]
pub struct FileStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub read_time: f64,
    pub write_time: f64,
}

impl FileStats {
    pub fn add_read(&mut self, bytes: u64, secs: f64) {
        self.bytes_read += bytes;
        self.read_time += secs;
    }

    pub fn add_write(&mut self, bytes: u64, secs: f64) {
        self.bytes_written += bytes;
        self.write_time += secs;
    }
}

/// Close-time reduction of one file's counters across the iosystem.
#[derive(Debug, Clone)]
pub struct FileStatSummary {
    pub fname: String,
    pub iotype: &'static str,
    pub bytes_read_sum: u64,
    pub bytes_written_sum: u64,
    pub read_time_min: f64,
    pub read_time_max: f64,
    pub write_time_min: f64,
    pub write_time_max: f64,
}

/// Summaries cached under the iosystem between file close and finalize.
#[derive(Debug, Default)]
pub struct IoSysStats {
    pub files: Vec<FileStatSummary>,
}

/// Reduce one file's counters over the union communicator and cache the
/// result. Collective; every rank caches identical values.
pub fn record_file_close(ios: &IoSystem, fname: &str, iotype: &'static str, stats: &FileStats) {
    let union = &ios.union_comm;
    let bytes = union.allreduce_i64(
        ReduceOp::Sum,
        &[stats.bytes_read as i64, stats.bytes_written as i64],
    );
    let tmin = union.allreduce_f64(ReduceOp::Min, &[stats.read_time, stats.write_time]);
    let tmax = union.allreduce_f64(ReduceOp::Max, &[stats.read_time, stats.write_time]);

    ios.stats.borrow_mut().files.push(FileStatSummary {
        fname: fname.to_string(),
        iotype,
        bytes_read_sum: bytes[0] as u64,
        bytes_written_sum: bytes[1] as u64,
        read_time_min: tmin[0],
        read_time_max: tmax[0],
        write_time_min: tmin[1],
        write_time_max: tmax[1],
    });
}

fn wallclock_string() -> String {
    unsafe {
        let mut t: libc::time_t = 0;
        libc::time(&mut t);
        let tm = libc::localtime(&t);
        if tm.is_null() {
            return String::new();
        }
        let mut buf = [0u8; 64];
        let fmt = c"%a %b %d %H:%M:%S %Y";
        let len = libc::strftime(
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            fmt.as_ptr(),
            tm,
        );
        String::from_utf8_lossy(&buf[..len]).to_string()
    }
}

fn hostname_string() -> String {
    unsafe {
        let mut uts: libc::utsname = std::mem::zeroed();
        if libc::uname(&mut uts) != 0 {
            return String::new();
        }
        let nodename = std::ffi::CStr::from_ptr(uts.nodename.as_ptr());
        nodename.to_string_lossy().to_string()
    }
}

fn bandwidth(bytes: u64, secs: f64) -> String {
    if secs <= 0.0 {
        return "n/a".to_string();
    }
    format!("{:.3} MiB/s", bytes as f64 / 1_048_576.0 / secs)
}

/// Fill one serializer with the component summary DOM.
pub fn build_summary_dom<S: Serializer>(ios: &IoSystem, ser: &mut S) {
    let stats = ios.stats.borrow();
    let top = ser.serialize(
        "io_summary",
        vec![
            ("component".to_string(), ios.comp_idx.to_string()),
            ("iosysid".to_string(), ios.iosysid.to_string()),
            ("num_iotasks".to_string(), ios.num_iotasks.to_string()),
            ("num_files".to_string(), stats.files.len().to_string()),
            ("host".to_string(), hostname_string()),
            ("finalized".to_string(), wallclock_string()),
        ],
    );
    for f in &stats.files {
        ser.serialize_child(
            top,
            "file",
            vec![
                ("name".to_string(), f.fname.clone()),
                ("iotype".to_string(), f.iotype.to_string()),
                ("bytes_read".to_string(), f.bytes_read_sum.to_string()),
                ("bytes_written".to_string(), f.bytes_written_sum.to_string()),
                (
                    "read_time_min_max".to_string(),
                    format!("{:.6}/{:.6}", f.read_time_min, f.read_time_max),
                ),
                (
                    "write_time_min_max".to_string(),
                    format!("{:.6}/{:.6}", f.write_time_min, f.write_time_max),
                ),
                (
                    "read_bw".to_string(),
                    bandwidth(f.bytes_read_sum, f.read_time_max),
                ),
                (
                    "write_bw".to_string(),
                    bandwidth(f.bytes_written_sum, f.write_time_max),
                ),
            ],
        );
    }
}

/// Emit the final text and JSON summaries on the root rank, when enabled.
pub fn write_final_summaries(ios: &IoSystem) -> Result<()> {
    let enabled = std::env::var("PIO_IO_SUMMARY").is_ok_and(|v| v != "0");
    if !enabled {
        return Ok(());
    }
    let root = if ios.compproc {
        ios.comp_rank == 0
    } else {
        ios.io_rank == 0
    };
    if !root {
        return Ok(());
    }
    let dir = std::env::var("PIO_IO_SUMMARY_DIR").unwrap_or_else(|_| ".".to_string());
    let base = format!("{dir}/pio_io_summary_{}", ios.iosysid);

    let mut txt = TextSerializer::new(&format!("{base}.txt"));
    build_summary_dom(ios, &mut txt);
    txt.sync()?;

    let mut json = JsonSerializer::new(&format!("{base}.json"));
    build_summary_dom(ios, &mut json);
    json.sync()?;
    Ok(())
}
