use std::cell::RefCell;
use std::fs::File;
use std::io::Write;
use std::sync::Once;

use log::{Level, LevelFilter, Log, Metadata, Record};

// Per-rank sink state. The library runs one logical thread per rank, so the
// rank and its log file live in thread-local storage; the process-global
// `log` facade routes records here.
struct RankLogState {
    rank: i32,
    refcount: u32,
    file: Option<File>,
}

thread_local! {
    static LOG_STATE: RefCell<RankLogState> = const {
        RefCell::new(RankLogState {
            rank: 0,
            refcount: 0,
            file: None,
        })
    };
}

struct RankLogger;

impl Log for RankLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        LOG_STATE.with(|s| {
            let mut st = s.borrow_mut();
            if st.refcount == 0 {
                // Early errors with no iosystem in scope still surface.
                if record.level() == Level::Error {
                    eprintln!("pio: {}", record.args());
                }
                return;
            }
            let rank = st.rank;
            // The per-rank file sink is opened on first use only.
            if st.file.is_none() {
                st.file = File::create(format!("pio_log_{rank}.txt")).ok();
            }
            if let Some(f) = st.file.as_mut() {
                let _ = writeln!(f, "[{}] rank {}: {}", record.level(), rank, record.args());
            }
            // Errors print on every rank; everything else only on root.
            if record.level() == Level::Error {
                eprintln!("pio rank {}: {}", rank, record.args());
            } else if rank == 0 {
                eprintln!("pio: {}", record.args());
            }
        });
    }

    fn flush(&self) {
        LOG_STATE.with(|s| {
            if let Some(f) = s.borrow_mut().file.as_mut() {
                let _ = f.flush();
            }
        });
    }
}

static INSTALL: Once = Once::new();

/// Bind this rank's log sink; reference-counted so nested iosystem
/// creation shares one sink.
pub fn init_logging(rank: i32) {
    INSTALL.call_once(|| {
        let level = std::env::var("PIO_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse::<LevelFilter>().ok())
            .unwrap_or(LevelFilter::Error);
        if log::set_boxed_logger(Box::new(RankLogger)).is_ok() {
            log::set_max_level(level);
        }
    });
    LOG_STATE.with(|s| {
        let mut st = s.borrow_mut();
        st.rank = rank;
        st.refcount += 1;
    });
}

/// Drop one reference to the sink; the file closes with the last one.
pub fn finalize_logging() {
    LOG_STATE.with(|s| {
        let mut st = s.borrow_mut();
        if st.refcount > 0 {
            st.refcount -= 1;
            if st.refcount == 0 {
                st.file = None;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refcount_balances() {
        init_logging(3);
        init_logging(3);
        LOG_STATE.with(|s| assert_eq!(s.borrow().refcount, 2));
        finalize_logging();
        LOG_STATE.with(|s| assert_eq!(s.borrow().refcount, 1));
        finalize_logging();
        LOG_STATE.with(|s| {
            let st = s.borrow();
            assert_eq!(st.refcount, 0);
            assert!(st.file.is_none());
        });
        // Underflow is a no-op.
        finalize_logging();
    }
}
