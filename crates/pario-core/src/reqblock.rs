//! Request-block planner.
//!
//! Nonblocking backend writes pile up per variable as `(request, size)`
//! pairs; the per-file `wb_pend` tracks the total pending bytes. When the
//! pending volume crosses the buffer limit (or a flush is forced), the
//! planner walks variables in id order and completes their requests in
//! size-bounded blocks: each block is a contiguous run of requests whose
//! cumulative size stays within `block_size_limit`, handed to the
//! backend's `wait_all` in one shot; blocks complete sequentially.
//!
//! Within one variable requests complete in submission order. Across
//! variables order is unspecified, but a forced flush drains everything
//! before returning.

use std::cell::Cell;

use crate::error::Result;
use crate::file::FileDesc;

/// Default cap on pending write bytes per file.
pub const DEFAULT_BUFFER_SIZE_LIMIT: usize = 64 * 1024 * 1024;

thread_local! {
    static BUFFER_LIMIT: Cell<usize> = const { Cell::new(DEFAULT_BUFFER_SIZE_LIMIT) };
    static BLOCK_LIMIT: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Set the pending-bytes limit, returning the previous value.
pub fn set_buffer_size_limit(limit: usize) -> usize {
    BUFFER_LIMIT.with(|l| l.replace(limit))
}

pub fn buffer_size_limit() -> usize {
    BUFFER_LIMIT.with(|l| l.get())
}

/// Cap on one wait block's bytes; defaults to the buffer limit.
pub fn set_block_size_limit(limit: Option<usize>) -> Option<usize> {
    BLOCK_LIMIT.with(|l| l.replace(limit))
}

pub fn block_size_limit() -> usize {
    BLOCK_LIMIT.with(|l| l.get()).unwrap_or_else(buffer_size_limit)
}

/// Split one variable's request sizes into block boundaries
/// `(start, end)`; every block stays within `limit` except when a single
/// oversized request forms its own block.
pub fn plan_blocks(sizes: &[usize], limit: usize) -> Vec<(usize, usize)> {
    let mut blocks = Vec::new();
    let mut start = 0usize;
    let mut acc = 0usize;
    for (i, &sz) in sizes.iter().enumerate() {
        if i > start && acc + sz > limit {
            blocks.push((start, i));
            start = i;
            acc = 0;
        }
        acc += sz;
    }
    if start < sizes.len() {
        blocks.push((start, sizes.len()));
    }
    blocks
}

/// Complete pending nonblocking writes when forced or over the limit.
///
/// `addsize` is the size of a write about to be issued; flushing first
/// keeps `wb_pend` bounded. After a forced flush `wb_pend == 0`.
pub fn flush_output_buffer(file: &mut FileDesc, force: bool, addsize: usize) -> Result<()> {
    if !force && file.wb_pend + addsize < buffer_size_limit() {
        return Ok(());
    }
    if file.wb_pend == 0 {
        return Ok(());
    }
    let limit = block_size_limit();

    let Some(be) = file.backend.as_mut() else {
        // Ranks without a backend never accumulate requests.
        debug_assert_eq!(file.wb_pend, 0);
        return Ok(());
    };

    let mut drained = 0usize;
    for var in file.vars.iter_mut() {
        if var.requests.is_empty() {
            continue;
        }
        for (start, end) in plan_blocks(&var.request_sz, limit) {
            be.wait_all(&var.requests[start..end])?;
            drained += var.request_sz[start..end].iter().sum::<usize>();
        }
        var.requests.clear();
        var.request_sz.clear();
    }
    debug_assert!(drained <= file.wb_pend || file.wb_pend == 0);
    file.wb_pend = file.wb_pend.saturating_sub(drained);
    debug_assert_eq!(file.wb_pend, 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_blocks_respects_limit() {
        let sizes = vec![10, 10, 10, 10, 10];
        assert_eq!(plan_blocks(&sizes, 25), vec![(0, 2), (2, 4), (4, 5)]);
        assert_eq!(plan_blocks(&sizes, 100), vec![(0, 5)]);
        assert_eq!(plan_blocks(&sizes, 10), vec![(0, 1), (1, 2), (2, 3), (3, 4), (4, 5)]);
    }

    #[test]
    fn test_plan_blocks_oversized_single() {
        // A single request beyond the limit still goes in its own block.
        let sizes = vec![5, 100, 5];
        assert_eq!(plan_blocks(&sizes, 16), vec![(0, 1), (1, 2), (2, 3)]);
        assert_eq!(plan_blocks(&[200], 16), vec![(0, 1)]);
    }

    #[test]
    fn test_plan_blocks_empty() {
        assert!(plan_blocks(&[], 16).is_empty());
    }

    #[test]
    fn test_plan_blocks_preserves_order_and_coverage() {
        let sizes: Vec<usize> = (1..40).map(|i| (i * 37) % 23 + 1).collect();
        let blocks = plan_blocks(&sizes, 64);
        let mut expect = 0usize;
        for &(s, e) in &blocks {
            assert_eq!(s, expect);
            assert!(e > s);
            expect = e;
        }
        assert_eq!(expect, sizes.len());
    }

    #[test]
    fn test_limits_are_settable() {
        let old = set_buffer_size_limit(1024);
        assert_eq!(buffer_size_limit(), 1024);
        assert_eq!(block_size_limit(), 1024);
        set_block_size_limit(Some(256));
        assert_eq!(block_size_limit(), 256);
        set_block_size_limit(None);
        set_buffer_size_limit(old);
    }
}
