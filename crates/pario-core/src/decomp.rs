use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{PioError, Result};
use crate::iosystem::{IoSystem, Rearranger, get_iosystem};
use crate::rearrange;
use crate::tables::Registry;
use crate::types::PioType;

/// One contiguous block of the global array owned by an io rank, plus its
/// element offset into the io-side buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRegion {
    pub start: Vec<i64>,
    pub count: Vec<i64>,
    /// Element index of this block's first element in the io buffer.
    pub offset: usize,
}

impl IoRegion {
    pub fn num_elem(&self) -> usize {
        self.count.iter().product::<i64>() as usize
    }
}

/// A registered mapping from compute-rank-local elements to positions of a
/// globally logical array, bound to one iosystem.
///
/// `map` holds 1-based global linear offsets; 0 marks a hole that no rank
/// contributes, which the write path fills with the variable's fill value.
pub struct IoDesc {
    pub ioid: i32,
    pub iosysid: i32,
    pub piotype: PioType,
    pub ndims: usize,
    pub dimlen: Vec<i64>,
    pub rearranger: Rearranger,
    pub maplen: usize,
    pub map: Vec<i64>,
    pub mem_elem_size: usize,
    pub disk_elem_size: usize,

    // Compute-side exchange metadata: per io task.
    pub scount: Vec<i32>,
    /// Local element indices grouped by destination io task, in send order.
    pub sindex: Vec<usize>,

    // Io-side exchange metadata.
    /// Union ranks this io task receives from, ascending.
    pub rfrom: Vec<i32>,
    /// Elements received from each rank in `rfrom`.
    pub rcount: Vec<i32>,
    /// Receive-stream position -> io buffer element offset.
    pub rindex: Vec<usize>,
    /// Io-side element count.
    pub llen: usize,
    /// Contiguous blocks this io task writes, in file order.
    pub regions: Vec<IoRegion>,
    /// Blocks of holes this io task fills.
    pub fill_regions: Vec<IoRegion>,
    /// Max region count across io ranks (serial backends pre-size by it).
    pub maxregions: usize,
    pub needsfill: bool,
    pub needssort: bool,
    /// Sort permutation of the aggregated map when it arrived
    /// non-monotonic; empty otherwise.
    pub remap: Vec<usize>,
    /// Io tasks that actually own data for this decomposition.
    pub num_aiotasks: i32,
}

impl IoDesc {
    /// Total elements of the global array.
    pub fn global_size(&self) -> i64 {
        self.dimlen.iter().product()
    }
}

thread_local! {
    static DECOMPS: RefCell<Registry<Rc<IoDesc>>> = RefCell::new(Registry::new(512));
}

/// Look up a decomposition handle.
pub fn get_decomp(ioid: i32) -> Result<Rc<IoDesc>> {
    DECOMPS.with(|t| t.borrow().get(ioid)).ok_or(PioError::BadId)
}

pub(crate) fn next_ioid() -> i32 {
    DECOMPS.with(|t| t.borrow().next_id())
}

pub(crate) fn register_decomp(desc: IoDesc) -> Rc<IoDesc> {
    DECOMPS.with(|t| {
        let mut tab = t.borrow_mut();
        let rc = Rc::new(desc);
        let id = tab.insert(Rc::clone(&rc));
        debug_assert_eq!(id, rc.ioid);
        rc
    })
}

fn validate(ndims: usize, dimlen: &[i64], map: &[i64]) -> Result<()> {
    if ndims == 0 || dimlen.len() != ndims {
        return Err(PioError::InvalidArgument);
    }
    if dimlen.iter().any(|&d| d <= 0) {
        return Err(PioError::InvalidArgument);
    }
    let total: i64 = dimlen.iter().product();
    for &m in map {
        if m < 0 || m > total {
            return Err(PioError::InvalidArgument);
        }
    }
    Ok(())
}

/// Register a decomposition of a `dimlen`-shaped global array.
///
/// `map` holds this rank's 1-based global offsets (0 = hole). Collective
/// over the iosystem's union communicator. `io_start`/`io_count` optionally
/// pin this io rank's slab for the BOX rearranger; both or neither must be
/// given, on io ranks only.
pub fn init_decomp(
    iosysid: i32,
    piotype: PioType,
    dimlen: &[i64],
    map: &[i64],
    rearranger: Option<Rearranger>,
    io_start: Option<&[i64]>,
    io_count: Option<&[i64]>,
) -> Result<i32> {
    let ios = get_iosystem(iosysid)?;
    // Validate before anything reaches the wire so a bad argument can
    // never desynchronize the compute and io sides.
    validate(dimlen.len(), dimlen, map)?;
    if ios.asynchronous && ios.compproc {
        return crate::msg::send_init_decomp(&ios, piotype, dimlen, map, rearranger);
    }
    init_decomp_local(&ios, piotype, dimlen, map, rearranger, io_start, io_count)
}

/// The non-forwarding body of `init_decomp`; io servers land here when the
/// message arrives.
pub(crate) fn init_decomp_local(
    ios: &Rc<IoSystem>,
    piotype: PioType,
    dimlen: &[i64],
    map: &[i64],
    rearranger: Option<Rearranger>,
    io_start: Option<&[i64]>,
    io_count: Option<&[i64]>,
) -> Result<i32> {
    let ndims = dimlen.len();
    validate(ndims, dimlen, map)?;
    if io_start.is_some() != io_count.is_some() {
        return Err(PioError::InvalidArgument);
    }
    if let (Some(s), Some(c)) = (io_start, io_count)
        && (s.len() != ndims || c.len() != ndims)
    {
        return Err(PioError::InvalidArgument);
    }
    let rearranger = rearranger.unwrap_or(ios.default_rearranger);

    let ioid = next_ioid();
    let desc = rearrange::build_decomp(
        ios, ioid, piotype, dimlen, map, rearranger, io_start, io_count,
    )?;
    register_decomp(desc);
    log::debug!(
        "init_decomp ioid={} ndims={} maplen={} rearr={:?}",
        ioid,
        ndims,
        map.len(),
        rearranger
    );
    Ok(ioid)
}

/// Release a decomposition. Fails if the ids do not match up.
pub fn free_decomp(iosysid: i32, ioid: i32) -> Result<()> {
    let ios = get_iosystem(iosysid)?;
    let desc = get_decomp(ioid)?;
    if desc.iosysid != ios.iosysid {
        return Err(PioError::BadId);
    }
    if ios.asynchronous && ios.compproc {
        crate::msg::send_free_decomp(&ios, ioid)?;
    }
    DECOMPS.with(|t| {
        t.borrow_mut().remove(ioid);
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_bad_shapes() {
        assert!(validate(0, &[], &[]).is_err());
        assert!(validate(2, &[4], &[]).is_err());
        assert!(validate(1, &[0], &[]).is_err());
        assert!(validate(1, &[-2], &[]).is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_map() {
        assert!(validate(1, &[8], &[9]).is_err());
        assert!(validate(1, &[8], &[-1]).is_err());
        assert!(validate(1, &[8], &[0, 1, 8]).is_ok());
        assert!(validate(2, &[2, 3], &[6, 0]).is_ok());
        assert!(validate(2, &[2, 3], &[7]).is_err());
    }

    #[test]
    fn test_get_decomp_unknown() {
        assert!(matches!(get_decomp(77), Err(PioError::BadId)));
    }
}
