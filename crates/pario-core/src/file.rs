//! File and variable descriptors, file lifecycle, and metadata definition.
//!
//! Every rank of an iosystem mirrors the structural metadata (dims, vars,
//! record flags, fill values) of each open file so inquiry and the darray
//! paths never need a backend round trip; the backend itself lives only on
//! ranks with `do_io` set.

use std::cell::RefCell;
use std::rc::Rc;

use crate::backend::{GLOBAL_ATT, IoBackend, IoType, OpenMode, open_backend};
use crate::comm::Comm;
use crate::error::{PioError, Result};
use crate::iosystem::{IoSystem, apply_error_handler, get_iosystem};
use crate::mvcache::MvCache;
use crate::stats::FileStats;
use crate::tables::Registry;
use crate::types::PioType;

/// Dimension length marking the unlimited (record) dimension.
pub const PIO_UNLIMITED: i64 = 0;

/// Growth quantum of the per-variable request arrays.
pub const REQUEST_QUANTUM: usize = 16;

/// One dimension of an open file, mirrored on every rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimDesc {
    pub dimid: i32,
    pub name: String,
    pub len: i64,
    pub unlimited: bool,
}

/// One variable of an open file, mirrored on every rank.
#[derive(Debug)]
pub struct VarDesc {
    pub varid: i32,
    pub name: String,
    /// Leading dimension is the unlimited one.
    pub rec_var: bool,
    /// Current record index; -1 until `setframe`.
    pub frame: i32,
    /// Declared on-disk type.
    pub piotype: PioType,
    pub disk_size: usize,
    pub dimids: Vec<i32>,
    /// Fill value as disk-type bytes; `None` selects the type default.
    pub fillvalue: Option<Vec<u8>>,
    pub use_fill: bool,
    /// Outstanding nonblocking write requests, paired with their sizes;
    /// grown in chunks of `REQUEST_QUANTUM` and drained in submission
    /// order by the request-block planner.
    pub requests: Vec<i32>,
    pub request_sz: Vec<usize>,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

impl VarDesc {
    /// Append one request honouring the growth quantum.
    pub fn push_request(&mut self, req: i32, sz: usize) {
        if self.requests.len() == self.requests.capacity() {
            self.requests.reserve_exact(REQUEST_QUANTUM);
            self.request_sz.reserve_exact(REQUEST_QUANTUM);
        }
        self.requests.push(req);
        self.request_sz.push(sz);
    }
}

/// An open backend resource.
pub struct FileDesc {
    /// Stable id handed back to the caller.
    pub pio_ncid: i32,
    /// Identity carried in async messages; equals `pio_ncid` in sync mode.
    pub wire_ncid: i32,
    pub iosysid: i32,
    pub iotype: IoType,
    pub fname: String,
    pub mode: OpenMode,
    pub writable: bool,
    /// True on ranks that actually touch the backend: all io ranks for
    /// parallel backends, io rank 0 only for serial ones.
    pub do_io: bool,
    pub backend: Option<Box<dyn IoBackend>>,
    pub dims: Vec<DimDesc>,
    pub vars: Vec<VarDesc>,
    pub mvcache: MvCache,
    /// Bytes pending across all outstanding nonblocking writes.
    pub wb_pend: usize,
    pub in_define_mode: bool,
    pub fill_mode: bool,
    pub stats: FileStats,
}

impl FileDesc {
    pub fn ios(&self) -> Result<Rc<IoSystem>> {
        get_iosystem(self.iosysid)
    }

    pub fn var(&self, varid: i32) -> Result<&VarDesc> {
        self.vars
            .get(varid as usize)
            .filter(|v| v.varid == varid)
            .ok_or(PioError::NotVar)
    }

    pub fn var_mut(&mut self, varid: i32) -> Result<&mut VarDesc> {
        self.vars
            .get_mut(varid as usize)
            .filter(|v| v.varid == varid)
            .ok_or(PioError::NotVar)
    }

    pub fn unlimdimids(&self) -> Vec<i32> {
        self.dims
            .iter()
            .filter(|d| d.unlimited)
            .map(|d| d.dimid)
            .collect()
    }

    /// Lengths of a variable's non-record dimensions.
    pub fn var_shape(&self, varid: i32) -> Result<Vec<i64>> {
        let var = self.var(varid)?;
        let skip = if var.rec_var { 1 } else { 0 };
        var.dimids[skip..]
            .iter()
            .map(|&d| {
                self.dims
                    .get(d as usize)
                    .map(|dd| dd.len)
                    .ok_or(PioError::InvalidArgument)
            })
            .collect()
    }

    pub fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(PioError::Permission)
        }
    }
}

thread_local! {
    static FILES: RefCell<Registry<Rc<RefCell<FileDesc>>>> = RefCell::new(Registry::new(16));
}

/// Look up an open file handle.
pub fn get_file(ncid: i32) -> Result<Rc<RefCell<FileDesc>>> {
    FILES.with(|t| t.borrow().get(ncid)).ok_or(PioError::BadId)
}

pub(crate) fn next_ncid() -> i32 {
    FILES.with(|t| t.borrow().next_id())
}

fn register_file(file: FileDesc) -> i32 {
    FILES.with(|t| {
        let mut tab = t.borrow_mut();
        let id = tab.insert(Rc::new(RefCell::new(file)));
        id
    })
}

fn unregister_file(ncid: i32) {
    FILES.with(|t| {
        t.borrow_mut().remove(ncid);
    });
}

// Structural metadata shipped from the io side to every rank on open.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct FileMeta {
    pub dims: Vec<DimDesc>,
    pub vars: Vec<VarMeta>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct VarMeta {
    pub name: String,
    pub xtype: PioType,
    pub dimids: Vec<i32>,
    pub use_fill: bool,
    pub fill: Vec<u8>,
}

impl FileMeta {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let push_str = |out: &mut Vec<u8>, s: &str| {
            out.extend_from_slice(&(s.len() as u32).to_ne_bytes());
            out.extend_from_slice(s.as_bytes());
        };
        out.extend_from_slice(&(self.dims.len() as u32).to_ne_bytes());
        for d in &self.dims {
            push_str(&mut out, &d.name);
            out.extend_from_slice(&d.len.to_ne_bytes());
            out.push(d.unlimited as u8);
        }
        out.extend_from_slice(&(self.vars.len() as u32).to_ne_bytes());
        for v in &self.vars {
            push_str(&mut out, &v.name);
            out.extend_from_slice(&(v.xtype as i32).to_ne_bytes());
            out.extend_from_slice(&(v.dimids.len() as u32).to_ne_bytes());
            for &d in &v.dimids {
                out.extend_from_slice(&d.to_ne_bytes());
            }
            out.push(v.use_fill as u8);
            out.extend_from_slice(&(v.fill.len() as u32).to_ne_bytes());
            out.extend_from_slice(&v.fill);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<FileMeta> {
        let mut off = 0usize;
        let take = |off: &mut usize, n: usize| -> Result<&[u8]> {
            let s = buf.get(*off..*off + n).ok_or(PioError::Io)?;
            *off += n;
            Ok(s)
        };
        let take_u32 = |off: &mut usize| -> Result<u32> {
            Ok(u32::from_ne_bytes(take(off, 4)?.try_into().unwrap()))
        };
        let take_str = |off: &mut usize| -> Result<String> {
            let n = take_u32(off)? as usize;
            Ok(String::from_utf8_lossy(take(off, n)?).to_string())
        };

        let ndims = take_u32(&mut off)?;
        let mut dims = Vec::with_capacity(ndims as usize);
        for i in 0..ndims {
            let name = take_str(&mut off)?;
            let len = i64::from_ne_bytes(take(&mut off, 8)?.try_into().unwrap());
            let unlimited = take(&mut off, 1)?[0] != 0;
            dims.push(DimDesc {
                dimid: i as i32,
                name,
                len,
                unlimited,
            });
        }
        let nvars = take_u32(&mut off)?;
        let mut vars = Vec::with_capacity(nvars as usize);
        for _ in 0..nvars {
            let name = take_str(&mut off)?;
            let xtype =
                PioType::from_i32(i32::from_ne_bytes(take(&mut off, 4)?.try_into().unwrap()))?;
            let nd = take_u32(&mut off)? as usize;
            let mut dimids = Vec::with_capacity(nd);
            for _ in 0..nd {
                dimids.push(i32::from_ne_bytes(take(&mut off, 4)?.try_into().unwrap()));
            }
            let use_fill = take(&mut off, 1)?[0] != 0;
            let fn_ = take_u32(&mut off)? as usize;
            let fill = take(&mut off, fn_)?.to_vec();
            vars.push(VarMeta {
                name,
                xtype,
                dimids,
                use_fill,
                fill,
            });
        }
        Ok(FileMeta { dims, vars })
    }
}

fn var_from_meta(varid: i32, m: &VarMeta, dims: &[DimDesc]) -> Result<VarDesc> {
    let rec_var = m
        .dimids
        .first()
        .is_some_and(|&d| dims.get(d as usize).is_some_and(|dd| dd.unlimited));
    Ok(VarDesc {
        varid,
        name: m.name.clone(),
        rec_var,
        frame: -1,
        piotype: m.xtype,
        disk_size: m.xtype.disk_size()?,
        dimids: m.dimids.clone(),
        fillvalue: if m.fill.is_empty() {
            None
        } else {
            Some(m.fill.clone())
        },
        use_fill: m.use_fill,
        requests: Vec::new(),
        request_sz: Vec::new(),
        bytes_written: 0,
        bytes_read: 0,
    })
}

fn meta_from_backend(be: &dyn IoBackend) -> Result<FileMeta> {
    let (ndims, nvars, _ngatts, _unlim) = be.inq()?;
    let unlimdims = be.inq_unlimdims()?;
    let mut dims = Vec::with_capacity(ndims as usize);
    for d in 0..ndims {
        let (name, len) = be.inq_dim(d)?;
        dims.push(DimDesc {
            dimid: d,
            name,
            len,
            unlimited: unlimdims.contains(&d),
        });
    }
    let mut vars = Vec::with_capacity(nvars as usize);
    for v in 0..nvars {
        let info = be.inq_var(v)?;
        let (use_fill, fill) = be.inq_var_fill(v).unwrap_or((false, Vec::new()));
        vars.push(VarMeta {
            name: info.name,
            xtype: info.xtype,
            dimids: info.dimids,
            use_fill,
            fill,
        });
    }
    Ok(FileMeta { dims, vars })
}

fn compute_do_io(ios: &IoSystem, iotype: IoType) -> bool {
    if iotype.is_parallel() {
        ios.ioproc
    } else {
        ios.ioproc && ios.io_rank == 0
    }
}

/// Create a new file. Collective over the iosystem.
pub fn createfile(iosysid: i32, iotype: IoType, fname: &str, mode: OpenMode) -> Result<i32> {
    let ios = get_iosystem(iosysid)?;
    if ios.asynchronous && ios.compproc {
        let wire_ncid = next_ncid();
        crate::msg::send_create_file(&ios, iotype, fname, mode, wire_ncid)?;
        let ncid = register_file(FileDesc {
            pio_ncid: wire_ncid,
            wire_ncid,
            iosysid,
            iotype,
            fname: fname.to_string(),
            mode,
            writable: true,
            do_io: false,
            backend: None,
            dims: Vec::new(),
            vars: Vec::new(),
            mvcache: MvCache::new(),
            wb_pend: 0,
            in_define_mode: true,
            fill_mode: true,
            stats: FileStats::default(),
        });
        debug_assert_eq!(ncid, wire_ncid);
        return Ok(ncid);
    }
    create_local(&ios, iotype, fname, mode, None)
}

/// The non-forwarding body of `createfile`; io servers land here with the
/// wire id the compute side picked.
pub(crate) fn create_local(
    ios: &Rc<IoSystem>,
    iotype: IoType,
    fname: &str,
    mode: OpenMode,
    wire_ncid: Option<i32>,
) -> Result<i32> {
    let do_io = compute_do_io(ios, iotype);
    let mut backend = None;
    let mut code = 0i32;
    if do_io {
        match open_backend(iotype, fname, mode, true) {
            Ok(be) => backend = Some(be),
            Err(e) => code = e.code(),
        }
    }
    // Everyone agrees on the outcome before anyone proceeds.
    let code = crate::comm::agree_status(ios.my_comm(), code);
    let code = apply_error_handler(ios, code);
    if code != 0 {
        return Err(PioError::from_code(code).unwrap());
    }

    let ncid = register_file(FileDesc {
        pio_ncid: next_ncid(),
        wire_ncid: wire_ncid.unwrap_or_else(next_ncid),
        iosysid: ios.iosysid,
        iotype,
        fname: fname.to_string(),
        mode,
        writable: true,
        do_io,
        backend,
        dims: Vec::new(),
        vars: Vec::new(),
        mvcache: MvCache::new(),
        wb_pend: 0,
        in_define_mode: true,
        fill_mode: true,
        stats: FileStats::default(),
    });
    log::debug!("createfile {fname} iotype={} ncid={ncid}", iotype.name());
    Ok(ncid)
}

/// Open an existing file. With `retry` set, a failed parallel open falls
/// back to the serial classic backend on all ranks and the effective
/// iotype is rewritten; without it the original error is returned.
pub fn openfile(
    iosysid: i32,
    iotype: IoType,
    fname: &str,
    mode: OpenMode,
    retry: bool,
) -> Result<(i32, IoType)> {
    let ios = get_iosystem(iosysid)?;
    if ios.asynchronous && ios.compproc {
        let wire_ncid = next_ncid();
        let (eff, meta) = crate::msg::send_open_file(&ios, iotype, fname, mode, retry, wire_ncid)?;
        let mut vars = Vec::new();
        for (i, vm) in meta.vars.iter().enumerate() {
            vars.push(var_from_meta(i as i32, vm, &meta.dims)?);
        }
        let ncid = register_file(FileDesc {
            pio_ncid: wire_ncid,
            wire_ncid,
            iosysid,
            iotype: eff,
            fname: fname.to_string(),
            mode,
            writable: mode.contains(OpenMode::WRITE),
            do_io: false,
            backend: None,
            dims: meta.dims,
            vars,
            mvcache: MvCache::new(),
            wb_pend: 0,
            in_define_mode: false,
            fill_mode: true,
            stats: FileStats::default(),
        });
        debug_assert_eq!(ncid, wire_ncid);
        return Ok((ncid, eff));
    }
    open_local(&ios, iotype, fname, mode, retry, None)
}

pub(crate) fn open_local(
    ios: &Rc<IoSystem>,
    iotype: IoType,
    fname: &str,
    mode: OpenMode,
    retry: bool,
    wire_ncid: Option<i32>,
) -> Result<(i32, IoType)> {
    let try_open = |ios: &Rc<IoSystem>, iotype: IoType| -> (Option<Box<dyn IoBackend>>, i32) {
        let do_io = compute_do_io(ios, iotype);
        if !do_io {
            return (None, 0);
        }
        match open_backend(iotype, fname, mode, false) {
            Ok(be) => (Some(be), 0),
            Err(e) => (None, e.code()),
        }
    };

    let mut effective = iotype;
    let (mut backend, code) = try_open(ios, iotype);
    let mut code = crate::comm::agree_status(ios.my_comm(), code);
    if code != 0 && retry && iotype != IoType::Netcdf {
        log::warn!(
            "open of {fname} with iotype {} failed ({}), retrying with the serial classic backend",
            iotype.name(),
            crate::error::strerror(code)
        );
        effective = IoType::Netcdf;
        let (be2, code2) = try_open(ios, effective);
        backend = be2;
        code = crate::comm::agree_status(ios.my_comm(), code2);
    }
    let code = apply_error_handler(ios, code);
    if code != 0 {
        return Err(PioError::from_code(code).unwrap());
    }

    // Ship the structural metadata from the io root to every rank.
    let mut meta_bytes = match &backend {
        Some(be) => meta_from_backend(be.as_ref())?.encode(),
        None => Vec::new(),
    };
    ios.my_comm().broadcast(
        my_comm_root_with_backend(ios, effective),
        &mut meta_bytes,
    );
    let meta = FileMeta::decode(&meta_bytes)?;
    let mut vars = Vec::new();
    for (i, vm) in meta.vars.iter().enumerate() {
        vars.push(var_from_meta(i as i32, vm, &meta.dims)?);
    }

    let do_io = compute_do_io(ios, effective);
    let ncid = register_file(FileDesc {
        pio_ncid: next_ncid(),
        wire_ncid: wire_ncid.unwrap_or_else(next_ncid),
        iosysid: ios.iosysid,
        iotype: effective,
        fname: fname.to_string(),
        mode,
        writable: mode.contains(OpenMode::WRITE),
        do_io,
        backend,
        dims: meta.dims,
        vars,
        mvcache: MvCache::new(),
        wb_pend: 0,
        in_define_mode: false,
        fill_mode: true,
        stats: FileStats::default(),
    });
    log::debug!("openfile {fname} iotype={} ncid={ncid}", effective.name());
    Ok((ncid, effective))
}

// Rank within my_comm that holds an open backend for this iotype: io rank
// 0 for serial backends, the first io rank otherwise. In sync mode
// my_comm is the union communicator, so this is the union ioroot.
pub(crate) fn my_comm_root_with_backend(ios: &IoSystem, _iotype: IoType) -> i32 {
    if ios.compproc { ios.ioroot } else { 0 }
}

/// Close a file: drain staged writes, reduce the statistics, release the
/// backend. Collective.
pub fn closefile(ncid: i32) -> Result<()> {
    let f = get_file(ncid)?;
    {
        let mut file = f.borrow_mut();
        let ios = file.ios()?;
        if ios.asynchronous && ios.compproc {
            crate::darray::flush_staged(&ios, &mut file)?;
            crate::msg::send_close_file(&ios, file.wire_ncid)?;
            crate::stats::record_file_close(&ios, &file.fname, file.iotype.name(), &file.stats);
        } else {
            crate::darray::flush_staged(&ios, &mut file)?;
            crate::reqblock::flush_output_buffer(&mut file, true, 0)?;
            crate::stats::record_file_close(&ios, &file.fname, file.iotype.name(), &file.stats);
            if let Some(be) = file.backend.as_mut() {
                be.close()?;
            }
        }
        debug_assert!(file.mvcache.is_empty());
    }
    unregister_file(ncid);
    Ok(())
}

/// Flush staged and pending writes through to the backend. Collective and
/// idempotent: a second sync with no intervening write is a no-op.
pub fn sync_file(ncid: i32) -> Result<()> {
    let f = get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    if ios.asynchronous && ios.compproc {
        crate::darray::flush_staged(&ios, &mut file)?;
        crate::msg::send_sync(&ios, file.wire_ncid)?;
        return Ok(());
    }
    crate::darray::flush_staged(&ios, &mut file)?;
    crate::reqblock::flush_output_buffer(&mut file, true, 0)?;
    if let Some(be) = file.backend.as_mut() {
        be.sync()?;
    }
    Ok(())
}

/// Re-enter define mode.
pub fn redef(ncid: i32) -> Result<()> {
    let f = get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    file.check_writable()?;
    if file.in_define_mode {
        return Err(PioError::InDefine);
    }
    if ios.asynchronous && ios.compproc {
        crate::msg::send_redef(&ios, file.wire_ncid)?;
    } else if let Some(be) = file.backend.as_mut() {
        be.redef()?;
    }
    file.in_define_mode = true;
    Ok(())
}

/// Leave define mode.
pub fn enddef(ncid: i32) -> Result<()> {
    let f = get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    if !file.in_define_mode {
        return Err(PioError::NotInDefine);
    }
    if ios.asynchronous && ios.compproc {
        crate::msg::send_enddef(&ios, file.wire_ncid)?;
    } else if let Some(be) = file.backend.as_mut() {
        be.enddef()?;
    }
    file.in_define_mode = false;
    Ok(())
}

/// Set the fill mode, returning the previous one.
pub fn set_fill(ncid: i32, fill: bool) -> Result<bool> {
    let f = get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    file.check_writable()?;
    let old = file.fill_mode;
    if ios.asynchronous && ios.compproc {
        crate::msg::send_set_fill(&ios, file.wire_ncid, fill)?;
    } else if let Some(be) = file.backend.as_mut() {
        be.set_fill(fill)?;
    }
    file.fill_mode = fill;
    Ok(old)
}

/// Delete a file by name. Collective over the iosystem.
pub fn deletefile(iosysid: i32, fname: &str) -> Result<()> {
    let ios = get_iosystem(iosysid)?;
    if ios.asynchronous && ios.compproc {
        return crate::msg::send_delete_file(&ios, fname);
    }
    let mut code = 0i32;
    if ios.my_comm().rank() == 0
        && let Err(e) = std::fs::remove_file(fname)
    {
        code = PioError::from(e).code();
    }
    let code = crate::comm::agree_status(ios.my_comm(), code);
    match PioError::from_code(apply_error_handler(&ios, code)) {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// Define a dimension; 0 length declares the unlimited dimension.
pub fn def_dim(ncid: i32, name: &str, len: i64) -> Result<i32> {
    let f = get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    file.check_writable()?;
    if !file.in_define_mode {
        return Err(PioError::NotInDefine);
    }
    if len < 0 || name.is_empty() {
        return Err(PioError::InvalidArgument);
    }
    if file.dims.iter().any(|d| d.name == name) {
        return Err(PioError::Exists);
    }
    let unlimited = len == PIO_UNLIMITED;
    if unlimited && !file.unlimdimids().is_empty() && !file.iotype.is_parallel() {
        // Classic containers carry at most one record dimension.
        return Err(PioError::InvalidArgument);
    }

    if ios.asynchronous && ios.compproc {
        crate::msg::send_def_dim(&ios, file.wire_ncid, name, len)?;
    } else if let Some(be) = file.backend.as_mut() {
        let backend_id = be.def_dim(name, len)?;
        debug_assert_eq!(backend_id as usize, file.dims.len());
    }

    let dimid = file.dims.len() as i32;
    file.dims.push(DimDesc {
        dimid,
        name: name.to_string(),
        len,
        unlimited,
    });
    Ok(dimid)
}

/// Define a variable over previously defined dimensions.
///
/// For record variables only the leading dimension may be unlimited; an
/// unlimited dimension anywhere else is rejected.
pub fn def_var(ncid: i32, name: &str, xtype: PioType, dimids: &[i32]) -> Result<i32> {
    let f = get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    file.check_writable()?;
    if !file.in_define_mode {
        return Err(PioError::NotInDefine);
    }
    if name.is_empty() {
        return Err(PioError::InvalidArgument);
    }
    xtype.disk_size()?;
    if file.vars.iter().any(|v| v.name == name) {
        return Err(PioError::Exists);
    }
    for (pos, &d) in dimids.iter().enumerate() {
        let dim = file
            .dims
            .get(d as usize)
            .ok_or(PioError::InvalidArgument)?;
        if dim.unlimited && pos != 0 {
            return Err(PioError::InvalidArgument);
        }
    }

    if ios.asynchronous && ios.compproc {
        crate::msg::send_def_var(&ios, file.wire_ncid, name, xtype, dimids)?;
    } else if let Some(be) = file.backend.as_mut() {
        let backend_id = be.def_var(name, xtype, dimids)?;
        debug_assert_eq!(backend_id as usize, file.vars.len());
    }

    let varid = file.vars.len() as i32;
    let rec_var = dimids
        .first()
        .is_some_and(|&d| file.dims[d as usize].unlimited);
    file.vars.push(VarDesc {
        varid,
        name: name.to_string(),
        rec_var,
        frame: -1,
        piotype: xtype,
        disk_size: xtype.disk_size()?,
        dimids: dimids.to_vec(),
        fillvalue: None,
        use_fill: false,
        requests: Vec::new(),
        request_sz: Vec::new(),
        bytes_written: 0,
        bytes_read: 0,
    });
    Ok(varid)
}

/// Attach a fill value (given in `memtype` layout) to a variable.
pub fn def_var_fill(
    ncid: i32,
    varid: i32,
    no_fill: bool,
    memtype: PioType,
    fill: Option<&[u8]>,
) -> Result<()> {
    let f = get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    file.check_writable()?;
    let disk_type = file.var(varid)?.piotype;
    let converted = match fill {
        Some(b) => Some(crate::types::convert_buffer(b, memtype, disk_type)?),
        None => None,
    };

    if ios.asynchronous && ios.compproc {
        crate::msg::send_def_var_fill(&ios, file.wire_ncid, varid, no_fill, converted.as_deref())?;
    } else if let Some(be) = file.backend.as_mut() {
        be.def_var_fill(varid, no_fill, converted.as_deref())?;
    }

    let var = file.var_mut(varid)?;
    var.use_fill = !no_fill;
    var.fillvalue = converted;
    Ok(())
}

/// Variable fill setting: `(no_fill, fill value in memtype layout)`.
pub fn inq_var_fill(ncid: i32, varid: i32, memtype: PioType) -> Result<(bool, Vec<u8>)> {
    let f = get_file(ncid)?;
    let file = f.borrow();
    let var = file.var(varid)?;
    let fill = match &var.fillvalue {
        Some(b) => crate::types::convert_buffer(b, var.piotype, memtype)?,
        None => crate::types::convert_buffer(&var.piotype.default_fill()?, var.piotype, memtype)?,
    };
    Ok((!var.use_fill, fill))
}

/// Set the record index used by subsequent darray writes of a variable.
pub fn setframe(ncid: i32, varid: i32, frame: i32) -> Result<()> {
    let f = get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    if !file.var(varid)?.rec_var {
        return Err(PioError::InvalidArgument);
    }
    if ios.asynchronous && ios.compproc {
        crate::msg::send_setframe(&ios, file.wire_ncid, varid, frame)?;
    }
    file.var_mut(varid)?.frame = frame;
    Ok(())
}

/// Advance a record variable's frame by one.
pub fn advanceframe(ncid: i32, varid: i32) -> Result<()> {
    let f = get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    if ios.asynchronous && ios.compproc {
        crate::msg::send_advanceframe(&ios, file.wire_ncid, varid)?;
    }
    let var = file.var_mut(varid)?;
    if !var.rec_var {
        return Err(PioError::InvalidArgument);
    }
    var.frame += 1;
    Ok(())
}

// --- Inquiry over mirrored metadata ---------------------------------------

/// `(ndims, nvars, ngatts, unlimdimid)`.
pub fn inq(ncid: i32) -> Result<(i32, i32, i32, i32)> {
    let f = get_file(ncid)?;
    let file = f.borrow();
    let ngatts = crate::getput::inq_natts(&file, GLOBAL_ATT)?;
    let unlim = file.unlimdimids().first().copied().unwrap_or(-1);
    Ok((file.dims.len() as i32, file.vars.len() as i32, ngatts, unlim))
}

pub fn inq_dim(ncid: i32, dimid: i32) -> Result<(String, i64)> {
    let f = get_file(ncid)?;
    let file = f.borrow();
    let d = file
        .dims
        .get(dimid as usize)
        .ok_or(PioError::InvalidArgument)?;
    Ok((d.name.clone(), d.len))
}

pub fn inq_dimid(ncid: i32, name: &str) -> Result<i32> {
    let f = get_file(ncid)?;
    let file = f.borrow();
    file.dims
        .iter()
        .find(|d| d.name == name)
        .map(|d| d.dimid)
        .ok_or(PioError::InvalidArgument)
}

/// `(name, type, dimids)`.
pub fn inq_var(ncid: i32, varid: i32) -> Result<(String, PioType, Vec<i32>)> {
    let f = get_file(ncid)?;
    let file = f.borrow();
    let v = file.var(varid)?;
    Ok((v.name.clone(), v.piotype, v.dimids.clone()))
}

pub fn inq_varid(ncid: i32, name: &str) -> Result<i32> {
    let f = get_file(ncid)?;
    let file = f.borrow();
    file.vars
        .iter()
        .find(|v| v.name == name)
        .map(|v| v.varid)
        .ok_or(PioError::NotVar)
}

pub fn inq_unlimdims(ncid: i32) -> Result<Vec<i32>> {
    let f = get_file(ncid)?;
    let file = f.borrow();
    Ok(file.unlimdimids())
}

/// On-disk format code of an open file, as reported by its backend.
pub fn inq_format(ncid: i32) -> Result<i32> {
    let f = get_file(ncid)?;
    let file = f.borrow();
    let ios = file.ios()?;
    let mut out = Vec::new();
    if file.do_io && ios.is_io_root() {
        let fmt = file.backend.as_ref().ok_or(PioError::Io)?.inq_format()?;
        out = fmt.to_ne_bytes().to_vec();
    }
    ios.my_comm()
        .broadcast(my_comm_root_with_backend(&ios, file.iotype), &mut out);
    Ok(i32::from_ne_bytes(out[..4].try_into().unwrap()))
}

/// Per-variable chunking control. Only the v4 backends carry chunked
/// layouts; without one configured this reports a bad iotype.
pub fn def_var_chunking(ncid: i32, varid: i32, _storage: i32, _chunksizes: &[i64]) -> Result<()> {
    let f = get_file(ncid)?;
    let file = f.borrow();
    file.var(varid)?;
    match file.iotype {
        IoType::Netcdf4c | IoType::Netcdf4p => Ok(()),
        _ => Err(PioError::BadIoType),
    }
}

/// Per-variable endianness control; v4 backends only.
pub fn def_var_endian(ncid: i32, varid: i32, _endian: i32) -> Result<()> {
    let f = get_file(ncid)?;
    let file = f.borrow();
    file.var(varid)?;
    match file.iotype {
        IoType::Netcdf4c | IoType::Netcdf4p => Ok(()),
        _ => Err(PioError::BadIoType),
    }
}

/// Per-variable deflate control; v4 backends only.
pub fn def_var_deflate(
    ncid: i32,
    varid: i32,
    _shuffle: i32,
    _deflate: i32,
    _level: i32,
) -> Result<()> {
    let f = get_file(ncid)?;
    let file = f.borrow();
    file.var(varid)?;
    match file.iotype {
        IoType::Netcdf4c | IoType::Netcdf4p => Ok(()),
        _ => Err(PioError::BadIoType),
    }
}

/// Rename a dimension.
pub fn rename_dim(ncid: i32, dimid: i32, name: &str) -> Result<()> {
    let f = get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    file.check_writable()?;
    if file.dims.get(dimid as usize).is_none() {
        return Err(PioError::InvalidArgument);
    }
    if ios.asynchronous && ios.compproc {
        crate::msg::send_rename(&ios, file.wire_ncid, RenameKind::Dim, dimid, "", name)?;
    } else if let Some(be) = file.backend.as_mut() {
        be.rename_dim(dimid, name)?;
    }
    file.dims[dimid as usize].name = name.to_string();
    Ok(())
}

/// Rename a variable.
pub fn rename_var(ncid: i32, varid: i32, name: &str) -> Result<()> {
    let f = get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    file.check_writable()?;
    file.var(varid)?;
    if ios.asynchronous && ios.compproc {
        crate::msg::send_rename(&ios, file.wire_ncid, RenameKind::Var, varid, "", name)?;
    } else if let Some(be) = file.backend.as_mut() {
        be.rename_var(varid, name)?;
    }
    file.var_mut(varid)?.name = name.to_string();
    Ok(())
}

/// Rename an attribute of a variable (or a global one).
pub fn rename_att(ncid: i32, varid: i32, old: &str, new: &str) -> Result<()> {
    let f = get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    file.check_writable()?;
    if ios.asynchronous && ios.compproc {
        crate::msg::send_rename(&ios, file.wire_ncid, RenameKind::Att, varid, old, new)?;
        return Ok(());
    }
    if let Some(be) = file.backend.as_mut() {
        be.rename_att(varid, old, new)?;
    }
    Ok(())
}

/// Delete an attribute.
pub fn del_att(ncid: i32, varid: i32, name: &str) -> Result<()> {
    let f = get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    file.check_writable()?;
    if ios.asynchronous && ios.compproc {
        crate::msg::send_del_att(&ios, file.wire_ncid, varid, name)?;
        return Ok(());
    }
    if let Some(be) = file.backend.as_mut() {
        be.del_att(varid, name)?;
    }
    Ok(())
}

/// Kinds of rename carried by one message slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RenameKind {
    Dim = 0,
    Var = 1,
    Att = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_meta_roundtrip() {
        let meta = FileMeta {
            dims: vec![
                DimDesc {
                    dimid: 0,
                    name: "t".into(),
                    len: 0,
                    unlimited: true,
                },
                DimDesc {
                    dimid: 1,
                    name: "x".into(),
                    len: 16,
                    unlimited: false,
                },
            ],
            vars: vec![VarMeta {
                name: "v".into(),
                xtype: PioType::Double,
                dimids: vec![0, 1],
                use_fill: true,
                fill: vec![0u8; 8],
            }],
        };
        let decoded = FileMeta::decode(&meta.encode()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_var_from_meta_detects_record_var() {
        let dims = vec![
            DimDesc {
                dimid: 0,
                name: "t".into(),
                len: 0,
                unlimited: true,
            },
            DimDesc {
                dimid: 1,
                name: "x".into(),
                len: 4,
                unlimited: false,
            },
        ];
        let rec = var_from_meta(
            0,
            &VarMeta {
                name: "r".into(),
                xtype: PioType::Int,
                dimids: vec![0, 1],
                use_fill: false,
                fill: vec![],
            },
            &dims,
        )
        .unwrap();
        assert!(rec.rec_var);
        let fixed = var_from_meta(
            1,
            &VarMeta {
                name: "f".into(),
                xtype: PioType::Int,
                dimids: vec![1],
                use_fill: false,
                fill: vec![],
            },
            &dims,
        )
        .unwrap();
        assert!(!fixed.rec_var);
    }

    #[test]
    fn test_push_request_quantum() {
        let mut var = VarDesc {
            varid: 0,
            name: "v".into(),
            rec_var: false,
            frame: -1,
            piotype: PioType::Int,
            disk_size: 4,
            dimids: vec![],
            fillvalue: None,
            use_fill: false,
            requests: Vec::new(),
            request_sz: Vec::new(),
            bytes_written: 0,
            bytes_read: 0,
        };
        for i in 0..17 {
            var.push_request(i, 8);
        }
        assert_eq!(var.requests.len(), 17);
        assert!(var.requests.capacity() >= 2 * REQUEST_QUANTUM);
        assert_eq!(var.request_sz.len(), 17);
    }

    #[test]
    fn test_get_file_unknown() {
        assert!(matches!(get_file(1234), Err(PioError::BadId)));
    }
}
