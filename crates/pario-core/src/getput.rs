//! Type-neutral variable and attribute data path.
//!
//! Every operation takes the caller's in-memory primitive (`memtype`) and
//! converts against the stored on-disk type as needed. All operations are
//! collective over the iosystem; read results are broadcast from the rank
//! holding the backend so every rank returns the same bytes.

use std::rc::Rc;

use crate::backend::IoType;
use crate::comm::{Comm, bytes_from_i64s, i64s_from_bytes};
use crate::error::{PioError, Result};
use crate::file::{FileDesc, get_file, my_comm_root_with_backend};
use crate::iosystem::{IoSystem, apply_error_handler};
use crate::stats::now_secs;
use crate::types::{PioType, convert_buffer};

// True when this rank issues the backend call for the scalar (non-darray)
// data path: every io rank for the v4 parallel flavour, the io master
// otherwise.
fn issues_scalar_io(ios: &IoSystem, file: &FileDesc) -> bool {
    if !file.do_io {
        return false;
    }
    match file.iotype {
        IoType::Netcdf4p => true,
        _ => ios.is_io_root(),
    }
}

// Fold a local status code into a collective one and run it through the
// error handler.
fn agree_code(ios: &Rc<IoSystem>, code: i32) -> Result<()> {
    let agreed = crate::comm::agree_status(ios.my_comm(), code);
    match PioError::from_code(apply_error_handler(ios, agreed)) {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

// Resolve optional hyperslab arguments against the variable's shape.
// `start=None` means zeros, `count=None` the full shape, `stride=None`
// ones. Scalar variables require all three to be absent.
fn resolve_slab(
    file: &FileDesc,
    varid: i32,
    start: Option<&[i64]>,
    count: Option<&[i64]>,
    stride: Option<&[i64]>,
) -> Result<(Vec<i64>, Vec<i64>, Vec<i64>)> {
    let var = file.var(varid)?;
    let ndims = var.dimids.len();
    if ndims == 0 {
        if start.is_some() || count.is_some() || stride.is_some() {
            return Err(PioError::InvalidArgument);
        }
        return Ok((Vec::new(), Vec::new(), Vec::new()));
    }
    let dimlens: Vec<i64> = var
        .dimids
        .iter()
        .map(|&d| file.dims[d as usize].len)
        .collect();
    let start = match start {
        Some(s) if s.len() == ndims => s.to_vec(),
        Some(_) => return Err(PioError::InvalidArgument),
        None => vec![0; ndims],
    };
    let count = match count {
        Some(c) if c.len() == ndims => c.to_vec(),
        Some(_) => return Err(PioError::InvalidArgument),
        None => {
            let mut c: Vec<i64> = dimlens.clone();
            for (i, x) in c.iter_mut().enumerate() {
                *x -= start[i];
            }
            c
        }
    };
    let stride = match stride {
        Some(s) if s.len() == ndims => s.to_vec(),
        Some(_) => return Err(PioError::InvalidArgument),
        None => vec![1; ndims],
    };
    for i in 0..ndims {
        if start[i] < 0 || count[i] < 0 || stride[i] < 1 {
            return Err(PioError::InvalidArgument);
        }
        // The record dimension is open-ended; fixed dims are bounded.
        if !file.dims[var.dimids[i] as usize].unlimited
            && start[i] + (count[i] - 1).max(0) * stride[i] + 1 > dimlens[i]
        {
            return Err(PioError::InvalidArgument);
        }
    }
    Ok((start, count, stride))
}

fn num_elem(count: &[i64]) -> usize {
    if count.is_empty() {
        1
    } else {
        count.iter().product::<i64>() as usize
    }
}

/// Write a strided hyperslab from a `memtype` buffer.
pub fn put_vars_tc(
    ncid: i32,
    varid: i32,
    start: Option<&[i64]>,
    count: Option<&[i64]>,
    stride: Option<&[i64]>,
    memtype: PioType,
    data: &[u8],
) -> Result<()> {
    let f = get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    file.check_writable()?;
    if file.in_define_mode {
        return Err(PioError::InDefine);
    }
    let (start, count, stride) = resolve_slab(&file, varid, start, count, stride)?;
    let nelem = num_elem(&count);
    if data.len() != nelem * memtype.mem_size()? {
        return Err(PioError::InvalidArgument);
    }

    if ios.asynchronous && ios.compproc {
        return crate::msg::send_put_vars(
            &ios, file.wire_ncid, varid, &start, &count, &stride, memtype, data,
        );
    }
    put_vars_local(&ios, &mut file, varid, &start, &count, &stride, memtype, data)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn put_vars_local(
    ios: &Rc<IoSystem>,
    file: &mut FileDesc,
    varid: i32,
    start: &[i64],
    count: &[i64],
    stride: &[i64],
    memtype: PioType,
    data: &[u8],
) -> Result<()> {
    let disk_type = file.var(varid)?.piotype;
    let mut code = 0i32;
    if issues_scalar_io(ios, file) {
        let converted = convert_buffer(data, memtype, disk_type)?;
        let nbytes = converted.len();
        let t0 = now_secs();
        let iotype = file.iotype;
        let be = file.backend.as_mut().ok_or(PioError::Io)?;
        let res = if iotype == IoType::Pnetcdf {
            // Buffered nonblocking form; the request id joins the
            // variable's pending list for the block planner.
            be.put_vars_nb(varid, start, count, stride, &converted)
                .map(Some)
        } else {
            be.put_vars(varid, start, count, stride, &converted).map(|_| None)
        };
        match res {
            Ok(Some(req)) => {
                file.var_mut(varid)?.push_request(req, nbytes);
                file.wb_pend += nbytes;
            }
            Ok(None) => {}
            Err(e) => code = e.code(),
        }
        let dt = now_secs() - t0;
        file.stats.add_write(nbytes as u64, dt);
        file.var_mut(varid)?.bytes_written += nbytes as u64;
    }
    if file.iotype == IoType::Pnetcdf {
        crate::reqblock::flush_output_buffer(file, false, 0)?;
    }
    agree_code(ios, code)
}

/// Read a strided hyperslab into `memtype` layout. Every rank of the
/// iosystem gets the same bytes.
pub fn get_vars_tc(
    ncid: i32,
    varid: i32,
    start: Option<&[i64]>,
    count: Option<&[i64]>,
    stride: Option<&[i64]>,
    memtype: PioType,
) -> Result<Vec<u8>> {
    let f = get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    let (start, count, stride) = resolve_slab(&file, varid, start, count, stride)?;

    if ios.asynchronous && ios.compproc {
        return crate::msg::send_get_vars(
            &ios, file.wire_ncid, varid, &start, &count, &stride, memtype,
        );
    }
    get_vars_local(&ios, &mut file, varid, &start, &count, &stride, memtype)
}

pub(crate) fn get_vars_local(
    ios: &Rc<IoSystem>,
    file: &mut FileDesc,
    varid: i32,
    start: &[i64],
    count: &[i64],
    stride: &[i64],
    memtype: PioType,
) -> Result<Vec<u8>> {
    // Buffered nonblocking writes must land before anything is read back.
    if file.iotype == IoType::Pnetcdf {
        crate::reqblock::flush_output_buffer(file, true, 0)?;
    }
    let disk_type = file.var(varid)?.piotype;
    let mut code = 0i32;
    let mut buf = Vec::new();
    // Reads run independently on the io master (all ranks for v4
    // parallel; the broadcast below makes the result uniform either way).
    if file.do_io && ios.is_io_root() {
        let t0 = now_secs();
        let be = file.backend.as_ref().ok_or(PioError::Io)?;
        match be.get_vars(varid, start, count, stride) {
            Ok(disk_bytes) => {
                let dt = now_secs() - t0;
                file.stats.add_read(disk_bytes.len() as u64, dt);
                file.var_mut(varid)?.bytes_read += disk_bytes.len() as u64;
                buf = convert_buffer(&disk_bytes, disk_type, memtype)?;
            }
            Err(e) => code = e.code(),
        }
    }
    agree_code(ios, code)?;
    ios.my_comm()
        .broadcast(my_comm_root_with_backend(ios, file.iotype), &mut buf);
    Ok(buf)
}

/// Single-element write: `put_vars` with unit counts.
pub fn put_var1_tc(
    ncid: i32,
    varid: i32,
    index: &[i64],
    memtype: PioType,
    data: &[u8],
) -> Result<()> {
    let ones = vec![1i64; index.len()];
    let idx = if index.is_empty() { None } else { Some(index) };
    let cnt = if index.is_empty() {
        None
    } else {
        Some(ones.as_slice())
    };
    put_vars_tc(ncid, varid, idx, cnt, None, memtype, data)
}

/// Single-element read.
pub fn get_var1_tc(ncid: i32, varid: i32, index: &[i64], memtype: PioType) -> Result<Vec<u8>> {
    let ones = vec![1i64; index.len()];
    let idx = if index.is_empty() { None } else { Some(index) };
    let cnt = if index.is_empty() {
        None
    } else {
        Some(ones.as_slice())
    };
    get_vars_tc(ncid, varid, idx, cnt, None, memtype)
}

/// Whole-variable write.
pub fn put_var_tc(ncid: i32, varid: i32, memtype: PioType, data: &[u8]) -> Result<()> {
    put_vars_tc(ncid, varid, None, None, None, memtype, data)
}

/// Whole-variable read.
pub fn get_var_tc(ncid: i32, varid: i32, memtype: PioType) -> Result<Vec<u8>> {
    get_vars_tc(ncid, varid, None, None, None, memtype)
}

/// Write an attribute of `atttype` from a `memtype` buffer. Collective and
/// idempotent: re-putting an attribute overwrites it.
pub fn put_att_tc(
    ncid: i32,
    varid: i32,
    name: &str,
    atttype: PioType,
    memtype: PioType,
    data: &[u8],
) -> Result<()> {
    let f = get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    file.check_writable()?;
    if name.is_empty() {
        return Err(PioError::InvalidArgument);
    }
    let memlen = memtype.mem_size()?;
    if data.len() % memlen != 0 {
        return Err(PioError::InvalidArgument);
    }
    let atttype = if atttype == PioType::Nat {
        memtype
    } else {
        atttype
    };

    if ios.asynchronous && ios.compproc {
        return crate::msg::send_put_att(&ios, file.wire_ncid, varid, name, atttype, memtype, data);
    }
    put_att_local(&ios, &mut file, varid, name, atttype, memtype, data)
}

pub(crate) fn put_att_local(
    ios: &Rc<IoSystem>,
    file: &mut FileDesc,
    varid: i32,
    name: &str,
    atttype: PioType,
    memtype: PioType,
    data: &[u8],
) -> Result<()> {
    let mut code = 0i32;
    if issues_scalar_io(ios, file) {
        let converted = convert_buffer(data, memtype, atttype)?;
        let be = file.backend.as_mut().ok_or(PioError::Io)?;
        if let Err(e) = be.put_att(varid, name, atttype, &converted) {
            code = e.code();
        }
    }
    agree_code(ios, code)
}

/// Read an attribute, converted into `memtype` layout, on every rank.
pub fn get_att_tc(ncid: i32, varid: i32, name: &str, memtype: PioType) -> Result<Vec<u8>> {
    let f = get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    if ios.asynchronous && ios.compproc {
        return crate::msg::send_get_att(&ios, file.wire_ncid, varid, name, memtype);
    }
    get_att_local(&ios, &mut file, varid, name, memtype)
}

pub(crate) fn get_att_local(
    ios: &Rc<IoSystem>,
    file: &mut FileDesc,
    varid: i32,
    name: &str,
    memtype: PioType,
) -> Result<Vec<u8>> {
    let mut code = 0i32;
    let mut buf = Vec::new();
    if file.do_io && ios.is_io_root() {
        let be = file.backend.as_ref().ok_or(PioError::Io)?;
        match be
            .inq_att(varid, name)
            .and_then(|(xtype, _len)| Ok((xtype, be.get_att(varid, name)?)))
        {
            Ok((xtype, disk_bytes)) => buf = convert_buffer(&disk_bytes, xtype, memtype)?,
            Err(e) => code = e.code(),
        }
    }
    agree_code(ios, code)?;
    ios.my_comm()
        .broadcast(my_comm_root_with_backend(ios, file.iotype), &mut buf);
    Ok(buf)
}

/// Attribute metadata `(stored type, length in elements)` on every rank.
pub fn inq_att(ncid: i32, varid: i32, name: &str) -> Result<(PioType, i64)> {
    let f = get_file(ncid)?;
    let file = f.borrow();
    let ios = file.ios()?;
    if ios.asynchronous && ios.compproc {
        return crate::msg::send_inq_att(&ios, file.wire_ncid, varid, name);
    }
    inq_att_local(&ios, &file, varid, name)
}

pub(crate) fn inq_att_local(
    ios: &Rc<IoSystem>,
    file: &FileDesc,
    varid: i32,
    name: &str,
) -> Result<(PioType, i64)> {
    let mut code = 0i32;
    let mut out = Vec::new();
    if file.do_io && ios.is_io_root() {
        match file.backend.as_ref().ok_or(PioError::Io)?.inq_att(varid, name) {
            Ok((t, l)) => out = bytes_from_i64s(&[t as i32 as i64, l]),
            Err(e) => code = e.code(),
        }
    }
    agree_code(ios, code)?;
    ios.my_comm()
        .broadcast(my_comm_root_with_backend(ios, file.iotype), &mut out);
    let vals = i64s_from_bytes(&out);
    Ok((PioType::from_i32(vals[0] as i32)?, vals[1]))
}

/// Name of the `attnum`-th attribute of a variable (or global).
pub fn inq_attname(ncid: i32, varid: i32, attnum: i32) -> Result<String> {
    let f = get_file(ncid)?;
    let file = f.borrow();
    let ios = file.ios()?;
    if ios.asynchronous && ios.compproc {
        return crate::msg::send_inq_attname(&ios, file.wire_ncid, varid, attnum);
    }
    inq_attname_local(&ios, &file, varid, attnum)
}

pub(crate) fn inq_attname_local(
    ios: &Rc<IoSystem>,
    file: &FileDesc,
    varid: i32,
    attnum: i32,
) -> Result<String> {
    let mut code = 0i32;
    let mut out = Vec::new();
    if file.do_io && ios.is_io_root() {
        match file
            .backend
            .as_ref()
            .ok_or(PioError::Io)?
            .inq_attname(varid, attnum)
        {
            Ok(n) => out = n.into_bytes(),
            Err(e) => code = e.code(),
        }
    }
    agree_code(ios, code)?;
    ios.my_comm()
        .broadcast(my_comm_root_with_backend(ios, file.iotype), &mut out);
    Ok(String::from_utf8_lossy(&out).to_string())
}

/// Attribute count of a variable (or of the file for `GLOBAL_ATT`).
pub(crate) fn inq_natts(file: &FileDesc, varid: i32) -> Result<i32> {
    let ios = file.ios()?;
    if ios.asynchronous && ios.compproc {
        return crate::msg::send_inq_natts(&ios, file.wire_ncid, varid);
    }
    inq_natts_local(&ios, file, varid)
}

pub(crate) fn inq_natts_local(ios: &Rc<IoSystem>, file: &FileDesc, varid: i32) -> Result<i32> {
    let mut out = Vec::new();
    if file.do_io && ios.is_io_root() {
        let be = file.backend.as_ref().ok_or(PioError::Io)?;
        let n = if varid == crate::backend::GLOBAL_ATT {
            be.inq()?.2
        } else {
            be.inq_var(varid)?.natts
        };
        out = n.to_ne_bytes().to_vec();
    }
    ios.my_comm()
        .broadcast(my_comm_root_with_backend(ios, file.iotype), &mut out);
    Ok(i32::from_ne_bytes(out[..4].try_into().unwrap()))
}

/// Copy one attribute between (possibly the same) open files.
pub fn copy_att(
    in_ncid: i32,
    in_varid: i32,
    name: &str,
    out_ncid: i32,
    out_varid: i32,
) -> Result<()> {
    let (xtype, _len) = inq_att(in_ncid, in_varid, name)?;
    let data = get_att_tc(in_ncid, in_varid, name, xtype)?;
    put_att_tc(out_ncid, out_varid, name, xtype, xtype, &data)
}
