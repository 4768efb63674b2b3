//! Distributed-array write and read.
//!
//! `write_darray` stages per-rank slices in the file's multi-variable
//! cache; slots are flushed through one rearrangement per decomposition
//! into backend region writes. `read_darray` runs the inverse path with
//! the io ranks reading regions and scattering them back.

use std::rc::Rc;
use std::sync::Arc;

use crate::backend::IoType;
use crate::comm::{Comm, tags};
use crate::decomp::{IoDesc, IoRegion, get_decomp};
use crate::error::{PioError, Result};
use crate::file::FileDesc;
use crate::iosystem::IoSystem;
use crate::mvcache::WriteMultiBuffer;
use crate::rearrange::{rearrange_comp2io, rearrange_io2comp};
use crate::stats::now_secs;
use crate::types::convert_buffer;

/// Stage one variable's distributed data for writing.
///
/// `data` holds `maplen` elements of the decomposition's type.
/// `fillvalue` (one element, same type) overrides the variable's fill for
/// hole filling. Collective over the iosystem.
pub fn write_darray(
    ncid: i32,
    varid: i32,
    ioid: i32,
    data: &[u8],
    fillvalue: Option<&[u8]>,
) -> Result<()> {
    let f = crate::file::get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    file.check_writable()?;
    let desc = get_decomp(ioid)?;
    if desc.iosysid != file.iosysid {
        return Err(PioError::BadId);
    }
    let esize = desc.mem_elem_size;
    if data.len() != desc.maplen * esize {
        return Err(PioError::InvalidArgument);
    }
    if let Some(fv) = fillvalue
        && fv.len() != esize
    {
        return Err(PioError::InvalidArgument);
    }
    let var = file.var(varid)?;
    let recordvar = var.rec_var;
    let frame = var.frame;
    if recordvar && frame < 0 {
        return Err(PioError::InvalidArgument);
    }

    // Flush first when the slot cannot absorb this variable: different
    // record flag, a duplicate (vid, frame), or the aggregate byte limit.
    let needs_flush = match file.mvcache.get(ioid) {
        Some(slot) => {
            slot.recordvar != recordvar
                || slot.arraylen != desc.maplen
                || slot
                    .vids
                    .iter()
                    .zip(&slot.frames)
                    .any(|(&v, &fr)| v == varid && fr == frame)
        }
        None => false,
    };
    let over_limit = file.mvcache.staged_bytes() + data.len() > crate::reqblock::buffer_size_limit();
    if needs_flush || over_limit {
        flush_staged(&ios, &mut file)?;
    }

    let fill = fillvalue.map(|f| f.to_vec()).unwrap_or_default();
    match file.mvcache.get_mut(ioid) {
        Some(slot) => {
            slot.vids.push(varid);
            slot.frames.push(frame);
            slot.fillvalues.push(fill);
            slot.data.extend_from_slice(data);
        }
        None => {
            file.mvcache.alloc(WriteMultiBuffer {
                ioid,
                recordvar,
                arraylen: desc.maplen,
                piotype: desc.piotype,
                vids: vec![varid],
                frames: vec![frame],
                fillvalues: vec![fill],
                data: data.to_vec(),
            });
        }
    }
    Ok(())
}

/// Write several variables sharing one decomposition in a single
/// rearrangement, bypassing the cache. Collective.
pub fn write_darray_multi(
    ncid: i32,
    ioid: i32,
    vids: &[i32],
    frames: &[i32],
    fillvalues: &[Vec<u8>],
    data: &[u8],
) -> Result<()> {
    let f = crate::file::get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    file.check_writable()?;
    let desc = get_decomp(ioid)?;
    if vids.len() != frames.len() || vids.len() != fillvalues.len() || vids.is_empty() {
        return Err(PioError::InvalidArgument);
    }
    if data.len() != vids.len() * desc.maplen * desc.mem_elem_size {
        return Err(PioError::InvalidArgument);
    }
    let recordvar = file.var(vids[0])?.rec_var;
    let slot = WriteMultiBuffer {
        ioid,
        recordvar,
        arraylen: desc.maplen,
        piotype: desc.piotype,
        vids: vids.to_vec(),
        frames: frames.to_vec(),
        fillvalues: fillvalues.to_vec(),
        data: data.to_vec(),
    };
    write_multi(&ios, &mut file, &desc, slot)
}

/// Flush every staged multi-variable slot of a file. Collective.
pub(crate) fn flush_staged(ios: &Rc<IoSystem>, file: &mut FileDesc) -> Result<()> {
    for ioid in file.mvcache.live_ioids() {
        let slot = file.mvcache.free(ioid).unwrap();
        let desc = get_decomp(ioid)?;
        write_multi(ios, file, &desc, slot)?;
    }
    Ok(())
}

fn write_multi(
    ios: &Rc<IoSystem>,
    file: &mut FileDesc,
    desc: &Rc<IoDesc>,
    slot: WriteMultiBuffer,
) -> Result<()> {
    if ios.asynchronous && ios.compproc {
        crate::msg::send_write_darray_multi(ios, file.wire_ncid, &slot)?;
    }
    exchange_and_write(ios, file, desc, slot)
}

/// The collective exchange half shared by compute callers and the io-side
/// message handler.
pub(crate) fn exchange_and_write(
    ios: &Rc<IoSystem>,
    file: &mut FileDesc,
    desc: &Rc<IoDesc>,
    slot: WriteMultiBuffer,
) -> Result<()> {
    let nvars = slot.num_arrays();
    let iobuf = rearrange_comp2io(ios, desc, &slot.data, nvars);
    if !ios.ioproc {
        return Ok(());
    }
    write_iobuf(ios, file, desc, &slot, &iobuf, nvars)
}

// Per-variable fill value as disk-type bytes.
fn disk_fill(file: &FileDesc, desc: &IoDesc, slot: &WriteMultiBuffer, v: usize) -> Result<Vec<u8>> {
    let var = file.var(slot.vids[v])?;
    if !slot.fillvalues[v].is_empty() {
        return convert_buffer(&slot.fillvalues[v], desc.piotype, var.piotype);
    }
    match &var.fillvalue {
        Some(f) => Ok(f.clone()),
        None => var.piotype.default_fill(),
    }
}

// (start, count) of one region adjusted for a record variable's frame.
fn region_slab(region: &IoRegion, recordvar: bool, frame: i32) -> (Vec<i64>, Vec<i64>) {
    if recordvar {
        let mut start = Vec::with_capacity(region.start.len() + 1);
        start.push(frame as i64);
        start.extend_from_slice(&region.start);
        let mut count = Vec::with_capacity(region.count.len() + 1);
        count.push(1);
        count.extend_from_slice(&region.count);
        (start, count)
    } else {
        (region.start.clone(), region.count.clone())
    }
}

// One write unit funneled to the backend: a slab plus its bytes.
struct RegionWrite {
    varid: i32,
    start: Vec<i64>,
    count: Vec<i64>,
    bytes: Vec<u8>,
}

fn encode_region_writes(writes: &[RegionWrite]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(writes.len() as u32).to_ne_bytes());
    for w in writes {
        out.extend_from_slice(&w.varid.to_ne_bytes());
        out.extend_from_slice(&(w.start.len() as u32).to_ne_bytes());
        for &s in &w.start {
            out.extend_from_slice(&s.to_ne_bytes());
        }
        for &c in &w.count {
            out.extend_from_slice(&c.to_ne_bytes());
        }
        out.extend_from_slice(&(w.bytes.len() as u64).to_ne_bytes());
        out.extend_from_slice(&w.bytes);
    }
    out
}

fn decode_region_writes(buf: &[u8]) -> Result<Vec<RegionWrite>> {
    let mut off = 0usize;
    let take = |off: &mut usize, n: usize| -> Result<&[u8]> {
        let s = buf.get(*off..*off + n).ok_or(PioError::Io)?;
        *off += n;
        Ok(s)
    };
    let n = u32::from_ne_bytes(take(&mut off, 4)?.try_into().unwrap()) as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let varid = i32::from_ne_bytes(take(&mut off, 4)?.try_into().unwrap());
        let nd = u32::from_ne_bytes(take(&mut off, 4)?.try_into().unwrap()) as usize;
        let mut start = Vec::with_capacity(nd);
        for _ in 0..nd {
            start.push(i64::from_ne_bytes(take(&mut off, 8)?.try_into().unwrap()));
        }
        let mut count = Vec::with_capacity(nd);
        for _ in 0..nd {
            count.push(i64::from_ne_bytes(take(&mut off, 8)?.try_into().unwrap()));
        }
        let nb = u64::from_ne_bytes(take(&mut off, 8)?.try_into().unwrap()) as usize;
        let bytes = take(&mut off, nb)?.to_vec();
        out.push(RegionWrite {
            varid,
            start,
            count,
            bytes,
        });
    }
    Ok(out)
}

// Build this io rank's write units for one flushed slot: fill regions
// first, then data regions, per variable.
fn build_region_writes(
    file: &FileDesc,
    desc: &IoDesc,
    slot: &WriteMultiBuffer,
    iobuf: &[u8],
    nvars: usize,
) -> Result<Vec<RegionWrite>> {
    let esize = desc.mem_elem_size;
    let mut writes = Vec::new();
    for v in 0..nvars {
        let var = file.var(slot.vids[v])?;
        let disk_type = var.piotype;
        let recordvar = slot.recordvar;
        let frame = slot.frames[v];

        if desc.needsfill {
            let fill = disk_fill(file, desc, slot, v)?;
            for region in &desc.fill_regions {
                let (start, count) = region_slab(region, recordvar, frame);
                let mut bytes = Vec::with_capacity(region.num_elem() * fill.len());
                for _ in 0..region.num_elem() {
                    bytes.extend_from_slice(&fill);
                }
                writes.push(RegionWrite {
                    varid: slot.vids[v],
                    start,
                    count,
                    bytes,
                });
            }
        }

        let block = &iobuf[v * desc.llen * esize..(v + 1) * desc.llen * esize];
        let converted = convert_buffer(block, desc.piotype, disk_type)?;
        let dsize = disk_type.disk_size()?;
        for region in &desc.regions {
            let (start, count) = region_slab(region, recordvar, frame);
            let bytes =
                converted[region.offset * dsize..(region.offset + region.num_elem()) * dsize]
                    .to_vec();
            writes.push(RegionWrite {
                varid: slot.vids[v],
                start,
                count,
                bytes,
            });
        }
    }
    Ok(writes)
}

fn write_iobuf(
    ios: &Rc<IoSystem>,
    file: &mut FileDesc,
    desc: &Rc<IoDesc>,
    slot: &WriteMultiBuffer,
    iobuf: &[u8],
    nvars: usize,
) -> Result<()> {
    let writes = build_region_writes(file, desc, slot, iobuf, nvars)?;
    let io_comm = Arc::clone(ios.io_comm.as_ref().ok_or(PioError::Io)?);
    let parallel = file.iotype.is_parallel();
    let t0 = now_secs();
    let mut written = 0u64;

    if parallel {
        // Every io rank writes its own regions.
        let nonblocking = file.iotype == IoType::Pnetcdf;
        for w in &writes {
            written += w.bytes.len() as u64;
            let nbytes = w.bytes.len();
            let be = file.backend.as_mut().ok_or(PioError::Io)?;
            if nonblocking {
                let req = be.put_vars_nb(w.varid, &w.start, &w.count, &[], &w.bytes)?;
                file.var_mut(w.varid)?.push_request(req, nbytes);
                file.wb_pend += nbytes;
            } else {
                be.put_vars(w.varid, &w.start, &w.count, &[], &w.bytes)?;
            }
        }
        if nonblocking {
            crate::reqblock::flush_output_buffer(file, false, 0)?;
        }
    } else if ios.io_rank == 0 {
        // Serial backend: the io master writes everyone's regions, rank by
        // rank, its own first.
        let mut all = writes;
        for r in 1..ios.num_iotasks {
            let buf = io_comm.recv(r, tags::DARRAY_SERIAL);
            all.extend(decode_region_writes(&buf)?);
        }
        for w in &all {
            written += w.bytes.len() as u64;
            let be = file.backend.as_mut().ok_or(PioError::Io)?;
            be.put_vars(w.varid, &w.start, &w.count, &[], &w.bytes)?;
        }
    } else {
        io_comm.send(0, tags::DARRAY_SERIAL, &encode_region_writes(&writes));
    }

    let dt = now_secs() - t0;
    file.stats.add_write(written, dt);
    for &vid in &slot.vids {
        file.var_mut(vid)?.bytes_written += written / nvars as u64;
    }
    Ok(())
}

/// Read one variable's distributed data into `out` (`maplen` elements of
/// the decomposition's type). Positions mapped to holes are left
/// untouched. Collective over the iosystem.
pub fn read_darray(ncid: i32, varid: i32, ioid: i32, out: &mut [u8]) -> Result<()> {
    let f = crate::file::get_file(ncid)?;
    let mut file = f.borrow_mut();
    let ios = file.ios()?;
    let desc = get_decomp(ioid)?;
    if desc.iosysid != file.iosysid {
        return Err(PioError::BadId);
    }
    if out.len() != desc.maplen * desc.mem_elem_size {
        return Err(PioError::InvalidArgument);
    }
    // A read must observe everything staged so far.
    flush_staged(&ios, &mut file)?;
    crate::reqblock::flush_output_buffer(&mut file, true, 0)?;

    if ios.asynchronous && ios.compproc {
        crate::msg::send_read_darray(&ios, file.wire_ncid, varid, ioid)?;
        rearrange_io2comp(&ios, &desc, &[], 1, out);
        return Ok(());
    }
    read_darray_local(&ios, &mut file, varid, &desc, out)
}

pub(crate) fn read_darray_local(
    ios: &Rc<IoSystem>,
    file: &mut FileDesc,
    varid: i32,
    desc: &Rc<IoDesc>,
    out: &mut [u8],
) -> Result<()> {
    let iobuf = if ios.ioproc {
        read_iobuf(ios, file, varid, desc)?
    } else {
        Vec::new()
    };
    rearrange_io2comp(ios, desc, &iobuf, 1, out);
    Ok(())
}

// Assemble this io rank's `llen` elements (decomposition type) from the
// backend.
fn read_iobuf(
    ios: &Rc<IoSystem>,
    file: &mut FileDesc,
    varid: i32,
    desc: &Rc<IoDesc>,
) -> Result<Vec<u8>> {
    let var = file.var(varid)?;
    let disk_type = var.piotype;
    let dsize = disk_type.disk_size()?;
    let recordvar = var.rec_var;
    let frame = var.frame.max(0);
    let esize = desc.mem_elem_size;
    let io_comm = Arc::clone(ios.io_comm.as_ref().ok_or(PioError::Io)?);
    let parallel = file.iotype.is_parallel();
    let t0 = now_secs();

    let mut disk_buf = vec![0u8; desc.llen * dsize];
    if parallel {
        let be = file.backend.as_ref().ok_or(PioError::Io)?;
        for region in &desc.regions {
            let (start, count) = region_slab(region, recordvar, frame);
            let bytes = be.get_vars(varid, &start, &count, &[])?;
            disk_buf[region.offset * dsize..(region.offset + region.num_elem()) * dsize]
                .copy_from_slice(&bytes);
        }
    } else if ios.io_rank == 0 {
        let be = file.backend.as_ref().ok_or(PioError::Io)?;
        for region in &desc.regions {
            let (start, count) = region_slab(region, recordvar, frame);
            let bytes = be.get_vars(varid, &start, &count, &[])?;
            disk_buf[region.offset * dsize..(region.offset + region.num_elem()) * dsize]
                .copy_from_slice(&bytes);
        }
        // Serve the other io ranks' region lists.
        for r in 1..ios.num_iotasks {
            let req = io_comm.recv(r, tags::DARRAY_SERIAL);
            let regions = decode_region_requests(&req)?;
            let mut reply = Vec::new();
            for (start, count) in &regions {
                reply.extend_from_slice(&be.get_vars(varid, start, count, &[])?);
            }
            io_comm.send(r, tags::DARRAY_SERIAL, &reply);
        }
    } else {
        let mut req = Vec::new();
        let slabs: Vec<(Vec<i64>, Vec<i64>)> = desc
            .regions
            .iter()
            .map(|rg| region_slab(rg, recordvar, frame))
            .collect();
        encode_region_requests(&mut req, &slabs);
        io_comm.send(0, tags::DARRAY_SERIAL, &req);
        let reply = io_comm.recv(0, tags::DARRAY_SERIAL);
        let mut off = 0usize;
        for region in &desc.regions {
            let n = region.num_elem() * dsize;
            disk_buf[region.offset * dsize..(region.offset + region.num_elem()) * dsize]
                .copy_from_slice(&reply[off..off + n]);
            off += n;
        }
    }

    let dt = now_secs() - t0;
    file.stats.add_read(disk_buf.len() as u64, dt);
    file.var_mut(varid)?.bytes_read += disk_buf.len() as u64;

    let membuf = convert_buffer(&disk_buf, disk_type, desc.piotype)?;
    debug_assert_eq!(membuf.len(), desc.llen * esize);
    Ok(membuf)
}

fn encode_region_requests(out: &mut Vec<u8>, slabs: &[(Vec<i64>, Vec<i64>)]) {
    out.extend_from_slice(&(slabs.len() as u32).to_ne_bytes());
    for (start, count) in slabs {
        out.extend_from_slice(&(start.len() as u32).to_ne_bytes());
        for &s in start {
            out.extend_from_slice(&s.to_ne_bytes());
        }
        for &c in count {
            out.extend_from_slice(&c.to_ne_bytes());
        }
    }
}

fn decode_region_requests(buf: &[u8]) -> Result<Vec<(Vec<i64>, Vec<i64>)>> {
    let mut off = 0usize;
    let take = |off: &mut usize, n: usize| -> Result<&[u8]> {
        let s = buf.get(*off..*off + n).ok_or(PioError::Io)?;
        *off += n;
        Ok(s)
    };
    let n = u32::from_ne_bytes(take(&mut off, 4)?.try_into().unwrap()) as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let nd = u32::from_ne_bytes(take(&mut off, 4)?.try_into().unwrap()) as usize;
        let mut start = Vec::with_capacity(nd);
        for _ in 0..nd {
            start.push(i64::from_ne_bytes(take(&mut off, 8)?.try_into().unwrap()));
        }
        let mut count = Vec::with_capacity(nd);
        for _ in 0..nd {
            count.push(i64::from_ne_bytes(take(&mut off, 8)?.try_into().unwrap()));
        }
        out.push((start, count));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_slab_record_var() {
        let region = IoRegion {
            start: vec![2, 0],
            count: vec![1, 4],
            offset: 0,
        };
        let (s, c) = region_slab(&region, true, 7);
        assert_eq!(s, vec![7, 2, 0]);
        assert_eq!(c, vec![1, 1, 4]);
        let (s, c) = region_slab(&region, false, 7);
        assert_eq!(s, vec![2, 0]);
        assert_eq!(c, vec![1, 4]);
    }

    #[test]
    fn test_region_writes_roundtrip() {
        let writes = vec![
            RegionWrite {
                varid: 3,
                start: vec![0, 4],
                count: vec![1, 2],
                bytes: vec![1, 2, 3, 4],
            },
            RegionWrite {
                varid: 0,
                start: vec![9],
                count: vec![1],
                bytes: vec![],
            },
        ];
        let decoded = decode_region_writes(&encode_region_writes(&writes)).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].varid, 3);
        assert_eq!(decoded[0].start, vec![0, 4]);
        assert_eq!(decoded[0].count, vec![1, 2]);
        assert_eq!(decoded[0].bytes, vec![1, 2, 3, 4]);
        assert_eq!(decoded[1].count, vec![1]);
        assert!(decoded[1].bytes.is_empty());
    }

    #[test]
    fn test_region_requests_roundtrip() {
        let slabs = vec![(vec![1i64, 2], vec![3i64, 4]), (vec![0], vec![16])];
        let mut buf = Vec::new();
        encode_region_requests(&mut buf, &slabs);
        assert_eq!(decode_region_requests(&buf).unwrap(), slabs);
    }
}
