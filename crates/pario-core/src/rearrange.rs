//! BOX and SUBSET rearrangers.
//!
//! Both algorithms end with the same post-condition: each io rank owns a
//! set of `(start, count)` regions of the global array, an io-side element
//! count `llen`, and per-peer send/receive metadata consumed by the
//! flow-controlled exchange.

use std::collections::HashSet;
use std::rc::Rc;

use crate::comm::{Comm, ReduceOp, bytes_from_i64s, i64s_from_bytes};
use crate::decomp::{IoDesc, IoRegion};
use crate::error::{PioError, Result};
use crate::iosystem::{IoSystem, REARR_UNLIMITED_PEND_REQ, RearrDirOpts, Rearranger};
use crate::swapm::swapm;
use crate::types::PioType;

/// Flow control used for the init-time metadata exchange: always dense.
fn no_fc() -> RearrDirOpts {
    RearrDirOpts {
        handshake: false,
        isend: false,
        max_pending_reqs: REARR_UNLIMITED_PEND_REQ,
    }
}

/// Multi-dim coordinates of a 0-based linear offset, row-major.
pub fn unflatten(gdims: &[i64], lin: i64) -> Vec<i64> {
    let mut coords = vec![0i64; gdims.len()];
    let mut rem = lin;
    for d in (0..gdims.len()).rev() {
        coords[d] = rem % gdims[d];
        rem /= gdims[d];
    }
    coords
}

/// Row-major linear offset of multi-dim coordinates.
pub fn flatten(gdims: &[i64], coords: &[i64]) -> i64 {
    let mut lin = 0i64;
    for d in 0..gdims.len() {
        lin = lin * gdims[d] + coords[d];
    }
    lin
}

/// Partition the global array into one contiguous slab per io task with a
/// greedy split of the leading dimensions, keeping slabs aspect-balanced.
/// Tasks beyond the splittable element count get empty slabs.
pub fn calc_start_count(gdims: &[i64], ntasks: usize) -> Vec<(Vec<i64>, Vec<i64>)> {
    let ndims = gdims.len();
    let mut out: Vec<(Vec<i64>, Vec<i64>)> = Vec::with_capacity(ntasks);

    // Divide `ntasks` over rows of dimension `dim` inside the slab rooted
    // at `start`; recurse into the next dimension when tasks outnumber
    // rows.
    fn split(
        gdims: &[i64],
        start: Vec<i64>,
        dim: usize,
        ntasks: usize,
        out: &mut Vec<(Vec<i64>, Vec<i64>)>,
    ) {
        let ndims = gdims.len();
        let rows = gdims[dim];
        if (ntasks as i64) <= rows {
            // Near-equal runs of whole rows; each run is one slab.
            let base = rows / ntasks as i64;
            let extra = rows % ntasks as i64;
            let mut row = 0i64;
            for t in 0..ntasks {
                let n = base + if (t as i64) < extra { 1 } else { 0 };
                let mut s = start.clone();
                s[dim] = row;
                let mut c: Vec<i64> = gdims.to_vec();
                c[..dim].fill(1);
                c[dim] = n;
                out.push((s, c));
                row += n;
            }
        } else if dim + 1 < ndims {
            // One group of tasks per row, splitting the next dimension.
            let base = ntasks / rows as usize;
            let extra = ntasks % rows as usize;
            for r in 0..rows {
                let n = base + if r < extra as i64 { 1 } else { 0 };
                let mut s = start.clone();
                s[dim] = r;
                if n > 0 {
                    split(gdims, s, dim + 1, n, out);
                }
            }
        } else {
            // Innermost dimension with more tasks than elements: the
            // surplus tasks own nothing.
            let rows = rows as usize;
            split(gdims, start.clone(), dim, rows, out);
            for _ in rows..ntasks {
                out.push((start.clone(), vec![0i64; ndims]));
            }
        }
    }

    split(gdims, vec![0i64; ndims], 0, ntasks, &mut out);
    debug_assert_eq!(out.len(), ntasks);
    out
}

fn box_contains(start: &[i64], count: &[i64], coords: &[i64]) -> bool {
    start
        .iter()
        .zip(count)
        .zip(coords)
        .all(|((&s, &c), &x)| x >= s && x < s + c)
}

/// Carve one `(start, count)` box off the front of a consecutive linear
/// run of `len` elements beginning at `start_lin`. Returns the box and how
/// many elements it consumed.
fn box_from_run(gdims: &[i64], start_lin: i64, len: i64) -> (Vec<i64>, Vec<i64>, i64) {
    let ndims = gdims.len();
    let coords = unflatten(gdims, start_lin);
    let mut count = vec![1i64; ndims];

    let inner = ndims - 1;
    let avail = gdims[inner] - coords[inner];
    let c = len.min(avail);
    count[inner] = c;
    let mut consumed = c;

    // Grow outward while whole inner rows line up.
    let mut d = inner;
    while d > 0 && coords[d] == 0 && count[d] == gdims[d] {
        d -= 1;
        let rowsize: i64 = gdims[d + 1..].iter().product();
        let nrows = (len / rowsize).min(gdims[d] - coords[d]);
        if nrows <= 1 {
            break;
        }
        count[d] = nrows;
        consumed = nrows * rowsize;
    }

    (coords, count, consumed)
}

/// Extract the minimum set of `(start, count)` boxes covering exactly the
/// sorted 0-based offsets, in file order.
pub fn find_regions(gdims: &[i64], sorted_offsets: &[i64]) -> Vec<IoRegion> {
    let mut regions = Vec::new();
    let mut pos = 0usize;
    while pos < sorted_offsets.len() {
        // Greatest arithmetic run with step 1 starting here.
        let mut run = 1usize;
        while pos + run < sorted_offsets.len()
            && sorted_offsets[pos + run] == sorted_offsets[pos] + run as i64
        {
            run += 1;
        }
        let mut consumed_total = 0i64;
        while (consumed_total as usize) < run {
            let lin = sorted_offsets[pos] + consumed_total;
            let (start, count, consumed) =
                box_from_run(gdims, lin, run as i64 - consumed_total);
            regions.push(IoRegion {
                start,
                count,
                offset: pos + consumed_total as usize,
            });
            consumed_total += consumed;
        }
        pos += run;
    }
    regions
}

// Collect the BOX slabs on every rank: either the computed partition, or
// the caller-pinned start/count gathered from the io ranks.
fn gather_boxes(
    ios: &IoSystem,
    dimlen: &[i64],
    io_start: Option<&[i64]>,
    io_count: Option<&[i64]>,
) -> Result<Vec<(Vec<i64>, Vec<i64>)>> {
    if io_start.is_none() {
        return Ok(calc_start_count(dimlen, ios.num_iotasks as usize));
    }
    let ndims = dimlen.len();
    let mut part = Vec::new();
    if ios.ioproc {
        part.extend_from_slice(&bytes_from_i64s(&[ios.io_rank as i64]));
        part.extend_from_slice(&bytes_from_i64s(io_start.unwrap()));
        part.extend_from_slice(&bytes_from_i64s(io_count.unwrap()));
    }
    let blocks = ios.union_comm.allgather_bytes(&part);
    let mut boxes = vec![(vec![0i64; ndims], vec![0i64; ndims]); ios.num_iotasks as usize];
    let mut seen = 0;
    for b in blocks {
        if b.is_empty() {
            continue;
        }
        let vals = i64s_from_bytes(&b);
        if vals.len() != 1 + 2 * ndims {
            return Err(PioError::InvalidArgument);
        }
        let t = vals[0] as usize;
        boxes[t] = (
            vals[1..1 + ndims].to_vec(),
            vals[1 + ndims..].to_vec(),
        );
        seen += 1;
    }
    if seen != ios.num_iotasks {
        return Err(PioError::InvalidArgument);
    }
    Ok(boxes)
}

/// Build the full exchange description for a freshly validated map.
/// Collective over the iosystem's union communicator.
#[allow(clippy::too_many_arguments)]
pub fn build_decomp(
    ios: &Rc<IoSystem>,
    ioid: i32,
    piotype: PioType,
    dimlen: &[i64],
    map: &[i64],
    rearranger: Rearranger,
    io_start: Option<&[i64]>,
    io_count: Option<&[i64]>,
) -> Result<IoDesc> {
    let union = &ios.union_comm;
    let usize_ = union.size() as usize;
    let nio = ios.num_iotasks as usize;
    let ndims = dimlen.len();
    let total: i64 = dimlen.iter().product();

    // Destination io task for every non-hole local element.
    let boxes = match rearranger {
        Rearranger::Box => Some(gather_boxes(ios, dimlen, io_start, io_count)?),
        Rearranger::Subset => None,
    };
    let mut per_task: Vec<Vec<usize>> = vec![Vec::new(); nio];
    if ios.compproc {
        match rearranger {
            Rearranger::Box => {
                let boxes = boxes.as_ref().unwrap();
                for (i, &m) in map.iter().enumerate() {
                    if m == 0 {
                        continue;
                    }
                    let coords = unflatten(dimlen, m - 1);
                    let t = boxes
                        .iter()
                        .position(|(s, c)| box_contains(s, c, &coords))
                        .ok_or(PioError::InvalidArgument)?;
                    per_task[t].push(i);
                }
            }
            Rearranger::Subset => {
                // Compute ranks partition into disjoint subsets, one per
                // io task; every element of this rank goes to its subset's
                // io task.
                let t = (ios.comp_rank as usize * nio) / ios.num_comptasks as usize;
                for (i, &m) in map.iter().enumerate() {
                    if m != 0 {
                        per_task[t].push(i);
                    }
                }
            }
        }
    }

    let scount: Vec<i32> = per_task.iter().map(|v| v.len() as i32).collect();
    let sindex: Vec<usize> = per_task.iter().flatten().copied().collect();

    // Tell every io rank how much is coming from each union rank.
    let mut send_counts = vec![0i32; usize_];
    for t in 0..nio {
        send_counts[ios.io_ranks[t] as usize] = scount[t];
    }
    let recv_counts = union.alltoall_i32(&send_counts);

    // Ship the global offsets themselves so each io rank can order its
    // receive stream into file order.
    let mut sendbufs: Vec<Vec<u8>> = vec![Vec::new(); usize_];
    for t in 0..nio {
        if scount[t] > 0 {
            let offs: Vec<i64> = per_task[t].iter().map(|&i| map[i]).collect();
            sendbufs[ios.io_ranks[t] as usize] = bytes_from_i64s(&offs);
        }
    }
    let will_recv: Vec<bool> = (0..usize_)
        .map(|u| ios.ioproc && recv_counts[u] > 0 && u as i32 != union.rank())
        .collect();
    let recvd = swapm(union, sendbufs, &will_recv, &no_fc());

    // Io-side aggregation, sender-major in rank order.
    let mut rfrom = Vec::new();
    let mut rcount = Vec::new();
    let mut gmap: Vec<i64> = Vec::new();
    if ios.ioproc {
        for u in 0..usize_ {
            if recv_counts[u] > 0 {
                rfrom.push(u as i32);
                rcount.push(recv_counts[u]);
                gmap.extend(i64s_from_bytes(&recvd[u]));
            }
        }
    }
    let llen = gmap.len();

    // Sort the aggregated map into file order, remembering the
    // permutation when it arrived non-monotonic.
    let mut order: Vec<usize> = (0..llen).collect();
    order.sort_by_key(|&j| gmap[j]);
    let needssort = !gmap.windows(2).all(|w| w[0] <= w[1]);
    let mut rindex = vec![0usize; llen];
    for (k, &j) in order.iter().enumerate() {
        rindex[j] = k;
    }
    let sorted_gmap: Vec<i64> = order.iter().map(|&j| gmap[j] - 1).collect();
    let remap = if needssort { order } else { Vec::new() };

    let regions = find_regions(dimlen, &sorted_gmap);

    // Holes exist when the union of contributed offsets does not cover the
    // array.
    let my_nonhole = if ios.compproc {
        map.iter().filter(|&&m| m != 0).count() as i64
    } else {
        0
    };
    let covered = union.allreduce_i64(ReduceOp::Sum, &[my_nonhole])[0];
    let needsfill = covered < total;

    // needsfill is agreed collectively above, so every io rank enters the
    // (io-collective) subset hole discovery together.
    let fill_regions = if needsfill && ios.ioproc {
        match rearranger {
            Rearranger::Box => {
                let (bs, bc) = &boxes.as_ref().unwrap()[ios.io_rank as usize];
                box_holes(dimlen, bs, bc, &sorted_gmap)
            }
            Rearranger::Subset => subset_holes(ios, dimlen, total, &sorted_gmap),
        }
    } else {
        Vec::new()
    };

    let maxregions =
        union.allreduce_i64(ReduceOp::Max, &[regions.len() as i64])[0] as usize;
    let active = if ios.ioproc && (llen > 0 || !fill_regions.is_empty()) {
        1i64
    } else {
        0
    };
    let num_aiotasks = union.allreduce_i64(ReduceOp::Sum, &[active])[0] as i32;

    Ok(IoDesc {
        ioid,
        iosysid: ios.iosysid,
        piotype,
        ndims,
        dimlen: dimlen.to_vec(),
        rearranger,
        maplen: map.len(),
        map: map.to_vec(),
        mem_elem_size: piotype.mem_size()?,
        disk_elem_size: piotype.disk_size()?,
        scount,
        sindex,
        rfrom,
        rcount,
        rindex,
        llen,
        regions,
        fill_regions,
        maxregions,
        needsfill,
        needssort,
        remap,
        num_aiotasks,
    })
}

// Holes inside one BOX slab: the slab's offsets minus the data offsets.
fn box_holes(
    gdims: &[i64],
    bstart: &[i64],
    bcount: &[i64],
    sorted_gmap: &[i64],
) -> Vec<IoRegion> {
    if bcount.iter().any(|&c| c == 0) {
        return Vec::new();
    }
    let have: HashSet<i64> = sorted_gmap.iter().copied().collect();
    let mut holes = Vec::new();
    let mut coords = bstart.to_vec();
    loop {
        let lin = flatten(gdims, &coords);
        if !have.contains(&lin) {
            holes.push(lin);
        }
        // Odometer step over the slab.
        let mut d = gdims.len();
        loop {
            if d == 0 {
                return find_regions(gdims, &holes);
            }
            d -= 1;
            coords[d] += 1;
            if coords[d] < bstart[d] + bcount[d] {
                break;
            }
            coords[d] = bstart[d];
        }
    }
}

// Holes for the SUBSET rearranger: io ranks allgather their aggregated
// maps, materialise the global hole grid, and each takes a near-equal
// slice. Collective over the io communicator.
fn subset_holes(ios: &IoSystem, gdims: &[i64], total: i64, sorted_gmap: &[i64]) -> Vec<IoRegion> {
    let io_comm = ios.io_comm.as_ref().expect("subset holes on io rank");
    let blocks = io_comm.allgather_bytes(&bytes_from_i64s(sorted_gmap));
    let mut covered: Vec<i64> = blocks.iter().flat_map(|b| i64s_from_bytes(b)).collect();
    covered.sort_unstable();
    covered.dedup();

    let mut holes: Vec<i64> = Vec::with_capacity((total as usize).saturating_sub(covered.len()));
    let mut c = 0usize;
    for lin in 0..total {
        if c < covered.len() && covered[c] == lin {
            c += 1;
        } else {
            holes.push(lin);
        }
    }

    let nio = ios.num_iotasks as i64;
    let t = ios.io_rank as i64;
    let nholes = holes.len() as i64;
    let lo = (t * nholes / nio) as usize;
    let hi = ((t + 1) * nholes / nio) as usize;
    find_regions(gdims, &holes[lo..hi])
}

// Copy one element of `esize` bytes.
#[inline]
fn copy_elem(dst: &mut [u8], dst_idx: usize, src: &[u8], src_idx: usize, esize: usize) {
    dst[dst_idx * esize..(dst_idx + 1) * esize]
        .copy_from_slice(&src[src_idx * esize..(src_idx + 1) * esize]);
}

/// Move `nvars` variables' worth of compute-side data into io-side layout.
///
/// `sbuf` holds `nvars * maplen` elements, variable-major; the result holds
/// `nvars * llen` elements on io ranks (empty elsewhere), ordered by global
/// offset within each variable block. One call moves every staged variable
/// in a single exchange. Collective over the union communicator.
pub fn rearrange_comp2io(
    ios: &IoSystem,
    desc: &IoDesc,
    sbuf: &[u8],
    nvars: usize,
) -> Vec<u8> {
    let union = &ios.union_comm;
    let usize_ = union.size() as usize;
    let esize = desc.mem_elem_size;
    let fc = ios.rearr_opts.borrow().effective(true);

    // Pack per-destination messages: [var][element in sindex order].
    let mut sendbufs: Vec<Vec<u8>> = vec![Vec::new(); usize_];
    let mut si = 0usize;
    for t in 0..desc.scount.len() {
        let cnt = desc.scount[t] as usize;
        if cnt == 0 {
            continue;
        }
        let mut buf = vec![0u8; nvars * cnt * esize];
        for v in 0..nvars {
            for j in 0..cnt {
                copy_elem(
                    &mut buf,
                    v * cnt + j,
                    sbuf,
                    v * desc.maplen + desc.sindex[si + j],
                    esize,
                );
            }
        }
        si += cnt;
        sendbufs[ios.io_ranks[t] as usize] = buf;
    }

    let me = union.rank();
    let mut will_recv = vec![false; usize_];
    for (k, &u) in desc.rfrom.iter().enumerate() {
        if u != me {
            will_recv[u as usize] = desc.rcount[k] > 0;
        }
    }
    let recvd = swapm(union, sendbufs, &will_recv, &fc);

    if !ios.ioproc {
        return Vec::new();
    }
    let mut iobuf = vec![0u8; nvars * desc.llen * esize];
    let mut stream = 0usize;
    for (k, &u) in desc.rfrom.iter().enumerate() {
        let cnt = desc.rcount[k] as usize;
        let m = &recvd[u as usize];
        for v in 0..nvars {
            for j in 0..cnt {
                copy_elem(
                    &mut iobuf,
                    v * desc.llen + desc.rindex[stream + j],
                    m,
                    v * cnt + j,
                    esize,
                );
            }
        }
        stream += cnt;
    }
    iobuf
}

/// Inverse of [`rearrange_comp2io`]: scatter io-side data back into the
/// compute-side layout. Elements at map holes are left untouched.
/// Collective over the union communicator.
pub fn rearrange_io2comp(
    ios: &IoSystem,
    desc: &IoDesc,
    iobuf: &[u8],
    nvars: usize,
    out: &mut [u8],
) {
    let union = &ios.union_comm;
    let usize_ = union.size() as usize;
    let esize = desc.mem_elem_size;
    let fc = ios.rearr_opts.borrow().effective(false);

    // Io side packs one message per original sender.
    let mut sendbufs: Vec<Vec<u8>> = vec![Vec::new(); usize_];
    if ios.ioproc {
        let mut stream = 0usize;
        for (k, &u) in desc.rfrom.iter().enumerate() {
            let cnt = desc.rcount[k] as usize;
            let mut buf = vec![0u8; nvars * cnt * esize];
            for v in 0..nvars {
                for j in 0..cnt {
                    copy_elem(
                        &mut buf,
                        v * cnt + j,
                        iobuf,
                        v * desc.llen + desc.rindex[stream + j],
                        esize,
                    );
                }
            }
            stream += cnt;
            sendbufs[u as usize] = buf;
        }
    }

    let me = union.rank();
    let mut will_recv = vec![false; usize_];
    for t in 0..desc.scount.len() {
        let u = ios.io_ranks[t];
        if desc.scount[t] > 0 && u != me {
            will_recv[u as usize] = true;
        }
    }
    let recvd = swapm(union, sendbufs, &will_recv, &fc);

    if !ios.compproc {
        return;
    }
    let mut si = 0usize;
    for t in 0..desc.scount.len() {
        let cnt = desc.scount[t] as usize;
        if cnt == 0 {
            continue;
        }
        let m = &recvd[ios.io_ranks[t] as usize];
        for v in 0..nvars {
            for j in 0..cnt {
                copy_elem(
                    out,
                    v * desc.maplen + desc.sindex[si + j],
                    m,
                    v * cnt + j,
                    esize,
                );
            }
        }
        si += cnt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unflatten_flatten_roundtrip() {
        let gdims = vec![3i64, 4, 5];
        for lin in [0i64, 7, 19, 59] {
            assert_eq!(flatten(&gdims, &unflatten(&gdims, lin)), lin);
        }
        assert_eq!(unflatten(&gdims, 23), vec![1, 0, 3]);
    }

    #[test]
    fn test_calc_start_count_1d() {
        let boxes = calc_start_count(&[10], 3);
        assert_eq!(boxes[0], (vec![0], vec![4]));
        assert_eq!(boxes[1], (vec![4], vec![3]));
        assert_eq!(boxes[2], (vec![7], vec![3]));
    }

    #[test]
    fn test_calc_start_count_covers_exactly() {
        for (gdims, ntasks) in [
            (vec![7i64, 5], 3usize),
            (vec![4, 4], 8),
            (vec![2, 3, 4], 5),
            (vec![16], 16),
            (vec![3], 7),
        ] {
            let boxes = calc_start_count(&gdims, ntasks);
            assert_eq!(boxes.len(), ntasks);
            let mut seen = HashSet::new();
            for (s, c) in &boxes {
                if c.iter().any(|&x| x == 0) {
                    continue;
                }
                let mut coords = s.clone();
                loop {
                    assert!(seen.insert(flatten(&gdims, &coords)), "overlap");
                    let mut d = gdims.len();
                    let mut done = false;
                    loop {
                        if d == 0 {
                            done = true;
                            break;
                        }
                        d -= 1;
                        coords[d] += 1;
                        if coords[d] < s[d] + c[d] {
                            break;
                        }
                        coords[d] = s[d];
                    }
                    if done {
                        break;
                    }
                }
            }
            let total: i64 = gdims.iter().product();
            assert_eq!(seen.len() as i64, total, "coverage for {gdims:?}/{ntasks}");
        }
    }

    #[test]
    fn test_find_regions_single_contiguous() {
        let regions = find_regions(&[16], &[4, 5, 6, 7]);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start, vec![4]);
        assert_eq!(regions[0].count, vec![4]);
        assert_eq!(regions[0].offset, 0);
    }

    #[test]
    fn test_find_regions_with_gaps() {
        let regions = find_regions(&[16], &[0, 1, 5, 6, 7, 12]);
        assert_eq!(regions.len(), 3);
        assert_eq!((regions[0].start[0], regions[0].count[0], regions[0].offset), (0, 2, 0));
        assert_eq!((regions[1].start[0], regions[1].count[0], regions[1].offset), (5, 3, 2));
        assert_eq!((regions[2].start[0], regions[2].count[0], regions[2].offset), (12, 1, 5));
    }

    #[test]
    fn test_find_regions_2d_full_rows() {
        // Offsets 0..12 in a 4x4 array: three full rows -> one region.
        let offs: Vec<i64> = (0..12).collect();
        let regions = find_regions(&[4, 4], &offs);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start, vec![0, 0]);
        assert_eq!(regions[0].count, vec![3, 4]);
    }

    #[test]
    fn test_find_regions_2d_unaligned_run() {
        // Offsets 2..6 in a 4x4 array span a row boundary: two boxes.
        let offs: Vec<i64> = (2..6).collect();
        let regions = find_regions(&[4, 4], &offs);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].start, vec![0, 2]);
        assert_eq!(regions[0].count, vec![1, 2]);
        assert_eq!(regions[1].start, vec![1, 0]);
        assert_eq!(regions[1].count, vec![1, 2]);
        assert_eq!(regions[1].offset, 2);
    }

    #[test]
    fn test_region_covers_every_offset_exactly() {
        let offs = vec![1i64, 2, 3, 8, 9, 20, 30, 31, 32, 33];
        let gdims = vec![5i64, 10];
        let regions = find_regions(&gdims, &offs);
        let mut covered = Vec::new();
        for r in &regions {
            let mut coords = r.start.clone();
            for _ in 0..r.num_elem() {
                covered.push(flatten(&gdims, &coords));
                let mut d = gdims.len();
                loop {
                    if d == 0 {
                        break;
                    }
                    d -= 1;
                    coords[d] += 1;
                    if coords[d] < r.start[d] + r.count[d] {
                        break;
                    }
                    coords[d] = r.start[d];
                }
            }
        }
        covered.sort_unstable();
        assert_eq!(covered, offs);
    }
}

