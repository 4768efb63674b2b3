//! Decomposition persistence: a line-oriented text form and a
//! self-describing container form. Both round-trip a registered
//! decomposition; the container form re-registers under a fresh ioid on
//! read.

use std::fs;
use std::io::Write;
use std::sync::Arc;

use crate::backend::{GLOBAL_ATT, IoType, OpenMode};
use crate::comm::{Comm, bytes_from_i64s, i64s_from_bytes};
use crate::decomp::get_decomp;
use crate::error::{PioError, Result};
use crate::file;
use crate::getput;
use crate::iosystem::get_iosystem;
use crate::types::{FILL_INT, PioType};

/// Format version shared by both persistence forms.
pub const DECOMP_VERSION: i32 = 2001;

/// Write the text form. Rank 0 of the compute communicator gathers every
/// rank's map point-to-point and writes the whole file.
pub fn write_map_file(iosysid: i32, fname: &str, ioid: i32) -> Result<()> {
    let ios = get_iosystem(iosysid)?;
    let desc = get_decomp(ioid)?;
    let comm = ios.my_comm();
    let me = comm.rank();
    let npes = comm.size();

    if me == 0 {
        let mut out = String::new();
        out.push_str(&format!(
            "version {} npes {} ndims {}\n",
            DECOMP_VERSION, npes, desc.ndims
        ));
        let dims: Vec<String> = desc.dimlen.iter().map(|d| d.to_string()).collect();
        out.push_str(&dims.join(" "));
        out.push('\n');

        for r in 0..npes {
            let map = if r == 0 {
                desc.map.clone()
            } else {
                i64s_from_bytes(&comm.recv(r, crate::comm::tags::DECOMP_GATHER))
            };
            out.push_str(&format!("{} {}\n", r, map.len()));
            let offs: Vec<String> = map.iter().map(|m| m.to_string()).collect();
            out.push_str(&offs.join(" "));
            out.push('\n');
        }

        let mut f = fs::File::create(fname)?;
        f.write_all(out.as_bytes())?;
    } else {
        comm.send(0, crate::comm::tags::DECOMP_GATHER, &bytes_from_i64s(&desc.map));
    }
    Ok(())
}

/// Read the text form back; every rank gets its own map slice. The
/// communicator must have as many ranks as the file records.
pub fn read_map_file(comm: &Arc<dyn Comm>, fname: &str) -> Result<(Vec<i64>, Vec<i64>)> {
    let me = comm.rank();
    let mut header = Vec::new();
    let mut my_map = Vec::new();

    if me == 0 {
        let text = fs::read_to_string(fname)?;
        let mut lines = text.lines();
        let first = lines.next().ok_or(PioError::InvalidArgument)?;
        let toks: Vec<&str> = first.split_whitespace().collect();
        if toks.len() != 6 || toks[0] != "version" || toks[2] != "npes" || toks[4] != "ndims" {
            return Err(PioError::InvalidArgument);
        }
        let version: i32 = toks[1].parse().map_err(|_| PioError::InvalidArgument)?;
        if version != DECOMP_VERSION {
            return Err(PioError::InvalidArgument);
        }
        let npes: i32 = toks[3].parse().map_err(|_| PioError::InvalidArgument)?;
        let ndims: usize = toks[5].parse().map_err(|_| PioError::InvalidArgument)?;
        if npes != comm.size() {
            return Err(PioError::InvalidArgument);
        }

        let dim_line = lines.next().ok_or(PioError::InvalidArgument)?;
        let gdims: Vec<i64> = dim_line
            .split_whitespace()
            .map(|t| t.parse().map_err(|_| PioError::InvalidArgument))
            .collect::<Result<_>>()?;
        if gdims.len() != ndims {
            return Err(PioError::InvalidArgument);
        }

        for r in 0..npes {
            let hdr = lines.next().ok_or(PioError::InvalidArgument)?;
            let ht: Vec<&str> = hdr.split_whitespace().collect();
            if ht.len() != 2 || ht[0].parse::<i32>().ok() != Some(r) {
                return Err(PioError::InvalidArgument);
            }
            let maplen: usize = ht[1].parse().map_err(|_| PioError::InvalidArgument)?;
            let map: Vec<i64> = if maplen == 0 {
                lines.next();
                Vec::new()
            } else {
                let line = lines.next().ok_or(PioError::InvalidArgument)?;
                line.split_whitespace()
                    .map(|t| t.parse().map_err(|_| PioError::InvalidArgument))
                    .collect::<Result<_>>()?
            };
            if map.len() != maplen {
                return Err(PioError::InvalidArgument);
            }
            if r == 0 {
                my_map = map;
            } else {
                comm.send(r, crate::comm::tags::DECOMP_GATHER, &bytes_from_i64s(&map));
            }
        }
        header = bytes_from_i64s(&gdims);
    }
    comm.broadcast(0, &mut header);
    let gdims = i64s_from_bytes(&header);
    if me != 0 {
        my_map = i64s_from_bytes(&comm.recv(0, crate::comm::tags::DECOMP_GATHER));
    }
    Ok((gdims, my_map))
}

/// Write the self-describing container form of a decomposition.
pub fn write_nc_decomp(
    iosysid: i32,
    fname: &str,
    ioid: i32,
    title: Option<&str>,
    history: Option<&str>,
) -> Result<()> {
    let ios = get_iosystem(iosysid)?;
    let desc = get_decomp(ioid)?;
    let comm = ios.my_comm();
    let npes = comm.size() as i64;

    // Everyone needs every rank's map to issue the collective writes.
    let blocks = comm.allgather_bytes(&bytes_from_i64s(&desc.map));
    let maps: Vec<Vec<i64>> = blocks.iter().map(|b| i64s_from_bytes(b)).collect();
    let max_maplen = maps.iter().map(|m| m.len()).max().unwrap_or(0) as i64;

    let ncid = file::createfile(iosysid, IoType::Netcdf, fname, OpenMode::WRITE)?;

    let version = format!(
        "{}.{}.{}",
        DECOMP_VERSION / 1000,
        (DECOMP_VERSION / 100) % 10,
        DECOMP_VERSION % 100
    );
    let put_text = |ncid: i32, name: &str, val: &str| -> Result<()> {
        getput::put_att_tc(
            ncid,
            GLOBAL_ATT,
            name,
            PioType::Char,
            PioType::Char,
            val.as_bytes(),
        )
    };
    put_text(ncid, "version", &version)?;
    getput::put_att_tc(
        ncid,
        GLOBAL_ATT,
        "max_maplen",
        PioType::Int,
        PioType::Int,
        &(max_maplen as i32).to_ne_bytes(),
    )?;
    if let Some(t) = title {
        put_text(ncid, "title", t)?;
    }
    if let Some(h) = history {
        put_text(ncid, "history", h)?;
    }
    put_text(ncid, "source", concat!("pario ", env!("CARGO_PKG_VERSION")))?;
    put_text(ncid, "order", "C")?;
    put_text(ncid, "backtrace", "")?;

    let dim_dim = file::def_dim(ncid, "dim", desc.ndims as i64)?;
    let dim_task = file::def_dim(ncid, "task", npes)?;
    let dim_mapelem = file::def_dim(ncid, "mapelem", max_maplen)?;
    let v_gsize = file::def_var(ncid, "global_size", PioType::Int, &[dim_dim])?;
    let v_maplen = file::def_var(ncid, "maplen", PioType::Int, &[dim_task])?;
    let v_map = file::def_var(ncid, "map", PioType::Int, &[dim_task, dim_mapelem])?;
    file::enddef(ncid)?;

    let gsize: Vec<u8> = desc
        .dimlen
        .iter()
        .flat_map(|&d| (d as i32).to_ne_bytes())
        .collect();
    getput::put_var_tc(ncid, v_gsize, PioType::Int, &gsize)?;

    let maplens: Vec<u8> = maps
        .iter()
        .flat_map(|m| (m.len() as i32).to_ne_bytes())
        .collect();
    getput::put_var_tc(ncid, v_maplen, PioType::Int, &maplens)?;

    // Map offsets are stored 0-based; holes become -1; short rows are
    // padded with the integer fill value.
    let mut map_data = Vec::with_capacity((npes * max_maplen) as usize * 4);
    for m in &maps {
        for &v in m {
            map_data.extend_from_slice(&((v - 1) as i32).to_ne_bytes());
        }
        for _ in m.len()..max_maplen as usize {
            map_data.extend_from_slice(&FILL_INT.to_ne_bytes());
        }
    }
    getput::put_var_tc(ncid, v_map, PioType::Int, &map_data)?;

    file::closefile(ncid)
}

/// Read a decomposition back from its container form and register it
/// under a fresh ioid.
pub fn read_nc_decomp(iosysid: i32, fname: &str) -> Result<i32> {
    let ios = get_iosystem(iosysid)?;
    let comm = ios.my_comm();
    let me = comm.rank();

    let (ncid, _iotype) = file::openfile(iosysid, IoType::Netcdf, fname, OpenMode::empty(), false)?;

    let gsize_id = file::inq_varid(ncid, "global_size")?;
    let maplen_id = file::inq_varid(ncid, "maplen")?;
    let map_id = file::inq_varid(ncid, "map")?;
    let (_, task_len) = file::inq_dim(ncid, file::inq_dimid(ncid, "task")?)?;
    let (_, mapelem_len) = file::inq_dim(ncid, file::inq_dimid(ncid, "mapelem")?)?;
    if task_len != comm.size() as i64 {
        file::closefile(ncid)?;
        return Err(PioError::InvalidArgument);
    }

    let gsize_raw = getput::get_var_tc(ncid, gsize_id, PioType::Int)?;
    let dimlen: Vec<i64> = gsize_raw
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes(c.try_into().unwrap()) as i64)
        .collect();

    let maplens_raw = getput::get_var_tc(ncid, maplen_id, PioType::Int)?;
    let maplens: Vec<i32> = maplens_raw
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
        .collect();

    // The collective read hands every rank the whole map; each rank then
    // slices out its own row.
    let my_maplen = maplens[me as usize] as usize;
    let all_rows = getput::get_var_tc(ncid, map_id, PioType::Int)?;
    let row_bytes = mapelem_len as usize * 4;
    let row = &all_rows[me as usize * row_bytes..(me as usize + 1) * row_bytes];
    let map: Vec<i64> = row
        .chunks_exact(4)
        .take(my_maplen)
        .map(|c| i32::from_ne_bytes(c.try_into().unwrap()) as i64 + 1)
        .collect();

    file::closefile(ncid)?;

    crate::decomp::init_decomp(
        iosysid,
        PioType::Int,
        &dimlen,
        &map,
        None,
        None,
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string_shape() {
        let version = format!(
            "{}.{}.{}",
            DECOMP_VERSION / 1000,
            (DECOMP_VERSION / 100) % 10,
            DECOMP_VERSION % 100
        );
        assert_eq!(version, "2.0.1");
    }
}
