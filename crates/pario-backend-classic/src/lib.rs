//! Classic-container backends.
//!
//! Implements the core `IoBackend` trait over the CDF-1/2/5 codec. Two
//! flavours are registered: the serial `netcdf` backend (driven by io
//! rank 0 only) and the parallel `pnetcdf` flavour, where every io rank
//! drives the backend and writes land in one shared in-memory model, with
//! nonblocking puts staged until `wait_all`.

pub mod codec;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use pario_core::backend::{
    BackendFactory, GLOBAL_ATT, IoBackend, IoType, OpenMode, REQ_COMPLETE, VarInfo,
    register_backend,
};
use pario_core::error::{PioError, Result};
use pario_core::types::{PioType, convert_buffer};

use codec::{Att, Dim, Model, Var};

// One open container, shared by every backend handle on the same path in
// this process. Parallel io ranks converge here the way collective MPI-IO
// handles converge on one file.
struct SharedFile {
    path: String,
    model: Mutex<Model>,
    openers: Mutex<usize>,
}

fn registry() -> &'static Mutex<HashMap<String, Weak<SharedFile>>> {
    static OPEN: OnceLock<Mutex<HashMap<String, Weak<SharedFile>>>> = OnceLock::new();
    OPEN.get_or_init(|| Mutex::new(HashMap::new()))
}

fn join_or_create<F>(path: &str, init: F) -> Result<Arc<SharedFile>>
where
    F: FnOnce() -> Result<Model>,
{
    let mut reg = registry().lock().unwrap();
    if let Some(existing) = reg.get(path).and_then(|w| w.upgrade()) {
        *existing.openers.lock().unwrap() += 1;
        return Ok(existing);
    }
    let shared = Arc::new(SharedFile {
        path: path.to_string(),
        model: Mutex::new(init()?),
        openers: Mutex::new(1),
    });
    reg.insert(path.to_string(), Arc::downgrade(&shared));
    Ok(shared)
}

// A staged nonblocking put.
struct PendingPut {
    req: i32,
    varid: i32,
    start: Vec<i64>,
    count: Vec<i64>,
    stride: Vec<i64>,
    data: Vec<u8>,
}

/// Classic container backend handle; one per open per rank.
pub struct ClassicBackend {
    shared: Arc<SharedFile>,
    iotype: IoType,
    writable: bool,
    in_define: bool,
    fill_mode: bool,
    pending: Vec<PendingPut>,
    next_req: i32,
}

fn version_for_mode(mode: OpenMode) -> u8 {
    if mode.contains(OpenMode::DATA64) {
        5
    } else if mode.contains(OpenMode::OFFSET64) {
        2
    } else {
        1
    }
}

impl ClassicBackend {
    fn create(path: &str, mode: OpenMode, iotype: IoType) -> Result<ClassicBackend> {
        if mode.contains(OpenMode::NOCLOBBER) && std::path::Path::new(path).exists() {
            return Err(PioError::Exists);
        }
        let shared = join_or_create(path, || Ok(Model::new(version_for_mode(mode))))?;
        Ok(ClassicBackend {
            shared,
            iotype,
            writable: true,
            in_define: true,
            fill_mode: true,
            pending: Vec::new(),
            next_req: 1,
        })
    }

    fn open(path: &str, mode: OpenMode, iotype: IoType) -> Result<ClassicBackend> {
        let shared = join_or_create(path, || {
            let bytes = std::fs::read(path)?;
            codec::decode(&bytes)
        })?;
        Ok(ClassicBackend {
            shared,
            iotype,
            writable: mode.contains(OpenMode::WRITE),
            in_define: false,
            fill_mode: true,
            pending: Vec::new(),
            next_req: 1,
        })
    }

    fn flush_model(&self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        let mut model = self.shared.model.lock().unwrap();
        // Never-written variables still occupy their full extent on disk;
        // back them with their fill value before layout.
        for v in 0..model.vars.len() {
            model.reserve(v);
        }
        let bytes = codec::encode(&model)?;
        std::fs::write(&self.shared.path, bytes)?;
        Ok(())
    }

    fn with_model<T>(&self, f: impl FnOnce(&Model) -> Result<T>) -> Result<T> {
        f(&self.shared.model.lock().unwrap())
    }

    fn with_model_mut<T>(&self, f: impl FnOnce(&mut Model) -> Result<T>) -> Result<T> {
        f(&mut self.shared.model.lock().unwrap())
    }
}

fn find_att<'m>(model: &'m Model, varid: i32, name: &str) -> Result<&'m Att> {
    let atts = if varid == GLOBAL_ATT {
        &model.gatts
    } else {
        &model
            .vars
            .get(varid as usize)
            .ok_or(PioError::NotVar)?
            .atts
    };
    atts.iter().find(|a| a.name == name).ok_or(PioError::NotAtt)
}

fn atts_mut(model: &mut Model, varid: i32) -> Result<&mut Vec<Att>> {
    if varid == GLOBAL_ATT {
        Ok(&mut model.gatts)
    } else {
        Ok(&mut model
            .vars
            .get_mut(varid as usize)
            .ok_or(PioError::NotVar)?
            .atts)
    }
}

// Row-major element strides for a shape.
fn linear_strides(shape: &[i64]) -> Vec<i64> {
    let mut strides = vec![1i64; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

fn norm_stride(stride: &[i64], ndims: usize) -> Vec<i64> {
    if stride.is_empty() {
        vec![1; ndims]
    } else {
        stride.to_vec()
    }
}

// Copy a strided hyperslab into (or out of) a variable's backing store.
fn slab_io(
    model: &mut Model,
    varid: i32,
    start: &[i64],
    count: &[i64],
    stride: &[i64],
    data: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let vi = varid as usize;
    if vi >= model.vars.len() {
        return Err(PioError::NotVar);
    }
    let ndims = model.vars[vi].dimids.len();
    if start.len() != ndims || count.len() != ndims {
        return Err(PioError::InvalidArgument);
    }
    let stride = norm_stride(stride, ndims);
    let esize = model.vars[vi].xtype.disk_size()?;
    let nelem: usize = count.iter().product::<i64>().max(1) as usize;

    let writing = data.is_some();
    if writing {
        if data.unwrap().len() != nelem * esize {
            return Err(PioError::InvalidArgument);
        }
        if model.is_rec_var(&model.vars[vi]) && ndims > 0 {
            let need = start[0] + (count[0] - 1).max(0) * stride[0] + 1;
            model.grow_records(need);
        }
        model.reserve(vi);
    }

    let shape = model.shape(&model.vars[vi]);
    for d in 0..ndims {
        if start[d] < 0 || count[d] < 0 || stride[d] < 1 {
            return Err(PioError::InvalidArgument);
        }
        if count[d] > 0 && start[d] + (count[d] - 1) * stride[d] + 1 > shape[d] {
            return Err(PioError::InvalidArgument);
        }
    }
    if !writing && model.vars[vi].data.is_empty() {
        model.reserve(vi);
    }

    let strides = linear_strides(&shape);
    let mut out = if writing {
        Vec::new()
    } else {
        Vec::with_capacity(nelem * esize)
    };
    let mut idx = vec![0i64; ndims];
    for k in 0..nelem {
        let mut lin = 0i64;
        for d in 0..ndims {
            lin += (start[d] + idx[d] * stride[d]) * strides[d];
        }
        let off = lin as usize * esize;
        if let Some(src) = data {
            model.vars[vi].data[off..off + esize].copy_from_slice(&src[k * esize..(k + 1) * esize]);
        } else {
            out.extend_from_slice(&model.vars[vi].data[off..off + esize]);
        }
        // Odometer over the slab.
        for d in (0..ndims).rev() {
            idx[d] += 1;
            if idx[d] < count[d] {
                break;
            }
            idx[d] = 0;
        }
    }
    Ok(out)
}

impl IoBackend for ClassicBackend {
    fn iotype(&self) -> IoType {
        self.iotype
    }

    fn redef(&mut self) -> Result<()> {
        self.in_define = true;
        Ok(())
    }

    fn enddef(&mut self) -> Result<()> {
        self.in_define = false;
        Ok(())
    }

    fn def_dim(&mut self, name: &str, len: i64) -> Result<i32> {
        self.with_model_mut(|m| {
            // Parallel ranks define collectively; repeats converge on the
            // first definition.
            if let Some(pos) = m.dims.iter().position(|d| d.name == name) {
                if m.dims[pos].len != len {
                    return Err(PioError::Exists);
                }
                return Ok(pos as i32);
            }
            if len == 0 && m.dims.iter().any(|d| d.len == 0) {
                return Err(PioError::InvalidArgument);
            }
            m.dims.push(Dim {
                name: name.to_string(),
                len,
            });
            Ok(m.dims.len() as i32 - 1)
        })
    }

    fn def_var(&mut self, name: &str, xtype: PioType, dimids: &[i32]) -> Result<i32> {
        let version = self.with_model(|m| Ok(m.version))?;
        if version != 5 && (xtype as i32) > PioType::Double as i32 {
            return Err(PioError::BadType);
        }
        self.with_model_mut(|m| {
            if let Some(pos) = m.vars.iter().position(|v| v.name == name) {
                return Ok(pos as i32);
            }
            for &d in dimids {
                if d < 0 || d as usize >= m.dims.len() {
                    return Err(PioError::InvalidArgument);
                }
            }
            m.vars.push(Var {
                name: name.to_string(),
                xtype,
                dimids: dimids.to_vec(),
                atts: Vec::new(),
                fill: None,
                no_fill: false,
                data: Vec::new(),
            });
            Ok(m.vars.len() as i32 - 1)
        })
    }

    fn def_var_fill(&mut self, varid: i32, no_fill: bool, fill: Option<&[u8]>) -> Result<()> {
        self.with_model_mut(|m| {
            let xtype = m
                .vars
                .get(varid as usize)
                .ok_or(PioError::NotVar)?
                .xtype;
            if let Some(f) = fill {
                // Persist the fill as the conventional attribute.
                let atts = &mut m.vars[varid as usize].atts;
                match atts.iter_mut().find(|a| a.name == "_FillValue") {
                    Some(a) => a.data = f.to_vec(),
                    None => atts.push(Att {
                        name: "_FillValue".to_string(),
                        xtype,
                        data: f.to_vec(),
                    }),
                }
            }
            let var = &mut m.vars[varid as usize];
            var.no_fill = no_fill;
            var.fill = fill.map(|f| f.to_vec());
            Ok(())
        })
    }

    fn rename_dim(&mut self, dimid: i32, name: &str) -> Result<()> {
        self.with_model_mut(|m| {
            m.dims
                .get_mut(dimid as usize)
                .ok_or(PioError::InvalidArgument)?
                .name = name.to_string();
            Ok(())
        })
    }

    fn rename_var(&mut self, varid: i32, name: &str) -> Result<()> {
        self.with_model_mut(|m| {
            m.vars
                .get_mut(varid as usize)
                .ok_or(PioError::NotVar)?
                .name = name.to_string();
            Ok(())
        })
    }

    fn rename_att(&mut self, varid: i32, old: &str, new: &str) -> Result<()> {
        self.with_model_mut(|m| {
            let atts = atts_mut(m, varid)?;
            let att = atts
                .iter_mut()
                .find(|a| a.name == old)
                .ok_or(PioError::NotAtt)?;
            att.name = new.to_string();
            Ok(())
        })
    }

    fn del_att(&mut self, varid: i32, name: &str) -> Result<()> {
        self.with_model_mut(|m| {
            let atts = atts_mut(m, varid)?;
            let pos = atts
                .iter()
                .position(|a| a.name == name)
                .ok_or(PioError::NotAtt)?;
            atts.remove(pos);
            Ok(())
        })
    }

    fn set_fill(&mut self, fill: bool) -> Result<bool> {
        let old = self.fill_mode;
        self.fill_mode = fill;
        Ok(old)
    }

    fn inq(&self) -> Result<(i32, i32, i32, i32)> {
        self.with_model(|m| {
            let unlim = m
                .dims
                .iter()
                .position(|d| d.len == 0)
                .map_or(-1, |p| p as i32);
            Ok((
                m.dims.len() as i32,
                m.vars.len() as i32,
                m.gatts.len() as i32,
                unlim,
            ))
        })
    }

    fn inq_format(&self) -> Result<i32> {
        self.with_model(|m| Ok(m.version as i32))
    }

    fn inq_dim(&self, dimid: i32) -> Result<(String, i64)> {
        self.with_model(|m| {
            let d = m
                .dims
                .get(dimid as usize)
                .ok_or(PioError::InvalidArgument)?;
            let len = if d.len == 0 { m.numrecs } else { d.len };
            Ok((d.name.clone(), len))
        })
    }

    fn inq_dimid(&self, name: &str) -> Result<i32> {
        self.with_model(|m| {
            m.dims
                .iter()
                .position(|d| d.name == name)
                .map(|p| p as i32)
                .ok_or(PioError::InvalidArgument)
        })
    }

    fn inq_var(&self, varid: i32) -> Result<VarInfo> {
        self.with_model(|m| {
            let v = m.vars.get(varid as usize).ok_or(PioError::NotVar)?;
            Ok(VarInfo {
                name: v.name.clone(),
                xtype: v.xtype,
                dimids: v.dimids.clone(),
                natts: v.atts.len() as i32,
            })
        })
    }

    fn inq_varid(&self, name: &str) -> Result<i32> {
        self.with_model(|m| {
            m.vars
                .iter()
                .position(|v| v.name == name)
                .map(|p| p as i32)
                .ok_or(PioError::NotVar)
        })
    }

    fn inq_var_fill(&self, varid: i32) -> Result<(bool, Vec<u8>)> {
        self.with_model(|m| {
            let v = m.vars.get(varid as usize).ok_or(PioError::NotVar)?;
            Ok((v.no_fill, v.fill.clone().unwrap_or_default()))
        })
    }

    fn inq_att(&self, varid: i32, name: &str) -> Result<(PioType, i64)> {
        self.with_model(|m| {
            let a = find_att(m, varid, name)?;
            Ok((a.xtype, (a.data.len() / a.xtype.disk_size()?) as i64))
        })
    }

    fn inq_attname(&self, varid: i32, attnum: i32) -> Result<String> {
        self.with_model(|m| {
            let atts = if varid == GLOBAL_ATT {
                &m.gatts
            } else {
                &m.vars.get(varid as usize).ok_or(PioError::NotVar)?.atts
            };
            atts.get(attnum as usize)
                .map(|a| a.name.clone())
                .ok_or(PioError::NotAtt)
        })
    }

    fn inq_unlimdims(&self) -> Result<Vec<i32>> {
        self.with_model(|m| {
            Ok(m.dims
                .iter()
                .enumerate()
                .filter(|(_, d)| d.len == 0)
                .map(|(i, _)| i as i32)
                .collect())
        })
    }

    fn put_att(&mut self, varid: i32, name: &str, xtype: PioType, data: &[u8]) -> Result<()> {
        let version = self.with_model(|m| Ok(m.version))?;
        if version != 5 && (xtype as i32) > PioType::Double as i32 {
            return Err(PioError::BadType);
        }
        self.with_model_mut(|m| {
            let atts = atts_mut(m, varid)?;
            match atts.iter_mut().find(|a| a.name == name) {
                Some(a) => {
                    a.xtype = xtype;
                    a.data = data.to_vec();
                }
                None => atts.push(Att {
                    name: name.to_string(),
                    xtype,
                    data: data.to_vec(),
                }),
            }
            Ok(())
        })
    }

    fn get_att(&self, varid: i32, name: &str) -> Result<Vec<u8>> {
        self.with_model(|m| Ok(find_att(m, varid, name)?.data.clone()))
    }

    fn put_vars(
        &mut self,
        varid: i32,
        start: &[i64],
        count: &[i64],
        stride: &[i64],
        data: &[u8],
    ) -> Result<()> {
        if !self.writable {
            return Err(PioError::Permission);
        }
        self.with_model_mut(|m| slab_io(m, varid, start, count, stride, Some(data)).map(|_| ()))
    }

    fn get_vars(
        &self,
        varid: i32,
        start: &[i64],
        count: &[i64],
        stride: &[i64],
    ) -> Result<Vec<u8>> {
        self.with_model_mut(|m| slab_io(m, varid, start, count, stride, None))
    }

    fn put_vars_nb(
        &mut self,
        varid: i32,
        start: &[i64],
        count: &[i64],
        stride: &[i64],
        data: &[u8],
    ) -> Result<i32> {
        if self.iotype != IoType::Pnetcdf {
            self.put_vars(varid, start, count, stride, data)?;
            return Ok(REQ_COMPLETE);
        }
        if !self.writable {
            return Err(PioError::Permission);
        }
        let req = self.next_req;
        self.next_req += 1;
        self.pending.push(PendingPut {
            req,
            varid,
            start: start.to_vec(),
            count: count.to_vec(),
            stride: stride.to_vec(),
            data: data.to_vec(),
        });
        Ok(req)
    }

    fn wait_all(&mut self, reqs: &[i32]) -> Result<()> {
        // Apply the named requests in submission order; the rest stay
        // staged for a later block.
        let pending = std::mem::take(&mut self.pending);
        for p in pending {
            if reqs.contains(&p.req) {
                self.with_model_mut(|m| {
                    slab_io(m, p.varid, &p.start, &p.count, &p.stride, Some(&p.data)).map(|_| ())
                })?;
            } else {
                self.pending.push(p);
            }
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.flush_model()
    }

    fn close(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            let reqs: Vec<i32> = self.pending.iter().map(|p| p.req).collect();
            self.wait_all(&reqs)?;
        }
        let last = {
            let mut openers = self.shared.openers.lock().unwrap();
            *openers -= 1;
            *openers == 0
        };
        if last {
            self.flush_model()?;
            registry().lock().unwrap().remove(&self.shared.path);
        }
        Ok(())
    }
}

fn open_classic(path: &str, mode: OpenMode, create: bool, iotype: IoType) -> Result<Box<dyn IoBackend>> {
    let be = if create {
        ClassicBackend::create(path, mode, iotype)?
    } else {
        ClassicBackend::open(path, mode, iotype)?
    };
    Ok(Box::new(be))
}

fn open_netcdf(path: &str, mode: OpenMode, create: bool) -> Result<Box<dyn IoBackend>> {
    open_classic(path, mode, create, IoType::Netcdf)
}

fn open_pnetcdf(path: &str, mode: OpenMode, create: bool) -> Result<Box<dyn IoBackend>> {
    open_classic(path, mode, create, IoType::Pnetcdf)
}

/// Register the serial and parallel classic backends. Idempotent.
pub fn register() {
    register_backend(BackendFactory {
        iotype: IoType::Netcdf,
        open: open_netcdf,
    });
    register_backend(BackendFactory {
        iotype: IoType::Pnetcdf,
        open: open_pnetcdf,
    });
}

/// Convenience used by tools: probe whether this crate can open a file.
pub fn can_open(path: &str) -> bool {
    std::fs::read(path)
        .ok()
        .and_then(|b| codec::decode(&b).ok())
        .is_some()
}

/// Element-count helper shared with tests.
pub fn att_as_i32s(data: &[u8], xtype: PioType) -> Result<Vec<i32>> {
    let ints = convert_buffer(data, xtype, PioType::Int)?;
    Ok(ints
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp(name: &str) -> String {
        let dir = tempfile::Builder::new()
            .prefix("pario-classic-tests")
            .tempdir()
            .unwrap()
            .keep();
        dir.join(name).to_string_lossy().to_string()
    }

    fn int_bytes(vals: &[i32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    #[test]
    fn test_create_write_read_roundtrip() {
        let path = tmp("basic.nc");
        let mut be = ClassicBackend::create(&path, OpenMode::WRITE, IoType::Netcdf).unwrap();
        let x = be.def_dim("x", 6).unwrap();
        let v = be.def_var("v", PioType::Int, &[x]).unwrap();
        be.put_att(GLOBAL_ATT, "tag", PioType::Int, &int_bytes(&[42]))
            .unwrap();
        be.enddef().unwrap();
        be.put_vars(v, &[0], &[6], &[], &int_bytes(&[1, 2, 3, 4, 5, 6]))
            .unwrap();
        be.close().unwrap();

        let be2 = ClassicBackend::open(&path, OpenMode::empty(), IoType::Netcdf).unwrap();
        assert_eq!(be2.inq_dimid("x").unwrap(), 0);
        assert_eq!(be2.inq_varid("v").unwrap(), 0);
        assert_eq!(
            be2.get_vars(0, &[2], &[3], &[]).unwrap(),
            int_bytes(&[3, 4, 5])
        );
        assert_eq!(be2.get_att(GLOBAL_ATT, "tag").unwrap(), int_bytes(&[42]));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_strided_access() {
        let path = tmp("strided.nc");
        let mut be = ClassicBackend::create(&path, OpenMode::WRITE, IoType::Netcdf).unwrap();
        let x = be.def_dim("x", 8).unwrap();
        let v = be.def_var("v", PioType::Short, &[x]).unwrap();
        be.enddef().unwrap();
        let data: Vec<u8> = [1i16, 2, 3, 4].iter().flat_map(|s| s.to_ne_bytes()).collect();
        be.put_vars(v, &[0], &[4], &[2], &data).unwrap();
        let every_other = be.get_vars(v, &[0], &[4], &[2]).unwrap();
        assert_eq!(every_other, data);
        be.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_unwritten_var_reads_fill() {
        let path = tmp("fill.nc");
        let mut be = ClassicBackend::create(&path, OpenMode::WRITE, IoType::Netcdf).unwrap();
        let x = be.def_dim("x", 3).unwrap();
        let v = be.def_var("v", PioType::Int, &[x]).unwrap();
        be.def_var_fill(v, false, Some(&int_bytes(&[-9]))).unwrap();
        be.enddef().unwrap();
        assert_eq!(
            be.get_vars(v, &[0], &[3], &[]).unwrap(),
            int_bytes(&[-9, -9, -9])
        );
        be.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_record_growth() {
        let path = tmp("rec.nc");
        let mut be = ClassicBackend::create(&path, OpenMode::WRITE, IoType::Netcdf).unwrap();
        let t = be.def_dim("t", 0).unwrap();
        let x = be.def_dim("x", 2).unwrap();
        let v = be.def_var("r", PioType::Double, &[t, x]).unwrap();
        be.enddef().unwrap();
        let rec1: Vec<u8> = [5.0f64, 6.0].iter().flat_map(|d| d.to_ne_bytes()).collect();
        be.put_vars(v, &[1, 0], &[1, 2], &[], &rec1).unwrap();
        assert_eq!(be.inq_dim(t).unwrap().1, 2);
        // Record 0 was never written and reads back as fill.
        let rec0 = be.get_vars(v, &[0, 0], &[1, 2], &[]).unwrap();
        let fills: Vec<f64> = rec0
            .chunks_exact(8)
            .map(|c| f64::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert!(fills.iter().all(|&f| f > 9.0e36));
        be.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_nonblocking_wait_order() {
        let path = tmp("nb.nc");
        let mut be = ClassicBackend::create(&path, OpenMode::WRITE, IoType::Pnetcdf).unwrap();
        let x = be.def_dim("x", 4).unwrap();
        let v = be.def_var("v", PioType::Int, &[x]).unwrap();
        be.enddef().unwrap();
        // Two staged writes to the same cell: submission order must win.
        let r1 = be.put_vars_nb(v, &[0], &[1], &[], &int_bytes(&[1])).unwrap();
        let r2 = be.put_vars_nb(v, &[0], &[1], &[], &int_bytes(&[2])).unwrap();
        assert_eq!(
            be.get_vars(v, &[0], &[1], &[]).unwrap(),
            int_bytes(&[pario_core::types::FILL_INT])
        );
        be.wait_all(&[r1, r2]).unwrap();
        assert_eq!(be.get_vars(v, &[0], &[1], &[]).unwrap(), int_bytes(&[2]));
        be.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_shared_open_between_parallel_ranks() {
        let path = tmp("shared.nc");
        let mut a = ClassicBackend::create(&path, OpenMode::WRITE, IoType::Pnetcdf).unwrap();
        let mut b = ClassicBackend::create(&path, OpenMode::WRITE, IoType::Pnetcdf).unwrap();
        // Collective definition converges.
        assert_eq!(a.def_dim("x", 4).unwrap(), b.def_dim("x", 4).unwrap());
        let va = a.def_var("v", PioType::Int, &[0]).unwrap();
        let vb = b.def_var("v", PioType::Int, &[0]).unwrap();
        assert_eq!(va, vb);
        a.enddef().unwrap();
        b.enddef().unwrap();
        a.put_vars(va, &[0], &[2], &[], &int_bytes(&[1, 2])).unwrap();
        b.put_vars(vb, &[2], &[2], &[], &int_bytes(&[3, 4])).unwrap();
        a.close().unwrap();
        b.close().unwrap();

        let r = ClassicBackend::open(&path, OpenMode::empty(), IoType::Netcdf).unwrap();
        assert_eq!(
            r.get_vars(0, &[0], &[4], &[]).unwrap(),
            int_bytes(&[1, 2, 3, 4])
        );
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_noclobber() {
        let path = tmp("noclobber.nc");
        std::fs::write(&path, b"CDF\x01").unwrap();
        assert!(matches!(
            ClassicBackend::create(&path, OpenMode::WRITE | OpenMode::NOCLOBBER, IoType::Netcdf),
            Err(PioError::Exists)
        ));
        let _ = std::fs::remove_file(&path);
    }
}
