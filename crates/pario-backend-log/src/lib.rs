//! Log-structured backend.
//!
//! Writes are appended as typed records instead of being placed into a
//! laid-out container: a variable is defined lazily by its first write,
//! each data record carries its own `(start, count)` selection, and the
//! structural metadata travels as `__pio__` side-channel attributes.
//! Reads replay the log into an in-memory image.
//!
//! On-disk form: the `LOG1` magic followed by length-prefixed bincode
//! frames, one per record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use serde::{Deserialize, Serialize};

use pario_core::backend::{
    BackendFactory, GLOBAL_ATT, IoBackend, IoType, OpenMode, VarInfo, register_backend,
};
use pario_core::error::{PioError, Result};
use pario_core::types::PioType;

/// Leading magic of a log-structured file.
pub const LOG_MAGIC: &[u8; 4] = b"LOG1";

#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogRecord {
    DefDim {
        name: String,
        len: i64,
    },
    DefVar {
        name: String,
        xtype: i32,
        dimids: Vec<i32>,
    },
    Att {
        varid: i32,
        name: String,
        xtype: i32,
        data: Vec<u8>,
    },
    DelAtt {
        varid: i32,
        name: String,
    },
    RenameDim {
        dimid: i32,
        name: String,
    },
    RenameVar {
        varid: i32,
        name: String,
    },
    Fill {
        varid: i32,
        no_fill: bool,
        fill: Vec<u8>,
    },
    Data {
        varid: i32,
        start: Vec<i64>,
        count: Vec<i64>,
        stride: Vec<i64>,
        data: Vec<u8>,
    },
}

#[derive(Debug, Default)]
struct LogVar {
    name: String,
    xtype: PioType,
    dimids: Vec<i32>,
    atts: Vec<(String, PioType, Vec<u8>)>,
    fill: Vec<u8>,
    no_fill: bool,
    /// True once the lazy definition record has been appended.
    announced: bool,
}

// Replayed image of one log, shared by every opener in this process.
#[derive(Default)]
struct LogState {
    records: Vec<LogRecord>,
    dims: Vec<(String, i64)>,
    vars: Vec<LogVar>,
    gatts: Vec<(String, PioType, Vec<u8>)>,
    numrecs: i64,
}

struct SharedLog {
    path: String,
    state: Mutex<LogState>,
    openers: Mutex<usize>,
}

fn registry() -> &'static Mutex<HashMap<String, Weak<SharedLog>>> {
    static OPEN: OnceLock<Mutex<HashMap<String, Weak<SharedLog>>>> = OnceLock::new();
    OPEN.get_or_init(|| Mutex::new(HashMap::new()))
}

impl LogState {
    fn apply(&mut self, rec: &LogRecord) -> Result<()> {
        match rec {
            LogRecord::DefDim { name, len } => self.dims.push((name.clone(), *len)),
            LogRecord::DefVar {
                name,
                xtype,
                dimids,
            } => self.vars.push(LogVar {
                name: name.clone(),
                xtype: PioType::from_i32(*xtype)?,
                dimids: dimids.clone(),
                announced: true,
                ..Default::default()
            }),
            LogRecord::Att {
                varid,
                name,
                xtype,
                data,
            } => {
                let atts = if *varid == GLOBAL_ATT {
                    &mut self.gatts
                } else {
                    &mut self
                        .vars
                        .get_mut(*varid as usize)
                        .ok_or(PioError::NotVar)?
                        .atts
                };
                let t = PioType::from_i32(*xtype)?;
                match atts.iter_mut().find(|(n, _, _)| n == name) {
                    Some(a) => {
                        a.1 = t;
                        a.2 = data.clone();
                    }
                    None => atts.push((name.clone(), t, data.clone())),
                }
            }
            LogRecord::DelAtt { varid, name } => {
                let atts = if *varid == GLOBAL_ATT {
                    &mut self.gatts
                } else {
                    &mut self
                        .vars
                        .get_mut(*varid as usize)
                        .ok_or(PioError::NotVar)?
                        .atts
                };
                atts.retain(|(n, _, _)| n != name);
            }
            LogRecord::RenameDim { dimid, name } => {
                self.dims
                    .get_mut(*dimid as usize)
                    .ok_or(PioError::InvalidArgument)?
                    .0 = name.clone();
            }
            LogRecord::RenameVar { varid, name } => {
                self.vars
                    .get_mut(*varid as usize)
                    .ok_or(PioError::NotVar)?
                    .name = name.clone();
            }
            LogRecord::Fill {
                varid,
                no_fill,
                fill,
            } => {
                let var = self
                    .vars
                    .get_mut(*varid as usize)
                    .ok_or(PioError::NotVar)?;
                var.no_fill = *no_fill;
                var.fill = fill.clone();
            }
            LogRecord::Data { varid, start, .. } => {
                let var = self.vars.get(*varid as usize).ok_or(PioError::NotVar)?;
                if let Some(&d0) = var.dimids.first()
                    && self.dims[d0 as usize].1 == 0
                    && !start.is_empty()
                {
                    self.numrecs = self.numrecs.max(start[0] + 1);
                }
            }
        }
        Ok(())
    }

    fn append(&mut self, rec: LogRecord) -> Result<()> {
        self.apply(&rec)?;
        self.records.push(rec);
        Ok(())
    }

    // Resolve a variable's current shape, record dim to numrecs.
    fn shape(&self, varid: usize) -> Vec<i64> {
        self.vars[varid]
            .dimids
            .iter()
            .map(|&d| {
                let len = self.dims[d as usize].1;
                if len == 0 { self.numrecs } else { len }
            })
            .collect()
    }

    // Materialize a variable by replaying its data records, then cut the
    // requested slab out.
    fn read_slab(
        &self,
        varid: i32,
        start: &[i64],
        count: &[i64],
        stride: &[i64],
    ) -> Result<Vec<u8>> {
        let vi = varid as usize;
        let var = self.vars.get(vi).ok_or(PioError::NotVar)?;
        let esize = var.xtype.disk_size()?;
        let shape = self.shape(vi);
        let total: usize = shape.iter().product::<i64>().max(1) as usize;

        let fill = if var.fill.is_empty() {
            var.xtype.default_fill()?
        } else {
            var.fill.clone()
        };
        let mut image = Vec::with_capacity(total * esize);
        for _ in 0..total {
            image.extend_from_slice(&fill);
        }

        let strides = linear_strides(&shape);
        for rec in &self.records {
            if let LogRecord::Data {
                varid: rv,
                start: rs,
                count: rc,
                stride: rst,
                data,
            } = rec
                && *rv == varid
            {
                odometer_copy(&mut image, esize, &strides, rs, rc, rst, Some(data), None)?;
            }
        }

        let mut out = Vec::new();
        odometer_copy(
            &mut image,
            esize,
            &strides,
            start,
            count,
            stride,
            None,
            Some(&mut out),
        )?;
        Ok(out)
    }
}

fn linear_strides(shape: &[i64]) -> Vec<i64> {
    let mut strides = vec![1i64; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

// Scatter (src given) or gather (dst given) a strided slab against a flat
// image.
#[allow(clippy::too_many_arguments)]
fn odometer_copy(
    image: &mut [u8],
    esize: usize,
    strides: &[i64],
    start: &[i64],
    count: &[i64],
    stride: &[i64],
    src: Option<&[u8]>,
    dst: Option<&mut Vec<u8>>,
) -> Result<()> {
    let ndims = strides.len();
    if start.len() != ndims || count.len() != ndims {
        return Err(PioError::InvalidArgument);
    }
    let stride: Vec<i64> = if stride.is_empty() {
        vec![1; ndims]
    } else {
        stride.to_vec()
    };
    let nelem: usize = count.iter().product::<i64>().max(1) as usize;
    let mut idx = vec![0i64; ndims];
    let mut out = dst;
    for k in 0..nelem {
        let mut lin = 0i64;
        for d in 0..ndims {
            lin += (start[d] + idx[d] * stride[d]) * strides[d];
        }
        let off = lin as usize * esize;
        if off + esize > image.len() {
            return Err(PioError::InvalidArgument);
        }
        if let Some(s) = src {
            image[off..off + esize].copy_from_slice(&s[k * esize..(k + 1) * esize]);
        }
        if let Some(o) = out.as_deref_mut() {
            o.extend_from_slice(&image[off..off + esize]);
        }
        for d in (0..ndims).rev() {
            idx[d] += 1;
            if idx[d] < count[d] {
                break;
            }
            idx[d] = 0;
        }
    }
    Ok(())
}

/// Log-structured backend handle.
pub struct LogBackend {
    shared: Arc<SharedLog>,
    writable: bool,
}

impl LogBackend {
    fn create(path: &str, mode: OpenMode) -> Result<LogBackend> {
        if mode.contains(OpenMode::NOCLOBBER) && std::path::Path::new(path).exists() {
            return Err(PioError::Exists);
        }
        let shared = join_or_create(path, || Ok(LogState::default()))?;
        Ok(LogBackend {
            shared,
            writable: true,
        })
    }

    fn open(path: &str, mode: OpenMode) -> Result<LogBackend> {
        let shared = join_or_create(path, || {
            let bytes = std::fs::read(path)?;
            parse_log(&bytes)
        })?;
        Ok(LogBackend {
            shared,
            writable: mode.contains(OpenMode::WRITE),
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut LogState) -> Result<T>) -> Result<T> {
        f(&mut self.shared.state.lock().unwrap())
    }

    // The lazy definition: the variable's structural metadata goes out as
    // records the first time data for it shows up.
    fn announce_var(&self, state: &mut LogState, varid: i32, ncop: &str) -> Result<()> {
        let vi = varid as usize;
        if state.vars.get(vi).ok_or(PioError::NotVar)?.announced {
            return Ok(());
        }
        let var = &state.vars[vi];
        let prefix = format!("{}/__pio__", var.name);
        let recs = vec![
            LogRecord::DefVar {
                name: var.name.clone(),
                xtype: var.xtype as i32,
                dimids: var.dimids.clone(),
            },
            LogRecord::Att {
                varid: GLOBAL_ATT,
                name: format!("{prefix}/ndims"),
                xtype: PioType::Int as i32,
                data: (var.dimids.len() as i32).to_ne_bytes().to_vec(),
            },
            LogRecord::Att {
                varid: GLOBAL_ATT,
                name: format!("{prefix}/nctype"),
                xtype: PioType::Int as i32,
                data: (var.xtype as i32).to_ne_bytes().to_vec(),
            },
            LogRecord::Att {
                varid: GLOBAL_ATT,
                name: format!("{prefix}/dims"),
                xtype: PioType::Int as i32,
                data: var
                    .dimids
                    .iter()
                    .flat_map(|d| d.to_ne_bytes())
                    .collect(),
            },
            LogRecord::Att {
                varid: GLOBAL_ATT,
                name: format!("{prefix}/ncop"),
                xtype: PioType::Char as i32,
                data: ncop.as_bytes().to_vec(),
            },
        ];
        state.vars[vi].announced = true;
        for rec in recs {
            if matches!(rec, LogRecord::DefVar { .. }) {
                // The variable is already resident; applying the record
                // would duplicate it.
                state.records.push(rec);
            } else {
                state.append(rec)?;
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        let state = self.shared.state.lock().unwrap();
        let mut out = LOG_MAGIC.to_vec();
        for rec in &state.records {
            let frame = bincode::serialize(rec).map_err(|_| PioError::AdiosErr)?;
            out.extend_from_slice(&(frame.len() as u32).to_ne_bytes());
            out.extend_from_slice(&frame);
        }
        std::fs::write(&self.shared.path, out)?;
        Ok(())
    }
}

fn join_or_create<F>(path: &str, init: F) -> Result<Arc<SharedLog>>
where
    F: FnOnce() -> Result<LogState>,
{
    let mut reg = registry().lock().unwrap();
    if let Some(existing) = reg.get(path).and_then(|w| w.upgrade()) {
        *existing.openers.lock().unwrap() += 1;
        return Ok(existing);
    }
    let shared = Arc::new(SharedLog {
        path: path.to_string(),
        state: Mutex::new(init()?),
        openers: Mutex::new(1),
    });
    reg.insert(path.to_string(), Arc::downgrade(&shared));
    Ok(shared)
}

fn parse_log(bytes: &[u8]) -> Result<LogState> {
    if bytes.len() < 4 || &bytes[..4] != LOG_MAGIC {
        return Err(PioError::NotNc);
    }
    let mut state = LogState::default();
    let mut off = 4usize;
    let mut records = Vec::new();
    while off < bytes.len() {
        let len =
            u32::from_ne_bytes(bytes.get(off..off + 4).ok_or(PioError::AdiosRead)?.try_into().unwrap())
                as usize;
        off += 4;
        let frame = bytes.get(off..off + len).ok_or(PioError::AdiosRead)?;
        off += len;
        let rec: LogRecord = bincode::deserialize(frame).map_err(|_| PioError::AdiosRead)?;
        records.push(rec);
    }
    for rec in &records {
        state.apply(rec)?;
    }
    state.records = records;
    Ok(state)
}

impl IoBackend for LogBackend {
    fn iotype(&self) -> IoType {
        IoType::Adios
    }

    fn redef(&mut self) -> Result<()> {
        Ok(())
    }

    fn enddef(&mut self) -> Result<()> {
        Ok(())
    }

    fn def_dim(&mut self, name: &str, len: i64) -> Result<i32> {
        self.with(|s| {
            if let Some(pos) = s.dims.iter().position(|(n, _)| n == name) {
                return Ok(pos as i32);
            }
            s.append(LogRecord::DefDim {
                name: name.to_string(),
                len,
            })?;
            Ok(s.dims.len() as i32 - 1)
        })
    }

    fn def_var(&mut self, name: &str, xtype: PioType, dimids: &[i32]) -> Result<i32> {
        self.with(|s| {
            if let Some(pos) = s.vars.iter().position(|v| v.name == name) {
                return Ok(pos as i32);
            }
            // Defined lazily: nothing is logged until the first write.
            s.vars.push(LogVar {
                name: name.to_string(),
                xtype,
                dimids: dimids.to_vec(),
                ..Default::default()
            });
            Ok(s.vars.len() as i32 - 1)
        })
    }

    fn def_var_fill(&mut self, varid: i32, no_fill: bool, fill: Option<&[u8]>) -> Result<()> {
        self.with(|s| {
            s.append(LogRecord::Fill {
                varid,
                no_fill,
                fill: fill.unwrap_or(&[]).to_vec(),
            })
        })
    }

    fn rename_dim(&mut self, dimid: i32, name: &str) -> Result<()> {
        // Dimensions are logged eagerly, so the rename must be too: the
        // in-memory name alone would not survive replay.
        self.with(|s| {
            s.append(LogRecord::RenameDim {
                dimid,
                name: name.to_string(),
            })
        })
    }

    fn rename_var(&mut self, varid: i32, name: &str) -> Result<()> {
        self.with(|s| {
            let announced = s
                .vars
                .get(varid as usize)
                .ok_or(PioError::NotVar)?
                .announced;
            if announced {
                s.append(LogRecord::RenameVar {
                    varid,
                    name: name.to_string(),
                })
            } else {
                // Nothing in the log names this variable yet; the lazy
                // definition will carry the new name when it goes out.
                s.vars[varid as usize].name = name.to_string();
                Ok(())
            }
        })
    }

    fn rename_att(&mut self, varid: i32, old: &str, new: &str) -> Result<()> {
        self.with(|s| {
            let data = {
                let atts = if varid == GLOBAL_ATT {
                    &s.gatts
                } else {
                    &s.vars.get(varid as usize).ok_or(PioError::NotVar)?.atts
                };
                atts.iter()
                    .find(|(n, _, _)| n == old)
                    .cloned()
                    .ok_or(PioError::NotAtt)?
            };
            s.append(LogRecord::DelAtt {
                varid,
                name: old.to_string(),
            })?;
            s.append(LogRecord::Att {
                varid,
                name: new.to_string(),
                xtype: data.1 as i32,
                data: data.2,
            })
        })
    }

    fn del_att(&mut self, varid: i32, name: &str) -> Result<()> {
        self.with(|s| {
            s.append(LogRecord::DelAtt {
                varid,
                name: name.to_string(),
            })
        })
    }

    fn set_fill(&mut self, _fill: bool) -> Result<bool> {
        Ok(true)
    }

    fn inq(&self) -> Result<(i32, i32, i32, i32)> {
        self.with(|s| {
            let unlim = s
                .dims
                .iter()
                .position(|(_, l)| *l == 0)
                .map_or(-1, |p| p as i32);
            Ok((
                s.dims.len() as i32,
                s.vars.len() as i32,
                s.gatts.len() as i32,
                unlim,
            ))
        })
    }

    fn inq_format(&self) -> Result<i32> {
        Ok(i32::from_ne_bytes(*LOG_MAGIC))
    }

    fn inq_dim(&self, dimid: i32) -> Result<(String, i64)> {
        self.with(|s| {
            let (name, len) = s
                .dims
                .get(dimid as usize)
                .ok_or(PioError::InvalidArgument)?
                .clone();
            Ok((name, if len == 0 { s.numrecs } else { len }))
        })
    }

    fn inq_dimid(&self, name: &str) -> Result<i32> {
        self.with(|s| {
            s.dims
                .iter()
                .position(|(n, _)| n == name)
                .map(|p| p as i32)
                .ok_or(PioError::InvalidArgument)
        })
    }

    fn inq_var(&self, varid: i32) -> Result<VarInfo> {
        self.with(|s| {
            let v = s.vars.get(varid as usize).ok_or(PioError::NotVar)?;
            Ok(VarInfo {
                name: v.name.clone(),
                xtype: v.xtype,
                dimids: v.dimids.clone(),
                natts: v.atts.len() as i32,
            })
        })
    }

    fn inq_varid(&self, name: &str) -> Result<i32> {
        self.with(|s| {
            s.vars
                .iter()
                .position(|v| v.name == name)
                .map(|p| p as i32)
                .ok_or(PioError::NotVar)
        })
    }

    fn inq_var_fill(&self, varid: i32) -> Result<(bool, Vec<u8>)> {
        self.with(|s| {
            let v = s.vars.get(varid as usize).ok_or(PioError::NotVar)?;
            Ok((v.no_fill, v.fill.clone()))
        })
    }

    fn inq_att(&self, varid: i32, name: &str) -> Result<(PioType, i64)> {
        self.with(|s| {
            let atts = if varid == GLOBAL_ATT {
                &s.gatts
            } else {
                &s.vars.get(varid as usize).ok_or(PioError::NotVar)?.atts
            };
            let (_, t, d) = atts
                .iter()
                .find(|(n, _, _)| n == name)
                .ok_or(PioError::NotAtt)?;
            Ok((*t, (d.len() / t.disk_size()?) as i64))
        })
    }

    fn inq_attname(&self, varid: i32, attnum: i32) -> Result<String> {
        self.with(|s| {
            let atts = if varid == GLOBAL_ATT {
                &s.gatts
            } else {
                &s.vars.get(varid as usize).ok_or(PioError::NotVar)?.atts
            };
            atts.get(attnum as usize)
                .map(|(n, _, _)| n.clone())
                .ok_or(PioError::NotAtt)
        })
    }

    fn inq_unlimdims(&self) -> Result<Vec<i32>> {
        self.with(|s| {
            Ok(s.dims
                .iter()
                .enumerate()
                .filter(|(_, (_, l))| *l == 0)
                .map(|(i, _)| i as i32)
                .collect())
        })
    }

    fn put_att(&mut self, varid: i32, name: &str, xtype: PioType, data: &[u8]) -> Result<()> {
        self.with(|s| {
            s.append(LogRecord::Att {
                varid,
                name: name.to_string(),
                xtype: xtype as i32,
                data: data.to_vec(),
            })
        })
    }

    fn get_att(&self, varid: i32, name: &str) -> Result<Vec<u8>> {
        self.with(|s| {
            let atts = if varid == GLOBAL_ATT {
                &s.gatts
            } else {
                &s.vars.get(varid as usize).ok_or(PioError::NotVar)?.atts
            };
            atts.iter()
                .find(|(n, _, _)| n == name)
                .map(|(_, _, d)| d.clone())
                .ok_or(PioError::NotAtt)
        })
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
        self.with(|s| {
            // Scalar writes carry an empty selection and land whole.
            self.announce_var(s, varid, if start.is_empty() { "put_var" } else { "put_vars" })?;
            s.append(LogRecord::Data {
                varid,
                start: start.to_vec(),
                count: count.to_vec(),
                stride: stride.to_vec(),
                data: data.to_vec(),
            })
        })
    }

    fn get_vars(
        &self,
        varid: i32,
        start: &[i64],
        count: &[i64],
        stride: &[i64],
    ) -> Result<Vec<u8>> {
        self.with(|s| s.read_slab(varid, start, count, stride))
    }

    fn sync(&mut self) -> Result<()> {
        self.flush()
    }

    fn close(&mut self) -> Result<()> {
        let last = {
            let mut openers = self.shared.openers.lock().unwrap();
            *openers -= 1;
            *openers == 0
        };
        if last {
            self.flush()?;
            registry().lock().unwrap().remove(&self.shared.path);
        }
        Ok(())
    }
}

fn open_log(path: &str, mode: OpenMode, create: bool) -> Result<Box<dyn IoBackend>> {
    let be = if create {
        LogBackend::create(path, mode)?
    } else {
        LogBackend::open(path, mode)?
    };
    Ok(Box::new(be))
}

/// Register the log-structured backend. Idempotent.
pub fn register() {
    register_backend(BackendFactory {
        iotype: IoType::Adios,
        open: open_log,
    });
}

/// Probe whether a file is a log-structured container.
pub fn can_open(path: &str) -> bool {
    std::fs::read(path)
        .ok()
        .and_then(|b| parse_log(&b).ok())
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp(name: &str) -> String {
        let dir = tempfile::Builder::new()
            .prefix("pario-log-tests")
            .tempdir()
            .unwrap()
            .keep();
        dir.join(name).to_string_lossy().to_string()
    }

    fn int_bytes(vals: &[i32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    #[test]
    fn test_lazy_definition_and_side_channel_atts() {
        let path = tmp("lazy.log");
        let mut be = LogBackend::create(&path, OpenMode::WRITE).unwrap();
        let x = be.def_dim("x", 4).unwrap();
        let v = be.def_var("v", PioType::Int, &[x]).unwrap();
        // Nothing announced yet.
        assert!(be.get_att(GLOBAL_ATT, "v/__pio__/ndims").is_err());
        be.put_vars(v, &[0], &[4], &[], &int_bytes(&[1, 2, 3, 4]))
            .unwrap();
        assert_eq!(
            be.get_att(GLOBAL_ATT, "v/__pio__/ndims").unwrap(),
            int_bytes(&[1])
        );
        assert_eq!(
            be.get_att(GLOBAL_ATT, "v/__pio__/nctype").unwrap(),
            int_bytes(&[PioType::Int as i32])
        );
        be.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_log_roundtrip_through_disk() {
        let path = tmp("roundtrip.log");
        {
            let mut be = LogBackend::create(&path, OpenMode::WRITE).unwrap();
            let x = be.def_dim("x", 4).unwrap();
            let v = be.def_var("v", PioType::Int, &[x]).unwrap();
            be.put_vars(v, &[0], &[2], &[], &int_bytes(&[10, 20])).unwrap();
            be.put_vars(v, &[2], &[2], &[], &int_bytes(&[30, 40])).unwrap();
            be.put_att(GLOBAL_ATT, "title", PioType::Char, b"log test")
                .unwrap();
            be.close().unwrap();
        }
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], LOG_MAGIC);

        let be = LogBackend::open(&path, OpenMode::empty()).unwrap();
        let v = be.inq_varid("v").unwrap();
        assert_eq!(
            be.get_vars(v, &[0], &[4], &[]).unwrap(),
            int_bytes(&[10, 20, 30, 40])
        );
        assert_eq!(be.get_att(GLOBAL_ATT, "title").unwrap(), b"log test");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_rename_survives_reopen() {
        let path = tmp("rename.log");
        {
            let mut be = LogBackend::create(&path, OpenMode::WRITE).unwrap();
            let x = be.def_dim("x", 4).unwrap();
            let v = be.def_var("v", PioType::Int, &[x]).unwrap();
            // Renamed before its first write: the lazy definition goes
            // out under the new name.
            let w = be.def_var("w", PioType::Int, &[x]).unwrap();
            be.rename_var(w, "w2").unwrap();

            be.put_vars(v, &[0], &[4], &[], &int_bytes(&[1, 2, 3, 4]))
                .unwrap();
            be.put_vars(w, &[0], &[1], &[], &int_bytes(&[9])).unwrap();
            // Renamed after the definition was logged.
            be.rename_var(v, "v2").unwrap();
            be.rename_dim(x, "lon").unwrap();
            be.close().unwrap();
        }

        let be = LogBackend::open(&path, OpenMode::empty()).unwrap();
        assert_eq!(be.inq_dim(0).unwrap().0, "lon");
        assert!(be.inq_dimid("x").is_err());
        let v = be.inq_varid("v2").unwrap();
        assert!(be.inq_varid("v").is_err());
        assert_eq!(
            be.get_vars(v, &[0], &[4], &[]).unwrap(),
            int_bytes(&[1, 2, 3, 4])
        );
        let w = be.inq_varid("w2").unwrap();
        assert_eq!(be.get_vars(w, &[0], &[1], &[]).unwrap(), int_bytes(&[9]));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_later_record_wins_on_replay() {
        let path = tmp("replay.log");
        let mut be = LogBackend::create(&path, OpenMode::WRITE).unwrap();
        let x = be.def_dim("x", 2).unwrap();
        let v = be.def_var("v", PioType::Int, &[x]).unwrap();
        be.put_vars(v, &[0], &[2], &[], &int_bytes(&[1, 2])).unwrap();
        be.put_vars(v, &[1], &[1], &[], &int_bytes(&[9])).unwrap();
        assert_eq!(be.get_vars(v, &[0], &[2], &[]).unwrap(), int_bytes(&[1, 9]));
        be.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_unwritten_elements_read_fill() {
        let path = tmp("holes.log");
        let mut be = LogBackend::create(&path, OpenMode::WRITE).unwrap();
        let x = be.def_dim("x", 3).unwrap();
        let v = be.def_var("v", PioType::Int, &[x]).unwrap();
        be.def_var_fill(v, false, Some(&int_bytes(&[-1]))).unwrap();
        be.put_vars(v, &[1], &[1], &[], &int_bytes(&[5])).unwrap();
        assert_eq!(
            be.get_vars(v, &[0], &[3], &[]).unwrap(),
            int_bytes(&[-1, 5, -1])
        );
        be.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let path = tmp("bad.log");
        std::fs::write(&path, b"CDF\x01whatever").unwrap();
        assert!(LogBackend::open(&path, OpenMode::empty()).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
