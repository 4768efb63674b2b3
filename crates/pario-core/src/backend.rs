//! Backend dispatch.
//!
//! Each open file is bound at open/create time to one of the configured
//! storage backends through the [`IoBackend`] trait. Backend crates
//! implement the trait over their container format and register a factory
//! here; which ones are present is a compile-time property of the final
//! binary, and the library reports the configured set.

use std::sync::{Mutex, OnceLock};

use bitflags::bitflags;

use crate::error::{PioError, Result};
use crate::types::PioType;

/// Physical storage flavour of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum IoType {
    /// Classic container, serial access from io rank 0.
    Netcdf = 1,
    /// Classic container written in parallel with nonblocking puts.
    Pnetcdf = 2,
    /// v4/HDF5 container, serial access.
    Netcdf4c = 3,
    /// v4/HDF5 container, parallel access.
    Netcdf4p = 4,
    /// Log-structured record container.
    Adios = 5,
}

impl IoType {
    pub fn from_i32(v: i32) -> Result<IoType> {
        match v {
            1 => Ok(IoType::Netcdf),
            2 => Ok(IoType::Pnetcdf),
            3 => Ok(IoType::Netcdf4c),
            4 => Ok(IoType::Netcdf4p),
            5 => Ok(IoType::Adios),
            _ => Err(PioError::BadIoType),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IoType::Netcdf => "netcdf",
            IoType::Pnetcdf => "pnetcdf",
            IoType::Netcdf4c => "netcdf4c",
            IoType::Netcdf4p => "netcdf4p",
            IoType::Adios => "adios",
        }
    }

    /// True when every io rank drives the backend; false when only io
    /// rank 0 touches it.
    pub fn is_parallel(self) -> bool {
        matches!(self, IoType::Pnetcdf | IoType::Netcdf4p | IoType::Adios)
    }
}

bitflags! {
    /// Open/create mode bits, classic-container conventions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        /// Open writable (clobber on create unless NOCLOBBER).
        const WRITE = 0x0001;
        /// Fail create if the file already exists.
        const NOCLOBBER = 0x0004;
        /// 64-bit-offset container flavour (v2).
        const OFFSET64 = 0x0200;
        /// 64-bit-data container flavour (v5).
        const DATA64 = 0x0020;
    }
}

/// Static description of one variable, as the backend sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarInfo {
    pub name: String,
    pub xtype: PioType,
    pub dimids: Vec<i32>,
    pub natts: i32,
}

/// Pseudo-varid addressing file-global attributes.
pub const GLOBAL_ATT: i32 = -1;

/// The call menu every storage backend presents.
///
/// Data and attribute payloads cross this boundary as native-endian bytes
/// of the variable's (or attribute's) declared on-disk type; the
/// type-neutral layer above converts to and from user memory types.
pub trait IoBackend {
    fn iotype(&self) -> IoType;

    // Define mode.
    fn redef(&mut self) -> Result<()>;
    fn enddef(&mut self) -> Result<()>;
    fn def_dim(&mut self, name: &str, len: i64) -> Result<i32>;
    fn def_var(&mut self, name: &str, xtype: PioType, dimids: &[i32]) -> Result<i32>;
    fn def_var_fill(&mut self, varid: i32, no_fill: bool, fill: Option<&[u8]>) -> Result<()>;
    fn rename_dim(&mut self, dimid: i32, name: &str) -> Result<()>;
    fn rename_var(&mut self, varid: i32, name: &str) -> Result<()>;
    fn rename_att(&mut self, varid: i32, old: &str, new: &str) -> Result<()>;
    fn del_att(&mut self, varid: i32, name: &str) -> Result<()>;
    /// Set the fill mode; returns the previous mode.
    fn set_fill(&mut self, fill: bool) -> Result<bool>;

    // Inquiry.
    /// `(ndims, nvars, ngatts, unlimdimid)`; unlimdimid is -1 if none.
    fn inq(&self) -> Result<(i32, i32, i32, i32)>;
    fn inq_format(&self) -> Result<i32>;
    fn inq_dim(&self, dimid: i32) -> Result<(String, i64)>;
    fn inq_dimid(&self, name: &str) -> Result<i32>;
    fn inq_var(&self, varid: i32) -> Result<VarInfo>;
    fn inq_varid(&self, name: &str) -> Result<i32>;
    fn inq_var_fill(&self, varid: i32) -> Result<(bool, Vec<u8>)>;
    /// `(stored type, length in elements)`.
    fn inq_att(&self, varid: i32, name: &str) -> Result<(PioType, i64)>;
    fn inq_attname(&self, varid: i32, attnum: i32) -> Result<String>;
    fn inq_unlimdims(&self) -> Result<Vec<i32>>;

    // Attributes.
    fn put_att(&mut self, varid: i32, name: &str, xtype: PioType, data: &[u8]) -> Result<()>;
    fn get_att(&self, varid: i32, name: &str) -> Result<Vec<u8>>;

    // Strided hyperslab data access.
    fn put_vars(
        &mut self,
        varid: i32,
        start: &[i64],
        count: &[i64],
        stride: &[i64],
        data: &[u8],
    ) -> Result<()>;
    fn get_vars(&self, varid: i32, start: &[i64], count: &[i64], stride: &[i64])
    -> Result<Vec<u8>>;

    /// Nonblocking put; returns a request id completed by `wait_all`.
    /// Backends without buffered writes execute eagerly and return a
    /// sentinel the planner still tracks for sizing.
    fn put_vars_nb(
        &mut self,
        varid: i32,
        start: &[i64],
        count: &[i64],
        stride: &[i64],
        data: &[u8],
    ) -> Result<i32> {
        self.put_vars(varid, start, count, stride, data)?;
        Ok(REQ_COMPLETE)
    }

    /// Complete outstanding nonblocking puts in submission order.
    fn wait_all(&mut self, reqs: &[i32]) -> Result<()> {
        let _ = reqs;
        Ok(())
    }

    /// Implementation hint (alignment, collective buffering, ...); ignored
    /// by backends that carry none.
    fn set_hint(&mut self, name: &str, value: &str) {
        let _ = (name, value);
    }

    fn sync(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Request id returned by eager `put_vars_nb` implementations.
pub const REQ_COMPLETE: i32 = -1;

/// Backend constructor registered by a backend crate.
#[derive(Clone, Copy)]
pub struct BackendFactory {
    pub iotype: IoType,
    /// `create=true` clobbers per mode; `create=false` opens existing.
    pub open: fn(path: &str, mode: OpenMode, create: bool) -> Result<Box<dyn IoBackend>>,
}

fn registry() -> &'static Mutex<Vec<BackendFactory>> {
    static REGISTRY: OnceLock<Mutex<Vec<BackendFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Register a backend factory; idempotent per iotype.
pub fn register_backend(factory: BackendFactory) {
    let mut reg = registry().lock().unwrap();
    if !reg.iter().any(|f| f.iotype == factory.iotype) {
        reg.push(factory);
    }
}

/// The iotypes available in this build, ascending.
pub fn configured_iotypes() -> Vec<IoType> {
    let mut types: Vec<IoType> = registry().lock().unwrap().iter().map(|f| f.iotype).collect();
    types.sort_by_key(|t| *t as i32);
    types
}

/// Instantiate a backend for one file. The 64-bit container flags are
/// silently masked for v4 backends, which reject them.
pub fn open_backend(
    iotype: IoType,
    path: &str,
    mode: OpenMode,
    create: bool,
) -> Result<Box<dyn IoBackend>> {
    let factory = {
        let reg = registry().lock().unwrap();
        reg.iter().find(|f| f.iotype == iotype).copied()
    };
    let factory = factory.ok_or(PioError::BadIoType)?;
    let mut mode = mode;
    if matches!(iotype, IoType::Netcdf4c | IoType::Netcdf4p) {
        mode.remove(OpenMode::OFFSET64 | OpenMode::DATA64);
    }
    (factory.open)(path, mode, create)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iotype_codes() {
        for t in [
            IoType::Netcdf,
            IoType::Pnetcdf,
            IoType::Netcdf4c,
            IoType::Netcdf4p,
            IoType::Adios,
        ] {
            assert_eq!(IoType::from_i32(t as i32).unwrap(), t);
        }
        assert!(matches!(IoType::from_i32(0), Err(PioError::BadIoType)));
    }

    #[test]
    fn test_parallel_classification() {
        assert!(!IoType::Netcdf.is_parallel());
        assert!(IoType::Pnetcdf.is_parallel());
        assert!(!IoType::Netcdf4c.is_parallel());
        assert!(IoType::Netcdf4p.is_parallel());
        assert!(IoType::Adios.is_parallel());
    }

    #[test]
    fn test_open_unconfigured_iotype() {
        // The core crate registers nothing; v4 stays unconfigured here.
        assert!(matches!(
            open_backend(IoType::Netcdf4p, "x.nc", OpenMode::WRITE, false),
            Err(PioError::BadIoType)
        ));
    }
}
