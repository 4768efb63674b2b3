//! Core of a parallel scientific I/O library: compute ranks hand in
//! per-rank slices of globally decomposed arrays, a smaller set of io
//! ranks aggregates them, and a single coherent self-describing array
//! file is read or written through a pluggable storage backend.

pub mod backend;
pub mod comm;
pub mod darray;
pub mod decomp;
pub mod decompio;
pub mod error;
pub mod file;
pub mod getput;
pub mod iosystem;
pub mod logging;
pub mod msg;
pub mod mvcache;
pub mod rearrange;
pub mod reqblock;
pub mod serializer;
pub mod stats;
pub mod swapm;
pub mod tables;
pub mod tree;
pub mod types;

// Re-export the primary types and entry points for convenience.
pub use backend::{BackendFactory, GLOBAL_ATT, IoBackend, IoType, OpenMode, VarInfo};
pub use comm::{Comm, LocalComm, ReduceOp};
#[cfg(feature = "mpi")]
pub use comm::MpiComm;
pub use darray::{read_darray, write_darray, write_darray_multi};
pub use decomp::{IoDesc, IoRegion, free_decomp, get_decomp, init_decomp};
pub use decompio::{read_map_file, read_nc_decomp, write_map_file, write_nc_decomp};
pub use error::{ErrorHandler, PioError, Result, strerror};
pub use file::{
    DimDesc, FileDesc, PIO_UNLIMITED, VarDesc, advanceframe, closefile, createfile, def_dim,
    def_var, def_var_chunking, def_var_deflate, def_var_endian, def_var_fill, del_att, deletefile,
    enddef, inq, inq_dim, inq_dimid, inq_format, inq_unlimdims, inq_var, inq_var_fill, inq_varid,
    openfile, redef, rename_att, rename_dim, rename_var, set_fill, setframe, sync_file,
};
pub use getput::{
    copy_att, get_att_tc, get_var1_tc, get_var_tc, get_vars_tc, inq_att, inq_attname, put_att_tc,
    put_var1_tc, put_var_tc, put_vars_tc,
};
pub use iosystem::{
    FcMode, IoSystem, RearrDirOpts, RearrOpts, Rearranger, finalize, get_iosystem, init_async,
    init_intracomm, init_intracomm_from_ranks, set_error_handler, set_rearr_opts,
};
pub use types::PioType;

/// Version string reported by the library-info surface.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// True when the given iotype has a backend registered in this build.
pub fn iotype_available(iotype: IoType) -> bool {
    backend::configured_iotypes().contains(&iotype)
}
