//! End-to-end runs of the distributed-array path against the
//! log-structured backend, which every io rank drives in parallel.

use std::sync::Arc;

use pario_core::backend::{GLOBAL_ATT, IoType, OpenMode};
use pario_core::comm::{Comm, LocalComm};
use pario_core::iosystem::{self, Rearranger};
use pario_core::types::PioType;

fn run_on_world<F>(n: usize, f: F)
where
    F: Fn(Arc<dyn Comm>) + Send + Sync + Clone + 'static,
{
    pario_backend_log::register();
    let comms = LocalComm::world(n);
    let mut handles = Vec::new();
    for comm in comms {
        let f = f.clone();
        handles.push(std::thread::spawn(move || f(comm)));
    }
    for h in handles {
        h.join().unwrap();
    }
}

fn scratch(name: &str) -> String {
    let dir = tempfile::Builder::new()
        .prefix("pario-log-scenarios")
        .tempdir()
        .unwrap()
        .keep();
    dir.join(name).to_string_lossy().to_string()
}

fn int_bytes(vals: &[i32]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

fn ints_of(buf: &[u8]) -> Vec<i32> {
    buf.chunks_exact(4)
        .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

#[test]
fn test_darray_roundtrip_on_log_backend() {
    let path = scratch("darray.log");
    let _ = std::fs::remove_file(&path);
    let p = path.clone();
    run_on_world(4, move |comm| {
        let me = comm.rank();
        let iosysid = iosystem::init_intracomm(comm, 2, 2, 0, Rearranger::Box).unwrap();
        let ncid = pario_core::createfile(iosysid, IoType::Adios, &p, OpenMode::WRITE).unwrap();
        let x = pario_core::def_dim(ncid, "x", 16).unwrap();
        let v = pario_core::def_var(ncid, "v", PioType::Int, &[x]).unwrap();
        pario_core::enddef(ncid).unwrap();

        let map: Vec<i64> = (1..=4).map(|i| (me * 4) as i64 + i).collect();
        let ioid =
            pario_core::init_decomp(iosysid, PioType::Int, &[16], &map, None, None, None).unwrap();
        let data: Vec<i32> = map.iter().map(|&m| 7 * m as i32).collect();
        pario_core::write_darray(ncid, v, ioid, &int_bytes(&data), None).unwrap();
        pario_core::sync_file(ncid).unwrap();

        let mut back = vec![0u8; 16];
        pario_core::read_darray(ncid, v, ioid, &mut back).unwrap();
        assert_eq!(ints_of(&back), data);

        // The lazy definition left the side-channel metadata behind.
        let nd = pario_core::get_att_tc(ncid, GLOBAL_ATT, "v/__pio__/ndims", PioType::Int).unwrap();
        assert_eq!(ints_of(&nd), vec![1]);

        pario_core::closefile(ncid).unwrap();
        iosystem::finalize(iosysid).unwrap();
    });

    // The file leads with the log magic.
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[..4], b"LOG1");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_log_backend_attribute_path() {
    let path = scratch("atts.log");
    let _ = std::fs::remove_file(&path);
    let p = path.clone();
    run_on_world(2, move |comm| {
        let iosysid = iosystem::init_intracomm(comm, 1, 1, 0, Rearranger::Box).unwrap();
        let ncid = pario_core::createfile(iosysid, IoType::Adios, &p, OpenMode::WRITE).unwrap();
        pario_core::put_att_tc(
            ncid,
            GLOBAL_ATT,
            "run",
            PioType::Char,
            PioType::Char,
            b"case-012",
        )
        .unwrap();
        pario_core::closefile(ncid).unwrap();

        let (ncid, _) =
            pario_core::openfile(iosysid, IoType::Adios, &p, OpenMode::empty(), false).unwrap();
        let run = pario_core::get_att_tc(ncid, GLOBAL_ATT, "run", PioType::Char).unwrap();
        assert_eq!(&run, b"case-012");
        pario_core::closefile(ncid).unwrap();
        iosystem::finalize(iosysid).unwrap();
    });
    let _ = std::fs::remove_file(&path);
}
