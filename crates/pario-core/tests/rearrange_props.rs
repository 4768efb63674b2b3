//! Multi-rank properties of the decomposition engine, run on the
//! in-process communicator: rearrangement adjointness, hole metadata, and
//! the text persistence format.

use std::sync::Arc;

use pario_core::comm::{Comm, LocalComm};
use pario_core::decomp::get_decomp;
use pario_core::iosystem::{self, Rearranger};
use pario_core::rearrange::{rearrange_comp2io, rearrange_io2comp};
use pario_core::types::PioType;

fn run_on_world<F>(n: usize, f: F)
where
    F: Fn(Arc<dyn Comm>) + Send + Sync + Clone + 'static,
{
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

fn int_bytes(vals: &[i32]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

fn ints_of(buf: &[u8]) -> Vec<i32> {
    buf.chunks_exact(4)
        .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

fn adjoint_case(rearranger: Rearranger) {
    run_on_world(4, move |comm| {
        let me = comm.rank();
        let iosysid = iosystem::init_intracomm(comm, 2, 2, 0, rearranger).unwrap();
        // Contiguous 4-element slices of a 16-element array, no holes.
        let map: Vec<i64> = (1..=4).map(|i| (me * 4 + i) as i64).collect();
        let ioid =
            pario_core::init_decomp(iosysid, PioType::Int, &[16], &map, None, None, None).unwrap();
        let ios = iosystem::get_iosystem(iosysid).unwrap();
        let desc = get_decomp(ioid).unwrap();
        assert!(!desc.needsfill);

        let data: Vec<i32> = (0..4).map(|i| me * 100 + i).collect();
        let iobuf = rearrange_comp2io(&ios, &desc, &int_bytes(&data), 1);
        if ios.ioproc {
            assert_eq!(iobuf.len(), desc.llen * 4);
        } else {
            assert!(iobuf.is_empty());
        }

        let mut back = vec![0u8; 16];
        rearrange_io2comp(&ios, &desc, &iobuf, 1, &mut back);
        assert_eq!(ints_of(&back), data);

        pario_core::free_decomp(iosysid, ioid).unwrap();
        iosystem::finalize(iosysid).unwrap();
    });
}

#[test]
fn test_box_rearrange_adjoint() {
    adjoint_case(Rearranger::Box);
}

#[test]
fn test_subset_rearrange_adjoint() {
    adjoint_case(Rearranger::Subset);
}

#[test]
fn test_box_io_side_is_file_ordered() {
    run_on_world(4, |comm| {
        let me = comm.rank();
        let iosysid = iosystem::init_intracomm(comm, 2, 2, 0, Rearranger::Box).unwrap();
        // Interleaved map: rank r owns offsets r+1, r+5, r+9, r+13.
        let map: Vec<i64> = (0..4).map(|i| (me + 4 * i + 1) as i64).collect();
        let ioid =
            pario_core::init_decomp(iosysid, PioType::Int, &[16], &map, None, None, None).unwrap();
        let ios = iosystem::get_iosystem(iosysid).unwrap();
        let desc = get_decomp(ioid).unwrap();

        // Element values equal their global offsets, so the io buffer must
        // come out as consecutive integers for this slab.
        let data: Vec<i32> = map.iter().map(|&m| m as i32).collect();
        let iobuf = rearrange_comp2io(&ios, &desc, &int_bytes(&data), 1);
        if ios.ioproc {
            let vals = ints_of(&iobuf);
            let base = if ios.io_rank == 0 { 1 } else { 9 };
            let expect: Vec<i32> = (base..base + 8).collect();
            assert_eq!(vals, expect);
            assert_eq!(desc.llen, 8);
            assert_eq!(desc.regions.len(), 1);
        }

        iosystem::finalize(iosysid).unwrap();
    });
}

#[test]
fn test_subset_hole_metadata() {
    run_on_world(4, |comm| {
        let me = comm.rank();
        let iosysid = iosystem::init_intracomm(comm, 1, 1, 0, Rearranger::Subset).unwrap();
        let map: Vec<i64> = match me {
            0 => vec![1],
            1 => vec![3],
            2 => vec![],
            _ => vec![7],
        };
        let ioid =
            pario_core::init_decomp(iosysid, PioType::Int, &[8], &map, None, None, None).unwrap();
        let desc = get_decomp(ioid).unwrap();
        assert!(desc.needsfill);
        if me == 0 {
            // The single io rank owns every hole: offsets 1,3,4,5,7.
            let hole_elems: usize = desc.fill_regions.iter().map(|r| r.num_elem()).sum();
            assert_eq!(hole_elems, 5);
            assert_eq!(desc.llen, 3);
        }
        iosystem::finalize(iosysid).unwrap();
    });
}

#[test]
fn test_multivar_rearrange_blocks() {
    run_on_world(2, |comm| {
        let me = comm.rank();
        let iosysid = iosystem::init_intracomm(comm, 1, 1, 0, Rearranger::Box).unwrap();
        let map: Vec<i64> = (1..=3).map(|i| (me * 3 + i) as i64).collect();
        let ioid =
            pario_core::init_decomp(iosysid, PioType::Int, &[6], &map, None, None, None).unwrap();
        let ios = iosystem::get_iosystem(iosysid).unwrap();
        let desc = get_decomp(ioid).unwrap();

        // Two variables in one shuffle, variable-major.
        let v0: Vec<i32> = map.iter().map(|&m| m as i32).collect();
        let v1: Vec<i32> = map.iter().map(|&m| 10 * m as i32).collect();
        let mut packed = int_bytes(&v0);
        packed.extend_from_slice(&int_bytes(&v1));
        let iobuf = rearrange_comp2io(&ios, &desc, &packed, 2);
        if ios.ioproc {
            let vals = ints_of(&iobuf);
            assert_eq!(vals, vec![1, 2, 3, 4, 5, 6, 10, 20, 30, 40, 50, 60]);
        }

        let mut back = vec![0u8; packed.len()];
        rearrange_io2comp(&ios, &desc, &iobuf, 2, &mut back);
        assert_eq!(back, packed);

        iosystem::finalize(iosysid).unwrap();
    });
}

#[test]
fn test_writemap_readmap_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir
        .path()
        .join("decomp_v2001.txt")
        .to_string_lossy()
        .to_string();
    let path2 = path.clone();

    run_on_world(3, move |comm| {
        let me = comm.rank();
        let iosysid = iosystem::init_intracomm(Arc::clone(&comm), 1, 1, 0, Rearranger::Box).unwrap();
        let map: Vec<i64> = (1..=(me as i64 + 1)).map(|i| me as i64 * 4 + i).collect();
        let ioid =
            pario_core::init_decomp(iosysid, PioType::Int, &[12], &map, None, None, None).unwrap();

        pario_core::write_map_file(iosysid, &path2, ioid).unwrap();
        comm.barrier();

        let (gdims, my_map) = pario_core::read_map_file(&comm, &path2).unwrap();
        assert_eq!(gdims, vec![12]);
        assert_eq!(my_map, map);

        iosystem::finalize(iosysid).unwrap();
    });

    let text = std::fs::read_to_string(&path).unwrap();
    let first = text.lines().next().unwrap();
    assert_eq!(first, "version 2001 npes 3 ndims 1");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_init_decomp_rejects_bad_args() {
    run_on_world(1, |comm| {
        let iosysid = iosystem::init_intracomm(comm, 1, 1, 0, Rearranger::Box).unwrap();
        // Offset beyond the global array.
        assert!(
            pario_core::init_decomp(iosysid, PioType::Int, &[4], &[5], None, None, None).is_err()
        );
        // Bad dimension.
        assert!(
            pario_core::init_decomp(iosysid, PioType::Int, &[0], &[], None, None, None).is_err()
        );
        iosystem::finalize(iosysid).unwrap();
    });
}
