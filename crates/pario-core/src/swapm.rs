//! Flow-controlled generalized all-to-all.
//!
//! `swapm` moves one optional byte message per peer pair, parameterized by
//! the rearranger flow-control options. There is no cross-peer ordering
//! promise; within a single (sender, receiver) pair messages arrive in
//! submission order. Cancellation is not supported: the call either
//! completes on all peers or the communicator is considered failed.

use std::sync::Arc;

use crate::comm::{Comm, tags};
use crate::iosystem::{REARR_UNLIMITED_PEND_REQ, RearrDirOpts};

/// Exchange `sendbufs[p]` with every peer `p`; empty buffers mean "no
/// message". `will_recv[p]` must be true exactly when peer `p` sends a
/// non-empty message here; both sides derive it from the same exchange
/// metadata.
///
/// Flow control:
/// - with handshake on, a zero-byte ready message is exchanged before each
///   real send so the sender never outruns the receiver;
/// - `max_pending_reqs` caps sends issued ahead of the receive drain;
/// - with everything off the call degenerates to a dense exchange.
pub fn swapm(
    comm: &Arc<dyn Comm>,
    sendbufs: Vec<Vec<u8>>,
    will_recv: &[bool],
    fc: &RearrDirOpts,
) -> Vec<Vec<u8>> {
    let size = comm.size() as usize;
    let me = comm.rank() as usize;
    debug_assert_eq!(sendbufs.len(), size);
    debug_assert_eq!(will_recv.len(), size);

    let mut recvbufs: Vec<Vec<u8>> = vec![Vec::new(); size];

    // Self-exchange never touches the wire.
    let mut sendbufs = sendbufs;
    if !sendbufs[me].is_empty() {
        recvbufs[me] = std::mem::take(&mut sendbufs[me]);
    }

    // Rotated peer order: rank i starts with peer (i+1) mod P to avoid
    // every rank hammering peer 0 first.
    let rotated: Vec<usize> = (1..size).map(|i| (me + i) % size).collect();

    let unlimited = fc.max_pending_reqs == REARR_UNLIMITED_PEND_REQ;
    if !fc.handshake && unlimited {
        // Dense exchange.
        for &p in &rotated {
            if !sendbufs[p].is_empty() {
                comm.send(p as i32, tags::SWAPM_DATA, &sendbufs[p]);
            }
        }
        for &p in &rotated {
            if will_recv[p] {
                recvbufs[p] = comm.recv(p as i32, tags::SWAPM_DATA);
            }
        }
        return recvbufs;
    }

    // Receiver side of the handshake: tell every expected sender we are
    // ready before draining anything, so no ready/data cycle can form.
    if fc.handshake {
        for &p in &rotated {
            if will_recv[p] {
                comm.send(p as i32, tags::SWAPM_READY, &[]);
            }
        }
    }

    let max_pending = if unlimited {
        usize::MAX
    } else {
        fc.max_pending_reqs as usize
    };

    // Outstanding receives, drained in arrival order so a capped sender can
    // never join a circular wait: whichever expected message is already in
    // flight is taken first.
    let mut expected: Vec<usize> = rotated.iter().copied().filter(|&p| will_recv[p]).collect();
    let mut drain_one = |expected: &mut Vec<usize>, recvbufs: &mut Vec<Vec<u8>>| {
        loop {
            for i in 0..expected.len() {
                let q = expected[i];
                if let Some(data) = comm.try_recv(q as i32, tags::SWAPM_DATA) {
                    recvbufs[q] = data;
                    expected.remove(i);
                    return;
                }
            }
            std::thread::yield_now();
        }
    };

    let mut pending = 0usize;
    for &p in &rotated {
        if sendbufs[p].is_empty() {
            continue;
        }
        if fc.handshake {
            let _ = comm.recv(p as i32, tags::SWAPM_READY);
        }
        // The isend flag selects buffered-immediate vs ready-mode sends in
        // the MPI layer; both are buffered sends over this transport.
        let _ = fc.isend;
        comm.send(p as i32, tags::SWAPM_DATA, &sendbufs[p]);
        pending += 1;

        if pending >= max_pending && !expected.is_empty() {
            drain_one(&mut expected, &mut recvbufs);
            pending -= 1;
        }
    }

    while !expected.is_empty() {
        drain_one(&mut expected, &mut recvbufs);
    }

    recvbufs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use std::thread;

    fn all_fc_variants() -> Vec<RearrDirOpts> {
        vec![
            RearrDirOpts {
                handshake: false,
                isend: false,
                max_pending_reqs: REARR_UNLIMITED_PEND_REQ,
            },
            RearrDirOpts {
                handshake: true,
                isend: false,
                max_pending_reqs: REARR_UNLIMITED_PEND_REQ,
            },
            RearrDirOpts {
                handshake: true,
                isend: true,
                max_pending_reqs: 1,
            },
            RearrDirOpts {
                handshake: false,
                isend: true,
                max_pending_reqs: 2,
            },
        ]
    }

    fn run_exchange(fc: RearrDirOpts) {
        let n = 4usize;
        let comms = LocalComm::world(n);
        let mut handles = Vec::new();
        for comm in comms {
            handles.push(thread::spawn(move || {
                let me = comm.rank() as usize;
                // Every pair exchanges a distinct payload; rank r sends
                // nothing to peer (r+2)%4 to exercise empty slots.
                let hole = (me + 2) % n;
                let sendbufs: Vec<Vec<u8>> = (0..n)
                    .map(|p| {
                        if p == hole {
                            Vec::new()
                        } else {
                            vec![me as u8, p as u8, 0xAB]
                        }
                    })
                    .collect();
                let will_recv: Vec<bool> = (0..n).map(|p| (p + 2) % n != me).collect();
                let out = swapm(&comm, sendbufs, &will_recv, &fc);
                for p in 0..n {
                    if (p + 2) % n == me {
                        assert!(out[p].is_empty());
                    } else {
                        assert_eq!(out[p], vec![p as u8, me as u8, 0xAB]);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_swapm_all_flow_control_variants() {
        for fc in all_fc_variants() {
            run_exchange(fc);
        }
    }

    #[test]
    fn test_swapm_pairwise_order_preserved() {
        let comms = LocalComm::world(2);
        let mut handles = Vec::new();
        for comm in comms {
            handles.push(thread::spawn(move || {
                let fc = RearrDirOpts {
                    handshake: true,
                    isend: false,
                    max_pending_reqs: 1,
                };
                // Two back-to-back swapms on the same pair must deliver in
                // submission order.
                for round in 0u8..2 {
                    let me = comm.rank() as usize;
                    let peer = 1 - me;
                    let mut send = vec![Vec::new(), Vec::new()];
                    send[peer] = vec![round];
                    let will_recv = vec![me == 1, me == 0];
                    let out = swapm(&comm, send, &will_recv, &fc);
                    assert_eq!(out[peer], vec![round]);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
