//! Communication layer.
//!
//! Everything the library needs from the message-passing substrate is
//! captured by the [`Comm`] trait: ranked point-to-point byte transfer plus
//! a small set of collectives. The collectives have default implementations
//! built on the p2p primitives so a backend only has to supply `send`,
//! `recv`, `recv_any` and `split`; the MPI backend overrides them with
//! native calls.
//!
//! All library operations are collective and execute in the same order on
//! every rank of a communicator, so matching by `(source, tag)` FIFO order
//! is sufficient; no sequence numbers are needed at this layer.

mod local;
#[cfg(feature = "mpi")]
mod mpi_comm;

pub use local::LocalComm;
#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;

use std::sync::Arc;

/// Message tags reserved for internal protocols. User-level exchanges all
/// go through these bands; the library never exposes raw tags.
pub mod tags {
    pub const BARRIER: i32 = 1000;
    pub const BCAST: i32 = 1001;
    pub const REDUCE: i32 = 1002;
    pub const ALLTOALL: i32 = 1003;
    pub const GATHER: i32 = 1004;
    pub const SPLIT: i32 = 1005;
    /// Zero-byte handshake preceding a flow-controlled send.
    pub const SWAPM_READY: i32 = 1100;
    pub const SWAPM_DATA: i32 = 1101;
    /// Async protocol envelope (compute root -> io root).
    pub const MSG_HDR: i32 = 1200;
    /// Async protocol payload items (compute root -> io ranks).
    pub const MSG_PAYLOAD: i32 = 1201;
    /// Async protocol result/return values (io root -> compute ranks).
    pub const MSG_RET: i32 = 1202;
    /// Decomposition map gather for persistence.
    pub const DECOMP_GATHER: i32 = 1300;
    /// Region funnelling for serial backends.
    pub const DARRAY_SERIAL: i32 = 1400;
}

/// Reduction operator for the allreduce collectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Min,
    Max,
    Sum,
}

/// Ranked communicator over an ordered process group.
pub trait Comm: Send + Sync {
    /// This process's rank within the group, `0..size`.
    fn rank(&self) -> i32;

    /// Number of processes in the group.
    fn size(&self) -> i32;

    /// Buffered send of a byte message. Sends to the same `(peer, tag)`
    /// arrive in submission order; sends never block on the receiver.
    fn send(&self, dest: i32, tag: i32, data: &[u8]);

    /// Blocking receive of the next message from `(src, tag)`.
    fn recv(&self, src: i32, tag: i32) -> Vec<u8>;

    /// Non-blocking receive from `(src, tag)`; `None` when nothing has
    /// arrived yet.
    fn try_recv(&self, src: i32, tag: i32) -> Option<Vec<u8>>;

    /// Blocking receive from any source with the given tag. Returns the
    /// source rank alongside the message.
    fn recv_any(&self, tag: i32) -> (i32, Vec<u8>);

    /// Collective split into disjoint subgroups by color. Ranks passing
    /// `None` get `None` back; ranks sharing a color value form a new
    /// communicator ordered by `(key, parent rank)`.
    fn split(&self, color: Option<i32>, key: i32) -> Option<Arc<dyn Comm>>;

    /// Collective barrier.
    fn barrier(&self) {
        let me = self.rank();
        let size = self.size();
        if me == 0 {
            for src in 1..size {
                let _ = self.recv(src, tags::BARRIER);
            }
            for dest in 1..size {
                self.send(dest, tags::BARRIER, &[]);
            }
        } else {
            self.send(0, tags::BARRIER, &[]);
            let _ = self.recv(0, tags::BARRIER);
        }
    }

    /// Collective broadcast of a byte buffer from `root`. The buffer is
    /// replaced on every non-root rank; only the root's contents matter.
    fn broadcast(&self, root: i32, buf: &mut Vec<u8>) {
        let me = self.rank();
        if me == root {
            for dest in 0..self.size() {
                if dest != root {
                    self.send(dest, tags::BCAST, buf);
                }
            }
        } else {
            *buf = self.recv(root, tags::BCAST);
        }
    }

    /// Element-wise allreduce over i64 vectors of equal length.
    fn allreduce_i64(&self, op: ReduceOp, vals: &[i64]) -> Vec<i64> {
        let me = self.rank();
        let size = self.size();
        if me == 0 {
            let mut acc = vals.to_vec();
            for src in 1..size {
                let theirs = i64s_from_bytes(&self.recv(src, tags::REDUCE));
                for (a, b) in acc.iter_mut().zip(theirs) {
                    *a = match op {
                        ReduceOp::Min => (*a).min(b),
                        ReduceOp::Max => (*a).max(b),
                        ReduceOp::Sum => *a + b,
                    };
                }
            }
            let mut out = bytes_from_i64s(&acc);
            self.broadcast(0, &mut out);
            acc
        } else {
            self.send(0, tags::REDUCE, &bytes_from_i64s(vals));
            let mut out = Vec::new();
            self.broadcast(0, &mut out);
            i64s_from_bytes(&out)
        }
    }

    /// Element-wise allreduce over f64 vectors of equal length.
    fn allreduce_f64(&self, op: ReduceOp, vals: &[f64]) -> Vec<f64> {
        let me = self.rank();
        let size = self.size();
        if me == 0 {
            let mut acc = vals.to_vec();
            for src in 1..size {
                let theirs = f64s_from_bytes(&self.recv(src, tags::REDUCE));
                for (a, b) in acc.iter_mut().zip(theirs) {
                    *a = match op {
                        ReduceOp::Min => (*a).min(b),
                        ReduceOp::Max => (*a).max(b),
                        ReduceOp::Sum => *a + b,
                    };
                }
            }
            let mut out = bytes_from_f64s(&acc);
            self.broadcast(0, &mut out);
            acc
        } else {
            self.send(0, tags::REDUCE, &bytes_from_f64s(vals));
            let mut out = Vec::new();
            self.broadcast(0, &mut out);
            f64s_from_bytes(&out)
        }
    }

    /// All-to-all of one i32 per peer. `send[p]` goes to rank `p`; the
    /// result holds the value received from each rank.
    fn alltoall_i32(&self, send: &[i32]) -> Vec<i32> {
        let me = self.rank() as usize;
        let size = self.size() as usize;
        debug_assert_eq!(send.len(), size);
        let mut recv = vec![0i32; size];
        for p in 0..size {
            if p == me {
                recv[me] = send[me];
            } else {
                self.send(p as i32, tags::ALLTOALL, &send[p].to_ne_bytes());
            }
        }
        for p in 0..size {
            if p != me {
                let b = self.recv(p as i32, tags::ALLTOALL);
                recv[p] = i32::from_ne_bytes(b[..4].try_into().unwrap());
            }
        }
        recv
    }

    /// Gather per-rank byte blocks on `root`. Returns `Some(blocks)` in
    /// rank order on the root, `None` elsewhere.
    fn gather_bytes(&self, root: i32, part: &[u8]) -> Option<Vec<Vec<u8>>> {
        let me = self.rank();
        if me == root {
            let mut blocks = Vec::with_capacity(self.size() as usize);
            for src in 0..self.size() {
                if src == root {
                    blocks.push(part.to_vec());
                } else {
                    blocks.push(self.recv(src, tags::GATHER));
                }
            }
            Some(blocks)
        } else {
            self.send(root, tags::GATHER, part);
            None
        }
    }

    /// Allgather of per-rank byte blocks; every rank gets all blocks in
    /// rank order.
    fn allgather_bytes(&self, part: &[u8]) -> Vec<Vec<u8>> {
        let gathered = self.gather_bytes(0, part);
        let mut flat = Vec::new();
        if let Some(blocks) = &gathered {
            for b in blocks {
                flat.extend_from_slice(&(b.len() as u64).to_ne_bytes());
                flat.extend_from_slice(b);
            }
        }
        self.broadcast(0, &mut flat);
        let mut out = Vec::with_capacity(self.size() as usize);
        let mut off = 0usize;
        while off < flat.len() {
            let len = u64::from_ne_bytes(flat[off..off + 8].try_into().unwrap()) as usize;
            off += 8;
            out.push(flat[off..off + len].to_vec());
            off += len;
        }
        out
    }
}

/// Collective agreement on a status code. Negative (library/backend)
/// codes win via the minimum; when none are present, a positive errno
/// surfaces via the maximum; all zeros mean success. Every rank must call
/// this whenever any rank might.
pub fn agree_status(comm: &Arc<dyn Comm>, code: i32) -> i32 {
    let min = comm.allreduce_i64(ReduceOp::Min, &[code as i64])[0] as i32;
    let max = comm.allreduce_i64(ReduceOp::Max, &[code as i64])[0] as i32;
    if min < 0 {
        min
    } else {
        max
    }
}

// Byte-vector helpers for homogeneous-host wire payloads.

pub fn bytes_from_i32s(vals: &[i32]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

pub fn i32s_from_bytes(buf: &[u8]) -> Vec<i32> {
    buf.chunks_exact(4)
        .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

pub fn bytes_from_i64s(vals: &[i64]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

pub fn i64s_from_bytes(buf: &[u8]) -> Vec<i64> {
    buf.chunks_exact(8)
        .map(|c| i64::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

pub fn bytes_from_f64s(vals: &[f64]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

pub fn f64s_from_bytes(buf: &[u8]) -> Vec<f64> {
    buf.chunks_exact(8)
        .map(|c| f64::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_on_world<F>(n: usize, f: F)
    where
        F: Fn(Arc<dyn Comm>) + Send + Sync + Clone + 'static,
    {
        let comms = LocalComm::world(n);
        let mut handles = Vec::new();
        for comm in comms {
            let f = f.clone();
            handles.push(thread::spawn(move || f(comm)));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_barrier_and_broadcast() {
        run_on_world(4, |comm| {
            comm.barrier();
            let mut buf = if comm.rank() == 2 {
                vec![9u8, 8, 7]
            } else {
                Vec::new()
            };
            comm.broadcast(2, &mut buf);
            assert_eq!(buf, vec![9, 8, 7]);
        });
    }

    #[test]
    fn test_allreduce() {
        run_on_world(4, |comm| {
            let r = comm.rank() as i64;
            assert_eq!(comm.allreduce_i64(ReduceOp::Sum, &[r])[0], 6);
            assert_eq!(comm.allreduce_i64(ReduceOp::Max, &[r, 10 - r]), vec![3, 10]);
            assert_eq!(comm.allreduce_i64(ReduceOp::Min, &[r])[0], 0);
        });
    }

    #[test]
    fn test_alltoall() {
        run_on_world(3, |comm| {
            let me = comm.rank();
            let send: Vec<i32> = (0..3).map(|p| me * 10 + p).collect();
            let recv = comm.alltoall_i32(&send);
            for p in 0..3 {
                assert_eq!(recv[p as usize], p * 10 + me);
            }
        });
    }

    #[test]
    fn test_gather_and_allgather() {
        run_on_world(4, |comm| {
            let part = vec![comm.rank() as u8; (comm.rank() + 1) as usize];
            let g = comm.gather_bytes(1, &part);
            if comm.rank() == 1 {
                let blocks = g.unwrap();
                assert_eq!(blocks[3], vec![3u8, 3, 3, 3]);
            } else {
                assert!(g.is_none());
            }
            let all = comm.allgather_bytes(&part);
            assert_eq!(all.len(), 4);
            assert_eq!(all[2], vec![2u8, 2, 2]);
        });
    }

    #[test]
    fn test_agree_status_prefers_library_codes() {
        run_on_world(3, |comm| {
            // All success.
            assert_eq!(agree_status(&comm, 0), 0);
            // One positive errno surfaces even though min is zero.
            let errno = if comm.rank() == 1 { 13 } else { 0 };
            assert_eq!(agree_status(&comm, errno), 13);
            // A negative library code beats a positive errno.
            let mixed = match comm.rank() {
                0 => -502,
                1 => 13,
                _ => 0,
            };
            assert_eq!(agree_status(&comm, mixed), -502);
        });
    }

    #[test]
    fn test_split_into_two_groups() {
        run_on_world(4, |comm| {
            let color = comm.rank() % 2;
            let sub = comm.split(Some(color), comm.rank()).unwrap();
            assert_eq!(sub.size(), 2);
            assert_eq!(sub.rank(), comm.rank() / 2);
            let s = sub.allreduce_i64(ReduceOp::Sum, &[comm.rank() as i64])[0];
            assert_eq!(s, if color == 0 { 2 } else { 4 });
        });
    }

    #[test]
    fn test_split_none_excluded() {
        run_on_world(3, |comm| {
            let color = if comm.rank() == 0 { None } else { Some(0) };
            let sub = comm.split(color, comm.rank());
            if comm.rank() == 0 {
                assert!(sub.is_none());
            } else {
                assert_eq!(sub.unwrap().size(), 2);
            }
        });
    }
}
