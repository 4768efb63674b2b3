use std::sync::Arc;

use mpi::collective::SystemOperation;
use mpi::point_to_point::{Destination, Source};
use mpi::topology::{Color, Communicator, SimpleCommunicator};

use super::{Comm, ReduceOp};

/// MPI-backed communicator, used when the library is run under a real MPI
/// launcher. Point-to-point transfers map onto tagged sends; collectives
/// use the native MPI calls.
pub struct MpiComm {
    comm: SimpleCommunicator,
}

// Safety: MPI communicators are process-level handles. The library runs one
// logical thread of activity per rank, so concurrent access never happens.
unsafe impl Send for MpiComm {}
unsafe impl Sync for MpiComm {}

impl MpiComm {
    pub fn new(comm: SimpleCommunicator) -> Self {
        Self { comm }
    }

    /// Wrap MPI_COMM_WORLD of an initialized universe.
    pub fn world(universe: &mpi::environment::Universe) -> Arc<dyn Comm> {
        Arc::new(Self::new(universe.world()))
    }
}

impl Comm for MpiComm {
    fn rank(&self) -> i32 {
        self.comm.rank()
    }

    fn size(&self) -> i32 {
        self.comm.size()
    }

    fn send(&self, dest: i32, tag: i32, data: &[u8]) {
        self.comm.process_at_rank(dest).send_with_tag(data, tag);
    }

    fn recv(&self, src: i32, tag: i32) -> Vec<u8> {
        let (msg, _status) = self.comm.process_at_rank(src).matched_probe_with_tag(tag);
        let (data, _status) = msg.matched_receive_vec::<u8>();
        data
    }

    fn try_recv(&self, src: i32, tag: i32) -> Option<Vec<u8>> {
        self.comm
            .process_at_rank(src)
            .immediate_matched_probe_with_tag(tag)
            .map(|(msg, _status)| {
                let (data, _status) = msg.matched_receive_vec::<u8>();
                data
            })
    }

    fn recv_any(&self, tag: i32) -> (i32, Vec<u8>) {
        let (msg, status) = self.comm.any_process().matched_probe_with_tag(tag);
        let src = status.source_rank();
        let (data, _status) = msg.matched_receive_vec::<u8>();
        (src, data)
    }

    fn split(&self, color: Option<i32>, key: i32) -> Option<Arc<dyn Comm>> {
        let c = match color {
            Some(v) => Color::with_value(v),
            None => Color::undefined(),
        };
        self.comm
            .split_by_color_with_key(c, key)
            .map(|sub| Arc::new(MpiComm::new(sub)) as Arc<dyn Comm>)
    }

    fn barrier(&self) {
        use mpi::collective::CommunicatorCollectives;
        self.comm.barrier();
    }

    fn broadcast(&self, root: i32, buf: &mut Vec<u8>) {
        use mpi::collective::Root;
        let root_proc = self.comm.process_at_rank(root);
        let mut len = buf.len() as u64;
        root_proc.broadcast_into(&mut len);
        buf.resize(len as usize, 0);
        root_proc.broadcast_into(&mut buf[..]);
    }

    fn allreduce_i64(&self, op: ReduceOp, vals: &[i64]) -> Vec<i64> {
        use mpi::collective::CommunicatorCollectives;
        let mut out = vec![0i64; vals.len()];
        let sys_op = match op {
            ReduceOp::Min => SystemOperation::min(),
            ReduceOp::Max => SystemOperation::max(),
            ReduceOp::Sum => SystemOperation::sum(),
        };
        self.comm.all_reduce_into(vals, &mut out[..], sys_op);
        out
    }

    fn allreduce_f64(&self, op: ReduceOp, vals: &[f64]) -> Vec<f64> {
        use mpi::collective::CommunicatorCollectives;
        let mut out = vec![0f64; vals.len()];
        let sys_op = match op {
            ReduceOp::Min => SystemOperation::min(),
            ReduceOp::Max => SystemOperation::max(),
            ReduceOp::Sum => SystemOperation::sum(),
        };
        self.comm.all_reduce_into(vals, &mut out[..], sys_op);
        out
    }

    fn alltoall_i32(&self, send: &[i32]) -> Vec<i32> {
        use mpi::collective::CommunicatorCollectives;
        let mut out = vec![0i32; send.len()];
        self.comm.all_to_all_into(send, &mut out[..]);
        out
    }
}
