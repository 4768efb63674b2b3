use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use crate::comm::Comm;
use crate::error::{ErrorHandler, PioError, Result};
use crate::stats::IoSysStats;
use crate::tables::Registry;

/// Rearranger algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Rearranger {
    Box = 1,
    Subset = 2,
}

impl Rearranger {
    pub fn from_i32(v: i32) -> Result<Rearranger> {
        match v {
            1 => Ok(Rearranger::Box),
            2 => Ok(Rearranger::Subset),
            _ => Err(PioError::InvalidArgument),
        }
    }
}

/// Flow-control mode for the rearranger exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcMode {
    /// Dense collective exchange; per-direction flow control is forced off.
    Collective,
    /// Point-to-point with the per-direction options honoured.
    Point2Point,
}

/// Unlimited pending-request sentinel for `RearrDirOpts::max_pending_reqs`.
pub const REARR_UNLIMITED_PEND_REQ: i32 = -1;

/// Per-direction rearranger flow-control options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RearrDirOpts {
    /// Exchange a zero-byte ready message before each real send.
    pub handshake: bool,
    /// Use buffered immediate sends instead of ready sends.
    pub isend: bool,
    /// Cap on in-flight sends; `REARR_UNLIMITED_PEND_REQ` lifts the cap.
    pub max_pending_reqs: i32,
}

/// Rearranger options: one mode plus one option block per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RearrOpts {
    pub fc_mode: FcMode,
    pub comp2io: RearrDirOpts,
    pub io2comp: RearrDirOpts,
}

impl Default for RearrOpts {
    fn default() -> Self {
        Self {
            fc_mode: FcMode::Point2Point,
            comp2io: RearrDirOpts {
                handshake: true,
                isend: false,
                max_pending_reqs: 64,
            },
            io2comp: RearrDirOpts {
                handshake: false,
                isend: false,
                max_pending_reqs: REARR_UNLIMITED_PEND_REQ,
            },
        }
    }
}

impl RearrOpts {
    /// The options `swapm` actually honours for one direction: collective
    /// mode forces flow control off in both directions.
    pub fn effective(&self, comp2io: bool) -> RearrDirOpts {
        if self.fc_mode == FcMode::Collective {
            return RearrDirOpts {
                handshake: false,
                isend: false,
                max_pending_reqs: REARR_UNLIMITED_PEND_REQ,
            };
        }
        if comp2io { self.comp2io } else { self.io2comp }
    }
}

/// A configured compute/IO split with its communicators.
///
/// One of these exists per `init_intracomm`/`init_async` call on every rank
/// that participates. All public library operations on the iosystem are
/// collective over `my_comm` and execute in the same order on every rank.
pub struct IoSystem {
    pub iosysid: i32,
    /// Every participating rank.
    pub union_comm: Arc<dyn Comm>,
    /// Compute group; `None` on pure io ranks in async mode.
    pub comp_comm: Option<Arc<dyn Comm>>,
    /// IO group; `None` on compute-only ranks.
    pub io_comm: Option<Arc<dyn Comm>>,
    pub union_rank: i32,
    pub comp_rank: i32,
    pub io_rank: i32,
    pub num_comptasks: i32,
    pub num_iotasks: i32,
    pub ioproc: bool,
    pub compproc: bool,
    /// Union rank of io task 0.
    pub ioroot: i32,
    /// Union rank of compute task 0 of this component.
    pub comproot: i32,
    /// Union rank per io task index.
    pub io_ranks: Vec<i32>,
    /// Union ranks of this component's compute tasks.
    pub comp_ranks: Vec<i32>,
    pub asynchronous: bool,
    /// Component index within the async union (0 in sync mode).
    pub comp_idx: i32,
    pub default_rearranger: Rearranger,
    pub error_handler: Cell<ErrorHandler>,
    pub rearr_opts: RefCell<RearrOpts>,
    /// Monotonic per-iosystem message sequence, async mode only.
    pub seq_num: Cell<i32>,
    pub prev_msg: Cell<i32>,
    pub stats: RefCell<IoSysStats>,
}

impl IoSystem {
    /// The communicator results are broadcast over: the compute group for
    /// compute ranks, the io group for io ranks.
    pub fn my_comm(&self) -> &Arc<dyn Comm> {
        if self.compproc {
            self.comp_comm.as_ref().unwrap_or(&self.union_comm)
        } else {
            self.io_comm.as_ref().unwrap_or(&self.union_comm)
        }
    }

    /// True on the rank that owns serial-backend I/O.
    pub fn is_io_root(&self) -> bool {
        self.ioproc && self.io_rank == 0
    }
}

thread_local! {
    static IOSYSTEMS: RefCell<Registry<Rc<IoSystem>>> = RefCell::new(Registry::new(1));
}

/// Look up an iosystem handle.
pub fn get_iosystem(iosysid: i32) -> Result<Rc<IoSystem>> {
    IOSYSTEMS.with(|t| t.borrow().get(iosysid)).ok_or(PioError::BadId)
}

// Ids are pre-assigned with `next_iosysid` so the descriptor can carry its
// own id; the subsequent insert is guaranteed to issue the same value.
fn register_iosystem(ios: IoSystem) -> Rc<IoSystem> {
    IOSYSTEMS.with(|t| {
        let mut tab = t.borrow_mut();
        let rc = Rc::new(ios);
        let id = tab.insert(Rc::clone(&rc));
        debug_assert_eq!(id, rc.iosysid);
        rc
    })
}

fn next_iosysid() -> i32 {
    IOSYSTEMS.with(|t| t.borrow().next_id())
}

/// Create a synchronous iosystem on one communicator, selecting io tasks
/// by `(num_iotasks, stride, base)`.
pub fn init_intracomm(
    comm: Arc<dyn Comm>,
    num_iotasks: i32,
    stride: i32,
    base: i32,
    rearranger: Rearranger,
) -> Result<i32> {
    let size = comm.size();
    if num_iotasks < 1 || stride < 1 || base < 0 {
        return Err(PioError::InvalidArgument);
    }
    if base + (num_iotasks - 1) * stride >= size {
        return Err(PioError::InvalidArgument);
    }
    let io_ranks: Vec<i32> = (0..num_iotasks).map(|i| base + i * stride).collect();
    init_intracomm_from_ranks(comm, &io_ranks, rearranger)
}

/// Create a synchronous iosystem with an explicit io-task rank list.
pub fn init_intracomm_from_ranks(
    comm: Arc<dyn Comm>,
    io_ranks: &[i32],
    rearranger: Rearranger,
) -> Result<i32> {
    let size = comm.size();
    if io_ranks.is_empty() {
        return Err(PioError::InvalidArgument);
    }
    let mut seen = vec![false; size as usize];
    for &r in io_ranks {
        if r < 0 || r >= size || seen[r as usize] {
            return Err(PioError::InvalidArgument);
        }
        seen[r as usize] = true;
    }

    let me = comm.rank();
    let io_index = io_ranks.iter().position(|&r| r == me);
    let ioproc = io_index.is_some();

    // Split off the io subcommunicator; the original communicator serves
    // as both union and compute.
    let io_comm = comm.split(if ioproc { Some(0) } else { None }, me);

    let iosysid = next_iosysid();
    crate::logging::init_logging(me);
    let ios = IoSystem {
        iosysid,
        union_comm: Arc::clone(&comm),
        comp_comm: Some(Arc::clone(&comm)),
        io_comm,
        union_rank: me,
        comp_rank: me,
        io_rank: io_index.map_or(-1, |i| i as i32),
        num_comptasks: size,
        num_iotasks: io_ranks.len() as i32,
        ioproc,
        compproc: true,
        ioroot: io_ranks[0],
        comproot: 0,
        io_ranks: io_ranks.to_vec(),
        comp_ranks: (0..size).collect(),
        asynchronous: false,
        comp_idx: 0,
        default_rearranger: rearranger,
        error_handler: Cell::new(ErrorHandler::Internal),
        rearr_opts: RefCell::new(RearrOpts::default()),
        seq_num: Cell::new(0),
        prev_msg: Cell::new(0),
        stats: RefCell::new(IoSysStats::default()),
    };
    register_iosystem(ios);
    log::debug!(
        "init_intracomm iosysid={} rank={} iotasks={:?}",
        iosysid,
        me,
        io_ranks
    );
    Ok(iosysid)
}

/// Create an asynchronous iosystem: disjoint compute components driving a
/// dedicated io group through the message protocol.
///
/// Ranks listed in `io_ranks` enter the message-handler loop and return
/// `Ok(None)` only after every component has finalized. Compute ranks get
/// back the iosysid of their component.
pub fn init_async(
    world: Arc<dyn Comm>,
    comp_ranks: &[Vec<i32>],
    io_ranks: &[i32],
    rearranger: Rearranger,
) -> Result<Option<i32>> {
    let size = world.size();
    if comp_ranks.is_empty() || io_ranks.is_empty() {
        return Err(PioError::InvalidArgument);
    }
    // Membership must be disjoint and total.
    let mut owner = vec![-2i32; size as usize];
    for &r in io_ranks {
        if r < 0 || r >= size || owner[r as usize] != -2 {
            return Err(PioError::InvalidArgument);
        }
        owner[r as usize] = -1;
    }
    for (c, ranks) in comp_ranks.iter().enumerate() {
        if ranks.is_empty() {
            return Err(PioError::InvalidArgument);
        }
        for &r in ranks {
            if r < 0 || r >= size || owner[r as usize] != -2 {
                return Err(PioError::InvalidArgument);
            }
            owner[r as usize] = c as i32;
        }
    }
    if owner.contains(&-2) {
        return Err(PioError::InvalidArgument);
    }

    let me = world.rank();
    let my_owner = owner[me as usize];
    let ncomps = comp_ranks.len();

    // One split builds the io communicator and every compute communicator.
    let color = if my_owner == -1 { ncomps as i32 } else { my_owner };
    let group_comm = world.split(Some(color), me);
    crate::logging::init_logging(me);

    // One union intracommunicator per component: its compute ranks plus
    // every io rank, ordered by world rank. All ranks take part in every
    // split; outsiders pass no color.
    let mut union_comms: Vec<Option<Arc<dyn Comm>>> = Vec::with_capacity(ncomps);
    for c in 0..ncomps {
        let in_union = my_owner == -1 || my_owner == c as i32;
        union_comms.push(world.split(if in_union { Some(0) } else { None }, me));
    }

    let build = |comp_idx: usize,
                 is_io: bool,
                 union: Arc<dyn Comm>,
                 group: Option<Arc<dyn Comm>>|
     -> IoSystem {
        let cranks = &comp_ranks[comp_idx];
        // World -> union rank translation for this component.
        let mut members: Vec<i32> = io_ranks.iter().chain(cranks.iter()).copied().collect();
        members.sort_unstable();
        let w2u = |w: i32| members.iter().position(|&m| m == w).unwrap() as i32;
        IoSystem {
            iosysid: next_iosysid(),
            union_comm: union,
            comp_comm: if is_io { None } else { group.clone() },
            io_comm: if is_io { group.clone() } else { None },
            union_rank: w2u(me),
            comp_rank: if is_io {
                -1
            } else {
                cranks.iter().position(|&r| r == me).unwrap() as i32
            },
            io_rank: if is_io {
                io_ranks.iter().position(|&r| r == me).unwrap() as i32
            } else {
                -1
            },
            num_comptasks: cranks.len() as i32,
            num_iotasks: io_ranks.len() as i32,
            ioproc: is_io,
            compproc: !is_io,
            ioroot: w2u(io_ranks[0]),
            comproot: w2u(cranks[0]),
            io_ranks: io_ranks.iter().map(|&r| w2u(r)).collect(),
            comp_ranks: cranks.iter().map(|&r| w2u(r)).collect(),
            asynchronous: true,
            comp_idx: comp_idx as i32,
            default_rearranger: rearranger,
            error_handler: Cell::new(ErrorHandler::Internal),
            rearr_opts: RefCell::new(RearrOpts::default()),
            seq_num: Cell::new(0),
            prev_msg: Cell::new(0),
            stats: RefCell::new(IoSysStats::default()),
        }
    };

    if my_owner == -1 {
        // IO rank: one iosystem per connected component, then serve
        // messages until all of them say goodbye.
        let mut systems = Vec::with_capacity(ncomps);
        for (c, uc) in union_comms.into_iter().enumerate() {
            systems.push(register_iosystem(build(
                c,
                true,
                uc.unwrap(),
                group_comm.clone(),
            )));
        }
        crate::msg::io_msg_loop(&systems)?;
        for ios in &systems {
            crate::stats::write_final_summaries(ios)?;
            remove_iosystem(ios.iosysid);
        }
        crate::logging::finalize_logging();
        Ok(None)
    } else {
        let c = my_owner as usize;
        let ios = register_iosystem(build(
            c,
            false,
            union_comms[c].clone().unwrap(),
            group_comm,
        ));
        Ok(Some(ios.iosysid))
    }
}

fn remove_iosystem(iosysid: i32) {
    IOSYSTEMS.with(|t| {
        t.borrow_mut().remove(iosysid);
    });
}

/// Tear down an iosystem. In async mode the compute side notifies the io
/// servers; the last component's finalize lets the io loop exit.
pub fn finalize(iosysid: i32) -> Result<()> {
    let ios = get_iosystem(iosysid)?;
    if ios.asynchronous && ios.compproc {
        crate::msg::send_finalize(&ios)?;
    }
    crate::stats::write_final_summaries(&ios)?;
    if !ios.asynchronous {
        ios.union_comm.barrier();
    }
    remove_iosystem(iosysid);
    crate::logging::finalize_logging();
    Ok(())
}

/// Set the error handler, returning the previous one.
pub fn set_error_handler(iosysid: i32, handler: ErrorHandler) -> Result<ErrorHandler> {
    let ios = get_iosystem(iosysid)?;
    if ios.asynchronous && ios.compproc {
        crate::msg::send_set_error_handler(&ios, handler.as_i32())?;
    }
    let old = ios.error_handler.get();
    ios.error_handler.set(handler);
    Ok(old)
}

/// Set the rearranger flow-control options after validating them.
#[allow(clippy::too_many_arguments)]
pub fn set_rearr_opts(
    iosysid: i32,
    fc_mode: FcMode,
    c2i_hs: bool,
    c2i_isend: bool,
    c2i_max_pend: i32,
    i2c_hs: bool,
    i2c_isend: bool,
    i2c_max_pend: i32,
) -> Result<()> {
    if c2i_max_pend < REARR_UNLIMITED_PEND_REQ || c2i_max_pend == 0 {
        return Err(PioError::InvalidArgument);
    }
    if i2c_max_pend < REARR_UNLIMITED_PEND_REQ || i2c_max_pend == 0 {
        return Err(PioError::InvalidArgument);
    }
    let ios = get_iosystem(iosysid)?;
    if ios.asynchronous && ios.compproc {
        // The io servers run the same exchanges and must agree on the
        // flow-control settings.
        crate::msg::send_set_rearr_opts(
            &ios,
            [
                (fc_mode == FcMode::Point2Point) as i32,
                c2i_hs as i32,
                c2i_isend as i32,
                c2i_max_pend,
                i2c_hs as i32,
                i2c_isend as i32,
                i2c_max_pend,
            ],
        )?;
    }
    *ios.rearr_opts.borrow_mut() = RearrOpts {
        fc_mode,
        comp2io: RearrDirOpts {
            handshake: c2i_hs,
            isend: c2i_isend,
            max_pending_reqs: c2i_max_pend,
        },
        io2comp: RearrDirOpts {
            handshake: i2c_hs,
            isend: i2c_isend,
            max_pending_reqs: i2c_max_pend,
        },
    };
    Ok(())
}

/// Run a local status code through the iosystem's error handler.
///
/// Collective over `my_comm` for the broadcasting and reducing handlers,
/// so every rank must pass a code (0 for success) whenever any rank might.
pub fn apply_error_handler(ios: &IoSystem, code: i32) -> i32 {
    use crate::comm::{bytes_from_i32s, i32s_from_bytes};
    match ios.error_handler.get() {
        ErrorHandler::Internal => {
            if code != 0 {
                log::error!(
                    "fatal: {} (code {code}), aborting per error handler",
                    crate::error::strerror(code)
                );
                std::process::abort();
            }
            code
        }
        ErrorHandler::Bcast => {
            let mut buf = bytes_from_i32s(&[code]);
            ios.my_comm().broadcast(0, &mut buf);
            i32s_from_bytes(&buf)[0]
        }
        ErrorHandler::Reduce => {
            let comm = ios.my_comm();
            let min = comm.allreduce_i64(crate::comm::ReduceOp::Min, &[code as i64])[0] as i32;
            if let Some(all) = comm.gather_bytes(0, &bytes_from_i32s(&[code])) {
                let mut hist: std::collections::BTreeMap<i32, usize> = Default::default();
                for b in all {
                    *hist.entry(i32s_from_bytes(&b)[0]).or_default() += 1;
                }
                if min != 0 {
                    for (c, n) in hist {
                        log::warn!("error code {c} reported by {n} rank(s)");
                    }
                }
            }
            min
        }
        ErrorHandler::Return => code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
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
    fn test_init_intracomm_roles() {
        run_on_world(4, |comm| {
            let me = comm.rank();
            let id = init_intracomm(comm, 2, 2, 0, Rearranger::Box).unwrap();
            let ios = get_iosystem(id).unwrap();
            assert!(ios.compproc);
            assert_eq!(ios.ioproc, me % 2 == 0);
            assert_eq!(ios.io_ranks, vec![0, 2]);
            assert_eq!(ios.ioroot, 0);
            if ios.ioproc {
                assert_eq!(ios.io_comm.as_ref().unwrap().size(), 2);
                assert_eq!(ios.io_rank, me / 2);
            } else {
                assert!(ios.io_comm.is_none());
                assert_eq!(ios.io_rank, -1);
            }
        });
    }

    #[test]
    fn test_init_intracomm_validation() {
        run_on_world(1, |comm| {
            assert!(matches!(
                init_intracomm(Arc::clone(&comm), 2, 1, 0, Rearranger::Box),
                Err(PioError::InvalidArgument)
            ));
            assert!(matches!(
                init_intracomm(Arc::clone(&comm), 0, 1, 0, Rearranger::Box),
                Err(PioError::InvalidArgument)
            ));
            assert!(matches!(
                init_intracomm_from_ranks(comm, &[0, 0], Rearranger::Box),
                Err(PioError::InvalidArgument)
            ));
        });
    }

    #[test]
    fn test_bad_iosysid_lookup() {
        assert!(matches!(get_iosystem(991), Err(PioError::BadId)));
    }

    #[test]
    fn test_set_rearr_opts_validation() {
        run_on_world(2, |comm| {
            let id = init_intracomm(comm, 1, 1, 0, Rearranger::Subset).unwrap();
            assert!(
                set_rearr_opts(id, FcMode::Point2Point, true, true, 0, false, false, -1).is_err()
            );
            set_rearr_opts(id, FcMode::Point2Point, true, true, 8, false, false, -1).unwrap();
            let ios = get_iosystem(id).unwrap();
            assert_eq!(ios.rearr_opts.borrow().comp2io.max_pending_reqs, 8);
        });
    }

    #[test]
    fn test_collective_mode_forces_fc_off() {
        let opts = RearrOpts {
            fc_mode: FcMode::Collective,
            ..Default::default()
        };
        let eff = opts.effective(true);
        assert!(!eff.handshake);
        assert!(!eff.isend);
        assert_eq!(eff.max_pending_reqs, REARR_UNLIMITED_PEND_REQ);
    }

    #[test]
    fn test_error_handler_roundtrip() {
        run_on_world(1, |comm| {
            let id = init_intracomm(comm, 1, 1, 0, Rearranger::Box).unwrap();
            let old = set_error_handler(id, ErrorHandler::Return).unwrap();
            assert_eq!(old, ErrorHandler::Internal);
            assert_eq!(
                get_iosystem(id).unwrap().error_handler.get(),
                ErrorHandler::Return
            );
        });
    }
}
