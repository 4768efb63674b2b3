//! Asynchronous message protocol.
//!
//! When an iosystem runs with disjoint compute and io groups, compute
//! ranks never call backends directly: every public operation is encoded
//! as a typed message, shipped from the compute root to the io root, and
//! executed by the io ranks on the compute side's behalf. Operations whose
//! bulk data moves through the rearranger (darray traffic, decomposition
//! construction) send only their control parameters; the data exchange
//! itself is the usual collective over the component's union communicator,
//! which both sides enter after the message lands.
//!
//! The envelope carries `(msg, seq_num, prev_msg)`. Sequence numbers are
//! monotonic per iosystem and checked on the io side; a mismatch is a
//! programmer error (a non-collective call sequence) and aborts.

use std::collections::HashMap;
use std::rc::Rc;

use crate::backend::{IoType, OpenMode};
use crate::comm::{Comm, bytes_from_i32s, i32s_from_bytes, tags};
use crate::error::{PioError, Result};
use crate::file::{FileMeta, RenameKind};
use crate::iosystem::{IoSystem, Rearranger};
use crate::mvcache::WriteMultiBuffer;
use crate::types::PioType;

/// Every operation the protocol can carry. `Exit` is local-only: it is
/// never sent, only used to tear the service loop down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MsgId {
    Invalid = 0,
    CreateFile = 1,
    OpenFile = 2,
    CloseFile = 3,
    SyncFile = 4,
    Redef = 5,
    Enddef = 6,
    SetFill = 7,
    DeleteFile = 8,
    DefDim = 10,
    DefVar = 11,
    DefVarFill = 12,
    RenameEntity = 13,
    DelAtt = 14,
    SetFrame = 15,
    AdvanceFrame = 16,
    PutVars = 20,
    GetVars = 21,
    PutAtt = 22,
    GetAtt = 23,
    InqAtt = 24,
    InqAttName = 25,
    InqNatts = 26,
    InitDecomp = 30,
    FreeDecomp = 31,
    WriteDarrayMulti = 32,
    ReadDarray = 33,
    SetErrorHandler = 40,
    SetRearrOpts = 41,
    Finalize = 50,
    Exit = 51,
}

impl MsgId {
    fn from_i32(v: i32) -> MsgId {
        match v {
            1 => MsgId::CreateFile,
            2 => MsgId::OpenFile,
            3 => MsgId::CloseFile,
            4 => MsgId::SyncFile,
            5 => MsgId::Redef,
            6 => MsgId::Enddef,
            7 => MsgId::SetFill,
            8 => MsgId::DeleteFile,
            10 => MsgId::DefDim,
            11 => MsgId::DefVar,
            12 => MsgId::DefVarFill,
            13 => MsgId::RenameEntity,
            14 => MsgId::DelAtt,
            15 => MsgId::SetFrame,
            16 => MsgId::AdvanceFrame,
            20 => MsgId::PutVars,
            21 => MsgId::GetVars,
            22 => MsgId::PutAtt,
            23 => MsgId::GetAtt,
            24 => MsgId::InqAtt,
            25 => MsgId::InqAttName,
            26 => MsgId::InqNatts,
            30 => MsgId::InitDecomp,
            31 => MsgId::FreeDecomp,
            32 => MsgId::WriteDarrayMulti,
            33 => MsgId::ReadDarray,
            40 => MsgId::SetErrorHandler,
            41 => MsgId::SetRearrOpts,
            50 => MsgId::Finalize,
            51 => MsgId::Exit,
            _ => MsgId::Invalid,
        }
    }
}

/// Whether a variable-length payload item carries a 32- or 64-bit length
/// prefix on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LenKind {
    I32,
    I64,
}

/// Who owns the receive-side storage. `Caller` items land in storage the
/// handler already holds; `Callee` items are allocated by the decoder.
/// Both decode identically in Rust; the distinction documents the
/// handler-side contract and keeps the table reviewable against the
/// handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owned {
    Caller,
    Callee,
}

/// One typed parameter of a message signature. Sender and receiver walk
/// the same sequence in lockstep; drift is a compile-time error because
/// the table and both walkers share this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDesc {
    Int,
    Offset,
    Float,
    Byte,
    Str(LenKind, Owned),
    Bytes(LenKind, Owned),
    IntArr(LenKind, Owned),
    OffArr(LenKind, Owned),
    FloatArr(LenKind, Owned),
}

use LenKind::{I32, I64};
use Owned::{Callee, Caller};
use ParamDesc as P;

/// Signature table: the typed parameter sequence of every message. Unused
/// slots carry the empty signature.
pub fn signature(msg: MsgId) -> &'static [ParamDesc] {
    match msg {
        MsgId::Invalid | MsgId::Exit | MsgId::Finalize => &[],
        MsgId::CreateFile => &[P::Str(I32, Callee), P::Int, P::Int, P::Int],
        MsgId::OpenFile => &[P::Str(I32, Callee), P::Int, P::Int, P::Byte, P::Int],
        MsgId::CloseFile | MsgId::SyncFile | MsgId::Redef | MsgId::Enddef => &[P::Int],
        MsgId::SetFill => &[P::Int, P::Int],
        MsgId::DeleteFile => &[P::Str(I32, Callee)],
        MsgId::DefDim => &[P::Int, P::Str(I32, Callee), P::Offset],
        MsgId::DefVar => &[P::Int, P::Str(I32, Callee), P::Int, P::IntArr(I32, Callee)],
        MsgId::DefVarFill => &[P::Int, P::Int, P::Byte, P::Bytes(I32, Callee)],
        MsgId::RenameEntity => &[
            P::Int,
            P::Int,
            P::Int,
            P::Str(I32, Callee),
            P::Str(I32, Callee),
        ],
        MsgId::DelAtt => &[P::Int, P::Int, P::Str(I32, Callee)],
        MsgId::SetFrame => &[P::Int, P::Int, P::Int],
        MsgId::AdvanceFrame => &[P::Int, P::Int],
        MsgId::PutVars => &[
            P::Int,
            P::Int,
            P::Int,
            P::OffArr(I32, Caller),
            P::OffArr(I32, Caller),
            P::OffArr(I32, Caller),
            P::Bytes(I64, Callee),
        ],
        MsgId::GetVars => &[
            P::Int,
            P::Int,
            P::Int,
            P::OffArr(I32, Caller),
            P::OffArr(I32, Caller),
            P::OffArr(I32, Caller),
        ],
        MsgId::PutAtt => &[
            P::Int,
            P::Int,
            P::Str(I32, Callee),
            P::Int,
            P::Int,
            P::Offset,
            P::Bytes(I64, Callee),
        ],
        MsgId::GetAtt => &[P::Int, P::Int, P::Str(I32, Callee), P::Int],
        MsgId::InqAtt => &[P::Int, P::Int, P::Str(I32, Callee)],
        MsgId::InqAttName => &[P::Int, P::Int, P::Int],
        MsgId::InqNatts => &[P::Int, P::Int],
        MsgId::InitDecomp => &[P::Int, P::OffArr(I32, Callee), P::Int, P::Int],
        MsgId::FreeDecomp => &[P::Int],
        MsgId::WriteDarrayMulti => &[
            P::Int,
            P::Int,
            P::Byte,
            P::IntArr(I32, Callee),
            P::IntArr(I32, Callee),
            P::Bytes(I64, Callee),
        ],
        MsgId::ReadDarray => &[P::Int, P::Int, P::Int],
        MsgId::SetErrorHandler => &[P::Int],
        MsgId::SetRearrOpts => &[P::IntArr(I32, Caller)],
    }
}

/// Runtime value matching one `ParamDesc`.
#[derive(Debug, Clone, PartialEq)]
pub enum MsgArg {
    Int(i32),
    Offset(i64),
    Float(f32),
    Byte(u8),
    Str(String),
    Bytes(Vec<u8>),
    IntArr(Vec<i32>),
    OffArr(Vec<i64>),
    FloatArr(Vec<f32>),
}

fn push_len(out: &mut Vec<u8>, kind: LenKind, len: usize) {
    match kind {
        LenKind::I32 => out.extend_from_slice(&(len as i32).to_ne_bytes()),
        LenKind::I64 => out.extend_from_slice(&(len as i64).to_ne_bytes()),
    }
}

/// Encode arguments against a signature. Any mismatch between the two is
/// a programmer error in the call site and panics.
pub fn encode(sig: &[ParamDesc], args: &[MsgArg]) -> Vec<u8> {
    assert_eq!(sig.len(), args.len(), "message arity drift");
    let mut out = Vec::new();
    for (desc, arg) in sig.iter().zip(args) {
        match (desc, arg) {
            (P::Int, MsgArg::Int(v)) => out.extend_from_slice(&v.to_ne_bytes()),
            (P::Offset, MsgArg::Offset(v)) => out.extend_from_slice(&v.to_ne_bytes()),
            (P::Float, MsgArg::Float(v)) => out.extend_from_slice(&v.to_ne_bytes()),
            (P::Byte, MsgArg::Byte(v)) => out.push(*v),
            (P::Str(k, _), MsgArg::Str(s)) => {
                push_len(&mut out, *k, s.len());
                out.extend_from_slice(s.as_bytes());
            }
            (P::Bytes(k, _), MsgArg::Bytes(b)) => {
                push_len(&mut out, *k, b.len());
                out.extend_from_slice(b);
            }
            (P::IntArr(k, _), MsgArg::IntArr(v)) => {
                push_len(&mut out, *k, v.len());
                for x in v {
                    out.extend_from_slice(&x.to_ne_bytes());
                }
            }
            (P::OffArr(k, _), MsgArg::OffArr(v)) => {
                push_len(&mut out, *k, v.len());
                for x in v {
                    out.extend_from_slice(&x.to_ne_bytes());
                }
            }
            (P::FloatArr(k, _), MsgArg::FloatArr(v)) => {
                push_len(&mut out, *k, v.len());
                for x in v {
                    out.extend_from_slice(&x.to_ne_bytes());
                }
            }
            _ => panic!("message signature drift: {desc:?} vs {arg:?}"),
        }
    }
    out
}

/// Decode a payload against a signature, in lockstep with the encoder.
/// Truncation or trailing bytes mean the two sides disagree; that is a
/// protocol desync and aborts.
pub fn decode(sig: &[ParamDesc], buf: &[u8]) -> Vec<MsgArg> {
    let mut off = 0usize;
    let take = |off: &mut usize, n: usize| -> &[u8] {
        let s = buf
            .get(*off..*off + n)
            .expect("async protocol desync: truncated payload");
        *off += n;
        s
    };
    let take_len = |off: &mut usize, kind: LenKind| -> usize {
        match kind {
            LenKind::I32 => i32::from_ne_bytes(take(off, 4).try_into().unwrap()) as usize,
            LenKind::I64 => i64::from_ne_bytes(take(off, 8).try_into().unwrap()) as usize,
        }
    };
    let mut args = Vec::with_capacity(sig.len());
    for desc in sig {
        let arg = match desc {
            P::Int => MsgArg::Int(i32::from_ne_bytes(take(&mut off, 4).try_into().unwrap())),
            P::Offset => MsgArg::Offset(i64::from_ne_bytes(take(&mut off, 8).try_into().unwrap())),
            P::Float => MsgArg::Float(f32::from_ne_bytes(take(&mut off, 4).try_into().unwrap())),
            P::Byte => MsgArg::Byte(take(&mut off, 1)[0]),
            P::Str(k, _) => {
                let n = take_len(&mut off, *k);
                MsgArg::Str(String::from_utf8_lossy(take(&mut off, n)).to_string())
            }
            P::Bytes(k, _) => {
                let n = take_len(&mut off, *k);
                MsgArg::Bytes(take(&mut off, n).to_vec())
            }
            P::IntArr(k, _) => {
                let n = take_len(&mut off, *k);
                let mut v = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(i32::from_ne_bytes(take(&mut off, 4).try_into().unwrap()));
                }
                MsgArg::IntArr(v)
            }
            P::OffArr(k, _) => {
                let n = take_len(&mut off, *k);
                let mut v = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(i64::from_ne_bytes(take(&mut off, 8).try_into().unwrap()));
                }
                MsgArg::OffArr(v)
            }
            P::FloatArr(k, _) => {
                let n = take_len(&mut off, *k);
                let mut v = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(f32::from_ne_bytes(take(&mut off, 4).try_into().unwrap()));
                }
                MsgArg::FloatArr(v)
            }
        };
        args.push(arg);
    }
    assert_eq!(off, buf.len(), "async protocol desync: trailing payload");
    args
}

// --- Compute-side send machinery -----------------------------------------

// Advance the envelope state and, on the compute root, ship the header to
// the io root and the payload to every io rank. Collective over the
// compute communicator by convention: all compute ranks must call this in
// the same order.
fn send_async_msg(ios: &Rc<IoSystem>, msg: MsgId, args: &[MsgArg]) {
    let seq = ios.seq_num.get() + 1;
    ios.seq_num.set(seq);
    let prev = ios.prev_msg.get();
    ios.prev_msg.set(msg as i32);

    if ios.comp_rank == 0 {
        let union = &ios.union_comm;
        let hdr = bytes_from_i32s(&[msg as i32, seq, prev]);
        union.send(ios.ioroot, tags::MSG_HDR, &hdr);
        let payload = encode(signature(msg), args);
        for &u in &ios.io_ranks {
            union.send(u, tags::MSG_PAYLOAD, &payload);
        }
    }
    log::trace!("async msg {msg:?} seq={seq}");
}

// Receive the io root's reply on every compute rank: a status code
// followed by an operation-specific payload.
fn recv_reply(ios: &Rc<IoSystem>) -> Result<Vec<u8>> {
    let rep = ios.union_comm.recv(ios.ioroot, tags::MSG_RET);
    let code = i32::from_ne_bytes(rep[..4].try_into().unwrap());
    match PioError::from_code(code) {
        None => Ok(rep[4..].to_vec()),
        Some(e) => Err(e),
    }
}

// Io-root side of `recv_reply`.
fn send_reply(ios: &Rc<IoSystem>, code: i32, payload: &[u8]) {
    if ios.io_rank != 0 {
        return;
    }
    let mut rep = code.to_ne_bytes().to_vec();
    rep.extend_from_slice(payload);
    for &u in &ios.comp_ranks {
        ios.union_comm.send(u, tags::MSG_RET, &rep);
    }
}

fn code_of<T>(res: &Result<T>) -> i32 {
    match res {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

pub(crate) fn send_create_file(
    ios: &Rc<IoSystem>,
    iotype: IoType,
    fname: &str,
    mode: OpenMode,
    wire_ncid: i32,
) -> Result<()> {
    send_async_msg(
        ios,
        MsgId::CreateFile,
        &[
            MsgArg::Str(fname.to_string()),
            MsgArg::Int(iotype as i32),
            MsgArg::Int(mode.bits() as i32),
            MsgArg::Int(wire_ncid),
        ],
    );
    recv_reply(ios).map(|_| ())
}

pub(crate) fn send_open_file(
    ios: &Rc<IoSystem>,
    iotype: IoType,
    fname: &str,
    mode: OpenMode,
    retry: bool,
    wire_ncid: i32,
) -> Result<(IoType, FileMeta)> {
    send_async_msg(
        ios,
        MsgId::OpenFile,
        &[
            MsgArg::Str(fname.to_string()),
            MsgArg::Int(iotype as i32),
            MsgArg::Int(mode.bits() as i32),
            MsgArg::Byte(retry as u8),
            MsgArg::Int(wire_ncid),
        ],
    );
    let rep = recv_reply(ios)?;
    let eff = IoType::from_i32(i32::from_ne_bytes(rep[..4].try_into().unwrap()))?;
    let meta = FileMeta::decode(&rep[4..])?;
    Ok((eff, meta))
}

pub(crate) fn send_close_file(ios: &Rc<IoSystem>, wire_ncid: i32) -> Result<()> {
    send_async_msg(ios, MsgId::CloseFile, &[MsgArg::Int(wire_ncid)]);
    Ok(())
}

pub(crate) fn send_sync(ios: &Rc<IoSystem>, wire_ncid: i32) -> Result<()> {
    send_async_msg(ios, MsgId::SyncFile, &[MsgArg::Int(wire_ncid)]);
    recv_reply(ios).map(|_| ())
}

pub(crate) fn send_redef(ios: &Rc<IoSystem>, wire_ncid: i32) -> Result<()> {
    send_async_msg(ios, MsgId::Redef, &[MsgArg::Int(wire_ncid)]);
    recv_reply(ios).map(|_| ())
}

pub(crate) fn send_enddef(ios: &Rc<IoSystem>, wire_ncid: i32) -> Result<()> {
    send_async_msg(ios, MsgId::Enddef, &[MsgArg::Int(wire_ncid)]);
    recv_reply(ios).map(|_| ())
}

pub(crate) fn send_set_fill(ios: &Rc<IoSystem>, wire_ncid: i32, fill: bool) -> Result<()> {
    send_async_msg(
        ios,
        MsgId::SetFill,
        &[MsgArg::Int(wire_ncid), MsgArg::Int(fill as i32)],
    );
    recv_reply(ios).map(|_| ())
}

pub(crate) fn send_delete_file(ios: &Rc<IoSystem>, fname: &str) -> Result<()> {
    send_async_msg(ios, MsgId::DeleteFile, &[MsgArg::Str(fname.to_string())]);
    recv_reply(ios).map(|_| ())
}

pub(crate) fn send_def_dim(ios: &Rc<IoSystem>, wire_ncid: i32, name: &str, len: i64) -> Result<()> {
    send_async_msg(
        ios,
        MsgId::DefDim,
        &[
            MsgArg::Int(wire_ncid),
            MsgArg::Str(name.to_string()),
            MsgArg::Offset(len),
        ],
    );
    recv_reply(ios).map(|_| ())
}

pub(crate) fn send_def_var(
    ios: &Rc<IoSystem>,
    wire_ncid: i32,
    name: &str,
    xtype: PioType,
    dimids: &[i32],
) -> Result<()> {
    send_async_msg(
        ios,
        MsgId::DefVar,
        &[
            MsgArg::Int(wire_ncid),
            MsgArg::Str(name.to_string()),
            MsgArg::Int(xtype as i32),
            MsgArg::IntArr(dimids.to_vec()),
        ],
    );
    recv_reply(ios).map(|_| ())
}

pub(crate) fn send_def_var_fill(
    ios: &Rc<IoSystem>,
    wire_ncid: i32,
    varid: i32,
    no_fill: bool,
    fill: Option<&[u8]>,
) -> Result<()> {
    send_async_msg(
        ios,
        MsgId::DefVarFill,
        &[
            MsgArg::Int(wire_ncid),
            MsgArg::Int(varid),
            MsgArg::Byte(no_fill as u8),
            MsgArg::Bytes(fill.unwrap_or(&[]).to_vec()),
        ],
    );
    recv_reply(ios).map(|_| ())
}

pub(crate) fn send_rename(
    ios: &Rc<IoSystem>,
    wire_ncid: i32,
    kind: RenameKind,
    id: i32,
    old: &str,
    new: &str,
) -> Result<()> {
    send_async_msg(
        ios,
        MsgId::RenameEntity,
        &[
            MsgArg::Int(wire_ncid),
            MsgArg::Int(kind as i32),
            MsgArg::Int(id),
            MsgArg::Str(old.to_string()),
            MsgArg::Str(new.to_string()),
        ],
    );
    recv_reply(ios).map(|_| ())
}

pub(crate) fn send_del_att(
    ios: &Rc<IoSystem>,
    wire_ncid: i32,
    varid: i32,
    name: &str,
) -> Result<()> {
    send_async_msg(
        ios,
        MsgId::DelAtt,
        &[
            MsgArg::Int(wire_ncid),
            MsgArg::Int(varid),
            MsgArg::Str(name.to_string()),
        ],
    );
    recv_reply(ios).map(|_| ())
}

pub(crate) fn send_setframe(
    ios: &Rc<IoSystem>,
    wire_ncid: i32,
    varid: i32,
    frame: i32,
) -> Result<()> {
    send_async_msg(
        ios,
        MsgId::SetFrame,
        &[
            MsgArg::Int(wire_ncid),
            MsgArg::Int(varid),
            MsgArg::Int(frame),
        ],
    );
    Ok(())
}

pub(crate) fn send_advanceframe(ios: &Rc<IoSystem>, wire_ncid: i32, varid: i32) -> Result<()> {
    send_async_msg(
        ios,
        MsgId::AdvanceFrame,
        &[MsgArg::Int(wire_ncid), MsgArg::Int(varid)],
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn send_put_vars(
    ios: &Rc<IoSystem>,
    wire_ncid: i32,
    varid: i32,
    start: &[i64],
    count: &[i64],
    stride: &[i64],
    memtype: PioType,
    data: &[u8],
) -> Result<()> {
    send_async_msg(
        ios,
        MsgId::PutVars,
        &[
            MsgArg::Int(wire_ncid),
            MsgArg::Int(varid),
            MsgArg::Int(memtype as i32),
            MsgArg::OffArr(start.to_vec()),
            MsgArg::OffArr(count.to_vec()),
            MsgArg::OffArr(stride.to_vec()),
            MsgArg::Bytes(data.to_vec()),
        ],
    );
    recv_reply(ios).map(|_| ())
}

pub(crate) fn send_get_vars(
    ios: &Rc<IoSystem>,
    wire_ncid: i32,
    varid: i32,
    start: &[i64],
    count: &[i64],
    stride: &[i64],
    memtype: PioType,
) -> Result<Vec<u8>> {
    send_async_msg(
        ios,
        MsgId::GetVars,
        &[
            MsgArg::Int(wire_ncid),
            MsgArg::Int(varid),
            MsgArg::Int(memtype as i32),
            MsgArg::OffArr(start.to_vec()),
            MsgArg::OffArr(count.to_vec()),
            MsgArg::OffArr(stride.to_vec()),
        ],
    );
    recv_reply(ios)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn send_put_att(
    ios: &Rc<IoSystem>,
    wire_ncid: i32,
    varid: i32,
    name: &str,
    atttype: PioType,
    memtype: PioType,
    data: &[u8],
) -> Result<()> {
    // The payload is sized by the element count and the memory type; the
    // stored type travels as its own field so both sides agree by
    // construction.
    let len = (data.len() / memtype.mem_size()?) as i64;
    send_async_msg(
        ios,
        MsgId::PutAtt,
        &[
            MsgArg::Int(wire_ncid),
            MsgArg::Int(varid),
            MsgArg::Str(name.to_string()),
            MsgArg::Int(atttype as i32),
            MsgArg::Int(memtype as i32),
            MsgArg::Offset(len),
            MsgArg::Bytes(data.to_vec()),
        ],
    );
    recv_reply(ios).map(|_| ())
}

pub(crate) fn send_get_att(
    ios: &Rc<IoSystem>,
    wire_ncid: i32,
    varid: i32,
    name: &str,
    memtype: PioType,
) -> Result<Vec<u8>> {
    send_async_msg(
        ios,
        MsgId::GetAtt,
        &[
            MsgArg::Int(wire_ncid),
            MsgArg::Int(varid),
            MsgArg::Str(name.to_string()),
            MsgArg::Int(memtype as i32),
        ],
    );
    recv_reply(ios)
}

pub(crate) fn send_inq_att(
    ios: &Rc<IoSystem>,
    wire_ncid: i32,
    varid: i32,
    name: &str,
) -> Result<(PioType, i64)> {
    send_async_msg(
        ios,
        MsgId::InqAtt,
        &[
            MsgArg::Int(wire_ncid),
            MsgArg::Int(varid),
            MsgArg::Str(name.to_string()),
        ],
    );
    let rep = recv_reply(ios)?;
    let t = PioType::from_i32(i32::from_ne_bytes(rep[..4].try_into().unwrap()))?;
    let len = i64::from_ne_bytes(rep[4..12].try_into().unwrap());
    Ok((t, len))
}

pub(crate) fn send_inq_attname(
    ios: &Rc<IoSystem>,
    wire_ncid: i32,
    varid: i32,
    attnum: i32,
) -> Result<String> {
    send_async_msg(
        ios,
        MsgId::InqAttName,
        &[
            MsgArg::Int(wire_ncid),
            MsgArg::Int(varid),
            MsgArg::Int(attnum),
        ],
    );
    let rep = recv_reply(ios)?;
    Ok(String::from_utf8_lossy(&rep).to_string())
}

pub(crate) fn send_inq_natts(ios: &Rc<IoSystem>, wire_ncid: i32, varid: i32) -> Result<i32> {
    send_async_msg(
        ios,
        MsgId::InqNatts,
        &[MsgArg::Int(wire_ncid), MsgArg::Int(varid)],
    );
    let rep = recv_reply(ios)?;
    Ok(i32::from_ne_bytes(rep[..4].try_into().unwrap()))
}

pub(crate) fn send_init_decomp(
    ios: &Rc<IoSystem>,
    piotype: PioType,
    dimlen: &[i64],
    map: &[i64],
    rearranger: Option<Rearranger>,
) -> Result<i32> {
    let wire_ioid = crate::decomp::next_ioid();
    send_async_msg(
        ios,
        MsgId::InitDecomp,
        &[
            MsgArg::Int(piotype as i32),
            MsgArg::OffArr(dimlen.to_vec()),
            MsgArg::Int(rearranger.map_or(0, |r| r as i32)),
            MsgArg::Int(wire_ioid),
        ],
    );
    // The decomposition build itself is the rendezvous: compute ranks
    // carry their maps into it, io ranks arrive from the handler.
    let ioid =
        crate::decomp::init_decomp_local(ios, piotype, dimlen, map, rearranger, None, None)?;
    debug_assert_eq!(ioid, wire_ioid);
    Ok(ioid)
}

pub(crate) fn send_free_decomp(ios: &Rc<IoSystem>, wire_ioid: i32) -> Result<()> {
    send_async_msg(ios, MsgId::FreeDecomp, &[MsgArg::Int(wire_ioid)]);
    Ok(())
}

pub(crate) fn send_write_darray_multi(
    ios: &Rc<IoSystem>,
    wire_ncid: i32,
    slot: &WriteMultiBuffer,
) -> Result<()> {
    let mut fills = Vec::new();
    fills.extend_from_slice(&(slot.fillvalues.len() as u32).to_ne_bytes());
    for f in &slot.fillvalues {
        fills.extend_from_slice(&(f.len() as u32).to_ne_bytes());
        fills.extend_from_slice(f);
    }
    send_async_msg(
        ios,
        MsgId::WriteDarrayMulti,
        &[
            MsgArg::Int(wire_ncid),
            MsgArg::Int(slot.ioid),
            MsgArg::Byte(slot.recordvar as u8),
            MsgArg::IntArr(slot.vids.clone()),
            MsgArg::IntArr(slot.frames.clone()),
            MsgArg::Bytes(fills),
        ],
    );
    Ok(())
}

pub(crate) fn send_read_darray(
    ios: &Rc<IoSystem>,
    wire_ncid: i32,
    varid: i32,
    wire_ioid: i32,
) -> Result<()> {
    send_async_msg(
        ios,
        MsgId::ReadDarray,
        &[
            MsgArg::Int(wire_ncid),
            MsgArg::Int(varid),
            MsgArg::Int(wire_ioid),
        ],
    );
    Ok(())
}

pub(crate) fn send_set_error_handler(ios: &Rc<IoSystem>, handler: i32) -> Result<()> {
    send_async_msg(ios, MsgId::SetErrorHandler, &[MsgArg::Int(handler)]);
    Ok(())
}

/// The io side must run the rearranger exchanges with the same
/// flow-control options as the compute side, so the setting is forwarded.
pub(crate) fn send_set_rearr_opts(ios: &Rc<IoSystem>, opts: [i32; 7]) -> Result<()> {
    send_async_msg(ios, MsgId::SetRearrOpts, &[MsgArg::IntArr(opts.to_vec())]);
    Ok(())
}

/// Tell the io servers this component is done.
pub(crate) fn send_finalize(ios: &Rc<IoSystem>) -> Result<()> {
    send_async_msg(ios, MsgId::Finalize, &[]);
    Ok(())
}

// --- Io-side service loop -------------------------------------------------

// Wire-id translation per component: the compute side names files and
// decompositions by its own ids; the io side registers its own handles
// and keeps the mapping.
struct ServerState {
    files: HashMap<(usize, i32), i32>,
    decomps: HashMap<(usize, i32), i32>,
}

impl ServerState {
    fn file(&self, comp: usize, wire: i32) -> Result<i32> {
        self.files.get(&(comp, wire)).copied().ok_or(PioError::BadId)
    }

    fn decomp(&self, comp: usize, wire: i32) -> Result<i32> {
        self.decomps
            .get(&(comp, wire))
            .copied()
            .ok_or(PioError::BadId)
    }
}

/// Serve messages from every connected compute component until each one
/// has finalized. Runs on io ranks only; entered from `init_async`.
pub(crate) fn io_msg_loop(systems: &[Rc<IoSystem>]) -> Result<()> {
    let io_comm = systems[0]
        .io_comm
        .as_ref()
        .ok_or(PioError::Io)?
        .clone();
    let io_root = io_comm.rank() == 0;
    let mut finalized = vec![false; systems.len()];
    let mut state = ServerState {
        files: HashMap::new(),
        decomps: HashMap::new(),
    };

    loop {
        // The io root watches every component; whichever header arrives
        // first is rebroadcast as (component, msg, seq, prev) over the io
        // communicator so all io ranks advance in lockstep.
        let mut hdr = Vec::new();
        if io_root {
            'poll: loop {
                for (c, ios) in systems.iter().enumerate() {
                    if finalized[c] {
                        continue;
                    }
                    if let Some(h) = ios.union_comm.try_recv(ios.comproot, tags::MSG_HDR) {
                        let v = i32s_from_bytes(&h);
                        hdr = bytes_from_i32s(&[c as i32, v[0], v[1], v[2]]);
                        break 'poll;
                    }
                }
                std::thread::yield_now();
            }
        }
        io_comm.broadcast(0, &mut hdr);
        let v = i32s_from_bytes(&hdr);
        let (c, msg, seq, prev) = (v[0] as usize, MsgId::from_i32(v[1]), v[2], v[3]);
        let ios = &systems[c];

        // Envelope check: a gap or reorder means the compute side broke
        // the collective calling discipline.
        let expected = ios.seq_num.get() + 1;
        assert_eq!(seq, expected, "async protocol desync: sequence number");
        assert_eq!(
            prev,
            ios.prev_msg.get(),
            "async protocol desync: previous message"
        );
        ios.seq_num.set(seq);
        ios.prev_msg.set(msg as i32);

        let payload = ios.union_comm.recv(ios.comproot, tags::MSG_PAYLOAD);
        let args = decode(signature(msg), &payload);
        log::trace!("io loop: component {c} msg {msg:?} seq {seq}");

        dispatch(ios, c, msg, &args, &mut state)?;

        if msg == MsgId::Finalize {
            finalized[c] = true;
            if finalized.iter().all(|&f| f) {
                break;
            }
        }
    }
    Ok(())
}

fn arg_int(a: &MsgArg) -> i32 {
    match a {
        MsgArg::Int(v) => *v,
        _ => panic!("message signature drift"),
    }
}

fn arg_off(a: &MsgArg) -> i64 {
    match a {
        MsgArg::Offset(v) => *v,
        _ => panic!("message signature drift"),
    }
}

fn arg_byte(a: &MsgArg) -> u8 {
    match a {
        MsgArg::Byte(v) => *v,
        _ => panic!("message signature drift"),
    }
}

fn arg_str(a: &MsgArg) -> &str {
    match a {
        MsgArg::Str(s) => s,
        _ => panic!("message signature drift"),
    }
}

fn arg_bytes(a: &MsgArg) -> &[u8] {
    match a {
        MsgArg::Bytes(b) => b,
        _ => panic!("message signature drift"),
    }
}

fn arg_ints(a: &MsgArg) -> &[i32] {
    match a {
        MsgArg::IntArr(v) => v,
        _ => panic!("message signature drift"),
    }
}

fn arg_offs(a: &MsgArg) -> &[i64] {
    match a {
        MsgArg::OffArr(v) => v,
        _ => panic!("message signature drift"),
    }
}

fn dispatch(
    ios: &Rc<IoSystem>,
    comp: usize,
    msg: MsgId,
    args: &[MsgArg],
    state: &mut ServerState,
) -> Result<()> {
    match msg {
        MsgId::CreateFile => {
            let fname = arg_str(&args[0]);
            let iotype = IoType::from_i32(arg_int(&args[1]))?;
            let mode = OpenMode::from_bits_truncate(arg_int(&args[2]) as u32);
            let wire = arg_int(&args[3]);
            let res = crate::file::create_local(ios, iotype, fname, mode, Some(wire));
            if let Ok(ncid) = res {
                state.files.insert((comp, wire), ncid);
            }
            send_reply(ios, code_of(&res), &[]);
        }
        MsgId::OpenFile => {
            let fname = arg_str(&args[0]);
            let iotype = IoType::from_i32(arg_int(&args[1]))?;
            let mode = OpenMode::from_bits_truncate(arg_int(&args[2]) as u32);
            let retry = arg_byte(&args[3]) != 0;
            let wire = arg_int(&args[4]);
            let res = crate::file::open_local(ios, iotype, fname, mode, retry, Some(wire));
            match &res {
                Ok((ncid, eff)) => {
                    state.files.insert((comp, wire), *ncid);
                    let f = crate::file::get_file(*ncid)?;
                    let file = f.borrow();
                    let meta = FileMeta {
                        dims: file.dims.clone(),
                        vars: file
                            .vars
                            .iter()
                            .map(|v| crate::file::VarMeta {
                                name: v.name.clone(),
                                xtype: v.piotype,
                                dimids: v.dimids.clone(),
                                use_fill: v.use_fill,
                                fill: v.fillvalue.clone().unwrap_or_default(),
                            })
                            .collect(),
                    };
                    let mut payload = (*eff as i32).to_ne_bytes().to_vec();
                    payload.extend_from_slice(&meta.encode());
                    send_reply(ios, 0, &payload);
                }
                Err(e) => send_reply(ios, e.code(), &[]),
            }
        }
        MsgId::CloseFile => {
            let wire = arg_int(&args[0]);
            let ncid = state.file(comp, wire)?;
            state.files.remove(&(comp, wire));
            crate::file::closefile(ncid)?;
        }
        MsgId::SyncFile => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let res = crate::file::sync_file(ncid);
            send_reply(ios, code_of(&res), &[]);
        }
        MsgId::Redef => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let res = crate::file::redef(ncid);
            send_reply(ios, code_of(&res), &[]);
        }
        MsgId::Enddef => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let res = crate::file::enddef(ncid);
            send_reply(ios, code_of(&res), &[]);
        }
        MsgId::SetFill => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let res = crate::file::set_fill(ncid, arg_int(&args[1]) != 0);
            send_reply(ios, code_of(&res), &[]);
        }
        MsgId::DeleteFile => {
            let res = delete_local(ios, arg_str(&args[0]));
            send_reply(ios, code_of(&res), &[]);
        }
        MsgId::DefDim => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let res = crate::file::def_dim(ncid, arg_str(&args[1]), arg_off(&args[2]));
            send_reply(ios, code_of(&res), &[]);
        }
        MsgId::DefVar => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let res = crate::file::def_var(
                ncid,
                arg_str(&args[1]),
                PioType::from_i32(arg_int(&args[2]))?,
                arg_ints(&args[3]),
            );
            send_reply(ios, code_of(&res), &[]);
        }
        MsgId::DefVarFill => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let varid = arg_int(&args[1]);
            let no_fill = arg_byte(&args[2]) != 0;
            let fill = arg_bytes(&args[3]);
            let f = crate::file::get_file(ncid)?;
            let mut file = f.borrow_mut();
            let res = (|| -> Result<()> {
                if let Some(be) = file.backend.as_mut() {
                    be.def_var_fill(varid, no_fill, if fill.is_empty() { None } else { Some(fill) })?;
                }
                let var = file.var_mut(varid)?;
                var.use_fill = !no_fill;
                var.fillvalue = if fill.is_empty() {
                    None
                } else {
                    Some(fill.to_vec())
                };
                Ok(())
            })();
            send_reply(ios, code_of(&res), &[]);
        }
        MsgId::RenameEntity => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let kind = arg_int(&args[1]);
            let id = arg_int(&args[2]);
            let old = arg_str(&args[3]);
            let new = arg_str(&args[4]);
            let res = match kind {
                0 => crate::file::rename_dim(ncid, id, new),
                1 => crate::file::rename_var(ncid, id, new),
                2 => crate::file::rename_att(ncid, id, old, new),
                _ => Err(PioError::InvalidArgument),
            };
            send_reply(ios, code_of(&res), &[]);
        }
        MsgId::DelAtt => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let res = crate::file::del_att(ncid, arg_int(&args[1]), arg_str(&args[2]));
            send_reply(ios, code_of(&res), &[]);
        }
        MsgId::SetFrame => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            crate::file::setframe(ncid, arg_int(&args[1]), arg_int(&args[2]))?;
        }
        MsgId::AdvanceFrame => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            crate::file::advanceframe(ncid, arg_int(&args[1]))?;
        }
        MsgId::PutVars => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let f = crate::file::get_file(ncid)?;
            let mut file = f.borrow_mut();
            let res = crate::getput::put_vars_local(
                ios,
                &mut file,
                arg_int(&args[1]),
                arg_offs(&args[3]),
                arg_offs(&args[4]),
                arg_offs(&args[5]),
                PioType::from_i32(arg_int(&args[2]))?,
                arg_bytes(&args[6]),
            );
            send_reply(ios, code_of(&res), &[]);
        }
        MsgId::GetVars => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let f = crate::file::get_file(ncid)?;
            let mut file = f.borrow_mut();
            crate::reqblock::flush_output_buffer(&mut file, true, 0)?;
            let res = crate::getput::get_vars_local(
                ios,
                &mut file,
                arg_int(&args[1]),
                arg_offs(&args[3]),
                arg_offs(&args[4]),
                arg_offs(&args[5]),
                PioType::from_i32(arg_int(&args[2]))?,
            );
            match &res {
                Ok(data) => send_reply(ios, 0, data),
                Err(e) => send_reply(ios, e.code(), &[]),
            }
        }
        MsgId::PutAtt => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let f = crate::file::get_file(ncid)?;
            let mut file = f.borrow_mut();
            let memtype = PioType::from_i32(arg_int(&args[4]))?;
            let len = arg_off(&args[5]) as usize;
            let data = arg_bytes(&args[6]);
            debug_assert_eq!(data.len(), len * memtype.mem_size()?);
            let res = crate::getput::put_att_local(
                ios,
                &mut file,
                arg_int(&args[1]),
                arg_str(&args[2]),
                PioType::from_i32(arg_int(&args[3]))?,
                memtype,
                data,
            );
            send_reply(ios, code_of(&res), &[]);
        }
        MsgId::GetAtt => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let f = crate::file::get_file(ncid)?;
            let mut file = f.borrow_mut();
            let res = crate::getput::get_att_local(
                ios,
                &mut file,
                arg_int(&args[1]),
                arg_str(&args[2]),
                PioType::from_i32(arg_int(&args[3]))?,
            );
            match &res {
                Ok(data) => send_reply(ios, 0, data),
                Err(e) => send_reply(ios, e.code(), &[]),
            }
        }
        MsgId::InqAtt => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let f = crate::file::get_file(ncid)?;
            let file = f.borrow();
            let res = crate::getput::inq_att_local(ios, &file, arg_int(&args[1]), arg_str(&args[2]));
            match &res {
                Ok((t, l)) => {
                    let mut payload = (*t as i32).to_ne_bytes().to_vec();
                    payload.extend_from_slice(&l.to_ne_bytes());
                    send_reply(ios, 0, &payload);
                }
                Err(e) => send_reply(ios, e.code(), &[]),
            }
        }
        MsgId::InqAttName => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let f = crate::file::get_file(ncid)?;
            let file = f.borrow();
            let res =
                crate::getput::inq_attname_local(ios, &file, arg_int(&args[1]), arg_int(&args[2]));
            match &res {
                Ok(name) => send_reply(ios, 0, name.as_bytes()),
                Err(e) => send_reply(ios, e.code(), &[]),
            }
        }
        MsgId::InqNatts => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let f = crate::file::get_file(ncid)?;
            let file = f.borrow();
            let res = crate::getput::inq_natts_local(ios, &file, arg_int(&args[1]));
            match &res {
                Ok(n) => send_reply(ios, 0, &n.to_ne_bytes()),
                Err(e) => send_reply(ios, e.code(), &[]),
            }
        }
        MsgId::InitDecomp => {
            let piotype = PioType::from_i32(arg_int(&args[0]))?;
            let dimlen = arg_offs(&args[1]);
            let rearr = match arg_int(&args[2]) {
                0 => None,
                v => Some(Rearranger::from_i32(v)?),
            };
            let wire = arg_int(&args[3]);
            let ioid = crate::decomp::init_decomp_local(ios, piotype, dimlen, &[], rearr, None, None)?;
            state.decomps.insert((comp, wire), ioid);
        }
        MsgId::FreeDecomp => {
            let wire = arg_int(&args[0]);
            if let Ok(ioid) = state.decomp(comp, wire) {
                state.decomps.remove(&(comp, wire));
                crate::decomp::free_decomp(ios.iosysid, ioid)?;
            }
        }
        MsgId::WriteDarrayMulti => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let ioid = state.decomp(comp, arg_int(&args[1]))?;
            let recordvar = arg_byte(&args[2]) != 0;
            let vids = arg_ints(&args[3]).to_vec();
            let frames = arg_ints(&args[4]).to_vec();
            let fills_raw = arg_bytes(&args[5]);
            let fillvalues = decode_fills(fills_raw)?;
            let desc = crate::decomp::get_decomp(ioid)?;
            let f = crate::file::get_file(ncid)?;
            let mut file = f.borrow_mut();
            let slot = WriteMultiBuffer {
                ioid,
                recordvar,
                arraylen: desc.maplen,
                piotype: desc.piotype,
                vids,
                frames,
                fillvalues,
                data: Vec::new(),
            };
            crate::darray::exchange_and_write(ios, &mut file, &desc, slot)?;
        }
        MsgId::ReadDarray => {
            let ncid = state.file(comp, arg_int(&args[0]))?;
            let varid = arg_int(&args[1]);
            let ioid = state.decomp(comp, arg_int(&args[2]))?;
            let desc = crate::decomp::get_decomp(ioid)?;
            let f = crate::file::get_file(ncid)?;
            let mut file = f.borrow_mut();
            // A read must observe every write still pending on the io
            // side.
            crate::reqblock::flush_output_buffer(&mut file, true, 0)?;
            let mut out = Vec::new();
            crate::darray::read_darray_local(ios, &mut file, varid, &desc, &mut out)?;
        }
        MsgId::SetErrorHandler => {
            let h = crate::error::ErrorHandler::from_i32(arg_int(&args[0]))?;
            ios.error_handler.set(h);
        }
        MsgId::SetRearrOpts => {
            let v = arg_ints(&args[0]);
            let fc = if v[0] == 0 {
                crate::iosystem::FcMode::Collective
            } else {
                crate::iosystem::FcMode::Point2Point
            };
            *ios.rearr_opts.borrow_mut() = crate::iosystem::RearrOpts {
                fc_mode: fc,
                comp2io: crate::iosystem::RearrDirOpts {
                    handshake: v[1] != 0,
                    isend: v[2] != 0,
                    max_pending_reqs: v[3],
                },
                io2comp: crate::iosystem::RearrDirOpts {
                    handshake: v[4] != 0,
                    isend: v[5] != 0,
                    max_pending_reqs: v[6],
                },
            };
        }
        MsgId::Finalize => {}
        MsgId::Invalid | MsgId::Exit => {}
    }
    Ok(())
}

fn delete_local(ios: &Rc<IoSystem>, fname: &str) -> Result<()> {
    let mut code = 0i32;
    if ios.my_comm().rank() == 0
        && let Err(e) = std::fs::remove_file(fname)
    {
        code = PioError::from(e).code();
    }
    let code = crate::comm::agree_status(ios.my_comm(), code);
    match PioError::from_code(code) {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

fn decode_fills(buf: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut off = 0usize;
    let take = |off: &mut usize, n: usize| -> Result<&[u8]> {
        let s = buf.get(*off..*off + n).ok_or(PioError::Io)?;
        *off += n;
        Ok(s)
    };
    let n = u32::from_ne_bytes(take(&mut off, 4)?.try_into().unwrap()) as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let len = u32::from_ne_bytes(take(&mut off, 4)?.try_into().unwrap()) as usize;
        out.push(take(&mut off, len)?.to_vec());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_lockstep() {
        let sig = signature(MsgId::DefVar);
        let args = vec![
            MsgArg::Int(16),
            MsgArg::Str("humidity".into()),
            MsgArg::Int(PioType::Float as i32),
            MsgArg::IntArr(vec![0, 1, 2]),
        ];
        let decoded = decode(sig, &encode(sig, &args));
        assert_eq!(decoded, args);
    }

    #[test]
    fn test_encode_all_item_kinds() {
        let sig: &[ParamDesc] = &[
            P::Int,
            P::Offset,
            P::Float,
            P::Byte,
            P::Str(I32, Callee),
            P::Bytes(I64, Callee),
            P::OffArr(I32, Caller),
            P::FloatArr(I32, Callee),
        ];
        let args = vec![
            MsgArg::Int(-3),
            MsgArg::Offset(1 << 40),
            MsgArg::Float(2.5),
            MsgArg::Byte(7),
            MsgArg::Str("x".into()),
            MsgArg::Bytes(vec![9, 8]),
            MsgArg::OffArr(vec![5, 6, 7]),
            MsgArg::FloatArr(vec![1.0]),
        ];
        assert_eq!(decode(sig, &encode(sig, &args)), args);
    }

    #[test]
    #[should_panic(expected = "signature drift")]
    fn test_encode_arity_mismatch_panics() {
        encode(signature(MsgId::CloseFile), &[MsgArg::Str("no".into())]);
    }

    #[test]
    #[should_panic(expected = "desync")]
    fn test_decode_trailing_bytes_panics() {
        let sig = signature(MsgId::CloseFile);
        let mut buf = encode(sig, &[MsgArg::Int(1)]);
        buf.push(0);
        decode(sig, &buf);
    }

    #[test]
    fn test_empty_signatures_for_local_msgs() {
        assert!(signature(MsgId::Exit).is_empty());
        assert!(signature(MsgId::Finalize).is_empty());
        assert!(signature(MsgId::Invalid).is_empty());
    }

    #[test]
    fn test_msgid_roundtrip() {
        for m in [
            MsgId::CreateFile,
            MsgId::OpenFile,
            MsgId::CloseFile,
            MsgId::PutVars,
            MsgId::GetAtt,
            MsgId::InitDecomp,
            MsgId::WriteDarrayMulti,
            MsgId::Finalize,
            MsgId::Exit,
        ] {
            assert_eq!(MsgId::from_i32(m as i32), m);
        }
        assert_eq!(MsgId::from_i32(9999), MsgId::Invalid);
    }
}
