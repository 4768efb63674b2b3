use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use super::{Comm, tags};

// Message key inside a mailbox: (communicator id, source rank, tag).
type MsgKey = (u64, i32, i32);

/// One per-process mailbox. Senders push; the owning rank blocks on the
/// condvar until a matching message arrives.
struct Slot {
    mail: Mutex<HashMap<MsgKey, VecDeque<Vec<u8>>>>,
    cv: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            mail: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
        }
    }

    fn push(&self, key: MsgKey, data: Vec<u8>) {
        let mut mail = self.mail.lock().unwrap();
        mail.entry(key).or_default().push_back(data);
        self.cv.notify_all();
    }

    fn pop(&self, key: MsgKey) -> Vec<u8> {
        let mut mail = self.mail.lock().unwrap();
        loop {
            if let Some(q) = mail.get_mut(&key)
                && let Some(msg) = q.pop_front()
            {
                return msg;
            }
            mail = self.cv.wait(mail).unwrap();
        }
    }

    fn try_pop(&self, key: MsgKey) -> Option<Vec<u8>> {
        let mut mail = self.mail.lock().unwrap();
        mail.get_mut(&key).and_then(|q| q.pop_front())
    }

    fn pop_any(&self, comm_id: u64, tag: i32) -> (i32, Vec<u8>) {
        let mut mail = self.mail.lock().unwrap();
        loop {
            // Lowest source first, for determinism across runs.
            let mut best: Option<i32> = None;
            for (&(cid, src, t), q) in mail.iter() {
                if cid == comm_id && t == tag && !q.is_empty() {
                    best = Some(best.map_or(src, |b: i32| b.min(src)));
                }
            }
            if let Some(src) = best {
                let msg = mail
                    .get_mut(&(comm_id, src, tag))
                    .unwrap()
                    .pop_front()
                    .unwrap();
                return (src, msg);
            }
            mail = self.cv.wait(mail).unwrap();
        }
    }
}

struct WorldInner {
    slots: Vec<Slot>,
    next_comm_id: Mutex<u64>,
}

/// In-process communicator: one thread per rank, mailbox transport.
///
/// This is the substrate the test suite runs the whole library on; it
/// needs no external launcher and is fully deterministic for a fixed
/// interleaving of collective calls.
pub struct LocalComm {
    world: Arc<WorldInner>,
    comm_id: u64,
    /// Global slot index per rank of this communicator.
    members: Vec<usize>,
    rank: i32,
}

impl LocalComm {
    /// Create a world of `n` ranks and return one communicator handle per
    /// rank. Each handle must be used from exactly one thread.
    pub fn world(n: usize) -> Vec<Arc<dyn Comm>> {
        let inner = Arc::new(WorldInner {
            slots: (0..n).map(|_| Slot::new()).collect(),
            next_comm_id: Mutex::new(1),
        });
        (0..n)
            .map(|rank| {
                Arc::new(LocalComm {
                    world: Arc::clone(&inner),
                    comm_id: 0,
                    members: (0..n).collect(),
                    rank: rank as i32,
                }) as Arc<dyn Comm>
            })
            .collect()
    }

    fn my_slot(&self) -> &Slot {
        &self.world.slots[self.members[self.rank as usize]]
    }
}

impl Comm for LocalComm {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.members.len() as i32
    }

    fn send(&self, dest: i32, tag: i32, data: &[u8]) {
        let slot = &self.world.slots[self.members[dest as usize]];
        slot.push((self.comm_id, self.rank, tag), data.to_vec());
    }

    fn recv(&self, src: i32, tag: i32) -> Vec<u8> {
        self.my_slot().pop((self.comm_id, src, tag))
    }

    fn try_recv(&self, src: i32, tag: i32) -> Option<Vec<u8>> {
        self.my_slot().try_pop((self.comm_id, src, tag))
    }

    fn recv_any(&self, tag: i32) -> (i32, Vec<u8>) {
        self.my_slot().pop_any(self.comm_id, tag)
    }

    fn split(&self, color: Option<i32>, key: i32) -> Option<Arc<dyn Comm>> {
        // Root of the parent communicator computes the grouping and hands
        // each rank its new communicator id, rank and member list.
        let me = self.rank;
        let mut req = Vec::with_capacity(8);
        req.extend_from_slice(&color.unwrap_or(i32::MIN).to_ne_bytes());
        req.extend_from_slice(&key.to_ne_bytes());

        if me == 0 {
            let mut entries: Vec<(i32, i32, i32)> = Vec::with_capacity(self.members.len());
            let decode = |b: &[u8], rank: i32| {
                let c = i32::from_ne_bytes(b[0..4].try_into().unwrap());
                let k = i32::from_ne_bytes(b[4..8].try_into().unwrap());
                (c, k, rank)
            };
            entries.push(decode(&req, 0));
            for src in 1..self.size() {
                let b = self.recv(src, tags::SPLIT);
                entries.push(decode(&b, src));
            }

            let mut groups: HashMap<i32, Vec<(i32, i32)>> = HashMap::new();
            for &(c, k, r) in &entries {
                if c != i32::MIN {
                    groups.entry(c).or_default().push((k, r));
                }
            }
            let mut colors: Vec<i32> = groups.keys().copied().collect();
            colors.sort_unstable();

            // (comm id, new rank, member gids) per parent rank.
            let mut replies: Vec<Option<(u64, i32, Vec<usize>)>> =
                vec![None; self.members.len()];
            for c in colors {
                let mut grp = groups.remove(&c).unwrap();
                grp.sort_unstable();
                let id = {
                    let mut next = self.world.next_comm_id.lock().unwrap();
                    let id = *next;
                    *next += 1;
                    id
                };
                let gids: Vec<usize> = grp
                    .iter()
                    .map(|&(_, r)| self.members[r as usize])
                    .collect();
                for (new_rank, &(_, r)) in grp.iter().enumerate() {
                    replies[r as usize] = Some((id, new_rank as i32, gids.clone()));
                }
            }

            let encode = |rep: &Option<(u64, i32, Vec<usize>)>| -> Vec<u8> {
                let mut out = Vec::new();
                match rep {
                    None => out.push(0u8),
                    Some((id, new_rank, gids)) => {
                        out.push(1u8);
                        out.extend_from_slice(&id.to_ne_bytes());
                        out.extend_from_slice(&new_rank.to_ne_bytes());
                        out.extend_from_slice(&(gids.len() as u64).to_ne_bytes());
                        for g in gids {
                            out.extend_from_slice(&(*g as u64).to_ne_bytes());
                        }
                    }
                }
                out
            };
            for r in 1..self.size() {
                self.send(r, tags::SPLIT, &encode(&replies[r as usize]));
            }
            let mine = encode(&replies[0]);
            decode_split_reply(&self.world, &mine)
        } else {
            self.send(0, tags::SPLIT, &req);
            let rep = self.recv(0, tags::SPLIT);
            decode_split_reply(&self.world, &rep)
        }
    }
}

fn decode_split_reply(world: &Arc<WorldInner>, rep: &[u8]) -> Option<Arc<dyn Comm>> {
    if rep[0] == 0 {
        return None;
    }
    let id = u64::from_ne_bytes(rep[1..9].try_into().unwrap());
    let new_rank = i32::from_ne_bytes(rep[9..13].try_into().unwrap());
    let n = u64::from_ne_bytes(rep[13..21].try_into().unwrap()) as usize;
    let mut members = Vec::with_capacity(n);
    for i in 0..n {
        let off = 21 + i * 8;
        members.push(u64::from_ne_bytes(rep[off..off + 8].try_into().unwrap()) as usize);
    }
    Some(Arc::new(LocalComm {
        world: Arc::clone(world),
        comm_id: id,
        members,
        rank: new_rank,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_p2p_fifo_per_pair() {
        let comms = LocalComm::world(2);
        let mut handles = Vec::new();
        for comm in comms {
            handles.push(thread::spawn(move || {
                if comm.rank() == 0 {
                    comm.send(1, 7, b"first");
                    comm.send(1, 7, b"second");
                    comm.send(1, 8, b"other-tag");
                } else {
                    // Tag 8 can be drained before tag 7; per-(src,tag)
                    // order must still hold.
                    assert_eq!(comm.recv(0, 8), b"other-tag");
                    assert_eq!(comm.recv(0, 7), b"first");
                    assert_eq!(comm.recv(0, 7), b"second");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_recv_any_picks_lowest_source() {
        let comms = LocalComm::world(3);
        let mut handles = Vec::new();
        for comm in comms {
            handles.push(thread::spawn(move || match comm.rank() {
                2 => {
                    let _ = comm.recv(0, 1);
                    let _ = comm.recv(1, 1);
                    let (s1, _) = comm.recv_any(2);
                    let (s2, _) = comm.recv_any(2);
                    // Both senders signalled readiness on tag 1 first, so
                    // both tag-2 messages are queued; lowest source wins.
                    assert_eq!((s1, s2), (0, 1));
                }
                r => {
                    comm.send(2, 2, &[r as u8]);
                    comm.send(2, 1, &[]);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
