// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sequence-id bookkeeping for outstanding commands.
//!
//! Every posted command carries an 8-bit sequence id that firmware echoes in
//! its reply. Callers refer to commands by a 32-bit descriptor instead, which
//! stays unique long after the id has been reused.

use drv_soe_api::{Frame, SoeError, MAX_SEQUENCES};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SeqState {
    Free,
    /// Acquired but not yet in the command queue.
    Pending,
    /// In the command queue, waiting for a reply.
    Used,
    /// Reply received and not yet collected.
    Completed,
    /// Abandoned by its caller. The id stays reserved until the late reply
    /// shows up, so it cannot be confused with a newer command.
    TimedOut,
}

/// What happened when a reply was matched against the table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// The reply was stored for its waiter.
    Delivered,
    /// The waiter had given up; the id has been retired.
    Late,
    /// Nothing was outstanding under that id.
    Unknown,
    /// A reply was already stored for that id.
    Duplicate,
}

/// Status of a command, by descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CmdState {
    /// No such command was ever issued.
    None,
    Running,
    Done,
}

#[derive(Clone, Debug)]
struct Slot {
    state: SeqState,
    desc: u32,
    deadline: Option<u64>,
    reply: Option<Frame>,
}

const FREE: Slot = Slot {
    state: SeqState::Free,
    desc: 0,
    deadline: None,
    reply: None,
};

pub struct Sequencer {
    slots: [Slot; MAX_SEQUENCES],
    latest: u8,
    next_desc: u32,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            slots: [FREE; MAX_SEQUENCES],
            // Chosen so the first acquire hands out id 0.
            latest: u8::MAX,
            next_desc: 0,
        }
    }

    /// Reserves a sequence id, searching round-robin from just after the
    /// last one handed out. Completed replies nobody collected are reclaimed.
    pub fn acquire(&mut self) -> Result<u8, SoeError> {
        for step in 1..=MAX_SEQUENCES {
            let id = self.latest.wrapping_add(step as u8);
            let slot = &mut self.slots[usize::from(id)];
            if matches!(slot.state, SeqState::Free | SeqState::Completed) {
                *slot = Slot {
                    state: SeqState::Pending,
                    ..FREE
                };
                self.latest = id;
                return Ok(id);
            }
        }
        Err(SoeError::NoFreeSequence)
    }

    /// Gives a pending id its descriptor and optional deadline.
    pub fn assign(&mut self, id: u8, deadline: Option<u64>) -> u32 {
        let desc = self.next_desc;
        self.next_desc = self.next_desc.wrapping_add(1);
        let slot = &mut self.slots[usize::from(id)];
        slot.desc = desc;
        slot.deadline = deadline;
        desc
    }

    /// Records that the command is now in the queue.
    pub fn mark_used(&mut self, id: u8) {
        let slot = &mut self.slots[usize::from(id)];
        if slot.state == SeqState::Pending {
            slot.state = SeqState::Used;
        }
    }

    /// Returns an id to the pool without waiting for a reply.
    pub fn release(&mut self, id: u8) {
        self.slots[usize::from(id)] = FREE;
    }

    /// Matches a reply with the command that is waiting for it.
    pub fn complete(&mut self, id: u8, reply: Frame) -> Completion {
        let slot = &mut self.slots[usize::from(id)];
        match slot.state {
            SeqState::Used => {
                slot.state = SeqState::Completed;
                slot.reply = Some(reply);
                Completion::Delivered
            }
            SeqState::TimedOut => {
                *slot = FREE;
                Completion::Late
            }
            SeqState::Completed => Completion::Duplicate,
            SeqState::Free | SeqState::Pending => Completion::Unknown,
        }
    }

    fn find(&self, desc: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.state != SeqState::Free && s.desc == desc)
    }

    /// Hands back the reply for `desc` if it has arrived, freeing the id.
    pub fn take_reply(&mut self, desc: u32) -> Option<Frame> {
        let i = self.find(desc)?;
        let slot = &mut self.slots[i];
        if slot.state != SeqState::Completed {
            return None;
        }
        let reply = slot.reply.take();
        *slot = FREE;
        reply
    }

    pub fn status(&self, desc: u32) -> CmdState {
        // Descriptors are handed out in order, so anything at or past the
        // next one was never issued. This only holds until the counter wraps.
        if desc >= self.next_desc {
            return CmdState::None;
        }
        match self.find(desc).map(|i| self.slots[i].state) {
            Some(SeqState::Pending | SeqState::Used) => CmdState::Running,
            _ => CmdState::Done,
        }
    }

    /// Gives up on a command. Its id stays reserved if firmware may still
    /// answer it.
    pub fn cancel(&mut self, desc: u32) -> Result<u8, SoeError> {
        let i = self.find(desc).ok_or(SoeError::UnknownSequence)?;
        let slot = &mut self.slots[i];
        match slot.state {
            SeqState::Used => slot.state = SeqState::TimedOut,
            SeqState::Pending | SeqState::Completed => *slot = FREE,
            SeqState::Free | SeqState::TimedOut => {
                return Err(SoeError::UnknownSequence)
            }
        }
        Ok(i as u8)
    }

    /// Forgets every command. Only safe once firmware can no longer reply.
    pub fn cancel_all(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = FREE;
        }
    }

    pub fn deadline(&self, desc: u32) -> Option<u64> {
        self.find(desc).and_then(|i| self.slots[i].deadline)
    }

    pub fn state(&self, id: u8) -> SeqState {
        self.slots[usize::from(id)].state
    }

    /// Number of ids not available to `acquire`.
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s.state, SeqState::Free | SeqState::Completed))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use drv_soe_api::UnitId;
    use proptest::prelude::*;

    fn reply() -> Frame {
        Frame::header_only(UnitId::Null)
    }

    fn post(s: &mut Sequencer) -> (u8, u32) {
        let id = s.acquire().unwrap();
        let desc = s.assign(id, None);
        s.mark_used(id);
        (id, desc)
    }

    #[test]
    fn ids_round_robin() {
        let mut s = Sequencer::new();
        let (a, _) = post(&mut s);
        let (b, _) = post(&mut s);
        assert_eq!((a, b), (0, 1));
        s.release(a);
        // Freed ids are not reused until the search wraps around.
        assert_eq!(s.acquire(), Ok(2));
    }

    #[test]
    fn exhaustion() {
        let mut s = Sequencer::new();
        for _ in 0..MAX_SEQUENCES {
            post(&mut s);
        }
        assert_eq!(s.acquire(), Err(SoeError::NoFreeSequence));
        assert_eq!(s.in_flight(), MAX_SEQUENCES);
    }

    #[test]
    fn completes_exactly_once() {
        let mut s = Sequencer::new();
        let (id, desc) = post(&mut s);
        assert_eq!(s.status(desc), CmdState::Running);
        assert_eq!(s.complete(id, reply()), Completion::Delivered);
        assert_eq!(s.complete(id, reply()), Completion::Duplicate);
        assert_eq!(s.status(desc), CmdState::Done);
        assert_eq!(s.take_reply(desc), Some(reply()));
        assert_eq!(s.take_reply(desc), None);
        assert_eq!(s.complete(id, reply()), Completion::Unknown);
    }

    #[test]
    fn timed_out_id_stays_reserved_until_late_reply() {
        let mut s = Sequencer::new();
        let (id, desc) = post(&mut s);
        assert_eq!(s.cancel(desc), Ok(id));
        assert_eq!(s.state(id), SeqState::TimedOut);
        assert_eq!(s.status(desc), CmdState::Done);

        // Walk all the way around; the abandoned id must be skipped.
        for _ in 0..MAX_SEQUENCES - 1 {
            let (other, _) = post(&mut s);
            assert_ne!(other, id);
        }
        assert_eq!(s.acquire(), Err(SoeError::NoFreeSequence));

        assert_eq!(s.complete(id, reply()), Completion::Late);
        assert_eq!(s.state(id), SeqState::Free);
        assert_eq!(s.acquire(), Ok(id));
    }

    #[test]
    fn status_of_unknown_descriptors() {
        let mut s = Sequencer::new();
        assert_eq!(s.status(0), CmdState::None);
        assert_eq!(s.cancel(0), Err(SoeError::UnknownSequence));
        let (_, desc) = post(&mut s);
        assert_eq!(s.status(desc + 1), CmdState::None);
        s.cancel_all();
        assert_eq!(s.status(desc), CmdState::Done);
        assert_eq!(s.in_flight(), 0);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Post,
        Reply(u8),
        Cancel(u8),
        Take(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Post),
            2 => any::<u8>().prop_map(Op::Reply),
            1 => any::<u8>().prop_map(Op::Cancel),
            1 => any::<u8>().prop_map(Op::Take),
        ]
    }

    /// What the table should hold for an id that is not free.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Held {
        Running,
        TimedOut,
        Completed,
    }

    impl Held {
        fn state(self) -> SeqState {
            match self {
                Held::Running => SeqState::Used,
                Held::TimedOut => SeqState::TimedOut,
                Held::Completed => SeqState::Completed,
            }
        }
    }

    proptest! {
        #[test]
        fn outstanding_ids_are_unique(ops in proptest::collection::vec(op(), 1..600)) {
            let mut s = Sequencer::new();
            let mut held: BTreeMap<u8, (u32, Held)> = BTreeMap::new();
            let mut descs: Vec<u32> = vec![];
            let pick = |descs: &[u32], n: u8| {
                descs.get(usize::from(n) % descs.len().max(1)).copied()
            };

            for op in ops {
                match op {
                    Op::Post => match s.acquire() {
                        Ok(id) => {
                            let prior = held.get(&id).map(|&(_, h)| h);
                            prop_assert!(
                                matches!(prior, None | Some(Held::Completed)),
                                "id {} reissued while {:?}", id, prior
                            );
                            let d = s.assign(id, None);
                            s.mark_used(id);
                            held.insert(id, (d, Held::Running));
                            descs.push(d);
                        }
                        Err(e) => {
                            prop_assert_eq!(e, SoeError::NoFreeSequence);
                            let reserved = held
                                .values()
                                .filter(|&&(_, h)| h != Held::Completed)
                                .count();
                            prop_assert_eq!(reserved, MAX_SEQUENCES);
                        }
                    },
                    Op::Reply(id) => {
                        let expect = match held.get(&id).map(|&(_, h)| h) {
                            Some(Held::Running) => {
                                if let Some(e) = held.get_mut(&id) {
                                    e.1 = Held::Completed;
                                }
                                Completion::Delivered
                            }
                            Some(Held::TimedOut) => {
                                held.remove(&id);
                                Completion::Late
                            }
                            Some(Held::Completed) => Completion::Duplicate,
                            None => Completion::Unknown,
                        };
                        prop_assert_eq!(s.complete(id, reply()), expect);
                    }
                    Op::Cancel(n) => {
                        let Some(d) = pick(&descs[..], n) else { continue };
                        let entry = held
                            .iter()
                            .find(|&(_, &(hd, _))| hd == d)
                            .map(|(&id, &(_, h))| (id, h));
                        let expect = match entry {
                            Some((id, Held::Running)) => {
                                held.insert(id, (d, Held::TimedOut));
                                Ok(id)
                            }
                            Some((id, Held::Completed)) => {
                                held.remove(&id);
                                Ok(id)
                            }
                            Some((_, Held::TimedOut)) | None => {
                                Err(SoeError::UnknownSequence)
                            }
                        };
                        prop_assert_eq!(s.cancel(d), expect);
                    }
                    Op::Take(n) => {
                        let Some(d) = pick(&descs[..], n) else { continue };
                        let done = held
                            .iter()
                            .find(|&(_, &(hd, h))| hd == d && h == Held::Completed)
                            .map(|(&id, _)| id);
                        if let Some(id) = done {
                            held.remove(&id);
                        }
                        prop_assert_eq!(s.take_reply(d).is_some(), done.is_some());
                    }
                }

                for id in 0..=u8::MAX {
                    let want = held
                        .get(&id)
                        .map_or(SeqState::Free, |&(_, h)| h.state());
                    prop_assert_eq!(s.state(id), want, "id {}", id);
                }
                for (&id, &(d, h)) in &held {
                    prop_assert_eq!(s.find(d), Some(usize::from(id)));
                    let running = h == Held::Running;
                    prop_assert_eq!(s.status(d) == CmdState::Running, running);
                }
            }
        }
    }
}
