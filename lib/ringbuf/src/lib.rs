// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trace ring buffer for the SOE transport and CCI onboarding drivers
//!
//! Every driver component in this workspace records what it did as a stream of
//! small, typed events rather than formatted text. Those events land in a
//! [`Ringbuf`], a fixed-size circular buffer that remembers the source line
//! that produced each entry and collapses immediate repeats into a single
//! entry with a count.
//!
//! ## Constraints
//!
//! The payload type must implement `Copy` and `PartialEq`. In practice every
//! component defines a `Trace` enum with a `None` variant to use as the
//! initializer.
//!
//! ## Owning a ring buffer
//!
//! A ring buffer is an ordinary value. Components keep one as a field, which
//! lets several devices be instantiated side by side and lets tests look at
//! what was recorded:
//!
//! ```
//! use ringbuf::{ringbuf_entry, Ringbuf};
//!
//! #[derive(Copy, Clone, Debug, PartialEq)]
//! enum Trace {
//!     None,
//!     Posted { seq: u8 },
//! }
//!
//! struct Engine {
//!     trace: Ringbuf<Trace, 16>,
//! }
//!
//! let mut e = Engine { trace: Ringbuf::new(Trace::None) };
//! ringbuf_entry!(e.trace, Trace::Posted { seq: 1 });
//! assert_eq!(e.trace.last().map(|ent| ent.payload), Some(Trace::Posted { seq: 1 }));
//! ```
//!
//! ## De-duplication
//!
//! When an entry is recorded from the same line with a payload equal to the
//! most recent entry, that entry's `count` is bumped instead of consuming a new
//! slot. Polling loops that record the same observation over and over thus
//! cost one slot. Payloads that carry a timestamp naturally never collapse.
//!
//! ## Disabling
//!
//! With the `disabled` feature, [`ringbuf_entry!`] still evaluates its payload
//! (so that side effects and type checking are preserved) but records nothing.

#![cfg_attr(not(test), no_std)]

/// Records `payload` in the ring buffer `buf`, tagging it with the line of the
/// call site.
///
/// `buf` is any place expression of type [`Ringbuf`], typically a field such
/// as `self.trace`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate the payload before borrowing the buffer so that the payload
        // expression may itself read from the owner of the buffer.
        let p = $payload;
        $crate::Ringbuf::entry(&mut $buf, line!() as u16, p);
    }};
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$buf;
        let _ = $payload;
    }};
}

///
/// A single [`Ringbuf`] entry. `count` is the number of consecutive times this
/// exact `(line, payload)` pair was recorded; `generation` is bumped each time
/// the slot is overwritten.
///
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

///
/// A ring buffer of `N` entries of payload type `T`.
///
#[derive(Debug, Clone)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, { N }> {
    /// Creates an empty ring buffer whose slots are all filled with `init`.
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    /// Records an entry. Use [`ringbuf_entry!`] rather than calling this
    /// directly so that `line` is filled in for you.
    pub fn entry(&mut self, line: u16, payload: T) {
        // `None` is treated as an out-of-range index so that the first entry
        // lands in slot 0 and never merges with the initializer.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        // No remainder here: wrapping usize::MAX to 0 is exactly the starting
        // condition we want.
        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        // N == 0 is a legal (if useless) ring.
        let Some(ent) = self.buffer.get_mut(ndx) else {
            return;
        };
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// Returns the most recently recorded entry, if any.
    pub fn last(&self) -> Option<&RingbufEntry<T>> {
        self.last.and_then(|i| self.buffer.get(i))
    }

    /// Iterates over recorded entries from oldest to newest. Slots that have
    /// never been written are skipped.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = match self.last {
            Some(l) => l + 1,
            None => N,
        };
        self.buffer[start.min(N)..]
            .iter()
            .chain(self.buffer[..start.min(N)].iter())
            .filter(|ent| ent.count != 0)
    }

    /// Iterates over recorded payloads from oldest to newest.
    pub fn payloads(&self) -> impl Iterator<Item = T> + '_ {
        self.iter().map(|ent| ent.payload)
    }

    /// Forgets everything recorded so far.
    pub fn clear(&mut self) {
        for ent in self.buffer.iter_mut() {
            ent.count = 0;
        }
        self.last = None;
    }
}

#[cfg(all(test, not(feature = "disabled")))]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq)]
    enum Trace {
        None,
        Poll(u8),
    }

    #[test]
    fn empty_ring_has_no_entries() {
        let r: Ringbuf<Trace, 4> = Ringbuf::new(Trace::None);
        assert!(r.last().is_none());
        assert_eq!(r.iter().count(), 0);
    }

    #[test]
    fn repeats_collapse_into_count() {
        let mut r: Ringbuf<Trace, 4> = Ringbuf::new(Trace::None);
        for _ in 0..3 {
            ringbuf_entry!(r, Trace::Poll(1));
        }
        let entries: Vec<_> = r.iter().copied().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].count, 3);
        assert_eq!(entries[0].payload, Trace::Poll(1));
    }

    #[test]
    fn same_payload_from_another_line_is_distinct() {
        let mut r: Ringbuf<Trace, 4> = Ringbuf::new(Trace::None);
        ringbuf_entry!(r, Trace::Poll(1));
        ringbuf_entry!(r, Trace::Poll(1));
        assert_eq!(r.iter().count(), 2);
    }

    #[test]
    fn wraps_and_iterates_oldest_first() {
        let mut r: Ringbuf<Trace, 3> = Ringbuf::new(Trace::None);
        for i in 0..5 {
            r.entry(7, Trace::Poll(i));
        }
        let got: Vec<_> = r.payloads().collect();
        assert_eq!(got, vec![Trace::Poll(2), Trace::Poll(3), Trace::Poll(4)]);
        // Slot 0 was written twice.
        assert!(r.iter().any(|e| e.generation == 2));
    }

    #[test]
    fn clear_forgets_entries() {
        let mut r: Ringbuf<Trace, 3> = Ringbuf::new(Trace::None);
        r.entry(1, Trace::Poll(9));
        r.clear();
        assert_eq!(r.iter().count(), 0);
        r.entry(1, Trace::Poll(9));
        assert_eq!(r.last().map(|e| e.count), Some(1));
    }
}
