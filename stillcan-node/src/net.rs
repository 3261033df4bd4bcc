//! The frame dispatcher and timer facade
//!
//! [`CanNet`] is the only place the engine and the host touch: inbound
//! frames are matched against registered receive filters, due timers are
//! popped in deadline order, and outbound frames funnel through one
//! host-supplied send callback. Time is a monotonic microsecond count that
//! the host passes into every entry point; the engine never reads a clock.

use snafu::Snafu;

use stillcan_common::{CanFrame, CanId};

/// A receive filter: a frame matches when `(raw_id & mask) == (id & mask)`
/// and the frame kind (standard/extended) agrees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFilter {
    /// Identifier bits to match
    pub id: u32,
    /// Mask selecting the identifier bits that must agree
    pub mask: u32,
    /// True to match extended (29-bit) frames, false for standard
    pub ext: bool,
}

impl CanFilter {
    /// A filter matching exactly one COB-ID
    pub fn exact(id: CanId) -> Self {
        match id {
            CanId::Std(id) => CanFilter {
                id: id as u32,
                mask: 0x7FF,
                ext: false,
            },
            CanId::Extended(id) => CanFilter {
                id,
                mask: 0x1FFF_FFFF,
                ext: true,
            },
        }
    }

    /// Does `frame` match this filter?
    pub fn matches(&self, frame: &CanFrame) -> bool {
        frame.id.is_extended() == self.ext && (frame.id.raw() & self.mask) == (self.id & self.mask)
    }
}

/// The error returned by the host's send callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(display("The host failed to send a CAN frame"))]
pub struct SendError;

/// The host-supplied send callback
pub type SendFn = Box<dyn FnMut(&CanFrame) -> Result<(), SendError>>;

/// Frame dispatcher plus timer queue, keyed by a copyable tag type
///
/// Receivers and timers are registered under a tag; routing a frame yields
/// the tags of every matching filter in registration order, and ticking
/// yields the tags of every expired timer in deadline order. The caller maps
/// tags back to whatever owns them. Registrations live until explicitly
/// removed.
pub struct CanNet<T> {
    filters: Vec<(T, CanFilter)>,
    timers: Vec<(T, u64, u64)>,
    seq: u64,
    send_fn: SendFn,
}

impl<T: core::fmt::Debug> core::fmt::Debug for CanNet<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CanNet")
            .field("filters", &self.filters)
            .field("timers", &self.timers.len())
            .finish()
    }
}

impl<T: Copy + PartialEq> CanNet<T> {
    /// Create a dispatcher around the host's send callback
    pub fn new(send_fn: SendFn) -> Self {
        Self {
            filters: Vec::new(),
            timers: Vec::new(),
            seq: 0,
            send_fn,
        }
    }

    /// Register (or replace) the receive filter for a tag
    pub fn register_recv(&mut self, tag: T, filter: CanFilter) {
        if let Some(entry) = self.filters.iter_mut().find(|(t, _)| *t == tag) {
            entry.1 = filter;
        } else {
            self.filters.push((tag, filter));
        }
    }

    /// Remove the receive filter for a tag
    pub fn unregister_recv(&mut self, tag: T) {
        self.filters.retain(|(t, _)| *t != tag);
    }

    /// The tags of every filter matching `frame`, in registration order
    pub fn route(&self, frame: &CanFrame) -> Vec<T> {
        self.filters
            .iter()
            .filter(|(_, f)| f.matches(frame))
            .map(|(t, _)| *t)
            .collect()
    }

    /// Arm (or re-arm) the timer for a tag
    pub fn arm(&mut self, tag: T, deadline_us: u64) {
        self.disarm(tag);
        self.seq += 1;
        self.timers.push((tag, deadline_us, self.seq));
    }

    /// Cancel the timer for a tag
    pub fn disarm(&mut self, tag: T) {
        self.timers.retain(|(t, _, _)| *t != tag);
    }

    /// The earliest pending deadline, for hosts that wait externally
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.iter().map(|(_, d, _)| *d).min()
    }

    /// Remove and return every timer with `deadline <= now`, in deadline
    /// order (insertion order breaks ties)
    pub fn pop_due(&mut self, now: u64) -> Vec<T> {
        let mut due: Vec<(T, u64, u64)> = Vec::new();
        self.timers.retain(|entry| {
            if entry.1 <= now {
                due.push(*entry);
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(_, d, s)| (*d, *s));
        due.into_iter().map(|(t, _, _)| t).collect()
    }

    /// Hand a frame to the host for transmission
    ///
    /// Failures are reported to the caller; the engine does not retry.
    pub fn send(&mut self, frame: &CanFrame) -> Result<(), SendError> {
        (self.send_fn)(frame)
    }
}
