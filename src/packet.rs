//! Packets
//!
//! A [`Packet`] is the unit of flow between pipes: an optional payload
//! buffer, an attribute dictionary, and a vector of related timestamps.
//! Packets are owned exclusively; pushing one into a pipe moves it, so the
//! "exactly one owner during traversal" rule is enforced by the compiler.
//! Duplication deep-copies the attributes and clocks and shares the payload
//! storage, which from that point on refuses writable access until one side
//! lets go.
//!
//! # Timestamps
//!
//! Three time axes are carried: **sys** (local monotonic), **prog** (sender
//! program clock) and **orig** (original stream dates). Each axis stores
//! one base date tagged as clock reference, DTS or PTS, and the two
//! inter-stamp delays (`cr_dts_delay`, `dts_pts_delay`) are shared by all
//! axes. Getters derive the other stamps from the base and the delays:
//! asking for a stamp that needs an unset delay yields `None`.

use crate::attr::AttrDict;
use crate::buf::Buf;
use crate::clock::MAX_33BITS;
use crate::error::Result;

/// Which stamp a stored base date represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DateKind {
    /// Clock reference (transmission time)
    Cr,
    /// Decoding timestamp
    Dts,
    /// Presentation timestamp
    Pts,
}

/// A time axis: sys, prog or orig
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateAxis {
    /// Local monotonic time
    Sys,
    /// Sender program clock
    Prog,
    /// Original stream dates
    Orig,
}

/// Per-packet timestamp state
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockVector {
    date_sys: Option<(u64, DateKind)>,
    date_prog: Option<(u64, DateKind)>,
    date_orig: Option<(u64, DateKind)>,
    /// Delay between clock reference and DTS
    pub cr_dts_delay: Option<u64>,
    /// Delay between DTS and PTS
    pub dts_pts_delay: Option<u64>,
    /// Playback duration of the payload
    pub duration: Option<u64>,
    /// System date of the latest random access point
    pub rap_sys: Option<u64>,
    /// Wrap modulus of the original timestamps (33-bit MPEG by default)
    pub wrap: Option<u64>,
}

impl ClockVector {
    fn axis(&self, axis: DateAxis) -> Option<(u64, DateKind)> {
        match axis {
            DateAxis::Sys => self.date_sys,
            DateAxis::Prog => self.date_prog,
            DateAxis::Orig => self.date_orig,
        }
    }

    fn axis_mut(&mut self, axis: DateAxis) -> &mut Option<(u64, DateKind)> {
        match axis {
            DateAxis::Sys => &mut self.date_sys,
            DateAxis::Prog => &mut self.date_prog,
            DateAxis::Orig => &mut self.date_orig,
        }
    }

    /// Store a base date on an axis
    pub fn set_date(&mut self, axis: DateAxis, value: u64, kind: DateKind) {
        *self.axis_mut(axis) = Some((value, kind));
    }

    /// Forget an axis
    pub fn delete_date(&mut self, axis: DateAxis) {
        *self.axis_mut(axis) = None;
    }

    /// Derive a stamp of `kind` on `axis` from the stored base and delays
    pub fn date(&self, axis: DateAxis, kind: DateKind) -> Option<u64> {
        let (base, stored) = self.axis(axis)?;
        match (stored, kind) {
            (s, k) if s == k => Some(base),
            (DateKind::Cr, DateKind::Dts) => base.checked_add(self.cr_dts_delay?),
            (DateKind::Cr, DateKind::Pts) => base
                .checked_add(self.cr_dts_delay?)?
                .checked_add(self.dts_pts_delay?),
            (DateKind::Dts, DateKind::Pts) => base.checked_add(self.dts_pts_delay?),
            (DateKind::Dts, DateKind::Cr) => base.checked_sub(self.cr_dts_delay?),
            (DateKind::Pts, DateKind::Dts) => base.checked_sub(self.dts_pts_delay?),
            (DateKind::Pts, DateKind::Cr) => base
                .checked_sub(self.dts_pts_delay?)?
                .checked_sub(self.cr_dts_delay?),
            _ => unreachable!(),
        }
    }
}

/// Unit of flow: payload + attributes + clocks
#[derive(Default)]
pub struct Packet {
    /// Payload, if any
    pub buf: Option<Buf>,
    /// Attributes
    pub attrs: AttrDict,
    /// Timestamps
    pub clock: ClockVector,
    /// Pool to return the attribute storage to on drop
    mgr: Option<PacketMgr>,
}

impl Packet {
    /// Bare packet without pooling; prefer [`PacketMgr::alloc`] in pipes
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep-copy attributes and clocks, share the payload
    pub fn dup(&self) -> Packet {
        Packet {
            buf: self.buf.as_ref().map(Buf::dup),
            attrs: self.attrs.clone(),
            clock: self.clock,
            mgr: self.mgr.clone(),
        }
    }

    /// Attach a payload, returning the previous one
    pub fn attach_buf(&mut self, buf: Buf) -> Option<Buf> {
        self.buf.replace(buf)
    }

    /// Detach the payload
    pub fn detach_buf(&mut self) -> Option<Buf> {
        self.buf.take()
    }

    // Clock shorthands, sys axis

    /// Set the clock reference in system time
    pub fn set_cr_sys(&mut self, v: u64) {
        self.clock.set_date(DateAxis::Sys, v, DateKind::Cr);
    }

    /// Set the DTS in system time
    pub fn set_dts_sys(&mut self, v: u64) {
        self.clock.set_date(DateAxis::Sys, v, DateKind::Dts);
    }

    /// Set the PTS in system time
    pub fn set_pts_sys(&mut self, v: u64) {
        self.clock.set_date(DateAxis::Sys, v, DateKind::Pts);
    }

    /// Clock reference in system time
    pub fn cr_sys(&self) -> Option<u64> {
        self.clock.date(DateAxis::Sys, DateKind::Cr)
    }

    /// DTS in system time
    pub fn dts_sys(&self) -> Option<u64> {
        self.clock.date(DateAxis::Sys, DateKind::Dts)
    }

    /// PTS in system time
    pub fn pts_sys(&self) -> Option<u64> {
        self.clock.date(DateAxis::Sys, DateKind::Pts)
    }

    // Clock shorthands, prog axis

    /// Set the clock reference in program time
    pub fn set_cr_prog(&mut self, v: u64) {
        self.clock.set_date(DateAxis::Prog, v, DateKind::Cr);
    }

    /// Set the DTS in program time
    pub fn set_dts_prog(&mut self, v: u64) {
        self.clock.set_date(DateAxis::Prog, v, DateKind::Dts);
    }

    /// Set the PTS in program time
    pub fn set_pts_prog(&mut self, v: u64) {
        self.clock.set_date(DateAxis::Prog, v, DateKind::Pts);
    }

    /// Clock reference in program time
    pub fn cr_prog(&self) -> Option<u64> {
        self.clock.date(DateAxis::Prog, DateKind::Cr)
    }

    /// DTS in program time
    pub fn dts_prog(&self) -> Option<u64> {
        self.clock.date(DateAxis::Prog, DateKind::Dts)
    }

    /// PTS in program time
    pub fn pts_prog(&self) -> Option<u64> {
        self.clock.date(DateAxis::Prog, DateKind::Pts)
    }

    /// Wrap modulus for original timestamps (33-bit MPEG when unset)
    pub fn wrap(&self) -> u64 {
        self.clock.wrap.unwrap_or(MAX_33BITS)
    }

    // Attribute-backed flags

    /// Mark the start of an access unit
    pub fn set_start(&mut self) -> Result<()> {
        self.attrs.set_void("b.start")
    }

    /// Whether the packet starts an access unit
    pub fn is_start(&self) -> bool {
        self.attrs.has_void("b.start")
    }

    /// Mark the end of a logical stream section
    pub fn set_end(&mut self) -> Result<()> {
        self.attrs.set_void("b.end")
    }

    /// Whether the packet ends a logical stream section
    pub fn is_end(&self) -> bool {
        self.attrs.has_void("b.end")
    }

    /// Mark a random access point
    pub fn set_random(&mut self) -> Result<()> {
        self.attrs.set_void("f.random")
    }

    /// Whether the packet is a random access point
    pub fn is_random(&self) -> bool {
        self.attrs.has_void("f.random")
    }

    /// Mark a timeline discontinuity
    pub fn set_discontinuity(&mut self) -> Result<()> {
        self.attrs.set_void("f.disc")
    }

    /// Whether the packet follows a timeline discontinuity
    pub fn is_discontinuity(&self) -> bool {
        self.attrs.has_void("f.disc")
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(mgr) = self.mgr.take() {
            let mut attrs = std::mem::take(&mut self.attrs);
            attrs.clear();
            mgr.recycle(attrs);
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("buf", &self.buf)
            .field("attrs", &self.attrs)
            .field("dts_sys", &self.dts_sys())
            .finish()
    }
}

mod mgr {
    use std::sync::Arc;

    use crossbeam_queue::ArrayQueue;

    use super::Packet;
    use crate::attr::AttrDict;

    /// Pool-backed packet factory
    ///
    /// Shared by reference across pipes (and loops); recycles attribute
    /// storage so the per-packet cost on the hot path is amortized away.
    #[derive(Clone)]
    pub struct PacketMgr {
        pool: Arc<ArrayQueue<AttrDict>>,
    }

    impl PacketMgr {
        /// Create a manager recycling up to `depth` attribute buffers
        pub fn new(depth: usize) -> Self {
            Self {
                pool: Arc::new(ArrayQueue::new(depth.max(1))),
            }
        }

        /// Hand out an empty packet
        pub fn alloc(&self) -> Packet {
            let attrs = self.pool.pop().unwrap_or_default();
            Packet {
                buf: None,
                attrs,
                clock: Default::default(),
                mgr: Some(self.clone()),
            }
        }

        pub(super) fn recycle(&self, attrs: AttrDict) {
            // Full pool: let the allocation die.
            let _ = self.pool.push(attrs);
        }
    }

    impl std::fmt::Debug for PacketMgr {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("PacketMgr")
                .field("pooled", &self.pool.len())
                .finish()
        }
    }
}

pub use mgr::PacketMgr;
