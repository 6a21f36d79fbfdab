//! TS Encapsulator
//!
//! Packetizes one elementary stream into 188-byte transport packets, on
//! demand: the mux scheduler calls [`splice`] with the time it intends to
//! emit the packet, and the encapsulator keeps it informed of its timing
//! constraints through `TsStatus` events after every state change:
//!
//! - `cr_sys`: earliest time a packet should be injected (leaky-bucket
//!   against the flow's octet rate);
//! - `dts_sys`: latest time before the decoder's transport buffer
//!   underruns (against the T-STD buffer leak rate);
//! - `pcr_sys`: next PCR deadline when this PID carries the program
//!   clock;
//! - `ready`: whether a full packet can be spliced right now.
//!
//! PES packets follow the flow definition: access-unit alignment starts a
//! PES per unit, a minimum PES duration aggregates small audio units, and
//! unaligned flows cut PES packets at transport-packet boundaries to
//! avoid stuffing. PSI flows carry sections with a pointer_field instead
//! of PES framing, stuffed with raw 0xFF.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::BytesMut;

use crate::buf::{BlockBuf, BufMgr};
use crate::clock::FREQ;
use crate::error::{Error, Result};
use crate::flow::{FLOW_MPEGTS, FLOW_MPEGTS_PSI};
use crate::packet::Packet;
use crate::pipe::{Command, Pipe, PipeCtx, PipeHandle, Request, RequestKind, Response};
use crate::probe::{EncapsStatus, Event, ProbeChain};

use super::bits::{
    pes_build_header, pes_header_size, ts_clear_payload, ts_get_adaptation, ts_init, ts_set_cc,
    ts_set_adaptation, ts_set_pid, ts_set_unit_start, tsaf_set_discontinuity, tsaf_set_pcr,
    tsaf_set_random, PES_STREAM_ID_PRIVATE_2, TS_HEADER_SIZE, TS_SIZE,
};

/// Usable payload bytes of a packet without adaptation field
const TS_BODY: usize = TS_SIZE - TS_HEADER_SIZE;

// ---------------------------------------------------------------------------
// Extension commands
// ---------------------------------------------------------------------------

/// Splice command: ask for one transport packet scheduled at `mux_sys`
pub struct TsSplice {
    /// Intended emission time
    pub mux_sys: u64,
    /// The packet, on success
    pub packet: Option<BlockBuf>,
    /// Deadline by which this packet must leave
    pub dts_sys: u64,
}

/// Seed the continuity counter (survives pipe restarts)
pub struct TsSetCc(pub u8);

/// Read the continuity counter after the last emitted packet
pub struct TsGetCc(pub Option<u8>);

/// Make this PID the PCR carrier with the given insertion interval
pub struct TsSetPcrInterval(pub u64);

/// No more input will arrive; flush partial PES packets
pub struct TsEos;

/// Splice one packet out of an encapsulator pipe
pub fn splice(pipe: &PipeHandle, mux_sys: u64) -> Result<(BlockBuf, u64)> {
    let mut cmd = TsSplice {
        mux_sys,
        packet: None,
        dts_sys: u64::MAX,
    };
    pipe.control_ext(&mut cmd)?;
    match cmd.packet {
        Some(packet) => Ok((packet, cmd.dts_sys)),
        None => Err(Error::Unhandled),
    }
}

/// Seed the continuity counter
pub fn set_cc(pipe: &PipeHandle, cc: u8) -> Result<()> {
    pipe.control_ext(&mut TsSetCc(cc))
}

/// Configure PCR insertion
pub fn set_pcr_interval(pipe: &PipeHandle, interval: u64) -> Result<()> {
    pipe.control_ext(&mut TsSetPcrInterval(interval))
}

/// Signal end of stream
pub fn eos(pipe: &PipeHandle) -> Result<()> {
    pipe.control_ext(&mut TsEos)
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// PES packets
    Pes,
    /// PSI sections with pointer_field
    Psi,
}

struct FlowParams {
    framing: Framing,
    octetrate: u64,
    tb_rate: u64,
    pid: u16,
    pes_id: u8,
    alignment: bool,
    min_duration: Option<u64>,
}

struct PendingData {
    buf: BlockBuf,
    cr_sys: u64,
    dts_sys: u64,
    pts_prog: Option<u64>,
    dts_prog: Option<u64>,
    duration: u64,
    start: bool,
    random: bool,
    discontinuity: bool,
}

/// A PES (or section) being emitted
struct CurUnit {
    /// Unsent header bytes (empty for PSI framing)
    header: BytesMut,
    /// Payload bytes of this unit still pending
    payload_left: usize,
    /// pointer_field still owed on the first packet (PSI)
    pointer_due: bool,
    random: bool,
    discontinuity: bool,
    first_packet_done: bool,
}

/// Elementary-stream to transport-stream encapsulator pipe
pub struct TsEncaps {
    flow: Option<FlowParams>,
    flow_def: Option<Packet>,
    buf_mgr: Rc<RefCell<Option<BufMgr>>>,
    pending: VecDeque<PendingData>,
    pending_bytes: usize,
    pending_duration: u64,
    cur: Option<CurUnit>,
    cc: u8,
    pcr_interval: Option<u64>,
    next_pcr_sys: u64,
    /// prog minus sys, from the latest dated input
    prog_offset: Option<i64>,
    last_mux_sys: Option<u64>,
    eos: bool,
    dropped: u64,
}

impl TsEncaps {
    /// New encapsulator; the flow definition arrives via `SetFlowDef`
    pub fn new() -> Self {
        Self {
            flow: None,
            flow_def: None,
            buf_mgr: Rc::new(RefCell::new(None)),
            pending: VecDeque::new(),
            pending_bytes: 0,
            pending_duration: 0,
            cur: None,
            cc: 0,
            pcr_interval: None,
            next_pcr_sys: u64::MAX,
            prog_offset: None,
            last_mux_sys: None,
            eos: false,
            dropped: 0,
        }
    }

    /// Mount with a probe chain
    pub fn mount(probe: ProbeChain) -> PipeHandle {
        PipeHandle::mount(Self::new(), probe)
    }

    fn parse_flow(def: &Packet) -> Result<FlowParams> {
        let framing = if def.flow_def_matches(FLOW_MPEGTS_PSI) {
            Framing::Psi
        } else {
            Framing::Pes
        };
        let octetrate = def.octetrate().filter(|&r| r > 0).ok_or(Error::Invalid)?;
        let pid = def.ts_pid().ok_or(Error::Invalid)?;
        let pes_id = match framing {
            Framing::Pes => def.pes_id().ok_or(Error::Invalid)?,
            Framing::Psi => 0,
        };
        Ok(FlowParams {
            framing,
            octetrate,
            tb_rate: def.tb_rate().unwrap_or(octetrate),
            pid,
            pes_id,
            alignment: def.pes_alignment(),
            min_duration: def.pes_min_duration(),
        })
    }

    fn ensure_buf_mgr(&mut self, ctx: &PipeCtx) -> Result<BufMgr> {
        if let Some(mgr) = self.buf_mgr.borrow().as_ref() {
            return Ok(mgr.clone());
        }
        let slot = Rc::clone(&self.buf_mgr);
        let mut template = Packet::new();
        template.attrs.set_string("f.def", FLOW_MPEGTS)?;
        let request = Request::new(RequestKind::BufMgr, template, move |resp| {
            if let Response::BufMgr(mgr) = resp {
                *slot.borrow_mut() = Some(mgr);
            }
        });
        let _ = ctx.throw(&mut Event::ProvideRequest(&request));
        self.buf_mgr.borrow().clone().ok_or(Error::Alloc)
    }

    // -- timing ------------------------------------------------------------

    fn remaining_bytes(&self) -> usize {
        self.pending_bytes + self.cur.as_ref().map_or(0, |c| c.header.len())
    }

    fn estimated_header_size(&self, flow: &FlowParams, first: &PendingData) -> usize {
        match flow.framing {
            Framing::Psi => 0,
            Framing::Pes => {
                let has_pts =
                    first.pts_prog.is_some() && flow.pes_id != PES_STREAM_ID_PRIVATE_2;
                let has_dts = has_pts
                    && first.dts_prog.is_some()
                    && first.dts_prog != first.pts_prog;
                pes_header_size(flow.pes_id, has_pts, has_dts)
            }
        }
    }

    fn compute_status(&self) -> EncapsStatus {
        let Some(flow) = &self.flow else {
            return EncapsStatus {
                cr_sys: u64::MAX,
                dts_sys: u64::MAX,
                pcr_sys: self.next_pcr_sys,
                ready: false,
            };
        };

        let remaining = self.remaining_bytes() as u64;
        let cr_sys = match self.pending.front() {
            Some(first) => first
                .cr_sys
                .saturating_sub(remaining * FREQ / flow.octetrate),
            None => u64::MAX,
        };

        let mut dts_sys = u64::MAX;
        let mut acc = 0u64;
        for data in &self.pending {
            acc += data.buf.size() as u64;
            dts_sys = dts_sys.min(data.dts_sys.saturating_sub(acc * FREQ / flow.tb_rate));
        }

        let ready = if self.cur.is_some() {
            true
        } else if self.pending.is_empty() {
            false
        } else {
            match flow.framing {
                Framing::Psi => true,
                Framing::Pes => {
                    if flow.alignment {
                        match flow.min_duration {
                            Some(min) => self.eos || self.pending_duration >= min,
                            None => true,
                        }
                    } else {
                        let hdr = self
                            .estimated_header_size(flow, self.pending.front().expect("non-empty"));
                        self.eos || self.pending_bytes + hdr >= TS_BODY
                    }
                }
            }
        };

        EncapsStatus {
            cr_sys,
            dts_sys,
            pcr_sys: self.next_pcr_sys,
            ready,
        }
    }

    fn throw_status(&self, ctx: &PipeCtx) {
        let _ = ctx.throw(&mut Event::TsStatus(self.compute_status()));
    }

    fn prog_of(&self, sys: u64) -> u64 {
        match self.prog_offset {
            Some(offset) => (sys as i64 + offset).max(0) as u64,
            None => 0,
        }
    }

    /// The first PCR goes out with the first injectable packet; until
    /// data arrives there is no PCR deadline
    fn arm_pcr(&mut self) {
        if self.pcr_interval.is_some()
            && self.next_pcr_sys == u64::MAX
            && !self.pending.is_empty()
        {
            self.next_pcr_sys = self.compute_status().cr_sys;
        }
    }

    // -- unit construction -------------------------------------------------

    /// Bytes of pending data the next unit will cover
    fn next_unit_span(&self, flow: &FlowParams) -> usize {
        let first = self.pending.front().expect("pending non-empty");
        match flow.framing {
            Framing::Psi => first.buf.size(),
            Framing::Pes => {
                if flow.alignment {
                    if flow.min_duration.is_some() {
                        self.pending_bytes
                    } else {
                        // One access unit: up to the next start marker.
                        let mut span = 0;
                        for (i, data) in self.pending.iter().enumerate() {
                            if i > 0 && data.start {
                                break;
                            }
                            span += data.buf.size();
                        }
                        span
                    }
                } else {
                    let hdr = self.estimated_header_size(flow, first);
                    let af_first = if first.random || first.discontinuity {
                        2
                    } else {
                        0
                    };
                    let full = (self.pending_bytes + hdr + af_first) / TS_BODY;
                    if full == 0 {
                        // Only reachable at end of stream.
                        self.pending_bytes
                    } else {
                        (full * TS_BODY - hdr - af_first).min(self.pending_bytes)
                    }
                }
            }
        }
    }

    fn start_unit(&mut self) {
        let (header, pointer_due, span, random, discontinuity) = {
            let flow = self.flow.as_ref().expect("flow set");
            let span = self.next_unit_span(flow);
            let first = self.pending.front().expect("pending non-empty");
            let (header, pointer_due) = match flow.framing {
                Framing::Psi => (BytesMut::new(), true),
                Framing::Pes => {
                    let has_pts =
                        first.pts_prog.is_some() && flow.pes_id != PES_STREAM_ID_PRIVATE_2;
                    let pts = first.pts_prog.filter(|_| has_pts).map(|v| v / 300);
                    let dts = first
                        .dts_prog
                        .filter(|_| has_pts)
                        .filter(|dts| first.pts_prog != Some(*dts))
                        .map(|v| v / 300);
                    (pes_build_header(flow.pes_id, span, true, pts, dts), false)
                }
            };
            (header, pointer_due, span, first.random, first.discontinuity)
        };
        self.cur = Some(CurUnit {
            header,
            payload_left: span,
            pointer_due,
            random,
            discontinuity,
            first_packet_done: false,
        });
    }

    /// Move `count` payload bytes from the pending list into `out`
    fn drain_payload(&mut self, out: &mut Vec<u8>, mut count: usize) {
        while count > 0 {
            let data = self.pending.front_mut().expect("payload accounted for");
            let take = count.min(data.buf.size());
            let start = out.len();
            out.resize(start + take, 0);
            data.buf
                .extract(0, &mut out[start..start + take])
                .expect("in range");
            data.buf.skip(take).expect("in range");
            // The indicator flags belong to the access unit's first byte;
            // a leftover tail starting a later PES must not re-raise them.
            data.random = false;
            data.discontinuity = false;
            self.pending_bytes -= take;
            count -= take;
            if data.buf.is_empty() {
                self.pending_duration = self.pending_duration.saturating_sub(data.duration);
                self.pending.pop_front();
            }
        }
    }

    // -- splice ------------------------------------------------------------

    fn splice_packet(&mut self, ctx: &PipeCtx, mux_sys: u64) -> Result<(BlockBuf, u64)> {
        let status = self.compute_status();
        let pcr_due = self.pcr_interval.is_some() && mux_sys >= self.next_pcr_sys;

        if !status.ready {
            if pcr_due {
                return self.splice_pcr_only(ctx, mux_sys);
            }
            return Err(Error::Unhandled);
        }

        let (flow_pid, flow_framing) = {
            let flow = self.flow.as_ref().ok_or(Error::Invalid)?;
            (flow.pid, flow.framing)
        };
        if self.cur.is_none() {
            self.start_unit();
        }

        let mut pkt = [0u8; TS_SIZE];
        ts_init(&mut pkt);
        ts_set_pid(&mut pkt, flow_pid);
        self.cc = (self.cc + 1) & 0x0F;
        ts_set_cc(&mut pkt, self.cc);

        // Phase 1: plan the packet from the unit in progress.
        let pcr = pcr_due.then(|| self.prog_of(mux_sys));
        let (mut offset, header_chunk, payload_take, unit_done) = {
            let cur = self.cur.as_mut().expect("unit started");
            let first = !cur.first_packet_done;
            if first {
                ts_set_unit_start(&mut pkt);
            }

            let flags_needed = first && (cur.random || cur.discontinuity);
            let pointer = cur.pointer_due && first && flow_framing == Framing::Psi;
            let want = cur.header.len() + cur.payload_left + usize::from(pointer);

            // Adaptation field: indicator flags, PCR, and PES stuffing.
            let mut af_field: Option<usize> = None;
            if flags_needed || pcr_due {
                af_field = Some(1 + if pcr_due { 6 } else { 0 });
            }
            let body = |af: Option<usize>| TS_BODY - af.map_or(0, |f| 1 + f);
            if flow_framing == Framing::Pes && want < body(af_field) {
                let extra = body(af_field) - want;
                af_field = Some(match af_field {
                    // A one-byte shortfall is absorbed by the length byte
                    // alone.
                    None => extra - 1,
                    Some(field) => field + extra,
                });
            }
            if let Some(field) = af_field {
                ts_set_adaptation(&mut pkt, field as u8);
                if flags_needed {
                    if cur.random {
                        tsaf_set_random(&mut pkt);
                    }
                    if cur.discontinuity {
                        tsaf_set_discontinuity(&mut pkt);
                    }
                }
                if let Some(pcr) = pcr {
                    tsaf_set_pcr(&mut pkt, pcr);
                }
                cur.random = false;
                cur.discontinuity = false;
            }

            let mut offset = TS_HEADER_SIZE + af_field.map_or(0, |f| 1 + f);
            if pointer {
                pkt[offset] = 0;
                offset += 1;
                cur.pointer_due = false;
            }
            let header_take = cur.header.len().min(TS_SIZE - offset);
            let header_chunk = cur.header.split_to(header_take);

            let payload_take = cur.payload_left.min(TS_SIZE - offset - header_take);
            cur.payload_left -= payload_take;
            cur.first_packet_done = true;
            let unit_done = cur.payload_left == 0 && cur.header.is_empty();
            (offset, header_chunk, payload_take, unit_done)
        };

        // Phase 2: fill in header remainder and payload bytes.
        pkt[offset..offset + header_chunk.len()].copy_from_slice(&header_chunk);
        offset += header_chunk.len();
        let mut payload = Vec::with_capacity(payload_take);
        self.drain_payload(&mut payload, payload_take);
        pkt[offset..offset + payload_take].copy_from_slice(&payload);
        offset += payload_take;

        // PSI packets stuff the tail with raw 0xFF.
        for byte in &mut pkt[offset..] {
            *byte = 0xFF;
        }

        if unit_done {
            self.cur = None;
        }
        let dts_sys = if pcr_due {
            self.next_pcr_sys = mux_sys + self.pcr_interval.expect("pcr due");
            mux_sys
        } else {
            status.dts_sys
        };
        self.last_mux_sys = Some(mux_sys);

        let mgr = self.ensure_buf_mgr(ctx)?;
        let block = mgr.block_from_slice(&pkt)?;
        let _ = ctx.throw(&mut Event::LastCc(self.cc));
        self.throw_status(ctx);
        Ok((block, dts_sys))
    }

    /// PCR-bearing packet without payload: adaptation field fills the body
    fn splice_pcr_only(&mut self, ctx: &PipeCtx, mux_sys: u64) -> Result<(BlockBuf, u64)> {
        let flow_pid = self.flow.as_ref().ok_or(Error::Invalid)?.pid;
        let mut pkt = [0u8; TS_SIZE];
        ts_init(&mut pkt);
        ts_set_pid(&mut pkt, flow_pid);
        // No payload: the continuity counter must not advance.
        ts_set_cc(&mut pkt, self.cc);
        ts_clear_payload(&mut pkt);
        ts_set_adaptation(&mut pkt, (TS_BODY - 1) as u8);
        tsaf_set_pcr(&mut pkt, self.prog_of(mux_sys));
        debug_assert_eq!(ts_get_adaptation(&pkt) as usize, TS_BODY - 1);

        self.next_pcr_sys = mux_sys + self.pcr_interval.expect("pcr configured");
        self.last_mux_sys = Some(mux_sys);
        let mgr = self.ensure_buf_mgr(ctx)?;
        let block = mgr.block_from_slice(&pkt)?;
        self.throw_status(ctx);
        Ok((block, mux_sys))
    }
}

impl Default for TsEncaps {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipe for TsEncaps {
    fn input(&mut self, ctx: &mut PipeCtx, mut pkt: Packet) {
        if self.flow.is_none() {
            ctx.warn("input before flow definition; dropping");
            return;
        }
        let buf = match pkt.detach_buf() {
            Some(crate::buf::Buf::Block(buf)) => buf,
            _ => {
                ctx.warn("non-block input; dropping");
                return;
            }
        };
        if buf.is_empty() {
            return;
        }
        let cr_sys = pkt.cr_sys();
        let dts_sys = pkt.dts_sys().or(cr_sys);
        let Some(dts_sys) = dts_sys else {
            ctx.warn("undated input; dropping");
            return;
        };
        if let Some(last) = self.last_mux_sys {
            if dts_sys < last {
                self.dropped += 1;
                ctx.verbose(format!("dropping late input {dts_sys} < {last}"));
                return;
            }
        }
        if self.dropped > 0 {
            ctx.warn(format!("{} packets dropped", self.dropped));
            self.dropped = 0;
        }
        if let (Some(prog), Some(sys)) = (pkt.cr_prog(), cr_sys) {
            self.prog_offset = Some(prog as i64 - sys as i64);
        }

        self.pending_bytes += buf.size();
        let duration = pkt.clock.duration.unwrap_or(0);
        self.pending_duration += duration;
        self.pending.push_back(PendingData {
            buf,
            cr_sys: cr_sys.unwrap_or(dts_sys),
            dts_sys,
            pts_prog: pkt.pts_prog(),
            dts_prog: pkt.dts_prog(),
            duration,
            start: pkt.is_start(),
            random: pkt.is_random(),
            discontinuity: pkt.is_discontinuity(),
        });
        self.arm_pcr();
        self.throw_status(ctx);
    }

    fn control(&mut self, ctx: &mut PipeCtx, cmd: Command<'_>) -> Result<()> {
        match cmd {
            Command::SetFlowDef(def) => {
                let flow = Self::parse_flow(&def)?;
                self.flow = Some(flow);
                self.flow_def = Some(def);
                self.throw_status(ctx);
                Ok(())
            }
            Command::GetFlowDef(slot) => {
                *slot = self.flow_def.as_ref().map(Packet::dup);
                Ok(())
            }
            Command::AttachBufMgr(mgr) => {
                *self.buf_mgr.borrow_mut() = Some(mgr);
                Ok(())
            }
            Command::Extension(ext) => {
                if let Some(cmd) = ext.downcast_mut::<TsSplice>() {
                    let (packet, dts_sys) = self.splice_packet(ctx, cmd.mux_sys)?;
                    cmd.packet = Some(packet);
                    cmd.dts_sys = dts_sys;
                    return Ok(());
                }
                if let Some(TsSetCc(cc)) = ext.downcast_mut::<TsSetCc>() {
                    self.cc = *cc & 0x0F;
                    let _ = ctx.throw(&mut Event::LastCc(self.cc));
                    return Ok(());
                }
                if let Some(get) = ext.downcast_mut::<TsGetCc>() {
                    get.0 = Some(self.cc);
                    return Ok(());
                }
                if let Some(TsSetPcrInterval(interval)) = ext.downcast_mut::<TsSetPcrInterval>()
                {
                    self.pcr_interval = Some(*interval);
                    self.arm_pcr();
                    self.throw_status(ctx);
                    return Ok(());
                }
                if ext.downcast_mut::<TsEos>().is_some() {
                    self.eos = true;
                    self.throw_status(ctx);
                    return Ok(());
                }
                Err(Error::Unhandled)
            }
            _ => Err(Error::Unhandled),
        }
    }
}
