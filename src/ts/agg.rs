//! TS Aggregator
//!
//! Packs 188-byte transport packets into MTU-sized aggregates and shapes
//! the output rate:
//!
//! - **VBR**: a block leaves when it is full;
//! - **CBR**: exactly one block per `mtu x FREQ / octetrate` interval,
//!   padded with null packets when short;
//! - **capped VBR**: like CBR, but the emission deadline may shift
//!   forward over idle gaps instead of padding them.
//!
//! Any PCR in an outgoing aggregate is rewritten against the block's
//! final emission date, absorbing the jitter the aggregation introduced.

use std::cell::RefCell;
use std::rc::Rc;

use crate::buf::{BlockBuf, Buf, BufMgr};
use crate::clock::FREQ;
use crate::error::{Error, Result};
use crate::flow::{FLOW_MPEGTS, FLOW_MPEGTS_ALIGNED};
use crate::packet::{DateAxis, Packet, PacketMgr};
use crate::pipe::{Command, Pipe, PipeCtx, PipeHandle, OutputHelper, Request, RequestKind, Response};
use crate::probe::{Event, ProbeChain};

use super::bits::{ts_pad, tsaf_get_pcr, tsaf_has_pcr, tsaf_set_pcr, TS_HEADER_SIZE_PCR, TS_SIZE};

/// Default MTU: seven packets, the classic UDP datagram fill
pub const DEFAULT_MTU: usize = 7 * TS_SIZE;

/// Output rate shaping mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxMode {
    /// Emit when full
    Vbr,
    /// Emit on a strict interval, padding underflows
    Cbr,
    /// Emit on the interval grid but skip idle intervals
    Capped,
}

/// Set the shaping mode
pub struct AggSetMode(pub MuxMode);

/// Set the output octet rate (mandatory outside VBR)
pub struct AggSetOctetrate(pub u64);

/// Set the MTU; rounded down to a packet multiple
pub struct AggSetMtu(pub usize);

/// Force the pending aggregate out (end of stream, idle CBR tick)
pub struct AggComplete;

/// Read back the current interval between aggregates
pub struct AggGetInterval(pub Option<u64>);

/// TS packet aggregator pipe
pub struct TsAgg {
    mode: MuxMode,
    octetrate: u64,
    interval: u64,
    mtu: usize,
    input_latency: u64,
    packet_mgr: Rc<RefCell<Option<PacketMgr>>>,
    buf_mgr: Rc<RefCell<Option<BufMgr>>>,
    padding: Option<BlockBuf>,
    dropped: u64,
    next_cr_sys: u64,
    next_cr_remainder: u64,
    held: Vec<Packet>,
    held_size: usize,
    held_dts: u64,
    output: OutputHelper,
}

impl TsAgg {
    /// New aggregator in VBR mode with the default MTU
    pub fn new() -> Self {
        Self {
            mode: MuxMode::Vbr,
            octetrate: 0,
            interval: 0,
            mtu: DEFAULT_MTU,
            input_latency: 0,
            packet_mgr: Rc::new(RefCell::new(None)),
            buf_mgr: Rc::new(RefCell::new(None)),
            padding: None,
            dropped: 0,
            next_cr_sys: u64::MAX,
            next_cr_remainder: 0,
            held: Vec::new(),
            held_size: 0,
            held_dts: u64::MAX,
            output: OutputHelper::new(),
        }
    }

    /// Mount with a probe chain
    pub fn mount(probe: ProbeChain) -> PipeHandle {
        PipeHandle::mount(Self::new(), probe)
    }

    fn ensure_buf_mgr(&mut self, ctx: &PipeCtx) -> Result<BufMgr> {
        if let Some(mgr) = self.buf_mgr.borrow().as_ref() {
            return Ok(mgr.clone());
        }
        let slot = Rc::clone(&self.buf_mgr);
        let mut template = Packet::new();
        template.attrs.set_string("f.def", FLOW_MPEGTS_ALIGNED)?;
        let request = Request::new(RequestKind::BufMgr, template, move |resp| {
            if let Response::BufMgr(mgr) = resp {
                *slot.borrow_mut() = Some(mgr);
            }
        });
        let _ = ctx.throw(&mut Event::ProvideRequest(&request));
        self.buf_mgr.borrow().clone().ok_or(Error::Alloc)
    }

    fn ensure_packet_mgr(&mut self, ctx: &PipeCtx) -> Result<PacketMgr> {
        if let Some(mgr) = self.packet_mgr.borrow().as_ref() {
            return Ok(mgr.clone());
        }
        let slot = Rc::clone(&self.packet_mgr);
        let request = Request::new(RequestKind::PacketMgr, Packet::new(), move |resp| {
            if let Response::PacketMgr(mgr) = resp {
                *slot.borrow_mut() = Some(mgr);
            }
        });
        let _ = ctx.throw(&mut Event::ProvideRequest(&request));
        self.packet_mgr.borrow().clone().ok_or(Error::Alloc)
    }

    fn padding(&mut self, ctx: &PipeCtx) -> Result<BlockBuf> {
        if self.padding.is_none() {
            let mgr = self.ensure_buf_mgr(ctx)?;
            let mut pkt = [0u8; TS_SIZE];
            ts_pad(&mut pkt);
            self.padding = Some(mgr.block_from_slice(&pkt)?);
        }
        Ok(self.padding.as_ref().expect("just built").dup())
    }

    /// In capped mode, move the emission grid forward over an idle gap if
    /// the pending data still makes its deadline
    fn try_shift(&mut self, cr_sys: u64) -> bool {
        let mut next_cr_sys = self.next_cr_sys;
        let mut next_cr_remainder = self.next_cr_remainder;
        while cr_sys > next_cr_sys + self.interval {
            let ticks = self.mtu as u64 * FREQ + next_cr_remainder;
            next_cr_sys += ticks / self.octetrate;
            next_cr_remainder = ticks % self.octetrate;
        }
        if next_cr_sys > self.held_dts {
            return false;
        }
        self.next_cr_sys = next_cr_sys;
        self.next_cr_remainder = next_cr_remainder;
        true
    }

    /// Rewrite a held packet's PCR against the aggregate's emission date
    fn fix_pcr(&self, ctx: &PipeCtx, pkt: &mut Packet, emit_cr_sys: u64) {
        let Some(orig_cr_sys) = pkt.cr_sys() else {
            ctx.warn("couldn't fix PCR: undated packet");
            return;
        };
        let Some(Buf::Block(buf)) = pkt.buf.as_mut() else {
            return;
        };
        let mut header = [0u8; TS_HEADER_SIZE_PCR];
        if buf.extract(0, &mut header).is_err() {
            ctx.warn("couldn't read TS header from aggregate");
            return;
        }
        if !tsaf_has_pcr(&header) {
            return;
        }
        let pcr = tsaf_get_pcr(&header)
            .wrapping_add(emit_cr_sys.wrapping_sub(orig_cr_sys));
        tsaf_set_pcr(&mut header, pcr);
        let mut size = TS_HEADER_SIZE_PCR;
        match buf.write(0, &mut size) {
            Ok(slice) if size == TS_HEADER_SIZE_PCR => slice.copy_from_slice(&header),
            _ => ctx.warn("couldn't fix PCR: header not writable"),
        }
    }

    /// Emit one aggregate, padding to the MTU outside VBR
    fn complete(&mut self, ctx: &PipeCtx) {
        let emit_cr_sys = self.next_cr_sys;

        if self.mode != MuxMode::Vbr && self.next_cr_sys != u64::MAX {
            let ticks = self.mtu as u64 * FREQ + self.next_cr_remainder;
            self.next_cr_sys += ticks / self.octetrate;
            self.next_cr_remainder = ticks % self.octetrate;
        } else if self.mode == MuxMode::Vbr {
            self.next_cr_sys = u64::MAX;
        }

        let mut held = std::mem::take(&mut self.held);
        let held_size = self.held_size;
        self.held_size = 0;
        self.held_dts = u64::MAX;

        for pkt in &mut held {
            self.fix_pcr(ctx, pkt, emit_cr_sys);
        }

        let mut base = match held.is_empty() {
            false => held.remove(0),
            true => {
                if self.mode != MuxMode::Cbr {
                    return;
                }
                let Ok(mgr) = self.ensure_packet_mgr(ctx) else {
                    ctx.throw_fatal(Error::Alloc);
                    return;
                };
                let mut pkt = mgr.alloc();
                pkt.buf = Some(Buf::Block(BlockBuf::default()));
                pkt
            }
        };
        if emit_cr_sys != u64::MAX {
            base.set_cr_sys(emit_cr_sys);
        }
        // The aggregate is paced against the system clock only.
        base.clock.delete_date(DateAxis::Prog);

        for pkt in held {
            let mut pkt = pkt;
            match pkt.detach_buf() {
                Some(Buf::Block(block)) => {
                    if let Some(Buf::Block(buf)) = base.buf.as_mut() {
                        buf.append(block);
                    }
                }
                _ => ctx.warn("error appending packet"),
            }
        }

        if self.mode != MuxMode::Vbr {
            let mut padding = 0;
            let mut size = held_size;
            while size + TS_SIZE <= self.mtu {
                match self.padding(ctx) {
                    Ok(pad) => {
                        if let Some(Buf::Block(buf)) = base.buf.as_mut() {
                            buf.append(pad);
                        }
                        size += TS_SIZE;
                        padding += 1;
                    }
                    Err(err) => {
                        ctx.throw_fatal(err);
                        return;
                    }
                }
            }
            if padding > 0 {
                ctx.verbose(format!("inserting {padding} padding at {emit_cr_sys}"));
            }
        }

        self.output.output_packet(ctx, base);
    }
}

impl Default for TsAgg {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipe for TsAgg {
    fn input(&mut self, ctx: &mut PipeCtx, pkt: Packet) {
        if self.output.flow_def().is_none() {
            ctx.warn("input before flow definition; dropping");
            return;
        }
        if self.mode != MuxMode::Vbr && self.octetrate == 0 {
            ctx.warn("invalid mux octetrate");
            ctx.throw_error(Error::Invalid);
            return;
        }

        let size = pkt
            .buf
            .as_ref()
            .and_then(|b| b.as_block().ok())
            .map_or(0, BlockBuf::size);
        if size != TS_SIZE {
            ctx.warn(format!(
                "received packet of invalid size: {size} (mtu == {})",
                self.mtu
            ));
            return;
        }

        let dts_sys = pkt.dts_sys();
        if dts_sys.is_none() && self.mode != MuxMode::Vbr {
            ctx.warn("non-dated packet received");
            return;
        }
        let dts_sys = dts_sys.unwrap_or(u64::MAX);
        let delay = pkt.clock.cr_dts_delay.unwrap_or(0);

        if self.next_cr_sys == u64::MAX && dts_sys != u64::MAX {
            self.next_cr_sys = dts_sys - delay;
        }

        // Packet in the past.
        if self.mode != MuxMode::Vbr && self.next_cr_sys > dts_sys + self.interval {
            ctx.verbose(format!(
                "dropping late packet {} > {}",
                self.next_cr_sys,
                dts_sys + self.interval
            ));
            self.dropped += 1;
            return;
        }
        if self.dropped > 0 {
            ctx.warn(format!("{} packets dropped", self.dropped));
            self.dropped = 0;
        }

        // Packet in the future that would leave too early in this
        // aggregate.
        if self.mode != MuxMode::Vbr
            && dts_sys.saturating_sub(delay) > self.next_cr_sys + self.interval
            && (self.mode != MuxMode::Capped || !self.try_shift(dts_sys - delay))
        {
            self.complete(ctx);
        }

        if dts_sys < self.held_dts {
            self.held_dts = dts_sys;
        }
        self.held_size += size;
        self.held.push(pkt);

        if self.held_size + TS_SIZE > self.mtu {
            self.complete(ctx);
        }
    }

    fn control(&mut self, ctx: &mut PipeCtx, cmd: Command<'_>) -> Result<()> {
        match cmd {
            Command::SetFlowDef(def) => {
                if !def.flow_def_matches(FLOW_MPEGTS) {
                    return Err(Error::Invalid);
                }
                self.input_latency = def.latency();
                let mut out_def = def.dup();
                out_def.attrs.set_string("f.def", FLOW_MPEGTS_ALIGNED)?;
                out_def.set_latency(self.input_latency + self.interval)?;
                out_def.set_octetrate(self.octetrate)?;
                self.output.store_flow_def(out_def);
                Ok(())
            }
            Command::GetFlowDef(slot) => {
                *slot = self.output.flow_def().map(Packet::dup);
                Ok(())
            }
            Command::SetOutput(output) => {
                self.output.set_output(ctx, output);
                Ok(())
            }
            Command::GetOutput(slot) => {
                *slot = self.output.output().cloned();
                Ok(())
            }
            Command::RegisterRequest(request) => {
                self.output.register_request(ctx, request);
                Ok(())
            }
            Command::UnregisterRequest(id) => {
                self.output.unregister_request(ctx, id);
                Ok(())
            }
            Command::AttachPacketMgr(mgr) => {
                *self.packet_mgr.borrow_mut() = Some(mgr);
                Ok(())
            }
            Command::AttachBufMgr(mgr) => {
                *self.buf_mgr.borrow_mut() = Some(mgr);
                Ok(())
            }
            Command::Extension(ext) => {
                if let Some(AggSetMode(mode)) = ext.downcast_mut::<AggSetMode>() {
                    self.mode = *mode;
                    return Ok(());
                }
                if let Some(AggSetOctetrate(rate)) = ext.downcast_mut::<AggSetOctetrate>() {
                    if *rate == 0 {
                        return Err(Error::Invalid);
                    }
                    if self.octetrate != *rate {
                        self.next_cr_remainder = 0;
                    }
                    self.octetrate = *rate;
                    self.interval = self.mtu as u64 * FREQ / self.octetrate;
                    ctx.notice(format!(
                        "now operating in {:?} mode at {} bits/s",
                        self.mode,
                        self.octetrate * 8
                    ));
                    if let Some(def) = self.output.flow_def() {
                        let mut def = def.dup();
                        def.set_latency(self.input_latency + self.interval)?;
                        def.set_octetrate(self.octetrate)?;
                        self.output.store_flow_def(def);
                    }
                    return Ok(());
                }
                if let Some(AggSetMtu(mtu)) = ext.downcast_mut::<AggSetMtu>() {
                    if *mtu < TS_SIZE {
                        return Err(Error::Invalid);
                    }
                    let mtu = *mtu - *mtu % TS_SIZE;
                    if mtu < self.held_size + TS_SIZE {
                        self.complete(ctx);
                    }
                    self.mtu = mtu;
                    if self.octetrate > 0 {
                        self.interval = self.mtu as u64 * FREQ / self.octetrate;
                    }
                    return Ok(());
                }
                if ext.downcast_mut::<AggComplete>().is_some() {
                    if !self.held.is_empty() || self.mode == MuxMode::Cbr {
                        self.complete(ctx);
                    }
                    return Ok(());
                }
                if let Some(get) = ext.downcast_mut::<AggGetInterval>() {
                    get.0 = (self.interval > 0).then_some(self.interval);
                    return Ok(());
                }
                Err(Error::Unhandled)
            }
            _ => Err(Error::Unhandled),
        }
    }
}
