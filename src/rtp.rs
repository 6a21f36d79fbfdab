//! RTP Decapsulation
//!
//! Strips RFC 3550 fixed headers and hands the payload to a
//! per-payload-type handler: transport streams, raw PCM and Opus pass
//! through, MPEG audio/video lose their RFC 2250 prefix, H.264 follows
//! RFC 6184 (single NAL, STAP-A aggregation, FU-A fragmentation), and
//! AAC follows the RFC 3640 AU-headers-length mode.
//!
//! Sequence numbers are tracked per flow; gaps are counted and logged,
//! and a gap inside an H.264 fragmented NAL drops the whole NAL.

use std::cell::RefCell;
use std::rc::Rc;

use crate::buf::{BlockBuf, Buf, BufMgr};
use crate::clock::FREQ;
use crate::error::{Error, Result};
use crate::flow::FLOW_RTP;
use crate::packet::{Packet, PacketMgr};
use crate::pipe::{
    Command, OutputHelper, Pipe, PipeCtx, PipeHandle, Request, RequestKind, Response,
};
use crate::probe::{Event, ProbeChain};

/// Fixed RTP header size before CSRC entries
pub const RTP_HEADER_SIZE: usize = 12;

/// Default RTP clock rate (video, transport streams)
const DEFAULT_CLOCKRATE: u64 = 90_000;

/// Payload interpretations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Payload {
    /// Opaque passthrough
    Raw,
    /// MPEG-TS packets
    Ts,
    /// MPEG audio with RFC 2250 prefix
    Mpa,
    /// MPEG video with RFC 2250 prefix
    Mpv,
    /// H.264 per RFC 6184
    H264,
    /// AAC per RFC 3640
    Aac,
}

/// A parsed RTP header
struct RtpHeader {
    marker: bool,
    seq: u16,
    timestamp: u32,
    /// Offset of the payload within the datagram
    payload_offset: usize,
    /// Bytes of padding at the tail
    padding: usize,
}

/// Parse the fixed header from a datagram prefix
///
/// `total` is the datagram length and `last` its final byte (the padding
/// count lives there when the padding bit is set).
fn parse_header(data: &[u8], total: usize, last: u8) -> Result<RtpHeader> {
    if data.len() < RTP_HEADER_SIZE || data[0] >> 6 != 2 {
        return Err(Error::Invalid);
    }
    let csrc = usize::from(data[0] & 0x0F);
    let has_extension = data[0] & 0x10 != 0;
    let has_padding = data[0] & 0x20 != 0;
    let mut offset = RTP_HEADER_SIZE + csrc * 4;
    if has_extension {
        if data.len() < offset + 4 {
            return Err(Error::Invalid);
        }
        let words = usize::from(u16::from_be_bytes([data[offset + 2], data[offset + 3]]));
        offset += 4 + words * 4;
    }
    let padding = if has_padding { usize::from(last) } else { 0 };
    if offset + padding > total {
        return Err(Error::Invalid);
    }
    Ok(RtpHeader {
        marker: data[1] & 0x80 != 0,
        seq: u16::from_be_bytes([data[2], data[3]]),
        timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        payload_offset: offset,
        padding,
    })
}

/// A fragmented H.264 NAL being reassembled
struct FuState {
    nal: BlockBuf,
    next_seq: u16,
}

/// RTP decapsulation pipe
pub struct RtpDecaps {
    payload: Payload,
    clockrate: u64,
    output: OutputHelper,
    out_def_set: bool,
    buf_mgr: Rc<RefCell<Option<BufMgr>>>,
    packet_mgr: Rc<RefCell<Option<PacketMgr>>>,
    expected_seq: Option<u16>,
    lost: u64,
    fu: Option<FuState>,
}

impl RtpDecaps {
    /// New decapsulator; the payload type comes from the flow definition
    pub fn new() -> Self {
        Self {
            payload: Payload::Raw,
            clockrate: DEFAULT_CLOCKRATE,
            output: OutputHelper::new(),
            out_def_set: false,
            buf_mgr: Rc::new(RefCell::new(None)),
            packet_mgr: Rc::new(RefCell::new(None)),
            expected_seq: None,
            lost: 0,
            fu: None,
        }
    }

    /// Mount with a probe chain
    pub fn mount(probe: ProbeChain) -> PipeHandle {
        PipeHandle::mount(Self::new(), probe)
    }

    /// Packets lost so far according to sequence numbers
    pub fn lost(&self) -> u64 {
        self.lost
    }

    fn payload_of(def: &Packet) -> (Payload, &'static str) {
        let def = def.flow_def().unwrap_or_default();
        let suffix = def.strip_prefix(FLOW_RTP).unwrap_or("");
        match suffix {
            s if s.starts_with("mpegts.") => (Payload::Ts, "block.mpegts."),
            s if s.starts_with("mpa.") => (Payload::Mpa, "block.mp2.sound."),
            s if s.starts_with("mpv.") => (Payload::Mpv, "block.mpeg2video.pic."),
            s if s.starts_with("h264.") => (Payload::H264, "block.h264.pic."),
            s if s.starts_with("aac.") => (Payload::Aac, "block.aac.sound."),
            s if s.starts_with("opus.") => (Payload::Raw, "block.opus.sound."),
            s if s.starts_with("pcm.") => (Payload::Raw, "block.sound."),
            _ => (Payload::Raw, "block."),
        }
    }

    fn ensure_buf_mgr(&mut self, ctx: &PipeCtx) -> Result<BufMgr> {
        if let Some(mgr) = self.buf_mgr.borrow().as_ref() {
            return Ok(mgr.clone());
        }
        let slot = Rc::clone(&self.buf_mgr);
        let mut template = Packet::new();
        template.attrs.set_string("f.def", "block.")?;
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

    /// 27 MHz program time of an RTP timestamp
    fn prog_of(&self, timestamp: u32) -> u64 {
        u64::from(timestamp) * FREQ / self.clockrate
    }

    fn emit(&mut self, ctx: &PipeCtx, buf: BlockBuf, header: &RtpHeader, start: bool) {
        let Ok(mgr) = self.ensure_packet_mgr(ctx) else {
            ctx.throw_fatal(Error::Alloc);
            return;
        };
        let mut pkt = mgr.alloc();
        pkt.attach_buf(Buf::Block(buf));
        pkt.set_pts_prog(self.prog_of(header.timestamp));
        if start {
            let _ = pkt.set_start();
        }
        if header.marker {
            let _ = pkt.set_end();
        }
        // System dates are derived upstream (dejitter probe) if needed.
        let _ = ctx.throw(&mut Event::ClockTs(&mut pkt));
        self.output.output_packet(ctx, pkt);
    }

    /// NAL with an Annex B start code in front, sharing payload bytes
    fn nal_with_startcode(&mut self, ctx: &PipeCtx, nal: BlockBuf) -> Result<BlockBuf> {
        let mgr = self.ensure_buf_mgr(ctx)?;
        let mut out = mgr.block_from_slice(&[0, 0, 0, 1])?;
        out.append(nal);
        Ok(out)
    }

    fn handle_h264(&mut self, ctx: &PipeCtx, header: &RtpHeader, payload: BlockBuf) {
        let mut first = [0u8; 2];
        if payload.extract(0, &mut first).is_err() {
            ctx.warn("truncated H.264 payload");
            return;
        }
        match first[0] & 0x1F {
            1..=23 => match self.nal_with_startcode(ctx, payload) {
                Ok(nal) => self.emit(ctx, nal, header, true),
                Err(err) => ctx.throw_fatal(err),
            },
            // STAP-A: 2-byte size prefixed NALs.
            24 => {
                let mut offset = 1;
                while offset + 2 <= payload.size() {
                    let mut size = [0u8; 2];
                    if payload.extract(offset, &mut size).is_err() {
                        break;
                    }
                    let size = usize::from(u16::from_be_bytes(size));
                    offset += 2;
                    let Ok(nal) = payload.splice(offset, size) else {
                        ctx.warn("truncated STAP-A aggregate");
                        break;
                    };
                    offset += size;
                    match self.nal_with_startcode(ctx, nal) {
                        Ok(nal) => self.emit(ctx, nal, header, true),
                        Err(err) => {
                            ctx.throw_fatal(err);
                            return;
                        }
                    }
                }
            }
            // FU-A fragments.
            28 => {
                let fu_start = first[1] & 0x80 != 0;
                let fu_end = first[1] & 0x40 != 0;
                let Ok(frag) = payload.splice(2, payload.size() - 2) else {
                    ctx.warn("truncated FU-A fragment");
                    return;
                };
                if fu_start {
                    if self.fu.take().is_some() {
                        ctx.warn("dropping incomplete fragmented NAL");
                    }
                    let nal_header = (first[0] & 0xE0) | (first[1] & 0x1F);
                    let Ok(mgr) = self.ensure_buf_mgr(ctx) else {
                        ctx.throw_fatal(Error::Alloc);
                        return;
                    };
                    let Ok(mut nal) = mgr.block_from_slice(&[0, 0, 0, 1, nal_header]) else {
                        ctx.throw_fatal(Error::Alloc);
                        return;
                    };
                    nal.append(frag);
                    self.fu = Some(FuState {
                        nal,
                        next_seq: header.seq.wrapping_add(1),
                    });
                    return;
                }
                let Some(mut fu) = self.fu.take() else {
                    ctx.warn("FU-A continuation without a start; dropping");
                    return;
                };
                if fu.next_seq != header.seq {
                    ctx.warn("lost fragment inside a NAL; dropping it entirely");
                    return;
                }
                fu.nal.append(frag);
                fu.next_seq = header.seq.wrapping_add(1);
                if fu_end {
                    let nal = fu.nal;
                    self.emit(ctx, nal, header, true);
                } else {
                    self.fu = Some(fu);
                }
            }
            other => {
                ctx.warn(format!("unsupported H.264 NAL unit type {other}"));
            }
        }
    }

    fn handle_aac(&mut self, ctx: &PipeCtx, header: &RtpHeader, payload: BlockBuf) {
        // RFC 3640 AAC-hbr: 13-bit AU sizes, 3-bit AU indices.
        let mut len = [0u8; 2];
        if payload.extract(0, &mut len).is_err() {
            ctx.warn("truncated AU headers");
            return;
        }
        let headers_bits = usize::from(u16::from_be_bytes(len));
        let headers_len = headers_bits.div_ceil(8);
        let au_count = headers_bits / 16;
        let mut data_offset = 2 + headers_len;
        for i in 0..au_count {
            let mut au_header = [0u8; 2];
            if payload.extract(2 + i * 2, &mut au_header).is_err() {
                ctx.warn("truncated AU header");
                return;
            }
            let size = usize::from(u16::from_be_bytes(au_header)) >> 3;
            match payload.splice(data_offset, size) {
                Ok(au) => self.emit(ctx, au, header, true),
                Err(_) => {
                    ctx.warn("truncated access unit");
                    return;
                }
            }
            data_offset += size;
        }
    }

    fn track_seq(&mut self, ctx: &PipeCtx, seq: u16) {
        if let Some(expected) = self.expected_seq {
            if expected != seq {
                let gap = seq.wrapping_sub(expected);
                self.lost += u64::from(gap);
                ctx.warn(format!(
                    "{} packets lost before sequence {seq} ({} total)",
                    gap, self.lost
                ));
            }
        }
        self.expected_seq = Some(seq.wrapping_add(1));
    }
}

impl Default for RtpDecaps {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipe for RtpDecaps {
    fn input(&mut self, ctx: &mut PipeCtx, mut pkt: Packet) {
        if !self.out_def_set {
            ctx.warn("input before flow definition; dropping");
            return;
        }
        let buf = match pkt.detach_buf() {
            Some(Buf::Block(buf)) => buf,
            _ => {
                ctx.warn("non-block input; dropping");
                return;
            }
        };
        // Peek enough for header extensions in one go.
        let header = {
            let mut last = [0u8; 1];
            let mut scratch = vec![0u8; buf.size().min(64)];
            let parsed = buf
                .extract(buf.size().saturating_sub(1), &mut last)
                .and_then(|()| buf.peek(0, &mut scratch).map(|bytes| bytes.to_vec()))
                .and_then(|bytes| parse_header(&bytes, buf.size(), last[0]));
            match parsed {
                Ok(header) => header,
                Err(_) => {
                    ctx.warn("invalid RTP datagram; dropping");
                    return;
                }
            }
        };
        let payload_len = buf
            .size()
            .saturating_sub(header.payload_offset + header.padding);
        if payload_len == 0 {
            return;
        }
        let Ok(payload) = buf.splice(header.payload_offset, payload_len) else {
            ctx.warn("invalid payload bounds; dropping");
            return;
        };

        self.track_seq(ctx, header.seq);

        match self.payload {
            Payload::Raw | Payload::Ts => self.emit(ctx, payload, &header, true),
            Payload::Mpa | Payload::Mpv => {
                // RFC 2250 carries a 4-byte prefix before the ES bytes.
                if payload_len <= 4 {
                    return;
                }
                match payload.splice(4, payload_len - 4) {
                    Ok(es) => self.emit(ctx, es, &header, true),
                    Err(_) => ctx.warn("truncated MPEG payload"),
                }
            }
            Payload::H264 => self.handle_h264(ctx, &header, payload),
            Payload::Aac => self.handle_aac(ctx, &header, payload),
        }
    }

    fn control(&mut self, ctx: &mut PipeCtx, cmd: Command<'_>) -> Result<()> {
        match cmd {
            Command::SetFlowDef(def) => {
                if !def.flow_def_matches(FLOW_RTP) {
                    return Err(Error::Invalid);
                }
                let (payload, out_def) = Self::payload_of(&def);
                self.payload = payload;
                self.clockrate = def
                    .attrs
                    .unsigned("s.rate")
                    .ok()
                    .flatten()
                    .unwrap_or(DEFAULT_CLOCKRATE);
                let mut out = def.dup();
                out.attrs.set_string("f.def", out_def)?;
                self.output.store_flow_def(out);
                self.out_def_set = true;
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
            Command::AttachBufMgr(mgr) => {
                *self.buf_mgr.borrow_mut() = Some(mgr);
                Ok(())
            }
            Command::AttachPacketMgr(mgr) => {
                *self.packet_mgr.borrow_mut() = Some(mgr);
                Ok(())
            }
            _ => Err(Error::Unhandled),
        }
    }
}
