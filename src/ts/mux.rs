//! TS Mux
//!
//! Super-pipe assembling one program into a transport stream. Each input
//! sub-pipe owns an encapsulator; the mux consults the timing every
//! encapsulator reports, pulls the packet with the most urgent deadline,
//! and feeds the aggregator that shapes the final output. PAT and PMT are
//! regenerated whenever the input set changes and repeated on their own
//! interval through two internal PSI encapsulators, scheduled like any
//! other PID but with the highest priority.
//!
//! # Scheduling
//!
//! Without a clock the mux runs in *pull* mode: packets are emitted as
//! soon as every attached input either has data ready or has reached end
//! of stream, in `dts_sys` order (ties broken PSI > PCR > audio >
//! video). With a clock and an event loop attached, a periodic pump runs
//! the same election against the wall clock instead.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::buf::Buf;
use crate::clock::{Clock, FREQ};
use crate::error::{Error, Result};
use crate::evloop::{EvLoop, Pump};
use crate::flow::{FLOW_BLOCK, FLOW_MPEGTS, FLOW_MPEGTS_PSI};
use crate::packet::{Packet, PacketMgr};
use crate::pipe::{
    Command, Pipe, PipeCtx, PipeHandle, Request, RequestKind, Response, SubList,
};
use crate::probe::{EncapsStatus, Event, Probe, ProbeChain, ProbeVerdict};

use super::agg::{AggComplete, AggSetMode, AggSetMtu, AggSetOctetrate, MuxMode, TsAgg};
use super::bits::{pat_build, pmt_build, PmtEs, PES_STREAM_ID_AUDIO_MPEG, PID_PAT};
use super::encaps::{self, TsEncaps};

/// Default PAT/PMT repetition interval (200 ms)
pub const DEFAULT_PSI_INTERVAL: u64 = FREQ / 5;

/// Default PCR insertion interval (70 ms; DVB requires at most 100 ms)
pub const DEFAULT_PCR_INTERVAL: u64 = FREQ * 7 / 100;

/// Default PMT PID
pub const DEFAULT_PMT_PID: u16 = 0x1000;

/// Octet rate reserved for the PSI PIDs
const PSI_OCTETRATE: u64 = 10_000;

// ---------------------------------------------------------------------------
// Extension commands
// ---------------------------------------------------------------------------

/// Set the total output octet rate
pub struct MuxSetOctetrate(pub u64);

/// Set the shaping mode of the aggregator
pub struct MuxSetMode(pub MuxMode);

/// Set the output MTU
pub struct MuxSetMtu(pub usize);

/// Set the PCR insertion interval
pub struct MuxSetPcrInterval(pub u64);

/// Set the PAT/PMT repetition interval
pub struct MuxSetPsiInterval(pub u64);

/// Flush: end every input's stream, drain, and complete the aggregator
pub struct MuxFlush;

/// Input priority for deadline ties; lower wins
fn priority_of(pes_id: u8, pcr: bool) -> u8 {
    if pcr {
        1
    } else if (PES_STREAM_ID_AUDIO_MPEG..0xE0).contains(&pes_id) {
        2
    } else {
        3
    }
}

/// Records the latest status an encapsulator reported
struct StatusProbe {
    slot: Rc<RefCell<EncapsStatus>>,
}

impl Probe for StatusProbe {
    fn catch(&self, event: &mut Event<'_>) -> Result<ProbeVerdict> {
        match event {
            Event::TsStatus(status) => {
                *self.slot.borrow_mut() = *status;
                Ok(ProbeVerdict::Handled)
            }
            Event::LastCc(_) => Ok(ProbeVerdict::Handled),
            _ => Ok(ProbeVerdict::Pass),
        }
    }
}

fn idle_status() -> EncapsStatus {
    EncapsStatus {
        cr_sys: u64::MAX,
        dts_sys: u64::MAX,
        pcr_sys: u64::MAX,
        ready: false,
    }
}

struct MuxInput {
    encaps: PipeHandle,
    status: Rc<RefCell<EncapsStatus>>,
    pid: u16,
    stream_type: u8,
    priority: u8,
    eos: bool,
}

struct PsiPid {
    encaps: PipeHandle,
    status: Rc<RefCell<EncapsStatus>>,
}

struct MuxCore {
    agg: PipeHandle,
    pat: PsiPid,
    pmt: PsiPid,
    inputs: Vec<Rc<RefCell<MuxInput>>>,
    packet_mgr: Rc<RefCell<Option<PacketMgr>>>,
    section_bufs: crate::buf::BufMgr,
    pcr_interval: u64,
    psi_interval: u64,
    pmt_pid: u16,
    tsid: u16,
    program: u16,
    psi_version: u8,
    psi_dirty: bool,
    next_psi_sys: u64,
    last_mux_sys: u64,
    live: Option<Arc<dyn Clock>>,
    timer: Option<Pump>,
}

impl MuxCore {
    fn psi_pid(probe: &ProbeChain) -> PsiPid {
        let status = Rc::new(RefCell::new(idle_status()));
        let encaps_probe = probe.clone().push(StatusProbe {
            slot: Rc::clone(&status),
        });
        PsiPid {
            encaps: TsEncaps::mount(encaps_probe),
            status,
        }
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

    /// Declare flow definitions on the internal pipes: PSI flows on the
    /// PAT/PMT encapsulators, the TS flow on the aggregator
    fn setup_psi_flows(&mut self, ctx: &PipeCtx) -> Result<()> {
        let mgr = self.ensure_packet_mgr(ctx)?;
        for (pid, psi) in [(PID_PAT, &self.pat), (self.pmt_pid, &self.pmt)] {
            let mut def = crate::flow::alloc_def(&mgr, FLOW_MPEGTS_PSI)?;
            def.set_octetrate(PSI_OCTETRATE)?;
            def.set_ts_pid(pid)?;
            psi.encaps.set_flow_def(def)?;
        }
        self.agg
            .set_flow_def(crate::flow::alloc_def(&mgr, FLOW_MPEGTS)?)?;
        Ok(())
    }

    /// Regenerate PAT/PMT sections and feed them at `cr_sys`
    fn feed_psi(&mut self, ctx: &PipeCtx, cr_sys: u64) -> Result<()> {
        let mgr = self.ensure_packet_mgr(ctx)?;
        if self.psi_dirty {
            self.psi_version = (self.psi_version + 1) & 0x1F;
            self.psi_dirty = false;
        }

        let pat = pat_build(self.tsid, self.psi_version, &[(self.program, self.pmt_pid)]);
        let pcr_pid = self
            .inputs
            .iter()
            .find(|i| i.borrow().priority == 1)
            .map(|i| i.borrow().pid)
            .unwrap_or(0x1FFF);
        let es: Vec<PmtEs> = self
            .inputs
            .iter()
            .map(|input| {
                let input = input.borrow();
                PmtEs {
                    stream_type: input.stream_type,
                    pid: input.pid,
                }
            })
            .collect();
        let pmt = pmt_build(self.program, self.psi_version, pcr_pid, &es);

        for (section, psi) in [(pat, &self.pat), (pmt, &self.pmt)] {
            let mut pkt = mgr.alloc();
            pkt.attach_buf(Buf::Block(self.section_bufs.block_from_slice(&section)?));
            pkt.set_cr_sys(cr_sys);
            pkt.clock.cr_dts_delay = Some(0);
            psi.encaps.input(pkt);
        }
        Ok(())
    }

    /// Whether every data input can be scheduled against
    fn inputs_settled(&self) -> bool {
        self.inputs.iter().all(|input| {
            let input = input.borrow();
            input.eos || input.status.borrow().ready
        })
    }

    /// The most urgent splice candidate: (dts, priority, pipe)
    ///
    /// `horizon` bounds standalone PCR insertion: a PCR deadline counts
    /// only once the mux time has actually reached it (wall clock in live
    /// mode, the last emitted date in pull mode), otherwise a drained
    /// PCR PID would keep electing itself forever.
    fn elect(&self, now: Option<u64>, horizon: u64) -> Option<(u64, PipeHandle)> {
        let mut best: Option<(u64, u8, PipeHandle)> = None;
        let mut consider = |status: &EncapsStatus, priority: u8, pipe: &PipeHandle| {
            let pcr_due = status.pcr_sys != u64::MAX && status.pcr_sys <= horizon;
            if !status.ready && !pcr_due {
                return;
            }
            if let Some(now) = now {
                if status.cr_sys != u64::MAX && status.cr_sys > now && !pcr_due {
                    return;
                }
            }
            let deadline = if status.ready {
                status.dts_sys
            } else {
                status.pcr_sys
            };
            let better = match &best {
                None => true,
                Some((dts, prio, _)) => {
                    deadline < *dts || (deadline == *dts && priority < *prio)
                }
            };
            if better {
                best = Some((deadline, priority, pipe.clone()));
            }
        };

        consider(&self.pat.status.borrow(), 0, &self.pat.encaps);
        consider(&self.pmt.status.borrow(), 0, &self.pmt.encaps);
        for input in &self.inputs {
            let input = input.borrow();
            consider(&input.status.borrow(), input.priority, &input.encaps);
        }
        best.map(|(dts, _, pipe)| (dts, pipe))
    }

    /// Run the election loop and feed the aggregator
    fn schedule(&mut self, ctx: &PipeCtx) {
        if self.inputs.is_empty() {
            return;
        }
        let now = self.live.as_ref().map(|clock| clock.now());
        if now.is_none() && !self.inputs_settled() {
            return;
        }
        let Ok(mgr) = self.ensure_packet_mgr(ctx) else {
            return;
        };

        loop {
            let horizon = now.unwrap_or(self.last_mux_sys);
            let Some((deadline, pipe)) = self.elect(now, horizon) else {
                break;
            };

            // Time the packet: never earlier than what already left.
            let mux_sys = self.last_mux_sys.max(match now {
                Some(now) => now.min(deadline),
                None => deadline.min(
                    self.inputs
                        .iter()
                        .map(|i| i.borrow().status.borrow().cr_sys)
                        .min()
                        .unwrap_or(deadline),
                ),
            });

            // PSI repetition rides on the data schedule.
            if mux_sys >= self.next_psi_sys {
                if self.feed_psi(ctx, mux_sys).is_err() {
                    ctx.throw_fatal(Error::Alloc);
                }
                self.next_psi_sys = mux_sys + self.psi_interval;
                // Tables just became ready; re-elect with them in the race.
                continue;
            }

            match encaps::splice(&pipe, mux_sys) {
                Ok((block, dts_sys)) => {
                    let mut pkt = mgr.alloc();
                    pkt.attach_buf(Buf::Block(block));
                    pkt.set_cr_sys(mux_sys);
                    pkt.clock.cr_dts_delay = Some(dts_sys.saturating_sub(mux_sys));
                    self.last_mux_sys = mux_sys;
                    self.agg.input(pkt);
                }
                Err(Error::Unhandled) => break,
                Err(err) => {
                    ctx.throw_error(err);
                    break;
                }
            }

            if now.is_none() && !self.inputs_settled() {
                break;
            }
        }
    }

    fn flush(&mut self, ctx: &PipeCtx) {
        for input in &self.inputs {
            let input = input.borrow();
            let _ = encaps::eos(&input.encaps);
        }
        for input in &self.inputs {
            input.borrow_mut().eos = true;
        }
        self.schedule(ctx);
        let _ = self.agg.control_ext(&mut AggComplete);
    }
}

// ---------------------------------------------------------------------------
// Pipes
// ---------------------------------------------------------------------------

/// Transport stream mux super-pipe
pub struct TsMux {
    core: Rc<RefCell<MuxCore>>,
    subs: SubList,
    psi_ready: bool,
}

impl TsMux {
    /// Create a mux; `probe` serves the internal aggregator and PSI
    /// encapsulators too
    pub fn new(probe: &ProbeChain) -> Self {
        let agg = TsAgg::mount(probe.clone());
        Self {
            core: Rc::new(RefCell::new(MuxCore {
                agg,
                pat: MuxCore::psi_pid(probe),
                pmt: MuxCore::psi_pid(probe),
                inputs: Vec::new(),
                packet_mgr: Rc::new(RefCell::new(None)),
                section_bufs: crate::buf::BufMgr::block(Arc::new(crate::mem::HeapAlloc)),
                pcr_interval: DEFAULT_PCR_INTERVAL,
                psi_interval: DEFAULT_PSI_INTERVAL,
                pmt_pid: DEFAULT_PMT_PID,
                tsid: 1,
                program: 1,
                psi_version: 0,
                psi_dirty: false,
                next_psi_sys: 0,
                last_mux_sys: 0,
                live: None,
                timer: None,
            })),
            subs: SubList::new(),
            psi_ready: false,
        }
    }

    /// Mount with a probe chain
    pub fn mount(probe: ProbeChain) -> PipeHandle {
        PipeHandle::mount(Self::new(&probe), probe)
    }

    /// Create an input sub-pipe on a mounted mux
    ///
    /// The sub accepts an elementary-stream flow definition carrying
    /// octet rate, PID and PES id, then packets of that stream.
    pub fn alloc_input(mux: &PipeHandle, probe: ProbeChain) -> Result<PipeHandle> {
        let mut grab = GrabCore(None);
        mux.control_ext(&mut grab)?;
        let core = grab.0.ok_or(Error::Invalid)?;
        let sub = PipeHandle::mount(
            TsMuxInput {
                core,
                input: None,
                probe: probe.clone(),
            },
            probe,
        );
        let mut register = RegisterSub(sub.clone());
        mux.control_ext(&mut register)?;
        Ok(sub)
    }
}

/// Internal: hands the shared core to `alloc_input`
struct GrabCore(Option<Rc<RefCell<MuxCore>>>);

/// Internal: tracks the sub in the super-pipe's sibling list
struct RegisterSub(PipeHandle);

impl Pipe for TsMux {
    fn input(&mut self, ctx: &mut PipeCtx, _pkt: Packet) {
        ctx.warn("the mux takes data through its input sub-pipes; dropping");
    }

    fn control(&mut self, ctx: &mut PipeCtx, cmd: Command<'_>) -> Result<()> {
        match cmd {
            Command::SetOutput(output) => self.core.borrow().agg.set_output(&output),
            Command::GetOutput(slot) => {
                *slot = self.core.borrow().agg.output()?;
                Ok(())
            }
            Command::GetFlowDef(slot) => {
                *slot = self.core.borrow().agg.flow_def()?;
                Ok(())
            }
            Command::AttachPacketMgr(mgr) => {
                let core = self.core.borrow();
                *core.packet_mgr.borrow_mut() = Some(mgr.clone());
                core.agg.control(Command::AttachPacketMgr(mgr))
            }
            Command::AttachBufMgr(mgr) => {
                let core = self.core.borrow();
                for psi in [&core.pat, &core.pmt] {
                    let _ = psi.encaps.control(Command::AttachBufMgr(mgr.clone()));
                }
                core.agg.control(Command::AttachBufMgr(mgr))
            }
            Command::AttachClock(clock) => {
                self.core.borrow_mut().live = Some(clock);
                Ok(())
            }
            Command::AttachEvLoop(ev) => self.install_timer(ctx, &ev),
            Command::IterateSub(out) => {
                *out = self.subs.iter();
                Ok(())
            }
            Command::Extension(ext) => {
                if let Some(grab) = ext.downcast_mut::<GrabCore>() {
                    if !self.psi_ready {
                        let mut core = self.core.borrow_mut();
                        core.setup_psi_flows(ctx)?;
                        drop(core);
                        self.psi_ready = true;
                    }
                    grab.0 = Some(Rc::clone(&self.core));
                    return Ok(());
                }
                if let Some(RegisterSub(sub)) = ext.downcast_mut::<RegisterSub>() {
                    self.subs.add(sub);
                    return Ok(());
                }
                if let Some(MuxSetOctetrate(rate)) = ext.downcast_mut::<MuxSetOctetrate>() {
                    return self
                        .core
                        .borrow()
                        .agg
                        .control_ext(&mut AggSetOctetrate(*rate));
                }
                if let Some(MuxSetMode(mode)) = ext.downcast_mut::<MuxSetMode>() {
                    return self.core.borrow().agg.control_ext(&mut AggSetMode(*mode));
                }
                if let Some(MuxSetMtu(mtu)) = ext.downcast_mut::<MuxSetMtu>() {
                    return self.core.borrow().agg.control_ext(&mut AggSetMtu(*mtu));
                }
                if let Some(MuxSetPcrInterval(interval)) =
                    ext.downcast_mut::<MuxSetPcrInterval>()
                {
                    self.core.borrow_mut().pcr_interval = *interval;
                    return Ok(());
                }
                if let Some(MuxSetPsiInterval(interval)) =
                    ext.downcast_mut::<MuxSetPsiInterval>()
                {
                    self.core.borrow_mut().psi_interval = *interval;
                    return Ok(());
                }
                if ext.downcast_mut::<MuxFlush>().is_some() {
                    self.core.borrow_mut().flush(ctx);
                    return Ok(());
                }
                Err(Error::Unhandled)
            }
            _ => Err(Error::Unhandled),
        }
    }
}

impl TsMux {
    /// In live mode, a periodic pump re-runs the election
    fn install_timer(&mut self, ctx: &mut PipeCtx, ev: &EvLoop) -> Result<()> {
        let core = Rc::clone(&self.core);
        let probe = ctx.probe.clone();
        let interval = {
            let core = core.borrow();
            (core.pcr_interval / 2).max(FREQ / 1000)
        };
        let period = Duration::from_nanos(interval * 1_000_000_000 / FREQ);
        let pump = ev
            .alloc_timer(period, Some(period), move || {
                let mut ctx = PipeCtx {
                    probe: probe.clone(),
                    producer: None,
                };
                core.borrow_mut().schedule(&mut ctx);
            })
            .map_err(|_| Error::Upump)?;
        pump.start();
        self.core.borrow_mut().timer = Some(pump);
        Ok(())
    }
}

/// One elementary-stream input of a [`TsMux`]
struct TsMuxInput {
    core: Rc<RefCell<MuxCore>>,
    input: Option<Rc<RefCell<MuxInput>>>,
    probe: ProbeChain,
}

impl Pipe for TsMuxInput {
    fn input(&mut self, ctx: &mut PipeCtx, pkt: Packet) {
        let Some(input) = &self.input else {
            ctx.warn("input before flow definition; dropping");
            return;
        };
        input.borrow().encaps.input(pkt);
        self.core.borrow_mut().schedule(ctx);
    }

    fn control(&mut self, ctx: &mut PipeCtx, cmd: Command<'_>) -> Result<()> {
        match cmd {
            Command::SetFlowDef(def) => {
                if !def.flow_def_matches(FLOW_BLOCK) || def.flow_def_matches(FLOW_MPEGTS) {
                    return Err(Error::Invalid);
                }
                let pid = def.ts_pid().ok_or(Error::Invalid)?;
                let pes_id = def.pes_id().ok_or(Error::Invalid)?;
                def.octetrate().filter(|&r| r > 0).ok_or(Error::Invalid)?;

                let status = Rc::new(RefCell::new(idle_status()));
                let encaps_probe = self.probe.clone().push(StatusProbe {
                    slot: Rc::clone(&status),
                });
                let encaps = TsEncaps::mount(encaps_probe);
                encaps.set_flow_def(def.dup())?;

                let mut core = self.core.borrow_mut();
                let pcr = def.is_pcr();
                if pcr {
                    encaps::set_pcr_interval(&encaps, core.pcr_interval)?;
                }
                let stream_type = match def.flow_def().as_deref() {
                    Ok("block.mpeg2video.pic.") => 0x02,
                    Ok("block.h264.pic.") => 0x1B,
                    Ok("block.hevc.pic.") => 0x24,
                    Ok("block.aac.sound.") => 0x0F,
                    Ok("block.mp2.sound.") => 0x04,
                    // PES-framed private data.
                    _ => 0x06,
                };
                let input = Rc::new(RefCell::new(MuxInput {
                    encaps,
                    status,
                    pid,
                    stream_type,
                    priority: priority_of(pes_id, pcr),
                    eos: false,
                }));
                if let Some(old) = self.input.take() {
                    core.inputs.retain(|i| !Rc::ptr_eq(i, &old));
                }
                core.inputs.push(Rc::clone(&input));
                core.psi_dirty = true;
                self.input = Some(input);
                Ok(())
            }
            Command::GetFlowDef(slot) => {
                *slot = match &self.input {
                    Some(input) => input.borrow().encaps.flow_def()?,
                    None => None,
                };
                Ok(())
            }
            Command::GetOutput(slot) => {
                *slot = None;
                Ok(())
            }
            Command::Extension(ext) => {
                if ext.downcast_mut::<super::encaps::TsEos>().is_some() {
                    if let Some(input) = &self.input {
                        let _ = encaps::eos(&input.borrow().encaps);
                        input.borrow_mut().eos = true;
                        self.core.borrow_mut().schedule(ctx);
                    }
                    return Ok(());
                }
                if let Some(input) = &self.input {
                    // Forward module commands (set_cc etc.) to the encaps.
                    return input.borrow().encaps.control(Command::Extension(ext));
                }
                Err(Error::Unhandled)
            }
            _ => Err(Error::Unhandled),
        }
    }
}

impl Drop for TsMuxInput {
    fn drop(&mut self) {
        if let Some(input) = self.input.take() {
            let mut core = self.core.borrow_mut();
            core.inputs.retain(|i| !Rc::ptr_eq(i, &input));
            core.psi_dirty = true;
        }
    }
}
