//! PSI Inserter
//!
//! Repeats PSI tables into a passing transport stream. The main pipe
//! carries TS packets through untouched; each sub pipe owns one table (a
//! set of section packets), a repetition interval and a private PSI-mode
//! encapsulator. Whenever the passing traffic's clock crosses a table's
//! deadline, its sections are packetized and emitted ahead of the
//! triggering packet. A hole of more than a second in the traffic resets
//! the table's phase.

use std::cell::RefCell;
use std::rc::Rc;

use crate::buf::Buf;
use crate::clock::FREQ;
use crate::error::{Error, Result};
use crate::flow::{FLOW_MPEGTS, FLOW_MPEGTS_PSI};
use crate::packet::{Packet, PacketMgr};
use crate::pipe::{Command, OutputHelper, Pipe, PipeCtx, PipeHandle, Request, RequestKind, Response};
use crate::probe::ProbeChain;

use super::encaps::{self, TsEncaps};

/// Default table repetition interval (DVB wants PAT/PMT at least every
/// 500 ms)
pub const DEFAULT_INTERVAL: u64 = FREQ / 5;

/// Largest traffic gap before a table's phase resets
const MAX_HOLE: u64 = FREQ;

/// Set a table sub's repetition interval
pub struct PsiSetInterval(pub u64);

/// Read a table sub's repetition interval
pub struct PsiGetInterval(pub Option<u64>);

struct TableState {
    interval: u64,
    /// Next insertion date; `u64::MAX` without a table, 0 forces
    /// immediate insertion
    next_cr_sys: u64,
    sections: Vec<Packet>,
    building: Vec<Packet>,
    complete: bool,
    encaps: PipeHandle,
}

type SharedTables = Rc<RefCell<Vec<Rc<RefCell<TableState>>>>>;

/// PSI insertion super-pipe
pub struct PsiInserter {
    output: OutputHelper,
    tables: SharedTables,
    packet_mgr: Rc<RefCell<Option<PacketMgr>>>,
}

impl PsiInserter {
    /// New inserter with no tables
    pub fn new() -> Self {
        Self {
            output: OutputHelper::new(),
            tables: Rc::new(RefCell::new(Vec::new())),
            packet_mgr: Rc::new(RefCell::new(None)),
        }
    }

    /// Mount with a probe chain
    pub fn mount(probe: ProbeChain) -> PipeHandle {
        PipeHandle::mount(Self::new(), probe)
    }

    /// Create a table sub-pipe on a mounted inserter
    ///
    /// The sub accepts a PSI flow definition and section packets; `probe`
    /// also serves the internal encapsulator, so a provider probe must be
    /// reachable from it.
    pub fn alloc_sub(inserter: &PipeHandle, probe: ProbeChain) -> Result<PipeHandle> {
        let mut grab = GrabTables(None);
        inserter.control_ext(&mut grab)?;
        let tables = grab.0.ok_or(Error::Invalid)?;
        let state = Rc::new(RefCell::new(TableState {
            interval: DEFAULT_INTERVAL,
            next_cr_sys: u64::MAX,
            sections: Vec::new(),
            building: Vec::new(),
            complete: true,
            encaps: TsEncaps::mount(probe.clone()),
        }));
        tables.borrow_mut().push(Rc::clone(&state));
        Ok(PipeHandle::mount(
            PsiInserterSub {
                state,
                super_pipe: inserter.downgrade(),
            },
            probe,
        ))
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
        let _ = ctx.throw(&mut crate::probe::Event::ProvideRequest(&request));
        self.packet_mgr.borrow().clone().ok_or(Error::Alloc)
    }

    /// Emit one table now, ahead of the triggering packet
    fn insert_table(
        &mut self,
        ctx: &PipeCtx,
        table: &Rc<RefCell<TableState>>,
        cr_sys: u64,
    ) {
        let Ok(mgr) = self.ensure_packet_mgr(ctx) else {
            ctx.throw_fatal(Error::Alloc);
            return;
        };
        let encaps = table.borrow().encaps.clone();
        {
            let state = table.borrow();
            for section in &state.sections {
                let mut section = section.dup();
                section.set_cr_sys(cr_sys);
                section.clock.cr_dts_delay = Some(0);
                encaps.input(section);
            }
        }
        loop {
            match encaps::splice(&encaps, cr_sys) {
                Ok((block, dts_sys)) => {
                    let mut pkt = mgr.alloc();
                    pkt.attach_buf(Buf::Block(block));
                    pkt.set_cr_sys(cr_sys);
                    pkt.clock.cr_dts_delay = Some(dts_sys.saturating_sub(cr_sys));
                    self.output.output_packet(ctx, pkt);
                }
                Err(_) => break,
            }
        }
    }
}

impl Default for PsiInserter {
    fn default() -> Self {
        Self::new()
    }
}

/// Internal: hands the shared table list to `alloc_sub`
struct GrabTables(Option<SharedTables>);

impl Pipe for PsiInserter {
    fn input(&mut self, ctx: &mut PipeCtx, pkt: Packet) {
        let Some(cr_sys) = pkt.cr_sys().or_else(|| pkt.dts_sys()) else {
            self.output.output_packet(ctx, pkt);
            return;
        };

        let tables: Vec<_> = self.tables.borrow().clone();
        for table in &tables {
            let (mut next, interval) = {
                let state = table.borrow();
                (state.next_cr_sys, state.interval)
            };
            if next == u64::MAX {
                continue;
            }
            if next != 0 && cr_sys > next + MAX_HOLE {
                ctx.warn(format!(
                    "large hole in traffic ({} ms), resetting table phase",
                    (cr_sys - next) * 1000 / FREQ
                ));
                next = 0;
            }
            while next < cr_sys {
                let insert_at = if next == 0 { cr_sys } else { next };
                self.insert_table(ctx, table, insert_at);
                next = insert_at + interval;
            }
            table.borrow_mut().next_cr_sys = next;
        }

        self.output.output_packet(ctx, pkt);
    }

    fn control(&mut self, ctx: &mut PipeCtx, cmd: Command<'_>) -> Result<()> {
        match cmd {
            Command::SetFlowDef(def) => {
                if !def.flow_def_matches(FLOW_MPEGTS) {
                    return Err(Error::Invalid);
                }
                self.output.store_flow_def(def);
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
            Command::IterateSub(_) => {
                // Subs are tracked by table state, not handles.
                Err(Error::Unhandled)
            }
            Command::Extension(ext) => {
                if let Some(grab) = ext.downcast_mut::<GrabTables>() {
                    grab.0 = Some(Rc::clone(&self.tables));
                    return Ok(());
                }
                Err(Error::Unhandled)
            }
            _ => Err(Error::Unhandled),
        }
    }
}

/// One table input of a [`PsiInserter`]
struct PsiInserterSub {
    state: Rc<RefCell<TableState>>,
    super_pipe: crate::pipe::WeakPipeHandle,
}

impl Pipe for PsiInserterSub {
    fn input(&mut self, ctx: &mut PipeCtx, pkt: Packet) {
        let mut state = self.state.borrow_mut();
        if state.complete {
            ctx.debug("new table");
            state.building.clear();
            state.complete = false;
            state.next_cr_sys = pkt.cr_sys().unwrap_or(0);
        }
        // A single unmarked section is a whole table; multi-section
        // tables open with a start marker and close with an end marker.
        let (is_start, is_end) = (pkt.is_start(), pkt.is_end());
        state.building.push(pkt);
        let done = is_end || (state.building.len() == 1 && !is_start);
        if done {
            state.complete = true;
            let building = std::mem::take(&mut state.building);
            state.sections = building;
            if state.next_cr_sys == u64::MAX {
                state.next_cr_sys = 0;
            }
        }
    }

    fn control(&mut self, _ctx: &mut PipeCtx, cmd: Command<'_>) -> Result<()> {
        match cmd {
            Command::SetFlowDef(def) => {
                if !def.flow_def_matches(FLOW_MPEGTS_PSI) {
                    return Err(Error::Invalid);
                }
                self.state.borrow().encaps.set_flow_def(def)
            }
            Command::GetOutput(slot) => {
                *slot = self.super_pipe.upgrade();
                Ok(())
            }
            Command::Extension(ext) => {
                if let Some(PsiSetInterval(interval)) = ext.downcast_mut::<PsiSetInterval>() {
                    let mut state = self.state.borrow_mut();
                    let old = state.interval;
                    state.interval = *interval;
                    if state.next_cr_sys != u64::MAX && state.next_cr_sys != 0 {
                        state.next_cr_sys =
                            (state.next_cr_sys + state.interval).saturating_sub(old);
                    }
                    return Ok(());
                }
                if let Some(get) = ext.downcast_mut::<PsiGetInterval>() {
                    get.0 = Some(self.state.borrow().interval);
                    return Ok(());
                }
                Err(Error::Unhandled)
            }
            _ => Err(Error::Unhandled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::{Buf, BufMgr};
    use crate::mem::HeapAlloc;
    use crate::pipe::CollectSink;
    use crate::probe::MemProviderProbe;
    use crate::ts::bits::{ts_get_pid, ts_get_unit_start, TS_SIZE};
    use std::sync::Arc;

    fn probe(mgr: &PacketMgr) -> ProbeChain {
        ProbeChain::null().push(MemProviderProbe::new(
            Arc::new(HeapAlloc),
            mgr.clone(),
        ))
    }

    fn traffic(mgr: &PacketMgr, bufs: &BufMgr, cr_sys: u64) -> Packet {
        let mut raw = [0u8; TS_SIZE];
        crate::ts::bits::ts_init(&mut raw);
        crate::ts::bits::ts_set_pid(&mut raw, 68);
        let mut pkt = mgr.alloc();
        pkt.attach_buf(Buf::Block(bufs.block_from_slice(&raw).unwrap()));
        pkt.set_cr_sys(cr_sys);
        pkt
    }

    #[test]
    fn tables_repeat_on_their_interval() {
        let mgr = PacketMgr::new(32);
        let bufs = BufMgr::block(Arc::new(HeapAlloc));
        let probe = probe(&mgr);

        let inserter = PsiInserter::mount(probe.clone());
        inserter
            .set_flow_def(crate::flow::alloc_def(&mgr, FLOW_MPEGTS).unwrap())
            .unwrap();
        let (sink, seen) = CollectSink::mount();
        inserter.set_output(&sink).unwrap();

        let sub = PsiInserter::alloc_sub(&inserter, probe).unwrap();
        let mut def = crate::flow::alloc_def(&mgr, FLOW_MPEGTS_PSI).unwrap();
        def.set_octetrate(10_000).unwrap();
        def.set_ts_pid(0).unwrap();
        sub.set_flow_def(def).unwrap();
        sub.control_ext(&mut PsiSetInterval(FREQ)).unwrap();

        // One unmarked section: a whole table.
        let section = crate::ts::bits::pat_build(1, 0, &[(1, 0x1000)]);
        let mut table = mgr.alloc();
        table.attach_buf(Buf::Block(bufs.block_from_slice(&section).unwrap()));
        sub.input(table);

        // Traffic a hair past each interval boundary drives three
        // insertions.
        for i in 0..3u64 {
            inserter.input(traffic(&mgr, &bufs, FREQ + i * (FREQ + 1)));
        }

        let seen = seen.borrow();
        let mut pat = 0;
        let mut data = 0;
        let mut last_was_pat = false;
        let mut pat_before_data = 0;
        for pkt in &seen.received {
            let bytes = pkt.buf.as_ref().unwrap().as_block().unwrap().to_vec();
            match ts_get_pid(&bytes) {
                0 => {
                    assert!(ts_get_unit_start(&bytes));
                    pat += 1;
                    last_was_pat = true;
                }
                68 => {
                    if last_was_pat {
                        pat_before_data += 1;
                    }
                    data += 1;
                    last_was_pat = false;
                }
                other => panic!("unexpected pid {other}"),
            }
        }
        assert_eq!(data, 3);
        assert_eq!(pat, 3);
        // Each insertion lands ahead of the packet that triggered it.
        assert_eq!(pat_before_data, 3);
    }

    #[test]
    fn multi_section_tables_swap_atomically() {
        let mgr = PacketMgr::new(32);
        let bufs = BufMgr::block(Arc::new(HeapAlloc));
        let probe = probe(&mgr);

        let inserter = PsiInserter::mount(probe.clone());
        inserter
            .set_flow_def(crate::flow::alloc_def(&mgr, FLOW_MPEGTS).unwrap())
            .unwrap();
        let (sink, seen) = CollectSink::mount();
        inserter.set_output(&sink).unwrap();

        let sub = PsiInserter::alloc_sub(&inserter, probe).unwrap();
        let mut def = crate::flow::alloc_def(&mgr, FLOW_MPEGTS_PSI).unwrap();
        def.set_octetrate(10_000).unwrap();
        def.set_ts_pid(17).unwrap();
        sub.set_flow_def(def).unwrap();

        // First section of a two-section table: nothing inserts yet.
        let section = crate::ts::bits::pat_build(1, 0, &[(1, 0x1000)]);
        let mut first = mgr.alloc();
        first.attach_buf(Buf::Block(bufs.block_from_slice(&section).unwrap()));
        first.set_start().unwrap();
        sub.input(first);
        inserter.input(traffic(&mgr, &bufs, FREQ));
        assert_eq!(seen.borrow().packets, 1);

        // The closing section completes the image; the next traffic
        // carries both sections.
        let mut second = mgr.alloc();
        second.attach_buf(Buf::Block(bufs.block_from_slice(&section).unwrap()));
        second.set_end().unwrap();
        sub.input(second);
        inserter.input(traffic(&mgr, &bufs, FREQ + FREQ / 2));
        let seen = seen.borrow();
        let table_packets = seen
            .received
            .iter()
            .filter(|p| {
                let bytes = p.buf.as_ref().unwrap().as_block().unwrap().to_vec();
                ts_get_pid(&bytes) == 17
            })
            .count();
        assert_eq!(table_packets, 2);
    }
}
