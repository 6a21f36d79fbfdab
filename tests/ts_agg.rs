//! Aggregator shaping checks: CBR spacing and padding, capped-VBR
//! shifting, and PCR rewriting at emission time.

use std::sync::Arc;

use medialoom::buf::{Buf, BufMgr};
use medialoom::clock::FREQ;
use medialoom::flow;
use medialoom::mem::HeapAlloc;
use medialoom::packet::{Packet, PacketMgr};
use medialoom::pipe::{CollectSink, Command, PipeHandle};
use medialoom::probe::ProbeChain;
use medialoom::ts::agg::{AggComplete, AggSetMode, AggSetMtu, AggSetOctetrate, TsAgg};
use medialoom::ts::bits::*;
use medialoom::ts::MuxMode;

const MTU: usize = 7 * TS_SIZE;

struct Bench {
    agg: PipeHandle,
    packet_mgr: PacketMgr,
    buf_mgr: BufMgr,
}

fn bench(mode: MuxMode) -> (Bench, std::rc::Rc<std::cell::RefCell<medialoom::pipe::Collected>>) {
    let agg = TsAgg::mount(ProbeChain::null());
    let packet_mgr = PacketMgr::new(64);
    let buf_mgr = BufMgr::block(Arc::new(HeapAlloc));
    agg.control(Command::AttachPacketMgr(packet_mgr.clone()))
        .unwrap();
    agg.control(Command::AttachBufMgr(buf_mgr.clone())).unwrap();
    agg.control_ext(&mut AggSetMode(mode)).unwrap();
    agg.control_ext(&mut AggSetMtu(MTU)).unwrap();
    // One aggregate per second.
    agg.control_ext(&mut AggSetOctetrate(MTU as u64)).unwrap();
    let def = flow::alloc_def(&packet_mgr, "block.mpegts.").unwrap();
    agg.set_flow_def(def).unwrap();
    let (sink, seen) = CollectSink::mount();
    agg.set_output(&sink).unwrap();
    (
        Bench {
            agg,
            packet_mgr,
            buf_mgr,
        },
        seen,
    )
}

impl Bench {
    /// One TS packet on the given PID, dated `dts_sys`
    fn ts_packet(&self, pid: u16, dts_sys: u64, pcr: Option<u64>) -> Packet {
        let mut raw = [0u8; TS_SIZE];
        ts_init(&mut raw);
        ts_set_pid(&mut raw, pid);
        if let Some(pcr) = pcr {
            ts_set_adaptation(&mut raw, 7);
            tsaf_set_pcr(&mut raw, pcr);
        }
        let mut pkt = self.packet_mgr.alloc();
        pkt.attach_buf(Buf::Block(self.buf_mgr.block_from_slice(&raw).unwrap()));
        pkt.set_cr_sys(dts_sys);
        pkt.clock.cr_dts_delay = Some(0);
        pkt
    }

    fn feed(&self, pid: u16, dts_sys: u64) {
        self.agg.input(self.ts_packet(pid, dts_sys, None));
    }
}

#[test]
fn cbr_spacing_is_exact() {
    let (bench, seen) = bench(MuxMode::Cbr);

    // Two full aggregates one interval apart.
    for i in 0..7 {
        bench.feed(68, FREQ + i);
    }
    for i in 0..7 {
        bench.feed(68, FREQ + FREQ + i);
    }
    let seen = seen.borrow();
    assert_eq!(seen.packets, 2);
    let first = seen.received[0].cr_sys().unwrap();
    let second = seen.received[1].cr_sys().unwrap();
    assert!(second - first >= FREQ - 1 && second - first <= FREQ + 1);
    for pkt in &seen.received {
        assert_eq!(pkt.buf.as_ref().unwrap().as_block().unwrap().size(), MTU);
    }
}

#[test]
fn cbr_pads_underflow_with_null_packets() {
    let (bench, seen) = bench(MuxMode::Cbr);

    for i in 0..3 {
        bench.feed(68, FREQ + i);
    }
    bench.agg.control_ext(&mut AggComplete).unwrap();

    let seen = seen.borrow();
    assert_eq!(seen.packets, 1);
    let bytes = seen.received[0]
        .buf
        .as_ref()
        .unwrap()
        .as_block()
        .unwrap()
        .to_vec();
    assert_eq!(bytes.len(), MTU);
    let pids: Vec<u16> = bytes.chunks(TS_SIZE).map(ts_get_pid).collect();
    assert_eq!(&pids[..3], &[68, 68, 68]);
    assert!(pids[3..].iter().all(|&pid| pid == PID_NULL));
    for chunk in bytes.chunks(TS_SIZE) {
        assert!(ts_validate(chunk));
    }
}

#[test]
fn idle_cbr_tick_emits_pure_padding() {
    let (bench, seen) = bench(MuxMode::Cbr);
    bench.feed(68, FREQ);
    bench.agg.control_ext(&mut AggComplete).unwrap();
    bench.agg.control_ext(&mut AggComplete).unwrap();
    let seen = seen.borrow();
    assert_eq!(seen.packets, 2);
    let bytes = seen.received[1]
        .buf
        .as_ref()
        .unwrap()
        .as_block()
        .unwrap()
        .to_vec();
    assert!(bytes.chunks(TS_SIZE).all(|c| ts_get_pid(c) == PID_NULL));
    // Property: aggregates stay on the interval grid.
    let delta = seen.received[1].cr_sys().unwrap() - seen.received[0].cr_sys().unwrap();
    assert!(delta >= FREQ - 1 && delta <= FREQ + 1);
}

#[test]
fn vbr_emits_only_when_full() {
    let (bench, seen) = bench(MuxMode::Vbr);
    for i in 0..6 {
        bench.feed(68, FREQ + i);
    }
    assert_eq!(seen.borrow().packets, 0);
    bench.feed(68, FREQ + 6);
    assert_eq!(seen.borrow().packets, 1);
    // No padding in VBR.
    assert_eq!(
        seen.borrow().received[0]
            .buf
            .as_ref()
            .unwrap()
            .as_block()
            .unwrap()
            .size(),
        MTU
    );
}

#[test]
fn capped_vbr_skips_idle_intervals_without_padding() {
    let (bench, seen) = bench(MuxMode::Capped);
    for i in 0..7 {
        bench.feed(68, FREQ + i);
    }
    assert_eq!(seen.borrow().packets, 1);
    // A long gap, then more traffic: the grid shifts forward instead of
    // emitting padding-only aggregates.
    for i in 0..7 {
        bench.feed(68, 10 * FREQ + i);
    }
    assert_eq!(seen.borrow().packets, 2);
    let seen = seen.borrow();
    let bytes = seen.received[1]
        .buf
        .as_ref()
        .unwrap()
        .as_block()
        .unwrap()
        .to_vec();
    assert!(bytes.chunks(TS_SIZE).all(|c| c[1] & 0x1F == 0 && ts_get_pid(c) == 68));
}

#[test]
fn pcr_is_rewritten_against_emission_date() {
    let (bench, seen) = bench(MuxMode::Cbr);

    // A PCR packet dated one interval after the aggregate's start: the
    // aggregation moves it earlier, so the PCR must move with it.
    let pcr_orig = FREQ;
    bench.agg.input(bench.ts_packet(68, FREQ, None));
    bench
        .agg
        .input(bench.ts_packet(68, FREQ + FREQ / 2, Some(pcr_orig)));
    bench.agg.control_ext(&mut AggComplete).unwrap();

    let seen = seen.borrow();
    assert_eq!(seen.packets, 1);
    let emit_cr = seen.received[0].cr_sys().unwrap();
    let bytes = seen.received[0]
        .buf
        .as_ref()
        .unwrap()
        .as_block()
        .unwrap()
        .to_vec();
    let second = &bytes[TS_SIZE..2 * TS_SIZE];
    assert!(tsaf_has_pcr(second));
    // The packet was dated FREQ + FREQ/2 but leaves at emit_cr.
    let expected = pcr_orig + emit_cr - (FREQ + FREQ / 2);
    assert_eq!(tsaf_get_pcr(second), expected);
}
