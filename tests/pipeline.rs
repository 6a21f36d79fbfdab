//! Whole-graph checks: request negotiation through the probe chain, the
//! input queue's back-pressure, and a two-stream mux producing a
//! conformant transport stream with PAT/PMT interleaved.

use std::collections::HashMap;
use std::sync::Arc;

use medialoom::buf::{Buf, BufMgr};
use medialoom::clock::FREQ;
use medialoom::flow;
use medialoom::mem::HeapAlloc;
use medialoom::packet::PacketMgr;
use medialoom::pipe::{CollectSink, Command};
use medialoom::probe::{LogLevel, LogProbe, MemProviderProbe, PrefixProbe, ProbeChain};
use medialoom::ts::bits::*;
use medialoom::ts::encaps::{self, TsEncaps};
use medialoom::ts::mux::{MuxFlush, MuxSetMode, MuxSetMtu, MuxSetOctetrate, TsMux};
use medialoom::ts::MuxMode;

fn app_probe(packet_mgr: &PacketMgr) -> ProbeChain {
    ProbeChain::null()
        .push(LogProbe::new(LogLevel::Warn))
        .push(MemProviderProbe::new(Arc::new(HeapAlloc), packet_mgr.clone()))
        .push(PrefixProbe::new("test"))
}

/// The encapsulator asks for its buffer allocator through the request
/// path instead of a direct attachment.
#[test]
fn buffer_allocator_negotiated_via_probe() {
    let packet_mgr = PacketMgr::new(16);
    let pipe = TsEncaps::mount(app_probe(&packet_mgr));

    let mut def = flow::alloc_def(&packet_mgr, "block.").unwrap();
    def.set_octetrate(1000).unwrap();
    def.set_ts_pid(100).unwrap();
    def.set_pes_id(0xE0).unwrap();
    def.set_pes_alignment().unwrap();
    pipe.set_flow_def(def).unwrap();

    let buf_mgr = BufMgr::block(Arc::new(HeapAlloc));
    let mut pkt = packet_mgr.alloc();
    pkt.attach_buf(Buf::Block(buf_mgr.block_from_slice(&[0xAB; 100]).unwrap()));
    pkt.set_cr_sys(FREQ);
    pkt.clock.cr_dts_delay = Some(FREQ);
    pkt.set_start().unwrap();
    pipe.input(pkt);

    // No AttachBufMgr anywhere: the splice still finds storage.
    let (block, _dts) = encaps::splice(&pipe, FREQ).unwrap();
    assert_eq!(block.size(), TS_SIZE);
}

/// Invalid flow definitions are refused at set time.
#[test]
fn encaps_rejects_incomplete_flow_defs() {
    let packet_mgr = PacketMgr::new(4);
    let pipe = TsEncaps::mount(app_probe(&packet_mgr));

    // No octetrate.
    let mut def = flow::alloc_def(&packet_mgr, "block.").unwrap();
    def.set_ts_pid(100).unwrap();
    def.set_pes_id(0xE0).unwrap();
    assert!(pipe.set_flow_def(def).is_err());

    // No PES id.
    let mut def = flow::alloc_def(&packet_mgr, "block.").unwrap();
    def.set_octetrate(1000).unwrap();
    def.set_ts_pid(100).unwrap();
    assert!(pipe.set_flow_def(def).is_err());
}

struct TsDump {
    /// Packets per PID in emission order
    by_pid: HashMap<u16, Vec<Vec<u8>>>,
    order: Vec<u16>,
}

fn dump_ts(aggregates: &[Vec<u8>]) -> TsDump {
    let mut dump = TsDump {
        by_pid: HashMap::new(),
        order: Vec::new(),
    };
    for aggregate in aggregates {
        assert_eq!(aggregate.len() % TS_SIZE, 0);
        for pkt in aggregate.chunks(TS_SIZE) {
            assert!(ts_validate(pkt));
            let pid = ts_get_pid(pkt);
            dump.order.push(pid);
            dump.by_pid.entry(pid).or_default().push(pkt.to_vec());
        }
    }
    dump
}

/// Continuity counters are strictly monotonic mod 16 over payload
/// packets of one PID.
fn check_continuity(packets: &[Vec<u8>]) {
    let mut last: Option<u8> = None;
    for pkt in packets {
        if !ts_has_payload(pkt) {
            if let Some(last) = last {
                assert_eq!(ts_get_cc(pkt), last);
            }
            continue;
        }
        if let Some(prev) = last {
            assert_eq!(ts_get_cc(pkt), (prev + 1) & 0x0F);
        }
        last = Some(ts_get_cc(pkt));
    }
}

#[test]
fn mux_produces_conformant_program() {
    let packet_mgr = PacketMgr::new(64);
    let probe = app_probe(&packet_mgr);

    let mux = TsMux::mount(probe.clone());
    mux.control(Command::AttachPacketMgr(packet_mgr.clone()))
        .unwrap();
    mux.control_ext(&mut MuxSetOctetrate(100_000)).unwrap();
    mux.control_ext(&mut MuxSetMode(MuxMode::Cbr)).unwrap();
    mux.control_ext(&mut MuxSetMtu(7 * TS_SIZE)).unwrap();

    let (sink, seen) = CollectSink::mount();
    mux.set_output(&sink).unwrap();

    let video = TsMux::alloc_input(&mux, probe.clone()).unwrap();
    let mut vdef = flow::alloc_def(&packet_mgr, "block.mpeg2video.pic.").unwrap();
    vdef.set_octetrate(60_000).unwrap();
    vdef.set_tb_rate(120_000).unwrap();
    vdef.set_ts_pid(256).unwrap();
    vdef.set_pes_id(0xE0).unwrap();
    vdef.set_pes_alignment().unwrap();
    vdef.set_pcr().unwrap();
    video.set_flow_def(vdef).unwrap();

    let audio = TsMux::alloc_input(&mux, probe.clone()).unwrap();
    let mut adef = flow::alloc_def(&packet_mgr, "block.mp2.sound.").unwrap();
    adef.set_octetrate(16_000).unwrap();
    adef.set_ts_pid(257).unwrap();
    adef.set_pes_id(0xC0).unwrap();
    adef.set_pes_alignment().unwrap();
    audio.set_flow_def(adef).unwrap();

    let buf_mgr = BufMgr::block(Arc::new(HeapAlloc));
    let frame = FREQ / 25;
    let mut video_es = Vec::new();
    for i in 0..10u64 {
        let now = FREQ + i * frame;

        let mut pkt = packet_mgr.alloc();
        let data: Vec<u8> = (0..2400).map(|b| (b as u64 + i) as u8).collect();
        video_es.extend_from_slice(&data);
        pkt.attach_buf(Buf::Block(buf_mgr.block_from_slice(&data).unwrap()));
        pkt.set_cr_prog(now);
        pkt.set_cr_sys(now);
        pkt.clock.cr_dts_delay = Some(FREQ / 2);
        pkt.clock.dts_pts_delay = Some(0);
        pkt.set_start().unwrap();
        if i == 0 {
            pkt.set_random().unwrap();
        }
        video.input(pkt);

        let mut pkt = packet_mgr.alloc();
        let data = [i as u8; 640];
        pkt.attach_buf(Buf::Block(buf_mgr.block_from_slice(&data).unwrap()));
        pkt.set_cr_prog(now);
        pkt.set_cr_sys(now);
        pkt.clock.cr_dts_delay = Some(FREQ / 2);
        pkt.clock.dts_pts_delay = Some(0);
        pkt.clock.duration = Some(frame);
        pkt.set_start().unwrap();
        audio.input(pkt);
    }
    mux.control_ext(&mut MuxFlush).unwrap();

    let seen = seen.borrow();
    assert!(seen.packets > 0, "mux emitted nothing");
    let aggregates: Vec<Vec<u8>> = seen
        .received
        .iter()
        .map(|p| p.buf.as_ref().unwrap().as_block().unwrap().to_vec())
        .collect();
    let dump = dump_ts(&aggregates);

    // PAT and PMT are present and checksum clean.
    let pat_packets = dump.by_pid.get(&PID_PAT).expect("PAT present");
    let first_pat = &pat_packets[0];
    assert!(ts_get_unit_start(first_pat));
    let payload = &first_pat[ts_payload_offset(first_pat)..];
    let pointer = usize::from(payload[0]);
    let section_start = 1 + pointer;
    let section_len =
        3 + (usize::from(payload[section_start + 1] & 0x0F) << 8 | usize::from(payload[section_start + 2]));
    let section = &payload[section_start..section_start + section_len];
    assert!(psi_check_crc(section));
    // The single program points at the PMT PID.
    let pmt_pid = (u16::from(section[10] & 0x1F) << 8) | u16::from(section[11]);
    assert!(dump.by_pid.contains_key(&pmt_pid), "PMT present");

    // Elementary PIDs made it out.
    assert!(dump.by_pid.contains_key(&256));
    assert!(dump.by_pid.contains_key(&257));

    // Continuity per PID (null padding excluded).
    for (&pid, packets) in &dump.by_pid {
        if pid != PID_NULL {
            check_continuity(packets);
        }
    }

    // A PCR appears on the video PID.
    assert!(dump.by_pid[&256].iter().any(|p| tsaf_has_pcr(p)));

    // Round trip: reassembling the video PES payload gives back the ES
    // byte stream.
    let mut pes = Vec::new();
    for pkt in &dump.by_pid[&256] {
        if ts_has_payload(pkt) {
            pes.extend_from_slice(&pkt[ts_payload_offset(pkt)..]);
        }
    }
    let mut es = Vec::new();
    let mut offset = 0;
    while offset + PES_HEADER_SIZE < pes.len() {
        assert!(pes_validate(&pes[offset..]));
        let header_len =
            PES_HEADER_SIZE_NOPTS + usize::from(pes_get_header_data_length(&pes[offset..]));
        let payload_len =
            usize::from(pes_get_length(&pes[offset..])) - (header_len - PES_HEADER_SIZE);
        es.extend_from_slice(&pes[offset + header_len..offset + header_len + payload_len]);
        offset += header_len + payload_len;
    }
    assert_eq!(es, video_es);
}
