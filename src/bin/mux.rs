//! Demo mux: synthesize a two-stream program and write it as MPEG-TS.
//!
//! Generates a video-like and an audio-like elementary stream from byte
//! patterns, runs them through the mux in pull mode (no realtime clock),
//! and writes the aggregated transport stream to a file. Useful as a
//! smoke test and as a reference for wiring the pipeline.

use std::fs::File;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use medialoom::buf::{Buf, BufMgr};
use medialoom::clock::FREQ;
use medialoom::flow;
use medialoom::mem::PoolAlloc;
use medialoom::packet::{Packet, PacketMgr};
use medialoom::pipe::{Command, Pipe, PipeCtx, PipeHandle};
use medialoom::probe::{LogLevel, LogProbe, MemProviderProbe, PrefixProbe, ProbeChain};
use medialoom::ts::mux::{MuxFlush, MuxSetMode, MuxSetMtu, MuxSetOctetrate, TsMux};
use medialoom::ts::MuxMode;
use medialoom::Error;

/// Command line options
#[derive(Parser, Debug)]
#[command(name = "medialoom-mux", about = "Mux a synthetic program into MPEG-TS")]
struct Args {
    /// Output file for the transport stream
    output: String,

    /// Total output rate in bytes per second
    #[arg(long, default_value_t = 1_000_000)]
    octetrate: u64,

    /// Shaping mode: vbr, cbr or capped
    #[arg(long, default_value = "cbr")]
    mode: String,

    /// Output MTU in bytes (rounded down to a packet multiple)
    #[arg(long, default_value_t = 1316)]
    mtu: usize,

    /// Duration of the synthetic program in seconds
    #[arg(long, default_value_t = 2)]
    seconds: u64,

    /// Log filter (RUST_LOG syntax)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log: String,
}

/// Sink writing every aggregate to a file
struct FileSink {
    file: File,
    bytes: u64,
}

impl Drop for FileSink {
    fn drop(&mut self) {
        info!(bytes = self.bytes, "transport stream written");
    }
}

impl Pipe for FileSink {
    fn input(&mut self, ctx: &mut PipeCtx, pkt: Packet) {
        let Some(buf) = pkt.buf.as_ref().and_then(|b| b.as_block().ok()) else {
            return;
        };
        let data = buf.to_vec();
        if let Err(err) = self.file.write_all(&data) {
            ctx.error(format!("write failed: {err}"));
            return;
        }
        self.bytes += data.len() as u64;
    }

    fn control(&mut self, _ctx: &mut PipeCtx, cmd: Command<'_>) -> medialoom::Result<()> {
        match cmd {
            Command::SetFlowDef(_) => Ok(()),
            _ => Err(Error::Unhandled),
        }
    }
}

fn run(args: &Args) -> medialoom::Result<()> {
    let mode = match args.mode.as_str() {
        "vbr" => MuxMode::Vbr,
        "cbr" => MuxMode::Cbr,
        "capped" => MuxMode::Capped,
        other => {
            error!("unknown mode {other}");
            return Err(Error::Invalid);
        }
    };

    let mem = Arc::new(PoolAlloc::new(64, 256, 1 << 20));
    let packet_mgr = PacketMgr::new(256);
    let buf_mgr = BufMgr::block(mem.clone());

    // Application probe chain: provider at the top, logger terminating.
    let probe = ProbeChain::null()
        .push(LogProbe::new(LogLevel::Debug))
        .push(MemProviderProbe::new(mem, packet_mgr.clone()))
        .push(PrefixProbe::new("mux"));

    let mux = TsMux::mount(probe.clone());
    mux.control(Command::AttachPacketMgr(packet_mgr.clone()))?;
    mux.control_ext(&mut MuxSetOctetrate(args.octetrate))?;
    mux.control_ext(&mut MuxSetMode(mode))?;
    mux.control_ext(&mut MuxSetMtu(args.mtu))?;

    let file = File::create(&args.output).map_err(|_| Error::External)?;
    let sink = PipeHandle::mount(FileSink { file, bytes: 0 }, probe.clone());
    mux.set_output(&sink)?;

    // Video-ish stream: one access unit per frame, PCR carrier.
    let video = TsMux::alloc_input(&mux, probe.clone().push(PrefixProbe::new("video")))?;
    let mut video_def = flow::alloc_def(&packet_mgr, "block.mpeg2video.pic.")?;
    video_def.set_octetrate(args.octetrate * 3 / 4)?;
    video_def.set_ts_pid(256)?;
    video_def.set_pes_id(0xE0)?;
    video_def.set_pes_alignment()?;
    video_def.set_pcr()?;
    video.set_flow_def(video_def)?;

    // Audio-ish stream: small aggregated frames.
    let audio = TsMux::alloc_input(&mux, probe.clone().push(PrefixProbe::new("audio")))?;
    let mut audio_def = flow::alloc_def(&packet_mgr, "block.mp2.sound.")?;
    audio_def.set_octetrate(args.octetrate / 8)?;
    audio_def.set_ts_pid(257)?;
    audio_def.set_pes_id(0xC0)?;
    audio_def.set_pes_alignment()?;
    audio_def.set_pes_min_duration(FREQ / 25)?;
    audio.set_flow_def(audio_def)?;

    let frame_interval = FREQ / 25;
    let video_frame = (args.octetrate * 3 / 4 / 25) as usize;
    let audio_frame = (args.octetrate / 8 / 50) as usize;

    info!(
        seconds = args.seconds,
        octetrate = args.octetrate,
        "generating synthetic program"
    );
    let frames = args.seconds * 25;
    for i in 0..frames {
        let now = FREQ + i * frame_interval;

        let mut pkt = packet_mgr.alloc();
        let data: Vec<u8> = (0..video_frame).map(|b| (b + i as usize) as u8).collect();
        pkt.attach_buf(Buf::Block(buf_mgr.block_from_slice(&data)?));
        pkt.set_cr_prog(now);
        pkt.set_cr_sys(now);
        pkt.clock.cr_dts_delay = Some(FREQ / 2);
        pkt.clock.dts_pts_delay = Some(0);
        pkt.clock.duration = Some(frame_interval);
        pkt.set_start()?;
        if i % 25 == 0 {
            pkt.set_random()?;
        }
        video.input(pkt);

        for half in 0..2u64 {
            let mut pkt = packet_mgr.alloc();
            let data: Vec<u8> = (0..audio_frame).map(|b| (b ^ i as usize) as u8).collect();
            pkt.attach_buf(Buf::Block(buf_mgr.block_from_slice(&data)?));
            let at = now + half * frame_interval / 2;
            pkt.set_cr_prog(at);
            pkt.set_cr_sys(at);
            pkt.clock.cr_dts_delay = Some(FREQ / 2);
            pkt.clock.dts_pts_delay = Some(0);
            pkt.clock.duration = Some(frame_interval / 2);
            pkt.set_start()?;
            audio.input(pkt);
        }
    }

    mux.control_ext(&mut MuxFlush)?;
    info!(output = %args.output, "done");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(args.log.clone())
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("mux failed: {err}");
            ExitCode::FAILURE
        }
    }
}
