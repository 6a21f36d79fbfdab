//! Flow Definitions
//!
//! A flow definition is a packet without payload whose attributes describe
//! the shape of the data that will follow on a link: the `f.def` string
//! names the format as a dot-separated path of refinements
//! ("block.mpegts.", "block.h264.pic.", "sound.s16."), and typed
//! attributes carry the parameters. A pipe receives a flow definition
//! through `SetFlowDef` before any data and refuses packets until then.

use crate::error::{Error, Result};
use crate::packet::{Packet, PacketMgr};

/// Flow definition prefix of byte-stream flows
pub const FLOW_BLOCK: &str = "block.";
/// TS packets, one 188-byte packet per packet payload
pub const FLOW_MPEGTS: &str = "block.mpegts.";
/// Aggregated TS packets (N x 188 per payload)
pub const FLOW_MPEGTS_ALIGNED: &str = "block.mpegtsaligned.";
/// PSI sections to be packetized with a pointer_field
pub const FLOW_MPEGTS_PSI: &str = "block.mpegtspsi.";
/// RTP datagrams
pub const FLOW_RTP: &str = "block.rtp.";
/// Void flows (attributes only)
pub const FLOW_VOID: &str = "void.";

impl Packet {
    /// Whether this packet is a flow definition matching `prefix`
    ///
    /// A definition matches every prefix of itself that ends on a dot
    /// boundary, so `"block.mpegts."` matches `"block."`.
    pub fn flow_def_matches(&self, prefix: &str) -> bool {
        match self.attrs.string("f.def") {
            Ok(Some(def)) => def.starts_with(prefix),
            _ => false,
        }
    }

    /// The `f.def` format path
    pub fn flow_def(&self) -> Result<String> {
        self.attrs.string("f.def")?.ok_or(Error::Invalid)
    }

    /// Octet rate of a block flow (bytes per second)
    pub fn octetrate(&self) -> Option<u64> {
        self.attrs.unsigned("b.octetrate").ok().flatten()
    }

    /// Set the octet rate of a block flow
    pub fn set_octetrate(&mut self, v: u64) -> Result<()> {
        self.attrs.set_unsigned("b.octetrate", v)
    }

    /// Accumulated pipeline latency in ticks
    pub fn latency(&self) -> u64 {
        self.attrs.unsigned("k.latency").ok().flatten().unwrap_or(0)
    }

    /// Set the accumulated pipeline latency
    pub fn set_latency(&mut self, v: u64) -> Result<()> {
        self.attrs.set_unsigned("k.latency", v)
    }

    // Transport-stream flow parameters

    /// TS packet identifier (13 bits)
    pub fn ts_pid(&self) -> Option<u16> {
        self.attrs
            .unsigned("t.pid")
            .ok()
            .flatten()
            .and_then(|v| u16::try_from(v).ok())
            .filter(|&v| v < 0x2000)
    }

    /// Set the TS packet identifier
    pub fn set_ts_pid(&mut self, pid: u16) -> Result<()> {
        if pid >= 0x2000 {
            return Err(Error::Invalid);
        }
        self.attrs.set_unsigned("t.pid", u64::from(pid))
    }

    /// PES stream id
    pub fn pes_id(&self) -> Option<u8> {
        self.attrs.small_unsigned("t.pesid").ok().flatten()
    }

    /// Set the PES stream id
    pub fn set_pes_id(&mut self, id: u8) -> Result<()> {
        self.attrs.set_small_unsigned("t.pesid", id)
    }

    /// Whether every access unit must start a PES packet
    pub fn pes_alignment(&self) -> bool {
        self.attrs.has_void("t.pesalign")
    }

    /// Require access-unit alignment of PES packets
    pub fn set_pes_alignment(&mut self) -> Result<()> {
        self.attrs.set_void("t.pesalign")
    }

    /// Minimum duration a PES packet must aggregate (audio)
    pub fn pes_min_duration(&self) -> Option<u64> {
        self.attrs.unsigned("t.pesmindur").ok().flatten()
    }

    /// Set the minimum PES duration
    pub fn set_pes_min_duration(&mut self, v: u64) -> Result<()> {
        self.attrs.set_unsigned("t.pesmindur", v)
    }

    /// Transport-buffer leak rate (T-STD, bytes per second)
    pub fn tb_rate(&self) -> Option<u64> {
        self.attrs.unsigned("t.tbrate").ok().flatten()
    }

    /// Set the transport-buffer leak rate
    pub fn set_tb_rate(&mut self, v: u64) -> Result<()> {
        self.attrs.set_unsigned("t.tbrate", v)
    }

    /// Whether this PID carries the program clock reference
    pub fn is_pcr(&self) -> bool {
        self.attrs.has_void("t.pcr")
    }

    /// Mark this PID as the PCR carrier
    pub fn set_pcr(&mut self) -> Result<()> {
        self.attrs.set_void("t.pcr")
    }
}

/// Build a flow definition packet with the given format path
pub fn alloc_def(mgr: &PacketMgr, def: &str) -> Result<Packet> {
    let mut pkt = mgr.alloc();
    pkt.attrs.set_string("f.def", def)?;
    Ok(pkt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matching() {
        let mgr = PacketMgr::new(1);
        let def = alloc_def(&mgr, FLOW_MPEGTS).unwrap();
        assert!(def.flow_def_matches(FLOW_BLOCK));
        assert!(def.flow_def_matches(FLOW_MPEGTS));
        assert!(!def.flow_def_matches(FLOW_MPEGTS_ALIGNED));
        assert!(!def.flow_def_matches(FLOW_VOID));
    }

    #[test]
    fn ts_parameters() {
        let mgr = PacketMgr::new(1);
        let mut def = alloc_def(&mgr, FLOW_BLOCK).unwrap();
        def.set_octetrate(2206).unwrap();
        def.set_ts_pid(68).unwrap();
        def.set_pes_id(0xE0).unwrap();
        def.set_tb_rate(4412).unwrap();
        def.set_pes_alignment().unwrap();
        assert_eq!(def.octetrate(), Some(2206));
        assert_eq!(def.ts_pid(), Some(68));
        assert_eq!(def.pes_id(), Some(0xE0));
        assert_eq!(def.tb_rate(), Some(4412));
        assert!(def.pes_alignment());
        assert!(!def.is_pcr());
    }

    #[test]
    fn pid_range_enforced() {
        let mgr = PacketMgr::new(1);
        let mut def = alloc_def(&mgr, FLOW_BLOCK).unwrap();
        assert_eq!(def.set_ts_pid(0x2000).unwrap_err(), Error::Invalid);
    }

    #[test]
    fn latency_defaults_to_zero() {
        let mgr = PacketMgr::new(1);
        let mut def = alloc_def(&mgr, FLOW_BLOCK).unwrap();
        assert_eq!(def.latency(), 0);
        def.set_latency(100).unwrap();
        assert_eq!(def.latency(), 100);
    }
}
