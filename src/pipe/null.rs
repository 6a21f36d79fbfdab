//! Null and Collecting Sinks
//!
//! [`NullSink`] terminates a graph: it accepts any flow definition and
//! frees everything pushed at it, optionally dumping packet summaries at
//! debug level. [`CollectSink`] additionally keeps what it receives, which
//! is what tests and the demo binary look at.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::probe::ProbeChain;

use super::{Command, Pipe, PipeCtx, PipeHandle};

/// Sink that counts and frees its input
pub struct NullSink {
    flow_def: Option<Packet>,
    packets: u64,
    dump: bool,
}

impl NullSink {
    /// Create a silent null sink
    pub fn new() -> Self {
        Self {
            flow_def: None,
            packets: 0,
            dump: false,
        }
    }

    /// Create a null sink dumping a line per packet at debug level
    pub fn dumping() -> Self {
        Self {
            dump: true,
            ..Self::new()
        }
    }

    /// Mount with the given probe chain
    pub fn mount(probe: ProbeChain) -> PipeHandle {
        PipeHandle::mount(Self::new(), probe)
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipe for NullSink {
    fn input(&mut self, ctx: &mut PipeCtx, pkt: Packet) {
        self.packets += 1;
        if self.dump {
            ctx.debug(format!("dropping {pkt:?} ({} so far)", self.packets));
        }
    }

    fn control(&mut self, _ctx: &mut PipeCtx, cmd: Command<'_>) -> Result<()> {
        match cmd {
            Command::SetFlowDef(def) => {
                self.flow_def = Some(def);
                Ok(())
            }
            Command::GetFlowDef(slot) => {
                *slot = self.flow_def.as_ref().map(Packet::dup);
                Ok(())
            }
            _ => Err(Error::Unhandled),
        }
    }
}

/// What a [`CollectSink`] has seen so far
#[derive(Default)]
pub struct Collected {
    /// Packets received, in arrival order
    pub received: Vec<Packet>,
    /// Number of data packets
    pub packets: usize,
    /// Number of flow definitions announced
    pub flow_defs: usize,
}

/// Sink keeping everything it receives, for tests and demos
pub struct CollectSink {
    collected: Rc<RefCell<Collected>>,
}

impl CollectSink {
    /// Mount a collector and return the handle plus its store
    pub fn mount() -> (PipeHandle, Rc<RefCell<Collected>>) {
        let collected = Rc::new(RefCell::new(Collected::default()));
        let pipe = PipeHandle::mount(
            Self {
                collected: Rc::clone(&collected),
            },
            ProbeChain::null(),
        );
        (pipe, collected)
    }
}

impl Pipe for CollectSink {
    fn input(&mut self, _ctx: &mut PipeCtx, pkt: Packet) {
        let mut collected = self.collected.borrow_mut();
        collected.packets += 1;
        collected.received.push(pkt);
    }

    fn control(&mut self, _ctx: &mut PipeCtx, cmd: Command<'_>) -> Result<()> {
        match cmd {
            Command::SetFlowDef(_) => {
                self.collected.borrow_mut().flow_defs += 1;
                Ok(())
            }
            _ => Err(Error::Unhandled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketMgr;

    #[test]
    fn null_sink_swallows() {
        let pipe = NullSink::mount(ProbeChain::null());
        let mgr = PacketMgr::new(2);
        pipe.set_flow_def(crate::flow::alloc_def(&mgr, "void.").unwrap())
            .unwrap();
        pipe.input(mgr.alloc());
        pipe.input(mgr.alloc());
        assert!(pipe.flow_def().unwrap().is_some());
    }

    #[test]
    fn collector_keeps_packets() {
        let (pipe, collected) = CollectSink::mount();
        let mgr = PacketMgr::new(2);
        let mut pkt = mgr.alloc();
        pkt.set_cr_sys(42);
        pipe.input(pkt);
        assert_eq!(collected.borrow().packets, 1);
        assert_eq!(collected.borrow().received[0].cr_sys(), Some(42));
    }
}
