//! Bin Pipe
//!
//! A bin wraps an internal chain of pipes behind a single handle: input
//! and attachments go to the head, output linkage and requests go to the
//! tail.

use crate::error::Result;
use crate::packet::Packet;
use crate::probe::ProbeChain;

use super::{Command, Pipe, PipeCtx, PipeHandle};

/// A pipe exposing an inner head-to-tail chain as one stage
pub struct BinPipe {
    head: PipeHandle,
    tail: PipeHandle,
}

impl BinPipe {
    /// Wrap an already linked chain
    ///
    /// The chain `head -> ... -> tail` must be wired by the caller; a
    /// single-pipe bin passes the same handle twice.
    pub fn new(head: PipeHandle, tail: PipeHandle) -> Self {
        Self { head, tail }
    }

    /// Mount with the given probe chain
    pub fn mount(head: PipeHandle, tail: PipeHandle, probe: ProbeChain) -> PipeHandle {
        PipeHandle::mount(Self::new(head, tail), probe)
    }
}

impl Pipe for BinPipe {
    fn input(&mut self, ctx: &mut PipeCtx, pkt: Packet) {
        self.head.input_from(pkt, ctx.producer.clone());
    }

    fn control(&mut self, _ctx: &mut PipeCtx, cmd: Command<'_>) -> Result<()> {
        match cmd {
            Command::SetOutput(output) => self.tail.set_output(&output),
            Command::GetOutput(slot) => {
                *slot = self.tail.output()?;
                Ok(())
            }
            Command::SetFlowDef(def) => self.head.set_flow_def(def),
            Command::GetFlowDef(slot) => {
                *slot = self.head.flow_def()?;
                Ok(())
            }
            Command::RegisterRequest(request) => {
                self.tail.control(Command::RegisterRequest(request))
            }
            Command::UnregisterRequest(id) => self.tail.unregister_request(id),
            // Attachments and options go to the head of the chain.
            cmd => self.head.control(cmd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::flow;
    use crate::packet::PacketMgr;
    use crate::pipe::helpers::OutputHelper;
    use crate::pipe::CollectSink;

    /// Forwards input untouched; the simplest inner stage
    struct Passthrough {
        output: OutputHelper,
    }

    impl Pipe for Passthrough {
        fn input(&mut self, ctx: &mut PipeCtx, pkt: Packet) {
            self.output.output_packet(ctx, pkt);
        }

        fn control(&mut self, ctx: &mut PipeCtx, cmd: Command<'_>) -> Result<()> {
            match cmd {
                Command::SetFlowDef(def) => {
                    self.output.store_flow_def(def);
                    Ok(())
                }
                Command::SetOutput(output) => {
                    self.output.set_output(ctx, output);
                    Ok(())
                }
                _ => Err(Error::Unhandled),
            }
        }
    }

    #[test]
    fn bin_forwards_through_inner_chain() {
        let inner = PipeHandle::mount(
            Passthrough {
                output: OutputHelper::new(),
            },
            ProbeChain::null(),
        );
        let bin = BinPipe::mount(inner.clone(), inner, ProbeChain::null());
        let (sink, collected) = CollectSink::mount();
        bin.set_output(&sink).unwrap();

        let mgr = PacketMgr::new(2);
        bin.set_flow_def(flow::alloc_def(&mgr, "block.").unwrap())
            .unwrap();
        bin.input(mgr.alloc());
        assert_eq!(collected.borrow().packets, 1);
        assert_eq!(collected.borrow().flow_defs, 1);
    }
}
