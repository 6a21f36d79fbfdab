//! Queue Pipes
//!
//! The data-plane crossing between two event loops: a [`QueueSink`] on the
//! producing loop pushes packets into a bounded SPSC ring, and the matching
//! queue source drains them on the consuming loop through a read pump on
//! the ring's wakeup fd. Ownership moves with the packet; only one side
//! ever touches it.
//!
//! Back-pressure: when the ring refuses a packet, the sink holds it and
//! blocks the producing pump; held packets are retried ahead of new input,
//! so ordering survives a stall.

use crate::error::{Error, Result};
use crate::evloop::{EvLoop, Pump};
use crate::packet::Packet;
use crate::probe::ProbeChain;
use crate::sync::{spsc_queue, SpscConsumer, SpscProducer};

use super::{Command, InputQueue, OutputHelper, Pipe, PipeCtx, PipeHandle};

/// Default ring capacity in packets
pub const DEFAULT_DEPTH: usize = 255;

/// Create a connected sink / source pair
///
/// The sink mounts on the producing loop; the returned [`QueueSourcePart`]
/// is `Send` and mounts on the consuming loop. Flow definitions travel
/// through the ring like data, so the source announces whatever the sink
/// last accepted.
pub fn queue_pair(depth: usize) -> Result<(QueueSink, QueueSourcePart)> {
    let (tx, rx) = spsc_queue::<QueueItem>(depth.max(1))?;
    Ok((
        QueueSink {
            tx,
            held: InputQueue::new(1),
            flow_def: None,
        },
        QueueSourcePart { rx },
    ))
}

/// What crosses the ring
enum QueueItem {
    /// A data packet
    Data(Packet),
    /// A new flow definition takes effect for everything after it
    FlowDef(Packet),
    /// The producer is done
    End,
}

/// Producing end: a sink pushing packets into the ring
pub struct QueueSink {
    tx: SpscProducer<QueueItem>,
    /// Packets held while the ring is full, with producer blockers
    held: InputQueue,
    flow_def: Option<Packet>,
}

impl QueueSink {
    /// Mount with a probe chain
    pub fn mount(self, probe: ProbeChain) -> PipeHandle {
        PipeHandle::mount(self, probe)
    }

    fn push(&mut self, ctx: &PipeCtx, item: QueueItem) -> bool {
        match self.tx.push(item) {
            Ok(()) => true,
            Err(item) => {
                match item {
                    QueueItem::Data(pkt) => {
                        // Hold the packet and stall the producer until the
                        // consumer catches up; retried on the next input.
                        self.held.hold(ctx, pkt);
                    }
                    QueueItem::FlowDef(_) | QueueItem::End => {
                        ctx.warn("queue full, dropping control item");
                        ctx.throw_error(Error::External);
                    }
                }
                false
            }
        }
    }

    fn retry_held(&mut self, ctx: &PipeCtx) {
        while let Some(pkt) = self.held.pop() {
            if let Err(QueueItem::Data(pkt)) = self.tx.push(QueueItem::Data(pkt)) {
                self.held.hold(ctx, pkt);
                return;
            }
        }
    }
}

impl Pipe for QueueSink {
    fn input(&mut self, ctx: &mut PipeCtx, pkt: Packet) {
        if self.flow_def.is_none() {
            ctx.warn("input before flow definition; dropping");
            return;
        }
        self.retry_held(ctx);
        if !self.held.is_empty() {
            // Still backed up: keep order, keep the pressure on.
            self.held.hold(ctx, pkt);
            return;
        }
        self.push(ctx, QueueItem::Data(pkt));
    }

    fn control(&mut self, ctx: &mut PipeCtx, cmd: Command<'_>) -> Result<()> {
        match cmd {
            Command::SetFlowDef(def) => {
                if self.push(ctx, QueueItem::FlowDef(def.dup())) {
                    self.flow_def = Some(def);
                    Ok(())
                } else {
                    Err(Error::External)
                }
            }
            Command::GetFlowDef(slot) => {
                *slot = self.flow_def.as_ref().map(Packet::dup);
                Ok(())
            }
            Command::Extension(ext) => {
                if ext.downcast_mut::<QueueEnd>().is_some() {
                    self.push(ctx, QueueItem::End);
                    return Ok(());
                }
                Err(Error::Unhandled)
            }
            _ => Err(Error::Unhandled),
        }
    }
}

/// Extension command: announce end of stream through the ring
pub struct QueueEnd;

/// The consuming half before it is mounted; `Send`, so it can move to the
/// consuming loop's thread
pub struct QueueSourcePart {
    rx: SpscConsumer<QueueItem>,
}

impl QueueSourcePart {
    /// Mount on the consuming loop; installs the drain pump
    pub fn mount(self, ev: &EvLoop, probe: ProbeChain) -> Result<PipeHandle> {
        let fd = self.rx.wake_fd();
        let handle = PipeHandle::mount(
            QueueSource {
                rx: self.rx,
                output: OutputHelper::new(),
                pump: None,
            },
            probe,
        );
        let weak = handle.downgrade();
        let pump = ev
            .alloc_read_pump(fd, move || {
                if let Some(handle) = weak.upgrade() {
                    let _ = handle.control_ext(&mut QueueDrain);
                }
            })
            .map_err(|_| Error::Upump)?;
        // Plumbing, not a reason to keep the loop spinning.
        pump.set_keepalive(false);
        pump.start();
        handle.control_ext(&mut InstallPump(Some(pump)))?;
        Ok(handle)
    }
}

/// Consuming end: drains the ring onto its output
struct QueueSource {
    rx: SpscConsumer<QueueItem>,
    output: OutputHelper,
    pump: Option<Pump>,
}

impl QueueSource {
    fn drain(&mut self, ctx: &PipeCtx) {
        self.rx.acknowledge();
        while let Some(item) = self.rx.pop() {
            match item {
                QueueItem::Data(pkt) => self.output.output_packet(ctx, pkt),
                QueueItem::FlowDef(def) => self.output.store_flow_def(def),
                QueueItem::End => {
                    let _ = ctx.throw(&mut crate::probe::Event::SourceEnd);
                    if let Some(pump) = &self.pump {
                        pump.stop();
                    }
                }
            }
        }
    }
}

/// Internal: pump drain trigger
struct QueueDrain;

/// Internal: hand the drain pump to the mounted source
struct InstallPump(Option<Pump>);

impl Pipe for QueueSource {
    fn input(&mut self, ctx: &mut PipeCtx, _pkt: Packet) {
        ctx.warn("queue source generates data; input dropped");
    }

    fn control(&mut self, ctx: &mut PipeCtx, cmd: Command<'_>) -> Result<()> {
        match cmd {
            Command::SetOutput(output) => {
                self.output.set_output(ctx, output);
                // Catch up on anything that arrived before the link.
                self.drain(ctx);
                Ok(())
            }
            Command::GetOutput(slot) => {
                *slot = self.output.output().cloned();
                Ok(())
            }
            Command::GetFlowDef(slot) => {
                *slot = self.output.flow_def().map(Packet::dup);
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
            Command::Extension(ext) => {
                if ext.downcast_mut::<QueueDrain>().is_some() {
                    self.drain(ctx);
                    return Ok(());
                }
                if let Some(install) = ext.downcast_mut::<InstallPump>() {
                    self.pump = install.0.take();
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
    use crate::flow;
    use crate::packet::PacketMgr;
    use crate::pipe::CollectSink;
    use std::time::Duration;

    fn settle(ev: &EvLoop) {
        let guard = ev
            .alloc_timer(Duration::from_millis(50), None, || {})
            .unwrap();
        guard.start();
        ev.run();
    }

    #[test]
    fn packets_cross_in_order() {
        let ev = EvLoop::new().unwrap();
        let (sink, part) = queue_pair(16).unwrap();
        let sink = sink.mount(ProbeChain::null());
        let source = part.mount(&ev, ProbeChain::null()).unwrap();
        let (collect, seen) = CollectSink::mount();
        source.set_output(&collect).unwrap();

        let mgr = PacketMgr::new(8);
        sink.set_flow_def(flow::alloc_def(&mgr, "block.").unwrap())
            .unwrap();
        for i in 0..5u64 {
            let mut pkt = mgr.alloc();
            pkt.set_cr_sys(i);
            sink.input(pkt);
        }
        sink.control_ext(&mut QueueEnd).unwrap();
        settle(&ev);

        let seen = seen.borrow();
        assert_eq!(seen.packets, 5);
        for (i, pkt) in seen.received.iter().enumerate() {
            assert_eq!(pkt.cr_sys(), Some(i as u64));
        }
        assert_eq!(seen.flow_defs, 1);
    }

    #[test]
    fn full_ring_holds_and_recovers() {
        let ev = EvLoop::new().unwrap();
        let (sink, part) = queue_pair(2).unwrap();
        let sink = sink.mount(ProbeChain::null());
        let mgr = PacketMgr::new(8);
        sink.set_flow_def(flow::alloc_def(&mgr, "block.").unwrap())
            .unwrap();

        // Capacity 2, one slot taken by the flow def: later packets are
        // held rather than lost.
        for i in 0..3u64 {
            let mut pkt = mgr.alloc();
            pkt.set_cr_sys(i);
            sink.input(pkt);
        }

        let source = part.mount(&ev, ProbeChain::null()).unwrap();
        let (collect, seen) = CollectSink::mount();
        source.set_output(&collect).unwrap();
        settle(&ev);
        assert!(seen.borrow().packets >= 1);

        // The next input retries the held packets first.
        let mut pkt = mgr.alloc();
        pkt.set_cr_sys(3);
        sink.input(pkt);
        settle(&ev);
        assert_eq!(seen.borrow().packets, 4);
        for (i, pkt) in seen.borrow().received.iter().enumerate() {
            assert_eq!(pkt.cr_sys(), Some(i as u64));
        }
    }
}
