//! Cross-loop transfer: commands travel to the remote loop, events come
//! back in order, and releasing the proxy destroys the remote pipe.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use medialoom::error::{Error, Result};
use medialoom::evloop::EvLoop;
use medialoom::packet::Packet;
use medialoom::pipe::{Command, Pipe, PipeCtx, PipeHandle};
use medialoom::probe::{Event, Probe, ProbeChain, ProbeVerdict};
use medialoom::xfer::XferMgr;

/// Sends event names over a channel; usable from any thread
struct EventTap {
    tx: mpsc::Sender<String>,
}

impl Probe for EventTap {
    fn catch(&self, event: &mut Event<'_>) -> Result<ProbeVerdict> {
        let name = match event {
            Event::Ready => "ready",
            Event::Dead => "dead",
            Event::SourceEnd => "source_end",
            Event::Log(msg) => {
                let _ = self.tx.send(format!("log:{}", msg.message));
                return Ok(ProbeVerdict::Handled);
            }
            _ => return Ok(ProbeVerdict::Pass),
        };
        let _ = self.tx.send(name.to_owned());
        Ok(ProbeVerdict::Handled)
    }
}

/// Stand-in source: records URIs, announces end of stream per URI
struct Fileish {
    uris: Rc<RefCell<Vec<String>>>,
}

impl Pipe for Fileish {
    fn input(&mut self, _ctx: &mut PipeCtx, _pkt: Packet) {}

    fn control(&mut self, ctx: &mut PipeCtx, cmd: Command<'_>) -> Result<()> {
        match cmd {
            Command::SetUri(uri) => {
                self.uris.borrow_mut().push(uri.to_owned());
                ctx.notice(format!("opened {uri}"));
                let _ = ctx.throw(&mut Event::SourceEnd);
                Ok(())
            }
            Command::AttachEvLoop(_) => Ok(()),
            _ => Err(Error::Unhandled),
        }
    }
}

/// Drive the local loop until `pred` or the deadline
fn drive_until(local: &EvLoop, rx: &mpsc::Receiver<String>, seen: &mut Vec<String>, want: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.len() < want && Instant::now() < deadline {
        let tick = local
            .alloc_timer(Duration::from_millis(5), None, || {})
            .unwrap();
        tick.start();
        local.run();
        while let Ok(name) = rx.try_recv() {
            seen.push(name);
        }
    }
}

#[test]
fn transfer_set_uri_and_events_round_trip() {
    let (worker, remote) = EvLoop::spawn_thread("xfer-worker", |_| {}).unwrap();
    let local = EvLoop::new().unwrap();
    let mgr = XferMgr::new(&local, &remote).unwrap();

    let (tx, rx) = mpsc::channel();
    let probe = ProbeChain::null().push(EventTap { tx });

    let proxy = mgr
        .transfer(
            |_ev, remote_probe| {
                PipeHandle::mount(
                    Fileish {
                        uris: Rc::new(RefCell::new(Vec::new())),
                    },
                    remote_probe,
                )
            },
            probe,
        )
        .unwrap();

    // Anything outside the transferable subset is refused locally.
    assert_eq!(
        proxy.control(Command::SetOption("k", "v")).unwrap_err(),
        Error::Unhandled
    );

    proxy.control(Command::SetUri("file:/tmp/x")).unwrap();

    let mut seen = Vec::new();
    // proxy ready (local, synchronous), remote ready, the open log and
    // the source_end echo.
    drive_until(&local, &rx, &mut seen, 4);

    assert_eq!(seen.iter().filter(|s| *s == "ready").count(), 2);
    assert!(seen.contains(&"log:opened file:/tmp/x".to_owned()));
    assert!(seen.contains(&"source_end".to_owned()));
    // Ordering per direction: the remote ready precedes the echo.
    let ready_pos = seen.iter().rposition(|s| s == "ready").unwrap();
    let end_pos = seen.iter().position(|s| s == "source_end").unwrap();
    assert!(ready_pos < end_pos);

    // Releasing the proxy destroys the remote pipe; its Dead comes back.
    drop(proxy);
    drive_until(&local, &rx, &mut seen, 5);
    assert!(seen.contains(&"dead".to_owned()));

    remote.shutdown().unwrap();
    worker.join().unwrap();
}

#[test]
fn output_linkage_between_proxies() {
    let (worker, remote) = EvLoop::spawn_thread("xfer-linker", |_| {}).unwrap();
    let local = EvLoop::new().unwrap();
    let mgr = XferMgr::new(&local, &remote).unwrap();

    let (tx, rx) = mpsc::channel();
    let (tx2, _rx2) = mpsc::channel();

    let source = mgr
        .transfer(
            |_ev, p| {
                PipeHandle::mount(
                    Fileish {
                        uris: Rc::new(RefCell::new(Vec::new())),
                    },
                    p,
                )
            },
            ProbeChain::null().push(EventTap { tx }),
        )
        .unwrap();
    let sink = mgr
        .transfer(
            |_ev, p| {
                PipeHandle::mount(
                    Fileish {
                        uris: Rc::new(RefCell::new(Vec::new())),
                    },
                    p,
                )
            },
            ProbeChain::null().push(EventTap { tx: tx2 }),
        )
        .unwrap();

    // Linking two proxies of the same manager crosses; a foreign pipe
    // does not.
    source.set_output(&sink).unwrap();
    let stranger = PipeHandle::mount(
        Fileish {
            uris: Rc::new(RefCell::new(Vec::new())),
        },
        ProbeChain::null(),
    );
    assert_eq!(source.set_output(&stranger).unwrap_err(), Error::Invalid);

    let mut seen = Vec::new();
    drive_until(&local, &rx, &mut seen, 2);

    drop(source);
    drop(sink);
    remote.shutdown().unwrap();
    worker.join().unwrap();
}
