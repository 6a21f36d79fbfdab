//! Dejitter Probe
//!
//! Live sources observe the sender's clock through a jittery channel.
//! This probe averages `ClockRef` observations into a smoothed
//! program-to-system offset and uses it to stamp system dates onto
//! packets that only carry program dates (`ClockTs`).

use std::cell::RefCell;
use std::collections::VecDeque;

use crate::error::Result;
use crate::packet::{DateAxis, DateKind};

use super::{Event, Probe, ProbeVerdict};

/// Default window of clock references averaged over
const DEFAULT_DIVIDER: usize = 100;

struct State {
    /// Recent (systime - prog) offsets
    offsets: VecDeque<i64>,
    sum: i64,
}

/// Smooths clock references and derives system dates
pub struct DejitterProbe {
    window: usize,
    state: RefCell<State>,
}

impl DejitterProbe {
    /// Create a dejitter probe averaging over `window` references
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            state: RefCell::new(State {
                offsets: VecDeque::new(),
                sum: 0,
            }),
        }
    }

    /// Probe with the default window
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_DIVIDER)
    }

    fn push_ref(&self, systime: u64, prog: u64, discontinuity: bool) {
        let mut state = self.state.borrow_mut();
        if discontinuity {
            state.offsets.clear();
            state.sum = 0;
        }
        let offset = systime as i64 - prog as i64;
        state.offsets.push_back(offset);
        state.sum += offset;
        if state.offsets.len() > self.window {
            let old = state.offsets.pop_front().expect("non-empty");
            state.sum -= old;
        }
    }

    fn offset(&self) -> Option<i64> {
        let state = self.state.borrow();
        if state.offsets.is_empty() {
            return None;
        }
        Some(state.sum / state.offsets.len() as i64)
    }
}

impl Probe for DejitterProbe {
    fn catch(&self, event: &mut Event<'_>) -> Result<ProbeVerdict> {
        match event {
            Event::ClockRef {
                systime,
                prog,
                discontinuity,
            } => {
                self.push_ref(*systime, *prog, *discontinuity);
                Ok(ProbeVerdict::Handled)
            }
            Event::ClockTs(pkt) => {
                let Some(offset) = self.offset() else {
                    // No reference yet: let an upper probe try.
                    return Ok(ProbeVerdict::Pass);
                };
                for kind in [DateKind::Cr, DateKind::Dts, DateKind::Pts] {
                    if let Some(prog) = pkt.clock.date(DateAxis::Prog, kind) {
                        let sys = prog as i64 + offset;
                        if sys >= 0 {
                            pkt.clock.set_date(DateAxis::Sys, sys as u64, kind);
                        }
                        break;
                    }
                }
                Ok(ProbeVerdict::Handled)
            }
            _ => Ok(ProbeVerdict::Pass),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FREQ;
    use crate::packet::Packet;
    use crate::probe::ProbeChain;

    #[test]
    fn averages_jitter() {
        let probe = DejitterProbe::new(4);
        // Offsets 1000, 1002, 998, 1000: mean 1000.
        for (prog, jitter) in [(0i64, 0i64), (100, 2), (200, -2), (300, 0)] {
            probe.push_ref((prog + 1000 + jitter) as u64, prog as u64, false);
        }
        assert_eq!(probe.offset(), Some(1000));
    }

    #[test]
    fn stamps_sys_dates() {
        let chain = ProbeChain::null().push(DejitterProbe::new(8));
        chain
            .throw(&mut Event::ClockRef {
                systime: 5 * FREQ,
                prog: FREQ,
                discontinuity: false,
            })
            .unwrap();
        let mut pkt = Packet::new();
        pkt.set_dts_prog(2 * FREQ);
        chain.throw(&mut Event::ClockTs(&mut pkt)).unwrap();
        assert_eq!(pkt.dts_sys(), Some(6 * FREQ));
    }

    #[test]
    fn discontinuity_resets() {
        let probe = DejitterProbe::new(8);
        probe.push_ref(1000, 0, false);
        probe.push_ref(9000, 1000, true);
        assert_eq!(probe.offset(), Some(8000));
    }
}
