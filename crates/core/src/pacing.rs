//! Real-time pacing and RTP timestamp assignment.
//!
//! The pacing thread pulls access units from a source, sleeps until each
//! unit's decode time comes due on the wall clock, packetizes it and hands
//! the packets to a [`PacketSink`].
//!
//! ## Timestamp continuity
//!
//! Source timestamps restart near zero every time a file loops. Each pass
//! therefore runs in its own [`PacingEpoch`], whose packet timestamp base is
//! one past the highest timestamp emitted by the previous pass:
//!
//! ```text
//! pass 0: base = random      ts = base + (pts - first_dts)
//! pass 1: base = max_0 + 1   ts = base + (pts - first_dts)
//! ```
//!
//! Clients see a single increasing timeline across restarts.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Result, RtspError};
use crate::media::Packetizer;
use crate::media::params::H264Parameters;
use crate::media::rtp::RtpPacket;
use crate::source::{EventSource, SourceEvent};

const CLOCK_RATE: u64 = 90_000;

/// Destination for paced packets.
///
/// Implementations must tolerate concurrent calls: the pacing thread and a
/// network publisher may write at the same time.
pub trait PacketSink: Send + Sync {
    /// Deliver one packet. [`RtspError::StreamClosed`] ends the pipeline.
    fn write_packet(&self, packet: &RtpPacket) -> Result<()>;
}

/// Timing reference for one pass over the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingEpoch {
    /// Wall-clock instant the first unit of the pass was released.
    pub started: Instant,
    /// Decode timestamp of that unit.
    pub first_dts: i64,
    /// Packet timestamp corresponding to `first_dts`.
    pub base: u32,
}

/// Converts source timestamps into sleep durations and RTP timestamps.
#[derive(Debug)]
pub struct Pacer {
    epoch: Option<PacingEpoch>,
    next_base: u32,
    /// Largest `pts - first_dts` emitted in the current epoch.
    max_offset: Option<i64>,
}

impl Pacer {
    pub fn new(initial_base: u32) -> Self {
        Self {
            epoch: None,
            next_base: initial_base,
            max_offset: None,
        }
    }

    pub fn with_random_base() -> Self {
        Self::new(rand::random::<u32>())
    }

    pub fn epoch(&self) -> Option<PacingEpoch> {
        self.epoch
    }

    /// How long to wait before releasing a unit with decode time `dts`.
    ///
    /// The first unit after construction or [`restart`](Self::restart)
    /// opens a new epoch at `now` and is released immediately. Units that
    /// are late are released immediately too; nothing is dropped.
    pub fn delay_until_due(&mut self, dts: i64, now: Instant) -> Duration {
        let epoch = match self.epoch {
            Some(epoch) => epoch,
            None => {
                let epoch = PacingEpoch {
                    started: now,
                    first_dts: dts,
                    base: self.next_base,
                };
                tracing::debug!(base = epoch.base, first_dts = dts, "pacing epoch started");
                self.epoch = Some(epoch);
                self.max_offset = None;
                return Duration::ZERO;
            }
        };
        let target = ticks_to_duration(dts - epoch.first_dts);
        let actual = now.saturating_duration_since(epoch.started);
        target.saturating_sub(actual)
    }

    /// Packet timestamp for a unit with presentation time `pts`.
    pub fn timestamp(&mut self, pts: i64) -> u32 {
        let Some(epoch) = self.epoch else {
            return self.next_base;
        };
        let offset = pts - epoch.first_dts;
        self.max_offset = Some(self.max_offset.map_or(offset, |m| m.max(offset)));
        epoch.base.wrapping_add(offset as u32)
    }

    /// Close the current epoch. The next one starts one tick past the
    /// highest timestamp emitted so far.
    pub fn restart(&mut self) {
        if let (Some(epoch), Some(max)) = (self.epoch, self.max_offset) {
            self.next_base = epoch.base.wrapping_add(max as u32).wrapping_add(1);
        }
        self.epoch = None;
        self.max_offset = None;
    }
}

fn ticks_to_duration(ticks: i64) -> Duration {
    if ticks <= 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(ticks as u64 * 1_000_000_000 / CLOCK_RATE)
}

/// Source → pacer → packetizer → sink.
pub struct Pipeline {
    packetizer: Box<dyn Packetizer>,
    pacer: Pacer,
    sink: Arc<dyn PacketSink>,
    parameters: Option<H264Parameters>,
}

impl Pipeline {
    pub fn new(packetizer: Box<dyn Packetizer>, pacer: Pacer, sink: Arc<dyn PacketSink>) -> Self {
        Self {
            packetizer,
            pacer,
            sink,
            parameters: None,
        }
    }

    /// Send SPS and PPS as their own access unit before the first frame,
    /// for sources that do not carry them in band.
    pub fn with_parameters(mut self, parameters: Option<H264Parameters>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Run until the sink closes or the source fails.
    ///
    /// A closed sink is the normal end of a stream and returns `Ok`. End of
    /// file never reaches here; sources turn it into [`SourceEvent::Restart`].
    pub fn run(mut self, source: &mut dyn EventSource) -> Result<()> {
        let mut units: u64 = 0;
        let mut passes: u64 = 0;
        loop {
            let unit = match source.next_event()? {
                SourceEvent::Restart => {
                    passes += 1;
                    self.pacer.restart();
                    tracing::info!(passes, units, "source restarted");
                    continue;
                }
                SourceEvent::AccessUnit(unit) => unit,
            };

            let wait = self.pacer.delay_until_due(unit.dts, Instant::now());
            if !wait.is_zero() {
                thread::sleep(wait);
            }
            let timestamp = self.pacer.timestamp(unit.pts);

            if let Some(params) = self.parameters.take() {
                tracing::debug!("sending parameter sets in band");
                let parameter_unit = [params.sps, params.pps];
                match self.send(&parameter_unit, timestamp) {
                    Err(RtspError::StreamClosed) => return Ok(()),
                    other => other?,
                }
            }

            match self.send(&unit.nalus, timestamp) {
                Err(RtspError::StreamClosed) => {
                    tracing::info!(units, "stream closed, pacing stopped");
                    return Ok(());
                }
                other => other?,
            }
            units += 1;
            if units % 900 == 0 {
                tracing::debug!(units, timestamp, "paced access units");
            }
        }
    }

    fn send(&mut self, nalus: &[Vec<u8>], timestamp: u32) -> Result<()> {
        for mut packet in self.packetizer.packetize(nalus) {
            packet.timestamp = timestamp;
            self.sink.write_packet(&packet)?;
        }
        Ok(())
    }
}
