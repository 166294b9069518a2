//! GPIO-event → control-block chain synthesis.
//!
//! Pure planning layer between the merged step stream and the DMA ring.
//! Every meaningful write is one paced 4-byte transfer to GPSET0 or
//! GPCLR0; under DREQ pacing each transfer consumes one tick, and the
//! WAITS field of a block absorbs up to 31 further idle ticks. Gaps
//! longer than that fall back to padding blocks that write to a discard
//! sink, one pacing tick each.
//!
//! The synthesis is stateful across pushes so a single chain can span
//! many event batches; [`replay`] simulates the paced timeline for tests.

use crate::dma::MAX_WAITS;

/// One scheduled pair of GPIO register writes.
///
/// A step event lowers to two of these: pulse-high at `t` and pulse-low
/// at `t + PULSE_WIDTH_US`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpioEvent {
    /// Absolute schedule time [µs].
    pub time_us: u64,
    /// Bits to write to GPSET0 (0 = nothing to set).
    pub set_mask: u32,
    /// Bits to write to GPCLR0 (0 = nothing to clear).
    pub clear_mask: u32,
}

/// Target of one synthesized control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbWrite {
    /// Write the mask to GPSET0.
    Set(u32),
    /// Write the mask to GPCLR0.
    Clear(u32),
    /// Idle filler: write to the discard sink.
    Pad,
}

/// One control block, described abstractly: what it writes and how many
/// idle ticks follow its (one-tick) transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbTemplate {
    pub write: CbWrite,
    /// Inter-transfer WAITS ticks after this block, 0..=31.
    pub waits: u32,
}

/// Streaming synthesizer of paced control-block chains.
///
/// Blocks are emitted one event late: a block's trailing WAITS depends on
/// the next event's time, so the most recent write is buffered until its
/// successor arrives (or [`ChainSynth::flush`] ends the chain).
///
/// The buffered entry carries the *realized* tick of its transfer, which
/// can trail the quantized schedule when several writes contend for one
/// tick (each transfer occupies a pacing slot). Gaps are measured from
/// the realized position, so contention displacement is absorbed by the
/// next idle stretch instead of drifting the rest of the chain.
#[derive(Debug)]
pub struct ChainSynth {
    tick_us: u64,
    /// (realized tick, write) of the buffered block.
    pending: Option<(u64, CbWrite)>,
}

impl ChainSynth {
    pub fn new(tick_us: u64) -> Self {
        debug_assert!(tick_us > 0);
        Self {
            tick_us,
            pending: None,
        }
    }

    /// Pacing tick [µs].
    #[inline]
    pub const fn tick_us(&self) -> u64 {
        self.tick_us
    }

    /// Quantize an absolute schedule time to pacing ticks.
    #[inline]
    fn tick_of(&self, time_us: u64) -> u64 {
        (time_us + self.tick_us / 2) / self.tick_us
    }

    /// Append one event's writes to the chain.
    pub fn push(&mut self, event: &GpioEvent, out: &mut Vec<CbTemplate>) {
        let tick = self.tick_of(event.time_us);
        if event.set_mask != 0 {
            self.emit(tick, CbWrite::Set(event.set_mask), out);
        }
        if event.clear_mask != 0 {
            self.emit(tick, CbWrite::Clear(event.clear_mask), out);
        }
    }

    /// Release the buffered final write. The chain is complete once the
    /// caller terminates the last block's next-pointer.
    pub fn flush(&mut self, out: &mut Vec<CbTemplate>) {
        if let Some((_, write)) = self.pending.take() {
            out.push(CbTemplate { write, waits: 0 });
        }
    }

    fn emit(&mut self, tick: u64, write: CbWrite, out: &mut Vec<CbTemplate>) {
        let Some((prev_realized, prev_write)) = self.pending.take() else {
            self.pending = Some((tick, write));
            return;
        };

        // The previous block's transfer consumes one tick; this write
        // lands on its own tick or the next free slot, whichever is
        // later. The rest of the gap is idle time.
        let realized = tick.max(prev_realized + 1);
        let mut idle = realized - prev_realized - 1;

        let waits = idle.min(MAX_WAITS as u64);
        idle -= waits;
        out.push(CbTemplate {
            write: prev_write,
            waits: waits as u32,
        });

        // Padding blocks each consume one tick and may carry WAITS of
        // their own.
        while idle > 0 {
            let pad_waits = (idle - 1).min(MAX_WAITS as u64);
            out.push(CbTemplate {
                write: CbWrite::Pad,
                waits: pad_waits as u32,
            });
            idle -= 1 + pad_waits;
        }

        self.pending = Some((realized, write));
    }
}

/// Simulate the paced timeline of a chain.
///
/// Returns each meaningful write with the time [µs] at which the engine
/// performs it, taking the first block's transfer as t = 0. Used by the
/// chain timing tests; padding blocks advance time but produce nothing.
pub fn replay(templates: &[CbTemplate], tick_us: u64) -> Vec<(u64, CbWrite)> {
    let mut ticks: u64 = 0;
    let mut writes = Vec::new();
    for template in templates {
        if !matches!(template.write, CbWrite::Pad) {
            writes.push((ticks * tick_us, template.write));
        }
        ticks += 1 + template.waits as u64;
    }
    writes
}
