//! Realtime DMA pulse emitter.
//!
//! Owns a ring of control blocks and frame words in pinned pages and
//! feeds the DMA engine a paced chain of GPIO register writes. One
//! logical producer appends; the engine consumes autonomously, advancing
//! CONBLK_AD along the chain.
//!
//! The producer discipline:
//! 1. read CONBLK_AD to learn the engine position,
//! 2. only overwrite slots at least `safety_margin` behind it,
//! 3. write a new block with a zero next-pointer,
//! 4. publish it by patching the previous tail's NEXTCONBK — a single
//!    aligned 32-bit store, release-fenced so the engine can never read a
//!    half-written block through a live pointer.
//!
//! If the engine reaches a zero next-pointer while the producer still has
//! events, the move has missed its realtime budget: the emitter drives
//! every registered pin to its default state, resets the channel, and
//! reports [`EmitterError::RealtimeUnderrun`]. Underruns are fatal to the
//! job but recoverable to idle.

use std::sync::atomic::{fence, Ordering};

use thiserror::Error;
use tracing::{debug, info, warn};

use triad_common::config::DmaConfig;
use triad_common::consts::PAGE_SIZE;
use triad_common::io::deactivate_all;

use crate::chain::{CbTemplate, CbWrite, ChainSynth, GpioEvent};
use crate::devmem::DevMem;
use crate::dma::{
    ti_permap, ti_waits, CsFlags, DebugFlags, DmaChannel, DmaControlBlock, TiFlags, PERMAP_PWM,
};
use crate::error::RpioError;
use crate::gpio::{GPCLR0_BUS, GPSET0_BUS};
use crate::phys::PinnedPage;

/// Control blocks per pinned page.
const CBS_PER_PAGE: usize = PAGE_SIZE / 32;

/// Frame words per pinned page.
const FRAMES_PER_PAGE: usize = PAGE_SIZE / 4;

/// Frame words reserved at the start of frame page 0: a constant zero
/// source and a discard sink for padding blocks.
const RESERVED_FRAME_WORDS: usize = 2;

/// Word index of NEXTCONBK within a control block.
const CB_WORD_NEXTCONBK: usize = 5;

/// Emitter failure modes.
#[derive(Debug, Error)]
pub enum EmitterError {
    /// The engine caught up to the chain terminator mid-stream.
    #[error("realtime underrun: DMA engine reached the chain terminator mid-stream")]
    RealtimeUnderrun,

    /// The engine latched a read/FIFO error.
    #[error("DMA engine error: {0:?}")]
    DmaEngine(DebugFlags),

    /// Mapping or pinned-page failure.
    #[error(transparent)]
    Rpio(#[from] RpioError),
}

/// Ring distance from `from` to `to`, walking forward.
#[inline]
fn ring_distance(from: usize, to: usize, len: usize) -> usize {
    (to + len - from) % len
}

/// The DMA-driven GPIO pulse emitter.
pub struct PulseEmitter {
    chan: DmaChannel,
    synth: ChainSynth,
    slots: usize,
    margin: usize,
    cb_pages: Vec<PinnedPage>,
    frame_pages: Vec<PinnedPage>,
    /// Producer cursor: next slot to fill.
    next_slot: usize,
    /// Slot holding the current chain tail (NEXTCONBK == 0).
    tail: Option<usize>,
    /// Bus address of the chain head, kept until activation.
    head_bus: Option<u32>,
    /// Blocks appended since the chain was (re)created, before start.
    staged: usize,
    started: bool,
    scratch: Vec<CbTemplate>,
}

impl PulseEmitter {
    /// Claim a channel and allocate the ring. The channel is enabled,
    /// reset, and its debug error flags cleared; the engine stays idle
    /// until the first chain starts.
    pub fn new(
        devmem: &DevMem,
        periph_base_phys: u32,
        config: &DmaConfig,
    ) -> Result<Self, EmitterError> {
        let chan = DmaChannel::new(devmem, periph_base_phys, config.channel)?;

        let slots = config.ring_slots;
        let cb_page_count = slots.div_ceil(CBS_PER_PAGE);
        let frame_page_count = (slots + RESERVED_FRAME_WORDS).div_ceil(FRAMES_PER_PAGE);
        let mut cb_pages = Vec::with_capacity(cb_page_count);
        for _ in 0..cb_page_count {
            cb_pages.push(PinnedPage::new()?);
        }
        let mut frame_pages = Vec::with_capacity(frame_page_count);
        for _ in 0..frame_page_count {
            frame_pages.push(PinnedPage::new()?);
        }

        chan.enable();
        chan.reset();
        chan.clear_debug_flags();
        info!(
            channel = config.channel,
            slots,
            cb_pages = cb_page_count,
            frame_pages = frame_page_count,
            "pulse emitter ready"
        );

        Ok(Self {
            chan,
            synth: ChainSynth::new(config.tick_us),
            slots,
            margin: config.safety_margin_slots,
            cb_pages,
            frame_pages,
            next_slot: 0,
            tail: None,
            head_bus: None,
            staged: 0,
            started: false,
            scratch: Vec::new(),
        })
    }

    /// Pacing tick [µs].
    #[inline]
    pub fn tick_us(&self) -> u64 {
        self.synth.tick_us()
    }

    // ── Slot addressing ─────────────────────────────────────────────

    fn cb_bus(&self, slot: usize) -> u32 {
        self.cb_pages[slot / CBS_PER_PAGE].bus_addr((slot % CBS_PER_PAGE) * 32)
    }

    fn frame_location(slot: usize) -> (usize, usize) {
        let word = slot + RESERVED_FRAME_WORDS;
        (word / FRAMES_PER_PAGE, word % FRAMES_PER_PAGE)
    }

    fn frame_bus(&self, slot: usize) -> u32 {
        let (page, word) = Self::frame_location(slot);
        self.frame_pages[page].bus_addr(word * 4)
    }

    fn zero_word_bus(&self) -> u32 {
        self.frame_pages[0].bus_addr(0)
    }

    fn sink_word_bus(&self) -> u32 {
        self.frame_pages[0].bus_addr(4)
    }

    /// Map the engine's CONBLK_AD back to a ring slot.
    fn engine_slot(&self) -> Option<usize> {
        let ad = self.chan.conblk_ad();
        if ad == 0 {
            return None;
        }
        for (index, page) in self.cb_pages.iter().enumerate() {
            let base = page.bus_addr(0);
            if ad >= base && ad < base + PAGE_SIZE as u32 {
                return Some(index * CBS_PER_PAGE + (ad - base) as usize / 32);
            }
        }
        None
    }

    // ── Chain construction ──────────────────────────────────────────

    fn template_to_cb(&self, slot: usize, template: &CbTemplate) -> DmaControlBlock {
        let ti = (TiFlags::NO_WIDE_BURSTS | TiFlags::WAIT_RESP | TiFlags::DEST_DREQ).bits()
            | ti_permap(PERMAP_PWM)
            | ti_waits(template.waits);
        let (source_ad, dest_ad) = match template.write {
            CbWrite::Set(_) => (self.frame_bus(slot), GPSET0_BUS),
            CbWrite::Clear(_) => (self.frame_bus(slot), GPCLR0_BUS),
            CbWrite::Pad => (self.zero_word_bus(), self.sink_word_bus()),
        };
        let mut cb = DmaControlBlock::default();
        cb.ti = ti;
        cb.source_ad = source_ad;
        cb.dest_ad = dest_ad;
        cb.txfr_len = 4;
        cb
    }

    /// Append a batch of GPIO events to the live chain.
    pub fn append(&mut self, events: &[GpioEvent]) -> Result<(), EmitterError> {
        let mut templates = std::mem::take(&mut self.scratch);
        templates.clear();
        for event in events {
            self.synth.push(event, &mut templates);
        }
        let result = self.install(&templates);
        self.scratch = templates;
        result
    }

    /// Release the buffered final write and install it.
    pub fn flush(&mut self) -> Result<(), EmitterError> {
        let mut templates = std::mem::take(&mut self.scratch);
        templates.clear();
        self.synth.flush(&mut templates);
        let result = self.install(&templates);
        self.scratch = templates;
        result
    }

    fn install(&mut self, templates: &[CbTemplate]) -> Result<(), EmitterError> {
        for template in templates {
            self.wait_for_free_slot()?;

            let slot = self.next_slot;
            if let CbWrite::Set(mask) | CbWrite::Clear(mask) = template.write {
                let (page, word) = Self::frame_location(slot);
                self.frame_pages[page].write_u32(word, mask);
            }
            let cb = self.template_to_cb(slot, template);
            self.cb_pages[slot / CBS_PER_PAGE]
                .write_bytes((slot % CBS_PER_PAGE) * 32, &cb.to_bytes());

            // Publish: the block's content must be visible before any
            // live pointer can lead the engine to it.
            fence(Ordering::Release);
            match self.tail {
                Some(tail) => {
                    let word = (tail % CBS_PER_PAGE) * 8 + CB_WORD_NEXTCONBK;
                    self.cb_pages[tail / CBS_PER_PAGE].write_u32(word, self.cb_bus(slot));
                }
                None => self.head_bus = Some(self.cb_bus(slot)),
            }
            self.tail = Some(slot);
            self.next_slot = (slot + 1) % self.slots;
            if !self.started {
                self.staged += 1;
            } else if !self.chan.cs().contains(CsFlags::ACTIVE) {
                // Engine parked on the old terminator before the patch
                // landed: the stream missed its budget.
                return self.fail_underrun();
            }
        }
        Ok(())
    }

    /// Start the engine on the staged chain head.
    ///
    /// The caller is responsible for having configured the PWM pacer at
    /// the chain's tick rate first.
    pub fn start(&mut self) -> Result<(), EmitterError> {
        if self.started {
            return Ok(());
        }
        let Some(head) = self.head_bus else {
            return Ok(()); // nothing staged: an empty move
        };
        self.check_debug()?;
        self.chan.activate(head);
        self.started = true;
        debug!(staged = self.staged, "DMA chain started");
        Ok(())
    }

    /// Block until the engine has consumed the whole chain, then return
    /// the emitter to idle. Also used for cooperative aborts: the caller
    /// simply stops appending and the tail's zero next-pointer drains the
    /// engine naturally.
    pub fn drain(&mut self) -> Result<(), EmitterError> {
        self.flush()?;
        self.start()?;
        if self.started {
            while self.chan.cs().contains(CsFlags::ACTIVE) {
                self.check_debug()?;
                std::thread::yield_now();
            }
        }
        self.started = false;
        self.tail = None;
        self.head_bus = None;
        self.staged = 0;
        debug!("DMA chain drained");
        Ok(())
    }

    /// Halt everything and return the machine to a safe idle: pins to
    /// their declared defaults, channel reset.
    pub fn safe_halt(&mut self) {
        warn!("pulse emitter safe halt");
        deactivate_all();
        self.chan.reset();
        self.started = false;
        self.tail = None;
        self.head_bus = None;
        self.staged = 0;
    }

    // ── Producer pacing ─────────────────────────────────────────────

    fn wait_for_free_slot(&mut self) -> Result<(), EmitterError> {
        loop {
            self.check_debug()?;

            if !self.started {
                if self.staged + 1 < self.slots - self.margin {
                    return Ok(());
                }
                // Ring is as full as it may get while parked: start the
                // engine so it begins freeing slots behind itself.
                self.start()?;
                continue;
            }

            match self.engine_slot() {
                None => {
                    // CONBLK_AD reads zero: the engine hit the terminator
                    // while we still have blocks to hand it.
                    return self.fail_underrun();
                }
                Some(engine) => {
                    let in_flight = ring_distance(engine, self.next_slot, self.slots);
                    if self.slots - in_flight > self.margin {
                        return Ok(());
                    }
                }
            }
            // Busy-wait bounded by one pacing tick: the engine frees one
            // slot per tick.
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    fn check_debug(&mut self) -> Result<(), EmitterError> {
        let flags = self.chan.debug_flags();
        if flags.intersects(DebugFlags::READ_ERROR | DebugFlags::FIFO_ERROR) {
            self.safe_halt();
            return Err(EmitterError::DmaEngine(flags));
        }
        Ok(())
    }

    fn fail_underrun(&mut self) -> Result<(), EmitterError> {
        self.safe_halt();
        Err(EmitterError::RealtimeUnderrun)
    }
}

impl Drop for PulseEmitter {
    fn drop(&mut self) {
        // The pinned pages outlive any engine activity: stop the channel
        // before the ring is freed.
        self.chan.reset();
    }
}
