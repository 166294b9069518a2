//! Machine assembly and motion orchestration.
//!
//! Wires the coordinate map, the step planners, the DMA pulse emitter and
//! the temperature loop into one machine. The motion producer (this
//! thread) feeds merged step events into the emitter with a bounded
//! lookahead so endstop polls stay close to realtime; the temperature
//! loop runs on its own thread and owns the heater and thermistor pins
//! exclusively.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::mpsc::{self, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use triad_common::config::MachineConfig;
use triad_common::consts::{ENDSTOP_POLL_US, NUM_AXES, NUM_TOWERS};
use triad_common::io::{deactivate_all, DefaultState, IoPin, Level, PinSpec};
use triad_motion::homing::{check_endstops_clear, EndstopInput};
use triad_motion::{
    BedLevelMatrix, CarriagePosition, DeltaMap, EventMerger, GeometryError, HomingMonitor, Move,
    MoveLimits, MotionError, Position, StepEvent,
};
use triad_rpio::gpio::GpioPin;
use triad_rpio::pwm::PwmPacer;
use triad_rpio::{
    DevMem, EmitterError, Gpio, GpioEvent, PulseEmitter, RpioError, SystemTimer, PERIPH_BASE_PHYS,
};
use triad_thermal::{RcThermistor, RcThermistorParams, TempControl};

use crate::stepdir::StepDirDriver;

/// How far ahead of realtime the producer schedules events [µs]. Bounds
/// both ring occupancy and endstop-reaction overshoot.
const LOOKAHEAD_US: u64 = 50_000;

/// PWM source clock assumed from firmware bring-up [Hz].
const PWM_CLOCK_HZ: u64 = 100_000_000;

/// Top-level machine failures.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Motion(#[from] MotionError),

    #[error(transparent)]
    Emitter(#[from] EmitterError),

    #[error(transparent)]
    Rpio(#[from] RpioError),

    #[error("machine must home before its first move")]
    NotHomed,

    #[error("homing travel exhausted before all endstops asserted")]
    HomingFailed,
}

enum TempCommand {
    SetTarget(f64),
    Shutdown,
}

// ─── Time-ordered GPIO event buffer ─────────────────────────────────

/// Lowered GPIO events are not globally time-sorted (a step's falling
/// edge can postdate the next axis's rising edge), so they pass through
/// a small reorder buffer. An event may be released once the stream has
/// advanced past its time: later step events can only produce later GPIO
/// events.
struct QueuedWrite {
    time_us: u64,
    seq: u64,
    event: GpioEvent,
}

impl PartialEq for QueuedWrite {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueuedWrite {}

impl PartialOrd for QueuedWrite {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedWrite {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Min-heap on (time, insertion order).
        (other.time_us, other.seq).cmp(&(self.time_us, self.seq))
    }
}

#[derive(Default)]
struct EventQueue {
    heap: BinaryHeap<QueuedWrite>,
    seq: u64,
}

impl EventQueue {
    fn push(&mut self, event: GpioEvent) {
        self.seq += 1;
        self.heap.push(QueuedWrite {
            time_us: event.time_us,
            seq: self.seq,
            event,
        });
    }

    fn drain_up_to(&mut self, limit_us: u64, out: &mut Vec<GpioEvent>) {
        while self
            .heap
            .peek()
            .is_some_and(|queued| queued.time_us <= limit_us)
        {
            out.push(self.heap.pop().expect("peeked").event);
        }
    }

    fn drain_all(&mut self, out: &mut Vec<GpioEvent>) {
        while let Some(queued) = self.heap.pop() {
            out.push(queued.event);
        }
    }
}

// ─── Stream supervision ─────────────────────────────────────────────

enum StreamMonitor<'a, 'b> {
    /// Homing: latch towers as their endstops assert.
    Homing(&'a mut HomingMonitor<'b>),
    /// Normal motion: any endstop assertion aborts the job.
    Normal(&'a mut [IoPin; NUM_TOWERS]),
}

/// Pump a merged step stream into the emitter with bounded lookahead,
/// polling endstops between appends.
fn run_stream(
    emitter: &mut PulseEmitter,
    timer: &SystemTimer,
    drivers: &mut [StepDirDriver; NUM_AXES],
    merger: &mut EventMerger,
    mut monitor: StreamMonitor<'_, '_>,
) -> Result<(), MachineError> {
    let mut queue = EventQueue::default();
    let mut batch: Vec<GpioEvent> = Vec::new();
    let mut lowered: Vec<GpioEvent> = Vec::new();
    let t0 = timer.now_us();
    let mut pending: Option<StepEvent> = merger.next();

    loop {
        // Top up the pipeline within the lookahead window.
        let now = timer.now_us();
        while let Some(event) = pending {
            if t0 + event.time_us > now + LOOKAHEAD_US {
                break;
            }
            if let StreamMonitor::Homing(homing) = &mut monitor {
                homing.observe(&event);
            }
            lowered.clear();
            drivers[event.axis].lower(&event, 0, &mut lowered);
            for write in lowered.drain(..) {
                queue.push(write);
            }
            queue.drain_up_to(event.time_us, &mut batch);
            if !batch.is_empty() {
                emitter.append(&batch)?;
                batch.clear();
            }
            pending = merger.next();
        }
        emitter.start()?;

        match &mut monitor {
            StreamMonitor::Homing(homing) => {
                for tower in homing.poll() {
                    merger.remove_axis(tower);
                    if pending.is_some_and(|ev| ev.axis == tower) {
                        pending = merger.next();
                    }
                }
                if homing.is_complete() {
                    break;
                }
            }
            StreamMonitor::Normal(endstops) => {
                for (axis, endstop) in endstops.iter_mut().enumerate() {
                    if endstop.triggered() {
                        // Cooperative abort is not enough here: stop the
                        // chain and park everything safe.
                        emitter.safe_halt();
                        return Err(MotionError::UnexpectedEndstop { axis }.into());
                    }
                }
            }
        }

        if pending.is_none() {
            break;
        }
        std::thread::sleep(Duration::from_micros(ENDSTOP_POLL_US));
    }

    // Play out buffered falling edges, then let the chain drain through
    // its terminator.
    queue.drain_all(&mut batch);
    if !batch.is_empty() {
        emitter.append(&batch)?;
        batch.clear();
    }
    emitter.drain()?;
    Ok(())
}

// ─── Machine ────────────────────────────────────────────────────────

/// The assembled machine.
pub struct Machine {
    config: MachineConfig,
    map: DeltaMap,
    limits: MoveLimits,
    timer: Arc<SystemTimer>,
    pwm: PwmPacer,
    emitter: PulseEmitter,
    drivers: [StepDirDriver; NUM_AXES],
    /// Step/dir lines as registered pins, for safe shutdown only; the
    /// emitter drives them via DMA.
    _pulse_pins: Vec<IoPin>,
    enable: IoPin,
    fan: IoPin,
    endstops: [IoPin; NUM_TOWERS],
    temp_tx: Sender<TempCommand>,
    temp_thread: Option<JoinHandle<()>>,
    position: CarriagePosition,
    homed: bool,
}

impl Machine {
    /// Bring up the hardware from a validated configuration.
    pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
        let bed_level = config
            .bed_level
            .map(BedLevelMatrix::from_rows)
            .unwrap_or_default();
        let map = DeltaMap::new(&config.geometry, bed_level);
        let limits = MoveLimits::from(&config.motion);

        let devmem = DevMem::open()?;
        let gpio = Arc::new(Gpio::new(&devmem, PERIPH_BASE_PHYS)?);
        let timer = Arc::new(SystemTimer::new(&devmem, PERIPH_BASE_PHYS)?);
        let pwm = PwmPacer::new(&devmem, PERIPH_BASE_PHYS)?;
        pwm.configure((PWM_CLOCK_HZ * config.dma.tick_us / 1_000_000) as u32);
        let emitter = PulseEmitter::new(&devmem, PERIPH_BASE_PHYS, &config.dma)?;

        // Step and dir lines idle low and return there at shutdown.
        let mut pulse_pins = Vec::new();
        let all_pairs = config
            .pins
            .towers
            .iter()
            .chain(std::iter::once(&config.pins.extruder));
        for pins in all_pairs {
            for line in [pins.step, pins.dir] {
                let mut pin = IoPin::new(
                    PinSpec::plain(line),
                    GpioPin::new(Arc::clone(&gpio), line),
                );
                pin.make_output(Level::Low);
                pulse_pins.push(pin);
            }
        }
        let drivers = std::array::from_fn(|axis| {
            let pins = if axis < NUM_TOWERS {
                &config.pins.towers[axis]
            } else {
                &config.pins.extruder
            };
            StepDirDriver::new(axis, pins)
        });

        let mut enable = IoPin::new(
            config.pins.enable,
            GpioPin::new(Arc::clone(&gpio), config.pins.enable.pin),
        );
        enable.make_output(Level::Low);

        let endstops = std::array::from_fn(|tower| {
            let endstop = &config.pins.endstops[tower];
            let spec = PinSpec {
                pin: endstop.pin,
                invert_reads: endstop.invert,
                invert_writes: false,
                default_state: DefaultState::HighZ,
            };
            let mut pin = IoPin::new(spec, GpioPin::new(Arc::clone(&gpio), endstop.pin));
            pin.make_input();
            gpio.set_pull(endstop.pin, endstop.pull);
            pin
        });

        let mut fan = IoPin::new(
            config.pins.fan,
            GpioPin::new(Arc::clone(&gpio), config.pins.fan.pin),
        );
        fan.make_output(Level::Low);

        let hotend = IoPin::new(
            config.pins.hotend,
            GpioPin::new(Arc::clone(&gpio), config.pins.hotend.pin),
        );
        let therm_spec = PinSpec {
            pin: config.pins.thermistor,
            invert_reads: false,
            invert_writes: false,
            default_state: DefaultState::HighZ,
        };
        let therm_pin = IoPin::new(
            therm_spec,
            GpioPin::new(Arc::clone(&gpio), config.pins.thermistor),
        );
        let therm = RcThermistor::new(therm_pin, RcThermistorParams::from(&config.thermal));
        let control = TempControl::new(therm, hotend, &config.thermal);
        let (temp_tx, temp_rx) = mpsc::channel();
        let temp_thread = spawn_temp_loop(control, Arc::clone(&timer), temp_rx);

        let position = map.homed_carriages();
        info!("machine assembled");
        Ok(Self {
            config,
            map,
            limits,
            timer,
            pwm,
            emitter,
            drivers,
            _pulse_pins: pulse_pins,
            enable,
            fan,
            endstops,
            temp_tx,
            temp_thread: Some(temp_thread),
            position,
            homed: false,
        })
    }

    /// Current effector position from the carriage state.
    pub fn position(&self) -> Position {
        self.map.cartesian_for(&self.position)
    }

    /// Whether the machine has homed since power-up.
    #[inline]
    pub const fn is_homed(&self) -> bool {
        self.homed
    }

    /// Drive all carriages toward their endstops and re-reference.
    pub fn home(&mut self) -> Result<(), MachineError> {
        info!(rate_mm_s = self.config.motion.home_rate_mm_s, "homing");
        self.enable.digital_write(Level::High);
        for tower in 0..NUM_TOWERS {
            self.drivers[tower].set_flip(self.config.motion.home_dir[tower] < 0);
        }

        // Full-height upward travel; the endstops cut each stream.
        let start = self.map.cartesian_for(&self.position);
        let end = Position {
            z: start.z + self.config.geometry.h_um,
            ..start
        };
        let mv = Move::plan(start, end, self.config.motion.home_rate_mm_s, &self.limits);
        let start_car = self.map.carriages_for(start)?;
        let mut merger = EventMerger::new(mv.planners(&self.map)?);

        let [ea, eb, ec] = &mut self.endstops;
        let mut homing = HomingMonitor::new(
            [
                ea as &mut dyn EndstopInput,
                eb as &mut dyn EndstopInput,
                ec as &mut dyn EndstopInput,
            ],
            start_car.towers(),
        );
        let result = run_stream(
            &mut self.emitter,
            &self.timer,
            &mut self.drivers,
            &mut merger,
            StreamMonitor::Homing(&mut homing),
        );
        let complete = homing.is_complete();
        if !complete {
            homing.report_exhausted();
        }
        for tower in 0..NUM_TOWERS {
            self.drivers[tower].set_flip(false);
        }
        result?;
        if !complete {
            return Err(MachineError::HomingFailed);
        }

        self.position = self.map.homed_carriages();
        self.homed = true;
        info!("homing complete");
        Ok(())
    }

    /// Execute one straight-line move to `target`.
    pub fn queue_move(&mut self, target: Position, rate_mm_s: f64) -> Result<(), MachineError> {
        if !self.homed && self.config.motion.home_before_first_move {
            return Err(MachineError::NotHomed);
        }
        // Reject unreachable targets before anything is scheduled.
        let end_car = self.map.carriages_for(target)?;

        let [ea, eb, ec] = &mut self.endstops;
        check_endstops_clear(&mut [
            ea as &mut dyn EndstopInput,
            eb as &mut dyn EndstopInput,
            ec as &mut dyn EndstopInput,
        ])?;

        let start = self.map.cartesian_for(&self.position);
        let mv = Move::plan(start, target, rate_mm_s, &self.limits);
        debug!(
            ?target,
            duration_us = mv.duration_us(),
            peak_um_s = mv.peak_velocity_um_s(),
            "move queued"
        );
        let mut merger = EventMerger::new(mv.planners(&self.map)?);

        self.enable.digital_write(Level::High);
        run_stream(
            &mut self.emitter,
            &self.timer,
            &mut self.drivers,
            &mut merger,
            StreamMonitor::Normal(&mut self.endstops),
        )?;
        self.position = end_car;
        Ok(())
    }

    /// Part-cooling fan on/off.
    pub fn set_fan(&mut self, on: bool) {
        self.fan
            .digital_write(if on { Level::High } else { Level::Low });
    }

    /// Hotend setpoint [°C]; zero disables the heater.
    pub fn set_hotend_target(&self, setpoint_c: f64) {
        if self.temp_tx.send(TempCommand::SetTarget(setpoint_c)).is_err() {
            warn!("temperature loop is gone; setpoint dropped");
        }
    }

    /// Orderly shutdown: stop the temperature loop, release the drivers,
    /// park every pin at its default.
    pub fn shutdown(&mut self) {
        info!("machine shutdown");
        let _ = self.temp_tx.send(TempCommand::Shutdown);
        if let Some(handle) = self.temp_thread.take() {
            let _ = handle.join();
        }
        self.pwm.stop();
        self.enable.digital_write(Level::Low);
        deactivate_all();
    }
}

fn spawn_temp_loop(
    mut control: TempControl,
    timer: Arc<SystemTimer>,
    rx: mpsc::Receiver<TempCommand>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("triad-temp".into())
        .spawn(move || loop {
            match rx.try_recv() {
                Ok(TempCommand::SetTarget(setpoint_c)) => {
                    control.set_target(setpoint_c, timer.now_us())
                }
                Ok(TempCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    // Pins return to default when the controller drops.
                    break;
                }
                Err(TryRecvError::Empty) => {}
            }
            if let Err(fault) = control.tick(timer.now_us()) {
                error!(%fault, "thermal supervision fault");
            }
            std::thread::sleep(Duration::from_millis(10));
        })
        .expect("temperature thread spawn")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_queue_reorders_crossed_edges() {
        let mut queue = EventQueue::default();
        // Falling edge of one step after the next step's rising edge.
        queue.push(GpioEvent { time_us: 104, set_mask: 0, clear_mask: 1 });
        queue.push(GpioEvent { time_us: 102, set_mask: 2, clear_mask: 0 });
        queue.push(GpioEvent { time_us: 100, set_mask: 1, clear_mask: 0 });
        let mut out = Vec::new();
        queue.drain_up_to(102, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].time_us, 100);
        assert_eq!(out[1].time_us, 102);
        queue.drain_all(&mut out);
        assert_eq!(out[2].time_us, 104);
    }

    #[test]
    fn event_queue_keeps_insertion_order_for_ties() {
        let mut queue = EventQueue::default();
        queue.push(GpioEvent { time_us: 10, set_mask: 1, clear_mask: 0 });
        queue.push(GpioEvent { time_us: 10, set_mask: 0, clear_mask: 2 });
        let mut out = Vec::new();
        queue.drain_all(&mut out);
        assert_eq!(out[0].set_mask, 1);
        assert_eq!(out[1].clear_mask, 2);
    }
}
