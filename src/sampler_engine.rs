// src/sampler_engine.rs
use crate::audio_engine::PHASE_CUTOFF;
use crate::controller::{read_controls, SharedControls};
use crate::pitch_shift::pitch_shift;
use crate::slicer::SliceState;
use crate::synth::{Waveform, MIDDLE_C_FREQUENCY};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// How often a looper's worker re-reads the controls.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const READY_CAPACITY: usize = 2;
const RECYCLE_CAPACITY: usize = 8;

// --- Granular Looper ---

/// A pitch-shifted loop handed from the worker to the audio thread.
struct Rendered {
    samples: Vec<f32>,
    /// The slice changed, so playback restarts at the top.
    restart: bool,
}

/// Owns the slice of a looper and rebuilds its pitch-shifted loop off the audio thread.
struct ShiftWorker {
    slice: SliceState,
    controls: SharedControls,
    max_bend_semitones: f64,
    /// Newest loop not yet accepted by a full queue.
    pending: Option<Rendered>,
}

impl ShiftWorker {
    /// Rebuilds the loop when the slice, scrub, pitch or note changed.
    fn poll(&mut self) {
        let stale = {
            let state = read_controls(&self.controls);
            self.slice.refresh(&state)
        };
        if !stale.shift() {
            return;
        }
        let semitones = self.slice.pitch_knob() * self.max_bend_semitones;
        let samples = match pitch_shift(&self.slice.loop_smp, semitones) {
            Ok(shifted) => shifted,
            Err(e) => {
                warn!("Pitch shift failed, playing unshifted loop: {:#}", e);
                self.slice.loop_smp.clone()
            }
        };
        let restart = stale.slice || self.pending.as_ref().map_or(false, |p| p.restart);
        self.pending = Some(Rendered { samples, restart });
    }

    fn run(
        mut self,
        mut ready: HeapProducer<Rendered>,
        mut recycled: HeapConsumer<Vec<f32>>,
        alive: Arc<AtomicBool>,
    ) {
        while alive.load(Ordering::Relaxed) {
            while recycled.pop().is_some() {}
            self.poll();
            if let Some(rendered) = self.pending.take() {
                if let Err(rendered) = ready.push(rendered) {
                    self.pending = Some(rendered);
                }
            }
            thread::park_timeout(POLL_INTERVAL);
        }
        debug!("Looper worker exiting");
    }
}

/// Loops a scrubbed slice of a sample, pitch-shifted by the track's sampler pitch knob.
///
/// The first loop is built on construction; later rebuilds run on a worker thread and
/// reach the audio thread through a queue, with spent buffers sent back to be freed.
pub struct Looper {
    playing: Vec<f32>,
    pos: usize,
    ready: HeapConsumer<Rendered>,
    recycled: HeapProducer<Vec<f32>>,
    alive: Arc<AtomicBool>,
    worker: Option<thread::Thread>,
}

impl Looper {
    pub fn new(slice: SliceState, controls: SharedControls, max_bend_semitones: f64) -> Self {
        let mut worker = ShiftWorker {
            slice,
            controls,
            max_bend_semitones,
            pending: None,
        };
        worker.poll();
        let playing = worker.pending.take().map(|r| r.samples).unwrap_or_default();

        let (ready_producer, ready) = HeapRb::<Rendered>::new(READY_CAPACITY).split();
        let (recycled, recycled_consumer) = HeapRb::<Vec<f32>>::new(RECYCLE_CAPACITY).split();
        let alive = Arc::new(AtomicBool::new(true));
        let alive_clone = alive.clone();
        let handle = thread::Builder::new()
            .name("looper".to_string())
            .spawn(move || worker.run(ready_producer, recycled_consumer, alive_clone));
        let worker = match handle {
            Ok(handle) => Some(handle.thread().clone()),
            Err(e) => {
                warn!("Could not start looper worker, the loop stays fixed: {}", e);
                None
            }
        };

        Self {
            playing,
            pos: 0,
            ready,
            recycled,
            alive,
            worker,
        }
    }

    /// Swaps in the newest loop from the worker, if any.
    fn receive(&mut self) {
        while let Some(rendered) = self.ready.pop() {
            let spent = std::mem::replace(&mut self.playing, rendered.samples);
            // A full queue frees here; the worker drains it every poll.
            let _ = self.recycled.push(spent);
            if rendered.restart {
                self.pos = 0;
            }
        }
    }
}

impl Waveform for Looper {
    fn render(&mut self, phase: &[f64], out: &mut [f32]) {
        self.receive();
        let len = self.playing.len();
        if len == 0 {
            out.fill(0.0);
            return;
        }
        let start = self.pos % len;
        for (i, y) in out.iter_mut().enumerate() {
            *y = self.playing[(start + i) % len];
        }
        self.pos = (start + phase.len()) % len;
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        if let Some(worker) = &self.worker {
            worker.unpark();
        }
    }
}

// --- Recorded takes ---

/// Loops a recorded take.
///
/// With a sample rate the read rate follows the voice pitch, so middle C plays the take
/// as recorded; without one the take plays back verbatim.
pub struct TakeLoop {
    take: Arc<Vec<f32>>,
    pos: f64,
    /// Phase advance per frame at middle C.
    unit_step: Option<f64>,
    last_phase: Option<f64>,
}

impl TakeLoop {
    pub fn new(take: Arc<Vec<f32>>) -> Self {
        Self {
            take,
            pos: 0.0,
            unit_step: None,
            last_phase: None,
        }
    }

    pub fn pitched(take: Arc<Vec<f32>>, sample_rate: f64) -> Self {
        Self {
            unit_step: Some(TAU * MIDDLE_C_FREQUENCY / sample_rate),
            ..Self::new(take)
        }
    }

    fn rate(&mut self, phase: f64) -> f64 {
        let Some(unit) = self.unit_step else {
            return 1.0;
        };
        let rate = match self.last_phase {
            Some(last) => {
                let mut delta = phase - last;
                if delta < 0.0 {
                    delta += PHASE_CUTOFF;
                }
                delta / unit
            }
            None => 1.0,
        };
        self.last_phase = Some(phase);
        rate
    }
}

impl Waveform for TakeLoop {
    fn render(&mut self, phase: &[f64], out: &mut [f32]) {
        let len = self.take.len();
        if len == 0 {
            out.fill(0.0);
            return;
        }
        for (y, &x) in out.iter_mut().zip(phase) {
            let i = self.pos as usize % len;
            let frac = (self.pos - self.pos.floor()) as f32;
            let a = self.take[i];
            let b = self.take[(i + 1) % len];
            *y = a + (b - a) * frac;
            let rate = self.rate(x);
            self.pos = (self.pos + rate) % len as f64;
        }
    }
}
