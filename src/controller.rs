// src/controller.rs
//! Debounced model of the control surface.
//!
//! Raw CC messages are staged by [`Controller::update_single`] and committed once
//! per control-loop tick by [`Controller::update_all`]. The committed half lives in
//! a [`SharedControls`] lock so waveform generators on the audio thread can read
//! knob positions, registers and transport flags while the control loop writes.

use crate::midi::MidiLink;
use crate::surface::{
    classify, knob_cc, slider_cc, slider_index, ControlKind, StateKind, Transport, KNOB_CENTER,
    MAX_CC, NUM_CONTROLS,
};
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KnobMode {
    SynPitch,
    SmpPitch,
    SmpScrub,
}

impl KnobMode {
    pub const ALL: [KnobMode; 3] = [KnobMode::SynPitch, KnobMode::SmpPitch, KnobMode::SmpScrub];

    pub fn is_sampler(&self) -> bool {
        !matches!(self, KnobMode::SynPitch)
    }

    pub fn domain(&self) -> Domain {
        if self.is_sampler() {
            Domain::Smp
        } else {
            Domain::Syn
        }
    }
}

impl std::fmt::Display for KnobMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KnobMode::SynPitch => "syn-pitch",
            KnobMode::SmpPitch => "smp-pitch",
            KnobMode::SmpScrub => "smp-scrub",
        };
        write!(f, "{}", name)
    }
}

/// Which family of instruments a register applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Domain {
    Syn,
    Smp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DomainRegister {
    pub syn: i64,
    pub smp: i64,
}

impl DomainRegister {
    pub fn get(&self, domain: Domain) -> i64 {
        match domain {
            Domain::Syn => self.syn,
            Domain::Smp => self.smp,
        }
    }

    pub fn get_mut(&mut self, domain: Domain) -> &mut i64 {
        match domain {
            Domain::Syn => &mut self.syn,
            Domain::Smp => &mut self.smp,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalControls {
    pub slider_up: bool,
    pub solo_exclusive: bool,
    pub solo_defeats_mute: bool,
    pub mute_override: bool,
    pub record_exclusive: bool,
}

impl GlobalControls {
    /// "One-finger" mode implies exclusive solo.
    pub fn toggle_slider_up(&mut self) {
        self.slider_up = !self.slider_up;
        self.solo_exclusive = self.slider_up;
    }

    pub fn toggle_solo_exclusive(&mut self) {
        self.solo_exclusive = !self.solo_exclusive;
        if !self.solo_exclusive {
            self.slider_up = false;
        }
    }

    pub fn labeled(&self) -> [(&'static str, bool); 5] {
        [
            ("SLIDER UP", self.slider_up),
            ("SOLO EXCL", self.solo_exclusive),
            ("SOLO>MUTE", self.solo_defeats_mute),
            ("MUTE OVER", self.mute_override),
            ("REC. EXCL", self.record_exclusive),
        ]
    }
}

/// Committed control-surface state.
#[derive(Clone, Debug)]
pub struct ControlState {
    /// Last committed raw value per CC number.
    pub controls: [u8; 128],
    pub knob_mode: KnobMode,
    /// Raw knob positions saved for every mode that is not currently active.
    pub knobs_memory: BTreeMap<KnobMode, [u8; NUM_CONTROLS]>,
    pub states: BTreeMap<StateKind, [bool; NUM_CONTROLS]>,
    pub transport: BTreeMap<Transport, bool>,
    pub track_register: DomainRegister,
    pub marker_register: i64,
    pub transport_register: DomainRegister,
    pub global_controls: GlobalControls,
    pub show_help: bool,
    /// Stop was released since the last recording started; the next take starts empty.
    pub stopped: bool,
}

impl ControlState {
    pub fn new(initial_knob_mode: KnobMode) -> Self {
        let mut controls = [0; 128];
        for k in 0..NUM_CONTROLS {
            controls[knob_cc(k) as usize] = KNOB_CENTER;
        }
        Self {
            controls,
            knob_mode: initial_knob_mode,
            knobs_memory: KnobMode::ALL
                .into_iter()
                .map(|mode| (mode, [KNOB_CENTER; NUM_CONTROLS]))
                .collect(),
            states: StateKind::ALL
                .into_iter()
                .map(|kind| (kind, [false; NUM_CONTROLS]))
                .collect(),
            transport: Transport::ALL.into_iter().map(|t| (t, false)).collect(),
            track_register: DomainRegister::default(),
            marker_register: 0,
            transport_register: DomainRegister::default(),
            global_controls: GlobalControls::default(),
            show_help: false,
            stopped: true,
        }
    }

    /// Bipolar knob value; saturates at +1 only, raw 0 maps to exactly -1.
    pub fn norm_knob(raw: u8) -> f64 {
        (raw as f64 / KNOB_CENTER as f64 - 1.0).min(1.0)
    }

    /// Knob `k` as seen by `mode`, reading the per-mode memory when `mode` is not active.
    pub fn get_knob(&self, k: usize, mode: Option<KnobMode>) -> f64 {
        match mode {
            Some(mode) if mode != self.knob_mode => self
                .knobs_memory
                .get(&mode)
                .map_or(0.0, |memory| Self::norm_knob(memory[k])),
            _ => Self::norm_knob(self.controls[knob_cc(k) as usize]),
        }
    }

    pub fn get_slider(&self, k: usize) -> f64 {
        self.controls[slider_cc(k) as usize] as f64 / 127.0
    }

    /// Position of a track along the physical row, in [0, 1].
    pub fn relative_track(k: usize) -> f64 {
        k as f64 / (NUM_CONTROLS.max(2) - 1) as f64
    }

    pub fn state(&self, kind: StateKind, k: usize) -> bool {
        self.states.get(&kind).map_or(false, |row| row[k])
    }

    pub fn transport(&self, t: Transport) -> bool {
        self.transport.get(&t).copied().unwrap_or(false)
    }

    pub fn is_effective_mute(&self, k: usize) -> bool {
        let g = &self.global_controls;
        let any_solo = (0..NUM_CONTROLS).any(|i| self.state(StateKind::Solo, i));
        g.mute_override
            || (!g.solo_defeats_mute && self.state(StateKind::Mute, k))
            || (any_solo && !self.state(StateKind::Solo, k))
    }
}

pub type SharedControls = Arc<RwLock<ControlState>>;

/// Reads the shared state, recovering the data if a writer panicked.
pub fn read_controls(shared: &SharedControls) -> RwLockReadGuard<'_, ControlState> {
    shared.read().unwrap_or_else(|e| e.into_inner())
}

fn write_controls(shared: &SharedControls) -> RwLockWriteGuard<'_, ControlState> {
    shared.write().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone, Debug)]
pub struct ControllerOptions {
    /// Software owns the button LEDs and toggle latches (KORG "External" LED mode).
    pub external_led_mode: bool,
    pub blink_delay: Duration,
    pub initial_knob_mode: KnobMode,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            external_led_mode: true,
            blink_delay: Duration::from_millis(200),
            initial_knob_mode: KnobMode::SynPitch,
        }
    }
}

/// Deltas received during the current tick.
#[derive(Default)]
struct Staging {
    controls: BTreeMap<u8, u8>,
    states: BTreeMap<StateKind, BTreeMap<usize, bool>>,
    transport: BTreeMap<Transport, bool>,
}

pub struct Controller {
    shared: SharedControls,
    staged: Staging,
    options: ControllerOptions,
    link: Box<dyn MidiLink>,
}

impl Controller {
    pub fn new(options: ControllerOptions, link: Box<dyn MidiLink>) -> Self {
        let mut controller = Self {
            shared: Arc::new(RwLock::new(ControlState::new(options.initial_knob_mode))),
            staged: Staging::default(),
            options,
            link,
        };
        controller.reset_state();
        controller.restage_all();
        controller.blink_leds();
        controller
    }

    pub fn shared(&self) -> SharedControls {
        self.shared.clone()
    }

    pub fn state(&self) -> RwLockReadGuard<'_, ControlState> {
        read_controls(&self.shared)
    }

    /// Direct mutation of committed state (global flags, registers, help overlay).
    pub fn edit<R>(&self, f: impl FnOnce(&mut ControlState) -> R) -> R {
        f(&mut write_controls(&self.shared))
    }

    /// Controls changed (or marked for repaint) since the last [`Self::clear_new_controls`].
    pub fn new_controls(&self) -> &BTreeMap<u8, u8> {
        &self.staged.controls
    }

    pub fn clear_new_controls(&mut self) {
        self.staged.controls.clear();
    }

    /// Marks every slider and knob for repaint.
    pub fn restage_controls(&mut self) {
        let state = read_controls(&self.shared);
        for k in 0..NUM_CONTROLS {
            for cc in [slider_cc(k), knob_cc(k)] {
                self.staged.controls.insert(cc, state.controls[cc as usize]);
            }
        }
    }

    // --- Lifecycle ---

    fn reset_state(&mut self) {
        *write_controls(&self.shared) = ControlState::new(self.options.initial_knob_mode);
        self.staged = Staging::default();
        self.reset_sliders();
        self.reset_knobs();
    }

    /// Re-stages every committed state and transport value so LEDs get re-sent.
    fn restage_all(&mut self) {
        let state = read_controls(&self.shared);
        for (&kind, row) in &state.states {
            let staged = self.staged.states.entry(kind).or_default();
            for (k, &value) in row.iter().enumerate() {
                staged.insert(k, value);
            }
        }
        for (&t, &value) in &state.transport {
            self.staged.transport.insert(t, value);
        }
    }

    /// Initialize: wipe all state back to defaults, re-bind the device and blink.
    pub fn reset(&mut self) -> Result<()> {
        self.reset_state();
        self.reset_midi()?;
        self.blink_leds();
        Ok(())
    }

    pub fn reset_midi(&mut self) -> Result<()> {
        self.link.reconnect()?;
        self.restage_all();
        Ok(())
    }

    fn send_msg(link: &mut dyn MidiLink, cc: u8, on: bool) {
        link.send_cc(cc, if on { 127 } else { 0 });
    }

    pub fn blink_leds(&mut self) {
        if !self.options.external_led_mode {
            return;
        }
        for (pass, on) in [false, true, false].into_iter().enumerate() {
            if pass > 0 && !self.options.blink_delay.is_zero() {
                thread::sleep(self.options.blink_delay);
            }
            for cc in 0..MAX_CC {
                Self::send_msg(self.link.as_mut(), cc, on);
            }
        }
    }

    pub fn reset_sliders(&mut self) {
        let mut state = write_controls(&self.shared);
        for k in 0..NUM_CONTROLS {
            let cc = slider_cc(k);
            state.controls[cc as usize] = 0;
            self.staged.controls.insert(cc, 0);
        }
    }

    /// Centers the knobs of the active knob mode.
    pub fn reset_knobs(&mut self) {
        let mut state = write_controls(&self.shared);
        let mode = state.knob_mode;
        for k in 0..NUM_CONTROLS {
            let cc = knob_cc(k);
            state.controls[cc as usize] = KNOB_CENTER;
            self.staged.controls.insert(cc, KNOB_CENTER);
            if let Some(memory) = state.knobs_memory.get_mut(&mode) {
                memory[k] = KNOB_CENTER;
            }
        }
    }

    // --- Knob modes ---

    pub fn toggle_knob_mode(&mut self, is_sampler: Option<bool>) {
        let mut state = write_controls(&self.shared);
        let cycle = self
            .staged
            .transport
            .get(&Transport::Cycle)
            .copied()
            .unwrap_or_else(|| state.transport(Transport::Cycle));
        switch_knob_mode(&mut state, &mut self.staged.controls, is_sampler, cycle);
    }

    // --- Queries ---

    pub fn get_knob(&self, k: usize, mode: Option<KnobMode>) -> f64 {
        self.state().get_knob(k, mode)
    }

    pub fn get_slider(&self, k: usize) -> f64 {
        self.state().get_slider(k)
    }

    pub fn relative_track(k: usize) -> f64 {
        ControlState::relative_track(k)
    }

    pub fn is_effective_mute(&self, k: usize) -> bool {
        self.state().is_effective_mute(k)
    }

    // --- Staging ---

    pub fn toggle_all(&mut self, kinds: &[StateKind], value: bool) {
        if !self.options.external_led_mode {
            return;
        }
        for &kind in kinds {
            let staged = self.staged.states.entry(kind).or_default();
            for k in 0..NUM_CONTROLS {
                staged.insert(k, value);
            }
        }
    }

    /// Emulates a press already committed plus a release staged for this tick.
    ///
    /// Only the press skips [`Self::update_all`]; it has no effects of its own. The
    /// release goes through the next commit, so release-edge rules apply to taps.
    pub fn tap_transport(&mut self, t: Transport) {
        write_controls(&self.shared).transport.insert(t, true);
        self.staged.transport.insert(t, false);
    }

    pub fn toggle_transport(&mut self, t: Transport) {
        let current = self.state().transport(t);
        self.staged.transport.insert(t, !current);
    }

    /// Stages a state button value as if it came from the surface.
    pub fn stage_state(&mut self, kind: StateKind, k: usize, on: bool) {
        self.staged.states.entry(kind).or_default().insert(k, on);
    }

    /// Stages one raw CC message; committed state is untouched until [`Self::update_all`].
    pub fn update_single(&mut self, cc: u8, value: u8) {
        let state = read_controls(&self.shared);
        let latched = self.options.external_led_mode;
        match classify(cc) {
            Some(ControlKind::Slider(_)) => {
                self.staged.controls.insert(cc, value);
            }
            Some(ControlKind::Knob(_)) => {
                // With cycle engaged the synth knobs are pitch-locked.
                if state.knob_mode.is_sampler() || !state.transport(Transport::Cycle) {
                    self.staged.controls.insert(cc, value);
                }
            }
            Some(ControlKind::Transport(t)) => {
                let pressed = if latched && t.is_toggle() {
                    !state.transport(t)
                } else {
                    value > 0
                };
                self.staged.transport.insert(t, pressed);
            }
            Some(ControlKind::State(kind, k)) => {
                let on = if latched {
                    !state.state(kind, k)
                } else {
                    value > 0
                };
                self.staged.states.entry(kind).or_default().insert(k, on);
            }
            None => debug!("Ignoring unmapped CC {}={}", cc, value),
        }
    }

    /// Feeds every pending MIDI message through [`Self::update_single`].
    pub fn drain_midi(&mut self) {
        while let Some((cc, value)) = self.link.poll() {
            self.update_single(cc, value);
        }
    }

    /// Commits this tick's deltas. The order of the steps matters.
    pub fn update_all(&mut self) {
        let latched = self.options.external_led_mode;
        let mut leds: Vec<(u8, bool)> = Vec::new();
        let mut state = write_controls(&self.shared);
        let staged = &mut self.staged;

        // Rising slider motion picks the track.
        if state.global_controls.slider_up {
            for (&cc, &value) in &staged.controls {
                if let Some(k) = slider_index(cc) {
                    let old = state.controls[cc as usize];
                    if value > old && old > 0 {
                        staged.states.entry(StateKind::Solo).or_default().insert(k, true);
                    }
                }
            }
        }

        let globals = state.global_controls;
        for (kind, exclusive) in [
            (StateKind::Solo, globals.solo_exclusive),
            (StateKind::Record, globals.record_exclusive),
        ] {
            if !exclusive {
                continue;
            }
            let pending = staged.states.entry(kind).or_default();
            if !pending.values().any(|&on| on) {
                continue;
            }
            for k in 0..NUM_CONTROLS {
                if state.state(kind, k) && !pending.contains_key(&k) {
                    pending.insert(k, false);
                }
            }
        }

        for (&cc, &value) in &staged.controls {
            state.controls[cc as usize] = value;
        }

        for (kind, changes) in std::mem::take(&mut staged.states) {
            for (k, on) in changes {
                for cc in [slider_cc(k), knob_cc(k)] {
                    staged.controls.insert(cc, state.controls[cc as usize]);
                }
                if latched {
                    leds.push((kind.cc(k), on));
                }
                if let Some(row) = state.states.get_mut(&kind) {
                    row[k] = on;
                }
            }
        }

        // Releasing stop cancels playing and recording.
        if staged.transport.get(&Transport::Stop) == Some(&false) && state.transport(Transport::Stop)
        {
            state.stopped = true;
            for t in [Transport::Play, Transport::Record] {
                if state.transport(t) {
                    staged.transport.insert(t, false);
                }
            }
        }

        if let Some(&cycle) = staged.transport.get(&Transport::Cycle) {
            switch_knob_mode(&mut state, &mut staged.controls, None, cycle);
        }

        let mut refresh_knobs = false;
        let domain = state.knob_mode.domain();
        let track_domain = if state.transport(Transport::Set) {
            Domain::Syn
        } else {
            domain
        };
        for (&t, &pressed) in &staged.transport {
            if !pressed && state.transport(t) {
                match t {
                    Transport::Rewind => *state.transport_register.get_mut(domain) -= 1,
                    Transport::Forward => *state.transport_register.get_mut(domain) += 1,
                    Transport::TrackRewind => {
                        *state.track_register.get_mut(track_domain) -= 1;
                        refresh_knobs = true;
                    }
                    Transport::TrackForward => {
                        *state.track_register.get_mut(track_domain) += 1;
                        refresh_knobs = true;
                    }
                    Transport::MarkerRewind => {
                        state.marker_register -= 1;
                        refresh_knobs = true;
                    }
                    Transport::MarkerForward => {
                        state.marker_register += 1;
                        refresh_knobs = true;
                    }
                    _ => {}
                }
            }
            if latched && t.has_led() {
                leds.push((t.cc(), pressed));
            }
        }
        if staged.transport.contains_key(&Transport::Set) && state.knob_mode.is_sampler() {
            refresh_knobs = true;
        }

        // Register changes alter what the same raw knob position means.
        if refresh_knobs {
            for k in 0..NUM_CONTROLS {
                let cc = knob_cc(k);
                staged.controls.insert(cc, state.controls[cc as usize]);
            }
        }

        for (t, pressed) in std::mem::take(&mut staged.transport) {
            state.transport.insert(t, pressed);
        }
        drop(state);

        for (cc, on) in leds {
            Self::send_msg(self.link.as_mut(), cc, on);
        }
    }
}

/// Saves the outgoing mode's knob positions and restores the incoming mode's.
fn switch_knob_mode(
    state: &mut ControlState,
    staged_controls: &mut BTreeMap<u8, u8>,
    is_sampler: Option<bool>,
    cycle: bool,
) {
    let sampler = is_sampler.unwrap_or_else(|| state.knob_mode.is_sampler());
    let mode = match (sampler, cycle) {
        (false, _) => KnobMode::SynPitch,
        (true, true) => KnobMode::SmpScrub,
        (true, false) => KnobMode::SmpPitch,
    };
    if mode == state.knob_mode {
        return;
    }
    let previous = state.knob_mode;
    let incoming = state.knobs_memory.get(&mode).copied().unwrap_or([KNOB_CENTER; NUM_CONTROLS]);
    let mut outgoing = [KNOB_CENTER; NUM_CONTROLS];
    for k in 0..NUM_CONTROLS {
        let cc = knob_cc(k);
        outgoing[k] = state.controls[cc as usize];
        state.controls[cc as usize] = incoming[k];
        staged_controls.insert(cc, incoming[k]);
    }
    state.knobs_memory.insert(previous, outgoing);
    state.knob_mode = mode;
    debug!("Knob mode {} -> {}", previous, mode);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::testing::LoopbackLink;

    fn controller() -> (Controller, LoopbackLink) {
        let link = LoopbackLink::default();
        let options = ControllerOptions {
            blink_delay: Duration::ZERO,
            ..Default::default()
        };
        let mut ctrl = Controller::new(options, Box::new(link.clone()));
        ctrl.update_all();
        ctrl.clear_new_controls();
        link.take_sent();
        (ctrl, link)
    }

    fn tick(ctrl: &mut Controller) {
        ctrl.drain_midi();
        ctrl.update_all();
        ctrl.clear_new_controls();
    }

    fn solos(ctrl: &Controller) -> Vec<bool> {
        (0..NUM_CONTROLS).map(|k| ctrl.state().state(StateKind::Solo, k)).collect()
    }

    #[test]
    fn startup_blinks_every_led() {
        let link = LoopbackLink::default();
        let options = ControllerOptions {
            blink_delay: Duration::ZERO,
            ..Default::default()
        };
        let _ctrl = Controller::new(options, Box::new(link.clone()));
        let sent = link.take_sent();
        assert_eq!(sent.len(), 3 * MAX_CC as usize);
        assert_eq!(sent[0], (0, 0));
        assert_eq!(sent[MAX_CC as usize], (0, 127));
        assert_eq!(sent[2 * MAX_CC as usize + 5], (5, 0));
    }

    #[test]
    fn state_buttons_toggle_in_software() {
        let (mut ctrl, link) = controller();
        link.push(StateKind::Solo.cc(0), 127);
        tick(&mut ctrl);
        assert!(ctrl.state().state(StateKind::Solo, 0));
        link.push(StateKind::Solo.cc(0), 127);
        tick(&mut ctrl);
        assert!(!ctrl.state().state(StateKind::Solo, 0));
        link.push(StateKind::Solo.cc(0), 0);
        tick(&mut ctrl);
        assert!(ctrl.state().state(StateKind::Solo, 0));
    }

    #[test]
    fn staged_values_do_not_touch_committed_state() {
        let (mut ctrl, _link) = controller();
        ctrl.update_single(slider_cc(2), 99);
        ctrl.update_single(StateKind::Mute.cc(2), 127);
        assert_eq!(ctrl.state().controls[slider_cc(2) as usize], 0);
        assert!(!ctrl.state().state(StateKind::Mute, 2));
        ctrl.update_all();
        assert_eq!(ctrl.state().controls[slider_cc(2) as usize], 99);
        assert!(ctrl.state().state(StateKind::Mute, 2));
    }

    #[test]
    fn state_changes_repaint_track_and_light_led() {
        let (mut ctrl, link) = controller();
        ctrl.update_single(StateKind::Record.cc(4), 127);
        ctrl.update_all();
        assert!(ctrl.new_controls().contains_key(&slider_cc(4)));
        assert!(ctrl.new_controls().contains_key(&knob_cc(4)));
        assert_eq!(link.take_sent(), vec![(StateKind::Record.cc(4), 127)]);
    }

    #[test]
    fn exclusive_solo_keeps_only_latest_track() {
        let (mut ctrl, link) = controller();
        ctrl.edit(|s| s.global_controls.solo_exclusive = true);
        link.push(StateKind::Solo.cc(1), 127);
        tick(&mut ctrl);
        link.push(StateKind::Solo.cc(0), 127);
        tick(&mut ctrl);
        let mut expected = vec![false; NUM_CONTROLS];
        expected[0] = true;
        assert_eq!(solos(&ctrl), expected);
    }

    #[test]
    fn exclusive_record_arm() {
        let (mut ctrl, link) = controller();
        ctrl.edit(|s| s.global_controls.record_exclusive = true);
        link.push(StateKind::Record.cc(5), 127);
        tick(&mut ctrl);
        link.push(StateKind::Record.cc(6), 127);
        tick(&mut ctrl);
        assert!(!ctrl.state().state(StateKind::Record, 5));
        assert!(ctrl.state().state(StateKind::Record, 6));
    }

    #[test]
    fn releasing_solo_does_not_clear_others_under_exclusivity() {
        let (mut ctrl, link) = controller();
        ctrl.toggle_all(&[StateKind::Solo], true);
        tick(&mut ctrl);
        ctrl.edit(|s| s.global_controls.solo_exclusive = true);
        link.push(StateKind::Solo.cc(3), 127);
        tick(&mut ctrl);
        let on = solos(&ctrl).iter().filter(|&&s| s).count();
        assert_eq!(on, NUM_CONTROLS - 1);
    }

    #[test]
    fn slider_up_arms_solo_on_rising_motion() {
        let (mut ctrl, link) = controller();
        ctrl.edit(|s| s.global_controls.toggle_slider_up());
        assert!(ctrl.state().global_controls.solo_exclusive);
        link.push(slider_cc(3), 10);
        tick(&mut ctrl);
        assert!(!ctrl.state().state(StateKind::Solo, 3));
        link.push(slider_cc(3), 20);
        tick(&mut ctrl);
        assert!(ctrl.state().state(StateKind::Solo, 3));
        link.push(slider_cc(5), 10);
        link.push(slider_cc(5), 5);
        tick(&mut ctrl);
        link.push(slider_cc(5), 30);
        tick(&mut ctrl);
        assert_eq!(
            solos(&ctrl),
            vec![false, false, false, false, false, true, false, false]
        );
    }

    #[test]
    fn global_flag_constraints() {
        let mut g = GlobalControls::default();
        g.toggle_slider_up();
        assert!(g.slider_up && g.solo_exclusive);
        g.toggle_solo_exclusive();
        assert!(!g.slider_up && !g.solo_exclusive);
        g.toggle_solo_exclusive();
        assert!(!g.slider_up && g.solo_exclusive);
    }

    #[test]
    fn knob_mode_round_trip_restores_positions() {
        let (mut ctrl, link) = controller();
        ctrl.toggle_knob_mode(Some(true));
        assert_eq!(ctrl.state().knob_mode, KnobMode::SmpPitch);
        for k in 0..NUM_CONTROLS {
            link.push(knob_cc(k), 10 + k as u8);
        }
        tick(&mut ctrl);

        link.push(Transport::Cycle.cc(), 127);
        tick(&mut ctrl);
        assert_eq!(ctrl.state().knob_mode, KnobMode::SmpScrub);
        assert_eq!(ctrl.state().controls[knob_cc(0) as usize], KNOB_CENTER);
        link.push(knob_cc(2), 100);
        tick(&mut ctrl);

        link.push(Transport::Cycle.cc(), 127);
        tick(&mut ctrl);
        assert_eq!(ctrl.state().knob_mode, KnobMode::SmpPitch);
        for k in 0..NUM_CONTROLS {
            assert_eq!(ctrl.state().controls[knob_cc(k) as usize], 10 + k as u8);
        }
        assert_abs_diff_eq(ctrl.get_knob(2, Some(KnobMode::SmpScrub)), 100.0 / 64.0 - 1.0);
    }

    fn assert_abs_diff_eq(a: f64, b: f64) {
        approx::assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }

    #[test]
    fn synth_to_sampler_and_back_restores_synth_knobs() {
        let (mut ctrl, link) = controller();
        link.push(knob_cc(0), 90);
        link.push(knob_cc(7), 3);
        tick(&mut ctrl);
        link.push(Transport::Cycle.cc(), 127);
        tick(&mut ctrl);
        assert_eq!(ctrl.state().knob_mode, KnobMode::SynPitch);
        ctrl.toggle_knob_mode(Some(true));
        assert_eq!(ctrl.state().knob_mode, KnobMode::SmpScrub);
        ctrl.toggle_knob_mode(Some(false));
        assert_eq!(ctrl.state().knob_mode, KnobMode::SynPitch);
        assert_eq!(ctrl.state().controls[knob_cc(0) as usize], 90);
        assert_eq!(ctrl.state().controls[knob_cc(7) as usize], 3);
    }

    #[test]
    fn cycle_locks_synth_pitch_knobs() {
        let (mut ctrl, link) = controller();
        link.push(Transport::Cycle.cc(), 127);
        tick(&mut ctrl);
        link.push(knob_cc(1), 0);
        tick(&mut ctrl);
        assert_eq!(ctrl.state().controls[knob_cc(1) as usize], KNOB_CENTER);

        ctrl.toggle_knob_mode(Some(true));
        link.push(knob_cc(1), 0);
        tick(&mut ctrl);
        assert_eq!(ctrl.state().controls[knob_cc(1) as usize], 0);
    }

    #[test]
    fn track_forward_fires_once_on_release() {
        let (mut ctrl, link) = controller();
        link.push(Transport::TrackForward.cc(), 127);
        for _ in 0..3 {
            tick(&mut ctrl);
            assert_eq!(ctrl.state().track_register.syn, 0);
        }
        link.push(Transport::TrackForward.cc(), 0);
        ctrl.drain_midi();
        ctrl.update_all();
        assert_eq!(ctrl.state().track_register.syn, 1);
        assert!(ctrl.new_controls().contains_key(&knob_cc(0)));
        tick(&mut ctrl);
        assert_eq!(ctrl.state().track_register.syn, 1);
    }

    #[test]
    fn registers_follow_active_domain() {
        let (mut ctrl, link) = controller();
        ctrl.toggle_knob_mode(Some(true));
        for t in [Transport::Forward, Transport::TrackRewind] {
            link.push(t.cc(), 127);
            tick(&mut ctrl);
            link.push(t.cc(), 0);
            tick(&mut ctrl);
        }
        let state = ctrl.state().clone();
        assert_eq!(state.transport_register, DomainRegister { syn: 0, smp: 1 });
        assert_eq!(state.track_register, DomainRegister { syn: 0, smp: -1 });
    }

    #[test]
    fn set_modifier_routes_track_buttons_to_synth_register() {
        let (mut ctrl, link) = controller();
        ctrl.toggle_knob_mode(Some(true));
        link.push(Transport::Set.cc(), 127);
        ctrl.drain_midi();
        ctrl.update_all();
        assert!(ctrl.new_controls().contains_key(&knob_cc(3)));
        ctrl.clear_new_controls();
        link.push(Transport::TrackForward.cc(), 127);
        tick(&mut ctrl);
        link.push(Transport::TrackForward.cc(), 0);
        tick(&mut ctrl);
        assert_eq!(ctrl.state().track_register, DomainRegister { syn: 1, smp: 0 });
    }

    #[test]
    fn marker_forward_selects_next_synth_only() {
        let (mut ctrl, link) = controller();
        link.push(Transport::MarkerForward.cc(), 127);
        tick(&mut ctrl);
        link.push(Transport::MarkerForward.cc(), 0);
        tick(&mut ctrl);
        let state = ctrl.state();
        assert_eq!(state.marker_register, 1);
        assert_eq!(state.track_register, DomainRegister::default());
        assert_eq!(state.transport_register, DomainRegister::default());
    }

    #[test]
    fn releasing_stop_cancels_play_and_record() {
        let (mut ctrl, link) = controller();
        link.push(Transport::Play.cc(), 127);
        link.push(Transport::Record.cc(), 127);
        tick(&mut ctrl);
        assert!(ctrl.state().transport(Transport::Play));
        assert!(ctrl.state().transport(Transport::Record));
        link.push(Transport::Stop.cc(), 127);
        tick(&mut ctrl);
        assert!(ctrl.state().transport(Transport::Play));
        link.push(Transport::Stop.cc(), 0);
        tick(&mut ctrl);
        assert!(!ctrl.state().transport(Transport::Play));
        assert!(!ctrl.state().transport(Transport::Record));
    }

    #[test]
    fn transport_leds_only_for_led_buttons() {
        let (mut ctrl, link) = controller();
        link.push(Transport::Play.cc(), 127);
        link.push(Transport::Set.cc(), 127);
        tick(&mut ctrl);
        assert_eq!(link.take_sent(), vec![(Transport::Play.cc(), 127)]);
    }

    #[test]
    fn tap_transport_emulates_press_and_release() {
        let (mut ctrl, _link) = controller();
        ctrl.tap_transport(Transport::MarkerRewind);
        ctrl.update_all();
        assert_eq!(ctrl.state().marker_register, -1);
        assert!(!ctrl.state().transport(Transport::MarkerRewind));
    }

    #[test]
    fn tapped_stop_goes_through_the_release_rules() {
        let (mut ctrl, link) = controller();
        link.push(Transport::Play.cc(), 127);
        tick(&mut ctrl);
        ctrl.edit(|s| s.stopped = false);

        ctrl.tap_transport(Transport::Stop);
        ctrl.update_all();
        let state = ctrl.state();
        assert!(!state.transport(Transport::Play));
        assert!(!state.transport(Transport::Stop));
        assert!(state.stopped);
    }

    #[test]
    fn staged_state_commits_with_led() {
        let (mut ctrl, link) = controller();
        link.push(StateKind::Record.cc(2), 127);
        tick(&mut ctrl);
        link.take_sent();
        ctrl.stage_state(StateKind::Record, 2, false);
        assert!(ctrl.state().state(StateKind::Record, 2));
        ctrl.update_all();
        assert!(!ctrl.state().state(StateKind::Record, 2));
        assert_eq!(link.take_sent(), vec![(StateKind::Record.cc(2), 0)]);
    }

    #[test]
    fn poisoned_lock_keeps_last_committed_state() {
        let shared: SharedControls = Arc::new(RwLock::new(ControlState::new(KnobMode::SynPitch)));
        let writer = shared.clone();
        let result = std::thread::spawn(move || {
            let mut state = writer.write().unwrap();
            state.marker_register = 3;
            panic!("writer failed");
        })
        .join();
        assert!(result.is_err());
        assert!(shared.is_poisoned());
        assert_eq!(read_controls(&shared).marker_register, 3);
        write_controls(&shared).marker_register = 4;
        assert_eq!(read_controls(&shared).marker_register, 4);
    }

    #[test]
    fn knob_normalization_bounds() {
        assert_eq!(ControlState::norm_knob(0), -1.0);
        assert_eq!(ControlState::norm_knob(KNOB_CENTER), 0.0);
        assert!(ControlState::norm_knob(127) <= 1.0);
        assert!((0..=u8::MAX).all(|raw| ControlState::norm_knob(raw) <= 1.0));
        assert_eq!(ControlState::norm_knob(200), 1.0);
    }

    #[test]
    fn slider_and_track_position() {
        let (mut ctrl, link) = controller();
        link.push(slider_cc(0), 127);
        tick(&mut ctrl);
        assert_eq!(ctrl.get_slider(0), 1.0);
        assert_eq!(Controller::relative_track(0), 0.0);
        assert_eq!(Controller::relative_track(NUM_CONTROLS - 1), 1.0);
    }

    #[test]
    fn mute_override_silences_everything() {
        let (mut ctrl, _link) = controller();
        ctrl.toggle_all(&[StateKind::Solo], true);
        ctrl.update_all();
        ctrl.edit(|s| s.global_controls.mute_override = true);
        assert!((0..NUM_CONTROLS).all(|k| ctrl.is_effective_mute(k)));
    }

    #[test]
    fn solo_and_mute_precedence() {
        let (mut ctrl, link) = controller();
        link.push(StateKind::Mute.cc(1), 127);
        tick(&mut ctrl);
        assert!(ctrl.is_effective_mute(1));
        assert!(!ctrl.is_effective_mute(0));

        link.push(StateKind::Solo.cc(1), 127);
        tick(&mut ctrl);
        assert!(ctrl.is_effective_mute(1));
        assert!(ctrl.is_effective_mute(0));

        ctrl.edit(|s| s.global_controls.solo_defeats_mute = true);
        assert!(!ctrl.is_effective_mute(1));
        assert!(ctrl.is_effective_mute(2));
    }

    #[test]
    fn reset_restores_defaults_and_rebinds() {
        let (mut ctrl, link) = controller();
        link.push(slider_cc(0), 50);
        link.push(StateKind::Solo.cc(0), 127);
        tick(&mut ctrl);
        ctrl.edit(|s| {
            s.marker_register = 4;
            s.global_controls.mute_override = true;
        });
        ctrl.reset().unwrap();
        ctrl.update_all();
        let state = ctrl.state();
        assert_eq!(*link.reconnects.lock().unwrap(), 1);
        assert_eq!(state.marker_register, 0);
        assert_eq!(state.controls[slider_cc(0) as usize], 0);
        assert!(!state.state(StateKind::Solo, 0));
        assert_eq!(state.global_controls, GlobalControls::default());
    }

    #[test]
    fn reset_knobs_centers_active_mode_only() {
        let (mut ctrl, link) = controller();
        link.push(knob_cc(0), 0);
        tick(&mut ctrl);
        ctrl.toggle_knob_mode(Some(true));
        link.push(knob_cc(0), 5);
        tick(&mut ctrl);
        ctrl.reset_knobs();
        assert_eq!(ctrl.get_knob(0, None), 0.0);
        assert_eq!(ctrl.get_knob(0, Some(KnobMode::SynPitch)), -1.0);
    }

    #[test]
    fn toggle_all_ignored_without_external_leds() {
        let link = LoopbackLink::default();
        let options = ControllerOptions {
            external_led_mode: false,
            blink_delay: Duration::ZERO,
            ..Default::default()
        };
        let mut ctrl = Controller::new(options, Box::new(link.clone()));
        ctrl.update_all();
        assert!(link.take_sent().is_empty());
        ctrl.toggle_all(&[StateKind::Mute], true);
        ctrl.update_all();
        assert!(!ctrl.state().state(StateKind::Mute, 0));
        link.push(StateKind::Mute.cc(0), 127);
        ctrl.drain_midi();
        ctrl.update_all();
        assert!(ctrl.state().state(StateKind::Mute, 0));
        link.push(StateKind::Mute.cc(0), 0);
        ctrl.drain_midi();
        ctrl.update_all();
        assert!(!ctrl.state().state(StateKind::Mute, 0));
    }
}
