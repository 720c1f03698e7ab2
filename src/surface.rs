// src/surface.rs
//! CC layout of the KORG nanoKONTROL2.

use anyhow::{bail, Result};

pub const NUM_CONTROLS: usize = 8;
pub const KNOB_CENTER: u8 = 64;
pub const SLIDER_CC: u8 = 0;
pub const KNOB_CC: u8 = 16;
/// Upper bound (exclusive) of the CC range swept by the LED blink sequence.
pub const MAX_CC: u8 = 100;
pub const CC_STATUS: u8 = 0xB0;

/// Per-track button rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateKind {
    Solo,
    Mute,
    Record,
}

impl StateKind {
    pub const ALL: [StateKind; 3] = [StateKind::Solo, StateKind::Mute, StateKind::Record];

    pub fn base_cc(&self) -> u8 {
        match self {
            StateKind::Solo => 32,
            StateKind::Mute => 48,
            StateKind::Record => 64,
        }
    }

    pub fn cc(&self, track: usize) -> u8 {
        self.base_cc() + track as u8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transport {
    Play,
    Stop,
    Rewind,
    Forward,
    Record,
    Cycle,
    TrackRewind,
    TrackForward,
    Set,
    MarkerRewind,
    MarkerForward,
}

impl Transport {
    pub const ALL: [Transport; 11] = [
        Transport::Play,
        Transport::Stop,
        Transport::Rewind,
        Transport::Forward,
        Transport::Record,
        Transport::Cycle,
        Transport::TrackRewind,
        Transport::TrackForward,
        Transport::Set,
        Transport::MarkerRewind,
        Transport::MarkerForward,
    ];

    pub fn cc(&self) -> u8 {
        match self {
            Transport::Play => 41,
            Transport::Stop => 42,
            Transport::Rewind => 43,
            Transport::Forward => 44,
            Transport::Record => 45,
            Transport::Cycle => 46,
            Transport::TrackRewind => 58,
            Transport::TrackForward => 59,
            Transport::Set => 60,
            Transport::MarkerRewind => 61,
            Transport::MarkerForward => 62,
        }
    }

    pub fn from_cc(cc: u8) -> Option<Transport> {
        Transport::ALL.into_iter().find(|t| t.cc() == cc)
    }

    /// Buttons with a controllable LED.
    pub fn has_led(&self) -> bool {
        matches!(
            self,
            Transport::Play
                | Transport::Stop
                | Transport::Rewind
                | Transport::Forward
                | Transport::Record
                | Transport::Cycle
        )
    }

    /// Buttons latched in software: every press flips the committed value.
    pub fn is_toggle(&self) -> bool {
        matches!(
            self,
            Transport::Play | Transport::Record | Transport::Cycle | Transport::Set
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlKind {
    Slider(usize),
    Knob(usize),
    State(StateKind, usize),
    Transport(Transport),
}

fn in_block(cc: u8, base: u8) -> Option<usize> {
    let k = cc.checked_sub(base)? as usize;
    (k < NUM_CONTROLS).then_some(k)
}

pub fn slider_cc(track: usize) -> u8 {
    SLIDER_CC + track as u8
}

pub fn knob_cc(track: usize) -> u8 {
    KNOB_CC + track as u8
}

pub fn slider_index(cc: u8) -> Option<usize> {
    in_block(cc, SLIDER_CC)
}

pub fn knob_index(cc: u8) -> Option<usize> {
    in_block(cc, KNOB_CC)
}

/// Maps a raw CC number to the physical control it belongs to.
pub fn classify(cc: u8) -> Option<ControlKind> {
    if let Some(k) = slider_index(cc) {
        return Some(ControlKind::Slider(k));
    }
    if let Some(k) = knob_index(cc) {
        return Some(ControlKind::Knob(k));
    }
    if let Some(t) = Transport::from_cc(cc) {
        return Some(ControlKind::Transport(t));
    }
    StateKind::ALL
        .into_iter()
        .find_map(|kind| in_block(cc, kind.base_cc()).map(|k| ControlKind::State(kind, k)))
}

/// Fails if any two control blocks share a CC number.
pub fn validate_layout() -> Result<()> {
    let mut owners: Vec<(u8, String)> = Vec::new();
    let mut claim = |cc: u8, owner: String| -> Result<()> {
        if let Some((_, previous)) = owners.iter().find(|(c, _)| *c == cc) {
            bail!("CC {} is claimed by both {} and {}", cc, previous, owner);
        }
        owners.push((cc, owner));
        Ok(())
    };
    for k in 0..NUM_CONTROLS {
        claim(slider_cc(k), format!("slider {}", k + 1))?;
        claim(knob_cc(k), format!("knob {}", k + 1))?;
        for kind in StateKind::ALL {
            claim(kind.cc(k), format!("{:?} {}", kind, k + 1))?;
        }
    }
    for t in Transport::ALL {
        claim(t.cc(), format!("{:?}", t))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_has_no_overlapping_ranges() {
        validate_layout().unwrap();
    }

    #[test]
    fn classifies_every_block() {
        assert_eq!(classify(3), Some(ControlKind::Slider(3)));
        assert_eq!(classify(23), Some(ControlKind::Knob(7)));
        assert_eq!(classify(33), Some(ControlKind::State(StateKind::Solo, 1)));
        assert_eq!(classify(55), Some(ControlKind::State(StateKind::Mute, 7)));
        assert_eq!(classify(64), Some(ControlKind::State(StateKind::Record, 0)));
        assert_eq!(classify(46), Some(ControlKind::Transport(Transport::Cycle)));
        assert_eq!(classify(62), Some(ControlKind::Transport(Transport::MarkerForward)));
        assert_eq!(classify(24), None);
        assert_eq!(classify(99), None);
    }

    #[test]
    fn toggle_and_led_subsets() {
        let toggles: Vec<_> = Transport::ALL.into_iter().filter(|t| t.is_toggle()).collect();
        assert_eq!(
            toggles,
            vec![Transport::Play, Transport::Record, Transport::Cycle, Transport::Set]
        );
        assert!(!Transport::Set.has_led());
        assert!(Transport::Stop.has_led());
        assert!(!Transport::TrackForward.has_led());
    }
}
