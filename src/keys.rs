// src/keys.rs
//! Keyboard shortcuts, mirroring what the hardware buttons do.

use crate::controller::Controller;
use crate::soundscape::Soundscape;
use crate::surface::{StateKind, Transport};
use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use once_cell::sync::Lazy;
use std::time::Duration;

const HELP: &str = "
    h  Help
    i  Initialize
    p  reset MIDI Ports
    k  reset Knobs
    l  reset sLiders
    s  Solo all
    a  solo none (All off)
    f  toggle one-Finger (slider up) mode
    x  toggle eXclusive solo
    w  toggle solo defeats mute (Who cares)
    m  Mute all
    u  Unmute all
    q  toggle mute override (Quiet)
    r  Record all
    d  record none (Disarm)
    e  toggle Exclusive record
    o  all Off
    1-9,0  choose synth
    -/=  marker rewind/forward
    arrows  rewind/forward, track rewind/forward
    /  toggle set (autotune)
    ctrl+p  Preset
    ctrl+q  Quit
";

/// Help overlay lines, trimmed.
pub static HELP_LINES: Lazy<Vec<&'static str>> =
    Lazy::new(|| HELP.trim().lines().map(str::trim).collect());

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyCommand {
    ToggleHelp,
    Initialize,
    ResetMidi,
    ResetKnobs,
    ResetSliders,
    SoloAll(bool),
    ToggleSliderUp,
    ToggleSoloExclusive,
    ToggleSoloDefeatsMute,
    MuteAll(bool),
    ToggleMuteOverride,
    RecordAll(bool),
    ToggleRecordExclusive,
    AllStatesOff,
    /// 0-based synth number.
    SelectSynth(usize),
    Tap(Transport),
    ToggleSet,
    Preset,
    Quit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyResult {
    Continue,
    /// The screen must be cleared and drawn again.
    Redraw,
    /// Run this command on the next tick, after the soundscape has caught up.
    Then(KeyCommand),
    Quit,
}

/// Maps a key press; letters also answer on the Hebrew SI 1452 layout.
pub fn map_key(key: KeyEvent) -> Option<KeyCommand> {
    if key.kind == KeyEventKind::Release {
        return None;
    }
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        return match key.code {
            KeyCode::Char('q') | KeyCode::Char('c') => Some(KeyCommand::Quit),
            KeyCode::Char('p') => Some(KeyCommand::Preset),
            _ => None,
        };
    }
    let c = match key.code {
        KeyCode::Left => return Some(KeyCommand::Tap(Transport::Rewind)),
        KeyCode::Right => return Some(KeyCommand::Tap(Transport::Forward)),
        KeyCode::Down => return Some(KeyCommand::Tap(Transport::TrackRewind)),
        KeyCode::Up => return Some(KeyCommand::Tap(Transport::TrackForward)),
        KeyCode::Char(c) => c.to_lowercase().next()?,
        _ => return None,
    };
    let command = match c {
        'h' | 'י' => KeyCommand::ToggleHelp,
        'i' | 'ת' => KeyCommand::Initialize,
        'p' | 'פ' => KeyCommand::ResetMidi,
        'k' | 'ל' => KeyCommand::ResetKnobs,
        'l' | 'ך' => KeyCommand::ResetSliders,
        's' | 'ד' => KeyCommand::SoloAll(true),
        'a' | 'ש' => KeyCommand::SoloAll(false),
        'f' | 'כ' => KeyCommand::ToggleSliderUp,
        'x' | 'ס' => KeyCommand::ToggleSoloExclusive,
        'w' | 'ן' => KeyCommand::ToggleSoloDefeatsMute,
        'm' | 'צ' => KeyCommand::MuteAll(true),
        'u' | 'ו' => KeyCommand::MuteAll(false),
        'q' | 'ץ' => KeyCommand::ToggleMuteOverride,
        'r' | 'ר' => KeyCommand::RecordAll(true),
        'd' | 'ג' => KeyCommand::RecordAll(false),
        'e' | 'ק' => KeyCommand::ToggleRecordExclusive,
        'o' | 'ם' => KeyCommand::AllStatesOff,
        '-' => KeyCommand::Tap(Transport::MarkerRewind),
        '+' | '=' => KeyCommand::Tap(Transport::MarkerForward),
        '/' => KeyCommand::ToggleSet,
        digit => {
            let d = digit.to_digit(10)? as usize;
            KeyCommand::SelectSynth((d + 9) % 10)
        }
    };
    Some(command)
}

/// One pending key press, without blocking.
pub fn poll_key() -> Result<Option<KeyCommand>> {
    if !event::poll(Duration::ZERO)? {
        return Ok(None);
    }
    match event::read()? {
        Event::Key(key) => Ok(map_key(key)),
        _ => Ok(None),
    }
}

fn initialize(ctrl: &mut Controller, sound: &mut Soundscape) -> Result<()> {
    ctrl.reset()?;
    sound.reset();
    Ok(())
}

pub fn apply(command: KeyCommand, ctrl: &mut Controller, sound: &mut Soundscape) -> Result<KeyResult> {
    match command {
        KeyCommand::ToggleHelp => {
            let showing = ctrl.edit(|s| {
                s.show_help = !s.show_help;
                s.show_help
            });
            if !showing {
                ctrl.restage_controls();
            }
            return Ok(KeyResult::Redraw);
        }
        KeyCommand::Initialize => {
            initialize(ctrl, sound)?;
            return Ok(KeyResult::Redraw);
        }
        KeyCommand::ResetMidi => ctrl.reset_midi()?,
        KeyCommand::ResetKnobs => ctrl.reset_knobs(),
        KeyCommand::ResetSliders => ctrl.reset_sliders(),
        KeyCommand::SoloAll(on) => ctrl.toggle_all(&[StateKind::Solo], on),
        KeyCommand::ToggleSliderUp => ctrl.edit(|s| s.global_controls.toggle_slider_up()),
        KeyCommand::ToggleSoloExclusive => ctrl.edit(|s| s.global_controls.toggle_solo_exclusive()),
        KeyCommand::ToggleSoloDefeatsMute => ctrl.edit(|s| {
            s.global_controls.solo_defeats_mute = !s.global_controls.solo_defeats_mute
        }),
        KeyCommand::MuteAll(on) => ctrl.toggle_all(&[StateKind::Mute], on),
        KeyCommand::ToggleMuteOverride => ctrl.edit(|s| {
            s.global_controls.mute_override = !s.global_controls.mute_override
        }),
        KeyCommand::RecordAll(on) => ctrl.toggle_all(&[StateKind::Record], on),
        KeyCommand::ToggleRecordExclusive => ctrl.edit(|s| {
            s.global_controls.record_exclusive = !s.global_controls.record_exclusive
        }),
        KeyCommand::AllStatesOff => ctrl.toggle_all(&StateKind::ALL, false),
        KeyCommand::SelectSynth(num) => {
            if num < sound.instruments().len() {
                ctrl.edit(|s| s.marker_register = num as i64);
            }
        }
        KeyCommand::Tap(t) => ctrl.tap_transport(t),
        KeyCommand::ToggleSet => ctrl.toggle_transport(Transport::Set),
        KeyCommand::Preset => {
            initialize(ctrl, sound)?;
            ctrl.edit(|s| {
                s.marker_register = -1;
                s.transport_register.syn = 1;
                s.transport_register.smp = 3;
                s.global_controls.slider_up = true;
                s.global_controls.solo_exclusive = true;
            });
            ctrl.toggle_transport(Transport::Set);
            return Ok(KeyResult::Then(KeyCommand::Tap(Transport::TrackForward)));
        }
        KeyCommand::Quit => return Ok(KeyResult::Quit),
    }
    Ok(KeyResult::Continue)
}
