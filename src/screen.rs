// src/screen.rs
//! Minimal terminal view: synth and sample captions, one column per track, help overlay.

use crate::controller::{ControlState, Controller};
use crate::keys::HELP_LINES;
use crate::soundscape::Soundscape;
use crate::surface::{knob_cc, slider_cc, StateKind, KNOB_CENTER, NUM_CONTROLS};
use anyhow::Result;
use crossterm::{
    cursor::{Hide, MoveTo, Show},
    execute, queue,
    style::{Attribute, Print, SetAttribute},
    terminal::{self, disable_raw_mode, enable_raw_mode, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen},
};
use std::io::{self, Stdout, Write};

const COLUMN_WIDTH: u16 = 8;
const TITLE: &str = "nanotron";

/// Raw mode and the alternate screen for as long as it lives.
pub struct Screen {
    out: Stdout,
    last_captions: Option<(String, String)>,
    dirty: bool,
}

impl Screen {
    pub fn enter() -> Result<Self> {
        enable_raw_mode()?;
        let mut out = io::stdout();
        execute!(
            out,
            EnterAlternateScreen,
            Hide,
            terminal::SetTitle(TITLE),
            Clear(ClearType::All)
        )?;
        Ok(Self {
            out,
            last_captions: None,
            dirty: true,
        })
    }

    /// Forces a full repaint on the next draw.
    pub fn invalidate(&mut self) {
        self.dirty = true;
        self.last_captions = None;
    }

    /// Repaints when the controls, the captions or the overlay changed this tick.
    pub fn draw(&mut self, ctrl: &Controller, sound: &Soundscape) -> Result<()> {
        let captions = (sound.synth_display(), sound.second_display(ctrl));
        let state = ctrl.state();
        let changed = self.dirty
            || !ctrl.new_controls().is_empty()
            || self.last_captions.as_ref() != Some(&captions);
        if !changed {
            return Ok(());
        }

        queue!(self.out, Clear(ClearType::All), MoveTo(0, 0))?;
        queue!(
            self.out,
            SetAttribute(Attribute::Reverse),
            Print(&captions.0),
            SetAttribute(Attribute::Reset)
        )?;
        for (i, line) in captions.1.lines().enumerate() {
            queue!(self.out, MoveTo(0, 1 + i as u16), Print(line))?;
        }
        self.draw_globals(&state)?;
        self.draw_tracks(&state, sound)?;
        if state.show_help {
            self.draw_help()?;
        }
        self.out.flush()?;

        self.last_captions = Some(captions);
        self.dirty = false;
        Ok(())
    }

    fn draw_globals(&mut self, state: &ControlState) -> Result<()> {
        let (width, _) = terminal::size()?;
        for (y, (label, on)) in state.global_controls.labeled().into_iter().enumerate() {
            if on {
                let x = width.saturating_sub(label.len() as u16);
                queue!(
                    self.out,
                    MoveTo(x, y as u16),
                    SetAttribute(Attribute::Reverse),
                    Print(label),
                    SetAttribute(Attribute::Reset)
                )?;
            }
        }
        Ok(())
    }

    fn draw_tracks(&mut self, state: &ControlState, sound: &Soundscape) -> Result<()> {
        let top = 4;
        for k in 0..NUM_CONTROLS {
            let x = k as u16 * COLUMN_WIDTH;
            let knob = state.controls[knob_cc(k) as usize] as i16 - KNOB_CENTER as i16;
            let slider = state.controls[slider_cc(k) as usize];
            let flags: String = [
                (StateKind::Solo, 'S'),
                (StateKind::Mute, 'M'),
                (StateKind::Record, 'R'),
            ]
            .iter()
            .map(|&(kind, c)| if state.state(kind, k) { c } else { '.' })
            .collect();
            let muted = state.is_effective_mute(k);
            queue!(
                self.out,
                MoveTo(x, top),
                Print(sound.knob_label(state, k)),
                MoveTo(x, top + 1),
                Print(format!("{:+3}", knob)),
                MoveTo(x, top + 3),
                SetAttribute(if muted { Attribute::Dim } else { Attribute::Bold }),
                Print(format!("{:3}", slider)),
                SetAttribute(Attribute::Reset),
                MoveTo(x, top + 4),
                Print(flags)
            )?;
        }
        Ok(())
    }

    fn draw_help(&mut self) -> Result<()> {
        let (width, height) = terminal::size()?;
        let widest = HELP_LINES.iter().map(|l| l.chars().count()).max().unwrap_or(0) as u16;
        let x = width.saturating_sub(widest) / 2;
        let y = height.saturating_sub(HELP_LINES.len() as u16) / 2;
        queue!(self.out, SetAttribute(Attribute::Reverse))?;
        for (i, line) in HELP_LINES.iter().enumerate() {
            queue!(
                self.out,
                MoveTo(x, y + i as u16),
                Print(format!("{:width$}", line, width = widest as usize))
            )?;
        }
        queue!(self.out, SetAttribute(Attribute::Reset))?;
        Ok(())
    }
}

impl Drop for Screen {
    fn drop(&mut self) {
        let _ = execute!(self.out, Show, LeaveAlternateScreen);
        let _ = disable_raw_mode();
    }
}
