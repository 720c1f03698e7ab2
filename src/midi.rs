// src/midi.rs
use crate::surface::CC_STATUS;
use anyhow::{anyhow, Context, Result};
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use tracing::{debug, info, warn};

const APP_NAME: &str = "nanotron";

/// Bidirectional CC link to the control surface.
pub trait MidiLink {
    /// Next pending `(cc, value)` pair, without blocking.
    fn poll(&mut self) -> Option<(u8, u8)>;
    fn send_cc(&mut self, cc: u8, value: u8);
    /// Closes both ports and binds them again by device name.
    fn reconnect(&mut self) -> Result<()>;
}

/// Case-insensitive prefix match of an enumerated port name against the configured device.
pub fn port_name_matches(port_name: &str, device: &str) -> bool {
    port_name.to_lowercase().starts_with(&device.to_lowercase())
}

fn pick_port(names: &[String], device: &str, direction: &str) -> Result<usize> {
    names
        .iter()
        .position(|name| port_name_matches(name, device))
        .ok_or_else(|| {
            anyhow!(
                "MIDI {} device '{}' not found (available: {:?})",
                direction,
                device,
                names
            )
        })
}

/// The real hardware link: one input and one output port of the same device.
pub struct MidiPorts {
    in_device: String,
    out_device: String,
    input: Option<MidiInputConnection<()>>,
    output: Option<MidiOutputConnection>,
    receiver: Option<Receiver<(u8, u8)>>,
}

impl MidiPorts {
    /// Binds both ports; a missing device is an error the caller treats as fatal.
    pub fn open(in_device: &str, out_device: &str) -> Result<Self> {
        let mut ports = Self {
            in_device: in_device.to_string(),
            out_device: out_device.to_string(),
            input: None,
            output: None,
            receiver: None,
        };
        ports.connect()?;
        Ok(ports)
    }

    fn close(&mut self) {
        if let Some(conn) = self.input.take() {
            conn.close();
        }
        if let Some(conn) = self.output.take() {
            conn.close();
        }
        self.receiver = None;
    }

    fn connect(&mut self) -> Result<()> {
        self.close();

        let mut midi_in = MidiInput::new(APP_NAME)?;
        midi_in.ignore(Ignore::All);
        let midi_out = MidiOutput::new(APP_NAME)?;

        let in_ports = midi_in.ports();
        let in_names = in_ports
            .iter()
            .map(|p| midi_in.port_name(p))
            .collect::<Result<Vec<_>, _>>()?;
        let out_ports = midi_out.ports();
        let out_names = out_ports
            .iter()
            .map(|p| midi_out.port_name(p))
            .collect::<Result<Vec<_>, _>>()?;

        let in_index = pick_port(&in_names, &self.in_device, "input")?;
        let out_index = pick_port(&out_names, &self.out_device, "output")?;
        info!("In MIDI ports: {:?} -> {}", in_names, in_index);
        info!("Out MIDI ports: {:?} -> {}", out_names, out_index);

        let (sender, receiver) = mpsc::channel();
        let input = midi_in
            .connect(
                &in_ports[in_index],
                "nanotron-in",
                move |_stamp, message, _| {
                    if message.len() < 3 || message[0] & 0xF0 != CC_STATUS {
                        return;
                    }
                    sender.send((message[1], message[2])).ok();
                },
                (),
            )
            .map_err(|e| anyhow!("Failed to connect to MIDI input port: {}", e))?;
        let output = midi_out
            .connect(&out_ports[out_index], "nanotron-out")
            .map_err(|e| anyhow!("Failed to connect to MIDI output port: {}", e))?;

        self.input = Some(input);
        self.output = Some(output);
        self.receiver = Some(receiver);
        Ok(())
    }
}

impl MidiLink for MidiPorts {
    fn poll(&mut self) -> Option<(u8, u8)> {
        let receiver = self.receiver.as_ref()?;
        match receiver.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                warn!("MIDI input callback disconnected");
                self.receiver = None;
                None
            }
        }
    }

    fn send_cc(&mut self, cc: u8, value: u8) {
        if let Some(output) = self.output.as_mut() {
            if let Err(e) = output.send(&[CC_STATUS, cc, value]) {
                debug!("Failed to send CC {}={}: {}", cc, value, e);
            }
        }
    }

    fn reconnect(&mut self) -> Result<()> {
        self.connect().context("Failed to re-bind MIDI ports")
    }
}

impl Drop for MidiPorts {
    fn drop(&mut self) {
        self.close();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_matching_is_case_insensitive_prefix() {
        assert!(port_name_matches("nanoKONTROL2 1 SLIDER/KNOB", "nanokontrol2 1"));
        assert!(port_name_matches("NANOKONTROL2 1:0", "nanoKONTROL2 1"));
        assert!(!port_name_matches("Midi Through nanoKONTROL2 1", "nanoKONTROL2 1"));
    }

    #[test]
    fn missing_device_is_an_error() {
        let names = vec!["Midi Through Port-0".to_string(), "nanoKEY2".to_string()];
        assert!(pick_port(&names, "nanoKONTROL2", "input").is_err());
        let names = vec!["Midi Through".to_string(), "nanoKONTROL2 1 CTRL".to_string()];
        assert_eq!(pick_port(&names, "nanoKONTROL2", "input").unwrap(), 1);
    }
}
