// src/audio_io.rs

use crate::audio_engine::{AudioEngine, MAX_BLOCK};
use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, Stream, StreamConfig};
use tracing::{error, info};

/// Starts the output stream on the default device, feeding it from `engine`.
///
/// # Returns
/// The running stream (dropping it stops playback) and the active sample rate.
pub fn init_and_run_stream(
    requested_sample_rate: Option<u32>,
    engine: AudioEngine,
) -> Result<(Stream, u32)> {
    let host = cpal::default_host();
    let output_device = host
        .default_output_device()
        .ok_or_else(|| anyhow::anyhow!("No default output device"))?;
    info!("Using output device: {}", output_device.name()?);

    let default_output_config = output_device.default_output_config()?;
    let sample_format = default_output_config.sample_format();
    let mut final_output_config: StreamConfig = default_output_config.into();
    if let Some(sr) = requested_sample_rate {
        final_output_config.sample_rate = cpal::SampleRate(sr);
    }

    let output_stream = match sample_format {
        SampleFormat::F32 => build_output_stream::<f32>(&output_device, &final_output_config, engine)?,
        SampleFormat::I16 => build_output_stream::<i16>(&output_device, &final_output_config, engine)?,
        SampleFormat::U16 => build_output_stream::<u16>(&output_device, &final_output_config, engine)?,
        format => return Err(anyhow::anyhow!("Unsupported sample format {}", format)),
    };
    output_stream.play()?;

    let active_sr = final_output_config.sample_rate.0;
    info!(
        "Started output stream: {} Hz, {} channels, {}",
        active_sr, final_output_config.channels, sample_format
    );
    Ok((output_stream, active_sr))
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut engine: AudioEngine,
) -> Result<Stream>
where
    T: Sample + cpal::SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let err_fn = |err| error!("an error occurred on output stream: {}", err);
    let mut mono_buffer = vec![0.0f32; MAX_BLOCK];

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            for chunk in data.chunks_mut(channels * MAX_BLOCK) {
                let mono = &mut mono_buffer[..chunk.len() / channels];
                engine.process_buffer(mono);
                for (frame, &sample_value) in chunk.chunks_mut(channels).zip(mono.iter()) {
                    let sample_value = sample_value.clamp(-1.0, 1.0);
                    for sample in frame.iter_mut() {
                        *sample = T::from_sample(sample_value);
                    }
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}
