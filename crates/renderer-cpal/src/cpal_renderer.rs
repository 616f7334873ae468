// cpal-based audio renderer

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use spool_core::{AudioError, Result};
use spool_renderer_api::{AudioCallback, AudioRenderer, AudioSpec};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

enum StreamCommand {
    Play,
    Pause,
    Shutdown,
}

type Request = (StreamCommand, Sender<Result<()>>);

/// cpal output stream.
///
/// The stream lives on its own thread, since cpal streams cannot move between
/// threads on every platform; this handle only sends it commands.
pub struct CpalRenderer {
    spec: AudioSpec,
    commands: Option<Sender<Request>>,
    worker: Option<JoinHandle<()>>,
    is_playing: Arc<AtomicBool>,
    user_callback: Arc<Mutex<Option<AudioCallback>>>,
}

impl CpalRenderer {
    pub fn new(spec: AudioSpec) -> Result<Self> {
        let is_playing = Arc::new(AtomicBool::new(false));
        let user_callback: Arc<Mutex<Option<AudioCallback>>> = Arc::new(Mutex::new(None));

        let (command_tx, command_rx) = bounded::<Request>(8);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

        let playing = is_playing.clone();
        let callback = user_callback.clone();
        let worker = thread::Builder::new()
            .name("cpal-output".to_string())
            .spawn(move || {
                let stream = match build_stream(spec, playing, callback) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                for (command, reply) in command_rx.iter() {
                    let result = match command {
                        StreamCommand::Play => stream
                            .play()
                            .map_err(|e| AudioError::Device(format!("Failed to start stream: {}", e))),
                        StreamCommand::Pause => stream
                            .pause()
                            .map_err(|e| AudioError::Device(format!("Failed to pause stream: {}", e))),
                        StreamCommand::Shutdown => {
                            let _ = reply.send(Ok(()));
                            break;
                        }
                    };
                    let _ = reply.send(result);
                }
                log::debug!("[renderer] output thread exiting");
            })
            .map_err(|e| AudioError::Device(format!("Failed to spawn output thread: {}", e)))?;

        ready_rx
            .recv()
            .map_err(|_| AudioError::Device("Output thread exited during setup".to_string()))??;

        log::info!(
            "[renderer] cpal output ready: {} Hz, {} ch",
            spec.sample_rate,
            spec.channels
        );

        Ok(Self {
            spec,
            commands: Some(command_tx),
            worker: Some(worker),
            is_playing,
            user_callback,
        })
    }

    fn send(&self, command: StreamCommand) -> Result<()> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| AudioError::Device("Renderer released".to_string()))?;
        let (reply_tx, reply_rx) = bounded(1);
        commands
            .send((command, reply_tx))
            .map_err(|_| AudioError::Device("Output thread is gone".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| AudioError::Device("Output thread is gone".to_string()))?
    }
}

fn build_stream(
    spec: AudioSpec,
    playing: Arc<AtomicBool>,
    user_callback: Arc<Mutex<Option<AudioCallback>>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::Device("No output device available".to_string()))?;

    let config = StreamConfig {
        channels: spec.channels,
        sample_rate: cpal::SampleRate(spec.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if !playing.load(Ordering::Relaxed) {
                    data.fill(0.0);
                    return;
                }

                // Never wait on the callback slot from the device thread
                let written = match user_callback.try_lock() {
                    Some(mut slot) => match slot.as_mut() {
                        Some(callback) => callback(data),
                        None => 0,
                    },
                    None => 0,
                };

                // Zero-fill any unwritten samples to prevent playing stale data
                if written < data.len() {
                    data[written..].fill(0.0);
                }
            },
            |err| {
                log::error!("[renderer] audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::Device(format!("Failed to build output stream: {}", e)))
}

impl AudioRenderer for CpalRenderer {
    fn start(&mut self) -> Result<()> {
        self.send(StreamCommand::Play)?;
        self.is_playing.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.is_playing.store(false, Ordering::Relaxed);
        self.send(StreamCommand::Pause)
    }

    fn pause(&mut self) -> Result<()> {
        self.stop()
    }

    fn resume(&mut self) -> Result<()> {
        self.start()
    }

    fn set_audio_callback(&mut self, callback: AudioCallback) -> Result<()> {
        *self.user_callback.lock() = Some(callback);
        Ok(())
    }

    fn get_sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    fn get_channels(&self) -> u16 {
        self.spec.channels
    }

    fn get_buffer_size(&self) -> usize {
        self.spec.buffer_size
    }

    fn is_playing(&self) -> bool {
        self.is_playing.load(Ordering::Relaxed)
    }

    fn release(&mut self) -> Result<()> {
        self.is_playing.store(false, Ordering::Relaxed);
        if self.commands.is_some() {
            let result = self.send(StreamCommand::Shutdown);
            self.commands = None;
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
            result?;
        }
        *self.user_callback.lock() = None;
        Ok(())
    }
}

impl Drop for CpalRenderer {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("[renderer] release on drop failed: {}", e);
        }
    }
}
