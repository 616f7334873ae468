// Decode thread: pulls bytes from the streaming buffer, pushes PCM into the engine

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use spool_core::{
    AudioError, DecodeStatus, DecoderFactory, FormatInfo, FrameDecoder, Result, SeekTarget,
    SessionToken,
};
use spool_engine::{PcmFeeder, PlaybackEngine};
use spool_source_buffer::StreamingBuffer;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Controller to worker
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    Seek(u64),
    Stop,
}

/// Worker to controller
#[derive(Debug)]
pub(crate) enum DecoderEvent {
    Opened(FormatInfo),
    OpenFailed(AudioError),
    FrameErrors(Vec<String>),
    Seeked { target_ms: u64, actual_ms: u64 },
    SeekFailed { target_ms: u64, error: AudioError },
    Failed(AudioError),
}

#[derive(Debug)]
pub(crate) struct DecoderMessage {
    pub session: u64,
    pub event: DecoderEvent,
}

pub(crate) struct DecodeWorker {
    pub token: SessionToken,
    pub buffer: StreamingBuffer,
    pub hint: Option<String>,
    pub decoders: Arc<dyn DecoderFactory>,
    pub engine: Arc<PlaybackEngine>,
    pub commands: Receiver<WorkerCommand>,
    pub events: Sender<DecoderMessage>,
    /// How long to wait when the buffer or the ring has no room to make progress
    pub idle: Duration,
}

impl DecodeWorker {
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("spool-decode-{}", self.token.id()))
            .spawn(move || self.run())
            .map_err(|e| AudioError::Io(format!("spawn decode thread: {}", e)))
    }

    fn should_exit(&self) -> bool {
        self.buffer.is_closed() || !self.token.is_live()
    }

    fn emit(&self, event: DecoderEvent) -> bool {
        if !self.token.is_live() {
            return false;
        }
        self.events
            .send(DecoderMessage {
                session: self.token.id(),
                event,
            })
            .is_ok()
    }

    fn run(self) {
        let reader = self.buffer.reader();
        let mut decoder = match self.decoders.open(Box::new(reader), self.hint.as_deref()) {
            Ok(decoder) => decoder,
            Err(e) => {
                if !self.should_exit() {
                    log::error!("[decoder] open failed: {}", e);
                    self.emit(DecoderEvent::OpenFailed(e));
                }
                return;
            }
        };

        let format = decoder.format();
        let mut feeder = self.engine.configure(&format);
        if !self.emit(DecoderEvent::Opened(format)) {
            return;
        }

        let mut next: Option<WorkerCommand> = None;
        let mut ended = false;
        let mut end_reported = false;

        loop {
            let mut seek = None;
            for command in next.take().into_iter().chain(self.commands.try_iter()) {
                match command {
                    WorkerCommand::Stop => return,
                    WorkerCommand::Seek(ms) => seek = Some(ms),
                }
            }

            if let Some(target_ms) = seek {
                if !self.seek(decoder.as_mut(), &mut feeder, target_ms) {
                    return;
                }
                ended = false;
                end_reported = false;
                continue;
            }

            // The ring is full; let the device catch up
            if feeder.has_pending() && !feeder.drain() {
                match self.wait(Some(self.idle)) {
                    Wait::Command(command) => next = Some(command),
                    Wait::Timeout => {}
                    Wait::Disconnected => return,
                }
                continue;
            }

            if ended {
                if !end_reported {
                    end_reported = true;
                    if feeder.finish() {
                        log::info!("[decoder] end of stream");
                    }
                }
                match self.wait(None) {
                    Wait::Command(command) => next = Some(command),
                    _ => return,
                }
                continue;
            }

            match decoder.decode_next() {
                Ok(DecodeStatus::Frame(frame)) => {
                    feeder.write(&frame);
                }
                Ok(DecodeStatus::NeedMoreBytes) => match self.wait(Some(self.idle)) {
                    Wait::Command(command) => next = Some(command),
                    Wait::Timeout => {}
                    Wait::Disconnected => return,
                },
                Ok(DecodeStatus::EndOfStream) => ended = true,
                Err(AudioError::Io(message)) => {
                    if self.should_exit() {
                        return;
                    }
                    // Interrupted for a seek; the command is on its way
                    log::debug!("[decoder] read aborted: {}", message);
                    match self.wait(None) {
                        Wait::Command(command) => next = Some(command),
                        _ => return,
                    }
                }
                Err(e) => {
                    log::error!("[decoder] decode failed: {}", e);
                    self.emit(DecoderEvent::Failed(e));
                    return;
                }
            }

            let errors = decoder.take_frame_errors();
            if !errors.is_empty() {
                self.emit(DecoderEvent::FrameErrors(errors));
            }
        }
    }

    /// Returns false when the worker should exit
    fn seek(&self, decoder: &mut dyn FrameDecoder, feeder: &mut PcmFeeder, target_ms: u64) -> bool {
        self.buffer.clear_interrupt();
        match decoder.seek(SeekTarget::Time(target_ms)) {
            Ok(actual_ms) => {
                feeder.resync();
                self.emit(DecoderEvent::Seeked {
                    target_ms,
                    actual_ms,
                })
            }
            Err(error) => {
                if self.should_exit() {
                    return false;
                }
                feeder.resync();
                log::warn!("[decoder] seek to {} ms failed: {}", target_ms, error);
                self.emit(DecoderEvent::SeekFailed { target_ms, error })
            }
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Wait {
        match timeout {
            Some(timeout) => match self.commands.recv_timeout(timeout) {
                Ok(command) => Wait::Command(command),
                Err(RecvTimeoutError::Timeout) => Wait::Timeout,
                Err(RecvTimeoutError::Disconnected) => Wait::Disconnected,
            },
            None => match self.commands.recv() {
                Ok(command) => Wait::Command(command),
                Err(_) => Wait::Disconnected,
            },
        }
    }
}

enum Wait {
    Command(WorkerCommand),
    Timeout,
    Disconnected,
}
