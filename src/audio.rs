//! Microphone capture: cpal input -> 16kHz mono frames -> utterances ->
//! remote transcription
//!
//! The cpal stream is not `Send`, so it lives on a dedicated device thread
//! that also runs the segmenter. Finished utterances are transcribed on the
//! tokio runtime. Every abort bumps an epoch; audio and transcripts tagged
//! with an older epoch are thrown away.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use flume::{Receiver, RecvTimeoutError, Sender};
use rubato::{FftFixedIn, Resampler};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::capture::{CaptureEvent, SpeechCapture};
use crate::config::SpeechConfig;
use crate::error::{Error, Result};
use crate::segmenter::{FRAME_SAMPLES, Segmenter, SegmenterConfig, TARGET_RATE};
use crate::transcriber::RemoteTranscriber;
use crate::vad::EnergyVad;

const RESAMPLE_CHUNK: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn audio_err(e: impl std::fmt::Display) -> Error {
    Error::Audio(e.to_string())
}

struct FrameResampler {
    resampler: Option<FftFixedIn<f32>>,
    in_buf: Vec<f32>,
    pending: Vec<f32>,
    frame_samples: usize,
}

impl FrameResampler {
    fn new(in_hz: usize, out_hz: usize, frame_samples: usize) -> Result<Self> {
        let resampler = if in_hz == out_hz {
            None
        } else {
            Some(FftFixedIn::<f32>::new(in_hz, out_hz, RESAMPLE_CHUNK, 1, 1).map_err(audio_err)?)
        };
        Ok(Self {
            resampler,
            in_buf: Vec::with_capacity(RESAMPLE_CHUNK),
            pending: Vec::with_capacity(frame_samples),
            frame_samples,
        })
    }

    fn push(&mut self, src: &[f32], mut emit: impl FnMut(&[f32])) {
        let Some(resampler) = self.resampler.as_mut() else {
            Self::emit_frames(&mut self.pending, self.frame_samples, src, &mut emit);
            return;
        };

        self.in_buf.extend_from_slice(src);
        while self.in_buf.len() >= RESAMPLE_CHUNK {
            let chunk: Vec<f32> = self.in_buf.drain(..RESAMPLE_CHUNK).collect();
            match resampler.process(&[&chunk], None) {
                Ok(out) => {
                    Self::emit_frames(&mut self.pending, self.frame_samples, &out[0], &mut emit)
                }
                Err(e) => warn!(error = %e, "resample failed, chunk dropped"),
            }
        }
    }

    fn emit_frames(
        pending: &mut Vec<f32>,
        frame_samples: usize,
        data: &[f32],
        emit: &mut impl FnMut(&[f32]),
    ) {
        pending.extend_from_slice(data);
        while pending.len() >= frame_samples {
            let frame: Vec<f32> = pending.drain(..frame_samples).collect();
            emit(&frame);
        }
    }
}

fn to_mono(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        data.to_vec()
    } else {
        data.chunks(channels)
            .map(|c| c.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}

enum AudioMsg {
    /// 16kHz frame tagged with the epoch it was captured in
    Frame(u64, Vec<f32>),
    /// Finalize the utterance in progress
    Flush,
}

/// State shared between the capture handle, the device thread, the cpal
/// callbacks and transcription tasks
struct Shared {
    active: AtomicBool,
    epoch: AtomicU64,
    /// Device thread has exited or its stream failed
    dead: AtomicBool,
    shutdown: AtomicBool,
    events: Sender<CaptureEvent>,
    transcriber: RemoteTranscriber,
    runtime: Handle,
}

impl Shared {
    fn fail(&self, message: String) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.events.send(CaptureEvent::Error(message));
    }

    fn transcribe(self: &Arc<Self>, samples: Vec<f32>, epoch: u64) {
        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = shared.transcriber.transcribe(&samples).await;
            if shared.epoch.load(Ordering::SeqCst) != epoch {
                debug!("capture aborted, discarding transcript");
                return;
            }
            match result {
                Ok(text) if text.is_empty() => debug!("empty transcription"),
                Ok(text) => {
                    let _ = shared.events.send(CaptureEvent::Transcript(text));
                }
                Err(e) => shared.fail(e.to_string()),
            }
        });
    }
}

/// Default input device, segmented by energy and transcribed remotely
pub struct MicCapture {
    shared: Arc<Shared>,
    vad: EnergyVad,
    segmenter: SegmenterConfig,
    control: Mutex<Option<Sender<AudioMsg>>>,
}

impl MicCapture {
    pub fn new(
        speech: &SpeechConfig,
        transcriber: RemoteTranscriber,
        events: Sender<CaptureEvent>,
        runtime: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                active: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                dead: AtomicBool::new(true),
                shutdown: AtomicBool::new(false),
                events,
                transcriber,
                runtime,
            }),
            vad: EnergyVad::new(speech.energy_threshold),
            segmenter: SegmenterConfig::from(speech),
            control: Mutex::new(None),
        }
    }

    /// Spawn the device thread. The stream is opened there, and a failure to
    /// open comes back as a capture error rather than blocking the caller.
    fn spawn_device<S, F>(&self, open: F) -> Sender<AudioMsg>
    where
        F: FnOnce(&Arc<Shared>, Sender<AudioMsg>) -> Result<S> + Send + 'static,
    {
        let (msg_tx, msg_rx) = flume::unbounded();
        let shared = Arc::clone(&self.shared);
        let frames_tx = msg_tx.clone();
        let segmenter = Segmenter::new(self.vad, self.segmenter);

        shared.dead.store(false, Ordering::SeqCst);
        thread::spawn(move || {
            let stream = match open(&shared, frames_tx) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "microphone failed to open");
                    shared.dead.store(true, Ordering::SeqCst);
                    shared.fail(e.to_string());
                    return;
                }
            };
            run_device(&shared, msg_rx, segmenter);
            shared.dead.store(true, Ordering::SeqCst);
            drop(stream);
            debug!("microphone thread finished");
        });
        msg_tx
    }

    fn send(&self, msg: AudioMsg) {
        let control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = control.as_ref() {
            let _ = tx.send(msg);
        }
    }
}

impl SpeechCapture for MicCapture {
    fn start(&self) -> Result<()> {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.shared.active.swap(true, Ordering::SeqCst) {
            debug!("microphone capture started");
        }
        if control.is_none() || self.shared.dead.load(Ordering::SeqCst) {
            *control = Some(self.spawn_device(open_stream));
        }
        Ok(())
    }

    fn abort(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(epoch, "microphone capture aborted");
    }

    fn stop(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
        self.send(AudioMsg::Flush);
    }

    fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
    }
}

fn open_stream(shared: &Arc<Shared>, frames_tx: Sender<AudioMsg>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device".into()))?;
    let supported = device.default_input_config().map_err(audio_err)?;
    let input_rate = supported.sample_rate() as usize;
    let channels = supported.channels() as usize;
    info!(input_rate, channels, target_rate = TARGET_RATE, "microphone opened");

    let mut resampler = FrameResampler::new(input_rate, TARGET_RATE, FRAME_SAMPLES)?;
    let data_shared = Arc::clone(shared);
    let err_shared = Arc::clone(shared);

    let stream = device
        .build_input_stream(
            &supported.config(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !data_shared.active.load(Ordering::SeqCst) {
                    return;
                }
                let epoch = data_shared.epoch.load(Ordering::SeqCst);
                resampler.push(&to_mono(data, channels), |frame| {
                    let _ = frames_tx.send(AudioMsg::Frame(epoch, frame.to_vec()));
                });
            },
            move |err| {
                warn!(error = %err, "input stream error");
                err_shared.dead.store(true, Ordering::SeqCst);
                err_shared.fail(err.to_string());
            },
            None,
        )
        .map_err(audio_err)?;
    stream.play().map_err(audio_err)?;
    Ok(stream)
}

fn run_device(shared: &Arc<Shared>, rx: Receiver<AudioMsg>, mut segmenter: Segmenter) {
    let mut current_epoch = shared.epoch.load(Ordering::SeqCst);

    while !shared.dead.load(Ordering::SeqCst) && !shared.shutdown.load(Ordering::SeqCst) {
        let msg = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let epoch = shared.epoch.load(Ordering::SeqCst);
        if epoch != current_epoch {
            segmenter.reset();
            current_epoch = epoch;
        }

        match msg {
            AudioMsg::Frame(frame_epoch, frame) => {
                if frame_epoch != current_epoch {
                    continue;
                }
                if let Some(samples) = segmenter.push(&frame) {
                    shared.transcribe(samples, current_epoch);
                }
            }
            AudioMsg::Flush => {
                if let Some(samples) = segmenter.flush() {
                    shared.transcribe(samples, current_epoch);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_when_rates_match() {
        let mut resampler = FrameResampler::new(16000, 16000, 4).unwrap();
        let mut frames = Vec::new();
        resampler.push(&[1.0; 10], |f| frames.push(f.to_vec()));
        assert_eq!(frames.len(), 2);
        resampler.push(&[1.0; 2], |f| frames.push(f.to_vec()));
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn downsampling_yields_fixed_frames() {
        let mut resampler = FrameResampler::new(48000, 16000, FRAME_SAMPLES).unwrap();
        let mut frames = Vec::new();
        for _ in 0..20 {
            resampler.push(&[0.0; 4800], |f| frames.push(f.len()));
        }
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|&len| len == FRAME_SAMPLES));
    }

    fn capture(events: Sender<CaptureEvent>) -> MicCapture {
        let client = crate::llm::ApiClient::new(&crate::config::LlmConfig {
            endpoint: "https://example.invalid".into(),
            deployment: "d".into(),
            ..crate::config::LlmConfig::default()
        })
        .unwrap();
        let transcriber = RemoteTranscriber::new(client, "whisper", TARGET_RATE as u32);
        MicCapture::new(&SpeechConfig::default(), transcriber, events, Handle::current())
    }

    #[tokio::test]
    async fn slow_device_open_does_not_block_the_caller() {
        let (tx, rx) = flume::unbounded();
        let mic = capture(tx);
        mic.shared.active.store(true, Ordering::SeqCst);

        let (release_tx, release_rx) = flume::bounded::<()>(1);
        let opened = std::time::Instant::now();
        mic.spawn_device(move |_, _| -> Result<()> {
            let _ = release_rx.recv();
            Err(Error::Audio("no input device".into()))
        });
        assert!(opened.elapsed() < Duration::from_secs(1));
        assert!(!mic.shared.dead.load(Ordering::SeqCst));

        release_tx.send(()).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, CaptureEvent::Error(ref m) if m.contains("no input device")));
        assert!(mic.shared.dead.load(Ordering::SeqCst));
        assert!(!mic.is_active());
    }

    #[test]
    fn stereo_is_averaged() {
        assert_eq!(to_mono(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
        assert_eq!(to_mono(&[0.25], 1), vec![0.25]);
    }
}
