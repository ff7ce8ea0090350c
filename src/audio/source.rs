//! Microphone source: single capture device, many consumers.
//!
//! The source is an actor owning the capture hardware. Subscribers receive a
//! lazy stream of fixed-size PCM frames over bounded channels; named buffers
//! accumulate frames until stopped. The device is acquired when the first
//! consumer appears and released when the last one leaves.
//!
//! Frames are delivered in production order to each subscriber. Slow
//! subscribers do not stall capture: their queue overflows are counted and
//! reported, never silently unbounded. On a capture failure every consumer
//! receives an end-of-stream marker (a zero-length frame) and the source
//! stays in an error state until all consumers leave, after which the next
//! consumer re-acquires the device.

use crate::config::{AudioConfig, MicBackend};
use crate::error::{AssistantError, Result};
use crate::pipeline::messages::AudioFrame;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Identifies one streaming subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

enum SourceCommand {
    StartStreaming {
        sink: mpsc::Sender<AudioFrame>,
        reply: oneshot::Sender<SubscriberId>,
    },
    StopStreaming {
        id: SubscriberId,
    },
    StartBuffer {
        name: String,
    },
    StopBuffer {
        name: String,
        reply: oneshot::Sender<Vec<u8>>,
    },
    Inject {
        frame: AudioFrame,
    },
    Shutdown,
}

enum CaptureEvent {
    Frame(AudioFrame),
    Failed(String),
}

/// Handle to the microphone source actor.
#[derive(Clone)]
pub struct AudioSourceHandle {
    tx: mpsc::Sender<SourceCommand>,
    sample_rate: u32,
}

impl AudioSourceHandle {
    /// Subscribe to the frame stream; capture starts if this is the first
    /// consumer.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the source actor has shut down.
    pub async fn start_streaming(&self, sink: mpsc::Sender<AudioFrame>) -> Result<SubscriberId> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SourceCommand::StartStreaming { sink, reply })
            .await
            .map_err(|_| AssistantError::Channel("audio source stopped".into()))?;
        rx.await
            .map_err(|_| AssistantError::Channel("audio source stopped".into()))
    }

    /// Unsubscribe; capture stops when the last consumer leaves.
    pub async fn stop_streaming(&self, id: SubscriberId) {
        let _ = self.tx.send(SourceCommand::StopStreaming { id }).await;
    }

    /// Start accumulating frames into a named buffer.
    pub async fn start_buffer(&self, name: &str) {
        let _ = self
            .tx
            .send(SourceCommand::StartBuffer { name: name.into() })
            .await;
    }

    /// Stop a named buffer and return the accumulated PCM bytes.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the source actor has shut down.
    pub async fn stop_buffer(&self, name: &str) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SourceCommand::StopBuffer {
                name: name.into(),
                reply,
            })
            .await
            .map_err(|_| AssistantError::Channel("audio source stopped".into()))?;
        rx.await
            .map_err(|_| AssistantError::Channel("audio source stopped".into()))
    }

    /// Feed a frame into the fan-out path (dummy backend only).
    pub async fn inject(&self, frame: AudioFrame) {
        let _ = self.tx.send(SourceCommand::Inject { frame }).await;
    }

    /// Ask the source actor to exit.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(SourceCommand::Shutdown).await;
    }

    /// The sample rate frames are produced at.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Spawn the microphone source actor.
pub fn spawn(config: AudioConfig) -> AudioSourceHandle {
    let (tx, rx) = mpsc::channel(32);
    let sample_rate = config.sample_rate;
    tokio::spawn(run(config, rx));
    AudioSourceHandle { tx, sample_rate }
}

struct SourceState {
    config: AudioConfig,
    subscribers: Vec<(SubscriberId, mpsc::Sender<AudioFrame>)>,
    buffers: HashMap<String, Vec<u8>>,
    capture: Option<CancellationToken>,
    /// Terminal error state for the current capture session.
    failed: bool,
    next_id: u64,
    dropped: u64,
}

impl SourceState {
    fn consumer_count(&self) -> usize {
        self.subscribers.len() + self.buffers.len()
    }

    fn deliver(&mut self, frame: &AudioFrame) {
        for (id, sink) in &self.subscribers {
            match sink.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped += 1;
                    if self.dropped.is_power_of_two() {
                        warn!("subscriber {id:?} queue full, {} frames dropped", self.dropped);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        if !frame.is_end_of_stream() {
            let bytes = frame.to_bytes();
            for buffer in self.buffers.values_mut() {
                buffer.extend_from_slice(&bytes);
            }
        }
    }
}

async fn run(config: AudioConfig, mut rx: mpsc::Receiver<SourceCommand>) {
    let (capture_tx, mut capture_rx) = mpsc::channel::<CaptureEvent>(config.channel_capacity);
    let mut state = SourceState {
        config,
        subscribers: Vec::new(),
        buffers: HashMap::new(),
        capture: None,
        failed: false,
        next_id: 0,
        dropped: 0,
    };

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    SourceCommand::StartStreaming { sink, reply } => {
                        state.next_id += 1;
                        let id = SubscriberId(state.next_id);
                        state.subscribers.push((id, sink));
                        let _ = reply.send(id);
                        maybe_acquire(&mut state, &capture_tx);
                    }
                    SourceCommand::StopStreaming { id } => {
                        state.subscribers.retain(|(sub, _)| *sub != id);
                        maybe_release(&mut state);
                    }
                    SourceCommand::StartBuffer { name } => {
                        state.buffers.insert(name, Vec::new());
                        maybe_acquire(&mut state, &capture_tx);
                    }
                    SourceCommand::StopBuffer { name, reply } => {
                        let data = state.buffers.remove(&name).unwrap_or_default();
                        let _ = reply.send(data);
                        maybe_release(&mut state);
                    }
                    SourceCommand::Inject { frame } => {
                        state.deliver(&frame);
                    }
                    SourceCommand::Shutdown => break,
                }
            }
            event = capture_rx.recv() => {
                match event {
                    Some(CaptureEvent::Frame(frame)) => state.deliver(&frame),
                    Some(CaptureEvent::Failed(reason)) => {
                        error!("capture failed: {reason}");
                        state.failed = true;
                        if let Some(cancel) = state.capture.take() {
                            cancel.cancel();
                        }
                        let eos = AudioFrame::end_of_stream(state.config.sample_rate);
                        state.deliver(&eos);
                    }
                    None => break,
                }
            }
        }
    }

    if let Some(cancel) = state.capture.take() {
        cancel.cancel();
    }
    debug!("audio source stopped");
}

fn maybe_acquire(state: &mut SourceState, capture_tx: &mpsc::Sender<CaptureEvent>) {
    if state.capture.is_some() || state.consumer_count() == 0 {
        return;
    }
    if state.failed {
        // A fresh consumer set gets a fresh attempt at the device.
        state.failed = false;
    }
    if state.config.system == MicBackend::Dummy {
        return;
    }

    let cancel = CancellationToken::new();
    let config = state.config.clone();
    let tx = capture_tx.clone();
    let token = cancel.clone();
    tokio::spawn(async move {
        match CpalMic::new(&config) {
            Ok(mic) => {
                if let Err(e) = mic.run(tx.clone(), token).await {
                    let _ = tx.send(CaptureEvent::Failed(e.to_string())).await;
                }
            }
            Err(e) => {
                let _ = tx.send(CaptureEvent::Failed(e.to_string())).await;
            }
        }
    });
    state.capture = Some(cancel);
    info!("capture acquired");
}

fn maybe_release(state: &mut SourceState) {
    if state.consumer_count() > 0 {
        return;
    }
    if let Some(cancel) = state.capture.take() {
        cancel.cancel();
        info!("capture released");
    }
    state.failed = false;
}

/// Microphone capture via cpal.
///
/// Captures at the device's native rate and converts to 16-bit mono frames
/// at the pipeline rate.
struct CpalMic {
    device: cpal::Device,
    stream_config: StreamConfig,
    target_sample_rate: u32,
    frame_samples: usize,
}

impl CpalMic {
    fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.device {
            let requested = host
                .input_devices()
                .map_err(|e| AssistantError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| match d.description() {
                    Ok(desc) => desc.name() == name,
                    Err(_) => false,
                });

            match requested {
                Some(device) => device,
                None => {
                    warn!("input device '{name}' not found, using default");
                    host.default_input_device()
                        .ok_or_else(|| AssistantError::Audio("no default input device".into()))?
                }
            }
        } else {
            host.default_input_device()
                .ok_or_else(|| AssistantError::Audio("no default input device".into()))?
        };

        let default_config = device
            .default_input_config()
            .map_err(|e| AssistantError::Audio(format!("no default input config: {e}")))?;

        let stream_config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            "input device ready: native {}Hz, {} channels",
            default_config.sample_rate(),
            default_config.channels()
        );

        Ok(Self {
            device,
            stream_config,
            target_sample_rate: config.sample_rate,
            frame_samples: config.frame_samples(),
        })
    }

    async fn run(&self, tx: mpsc::Sender<CaptureEvent>, cancel: CancellationToken) -> Result<()> {
        let native_rate = self.stream_config.sample_rate;
        let native_channels = self.stream_config.channels;
        let target_rate = self.target_sample_rate;
        let frame_len = self.frame_samples.max(1);
        let tx_frames = tx.clone();
        let mut pending: VecDeque<f32> = VecDeque::with_capacity(frame_len * 4);

        // Rate-limited reporting from the audio callback thread.
        let dropped_full = AtomicU64::new(0);
        let last_report_ms = AtomicU64::new(0);
        let tx_closed = AtomicBool::new(false);

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = if native_channels > 1 {
                        let ch = native_channels as usize;
                        data.chunks_exact(ch)
                            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
                            .collect()
                    } else {
                        data.to_vec()
                    };

                    let samples = if native_rate != target_rate {
                        super::wav::resample(&mono, native_rate, target_rate)
                    } else {
                        mono
                    };

                    pending.extend(samples.into_iter());

                    while pending.len() >= frame_len {
                        if tx_closed.load(Ordering::Relaxed) {
                            pending.clear();
                            break;
                        }

                        let mut out = Vec::with_capacity(frame_len);
                        for _ in 0..frame_len {
                            if let Some(s) = pending.pop_front() {
                                out.push((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
                            }
                        }

                        let frame = AudioFrame {
                            samples: out,
                            sample_rate: target_rate,
                        };
                        // try_send keeps the audio thread from blocking.
                        match tx_frames.try_send(CaptureEvent::Frame(frame)) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                dropped_full.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                tx_closed.store(true, Ordering::Relaxed);
                            }
                        }

                        let now_ms = SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_millis() as u64)
                            .unwrap_or(0);
                        let last = last_report_ms.load(Ordering::Relaxed);
                        if now_ms.saturating_sub(last) >= 2_000
                            && last_report_ms
                                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                                .is_ok()
                        {
                            let n = dropped_full.swap(0, Ordering::Relaxed);
                            if n > 0 {
                                debug!("capture channel full, dropped {n} frames (last 2s)");
                            }
                        }
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| AssistantError::Audio(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| AssistantError::Audio(format!("failed to start input stream: {e}")))?;

        info!("capture started: native {native_rate}Hz -> {target_rate}Hz");

        cancel.cancelled().await;

        drop(stream);
        info!("capture stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioConfig;

    fn dummy_config() -> AudioConfig {
        AudioConfig {
            system: MicBackend::Dummy,
            ..AudioConfig::default()
        }
    }

    fn frame(value: i16, len: usize) -> AudioFrame {
        AudioFrame {
            samples: vec![value; len],
            sample_rate: 16_000,
        }
    }

    #[tokio::test]
    async fn frames_fan_out_in_order() {
        let source = spawn(dummy_config());
        let (sink_a, mut rx_a) = mpsc::channel(16);
        let (sink_b, mut rx_b) = mpsc::channel(16);
        let _a = source.start_streaming(sink_a).await.unwrap();
        let _b = source.start_streaming(sink_b).await.unwrap();

        for value in [1i16, 2, 3] {
            source.inject(frame(value, 4)).await;
        }

        for rx in [&mut rx_a, &mut rx_b] {
            for expected in [1i16, 2, 3] {
                let got = rx.recv().await.unwrap();
                assert_eq!(got.samples[0], expected);
            }
        }
    }

    #[tokio::test]
    async fn named_buffer_accumulates_until_stopped() {
        let source = spawn(dummy_config());
        source.start_buffer("cmd").await;
        source.inject(frame(7, 2)).await;
        source.inject(frame(7, 2)).await;

        let data = source.stop_buffer("cmd").await.unwrap();
        // 4 samples * 2 bytes.
        assert_eq!(data.len(), 8);
        assert_eq!(&data[0..2], &7i16.to_le_bytes());
    }

    #[tokio::test]
    async fn stopped_subscriber_receives_nothing_more() {
        let source = spawn(dummy_config());
        let (sink, mut rx) = mpsc::channel(16);
        let id = source.start_streaming(sink).await.unwrap();
        source.inject(frame(1, 2)).await;
        assert!(rx.recv().await.is_some());

        source.stop_streaming(id).await;
        source.inject(frame(2, 2)).await;
        // Channel closes once the hub drops its sender.
        source.shutdown().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unknown_buffer_returns_empty() {
        let source = spawn(dummy_config());
        let data = source.stop_buffer("missing").await.unwrap();
        assert!(data.is_empty());
    }
}
