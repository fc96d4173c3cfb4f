//! Real-time audio engine
//!
//! The device callback only copies: mic input into the raw-capture ring,
//! playback samples to the device, and the just-rendered output into the
//! raw-render ring (the echo reference). It then pokes the worker through a
//! one-slot channel with `try_send`, so it never blocks.
//!
//! The worker thread does everything expensive: echo cancellation against
//! the rendered reference, gain, rate conversion, and the write into the
//! outbound ring the network layer drains.
//!
//! ```text
//!  mic ──▶ InputCallback ──▶ raw capture ─┐
//!                                         ├─▶ worker (AEC, gain) ──▶ outbound
//!  spk ◀── OutputCallback ─▶ raw render ──┘
//!              ▲
//!          playback ◀── network
//! ```

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::backend::AudioBackend;
use super::buffer::{AudioConsumer, AudioProducer, AudioRingBuffer, RingMonitor};
use super::device::{DeviceFormat, DeviceProbe};
use super::processing::{apply_gain, resample_linear, EchoCanceller};
use super::source::MediaSource;
use crate::config::AudioConfig;
use crate::error::AudioError;

/// How the device streams are arranged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Input and output share one device clock
    Duplex,
    /// Independent input and output streams; the echo reference is resampled
    /// to the capture rate
    Separate,
    InputOnly,
    OutputOnly,
    Disabled,
}

impl StreamMode {
    pub fn has_input(self) -> bool {
        matches!(self, StreamMode::Duplex | StreamMode::Separate | StreamMode::InputOnly)
    }

    pub fn has_output(self) -> bool {
        matches!(self, StreamMode::Duplex | StreamMode::Separate | StreamMode::OutputOnly)
    }
}

/// A negotiated stream layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamPlan {
    pub mode: StreamMode,
    pub input: Option<DeviceFormat>,
    pub output: Option<DeviceFormat>,
}

impl StreamPlan {
    fn disabled() -> Self {
        Self {
            mode: StreamMode::Disabled,
            input: None,
            output: None,
        }
    }

    /// Same plan restricted to one direction
    fn restrict(&self, mode: StreamMode) -> Self {
        Self {
            mode,
            input: if mode.has_input() { self.input } else { None },
            output: if mode.has_output() { self.output } else { None },
        }
    }
}

/// Pick a stream layout from what the devices report.
pub fn negotiate(probe: &DeviceProbe) -> StreamPlan {
    let mode = match (probe.input, probe.output) {
        (Some(i), Some(o)) if i.sample_rate == o.sample_rate && probe.input_name == probe.output_name => {
            StreamMode::Duplex
        }
        (Some(_), Some(_)) => StreamMode::Separate,
        (Some(_), None) => StreamMode::InputOnly,
        (None, Some(_)) => StreamMode::OutputOnly,
        (None, None) => StreamMode::Disabled,
    };
    StreamPlan {
        mode,
        input: probe.input,
        output: probe.output,
    }
}

/// Plans to try in order: the negotiated one, separate streams after a
/// failed duplex open, then each direction alone.
fn fallback_plans(plan: &StreamPlan) -> Vec<StreamPlan> {
    let mut plans = vec![plan.clone()];
    if plan.mode == StreamMode::Duplex {
        plans.push(plan.restrict(StreamMode::Separate));
    }
    if plan.mode.has_input() && plan.mode.has_output() {
        plans.push(plan.restrict(StreamMode::OutputOnly));
        plans.push(plan.restrict(StreamMode::InputOnly));
    }
    plans
}

#[derive(Debug, Default)]
struct EngineCounters {
    input_callbacks: AtomicU64,
    output_callbacks: AtomicU64,
    worker_iterations: AtomicU64,
    samples_processed: AtomicU64,
    echo_cancelled_batches: AtomicU64,
    echo_skipped_batches: AtomicU64,
    missed_signals: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub mode: StreamMode,
    pub input_callbacks: u64,
    pub output_callbacks: u64,
    pub worker_iterations: u64,
    pub samples_processed: u64,
    pub echo_cancelled_batches: u64,
    pub echo_skipped_batches: u64,
    pub missed_signals: u64,
    pub playback_underruns: u64,
    pub outbound_dropped: u64,
}

/// Mic-side real-time callback
pub struct InputCallback {
    raw_capture: AudioProducer,
    channels: usize,
    mono: Vec<f32>,
    signal: Sender<()>,
    shutdown: Arc<AtomicBool>,
    counters: Arc<EngineCounters>,
}

impl InputCallback {
    /// Copy interleaved input into the raw capture ring as mono.
    pub fn process(&mut self, data: &[f32]) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let channels = self.channels.max(1);
        for chunk in data.chunks(self.mono.len() * channels) {
            let frames = chunk.len() / channels;
            for (m, frame) in self.mono[..frames].iter_mut().zip(chunk.chunks_exact(channels)) {
                *m = frame.iter().sum::<f32>() / channels as f32;
            }
            self.raw_capture.write(&self.mono[..frames]);
        }
        self.counters.input_callbacks.fetch_add(1, Ordering::Relaxed);
        if self.signal.try_send(()).is_err() {
            self.counters.missed_signals.fetch_add(1, Ordering::Relaxed);
        }
    }
}

enum PlaybackFeed {
    Ring(AudioConsumer),
    /// Local mirror: pull from a media source directly
    Media(Arc<Mutex<Box<dyn MediaSource>>>),
}

/// Speaker-side real-time callback
pub struct OutputCallback {
    feed: PlaybackFeed,
    raw_render: Option<AudioProducer>,
    channels: usize,
    mono: Vec<f32>,
    signal: Sender<()>,
    shutdown: Arc<AtomicBool>,
    counters: Arc<EngineCounters>,
}

impl OutputCallback {
    /// Fill the interleaved device buffer.
    pub fn process(&mut self, out: &mut [f32]) {
        if self.shutdown.load(Ordering::Relaxed) {
            out.fill(0.0);
            return;
        }
        let channels = self.channels.max(1);
        for chunk in out.chunks_mut(self.mono.len() * channels) {
            let frames = chunk.len() / channels;
            let mono = &mut self.mono[..frames];
            match &mut self.feed {
                PlaybackFeed::Ring(consumer) => {
                    consumer.read(mono);
                }
                PlaybackFeed::Media(source) => {
                    let produced = match source.try_lock() {
                        Some(mut source) => source.read(mono),
                        None => 0,
                    };
                    mono[produced..].fill(0.0);
                }
            }
            for (frame, &sample) in chunk.chunks_exact_mut(channels).zip(mono.iter()) {
                frame.fill(sample);
            }
            if let Some(render) = self.raw_render.as_mut() {
                render.write(mono);
            }
        }
        self.counters.output_callbacks.fetch_add(1, Ordering::Relaxed);
        let _ = self.signal.try_send(());
    }
}

/// Moves network playback samples into the device-rate ring when the output
/// device does not run at the engine rate.
struct PlaybackPump {
    network: AudioConsumer,
    device: AudioProducer,
    engine_rate: u32,
    device_rate: u32,
    target: usize,
    scratch: Vec<f32>,
}

impl PlaybackPump {
    fn run(&mut self) {
        let occupancy = self.device.occupancy();
        if occupancy >= self.target {
            return;
        }
        let wanted_device = self.target - occupancy;
        let wanted = ((wanted_device as u64 * self.engine_rate as u64).div_ceil(self.device_rate as u64) as usize)
            .min(self.scratch.len());
        let consumed = self.network.read(&mut self.scratch[..wanted]);
        if consumed == 0 {
            return;
        }
        let converted = resample_linear(&self.scratch[..consumed], self.engine_rate, self.device_rate);
        self.device.write(&converted);
    }
}

struct Worker {
    raw_capture: Option<AudioConsumer>,
    raw_render: Option<AudioConsumer>,
    outbound: Option<AudioProducer>,
    pump: Option<PlaybackPump>,
    capture_rate: u32,
    render_rate: u32,
    engine_rate: u32,
    reference: VecDeque<f32>,
    reference_limit: usize,
    echo: Option<EchoCanceller>,
    gain: f32,
    batch: Vec<f32>,
    render_scratch: Vec<f32>,
    reference_batch: Vec<f32>,
    signal: Receiver<()>,
    stop: Arc<AtomicBool>,
    timeout: Duration,
    counters: Arc<EngineCounters>,
}

impl Worker {
    fn run(mut self) {
        tracing::debug!("Audio worker started");
        while !self.stop.load(Ordering::Acquire) {
            match self.signal.recv_timeout(self.timeout) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            self.step();
        }
        tracing::debug!("Audio worker exiting");
    }

    fn step(&mut self) {
        self.counters.worker_iterations.fetch_add(1, Ordering::Relaxed);

        if let Some(pump) = self.pump.as_mut() {
            pump.run();
        }

        if let Some(render) = self.raw_render.as_mut() {
            let n = render.available().min(self.render_scratch.len());
            if n > 0 {
                let got = render.read(&mut self.render_scratch[..n]);
                let rendered = &self.render_scratch[..got];
                if self.render_rate == self.capture_rate {
                    self.reference.extend(rendered.iter().copied());
                } else {
                    self.reference
                        .extend(resample_linear(rendered, self.render_rate, self.capture_rate));
                }
                let excess = self.reference.len().saturating_sub(self.reference_limit);
                self.reference.drain(..excess);
            }
        }

        let Some(capture) = self.raw_capture.as_mut() else {
            return;
        };
        let n = capture.available().min(self.batch.len());
        if n == 0 {
            return;
        }
        let n = capture.read(&mut self.batch[..n]);
        let batch = &mut self.batch[..n];

        if let Some(echo) = self.echo.as_mut() {
            let reference = if self.reference.len() >= n {
                self.reference_batch.clear();
                self.reference_batch.extend(self.reference.drain(..n));
                Some(&self.reference_batch[..])
            } else {
                None
            };
            if echo.process(batch, reference) {
                self.counters.echo_cancelled_batches.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.echo_skipped_batches.fetch_add(1, Ordering::Relaxed);
            }
        }

        apply_gain(batch, self.gain);

        if let Some(outbound) = self.outbound.as_mut() {
            if self.capture_rate == self.engine_rate {
                outbound.write(batch);
            } else {
                outbound.write(&resample_linear(batch, self.capture_rate, self.engine_rate));
            }
        }
        self.counters.samples_processed.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Everything one start attempt needs
struct Pipeline {
    input: Option<InputCallback>,
    output: Option<OutputCallback>,
    worker: Worker,
    outbound: Option<AudioConsumer>,
    playback: Option<AudioProducer>,
    playback_monitor: Option<RingMonitor>,
    outbound_monitor: Option<RingMonitor>,
}

struct Flags {
    callback_shutdown: Arc<AtomicBool>,
    worker_shutdown: Arc<AtomicBool>,
    counters: Arc<EngineCounters>,
}

fn build_pipeline(
    plan: &StreamPlan,
    config: &AudioConfig,
    media: Option<&Arc<Mutex<Box<dyn MediaSource>>>>,
    flags: &Flags,
    signal_tx: &Sender<()>,
    signal_rx: &Receiver<()>,
) -> Pipeline {
    let block = config.frames_per_buffer.max(64);
    let engine_rate = config.sample_rate;
    let capture_rate = plan.input.map(|f| f.sample_rate).unwrap_or(engine_rate);
    let render_rate = plan.output.map(|f| f.sample_rate).unwrap_or(engine_rate);

    let mut input = None;
    let mut raw_capture = None;
    let mut outbound = None;
    let mut outbound_tx = None;
    let mut outbound_monitor = None;
    if let Some(format) = plan.input {
        let (tx, rx) = AudioRingBuffer::capture(config.ring_capacity);
        input = Some(InputCallback {
            raw_capture: tx,
            channels: format.channels as usize,
            mono: vec![0.0; block],
            signal: signal_tx.clone(),
            shutdown: flags.callback_shutdown.clone(),
            counters: flags.counters.clone(),
        });
        raw_capture = Some(rx);

        let (tx, rx) = AudioRingBuffer::capture(config.ring_capacity);
        outbound_monitor = Some(rx.monitor());
        outbound_tx = Some(tx);
        outbound = Some(rx);
    }

    let mut output = None;
    let mut raw_render = None;
    let mut playback = None;
    let mut playback_monitor = None;
    let mut pump = None;
    if let Some(format) = plan.output {
        let feed = match media {
            Some(source) => PlaybackFeed::Media(source.clone()),
            None => {
                let (network_tx, network_rx) = AudioRingBuffer::playback(config);
                playback_monitor = Some(network_rx.monitor());
                playback = Some(network_tx);
                if format.sample_rate == engine_rate {
                    PlaybackFeed::Ring(network_rx)
                } else {
                    let (device_tx, device_rx) = AudioRingBuffer::capture(config.ring_capacity);
                    pump = Some(PlaybackPump {
                        network: network_rx,
                        device: device_tx,
                        engine_rate,
                        device_rate: format.sample_rate,
                        target: block * 4,
                        scratch: vec![0.0; config.ring_capacity],
                    });
                    PlaybackFeed::Ring(device_rx)
                }
            }
        };

        let render_tx = if plan.input.is_some() {
            let (tx, rx) = AudioRingBuffer::capture(config.ring_capacity);
            raw_render = Some(rx);
            Some(tx)
        } else {
            None
        };

        output = Some(OutputCallback {
            feed,
            raw_render: render_tx,
            channels: format.channels as usize,
            mono: vec![0.0; block],
            signal: signal_tx.clone(),
            shutdown: flags.callback_shutdown.clone(),
            counters: flags.counters.clone(),
        });
    }

    let worker = Worker {
        raw_capture,
        raw_render,
        outbound: outbound_tx,
        pump,
        capture_rate,
        render_rate,
        engine_rate,
        reference: VecDeque::with_capacity(config.ring_capacity),
        reference_limit: config.ring_capacity,
        echo: config
            .echo_cancellation
            .then(|| EchoCanceller::new(EchoCanceller::DEFAULT_FILTER_LEN, EchoCanceller::DEFAULT_STEP_SIZE)),
        gain: config.input_gain,
        batch: vec![0.0; config.ring_capacity],
        render_scratch: vec![0.0; config.ring_capacity],
        reference_batch: Vec::with_capacity(config.ring_capacity),
        signal: signal_rx.clone(),
        stop: flags.worker_shutdown.clone(),
        timeout: Duration::from_millis(config.worker_timeout_ms.max(1)),
        counters: flags.counters.clone(),
    };

    Pipeline {
        input,
        output,
        worker,
        outbound,
        playback,
        playback_monitor,
        outbound_monitor,
    }
}

/// The running audio subsystem
pub struct AudioEngine {
    plan: StreamPlan,
    backend: Box<dyn AudioBackend>,
    worker: Option<JoinHandle<()>>,
    callback_shutdown: Arc<AtomicBool>,
    worker_shutdown: Arc<AtomicBool>,
    signal: Sender<()>,
    counters: Arc<EngineCounters>,
    outbound: Option<AudioConsumer>,
    playback: Option<AudioProducer>,
    playback_monitor: Option<RingMonitor>,
    outbound_monitor: Option<RingMonitor>,
}

impl AudioEngine {
    /// Negotiate, open streams and start the worker.
    ///
    /// Device trouble never fails the call: the engine degrades to one
    /// direction or to [`StreamMode::Disabled`].
    pub fn start(
        config: &AudioConfig,
        mut backend: Box<dyn AudioBackend>,
        media: Option<Box<dyn MediaSource>>,
    ) -> Result<Self, AudioError> {
        config
            .validate()
            .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))?;

        let (signal_tx, signal_rx) = bounded::<()>(1);
        let flags = Flags {
            callback_shutdown: Arc::new(AtomicBool::new(false)),
            worker_shutdown: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(EngineCounters::default()),
        };

        let mut engine = Self {
            plan: StreamPlan::disabled(),
            backend: Box::new(NullBackend),
            worker: None,
            callback_shutdown: flags.callback_shutdown.clone(),
            worker_shutdown: flags.worker_shutdown.clone(),
            signal: signal_tx.clone(),
            counters: flags.counters.clone(),
            outbound: None,
            playback: None,
            playback_monitor: None,
            outbound_monitor: None,
        };

        if !config.enabled {
            tracing::info!("Audio disabled by configuration");
            return Ok(engine);
        }

        let negotiated = negotiate(&backend.probe());
        if negotiated.mode == StreamMode::Disabled {
            tracing::warn!("No audio devices available, audio disabled");
            return Ok(engine);
        }

        let media = media.map(|m| Arc::new(Mutex::new(m)));
        for plan in fallback_plans(&negotiated) {
            let pipeline = build_pipeline(&plan, config, media.as_ref(), &flags, &signal_tx, &signal_rx);
            match backend.start(&plan, pipeline.input, pipeline.output) {
                Ok(()) => {
                    let worker = pipeline.worker;
                    let handle = thread::Builder::new()
                        .name("audio-worker".to_string())
                        .spawn(move || worker.run())
                        .map_err(|e| {
                            backend.stop();
                            AudioError::StreamError(format!("spawn audio worker: {}", e))
                        })?;

                    tracing::info!(
                        backend = backend.name(),
                        mode = ?plan.mode,
                        input = ?plan.input,
                        output = ?plan.output,
                        "Audio engine started"
                    );
                    engine.plan = plan;
                    engine.backend = backend;
                    engine.worker = Some(handle);
                    engine.outbound = pipeline.outbound;
                    engine.playback = pipeline.playback;
                    engine.playback_monitor = pipeline.playback_monitor;
                    engine.outbound_monitor = pipeline.outbound_monitor;
                    return Ok(engine);
                }
                Err(e) => {
                    tracing::warn!(mode = ?plan.mode, "Audio stream open failed: {}", e);
                }
            }
        }

        tracing::error!("All audio stream layouts failed, audio disabled");
        Ok(engine)
    }

    pub fn mode(&self) -> StreamMode {
        self.plan.mode
    }

    pub fn plan(&self) -> &StreamPlan {
        &self.plan
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Processed capture samples, for network transmission. Taken once.
    pub fn take_outbound(&mut self) -> Option<AudioConsumer> {
        self.outbound.take()
    }

    /// Jitter-gated playback input, fed from the network. Taken once.
    pub fn take_playback(&mut self) -> Option<AudioProducer> {
        self.playback.take()
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            mode: self.plan.mode,
            input_callbacks: c.input_callbacks.load(Ordering::Relaxed),
            output_callbacks: c.output_callbacks.load(Ordering::Relaxed),
            worker_iterations: c.worker_iterations.load(Ordering::Relaxed),
            samples_processed: c.samples_processed.load(Ordering::Relaxed),
            echo_cancelled_batches: c.echo_cancelled_batches.load(Ordering::Relaxed),
            echo_skipped_batches: c.echo_skipped_batches.load(Ordering::Relaxed),
            missed_signals: c.missed_signals.load(Ordering::Relaxed),
            playback_underruns: self
                .playback_monitor
                .as_ref()
                .map(|m| m.stats().underruns)
                .unwrap_or(0),
            outbound_dropped: self
                .outbound_monitor
                .as_ref()
                .map(|m| m.stats().dropped)
                .unwrap_or(0),
        }
    }

    /// Silence callbacks, stop the worker and wait for it, then close streams.
    pub fn shutdown(&mut self) {
        self.callback_shutdown.store(true, Ordering::SeqCst);
        self.worker_shutdown.store(true, Ordering::SeqCst);
        let _ = self.signal.try_send(());
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!("Audio worker panicked");
            }
            tracing::info!("Audio engine stopped");
        }
        self.backend.stop();
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Placeholder backend for an engine that never opened streams
struct NullBackend;

impl AudioBackend for NullBackend {
    fn name(&self) -> &'static str {
        "none"
    }

    fn probe(&mut self) -> DeviceProbe {
        DeviceProbe::default()
    }

    fn start(
        &mut self,
        _plan: &StreamPlan,
        _input: Option<InputCallback>,
        _output: Option<OutputCallback>,
    ) -> Result<(), AudioError> {
        Err(AudioError::Disabled)
    }

    fn stop(&mut self) {}
}
