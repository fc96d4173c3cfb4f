//! Device backends driving the engine's real-time callbacks
//!
//! [`CpalBackend`] opens real device streams. [`MemoryBackend`] hands the
//! callbacks to a [`MemoryDriver`] so the engine can be exercised without
//! audio hardware.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::device::{default_input_device, default_output_device, probe_default_devices, DeviceFormat, DeviceProbe};
use super::engine::{InputCallback, OutputCallback, StreamMode, StreamPlan};
use crate::error::AudioError;

/// Opens device streams for a negotiated plan and runs the callbacks.
pub trait AudioBackend: Send {
    fn name(&self) -> &'static str;

    /// Report what each direction can do.
    fn probe(&mut self) -> DeviceProbe;

    /// Start streams for `plan`. The callbacks are `None` for directions the
    /// plan does not use.
    fn start(
        &mut self,
        plan: &StreamPlan,
        input: Option<InputCallback>,
        output: Option<OutputCallback>,
    ) -> Result<(), AudioError>;

    /// Stop and release every stream. Idempotent.
    fn stop(&mut self);
}

/// Real devices through cpal.
///
/// cpal streams are not `Send` on every platform, so they are built and kept
/// alive on a dedicated thread until [`AudioBackend::stop`].
pub struct CpalBackend {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalBackend {
    const OPEN_TIMEOUT: Duration = Duration::from_secs(3);

    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    fn stream_config(format: DeviceFormat) -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        }
    }

    fn open_streams(
        plan: &StreamPlan,
        input: Option<InputCallback>,
        output: Option<OutputCallback>,
    ) -> Result<Vec<cpal::Stream>, AudioError> {
        let mut streams = Vec::new();

        if let (Some(format), Some(mut callback)) = (plan.input, input) {
            let device = default_input_device()?.into_inner();
            let stream = device
                .build_input_stream(
                    &Self::stream_config(format),
                    move |data: &[f32], _: &cpal::InputCallbackInfo| callback.process(data),
                    |err| tracing::error!("Audio input stream error: {}", err),
                    None,
                )
                .map_err(|e| AudioError::StreamError(format!("input: {}", e)))?;
            stream
                .play()
                .map_err(|e| AudioError::StreamError(format!("input play: {}", e)))?;
            streams.push(stream);
        }

        if let (Some(format), Some(mut callback)) = (plan.output, output) {
            let device = default_output_device()?.into_inner();
            let stream = device
                .build_output_stream(
                    &Self::stream_config(format),
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| callback.process(data),
                    |err| tracing::error!("Audio output stream error: {}", err),
                    None,
                )
                .map_err(|e| AudioError::StreamError(format!("output: {}", e)))?;
            stream
                .play()
                .map_err(|e| AudioError::StreamError(format!("output play: {}", e)))?;
            streams.push(stream);
        }

        Ok(streams)
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn probe(&mut self) -> DeviceProbe {
        probe_default_devices()
    }

    fn start(
        &mut self,
        plan: &StreamPlan,
        input: Option<InputCallback>,
        output: Option<OutputCallback>,
    ) -> Result<(), AudioError> {
        self.stop();

        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);
        let plan = plan.clone();

        let handle = thread::Builder::new()
            .name("audio-device".to_string())
            .spawn(move || {
                let streams = match Self::open_streams(&plan, input, output) {
                    Ok(streams) => {
                        let _ = ready_tx.send(Ok(()));
                        streams
                    }
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                drop(streams);
                tracing::debug!("Audio device streams closed");
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;
        self.thread = Some(handle);

        match ready_rx.recv_timeout(Self::OPEN_TIMEOUT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.stop();
                Err(e)
            }
            Err(_) => {
                self.stop();
                Err(AudioError::StreamError("timed out opening device streams".into()))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Default)]
struct MemorySlots {
    input: Mutex<Option<InputCallback>>,
    output: Mutex<Option<OutputCallback>>,
    plan: Mutex<Option<StreamPlan>>,
}

/// Hardware-free backend for tests and headless runs
pub struct MemoryBackend {
    probe: DeviceProbe,
    fail_input: bool,
    fail_output: bool,
    fail_duplex: bool,
    slots: Arc<MemorySlots>,
}

/// Test-side handle that plays the role of the device
#[derive(Clone)]
pub struct MemoryDriver {
    slots: Arc<MemorySlots>,
}

impl MemoryBackend {
    pub fn new(probe: DeviceProbe) -> (Self, MemoryDriver) {
        let slots = Arc::new(MemorySlots::default());
        (
            Self {
                probe,
                fail_input: false,
                fail_output: false,
                fail_duplex: false,
                slots: slots.clone(),
            },
            MemoryDriver { slots },
        )
    }

    /// Both directions at one rate, mono
    pub fn duplex(sample_rate: u32) -> (Self, MemoryDriver) {
        let format = DeviceFormat {
            sample_rate,
            channels: 1,
        };
        Self::new(DeviceProbe {
            input: Some(format),
            output: Some(format),
            input_name: Some("memory".into()),
            output_name: Some("memory".into()),
        })
    }

    /// Make input streams fail to open
    pub fn fail_input(mut self) -> Self {
        self.fail_input = true;
        self
    }

    /// Make output streams fail to open
    pub fn fail_output(mut self) -> Self {
        self.fail_output = true;
        self
    }

    /// Refuse a shared duplex stream; separate streams still open
    pub fn fail_duplex(mut self) -> Self {
        self.fail_duplex = true;
        self
    }
}

impl AudioBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn probe(&mut self) -> DeviceProbe {
        self.probe.clone()
    }

    fn start(
        &mut self,
        plan: &StreamPlan,
        input: Option<InputCallback>,
        output: Option<OutputCallback>,
    ) -> Result<(), AudioError> {
        if plan.mode == StreamMode::Duplex && self.fail_duplex {
            return Err(AudioError::StreamError("memory duplex stream unavailable".into()));
        }
        if plan.input.is_some() && self.fail_input {
            return Err(AudioError::StreamError("memory input unavailable".into()));
        }
        if plan.output.is_some() && self.fail_output {
            return Err(AudioError::StreamError("memory output unavailable".into()));
        }
        *self.slots.input.lock() = input;
        *self.slots.output.lock() = output;
        *self.slots.plan.lock() = Some(plan.clone());
        Ok(())
    }

    fn stop(&mut self) {
        self.slots.input.lock().take();
        self.slots.output.lock().take();
        self.slots.plan.lock().take();
    }
}

impl MemoryDriver {
    /// Deliver one input callback. Returns false when no input stream is open.
    pub fn push_input(&self, data: &[f32]) -> bool {
        match self.slots.input.lock().as_mut() {
            Some(callback) => {
                callback.process(data);
                true
            }
            None => false,
        }
    }

    /// Run one output callback. Returns false when no output stream is open.
    pub fn pull_output(&self, out: &mut [f32]) -> bool {
        match self.slots.output.lock().as_mut() {
            Some(callback) => {
                callback.process(out);
                true
            }
            None => false,
        }
    }

    pub fn plan(&self) -> Option<StreamPlan> {
        self.slots.plan.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.slots.plan.lock().is_some()
    }
}
