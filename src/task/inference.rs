//! Inference hand-off
//!
//! Runs on the second core. Waits for a staging snapshot, quantizes it into
//! the engine's input tensor (frames oldest first, each row major), invokes
//! the engine outside every lock and publishes the two dequantized outputs.

use core::cell::Cell;

#[cfg(feature = "defmt")]
use defmt::Format;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::system::staging::FrameRingBuffer;

/// Affine int8 quantization parameters of a tensor
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct Quantization {
    pub scale: f32,
    pub zero_point: i32,
}

impl Quantization {
    pub const fn new(scale: f32, zero_point: i32) -> Self {
        Self { scale, zero_point }
    }

    pub fn quantize(&self, value: f32) -> i8 {
        let q = libm::roundf(value / self.scale) as i32 + self.zero_point;
        q.clamp(i8::MIN as i32, i8::MAX as i32) as i8
    }

    pub fn dequantize(&self, value: i8) -> f32 {
        (value as i32 - self.zero_point) as f32 * self.scale
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum EngineError {
    /// The engine reported a failure
    Invoke,
    /// Input tensor does not match the staging window
    InputSize { expected: usize, actual: usize },
}

/// Black-box model taking one int8 tensor and producing two int8 scalars
pub trait InferenceEngine {
    /// Number of values in the input tensor
    fn input_len(&self) -> usize;

    fn input_quantization(&self) -> Quantization;

    fn output_quantization(&self) -> Quantization;

    fn invoke(&mut self, input: &[i8]) -> Result<[i8; 2], EngineError>;
}

/// Result of one completed run
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct InferenceOutput {
    /// Nominally -1..=1
    pub steering: f32,
    /// Nominally -1..=1
    pub throttle: f32,
    /// Completed runs, this one included
    pub runs: u32,
}

/// Latest inference outputs, readable from any task or core
pub struct InferenceResults {
    latest: Mutex<CriticalSectionRawMutex, Cell<Option<InferenceOutput>>>,
}

impl InferenceResults {
    pub const fn new() -> Self {
        Self {
            latest: Mutex::new(Cell::new(None)),
        }
    }

    /// Outputs of the most recent run, `None` before the first one completes
    pub fn latest(&self) -> Option<InferenceOutput> {
        self.latest.lock(|cell| cell.get())
    }

    fn publish(&self, steering: f32, throttle: f32) -> InferenceOutput {
        self.latest.lock(|cell| {
            let runs = cell.get().map_or(0, |o| o.runs).wrapping_add(1);
            let output = InferenceOutput {
                steering,
                throttle,
                runs,
            };
            cell.set(Some(output));
            output
        })
    }
}

impl Default for InferenceResults {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side of the staging buffer
pub struct InferenceRunner<'a, E, const D: usize, const S: usize> {
    engine: E,
    staging: &'a FrameRingBuffer<D, S>,
    results: &'a InferenceResults,
    input: &'a mut [i8],
}

impl<'a, E: InferenceEngine, const D: usize, const S: usize> InferenceRunner<'a, E, D, S> {
    /// `input` is the tensor scratch space, at least `D * S * S` values
    pub fn new(
        engine: E,
        staging: &'a FrameRingBuffer<D, S>,
        results: &'a InferenceResults,
        input: &'a mut [i8],
    ) -> Result<Self, EngineError> {
        let expected = D * S * S;
        if engine.input_len() != expected || input.len() < expected {
            return Err(EngineError::InputSize {
                expected,
                actual: engine.input_len().min(input.len()),
            });
        }
        Ok(Self {
            engine,
            staging,
            results,
            input,
        })
    }

    /// Waits for a snapshot and runs the engine on it
    ///
    /// Returns `Ok(None)` when the snapshot was withdrawn by a reset, either
    /// before it could be read or while the engine ran on it. Results of a
    /// withdrawn snapshot are not published.
    pub async fn run_once(&mut self) -> Result<Option<InferenceOutput>, EngineError> {
        self.staging.wait_snapshot().await;

        let quantization = self.engine.input_quantization();
        let input = &mut self.input[..D * S * S];
        let copied = self
            .staging
            .read_snapshot(|snapshot| {
                let values = snapshot.ordered().flatten().flatten();
                for (slot, &value) in input.iter_mut().zip(values) {
                    *slot = quantization.quantize(value);
                }
                snapshot.sequence()
            })
            .await;
        let Some(sequence) = copied else {
            return Ok(None);
        };

        let result = self.engine.invoke(input);
        // the next snapshot may be taken now
        if !self.staging.complete(sequence) {
            debug!("snapshot {} withdrawn during inference", sequence);
            return Ok(None);
        }
        let raw = result?;
        let out = self.engine.output_quantization();
        let output = self
            .results
            .publish(out.dequantize(raw[0]), out.dequantize(raw[1]));
        Ok(Some(output))
    }

    pub async fn run(&mut self) -> ! {
        loop {
            match self.run_once().await {
                Ok(Some(output)) => debug!(
                    "inference #{}: steering {} throttle {}",
                    output.runs, output.steering, output.throttle
                ),
                Ok(None) => {}
                Err(e) => warn!("inference failed: {:?}", e),
            }
        }
    }
}

/// Obstacle-avoiding stand-in for a trained model
///
/// Looks at the newest frame only: steers towards the half with more free
/// space and slows down as the centre columns get close.
pub struct ReactiveEngine {
    frames: usize,
    side: usize,
}

impl ReactiveEngine {
    /// Input values map 0..=1 onto -128..=127
    pub const INPUT: Quantization = Quantization::new(1.0 / 255.0, -128);
    /// Outputs map -1..=1 onto -127..=127
    pub const OUTPUT: Quantization = Quantization::new(1.0 / 127.0, 0);

    pub const fn new(frames: usize, side: usize) -> Self {
        Self { frames, side }
    }

    fn mean(&self, frame: &[i8], cols: core::ops::Range<usize>) -> f32 {
        let width = cols.len();
        if width == 0 {
            return 0.0;
        }
        let sum: f32 = frame
            .chunks(self.side)
            .flat_map(|row| row[cols.clone()].iter())
            .map(|&q| Self::INPUT.dequantize(q))
            .sum();
        sum / (width * self.side) as f32
    }
}

impl InferenceEngine for ReactiveEngine {
    fn input_len(&self) -> usize {
        self.frames * self.side * self.side
    }

    fn input_quantization(&self) -> Quantization {
        Self::INPUT
    }

    fn output_quantization(&self) -> Quantization {
        Self::OUTPUT
    }

    fn invoke(&mut self, input: &[i8]) -> Result<[i8; 2], EngineError> {
        let frame_len = self.side * self.side;
        let expected = self.input_len();
        if input.len() != expected || frame_len == 0 {
            return Err(EngineError::InputSize {
                expected,
                actual: input.len(),
            });
        }
        let newest = &input[expected - frame_len..];
        let half = self.side / 2;
        let quarter = self.side / 4;

        // normalised distance, larger is farther
        let left = self.mean(newest, 0..half);
        let right = self.mean(newest, half..self.side);
        let centre = self.mean(newest, quarter..self.side - quarter);

        let steering = (right - left).clamp(-1.0, 1.0);
        let throttle = (2.0 * centre - 1.0).clamp(-1.0, 1.0);
        Ok([Self::OUTPUT.quantize(steering), Self::OUTPUT.quantize(throttle)])
    }
}
