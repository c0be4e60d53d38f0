//! Depth sampling loop
//!
//! One acquisition cycle:
//! 1. read bytes until a complete frame is assembled, then drop the backlog
//! 2. validate and decode the frame into the depth grid
//! 3. feed the operator switch to the mode controller, run transition effects
//! 4. hand the grid to the consumer of the active mode
//!
//! Nothing in here waits on storage or inference: the log queue is fed with
//! `try_send`, the staging lock is taken with a short timeout and snapshots
//! are requested without waiting.

use embassy_futures::yield_now;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{with_timeout, Instant, Timer};

use crate::system::config::{PipelineConfig, LOG_QUEUE_DEPTH, POLL_YIELD, SENTINEL_TIMEOUT};
use crate::system::decode::{validate_header, DepthGrid, FrameDecoder, Geometry, HeaderError};
use crate::system::framing::{ByteSource, Feed, FrameReassembler};
use crate::system::indicator::{Indicator, IndicatorCommand};
use crate::system::operator::OperatorFeed;
use crate::system::preview::{self, FRAME_END, FRAME_START};
use crate::system::record::{format_frame, Controls, PersistRecord};
use crate::system::staging::StagingBuffer;
use crate::system::state::{ModeController, OperatingMode, Transition};
use crate::system::stats::{CycleTiming, PipelineStats, ThroughputWindow};

/// Queue between the sampling loop and the log writer
pub type LogQueue = Channel<CriticalSectionRawMutex, PersistRecord, LOG_QUEUE_DEPTH>;

/// Bytes consumed in one go before other tasks get a turn
const BYTES_PER_YIELD: usize = 512;

/// Everything the sampling loop shares with other tasks
#[derive(Clone, Copy)]
pub struct PipelineLinks<'a> {
    /// `None` when no session log could be opened
    pub log_queue: Option<&'a LogQueue>,
    pub staging: &'a StagingBuffer,
    pub indicator: &'a Indicator,
    pub operator: &'a OperatorFeed,
    pub stats: &'a PipelineStats,
}

/// State owned by the sampling loop
pub struct Pipeline<'a> {
    reassembler: FrameReassembler,
    grid: DepthGrid,
    decoder: FrameDecoder,
    controller: ModeController,
    frame_seq: u32,
    links: PipelineLinks<'a>,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &PipelineConfig, links: PipelineLinks<'a>) -> Self {
        let initial = OperatingMode::initial(links.log_queue.is_some());
        Self {
            reassembler: FrameReassembler::new(),
            grid: DepthGrid::new(),
            decoder: FrameDecoder::new(config.calibration),
            controller: ModeController::new(initial, config.cooldown_ticks),
            frame_seq: 0,
            links,
        }
    }

    pub fn mode(&self) -> OperatingMode {
        self.controller.mode()
    }

    pub fn storage_available(&self) -> bool {
        self.links.log_queue.is_some()
    }

    /// Depth grid of the last accepted frame
    pub fn grid(&self) -> &DepthGrid {
        &self.grid
    }

    /// Sequence number the next log record gets
    pub fn frame_seq(&self) -> u32 {
        self.frame_seq
    }

    /// Shows the start-up mode on the status LED
    pub fn announce(&self) {
        info!("starting in {:?}", self.mode());
        self.links
            .indicator
            .send(IndicatorCommand::for_mode(self.mode(), self.storage_available()));
    }

    /// Reads from `source` until a frame is complete
    ///
    /// Afterwards everything still buffered in the source is discarded and the
    /// reassembler restarts, so the next cycle works on a fresh frame.
    pub async fn acquire<S: ByteSource>(&mut self, source: &mut S) {
        let mut burst = 0;
        loop {
            let Some(byte) = source.poll_byte() else {
                Timer::after(POLL_YIELD).await;
                burst = 0;
                continue;
            };

            match self.reassembler.feed(byte) {
                Feed::Ready => break,
                Feed::Overflow => self.links.stats.framing_overflow(),
                Feed::Pending => {}
            }

            burst += 1;
            if burst >= BYTES_PER_YIELD {
                burst = 0;
                yield_now().await;
            }
        }

        source.discard_pending();
        self.reassembler.reset();
    }

    /// Validates the acquired frame and decodes it into the grid
    ///
    /// A rejected frame leaves the grid untouched.
    pub fn decode(&mut self) -> Result<Geometry, HeaderError> {
        let raw = self.reassembler.frame();
        match validate_header(raw) {
            Ok(geometry) => {
                self.decoder.decode(raw, geometry, &mut self.grid);
                self.links.stats.frame_accepted();
                Ok(geometry)
            }
            Err(e) => {
                self.links.stats.geometry_rejected();
                debug!("frame dropped: {:?}", e);
                Err(e)
            }
        }
    }

    /// Feeds one switch sample, runs the effects of an accepted edge
    pub async fn update_mode(&mut self, switch: f32) -> Option<Transition> {
        let transition = self.controller.update(switch, self.storage_available())?;
        info!("mode {:?} -> {:?}", transition.from, transition.to);

        if transition.syncs_log() {
            self.request_sync().await;
        }
        if transition.resets_staging() {
            self.links.staging.reset().await;
        }
        self.links.indicator.clear();
        self.links
            .indicator
            .send(IndicatorCommand::for_mode(transition.to, self.storage_available()));

        Some(transition)
    }

    /// Hands the grid to the consumer of the active mode
    pub async fn route(&mut self, controls: Option<Controls>) {
        match self.controller.mode() {
            OperatingMode::Error | OperatingMode::Idle => {}
            OperatingMode::Preview => self.print_preview(),
            OperatingMode::Persist => {
                self.enqueue(controls);
            }
            OperatingMode::Infer => {
                if self.links.staging.push(&self.grid).await {
                    self.links.staging.request_snapshot();
                }
            }
        }
    }

    /// Queues the grid for the session log without waiting
    ///
    /// Returns `false` and counts a dropped frame when the queue is full.
    pub fn enqueue(&mut self, controls: Option<Controls>) -> bool {
        let Some(queue) = self.links.log_queue else {
            return false;
        };

        let seq = self.frame_seq;
        // gaps in the log show dropped frames
        self.frame_seq = self.frame_seq.wrapping_add(1);

        let record = match format_frame(seq, controls, &self.grid) {
            Ok(record) => record,
            Err(e) => {
                warn!("frame {} not logged: {:?}", seq, e);
                self.links.stats.frame_dropped();
                return false;
            }
        };
        if queue.try_send(record).is_err() {
            self.links.stats.frame_dropped();
            return false;
        }
        true
    }

    /// Runs one full acquisition cycle
    ///
    /// Returns the stage timings, or `None` if the frame was rejected.
    pub async fn cycle<S: ByteSource>(&mut self, source: &mut S) -> Option<CycleTiming> {
        let started = Instant::now();
        self.acquire(source).await;
        let acquired = Instant::now();
        self.decode().ok()?;
        let decoded = Instant::now();

        let sample = self.links.operator.sample();
        self.update_mode(sample.switch).await;
        self.route(sample.controls).await;
        self.controller.tick();

        Some(CycleTiming {
            acquire: acquired - started,
            decode: decoded - acquired,
            route: Instant::now() - decoded,
        })
    }

    /// Samples forever, reporting throughput once per second while logging
    pub async fn run<S: ByteSource>(&mut self, source: &mut S) -> ! {
        self.announce();
        let mut window = ThroughputWindow::new(Instant::now());

        loop {
            if let Some(timing) = self.cycle(source).await {
                window.record(timing);
            }
            let Some(report) = window.poll(Instant::now()) else {
                continue;
            };
            if self.mode() == OperatingMode::Persist {
                let stats = self.links.stats.snapshot();
                info!(
                    "fps {} | acquire {}us decode {}us route {}us | dropped {} write errors {}",
                    report.frames_per_sec,
                    report.mean_acquire_us,
                    report.mean_decode_us,
                    report.mean_route_us,
                    stats.dropped_frames,
                    stats.write_failures
                );
            }
        }
    }

    async fn request_sync(&self) {
        let Some(queue) = self.links.log_queue else {
            return;
        };
        if with_timeout(SENTINEL_TIMEOUT, queue.send(PersistRecord::Sentinel))
            .await
            .is_err()
        {
            self.links.stats.frame_dropped();
            warn!("log queue full, sync request dropped");
        }
    }

    fn print_preview(&self) {
        info!("{}", FRAME_START);
        for line in preview::render(&self.grid) {
            info!("{}", line.as_str());
        }
        info!("{}", FRAME_END);
    }
}
