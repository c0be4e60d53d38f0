//! Depth pipeline firmware entry point
//!
//! Core 0 runs the sampling loop on a high-priority interrupt executor, so
//! the blocking SD card writes of the log writer (thread mode) never stall
//! acquisition. Core 1 runs the inference task.

#![no_std]
#![no_main]

use board::mode_button::mode_button;
use board::resources::{AssignedResources, SdCardResources};
use board::sd_volume::{SdLogFile, SdVolume};
use board::sensor_uart::SensorUart;
use board::status_led::status_led;
use defmt::{error, info};
use depth_pipeline::system::config::{PipelineConfig, LOG_BUFFER_SIZE, STAGING_DEPTH, STAGING_FRAME_LEN, STAGING_SIDE};
use depth_pipeline::system::indicator::Indicator;
use depth_pipeline::system::operator::OperatorFeed;
use depth_pipeline::system::sensor_setup;
use depth_pipeline::system::staging::StagingBuffer;
use depth_pipeline::system::stats::PipelineStats;
use depth_pipeline::system::storage::{open_session, CoalescingWriter};
use depth_pipeline::task::depth_sample::{LogQueue, Pipeline, PipelineLinks};
use depth_pipeline::task::inference::{InferenceResults, InferenceRunner, ReactiveEngine};
use depth_pipeline::task::log_writer::LogWriter;
use embassy_executor::{Executor, InterruptExecutor};
use embassy_rp::block::ImageDef;
use embassy_rp::config::Config;
use embassy_rp::interrupt;
use embassy_rp::interrupt::{InterruptExt, Priority};
use embassy_rp::multicore::{spawn_core1, Stack};
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

/// Firmware image type for bootloader
#[link_section = ".start_block"]
#[used]
pub static IMAGE_DEF: ImageDef = ImageDef::secure_exe();

/// Board-specific drivers and tasks
mod board;

const CONFIG: PipelineConfig = PipelineConfig::new();

/// Values in one inference input tensor
const INPUT_LEN: usize = STAGING_DEPTH * STAGING_FRAME_LEN;

type SessionLog = CoalescingWriter<SdLogFile, LOG_BUFFER_SIZE>;
type Runner = InferenceRunner<'static, ReactiveEngine, STAGING_DEPTH, STAGING_SIDE>;

static LOG_QUEUE: LogQueue = LogQueue::new();
static STAGING: StagingBuffer = StagingBuffer::new(CONFIG.staging);
static INDICATOR: Indicator = Indicator::new();
static OPERATOR: OperatorFeed = OperatorFeed::new();
static STATS: PipelineStats = PipelineStats::new();
static RESULTS: InferenceResults = InferenceResults::new();

static PIPELINE: StaticCell<Pipeline<'static>> = StaticCell::new();
static LOG_WRITER: StaticCell<LogWriter<'static, SessionLog>> = StaticCell::new();
static INFERENCE_INPUT: StaticCell<[i8; INPUT_LEN]> = StaticCell::new();

static mut CORE1_STACK: Stack<16384> = Stack::new();
static EXECUTOR_HIGH: InterruptExecutor = InterruptExecutor::new();
static EXECUTOR_LOW: StaticCell<Executor> = StaticCell::new();
static EXECUTOR_CORE1: StaticCell<Executor> = StaticCell::new();

#[interrupt]
unsafe fn SWI_IRQ_1() {
    EXECUTOR_HIGH.on_interrupt()
}

/// Firmware entry point
#[cortex_m_rt::entry]
fn main() -> ! {
    let p = embassy_rp::init(Config::default());

    // Split the resources into separate groups for each task
    let r = split_resources!(p);

    // No card or no session log means no persistence for this power cycle
    let writer = start_session(r.sd_card);
    let links = PipelineLinks {
        log_queue: writer.is_some().then_some(&LOG_QUEUE),
        staging: &STAGING,
        indicator: &INDICATOR,
        operator: &OPERATOR,
        stats: &STATS,
    };
    let pipeline = PIPELINE.init(Pipeline::new(&CONFIG, links));

    spawn_core1(
        p.CORE1,
        unsafe { &mut *core::ptr::addr_of_mut!(CORE1_STACK) },
        move || {
            let executor = EXECUTOR_CORE1.init(Executor::new());
            executor.run(|spawner| {
                let input = INFERENCE_INPUT.init([0; INPUT_LEN]);
                let engine = ReactiveEngine::new(STAGING_DEPTH, STAGING_SIDE);
                match InferenceRunner::new(engine, &STAGING, &RESULTS, input) {
                    Ok(runner) => spawner.spawn(inference(runner)).unwrap(),
                    // the rest of the pipeline keeps running without inference
                    Err(e) => error!("inference unavailable: {}", e),
                }
            })
        },
    );

    // Sampling preempts everything else on this core
    interrupt::SWI_IRQ_1.set_priority(Priority::P3);
    let spawner = EXECUTOR_HIGH.start(interrupt::SWI_IRQ_1);
    spawner
        .spawn(depth_sample(pipeline, SensorUart::new(r.depth_sensor)))
        .unwrap();

    let executor = EXECUTOR_LOW.init(Executor::new());
    executor.run(move |spawner| {
        spawner.spawn(status_led(r.status_led, &INDICATOR)).unwrap();
        spawner.spawn(mode_button(r.mode_button, &OPERATOR)).unwrap();
        if let Some(writer) = writer {
            spawner.spawn(log_writer(writer)).unwrap();
        }
    })
}

/// Mounts the card and opens this power cycle's log
fn start_session(r: SdCardResources) -> Option<&'static mut LogWriter<'static, SessionLog>> {
    let mut volume = match SdVolume::mount(r) {
        Ok(volume) => volume,
        Err(e) => {
            error!("SD card unavailable: {}", e);
            return None;
        }
    };
    match open_session::<_, LOG_BUFFER_SIZE>(&mut volume) {
        Ok((session, log)) => {
            info!("session {} started", session);
            Some(LOG_WRITER.init(LogWriter::new(log, CONFIG.flush_every, &STATS)))
        }
        Err(e) => {
            error!("session log unavailable: {}", e);
            None
        }
    }
}

#[embassy_executor::task]
async fn depth_sample(pipeline: &'static mut Pipeline<'static>, mut sensor: SensorUart) {
    sensor_setup::configure(&mut sensor, CONFIG.calibration).await;
    pipeline.run(&mut sensor).await
}

#[embassy_executor::task]
async fn log_writer(writer: &'static mut LogWriter<'static, SessionLog>) {
    writer.run(&LOG_QUEUE).await
}

#[embassy_executor::task]
async fn inference(mut runner: Runner) {
    runner.run().await
}
