//! Status LED Module
//!
//! Renders the indicator commands on the RGB LED. The status display decides
//! what is shown; this task only turns its output into PWM duty cycles.

use defmt::debug;
use depth_pipeline::system::indicator::{Indicator, Rgb, StatusDisplay};
use embassy_futures::select::{select, Either};
use embassy_rp::pwm::{self, Pwm, SetDutyCycle};
use embassy_time::{Instant, Timer};

use super::resources::StatusLedResources;

struct RgbPwm {
    red: Pwm<'static>,
    green: Pwm<'static>,
    blue: Pwm<'static>,
}

impl RgbPwm {
    fn new(r: StatusLedResources) -> Self {
        // configure pwm for rgb led, 100Hz
        let desired_freq_hz = 100;
        let clock_freq_hz = embassy_rp::clocks::clk_sys_freq();

        // minimum divider that keeps the period under the 16 bit limit
        let divider = ((clock_freq_hz / desired_freq_hz) / 65535 + 1) as u8;
        let period = (clock_freq_hz / (desired_freq_hz * divider as u32)) as u16 - 1;

        let mut config = pwm::Config::default();
        config.divider = divider.into();
        config.top = period;

        Self {
            red: Pwm::new_output_a(r.pwm_red, r.red_pin, config.clone()),
            green: Pwm::new_output_a(r.pwm_green, r.green_pin, config.clone()),
            blue: Pwm::new_output_a(r.pwm_blue, r.blue_pin, config),
        }
    }

    fn show(&mut self, color: Rgb, brightness: u8) {
        let scale = |channel: u8| (channel as u32 * brightness.min(100) as u32 / 255) as u8;
        let _ = self.red.set_duty_cycle_percent(scale(color.r));
        let _ = self.green.set_duty_cycle_percent(scale(color.g));
        let _ = self.blue.set_duty_cycle_percent(scale(color.b));
    }

    fn off(&mut self) {
        let _ = self.red.set_duty_cycle_fully_off();
        let _ = self.green.set_duty_cycle_fully_off();
        let _ = self.blue.set_duty_cycle_fully_off();
    }
}

#[embassy_executor::task]
pub async fn status_led(r: StatusLedResources, indicator: &'static Indicator) {
    let mut led = RgbPwm::new(r);
    let mut display = StatusDisplay::new(indicator.generation());
    led.off();

    loop {
        display.sync(indicator.generation());

        let (output, wait_ms) = display.render(Instant::now().as_millis());
        match output {
            Some(output) => led.show(output.color, output.brightness),
            None => led.off(),
        }

        if let Either::First(queued) = select(indicator.receive(), Timer::after_millis(wait_ms)).await {
            if display.accept(queued, Instant::now().as_millis()) {
                debug!("indicator: {:?}", queued.command);
            }
        }
    }
}
