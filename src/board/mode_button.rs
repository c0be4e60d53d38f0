//! Mode button
//!
//! Stands in for the RC receiver's mode channel: a momentary button whose
//! debounced level is published as 0.0 (released) or 1.0 (pressed).

use defmt::info;
use depth_pipeline::system::operator::OperatorFeed;
use embassy_rp::gpio::{Input, Level, Pull};
use embassy_time::{Duration, Timer};

use super::resources::ModeButtonResources;

/// The debounce duration used to debounce the button
const DEBOUNCE_DURATION: Duration = Duration::from_millis(30);

#[embassy_executor::task]
pub async fn mode_button(r: ModeButtonResources, operator: &'static OperatorFeed) {
    let mut btn = Input::new(r.btn, Pull::Down);
    operator.publish_switch(level_to_switch(btn.get_level()));

    loop {
        let level = debounce(&mut btn).await;
        if level == Level::High {
            info!("mode button pressed");
        }
        operator.publish_switch(level_to_switch(level));
    }
}

fn level_to_switch(level: Level) -> f32 {
    match level {
        Level::High => 1.0,
        Level::Low => 0.0,
    }
}

/// Waits for a stable change of the button level
async fn debounce(button: &mut Input<'static>) -> Level {
    loop {
        let st_level = button.get_level();
        button.wait_for_any_edge().await;
        Timer::after(DEBOUNCE_DURATION).await;
        let end_level = button.get_level();
        if st_level != end_level {
            break end_level;
        }
    }
}
