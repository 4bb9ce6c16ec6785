//! The single global timer. Emits `system.tick` every second and
//! `system.tick.minute` on minute boundaries via the bus; all time-based
//! behavior subscribes to these instead of spawning its own timers.

use std::sync::{Arc, Mutex};

use chrono::Timelike;
use tokio::task::JoinHandle;
use tracing::info;

use event_packet::event_type;

use crate::bus::EventBus;

pub struct Ticker {
    bus: Arc<EventBus>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Ticker {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            handle: Mutex::new(None),
        }
    }

    /// Starts the tick loop. Each emission is spawned so a slow handler never
    /// delays the next tick.
    pub fn start(&self) {
        let mut handle = match self.handle.lock() {
            Ok(h) => h,
            Err(_) => return,
        };
        if handle.is_some() {
            return;
        }
        let bus = Arc::clone(&self.bus);
        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_minute: Option<u32> = None;
            loop {
                interval.tick().await;
                let now = chrono::Local::now();
                let payload = serde_json::json!({ "timestamp": now.to_rfc3339() });

                bus.emit_sync(event_type::SYSTEM_TICK, payload.clone(), "ticker");

                let minute = now.minute();
                if last_minute != Some(minute) {
                    last_minute = Some(minute);
                    bus.emit_sync(event_type::SYSTEM_TICK_MINUTE, payload, "ticker");
                }
            }
        }));
        info!("global ticker started");
    }

    pub fn stop(&self) {
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(task) = handle.take() {
                task.abort();
                info!("global ticker stopped");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ticks_are_emitted_and_slow_handlers_do_not_delay_them() {
        let bus = Arc::new(EventBus::new());
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = Arc::clone(&ticks);
        bus.subscribe_fn(event_type::SYSTEM_TICK, move |_| {
            let ticks = Arc::clone(&ticks_clone);
            async move {
                // Record the delivery, then stall well past the tick period;
                // emissions are spawned, so the ticker keeps its cadence.
                ticks.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(())
            }
        });

        let ticker = Ticker::new(Arc::clone(&bus));
        ticker.start();

        for _ in 0..5 {
            tokio::time::advance(std::time::Duration::from_secs(1)).await;
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }
        ticker.stop();

        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }
}
