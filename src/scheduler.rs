use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    sync::mpsc::Receiver,
    time::{Interval, MissedTickBehavior, interval},
};

// Source of control cycles
#[async_trait]
pub trait Ticker: Send {
    // Resolve when the next cycle is due
    async fn tick(&mut self);
}

// Fixed period ticker. A late cycle pushes the following ones
// back instead of firing a burst to catch up.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

// Ticks on demand, one per received message.
// Once every sender is gone it never ticks again.
pub struct ChannelTicker {
    rx: Receiver<()>,
}

impl ChannelTicker {
    pub fn new(rx: Receiver<()>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl Ticker for ChannelTicker {
    async fn tick(&mut self) {
        if self.rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}
