#![allow(dead_code)]

use faultline::{FaultTolerance, FaultToleranceBuilder, InstantSleeper, ManualClock, OffloadPool};

/// Builder with a dedicated offload pool, instant retry delays and a manual clock.
pub fn builder(clock: &ManualClock) -> FaultToleranceBuilder {
    FaultTolerance::builder()
        .offload(OffloadPool::dedicated(4).expect("offload runtime"))
        .sleeper(InstantSleeper)
        .blocking_sleeper(InstantSleeper)
        .clock(clock.clone())
}

pub fn tolerance() -> (FaultTolerance, ManualClock) {
    let clock = ManualClock::new();
    let ft = builder(&clock).build().expect("fault tolerance");
    (ft, clock)
}

#[derive(Debug, thiserror::Error)]
#[error("service unavailable")]
pub struct Unavailable;

#[derive(Debug, thiserror::Error)]
#[error("bad request")]
pub struct BadRequest;
