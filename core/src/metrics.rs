//! Round metrics of the coordinator. Exported through Prometheus by `aspd`
//! when a metrics address is configured.

use metrics::{Counter, Gauge, Histogram};
use metrics_derive::Metrics;
use std::sync::LazyLock;

#[derive(Metrics)]
#[metrics(scope = "ark_rounds")]
/// Outcomes and sizes of the rounds run by this coordinator.
pub struct RoundMetrics {
    #[metric(describe = "The number of rounds that completed with a broadcast funding transaction")]
    pub completed: Counter,
    #[metric(describe = "The number of rounds aborted before broadcast")]
    pub aborted: Counter,
    #[metric(describe = "The number of claim tree rebuilds after participants were excluded")]
    pub rebuilds: Counter,
    #[metric(describe = "The number of participants excluded during signing")]
    pub excluded_participants: Counter,
    #[metric(describe = "The number of claim requests rejected during registration")]
    pub rejected_requests: Counter,
    #[metric(describe = "The number of claims in the last completed round")]
    pub last_round_claims: Gauge,
    #[metric(describe = "The identifier of the round currently running")]
    pub current_round: Gauge,
    #[metric(describe = "Seconds from registration close to funding broadcast")]
    pub signing_duration_seconds: Histogram,
}

#[derive(Metrics)]
#[metrics(scope = "ark_claims")]
/// Claim lifecycle counters of the exit and forfeit manager.
pub struct ClaimMetrics {
    #[metric(describe = "The number of forfeits accepted")]
    pub forfeited: Counter,
    #[metric(describe = "The number of claims recorded as exited on-chain")]
    pub exited: Counter,
    #[metric(describe = "The number of expired claim trees swept by the coordinator")]
    pub swept_rounds: Counter,
}

pub static ROUND_METRICS: LazyLock<RoundMetrics> = LazyLock::new(|| {
    RoundMetrics::describe();
    RoundMetrics::default()
});

pub static CLAIM_METRICS: LazyLock<ClaimMetrics> = LazyLock::new(|| {
    ClaimMetrics::describe();
    ClaimMetrics::default()
});
