//! Synthetic critical-section workload driven through a `MutexHandle`.

use crate::protocol::NodeId;
use crate::server::{MutexHandle, ReplicaConfigMaekawa};
use crate::utils::MaekawaError;

use rand::Rng;

use tokio::time::{self, Duration};

/// Runs `config.quota` cycles of: think for a random time within
/// `[think_min_ms, think_max_ms]`, acquire, hold the CS for `hold_ms`,
/// release. Returns the number of cycles completed.
pub async fn run_workload(
    handle: MutexHandle,
    id: NodeId,
    config: ReplicaConfigMaekawa,
) -> Result<u32, MaekawaError> {
    config.scheme()?;

    for cycle in 1..=config.quota {
        let think_ms = rand::thread_rng()
            .gen_range(config.think_min_ms..=config.think_max_ms);
        pf_debug!(id; "cycle {} thinking for {} ms", cycle, think_ms);
        time::sleep(Duration::from_millis(think_ms)).await;

        handle.acquire().await?;
        pf_info!(id; "in critical section (cycle {}/{})", cycle, config.quota);
        time::sleep(Duration::from_millis(config.hold_ms)).await;
        handle.release().await?;
    }

    Ok(config.quota)
}
