//! Resource sampling for a single benchmark run

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{Networks, Pid, ProcessRefreshKind, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Resource usage observed between `start` and `stop`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Mean CPU usage of this process and its direct children
    pub cpu_percent: f64,
    /// Bytes received plus transmitted over all interfaces
    pub network_bytes: u64,
    /// CPU readings taken
    pub samples: usize,
}

/// Background sampler bound to the lifetime of one run
pub struct ResourceSampler {
    cancel: CancellationToken,
    handle: JoinHandle<ResourceUsage>,
}

impl ResourceSampler {
    /// Start sampling every `interval` on a separate task
    pub fn start(interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let pid = sysinfo::get_current_pid().ok();
            let mut system = System::new();
            let mut networks = Networks::new_with_refreshed_list();
            let baseline = network_total(&networks);

            // The first refresh only establishes the CPU baseline
            system.refresh_processes_specifics(ProcessRefreshKind::new().with_cpu());

            let mut readings = Vec::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        system.refresh_processes_specifics(ProcessRefreshKind::new().with_cpu());
                        if let Some(pid) = pid {
                            readings.push(process_tree_cpu(&system, pid));
                        }
                    }
                }
            }

            networks.refresh();
            let network_bytes = network_total(&networks).saturating_sub(baseline);
            let cpu_percent = if readings.is_empty() {
                0.0
            } else {
                readings.iter().sum::<f64>() / readings.len() as f64
            };

            ResourceUsage {
                cpu_percent,
                network_bytes,
                samples: readings.len(),
            }
        });

        Self { cancel, handle }
    }

    /// Stop sampling immediately and return what was observed
    pub async fn stop(self) -> ResourceUsage {
        self.cancel.cancel();
        match self.handle.await {
            Ok(usage) => usage,
            Err(e) => {
                tracing::error!("Resource sampler failed: {}", e);
                ResourceUsage::default()
            }
        }
    }
}

fn process_tree_cpu(system: &System, pid: Pid) -> f64 {
    system
        .processes()
        .iter()
        .filter(|(candidate, process)| **candidate == pid || process.parent() == Some(pid))
        .map(|(_, process)| process.cpu_usage() as f64)
        .sum()
}

fn network_total(networks: &Networks) -> u64 {
    networks
        .iter()
        .map(|(_, data)| data.total_received() + data.total_transmitted())
        .sum()
}
