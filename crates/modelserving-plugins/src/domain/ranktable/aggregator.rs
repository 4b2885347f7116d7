use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;

use super::DeviceInfo;
use super::DeviceWithRank;
use super::PodRanktableData;
use super::RanktableStatus;
use super::RanktableTemplateData;
use super::ServerInfo;

/// Trait for getting current time
pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl TimeSource for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Build the rank table template context from pod contributions.
///
/// Devices are grouped by server id. Servers are ordered by id, devices by
/// `(device_id, device_ip)`, and rank ids are assigned from 0 in that order,
/// so the result only depends on the set of inputs and not on their order.
pub fn aggregate(
    status: RanktableStatus,
    contributions: &[PodRanktableData],
    clock: &dyn TimeSource,
) -> RanktableTemplateData {
    let mut by_server: BTreeMap<&str, Vec<&DeviceInfo>> = BTreeMap::new();
    for pod in contributions {
        by_server
            .entry(pod.server_id.as_str())
            .or_default()
            .extend(pod.devices.iter());
    }

    let mut next_rank = 0usize;
    let servers: Vec<ServerInfo> = by_server
        .into_iter()
        .map(|(server_id, mut devices)| {
            devices.sort();
            let devices = devices
                .into_iter()
                .map(|device| {
                    let rank_id = next_rank.to_string();
                    next_rank += 1;
                    DeviceWithRank {
                        device_id: device.device_id.clone(),
                        device_ip: device.device_ip.clone(),
                        rank_id,
                    }
                })
                .collect();
            ServerInfo {
                server_id: server_id.to_string(),
                devices,
            }
        })
        .collect();

    RanktableTemplateData {
        status,
        server_count: servers.len(),
        total_devices: next_rank,
        timestamp: clock.now().to_rfc3339_opts(SecondsFormat::Secs, true),
        servers,
    }
}
