//! Placement Engine (C3): a pure function over a Registry snapshot.
//!
//! No I/O here by design — the retry-on-reservation-race loop around
//! `Registry::reserve` lives in the Lifecycle Manager (§4.4), which is
//! the only component allowed to re-snapshot and re-evaluate.

use crate::types::{ServerRecord, ServerStatus};

#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub requirements: crate::types::Requirements,
    pub region_preference: Option<String>,
    pub labels_required: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    RegionUnsatisfiable,
    CapacityUnsatisfiable,
}

/// Select the best-fit server for `req` out of `servers`. Deterministic:
/// the same snapshot and request always return the same `server_id`
/// (P5).
pub fn place(
    servers: &[ServerRecord],
    req: &PlacementRequest,
) -> Result<String, PlacementError> {
    let mut candidates: Vec<&ServerRecord> = servers
        .iter()
        .filter(|s| s.status == ServerStatus::Active)
        .collect();

    if let Some(region) = &req.region_preference {
        candidates.retain(|s| &s.topology.region == region);
        if candidates.is_empty() {
            return Err(PlacementError::RegionUnsatisfiable);
        }
    }

    candidates.retain(|s| s.topology.architecture == req.requirements.architecture);

    if req.requirements.requires_gpu {
        candidates.retain(|s| {
            s.topology.has_gpu
                && req
                    .requirements
                    .gpu_kind
                    .map(|k| s.topology.gpu_kind == Some(k))
                    .unwrap_or(true)
        });
    }

    if !req.labels_required.is_empty() {
        candidates.retain(|s| {
            req.labels_required
                .iter()
                .all(|(k, v)| s.topology.labels.get(k).map(|x| x == v).unwrap_or(false))
        });
    }

    candidates.retain(|s| {
        s.capacity
            .can_fit(&s.reserved, &req.requirements)
    });

    if candidates.is_empty() {
        return Err(PlacementError::CapacityUnsatisfiable);
    }

    candidates.sort_by(|a, b| {
        let util_a = a.capacity.utilization_after(&{
            let mut r = a.reserved;
            r.add_requirements(&req.requirements);
            r
        });
        let util_b = b.capacity.utilization_after(&{
            let mut r = b.reserved;
            r.add_requirements(&req.requirements);
            r
        });
        util_a
            .partial_cmp(&util_b)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.active_workspaces.cmp(&b.active_workspaces))
            .then_with(|| a.id.cmp(&b.id))
    });

    Ok(candidates[0].id.clone())
}

/// Live-scale variant: only ever consider the workspace's current host.
/// Accepts the delta only if that host can still fit it.
pub fn place_same_server(
    server: &ServerRecord,
    delta: &crate::types::ResourceDelta,
) -> Result<(), PlacementError> {
    let mut projected = server.reserved;
    projected.add(delta);
    let fits = projected.cpu_cores <= server.capacity.cpu_cores
        && projected.memory_mb <= server.capacity.memory_mb
        && projected.disk_gb <= server.capacity.disk_gb
        && projected.bandwidth_mbps <= server.capacity.bandwidth_mbps;
    if fits {
        Ok(())
    } else {
        Err(PlacementError::CapacityUnsatisfiable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Architecture, Capacity, Requirements, Topology};

    fn server(id: &str, region: &str, cpu: f64, active: u32) -> ServerRecord {
        ServerRecord {
            id: id.into(),
            hostname: id.into(),
            address: "127.0.0.1".into(),
            management_port: 9000,
            status: ServerStatus::Active,
            capacity: Capacity {
                cpu_cores: cpu,
                memory_mb: 16384,
                disk_gb: 200,
                bandwidth_mbps: 1000,
            },
            reserved: Capacity::default(),
            active_workspaces: active,
            topology: Topology {
                architecture: Architecture::Amd64,
                region: region.into(),
                labels: Default::default(),
                has_gpu: false,
                gpu_kind: None,
                gpu_count: 0,
            },
            workspace_image_by_variant: Default::default(),
            last_heartbeat_ts: None,
            consecutive_heartbeat_failures: 0,
        }
    }

    fn req() -> Requirements {
        Requirements {
            cpu_cores: 2.0,
            memory_mb: 2048,
            disk_gb: 50,
            bandwidth_mbps: 100,
            architecture: Architecture::Amd64,
            requires_gpu: false,
            gpu_kind: None,
        }
    }

    #[test]
    fn strict_region_with_no_candidates_fails() {
        let servers = vec![server("s1", "us-east-1", 8.0, 0)];
        let request = PlacementRequest {
            requirements: req(),
            region_preference: Some("eu-west-1".into()),
            labels_required: vec![],
        };
        assert_eq!(
            place(&servers, &request),
            Err(PlacementError::RegionUnsatisfiable)
        );
    }

    #[test]
    fn picks_lowest_post_placement_utilization() {
        let servers = vec![server("s1", "us-east-1", 4.0, 0), server("s2", "us-east-1", 16.0, 0)];
        let request = PlacementRequest {
            requirements: req(),
            region_preference: None,
            labels_required: vec![],
        };
        assert_eq!(place(&servers, &request).unwrap(), "s2");
    }

    #[test]
    fn deterministic_tie_break_by_server_id() {
        let servers = vec![server("b", "us-east-1", 8.0, 0), server("a", "us-east-1", 8.0, 0)];
        let request = PlacementRequest {
            requirements: req(),
            region_preference: None,
            labels_required: vec![],
        };
        assert_eq!(place(&servers, &request).unwrap(), "a");
    }

    #[test]
    fn same_server_scale_rejects_overflow() {
        let s = server("s1", "us-east-1", 4.0, 1);
        let delta = crate::types::ResourceDelta {
            cpu_cores: 5.0,
            memory_mb: 0,
            disk_gb: 0,
            bandwidth_mbps: 0,
        };
        assert_eq!(
            place_same_server(&s, &delta),
            Err(PlacementError::CapacityUnsatisfiable)
        );
    }
}
