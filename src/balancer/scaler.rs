use super::worker::{WorkerNode, WorkerSpec};
use super::WorkerPool;
use crate::metrics;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Result of a scaling request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ScaleOutcome {
    /// Pool resized
    Scaled {
        from: usize,
        to: usize,
        added: Vec<String>,
        removed: Vec<String>,
    },
    /// Pool already at the requested size
    Unchanged { size: usize },
    /// Inside the cooldown window; nothing done
    CoolingDown { size: usize, remaining_ms: u64 },
}

impl ScaleOutcome {
    pub fn is_scaled(&self) -> bool {
        matches!(self, ScaleOutcome::Scaled { .. })
    }
}

impl WorkerPool {
    fn placeholder_spec(&self, offset: usize) -> WorkerSpec {
        let template = &self.config.template;
        let suffix = Uuid::new_v4().simple().to_string();
        WorkerSpec {
            id: format!("worker-managed-{}", &suffix[..12]),
            host: template.host.clone(),
            port: template.port.saturating_add(offset as u16),
            max_jobs: template.max_jobs,
            capabilities: template.capabilities.clone(),
            weight: template.weight,
            managed: true,
        }
    }

    /// Resize the pool to `target` nodes, clamped to the configured bounds
    ///
    /// Growth adds scaler-managed placeholder nodes; shrinking removes the
    /// most idle nodes first. A request inside the cooldown after the
    /// previous resize is a no-op.
    pub async fn scale(&self, target: usize) -> ScaleOutcome {
        let mut last_scale = self.last_scale.lock().await;

        let target = target.clamp(self.config.min_nodes, self.config.max_nodes.max(self.config.min_nodes));
        let cooldown = self.config.scale_cooldown();

        if let Some(at) = *last_scale {
            let elapsed = at.elapsed();
            if elapsed < cooldown {
                let size = self.len().await;
                let remaining_ms = (cooldown - elapsed).as_millis() as u64;
                debug!(size, target, remaining_ms, "Scale request inside cooldown");
                return ScaleOutcome::CoolingDown { size, remaining_ms };
            }
        }

        let mut nodes = self.nodes.write().await;
        let from = nodes.len();
        let mut added = Vec::new();
        let mut removed = Vec::new();

        if target > from {
            for offset in from..target {
                let node = Arc::new(WorkerNode::new(self.placeholder_spec(offset)));
                added.push(node.id().to_string());
                nodes.push(node);
            }
        } else if target < from {
            // Most idle first; among equals prefer managed nodes, newest first
            let mut order: Vec<(usize, usize, bool)> = nodes
                .iter()
                .enumerate()
                .map(|(i, n)| (i, n.active_jobs(), n.is_managed()))
                .collect();
            order.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)).then(b.0.cmp(&a.0)));

            let doomed: Vec<usize> = order.iter().take(from - target).map(|(i, _, _)| *i).collect();
            let mut index = 0;
            nodes.retain(|n| {
                let keep = !doomed.contains(&index);
                if !keep {
                    removed.push(n.id().to_string());
                }
                index += 1;
                keep
            });
        } else {
            return ScaleOutcome::Unchanged { size: from };
        }

        let to = nodes.len();
        drop(nodes);
        *last_scale = Some(Instant::now());

        metrics::record_scale_event(from, to);
        info!(from, to, added = added.len(), removed = removed.len(), "Scaled worker pool");

        ScaleOutcome::Scaled {
            from,
            to,
            added,
            removed,
        }
    }

    /// One autoscaling evaluation; None when no action was warranted
    pub async fn autoscale_tick(&self) -> Option<ScaleOutcome> {
        let autoscale = &self.config.autoscale;
        if !autoscale.enabled {
            return None;
        }

        let stats = self.stats().await;
        let size = stats.total_nodes;
        let step = autoscale.step.max(1);

        let target = if size < self.config.min_nodes {
            self.config.min_nodes
        } else if stats.utilization > autoscale.scale_up_utilization && size < self.config.max_nodes {
            size + step
        } else if stats.utilization < autoscale.scale_down_utilization && size > self.config.min_nodes {
            size.saturating_sub(step)
        } else {
            return None;
        };

        debug!(
            size,
            target,
            utilization = stats.utilization,
            "Autoscale evaluation"
        );
        Some(self.scale(target).await)
    }
}
