//! Engine selection for pending requests.
//!
//! Matching is a pure function over [`Candidate`] snapshots:
//! - **Hard filters**: ready, enabled, enough free IPs, enough capacity
//!   budget for the declared load, required labels present
//! - **Ranking**: fewest in-flight deploy operations, first seen on ties

use std::collections::BTreeSet;

use serde::Serialize;

use packgrid_core::{BUILDER_LABEL, DeployRequest};
use packgrid_engine::{EngineController, EngineStatus};

/// What the matcher knows about one engine at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub id: String,
    pub ready: bool,
    pub disabled: bool,
    pub free_ips: usize,
    pub capacity_left: u32,
    pub labels: BTreeSet<String>,
    pub deploy_ops: usize,
}

impl Candidate {
    pub fn of(controller: &EngineController) -> Self {
        let info = controller.info();
        Self {
            id: controller.id().to_string(),
            ready: controller.status() == EngineStatus::Ready,
            disabled: info.disabled,
            free_ips: controller.free_ip_count(),
            capacity_left: controller
                .capacity_limit()
                .saturating_sub(controller.capacity_used()),
            labels: info.effective_labels(),
            deploy_ops: controller.deploy_ops(),
        }
    }

    fn usable(&self) -> bool {
        self.ready && !self.disabled
    }

    /// Whether this engine can take the request right now.
    pub fn fits(&self, request: &DeployRequest) -> bool {
        if !self.usable() || self.free_ips < request.max_clones() {
            return false;
        }
        let load = request.load.unwrap_or(0);
        if load > 0 && load > self.capacity_left {
            return false;
        }
        request.engine_filters.iter().all(|l| self.labels.contains(l))
    }
}

/// The engine a deploy request goes to, if any can take it.
pub fn pick_engine<'a>(candidates: &'a [Candidate], request: &DeployRequest) -> Option<&'a Candidate> {
    candidates
        .iter()
        .filter(|c| c.fits(request))
        // min_by_key keeps the first of equal keys.
        .min_by_key(|c| c.deploy_ops)
}

/// The first usable engine carrying the builder label.
pub fn pick_builder(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates
        .iter()
        .find(|c| c.usable() && c.labels.contains(BUILDER_LABEL))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(id: &str, free_ips: usize, deploy_ops: usize) -> Candidate {
        Candidate {
            id: id.into(),
            ready: true,
            disabled: false,
            free_ips,
            capacity_left: 100,
            labels: BTreeSet::from([id.to_string()]),
            deploy_ops,
        }
    }

    fn request(extra: u32) -> DeployRequest {
        let mut req = DeployRequest {
            bundle_id: "b_1".into(),
            ..Default::default()
        };
        if extra > 0 {
            req.extra_clones.insert("web".into(), extra);
        }
        req
    }

    #[test]
    fn picks_least_busy_engine() {
        let engines = vec![engine("a", 5, 3), engine("b", 5, 1), engine("c", 5, 1)];
        assert_eq!(pick_engine(&engines, &request(0)).map(|c| c.id.as_str()), Some("b"));
    }

    #[test]
    fn needs_one_ip_per_clone_of_widest_role() {
        let engines = vec![engine("a", 2, 0)];
        assert!(pick_engine(&engines, &request(1)).is_some());
        assert!(pick_engine(&engines, &request(2)).is_none());
    }

    #[test]
    fn skips_unready_and_disabled() {
        let mut down = engine("a", 5, 0);
        down.ready = false;
        let mut off = engine("b", 5, 0);
        off.disabled = true;
        let engines = vec![down, off, engine("c", 5, 9)];
        assert_eq!(pick_engine(&engines, &request(0)).map(|c| c.id.as_str()), Some("c"));
    }

    #[test]
    fn load_must_fit_remaining_capacity() {
        let mut busy = engine("a", 5, 0);
        busy.capacity_left = 3;
        let engines = vec![busy];

        let mut req = request(0);
        req.load = Some(3);
        assert!(pick_engine(&engines, &req).is_some());
        req.load = Some(4);
        assert!(pick_engine(&engines, &req).is_none());

        // Zero load ignores the budget entirely.
        let mut full = engine("b", 5, 0);
        full.capacity_left = 0;
        assert!(pick_engine(&[full], &request(0)).is_some());
    }

    #[test]
    fn filters_are_a_label_subset() {
        let mut gpu = engine("a", 5, 4);
        gpu.labels.insert("gpu".into());
        let engines = vec![engine("b", 5, 0), gpu];

        let mut req = request(0);
        req.engine_filters = vec!["gpu".into()];
        assert_eq!(pick_engine(&engines, &req).map(|c| c.id.as_str()), Some("a"));

        req.engine_filters = vec!["gpu".into(), "ssd".into()];
        assert!(pick_engine(&engines, &req).is_none());

        // An engine's own id always counts as a label.
        req.engine_filters = vec!["b".into()];
        assert_eq!(pick_engine(&engines, &req).map(|c| c.id.as_str()), Some("b"));
    }

    #[test]
    fn builder_needs_label_and_readiness() {
        let mut idle = engine("a", 0, 0);
        idle.labels.insert(BUILDER_LABEL.into());
        idle.ready = false;
        let mut builder = engine("b", 0, 0);
        builder.labels.insert(BUILDER_LABEL.into());
        let plain = engine("c", 9, 0);

        assert!(pick_builder(&[plain.clone()]).is_none());
        assert_eq!(pick_builder(&[idle, plain, builder]).map(|c| c.id.as_str()), Some("b"));
    }
}
