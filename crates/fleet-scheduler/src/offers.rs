//! Resource offers and per-round placement constraints.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use fleet_state::{ActiveTask, NodePlacement, Request, Resources};

/// Resources on one host that the resource manager offers for launches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub host: String,
    pub rack: String,
    pub resources: Resources,
}

/// Where every request's tasks currently sit, updated as an offer round
/// launches tasks.
#[derive(Debug, Default)]
pub(crate) struct PlacementView {
    per_host: HashMap<(String, String), u32>,
    per_rack: HashMap<(String, String), u32>,
    hosts: BTreeSet<String>,
    racks: BTreeSet<String>,
}

impl PlacementView {
    pub(crate) fn new(active: &[ActiveTask], offers: &[Offer]) -> Self {
        let mut view = Self::default();
        for offer in offers {
            view.hosts.insert(offer.host.clone());
            view.racks.insert(offer.rack.clone());
        }
        for task in active {
            view.record(task);
        }
        view
    }

    pub(crate) fn record(&mut self, task: &ActiveTask) {
        self.hosts.insert(task.host.clone());
        self.racks.insert(task.rack.clone());
        *self
            .per_host
            .entry((task.request_id.clone(), task.host.clone()))
            .or_default() += 1;
        *self
            .per_rack
            .entry((task.request_id.clone(), task.rack.clone()))
            .or_default() += 1;
    }

    fn on_host(&self, request_id: &str, host: &str) -> u32 {
        self.per_host
            .get(&(request_id.to_string(), host.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn on_rack(&self, request_id: &str, rack: &str) -> u32 {
        self.per_rack
            .get(&(request_id.to_string(), rack.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Whether one more task of `request` may land on the offer's host.
    pub(crate) fn allows(&self, request: &Request, offer: &Offer) -> bool {
        let affinity = request.rack_affinity();
        if !affinity.is_empty() && !affinity.iter().any(|r| r == &offer.rack) {
            return false;
        }

        let on_host = self.on_host(request.id(), &offer.host);
        let placement_ok = match request.node_placement() {
            NodePlacement::Separate => on_host == 0,
            NodePlacement::Optimistic => {
                on_host < fair_share(request.instances(), self.hosts.len())
            }
            NodePlacement::Greedy => true,
        };
        if !placement_ok {
            return false;
        }

        if request.is_rack_sensitive() {
            let on_rack = self.on_rack(request.id(), &offer.rack);
            return on_rack < fair_share(request.instances(), self.racks.len());
        }
        true
    }
}

/// `ceil(instances / slots)`, at least one.
fn fair_share(instances: u32, slots: usize) -> u32 {
    let slots = slots.max(1) as u32;
    instances.div_ceil(slots).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_state::{PendingTask, PendingTaskId, PendingType, RequestType};

    fn offer(host: &str, rack: &str) -> Offer {
        Offer {
            id: format!("offer-{host}"),
            host: host.to_string(),
            rack: rack.to_string(),
            resources: Resources::new(4.0, 4096.0),
        }
    }

    fn running(request_id: &str, instance_no: u32, host: &str, rack: &str) -> ActiveTask {
        let pending = PendingTask {
            id: PendingTaskId::new(request_id, "d1", instance_no),
            pending_type: PendingType::NewDeploy,
            next_run_at: 0,
            created_from: 0,
            user: None,
            cmd_line_args: Vec::new(),
        };
        ActiveTask::from_pending(&pending, host, rack, 1)
    }

    fn service(placement: NodePlacement, instances: u32) -> Request {
        Request::builder("web")
            .request_type(RequestType::Service)
            .node_placement(placement)
            .instances(instances)
            .build()
    }

    #[test]
    fn separate_allows_one_per_host() {
        let offers = [offer("a", "r1"), offer("b", "r1")];
        let view = PlacementView::new(&[running("web", 1, "a", "r1")], &offers);
        let request = service(NodePlacement::Separate, 2);

        assert!(!view.allows(&request, &offers[0]));
        assert!(view.allows(&request, &offers[1]));
    }

    #[test]
    fn optimistic_spreads_evenly() {
        let offers = [offer("a", "r1"), offer("b", "r1")];
        let mut view = PlacementView::new(&[], &offers);
        let request = service(NodePlacement::Optimistic, 4);

        view.record(&running("web", 1, "a", "r1"));
        assert!(view.allows(&request, &offers[0]));
        view.record(&running("web", 2, "a", "r1"));
        assert!(!view.allows(&request, &offers[0]));
        assert!(view.allows(&request, &offers[1]));
    }

    #[test]
    fn greedy_ignores_host_counts() {
        let offers = [offer("a", "r1")];
        let view = PlacementView::new(
            &[running("web", 1, "a", "r1"), running("web", 2, "a", "r1")],
            &offers,
        );
        assert!(view.allows(&service(NodePlacement::Greedy, 3), &offers[0]));
    }

    #[test]
    fn rack_affinity_and_sensitivity() {
        let offers = [offer("a", "r1"), offer("b", "r2")];
        let pinned = Request::builder("web")
            .request_type(RequestType::Service)
            .rack_affinity(vec!["r2".into()])
            .build();
        let view = PlacementView::new(&[running("web", 1, "a", "r1")], &offers);
        assert!(!view.allows(&pinned, &offers[0]));
        assert!(view.allows(&pinned, &offers[1]));

        let spread = Request::builder("web")
            .request_type(RequestType::Service)
            .instances(2)
            .rack_sensitive(true)
            .build();
        assert!(!view.allows(&spread, &offers[0]));
        assert!(view.allows(&spread, &offers[1]));
    }
}
