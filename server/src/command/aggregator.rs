//! In-flight node operations spread across several gateways.
//!
//! A group is created per client request (or per internal bulk operation) and
//! holds one member per gateway connection. The group is removed, and its
//! results handed back exactly once, when its last member completes.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use wsn_common::{Action, NodeOutcome};

use super::connection::ConnId;

pub type GroupId = u64;

#[derive(Debug)]
struct PendingGroup {
    origin: Option<ConnId>,
    action: Action,
    image_name: Option<String>,
    members: HashSet<ConnId>,
    results: Vec<NodeOutcome>,
    opened: Instant,
}

/// What the fan-in side needs to know about a gateway connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub gateway_id: String,
    pub action: Action,
    pub image_name: Option<String>,
}

/// A finished group, ready to be flushed to its origin.
#[derive(Debug, PartialEq, Eq)]
pub struct Completed {
    pub group: GroupId,
    pub origin: Option<ConnId>,
    pub action: Action,
    pub results: Vec<NodeOutcome>,
}

#[derive(Debug, Default)]
pub struct RequestAggregator {
    next_group: GroupId,
    groups: HashMap<GroupId, PendingGroup>,
    /// Gateway connection -> (group, gateway id).
    members: HashMap<ConnId, (GroupId, String)>,
}

impl RequestAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(
        &mut self,
        origin: Option<ConnId>,
        action: Action,
        image_name: Option<String>,
        now: Instant,
    ) -> GroupId {
        self.next_group += 1;
        let id = self.next_group;
        self.groups.insert(
            id,
            PendingGroup {
                origin,
                action,
                image_name,
                members: HashSet::new(),
                results: Vec::new(),
                opened: now,
            },
        );
        id
    }

    pub fn attach(&mut self, group: GroupId, conn: ConnId, gateway_id: &str) {
        if let Some(pending) = self.groups.get_mut(&group) {
            pending.members.insert(conn);
            self.members.insert(conn, (group, gateway_id.to_string()));
        }
    }

    pub fn is_member(&self, conn: ConnId) -> bool {
        self.members.contains_key(&conn)
    }

    pub fn member(&self, conn: ConnId) -> Option<MemberInfo> {
        let (group, gateway_id) = self.members.get(&conn)?;
        let pending = self.groups.get(group)?;
        Some(MemberInfo {
            gateway_id: gateway_id.clone(),
            action: pending.action,
            image_name: pending.image_name.clone(),
        })
    }

    /// Record a gateway's outcomes and retire its connection.
    pub fn record(&mut self, conn: ConnId, outcomes: Vec<NodeOutcome>) -> Option<Completed> {
        let (group, _) = self.members.remove(&conn)?;
        let pending = self.groups.get_mut(&group)?;
        pending.members.remove(&conn);
        pending.results.extend(outcomes);
        self.finish_if_empty(group)
    }

    /// A gateway connection went away without a result.
    pub fn abandon(&mut self, conn: ConnId) -> Option<Completed> {
        self.record(conn, Vec::new())
    }

    /// Complete the group if it has no outstanding gateway.
    pub fn finish_if_empty(&mut self, group: GroupId) -> Option<Completed> {
        if !self.groups.get(&group)?.members.is_empty() {
            return None;
        }
        let pending = self.groups.remove(&group)?;
        Some(Completed {
            group,
            origin: pending.origin,
            action: pending.action,
            results: pending.results,
        })
    }

    /// Force-complete groups open for longer than `timeout`. Each entry comes
    /// with the gateway connections that never answered.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(Completed, Vec<ConnId>)> {
        let stale: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|(_, g)| now.saturating_duration_since(g.opened) > timeout)
            .map(|(id, _)| *id)
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            let Some(pending) = self.groups.remove(&id) else {
                continue;
            };
            let mut conns: Vec<ConnId> = pending.members.into_iter().collect();
            conns.sort_unstable();
            for conn in &conns {
                self.members.remove(conn);
            }
            expired.push((
                Completed {
                    group: id,
                    origin: pending.origin,
                    action: pending.action,
                    results: pending.results,
                },
                conns,
            ));
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wsn_common::NodeStatus;

    fn outcome(uid: &str, status: NodeStatus) -> NodeOutcome {
        NodeOutcome {
            uid: uid.to_string(),
            status,
        }
    }

    #[test]
    fn test_group_flushes_once_after_all_gateways() {
        let mut agg = RequestAggregator::new();
        let group = agg.open(Some(1), Action::NodesFlash, Some("blink.hex".to_string()), Instant::now());
        agg.attach(group, 10, "gw1");
        agg.attach(group, 11, "gw2");

        assert_eq!(agg.record(10, vec![outcome("a", NodeStatus::Flashed)]), None);
        let done = agg.record(11, vec![outcome("b", NodeStatus::Error)]).unwrap();

        assert_eq!(done.origin, Some(1));
        assert_eq!(done.action, Action::NodesFlash);
        assert_eq!(
            done.results,
            vec![outcome("a", NodeStatus::Flashed), outcome("b", NodeStatus::Error)]
        );
        assert!(agg.is_empty());

        // Late or duplicate replies find nothing.
        assert_eq!(agg.record(11, vec![]), None);
        assert!(!agg.is_member(10));
    }

    #[test]
    fn test_member_info() {
        let mut agg = RequestAggregator::new();
        let group = agg.open(None, Action::NodesFlash, Some("blink.hex".to_string()), Instant::now());
        agg.attach(group, 4, "gw1");

        assert_eq!(
            agg.member(4),
            Some(MemberInfo {
                gateway_id: "gw1".to_string(),
                action: Action::NodesFlash,
                image_name: Some("blink.hex".to_string()),
            })
        );
        assert_eq!(agg.member(5), None);
    }

    #[test]
    fn test_abandoned_gateway_still_completes_group() {
        let mut agg = RequestAggregator::new();
        let group = agg.open(Some(1), Action::NodesErase, None, Instant::now());
        agg.attach(group, 10, "gw1");
        agg.attach(group, 11, "gw2");

        agg.record(10, vec![outcome("a", NodeStatus::Erased)]);
        let done = agg.abandon(11).unwrap();
        assert_eq!(done.results, vec![outcome("a", NodeStatus::Erased)]);
    }

    #[test]
    fn test_group_without_gateways_finishes_immediately() {
        let mut agg = RequestAggregator::new();
        let group = agg.open(Some(2), Action::NodesReset, None, Instant::now());

        let done = agg.finish_if_empty(group).unwrap();
        assert!(done.results.is_empty());
        assert_eq!(agg.finish_if_empty(group), None);
    }

    #[test]
    fn test_groups_are_independent() {
        let mut agg = RequestAggregator::new();
        let now = Instant::now();
        let first = agg.open(Some(1), Action::NodesReset, None, now);
        let second = agg.open(Some(2), Action::NodesReset, None, now);
        agg.attach(first, 10, "gw1");
        agg.attach(second, 11, "gw1");

        let done = agg.record(11, vec![]).unwrap();
        assert_eq!(done.group, second);
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn test_expire_returns_unanswered_connections() {
        let mut agg = RequestAggregator::new();
        let t0 = Instant::now();
        let old = agg.open(Some(1), Action::NodesFlash, None, t0);
        agg.attach(old, 10, "gw1");
        agg.attach(old, 11, "gw2");
        agg.record(10, vec![outcome("a", NodeStatus::Flashed)]);
        let fresh = agg.open(Some(2), Action::NodesFlash, None, t0 + Duration::from_secs(8));
        agg.attach(fresh, 12, "gw1");

        let expired = agg.expire(t0 + Duration::from_secs(11), Duration::from_secs(10));
        assert_eq!(expired.len(), 1);
        let (done, conns) = &expired[0];
        assert_eq!(done.group, old);
        assert_eq!(done.results.len(), 1);
        assert_eq!(conns, &vec![11]);
        assert!(!agg.is_member(11));
        assert!(agg.is_member(12));
    }
}
