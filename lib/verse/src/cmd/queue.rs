use crate::cmd::node::{self, NodeCmd, DEFAULT_PRIORITY};
use crate::cmd::{FakeCmd, InCmd, OutCmd};
use hashbrown::HashMap;
use std::collections::{BTreeMap, VecDeque};

/// Exponential weight of a priority bucket relative to the default
/// priority. Sixteen priority steps double a bucket's share.
#[inline]
pub fn prio_weight(prio: u8) -> f32 {
    2f32.powf((f32::from(prio) - f32::from(DEFAULT_PRIORITY)) / 16.0)
}

/// One popped unit of work for the packer: a fake command consumed by the
/// scheduler itself, or a run of node commands ready to pack as one group.
#[derive(Debug, PartialEq)]
pub enum Popped {
    Fake(FakeCmd),
    Group { cmds: Vec<NodeCmd>, share: u8 },
}

#[derive(Debug)]
struct Slot {
    cmd: Option<OutCmd>,
}

type AddrKey = (u8, u8, Vec<u8>);

/// The outgoing queue: priority buckets over a slot arena, with
/// address-share dedup. Pushing a command whose (priority, family, address)
/// matches a queued one replaces the queued payload in place; commands with
/// an empty address never coalesce.
pub struct OutQueue {
    slots: Vec<Slot>,
    free: Vec<usize>,
    buckets: BTreeMap<u8, VecDeque<usize>>,
    by_addr: HashMap<AddrKey, usize>,
    count: usize,
}

impl OutQueue {
    pub fn new() -> OutQueue {
        OutQueue {
            slots: Vec::new(),
            free: Vec::new(),
            buckets: BTreeMap::new(),
            by_addr: HashMap::new(),
            count: 0,
        }
    }

    /// Total queued commands across all buckets.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn count_prio(&self, prio: u8) -> usize {
        self.buckets.get(&prio).map_or(0, VecDeque::len)
    }

    /// Highest and lowest non-empty priorities.
    #[inline]
    pub fn max_prio(&self) -> Option<u8> {
        self.buckets.iter().rev().find(|(_, b)| !b.is_empty()).map(|(&p, _)| p)
    }

    #[inline]
    pub fn min_prio(&self) -> Option<u8> {
        self.buckets.iter().find(|(_, b)| !b.is_empty()).map(|(&p, _)| p)
    }

    /// Sum of bucket weights at or above the default priority.
    pub fn prio_sum_high(&self) -> f32 {
        self.buckets
            .iter()
            .filter(|(&p, b)| p >= DEFAULT_PRIORITY && !b.is_empty())
            .map(|(&p, _)| prio_weight(p))
            .sum()
    }

    /// Sum of bucket weights below the default priority.
    pub fn prio_sum_low(&self) -> f32 {
        self.buckets
            .iter()
            .filter(|(&p, b)| p < DEFAULT_PRIORITY && !b.is_empty())
            .map(|(&p, _)| prio_weight(p))
            .sum()
    }

    /// Queues a node command at its own priority.
    pub fn push_node(&mut self, cmd: NodeCmd) {
        let prio = cmd.prio;

        if cmd.coalesces() {
            let key = (prio, cmd.id, cmd.addr.clone());
            if let Some(&index) = self.by_addr.get(&key) {
                // Same target already queued: the new payload wins, the
                // queue position stays.
                self.slots[index].cmd = Some(OutCmd::Node(cmd));
                return;
            }

            let index = self.alloc(OutCmd::Node(cmd));
            self.by_addr.insert(key, index);
            self.bucket(prio).push_back(index);
        } else {
            let index = self.alloc(OutCmd::Node(cmd));
            self.bucket(prio).push_back(index);
        }

        self.count += 1;
    }

    /// Queues a fake command at the default priority.
    pub fn push_fake(&mut self, fake: FakeCmd) {
        let index = self.alloc(OutCmd::Fake(fake));
        self.bucket(DEFAULT_PRIORITY).push_back(index);
        self.count += 1;
    }

    /// Returns a NAK-ed command to the head of its original bucket so it is
    /// retransmitted before anything queued later at the same priority.
    pub fn push_node_head(&mut self, cmd: NodeCmd) {
        let prio = cmd.prio;
        let key = (prio, cmd.id, cmd.addr.clone());
        let coalesces = cmd.coalesces();

        let index = self.alloc(OutCmd::Node(cmd));
        if coalesces {
            self.by_addr.insert(key, index);
        }
        self.bucket(prio).push_front(index);
        self.count += 1;
    }

    /// Pops the next unit of work from one bucket under a byte budget.
    ///
    /// A fake command at the head is returned alone. A node command at the
    /// head gathers the longest groupable run that still fits the budget;
    /// when `compress` is false the run length is one. Returns None when
    /// the bucket is empty or its head does not fit; the head then stays
    /// queued for a later packet.
    pub fn pop(&mut self, prio: u8, budget: usize, compress: bool) -> Option<Popped> {
        let head_index = *self.buckets.get(&prio)?.front()?;

        if let Some(OutCmd::Fake(_)) = self.slots[head_index].cmd {
            let popped = self.take_front(prio);
            match popped {
                Some(OutCmd::Fake(fake)) => return Some(Popped::Fake(fake)),
                _ => unreachable!("Head slot changed under us"),
            }
        }

        // Measure the groupable run without removing anything.
        let mut measured: Vec<NodeCmd> = Vec::new();
        let mut share = 0u8;
        {
            let bucket = &self.buckets[&prio];
            let head = match &self.slots[head_index].cmd {
                Some(OutCmd::Node(cmd)) => cmd.clone(),
                _ => return None,
            };

            for &index in bucket.iter() {
                let cmd = match &self.slots[index].cmd {
                    Some(OutCmd::Node(cmd)) => cmd,
                    _ => break,
                };

                if !node::groupable(&head, cmd) {
                    break;
                }

                measured.push(cmd.clone());

                let candidate_share = if compress { node::shared_prefix(&measured) } else { 0 };

                if node::group_wire_len(&measured, candidate_share) > budget {
                    measured.pop();
                    break;
                }

                share = candidate_share;

                if !compress {
                    break;
                }
            }
        }

        if measured.is_empty() {
            return None;
        }

        for _ in 0..measured.len() {
            self.take_front(prio).expect("Measured run shorter than bucket");
        }

        Some(Popped::Group { cmds: measured, share })
    }

    fn take_front(&mut self, prio: u8) -> Option<OutCmd> {
        let index = self.buckets.get_mut(&prio)?.pop_front()?;
        let cmd = self.slots[index].cmd.take().expect("Queued slot must hold a command");
        self.free.push(index);
        self.count -= 1;

        if let OutCmd::Node(node_cmd) = &cmd {
            if node_cmd.coalesces() {
                let key = (prio, node_cmd.id, node_cmd.addr.clone());
                if self.by_addr.get(&key) == Some(&index) {
                    self.by_addr.remove(&key);
                }
            }
        }

        Some(cmd)
    }

    fn alloc(&mut self, cmd: OutCmd) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.slots[index].cmd = Some(cmd);
                index
            }
            None => {
                self.slots.push(Slot { cmd: Some(cmd) });
                self.slots.len() - 1
            }
        }
    }

    fn bucket(&mut self, prio: u8) -> &mut VecDeque<usize> {
        self.buckets.entry(prio).or_insert_with(VecDeque::new)
    }
}

/// The incoming queue: plain FIFO towards the embedding application.
pub struct InQueue {
    data: VecDeque<InCmd>,
}

impl InQueue {
    pub fn new() -> InQueue {
        InQueue { data: VecDeque::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn push(&mut self, cmd: InCmd) {
        self.data.push_back(cmd);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<InCmd> {
        self.data.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TerminateReason;

    fn cmd(id: u8, addr: &[u8], data: &[u8]) -> NodeCmd {
        NodeCmd::new(id, addr.to_vec(), data.to_vec())
    }

    #[test]
    fn test_fifo_within_bucket() {
        let mut queue = OutQueue::new();
        queue.push_node(cmd(40, &[1], &[1]));
        queue.push_node(cmd(40, &[2], &[2]));

        match queue.pop(DEFAULT_PRIORITY, 1024, false).unwrap() {
            Popped::Group { cmds, .. } => assert_eq!(cmds[0].addr, vec![1]),
            popped => panic!("Unexpected pop {:?}", popped),
        }
        match queue.pop(DEFAULT_PRIORITY, 1024, false).unwrap() {
            Popped::Group { cmds, .. } => assert_eq!(cmds[0].addr, vec![2]),
            popped => panic!("Unexpected pop {:?}", popped),
        }
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn test_address_dedup_replaces_in_place() {
        let mut queue = OutQueue::new();
        queue.push_node(cmd(40, &[7], &[1]));
        queue.push_node(cmd(40, &[8], &[2]));
        queue.push_node(cmd(40, &[7], &[3]));

        assert_eq!(queue.count(), 2);

        match queue.pop(DEFAULT_PRIORITY, 1024, false).unwrap() {
            Popped::Group { cmds, .. } => {
                assert_eq!(cmds[0].addr, vec![7]);
                assert_eq!(cmds[0].data, vec![3]);
            }
            popped => panic!("Unexpected pop {:?}", popped),
        }
    }

    #[test]
    fn test_empty_address_never_coalesces() {
        let mut queue = OutQueue::new();
        queue.push_node(cmd(40, &[], &[1]));
        queue.push_node(cmd(40, &[], &[2]));

        assert_eq!(queue.count(), 2);
    }

    #[test]
    fn test_pop_groups_consecutive_same_family() {
        let mut queue = OutQueue::new();
        queue.push_node(cmd(40, &[1, 1], &[1]));
        queue.push_node(cmd(40, &[1, 2], &[2]));
        queue.push_node(cmd(41, &[1, 3], &[3]));

        match queue.pop(DEFAULT_PRIORITY, 1024, true).unwrap() {
            Popped::Group { cmds, share } => {
                assert_eq!(cmds.len(), 2);
                assert_eq!(share, 1);
            }
            popped => panic!("Unexpected pop {:?}", popped),
        }

        // The different family stayed behind.
        assert_eq!(queue.count(), 1);
    }

    #[test]
    fn test_pop_respects_budget_and_keeps_head() {
        let mut queue = OutQueue::new();
        queue.push_node(cmd(40, &[1, 1], &[0; 64]));

        assert_eq!(queue.pop(DEFAULT_PRIORITY, 8, true), None);
        assert_eq!(queue.count(), 1);
    }

    #[test]
    fn test_pop_partial_group_under_budget() {
        let mut queue = OutQueue::new();
        for i in 0..8 {
            queue.push_node(cmd(40, &[9, i], &[i; 4]));
        }

        let first = cmd(40, &[9, 0], &[0; 4]);
        let two = vec![first.clone(), cmd(40, &[9, 1], &[1; 4])];
        let budget = node::group_wire_len(&two, 1);

        match queue.pop(DEFAULT_PRIORITY, budget, true).unwrap() {
            Popped::Group { cmds, .. } => assert_eq!(cmds.len(), 2),
            popped => panic!("Unexpected pop {:?}", popped),
        }
        assert_eq!(queue.count(), 6);
    }

    #[test]
    fn test_fake_pops_alone() {
        let mut queue = OutQueue::new();
        queue.push_fake(FakeCmd::ConnectTerminate { reason: TerminateReason::Server });
        queue.push_node(cmd(40, &[1], &[1]));

        match queue.pop(DEFAULT_PRIORITY, 1024, true).unwrap() {
            Popped::Fake(FakeCmd::ConnectTerminate { reason }) => {
                assert_eq!(reason, TerminateReason::Server)
            }
            popped => panic!("Unexpected pop {:?}", popped),
        }
        assert_eq!(queue.count(), 1);
    }

    #[test]
    fn test_push_head_goes_first() {
        let mut queue = OutQueue::new();
        queue.push_node(cmd(40, &[1], &[1]));
        queue.push_node_head(cmd(40, &[2], &[2]));

        match queue.pop(DEFAULT_PRIORITY, 1024, false).unwrap() {
            Popped::Group { cmds, .. } => assert_eq!(cmds[0].addr, vec![2]),
            popped => panic!("Unexpected pop {:?}", popped),
        }
    }

    #[test]
    fn test_prio_weights_and_sums() {
        let mut queue = OutQueue::new();
        queue.push_node(NodeCmd::with_priority(40, vec![1], vec![1], 144));
        queue.push_node(NodeCmd::with_priority(40, vec![2], vec![2], 128));
        queue.push_node(NodeCmd::with_priority(40, vec![3], vec![3], 112));

        assert_eq!(queue.max_prio(), Some(144));
        assert_eq!(queue.min_prio(), Some(112));

        assert!((prio_weight(144) - 2.0).abs() < 1e-6);
        assert!((prio_weight(128) - 1.0).abs() < 1e-6);
        assert!((prio_weight(112) - 0.5).abs() < 1e-6);

        assert!((queue.prio_sum_high() - 3.0).abs() < 1e-6);
        assert!((queue.prio_sum_low() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_in_queue_fifo() {
        let mut queue = InQueue::new();
        queue.push(InCmd::Node(cmd(40, &[1], &[1])));
        queue.push(InCmd::Fake(FakeCmd::ConnectAccept { user_id: 1, avatar_id: 2 }));

        match queue.pop().unwrap() {
            InCmd::Node(node_cmd) => assert_eq!(node_cmd.addr, vec![1]),
            popped => panic!("Unexpected pop {:?}", popped),
        }
        assert_eq!(queue.len(), 1);
    }
}
