//! Bookkeeping around the resend mechanism: the compacted vector of ACK/NAK
//! commands to send back, and the history of sent payload packets with
//! handles to the commands still awaiting acknowledgement.

use crate::cmd::node::NodeCmd;
use crate::cmd::queue::OutQueue;
use crate::cmd::sys::SysCmd;
use hashbrown::HashMap;
use std::time::Instant;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AckNak {
    Ack,
    Nak,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AckNakEntry {
    pub kind: AckNak,
    pub pay_id: u32,
}

/// The compacted ACK/NAK vector. An ACK entry carries the highest id of its
/// run and grows as in-order packets arrive; a NAK entry carries the first
/// id of the lost range; the receiver of the vector reads each run as
/// spanning up to the next entry's id. The vector is total over received
/// payload ids from the last ANK+1 to last_r_pay.
pub struct AckNakHistory {
    entries: Vec<AckNakEntry>,
}

impl AckNakHistory {
    pub fn new() -> AckNakHistory {
        AckNakHistory { entries: Vec::new() }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn entries(&self) -> &[AckNakEntry] {
        &self.entries
    }

    /// Records an in-order received payload id.
    pub fn push_ack(&mut self, pay_id: u32) {
        if let Some(last) = self.entries.last_mut() {
            if last.kind == AckNak::Ack && last.pay_id.wrapping_add(1) == pay_id {
                last.pay_id = pay_id;
                return;
            }
        }

        self.entries.push(AckNakEntry { kind: AckNak::Ack, pay_id });
    }

    /// Records a detected loss starting at `first_missing`. The range is
    /// implicitly closed by the ACK entry that follows it.
    pub fn push_nak(&mut self, first_missing: u32) {
        self.entries.push(AckNakEntry {
            kind: AckNak::Nak,
            pay_id: first_missing,
        });
    }

    /// Drops every entry the peer no longer needs: the peer reported it has
    /// processed our acknowledgements up to and including `ank_id`.
    pub fn trim(&mut self, ank_id: u32) {
        self.entries.retain(|entry| entry.pay_id > ank_id);
    }

    /// The vector as system commands, oldest first.
    pub fn to_sys_cmds(&self, limit: usize) -> Vec<SysCmd> {
        self.entries
            .iter()
            .take(limit)
            .map(|entry| match entry.kind {
                AckNak::Ack => SysCmd::Ack { pay_id: entry.pay_id },
                AckNak::Nak => SysCmd::Nak { pay_id: entry.pay_id },
            })
            .collect()
    }
}

/// Stable handle into the sent-command arena. A handle goes dead when the
/// arena slot is reused or its address is overwritten by a later packet;
/// dead handles are simply skipped at retransmit time.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CmdHandle {
    index: u32,
    gen: u32,
}

struct ArenaSlot {
    gen: u32,
    cmd: Option<NodeCmd>,
}

/// Record of one payload packet awaiting ACK or NAK.
pub struct SentPacket {
    pub pay_id: u32,
    pub sent_at: Instant,
    /// Wire size, filled in once the packet went out.
    pub size: u32,
    cmds: Vec<CmdHandle>,
}

/// History of sent payload packets. Commands live in an arena keyed by
/// (family, address); sending a newer command for the same address empties
/// the older bucket, so a NAK for the older packet no longer retransmits
/// superseded data.
pub struct SentPacketHistory {
    slots: Vec<ArenaSlot>,
    free: Vec<u32>,
    by_addr: HashMap<(u8, Vec<u8>), u32>,
    packets: HashMap<u32, SentPacket>,
}

impl SentPacketHistory {
    pub fn new() -> SentPacketHistory {
        SentPacketHistory {
            slots: Vec::new(),
            free: Vec::new(),
            by_addr: HashMap::new(),
            packets: HashMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Opens a record for a freshly serialized payload packet.
    pub fn add_packet(&mut self, pay_id: u32, now: Instant) {
        let previous = self.packets.insert(
            pay_id,
            SentPacket {
                pay_id,
                sent_at: now,
                size: 0,
                cmds: Vec::new(),
            },
        );

        debug_assert!(previous.is_none(), "Payload id reused in history");
    }

    /// Records the wire size of a packet that reached the network.
    pub fn set_size(&mut self, pay_id: u32, size: u32) {
        if let Some(record) = self.packets.get_mut(&pay_id) {
            record.size = size;
        }
    }

    /// Attaches a packed command to the packet record. A same-address
    /// command already in the history is superseded: its bucket is emptied
    /// and any handle to it goes dead.
    pub fn add_cmd(&mut self, pay_id: u32, cmd: NodeCmd) {
        let key = (cmd.id, cmd.addr.clone());
        let coalesces = cmd.coalesces();

        if coalesces {
            if let Some(&old) = self.by_addr.get(&key) {
                self.kill(old);
            }
        }

        let index = self.alloc(cmd);

        if coalesces {
            self.by_addr.insert(key, index);
        }

        let handle = CmdHandle {
            index,
            gen: self.slots[index as usize].gen,
        };

        self.packets
            .get_mut(&pay_id)
            .expect("Command attached to unknown packet")
            .cmds
            .push(handle);
    }

    #[inline]
    pub fn find_packet(&self, pay_id: u32) -> Option<&SentPacket> {
        self.packets.get(&pay_id)
    }

    /// Drops an acknowledged packet; its surviving commands are destroyed.
    /// Returns the freed wire size.
    pub fn remove_acked(&mut self, pay_id: u32) -> u32 {
        match self.packets.remove(&pay_id) {
            Some(record) => {
                for handle in record.cmds {
                    if self.live(handle) {
                        self.remove_addr_entry(handle.index);
                        self.kill(handle.index);
                    }
                }
                record.size
            }
            None => 0,
        }
    }

    /// Drops a lost packet, returning every command not yet superseded to
    /// the head of its original priority bucket. Handles are walked in
    /// reverse so the re-queued commands keep their original order.
    /// Returns (commands re-queued, freed wire size).
    pub fn remove_naked(&mut self, pay_id: u32, out_queue: &mut OutQueue) -> (usize, u32) {
        let record = match self.packets.remove(&pay_id) {
            Some(record) => record,
            None => return (0, 0),
        };

        let mut requeued = 0;

        let size = record.size;

        for handle in record.cmds.into_iter().rev() {
            if self.live(handle) {
                self.remove_addr_entry(handle.index);
                let cmd = self.slots[handle.index as usize]
                    .cmd
                    .take()
                    .expect("Live handle must hold a command");
                self.kill(handle.index);
                out_queue.push_node_head(cmd);
                requeued += 1;
            }
        }

        (requeued, size)
    }

    #[inline]
    fn live(&self, handle: CmdHandle) -> bool {
        let slot = &self.slots[handle.index as usize];
        slot.gen == handle.gen && slot.cmd.is_some()
    }

    fn remove_addr_entry(&mut self, index: u32) {
        if let Some(cmd) = &self.slots[index as usize].cmd {
            if cmd.coalesces() {
                let key = (cmd.id, cmd.addr.clone());
                if self.by_addr.get(&key) == Some(&index) {
                    self.by_addr.remove(&key);
                }
            }
        }
    }

    /// Empties a slot; any handle still pointing at it goes dead.
    fn kill(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.cmd = None;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(index);
    }

    fn alloc(&mut self, cmd: NodeCmd) -> u32 {
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].cmd = Some(cmd);
                index
            }
            None => {
                self.slots.push(ArenaSlot { gen: 0, cmd: Some(cmd) });
                (self.slots.len() - 1) as u32
            }
        }
    }
}
