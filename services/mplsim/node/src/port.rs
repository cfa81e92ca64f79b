//! Incoming port buffers.

use mplsim_topology::PortId;
use mplsim_wire::Packet;
use std::collections::VecDeque;

/// Bytes per megabyte of port buffer
const BYTES_PER_MB: u64 = 1024 * 1024;

/// Incoming queue of one port
#[derive(Debug)]
pub struct Port {
    queue: VecDeque<Packet>,
    used_bytes: u64,
    capacity_bytes: u64,
}

impl Port {
    /// Create a port with a buffer of `capacity_bytes`
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            used_bytes: 0,
            capacity_bytes,
        }
    }

    /// Queued packets
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Buffer occupancy in percent
    pub fn occupancy(&self) -> u32 {
        if self.capacity_bytes == 0 {
            return 100;
        }
        ((self.used_bytes * 100) / self.capacity_bytes).min(100) as u32
    }

    fn push(&mut self, packet: Packet) {
        self.used_bytes += packet.size() as u64;
        self.queue.push_back(packet);
    }

    fn take(&mut self, index: usize) -> Option<Packet> {
        let packet = self.queue.remove(index)?;
        self.used_bytes = self.used_bytes.saturating_sub(packet.size() as u64);
        Some(packet)
    }

    /// Position of the next packet to read
    fn next_index(&self, by_priority: bool) -> Option<usize> {
        if self.queue.is_empty() {
            return None;
        }
        if !by_priority {
            return Some(0);
        }
        // First packet of the highest priority keeps FIFO order within a level
        let mut best = 0;
        for (i, packet) in self.queue.iter().enumerate().skip(1) {
            if packet.priority() > self.queue[best].priority() {
                best = i;
            }
        }
        Some(best)
    }
}

/// All incoming ports of a node, read round-robin
#[derive(Debug)]
pub struct PortSet {
    ports: Vec<Port>,
    cursor: usize,
    by_priority: bool,
}

impl PortSet {
    /// Create `count` ports of `buffer_mb` megabytes each
    ///
    /// With `by_priority` set, each port serves its highest-GoS packet first.
    pub fn new(count: usize, buffer_mb: u64, by_priority: bool) -> Self {
        Self {
            ports: (0..count).map(|_| Port::new(buffer_mb * BYTES_PER_MB)).collect(),
            cursor: 0,
            by_priority,
        }
    }

    /// Change the buffer size of every port; queued packets are kept
    pub fn resize(&mut self, buffer_mb: u64) {
        for port in &mut self.ports {
            port.capacity_bytes = buffer_mb * BYTES_PER_MB;
        }
    }

    /// Number of ports
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Whether the node has no ports
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Port by index
    pub fn port(&self, port: PortId) -> Option<&Port> {
        self.ports.get(port)
    }

    /// Queue an arriving packet; the packet is handed back if the buffer is full
    pub fn enqueue(&mut self, port: PortId, packet: Packet) -> Result<(), Packet> {
        let Some(target) = self.ports.get_mut(port) else {
            return Err(packet);
        };
        if target.used_bytes + packet.size() as u64 > target.capacity_bytes {
            return Err(packet);
        }
        target.push(packet);
        Ok(())
    }

    /// Put a packet back at the end of its port, regardless of buffer space
    pub fn re_enqueue(&mut self, port: PortId, packet: Packet) {
        if let Some(target) = self.ports.get_mut(port) {
            target.push(packet);
        }
    }

    /// Take the next packet in round-robin order if it fits in `max_octets`
    ///
    /// The cursor only advances past a port when a packet is taken from it,
    /// so a packet too big for this tick is first in line on the next one.
    pub fn next_packet(&mut self, max_octets: u64) -> Option<(PortId, Packet)> {
        let count = self.ports.len();
        for step in 0..count {
            let port = (self.cursor + step) % count;
            let Some(index) = self.ports[port].next_index(self.by_priority) else {
                continue;
            };
            if self.ports[port].queue[index].size() as u64 > max_octets {
                return None;
            }
            let packet = self.ports[port].take(index)?;
            self.cursor = (port + 1) % count;
            return Some((port, packet));
        }
        None
    }

    /// Whether any port holds a packet
    pub fn has_pending(&self) -> bool {
        self.ports.iter().any(|p| !p.is_empty())
    }

    /// Packets queued over all ports
    pub fn pending(&self) -> usize {
        self.ports.iter().map(Port::len).sum()
    }

    /// Congestion: occupancy of the fullest port, in percent
    pub fn congestion(&self) -> u32 {
        self.ports.iter().map(Port::occupancy).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mplsim_wire::{Gos, Ipv4Header, Ipv4Packet};

    fn packet(id: u64, payload: usize, gos: u8) -> Packet {
        let header = Ipv4Header::new(id, "10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap())
            .with_gos(Gos::new(gos, false));
        Packet::from(Ipv4Packet::new(header, Bytes::from(vec![0u8; payload])))
    }

    fn id(packet: &Packet) -> u64 {
        packet.header().packet_id
    }

    #[test]
    fn test_round_robin() {
        let mut ports = PortSet::new(3, 1, false);
        ports.enqueue(0, packet(1, 0, 0)).unwrap();
        ports.enqueue(0, packet(2, 0, 0)).unwrap();
        ports.enqueue(2, packet(3, 0, 0)).unwrap();

        let order: Vec<(PortId, u64)> = std::iter::from_fn(|| ports.next_packet(u64::MAX))
            .map(|(port, p)| (port, id(&p)))
            .collect();
        assert_eq!(order, vec![(0, 1), (2, 3), (0, 2)]);
        assert!(!ports.has_pending());
    }

    #[test]
    fn test_budget_blocks_without_skipping() {
        let mut ports = PortSet::new(2, 1, false);
        ports.enqueue(0, packet(1, 980, 0)).unwrap();
        ports.enqueue(1, packet(2, 0, 0)).unwrap();

        assert!(ports.next_packet(100).is_none());
        assert_eq!(ports.pending(), 2);
        let (port, p) = ports.next_packet(1000).unwrap();
        assert_eq!((port, id(&p)), (0, 1));
    }

    #[test]
    fn test_overflow_and_congestion() {
        let mut ports = PortSet::new(1, 1, false);
        let half = (BYTES_PER_MB / 2) as usize - 20;
        ports.enqueue(0, packet(1, half, 0)).unwrap();
        assert_eq!(ports.congestion(), 50);
        ports.enqueue(0, packet(2, half, 0)).unwrap();
        assert!(ports.enqueue(0, packet(3, half, 0)).is_err());
        assert!(ports.enqueue(5, packet(4, 0, 0)).is_err());

        // Re-enqueue ignores the limit
        let (_, p) = ports.next_packet(u64::MAX).unwrap();
        ports.re_enqueue(0, p);
        ports.re_enqueue(0, packet(5, half, 0));
        assert_eq!(ports.pending(), 3);
        assert_eq!(ports.congestion(), 100);
    }

    #[test]
    fn test_priority_ports() {
        let mut ports = PortSet::new(1, 1, true);
        ports.enqueue(0, packet(1, 0, 0)).unwrap();
        ports.enqueue(0, packet(2, 0, 3)).unwrap();
        ports.enqueue(0, packet(3, 0, 1)).unwrap();
        ports.enqueue(0, packet(4, 0, 3)).unwrap();

        let order: Vec<u64> = std::iter::from_fn(|| ports.next_packet(u64::MAX))
            .map(|(_, p)| id(&p))
            .collect();
        assert_eq!(order, vec![2, 4, 3, 1]);
    }
}
