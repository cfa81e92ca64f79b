//! Next-hop computation: Floyd-Warshall over delays and RABAN over load.

use super::{Topology, INFINITE_WEIGHT};
use std::net::Ipv4Addr;
use tracing::debug;

/// Edge cost family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Weighting {
    Delay,
    Load,
}

/// Adjacency costs plus intermediate-node matrix after relaxation
struct AllPairs {
    cost: Vec<Vec<u64>>,
    via: Vec<Vec<Option<usize>>>,
}

impl AllPairs {
    /// First hop of the shortest path `origin -> destination`
    fn first_hop(&self, origin: usize, destination: usize) -> Option<usize> {
        if origin == destination || self.cost[origin][destination] == INFINITE_WEIGHT {
            return None;
        }
        let mut hop = destination;
        // Bounded walk; strictly positive weights make the chain finite
        for _ in 0..self.cost.len() {
            match self.via[origin][hop] {
                Some(intermediate) => hop = intermediate,
                None => return Some(hop),
            }
        }
        None
    }
}

impl Topology {
    /// Next hop on the minimum-delay path (Floyd-Warshall)
    pub fn next_hop_delay_based(&self, origin: Ipv4Addr, destination: Ipv4Addr) -> Option<Ipv4Addr> {
        let _guard = self.floyd_lock.lock();
        self.next_hop(Weighting::Delay, origin, destination, None)
    }

    /// Next hop on the least-loaded path (RABAN)
    pub fn next_hop_load_based(&self, origin: Ipv4Addr, destination: Ipv4Addr) -> Option<Ipv4Addr> {
        let _guard = self.raban_lock.lock();
        self.next_hop(Weighting::Load, origin, destination, None)
    }

    /// Next hop on the least-loaded path that does not leave `origin` toward `avoid`
    ///
    /// Used to place backup LSPs away from the primary next hop.
    pub fn next_hop_load_based_avoiding(
        &self,
        origin: Ipv4Addr,
        destination: Ipv4Addr,
        avoid: Ipv4Addr,
    ) -> Option<Ipv4Addr> {
        let _guard = self.raban_lock.lock();
        self.next_hop(Weighting::Load, origin, destination, Some(avoid))
    }

    fn next_hop(
        &self,
        weighting: Weighting,
        origin: Ipv4Addr,
        destination: Ipv4Addr,
        avoid: Option<Ipv4Addr>,
    ) -> Option<Ipv4Addr> {
        let o = self.index_of(origin)?;
        let d = self.index_of(destination)?;

        let mut cost = self.adjacency(weighting);
        if let Some(a) = avoid.and_then(|a| self.index_of(a)) {
            cost[o][a] = INFINITE_WEIGHT;
            cost[a][o] = INFINITE_WEIGHT;
        }

        let all_pairs = self.relax(cost);
        let hop = all_pairs.first_hop(o, d).map(|i| self.nodes[i].address);
        debug!(
            "{:?} next hop from {} to {}{}: {:?}",
            weighting,
            origin,
            destination,
            avoid.map(|a| format!(" avoiding {}", a)).unwrap_or_default(),
            hop
        );
        hop
    }

    /// Adjacency matrix for one weighting; broken links and absent edges are infinite
    fn adjacency(&self, weighting: Weighting) -> Vec<Vec<u64>> {
        let n = self.nodes.len();
        let mut cost = vec![vec![INFINITE_WEIGHT; n]; n];
        for (i, row) in cost.iter_mut().enumerate() {
            row[i] = 0;
        }

        for link in &self.links {
            if link.is_broken() {
                continue;
            }
            let (Some(i), Some(j)) = (
                self.nodes.iter().position(|n| n.id == link.ends[0].node),
                self.nodes.iter().position(|n| n.id == link.ends[1].node),
            ) else {
                continue;
            };

            let weight = match weighting {
                Weighting::Delay => link.weight(),
                Weighting::Load => {
                    link.raban_weight(self.nodes[i].routing_weight(), self.nodes[j].routing_weight())
                }
            };
            // Parallel links: keep the cheapest
            cost[i][j] = cost[i][j].min(weight);
            cost[j][i] = cost[j][i].min(weight);
        }
        cost
    }

    /// Floyd-Warshall relaxation; traffic endpoints never act as transit
    fn relax(&self, mut cost: Vec<Vec<u64>>) -> AllPairs {
        let n = cost.len();
        let mut via = vec![vec![None; n]; n];

        for k in 0..n {
            if !self.nodes[k].role.is_router() {
                continue;
            }
            for i in 0..n {
                let to_k = cost[i][k];
                if to_k == INFINITE_WEIGHT {
                    continue;
                }
                for j in 0..n {
                    let through = to_k.saturating_add(cost[k][j]);
                    if through < cost[i][j] {
                        cost[i][j] = through;
                        via[i][j] = Some(k);
                    }
                }
            }
        }

        AllPairs { cost, via }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{addr, end};
    use super::*;
    use crate::link::LinkKind;
    use crate::node::NodeRole;

    /// ```text
    ///        b (lsr)
    ///      /   \
    ///  a (ler)   d (ler)
    ///      \   /
    ///        c (lsr)
    /// ```
    /// a-b-d costs 20, a-c-d costs 40.
    fn diamond() -> Topology {
        let mut topology = Topology::new();
        let a = topology.add_node("a", addr(1), NodeRole::EdgeRouter, 2).unwrap();
        let b = topology.add_node("b", addr(2), NodeRole::LabelSwitchRouter, 2).unwrap();
        let c = topology.add_node("c", addr(3), NodeRole::LabelSwitchRouter, 2).unwrap();
        let d = topology.add_node("d", addr(4), NodeRole::EdgeRouter, 2).unwrap();
        topology.add_link("a-b", LinkKind::Internal, 10, end(a, 0), end(b, 0)).unwrap();
        topology.add_link("b-d", LinkKind::Internal, 10, end(b, 1), end(d, 0)).unwrap();
        topology.add_link("a-c", LinkKind::Internal, 20, end(a, 1), end(c, 0)).unwrap();
        topology.add_link("c-d", LinkKind::Internal, 20, end(c, 1), end(d, 1)).unwrap();
        topology
    }

    #[test]
    fn test_delay_based_next_hop() {
        let topology = diamond();
        assert_eq!(topology.next_hop_delay_based(addr(1), addr(4)), Some(addr(2)));
        assert_eq!(topology.next_hop_delay_based(addr(4), addr(1)), Some(addr(2)));
        // Direct neighbour
        assert_eq!(topology.next_hop_delay_based(addr(1), addr(3)), Some(addr(3)));
        assert_eq!(topology.next_hop_delay_based(addr(1), addr(1)), None);
        assert_eq!(topology.next_hop_delay_based(addr(1), addr(99)), None);
    }

    #[test]
    fn test_routing_after_link_flips() {
        let topology = diamond();
        let ab = topology.link_by_name("a-b").unwrap().id;

        topology.set_link_broken(ab, true).unwrap();
        assert_eq!(topology.next_hop_delay_based(addr(1), addr(4)), Some(addr(3)));
        assert_eq!(topology.next_hop_load_based(addr(1), addr(4)), Some(addr(3)));
        assert_eq!(topology.next_hop_delay_based(addr(2), addr(1)), Some(addr(4)));

        topology.set_link_broken(ab, false).unwrap();
        assert_eq!(topology.next_hop_delay_based(addr(1), addr(4)), Some(addr(2)));

        let cd = topology.link_by_name("c-d").unwrap().id;
        topology.set_link_broken(ab, true).unwrap();
        topology.set_link_broken(cd, true).unwrap();
        assert_eq!(topology.next_hop_delay_based(addr(1), addr(4)), None);
        assert_eq!(topology.next_hop_load_based(addr(1), addr(4)), None);
    }

    #[test]
    fn test_load_based_prefers_idle_path() {
        let topology = diamond();
        assert_eq!(topology.next_hop_load_based(addr(1), addr(4)), Some(addr(2)));

        // b is heavily loaded: 0.7 * 100 + 0.3 * 10 * 40 = 190 units
        topology.node_by_address(addr(2)).unwrap().publish_routing_weight(100, 40);
        assert_eq!(topology.next_hop_load_based(addr(1), addr(4)), Some(addr(3)));
        // Delay routing ignores load
        assert_eq!(topology.next_hop_delay_based(addr(1), addr(4)), Some(addr(2)));
    }

    #[test]
    fn test_avoidance_guarantee() {
        let topology = diamond();
        for avoid in [addr(2), addr(3)] {
            let hop = topology.next_hop_load_based_avoiding(addr(1), addr(4), avoid);
            assert!(hop.is_some());
            assert_ne!(hop, Some(avoid));
        }

        // Avoiding the only remaining neighbour leaves no path
        let ac = topology.link_by_name("a-c").unwrap().id;
        topology.set_link_broken(ac, true).unwrap();
        assert_eq!(topology.next_hop_load_based_avoiding(addr(1), addr(4), addr(2)), None);
    }

    #[test]
    fn test_endpoints_are_not_transit() {
        let mut topology = Topology::new();
        let src = topology.add_node("src", addr(1), NodeRole::Sender, 1).unwrap();
        let ler = topology.add_node("ler", addr(2), NodeRole::EdgeRouter, 2).unwrap();
        let dst = topology.add_node("dst", addr(3), NodeRole::Receiver, 1).unwrap();
        topology.add_link("src-ler", LinkKind::External, 10, end(src, 0), end(ler, 0)).unwrap();
        topology.add_link("ler-dst", LinkKind::External, 10, end(ler, 1), end(dst, 0)).unwrap();

        assert_eq!(topology.next_hop_delay_based(addr(1), addr(3)), Some(addr(2)));
        assert_eq!(topology.next_hop_delay_based(addr(2), addr(3)), Some(addr(3)));
    }
}
