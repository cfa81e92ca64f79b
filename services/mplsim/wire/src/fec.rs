//! Forwarding Equivalence Class classification.
//!
//! FECs are keyed by the (source, destination) address pair. The hash must be
//! stable across runs and platforms, so a fixed FNV-1a over the dotted-quad
//! strings is used rather than any std hasher.

use std::net::Ipv4Addr;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over a byte slice
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// FEC of an IPv4 packet: hash of the concatenated source and destination strings
pub fn classify(source: Ipv4Addr, destination: Ipv4Addr) -> u32 {
    let key = format!("{}{}", source, destination);
    fnv1a_32(key.as_bytes())
}

/// Flow identifier used by GPSRP and the frame cache
pub fn flow_id(source: Ipv4Addr) -> u32 {
    fnv1a_32(source.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let src: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let dst: Ipv4Addr = "10.0.0.9".parse().unwrap();
        assert_eq!(classify(src, dst), classify(src, dst));
        assert_eq!(classify(src, dst), fnv1a_32(b"10.0.0.110.0.0.9"));
    }

    #[test]
    fn test_classification_is_directional() {
        let a: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let b: Ipv4Addr = "10.0.0.2".parse().unwrap();
        assert_ne!(classify(a, b), classify(b, a));
    }
}
