//! Packet header fields and value encoding.
//!
//! Every field has a fixed bit width. Human-readable values (addresses,
//! prefixes, protocol names, connection states) are turned into ternary
//! vectors of exactly that width.

use crate::error::Error;
use crate::types::PortId;
use crate::vector::{Bit, Vector};
use crate::Result;
use std::net::{Ipv4Addr, Ipv6Addr};

/* ---------------------------------------------------------------- *
 * Field widths (bits)
 * ---------------------------------------------------------------- */

pub const FIELD_SIZES: &[(&str, usize)] = &[
    ("packet.ether.source", 48),
    ("packet.ether.destination", 48),
    ("packet.ether.type", 8),
    ("packet.ether.vlan", 16),
    ("packet.ipv4.source", 32),
    ("packet.ipv4.destination", 32),
    ("packet.ipv6.source", 128),
    ("packet.ipv6.destination", 128),
    ("packet.ipv6.proto", 8),
    ("packet.ipv6.icmpv6.type", 16),
    ("packet.upper.dport", 16),
    ("packet.upper.sport", 16),
    ("packet.upper.tcp.flags", 8),
    ("module", 8),
    ("module.limit", 32),
    ("module.state", 8),
    ("module.ipv6header.header", 8),
    ("interface", 32),
    ("in_port", 32),
    ("out_port", 32),
    ("related", 8),
    ("module.rt", 8),
    ("module.ipv6header.rt.type", 8),
    ("module.ipv6header.rt.segsleft", 8),
    ("module.ipv6header.rt.len", 8),
    ("module.ipv6header.ah.spi", 32),
    ("module.ipv6header.ah.len", 8),
    ("module.ipv6header.ah.res", 16),
    ("module.ipv6header.dst.len", 8),
    ("module.ipv6header.frag.id", 32),
    ("module.ipv6header.hbh.len", 8),
    ("module.ipv6header.hl.eq", 8),
    ("module.ipv6header.hl.lt", 8),
    ("module.ipv6header.hl.gt", 8),
    ("module.ipv6header.mh.type", 8),
];

/// Fields whose values may name ports instead of carrying bits.
pub const PORT_FIELDS: &[&str] = &["interface", "in_port", "out_port"];

/// Width of `name` in bits, if the field is known.
pub fn field_width(name: &str) -> Option<usize> {
    FIELD_SIZES
        .iter()
        .find(|(field, _)| *field == name)
        .map(|(_, width)| *width)
}

pub fn is_port_field(name: &str) -> bool {
    PORT_FIELDS.contains(&name)
}

/* ---------------------------------------------------------------- *
 * Value encoding
 * ---------------------------------------------------------------- */

/// Encode a field value into a vector of the field's width.
///
/// Accepted forms, in order: a ternary string of exactly the field width,
/// a decimal integer, then a field-specific notation (IP prefixes, MAC
/// addresses, protocol, module, state and ICMPv6 type names, rate limits).
pub fn encode_value(name: &str, value: &str) -> Result<Vector> {
    let width = field_width(name).ok_or_else(|| Error::UnknownField(name.to_string()))?;
    let value = value.trim();

    if value.len() == width && value.chars().all(|c| Bit::from_char(c).is_some()) {
        return value.parse();
    }

    if let Ok(number) = value.parse::<u128>() {
        return binary(name, value, number, width);
    }

    let invalid = || Error::invalid_value(name, value);

    match name {
        "packet.ipv4.source" | "packet.ipv4.destination" => {
            let (addr, prefix) = split_prefix(value, 32).ok_or_else(invalid)?;
            let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
            Ok(prefix_vector(u32::from(addr) as u128, 32, prefix))
        }
        "packet.ipv6.source" | "packet.ipv6.destination" => {
            let (addr, prefix) = split_prefix(value, 128).ok_or_else(invalid)?;
            let addr: Ipv6Addr = addr.parse().map_err(|_| invalid())?;
            Ok(prefix_vector(u128::from(addr), 128, prefix))
        }
        "packet.ether.source" | "packet.ether.destination" => {
            let octets = value
                .split(':')
                .map(|octet| u8::from_str_radix(octet, 16))
                .collect::<std::result::Result<Vec<u8>, _>>()
                .map_err(|_| invalid())?;
            if octets.len() != 6 {
                return Err(invalid());
            }
            let mac = octets.iter().fold(0u128, |acc, b| (acc << 8) | *b as u128);
            binary(name, value, mac, width)
        }
        "packet.ipv6.proto" => match value {
            "icmpv6" => binary(name, value, 58, width),
            "tcp" => binary(name, value, 6, width),
            "udp" => binary(name, value, 17, width),
            _ => Err(invalid()),
        },
        "module.ipv6header.header" => match value {
            "hop" | "hop-by-hop" => binary(name, value, 0, width),
            "ipv6-route" | "route" => binary(name, value, 43, width),
            "frag" => binary(name, value, 44, width),
            "esp" => binary(name, value, 50, width),
            "auth" => binary(name, value, 51, width),
            "dst" => binary(name, value, 60, width),
            _ => Err(invalid()),
        },
        "module" => module_value(value).ok_or_else(invalid),
        "module.state" => {
            let mut bitmap = 0u128;
            for state in value.split(',') {
                bitmap |= match state.trim() {
                    "NEW" => 1,
                    "RELATED" => 2,
                    "ESTABLISHED" => 4,
                    "INVALID" => 8,
                    _ => return Err(invalid()),
                };
            }
            binary(name, value, bitmap, width)
        }
        "module.limit" => {
            let (rate, unit) = value.split_once('/').ok_or_else(invalid)?;
            let factor = match unit {
                "sec" | "second" => 1,
                "min" | "minute" => 60,
                "hour" => 3600,
                "day" => 86400,
                _ => return Err(invalid()),
            };
            let rate: u128 = rate.parse().map_err(|_| invalid())?;
            let scaled = rate.checked_mul(factor).ok_or_else(invalid)?;
            binary(name, value, scaled, width)
        }
        "packet.ipv6.icmpv6.type" => icmpv6_type_value(value).ok_or_else(invalid),
        "interface" | "in_port" | "out_port" if value == "lo" => Ok(Vector::filled(width, Bit::Zero)),
        _ => Err(invalid()),
    }
}

/// Encode a resolved global port ID for a port field.
pub fn encode_port(name: &str, port: PortId) -> Result<Vector> {
    let width = field_width(name).ok_or_else(|| Error::UnknownField(name.to_string()))?;
    binary(name, &port.0.to_string(), port.0 as u128, width)
}

/// Whether `value` for a port field names a port rather than carrying bits.
pub fn is_port_name(name: &str, value: &str) -> bool {
    is_port_field(name) && value != "lo" && encode_value(name, value).is_err()
}

/* ---------------------------------------------------------------- *
 * Helpers
 * ---------------------------------------------------------------- */

fn binary(name: &str, raw: &str, value: u128, width: usize) -> Result<Vector> {
    if width < 128 && value >> width != 0 {
        return Err(Error::invalid_value(name, raw));
    }
    let bits = (0..width)
        .rev()
        .map(|i| if value >> i & 1 == 1 { Bit::One } else { Bit::Zero })
        .collect();
    Ok(Vector::from_bits(bits))
}

fn split_prefix(value: &str, max: usize) -> Option<(&str, usize)> {
    match value.split_once('/') {
        Some((addr, prefix)) => {
            let prefix: usize = prefix.parse().ok()?;
            (prefix <= max).then_some((addr, prefix))
        }
        None => Some((value, max)),
    }
}

fn prefix_vector(addr: u128, width: usize, prefix: usize) -> Vector {
    let bits = (0..width)
        .map(|i| {
            if i >= prefix {
                Bit::Any
            } else if addr >> (width - 1 - i) & 1 == 1 {
                Bit::One
            } else {
                Bit::Zero
            }
        })
        .collect();
    Vector::from_bits(bits)
}

fn module_value(value: &str) -> Option<Vector> {
    let bits = match value {
        "ipv6header" => "00000001",
        "limit" => "00000010",
        "state" => "00000011",
        "rt" => "00000100",
        "ah" => "00000101",
        "dst" => "00000110",
        "eui64" => "00000111",
        "frag" => "00001000",
        "hbh" => "00001001",
        "hl" => "00001010",
        "icmpv6" => "00001011",
        "mh" => "00001100",
        "tos" => "00001101",
        "tcp" | "udp" => "xxxxxxxx",
        _ => return None,
    };
    bits.parse().ok()
}

fn icmpv6_type_value(value: &str) -> Option<Vector> {
    let bits = match value {
        "destination-unreachable" => "00000001xxxxxxxx",
        "packet-too-big" => "00000010xxxxxxxx",
        "time-exceeded" => "00000011xxxxxxxx",
        "parameter-problem" => "00000100xxxxxxxx",
        "echo-request" => "10000000xxxxxxxx",
        "echo-reply" => "10000001xxxxxxxx",
        "neighbour-solicitation" | "neighbor-solicitation" => "10000111xxxxxxxx",
        "neighbour-advertisement" | "neighbor-advertisement" => "10001000xxxxxxxx",
        "ttl-zero-during-transit" => "0000001100000000",
        "unknown-header-type" => "0000010000000001",
        "unknown-option" => "0000010000000010",
        _ => return None,
    };
    bits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_widths() {
        assert_eq!(field_width("packet.ipv6.destination"), Some(128));
        assert_eq!(field_width("packet.upper.dport"), Some(16));
        assert_eq!(field_width("in_port"), Some(32));
        assert_eq!(field_width("packet.ipv7.source"), None);
        assert!(is_port_field("out_port"));
        assert!(!is_port_field("packet.upper.dport"));
    }

    #[test]
    fn test_ipv6_prefix() {
        let host = encode_value("packet.ipv6.destination", "2001:db8::1/128").unwrap();
        assert_eq!(host.len(), 128);
        assert!(host.to_string().starts_with("0010000000000001"));
        assert!(host.to_string().ends_with("01"));
        assert!(!host.to_string().contains('x'));

        let net = encode_value("packet.ipv6.source", "2001:db8::/32").unwrap();
        assert_eq!(&net.to_string()[..32], "00100000000000010000110110111000");
        assert_eq!(&net.to_string()[32..], "x".repeat(96));
    }

    #[test]
    fn test_ipv4_prefix() {
        let net = encode_value("packet.ipv4.source", "10.0.0.0/8").unwrap();
        assert_eq!(net.to_string(), format!("00001010{}", "x".repeat(24)));
    }

    #[test]
    fn test_integers_and_names() {
        let dport = encode_value("packet.upper.dport", "80").unwrap();
        assert_eq!(dport.to_string(), "0000000001010000");

        let proto = encode_value("packet.ipv6.proto", "tcp").unwrap();
        assert_eq!(proto.to_string(), "00000110");

        let state = encode_value("module.state", "RELATED,ESTABLISHED").unwrap();
        assert_eq!(state.to_string(), "00000110");

        let limit = encode_value("module.limit", "2/min").unwrap();
        assert_eq!(limit.to_string(), format!("{:032b}", 120));

        let icmp = encode_value("packet.ipv6.icmpv6.type", "echo-request").unwrap();
        assert_eq!(icmp.to_string(), "10000000xxxxxxxx");
    }

    #[test]
    fn test_ternary_string_passthrough() {
        let v = encode_value("packet.ipv6.proto", "0000011x").unwrap();
        assert_eq!(v.to_string(), "0000011x");
    }

    #[test]
    fn test_invalid_values() {
        // Too large for 16 bits
        assert!(matches!(
            encode_value("packet.upper.dport", "70000"),
            Err(Error::InvalidValue { .. })
        ));
        assert!(matches!(
            encode_value("packet.ipv6.proto", "sctp"),
            Err(Error::InvalidValue { .. })
        ));
        assert!(matches!(
            encode_value("packet.ipv7.source", "1"),
            Err(Error::UnknownField(_))
        ));
    }

    #[test]
    fn test_limit_overflow_is_rejected() {
        let huge = format!("{}/day", u128::MAX);
        assert!(matches!(
            encode_value("module.limit", &huge),
            Err(Error::InvalidValue { .. })
        ));
        // Fits u128 but not the 32-bit field
        assert!(matches!(
            encode_value("module.limit", "100000/day"),
            Err(Error::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_port_values() {
        assert!(is_port_name("in_port", "fw.1_ingress"));
        assert!(!is_port_name("in_port", "7"));
        assert!(!is_port_name("packet.upper.dport", "fw.1"));

        let port = encode_port("out_port", PortId(0x20003)).unwrap();
        assert_eq!(port.to_string(), format!("{:032b}", 0x20003));
    }
}
