//! The volume type map
//!
//! The controller publishes one line per cache-labeled node into a shared
//! config map; each node's driver reads its own line back to learn which
//! backing to construct. The encoding is a single text value:
//!
//! ```text
//! <node-name>,type=<kind>[,size=<quantity>][,disk=<disk-id>]
//! ```
//!
//! Lines are sorted, keys are emitted in fixed order, and reads tolerate
//! whitespace around separators. Duplicate nodes, unknown keys, and
//! malformed sizes are parse errors; recovery is the controller's business.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::quantity::Quantity;

/// Key in the shared config map holding the encoded mapping.
pub const VOLUME_TYPE_KEY: &str = "volume-types";

/// Node label selecting the cache kind.
pub const VOLUME_TYPE_LABEL: &str = "node-cache.gke.io";

/// Node label giving the cache size in MiB.
pub const SIZE_MIB_LABEL: &str = "node-cache-size-mib.gke.io";

/// Node label giving the topology zone.
pub const ZONE_LABEL: &str = "topology.gke.io/zone";

pub const TMPFS_VOLUME_TYPE: &str = "tmpfs";
pub const LSSD_VOLUME_TYPE: &str = "lssd";
pub const PD_VOLUME_TYPE: &str = "pd";

/// Cache settings for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeTypeInfo {
    pub volume_type: String,
    pub size: Option<Quantity>,
    pub disk: Option<String>,
}

/// Parse the mapping out of config map data. A missing `volume-types` key
/// is an error, not an empty map.
pub fn parse_mapping(data: &BTreeMap<String, String>) -> Result<BTreeMap<String, VolumeTypeInfo>> {
    let nodes = data.get(VOLUME_TYPE_KEY).ok_or(Error::MapKeyNotFound {
        key: VOLUME_TYPE_KEY.to_string(),
    })?;

    let mut mapping = BTreeMap::new();
    for line in nodes.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let items: Vec<&str> = line.split(',').collect();
        if items.len() < 2 {
            return Err(Error::MapParse(format!("bad line: {line}")));
        }

        let node = items[0].trim();
        if mapping.contains_key(node) {
            return Err(Error::MapParse(format!("node {node} duplicated: {line}")));
        }

        let mut info = VolumeTypeInfo::default();
        for &item in &items[1..] {
            let (key, value) = item.split_once('=').unwrap_or((item, ""));
            match key.trim() {
                "type" => info.volume_type = value.trim().to_string(),
                "size" => {
                    let size: Quantity = value
                        .trim()
                        .parse()
                        .map_err(|_| Error::MapParse(format!("bad size in line: {line}")))?;
                    info.size = Some(size);
                }
                "disk" => info.disk = Some(value.trim().to_string()),
                other => {
                    return Err(Error::MapParse(format!("bad key {other} in line: {line}")));
                }
            }
        }
        mapping.insert(node.to_string(), info);
    }
    Ok(mapping)
}

/// Encode the mapping to its canonical text: sorted lines, fixed key order,
/// no surrounding whitespace, absent optionals omitted.
pub fn encode_mapping(mapping: &BTreeMap<String, VolumeTypeInfo>) -> String {
    let mut lines = Vec::with_capacity(mapping.len());
    for (node, info) in mapping {
        let mut line = format!("{node},type={}", info.volume_type);
        if let Some(size) = &info.size {
            if !size.is_zero() {
                line.push_str(&format!(",size={size}"));
            }
        }
        if let Some(disk) = &info.disk {
            if !disk.is_empty() {
                line.push_str(&format!(",disk={disk}"));
            }
        }
        lines.push(line);
    }
    lines.sort();
    lines.join("\n")
}

/// Extract cache settings from a node's labels. Absence of the cache kind
/// label is a [`Error::LabelNotFound`], which callers treat as "not a cache
/// node" rather than a failure. The size label is an integer MiB count.
pub fn info_from_node_labels(
    node: &str,
    labels: &BTreeMap<String, String>,
) -> Result<VolumeTypeInfo> {
    let volume_type = labels.get(VOLUME_TYPE_LABEL).ok_or(Error::LabelNotFound {
        label: VOLUME_TYPE_LABEL.to_string(),
        node: node.to_string(),
    })?;

    let mut info = VolumeTypeInfo {
        volume_type: volume_type.clone(),
        ..Default::default()
    };
    if let Some(mib) = labels.get(SIZE_MIB_LABEL) {
        let mib: u64 = mib.parse().map_err(|_| {
            Error::QuantityParse(format!("bad MiB size {SIZE_MIB_LABEL}={mib} on {node}"))
        })?;
        info.size = Some(Quantity::from_mib(mib));
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(value: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(VOLUME_TYPE_KEY.to_string(), value.to_string())])
    }

    fn info(volume_type: &str, size: Option<&str>, disk: Option<&str>) -> VolumeTypeInfo {
        VolumeTypeInfo {
            volume_type: volume_type.to_string(),
            size: size.map(|s| s.parse().unwrap()),
            disk: disk.map(str::to_string),
        }
    }

    #[test]
    fn test_missing_key() {
        let bad = BTreeMap::from([("foo".to_string(), "node,type=bar".to_string())]);
        let err = parse_mapping(&bad).unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_parse_mapping() {
        struct Case {
            name: &'static str,
            input: &'static str,
            expected: Option<Vec<(&'static str, VolumeTypeInfo)>>,
        }
        let cases = [
            Case {
                name: "empty",
                input: "",
                expected: Some(vec![]),
            },
            Case {
                name: "empty space",
                input: " ",
                expected: Some(vec![]),
            },
            Case {
                name: "empty lines",
                input: " \n  \n \n\n  \n",
                expected: Some(vec![]),
            },
            Case {
                name: "one item",
                input: "node,type=foo",
                expected: Some(vec![("node", info("foo", None, None))]),
            },
            Case {
                name: "one item, spaces",
                input: "node, type = foo",
                expected: Some(vec![("node", info("foo", None, None))]),
            },
            Case {
                name: "one item, extra comma",
                input: "node, type = foo,",
                expected: None,
            },
            Case {
                name: "one item, size",
                input: "node, type=foo, size=10Mi",
                expected: Some(vec![("node", info("foo", Some("10Mi"), None))]),
            },
            Case {
                name: "one item, disk",
                input: "node,type=pd,size=10Gi,disk=foobar",
                expected: Some(vec![("node", info("pd", Some("10Gi"), Some("foobar")))]),
            },
            Case {
                name: "one item, bad param",
                input: "node, type=foo, unknown=yes",
                expected: None,
            },
            Case {
                name: "one item, bad size",
                input: "node, type=foo, size=ten",
                expected: None,
            },
            Case {
                name: "two items",
                input: "node-a, type=foo, size=10Mi\nnode-b, type=bar",
                expected: Some(vec![
                    ("node-a", info("foo", Some("10Mi"), None)),
                    ("node-b", info("bar", None, None)),
                ]),
            },
            Case {
                name: "two items, one bad",
                input: "node-b, unknown=true,node, type=foo, size=10Mi",
                expected: None,
            },
            Case {
                name: "repeated item",
                input: "node-a,type=A\nnode-b,type=B\nnode-a,type=C",
                expected: None,
            },
            Case {
                name: "two items, blank lines",
                input: "\nnode-a, type=foo, size=10Mi\n\nnode-b, type=bar\n\n",
                expected: Some(vec![
                    ("node-a", info("foo", Some("10Mi"), None)),
                    ("node-b", info("bar", None, None)),
                ]),
            },
        ];

        for case in cases {
            let result = parse_mapping(&data(case.input));
            match case.expected {
                Some(expected) => {
                    let expected: BTreeMap<String, VolumeTypeInfo> = expected
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v))
                        .collect();
                    assert_eq!(result.unwrap(), expected, "case {}", case.name);
                }
                None => assert!(result.is_err(), "case {} should fail", case.name),
            }
        }
    }

    #[test]
    fn test_encode_mapping() {
        let mapping = BTreeMap::from([
            ("a".to_string(), info("foo", None, None)),
            ("b".to_string(), info("bar", Some("10Mi"), None)),
            ("c".to_string(), info("pd", Some("10Gi"), Some("foobar"))),
        ]);
        assert_eq!(
            encode_mapping(&mapping),
            "a,type=foo\nb,type=bar,size=10Mi\nc,type=pd,size=10Gi,disk=foobar"
        );
    }

    #[test]
    fn test_round_trip() {
        let mapping = BTreeMap::from([
            ("node-a".to_string(), info("tmpfs", Some("128Mi"), None)),
            ("node-b".to_string(), info("lssd", None, None)),
            ("node-c".to_string(), info("pd", Some("50Gi"), Some("pv-x"))),
        ]);
        let parsed = parse_mapping(&data(&encode_mapping(&mapping))).unwrap();
        assert_eq!(parsed, mapping);
    }

    #[test]
    fn test_info_from_node_labels() {
        let err = info_from_node_labels("n", &BTreeMap::new()).unwrap_err();
        assert!(err.is_not_found());

        let labels = BTreeMap::from([("some-label".to_string(), "some value".to_string())]);
        assert!(info_from_node_labels("n", &labels).unwrap_err().is_not_found());

        let labels = BTreeMap::from([(VOLUME_TYPE_LABEL.to_string(), "foo".to_string())]);
        assert_eq!(
            info_from_node_labels("n", &labels).unwrap(),
            info("foo", None, None)
        );

        let labels = BTreeMap::from([
            (VOLUME_TYPE_LABEL.to_string(), "foo".to_string()),
            (SIZE_MIB_LABEL.to_string(), "10".to_string()),
        ]);
        assert_eq!(
            info_from_node_labels("n", &labels).unwrap(),
            info("foo", Some("10Mi"), None)
        );

        let labels = BTreeMap::from([
            (VOLUME_TYPE_LABEL.to_string(), "foo".to_string()),
            (SIZE_MIB_LABEL.to_string(), "ten".to_string()),
        ]);
        let err = info_from_node_labels("n", &labels).unwrap_err();
        assert!(err.to_string().contains("bad MiB size"));

        let labels = BTreeMap::from([(SIZE_MIB_LABEL.to_string(), "10".to_string())]);
        assert!(info_from_node_labels("n", &labels).unwrap_err().is_not_found());
    }
}
