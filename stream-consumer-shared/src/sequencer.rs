//! Per-key ordering: typing a raw sequence-number value, comparing
//! same-key values, and linking same-key messages into doubly-linked
//! chains so the task engine processes each key's messages in order
//! while distinct keys progress independently.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;

use serde_json::Value;
use tracing::warn;

use crate::error::{CoreError, Result};

/// The concrete shape a sequence number normalized to. Two values can only
/// be compared when they normalized to the same kind.
#[derive(Debug, Clone, PartialEq)]
pub enum SortKind {
    Numeric(f64),
    Lexical(String),
}

impl SortKind {
    /// Types a raw JSON seq-no value. Numbers and numeric strings normalize
    /// to `Numeric`; anything else that is a string normalizes to
    /// `Lexical`. This is the only place a value's kind is decided —
    /// mismatches between two values destined for the same key surface
    /// here (see [`compare`]), not later during an otherwise-silent
    /// comparison.
    pub fn normalize(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_f64()
                .map(SortKind::Numeric)
                .ok_or_else(|| CoreError::fatal("sequence number is not representable as f64")),
            Value::String(s) => {
                if let Ok(n) = s.parse::<f64>() {
                    Ok(SortKind::Numeric(n))
                } else {
                    Ok(SortKind::Lexical(s.clone()))
                }
            }
            other => Err(CoreError::fatal(format!(
                "unsupported sequence number value: {other}"
            ))),
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            SortKind::Numeric(_) => "numeric",
            SortKind::Lexical(_) => "lexical",
        }
    }
}

/// Compares two normalized sort keys at a single ordinal position. Returns
/// a fatal error on a kind mismatch — the mismatch is only ever discovered
/// when two values sharing a key are actually compared, so that is where
/// it is reported, rather than silently coercing one kind into the other.
pub fn compare_kind(a: &SortKind, b: &SortKind) -> Result<Ordering> {
    match (a, b) {
        (SortKind::Numeric(x), SortKind::Numeric(y)) => {
            Ok(x.partial_cmp(y).unwrap_or(Ordering::Equal))
        }
        (SortKind::Lexical(x), SortKind::Lexical(y)) => Ok(x.cmp(y)),
        (x, y) => Err(CoreError::fatal(format!(
            "sort-kind mismatch within the same key: {} vs {}",
            x.tag(),
            y.tag()
        ))),
    }
}

/// One named, sortable part of a message's sequence number, at a specific
/// ordinal position within its `seqNos` list.
#[derive(Debug, Clone)]
pub struct SortPart {
    pub name: String,
    pub kind: SortKind,
}

/// Compares two messages' full sequence-number part lists ordinal by
/// ordinal: a part-key name mismatch at the same position breaks the tie
/// by name (and is logged, since it usually means the two messages were
/// resolved against inconsistent seqNo configuration); at a matching
/// part-key, a sort-kind mismatch is a hard failure; otherwise the
/// sortable values are compared directly. A message that runs out of
/// parts before the other sorts after it (fewer parts = later).
pub fn compare(a: &[SortPart], b: &[SortPart]) -> Result<Ordering> {
    for (pa, pb) in a.iter().zip(b.iter()) {
        if pa.name != pb.name {
            warn!(
                a = %pa.name,
                b = %pb.name,
                "sequence number part-key mismatch at the same ordinal, breaking the tie by name"
            );
            return Ok(pa.name.cmp(&pb.name));
        }
        match compare_kind(&pa.kind, &pb.kind)? {
            Ordering::Equal => continue,
            other => return Ok(other),
        }
    }
    Ok(b.len().cmp(&a.len()))
}

/// One item to be placed into a per-key chain. `parts` is the message's
/// `seqNos` list, already normalized into sortables in ordinal order.
#[derive(Debug, Clone)]
pub struct SequenceItem<T> {
    pub id: T,
    pub key: String,
    pub parts: Vec<SortPart>,
}

/// The result of linking a batch's messages into per-key chains: `prev`/
/// `next` edges (by id) plus the ordered list of chain heads, which is
/// exactly `firstMessagesToProcess`.
#[derive(Debug, Clone, Default)]
pub struct LinkedChains<T> {
    pub prev: HashMap<T, T>,
    pub next: HashMap<T, T>,
    pub heads: Vec<T>,
}

/// Groups items by key (preserving first-seen key order), sorts each
/// group by its `SortKind`, and links consecutive items within a group.
/// Distinct keys never link to each other — each key's chain is
/// independent, which is what lets distinct-key messages progress
/// concurrently while same-key messages stay strictly ordered.
pub fn link_chains<T: Eq + Hash + Clone>(items: Vec<SequenceItem<T>>) -> Result<LinkedChains<T>> {
    let mut key_order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<SequenceItem<T>>> = HashMap::new();
    for item in items {
        groups
            .entry(item.key.clone())
            .or_insert_with(|| {
                key_order.push(item.key.clone());
                Vec::new()
            })
            .push(item);
    }

    let mut result = LinkedChains::default();
    for key in key_order {
        let mut group = groups.remove(&key).expect("key present from grouping pass");
        sort_group(&mut group)?;
        if let Some(head) = group.first() {
            result.heads.push(head.id.clone());
        }
        for pair in group.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            result.next.insert(a.id.clone(), b.id.clone());
            result.prev.insert(b.id.clone(), a.id.clone());
        }
    }
    Ok(result)
}

fn sort_group<T: Clone>(group: &mut [SequenceItem<T>]) -> Result<()> {
    // insertion sort: small groups in practice (messages sharing one key
    // within a single invocation's batch), and it lets us bail with a
    // precise error on the first kind mismatch rather than panicking out
    // of an unstable sort comparator.
    for i in 1..group.len() {
        let mut j = i;
        while j > 0 && compare(&group[j - 1].parts, &group[j].parts)? == Ordering::Greater {
            group.swap(j - 1, j);
            j -= 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: u32, key: &str, seq: i64) -> SequenceItem<u32> {
        SequenceItem {
            id,
            key: key.to_string(),
            parts: vec![SortPart {
                name: "eventSeqNo".to_string(),
                kind: SortKind::Numeric(seq as f64),
            }],
        }
    }

    #[test]
    fn same_key_messages_link_in_ascending_order_regardless_of_arrival_order() {
        let items = vec![item(1, "k1", 3), item(2, "k1", 1), item(3, "k1", 2)];
        let chains = link_chains(items).unwrap();
        assert_eq!(chains.heads, vec![2]);
        assert_eq!(chains.next.get(&2), Some(&3));
        assert_eq!(chains.next.get(&3), Some(&1));
        assert_eq!(chains.prev.get(&1), Some(&3));
    }

    #[test]
    fn distinct_keys_form_independent_chains() {
        let items = vec![item(1, "a", 1), item(2, "b", 1), item(3, "a", 2)];
        let chains = link_chains(items).unwrap();
        assert_eq!(chains.heads, vec![1, 2]);
        assert_eq!(chains.next.get(&1), Some(&3));
        assert!(!chains.next.contains_key(&2));
    }

    #[test]
    fn mismatched_sort_kinds_within_a_key_fail() {
        let items = vec![
            SequenceItem {
                id: 1u32,
                key: "k".into(),
                parts: vec![SortPart {
                    name: "eventSeqNo".into(),
                    kind: SortKind::Numeric(1.0),
                }],
            },
            SequenceItem {
                id: 2u32,
                key: "k".into(),
                parts: vec![SortPart {
                    name: "eventSeqNo".into(),
                    kind: SortKind::Lexical("z".into()),
                }],
            },
        ];
        let err = link_chains(items).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn multi_part_seq_nos_compare_ordinal_by_ordinal() {
        let multi = |id: u32, major: i64, minor: i64| SequenceItem {
            id,
            key: "k".to_string(),
            parts: vec![
                SortPart {
                    name: "eventSeqNo".into(),
                    kind: SortKind::Numeric(major as f64),
                },
                SortPart {
                    name: "eventSubSeqNo".into(),
                    kind: SortKind::Numeric(minor as f64),
                },
            ],
        };
        // Same major ordinal, tie-broken by the second part.
        let items = vec![multi(1, 5, 2), multi(2, 5, 1), multi(3, 4, 9)];
        let chains = link_chains(items).unwrap();
        assert_eq!(chains.heads, vec![3]);
        assert_eq!(chains.next.get(&3), Some(&2));
        assert_eq!(chains.next.get(&2), Some(&1));
    }

    #[test]
    fn fewer_parts_sorts_after_more_parts() {
        let short = SequenceItem {
            id: 1u32,
            key: "k".into(),
            parts: vec![SortPart {
                name: "eventSeqNo".into(),
                kind: SortKind::Numeric(5.0),
            }],
        };
        let long = SequenceItem {
            id: 2u32,
            key: "k".into(),
            parts: vec![
                SortPart {
                    name: "eventSeqNo".into(),
                    kind: SortKind::Numeric(5.0),
                },
                SortPart {
                    name: "eventSubSeqNo".into(),
                    kind: SortKind::Numeric(0.0),
                },
            ],
        };
        let chains = link_chains(vec![short, long]).unwrap();
        // The longer part list (id 2) sorts first; the shorter (id 1) after it.
        assert_eq!(chains.heads, vec![2]);
        assert_eq!(chains.next.get(&2), Some(&1));
    }
}
