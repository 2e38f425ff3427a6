#![forbid(unsafe_code)]
//! Order-preserving key encoding and the shared key-value keyspace layout.

use crate::types::{Result, TramaError, Value};

pub mod ord {
    //! Order-preserving encoders for scalar key components.
    //!
    //! Byte order of the encoded form equals the total order of [`Value`],
    //! including the cross-type rank, so range scans over encoded sort keys
    //! iterate in value order.

    use crate::types::Value;

    const SIGN_BIT: u64 = 1 << 63;

    const TAG_BOOL: u8 = 0x01;
    const TAG_INT: u8 = 0x02;
    const TAG_FLOAT: u8 = 0x03;
    const TAG_STRING: u8 = 0x04;
    const TAG_TIMESTAMP: u8 = 0x05;
    const TAG_GEO: u8 = 0x06;

    /// Appends a u64 in big-endian byte order.
    pub fn put_u64_be(dst: &mut Vec<u8>, v: u64) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a u32 in big-endian byte order.
    pub fn put_u32_be(dst: &mut Vec<u8>, v: u32) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends an i64 with the sign bit flipped so negatives sort first.
    pub fn put_i64_be(dst: &mut Vec<u8>, v: i64) {
        put_u64_be(dst, (v as u64) ^ SIGN_BIT);
    }

    /// Appends an f64 under IEEE total ordering; NaN payloads are admitted
    /// and sort at the extremes like `f64::total_cmp`.
    pub fn put_f64_be(dst: &mut Vec<u8>, v: f64) {
        let bits = v.to_bits();
        let encoded = if bits & SIGN_BIT != 0 { !bits } else { bits ^ SIGN_BIT };
        put_u64_be(dst, encoded);
    }

    /// Appends a string with 0x00 bytes escaped as 0x00 0xFF and a 0x00 0x00
    /// terminator, preserving lexicographic order across unequal lengths.
    pub fn put_str_ord(dst: &mut Vec<u8>, s: &str) {
        for &b in s.as_bytes() {
            if b == 0x00 {
                dst.push(0x00);
                dst.push(0xFF);
            } else {
                dst.push(b);
            }
        }
        dst.push(0x00);
        dst.push(0x00);
    }

    /// Appends one typed value. The leading tag keeps cross-type byte order
    /// aligned with `Value::cmp`.
    pub fn put_value(dst: &mut Vec<u8>, v: &Value) {
        match v {
            Value::Bool(b) => {
                dst.push(TAG_BOOL);
                dst.push(u8::from(*b));
            }
            Value::Int(i) => {
                dst.push(TAG_INT);
                put_i64_be(dst, *i);
            }
            Value::Float(x) => {
                dst.push(TAG_FLOAT);
                put_f64_be(dst, *x);
            }
            Value::String(s) => {
                dst.push(TAG_STRING);
                put_str_ord(dst, s);
            }
            Value::Timestamp(ns) => {
                dst.push(TAG_TIMESTAMP);
                put_i64_be(dst, *ns);
            }
            Value::Geo(g) => {
                dst.push(TAG_GEO);
                dst.extend_from_slice(&g.canonical_bytes());
            }
        }
    }

    /// Encodes a value tuple into a fresh buffer.
    pub fn encode_values(values: &[Value]) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.len() * 10);
        for v in values {
            put_value(&mut out, v);
        }
        out
    }
}

pub(crate) mod keyspace {
    //! Prefix layout of the shared key-value store.
    //!
    //! ```text
    //! 0x00 meta          [0x00, tag]
    //! 0x02 vertices      [0x02, vertex be8]
    //! 0x03 edges         [0x03, edge be8]
    //! 0x04 adjacency     [0x04, vertex be8, dir, label be4, edge be8]
    //! 0x05 schema defs   [0x05, kind, id be4]
    //! 0x06 index status  [0x06, index be4, field be4]
    //! 0x07 composite     [0x07, index be4, hash be8, values.., elem]
    //! 0x08 relation idx  [0x08, index be4, vertex be8, dir, sorts.., elem]
    //! 0x09 registry      [0x09, instance name bytes]
    //! 0x0A prop locator  [0x0A, property be8]
    //! ```

    use super::ord;
    use crate::types::{
        Direction, EdgeId, ElementId, IndexId, PropKeyId, PropertyId, Result, TramaError,
        VertexId,
    };

    pub const PREFIX_META: u8 = 0x00;
    pub const PREFIX_VERTEX: u8 = 0x02;
    pub const PREFIX_EDGE: u8 = 0x03;
    pub const PREFIX_ADJACENCY: u8 = 0x04;
    pub const PREFIX_SCHEMA_DEF: u8 = 0x05;
    pub const PREFIX_INDEX_STATUS: u8 = 0x06;
    pub const PREFIX_COMPOSITE: u8 = 0x07;
    pub const PREFIX_RELATION_INDEX: u8 = 0x08;
    pub const PREFIX_REGISTRY: u8 = 0x09;
    pub const PREFIX_PROP_LOCATOR: u8 = 0x0A;

    pub const DEF_PROP_KEY: u8 = 0x01;
    pub const DEF_EDGE_LABEL: u8 = 0x02;
    pub const DEF_VERTEX_LABEL: u8 = 0x03;
    pub const DEF_INDEX: u8 = 0x04;

    const META_ELEMENT_COUNTER: u8 = 0x01;
    const META_SCHEMA_VERSION: u8 = 0x02;

    const ELEM_VERTEX: u8 = 0x01;
    const ELEM_EDGE: u8 = 0x02;
    const ELEM_PROPERTY: u8 = 0x03;

    pub fn element_counter_key() -> Vec<u8> {
        vec![PREFIX_META, META_ELEMENT_COUNTER]
    }

    pub fn schema_version_key() -> Vec<u8> {
        vec![PREFIX_META, META_SCHEMA_VERSION]
    }

    pub fn vertex_key(v: VertexId) -> Vec<u8> {
        let mut key = vec![PREFIX_VERTEX];
        ord::put_u64_be(&mut key, v.0);
        key
    }

    pub fn vertex_prefix() -> Vec<u8> {
        vec![PREFIX_VERTEX]
    }

    pub fn decode_vertex_key(key: &[u8]) -> Result<VertexId> {
        if key.len() != 9 || key[0] != PREFIX_VERTEX {
            return Err(TramaError::Corruption("malformed vertex key"));
        }
        let bytes: [u8; 8] = key[1..9].try_into().expect("length checked");
        Ok(VertexId(u64::from_be_bytes(bytes)))
    }

    pub fn edge_key(e: EdgeId) -> Vec<u8> {
        let mut key = vec![PREFIX_EDGE];
        ord::put_u64_be(&mut key, e.0);
        key
    }

    pub fn edge_prefix() -> Vec<u8> {
        vec![PREFIX_EDGE]
    }

    pub fn decode_edge_key(key: &[u8]) -> Result<EdgeId> {
        if key.len() != 9 || key[0] != PREFIX_EDGE {
            return Err(TramaError::Corruption("malformed edge key"));
        }
        let bytes: [u8; 8] = key[1..9].try_into().expect("length checked");
        Ok(EdgeId(u64::from_be_bytes(bytes)))
    }

    /// Storage byte for an edge direction. `Both` never reaches storage.
    pub fn dir_byte(dir: Direction) -> u8 {
        match dir {
            Direction::Out => 0,
            Direction::In => 1,
            Direction::Both => unreachable!("Both is a query concept"),
        }
    }

    pub fn adjacency_key(
        vertex: VertexId,
        dir: Direction,
        label: u32,
        edge: EdgeId,
    ) -> Vec<u8> {
        let mut key = vec![PREFIX_ADJACENCY];
        ord::put_u64_be(&mut key, vertex.0);
        key.push(dir_byte(dir));
        ord::put_u32_be(&mut key, label);
        ord::put_u64_be(&mut key, edge.0);
        key
    }

    pub fn adjacency_prefix(vertex: VertexId, dir: Direction) -> Vec<u8> {
        let mut key = vec![PREFIX_ADJACENCY];
        ord::put_u64_be(&mut key, vertex.0);
        key.push(dir_byte(dir));
        key
    }

    pub fn adjacency_label_prefix(vertex: VertexId, dir: Direction, label: u32) -> Vec<u8> {
        let mut key = adjacency_prefix(vertex, dir);
        ord::put_u32_be(&mut key, label);
        key
    }

    /// Edge id stored in the final eight bytes of an adjacency key.
    pub fn adjacency_edge(key: &[u8]) -> Result<EdgeId> {
        if key.len() < 8 {
            return Err(TramaError::Corruption("adjacency key truncated"));
        }
        let bytes: [u8; 8] = key[key.len() - 8..].try_into().expect("length checked");
        Ok(EdgeId(u64::from_be_bytes(bytes)))
    }

    pub fn schema_def_prefix(kind: u8) -> Vec<u8> {
        vec![PREFIX_SCHEMA_DEF, kind]
    }

    pub fn schema_def_key(kind: u8, id: u32) -> Vec<u8> {
        let mut key = schema_def_prefix(kind);
        ord::put_u32_be(&mut key, id);
        key
    }

    pub fn index_status_key(index: IndexId, field: PropKeyId) -> Vec<u8> {
        let mut key = vec![PREFIX_INDEX_STATUS];
        ord::put_u32_be(&mut key, index.0);
        ord::put_u32_be(&mut key, field.0);
        key
    }

    pub fn decode_index_status_key(key: &[u8]) -> Result<(IndexId, PropKeyId)> {
        if key.len() != 9 || key[0] != PREFIX_INDEX_STATUS {
            return Err(TramaError::Corruption("malformed index status key"));
        }
        let index: [u8; 4] = key[1..5].try_into().expect("length checked");
        let field: [u8; 4] = key[5..9].try_into().expect("length checked");
        Ok((
            IndexId(u32::from_be_bytes(index)),
            PropKeyId(u32::from_be_bytes(field)),
        ))
    }

    fn put_element(key: &mut Vec<u8>, elem: ElementId) {
        match elem {
            ElementId::Vertex(v) => {
                key.push(ELEM_VERTEX);
                ord::put_u64_be(key, v.0);
            }
            ElementId::Edge(e) => {
                key.push(ELEM_EDGE);
                ord::put_u64_be(key, e.0);
            }
            ElementId::Property(p) => {
                key.push(ELEM_PROPERTY);
                ord::put_u64_be(key, p.0);
            }
        }
    }

    /// Element id stored in the final nine bytes of an index entry key.
    pub fn entry_element(key: &[u8]) -> Result<ElementId> {
        if key.len() < 9 {
            return Err(TramaError::Corruption("index entry key truncated"));
        }
        let tail = &key[key.len() - 9..];
        let bytes: [u8; 8] = tail[1..].try_into().expect("length checked");
        let raw = u64::from_be_bytes(bytes);
        match tail[0] {
            ELEM_VERTEX => Ok(ElementId::Vertex(VertexId(raw))),
            ELEM_EDGE => Ok(ElementId::Edge(EdgeId(raw))),
            ELEM_PROPERTY => Ok(ElementId::Property(PropertyId(raw))),
            _ => Err(TramaError::Corruption("unknown element tag in index entry")),
        }
    }

    pub fn composite_value_prefix(index: IndexId, hash: u64, values: &[u8]) -> Vec<u8> {
        let mut key = vec![PREFIX_COMPOSITE];
        ord::put_u32_be(&mut key, index.0);
        ord::put_u64_be(&mut key, hash);
        key.extend_from_slice(values);
        key
    }

    pub fn composite_entry_key(
        index: IndexId,
        hash: u64,
        values: &[u8],
        elem: ElementId,
    ) -> Vec<u8> {
        let mut key = composite_value_prefix(index, hash, values);
        put_element(&mut key, elem);
        key
    }

    pub fn composite_index_prefix(index: IndexId) -> Vec<u8> {
        let mut key = vec![PREFIX_COMPOSITE];
        ord::put_u32_be(&mut key, index.0);
        key
    }

    pub fn relation_prefix(index: IndexId, vertex: VertexId, dir: Direction) -> Vec<u8> {
        let mut key = vec![PREFIX_RELATION_INDEX];
        ord::put_u32_be(&mut key, index.0);
        ord::put_u64_be(&mut key, vertex.0);
        key.push(dir_byte(dir));
        key
    }

    pub fn relation_entry_key(
        index: IndexId,
        vertex: VertexId,
        dir: Direction,
        sort_values: &[u8],
        elem: ElementId,
    ) -> Vec<u8> {
        let mut key = relation_prefix(index, vertex, dir);
        key.extend_from_slice(sort_values);
        put_element(&mut key, elem);
        key
    }

    pub fn relation_index_prefix(index: IndexId) -> Vec<u8> {
        let mut key = vec![PREFIX_RELATION_INDEX];
        ord::put_u32_be(&mut key, index.0);
        key
    }

    pub fn registry_key(instance: &str) -> Vec<u8> {
        let mut key = vec![PREFIX_REGISTRY];
        key.extend_from_slice(instance.as_bytes());
        key
    }

    pub fn registry_prefix() -> Vec<u8> {
        vec![PREFIX_REGISTRY]
    }

    pub fn decode_registry_key(key: &[u8]) -> Result<String> {
        if key.is_empty() || key[0] != PREFIX_REGISTRY {
            return Err(TramaError::Corruption("malformed registry key"));
        }
        String::from_utf8(key[1..].to_vec())
            .map_err(|_| TramaError::Corruption("registry key not valid UTF-8"))
    }

    pub fn prop_locator_key(property: PropertyId) -> Vec<u8> {
        let mut key = vec![PREFIX_PROP_LOCATOR];
        ord::put_u64_be(&mut key, property.0);
        key
    }
}

/// SipHash-1-3 fingerprint of an encoded composite key tuple. Keeps entry
/// keys short and spreads adjacent tuples across the keyspace; the full
/// encoded tuple follows the hash in the entry key, so collisions only cost
/// a slightly wider scan, never wrong results.
pub fn composite_hash(encoded_values: &[u8]) -> u64 {
    use siphasher::sip::SipHasher13;
    use std::hash::Hasher;
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write(encoded_values);
    hasher.finish()
}

/// Reads a big-endian u64 payload, used for counters and locator values.
pub fn decode_u64(raw: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| TramaError::Corruption("u64 payload truncated"))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Encodes a tuple of values for composite entry keys, rejecting value types
/// the declared key types do not match. Callers validate types beforehand;
/// this is the single place the byte image is produced.
pub fn encode_composite_tuple(values: &[Value]) -> Vec<u8> {
    ord::encode_values(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, EdgeId, ElementId, GeoShape, IndexId, PropKeyId, VertexId};
    use proptest::prelude::*;

    #[test]
    fn status_key_roundtrip() {
        let key = keyspace::index_status_key(IndexId(7), PropKeyId(3));
        let (index, field) = keyspace::decode_index_status_key(&key).expect("decode");
        assert_eq!(index, IndexId(7));
        assert_eq!(field, PropKeyId(3));
    }

    #[test]
    fn entry_element_reads_tail() {
        let values = ord::encode_values(&[Value::Int(512)]);
        let hash = composite_hash(&values);
        let key = keyspace::composite_entry_key(
            IndexId(1),
            hash,
            &values,
            ElementId::Vertex(VertexId(42)),
        );
        assert_eq!(
            keyspace::entry_element(&key).expect("element"),
            ElementId::Vertex(VertexId(42))
        );
    }

    #[test]
    fn adjacency_keys_group_by_vertex_dir_label() {
        let a = keyspace::adjacency_key(VertexId(1), Direction::Out, 4, EdgeId(9));
        let prefix = keyspace::adjacency_label_prefix(VertexId(1), Direction::Out, 4);
        assert!(a.starts_with(&prefix));
        assert_eq!(keyspace::adjacency_edge(&a).expect("edge"), EdgeId(9));
    }

    #[test]
    fn string_encoding_orders_prefixes_first() {
        let mut ab = Vec::new();
        ord::put_str_ord(&mut ab, "ab");
        let mut abc = Vec::new();
        ord::put_str_ord(&mut abc, "abc");
        let mut b = Vec::new();
        ord::put_str_ord(&mut b, "b");
        assert!(ab < abc);
        assert!(abc < b);
    }

    #[test]
    fn embedded_nul_bytes_do_not_break_ordering() {
        let mut low = Vec::new();
        ord::put_str_ord(&mut low, "a\u{0}a");
        let mut high = Vec::new();
        ord::put_str_ord(&mut high, "a\u{1}");
        assert!(low < high);
    }

    fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            any::<f64>()
                .prop_filter("finite", |v| v.is_finite())
                .prop_map(Value::Float),
            "[a-z]{0,12}".prop_map(Value::String),
            any::<i64>().prop_map(Value::Timestamp),
            (-80.0..80.0f64, -170.0..170.0f64)
                .prop_map(|(lat, lon)| Value::Geo(GeoShape::point(lat, lon))),
        ]
    }

    proptest! {
        #[test]
        fn encoded_order_matches_value_order(
            xs in proptest::collection::vec(arb_scalar(), 1..32)
        ) {
            let mut by_bytes: Vec<(Vec<u8>, Value)> = xs
                .iter()
                .map(|v| (ord::encode_values(std::slice::from_ref(v)), v.clone()))
                .collect();
            by_bytes.sort_by(|a, b| a.0.cmp(&b.0));
            let mut by_value = xs.clone();
            by_value.sort();
            let decoded: Vec<Value> = by_bytes.into_iter().map(|(_, v)| v).collect();
            prop_assert_eq!(decoded, by_value);
        }
    }
}
