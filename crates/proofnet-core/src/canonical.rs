//! Canonical CBOR encoding of signed payloads.
//!
//! Signatures are computed over deterministic CBOR (RFC 8949 core
//! deterministic encoding):
//! - Map keys sorted by encoded byte comparison
//! - Integers use smallest valid encoding
//! - Definite lengths only
//! - No floats (timestamps are i64 milliseconds)
//!
//! Wire bodies do not need this; only bytes that get signed do.

use std::collections::{BTreeMap, BTreeSet};

use ciborium::value::Value;
use uuid::Uuid;

use crate::person::PersonDetails;

/// Signature domains.
pub mod domains {
    pub const AUTHORITY: &[u8] = b"proofnet-authority-v1";
    pub const PERSON: &[u8] = b"proofnet-person-v1";
    pub const DELEGATE_TREE: &[u8] = b"proofnet-delegate-tree-v1";
}

/// Field keys (integer keys encode as single bytes).
mod keys {
    pub const SUBJECT: u64 = 0;
    pub const SIGNER: u64 = 1;
    pub const SIGNED_AT: u64 = 2;
    pub const FLAG: u64 = 3;
    pub const NICK: u64 = 4;
    pub const NAME: u64 = 5;
    pub const EMAIL: u64 = 6;
    pub const ENTRIES: u64 = 7;
}

/// Bytes signed by an authorizer of a statement.
pub fn authority_signing_bytes(
    statement: &Uuid,
    authorizer: &Uuid,
    signed_at: i64,
    signed_proof: bool,
) -> Vec<u8> {
    encode(&Value::Map(vec![
        (key(keys::SUBJECT), uuid_value(statement)),
        (key(keys::SIGNER), uuid_value(authorizer)),
        (key(keys::SIGNED_AT), Value::Integer(signed_at.into())),
        (key(keys::FLAG), Value::Bool(signed_proof)),
    ]))
}

/// Bytes a person signs over their own display info.
pub fn person_signing_bytes(person: &Uuid, details: &PersonDetails, signed_at: i64) -> Vec<u8> {
    encode(&Value::Map(vec![
        (key(keys::SUBJECT), uuid_value(person)),
        (key(keys::SIGNED_AT), Value::Integer(signed_at.into())),
        (key(keys::NICK), Value::Text(details.nick.clone())),
        (key(keys::NAME), optional_text(&details.name)),
        (key(keys::EMAIL), optional_text(&details.email)),
    ]))
}

/// Bytes signed over a root context's delegate map.
pub fn delegate_tree_signing_bytes(
    root: &Uuid,
    signer: &Uuid,
    signed_at: i64,
    delegates: &BTreeMap<String, BTreeSet<Uuid>>,
) -> Vec<u8> {
    // BTreeMap/BTreeSet iteration order is already deterministic.
    let entries = delegates
        .iter()
        .map(|(prefix, persons)| {
            (
                Value::Text(prefix.clone()),
                Value::Array(persons.iter().map(uuid_value).collect()),
            )
        })
        .collect();
    encode(&Value::Map(vec![
        (key(keys::SUBJECT), uuid_value(root)),
        (key(keys::SIGNER), uuid_value(signer)),
        (key(keys::SIGNED_AT), Value::Integer(signed_at.into())),
        (key(keys::ENTRIES), Value::Map(entries)),
    ]))
}

fn key(k: u64) -> Value {
    Value::Integer(k.into())
}

fn uuid_value(uuid: &Uuid) -> Value {
    Value::Bytes(uuid.as_bytes().to_vec())
}

fn optional_text(text: &Option<String>) -> Value {
    match text {
        Some(t) => Value::Text(t.clone()),
        None => Value::Null,
    }
}

/// Encode a CBOR Value to canonical bytes.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value_to(&mut buf, value);
    buf
}

fn encode_value_to(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => {
            encode_uint(buf, 2, b.len() as u64);
            buf.extend_from_slice(b);
        }
        Value::Text(s) => {
            encode_uint(buf, 3, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Array(arr) => {
            encode_uint(buf, 4, arr.len() as u64);
            for item in arr {
                encode_value_to(buf, item);
            }
        }
        Value::Map(entries) => encode_map_canonical(buf, entries),
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Null => buf.push(0xf6),
        Value::Float(_) => panic!("floats not supported in canonical encoding"),
        _ => panic!("unsupported CBOR value type"),
    }
}

fn encode_integer(buf: &mut Vec<u8>, i: ciborium::value::Integer) {
    let n: i128 = i.into();
    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // CBOR encodes -1 as 0, -2 as 1, etc.
        encode_uint(buf, 1, (-1 - n) as u64);
    }
}

fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

/// Keys are sorted by their encoded byte comparison.
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) {
    let mut pairs: Vec<(Vec<u8>, &Value)> = entries
        .iter()
        .map(|(k, v)| (encode(k), v))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    encode_uint(buf, 5, pairs.len() as u64);
    for (key_bytes, value) in pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value);
    }
}
