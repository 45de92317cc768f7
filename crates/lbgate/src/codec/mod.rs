// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! JSON <-> CBOR conversion under a bidirectional key dictionary.
//!
//! Well-known JSON object keys are replaced by small integers on the wire
//! (CBOR allows non-string map keys), which is where most of the byte
//! savings beyond plain binary encoding come from. The conversion is
//! schema-agnostic: values pass through a tagged intermediate form
//! ([`serde_json::Value`] / [`serde_cbor::Value`]), never typed structs, so
//! arbitrary payloads round-trip.
//!
//! # Canonical mode
//!
//! With `canonical` set, `cbor_to_json` emits Canonical JSON (object keys
//! sorted lexicographically, no insignificant whitespace). CBOR map output
//! is deterministic in either mode: integer keys ascending, then text keys
//! in byte order, with integers in their shortest form. Canonical mode is
//! meant for tests that compare encoded bytes; it costs a sort per object.

mod v1;

pub use v1::v1_keys;

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use serde_cbor::Value as Cbor;
use serde_json::Value as Json;
use tracing::warn;

use crate::error::{Error, Result};
use crate::http::{HttpResponse, APPLICATION_CBOR, APPLICATION_JSON, CONTENT_TYPE};

/// Converts between JSON and CBOR byte streams.
///
/// One call consumes exactly one top-level value; sub-values are not
/// streamed.
pub struct CborCodec {
    keys: HashMap<String, i64>,
    enum_keys: HashMap<i64, String>,
    canonical: bool,
    /// Map keys that are neither integers nor text get discarded; this
    /// counts them so the drops are observable.
    dropped_keys: AtomicU64,
}

impl CborCodec {
    /// Create a codec with the given key dictionary. The dictionary must be
    /// bijective: each integer may stand for at most one key.
    pub fn new(keys: HashMap<String, i64>, canonical: bool) -> Result<Self> {
        let mut enum_keys = HashMap::with_capacity(keys.len());
        for (k, &v) in &keys {
            if enum_keys.insert(v, k.clone()).is_some() {
                return Err(Error::DuplicateDictionaryValue {
                    key: k.clone(),
                    value: v,
                });
            }
        }
        Ok(Self {
            keys,
            enum_keys,
            canonical,
            dropped_keys: AtomicU64::new(0),
        })
    }

    /// Create a codec with the v1 key dictionary.
    pub fn v1(canonical: bool) -> Self {
        Self::new(v1_keys(), canonical).expect("v1 key dictionary is bijective")
    }

    /// Number of CBOR map keys discarded so far because their type cannot
    /// be represented as a JSON object key.
    pub fn dropped_key_count(&self) -> u64 {
        self.dropped_keys.load(Ordering::Relaxed)
    }

    /// Convert a single JSON value into CBOR bytes.
    pub fn json_to_cbor(&self, input: impl Read) -> Result<Vec<u8>> {
        let value: Json = serde_json::from_reader(input)?;
        let cbor = self.json_value_to_cbor(value);
        Ok(serde_cbor::to_vec(&cbor)?)
    }

    /// Convert a single CBOR value into JSON bytes.
    pub fn cbor_to_json(&self, input: impl Read) -> Result<Vec<u8>> {
        let value: Cbor = serde_cbor::from_reader(input)?;
        let mut json = self.cbor_value_to_json(value);
        if self.canonical {
            canonicalize(&mut json);
        }
        Ok(serde_json::to_vec(&json)?)
    }

    /// Rewrite an outbound JSON response into CBOR at the response boundary.
    ///
    /// Responses with any other `Content-Type` pass through untouched. The
    /// body must hold one entire JSON value.
    pub fn encode_response(&self, res: &mut HttpResponse) -> Result<()> {
        if res.header(CONTENT_TYPE) != Some(APPLICATION_JSON) {
            return Ok(());
        }
        res.set_header(CONTENT_TYPE, APPLICATION_CBOR);
        if !res.body.is_empty() {
            res.body = self.json_to_cbor(res.body.as_slice())?;
        }
        Ok(())
    }

    fn json_value_to_cbor(&self, value: Json) -> Cbor {
        match value {
            Json::Null => Cbor::Null,
            Json::Bool(b) => Cbor::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Cbor::Integer(i as i128)
                } else if let Some(u) = n.as_u64() {
                    Cbor::Integer(u as i128)
                } else {
                    Cbor::Float(n.as_f64().unwrap_or_default())
                }
            }
            Json::String(s) => Cbor::Text(s),
            Json::Array(items) => {
                Cbor::Array(items.into_iter().map(|v| self.json_value_to_cbor(v)).collect())
            }
            Json::Object(obj) => {
                let mut map = BTreeMap::new();
                for (k, v) in obj {
                    let key = match self.keys.get(&k) {
                        Some(&n) => Cbor::Integer(n as i128),
                        None => Cbor::Text(k),
                    };
                    map.insert(key, self.json_value_to_cbor(v));
                }
                Cbor::Map(map)
            }
        }
    }

    fn cbor_value_to_json(&self, value: Cbor) -> Json {
        match value {
            Cbor::Null => Json::Null,
            Cbor::Bool(b) => Json::Bool(b),
            Cbor::Integer(i) => {
                if let Ok(n) = i64::try_from(i) {
                    Json::from(n)
                } else if let Ok(n) = u64::try_from(i) {
                    Json::from(n)
                } else {
                    Json::from(i as f64)
                }
            }
            Cbor::Float(f) => serde_json::Number::from_f64(f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Cbor::Bytes(b) => {
                Json::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            Cbor::Text(s) => Json::String(s),
            Cbor::Array(items) => {
                Json::Array(items.into_iter().map(|v| self.cbor_value_to_json(v)).collect())
            }
            Cbor::Map(map) => {
                // BTreeMap iteration yields integer keys (ascending) before
                // text keys, so integer keys are materialized first and a
                // text key that resolves to the same name overwrites the
                // integer-derived entry: the string key MUST be used.
                let mut obj = serde_json::Map::new();
                for (k, v) in map {
                    let name = match k {
                        Cbor::Integer(i) => match i64::try_from(i)
                            .ok()
                            .and_then(|n| self.enum_keys.get(&n))
                        {
                            Some(s) => s.clone(),
                            None => i.to_string(),
                        },
                        Cbor::Text(s) => s,
                        other => {
                            self.dropped_keys.fetch_add(1, Ordering::Relaxed);
                            warn!("dropping CBOR map key with unsupported type: {:?}", other);
                            continue;
                        }
                    };
                    obj.insert(name, self.cbor_value_to_json(v));
                }
                Json::Object(obj)
            }
            // Times and bignums carry no key-dictionary semantics; unwrap
            // to the tagged value.
            Cbor::Tag(_, inner) => self.cbor_value_to_json(*inner),
            _ => Json::Null,
        }
    }
}

/// Sort object keys lexicographically, recursively. Output written through
/// `serde_json::to_vec` is compact, which together with the sort yields
/// Canonical JSON.
fn canonicalize(value: &mut Json) {
    match value {
        Json::Object(obj) => {
            let mut entries: Vec<(String, Json)> = std::mem::take(obj).into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, v) in entries.iter_mut() {
                canonicalize(v);
            }
            *obj = entries.into_iter().collect();
        }
        Json::Array(items) => {
            for v in items {
                canonicalize(v);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn test_codec() -> CborCodec {
        let keys = HashMap::from([
            ("one".to_string(), 1),
            ("two".to_string(), 2),
            ("three".to_string(), 3),
        ]);
        CborCodec::new(keys, true).unwrap()
    }

    // Test case from MSC3079.
    const FIXTURE_CBOR: &str = "a5026e6d2e726f6f6d2e6d65737361676503a2181b6b48656c6c6f20576f726c\
                                64181c666d2e74657874056e21666f6f3a6c6f63616c686f7374067040616c69\
                                63653a6c6f63616c686f737409a26a626f6f6c5f76616c7565f56a6e756c6c5f\
                                76616c7565f6";
    const FIXTURE_JSON: &str = r#"{"content":{"body":"Hello World","msgtype":"m.text"},"room_id":"!foo:localhost","sender":"@alice:localhost","type":"m.room.message","unsigned":{"bool_value":true,"null_value":null}}"#;

    #[test]
    fn v1_fixture_decodes_to_canonical_json() {
        let codec = CborCodec::v1(true);
        let out = codec.cbor_to_json(unhex(FIXTURE_CBOR).as_slice()).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), FIXTURE_JSON);
    }

    #[test]
    fn v1_fixture_encodes_to_canonical_cbor() {
        let input = r#"
        {
            "type": "m.room.message",
            "content": {
              "msgtype": "m.text",
              "body": "Hello World"
            },
            "sender": "@alice:localhost",
            "room_id": "!foo:localhost",
            "unsigned": {
              "bool_value": true,
              "null_value": null
            }
        }"#;
        let codec = CborCodec::v1(true);
        let out = codec.json_to_cbor(input.as_bytes()).unwrap();
        assert_eq!(hex(&out), FIXTURE_CBOR.replace(char::is_whitespace, ""));
    }

    #[test]
    fn dictionary_keys_become_integers() {
        let codec = test_codec();
        // Keys matching the dictionary get replaced, but never values.
        let input = r#"{"one":11,"other":"one","nest":{"two":["three"]}}"#;
        let cbor = codec.json_to_cbor(input.as_bytes()).unwrap();
        let value: Cbor = serde_cbor::from_slice(&cbor).unwrap();
        let map = match value {
            Cbor::Map(m) => m,
            other => panic!("expected map, got {:?}", other),
        };
        assert_eq!(map.get(&Cbor::Integer(1)), Some(&Cbor::Integer(11)));
        assert_eq!(
            map.get(&Cbor::Text("other".into())),
            Some(&Cbor::Text("one".into()))
        );
        let nest = match map.get(&Cbor::Text("nest".into())) {
            Some(Cbor::Map(m)) => m,
            other => panic!("expected nested map, got {:?}", other),
        };
        assert_eq!(
            nest.get(&Cbor::Integer(2)),
            Some(&Cbor::Array(vec![Cbor::Text("three".into())]))
        );
    }

    #[test]
    fn round_trips_through_cbor() {
        let codec = test_codec();
        let cases = [
            "{}",
            r#"{"bool":true,"int":8,"null":null,"str":"string"}"#,
            r#"{"top":{"mid":{"bot":{"k1":false}}}}"#,
            r#"{"arr":["str",42.1,null,[1,2],{"k":"v"}],"other":"val"}"#,
            r#"[42,"life",true,null,11.1]"#,
            r#"{"one":11}"#,
        ];
        for case in cases {
            let cbor = codec.json_to_cbor(case.as_bytes()).unwrap();
            let back = codec.cbor_to_json(cbor.as_slice()).unwrap();
            assert_eq!(String::from_utf8(back).unwrap(), case, "case {}", case);
        }
    }

    #[test]
    fn unmapped_integer_key_becomes_decimal_string() {
        let codec = test_codec();
        // {99: "x"}
        let cbor = serde_cbor::to_vec(&Cbor::Map(BTreeMap::from([(
            Cbor::Integer(99),
            Cbor::Text("x".into()),
        )])))
        .unwrap();
        let json = codec.cbor_to_json(cbor.as_slice()).unwrap();
        assert_eq!(String::from_utf8(json).unwrap(), r#"{"99":"x"}"#);
    }

    // A key can arrive twice, once as a number and once as a string. The
    // string key MUST win.
    #[test]
    fn string_key_beats_integer_key() {
        let codec = test_codec();
        let cbor = serde_cbor::to_vec(&Cbor::Map(BTreeMap::from([
            (Cbor::Text("one".into()), Cbor::Integer(11)),
            (Cbor::Integer(1), Cbor::Integer(12)),
        ])))
        .unwrap();
        let json = codec.cbor_to_json(cbor.as_slice()).unwrap();
        assert_eq!(String::from_utf8(json).unwrap(), r#"{"one":11}"#);
    }

    #[test]
    fn unsupported_map_keys_are_dropped_and_counted() {
        let codec = test_codec();
        // {true: 1, "kept": 2}
        let cbor = serde_cbor::to_vec(&Cbor::Map(BTreeMap::from([
            (Cbor::Bool(true), Cbor::Integer(1)),
            (Cbor::Text("kept".into()), Cbor::Integer(2)),
        ])))
        .unwrap();
        let json = codec.cbor_to_json(cbor.as_slice()).unwrap();
        assert_eq!(String::from_utf8(json).unwrap(), r#"{"kept":2}"#);
        assert_eq!(codec.dropped_key_count(), 1);
    }

    #[test]
    fn byte_strings_surface_as_base64() {
        let codec = test_codec();
        let cbor = serde_cbor::to_vec(&Cbor::Map(BTreeMap::from([(
            Cbor::Text("blob".into()),
            Cbor::Bytes(vec![1, 2, 3]),
        )])))
        .unwrap();
        let json = codec.cbor_to_json(cbor.as_slice()).unwrap();
        assert_eq!(String::from_utf8(json).unwrap(), r#"{"blob":"AQID"}"#);
    }

    #[test]
    fn rejects_duplicate_dictionary_integers() {
        let keys = HashMap::from([("a".to_string(), 7), ("b".to_string(), 7)]);
        assert!(matches!(
            CborCodec::new(keys, false),
            Err(Error::DuplicateDictionaryValue { value: 7, .. })
        ));
    }

    #[test]
    fn malformed_input_is_an_error() {
        let codec = test_codec();
        assert!(codec.json_to_cbor(&b"{not json"[..]).is_err());
        assert!(codec.cbor_to_json(&b"\xff\xff"[..]).is_err());
    }

    // The error-path writer fixture: a JSON error body rewritten to CBOR at
    // the response boundary.
    #[test]
    fn rewrites_json_error_response_to_cbor() {
        let codec = CborCodec::v1(true);
        let mut res = HttpResponse::with_body(
            400,
            APPLICATION_JSON,
            r#"{"error":"something","errcode":"M_UNKNOWN"}"#,
        );
        codec.encode_response(&mut res).unwrap();
        assert_eq!(res.status, 400);
        assert_eq!(res.header(CONTENT_TYPE), Some(APPLICATION_CBOR));
        assert_eq!(hex(&res.body), "a21866694d5f554e4b4e4f574e186769736f6d657468696e67");
    }

    #[test]
    fn non_json_responses_pass_through_unchanged() {
        let codec = CborCodec::v1(false);
        let mut res = HttpResponse::with_body(200, "text/plain", "hi");
        codec.encode_response(&mut res).unwrap();
        assert_eq!(res.header(CONTENT_TYPE), Some("text/plain"));
        assert_eq!(res.body, b"hi");
    }
}
