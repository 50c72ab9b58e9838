//! Letters crossing the full wire: serialize, parse, decode, and get the
//! original payload tree back.

use crate::codec::{AnyObject, Blob, BytesCodec, Codec, CodecRegistry, Item, Params};
use crate::error::TanukiResult;
use crate::letter::{EncodedPaths, RequestLetter, Status};
use crate::response::build_response;
use serde_json::{json, Value};
use std::sync::Arc;

fn bytes_registry() -> CodecRegistry {
    let mut registry = CodecRegistry::new();
    registry.register(Arc::new(BytesCodec)).unwrap();
    registry
}

fn wire_roundtrip(letter: &RequestLetter) -> RequestLetter {
    serde_json::from_str(&serde_json::to_string(letter).unwrap()).unwrap()
}

#[test]
fn request_letter_roundtrip_restores_opaque_leaves() {
    let registry = bytes_registry();

    let mut scan = Params::new();
    scan.insert("frame".to_string(), Item::object(Blob(vec![1, 2, 3])));
    scan.insert("gain".to_string(), 7i64.into());
    let mut params = Params::new();
    params.insert("scan".to_string(), Item::Map(scan));
    params.insert("label".to_string(), "run-4".into());

    let mut encoded = EncodedPaths::new();
    let wire_params = registry.encode_map(&params, "params", &mut encoded).unwrap();
    let letter = RequestLetter {
        job_id: "j1".to_string(),
        result_queue_name: "result_calc_1".to_string(),
        command: "capture".to_string(),
        params: wire_params,
        units: serde_json::Map::new(),
        encoded,
    };

    let decoded = registry.decode_request(&wire_roundtrip(&letter)).unwrap();

    assert_eq!(decoded["label"].as_value(), Some(&json!("run-4")));
    let scan = decoded["scan"].as_map().unwrap();
    assert_eq!(scan["gain"].as_value(), Some(&json!(7)));
    assert_eq!(scan["frame"].downcast_ref::<Blob>(), Some(&Blob(vec![1, 2, 3])));
}

#[test]
fn response_letter_roundtrip_decodes_result_and_echo() {
    let registry = bytes_registry();

    let mut params = Params::new();
    params.insert("frame".to_string(), Item::object(Blob(vec![4, 5])));
    let mut encoded = EncodedPaths::new();
    let wire_params = registry.encode_map(&params, "params", &mut encoded).unwrap();
    let request = RequestLetter {
        job_id: "j2".to_string(),
        result_queue_name: "result_calc_1".to_string(),
        command: "invert".to_string(),
        params: wire_params,
        units: serde_json::Map::new(),
        encoded,
    };

    let mut units = serde_json::Map::new();
    units.insert("voltage".to_string(), json!("V"));
    let mut result = Params::new();
    result.insert("frame".to_string(), Item::object(Blob(vec![250, 251])));
    result.insert("count".to_string(), 2i64.into());

    let letter = build_response(&registry, &units, &request, Status::Done, &result).unwrap();
    let letter = serde_json::from_str(&serde_json::to_string(&letter).unwrap()).unwrap();
    let decoded = registry.decode_response(letter).unwrap();

    assert_eq!(decoded.job_id, "j2");
    assert_eq!(decoded.status, Status::Done);
    assert_eq!(decoded.command, "invert");
    assert_eq!(decoded.units["voltage"], json!("V"));
    assert_eq!(decoded.result["count"].as_value(), Some(&json!(2)));
    assert_eq!(
        decoded.result["frame"].downcast_ref::<Blob>(),
        Some(&Blob(vec![250, 251]))
    );
    // The request echo is decoded too, through the remapped paths.
    assert_eq!(
        decoded.request_params["frame"].downcast_ref::<Blob>(),
        Some(&Blob(vec![4, 5]))
    );
}

#[test]
fn first_registered_codec_claims_the_leaf() {
    struct GreedyCodec;

    impl Codec for GreedyCodec {
        fn name(&self) -> &'static str {
            "greedy"
        }

        fn encode(&self, value: &dyn AnyObject) -> Option<Value> {
            value
                .as_any()
                .downcast_ref::<Blob>()
                .map(|blob| Value::from(blob.0.len()))
        }

        fn decode(&self, _wire: &Value) -> TanukiResult<Box<dyn AnyObject>> {
            Ok(Box::new(Blob(Vec::new())))
        }
    }

    let mut registry = CodecRegistry::new();
    registry.register(Arc::new(GreedyCodec)).unwrap();
    registry.register(Arc::new(BytesCodec)).unwrap();

    let mut params = Params::new();
    params.insert("frame".to_string(), Item::object(Blob(vec![1, 2, 3])));

    let mut encoded = EncodedPaths::new();
    let wire = registry.encode_map(&params, "params", &mut encoded).unwrap();

    assert_eq!(encoded["greedy"], vec!["params/frame".to_string()]);
    assert!(!encoded.contains_key("bytes"));
    assert_eq!(wire["frame"], json!(3));
}
