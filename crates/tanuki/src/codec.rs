//! Pluggable codecs for embedding non-primitive values inside letters.
//!
//! Application-facing payloads are [`Item`] trees. Wire-native leaves pass
//! through untouched; opaque leaves are claimed by the first registered
//! [`Codec`] whose `encode` returns a value, and the codec's name plus the
//! leaf's path are recorded in the letter's `encoded` map so the receiving
//! side can apply the inverse at exactly that path. Decoding never guesses:
//! an unresolvable or malformed path fails loudly.

use crate::error::{TanukiError, TanukiResult};
use crate::letter::{EncodedPaths, RequestLetter, ResponseLetter, Status};
use base64::Engine;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// An opaque application value carried inside a letter. Blanket-implemented
/// for everything `Any + Send + Sync`, so embedders register a codec rather
/// than implement a trait on their types.
pub trait AnyObject: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
}

impl<T: Any + Send + Sync> AnyObject for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// One node of an application-facing payload tree.
pub enum Item {
    /// A wire-native leaf or subtree (numbers, strings, booleans, sequences).
    Value(Value),
    /// A nested mapping, walked recursively by the codec.
    Map(BTreeMap<String, Item>),
    /// An opaque value that requires a registered codec to cross the wire.
    Object(Box<dyn AnyObject>),
}

/// Argument (or result) name to value mapping, as handlers see it.
pub type Params = BTreeMap<String, Item>;

impl Item {
    /// Wrap an opaque value.
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Item::Object(Box::new(value))
    }

    /// Borrow an opaque leaf as a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Item::Object(object) => object.as_ref().as_any().downcast_ref(),
            _ => None,
        }
    }

    /// Borrow a wire-native leaf.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Item::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Borrow a nested mapping.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Item>> {
        match self {
            Item::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Item::Value(value) => write!(f, "Value({value})"),
            Item::Map(map) => f.debug_map().entries(map.iter()).finish(),
            Item::Object(object) => write!(f, "Object({})", object.as_ref().type_name()),
        }
    }
}

impl From<Value> for Item {
    fn from(value: Value) -> Self {
        Item::Value(value)
    }
}

impl From<i64> for Item {
    fn from(value: i64) -> Self {
        Item::Value(value.into())
    }
}

impl From<f64> for Item {
    fn from(value: f64) -> Self {
        Item::Value(value.into())
    }
}

impl From<bool> for Item {
    fn from(value: bool) -> Self {
        Item::Value(value.into())
    }
}

impl From<&str> for Item {
    fn from(value: &str) -> Self {
        Item::Value(value.into())
    }
}

impl From<String> for Item {
    fn from(value: String) -> Self {
        Item::Value(value.into())
    }
}

/// A named, invertible encoding for one family of opaque values.
pub trait Codec: Send + Sync {
    /// Registry key, recorded in letters next to the paths this codec claimed.
    fn name(&self) -> &'static str;

    /// Returns `None` when this codec does not claim the value.
    fn encode(&self, value: &dyn AnyObject) -> Option<Value>;

    /// Inverse of `encode`, applied at a recorded path.
    fn decode(&self, wire: &Value) -> TanukiResult<Box<dyn AnyObject>>;
}

/// Ordered codec registry. Encoding tries codecs in registration order and
/// the first claimant wins; decoding looks codecs up by name.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn Codec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a codec. Later registrations only see values earlier codecs
    /// declined.
    pub fn register(&mut self, codec: Arc<dyn Codec>) -> TanukiResult<()> {
        if self.codecs.iter().any(|c| c.name() == codec.name()) {
            return Err(TanukiError::Config(format!(
                "codec '{}' is already registered",
                codec.name()
            )));
        }
        self.codecs.push(codec);
        Ok(())
    }

    fn get(&self, name: &str) -> Option<&Arc<dyn Codec>> {
        self.codecs.iter().find(|c| c.name() == name)
    }

    /// Encode an item tree into its wire form, recording the path of every
    /// codec-claimed leaf in `encoded`.
    pub fn encode_map(
        &self,
        items: &Params,
        base_path: &str,
        encoded: &mut EncodedPaths,
    ) -> TanukiResult<serde_json::Map<String, Value>> {
        let mut out = serde_json::Map::new();
        for (key, item) in items {
            let path = format!("{base_path}/{key}");
            out.insert(key.clone(), self.encode_item(item, &path, encoded)?);
        }
        Ok(out)
    }

    fn encode_item(
        &self,
        item: &Item,
        path: &str,
        encoded: &mut EncodedPaths,
    ) -> TanukiResult<Value> {
        match item {
            Item::Value(value) => Ok(value.clone()),
            Item::Map(map) => {
                let mut out = serde_json::Map::new();
                for (key, child) in map {
                    let child_path = format!("{path}/{key}");
                    out.insert(key.clone(), self.encode_item(child, &child_path, encoded)?);
                }
                Ok(Value::Object(out))
            }
            Item::Object(object) => {
                for codec in &self.codecs {
                    if let Some(wire) = codec.encode(object.as_ref()) {
                        encoded
                            .entry(codec.name().to_string())
                            .or_default()
                            .push(path.to_string());
                        return Ok(wire);
                    }
                }
                Err(TanukiError::Encoding {
                    path: path.to_string(),
                    type_name: object.as_ref().type_name(),
                })
            }
        }
    }

    /// Decode a request letter's params into an item tree, applying every
    /// recorded codec path.
    pub(crate) fn decode_request(&self, letter: &RequestLetter) -> TanukiResult<Params> {
        let mut params = item_tree(&letter.params);
        for (name, paths) in &letter.encoded {
            let codec = self.lookup(name)?;
            for path in paths {
                let rest = strip_root(path, "params")?;
                apply_codec(&mut params, &rest, codec.as_ref(), path)?;
            }
        }
        Ok(params)
    }

    /// Decode a response letter, applying recorded codec paths against the
    /// `result` field and the request echo.
    pub(crate) fn decode_response(&self, letter: ResponseLetter) -> TanukiResult<DecodedResponse> {
        let mut result = item_tree(&letter.result);
        let mut request_params = item_tree(&letter.request.params);
        for (name, paths) in &letter.encoded {
            let codec = self.lookup(name)?;
            for path in paths {
                let mut segments = path.split('/');
                match segments.next() {
                    Some("result") => {
                        let rest: Vec<&str> = segments.collect();
                        apply_codec(&mut result, &rest, codec.as_ref(), path)?;
                    }
                    Some("request") => {
                        if segments.next() != Some("params") {
                            return Err(TanukiError::Protocol(format!(
                                "encoded path '{path}' does not enter the request params"
                            )));
                        }
                        let rest: Vec<&str> = segments.collect();
                        apply_codec(&mut request_params, &rest, codec.as_ref(), path)?;
                    }
                    _ => {
                        return Err(TanukiError::Protocol(format!(
                            "encoded path '{path}' is rooted outside the letter"
                        )));
                    }
                }
            }
        }
        Ok(DecodedResponse {
            job_id: letter.job_id,
            status: letter.status,
            command: letter.request.command,
            request_params,
            result,
            units: letter.units,
        })
    }

    fn lookup(&self, name: &str) -> TanukiResult<&Arc<dyn Codec>> {
        self.get(name).ok_or_else(|| {
            TanukiError::Protocol(format!("no codec registered under '{name}'"))
        })
    }
}

/// A response letter with its result and request echo decoded.
#[derive(Debug)]
pub(crate) struct DecodedResponse {
    pub job_id: String,
    pub status: Status,
    pub command: String,
    pub request_params: Params,
    pub result: Params,
    pub units: serde_json::Map<String, Value>,
}

/// Lift a wire mapping into an item tree: objects become maps, everything
/// else becomes a wire-native leaf.
fn item_tree(wire: &serde_json::Map<String, Value>) -> Params {
    let mut items = BTreeMap::new();
    for (key, value) in wire {
        let item = match value {
            Value::Object(map) => Item::Map(item_tree(map)),
            other => Item::Value(other.clone()),
        };
        items.insert(key.clone(), item);
    }
    items
}

fn strip_root<'a>(path: &'a str, field: &str) -> TanukiResult<Vec<&'a str>> {
    let mut segments = path.split('/');
    if segments.next() != Some(field) {
        return Err(TanukiError::Protocol(format!(
            "encoded path '{path}' is rooted outside '{field}'"
        )));
    }
    Ok(segments.collect())
}

/// Replace the leaf at `segments` with the codec's decoded object. Paths are
/// exact: a missing key, a non-leaf target, or an empty path is a protocol
/// error, never a silent skip.
fn apply_codec(
    items: &mut Params,
    segments: &[&str],
    codec: &dyn Codec,
    full_path: &str,
) -> TanukiResult<()> {
    let Some((head, rest)) = segments.split_first() else {
        return Err(TanukiError::Protocol(format!(
            "encoded path '{full_path}' does not name a leaf"
        )));
    };
    let entry = items.get_mut(*head).ok_or_else(|| {
        TanukiError::Protocol(format!("encoded path '{full_path}' does not resolve"))
    })?;

    if rest.is_empty() {
        let wire = match entry {
            Item::Value(value) => value.clone(),
            _ => {
                return Err(TanukiError::Protocol(format!(
                    "encoded path '{full_path}' does not point at a wire leaf"
                )))
            }
        };
        *entry = Item::Object(codec.decode(&wire)?);
        return Ok(());
    }

    match entry {
        Item::Map(map) => apply_codec(map, rest, codec, full_path),
        _ => Err(TanukiError::Protocol(format!(
            "encoded path '{full_path}' traverses a non-mapping value"
        ))),
    }
}

/// Raw binary payload leaf, carried over the wire as base64 text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

/// Built-in codec for [`Blob`] leaves.
pub struct BytesCodec;

impl Codec for BytesCodec {
    fn name(&self) -> &'static str {
        "bytes"
    }

    fn encode(&self, value: &dyn AnyObject) -> Option<Value> {
        value
            .as_any()
            .downcast_ref::<Blob>()
            .map(|blob| Value::String(BASE64.encode(&blob.0)))
    }

    fn decode(&self, wire: &Value) -> TanukiResult<Box<dyn AnyObject>> {
        let text = wire.as_str().ok_or_else(|| {
            TanukiError::Protocol("bytes codec expects a string leaf".to_string())
        })?;
        let bytes = BASE64
            .decode(text)
            .map_err(|e| TanukiError::Protocol(format!("invalid base64 payload: {e}")))?;
        Ok(Box::new(Blob(bytes)))
    }
}
