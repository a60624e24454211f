use std::collections::BTreeMap;

use crate::hooks::Hook;
use crate::value::{Value, WxStr};

/// Reduces document and fragment values to plain metadata maps on
/// `post_extract`, so every value downstream has a JSON-friendly shape.
pub struct Serializer;

impl Hook for Serializer {
    fn post_extract(&self, value: Value) -> Option<Value> {
        Some(simplify(value))
    }
}

pub fn simplify(value: Value) -> Value {
    match value {
        Value::Page(page) => {
            let mut map = BTreeMap::new();
            map.insert(
                "_element".to_string(),
                Value::Str(WxStr::plain(page.tag())),
            );
            map.insert(
                "url".to_string(),
                Value::Str(WxStr::plain(page.base_url())),
            );
            map.insert("depth".to_string(), Value::Number(page.depth() as f64));
            Value::Map(map)
        }
        Value::Fragment(frag) => {
            let mut map = BTreeMap::new();
            map.insert("_element".to_string(), Value::Str(WxStr::plain(frag.tag)));
            map.insert(
                "url".to_string(),
                Value::Str(WxStr::plain(frag.base_url.unwrap_or_default())),
            );
            map.insert("depth".to_string(), Value::Number(frag.depth as f64));
            Value::Map(map)
        }
        Value::Map(map) => Value::Map(map.into_iter().map(|(k, v)| (k, simplify(v))).collect()),
        Value::Seq(items) => Value::Seq(items.into_iter().map(simplify).collect()),
        other => other,
    }
}
