//! Chart value trees
//!
//! Values are JSON trees merged layer over layer: objects merge key by key,
//! anything else in the upper layer replaces what is below it.

use serde_json::{Map, Value};

use crate::crd::Image;

/// Merge `overlay` into `base` in place
pub fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Merge layers from lowest to highest precedence into a new tree
pub fn merged<'a>(layers: impl IntoIterator<Item = &'a Value>) -> Value {
    let mut out = Value::Object(Map::new());
    for layer in layers {
        merge(&mut out, layer);
    }
    out
}

/// Value tree that pins a chart's image
pub fn image_values(image: &Image) -> Value {
    serde_json::json!({
        "image": {
            "repository": image.repository,
            "tag": image.tag,
        }
    })
}

/// Nest a tree under a key, for dependency values inside a parent chart
pub fn nest(key: &str, values: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), values);
    Value::Object(map)
}
