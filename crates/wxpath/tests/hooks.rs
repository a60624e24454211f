use wxpath::hooks::{self, Hook, NdjsonWriter, Serializer};
use wxpath::value::{Fragment, Value, WxStr};

struct Upper;

impl Hook for Upper {
    fn post_extract(&self, value: Value) -> Option<Value> {
        match value {
            Value::Str(s) => Some(Value::Str(WxStr::new(
                s.value.to_uppercase(),
                s.base_url,
                s.depth,
            ))),
            other => Some(other),
        }
    }
}

struct DropShort;

impl Hook for DropShort {
    fn post_extract(&self, value: Value) -> Option<Value> {
        match &value {
            Value::Str(s) if s.value.len() < 3 => None,
            _ => Some(value),
        }
    }
}

#[test]
fn registry_is_ordered_idempotent_and_vetoes_short_circuit() {
    hooks::clear();

    hooks::register(Upper);
    hooks::register(DropShort);
    // A second registration under the same name is ignored.
    hooks::register(Upper);

    let names = hooks::hook_names();
    assert_eq!(names.len(), 2);
    assert!(names[0].ends_with("Upper"));
    assert!(names[1].ends_with("DropShort"));

    let kept = hooks::apply_post_extract(Value::from("hello")).unwrap();
    assert_eq!(kept.as_str(), Some("HELLO"));

    // Dropped by the second hook; the chain short-circuits.
    assert!(hooks::apply_post_extract(Value::from("ab")).is_none());

    hooks::clear();
    assert!(hooks::hook_names().is_empty());
}

#[test]
fn serializer_reduces_fragments_to_plain_maps() {
    let fragment = Value::Fragment(Fragment {
        tag: "p".into(),
        html: "<p>x</p>".into(),
        base_url: Some("http://t/".into()),
        depth: 2,
    });

    let out = Serializer.post_extract(fragment).unwrap();
    match out {
        Value::Map(map) => {
            assert_eq!(map["_element"].as_str(), Some("p"));
            assert_eq!(map["url"].as_str(), Some("http://t/"));
            assert!(matches!(map["depth"], Value::Number(n) if n == 2.0));
        }
        other => panic!("expected a map, got {other:?}"),
    }
}

#[test]
fn ndjson_writer_mirrors_values_and_flushes_on_finish() {
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("extractions.ndjson");

    let writer = NdjsonWriter::create(&out_path).unwrap();
    // Values pass through unchanged.
    let passed = writer.post_extract(Value::from("hello")).unwrap();
    assert_eq!(passed.as_str(), Some("hello"));
    writer.post_extract(Value::Number(3.0)).unwrap();
    writer.finish();

    let content = std::fs::read_to_string(&out_path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines, vec!["\"hello\"", "3"]);
}
