//! Turn decision events into engine examples.
//!
//! The event context is flattened into hashed features. Object keys
//! are joined with `.` and array elements by index. Strings become
//! indicator features `path=value`, numbers are weighted `path`
//! features, `true` is an indicator and `false` / `null` are skipped.
//! A constant bias feature is always present.

use serde_json::Value;

use super::{Example, Feature};
use crate::errors::MarshalError;
use crate::event::DecisionEvent;

const CONSTANT_FEATURE: &str = "constant";

fn hash(name: &str) -> u64 {
    seahash::hash(name.as_bytes())
}

fn flatten(path: &str, value: &Value, out: &mut Vec<Feature>) {
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                let path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                flatten(&path, value, out);
            }
        }
        Value::Array(values) => {
            for (i, value) in values.iter().enumerate() {
                flatten(&format!("{path}.{i}"), value, out);
            }
        }
        Value::String(s) => out.push(Feature {
            index: hash(&format!("{path}={s}")),
            value: 1.0,
        }),
        Value::Number(n) => {
            let value = n.as_f64().unwrap_or_default() as f32;
            if value.is_finite() && value != 0.0 {
                out.push(Feature {
                    index: hash(path),
                    value,
                });
            }
        }
        Value::Bool(true) => out.push(Feature {
            index: hash(path),
            value: 1.0,
        }),
        Value::Bool(false) | Value::Null => {}
    }
}

/// Build the example for an event into `features`.
///
/// `features` is cleared first so an engine's recycled buffer can be
/// passed in.
pub fn to_engine_example(
    event: &DecisionEvent,
    mut features: Vec<Feature>,
) -> Result<Example, MarshalError> {
    let label = event.label;
    if event.actions == 0 {
        return Err(MarshalError::NoActions);
    }
    if label.action == 0 || label.action > event.actions {
        return Err(MarshalError::ActionOutOfRange {
            action: label.action,
            actions: event.actions,
        });
    }
    if !(label.probability > 0.0 && label.probability <= 1.0) {
        return Err(MarshalError::InvalidProbability(label.probability));
    }
    if !label.cost.is_finite() {
        return Err(MarshalError::NonFiniteCost(label.cost));
    }
    // Trackbacks store one ID per line.
    if event.event_id.contains(|c: char| c == '\n' || c == '\r') {
        return Err(MarshalError::InvalidEventId(event.event_id.clone()));
    }

    features.clear();
    features.push(Feature {
        index: hash(CONSTANT_FEATURE),
        value: 1.0,
    });
    match &event.context {
        Value::Null => {}
        context @ Value::Object(_) => flatten("", context, &mut features),
        _ => return Err(MarshalError::ContextNotObject),
    }

    Ok(Example {
        features,
        actions: event.actions,
        label: Some(label),
    })
}

#[cfg(test)]
fn event(context: Value) -> DecisionEvent {
    use crate::event::{Label, Offset};

    DecisionEvent {
        event_id: "e1".to_owned(),
        partition: "0".into(),
        offset: Offset(1),
        timestamp: chrono::Utc::now(),
        actions: 2,
        context,
        label: Label {
            action: 1,
            probability: 0.5,
            cost: 1.0,
        },
    }
}

#[test]
fn flatten_works() {
    let event = event(serde_json::json!({
        "user": {"country": "NL", "age": 31, "premium": true, "trial": false},
        "tags": ["a", "b"],
        "missing": null,
    }));
    let example = to_engine_example(&event, Vec::new()).unwrap();

    let mut found: Vec<_> = example.features.iter().map(|f| (f.index, f.value)).collect();
    found.sort_by_key(|(index, _)| *index);
    let mut expected = vec![
        (hash("constant"), 1.0),
        (hash("user.country=NL"), 1.0),
        (hash("user.age"), 31.0),
        (hash("user.premium"), 1.0),
        (hash("tags.0=a"), 1.0),
        (hash("tags.1=b"), 1.0),
    ];
    expected.sort_by_key(|(index, _)| *index);
    assert_eq!(found, expected);
    assert_eq!(example.actions, 2);
}

#[test]
fn null_context_is_bias_only() {
    let example = to_engine_example(&event(Value::Null), Vec::new()).unwrap();
    assert_eq!(example.feature_count(), 1);
}

#[test]
fn reuses_buffer() {
    let buffer = vec![Feature {
        index: 7,
        value: 3.0,
    }];
    let example = to_engine_example(&event(Value::Null), buffer).unwrap();
    assert_eq!(example.features, vec![Feature { index: hash("constant"), value: 1.0 }]);
}

#[test]
fn rejects_bad_events() {
    assert!(matches!(
        to_engine_example(&event(serde_json::json!([1, 2])), Vec::new()),
        Err(MarshalError::ContextNotObject)
    ));

    let mut bad = event(Value::Null);
    bad.label.action = 3;
    assert!(matches!(
        to_engine_example(&bad, Vec::new()),
        Err(MarshalError::ActionOutOfRange { action: 3, actions: 2 })
    ));

    let mut bad = event(Value::Null);
    bad.label.probability = 0.0;
    assert!(matches!(
        to_engine_example(&bad, Vec::new()),
        Err(MarshalError::InvalidProbability(_))
    ));

    let mut bad = event(Value::Null);
    bad.actions = 0;
    assert!(matches!(
        to_engine_example(&bad, Vec::new()),
        Err(MarshalError::NoActions)
    ));

    let mut bad = event(Value::Null);
    bad.label.cost = f32::INFINITY;
    assert!(matches!(
        to_engine_example(&bad, Vec::new()),
        Err(MarshalError::NonFiniteCost(_))
    ));

    let mut bad = event(Value::Null);
    bad.label.cost = f32::NAN;
    assert!(matches!(
        to_engine_example(&bad, Vec::new()),
        Err(MarshalError::NonFiniteCost(_))
    ));

    for id in ["a\nb", "a\r", "\r\n"] {
        let mut bad = event(Value::Null);
        bad.event_id = id.to_owned();
        assert!(matches!(
            to_engine_example(&bad, Vec::new()),
            Err(MarshalError::InvalidEventId(_))
        ));
    }
}

#[test]
fn out_of_range_cost_parses_as_infinite() {
    let mut json = serde_json::to_value(event(Value::Null)).unwrap();
    json["label"]["cost"] = serde_json::from_str("1e39").unwrap();
    let parsed: DecisionEvent = serde_json::from_value(json).unwrap();
    assert!(parsed.label.cost.is_infinite());
    assert!(matches!(
        to_engine_example(&parsed, Vec::new()),
        Err(MarshalError::NonFiniteCost(_))
    ));
}
