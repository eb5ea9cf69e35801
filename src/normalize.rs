use chrono::DateTime;
use tracing::{debug, warn};

use crate::keys::KeyDictionary;
use crate::record::{is_reserved, RawDocument, Record, ValueRow};

/// Turns raw documents into records, assigning entry IDs and key IDs.
///
/// Both counters live here and only here; the sink drives it from a
/// single task, so IDs come out gap-free in call order.
pub struct Normalizer {
    keys: KeyDictionary,
    next_id: i64,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Normalizer {
            keys: KeyDictionary::new(),
            next_id: 1,
        }
    }

    pub fn normalize(&mut self, doc: RawDocument) -> Record {
        let id = self.next_id;
        self.next_id += 1;

        // Bad dates are dropped, not fatal.
        let date = doc
            .date
            .as_deref()
            .and_then(|d| DateTime::parse_from_rfc3339(d.trim()).ok());
        if date.is_none() {
            if let Some(raw) = &doc.date {
                debug!("{}: ignoring unparsable date '{}'", doc.id, raw);
            }
        }

        let mut values: Vec<ValueRow> = Vec::with_capacity(doc.attributes.len());
        for (name, value) in doc.attributes {
            if is_reserved(name.trim()) {
                warn!("{}: skipping reserved attribute name '{}'", doc.id, name);
                continue;
            }
            let key_id = self.keys.intern(&name);
            let data = value.as_str().unwrap_or_default().to_string();
            match values.iter_mut().find(|v| v.key_id == key_id) {
                Some(existing) => existing.data = data,
                None => values.push(ValueRow { key_id, data }),
            }
        }

        Record {
            id,
            title: doc.title.unwrap_or_default(),
            author: doc.author.unwrap_or_default(),
            date,
            values,
        }
    }

    pub fn keys(&self) -> &KeyDictionary {
        &self.keys
    }

    /// Records normalized so far.
    pub fn count(&self) -> i64 {
        self.next_id - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Title;
    use serde_json::json;

    fn doc(attrs: serde_json::Value) -> RawDocument {
        let serde_json::Value::Object(attributes) = attrs else {
            unreachable!()
        };
        RawDocument {
            id: "test".into(),
            attributes,
            ..Default::default()
        }
    }

    #[test]
    fn sequence_ids_and_shared_keys() {
        let mut n = Normalizer::new();
        let a = n.normalize(doc(json!({"Owner": "Alice"})));
        let b = n.normalize(doc(json!({"Owner": "Bob", "Team": "X"})));
        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(a.values, [ValueRow { key_id: 1, data: "Alice".into() }]);
        assert_eq!(
            b.values,
            [
                ValueRow { key_id: 1, data: "Bob".into() },
                ValueRow { key_id: 2, data: "X".into() },
            ]
        );
        assert_eq!(n.count(), 2);
        assert_eq!(n.keys().len(), 2);
    }

    #[test]
    fn non_text_values_become_empty() {
        let mut n = Normalizer::new();
        let r = n.normalize(doc(json!({"Count": 3, "Tags": ["a"], "Note": null})));
        assert!(r.values.iter().all(|v| v.data.is_empty()));
        assert_eq!(r.values.len(), 3);
    }

    #[test]
    fn reserved_names_are_not_interned() {
        let mut n = Normalizer::new();
        let r = n.normalize(doc(json!({" _title ": "spoof", "_date": "x", "Owner": "A"})));
        assert_eq!(r.values, [ValueRow { key_id: 1, data: "A".into() }]);
        assert_eq!(n.keys().get("_title"), None);
    }

    #[test]
    fn names_colliding_after_trim_keep_one_value() {
        let mut n = Normalizer::new();
        let r = n.normalize(doc(json!({"Owner": "A", " Owner ": "B"})));
        assert_eq!(r.values, [ValueRow { key_id: 1, data: "B".into() }]);
    }

    #[test]
    fn dates_are_best_effort() {
        let mut n = Normalizer::new();
        let mut good = doc(json!({}));
        good.date = Some("2018-12-05T00:00:00Z".into());
        good.title = Some(Title {
            text: "T".into(),
            url: "u".into(),
        });
        let r = n.normalize(good);
        assert_eq!(r.date.unwrap().to_rfc3339(), "2018-12-05T00:00:00+00:00");
        assert_eq!(r.title.text, "T");
        assert_eq!(r.author.name, "");

        let mut bad = doc(json!({"Owner": "A"}));
        bad.date = Some("05 Dec 2018".into());
        let r = n.normalize(bad);
        assert!(r.date.is_none());
        assert_eq!(r.id, 2);
        assert_eq!(r.values.len(), 1);
    }
}
