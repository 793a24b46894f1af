//! Query payload construction for the paginated search API.

use serde_json::{json, Map, Value};

use crate::error::CrawlError;

/// Default query: in-stock stock designs with a price, best sellers first,
/// heavy fields excluded, and the facet aggregations the catalog exposes.
pub fn default_template() -> Value {
    json!({
        "track_total_hits": true,
        "sort": [
            { "saleRank": { "order": "desc" } },
            { "rating": { "order": "desc" } }
        ],
        "_source": {
            "excludes": ["*.productTabContent", "*.mainFeatures"]
        },
        "query": {
            "bool": {
                "should": [],
                "must": [
                    { "term": { "definitionName": "StockDesign" } },
                    { "term": { "inStock": true } },
                    { "range": { "listPrice": { "gt": 0 } } }
                ],
                "must_not": [
                    { "terms": { "definitionName": ["PrintArt", "SVG"] } }
                ]
            }
        },
        "from": 0,
        "size": 0,
        "aggs": {
            "Brands": { "terms": { "field": "brand.raw", "size": 1000, "order": { "_count": "desc" } } },
            "catalog": { "terms": { "field": "catalog.raw", "size": 1000, "order": { "_count": "desc" } } },
            "Artists": { "terms": { "field": "artist.raw", "size": 1000, "order": { "_count": "desc" } } },
            "Categories": { "terms": { "field": "categoriesList.keyword", "size": 1000, "order": { "_count": "desc" } } }
        }
    })
}

/// Recursively merge `overrides` into `base`.
///
/// Objects merge key by key; any other value (arrays included) replaces the
/// existing one outright.
pub fn deep_merge(base: &mut Map<String, Value>, overrides: &Map<String, Value>) {
    for (key, value) in overrides {
        if let (Some(Value::Object(existing)), Value::Object(incoming)) = (base.get_mut(key), value) {
            deep_merge(existing, incoming);
            continue;
        }
        base.insert(key.clone(), value.clone());
    }
}

/// Effective query for one page. `from` and `size` always come from the caller.
pub fn build_payload(from: u64, size: u64, overrides: &Value) -> Value {
    let mut payload = match default_template() {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    if let Value::Object(overrides) = overrides {
        deep_merge(&mut payload, overrides);
    }

    payload.insert("from".to_string(), json!(from));
    payload.insert("size".to_string(), json!(size));

    Value::Object(payload)
}

/// Serialized page payload
pub fn encode_payload(from: u64, size: u64, overrides: &Value) -> Result<Vec<u8>, CrawlError> {
    serde_json::to_vec(&build_payload(from, size, overrides)).map_err(CrawlError::Payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_override_keeps_untouched_siblings() {
        let overrides = json!({
            "query": { "bool": { "must": [ { "term": { "brand": "Acme" } } ] } }
        });

        let payload = build_payload(0, 120, &overrides);
        let template = default_template();

        assert_eq!(payload["aggs"], template["aggs"]);
        assert_eq!(payload["sort"], template["sort"]);
        assert_eq!(payload["query"]["bool"]["must_not"], template["query"]["bool"]["must_not"]);
        assert_eq!(payload["query"]["bool"]["must"], json!([ { "term": { "brand": "Acme" } } ]));
    }

    #[test]
    fn pagination_fields_cannot_be_overridden() {
        let overrides = json!({ "from": 999, "size": 1, "track_total_hits": false });
        let payload = build_payload(240, 120, &overrides);

        assert_eq!(payload["from"], 240);
        assert_eq!(payload["size"], 120);
        assert_eq!(payload["track_total_hits"], false);
    }

    #[test]
    fn scalars_replace_objects_and_objects_replace_scalars() {
        let mut base = json!({ "a": { "b": 1 }, "c": 2 }).as_object().cloned().unwrap();
        let overrides = json!({ "a": 5, "c": { "d": 3 }, "e": [1, 2] }).as_object().cloned().unwrap();

        deep_merge(&mut base, &overrides);

        assert_eq!(Value::Object(base), json!({ "a": 5, "c": { "d": 3 }, "e": [1, 2] }));
    }

    #[test]
    fn non_object_overrides_are_ignored() {
        assert_eq!(build_payload(0, 10, &Value::Null)["aggs"], default_template()["aggs"]);
        assert_eq!(build_payload(0, 10, &json!([1, 2]))["size"], 10);
    }

    #[test]
    fn encoded_payload_is_json() {
        let bytes = encode_payload(120, 120, &json!({})).unwrap();
        let decoded: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded["from"], 120);
    }
}
