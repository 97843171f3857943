use model::execution::outcome::{BulkWriteOutcome, ItemError, ItemOutcome};
use serde_json::Value;

/// Parses a bulk response body.
///
/// Each entry of `items` is a single-key object keyed by the action name.
/// Older clusters report `error` as a plain string, newer ones as an object
/// with `type` and `reason`.
pub fn parse_bulk_response(status: u16, body: &str) -> Result<BulkWriteOutcome, serde_json::Error> {
    let json: Value = serde_json::from_str(body)?;

    let items = json
        .get("items")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_item).collect())
        .unwrap_or_default();

    Ok(BulkWriteOutcome {
        status,
        took_ms: json.get("took").and_then(Value::as_u64),
        errors: json.get("errors").and_then(Value::as_bool).unwrap_or(false),
        items,
    })
}

fn parse_item(item: &Value) -> Option<ItemOutcome> {
    let (action, result) = item.as_object()?.iter().next()?;

    let id = match result.get("_id") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let status = result
        .get("status")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok())
        .unwrap_or(0);

    let error = result.get("error").map(|err| match err {
        Value::String(reason) => ItemError {
            error_type: "error".to_string(),
            reason: reason.clone(),
        },
        other => ItemError {
            error_type: other
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            reason: other
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
    });

    Some(ItemOutcome {
        action: action.clone(),
        id,
        status,
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_item_results() {
        let body = r#"{
            "took": 12,
            "errors": true,
            "items": [
                {"index": {"_id": "a", "status": 201}},
                {"index": {"_id": "b", "status": 429, "error": {"type": "es_rejected_execution_exception", "reason": "queue full"}}},
                {"delete": {"_id": "c", "status": 404}}
            ]
        }"#;

        let outcome = parse_bulk_response(200, body).unwrap();
        assert_eq!(outcome.took_ms, Some(12));
        assert!(outcome.errors);
        assert_eq!(outcome.succeeded_ids().collect::<Vec<_>>(), vec!["a", "c"]);

        let failed: Vec<_> = outcome.failed().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "b");
        assert_eq!(
            failed[0].error.as_ref().unwrap().error_type,
            "es_rejected_execution_exception"
        );
    }

    #[test]
    fn accepts_string_errors_from_old_clusters() {
        let body = r#"{"errors":true,"items":[{"index":{"_id":"x","status":400,"error":"MapperParsingException[failed]"}}]}"#;
        let outcome = parse_bulk_response(200, body).unwrap();
        let err = outcome.items[0].error.as_ref().unwrap();
        assert_eq!(err.reason, "MapperParsingException[failed]");
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_bulk_response(200, "<html>").is_err());
    }
}
