use axum::extract::State;
use axum::Json;
use tracing::debug;

use crucible_broker::ExecuteRequest;
use crucible_core::BrokerError;

use super::error::ApiError;
use super::schemas::{ExecuteBody, ExecuteResponse};
use super::AppState;

/// `POST /v1/execute` -- run user code in a fresh sandbox worker.
///
/// The body is accepted leniently: agents produce envelopes wrapped in
/// `{"requestBody": ...}`, keys in camelCase, and frequently JSON that is
/// almost-but-not-quite valid. A strict parse is tried first; on failure
/// the body goes through a repair pass before being rejected.
pub async fn execute(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => {
            let repaired = repair_json(&String::from_utf8_lossy(&body));
            debug!("strict parse failed, trying repaired body");
            serde_json::from_str(&repaired).map_err(|e| {
                BrokerError::InvalidArgument(format!(
                    "request is not valid JSON and could not be repaired: {e}"
                ))
            })?
        }
    };
    let payload = canonicalise(unwrap_envelope(payload));
    let body: ExecuteBody = serde_json::from_value(payload)
        .map_err(|e| BrokerError::InvalidArgument(e.to_string()))?;
    debug!(files = body.files.len(), "execute request accepted");

    let result = state
        .broker
        .execute(ExecuteRequest {
            source_code: body.source_code,
            files: body.files,
            env: body.env,
            chat_id: body.chat_id,
            persistent_workspace: body.persistent_workspace,
            max_downloads: body.max_downloads,
            expires_days: body.expires_days,
            expires_seconds: body.expires_seconds,
        })
        .await?;
    Ok(Json(result.into()))
}

/// Drop a `{"requestBody": {...}}` wrapper if it is the whole payload.
fn unwrap_envelope(payload: serde_json::Value) -> serde_json::Value {
    match payload {
        serde_json::Value::Object(mut map)
            if map.len() == 1 && map.contains_key("requestBody") =>
        {
            map.remove("requestBody").expect("key just checked")
        }
        other => other,
    }
}

/// Normalize the top-level keys: aliases first, then camelCase to
/// snake_case. Nested maps (`files`, `env`) carry user-chosen keys and are
/// left alone.
fn canonicalise(payload: serde_json::Value) -> serde_json::Value {
    let serde_json::Value::Object(map) = payload else {
        return payload;
    };
    let canonical = map
        .into_iter()
        .map(|(key, value)| {
            let key = match key.as_str() {
                "sourceCode" | "code" => "source_code".to_owned(),
                "timeoutSeconds" => "timeout".to_owned(),
                other => camel_to_snake(other),
            };
            (key, value)
        })
        .collect();
    serde_json::Value::Object(canonical)
}

/// Best-effort repair of almost-JSON.
///
/// Covers what agent clients actually send: single-quoted strings,
/// unquoted object keys, trailing commas, and Python's `True`/`False`/
/// `None` spellings. The output still has to survive a real JSON parse, so
/// a wrong guess here cannot smuggle anything past validation.
fn repair_json(input: &str) -> String {
    let chars: Vec<char> = input.trim().chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            // Sound double-quoted strings pass through untouched.
            '"' => {
                out.push('"');
                i += 1;
                while i < chars.len() {
                    let c = chars[i];
                    out.push(c);
                    i += 1;
                    if c == '\\' {
                        if i < chars.len() {
                            out.push(chars[i]);
                            i += 1;
                        }
                    } else if c == '"' {
                        break;
                    }
                }
            }
            // Single-quoted strings become double-quoted, re-escaping as
            // needed.
            '\'' => {
                out.push('"');
                i += 1;
                while i < chars.len() {
                    let c = chars[i];
                    i += 1;
                    match c {
                        '\\' if i < chars.len() && chars[i] == '\'' => {
                            out.push('\'');
                            i += 1;
                        }
                        '\\' => {
                            out.push('\\');
                            if i < chars.len() {
                                out.push(chars[i]);
                                i += 1;
                            }
                        }
                        '"' => out.push_str("\\\""),
                        '\'' => break,
                        c => out.push(c),
                    }
                }
                out.push('"');
            }
            // Commas that trail the last element of an object or array are
            // dropped.
            ',' => {
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                    i += 1;
                } else {
                    out.push(',');
                    i += 1;
                }
            }
            // A bare word is either an unquoted key (followed by a colon)
            // or a Python-spelled constant.
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ':' {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else {
                    match word.as_str() {
                        "True" => out.push_str("true"),
                        "False" => out.push_str("false"),
                        "None" => out.push_str("null"),
                        _ => out.push_str(&word),
                    }
                }
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (idx, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if idx > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn camel_case_converts() {
        assert_eq!(camel_to_snake("persistentWorkspace"), "persistent_workspace");
        assert_eq!(camel_to_snake("chatId"), "chat_id");
        assert_eq!(camel_to_snake("already_snake"), "already_snake");
    }

    #[test]
    fn envelope_is_unwrapped_and_aliased() {
        let payload = json!({"requestBody": {"sourceCode": "print(1)", "chatId": "s1"}});
        let canonical = canonicalise(unwrap_envelope(payload));
        assert_eq!(
            canonical,
            json!({"source_code": "print(1)", "chat_id": "s1"})
        );
    }

    #[test]
    fn code_alias_is_accepted() {
        let canonical = canonicalise(json!({"code": "print(1)"}));
        assert_eq!(canonical, json!({"source_code": "print(1)"}));
    }

    #[test]
    fn nested_keys_are_untouched() {
        let payload = json!({
            "source_code": "x",
            "files": {"/workspace/myFile.txt": "aa"},
            "env": {"MY_VAR": "1"},
        });
        let canonical = canonicalise(payload.clone());
        assert_eq!(canonical, payload);
    }

    #[test]
    fn partial_envelope_is_not_unwrapped() {
        let payload = json!({"requestBody": {"a": 1}, "other": 2});
        assert_eq!(unwrap_envelope(payload.clone()), payload);
    }

    fn repaired(input: &str) -> serde_json::Value {
        serde_json::from_str(&repair_json(input)).expect("repaired body should parse")
    }

    #[test]
    fn repair_fixes_single_quotes_and_trailing_commas() {
        assert_eq!(
            repaired("{'source_code': 'print(1)', 'chat_id': 's1',}"),
            json!({"source_code": "print(1)", "chat_id": "s1"})
        );
        assert_eq!(repaired("[1, 2, 3,]"), json!([1, 2, 3]));
    }

    #[test]
    fn repair_quotes_bare_keys() {
        assert_eq!(
            repaired("{source_code: \"print(1)\", chat_id: \"s1\"}"),
            json!({"source_code": "print(1)", "chat_id": "s1"})
        );
    }

    #[test]
    fn repair_translates_python_constants() {
        assert_eq!(
            repaired("{persistent_workspace: True, max_downloads: None, flag: False}"),
            json!({"persistent_workspace": true, "max_downloads": null, "flag": false})
        );
    }

    #[test]
    fn repair_preserves_embedded_quotes_in_code() {
        let value = repaired("{'source_code': 'print(\"hi\")'}");
        assert_eq!(value["source_code"], "print(\"hi\")");

        let value = repaired(r"{'note': 'it\'s fine'}");
        assert_eq!(value["note"], "it's fine");
    }

    #[test]
    fn repair_leaves_valid_json_alone() {
        let body = json!({"source_code": "x = {'a': 1}", "files": {"/workspace/a.txt": "aa"}});
        assert_eq!(repaired(&body.to_string()), body);
    }

    #[test]
    fn repair_cannot_save_garbage() {
        assert!(serde_json::from_str::<serde_json::Value>(&repair_json("print('not json')")).is_err());
    }
}
