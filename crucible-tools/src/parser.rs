//! Extracts a typed input schema from a function-shaped tool source.
//!
//! The source must declare exactly one top-level `def name(params) -> ret:`
//! function. Parameter annotations map onto JSON Schema (Draft-07)
//! fragments; the doc block supplies the tool and per-parameter
//! descriptions.

use serde_json::{json, Map, Value};

use crate::error::ToolError;

/// A parsed custom tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomTool {
    pub name: String,
    pub description: String,
    /// Draft-07 object schema for the tool's keyword arguments.
    pub input_schema: Value,
}

struct Param {
    name: String,
    ty: String,
    has_default: bool,
}

/// Parse `source` into a [`CustomTool`].
pub fn parse_tool(source: &str) -> Result<CustomTool, ToolError> {
    let (name, params) = parse_signature(source)?;
    let doc = parse_doc_block(source);

    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in &params {
        let mut fragment = map_type(&param.ty)?;
        if let Some(desc) = doc.params.iter().find(|(n, _)| n == &param.name) {
            fragment
                .as_object_mut()
                .expect("type fragments are objects")
                .insert("description".to_owned(), Value::String(desc.1.clone()));
        }
        properties.insert(param.name.clone(), fragment);
        if !param.has_default {
            required.push(Value::String(param.name.clone()));
        }
    }

    let mut description = doc.summary;
    if let Some(returns) = doc.returns {
        if !description.is_empty() {
            description.push_str("\n\n");
        }
        description.push_str("Returns: ");
        description.push_str(&returns);
    }

    Ok(CustomTool {
        name,
        description,
        input_schema: json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "properties": Value::Object(properties),
            "required": Value::Array(required),
            "additionalProperties": false,
        }),
    })
}

/// Locate the single top-level function and split out its parameters.
fn parse_signature(source: &str) -> Result<(String, Vec<Param>), ToolError> {
    let mut headers = Vec::new();
    for (idx, line) in source.lines().enumerate() {
        if line.starts_with("def ") {
            headers.push(idx);
        }
    }
    let header_idx = match headers.as_slice() {
        [] => {
            return Err(ToolError::Invalid(
                "no top-level function definition found".to_owned(),
            ))
        }
        [one] => *one,
        more => {
            return Err(ToolError::Invalid(format!(
                "expected exactly one top-level function, found {}",
                more.len()
            )))
        }
    };

    // The signature may span lines; collect until the parameter list closes.
    let mut signature = String::new();
    let mut depth = 0usize;
    let mut closed = false;
    for line in source.lines().skip(header_idx) {
        signature.push_str(line);
        signature.push(' ');
        for b in line.bytes() {
            match b {
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        closed = true;
                    }
                }
                _ => {}
            }
        }
        if closed {
            break;
        }
    }
    if !closed {
        return Err(ToolError::Invalid("unterminated parameter list".to_owned()));
    }

    let rest = signature
        .strip_prefix("def ")
        .expect("header starts with def");
    let open = rest
        .find('(')
        .ok_or_else(|| ToolError::Invalid("malformed function header".to_owned()))?;
    let name = rest[..open].trim().to_owned();
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        || name.starts_with(|c: char| c.is_ascii_digit())
    {
        return Err(ToolError::Invalid(format!("invalid tool name: {name:?}")));
    }

    let close = matching_paren(rest, open)
        .ok_or_else(|| ToolError::Invalid("unterminated parameter list".to_owned()))?;
    let params_src = &rest[open + 1..close];

    let mut params = Vec::new();
    for part in split_top_level(params_src, ',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if part == "*" || part.starts_with('*') {
            return Err(ToolError::Invalid(format!(
                "unsupported parameter form: {part:?}"
            )));
        }
        let (head, default) = match split_top_level(part, '=').as_slice() {
            [head] => (head.trim().to_owned(), false),
            [head, _default] => (head.trim().to_owned(), true),
            _ => return Err(ToolError::Invalid(format!("malformed parameter: {part:?}"))),
        };
        let Some((pname, ty)) = head.split_once(':') else {
            return Err(ToolError::Invalid(format!(
                "parameter {head:?} is missing a type annotation"
            )));
        };
        params.push(Param {
            name: pname.trim().to_owned(),
            ty: ty.trim().to_owned(),
            has_default: default,
        });
    }
    Ok((name, params))
}

/// Map a type annotation to a JSON Schema fragment.
///
/// Primitives map to their JSON counterparts, list-likes to `array`,
/// map-likes to `object`, `Literal[...]` to an enum. Anything else fails:
/// a schema the caller cannot satisfy is worse than a parse error.
fn map_type(ty: &str) -> Result<Value, ToolError> {
    let ty = ty.trim().trim_start_matches("typing.");

    // Unions: only `T | None` (i.e. Optional) is expressible in a schema.
    let non_none: Vec<String> = split_top_level(ty, '|')
        .into_iter()
        .map(|part| part.trim().to_owned())
        .filter(|part| part != "None")
        .collect();
    match non_none.len() {
        0 => {
            return Err(ToolError::Invalid(format!(
                "unsupported parameter type: {ty:?}"
            )))
        }
        1 => {}
        _ => {
            return Err(ToolError::Invalid(format!(
                "unsupported union type: {ty:?}"
            )))
        }
    }
    let ty = non_none[0].as_str();

    match ty {
        "str" => return Ok(json!({"type": "string"})),
        "int" => return Ok(json!({"type": "integer"})),
        "float" => return Ok(json!({"type": "number"})),
        "bool" => return Ok(json!({"type": "boolean"})),
        "list" | "tuple" | "set" => return Ok(json!({"type": "array"})),
        "dict" => return Ok(json!({"type": "object"})),
        _ => {}
    }

    if let Some(inner) = generic_arg(ty, "Optional") {
        return map_type(inner);
    }
    if let Some(inner) = generic_arg(ty, "list").or_else(|| generic_arg(ty, "set")) {
        return Ok(json!({"type": "array", "items": map_type(inner)?}));
    }
    if generic_arg(ty, "tuple").is_some() {
        return Ok(json!({"type": "array"}));
    }
    if generic_arg(ty, "dict").is_some() {
        return Ok(json!({"type": "object"}));
    }
    if let Some(inner) = generic_arg(ty, "Literal") {
        let mut variants = Vec::new();
        for raw in split_top_level(inner, ',') {
            let raw = raw.trim();
            let value = if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
                || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
            {
                Value::String(raw[1..raw.len() - 1].to_owned())
            } else if let Ok(n) = raw.parse::<i64>() {
                Value::from(n)
            } else {
                return Err(ToolError::Invalid(format!(
                    "unsupported literal variant: {raw:?}"
                )));
            };
            variants.push(value);
        }
        if variants.is_empty() {
            return Err(ToolError::Invalid("empty Literal type".to_owned()));
        }
        return Ok(json!({"enum": Value::Array(variants)}));
    }

    Err(ToolError::Invalid(format!(
        "unsupported parameter type: {ty:?}"
    )))
}

/// `generic_arg("list[int]", "list") == Some("int")`
fn generic_arg<'a>(ty: &'a str, base: &str) -> Option<&'a str> {
    let rest = ty.strip_prefix(base)?.trim_start();
    let inner = rest.strip_prefix('[')?.strip_suffix(']')?;
    Some(inner)
}

fn matching_paren(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, b) in s.bytes().enumerate().skip(open) {
        match b {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on `sep`, ignoring separators nested in brackets or quotes.
fn split_top_level(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for c in s.chars() {
        if let Some(q) = quote {
            current.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                current.push(c);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c == sep && depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
}

struct DocBlock {
    summary: String,
    params: Vec<(String, String)>,
    returns: Option<String>,
}

/// Pull the documentation block out of the function body and split it into
/// summary, `:param name:` descriptions, and the `:return:` description.
fn parse_doc_block(source: &str) -> DocBlock {
    let empty = DocBlock {
        summary: String::new(),
        params: Vec::new(),
        returns: None,
    };

    let Some(body) = extract_docstring(source) else {
        return empty;
    };

    let mut summary = String::new();
    let mut params: Vec<(String, String)> = Vec::new();
    let mut returns: Option<String> = None;

    enum Section {
        Summary,
        Param(usize),
        Return,
    }
    let mut section = Section::Summary;

    for line in body.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(":param ") {
            if let Some((name, desc)) = rest.split_once(':') {
                params.push((name.trim().to_owned(), desc.trim().to_owned()));
                section = Section::Param(params.len() - 1);
                continue;
            }
        }
        if let Some(rest) = trimmed
            .strip_prefix(":return:")
            .or_else(|| trimmed.strip_prefix(":returns:"))
        {
            returns = Some(rest.trim().to_owned());
            section = Section::Return;
            continue;
        }
        match &section {
            Section::Summary => {
                if !summary.is_empty() {
                    summary.push('\n');
                }
                summary.push_str(trimmed);
            }
            // Continuation lines attach to whatever came before them.
            Section::Param(idx) if !trimmed.is_empty() => {
                let entry = &mut params[*idx].1;
                entry.push(' ');
                entry.push_str(trimmed);
            }
            Section::Return if !trimmed.is_empty() => {
                let entry = returns.get_or_insert_with(String::new);
                entry.push(' ');
                entry.push_str(trimmed);
            }
            _ => {}
        }
    }

    DocBlock {
        summary: summary.trim().to_owned(),
        params,
        returns: returns.map(|r| r.trim().to_owned()).filter(|r| !r.is_empty()),
    }
}

/// Find the first triple-quoted string after the function header.
fn extract_docstring(source: &str) -> Option<String> {
    let header_end = {
        let def = source.find("def ")?;
        // The body starts after the colon that closes the header; with a
        // return annotation that is the first colon after `->`.
        match source[def..].find("->") {
            Some(arrow) => {
                let arrow = def + arrow;
                source[arrow..].find(':').map(|i| arrow + i + 1)?
            }
            None => source[def..].find("):").map(|i| def + i + 2)?,
        }
    };
    let rest = &source[header_end..];
    for delim in ["\"\"\"", "'''"] {
        if let Some(start) = rest.find(delim) {
            let after = &rest[start + 3..];
            if let Some(end) = after.find(delim) {
                return Some(after[..end].to_owned());
            }
        }
    }
    None
}
