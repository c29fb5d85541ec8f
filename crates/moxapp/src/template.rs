//! Template evaluation for URL, header and body templates.
//!
//! Templates embed `{{action arg...}}` placeholders drawn from a closed set
//! of actions (random helpers, clock reads, env lookup, URL encoding).
//! The dispatch table is a fixed `match`: adding a function means adding a
//! case here.

use std::collections::HashMap;

use anyhow::{bail, Context};
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::Rng;

const RANDOM_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

// Query escaping keeps the RFC 3986 unreserved marks and maps space to '+'.
const QUERY_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b' ');

/// Expand every `{{...}}` action in `template` against `env`.
pub fn evaluate(template: &str, env: &HashMap<String, String>) -> anyhow::Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .with_context(|| format!("unterminated template action in {template:?}"))?;
        out.push_str(&eval_action(after[..end].trim(), env)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Recursively expand string leaves of a JSON body template.
pub fn evaluate_body(
    body: &serde_json::Value,
    env: &HashMap<String, String>,
) -> anyhow::Result<serde_json::Value> {
    use serde_json::Value;

    match body {
        Value::String(s) => Ok(Value::String(evaluate(s, env)?)),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), evaluate_body(value, env)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate_body(item, env)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

fn eval_action(action: &str, env: &HashMap<String, String>) -> anyhow::Result<String> {
    let tokens = tokenize(action)?;
    let Some((name, args)) = tokens.split_first() else {
        bail!("empty template action");
    };

    let value = match name.as_str() {
        "randomString" => {
            let n = int_arg(args, 0, name)?.max(0) as usize;
            random_string(n)
        }
        "randomInt" => {
            let min = int_arg(args, 0, name)?;
            let max = int_arg(args, 1, name)?;
            random_int(min, max).to_string()
        }
        "randomPhone" => format!("+33{}", rand::rng().random_range(100_000_000..1_000_000_000)),
        "randomEmail" => format!("test{}@example.com", rand::rng().random_range(0..10_000)),
        "randomUUID" => uuid::Uuid::new_v4().to_string(),
        "now" => Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "today" => Utc::now().format("%Y-%m-%d").to_string(),
        "yesterday" => (Utc::now() - ChronoDuration::days(1))
            .format("%Y-%m-%d")
            .to_string(),
        "unixNow" => Utc::now().timestamp().to_string(),
        "unixMilli" => Utc::now().timestamp_millis().to_string(),
        "urlEncode" => {
            let raw = str_arg(args, 0, name)?;
            utf8_percent_encode(raw, QUERY_ESCAPE)
                .to_string()
                .replace(' ', "+")
        }
        "env" => lookup(env, str_arg(args, 0, name)?),
        "envDefault" => {
            let value = lookup(env, str_arg(args, 0, name)?);
            if value.is_empty() {
                str_arg(args, 1, name)?.to_string()
            } else {
                value
            }
        }
        other => bail!("unknown template function: {other}"),
    };

    Ok(value)
}

fn lookup(env: &HashMap<String, String>, key: &str) -> String {
    env.get(key)
        .or_else(|| env.get(&key.to_uppercase()))
        .cloned()
        .unwrap_or_default()
}

fn random_string(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| RANDOM_CHARSET[rng.random_range(0..RANDOM_CHARSET.len())] as char)
        .collect()
}

fn random_int(min: i64, max: i64) -> i64 {
    if max <= min {
        return min;
    }
    rand::rng().random_range(min..=max)
}

fn int_arg(args: &[String], index: usize, name: &str) -> anyhow::Result<i64> {
    let raw = args
        .get(index)
        .with_context(|| format!("{name}: missing argument {index}"))?;
    raw.parse()
        .with_context(|| format!("{name}: argument {index} is not an integer: {raw:?}"))
}

fn str_arg<'a>(args: &'a [String], index: usize, name: &str) -> anyhow::Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .with_context(|| format!("{name}: missing argument {index}"))
}

fn tokenize(action: &str) -> anyhow::Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = action.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut token = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(escaped) => token.push(escaped),
                        None => bail!("unterminated string in template action {action:?}"),
                    },
                    Some(ch) => token.push(ch),
                    None => bail!("unterminated string in template action {action:?}"),
                }
            }
            tokens.push(token);
        } else {
            let mut token = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                token.push(ch);
                chars.next();
            }
            tokens.push(token);
        }
    }

    Ok(tokens)
}
