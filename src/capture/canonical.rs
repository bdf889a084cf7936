//! Canonical JSON: object keys in sorted byte order, arrays as given,
//! scalars as `serde_json` writes them, no insignificant whitespace.
//!
//! Strings additionally escape `<`, `>`, `&`, U+2028 and U+2029 as `\uXXXX`,
//! matching the hashes other capture verifiers compute over the same manifest.

use serde::Serialize;
use serde_json::Value;

pub fn canonicalize<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    let mut out = Vec::new();
    write_value(&value, &mut out)?;
    Ok(out)
}

/// Re-encode arbitrary JSON text in canonical form.
pub fn canonicalize_json(text: &[u8]) -> serde_json::Result<Vec<u8>> {
    let value: Value = serde_json::from_slice(text)?;
    let mut out = Vec::new();
    write_value(&value, &mut out)?;
    Ok(out)
}

fn write_value(value: &Value, out: &mut Vec<u8>) -> serde_json::Result<()> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

            out.push(b'{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(key, out)?;
                out.push(b':');
                write_value(val, out)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        Value::String(text) => write_string(text, out)?,
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

fn write_string(text: &str, out: &mut Vec<u8>) -> serde_json::Result<()> {
    let encoded = serde_json::to_string(text)?;
    // none of these characters can occur inside an escape sequence
    for c in encoded.chars() {
        match c {
            '<' => out.extend_from_slice(b"\\u003c"),
            '>' => out.extend_from_slice(b"\\u003e"),
            '&' => out.extend_from_slice(b"\\u0026"),
            '\u{2028}' => out.extend_from_slice(b"\\u2028"),
            '\u{2029}' => out.extend_from_slice(b"\\u2029"),
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    Ok(())
}
