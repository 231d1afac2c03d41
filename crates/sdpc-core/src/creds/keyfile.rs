//! In-place SPA key replacement in config files.
//!
//! The credential store rewrites only the SPA key values; every other
//! line, comment, and byte of whitespace is preserved. Two formats are
//! handled: the flat `KEY value` client config, and the fwknop rc file
//! where the keys live inside a named `[stanza]` section.

use std::path::Path;

use crate::error::{Error, Result};

use super::store::write_private;

/// Client config key names rewritten during rotation.
const CLIENT_KEYS: [&str; 2] = ["SPA_ENCRYPTION_KEY", "SPA_HMAC_KEY"];

/// fwknop rc key names rewritten during rotation.
const FWKNOP_KEYS: [&str; 2] = ["KEY_BASE64", "HMAC_KEY_BASE64"];

/// Replace the SPA key values in the flat client config file.
pub fn replace_client_spa_keys(path: &Path, encryption_key: &str, hmac_key: &str) -> Result<()> {
    rewrite(path, |line, _in_stanza| {
        replacement_for(line, &CLIENT_KEYS, encryption_key, hmac_key)
    })
}

/// Replace the SPA key values inside `[stanza]` in the fwknop rc file.
///
/// Keys in other stanzas are left alone; the same key names routinely
/// appear once per gateway stanza.
pub fn replace_fwknop_spa_keys(
    path: &Path,
    stanza: &str,
    encryption_key: &str,
    hmac_key: &str,
) -> Result<()> {
    let header = format!("[{stanza}]");
    rewrite(path, |line, in_stanza| {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            *in_stanza = trimmed == header;
            return None;
        }
        if *in_stanza {
            replacement_for(line, &FWKNOP_KEYS, encryption_key, hmac_key)
        } else {
            None
        }
    })
}

/// Rewrite `path` line by line, replacing lines for which `replace`
/// returns new text. Fails if no line was replaced for each expected key.
fn rewrite<F>(path: &Path, mut replace: F) -> Result<()>
where
    F: FnMut(&str, &mut bool) -> Option<(usize, String)>,
{
    let text = std::fs::read(path).map_err(|e| Error::Filesystem {
        path: path.display().to_string(),
        message: format!("failed to read: {e}"),
    })?;
    let text = String::from_utf8(text).map_err(|e| Error::Filesystem {
        path: path.display().to_string(),
        message: format!("not UTF-8 text: {e}"),
    })?;

    let mut out = String::with_capacity(text.len());
    let mut replaced = [false; 2];
    let mut in_stanza = false;

    for segment in text.split_inclusive('\n') {
        let (line, ending) = split_line_ending(segment);
        match replace(line, &mut in_stanza) {
            Some((idx, new_line)) => {
                replaced[idx] = true;
                out.push_str(&new_line);
            }
            None => out.push_str(line),
        }
        out.push_str(ending);
    }

    if !replaced.iter().all(|r| *r) {
        return Err(Error::Filesystem {
            path: path.display().to_string(),
            message: "SPA key entries not found".into(),
        });
    }

    write_private(path, out.as_bytes())
}

/// If `line` sets one of `keys`, return its index and the rewritten line
/// with the original indentation and key/value separator kept.
fn replacement_for(
    line: &str,
    keys: &[&str; 2],
    encryption_key: &str,
    hmac_key: &str,
) -> Option<(usize, String)> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') || trimmed.starts_with(';') {
        return None;
    }

    let indent = &line[..line.len() - trimmed.len()];
    let (key, rest) = trimmed.split_once(char::is_whitespace)?;
    let idx = keys.iter().position(|k| *k == key)?;

    let value = rest.trim_start();
    let sep = &rest[..rest.len() - value.len()];
    let new_value = if idx == 0 { encryption_key } else { hmac_key };

    Some((idx, format!("{indent}{key}{sep}{new_value}")))
}

fn split_line_ending(segment: &str) -> (&str, &str) {
    if let Some(stripped) = segment.strip_suffix("\r\n") {
        (stripped, "\r\n")
    } else if let Some(stripped) = segment.strip_suffix('\n') {
        (stripped, "\n")
    } else {
        (segment, "")
    }
}
