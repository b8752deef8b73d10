//! INI parser — line-oriented `key=value` with `[section]` prefixes
//!
//! Lines are trimmed. Blank lines and lines starting with `;`, `#` or `/`
//! are skipped. `[Section]` sets the key prefix for following lines; any
//! other line starting with `[` is rejected. Every other line must contain
//! `=`; the first `=` splits key from value. A value wrapped in double quotes
//! has the quotes removed.

use super::{join_key, strip_bom, ConfigMap, ConfigurationParser, ParseError};

/// Built-in INI parser
#[derive(Debug, Clone, Copy, Default)]
pub struct IniParser;

impl ConfigurationParser for IniParser {
    fn parse(&self, input: &[u8]) -> std::result::Result<ConfigMap, ParseError> {
        let text = std::str::from_utf8(strip_bom(input))?;
        let mut map = ConfigMap::new();
        let mut section = String::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with([';', '#', '/']) {
                continue;
            }

            if line.starts_with('[') {
                if line.len() < 2 || !line.ends_with(']') {
                    return Err(ParseError::UnrecognizedLine {
                        line: idx + 1,
                        content: line.to_string(),
                    });
                }
                section = line[1..line.len() - 1].trim().to_string();
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| ParseError::UnrecognizedLine {
                line: idx + 1,
                content: line.to_string(),
            })?;

            let key = join_key(&section, key.trim());
            let value = unquote(value.trim());

            if map.contains_key(&key) {
                return Err(ParseError::DuplicateKey(key));
            }
            map.insert(key, value.to_string());
        }

        Ok(map)
    }

    fn name(&self) -> &str {
        "ini"
    }
}

fn unquote(value: &str) -> &str {
    if value.len() > 1 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}
