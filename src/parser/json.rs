//! JSON parser — flattens a document into `:`-delimited keys
//!
//! Objects contribute their property names as path segments, arrays their
//! zero-based indices. Scalars become strings (`null` becomes the empty
//! string). Empty nested objects/arrays keep their key with an empty value.
//! Duplicate property names anywhere in the document reject the whole parse.

use super::{join_key, strip_bom, ConfigMap, ConfigurationParser, ParseError};
use serde::de::{self, DeserializeSeed, MapAccess, SeqAccess, Visitor};
use std::collections::HashSet;
use std::fmt;

/// Built-in JSON parser
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonParser;

impl ConfigurationParser for JsonParser {
    fn parse(&self, input: &[u8]) -> std::result::Result<ConfigMap, ParseError> {
        let input = strip_bom(input);
        match input.iter().find(|b| !b.is_ascii_whitespace()) {
            None => return Ok(ConfigMap::new()),
            Some(b'{') => {}
            Some(_) => return Err(ParseError::InvalidRoot),
        }

        let mut state = FlattenState::default();
        let mut de = serde_json::Deserializer::from_slice(input);
        let outcome = Node {
            path: String::new(),
            state: &mut state,
        }
        .deserialize(&mut de)
        .and_then(|()| de.end());

        match outcome {
            Ok(()) => Ok(state.out),
            Err(e) => Err(match state.duplicate.take() {
                Some(key) => ParseError::DuplicateKey(key),
                None => ParseError::Json(e.to_string()),
            }),
        }
    }

    fn name(&self) -> &str {
        "json"
    }
}

/// Accumulated output. `duplicate` records why a visit aborted, since the
/// deserializer error type cannot carry it.
#[derive(Default)]
struct FlattenState {
    out: ConfigMap,
    duplicate: Option<String>,
}

impl FlattenState {
    fn insert<E: de::Error>(&mut self, key: String, value: String) -> std::result::Result<(), E> {
        if self.out.contains_key(&key) {
            return Err(self.reject_duplicate(key));
        }
        self.out.insert(key, value);
        Ok(())
    }

    fn reject_duplicate<E: de::Error>(&mut self, key: String) -> E {
        let err = E::custom(format!("duplicate key '{}'", key));
        self.duplicate = Some(key);
        err
    }
}

/// One JSON value located at `path`
struct Node<'a> {
    path: String,
    state: &'a mut FlattenState,
}

impl<'de, 'a> DeserializeSeed<'de> for Node<'a> {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<(), D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }
}

impl<'de, 'a> Visitor<'de> for Node<'a> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a JSON value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<(), E> {
        self.state.insert(self.path, v.to_string())
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<(), E> {
        self.state.insert(self.path, v.to_string())
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<(), E> {
        self.state.insert(self.path, v.to_string())
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<(), E> {
        self.state.insert(self.path, v.to_string())
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<(), E> {
        self.state.insert(self.path, v.to_owned())
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<(), E> {
        self.state.insert(self.path, String::new())
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        let Node { path, state } = self;
        let mut seen = HashSet::new();

        while let Some(key) = map.next_key::<String>()? {
            let child = join_key(&path, &key);
            if !seen.insert(key) {
                return Err(state.reject_duplicate(child));
            }
            map.next_value_seed(Node {
                path: child,
                state: &mut *state,
            })?;
        }

        if seen.is_empty() && !path.is_empty() {
            state.insert::<A::Error>(path, String::new())?;
        }
        Ok(())
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        let Node { path, state } = self;
        let mut index = 0usize;

        while seq
            .next_element_seed(Node {
                path: join_key(&path, &index.to_string()),
                state: &mut *state,
            })?
            .is_some()
        {
            index += 1;
        }

        if index == 0 {
            state.insert::<A::Error>(path, String::new())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> std::result::Result<ConfigMap, ParseError> {
        JsonParser.parse(input.as_bytes())
    }

    fn get<'a>(map: &'a ConfigMap, key: &str) -> Option<&'a str> {
        map.get(key).map(String::as_str)
    }

    #[test]
    fn test_nested_object() {
        let map = parse(r#"{"A":{"B":"1"}}"#).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(get(&map, "A:B"), Some("1"));
    }

    #[test]
    fn test_array_indices() {
        let map = parse(r#"{"A":[1,2]}"#).unwrap();
        assert_eq!(get(&map, "A:0"), Some("1"));
        assert_eq!(get(&map, "A:1"), Some("2"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_array_of_objects() {
        let map = parse(r#"{"Servers":[{"Host":"a","Port":80},{"Host":"b","Port":81}]}"#).unwrap();
        assert_eq!(get(&map, "Servers:0:Host"), Some("a"));
        assert_eq!(get(&map, "Servers:1:Port"), Some("81"));
    }

    #[test]
    fn test_scalar_rendering() {
        let map = parse(r#"{"t":true,"f":false,"n":null,"neg":-3,"pi":3.25,"s":"x"}"#).unwrap();
        assert_eq!(get(&map, "t"), Some("true"));
        assert_eq!(get(&map, "f"), Some("false"));
        assert_eq!(get(&map, "n"), Some(""));
        assert_eq!(get(&map, "neg"), Some("-3"));
        assert_eq!(get(&map, "pi"), Some("3.25"));
        assert_eq!(get(&map, "s"), Some("x"));
    }

    #[test]
    fn test_empty_containers_keep_key() {
        let map = parse(r#"{"Obj":{},"Arr":[]}"#).unwrap();
        assert_eq!(get(&map, "Obj"), Some(""));
        assert_eq!(get(&map, "Arr"), Some(""));
    }

    #[test]
    fn test_empty_document() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("  \n").unwrap().is_empty());
        assert!(parse("{}").unwrap().is_empty());
    }

    #[test]
    fn test_bom_is_ignored() {
        let map = JsonParser.parse(b"\xEF\xBB\xBF{\"A\":\"1\"}").unwrap();
        assert_eq!(get(&map, "A"), Some("1"));
    }

    #[test]
    fn test_duplicate_key_same_object() {
        let err = parse(r#"{"A":"1","A":"2"}"#).unwrap_err();
        assert_eq!(err, ParseError::DuplicateKey("A".into()));
    }

    #[test]
    fn test_duplicate_key_nested() {
        let err = parse(r#"{"A":{"B":"1","B":"2"}}"#).unwrap_err();
        assert_eq!(err, ParseError::DuplicateKey("A:B".into()));
    }

    #[test]
    fn test_duplicate_object_property() {
        let err = parse(r#"{"A":{"B":"1"},"A":{"C":"2"}}"#).unwrap_err();
        assert_eq!(err, ParseError::DuplicateKey("A".into()));
    }

    #[test]
    fn test_colliding_flattened_key() {
        let err = parse(r#"{"A:B":"1","A":{"B":"2"}}"#).unwrap_err();
        assert_eq!(err, ParseError::DuplicateKey("A:B".into()));
    }

    #[test]
    fn test_unterminated_object() {
        assert!(matches!(parse(r#"{"A":{"B":"1"}"#), Err(ParseError::Json(_))));
    }

    #[test]
    fn test_trailing_garbage() {
        assert!(matches!(parse(r#"{"A":"1"} x"#), Err(ParseError::Json(_))));
    }

    #[test]
    fn test_non_object_root() {
        assert_eq!(parse("[1,2]").unwrap_err(), ParseError::InvalidRoot);
        assert_eq!(parse("\"text\"").unwrap_err(), ParseError::InvalidRoot);
    }
}
