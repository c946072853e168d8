//! Ordered HTTP header list.
//!
//! # Design Decisions
//! - Insertion order and duplicate names are preserved
//! - Names keep the case seen on the wire; lookups are case-insensitive
//! - Values are stored trimmed of surrounding whitespace

use bytes::{BufMut, BytesMut};

/// Header fields of one message, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of header fields, counting duplicates.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(name, value)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// First value for `name`.
    pub fn get<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.get_all(name).next()
    }

    /// Every value for `name`, in wire order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Append a field after all existing ones.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every field named `name` with a single one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// Remove every field named `name`, returning how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    /// Comma-separated list elements across every field named `name`.
    pub fn list_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Whether the list header `name` contains `token` (case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.list_values(name).any(|v| v.eq_ignore_ascii_case(token))
    }

    pub(crate) fn write_to(&self, out: &mut BytesMut) {
        for (name, value) in &self.entries {
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_ignore_case_and_keep_order() {
        let mut headers = Headers::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("Host", "example.com");
        headers.append("set-cookie", "b=2");

        assert_eq!(headers.get("HOST"), Some("example.com"));
        assert_eq!(headers.get_all("Set-Cookie").collect::<Vec<_>>(), vec!["a=1", "b=2"]);
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn lookup_outlives_the_name_argument() {
        let mut headers = Headers::new();
        headers.append("Upgrade", "websocket");
        let value = {
            let name = String::from("upgrade");
            headers.get(&name).map(str::to_owned)
        };
        assert_eq!(value.as_deref(), Some("websocket"));
        assert!(headers.contains("UPGRADE"));
    }

    #[test]
    fn set_replaces_all_duplicates() {
        let mut headers = Headers::new();
        headers.append("X-A", "1");
        headers.append("x-a", "2");
        headers.set("X-A", "3");

        assert_eq!(headers.get_all("x-a").collect::<Vec<_>>(), vec!["3"]);
    }

    #[test]
    fn tokens_span_fields_and_commas() {
        let mut headers = Headers::new();
        headers.append("Transfer-Encoding", "gzip");
        headers.append("Transfer-Encoding", "Chunked ");

        assert!(headers.has_token("transfer-encoding", "chunked"));
        assert_eq!(
            headers.list_values("transfer-encoding").last(),
            Some("Chunked")
        );
    }

    #[test]
    fn serializes_in_wire_order() {
        let mut headers = Headers::new();
        headers.append("Host", "a");
        headers.append("Accept", "*/*");
        let mut out = BytesMut::new();
        headers.write_to(&mut out);

        assert_eq!(&out[..], b"Host: a\r\nAccept: */*\r\n");
    }
}
