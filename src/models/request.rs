use std::path::PathBuf;

use crate::client::url;

/// Parameter key whose text value is sent verbatim as the request payload
pub const RAW_BODY_KEY: &str = "";

/// A file to upload as part of a multipart request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttachment {
    pub path: PathBuf,
    pub mime: Option<String>,
    pub upload_name: Option<String>,
}

impl FileAttachment {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mime: None,
            upload_name: None,
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn with_upload_name(mut self, name: impl Into<String>) -> Self {
        self.upload_name = Some(name.into());
        self
    }

    /// Name presented to the server: the upload name, else the file's own name
    pub fn file_name(&self) -> String {
        self.upload_name.clone().unwrap_or_else(|| {
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }
}

/// A single request parameter value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Text(String),
    File(FileAttachment),
}

impl ParamValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(value) => Some(value),
            ParamValue::File(_) => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

impl From<FileAttachment> for ParamValue {
    fn from(value: FileAttachment) -> Self {
        ParamValue::File(value)
    }
}

/// Insertion-ordered parameter map. Re-inserting a key replaces its value
/// in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(String, ParamValue)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Params carrying only a raw payload
    pub fn raw(body: impl Into<String>) -> Self {
        Self::new().with(RAW_BODY_KEY, body.into())
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<ParamValue> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    /// Raw payload override, if the reserved key holds text
    pub fn raw_body(&self) -> Option<&str> {
        self.get(RAW_BODY_KEY).and_then(ParamValue::as_text)
    }

    /// Merge `other` into self; its values win on key collision
    pub fn extend(&mut self, other: Params) {
        for (key, value) in other.entries {
            self.insert(key, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<ParamValue>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (key, value) in iter {
            params.insert(key, value);
        }
        params
    }
}

/// Header value: a list expands into repeated header lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Single(String),
    Multiple(Vec<String>),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Single(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Single(value)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(values: Vec<String>) -> Self {
        HeaderValue::Multiple(values)
    }
}

/// Insertion-ordered request headers, names compared case-insensitively
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, HeaderValue)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<HeaderValue>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Add one more value under `name`, turning a single value into a list
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some((_, existing)) => {
                *existing = match std::mem::replace(existing, HeaderValue::Multiple(Vec::new())) {
                    HeaderValue::Single(first) => HeaderValue::Multiple(vec![first, value]),
                    HeaderValue::Multiple(mut values) => {
                        values.push(value);
                        HeaderValue::Multiple(values)
                    }
                };
            }
            None => self.entries.push((name, HeaderValue::Single(value))),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The target of one logical fetch, possibly spanning many proxy attempts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSpec {
    pub url: String,
    pub params: Params,
    pub headers: Headers,
}

impl RequestSpec {
    pub fn new(url: &str, params: Params, headers: Headers) -> Self {
        let mut spec = Self::default();
        spec.set_request(url, params, headers, Vec::new());
        spec
    }

    /// Point the request somewhere else.
    ///
    /// `url` is resolved against the current URL, its query string is folded
    /// into the parameters (explicit `params` win on collision), `files` are
    /// attached as upload fields and the headers are replaced.
    pub fn set_request(
        &mut self,
        url: &str,
        params: Params,
        headers: Headers,
        files: Vec<(String, FileAttachment)>,
    ) {
        let merged = url::merge(&self.url, url);
        let mut request: Params = merged.query_pairs().into_iter().collect();
        self.url = merged.url;

        request.extend(params);
        for (name, file) in files {
            request.insert(name, file);
        }

        self.params = request;
        self.headers = headers;
    }
}
