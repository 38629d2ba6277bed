//! Request parameter and header serialization

use url::form_urlencoded;

use crate::models::{FileAttachment, HeaderValue, Headers, ParamValue, Params};

/// How a serialized payload has to be transmitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Query,
    Multipart,
}

/// A field of a multipart payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartField {
    Text(String),
    File(FileAttachment),
}

/// Serialized request parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Caller-supplied payload sent as is
    Raw(String),
    /// `application/x-www-form-urlencoded` string
    Query(String),
    /// Scalars and file handles for a multipart upload
    Multipart(Vec<(String, MultipartField)>),
}

impl Payload {
    pub fn encoding(&self) -> Encoding {
        match self {
            Payload::Raw(_) | Payload::Query(_) => Encoding::Query,
            Payload::Multipart(_) => Encoding::Multipart,
        }
    }

    /// String form of the payload; multipart payloads have none
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Raw(body) | Payload::Query(body) => Some(body),
            Payload::Multipart(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Raw(body) | Payload::Query(body) => body.is_empty(),
            Payload::Multipart(fields) => fields.is_empty(),
        }
    }
}

/// Serialize request parameters.
///
/// A text value under the reserved empty key short-circuits everything and
/// is returned verbatim. Otherwise scalars are form-encoded and decoded
/// again so the same logical map always produces the same bytes; any file
/// attachment turns the result into a multipart field list.
pub fn serialize(params: &Params) -> Payload {
    if let Some(raw) = params.raw_body() {
        return Payload::Raw(raw.to_string());
    }

    let mut scalars = Vec::new();
    let mut files = Vec::new();
    for (name, value) in params.iter() {
        match value {
            ParamValue::Text(text) => scalars.push((name, text.as_str())),
            ParamValue::File(file) => files.push((name.to_string(), file.clone())),
        }
    }

    let normalized = normalize(&scalars);

    if files.is_empty() {
        return Payload::Query(encode(
            normalized.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        ));
    }

    let mut fields: Vec<(String, MultipartField)> = normalized
        .into_iter()
        .map(|(name, value)| (name, MultipartField::Text(value)))
        .collect();
    for (name, file) in files {
        match fields.iter_mut().find(|(n, _)| *n == name) {
            Some(field) => field.1 = MultipartField::File(file),
            None => fields.push((name, MultipartField::File(file))),
        }
    }

    Payload::Multipart(fields)
}

/// Form-encode name/value pairs (`+` for space)
pub fn encode<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Decode a form-encoded string into name/value pairs, in order
pub fn decode(query: &str) -> Vec<(String, String)> {
    form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Encode, split and decode each element back; later keys replace earlier
/// ones without moving them.
fn normalize(scalars: &[(&str, &str)]) -> Vec<(String, String)> {
    let mut reconstructed: Vec<(String, String)> = Vec::new();
    if scalars.is_empty() {
        return reconstructed;
    }

    let encoded = encode(scalars.iter().copied());
    for element in encoded.split('&') {
        for (name, value) in decode(element) {
            match reconstructed.iter_mut().find(|(n, _)| *n == name) {
                Some(entry) => entry.1 = value,
                None => reconstructed.push((name, value)),
            }
        }
    }

    reconstructed
}

/// Expand headers into `(name, value)` lines; list values repeat the name
/// in list order.
pub fn header_lines(headers: &Headers) -> Vec<(String, String)> {
    let mut lines = Vec::new();
    for (name, value) in headers.iter() {
        match value {
            HeaderValue::Single(value) => lines.push((name.to_string(), value.clone())),
            HeaderValue::Multiple(values) => {
                lines.extend(values.iter().map(|v| (name.to_string(), v.clone())))
            }
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_scalars_to_query() {
        let params = Params::new()
            .with("q", "двухкомнатная квартира")
            .with("s", "0")
            .with("a&b", "c=d");

        let payload = serialize(&params);
        assert_eq!(payload.encoding(), Encoding::Query);
        assert_eq!(
            payload.as_str(),
            Some("q=%D0%B4%D0%B2%D1%83%D1%85%D0%BA%D0%BE%D0%BC%D0%BD%D0%B0%D1%82%D0%BD%D0%B0%D1%8F+%D0%BA%D0%B2%D0%B0%D1%80%D1%82%D0%B8%D1%80%D0%B0&s=0&a%26b=c%3Dd")
        );
    }

    #[test]
    fn test_serialize_round_trips_through_decode() {
        let params = Params::new()
            .with("name", "a b+c")
            .with("empty", "")
            .with("sym", "%/?#&=");

        let payload = serialize(&params);
        let decoded: Params = decode(payload.as_str().unwrap()).into_iter().collect();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_serialize_is_idempotent() {
        let params = Params::new().with("x", "1 2").with("y", "ü");
        assert_eq!(serialize(&params), serialize(&params));
    }

    #[test]
    fn test_serialize_raw_body_wins() {
        let params = Params::raw("{\"id\":7}").with("ignored", "1");
        assert_eq!(serialize(&params), Payload::Raw("{\"id\":7}".to_string()));
    }

    #[test]
    fn test_serialize_with_files_is_multipart() {
        let file = FileAttachment::new("/tmp/doc.pdf").with_mime("application/pdf");
        let params = Params::new().with("title", "a b").with("doc", file.clone());

        let payload = serialize(&params);
        assert_eq!(payload.encoding(), Encoding::Multipart);
        assert_eq!(
            payload,
            Payload::Multipart(vec![
                ("title".to_string(), MultipartField::Text("a b".to_string())),
                ("doc".to_string(), MultipartField::File(file)),
            ])
        );
    }

    #[test]
    fn test_serialize_empty_params() {
        let payload = serialize(&Params::new());
        assert!(payload.is_empty());
        assert_eq!(payload.as_str(), Some(""));
    }

    #[test]
    fn test_header_lines_expand_lists_in_order() {
        let headers = Headers::new()
            .with("Accept", "text/html")
            .with(
                "Cookie",
                vec!["a=1".to_string(), "b=2".to_string()],
            );

        assert_eq!(
            header_lines(&headers),
            vec![
                ("Accept".to_string(), "text/html".to_string()),
                ("Cookie".to_string(), "a=1".to_string()),
                ("Cookie".to_string(), "b=2".to_string()),
            ]
        );
    }
}
