//! Minimal extraction from S3 XML responses.
//!
//! The responses we read are flat and machine-generated, so tag scanning is
//! enough; no general XML parsing is attempted.

/// Text of every `<tag>…</tag>` element, in document order.
pub fn tag_values(xml: &str, tag: &str) -> Vec<String> {
    blocks(xml, tag).into_iter().map(unescape).collect()
}

/// Text of the first `<tag>…</tag>` element.
pub fn first_tag(xml: &str, tag: &str) -> Option<String> {
    blocks(xml, tag).into_iter().next().map(unescape)
}

/// Raw inner content of every `<tag>…</tag>` element.
pub fn blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut found = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find(&open) {
        remaining = &remaining[start + open.len()..];
        match remaining.find(&close) {
            Some(end) => {
                found.push(&remaining[..end]);
                remaining = &remaining[end + close.len()..];
            }
            None => break,
        }
    }
    found
}

/// Decode the five predefined XML entities.
pub fn unescape(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Escape text for inclusion in an element body.
pub fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// `Code: Message` from an S3 `<Error>` document, if present.
pub fn error_message(xml: &str) -> Option<String> {
    let message = first_tag(xml, "Message");
    let code = first_tag(xml, "Code");
    match (code, message) {
        (Some(code), Some(message)) => Some(format!("{}: {}", code, message)),
        (None, Some(message)) => Some(message),
        (Some(code), None) => Some(code),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_contents() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <IsTruncated>false</IsTruncated>
  <Contents><Key>backups/a&amp;b.zip</Key><Size>10</Size></Contents>
  <Contents><Key>backups/c.zip</Key><Size>20</Size></Contents>
</ListBucketResult>"#;
        let contents = blocks(xml, "Contents");
        assert_eq!(contents.len(), 2);
        assert_eq!(first_tag(contents[0], "Key").unwrap(), "backups/a&b.zip");
        assert_eq!(tag_values(xml, "Size"), vec!["10", "20"]);
        assert_eq!(first_tag(xml, "IsTruncated").unwrap(), "false");
    }

    #[test]
    fn test_error_message() {
        let xml = "<Error><Code>NoSuchBucket</Code><Message>The specified bucket does not exist</Message></Error>";
        assert_eq!(
            error_message(xml).unwrap(),
            "NoSuchBucket: The specified bucket does not exist"
        );
        assert!(error_message("<html></html>").is_none());
    }

    #[test]
    fn test_escape_roundtrip() {
        let text = "a<b>&\"c\"";
        assert_eq!(unescape(&escape(text)), text);
    }
}
