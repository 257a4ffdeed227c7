// src/client/decode.rs
// =============================================================================
// Body reading and charset decoding.
//
// read_capped() stops reading once max_body_size bytes have been collected.
// The rest of the body is simply not consumed.
//
// Decoding turns text bodies into UTF-8. The encoding comes from, in order:
// 1. an explicit label on the request (Request::encoding)
// 2. a byte order mark
// 3. the charset parameter of the Content-Type header
// 4. a <meta charset=...> / http-equiv declaration in the first 1024 bytes
// 5. UTF-8
// Bodies whose Content-Type is clearly not text are left alone.
// =============================================================================

use std::borrow::Cow;

use bytes::{Bytes, BytesMut};
use encoding_rs::{Encoding, UTF_8};
use futures::StreamExt;

use super::transport::BodyStream;
use crate::error::FetchError;

const META_PRESCAN_BYTES: usize = 1024;

pub async fn read_capped(mut body: BodyStream, limit: u64) -> Result<Bytes, FetchError> {
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    let mut buf = BytesMut::new();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        let remaining = limit - buf.len();

        if chunk.len() >= remaining {
            buf.extend_from_slice(&chunk[..remaining]);
            break;
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(buf.freeze())
}

// Decodes with an explicit label. Unknown labels leave the body untouched.
pub fn decode_with_label(body: Bytes, label: &str) -> Bytes {
    match Encoding::for_label(label.trim().as_bytes()) {
        Some(encoding) => decode_as(body, encoding),
        None => body,
    }
}

pub fn decode_detected(body: Bytes, content_type: Option<&str>) -> Bytes {
    if let Some(ct) = content_type {
        if !is_textual(ct) {
            return body;
        }
    }

    let encoding = Encoding::for_bom(&body)
        .map(|(encoding, _)| encoding)
        .or_else(|| {
            content_type
                .and_then(charset_from_content_type)
                .and_then(|label| Encoding::for_label(label.as_bytes()))
        })
        .or_else(|| prescan_meta(&body))
        .unwrap_or(UTF_8);

    decode_as(body, encoding)
}

fn decode_as(body: Bytes, encoding: &'static Encoding) -> Bytes {
    let (text, _, _) = encoding.decode(&body);
    match text {
        Cow::Borrowed(s) => body.slice_ref(s.as_bytes()),
        Cow::Owned(s) => Bytes::from(s.into_bytes()),
    }
}

fn is_textual(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.starts_with("text/")
        || ct.contains("html")
        || ct.contains("xml")
        || ct.contains("json")
        || ct.contains("javascript")
}

pub fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

fn prescan_meta(body: &[u8]) -> Option<&'static Encoding> {
    let head = &body[..body.len().min(META_PRESCAN_BYTES)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();

    let start = head.find("charset=")? + "charset=".len();
    let label: String = head[start..]
        .trim_start_matches(|c: char| c == '"' || c == '\'')
        .chars()
        .take_while(|c| !matches!(c, '"' | '\'' | ' ' | ';' | '>' | '/'))
        .collect();

    Encoding::for_label(label.as_bytes())
}
