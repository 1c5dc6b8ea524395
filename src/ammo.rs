//! Ammo and answer fixtures.
//!
//! An ammo file is a list of named raw requests: a name line, the request
//! head up to the blank line, then `Content-Length` bytes of body if the head
//! declares one. An answer file has one tab-separated line per request:
//! method, URI, expected status and expected body.

use std::borrow::Cow;

use bytes::Bytes;

const HEAD_END: &[u8] = b"\r\n\r\n";
const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone)]
pub struct Ammo {
    pub name: String,
    pub method: String,
    pub path: String,
    /// The request asked for `Connection: close`.
    pub close: bool,
    /// Exactly what gets written to the connection.
    pub request: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub method: String,
    pub uri: String,
    pub status: u16,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AmmoError {
    #[error("ammo entry {index}: missing name line")]
    MissingName { index: usize },
    #[error("ammo entry {index} ({name}): invalid request: {source}")]
    InvalidRequest {
        index: usize,
        name: String,
        #[source]
        source: httparse::Error,
    },
    #[error("ammo entry {index} ({name}): incomplete request head")]
    IncompleteRequest { index: usize, name: String },
    #[error("ammo entry {index} ({name}): invalid content-length")]
    InvalidContentLength { index: usize, name: String },
    #[error("ammo entry {index} ({name}): body has {actual} bytes, expected {expected}")]
    ShortBody {
        index: usize,
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("answer line {line}: expected method, uri and status separated by tabs")]
    MissingField { line: usize },
    #[error("answer line {line}: invalid status {status:?}")]
    InvalidStatus { line: usize, status: String },
}

pub fn parse_ammo(data: &[u8]) -> Result<Vec<Ammo>, AmmoError> {
    let mut entries = Vec::new();
    let mut rest = trim_start_newlines(data);

    while !rest.is_empty() {
        let index = entries.len();
        let Some(name_end) = rest.iter().position(|&b| b == b'\n') else {
            return Err(AmmoError::MissingName { index });
        };
        let name = String::from_utf8_lossy(&rest[..name_end])
            .trim_end_matches('\r')
            .to_owned();
        rest = &rest[name_end + 1..];

        let (head, after_head): (Cow<[u8]>, &[u8]) = match find(rest, HEAD_END) {
            Some(pos) => {
                let (head, after) = rest.split_at(pos + HEAD_END.len());
                (Cow::Borrowed(head), after)
            }
            None => {
                let mut head = trim_end_newlines(rest).to_vec();
                head.extend_from_slice(HEAD_END);
                (Cow::Owned(head), &[][..])
            }
        };

        let head_info = parse_head(&head).map_err(|err| match err {
            HeadError::Invalid(source) => AmmoError::InvalidRequest {
                index,
                name: name.clone(),
                source,
            },
            HeadError::Incomplete => AmmoError::IncompleteRequest {
                index,
                name: name.clone(),
            },
            HeadError::ContentLength => AmmoError::InvalidContentLength {
                index,
                name: name.clone(),
            },
        })?;

        let body_len = head_info.content_length.unwrap_or(0);
        if after_head.len() < body_len {
            return Err(AmmoError::ShortBody {
                index,
                name,
                expected: body_len,
                actual: after_head.len(),
            });
        }
        let (body, after_body) = after_head.split_at(body_len);

        let mut request = Vec::with_capacity(head.len() + body.len());
        request.extend_from_slice(&head);
        request.extend_from_slice(body);

        entries.push(Ammo {
            name,
            method: head_info.method,
            path: head_info.path,
            close: head_info.close,
            request: Bytes::from(request),
        });
        rest = trim_start_newlines(after_body);
    }

    Ok(entries)
}

pub fn parse_answers(text: &str) -> Result<Vec<Answer>, AmmoError> {
    let mut answers = Vec::new();
    for (line_index, line) in text.lines().enumerate() {
        let line_number = line_index + 1;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.splitn(4, '\t');
        let (Some(method), Some(uri), Some(status)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(AmmoError::MissingField { line: line_number });
        };
        let status = status
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|code| (100..1000).contains(code))
            .ok_or_else(|| AmmoError::InvalidStatus {
                line: line_number,
                status: status.to_owned(),
            })?;
        answers.push(Answer {
            method: method.to_owned(),
            uri: uri.to_owned(),
            status,
            body: fields.next().unwrap_or_default().to_owned(),
        });
    }
    Ok(answers)
}

struct HeadInfo {
    method: String,
    path: String,
    close: bool,
    content_length: Option<usize>,
}

enum HeadError {
    Invalid(httparse::Error),
    Incomplete,
    ContentLength,
}

fn parse_head(head: &[u8]) -> Result<HeadInfo, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    if req.parse(head).map_err(HeadError::Invalid)?.is_partial() {
        return Err(HeadError::Incomplete);
    }

    let mut close = false;
    let mut content_length = None;
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("connection") {
            close |= std::str::from_utf8(header.value)
                .map(|value| {
                    value
                        .split(',')
                        .any(|token| token.trim().eq_ignore_ascii_case("close"))
                })
                .unwrap_or(false);
        } else if header.name.eq_ignore_ascii_case("content-length") {
            let length = std::str::from_utf8(header.value)
                .ok()
                .and_then(|value| value.trim().parse::<usize>().ok())
                .ok_or(HeadError::ContentLength)?;
            content_length = Some(length);
        }
    }

    Ok(HeadInfo {
        method: req.method.unwrap_or_default().to_owned(),
        path: req.path.unwrap_or_default().to_owned(),
        close,
        content_length,
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn trim_start_newlines(mut data: &[u8]) -> &[u8] {
    while let [b'\r' | b'\n', rest @ ..] = data {
        data = rest;
    }
    data
}

fn trim_end_newlines(mut data: &[u8]) -> &[u8] {
    while let [rest @ .., b'\r' | b'\n'] = data {
        data = rest;
    }
    data
}
