//! Replays ammo against the connection handler and checks the answers.
//!
//! Every entry gets a fresh in-memory connection served by
//! [`serve_connection`], the same code path the TCP listener uses.

use std::{io, path::Path, time::Duration};

use bytes::{Buf as _, Bytes, BytesMut};
use hyper::{
    header::{self, HeaderName, HeaderValue},
    HeaderMap, Method, StatusCode,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWriteExt as _},
    time::timeout,
};
use tracing::Instrument as _;

use crate::{
    ammo::{parse_ammo, parse_answers, Ammo, AmmoError, Answer},
    listener::serve_connection,
    responder::wants_close,
};

const STEP_TIMEOUT: Duration = Duration::from_secs(2);
const DUPLEX_CAPACITY: usize = 64 * 1024;
const MAX_RESPONSE_HEAD: usize = 16 * 1024;
const MAX_HEADERS: usize = 32;

/// One raw response as read off the wire.
#[derive(Debug)]
pub struct Exchange {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Exchange {
    pub fn connection_close(&self) -> bool {
        wants_close(&self.headers)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error(transparent)]
    Fixture(#[from] AmmoError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(#[from] httparse::Error),
    #[error("invalid response header: {0}")]
    InvalidHeader(String),
    #[error("response head exceeds {MAX_RESPONSE_HEAD} bytes")]
    HeadTooLarge,
    #[error("chunked responses are not supported")]
    Chunked,
    #[error("connection closed before the response was complete")]
    UnexpectedEof,
    #[error("timed out {0}")]
    Timeout(&'static str),
    #[error("server task failed: {0}")]
    Server(#[from] tokio::task::JoinError),
    #[error("{ammo} ammo entries but {answers} answers")]
    CountMismatch { ammo: usize, answers: usize },
    #[error("entry {index} ({name}): ammo is {ammo:?} but answer is {answer:?}")]
    OutOfStep {
        index: usize,
        name: String,
        ammo: String,
        answer: String,
    },
    #[error("entry {index} ({name}): unexpected {what}: {actual:?}, expecting {expected:?}")]
    Mismatch {
        index: usize,
        name: String,
        what: &'static str,
        expected: String,
        actual: String,
    },
}

/// Reads ammo and answers from disk and replays them. Returns the number of
/// entries replayed.
pub async fn replay_files(
    ammo_path: impl AsRef<Path>,
    answers_path: impl AsRef<Path>,
) -> Result<usize, ReplayError> {
    let ammo = parse_ammo(&tokio::fs::read(ammo_path).await?)?;
    let answers = parse_answers(&tokio::fs::read_to_string(answers_path).await?)?;
    replay(&ammo, &answers).await
}

/// Replays `ammo` in order, comparing each response with the answer at the
/// same position. Stops at the first mismatch.
pub async fn replay(ammo: &[Ammo], answers: &[Answer]) -> Result<usize, ReplayError> {
    if ammo.len() != answers.len() {
        return Err(ReplayError::CountMismatch {
            ammo: ammo.len(),
            answers: answers.len(),
        });
    }

    for (index, (entry, answer)) in ammo.iter().zip(answers).enumerate() {
        let span = tracing::debug_span!("replay", index, name = %entry.name);
        replay_entry(index, entry, answer).instrument(span).await?;
    }

    Ok(ammo.len())
}

async fn replay_entry(index: usize, entry: &Ammo, answer: &Answer) -> Result<(), ReplayError> {
    if entry.method != answer.method || entry.path != answer.uri {
        return Err(ReplayError::OutOfStep {
            index,
            name: entry.name.clone(),
            ammo: format!("{} {}", entry.method, entry.path),
            answer: format!("{} {}", answer.method, answer.uri),
        });
    }

    let exchange = exchange(&entry.request).await?;
    let mismatch = |what, expected: String, actual: String| ReplayError::Mismatch {
        index,
        name: entry.name.clone(),
        what,
        expected,
        actual,
    };

    if exchange.status.as_u16() != answer.status {
        return Err(mismatch(
            "status code",
            answer.status.to_string(),
            exchange.status.as_u16().to_string(),
        ));
    }
    if exchange.body != answer.body.as_bytes() {
        return Err(mismatch(
            "body",
            answer.body.clone(),
            String::from_utf8_lossy(&exchange.body).into_owned(),
        ));
    }
    if entry.close && !exchange.connection_close() {
        return Err(mismatch(
            "connection header",
            "close".to_owned(),
            header_str(&exchange.headers, header::CONNECTION),
        ));
    }
    tracing::debug!(message = "Replayed entry", status = answer.status);
    Ok(())
}

/// Sends one raw request over a fresh in-memory connection and reads the
/// response. Waits for the server side to wind down after the client hangs up.
pub async fn exchange(request: &[u8]) -> Result<Exchange, ReplayError> {
    let method = request_method(request);
    let (mut client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
    let server = tokio::spawn(serve_connection(server));

    timeout(STEP_TIMEOUT, client.write_all(request))
        .await
        .map_err(|_| ReplayError::Timeout("writing request"))??;
    let exchange = timeout(STEP_TIMEOUT, read_exchange(&mut client, &method))
        .await
        .map_err(|_| ReplayError::Timeout("reading response"))??;
    drop(client);

    let served = timeout(STEP_TIMEOUT, server)
        .await
        .map_err(|_| ReplayError::Timeout("closing connection"))??;
    if let Err(err) = served {
        tracing::debug!(message = "Connection ended with error", error = %err);
    }
    Ok(exchange)
}

/// Reads exactly one HTTP/1.x response to a `method` request from `stream`.
///
/// Responses to HEAD and 1xx/204/304 responses have no body whatever their
/// `content-length` says. Otherwise the body is delimited by
/// `content-length`, or by end of stream if there is none. Bytes past the end
/// of the response are discarded.
pub async fn read_exchange<S>(stream: &mut S, method: &Method) -> Result<Exchange, ReplayError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    let (head_len, status, headers) = loop {
        if let Some(head) = parse_response_head(&buf)? {
            break head;
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(ReplayError::HeadTooLarge);
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(ReplayError::UnexpectedEof);
        }
    };
    buf.advance(head_len);

    if *method == Method::HEAD || is_bodyless(status) {
        return Ok(Exchange {
            status,
            headers,
            body: Bytes::new(),
        });
    }
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return Err(ReplayError::Chunked);
    }
    let content_length = match headers.get(header::CONTENT_LENGTH) {
        Some(value) => Some(
            value
                .to_str()
                .ok()
                .and_then(|value| value.trim().parse::<usize>().ok())
                .ok_or_else(|| ReplayError::InvalidHeader("content-length".to_owned()))?,
        ),
        None => None,
    };

    let body = match content_length {
        Some(len) => {
            while buf.len() < len {
                if stream.read_buf(&mut buf).await? == 0 {
                    return Err(ReplayError::UnexpectedEof);
                }
            }
            buf.split_to(len).freeze()
        }
        None => {
            while stream.read_buf(&mut buf).await? != 0 {}
            buf.freeze()
        }
    };

    Ok(Exchange {
        status,
        headers,
        body,
    })
}

fn is_bodyless(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// The method of a raw request, GET if it cannot be read.
fn request_method(request: &[u8]) -> Method {
    request
        .split(|&b| b == b' ')
        .next()
        .and_then(|token| Method::from_bytes(token).ok())
        .unwrap_or(Method::GET)
}

fn parse_response_head(
    buf: &[u8],
) -> Result<Option<(usize, StatusCode, HeaderMap)>, ReplayError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let head_len = match response.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let status = response
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| ReplayError::InvalidHeader("status".to_owned()))?;
    let mut map = HeaderMap::with_capacity(response.headers.len());
    for header in response.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| ReplayError::InvalidHeader(header.name.to_owned()))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| ReplayError::InvalidHeader(header.name.to_owned()))?;
        map.append(name, value);
    }
    Ok(Some((head_len, status, map)))
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> String {
    headers
        .get(name)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responder::{CONTENT_TYPE, SERVER_NAME};

    fn ammo(name: &str, request: &str) -> anyhow::Result<Vec<Ammo>> {
        Ok(parse_ammo(format!("{name}\n{request}").as_bytes())?)
    }

    fn answer(method: &str, uri: &str, status: u16, body: &str) -> Answer {
        Answer {
            method: method.to_owned(),
            uri: uri.to_owned(),
            status,
            body: body.to_owned(),
        }
    }

    #[tokio::test]
    async fn get_root_in_memory() -> anyhow::Result<()> {
        let exchange = exchange(b"GET / HTTP/1.1\r\nHost: aa\r\n\r\n").await?;
        assert_eq!(exchange.status, StatusCode::OK);
        assert_eq!(exchange.body, "1");
        assert_eq!(exchange.headers[header::CONTENT_LENGTH], "1");
        assert_eq!(exchange.headers[header::CONTENT_TYPE], CONTENT_TYPE);
        assert_eq!(exchange.headers[header::SERVER], SERVER_NAME);
        assert!(!exchange.connection_close());
        Ok(())
    }

    #[tokio::test]
    async fn post_anything_in_memory() -> anyhow::Result<()> {
        let request = b"POST /anything HTTP/1.1\r\nHost: aa\r\nContent-Length: 7\r\n\r\npayload";
        let exchange = exchange(request).await?;
        assert_eq!(exchange.status, StatusCode::OK);
        assert_eq!(exchange.body, "1");
        Ok(())
    }

    #[tokio::test]
    async fn close_requested_close_answered() -> anyhow::Result<()> {
        let exchange = exchange(b"GET /x HTTP/1.1\r\nHost: aa\r\nConnection: close\r\n\r\n").await?;
        assert!(exchange.connection_close());
        assert_eq!(exchange.body, "1");
        Ok(())
    }

    #[tokio::test]
    async fn replay_matches() -> anyhow::Result<()> {
        let ammo = ammo(
            "filter",
            "GET /accounts/filter/?sex_eq=f&limit=2 HTTP/1.1\r\nHost: aa\r\nConnection: close\r\n\r\n",
        )?;
        let answers = [answer("GET", "/accounts/filter/?sex_eq=f&limit=2", 200, "1")];
        assert_eq!(replay(&ammo, &answers).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn replay_reports_wrong_body() -> anyhow::Result<()> {
        let ammo = ammo("root", "GET / HTTP/1.1\r\nHost: aa\r\n\r\n")?;
        let answers = [answer("GET", "/", 200, "2")];
        match replay(&ammo, &answers).await {
            Err(ReplayError::Mismatch {
                name,
                what,
                expected,
                actual,
                ..
            }) => {
                assert_eq!(name, "root");
                assert_eq!(what, "body");
                assert_eq!(expected, "2");
                assert_eq!(actual, "1");
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn replay_reports_wrong_status() -> anyhow::Result<()> {
        let ammo = ammo("missing", "GET /accounts/0/ HTTP/1.1\r\nHost: aa\r\n\r\n")?;
        let answers = [answer("GET", "/accounts/0/", 404, "")];
        assert!(matches!(
            replay(&ammo, &answers).await,
            Err(ReplayError::Mismatch {
                what: "status code",
                ..
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn replay_checks_pairing() -> anyhow::Result<()> {
        let ammo = ammo("root", "GET / HTTP/1.1\r\nHost: aa\r\n\r\n")?;
        assert!(matches!(
            replay(&ammo, &[answer("GET", "/other", 200, "1")]).await,
            Err(ReplayError::OutOfStep { index: 0, .. })
        ));
        assert!(matches!(
            replay(&ammo, &[]).await,
            Err(ReplayError::CountMismatch {
                ammo: 1,
                answers: 0
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn read_exchange_without_content_length_reads_to_eof() -> anyhow::Result<()> {
        let mut raw: &[u8] = b"HTTP/1.0 200 OK\r\nServer: x\r\n\r\nsome body";
        let exchange = read_exchange(&mut raw, &Method::GET).await?;
        assert_eq!(exchange.status, StatusCode::OK);
        assert_eq!(exchange.body, "some body");
        Ok(())
    }

    #[tokio::test]
    async fn read_exchange_truncated_body() {
        let mut raw: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nab";
        assert!(matches!(
            read_exchange(&mut raw, &Method::GET).await,
            Err(ReplayError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn head_in_memory_has_no_body() -> anyhow::Result<()> {
        let exchange = exchange(b"HEAD / HTTP/1.1\r\nHost: aa\r\n\r\n").await?;
        assert_eq!(exchange.status, StatusCode::OK);
        assert!(exchange.body.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn replay_head_with_close() -> anyhow::Result<()> {
        let ammo = ammo(
            "head",
            "HEAD /x HTTP/1.1\r\nHost: aa\r\nConnection: close\r\n\r\n",
        )?;
        let answers = [answer("HEAD", "/x", 200, "")];
        assert_eq!(replay(&ammo, &answers).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn read_exchange_bodyless_status_ignores_content_length() -> anyhow::Result<()> {
        let mut raw: &[u8] = b"HTTP/1.1 304 Not Modified\r\nContent-Length: 5\r\n\r\n";
        let exchange = read_exchange(&mut raw, &Method::GET).await?;
        assert_eq!(exchange.status, StatusCode::NOT_MODIFIED);
        assert!(exchange.body.is_empty());
        Ok(())
    }

    #[test]
    fn method_of_raw_request() {
        assert_eq!(request_method(b"HEAD / HTTP/1.1\r\n\r\n"), Method::HEAD);
        assert_eq!(request_method(b"POST /x HTTP/1.1\r\n\r\n"), Method::POST);
    }
}
