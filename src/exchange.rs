//! Request/response exchange in buffered or streaming mode.

use crate::llm::{Frame, Provider};
use crate::markup;
use crate::request::NormalizedRequest;
use crate::transport::{Transport, TransportResponse};
use reqwest::StatusCode;
use std::io::{self, Write};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio_util::io::StreamReader;

/// Longest stream line kept in memory; longer lines are dropped.
const MAX_LINE_BYTES: u64 = 64 * 1024;

/// Failure of a single exchange. None of these are retried.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to send request: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("API returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Decode(String),

    #[error("API returned an empty response")]
    EmptyResponse,

    #[error("failed to read response: {0}")]
    Read(#[from] io::Error),
}

/// Drives one exchange against a provider over a transport.
pub struct Exchange<T> {
    provider: Provider,
    transport: T,
}

impl<T: Transport> Exchange<T> {
    pub fn new(provider: Provider, transport: T) -> Self {
        Self {
            provider,
            transport,
        }
    }

    /// Run the exchange and return the untranslated answer.
    ///
    /// In streaming mode every fragment is rendered and written to `out` as
    /// it arrives. In buffered mode nothing is written; rendering the
    /// returned answer is up to the caller.
    pub async fn execute<W: Write>(
        &self,
        request: &NormalizedRequest,
        out: &mut W,
    ) -> Result<String, ExchangeError> {
        let body = self.provider.encode_request(request)?;
        tracing::debug!(
            provider = self.provider.name(),
            model = %request.model,
            system_prompt = %request.system_prompt,
            question = %request.user_text,
            "sending question"
        );

        let response = self.transport.post(body, request.streaming).await?;
        if request.streaming {
            self.consume_stream(response, out).await
        } else {
            self.consume_buffered(response).await
        }
    }

    async fn consume_buffered(&self, response: TransportResponse) -> Result<String, ExchangeError> {
        let status = response.status;
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        self.provider.decode_buffered(&body)
    }

    async fn consume_stream<W: Write>(
        &self,
        response: TransportResponse,
        out: &mut W,
    ) -> Result<String, ExchangeError> {
        if !response.status.is_success() {
            let status = response.status;
            let body = response.bytes().await?;
            return Err(status_error(status, &body));
        }

        let mut reader = StreamReader::new(response.body);
        let mut buf = Vec::new();
        let mut answer = String::new();

        loop {
            buf.clear();
            let read = (&mut reader)
                .take(MAX_LINE_BYTES)
                .read_until(b'\n', &mut buf)
                .await?;
            if read == 0 {
                break;
            }
            if buf.last() != Some(&b'\n') && read as u64 == MAX_LINE_BYTES {
                tracing::debug!(limit = MAX_LINE_BYTES, "skipping oversized stream line");
                skip_rest_of_line(&mut reader).await?;
                continue;
            }

            // Bad bytes become U+FFFD rather than ending the stream.
            let line = String::from_utf8_lossy(trim_line_end(&buf));
            if line.is_empty() {
                continue;
            }
            match self.provider.decode_stream_frame(&line) {
                Frame::Delta(fragment) => {
                    // Each fragment is rendered on its own; a tag split
                    // across fragments is printed literally.
                    out.write_all(markup::render(&fragment).as_bytes())?;
                    out.flush()?;
                    answer.push_str(&fragment);
                }
                Frame::Ignored => {}
                Frame::Done => break,
            }
        }

        tracing::debug!(chars = answer.chars().count(), "stream finished");
        Ok(answer)
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Discard input up to and including the next newline.
async fn skip_rest_of_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<()> {
    loop {
        let (consumed, found) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            }
        };
        reader.consume(consumed);
        if found {
            return Ok(());
        }
    }
}

fn status_error(status: StatusCode, body: &[u8]) -> ExchangeError {
    let body = String::from_utf8_lossy(body).into_owned();
    tracing::debug!(%status, body = %body, "API returned an error");
    ExchangeError::Status { status, body }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::llm::create_provider;
    use crate::transport::HttpTransport;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use reqwest::header::HeaderMap;
    use std::sync::Mutex;

    /// Replays canned chunks and records what was posted.
    struct FakeTransport {
        status: StatusCode,
        chunks: Vec<Bytes>,
        sent: Mutex<Vec<(Vec<u8>, bool)>>,
    }

    impl FakeTransport {
        fn new(status: u16, chunks: Vec<&'static str>) -> Self {
            Self::with_raw_chunks(status, chunks.into_iter().map(Vec::from).collect())
        }

        fn with_raw_chunks(status: u16, chunks: Vec<Vec<u8>>) -> Self {
            Self {
                status: StatusCode::from_u16(status).unwrap(),
                chunks: chunks.into_iter().map(Bytes::from).collect(),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn post(
            &self,
            body: Vec<u8>,
            streaming: bool,
        ) -> Result<TransportResponse, ExchangeError> {
            self.sent.lock().unwrap().push((body, streaming));
            let chunks: Vec<io::Result<Bytes>> = self.chunks.iter().cloned().map(Ok).collect();
            Ok(TransportResponse {
                status: self.status,
                body: futures::stream::iter(chunks).boxed(),
            })
        }
    }

    /// Records each write separately so emission order is observable.
    #[derive(Default)]
    struct RecordingSink {
        writes: Vec<String>,
    }

    impl Write for RecordingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes.push(String::from_utf8_lossy(buf).into_owned());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn exchange(provider: &str, transport: FakeTransport) -> Exchange<FakeTransport> {
        let config = Config::parse(&format!("provider = {provider}")).unwrap();
        Exchange::new(create_provider(&config), transport)
    }

    fn request(streaming: bool) -> NormalizedRequest {
        NormalizedRequest {
            model: "m".to_string(),
            system_prompt: "sys".to_string(),
            user_text: "hi".to_string(),
            streaming,
        }
    }

    #[tokio::test]
    async fn test_streaming_accumulates_and_emits_in_order() {
        let exchange = exchange(
            "openai",
            FakeTransport::new(
                200,
                vec![
                    "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n",
                    "data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n",
                    "data: [DONE]\n\n",
                ],
            ),
        );
        let mut sink = RecordingSink::default();

        let answer = exchange.execute(&request(true), &mut sink).await.unwrap();
        assert_eq!(answer, "Hello");
        assert_eq!(sink.writes, vec!["He", "llo"]);

        let sent = exchange.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1);
    }

    #[tokio::test]
    async fn test_streaming_renders_each_fragment() {
        let exchange = exchange(
            "openai",
            FakeTransport::new(
                200,
                vec!["data: {\"choices\":[{\"delta\":{\"content\":\"<red>x</red>\"}}]}\n"],
            ),
        );
        let mut sink = RecordingSink::default();

        let answer = exchange.execute(&request(true), &mut sink).await.unwrap();
        assert_eq!(answer, "<red>x</red>");
        assert_eq!(sink.writes, vec!["\x1b[31mx\x1b[0m"]);
    }

    #[tokio::test]
    async fn test_streaming_tag_split_across_fragments_is_not_reassembled() {
        let exchange = exchange(
            "openai",
            FakeTransport::new(
                200,
                vec![
                    "data: {\"choices\":[{\"delta\":{\"content\":\"<re\"}}]}\n",
                    "data: {\"choices\":[{\"delta\":{\"content\":\"d>hi\"}}]}\n",
                    "data: [DONE]\n",
                ],
            ),
        );
        let mut sink = RecordingSink::default();

        let answer = exchange.execute(&request(true), &mut sink).await.unwrap();
        assert_eq!(answer, "<red>hi");
        assert_eq!(sink.writes.concat(), "<red>hi");
    }

    #[tokio::test]
    async fn test_streaming_skips_malformed_frames() {
        let exchange = exchange(
            "openai",
            FakeTransport::new(
                200,
                vec![
                    "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
                    "data: {\"choices\":[{\"delta\":\n",
                    "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
                ],
            ),
        );
        let answer = exchange
            .execute(&request(true), &mut RecordingSink::default())
            .await
            .unwrap();
        assert_eq!(answer, "ab");
    }

    #[tokio::test]
    async fn test_streaming_lines_split_across_chunks() {
        let exchange = exchange(
            "openai",
            FakeTransport::new(
                200,
                vec![
                    "data: {\"choices\":[{\"del",
                    "ta\":{\"content\":\"Hel\"}}]}\r\n\r\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}",
                    "\r\n\r\ndata: [DO",
                    "NE]\r\n",
                ],
            ),
        );
        let mut sink = RecordingSink::default();

        let answer = exchange.execute(&request(true), &mut sink).await.unwrap();
        assert_eq!(answer, "Hello");
        assert_eq!(sink.writes, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_streaming_survives_invalid_utf8_frame() {
        let mut bad = b"data: {\"choices\":[{\"delta\":{\"content\":\"".to_vec();
        bad.extend_from_slice(&[0xff, 0xfe]);
        bad.extend_from_slice(b"\"}}]}\n");
        let exchange = exchange(
            "openai",
            FakeTransport::with_raw_chunks(
                200,
                vec![
                    b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n".to_vec(),
                    bad,
                    b"data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n".to_vec(),
                    b"data: [DONE]\n".to_vec(),
                ],
            ),
        );
        let mut sink = RecordingSink::default();

        let answer = exchange.execute(&request(true), &mut sink).await.unwrap();
        assert_eq!(answer, "a\u{FFFD}\u{FFFD}b");
        assert_eq!(sink.writes, vec!["a", "\u{FFFD}\u{FFFD}", "b"]);
    }

    #[tokio::test]
    async fn test_streaming_drops_oversized_line() {
        let mut huge = b"data: {\"choices\":[{\"delta\":{\"content\":\"".to_vec();
        huge.resize(huge.len() + 2 * MAX_LINE_BYTES as usize, b'x');
        huge.extend_from_slice(b"\"}}]}\n");
        let exchange = exchange(
            "openai",
            FakeTransport::with_raw_chunks(
                200,
                vec![
                    b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n".to_vec(),
                    huge,
                    b"data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n".to_vec(),
                ],
            ),
        );

        let answer = exchange
            .execute(&request(true), &mut RecordingSink::default())
            .await
            .unwrap();
        assert_eq!(answer, "ab");
    }

    #[tokio::test]
    async fn test_streaming_oversized_line_without_newline() {
        let mut chunks = vec![b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n".to_vec()];
        chunks.extend((0..5).map(|_| vec![b'x'; MAX_LINE_BYTES as usize / 2]));
        let exchange = exchange("openai", FakeTransport::with_raw_chunks(200, chunks));

        let answer = exchange
            .execute(&request(true), &mut RecordingSink::default())
            .await
            .unwrap();
        assert_eq!(answer, "a");
    }

    #[tokio::test]
    async fn test_streaming_stops_at_done() {
        let exchange = exchange(
            "openai",
            FakeTransport::new(
                200,
                vec![
                    "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
                    "data: [DONE]\n",
                    "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
                ],
            ),
        );
        let answer = exchange
            .execute(&request(true), &mut RecordingSink::default())
            .await
            .unwrap();
        assert_eq!(answer, "a");
    }

    #[tokio::test]
    async fn test_streaming_ends_at_body_close_without_done() {
        let exchange = exchange(
            "openai",
            FakeTransport::new(200, vec!["data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}"]),
        );
        let answer = exchange
            .execute(&request(true), &mut RecordingSink::default())
            .await
            .unwrap();
        assert_eq!(answer, "a");
    }

    #[tokio::test]
    async fn test_streaming_anthropic_events() {
        let exchange = exchange(
            "anthropic",
            FakeTransport::new(
                200,
                vec![
                    "event: message_start\n",
                    "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\"}}\n\n",
                    "event: content_block_delta\n",
                    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
                    "event: ping\ndata: {\"type\":\"ping\"}\n\n",
                    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" there\"}}\n\n",
                    "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
                ],
            ),
        );
        let mut sink = RecordingSink::default();

        let answer = exchange.execute(&request(true), &mut sink).await.unwrap();
        assert_eq!(answer, "Hi there");
        assert_eq!(sink.writes, vec!["Hi", " there"]);
    }

    #[tokio::test]
    async fn test_streaming_error_status_surfaces_body() {
        let exchange = exchange("openai", FakeTransport::new(429, vec!["rate ", "limited"]));
        let mut sink = RecordingSink::default();

        let err = exchange.execute(&request(true), &mut sink).await.unwrap_err();
        match err {
            ExchangeError::Status { status, body } => {
                assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
                assert_eq!(body, "rate limited");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(sink.writes.is_empty());
    }

    #[tokio::test]
    async fn test_buffered_returns_raw_answer_without_emitting() {
        let exchange = exchange(
            "openai",
            FakeTransport::new(
                200,
                vec!["{\"choices\":[{\"message\":", "{\"content\":\"<bold>X</bold>\"}}]}"],
            ),
        );
        let mut sink = RecordingSink::default();

        let answer = exchange.execute(&request(false), &mut sink).await.unwrap();
        assert_eq!(answer, "<bold>X</bold>");
        assert!(sink.writes.is_empty());

        let sent = exchange.transport.sent.lock().unwrap();
        assert!(!sent[0].1);
        let body: serde_json::Value = serde_json::from_slice(&sent[0].0).unwrap();
        assert_eq!(body["stream"], false);
    }

    #[tokio::test]
    async fn test_buffered_empty_response() {
        let exchange = exchange("openai", FakeTransport::new(200, vec!["{\"choices\":[]}"]));
        let err = exchange
            .execute(&request(false), &mut RecordingSink::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::EmptyResponse));
        assert_eq!(err.to_string(), "API returned an empty response");
    }

    #[tokio::test]
    async fn test_buffered_error_status_surfaces_body() {
        let exchange = exchange(
            "anthropic",
            FakeTransport::new(400, vec!["{\"error\":{\"message\":\"bad model\"}}"]),
        );
        let err = exchange
            .execute(&request(false), &mut RecordingSink::default())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "API returned 400 Bad Request: {\"error\":{\"message\":\"bad model\"}}"
        );
    }

    #[tokio::test]
    async fn test_buffered_anthropic() {
        let exchange = exchange(
            "anthropic",
            FakeTransport::new(200, vec!["{\"content\":[{\"type\":\"text\",\"text\":\"X\"}]}"]),
        );
        let answer = exchange
            .execute(&request(false), &mut RecordingSink::default())
            .await
            .unwrap();
        assert_eq!(answer, "X");
    }

    #[tokio::test]
    async fn test_streaming_over_http() {
        use wiremock::matchers::{header, method};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n\
                    data: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(header("accept", "text/event-stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .expect(1)
            .mount(&server)
            .await;

        let config = Config::parse("provider = openai").unwrap();
        let transport =
            HttpTransport::new(server.uri(), "sk-test".to_string(), HeaderMap::new(), None)
                .unwrap();
        let exchange = Exchange::new(create_provider(&config), transport);
        let mut out = Vec::new();

        let answer = exchange.execute(&request(true), &mut out).await.unwrap();
        assert_eq!(answer, "Hello");
        assert_eq!(out, b"Hello");
    }
}
