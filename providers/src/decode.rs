//! Incremental decoding of generation streams.
//!
//! The server writes one record per line. A record is a JSON object, optionally
//! framed as `data: {...}`. Chunk boundaries are arbitrary with respect to
//! record boundaries, so bytes are buffered until a full line has arrived.
//!
//! | Record                                   | Event                     |
//! |------------------------------------------|---------------------------|
//! | `{"content": "..."}`                     | `Content`                 |
//! | `{"error": "..."}`                       | `Error(Remote)`, terminal |
//! | `{"type": "error", "message": "..."}`    | `Error(Remote)`, terminal |
//! | `{"type": "complete"}`                   | `End`, terminal           |
//! | blank, unparsable, or unrecognized       | skipped                   |
//!
//! When the source ends the decoder emits `End`; when the source fails it emits
//! `Error(Transport)`. Cancellation produces no event at all.

use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use quire_types::{StreamEvent, StreamFailure};

use crate::TransportError;

/// A source of raw response chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

const DATA_PREFIX: &str = "data: ";

/// Upper bound on a single unterminated record.
pub const MAX_RECORD_BYTES: usize = 4 * 1024 * 1024;

const REMOTE_ERROR_FALLBACK: &str = "generation failed";

#[derive(Debug, Deserialize)]
struct WireRecord {
    content: Option<String>,
    error: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<String>,
}

/// Decode a single record. `None` means the record carries nothing and is skipped.
///
/// Empty `content` counts as absent.
#[must_use]
pub fn decode_record(record: &str) -> Option<StreamEvent> {
    let record = record.trim();
    if record.is_empty() {
        return None;
    }

    let payload = record.strip_prefix(DATA_PREFIX).unwrap_or(record);
    let parsed: WireRecord = match serde_json::from_str(payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!(%e, payload_bytes = payload.len(), "Skipping unparsable stream record");
            return None;
        }
    };

    if let Some(content) = parsed.content.filter(|c| !c.is_empty()) {
        return Some(StreamEvent::Content(content));
    }
    if let Some(error) = parsed.error {
        return Some(StreamEvent::Error(StreamFailure::Remote(error)));
    }
    match parsed.kind.as_deref() {
        Some("error") => Some(StreamEvent::Error(StreamFailure::Remote(
            parsed
                .message
                .unwrap_or_else(|| REMOTE_ERROR_FALLBACK.to_string()),
        ))),
        Some("complete") => Some(StreamEvent::End),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordTooLarge;

/// Reassembles newline-delimited records from arbitrarily split chunks.
#[derive(Debug, Default)]
pub struct RecordBuffer {
    pending: Vec<u8>,
}

impl RecordBuffer {
    /// Append a chunk, pushing every record it completes onto `records`.
    ///
    /// Fails when the unterminated tail grows past [`MAX_RECORD_BYTES`]; records
    /// completed before that point are still delivered.
    pub fn push(&mut self, chunk: &[u8], records: &mut Vec<String>) -> Result<(), RecordTooLarge> {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.pending.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];
            if let Some(record) = into_record(std::mem::take(&mut self.pending)) {
                records.push(record);
            }
        }

        self.pending.extend_from_slice(rest);
        if self.pending.len() > MAX_RECORD_BYTES {
            self.pending = Vec::new();
            return Err(RecordTooLarge);
        }
        Ok(())
    }

    /// Take the unterminated tail once the source has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        into_record(std::mem::take(&mut self.pending))
    }
}

fn into_record(line: Vec<u8>) -> Option<String> {
    match String::from_utf8(line) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::debug!(bytes = e.as_bytes().len(), "Skipping stream record with invalid UTF-8");
            None
        }
    }
}

enum Step {
    Cancelled,
    Chunk(Option<Result<Bytes, TransportError>>),
}

/// Turns a [`ByteStream`] into a finite sequence of [`StreamEvent`]s.
///
/// Each call to [`next_event`](Self::next_event) either returns an already
/// decoded event or awaits exactly one more chunk. The token is checked before
/// every event and every chunk, and raced against the pending read, so a
/// cancelled decoder never yields another event. The source is dropped as soon
/// as the sequence is over: on a terminal event, on cancellation, and when the
/// decoder itself is dropped.
pub struct StreamDecoder {
    source: Option<ByteStream>,
    records: RecordBuffer,
    ready: VecDeque<StreamEvent>,
    token: CancellationToken,
}

impl std::fmt::Debug for StreamDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDecoder")
            .field("source_open", &self.source.is_some())
            .field("ready", &self.ready.len())
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl StreamDecoder {
    #[must_use]
    pub fn new(source: ByteStream, token: CancellationToken) -> Self {
        Self {
            source: Some(source),
            records: RecordBuffer::default(),
            ready: VecDeque::new(),
            token,
        }
    }

    /// Whether the underlying source is still held.
    #[must_use]
    pub fn holds_source(&self) -> bool {
        self.source.is_some()
    }

    /// Next decoded event, or `None` once the sequence is over or cancelled.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            if self.token.is_cancelled() {
                self.ready.clear();
                self.release();
                return None;
            }

            if let Some(event) = self.ready.pop_front() {
                if event.is_terminal() {
                    self.ready.clear();
                    self.release();
                }
                return Some(event);
            }

            let source = self.source.as_mut()?;
            let token = &self.token;
            let step = tokio::select! {
                biased;
                () = token.cancelled() => Step::Cancelled,
                next = source.next() => Step::Chunk(next),
            };

            match step {
                Step::Cancelled => {}
                Step::Chunk(Some(Ok(chunk))) => self.ingest(&chunk),
                Step::Chunk(Some(Err(e))) => {
                    self.enqueue(StreamEvent::Error(StreamFailure::Transport(e.to_string())));
                    self.release();
                }
                Step::Chunk(None) => {
                    if let Some(record) = self.records.finish()
                        && let Some(event) = decode_record(&record)
                    {
                        self.enqueue(event);
                    }
                    self.enqueue(StreamEvent::End);
                    self.release();
                }
            }
        }
    }

    /// Consume the decoder as a lazy stream of events.
    pub fn into_events(self) -> BoxStream<'static, StreamEvent> {
        stream::unfold(self, |mut decoder| async move {
            decoder.next_event().await.map(|event| (event, decoder))
        })
        .boxed()
    }

    fn ingest(&mut self, chunk: &[u8]) {
        let mut records = Vec::new();
        let pushed = self.records.push(chunk, &mut records);

        for record in &records {
            if let Some(event) = decode_record(record) {
                self.enqueue(event);
            }
        }
        if pushed.is_err() {
            self.enqueue(StreamEvent::Error(StreamFailure::Transport(format!(
                "stream record exceeded maximum size ({MAX_RECORD_BYTES} bytes)"
            ))));
        }

        if self.ready.back().is_some_and(StreamEvent::is_terminal) {
            self.release();
        }
    }

    /// Queue an event unless the sequence already ended.
    fn enqueue(&mut self, event: StreamEvent) {
        if self.ready.back().is_some_and(StreamEvent::is_terminal) {
            return;
        }
        self.ready.push_back(event);
    }

    fn release(&mut self) {
        if self.source.take().is_some() {
            tracing::debug!("Released generation stream source");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use bytes::Bytes;
    use futures_util::StreamExt;
    use futures_util::stream;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::{
        ByteStream, MAX_RECORD_BYTES, RecordBuffer, StreamDecoder, decode_record,
    };
    use crate::TransportError;
    use quire_types::{StreamEvent, StreamFailure};

    fn content(text: &str) -> StreamEvent {
        StreamEvent::Content(text.to_string())
    }

    fn chunks(parts: &[&str]) -> ByteStream {
        let items: Vec<Result<Bytes, TransportError>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        stream::iter(items).boxed()
    }

    /// Sets the flag when the stream is dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// A source fed by the test through a channel, reporting when it is dropped.
    fn channel_source() -> (
        mpsc::UnboundedSender<Result<Bytes, TransportError>>,
        ByteStream,
        Arc<AtomicBool>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dropped = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(Arc::clone(&dropped));
        let source = stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|item| (item, (rx, guard)))
        })
        .boxed();
        (tx, source, dropped)
    }

    fn send(tx: &mpsc::UnboundedSender<Result<Bytes, TransportError>>, text: &str) {
        tx.send(Ok(Bytes::copy_from_slice(text.as_bytes()))).unwrap();
    }

    async fn collect(source: ByteStream) -> Vec<StreamEvent> {
        StreamDecoder::new(source, CancellationToken::new())
            .into_events()
            .collect()
            .await
    }

    fn accumulated(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Content(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    mod records {
        use super::{StreamEvent, StreamFailure, content, decode_record};

        #[test]
        fn plain_and_framed_content() {
            assert_eq!(decode_record(r#"{"content":"hi"}"#), Some(content("hi")));
            assert_eq!(decode_record(r#"data: {"content":"hi"}"#), Some(content("hi")));
            assert_eq!(decode_record("  data: {\"content\":\"hi\"}\r"), Some(content("hi")));
        }

        #[test]
        fn server_chunk_shape() {
            assert_eq!(
                decode_record(r##"{"type":"chunk","content":"# Title"}"##),
                Some(content("# Title"))
            );
        }

        #[test]
        fn error_field_and_error_type() {
            assert_eq!(
                decode_record(r#"{"error":"quota exceeded"}"#),
                Some(StreamEvent::Error(StreamFailure::Remote("quota exceeded".into())))
            );
            assert_eq!(
                decode_record(r#"{"type":"error","message":"file missing"}"#),
                Some(StreamEvent::Error(StreamFailure::Remote("file missing".into())))
            );
        }

        #[test]
        fn complete_record_ends_stream() {
            assert_eq!(
                decode_record(r#"{"type":"complete","status":"done"}"#),
                Some(StreamEvent::End)
            );
        }

        #[test]
        fn content_wins_over_error_in_one_record() {
            assert_eq!(
                decode_record(r#"{"content":"a","error":"b"}"#),
                Some(content("a"))
            );
        }

        #[test]
        fn empty_content_counts_as_absent() {
            assert_eq!(decode_record(r#"{"content":""}"#), None);
            assert_eq!(decode_record(r#"{"type":"chunk","content":""}"#), None);
            assert_eq!(
                decode_record(r#"{"content":"","error":"b"}"#),
                Some(StreamEvent::Error(StreamFailure::Remote("b".into())))
            );
        }

        #[test]
        fn skips_blank_malformed_and_unrecognized() {
            assert_eq!(decode_record(""), None);
            assert_eq!(decode_record("   "), None);
            assert_eq!(decode_record("data: [DONE]"), None);
            assert_eq!(decode_record(": keep-alive"), None);
            assert_eq!(decode_record(r#"{"content": 42}"#), None);
            assert_eq!(decode_record(r#"{"ping": true}"#), None);
            assert_eq!(decode_record(r#"["content"]"#), None);
            assert_eq!(decode_record("null"), None);
        }

        #[test]
        fn only_exact_prefix_is_stripped() {
            assert_eq!(decode_record(r#"data:{"content":"x"}"#), None);
        }
    }

    mod buffer {
        use super::{MAX_RECORD_BYTES, RecordBuffer};

        #[test]
        fn holds_partial_record_until_newline() {
            let mut buffer = RecordBuffer::default();
            let mut records = Vec::new();
            buffer.push(b"{\"content\":\"ab", &mut records).unwrap();
            assert!(records.is_empty());
            buffer.push(b"c\"}\n{\"x\"", &mut records).unwrap();
            assert_eq!(records, vec!["{\"content\":\"abc\"}".to_string()]);
            assert_eq!(buffer.finish(), Some("{\"x\"".to_string()));
            assert_eq!(buffer.finish(), None);
        }

        #[test]
        fn reassembles_multibyte_characters_split_across_chunks() {
            let text = "{\"content\":\"caf\u{e9}\"}\n".as_bytes();
            let split = text.iter().position(|&b| b == 0xC3).unwrap() + 1;
            let mut buffer = RecordBuffer::default();
            let mut records = Vec::new();
            buffer.push(&text[..split], &mut records).unwrap();
            buffer.push(&text[split..], &mut records).unwrap();
            assert_eq!(records, vec!["{\"content\":\"caf\u{e9}\"}".to_string()]);
        }

        #[test]
        fn drops_invalid_utf8_lines() {
            let mut buffer = RecordBuffer::default();
            let mut records = Vec::new();
            buffer.push(b"\xff\xfe\n{\"content\":\"ok\"}\n", &mut records).unwrap();
            assert_eq!(records, vec!["{\"content\":\"ok\"}".to_string()]);
        }

        #[test]
        fn rejects_oversized_record_but_keeps_completed_ones() {
            let mut buffer = RecordBuffer::default();
            let mut records = Vec::new();
            let mut chunk = b"{\"content\":\"a\"}\n".to_vec();
            chunk.extend(std::iter::repeat_n(b'x', MAX_RECORD_BYTES + 1));
            assert!(buffer.push(&chunk, &mut records).is_err());
            assert_eq!(records.len(), 1);
            assert_eq!(buffer.finish(), None);
        }
    }

    #[tokio::test]
    async fn fragments_split_across_chunks_concatenate_in_order() {
        let events = collect(chunks(&[
            "{\"content\":\"ab",
            "c\"}\n{\"content\":\"d",
            "e\"}\n",
        ]))
        .await;
        assert_eq!(events, vec![content("abc"), content("de"), StreamEvent::End]);
        assert_eq!(accumulated(&events), "abcde");
    }

    #[tokio::test]
    async fn chunk_boundaries_do_not_change_the_result() {
        let full = "data: {\"content\":\"Hel\"}\n\n{\"content\":\"lo, \"}\n: ping\n\
                    data: {\"content\":\"w\u{f6}rld\"}\n{\"type\":\"complete\"}\n";
        let whole = accumulated(&collect(chunks(&[full])).await);
        assert_eq!(whole, "Hello, w\u{f6}rld");

        let bytes = full.as_bytes();
        for first in 1..bytes.len() {
            let second = (first + 7).min(bytes.len());
            let parts: Vec<Result<Bytes, TransportError>> = vec![
                Ok(Bytes::copy_from_slice(&bytes[..first])),
                Ok(Bytes::copy_from_slice(&bytes[first..second])),
                Ok(Bytes::copy_from_slice(&bytes[second..])),
            ];
            let events = collect(stream::iter(parts).boxed()).await;
            assert_eq!(accumulated(&events), whole, "split at {first}/{second}");
            assert_eq!(events.last(), Some(&StreamEvent::End));
        }
    }

    #[tokio::test]
    async fn malformed_record_between_fragments_is_ignored() {
        let with_bad = collect(chunks(&[
            "{\"content\":\"one\"}\n{not json at all\n{\"content\":\"two\"}\n",
        ]))
        .await;
        let without_bad = collect(chunks(&["{\"content\":\"one\"}\n{\"content\":\"two\"}\n"])).await;
        assert_eq!(with_bad, without_bad);
        assert_eq!(accumulated(&with_bad), "onetwo");
    }

    #[tokio::test]
    async fn error_record_terminates_and_drops_the_rest() {
        let events = collect(chunks(&[
            "{\"content\":\"partial\"}\n{\"error\":\"model overloaded\"}\n{\"content\":\"late\"}\n",
            "{\"content\":\"later\"}\n",
        ]))
        .await;
        assert_eq!(
            events,
            vec![
                content("partial"),
                StreamEvent::Error(StreamFailure::Remote("model overloaded".into())),
            ]
        );
    }

    #[tokio::test]
    async fn trailing_record_without_newline_is_decoded_at_end() {
        let events = collect(chunks(&["{\"content\":\"a\"}\n{\"content\":\"b\"}"])).await;
        assert_eq!(events, vec![content("a"), content("b"), StreamEvent::End]);
    }

    #[tokio::test]
    async fn empty_source_just_ends() {
        assert_eq!(collect(chunks(&[])).await, vec![StreamEvent::End]);
    }

    #[tokio::test]
    async fn source_failure_becomes_transport_error() {
        let items: Vec<Result<Bytes, TransportError>> = vec![
            Ok(Bytes::from_static(b"{\"content\":\"a\"}\n")),
            Err(TransportError::Stream("connection reset".into())),
            Ok(Bytes::from_static(b"{\"content\":\"never\"}\n")),
        ];
        let events = collect(stream::iter(items).boxed()).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], content("a"));
        assert!(matches!(
            &events[1],
            StreamEvent::Error(StreamFailure::Transport(msg)) if msg.contains("connection reset")
        ));
    }

    #[tokio::test]
    async fn complete_record_stops_reading_and_releases_source() {
        let (tx, source, dropped) = channel_source();
        let mut decoder = StreamDecoder::new(source, CancellationToken::new());

        send(&tx, "{\"content\":\"x\"}\n{\"type\":\"complete\"}\n");
        assert_eq!(decoder.next_event().await, Some(content("x")));
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(decoder.next_event().await, Some(StreamEvent::End));
        assert_eq!(decoder.next_event().await, None);
        assert!(tx.send(Ok(Bytes::from_static(b"ignored\n"))).is_err());
    }

    #[tokio::test]
    async fn cancellation_between_chunks_stops_without_more_events() {
        let (tx, source, dropped) = channel_source();
        let token = CancellationToken::new();
        let mut decoder = StreamDecoder::new(source, token.clone());

        send(&tx, "{\"content\":\"first\"}\n{\"content\":\"second\"}\n");
        assert_eq!(decoder.next_event().await, Some(content("first")));

        token.cancel();
        send(&tx, "{\"content\":\"third\"}\n");
        assert_eq!(decoder.next_event().await, None);
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!decoder.holds_source());

        token.cancel();
        assert_eq!(decoder.next_event().await, None);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_pending_read() {
        let (_tx, source, dropped) = channel_source();
        let token = CancellationToken::new();
        let mut decoder = StreamDecoder::new(source, token.clone());

        let reader = tokio::spawn(async move { decoder.next_event().await });
        tokio::task::yield_now().await;
        token.cancel();

        assert_eq!(reader.await.unwrap(), None);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dropping_the_decoder_releases_the_source() {
        let (_tx, source, dropped) = channel_source();
        let decoder = StreamDecoder::new(source, CancellationToken::new());
        assert!(!dropped.load(Ordering::SeqCst));
        drop(decoder);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn oversized_record_is_a_transport_error() {
        let big = "x".repeat(MAX_RECORD_BYTES + 1);
        let events = collect(chunks(&["{\"content\":\"ok\"}\n", &big])).await;
        assert_eq!(events[0], content("ok"));
        assert!(matches!(
            &events[1],
            StreamEvent::Error(StreamFailure::Transport(msg)) if msg.contains("maximum size")
        ));
        assert_eq!(events.len(), 2);
    }
}
