//! SSE body draining for provider responses.
//!
//! The provider emits `data:` payloads delimited by blank lines. The
//! buffer accumulates raw chunks and releases complete payloads; a
//! trailing partial event survives until the next chunk (or the final
//! flush when the body closes).

use palaver_domain::stream::{BoxStream, StreamEvent};
use palaver_domain::{Error, Result};

/// Incremental SSE event buffer.
#[derive(Default)]
pub(crate) struct SseBuffer {
    buf: String,
}

impl SseBuffer {
    /// Feed one body chunk; returns every complete `data:` payload.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buf.push_str(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.find("\n\n") {
            let block: String = self.buf.drain(..pos + 2).collect();
            collect_data_lines(&block, &mut payloads);
        }
        payloads
    }

    /// Release whatever remains once the body has closed.
    pub fn flush(&mut self) -> Vec<String> {
        let block = std::mem::take(&mut self.buf);
        let mut payloads = Vec::new();
        collect_data_lines(&block, &mut payloads);
        payloads
    }
}

fn collect_data_lines(block: &str, out: &mut Vec<String>) {
    for line in block.lines() {
        if let Some(data) = line.trim().strip_prefix("data:") {
            let data = data.trim();
            if !data.is_empty() {
                out.push(data.to_owned());
            }
        }
    }
}

/// Turn a streaming HTTP response into a [`StreamEvent`] stream.
///
/// `parse` maps one `data:` payload to zero or more events; it is
/// `FnMut` because tool-call assembly needs state across payloads. A
/// terminal `Done` is synthesized when the parser never produced one
/// (some endpoints close the body without `[DONE]`).
pub(crate) fn event_stream<F>(
    response: reqwest::Response,
    mut parse: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut response = response;
        let mut buffer = SseBuffer::default();
        let mut done_seen = false;

        loop {
            let chunk = match response.chunk().await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break,
                Err(e) => {
                    yield Err(Error::UpstreamUnavailable(format!(
                        "response body failed: {e}"
                    )));
                    return;
                }
            };
            for payload in buffer.feed(&String::from_utf8_lossy(&chunk)) {
                for event in parse(&payload) {
                    done_seen |= matches!(&event, Ok(StreamEvent::Done { .. }));
                    yield event;
                }
            }
        }

        for payload in buffer.flush() {
            for event in parse(&payload) {
                done_seen |= matches!(&event, Ok(StreamEvent::Done { .. }));
                yield event;
            }
        }

        if !done_seen {
            yield Ok(StreamEvent::Done { usage: None, finish_reason: Some("stop".into()) });
        }
    })
}
