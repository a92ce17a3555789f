//! Chunked `/query` stream reader
//!
//! The upstream emits one JSON response object per line when `chunked=true`.
//! This reader buffers the byte stream and yields each decoded response in
//! order. JSON strings escape raw newlines, so splitting on `\n` is safe.

use super::response::Response;
use crate::{Error, Result};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

/// Streaming reader over a chunked query response
pub struct ChunkedResponse {
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
    buf: Vec<u8>,
    done: bool,
}

impl ChunkedResponse {
    pub fn new(stream: BoxStream<'static, reqwest::Result<Bytes>>) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            done: false,
        }
    }

    /// Next decoded response, or `None` at end of stream.
    ///
    /// A decode failure surfaces the raw tail as the error text: the
    /// upstream writes a last-ditch plain-text error when it dies
    /// mid-stream.
    pub async fn next_response(&mut self) -> Result<Option<Response>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                return self.decode(line).map(Some);
            }
            if self.done {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let line = std::mem::take(&mut self.buf);
                return self.decode(&line).map(Some);
            }
            match self.stream.next().await {
                Some(chunk) => self.buf.extend_from_slice(&chunk?),
                None => self.done = true,
            }
        }
    }

    fn decode(&self, line: &[u8]) -> Result<Response> {
        Response::from_bytes(line).map_err(|_| {
            Error::Internal(String::from_utf8_lossy(line).trim().to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunked(parts: Vec<&'static [u8]>) -> ChunkedResponse {
        let s = stream::iter(
            parts
                .into_iter()
                .map(|p| Ok(Bytes::from_static(p)))
                .collect::<Vec<reqwest::Result<Bytes>>>(),
        );
        ChunkedResponse::new(s.boxed())
    }

    #[tokio::test]
    async fn yields_each_line_as_response() {
        let mut rsp = chunked(vec![
            b"{\"results\":[{\"statement_id\":0}]}\n{\"results\":",
            b"[{\"statement_id\":1}]}\n",
        ]);
        let first = rsp.next_response().await.unwrap().unwrap();
        assert_eq!(first.results[0].statement_id, 0);
        let second = rsp.next_response().await.unwrap().unwrap();
        assert_eq!(second.results[0].statement_id, 1);
        assert!(rsp.next_response().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn trailing_object_without_newline_is_decoded() {
        let mut rsp = chunked(vec![b"{\"results\":[{\"statement_id\":7}]}"]);
        let only = rsp.next_response().await.unwrap().unwrap();
        assert_eq!(only.results[0].statement_id, 7);
        assert!(rsp.next_response().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_tail_becomes_error_text() {
        let mut rsp = chunked(vec![b"engine exploded"]);
        let err = rsp.next_response().await.unwrap_err();
        assert!(err.to_string().contains("engine exploded"));
    }
}
