//! Response body tee used to capture cacheable responses.
//!
//! Frames pass through to the client unchanged. A bounded copy is kept on the
//! side, and once the stream completes the copy is handed to a completion
//! callback. Bodies larger than the limit are flagged as overflowed and the
//! callback never runs.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use hyper::body::{Body as HttpBody, Frame, SizeHint};

type OnComplete = Box<dyn FnOnce(Bytes) + Send + 'static>;

/// A body that tees its data frames into a bounded buffer.
pub struct CaptureBody {
    inner: Body,
    buffer: BytesMut,
    limit: usize,
    overflowed: bool,
    on_complete: Option<OnComplete>,
}

impl CaptureBody {
    pub fn new<F>(inner: Body, limit: usize, on_complete: F) -> Self
    where
        F: FnOnce(Bytes) + Send + 'static,
    {
        let mut body = Self {
            inner,
            buffer: BytesMut::new(),
            limit,
            overflowed: false,
            on_complete: Some(Box::new(on_complete)),
        };

        // hyper may never poll a body that already reports end of stream.
        if body.inner.is_end_stream() {
            body.finish();
        }
        body
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    fn record(&mut self, data: &Bytes) {
        if self.overflowed {
            return;
        }
        if self.buffer.len() + data.len() > self.limit {
            self.overflowed = true;
            self.buffer = BytesMut::new();
            self.on_complete = None;
            return;
        }
        self.buffer.extend_from_slice(data);
    }

    fn finish(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(std::mem::take(&mut self.buffer).freeze());
        }
    }
}

impl HttpBody for CaptureBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);

        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.record(data);
                }
                if this.inner.is_end_stream() {
                    this.finish();
                }
            }
            Poll::Ready(None) => this.finish(),
            Poll::Ready(Some(Err(_))) => {
                this.on_complete = None;
            }
            Poll::Pending => {}
        }

        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use http_body_util::BodyExt;
    use std::sync::{Arc, Mutex};

    fn capture(inner: Body, limit: usize) -> (CaptureBody, Arc<Mutex<Option<Bytes>>>) {
        let slot = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        let body = CaptureBody::new(inner, limit, move |bytes| {
            *sink.lock().unwrap() = Some(bytes);
        });
        (body, slot)
    }

    fn chunked(chunks: &'static [&'static str]) -> Body {
        Body::from_stream(stream::iter(
            chunks.iter().map(|c| Ok::<_, std::io::Error>(Bytes::from_static(c.as_bytes()))),
        ))
    }

    #[tokio::test]
    async fn captures_complete_body() {
        let (body, slot) = capture(Body::from("hello"), 16);
        let sent = body.collect().await.unwrap().to_bytes();

        assert_eq!(sent, Bytes::from_static(b"hello"));
        assert_eq!(slot.lock().unwrap().clone(), Some(Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn captures_streamed_chunks() {
        let (body, slot) = capture(chunked(&["pay", "load-", "gzip"]), 64);
        let sent = body.collect().await.unwrap().to_bytes();

        assert_eq!(sent, Bytes::from_static(b"payload-gzip"));
        assert_eq!(
            slot.lock().unwrap().clone(),
            Some(Bytes::from_static(b"payload-gzip"))
        );
    }

    #[tokio::test]
    async fn overflow_passes_through_without_capture() {
        let (body, slot) = capture(chunked(&["0123", "4567", "89"]), 6);
        let sent = body.collect().await.unwrap().to_bytes();

        assert_eq!(sent, Bytes::from_static(b"0123456789"));
        assert!(slot.lock().unwrap().is_none());
    }

    #[test]
    fn empty_body_completes_immediately() {
        let (body, slot) = capture(Body::empty(), 16);
        assert!(!body.overflowed());
        assert_eq!(slot.lock().unwrap().clone(), Some(Bytes::new()));
    }

    #[tokio::test]
    async fn dropped_body_is_not_captured() {
        let (body, slot) = capture(chunked(&["a", "b"]), 16);
        drop(body);
        assert!(slot.lock().unwrap().is_none());
    }
}
