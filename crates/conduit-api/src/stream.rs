//! Async stream that turns a streamed reply body into [`ChatDelta`]s.

use crate::sse::{DataLine, LineBuffer, parse_line};
use crate::wire::StreamChunk;
use bytes::Bytes;
use conduit_types::util::preview;
use conduit_types::{ApiError, ChatDelta};
use futures_core::Stream;
use futures_util::StreamExt;
use pin_project_lite::pin_project;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ApiError>> + Send>>;

pin_project! {
    /// A finite stream of [`ChatDelta`]s from one HTTP exchange.
    ///
    /// Ends at body end, at `data: [DONE]`, after a network error, or when
    /// its cancellation token fires. Dropping it closes the connection.
    pub struct DeltaStream {
        #[pin]
        inner: ByteStream,
        lines: LineBuffer,
        ready: VecDeque<Result<ChatDelta, ApiError>>,
        done: bool,
        cancel: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
    }
}

impl DeltaStream {
    /// Wrap a body byte stream.
    pub fn new<S, E>(byte_stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        let inner = byte_stream.map(|chunk| chunk.map_err(|e| ApiError::Network(e.to_string())));
        Self {
            inner: Box::pin(inner),
            lines: LineBuffer::new(),
            ready: VecDeque::new(),
            done: false,
            cancel: None,
        }
    }

    /// A stream that yields nothing.
    pub(crate) fn finished() -> Self {
        let mut stream = Self::new(futures_util::stream::empty::<Result<Bytes, ApiError>>());
        stream.done = true;
        stream
    }

    /// Stop yielding (and drop the body) once `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(Box::pin(async move { token.cancelled().await }));
        self
    }
}

impl Stream for DeltaStream {
    type Item = Result<ChatDelta, ApiError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if *this.done && this.ready.is_empty() {
                return Poll::Ready(None);
            }

            if let Some(cancel) = this.cancel.as_mut() {
                if cancel.as_mut().poll(cx).is_ready() {
                    tracing::debug!("Chat stream cancelled; closing the connection");
                    *this.done = true;
                    this.ready.clear();
                    *this.cancel = None;
                    this.inner
                        .set(Box::pin(futures_util::stream::empty::<Result<Bytes, ApiError>>()));
                    return Poll::Ready(None);
                }
            }

            if let Some(item) = this.ready.pop_front() {
                return Poll::Ready(Some(item));
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    for line in this.lines.feed(&bytes) {
                        if *this.done {
                            break;
                        }
                        handle_line(&line, this.ready, this.done);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    tracing::debug!("Chat stream interrupted: {e}");
                    *this.done = true;
                    this.ready.push_back(Err(e));
                }
                Poll::Ready(None) => {
                    if let Some(line) = this.lines.finish() {
                        if !*this.done {
                            handle_line(&line, this.ready, this.done);
                        }
                    }
                    *this.done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn handle_line(line: &str, ready: &mut VecDeque<Result<ChatDelta, ApiError>>, done: &mut bool) {
    let payload = match parse_line(line) {
        Some(DataLine::Payload(payload)) => payload,
        Some(DataLine::Done) => {
            *done = true;
            return;
        }
        None => return,
    };

    let chunk = match serde_json::from_str::<StreamChunk>(&payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::warn!("Skipping unparseable stream chunk ({e}): {}", preview(&payload));
            return;
        }
    };

    match chunk.into_delta() {
        Ok(Some(delta)) => ready.push_back(Ok(delta)),
        Ok(None) => {}
        Err(e) => ready.push_back(Err(e)),
    }
}
