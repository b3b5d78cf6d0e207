//! Response bodies that read from or write into the cache.

use super::{flight::FlightGuard, Metadata, WriteHandle};
use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, StreamBody};
use hyper::body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::{
    pin::Pin,
    task::{ready, Context, Poll},
};
use tokio::{fs::File, sync::mpsc};
use tokio_stream::StreamExt;
use tokio_util::{io::ReaderStream, sync::PollSender};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type handed to hyper for every proxied response.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

// Chunks buffered between the client-facing body and the disk writer.
const TEE_CAPACITY: usize = 32;

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    http_body_util::Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Stream a stored body file.
pub fn stored(file: File) -> ProxyBody {
    let stream = ReaderStream::new(file).map(|chunk| chunk.map(Frame::data).map_err(BoxError::from));
    StreamBody::new(stream).boxed_unsync()
}

enum Tee {
    Data(Bytes),
    // Final data frame, the body is complete once it is written.
    Last(Bytes),
    End,
}

pin_project! {
    /// Forwards an upstream body to the client while copying every data
    /// frame to a cache writer task.
    ///
    /// The writer commits only after it receives the end marker, which is
    /// sent with the frame after which upstream reports its end. hyper stops
    /// polling a sized body once the declared length is out, so the marker
    /// cannot wait for a trailing `None`. Dropping the body early
    /// (client gone) or an upstream error closes the channel without the
    /// marker and the write is aborted.
    pub struct TeeBody<B> {
        #[pin]
        inner: B,
        sink: Option<PollSender<Tee>>,
    }
}

impl<B> TeeBody<B>
where
    B: Body<Data = Bytes>,
{
    /// Start the writer task and wrap `inner`.
    ///
    /// `guard` is held by the writer task, so the key stays in flight until
    /// the body file is committed or abandoned.
    pub fn new(inner: B, handle: WriteHandle, metadata: Metadata, guard: FlightGuard) -> Self {
        let (tx, rx) = mpsc::channel(TEE_CAPACITY);
        tokio::spawn(write_through(rx, handle, metadata, guard));

        // hyper never polls a body that is already at its end, e.g. HEAD or
        // a zero length response.
        let sink = if inner.is_end_stream() {
            let _ = tx.try_send(Tee::End);
            None
        } else {
            Some(PollSender::new(tx))
        };

        TeeBody { inner, sink }
    }
}

impl<B> Body for TeeBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();

        // Reserve a slot before pulling from upstream so a slow disk slows
        // the download instead of buffering without bound.
        if let Some(sink) = this.sink.as_mut() {
            if ready!(sink.poll_reserve(cx)).is_err() {
                tracing::debug!("cache writer gone, continuing uncached");
                *this.sink = None;
            }
        }

        let frame = ready!(this.inner.as_mut().poll_frame(cx));
        match frame {
            Some(Ok(frame)) => {
                if let Some(sink) = this.sink.as_mut() {
                    let last = this.inner.is_end_stream();
                    let item = match frame.data_ref() {
                        Some(data) if last => Tee::Last(data.clone()),
                        Some(data) => Tee::Data(data.clone()),
                        // Trailers close the body.
                        None => Tee::End,
                    };
                    let done = !matches!(item, Tee::Data(_));
                    if sink.send_item(item).is_err() || done {
                        *this.sink = None;
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(err)) => {
                *this.sink = None;
                Poll::Ready(Some(Err(err.into())))
            }
            None => {
                if let Some(mut sink) = this.sink.take() {
                    let _ = sink.send_item(Tee::End);
                }
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.sink.is_none() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

async fn write_through(
    mut rx: mpsc::Receiver<Tee>,
    mut handle: WriteHandle,
    metadata: Metadata,
    guard: FlightGuard,
) {
    let mut complete = false;
    while let Some(item) = rx.recv().await {
        let (chunk, last) = match item {
            Tee::Data(chunk) => (chunk, false),
            Tee::Last(chunk) => (chunk, true),
            Tee::End => {
                complete = true;
                break;
            }
        };
        if let Err(err) = handle.write(&chunk).await {
            tracing::warn!(
                "cache write to {} failed, serving uncached: {}",
                handle.body_path().display(),
                err
            );
            handle.abort().await;
            return;
        }
        if last {
            complete = true;
            break;
        }
    }

    if complete {
        let path = handle.body_path().to_path_buf();
        let written = handle.written();
        match handle.commit(&metadata).await {
            Ok(()) => tracing::debug!("cached {} ({} bytes)", path.display(), written),
            Err(err) => tracing::warn!("failed to commit {}: {}", path.display(), err),
        }
    } else {
        tracing::debug!(
            "response for {:?} ended early, cache entry not committed",
            guard.key()
        );
        handle.abort().await;
    }

    drop(guard);
}
