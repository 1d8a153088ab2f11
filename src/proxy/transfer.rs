//! Response streaming and protocol upgrades

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use axum::BoxError;
use bytes::Bytes;
use http::Response;
use http_body::{Body, Frame, SizeHint};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use tokio::time::Sleep;
use tracing::{debug, warn};

use super::ProxyError;
use super::pool::PooledConnection;

pin_project! {
    /// Upstream response body relayed to the client frame by frame.
    ///
    /// Holds the borrowed upstream connection until the last frame so it is
    /// only pooled again after a complete exchange. A deadline firing or an
    /// upstream error drops the connection instead, which closes it.
    pub struct RelayBody {
        #[pin]
        inner: Incoming,
        deadline: Option<Pin<Box<Sleep>>>,
        connection: Option<PooledConnection>,
    }
}

impl RelayBody {
    pub(crate) fn new(
        inner: Incoming,
        deadline: Option<Pin<Box<Sleep>>>,
        connection: PooledConnection,
    ) -> Self {
        Self {
            inner,
            deadline,
            connection: Some(connection),
        }
    }
}

impl Body for RelayBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                if this.connection.take().is_some() {
                    warn!("Request deadline fired while streaming the response; aborting");
                }
                return Poll::Ready(Some(Err(ProxyError::Timeout.into())));
            }
        }

        match ready!(this.inner.poll_frame(cx)) {
            Some(Ok(frame)) => Poll::Ready(Some(Ok(frame))),
            Some(Err(e)) => {
                this.connection.take();
                debug!(error = %e, "Upstream response body failed");
                Poll::Ready(Some(Err(ProxyError::Upstream(e.to_string()).into())))
            }
            None => {
                if let Some(mut connection) = this.connection.take() {
                    connection.mark_reusable();
                }
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Switch both legs of an accepted upgrade to a raw byte relay.
///
/// Runs in its own task; the relay ends when either side closes.
pub(crate) fn relay_upgrade(inbound: OnUpgrade, upstream: &mut Response<Incoming>) {
    let upstream = hyper::upgrade::on(upstream);
    tokio::spawn(async move {
        let (client, server) = match tokio::try_join!(inbound, upstream) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Protocol upgrade failed");
                return;
            }
        };
        let mut client = TokioIo::new(client);
        let mut server = TokioIo::new(server);
        match tokio::io::copy_bidirectional(&mut client, &mut server).await {
            Ok((sent, received)) => {
                debug!(sent, received, "Upgraded connection closed");
            }
            Err(e) => debug!(error = %e, "Upgraded connection ended with error"),
        }
    });
}
