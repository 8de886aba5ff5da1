//! A byte stream backed by channels instead of a socket, so accepted flows
//! can be handed to a handler task while the actual smoltcp socket stays on
//! the dedicated poll-loop thread.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// One end of a channel-backed stream; implements [`AsyncRead`] and
/// [`AsyncWrite`] so a handler can treat it like any other connection
/// (including feeding it to `tokio::io::copy_bidirectional`).
pub struct FlowStream {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    leftover: VecDeque<u8>,
}

/// The stack-side counterpart, kept by the poll loop for one accepted flow.
pub(crate) struct FlowStreamHandle {
    pub(crate) rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pub(crate) tx: mpsc::UnboundedSender<Vec<u8>>,
}

pub(crate) fn channel_pair() -> (FlowStream, FlowStreamHandle) {
    let (to_user_tx, to_user_rx) = mpsc::unbounded_channel();
    let (from_user_tx, from_user_rx) = mpsc::unbounded_channel();

    let user_side = FlowStream {
        rx: to_user_rx,
        tx: from_user_tx,
        leftover: VecDeque::new(),
    };
    let stack_side = FlowStreamHandle {
        rx: from_user_rx,
        tx: to_user_tx,
    };

    (user_side, stack_side)
}

impl AsyncRead for FlowStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.leftover.is_empty() {
            let take = self.leftover.len().min(buf.remaining());
            let chunk: Vec<u8> = self.leftover.drain(..take).collect();
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                let take = data.len().min(buf.remaining());
                buf.put_slice(&data[..take]);
                self.leftover.extend(&data[take..]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())), // EOF
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for FlowStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "flow closed by stack",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
