use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures_core::Stream;
use tokio::sync::mpsc;

use crate::{SinkError, StreamEvent};

/// Creates a bounded, ordered event channel.
pub fn event_channel(buffer: usize) -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (EventSender { tx: Some(tx) }, EventStream { rx })
}

/// Append-only producer half of a session's event stream.
///
/// Once a terminal [`StreamEvent::Complete`] has been sent, or the sender has been closed,
/// every further write fails with [`SinkError::Terminated`].
#[derive(Debug)]
pub struct EventSender {
    tx: Option<mpsc::Sender<StreamEvent>>,
}

impl EventSender {
    pub async fn send(&mut self, event: StreamEvent) -> Result<(), SinkError> {
        let tx = self.tx.as_ref().ok_or(SinkError::Terminated)?;
        let terminal = event.is_terminal();
        if tx.send(event).await.is_err() {
            self.tx = None;
            return Err(SinkError::Disconnected);
        }
        if terminal {
            self.tx = None;
        }
        Ok(())
    }

    /// Closes the stream without a terminal event.
    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }

    /// Resolves once the consumer drops its [`EventStream`]. Never resolves after `close`.
    pub async fn disconnected(&self) {
        match self.tx.as_ref() {
            Some(tx) => tx.closed().await,
            None => std::future::pending().await,
        }
    }
}

/// Consumer half of a session's event stream; ends after the terminal event or teardown.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl EventStream {
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
