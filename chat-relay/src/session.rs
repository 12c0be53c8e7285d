use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufWriter},
    select,
    sync::mpsc,
    task::{JoinError, JoinHandle},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    line::{Line, read_line, write_line},
    notice::{Notice, display_name},
    registry::{Registry, SessionId},
};

/// How long teardown waits for already queued lines to reach the client.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Server-side state for one connected client.
///
/// The accept loop registers the session's handle before spawning [`Session::run`];
/// the session unregisters itself during teardown.
pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    registry: Arc<Registry>,
    max_line_length: usize,
    name: String,
}

impl Session {
    pub fn new(
        id: SessionId,
        peer: Option<SocketAddr>,
        registry: Arc<Registry>,
        max_line_length: usize,
    ) -> Self {
        Self {
            id,
            peer,
            registry,
            max_line_length,
            name: String::new(),
        }
    }

    /// Drives the session until the client goes away, then tears it down.
    ///
    /// `inbox` is the receiving end of the queue whose sender sits in the
    /// registry; a writer task drains it into `writer`. Whichever side fails
    /// first ends the session.
    pub async fn run<R, W>(mut self, mut reader: R, writer: W, inbox: mpsc::Receiver<String>)
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.id;
        let mut outbound = tokio::spawn(write_outbound(writer, inbox));

        let writer_running = select! {
            result = self.converse(&mut reader) => {
                if let Err(err) = result {
                    debug!(session = id, error = ?err, "read side failed");
                }
                true
            }
            result = &mut outbound => {
                log_writer_exit(id, result);
                false
            }
        };

        self.teardown(writer_running.then_some(outbound)).await;
    }

    async fn converse<R>(&mut self, reader: &mut R) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let first = self.next_line(reader).await?;
        self.name = display_name(first.as_deref());

        if self.name.is_empty() {
            debug!(session = self.id, peer = ?self.peer, "client did not give a name");
        } else {
            info!(session = self.id, peer = ?self.peer, name = %self.name, "client joined");
            self.registry
                .broadcast(&Notice::joined(&self.name).to_string(), Some(self.id))
                .await;
        }

        while let Some(text) = self.next_line(reader).await? {
            self.registry
                .broadcast(&Notice::chat(&self.name, text).to_string(), Some(self.id))
                .await;
        }

        Ok(())
    }

    async fn next_line<R>(&self, reader: &mut R) -> io::Result<Option<String>>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            match read_line(reader, self.max_line_length).await? {
                Some(Line::Text(text)) => return Ok(Some(text)),
                Some(Line::TooLong) => {
                    warn!(
                        session = self.id,
                        limit = self.max_line_length,
                        "discarding over-long line"
                    );
                }
                None => return Ok(None),
            }
        }
    }

    async fn teardown(self, outbound: Option<JoinHandle<io::Result<()>>>) {
        if self.registry.remove(self.id).await {
            info!(session = self.id, peer = ?self.peer, name = %self.name, "client disconnected");
            self.registry
                .broadcast(&Notice::left(&self.name).to_string(), None)
                .await;
        }

        // Removal dropped the queue's only sender, so the writer finishes once
        // it has flushed whatever was already queued.
        if let Some(mut outbound) = outbound {
            match timeout(DRAIN_TIMEOUT, &mut outbound).await {
                Ok(result) => log_writer_exit(self.id, result),
                Err(_) => {
                    warn!(session = self.id, "client stopped reading; closing without draining");
                    outbound.abort();
                }
            }
        }
    }
}

async fn write_outbound<W>(writer: W, mut inbox: mpsc::Receiver<String>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);

    while let Some(text) = inbox.recv().await {
        write_line(&mut writer, &text).await?;
        while let Ok(text) = inbox.try_recv() {
            write_line(&mut writer, &text).await?;
        }
        writer.flush().await?;
    }

    writer.shutdown().await
}

fn log_writer_exit(id: SessionId, result: Result<io::Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(session = id, error = ?err, "write side failed"),
        Err(err) => warn!(session = id, error = ?err, "writer task ended abnormally"),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream};

    use super::*;
    use crate::registry::SessionHandle;

    const WAIT: Duration = Duration::from_secs(1);
    const OBSERVER: SessionId = 100;

    struct Harness {
        registry: Arc<Registry>,
        observer: mpsc::Receiver<String>,
    }

    impl Harness {
        async fn new() -> Self {
            let registry = Arc::new(Registry::new());
            let (handle, observer) = SessionHandle::channel(OBSERVER, 32);
            registry.add(handle).await;
            Self { registry, observer }
        }

        /// Registers a session and runs it over an in-memory pipe, returning
        /// the client end of the pipe.
        async fn spawn_session(
            &self,
            id: SessionId,
            max_line_length: usize,
        ) -> (DuplexStream, JoinHandle<()>) {
            let (client, server) = tokio::io::duplex(1024);
            let (reader, writer) = tokio::io::split(server);
            let (handle, inbox) = SessionHandle::channel(id, 32);
            self.registry.add(handle).await;

            let session = Session::new(id, None, Arc::clone(&self.registry), max_line_length);
            let task = tokio::spawn(session.run(BufReader::new(reader), writer, inbox));
            (client, task)
        }

        async fn observed(&mut self) -> String {
            timeout(WAIT, self.observer.recv())
                .await
                .expect("timed out waiting for broadcast")
                .expect("observer queue closed")
        }

        fn assert_quiet(&mut self) {
            assert!(self.observer.try_recv().is_err(), "unexpected broadcast");
        }
    }

    #[tokio::test]
    async fn named_session_announces_chats_and_leaves_once() {
        let mut harness = Harness::new().await;
        let (mut client, task) = harness.spawn_session(1, 1024).await;

        client.write_all(b"alice\nhello\r\nsecond\n").await.expect("write");
        assert_eq!(harness.observed().await, "alice has joined the chat");
        assert_eq!(harness.observed().await, "[alice]: hello");
        assert_eq!(harness.observed().await, "[alice]: second");

        client.shutdown().await.expect("shutdown");
        timeout(WAIT, task).await.expect("session ended").expect("join");

        assert_eq!(harness.observed().await, "alice has left the chat");
        harness.assert_quiet();
        assert!(!harness.registry.contains(1).await);
    }

    #[tokio::test]
    async fn nameless_session_skips_join_but_still_leaves() {
        let mut harness = Harness::new().await;
        let (mut client, task) = harness.spawn_session(1, 1024).await;

        client.write_all(b"   \n").await.expect("write");
        client.shutdown().await.expect("shutdown");
        timeout(WAIT, task).await.expect("session ended").expect("join");

        assert_eq!(harness.observed().await, " has left the chat");
        harness.assert_quiet();
        assert_eq!(harness.registry.len().await, 1);
    }

    #[tokio::test]
    async fn immediate_close_tears_down_cleanly() {
        let mut harness = Harness::new().await;
        let (client, task) = harness.spawn_session(1, 1024).await;

        drop(client);
        timeout(WAIT, task).await.expect("session ended").expect("join");

        assert_eq!(harness.observed().await, " has left the chat");
        harness.assert_quiet();
        assert!(!harness.registry.contains(1).await);
    }

    #[tokio::test]
    async fn repeated_teardown_sends_no_second_leave() {
        let mut harness = Harness::new().await;
        let (mut client, task) = harness.spawn_session(1, 1024).await;

        client.write_all(b"alice\n").await.expect("write");
        assert_eq!(harness.observed().await, "alice has joined the chat");

        // Someone else already unregistered the session.
        assert!(harness.registry.remove(1).await);
        client.shutdown().await.expect("shutdown");
        timeout(WAIT, task).await.expect("session ended").expect("join");

        harness.assert_quiet();
    }

    #[tokio::test]
    async fn queued_broadcasts_reach_the_client() {
        let harness = Harness::new().await;
        let (client, _task) = harness.spawn_session(1, 1024).await;
        let mut client = BufReader::new(client);

        harness.registry.broadcast("bob has joined the chat", Some(OBSERVER)).await;
        harness.registry.broadcast("[bob]: hi", Some(OBSERVER)).await;

        let mut received = String::new();
        for _ in 0..2 {
            timeout(WAIT, client.read_line(&mut received))
                .await
                .expect("timed out")
                .expect("read");
        }
        assert_eq!(received, "bob has joined the chat\n[bob]: hi\n");
    }

    #[tokio::test]
    async fn over_long_lines_are_dropped() {
        let mut harness = Harness::new().await;
        let (mut client, _task) = harness.spawn_session(1, 8).await;

        client
            .write_all(b"alice\nthis is far too long\nshort\n")
            .await
            .expect("write");

        assert_eq!(harness.observed().await, "alice has joined the chat");
        assert_eq!(harness.observed().await, "[alice]: short");
    }

    #[tokio::test]
    async fn queued_lines_are_flushed_before_close() {
        let harness = Harness::new().await;
        let (mut client, task) = harness.spawn_session(1, 1024).await;

        harness.registry.broadcast("last words", Some(OBSERVER)).await;
        client.shutdown().await.expect("shutdown");
        timeout(WAIT, task).await.expect("session ended").expect("join");

        let mut received = String::new();
        timeout(WAIT, client.read_to_string(&mut received))
            .await
            .expect("timed out")
            .expect("read");
        assert_eq!(received, "last words\n");
    }

    struct BrokenWriter;

    impl AsyncWrite for BrokenWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn write_failure_ends_the_session() {
        let mut harness = Harness::new().await;
        let (mut client, server) = tokio::io::duplex(1024);
        let (handle, inbox) = SessionHandle::channel(1, 32);
        harness.registry.add(handle).await;
        let session = Session::new(1, None, Arc::clone(&harness.registry), 1024);
        let task = tokio::spawn(session.run(BufReader::new(server), BrokenWriter, inbox));

        client.write_all(b"alice\n").await.expect("write");
        assert_eq!(harness.observed().await, "alice has joined the chat");

        // The client never closes its side; only the failed write can end the session.
        harness.registry.broadcast("ping", Some(OBSERVER)).await;
        timeout(WAIT, task).await.expect("session ended").expect("join");

        assert_eq!(harness.observed().await, "alice has left the chat");
        assert!(!harness.registry.contains(1).await);
    }
}
