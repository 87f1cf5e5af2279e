//! Stream plumbing shared by the adapters
//!
//! Collectors accumulate child output per the configured sink, the tee
//! writer duplicates a stream to two writers, and the line splitter turns
//! byte chunks into ordered line callbacks.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use bytes::{Buf, BytesMut};
use futures_util::StreamExt;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::command::{OutputSink, ProgressConfig, ProgressUpdate};

pin_project! {
    /// Writer that duplicates everything to two inner writers.
    ///
    /// Bytes are reported as written only once the first writer accepted
    /// them; the same bytes are then owed to the second writer and kept in
    /// an internal backlog until it takes them, so backpressure on either
    /// side never drops data.
    pub struct TeeWriter<A, B> {
        #[pin]
        first: A,
        #[pin]
        second: B,
        backlog: BytesMut,
    }
}

/// Push the backlog into `second` until it is empty or the writer stalls.
fn drain_backlog<B: AsyncWrite>(
    mut second: Pin<&mut B>,
    backlog: &mut BytesMut,
    cx: &mut Context<'_>,
) -> Poll<io::Result<()>> {
    while !backlog.is_empty() {
        match second.as_mut().poll_write(cx, backlog) {
            Poll::Ready(Ok(0)) => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "tee writer target accepted no bytes",
                )))
            }
            Poll::Ready(Ok(n)) => backlog.advance(n),
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
    }
    Poll::Ready(Ok(()))
}

impl<A, B> TeeWriter<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self {
            first,
            second,
            backlog: BytesMut::new(),
        }
    }

    /// Recover the inner writers. The backlog is empty after a clean
    /// `shutdown`.
    pub fn into_parts(self) -> (A, B) {
        (self.first, self.second)
    }
}

impl<A, B> AsyncWrite for TeeWriter<A, B>
where
    A: AsyncWrite,
    B: AsyncWrite,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();

        // The second writer must catch up before new bytes are accepted.
        ready!(drain_backlog(this.second.as_mut(), this.backlog, cx))?;

        let n = ready!(this.first.as_mut().poll_write(cx, buf))?;
        this.backlog.extend_from_slice(&buf[..n]);

        // Opportunistic push; whatever the second writer does not take now
        // stays owed in the backlog.
        let _ = drain_backlog(this.second.as_mut(), this.backlog, cx)?;

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(drain_backlog(this.second.as_mut(), this.backlog, cx))?;

        match (
            this.first.poll_flush(cx),
            this.second.poll_flush(cx),
        ) {
            (Poll::Ready(Ok(())), Poll::Ready(Ok(()))) => Poll::Ready(Ok(())),
            (Poll::Ready(Err(e)), _) | (_, Poll::Ready(Err(e))) => Poll::Ready(Err(e)),
            _ => Poll::Pending,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(drain_backlog(this.second.as_mut(), this.backlog, cx))?;

        match (
            this.first.poll_shutdown(cx),
            this.second.poll_shutdown(cx),
        ) {
            (Poll::Ready(Ok(())), Poll::Ready(Ok(()))) => Poll::Ready(Ok(())),
            (Poll::Ready(Err(e)), _) | (_, Poll::Ready(Err(e))) => Poll::Ready(Err(e)),
            _ => Poll::Pending,
        }
    }
}

enum CollectorInner {
    /// Capture into a buffer (`Pipe`).
    Capture(Vec<u8>),
    /// Drop everything (`Ignore`, and `Inherit` where wiring happens at
    /// spawn time).
    Discard,
    /// Capture and forward to an external writer (`Writer`), through the
    /// tee so neither side loses bytes under backpressure.
    Tee(TeeWriter<Vec<u8>, Box<dyn AsyncWrite + Send + Unpin>>),
}

/// Accumulates one output stream per the configured sink.
pub struct OutputCollector {
    inner: CollectorInner,
}

impl OutputCollector {
    pub fn new(sink: &OutputSink) -> Self {
        let inner = match sink {
            OutputSink::Pipe => CollectorInner::Capture(Vec::new()),
            OutputSink::Ignore | OutputSink::Inherit => CollectorInner::Discard,
            OutputSink::Writer(shared) => match shared.lock().take() {
                Some(writer) => CollectorInner::Tee(TeeWriter::new(Vec::new(), writer)),
                // The writer was already claimed (a retried attempt);
                // capture only.
                None => CollectorInner::Capture(Vec::new()),
            },
        };
        Self { inner }
    }

    /// Append one chunk, forwarding to the external writer when present.
    pub async fn push(&mut self, chunk: &[u8]) -> io::Result<()> {
        match &mut self.inner {
            CollectorInner::Capture(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
            CollectorInner::Discard => Ok(()),
            CollectorInner::Tee(tee) => tee.write_all(chunk).await,
        }
    }

    /// Flush the external writer and return the captured bytes.
    pub async fn finish(self) -> Vec<u8> {
        match self.inner {
            CollectorInner::Capture(buf) => buf,
            CollectorInner::Discard => Vec::new(),
            CollectorInner::Tee(mut tee) => {
                let _ = tee.flush().await;
                let _ = tee.shutdown().await;
                let (captured, _writer) = tee.into_parts();
                captured
            }
        }
    }
}

/// Incremental splitter delivering complete lines in source order.
#[derive(Default)]
pub struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk; `f` is called once per completed line, without the
    /// line break.
    pub fn push(&mut self, chunk: &[u8], mut f: impl FnMut(&str)) {
        for &byte in chunk {
            if byte == b'\n' {
                if self.partial.last() == Some(&b'\r') {
                    self.partial.pop();
                }
                f(&String::from_utf8_lossy(&self.partial));
                self.partial.clear();
            } else {
                self.partial.push(byte);
            }
        }
    }

    /// Deliver any final unterminated line.
    pub fn finish(self, mut f: impl FnMut(&str)) {
        if !self.partial.is_empty() {
            f(&String::from_utf8_lossy(&self.partial));
        }
    }
}

/// Line stream over an async reader, for log following.
pub fn line_stream<R>(
    reader: R,
) -> impl futures_util::Stream<Item = Result<String, tokio_util::codec::LinesCodecError>>
where
    R: AsyncRead + Unpin,
{
    FramedRead::new(reader, LinesCodec::new())
}

/// Read every line from a reader, in order, into a vector.
pub async fn read_lines<R>(reader: R) -> io::Result<Vec<String>>
where
    R: AsyncRead + Unpin,
{
    let mut stream = line_stream(reader);
    let mut lines = Vec::new();
    while let Some(line) = stream.next().await {
        lines.push(line.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?);
    }
    Ok(lines)
}

/// Tracks byte/line counters for progress callbacks.
pub struct ProgressTracker {
    config: ProgressConfig,
    splitter: LineSplitter,
    update: ProgressUpdate,
    started: Instant,
    last_report: Instant,
}

impl ProgressTracker {
    pub fn new(config: ProgressConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            splitter: LineSplitter::new(),
            update: ProgressUpdate::default(),
            started: now,
            last_report: now,
        }
    }

    /// If the command requests progress, build a tracker for it.
    pub fn for_config(config: Option<&ProgressConfig>) -> Option<Self> {
        config
            .filter(|c| c.enabled)
            .cloned()
            .map(Self::new)
    }

    pub fn record_stdout(&mut self, chunk: &[u8]) {
        self.update.bytes_stdout += chunk.len() as u64;
        if self.config.report_lines {
            let mut lines = 0u64;
            let mut last = None;
            self.splitter.push(chunk, |line| {
                lines += 1;
                last = Some(line.to_string());
            });
            self.update.lines_stdout += lines;
            if last.is_some() {
                self.update.last_line = last;
            }
        }
        self.maybe_report();
    }

    pub fn record_stderr(&mut self, chunk: &[u8]) {
        self.update.bytes_stderr += chunk.len() as u64;
        self.maybe_report();
    }

    fn maybe_report(&mut self) {
        if self.last_report.elapsed() < self.config.interval {
            return;
        }
        self.last_report = Instant::now();
        self.report();
    }

    /// Deliver a final snapshot regardless of the interval.
    pub fn report(&mut self) {
        if let Some(callback) = &self.config.callback {
            self.update.elapsed = self.started.elapsed();
            callback(self.update.clone());
        }
    }
}

/// Sleep helper honoring an optional deadline; `None` never wakes.
pub async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::OutputSink;
    use std::time::Duration;

    #[tokio::test]
    async fn test_collector_pipe_captures() {
        let mut collector = OutputCollector::new(&OutputSink::Pipe);
        collector.push(b"hello ").await.unwrap();
        collector.push(b"world").await.unwrap();
        assert_eq!(collector.finish().await, b"hello world");
    }

    #[tokio::test]
    async fn test_collector_ignore_drops() {
        let mut collector = OutputCollector::new(&OutputSink::Ignore);
        collector.push(b"data").await.unwrap();
        assert!(collector.finish().await.is_empty());
    }

    #[tokio::test]
    async fn test_collector_writer_captures_and_forwards() {
        let (client, mut server) = tokio::io::duplex(256);
        let shared: crate::command::SharedWriter =
            std::sync::Arc::new(parking_lot::Mutex::new(Some(
                Box::new(client) as Box<dyn AsyncWrite + Send + Unpin>
            )));

        let mut collector = OutputCollector::new(&OutputSink::Writer(shared));
        collector.push(b"abc").await.unwrap();
        let captured = collector.finish().await;
        assert_eq!(captured, b"abc");

        use tokio::io::AsyncReadExt;
        let mut forwarded = Vec::new();
        server.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, b"abc");
    }

    #[test]
    fn test_line_splitter_orders_lines() {
        let mut splitter = LineSplitter::new();
        let mut lines = Vec::new();

        splitter.push(b"one\ntw", |l| lines.push(l.to_string()));
        splitter.push(b"o\r\nthree", |l| lines.push(l.to_string()));
        splitter.finish(|l| lines.push(l.to_string()));

        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_tee_writer_duplicates() {
        let mut tee = TeeWriter::new(Vec::new(), Vec::new());
        tee.write_all(b"copy").await.unwrap();
        tee.flush().await.unwrap();
        tee.shutdown().await.unwrap();

        let (a, b) = tee.into_parts();
        assert_eq!(a, b"copy");
        assert_eq!(b, b"copy");
    }

    #[tokio::test]
    async fn test_tee_writer_survives_second_backpressure() {
        // A one-byte duplex forces the second writer to stall; the tee
        // must still deliver every byte to both sides.
        let (client, mut server) = tokio::io::duplex(1);
        let payload = b"backpressure payload".to_vec();

        let reader = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut out = Vec::new();
            server.read_to_end(&mut out).await.unwrap();
            out
        });

        let mut tee = TeeWriter::new(Vec::new(), client);
        tee.write_all(&payload).await.unwrap();
        tee.shutdown().await.unwrap();

        let (captured, _client) = tee.into_parts();
        assert_eq!(captured, payload);

        let forwarded = reader.await.unwrap();
        assert_eq!(forwarded, payload);
    }

    #[tokio::test]
    async fn test_read_lines() {
        let reader = std::io::Cursor::new(b"a\nb\nc\n".to_vec());
        let lines = read_lines(reader).await.unwrap();
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_progress_tracker_counts() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;

        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = seen.clone();
        let config = ProgressConfig {
            enabled: true,
            interval: Duration::ZERO,
            report_lines: true,
            callback: Some(Arc::new(move |update: ProgressUpdate| {
                seen2.store(update.lines_stdout, Ordering::SeqCst);
            })),
        };

        let mut tracker = ProgressTracker::new(config);
        tracker.record_stdout(b"one\ntwo\n");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
