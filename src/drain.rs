//! Line-oriented draining of a remote output stream.

use crate::sink::OutputSink;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::task::JoinHandle;

/// Longest single line accepted before draining gives up.
pub const MAX_LINE_BYTES: usize = 256 * 1024;

/// Read `reader` to the end, calling `on_line` once per line with the line
/// terminator (`\n` or `\r\n`) removed. A final line without terminator is
/// still delivered.
pub async fn drain_lines<R, F>(reader: R, mut on_line: F) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = (&mut reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Ok(());
        }
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        } else if line.len() > MAX_LINE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line longer than {} bytes", MAX_LINE_BYTES),
            ));
        }
        on_line(&String::from_utf8_lossy(&line));
    }
}

/// Drain `reader` on a background task. Read failures are reported to the
/// sink's error channel. The returned handle completes exactly once, after
/// the stream is exhausted or has failed.
pub fn spawn_drain<R, F>(reader: R, sink: Arc<dyn OutputSink>, on_line: F) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    F: FnMut(&dyn OutputSink, &str) + Send + 'static,
{
    tokio::spawn(async move {
        let mut on_line = on_line;
        let result = drain_lines(reader, |line| on_line(sink.as_ref(), line)).await;
        if let Err(e) = result {
            sink.error(&format!("read output: {}", e));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    #[tokio::test]
    async fn test_drain_lines_strips_terminators() {
        let input: &[u8] = b"one\r\ntwo\nthree";
        let mut lines = Vec::new();
        drain_lines(input, |l| lines.push(l.to_string())).await.unwrap();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_drain_lines_accepts_long_line() {
        let mut input = vec![b'x'; MAX_LINE_BYTES];
        input.push(b'\n');
        let mut count = 0;
        drain_lines(&input[..], |l| {
            assert_eq!(l.len(), MAX_LINE_BYTES);
            count += 1;
        })
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_drain_lines_rejects_oversized_line() {
        let input = vec![b'x'; MAX_LINE_BYTES + 10];
        let err = drain_lines(&input[..], |_| {}).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_spawn_drain_reports_errors_and_completes() {
        let sink = Arc::new(MemorySink::new());
        let mut input = b"ok\n".to_vec();
        input.extend(vec![b'y'; MAX_LINE_BYTES + 1]);

        let handle = spawn_drain(std::io::Cursor::new(input), sink.clone(), |s, l| s.warn(l));
        handle.await.unwrap();

        assert_eq!(sink.warn_lines(), vec!["ok"]);
        assert_eq!(sink.errors().len(), 1);
    }
}
