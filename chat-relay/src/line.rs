use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// One inbound line, terminator stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Text(String),
    /// The line exceeded the length limit and was discarded.
    TooLong,
}

/// Reads the next `\n`-terminated line, holding at most `max_length` bytes
/// in memory.
///
/// A trailing `\r` is stripped and invalid UTF-8 is replaced rather than
/// rejected. A final line without a terminator is still returned; `None`
/// means the peer closed with nothing left to read.
pub async fn read_line<R>(reader: &mut R, max_length: usize) -> io::Result<Option<Line>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut overflowed = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if line.is_empty() && !overflowed {
                return Ok(None);
            }
            return Ok(Some(finish(line, overflowed)));
        }

        let (chunk, used, complete) = match available.iter().position(|byte| *byte == b'\n') {
            Some(end) => (&available[..end], end + 1, true),
            None => (available, available.len(), false),
        };

        if !overflowed {
            if line.len() + chunk.len() > max_length {
                overflowed = true;
                line = Vec::new();
            } else {
                line.extend_from_slice(chunk);
            }
        }
        reader.consume(used);

        if complete {
            return Ok(Some(finish(line, overflowed)));
        }
    }
}

fn finish(mut line: Vec<u8>, overflowed: bool) -> Line {
    if overflowed {
        return Line::TooLong;
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Line::Text(String::from_utf8_lossy(&line).into_owned())
}

/// Writes `text` followed by a newline. The caller decides when to flush.
pub async fn write_line<W>(writer: &mut W, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(text.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}
