use super::ProtocolError;
use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const ARRAY_MARKER: u8 = b'*';
pub const BULK_MARKER: u8 = b'$';
pub const CRLF: &[u8] = b"\r\n";

/// Largest bulk payload accepted from a client (matches the common 512MB server limit)
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
/// Largest element count accepted in one array header
pub const MAX_ARRAY_LEN: i64 = 1024 * 1024;
/// Deepest array nesting accepted in a client frame or backend reply
pub const MAX_NESTING: usize = 32;
/// Upper bound on arguments reserved up front, whatever the header declares
const PREALLOC_ARGS: usize = 64;

/// One parsed client command.
///
/// `args[0]` is the command name. `raw` holds the exact bytes read off the
/// wire so single-key commands can be forwarded untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    args: Vec<Vec<u8>>,
    raw: Vec<u8>,
    inline: bool,
}

impl CommandFrame {
    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// True when the frame came from a single unframed line
    pub fn is_inline(&self) -> bool {
        self.inline
    }

    pub fn name(&self) -> Option<&[u8]> {
        self.args.first().map(|a| a.as_slice())
    }

    /// Command name lowercased for table lookups
    pub fn name_lowercase(&self) -> String {
        self.name()
            .map(|n| String::from_utf8_lossy(n).to_ascii_lowercase())
            .unwrap_or_default()
    }
}

/// Read one line including its CRLF terminator. Returns an empty buffer on EOF.
async fn read_line<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(line);
    }
    if !line.ends_with(CRLF) {
        return Err(ProtocolError::BadFormat(
            "line is not terminated by CRLF".to_string(),
        ));
    }
    Ok(line)
}

/// Parse the integer that follows a `*` or `$` marker
fn parse_header_len(line: &[u8]) -> Result<i64, ProtocolError> {
    let digits = &line[1..line.len() - CRLF.len()];
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            ProtocolError::BadFormat(format!(
                "invalid length header '{}'",
                String::from_utf8_lossy(digits)
            ))
        })
}

/// Read `len` payload bytes followed by CRLF, appending both to `out`
async fn read_bulk_payload<R>(
    reader: &mut R,
    len: usize,
    out: &mut Vec<u8>,
) -> Result<(), ProtocolError>
where
    R: AsyncBufRead + Unpin + Send,
{
    // Memory grows with the bytes that actually arrive, not the declared length
    let expected = len + CRLF.len();
    let read = (&mut *reader)
        .take(expected as u64)
        .read_to_end(out)
        .await?;
    if read < expected {
        return Err(ProtocolError::BadFormat(format!(
            "stream ended before {} declared bulk bytes",
            len
        )));
    }
    if !out.ends_with(CRLF) {
        return Err(ProtocolError::BadFormat(format!(
            "bulk payload does not match declared length {}",
            len
        )));
    }
    Ok(())
}

/// Read `count` elements of a client array, appending the wire bytes to `raw`
fn read_array<'a, R>(
    reader: &'a mut R,
    count: i64,
    raw: &'a mut Vec<u8>,
    depth: usize,
) -> BoxFuture<'a, Result<Vec<Vec<u8>>, ProtocolError>>
where
    R: AsyncBufRead + Unpin + Send,
{
    async move {
        if !(0..=MAX_ARRAY_LEN).contains(&count) {
            return Err(ProtocolError::BadFormat(format!(
                "invalid array length {}",
                count
            )));
        }

        let mut args = Vec::with_capacity((count as usize).min(PREALLOC_ARGS));
        for i in 0..count {
            let header = read_line(reader).await?;
            if header.is_empty() {
                return Err(ProtocolError::BadFormat(format!(
                    "stream ended after {} of {} elements",
                    i, count
                )));
            }
            raw.extend_from_slice(&header);

            match header[0] {
                BULK_MARKER => {
                    let len = parse_header_len(&header)?;
                    if !(0..=MAX_BULK_LEN).contains(&len) {
                        return Err(ProtocolError::BadFormat(format!(
                            "invalid bulk length {}",
                            len
                        )));
                    }
                    let start = raw.len();
                    read_bulk_payload(reader, len as usize, raw).await?;
                    args.push(raw[start..start + len as usize].to_vec());
                }
                ARRAY_MARKER => {
                    // Nested frames are kept whole as a single argument
                    if depth >= MAX_NESTING {
                        return Err(nesting_error());
                    }
                    let nested_count = parse_header_len(&header)?;
                    let start = raw.len() - header.len();
                    read_array(reader, nested_count, raw, depth + 1).await?;
                    args.push(raw[start..].to_vec());
                }
                other => {
                    return Err(ProtocolError::BadFormat(format!(
                        "unexpected element marker '{}'",
                        other as char
                    )));
                }
            }
        }
        Ok(args)
    }
    .boxed()
}

/// Read one command frame from a client stream.
///
/// Returns `Ok(None)` on a clean end of stream between frames. A line that
/// does not start with `*` is an inline command and becomes one argument.
pub async fn read_command<R>(reader: &mut R) -> Result<Option<CommandFrame>, ProtocolError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let line = loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            return Ok(None);
        }
        // Blank keep-alive lines carry no command
        if line.as_slice() != CRLF {
            break line;
        }
    };

    if line[0] != ARRAY_MARKER {
        let arg = line[..line.len() - CRLF.len()].to_vec();
        return Ok(Some(CommandFrame {
            args: vec![arg],
            raw: line,
            inline: true,
        }));
    }

    let count = parse_header_len(&line)?;
    let mut raw = line;
    let args = read_array(reader, count, &mut raw, 1).await?;

    Ok(Some(CommandFrame {
        args,
        raw,
        inline: false,
    }))
}

fn nesting_error() -> ProtocolError {
    ProtocolError::BadFormat(format!("arrays nested deeper than {}", MAX_NESTING))
}

fn read_reply_into<'a, R>(
    reader: &'a mut R,
    out: &'a mut Vec<u8>,
    depth: usize,
) -> BoxFuture<'a, Result<(), ProtocolError>>
where
    R: AsyncBufRead + Unpin + Send,
{
    async move {
        if depth > MAX_NESTING {
            return Err(nesting_error());
        }
        let line = read_line(reader).await?;
        if line.is_empty() {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection",
            )));
        }
        out.extend_from_slice(&line);

        match line[0] {
            BULK_MARKER => {
                let len = parse_header_len(&line)?;
                // `$-1` is a null bulk with no payload
                if len >= 0 {
                    read_bulk_payload(reader, len as usize, out).await?;
                }
            }
            ARRAY_MARKER => {
                let count = parse_header_len(&line)?;
                for _ in 0..count.max(0) {
                    read_reply_into(reader, out, depth + 1).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }
    .boxed()
}

/// Read one complete reply unit from a backend, returning its raw bytes
pub async fn read_reply<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut out = Vec::new();
    read_reply_into(reader, &mut out, 1).await?;
    Ok(out)
}

/// Write bytes verbatim and flush
pub async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Encode arguments as a multi-bulk command frame
pub fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> Vec<u8> {
    let mut buf = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        let arg = arg.as_ref();
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(CRLF);
    }
    buf
}

/// Build a single-line error reply
pub fn error_reply(message: &str) -> Vec<u8> {
    let message: String = message
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect();
    format!("-ERR {}\r\n", message).into_bytes()
}

/// Merge sub-command replies into the single reply owed to the client.
///
/// One reply passes through verbatim; several become an array in the given order.
pub fn merge_replies(mut replies: Vec<Vec<u8>>) -> Vec<u8> {
    if replies.len() == 1 {
        return replies.remove(0);
    }
    let mut merged = format!("*{}\r\n", replies.len()).into_bytes();
    for reply in &replies {
        merged.extend_from_slice(reply);
    }
    merged
}
