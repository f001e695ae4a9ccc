//! Wire framing between the bridge and the helper module.
//!
//! Request: `<token>\n<json>` then EOF. Response: any number of diagnostic
//! lines, a line equal to `<token>`, then (when output is expected) one JSON
//! value. A diagnostic line that happens to equal the token is taken as the
//! marker, so framing is best-effort and relies on tokens being hard to guess.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BridgeError, Result};

/// JSON body for the request. A call without input still sends `""` so the
/// child's parser always has something to consume.
pub(crate) fn encode_input<I: Serialize + ?Sized>(input: Option<&I>) -> Result<Vec<u8>> {
    Ok(match input {
        Some(value) => serde_json::to_vec(value)?,
        None => serde_json::to_vec("")?,
    })
}

/// Write the token line and payload, then close the stream.
pub(crate) async fn write_request<W>(mut writer: W, token: &str, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(token.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    writer.shutdown().await
}

/// Forward every line before the token to `on_line`. Returns whether the token
/// was seen; `false` means the stream ended first.
pub(crate) async fn drain_diagnostics<R, F>(reader: &mut R, token: &str, mut on_line: F) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(&str),
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(false);
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches('\n').trim_end_matches('\r');
        if line == token {
            return Ok(true);
        }
        on_line(line);
    }
}

/// Read the rest of the stream and decode the first JSON value in it.
pub(crate) async fn read_payload<R, O>(reader: &mut R, echoed: bool) -> io::Result<Result<O>>
where
    R: AsyncRead + Unpin,
    O: DeserializeOwned,
{
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await?;
    if !echoed {
        return Ok(Err(BridgeError::Deserialization(
            "script exited without publishing output".to_string(),
        )));
    }
    Ok(decode_payload(&body))
}

fn decode_payload<O: DeserializeOwned>(body: &[u8]) -> Result<O> {
    let mut values = serde_json::Deserializer::from_slice(body).into_iter::<O>();
    match values.next() {
        Some(Ok(value)) => {
            if body.len() > values.byte_offset()
                && !body[values.byte_offset()..].iter().all(u8::is_ascii_whitespace)
            {
                tracing::warn!(
                    "ignoring {} bytes written after the script output",
                    body.len() - values.byte_offset()
                );
            }
            Ok(value)
        }
        Some(Err(e)) => Err(BridgeError::Deserialization(e.to_string())),
        None => Err(BridgeError::Deserialization("script output is empty".to_string())),
    }
}
