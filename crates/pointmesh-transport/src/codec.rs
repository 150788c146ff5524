//! Newline-delimited JSON framing for socket streams.

use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

fn invalid(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Write an already encoded frame followed by a newline.
pub(crate) async fn write_line<W>(writer: &mut W, frame: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub(crate) async fn write_frame<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = serde_json::to_string(value).map_err(invalid)?;
    write_line(writer, &frame).await
}

/// Read the next non-empty line and decode it. `None` at end of stream.
pub(crate) async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let frame = line.trim();
        if frame.is_empty() {
            continue;
        }
        return serde_json::from_str(frame).map(Some).map_err(invalid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pointmesh_protocol::{Message, VoteValue};
    use tokio::io::BufReader;

    #[tokio::test]
    async fn frames_survive_a_byte_stream() {
        let (mut write, server) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(server);

        write_frame(&mut write, &Message::Vote { vote: VoteValue::Thirteen })
            .await
            .unwrap();
        write_line(&mut write, "").await.unwrap();
        write_frame(&mut write, &Message::ClearVotes).await.unwrap();
        drop(write);

        let first: Option<Message> = read_frame(&mut reader).await.unwrap();
        assert_eq!(first, Some(Message::Vote { vote: VoteValue::Thirteen }));
        let second: Option<Message> = read_frame(&mut reader).await.unwrap();
        assert_eq!(second, Some(Message::ClearVotes));
    }

    #[tokio::test]
    async fn garbage_is_invalid_data() {
        let mut reader = BufReader::new(&b"{not json\n"[..]);
        let err = read_frame::<_, Message>(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
