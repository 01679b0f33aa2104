//! One task per control channel.
//!
//! The task owns the transport and the [`Session`]. It reads one request
//! line, lets the session decide, forwards authorized commands to the
//! dispatcher and writes the reply before reading the next line, so output
//! of two commands on one channel can never interleave.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::dispatcher::DispatchHandle;
use super::error::{ControlError, ControlResult};
use super::protocol::{Reply, Status};
use super::session::{Session, SessionAction};
use crate::telemetry::{self, AuditEvent};

/// Default maximum request line length in bytes.
pub const DEFAULT_LINE_LIMIT: usize = 32 * 1024;

/// Drive one channel until it closes.
///
/// Returns `Ok` for an orderly close (peer EOF, `quit`, authentication
/// limit) and an error for I/O failures and protocol violations. Either way
/// the session ends up closed.
pub async fn serve_channel<R, W>(
    mut reader: R,
    mut writer: W,
    mut session: Session,
    dispatch: DispatchHandle,
    line_limit: usize,
) -> ControlResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = drive(&mut reader, &mut writer, &mut session, &dispatch, line_limit).await;
    session.close();

    match &result {
        Ok(()) => debug!("Channel {} ({}) finished", session.id(), session.kind()),
        Err(ControlError::ProtocolViolation(msg)) => {
            warn!("Closing channel {} ({}): {}", session.id(), session.kind(), msg);
            let _ = write_reply(&mut writer, &Reply::new(Status::Close, msg.as_str())).await;
        }
        Err(e) => info!("Channel {} ({}) ended: {}", session.id(), session.kind(), e),
    }
    if let Some(logger) = telemetry::try_audit() {
        logger.log(AuditEvent::ChannelClosed {
            session: session.id(),
            channel: session.kind(),
        });
    }
    result
}

async fn drive<R, W>(
    reader: &mut R,
    writer: &mut W,
    session: &mut Session,
    dispatch: &DispatchHandle,
    line_limit: usize,
) -> ControlResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let greeting = session.open();
    write_reply(writer, &greeting).await?;

    let mut buf = Vec::with_capacity(256);
    loop {
        let Some(line) = read_request(reader, line_limit, &mut buf).await? else {
            return Ok(());
        };

        match session.handle_line(&line) {
            SessionAction::Ignore => {}
            SessionAction::Reply(reply) => write_reply(writer, &reply).await?,
            SessionAction::Execute(words) => {
                let reply = dispatch.execute(session, words).await?;
                write_reply(writer, &reply).await?;
            }
            SessionAction::Close(reply) => {
                if let Some(reply) = reply {
                    write_reply(writer, &reply).await?;
                }
                return Ok(());
            }
        }
    }
}

/// Read one `\n`-terminated request line of at most `limit` bytes.
///
/// `None` means the peer closed the stream.
pub async fn read_request<R>(
    reader: &mut R,
    limit: usize,
    buf: &mut Vec<u8>,
) -> ControlResult<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = (&mut *reader)
        .take(limit as u64 + 1)
        .read_until(b'\n', buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > limit {
        return Err(ControlError::ProtocolViolation(format!(
            "Request line exceeds {limit} bytes"
        )));
    }

    match std::str::from_utf8(buf) {
        Ok(line) => Ok(Some(line.to_string())),
        Err(_) => Err(ControlError::ProtocolViolation(
            "Request line is not valid UTF-8".to_string(),
        )),
    }
}

/// Write one framed reply and flush.
pub async fn write_reply<W>(writer: &mut W, reply: &Reply) -> ControlResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&reply.encode()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_request_lines() {
        let data: &[u8] = b"ping\r\nparam.show -l\nlast";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();

        assert_eq!(read_request(&mut reader, 64, &mut buf).await.unwrap().as_deref(), Some("ping"));
        assert_eq!(
            read_request(&mut reader, 64, &mut buf).await.unwrap().as_deref(),
            Some("param.show -l")
        );
        assert_eq!(read_request(&mut reader, 64, &mut buf).await.unwrap().as_deref(), Some("last"));
        assert!(read_request(&mut reader, 64, &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_request_too_long() {
        let data = vec![b'a'; 100];
        let mut reader = BufReader::new(&data[..]);
        let mut buf = Vec::new();
        let err = read_request(&mut reader, 10, &mut buf).await.unwrap_err();
        assert!(matches!(err, ControlError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_read_request_exactly_at_limit() {
        let data: &[u8] = b"0123456789\n";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();
        assert_eq!(
            read_request(&mut reader, 10, &mut buf).await.unwrap().as_deref(),
            Some("0123456789")
        );
    }

    #[tokio::test]
    async fn test_read_request_rejects_binary() {
        let data: &[u8] = b"\xff\xfe\n";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();
        let err = read_request(&mut reader, 64, &mut buf).await.unwrap_err();
        assert!(matches!(err, ControlError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_write_reply_frames() {
        let mut out = Vec::new();
        write_reply(&mut out, &Reply::ok("hi")).await.unwrap();
        assert_eq!(out, b"200 2       \nhi\n");
    }
}
