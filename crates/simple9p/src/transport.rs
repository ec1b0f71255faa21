//! Length-prefixed frames over a duplex byte stream.

use {
    crate::{fcall::HEADERSZ, io_err, res},
    byteorder::{ByteOrder, LittleEndian},
    bytes::BytesMut,
    std::{io, time::Duration},
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};

const RETRY_DELAY: Duration = Duration::from_millis(1);

/// Whether an I/O error is worth another attempt, sleeping first if needed
async fn should_retry(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::Interrupted => true,
        io::ErrorKind::WouldBlock => {
            tokio::time::sleep(RETRY_DELAY).await;
            true
        }
        _ => false,
    }
}

/// Fill `buf`, returning how many bytes arrived before end of stream
async fn read_full<R>(r: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if should_retry(&e).await => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read one frame, size prefix included.
///
/// Returns `None` on a clean end of stream at a frame boundary. A partial
/// frame, or a declared size outside `7..=max`, is an error.
pub async fn read_frame<R>(r: &mut R, max: u32) -> io::Result<Option<BytesMut>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; 4];
    match read_full(r, &mut prefix).await? {
        0 => return Ok(None),
        4 => {}
        _ => return res!(io_err!(UnexpectedEof, "Truncated size prefix")),
    }

    let size = LittleEndian::read_u32(&prefix);
    if size < HEADERSZ || size > max {
        return res!(io_err!(InvalidData, format!("Invalid frame size {}", size)));
    }

    let mut frame = BytesMut::zeroed(size as usize);
    frame[..4].copy_from_slice(&prefix);
    if read_full(r, &mut frame[4..]).await? != size as usize - 4 {
        return res!(io_err!(UnexpectedEof, "Truncated frame"));
    }
    Ok(Some(frame))
}

/// Write one complete frame
pub async fn write_frame<W>(w: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if frame.len() < HEADERSZ as usize {
        return res!(io_err!(InvalidInput, "Frame shorter than header"));
    }

    let mut written = 0;
    while written < frame.len() {
        match w.write(&frame[written..]).await {
            Ok(0) => return res!(io_err!(WriteZero, "Peer stopped accepting data")),
            Ok(n) => written += n,
            Err(e) if should_retry(&e).await => continue,
            Err(e) => return Err(e),
        }
    }

    loop {
        match w.flush().await {
            Ok(()) => return Ok(()),
            Err(e) if should_retry(&e).await => continue,
            Err(e) => return Err(e),
        }
    }
}
