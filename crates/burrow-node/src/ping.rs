//! On-demand liveness ping over the standard ping protocol: 32 random bytes
//! out, the same 32 bytes back.

use libp2p::futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use rand::RngCore;
use std::io;
use std::time::{Duration, Instant};

pub const PING_SIZE: usize = 32;

/// Send one ping on an already negotiated stream and wait for the echo.
pub async fn ping_once<S>(stream: &mut S) -> io::Result<Duration>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut payload = [0u8; PING_SIZE];
    rand::thread_rng().fill_bytes(&mut payload);

    let started = Instant::now();
    stream.write_all(&payload).await?;
    stream.flush().await?;

    let mut echo = [0u8; PING_SIZE];
    stream.read_exact(&mut echo).await?;
    if echo != payload {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "ping payload mismatch"));
    }
    Ok(started.elapsed())
}
