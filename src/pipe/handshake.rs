//! The pipe handshake (spec §4.D.1): both sides exchange an 8-byte record
//! `[0, 'S', 'P', 0, PH, PL, 0, 0]` carrying their 16-bit protocol id before
//! either side frames application data. Grounded on the teacher's
//! `miniprotocols::handshake`, generalized from a CBOR-encoded
//! version-proposal/refusal exchange down to this spec's fixed-width,
//! unversioned record (spec §1 Non-goals: no content inspection, no
//! negotiated versions — protocol-id equality is the whole contract).

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{Error, ErrorKind};

pub const RECORD_LEN: usize = 8;

/// Handshake deadline (spec §4.D.1): not user-tunable.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn encode_record(protocol: u16) -> [u8; RECORD_LEN] {
    let [hi, lo] = protocol.to_be_bytes();
    [0, b'S', b'P', 0, hi, lo, 0, 0]
}

fn decode_record(buf: &[u8; RECORD_LEN]) -> Result<u16, Error> {
    if buf[0] != 0 || buf[1] != b'S' || buf[2] != b'P' || buf[3] != 0 || buf[6] != 0 || buf[7] != 0
    {
        return Err(Error::new(ErrorKind::Protocol));
    }
    Ok(u16::from_be_bytes([buf[4], buf[5]]))
}

/// Runs both halves of the handshake concurrently under one 10s deadline,
/// returning the peer's advertised protocol id. A stream closure observed
/// here is reported as `connection-shutdown`, not `closed` — spec §4.D.1
/// rule 4 and the §7 canonical translation table both single out handshake
/// closure as its own kind, distinct from a mid-stream close.
pub async fn perform<S>(stream: &mut S, local_protocol: u16) -> Result<u16, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(&mut *stream);

    let exchange = async {
        let write = async {
            writer
                .write_all(&encode_record(local_protocol))
                .await
                .map_err(Error::from)
        };
        let mut buf = [0u8; RECORD_LEN];
        let read = async {
            match reader.read_exact(&mut buf).await {
                Ok(_) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    Err(Error::new(ErrorKind::ConnectionShutdown))
                }
                Err(err) => Err(Error::from(err)),
            }
        };
        let (write_result, read_result) = tokio::join!(write, read);
        write_result?;
        read_result?;
        decode_record(&buf)
    };

    match timeout(HANDSHAKE_TIMEOUT, exchange).await {
        Ok(result) => result,
        Err(_) => Err(Error::new(ErrorKind::Timeout)),
    }
}
