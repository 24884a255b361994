use std::{error, fmt, io};

use bytes::BufMut;
use tokio_util::codec;

use super::protocol::Response;

/// Encodes [`Response`]s per the framing spec.md §4.1 defines: `+` simple
/// string, `-` error, `$<n>` length-prefixed blob (`$-1` for null),
/// everything terminated by `\r\n`.
#[derive(Debug, Default)]
pub struct Encoder {}

impl codec::Encoder<Response> for Encoder {
    type Error = Error;

    fn encode(
        &mut self,
        item: Response,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Response::Ok => dst.put_slice(b"+OK\r\n"),

            Response::Error(err) => {
                let tag = err.tag();
                let msg = err.message();
                dst.reserve(1 + tag.len() + 1 + msg.len() + 2);
                dst.put_u8(b'-');
                dst.put_slice(tag.as_bytes());
                dst.put_u8(b' ');
                dst.put_slice(msg.as_bytes());
                dst.put_slice(b"\r\n");
            },

            Response::Blob(None) => dst.put_slice(b"$-1\r\n"),

            Response::Blob(Some(bytes)) => {
                let len_str = bytes.len().to_string();
                dst.reserve(1 + len_str.len() + 2 + bytes.len() + 2);

                dst.put_u8(b'$');
                dst.put_slice(len_str.as_bytes());
                dst.put_slice(b"\r\n");
                dst.put_slice(&bytes);
                dst.put_slice(b"\r\n");
            },

            Response::SimpleJson(value) => {
                let json = serde_json::to_string(&value)?;
                dst.reserve(1 + json.len() + 2);
                dst.put_u8(b'+');
                dst.put_slice(json.as_bytes());
                dst.put_slice(b"\r\n");
            },
        }

        Ok(())
    }
}

#[derive(Debug)]
pub enum Error {
    IO(io::Error),
    Serde(serde_json::Error),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaktoryError;
    use tokio_util::codec::Encoder as _;

    #[test]
    fn encodes_ok() {
        let mut enc = Encoder::default();
        let mut buf = bytes::BytesMut::new();
        enc.encode(Response::Ok, &mut buf).unwrap();
        assert_eq!(&buf[..], b"+OK\r\n");
    }

    #[test]
    fn encodes_error_with_tag() {
        let mut enc = Encoder::default();
        let mut buf = bytes::BytesMut::new();
        enc.encode(
            Response::Error(FaktoryError::NotFound("unknown jid".to_string())),
            &mut buf,
        )
        .unwrap();
        assert_eq!(&buf[..], b"-NOTFOUND unknown jid\r\n");
    }

    #[test]
    fn encodes_null_blob() {
        let mut enc = Encoder::default();
        let mut buf = bytes::BytesMut::new();
        enc.encode(Response::Blob(None), &mut buf).unwrap();
        assert_eq!(&buf[..], b"$-1\r\n");
    }

    #[test]
    fn encodes_blob_with_length_prefix() {
        let mut enc = Encoder::default();
        let mut buf = bytes::BytesMut::new();
        enc.encode(Response::Blob(Some(b"hi".to_vec())), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"$2\r\nhi\r\n");
    }
}
