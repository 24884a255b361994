use std::{error, fmt, io};

use bytes::Buf;
use tokio_util::codec;

use super::protocol::{Command, MutateOp, Response};
use crate::types::job::Job;

/// Maximum line length accepted before a connection is considered
/// out-of-sync with the server and recovered via [`Decoder::DiscardToLine`].
/// Generous relative to a typical job document, since `PUSH`'s JSON body
/// rides on the same line.
const MAX_LINE: usize = 8 * 1024 * 1024;

/// A decoder for post-handshake Faktory protocol lines. Faktory frames one
/// command per line (`\n`- or `\r\n`-terminated) rather than beanstalkd's
/// length-prefixed job bodies, so there is no multi-chunk parse state: each
/// call either yields a full command or asks for more bytes.
#[derive(Debug, Default)]
pub enum Decoder {
    #[default]
    ParseLine,
    /// Entered after a client error that leaves the stream out of sync;
    /// discards bytes up to and including the next line terminator, then
    /// resumes normal parsing.
    DiscardToLine,
}

impl codec::Decoder for Decoder {
    type Item = Command;

    type Error = Error;

    fn decode(
        &mut self,
        src: &mut bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        match *self {
            Decoder::ParseLine => match find_line(src) {
                Some(idx) => {
                    let line = src.split_to(idx);
                    src.advance(1); // discard the \n

                    let line = strip_cr(&line);

                    match parse_command(line) {
                        Ok(cmd) => Ok(Some(cmd)),
                        Err(resp) => {
                            *self = Self::DiscardToLine;
                            Err(resp.into())
                        },
                    }
                },
                None => {
                    if src.len() > MAX_LINE {
                        *self = Self::DiscardToLine;
                        Err(Response::Error(crate::error::FaktoryError::Malformed(
                            "line too long".to_string(),
                        ))
                        .into())
                    } else {
                        Ok(None)
                    }
                },
            },
            Decoder::DiscardToLine => {
                if src.is_empty() {
                    return Ok(None);
                }

                if let Some(idx) = find_line(src) {
                    src.advance(idx + 1);
                    *self = Self::ParseLine;
                    // Recurse once now that we're back in sync, rather than
                    // surfacing a synthetic "discarded" event the dispatcher
                    // would have to special-case.
                    self.decode(src)
                } else {
                    src.advance(src.len() - 1);
                    Ok(None)
                }
            },
        }
    }
}

fn find_line(src: &[u8]) -> Option<usize> {
    src.iter().position(|&b| b == b'\n')
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((b'\r', rest)) => rest,
        _ => line,
    }
}

fn parse_command(line: &[u8]) -> Result<Command, Response> {
    let bad = || Response::Error(crate::error::FaktoryError::Malformed("bad request".to_string()));

    let line = std::str::from_utf8(line).map_err(|_| bad())?;
    let (verb, rest) = match line.split_once(' ') {
        Some((v, r)) => (v, r),
        None => (line, ""),
    };

    match verb {
        "PUSH" => {
            let job: Job = serde_json::from_str(rest).map_err(|_| bad())?;
            Ok(Command::Push(job))
        },
        "FETCH" => {
            let queues: Vec<String> =
                rest.split_whitespace().map(str::to_string).collect();
            Ok(Command::Fetch { queues })
        },
        "ACK" => {
            let doc: AckDoc = serde_json::from_str(rest).map_err(|_| bad())?;
            Ok(Command::Ack { jid: doc.jid })
        },
        "FAIL" => {
            let doc: FailDoc = serde_json::from_str(rest).map_err(|_| bad())?;
            Ok(Command::Fail {
                jid: doc.jid,
                errtype: doc.errtype,
                message: doc.message,
                backtrace: doc.backtrace,
            })
        },
        "BEAT" => {
            let doc: BeatDoc = serde_json::from_str(rest).map_err(|_| bad())?;
            Ok(Command::Beat {
                wid: doc.wid,
                current_state: doc.current_state,
            })
        },
        "INFO" => Ok(Command::Info),
        "FLUSH" => Ok(Command::Flush),
        "MUTATE" => {
            let op: MutateOp = serde_json::from_str(rest).map_err(|_| bad())?;
            Ok(Command::Mutate(op))
        },
        "END" => Ok(Command::End),
        other => Err(Response::Error(crate::error::FaktoryError::Malformed(
            format!("Unknown command {other}"),
        ))),
    }
}

#[derive(serde::Deserialize)]
struct AckDoc {
    jid: String,
}

#[derive(serde::Deserialize)]
struct FailDoc {
    jid: String,
    #[serde(default)]
    errtype: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    backtrace: Option<Vec<String>>,
}

#[derive(serde::Deserialize)]
struct BeatDoc {
    wid: String,
    #[serde(default)]
    current_state: Option<String>,
}

#[derive(Debug)]
pub enum Error {
    Client(Response),
    IO(io::Error),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<Response> for Error {
    fn from(value: Response) -> Self {
        Self::Client(value)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::IO(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;
    use tokio_util::codec::FramedRead;

    fn stream_from(lines: &[&str]) -> Vec<u8> {
        let mut s = lines.join("\r\n");
        s.push_str("\r\n");
        s.into_bytes()
    }

    #[tokio::test]
    async fn parses_a_normal_sequence() {
        let stream = stream_from(&[
            r#"PUSH {"jid":"a","jobtype":"T"}"#,
            "FETCH default high",
            r#"ACK {"jid":"a"}"#,
            "INFO",
            "END",
        ]);

        let decoder: Decoder = Default::default();
        let mut framed = FramedRead::new(stream.as_ref(), decoder);

        assert!(matches!(
            framed.next().await.unwrap().unwrap(),
            Command::Push(_)
        ));
        assert_eq!(
            framed.next().await.unwrap().unwrap(),
            Command::Fetch {
                queues: vec!["default".to_string(), "high".to_string()]
            }
        );
        assert_eq!(
            framed.next().await.unwrap().unwrap(),
            Command::Ack { jid: "a".to_string() }
        );
        assert_eq!(framed.next().await.unwrap().unwrap(), Command::Info);
        assert_eq!(framed.next().await.unwrap().unwrap(), Command::End);
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn unknown_verb_recovers_on_next_line() {
        let stream = stream_from(&["BOGUS foo", "INFO"]);

        let decoder: Decoder = Default::default();
        let mut framed = FramedRead::new(stream.as_ref(), decoder);

        assert!(matches!(
            framed.next().await.unwrap(),
            Err(Error::Client(Response::Error(_)))
        ));
        assert_eq!(framed.next().await.unwrap().unwrap(), Command::Info);
    }

    #[tokio::test]
    async fn accepts_bare_lf() {
        let stream = b"INFO\nEND\n".to_vec();
        let decoder: Decoder = Default::default();
        let mut framed = FramedRead::new(stream.as_ref(), decoder);

        assert_eq!(framed.next().await.unwrap().unwrap(), Command::Info);
        assert_eq!(framed.next().await.unwrap().unwrap(), Command::End);
    }
}
