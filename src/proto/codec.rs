//! Line-delimiting codec bridging the socket to wire lines.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

/// Frames an IRC byte stream into lines.
///
/// Incoming lines are split on `\n` with an optional preceding `\r`, so bare
/// LF terminators are tolerated. Decoding is lossy UTF-8. Encoding appends
/// CRLF when the caller did not provide one, so every queued item leaves the
/// socket as exactly one wire line.
#[derive(Default)]
pub struct IrcCodec {
    next_index: usize,
}

impl IrcCodec {
    /// Creates a new codec.
    pub fn new() -> IrcCodec {
        IrcCodec::default()
    }
}

impl Decoder for IrcCodec {
    type Item = String;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Error> {
        eprintln!("DEBUG decode called, src.len()={} next_index={}", src.len(), self.next_index);
        if let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') {
            let line = src.split_to(self.next_index + offset + 1);

            // Found a newline, so the next scan starts from the buffer head.
            self.next_index = 0;

            let mut decoded = String::from_utf8_lossy(&line).into_owned();
            while decoded.ends_with('\n') || decoded.ends_with('\r') {
                decoded.pop();
            }
            Ok(Some(decoded))
        } else {
            // None of the bytes seen so far are newlines; remember that.
            self.next_index = src.len();
            Ok(None)
        }
    }
}

impl Encoder<String> for IrcCodec {
    type Error = Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Error> {
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        if !line.ends_with("\r\n") {
            dst.put_slice(b"\r\n");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::IrcCodec;
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn decodes_crlf_and_bare_lf() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::from(&b"PING :a\r\nPING :b\nPING :partial"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("PING :a"));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("PING :b"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"\r\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("PING :partial")
        );
    }

    #[test]
    fn decode_is_lossy_on_bad_utf8() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::from(&b"PING :\xff\r\n"[..]);
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert!(line.starts_with("PING :"));
    }

    #[test]
    fn encode_appends_crlf_once() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("NICK ferris".to_string(), &mut buf).unwrap();
        codec.encode("QUIT :bye\r\n".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"NICK ferris\r\nQUIT :bye\r\n");
    }
}
