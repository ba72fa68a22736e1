//! [tokio_util::codec] implementations for datagram transports.
//!
//! UDP delivers whole packets, so every call to `decode` consumes the complete buffer
//! as exactly one packet.
use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::DecodeError,
    protocol::{Command, Reply},
};

/// Board side codec: decodes commands and encodes replies.
#[derive(Debug, Clone, Copy)]
pub struct CommandCodec {
    max_words: usize,
}

impl CommandCodec {
    pub fn new(max_words: usize) -> CommandCodec {
        CommandCodec { max_words }
    }
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, DecodeError> {
        if src.is_empty() {
            return Ok(None);
        }
        let datagram = src.split();
        Command::decode(&datagram, self.max_words).map(Some)
    }
}

impl Encoder<Reply> for CommandCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Reply, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(item.encoded_len());
        dst.extend_from_slice(&item.encode());
        Ok(())
    }
}

/// Client side codec: decodes replies and encodes commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyCodec;

impl Decoder for ReplyCodec {
    type Item = Reply;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>, DecodeError> {
        if src.is_empty() {
            return Ok(None);
        }
        let datagram = src.split();
        Reply::decode(&datagram).map(Some)
    }
}

impl Encoder<Command> for ReplyCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(item.encoded_len());
        dst.extend_from_slice(&item.encode());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::Opcode;

    #[test]
    fn decode_consumes_whole_datagram() {
        let command = Command::with_payload(4, Opcode::FifoWrite, 0x30, &[1, 2]);
        let mut buf = BytesMut::from(&command.encode()[..]);
        let decoded = CommandCodec::new(16).decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(command));
        assert!(buf.is_empty());
        assert!(CommandCodec::new(16).decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn reply_through_both_codecs() {
        let mut buf = BytesMut::new();
        CommandCodec::new(16)
            .encode(Reply::with_payload(2, 0x8, vec![7u32]), &mut buf)
            .unwrap();
        let reply = ReplyCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(reply.psn, 2);
        assert_eq!(&*reply.payload, &[7]);
    }
}
