//! Read and write implementations for the protocol packets.
//!
//! Every field is a big-endian (network order) `u32`. The layout never depends on
//! the in-memory representation of [Command] or [Reply].
use std::io::{self, Cursor, Read, Write};

use crate::{
    error::DecodeError,
    protocol::{COMMAND_HEADER_SIZE, Command, Opcode, REPLY_HEADER_SIZE, Reply, WORD_SIZE},
};

fn read_word(reader: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; WORD_SIZE];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn encode_words(out: &mut Vec<u8>, words: &[u32]) {
    for word in words {
        out.extend_from_slice(&word.to_be_bytes());
    }
}

fn read_words(reader: &mut impl Read, count: usize) -> io::Result<Box<[u32]>> {
    (0..count).map(|_| read_word(reader)).collect()
}

fn check_trailing(cursor: &Cursor<&[u8]>) -> Result<(), DecodeError> {
    let rest = cursor.get_ref().len() - cursor.position() as usize;
    if rest != 0 {
        return Err(DecodeError::TrailingBytes(rest));
    }
    Ok(())
}

impl Command {
    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.encode())
    }

    /// Encodes the command into a freshly allocated datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        encode_words(
            &mut out,
            &[self.psn, self.opcode.into(), self.value_count, self.address],
        );
        encode_words(&mut out, &self.payload);
        out
    }

    /// Reads a command from a stream.
    /// `max_words` bounds the payload a peer may announce.
    pub fn from_reader(reader: &mut impl Read, max_words: usize) -> Result<Command, DecodeError> {
        let psn = read_word(reader)?;
        let raw_opcode = read_word(reader)?;
        let opcode = Opcode::try_from(raw_opcode).map_err(DecodeError::InvalidOpcode)?;
        let value_count = read_word(reader)?;
        let address = read_word(reader)?;

        let payload = if opcode.carries_payload() {
            if value_count as usize > max_words {
                return Err(DecodeError::TooManyWords {
                    max: max_words,
                    got: value_count as usize,
                });
            }
            read_words(reader, value_count as usize)?
        } else {
            Box::default()
        };

        Ok(Command {
            psn,
            opcode,
            value_count,
            address,
            payload,
        })
    }

    /// Decodes a command from a complete datagram.
    pub fn decode(datagram: &[u8], max_words: usize) -> Result<Command, DecodeError> {
        if datagram.len() < COMMAND_HEADER_SIZE {
            return Err(DecodeError::Truncated {
                expected: COMMAND_HEADER_SIZE,
                got: datagram.len(),
            });
        }
        let mut cursor = Cursor::new(datagram);
        let command = Command::from_reader(&mut cursor, max_words).map_err(|e| match e {
            DecodeError::IoError(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                DecodeError::Truncated {
                    expected: COMMAND_HEADER_SIZE
                        + datagram_payload_words(datagram) as usize * WORD_SIZE,
                    got: datagram.len(),
                }
            }
            other => other,
        })?;
        check_trailing(&cursor)?;
        Ok(command)
    }
}

/// value count field of a datagram that is known to hold at least a full header
fn datagram_payload_words(datagram: &[u8]) -> u32 {
    let mut buf = [0u8; WORD_SIZE];
    buf.copy_from_slice(&datagram[2 * WORD_SIZE..3 * WORD_SIZE]);
    u32::from_be_bytes(buf)
}

impl Reply {
    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.encode())
    }

    /// Encodes the reply into a freshly allocated datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        encode_words(&mut out, &[self.psn, self.address]);
        encode_words(&mut out, &self.payload);
        out
    }

    /// Decodes a reply from a complete datagram.
    ///
    /// Replies have no length field, every word after the header is payload.
    pub fn decode(datagram: &[u8]) -> Result<Reply, DecodeError> {
        if datagram.len() < REPLY_HEADER_SIZE {
            return Err(DecodeError::Truncated {
                expected: REPLY_HEADER_SIZE,
                got: datagram.len(),
            });
        }
        if datagram.len() % WORD_SIZE != 0 {
            return Err(DecodeError::Misaligned(datagram.len()));
        }
        let mut cursor = Cursor::new(datagram);
        let psn = read_word(&mut cursor)?;
        let address = read_word(&mut cursor)?;
        let payload = read_words(&mut cursor, (datagram.len() - REPLY_HEADER_SIZE) / WORD_SIZE)?;
        Ok(Reply {
            psn,
            address,
            payload,
        })
    }
}

#[cfg(test)]
mod test {
    use crate::error::DecodeError;
    use crate::protocol::{Command, Opcode, Reply};

    const DEFAULT_MAX_WORDS: usize = 364;

    #[test]
    fn write_read_command() {
        let cmd = Command::new(7, Opcode::Read, 0x0000_0100, 4);
        assert_eq!(
            cmd.encode(),
            vec![
                0x00, 0x00, 0x00, 0x07, // psn
                0x00, 0x00, 0x00, 0x01, // opcode
                0x00, 0x00, 0x00, 0x04, // value count
                0x00, 0x00, 0x01, 0x00, // address
            ]
        );
    }

    #[test]
    fn write_write_command() {
        let cmd = Command::with_payload(1, Opcode::Write, 0x10, &[0xA5, 0xDEAD_BEEF]);
        let out = cmd.encode();
        assert_eq!(out.len(), 24);
        assert_eq!(&out[4..8], &[0, 0, 0, 2]);
        assert_eq!(&out[8..12], &[0, 0, 0, 2]);
        assert_eq!(&out[16..20], &[0, 0, 0, 0xA5]);
        assert_eq!(&out[20..24], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn read_write_command() {
        let mut data = Vec::new();
        for word in [3u32, 0x02, 2, 0x20, 0x1111_1111, 0x2222_2222] {
            data.extend_from_slice(&word.to_be_bytes());
        }
        let cmd = Command::decode(&data, DEFAULT_MAX_WORDS).unwrap();
        assert_eq!(cmd.psn, 3);
        assert_eq!(cmd.opcode, Opcode::Write);
        assert_eq!(cmd.address, 0x20);
        assert_eq!(&*cmd.payload, &[0x1111_1111, 0x2222_2222]);
    }

    #[test]
    fn read_command_has_no_payload() {
        let cmd = Command::new(9, Opcode::Read, 0x40, 100);
        let decoded = Command::decode(&cmd.encode(), DEFAULT_MAX_WORDS).unwrap();
        assert_eq!(decoded.value_count, 100);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn wait_for_pps_opcode() {
        let out = Command::new(0, Opcode::WaitForPps, 0, 0).encode();
        assert_eq!(&out[4..8], &[0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn invalid_opcode() {
        let mut data = Command::new(1, Opcode::Read, 0, 1).encode();
        data[7] = 0x05;
        match Command::decode(&data, DEFAULT_MAX_WORDS) {
            Err(DecodeError::InvalidOpcode(op)) => assert_eq!(op, 0x05),
            other => panic!("expected InvalidOpcode, got {:?}", other),
        }
    }

    #[test]
    fn truncated_payload() {
        let data = Command::with_payload(1, Opcode::Write, 0, &[1, 2, 3]).encode();
        match Command::decode(&data[..20], DEFAULT_MAX_WORDS) {
            Err(DecodeError::Truncated { expected, got }) => {
                assert_eq!(expected, 28);
                assert_eq!(got, 20);
            }
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn too_many_words() {
        let data = Command::with_payload(1, Opcode::Write, 0, &[0; 5]).encode();
        match Command::decode(&data, 4) {
            Err(DecodeError::TooManyWords { max, got }) => {
                assert_eq!(max, 4);
                assert_eq!(got, 5);
            }
            other => panic!("expected TooManyWords, got {:?}", other),
        }
    }

    #[test]
    fn trailing_bytes() {
        let mut data = Command::new(1, Opcode::ResetBoard, 0, 0).encode();
        data.extend_from_slice(&[0, 0]);
        assert!(matches!(
            Command::decode(&data, DEFAULT_MAX_WORDS),
            Err(DecodeError::TrailingBytes(2))
        ));
    }

    #[test]
    fn write_ack_reply() {
        assert_eq!(
            Reply::ack(0x0102_0304, 0x10).encode(),
            vec![1, 2, 3, 4, 0, 0, 0, 0x10]
        );
    }

    #[test]
    fn read_reply_with_payload() {
        let data = Reply::with_payload(5, 0x100, vec![1u32, 2, 3]).encode();
        let reply = Reply::decode(&data).unwrap();
        assert_eq!(reply.psn, 5);
        assert_eq!(reply.address, 0x100);
        assert_eq!(&*reply.payload, &[1, 2, 3]);
    }

    #[test]
    fn short_reply() {
        assert!(matches!(
            Reply::decode(&[0, 0, 0, 1]),
            Err(DecodeError::Truncated {
                expected: 8,
                got: 4
            })
        ));
        assert!(matches!(
            Reply::decode(&[0; 10]),
            Err(DecodeError::Misaligned(10))
        ));
    }
}
