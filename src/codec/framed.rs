//! Length-prefixed framing shared by the built-in codecs.
//!
//! Each header and each body is one frame: a `u32` big-endian length
//! followed by the payload, encoded per the codec's value format. Peers
//! negotiate the codec by name, so both ends agree on the layout.

use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Bytes, BytesMut};
use log::error;

use super::{CodecReader, CodecWriter, ConnReader, ConnWriter, Encoding, Header};
use crate::errors::Error;

// max frame len
const FRAME_MAX_LEN: u32 = 1024 * 1024;

pub(crate) fn new_binary(
    reader: ConnReader,
    writer: ConnWriter,
) -> (Box<dyn CodecReader>, Box<dyn CodecWriter>) {
    new_framed(Encoding::Binary, reader, writer)
}

pub(crate) fn new_json(
    reader: ConnReader,
    writer: ConnWriter,
) -> (Box<dyn CodecReader>, Box<dyn CodecWriter>) {
    new_framed(Encoding::Json, reader, writer)
}

fn new_framed(
    encoding: Encoding,
    reader: ConnReader,
    writer: ConnWriter,
) -> (Box<dyn CodecReader>, Box<dyn CodecWriter>) {
    let reader = FramedReader {
        encoding,
        reader: BufReader::new(reader),
        buf: BytesMut::with_capacity(4096),
    };
    let writer = FramedWriter {
        encoding,
        writer: BufWriter::new(writer),
    };
    (Box::new(reader), Box::new(writer))
}

struct FramedReader {
    encoding: Encoding,
    reader: BufReader<ConnReader>,
    // scratch buffer reused across frames
    buf: BytesMut,
}

impl FramedReader {
    fn read_frame(&mut self) -> Result<Bytes, Error> {
        let len = self.reader.read_u32::<BigEndian>()?;
        if len > FRAME_MAX_LEN {
            let s = format!("decode too big frame length. len={len}");
            error!("{s}");
            return Err(Error::Io(std::io::Error::new(ErrorKind::InvalidInput, s)));
        }
        self.buf.resize(len as usize, 0);
        self.reader.read_exact(&mut self.buf)?;
        Ok(self.buf.split().freeze())
    }
}

impl CodecReader for FramedReader {
    fn read_header(&mut self, header: &mut Header) -> Result<(), Error> {
        let frame = self.read_frame()?;
        *header = self
            .encoding
            .decode(&frame)
            .map_err(|e| Error::Deserialize(e.to_string()))?;
        Ok(())
    }

    fn read_body(&mut self) -> Result<Bytes, Error> {
        self.read_frame()
    }
}

struct FramedWriter {
    encoding: Encoding,
    writer: BufWriter<ConnWriter>,
}

impl FramedWriter {
    fn write_frame(&mut self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() > FRAME_MAX_LEN as usize {
            return Err(Error::Serialize(format!(
                "encode too big frame length. len={}",
                payload.len()
            )));
        }
        self.writer.write_u32::<BigEndian>(payload.len() as u32)?;
        self.writer.write_all(payload)?;
        Ok(())
    }

    fn write_frames(&mut self, header: &Header, body: &[u8]) -> Result<(), Error> {
        let head = self
            .encoding
            .encode(header)
            .map_err(|e| Error::Serialize(e.to_string()))?;
        self.write_frame(&head)?;
        self.write_frame(body)?;
        self.writer.flush()?;
        Ok(())
    }
}

impl CodecWriter for FramedWriter {
    fn write(&mut self, header: &Header, body: &[u8]) -> Result<(), Error> {
        if let Err(e) = self.write_frames(header, body) {
            // a failed write leaves the stream mid-frame, tear the
            // connection down so both peers' readers unblock
            self.writer.get_ref().shutdown().ok();
            return Err(e);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        let flushed = self.writer.flush();
        // the socket may already be gone, nothing to do about it here
        self.writer.get_ref().shutdown().ok();
        flushed?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use super::super::WriteConn;

    // write half that surfaces its bytes back to the test
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl WriteConn for SharedBuf {
        fn shutdown(&self) -> std::io::Result<()> {
            Ok(())
        }
    }

    // write half whose stream is broken, recording the teardown
    struct BrokenConn {
        torn_down: Arc<AtomicBool>,
    }

    impl Write for BrokenConn {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(ErrorKind::BrokenPipe, "broken pipe"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl WriteConn for BrokenConn {
        fn shutdown(&self) -> std::io::Result<()> {
            self.torn_down.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn round_trip(encoding: Encoding) {
        let out = SharedBuf::default();
        let (_, mut writer) = match encoding {
            Encoding::Binary => new_binary(Box::new(std::io::empty()), Box::new(out.clone())),
            Encoding::Json => new_json(Box::new(std::io::empty()), Box::new(out.clone())),
        };

        let header = Header {
            service_method: "Foo.Sum".to_owned(),
            seq: 3,
            error: String::new(),
        };
        let body = encoding.encode(&(1u32, 2u32)).unwrap();
        writer.write(&header, &body).unwrap();

        let bytes = out.0.lock().unwrap().clone();
        let (mut reader, _) = match encoding {
            Encoding::Binary => {
                new_binary(Box::new(std::io::Cursor::new(bytes)), Box::new(SharedBuf::default()))
            }
            Encoding::Json => {
                new_json(Box::new(std::io::Cursor::new(bytes)), Box::new(SharedBuf::default()))
            }
        };

        let mut decoded = Header::default();
        reader.read_header(&mut decoded).unwrap();
        assert_eq!(decoded, header);
        let body = reader.read_body().unwrap();
        let args: (u32, u32) = encoding.decode(&body).unwrap();
        assert_eq!(args, (1, 2));
    }

    #[test]
    fn binary_header_body_round_trip() {
        round_trip(Encoding::Binary);
    }

    #[test]
    fn json_header_body_round_trip() {
        round_trip(Encoding::Json);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut bytes = Vec::new();
        bytes.write_u32::<BigEndian>(FRAME_MAX_LEN + 1).unwrap();
        let (mut reader, _) = new_binary(
            Box::new(std::io::Cursor::new(bytes)),
            Box::new(SharedBuf::default()),
        );
        assert!(reader.read_header(&mut Header::default()).is_err());
    }

    #[test]
    fn failed_write_tears_the_connection_down() {
        let torn_down = Arc::new(AtomicBool::new(false));
        let conn = BrokenConn {
            torn_down: torn_down.clone(),
        };
        let (_, mut writer) = new_binary(Box::new(std::io::empty()), Box::new(conn));

        let header = Header {
            service_method: "Foo.Sum".to_owned(),
            seq: 1,
            error: String::new(),
        };
        assert!(writer.write(&header, &[]).is_err());
        assert!(torn_down.load(Ordering::SeqCst));
    }

    #[test]
    fn empty_body_frame_round_trips() {
        let out = SharedBuf::default();
        let (_, mut writer) = new_binary(Box::new(std::io::empty()), Box::new(out.clone()));
        let header = Header {
            service_method: "Foo.Sum".to_owned(),
            seq: 1,
            error: "rpc server: can't find method Sum".to_owned(),
        };
        writer.write(&header, &[]).unwrap();

        let bytes = out.0.lock().unwrap().clone();
        let (mut reader, _) = new_binary(
            Box::new(std::io::Cursor::new(bytes)),
            Box::new(SharedBuf::default()),
        );
        let mut decoded = Header::default();
        reader.read_header(&mut decoded).unwrap();
        assert_eq!(decoded.error, header.error);
        assert!(reader.read_body().unwrap().is_empty());
    }
}
