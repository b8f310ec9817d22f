use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::codec::BINARY_CODEC;
use crate::errors::Error;

/// The fixed constant every connection preamble must carry.
pub const MAGIC_NUMBER: u32 = 0x3befc;

/// The per-connection preamble.
///
/// The option is always exchanged as one bare JSON value so the codec for
/// the rest of the connection can be selected by its decoded string name.
/// Every header/body pair after it is encoded by the negotiated codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOption {
    /// Must equal [`MAGIC_NUMBER`]; a mismatch aborts the connection.
    #[serde(rename = "MagicNumber")]
    pub magic_number: u32,
    /// Registry name of the codec used for all subsequent messages.
    #[serde(rename = "CodecType")]
    pub codec_type: String,
}

impl ConnectOption {
    /// An option selecting the named codec.
    pub fn with_codec(codec_type: &str) -> Self {
        ConnectOption {
            magic_number: MAGIC_NUMBER,
            codec_type: codec_type.to_owned(),
        }
    }
}

impl Default for ConnectOption {
    fn default() -> Self {
        ConnectOption::with_codec(BINARY_CODEC)
    }
}

/// Normalize the dial options: at most one may be supplied.
pub(crate) fn parse_options(opts: &[ConnectOption]) -> Result<ConnectOption, Error> {
    match opts {
        [] => Ok(ConnectOption::default()),
        [opt] => {
            let mut opt = opt.clone();
            // the magic number is always pinned to the constant, a
            // caller-supplied value is ignored
            opt.magic_number = MAGIC_NUMBER;
            if opt.codec_type.is_empty() {
                opt.codec_type = BINARY_CODEC.to_owned();
            }
            Ok(opt)
        }
        _ => Err(Error::Options("number of options is more than 1".to_owned())),
    }
}

pub(crate) fn write_option<W: Write>(w: &mut W, opt: &ConnectOption) -> Result<(), Error> {
    serde_json::to_writer(&mut *w, opt).map_err(|e| Error::Handshake(e.to_string()))?;
    w.flush()?;
    Ok(())
}

/// Decode exactly one JSON option value from the stream.
///
/// `serde_json` reads no further than the end of the value, so the codec
/// stream starts cleanly right after it.
pub(crate) fn read_option<R: Read>(r: &mut R) -> Result<ConnectOption, Error> {
    let mut de = serde_json::Deserializer::from_reader(r);
    ConnectOption::deserialize(&mut de).map_err(|e| Error::Handshake(e.to_string()))
}
