//! Self-describing message envelope.
//!
//! Every payload that crosses a queue or lands in a file is wrapped in an
//! `Envelope` carrying a stable type URL, so receivers can reject payloads
//! whose type they cannot resolve without guessing at the bytes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use primordia_error::{Error, ErrorKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

const MAX_TYPE_URL_LEN: u16 = 512;

/// A serializable type with a stable wire identity.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// The stable type URL embedded in every envelope of this type.
    const TYPE_URL: &'static str;
}

impl WireMessage for crate::TickDataChunk {
    const TYPE_URL: &'static str = "type.primordia.dev/primordia.TickDataChunk";
}

impl WireMessage for crate::SimulationMetadata {
    const TYPE_URL: &'static str = "type.primordia.dev/primordia.SimulationMetadata";
}

impl WireMessage for crate::BatchInfo {
    const TYPE_URL: &'static str = "type.primordia.dev/primordia.BatchInfo";
}

/// `{ type_url, payload }` wrapper around an opaque serialized message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Stable identity of the payload type
    pub type_url: String,
    /// Serialized message bytes
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Wraps a message, serializing it with bincode.
    pub fn pack<T: WireMessage>(msg: &T) -> Result<Envelope, Error> {
        let payload = bincode::serialize(msg)
            .map_err(|e| ErrorKind::Internal.other(format!("envelope pack: {}", e)))?;
        Ok(Envelope {
            type_url: T::TYPE_URL.to_string(),
            payload,
        })
    }

    /// Unwraps into the expected message type.
    ///
    /// Rejects the payload when the embedded type URL does not match.
    pub fn unpack<T: WireMessage>(&self) -> Result<T, Error> {
        if self.type_url != T::TYPE_URL {
            return Err(ErrorKind::DeserializationFailed.other(format!(
                "expected {} have {}",
                T::TYPE_URL,
                self.type_url
            )));
        }
        bincode::deserialize(&self.payload)
            .map_err(|e| ErrorKind::DeserializationFailed.other(format!("{}: {}", self.type_url, e)))
    }

    /// Serialized frame size in bytes.
    pub fn frame_len(&self) -> usize {
        2 + self.type_url.len() + 4 + self.payload.len()
    }

    /// Writes the framed envelope: u16 url length, url, u32 payload length,
    /// payload, all little endian.
    pub fn write_frame<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
        if self.type_url.len() > MAX_TYPE_URL_LEN as usize {
            return Err(ErrorKind::Internal.other("type url too long"));
        }
        writer.write_u16::<LittleEndian>(self.type_url.len() as u16)?;
        writer.write_all(self.type_url.as_bytes())?;
        writer.write_u32::<LittleEndian>(self.payload.len() as u32)?;
        writer.write_all(&self.payload)?;
        Ok(())
    }

    /// Reads one framed envelope.
    pub fn read_frame<R: Read>(reader: &mut R) -> Result<Envelope, Error> {
        let url_len = reader.read_u16::<LittleEndian>()?;
        if url_len > MAX_TYPE_URL_LEN {
            return Err(ErrorKind::DeserializationFailed
                .other(format!("type url length {} out of range", url_len)));
        }
        let mut url = vec![0u8; url_len as usize];
        reader.read_exact(&mut url)?;
        let type_url = String::from_utf8(url)
            .map_err(|e| ErrorKind::DeserializationFailed.other(format!("type url: {}", e)))?;
        let payload_len = reader.read_u32::<LittleEndian>()?;
        let mut payload = vec![0u8; payload_len as usize];
        reader.read_exact(&mut payload)?;
        Ok(Envelope { type_url, payload })
    }

    /// Encodes the frame into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(self.frame_len());
        self.write_frame(&mut buf)?;
        Ok(buf)
    }

    /// Decodes one frame from a buffer.
    pub fn decode(mut buf: &[u8]) -> Result<Envelope, Error> {
        Envelope::read_frame(&mut buf)
    }
}
