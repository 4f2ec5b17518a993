//! Reference JSON protocol: a tag-registry envelope codec over TCP.
//!
//! Messages travel as consecutive JSON values shaped
//! `{"Head": tag, "Body": value}`. Tags registered with the protocol decode
//! into their concrete type; everything else surfaces as a generic
//! [`serde_json::Value`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{Codec, Protocol};
use crate::error::CodecError;

/// Type-erased message carried by [`JsonCodec`]. Received registered
/// messages downcast to `Box<T>`; unregistered ones to
/// `Box<serde_json::Value>`.
pub type JsonMessage = Box<dyn Any + Send>;

type DecodeFn = Box<dyn Fn(Value) -> Result<JsonMessage, serde_json::Error> + Send + Sync>;
type EncodeFn = Box<dyn Fn(&dyn Any) -> Result<Value, serde_json::Error> + Send + Sync>;

struct Registration {
    tag: String,
    encode: EncodeFn,
}

#[derive(Default)]
struct Registry {
    decoders: HashMap<String, DecodeFn>,
    encoders: HashMap<TypeId, Registration>,
}

/// Protocol whose codecs share one tag registry. Register every message
/// type before serving; registration is cheap but takes a write lock.
#[derive(Clone, Default)]
pub struct JsonProtocol {
    registry: Arc<RwLock<Registry>>,
}

impl JsonProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under its fully qualified type name.
    pub fn register<T>(&self)
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.register_as::<T>(std::any::type_name::<T>());
    }

    /// Registers `T` under an explicit tag. A tag or type registered twice
    /// keeps the latest registration.
    pub fn register_as<T>(&self, tag: &str)
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let mut registry = self.registry.write().expect("json registry lock poisoned");
        registry.decoders.insert(
            tag.to_string(),
            Box::new(|body| {
                let value: T = serde_json::from_value(body)?;
                Ok(Box::new(value) as JsonMessage)
            }),
        );
        registry.encoders.insert(
            TypeId::of::<T>(),
            Registration {
                tag: tag.to_string(),
                encode: Box::new(|msg| {
                    let value = msg
                        .downcast_ref::<T>()
                        .expect("encoder registered under this TypeId");
                    serde_json::to_value(value)
                }),
            },
        );
    }
}

impl Protocol<TcpStream> for JsonProtocol {
    type Codec = JsonCodec;

    fn new_codec(&self, stream: TcpStream) -> Result<JsonCodec, CodecError> {
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        Ok(JsonCodec {
            registry: Arc::clone(&self.registry),
            decoder: Mutex::new(serde_json::Deserializer::from_reader(BufReader::new(reader))),
            writer: Mutex::new(BufWriter::new(writer)),
            stream,
        })
    }
}

#[derive(Serialize)]
struct JsonOut<'a> {
    #[serde(rename = "Head")]
    head: &'a str,
    #[serde(rename = "Body")]
    body: &'a Value,
}

#[derive(Deserialize)]
struct JsonIn {
    #[serde(rename = "Head", default)]
    head: String,
    #[serde(rename = "Body")]
    body: Value,
}

pub struct JsonCodec {
    registry: Arc<RwLock<Registry>>,
    decoder: Mutex<serde_json::Deserializer<serde_json::de::IoRead<BufReader<TcpStream>>>>,
    writer: Mutex<BufWriter<TcpStream>>,
    stream: TcpStream,
}

impl Codec for JsonCodec {
    type Msg = JsonMessage;

    fn receive(&self) -> Result<JsonMessage, CodecError> {
        let envelope = {
            let mut decoder = self.decoder.lock().expect("json decoder lock poisoned");
            JsonIn::deserialize(&mut *decoder).map_err(decode_error)?
        };

        if !envelope.head.is_empty() {
            let registry = self.registry.read().expect("json registry lock poisoned");
            if let Some(decode) = registry.decoders.get(&envelope.head) {
                return decode(envelope.body).map_err(decode_error);
            }
        }
        Ok(Box::new(envelope.body))
    }

    fn send(&self, msg: JsonMessage) -> Result<(), CodecError> {
        let any: &dyn Any = msg.as_ref();
        let registry = self.registry.read().expect("json registry lock poisoned");
        let (head, body) = match registry.encoders.get(&any.type_id()) {
            Some(registration) => {
                let body = (registration.encode)(any).map_err(encode_error)?;
                (registration.tag.as_str(), body)
            }
            // Raw values pass through untagged.
            None => match any.downcast_ref::<Value>() {
                Some(value) => ("", value.clone()),
                None => return Err(CodecError::UnregisteredMessage),
            },
        };

        let mut writer = self.writer.lock().expect("json writer lock poisoned");
        serde_json::to_writer(&mut *writer, &JsonOut { head, body: &body }).map_err(encode_error)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn close(&self) -> Result<(), CodecError> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Already torn down by the peer; close still succeeded.
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(CodecError::Io(err)),
        }
    }
}

fn decode_error(err: serde_json::Error) -> CodecError {
    if err.is_eof() {
        CodecError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, err))
    } else {
        CodecError::Decode(Box::new(err))
    }
}

fn encode_error(err: serde_json::Error) -> CodecError {
    CodecError::Encode(Box::new(err))
}
