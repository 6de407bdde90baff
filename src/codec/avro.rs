//! Avro object container codec.
//! Every message carries its writer schema in the container header, so consumers
//! do not need a schema registry and older or newer producers are resolved against
//! [ENVELOPE_SCHEMA].
use apache_avro::{from_value, Reader, Schema, Writer};

use crate::envelope::Envelope;

use super::{validated, DecodeError, EncodeError};

pub const ENVELOPE_SCHEMA: &str = r#"
    {
        "type": "record",
        "name": "city_temperature",
        "fields": [
            {"name": "city", "type": "string"},
            {"name": "temperature", "type": "string"},
            {"name": "time", "type": "string"}
        ]
    }
"#;

pub struct Codec {
    schema: Schema,
}

pub fn new() -> Result<Codec, anyhow::Error> {
    Ok(Codec {
        schema: Schema::parse_str(ENVELOPE_SCHEMA)?,
    })
}

impl super::Codec for Codec {
    fn get_name(&self) -> String {
        String::from("avro")
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
        let mut writer = Writer::new(&self.schema, Vec::new());
        writer.append_ser(envelope)?;
        Ok(writer.into_inner()?)
    }

    fn decode(&self, message: &[u8]) -> Result<Envelope, DecodeError> {
        let mut reader = Reader::with_schema(&self.schema, message)?;
        let value = match reader.next() {
            Some(value) => value?,
            None => return Err(DecodeError::EmptyContainer),
        };
        validated(from_value::<Envelope>(&value)?)
    }
}
