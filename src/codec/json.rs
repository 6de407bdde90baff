use crate::envelope::Envelope;

use super::{validated, DecodeError, EncodeError};

pub struct Codec;

impl super::Codec for Codec {
    fn get_name(&self) -> String {
        String::from("json")
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(envelope)?)
    }

    fn decode(&self, message: &[u8]) -> Result<Envelope, DecodeError> {
        validated(serde_json::from_slice(message)?)
    }
}
