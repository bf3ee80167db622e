//! Payload to transport message and back: marshal, then encrypt.

use crate::encrypter::Encrypter;
use crate::error::MomError;
use crate::marshaller::{self, Marshaller, MarshallerContext, WireBody};
use crate::message::PROP_MARSHALLER_CONTEXT;
use crate::transport::TransportMessage;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Marshaller context key recording the kind of an encrypted body.
const CTX_ENCRYPTED: &str = "encrypted";

/// Marshaller and optional encrypter of one destination.
#[derive(Debug, Clone)]
pub(crate) struct Codec {
    marshaller: Arc<dyn Marshaller>,
    encrypter: Option<Arc<dyn Encrypter>>,
}

impl Codec {
    pub(crate) fn new(marshaller: Arc<dyn Marshaller>, encrypter: Option<Arc<dyn Encrypter>>) -> Self {
        Self { marshaller, encrypter }
    }

    pub(crate) fn marshaller(&self) -> &dyn Marshaller {
        self.marshaller.as_ref()
    }

    /// Message carrying `payload`, with the marshaller context as property.
    pub(crate) fn encode<T: Serialize>(&self, payload: &T) -> Result<TransportMessage, MomError> {
        let mut context = MarshallerContext::new();
        let body = marshaller::encode(self.marshaller.as_ref(), payload, &mut context)?;
        let body = self.encrypt(body, &mut context)?;

        let mut message = TransportMessage::new(body);
        if !context.is_empty() {
            message
                .properties
                .insert(PROP_MARSHALLER_CONTEXT.to_string(), Value::String(serde_json::to_string(&context)?));
        }
        Ok(message)
    }

    pub(crate) fn decode<T: DeserializeOwned>(&self, message: &TransportMessage) -> Result<T, MomError> {
        let context: MarshallerContext = match message.property(PROP_MARSHALLER_CONTEXT) {
            Some(Value::String(json)) => serde_json::from_str(json)?,
            Some(other) => {
                return Err(MomError::marshalling(format!(
                    "marshaller context must be a JSON string, got {other}"
                )))
            }
            None => MarshallerContext::new(),
        };
        let body = self.decrypt(&message.body, &context)?;
        marshaller::decode(self.marshaller.as_ref(), &body, &context)
    }

    fn encrypt(&self, body: WireBody, context: &mut MarshallerContext) -> Result<WireBody, MomError> {
        let Some(encrypter) = &self.encrypter else {
            return Ok(body);
        };
        let (kind, plaintext) = match body {
            WireBody::Empty => return Ok(WireBody::Empty),
            WireBody::Text(text) => ("text", text.into_bytes()),
            WireBody::Bytes(bytes) => ("bytes", bytes),
        };
        context.insert(CTX_ENCRYPTED.to_string(), kind.to_string());
        encrypter.encrypt(&plaintext).map(WireBody::Bytes)
    }

    fn decrypt(&self, body: &WireBody, context: &MarshallerContext) -> Result<WireBody, MomError> {
        let Some(kind) = context.get(CTX_ENCRYPTED) else {
            return Ok(body.clone());
        };
        let encrypter = self
            .encrypter
            .as_ref()
            .ok_or_else(|| MomError::Encryption("message is encrypted, but no encrypter is registered".to_string()))?;
        let WireBody::Bytes(ciphertext) = body else {
            return Err(MomError::Encryption("encrypted body must be binary".to_string()));
        };

        let plaintext = encrypter.decrypt(ciphertext)?;
        match kind.as_str() {
            "text" => String::from_utf8(plaintext)
                .map(WireBody::Text)
                .map_err(|e| MomError::Encryption(format!("decrypted text is not UTF-8: {e}"))),
            _ => Ok(WireBody::Bytes(plaintext)),
        }
    }
}
