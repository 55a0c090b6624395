//! Mokki provisioning protocol - GATT layout, credential payload and chunk framing

pub mod ble;
pub mod chunk;
mod payload;

pub use chunk::{CodecError, MAX_MESSAGE_SIZE, Reassembler, TERMINATOR};
pub use payload::ProvisioningPayload;

/// Async reassembly over a stream of notification fragments
#[cfg(feature = "async")]
pub mod async_io {
    use super::*;
    use futures::{Stream, StreamExt};

    /// Reads fragments until one complete message has been reassembled.
    pub async fn read_message<S>(fragments: &mut S) -> Result<Vec<u8>, CodecError>
    where
        S: Stream<Item = Vec<u8>> + Unpin,
    {
        let mut reassembler = Reassembler::new();
        while let Some(fragment) = fragments.next().await {
            if let Some(body) = reassembler.push(&fragment)? {
                return Ok(body);
            }
        }
        Err(CodecError::Incomplete)
    }

    /// Reads one message and parses it as a [`ProvisioningPayload`].
    pub async fn read_payload<S>(fragments: &mut S) -> Result<ProvisioningPayload, CodecError>
    where
        S: Stream<Item = Vec<u8>> + Unpin,
    {
        let body = read_message(fragments).await?;
        ProvisioningPayload::from_body(&body)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn reads_one_message_from_stream() {
            let chunks = crate::chunk::encode_bytes(b"hello world", 3).unwrap();
            let mut stream = futures::stream::iter(chunks);
            assert_eq!(read_message(&mut stream).await.unwrap(), b"hello world");
            assert!(stream.next().await.is_none());
        }

        #[tokio::test]
        async fn stream_ending_early_is_incomplete() {
            let mut chunks = crate::chunk::encode_bytes(b"hello world", 3).unwrap();
            chunks.pop();
            let mut stream = futures::stream::iter(chunks);
            assert!(matches!(
                read_message(&mut stream).await,
                Err(CodecError::Incomplete)
            ));
        }
    }
}
