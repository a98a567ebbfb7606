//! zstd payload compression for messages that opt in with
//! [`options::COMPRESS`](crate::channel::message::options::COMPRESS).

use crate::channel::interceptor::{ChannelInterceptor, InterceptorError};
use crate::channel::message::{options, ChannelMessage};
use crate::membership::Member;

pub struct CompressionInterceptor {
    level: i32,
    max_decompressed: usize,
}

impl CompressionInterceptor {
    /// `max_decompressed` bounds the inflated payload size.
    pub fn new(level: i32, max_decompressed: usize) -> Self {
        Self {
            level,
            max_decompressed,
        }
    }
}

impl ChannelInterceptor for CompressionInterceptor {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn option_flag(&self) -> u32 {
        options::COMPRESS
    }

    fn send_message(
        &self,
        msg: ChannelMessage,
        _destinations: &[Member],
    ) -> Result<Option<ChannelMessage>, InterceptorError> {
        let compressed = zstd::bulk::compress(msg.payload(), self.level)
            .map_err(|e| InterceptorError::new(self.name(), e.to_string()))?;
        tracing::trace!(
            message_id = %msg.id(),
            original = msg.payload().len(),
            compressed = compressed.len(),
            "Payload compressed"
        );
        Ok(Some(msg.with_payload(compressed)))
    }

    fn message_received(&self, msg: ChannelMessage) -> Result<Option<ChannelMessage>, InterceptorError> {
        let inflated = zstd::bulk::decompress(msg.payload(), self.max_decompressed)
            .map_err(|e| InterceptorError::new(self.name(), e.to_string()))?;
        Ok(Some(msg.with_payload(inflated)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::interceptor::{InterceptorChain, Passage};
    use crate::channel::message::Reliability;
    use crate::membership::MemberId;
    use std::sync::Arc;

    fn message(options: u32) -> ChannelMessage {
        let source = Member::new(MemberId::new(), "127.0.0.1".parse().unwrap(), 4000);
        ChannelMessage::new(source, vec![b'a'; 4096], Reliability::Ack, options)
    }

    fn chain() -> InterceptorChain {
        let mut chain = InterceptorChain::new();
        chain.push(Arc::new(CompressionInterceptor::new(3, 1024 * 1024)));
        chain
    }

    #[test]
    fn flagged_payload_shrinks_and_restores() {
        let chain = chain();
        let Passage::Forward(wire) = chain.outbound(message(options::COMPRESS), &[]).unwrap() else {
            panic!("dropped");
        };
        assert!(wire.payload().len() < 4096);

        let Passage::Forward(back) = chain.inbound(wire).unwrap() else {
            panic!("dropped");
        };
        assert_eq!(back.payload(), vec![b'a'; 4096].as_slice());
    }

    #[test]
    fn unflagged_payload_untouched() {
        let chain = chain();
        let Passage::Forward(wire) = chain.outbound(message(0), &[]).unwrap() else {
            panic!("dropped");
        };
        assert_eq!(wire.payload().len(), 4096);
    }

    #[test]
    fn corrupt_payload_is_an_error() {
        let stage = CompressionInterceptor::new(3, 1024);
        let msg = message(options::COMPRESS).with_payload(b"garbage".to_vec());
        let err = stage.message_received(msg).unwrap_err();
        assert_eq!(err.stage, "compression");
    }
}
