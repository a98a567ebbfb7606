//! Ordered interceptor chain between the application and the transport.
//!
//! # Data Flow
//! ```text
//! send:    application ─► stage 0 ─► stage 1 ─► … ─► transport (innermost)
//! receive: application ◄─ stage 0 ◄─ stage 1 ◄─ … ◄─ transport
//! ```
//!
//! # Design Decisions
//! - Stages live in an owned `Vec`; next/previous are index lookups
//! - A stage only touches messages that opt in through its option flag
//! - Dropping a message is a stage's prerogative, not an error
//! - The chain is assembled before the channel starts and never mutated after

use std::sync::Arc;
use thiserror::Error;

use crate::channel::message::ChannelMessage;
use crate::membership::Member;

/// A stage failed to transform a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("interceptor '{stage}' failed: {reason}")]
pub struct InterceptorError {
    pub stage: &'static str,
    pub reason: String,
}

impl InterceptorError {
    pub fn new(stage: &'static str, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

/// One processing stage.
pub trait ChannelInterceptor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Option bits a message must carry for this stage to act. `0` means all messages.
    fn option_flag(&self) -> u32 {
        0
    }

    /// Outbound transformation. `Ok(None)` drops the message.
    fn send_message(
        &self,
        msg: ChannelMessage,
        _destinations: &[Member],
    ) -> Result<Option<ChannelMessage>, InterceptorError> {
        Ok(Some(msg))
    }

    /// Inbound transformation. `Ok(None)` drops the message.
    fn message_received(&self, msg: ChannelMessage) -> Result<Option<ChannelMessage>, InterceptorError> {
        Ok(Some(msg))
    }

    fn member_added(&self, _member: &Member) {}

    fn member_disappeared(&self, _member: &Member) {}
}

/// Result of running a message through the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Passage {
    Forward(ChannelMessage),
    /// Dropped by the named stage.
    Dropped(&'static str),
}

/// Stages ordered from the application side (index 0) toward the transport.
#[derive(Default, Clone)]
pub struct InterceptorChain {
    stages: Vec<Arc<dyn ChannelInterceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage just above the transport.
    pub fn push(&mut self, stage: Arc<dyn ChannelInterceptor>) {
        tracing::debug!(stage = stage.name(), position = self.stages.len(), "Interceptor added");
        self.stages.push(stage);
    }

    /// Remove the named stage. Returns whether one was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.stages.len();
        self.stages.retain(|stage| stage.name() != name);
        before != self.stages.len()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Stage after `index` toward the transport; `None` means the transport itself.
    pub fn next(&self, index: usize) -> Option<usize> {
        let next = index + 1;
        (next < self.stages.len()).then_some(next)
    }

    /// Stage before `index` toward the application; `None` means the listeners.
    pub fn previous(&self, index: usize) -> Option<usize> {
        index.checked_sub(1)
    }

    fn applies(stage: &dyn ChannelInterceptor, msg: &ChannelMessage) -> bool {
        msg.has_options(stage.option_flag())
    }

    /// Run a message from the application end toward the transport.
    pub fn outbound(
        &self,
        mut msg: ChannelMessage,
        destinations: &[Member],
    ) -> Result<Passage, InterceptorError> {
        let mut cursor = (!self.stages.is_empty()).then_some(0);
        while let Some(index) = cursor {
            let stage = &self.stages[index];
            if Self::applies(stage.as_ref(), &msg) {
                match stage.send_message(msg, destinations)? {
                    Some(next) => msg = next,
                    None => return Ok(Passage::Dropped(stage.name())),
                }
            }
            cursor = self.next(index);
        }
        Ok(Passage::Forward(msg))
    }

    /// Run a received message from the transport end toward the application.
    pub fn inbound(&self, mut msg: ChannelMessage) -> Result<Passage, InterceptorError> {
        let mut cursor = self.stages.len().checked_sub(1);
        while let Some(index) = cursor {
            let stage = &self.stages[index];
            if Self::applies(stage.as_ref(), &msg) {
                match stage.message_received(msg)? {
                    Some(next) => msg = next,
                    None => return Ok(Passage::Dropped(stage.name())),
                }
            }
            cursor = self.previous(index);
        }
        Ok(Passage::Forward(msg))
    }

    /// Membership events travel inbound like received messages.
    pub fn member_added(&self, member: &Member) {
        for stage in self.stages.iter().rev() {
            stage.member_added(member);
        }
    }

    pub fn member_disappeared(&self, member: &Member) {
        for stage in self.stages.iter().rev() {
            stage.member_disappeared(member);
        }
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("stages", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::message::Reliability;
    use crate::membership::MemberId;
    use std::sync::Mutex;

    /// Appends its tag to the payload on the way out and on the way in.
    struct Tag {
        name: &'static str,
        flag: u32,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ChannelInterceptor for Tag {
        fn name(&self) -> &'static str {
            self.name
        }

        fn option_flag(&self) -> u32 {
            self.flag
        }

        fn send_message(
            &self,
            msg: ChannelMessage,
            _destinations: &[Member],
        ) -> Result<Option<ChannelMessage>, InterceptorError> {
            self.log.lock().unwrap().push(format!("out:{}", self.name));
            Ok(Some(msg))
        }

        fn message_received(&self, msg: ChannelMessage) -> Result<Option<ChannelMessage>, InterceptorError> {
            self.log.lock().unwrap().push(format!("in:{}", self.name));
            Ok(Some(msg))
        }

        fn member_added(&self, _member: &Member) {
            self.log.lock().unwrap().push(format!("added:{}", self.name));
        }
    }

    struct DropAll;

    impl ChannelInterceptor for DropAll {
        fn name(&self) -> &'static str {
            "drop-all"
        }

        fn send_message(
            &self,
            _msg: ChannelMessage,
            _destinations: &[Member],
        ) -> Result<Option<ChannelMessage>, InterceptorError> {
            Ok(None)
        }
    }

    fn message(options: u32) -> ChannelMessage {
        let source = Member::new(MemberId::new(), "127.0.0.1".parse().unwrap(), 4000);
        ChannelMessage::new(source, b"x".to_vec(), Reliability::Ack, options)
    }

    fn chain(log: &Arc<Mutex<Vec<String>>>) -> InterceptorChain {
        let mut chain = InterceptorChain::new();
        for (name, flag) in [("a", 0), ("b", 0x2), ("c", 0)] {
            chain.push(Arc::new(Tag {
                name,
                flag,
                log: log.clone(),
            }));
        }
        chain
    }

    #[test]
    fn outbound_then_inbound_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log);

        let Passage::Forward(msg) = chain.outbound(message(0x2), &[]).unwrap() else {
            panic!("dropped");
        };
        chain.inbound(msg).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["out:a", "out:b", "out:c", "in:c", "in:b", "in:a"]
        );
    }

    #[test]
    fn stage_skipped_without_opt_in() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log);

        chain.outbound(message(0), &[]).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["out:a", "out:c"]);
    }

    #[test]
    fn drop_stops_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = InterceptorChain::new();
        chain.push(Arc::new(DropAll));
        chain.push(Arc::new(Tag {
            name: "after",
            flag: 0,
            log: log.clone(),
        }));

        assert_eq!(chain.outbound(message(0), &[]).unwrap(), Passage::Dropped("drop-all"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn navigation_and_removal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = chain(&log);

        assert_eq!(chain.next(0), Some(1));
        assert_eq!(chain.next(2), None);
        assert_eq!(chain.previous(0), None);
        assert_eq!(chain.previous(2), Some(1));

        assert!(chain.remove("b"));
        assert!(!chain.remove("b"));
        assert_eq!(chain.names(), vec!["a", "c"]);
    }

    #[test]
    fn membership_events_travel_inbound() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log);
        let member = Member::new(MemberId::new(), "127.0.0.1".parse().unwrap(), 4001);

        chain.member_added(&member);
        assert_eq!(*log.lock().unwrap(), vec!["added:c", "added:b", "added:a"]);
    }
}
