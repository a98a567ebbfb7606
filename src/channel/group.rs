//! Group channel: the application-facing cluster messaging service.
//!
//! # Responsibilities
//! - Assemble endpoint, membership, interceptor chain and sender
//! - Route outbound messages through the chain to the sender
//! - Route inbound messages through the chain to channel listeners
//! - Route membership events through the chain to membership listeners
//!
//! # Startup Order
//! ```text
//! endpoint (learn TCP port) → local member → membership bind → start loops
//! ```
//! A failure at any step stops what already started.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::channel::error::{ChannelError, ProcessingError, StartError};
use crate::channel::interceptor::{ChannelInterceptor, InterceptorChain, Passage};
use crate::channel::message::{ChannelMessage, MessageId, Reliability};
use crate::channel::receiver::{ClusterReceiver, MessageSink};
use crate::channel::sender::ReliableSender;
use crate::config::NodeConfig;
use crate::membership::{Member, MemberId, MembershipListener, MembershipService};
use crate::net::Endpoint;

/// Application callback for received messages.
pub trait ChannelListener: Send + Sync + 'static {
    /// Whether this listener wants the message.
    fn accept(&self, _msg: &ChannelMessage) -> bool {
        true
    }

    fn message_received(&self, msg: &ChannelMessage) -> Result<(), ProcessingError>;
}

/// Inbound path: chain (transport → application), then listeners.
pub struct InboundDelivery {
    chain: InterceptorChain,
    listeners: Vec<Arc<dyn ChannelListener>>,
}

impl MessageSink for InboundDelivery {
    fn deliver(&self, msg: ChannelMessage) -> Result<(), ProcessingError> {
        let msg = match self.chain.inbound(msg) {
            Ok(Passage::Forward(msg)) => msg,
            Ok(Passage::Dropped(stage)) => {
                tracing::trace!(stage, "Inbound message dropped by interceptor");
                return Ok(());
            }
            Err(e) => return Err(ProcessingError::new(e.to_string())),
        };

        let mut outcome = Ok(());
        for listener in self.listeners.iter().filter(|l| l.accept(&msg)) {
            if let Err(e) = listener.message_received(&msg) {
                tracing::debug!(message_id = %msg.id(), error = %e, "Listener failed");
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }
}

/// Membership events: chain, then listeners; departures also drop the peer sender.
struct MembershipBridge {
    chain: InterceptorChain,
    listeners: Vec<Arc<dyn MembershipListener>>,
    sender: Arc<ReliableSender>,
}

impl MembershipListener for MembershipBridge {
    fn member_added(&self, member: &Member) {
        self.chain.member_added(member);
        for listener in &self.listeners {
            listener.member_added(member);
        }
    }

    fn member_disappeared(&self, member: &Member) {
        self.sender.disconnect(&member.id);
        self.chain.member_disappeared(member);
        for listener in &self.listeners {
            listener.member_disappeared(member);
        }
    }
}

/// Collects stages and listeners before the channel starts.
pub struct ChannelBuilder {
    config: NodeConfig,
    chain: InterceptorChain,
    listeners: Vec<Arc<dyn ChannelListener>>,
    membership_listeners: Vec<Arc<dyn MembershipListener>>,
}

impl ChannelBuilder {
    /// Append a stage just above the transport.
    pub fn interceptor(mut self, stage: Arc<dyn ChannelInterceptor>) -> Self {
        self.chain.push(stage);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ChannelListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn membership_listener(mut self, listener: Arc<dyn MembershipListener>) -> Self {
        self.membership_listeners.push(listener);
        self
    }

    pub async fn start(self) -> Result<GroupChannel, StartError> {
        let ChannelBuilder {
            config,
            chain,
            listeners,
            membership_listeners,
        } = self;
        let local_id = MemberId::new();

        let inbound = Arc::new(InboundDelivery {
            chain: chain.clone(),
            listeners,
        });
        let receiver = ClusterReceiver::new(local_id, inbound, config.sender.max_frame_bytes);
        let endpoint = Endpoint::start(&config.connector, Arc::new(receiver))?;

        let host = match advertise_host(&config) {
            Ok(host) => host,
            Err(e) => {
                endpoint.stop().await;
                return Err(e);
            }
        };
        let mut local = Member::new(local_id, host, endpoint.local_addr().port());
        if let Some(port) = config.membership.secure_port {
            local = local.with_secure_port(port);
        }
        if let Some(payload) = &config.membership.payload {
            local = match local.with_payload(payload.as_bytes().to_vec()) {
                Ok(local) => local,
                Err(e) => {
                    endpoint.stop().await;
                    return Err(StartError::Payload(e));
                }
            };
        }

        let membership = match MembershipService::bind(&config.membership, local).await {
            Ok(membership) => membership,
            Err(e) => {
                endpoint.stop().await;
                return Err(e.into());
            }
        };

        let sender = Arc::new(ReliableSender::new(local_id, &config.sender));
        membership.add_listener(Arc::new(MembershipBridge {
            chain: chain.clone(),
            listeners: membership_listeners,
            sender: sender.clone(),
        }));
        membership.start();

        tracing::info!(
            member = %membership.local_member(),
            interceptors = ?chain.names(),
            "Group channel started"
        );

        Ok(GroupChannel {
            endpoint,
            membership,
            sender,
            chain,
            stopped: AtomicBool::new(false),
        })
    }
}

/// Advertised host: configured, else the bind host. Unspecified means
/// "use the address my heartbeats arrive from".
fn advertise_host(config: &NodeConfig) -> Result<IpAddr, StartError> {
    if let Some(host) = &config.membership.advertise_host {
        return host
            .parse()
            .map_err(|_| StartError::AdvertiseHost(host.clone()));
    }
    Ok(config
        .connector
        .bind_address
        .parse::<std::net::SocketAddr>()
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)))
}

/// A running cluster channel.
pub struct GroupChannel {
    endpoint: Endpoint<ClusterReceiver<InboundDelivery>>,
    membership: Arc<MembershipService>,
    sender: Arc<ReliableSender>,
    chain: InterceptorChain,
    stopped: AtomicBool,
}

impl GroupChannel {
    pub fn builder(config: NodeConfig) -> ChannelBuilder {
        ChannelBuilder {
            config,
            chain: InterceptorChain::new(),
            listeners: Vec::new(),
            membership_listeners: Vec::new(),
        }
    }

    /// Send a new message from the local member.
    pub async fn send(
        &self,
        destinations: &[Member],
        payload: Vec<u8>,
        reliability: Reliability,
        options: u32,
    ) -> Result<MessageId, ChannelError> {
        let msg = ChannelMessage::new(self.local_member().clone(), payload, reliability, options);
        let id = msg.id();
        self.send_message(msg, destinations).await?;
        Ok(id)
    }

    /// Send a prepared message, e.g. one relayed on behalf of another member.
    pub async fn send_message(&self, msg: ChannelMessage, destinations: &[Member]) -> Result<(), ChannelError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ChannelError::NotRunning);
        }
        self.membership.check_expired();

        match self.chain.outbound(msg, destinations)? {
            Passage::Forward(msg) => self.sender.send(&msg, destinations).await,
            Passage::Dropped(stage) => {
                tracing::debug!(stage, "Outbound message dropped by interceptor");
                Ok(())
            }
        }
    }

    /// Send to every live member.
    pub async fn broadcast(
        &self,
        payload: Vec<u8>,
        reliability: Reliability,
        options: u32,
    ) -> Result<MessageId, ChannelError> {
        let members = self.members();
        self.send(&members, payload, reliability, options).await
    }

    pub fn members(&self) -> Vec<Member> {
        self.membership.members()
    }

    pub fn local_member(&self) -> &Member {
        self.membership.local_member()
    }

    pub fn endpoint(&self) -> &Endpoint<ClusterReceiver<InboundDelivery>> {
        &self.endpoint
    }

    pub fn membership(&self) -> &Arc<MembershipService> {
        &self.membership
    }

    pub fn sender(&self) -> &Arc<ReliableSender> {
        &self.sender
    }

    pub fn interceptors(&self) -> Vec<&'static str> {
        self.chain.names()
    }

    /// Announce departure, then stop membership, sender and endpoint. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(member = %self.local_member().id, "Stopping group channel");
        self.membership.stop().await;
        self.sender.shutdown();
        self.endpoint.stop().await;
        tracing::info!("Group channel stopped");
    }
}
