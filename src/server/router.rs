//! Message routing between live sessions
//!
//! Delivery is best effort and synchronous: a message either lands on the
//! recipient's send queue during the routing call or is reported back to the
//! sender as failed. Nothing is stored for later.

use std::sync::Arc;

use tracing::debug;

use crate::current_timestamp;
use crate::error::Result;
use crate::protocol::{
    DeliveryFailed, DeliveryFailure, Encodable, Message, MessageAccepted, MessageDelivered,
    SendMessage,
};
use crate::server::registry::{Session, SessionRegistry};
use crate::store::CredentialStore;

/// What happened to one routed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    RecipientOffline,
    NotAContact,
    InvalidMessage,
}

impl RouteOutcome {
    /// The acknowledgement sent back to the sender
    pub fn acknowledgement(self, message_id: String) -> Message {
        let reason = match self {
            RouteOutcome::Delivered => return MessageAccepted { message_id }.into(),
            RouteOutcome::RecipientOffline => DeliveryFailure::RecipientOffline,
            RouteOutcome::NotAContact => DeliveryFailure::NotAContact,
            RouteOutcome::InvalidMessage => DeliveryFailure::InvalidMessage,
        };
        DeliveryFailed { message_id, reason }.into()
    }
}

pub struct MessageRouter {
    store: Arc<dyn CredentialStore>,
    registry: Arc<SessionRegistry>,
}

impl MessageRouter {
    pub fn new(store: Arc<dyn CredentialStore>, registry: Arc<SessionRegistry>) -> Self {
        Self { store, registry }
    }

    /// Validate `msg` and hand it to the recipient's connection
    pub async fn route(&self, sender: &Session, msg: &SendMessage) -> Result<RouteOutcome> {
        let recipient = msg.recipient.trim();
        if recipient.is_empty() || msg.body.is_empty() {
            return Ok(RouteOutcome::InvalidMessage);
        }

        let contacts = self.store.get_contacts(sender.user_id).await?;
        let Some(contact) = contacts.into_iter().find(|u| u.username == recipient) else {
            debug!("{} -> {}: not a contact", sender.username, recipient);
            return Ok(RouteOutcome::NotAContact);
        };

        let frame = MessageDelivered {
            message_id: msg.message_id.clone(),
            sender: sender.username.clone(),
            body: msg.body.clone(),
            sent_at: current_timestamp(),
        }
        .encode_frame()?;

        let outcome = if self.registry.send_to_user(contact.user_id, frame).await {
            RouteOutcome::Delivered
        } else {
            RouteOutcome::RecipientOffline
        };

        debug!(
            "Message {} {} -> {}: {:?}",
            msg.message_id, sender.username, recipient, outcome
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::config::MIN_BCRYPT_COST;
    use crate::protocol::{Decodable, ErrorCode};
    use crate::server::registry::{Outbound, OutboundHandle, OutboundQueue};
    use crate::store::{InMemoryCredentialStore, User};

    struct Fixture {
        store: Arc<InMemoryCredentialStore>,
        registry: Arc<SessionRegistry>,
        router: MessageRouter,
        alice: User,
        bob: User,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryCredentialStore::new(MIN_BCRYPT_COST));
        let registry = Arc::new(SessionRegistry::new());
        let router = MessageRouter::new(store.clone(), Arc::clone(&registry));
        let alice = store.create_user("alice", "pw12").await.unwrap();
        let bob = store.create_user("bob", "pw12").await.unwrap();
        Fixture {
            store,
            registry,
            router,
            alice,
            bob,
        }
    }

    async fn login(fx: &Fixture, user: &User) -> (Session, OutboundQueue) {
        let (handle, rx) = OutboundHandle::new(Uuid::new_v4());
        let (session, _) = fx.registry.register(user, handle).await.unwrap();
        (session, rx)
    }

    fn message(id: &str, to: &str, body: &str) -> SendMessage {
        SendMessage {
            message_id: id.to_string(),
            recipient: to.to_string(),
            body: body.to_string(),
        }
    }

    fn delivered(rx: &mut OutboundQueue) -> MessageDelivered {
        match rx.try_recv().unwrap() {
            Outbound::Frame(frame) => MessageDelivered::decode_frame(&frame).unwrap(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delivered_to_online_contact() {
        let fx = fixture().await;
        fx.store.add_contact(fx.alice.user_id, "bob").await.unwrap();
        let (alice, _arx) = login(&fx, &fx.alice).await;
        let (_bob, mut bob_rx) = login(&fx, &fx.bob).await;

        let outcome = fx.router.route(&alice, &message("m1", "bob", "hi")).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Delivered);

        let msg = delivered(&mut bob_rx);
        assert_eq!(msg.message_id, "m1");
        assert_eq!(msg.sender, "alice");
        assert_eq!(msg.body, "hi");
        assert!(msg.sent_at > 0);
    }

    #[tokio::test]
    async fn test_non_contact_never_reaches_recipient() {
        let fx = fixture().await;
        let (alice, _arx) = login(&fx, &fx.alice).await;
        let (_bob, mut bob_rx) = login(&fx, &fx.bob).await;

        let outcome = fx.router.route(&alice, &message("m1", "bob", "hi")).await.unwrap();
        assert_eq!(outcome, RouteOutcome::NotAContact);
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_recipient() {
        let fx = fixture().await;
        fx.store.add_contact(fx.alice.user_id, "bob").await.unwrap();
        let (alice, _arx) = login(&fx, &fx.alice).await;

        let outcome = fx.router.route(&alice, &message("m1", "bob", "hi")).await.unwrap();
        assert_eq!(outcome, RouteOutcome::RecipientOffline);
    }

    #[tokio::test]
    async fn test_closed_queue_counts_as_offline() {
        let fx = fixture().await;
        fx.store.add_contact(fx.alice.user_id, "bob").await.unwrap();
        let (alice, _arx) = login(&fx, &fx.alice).await;
        let (_bob, bob_rx) = login(&fx, &fx.bob).await;
        drop(bob_rx);

        let outcome = fx.router.route(&alice, &message("m1", "bob", "hi")).await.unwrap();
        assert_eq!(outcome, RouteOutcome::RecipientOffline);
    }

    #[tokio::test]
    async fn test_full_queue_counts_as_offline() {
        let fx = fixture().await;
        fx.store.add_contact(fx.alice.user_id, "bob").await.unwrap();
        let (alice, _arx) = login(&fx, &fx.alice).await;
        let (handle, mut bob_rx) = OutboundHandle::with_capacity(Uuid::new_v4(), 1);
        fx.registry.register(&fx.bob, handle).await.unwrap();

        let first = fx.router.route(&alice, &message("m1", "bob", "hi")).await.unwrap();
        assert_eq!(first, RouteOutcome::Delivered);
        let second = fx.router.route(&alice, &message("m2", "bob", "hi")).await.unwrap();
        assert_eq!(second, RouteOutcome::RecipientOffline);

        assert_eq!(
            bob_rx.abort_reason().map(|e| e.code),
            Some(ErrorCode::QueueOverflow)
        );
        assert_eq!(delivered(&mut bob_rx).message_id, "m1");
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_messages() {
        let fx = fixture().await;
        fx.store.add_contact(fx.alice.user_id, "bob").await.unwrap();
        let (alice, _arx) = login(&fx, &fx.alice).await;
        let (_bob, mut bob_rx) = login(&fx, &fx.bob).await;

        for msg in [message("m1", "  ", "hi"), message("m2", "bob", "")] {
            let outcome = fx.router.route(&alice, &msg).await.unwrap();
            assert_eq!(outcome, RouteOutcome::InvalidMessage);
        }
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_order_preserved() {
        let fx = fixture().await;
        fx.store.add_contact(fx.alice.user_id, "bob").await.unwrap();
        let (alice, _arx) = login(&fx, &fx.alice).await;
        let (_bob, mut bob_rx) = login(&fx, &fx.bob).await;

        for i in 0..10 {
            let msg = message(&i.to_string(), "bob", &format!("msg {}", i));
            fx.router.route(&alice, &msg).await.unwrap();
        }
        for i in 0..10 {
            assert_eq!(delivered(&mut bob_rx).message_id, i.to_string());
        }
    }

    #[test]
    fn test_acknowledgements() {
        assert_eq!(
            RouteOutcome::Delivered.acknowledgement("7".to_string()),
            Message::MessageAccepted(MessageAccepted {
                message_id: "7".to_string()
            })
        );
        assert_eq!(
            RouteOutcome::NotAContact.acknowledgement("8".to_string()),
            Message::DeliveryFailed(DeliveryFailed {
                message_id: "8".to_string(),
                reason: DeliveryFailure::NotAContact,
            })
        );
    }
}
