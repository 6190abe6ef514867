// Message routing for the relay.
//
// `Router::dispatch` takes one decoded message from a session's reader
// thread and decides who receives what:
//
// - `register`: claim the identity in the registry. On success the session
//   gets `registration_response: success`, everyone else gets a `system`
//   join notice, then every named session (the newcomer included) gets a
//   fresh `users_list`. On failure the session gets the rejection reason and
//   the caller closes the connection.
// - `chat` / `private`: a non-empty `to` makes it private (sender + target
//   only, dropped silently if the target is offline); otherwise it is
//   broadcast to every named session, sender included. Both are stamped
//   with the server time and appended to the chat log after delivery.
// - `typing`: forwarded to every named session except the sender. Never
//   logged.
// - anything else is dropped with a debug note.
//
// Messages from sessions that have not registered yet are dropped, except
// `register` itself. The relay always overwrites `from` with the sender's
// registered identity.
//
// Fan-out: each recipient is written on its own scoped thread and `deliver`
// returns when all writes have finished or failed. A failed write closes
// only that recipient's socket; its reader thread then runs `teardown`.

use std::sync::Arc;
use std::thread;

use chrono::Utc;
use disclite_protocol::{Message, MessageKind, REGISTRATION_SUCCESS};
use tracing::{debug, info, warn};

use crate::chat_log::{ChatLog, ChatLogEntry};
use crate::error::{RegisterError, SessionError};
use crate::registry::Registry;
use crate::session::Session;

/// What the reader thread should do after a dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    /// Stop reading and tear the session down.
    Close,
}

/// Routes inbound messages to recipient sessions.
pub struct Router {
    registry: Arc<Registry>,
    chat_log: Arc<ChatLog>,
}

impl Router {
    pub fn new(registry: Arc<Registry>, chat_log: Arc<ChatLog>) -> Self {
        Self { registry, chat_log }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn chat_log(&self) -> &Arc<ChatLog> {
        &self.chat_log
    }

    /// Route one message from `origin`.
    pub fn dispatch(&self, origin: &Arc<Session>, msg: Message) -> Dispatch {
        match msg.kind {
            MessageKind::Register => return self.register(origin, &msg),
            MessageKind::Chat | MessageKind::Private => match msg.target() {
                Some(target) => self.private(origin, target, &msg),
                None => self.broadcast_chat(origin, &msg),
            },
            MessageKind::Typing => self.typing(origin, &msg),
            ref other => {
                debug!(session = %origin.id(), kind = %other, "Dropping message with unroutable type");
            }
        }
        Dispatch::Continue
    }

    /// Remove `session` from the relay and close it. Only the call that
    /// actually removes the registry entry announces the departure.
    pub fn teardown(&self, session: &Arc<Session>) {
        session.close();
        let Some(removed) = self.registry.remove(session.id()) else {
            return;
        };
        info!(
            session = %removed.id(),
            identity = removed.identity().unwrap_or("-"),
            peer = %removed.remote_addr(),
            "Session closed"
        );
        if let Some(identity) = removed.identity() {
            let notice = Message::system(format!("{identity} left the chat")).with_timestamp(Utc::now());
            self.deliver(&self.registry.named_sessions(), &notice);
            self.send_users_list();
        }
    }

    fn register(&self, origin: &Arc<Session>, msg: &Message) -> Dispatch {
        let identity = match self.registry.try_register(origin.id(), &msg.from) {
            Ok(identity) => identity,
            Err(RegisterError::AlreadyRegistered) => {
                debug!(session = %origin.id(), "Ignoring repeated register");
                return Dispatch::Continue;
            }
            Err(err) => {
                info!(session = %origin.id(), requested = %msg.from, error = %err, "Registration rejected");
                let response = Message::registration_response(err.reason()).with_timestamp(Utc::now());
                if let Err(e) = origin.send(&response) {
                    debug!(session = %origin.id(), error = %e, "Could not deliver rejection");
                }
                return Dispatch::Close;
            }
        };
        info!(session = %origin.id(), identity = %identity, "Registered");

        let now = Utc::now();
        self.deliver(
            std::slice::from_ref(origin),
            &Message::registration_response(REGISTRATION_SUCCESS).with_timestamp(now),
        );
        let others: Vec<Arc<Session>> = self
            .registry
            .named_sessions()
            .into_iter()
            .filter(|s| s.id() != origin.id())
            .collect();
        self.deliver(
            &others,
            &Message::system(format!("{identity} joined the chat")).with_timestamp(now),
        );
        self.send_users_list();
        Dispatch::Continue
    }

    fn broadcast_chat(&self, origin: &Arc<Session>, msg: &Message) {
        let Some(identity) = origin.identity() else {
            debug!(session = %origin.id(), "Dropping chat from unregistered session");
            return;
        };
        let now = Utc::now();
        let outbound = Message {
            kind: MessageKind::Chat,
            to: None,
            from: identity.to_string(),
            body: msg.body.clone(),
            timestamp: Some(now),
        };
        self.deliver(&self.registry.named_sessions(), &outbound);
        self.chat_log.append(ChatLogEntry {
            session_id: origin.id(),
            identity: identity.to_string(),
            to: None,
            body: msg.body_text().to_string(),
            timestamp: now,
        });
    }

    fn private(&self, origin: &Arc<Session>, target: &str, msg: &Message) {
        let Some(identity) = origin.identity() else {
            debug!(session = %origin.id(), "Dropping private message from unregistered session");
            return;
        };
        let Some(recipient) = self.registry.find_by_name(target) else {
            debug!(session = %origin.id(), target = %target, "Private target offline, dropping");
            return;
        };
        let Some(target_identity) = recipient.identity().map(String::from) else {
            return;
        };

        let now = Utc::now();
        let outbound =
            Message::private(identity, target_identity.as_str(), msg.body_text()).with_timestamp(now);
        let mut recipients = vec![origin.clone()];
        if recipient.id() != origin.id() {
            recipients.push(recipient);
        }
        self.deliver(&recipients, &outbound);
        self.chat_log.append(ChatLogEntry {
            session_id: origin.id(),
            identity: identity.to_string(),
            body: format!("<{target_identity}> {}", msg.body_text()),
            to: Some(target_identity),
            timestamp: now,
        });
    }

    fn typing(&self, origin: &Arc<Session>, msg: &Message) {
        let Some(identity) = origin.identity() else {
            debug!(session = %origin.id(), "Dropping typing from unregistered session");
            return;
        };
        let Some(is_typing) = msg.typing_state() else {
            debug!(session = %origin.id(), body = %msg.body_text(), "Dropping typing with non-boolean body");
            return;
        };
        let others: Vec<Arc<Session>> = self
            .registry
            .named_sessions()
            .into_iter()
            .filter(|s| s.id() != origin.id())
            .collect();
        self.deliver(
            &others,
            &Message::typing(identity, is_typing).with_timestamp(Utc::now()),
        );
    }

    fn send_users_list(&self) {
        let named = self.registry.named_sessions();
        let identities: Vec<String> = named
            .iter()
            .filter_map(|s| s.identity().map(String::from))
            .collect();
        let msg = Message::users_list(&identities).with_timestamp(Utc::now());
        self.deliver(&named, &msg);
    }

    /// Send `msg` to every recipient concurrently and wait for all of them.
    /// Returns how many sends succeeded.
    pub fn deliver(&self, recipients: &[Arc<Session>], msg: &Message) -> usize {
        let outcomes: Vec<bool> = match recipients {
            [] => return 0,
            [only] => vec![send_or_close(only, msg)],
            _ => thread::scope(|scope| {
                let sends: Vec<_> = recipients
                    .iter()
                    .map(|session| scope.spawn(move || send_or_close(session, msg)))
                    .collect();
                sends
                    .into_iter()
                    .map(|send| send.join().unwrap_or(false))
                    .collect()
            }),
        };
        outcomes.into_iter().filter(|ok| *ok).count()
    }
}

/// Send to one session. On failure, close it so its reader thread tears it
/// down; other recipients are unaffected.
fn send_or_close(session: &Session, msg: &Message) -> bool {
    match session.send(msg) {
        Ok(()) => true,
        Err(SessionError::Closed) => {
            debug!(session = %session.id(), "Skipping closed session");
            false
        }
        Err(e) => {
            warn!(
                session = %session.id(),
                identity = session.identity().unwrap_or("-"),
                error = %e,
                "Send failed, closing session"
            );
            session.close();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;
    use std::net::TcpStream;

    use disclite_protocol::{REASON_NAME_TAKEN, SERVER_IDENTITY};

    use super::*;
    use crate::session::test_support::{drain, recv, session_pair};

    struct Harness {
        router: Router,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                router: Router::new(Arc::new(Registry::new()), Arc::new(ChatLog::in_memory())),
            }
        }

        /// Accept a session into the registry without registering it.
        fn connect(&self) -> (Arc<Session>, BufReader<TcpStream>) {
            let (session, client) = session_pair();
            self.router.registry().insert(session.clone());
            (session, client)
        }

        /// Accept and register; drains the registration traffic.
        fn join(&self, name: &str) -> (Arc<Session>, BufReader<TcpStream>) {
            let (session, mut client) = self.connect();
            let outcome = self.router.dispatch(&session, Message::register(name));
            assert_eq!(outcome, Dispatch::Continue);
            let _ = drain(&mut client);
            (session, client)
        }
    }

    #[test]
    fn register_sends_response_then_users_list() {
        let h = Harness::new();
        let (session, mut client) = h.connect();
        assert_eq!(h.router.dispatch(&session, Message::register("alice")), Dispatch::Continue);

        let response = recv(&mut client);
        assert_eq!(response.kind, MessageKind::RegistrationResponse);
        assert_eq!(response.body_text(), REGISTRATION_SUCCESS);
        assert_eq!(response.from, SERVER_IDENTITY);

        let users = recv(&mut client);
        assert_eq!(users.kind, MessageKind::UsersList);
        assert_eq!(users.users(), vec!["alice"]);

        // No join notice to the newcomer itself.
        assert!(drain(&mut client).is_empty());
    }

    #[test]
    fn join_notice_goes_to_others_then_users_list_to_all() {
        let h = Harness::new();
        let (_alice, mut alice_client) = h.join("alice");
        let (_bob, mut bob_client) = h.join("bob");

        let to_alice = drain(&mut alice_client);
        assert_eq!(to_alice.len(), 2, "got {to_alice:?}");
        assert_eq!(to_alice[0].kind, MessageKind::System);
        assert_eq!(to_alice[0].body_text(), "bob joined the chat");
        assert_eq!(to_alice[1].kind, MessageKind::UsersList);
        assert_eq!(to_alice[1].users(), vec!["alice", "bob"]);

        // Bob's own registration traffic was drained by `join`.
        assert!(drain(&mut bob_client).is_empty());
    }

    #[test]
    fn duplicate_name_is_rejected_and_closed() {
        let h = Harness::new();
        let (_alice, mut alice_client) = h.join("alice");
        let (impostor, mut impostor_client) = h.connect();

        assert_eq!(h.router.dispatch(&impostor, Message::register("Alice")), Dispatch::Close);
        let response = recv(&mut impostor_client);
        assert_eq!(response.kind, MessageKind::RegistrationResponse);
        assert_eq!(response.body_text(), REASON_NAME_TAKEN);
        assert!(!impostor.is_named());

        // Alice hears nothing about it.
        assert!(drain(&mut alice_client).is_empty());
        assert_eq!(h.router.registry().identities(), vec!["alice"]);
    }

    #[test]
    fn broadcast_reaches_every_named_session_including_sender() {
        let h = Harness::new();
        let (alice, mut alice_client) = h.join("alice");
        let (_bob, mut bob_client) = h.join("bob");
        let (_lurker, mut lurker_client) = h.connect();
        let _ = drain(&mut alice_client);

        // A spoofed `from` is replaced by the registered identity.
        h.router.dispatch(&alice, Message::chat("mallory", "hello"));

        for client in [&mut alice_client, &mut bob_client] {
            let got = drain(client);
            assert_eq!(got.len(), 1, "got {got:?}");
            assert_eq!(got[0].kind, MessageKind::Chat);
            assert_eq!(got[0].from, "alice");
            assert_eq!(got[0].body_text(), "hello");
            assert!(got[0].timestamp.is_some());
        }
        assert!(drain(&mut lurker_client).is_empty());

        let log = h.router.chat_log().entries();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].identity, "alice");
        assert_eq!(log[0].body, "hello");
        assert_eq!(log[0].session_id, alice.id());
    }

    #[test]
    fn chat_from_unregistered_session_is_dropped() {
        let h = Harness::new();
        let (_alice, mut alice_client) = h.join("alice");
        let (lurker, mut lurker_client) = h.connect();

        assert_eq!(h.router.dispatch(&lurker, Message::chat("x", "hi")), Dispatch::Continue);
        assert!(drain(&mut alice_client).is_empty());
        assert!(drain(&mut lurker_client).is_empty());
        assert!(h.router.chat_log().is_empty());
    }

    #[test]
    fn private_goes_only_to_sender_and_target() {
        let h = Harness::new();
        let (alice, mut alice_client) = h.join("alice");
        let (_bob, mut bob_client) = h.join("bob");
        let (_carol, mut carol_client) = h.join("carol");
        for client in [&mut alice_client, &mut bob_client, &mut carol_client] {
            let _ = drain(client);
        }

        h.router.dispatch(&alice, Message::compose("alice", "<BOB> hi"));

        for client in [&mut alice_client, &mut bob_client] {
            let got = drain(client);
            assert_eq!(got.len(), 1, "got {got:?}");
            assert_eq!(got[0].kind, MessageKind::Private);
            assert_eq!(got[0].from, "alice");
            assert_eq!(got[0].to.as_deref(), Some("bob"));
            assert_eq!(got[0].body_text(), "hi");
        }
        assert!(drain(&mut carol_client).is_empty());

        let log = h.router.chat_log().entries();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].to.as_deref(), Some("bob"));
        assert_eq!(log[0].body, "<bob> hi");
    }

    #[test]
    fn chat_kind_with_target_is_private() {
        let h = Harness::new();
        let (alice, mut alice_client) = h.join("alice");
        let (_bob, mut bob_client) = h.join("bob");
        let _ = drain(&mut alice_client);

        let msg = Message {
            to: Some("bob".into()),
            ..Message::chat("alice", "psst")
        };
        h.router.dispatch(&alice, msg);
        let got = drain(&mut bob_client);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, MessageKind::Private);
    }

    #[test]
    fn private_to_offline_target_is_silently_dropped() {
        let h = Harness::new();
        let (alice, mut alice_client) = h.join("alice");
        let (_bob, mut bob_client) = h.join("bob");
        let _ = drain(&mut alice_client);

        h.router.dispatch(&alice, Message::private("alice", "dave", "anyone?"));

        // No delivery, no failure notice to the sender, nothing logged.
        assert!(drain(&mut alice_client).is_empty());
        assert!(drain(&mut bob_client).is_empty());
        assert!(h.router.chat_log().is_empty());
    }

    #[test]
    fn private_to_self_is_delivered_once() {
        let h = Harness::new();
        let (alice, mut alice_client) = h.join("alice");
        h.router.dispatch(&alice, Message::private("alice", "alice", "note"));
        assert_eq!(drain(&mut alice_client).len(), 1);
    }

    #[test]
    fn typing_goes_to_everyone_but_sender_and_is_not_logged() {
        let h = Harness::new();
        let (alice, mut alice_client) = h.join("alice");
        let (_bob, mut bob_client) = h.join("bob");
        let _ = drain(&mut alice_client);

        h.router.dispatch(&alice, Message::typing("alice", true));

        let got = drain(&mut bob_client);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, MessageKind::Typing);
        assert_eq!(got[0].from, "alice");
        assert_eq!(got[0].typing_state(), Some(true));
        assert!(got[0].timestamp.is_some());
        assert!(drain(&mut alice_client).is_empty());
        assert!(h.router.chat_log().is_empty());
    }

    #[test]
    fn unknown_and_server_only_types_are_dropped() {
        let h = Harness::new();
        let (alice, mut alice_client) = h.join("alice");
        let (_bob, mut bob_client) = h.join("bob");
        let _ = drain(&mut alice_client);

        let poke = Message {
            kind: MessageKind::Unknown("poke".into()),
            ..Message::chat("alice", "!")
        };
        assert_eq!(h.router.dispatch(&alice, poke), Dispatch::Continue);
        h.router.dispatch(&alice, Message::system("fake notice"));
        h.router.dispatch(&alice, Message::users_list(&["nobody".into()]));

        assert!(drain(&mut alice_client).is_empty());
        assert!(drain(&mut bob_client).is_empty());
    }

    #[test]
    fn failed_recipient_does_not_block_others() {
        let h = Harness::new();
        let (alice, mut alice_client) = h.join("alice");
        let (bob, mut bob_client) = h.join("bob");
        let (_carol, mut carol_client) = h.join("carol");
        for client in [&mut alice_client, &mut bob_client, &mut carol_client] {
            let _ = drain(client);
        }

        bob.close();
        h.router.dispatch(&alice, Message::chat("alice", "still here"));

        assert_eq!(drain(&mut alice_client).len(), 1);
        assert_eq!(drain(&mut carol_client).len(), 1);
        assert_eq!(h.router.chat_log().len(), 1);
    }

    #[test]
    fn teardown_announces_departure_once() {
        let h = Harness::new();
        let (alice, mut alice_client) = h.join("alice");
        let (bob, _bob_client) = h.join("bob");
        let _ = drain(&mut alice_client);

        h.router.teardown(&bob);
        h.router.teardown(&bob);

        let got = drain(&mut alice_client);
        assert_eq!(got.len(), 2, "got {got:?}");
        assert_eq!(got[0].body_text(), "bob left the chat");
        assert_eq!(got[1].users(), vec!["alice"]);
        assert!(bob.is_closed());
        assert!(!alice.is_closed());
    }

    #[test]
    fn teardown_of_unnamed_session_is_quiet() {
        let h = Harness::new();
        let (_alice, mut alice_client) = h.join("alice");
        let (lurker, _lurker_client) = h.connect();

        h.router.teardown(&lurker);
        assert!(drain(&mut alice_client).is_empty());
        assert_eq!(h.router.registry().len(), 1);
    }
}
