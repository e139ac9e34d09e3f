// Typing indicators.
//
// Outbound: non-empty compose text emits `typing` and (re)arms a silence timer;
// emptying the box or the timer firing emits `stop_typing`. Timers are tracked
// by generation so a stale fire is a no-op.
//
// Inbound: flags are keyed by the sender's normalized address and only clear on
// an explicit stop or when the relay connection drops. There is no local decay.

use std::collections::{BTreeSet, HashMap};

use crate::identity::{addresses_match, normalize_address};
use crate::relay::{RelayFrame, TypingSignal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingEffect {
    Emit(RelayFrame),
    ArmTimer { chat_id: String, generation: u64 },
}

#[derive(Debug, Clone)]
struct Outbound {
    receiver: String,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct TypingMachine {
    me: String,
    next_generation: u64,
    // chat_id -> currently typing in that chat
    outbound: HashMap<String, Outbound>,
    inbound: BTreeSet<String>,
}

impl TypingMachine {
    pub fn new(local_address: &str) -> Self {
        Self {
            me: local_address.to_string(),
            ..Self::default()
        }
    }

    fn signal(&self, receiver: &str) -> TypingSignal {
        TypingSignal {
            sender_id: self.me.clone(),
            receiver_id: receiver.to_string(),
        }
    }

    /// Compose box changed. `receiver` is `None` for conversations without a
    /// single counterparty (groups), which never signal typing.
    pub fn on_compose_changed(&mut self, chat_id: &str, receiver: Option<&str>, text: &str) -> Vec<TypingEffect> {
        if text.trim().is_empty() {
            return self.stop(chat_id);
        }
        let Some(receiver) = receiver.filter(|r| !r.trim().is_empty()) else {
            return vec![];
        };
        self.next_generation += 1;
        let generation = self.next_generation;
        self.outbound.insert(
            chat_id.to_string(),
            Outbound {
                receiver: receiver.to_string(),
                generation,
            },
        );
        vec![
            TypingEffect::Emit(RelayFrame::Typing(self.signal(receiver))),
            TypingEffect::ArmTimer {
                chat_id: chat_id.to_string(),
                generation,
            },
        ]
    }

    /// Silence timer elapsed. Only the most recently armed timer counts.
    pub fn on_timer_fired(&mut self, chat_id: &str, generation: u64) -> Vec<TypingEffect> {
        match self.outbound.get(chat_id) {
            Some(o) if o.generation == generation => self.stop(chat_id),
            _ => vec![],
        }
    }

    /// The user left `previous`; any typing there ends now.
    pub fn on_active_chat_changed(&mut self, previous: Option<&str>) -> Vec<TypingEffect> {
        match previous {
            Some(chat_id) => self.stop(chat_id),
            None => vec![],
        }
    }

    /// Best-effort stop for everything still typing.
    pub fn on_shutdown(&mut self) -> Vec<TypingEffect> {
        let chats: Vec<String> = self.outbound.keys().cloned().collect();
        chats.iter().flat_map(|c| self.stop(c)).collect()
    }

    fn stop(&mut self, chat_id: &str) -> Vec<TypingEffect> {
        match self.outbound.remove(chat_id) {
            Some(o) => vec![TypingEffect::Emit(RelayFrame::StopTyping(self.signal(&o.receiver)))],
            None => vec![],
        }
    }

    pub fn is_composing(&self, chat_id: &str) -> bool {
        self.outbound.contains_key(chat_id)
    }

    /// Apply an inbound `user_typing` / `user_stop_typing`. Returns true if a
    /// flag changed. Signals addressed to someone else are ignored.
    pub fn on_inbound(&mut self, signal: &TypingSignal, typing: bool) -> bool {
        if !addresses_match(&signal.receiver_id, &self.me) {
            return false;
        }
        let key = normalize_address(&signal.sender_id);
        if key.is_empty() {
            return false;
        }
        if typing {
            self.inbound.insert(key)
        } else {
            self.inbound.remove(&key)
        }
    }

    /// The relay connection closed; nobody can be known to be typing.
    pub fn on_relay_disconnected(&mut self) -> bool {
        let changed = !self.inbound.is_empty();
        self.inbound.clear();
        changed
    }

    pub fn is_typing(&self, address: &str) -> bool {
        self.inbound.contains(&normalize_address(address))
    }

    /// Normalized addresses currently flagged, sorted.
    pub fn typing_peers(&self) -> Vec<String> {
        self.inbound.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: &str = "9123456780";
    const ASHA: &str = "9876543210";

    fn typing(to: &str) -> TypingEffect {
        TypingEffect::Emit(RelayFrame::Typing(TypingSignal {
            sender_id: ME.into(),
            receiver_id: to.into(),
        }))
    }

    fn stop(to: &str) -> TypingEffect {
        TypingEffect::Emit(RelayFrame::StopTyping(TypingSignal {
            sender_id: ME.into(),
            receiver_id: to.into(),
        }))
    }

    fn inbound(from: &str) -> TypingSignal {
        TypingSignal {
            sender_id: from.into(),
            receiver_id: ME.into(),
        }
    }

    #[test]
    fn keystrokes_emit_typing_and_rearm() {
        let mut m = TypingMachine::new(ME);
        let first = m.on_compose_changed("c1", Some(ASHA), "h");
        assert_eq!(
            first,
            vec![
                typing(ASHA),
                TypingEffect::ArmTimer {
                    chat_id: "c1".into(),
                    generation: 1
                }
            ]
        );
        let second = m.on_compose_changed("c1", Some(ASHA), "hi");
        assert_eq!(second[1], TypingEffect::ArmTimer { chat_id: "c1".into(), generation: 2 });

        // The first timer is stale now.
        assert!(m.on_timer_fired("c1", 1).is_empty());
        assert!(m.is_composing("c1"));
        assert_eq!(m.on_timer_fired("c1", 2), vec![stop(ASHA)]);
        assert!(!m.is_composing("c1"));
        assert!(m.on_timer_fired("c1", 2).is_empty());
    }

    #[test]
    fn emptying_the_box_stops_immediately_once() {
        let mut m = TypingMachine::new(ME);
        m.on_compose_changed("c1", Some(ASHA), "hello");
        assert_eq!(m.on_compose_changed("c1", Some(ASHA), "   "), vec![stop(ASHA)]);
        assert!(m.on_compose_changed("c1", Some(ASHA), "").is_empty());
        // Timer armed before the stop no longer matters.
        assert!(m.on_timer_fired("c1", 1).is_empty());
    }

    #[test]
    fn groups_never_signal() {
        let mut m = TypingMachine::new(ME);
        assert!(m.on_compose_changed("g1", None, "hello").is_empty());
        assert!(!m.is_composing("g1"));
    }

    #[test]
    fn switching_chats_and_shutdown_emit_final_stop() {
        let mut m = TypingMachine::new(ME);
        m.on_compose_changed("c1", Some(ASHA), "hello");
        assert_eq!(m.on_active_chat_changed(Some("c1")), vec![stop(ASHA)]);
        assert!(m.on_active_chat_changed(Some("c1")).is_empty());

        m.on_compose_changed("c2", Some("9000000001"), "x");
        assert_eq!(m.on_shutdown(), vec![stop("9000000001")]);
        assert!(m.on_shutdown().is_empty());
    }

    #[test]
    fn inbound_typing_has_no_local_timeout() {
        let mut m = TypingMachine::new(ME);
        assert!(m.on_inbound(&inbound("+91 98765 43210"), true));
        assert!(m.is_typing(ASHA));

        // The machine has no clock input. Inbound state only changes on a stop
        // signal or a disconnect, so 10 s of silence cannot clear it. The only
        // timed event it sees, the outbound idle timer, leaves it alone too.
        for generation in 0..4 {
            m.on_timer_fired("c1", generation);
        }
        m.on_compose_changed("c1", Some(ASHA), "typing back");
        m.on_compose_changed("c1", Some(ASHA), "");
        assert!(m.is_typing(ASHA));
        assert_eq!(m.typing_peers(), vec![ASHA.to_string()]);

        assert!(m.on_inbound(&inbound(ASHA), false));
        assert!(!m.is_typing(ASHA));
    }

    #[test]
    fn inbound_for_someone_else_is_ignored() {
        let mut m = TypingMachine::new(ME);
        let signal = TypingSignal {
            sender_id: ASHA.into(),
            receiver_id: "9000000000".into(),
        };
        assert!(!m.on_inbound(&signal, true));
        assert!(!m.is_typing(ASHA));
    }

    #[test]
    fn disconnect_clears_inbound_flags() {
        let mut m = TypingMachine::new(ME);
        m.on_inbound(&inbound(ASHA), true);
        m.on_inbound(&inbound("9000000001"), true);
        assert!(m.on_relay_disconnected());
        assert!(m.typing_peers().is_empty());
        assert!(!m.on_relay_disconnected());
    }
}
