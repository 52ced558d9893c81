//! Message router: applies one decoded client message to the registries.
//!
//! Runs with the registry lock held, so every read-then-write below is
//! atomic with respect to other connections and the liveness monitor.

use super::registry::Registries;
use chrono::{SecondsFormat, Utc};
use medrelay_core::messages::{
    AnswerPayload, ChatPayload, IceCandidatePayload, JoinPayload, OfferPayload, ParticipantType,
    RecordingPayload, ScreenSharePayload,
};
use medrelay_core::{ClientMessage, ConnectionId, ProtocolError, ServerMessage, ROOM_CAPACITY};
use tracing::debug;

/// Dispatch a message from `from`. An `Err` is reported to the sender as an
/// `error` frame by the caller; no state has changed in that case.
pub fn dispatch(
    reg: &mut Registries,
    from: &ConnectionId,
    msg: ClientMessage,
) -> Result<(), ProtocolError> {
    debug!(conn_id = %from, kind = msg.kind(), "routing message");
    match msg {
        ClientMessage::Join(p) => handle_join(reg, from, p),
        ClientMessage::Offer(p) => handle_offer(reg, from, p),
        ClientMessage::Answer(p) => handle_answer(reg, from, p),
        ClientMessage::IceCandidate(p) => handle_ice_candidate(reg, from, p),
        ClientMessage::Leave {} => {
            reg.leave_room(from);
            Ok(())
        }
        ClientMessage::Chat(p) => handle_chat(reg, from, p),
        ClientMessage::ScreenShare(p) => handle_screen_share(reg, from, p),
        ClientMessage::Recording(p) => handle_recording(reg, from, p),
    }
}

fn handle_join(reg: &mut Registries, from: &ConnectionId, p: JoinPayload) -> Result<(), ProtocolError> {
    let room_id = p.room_id.filter(|s| !s.is_empty());
    let participant_id = p.participant_id.filter(|s| !s.is_empty());
    let (Some(room_id), Some(participant_id)) = (room_id, participant_id) else {
        return Err(ProtocolError::MissingJoinFields);
    };
    let participant_type = p.participant_type.unwrap_or_default();

    let outcome = reg.join_room(from, &room_id, &participant_id, participant_type)?;
    if let Some(left) = &outcome.left {
        debug!(conn_id = %from, from_room = %left.room_id, to_room = %room_id, "switched rooms");
    }
    let count = outcome.participant_count;

    reg.send(
        from,
        ServerMessage::Joined {
            room_id,
            participant_id: participant_id.clone(),
            participant_count: count,
        },
    );

    let notice = ServerMessage::UserJoined {
        participant_id,
        participant_type,
        participant_count: count,
    };
    for other in &outcome.others {
        reg.send(other, notice.clone());
    }

    if count == ROOM_CAPACITY {
        reg.send(from, ServerMessage::ready_to_connect());
    }
    Ok(())
}

/// Resolve `target` inside the sender's room and queue the built message.
///
/// Returns `Ok(false)` when the target cannot be resolved; the caller picks
/// between an error and a silent drop.
fn relay_to_target(
    reg: &Registries,
    from: &ConnectionId,
    target: Option<&str>,
    build: impl FnOnce(String) -> ServerMessage,
) -> Result<bool, ProtocolError> {
    let (room_id, sender) = reg.membership(from)?;
    let Some(target_conn) = target.and_then(|t| reg.find_participant(&room_id, t)) else {
        return Ok(false);
    };
    debug!(from = %sender, to = ?target, room_id = %room_id, "relaying");
    reg.send(target_conn, build(sender));
    Ok(true)
}

fn handle_offer(reg: &mut Registries, from: &ConnectionId, p: OfferPayload) -> Result<(), ProtocolError> {
    let offer = p.offer;
    let found = relay_to_target(reg, from, p.target_participant_id.as_deref(), |sender| {
        ServerMessage::Offer {
            offer,
            from_participant_id: sender,
        }
    })?;
    if found {
        Ok(())
    } else {
        Err(ProtocolError::TargetNotFound)
    }
}

fn handle_answer(reg: &mut Registries, from: &ConnectionId, p: AnswerPayload) -> Result<(), ProtocolError> {
    let answer = p.answer;
    let found = relay_to_target(reg, from, p.target_participant_id.as_deref(), |sender| {
        ServerMessage::Answer {
            answer,
            from_participant_id: sender,
        }
    })?;
    if found {
        Ok(())
    } else {
        Err(ProtocolError::TargetNotFound)
    }
}

fn handle_ice_candidate(
    reg: &mut Registries,
    from: &ConnectionId,
    p: IceCandidatePayload,
) -> Result<(), ProtocolError> {
    let candidate = p.candidate;
    let found = relay_to_target(reg, from, p.target_participant_id.as_deref(), |sender| {
        ServerMessage::IceCandidate {
            candidate,
            from_participant_id: sender,
        }
    })?;
    // Candidates can arrive before the peer has joined.
    if !found {
        debug!(conn_id = %from, target = ?p.target_participant_id, "dropping ICE candidate for unknown target");
    }
    Ok(())
}

fn handle_chat(reg: &mut Registries, from: &ConnectionId, p: ChatPayload) -> Result<(), ProtocolError> {
    let (room_id, sender) = reg.membership(from)?;
    let msg = ServerMessage::Chat {
        message: p.message,
        from_participant_id: sender,
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    };
    reg.broadcast(&room_id, &msg, Some(from));
    Ok(())
}

fn handle_screen_share(
    reg: &mut Registries,
    from: &ConnectionId,
    p: ScreenSharePayload,
) -> Result<(), ProtocolError> {
    let (room_id, sender) = reg.membership(from)?;
    let msg = ServerMessage::ScreenShare {
        enabled: p.enabled,
        from_participant_id: sender,
    };
    reg.broadcast(&room_id, &msg, Some(from));
    Ok(())
}

fn handle_recording(
    reg: &mut Registries,
    from: &ConnectionId,
    p: RecordingPayload,
) -> Result<(), ProtocolError> {
    let (room_id, _) = reg.membership(from)?;
    let is_doctor = reg
        .connection(from)
        .is_some_and(|e| e.participant_type == ParticipantType::Doctor);
    if !is_doctor {
        return Err(ProtocolError::RecordingNotAllowed);
    }
    // Everyone, sender included, sees the same recording state.
    reg.broadcast(&room_id, &ServerMessage::recording(p.status), None);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::registry::tests::{connect, drain};
    use medrelay_core::decode_client;
    use serde_json::json;

    fn cid(s: &str) -> ConnectionId {
        ConnectionId::from(s)
    }

    fn send(reg: &mut Registries, from: &str, frame: serde_json::Value) -> Result<(), ProtocolError> {
        let msg = decode_client(&frame.to_string())?;
        dispatch(reg, &cid(from), msg)
    }

    fn join(reg: &mut Registries, from: &str, room: &str, participant: &str, kind: &str) {
        send(
            reg,
            from,
            json!({ "type": "join", "roomId": room, "participantId": participant, "participantType": kind }),
        )
        .unwrap();
    }

    #[test]
    fn join_requires_room_and_participant() {
        let mut reg = Registries::new();
        let _a = connect(&mut reg, "a");
        assert_eq!(
            send(&mut reg, "a", json!({ "type": "join", "roomId": "r" })),
            Err(ProtocolError::MissingJoinFields)
        );
        assert_eq!(
            send(&mut reg, "a", json!({ "type": "join", "roomId": "", "participantId": "p" })),
            Err(ProtocolError::MissingJoinFields)
        );
        assert_eq!(reg.room_count(), 0);
    }

    #[test]
    fn join_sequence_notifies_both_sides() {
        let mut reg = Registries::new();
        let mut a = connect(&mut reg, "a");
        let mut b = connect(&mut reg, "b");

        join(&mut reg, "a", "room-42", "doc1", "doctor");
        assert_eq!(
            drain(&mut a),
            vec![ServerMessage::Joined {
                room_id: "room-42".into(),
                participant_id: "doc1".into(),
                participant_count: 1,
            }]
        );

        send(&mut reg, "b", json!({ "type": "join", "roomId": "room-42", "participantId": "pat1" })).unwrap();
        assert_eq!(
            drain(&mut a),
            vec![ServerMessage::UserJoined {
                participant_id: "pat1".into(),
                participant_type: ParticipantType::Patient,
                participant_count: 2,
            }]
        );
        assert_eq!(
            drain(&mut b),
            vec![
                ServerMessage::Joined {
                    room_id: "room-42".into(),
                    participant_id: "pat1".into(),
                    participant_count: 2,
                },
                ServerMessage::ready_to_connect(),
            ]
        );
    }

    #[test]
    fn offer_reaches_only_the_target() {
        let mut reg = Registries::new();
        let mut a = connect(&mut reg, "a");
        let mut b = connect(&mut reg, "b");
        let mut c = connect(&mut reg, "c");
        let mut d = connect(&mut reg, "d");
        join(&mut reg, "a", "R1", "p1", "doctor");
        join(&mut reg, "b", "R1", "p2", "patient");
        join(&mut reg, "c", "R2", "p1", "doctor");
        join(&mut reg, "d", "R2", "p2", "patient");
        for rx in [&mut a, &mut b, &mut c, &mut d] {
            drain(rx);
        }

        let sdp = json!({ "type": "offer", "sdp": "v=0" });
        send(&mut reg, "a", json!({ "type": "offer", "offer": sdp, "targetParticipantId": "p2" })).unwrap();

        assert_eq!(
            drain(&mut b),
            vec![ServerMessage::Offer {
                offer: sdp,
                from_participant_id: "p1".into(),
            }]
        );
        assert!(drain(&mut a).is_empty());
        assert!(drain(&mut c).is_empty());
        assert!(drain(&mut d).is_empty());
    }

    #[test]
    fn answer_is_relayed_back() {
        let mut reg = Registries::new();
        let mut a = connect(&mut reg, "a");
        let _b = connect(&mut reg, "b");
        join(&mut reg, "a", "R1", "p1", "doctor");
        join(&mut reg, "b", "R1", "p2", "patient");
        drain(&mut a);

        send(&mut reg, "b", json!({ "type": "answer", "answer": { "sdp": "v=0" }, "targetParticipantId": "p1" })).unwrap();
        assert_eq!(
            drain(&mut a),
            vec![ServerMessage::Answer {
                answer: json!({ "sdp": "v=0" }),
                from_participant_id: "p2".into(),
            }]
        );
    }

    #[test]
    fn negotiation_requires_join_and_target() {
        let mut reg = Registries::new();
        let _a = connect(&mut reg, "a");
        assert_eq!(
            send(&mut reg, "a", json!({ "type": "offer", "offer": {}, "targetParticipantId": "p2" })),
            Err(ProtocolError::NotJoined)
        );
        join(&mut reg, "a", "R1", "p1", "doctor");
        assert_eq!(
            send(&mut reg, "a", json!({ "type": "offer", "offer": {}, "targetParticipantId": "p2" })),
            Err(ProtocolError::TargetNotFound)
        );
        assert_eq!(
            send(&mut reg, "a", json!({ "type": "answer", "answer": {} })),
            Err(ProtocolError::TargetNotFound)
        );
    }

    #[test]
    fn ice_candidate_for_absent_target_is_dropped() {
        let mut reg = Registries::new();
        let mut a = connect(&mut reg, "a");
        assert_eq!(
            send(&mut reg, "a", json!({ "type": "ice-candidate", "candidate": {}, "targetParticipantId": "p2" })),
            Err(ProtocolError::NotJoined)
        );
        join(&mut reg, "a", "R1", "p1", "doctor");
        drain(&mut a);
        assert_eq!(
            send(&mut reg, "a", json!({ "type": "ice-candidate", "candidate": { "candidate": "udp 1" }, "targetParticipantId": "p2" })),
            Ok(())
        );
        assert!(drain(&mut a).is_empty());
    }

    #[test]
    fn ice_candidate_is_relayed_when_target_present() {
        let mut reg = Registries::new();
        let _a = connect(&mut reg, "a");
        let mut b = connect(&mut reg, "b");
        join(&mut reg, "a", "R1", "p1", "doctor");
        join(&mut reg, "b", "R1", "p2", "patient");
        drain(&mut b);
        send(&mut reg, "a", json!({ "type": "ice-candidate", "candidate": "c1", "targetParticipantId": "p2" })).unwrap();
        assert_eq!(
            drain(&mut b),
            vec![ServerMessage::IceCandidate {
                candidate: json!("c1"),
                from_participant_id: "p1".into(),
            }]
        );
    }

    #[test]
    fn chat_and_screen_share_skip_sender() {
        let mut reg = Registries::new();
        let mut a = connect(&mut reg, "a");
        let mut b = connect(&mut reg, "b");
        assert_eq!(
            send(&mut reg, "a", json!({ "type": "chat", "message": "hi" })),
            Err(ProtocolError::NotJoined)
        );
        join(&mut reg, "a", "R1", "p1", "doctor");
        join(&mut reg, "b", "R1", "p2", "patient");
        drain(&mut a);
        drain(&mut b);

        send(&mut reg, "a", json!({ "type": "chat", "message": "hello" })).unwrap();
        send(&mut reg, "a", json!({ "type": "screen-share", "enabled": true })).unwrap();
        assert!(drain(&mut a).is_empty());

        let got = drain(&mut b);
        assert_eq!(got.len(), 2);
        let ServerMessage::Chat { message, from_participant_id, timestamp } = &got[0] else {
            panic!("expected chat, got {got:?}");
        };
        assert_eq!(message, &json!("hello"));
        assert_eq!(from_participant_id, "p1");
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
        assert!(timestamp.ends_with('Z'));
        assert_eq!(
            got[1],
            ServerMessage::ScreenShare {
                enabled: json!(true),
                from_participant_id: "p1".into(),
            }
        );
    }

    #[test]
    fn recording_is_doctor_only_and_reaches_everyone() {
        let mut reg = Registries::new();
        let mut a = connect(&mut reg, "a");
        let mut b = connect(&mut reg, "b");
        join(&mut reg, "a", "R1", "doc1", "doctor");
        join(&mut reg, "b", "R1", "pat1", "patient");
        drain(&mut a);
        drain(&mut b);

        assert_eq!(
            send(&mut reg, "b", json!({ "type": "recording", "status": "started" })),
            Err(ProtocolError::RecordingNotAllowed)
        );
        assert!(drain(&mut a).is_empty());
        assert!(drain(&mut b).is_empty());

        send(&mut reg, "a", json!({ "type": "recording", "status": "started" })).unwrap();
        let expected = vec![ServerMessage::recording(json!("started"))];
        assert_eq!(drain(&mut a), expected);
        assert_eq!(drain(&mut b), expected);
    }

    #[test]
    fn leave_notifies_and_is_idempotent() {
        let mut reg = Registries::new();
        let _a = connect(&mut reg, "a");
        let mut b = connect(&mut reg, "b");
        join(&mut reg, "a", "R1", "p1", "doctor");
        join(&mut reg, "b", "R1", "p2", "patient");
        drain(&mut b);

        send(&mut reg, "a", json!({ "type": "leave" })).unwrap();
        send(&mut reg, "a", json!({ "type": "leave" })).unwrap();
        assert_eq!(
            drain(&mut b),
            vec![ServerMessage::UserLeft {
                participant_id: "p1".into(),
                participant_count: 1,
            }]
        );
        assert!(reg.is_consistent());
    }
}
