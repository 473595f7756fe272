//! End-to-end turn flow through `GameSession` against a scripted host.

use std::sync::Arc;
use xiuxian_core::log::{LogError, MessageStatus, Sender, PRELUDE};
use xiuxian_core::narrator::NarratorError;
use xiuxian_core::persist::auto_save_key;
use xiuxian_core::session::{FAILURE_NOTICE, GameSession, SessionConfig, SessionError};
use xiuxian_core::testing::{assert_variable, assert_variable_keys, ready_backend, sample_character, MockHost, MockReply};

const TREASURE: &str =
    "###STATE\n{\"currency\":150,\"unknown_key\":\"x\"}\n###END\n\nYou found treasure.";

async fn session_with(replies: Vec<MockReply>) -> (GameSession, Arc<MockHost>) {
    let host = Arc::new(MockHost::new(replies));
    let backend = ready_backend(host.clone()).await;
    let session = GameSession::new(backend, sample_character(), SessionConfig::new());
    (session, host)
}

#[tokio::test]
async fn test_state_update_applied_and_unknown_keys_dropped() {
    let (mut session, host) = session_with(vec![MockReply::text(TREASURE)]).await;
    let keys_before: Vec<String> = session
        .character()
        .variables
        .keys()
        .map(str::to_string)
        .collect();

    let mut streamed = Vec::new();
    let turn = session
        .send("I dig beneath the old pine.", |text, _| {
            streamed.push(text.to_string())
        })
        .await
        .unwrap();

    assert_eq!(turn.content, "You found treasure.");
    assert!(!turn.malformed_block);
    assert_variable(session.character(), "currency", 150u32);
    let keys: Vec<&str> = keys_before.iter().map(String::as_str).collect();
    assert_variable_keys(session.character(), &keys);

    assert!(streamed.iter().all(|t| !t.contains("###")));

    let log = session.log();
    assert_eq!(log.len(), PRELUDE.len() + 2);
    let last = log.last().unwrap();
    assert_eq!(last.id, turn.message_id);
    assert_eq!(last.sender, Sender::Narrator);
    assert_eq!(last.status, MessageStatus::Complete);
    assert_eq!(log.messages()[PRELUDE.len()].content, "I dig beneath the old pine.");

    assert!(host.kv_keys().contains(&auto_save_key()));
}

#[tokio::test]
async fn test_concurrent_send_rejected_without_touching_log() {
    let (mut session, host) = session_with(vec![MockReply::text("The wind howls.")]).await;
    let gate = host.hold();
    let narrator = session.narrator().clone();
    let character = session.character().clone();
    let before = session.log().messages().to_vec();

    let (first, second) = tokio::join!(
        narrator.generate_response(&character, &[], "I wait.", |_, _| {}),
        async {
            let result = session.send("I leave.", |_, _| {}).await;
            gate.release();
            result
        }
    );

    assert_eq!(first.unwrap().content, "The wind howls.");
    assert!(matches!(
        second,
        Err(SessionError::Narrator(NarratorError::AlreadyGenerating))
    ));
    assert_eq!(session.log().messages(), before.as_slice());
    assert_eq!(host.completion_count(), 1);
}

#[tokio::test]
async fn test_failed_turn_marked_and_left_out_of_next_prompt() {
    let (mut session, host) = session_with(vec![
        MockReply::fail("connection reset"),
        MockReply::text("The path is clear."),
    ])
    .await;

    let result = session.send("I step onto the bridge.", |_, _| {}).await;
    assert!(matches!(
        result,
        Err(SessionError::Narrator(NarratorError::Backend(_)))
    ));

    let failed = session.log().last().unwrap().clone();
    assert_eq!(failed.status, MessageStatus::Failed);
    assert_eq!(failed.content, FAILURE_NOTICE);
    assert!(!session.is_generating());

    session.send("I try again.", |_, _| {}).await.unwrap();

    let prompt: String = host.requests()[1]
        .turns
        .iter()
        .map(|t| t.text.as_str())
        .collect();
    assert!(!prompt.contains(FAILURE_NOTICE));
    assert!(prompt.contains("I step onto the bridge."));
}

#[tokio::test]
async fn test_edit_player_turn_regenerates() {
    let (mut session, host) = session_with(vec![
        MockReply::text("A gate looms."),
        MockReply::text("You sprint past the gate."),
    ])
    .await;

    session.send("I walk forward.", |_, _| {}).await.unwrap();
    let player_id = session.log().messages()[PRELUDE.len()].id;

    let turn = session
        .edit(player_id, "I run forward.", |_, _| {})
        .await
        .unwrap()
        .expect("player edit regenerates");

    assert_eq!(turn.content, "You sprint past the gate.");
    let log = session.log();
    assert_eq!(log.len(), PRELUDE.len() + 2);
    assert_eq!(log.get(player_id).unwrap().content, "I run forward.");
    assert!(log.messages().iter().all(|m| m.content != "A gate looms."));

    let last_request = host.requests().pop().unwrap();
    let prompt: String = last_request.turns.iter().map(|t| t.text.as_str()).collect();
    assert!(prompt.contains("<last_input>\nI run forward.\n</last_input>"));
    assert!(!prompt.contains("I walk forward."));
}

#[tokio::test]
async fn test_edit_narrator_turn_only_changes_text() {
    let (mut session, host) = session_with(vec![MockReply::text("A gate looms.")]).await;
    let turn = session.send("I walk forward.", |_, _| {}).await.unwrap();

    let outcome = session
        .edit(turn.message_id, "A vast gate looms.", |_, _| {})
        .await
        .unwrap();

    assert!(outcome.is_none());
    assert_eq!(host.completion_count(), 1);
    assert_eq!(
        session.log().get(turn.message_id).unwrap().content,
        "A vast gate looms."
    );
}

#[tokio::test]
async fn test_reroll_replaces_in_place() {
    let (mut session, _host) = session_with(vec![
        MockReply::text("A gate looms."),
        MockReply::text("###STATE {\"condition\":\"Winded\"} ###END A bridge appears."),
    ])
    .await;

    let turn = session.send("I walk forward.", |_, _| {}).await.unwrap();
    let len = session.log().len();

    let rerolled = session.reroll(turn.message_id, |_, _| {}).await.unwrap();

    assert_eq!(rerolled.message_id, turn.message_id);
    assert_eq!(rerolled.content, "A bridge appears.");
    assert_eq!(session.log().len(), len);
    assert_eq!(session.log().last().unwrap().content, "A bridge appears.");
    assert_variable(session.character(), "condition", "Winded");
}

#[tokio::test]
async fn test_failed_reroll_keeps_previous_text() {
    let (mut session, _host) = session_with(vec![
        MockReply::text("A gate looms."),
        MockReply::fail("timeout"),
    ])
    .await;

    let turn = session.send("I walk forward.", |_, _| {}).await.unwrap();
    assert!(session.reroll(turn.message_id, |_, _| {}).await.is_err());

    let message = session.log().get(turn.message_id).unwrap();
    assert_eq!(message.content, "A gate looms.");
    assert_eq!(message.status, MessageStatus::Complete);
}

#[tokio::test]
async fn test_reroll_rejects_player_turn() {
    let (mut session, _host) = session_with(vec![MockReply::text("A gate looms.")]).await;
    session.send("I walk forward.", |_, _| {}).await.unwrap();
    let player_id = session.log().messages()[PRELUDE.len()].id;

    let result = session.reroll(player_id, |_, _| {}).await;
    assert!(matches!(
        result,
        Err(SessionError::Log(LogError::NotNarratorTurn(id))) if id == player_id
    ));
}

#[tokio::test]
async fn test_delete_then_later_ids_are_gone() {
    let (mut session, _host) = session_with(vec![
        MockReply::text("A gate looms."),
        MockReply::text("Nobody answers."),
    ])
    .await;

    session.send("I walk forward.", |_, _| {}).await.unwrap();
    let second = session.send("I knock.", |_, _| {}).await.unwrap();
    let first_player = session.log().messages()[PRELUDE.len()].id;

    let removed = session.delete(first_player).unwrap();
    assert_eq!(removed, 4);
    assert_eq!(session.log().len(), PRELUDE.len());

    let result = session.edit(second.message_id, "x", |_, _| {}).await;
    assert!(matches!(
        result,
        Err(SessionError::Log(LogError::NotFound(id))) if id == second.message_id
    ));
}

#[tokio::test]
async fn test_opening_does_not_touch_prior_history() {
    let (mut session, host) = session_with(vec![MockReply::text(
        "###STATE {\"location\":\"Misty Peak\"} ###END Snow drifts past.",
    )])
    .await;

    let turn = session.start(|_, _| {}).await.unwrap();

    assert_eq!(turn.content, "Snow drifts past.");
    // `location` is not a tracked variable.
    assert_eq!(session.character().location, "Azure Cloud Town");
    let prompt: String = host.requests()[0]
        .turns
        .iter()
        .map(|t| t.text.as_str())
        .collect();
    assert!(!prompt.contains("<last_input>"));
}
