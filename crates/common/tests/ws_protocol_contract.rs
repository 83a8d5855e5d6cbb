use bookclub_common::protocol::ws::{
    ClientFrame, ServerFrame, CURRENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use bookclub_common::types::{CursorPosition, ReactionAction};
use chrono::Utc;
use uuid::Uuid;

fn load_contract() -> serde_json::Value {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../contracts/ws-protocol.json");
    let content = std::fs::read_to_string(path).expect("contract file should be readable");
    serde_json::from_str(&content).expect("contract file should be valid JSON")
}

fn contract_list(contract: &serde_json::Value, key: &str) -> Vec<String> {
    contract[key]
        .as_array()
        .unwrap_or_else(|| panic!("{key} should be an array"))
        .iter()
        .map(|v| v.as_str().expect("entry should be a string").to_string())
        .collect()
}

#[test]
fn current_version_matches_contract() {
    let contract = load_contract();
    let expected =
        contract["current_version"].as_str().expect("current_version should be a string");
    assert_eq!(CURRENT_PROTOCOL_VERSION, expected);
}

#[test]
fn supported_versions_match_contract() {
    let contract = load_contract();
    let expected = contract_list(&contract, "protocol_versions");
    let supported: Vec<String> = SUPPORTED_PROTOCOL_VERSIONS.iter().map(|v| v.to_string()).collect();
    assert_eq!(supported, expected);
}

#[test]
fn client_frame_tags_match_contract() {
    let id = Uuid::nil();
    let frames = vec![
        ClientFrame::Hello { token: "t".into(), protocol_version: None },
        ClientFrame::Join { club_id: id, room_id: id },
        ClientFrame::SwitchRoom { room_id: id },
        ClientFrame::ViewRoom { room_id: id },
        ClientFrame::ViewSection { section: "suggestions".into(), club_id: None },
        ClientFrame::ChatMessage { body: "hi".into(), attachments: Vec::new(), reply_to_id: None },
        ClientFrame::LoadOlderMessages { before: Utc::now(), limit: None },
        ClientFrame::EditDocument { text: String::new(), base_revision: 0 },
        ClientFrame::CursorMove { line: 0, column: 0 },
        ClientFrame::React { message_id: id, emoji: "👍".into(), action: ReactionAction::Add },
        ClientFrame::EditMessage { message_id: id, content: "x".into() },
        ClientFrame::DeleteMessage { message_id: id },
        ClientFrame::Leave,
    ];

    let tags: Vec<String> = frames
        .iter()
        .map(|frame| {
            let value = serde_json::to_value(frame).expect("frame should serialize");
            let tag = value["type"].as_str().expect("type tag").to_string();
            assert_eq!(tag, frame.kind());
            tag
        })
        .collect();

    assert_eq!(tags, contract_list(&load_contract(), "client_frames"));
}

#[test]
fn server_frame_tags_are_listed_in_contract() {
    let contract = load_contract();
    let listed = contract_list(&contract, "server_frames");
    let id = Uuid::nil();
    let frames = vec![
        ServerFrame::RoomActivity { room_id: id },
        ServerFrame::SectionActivity { section: "suggestions".into() },
        ServerFrame::DocumentAck { room_id: id, revision: 1 },
        ServerFrame::CursorUpdate {
            room_id: id,
            user_id: id,
            cursor: CursorPosition { line: 1, column: 2 },
        },
        ServerFrame::Error {
            code: "STALE_REVISION".into(),
            message: "stale".into(),
            retryable: false,
            revision: Some(3),
            text: Some("abc".into()),
        },
    ];
    for frame in frames {
        let value = serde_json::to_value(&frame).expect("frame should serialize");
        let tag = value["type"].as_str().expect("type tag");
        assert!(listed.iter().any(|t| t == tag), "{tag} missing from contract");
    }
}
