//! End-to-end operation tests: signed envelopes in, state codes and sealed
//! bodies out, against in-memory storage.

use std::sync::OnceLock;

use serde_json::{Value, json};
use timevault_core::envelope::{SignedRequest, build_signed_request, decrypt_response};
use timevault_crypto::{PrivateKey, PublicKey, generate_keypair};
use timevault_server::api::Api;
use timevault_server::respond::ApiResponse;
use timevault_server::storage::MemoryStorage;

const NOW: i64 = 1_700_000_000;

fn alice() -> &'static (PublicKey, PrivateKey) {
    static KEYS: OnceLock<(PublicKey, PrivateKey)> = OnceLock::new();
    KEYS.get_or_init(|| generate_keypair().unwrap())
}

fn bob() -> &'static (PublicKey, PrivateKey) {
    static KEYS: OnceLock<(PublicKey, PrivateKey)> = OnceLock::new();
    KEYS.get_or_init(|| generate_keypair().unwrap())
}

fn signed(username: &str, key: &PrivateKey, body: Value) -> SignedRequest {
    build_signed_request(username, NOW, &body, key).unwrap()
}

fn expect_clear(response: ApiResponse) -> Value {
    match response {
        ApiResponse::Clear(body) => {
            assert_eq!(body["state"], 0, "unexpected state in {body}");
            body
        }
        other => panic!("expected clear response, got {other:?}"),
    }
}

fn expect_state(response: ApiResponse, state: i32) {
    match response {
        ApiResponse::Error(body) => assert_eq!(body.state, state, "wrong state: {}", body.error),
        other => panic!("expected error state {state}, got {other:?}"),
    }
}

fn expect_sealed(response: ApiResponse, key: &PrivateKey) -> Value {
    match response {
        ApiResponse::Sealed(encrypted) => {
            let body = decrypt_response(&encrypted, key).unwrap();
            assert_eq!(body["state"], 0, "unexpected state in {body}");
            body
        }
        other => panic!("expected sealed response, got {other:?}"),
    }
}

fn api_with_users() -> Api<MemoryStorage> {
    let api = Api::new(MemoryStorage::new());
    for (name, keys) in [("alice", alice()), ("bob", bob())] {
        let body = json!({ "publickey": keys.0.to_pem().unwrap() });
        expect_clear(api.register(&signed(name, &keys.1, body), NOW));
    }
    api
}

fn creator_grants() -> Value {
    json!({
        "all": { "encryptedDerivedKey": "wrapped-master" },
        "sender": { "encryptedDerivedKey": "wrapped-sender" },
    })
}

fn create_convo(api: &Api<MemoryStorage>, title: &str) -> String {
    let body = json!({
        "title": title,
        "aesSize": 256,
        "grants": creator_grants(),
    });
    let response = expect_sealed(
        api.create_conversation(&signed("alice", &alice().1, body), NOW),
        &alice().1,
    );
    response["convoId"].as_str().unwrap().to_owned()
}

#[test]
fn register_rejects_duplicates_and_bad_usernames() {
    let api = Api::new(MemoryStorage::new());
    let (public, private) = alice();
    let body = json!({ "publickey": public.to_pem().unwrap() });

    expect_clear(api.register(&signed("alice", private, body.clone()), NOW));
    expect_state(api.register(&signed("alice", private, body.clone()), NOW), 2);
    expect_state(api.register(&signed("no spaces allowed", private, body.clone()), NOW), 5);
    expect_state(api.register(&signed("", private, body), NOW), 5);
}

#[test]
fn register_verifies_signature_and_freshness() {
    let api = Api::new(MemoryStorage::new());
    let (public, private) = alice();
    let body = json!({ "publickey": public.to_pem().unwrap() });

    // Signed with a key that does not match the registered-to-be key.
    let mismatched = signed("mallory", &bob().1, body.clone());
    expect_state(api.register(&mismatched, NOW), 3);

    // Tampered payload.
    let mut tampered = signed("alice", private, body.clone());
    tampered.globalmessage = tampered.globalmessage.replace("alice", "malice");
    expect_state(api.register(&tampered, NOW), 3);

    // Stale envelope.
    expect_state(api.register(&signed("alice", private, body), NOW + 121), 4);

    // Garbage envelope.
    let garbage = SignedRequest { globalmessage: "not json".to_owned(), signature: "x".to_owned() };
    expect_state(api.register(&garbage, NOW), 1);
}

#[test]
fn authenticated_ops_reject_unknown_users() {
    let api = Api::new(MemoryStorage::new());
    let body = json!({ "title": "t", "aesSize": 256, "grants": creator_grants() });
    expect_state(api.create_conversation(&signed("ghost", &alice().1, body), NOW), 6);
}

#[test]
fn login_echoes_the_authenticated_username() {
    let api = api_with_users();

    let body = expect_sealed(api.login(&signed("alice", &alice().1, json!({})), NOW), &alice().1);
    assert_eq!(body["username"], "alice");

    // Signing as alice with bob's key is a signature failure, not an echo.
    expect_state(api.login(&signed("alice", &bob().1, json!({})), NOW), 3);
}

#[test]
fn authenticated_successes_are_sealed_to_the_caller() {
    let api = api_with_users();

    // Registration has no key on file to seal to; everything after it
    // comes back as an encrypted envelope only the caller can open.
    let registered = api.register(
        &signed("carol", &alice().1, json!({ "publickey": alice().0.to_pem().unwrap() })),
        NOW,
    );
    assert!(matches!(registered, ApiResponse::Clear(_)), "got {registered:?}");

    for response in [
        api.login(&signed("alice", &alice().1, json!({})), NOW),
        api.list_conversations(&signed("alice", &alice().1, json!({})), NOW),
        api.get_user(&signed("alice", &alice().1, json!({ "user": "bob" })), NOW),
    ] {
        let ApiResponse::Sealed(encrypted) = response else {
            panic!("expected sealed response, got {response:?}");
        };
        // Only alice's key opens it.
        assert!(decrypt_response(&encrypted, &bob().1).is_err());
        let body = decrypt_response(&encrypted, &alice().1).unwrap();
        assert_eq!(body["state"], 0);
    }
}

#[test]
fn conversation_titles_are_unique_per_user_unless_forced() {
    let api = api_with_users();
    create_convo(&api, "Summer Trip");

    let dup = json!({ "title": "SUMMER trip", "aesSize": 256, "grants": creator_grants() });
    expect_state(api.create_conversation(&signed("alice", &alice().1, dup.clone()), NOW), 2);

    let mut forced = dup.clone();
    forced["force"] = json!(true);
    expect_sealed(api.create_conversation(&signed("alice", &alice().1, forced), NOW), &alice().1);

    // Bob does not participate in alice's conversation, so the same title
    // is free for him without force.
    expect_sealed(api.create_conversation(&signed("bob", &bob().1, dup), NOW), &bob().1);
}

#[test]
fn conversation_validation() {
    let api = api_with_users();

    let bad_size = json!({ "title": "t", "aesSize": 512, "grants": creator_grants() });
    expect_state(api.create_conversation(&signed("alice", &alice().1, bad_size), NOW), 5);

    let no_all = json!({
        "title": "t",
        "aesSize": 256,
        "grants": { "sender": { "encryptedDerivedKey": "w" } },
    });
    expect_state(api.create_conversation(&signed("alice", &alice().1, no_all), NOW), 5);

    let bad_scope = json!({
        "title": "t",
        "aesSize": 256,
        "grants": {
            "all": { "encryptedDerivedKey": "w" },
            "message-1.01.01.01.07": { "encryptedDerivedKey": "w" },
        },
    });
    expect_state(api.create_conversation(&signed("alice", &alice().1, bad_scope), NOW), 5);
}

#[test]
fn membership_is_admin_gated_and_idempotent() {
    let api = api_with_users();
    let convo_id = create_convo(&api, "Membership");

    let add = |caller: &str, key: &PrivateKey, member: &str| {
        let body = json!({
            "convoId": convo_id,
            "member": member,
            "grants": { "sender": { "encryptedDerivedKey": "wrapped-for-member" } },
        });
        api.add_member(&signed(caller, key, body), NOW)
    };

    // Bob is not even a participant yet.
    expect_state(add("bob", &bob().1, "bob"), 7);
    expect_sealed(add("alice", &alice().1, "bob"), &alice().1);
    expect_state(add("alice", &alice().1, "bob"), 2);
    // Bob is a participant but not an admin.
    expect_state(add("bob", &bob().1, "alice"), 7);
    // Unregistered member names are rejected before any mutation.
    expect_state(add("alice", &alice().1, "carol"), 6);

    let listed = expect_sealed(
        api.list_conversations(&signed("bob", &bob().1, json!({})), NOW),
        &bob().1,
    );
    assert_eq!(listed["conversations"].as_array().unwrap().len(), 1);
}

fn text_message(n: u64) -> Value {
    json!({
        "sender": { "ciphertext": format!("c{n}"), "iv": "aXZpdml2aXZpdg==" },
        "date": NOW - 1000,
        "type": "text",
        "content": { "ciphertext": format!("b{n}"), "iv": "aXZpdml2aXZpdg==" },
    })
}

#[test]
fn upload_assigns_sequences_and_replays_batches() {
    let api = api_with_users();
    let convo_id = create_convo(&api, "Uploads");

    let batch = json!({
        "convoId": convo_id,
        "batchId": "batch-1",
        "messages": [text_message(1), text_message(2)],
    });
    let first = expect_sealed(
        api.upload_messages(&signed("alice", &alice().1, batch.clone()), NOW),
        &alice().1,
    );
    assert_eq!(first["firstSequence"], 1);
    assert_eq!(first["count"], 2);
    assert_eq!(first["replayed"], false);

    // Retrying the same batch id reuses the range.
    let replay =
        expect_sealed(api.upload_messages(&signed("alice", &alice().1, batch), NOW), &alice().1);
    assert_eq!(replay["firstSequence"], 1);
    assert_eq!(replay["replayed"], true);

    let next = json!({
        "convoId": convo_id,
        "batchId": "batch-2",
        "messages": [text_message(3)],
    });
    let second =
        expect_sealed(api.upload_messages(&signed("alice", &alice().1, next), NOW), &alice().1);
    assert_eq!(second["firstSequence"], 3);

    // Non-admins cannot upload.
    let body = json!({
        "convoId": convo_id,
        "batchId": "batch-3",
        "messages": [text_message(4)],
    });
    expect_state(api.upload_messages(&signed("bob", &bob().1, body), NOW), 7);
}

#[test]
fn system_messages_and_search_tokens_roundtrip() {
    let api = api_with_users();
    let convo_id = create_convo(&api, "System");

    // No sender at all marks a system message; search tokens are stored
    // verbatim.
    let body = json!({
        "convoId": convo_id,
        "batchId": "batch-1",
        "messages": [{
            "date": NOW - 1000,
            "type": "text",
            "content": { "ciphertext": "b", "iv": "aXZpdml2aXZpdg==" },
            "searchableHash": ["aGFzaA=="],
        }],
    });
    expect_sealed(api.upload_messages(&signed("alice", &alice().1, body), NOW), &alice().1);

    let read = json!({ "convoId": convo_id });
    let page = expect_sealed(api.get_messages(&signed("alice", &alice().1, read), NOW), &alice().1);
    let message = &page["messages"][0];
    assert_eq!(message["sender"], Value::Null);
    assert_eq!(message["searchableHash"][0], "aGFzaA==");
}

#[test]
fn read_path_is_sealed_and_carries_grants() {
    let api = api_with_users();
    let convo_id = create_convo(&api, "Reads");

    let batch = json!({
        "convoId": convo_id,
        "batchId": "batch-1",
        "messages": [text_message(1), text_message(2), text_message(3)],
    });
    expect_sealed(api.upload_messages(&signed("alice", &alice().1, batch), NOW), &alice().1);

    let read = json!({ "convoId": convo_id, "from": 2, "limit": 10 });
    let body = expect_sealed(
        api.get_messages(&signed("alice", &alice().1, read), NOW),
        &alice().1,
    );
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["sequence"], 2);
    // Sequence 2 derives from index 1: first vault, first block, message 1.
    assert_eq!(messages[0]["hierarchy"]["vault"], 0);
    assert_eq!(messages[0]["hierarchy"]["message"], 1);
    assert_eq!(body["keySize"], 256);
    assert_eq!(body["total"], 3);
    assert_eq!(body["grants"]["all"]["encryptedDerivedKey"], "wrapped-master");
}

#[test]
fn readers_without_all_get_only_the_sender_entry() {
    let api = api_with_users();
    let convo_id = create_convo(&api, "Partial");

    let add = json!({
        "convoId": convo_id,
        "member": "bob",
        "grants": {
            "sender": { "encryptedDerivedKey": "bob-sender" },
            "message-000000.00.00.00.00": { "encryptedDerivedKey": "bob-msg" },
        },
    });
    expect_sealed(api.add_member(&signed("alice", &alice().1, add), NOW), &alice().1);

    let read = json!({ "convoId": convo_id });
    let body = expect_sealed(api.get_messages(&signed("bob", &bob().1, read), NOW), &bob().1);
    let grants = body["grants"].as_object().unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants["sender"]["encryptedDerivedKey"], "bob-sender");
}

#[test]
fn media_flow() {
    let api = api_with_users();
    let convo_id = create_convo(&api, "Media");

    let upload = json!({
        "convoId": convo_id,
        "ciphertext": "b3BhcXVlIGJ5dGVz",
        "iv": "aXZpdml2aXZpdg==",
        "mimeType": "image/png",
    });
    let stored =
        expect_sealed(api.upload_media(&signed("alice", &alice().1, upload), NOW), &alice().1);
    let media_id = stored["mediaId"].as_str().unwrap().to_owned();

    let query = json!({ "convoId": convo_id, "mediaId": media_id });
    let ready = expect_sealed(
        api.media_ready(&signed("alice", &alice().1, query.clone()), NOW),
        &alice().1,
    );
    assert_eq!(ready["ready"], true);

    let fetched = expect_sealed(
        api.get_media(&signed("alice", &alice().1, query.clone()), NOW),
        &alice().1,
    );
    assert_eq!(fetched["ciphertext"], "b3BhcXVlIGJ5dGVz");
    assert_eq!(fetched["mimeType"], "image/png");

    // Non-participants see nothing.
    expect_state(api.get_media(&signed("bob", &bob().1, query), NOW), 7);

    // A message referencing an unknown media object is rejected.
    let body = json!({
        "convoId": convo_id,
        "batchId": "batch-1",
        "messages": [{
            "sender": { "ciphertext": "c", "iv": "aXZpdml2aXZpdg==" },
            "date": NOW,
            "type": "media",
            "media": {
                "mediaId": uuid::Uuid::new_v4(),
                "encryptedMediaKey": { "ciphertext": "k", "iv": "aXZpdml2aXZpdg==" },
            },
        }],
    });
    expect_state(api.upload_messages(&signed("alice", &alice().1, body), NOW), 8);

    // Referencing the stored object works.
    let body = json!({
        "convoId": convo_id,
        "batchId": "batch-1",
        "messages": [{
            "sender": { "ciphertext": "c", "iv": "aXZpdml2aXZpdg==" },
            "date": NOW,
            "type": "media",
            "media": {
                "mediaId": media_id,
                "encryptedMediaKey": { "ciphertext": "k", "iv": "aXZpdml2aXZpdg==" },
            },
        }],
    });
    expect_sealed(api.upload_messages(&signed("alice", &alice().1, body), NOW), &alice().1);
}
