mod support;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;

use support::{spawn_server, spawn_server_with, TestServer};
use web_api::SessionSettings;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn send(socket: &mut Socket, frame: Value) {
    socket
        .send(TungsteniteMessage::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}

/// 下一帧 JSON；连接关闭时返回 None
async fn next_frame(socket: &mut Socket) -> Option<Value> {
    loop {
        let message = timeout(Duration::from_secs(3), socket.next())
            .await
            .expect("frame within timeout")?;
        match message.ok()? {
            TungsteniteMessage::Text(text) => {
                return Some(serde_json::from_str(text.as_str()).expect("json frame"))
            }
            TungsteniteMessage::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn connect_authenticated(server: &TestServer, user: Uuid) -> Socket {
    let (mut socket, _) = connect_async(server.ws_url()).await.expect("connect");
    send(&mut socket, json!({ "type": "authenticate", "token": server.token_for(user) })).await;
    let frame = next_frame(&mut socket).await.expect("auth reply");
    assert_eq!(frame["type"], "authenticated");
    assert_eq!(frame["user_id"], user.to_string());
    socket
}

#[tokio::test]
async fn subscribed_session_receives_new_messages() {
    let server = spawn_server().await;
    let client = Client::new();
    let (owner, sitter) = (Uuid::new_v4(), Uuid::new_v4());

    let mut sitter_socket = connect_authenticated(&server, sitter).await;

    let conversation: Value = client
        .post(server.http("/api/v1/conversations"))
        .bearer_auth(server.token_for(owner))
        .json(&json!({ "other_user_id": sitter }))
        .send()
        .await
        .expect("start")
        .json()
        .await
        .expect("json");
    let conversation_id = conversation["id"].as_str().expect("id").to_string();

    // 新会话通过 user.<id> 主题通知对方
    let started = next_frame(&mut sitter_socket).await.expect("started");
    assert_eq!(started["type"], "event");
    assert_eq!(started["topic"], format!("user.{sitter}"));
    assert_eq!(started["event"]["kind"], "conversation_started");

    let topic = format!("conversation.{conversation_id}");
    send(&mut sitter_socket, json!({ "type": "subscribe", "topic": topic })).await;
    let subscribed = next_frame(&mut sitter_socket).await.expect("subscribed");
    assert_eq!(subscribed["type"], "subscribed");

    client
        .post(server.http(&format!("/api/v1/conversations/{conversation_id}/messages")))
        .bearer_auth(server.token_for(owner))
        .json(&json!({ "body": "Is Rex ok?", "client_nonce": "n1" }))
        .send()
        .await
        .expect("send");

    let event = next_frame(&mut sitter_socket).await.expect("event");
    assert_eq!(event["topic"], topic);
    assert_eq!(event["event"]["kind"], "message_created");
    assert_eq!(event["event"]["message"]["seq"], 1);
    assert_eq!(event["event"]["message"]["body"], "Is Rex ok?");

    send(
        &mut sitter_socket,
        json!({ "type": "ack", "conversation_id": conversation_id, "seq": 1 }),
    )
    .await;
    // 确认后服务端推送送达回执
    let delivered = next_frame(&mut sitter_socket).await.expect("delivered");
    assert_eq!(delivered["event"]["kind"], "messages_delivered");
    assert_eq!(delivered["event"]["up_to_seq"], 1);

    send(&mut sitter_socket, json!({ "type": "ping" })).await;
    assert_eq!(next_frame(&mut sitter_socket).await.expect("pong")["type"], "pong");
}

#[tokio::test]
async fn outsider_cannot_subscribe_to_conversation() {
    let server = spawn_server().await;
    let outsider = Uuid::new_v4();
    let conversation = server
        .state
        .chat_service
        .start_conversation(Uuid::new_v4().into(), Uuid::new_v4().into())
        .await
        .expect("start")
        .conversation;

    let mut socket = connect_authenticated(&server, outsider).await;
    send(
        &mut socket,
        json!({ "type": "subscribe", "topic": format!("conversation.{}", conversation.id) }),
    )
    .await;
    let frame = next_frame(&mut socket).await.expect("error");
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], "NOT_PARTICIPANT");

    send(
        &mut socket,
        json!({ "type": "subscribe", "topic": format!("user.{}", Uuid::new_v4()) }),
    )
    .await;
    assert_eq!(next_frame(&mut socket).await.expect("error")["code"], "FORBIDDEN");
}

#[tokio::test]
async fn first_frame_must_authenticate() {
    let server = spawn_server().await;

    let (mut socket, _) = connect_async(server.ws_url()).await.expect("connect");
    send(&mut socket, json!({ "type": "ping" })).await;
    let frame = next_frame(&mut socket).await.expect("rejection");
    assert_eq!(frame["type"], "auth_rejected");
    assert!(next_frame(&mut socket).await.is_none());

    let (mut socket, _) = connect_async(server.ws_url()).await.expect("connect");
    send(&mut socket, json!({ "type": "authenticate", "token": "garbage" })).await;
    assert_eq!(next_frame(&mut socket).await.expect("rejection")["type"], "auth_rejected");
}

#[tokio::test]
async fn silent_client_is_rejected_after_auth_timeout() {
    let server = spawn_server_with(
        SessionSettings {
            auth_timeout: Duration::from_millis(200),
            ..SessionSettings::default()
        },
        0,
    )
    .await;

    let (mut socket, _) = connect_async(server.ws_url()).await.expect("connect");
    let frame = next_frame(&mut socket).await.expect("rejection");
    assert_eq!(frame["type"], "auth_rejected");
    assert!(next_frame(&mut socket).await.is_none());
}

#[tokio::test]
async fn expiring_token_ends_session_with_auth_expired() {
    let server = spawn_server().await;
    let user = Uuid::new_v4();
    let exp = chrono::Utc::now().timestamp() + 2;
    let token = server
        .jwt
        .generate_token_expiring_at(user, exp)
        .expect("token");

    let (mut socket, _) = connect_async(server.ws_url()).await.expect("connect");
    send(&mut socket, json!({ "type": "authenticate", "token": token })).await;
    assert_eq!(next_frame(&mut socket).await.expect("auth")["type"], "authenticated");

    let frame = loop {
        let frame = timeout(Duration::from_secs(5), next_frame(&mut socket))
            .await
            .expect("expiry within timeout")
            .expect("frame");
        if frame["type"] != "pong" {
            break frame;
        }
    };
    assert_eq!(frame["type"], "auth_expired");
}
