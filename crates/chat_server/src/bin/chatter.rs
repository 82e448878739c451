use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const START_PROMPTS: [&str; 6] = [
    "Hello!",
    "Please give me a number between 1 and 50.",
    "Please tell me a short story.",
    "Please tell me a long story.",
    "What is the capital of Portugal?",
    "What is the current weather like in France?",
];

const CONTINUE_PROMPTS: [&str; 4] = [
    "Please continue.",
    "Tell me more.",
    "Can you give me more details?",
    "I don't understand.",
];

/// Drives an arbitrary number of simulated WebSocket chat conversations against a
/// running chat server, for load testing.
#[derive(argh::FromArgs, PartialEq, Debug, Clone)]
pub struct Chat {
    /// the total amount of conversation turns sent, spread across conversation chains.
    #[argh(positional, default = "10")]
    pub requests: usize,

    /// the base chance that a conversation will continue for another turn.
    #[argh(option, short = 'b', default = "0.6")]
    pub continue_chance: f32,

    /// how much the chance to continue a conversation decreases with each successive turn.
    #[argh(option, short = 'd', default = "0.05")]
    pub chance_decay: f32,

    /// the minimum amount of time to wait before a turn is sent.
    #[argh(option, short = 'i', default = "3.0")]
    pub min_idle: f32,

    /// the maximum amount of time to wait before a turn is sent.
    #[argh(option, short = 'a', default = "10.0")]
    pub max_idle: f32,

    /// the maximum number of stream_text_delta frames read before a turn is considered done.
    #[argh(option, short = 'l', default = "1000")]
    pub message_limit: usize,

    /// the maidId to converse with.
    #[argh(option, short = 'm', default = "String::from(\"chat\")")]
    pub maid_id: String,

    /// a bearer token the connection-key exchange accepts.
    #[argh(option, short = 't', default = "String::from(\"chatter\")")]
    pub token: String,

    /// the base HTTP URL of the server the conversations will be sent to.
    #[argh(
        option,
        short = 'u',
        default = "String::from(\"http://127.0.0.1:3000\")"
    )]
    pub url: String,
}

#[tokio::main]
async fn main() {
    let format = tracing_subscriber::fmt::layer().compact();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or(
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
    );
    tracing_subscriber::registry()
        .with(format)
        .with(filter)
        .init();

    let chat_args: Chat = argh::from_env();

    assert!(
        chat_args.min_idle < chat_args.max_idle,
        "Minimum idle time must be higher than the maximum"
    );

    let mut rng = rand::thread_rng();

    let mut request_chains = vec![];
    let mut chain: usize = 0;
    for _ in 0..chat_args.requests {
        let chance = f32::max(
            chat_args.continue_chance - chat_args.chance_decay * chain as f32,
            0.0,
        );

        chain += 1;
        if chance < rng.gen() {
            request_chains.push(chain);
            chain = 0;
        }
    }

    if chain > 0 {
        request_chains.push(chain);
    }

    let mut join_set = JoinSet::new();
    for (id, count) in request_chains.drain(..).enumerate() {
        join_set.spawn(run_chain(chat_args.clone(), count, id));
    }

    while join_set.join_next().await.is_some() {}
}

/// Exchanges the bearer token for a connection key, then runs `count` conversation
/// turns over a single WebSocket connection.
async fn run_chain(chat_args: Chat, count: usize, index: usize) {
    let http_client = reqwest::Client::new();
    let key_url = format!("{}/ws/connection-key", chat_args.url);
    let key_response = match http_client
        .get(&key_url)
        .bearer_auth(&chat_args.token)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(err) => {
            warn!(chain = index, error = %err, "could not reach connection-key endpoint");
            return;
        }
    };

    let body: serde_json::Value = match key_response.json().await {
        Ok(body) => body,
        Err(err) => {
            warn!(chain = index, error = %err, "connection-key response was not JSON");
            return;
        }
    };
    let connection_key = match body["connectionKey"].as_str() {
        Some(key) => key.to_string(),
        None => {
            warn!(chain = index, "connection-key response missing connectionKey");
            return;
        }
    };

    let ws_url = format!(
        "{}/ws?maidId={}&connectionKey={}",
        chat_args.url.replacen("http", "ws", 1),
        chat_args.maid_id,
        connection_key,
    );

    let (ws_stream, _) = match tokio_tungstenite::connect_async(&ws_url).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(chain = index, error = %err, "could not establish websocket connection");
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();

    if send(&mut write, json!({ "type": "welcome" })).await.is_err() {
        return;
    }
    if drain_turn(&mut read, chat_args.message_limit, index)
        .await
        .is_err()
    {
        return;
    }

    for turn in 0..count {
        let wait = rand::thread_rng().gen_range(chat_args.min_idle..chat_args.max_idle);
        sleep(Duration::from_secs_f32(wait)).await;

        let prompts = if turn == 0 {
            &START_PROMPTS[..]
        } else {
            &CONTINUE_PROMPTS[..]
        };
        let prompt = prompts[rand::thread_rng().gen_range(0..prompts.len())];

        info!(chain = index, turn = turn + 1, of = count, "sending input");
        if send(&mut write, json!({ "type": "input", "content": prompt }))
            .await
            .is_err()
        {
            return;
        }
        if drain_turn(&mut read, chat_args.message_limit, index)
            .await
            .is_err()
        {
            return;
        }
    }

    send(&mut write, json!({ "type": "bye" })).await.ok();
}

async fn send(
    write: &mut (impl SinkExt<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    payload: serde_json::Value,
) -> Result<(), ()> {
    write
        .send(WsMessage::Text(payload.to_string()))
        .await
        .map_err(|err| warn!(error = %err, "failed to send websocket frame"))
}

/// Reads frames until `stream_done` (or `error`), accumulating the assistant's reply.
async fn drain_turn(
    read: &mut (impl StreamExt<
        Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
    > + Unpin),
    message_limit: usize,
    index: usize,
) -> Result<String, ()> {
    let mut text = String::new();
    let mut deltas = 0;

    while let Some(frame) = read.next().await {
        let frame = frame.map_err(|err| warn!(chain = index, error = %err, "websocket read error"))?;
        let WsMessage::Text(text_frame) = frame else {
            continue;
        };
        let parsed: serde_json::Value =
            serde_json::from_str(&text_frame).map_err(|_| warn!(chain = index, "malformed server frame"))?;

        match parsed["type"].as_str() {
            Some("stream_text_delta") => {
                deltas += 1;
                if let Some(delta) = parsed["delta"].as_str() {
                    text.push_str(delta);
                }
                if deltas >= message_limit {
                    return Ok(text);
                }
            }
            Some("stream_done") => return Ok(text),
            Some("error") => {
                warn!(chain = index, message = ?parsed["message"], "server reported an error");
                return Err(());
            }
            _ => {}
        }
    }

    Err(())
}
