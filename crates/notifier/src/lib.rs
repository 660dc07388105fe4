//! Fire-and-forget Telegram delivery.
//!
//! Producers push `NotifierEvent`s onto a bounded queue with `try_send` and
//! never wait. The worker formats each event into HTML, truncates it to the
//! transport limit and delivers it with up to three attempts; after that
//! the event is dropped. Nothing here can fail the scheduler.

mod format;

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use common::NotifierEvent;

pub use format::format_event;

/// Telegram hard limit on message length.
const MAX_MESSAGE_LEN: usize = 4096;
const MAX_ATTEMPTS: u32 = 3;
const QUEUE_DEPTH: usize = 256;

/// Spawn the delivery worker. The returned sender is the producer handle;
/// the worker exits once every sender is dropped and the queue drains.
pub fn spawn(token: String, chat_id: i64) -> (mpsc::Sender<NotifierEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let worker = tokio::spawn(run(token, chat_id, rx));
    (tx, worker)
}

async fn run(token: String, chat_id: i64, mut rx: mpsc::Receiver<NotifierEvent>) {
    let bot = Bot::new(token);
    let chat = ChatId(chat_id);
    while let Some(event) = rx.recv().await {
        let text = truncate(format_event(&event));
        deliver(&bot, chat, &text).await;
    }
    debug!("notifier queue closed, worker exiting");
}

/// Up to three attempts with doubling backoff, then the message is gone.
async fn deliver(bot: &Bot, chat: ChatId, text: &str) {
    let mut delay = Duration::from_millis(500);
    for attempt in 1..=MAX_ATTEMPTS {
        match bot
            .send_message(chat, text)
            .parse_mode(ParseMode::Html)
            .await
        {
            Ok(_) => return,
            Err(e) if attempt == MAX_ATTEMPTS => {
                warn!(error = %e, attempts = MAX_ATTEMPTS, "notification dropped");
            }
            Err(e) => {
                debug!(error = %e, attempt, "notification send failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

fn truncate(mut text: String) -> String {
    if text.len() <= MAX_MESSAGE_LEN {
        return text;
    }
    let mut cut = MAX_MESSAGE_LEN - '…'.len_utf8();
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push('…');
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_pass_through() {
        assert_eq!(truncate("hello".into()), "hello");
    }

    #[test]
    fn long_messages_are_cut_at_the_limit() {
        let long = "x".repeat(MAX_MESSAGE_LEN * 2);
        let out = truncate(long);
        assert!(out.len() <= MAX_MESSAGE_LEN);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(MAX_MESSAGE_LEN);
        let out = truncate(long);
        assert!(out.len() <= MAX_MESSAGE_LEN);
        assert!(out.ends_with('…'));
    }
}
