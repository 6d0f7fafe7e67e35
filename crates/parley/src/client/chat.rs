//! Interactive terminal chat.
//!
//! Reads prompts from stdin, relays them to the server and prints replies. When
//! narration is configured, replies are spoken sentence by sentence and each
//! chunk is printed as its audio starts.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use log::{debug, info, warn};
use parley_protocol::{ChatOptions, Frame, GenerateNarrationRequest, Message};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

use super::http::{ChatClient, ClientResult, FrameStream};
use super::player::CommandPlayer;
use super::store::{SessionStore, StoreError};
use crate::config::AppConfig;
use crate::narration::{
    MAX_VOICE_CHUNK, NarrationClient, NarrationQueue, QueueOptions, Revealed,
    prepare_for_speech, split_for_voice,
};

const HELP: &str = "commands: /new  /sessions  /abort  /queue  /stop  /help  /quit";

/// The stream currently being read, keyed by the local session it feeds.
struct ActiveStream {
    session: String,
    frames: FrameStream,
}

struct Narrator {
    queue: NarrationQueue,
    revealed: UnboundedReceiver<Revealed>,
    client: NarrationClient,
    api_key: String,
    actor_id: String,
    spell_out_acronyms: bool,
}

impl Narrator {
    fn new(config: &AppConfig) -> Result<Option<Self>> {
        let client_config = &config.client;
        if !client_config.narration_enabled() {
            return Ok(None);
        }
        let (Some(api_key), Some(actor_id)) = (
            client_config.narration_api_key.clone(),
            client_config.actor_id.clone(),
        ) else {
            return Ok(None);
        };

        let player = CommandPlayer::new(client_config.player_command.clone())?;
        let (queue, revealed) = NarrationQueue::new(
            Arc::new(player),
            QueueOptions {
                inter_item_delay: Duration::from_millis(client_config.inter_item_delay_ms),
                max_parallel: config.narration.max_parallel_generations,
            },
        );
        let client = NarrationClient::proxy(&client_config.server_url, &config.narration)
            .context("building narration client")?;

        Ok(Some(Self {
            queue,
            revealed,
            client,
            api_key,
            actor_id,
            spell_out_acronyms: config.narration.spell_out_acronyms,
        }))
    }

    /// Queue every chunk of a reply. Returns how many were new.
    fn narrate(&self, reply: &str, text: &str) -> usize {
        split_for_voice(text, MAX_VOICE_CHUNK)
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let script = if self.spell_out_acronyms {
                    prepare_for_speech(&chunk)
                } else {
                    chunk.clone()
                };
                let request = GenerateNarrationRequest {
                    actor_id: self.actor_id.clone(),
                    text: script,
                    speed: None,
                    format: None,
                };
                let client = self.client.clone();
                let api_key = self.api_key.clone();
                let generate = async move {
                    client
                        .synthesize(&api_key, &request)
                        .await
                        .map_err(anyhow::Error::from)
                }
                .boxed();
                self.queue
                    .enqueue(format!("{}#{}", reply, index), chunk, generate)
            })
            .filter(|queued| *queued)
            .count()
    }
}

pub struct ChatSession {
    client: ChatClient,
    store: SessionStore,
    options: ChatOptions,
    placeholder_ttl: Duration,
    narrator: Option<Narrator>,
    active: Option<ActiveStream>,
    replies: u64,
}

impl ChatSession {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let narrator = Narrator::new(config)?;
        if narrator.is_none() {
            info!("narration disabled: set client.narration_api_key and client.actor_id");
        }
        Ok(Self {
            client: ChatClient::new(&config.client.server_url),
            store: SessionStore::new(),
            options: config.client.options.clone(),
            placeholder_ttl: config.sessions.placeholder_ttl(),
            narrator,
            active: None,
            replies: 0,
        })
    }

    /// Load a server session and make it the one new prompts continue.
    pub async fn resume(&mut self, session_id: &str) -> Result<()> {
        let snapshot = self
            .client
            .session(session_id)
            .await?
            .with_context(|| format!("session {} not found", session_id))?;
        println!(
            "resuming {} ({} messages, {})",
            snapshot.id,
            snapshot.messages.len(),
            snapshot.status
        );
        self.store.adopt(snapshot);
        Ok(())
    }

    /// Run until stdin closes, `/quit`, or Ctrl-C while idle.
    pub async fn run(&mut self) -> Result<()> {
        println!("connected to {}  ({})", self.client.base_url(), HELP);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("reading stdin")? else {
                        break;
                    };
                    if !self.handle_input(line.trim()).await {
                        break;
                    }
                }
                item = next_frame(&mut self.active) => self.handle_frame(item),
                revealed = next_reveal(&mut self.narrator) => show(&revealed),
                _ = tokio::signal::ctrl_c() => {
                    if self.active.is_none() {
                        break;
                    }
                    self.abort().await;
                }
            }
        }

        if self.active.is_some() {
            self.abort().await;
        }
        Ok(())
    }

    async fn handle_input(&mut self, line: &str) -> bool {
        match line {
            "" => {}
            "/quit" | "/exit" => return false,
            "/help" => println!("{}", HELP),
            "/new" => {
                self.store.new_conversation();
                println!("(new conversation)");
            }
            "/sessions" => self.print_sessions(),
            "/abort" => self.abort().await,
            "/queue" => self.print_queue(),
            "/stop" => self.stop_narration(),
            prompt if prompt.starts_with('/') => {
                println!("unknown command {}  ({})", prompt, HELP);
            }
            prompt => self.send(prompt).await,
        }
        true
    }

    async fn send(&mut self, prompt: &str) {
        if let Some(active) = &self.active {
            debug!("prompt refused while {} is streaming", active.session);
            println!("(still answering; /abort to stop)");
            return;
        }

        let reaped = self.store.reap_orphans(self.placeholder_ttl);
        if reaped > 0 {
            debug!("dropped {} orphaned local sessions", reaped);
        }

        let submission = match self.store.submit(prompt) {
            Ok(submission) => submission,
            Err(StoreError::Busy(_)) => {
                println!("(still answering; /abort to stop)");
                return;
            }
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };

        let request = match &submission.resume {
            Some(session_id) => {
                self.client
                    .continue_chat(session_id, prompt, &self.options)
                    .await
            }
            None => self.client.start(prompt, &self.options).await,
        };

        match request {
            Ok(frames) => {
                self.active = Some(ActiveStream {
                    session: submission.local_id,
                    frames,
                })
            }
            Err(e) => {
                eprintln!("error: {}", e);
                self.store.fail(&submission.local_id, e.to_string());
            }
        }
    }

    fn handle_frame(&mut self, item: Option<ClientResult<Frame>>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let frame = match item {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                eprintln!("error: {}", e);
                self.store.fail(&active.session, e.to_string());
                self.active = None;
                return;
            }
            None => {
                self.store.finish(&active.session);
                self.active = None;
                return;
            }
        };

        match self.store.apply(&active.session, frame) {
            Ok(outcome) => {
                active.session = outcome.id;
                if outcome.done {
                    self.active = None;
                }
                if let Some(message) = outcome.message {
                    self.present(&message);
                }
            }
            Err(e) => {
                warn!("dropping frame: {}", e);
                self.active = None;
            }
        }
    }

    fn present(&mut self, message: &Message) {
        match message {
            Message::Assistant(_) => {
                let Some(text) = message.assistant_text().filter(|t| !t.trim().is_empty())
                else {
                    return;
                };
                self.replies += 1;
                match &self.narrator {
                    Some(narrator) => {
                        let reply = message
                            .reply_id()
                            .map(str::to_owned)
                            .unwrap_or_else(|| format!("reply-{}", self.replies));
                        let queued = narrator.narrate(&reply, &text);
                        debug!("queued {} narration chunks for {}", queued, reply);
                    }
                    None => println!("assistant> {}", text),
                }
            }
            Message::System(system) if system.is_init() => {
                debug!("agent session {}", message.session_id().unwrap_or("-"));
            }
            Message::Error(error) => eprintln!("error: {}", error.error),
            Message::Result(_) | Message::System(_) | Message::User(_) => {}
        }
    }

    async fn abort(&mut self) {
        let Some(active) = self.active.take() else {
            println!("(nothing to abort)");
            return;
        };
        drop(active.frames);

        let Some(session_id) = self.store.abort(&active.session) else {
            println!("(aborted)");
            return;
        };
        match self.client.abort(&session_id).await {
            Ok(true) => println!("(aborted {})", session_id),
            Ok(false) => println!("(aborted; {} had already finished)", session_id),
            Err(e) => warn!("abort request for {} failed: {}", session_id, e),
        }
    }

    fn print_sessions(&self) {
        let selected = self.store.selected().map(|s| s.id.clone());
        println!("  {:<40} {:<10} {:>8}", "ID", "STATUS", "MESSAGES");
        println!("  {}", "-".repeat(60));
        for session in self.store.list() {
            let marker = if selected.as_deref() == Some(&session.id) {
                '*'
            } else {
                ' '
            };
            println!(
                "{} {:<40} {:<10} {:>8}",
                marker,
                session.id,
                session.status,
                session.messages.len()
            );
            if let Some(error) = &session.last_error {
                println!("  {:<40} {}", "", error);
            }
        }
    }

    fn print_queue(&self) {
        let Some(narrator) = &self.narrator else {
            println!("(narration disabled)");
            return;
        };
        if narrator.queue.is_idle() {
            println!("(narration idle)");
            return;
        }
        if let Some(current) = narrator.queue.current() {
            println!("playing {}", current);
        }
        for entry in narrator.queue.snapshot() {
            println!("  {:<24} {:?}", entry.id, entry.state);
        }
    }

    /// Silence narration. Text that was still waiting is printed unspoken.
    fn stop_narration(&mut self) {
        let Some(narrator) = &self.narrator else {
            return;
        };
        for entry in narrator.queue.stop() {
            println!("assistant> {}", entry.text);
        }
    }
}

async fn next_frame(active: &mut Option<ActiveStream>) -> Option<ClientResult<Frame>> {
    use futures::StreamExt;

    match active {
        Some(active) => active.frames.next().await,
        None => future::pending().await,
    }
}

async fn next_reveal(narrator: &mut Option<Narrator>) -> Revealed {
    if let Some(narrator) = narrator {
        if let Some(revealed) = narrator.revealed.recv().await {
            return revealed;
        }
    }
    future::pending().await
}

fn show(revealed: &Revealed) {
    if revealed.narrated {
        println!("assistant> {}", revealed.text);
    } else {
        println!("assistant> {}  (not narrated)", revealed.text);
    }
}
