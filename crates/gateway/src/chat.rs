//! Line-based chat room, the demo application run by `gateway worker`.
//!
//! The first line a client sends is its numeric uid. After that:
//!
//! | line           | effect                              |
//! |----------------|-------------------------------------|
//! | `text`         | broadcast to everyone               |
//! | `@<uid> text`  | private message to one user         |
//! | `/who`         | users logged in through this worker |
//! | `/quit`        | leave                               |

use bytes::Bytes;
use gateway_protocol::Uid;
use gateway_server::{BusinessHandler, Result, WorkerContext};
use std::collections::BTreeSet;
use tracing::debug;

/// One parsed chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand<'a> {
    Say(&'a str),
    Whisper { to: Uid, text: &'a str },
    Who,
    Quit,
    Empty,
}

/// Parses a line sent by a logged-in client.
pub fn parse_line(line: &str) -> ChatCommand<'_> {
    let line = line.trim();
    if line.is_empty() {
        return ChatCommand::Empty;
    }
    match line {
        "/who" => return ChatCommand::Who,
        "/quit" => return ChatCommand::Quit,
        _ => {}
    }
    if let Some(rest) = line.strip_prefix('@') {
        let (target, text) = rest.split_once(' ').unwrap_or((rest, ""));
        if let Ok(uid) = target.parse::<u32>() {
            return ChatCommand::Whisper {
                to: Uid::new(uid),
                text: text.trim(),
            };
        }
    }
    ChatCommand::Say(line)
}

/// Parses the login line. Uid 0 is not a valid login.
pub fn parse_login(line: &str) -> Option<Uid> {
    line.trim()
        .parse::<u32>()
        .ok()
        .filter(|uid| *uid != 0)
        .map(Uid::new)
}

/// Chat room state of one worker.
#[derive(Debug, Default)]
pub struct ChatHandler {
    online: BTreeSet<Uid>,
}

impl ChatHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn online(&self) -> usize {
        self.online.len()
    }
}

impl BusinessHandler for ChatHandler {
    fn on_connection(&mut self, ctx: &mut WorkerContext<'_>, body: &[u8]) -> Result<()> {
        let line = String::from_utf8_lossy(body);
        let Some(uid) = parse_login(&line) else {
            return ctx.kick(Some(Bytes::from_static(b"* login with your numeric uid\n")));
        };
        ctx.connect_success(uid)?;
        self.online.insert(uid);
        debug!(%uid, socket = %ctx.socket_id(), "User logged in");
        ctx.reply(format!("* welcome {uid}\n"))?;
        ctx.broadcast(format!("* {uid} joined\n"))?;
        Ok(())
    }

    fn on_message(&mut self, ctx: &mut WorkerContext<'_>, body: &[u8]) -> Result<()> {
        let line = String::from_utf8_lossy(body);
        let uid = ctx.uid();
        match parse_line(&line) {
            ChatCommand::Say(text) => {
                ctx.broadcast(format!("{uid}: {text}\n"))?;
            }
            ChatCommand::Whisper { to, text } => {
                if !ctx.send_to_uid(to, format!("{uid} whispers: {text}\n"))? {
                    ctx.reply(format!("* {to} is not online\n"))?;
                }
            }
            ChatCommand::Who => {
                let users: Vec<String> = self.online.iter().map(Uid::to_string).collect();
                ctx.reply(format!("* online: {}\n", users.join(" ")))?;
            }
            ChatCommand::Quit => {
                self.online.remove(&uid);
                ctx.kick(Some(Bytes::from_static(b"* bye\n")))?;
                ctx.broadcast(format!("* {uid} left\n"))?;
            }
            ChatCommand::Empty => {}
        }
        Ok(())
    }

    fn on_close(&mut self, ctx: &mut WorkerContext<'_>) -> Result<()> {
        let uid = ctx.uid();
        self.online.remove(&uid);
        ctx.broadcast(format!("* {uid} left\n"))?;
        Ok(())
    }
}
