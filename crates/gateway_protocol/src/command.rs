//! Gateway Protocol command codes.

use crate::error::ProtocolError;
use std::fmt;

/// Command carried in byte 4 of every envelope header.
///
/// The first three travel Gateway → BusinessWorker and notify the worker about
/// client activity. The remaining four travel BusinessWorker → Gateway and
/// instruct the Gateway what to do with its client sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// First frame from a socket that has no uid bound yet.
    OnConnection = 1,
    /// Frame from an authenticated socket; the header carries the uid.
    OnMessage = 3,
    /// An authenticated socket went away.
    OnClose = 4,
    /// Write the body to one socket.
    SendToOne = 5,
    /// Write the body to every authenticated socket.
    SendToAll = 6,
    /// Optionally write the body, then close the socket.
    Kick = 7,
    /// Bind the header uid to the header socket-id.
    ConnectSuccess = 8,
}

impl Command {
    pub const ALL: [Command; 7] = [
        Command::OnConnection,
        Command::OnMessage,
        Command::OnClose,
        Command::SendToOne,
        Command::SendToAll,
        Command::Kick,
        Command::ConnectSuccess,
    ];

    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|command| command.code() == code)
    }

    /// Whether this command is addressed to a BusinessWorker.
    pub const fn is_worker_bound(self) -> bool {
        matches!(
            self,
            Command::OnConnection | Command::OnMessage | Command::OnClose
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            Command::OnConnection => "ON_CONNECTION",
            Command::OnMessage => "ON_MESSAGE",
            Command::OnClose => "ON_CLOSE",
            Command::SendToOne => "SEND_TO_ONE",
            Command::SendToAll => "SEND_TO_ALL",
            Command::Kick => "KICK",
            Command::ConnectSuccess => "CONNECT_SUCCESS",
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or(ProtocolError::UnknownCommand(code))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
