use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::BusMessage;
use crate::{Error, Result};

/// Every message kind a node knows how to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    WriteToDb,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::WriteToDb => "writeToDb",
        }
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "writeToDb" => Ok(Action::WriteToDb),
            other => Err(Error::Dispatch(format!(
                "Unknown message.action received: \"{other}\""
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteParams {
    pub name: String,
    pub value: String,
}

/// A decoded message, ready to be handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    WriteToDb(WriteParams),
}

impl Command {
    pub fn action(&self) -> Action {
        match self {
            Command::WriteToDb(_) => Action::WriteToDb,
        }
    }

    pub fn into_message(self, uuid: Uuid) -> Result<BusMessage> {
        let action = self.action().as_str().to_string();
        let params = match self {
            Command::WriteToDb(params) => bincode::serialize(&params)?,
        };
        Ok(BusMessage {
            action,
            params,
            uuid,
        })
    }

    /// Decode a raw delivery body into the message envelope and its command.
    pub fn decode(body: &[u8]) -> Result<(BusMessage, Command)> {
        let message = BusMessage::decode(body).map_err(|e| {
            Error::Dispatch(format!("Invalid message received, not a bus message: {e}"))
        })?;
        let command = match message.action.parse::<Action>()? {
            Action::WriteToDb => Command::WriteToDb(
                bincode::deserialize(&message.params).map_err(|e| {
                    Error::Dispatch(format!("Invalid writeToDb params: {e}"))
                })?,
            ),
        };
        Ok((message, command))
    }
}
