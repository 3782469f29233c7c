//! Interactive command parsing for the `lendo` binary.

use thiserror::Error;

use lendo_core::OperationKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    Status,
    /// Set the operation's draft to the given input and submit it
    Submit { kind: OperationKind, input: String },
    Refresh,
    Help,
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command '{0}', type 'help' for the list")]
    Unknown(String),

    #[error("usage: {0} <amount>")]
    MissingAmount(OperationKind),
}

pub const HELP: &str = "\
Commands:
  connect            connect to the wallet
  disconnect         drop the wallet session
  status             show session, balances, loan and operations
  deposit <amount>   lend to the pool
  borrow <amount>    borrow against the given collateral
  repay <amount>     repay the active loan
  withdraw           withdraw collateral of a repaid loan
  refresh            re-read the ledger
  help               show this list
  quit               exit";

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let mut parts = line.split_whitespace();
        let Some(word) = parts.next() else {
            return Ok(None);
        };
        let rest = parts.collect::<Vec<_>>().join(" ");

        let command = match word.to_lowercase().as_str() {
            "connect" => Command::Connect,
            "disconnect" => Command::Disconnect,
            "status" | "s" => Command::Status,
            "refresh" => Command::Refresh,
            "help" | "?" => Command::Help,
            "quit" | "exit" | "q" => Command::Quit,
            other => match OperationKind::from_str(other) {
                Some(kind) if kind.carries_amount() && rest.is_empty() => {
                    return Err(CommandError::MissingAmount(kind));
                }
                Some(kind) => Command::Submit { kind, input: rest },
                None => return Err(CommandError::Unknown(word.to_string())),
            },
        };
        Ok(Some(command))
    }
}
