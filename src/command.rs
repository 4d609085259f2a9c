//! Single-line text commands accepted by the orchestrator.

use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Restart,
    StartBeat,
    StopBeat,
    RefreshConfig,
    BiasSdk(String),
    UnbiasSdk,
    DestroySdk(String),
}

/// A line that is not a known command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown command '{0}'")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    /// Verbs are case-insensitive; an SDK name is everything after the verb.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, arg) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        let named = |make: fn(String) -> Command| {
            if arg.is_empty() {
                Err(UnknownCommand(line.to_owned()))
            } else {
                Ok(make(arg.to_owned()))
            }
        };
        match verb.to_ascii_lowercase().as_str() {
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "restart" => Ok(Command::Restart),
            "start-beat" => Ok(Command::StartBeat),
            "stop-beat" => Ok(Command::StopBeat),
            "refresh-config" => Ok(Command::RefreshConfig),
            "bias-sdk" => named(Command::BiasSdk),
            "unbias-sdk" => Ok(Command::UnbiasSdk),
            "destroy-sdk" => named(Command::DestroySdk),
            _ => Err(UnknownCommand(line.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_verb() {
        assert_eq!("start".parse(), Ok(Command::Start));
        assert_eq!(" STOP ".parse(), Ok(Command::Stop));
        assert_eq!("restart".parse(), Ok(Command::Restart));
        assert_eq!("start-beat".parse(), Ok(Command::StartBeat));
        assert_eq!("stop-beat".parse(), Ok(Command::StopBeat));
        assert_eq!("refresh-config".parse(), Ok(Command::RefreshConfig));
        assert_eq!("unbias-sdk".parse(), Ok(Command::UnbiasSdk));
    }

    #[test]
    fn sdk_names_keep_inner_spaces() {
        assert_eq!(
            "bias-sdk  Polar H10 ".parse(),
            Ok(Command::BiasSdk("Polar H10".into()))
        );
        assert_eq!(
            "destroy-sdk Watch".parse(),
            Ok(Command::DestroySdk("Watch".into()))
        );
    }

    #[test]
    fn rejects_unknown_and_incomplete() {
        let err = "dance".parse::<Command>().unwrap_err();
        assert_eq!(err.to_string(), "unknown command 'dance'");
        assert!("bias-sdk".parse::<Command>().is_err());
        assert!("".parse::<Command>().is_err());
    }
}
