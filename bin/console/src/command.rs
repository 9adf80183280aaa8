//! Parsing of console input lines.
//!
//! Every line is `<group> <member> <message>`. A message starting with `/`
//! is a command; anything else is chat text.

use chorus_conversation::{GroupMode, PresetSelection, UserMode};
use chorus_core::{GroupId, MemberId};
use std::fmt;

/// Help text printed by `/help`.
pub const HELP: &str = "\
usage: <group> <member> <message>
commands:
  /tool <text>                  send with tools enabled
  /new [preset]                 start over, optionally with a named preset
  /retry                        answer the last message again
  /stop                         interrupt the running reply
  /remove                       forget the conversation
  /preset                       show the preset
  /preset <name>                use a named preset
  /preset custom <prompt>       use a custom system prompt
  /preset clear                 remove the preset
  /provider <name>              switch provider
  /model <name>                 switch model
  /usage | /total | /round      show token usage or message count
  /mode group default|shared    set how the group shares conversations
  /mode user global|independent set how the member's conversations follow them";

/// What a console line asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Chat text.
    Say { text: String, use_tools: bool },
    /// Start a new conversation.
    New { preset: Option<PresetSelection> },
    /// Re-run the last message.
    Retry,
    /// Interrupt the running turn.
    Stop,
    /// Delete the conversation.
    Remove,
    /// Show the preset.
    ShowPreset,
    /// Change the preset.
    SetPreset(PresetSelection),
    /// Remove the preset.
    ClearPreset,
    /// Switch provider.
    Provider(String),
    /// Switch model.
    Model(String),
    /// Show this conversation's usage.
    Usage,
    /// Show usage across conversations.
    TotalUsage,
    /// Show the number of user messages.
    Round,
    /// Change the group's mode.
    GroupMode(GroupMode),
    /// Change the member's mode.
    UserMode(UserMode),
    /// Show help.
    Help,
}

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Group the line was posted in.
    pub group: GroupId,
    /// Member who posted it.
    pub member: MemberId,
    /// What they asked for.
    pub command: Command,
}

/// Errors from parsing a console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The line has no group, member or message.
    Incomplete,
    /// The command is not known.
    UnknownCommand { name: String },
    /// The command needs an argument.
    MissingArgument { command: &'static str },
    /// The mode is not valid.
    InvalidMode { value: String },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incomplete => write!(f, "expected <group> <member> <message>"),
            Self::UnknownCommand { name } => write!(f, "unknown command: /{name}"),
            Self::MissingArgument { command } => write!(f, "/{command} needs an argument"),
            Self::InvalidMode { value } => write!(f, "invalid mode: {value}"),
        }
    }
}

impl std::error::Error for ParseError {}

fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (text, ""),
    }
}

/// Parses one console line.
///
/// # Errors
///
/// Returns a [`ParseError`] describing what is wrong with the line.
pub fn parse_line(line: &str) -> Result<Line, ParseError> {
    let (group, rest) = split_word(line);
    let (member, message) = split_word(rest);
    if group.is_empty() || member.is_empty() || message.is_empty() {
        return Err(ParseError::Incomplete);
    }
    Ok(Line {
        group: GroupId::from(group),
        member: MemberId::from(member),
        command: parse_command(message)?,
    })
}

fn parse_command(message: &str) -> Result<Command, ParseError> {
    let Some(body) = message.strip_prefix('/') else {
        return Ok(Command::Say {
            text: message.to_string(),
            use_tools: false,
        });
    };
    let (name, arg) = split_word(body);
    let required = |command: &'static str| {
        if arg.is_empty() {
            Err(ParseError::MissingArgument { command })
        } else {
            Ok(arg.to_string())
        }
    };

    let command = match name {
        "tool" => Command::Say {
            text: required("tool")?,
            use_tools: true,
        },
        "new" if arg.is_empty() => Command::New { preset: None },
        "new" => Command::New {
            preset: Some(PresetSelection::Named(arg.to_string())),
        },
        "retry" => Command::Retry,
        "stop" => Command::Stop,
        "remove" => Command::Remove,
        "preset" => parse_preset(arg)?,
        "provider" => Command::Provider(required("provider")?),
        "model" => Command::Model(required("model")?),
        "usage" => Command::Usage,
        "total" => Command::TotalUsage,
        "round" => Command::Round,
        "mode" => parse_mode(arg)?,
        "help" => Command::Help,
        other => {
            return Err(ParseError::UnknownCommand {
                name: other.to_string(),
            });
        }
    };
    Ok(command)
}

fn parse_preset(arg: &str) -> Result<Command, ParseError> {
    let (first, rest) = split_word(arg);
    Ok(match first {
        "" => Command::ShowPreset,
        "clear" => Command::ClearPreset,
        "custom" if rest.is_empty() => {
            return Err(ParseError::MissingArgument { command: "preset" });
        }
        "custom" => Command::SetPreset(PresetSelection::Custom(rest.to_string())),
        name => Command::SetPreset(PresetSelection::Named(name.to_string())),
    })
}

fn parse_mode(arg: &str) -> Result<Command, ParseError> {
    let (scope, value) = split_word(arg);
    let invalid = || ParseError::InvalidMode {
        value: arg.to_string(),
    };
    match (scope, value) {
        ("group", "default") => Ok(Command::GroupMode(GroupMode::Default)),
        ("group", "shared") => Ok(Command::GroupMode(GroupMode::Shared)),
        ("user", "global") => Ok(Command::UserMode(UserMode::Global)),
        ("user", "independent") => Ok(Command::UserMode(UserMode::Independent)),
        ("", _) => Err(ParseError::MissingArgument { command: "mode" }),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(line: &str) -> Command {
        parse_line(line).expect("parse").command
    }

    #[test]
    fn plain_text_is_said() {
        let line = parse_line("g1 u1   hello   world ").expect("parse");
        assert_eq!(line.group, GroupId::from("g1"));
        assert_eq!(line.member, MemberId::from("u1"));
        assert_eq!(
            line.command,
            Command::Say {
                text: "hello   world".to_string(),
                use_tools: false
            }
        );
    }

    #[test]
    fn incomplete_lines() {
        assert_eq!(parse_line(""), Err(ParseError::Incomplete));
        assert_eq!(parse_line("g1"), Err(ParseError::Incomplete));
        assert_eq!(parse_line("g1 u1"), Err(ParseError::Incomplete));
    }

    #[test]
    fn tool_and_new() {
        assert_eq!(
            command("g u /tool what time is it"),
            Command::Say {
                text: "what time is it".to_string(),
                use_tools: true
            }
        );
        assert_eq!(command("g u /new"), Command::New { preset: None });
        assert_eq!(
            command("g u /new cat"),
            Command::New {
                preset: Some(PresetSelection::Named("cat".to_string()))
            }
        );
        assert_eq!(
            parse_line("g u /tool"),
            Err(ParseError::MissingArgument { command: "tool" })
        );
    }

    #[test]
    fn preset_forms() {
        assert_eq!(command("g u /preset"), Command::ShowPreset);
        assert_eq!(command("g u /preset clear"), Command::ClearPreset);
        assert_eq!(
            command("g u /preset custom Be very brief."),
            Command::SetPreset(PresetSelection::Custom("Be very brief.".to_string()))
        );
        assert_eq!(
            command("g u /preset cat"),
            Command::SetPreset(PresetSelection::Named("cat".to_string()))
        );
    }

    #[test]
    fn modes() {
        assert_eq!(
            command("g u /mode group shared"),
            Command::GroupMode(GroupMode::Shared)
        );
        assert_eq!(
            command("g u /mode user independent"),
            Command::UserMode(UserMode::Independent)
        );
        assert!(matches!(
            parse_line("g u /mode group weird"),
            Err(ParseError::InvalidMode { .. })
        ));
    }

    #[test]
    fn unknown_command() {
        assert_eq!(
            parse_line("g u /dance"),
            Err(ParseError::UnknownCommand {
                name: "dance".to_string()
            })
        );
    }
}
