use std::num::ParseIntError;

use parley_storage::{ConversationId, MessageRole};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::controller::ChatSnapshot;
use crate::settings::ChatSettings;

pub const HELP_TEXT: &str = "\
commands:
  /init                  load the model
  /new [title]           start a conversation
  /list                  list conversations
  /open <n>              open conversation n from /list
  /rename <n> <title>    rename conversation n
  /delete <n>            delete conversation n
  /clear                 clear messages of the open conversation
  /wipe                  delete every conversation
  /stop                  stop the current response
  /refresh               reload from disk
  /settings              show saved settings
  /set <key> [value]     change a setting, empty resets it
  /signin <name>         sign in
  /signout               sign out
  /quit                  exit
anything else is sent as a message";

/// One line of user input. Indices are 0-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Empty,
    Help,
    Init,
    New(String),
    List,
    Open(usize),
    Rename { index: usize, title: String },
    Delete(usize),
    Clear,
    Wipe,
    Stop,
    Refresh,
    ShowSettings,
    Set { key: String, value: String },
    SignIn(String),
    SignOut,
    Quit,
    Send(String),
}

impl CliCommand {
    /// Commands usable without a session.
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            Self::Empty
                | Self::Help
                | Self::ShowSettings
                | Self::Set { .. }
                | Self::SignIn(_)
                | Self::SignOut
                | Self::Quit
        )
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("unknown command /{command}, try /help"))]
    UnknownCommand {
        stage: &'static str,
        command: String,
    },
    #[snafu(display("/{command} needs {argument}"))]
    MissingArgument {
        stage: &'static str,
        command: &'static str,
        argument: &'static str,
    },
    #[snafu(display("'{raw}' is not a conversation number"))]
    InvalidIndex {
        stage: &'static str,
        raw: String,
        source: ParseIntError,
    },
    #[snafu(display("conversation numbers start at 1"))]
    ZeroIndex { stage: &'static str },
}

pub fn parse_command(line: &str) -> Result<CliCommand, CliError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(CliCommand::Empty);
    }
    let Some(body) = line.strip_prefix('/') else {
        return Ok(CliCommand::Send(line.to_string()));
    };

    let (name, rest) = match body.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (body, ""),
    };

    let command = match name {
        "help" | "?" => CliCommand::Help,
        "init" => CliCommand::Init,
        "new" => CliCommand::New(rest.to_string()),
        "list" | "ls" => CliCommand::List,
        "open" => CliCommand::Open(parse_index(required(rest, "open", "a number")?)?),
        "rename" => {
            let (raw_index, title) = rest.split_once(char::is_whitespace).context(
                MissingArgumentSnafu {
                    stage: "parse-rename",
                    command: "rename",
                    argument: "a number and a title",
                },
            )?;
            CliCommand::Rename {
                index: parse_index(raw_index)?,
                title: title.trim().to_string(),
            }
        }
        "delete" | "rm" => CliCommand::Delete(parse_index(required(rest, "delete", "a number")?)?),
        "clear" => CliCommand::Clear,
        "wipe" => CliCommand::Wipe,
        "stop" => CliCommand::Stop,
        "refresh" => CliCommand::Refresh,
        "settings" => CliCommand::ShowSettings,
        "set" => {
            let rest = required(rest, "set", "a setting key")?;
            let (key, value) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            CliCommand::Set {
                key: key.to_string(),
                value: value.trim().to_string(),
            }
        }
        "signin" => CliCommand::SignIn(required(rest, "signin", "a user name")?.to_string()),
        "signout" => CliCommand::SignOut,
        "quit" | "exit" | "q" => CliCommand::Quit,
        other => {
            return UnknownCommandSnafu {
                stage: "parse-command",
                command: other,
            }
            .fail();
        }
    };
    Ok(command)
}

fn required<'a>(
    rest: &'a str,
    command: &'static str,
    argument: &'static str,
) -> Result<&'a str, CliError> {
    ensure!(
        !rest.is_empty(),
        MissingArgumentSnafu {
            stage: "parse-argument",
            command,
            argument,
        }
    );
    Ok(rest)
}

fn parse_index(raw: &str) -> Result<usize, CliError> {
    let number = raw.trim().parse::<usize>().context(InvalidIndexSnafu {
        stage: "parse-index",
        raw,
    })?;
    ensure!(number > 0, ZeroIndexSnafu { stage: "parse-index" });
    Ok(number - 1)
}

pub fn format_conversation_list(snapshot: &ChatSnapshot) -> String {
    if snapshot.conversations.is_empty() {
        return "no conversations yet".to_string();
    }

    snapshot
        .conversations
        .iter()
        .enumerate()
        .map(|(index, conversation)| {
            let marker = if snapshot.current_conversation_id == Some(conversation.id) {
                '*'
            } else {
                ' '
            };
            format!("{marker} {:>2}. {}", index + 1, conversation.title)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_settings(settings: &ChatSettings) -> String {
    settings
        .entries()
        .into_iter()
        .map(|(key, value)| format!("{key:<26} {value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Turns successive snapshots into incremental terminal output.
#[derive(Debug, Default)]
pub struct TranscriptPrinter {
    conversation: Option<ConversationId>,
    status: String,
    printed_messages: usize,
    /// Bytes already printed of the message still being written.
    partial: Option<usize>,
}

impl TranscriptPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, snapshot: &ChatSnapshot) -> String {
        let mut out = String::new();

        if snapshot.model_status != self.status {
            self.status = snapshot.model_status.clone();
            self.break_line(&mut out);
            out.push_str(&format!("[{}]\n", self.status));
        }

        if snapshot.current_conversation_id != self.conversation {
            self.conversation = snapshot.current_conversation_id;
            self.break_line(&mut out);
            self.printed_messages = 0;
            if let Some(title) = snapshot
                .conversations
                .iter()
                .find(|conversation| Some(conversation.id) == self.conversation)
                .map(|conversation| conversation.title.as_str())
            {
                out.push_str(&format!("== {title} ==\n"));
            }
        }

        let messages = &snapshot.messages;
        let partial_shrank = self.partial.is_some_and(|printed| {
            messages
                .get(self.printed_messages)
                .is_none_or(|message| message.content.len() < printed)
        });
        if messages.len() < self.printed_messages || partial_shrank {
            self.break_line(&mut out);
            self.printed_messages = 0;
            out.push_str("(messages reset)\n");
        }

        for (index, message) in messages.iter().enumerate().skip(self.printed_messages) {
            let start = match self.partial {
                Some(printed) => printed,
                None => {
                    out.push_str(match message.role {
                        MessageRole::User => "you: ",
                        MessageRole::Assistant => "assistant: ",
                    });
                    0
                }
            };
            out.push_str(message.content.get(start..).unwrap_or_default());

            let finished = index + 1 < messages.len() || !snapshot.is_loading;
            if finished {
                out.push('\n');
                self.printed_messages = index + 1;
                self.partial = None;
            } else {
                self.partial = Some(message.content.len());
            }
        }

        out
    }

    fn break_line(&mut self, out: &mut String) {
        if self.partial.take().is_some() {
            out.push('\n');
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_storage::{ConversationRecord, MessageRecord};

    use super::*;

    #[test]
    fn parses_commands_and_plain_messages() {
        assert_eq!(parse_command("  hello there ").unwrap(), CliCommand::Send("hello there".into()));
        assert_eq!(parse_command("").unwrap(), CliCommand::Empty);
        assert_eq!(parse_command("/new").unwrap(), CliCommand::New(String::new()));
        assert_eq!(parse_command("/new Trip plans").unwrap(), CliCommand::New("Trip plans".into()));
        assert_eq!(parse_command("/open 2").unwrap(), CliCommand::Open(1));
        assert_eq!(
            parse_command("/rename 1   Better title").unwrap(),
            CliCommand::Rename {
                index: 0,
                title: "Better title".into(),
            }
        );
        assert_eq!(parse_command("/signin ada").unwrap(), CliCommand::SignIn("ada".into()));
        assert_eq!(parse_command("/q").unwrap(), CliCommand::Quit);
    }

    #[test]
    fn parses_settings_commands() {
        assert_eq!(parse_command("/settings").unwrap(), CliCommand::ShowSettings);
        assert_eq!(
            parse_command("/set engine.system_prompt  Answer briefly. ").unwrap(),
            CliCommand::Set {
                key: "engine.system_prompt".into(),
                value: "Answer briefly.".into(),
            }
        );
        assert_eq!(
            parse_command("/set engine.max_tokens").unwrap(),
            CliCommand::Set {
                key: "engine.max_tokens".into(),
                value: String::new(),
            }
        );
        assert!(matches!(parse_command("/set"), Err(CliError::MissingArgument { .. })));
        assert!(parse_command("/set user ada").unwrap().is_public());
    }

    #[test]
    fn settings_listing_masks_the_api_key() {
        let mut settings = ChatSettings::default();
        settings.set("engine.api_key", "sk-secret").unwrap();
        let listing = format_settings(&settings);
        assert!(listing.contains("engine.api_key"));
        assert!(listing.contains("***"));
        assert!(!listing.contains("sk-secret"));
        assert_eq!(listing.lines().count(), crate::settings::SETTING_KEYS.len());
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(matches!(parse_command("/open"), Err(CliError::MissingArgument { .. })));
        assert!(matches!(parse_command("/open x"), Err(CliError::InvalidIndex { .. })));
        assert!(matches!(parse_command("/delete 0"), Err(CliError::ZeroIndex { .. })));
        assert!(matches!(parse_command("/rename 1"), Err(CliError::MissingArgument { .. })));
        assert!(matches!(parse_command("/dance"), Err(CliError::UnknownCommand { .. })));
    }

    #[test]
    fn printer_streams_only_new_text() {
        let conversation = ConversationRecord::new("New Chat", 1);
        let mut snapshot = ChatSnapshot {
            conversations: vec![conversation.clone()],
            current_conversation_id: Some(conversation.id),
            model_status: "Model ready!".into(),
            is_model_loaded: true,
            is_loading: true,
            messages: vec![
                MessageRecord::user("hello", 2),
                MessageRecord::assistant_placeholder(2),
            ],
        };
        let mut printer = TranscriptPrinter::new();

        assert_eq!(
            printer.update(&snapshot),
            "[Model ready!]\n== New Chat ==\nyou: hello\nassistant: "
        );

        snapshot.messages[1].content = "Hi".into();
        assert_eq!(printer.update(&snapshot), "Hi");
        snapshot.messages[1].content = "Hi there!".into();
        assert_eq!(printer.update(&snapshot), " there!");

        snapshot.is_loading = false;
        assert_eq!(printer.update(&snapshot), "\n");
        assert_eq!(printer.update(&snapshot), "");
    }

    #[test]
    fn conversation_list_marks_the_open_one() {
        let first = ConversationRecord::new("first", 2);
        let second = ConversationRecord::new("second", 1);
        let snapshot = ChatSnapshot {
            conversations: vec![first.clone(), second],
            current_conversation_id: Some(first.id),
            ..ChatSnapshot::default()
        };
        assert_eq!(format_conversation_list(&snapshot), "*  1. first\n   2. second");
    }
}
