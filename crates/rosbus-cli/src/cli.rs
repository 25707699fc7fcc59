//! Command-line parsing for the `rosbus` binary.
//!
//! ```text
//! rosbus echo <topic> <type>
//! rosbus pub  <topic> <type> <json>
//! rosbus config url <ws-url>
//! rosbus help
//! ```

use rosbus_types::Message;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Print every message received on a topic until Ctrl-C.
    Echo { topic: String, message_type: String },
    /// Publish one message and exit.
    Pub {
        topic: String,
        message_type: String,
        message: Message,
    },
    /// Persist a new rosbridge URL to the config file.
    SetUrl(String),
    Help,
}

/// Parse the arguments that follow the binary name.
pub fn parse<I, S>(args: I) -> Result<Command, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
    let words: Vec<&str> = args.iter().map(String::as_str).collect();

    match words.as_slice() {
        [] | ["help"] | ["-h"] | ["--help"] => Ok(Command::Help),
        ["echo", topic, message_type] => Ok(Command::Echo {
            topic: topic_name(topic)?,
            message_type: message_type.to_string(),
        }),
        ["pub", topic, message_type, payload] => {
            let value: serde_json::Value = serde_json::from_str(payload)
                .map_err(|e| format!("Invalid JSON payload: {e}"))?;
            let message = Message::try_from(value).map_err(|e| e.to_string())?;
            Ok(Command::Pub {
                topic: topic_name(topic)?,
                message_type: message_type.to_string(),
                message,
            })
        }
        ["config", "url", url] => {
            if url.starts_with("ws://") || url.starts_with("wss://") {
                Ok(Command::SetUrl(url.to_string()))
            } else {
                Err(format!("'{url}' is not a ws:// or wss:// URL"))
            }
        }
        [other, ..] => Err(format!("Unknown or incomplete command '{other}'")),
    }
}

/// Topic names are absolute; a missing leading slash is added.
fn topic_name(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return Err("Topic name must not be empty".to_string());
    }
    if trimmed.starts_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("/{trimmed}"))
    }
}
