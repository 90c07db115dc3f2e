//! Line-oriented operator console
//!
//! Stands in for the UI surface: each stdin line is parsed into one
//! command the binary applies to the engine.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// Press the emergency control, release after the given duration
    Hold(Duration),
    Press,
    Release,
    /// Interim transcript for the live recognition session
    Say(String),
    /// Final transcript for the live recognition session
    Final(String),
    Ack(String),
    Delivered(String),
    Tracking(bool),
    Listening(bool),
    Locate,
    Alerts,
    Zones,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  press | release | hold <ms>   emergency control
  say <text> | final <text>     transcript for the voice session
  ack <id> | delivered <id>     contact reports
  track on|off | listen on|off  start or stop tracking / voice
  locate | alerts | zones | status | help | quit";

fn on_off(arg: &str) -> Result<bool, String> {
    match arg {
        "on" | "start" => Ok(true),
        "off" | "stop" => Ok(false),
        other => Err(format!("expected on|off, got {:?}", other)),
    }
}

fn required<'a>(cmd: &str, arg: &'a str) -> Result<&'a str, String> {
    if arg.is_empty() {
        Err(format!("{} needs an argument", cmd))
    } else {
        Ok(arg)
    }
}

impl ConsoleCommand {
    /// Parse one input line; `Ok(None)` for blank lines
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (cmd, arg) = match line.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (line, ""),
        };
        let command = match cmd.to_ascii_lowercase().as_str() {
            "press" => ConsoleCommand::Press,
            "release" => ConsoleCommand::Release,
            "hold" => {
                let ms: u64 = required(cmd, arg)?
                    .parse()
                    .map_err(|_| format!("invalid hold duration {:?}", arg))?;
                ConsoleCommand::Hold(Duration::from_millis(ms))
            }
            "say" => ConsoleCommand::Say(required(cmd, arg)?.to_string()),
            "final" => ConsoleCommand::Final(required(cmd, arg)?.to_string()),
            "ack" => ConsoleCommand::Ack(required(cmd, arg)?.to_string()),
            "delivered" => ConsoleCommand::Delivered(required(cmd, arg)?.to_string()),
            "track" => ConsoleCommand::Tracking(on_off(arg)?),
            "listen" => ConsoleCommand::Listening(on_off(arg)?),
            "locate" => ConsoleCommand::Locate,
            "alerts" => ConsoleCommand::Alerts,
            "zones" => ConsoleCommand::Zones,
            "status" => ConsoleCommand::Status,
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            other => return Err(format!("unknown command {:?}, try help", other)),
        };
        Ok(Some(command))
    }
}
