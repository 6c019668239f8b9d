//! Interactive commands read from stdin while a station runs

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Switch capture device; `None` selects the system default
    Source(Option<String>),
    Status,
    Devices,
    Help,
    Leave,
    Empty,
    Unknown(String),
}

pub fn parse(line: &str) -> Input {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    match word {
        "" => Input::Empty,
        "source" if rest.is_empty() => Input::Unknown("source needs a device name".into()),
        "source" if rest == "default" => Input::Source(None),
        "source" => Input::Source(Some(rest.to_string())),
        "status" => Input::Status,
        "devices" => Input::Devices,
        "help" | "?" => Input::Help,
        "leave" | "quit" | "exit" => Input::Leave,
        other => Input::Unknown(format!("unknown command '{}'", other)),
    }
}

pub const HELP: &str = "\
Commands:
  source <device>   switch the audio input (\"default\" for the system default)
  devices           list audio input devices
  status            show station status
  leave | quit      leave the station and exit";
