use thiserror::Error;

/// Commands the controller sends to the microcontroller.
///
/// Every command is a single LF-terminated ASCII line; [`HostCommand::encode`]
/// produces the line without the terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    EnableCoin,
    DisableCoin,
    /// Pay out `qty` coins of `denom` from the coin module.
    Dispense { denom: u32, qty: u32 },
    /// Route the bill currently held by the sorter into the bin for `denom`.
    Sort { denom: u32 },
}

impl HostCommand {
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::EnableCoin => "ENABLE_COIN".to_string(),
            Self::DisableCoin => "DISABLE_COIN".to_string(),
            Self::Dispense { denom, qty } => format!("DISPENSE:{denom}:{qty}"),
            Self::Sort { denom } => format!("SORT:{denom}"),
        }
    }

    /// The echo the firmware is expected to produce in its `ACK:` line.
    #[must_use]
    pub fn ack_echo(&self) -> String {
        self.encode()
    }
}

impl core::fmt::Display for HostCommand {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// One parsed line of inbound traffic from the microcontroller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McuMessage {
    /// A coin of `denom` was validated while the acceptor was enabled.
    Coin { denom: u32 },
    /// The sorter finished routing a bill.
    SortDone { denom: u32 },
    /// Command echo, e.g. `ACK:DISPENSE:5:3` carries `DISPENSE:5:3`.
    Ack { echo: String },
    /// The coin module finished a dispense command.
    DispenseDone { denom: u32, qty: u32 },
    /// Spontaneous firmware error report.
    Err { text: String },
    Ready,
    Homing,
    Ok,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A known tag carried a field that did not parse as a number.
    #[error("malformed field in line {line:?}")]
    MalformedField { line: String },
    /// The tag is not part of the protocol. Callers log and move on.
    #[error("unknown line {line:?}")]
    UnknownLine { line: String },
}

fn numeric_field(parts: &[&str], index: usize, line: &str) -> Result<u32, ParseError> {
    parts
        .get(index)
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .ok_or_else(|| ParseError::MalformedField {
            line: line.to_string(),
        })
}

/// Parses one line of microcontroller output.
///
/// Lines split on `:` with a case-insensitive leading tag. Unknown tags are
/// an error so the caller can log them, but they never carry payload the
/// protocol depends on.
pub fn parse_line(line: &str) -> Result<McuMessage, ParseError> {
    let line = line.trim();
    let parts: Vec<&str> = line.split(':').collect();
    let tag = parts[0].trim().to_ascii_uppercase();

    match tag.as_str() {
        "COIN" => Ok(McuMessage::Coin {
            denom: numeric_field(&parts, 1, line)?,
        }),
        "SORT_DONE" => Ok(McuMessage::SortDone {
            denom: numeric_field(&parts, 1, line)?,
        }),
        "ACK" => Ok(McuMessage::Ack {
            echo: parts[1..].join(":"),
        }),
        "DISPENSE_DONE" => Ok(McuMessage::DispenseDone {
            denom: numeric_field(&parts, 1, line)?,
            qty: numeric_field(&parts, 2, line)?,
        }),
        "ERR" => Ok(McuMessage::Err {
            text: parts[1..].join(":"),
        }),
        "READY" => Ok(McuMessage::Ready),
        "HOMING" => Ok(McuMessage::Homing),
        "OK" => Ok(McuMessage::Ok),
        _ => Err(ParseError::UnknownLine {
            line: line.to_string(),
        }),
    }
}

/// Textual verdict for a pending sort command.
///
/// The firmware signals success with any line containing `OK` and failure
/// with `Error` text or an `ERR` tag; everything else is unrelated traffic.
#[must_use]
pub fn sort_verdict(line: &str) -> Option<bool> {
    let upper = line.to_ascii_uppercase();
    if upper.contains("ERR") {
        Some(false)
    } else if upper.contains("OK") {
        Some(true)
    } else {
        None
    }
}
