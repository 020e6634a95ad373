//! # Operator Console
//!
//! Every node binary reads commands from stdin, one per line. Parsing is
//! separate from execution so the grammar can be tested without a node.
//!
//! ```text
//! pump         sell <c> <l> · dispense <c> <l> · status · queue
//! distributor  units · status <id> · price <c> <v> · prices
//!              ledger [id] · totals · report · tank <tank verb ...>
//! company      price <c> <v> [<c> <v> ...] · prices · push · distributors · reports
//! tank         REPONER <c> <l> · CONSULTAR <c> · ESTADO · EXTRAER <c> <l>
//! all          help · quit (salir)
//! ```

use std::io::Write;

use fuelnet_core::{Commodity, CoreError, Liters, Price, ValidationError};
use fuelnet_sync::{ProtocolError, WireMessage};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// =============================================================================
// Errors
// =============================================================================

/// A console line that could not be turned into a command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Unknown command: {0} (try `help`)")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type CommandResult<T> = Result<T, CommandError>;

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpCommand {
    /// Record a sale without the tank.
    Sell(Commodity, Liters),
    /// Draw from the tank and run a dispensing cycle.
    Dispense(Commodity, Liters),
    Status,
    Queue,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributorCommand {
    Units,
    UnitStatus(String),
    SetPrice(Commodity, Price),
    Prices,
    /// Ledger of every unit, or of one.
    Ledger(Option<String>),
    Totals,
    Report,
    /// Forwarded to the tank as-is.
    Tank(WireMessage),
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompanyCommand {
    SetPrice(Commodity, Price),
    /// Several prices in one edit.
    SetPrices(Vec<(Commodity, Price)>),
    Prices,
    Push,
    Distributors,
    Reports,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TankCommand {
    Request(WireMessage),
    Help,
    Quit,
}

pub const PUMP_HELP: &str = "\
sell <commodity> <liters>      record a sale
dispense <commodity> <liters>  draw from the tank and dispense
status                         totals and prices
queue                          sales waiting for the distributor
quit";

pub const DISTRIBUTOR_HELP: &str = "\
units                          connected pumps
status <unit>                  ask a pump for its totals
price <commodity> <price>      set a price and push it to every pump
prices                         current price table
ledger [unit]                  recorded sales
totals                         per-commodity totals
report                         send a digest to the company now
tank REPONER <c> <l> | CONSULTAR <c> | ESTADO
quit";

pub const COMPANY_HELP: &str = "\
price <commodity> <price> ...  set prices and push them to every distributor
prices                         current price table
push                           resend the whole table
distributors                   connected distributors
reports                        received reports
quit";

pub const TANK_HELP: &str = "\
REPONER <commodity> <liters>
EXTRAER <commodity> <liters>
CONSULTAR <commodity>
ESTADO
quit";

/// Splits a line into a lower-cased verb and its arguments.
fn split(line: &str) -> Option<(String, Vec<&str>)> {
    let mut words = line.split_whitespace();
    let verb = words.next()?.to_ascii_lowercase();
    Some((verb, words.collect()))
}

fn quantity_args(args: &[&str], usage: &'static str) -> CommandResult<(Commodity, Liters)> {
    let [commodity, liters] = args else {
        return Err(CommandError::Usage(usage));
    };
    Ok((commodity.parse()?, Liters::parse_positive("liters", liters)?))
}

fn price_args(args: &[&str], usage: &'static str) -> CommandResult<(Commodity, Price)> {
    let [commodity, price] = args else {
        return Err(CommandError::Usage(usage));
    };
    Ok((commodity.parse()?, Price::parse_non_negative("price", price)?))
}

fn is_quit(verb: &str) -> bool {
    matches!(verb, "quit" | "exit" | "salir")
}

/// Parses a pump console line. `None` for a blank line.
pub fn parse_pump(line: &str) -> CommandResult<Option<PumpCommand>> {
    let Some((verb, args)) = split(line) else {
        return Ok(None);
    };
    let command = match verb.as_str() {
        "sell" | "cargar" => {
            let (c, l) = quantity_args(&args, "sell <commodity> <liters>")?;
            PumpCommand::Sell(c, l)
        }
        "dispense" => {
            let (c, l) = quantity_args(&args, "dispense <commodity> <liters>")?;
            PumpCommand::Dispense(c, l)
        }
        "status" | "estado" | "precio" => PumpCommand::Status,
        "queue" => PumpCommand::Queue,
        "help" => PumpCommand::Help,
        v if is_quit(v) => PumpCommand::Quit,
        _ => return Err(CommandError::Unknown(verb)),
    };
    Ok(Some(command))
}

/// Parses a distributor console line. `None` for a blank line.
pub fn parse_distributor(line: &str) -> CommandResult<Option<DistributorCommand>> {
    let Some((verb, args)) = split(line) else {
        return Ok(None);
    };
    let command = match verb.as_str() {
        "units" => DistributorCommand::Units,
        "status" => match args.as_slice() {
            [unit] => DistributorCommand::UnitStatus(unit.to_string()),
            _ => return Err(CommandError::Usage("status <unit>")),
        },
        "price" => {
            let (c, p) = price_args(&args, "price <commodity> <price>")?;
            DistributorCommand::SetPrice(c, p)
        }
        "prices" => DistributorCommand::Prices,
        "ledger" => match args.as_slice() {
            [] => DistributorCommand::Ledger(None),
            [unit] => DistributorCommand::Ledger(Some(unit.to_string())),
            _ => return Err(CommandError::Usage("ledger [unit]")),
        },
        "totals" => DistributorCommand::Totals,
        "report" => DistributorCommand::Report,
        "tank" => {
            let request = tank_request(&args.join(" "))?
                .ok_or(CommandError::Usage("tank REPONER <c> <l> | CONSULTAR <c> | ESTADO"))?;
            DistributorCommand::Tank(request)
        }
        "help" => DistributorCommand::Help,
        v if is_quit(v) => DistributorCommand::Quit,
        _ => return Err(CommandError::Unknown(verb)),
    };
    Ok(Some(command))
}

/// Parses a company console line. `None` for a blank line.
pub fn parse_company(line: &str) -> CommandResult<Option<CompanyCommand>> {
    let Some((verb, args)) = split(line) else {
        return Ok(None);
    };
    let command = match verb.as_str() {
        "price" | "precio" => {
            const USAGE: &str = "price <commodity> <price> [<commodity> <price> ...]";
            if args.is_empty() || args.len() % 2 != 0 {
                return Err(CommandError::Usage(USAGE));
            }
            let mut pairs = args
                .chunks(2)
                .map(|pair| price_args(pair, USAGE))
                .collect::<CommandResult<Vec<_>>>()?;
            match pairs.len() {
                1 => {
                    let (c, p) = pairs.remove(0);
                    CompanyCommand::SetPrice(c, p)
                }
                _ => CompanyCommand::SetPrices(pairs),
            }
        }
        "prices" => CompanyCommand::Prices,
        "push" => CompanyCommand::Push,
        "distributors" => CompanyCommand::Distributors,
        "reports" => CompanyCommand::Reports,
        "help" => CompanyCommand::Help,
        v if is_quit(v) => CompanyCommand::Quit,
        _ => return Err(CommandError::Unknown(verb)),
    };
    Ok(Some(command))
}

/// Parses a tank console line. The tank speaks its wire verbs locally.
pub fn parse_tank(line: &str) -> CommandResult<Option<TankCommand>> {
    let Some((verb, _)) = split(line) else {
        return Ok(None);
    };
    if verb == "help" {
        return Ok(Some(TankCommand::Help));
    }
    if is_quit(&verb) {
        return Ok(Some(TankCommand::Quit));
    }
    Ok(tank_request(line)?.map(TankCommand::Request))
}

/// Decodes a tank verb line, refusing anything the tank does not serve.
fn tank_request(line: &str) -> CommandResult<Option<WireMessage>> {
    match WireMessage::decode(line)? {
        None => Ok(None),
        Some(
            m @ (WireMessage::Extract { .. }
            | WireMessage::Replenish { .. }
            | WireMessage::LevelQuery { .. }
            | WireMessage::TankStatus),
        ) => Ok(Some(m)),
        Some(other) => Err(CommandError::Unknown(other.kind().to_string())),
    }
}

// =============================================================================
// Console Reader
// =============================================================================

/// Line reader over stdin that stops on shutdown.
pub struct Console {
    lines: Lines<BufReader<Stdin>>,
    prompt: String,
}

impl Console {
    pub fn stdin(prompt: impl Into<String>) -> Self {
        Console {
            lines: BufReader::new(tokio::io::stdin()).lines(),
            prompt: prompt.into(),
        }
    }

    /// Next line typed by the operator; `None` once shutdown is requested.
    pub async fn next_line(&mut self, shutdown: &CancellationToken) -> Option<String> {
        print!("{}> ", self.prompt);
        let _ = std::io::stdout().flush();
        tokio::select! {
            _ = shutdown.cancelled() => None,
            line = self.lines.next_line() => match line {
                Ok(Some(line)) => Some(line),
                Ok(None) => {
                    // Detached from a terminal: keep serving until signalled.
                    debug!("Console input closed");
                    shutdown.cancelled().await;
                    None
                }
                Err(e) => {
                    warn!(?e, "Console input failed");
                    shutdown.cancelled().await;
                    None
                }
            },
        }
    }
}
